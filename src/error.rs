// 🚨 Error Taxonomy
// Every error is user-facing text; the audit trail keeps the durable record.

use std::path::PathBuf;

use thiserror::Error;

use crate::schema::SemanticType;

// ============================================================================
// SCHEMA ERRORS
// ============================================================================

/// One column whose non-empty values could not be coerced to its declared type.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeViolation {
    pub column: String,
    pub expected: SemanticType,
    /// 1-based data row (header excluded) of the first offending value
    pub first_row: usize,
    pub first_value: String,
}

impl std::fmt::Display for TypeViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "column '{}' expected {} (row {}: '{}')",
            self.column,
            self.expected.name(),
            self.first_row,
            self.first_value
        )
    }
}

/// Raised by the loader. Always lists every offending column, never just the first.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchemaError {
    #[error("{table}: missing required column(s): {}", .columns.join(", "))]
    MissingColumns { table: String, columns: Vec<String> },

    #[error("{table}: invalid values: {}", join_violations(.violations))]
    InvalidTypes {
        table: String,
        violations: Vec<TypeViolation>,
    },
}

impl SchemaError {
    /// Names of every column this error is about, in schema order.
    pub fn columns(&self) -> Vec<&str> {
        match self {
            SchemaError::MissingColumns { columns, .. } => {
                columns.iter().map(String::as_str).collect()
            }
            SchemaError::InvalidTypes { violations, .. } => {
                violations.iter().map(|v| v.column.as_str()).collect()
            }
        }
    }
}

fn join_violations(violations: &[TypeViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("failed to read CSV {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

// ============================================================================
// AUDIT ERRORS
// ============================================================================

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("run already exists: {0} (start a new run id instead)")]
    RunExists(String),

    #[error("run {0} is finalized; steps can no longer be appended")]
    RunFinalized(String),

    #[error("invalid run id '{0}': only letters, digits, '-' and '_' are allowed")]
    InvalidRunId(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

// ============================================================================
// ENGINE ERRORS
// ============================================================================

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown document type: {0}")]
    UnknownDocumentType(String),

    #[error("missing input '{input}' for document type '{document_type}'")]
    MissingInput {
        document_type: String,
        input: String,
    },

    #[error("input '{name}' ({path}) changed since analysis; refusing to apply fixes")]
    InputChanged { name: String, path: PathBuf },

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Audit(#[from] AuditError),

    #[error("rule execution failed: {0:#}")]
    RuleExecution(anyhow::Error),
}

impl EngineError {
    /// Classify an error that escaped a check.
    pub fn from_check(err: anyhow::Error) -> Self {
        if let Some(schema) = err.downcast_ref::<SchemaError>() {
            return EngineError::Schema(schema.clone());
        }
        if let Some(LoadError::Schema(schema)) = err.downcast_ref::<LoadError>() {
            return EngineError::Schema(schema.clone());
        }
        match err.downcast::<AuditError>() {
            Ok(audit) => EngineError::Audit(audit),
            Err(other) => EngineError::RuleExecution(other),
        }
    }
}
