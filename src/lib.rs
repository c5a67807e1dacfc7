// Reconciliation Audit - Core Library
// Exposes all modules for use in the CLI and tests

pub mod schema;   // Schema Registry - tables, columns, semantic types
pub mod mapping;  // Column Mapper - tolerant header matching
pub mod loader;   // Table Loader - typed, windowed CSV reads
pub mod rules;    // Reconciliation Rules - tickets and e-documents
pub mod checks;   // Rule Sets - ordered checks recorded as steps
pub mod audit;    // Audit Trail - append-only run ledger
pub mod storage;  // Run Store - layout, index, atomic JSON
pub mod assist;   // Text Assist - categorize + draft polish
pub mod report;   // Artifacts - issues.csv, summary.json, report.md
pub mod engine;   // Run Orchestrator
pub mod config;   // Settings
pub mod error;    // Error taxonomy

// Re-export commonly used types
pub use schema::{DocumentType, InputSchema, SemanticType, TableKind};
pub use mapping::{auto_map, AutoMapping, ColumnMapping};
pub use loader::{
    load, load_typed, Cell, LoadedTable, SchemaRow,
    DeliveryNoteRow, InvoiceRow, PurchaseOrderRow, TicketRow,
};
pub use rules::{FixRecommendation, FollowUpQuestion, Issue, Recommendation, Severity};
pub use checks::{InputFiles, RuleSet, Rules, TableMappings};
pub use audit::{ArtifactRecord, AuditTrail, InputFileRecord, RunAudit, StepRecord, StepStatus};
pub use storage::{RunIndexEntry, RunStore};
pub use assist::{HeuristicAssist, TextAssist};
pub use engine::{ApprovalOutcome, Engine, RunResult};
pub use config::{LoadLimits, Settings};
pub use error::{AuditError, EngineError, LoadError, SchemaError, TypeViolation};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
