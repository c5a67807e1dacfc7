// 🧮 Reconciliation Rules - Fixed, compiled-in checks
// Every rule is a pure function over loaded rows returning findings.
// Rules never mutate their inputs and never call each other.

pub mod edocument;
pub mod ticket;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Absolute tolerance for money comparisons.
pub const TOLERANCE: f64 = 0.01;

// ============================================================================
// SEVERITY
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// FINDINGS
// ============================================================================

/// A single detected inconsistency. Never mutated once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub issue_id: String,
    /// Invoice or ticket the issue is about
    pub subject_id: String,
    pub severity: Severity,
    pub rule: String,
    pub details: String,
    pub suggested_fix: Option<String>,
}

impl Issue {
    pub fn new(
        issue_id: impl Into<String>,
        subject_id: impl Into<String>,
        severity: Severity,
        rule: &str,
        details: impl Into<String>,
    ) -> Self {
        Issue {
            issue_id: issue_id.into(),
            subject_id: subject_id.into(),
            severity,
            rule: rule.to_string(),
            details: details.into(),
            suggested_fix: None,
        }
    }

    pub fn with_suggested_fix(mut self, fix: impl Into<String>) -> Self {
        self.suggested_fix = Some(fix.into());
        self
    }
}

/// Deterministic, reviewable correction. Consumed once by the apply phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixRecommendation {
    pub subject_id: String,
    pub field: String,
    pub suggested_value: f64,
    pub reason: String,
}

/// Information only the customer can supply; asked, never auto-filled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowUpQuestion {
    pub subject_id: String,
    pub missing: Vec<String>,
    pub question: String,
}

/// One entry of recommendations.json.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Recommendation {
    Fix(FixRecommendation),
    FollowUp(FollowUpQuestion),
}

impl Recommendation {
    pub fn as_fix(&self) -> Option<&FixRecommendation> {
        match self {
            Recommendation::Fix(fix) => Some(fix),
            Recommendation::FollowUp(_) => None,
        }
    }
}

// ============================================================================
// HELPERS
// ============================================================================

/// Round half away from zero to cents.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

/// Blank identifiers are reported under a readable placeholder.
pub fn display_id(value: &str) -> String {
    if value.trim().is_empty() {
        "(empty)".to_string()
    } else {
        value.to_string()
    }
}

/// Shortest text for a number: 118 stays "118", 118.5 stays "118.5".
pub fn format_amount(value: f64) -> String {
    format!("{}", value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_serialization() {
        assert_eq!(serde_json::to_string(&Severity::Medium).unwrap(), "\"medium\"");
        assert!(Severity::High > Severity::Low);
    }

    #[test]
    fn test_recommendation_untagged_round_trip() {
        let json = r#"[
            {"subject_id": "INV-1", "field": "total", "suggested_value": 118.0, "reason": "subtotal + vat_amount"},
            {"subject_id": "T1", "missing": ["amount"], "question": "Please share: amount"}
        ]"#;
        let parsed: Vec<Recommendation> = serde_json::from_str(json).unwrap();

        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].as_fix().map(|f| f.field.as_str()), Some("total"));
        assert!(parsed[1].as_fix().is_none());
    }

    #[test]
    fn test_rounding() {
        assert_eq!(round2(118.004), 118.0);
        assert_eq!(round2(0.125 * 100.0), 12.5);
        assert_eq!(round4(0.18000001), 0.18);
    }

    #[test]
    fn test_display_id_names_blank_values() {
        assert_eq!(display_id("INV-1"), "INV-1");
        assert_eq!(display_id(""), "(empty)");
        assert_eq!(display_id("   "), "(empty)");
    }
}
