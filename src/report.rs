// 📊 Report Artifacts - issues.csv, summary.json, report.md, reply_email.txt

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::loader::LoadedTable;
use crate::rules::{FollowUpQuestion, Issue, Severity};
use crate::storage;

pub const ISSUES_FILENAME: &str = "issues.csv";
pub const SUMMARY_FILENAME: &str = "summary.json";
pub const REPORT_FILENAME: &str = "report.md";
pub const REPLY_EMAIL_FILENAME: &str = "reply_email.txt";
pub const CORRECTED_INVOICES_FILENAME: &str = "corrected_invoices.csv";

const ISSUE_COLUMNS: &[&str] = &["issue_id", "subject_id", "severity", "rule", "details", "suggested_fix"];
const TOP_ISSUES: usize = 5;
const MAX_APPLIED_NOTES: usize = 10;
const MAX_SECTION_ITEMS: usize = 20;
const MAX_TABLE_ROWS: usize = 20;
const MAX_EMAIL_QUESTIONS: usize = 5;

// ============================================================================
// ISSUES CSV
// ============================================================================

/// Header is always written, even with no issues.
pub fn write_issues_csv(path: &Path, issues: &[Issue]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    writer.write_record(ISSUE_COLUMNS)?;
    for issue in issues {
        writer.write_record([
            issue.issue_id.as_str(),
            issue.subject_id.as_str(),
            issue.severity.as_str(),
            issue.rule.as_str(),
            issue.details.as_str(),
            issue.suggested_fix.as_deref().unwrap_or(""),
        ])?;
    }
    writer.flush().with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

pub fn read_issues_csv(path: &Path) -> Result<Vec<Issue>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    reader
        .deserialize()
        .collect::<std::result::Result<Vec<Issue>, _>>()
        .with_context(|| format!("Failed to parse {}", path.display()))
}

// ============================================================================
// SUMMARY JSON
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopIssue {
    pub issue_id: String,
    pub details: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueSummary {
    pub counts_by_severity: BTreeMap<Severity, usize>,
    pub top_issues: Vec<TopIssue>,
}

impl IssueSummary {
    pub fn from_issues(issues: &[Issue]) -> Self {
        let mut counts_by_severity = BTreeMap::new();
        for issue in issues {
            *counts_by_severity.entry(issue.severity).or_insert(0) += 1;
        }
        IssueSummary {
            counts_by_severity,
            top_issues: issues
                .iter()
                .take(TOP_ISSUES)
                .map(|i| TopIssue {
                    issue_id: i.issue_id.clone(),
                    details: i.details.clone(),
                })
                .collect(),
        }
    }

    /// "HIGH=2 MEDIUM=1", most severe first.
    pub fn distribution(&self) -> String {
        self.counts_by_severity
            .iter()
            .rev()
            .map(|(severity, count)| format!("{}={}", severity.label(), count))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        storage::write_json(path, self).with_context(|| format!("Failed to write {}", path.display()))
    }
}

// ============================================================================
// REPORT
// ============================================================================

/// Rendered human-readable run report.
#[derive(Debug, Clone, Default)]
pub struct Report {
    pub title: String,
    pub summary: String,
    pub total_records: usize,
    pub issues: Vec<Issue>,
    pub applied_fixes: Vec<String>,
    /// Extra titled lists (heading, items)
    pub sections: Vec<(String, Vec<String>)>,
}

impl Report {
    pub fn new(title: impl Into<String>, summary: impl Into<String>, total_records: usize) -> Self {
        Report {
            title: title.into(),
            summary: summary.into(),
            total_records,
            ..Default::default()
        }
    }

    pub fn with_issues(mut self, issues: Vec<Issue>) -> Self {
        self.issues = issues;
        self
    }

    pub fn with_applied_fixes(mut self, notes: Vec<String>) -> Self {
        self.applied_fixes = notes;
        self
    }

    pub fn with_section(mut self, heading: impl Into<String>, items: Vec<String>) -> Self {
        self.sections.push((heading.into(), items));
        self
    }

    pub fn render(&self) -> String {
        let summary = IssueSummary::from_issues(&self.issues);
        let mut out = String::new();

        out.push_str(&format!("# {}\n\n## Executive summary\n\n", self.title));
        out.push_str(&format!("- Total records: {}\n", self.total_records));
        out.push_str(&format!("- Total issues: {}\n", self.issues.len()));
        if !self.issues.is_empty() {
            out.push_str(&format!("- Severity distribution: {}\n", summary.distribution()));
        }
        out.push_str(&format!("\n{}\n", self.summary));

        if !summary.top_issues.is_empty() {
            out.push_str(&format!("\n## Top {} issues\n\n", TOP_ISSUES));
            for top in &summary.top_issues {
                out.push_str(&format!("- {}: {}\n", top.issue_id, top.details));
            }
        }

        if !self.applied_fixes.is_empty() {
            out.push_str("\n## Applied fixes\n\n");
            for note in self.applied_fixes.iter().take(MAX_APPLIED_NOTES) {
                out.push_str(&format!("- {}\n", note));
            }
        }

        for (heading, items) in self.sections.iter().filter(|(_, items)| !items.is_empty()) {
            out.push_str(&format!("\n## {}\n\n", heading));
            for item in items.iter().take(MAX_SECTION_ITEMS) {
                out.push_str(&format!("- {}\n", item));
            }
        }

        if !self.issues.is_empty() {
            out.push_str("\n## Issues\n\n| Issue | Subject | Severity | Rule |\n|---|---|---|---|\n");
            for issue in self.issues.iter().take(MAX_TABLE_ROWS) {
                out.push_str(&format!(
                    "| {} | {} | {} | {} |\n",
                    issue.issue_id, issue.subject_id, issue.severity, issue.rule
                ));
            }
        }

        out
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        fs::write(path, self.render()).with_context(|| format!("Failed to write {}", path.display()))
    }
}

// ============================================================================
// TICKET REPLY
// ============================================================================

/// Plain reply asking for the first few missing details.
pub fn draft_reply_email(questions: &[FollowUpQuestion]) -> String {
    let mut lines = vec![
        "Hello,".to_string(),
        String::new(),
        "We reviewed your request and need a few more details:".to_string(),
    ];
    for question in questions.iter().take(MAX_EMAIL_QUESTIONS) {
        lines.push(format!("- Ticket {}: {}", question.subject_id, question.question));
    }
    lines.extend([
        String::new(),
        "Thank you,".to_string(),
        "Support Team".to_string(),
    ]);
    lines.join("\n")
}

// ============================================================================
// CORRECTED DATA
// ============================================================================

/// Write a loaded table back out under its expected column names.
pub fn write_table_csv(path: &Path, table: &LoadedTable) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    writer.write_record(&table.columns)?;
    for row in &table.rows {
        writer.write_record(row.iter().map(|cell| cell.to_string()))?;
    }
    writer.flush().with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================
