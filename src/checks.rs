// 🧭 Rule Sets - Sequencing rules into audit steps
// Two closed rule sets behind one {analyze, apply} interface. Each check runs
// in a fixed order, is timed, and becomes exactly one appended StepRecord.

use anyhow::{anyhow, Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::assist::TextAssist;
use crate::audit::{ArtifactRecord, AuditTrail, StepRecord};
use crate::config::LoadLimits;
use crate::loader::{self, DeliveryNoteRow, InvoiceRow, LoadedTable, PurchaseOrderRow, SchemaRow, TicketRow};
use crate::mapping::ColumnMapping;
use crate::report::{self, IssueSummary, Report};
use crate::rules::edocument as edoc;
use crate::rules::ticket;
use crate::rules::{FixRecommendation, Issue, Recommendation, Severity};
use crate::schema::{DocumentType, TableKind, ALLOWED_VAT_RATES_INPUT, VENDORS_INPUT};

/// input name -> file path
pub type InputFiles = BTreeMap<String, PathBuf>;

/// table name -> column mapping
pub type TableMappings = BTreeMap<String, ColumnMapping>;

// ============================================================================
// CONTEXT
// ============================================================================

/// Everything a rule set may touch during one run.
pub struct RunContext<'a> {
    pub run_id: &'a str,
    pub inputs: &'a InputFiles,
    pub mappings: &'a TableMappings,
    pub limits: LoadLimits,
    pub assist: &'a dyn TextAssist,
    pub run_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    audit: &'a AuditTrail,
}

impl<'a> RunContext<'a> {
    pub fn new(
        run_id: &'a str,
        inputs: &'a InputFiles,
        mappings: &'a TableMappings,
        limits: LoadLimits,
        assist: &'a dyn TextAssist,
        audit: &'a AuditTrail,
    ) -> Self {
        let run_dir = audit.store().run_dir(run_id);
        let artifacts_dir = audit.store().artifacts_dir(run_id);
        RunContext {
            run_id,
            inputs,
            mappings,
            limits,
            assist,
            run_dir,
            artifacts_dir,
            audit,
        }
    }

    pub fn input(&self, name: &str) -> Result<&Path> {
        self.inputs
            .get(name)
            .map(PathBuf::as_path)
            .ok_or_else(|| anyhow!("input '{}' was not supplied", name))
    }

    pub fn mapping(&self, table: TableKind) -> ColumnMapping {
        self.mappings.get(table.name()).cloned().unwrap_or_default()
    }

    pub fn load_table(&self, table: TableKind) -> Result<LoadedTable> {
        let path = self.input(table.name())?;
        loader::load(path, table.schema(), &self.mapping(table), self.limits)
            .with_context(|| format!("Failed to load {}", table.name()))
    }

    pub fn load_rows<R: SchemaRow>(&self) -> Result<Vec<R>> {
        let path = self.input(R::TABLE.name())?;
        loader::load_typed(path, &self.mapping(R::TABLE), self.limits)
            .with_context(|| format!("Failed to load {}", R::TABLE.name()))
    }

    pub fn artifact_path(&self, file_name: &str) -> PathBuf {
        self.artifacts_dir.join(file_name)
    }

    /// Run one check, time it, and append its verdict as a step.
    ///
    /// An error from `check` propagates without appending anything; the
    /// orchestrator records the failure.
    pub fn record<T>(
        &self,
        title: &str,
        action: &str,
        check: impl FnOnce() -> Result<(T, Verdict)>,
    ) -> Result<T> {
        let started = Instant::now();
        let (value, verdict) = check()?;
        let elapsed = started.elapsed();

        tracing::debug!(run_id = self.run_id, action, ?elapsed, "check finished");

        let step = StepRecord::new(title, action, verdict.decision)
            .with_severity(verdict.severity)
            .with_evidence(verdict.evidence)
            .requiring_approval(verdict.requires_approval)
            .with_duration(elapsed);
        self.audit.append_step(self.run_id, step)?;
        Ok(value)
    }
}

/// How one check's findings read in the ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub severity: Severity,
    pub evidence: Vec<String>,
    pub decision: String,
    pub requires_approval: bool,
}

impl Verdict {
    pub fn info(decision: impl Into<String>, evidence: Vec<String>) -> Self {
        Verdict {
            severity: Severity::Info,
            evidence,
            decision: decision.into(),
            requires_approval: false,
        }
    }

    /// `severity` + `found` when there are issues, info + `clean` otherwise.
    pub fn from_issues(issues: &[Issue], severity: Severity, found: &str, clean: &str) -> Self {
        if issues.is_empty() {
            Verdict::info(clean, Vec::new())
        } else {
            Verdict {
                severity,
                evidence: issues.iter().map(|i| i.details.clone()).collect(),
                decision: found.to_string(),
                requires_approval: false,
            }
        }
    }

    /// Gate behind approval when there is something to correct.
    pub fn gated_by(mut self, fixes: &[FixRecommendation]) -> Self {
        self.requires_approval = !fixes.is_empty();
        self
    }
}

// ============================================================================
// RULE SET INTERFACE
// ============================================================================

/// What analysis produced.
#[derive(Debug, Clone, Default)]
pub struct Analysis {
    pub summary: String,
    pub record_count: usize,
    pub issues: Vec<Issue>,
    pub recommendations: Vec<Recommendation>,
    pub artifacts: Vec<ArtifactRecord>,
}

/// What an approved apply produced.
#[derive(Debug, Clone, Default)]
pub struct Applied {
    pub artifacts: Vec<ArtifactRecord>,
    pub notes: Vec<String>,
}

pub trait RuleSet {
    fn document_type(&self) -> DocumentType;

    /// Run every check in order, appending one step per check.
    fn analyze(&self, ctx: &RunContext<'_>) -> Result<Analysis>;

    /// Write recorded, reviewed fixes. Never re-runs analysis rules.
    fn apply(&self, ctx: &RunContext<'_>, recommendations: &[Recommendation]) -> Result<Applied>;
}

/// The fixed catalogue, selected by document type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rules {
    Ticket(TicketRules),
    EDocument(EDocumentRules),
}

impl Rules {
    pub fn for_type(document_type: DocumentType) -> Self {
        match document_type {
            DocumentType::Ticket => Rules::Ticket(TicketRules),
            DocumentType::EDocument => Rules::EDocument(EDocumentRules),
        }
    }
}

impl RuleSet for Rules {
    fn document_type(&self) -> DocumentType {
        match self {
            Rules::Ticket(rules) => rules.document_type(),
            Rules::EDocument(rules) => rules.document_type(),
        }
    }

    fn analyze(&self, ctx: &RunContext<'_>) -> Result<Analysis> {
        match self {
            Rules::Ticket(rules) => rules.analyze(ctx),
            Rules::EDocument(rules) => rules.analyze(ctx),
        }
    }

    fn apply(&self, ctx: &RunContext<'_>, recommendations: &[Recommendation]) -> Result<Applied> {
        match self {
            Rules::Ticket(rules) => rules.apply(ctx, recommendations),
            Rules::EDocument(rules) => rules.apply(ctx, recommendations),
        }
    }
}

/// issues.csv + summary.json, shared by both rule sets.
fn write_issue_artifacts(ctx: &RunContext<'_>, issues: &[Issue]) -> Result<Vec<ArtifactRecord>> {
    let issues_path = ctx.artifact_path(report::ISSUES_FILENAME);
    report::write_issues_csv(&issues_path, issues)?;

    let summary_path = ctx.artifact_path(report::SUMMARY_FILENAME);
    IssueSummary::from_issues(issues).write(&summary_path)?;

    Ok(vec![
        ArtifactRecord::new("csv", &issues_path),
        ArtifactRecord::new("json", &summary_path),
    ])
}

// ============================================================================
// E-DOCUMENT RULES
// ============================================================================

const EDOC_REPORT_TITLE: &str = "E-Document Audit Report";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EDocumentRules;

impl EDocumentRules {
    fn summary(invoice_count: usize, issue_count: usize) -> String {
        format!("Invoices: {}. Issues: {}.", invoice_count, issue_count)
    }
}

impl RuleSet for EDocumentRules {
    fn document_type(&self) -> DocumentType {
        DocumentType::EDocument
    }

    fn analyze(&self, ctx: &RunContext<'_>) -> Result<Analysis> {
        let mut issues: Vec<Issue> = Vec::new();
        let mut fixes: Vec<FixRecommendation> = Vec::new();

        let (invoices, purchase_orders, delivery_notes) = ctx.record("Inputs loaded", "LOAD_INPUTS", || {
            let invoices: Vec<InvoiceRow> = ctx.load_rows()?;
            let purchase_orders: Vec<PurchaseOrderRow> = ctx.load_rows()?;
            let delivery_notes: Vec<DeliveryNoteRow> = ctx.load_rows()?;
            let verdict = Verdict::info(
                "Inputs loaded successfully",
                vec![
                    format!("invoices={}", invoices.len()),
                    format!("purchase_orders={}", purchase_orders.len()),
                    format!("delivery_notes={}", delivery_notes.len()),
                ],
            );
            Ok(((invoices, purchase_orders, delivery_notes), verdict))
        })?;

        let found = ctx.record("Duplicate invoice check", "DUPLICATE_CHECK", || {
            let found = edoc::find_duplicate_invoices(&invoices);
            let verdict = Verdict::from_issues(&found, Severity::High, "Duplicates found", "No duplicates");
            Ok((found, verdict))
        })?;
        issues.extend(found);

        let (found, found_fixes) = ctx.record("Total check", "TOTAL_CHECK", || {
            let (found, found_fixes) = edoc::find_total_mismatch(&invoices);
            let verdict = Verdict::from_issues(&found, Severity::Medium, "Total mismatch found", "Totals are correct")
                .gated_by(&found_fixes);
            Ok(((found, found_fixes), verdict))
        })?;
        issues.extend(found);
        fixes.extend(found_fixes);

        let (found, found_fixes) = ctx.record("VAT check", "VAT_CHECK", || {
            let (found, found_fixes) = edoc::find_vat_mismatch(&invoices);
            let verdict = Verdict::from_issues(&found, Severity::Medium, "VAT mismatch found", "VAT is correct")
                .gated_by(&found_fixes);
            Ok(((found, found_fixes), verdict))
        })?;
        issues.extend(found);
        fixes.extend(found_fixes);

        let found = ctx.record("PO/DN existence check", "LINK_CHECK", || {
            let found = edoc::find_missing_references(&invoices, &purchase_orders, &delivery_notes);
            let verdict = Verdict::from_issues(&found, Severity::High, "Missing references found", "References complete");
            Ok((found, verdict))
        })?;
        issues.extend(found);

        let found = ctx.record("Three-way match", "THREE_WAY_MATCH", || {
            let found = edoc::find_three_way_mismatch(&invoices, &purchase_orders, &delivery_notes);
            let verdict = Verdict::from_issues(
                &found,
                Severity::Medium,
                "Three-way mismatch found",
                "Three-way match complete",
            );
            Ok((found, verdict))
        })?;
        issues.extend(found);

        if let Some(path) = ctx.inputs.get(VENDORS_INPUT) {
            let found = ctx.record("Vendor validation", "VENDOR_CHECK", || {
                let allowed = loader::load_vendor_list(path).context("Failed to load vendor list")?;
                let found = edoc::find_unapproved_vendors(&invoices, &allowed);
                let verdict = Verdict::from_issues(&found, Severity::High, "Unapproved vendor found", "Vendors verified");
                Ok((found, verdict))
            })?;
            issues.extend(found);
        }

        if let Some(path) = ctx.inputs.get(ALLOWED_VAT_RATES_INPUT) {
            let found = ctx.record("VAT rate validation", "VAT_RATE_CHECK", || {
                let allowed = loader::load_vat_rates(path).context("Failed to load allowed VAT rates")?;
                let found = edoc::find_disallowed_vat_rates(&invoices, &allowed);
                let verdict = Verdict::from_issues(
                    &found,
                    Severity::Medium,
                    "Disallowed VAT rate found",
                    "VAT rates verified",
                );
                Ok((found, verdict))
            })?;
            issues.extend(found);
        }

        let summary = Self::summary(invoices.len(), issues.len());
        let mut artifacts = write_issue_artifacts(ctx, &issues)?;

        let report_path = ctx.artifact_path(report::REPORT_FILENAME);
        Report::new(EDOC_REPORT_TITLE, summary.clone(), invoices.len())
            .with_issues(issues.clone())
            .write(&report_path)?;
        artifacts.insert(0, ArtifactRecord::new("report", &report_path));

        Ok(Analysis {
            summary,
            record_count: invoices.len(),
            issues,
            recommendations: fixes.into_iter().map(Recommendation::Fix).collect(),
            artifacts,
        })
    }

    fn apply(&self, ctx: &RunContext<'_>, recommendations: &[Recommendation]) -> Result<Applied> {
        let fixes: Vec<FixRecommendation> = recommendations
            .iter()
            .filter_map(Recommendation::as_fix)
            .cloned()
            .collect();
        if fixes.is_empty() {
            return Ok(Applied::default());
        }

        let mut invoices = ctx.load_table(TableKind::Invoices)?;
        let applied = edoc::apply_fixes(&mut invoices, &fixes);
        for skipped in &applied.skipped {
            tracing::warn!(
                run_id = ctx.run_id,
                "skipping fix for {}: field '{}' is not correctable",
                skipped.subject_id,
                skipped.field
            );
        }

        let corrected_path = ctx.artifact_path(report::CORRECTED_INVOICES_FILENAME);
        report::write_table_csv(&corrected_path, &invoices)?;

        let issues_path = ctx.artifact_path(report::ISSUES_FILENAME);
        if issues_path.exists() {
            let issues = report::read_issues_csv(&issues_path)?;
            Report::new(
                EDOC_REPORT_TITLE,
                Self::summary(invoices.len(), issues.len()),
                invoices.len(),
            )
            .with_issues(issues)
            .with_applied_fixes(applied.notes.clone())
            .write(&ctx.artifact_path(report::REPORT_FILENAME))?;
        }

        Ok(Applied {
            artifacts: vec![ArtifactRecord::new("csv", &corrected_path)],
            notes: applied.notes,
        })
    }
}

// ============================================================================
// TICKET RULES
// ============================================================================

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TicketRules;

impl RuleSet for TicketRules {
    fn document_type(&self) -> DocumentType {
        DocumentType::Ticket
    }

    fn analyze(&self, ctx: &RunContext<'_>) -> Result<Analysis> {
        let mut issues: Vec<Issue> = Vec::new();

        let tickets: Vec<TicketRow> = ctx.record("Tickets loaded", "LOAD_TICKETS", || {
            let tickets: Vec<TicketRow> = ctx.load_rows()?;
            let verdict = Verdict::info("Tickets loaded successfully", vec![format!("rows={}", tickets.len())]);
            Ok((tickets, verdict))
        })?;

        let found = ctx.record("Duplicate ticket check", "DUPLICATE_CHECK", || {
            let found = ticket::find_duplicate_tickets(&tickets);
            let verdict = Verdict::from_issues(&found, Severity::High, "Duplicates found", "No duplicates");
            Ok((found, verdict))
        })?;
        issues.extend(found);

        let predictions = ctx.record("Category prediction", "CATEGORIZE", || {
            let predictions: Vec<(String, String)> = tickets
                .iter()
                .filter(|t| t.category.is_none())
                .map(|t| (t.ticket_id.clone(), ctx.assist.categorize(&t.customer_text)))
                .collect();

            let mut per_label: BTreeMap<&str, usize> = BTreeMap::new();
            for (_, label) in &predictions {
                *per_label.entry(label.as_str()).or_insert(0) += 1;
            }
            let mut evidence = vec![format!("predicted_missing={}", predictions.len())];
            evidence.extend(per_label.iter().map(|(label, count)| format!("{}={}", label, count)));

            Ok((predictions, Verdict::info("Category suggestions added", evidence)))
        })?;

        let questions = ctx.record("Missing information check", "MISSING_INFO", || {
            let (found, questions) = ticket::find_missing_info(&tickets);
            let verdict = Verdict::from_issues(
                &found,
                Severity::Medium,
                "Missing information detected",
                "No missing information",
            );
            Ok(((found, questions), verdict))
        })
        .map(|(found, questions)| {
            issues.extend(found);
            questions
        })?;
        let missing_evidence: Vec<String> = issues
            .iter()
            .filter(|i| i.rule == ticket::MISSING_INFO)
            .map(|i| i.details.clone())
            .collect();

        let priorities = ctx.record("Priority score", "PRIORITY_SCORE", || {
            let (summary, found) = ticket::score_priorities(&tickets);
            let evidence = if summary.high_priority_ids.is_empty() {
                Vec::new()
            } else {
                vec![format!("high_priority={}", summary.high_priority_ids.join(","))]
            };
            let verdict = Verdict {
                severity: if summary.high == 0 { Severity::Low } else { Severity::Medium },
                evidence,
                decision: summary.decision(),
                requires_approval: false,
            };
            Ok(((summary, found), verdict))
        })
        .map(|(summary, found)| {
            issues.extend(found);
            summary
        })?;

        let summary = format!(
            "Tickets reviewed: {}. Missing info: {}. High priority: {}.",
            tickets.len(),
            questions.len(),
            priorities.high
        );

        let mut artifacts = write_issue_artifacts(ctx, &issues)?;

        let report_path = ctx.artifact_path(report::REPORT_FILENAME);
        Report::new("Ticket Review Report", summary.clone(), tickets.len())
            .with_issues(issues.clone())
            .with_section("Priority", vec![priorities.decision()])
            .with_section("Missing information", missing_evidence)
            .with_section(
                "Predicted categories",
                predictions.iter().map(|(id, label)| format!("{}: {}", id, label)).collect(),
            )
            .write(&report_path)?;
        artifacts.insert(0, ArtifactRecord::new("report", &report_path));

        let email_path = ctx.artifact_path(report::REPLY_EMAIL_FILENAME);
        let email = ctx.assist.improve_draft(&report::draft_reply_email(&questions));
        std::fs::write(&email_path, email)
            .with_context(|| format!("Failed to write {}", email_path.display()))?;
        artifacts.push(ArtifactRecord::new("email", &email_path));

        Ok(Analysis {
            summary,
            record_count: tickets.len(),
            issues,
            recommendations: questions.into_iter().map(Recommendation::FollowUp).collect(),
            artifacts,
        })
    }

    /// Follow-up questions need a human answer; nothing to write.
    fn apply(&self, _ctx: &RunContext<'_>, _recommendations: &[Recommendation]) -> Result<Applied> {
        Ok(Applied::default())
    }
}

// ============================================================================
// TESTS
// ============================================================================
