// ⚙️ Run Orchestrator - create → analyze → finalize, and approve → apply
// Every run is recorded: a check that fails still leaves a finalized audit
// with a `failed` step before the error reaches the caller.

use std::path::PathBuf;
use std::sync::Arc;

use uuid::Uuid;

use crate::assist::{self, HeuristicAssist, TextAssist};
use crate::audit::{ArtifactRecord, AuditTrail, InputFileRecord, RunAudit, StepRecord, StepStatus};
use crate::checks::{InputFiles, RuleSet, Rules, RunContext, TableMappings};
use crate::config::{LoadLimits, Settings};
use crate::error::EngineError;
use crate::loader;
use crate::mapping::auto_map;
use crate::rules::{Recommendation, Severity};
use crate::schema::DocumentType;
use crate::storage::{self, KeyedLocks, RunStore};

/// Summary used when an approved run had no summary of its own.
const APPLIED_SUMMARY: &str = "Fixes applied.";

/// Outcome of a successful run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunResult {
    pub run_id: String,
    pub summary: String,
    pub artifacts: Vec<ArtifactRecord>,
}

/// Outcome of an approval. Empty when there was nothing pending.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApprovalOutcome {
    pub run_id: String,
    /// step_ids flipped from needs_approval to applied
    pub applied_steps: Vec<String>,
    pub artifacts: Vec<ArtifactRecord>,
    pub notes: Vec<String>,
}

impl ApprovalOutcome {
    pub fn is_noop(&self) -> bool {
        self.applied_steps.is_empty()
    }
}

// ============================================================================
// ENGINE
// ============================================================================

pub struct Engine {
    store: Arc<RunStore>,
    audit: AuditTrail,
    assist: Box<dyn TextAssist>,
    limits: LoadLimits,
    approval_locks: KeyedLocks,
}

impl Engine {
    /// Engine over `runs_dir` with the heuristic assist and no row limits.
    pub fn new(runs_dir: impl Into<PathBuf>) -> Self {
        let store = Arc::new(RunStore::new(runs_dir));
        Engine {
            audit: AuditTrail::new(Arc::clone(&store)),
            store,
            assist: Box::new(HeuristicAssist),
            limits: LoadLimits::unlimited(),
            approval_locks: KeyedLocks::new(),
        }
    }

    pub fn from_settings(runs_dir: impl Into<PathBuf>, settings: &Settings) -> Self {
        Engine::new(runs_dir)
            .with_limits(settings.load_limits())
            .with_assist(assist::from_settings(settings))
    }

    pub fn with_assist(mut self, assist: Box<dyn TextAssist>) -> Self {
        self.assist = assist;
        self
    }

    pub fn with_limits(mut self, limits: LoadLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn store(&self) -> &RunStore {
        &self.store
    }

    pub fn audit(&self) -> &AuditTrail {
        &self.audit
    }

    // ========================================================================
    // RUN
    // ========================================================================

    /// Execute every check for `document_type` against `inputs`.
    ///
    /// Tables without an entry in `mappings` are auto-mapped from their
    /// headers. Unknown types and missing inputs fail before anything is
    /// written.
    pub fn run(
        &self,
        document_type: &str,
        inputs: InputFiles,
        mappings: TableMappings,
        run_id: Option<String>,
    ) -> Result<RunResult, EngineError> {
        let document_type: DocumentType = document_type.parse()?;
        for table in document_type.tables() {
            if !inputs.contains_key(table.name()) {
                return Err(EngineError::MissingInput {
                    document_type: document_type.code().to_string(),
                    input: table.name().to_string(),
                });
            }
        }
        for name in inputs.keys() {
            let known = document_type.tables().iter().any(|t| t.name() == name)
                || document_type.optional_inputs().contains(&name.as_str());
            if !known {
                tracing::warn!(input = %name, "input is not used by {} runs", document_type);
            }
        }

        let run_id = run_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let input_records = inputs
            .iter()
            .map(|(name, path)| InputFileRecord::from_path(name, path))
            .collect::<Result<Vec<_>, _>>()?;
        self.audit.create_run(&run_id, document_type, input_records)?;

        match self.analyze_and_finalize(document_type, &run_id, &inputs, mappings) {
            Ok(result) => {
                tracing::info!(run_id = %run_id, "{}", result.summary);
                Ok(result)
            }
            Err(err) => {
                self.record_failure(&run_id, &err);
                Err(EngineError::from_check(err))
            }
        }
    }

    fn analyze_and_finalize(
        &self,
        document_type: DocumentType,
        run_id: &str,
        inputs: &InputFiles,
        mappings: TableMappings,
    ) -> anyhow::Result<RunResult> {
        let mappings = self.resolve_mappings(document_type, inputs, mappings)?;
        storage::write_json(&self.store.mapping_path(run_id), &mappings)?;

        self.assist.begin_run();
        let ctx = RunContext::new(run_id, inputs, &mappings, self.limits, self.assist.as_ref(), &self.audit);
        let analysis = Rules::for_type(document_type).analyze(&ctx)?;

        let recommendations_path = self.store.recommendations_path(run_id);
        storage::write_json(&recommendations_path, &analysis.recommendations)?;

        let mut artifacts = analysis.artifacts;
        artifacts.push(ArtifactRecord::new("json", &recommendations_path));

        let audit = self.audit.finalize_run(run_id, &analysis.summary, artifacts)?;
        Ok(RunResult {
            run_id: run_id.to_string(),
            summary: analysis.summary,
            artifacts: audit.artifacts,
        })
    }

    /// Fill in an auto-mapping for every table the caller left unmapped.
    fn resolve_mappings(
        &self,
        document_type: DocumentType,
        inputs: &InputFiles,
        mut mappings: TableMappings,
    ) -> anyhow::Result<TableMappings> {
        for table in document_type.tables() {
            if mappings.contains_key(table.name()) {
                continue;
            }
            let Some(path) = inputs.get(table.name()) else {
                continue;
            };
            let headers = loader::read_headers(path)?;
            let proposed = auto_map(&table.schema().column_names(), &headers, &table.synonyms());
            let unmapped = proposed.unmapped();
            if !unmapped.is_empty() {
                tracing::debug!(table = table.name(), ?unmapped, "auto-mapping left columns unmapped");
            }
            mappings.insert(table.name().to_string(), proposed.into_mapping());
        }
        Ok(mappings)
    }

    /// Append the synthetic failed step and close the run.
    fn record_failure(&self, run_id: &str, err: &anyhow::Error) {
        let step = StepRecord::new("Run failed", "RUN_FAILED", "Run halted by error")
            .with_severity(Severity::High)
            .with_evidence(vec![format!("{:#}", err)])
            .with_status(StepStatus::Failed);

        let recorded = self
            .audit
            .append_step(run_id, step)
            .and_then(|_| self.audit.finalize_run(run_id, &format!("Run failed: {:#}", err), Vec::new()));
        match recorded {
            Ok(_) => tracing::error!(run_id, "run failed: {:#}", err),
            Err(audit_err) => tracing::error!(
                run_id,
                "run failed ({:#}) and the failure could not be recorded: {}",
                err,
                audit_err
            ),
        }
    }

    // ========================================================================
    // APPROVE
    // ========================================================================

    /// Apply the recorded fixes of a run and flip its gated steps to applied.
    ///
    /// Serialized per run. A run with nothing pending is a no-op; a run whose
    /// inputs changed since analysis is refused and left untouched.
    pub fn approve(&self, run_id: &str) -> Result<ApprovalOutcome, EngineError> {
        self.approval_locks.with_lock(run_id, || -> Result<ApprovalOutcome, EngineError> {
            let audit = self.audit.load_run(run_id)?;
            if !audit.has_pending_approvals() {
                tracing::info!(run_id, "nothing pending approval");
                return Ok(ApprovalOutcome {
                    run_id: run_id.to_string(),
                    ..Default::default()
                });
            }

            if let Some(changed) = audit.input_files.iter().find(|f| !f.is_unchanged()) {
                tracing::warn!(run_id, input = %changed.name, "input changed since analysis");
                return Err(EngineError::InputChanged {
                    name: changed.name.clone(),
                    path: PathBuf::from(&changed.path),
                });
            }

            let inputs = recorded_inputs(&audit);
            let mappings = self.load_mapping(run_id)?;
            let recommendations = self.load_recommendations(run_id)?;

            let ctx = RunContext::new(run_id, &inputs, &mappings, self.limits, self.assist.as_ref(), &self.audit);
            let applied = Rules::for_type(audit.document_type)
                .apply(&ctx, &recommendations)
                .map_err(EngineError::from_check)?;

            let (_, applied_steps) = self.audit.mark_applied(run_id)?;
            let summary = audit.final_summary.as_deref().unwrap_or(APPLIED_SUMMARY);
            self.audit.finalize_run(run_id, summary, applied.artifacts.clone())?;

            tracing::info!(run_id, steps = applied_steps.len(), fixes = applied.notes.len(), "fixes applied");
            Ok(ApprovalOutcome {
                run_id: run_id.to_string(),
                applied_steps,
                artifacts: applied.artifacts,
                notes: applied.notes,
            })
        })
    }

    // ========================================================================
    // READ SIDE
    // ========================================================================

    pub fn load_run(&self, run_id: &str) -> Result<RunAudit, EngineError> {
        Ok(self.audit.load_run(run_id)?)
    }

    /// Mapping recorded at analysis time (empty if none was written).
    pub fn load_mapping(&self, run_id: &str) -> Result<TableMappings, EngineError> {
        RunStore::validate_run_id(run_id)?;
        Ok(storage::read_json_opt(&self.store.mapping_path(run_id))?.unwrap_or_default())
    }

    pub fn load_recommendations(&self, run_id: &str) -> Result<Vec<Recommendation>, EngineError> {
        RunStore::validate_run_id(run_id)?;
        Ok(storage::read_json_opt(&self.store.recommendations_path(run_id))?.unwrap_or_default())
    }
}

fn recorded_inputs(audit: &RunAudit) -> InputFiles {
    audit
        .input_files
        .iter()
        .map(|f| (f.name.clone(), PathBuf::from(&f.path)))
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assist::{AssistProvider, GuardedAssist};
    use crate::error::SchemaError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use crate::mapping::ColumnMapping;
    use crate::report;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    const INVOICES: &str = "invoice_id,vendor,date,subtotal,vat_rate,vat_amount,total,po_id,dn_id\n\
                            INV-1,Acme,2024-01-01,100,0.18,18,120,PO-1,DN-1\n\
                            INV-2,Acme,2024-01-02,50,0.18,9,59,PO-1,DN-1\n";
    const PURCHASE_ORDERS: &str = "po_id,item_count,total_expected\nPO-1,2,118\n";
    const DELIVERY_NOTES: &str = "dn_id,delivered_item_count\nDN-1,2\n";

    fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        path
    }

    fn create_test_edoc_inputs(dir: &TempDir, invoices: &str) -> InputFiles {
        let mut inputs = InputFiles::new();
        inputs.insert("invoices".into(), write_file(dir.path(), "invoices.csv", invoices));
        inputs.insert("purchase_orders".into(), write_file(dir.path(), "po.csv", PURCHASE_ORDERS));
        inputs.insert("delivery_notes".into(), write_file(dir.path(), "dn.csv", DELIVERY_NOTES));
        inputs
    }

    fn create_test_engine(dir: &TempDir) -> Engine {
        Engine::new(dir.path().join("runs"))
    }

    #[test]
    fn test_run_records_steps_and_artifacts() {
        let dir = TempDir::new().unwrap();
        let engine = create_test_engine(&dir);
        let inputs = create_test_edoc_inputs(&dir, INVOICES);

        let result = engine
            .run("edoc", inputs, TableMappings::new(), Some("run-1".into()))
            .unwrap();

        assert_eq!(result.summary, "Invoices: 2. Issues: 1.");
        let kinds: Vec<&str> = result.artifacts.iter().map(|a| a.kind.as_str()).collect();
        assert_eq!(kinds, vec!["report", "csv", "json", "json"]);

        let audit = engine.load_run("run-1").unwrap();
        assert!(audit.is_finalized());
        assert_eq!(audit.steps.len(), 6);
        assert_eq!(audit.pending_approvals().len(), 1);
        assert_eq!(audit.input_files.len(), 3);

        let recommendations = engine.load_recommendations("run-1").unwrap();
        assert_eq!(recommendations.len(), 1);
        assert_eq!(recommendations[0].as_fix().map(|f| f.suggested_value), Some(118.0));
        println!("✅ run recorded {} steps", audit.steps.len());
    }

    #[test]
    fn test_unknown_type_and_missing_input_have_no_side_effects() {
        let dir = TempDir::new().unwrap();
        let engine = create_test_engine(&dir);

        let err = engine
            .run("payroll", InputFiles::new(), TableMappings::new(), None)
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownDocumentType(t) if t == "payroll"));

        let mut inputs = create_test_edoc_inputs(&dir, INVOICES);
        inputs.remove("delivery_notes");
        let err = engine.run("edoc", inputs, TableMappings::new(), None).unwrap_err();
        assert!(matches!(err, EngineError::MissingInput { ref input, .. } if input == "delivery_notes"));

        assert!(engine.store().list_runs().unwrap().is_empty());
    }

    #[test]
    fn test_failing_check_is_recorded_then_raised() {
        let dir = TempDir::new().unwrap();
        let engine = create_test_engine(&dir);
        let inputs = create_test_edoc_inputs(
            &dir,
            "invoice_id,vendor,date,subtotal,vat_rate,vat_amount,total,po_id,dn_id\n\
             INV-1,Acme,2024-01-01,abc,0.18,18,118,PO-1,DN-1\n",
        );

        let err = engine
            .run("edoc", inputs, TableMappings::new(), Some("run-bad".into()))
            .unwrap_err();
        match err {
            EngineError::Schema(SchemaError::InvalidTypes { violations, .. }) => {
                assert_eq!(violations[0].column, "subtotal");
            }
            other => panic!("unexpected error: {other}"),
        }

        let audit = engine.load_run("run-bad").unwrap();
        assert!(audit.is_finalized());
        assert!(audit.failed());
        let last = audit.steps.last().unwrap();
        assert_eq!(last.action, "RUN_FAILED");
        assert_eq!(last.severity, Severity::High);
        assert!(audit.final_summary.unwrap().starts_with("Run failed: "));

        let listed: Vec<String> = engine.store().list_runs().unwrap().into_iter().map(|e| e.run_id).collect();
        assert_eq!(listed, vec!["run-bad".to_string()]);
    }

    #[test]
    fn test_malformed_reference_list_is_a_rule_failure() {
        let dir = TempDir::new().unwrap();
        let engine = create_test_engine(&dir);
        let mut inputs = create_test_edoc_inputs(&dir, INVOICES);
        inputs.insert(
            crate::schema::ALLOWED_VAT_RATES_INPUT.into(),
            write_file(dir.path(), "rates.json", "{not json"),
        );

        let err = engine
            .run("edoc", inputs, TableMappings::new(), Some("run-rates".into()))
            .unwrap_err();
        assert!(matches!(err, EngineError::RuleExecution(_)), "unexpected error: {err}");

        let audit = engine.load_run("run-rates").unwrap();
        assert!(audit.is_finalized());
        let last = audit.steps.last().unwrap();
        assert_eq!(last.action, "RUN_FAILED");
        assert_eq!(last.status, StepStatus::Failed);
        assert!(audit.final_summary.unwrap().starts_with("Run failed:"));
        assert_eq!(engine.store().list_runs().unwrap().len(), 1);
    }

    /// Always fails and counts how often it was reached.
    struct FlakyProvider(Arc<AtomicUsize>);

    impl AssistProvider for FlakyProvider {
        fn name(&self) -> &str {
            "flaky"
        }

        fn categorize(&self, _text: &str) -> anyhow::Result<String> {
            self.0.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("upstream error")
        }

        fn improve_draft(&self, _draft: &str) -> anyhow::Result<String> {
            self.0.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("upstream error")
        }
    }

    #[test]
    fn test_failed_assist_is_skipped_for_rest_of_run() {
        let dir = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let engine = create_test_engine(&dir).with_assist(Box::new(GuardedAssist::new(FlakyProvider(Arc::clone(&calls)))));
        let tickets = write_file(
            dir.path(),
            "tickets.csv",
            "ticket_id,created_at,channel,customer_text,category,order_id,amount\n\
             T1,2024-01-01,email,refund please,,ORD-1,20\n\
             T2,2024-01-02,chat,where is my kargo,,ORD-2,30\n\
             T3,2024-01-03,email,hello,,ORD-3,40\n",
        );
        let mut inputs = InputFiles::new();
        inputs.insert("tickets".into(), tickets);

        engine.run("ticket", inputs.clone(), TableMappings::new(), Some("run-a".into())).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // A new run gives the provider another chance
        engine.run("ticket", inputs, TableMappings::new(), Some("run-b".into())).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_run_id_is_single_use() {
        let dir = TempDir::new().unwrap();
        let engine = create_test_engine(&dir);

        engine
            .run("edoc", create_test_edoc_inputs(&dir, INVOICES), TableMappings::new(), Some("run-1".into()))
            .unwrap();
        let err = engine
            .run("edoc", create_test_edoc_inputs(&dir, INVOICES), TableMappings::new(), Some("run-1".into()))
            .unwrap_err();
        assert!(matches!(err, EngineError::Audit(_)));
    }

    #[test]
    fn test_approve_applies_once() {
        let dir = TempDir::new().unwrap();
        let engine = create_test_engine(&dir);
        engine
            .run("edoc", create_test_edoc_inputs(&dir, INVOICES), TableMappings::new(), Some("run-1".into()))
            .unwrap();
        let before = engine.load_run("run-1").unwrap();

        let outcome = engine.approve("run-1").unwrap();
        assert_eq!(outcome.applied_steps.len(), 1);
        assert_eq!(outcome.notes, vec!["INV-1 -> total=118.00".to_string()]);

        let after = engine.load_run("run-1").unwrap();
        assert_eq!(after.steps.len(), before.steps.len());
        for (old, new) in before.steps.iter().zip(&after.steps) {
            if old.is_pending_approval() {
                assert_eq!(new.status, StepStatus::Applied);
            } else {
                assert_eq!(new.status, old.status);
            }
        }
        assert_eq!(after.final_summary, before.final_summary);
        assert_eq!(after.artifacts.len(), before.artifacts.len() + 1);

        let corrected = fs::read_to_string(engine.store().artifacts_dir("run-1").join(report::CORRECTED_INVOICES_FILENAME)).unwrap();
        assert!(corrected.contains("INV-1,Acme,2024-01-01,100,0.18,18,118,PO-1,DN-1"));
        let rendered = fs::read_to_string(engine.store().artifacts_dir("run-1").join(report::REPORT_FILENAME)).unwrap();
        assert!(rendered.contains("## Applied fixes"));

        // Second approval finds nothing pending
        let again = engine.approve("run-1").unwrap();
        assert!(again.is_noop());
        assert_eq!(engine.load_run("run-1").unwrap(), after);
    }

    #[test]
    fn test_approve_refuses_changed_input() {
        let dir = TempDir::new().unwrap();
        let engine = create_test_engine(&dir);
        let inputs = create_test_edoc_inputs(&dir, INVOICES);
        let invoice_path = inputs["invoices"].clone();
        engine
            .run("edoc", inputs, TableMappings::new(), Some("run-1".into()))
            .unwrap();

        fs::write(&invoice_path, INVOICES.replace("120", "121")).unwrap();
        let err = engine.approve("run-1").unwrap_err();
        assert!(matches!(err, EngineError::InputChanged { ref name, .. } if name == "invoices"));

        let audit = engine.load_run("run-1").unwrap();
        assert_eq!(audit.pending_approvals().len(), 1);
    }

    #[test]
    fn test_explicit_and_auto_mappings_are_persisted() {
        let dir = TempDir::new().unwrap();
        let engine = create_test_engine(&dir);
        let tickets = write_file(
            dir.path(),
            "tickets.csv",
            "Ticket ID,Created,Source,Message,Tutar\nT1,2024-01-01,email,where is my kargo,20\n",
        );
        let mut inputs = InputFiles::new();
        inputs.insert("tickets".into(), tickets);

        let result = engine.run("ticket", inputs, TableMappings::new(), Some("run-t".into())).unwrap();
        assert!(result.summary.starts_with("Tickets reviewed: 1."));

        let mappings = engine.load_mapping("run-t").unwrap();
        let tickets = &mappings["tickets"];
        assert_eq!(tickets.resolve("customer_text"), "Message");
        assert_eq!(tickets.resolve("amount"), "Tutar");

        // Nothing to approve on ticket runs
        assert!(engine.approve("run-t").unwrap().is_noop());

        let mut explicit = TableMappings::new();
        explicit.insert(
            "tickets".into(),
            ColumnMapping::from_pairs([
                ("ticket_id", "Ticket ID"),
                ("created_at", "Created"),
                ("channel", "Source"),
                ("customer_text", "Message"),
            ]),
        );
        let mut inputs = InputFiles::new();
        inputs.insert("tickets".into(), dir.path().join("tickets.csv"));
        engine.run("ticket", inputs, explicit.clone(), Some("run-u".into())).unwrap();
        assert_eq!(engine.load_mapping("run-u").unwrap(), explicit);
    }
}
