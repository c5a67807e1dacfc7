// 📜 Audit Trail - Append-only run ledger + approval state machine
//
// Step status:
//   done            terminal, nothing to do
//   needs_approval  waits for an explicit approval
//   applied         reached only from needs_approval (requires_approval = true)
//   skipped
//   failed          run-level failure
//
// Every writer operation is a read-modify-write of audit.json under the run's
// lock, persisted with write-temp-then-rename.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::error::AuditError;
use crate::rules::Severity;
use crate::schema::DocumentType;
use crate::storage::{self, KeyedLocks, RunIndexEntry, RunStore};

// ============================================================================
// RECORDS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Done,
    NeedsApproval,
    Applied,
    Skipped,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Done => "done",
            StepStatus::NeedsApproval => "needs_approval",
            StepStatus::Applied => "applied",
            StepStatus::Skipped => "skipped",
            StepStatus::Failed => "failed",
        }
    }
}

/// One recorded check execution and its verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step_id: String,
    pub timestamp: DateTime<Utc>,
    pub title: String,
    /// Machine name of the check (DUPLICATE_CHECK, TOTAL_CHECK, ...)
    pub action: String,
    pub severity: Severity,
    #[serde(default)]
    pub evidence: Vec<String>,
    pub decision: String,
    pub requires_approval: bool,
    pub status: StepStatus,
    #[serde(default)]
    pub duration_ms: u64,
}

impl StepRecord {
    /// A `done` step with no evidence and no approval gate.
    pub fn new(title: impl Into<String>, action: impl Into<String>, decision: impl Into<String>) -> Self {
        StepRecord {
            step_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            title: title.into(),
            action: action.into(),
            severity: Severity::Info,
            evidence: Vec::new(),
            decision: decision.into(),
            requires_approval: false,
            status: StepStatus::Done,
            duration_ms: 0,
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_evidence(mut self, evidence: Vec<String>) -> Self {
        self.evidence = evidence;
        self
    }

    /// Gate the step behind approval when `required`.
    pub fn requiring_approval(mut self, required: bool) -> Self {
        self.requires_approval = required;
        self.status = if required {
            StepStatus::NeedsApproval
        } else {
            StepStatus::Done
        };
        self
    }

    pub fn with_status(mut self, status: StepStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn is_pending_approval(&self) -> bool {
        self.requires_approval && self.status == StepStatus::NeedsApproval
    }
}

/// One uploaded file, hashed at run creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputFileRecord {
    pub name: String,
    pub path: String,
    pub hash: String,
}

impl InputFileRecord {
    pub fn from_path(name: &str, path: &Path) -> Result<Self, AuditError> {
        Ok(InputFileRecord {
            name: name.to_string(),
            path: path.display().to_string(),
            hash: hash_file(path)?,
        })
    }

    /// True when the file still exists with identical bytes.
    pub fn is_unchanged(&self) -> bool {
        hash_file(Path::new(&self.path)).is_ok_and(|current| current == self.hash)
    }
}

/// SHA-256 hex digest, streamed in 8 KiB blocks.
pub fn hash_file(path: &Path) -> Result<String, AuditError> {
    let io_err = |source| AuditError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut file = std::fs::File::open(path).map_err(io_err)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let read = file.read(&mut buffer).map_err(io_err)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    #[serde(rename = "type")]
    pub kind: String,
    pub path: String,
}

impl ArtifactRecord {
    pub fn new(kind: &str, path: &Path) -> Self {
        ArtifactRecord {
            kind: kind.to_string(),
            path: path.display().to_string(),
        }
    }
}

/// Aggregate root of one run. Owned by [`AuditTrail`]; everyone else reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunAudit {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(rename = "demo_type")]
    pub document_type: DocumentType,
    pub input_files: Vec<InputFileRecord>,
    #[serde(default)]
    pub steps: Vec<StepRecord>,
    pub final_summary: Option<String>,
    #[serde(default)]
    pub artifacts: Vec<ArtifactRecord>,
}

impl RunAudit {
    pub fn is_finalized(&self) -> bool {
        self.final_summary.is_some()
    }

    pub fn pending_approvals(&self) -> Vec<&StepRecord> {
        self.steps.iter().filter(|s| s.is_pending_approval()).collect()
    }

    pub fn has_pending_approvals(&self) -> bool {
        self.steps.iter().any(StepRecord::is_pending_approval)
    }

    pub fn failed(&self) -> bool {
        self.steps.iter().any(|s| s.status == StepStatus::Failed)
    }

    fn index_entry(&self) -> RunIndexEntry {
        RunIndexEntry {
            run_id: self.run_id.clone(),
            demo_type: self.document_type,
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }
}

// ============================================================================
// AUDIT TRAIL
// ============================================================================

/// Sole writer of audit.json. Operations on one run serialize on that run's lock.
#[derive(Debug)]
pub struct AuditTrail {
    store: Arc<RunStore>,
    locks: KeyedLocks,
}

impl AuditTrail {
    pub fn new(store: Arc<RunStore>) -> Self {
        AuditTrail {
            store,
            locks: KeyedLocks::new(),
        }
    }

    pub fn store(&self) -> &RunStore {
        &self.store
    }

    fn read(&self, run_id: &str) -> Result<RunAudit, AuditError> {
        RunStore::validate_run_id(run_id)?;
        let path = self.store.audit_path(run_id);
        if !path.exists() {
            return Err(AuditError::RunNotFound(run_id.to_string()));
        }
        storage::read_json(&path)
    }

    fn write(&self, audit: &RunAudit) -> Result<(), AuditError> {
        storage::write_json(&self.store.audit_path(&audit.run_id), audit)
    }

    /// Locked read-modify-write of one run.
    fn update<R>(
        &self,
        run_id: &str,
        f: impl FnOnce(&mut RunAudit) -> Result<R, AuditError>,
    ) -> Result<(RunAudit, R), AuditError> {
        self.locks.with_lock(run_id, || -> Result<(RunAudit, R), AuditError> {
            let mut audit = self.read(run_id)?;
            let result = f(&mut audit)?;
            self.write(&audit)?;
            Ok((audit, result))
        })
    }

    /// Create the run directory, audit.json and the index entry.
    ///
    /// Run ids are single-use: an existing run is never overwritten.
    pub fn create_run(
        &self,
        run_id: &str,
        document_type: DocumentType,
        input_files: Vec<InputFileRecord>,
    ) -> Result<RunAudit, AuditError> {
        self.locks.with_lock(run_id, || -> Result<RunAudit, AuditError> {
            RunStore::validate_run_id(run_id)?;
            if self.store.run_exists(run_id) {
                return Err(AuditError::RunExists(run_id.to_string()));
            }
            self.store.ensure_run_dir(run_id)?;

            let audit = RunAudit {
                run_id: run_id.to_string(),
                started_at: Utc::now(),
                finished_at: None,
                document_type,
                input_files,
                steps: Vec::new(),
                final_summary: None,
                artifacts: Vec::new(),
            };
            self.write(&audit)?;
            self.store.upsert_index_entry(audit.index_entry())?;
            tracing::info!(run_id, document_type = %document_type, "run created");
            Ok(audit)
        })
    }

    /// Append one step. Rejected once the run is finalized.
    pub fn append_step(&self, run_id: &str, step: StepRecord) -> Result<RunAudit, AuditError> {
        self.update(run_id, |audit| {
            if audit.is_finalized() {
                return Err(AuditError::RunFinalized(run_id.to_string()));
            }
            audit.steps.push(step);
            Ok(())
        })
        .map(|(audit, ())| audit)
    }

    /// Set the summary and finish time, add artifacts (deduplicated by path).
    ///
    /// May be called again after an approved fix is applied.
    pub fn finalize_run(
        &self,
        run_id: &str,
        final_summary: &str,
        artifacts: Vec<ArtifactRecord>,
    ) -> Result<RunAudit, AuditError> {
        let (audit, ()) = self.update(run_id, |audit| {
            audit.finished_at = Some(Utc::now());
            audit.final_summary = Some(final_summary.to_string());

            let mut known: HashSet<String> = audit.artifacts.iter().map(|a| a.path.clone()).collect();
            for artifact in artifacts {
                if known.insert(artifact.path.clone()) {
                    audit.artifacts.push(artifact);
                }
            }
            Ok(())
        })?;
        self.store.upsert_index_entry(audit.index_entry())?;
        Ok(audit)
    }

    /// needs_approval -> applied, for gated steps only. Returns the flipped step ids.
    pub fn mark_applied(&self, run_id: &str) -> Result<(RunAudit, Vec<String>), AuditError> {
        self.update(run_id, |audit| {
            let mut applied = Vec::new();
            for step in audit.steps.iter_mut().filter(|s| s.is_pending_approval()) {
                step.status = StepStatus::Applied;
                applied.push(step.step_id.clone());
            }
            Ok(applied)
        })
    }

    pub fn load_run(&self, run_id: &str) -> Result<RunAudit, AuditError> {
        self.read(run_id)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn create_test_trail(dir: &TempDir) -> AuditTrail {
        AuditTrail::new(Arc::new(RunStore::new(dir.path().join("runs"))))
    }

    #[test]
    fn test_create_append_finalize() {
        let dir = TempDir::new().unwrap();
        let trail = create_test_trail(&dir);

        trail.create_run("run-1", DocumentType::EDocument, Vec::new()).unwrap();
        trail
            .append_step("run-1", StepRecord::new("Inputs loaded", "LOAD_INPUTS", "ok"))
            .unwrap();
        trail
            .append_step(
                "run-1",
                StepRecord::new("Total check", "TOTAL_CHECK", "mismatch")
                    .with_severity(Severity::Medium)
                    .requiring_approval(true),
            )
            .unwrap();

        let artifact = ArtifactRecord {
            kind: "csv".to_string(),
            path: "issues.csv".to_string(),
        };
        trail
            .finalize_run("run-1", "done", vec![artifact.clone(), artifact.clone()])
            .unwrap();

        let audit = trail.load_run("run-1").unwrap();
        assert_eq!(audit.steps.len(), 2);
        assert_eq!(audit.artifacts, vec![artifact]);
        assert!(audit.has_pending_approvals());
        assert_eq!(trail.store().list_runs().unwrap()[0].finished_at, audit.finished_at);

        // Ledger is closed for new steps
        let err = trail
            .append_step("run-1", StepRecord::new("late", "LATE", "x"))
            .unwrap_err();
        assert!(matches!(err, AuditError::RunFinalized(_)));
    }

    #[test]
    fn test_run_ids_are_single_use() {
        let dir = TempDir::new().unwrap();
        let trail = create_test_trail(&dir);

        trail.create_run("run-1", DocumentType::Ticket, Vec::new()).unwrap();
        let err = trail.create_run("run-1", DocumentType::Ticket, Vec::new()).unwrap_err();
        assert!(matches!(err, AuditError::RunExists(_)));
        assert_eq!(trail.store().list_runs().unwrap().len(), 1);
    }

    #[test]
    fn test_mark_applied_only_touches_pending_steps() {
        let dir = TempDir::new().unwrap();
        let trail = create_test_trail(&dir);
        trail.create_run("run-1", DocumentType::EDocument, Vec::new()).unwrap();

        let gated = StepRecord::new("Total", "TOTAL_CHECK", "x").requiring_approval(true);
        let gated_id = gated.step_id.clone();
        trail.append_step("run-1", gated).unwrap();
        trail.append_step("run-1", StepRecord::new("Dup", "DUPLICATE_CHECK", "x")).unwrap();
        // needs_approval without the gate flag stays put
        trail
            .append_step(
                "run-1",
                StepRecord::new("Odd", "ODD", "x").with_status(StepStatus::NeedsApproval),
            )
            .unwrap();

        let (audit, applied) = trail.mark_applied("run-1").unwrap();
        assert_eq!(applied, vec![gated_id]);
        let statuses: Vec<StepStatus> = audit.steps.iter().map(|s| s.status).collect();
        assert_eq!(
            statuses,
            vec![StepStatus::Applied, StepStatus::Done, StepStatus::NeedsApproval]
        );

        // Second approval is a no-op
        let (again, applied) = trail.mark_applied("run-1").unwrap();
        assert!(applied.is_empty());
        assert_eq!(again.steps.len(), 3);
    }

    #[test]
    fn test_unknown_run() {
        let dir = TempDir::new().unwrap();
        let trail = create_test_trail(&dir);
        assert!(matches!(
            trail.load_run("missing").unwrap_err(),
            AuditError::RunNotFound(_)
        ));
        assert!(matches!(
            trail.load_run("../x").unwrap_err(),
            AuditError::InvalidRunId(_)
        ));
    }

    #[test]
    fn test_audit_json_shape() {
        let dir = TempDir::new().unwrap();
        let trail = create_test_trail(&dir);
        trail.create_run("run-1", DocumentType::Ticket, Vec::new()).unwrap();
        trail
            .append_step("run-1", StepRecord::new("Kayıtlar", "LOAD_TICKETS", "ok"))
            .unwrap();

        let raw = std::fs::read_to_string(trail.store().audit_path("run-1")).unwrap();
        assert!(raw.is_ascii());
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["demo_type"], "ticket");
        assert_eq!(value["steps"][0]["status"], "done");
        assert_eq!(value["steps"][0]["severity"], "info");
    }

    #[test]
    fn test_concurrent_appends_are_not_lost() {
        let dir = TempDir::new().unwrap();
        let trail = create_test_trail(&dir);
        trail.create_run("run-1", DocumentType::Ticket, Vec::new()).unwrap();

        std::thread::scope(|scope| {
            for i in 0..10 {
                let trail = &trail;
                scope.spawn(move || {
                    trail
                        .append_step("run-1", StepRecord::new(format!("step {i}"), "STEP", "ok"))
                        .unwrap();
                });
            }
        });

        assert_eq!(trail.load_run("run-1").unwrap().steps.len(), 10);
    }

    #[test]
    fn test_hash_file_detects_changes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("input.csv");
        std::fs::write(&path, "a,b\n1,2\n").unwrap();

        let record = InputFileRecord::from_path("input", &path).unwrap();
        assert_eq!(record.hash.len(), 64);
        assert!(record.is_unchanged());

        std::fs::write(&path, "a,b\n1,3\n").unwrap();
        assert!(!record.is_unchanged());
    }
}
