// 🔁 End-to-end: run → approve over a scratch runs directory

use pretty_assertions::assert_eq;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use recon_audit::{Engine, EngineError, InputFiles, StepStatus, TableMappings};

const INVOICES: &str = "invoice_id,vendor,date,subtotal,vat_rate,vat_amount,total,po_id,dn_id\n\
                        INV-1,Acme,2024-01-01,100,0.18,18,120,PO-1,DN-1\n\
                        INV-2,Acme,2024-01-02,50,0.18,9,59,PO-1,DN-1\n";

fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, content).unwrap();
    path
}

fn create_test_inputs(dir: &TempDir) -> InputFiles {
    let mut inputs = InputFiles::new();
    inputs.insert("invoices".into(), write_file(dir.path(), "invoices.csv", INVOICES));
    inputs.insert(
        "purchase_orders".into(),
        write_file(dir.path(), "po.csv", "po_id,item_count,total_expected\nPO-1,2,118\n"),
    );
    inputs.insert(
        "delivery_notes".into(),
        write_file(dir.path(), "dn.csv", "dn_id,delivered_item_count\nDN-1,2\n"),
    );
    inputs
}

#[test]
fn test_run_then_approve() {
    let inputs_dir = TempDir::new().unwrap();
    let runs_dir = TempDir::new().unwrap();
    let engine = Engine::new(runs_dir.path());

    let result = engine
        .run("edoc", create_test_inputs(&inputs_dir), TableMappings::new(), None)
        .unwrap();
    assert!(!result.run_id.is_empty());
    for artifact in &result.artifacts {
        assert!(Path::new(&artifact.path).starts_with(runs_dir.path()));
        assert!(Path::new(&artifact.path).exists(), "missing {}", artifact.path);
    }

    let audit = engine.load_run(&result.run_id).unwrap();
    assert!(audit.is_finalized());
    assert_eq!(audit.pending_approvals().len(), 1);
    let pending_step = audit.pending_approvals()[0].step_id.clone();

    let outcome = engine.approve(&result.run_id).unwrap();
    assert_eq!(outcome.applied_steps, vec![pending_step.clone()]);
    assert_eq!(outcome.artifacts.len(), 1);

    let approved = engine.load_run(&result.run_id).unwrap();
    assert!(approved.pending_approvals().is_empty());
    let step = approved.steps.iter().find(|s| s.step_id == pending_step).unwrap();
    assert_eq!(step.status, StepStatus::Applied);
    assert_eq!(approved.final_summary, audit.final_summary);

    let again = engine.approve(&result.run_id).unwrap();
    assert!(again.is_noop());

    let listed = engine.store().list_runs().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].run_id, result.run_id);
    println!("✅ run {} approved end to end", result.run_id);
}

#[test]
fn test_state_survives_a_new_engine() {
    let inputs_dir = TempDir::new().unwrap();
    let runs_dir = TempDir::new().unwrap();

    let run_id = Engine::new(runs_dir.path())
        .run("edoc", create_test_inputs(&inputs_dir), TableMappings::new(), Some("run-1".into()))
        .unwrap()
        .run_id;

    let reopened = Engine::new(runs_dir.path());
    assert_eq!(reopened.load_recommendations(&run_id).unwrap().len(), 1);
    let outcome = reopened.approve(&run_id).unwrap();
    assert_eq!(outcome.notes, vec!["INV-1 -> total=118.00".to_string()]);
}

#[test]
fn test_approve_unknown_run_fails() {
    let runs_dir = TempDir::new().unwrap();
    let engine = Engine::new(runs_dir.path());

    let err = engine.approve("no-such-run").unwrap_err();
    assert!(matches!(err, EngineError::Audit(_)), "unexpected error: {err}");
}
