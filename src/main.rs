// 🧾 recon-audit - command line front end
// run → inspect → approve, over the on-disk run store

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use recon_audit::config::DEFAULT_SETTINGS_FILE;
use recon_audit::mapping::auto_map;
use recon_audit::{
    loader, ColumnMapping, DocumentType, Engine, InputFiles, RunAudit, Settings, StepStatus,
    TableKind, TableMappings,
};

#[derive(Debug, Parser)]
#[command(name = "recon-audit", version, about = "Reconcile tabular records with an approvable audit trail")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Directory holding runs/ state
    #[arg(long, global = true, default_value = "runs")]
    runs_dir: PathBuf,

    /// Settings file (missing or malformed = defaults)
    #[arg(long, global = true, default_value = DEFAULT_SETTINGS_FILE)]
    settings: PathBuf,

    /// Quiet mode (errors only)
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Verbose mode (info logging)
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Analyze a set of inputs and record a new run
    Run {
        /// ticket | edoc
        #[arg(long = "type")]
        document_type: String,

        /// name=path, e.g. invoices=data/invoices.csv
        #[arg(long = "input", value_parser = parse_input, required = true)]
        inputs: Vec<(String, PathBuf)>,

        /// table:expected=actual, e.g. invoices:total=Grand Total
        #[arg(long = "map", value_parser = parse_mapping)]
        mappings: Vec<(String, String, String)>,

        #[arg(long)]
        run_id: Option<String>,
    },

    /// Propose a column mapping for one file
    Map {
        #[arg(long = "type")]
        document_type: String,

        #[arg(long)]
        table: String,

        #[arg(long)]
        file: PathBuf,
    },

    /// Apply the pending fixes of a run
    Approve { run_id: String },

    /// List recorded runs, newest first
    List,

    /// Print one run's audit trail
    Show { run_id: String },

    /// Delete one run
    Delete { run_id: String },

    /// Remove runs older than the retention period
    Cleanup {
        /// Overrides ttl_days from the settings file
        #[arg(long)]
        ttl_days: Option<u32>,
    },
}

fn main() {
    if let Err(error) = run() {
        eprintln!("❌ {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.quiet, cli.verbose)?;

    let settings = Settings::load(&cli.settings);
    let engine = Engine::from_settings(&cli.runs_dir, &settings);

    if let Some(ttl_days) = settings.ttl_days {
        if !matches!(cli.command, Command::Cleanup { .. }) {
            engine.store().cleanup_old_runs(ttl_days)?;
        }
    }

    match cli.command {
        Command::Run {
            document_type,
            inputs,
            mappings,
            run_id,
        } => run_analysis(&engine, &document_type, inputs, mappings, run_id),
        Command::Map {
            document_type,
            table,
            file,
        } => propose_mapping(&document_type, &table, &file),
        Command::Approve { run_id } => approve(&engine, &run_id),
        Command::List => list_runs(&engine),
        Command::Show { run_id } => show_run(&engine, &run_id),
        Command::Delete { run_id } => {
            engine.store().delete_run(&run_id)?;
            println!("🗑️  Deleted run {}", run_id);
            Ok(())
        }
        Command::Cleanup { ttl_days } => {
            let Some(ttl_days) = ttl_days.or(settings.ttl_days) else {
                println!("No retention period configured; nothing to clean up.");
                return Ok(());
            };
            let removed = engine.store().cleanup_old_runs(ttl_days)?;
            println!("🧹 Removed {} run(s) older than {} day(s)", removed.len(), ttl_days);
            Ok(())
        }
    }
}

fn init_tracing(quiet: bool, verbose: bool) -> Result<()> {
    let level = if quiet {
        "error"
    } else if verbose {
        "info"
    } else {
        "warn"
    };

    let filter = tracing_subscriber::EnvFilter::try_from_env("RECON_AUDIT_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|error| anyhow::anyhow!("failed to initialize tracing subscriber: {error}"))?;

    Ok(())
}

// ============================================================================
// COMMANDS
// ============================================================================

fn run_analysis(
    engine: &Engine,
    document_type: &str,
    inputs: Vec<(String, PathBuf)>,
    mappings: Vec<(String, String, String)>,
    run_id: Option<String>,
) -> Result<()> {
    let inputs: InputFiles = inputs.into_iter().collect();

    let mut table_mappings = TableMappings::new();
    for (table, expected, actual) in mappings {
        table_mappings
            .entry(table)
            .or_insert_with(ColumnMapping::new)
            .insert(expected, actual);
    }

    println!("🔍 Running {} checks...", document_type);
    let result = engine.run(document_type, inputs, table_mappings, run_id)?;

    println!("✓ Run {}", result.run_id);
    println!("  {}", result.summary);
    for artifact in &result.artifacts {
        println!("  📄 {} ({})", artifact.path, artifact.kind);
    }

    let audit = engine.load_run(&result.run_id)?;
    let pending = audit.pending_approvals();
    if !pending.is_empty() {
        println!("\n⏳ {} step(s) awaiting approval:", pending.len());
        for step in pending {
            println!("  - {} ({})", step.title, step.action);
        }
        println!("  Run: recon-audit approve {}", result.run_id);
    }
    Ok(())
}

fn propose_mapping(document_type: &str, table: &str, file: &Path) -> Result<()> {
    let document_type: DocumentType = document_type.parse()?;
    let Some(kind) = TableKind::from_name(table).filter(|k| document_type.tables().contains(k)) else {
        bail!("table '{}' is not part of {} runs", table, document_type);
    };

    let headers = loader::read_headers(file)
        .with_context(|| format!("Failed to read headers of {}", file.display()))?;
    let proposal = auto_map(&kind.schema().column_names(), &headers, &kind.synonyms());

    println!("🧭 Column mapping for {} ({})", kind.name(), file.display());
    for (expected, actual) in &proposal.mapping {
        match actual {
            Some(actual) => {
                let score = proposal.scores.get(expected).copied().unwrap_or(0);
                println!("  {:<22} ← {} [{}]", expected, actual, score);
            }
            None => println!("  {:<22} ← (unmapped)", expected),
        }
    }

    let missing = proposal.missing_required(kind.schema());
    if !missing.is_empty() {
        println!("\n⚠️  Required columns without a match: {}", missing.join(", "));
        println!("  Pass them with --map {}:<expected>=<actual>", kind.name());
    }
    Ok(())
}

fn approve(engine: &Engine, run_id: &str) -> Result<()> {
    let outcome = engine.approve(run_id)?;
    if outcome.is_noop() {
        println!("Nothing pending approval for run {}", run_id);
        return Ok(());
    }

    println!("✅ Approved {} step(s) of run {}", outcome.applied_steps.len(), run_id);
    for note in &outcome.notes {
        println!("  ✓ {}", note);
    }
    for artifact in &outcome.artifacts {
        println!("  📄 {}", artifact.path);
    }
    Ok(())
}

fn list_runs(engine: &Engine) -> Result<()> {
    let runs = engine.store().list_runs()?;
    if runs.is_empty() {
        println!("No runs recorded.");
        return Ok(());
    }
    for entry in runs {
        let finished = entry
            .finished_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}  {:<6}  started {}  finished {}",
            entry.run_id,
            entry.demo_type.code(),
            entry.started_at.format("%Y-%m-%d %H:%M:%S"),
            finished
        );
    }
    Ok(())
}

fn show_run(engine: &Engine, run_id: &str) -> Result<()> {
    let audit = engine.load_run(run_id)?;
    print_audit(&audit);
    Ok(())
}

fn print_audit(audit: &RunAudit) {
    println!("📋 Run {} ({})", audit.run_id, audit.document_type);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    for input in &audit.input_files {
        println!("  input {} = {} [{}]", input.name, input.path, &input.hash[..12.min(input.hash.len())]);
    }

    for step in &audit.steps {
        let marker = match step.status {
            StepStatus::Done => "✓",
            StepStatus::NeedsApproval => "⏳",
            StepStatus::Applied => "✅",
            StepStatus::Skipped => "–",
            StepStatus::Failed => "❌",
        };
        println!(
            "\n{} {} [{}] {} ({} ms)",
            marker, step.action, step.severity.label(), step.decision, step.duration_ms
        );
        for line in step.evidence.iter().take(10) {
            println!("    {}", line);
        }
    }

    if let Some(summary) = &audit.final_summary {
        println!("\n{}", summary);
    }
    for artifact in &audit.artifacts {
        println!("  📄 {} ({})", artifact.path, artifact.kind);
    }
}

// ============================================================================
// ARGUMENT PARSING
// ============================================================================

/// `name=path`
fn parse_input(value: &str) -> Result<(String, PathBuf), String> {
    match value.split_once('=') {
        Some((name, path)) if !name.trim().is_empty() && !path.trim().is_empty() => {
            Ok((name.trim().to_string(), PathBuf::from(path.trim())))
        }
        _ => Err(format!("expected name=path, got '{}'", value)),
    }
}

/// `table:expected=actual`. The actual header is kept verbatim.
fn parse_mapping(value: &str) -> Result<(String, String, String), String> {
    let parsed = value.split_once(':').and_then(|(table, rest)| {
        let (expected, actual) = rest.split_once('=')?;
        Some((table.trim(), expected.trim(), actual))
    });
    match parsed {
        Some((table, expected, actual)) if !table.is_empty() && !expected.is_empty() && !actual.is_empty() => {
            Ok((table.to_string(), expected.to_string(), actual.to_string()))
        }
        _ => Err(format!("expected table:expected=actual, got '{}'", value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_command_tree_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_arguments() {
        let cli = Cli::try_parse_from([
            "recon-audit",
            "--runs-dir",
            "/tmp/runs",
            "run",
            "--type",
            "edoc",
            "--input",
            "invoices=data/invoices.csv",
            "--input",
            "purchase_orders=data/po.csv",
            "--map",
            "invoices:total=Grand Total",
        ])
        .unwrap();

        assert_eq!(cli.runs_dir, PathBuf::from("/tmp/runs"));
        match cli.command {
            Command::Run { document_type, inputs, mappings, run_id } => {
                assert_eq!(document_type, "edoc");
                assert_eq!(inputs.len(), 2);
                assert_eq!(inputs[0], ("invoices".to_string(), PathBuf::from("data/invoices.csv")));
                assert_eq!(
                    mappings,
                    vec![("invoices".to_string(), "total".to_string(), "Grand Total".to_string())]
                );
                assert!(run_id.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_rejects_malformed_pairs() {
        assert!(parse_input("invoices").is_err());
        assert!(parse_input("=data.csv").is_err());
        assert!(parse_mapping("invoices:total").is_err());
        assert!(parse_mapping("total=Grand Total").is_err());
    }
}
