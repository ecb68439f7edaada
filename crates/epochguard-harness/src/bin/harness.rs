//! CLI entrypoint for the epochguard scenario harness.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use epochguard_core::{EngineConfig, FatalAction, WriteTracking};
use epochguard_harness::structured_log::{LogEmitter, validate_log_file};
use epochguard_harness::{HarnessError, ScenarioRunner, runner, scenarios};
use tracing_subscriber::EnvFilter;

/// Scenario tooling for epochguard.
#[derive(Debug, Parser)]
#[command(name = "epochguard-harness")]
#[command(about = "Run epochguard detection scenarios and check their evidence")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run built-in scenarios and write a JSONL evidence log.
    Run {
        /// Scenario names to run (default: all).
        #[arg(long = "scenario")]
        scenarios: Vec<String>,
        /// Output JSONL log path.
        #[arg(long, default_value = "epochguard_scenarios.jsonl")]
        log: PathBuf,
        /// Optional artifact index path (SHA-256 of the log).
        #[arg(long)]
        artifact_index: Option<PathBuf>,
        /// Run identifier used in trace ids.
        #[arg(long, default_value = "local")]
        run_id: String,
        /// What a repeated detection does: `halt` or `abort`.
        #[arg(long, default_value = "halt")]
        fatal: String,
        /// Write tracking: `explicit` or `trap`.
        #[arg(long, default_value = "explicit")]
        tracking: String,
    },
    /// Validate a JSONL evidence log against the schema.
    ValidateLog {
        #[arg(long)]
        log: PathBuf,
    },
    /// Re-hash the artifacts listed in an index.
    VerifyIndex {
        #[arg(long)]
        artifact_index: PathBuf,
    },
    /// List built-in scenarios.
    List,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            scenarios: names,
            log,
            artifact_index,
            run_id,
            fatal,
            tracking,
        } => {
            let selected = if names.is_empty() {
                scenarios::builtin()
            } else {
                names
                    .iter()
                    .map(|n| {
                        scenarios::find(n).ok_or_else(|| HarnessError::UnknownScenario(n.clone()))
                    })
                    .collect::<Result<Vec<_>, _>>()?
            };
            let config = EngineConfig::from_env()
                .with_fatal_action(FatalAction::from_str_loose(&fatal))
                .with_tracking(WriteTracking::from_str_loose(&tracking));

            if let Some(parent) = log.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut emitter = LogEmitter::to_file(&log, "epochguard", &run_id)?;
            let report = ScenarioRunner::new(&run_id, config).run(&selected, &mut emitter)?;
            drop(emitter);

            for result in &report.results {
                let status = if result.passed { "PASS" } else { "FAIL" };
                match &result.reason {
                    Some(reason) => println!("{status} {} ({reason})", result.name),
                    None => println!("{status} {}", result.name),
                }
            }
            eprintln!("Wrote evidence log to {}", log.display());

            if let Some(index_path) = artifact_index {
                let index = runner::write_artifact_index(&run_id, &log, &index_path)?;
                eprintln!(
                    "Wrote artifact index ({} artifacts) to {}",
                    index.artifacts.len(),
                    index_path.display()
                );
            }

            if !report.all_passed() {
                let failed = report.failed();
                return Err(
                    format!("{} scenario(s) failed: {}", failed.len(), failed.join(", ")).into(),
                );
            }
        }
        Command::ValidateLog { log } => {
            let (lines, errors) = validate_log_file(&log)?;
            for error in &errors {
                eprintln!("{error}");
            }
            if !errors.is_empty() {
                return Err(format!("{} invalid field(s) in {lines} line(s)", errors.len()).into());
            }
            println!("{lines} line(s) valid");
        }
        Command::VerifyIndex { artifact_index } => {
            let mismatches = runner::verify_artifact_index(&artifact_index)?;
            for m in &mismatches {
                eprintln!("{m}");
            }
            if !mismatches.is_empty() {
                return Err(format!("{} artifact(s) do not match", mismatches.len()).into());
            }
            println!("artifact index verified");
        }
        Command::List => {
            for s in scenarios::builtin() {
                println!("{:<20} {:<26} {}", s.name, s.expectation.label(), s.description);
            }
        }
    }

    Ok(())
}
