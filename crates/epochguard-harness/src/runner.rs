//! Scenario execution with structured evidence output.

use std::path::Path;

use epochguard_core::{CorruptionReport, EngineConfig, EngineError, MetricsSnapshot, WatchHit};
use serde_json::json;

use crate::scenarios::{Scenario, ScenarioResult};
use crate::structured_log::{ArtifactIndex, LogEmitter, LogEntry, LogLevel, Outcome, sha256_hex};

/// Harness failures (engine detections are results, not errors).
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("unknown scenario '{0}'")]
    UnknownScenario(String),
    #[error("engine setup failed for scenario '{scenario}': {source}")]
    Setup {
        scenario: &'static str,
        #[source]
        source: EngineError,
    },
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Runs scenarios under one base configuration.
pub struct ScenarioRunner {
    pub run_id: String,
    pub config: EngineConfig,
}

/// Results of one runner invocation.
#[derive(Debug)]
pub struct RunReport {
    pub run_id: String,
    pub results: Vec<ScenarioResult>,
}

impl RunReport {
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.results.iter().all(|r| r.passed)
    }

    /// Names of scenarios that missed their expectation.
    #[must_use]
    pub fn failed(&self) -> Vec<&'static str> {
        self.results
            .iter()
            .filter(|r| !r.passed)
            .map(|r| r.name)
            .collect()
    }
}

impl ScenarioRunner {
    #[must_use]
    pub fn new(run_id: impl Into<String>, config: EngineConfig) -> Self {
        Self {
            run_id: run_id.into(),
            config,
        }
    }

    /// Run each scenario in order, logging start, detections, rollbacks,
    /// watch hits and the verdict.
    pub fn run(
        &self,
        scenarios: &[Scenario],
        log: &mut LogEmitter,
    ) -> Result<RunReport, HarnessError> {
        let mut results = Vec::with_capacity(scenarios.len());
        for scenario in scenarios {
            log.emit_entry(
                LogEntry::new("", LogLevel::Info, "scenario_start")
                    .with_scenario(scenario.name)
                    .with_details(json!({
                        "description": scenario.description,
                        "expectation": scenario.expectation.label(),
                    })),
            )?;
            tracing::info!(scenario = scenario.name, "running scenario");

            let result = match scenario.run(self.config.clone()) {
                Ok(result) => result,
                Err(source) => {
                    log.emit_entry(
                        LogEntry::new("", LogLevel::Error, "scenario_end")
                            .with_scenario(scenario.name)
                            .with_outcome(Outcome::Error)
                            .with_details(json!({ "error": source.to_string() })),
                    )?;
                    log.flush()?;
                    return Err(HarnessError::Setup {
                        scenario: scenario.name,
                        source,
                    });
                }
            };
            self.record(&result, log)?;
            if result.passed {
                tracing::info!(scenario = result.name, "scenario passed");
            } else {
                tracing::error!(
                    scenario = result.name,
                    reason = result.reason.as_deref().unwrap_or(""),
                    "scenario failed"
                );
            }
            results.push(result);
        }
        log.flush()?;
        Ok(RunReport {
            run_id: self.run_id.clone(),
            results,
        })
    }

    fn record(&self, result: &ScenarioResult, log: &mut LogEmitter) -> Result<(), HarnessError> {
        for report in &result.reports {
            log.emit_entry(
                LogEntry::new("", LogLevel::Warn, "corruption_detected")
                    .with_scenario(result.name)
                    .with_report(report)
                    .with_details(report_details(report)),
            )?;
        }
        for &epoch in &result.rollbacks {
            log.emit_entry(
                LogEntry::new("", LogLevel::Warn, "rollback")
                    .with_scenario(result.name)
                    .with_epoch(epoch),
            )?;
        }
        for hit in &result.watch_hits {
            log.emit_entry(watch_entry(result.name, hit))?;
        }

        let (level, outcome) = if result.passed {
            (LogLevel::Info, Outcome::Pass)
        } else {
            (LogLevel::Error, Outcome::Fail)
        };
        log.emit_entry(
            LogEntry::new("", level, "scenario_end")
                .with_scenario(result.name)
                .with_outcome(outcome)
                .with_details(json!({
                    "expectation": result.expectation.label(),
                    "reason": result.reason,
                    "exit_value": result.exit_value,
                    "error": result.error,
                    "fatal": result.fatal,
                    "metrics": result.metrics.as_ref().map(metrics_json),
                    "heap_digest": result.heap_digest,
                    "globals_digest": result.globals_digest,
                })),
        )?;
        Ok(())
    }
}

fn report_details(report: &CorruptionReport) -> serde_json::Value {
    json!({
        "value": report.value.map(|v| format!("{v:#x}")),
        "alloc_site": report.alloc_site.map(|s| s.to_string()),
        "free_site": report.free_site.map(|s| s.to_string()),
        "message": report.to_string(),
    })
}

fn watch_entry(scenario: &str, hit: &WatchHit) -> LogEntry {
    LogEntry::new("", LogLevel::Warn, "watch_hit")
        .with_scenario(scenario)
        .with_address(hit.address)
        .with_thread(hit.thread.index())
        .with_epoch(hit.epoch)
        .with_details(json!({ "site": hit.site.to_string() }))
}

fn metrics_json(m: &MetricsSnapshot) -> serde_json::Value {
    json!({
        "epochs": m.epochs,
        "commits": m.commits,
        "rollbacks": m.rollbacks,
        "dirty_pages": m.dirty_pages,
        "committed_words": m.committed_words,
        "canary_checks": m.canary_checks,
        "canary_failures": m.canary_failures,
        "quarantine_evictions": m.quarantine_evictions,
        "uaf_detections": m.uaf_detections,
        "leaks": m.leaks,
        "replayed_events": m.replayed_events,
        "reaped_threads": m.reaped_threads,
    })
}

/// Hash `log_path` into a fresh artifact index and write it to `index_path`.
pub fn write_artifact_index(
    run_id: &str,
    log_path: &Path,
    index_path: &Path,
) -> Result<ArtifactIndex, HarnessError> {
    let mut index = ArtifactIndex::new(run_id);
    index.add_file(
        log_path,
        "log",
        Some("scenario evidence (JSONL)".to_string()),
    )?;
    std::fs::write(index_path, index.to_json()?)?;
    Ok(index)
}

/// Re-hash every artifact in an index; returns one message per mismatch.
pub fn verify_artifact_index(index_path: &Path) -> Result<Vec<String>, HarnessError> {
    let index: ArtifactIndex = serde_json::from_str(&std::fs::read_to_string(index_path)?)?;
    let mut mismatches = Vec::new();
    for artifact in &index.artifacts {
        match std::fs::read(&artifact.path) {
            Ok(data) => {
                let actual = sha256_hex(&data);
                if actual != artifact.sha256 {
                    mismatches.push(format!(
                        "{}: sha256 {} != recorded {}",
                        artifact.path, actual, artifact.sha256
                    ));
                }
            }
            Err(err) => mismatches.push(format!("{}: {err}", artifact.path)),
        }
    }
    Ok(mismatches)
}
