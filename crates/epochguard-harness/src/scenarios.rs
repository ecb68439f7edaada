//! Built-in scenarios: small programs with a known detection outcome.
//!
//! Each scenario builds its own engine with a [`CollectingDiagnostics`]
//! backend, runs one program, and judges the run against an
//! [`Expectation`].

use std::sync::Arc;

use epochguard_core::{
    CollectingDiagnostics, CorruptionKind, CorruptionReport, Engine, EngineConfig, EngineError,
    MetricsSnapshot, MutexId, Outcome, RunSummary, Step, ThreadBody, ThreadId, WatchHit, step_fn,
};

/// What a correct engine does with a scenario's program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expectation {
    /// Commits without reports or rollbacks.
    Clean,
    /// Rolls back on `kind` at least once, then replays cleanly.
    Recovered(CorruptionKind),
    /// The `kind` detection repeats in replay and the run stops.
    Fatal(CorruptionKind),
    /// Completes and reports at least one leak.
    Leak,
}

impl Expectation {
    #[must_use]
    pub fn label(self) -> String {
        match self {
            Self::Clean => "clean".to_string(),
            Self::Recovered(kind) => format!("recovered:{kind}"),
            Self::Fatal(kind) => format!("fatal:{kind}"),
            Self::Leak => "leak".to_string(),
        }
    }
}

/// A named program plus the configuration it runs under.
#[derive(Clone, Copy)]
pub struct Scenario {
    pub name: &'static str,
    pub description: &'static str,
    pub expectation: Expectation,
    configure: fn(EngineConfig) -> EngineConfig,
    program: fn(&Engine) -> Box<dyn ThreadBody>,
}

/// Everything observed while running one scenario.
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    pub name: &'static str,
    pub expectation: Expectation,
    pub passed: bool,
    /// Why the run did not meet its expectation.
    pub reason: Option<String>,
    pub exit_value: Option<u64>,
    pub error: Option<String>,
    pub fatal: bool,
    pub reports: Vec<CorruptionReport>,
    pub rollbacks: Vec<u64>,
    pub watch_hits: Vec<WatchHit>,
    pub metrics: Option<MetricsSnapshot>,
    pub heap_digest: Option<String>,
    pub globals_digest: Option<String>,
}

impl std::fmt::Debug for Scenario {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scenario")
            .field("name", &self.name)
            .field("expectation", &self.expectation)
            .finish_non_exhaustive()
    }
}

impl Scenario {
    /// Run the program on a fresh engine built from `base`.
    ///
    /// Only engine setup failures are returned as errors; a failed run is
    /// part of the result.
    pub fn run(&self, base: EngineConfig) -> Result<ScenarioResult, EngineError> {
        let diag = Arc::new(CollectingDiagnostics::new());
        let engine = Engine::initialize((self.configure)(base), diag.clone())?;
        let mut body = (self.program)(&engine);
        let run = engine.run(step_fn(move |cx| body.step(cx)));

        let verdict = judge(self.expectation, &run, &diag);
        let (summary, error) = match run {
            Ok(summary) => (Some(summary), None),
            Err(err) => (None, Some(err)),
        };
        Ok(ScenarioResult {
            name: self.name,
            expectation: self.expectation,
            passed: verdict.is_ok(),
            reason: verdict.err(),
            exit_value: summary.as_ref().map(|s| s.exit_value),
            fatal: error.as_ref().is_some_and(EngineError::is_fatal),
            error: error.map(|e| e.to_string()),
            reports: diag.reports(),
            rollbacks: diag.rollbacks(),
            watch_hits: diag.watch_hits(),
            metrics: summary.as_ref().map(|s| s.metrics),
            heap_digest: summary.as_ref().map(|s| s.heap_digest.to_hex().to_string()),
            globals_digest: summary
                .as_ref()
                .map(|s| s.globals_digest.to_hex().to_string()),
        })
    }
}

fn judge(
    expectation: Expectation,
    run: &Result<RunSummary, EngineError>,
    diag: &CollectingDiagnostics,
) -> Result<(), String> {
    let count = |kind: CorruptionKind| diag.reports_of(kind).len();
    let rollbacks = diag.rollbacks().len();
    match (expectation, run) {
        (Expectation::Fatal(kind), Err(err)) if err.is_fatal() => {
            if count(kind) == 0 {
                Err(format!("fatal without a {kind} report: {err}"))
            } else {
                Ok(())
            }
        }
        (Expectation::Fatal(_), Err(err)) => Err(format!("expected a fatal error, got: {err}")),
        (Expectation::Fatal(_), Ok(_)) => Err("expected a fatal error, run completed".to_string()),
        (_, Err(err)) => Err(format!("run failed: {err}")),
        (Expectation::Clean, Ok(_)) => {
            let reports = diag.reports().len();
            if reports == 0 && rollbacks == 0 {
                Ok(())
            } else {
                Err(format!(
                    "expected a clean run, saw {reports} reports and {rollbacks} rollbacks"
                ))
            }
        }
        (Expectation::Recovered(kind), Ok(summary)) => {
            if count(kind) == 0 {
                Err(format!("no {kind} report"))
            } else if rollbacks == 0 {
                Err("detection did not roll back".to_string())
            } else if summary.metrics.commits == 0 {
                Err("replay never committed".to_string())
            } else {
                Ok(())
            }
        }
        (Expectation::Leak, Ok(_)) => {
            if count(CorruptionKind::Leak) == 0 {
                Err("no leak report".to_string())
            } else if rollbacks != 0 {
                Err(format!("leaks must not roll back, saw {rollbacks}"))
            } else {
                Ok(())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

fn unchanged(config: EngineConfig) -> EngineConfig {
    config
}

/// Every built-in scenario, in run order.
#[must_use]
pub fn builtin() -> Vec<Scenario> {
    vec![
        Scenario {
            name: "clean-commit",
            description: "calloc, realloc and free across an explicit commit",
            expectation: Expectation::Clean,
            configure: unchanged,
            program: clean_commit,
        },
        Scenario {
            name: "heap-overflow",
            description: "write one word past a 64-byte object on every run",
            expectation: Expectation::Fatal(CorruptionKind::Overflow),
            configure: unchanged,
            program: heap_overflow,
        },
        Scenario {
            name: "overflow-transient",
            description: "overflow that does not recur in replay",
            expectation: Expectation::Recovered(CorruptionKind::Overflow),
            configure: unchanged,
            program: overflow_transient,
        },
        Scenario {
            name: "use-after-free",
            description: "store into a quarantined object once",
            expectation: Expectation::Recovered(CorruptionKind::UseAfterFree),
            configure: unchanged,
            program: use_after_free,
        },
        Scenario {
            name: "leak",
            description: "drop the only pointer to a 100-byte object",
            expectation: Expectation::Leak,
            configure: unchanged,
            program: leak,
        },
        Scenario {
            name: "lock-replay",
            description: "two workers contend on a mutex, then main overflows once",
            expectation: Expectation::Recovered(CorruptionKind::Overflow),
            configure: unchanged,
            program: lock_replay,
        },
        Scenario {
            name: "slot-reaping",
            description: "spawn and join four children with two thread slots",
            expectation: Expectation::Clean,
            configure: |config| config.with_max_threads(2),
            program: slot_reaping,
        },
    ]
}

/// Look up a built-in scenario by name.
#[must_use]
pub fn find(name: &str) -> Option<Scenario> {
    builtin().into_iter().find(|s| s.name == name)
}

// ---------------------------------------------------------------------------
// Programs
// ---------------------------------------------------------------------------

fn clean_commit(_: &Engine) -> Box<dyn ThreadBody> {
    let mut stage = 0;
    Box::new(step_fn(move |cx| {
        stage += 1;
        let root = cx.global(0);
        if stage == 1 {
            let p = cx.calloc(8, 16)?;
            cx.write_u64(p, 1)?;
            let p = cx.realloc(p, 512)?;
            cx.write_u64(root, p as u64)?;
            return Ok(Step::Commit);
        }
        let p = cx.read_u64(root)? as usize;
        cx.free(p)?;
        cx.write_u64(root, 0)?;
        Ok(Step::Exit(0))
    }))
}

fn heap_overflow(_: &Engine) -> Box<dyn ThreadBody> {
    Box::new(step_fn(|cx| {
        let p = cx.malloc(64)?;
        cx.write_u64(p + 64, 0x4141_4141_4141_4141)?;
        cx.free(p)?;
        Ok(Step::Exit(0))
    }))
}

fn overflow_transient(_: &Engine) -> Box<dyn ThreadBody> {
    Box::new(step_fn(|cx| {
        let p = cx.malloc(64)?;
        if !cx.is_replaying() {
            cx.write_u64(p + 64, 0x4141_4141_4141_4141)?;
        }
        cx.free(p)?;
        Ok(Step::Exit(0))
    }))
}

fn use_after_free(_: &Engine) -> Box<dyn ThreadBody> {
    Box::new(step_fn(|cx| {
        let p = cx.malloc(48)?;
        cx.free(p)?;
        if !cx.is_replaying() {
            cx.write_u64(p + 8, 7)?;
        }
        Ok(Step::Exit(0))
    }))
}

fn leak(_: &Engine) -> Box<dyn ThreadBody> {
    Box::new(step_fn(|cx| {
        let kept = cx.malloc(24)?;
        cx.write_u64(cx.global(0), kept as u64)?;
        cx.malloc(100)?;
        Ok(Step::Exit(0))
    }))
}

fn counting_worker(m: MutexId, iterations: u64) -> impl ThreadBody {
    let mut done = 0u64;
    let mut holding = false;
    step_fn(move |cx| {
        if holding {
            let counter = cx.global(0);
            let n = cx.read_u64(counter)?;
            cx.write_u64(cx.global(8 + 8 * n as usize), cx.thread().index() as u64)?;
            cx.write_u64(counter, n + 1)?;
            cx.unlock(m)?;
            holding = false;
            done += 1;
        }
        if done == iterations {
            return Ok(Step::Exit(done));
        }
        holding = true;
        Ok(Step::Lock(m))
    })
}

fn lock_replay(engine: &Engine) -> Box<dyn ThreadBody> {
    const WORKERS: usize = 2;
    let m = engine.create_mutex();
    let mut stage = 0;
    let mut workers: Vec<ThreadId> = Vec::new();
    Box::new(step_fn(move |cx| {
        if let Outcome::Spawned(t) = cx.outcome() {
            workers.push(t);
        }
        stage += 1;
        if stage <= WORKERS {
            return Ok(Step::Spawn(Box::new(counting_worker(m, 10))));
        }
        if stage <= 2 * WORKERS {
            return Ok(Step::Join(workers[stage - WORKERS - 1]));
        }
        let total = cx.read_u64(cx.global(0))?;
        let q = cx.malloc(16)?;
        if !cx.is_replaying() {
            cx.write_u64(q + 16, 0)?;
        }
        cx.free(q)?;
        Ok(Step::Exit(total))
    }))
}

fn slot_reaping(_: &Engine) -> Box<dyn ThreadBody> {
    let child = step_fn(|_cx| Ok(Step::Exit(1)));
    let mut spawned = 0;
    let mut joined = 0;
    Box::new(step_fn(move |cx| {
        match cx.outcome() {
            Outcome::Spawned(t) => return Ok(Step::Join(t)),
            Outcome::Joined(v) => joined += v,
            _ => {}
        }
        if spawned < 4 {
            spawned += 1;
            return Ok(Step::Spawn(Box::new(child.clone())));
        }
        Ok(Step::Exit(joined))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_names_are_unique() {
        let all = builtin();
        let mut names: Vec<_> = all.iter().map(|s| s.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), all.len());
        assert!(find("leak").is_some());
        assert!(find("double-free").is_none());
    }

    #[test]
    fn labels_name_the_kind() {
        assert_eq!(Expectation::Clean.label(), "clean");
        assert_eq!(
            Expectation::Recovered(CorruptionKind::UseAfterFree).label(),
            "recovered:use_after_free"
        );
        assert_eq!(
            Expectation::Fatal(CorruptionKind::Overflow).label(),
            "fatal:overflow"
        );
    }
}
