//! End-to-end detection, rollback, and replay scenarios.

use std::sync::Arc;

use epochguard_core::{
    BarrierId, CollectingDiagnostics, CorruptionKind, Engine, EngineConfig, EngineError, MutexId,
    Outcome, Step, ThreadId, step_fn,
};
use parking_lot::Mutex;

fn engine(config: EngineConfig) -> (Engine, Arc<CollectingDiagnostics>) {
    let diag = Arc::new(CollectingDiagnostics::new());
    let engine = Engine::initialize(
        config.with_heap_bytes(4 << 20).with_globals_bytes(4096),
        diag.clone(),
    )
    .expect("engine");
    (engine, diag)
}

#[test]
fn overflow_is_rolled_back_and_repeat_is_fatal() {
    let (engine, diag) = engine(EngineConfig::new());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let observer = Arc::clone(&seen);
    let err = engine
        .run(step_fn(move |cx| {
            let p = cx.malloc(64)?;
            observer.lock().push(p);
            cx.write_u64(p + 64, 0x4141_4141_4141_4141)?;
            cx.free(p)?;
            Ok(Step::Exit(0))
        }))
        .unwrap_err();

    assert!(matches!(err, EngineError::RepeatedCorruption { epoch: 1 }), "{err}");
    assert!(err.is_fatal());

    let seen = seen.lock().clone();
    assert_eq!(seen.len(), 2, "the body ran once more in replay");
    assert_eq!(seen[0], seen[1], "replay reuses the same address");
    let p = seen[0];

    let overflows = diag.reports_of(CorruptionKind::Overflow);
    assert!(!overflows.is_empty());
    assert_eq!(overflows[0].address, p + 64);
    assert_eq!(overflows[0].object_start, Some(p));
    assert_eq!(overflows[0].object_size, Some(64));
    assert_eq!(overflows[0].value, Some(0x4141_4141_4141_4141));
    assert_eq!(diag.rollbacks(), vec![1]);

    let hits = diag.watch_hits();
    assert!(
        hits.iter().any(|h| h.address == p + 64 && h.thread == ThreadId::MAIN),
        "replayed overflow write should hit the watchpoint: {hits:?}"
    );
    assert!(hits[0].site.file.ends_with("epoch_scenarios_test.rs"));
}

#[test]
fn overflow_skipped_in_replay_commits() {
    let (engine, diag) = engine(EngineConfig::new());
    let summary = engine
        .run(step_fn(|cx| {
            let p = cx.malloc(64)?;
            if !cx.is_replaying() {
                cx.write_u64(p + 64, 0)?;
            }
            cx.free(p)?;
            Ok(Step::Exit(5))
        }))
        .expect("replay is clean");

    assert_eq!(summary.exit_value, 5);
    assert_eq!(summary.metrics.rollbacks, 1);
    assert_eq!(summary.metrics.commits, 1);
    assert_eq!(diag.reports_of(CorruptionKind::Overflow).len(), 1);
    assert!(diag.watch_hits().is_empty());
}

#[test]
fn use_after_free_in_worker_is_reported_with_both_sites() {
    let (engine, diag) = engine(EngineConfig::new());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let observer = Arc::clone(&seen);
    let worker = step_fn(move |cx| {
        let p = cx.malloc(48)?;
        observer.lock().push(p);
        cx.free(p)?;
        cx.write_u64(p + 8, 7)?;
        Ok(Step::Exit(0))
    });
    let mut stage = 0;
    let err = engine
        .run(step_fn(move |cx| {
            stage += 1;
            Ok(match (stage, cx.outcome()) {
                (1, _) => Step::Spawn(Box::new(worker.clone())),
                (2, Outcome::Spawned(t)) => Step::Join(t),
                _ => Step::Exit(0),
            })
        }))
        .unwrap_err();

    assert!(matches!(err, EngineError::RepeatedCorruption { .. }), "{err}");
    let p = seen.lock()[0];
    let uaf = diag.reports_of(CorruptionKind::UseAfterFree);
    assert!(!uaf.is_empty());
    assert_eq!(uaf[0].address, p + 8);
    assert_eq!(uaf[0].object_start, Some(p));
    assert_eq!(uaf[0].thread, Some(ThreadId(1)));
    assert!(uaf[0].alloc_site.is_some());
    assert!(uaf[0].free_site.is_some());
    assert_eq!(uaf[0].value, Some(7));
    assert!(
        diag.watch_hits()
            .iter()
            .any(|h| h.address == p + 8 && h.thread == ThreadId(1))
    );
}

#[test]
fn quarantine_eviction_detects_use_after_free() {
    let (engine, diag) = engine(EngineConfig::new().with_quarantine(1, 1 << 20));
    let summary = engine
        .run(step_fn(|cx| {
            let p = cx.malloc(48)?;
            cx.free(p)?;
            if !cx.is_replaying() {
                cx.write_u64(p, 1)?;
            }
            let q = cx.malloc(48)?;
            cx.free(q)?;
            Ok(Step::Exit(0))
        }))
        .expect("replay is clean");

    assert_eq!(summary.metrics.rollbacks, 1);
    assert!(summary.metrics.uaf_detections >= 1);
    let uaf = diag.reports_of(CorruptionKind::UseAfterFree);
    assert_eq!(uaf.len(), 1);
    assert_eq!(uaf[0].value, Some(1));
}

#[test]
fn quarantine_is_fifo_and_evicted_blocks_are_reused() {
    let (engine, diag) = engine(EngineConfig::new().with_quarantine(4, 1 << 20));
    let reused = Arc::new(Mutex::new(None));
    let observer = Arc::clone(&reused);
    let summary = engine
        .run(step_fn(move |cx| {
            let blocks = (0..5)
                .map(|_| cx.malloc(32))
                .collect::<Result<Vec<_>, _>>()?;
            for &b in &blocks {
                cx.free(b)?;
            }
            let again = cx.malloc(32)?;
            *observer.lock() = Some((blocks[0], again));
            cx.free(again)?;
            Ok(Step::Exit(0))
        }))
        .expect("clean run");

    let (first, again) = reused.lock().expect("body ran");
    assert_eq!(first, again, "the oldest quarantined block is released first");
    assert!(summary.metrics.quarantine_evictions >= 1);
    assert!(diag.reports().is_empty());
}

#[test]
fn unreachable_allocation_is_reported_as_leak() {
    let (engine, diag) = engine(EngineConfig::new());
    let leaked = Arc::new(Mutex::new(None));
    let observer = Arc::clone(&leaked);
    let summary = engine
        .run(step_fn(move |cx| {
            let kept = cx.malloc(24)?;
            let root = cx.global(0);
            cx.write_u64(root, kept as u64)?;
            let (lost, line) = (cx.malloc(100)?, line!());
            *observer.lock() = Some((lost, line));
            Ok(Step::Exit(0))
        }))
        .expect("leaks do not fail the run");

    let (lost, line) = leaked.lock().expect("body ran");
    assert_eq!(summary.metrics.leaks, 1);
    assert_eq!(summary.metrics.rollbacks, 0);
    let leaks = diag.reports_of(CorruptionKind::Leak);
    assert_eq!(leaks.len(), 1);
    assert_eq!(leaks[0].address, lost);
    assert_eq!(leaks[0].object_size, Some(100));
    let site = leaks[0].alloc_site.expect("allocation site");
    assert_eq!(site.line, line);
    assert!(site.file.ends_with("epoch_scenarios_test.rs"));
}

#[test]
fn exhausted_slots_are_reaped_by_a_commit() {
    let (engine, _) = engine(EngineConfig::new().with_max_threads(4));
    let child = step_fn(|_cx| Ok(Step::Exit(1)));
    let mut stage = 0;
    let mut joined = 0;
    let summary = engine
        .run(step_fn(move |cx| {
            stage += 1;
            match cx.outcome() {
                Outcome::Spawned(t) => return Ok(Step::Join(t)),
                Outcome::Joined(v) => joined += v,
                _ => {}
            }
            Ok(if stage < 9 {
                Step::Spawn(Box::new(child.clone()))
            } else {
                assert_eq!(joined, 4);
                Step::Exit(joined)
            })
        }))
        .expect("slot exhaustion is recovered by reaping");

    assert_eq!(summary.exit_value, 4);
    assert_eq!(summary.metrics.reaped_threads, 3);
    assert!(summary.epochs >= 2);
}

#[test]
fn unjoined_threads_exhaust_slots() {
    let (engine, _) = engine(EngineConfig::new().with_max_threads(2));
    let child = step_fn(|_cx| Ok(Step::Exit(0)));
    let mut spawned = 0;
    let err = engine
        .run(step_fn(move |_cx| {
            spawned += 1;
            Ok(if spawned <= 2 {
                Step::Spawn(Box::new(child.clone()))
            } else {
                Step::Exit(0)
            })
        }))
        .unwrap_err();
    assert!(matches!(err, EngineError::ThreadSlotExhausted { max: 2 }), "{err}");
}

fn counting_worker(m: MutexId, iterations: u64) -> impl epochguard_core::ThreadBody {
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

#[test]
fn replay_reproduces_lock_order() {
    const WORKERS: usize = 3;
    const ITERATIONS: u64 = 20;

    let (engine, diag) = engine(EngineConfig::new());
    let m = engine.create_mutex();
    let orders = Arc::new(Mutex::new(Vec::new()));
    let observer = Arc::clone(&orders);
    let mut stage = 0;
    let mut workers: Vec<ThreadId> = Vec::new();
    let summary = engine
        .run(step_fn(move |cx| {
            if let Outcome::Spawned(t) = cx.outcome() {
                workers.push(t);
            }
            stage += 1;
            if stage <= WORKERS {
                return Ok(Step::Spawn(Box::new(counting_worker(m, ITERATIONS))));
            }
            if stage <= 2 * WORKERS {
                return Ok(Step::Join(workers[stage - WORKERS - 1]));
            }
            let total = cx.read_u64(cx.global(0))?;
            let order = (0..total)
                .map(|i| cx.read_u64(cx.global(8 + 8 * i as usize)))
                .collect::<Result<Vec<_>, _>>()?;
            observer.lock().push(order);

            let q = cx.malloc(16)?;
            if !cx.is_replaying() {
                cx.write_u64(q + 16, 0)?;
            }
            cx.free(q)?;
            Ok(Step::Exit(total))
        }))
        .expect("replay is clean");

    let orders = orders.lock().clone();
    assert_eq!(orders.len(), 2);
    assert_eq!(orders[0].len(), WORKERS * ITERATIONS as usize);
    assert_eq!(orders[0], orders[1], "replay must follow the recorded lock order");
    for t in 1..=WORKERS as u64 {
        let count = orders[0].iter().filter(|&&w| w == t).count();
        assert_eq!(count, ITERATIONS as usize, "worker {t}");
    }
    assert_eq!(summary.exit_value, WORKERS as u64 * ITERATIONS);
    assert_eq!(summary.metrics.rollbacks, 1);
    assert!(summary.metrics.replayed_events >= WORKERS as u64 * ITERATIONS);
    assert_eq!(diag.rollbacks(), vec![1]);
}

#[test]
fn barrier_round_has_one_serial_party() {
    let (engine, _) = engine(EngineConfig::new());
    let b = engine.create_barrier(3).expect("barrier");
    let serials = Arc::new(Mutex::new(0));
    let party = {
        let serials = Arc::clone(&serials);
        let mut waited = false;
        step_fn(move |cx| {
            if let Outcome::BarrierPassed { serial } = cx.outcome() {
                *serials.lock() += usize::from(serial);
            }
            if waited {
                return Ok(Step::Exit(0));
            }
            waited = true;
            Ok(Step::Barrier(b))
        })
    };
    let mut stage = 0;
    let mut kids = Vec::new();
    let mut main_party = party.clone();
    engine
        .run(step_fn(move |cx| {
            stage += 1;
            if let Outcome::Spawned(t) = cx.outcome() {
                kids.push(t);
            }
            match stage {
                1 | 2 => Ok(Step::Spawn(Box::new(party.clone()))),
                3 | 4 => epochguard_core::ThreadBody::step(&mut main_party, cx)
                    .map(|s| if matches!(s, Step::Exit(_)) { Step::Join(kids[0]) } else { s }),
                5 => Ok(Step::Join(kids[1])),
                _ => Ok(Step::Exit(0)),
            }
        }))
        .expect("clean run");
    assert_eq!(*serials.lock(), 1);
}

#[test]
fn try_lock_reports_busy_mutex() {
    let (engine, _) = engine(EngineConfig::new());
    let m = engine.create_mutex();
    let results = Arc::new(Mutex::new(Vec::new()));
    let observer = Arc::clone(&results);
    let prober = step_fn(move |cx| {
        if let Outcome::TryLocked(acquired) = cx.outcome() {
            observer.lock().push(acquired);
            return Ok(Step::Exit(0));
        }
        Ok(Step::TryLock(m))
    });
    let mut stage = 0;
    engine
        .run(step_fn(move |cx| {
            stage += 1;
            Ok(match (stage, cx.outcome()) {
                (1, _) => Step::Lock(m),
                (2, _) => Step::Spawn(Box::new(prober.clone())),
                (3, Outcome::Spawned(t)) => Step::Join(t),
                _ => {
                    cx.unlock(m)?;
                    Step::Exit(0)
                }
            })
        }))
        .expect("clean run");
    assert_eq!(*results.lock(), vec![false]);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Seen {
    TryLocked(bool),
    Passed { serial: bool },
}

type SeenLog = Arc<Mutex<Vec<(usize, bool, Seen)>>>;

/// Try-locks once (busy: main holds the mutex), waits at the barrier, then
/// try-locks until it gets the mutex.
fn trier(m: MutexId, b: BarrierId, seen: SeenLog) -> impl epochguard_core::ThreadBody {
    let mut passed = false;
    step_fn(move |cx| {
        let me = cx.thread().index();
        let replaying = cx.is_replaying();
        match cx.outcome() {
            Outcome::TryLocked(acquired) => {
                seen.lock().push((me, replaying, Seen::TryLocked(acquired)));
                if acquired {
                    cx.unlock(m)?;
                    return Ok(Step::Exit(0));
                }
                if !passed {
                    return Ok(Step::Barrier(b));
                }
            }
            Outcome::BarrierPassed { serial } => {
                passed = true;
                seen.lock().push((me, replaying, Seen::Passed { serial }));
            }
            _ => {}
        }
        Ok(Step::TryLock(m))
    })
}

#[test]
fn try_lock_results_and_barrier_serial_replay_verbatim() {
    const TRIERS: usize = 3;

    let (engine, diag) = engine(EngineConfig::new());
    let m = engine.create_mutex();
    let b = engine.create_barrier(TRIERS + 1).expect("barrier");
    let seen: SeenLog = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&seen);
    let mut stage = 0;
    let mut kids: Vec<ThreadId> = Vec::new();
    let summary = engine
        .run(step_fn(move |cx| {
            match cx.outcome() {
                Outcome::Spawned(t) => kids.push(t),
                Outcome::BarrierPassed { serial } => {
                    log.lock()
                        .push((0, cx.is_replaying(), Seen::Passed { serial }));
                }
                _ => {}
            }
            stage += 1;
            match stage {
                1 => Ok(Step::Lock(m)),
                2..=4 => Ok(Step::Spawn(Box::new(trier(m, b, Arc::clone(&log))))),
                5 => Ok(Step::Barrier(b)),
                6 => {
                    cx.unlock(m)?;
                    Ok(Step::Join(kids[0]))
                }
                7 | 8 => Ok(Step::Join(kids[stage - 6])),
                _ => {
                    let q = cx.malloc(32)?;
                    if !cx.is_replaying() {
                        cx.write_u64(q + 32, 0)?;
                    }
                    cx.free(q)?;
                    Ok(Step::Exit(0))
                }
            }
        }))
        .expect("replay is clean");

    assert_eq!(summary.metrics.rollbacks, 1);
    assert_eq!(diag.rollbacks(), vec![1]);

    let seen = seen.lock().clone();
    let of = |thread: usize, replaying: bool| -> Vec<Seen> {
        seen.iter()
            .filter(|&&(t, r, _)| t == thread && r == replaying)
            .map(|&(_, _, s)| s)
            .collect()
    };
    for replaying in [false, true] {
        let serials = (0..=TRIERS)
            .flat_map(|t| of(t, replaying))
            .filter(|s| *s == Seen::Passed { serial: true })
            .count();
        assert_eq!(serials, 1, "replaying={replaying}");
    }
    for t in 0..=TRIERS {
        let live = of(t, false);
        let replay = of(t, true);
        assert!(!live.is_empty(), "thread {t}");
        assert_eq!(live, replay, "thread {t} saw different results in replay");
        if t > 0 {
            assert_eq!(live[0], Seen::TryLocked(false), "thread {t}: main held the mutex");
            assert_eq!(live.last(), Some(&Seen::TryLocked(true)), "thread {t}");
        }
    }
}

#[test]
fn oversized_requests_are_reported_as_exhaustion() {
    let (engine, diag) = engine(EngineConfig::new());
    let summary = engine
        .run(step_fn(|cx| {
            for size in [usize::MAX - 3, usize::MAX / 2 + 1] {
                match cx.malloc(size) {
                    Err(EngineError::AllocatorExhausted { requested, .. }) => {
                        assert_eq!(requested, size);
                    }
                    other => panic!("size={size:#x}: {other:?}"),
                }
            }
            assert!(matches!(
                cx.calloc(usize::MAX / 2, 4),
                Err(EngineError::AllocatorExhausted { .. })
            ));
            let p = cx.malloc(64)?;
            cx.free(p)?;
            Ok(Step::Exit(0))
        }))
        .expect("exhaustion is returned to the caller");

    assert_eq!(summary.metrics.rollbacks, 0);
    assert!(diag.reports().is_empty());
}
