//! Engine state, epoch transitions, and the per-thread run loop.
//!
//! [`Engine::initialize`] builds every component once and opens epoch 1.
//! [`Engine::run`] executes the main [`ThreadBody`] on the calling thread;
//! spawned bodies get their own OS threads. Every thread runs the same
//! loop: at each safe point it parks if an epoch end is in progress, then
//! either carries out its pending blocking call or steps its body.
//!
//! The thread that ends an epoch (explicit commit, slot exhaustion, a
//! detection, or program exit) coordinates it: it waits for every other
//! active thread to park, runs the detectors, and either commits and
//! begins the next epoch or rolls every component back to the last epoch
//! begin and releases the threads into replay.

use std::collections::HashSet;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::allocator::HeapAllocator;
use crate::bitmap::{CorruptionBitmap, SENTINEL_WORD};
use crate::config::{EngineConfig, FatalAction, WriteTracking};
use crate::context::ThreadContext;
use crate::diagnostics::{CorruptionKind, CorruptionReport, DiagnosticsBackend, WatchHit};
use crate::epoch::{Begin, EpochController, Phase, Verdict};
use crate::error::EngineError;
use crate::execution::{BodyClone, Execution, Outcome, PendingCall, SavedExecutionState, ThreadBody};
use crate::fault::{self, TrapRegistration};
use crate::leak::find_leaks;
use crate::metrics::{EngineMetrics, MetricsSnapshot};
use crate::quarantine::{Admission, FreedMemory, QuarantineEntry, QuarantineList, UafHit};
use crate::region::{MemoryRegion, WORD_SIZE};
use crate::sync::{BarrierId, MutexId, Recorder, SyncTable, Wait};
use crate::sync_log::{EventKind, SyncEvent, SyncEventList};
use crate::thread_registry::{ThreadControlBlock, ThreadId, ThreadRegistry, ThreadStatus};
use crate::tracking::CallSite;

/// Result of one attempt at a blocking call.
enum Perform {
    Done(Outcome),
    /// A stop request arrived; retry after the safe point.
    Interrupted,
    /// The call needs an epoch end before it can finish.
    NeedCommit,
}

/// How a tracked call proceeds during replay.
enum Replay {
    /// Normal execution: perform and record.
    Live,
    /// The recorded event for this call; the thread holds its turn.
    Turn(Arc<SyncEvent>),
    /// The thread's recorded events ran out: perform without recording.
    Exhausted,
    Interrupted,
}

enum Flow {
    Continue,
    Return(Option<u64>),
}

/// Apply an epoch-end verdict to a thread's execution. Returns false once
/// the thread should stop.
fn settle(verdict: Verdict, exec: &mut Execution, saved: &mut SavedExecutionState) -> bool {
    match verdict {
        Verdict::Committed => {
            *saved = SavedExecutionState::capture(exec);
            true
        }
        Verdict::RolledBack => {
            *exec = saved.resume();
            true
        }
        Verdict::Finished | Verdict::Halted => false,
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

/// Heap access used by the quarantine.
struct FreedHeap<'a> {
    heap: &'a HeapAllocator,
    /// Releasing thread; `None` while every thread is stopped.
    by: Option<usize>,
}

impl FreedMemory for FreedHeap<'_> {
    fn fill_sentinel(&self, start: usize, words: usize) -> Result<(), EngineError> {
        let region = self.heap.region();
        for i in 0..words {
            region.write_word(start + i * WORD_SIZE, SENTINEL_WORD, self.by)?;
        }
        Ok(())
    }

    fn word(&self, addr: usize) -> u64 {
        self.heap.region().load_word(addr)
    }

    fn release(&self, entry: &QuarantineEntry) -> Result<(), EngineError> {
        self.heap.release(entry.raw, self.by)
    }
}

// ---------------------------------------------------------------------------
// Engine state
// ---------------------------------------------------------------------------

/// Every engine component, shared by all threads of one run.
pub struct EngineState {
    pub(crate) config: EngineConfig,
    pub(crate) globals: Arc<MemoryRegion>,
    pub(crate) heap: HeapAllocator,
    pub(crate) registry: ThreadRegistry,
    pub(crate) sync: SyncTable,
    pub(crate) controller: EpochController,
    diagnostics: Arc<dyn DiagnosticsBackend>,
    metrics: EngineMetrics,
    /// Detections made between epoch ends, deduplicated by address.
    detections: Mutex<Vec<CorruptionReport>>,
    detected: AtomicBool,
    /// Words corrupted before the last rollback.
    watches: RwLock<Vec<usize>>,
    spawn_lock: Mutex<()>,
    failure: Mutex<Option<EngineError>>,
}

impl EngineState {
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.controller.epoch()
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        self.controller.phase()
    }

    fn new_quarantine(&self) -> QuarantineList {
        QuarantineList::new(self.config.quarantine_entries, self.config.quarantine_bytes)
    }

    /// Region holding `[addr, addr + len)`.
    pub(crate) fn region_for(&self, addr: usize, len: usize) -> Result<&MemoryRegion, EngineError> {
        let len = len.max(1);
        [self.heap.region(), &*self.globals]
            .into_iter()
            .find(|r| r.contains_range(addr, len))
            .ok_or(EngineError::AddressOutOfRange { address: addr })
    }

    /// Report writes that touch a watched word.
    pub(crate) fn note_write(&self, thread: ThreadId, addr: usize, len: usize, site: CallSite) {
        let watches = self.watches.read();
        for &word in watches.iter() {
            if word < addr + len && addr < word + WORD_SIZE {
                self.diagnostics.on_watch_hit(&WatchHit {
                    address: word,
                    thread,
                    epoch: self.controller.epoch(),
                    site,
                });
            }
        }
    }

    fn fail(&self, err: EngineError) {
        tracing::error!(epoch = self.controller.epoch(), error = %err, "engine halted");
        {
            let mut failure = self.failure.lock();
            if failure.is_none() {
                *failure = Some(err);
            }
        }
        self.controller.halt();
    }

    fn take_failure(&self) -> Option<EngineError> {
        self.failure.lock().take()
    }

    // -----------------------------------------------------------------------
    // Detection
    // -----------------------------------------------------------------------

    fn object_report(
        &self,
        kind: CorruptionKind,
        address: usize,
        value: Option<u64>,
        object_start: Option<usize>,
        epoch: u64,
    ) -> CorruptionReport {
        let rec = self.heap.objects().enclosing(address);
        CorruptionReport {
            kind,
            address,
            object_start: rec.map(|r| r.start).or(object_start),
            object_size: rec.map(|r| r.size),
            value,
            thread: rec.map(|r| ThreadId(r.thread)),
            alloc_site: rec.map(|r| r.alloc_site),
            free_site: rec.and_then(|r| r.free_site),
            epoch,
        }
    }

    fn uaf_report(&self, hit: &UafHit, epoch: u64) -> CorruptionReport {
        let mut report = self.object_report(
            CorruptionKind::UseAfterFree,
            hit.address,
            Some(hit.value),
            Some(hit.entry.start),
            epoch,
        );
        report.object_size.get_or_insert(hit.entry.size);
        report
    }

    /// Queue a detection for the next epoch end.
    fn detect(&self, report: CorruptionReport) {
        tracing::debug!(
            kind = %report.kind,
            address = format_args!("{:#x}", report.address),
            epoch = report.epoch,
            "detection queued"
        );
        let mut pending = self.detections.lock();
        if !pending
            .iter()
            .any(|r| r.kind == report.kind && r.address == report.address)
        {
            pending.push(report);
        }
        self.detected.store(true, Ordering::Release);
    }

    /// Free path: canary check, tracking, then quarantine or release.
    pub(crate) fn free(
        &self,
        tcb: &ThreadControlBlock,
        ptr: usize,
        site: CallSite,
    ) -> Result<(), EngineError> {
        let idx = tcb.index();
        let rec = self
            .heap
            .resolve(ptr)
            .filter(|rec| !rec.is_freed())
            .ok_or(EngineError::InvalidFree { address: ptr })?;
        let epoch = self.controller.epoch();

        if self.config.detectors.overflow {
            let scan = self.heap.check(&rec);
            EngineMetrics::add(&self.metrics.canary_checks, scan.checked as u64);
            EngineMetrics::add(&self.metrics.canary_failures, scan.faults.len() as u64);
            for fault in &scan.faults {
                self.detect(self.object_report(
                    CorruptionKind::Overflow,
                    fault.address,
                    Some(fault.value),
                    fault.object_start,
                    epoch,
                ));
            }
        }

        self.heap.objects().mark_freed(rec.raw, site);
        self.heap.unmark(&rec);
        if !self.config.detectors.use_after_free {
            return self.heap.release(rec.raw, Some(idx));
        }

        let entry = QuarantineEntry {
            raw: rec.raw,
            start: rec.start,
            size: rec.size,
        };
        let mem = FreedHeap {
            heap: &self.heap,
            by: Some(idx),
        };
        let admission = tcb.quarantine.lock().add_free_object(entry, &mem)?;
        match admission {
            Admission::Quarantined { evicted } => {
                EngineMetrics::add(&self.metrics.quarantine_evictions, evicted.len() as u64);
            }
            Admission::TooLarge => self.heap.release(rec.raw, Some(idx))?,
            Admission::UseAfterFree(hit) => {
                EngineMetrics::inc(&self.metrics.uaf_detections);
                self.detect(self.uaf_report(&hit, epoch));
            }
        }
        Ok(())
    }

    fn collect_reports(
        &self,
        epoch: u64,
        end_of_program: bool,
    ) -> Result<Vec<CorruptionReport>, EngineError> {
        let mut reports = std::mem::take(&mut *self.detections.lock());
        self.detected.store(false, Ordering::Release);

        if self.config.detectors.overflow {
            let scan = self.heap.check_all();
            EngineMetrics::add(&self.metrics.canary_checks, scan.checked as u64);
            EngineMetrics::add(&self.metrics.canary_failures, scan.faults.len() as u64);
            reports.extend(scan.faults.iter().map(|f| {
                self.object_report(
                    CorruptionKind::Overflow,
                    f.address,
                    Some(f.value),
                    f.object_start,
                    epoch,
                )
            }));
        }

        if end_of_program && self.config.detectors.use_after_free {
            let mem = FreedHeap {
                heap: &self.heap,
                by: None,
            };
            for tcb in self.registry.alive() {
                let hits = tcb.quarantine.lock().final_uaf_check(&mem)?;
                EngineMetrics::add(&self.metrics.uaf_detections, hits.len() as u64);
                reports.extend(hits.iter().map(|hit| self.uaf_report(hit, epoch)));
            }
        }

        let mut seen = HashSet::new();
        reports.retain(|r| seen.insert((r.kind, r.address)));
        Ok(reports)
    }

    fn report_leaks(&self, epoch: u64) {
        if !self.config.detectors.leak {
            return;
        }
        let leaks = find_leaks(&self.globals, self.heap.region(), self.heap.objects());
        if leaks.is_empty() {
            return;
        }
        for rec in &leaks {
            self.diagnostics.report_corruption(&CorruptionReport {
                kind: CorruptionKind::Leak,
                address: rec.start,
                object_start: Some(rec.start),
                object_size: Some(rec.size),
                value: None,
                thread: Some(ThreadId(rec.thread)),
                alloc_site: Some(rec.alloc_site),
                free_site: None,
                epoch,
            });
        }
        EngineMetrics::add(&self.metrics.leaks, leaks.len() as u64);
        let err = EngineError::MemoryLeakDetected { count: leaks.len() };
        tracing::warn!(epoch, count = leaks.len(), "{err}");
    }

    // -----------------------------------------------------------------------
    // Epoch transitions
    // -----------------------------------------------------------------------

    /// End the current epoch. Returns how it was resolved for the caller.
    pub(crate) fn end_epoch(&self, idx: usize, end_of_program: bool) -> Result<Verdict, EngineError> {
        loop {
            match self.controller.try_begin_end(idx) {
                Begin::Coordinator => return self.coordinate(idx, end_of_program),
                Begin::Terminal(verdict) => return Ok(verdict),
                Begin::Busy => {
                    if let Some(verdict) = self.controller.park(idx) {
                        return Ok(verdict);
                    }
                }
            }
        }
    }

    fn coordinate(&self, idx: usize, end_of_program: bool) -> Result<Verdict, EngineError> {
        let epoch = self.controller.epoch();
        self.controller
            .wait_rendezvous(|parked| self.report_stragglers(idx, parked, epoch));
        tracing::debug!(epoch, thread = idx, end_of_program, "all threads stopped");
        let result = self.resolve_epoch(epoch, end_of_program);
        if result.is_err() {
            self.controller.halt();
        }
        result
    }

    fn report_stragglers(&self, idx: usize, parked: u64, epoch: u64) {
        for tcb in self.registry.alive() {
            let t = tcb.index();
            if t == idx || parked & (1u64 << (t % 64)) != 0 || !tcb.status().is_active() {
                continue;
            }
            let err = EngineError::SignalDeliveryFailure { thread: t };
            tracing::warn!(epoch, thread = t, "{err}; still waiting");
        }
    }

    fn resolve_epoch(&self, epoch: u64, end_of_program: bool) -> Result<Verdict, EngineError> {
        let reports = self.collect_reports(epoch, end_of_program)?;
        if !reports.is_empty() {
            tracing::warn!(epoch, count = reports.len(), "corruption found at epoch end");
            for report in &reports {
                self.diagnostics.report_corruption(report);
            }
            return self.rollback(epoch, &reports);
        }

        self.commit(epoch);
        let verdict = if end_of_program {
            self.report_leaks(epoch);
            Verdict::Finished
        } else {
            self.epoch_begin()?;
            Verdict::Committed
        };
        self.controller.release(verdict);
        Ok(verdict)
    }

    fn commit(&self, epoch: u64) {
        let heap = self.heap.region().check_and_commit();
        let globals = self.globals.check_and_commit();
        let pages = heap.pages + globals.pages;
        let words = heap.words + globals.words;
        EngineMetrics::inc(&self.metrics.commits);
        EngineMetrics::add(&self.metrics.dirty_pages, pages as u64);
        EngineMetrics::add(&self.metrics.committed_words, words as u64);
        tracing::debug!(epoch, pages, words, "epoch committed");
    }

    /// Open a new epoch. Runs with every other thread parked.
    fn epoch_begin(&self) -> Result<u64, EngineError> {
        let mut reaped = 0u64;
        for tcb in self.registry.alive() {
            if tcb.status() == ThreadStatus::WaitForReaping {
                tcb.set_status(ThreadStatus::Exiting);
                if let Some(handle) = tcb.take_handle()
                    && handle.join().is_err()
                {
                    tracing::warn!(thread = tcb.index(), "reaped thread panicked");
                }
                self.registry.remove_alive_thread(tcb.index());
                reaped += 1;
                continue;
            }
            tcb.update(|s| {
                s.newly_spawned = false;
                if s.status.is_finished() {
                    s.finished_committed = true;
                }
            });
        }
        EngineMetrics::add(&self.metrics.reaped_threads, reaped);

        let drained = self.heap.drain_deferred();
        self.sync.clear_logs();
        for tcb in self.registry.alive() {
            tcb.events.clear();
            tcb.quarantine.lock().backup();
        }
        self.sync.snapshot();
        self.heap.backup();
        self.heap.region().begin_epoch()?;
        self.globals.begin_epoch()?;
        self.watches.write().clear();

        let epoch = self.controller.advance_epoch();
        EngineMetrics::inc(&self.metrics.epochs);
        tracing::debug!(epoch, reaped, drained, "epoch begin");
        Ok(epoch)
    }

    fn rollback(&self, epoch: u64, reports: &[CorruptionReport]) -> Result<Verdict, EngineError> {
        if self.controller.note_rollback() {
            tracing::error!(
                epoch,
                action = ?self.config.fatal_action,
                "corruption detected again after rollback"
            );
            if self.config.fatal_action == FatalAction::Abort {
                std::process::abort();
            }
            return Err(EngineError::RepeatedCorruption { epoch });
        }

        let heap_pages = self.heap.region().rollback()?;
        let global_pages = self.globals.rollback()?;
        self.heap.restore();
        self.sync.restore();

        for tcb in self.registry.alive() {
            tcb.quarantine.lock().restore();
            let resurrect = tcb.update(|s| {
                s.joined = false;
                s.joiner = None;
                if s.newly_spawned {
                    s.gate_open = false;
                }
                if !s.status.is_finished() {
                    return false;
                }
                if s.finished_committed {
                    s.status = ThreadStatus::WaitForJoining;
                    false
                } else {
                    s.status = ThreadStatus::Rollback;
                    s.exit_value = None;
                    true
                }
            });
            if resurrect {
                self.controller.thread_started();
            }
        }

        self.registry.prepare_rollback();
        self.sync.prepare_replay();
        self.sync.for_each_var(|var| {
            if let Some(head) = var.head()
                && let Some(owner) = self.registry.get(head.thread)
            {
                owner.events.offer(&head);
            }
        });

        {
            let mut watches = self.watches.write();
            watches.clear();
            watches.extend(
                reports
                    .iter()
                    .filter(|r| r.kind != CorruptionKind::Leak)
                    .map(|r| r.address & !(WORD_SIZE - 1)),
            );
        }

        EngineMetrics::inc(&self.metrics.rollbacks);
        tracing::warn!(epoch, heap_pages, global_pages, "epoch rolled back; replaying");
        self.diagnostics.on_rollback(epoch);
        self.controller.release(Verdict::RolledBack);
        Ok(Verdict::RolledBack)
    }

    // -----------------------------------------------------------------------
    // Thread run loop
    // -----------------------------------------------------------------------

    fn worker_main(self: Arc<Self>, tcb: Arc<ThreadControlBlock>, body: Box<dyn ThreadBody>) {
        let idx = tcb.index();
        let result = catch_unwind(AssertUnwindSafe(|| {
            self.run_thread(&tcb, Execution::new(body, false))
        }));
        match result {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => self.fail(err),
            Err(panic) => self.fail(EngineError::ThreadFault {
                thread: idx,
                message: panic_message(&*panic),
            }),
        }
        tracing::debug!(thread = idx, "thread runner exited");
    }

    /// Run one thread until the program ends, the engine halts, or (for a
    /// worker) the thread is reaped. Returns the main thread's exit value.
    fn run_thread(
        self: &Arc<Self>,
        tcb: &Arc<ThreadControlBlock>,
        mut exec: Execution,
    ) -> Result<Option<u64>, EngineError> {
        let idx = tcb.index();
        let interrupted = || self.controller.stop_requested();
        let mut saved = SavedExecutionState::capture(&exec);

        loop {
            // Safe point.
            if self.controller.stop_requested()
                && let Some(verdict) = self.controller.park(idx)
            {
                if !settle(verdict, &mut exec, &mut saved) {
                    return Ok(None);
                }
                continue;
            }
            if self.detected.load(Ordering::Acquire) {
                let verdict = self.end_epoch(idx, false)?;
                if !settle(verdict, &mut exec, &mut saved) {
                    return Ok(None);
                }
                continue;
            }

            if !exec.gated {
                if tcb
                    .wait_until(|s| s.gate_open.then_some(()), &interrupted)
                    .is_some()
                {
                    exec.gated = true;
                    tcb.set_status(ThreadStatus::Running);
                }
                continue;
            }

            let Some(mut call) = exec.pending.take() else {
                let outcome = std::mem::take(&mut exec.outcome);
                let mut cx = ThreadContext::new(self, tcb, outcome);
                let step = exec.body.step(&mut cx)?;
                exec.steps += 1;
                exec.pending = PendingCall::from_step(step);
                continue;
            };

            if let PendingCall::Exit(value) = call {
                exec.pending = Some(call);
                let flow = if idx == ThreadId::MAIN.index() {
                    self.finish_main(value, &mut exec, &mut saved)?
                } else {
                    self.finish_worker(tcb, value, &mut exec, &saved)
                };
                match flow {
                    Flow::Continue => continue,
                    Flow::Return(value) => return Ok(value),
                }
            }

            let commit = matches!(call, PendingCall::Commit);
            match self.perform(tcb, &mut call)? {
                Perform::Done(outcome) => exec.outcome = outcome,
                Perform::Interrupted => exec.pending = Some(call),
                Perform::NeedCommit => {
                    exec.pending = Some(call);
                    let verdict = self.end_epoch(idx, false)?;
                    if commit && verdict == Verdict::Committed {
                        exec.pending = None;
                        exec.outcome = Outcome::Committed;
                    }
                    if !settle(verdict, &mut exec, &mut saved) {
                        return Ok(None);
                    }
                }
            }
        }
    }

    fn finish_main(
        &self,
        value: u64,
        exec: &mut Execution,
        saved: &mut SavedExecutionState,
    ) -> Result<Flow, EngineError> {
        let verdict = self.end_epoch(ThreadId::MAIN.index(), true)?;
        if verdict == Verdict::Finished {
            tracing::info!(epoch = self.controller.epoch(), value, "program finished");
            return Ok(Flow::Return(Some(value)));
        }
        Ok(if settle(verdict, exec, saved) {
            Flow::Continue
        } else {
            Flow::Return(None)
        })
    }

    /// A worker's body returned. The thread stays parked off the rendezvous
    /// until it is reaped or a rollback resurrects it.
    fn finish_worker(
        &self,
        tcb: &ThreadControlBlock,
        value: u64,
        exec: &mut Execution,
        saved: &SavedExecutionState,
    ) -> Flow {
        tcb.update(|s| {
            s.exit_value = Some(value);
            s.status = ThreadStatus::WaitForJoining;
        });
        self.controller.thread_finished();
        tracing::debug!(
            thread = tcb.index(),
            epoch = self.controller.epoch(),
            value,
            "thread finished"
        );

        let resurrected = tcb.wait_until(
            |s| match s.status {
                ThreadStatus::Rollback => Some(true),
                ThreadStatus::Exiting => Some(false),
                _ => None,
            },
            &|| self.controller.phase().is_terminal(),
        );
        if resurrected == Some(true) {
            *exec = saved.resume();
            tcb.set_status(ThreadStatus::Running);
            tracing::debug!(thread = tcb.index(), "thread resurrected for replay");
            Flow::Continue
        } else {
            Flow::Return(None)
        }
    }

    fn perform(
        self: &Arc<Self>,
        tcb: &Arc<ThreadControlBlock>,
        call: &mut PendingCall,
    ) -> Result<Perform, EngineError> {
        match call {
            PendingCall::Lock { id, turn_taken } => self.lock(tcb, *id, turn_taken),
            PendingCall::TryLock { id, turn_taken } => self.try_lock(tcb, *id, turn_taken),
            PendingCall::Barrier {
                id,
                turn_taken,
                arrived_gen,
                serial,
            } => self.barrier_wait(tcb, *id, turn_taken, arrived_gen, serial),
            PendingCall::Spawn {
                body,
                turn_taken,
                retried,
            } => self.spawn(tcb, &**body, turn_taken, retried),
            PendingCall::Join(target) => self.join(tcb, *target),
            // Epoch-ending calls are settled by the run loop.
            PendingCall::Commit | PendingCall::Exit(_) => Ok(Perform::NeedCommit),
        }
    }

    // -----------------------------------------------------------------------
    // Tracked synchronization
    // -----------------------------------------------------------------------

    fn recorder<'a>(&'a self, tcb: &'a ThreadControlBlock) -> Recorder<'a> {
        Recorder {
            log: &self.sync.log,
            thread_list: &tcb.events,
        }
    }

    /// Decide how a tracked call on `var` proceeds, waiting for the thread's
    /// recorded turn while replaying.
    fn replay_turn(
        &self,
        tcb: &ThreadControlBlock,
        var: &SyncEventList,
        kind: EventKind,
        turn_taken: &mut bool,
    ) -> Result<Replay, EngineError> {
        if !self.controller.is_replaying() {
            return Ok(Replay::Live);
        }
        let interrupted = || self.controller.stop_requested();
        let Some(event) = tcb.events.head() else {
            return Ok(if var.wait_drained(&interrupted) {
                Replay::Exhausted
            } else {
                Replay::Interrupted
            });
        };
        if event.var != var.key() || event.kind != kind {
            return Err(EngineError::SyncMisuse {
                thread: tcb.index(),
                what: "replay diverged from the recorded order",
            });
        }
        if !*turn_taken {
            if !tcb.events.wait_turn(&interrupted) {
                return Ok(Replay::Interrupted);
            }
            *turn_taken = true;
        }
        Ok(Replay::Turn(event))
    }

    /// Consume a replayed event and hand the variable's next event to its thread.
    fn finish_turn(&self, tcb: &ThreadControlBlock, var: &SyncEventList) {
        tcb.events.advance();
        if let Some(next) = var.advance()
            && let Some(owner) = self.registry.get(next.thread)
        {
            owner.events.offer(&next);
        }
        EngineMetrics::inc(&self.metrics.replayed_events);
    }

    fn lock(
        &self,
        tcb: &ThreadControlBlock,
        id: MutexId,
        turn_taken: &mut bool,
    ) -> Result<Perform, EngineError> {
        let idx = tcb.index();
        let mutex = self.sync.mutex(id, idx)?;
        let interrupted = || self.controller.stop_requested();
        let (rec, turn) = match self.replay_turn(tcb, &mutex.events, EventKind::Lock, turn_taken)? {
            Replay::Interrupted => return Ok(Perform::Interrupted),
            Replay::Live => (Some(self.recorder(tcb)), false),
            Replay::Exhausted => (None, false),
            Replay::Turn(_) => (None, true),
        };
        match mutex.lock(idx, rec, &interrupted)? {
            Wait::Interrupted => Ok(Perform::Interrupted),
            Wait::Ready(()) => {
                if turn {
                    self.finish_turn(tcb, &mutex.events);
                }
                Ok(Perform::Done(Outcome::Locked))
            }
        }
    }

    fn try_lock(
        &self,
        tcb: &ThreadControlBlock,
        id: MutexId,
        turn_taken: &mut bool,
    ) -> Result<Perform, EngineError> {
        let idx = tcb.index();
        let mutex = self.sync.mutex(id, idx)?;
        let interrupted = || self.controller.stop_requested();
        let event = match self.replay_turn(tcb, &mutex.events, EventKind::TryLock, turn_taken)? {
            Replay::Interrupted => return Ok(Perform::Interrupted),
            Replay::Live => {
                let acquired = mutex.try_acquire(idx, Some(self.recorder(tcb)));
                return Ok(Perform::Done(Outcome::TryLocked(acquired)));
            }
            Replay::Exhausted => {
                return Ok(Perform::Done(Outcome::TryLocked(mutex.try_acquire(idx, None))));
            }
            Replay::Turn(event) => event,
        };
        // The recorded result is replayed verbatim, including EBUSY.
        let acquired = event.ret == 0;
        if acquired && mutex.lock(idx, None, &interrupted)? == Wait::Interrupted {
            return Ok(Perform::Interrupted);
        }
        self.finish_turn(tcb, &mutex.events);
        Ok(Perform::Done(Outcome::TryLocked(acquired)))
    }

    fn barrier_wait(
        &self,
        tcb: &ThreadControlBlock,
        id: BarrierId,
        turn_taken: &mut bool,
        arrived_gen: &mut Option<u64>,
        serial: &mut bool,
    ) -> Result<Perform, EngineError> {
        let idx = tcb.index();
        let barrier = self.sync.barrier(id, idx)?;
        let generation = match *arrived_gen {
            Some(generation) => generation,
            None => {
                let (generation, last) =
                    match self.replay_turn(tcb, &barrier.events, EventKind::Barrier, turn_taken)? {
                        Replay::Interrupted => return Ok(Perform::Interrupted),
                        Replay::Live => barrier.arrive(idx, Some(self.recorder(tcb))),
                        Replay::Exhausted => barrier.arrive(idx, None),
                        Replay::Turn(_) => {
                            let arrival = barrier.arrive(idx, None);
                            self.finish_turn(tcb, &barrier.events);
                            arrival
                        }
                    };
                *arrived_gen = Some(generation);
                *serial = last;
                generation
            }
        };
        match barrier.wait_passed(generation, &|| self.controller.stop_requested()) {
            Wait::Ready(()) => Ok(Perform::Done(Outcome::BarrierPassed { serial: *serial })),
            Wait::Interrupted => Ok(Perform::Interrupted),
        }
    }

    fn spawn(
        self: &Arc<Self>,
        parent: &Arc<ThreadControlBlock>,
        body: &dyn ThreadBody,
        turn_taken: &mut bool,
        retried: &mut bool,
    ) -> Result<Perform, EngineError> {
        match self.replay_turn(parent, &self.sync.spawns, EventKind::Spawn, turn_taken)? {
            Replay::Interrupted => Ok(Perform::Interrupted),
            Replay::Turn(event) => {
                // The child already exists; let it start again.
                let child = usize::try_from(event.ret)
                    .ok()
                    .and_then(|c| self.registry.get(c))
                    .ok_or(EngineError::SyncMisuse {
                        thread: parent.index(),
                        what: "replayed spawn names no thread",
                    })?;
                child.open_gate();
                self.finish_turn(parent, &self.sync.spawns);
                Ok(Perform::Done(Outcome::Spawned(child.id())))
            }
            mode => {
                let record = matches!(mode, Replay::Live);
                self.start_thread(parent, body.clone_box(), retried, record)
            }
        }
    }

    fn start_thread(
        self: &Arc<Self>,
        parent: &ThreadControlBlock,
        body: Box<dyn ThreadBody>,
        retried: &mut bool,
        record: bool,
    ) -> Result<Perform, EngineError> {
        let Some(child) = self.registry.alloc_thread_index() else {
            if !*retried {
                *retried = true;
                tracing::debug!(
                    thread = parent.index(),
                    epoch = self.controller.epoch(),
                    "thread slots exhausted; committing to reap"
                );
                return Ok(Perform::NeedCommit);
            }
            return Err(EngineError::ThreadSlotExhausted {
                max: self.registry.max_threads(),
            });
        };

        let tcb = Arc::new(ThreadControlBlock::new(
            child,
            Some(parent.index()),
            self.new_quarantine(),
        ));
        self.registry.insert_alive_thread(Arc::clone(&tcb));
        self.controller.thread_started();
        if record {
            let _guard = self.spawn_lock.lock();
            self.sync.log.record(
                &self.sync.spawns,
                &parent.events,
                parent.index(),
                EventKind::Spawn,
                child as i64,
            );
        }

        let state = Arc::clone(self);
        let worker = Arc::clone(&tcb);
        let handle = std::thread::Builder::new()
            .name(format!("epochguard-{child}"))
            .spawn(move || state.worker_main(worker, body))?;
        tcb.set_handle(handle);
        tcb.open_gate();
        tracing::debug!(
            parent = parent.index(),
            child,
            epoch = self.controller.epoch(),
            "thread spawned"
        );
        Ok(Perform::Done(Outcome::Spawned(tcb.id())))
    }

    fn join(&self, tcb: &ThreadControlBlock, target: ThreadId) -> Result<Perform, EngineError> {
        let idx = tcb.index();
        if target.index() == idx {
            return Err(EngineError::SyncMisuse {
                thread: idx,
                what: "thread joined itself",
            });
        }
        let joinee = self
            .registry
            .get(target.index())
            .ok_or(EngineError::SyncMisuse {
                thread: idx,
                what: "join of an unknown thread",
            })?;
        tcb.set_status(ThreadStatus::Joining);
        let joined = joinee.wait_until(
            |s| {
                (s.status == ThreadStatus::WaitForJoining && !s.joined).then(|| {
                    s.joined = true;
                    s.joiner = Some(idx);
                    s.status = ThreadStatus::WaitForReaping;
                    s.exit_value.unwrap_or(0)
                })
            },
            &|| self.controller.stop_requested(),
        );
        let Some(value) = joined else {
            return Ok(Perform::Interrupted);
        };
        tcb.set_status(ThreadStatus::Running);
        Ok(Perform::Done(Outcome::Joined(value)))
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// What a finished run produced.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Value the main body exited with.
    pub exit_value: u64,
    /// Epochs begun, including the first.
    pub epochs: u64,
    pub metrics: MetricsSnapshot,
    /// BLAKE3 of the committed heap.
    pub heap_digest: blake3::Hash,
    pub globals_digest: blake3::Hash,
}

/// One engine instance: construct, set up primitives, then [`Engine::run`].
pub struct Engine {
    state: Arc<EngineState>,
    main: Arc<ThreadControlBlock>,
    traps: Vec<TrapRegistration>,
}

impl Engine {
    /// Build every component and open epoch 1.
    pub fn initialize(
        config: EngineConfig,
        diagnostics: Arc<dyn DiagnosticsBackend>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let heap_region = Arc::new(MemoryRegion::initialize(
            "heap",
            config.heap_bytes,
            config.tracking,
        )?);
        let globals = Arc::new(MemoryRegion::initialize(
            "globals",
            config.globals_bytes,
            config.tracking,
        )?);
        let mut traps = Vec::new();
        if config.tracking == WriteTracking::Trap {
            traps.push(fault::register(&heap_region)?);
            traps.push(fault::register(&globals)?);
        }

        let bitmap = Arc::new(CorruptionBitmap::for_region(&heap_region));
        let heap = HeapAllocator::new(heap_region, bitmap, config.max_threads);
        let registry = ThreadRegistry::new(config.max_threads);
        let main_idx = registry
            .alloc_thread_index()
            .ok_or(EngineError::ThreadSlotExhausted {
                max: config.max_threads,
            })?;
        let main = Arc::new(ThreadControlBlock::new(
            main_idx,
            None,
            QuarantineList::new(config.quarantine_entries, config.quarantine_bytes),
        ));
        registry.insert_alive_thread(Arc::clone(&main));

        tracing::info!(
            tracking = ?config.tracking,
            max_threads = config.max_threads,
            heap_bytes = config.heap_bytes,
            globals_bytes = config.globals_bytes,
            "engine initialized"
        );
        let state = Arc::new(EngineState {
            config,
            globals,
            heap,
            registry,
            sync: SyncTable::new(),
            controller: EpochController::new(),
            diagnostics,
            metrics: EngineMetrics::new(),
            detections: Mutex::new(Vec::new()),
            detected: AtomicBool::new(false),
            watches: RwLock::new(Vec::new()),
            spawn_lock: Mutex::new(()),
            failure: Mutex::new(None),
        });
        state.epoch_begin()?;
        Ok(Self { state, main, traps })
    }

    #[must_use]
    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn create_mutex(&self) -> MutexId {
        self.state.sync.create_mutex()
    }

    pub fn create_barrier(&self, parties: usize) -> Result<BarrierId, EngineError> {
        self.state.sync.create_barrier(parties)
    }

    /// First address of the globals region.
    #[must_use]
    pub fn globals_base(&self) -> usize {
        self.state.globals.start()
    }

    #[must_use]
    pub fn heap_range(&self) -> std::ops::Range<usize> {
        let heap = self.state.heap.region();
        heap.start()..heap.end()
    }

    /// Run `main` to completion on the calling thread.
    pub fn run(self, main: impl ThreadBody) -> Result<RunSummary, EngineError> {
        let state = Arc::clone(&self.state);
        self.main.set_status(ThreadStatus::Running);
        let exec = Execution::new(Box::new(main), true);
        let outcome = catch_unwind(AssertUnwindSafe(|| state.run_thread(&self.main, exec)));
        let exit_value = match outcome {
            Ok(Ok(value)) => value,
            Ok(Err(err)) => {
                state.fail(err);
                None
            }
            Err(panic) => {
                state.fail(EngineError::ThreadFault {
                    thread: ThreadId::MAIN.index(),
                    message: panic_message(&*panic),
                });
                None
            }
        };
        self.shutdown();
        if let Some(err) = state.take_failure() {
            return Err(err);
        }
        let exit_value = exit_value.ok_or_else(|| EngineError::ThreadFault {
            thread: ThreadId::MAIN.index(),
            message: "main thread stopped without exiting".to_string(),
        })?;
        let metrics = state.metrics();
        Ok(RunSummary {
            exit_value,
            epochs: metrics.epochs,
            metrics,
            heap_digest: state.heap.region().persistent_digest(),
            globals_digest: state.globals.persistent_digest(),
        })
    }

    /// Stop every thread, join them, and release the fault handler slots.
    pub fn finalize(self) -> MetricsSnapshot {
        self.shutdown();
        self.state.metrics()
    }

    fn shutdown(&self) {
        let state = &self.state;
        if !state.controller.phase().is_terminal() {
            state.controller.halt();
        }
        for tcb in state.registry.alive() {
            if tcb.index() == self.main.index() {
                continue;
            }
            tcb.set_status(ThreadStatus::Exiting);
            if let Some(handle) = tcb.take_handle()
                && handle.join().is_err()
            {
                tracing::warn!(thread = tcb.index(), "worker panicked during shutdown");
            }
        }
        tracing::debug!(
            epoch = state.controller.epoch(),
            traps = self.traps.len(),
            "engine finalized"
        );
    }
}
