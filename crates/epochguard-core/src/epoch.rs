//! Epoch state machine and stop-the-world rendezvous.
//!
//! ```text
//! Init -> Normal -> EpochEnd -> (commit: Normal | rollback: Normal | Finished | Halted)
//! ```
//!
//! A thread that wants the epoch to end calls
//! [`EpochController::try_begin_end`]. The first caller becomes the
//! coordinator, raises the stop flag, and waits until every other active
//! thread has parked at a safe point. Parked threads sleep until the
//! coordinator publishes a [`Verdict`] and bumps the release generation.
//! Finished threads leave the active count, so the coordinator never
//! waits on a thread that will not reach a safe point again.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// How long the coordinator waits before logging slow threads.
pub const RENDEZVOUS_WARN_AFTER: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Init,
    Normal,
    EpochEnd,
    /// The program ended and its last epoch committed.
    Finished,
    /// A fatal error stopped the engine.
    Halted,
}

impl Phase {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Halted)
    }
}

/// How an epoch end was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verdict {
    Committed,
    RolledBack,
    Finished,
    Halted,
}

/// Result of asking to end the epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Begin {
    /// The caller coordinates this epoch end.
    Coordinator,
    /// Another thread is coordinating; park and retry.
    Busy,
    Terminal(Verdict),
}

#[derive(Debug)]
struct GlobalInfo {
    phase: Phase,
    epoch: u64,
    coordinator: Option<usize>,
    /// Bit per parked thread slot.
    parked: u64,
    active: usize,
    release_gen: u64,
    verdict: Verdict,
    has_rollbacked: bool,
}

/// Global epoch phase and rendezvous.
pub struct EpochController {
    info: Mutex<GlobalInfo>,
    committer: Condvar,
    waiters: Condvar,
    stop: AtomicBool,
    replaying: AtomicBool,
    epoch: AtomicU64,
}

impl EpochController {
    #[must_use]
    pub fn new() -> Self {
        Self {
            info: Mutex::new(GlobalInfo {
                phase: Phase::Init,
                epoch: 0,
                coordinator: None,
                parked: 0,
                active: 1,
                release_gen: 0,
                verdict: Verdict::Committed,
                has_rollbacked: false,
            }),
            committer: Condvar::new(),
            waiters: Condvar::new(),
            stop: AtomicBool::new(false),
            replaying: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        self.info.lock().phase
    }

    /// Current epoch number (the first epoch is 1).
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// True while some thread wants everyone at a safe point.
    #[must_use]
    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_replaying(&self) -> bool {
        self.replaying.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn active(&self) -> usize {
        self.info.lock().active
    }

    /// Start a new epoch. Called with every other thread parked (or at
    /// initialization) after commit-side work is done.
    pub fn advance_epoch(&self) -> u64 {
        let mut info = self.info.lock();
        info.epoch += 1;
        info.has_rollbacked = false;
        self.epoch.store(info.epoch, Ordering::Release);
        self.replaying.store(false, Ordering::Release);
        if info.phase == Phase::Init {
            info.phase = Phase::Normal;
        }
        info.epoch
    }

    /// Record a rollback; returns true if the epoch was already rolled back
    /// once (a repeat detection).
    pub fn note_rollback(&self) -> bool {
        let mut info = self.info.lock();
        let repeat = info.has_rollbacked;
        info.has_rollbacked = true;
        self.replaying.store(true, Ordering::Release);
        repeat
    }

    /// A thread joined the rendezvous population (spawn or resurrection).
    pub fn thread_started(&self) {
        self.info.lock().active += 1;
    }

    /// A thread's body returned; it no longer reaches safe points.
    pub fn thread_finished(&self) {
        let mut info = self.info.lock();
        info.active = info.active.saturating_sub(1);
        self.committer.notify_all();
    }

    /// Ask to end the epoch.
    pub fn try_begin_end(&self, idx: usize) -> Begin {
        let mut info = self.info.lock();
        match info.phase {
            Phase::Normal => {
                info.phase = Phase::EpochEnd;
                info.coordinator = Some(idx);
                info.parked = 0;
                self.stop.store(true, Ordering::Release);
                tracing::debug!(epoch = info.epoch, thread = idx, "epoch end requested");
                Begin::Coordinator
            }
            Phase::Finished | Phase::Halted => Begin::Terminal(info.verdict),
            Phase::Init | Phase::EpochEnd => Begin::Busy,
        }
    }

    /// Park at a safe point until the coordinator releases. Returns `None`
    /// if no epoch end is in progress.
    pub fn park(&self, idx: usize) -> Option<Verdict> {
        let mut info = self.info.lock();
        match info.phase {
            Phase::EpochEnd if info.coordinator != Some(idx) => {}
            Phase::Finished | Phase::Halted => return Some(info.verdict),
            _ => return None,
        }
        info.parked |= 1u64 << (idx % 64);
        self.committer.notify_all();
        let generation = info.release_gen;
        while info.release_gen == generation {
            self.waiters.wait(&mut info);
        }
        Some(info.verdict)
    }

    /// Coordinator: wait until every other active thread has parked.
    /// `slow` receives the parked mask each time the wait drags on.
    pub fn wait_rendezvous(&self, mut slow: impl FnMut(u64)) {
        let mut info = self.info.lock();
        loop {
            let parked = info.parked.count_ones() as usize;
            if parked + 1 >= info.active {
                return;
            }
            if self
                .committer
                .wait_for(&mut info, RENDEZVOUS_WARN_AFTER)
                .timed_out()
            {
                let mask = info.parked;
                drop(info);
                slow(mask);
                info = self.info.lock();
            }
        }
    }

    /// Coordinator: publish the verdict and wake every parked thread.
    pub fn release(&self, verdict: Verdict) {
        let mut info = self.info.lock();
        info.verdict = verdict;
        info.phase = match verdict {
            Verdict::Committed | Verdict::RolledBack => Phase::Normal,
            Verdict::Finished => Phase::Finished,
            Verdict::Halted => Phase::Halted,
        };
        info.coordinator = None;
        info.parked = 0;
        info.release_gen += 1;
        if !info.phase.is_terminal() {
            self.stop.store(false, Ordering::Release);
        }
        tracing::debug!(epoch = info.epoch, ?verdict, "epoch end released");
        self.waiters.notify_all();
    }

    /// Stop the engine from any state and wake everyone.
    pub fn halt(&self) {
        let mut info = self.info.lock();
        if info.phase.is_terminal() {
            return;
        }
        info.phase = Phase::Halted;
        info.verdict = Verdict::Halted;
        info.release_gen += 1;
        self.stop.store(true, Ordering::Release);
        self.waiters.notify_all();
        self.committer.notify_all();
    }
}

impl Default for EpochController {
    fn default() -> Self {
        Self::new()
    }
}
