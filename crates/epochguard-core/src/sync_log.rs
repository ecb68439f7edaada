//! Recorded synchronization events and replay turn-taking.
//!
//! During normal execution every tracked synchronization call appends one
//! [`SyncEvent`] to the list of the variable it touched and to the calling
//! thread's own list. After a rollback the lists are replayed: each
//! variable offers its next event to the owning thread, and the thread's
//! [`Semaphore`] is posted only when that event is also the head of the
//! thread's own list. A thread therefore follows its own recorded order
//! while the interleaving across variables is reproduced exactly.
//!
//! Every event is posted exactly once: an offer that arrives before the
//! event reaches the head of its thread list is parked in `pending` and
//! posted when the thread advances onto it.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// How long blocking waits sleep between stop-flag polls.
pub const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Identity of a synchronization variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum VarKey {
    Mutex(usize),
    Barrier(usize),
    /// Pseudo-variable ordering thread creation.
    Spawn,
}

/// Kind of recorded call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Lock,
    TryLock,
    Barrier,
    Spawn,
}

/// One recorded synchronization call. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncEvent {
    /// Global recording order.
    pub seq: u64,
    pub thread: usize,
    pub var: VarKey,
    pub kind: EventKind,
    /// Return value of the call (`0`/`EBUSY` for try-lock, child slot for spawn).
    pub ret: i64,
}

// ---------------------------------------------------------------------------
// Semaphore
// ---------------------------------------------------------------------------

/// Counting semaphore whose waits can be interrupted.
#[derive(Debug, Default)]
pub struct Semaphore {
    count: Mutex<u32>,
    cond: Condvar,
}

impl Semaphore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post(&self) {
        *self.count.lock() += 1;
        self.cond.notify_all();
    }

    pub fn reset(&self) {
        *self.count.lock() = 0;
    }

    #[must_use]
    pub fn count(&self) -> u32 {
        *self.count.lock()
    }

    /// Take one unit. Returns `false` without taking anything if
    /// `interrupted` reports true first.
    pub fn wait(&self, interrupted: &dyn Fn() -> bool) -> bool {
        let mut count = self.count.lock();
        loop {
            if *count > 0 {
                *count -= 1;
                return true;
            }
            if interrupted() {
                return false;
            }
            self.cond.wait_for(&mut count, POLL_INTERVAL);
        }
    }
}

// ---------------------------------------------------------------------------
// Per-variable list
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct VarLog {
    events: Vec<Arc<SyncEvent>>,
    cursor: usize,
}

/// Ordered events of one synchronization variable.
#[derive(Debug)]
pub struct SyncEventList {
    key: VarKey,
    log: Mutex<VarLog>,
    drained: Condvar,
}

impl SyncEventList {
    #[must_use]
    pub fn new(key: VarKey) -> Self {
        Self {
            key,
            log: Mutex::new(VarLog::default()),
            drained: Condvar::new(),
        }
    }

    #[must_use]
    pub fn key(&self) -> VarKey {
        self.key
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.log.lock().events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.log.lock().events.is_empty()
    }

    #[must_use]
    pub fn events(&self) -> Vec<Arc<SyncEvent>> {
        self.log.lock().events.clone()
    }

    /// Next event to replay, if any.
    #[must_use]
    pub fn head(&self) -> Option<Arc<SyncEvent>> {
        let log = self.log.lock();
        log.events.get(log.cursor).cloned()
    }

    /// True once replay consumed every recorded event.
    #[must_use]
    pub fn is_drained(&self) -> bool {
        let log = self.log.lock();
        log.cursor >= log.events.len()
    }

    fn push(&self, event: Arc<SyncEvent>) {
        self.log.lock().events.push(event);
    }

    /// Consume the head event and return the new head.
    pub fn advance(&self) -> Option<Arc<SyncEvent>> {
        let mut log = self.log.lock();
        log.cursor = (log.cursor + 1).min(log.events.len());
        let next = log.events.get(log.cursor).cloned();
        if next.is_none() {
            self.drained.notify_all();
        }
        next
    }

    /// Block until every recorded event was replayed.
    pub fn wait_drained(&self, interrupted: &dyn Fn() -> bool) -> bool {
        let mut log = self.log.lock();
        loop {
            if log.cursor >= log.events.len() {
                return true;
            }
            if interrupted() {
                return false;
            }
            self.drained.wait_for(&mut log, POLL_INTERVAL);
        }
    }

    /// Rewind for replay.
    pub fn prepare(&self) {
        self.log.lock().cursor = 0;
    }

    /// Forget the epoch's events.
    pub fn clear(&self) {
        let mut log = self.log.lock();
        log.events.clear();
        log.cursor = 0;
    }
}

// ---------------------------------------------------------------------------
// Per-thread list
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ThreadLog {
    events: Vec<Arc<SyncEvent>>,
    cursor: usize,
    pending: BTreeSet<u64>,
}

/// Ordered events of one thread plus its replay gate.
#[derive(Debug, Default)]
pub struct ThreadEventList {
    log: Mutex<ThreadLog>,
    sem: Semaphore,
}

impl ThreadEventList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.log.lock().events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.log.lock().events.is_empty()
    }

    #[must_use]
    pub fn events(&self) -> Vec<Arc<SyncEvent>> {
        self.log.lock().events.clone()
    }

    /// The thread's next event to replay.
    #[must_use]
    pub fn head(&self) -> Option<Arc<SyncEvent>> {
        let log = self.log.lock();
        log.events.get(log.cursor).cloned()
    }

    fn push(&self, event: Arc<SyncEvent>) {
        self.log.lock().events.push(event);
    }

    /// A variable reached `event`: post now if it is this thread's head,
    /// otherwise remember it until the thread gets there.
    pub fn offer(&self, event: &SyncEvent) {
        let mut log = self.log.lock();
        let is_head = log.events.get(log.cursor).is_some_and(|h| h.seq == event.seq);
        if is_head {
            self.sem.post();
        } else {
            log.pending.insert(event.seq);
        }
    }

    /// Consume the head event; post if the new head was already offered.
    pub fn advance(&self) {
        let mut log = self.log.lock();
        log.cursor = (log.cursor + 1).min(log.events.len());
        let next = log.events.get(log.cursor).map(|e| e.seq);
        if let Some(seq) = next
            && log.pending.remove(&seq)
        {
            self.sem.post();
        }
    }

    /// Wait for this thread's turn.
    pub fn wait_turn(&self, interrupted: &dyn Fn() -> bool) -> bool {
        self.sem.wait(interrupted)
    }

    /// Rewind for replay and close the gate.
    pub fn prepare(&self) {
        let mut log = self.log.lock();
        log.cursor = 0;
        log.pending.clear();
        self.sem.reset();
    }

    pub fn clear(&self) {
        let mut log = self.log.lock();
        log.events.clear();
        log.cursor = 0;
        log.pending.clear();
        self.sem.reset();
    }
}

// ---------------------------------------------------------------------------
// Recorder
// ---------------------------------------------------------------------------

/// Assigns the global recording order.
#[derive(Debug, Default)]
pub struct SyncEventLog {
    seq: AtomicU64,
}

impl SyncEventLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one event to both lists. Callers hold the primitive's own
    /// lock so variable order matches the order the calls took effect.
    pub fn record(
        &self,
        var: &SyncEventList,
        thread_list: &ThreadEventList,
        thread: usize,
        kind: EventKind,
        ret: i64,
    ) -> Arc<SyncEvent> {
        let event = Arc::new(SyncEvent {
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            thread,
            var: var.key(),
            kind,
            ret,
        });
        var.push(Arc::clone(&event));
        thread_list.push(Arc::clone(&event));
        event
    }

    /// Events recorded since creation.
    #[must_use]
    pub fn recorded(&self) -> u64 {
        self.seq.load(Ordering::Relaxed)
    }
}
