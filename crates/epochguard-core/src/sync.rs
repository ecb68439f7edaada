//! Engine-tracked synchronization primitives.
//!
//! Mutexes and barriers are created before a run and addressed by id.
//! Their state is snapshotted at epoch begin and restored on rollback, and
//! every acquisition, try-lock, and barrier arrival is recorded in the
//! primitive's [`SyncEventList`] while its own lock is held, so the list
//! order is the order the calls took effect.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex, RwLock};

use crate::error::EngineError;
use crate::sync_log::{
    EventKind, POLL_INTERVAL, SyncEventList, SyncEventLog, ThreadEventList, VarKey,
};

/// Return value recorded for a failed try-lock.
pub const EBUSY: i64 = libc::EBUSY as i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MutexId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BarrierId(pub usize);

/// Result of an interruptible wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait<T> {
    Ready(T),
    Interrupted,
}

/// Where a call gets recorded; `None` while replaying.
#[derive(Clone, Copy)]
pub struct Recorder<'a> {
    pub log: &'a SyncEventLog,
    pub thread_list: &'a ThreadEventList,
}

// ---------------------------------------------------------------------------
// Mutex
// ---------------------------------------------------------------------------

pub struct EngineMutex {
    id: MutexId,
    owner: Mutex<Option<usize>>,
    cond: Condvar,
    saved_owner: Mutex<Option<usize>>,
    pub events: SyncEventList,
}

impl EngineMutex {
    #[must_use]
    pub fn new(id: MutexId) -> Self {
        Self {
            id,
            owner: Mutex::new(None),
            cond: Condvar::new(),
            saved_owner: Mutex::new(None),
            events: SyncEventList::new(VarKey::Mutex(id.0)),
        }
    }

    #[must_use]
    pub fn id(&self) -> MutexId {
        self.id
    }

    #[must_use]
    pub fn owner(&self) -> Option<usize> {
        *self.owner.lock()
    }

    /// Acquire without blocking. Records `0` or [`EBUSY`].
    pub fn try_acquire(&self, thread: usize, rec: Option<Recorder<'_>>) -> bool {
        let mut owner = self.owner.lock();
        let acquired = owner.is_none();
        if acquired {
            *owner = Some(thread);
        }
        if let Some(rec) = rec {
            let ret = if acquired { 0 } else { EBUSY };
            rec.log
                .record(&self.events, rec.thread_list, thread, EventKind::TryLock, ret);
        }
        acquired
    }

    /// Block until acquired, recording the acquisition.
    pub fn lock(
        &self,
        thread: usize,
        rec: Option<Recorder<'_>>,
        interrupted: &dyn Fn() -> bool,
    ) -> Result<Wait<()>, EngineError> {
        let mut owner = self.owner.lock();
        loop {
            match *owner {
                None => {
                    *owner = Some(thread);
                    if let Some(rec) = rec {
                        rec.log
                            .record(&self.events, rec.thread_list, thread, EventKind::Lock, 0);
                    }
                    return Ok(Wait::Ready(()));
                }
                Some(holder) if holder == thread => {
                    return Err(EngineError::SyncMisuse {
                        thread,
                        what: "relock of a held mutex",
                    });
                }
                Some(_) => {}
            }
            if interrupted() {
                return Ok(Wait::Interrupted);
            }
            self.cond.wait_for(&mut owner, POLL_INTERVAL);
        }
    }

    pub fn unlock(&self, thread: usize) -> Result<(), EngineError> {
        let mut owner = self.owner.lock();
        if *owner != Some(thread) {
            return Err(EngineError::SyncMisuse {
                thread,
                what: "unlock of a mutex held by another thread",
            });
        }
        *owner = None;
        self.cond.notify_all();
        Ok(())
    }

    fn snapshot(&self) {
        *self.saved_owner.lock() = *self.owner.lock();
    }

    fn restore(&self) {
        *self.owner.lock() = *self.saved_owner.lock();
        self.cond.notify_all();
    }
}

// ---------------------------------------------------------------------------
// Barrier
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct BarrierState {
    arrived: usize,
    generation: u64,
}

pub struct EngineBarrier {
    id: BarrierId,
    parties: usize,
    state: Mutex<BarrierState>,
    cond: Condvar,
    saved: Mutex<BarrierState>,
    pub events: SyncEventList,
}

impl EngineBarrier {
    #[must_use]
    pub fn new(id: BarrierId, parties: usize) -> Self {
        Self {
            id,
            parties,
            state: Mutex::new(BarrierState::default()),
            cond: Condvar::new(),
            saved: Mutex::new(BarrierState::default()),
            events: SyncEventList::new(VarKey::Barrier(id.0)),
        }
    }

    #[must_use]
    pub fn id(&self) -> BarrierId {
        self.id
    }

    #[must_use]
    pub fn parties(&self) -> usize {
        self.parties
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    /// Count the caller in. Returns the generation it arrived in and
    /// whether it was the last party (which releases the round).
    pub fn arrive(&self, thread: usize, rec: Option<Recorder<'_>>) -> (u64, bool) {
        let mut state = self.state.lock();
        let generation = state.generation;
        state.arrived += 1;
        if let Some(rec) = rec {
            rec.log
                .record(&self.events, rec.thread_list, thread, EventKind::Barrier, 0);
        }
        if state.arrived >= self.parties {
            state.arrived = 0;
            state.generation += 1;
            self.cond.notify_all();
            (generation, true)
        } else {
            (generation, false)
        }
    }

    /// Wait until round `generation` has been released.
    pub fn wait_passed(&self, generation: u64, interrupted: &dyn Fn() -> bool) -> Wait<()> {
        let mut state = self.state.lock();
        loop {
            if state.generation != generation {
                return Wait::Ready(());
            }
            if interrupted() {
                return Wait::Interrupted;
            }
            self.cond.wait_for(&mut state, POLL_INTERVAL);
        }
    }

    fn snapshot(&self) {
        *self.saved.lock() = *self.state.lock();
    }

    fn restore(&self) {
        *self.state.lock() = *self.saved.lock();
        self.cond.notify_all();
    }
}

// ---------------------------------------------------------------------------
// Table
// ---------------------------------------------------------------------------

/// Every tracked primitive plus the thread-creation pseudo-variable.
pub struct SyncTable {
    pub log: SyncEventLog,
    mutexes: RwLock<Vec<Arc<EngineMutex>>>,
    barriers: RwLock<Vec<Arc<EngineBarrier>>>,
    pub spawns: SyncEventList,
}

impl SyncTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            log: SyncEventLog::new(),
            mutexes: RwLock::new(Vec::new()),
            barriers: RwLock::new(Vec::new()),
            spawns: SyncEventList::new(VarKey::Spawn),
        }
    }

    pub fn create_mutex(&self) -> MutexId {
        let mut mutexes = self.mutexes.write();
        let id = MutexId(mutexes.len());
        mutexes.push(Arc::new(EngineMutex::new(id)));
        id
    }

    pub fn create_barrier(&self, parties: usize) -> Result<BarrierId, EngineError> {
        if parties == 0 {
            return Err(EngineError::InvalidConfig(
                "barrier needs at least one party".to_string(),
            ));
        }
        let mut barriers = self.barriers.write();
        let id = BarrierId(barriers.len());
        barriers.push(Arc::new(EngineBarrier::new(id, parties)));
        Ok(id)
    }

    pub fn mutex(&self, id: MutexId, thread: usize) -> Result<Arc<EngineMutex>, EngineError> {
        self.mutexes
            .read()
            .get(id.0)
            .cloned()
            .ok_or(EngineError::SyncMisuse {
                thread,
                what: "unknown mutex",
            })
    }

    pub fn barrier(&self, id: BarrierId, thread: usize) -> Result<Arc<EngineBarrier>, EngineError> {
        self.barriers
            .read()
            .get(id.0)
            .cloned()
            .ok_or(EngineError::SyncMisuse {
                thread,
                what: "unknown barrier",
            })
    }

    /// Apply `f` to every variable's event list.
    pub fn for_each_var(&self, mut f: impl FnMut(&SyncEventList)) {
        for m in self.mutexes.read().iter() {
            f(&m.events);
        }
        for b in self.barriers.read().iter() {
            f(&b.events);
        }
        f(&self.spawns);
    }

    /// Save primitive state at epoch begin.
    pub fn snapshot(&self) {
        for m in self.mutexes.read().iter() {
            m.snapshot();
        }
        for b in self.barriers.read().iter() {
            b.snapshot();
        }
    }

    /// Return primitive state to the epoch-begin snapshot.
    pub fn restore(&self) {
        for m in self.mutexes.read().iter() {
            m.restore();
        }
        for b in self.barriers.read().iter() {
            b.restore();
        }
    }

    /// Forget the epoch's recorded events.
    pub fn clear_logs(&self) {
        self.for_each_var(SyncEventList::clear);
    }

    /// Rewind every variable list for replay.
    pub fn prepare_replay(&self) {
        self.for_each_var(SyncEventList::prepare);
    }
}

impl Default for SyncTable {
    fn default() -> Self {
        Self::new()
    }
}
