//! Thread slots and per-thread control blocks.
//!
//! Status transitions:
//!
//! ```text
//! Starting -> Running -> Joining -> Running
//!                     -> WaitForJoining (body returned)
//!                          -> WaitForReaping (joined) -> Exiting (reaped at epoch begin)
//!                          -> Rollback (resurrected) -> Running
//! ```
//!
//! A finished thread keeps its slot and its OS thread until a later epoch
//! begin reaps it, so a rollback can still resurrect it.

use std::fmt;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::quarantine::QuarantineList;
use crate::sync_log::ThreadEventList;

/// Index of a thread slot. The main thread is always slot 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(pub usize);

impl ThreadId {
    pub const MAIN: Self = Self(0);

    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadStatus {
    Starting,
    Running,
    Joining,
    Exiting,
    Rollback,
    WaitForJoining,
    WaitForReaping,
}

impl ThreadStatus {
    /// True while the thread must reach the epoch-end rendezvous.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::Starting | Self::Running | Self::Joining | Self::Rollback
        )
    }

    /// True once the body has returned.
    #[must_use]
    pub fn is_finished(self) -> bool {
        matches!(self, Self::WaitForJoining | Self::WaitForReaping)
    }
}

/// Mutable part of a control block.
#[derive(Debug, Clone)]
pub struct TcbState {
    pub status: ThreadStatus,
    pub parent: Option<usize>,
    pub joiner: Option<usize>,
    pub exit_value: Option<u64>,
    pub joined: bool,
    /// Spawned during the current epoch.
    pub newly_spawned: bool,
    /// Finished during an already committed epoch.
    pub finished_committed: bool,
    /// Set by the spawning call; the thread runs its body only once open.
    pub gate_open: bool,
}

/// One thread's engine-side state.
pub struct ThreadControlBlock {
    index: usize,
    state: Mutex<TcbState>,
    cond: Condvar,
    pub events: ThreadEventList,
    pub quarantine: Mutex<QuarantineList>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadControlBlock {
    #[must_use]
    pub fn new(index: usize, parent: Option<usize>, quarantine: QuarantineList) -> Self {
        Self {
            index,
            state: Mutex::new(TcbState {
                status: ThreadStatus::Starting,
                parent,
                joiner: None,
                exit_value: None,
                joined: false,
                newly_spawned: parent.is_some(),
                finished_committed: false,
                gate_open: parent.is_none(),
            }),
            cond: Condvar::new(),
            events: ThreadEventList::new(),
            quarantine: Mutex::new(quarantine),
            handle: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    #[must_use]
    pub fn id(&self) -> ThreadId {
        ThreadId(self.index)
    }

    #[must_use]
    pub fn status(&self) -> ThreadStatus {
        self.state.lock().status
    }

    #[must_use]
    pub fn snapshot(&self) -> TcbState {
        self.state.lock().clone()
    }

    pub fn set_status(&self, status: ThreadStatus) {
        self.state.lock().status = status;
        self.cond.notify_all();
    }

    /// Apply `f` to the state under its lock and wake waiters.
    pub fn update<R>(&self, f: impl FnOnce(&mut TcbState) -> R) -> R {
        let r = f(&mut self.state.lock());
        self.cond.notify_all();
        r
    }

    /// Wait until `ready` holds or `interrupted` reports true. Returns the
    /// value produced by `ready`, if any.
    pub fn wait_until<R>(
        &self,
        mut ready: impl FnMut(&mut TcbState) -> Option<R>,
        interrupted: &dyn Fn() -> bool,
    ) -> Option<R> {
        let mut state = self.state.lock();
        loop {
            if let Some(r) = ready(&mut state) {
                return Some(r);
            }
            if interrupted() {
                return None;
            }
            self.cond.wait_for(&mut state, POLL);
        }
    }

    pub fn open_gate(&self) {
        self.update(|s| s.gate_open = true);
    }

    pub fn set_handle(&self, handle: JoinHandle<()>) {
        *self.handle.lock() = Some(handle);
    }

    pub fn take_handle(&self) -> Option<JoinHandle<()>> {
        self.handle.lock().take()
    }
}

const POLL: Duration = Duration::from_millis(2);

impl fmt::Debug for ThreadControlBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadControlBlock")
            .field("index", &self.index)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

struct Slots {
    tcbs: Vec<Option<Arc<ThreadControlBlock>>>,
    reserved: Vec<bool>,
    alive: Vec<usize>,
    next: usize,
}

/// Bounded table of thread slots.
pub struct ThreadRegistry {
    max: usize,
    slots: Mutex<Slots>,
}

impl ThreadRegistry {
    #[must_use]
    pub fn new(max: usize) -> Self {
        Self {
            max,
            slots: Mutex::new(Slots {
                tcbs: vec![None; max],
                reserved: vec![false; max],
                alive: Vec::with_capacity(max),
                next: 0,
            }),
        }
    }

    #[must_use]
    pub fn max_threads(&self) -> usize {
        self.max
    }

    /// Reserve a free slot, searching round-robin from the last one handed out.
    pub fn alloc_thread_index(&self) -> Option<usize> {
        let mut slots = self.slots.lock();
        for i in 0..self.max {
            let idx = (slots.next + i) % self.max;
            if !slots.reserved[idx] {
                slots.reserved[idx] = true;
                slots.next = (idx + 1) % self.max;
                return Some(idx);
            }
        }
        None
    }

    /// Publish a control block in its reserved slot.
    pub fn insert_alive_thread(&self, tcb: Arc<ThreadControlBlock>) {
        let mut slots = self.slots.lock();
        let idx = tcb.index();
        debug_assert!(slots.reserved[idx], "slot {idx} was not reserved");
        slots.reserved[idx] = true;
        slots.tcbs[idx] = Some(tcb);
        if !slots.alive.contains(&idx) {
            slots.alive.push(idx);
        }
    }

    /// Remove a reaped thread and release its slot.
    pub fn remove_alive_thread(&self, idx: usize) -> Option<Arc<ThreadControlBlock>> {
        let mut slots = self.slots.lock();
        slots.alive.retain(|&i| i != idx);
        slots.reserved[idx] = false;
        slots.tcbs[idx].take()
    }

    #[must_use]
    pub fn get(&self, idx: usize) -> Option<Arc<ThreadControlBlock>> {
        self.slots.lock().tcbs.get(idx).cloned().flatten()
    }

    /// Alive control blocks in spawn order.
    #[must_use]
    pub fn alive(&self) -> Vec<Arc<ThreadControlBlock>> {
        let slots = self.slots.lock();
        slots
            .alive
            .iter()
            .filter_map(|&i| slots.tcbs[i].clone())
            .collect()
    }

    #[must_use]
    pub fn alive_count(&self) -> usize {
        self.slots.lock().alive.len()
    }

    /// Joined threads a commit would reap.
    #[must_use]
    pub fn reapable_count(&self) -> usize {
        self.alive()
            .iter()
            .filter(|t| t.status() == ThreadStatus::WaitForReaping)
            .count()
    }

    /// Rewind every thread's event list and close its replay gate.
    pub fn prepare_rollback(&self) {
        for tcb in self.alive() {
            tcb.events.prepare();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tcb(idx: usize) -> Arc<ThreadControlBlock> {
        Arc::new(ThreadControlBlock::new(idx, Some(0), QuarantineList::new(4, 1024)))
    }

    #[test]
    fn slots_are_handed_out_round_robin() {
        let reg = ThreadRegistry::new(3);
        assert_eq!(reg.alloc_thread_index(), Some(0));
        assert_eq!(reg.alloc_thread_index(), Some(1));
        reg.insert_alive_thread(tcb(0));
        reg.insert_alive_thread(tcb(1));
        reg.remove_alive_thread(0);
        assert_eq!(reg.alloc_thread_index(), Some(2));
        assert_eq!(reg.alloc_thread_index(), Some(0));
        assert_eq!(reg.alloc_thread_index(), None);
    }

    #[test]
    fn reapable_counts_joined_threads_only() {
        let reg = ThreadRegistry::new(4);
        for _ in 0..3 {
            let idx = reg.alloc_thread_index().unwrap();
            reg.insert_alive_thread(tcb(idx));
        }
        reg.get(1).unwrap().set_status(ThreadStatus::WaitForJoining);
        reg.get(2).unwrap().set_status(ThreadStatus::WaitForReaping);
        assert_eq!(reg.reapable_count(), 1);
        assert_eq!(reg.alive_count(), 3);
    }

    #[test]
    fn spawned_threads_start_with_closed_gate() {
        let child = tcb(1);
        assert!(!child.snapshot().gate_open);
        assert!(child.snapshot().newly_spawned);
        child.open_gate();
        let opened = child.wait_until(|s| s.gate_open.then_some(()), &|| false);
        assert_eq!(opened, Some(()));

        let main = ThreadControlBlock::new(0, None, QuarantineList::new(4, 1024));
        assert!(main.snapshot().gate_open);
    }

    #[test]
    fn status_activity_classes() {
        assert!(ThreadStatus::Running.is_active());
        assert!(ThreadStatus::Rollback.is_active());
        assert!(!ThreadStatus::WaitForJoining.is_active());
        assert!(ThreadStatus::WaitForReaping.is_finished());
        assert!(!ThreadStatus::Exiting.is_finished());
    }
}
