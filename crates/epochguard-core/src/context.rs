//! The API a [`ThreadBody`](crate::execution::ThreadBody) sees during one step.
//!
//! Every heap and globals access goes through [`ThreadContext`] so the
//! owning region can track the write before it lands. Allocation and free
//! record the caller's source location for reports.

use crate::engine::EngineState;
use crate::error::EngineError;
use crate::execution::Outcome;
use crate::region::WORD_SIZE;
use crate::sync::MutexId;
use crate::thread_registry::{ThreadControlBlock, ThreadId};
use crate::tracking::CallSite;

/// Handle passed to [`ThreadBody::step`](crate::execution::ThreadBody::step).
pub struct ThreadContext<'a> {
    state: &'a EngineState,
    tcb: &'a ThreadControlBlock,
    outcome: Outcome,
}

impl<'a> ThreadContext<'a> {
    pub(crate) fn new(state: &'a EngineState, tcb: &'a ThreadControlBlock, outcome: Outcome) -> Self {
        Self {
            state,
            tcb,
            outcome,
        }
    }

    #[must_use]
    pub fn thread(&self) -> ThreadId {
        self.tcb.id()
    }

    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.state.controller.epoch()
    }

    /// True while the current epoch is being re-executed after a rollback.
    #[must_use]
    pub fn is_replaying(&self) -> bool {
        self.state.controller.is_replaying()
    }

    /// Result of the blocking call returned by the previous step.
    #[must_use]
    pub fn outcome(&self) -> Outcome {
        self.outcome
    }

    /// Address of byte `offset` of the globals region.
    #[must_use]
    pub fn global(&self, offset: usize) -> usize {
        self.state.globals.start() + offset
    }

    // -----------------------------------------------------------------------
    // Allocation
    // -----------------------------------------------------------------------

    #[track_caller]
    pub fn malloc(&mut self, size: usize) -> Result<usize, EngineError> {
        self.state
            .heap
            .malloc(self.tcb.index(), size, CallSite::caller())
    }

    /// Zeroed allocation of `count * size` bytes.
    #[track_caller]
    pub fn calloc(&mut self, count: usize, size: usize) -> Result<usize, EngineError> {
        let site = CallSite::caller();
        let bytes = count
            .checked_mul(size)
            .ok_or_else(|| EngineError::AllocatorExhausted {
                requested: usize::MAX,
                remaining: self.state.heap.remaining(),
            })?;
        let ptr = self.state.heap.malloc(self.tcb.index(), bytes, site)?;
        self.state
            .heap
            .region()
            .fill(ptr, bytes, 0, Some(self.tcb.index()))?;
        Ok(ptr)
    }

    #[track_caller]
    pub fn memalign(&mut self, align: usize, size: usize) -> Result<usize, EngineError> {
        self.state
            .heap
            .memalign(self.tcb.index(), align, size, CallSite::caller())
    }

    /// Resize an allocation by moving it. `ptr == 0` behaves like `malloc`.
    #[track_caller]
    pub fn realloc(&mut self, ptr: usize, size: usize) -> Result<usize, EngineError> {
        let site = CallSite::caller();
        let idx = self.tcb.index();
        if ptr == 0 {
            return self.state.heap.malloc(idx, size, site);
        }
        let old = self
            .state
            .heap
            .resolve(ptr)
            .filter(|rec| !rec.is_freed())
            .ok_or(EngineError::InvalidFree { address: ptr })?;
        let fresh = self.state.heap.malloc(idx, size, site)?;
        let mut buf = vec![0u8; old.size.min(size)];
        let region = self.state.heap.region();
        region.read(ptr, &mut buf)?;
        region.write(fresh, &buf, Some(idx))?;
        self.state.free(self.tcb, ptr, site)?;
        Ok(fresh)
    }

    /// Free a heap object. `ptr == 0` is a no-op.
    #[track_caller]
    pub fn free(&mut self, ptr: usize) -> Result<(), EngineError> {
        if ptr == 0 {
            return Ok(());
        }
        self.state.free(self.tcb, ptr, CallSite::caller())
    }

    // -----------------------------------------------------------------------
    // Memory access
    // -----------------------------------------------------------------------

    /// Write `bytes` at `addr` in the heap or globals region.
    #[track_caller]
    pub fn write(&mut self, addr: usize, bytes: &[u8]) -> Result<(), EngineError> {
        let region = self.state.region_for(addr, bytes.len())?;
        self.state
            .note_write(self.tcb.id(), addr, bytes.len(), CallSite::caller());
        region.write(addr, bytes, Some(self.tcb.index()))
    }

    #[track_caller]
    pub fn write_u64(&mut self, addr: usize, value: u64) -> Result<(), EngineError> {
        self.write(addr, &value.to_le_bytes())
    }

    #[track_caller]
    pub fn fill(&mut self, addr: usize, len: usize, byte: u8) -> Result<(), EngineError> {
        let region = self.state.region_for(addr, len)?;
        self.state
            .note_write(self.tcb.id(), addr, len, CallSite::caller());
        region.fill(addr, len, byte, Some(self.tcb.index()))
    }

    pub fn read(&self, addr: usize, buf: &mut [u8]) -> Result<(), EngineError> {
        self.state.region_for(addr, buf.len())?.read(addr, buf)
    }

    pub fn read_u64(&self, addr: usize) -> Result<u64, EngineError> {
        let mut buf = [0u8; WORD_SIZE];
        self.read(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Raw pointer to tracked memory. Only trap-mode regions see writes
    /// made through it; explicit-mode writes must use [`Self::write`].
    pub fn as_mut_ptr(&self, addr: usize) -> Result<*mut u8, EngineError> {
        self.state.region_for(addr, 1)?;
        Ok(addr as *mut u8)
    }

    // -----------------------------------------------------------------------
    // Synchronization
    // -----------------------------------------------------------------------

    /// Release a mutex acquired through [`Step::Lock`](crate::execution::Step::Lock)
    /// or a successful try-lock.
    pub fn unlock(&mut self, id: MutexId) -> Result<(), EngineError> {
        let idx = self.tcb.index();
        self.state.sync.mutex(id, idx)?.unlock(idx)
    }
}
