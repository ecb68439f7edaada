//! Page-fault delivery for trap-mode write tracking.
//!
//! Trap-mode regions keep their transient view read-only between first
//! writes. A process-wide `SIGSEGV` handler looks the faulting address up
//! in a fixed table of registered regions and forwards it to
//! [`MemoryRegion::handle_write`], which lifts protection on that page.
//! Faults outside every registered region restore the default action so
//! the re-executed instruction crashes normally.
//!
//! The table is the one process-global piece of engine state: a signal
//! handler cannot be handed a pointer to anything else.

#![allow(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::EngineError;
use crate::region::MemoryRegion;

/// Maximum regions that can be registered at once.
pub const MAX_TRAP_REGIONS: usize = 32;

struct TrapSlot {
    start: AtomicUsize,
    end: AtomicUsize,
    region: AtomicPtr<MemoryRegion>,
}

impl TrapSlot {
    const fn new() -> Self {
        Self {
            start: AtomicUsize::new(0),
            end: AtomicUsize::new(0),
            region: AtomicPtr::new(std::ptr::null_mut()),
        }
    }
}

#[allow(clippy::declare_interior_mutable_const)]
static TRAP_SLOTS: [TrapSlot; MAX_TRAP_REGIONS] = {
    const EMPTY: TrapSlot = TrapSlot::new();
    [EMPTY; MAX_TRAP_REGIONS]
};

static HANDLER_INSTALLED: AtomicBool = AtomicBool::new(false);

/// Serializes registration; the handler itself only reads atomics.
static REGISTRATION: Mutex<()> = Mutex::new(());

/// Keeps a region registered with the fault handler until dropped.
pub struct TrapRegistration {
    slot: usize,
    _region: Arc<MemoryRegion>,
}

impl Drop for TrapRegistration {
    fn drop(&mut self) {
        let _guard = REGISTRATION.lock();
        let slot = &TRAP_SLOTS[self.slot];
        slot.region.store(std::ptr::null_mut(), Ordering::Release);
        slot.end.store(0, Ordering::Release);
        slot.start.store(0, Ordering::Release);
    }
}

/// Route write faults inside `region` to its `handle_write`.
pub fn register(region: &Arc<MemoryRegion>) -> Result<TrapRegistration, EngineError> {
    let _guard = REGISTRATION.lock();
    install_handler()?;
    for (idx, slot) in TRAP_SLOTS.iter().enumerate() {
        if slot.region.load(Ordering::Acquire).is_null() {
            slot.start.store(region.start(), Ordering::Release);
            slot.end.store(region.end(), Ordering::Release);
            slot.region
                .store(Arc::as_ptr(region).cast_mut(), Ordering::Release);
            tracing::debug!(region = region.name(), slot = idx, "trap region registered");
            return Ok(TrapRegistration {
                slot: idx,
                _region: Arc::clone(region),
            });
        }
    }
    Err(EngineError::InvalidConfig(format!(
        "more than {MAX_TRAP_REGIONS} trap-mode regions"
    )))
}

fn install_handler() -> Result<(), EngineError> {
    if HANDLER_INSTALLED.load(Ordering::Acquire) {
        return Ok(());
    }
    // SAFETY: zeroed sigaction is a valid starting point; fields set below.
    let mut act = unsafe { std::mem::zeroed::<libc::sigaction>() };
    act.sa_sigaction = on_fault as libc::sighandler_t;
    act.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
    // SAFETY: act.sa_mask is a valid sigset_t.
    unsafe { libc::sigemptyset(&mut act.sa_mask) };
    // SAFETY: installing a handler for SIGSEGV with a valid sigaction.
    let rc = unsafe { libc::sigaction(libc::SIGSEGV, &act, std::ptr::null_mut()) };
    if rc != 0 {
        return Err(EngineError::backing("sigaction"));
    }
    HANDLER_INSTALLED.store(true, Ordering::Release);
    Ok(())
}

fn lookup(addr: usize) -> Option<&'static MemoryRegion> {
    for slot in &TRAP_SLOTS {
        let ptr = slot.region.load(Ordering::Acquire);
        if ptr.is_null() {
            continue;
        }
        let start = slot.start.load(Ordering::Acquire);
        let end = slot.end.load(Ordering::Acquire);
        if addr >= start && addr < end {
            // SAFETY: the registration holds an Arc keeping the region alive
            // while the slot is populated.
            return Some(unsafe { &*ptr });
        }
    }
    None
}

extern "C" fn on_fault(sig: libc::c_int, info: *mut libc::siginfo_t, _ctx: *mut libc::c_void) {
    // SAFETY: the kernel passes a valid siginfo for SA_SIGINFO handlers.
    let addr = unsafe { (*info).si_addr() } as usize;
    if let Some(region) = lookup(addr)
        && region.handle_write(addr, None).is_ok()
    {
        return;
    }
    // Not ours: fall back to the default disposition and let the access re-fault.
    // SAFETY: resetting a signal disposition is async-signal-safe.
    unsafe {
        libc::signal(sig, libc::SIG_DFL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_misses_unregistered_addresses() {
        assert!(lookup(0x10).is_none());
    }
}
