//! Live-object tracking table.
//!
//! Every heap object handed out by the allocator has one [`ObjectRecord`]
//! keyed by the address of its block. Records carry the allocating thread
//! and call sites so corruption and leak reports can name where an object
//! came from and where it was freed.
//!
//! Lookups by interior address pick the greatest block start at or below
//! the address and check its end bound. Blocks never overlap, so this point
//! lookup is exact; overlap is asserted in debug builds.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::Location;

use parking_lot::Mutex;

use crate::region::WORD_SIZE;

/// Source location of an allocation or free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallSite {
    pub file: &'static str,
    pub line: u32,
    pub column: u32,
}

impl CallSite {
    /// Location of the caller of the `#[track_caller]` chain.
    #[track_caller]
    #[must_use]
    pub fn caller() -> Self {
        Self::from(Location::caller())
    }
}

impl From<&'static Location<'static>> for CallSite {
    fn from(loc: &'static Location<'static>) -> Self {
        Self {
            file: loc.file(),
            line: loc.line(),
            column: loc.column(),
        }
    }
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// Size of the block header preceding every payload.
pub const HEADER_SIZE: usize = 4 * WORD_SIZE;

/// One allocated heap object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectRecord {
    /// First byte of the block (header).
    pub raw: usize,
    /// Address handed to the program.
    pub start: usize,
    /// Bytes requested by the program.
    pub size: usize,
    /// Distance from the payload to `start` (non-zero for aligned allocations).
    pub offset: usize,
    /// Size class of the block.
    pub class: usize,
    /// Thread slot whose allocator owns the block.
    pub thread: usize,
    pub alloc_site: CallSite,
    pub free_site: Option<CallSite>,
}

impl ObjectRecord {
    /// First payload byte, immediately after the leading canary.
    #[must_use]
    pub fn payload(&self) -> usize {
        self.raw + HEADER_SIZE
    }

    /// Bytes from the payload to the end of the program-visible object.
    #[must_use]
    pub fn object_size(&self) -> usize {
        self.offset + self.size
    }

    /// One past the trailing canary word.
    #[must_use]
    pub fn end(&self) -> usize {
        self.payload() + self.object_size().next_multiple_of(WORD_SIZE) + WORD_SIZE
    }

    #[must_use]
    pub fn is_freed(&self) -> bool {
        self.free_site.is_some()
    }

    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.raw && addr < self.end()
    }
}

/// Table of allocated objects, with an epoch-begin snapshot.
#[derive(Default)]
pub struct ObjectTable {
    live: Mutex<BTreeMap<usize, ObjectRecord>>,
    saved: Mutex<BTreeMap<usize, ObjectRecord>>,
}

impl ObjectTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: ObjectRecord) {
        let mut live = self.live.lock();
        debug_assert!(
            live.range(..record.end())
                .next_back()
                .is_none_or(|(_, prev)| prev.end() <= record.raw),
            "object at {:#x} overlaps a tracked object",
            record.raw
        );
        live.insert(record.raw, record);
    }

    #[must_use]
    pub fn get(&self, raw: usize) -> Option<ObjectRecord> {
        self.live.lock().get(&raw).copied()
    }

    /// Record the free call site. Returns the updated record, or `None` if
    /// `raw` is unknown or already freed.
    pub fn mark_freed(&self, raw: usize, site: CallSite) -> Option<ObjectRecord> {
        let mut live = self.live.lock();
        let rec = live.get_mut(&raw)?;
        if rec.is_freed() {
            return None;
        }
        rec.free_site = Some(site);
        Some(*rec)
    }

    pub fn remove(&self, raw: usize) -> Option<ObjectRecord> {
        self.live.lock().remove(&raw)
    }

    /// Record of the block containing `addr`, freed or not.
    #[must_use]
    pub fn enclosing(&self, addr: usize) -> Option<ObjectRecord> {
        let live = self.live.lock();
        live.range(..=addr)
            .next_back()
            .map(|(_, rec)| *rec)
            .filter(|rec| rec.contains(addr))
    }

    /// Objects not yet freed, in address order.
    #[must_use]
    pub fn live_objects(&self) -> Vec<ObjectRecord> {
        self.live
            .lock()
            .values()
            .filter(|rec| !rec.is_freed())
            .copied()
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.live.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live.lock().is_empty()
    }

    pub fn backup(&self) {
        let snapshot = self.live.lock().clone();
        *self.saved.lock() = snapshot;
    }

    pub fn restore(&self) {
        let snapshot = self.saved.lock().clone();
        *self.live.lock() = snapshot;
    }
}
