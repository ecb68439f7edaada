//! Heap allocator stack over the tracked heap region.
//!
//! Three layers, composed by construction:
//! - [`PageSource`]: hands out aligned chunks of the heap region
//!   ([`BumpPageSource`]).
//! - [`SizeClassAllocator`]: power-of-two size classes carved from chunks,
//!   with per-thread free lists ([`SlotHeap`]).
//! - [`CanaryDecorator`]: writes the block header and canaries and records
//!   canary positions in the [`CorruptionBitmap`].
//!
//! [`HeapAllocator`] owns one decorated size-class allocator per thread
//! slot. A block is only ever returned to the allocator of the slot that
//! allocated it; frees issued by other threads are queued on that slot's
//! deferred list and drained at the next epoch boundary.
//!
//! Block layout (`raw` is the block start, `payload = raw + HEADER_SIZE`):
//!
//! ```text
//! raw+0   class size
//! raw+8   object size (payload to end of program-visible bytes)
//! raw+16  owner slot
//! raw+24  leading canary
//! raw+32  payload ... trailing canary
//! ```
//!
//! Aligned allocations place a back-pointer to the payload and a
//! [`MEMALIGN_SENTINEL_WORD`](crate::bitmap::MEMALIGN_SENTINEL_WORD) in the
//! two words preceding the returned pointer.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::bitmap::{CanaryScan, CorruptionBitmap, MEMALIGN_SENTINEL_WORD, short_canary_tail};
use crate::error::EngineError;
use crate::region::{MemoryRegion, PAGE_SIZE, WORD_SIZE};
use crate::tracking::{CallSite, HEADER_SIZE, ObjectRecord, ObjectTable};

/// Granularity at which size classes request memory from the page source.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Smallest block handed out.
pub const MIN_CLASS: usize = 64;

/// Payload alignment of ordinary allocations.
pub const MIN_ALIGN: usize = 16;

const LEADING_CANARY: usize = 3 * WORD_SIZE;

/// Size class holding a block with `object_size` bytes after the header,
/// or `None` when no power-of-two class is that large.
#[must_use]
pub fn class_for(object_size: usize) -> Option<usize> {
    object_size
        .checked_next_multiple_of(WORD_SIZE)?
        .checked_add(HEADER_SIZE + WORD_SIZE)?
        .checked_next_power_of_two()
        .map(|class| class.max(MIN_CLASS))
}

fn class_index(class: usize) -> usize {
    (class.trailing_zeros() - MIN_CLASS.trailing_zeros()) as usize
}

// ---------------------------------------------------------------------------
// Page source
// ---------------------------------------------------------------------------

/// Source of raw chunks inside the heap region.
pub trait PageSource: Send + Sync {
    /// Reserve `bytes` aligned to `align` (a power of two).
    fn alloc_chunk(&self, bytes: usize, align: usize) -> Result<usize, EngineError>;
    /// First address served.
    fn base(&self) -> usize;
    /// Bytes consumed from `base`, including alignment padding.
    fn used(&self) -> usize;
    fn capacity(&self) -> usize;
    fn backup(&self);
    fn restore(&self);
}

/// Bump allocator over a fixed address range.
pub struct BumpPageSource {
    base: usize,
    capacity: usize,
    next: Mutex<usize>,
    saved: Mutex<usize>,
}

impl BumpPageSource {
    #[must_use]
    pub fn new(base: usize, capacity: usize) -> Self {
        Self {
            base,
            capacity,
            next: Mutex::new(base),
            saved: Mutex::new(base),
        }
    }

    /// Page source covering a whole region.
    #[must_use]
    pub fn for_region(region: &MemoryRegion) -> Self {
        Self::new(region.start(), region.len())
    }
}

impl PageSource for BumpPageSource {
    fn alloc_chunk(&self, bytes: usize, align: usize) -> Result<usize, EngineError> {
        let mut next = self.next.lock();
        let start = next.next_multiple_of(align);
        let end = self.base + self.capacity;
        match start.checked_add(bytes) {
            Some(stop) if stop <= end => {
                *next = stop;
                Ok(start)
            }
            _ => Err(EngineError::AllocatorExhausted {
                requested: bytes,
                remaining: end.saturating_sub(*next),
            }),
        }
    }

    fn base(&self) -> usize {
        self.base
    }

    fn used(&self) -> usize {
        *self.next.lock() - self.base
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn backup(&self) {
        *self.saved.lock() = *self.next.lock();
    }

    fn restore(&self) {
        *self.next.lock() = *self.saved.lock();
    }
}

// ---------------------------------------------------------------------------
// Size classes
// ---------------------------------------------------------------------------

/// Power-of-two block allocator.
pub trait SizeClassAllocator: Send {
    /// Reserve a block of exactly `class` bytes (a power of two ≥ [`MIN_CLASS`]).
    fn allocate(&mut self, class: usize) -> Result<usize, EngineError>;
    /// Return a block previously handed out for `class`.
    fn release(&mut self, raw: usize, class: usize);
    /// Bytes the allocator can still obtain from its page source.
    fn remaining(&self) -> usize;
    fn backup(&mut self);
    fn restore(&mut self);
}

#[derive(Debug, Clone, Default)]
struct Bin {
    free: Vec<usize>,
    cursor: usize,
    limit: usize,
}

/// Free lists and carving cursors for one thread slot.
pub struct SlotHeap {
    source: Arc<dyn PageSource>,
    bins: Vec<Bin>,
    saved: Vec<Bin>,
}

impl SlotHeap {
    #[must_use]
    pub fn new(source: Arc<dyn PageSource>) -> Self {
        Self {
            source,
            bins: Vec::new(),
            saved: Vec::new(),
        }
    }

    /// Blocks currently on the free list for `class`.
    #[must_use]
    pub fn free_count(&self, class: usize) -> usize {
        self.bins.get(class_index(class)).map_or(0, |b| b.free.len())
    }
}

impl SizeClassAllocator for SlotHeap {
    fn allocate(&mut self, class: usize) -> Result<usize, EngineError> {
        debug_assert!(class.is_power_of_two() && class >= MIN_CLASS);
        let idx = class_index(class);
        if self.bins.len() <= idx {
            self.bins.resize_with(idx + 1, Bin::default);
        }
        let bin = &mut self.bins[idx];
        if let Some(raw) = bin.free.pop() {
            return Ok(raw);
        }
        if bin.cursor.checked_add(class).is_none_or(|end| end > bin.limit) {
            let chunk = class.max(CHUNK_SIZE);
            let start = self.source.alloc_chunk(chunk, PAGE_SIZE)?;
            bin.cursor = start;
            bin.limit = start + chunk;
        }
        let raw = bin.cursor;
        bin.cursor += class;
        Ok(raw)
    }

    fn release(&mut self, raw: usize, class: usize) {
        let idx = class_index(class);
        if self.bins.len() <= idx {
            self.bins.resize_with(idx + 1, Bin::default);
        }
        self.bins[idx].free.push(raw);
    }

    fn remaining(&self) -> usize {
        self.source.capacity().saturating_sub(self.source.used())
    }

    fn backup(&mut self) {
        self.saved.clone_from(&self.bins);
    }

    fn restore(&mut self) {
        self.bins.clone_from(&self.saved);
    }
}

// ---------------------------------------------------------------------------
// Canary decorator
// ---------------------------------------------------------------------------

/// Block placed by [`CanaryDecorator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub raw: usize,
    pub class: usize,
    /// Address handed to the program.
    pub start: usize,
    pub offset: usize,
}

/// Adds headers and canaries around blocks from a [`SizeClassAllocator`].
pub struct CanaryDecorator<A> {
    inner: A,
    region: Arc<MemoryRegion>,
    bitmap: Arc<CorruptionBitmap>,
}

impl<A: SizeClassAllocator> CanaryDecorator<A> {
    pub fn new(inner: A, region: Arc<MemoryRegion>, bitmap: Arc<CorruptionBitmap>) -> Self {
        Self {
            inner,
            region,
            bitmap,
        }
    }

    #[must_use]
    pub fn inner(&self) -> &A {
        &self.inner
    }

    fn class_for_request(&self, needed: Option<usize>, size: usize) -> Result<usize, EngineError> {
        needed
            .and_then(class_for)
            .ok_or_else(|| EngineError::AllocatorExhausted {
                requested: size,
                remaining: self.inner.remaining(),
            })
    }

    /// Allocate `size` bytes with 16-byte alignment.
    pub fn malloc(&mut self, size: usize, owner: usize) -> Result<Placement, EngineError> {
        let class = self.class_for_request(Some(size), size)?;
        let raw = self.inner.allocate(class)?;
        self.stamp(raw, class, size, owner)?;
        Ok(Placement {
            raw,
            class,
            start: raw + HEADER_SIZE,
            offset: 0,
        })
    }

    /// Allocate `size` bytes aligned to `align` (a power of two > 16).
    pub fn memalign(
        &mut self,
        align: usize,
        size: usize,
        owner: usize,
    ) -> Result<Placement, EngineError> {
        debug_assert!(align.is_power_of_two() && align > MIN_ALIGN);
        // Room for the back-pointer, the marker, and the worst-case shift.
        let class = self.class_for_request(size.checked_add(align + 2 * WORD_SIZE), size)?;
        let raw = self.inner.allocate(class)?;
        let payload = raw + HEADER_SIZE;
        let start = (payload + 2 * WORD_SIZE).next_multiple_of(align);
        let offset = start - payload;
        self.stamp(raw, class, offset + size, owner)?;
        let writer = Some(owner);
        self.region.write_word(start - 2 * WORD_SIZE, payload as u64, writer)?;
        self.bitmap
            .set_memalign_sentinel_at(&self.region, start - WORD_SIZE, writer)?;
        Ok(Placement {
            raw,
            class,
            start,
            offset,
        })
    }

    fn stamp(
        &self,
        raw: usize,
        class: usize,
        object_size: usize,
        owner: usize,
    ) -> Result<(), EngineError> {
        let writer = Some(owner);
        let region = &*self.region;
        region.write_word(raw, class as u64, writer)?;
        region.write_word(raw + WORD_SIZE, object_size as u64, writer)?;
        region.write_word(raw + 2 * WORD_SIZE, owner as u64, writer)?;
        self.bitmap.set_sentinel_at(region, raw + LEADING_CANARY, writer)?;

        let payload = raw + HEADER_SIZE;
        let used = object_size % WORD_SIZE;
        let trailing = payload + object_size.next_multiple_of(WORD_SIZE);
        if used != 0 {
            let word = payload + (object_size - used);
            let mut bytes = [0u8; WORD_SIZE];
            bytes[used..].copy_from_slice(&short_canary_tail(used));
            region.write_word(word, u64::from_le_bytes(bytes), writer)?;
            self.bitmap.mark_canary(word);
        }
        self.bitmap.set_sentinel_at(region, trailing, writer)
    }

    /// Verify every canary of `record`.
    #[must_use]
    pub fn check(&self, record: &ObjectRecord) -> CanaryScan {
        let from = record.raw + LEADING_CANARY;
        self.bitmap.verify_range(&self.region, from, record.end() - from)
    }

    /// Clear the canary marks of `record`.
    pub fn unmark(&self, record: &ObjectRecord) {
        let mut addr = record.raw + LEADING_CANARY;
        while addr < record.end() {
            self.bitmap.clear_canary(addr);
            addr += WORD_SIZE;
        }
    }

    pub fn release(&mut self, raw: usize, class: usize) {
        self.inner.release(raw, class);
    }

    pub fn backup(&mut self) {
        self.inner.backup();
    }

    pub fn restore(&mut self) {
        self.inner.restore();
    }
}

// ---------------------------------------------------------------------------
// Heap allocator
// ---------------------------------------------------------------------------

/// Per-slot decorated allocators plus the object table.
pub struct HeapAllocator {
    region: Arc<MemoryRegion>,
    bitmap: Arc<CorruptionBitmap>,
    source: Arc<dyn PageSource>,
    slots: Box<[Mutex<CanaryDecorator<SlotHeap>>]>,
    deferred: Box<[Mutex<Vec<usize>>]>,
    saved_deferred: Mutex<Vec<Vec<usize>>>,
    objects: ObjectTable,
}

impl HeapAllocator {
    pub fn new(region: Arc<MemoryRegion>, bitmap: Arc<CorruptionBitmap>, slots: usize) -> Self {
        let source: Arc<dyn PageSource> = Arc::new(BumpPageSource::for_region(&region));
        let heaps = (0..slots)
            .map(|_| {
                Mutex::new(CanaryDecorator::new(
                    SlotHeap::new(Arc::clone(&source)),
                    Arc::clone(&region),
                    Arc::clone(&bitmap),
                ))
            })
            .collect();
        Self {
            region,
            bitmap,
            source,
            slots: heaps,
            deferred: (0..slots).map(|_| Mutex::new(Vec::new())).collect(),
            saved_deferred: Mutex::new(Vec::new()),
            objects: ObjectTable::new(),
        }
    }

    #[must_use]
    pub fn region(&self) -> &MemoryRegion {
        &self.region
    }

    #[must_use]
    pub fn bitmap(&self) -> &CorruptionBitmap {
        &self.bitmap
    }

    #[must_use]
    pub fn objects(&self) -> &ObjectTable {
        &self.objects
    }

    /// Bytes of the heap region handed to size classes so far.
    #[must_use]
    pub fn used(&self) -> usize {
        self.source.used()
    }

    /// Bytes of the heap region not yet handed to any size class.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.source.capacity().saturating_sub(self.source.used())
    }

    fn slot(&self, slot: usize) -> Result<&Mutex<CanaryDecorator<SlotHeap>>, EngineError> {
        self.slots
            .get(slot)
            .ok_or_else(|| EngineError::InvalidConfig(format!("no heap for thread slot {slot}")))
    }

    /// Allocate `size` bytes for thread `slot`.
    pub fn malloc(&self, slot: usize, size: usize, site: CallSite) -> Result<usize, EngineError> {
        let placement = self.slot(slot)?.lock().malloc(size, slot)?;
        self.track(placement, size, slot, site);
        Ok(placement.start)
    }

    /// Allocate `size` bytes aligned to `align`.
    pub fn memalign(
        &self,
        slot: usize,
        align: usize,
        size: usize,
        site: CallSite,
    ) -> Result<usize, EngineError> {
        let Some(align) = align.max(WORD_SIZE).checked_next_power_of_two() else {
            return Err(EngineError::AllocatorExhausted {
                requested: size,
                remaining: self.remaining(),
            });
        };
        if align <= MIN_ALIGN {
            return self.malloc(slot, size, site);
        }
        let placement = self.slot(slot)?.lock().memalign(align, size, slot)?;
        self.track(placement, size, slot, site);
        Ok(placement.start)
    }

    fn track(&self, placement: Placement, size: usize, slot: usize, site: CallSite) {
        self.objects.insert(ObjectRecord {
            raw: placement.raw,
            start: placement.start,
            size,
            offset: placement.offset,
            class: placement.class,
            thread: slot,
            alloc_site: site,
            free_site: None,
        });
    }

    /// Find the record for a pointer returned by `malloc` or `memalign`.
    #[must_use]
    pub fn resolve(&self, ptr: usize) -> Option<ObjectRecord> {
        if ptr % WORD_SIZE != 0 || !self.region.in_range(ptr) {
            return None;
        }
        let marker = ptr.checked_sub(WORD_SIZE)?;
        let payload = if self.bitmap.is_marked(marker)
            && self.region.load_word(marker) == MEMALIGN_SENTINEL_WORD
        {
            self.region.load_word(ptr - 2 * WORD_SIZE) as usize
        } else {
            ptr
        };
        let rec = self.objects.get(payload.checked_sub(HEADER_SIZE)?)?;
        (rec.start == ptr).then_some(rec)
    }

    /// Verify the canaries of one object.
    #[must_use]
    pub fn check(&self, record: &ObjectRecord) -> CanaryScan {
        match self.slots.get(record.thread) {
            Some(slot) => slot.lock().check(record),
            None => CanaryScan::default(),
        }
    }

    /// Verify every canary in the used part of the heap.
    #[must_use]
    pub fn check_all(&self) -> CanaryScan {
        self.bitmap
            .verify_range(&self.region, self.region.start(), self.source.used())
    }

    /// Clear the canary marks of an object being freed.
    pub fn unmark(&self, record: &ObjectRecord) {
        if let Some(slot) = self.slots.get(record.thread) {
            slot.lock().unmark(record);
        }
    }

    /// Hand a freed block back to its owner's allocator. Releases issued by
    /// another slot are deferred; `by == None` means all threads are stopped.
    pub fn release(&self, raw: usize, by: Option<usize>) -> Result<(), EngineError> {
        let rec = self
            .objects
            .get(raw)
            .ok_or(EngineError::InvalidFree { address: raw })?;
        if by.is_some_and(|slot| slot != rec.thread) {
            self.slot(rec.thread)?;
            self.deferred[rec.thread].lock().push(raw);
            return Ok(());
        }
        self.objects.remove(raw);
        self.slot(rec.thread)?.lock().release(raw, rec.class);
        Ok(())
    }

    /// Release every block queued by other threads. Runs at epoch begin.
    pub fn drain_deferred(&self) -> usize {
        let mut drained = 0;
        for (slot, queue) in self.deferred.iter().enumerate() {
            let pending = std::mem::take(&mut *queue.lock());
            for raw in pending {
                if let Some(rec) = self.objects.remove(raw) {
                    self.slots[slot].lock().release(raw, rec.class);
                    drained += 1;
                }
            }
        }
        drained
    }

    /// Blocks waiting on `slot`'s deferred list.
    #[must_use]
    pub fn deferred_count(&self, slot: usize) -> usize {
        self.deferred.get(slot).map_or(0, |q| q.lock().len())
    }

    /// Snapshot allocator metadata and canary marks at epoch begin.
    pub fn backup(&self) {
        self.source.backup();
        for slot in self.slots.iter() {
            slot.lock().backup();
        }
        *self.saved_deferred.lock() = self.deferred.iter().map(|q| q.lock().clone()).collect();
        self.objects.backup();
        self.bitmap.backup(self.source.used());
    }

    /// Return allocator metadata and canary marks to the last backup.
    pub fn restore(&self) {
        self.source.restore();
        for slot in self.slots.iter() {
            slot.lock().restore();
        }
        let saved = self.saved_deferred.lock();
        for (i, queue) in self.deferred.iter().enumerate() {
            *queue.lock() = saved.get(i).cloned().unwrap_or_default();
        }
        self.objects.restore();
        self.bitmap.restore();
    }
}
