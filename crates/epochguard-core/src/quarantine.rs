//! Per-thread quarantine of freed objects.
//!
//! Freed objects are not reused right away. Their first words are
//! overwritten with [`SENTINEL_WORD`] and the object waits in a bounded
//! FIFO ring. When the ring runs out of slots or the quarantined bytes
//! exceed the budget, the oldest entry is evicted: if its sentinel words
//! are intact the block goes back to the allocator, otherwise something
//! wrote to freed memory and the eviction reports a use-after-free instead.
//!
//! The ring holds `capacity + 1` slots so that `avail == lr` always means
//! empty.

use crate::bitmap::SENTINEL_WORD;
use crate::error::EngineError;
use crate::region::WORD_SIZE;

/// Words checked at the head of large freed objects.
pub const FREE_OBJECT_CANARY_WORDS: usize = 16;

/// The final scan stops after this many corrupted objects.
pub const MAX_FINAL_UAF_ERRORS: usize = 4;

/// Sentinel words written into a freed object of `size` bytes.
#[must_use]
pub fn mark_words(size: usize) -> usize {
    if size > FREE_OBJECT_CANARY_WORDS * WORD_SIZE {
        FREE_OBJECT_CANARY_WORDS
    } else {
        size / WORD_SIZE
    }
}

/// A freed object waiting in quarantine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuarantineEntry {
    /// Block address, used to give the block back.
    pub raw: usize,
    /// Address the program freed.
    pub start: usize,
    pub size: usize,
}

/// Memory access the quarantine needs from the heap.
pub trait FreedMemory {
    /// Overwrite `words` words at `start` with the sentinel pattern.
    fn fill_sentinel(&self, start: usize, words: usize) -> Result<(), EngineError>;
    fn word(&self, addr: usize) -> u64;
    /// Really free an evicted block.
    fn release(&self, entry: &QuarantineEntry) -> Result<(), EngineError>;
}

/// A write into quarantined memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UafHit {
    pub entry: QuarantineEntry,
    /// First sentinel word found overwritten.
    pub address: usize,
    pub value: u64,
}

/// Result of [`QuarantineList::add_free_object`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Quarantined; lists the entries evicted to make room.
    Quarantined { evicted: Vec<QuarantineEntry> },
    /// Larger than the whole budget; the caller frees it directly.
    TooLarge,
    /// Eviction found the oldest entry corrupted. The ring is left as is.
    UseAfterFree(UafHit),
}

/// Result of [`QuarantineList::free_lr_object`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eviction {
    Released(QuarantineEntry),
    Corrupted(UafHit),
    Empty,
}

#[derive(Debug, Clone, Default)]
struct Ring {
    slots: Vec<QuarantineEntry>,
    avail: usize,
    lr: usize,
    total: usize,
}

/// Bounded FIFO of freed objects with an epoch-begin snapshot.
#[derive(Debug)]
pub struct QuarantineList {
    ring: Ring,
    saved: Ring,
    budget: usize,
}

impl QuarantineList {
    /// Quarantine holding up to `capacity` entries and `budget` bytes.
    #[must_use]
    pub fn new(capacity: usize, budget: usize) -> Self {
        let ring = Ring {
            slots: vec![QuarantineEntry::default(); capacity.max(1) + 1],
            ..Ring::default()
        };
        Self {
            saved: ring.clone(),
            ring,
            budget,
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.ring.slots.len() - 1
    }

    #[must_use]
    pub fn len(&self) -> usize {
        let n = self.ring.slots.len();
        (self.ring.avail + n - self.ring.lr) % n
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ring.avail == self.ring.lr
    }

    /// Bytes currently quarantined.
    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.ring.total
    }

    /// Entries from oldest to newest.
    #[must_use]
    pub fn entries(&self) -> Vec<QuarantineEntry> {
        let n = self.ring.slots.len();
        (0..self.len())
            .map(|i| self.ring.slots[(self.ring.lr + i) % n])
            .collect()
    }

    fn incr(&self, index: usize) -> usize {
        (index + 1) % self.ring.slots.len()
    }

    fn has_avail_slot(&self) -> bool {
        self.incr(self.ring.avail) != self.ring.lr
    }

    /// Quarantine a freed object, evicting from the head as needed.
    pub fn add_free_object(
        &mut self,
        entry: QuarantineEntry,
        mem: &dyn FreedMemory,
    ) -> Result<Admission, EngineError> {
        if entry.size >= self.budget {
            return Ok(Admission::TooLarge);
        }
        let at = self.ring.avail;
        self.ring.slots[at] = entry;
        mem.fill_sentinel(entry.start, mark_words(entry.size))?;
        self.ring.total += entry.size;

        let mut evicted = Vec::new();
        while self.ring.total > self.budget || !self.has_avail_slot() {
            match self.free_lr_object(mem)? {
                Eviction::Released(e) => evicted.push(e),
                Eviction::Corrupted(hit) => return Ok(Admission::UseAfterFree(hit)),
                Eviction::Empty => break,
            }
        }
        self.ring.avail = self.incr(at);
        Ok(Admission::Quarantined { evicted })
    }

    /// Evict the oldest entry. A corrupted entry stays in place.
    pub fn free_lr_object(&mut self, mem: &dyn FreedMemory) -> Result<Eviction, EngineError> {
        if self.is_empty() {
            return Ok(Eviction::Empty);
        }
        let entry = self.ring.slots[self.ring.lr];
        if let Some(hit) = find_uaf(&entry, mem) {
            return Ok(Eviction::Corrupted(hit));
        }
        mem.release(&entry)?;
        self.ring.total -= entry.size;
        self.ring.lr = self.incr(self.ring.lr);
        Ok(Eviction::Released(entry))
    }

    /// Drain the ring at program end, releasing clean entries. Stops after
    /// [`MAX_FINAL_UAF_ERRORS`] corrupted ones.
    pub fn final_uaf_check(&mut self, mem: &dyn FreedMemory) -> Result<Vec<UafHit>, EngineError> {
        let mut hits = Vec::new();
        while !self.is_empty() {
            let entry = self.ring.slots[self.ring.lr];
            self.ring.lr = self.incr(self.ring.lr);
            self.ring.total -= entry.size;
            match find_uaf(&entry, mem) {
                Some(hit) => {
                    hits.push(hit);
                    if hits.len() >= MAX_FINAL_UAF_ERRORS {
                        break;
                    }
                }
                None => mem.release(&entry)?,
            }
        }
        Ok(hits)
    }

    /// Drop every entry without checking or releasing it.
    pub fn clear(&mut self) {
        self.ring.avail = 0;
        self.ring.lr = 0;
        self.ring.total = 0;
    }

    pub fn backup(&mut self) {
        self.saved.clone_from(&self.ring);
    }

    pub fn restore(&mut self) {
        self.ring.clone_from(&self.saved);
    }
}

fn find_uaf(entry: &QuarantineEntry, mem: &dyn FreedMemory) -> Option<UafHit> {
    (0..mark_words(entry.size)).find_map(|i| {
        let address = entry.start + i * WORD_SIZE;
        let value = mem.word(address);
        (value != SENTINEL_WORD).then_some(UafHit {
            entry: *entry,
            address,
            value,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Default)]
    struct FakeHeap {
        words: Mutex<HashMap<usize, u64>>,
        released: Mutex<Vec<usize>>,
    }

    impl FreedMemory for FakeHeap {
        fn fill_sentinel(&self, start: usize, words: usize) -> Result<(), EngineError> {
            let mut mem = self.words.lock();
            for i in 0..words {
                mem.insert(start + i * WORD_SIZE, SENTINEL_WORD);
            }
            Ok(())
        }

        fn word(&self, addr: usize) -> u64 {
            self.words.lock().get(&addr).copied().unwrap_or(0)
        }

        fn release(&self, entry: &QuarantineEntry) -> Result<(), EngineError> {
            self.released.lock().push(entry.start);
            Ok(())
        }
    }

    fn entry(start: usize, size: usize) -> QuarantineEntry {
        QuarantineEntry {
            raw: start - 32,
            start,
            size,
        }
    }

    #[test]
    fn mark_words_caps_large_objects() {
        assert_eq!(mark_words(7), 0);
        assert_eq!(mark_words(16), 2);
        assert_eq!(mark_words(128), 16);
        assert_eq!(mark_words(4096), FREE_OBJECT_CANARY_WORDS);
    }

    #[test]
    fn fifth_free_evicts_oldest_with_capacity_four() {
        let heap = FakeHeap::default();
        let mut q = QuarantineList::new(4, 1 << 20);
        for i in 0..4 {
            let adm = q.add_free_object(entry(0x1000 + i * 0x100, 16), &heap).unwrap();
            assert_eq!(adm, Admission::Quarantined { evicted: vec![] });
        }
        assert_eq!(q.len(), 4);
        let adm = q.add_free_object(entry(0x2000, 16), &heap).unwrap();
        assert_eq!(
            adm,
            Admission::Quarantined {
                evicted: vec![entry(0x1000, 16)]
            }
        );
        assert_eq!(*heap.released.lock(), vec![0x1000]);
        assert_eq!(q.len(), 4);
        assert_eq!(q.entries()[0].start, 0x1100);
    }

    #[test]
    fn byte_budget_forces_eviction() {
        let heap = FakeHeap::default();
        let mut q = QuarantineList::new(16, 100);
        q.add_free_object(entry(0x1000, 64), &heap).unwrap();
        q.add_free_object(entry(0x2000, 64), &heap).unwrap();
        assert_eq!(q.len(), 1);
        assert_eq!(q.total_bytes(), 64);
        assert_eq!(
            q.add_free_object(entry(0x3000, 100), &heap).unwrap(),
            Admission::TooLarge
        );
    }

    #[test]
    fn write_into_quarantined_object_is_caught_on_eviction() {
        let heap = FakeHeap::default();
        let mut q = QuarantineList::new(1, 1 << 20);
        q.add_free_object(entry(0x1000, 16), &heap).unwrap();
        heap.words.lock().insert(0x1008, 0x41);
        match q.add_free_object(entry(0x2000, 16), &heap).unwrap() {
            Admission::UseAfterFree(hit) => {
                assert_eq!(hit.address, 0x1008);
                assert_eq!(hit.value, 0x41);
                assert_eq!(hit.entry.start, 0x1000);
            }
            other => panic!("expected use-after-free, got {other:?}"),
        }
        assert!(heap.released.lock().is_empty());
    }

    #[test]
    fn final_check_drains_and_caps_errors() {
        let heap = FakeHeap::default();
        let mut q = QuarantineList::new(16, 1 << 20);
        for i in 0..8 {
            q.add_free_object(entry(0x1000 + i * 0x100, 16), &heap).unwrap();
        }
        for i in 0..6 {
            heap.words.lock().insert(0x1000 + i * 0x100, 0);
        }
        let hits = q.final_uaf_check(&heap).unwrap();
        assert_eq!(hits.len(), MAX_FINAL_UAF_ERRORS);
        assert_eq!(hits[0].entry.start, 0x1000);
    }

    #[test]
    fn restore_brings_back_ring_contents() {
        let heap = FakeHeap::default();
        let mut q = QuarantineList::new(4, 1 << 20);
        q.add_free_object(entry(0x1000, 16), &heap).unwrap();
        q.backup();
        q.add_free_object(entry(0x2000, 16), &heap).unwrap();
        q.free_lr_object(&heap).unwrap();
        q.restore();
        assert_eq!(q.entries(), vec![entry(0x1000, 16)]);
        assert_eq!(q.total_bytes(), 16);
    }
}
