//! Copy-on-write snapshot manager for one tracked memory region.
//!
//! A region owns three equally sized mappings:
//! - **transient**: the view every thread reads and writes.
//! - **persistent**: the state as of the last commit.
//! - **twins**: per-page copies of the transient page taken at its first
//!   write in the current epoch.
//!
//! The first write to a page in an epoch claims the page (at most once,
//! via a CAS on its state byte), copies it to its twin slot, records the
//! page version it observed, and appends it to a preallocated dirty list.
//! The fault path never allocates, so `handle_write` is safe to call from
//! the `SIGSEGV` handler in trap mode.
//!
//! Commit diffs each dirty page against its twin word by word and stores
//! only differing words into persistent memory, so threads that wrote
//! disjoint words of one page are all preserved. Rollback copies persistent
//! pages back over the dirty transient pages.

#![allow(unsafe_code)]

use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crate::config::WriteTracking;
use crate::error::EngineError;
use crate::mapping::Mapping;

/// Granularity of dirty tracking and protection.
pub const PAGE_SIZE: usize = 4096;

/// Granularity of commit diffs and canaries.
pub const WORD_SIZE: usize = std::mem::size_of::<u64>();

const WORDS_PER_PAGE: usize = PAGE_SIZE / WORD_SIZE;

const PAGE_CLEAN: u8 = 0;
const PAGE_CLAIMING: u8 = 1;
const PAGE_DIRTY: u8 = 2;

/// View of one page written in the current epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirtyPage {
    pub page_no: usize,
    /// Address of the page in the transient view.
    pub page_start: usize,
    /// Address of the twin copy taken at first write.
    pub twin: usize,
    /// Page version observed when the twin was taken.
    pub version: u64,
    /// More than one thread wrote this page during the epoch.
    pub shared: bool,
}

/// Result of diffing dirty pages into persistent memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitStats {
    pub pages: usize,
    pub words: usize,
}

/// Copy-on-write tracked region.
pub struct MemoryRegion {
    name: &'static str,
    tracking: WriteTracking,
    transient: Mapping,
    persistent: Mapping,
    twins: Mapping,
    total_pages: usize,
    state: Box<[AtomicU8]>,
    version: Box<[AtomicU64]>,
    observed: Box<[AtomicU64]>,
    writers: Box<[AtomicU64]>,
    users: Box<[AtomicU32]>,
    dirty: Box<[AtomicUsize]>,
    dirty_len: AtomicUsize,
}

fn atomic_slice<T>(n: usize, make: impl Fn() -> T) -> Box<[T]> {
    (0..n).map(|_| make()).collect()
}

impl MemoryRegion {
    /// Establish persistent, transient, and twin storage for `size` bytes
    /// (rounded up to whole pages). All bytes start zeroed.
    pub fn initialize(
        name: &'static str,
        size: usize,
        tracking: WriteTracking,
    ) -> Result<Self, EngineError> {
        let total_pages = size.div_ceil(PAGE_SIZE).max(1);
        let len = total_pages * PAGE_SIZE;
        let region = Self {
            name,
            tracking,
            transient: Mapping::anonymous(len)?,
            persistent: Mapping::anonymous(len)?,
            twins: Mapping::anonymous(len)?,
            total_pages,
            state: atomic_slice(total_pages, || AtomicU8::new(PAGE_CLEAN)),
            version: atomic_slice(total_pages, || AtomicU64::new(0)),
            observed: atomic_slice(total_pages, || AtomicU64::new(0)),
            writers: atomic_slice(total_pages, || AtomicU64::new(0)),
            users: atomic_slice(total_pages, || AtomicU32::new(0)),
            dirty: atomic_slice(total_pages, || AtomicUsize::new(0)),
            dirty_len: AtomicUsize::new(0),
        };
        if tracking == WriteTracking::Trap {
            region.transient.protect(0, len, false)?;
        }
        tracing::debug!(region = name, pages = total_pages, ?tracking, "region initialized");
        Ok(region)
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn tracking(&self) -> WriteTracking {
        self.tracking
    }

    /// First address of the transient view.
    #[must_use]
    pub fn start(&self) -> usize {
        self.transient.base()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.total_pages * PAGE_SIZE
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total_pages == 0
    }

    #[must_use]
    pub fn end(&self) -> usize {
        self.start() + self.len()
    }

    #[must_use]
    pub fn total_pages(&self) -> usize {
        self.total_pages
    }

    #[must_use]
    pub fn in_range(&self, addr: usize) -> bool {
        addr >= self.start() && addr < self.end()
    }

    /// True if `[addr, addr + len)` lies entirely inside the region.
    #[must_use]
    pub fn contains_range(&self, addr: usize, len: usize) -> bool {
        addr >= self.start() && addr.checked_add(len).is_some_and(|e| e <= self.end())
    }

    #[must_use]
    pub fn page_of(&self, addr: usize) -> Option<usize> {
        self.in_range(addr)
            .then(|| (addr - self.start()) / PAGE_SIZE)
    }

    // -----------------------------------------------------------------------
    // Write tracking
    // -----------------------------------------------------------------------

    /// Record that `addr` is about to be written.
    ///
    /// The first call for a page in an epoch snapshots the page into its twin
    /// and (in trap mode) lifts write protection. Concurrent callers for the
    /// same page wait until the twin is complete before returning.
    pub fn handle_write(&self, addr: usize, writer: Option<usize>) -> Result<(), EngineError> {
        let page = self
            .page_of(addr)
            .ok_or(EngineError::AddressOutOfRange { address: addr })?;

        if let Some(w) = writer {
            let bit = 1u64 << (w % 64);
            if self.writers[page].fetch_or(bit, Ordering::AcqRel) & bit == 0 {
                self.users[page].fetch_add(1, Ordering::Relaxed);
            }
        }

        loop {
            match self.state[page].compare_exchange(
                PAGE_CLEAN,
                PAGE_CLAIMING,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return self.claim(page),
                Err(PAGE_DIRTY) => return Ok(()),
                Err(_) => std::hint::spin_loop(),
            }
        }
    }

    fn claim(&self, page: usize) -> Result<(), EngineError> {
        let offset = page * PAGE_SIZE;
        // SAFETY: offset + PAGE_SIZE <= len for both mappings; twins is never
        // protected and transient is always readable.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.transient.as_ptr().add(offset),
                self.twins.as_ptr().add(offset),
                PAGE_SIZE,
            );
        }
        self.observed[page].store(self.version[page].load(Ordering::Acquire), Ordering::Release);
        let slot = self.dirty_len.fetch_add(1, Ordering::AcqRel);
        self.dirty[slot].store(page, Ordering::Release);

        let unprotect = if self.tracking == WriteTracking::Trap {
            self.transient.protect(offset, PAGE_SIZE, true)
        } else {
            Ok(())
        };
        self.state[page].store(PAGE_DIRTY, Ordering::Release);
        unprotect
    }

    /// Copy `bytes` into the transient view at `addr`, tracking every page touched.
    pub fn write(&self, addr: usize, bytes: &[u8], writer: Option<usize>) -> Result<(), EngineError> {
        if bytes.is_empty() {
            return Ok(());
        }
        if !self.contains_range(addr, bytes.len()) {
            return Err(EngineError::AddressOutOfRange { address: addr });
        }
        let last = addr + bytes.len() - 1;
        let mut page_addr = addr & !(PAGE_SIZE - 1);
        while page_addr <= last {
            self.handle_write(page_addr.max(addr), writer)?;
            page_addr += PAGE_SIZE;
        }
        // SAFETY: range checked above; pages are now writable.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len());
        }
        Ok(())
    }

    /// Fill `[addr, addr + len)` with `byte`, tracking every page touched.
    pub fn fill(&self, addr: usize, len: usize, byte: u8, writer: Option<usize>) -> Result<(), EngineError> {
        if len == 0 {
            return Ok(());
        }
        if !self.contains_range(addr, len) {
            return Err(EngineError::AddressOutOfRange { address: addr });
        }
        let last = addr + len - 1;
        let mut page_addr = addr & !(PAGE_SIZE - 1);
        while page_addr <= last {
            self.handle_write(page_addr.max(addr), writer)?;
            page_addr += PAGE_SIZE;
        }
        // SAFETY: range checked above; pages are now writable.
        unsafe { std::ptr::write_bytes(addr as *mut u8, byte, len) };
        Ok(())
    }

    /// Store one aligned word.
    pub fn write_word(&self, addr: usize, value: u64, writer: Option<usize>) -> Result<(), EngineError> {
        debug_assert_eq!(addr % WORD_SIZE, 0, "unaligned word store");
        if !self.contains_range(addr, WORD_SIZE) {
            return Err(EngineError::AddressOutOfRange { address: addr });
        }
        self.handle_write(addr, writer)?;
        // SAFETY: aligned, in range, page writable.
        unsafe { word_cell(addr) }.store(value, Ordering::Relaxed);
        Ok(())
    }

    /// Copy bytes out of the transient view.
    pub fn read(&self, addr: usize, buf: &mut [u8]) -> Result<(), EngineError> {
        if !self.contains_range(addr, buf.len()) {
            return Err(EngineError::AddressOutOfRange { address: addr });
        }
        // SAFETY: range checked; transient is always readable.
        unsafe {
            std::ptr::copy_nonoverlapping(addr as *const u8, buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    /// Load one aligned word from the transient view; out-of-range reads yield 0.
    #[must_use]
    pub fn load_word(&self, addr: usize) -> u64 {
        if addr % WORD_SIZE != 0 || !self.contains_range(addr, WORD_SIZE) {
            return 0;
        }
        // SAFETY: aligned and in range.
        unsafe { word_cell(addr) }.load(Ordering::Relaxed)
    }

    /// Load the committed value of the word at transient address `addr`.
    #[must_use]
    pub fn persistent_word(&self, addr: usize) -> u64 {
        if addr % WORD_SIZE != 0 || !self.contains_range(addr, WORD_SIZE) {
            return 0;
        }
        let mirror = self.persistent.base() + (addr - self.start());
        // SAFETY: same offset inside the equally sized persistent mapping.
        unsafe { word_cell(mirror) }.load(Ordering::Relaxed)
    }

    // -----------------------------------------------------------------------
    // Epoch transitions
    // -----------------------------------------------------------------------

    /// Re-arm protection and forget this epoch's dirty pages.
    pub fn begin_epoch(&self) -> Result<(), EngineError> {
        self.reset_dirty()
    }

    /// Diff every dirty page against its twin and publish changed words.
    pub fn check_and_commit(&self) -> CommitStats {
        let n = self.dirty_len.load(Ordering::Acquire);
        let mut stats = CommitStats::default();
        for slot in &self.dirty[..n] {
            let page = slot.load(Ordering::Acquire);
            stats.words += self.commit_page(page);
            stats.pages += 1;
            self.version[page].fetch_add(1, Ordering::AcqRel);
        }
        tracing::debug!(
            region = self.name,
            pages = stats.pages,
            words = stats.words,
            "region committed"
        );
        stats
    }

    fn commit_page(&self, page: usize) -> usize {
        let offset = page * PAGE_SIZE;
        let local = self.transient.base() + offset;
        let twin = self.twins.base() + offset;
        let shared = self.persistent.base() + offset;
        let mut changed = 0;
        for w in 0..WORDS_PER_PAGE {
            let at = w * WORD_SIZE;
            // SAFETY: all three addresses are aligned words inside their mappings.
            let (cur, old) = unsafe {
                (
                    word_cell(local + at).load(Ordering::Relaxed),
                    word_cell(twin + at).load(Ordering::Relaxed),
                )
            };
            if cur != old {
                // SAFETY: as above.
                unsafe { word_cell(shared + at) }.store(cur, Ordering::Relaxed);
                changed += 1;
            }
        }
        changed
    }

    /// Discard dirty pages: restore their transient contents from persistent
    /// memory. Returns the number of pages restored.
    pub fn rollback(&self) -> Result<usize, EngineError> {
        let n = self.dirty_len.load(Ordering::Acquire);
        for slot in &self.dirty[..n] {
            let offset = slot.load(Ordering::Acquire) * PAGE_SIZE;
            // SAFETY: dirty pages are writable in every tracking mode.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    self.persistent.as_ptr().add(offset),
                    self.transient.as_ptr().add(offset),
                    PAGE_SIZE,
                );
            }
        }
        self.reset_dirty()?;
        tracing::debug!(region = self.name, pages = n, "region rolled back");
        Ok(n)
    }

    fn reset_dirty(&self) -> Result<(), EngineError> {
        if self.tracking == WriteTracking::Trap {
            self.transient.protect(0, self.len(), false)?;
        }
        let n = self.dirty_len.load(Ordering::Acquire);
        for slot in &self.dirty[..n] {
            let page = slot.load(Ordering::Acquire);
            self.writers[page].store(0, Ordering::Relaxed);
            self.users[page].store(0, Ordering::Relaxed);
            self.state[page].store(PAGE_CLEAN, Ordering::Release);
        }
        self.dirty_len.store(0, Ordering::Release);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.dirty_len.load(Ordering::Acquire)
    }

    /// Snapshot of the dirty list.
    #[must_use]
    pub fn dirty_pages(&self) -> Vec<DirtyPage> {
        let n = self.dirty_len.load(Ordering::Acquire);
        self.dirty[..n]
            .iter()
            .map(|slot| {
                let page = slot.load(Ordering::Acquire);
                DirtyPage {
                    page_no: page,
                    page_start: self.start() + page * PAGE_SIZE,
                    twin: self.twins.base() + page * PAGE_SIZE,
                    version: self.observed[page].load(Ordering::Acquire),
                    shared: self.users[page].load(Ordering::Relaxed) > 1,
                }
            })
            .collect()
    }

    #[must_use]
    pub fn version(&self, page: usize) -> u64 {
        self.version[page].load(Ordering::Acquire)
    }

    /// Distinct writer threads seen on `page` this epoch.
    #[must_use]
    pub fn user_count(&self, page: usize) -> u32 {
        self.users[page].load(Ordering::Relaxed)
    }

    /// BLAKE3 digest of the committed state.
    #[must_use]
    pub fn persistent_digest(&self) -> blake3::Hash {
        // SAFETY: persistent is readable for len() bytes.
        blake3::hash(unsafe { std::slice::from_raw_parts(self.persistent.as_ptr(), self.len()) })
    }

    /// BLAKE3 digest of the transient view.
    #[must_use]
    pub fn transient_digest(&self) -> blake3::Hash {
        // SAFETY: transient is readable for len() bytes.
        blake3::hash(unsafe { std::slice::from_raw_parts(self.transient.as_ptr(), self.len()) })
    }
}

impl std::fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("name", &self.name)
            .field("start", &format_args!("{:#x}", self.start()))
            .field("pages", &self.total_pages)
            .field("dirty", &self.dirty_count())
            .finish()
    }
}

/// # Safety
/// `addr` must be 8-byte aligned and inside a live mapping.
unsafe fn word_cell<'a>(addr: usize) -> &'a AtomicU64 {
    // SAFETY: guaranteed by caller.
    unsafe { &*(addr as *const AtomicU64) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(pages: usize) -> MemoryRegion {
        MemoryRegion::initialize("test", pages * PAGE_SIZE, WriteTracking::Explicit)
            .expect("region")
    }

    #[test]
    fn first_write_creates_one_dirty_page() {
        let r = region(4);
        let addr = r.start() + PAGE_SIZE + 16;
        r.write_word(addr, 0xAB, Some(0)).unwrap();
        r.write_word(addr + 8, 0xCD, Some(0)).unwrap();
        assert_eq!(r.dirty_count(), 1);
        let pages = r.dirty_pages();
        assert_eq!(pages[0].page_no, 1);
        assert_eq!(pages[0].version, 0);
        assert!(!pages[0].shared);
    }

    #[test]
    fn commit_publishes_only_changed_words_and_bumps_version() {
        let r = region(2);
        let addr = r.start() + 64;
        r.write_word(addr, 7, None).unwrap();
        assert_eq!(r.persistent_word(addr), 0);
        let stats = r.check_and_commit();
        assert_eq!(stats, CommitStats { pages: 1, words: 1 });
        assert_eq!(r.persistent_word(addr), 7);
        assert_eq!(r.version(0), 1);
        assert_eq!(r.version(1), 0);
    }

    #[test]
    fn disjoint_writers_on_one_page_are_both_preserved() {
        let r = region(1);
        let a = r.start();
        let b = r.start() + 8;
        r.write_word(a, 1, Some(0)).unwrap();
        r.write_word(b, 2, Some(1)).unwrap();
        assert_eq!(r.user_count(0), 2);
        assert!(r.dirty_pages()[0].shared);
        r.check_and_commit();
        assert_eq!(r.persistent_word(a), 1);
        assert_eq!(r.persistent_word(b), 2);
    }

    #[test]
    fn rollback_restores_last_commit() {
        let r = region(3);
        let addr = r.start() + 2 * PAGE_SIZE;
        r.write_word(addr, 11, None).unwrap();
        r.check_and_commit();
        r.begin_epoch().unwrap();
        let committed = r.transient_digest();

        r.write_word(addr, 99, None).unwrap();
        r.write(r.start(), &[0xFF; 32], None).unwrap();
        assert_ne!(r.transient_digest(), committed);
        assert_eq!(r.rollback().unwrap(), 2);
        assert_eq!(r.load_word(addr), 11);
        assert_eq!(r.transient_digest(), committed);
        assert_eq!(r.dirty_count(), 0);
    }

    #[test]
    fn commit_without_writes_is_noop_and_repeatable() {
        let r = region(2);
        let before = r.persistent_digest();
        assert_eq!(r.check_and_commit(), CommitStats::default());
        assert_eq!(r.persistent_digest(), before);

        r.write(r.start() + 100, b"hello", None).unwrap();
        r.check_and_commit();
        let once = r.persistent_digest();
        r.check_and_commit();
        assert_eq!(r.persistent_digest(), once);
    }

    #[test]
    fn writes_spanning_pages_dirty_both() {
        let r = region(2);
        r.write(r.start() + PAGE_SIZE - 4, &[1u8; 8], None).unwrap();
        assert_eq!(r.dirty_count(), 2);
    }

    #[test]
    fn out_of_range_write_is_rejected() {
        let r = region(1);
        let err = r.handle_write(r.end(), None).unwrap_err();
        assert!(matches!(err, EngineError::AddressOutOfRange { .. }));
        assert!(r.write(r.end() - 2, &[0; 4], None).is_err());
    }
}
