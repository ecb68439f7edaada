//! One bit per heap word marking canary positions.
//!
//! Only canary words have their bit set, so an epoch-end scan costs one
//! read per canary rather than one per heap word. Marking is lock-free;
//! the backup/restore pair keeps marks consistent with rolled-back memory.
//!
//! Canary encodings:
//! - A full canary word holds [`SENTINEL_WORD`]; aligned-allocation prefixes
//!   hold [`MEMALIGN_SENTINEL_WORD`].
//! - An object whose size is not a word multiple gets a *short* canary in
//!   its last partial word. The unused tail bytes hold the tail length minus
//!   one in the first byte and [`MAGIC_BYTE_NOT_ALIGNED`] in the rest (a
//!   single unused byte holds the magic byte). A short canary is always
//!   followed by a marked full canary word.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::EngineError;
use crate::region::{MemoryRegion, WORD_SIZE};

/// Value of a full canary word.
pub const SENTINEL_WORD: u64 = 0xCAFE_BABE_CAFE_BABE;

/// Marker placed before pointers returned by aligned allocation.
pub const MEMALIGN_SENTINEL_WORD: u64 = 0xDADE_BABE_DADE_BABE;

/// Fill byte for unused tail bytes of a short canary.
pub const MAGIC_BYTE_NOT_ALIGNED: u8 = 0x7E;

const BITS: usize = u64::BITS as usize;

/// A corrupted canary found by a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanaryFault {
    /// Address of the corrupted canary word.
    pub address: usize,
    /// Value found in the word.
    pub value: u64,
    /// Start of the object whose canary this is, if it could be found by
    /// walking back through the bitmap.
    pub object_start: Option<usize>,
}

/// Outcome of [`CorruptionBitmap::verify_range`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CanaryScan {
    pub checked: usize,
    pub faults: Vec<CanaryFault>,
}

impl CanaryScan {
    #[must_use]
    pub fn is_corrupted(&self) -> bool {
        !self.faults.is_empty()
    }
}

/// Canary bitmap over one heap region.
pub struct CorruptionBitmap {
    base: usize,
    words: usize,
    bits: Box<[AtomicU64]>,
    backup: Mutex<Vec<u64>>,
}

impl CorruptionBitmap {
    /// Bitmap covering `[base, base + len)`.
    #[must_use]
    pub fn new(base: usize, len: usize) -> Self {
        let words = len / WORD_SIZE;
        let bits = (0..words.div_ceil(BITS)).map(|_| AtomicU64::new(0)).collect();
        Self {
            base,
            words,
            bits,
            backup: Mutex::new(Vec::new()),
        }
    }

    /// Bitmap covering a whole region.
    #[must_use]
    pub fn for_region(region: &MemoryRegion) -> Self {
        Self::new(region.start(), region.len())
    }

    fn index(&self, addr: usize) -> Option<usize> {
        if addr < self.base || addr % WORD_SIZE != 0 {
            return None;
        }
        let idx = (addr - self.base) / WORD_SIZE;
        (idx < self.words).then_some(idx)
    }

    fn addr_of(&self, idx: usize) -> usize {
        self.base + idx * WORD_SIZE
    }

    fn bit_set(&self, idx: usize) -> bool {
        idx < self.words && self.bits[idx / BITS].load(Ordering::Acquire) & (1u64 << (idx % BITS)) != 0
    }

    /// Mark a canary word. Returns true if the bit was newly set.
    pub fn mark_canary(&self, addr: usize) -> bool {
        let Some(idx) = self.index(addr) else {
            return false;
        };
        let mask = 1u64 << (idx % BITS);
        self.bits[idx / BITS].fetch_or(mask, Ordering::AcqRel) & mask == 0
    }

    /// Clear a canary mark.
    pub fn clear_canary(&self, addr: usize) {
        if let Some(idx) = self.index(addr) {
            let mask = 1u64 << (idx % BITS);
            self.bits[idx / BITS].fetch_and(!mask, Ordering::AcqRel);
        }
    }

    #[must_use]
    pub fn is_marked(&self, addr: usize) -> bool {
        self.index(addr).is_some_and(|idx| self.bit_set(idx))
    }

    /// Write [`SENTINEL_WORD`] at `addr` and mark it.
    pub fn set_sentinel_at(
        &self,
        region: &MemoryRegion,
        addr: usize,
        writer: Option<usize>,
    ) -> Result<(), EngineError> {
        region.write_word(addr, SENTINEL_WORD, writer)?;
        self.mark_canary(addr);
        Ok(())
    }

    /// Write [`MEMALIGN_SENTINEL_WORD`] at `addr` and mark it.
    pub fn set_memalign_sentinel_at(
        &self,
        region: &MemoryRegion,
        addr: usize,
        writer: Option<usize>,
    ) -> Result<(), EngineError> {
        region.write_word(addr, MEMALIGN_SENTINEL_WORD, writer)?;
        self.mark_canary(addr);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Verification
    // -----------------------------------------------------------------------

    /// Check every marked word in `[start, start + size)`.
    #[must_use]
    pub fn verify_range(&self, region: &MemoryRegion, start: usize, size: usize) -> CanaryScan {
        let mut scan = CanaryScan::default();
        if size == 0 {
            return scan;
        }
        let first = start.max(self.base);
        let last = (start + size).min(self.base + self.words * WORD_SIZE);
        if first >= last {
            return scan;
        }
        let first_idx = (first - self.base) / WORD_SIZE;
        let last_idx = (last - self.base).div_ceil(WORD_SIZE);

        for word_idx in first_idx / BITS..last_idx.div_ceil(BITS) {
            let bits = self.bits[word_idx].load(Ordering::Acquire);
            if bits == 0 {
                continue;
            }
            for bit in 0..BITS {
                if bits & (1u64 << bit) == 0 {
                    continue;
                }
                let idx = word_idx * BITS + bit;
                if idx < first_idx || idx >= last_idx {
                    continue;
                }
                scan.checked += 1;
                if let Some(fault) = self.check_word(region, idx) {
                    scan.faults.push(fault);
                }
            }
        }
        scan
    }

    fn check_word(&self, region: &MemoryRegion, idx: usize) -> Option<CanaryFault> {
        let addr = self.addr_of(idx);
        let value = region.load_word(addr);
        if value == SENTINEL_WORD || value == MEMALIGN_SENTINEL_WORD {
            return None;
        }
        // A marked non-sentinel word is legitimate only as a short canary,
        // which is always followed by a marked full canary.
        let bad = if self.bit_set(idx + 1) {
            is_corrupted_short_canary(value)
        } else {
            true
        };
        bad.then(|| CanaryFault {
            address: addr,
            value,
            object_start: self.find_object_start(region, addr),
        })
    }

    /// Walk back from `addr` through earlier marks to the leading canary of
    /// the enclosing object, skipping aligned-allocation markers and short
    /// canaries. Returns the first payload byte after that canary.
    #[must_use]
    pub fn find_object_start(&self, region: &MemoryRegion, addr: usize) -> Option<usize> {
        let mut idx = self.index(addr & !(WORD_SIZE - 1))?;
        while let Some(prev) = self.last_set_before(idx) {
            let canary = self.addr_of(prev);
            let value = region.load_word(canary);
            if value == SENTINEL_WORD {
                return Some(canary + WORD_SIZE);
            }
            if value == MEMALIGN_SENTINEL_WORD
                || (self.bit_set(prev + 1) && !is_corrupted_short_canary(value))
            {
                idx = prev;
                continue;
            }
            return None;
        }
        None
    }

    fn last_set_before(&self, idx: usize) -> Option<usize> {
        if idx == 0 {
            return None;
        }
        let mut word_idx = (idx - 1) / BITS;
        let mut mask = if (idx - 1) % BITS == BITS - 1 {
            u64::MAX
        } else {
            (1u64 << ((idx - 1) % BITS + 1)) - 1
        };
        loop {
            let bits = self.bits[word_idx].load(Ordering::Acquire) & mask;
            if bits != 0 {
                return Some(word_idx * BITS + (BITS - 1 - bits.leading_zeros() as usize));
            }
            if word_idx == 0 {
                return None;
            }
            word_idx -= 1;
            mask = u64::MAX;
        }
    }

    // -----------------------------------------------------------------------
    // Snapshot
    // -----------------------------------------------------------------------

    /// Save marks covering the first `used` bytes of the heap.
    pub fn backup(&self, used: usize) {
        let n = (used / WORD_SIZE).div_ceil(BITS).min(self.bits.len());
        let mut saved = self.backup.lock();
        saved.clear();
        saved.extend(self.bits[..n].iter().map(|w| w.load(Ordering::Acquire)));
    }

    /// Restore marks saved by [`CorruptionBitmap::backup`]; marks beyond the
    /// saved range are cleared.
    pub fn restore(&self) {
        let saved = self.backup.lock();
        for (i, word) in self.bits.iter().enumerate() {
            word.store(saved.get(i).copied().unwrap_or(0), Ordering::Release);
        }
    }
}

// ---------------------------------------------------------------------------
// Short canaries
// ---------------------------------------------------------------------------

/// Encode the tail bytes of a short canary for an object whose last word
/// holds `used` payload bytes (`1..WORD_SIZE`).
#[must_use]
pub fn short_canary_tail(used: usize) -> Vec<u8> {
    debug_assert!((1..WORD_SIZE).contains(&used));
    let set_bytes = WORD_SIZE - used;
    let mut tail = vec![MAGIC_BYTE_NOT_ALIGNED; set_bytes];
    if set_bytes >= 2 {
        tail[0] = (set_bytes - 1) as u8;
    }
    tail
}

/// True if `word` is not a well-formed short canary.
///
/// Counts magic bytes from the top of the word down. No magic bytes means
/// corruption; otherwise the byte below them must equal their count, except
/// when exactly one magic byte is present (a one-byte tail carries no count).
#[must_use]
pub fn is_corrupted_short_canary(word: u64) -> bool {
    let bytes = word.to_le_bytes();
    let magic = bytes
        .iter()
        .rev()
        .take_while(|&&b| b == MAGIC_BYTE_NOT_ALIGNED)
        .count();
    if magic == 0 || magic == WORD_SIZE {
        return true;
    }
    magic != 1 && usize::from(bytes[WORD_SIZE - 1 - magic]) != magic
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WriteTracking;

    fn setup() -> (MemoryRegion, CorruptionBitmap) {
        let region = MemoryRegion::initialize("heap", 4 * 4096, WriteTracking::Explicit).unwrap();
        let bitmap = CorruptionBitmap::for_region(&region);
        (region, bitmap)
    }

    fn short_word(used: usize, payload: u8) -> u64 {
        let mut bytes = [payload; WORD_SIZE];
        bytes[used..].copy_from_slice(&short_canary_tail(used));
        u64::from_le_bytes(bytes)
    }

    #[test]
    fn mark_and_clear() {
        let (region, bitmap) = setup();
        let addr = region.start() + 64;
        assert!(bitmap.mark_canary(addr));
        assert!(!bitmap.mark_canary(addr));
        assert!(bitmap.is_marked(addr));
        bitmap.clear_canary(addr);
        assert!(!bitmap.is_marked(addr));
        assert!(!bitmap.mark_canary(addr + 3), "unaligned addresses are ignored");
    }

    #[test]
    fn intact_sentinels_verify_clean() {
        let (region, bitmap) = setup();
        for i in 0..10 {
            bitmap.set_sentinel_at(&region, region.start() + i * 64, None).unwrap();
        }
        let scan = bitmap.verify_range(&region, region.start(), region.len());
        assert_eq!(scan.checked, 10);
        assert!(!scan.is_corrupted());
    }

    #[test]
    fn overwritten_sentinel_reports_exact_address_and_object() {
        let (region, bitmap) = setup();
        let lead = region.start() + 128;
        let object = lead + 8;
        let trail = object + 64;
        bitmap.set_sentinel_at(&region, lead, None).unwrap();
        bitmap.set_sentinel_at(&region, trail, None).unwrap();

        region.write(trail, &[0x41], None).unwrap();
        let scan = bitmap.verify_range(&region, region.start(), region.len());
        assert_eq!(scan.faults.len(), 1);
        let fault = scan.faults[0];
        assert_eq!(fault.address, trail);
        assert_eq!(fault.object_start, Some(object));
    }

    #[test]
    fn short_canary_encodings_round_trip() {
        for used in 1..WORD_SIZE {
            let word = short_word(used, 0x11);
            assert!(!is_corrupted_short_canary(word), "used={used}");
        }
        assert!(is_corrupted_short_canary(0));
        assert!(is_corrupted_short_canary(u64::from_le_bytes([MAGIC_BYTE_NOT_ALIGNED; 8])));
    }

    #[test]
    fn short_canary_count_byte_corruption_is_detected() {
        // 5 payload bytes: tail is [2, 0x7E, 0x7E].
        let mut bytes = short_word(5, 0).to_le_bytes();
        bytes[5] = 0x41;
        assert!(is_corrupted_short_canary(u64::from_le_bytes(bytes)));
        let mut bytes = short_word(5, 0).to_le_bytes();
        bytes[7] = 0x00;
        assert!(is_corrupted_short_canary(u64::from_le_bytes(bytes)));
    }

    #[test]
    fn short_canary_followed_by_mark_is_accepted() {
        let (region, bitmap) = setup();
        let word = region.start() + 256;
        region.write_word(word, short_word(3, 0x22), None).unwrap();
        bitmap.mark_canary(word);
        bitmap.set_sentinel_at(&region, word + 8, None).unwrap();
        assert!(!bitmap.verify_range(&region, word, 16).is_corrupted());

        // Without the following mark the word must be a full sentinel.
        bitmap.clear_canary(word + 8);
        assert!(bitmap.verify_range(&region, word, 16).is_corrupted());
    }

    #[test]
    fn find_object_start_skips_memalign_marker() {
        let (region, bitmap) = setup();
        let lead = region.start() + 512;
        bitmap.set_sentinel_at(&region, lead, None).unwrap();
        bitmap.set_memalign_sentinel_at(&region, lead + 64, None).unwrap();
        assert_eq!(bitmap.find_object_start(&region, lead + 200), Some(lead + 8));
    }

    #[test]
    fn last_set_before_crosses_bitmap_words() {
        let (region, bitmap) = setup();
        let early = region.start() + 8 * 3;
        bitmap.mark_canary(early);
        let far = region.start() + 8 * 200;
        assert_eq!(bitmap.last_set_before(200), Some(3));
        assert_eq!(bitmap.last_set_before(3), None);
        assert_eq!(bitmap.index(far), Some(200));
    }

    #[test]
    fn restore_drops_marks_added_after_backup() {
        let (region, bitmap) = setup();
        let a = region.start() + 16;
        let b = region.start() + 4096 + 16;
        bitmap.mark_canary(a);
        bitmap.backup(region.len());
        bitmap.mark_canary(b);
        bitmap.clear_canary(a);
        bitmap.restore();
        assert!(bitmap.is_marked(a));
        assert!(!bitmap.is_marked(b));
    }
}
