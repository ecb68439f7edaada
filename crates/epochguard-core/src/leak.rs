//! End-of-program leak scan.
//!
//! Conservative reachability: every word of the globals region is a root,
//! any word whose value falls inside a live tracked block marks that block
//! reachable, and reachable payloads are scanned the same way. Live blocks
//! never reached are leaks.

use std::collections::HashSet;

use crate::region::{MemoryRegion, WORD_SIZE};
use crate::tracking::{ObjectRecord, ObjectTable};

/// Live objects not reachable from `roots`.
#[must_use]
pub fn find_leaks(roots: &MemoryRegion, heap: &MemoryRegion, objects: &ObjectTable) -> Vec<ObjectRecord> {
    let live = objects.live_objects();
    if live.is_empty() {
        return Vec::new();
    }
    let mut reached: HashSet<usize> = HashSet::new();
    let mut work: Vec<ObjectRecord> = Vec::new();

    let visit = |value: u64, reached: &mut HashSet<usize>, work: &mut Vec<ObjectRecord>| {
        let Ok(addr) = usize::try_from(value) else {
            return;
        };
        if !heap.in_range(addr) {
            return;
        }
        if let Some(rec) = objects.enclosing(addr)
            && !rec.is_freed()
            && reached.insert(rec.raw)
        {
            work.push(rec);
        }
    };

    let mut addr = roots.start();
    while addr < roots.end() {
        visit(roots.load_word(addr), &mut reached, &mut work);
        addr += WORD_SIZE;
    }

    while let Some(rec) = work.pop() {
        let mut addr = rec.start;
        let end = rec.start + rec.size;
        while addr + WORD_SIZE <= end {
            visit(heap.load_word(addr), &mut reached, &mut work);
            addr += WORD_SIZE;
        }
    }

    live.into_iter()
        .filter(|rec| !reached.contains(&rec.raw))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::HeapAllocator;
    use crate::bitmap::CorruptionBitmap;
    use crate::config::WriteTracking;
    use crate::tracking::CallSite;
    use std::sync::Arc;

    fn setup() -> (MemoryRegion, HeapAllocator) {
        let globals = MemoryRegion::initialize("globals", 4096, WriteTracking::Explicit).unwrap();
        let region =
            Arc::new(MemoryRegion::initialize("heap", 1 << 20, WriteTracking::Explicit).unwrap());
        let bitmap = Arc::new(CorruptionBitmap::for_region(&region));
        (globals, HeapAllocator::new(region, bitmap, 1))
    }

    #[test]
    fn unrooted_object_is_a_leak() {
        let (globals, heap) = setup();
        let kept = heap.malloc(0, 32, CallSite::caller()).unwrap();
        let lost = heap.malloc(0, 32, CallSite::caller()).unwrap();
        globals.write_word(globals.start(), kept as u64, None).unwrap();
        let leaks = find_leaks(&globals, heap.region(), heap.objects());
        assert_eq!(leaks.len(), 1);
        assert_eq!(leaks[0].start, lost);
    }

    #[test]
    fn objects_reached_through_heap_pointers_are_not_leaks() {
        let (globals, heap) = setup();
        let head = heap.malloc(0, 16, CallSite::caller()).unwrap();
        let tail = heap.malloc(0, 16, CallSite::caller()).unwrap();
        heap.region().write_word(head, tail as u64, None).unwrap();
        globals
            .write_word(globals.start() + 64, head as u64, None)
            .unwrap();
        assert!(find_leaks(&globals, heap.region(), heap.objects()).is_empty());
    }

    #[test]
    fn interior_pointers_keep_objects_alive() {
        let (globals, heap) = setup();
        let p = heap.malloc(0, 100, CallSite::caller()).unwrap();
        globals
            .write_word(globals.start(), (p + 40) as u64, None)
            .unwrap();
        assert!(find_leaks(&globals, heap.region(), heap.objects()).is_empty());
    }
}
