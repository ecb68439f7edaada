//! Seeded operation sequences over regions and the heap allocator.

use std::sync::Arc;

use epochguard_core::bitmap::CorruptionBitmap;
use epochguard_core::{CallSite, HeapAllocator, MemoryRegion, PAGE_SIZE, WORD_SIZE, WriteTracking};

#[derive(Clone, Copy, Debug)]
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        // xorshift64*
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn gen_range_usize(&mut self, low: usize, high_inclusive: usize) -> usize {
        assert!(low <= high_inclusive);
        let span = high_inclusive - low + 1;
        low + (self.next_u64() as usize % span)
    }
}

#[test]
fn commit_and_rollback_track_a_shadow_model() {
    const SEEDS: [u64; 4] = [1, 2, 3, 4];
    const STEPS: usize = 1_500;
    const PAGES: usize = 8;
    const WORDS: usize = PAGES * PAGE_SIZE / WORD_SIZE;

    for seed in SEEDS {
        let region =
            MemoryRegion::initialize("seq", PAGES * PAGE_SIZE, WriteTracking::Explicit).unwrap();
        let mut rng = XorShift64::new(seed);
        let mut committed = vec![0u64; WORDS];
        let mut working = committed.clone();
        let mut commits = 0;
        let mut rollbacks = 0;

        for step in 0..STEPS {
            match rng.gen_range_usize(0, 99) {
                0..=79 => {
                    let w = rng.gen_range_usize(0, WORDS - 1);
                    let value = rng.next_u64();
                    let writer = rng.gen_range_usize(0, 3);
                    region
                        .write_word(region.start() + w * WORD_SIZE, value, Some(writer))
                        .unwrap();
                    working[w] = value;
                }
                80..=89 => {
                    let stats = region.check_and_commit();
                    assert!(stats.pages <= PAGES, "seed={seed} step={step}");
                    region.begin_epoch().unwrap();
                    committed.clone_from(&working);
                    commits += 1;
                }
                _ => {
                    region.rollback().unwrap();
                    working.clone_from(&committed);
                    rollbacks += 1;
                }
            }

            if step % 50 == 0 {
                for (w, &expected) in working.iter().enumerate() {
                    let addr = region.start() + w * WORD_SIZE;
                    assert_eq!(region.load_word(addr), expected, "seed={seed} step={step} word={w}");
                    assert_eq!(
                        region.persistent_word(addr),
                        committed[w],
                        "seed={seed} step={step} word={w}"
                    );
                }
            }
        }
        assert!(commits > 0 && rollbacks > 0, "seed={seed}");
    }
}

#[test]
fn rollback_returns_digest_to_epoch_begin() {
    for seed in [7u64, 11, 13] {
        let region =
            MemoryRegion::initialize("digest", 4 * PAGE_SIZE, WriteTracking::Explicit).unwrap();
        let mut rng = XorShift64::new(seed);
        for _ in 0..64 {
            let off = rng.gen_range_usize(0, region.len() / WORD_SIZE - 1) * WORD_SIZE;
            region
                .write_word(region.start() + off, rng.next_u64(), None)
                .unwrap();
        }
        region.check_and_commit();
        region.begin_epoch().unwrap();
        let begin = region.transient_digest();
        assert_eq!(begin, region.persistent_digest(), "seed={seed}");

        for _ in 0..64 {
            let len = rng.gen_range_usize(1, 300);
            let off = rng.gen_range_usize(0, region.len() - len);
            region
                .fill(region.start() + off, len, rng.next_u64() as u8, Some(0))
                .unwrap();
        }
        region.rollback().unwrap();
        assert_eq!(region.transient_digest(), begin, "seed={seed}");
        assert_eq!(region.dirty_count(), 0, "seed={seed}");
    }
}

#[test]
fn allocator_sequences_keep_objects_disjoint_and_canaries_intact() {
    const SEEDS: [u64; 3] = [21, 22, 23];
    const STEPS: usize = 800;
    const SLOTS: usize = 24;

    for seed in SEEDS {
        let region = Arc::new(
            MemoryRegion::initialize("heap", 8 << 20, WriteTracking::Explicit).unwrap(),
        );
        let bitmap = Arc::new(CorruptionBitmap::for_region(&region));
        let heap = HeapAllocator::new(Arc::clone(&region), bitmap, 2);
        let mut rng = XorShift64::new(seed);
        let mut live: Vec<Option<(usize, usize, u8)>> = vec![None; SLOTS];

        for step in 0..STEPS {
            let i = rng.gen_range_usize(0, SLOTS - 1);
            match live[i].take() {
                None => {
                    let size = rng.gen_range_usize(1, 2048);
                    let owner = rng.gen_range_usize(0, 1);
                    let ptr = if rng.gen_range_usize(0, 4) == 0 {
                        let align = 1usize << rng.gen_range_usize(5, 9);
                        let p = heap.memalign(owner, align, size, CallSite::caller()).unwrap();
                        assert_eq!(p % align, 0, "seed={seed} step={step}");
                        p
                    } else {
                        heap.malloc(owner, size, CallSite::caller()).unwrap()
                    };
                    let fill = rng.next_u64() as u8;
                    region.fill(ptr, size, fill, Some(owner)).unwrap();
                    live[i] = Some((ptr, size, fill));
                }
                Some((ptr, size, fill)) => {
                    let rec = heap.resolve(ptr).expect("live object resolves");
                    assert_eq!(rec.size, size, "seed={seed} step={step}");
                    let mut buf = vec![0u8; size];
                    region.read(ptr, &mut buf).unwrap();
                    assert!(buf.iter().all(|&b| b == fill), "seed={seed} step={step}");
                    assert!(heap.check(&rec).faults.is_empty(), "seed={seed} step={step}");
                    heap.unmark(&rec);
                    heap.release(rec.raw, Some(rec.thread)).unwrap();
                }
            }

            if step % 100 == 0 {
                let mut spans: Vec<(usize, usize)> = live
                    .iter()
                    .flatten()
                    .map(|&(p, s, _)| (p, p + s))
                    .collect();
                spans.sort_unstable();
                for pair in spans.windows(2) {
                    assert!(pair[0].1 <= pair[1].0, "seed={seed} step={step} overlap");
                }
                let scan = heap.check_all();
                assert!(scan.faults.is_empty(), "seed={seed} step={step}: {:?}", scan.faults);
            }
        }
    }
}

#[test]
fn allocator_restore_replays_identical_addresses() {
    let region =
        Arc::new(MemoryRegion::initialize("heap", 4 << 20, WriteTracking::Explicit).unwrap());
    let bitmap = Arc::new(CorruptionBitmap::for_region(&region));
    let heap = HeapAllocator::new(Arc::clone(&region), bitmap, 1);
    heap.backup();

    let mut rng = XorShift64::new(99);
    let sizes: Vec<usize> = (0..40).map(|_| rng.gen_range_usize(1, 900)).collect();
    let first: Vec<usize> = sizes
        .iter()
        .map(|&s| heap.malloc(0, s, CallSite::caller()).unwrap())
        .collect();

    region.rollback().unwrap();
    heap.restore();
    let second: Vec<usize> = sizes
        .iter()
        .map(|&s| heap.malloc(0, s, CallSite::caller()).unwrap())
        .collect();
    assert_eq!(first, second);
    assert_eq!(heap.objects().live_objects().len(), sizes.len());
}
