use kernel_memblock::{ALLOC_ACCESSIBLE, ALLOC_ANYWHERE, FreeRange, Memblock, RegionSet};
use kernel_memory_addresses::{DirectMapper, PAGE_SIZE, PhysicalAddress};
use sim_ram::SimulatedRam;

static NO_RAM: DirectMapper = DirectMapper::identity();

fn pa(v: u64) -> PhysicalAddress {
    PhysicalAddress::new(v)
}

fn assert_well_formed(set: &RegionSet<'_>) {
    let regions = set.regions();
    for pair in regions.windows(2) {
        assert!(
            pair[0].end() <= pair[1].base(),
            "{:?} overlaps {:?}",
            pair[0],
            pair[1]
        );
        assert!(
            pair[0].end() != pair[1].base() || pair[0].node() != pair[1].node(),
            "{:?} and {:?} were not merged",
            pair[0],
            pair[1]
        );
    }
    assert!(regions.iter().all(|r| r.size() > 0));
    assert_eq!(
        set.total_size(),
        regions.iter().map(|r| r.size()).sum::<u64>()
    );
}

/// Page coverage of `set` within `[base, base + pages * PAGE_SIZE)`.
fn coverage(set: &RegionSet<'_>, base: u64, pages: usize) -> Vec<bool> {
    (0..pages as u64)
        .map(|p| set.search(pa(base + p * PAGE_SIZE)).is_some())
        .collect()
}

struct XorShift(u64);

impl XorShift {
    fn next(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }

    fn below(&mut self, n: u64) -> u64 {
        self.next() % n
    }
}

#[test]
fn random_operations_keep_sets_sorted_disjoint_and_merged() {
    const BASE: u64 = 0x4000_0000;
    const PAGES: usize = 512;
    const WORK: u64 = PAGES as u64 * PAGE_SIZE;

    // Upper half is memory that random operations never touch, so grown
    // arrays always have somewhere to live.
    let ram = SimulatedRam::new(BASE, 2 * WORK).unwrap();
    let mut mb = Memblock::new(&ram);
    mb.add(pa(BASE + WORK), WORK).unwrap();
    mb.allow_resize();

    let mut memory = vec![false; PAGES];
    let mut reserved = vec![false; PAGES];
    let mut rng = XorShift(0x9e37_79b9_7f4a_7c15);

    for _ in 0..4000 {
        let first = rng.below(PAGES as u64 - 1);
        let count = 1 + rng.below(12.min(PAGES as u64 - first));
        let base = pa(BASE + first * PAGE_SIZE);
        let size = count * PAGE_SIZE;
        let pages = first as usize..(first + count) as usize;

        match rng.below(4) {
            0 => {
                mb.add(base, size).unwrap();
                memory[pages].fill(true);
            }
            1 => {
                mb.remove(base, size).unwrap();
                memory[pages].fill(false);
            }
            2 => {
                mb.reserve(base, size).unwrap();
                reserved[pages].fill(true);
            }
            _ => {
                mb.free(base, size).unwrap();
                reserved[pages].fill(false);
            }
        }

        assert_well_formed(mb.memory());
        assert_well_formed(mb.reserved());
    }

    assert_eq!(coverage(mb.memory(), BASE, PAGES), memory);
    assert_eq!(coverage(mb.reserved(), BASE, PAGES), reserved);
}

#[test]
fn adding_an_identical_region_is_idempotent() {
    let mut mb = Memblock::new(&NO_RAM);
    mb.add(pa(0x8000_0000), 0x100_0000).unwrap();
    mb.add(pa(0x9000_0000), 0x100_0000).unwrap();
    mb.reserve(pa(0x8000_1000), 0x3000).unwrap();

    let (mem_cnt, mem_size) = (mb.memory().len(), mb.memory().total_size());
    let (rsv_cnt, rsv_size) = (mb.reserved().len(), mb.reserved().total_size());

    mb.add(pa(0x9000_0000), 0x100_0000).unwrap();
    mb.reserve(pa(0x8000_1000), 0x3000).unwrap();
    mb.reserve(pa(0x8000_2000), 0x1000).unwrap();

    assert_eq!(
        (mb.memory().len(), mb.memory().total_size()),
        (mem_cnt, mem_size)
    );
    assert_eq!(
        (mb.reserved().len(), mb.reserved().total_size()),
        (rsv_cnt, rsv_size)
    );
}

#[test]
fn overlapping_add_yields_the_union() {
    let mut mb = Memblock::new(&NO_RAM);
    mb.add(pa(0x1_0000), 0x1_0000).unwrap();
    mb.add(pa(0x3_0000), 0x1_0000).unwrap();
    mb.add(pa(0x1_8000), 0x2_0000).unwrap();

    assert_eq!(mb.memory().len(), 1);
    assert_eq!(mb.start_of_dram(), pa(0x1_0000));
    assert_eq!(mb.end_of_dram(), pa(0x4_0000));
    assert_eq!(mb.phys_mem_size(), 0x3_0000);
}

#[test]
fn add_then_remove_restores_previous_set() {
    let mut mb = Memblock::new(&NO_RAM);
    mb.add(pa(0x1000_0000), 0x10_0000).unwrap();
    mb.add_node(pa(0x3000_0000), 0x10_0000, 1).unwrap();
    let before: Vec<_> = mb.memory().regions().to_vec();

    mb.add(pa(0x2000_0000), 0x4000).unwrap();
    assert_eq!(mb.memory().len(), 3);
    mb.remove(pa(0x2000_0000), 0x4000).unwrap();

    assert_eq!(mb.memory().regions(), before.as_slice());
}

#[test]
fn find_free_never_lands_in_the_reserved_band() {
    let mut mb = Memblock::new(&NO_RAM);
    mb.add(pa(0x2000_0000), 0x8000_0000).unwrap();
    mb.reserve(pa(0x2000_8000), 0x10_0000).unwrap();

    let found = mb
        .find_in_range(pa(0), pa(0x1_0000_0000), 0x1000, 0x1000)
        .unwrap();
    assert_eq!(found, pa(0x9fff_f000));
    assert!(!mb.is_region_reserved(found, 0x1000));

    // Forced below the band: the top of the free space underneath it wins.
    let found = mb
        .find_in_range(pa(0), pa(0x2010_0000), 0x1000, 0x1000)
        .unwrap();
    assert_eq!(found, pa(0x2000_7000));
    assert!(!mb.is_region_reserved(found, 0x1000));

    // Nothing of that size fits below the band.
    assert_eq!(
        mb.find_in_range(pa(0), pa(0x2010_0000), 0x9000, 0x1000),
        None
    );
}

#[test]
fn find_never_returns_page_zero() {
    let mut mb = Memblock::new(&NO_RAM);
    mb.add(pa(0), 0x2000).unwrap();

    assert_eq!(
        mb.find_in_range(pa(0), ALLOC_ANYWHERE, 0x1000, 0x1000),
        Some(pa(0x1000))
    );
    assert_eq!(
        mb.find_in_range(pa(0), ALLOC_ANYWHERE, 0x2000, 0x1000),
        None
    );
}

#[test]
fn find_honours_alignment_and_node() {
    let mut mb = Memblock::new(&NO_RAM);
    mb.add_node(pa(0x8000_0000), 0x40_0000, 0).unwrap();
    mb.add_node(pa(0x8040_0000), 0x40_0000, 1).unwrap();
    mb.reserve(pa(0x8070_0000), 0x10_0000).unwrap();

    let found = mb
        .find_in_range_node(pa(0), ALLOC_ANYWHERE, 0x1000, 0x20_0000, Some(1))
        .unwrap();
    assert_eq!(found, pa(0x8060_0000));

    let found = mb
        .find_in_range_node(pa(0), ALLOC_ANYWHERE, 0x1000, 0x1000, Some(0))
        .unwrap();
    assert_eq!(found, pa(0x803f_f000));
}

#[test]
fn free_ranges_in_both_directions_agree() {
    let mut mb = Memblock::new(&NO_RAM);
    mb.add(pa(0x1000), 0xf000).unwrap();
    mb.add(pa(0x2_0000), 0x1_0000).unwrap();
    mb.reserve(pa(0x0), 0x2000).unwrap();
    mb.reserve(pa(0x8000), 0x1000).unwrap();
    mb.reserve(pa(0x2_f000), 0x2000).unwrap();

    let forward: Vec<FreeRange> = mb.free_ranges(None).collect();
    let mut backward: Vec<FreeRange> = mb.free_ranges_rev(None).collect();
    backward.reverse();

    let spans: Vec<_> = forward
        .iter()
        .map(|r| (r.start.as_u64(), r.end.as_u64()))
        .collect();
    assert_eq!(
        spans,
        [(0x2000, 0x8000), (0x9000, 0x1_0000), (0x2_0000, 0x2_f000)]
    );
    assert_eq!(forward, backward);
}

#[test]
fn alloc_rounds_size_and_reserves() {
    let mut mb = Memblock::new(&NO_RAM);
    mb.add(pa(0x8000_0000), 0x10_0000).unwrap();

    let a = mb.alloc(0x10, 0x1000);
    assert_eq!(a, pa(0x800f_f000));
    assert_eq!(mb.reserved().total_size(), 0x1000);

    // zero alignment falls back to the default
    let b = mb.alloc(0x10, 0);
    assert!(b.is_aligned(8));
    assert!(b < a);
    assert_eq!(mb.reserved().len(), 1);
}

#[test]
fn alloc_of_an_unroundable_size_finds_nothing() {
    let mut mb = Memblock::new(&NO_RAM);
    mb.add(pa(0x8000_0000), 0x10_0000).unwrap();

    assert_eq!(
        mb.try_alloc_base(u64::MAX - 0x10, PAGE_SIZE, ALLOC_ANYWHERE),
        None
    );
    assert_eq!(mb.alloc_nid(u64::MAX, 0, 0), None);
    assert!(mb.reserved().is_empty());
    assert_eq!(mb.reserved().total_size(), 0);
}

#[test]
fn current_limit_caps_accessible_allocations() {
    let mut mb = Memblock::new(&NO_RAM);
    mb.add(pa(0x8000_0000), 0x1000_0000).unwrap();
    mb.set_current_limit(pa(0x8800_0000));

    assert_eq!(mb.alloc(0x1000, 0x1000), pa(0x87ff_f000));
    assert_eq!(
        mb.try_alloc_base(0x1000, 0x1000, ALLOC_ANYWHERE),
        Some(pa(0x8fff_f000))
    );
    assert_eq!(
        mb.try_alloc_base(0x1000, 0x1000, ALLOC_ACCESSIBLE),
        Some(pa(0x87ff_e000))
    );
}

#[test]
fn alloc_try_nid_falls_back_to_any_node() {
    let mut mb = Memblock::new(&NO_RAM);
    mb.add_node(pa(0x8000_0000), 0x2000, 0).unwrap();
    mb.add_node(pa(0x9000_0000), 0x10_0000, 1).unwrap();

    assert_eq!(mb.alloc_nid(0x1000, 0x1000, 0), Some(pa(0x8000_1000)));
    assert_eq!(mb.alloc_nid(0x2000, 0x1000, 0), None);
    assert_eq!(mb.alloc_try_nid(0x2000, 0x1000, 0), pa(0x900f_e000));
}

#[test]
#[should_panic(expected = "Failed to allocate 0x2000 bytes")]
fn alloc_base_panics_when_exhausted() {
    let mut mb = Memblock::new(&NO_RAM);
    mb.add(pa(0x8000_0000), 0x1000).unwrap();
    let _ = mb.alloc_base(0x2000, 0x1000, ALLOC_ANYWHERE);
}

#[test]
fn set_node_retags_and_merges() {
    let mut mb = Memblock::new(&NO_RAM);
    mb.add(pa(0x8000_0000), 0x40_0000).unwrap();
    mb.set_node(pa(0x8010_0000), 0x10_0000, 1).unwrap();

    let nodes: Vec<_> = mb.memory().iter().map(|r| r.node()).collect();
    assert_eq!(nodes, [None, Some(1), None]);

    mb.set_node(pa(0x8000_0000), 0x40_0000, 1).unwrap();
    assert_eq!(mb.memory().len(), 1);
    assert_eq!(mb.memory().regions()[0].node(), Some(1));

    let pfns: Vec<_> = mb.mem_pfn_ranges(Some(1)).collect();
    assert_eq!(pfns.len(), 1);
    assert_eq!(pfns[0].end - pfns[0].start, 0x400);
}
