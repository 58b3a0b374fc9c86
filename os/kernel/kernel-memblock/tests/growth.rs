use kernel_memblock::{Memblock, MemblockError, Region, RegionKind, RegionSet};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, page_align};
use sim_ram::SimulatedRam;

const BASE: u64 = 0x4000_0000;

fn pa(v: u64) -> PhysicalAddress {
    PhysicalAddress::new(v)
}

/// Backing storage of a grown set.
fn array_of(set: &RegionSet<'_>) -> (PhysicalAddress, u64) {
    let phys = set.array_phys().unwrap();
    (phys, page_align((set.capacity() * size_of::<Region>()) as u64))
}

#[test]
fn growth_past_initial_capacity_preserves_regions() {
    let ram = SimulatedRam::new(BASE, 0x80_0000).unwrap();
    let mut mb = Memblock::new(&ram);
    mb.add(ram.base(), ram.len()).unwrap();
    mb.allow_resize();

    for i in 0..300 {
        mb.reserve(pa(BASE + i * 2 * PAGE_SIZE), PAGE_SIZE).unwrap();
    }

    assert_eq!(mb.reserved().capacity(), 512);

    let (array, size) = mb.reserved_array_info().unwrap();
    assert!(ram.contains(array, size));
    assert!(mb.is_region_reserved(array, size));

    // every page reservation plus the array itself, in order, nothing lost
    assert_eq!(mb.reserved().len(), 301);
    for (i, r) in mb.reserved().iter().take(300).enumerate() {
        assert_eq!(r.base(), pa(BASE + i as u64 * 2 * PAGE_SIZE));
        assert_eq!(r.size(), PAGE_SIZE);
    }
    assert_eq!(mb.reserved().regions()[300].base(), array);
    assert_eq!(mb.reserved().total_size(), 300 * PAGE_SIZE + size);
}

#[test]
fn grown_reserved_array_avoids_the_range_being_reserved() {
    let ram = SimulatedRam::new(BASE, 0x20_0000).unwrap();
    let mut mb = Memblock::new(&ram);
    mb.add(ram.base(), ram.len()).unwrap();
    mb.allow_resize();

    for i in 0..128 {
        mb.reserve(pa(BASE + i * 2 * PAGE_SIZE), PAGE_SIZE).unwrap();
    }
    assert_eq!(mb.reserved().len(), mb.reserved().capacity());

    // The topmost two pages are exactly where the grown array would
    // otherwise go.
    let top = ram.end().as_u64();
    let wanted = pa(top - 2 * PAGE_SIZE);
    mb.reserve(wanted, 2 * PAGE_SIZE).unwrap();

    let (array, size) = mb.reserved_array_info().unwrap();
    assert_eq!(size, 2 * PAGE_SIZE);
    assert_eq!(array, pa(top - 4 * PAGE_SIZE));
    assert!(array + size <= wanted);

    assert!(mb.is_region_reserved(wanted, 2 * PAGE_SIZE));
    assert!(mb.is_region_reserved(array, size));
    assert_eq!(mb.reserved().len(), 129);
}

#[test]
fn grown_memory_array_is_reserved() {
    let ram = SimulatedRam::new(BASE, 0x40_0000).unwrap();
    let mut mb = Memblock::new(&ram);
    mb.add(pa(BASE + 0x20_0000), 0x20_0000).unwrap();
    mb.allow_resize();

    for i in 0..150 {
        mb.add(pa(BASE + i * 2 * PAGE_SIZE), PAGE_SIZE).unwrap();
    }

    assert_eq!(mb.memory().len(), 151);
    assert_eq!(mb.memory().capacity(), 256);
    assert_eq!(mb.reserved().len(), 1);
    let array = mb.reserved().regions()[0];
    assert_eq!(array.end(), ram.end());
    assert!(mb.is_region_memory(array.base(), array.size()));
}

#[test]
fn memory_growth_that_also_grows_reserved_keeps_both_arrays_apart() {
    const HIGH: u64 = 0x8000_0000;

    let ram = SimulatedRam::new(BASE, 0x80_0000).unwrap();
    let mut mb = Memblock::new(&ram);
    mb.add(ram.base(), ram.len()).unwrap();
    mb.allow_resize();

    // Isolated pages outside the window: tracked only, never big enough
    // to hold an array.
    for i in 0..128 {
        mb.add(pa(HIGH + i * 2 * PAGE_SIZE), PAGE_SIZE).unwrap();
    }
    assert_eq!(mb.memory().capacity(), 256);
    assert_eq!(mb.reserved().len(), 1);

    for i in 0..126 {
        mb.reserve(pa(BASE + i * 2 * PAGE_SIZE), PAGE_SIZE).unwrap();
    }
    assert_eq!(mb.reserved().len(), 127);

    // The next memory growth leaves reserved with no room to release the
    // old memory array, so reserved grows in the middle of it.
    for i in 128..260 {
        mb.add(pa(HIGH + i * 2 * PAGE_SIZE), PAGE_SIZE).unwrap();
    }
    assert_eq!(mb.memory().capacity(), 512);
    assert_eq!(mb.reserved().capacity(), 256);

    let memory: Vec<_> = mb.memory().iter().map(|r| (r.base(), r.size())).collect();
    assert_eq!(memory.len(), 261);
    assert_eq!(memory[0], (ram.base(), ram.len()));
    for (i, &(base, size)) in memory[1..].iter().enumerate() {
        assert_eq!(
            (base, size),
            (pa(HIGH + i as u64 * 2 * PAGE_SIZE), PAGE_SIZE)
        );
    }

    for r in mb.reserved().iter() {
        assert!(ram.contains(r.base(), r.size()), "{r:?} outside the bank");
    }
    for pair in mb.reserved().regions().windows(2) {
        assert!(pair[0].end() < pair[1].base(), "{pair:?} not disjoint");
    }

    let (mem_array, mem_size) = array_of(mb.memory());
    let (rsv_array, rsv_size) = array_of(mb.reserved());
    assert!(
        mem_array + mem_size <= rsv_array || rsv_array + rsv_size <= mem_array
    );
    assert!(ram.contains(mem_array, mem_size));
    assert!(ram.contains(rsv_array, rsv_size));

    // Both arrays are reserved, the released old memory array is not.
    let arrays = mem_size + rsv_size;
    assert_eq!(mb.reserved().total_size(), 126 * PAGE_SIZE + arrays);
    assert!(mb.is_region_reserved(mem_array, mem_size));
    assert!(mb.is_region_reserved(rsv_array, rsv_size));
    assert!(!mb.is_region_reserved(ram.end() - 2 * PAGE_SIZE, 2 * PAGE_SIZE));
}

#[test]
fn growth_fails_without_contiguous_free_pages() {
    let ram = SimulatedRam::new(BASE, 0x10_0000).unwrap();
    let mut mb = Memblock::new(&ram);
    mb.add(ram.base(), ram.len()).unwrap();
    mb.allow_resize();

    // leave only isolated single pages free
    for i in 0..128 {
        mb.reserve(pa(BASE + i * 2 * PAGE_SIZE), PAGE_SIZE).unwrap();
    }

    let err = mb.reserve(pa(BASE + 0x1800), 0x100).unwrap_err();
    assert_eq!(
        err,
        MemblockError::ResizeFailed {
            kind: RegionKind::Reserved,
            from: 128,
            to: 256
        }
    );
    assert_eq!(mb.reserved().len(), 128);
    assert!(mb.reserved_array_info().is_none());
}

#[test]
fn frozen_tracker_does_not_grow() {
    let ram = SimulatedRam::new(BASE, 0x20_0000).unwrap();
    let mut mb = Memblock::new(&ram);
    mb.add(ram.base(), ram.len()).unwrap();
    mb.allow_resize();
    mb.freeze();
    mb.allow_resize();

    for i in 0..128 {
        mb.reserve(pa(BASE + i * 2 * PAGE_SIZE), PAGE_SIZE).unwrap();
    }

    assert!(matches!(
        mb.reserve(pa(BASE + 0x10_0000), PAGE_SIZE),
        Err(MemblockError::ResizeNotAllowed { capacity: 128, .. })
    ));
    assert!(mb.is_frozen());
}
