use kernel_early_mm::{EarlyMemError, EarlyMemory, Phase};
use kernel_info::boot::{BootMemoryInfo, PhysRange};
use kernel_info::memory::NR_BANKS;
use kernel_info::params::BootParamError;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, Pfn};
use sim_ram::SimulatedRam;

const RAM_BASE: u64 = 0x2000_0000;
const RAM_SIZE: u64 = 0x100_0000;
const RAM_PAGES: u64 = RAM_SIZE / PAGE_SIZE;

const KERNEL: PhysRange = PhysRange::new(0x2000_8000, 0x10_0000);
const DTB: PhysRange = PhysRange::new(0x20f0_0000, 0x4000);
const DTB_RESERVED: [PhysRange; 1] = [PhysRange::new(0x20f8_0000, 0x2000)];
const INITRD: PhysRange = PhysRange::new(0x2040_0000, 0x20_0000);
const CARVE_OUTS: [PhysRange; 1] = [PhysRange::new(0x2080_0000, 0x1_0000)];
const BANKS: [PhysRange; 1] = [PhysRange::new(RAM_BASE, RAM_SIZE)];

fn pa(v: u64) -> PhysicalAddress {
    PhysicalAddress::new(v)
}

fn pages(r: PhysRange) -> u64 {
    r.size / PAGE_SIZE
}

fn ram() -> SimulatedRam {
    SimulatedRam::new(RAM_BASE, RAM_SIZE).unwrap()
}

fn board(cmdline: &str) -> BootMemoryInfo<'_> {
    BootMemoryInfo {
        banks: &BANKS,
        kernel: KERNEL,
        dtb: Some(DTB),
        dtb_reserve_map: &DTB_RESERVED,
        initrd: Some(INITRD),
        platform_reserved: &CARVE_OUTS,
        cmdline,
    }
}

fn early(ram: &SimulatedRam) -> EarlyMemory<'_, SimulatedRam> {
    // SAFETY: every bank used below lies inside the simulated window.
    unsafe { EarlyMemory::new(ram) }
}

fn in_use() -> u64 {
    pages(KERNEL) + pages(DTB) + pages(DTB_RESERVED[0]) + pages(INITRD) + pages(CARVE_OUTS[0])
}

#[test]
fn full_boot_hands_over_every_free_page_once() {
    let ram = ram();
    let mut mm = early(&ram);
    mm.memblock_init(&board("console=ttyS0")).unwrap();

    assert_eq!(mm.phase(), Phase::Tracker);
    assert_eq!(mm.initrd(), Some(INITRD));
    assert!(mm.memblock().is_region_reserved(INITRD.start, INITRD.size));
    assert_eq!(mm.limits().lowmem_limit, pa(RAM_BASE + RAM_SIZE));
    assert_eq!(mm.limits().memblock_limit, pa(RAM_BASE + RAM_SIZE));

    mm.bootmem_init().unwrap();
    let pfns = mm.pfn_limits().unwrap();
    assert_eq!(pfns.min, Pfn::down(pa(RAM_BASE)));
    assert_eq!(pfns.max_low, Pfn::down(pa(RAM_BASE + RAM_SIZE)));
    assert_eq!(pfns.max_high, pfns.max_low);

    // one bitmap page at the top of low memory
    let node = mm.bootmem().node_info(0).unwrap();
    assert_eq!(node.map, pa(0x20ff_f000));
    assert!(mm.memblock().is_reserved(node.map));
    assert_eq!(node.free_pages, RAM_PAGES - in_use() - 1);

    let base = Pfn::down(pa(RAM_BASE));
    let mut handed = vec![0u32; RAM_PAGES as usize];
    let summary = mm
        .handoff(&mut |first: Pfn, order: u32| {
            for i in 0..1u64 << order {
                handed[(first - base + i) as usize] += 1;
            }
        })
        .unwrap();

    assert_eq!(summary.lowmem.pages, RAM_PAGES - in_use() - 1);
    assert_eq!(summary.lowmem.bitmap_pages, 1);
    assert_eq!(summary.highmem_pages, 0);
    assert_eq!(summary.ram_bytes, RAM_SIZE);
    assert_eq!(summary.total_pages(), RAM_PAGES - in_use());

    assert!(handed.iter().all(|&n| n <= 1));
    for r in [KERNEL, DTB, DTB_RESERVED[0], INITRD, CARVE_OUTS[0]] {
        let first = Pfn::down(r.start) - base;
        for p in first..first + pages(r) {
            assert_eq!(handed[p as usize], 0, "reserved page {p} was released");
        }
    }
    assert_eq!(handed[(Pfn::down(node.map) - base) as usize], 1);

    assert_eq!(mm.phase(), Phase::HandedOff);
    assert!(mm.memblock().is_frozen());
    assert!(mm.bootmem().is_released());
}

#[test]
fn bitmap_allocator_serves_requests_between_init_and_handoff() {
    let ram = ram();
    let mut mm = early(&ram);
    mm.memblock_init(&board("")).unwrap();
    mm.bootmem_init().unwrap();

    let free = mm.bootmem().free_pages(0);
    let block = mm
        .bootmem_mut()
        .alloc(3 * PAGE_SIZE, PAGE_SIZE, PhysicalAddress::zero());
    assert!(
        block >= pa(RAM_BASE) && block + 3 * PAGE_SIZE <= pa(RAM_BASE + RAM_SIZE)
    );
    assert!(!mm.memblock().is_region_reserved(block, 3 * PAGE_SIZE));
    assert_eq!(mm.bootmem().free_pages(0), free - 3);

    let summary = mm.handoff(&mut |_: Pfn, _: u32| {}).unwrap();
    assert_eq!(summary.lowmem.pages, free - 3);
}

#[test]
fn initrd_outside_memory_is_dropped() {
    let ram = ram();
    let mut mm = early(&ram);
    let mut info = board("");
    info.initrd = Some(PhysRange::new(0x3000_0000, 0x1000));

    mm.memblock_init(&info).unwrap();
    assert_eq!(mm.initrd(), None);
    assert!(!mm.memblock().is_reserved(pa(0x3000_0000)));
}

#[test]
fn initrd_overlapping_the_kernel_is_dropped() {
    let ram = ram();
    let mut mm = early(&ram);
    let mut info = board("");
    info.initrd = Some(PhysRange::new(0x2010_0000, 0x10_0000));

    mm.memblock_init(&info).unwrap();
    assert_eq!(mm.initrd(), None);
    assert!(!mm.memblock().is_reserved(pa(0x2010_8000)));
}

#[test]
fn command_line_initrd_wins() {
    let ram = ram();
    let mut mm = early(&ram);
    mm.memblock_init(&board("initrd=0x20c00000,1M")).unwrap();

    assert_eq!(mm.initrd(), Some(PhysRange::new(0x20c0_0000, 0x10_0000)));
    assert!(mm.memblock().is_region_reserved(pa(0x20c0_0000), 0x10_0000));
    assert!(!mm.memblock().is_region_reserved(INITRD.start, INITRD.size));
}

#[test]
fn platform_hook_may_steal_memory() {
    let ram = ram();
    let mut mm = early(&ram);

    let mut stolen = None;
    mm.memblock_init_with(&board(""), |mm| {
        stolen = Some(mm.steal(0x10_0000, 0x10_0000)?);
        Ok(())
    })
    .unwrap();

    let stolen = stolen.unwrap();
    assert_eq!(stolen, pa(0x20e0_0000));
    assert!(!mm.memblock().is_memory(stolen));
    assert!(!mm.memblock().is_reserved(stolen));
    assert_eq!(mm.memblock().phys_mem_size(), RAM_SIZE - 0x10_0000);

    assert_eq!(
        mm.steal(PAGE_SIZE, PAGE_SIZE),
        Err(EarlyMemError::StealNotPermitted)
    );

    mm.bootmem_init().unwrap();
    assert_eq!(mm.bootmem().free_pages(0), RAM_PAGES - in_use() - 1 - 256);
}

#[test]
fn steal_is_refused_before_init() {
    let ram = ram();
    let mut mm = early(&ram);
    assert_eq!(
        mm.steal(PAGE_SIZE, PAGE_SIZE),
        Err(EarlyMemError::StealNotPermitted)
    );
}

#[test]
fn steal_of_an_unroundable_size_fails_cleanly() {
    let ram = ram();
    let mut mm = early(&ram);

    mm.memblock_init_with(&board(""), |mm| {
        let reserved = mm.memblock().reserved().total_size();
        assert_eq!(
            mm.steal(u64::MAX - 0x10, PAGE_SIZE),
            Err(EarlyMemError::OutOfMemory {
                size: u64::MAX - 0x10
            })
        );
        assert_eq!(mm.memblock().reserved().total_size(), reserved);
        Ok(())
    })
    .unwrap();

    assert_eq!(mm.memblock().phys_mem_size(), RAM_SIZE);
}

#[test]
fn hook_errors_abort_init() {
    let ram = ram();
    let mut mm = early(&ram);
    let err = mm
        .memblock_init_with(&board(""), |_| Err(EarlyMemError::NoMemory))
        .unwrap_err();
    assert_eq!(err, EarlyMemError::NoMemory);
    assert_eq!(mm.phase(), Phase::Start);
}

/// 4 MiB straddling the 768 MiB low-memory ceiling.
const HIGH_BASE: u64 = 0x2fe0_0000;
const HIGH_BANKS: [PhysRange; 1] = [PhysRange::new(HIGH_BASE, 0x40_0000)];

fn highmem_board(cmdline: &str) -> BootMemoryInfo<'_> {
    BootMemoryInfo {
        banks: &HIGH_BANKS,
        kernel: PhysRange::new(0x2fe0_8000, 0x10_0000),
        cmdline,
        ..BootMemoryInfo::default()
    }
}

#[test]
fn high_memory_bypasses_the_bitmap() {
    let ram = SimulatedRam::new(HIGH_BASE, 0x40_0000).unwrap();
    let mut mm = early(&ram);
    mm.memblock_init(&highmem_board("")).unwrap();

    let banks = mm.meminfo().banks();
    assert_eq!(banks.len(), 2);
    assert!(!banks[0].highmem && banks[1].highmem);
    assert_eq!(banks[1].start(), pa(0x3000_0000));
    assert_eq!(mm.limits().lowmem_limit, pa(0x3000_0000));

    mm.bootmem_init().unwrap();
    let pfns = mm.pfn_limits().unwrap();
    assert_eq!(pfns.max_low, Pfn::down(pa(0x3000_0000)));
    assert_eq!(pfns.max_high, Pfn::down(pa(0x3020_0000)));
    assert_eq!(mm.bootmem().node_info(0).unwrap().map, pa(0x2fff_f000));

    let mut high = 0;
    let summary = mm
        .handoff(&mut |first: Pfn, order: u32| {
            if first >= pfns.max_low {
                high += 1u64 << order;
            }
        })
        .unwrap();

    assert_eq!(summary.lowmem.pages, 512 - 256 - 1);
    assert_eq!(summary.lowmem.bitmap_pages, 1);
    assert_eq!(summary.highmem_pages, 512);
    assert_eq!(high, 512);
    assert_eq!(summary.ram_bytes, 0x40_0000);
}

#[test]
fn nohighmem_truncates_at_the_ceiling() {
    let ram = SimulatedRam::new(HIGH_BASE, 0x40_0000).unwrap();
    let mut mm = early(&ram);
    mm.memblock_init(&highmem_board("nohighmem")).unwrap();

    assert_eq!(mm.meminfo().len(), 1);
    assert_eq!(mm.memblock().phys_mem_size(), 0x20_0000);
    assert!(!mm.memblock().is_memory(pa(0x3000_0000)));

    mm.bootmem_init().unwrap();
    let summary = mm.handoff(&mut |_: Pfn, _: u32| {}).unwrap();
    assert_eq!(summary.highmem_pages, 0);
    assert_eq!(summary.total_pages(), 512 - 256);
}

#[test]
fn mem_limit_drops_memory_and_reservations_above_it() {
    let ram = ram();
    let mut mm = early(&ram);
    let carve_outs = [PhysRange::new(0x20c0_0000, 0x1_0000)];
    let info = BootMemoryInfo {
        banks: &BANKS,
        kernel: KERNEL,
        platform_reserved: &carve_outs,
        cmdline: "mem=8M",
        ..BootMemoryInfo::default()
    };

    mm.memblock_init(&info).unwrap();
    assert_eq!(mm.params().mem_limit, Some(0x80_0000));
    assert_eq!(mm.memblock().phys_mem_size(), 0x80_0000);
    assert!(
        !mm.memblock().is_region_reserved(carve_outs[0].start, carve_outs[0].size)
    );

    mm.bootmem_init().unwrap();
    assert_eq!(mm.bootmem().node_info(0).unwrap().map, pa(0x207f_f000));
    assert_eq!(mm.bootmem().free_pages(0), 2048 - pages(KERNEL) - 1);
}

#[test]
fn steps_must_run_in_order() {
    let ram = ram();
    let mut mm = early(&ram);

    assert_eq!(
        mm.bootmem_init(),
        Err(EarlyMemError::WrongPhase {
            operation: "bootmem_init",
            phase: Phase::Start
        })
    );
    assert!(mm.handoff(&mut |_: Pfn, _: u32| {}).is_err());

    mm.memblock_init(&board("")).unwrap();
    assert_eq!(
        mm.memblock_init(&board("")),
        Err(EarlyMemError::WrongPhase {
            operation: "memblock_init",
            phase: Phase::Tracker
        })
    );

    mm.bootmem_init().unwrap();
    mm.handoff(&mut |_: Pfn, _: u32| {}).unwrap();
    assert_eq!(
        mm.bootmem_init(),
        Err(EarlyMemError::WrongPhase {
            operation: "bootmem_init",
            phase: Phase::HandedOff
        })
    );
}

#[test]
fn malformed_command_line_is_rejected() {
    let ram = ram();
    let mut mm = early(&ram);
    assert_eq!(
        mm.memblock_init(&board("mem=lots")),
        Err(EarlyMemError::Params(BootParamError::InvalidValue("mem")))
    );
    assert_eq!(mm.memblock().phys_mem_size(), 0);
}

#[test]
fn bad_bank_tables_are_rejected() {
    let ram = ram();

    let overlapping = [
        PhysRange::new(RAM_BASE, 0x80_0000),
        PhysRange::new(RAM_BASE + 0x40_0000, 0x80_0000),
    ];
    let info = BootMemoryInfo {
        banks: &overlapping,
        ..board("")
    };
    assert!(matches!(
        early(&ram).memblock_init(&info),
        Err(EarlyMemError::OverlappingBanks(..))
    ));

    let many: Vec<_> = (0..=NR_BANKS as u64)
        .map(|i| PhysRange::new(RAM_BASE + i * 0x10_0000, 0x8_0000))
        .collect();
    let info = BootMemoryInfo {
        banks: &many,
        ..board("")
    };
    assert_eq!(
        early(&ram).memblock_init(&info),
        Err(EarlyMemError::TooManyBanks { max: NR_BANKS })
    );

    let info = BootMemoryInfo {
        banks: &[],
        ..board("")
    };
    assert_eq!(
        early(&ram).memblock_init(&info),
        Err(EarlyMemError::NoMemory)
    );
}
