//! Runs the early memory bring-up against simulated RAM and prints what each
//! boot allocator ends up with.

mod args;
mod logger;

use std::env;
use std::process::ExitCode;

use kernel_bootmem::PageSink;
use kernel_early_mm::{EarlyMemError, EarlyMemory};
use kernel_info::boot::BootMemoryInfo;
use kernel_info::memory::MAX_ORDER;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, Pfn};
use log::{LevelFilter, info};
use sim_ram::{SimRamError, SimulatedRam};

use crate::args::{ArgsError, Options, USAGE};
use crate::logger::StderrLogger;

#[derive(Debug, thiserror::Error)]
enum MemsimError {
    #[error(transparent)]
    Args(#[from] ArgsError),
    #[error("cannot set up simulated RAM: {0}")]
    Ram(#[from] SimRamError),
    #[error("boot failed: {0}")]
    Boot(#[from] EarlyMemError),
}

/// Stands in for the buddy allocator: counts blocks per order.
#[derive(Default)]
struct OrderHistogram {
    blocks: [u64; MAX_ORDER as usize],
}

impl PageSink for OrderHistogram {
    fn free_pages(&mut self, _first: Pfn, order: u32) {
        self.blocks[order as usize] += 1;
    }
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("memsim: {err}");
            if matches!(err, MemsimError::Args(_)) {
                eprintln!("{USAGE}");
            }
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<(), MemsimError> {
    let opts = Options::parse(env::args().skip(1))?;
    if opts.help {
        println!("{USAGE}");
        return Ok(());
    }

    let level = if opts.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    if let Err(err) = StderrLogger::new(level).init() {
        eprintln!("memsim: logging disabled: {err}");
    }

    let lo = opts.banks.iter().map(|b| b.start).min().unwrap_or_default();
    let hi = opts.banks.iter().map(|b| b.end()).max().unwrap_or_default();
    let ram = SimulatedRam::new(lo.as_u64(), hi - lo)?;

    let info = BootMemoryInfo {
        banks: &opts.banks,
        kernel: opts.kernel.unwrap_or_default(),
        dtb: opts.dtb,
        dtb_reserve_map: &[],
        initrd: opts.initrd,
        platform_reserved: &opts.reserved,
        cmdline: &opts.cmdline,
    };

    // SAFETY: the simulated window spans every bank.
    let mut mm = unsafe { EarlyMemory::new(&ram) };
    mm.memblock_init_with(&info, |mm| {
        if let Some(size) = opts.steal {
            mm.steal(size, PAGE_SIZE)?;
        }
        Ok(())
    })?;
    println!("{}", mm.memblock());
    print!("{}", mm.meminfo());

    mm.bootmem_init()?;
    let bm = mm.bootmem_mut();
    let small = bm.alloc(0x100, 8, PhysicalAddress::zero());
    let pages = bm.alloc_low(4 * PAGE_SIZE, PAGE_SIZE, PhysicalAddress::zero());
    info!("memsim: early allocations at {small:#x} and {pages:#x}");

    for node in mm.bootmem().nodes() {
        println!("{node}");
    }

    let mut histogram = OrderHistogram::default();
    let summary = mm.handoff(&mut histogram)?;
    println!("Memory: {summary}");
    for (order, &count) in histogram.blocks.iter().enumerate() {
        if count != 0 {
            println!(" order {order:2}: {count} blocks");
        }
    }
    Ok(())
}
