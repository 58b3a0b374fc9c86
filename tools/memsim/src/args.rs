use kernel_info::boot::PhysRange;
use kernel_info::params::memparse;

#[derive(Debug, thiserror::Error)]
pub enum ArgsError {
    #[error("`{0}` expects a value")]
    MissingValue(&'static str),
    #[error("`{flag}`: cannot parse `{value}` as <start>,<size>")]
    BadRange { flag: &'static str, value: String },
    #[error("`{flag}`: cannot parse `{value}` as a size")]
    BadSize { flag: &'static str, value: String },
}

pub const USAGE: &str = "\
usage: memsim [options] [kernel command line...]

  --bank <start>,<size>     RAM bank (repeatable)
  --kernel <start>,<size>   kernel image
  --dtb <start>,<size>      device tree blob
  --initrd <start>,<size>   initial ramdisk from the boot loader
  --reserve <start>,<size>  platform carve-out (repeatable)
  --steal <size>            take memory out of the map during setup
  -v, --verbose             debug logging

Sizes take K/M/G suffixes and 0x prefixes.";

/// A simulated board. Without any `--bank`, 64 MiB at `0x2000_0000`.
#[derive(Debug, Default)]
pub struct Options {
    pub banks: Vec<PhysRange>,
    pub kernel: Option<PhysRange>,
    pub dtb: Option<PhysRange>,
    pub initrd: Option<PhysRange>,
    pub reserved: Vec<PhysRange>,
    pub steal: Option<u64>,
    pub verbose: bool,
    pub help: bool,
    pub cmdline: String,
}

impl Options {
    pub fn parse(args: impl IntoIterator<Item = String>) -> Result<Self, ArgsError> {
        let mut opts = Self::default();
        let mut words = Vec::new();
        let mut args = args.into_iter();

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--bank" => opts.banks.push(range("--bank", args.next())?),
                "--kernel" => opts.kernel = Some(range("--kernel", args.next())?),
                "--dtb" => opts.dtb = Some(range("--dtb", args.next())?),
                "--initrd" => opts.initrd = Some(range("--initrd", args.next())?),
                "--reserve" => opts.reserved.push(range("--reserve", args.next())?),
                "--steal" => opts.steal = Some(size("--steal", args.next())?),
                "-v" | "--verbose" => opts.verbose = true,
                "-h" | "--help" => opts.help = true,
                _ => words.push(arg),
            }
        }

        if opts.banks.is_empty() {
            opts.banks.push(PhysRange::new(0x2000_0000, 0x400_0000));
            opts.kernel.get_or_insert(PhysRange::new(0x2000_8000, 0x80_0000));
            opts.dtb.get_or_insert(PhysRange::new(0x23f0_0000, 0x4000));
        }
        opts.cmdline = words.join(" ");
        Ok(opts)
    }
}

fn size(flag: &'static str, value: Option<String>) -> Result<u64, ArgsError> {
    let value = value.ok_or(ArgsError::MissingValue(flag))?;
    memparse(&value).ok_or(ArgsError::BadSize { flag, value })
}

fn range(flag: &'static str, value: Option<String>) -> Result<PhysRange, ArgsError> {
    let value = value.ok_or(ArgsError::MissingValue(flag))?;
    let parsed = value
        .split_once(',')
        .and_then(|(start, size)| Some(PhysRange::new(memparse(start)?, memparse(size)?)));
    parsed.ok_or(ArgsError::BadRange { flag, value })
}
