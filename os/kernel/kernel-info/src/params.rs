//! # Early Boot Parameters
//!
//! Only the handful of options that influence early memory setup are
//! recognized here; everything else on the command line is skipped.
//!
//! | Parameter | Effect |
//! |-----------|--------|
//! | `mem=<size>` | Use at most `<size>` bytes of RAM. |
//! | `initrd=<start>,<size>` | Override the initial ramdisk location. |
//! | `memblock=debug` | Trace every region tracker mutation. |
//! | `bootmem_debug` | Trace every boot bitmap operation. |
//! | `nohighmem` | Discard memory above the low-memory ceiling. |
//!
//! Sizes accept the usual `K`, `M`, `G`, `T` suffixes and `0x` prefixes:
//!
//! ```rust
//! # use kernel_info::params::{BootParams, memparse};
//! assert_eq!(memparse("512M"), Some(512 << 20));
//! let p = BootParams::parse("console=ttyS0 mem=1G memblock=debug").unwrap();
//! assert_eq!(p.mem_limit, Some(1 << 30));
//! assert!(p.memblock_debug);
//! ```

use crate::boot::PhysRange;

#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum BootParamError {
    #[error("missing value for `{0}=`")]
    MissingValue(&'static str),
    #[error("malformed value for `{0}=`")]
    InvalidValue(&'static str),
}

/// Memory related boot parameters.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct BootParams {
    pub mem_limit: Option<u64>,
    pub initrd: Option<PhysRange>,
    pub memblock_debug: bool,
    pub bootmem_debug: bool,
    pub no_highmem: bool,
}

impl BootParams {
    /// Parse a whitespace separated kernel command line.
    ///
    /// # Errors
    /// Returns [`BootParamError`] if a recognized parameter has a missing or
    /// malformed value. Unknown parameters are ignored.
    pub fn parse(cmdline: &str) -> Result<Self, BootParamError> {
        let mut params = Self::default();

        for token in cmdline.split_ascii_whitespace() {
            let (key, value) = match token.split_once('=') {
                Some((k, v)) => (k, Some(v)),
                None => (token, None),
            };

            match key {
                "mem" => {
                    let value = value.ok_or(BootParamError::MissingValue("mem"))?;
                    let limit = memparse(value).ok_or(BootParamError::InvalidValue("mem"))?;
                    params.mem_limit = Some(limit);
                }
                "initrd" => {
                    let value = value.ok_or(BootParamError::MissingValue("initrd"))?;
                    params.initrd = Some(parse_initrd(value)?);
                }
                "memblock" => {
                    if value == Some("debug") {
                        params.memblock_debug = true;
                    }
                }
                "bootmem_debug" => params.bootmem_debug = true,
                "nohighmem" => params.no_highmem = true,
                _ => {}
            }
        }

        Ok(params)
    }
}

fn parse_initrd(value: &str) -> Result<PhysRange, BootParamError> {
    let (start, size) = value
        .split_once(',')
        .ok_or(BootParamError::InvalidValue("initrd"))?;
    let start = memparse(start).ok_or(BootParamError::InvalidValue("initrd"))?;
    let size = memparse(size).ok_or(BootParamError::InvalidValue("initrd"))?;
    Ok(PhysRange::new(start, size))
}

/// Parse a size with an optional binary suffix.
///
/// Returns `None` on empty input, garbage, or overflow.
#[must_use]
pub fn memparse(s: &str) -> Option<u64> {
    let (digits, shift) = match s.as_bytes().last()? {
        b'k' | b'K' => (&s[..s.len() - 1], 10),
        b'm' | b'M' => (&s[..s.len() - 1], 20),
        b'g' | b'G' => (&s[..s.len() - 1], 30),
        b't' | b'T' => (&s[..s.len() - 1], 40),
        _ => (s, 0),
    };

    let value = if let Some(hex) = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        u64::from_str_radix(hex, 16).ok()?
    } else {
        digits.parse::<u64>().ok()?
    };

    value.checked_mul(1u64 << shift)
}
