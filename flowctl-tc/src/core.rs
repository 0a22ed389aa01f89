//! Scheduler time base.
//!
//! The kernel's traffic control subsystem measures time in its own ticks. TBF expresses
//! its bucket size in ticks, so every rate change needs the tick rate of the running
//! kernel.

use std::io::{self, Read as _};
use std::sync::LazyLock;

/// Path to the kernel's packet scheduler timing information.
pub const PSCHED_PATH: &str = "/proc/net/psched";

/// Standard Ethernet MTU in bytes.
pub const MTU_ETHERNET: u32 = 1_500;

/// Ticks per microsecond on kernels with the default 64 ns scheduler clock. Used when
/// [`PSCHED_PATH`] cannot be read.
pub const DEFAULT_TICK_IN_USEC: f64 = 15.625;

/// Reads the number of scheduler ticks per microsecond from [`PSCHED_PATH`].
///
/// The file holds four hex words, `t2us us2t clock resolution`; the ratio of the first
/// two is the tick rate. Adapted from `iproute2/tc/tc_core.c`.
pub fn tc_core_init() -> io::Result<f64> {
    let mut file = std::fs::File::open(PSCHED_PATH)?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;

    parse_psched(&contents)
}

fn parse_psched(contents: &str) -> io::Result<f64> {
    let mut words = contents.split_whitespace().map(|word| {
        u32::from_str_radix(word, 16).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    });

    let mut next = |name: &str| {
        words.next().unwrap_or_else(|| {
            Err(io::Error::new(io::ErrorKind::UnexpectedEof, format!("missing {name}")))
        })
    };

    let t2us = next("t2us")?;
    let us2t = next("us2t")?;

    if us2t == 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "us2t is zero"));
    }

    let tick_in_usec = t2us as f64 / us2t as f64;
    tracing::debug!(t2us, us2t, tick_in_usec, "read {PSCHED_PATH}");

    Ok(tick_in_usec)
}

/// Cached value of ticks per microsecond, initialized lazily on first use.
pub static TICK_IN_USEC: LazyLock<f64> = LazyLock::new(|| {
    tc_core_init().unwrap_or_else(|e| {
        tracing::warn!(?e, "failed to read {PSCHED_PATH}, assuming {DEFAULT_TICK_IN_USEC} ticks/us");
        DEFAULT_TICK_IN_USEC
    })
});

/// Returns how many scheduler ticks it takes to send `bytes` at `rate_bytes_per_sec`.
pub fn transmit_ticks(bytes: u32, rate_bytes_per_sec: u64) -> u32 {
    if rate_bytes_per_sec == 0 {
        return u32::MAX;
    }

    let ticks = bytes as f64 * *TICK_IN_USEC * 1_000_000.0 / rate_bytes_per_sec as f64;
    ticks.min(u32::MAX as f64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_psched_ratio() {
        // 64 ns clock: 1000 / 64 ticks per microsecond.
        let tick = parse_psched("000003e8 00000040 000f4240 3b9aca00\n").unwrap();
        assert_eq!(tick, 15.625);
    }

    #[test]
    fn parse_psched_rejects_garbage() {
        assert!(parse_psched("").is_err());
        assert!(parse_psched("000003e8").is_err());
        assert!(parse_psched("zz 40").is_err());
        assert!(parse_psched("3e8 0").is_err());
    }

    #[test]
    fn transmit_ticks_saturates() {
        assert_eq!(transmit_ticks(1_500, 0), u32::MAX);
        assert!(transmit_ticks(1_500, 1) > transmit_ticks(1_500, 1_000_000));
    }
}
