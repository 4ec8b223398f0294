use tracing::debug;

use crate::error::Result;
use crate::pool::{Interval, ResourcePool};

/// Memory above this boundary is validated by looking for a CIS signature;
/// memory below it gets the destructive read/write probe.
pub const PROBE_BOUNDARY: u64 = 0x10_0000;

/// Probe granule for low memory (64 KB-aligned chunks).
pub const PROBE_CHUNK: u64 = 0x1_0000;

/// Raw access used by the memory probe.
///
/// On the hardware this targets, "is this address range real" cannot be
/// answered from any table; the only way to know is to write to it and see
/// whether the bytes stick (and do not also appear somewhere else in the
/// range, which would mean the decode lines alias).
pub trait MemoryProbe {
    fn read(&mut self, addr: u32) -> u8;
    fn write(&mut self, addr: u32, value: u8);

    /// Whether a plausible CIS signature is visible when a card window is
    /// mapped at `base`. Used for high memory where destructive writes would
    /// land on the card itself.
    fn looks_like_cis(&mut self, base: u32) -> bool;
}

/// Destructive two-point check on `[base, base+len)`.
///
/// Writes complementary patterns at the bottom of the chunk and near the top,
/// then verifies both read back intact in two passes. Floating-bus ranges fail
/// the read-back; aliased ranges fail because the second write lands on top of
/// the first.
fn check_writable(probe: &mut dyn MemoryProbe, base: u32, len: u32) -> bool {
    if len < 0x200 {
        return false;
    }
    let lo = base;
    let hi = base + len - 0x100;
    for pass in [(0x55u8, 0xaau8), (0xaau8, 0x55u8)] {
        probe.write(lo, pass.0);
        probe.write(hi, pass.1);
        if probe.read(lo) != pass.0 || probe.read(hi) != pass.1 {
            return false;
        }
    }
    true
}

/// Narrows a freshly seeded memory pool to ranges that respond like real
/// memory.
///
/// High ranges (at or above [`PROBE_BOUNDARY`]) are tested first since they
/// are the closest to guaranteed usable, then the low megabyte is walked in
/// 64 KB-aligned chunks. Every failing chunk is permanently subtracted from
/// the pool for the life of the process.
pub fn probe_memory(pool: &mut ResourcePool, probe: &mut dyn MemoryProbe) -> Result<()> {
    let snapshot: Vec<Interval> = pool.free_intervals().to_vec();

    for iv in snapshot.iter().filter(|iv| iv.start >= PROBE_BOUNDARY) {
        if !probe.looks_like_cis(iv.start as u32) {
            debug!(base = iv.start, "memory probe: no CIS signature, dropping range");
            pool.remove_range(iv.start as u32, iv.len() as u32)?;
        }
    }

    for iv in snapshot.iter().filter(|iv| iv.start < PROBE_BOUNDARY) {
        let first_chunk = iv.start / PROBE_CHUNK;
        let last_chunk = (iv.end.min(PROBE_BOUNDARY) + PROBE_CHUNK - 1) / PROBE_CHUNK;
        for chunk in first_chunk..last_chunk {
            let start = (chunk * PROBE_CHUNK).max(iv.start);
            let end = ((chunk + 1) * PROBE_CHUNK).min(iv.end);
            if start >= end {
                continue;
            }
            if !check_writable(probe, start as u32, (end - start) as u32) {
                debug!(base = start, "memory probe: chunk failed write test, dropping");
                pool.remove_range(start as u32, (end - start) as u32)?;
            }
        }
    }

    Ok(())
}

/// Re-checks one previously seeded free span, e.g. after a resume or a dock
/// change. High spans re-check the CIS signature, low spans re-run the
/// destructive write test. A failing span is subtracted from the pool;
/// returns whether the span still responds.
pub fn validate_region(
    pool: &mut ResourcePool,
    probe: &mut dyn MemoryProbe,
    base: u32,
    len: u32,
) -> Result<bool> {
    let good = if base as u64 >= PROBE_BOUNDARY {
        probe.looks_like_cis(base)
    } else {
        check_writable(probe, base, len)
    };
    if !good {
        debug!(base, len, "region re-validation failed, dropping range");
        pool.remove_range(base, len)?;
    }
    Ok(good)
}
