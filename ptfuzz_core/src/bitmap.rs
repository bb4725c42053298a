//! Edge coverage bitmaps.
//!
//! A trace bitmap produced by the target holds one saturating hit counter per edge,
//! `0xFF` marks an edge that was never hit. Canonical bitmaps kept by the scheduler
//! store the OR of all hit-count classes observed per edge, starting from `0xFF`.
use ahash::RandomState;
use std::hash::{BuildHasher, Hasher};

/// Virgin value of a bitmap byte.
pub const VIRGIN: u8 = 0xFF;
/// Default size of trace buffer.
pub const DEFAULT_BITMAP_SIZE: usize = 64 << 10;

// Fixed seeds, hashes must agree across workers and restarts.
const HASH_SEEDS: [u64; 4] = [
    0x243f_6a88_85a3_08d3,
    0x1319_8a2e_0370_7344,
    0xa409_3822_299f_31d0,
    0x082e_fa98_ec4e_6c89,
];

/// Map a hit counter to its class bit.
#[inline]
pub fn classify(count: u8) -> u8 {
    match count {
        0 | 1 => 0x01,
        2 => 0x02,
        3 => 0x04,
        4..=7 => 0x08,
        8..=15 => 0x10,
        16..=31 => 0x20,
        32..=0xFE => 0x40,
        VIRGIN => 0,
    }
}

/// Result of comparing a trace against a canonical bitmap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NewCoverage {
    /// Number of bytes that were virgin in canonical bitmap and hit by the trace.
    pub new_bytes: u32,
    /// Number of class bits the trace adds to canonical bitmap.
    pub new_bits: u32,
}

impl NewCoverage {
    #[inline]
    pub fn is_new(&self) -> bool {
        self.new_bits != 0
    }
}

/// Compute the new coverage of `trace` without touching `canonical`.
pub fn check_new(canonical: &[u8], trace: &[u8]) -> NewCoverage {
    let mut ret = NewCoverage::default();
    for (&c, &t) in canonical.iter().zip(trace.iter()) {
        if t == VIRGIN {
            continue;
        }
        let class = classify(t);
        if c == VIRGIN {
            ret.new_bytes += 1;
            ret.new_bits += class.count_ones();
        } else if c & class == 0 {
            ret.new_bits += class.count_ones();
        }
    }
    ret
}

/// Merge `trace` into `canonical`, returning the coverage that was new.
pub fn merge(canonical: &mut [u8], trace: &[u8]) -> NewCoverage {
    let mut ret = NewCoverage::default();
    for (c, &t) in canonical.iter_mut().zip(trace.iter()) {
        if t == VIRGIN {
            continue;
        }
        let class = classify(t);
        if *c == VIRGIN {
            ret.new_bytes += 1;
            ret.new_bits += class.count_ones();
            *c = class;
        } else if *c & class == 0 {
            ret.new_bits += class.count_ones();
            *c |= class;
        }
    }
    ret
}

/// A finding is unique if it hits some edge its category has never seen.
pub fn is_finding_unique(finding: &[u8], trace: &[u8]) -> bool {
    finding
        .iter()
        .zip(trace.iter())
        .any(|(&f, &t)| t != VIRGIN && f == VIRGIN)
}

/// Offsets of all hit edges.
pub fn hit_edges(trace: &[u8]) -> impl Iterator<Item = usize> + '_ {
    trace
        .iter()
        .enumerate()
        .filter(|(_, &b)| b != VIRGIN)
        .map(|(i, _)| i)
}

#[inline]
pub fn is_empty(trace: &[u8]) -> bool {
    trace.iter().all(|&b| b == VIRGIN)
}

/// Stable 64-bit hash of a bitmap or payload.
pub fn hash(data: &[u8]) -> u64 {
    let state = RandomState::with_seeds(HASH_SEEDS[0], HASH_SEEDS[1], HASH_SEEDS[2], HASH_SEEDS[3]);
    let mut hasher = state.build_hasher();
    hasher.write(data);
    hasher.finish()
}

/// Percentage of hit bytes and mean number of class bits per hit byte.
pub fn coverage_values(canonical: &[u8]) -> (f64, f64) {
    if canonical.is_empty() {
        return (0.0, 0.0);
    }
    let mut hit = 0_u64;
    let mut bits = 0_u64;
    for &c in canonical {
        if c != VIRGIN {
            hit += 1;
            bits += c.count_ones() as u64;
        }
    }
    let ratio_coverage = 100.0 * hit as f64 / canonical.len() as f64;
    let ratio_bits = if hit == 0 {
        0.0
    } else {
        bits as f64 / hit as f64
    };
    (ratio_coverage, ratio_bits)
}
