//! Effector maps mark the input bytes that influence the execution.
use std::ops::Range;

/// Granularity of derived effector maps.
pub const EFFECTOR_BLOCK: usize = 8;
/// Inputs shorter than this are not bisected.
pub const EFFECTOR_MIN_LEN: usize = 128;

/// Map of bytes deterministic stages may touch, bytes in `ignore` are excluded.
pub fn limiter_map(len: usize, ignore: &[Range<usize>]) -> Vec<bool> {
    let mut map = vec![true; len];
    for r in ignore {
        let end = r.end.min(len);
        if r.start < end {
            for b in &mut map[r.start..end] {
                *b = false;
            }
        }
    }
    map
}

/// Derive the effector map used by later stages from the walking byte results.
///
/// First and last byte are always kept, the map is widened to 8-byte aligned blocks
/// and then restricted by `limiter`.
pub fn derive(raw: &[bool], limiter: &[bool]) -> Vec<bool> {
    let len = raw.len();
    if len == 0 {
        return Vec::new();
    }
    let mut marked = raw.to_vec();
    marked[0] = true;
    marked[len - 1] = true;

    let mut derived = vec![false; len];
    for start in (0..len).step_by(EFFECTOR_BLOCK) {
        let end = (start + EFFECTOR_BLOCK).min(len);
        if marked[start..end].iter().any(|&b| b) {
            for b in &mut derived[start..end] {
                *b = true;
            }
        }
    }
    for (d, l) in derived.iter_mut().zip(limiter.iter()) {
        *d &= *l;
    }
    derived
}

/// Ratio of marked bytes, reported in stats.
pub fn density(map: &[bool]) -> f64 {
    if map.is_empty() {
        return 0.0;
    }
    map.iter().filter(|&&b| b).count() as f64 / map.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limiter() {
        let m = limiter_map(10, &[2..4, 8..20]);
        assert_eq!(
            m,
            vec![true, true, false, false, true, true, true, true, false, false]
        );
    }

    #[test]
    fn derive_blocks() {
        let mut raw = vec![false; 30];
        raw[13] = true;
        let limiter = limiter_map(30, &[14..15]);
        let d = derive(&raw, &limiter);
        assert!(d[0..8].iter().all(|&b| b));
        assert!(d[8..14].iter().all(|&b| b));
        assert!(!d[14]);
        assert!(d[15]);
        assert!(d[16..24].iter().all(|&b| !b));
        assert!(d[24..30].iter().all(|&b| b));
        assert!(density(&d) > 0.5);
    }
}
