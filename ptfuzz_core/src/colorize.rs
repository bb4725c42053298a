//! Colorization replaces input bytes with random ones as long as the execution path
//! stays the same, so bytes that are copied into comparisons become recognizable.
use crate::RngType;
use rand::Rng;
use std::{
    collections::BinaryHeap,
    ops::Range,
    time::{Duration, Instant},
};

/// Number of colored alternatives per input.
pub const COLORIZATION_COUNT: usize = 1;
/// Min number of colorization steps.
pub const COLORIZATION_STEPS: usize = 1500;
/// Colorization continues after the min steps until this timeout.
pub const COLORIZATION_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorInfo {
    Unknown,
    Colorable,
    Fixed,
}

/// Bisecting search for colorable ranges, the largest unknown range is tried first.
#[derive(Debug)]
pub struct Colorizer {
    color_info: Vec<ColorInfo>,
    // (len, start)
    unknown: BinaryHeap<(usize, usize)>,
}

impl Colorizer {
    pub fn new(size: usize) -> Self {
        let mut unknown = BinaryHeap::new();
        if size > 0 {
            unknown.push((size, 0));
        }
        Self {
            color_info: vec![ColorInfo::Unknown; size],
            unknown,
        }
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.unknown.is_empty()
    }

    pub fn color_info(&self) -> &[ColorInfo] {
        &self.color_info
    }

    /// Check the largest unknown range, split it in halves if it is not colorable.
    pub fn step(&mut self, mut check: impl FnMut(Range<usize>) -> bool) {
        let (len, start) = match self.unknown.pop() {
            Some(r) => r,
            None => return,
        };
        let r = start..start + len;
        if check(r.clone()) {
            for c in &mut self.color_info[r] {
                *c = ColorInfo::Colorable;
            }
            return;
        }
        if len == 1 {
            self.color_info[start] = ColorInfo::Fixed;
            return;
        }
        let center = start + len / 2;
        self.unknown.push((center - start, start));
        self.unknown.push((start + len - center, center));
    }
}

/// Colorize `data` in place, keeping every random range whose hash equals `orig_hash`.
pub fn colorize_payload(
    rng: &mut RngType,
    data: &mut [u8],
    orig_hash: u64,
    mut hash_of: impl FnMut(&[u8]) -> Option<u64>,
) -> Colorizer {
    let mut c = Colorizer::new(data.len());
    let start = Instant::now();
    let mut i = 0;
    while !c.is_done() {
        if i >= COLORIZATION_STEPS && start.elapsed() > COLORIZATION_TIMEOUT {
            break;
        }
        c.step(|r| {
            let backup = data[r.clone()].to_vec();
            rng.fill(&mut data[r.clone()]);
            if hash_of(data) == Some(orig_hash) {
                true
            } else {
                data[r].copy_from_slice(&backup);
                false
            }
        });
        i += 1;
    }
    c
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::hash;
    use rand::{prelude::SmallRng, SeedableRng};

    #[test]
    fn fixed_bytes_survive() {
        let mut rng = SmallRng::from_entropy();
        let mut data = b"MAGIC.............................".to_vec();
        let orig = data.clone();
        // path depends on the first five bytes only
        let path = |d: &[u8]| Some(hash(&d[..5]));
        let orig_hash = path(&data).unwrap();
        let c = colorize_payload(&mut rng, &mut data, orig_hash, path);
        assert!(c.is_done());
        assert_eq!(&data[..5], &orig[..5]);
        assert!(c.color_info()[5..].iter().all(|&i| i == ColorInfo::Colorable));
    }

    #[test]
    fn empty_payload() {
        let mut rng = SmallRng::from_entropy();
        let c = colorize_payload(&mut rng, &mut [], 0, |_| Some(0));
        assert!(c.is_done());
    }
}
