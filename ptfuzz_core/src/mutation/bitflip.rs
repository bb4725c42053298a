//! Walking bit and byte flips.
use super::{effective, DeterministicOpts};
use crate::method::MethodKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlipWidth {
    Bit1,
    Bit2,
    Bit4,
    Byte1,
    Byte2,
    Byte4,
}

pub const FLIP_WIDTHS: [FlipWidth; 6] = [
    FlipWidth::Bit1,
    FlipWidth::Bit2,
    FlipWidth::Bit4,
    FlipWidth::Byte1,
    FlipWidth::Byte2,
    FlipWidth::Byte4,
];

impl FlipWidth {
    pub fn method(self) -> MethodKind {
        match self {
            FlipWidth::Byte2 => MethodKind::Bitflip16,
            FlipWidth::Byte4 => MethodKind::Bitflip32,
            _ => MethodKind::Bitflip8,
        }
    }

    /// Xor the candidate at `pos` into `data`, applying it twice restores the input.
    fn flip(self, data: &mut [u8], pos: usize) {
        match self {
            FlipWidth::Bit1 => flip_bit(data, pos),
            FlipWidth::Bit2 => {
                flip_bit(data, pos);
                flip_bit(data, pos + 1);
            }
            FlipWidth::Bit4 => {
                for i in 0..4 {
                    flip_bit(data, pos + i);
                }
            }
            FlipWidth::Byte1 => data[pos] ^= 0xff,
            // byte flips are walked on their last byte.
            FlipWidth::Byte2 => {
                data[pos - 1] ^= 0xff;
                data[pos] ^= 0xff;
            }
            FlipWidth::Byte4 => {
                for b in &mut data[pos - 3..=pos] {
                    *b ^= 0xff;
                }
            }
        }
    }
}

#[inline]
fn flip_bit(data: &mut [u8], bit: usize) {
    data[bit / 8] ^= 0x80 >> (bit % 8);
}

/// Visit the position of every candidate of `width`.
fn walk(data: &[u8], eff: &[bool], opts: DeterministicOpts, width: FlipWidth, mut f: impl FnMut(usize)) {
    let len = data.len();
    match width {
        FlipWidth::Bit1 => {
            for i in 0..len * 8 {
                if !effective(eff, i / 8) || (opts.skip_zero && data[i / 8] == 0) {
                    continue;
                }
                f(i)
            }
        }
        FlipWidth::Bit2 => {
            for i in 0..(len * 8).saturating_sub(1) {
                let (a, b) = (i / 8, (i + 1) / 8);
                if !(effective(eff, a) || effective(eff, b))
                    || (opts.skip_zero && data[a] == 0 && data[b] == 0)
                {
                    continue;
                }
                f(i)
            }
        }
        FlipWidth::Bit4 => {
            for i in 0..(len * 8).saturating_sub(3) {
                let (a, b) = (i / 8, (i + 3) / 8);
                if !(effective(eff, a) || effective(eff, b))
                    || (opts.skip_zero && data[a] == 0 && data[b] == 0)
                {
                    continue;
                }
                f(i)
            }
        }
        FlipWidth::Byte1 => {
            for i in 0..len {
                if effective(eff, i) {
                    f(i)
                }
            }
        }
        FlipWidth::Byte2 => {
            for i in 1..len {
                if effective(eff, i) || effective(eff, i - 1) {
                    f(i)
                }
            }
        }
        FlipWidth::Byte4 => {
            for i in 3..len {
                if (i - 3..=i).any(|j| effective(eff, j)) {
                    f(i)
                }
            }
        }
    }
}

/// Number of candidates `mutate` would produce.
pub fn count(data: &[u8], eff: &[bool], opts: DeterministicOpts, width: FlipWidth) -> u64 {
    let mut n = 0;
    walk(data, eff, opts, width, |_| n += 1);
    n
}

/// Produce every flip candidate of `width`, `data` is restored afterwards.
pub fn mutate(
    data: &mut [u8],
    eff: &[bool],
    opts: DeterministicOpts,
    width: FlipWidth,
    mut emit: impl FnMut(&[u8]),
) {
    let snapshot = data.to_vec();
    walk(&snapshot, eff, opts, width, |pos| {
        width.flip(data, pos);
        emit(data);
        width.flip(data, pos);
    });
}

/// Walking byte flip used to find bytes that matter, `emit` receives the flipped offset.
pub fn mutate_walking_byte(data: &mut [u8], mut emit: impl FnMut(usize, &[u8])) {
    for i in 0..data.len() {
        data[i] ^= 0xff;
        emit(i, data);
        data[i] ^= 0xff;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{prelude::SmallRng, Rng, SeedableRng};

    #[test]
    fn lockstep() {
        let mut rng = SmallRng::from_entropy();
        for _ in 0..8 {
            let len = rng.gen_range(0..4096);
            let mut data: Vec<u8> = (0..len).map(|_| if rng.gen_ratio(1, 4) { 0 } else { rng.gen() }).collect();
            let eff: Vec<bool> = if rng.gen() {
                Vec::new()
            } else {
                (0..len).map(|_| rng.gen_ratio(1, 3)).collect()
            };
            let opts = DeterministicOpts {
                skip_zero: rng.gen(),
                ..Default::default()
            };
            for width in FLIP_WIDTHS.iter() {
                let expected = count(&data, &eff, opts, *width);
                let mut produced = 0;
                mutate(&mut data, &eff, opts, *width, |_| produced += 1);
                assert_eq!(expected, produced, "{:?}", width);
            }
        }
    }

    #[test]
    fn restores_input() {
        let mut rng = SmallRng::from_entropy();
        let mut data: Vec<u8> = (0..64).map(|_| rng.gen()).collect();
        let orig = data.clone();
        for width in FLIP_WIDTHS.iter() {
            mutate(&mut data, &[], DeterministicOpts::default(), *width, |c| {
                assert_ne!(c, &orig[..]);
            });
            assert_eq!(data, orig);
        }
    }

    #[test]
    fn small_inputs() {
        let opts = DeterministicOpts::default();
        assert_eq!(count(&[], &[], opts, FlipWidth::Bit1), 0);
        assert_eq!(count(&[1], &[], opts, FlipWidth::Bit1), 8);
        assert_eq!(count(&[1], &[], opts, FlipWidth::Bit2), 7);
        assert_eq!(count(&[1], &[], opts, FlipWidth::Bit4), 5);
        assert_eq!(count(&[1, 2, 3], &[], opts, FlipWidth::Byte4), 0);
        assert_eq!(count(&[1, 2, 3, 4], &[], opts, FlipWidth::Byte4), 1);
    }

    #[test]
    fn effector_limits_flips() {
        let opts = DeterministicOpts::default();
        let eff = [false, true, false, false];
        assert_eq!(count(&[1, 1, 1, 1], &eff, opts, FlipWidth::Bit1), 8);
        assert_eq!(count(&[1, 1, 1, 1], &eff, opts, FlipWidth::Byte1), 1);
        assert_eq!(count(&[1, 1, 1, 1], &eff, opts, FlipWidth::Byte2), 2);
    }
}
