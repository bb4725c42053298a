//! Substitution of interesting values.
use super::{
    could_be_arith, could_be_bitflip, could_be_interest, effective, read_le, write_le,
    DeterministicOpts, INTERESTING_16, INTERESTING_32, INTERESTING_8,
};
use crate::method::MethodKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterestWidth {
    W8,
    W16,
    W32,
}

pub const INTEREST_WIDTHS: [InterestWidth; 3] =
    [InterestWidth::W8, InterestWidth::W16, InterestWidth::W32];

impl InterestWidth {
    #[inline]
    pub fn len(self) -> usize {
        match self {
            InterestWidth::W8 => 1,
            InterestWidth::W16 => 2,
            InterestWidth::W32 => 4,
        }
    }

    pub fn method(self) -> MethodKind {
        match self {
            InterestWidth::W8 => MethodKind::Interesting8,
            InterestWidth::W16 => MethodKind::Interesting16,
            InterestWidth::W32 => MethodKind::Interesting32,
        }
    }
}

fn walk(data: &[u8], eff: &[bool], opts: DeterministicOpts, width: InterestWidth, mut f: impl FnMut(usize, u32)) {
    let blen = width.len();
    if data.len() < blen {
        return;
    }
    let arith_max = opts.arith_max;
    for i in 0..=data.len() - blen {
        if !(i..i + blen).any(|j| effective(eff, j)) {
            continue;
        }
        let orig = read_le(data, i, blen);
        match width {
            InterestWidth::W8 => {
                for v in INTERESTING_8.iter() {
                    let v = *v as u8 as u32;
                    if could_be_bitflip(orig ^ v) || could_be_arith(orig, v, 1, arith_max) {
                        continue;
                    }
                    f(i, v);
                }
            }
            InterestWidth::W16 => {
                for v in INTERESTING_16.iter() {
                    let le = *v as u16;
                    let be = le.swap_bytes();
                    let (le, be) = (le as u32, be as u32);
                    if !could_be_bitflip(orig ^ le)
                        && !could_be_arith(orig, le, 2, arith_max)
                        && !could_be_interest(orig, le, 2, false)
                    {
                        f(i, le);
                    }
                    if le != be
                        && !could_be_bitflip(orig ^ be)
                        && !could_be_arith(orig, be, 2, arith_max)
                        && !could_be_interest(orig, be, 2, true)
                    {
                        f(i, be);
                    }
                }
            }
            InterestWidth::W32 => {
                for v in INTERESTING_32.iter() {
                    let le = *v as u32;
                    let be = le.swap_bytes();
                    if !could_be_bitflip(orig ^ le)
                        && !could_be_arith(orig, le, 4, arith_max)
                        && !could_be_interest(orig, le, 4, false)
                    {
                        f(i, le);
                    }
                    if le != be
                        && !could_be_bitflip(orig ^ be)
                        && !could_be_arith(orig, be, 4, arith_max)
                        && !could_be_interest(orig, be, 4, true)
                    {
                        f(i, be);
                    }
                }
            }
        }
    }
}

/// Number of candidates `mutate` would produce.
pub fn count(data: &[u8], eff: &[bool], opts: DeterministicOpts, width: InterestWidth) -> u64 {
    let mut n = 0;
    walk(data, eff, opts, width, |_, _| n += 1);
    n
}

/// Produce every interesting value candidate of `width`, `data` is restored afterwards.
pub fn mutate(
    data: &mut [u8],
    eff: &[bool],
    opts: DeterministicOpts,
    width: InterestWidth,
    mut emit: impl FnMut(&[u8]),
) {
    let blen = width.len();
    let snapshot = data.to_vec();
    walk(&snapshot, eff, opts, width, |pos, val| {
        write_le(data, pos, blen, val);
        emit(data);
        data[pos..pos + blen].copy_from_slice(&snapshot[pos..pos + blen]);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{prelude::SmallRng, Rng, SeedableRng};

    #[test]
    fn lockstep() {
        let mut rng = SmallRng::from_entropy();
        for _ in 0..6 {
            let len = rng.gen_range(0..4096);
            let mut data: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            let eff: Vec<bool> = if rng.gen() {
                Vec::new()
            } else {
                (0..len).map(|_| rng.gen_ratio(1, 3)).collect()
            };
            let opts = DeterministicOpts::default();
            for width in INTEREST_WIDTHS.iter() {
                let expected = count(&data, &eff, opts, *width);
                let mut produced = 0;
                mutate(&mut data, &eff, opts, *width, |_| produced += 1);
                assert_eq!(expected, produced, "{:?}", width);
            }
        }
    }

    #[test]
    fn no_identity_candidates() {
        let mut rng = SmallRng::from_entropy();
        let mut data: Vec<u8> = (0..32).map(|_| rng.gen()).collect();
        let orig = data.clone();
        for width in INTEREST_WIDTHS.iter() {
            mutate(&mut data, &[], DeterministicOpts::default(), *width, |c| {
                assert_ne!(c, &orig[..])
            });
        }
        assert_eq!(data, orig);
    }

    #[test]
    fn interest8_values() {
        let mut out = Vec::new();
        let mut data = [0x55_u8];
        mutate(&mut data, &[], DeterministicOpts::default(), InterestWidth::W8, |c| out.push(c[0]));
        // 0x55 +/- 35 covers 0x32..=0x78 so 64 and 100 are skipped
        assert!(!out.contains(&64) && !out.contains(&100));
        assert!(out.contains(&0x80));
        assert!(out.contains(&0));
    }
}
