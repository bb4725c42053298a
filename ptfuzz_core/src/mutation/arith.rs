//! Arithmetic increments and decrements of 8, 16 and 32-bit values.
use super::{could_be_bitflip, effective, read_le, write_le, DeterministicOpts};
use crate::method::MethodKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithWidth {
    W8,
    W16,
    W32,
}

pub const ARITH_WIDTHS: [ArithWidth; 3] = [ArithWidth::W8, ArithWidth::W16, ArithWidth::W32];

impl ArithWidth {
    #[inline]
    pub fn len(self) -> usize {
        match self {
            ArithWidth::W8 => 1,
            ArithWidth::W16 => 2,
            ArithWidth::W32 => 4,
        }
    }

    pub fn method(self) -> MethodKind {
        match self {
            ArithWidth::W8 => MethodKind::Arith8,
            ArithWidth::W16 => MethodKind::Arith16,
            ArithWidth::W32 => MethodKind::Arith32,
        }
    }
}

/// Visit every (offset, new little endian value) candidate.
fn walk(data: &[u8], eff: &[bool], opts: DeterministicOpts, width: ArithWidth, mut f: impl FnMut(usize, u32)) {
    let blen = width.len();
    if data.len() < blen {
        return;
    }
    for i in 0..=data.len() - blen {
        if !(i..i + blen).any(|j| effective(eff, j)) {
            continue;
        }
        let orig = read_le(data, i, blen);
        for j in 1..=opts.arith_max {
            match width {
                ArithWidth::W8 => {
                    let o = orig as u8;
                    let inc = o.wrapping_add(j as u8);
                    if !could_be_bitflip((o ^ inc) as u32) {
                        f(i, inc as u32);
                    }
                    let dec = o.wrapping_sub(j as u8);
                    if !could_be_bitflip((o ^ dec) as u32) {
                        f(i, dec as u32);
                    }
                }
                ArithWidth::W16 => {
                    let o = orig as u16;
                    let d = j as u16;
                    let le_inc = o.wrapping_add(d);
                    if (o & 0xff) + d > 0xff && !could_be_bitflip((o ^ le_inc) as u32) {
                        f(i, le_inc as u32);
                    }
                    let le_dec = o.wrapping_sub(d);
                    if (o & 0xff) < d && !could_be_bitflip((o ^ le_dec) as u32) {
                        f(i, le_dec as u32);
                    }
                    let be_inc = o.swap_bytes().wrapping_add(d).swap_bytes();
                    if (o >> 8) + d > 0xff && !could_be_bitflip((o ^ be_inc) as u32) {
                        f(i, be_inc as u32);
                    }
                    let be_dec = o.swap_bytes().wrapping_sub(d).swap_bytes();
                    if (o >> 8) < d && !could_be_bitflip((o ^ be_dec) as u32) {
                        f(i, be_dec as u32);
                    }
                }
                ArithWidth::W32 => {
                    let o = orig;
                    let le_inc = o.wrapping_add(j);
                    if (o & 0xffff) + j > 0xffff && !could_be_bitflip(o ^ le_inc) {
                        f(i, le_inc);
                    }
                    let le_dec = o.wrapping_sub(j);
                    if (o & 0xffff) < j && !could_be_bitflip(o ^ le_dec) {
                        f(i, le_dec);
                    }
                    let be_inc = o.swap_bytes().wrapping_add(j).swap_bytes();
                    if (o.swap_bytes() & 0xffff) + j > 0xffff && !could_be_bitflip(o ^ be_inc) {
                        f(i, be_inc);
                    }
                    let be_dec = o.swap_bytes().wrapping_sub(j).swap_bytes();
                    if (o.swap_bytes() & 0xffff) < j && !could_be_bitflip(o ^ be_dec) {
                        f(i, be_dec);
                    }
                }
            }
        }
    }
}

/// Number of candidates `mutate` would produce.
pub fn count(data: &[u8], eff: &[bool], opts: DeterministicOpts, width: ArithWidth) -> u64 {
    let mut n = 0;
    walk(data, eff, opts, width, |_, _| n += 1);
    n
}

/// Produce every arithmetic candidate of `width`, `data` is restored afterwards.
pub fn mutate(
    data: &mut [u8],
    eff: &[bool],
    opts: DeterministicOpts,
    width: ArithWidth,
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
        for _ in 0..8 {
            let len = rng.gen_range(0..4096);
            let mut data: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            let eff: Vec<bool> = if rng.gen() {
                Vec::new()
            } else {
                (0..len).map(|_| rng.gen_ratio(1, 3)).collect()
            };
            let opts = DeterministicOpts {
                arith_max: rng.gen_range(1..=35),
                ..Default::default()
            };
            for width in ARITH_WIDTHS.iter() {
                let expected = count(&data, &eff, opts, *width);
                let mut produced = 0;
                mutate(&mut data, &eff, opts, *width, |_| produced += 1);
                assert_eq!(expected, produced, "{:?}", width);
            }
        }
    }

    #[test]
    fn arith8_skips_bitflips() {
        let opts = DeterministicOpts {
            arith_max: 1,
            ..Default::default()
        };
        // 0 + 1 and 0 - 1 are both single flips of the zero byte
        assert_eq!(count(&[0], &[], opts, ArithWidth::W8), 0);
        let mut seen = Vec::new();
        let mut data = [0x10_u8];
        mutate(&mut data, &[], opts, ArithWidth::W8, |c| seen.push(c[0]));
        assert_eq!(seen, vec![0x0f]);
        assert_eq!(data, [0x10]);
    }

    #[test]
    fn arith16_needs_carry() {
        let opts = DeterministicOpts::default();
        // every kept candidate carries into or borrows from the other byte
        let data = [0x10, 0xf0];
        let mut out = Vec::new();
        let mut d = data;
        mutate(&mut d, &[], opts, ArithWidth::W16, |c| out.push(u16::from_le_bytes([c[0], c[1]])));
        assert!(!out.is_empty());
        for v in out {
            assert_ne!(v >> 8, 0xf0, "carry missing: {:#x}", v);
        }
    }

    #[test]
    fn short_input() {
        let opts = DeterministicOpts::default();
        assert_eq!(count(&[1, 2, 3], &[], opts, ArithWidth::W32), 0);
    }
}
