//! Payload mutation.
//!
//! Deterministic stages (`bitflip`, `arith`, `interesting`) are written as walkers that
//! visit every candidate once. The `count_*` and `mutate_*` functions of a stage are both
//! driven by the same walker, so progress accounting never drifts from generation.
pub mod arith;
pub mod bitflip;
pub mod dict;
pub mod effector;
pub mod havoc;
pub mod interesting;
pub mod splice;

/// Default max delta of arithmetic mutation.
pub const ARITH_MAX: u32 = 35;

pub const INTERESTING_8: [i8; 9] = [-128, -1, 0, 1, 16, 32, 64, 100, 127];

pub const INTERESTING_16: [i16; 19] = [
    -128, -1, 0, 1, 16, 32, 64, 100, 127, // 8-bit
    -32768, -129, 128, 255, 256, 512, 1000, 1024, 4096, 32767,
];

pub const INTERESTING_32: [i32; 27] = [
    -128,
    -1,
    0,
    1,
    16,
    32,
    64,
    100,
    127,
    -32768,
    -129,
    128,
    255,
    256,
    512,
    1000,
    1024,
    4096,
    32767,
    -2147483648,
    -100663046,
    -32769,
    32768,
    65535,
    65536,
    100663045,
    2147483647,
];

/// Options shared by deterministic stages.
#[derive(Debug, Clone, Copy)]
pub struct DeterministicOpts {
    /// Skip bit flips on bytes that are zero.
    pub skip_zero: bool,
    /// Max delta of arithmetic mutation.
    pub arith_max: u32,
}

impl Default for DeterministicOpts {
    fn default() -> Self {
        Self {
            skip_zero: false,
            arith_max: ARITH_MAX,
        }
    }
}

/// Whether byte `i` is marked by the effector map, an empty map marks every byte.
#[inline]
pub fn effective(eff: &[bool], i: usize) -> bool {
    eff.is_empty() || eff.get(i).copied().unwrap_or(false)
}

/// Whether `xor_val` can be the result of one of the walking bit flips.
pub fn could_be_bitflip(mut xor_val: u32) -> bool {
    if xor_val == 0 {
        return true;
    }
    let mut sh = 0;
    while xor_val & 1 == 0 {
        sh += 1;
        xor_val >>= 1;
    }
    // 1-, 2- and 4-bit patterns are OK anywhere.
    if xor_val == 1 || xor_val == 3 || xor_val == 15 {
        return true;
    }
    // byte patterns only at byte boundaries.
    if sh & 7 != 0 {
        return false;
    }
    xor_val == 0xff || xor_val == 0xffff || xor_val == 0xffff_ffff
}

/// Whether `new_val` can be reached from `old_val` by the arithmetic stages.
pub fn could_be_arith(old_val: u32, new_val: u32, blen: usize, arith_max: u32) -> bool {
    if old_val == new_val {
        return true;
    }

    let mut diffs = 0;
    let (mut ov, mut nv) = (0_u32, 0_u32);
    for i in 0..blen {
        let a = (old_val >> (8 * i)) as u8;
        let b = (new_val >> (8 * i)) as u8;
        if a != b {
            diffs += 1;
            ov = a as u32;
            nv = b as u32;
        }
    }
    if diffs == 1
        && ((ov as u8).wrapping_sub(nv as u8) as u32 <= arith_max
            || (nv as u8).wrapping_sub(ov as u8) as u32 <= arith_max)
    {
        return true;
    }
    if blen == 1 {
        return false;
    }

    diffs = 0;
    for i in 0..blen / 2 {
        let a = (old_val >> (16 * i)) as u16;
        let b = (new_val >> (16 * i)) as u16;
        if a != b {
            diffs += 1;
            ov = a as u32;
            nv = b as u32;
        }
    }
    if diffs == 1 {
        let (o, n) = (ov as u16, nv as u16);
        if o.wrapping_sub(n) as u32 <= arith_max || n.wrapping_sub(o) as u32 <= arith_max {
            return true;
        }
        let (o, n) = (o.swap_bytes(), n.swap_bytes());
        if o.wrapping_sub(n) as u32 <= arith_max || n.wrapping_sub(o) as u32 <= arith_max {
            return true;
        }
    }

    if blen == 4 {
        if old_val.wrapping_sub(new_val) <= arith_max || new_val.wrapping_sub(old_val) <= arith_max {
            return true;
        }
        let (o, n) = (old_val.swap_bytes(), new_val.swap_bytes());
        if o.wrapping_sub(n) <= arith_max || n.wrapping_sub(o) <= arith_max {
            return true;
        }
    }
    false
}

/// Whether `new_val` can be reached from `old_val` by an earlier interesting value stage.
pub fn could_be_interest(old_val: u32, new_val: u32, blen: usize, check_le: bool) -> bool {
    if old_val == new_val {
        return true;
    }

    for i in 0..blen {
        for v in INTERESTING_8.iter() {
            let tval = (old_val & !(0xff_u32 << (i * 8))) | ((*v as u8 as u32) << (i * 8));
            if new_val == tval {
                return true;
            }
        }
    }

    if blen == 2 && !check_le {
        return false;
    }

    for i in 0..blen - 1 {
        for v in INTERESTING_16.iter() {
            let v = *v as u16;
            let tval = (old_val & !(0xffff_u32 << (i * 8))) | ((v as u32) << (i * 8));
            if new_val == tval {
                return true;
            }
            if blen > 2 {
                let tval = (old_val & !(0xffff_u32 << (i * 8))) | ((v.swap_bytes() as u32) << (i * 8));
                if new_val == tval {
                    return true;
                }
            }
        }
    }

    if blen == 4 && check_le {
        return INTERESTING_32.iter().any(|v| new_val == *v as u32);
    }
    false
}

/// Read `blen` bytes at `pos` as a little endian value.
#[inline]
fn read_le(data: &[u8], pos: usize, blen: usize) -> u32 {
    let mut v = 0_u32;
    for i in 0..blen {
        v |= (data[pos + i] as u32) << (8 * i);
    }
    v
}

/// Write the low `blen` bytes of `val` at `pos` in little endian order.
#[inline]
fn write_le(data: &mut [u8], pos: usize, blen: usize, val: u32) {
    for i in 0..blen {
        data[pos + i] = (val >> (8 * i)) as u8;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitflip_patterns() {
        assert!(could_be_bitflip(0));
        assert!(could_be_bitflip(0b1000));
        assert!(could_be_bitflip(0b0110));
        assert!(could_be_bitflip(0xf0));
        assert!(could_be_bitflip(0xff00));
        assert!(!could_be_bitflip(0xff0));
        assert!(!could_be_bitflip(0b101));
    }

    #[test]
    fn arith_patterns() {
        assert!(could_be_arith(10, 20, 1, ARITH_MAX));
        assert!(!could_be_arith(10, 200, 1, ARITH_MAX));
        assert!(could_be_arith(0x00ff, 0x0100, 2, ARITH_MAX));
        assert!(could_be_arith(0x0100_0000, 0x00ff_ffff, 4, ARITH_MAX));
        assert!(!could_be_arith(0x1234, 0x4321, 2, ARITH_MAX));
    }

    #[test]
    fn interest_patterns() {
        assert!(could_be_interest(0x1234, 0x12ff, 2, false));
        assert!(!could_be_interest(0x1234, 0x03e8, 2, false));
        assert!(could_be_interest(0x1234, 0x03e8, 2, true));
        assert!(could_be_interest(0, 0x7fff_ffff, 4, true));
    }

    #[test]
    fn le_access() {
        let mut buf = [0_u8; 6];
        write_le(&mut buf, 1, 4, 0x0403_0201);
        assert_eq!(buf, [0, 1, 2, 3, 4, 0]);
        assert_eq!(read_le(&buf, 1, 2), 0x0201);
    }
}
