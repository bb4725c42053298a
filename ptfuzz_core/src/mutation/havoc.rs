//! Stacked random mutation.
use super::{dict::Dictionary, splice::splice, ARITH_MAX, INTERESTING_16, INTERESTING_32, INTERESTING_8};
use crate::{RngType, MAX_PAYLOAD_SIZE};
use rand::prelude::*;
use std::cmp::min;

/// Min number of havoc iterations per input.
pub const HAVOC_MIN: usize = 2000;
/// Max log2 of stacked operations.
pub const HAVOC_STACK_POW2: u32 = 7;

const HAVOC_BLK_SMALL: usize = 32;
const HAVOC_BLK_MEDIUM: usize = 128;
const HAVOC_BLK_LARGE: usize = 1500;
const HAVOC_BLK_XL: usize = 32768;

/// Number of havoc iterations for a performance score.
pub fn havoc_range(perf_score: f64) -> usize {
    let n = (perf_score * 2.5) as usize;
    n.max(HAVOC_MIN)
}

/// Context shared by all havoc operations.
pub struct HavocContext<'a> {
    pub dict: &'a Dictionary,
}

// A havoc operation tries to mutate the input buffer, return `true` if it successed.
pub type HavocOperation = fn(&mut RngType, &mut Vec<u8>, &HavocContext) -> bool;

pub const HAVOC_OPERATIONS: [HavocOperation; 16] = [
    flip_bit,
    interesting8,
    interesting16,
    interesting32,
    sub8,
    add8,
    arith16,
    arith32,
    random_byte,
    delete_block,
    delete_block,
    clone_block,
    overwrite_block,
    insert_token,
    overwrite_token,
    overwrite_token,
];

/// Apply a stack of random operations to a copy of `data`.
pub fn havoc_once(rng: &mut RngType, data: &[u8], ctx: &HavocContext) -> Vec<u8> {
    let mut buf = data.to_vec();
    let stack = 1_usize << (1 + rng.gen_range(0..HAVOC_STACK_POW2));
    for _ in 0..stack {
        let op = HAVOC_OPERATIONS.choose(rng).unwrap();
        op(rng, &mut buf, ctx);
        buf.truncate(MAX_PAYLOAD_SIZE);
    }
    buf
}

/// Produce `amount` havoc candidates.
pub fn mutate(rng: &mut RngType, data: &[u8], ctx: &HavocContext, amount: usize, mut emit: impl FnMut(&[u8])) {
    for _ in 0..amount {
        let out = havoc_once(rng, data, ctx);
        emit(&out);
    }
}

/// Produce `amount` spliced candidates, falls back to plain havoc if no donor changed the payload.
pub fn mutate_splicing(
    rng: &mut RngType,
    data: &[u8],
    ctx: &HavocContext,
    amount: usize,
    mut donor: impl FnMut(&mut RngType) -> Option<Vec<u8>>,
    mut emit: impl FnMut(&[u8]),
) {
    for _ in 0..amount {
        let out = match splice(rng, data, &mut donor) {
            Some(spliced) => havoc_once(rng, &spliced, ctx),
            None => havoc_once(rng, data, ctx),
        };
        emit(&out);
    }
}

/// Length of a block operation, never exceeds `limit`, `limit` must not be zero.
fn choose_block_len(rng: &mut RngType, limit: usize) -> usize {
    debug_assert!(limit != 0);
    let (mut lo, hi) = match rng.gen_range(0..3) {
        0 => (1, HAVOC_BLK_SMALL),
        1 => (HAVOC_BLK_SMALL, HAVOC_BLK_MEDIUM),
        _ => {
            if rng.gen_ratio(1, 10) {
                (HAVOC_BLK_LARGE, HAVOC_BLK_XL)
            } else {
                (HAVOC_BLK_MEDIUM, HAVOC_BLK_LARGE)
            }
        }
    };
    if lo >= limit {
        lo = 1;
    }
    lo + rng.gen_range(0..=(min(hi, limit) - lo))
}

trait Number: Sized + Copy {
    const LEN: usize;
    fn read(buf: &[u8], swap: bool) -> Self;
    fn write(self, buf: &mut [u8], swap: bool);
    fn wrapping_add(self, rhs: Self) -> Self;
    fn wrapping_sub(self, rhs: Self) -> Self;
    fn from_u32(v: u32) -> Self;
}

macro_rules! impl_num_trait {
    ($ty:ty) => {
        impl Number for $ty {
            const LEN: usize = std::mem::size_of::<$ty>();
            fn read(buf: &[u8], swap: bool) -> Self {
                let mut array = [0u8; Self::LEN];
                array[..].copy_from_slice(&buf[..Self::LEN]);
                let v = <$ty>::from_le_bytes(array);
                if swap {
                    v.swap_bytes()
                } else {
                    v
                }
            }

            fn write(self, buf: &mut [u8], swap: bool) {
                let new = if swap { self.swap_bytes() } else { self };
                buf[..Self::LEN].copy_from_slice(&new.to_le_bytes());
            }

            fn wrapping_add(self, rhs: Self) -> Self {
                <$ty>::wrapping_add(self, rhs)
            }

            fn wrapping_sub(self, rhs: Self) -> Self {
                <$ty>::wrapping_sub(self, rhs)
            }

            fn from_u32(v: u32) -> Self {
                v as $ty
            }
        }
    };
}

impl_num_trait!(u8);
impl_num_trait!(u16);
impl_num_trait!(u32);

/// Add or subtract a small value to a random scalar in random byte order.
fn perturb<T: Number>(rng: &mut RngType, buf: &mut Vec<u8>) -> bool {
    if buf.len() < T::LEN {
        return false;
    }
    let swap = rng.gen();
    let pos = rng.gen_range(0..=buf.len() - T::LEN);
    let delta = T::from_u32(rng.gen_range(1..=ARITH_MAX));
    let old = T::read(&buf[pos..], swap);
    let new = if rng.gen() {
        old.wrapping_add(delta)
    } else {
        old.wrapping_sub(delta)
    };
    new.write(&mut buf[pos..], swap);
    true
}

/// Flips a single bit.
fn flip_bit(rng: &mut RngType, buf: &mut Vec<u8>, _ctx: &HavocContext) -> bool {
    if buf.is_empty() {
        return false;
    }
    let bit = rng.gen_range(0..buf.len() * 8);
    buf[bit / 8] ^= 0x80 >> (bit % 8);
    true
}

fn interesting8(rng: &mut RngType, buf: &mut Vec<u8>, _ctx: &HavocContext) -> bool {
    if buf.is_empty() {
        return false;
    }
    let pos = rng.gen_range(0..buf.len());
    buf[pos] = *INTERESTING_8.choose(rng).unwrap() as u8;
    true
}

fn interesting16(rng: &mut RngType, buf: &mut Vec<u8>, _ctx: &HavocContext) -> bool {
    if buf.len() < 2 {
        return false;
    }
    let pos = rng.gen_range(0..=buf.len() - 2);
    let v = *INTERESTING_16.choose(rng).unwrap() as u16;
    v.write(&mut buf[pos..], rng.gen());
    true
}

fn interesting32(rng: &mut RngType, buf: &mut Vec<u8>, _ctx: &HavocContext) -> bool {
    if buf.len() < 4 {
        return false;
    }
    let pos = rng.gen_range(0..=buf.len() - 4);
    let v = *INTERESTING_32.choose(rng).unwrap() as u32;
    v.write(&mut buf[pos..], rng.gen());
    true
}

fn sub8(rng: &mut RngType, buf: &mut Vec<u8>, _ctx: &HavocContext) -> bool {
    if buf.is_empty() {
        return false;
    }
    let pos = rng.gen_range(0..buf.len());
    buf[pos] = buf[pos].wrapping_sub(rng.gen_range(1..=ARITH_MAX) as u8);
    true
}

fn add8(rng: &mut RngType, buf: &mut Vec<u8>, _ctx: &HavocContext) -> bool {
    if buf.is_empty() {
        return false;
    }
    let pos = rng.gen_range(0..buf.len());
    buf[pos] = buf[pos].wrapping_add(rng.gen_range(1..=ARITH_MAX) as u8);
    true
}

fn arith16(rng: &mut RngType, buf: &mut Vec<u8>, _ctx: &HavocContext) -> bool {
    perturb::<u16>(rng, buf)
}

fn arith32(rng: &mut RngType, buf: &mut Vec<u8>, _ctx: &HavocContext) -> bool {
    perturb::<u32>(rng, buf)
}

/// Sets a random byte to a different random value.
fn random_byte(rng: &mut RngType, buf: &mut Vec<u8>, _ctx: &HavocContext) -> bool {
    if buf.is_empty() {
        return false;
    }
    let pos = rng.gen_range(0..buf.len());
    buf[pos] ^= rng.gen_range(1..=255);
    true
}

fn delete_block(rng: &mut RngType, buf: &mut Vec<u8>, _ctx: &HavocContext) -> bool {
    if buf.len() < 2 {
        return false;
    }
    let len = choose_block_len(rng, buf.len() - 1);
    let from = rng.gen_range(0..=buf.len() - len);
    buf.drain(from..from + len);
    true
}

/// Inserts a cloned block or a block of one constant byte.
fn clone_block(rng: &mut RngType, buf: &mut Vec<u8>, _ctx: &HavocContext) -> bool {
    if buf.is_empty() || buf.len() + HAVOC_BLK_XL >= MAX_PAYLOAD_SIZE {
        return false;
    }
    let to = rng.gen_range(0..=buf.len());
    let block = if rng.gen_range(0..4) != 0 {
        let len = choose_block_len(rng, buf.len());
        let from = rng.gen_range(0..=buf.len() - len);
        buf[from..from + len].to_vec()
    } else {
        let len = choose_block_len(rng, HAVOC_BLK_XL);
        let byte = if rng.gen() {
            rng.gen()
        } else {
            buf[rng.gen_range(0..buf.len())]
        };
        vec![byte; len]
    };
    buf.splice(to..to, block);
    true
}

/// Overwrites a block with another block of the buffer or with one constant byte.
fn overwrite_block(rng: &mut RngType, buf: &mut Vec<u8>, _ctx: &HavocContext) -> bool {
    if buf.len() < 2 {
        return false;
    }
    let len = choose_block_len(rng, buf.len() - 1);
    let from = rng.gen_range(0..=buf.len() - len);
    let to = rng.gen_range(0..=buf.len() - len);
    if rng.gen_range(0..4) != 0 {
        if from != to {
            buf.copy_within(from..from + len, to);
        }
    } else {
        let byte = if rng.gen() {
            rng.gen()
        } else {
            buf[rng.gen_range(0..buf.len())]
        };
        for b in &mut buf[to..to + len] {
            *b = byte;
        }
    }
    true
}

fn insert_token(rng: &mut RngType, buf: &mut Vec<u8>, ctx: &HavocContext) -> bool {
    let token = match ctx.dict.choose(rng) {
        Some(t) => t,
        None => return false,
    };
    if buf.len() + token.len() > MAX_PAYLOAD_SIZE {
        return false;
    }
    let pos = rng.gen_range(0..=buf.len());
    buf.splice(pos..pos, token.iter().copied());
    true
}

fn overwrite_token(rng: &mut RngType, buf: &mut Vec<u8>, ctx: &HavocContext) -> bool {
    let token = match ctx.dict.choose(rng) {
        Some(t) => t,
        None => return false,
    };
    if token.len() > buf.len() {
        return false;
    }
    let pos = rng.gen_range(0..=buf.len() - token.len());
    buf[pos..pos + token.len()].copy_from_slice(token);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{prelude::SmallRng, SeedableRng};

    fn empty_ctx() -> Dictionary {
        Dictionary::default()
    }

    #[test]
    fn range() {
        assert_eq!(havoc_range(0.0), HAVOC_MIN);
        assert_eq!(havoc_range(4000.0), 10000);
    }

    #[test]
    fn ops_on_empty() {
        let mut rng = SmallRng::from_entropy();
        let dict = empty_ctx();
        let ctx = HavocContext { dict: &dict };
        for op in HAVOC_OPERATIONS.iter() {
            let mut buf = Vec::new();
            assert!(!op(&mut rng, &mut buf, &ctx));
        }
    }

    #[test]
    fn block_len_bound() {
        let mut rng = SmallRng::from_entropy();
        for limit in 1..300 {
            let l = choose_block_len(&mut rng, limit);
            assert!(l >= 1 && l <= limit);
        }
    }

    #[test]
    fn havoc_bounded() {
        let mut rng = SmallRng::from_entropy();
        let mut dict = Dictionary::default();
        dict.add_redqueen(1, b"token".to_vec());
        let ctx = HavocContext { dict: &dict };
        let data: Vec<u8> = (0..512).map(|_| rng.gen()).collect();
        let mut n = 0;
        mutate(&mut rng, &data, &ctx, 256, |c| {
            assert!(c.len() <= MAX_PAYLOAD_SIZE);
            n += 1;
        });
        assert_eq!(n, 256);
    }

    #[test]
    fn splicing_falls_back() {
        let mut rng = SmallRng::from_entropy();
        let dict = empty_ctx();
        let ctx = HavocContext { dict: &dict };
        let mut n = 0;
        mutate_splicing(&mut rng, b"abcdefgh", &ctx, 8, |_| None, |_| n += 1);
        assert_eq!(n, 8);
    }

    #[test]
    fn token_ops() {
        let mut rng = SmallRng::from_entropy();
        let mut dict = Dictionary::default();
        dict.add_redqueen(1, b"XY".to_vec());
        let ctx = HavocContext { dict: &dict };
        let mut buf = b"abc".to_vec();
        assert!(insert_token(&mut rng, &mut buf, &ctx));
        assert_eq!(buf.len(), 5);
        let mut buf = b"a".to_vec();
        assert!(!overwrite_token(&mut rng, &mut buf, &ctx));
    }
}
