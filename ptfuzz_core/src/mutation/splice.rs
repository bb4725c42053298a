//! Splice the payload with a donor from the corpus or findings.
use crate::{RngType, MAX_PAYLOAD_SIZE};
use rand::Rng;

/// Max number of donors tried for one splice.
pub const SPLICE_TRIES: usize = 16;

/// First and last differing offsets within the common prefix length.
fn locate_diffs(a: &[u8], b: &[u8]) -> Option<(usize, usize)> {
    let len = a.len().min(b.len());
    let first = (0..len).find(|&i| a[i] != b[i])?;
    let last = (0..len).rev().find(|&i| a[i] != b[i])?;
    Some((first, last))
}

/// Combine the head of `data` with the tail of `donor`, `None` if the donor can not
/// change the payload.
pub fn splice_with(rng: &mut RngType, data: &[u8], donor: &[u8]) -> Option<Vec<u8>> {
    let (first, last) = locate_diffs(data, donor)?;
    if last < 2 || first == last {
        return None;
    }
    let split_at = rng.gen_range(first..last);
    let mut out = Vec::with_capacity(donor.len());
    out.extend_from_slice(&data[..split_at]);
    out.extend_from_slice(&donor[split_at..]);
    out.truncate(MAX_PAYLOAD_SIZE);
    Some(out)
}

/// Pull donors from `donor` until one changes the payload.
pub fn splice(
    rng: &mut RngType,
    data: &[u8],
    mut donor: impl FnMut(&mut RngType) -> Option<Vec<u8>>,
) -> Option<Vec<u8>> {
    for _ in 0..SPLICE_TRIES {
        let d = donor(rng)?;
        if let Some(out) = splice_with(rng, data, &d) {
            return Some(out);
        }
    }
    None
}
