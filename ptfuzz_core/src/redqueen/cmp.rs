//! Operand pairs of one compare instruction across runs.
use super::parser::{CmpType, HookLine};
use crate::{HashMap, HashSet};
use std::fmt;

/// How an operand may be stored in the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Encoding {
    Plain,
    Reversed,
}

pub const ENCODINGS: [Encoding; 2] = [Encoding::Plain, Encoding::Reversed];

impl Encoding {
    pub fn encode(self, v: &[u8]) -> Vec<u8> {
        match self {
            Encoding::Plain => v.to_vec(),
            Encoding::Reversed => v.iter().rev().copied().collect(),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Encoding::Plain => "plain",
            Encoding::Reversed => "reversed",
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Every occurrence of `pat` in `data`, overlapping ones included.
pub fn find_all(data: &[u8], pat: &[u8]) -> Vec<usize> {
    if pat.is_empty() || pat.len() > data.len() {
        return Vec::new();
    }
    data.windows(pat.len())
        .enumerate()
        .filter(|(_, w)| *w == pat)
        .map(|(i, _)| i)
        .collect()
}

/// Neighbouring values tried per `LEA` operand when hammering jump tables.
pub const HAMMER_RANGE: u8 = 8;

/// Big endian wrapping add.
fn add_be(v: &[u8], k: u8) -> Vec<u8> {
    let mut out = v.to_vec();
    let mut carry = k as u16;
    for b in out.iter_mut().rev() {
        if carry == 0 {
            break;
        }
        let sum = *b as u16 + carry;
        *b = sum as u8;
        carry = sum >> 8;
    }
    out
}

/// Raw proposal: replace `lhs` at `offset` with `rhs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawProposal {
    pub offset: usize,
    pub lhs: Vec<u8>,
    pub rhs: Vec<u8>,
    pub encoding: Encoding,
}

#[derive(Debug, Clone)]
pub struct Cmp {
    pub addr: u64,
    pub ty: CmpType,
    pub size: usize,
    pub is_imm: bool,
    /// Operand pairs per run id.
    pairs: HashMap<usize, HashSet<(Vec<u8>, Vec<u8>)>>,
}

impl Cmp {
    pub fn new(h: &HookLine) -> Self {
        Self {
            addr: h.addr,
            ty: h.ty,
            size: h.size,
            is_imm: h.is_imm,
            pairs: HashMap::default(),
        }
    }

    pub fn add_result(&mut self, run: usize, lhs: Vec<u8>, rhs: Vec<u8>) {
        self.pairs.entry(run).or_default().insert((lhs, rhs));
    }

    /// Number of runs this compare was observed in.
    pub fn runs(&self) -> usize {
        self.pairs.len()
    }

    fn lhs_of(&self, run: usize) -> impl Iterator<Item = &Vec<u8>> + '_ {
        self.pairs.get(&run).into_iter().flatten().map(|(l, _)| l)
    }

    /// Proposals derived from the original run, kept only where every colored run saw
    /// the encoded lhs at the same offset of its own input.
    pub fn calc_mutations(&self, orig: usize, inputs: &HashMap<usize, Vec<u8>>) -> Vec<RawProposal> {
        let mut ret = Vec::new();
        if let (Some(orig_input), Some(orig_pairs)) = (inputs.get(&orig), self.pairs.get(&orig)) {
            for (lhs, rhs) in orig_pairs {
                self.propose(orig, orig_input, inputs, lhs, rhs, &mut ret);
            }
        }
        ret
    }

    /// Jump table hammering: an index computed by `LEA` is replaced with its
    /// neighbours, reaching the other table entries.
    pub fn hammer_mutations(&self, orig: usize, inputs: &HashMap<usize, Vec<u8>>) -> Vec<RawProposal> {
        let mut ret = Vec::new();
        if self.ty != CmpType::Lea {
            return ret;
        }
        if let (Some(orig_input), Some(orig_pairs)) = (inputs.get(&orig), self.pairs.get(&orig)) {
            for (lhs, _) in orig_pairs {
                for k in 1..=HAMMER_RANGE {
                    let rhs = add_be(lhs, k);
                    self.propose(orig, orig_input, inputs, lhs, &rhs, &mut ret);
                }
            }
        }
        ret
    }

    fn propose(
        &self,
        orig: usize,
        orig_input: &[u8],
        inputs: &HashMap<usize, Vec<u8>>,
        lhs: &[u8],
        rhs: &[u8],
        out: &mut Vec<RawProposal>,
    ) {
        for enc in ENCODINGS.iter().copied() {
            let pat = enc.encode(lhs);
            let repl = enc.encode(rhs);
            for offset in find_all(orig_input, &pat) {
                if self.consistent(orig, offset, pat.len(), enc, inputs) {
                    out.push(RawProposal {
                        offset,
                        lhs: pat.clone(),
                        rhs: repl.clone(),
                        encoding: enc,
                    });
                }
            }
        }
    }

    fn consistent(
        &self,
        orig: usize,
        offset: usize,
        len: usize,
        enc: Encoding,
        inputs: &HashMap<usize, Vec<u8>>,
    ) -> bool {
        for (run, input) in inputs {
            if *run == orig {
                continue;
            }
            let window = match input.get(offset..offset + len) {
                Some(w) => w,
                None => return false,
            };
            if !self.lhs_of(*run).any(|l| enc.encode(l) == window) {
                return false;
            }
        }
        true
    }

    /// Checksum-like compare: lhs is computed from the input while the expected value
    /// is stored in it.
    pub fn could_be_hash(&self, orig_input: &[u8]) -> bool {
        if self.is_imm || self.size < 32 {
            return false;
        }
        let lhs: HashSet<&Vec<u8>> = self.pairs.values().flatten().map(|(l, _)| l).collect();
        if lhs.len() < 2 {
            return false;
        }
        self.pairs.values().flatten().any(|(_, rhs)| {
            ENCODINGS
                .iter()
                .any(|e| !find_all(orig_input, &e.encode(rhs)).is_empty())
        })
    }

    /// Every rhs value seen in any run.
    pub fn rhs_values(&self) -> impl Iterator<Item = &Vec<u8>> + '_ {
        self.pairs.values().flatten().map(|(_, r)| r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redqueen::parser::HookParser;

    fn cmp(line: &str) -> Cmp {
        Cmp::new(&HookParser::new().parse_line(line).unwrap())
    }

    #[test]
    fn overlapping_matches() {
        assert_eq!(find_all(b"aaaa", b"aa"), vec![0, 1, 2]);
        assert!(find_all(b"a", b"aa").is_empty());
        assert!(find_all(b"abc", b"").is_empty());
    }

    #[test]
    fn colored_run_filters_offsets() {
        let mut c = cmp("10 CMP 32 41414141-42424242");
        let mut inputs = HashMap::default();
        // "AAAA" occurs twice in the original, the colored run only agrees with offset 4
        inputs.insert(1, b"AAAAAAAA".to_vec());
        inputs.insert(2, b"xyzwAAAA".to_vec());
        c.add_result(1, b"AAAA".to_vec(), b"BBBB".to_vec());
        c.add_result(2, b"AAAA".to_vec(), b"BBBB".to_vec());
        let offsets: Vec<_> = c
            .calc_mutations(1, &inputs)
            .into_iter()
            .map(|p| p.offset)
            .collect();
        assert!(offsets.contains(&4));
        assert!(!offsets.contains(&0));
    }

    #[test]
    fn reversed_encoding() {
        let mut c = cmp("10 CMP 32 01020304-05060708");
        let mut inputs = HashMap::default();
        inputs.insert(1, vec![0, 4, 3, 2, 1, 0]);
        c.add_result(1, vec![1, 2, 3, 4], vec![5, 6, 7, 8]);
        let props = c.calc_mutations(1, &inputs);
        assert_eq!(props.len(), 1);
        assert_eq!(props[0].offset, 1);
        assert_eq!(props[0].encoding, Encoding::Reversed);
        assert_eq!(props[0].rhs, vec![8, 7, 6, 5]);
    }

    #[test]
    fn hammer_lea_neighbours() {
        let mut c = cmp("10 LEA 16 00ff-1000");
        let mut inputs = HashMap::default();
        inputs.insert(1, vec![7, 0, 0xff, 7]);
        c.add_result(1, vec![0, 0xff], vec![0x10, 0]);
        let props = c.hammer_mutations(1, &inputs);
        assert_eq!(props.len(), HAMMER_RANGE as usize);
        assert!(props.iter().all(|p| p.offset == 1));
        assert_eq!(props[0].rhs, vec![1, 0]);

        let plain = cmp("10 CMP 16 00ff-1000");
        assert!(plain.hammer_mutations(1, &inputs).is_empty());
    }

    #[test]
    fn hash_heuristic() {
        let mut c = cmp("10 CMP 32 01020304-0a0b0c0d");
        c.add_result(1, vec![1, 2, 3, 4], vec![0xa, 0xb, 0xc, 0xd]);
        c.add_result(2, vec![9, 9, 9, 9], vec![0xa, 0xb, 0xc, 0xd]);
        assert!(c.could_be_hash(&[0, 0xa, 0xb, 0xc, 0xd]));
        assert!(!c.could_be_hash(&[0, 0]));

        let mut imm = cmp("10 CMP 32 01020304-0a0b0c0d IMM");
        imm.add_result(1, vec![1, 2, 3, 4], vec![0xa, 0xb, 0xc, 0xd]);
        imm.add_result(2, vec![9, 9, 9, 9], vec![0xa, 0xb, 0xc, 0xd]);
        assert!(!imm.could_be_hash(&[0xa, 0xb, 0xc, 0xd]));
    }
}
