//! Input-to-state correspondence: replay compare operands observed during execution
//! into the input.
use crate::{mutation::dict::Dictionary, HashMap, HashSet, MAX_PAYLOAD_SIZE};
use std::collections::{BTreeMap, BTreeSet};

pub mod cmp;
pub mod parser;

use cmp::{Cmp, Encoding};
use parser::HookParser;

/// Replace `lhs` at `offset` with `rhs`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Patch {
    pub offset: usize,
    pub lhs: Vec<u8>,
    pub rhs: Vec<u8>,
}

/// One Redqueen candidate, possibly touching several places of the input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    pub patches: Vec<Patch>,
    /// Compare addresses and encodings this mutation was derived from.
    pub infos: BTreeSet<(u64, Encoding)>,
}

impl Mutation {
    /// Input offsets touched by the mutation.
    pub fn offsets(&self) -> Vec<usize> {
        self.patches.iter().map(|p| p.offset).collect()
    }

    /// Compare addresses as hex strings.
    pub fn cmp_addrs(&self) -> Vec<String> {
        self.infos.iter().map(|(a, _)| format!("{:x}", a)).collect()
    }
}

/// Drop bytes lhs and rhs agree on, splitting a patch into its differing runs.
pub fn strip_unchanged(offset: usize, lhs: &[u8], rhs: &[u8]) -> Vec<Patch> {
    if lhs.len() != rhs.len() {
        return vec![Patch {
            offset,
            lhs: lhs.to_vec(),
            rhs: rhs.to_vec(),
        }];
    }
    let mut ret = Vec::new();
    let mut i = 0;
    while i < lhs.len() {
        let mut j = i;
        while j < lhs.len() && lhs[j] != rhs[j] {
            j += 1;
        }
        if j != i {
            ret.push(Patch {
                offset: offset + i,
                lhs: lhs[i..j].to_vec(),
                rhs: rhs[i..j].to_vec(),
            });
        }
        i = j + 1;
    }
    ret
}

/// Apply `m` to `data`.
pub fn fuzz_data(data: &[u8], m: &Mutation) -> Vec<u8> {
    let same_len = m.patches.iter().all(|p| p.lhs.len() == p.rhs.len());
    if same_len {
        let mut out = data.to_vec();
        for p in &m.patches {
            if let Some(dst) = out.get_mut(p.offset..p.offset + p.rhs.len()) {
                dst.copy_from_slice(&p.rhs);
            }
        }
        return out;
    }

    let mut patches: Vec<&Patch> = m.patches.iter().collect();
    patches.sort_by_key(|p| p.offset);
    let mut out = Vec::with_capacity(data.len());
    let mut last = 0;
    for p in patches {
        if p.offset < last || p.offset > data.len() {
            continue;
        }
        out.extend_from_slice(&data[last..p.offset]);
        out.extend_from_slice(&p.rhs);
        last = (p.offset + p.lhs.len()).min(data.len());
    }
    out.extend_from_slice(&data[last..]);
    out.truncate(MAX_PAYLOAD_SIZE);
    out
}

/// Compare logs of the original input and its colored alternatives.
#[derive(Default)]
pub struct RedqueenInfo {
    parser: HookParser,
    cmps: BTreeMap<u64, Cmp>,
    inv_cmps: BTreeMap<u64, Cmp>,
    inputs: HashMap<usize, Vec<u8>>,
    orig: Option<usize>,
    boring: HashSet<u64>,
    hammer_jmp_tables: bool,
}

impl RedqueenInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also propose neighbouring indices for `LEA` operands.
    pub fn with_hammering(hammer_jmp_tables: bool) -> Self {
        Self {
            hammer_jmp_tables,
            ..Self::default()
        }
    }

    /// Record the compare log of run `id`.
    pub fn add_run(&mut self, id: usize, was_colored: bool, hook_info: &str, input: &[u8]) {
        if !was_colored {
            self.orig = Some(id);
        }
        self.inputs.insert(id, input.to_vec());
        for h in self.parser.parse(hook_info) {
            if h.lhs == h.rhs {
                continue;
            }
            let c = self.cmps.entry(h.addr).or_insert_with(|| Cmp::new(&h));
            if c.size != h.size || c.ty != h.ty || c.is_imm != h.is_imm {
                log::debug!("inconsistent compare record at {:x}", h.addr);
                continue;
            }
            c.add_result(id, h.lhs.clone(), h.rhs.clone());
            if !h.is_imm {
                self.inv_cmps
                    .entry(h.addr)
                    .or_insert_with(|| Cmp::new(&h))
                    .add_result(id, h.rhs, h.lhs);
            }
        }
    }

    pub fn num_runs(&self) -> usize {
        self.inputs.len()
    }

    /// Deduplicated mutations of the original input.
    pub fn mutations(&mut self) -> Vec<Mutation> {
        let orig = match self.orig {
            Some(o) => o,
            None => return Vec::new(),
        };
        let runs = self.inputs.len();
        let mut dedup: BTreeMap<Vec<Patch>, BTreeSet<(u64, Encoding)>> = BTreeMap::new();
        self.boring.clear();

        for c in self.cmps.values().chain(self.inv_cmps.values()) {
            let mut interesting = false;
            if c.runs() == runs {
                let mut props = c.calc_mutations(orig, &self.inputs);
                if self.hammer_jmp_tables {
                    props.extend(c.hammer_mutations(orig, &self.inputs));
                }
                for p in props {
                    let patches = strip_unchanged(p.offset, &p.lhs, &p.rhs);
                    if patches.is_empty() {
                        continue;
                    }
                    interesting = true;
                    dedup.entry(patches).or_default().insert((c.addr, p.encoding));
                }
            }
            if !interesting {
                self.boring.insert(c.addr);
            }
        }
        dedup
            .into_iter()
            .map(|(patches, infos)| Mutation { patches, infos })
            .collect()
    }

    /// Compares that yielded no mutation in the last `mutations` call.
    pub fn boring_cmps(&self) -> &HashSet<u64> {
        &self.boring
    }

    /// Addresses of compares that look like checksum checks.
    pub fn hash_candidates(&self) -> BTreeSet<u64> {
        let orig_input = match self.orig.and_then(|o| self.inputs.get(&o)) {
            Some(i) => i,
            None => return BTreeSet::new(),
        };
        self.cmps
            .values()
            .filter(|c| c.could_be_hash(orig_input))
            .map(|c| c.addr)
            .collect()
    }

    /// Feed rhs operands into the redqueen part of `dict`.
    pub fn update_dict(&self, dict: &mut Dictionary) {
        for c in self.cmps.values() {
            for v in c.rhs_values() {
                if v.len() >= 2 {
                    dict.add_redqueen(c.addr, v.clone());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_value_found() {
        let input = b"....MAGI....".to_vec();
        let mut colored = input.clone();
        colored[0..4].copy_from_slice(b"wxyz");
        colored[8..12].copy_from_slice(b"qrst");

        let mut info = RedqueenInfo::new();
        // target compares input[4..8] with "MAGC"
        info.add_run(1, true, "400 CMP 32 4d414749-4d414743", &colored);
        info.add_run(2, false, "400 CMP 32 4d414749-4d414743\n", &input);
        let muts = info.mutations();
        assert!(!muts.is_empty());
        let out: Vec<_> = muts.iter().map(|m| fuzz_data(&input, m)).collect();
        assert!(out.contains(&b"....MAGC....".to_vec()));
        // only the differing byte is patched
        assert!(muts.iter().any(|m| m.offsets() == vec![7]));
    }

    #[test]
    fn cmp_missing_in_a_run_is_boring() {
        let input = b"ABCD".to_vec();
        let mut info = RedqueenInfo::new();
        info.add_run(1, true, "", b"xxxx");
        info.add_run(2, false, "10 CMP 32 41424344-45464748", &input);
        assert!(info.mutations().is_empty());
        assert!(info.boring_cmps().contains(&0x10));
    }

    #[test]
    fn strip() {
        let p = strip_unchanged(10, b"abcdef", b"abXdYY");
        assert_eq!(
            p,
            vec![
                Patch {
                    offset: 12,
                    lhs: b"c".to_vec(),
                    rhs: b"X".to_vec()
                },
                Patch {
                    offset: 14,
                    lhs: b"ef".to_vec(),
                    rhs: b"YY".to_vec()
                },
            ]
        );
        assert!(strip_unchanged(0, b"ab", b"ab").is_empty());
    }

    #[test]
    fn splice_different_len() {
        let m = Mutation {
            patches: vec![Patch {
                offset: 2,
                lhs: b"cd".to_vec(),
                rhs: b"XYZ".to_vec(),
            }],
            infos: BTreeSet::new(),
        };
        assert_eq!(fuzz_data(b"abcdef", &m), b"abXYZef".to_vec());
    }

    #[test]
    fn dict_from_operands() {
        let mut info = RedqueenInfo::new();
        info.add_run(1, false, "20 CMP 16 4142-4344\n30 CMP 8 41-42 IMM", b"AB");
        let mut dict = Dictionary::default();
        info.update_dict(&mut dict);
        let values = &dict.redqueen()[&0x20];
        assert!(values.contains(&b"CD".to_vec()));
        assert!(!dict.redqueen().contains_key(&0x30));
    }
}
