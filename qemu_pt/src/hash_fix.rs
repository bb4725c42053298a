//! Repair checksums in inputs found while checksum compares were patched out.
use crate::{
    channel::{ChannelError, VmChannel},
    redqueen::RedqueenState,
};
use ptfuzz_core::redqueen::{
    cmp::{find_all, ENCODINGS},
    parser::{HookLine, HookParser},
};
use std::collections::BTreeSet;

/// Rounds of rewriting before giving up.
pub const MAX_FIX_ROUNDS: usize = 5;

pub struct HashFixer<'a> {
    ch: &'a mut VmChannel,
    state: &'a RedqueenState,
    parser: HookParser,
}

impl<'a> HashFixer<'a> {
    pub fn new(ch: &'a mut VmChannel, state: &'a RedqueenState) -> Self {
        Self {
            ch,
            state,
            parser: HookParser::new(),
        }
    }

    /// Returns an input that reaches the patched behavior without patches, or `None`
    /// if the checksums could not be repaired. Candidates that fail are blacklisted.
    pub fn try_fix_data(&mut self, data: &[u8]) -> Result<Option<Vec<u8>>, ChannelError> {
        self.ch.set_payload(data)?;
        self.ch.send_payload(true)?;
        let patched = self.ch.bitmap().to_vec();
        self.ch.send_payload(false)?;
        if self.ch.bitmap() == &patched[..] {
            return Ok(Some(data.to_vec()));
        }

        let mut data = data.to_vec();
        let mut fixed = BTreeSet::new();
        for _ in 0..MAX_FIX_ROUNDS {
            let broken = self.broken_cmps(&data)?;
            if broken.is_empty() {
                break;
            }
            let mut changed = false;
            for h in broken {
                match fix_cmp(&data, &h) {
                    Some((offset, d)) => {
                        self.state.add_candidate_file_offset(h.addr, offset);
                        fixed.insert(h.addr);
                        data = d;
                        changed = true;
                    }
                    None => {
                        log::debug!("vm-{}: checksum at {:x} not found in input", self.ch.id(), h.addr);
                        self.state.blacklist_hash_addr(h.addr);
                    }
                }
            }
            if !changed {
                break;
            }
        }

        self.ch.set_payload(&data)?;
        self.ch.send_payload(false)?;
        if self.ch.bitmap() == &patched[..] {
            log::info!("vm-{}: fixed checksums at {:x?}", self.ch.id(), fixed);
            return Ok(Some(data));
        }
        for addr in fixed {
            self.state.blacklist_hash_addr(addr);
        }
        Ok(None)
    }

    /// Candidate checksum compares whose operands disagree for `data`.
    fn broken_cmps(&mut self, data: &[u8]) -> Result<Vec<HookLine>, ChannelError> {
        self.ch.set_payload(data)?;
        self.ch.execute_in_redqueen_mode()?;
        let log = self.ch.workdir().read_redqueen()?;
        let candidates = self.state.candidate_hash_addrs();
        let mut seen = BTreeSet::new();
        Ok(self
            .parser
            .parse(&log)
            .into_iter()
            .filter(|h| candidates.contains(&h.addr) && h.lhs != h.rhs)
            .filter(|h| seen.insert(h.addr))
            .collect())
    }
}

/// Replace the stored checksum (rhs) with the computed one (lhs), returning the offset
/// that was rewritten.
pub fn fix_cmp(data: &[u8], h: &HookLine) -> Option<(usize, Vec<u8>)> {
    for enc in ENCODINGS.iter() {
        let stored = enc.encode(&h.rhs);
        if let Some(&offset) = find_all(data, &stored).first() {
            let mut out = data.to_vec();
            out[offset..offset + stored.len()].copy_from_slice(&enc.encode(&h.lhs));
            return Some((offset, out));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use ptfuzz_core::redqueen::parser::CmpType;

    fn hook(lhs: &[u8], rhs: &[u8]) -> HookLine {
        HookLine {
            addr: 0x4000,
            ty: CmpType::Cmp,
            size: lhs.len() * 8,
            is_imm: false,
            lhs: lhs.to_vec(),
            rhs: rhs.to_vec(),
        }
    }

    #[test]
    fn rewrite_stored_checksum() {
        let data = b"HDR\x04\x03\x02\x01body";
        let h = hook(&[0xaa, 0xbb, 0xcc, 0xdd], &[0x01, 0x02, 0x03, 0x04]);
        let (offset, fixed) = fix_cmp(data, &h).unwrap();
        assert_eq!(offset, 3);
        assert_eq!(&fixed[3..7], &[0xdd, 0xcc, 0xbb, 0xaa]);
        assert_eq!(&fixed[7..], b"body");

        let h = hook(&[1, 1, 1, 1], &[9, 9, 9, 9]);
        assert!(fix_cmp(data, &h).is_none());
    }
}
