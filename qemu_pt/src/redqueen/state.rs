//! Redqueen knowledge shared by all workers: checksum candidates and blacklists.
use super::workdir::RedqueenWorkdir;
use crate::{HashMap, HashSet};
use std::{
    collections::BTreeSet,
    fs::File,
    io::{self, BufWriter, Write},
    path::Path,
    sync::{Arc, Mutex},
};

#[derive(Debug, Default)]
struct Inner {
    blacklisted_hashes: HashSet<u64>,
    candidate_hashes: HashSet<u64>,
    /// Offset histogram per candidate address.
    candidate_file_offsets: HashMap<u64, HashMap<usize, u64>>,
}

/// Cheap to clone handle, every mutation goes through one lock.
#[derive(Debug, Clone, Default)]
pub struct RedqueenState {
    inner: Arc<Mutex<Inner>>,
}

impl RedqueenState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a checksum candidate unless it was blacklisted before.
    pub fn add_candidate_hash_addr(&self, addr: u64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.blacklisted_hashes.contains(&addr) || inner.candidate_hashes.contains(&addr) {
            return false;
        }
        log::info!("hash candidate: {:x}", addr);
        inner.candidate_hashes.insert(addr);
        inner.candidate_file_offsets.insert(addr, HashMap::default());
        true
    }

    pub fn add_candidate_file_offset(&self, addr: u64, offset: usize) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(hist) = inner.candidate_file_offsets.get_mut(&addr) {
            *hist.entry(offset).or_default() += 1;
        }
    }

    pub fn candidate_file_offsets(&self, addr: u64) -> Option<HashMap<usize, u64>> {
        self.inner
            .lock()
            .unwrap()
            .candidate_file_offsets
            .get(&addr)
            .cloned()
    }

    pub fn blacklist_hash_addr(&self, addr: u64) {
        let mut inner = self.inner.lock().unwrap();
        if inner.blacklisted_hashes.insert(addr) {
            log::info!("blacklist hash: {:x}", addr);
            inner.candidate_hashes.remove(&addr);
        }
    }

    pub fn candidate_hash_addrs(&self) -> BTreeSet<u64> {
        self.inner
            .lock()
            .unwrap()
            .candidate_hashes
            .iter()
            .copied()
            .collect()
    }

    pub fn blacklisted_hash_addrs(&self) -> BTreeSet<u64> {
        self.inner
            .lock()
            .unwrap()
            .blacklisted_hashes
            .iter()
            .copied()
            .collect()
    }

    pub fn is_blacklisted_hash(&self, addr: u64) -> bool {
        self.inner.lock().unwrap().blacklisted_hashes.contains(&addr)
    }

    /// Write the files QEMU-PT reads on (re)start and on UPDATE_REDQUEEN: candidates are
    /// patched out and watched, blacklisted addresses are no longer hooked.
    pub fn persist(&self, workdir: &RedqueenWorkdir) -> io::Result<()> {
        let candidates = self.candidate_hash_addrs();
        write_addrs(&workdir.patches(), candidates.iter().copied())?;
        write_addrs(&workdir.whitelist(), candidates)?;
        write_addrs(&workdir.blacklist(), self.blacklisted_hash_addrs())
    }
}

/// Bare hex addresses one per line, synced to disk before return.
fn write_addrs<I: IntoIterator<Item = u64>>(path: &Path, addrs: I) -> io::Result<()> {
    let f = File::create(path)?;
    let mut w = BufWriter::new(f);
    for addr in addrs {
        if addr != 0 {
            writeln!(w, "{:x}", addr)?;
        }
    }
    let f = w.into_inner().map_err(|e| e.into_error())?;
    f.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn blacklisted_never_candidate() {
        let s = RedqueenState::new();
        assert!(s.add_candidate_hash_addr(0x10));
        assert!(!s.add_candidate_hash_addr(0x10));
        s.add_candidate_file_offset(0x10, 4);
        s.add_candidate_file_offset(0x10, 4);
        assert_eq!(s.candidate_file_offsets(0x10).unwrap()[&4], 2);
        s.blacklist_hash_addr(0x10);
        assert!(s.candidate_hash_addrs().is_empty());
        assert!(!s.add_candidate_hash_addr(0x10));
        assert!(s.is_blacklisted_hash(0x10));
    }

    #[test]
    fn persisted_files() {
        let dir = std::env::temp_dir().join(format!("ptfuzz-rq-state-{}", std::process::id()));
        let wd = RedqueenWorkdir::with_base(&dir, 7);
        wd.init_dir().unwrap();
        let s = RedqueenState::new();
        s.add_candidate_hash_addr(0xdead);
        s.add_candidate_hash_addr(0x1);
        s.persist(&wd).unwrap();
        assert_eq!(fs::read_to_string(wd.patches()).unwrap(), "1\ndead\n");
        assert_eq!(fs::read_to_string(wd.whitelist()).unwrap(), "1\ndead\n");
        assert_eq!(fs::read_to_string(wd.blacklist()).unwrap(), "");

        s.blacklist_hash_addr(0xdead);
        s.persist(&wd).unwrap();
        assert_eq!(fs::read_to_string(wd.patches()).unwrap(), "1\n");
        assert_eq!(fs::read_to_string(wd.blacklist()).unwrap(), "dead\n");
        fs::remove_dir_all(&dir).unwrap();
    }
}
