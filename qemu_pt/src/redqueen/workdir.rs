//! Per-VM directory QEMU-PT reads and writes Redqueen data in.
use std::{
    fs, io,
    path::{Path, PathBuf},
};

#[derive(Debug, Clone)]
pub struct RedqueenWorkdir {
    base: PathBuf,
}

impl RedqueenWorkdir {
    pub fn new(id: usize) -> Self {
        Self::with_base("/tmp", id)
    }

    pub fn with_base<P: AsRef<Path>>(dir: P, id: usize) -> Self {
        Self {
            base: dir.as_ref().join(format!("redqueen_workdir_{}", id)),
        }
    }

    /// Recreate the directory, removing stale results.
    pub fn init_dir(&self) -> io::Result<()> {
        if self.base.exists() {
            fs::remove_dir_all(&self.base)?;
        }
        fs::create_dir_all(&self.base)
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Compare log of the last Redqueen run.
    pub fn redqueen(&self) -> PathBuf {
        self.base.join("redqueen_results.txt")
    }

    pub fn patches(&self) -> PathBuf {
        self.base.join("redqueen_patches.txt")
    }

    pub fn whitelist(&self) -> PathBuf {
        self.base.join("breakpoint_white.txt")
    }

    pub fn blacklist(&self) -> PathBuf {
        self.base.join("breakpoint_black.txt")
    }

    /// Read the compare log, empty if the run produced none.
    pub fn read_redqueen(&self) -> io::Result<String> {
        match fs::read_to_string(self.redqueen()) {
            Ok(s) => Ok(s),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e),
        }
    }
}
