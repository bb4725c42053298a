use anyhow::Context;
use ptfuzz_vm::QemuConfig;
use std::{
    env::current_dir,
    fs::canonicalize,
    path::{Path, PathBuf},
};

#[derive(Debug, Clone)]
pub struct Config {
    pub work_dir: PathBuf,
    pub seed_dir: PathBuf,
    /// Agent executable copied into the binary region of every vm.
    pub agent: PathBuf,
    pub jobs: usize,
    pub timeout_tick_factor: f64,
    pub arith_max: u32,
    /// Fraction of the measured performance spent on each havoc round.
    pub havoc_multiplier: f64,
    pub dict: Option<PathBuf>,
    pub redqueen: bool,
    pub hammer_jmp_tables: bool,
    pub fix_hashes: bool,
    pub effector: bool,
    pub skip_zero: bool,
    pub depth_first: bool,
    pub radamsa: bool,
    pub radamsa_path: PathBuf,
    /// Wipe the work directory before starting.
    pub purge: bool,
    /// Seconds between two performance measurements of the master.
    pub refresh_rate: u64,
    /// Seconds between two statistics lines.
    pub report_interval: u64,
    pub disable_sampling: bool,
    pub tasks_per_request: usize,

    pub qemu_config: QemuConfig,
}

impl Default for Config {
    fn default() -> Self {
        let cwd = current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self {
            work_dir: cwd.join("work"),
            seed_dir: cwd.join("seeds"),
            agent: cwd.join("agent"),
            jobs: 4,
            timeout_tick_factor: 10.0,
            arith_max: ptfuzz_core::mutation::ARITH_MAX,
            havoc_multiplier: 0.5,
            dict: None,
            redqueen: false,
            hammer_jmp_tables: false,
            fix_hashes: false,
            effector: false,
            skip_zero: false,
            depth_first: false,
            radamsa: false,
            radamsa_path: PathBuf::from("radamsa"),
            purge: false,
            refresh_rate: 1,
            report_interval: 10,
            disable_sampling: false,
            tasks_per_request: 1,

            qemu_config: QemuConfig::default(),
        }
    }
}

impl Config {
    pub fn check(&mut self) -> anyhow::Result<()> {
        if !self.seed_dir.is_dir() {
            anyhow::bail!("bad seed dir: {}", self.seed_dir.display());
        }
        if !self.agent.is_file() {
            anyhow::bail!("bad agent binary: {}", self.agent.display());
        }
        if let Some(d) = self.dict.as_ref() {
            if !d.is_file() {
                anyhow::bail!("bad dict file: {}", d.display());
            }
        }
        if self.work_dir.is_file() {
            anyhow::bail!("work dir is a file: {}", self.work_dir.display());
        }
        if self.jobs == 0 || self.jobs > 1024 {
            anyhow::bail!("invalid jobs '{}': should be in range [1-1024]", self.jobs);
        }
        if self.tasks_per_request == 0 {
            anyhow::bail!("tasks per request should be positive");
        }
        if !(self.timeout_tick_factor > 0.0) {
            anyhow::bail!("invalid timeout tick factor: {}", self.timeout_tick_factor);
        }
        if !(self.havoc_multiplier > 0.0) {
            anyhow::bail!("invalid havoc multiplier: {}", self.havoc_multiplier);
        }
        if self.fix_hashes && !self.redqueen {
            anyhow::bail!("hash fixing needs redqueen");
        }
        if self.hammer_jmp_tables && !self.redqueen {
            anyhow::bail!("jump table hammering needs redqueen");
        }
        if self.refresh_rate == 0 || self.report_interval == 0 {
            anyhow::bail!("refresh rate and report interval should be positive");
        }
        self.qemu_config.check().context("qemu config error")?;
        Ok(())
    }

    /// Canonicalize paths, the work dir must exist.
    pub fn fixup(&mut self) -> anyhow::Result<()> {
        self.work_dir = canonical(&self.work_dir)?;
        self.seed_dir = canonical(&self.seed_dir)?;
        self.agent = canonical(&self.agent)?;
        if let Some(d) = self.dict.as_mut() {
            *d = canonical(d)?;
        }
        let q = &mut self.qemu_config;
        for p in [&mut q.kernel, &mut q.initrd, &mut q.ram_file, &mut q.overlay_dir]
            .iter_mut()
            .filter_map(|p| p.as_mut())
        {
            *p = canonical(p)?;
        }
        q.debug_mode |= log::log_enabled!(log::Level::Trace);
        Ok(())
    }
}

fn canonical(p: &Path) -> anyhow::Result<PathBuf> {
    canonicalize(p).with_context(|| format!("failed to canonicalize {}", p.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_missing_seeds() {
        let mut c = Config {
            seed_dir: PathBuf::from("/nonexistent/seeds"),
            ..Default::default()
        };
        let e = c.check().unwrap_err();
        assert!(e.to_string().contains("seed dir"));
    }

    #[test]
    fn hash_fixing_needs_redqueen() {
        let dir = std::env::temp_dir().join(format!("ptfuzz-cfg-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let agent = dir.join("agent");
        std::fs::write(&agent, b"\x7fELF").unwrap();
        let mut c = Config {
            seed_dir: dir.clone(),
            agent,
            fix_hashes: true,
            ..Default::default()
        };
        let e = c.check().unwrap_err();
        assert!(e.to_string().contains("redqueen"));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
