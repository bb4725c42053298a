//! Boot up and manage QEMU-PT
use nix::{
    sys::signal::{killpg, Signal},
    unistd::{setsid, Pid},
};
use ptfuzz_io::{thread::read_background, BackgroundIoHandle};
use regex::Regex;
use std::{
    fs,
    os::unix::prelude::CommandExt,
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    time::Duration,
};
use thiserror::Error;

/// Min version of qemu, the kAFL device needs the i440fx-2.6 machine.
pub const MIN_QEMU_VERSION: (u32, u32) = (2, 6);
/// Kernel command line used when booting a kernel directly.
pub const KERNEL_APPEND: &str = "nokaslr oops=panic nopti";

/// Configuration of booting QEMU-PT.
#[derive(Debug, Clone)]
pub struct QemuConfig {
    /// Path to the QEMU-PT executable.
    pub qemu_bin: String,
    /// Mem size in megabyte.
    pub mem: u32,
    /// Memory snapshot file, booted together with `overlay_dir` and `snapshot`.
    pub ram_file: Option<PathBuf>,
    /// Dir of per instance qcow2 overlays, `overlay_<id>.qcow2`.
    pub overlay_dir: Option<PathBuf>,
    /// Name of the vm snapshot to load.
    pub snapshot: Option<String>,
    pub kernel: Option<PathBuf>,
    pub initrd: Option<PathBuf>,
    /// PT filter range.
    pub ip0: Option<(u64, u64)>,
    pub bitmap_size: usize,
    pub debug_mode: bool,
}

impl Default for QemuConfig {
    fn default() -> Self {
        Self {
            qemu_bin: "qemu-system-x86_64".to_string(),
            mem: 300,
            ram_file: None,
            overlay_dir: None,
            snapshot: None,
            kernel: None,
            initrd: None,
            ip0: None,
            bitmap_size: 1 << 16,
            debug_mode: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum QemuConfigError {
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("invalid memory size '{sz}'M: {reason}")]
    InvalidMemSize { sz: usize, reason: String },
    #[error("invalid bitmap size '{0}': should be a power of two")]
    InvalidBitmapSize(usize),
    #[error("invalid ip filter range: {0:#x}-{1:#x}")]
    InvalidIpRange(u64, u64),
    #[error("boot target missing: need a kernel and initrd, or a ram file, overlay dir and snapshot")]
    NoBootTarget,
    #[error("qemu check failed: {0}")]
    QemuCheckFailed(String),
}

impl QemuConfig {
    pub fn check(&self) -> Result<(), QemuConfigError> {
        match (&self.kernel, &self.initrd, &self.ram_file, &self.overlay_dir, &self.snapshot) {
            (Some(kernel), Some(initrd), _, _, _) => {
                check_file(kernel)?;
                check_file(initrd)?;
            }
            (None, _, Some(ram), Some(overlay), Some(_)) => {
                check_file(ram)?;
                if !overlay.is_dir() {
                    return Err(QemuConfigError::InvalidPath(overlay.display().to_string()));
                }
            }
            _ => return Err(QemuConfigError::NoBootTarget),
        }
        if self.mem < 128 || self.mem > 1048576 {
            return Err(QemuConfigError::InvalidMemSize {
                sz: self.mem as usize,
                reason: "should be in range [128-1048576]".to_string(),
            });
        }
        if !self.bitmap_size.is_power_of_two() {
            return Err(QemuConfigError::InvalidBitmapSize(self.bitmap_size));
        }
        if let Some((a, b)) = self.ip0 {
            if a >= b {
                return Err(QemuConfigError::InvalidIpRange(a, b));
            }
        }
        self.check_qemu_version()
    }

    fn check_qemu_version(&self) -> Result<(), QemuConfigError> {
        let output = Command::new(&self.qemu_bin)
            .arg("--version")
            .output()
            .map_err(|e| {
                QemuConfigError::QemuCheckFailed(format!("failed to spawn '{}': {}", self.qemu_bin, e))
            })?;
        if !output.status.success() {
            return Err(QemuConfigError::QemuCheckFailed(format!(
                "failed to execute '{} --version': {:?}",
                self.qemu_bin, output.status
            )));
        }
        let output = String::from_utf8_lossy(&output.stdout);
        match parse_version(&output) {
            Some(v) if v >= MIN_QEMU_VERSION => Ok(()),
            Some(v) => Err(QemuConfigError::QemuCheckFailed(format!(
                "version not match: your version '{}.{}', required '{}.{}'",
                v.0, v.1, MIN_QEMU_VERSION.0, MIN_QEMU_VERSION.1
            ))),
            None => Err(QemuConfigError::QemuCheckFailed(format!(
                "failed to parse output of '{} --version': {}",
                self.qemu_bin, output
            ))),
        }
    }
}

fn check_file(p: &Path) -> Result<(), QemuConfigError> {
    if p.is_file() {
        Ok(())
    } else {
        Err(QemuConfigError::InvalidPath(p.display().to_string()))
    }
}

/// Parse the `major.minor` version out of `qemu --version` output.
pub fn parse_version(output: &str) -> Option<(u32, u32)> {
    let re = Regex::new(r"version (\d+)\.(\d+)").unwrap();
    let caps = re.captures(output)?;
    Some((caps[1].parse().ok()?, caps[2].parse().ok()?))
}

/// Resources of one instance the kAFL device is wired to.
#[derive(Debug, Clone)]
pub struct KaflDevice {
    pub id: usize,
    pub control: PathBuf,
    pub binary_shm: PathBuf,
    pub payload_shm: PathBuf,
    pub bitmap_shm: PathBuf,
    pub redqueen_workdir: PathBuf,
}

pub struct QemuHandle {
    qemu_cfg: QemuConfig,
    dev: KaflDevice,
    qemu: Option<Child>,
    stdout: Option<BackgroundIoHandle>,
    stderr: Option<BackgroundIoHandle>,
}

impl QemuHandle {
    pub fn with_config(config: QemuConfig, dev: KaflDevice) -> Self {
        Self {
            qemu_cfg: config,
            dev,
            qemu: None,
            stdout: None,
            stderr: None,
        }
    }

    /// Spawn the instance, killing the previous one first. The control socket is
    /// created by QEMU and must be connected to by the caller.
    pub fn boot(&mut self) -> Result<(), BootError> {
        if self.qemu.is_some() {
            log::debug!("vm-{}: rebooting", self.dev.id);
            self.kill_qemu();
        }
        if self.dev.control.exists() {
            fs::remove_file(&self.dev.control)?;
        }

        let mut qemu_cmd = build_qemu_command(&self.qemu_cfg, &self.dev);
        qemu_cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        unsafe {
            qemu_cmd.pre_exec(|| {
                let _ = setsid();
                Ok(())
            });
        }
        if self.dev.id == 0 {
            log::info!("qemu cmd: {:?}", qemu_cmd);
        } else {
            log::debug!("qemu cmd: {:?}", qemu_cmd);
        }

        let mut child = qemu_cmd.spawn()?;
        if let Some(out) = child.stdout.take() {
            self.stdout = Some(read_background(out));
        }
        if let Some(err) = child.stderr.take() {
            self.stderr = Some(read_background(err));
        }
        if let Some(status) = child.try_wait()? {
            let stderr = self
                .stderr
                .take()
                .map(|h| h.wait_finish(Duration::from_secs(1)))
                .unwrap_or_default();
            return Err(BootError::Boot(format!(
                "qemu exited with: {}\ncmdline: {:?}\nSTDERR:\n{}",
                status,
                qemu_cmd,
                String::from_utf8_lossy(&stderr)
            )));
        }
        self.qemu = Some(child);
        Ok(())
    }

    pub fn pid(&self) -> Option<u32> {
        self.qemu.as_ref().map(|c| c.id())
    }

    /// User plus system time of the instance in clock ticks.
    pub fn cpu_ticks(&self) -> Option<u64> {
        let stat = fs::read_to_string(format!("/proc/{}/stat", self.pid()?)).ok()?;
        parse_stat_ticks(&stat)
    }

    /// Output collected since the last call.
    pub fn take_output(&mut self) -> (Vec<u8>, Vec<u8>) {
        let stdout = self.stdout.as_ref().map(|h| h.current_data()).unwrap_or_default();
        let stderr = self.stderr.as_ref().map(|h| h.current_data()).unwrap_or_default();
        (stdout, stderr)
    }

    pub fn kill(&mut self) {
        self.kill_qemu();
    }

    fn kill_qemu(&mut self) {
        if let Some(mut qemu) = self.qemu.take() {
            let pgid = Pid::from_raw(qemu.id() as i32);
            if let Err(e) = killpg(pgid, Signal::SIGKILL) {
                log::debug!("vm-{}: killpg: {}", self.dev.id, e);
                let _ = qemu.kill();
            }
            let _ = qemu.wait();
        }
        self.stdout = None;
        self.stderr = None;
        let _ = fs::remove_file(&self.dev.control);
    }
}

impl Drop for QemuHandle {
    fn drop(&mut self) {
        self.kill_qemu();
    }
}

#[derive(Debug, Error)]
pub enum BootError {
    #[error("boot: {0}")]
    Boot(String),
    #[error("spawn: {0}")]
    Spawn(#[from] std::io::Error),
}

fn parse_stat_ticks(stat: &str) -> Option<u64> {
    // fields after the command name, which may contain spaces
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // utime and stime are fields 14 and 15 of the whole line
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

fn kafl_device_arg(conf: &QemuConfig, dev: &KaflDevice) -> String {
    let mut arg = format!(
        "kafl,chardev=kafl_interface,bitmap_size={},shm0={},shm1={},bitmap={},redqueen_workdir={}",
        conf.bitmap_size,
        dev.binary_shm.display(),
        dev.payload_shm.display(),
        dev.bitmap_shm.display(),
        dev.redqueen_workdir.display()
    );
    if conf.debug_mode {
        arg += ",debug_mode";
    }
    arg += ",reload_mode=False";
    if conf.kernel.is_some() {
        arg += ",disable_snapshot=True";
    }
    if let Some((a, b)) = conf.ip0 {
        arg += &format!(",ip0_a={:#x},ip0_b={:#x},filter0=/dev/shm/kafl_filter0", a, b);
    }
    arg
}

fn build_qemu_command(conf: &QemuConfig, dev: &KaflDevice) -> Command {
    let mut boot = Vec::new();
    if let (Some(kernel), Some(initrd)) = (&conf.kernel, &conf.initrd) {
        boot.extend(vec![
            "-kernel".to_string(),
            kernel.display().to_string(),
            "-initrd".to_string(),
            initrd.display().to_string(),
            "-append".to_string(),
            KERNEL_APPEND.to_string(),
        ]);
    } else if let (Some(ram), Some(overlay)) = (&conf.ram_file, &conf.overlay_dir) {
        boot.extend(vec![
            "-hdb".to_string(),
            ram.display().to_string(),
            "-hda".to_string(),
            overlay
                .join(format!("overlay_{}.qcow2", dev.id))
                .display()
                .to_string(),
        ]);
    }

    let common = vec![
        "-serial".to_string(),
        "mon:stdio".to_string(),
        "-enable-kvm".to_string(),
        "-k".to_string(),
        "de".to_string(),
        "-m".to_string(),
        conf.mem.to_string(),
        "-nographic".to_string(),
        "-net".to_string(),
        "user".to_string(),
        "-net".to_string(),
        "nic".to_string(),
    ];
    let kafl = vec![
        "-chardev".to_string(),
        format!("socket,server,nowait,path={},id=kafl_interface", dev.control.display()),
        "-device".to_string(),
        kafl_device_arg(conf, dev),
    ];

    let mut snapshot = Vec::new();
    if conf.kernel.is_none() {
        if let Some(s) = conf.snapshot.as_ref() {
            snapshot = vec!["-loadvm".to_string(), s.clone()];
        }
    }
    let machine = vec!["-machine".to_string(), "pc-i440fx-2.6".to_string()];

    let mut qemu_cmd = Command::new(&conf.qemu_bin);
    qemu_cmd
        .args(&boot)
        .args(&common)
        .args(&kafl)
        .args(&snapshot)
        .args(&machine);
    qemu_cmd
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dev() -> KaflDevice {
        KaflDevice {
            id: 3,
            control: PathBuf::from("/work/kafl_qemu_control_3"),
            binary_shm: PathBuf::from("/dev/shm/kafl_qemu_binary_3"),
            payload_shm: PathBuf::from("/dev/shm/kafl_qemu_payload_3"),
            bitmap_shm: PathBuf::from("/dev/shm/kafl_bitmap_3"),
            redqueen_workdir: PathBuf::from("/tmp/redqueen_workdir_3"),
        }
    }

    fn args(cmd: &Command) -> Vec<String> {
        cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect()
    }

    #[test]
    fn snapshot_cmdline() {
        let conf = QemuConfig {
            ram_file: Some(PathBuf::from("/vm/ram.qcow2")),
            overlay_dir: Some(PathBuf::from("/vm/overlays")),
            snapshot: Some("kafl".to_string()),
            ip0: Some((0x1000, 0x2000)),
            ..Default::default()
        };
        let a = args(&build_qemu_command(&conf, &dev()));
        assert_eq!(&a[..4], &["-hdb", "/vm/ram.qcow2", "-hda", "/vm/overlays/overlay_3.qcow2"]);
        let kafl = a.iter().find(|s| s.starts_with("kafl,")).unwrap();
        assert!(kafl.contains("shm1=/dev/shm/kafl_qemu_payload_3"));
        assert!(kafl.contains(",ip0_a=0x1000,ip0_b=0x2000,filter0=/dev/shm/kafl_filter0"));
        assert!(!kafl.contains("disable_snapshot"));
        assert!(a.windows(2).any(|w| w[0] == "-loadvm" && w[1] == "kafl"));
        assert_eq!(a.last().unwrap(), "pc-i440fx-2.6");
    }

    #[test]
    fn kernel_cmdline() {
        let conf = QemuConfig {
            kernel: Some(PathBuf::from("/vm/bzImage")),
            initrd: Some(PathBuf::from("/vm/init.cpio")),
            snapshot: Some("ignored".to_string()),
            ..Default::default()
        };
        let a = args(&build_qemu_command(&conf, &dev()));
        assert_eq!(a[5], KERNEL_APPEND);
        assert!(a.iter().any(|s| s.ends_with("reload_mode=False,disable_snapshot=True")));
        assert!(!a.iter().any(|s| s == "-loadvm"));
    }

    #[test]
    fn version_and_ticks() {
        assert_eq!(parse_version("QEMU emulator version 2.9.0, Copyright"), Some((2, 9)));
        assert_eq!(parse_version("nothing"), None);
        let stat = "1234 (qemu system) S 1 1234 1234 0 -1 4194560 100 0 0 0 70 30 0 0 20 0";
        assert_eq!(parse_stat_ticks(stat), Some(100));
    }

    #[test]
    fn missing_boot_target() {
        assert!(matches!(QemuConfig::default().check(), Err(QemuConfigError::NoBootTarget)));
    }
}
