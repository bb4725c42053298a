//! Synchronous control protocol with one QEMU-PT instance.
//!
//! Every exchange is a single tag byte. A run starts with `RELEASE` and ends with
//! `ACQUIRE`, possibly preceded by a fault or trace overflow notification.
use crate::{
    lookup::LookupSet,
    protocol::Command,
    redqueen::RedqueenWorkdir,
    shm::{ShmError, VmRegions},
};
use ptfuzz_core::{bitmap, trim::TrimTarget, MAX_PAYLOAD_SIZE};
use std::{
    convert::TryFrom,
    fs,
    io::{self, Read, Write},
    os::unix::net::UnixStream,
    path::{Path, PathBuf},
    thread::sleep,
    time::{Duration, Instant},
};
use thiserror::Error;

/// Retries on trace buffer overflow before giving up on a run.
pub const OVERFLOW_RETRIES: usize = 1;
/// Max number of debug print files per run.
pub const MAX_PRINTF_FILES: usize = 512;

const CONNECT_RETRY: usize = 600;
const CONNECT_INTERVAL: Duration = Duration::from_millis(100);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("protocol desync: expected {expected}, got {got}")]
    Protocol { expected: String, got: String },
    #[error("handshake: {0}")]
    Handshake(String),
    #[error("agent aborted")]
    Abort,
    #[error("agent finished with info request")]
    Info,
    #[error("shm: {0}")]
    Shm(#[from] ShmError),
    #[error("payload too large: {0}")]
    PayloadTooLarge(usize),
    #[error("patches toggled twice without an execution in between")]
    PatchToggle,
}

/// Classification of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Normal,
    Crash,
    Kasan,
    Timeout,
    /// Trace buffer kept overflowing, bitmap is not usable.
    Overflow,
}

impl RunOutcome {
    #[inline]
    pub fn is_fault(self) -> bool {
        matches!(self, RunOutcome::Crash | RunOutcome::Kasan | RunOutcome::Timeout)
    }
}

/// Session state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Launching,
    Handshake1,
    Handshake2,
    Ready,
    Running,
    Crashed,
    Timeout,
    Kasan,
    /// Protocol failed, the VM must be respawned.
    Dead,
}

impl VmState {
    /// Whether a new run can be started.
    #[inline]
    pub fn can_run(self) -> bool {
        matches!(self, VmState::Ready | VmState::Crashed | VmState::Timeout | VmState::Kasan)
    }
}

/// Fault flags of the last run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelState {
    pub crashed: bool,
    pub timeout: bool,
    pub kasan: bool,
}

impl ChannelState {
    #[inline]
    pub fn any(&self) -> bool {
        self.crashed || self.timeout || self.kasan
    }

    fn merge(&mut self, other: ChannelState) {
        self.crashed |= other.crashed;
        self.timeout |= other.timeout;
        self.kasan |= other.kasan;
    }
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub id: usize,
    pub control: PathBuf,
    pub timeout_tick_factor: f64,
}

pub struct VmChannel {
    id: usize,
    control_path: PathBuf,
    control: UnixStream,
    regions: VmRegions,
    lookup: LookupSet,
    workdir: RedqueenWorkdir,
    vm_state: VmState,
    state: ChannelState,

    patches_enabled: bool,
    needs_execution_for_patches: bool,
    overflow_count: u64,
    printf_counter: usize,
    tick_timeout_factor: f64,
    tick_timeout_threshold: f64,
    last_exec: Duration,
}

/// Connect to the control socket, waiting for QEMU to create it.
pub fn connect_control(path: &Path) -> Result<UnixStream, ChannelError> {
    let mut last_err = None;
    for _ in 0..CONNECT_RETRY {
        match UnixStream::connect(path) {
            Ok(s) => return Ok(s),
            Err(e) => last_err = Some(e),
        }
        sleep(CONNECT_INTERVAL);
    }
    Err(ChannelError::Handshake(format!(
        "failed to connect to {}: {}",
        path.display(),
        last_err.map(|e| e.to_string()).unwrap_or_default()
    )))
}

impl VmChannel {
    pub fn new(config: &ChannelConfig, control: UnixStream, regions: VmRegions, lookup: LookupSet) -> Self {
        Self {
            id: config.id,
            control_path: config.control.clone(),
            control,
            regions,
            lookup,
            workdir: RedqueenWorkdir::new(config.id),
            vm_state: VmState::Launching,
            state: ChannelState::default(),
            patches_enabled: false,
            needs_execution_for_patches: false,
            overflow_count: 0,
            printf_counter: 0,
            tick_timeout_factor: config.timeout_tick_factor,
            tick_timeout_threshold: config.timeout_tick_factor,
            last_exec: Duration::default(),
        }
    }

    /// Connect to a booting VM and finish the initial handshake.
    pub fn start(
        config: &ChannelConfig,
        regions: VmRegions,
        lookup: LookupSet,
        agent: &[u8],
        payload: Option<&[u8]>,
    ) -> Result<Self, ChannelError> {
        let control = connect_control(&config.control)?;
        let mut ch = Self::new(config, control, regions, lookup);
        ch.set_init_state(agent, payload)?;
        ch.regions.clear_bitmap();
        Ok(ch)
    }

    /// Reconnect after the VM was rebooted. Regions and the tick threshold are kept.
    pub fn restart(&mut self, agent: &[u8], payload: Option<&[u8]>) -> Result<(), ChannelError> {
        self.vm_state = VmState::Launching;
        self.control = connect_control(&self.control_path)?;
        self.patches_enabled = false;
        self.needs_execution_for_patches = false;
        self.set_init_state(agent, payload)?;
        self.regions.clear_bitmap();
        Ok(())
    }

    /// Two-stage handshake followed by one run without patches.
    pub fn set_init_state(&mut self, agent: &[u8], payload: Option<&[u8]>) -> Result<(), ChannelError> {
        self.state = ChannelState::default();
        self.regions.set_binary(agent)?;

        self.control.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
        self.handshake().map_err(|e| {
            self.vm_state = VmState::Dead;
            match e {
                ChannelError::Io(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                    ChannelError::Handshake("timeout".to_string())
                }
                e => e,
            }
        })?;
        self.control.set_read_timeout(None)?;

        if let Some(p) = payload {
            self.set_payload(p)?;
        }
        self.send_payload(false)?;
        self.state = ChannelState::default();
        Ok(())
    }

    fn handshake(&mut self) -> Result<(), ChannelError> {
        self.vm_state = VmState::Handshake1;
        self.expect(&[Command::Release, Command::PtTrashed])?;
        log::debug!("vm-{}: initial stage 1 handshake done", self.id);
        self.vm_state = VmState::Handshake2;
        self.send(Command::Release)?;
        self.expect(&[Command::Acquire, Command::PtTrashed])?;
        log::debug!("vm-{}: initial stage 2 handshake done", self.id);
        self.vm_state = VmState::Ready;
        Ok(())
    }

    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    #[inline]
    pub fn vm_state(&self) -> VmState {
        self.vm_state
    }

    #[inline]
    pub fn state(&self) -> ChannelState {
        self.state
    }

    #[inline]
    pub fn bitmap(&self) -> &[u8] {
        self.regions.bitmap.as_slice()
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        self.regions.payload()
    }

    pub fn workdir(&self) -> &RedqueenWorkdir {
        &self.workdir
    }

    pub fn set_workdir(&mut self, workdir: RedqueenWorkdir) {
        self.workdir = workdir;
    }

    pub fn overflow_count(&self) -> u64 {
        self.overflow_count
    }

    /// Wall time of the last completed run.
    pub fn last_exec_time(&self) -> Duration {
        self.last_exec
    }

    pub fn set_tick_timeout_threshold(&mut self, avg_ticks: f64) {
        self.tick_timeout_threshold = if avg_ticks == 0.0 {
            1.0
        } else {
            3.0 * avg_ticks * self.tick_timeout_factor
        };
    }

    pub fn tick_timeout_threshold(&self) -> f64 {
        self.tick_timeout_threshold
    }

    fn send(&mut self, cmd: Command) -> Result<(), ChannelError> {
        log::trace!("vm-{}: send {}", self.id, cmd);
        self.control.write_all(&[cmd.byte()])?;
        Ok(())
    }

    /// Next control byte, debug prints are consumed on the way.
    fn recv(&mut self) -> Result<Command, ChannelError> {
        loop {
            let mut b = [0; 1];
            self.control.read_exact(&mut b)?;
            let cmd = Command::try_from(b[0]).map_err(|b| ChannelError::Protocol {
                expected: "control byte".to_string(),
                got: format!("{:#04x}", b),
            })?;
            log::trace!("vm-{}: recv {}", self.id, cmd);
            match cmd {
                Command::Printf => self.hprintf(),
                Command::Info => {
                    self.dump_info();
                    return Err(ChannelError::Info);
                }
                Command::Abort => return Err(ChannelError::Abort),
                Command::Acquire => {
                    self.printf_counter = 0;
                    return Ok(cmd);
                }
                _ => return Ok(cmd),
            }
        }
    }

    fn expect(&mut self, expected: &[Command]) -> Result<Command, ChannelError> {
        let got = self.recv()?;
        if expected.contains(&got) {
            Ok(got)
        } else {
            Err(ChannelError::Protocol {
                expected: expected.iter().map(|c| c.name()).collect::<Vec<_>>().join("|"),
                got: got.name().to_string(),
            })
        }
    }

    /// Send `cmd` and wait for the echo.
    fn request(&mut self, cmd: Command) -> Result<(), ChannelError> {
        self.send(cmd)?;
        self.expect(&[cmd])?;
        Ok(())
    }

    fn hprintf(&mut self) {
        if self.printf_counter >= MAX_PRINTF_FILES {
            return;
        }
        let path = format!("/tmp/kAFL_printf.txt.{}", self.printf_counter);
        self.printf_counter += 1;
        match fs::read_to_string(&path) {
            Ok(s) => log::info!("vm-{}: hprintf: {}", self.id, s.trim_end_matches('\n')),
            Err(e) => log::warn!("vm-{}: failed to read {}: {}", self.id, path, e),
        }
    }

    fn dump_info(&self) {
        const INFO_FILE: &str = "/tmp/kAFL_info.txt";
        if let Ok(info) = fs::read_to_string(INFO_FILE) {
            log::info!("vm-{}: agent info:\n{}", self.id, info);
            let _ = fs::remove_file(INFO_FILE);
        }
    }

    fn set_patches(&mut self, enable: bool) -> Result<(), ChannelError> {
        if self.patches_enabled == enable {
            return Ok(());
        }
        if self.needs_execution_for_patches {
            return Err(ChannelError::PatchToggle);
        }
        self.needs_execution_for_patches = true;
        self.patches_enabled = enable;
        if enable {
            self.request(Command::EnablePatches)
        } else {
            self.request(Command::DisablePatches)
        }
    }

    /// Restore the tracing state without a snapshot rollback, currently nothing to do.
    pub fn soft_reload(&mut self) -> Result<(), ChannelError> {
        Ok(())
    }

    /// Execute the payload in the payload region. Any error leaves the channel dead.
    pub fn send_payload(&mut self, apply_patches: bool) -> Result<RunOutcome, ChannelError> {
        debug_assert!(self.vm_state.can_run(), "run in state {:?}", self.vm_state);
        let ret = self.run_payload(apply_patches);
        self.vm_state = match ret {
            Ok(RunOutcome::Crash) => VmState::Crashed,
            Ok(RunOutcome::Kasan) => VmState::Kasan,
            Ok(RunOutcome::Timeout) => VmState::Timeout,
            Ok(_) => VmState::Ready,
            Err(_) => VmState::Dead,
        };
        ret
    }

    fn run_payload(&mut self, apply_patches: bool) -> Result<RunOutcome, ChannelError> {
        for _ in 0..=OVERFLOW_RETRIES {
            self.set_patches(apply_patches)?;
            self.state = ChannelState::default();
            let start = Instant::now();
            self.vm_state = VmState::Running;
            self.send(Command::Release)?;
            let outcome = match self.recv()? {
                Command::Acquire => RunOutcome::Normal,
                Command::Crash => {
                    self.state.crashed = true;
                    self.expect(&[Command::Acquire])?;
                    RunOutcome::Crash
                }
                Command::Kasan => {
                    self.state.kasan = true;
                    self.expect(&[Command::Acquire])?;
                    RunOutcome::Kasan
                }
                Command::Timeout => {
                    self.state.timeout = true;
                    RunOutcome::Timeout
                }
                c if c.is_overflow() => {
                    self.overflow_count += 1;
                    if c != Command::PtTrashed {
                        self.soft_reload()?;
                    }
                    RunOutcome::Overflow
                }
                c => {
                    return Err(ChannelError::Protocol {
                        expected: "run result".to_string(),
                        got: c.name().to_string(),
                    })
                }
            };
            self.needs_execution_for_patches = false;
            self.last_exec = start.elapsed();
            if outcome != RunOutcome::Overflow {
                return Ok(outcome);
            }
            log::debug!("vm-{}: trace buffer overflow", self.id);
        }
        Ok(RunOutcome::Overflow)
    }

    /// Run once normally, then once with compare logging enabled.
    pub fn execute_in_redqueen_mode(&mut self) -> Result<(), ChannelError> {
        log::debug!("vm-{}: performing regular iteration", self.id);
        self.soft_reload()?;
        self.send_payload(true)?;
        self.soft_reload()?;
        self.request(Command::DisableTraceMode)?;

        log::debug!("vm-{}: enabling redqueen mode", self.id);
        self.request(Command::SetLightInstrumentation)?;
        self.request(Command::EnableRqiMode)?;
        self.send_payload(true)?;

        log::debug!("vm-{}: disabling redqueen mode", self.id);
        self.request(Command::DisableRqiMode)?;
        self.send_payload(true)?;
        self.soft_reload()
    }

    /// Reload the blacklist file, hooks at listed addresses are dropped.
    pub fn update_blacklist(&mut self) -> Result<(), ChannelError> {
        self.request(Command::SetBlacklist)
    }

    pub fn enable_sampling_mode(&mut self) -> Result<(), ChannelError> {
        self.send(Command::EnableSampling)
    }

    pub fn disable_sampling_mode(&mut self) -> Result<(), ChannelError> {
        self.send(Command::DisableSampling)
    }

    pub fn submit_sampling_run(&mut self) -> Result<(), ChannelError> {
        self.send(Command::CommitFilter)
    }

    pub fn set_payload(&mut self, payload: &[u8]) -> Result<(), ChannelError> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ChannelError::PayloadTooLarge(payload.len()));
        }
        self.regions.set_payload(payload);
        Ok(())
    }

    /// Same as [`set_payload`](Self::set_payload), stale bytes after the payload are zeroed.
    pub fn copy_master_payload(&mut self, payload: &[u8]) -> Result<(), ChannelError> {
        self.set_payload(payload)?;
        let region = self.regions.payload.as_mut_slice();
        region[4 + payload.len()..4 + MAX_PAYLOAD_SIZE]
            .iter_mut()
            .for_each(|b| *b = 0);
        Ok(())
    }

    pub fn modify_payload_size(&mut self, size: usize) {
        self.regions.set_payload_size(size.min(MAX_PAYLOAD_SIZE));
    }

    /// Copy the bitmap to `dst` if the scheduler needs to see it. Faulting runs are
    /// always reported, others only if no worker reported the same bitmap before, or
    /// if the hash differs from `effector_hash`.
    pub fn copy_bitmap(&self, dst: &mut [u8], effector_hash: Option<u64>) -> bool {
        let bitmap = self.bitmap();
        if self.state.any() {
            dst.copy_from_slice(bitmap);
            return true;
        }
        let hash = bitmap::hash(bitmap);
        if let Some(h) = effector_hash {
            if h != hash {
                dst.copy_from_slice(bitmap);
                return true;
            }
        }
        if self.lookup.contains(hash) {
            return false;
        }
        dst.copy_from_slice(bitmap);
        self.lookup.insert(hash);
        true
    }

    /// Replay until two consecutive bitmaps agree, at most `runs` rounds. Fault flags of
    /// all replays are accumulated.
    pub fn verify_input(&mut self, bitmap: &[u8], runs: usize, apply_patches: bool) -> Result<Vec<u8>, ChannelError> {
        let saved = self.state;
        let ret = self.verify_rounds(bitmap, runs, apply_patches);
        self.state.merge(saved);
        let ret = ret?;
        self.submit_sampling_run()?;
        self.disable_sampling_mode()?;
        Ok(ret)
    }

    fn verify_rounds(&mut self, bitmap: &[u8], runs: usize, apply_patches: bool) -> Result<Vec<u8>, ChannelError> {
        self.enable_sampling_mode()?;
        let mut first = bitmap.to_vec();
        let mut second = bitmap.to_vec();
        for i in 0..runs {
            if i != 0 {
                self.send_payload(apply_patches)?;
                first = self.bitmap().to_vec();
                if self.state.any() {
                    break;
                }
                self.submit_sampling_run()?;
            }
            self.send_payload(apply_patches)?;
            second = self.bitmap().to_vec();
            if self.state.any() {
                break;
            }
            self.submit_sampling_run()?;
            if first == second {
                break;
            }
        }
        Ok(second)
    }
}

impl TrimTarget for VmChannel {
    type Error = ChannelError;

    fn run(&mut self) -> Result<Vec<u8>, ChannelError> {
        self.send_payload(true)?;
        Ok(self.bitmap().to_vec())
    }

    fn resize(&mut self, size: usize) -> Result<(), ChannelError> {
        self.modify_payload_size(size);
        Ok(())
    }

    fn faulted(&self) -> bool {
        self.state.any()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::{self, JoinHandle};

    const BITMAP_SIZE: usize = 256;

    fn vm_expect(s: &mut UnixStream, b: u8) {
        let mut buf = [0; 1];
        s.read_exact(&mut buf).unwrap();
        assert_eq!(buf[0] as char, b as char);
    }

    fn vm_send(s: &mut UnixStream, bytes: &[u8]) {
        s.write_all(bytes).unwrap();
    }

    /// Fake VM side: initial handshake followed by `script`.
    fn boot<F>(script: F) -> (VmChannel, JoinHandle<()>)
    where
        F: FnOnce(&mut UnixStream) + Send + 'static,
    {
        let (host, mut vm) = UnixStream::pair().unwrap();
        let handle = thread::spawn(move || {
            vm_send(&mut vm, b"D");
            vm_expect(&mut vm, b'D');
            vm_send(&mut vm, b"R");
            // initial run
            vm_expect(&mut vm, b'D');
            vm_send(&mut vm, b"R");
            script(&mut vm);
        });
        let config = ChannelConfig {
            id: 0,
            control: PathBuf::new(),
            timeout_tick_factor: 10.0,
        };
        let mut ch = VmChannel::new(&config, host, VmRegions::in_memory(BITMAP_SIZE), LookupSet::new());
        ch.set_init_state(b"agent", Some(b"init")).unwrap();
        (ch, handle)
    }

    #[test]
    fn normal_and_faults() {
        let (mut ch, vm) = boot(|vm| {
            vm_expect(vm, b'D');
            vm_send(vm, b"R");
            vm_expect(vm, b'D');
            vm_send(vm, b"CR");
            vm_expect(vm, b'D');
            vm_send(vm, b"KR");
            vm_expect(vm, b'D');
            vm_send(vm, b"t");
            vm_expect(vm, b'D');
            vm_send(vm, b"R");
        });
        assert_eq!(ch.payload(), b"init");
        assert_eq!(ch.send_payload(false).unwrap(), RunOutcome::Normal);
        assert_eq!(ch.send_payload(false).unwrap(), RunOutcome::Crash);
        assert!(ch.state().crashed);
        assert_eq!(ch.send_payload(false).unwrap(), RunOutcome::Kasan);
        assert!(!ch.state().crashed);
        assert_eq!(ch.send_payload(false).unwrap(), RunOutcome::Timeout);
        assert_eq!(ch.vm_state(), VmState::Timeout);
        assert_eq!(ch.send_payload(false).unwrap(), RunOutcome::Normal);
        assert!(!ch.state().any());
        vm.join().unwrap();
    }

    #[test]
    fn overflow_retry() {
        let (mut ch, vm) = boot(|vm| {
            vm_expect(vm, b'D');
            vm_send(vm, b"]");
            vm_expect(vm, b'D');
            vm_send(vm, b"R");
            vm_expect(vm, b'D');
            vm_send(vm, b"[");
            vm_expect(vm, b'D');
            vm_send(vm, b"{");
        });
        assert_eq!(ch.send_payload(false).unwrap(), RunOutcome::Normal);
        assert_eq!(ch.send_payload(false).unwrap(), RunOutcome::Overflow);
        assert_eq!(ch.overflow_count(), 3);
        vm.join().unwrap();
    }

    #[test]
    fn patches_toggle_once() {
        let (mut ch, vm) = boot(|vm| {
            vm_expect(vm, b'P');
            vm_send(vm, b"P");
            vm_expect(vm, b'D');
            vm_send(vm, b"R");
            vm_expect(vm, b'D');
            vm_send(vm, b"R");
            vm_expect(vm, b'Q');
            vm_send(vm, b"Q");
            vm_expect(vm, b'D');
            vm_send(vm, b"R");
        });
        ch.send_payload(true).unwrap();
        ch.send_payload(true).unwrap();
        ch.send_payload(false).unwrap();
        vm.join().unwrap();
    }

    #[test]
    fn patch_toggle_needs_execution() {
        let (mut ch, vm) = boot(|vm| {
            vm_expect(vm, b'P');
            vm_send(vm, b"P");
        });
        ch.set_patches(true).unwrap();
        assert!(matches!(ch.set_patches(false), Err(ChannelError::PatchToggle)));
        // same state again is not a toggle
        ch.set_patches(true).unwrap();
        vm.join().unwrap();
    }

    #[test]
    fn blacklist_reload_echoes() {
        let (mut ch, vm) = boot(|vm| {
            vm_expect(vm, b'Y');
            vm_send(vm, b"Y");
            vm_expect(vm, b'Y');
            vm_send(vm, b"R");
        });
        ch.update_blacklist().unwrap();
        assert!(matches!(ch.update_blacklist(), Err(ChannelError::Protocol { .. })));
        vm.join().unwrap();
    }

    #[test]
    fn printf_is_skipped() {
        let (mut ch, vm) = boot(|vm| {
            vm_expect(vm, b'D');
            vm_send(vm, b"XXR");
        });
        assert_eq!(ch.send_payload(false).unwrap(), RunOutcome::Normal);
        vm.join().unwrap();
    }

    #[test]
    fn desync_is_fatal() {
        let (mut ch, vm) = boot(|vm| {
            vm_expect(vm, b'D');
            vm_send(vm, b"Z");
        });
        assert!(matches!(ch.send_payload(false), Err(ChannelError::Protocol { .. })));
        assert_eq!(ch.vm_state(), VmState::Dead);
        vm.join().unwrap();
    }

    #[test]
    fn abort_is_fatal() {
        let (mut ch, vm) = boot(|vm| {
            vm_expect(vm, b'D');
            vm_send(vm, b"H");
        });
        assert!(matches!(ch.send_payload(false), Err(ChannelError::Abort)));
        assert!(!ch.vm_state().can_run());
        vm.join().unwrap();
    }

    #[test]
    fn handshake_desync() {
        let (host, mut vm) = UnixStream::pair().unwrap();
        let handle = thread::spawn(move || vm_send(&mut vm, b"R"));
        let config = ChannelConfig {
            id: 1,
            control: PathBuf::new(),
            timeout_tick_factor: 10.0,
        };
        let mut ch = VmChannel::new(&config, host, VmRegions::in_memory(BITMAP_SIZE), LookupSet::new());
        assert!(ch.set_init_state(b"agent", None).is_err());
        handle.join().unwrap();
    }

    #[test]
    fn verify_accumulates_flags() {
        let (mut ch, vm) = boot(|vm| {
            vm_expect(vm, b'S');
            vm_expect(vm, b'D');
            vm_send(vm, b"CR");
            vm_expect(vm, b'T');
            vm_expect(vm, b'O');
        });
        let bitmap = ch.bitmap().to_vec();
        ch.verify_input(&bitmap, 3, false).unwrap();
        assert!(ch.state().crashed);
        vm.join().unwrap();
    }

    #[test]
    fn bitmap_lookup() {
        let (mut ch, vm) = boot(|_| ());
        let mut dst = vec![0; BITMAP_SIZE];
        assert!(ch.copy_bitmap(&mut dst, None));
        assert!(!ch.copy_bitmap(&mut dst, None));
        // a different effector hash forces the copy
        assert!(ch.copy_bitmap(&mut dst, Some(0)));
        ch.state.timeout = true;
        assert!(ch.copy_bitmap(&mut dst, None));
        vm.join().unwrap();
    }

    #[test]
    fn random_bitmaps_reported_once() {
        use rand::{prelude::SmallRng, Rng, SeedableRng};

        let mut rng = SmallRng::seed_from_u64(0x6c6f6f6b);
        let pool: Vec<Vec<u8>> = (0..8)
            .map(|_| (0..BITMAP_SIZE).map(|_| rng.gen()).collect())
            .collect();
        let (mut ch, vm) = boot(|_| ());
        let mut seen = vec![false; pool.len()];
        let mut dst = vec![0; BITMAP_SIZE];
        for _ in 0..64 {
            let i = rng.gen_range(0..pool.len());
            ch.regions.bitmap.as_mut_slice().copy_from_slice(&pool[i]);
            dst.iter_mut().for_each(|b| *b = 0);
            let copied = ch.copy_bitmap(&mut dst, None);
            assert_eq!(copied, !seen[i]);
            if copied {
                assert_eq!(dst, pool[i]);
            }
            seen[i] = true;
        }
        vm.join().unwrap();
    }

    #[test]
    fn tick_threshold() {
        let (mut ch, vm) = boot(|_| ());
        ch.set_tick_timeout_threshold(0.0);
        assert_eq!(ch.tick_timeout_threshold(), 1.0);
        ch.set_tick_timeout_threshold(2.0);
        assert_eq!(ch.tick_timeout_threshold(), 60.0);
        vm.join().unwrap();
    }
}
