//! Worker threads, each one owns a QEMU-PT instance and executes what the master
//! hands out.
use crate::{
    config::Config,
    fuzzer_log::set_worker_id,
    message::{self, FuzzingResult, MapserverMsg, MasterMsg, QueueError, WorkerMsg, WorkerReply},
    stats::Stats,
    transfer::{Comm, TransferSlot},
    util::{retry_exec, stop_soon},
};
use anyhow::Context;
use ptfuzz_core::{bitmap, method::FuzzMethod, trim::perform_trim};
use ptfuzz_vm::{KaflDevice, QemuHandle};
use qemu_pt::{
    hash_fix::HashFixer,
    redqueen::{RedqueenState, RedqueenWorkdir},
    shm, ChannelConfig, ChannelError, LookupSet, VmChannel, VmRegions,
};
use sha1::{Digest, Sha1};
use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
    sync::{
        mpsc::{Receiver, Sender},
        Arc, PoisonError,
    },
    time::Instant,
};

/// Runs per sampling round.
pub const SAMPLING_RUNS: usize = 5;
/// Sampling ends after this many rounds without filter changes.
const SAMPLING_STABLE_ROUNDS: usize = 5;
/// Faulting sampling runs tolerated before a round is cut short.
const SAMPLING_MAX_ERRORS: usize = 2;
const FILTER_FILES: [&str; 2] = ["/dev/shm/kafl_filter0", "/dev/shm/kafl_tfilter"];

/// Everything a worker thread needs, moved into the thread.
pub struct WorkerContext {
    pub id: usize,
    pub agent: Arc<Vec<u8>>,
    pub comm: Arc<Comm>,
    pub stats: Arc<Stats>,
    pub lookup: LookupSet,
    pub redqueen: RedqueenState,
    pub rx: Receiver<WorkerMsg>,
    pub master: Sender<MasterMsg>,
    pub replies: Sender<(usize, WorkerReply)>,
    pub mapserver: Sender<MapserverMsg>,
}

pub struct Worker {
    id: usize,
    agent: Arc<Vec<u8>>,
    comm: Arc<Comm>,
    stats: Arc<Stats>,
    redqueen: RedqueenState,
    qemu: QemuHandle,
    ch: VmChannel,
    rx: Receiver<WorkerMsg>,
    master: Sender<MasterMsg>,
    replies: Sender<(usize, WorkerReply)>,
    mapserver: Sender<MapserverMsg>,
}

/// Entry of a worker thread.
pub fn run_worker(config: &Config, ctx: WorkerContext) -> anyhow::Result<()> {
    set_worker_id(ctx.id);
    let id = ctx.id;
    let master = ctx.master.clone();
    let mut worker = match Worker::boot(config, ctx) {
        Ok(w) => w,
        Err(e) => {
            let _ = master.send(MasterMsg::AbortReq(id));
            return Err(e.context(format!("worker-{}: failed to boot vm", id)));
        }
    };
    worker.run()
}

fn shm_path(os_id: &str) -> PathBuf {
    Path::new("/dev/shm").join(os_id.trim_start_matches('/'))
}

/// Send to a peer, a vanished peer is only an error if no stop was requested.
fn send<T>(tx: &Sender<T>, msg: T) -> anyhow::Result<()> {
    if tx.send(msg).is_err() && !stop_soon() {
        anyhow::bail!("peer disconnected");
    }
    Ok(())
}

impl Worker {
    /// Spawn the vm and finish the initial handshake.
    pub fn boot(config: &Config, ctx: WorkerContext) -> anyhow::Result<Self> {
        let id = ctx.id;
        let workdir = RedqueenWorkdir::new(id);
        workdir
            .init_dir()
            .with_context(|| format!("failed to create {}", workdir.base().display()))?;
        ctx.redqueen
            .persist(&workdir)
            .context("failed to write redqueen files")?;
        let dev = KaflDevice {
            id,
            control: shm::control_path(&config.work_dir, id),
            binary_shm: shm_path(&shm::binary_shm_id(id)),
            payload_shm: shm_path(&shm::payload_shm_id(id)),
            bitmap_shm: shm_path(&shm::bitmap_shm_id(id)),
            redqueen_workdir: workdir.base().to_path_buf(),
        };
        let ch_conf = ChannelConfig {
            id,
            control: dev.control.clone(),
            timeout_tick_factor: config.timeout_tick_factor,
        };
        let bitmap_size = config.qemu_config.bitmap_size;

        let (qemu, mut ch) = retry_exec(|| -> anyhow::Result<(QemuHandle, VmChannel)> {
            let _guard = ctx.comm.boot_lock.lock().unwrap_or_else(PoisonError::into_inner);
            let regions = VmRegions::create(id, bitmap_size)?;
            let mut qemu = QemuHandle::with_config(config.qemu_config.clone(), dev.clone());
            qemu.boot()?;
            let started = VmChannel::start(&ch_conf, regions, ctx.lookup.clone(), &ctx.agent, None)
                .and_then(|mut ch| ch.update_blacklist().map(|_| ch));
            match started {
                Ok(ch) => Ok((qemu, ch)),
                Err(e) => {
                    let (_, stderr) = qemu.take_output();
                    worker_warn!("vm stderr:\n{}", String::from_utf8_lossy(&stderr));
                    Err(e.into())
                }
            }
        })?;
        ch.set_workdir(workdir);
        worker_info!("vm ready, pid: {:?}", qemu.pid());
        ctx.stats.inc_workers_ready();

        Ok(Self {
            id,
            agent: ctx.agent,
            comm: ctx.comm,
            stats: ctx.stats,
            redqueen: ctx.redqueen,
            qemu,
            ch,
            rx: ctx.rx,
            master: ctx.master,
            replies: ctx.replies,
            mapserver: ctx.mapserver,
        })
    }

    pub fn run(&mut self) -> anyhow::Result<()> {
        send(&self.master, MasterMsg::Start(self.id))?;
        send(&self.master, MasterMsg::Req(self.id))?;

        loop {
            let msg = match message::recv(&self.rx) {
                Ok(WorkerMsg::Shutdown) | Err(QueueError::Stopped) | Err(QueueError::Disconnected) => break,
                Ok(m) => m,
            };
            if let Err(e) = self.handle(msg) {
                let _ = self.master.send(MasterMsg::AbortReq(self.id));
                return Err(e.context(format!("worker-{} gave up", self.id)));
            }
            if stop_soon() {
                break;
            }
        }
        worker_info!("exiting, trace overflows: {}", self.ch.overflow_count());
        Ok(())
    }

    fn handle(&mut self, msg: WorkerMsg) -> anyhow::Result<()> {
        match msg {
            WorkerMsg::Job { methods, affected } => {
                self.handle_job(methods, affected)?;
                send(&self.master, MasterMsg::Req(self.id))
            }
            WorkerMsg::ReqVerify { method, hash_addrs } => {
                self.handle_verify(method, hash_addrs)?;
                send(&self.master, MasterMsg::Req(self.id))
            }
            WorkerMsg::ReqBitmap(payload) => {
                let bitmap = self.exec_retry(|w| {
                    w.ch.set_payload(&payload)?;
                    w.ch.send_payload(true)?;
                    Ok(w.ch.bitmap().to_vec())
                })?;
                send(&self.replies, (self.id, WorkerReply::Bitmap(bitmap)))
            }
            WorkerMsg::ReqBitmapHash(payload) => {
                let hash = self.exec_retry(|w| {
                    w.ch.set_payload(&payload)?;
                    w.ch.send_payload(true)?;
                    Ok(bitmap::hash(w.ch.bitmap()))
                })?;
                send(&self.replies, (self.id, WorkerReply::BitmapHash(Some(hash))))
            }
            WorkerMsg::ReqSampling { payload, runs } => {
                let bitmap = self.handle_sampling(&payload, runs)?;
                send(&self.replies, (self.id, WorkerReply::Sampling(bitmap)))
            }
            WorkerMsg::ReqBenchmark { payload, runs } => {
                self.handle_benchmark(&payload, runs)?;
                send(&self.replies, (self.id, WorkerReply::Benchmark))
            }
            WorkerMsg::ReqRedqueen(payload) => {
                let ret = self
                    .ch
                    .set_payload(&payload)
                    .and_then(|_| self.ch.execute_in_redqueen_mode());
                let ok = ret.is_ok();
                if let Err(e) = ret {
                    worker_warn!("redqueen run failed: {}", e);
                    self.respawn()?;
                }
                send(&self.replies, (self.id, WorkerReply::Redqueen(ok)))
            }
            WorkerMsg::ReqPing => send(&self.master, MasterMsg::Ping(self.id)),
            WorkerMsg::UpdateRedqueen => {
                if let Err(e) = self.redqueen.persist(self.ch.workdir()) {
                    worker_warn!("failed to write redqueen files: {}", e);
                }
                self.exec_retry(|w| {
                    w.ch.update_blacklist()?;
                    w.ch.send_payload(false)?;
                    w.ch.send_payload(true)?;
                    Ok(())
                })?;
                send(&self.master, MasterMsg::UpdateRedqueen(self.id))
            }
            WorkerMsg::Shutdown => Ok(()),
        }
    }

    /// Reboot the vm, keeping the shared regions.
    fn respawn(&mut self) -> anyhow::Result<()> {
        self.stats.inc_vm_restarts();
        let comm = Arc::clone(&self.comm);
        let agent = Arc::clone(&self.agent);
        if let Err(e) = self.redqueen.persist(self.ch.workdir()) {
            worker_warn!("failed to write redqueen files: {}", e);
        }
        let qemu = &mut self.qemu;
        let ch = &mut self.ch;
        retry_exec(|| -> anyhow::Result<()> {
            let _guard = comm.boot_lock.lock().unwrap_or_else(PoisonError::into_inner);
            qemu.boot()?;
            if let Err(e) = ch.restart(&agent, None).and_then(|_| ch.update_blacklist()) {
                let (_, stderr) = qemu.take_output();
                worker_warn!("vm stderr:\n{}", String::from_utf8_lossy(&stderr));
                return Err(e.into());
            }
            Ok(())
        })
        .context("failed to respawn vm")?;
        worker_info!("vm respawned, pid: {:?}", self.qemu.pid());
        Ok(())
    }

    /// Run `f`, on a channel error respawn the vm and try once more.
    fn exec_retry<T>(&mut self, mut f: impl FnMut(&mut Self) -> Result<T, ChannelError>) -> anyhow::Result<T> {
        match f(self) {
            Ok(v) => return Ok(v),
            Err(e) => worker_warn!("{}, respawning vm", e),
        }
        self.respawn()?;
        Ok(f(self)?)
    }

    fn handle_job(&mut self, methods: Vec<FuzzMethod>, affected: Vec<Vec<usize>>) -> anyhow::Result<()> {
        let comm = Arc::clone(&self.comm);
        let slot = comm.slot(self.id);
        if !slot.lock_a.acquire() {
            return Ok(());
        }
        let eff_hash = comm.effector_hash();

        let mut results = Vec::with_capacity(methods.len());
        let mut failed = None;
        for (i, (method, affected)) in methods.into_iter().zip(affected).enumerate() {
            if failed.is_some() || comm.stage_aborted() {
                results.push(FuzzingResult::aborted(i, self.id, affected, method));
                continue;
            }
            let task = slot.task(i);
            match self.run_task(slot, i, &task, eff_hash) {
                Ok((performance, new_bits)) => {
                    let state = self.ch.state();
                    results.push(FuzzingResult {
                        slot: i,
                        crash: state.crashed,
                        timeout: state.timeout,
                        kasan: state.kasan,
                        affected_bytes: affected,
                        worker_id: self.id,
                        performance,
                        method,
                        bitmap_hash: Some(bitmap::hash(self.ch.bitmap())),
                        reloaded: state.any(),
                        new_bits,
                    });
                }
                Err(e) => {
                    failed = Some(e);
                    results.push(FuzzingResult::aborted(i, self.id, affected, method));
                }
            }
        }

        slot.lock_b.release();
        send(
            &self.mapserver,
            MapserverMsg::Result {
                source: self.id,
                results,
            },
        )?;
        if let Some(e) = failed {
            worker_warn!("job aborted: {}", e);
            self.respawn()?;
        }
        Ok(())
    }

    /// Execute one job entry, returns run time and whether the slot was filled.
    fn run_task(
        &mut self,
        slot: &TransferSlot,
        i: usize,
        task: &[u8],
        eff_hash: Option<u64>,
    ) -> Result<(f64, bool), ChannelError> {
        self.ch.copy_master_payload(task)?;
        let start = Instant::now();
        self.ch.send_payload(true)?;
        let performance = start.elapsed().as_secs_f64();
        self.stats.add_execs(1);

        let new_bits = self.ch.copy_bitmap(&mut slot.bitmaps()[i], eff_hash);
        if new_bits {
            slot.put_payload(i, self.ch.payload());
        }
        Ok((performance, new_bits))
    }

    /// Trim and possibly repair a preliminary input, then report it without patches.
    fn handle_verify(&mut self, method: FuzzMethod, hash_addrs: BTreeSet<u64>) -> anyhow::Result<()> {
        let comm = Arc::clone(&self.comm);
        let slot = comm.slot(self.id);
        if !slot.lock_a.acquire() {
            return Ok(());
        }
        let task = slot.task(0);
        let ret = self.verify(slot, &task, &hash_addrs);
        let result = match &ret {
            Ok((performance, new_bits)) => {
                let state = self.ch.state();
                FuzzingResult {
                    slot: 0,
                    crash: state.crashed,
                    timeout: state.timeout,
                    kasan: state.kasan,
                    affected_bytes: Vec::new(),
                    worker_id: self.id,
                    performance: *performance,
                    method,
                    bitmap_hash: Some(bitmap::hash(self.ch.bitmap())),
                    reloaded: state.any(),
                    new_bits: *new_bits,
                }
            }
            Err(_) => FuzzingResult::aborted(0, self.id, Vec::new(), method),
        };
        slot.lock_b.release();
        send(
            &self.mapserver,
            MapserverMsg::Result {
                source: self.id,
                results: vec![result],
            },
        )?;
        if let Err(e) = ret {
            worker_warn!("verification failed: {}", e);
            self.respawn()?;
        }
        Ok(())
    }

    fn verify(
        &mut self,
        slot: &TransferSlot,
        task: &[u8],
        hash_addrs: &BTreeSet<u64>,
    ) -> Result<(f64, bool), ChannelError> {
        self.ch.copy_master_payload(task)?;
        let len = perform_trim(task.len(), &mut self.ch)?;
        if len != task.len() {
            worker_debug!("trim: {}/{}", len, task.len());
        }

        if !hash_addrs.is_empty() {
            let trimmed = self.ch.payload().to_vec();
            worker_debug!("fixing payload of {} bytes, {} candidates", len, hash_addrs.len());
            let fixed = HashFixer::new(&mut self.ch, &self.redqueen).try_fix_data(&trimmed)?;
            match fixed {
                Some(data) => self.ch.set_payload(&data)?,
                None => self.ch.set_payload(&trimmed)?,
            }
        }

        let start = Instant::now();
        self.ch.send_payload(false)?;
        let performance = start.elapsed().as_secs_f64();
        self.stats.add_execs(1);

        let new_bits = self.ch.copy_bitmap(&mut slot.bitmaps()[0], None);
        if new_bits {
            slot.put_payload(0, self.ch.payload());
        }
        Ok((performance, new_bits))
    }

    fn handle_benchmark(&mut self, payload: &[u8], runs: usize) -> anyhow::Result<()> {
        for _ in 0..runs {
            let ret = self.ch.set_payload(payload).and_then(|_| self.ch.send_payload(true));
            self.stats.add_execs(1);
            match ret {
                Ok(outcome) if outcome.is_fault() => self.respawn()?,
                Ok(_) => (),
                Err(e) => {
                    worker_warn!("benchmark run failed: {}", e);
                    self.respawn()?;
                }
            }
            if stop_soon() {
                break;
            }
        }
        Ok(())
    }

    /// Measure cpu ticks of normal runs until the trace filters stop changing, then
    /// derive the tick timeout threshold from them.
    fn handle_sampling(&mut self, payload: &[u8], runs: usize) -> anyhow::Result<Vec<u8>> {
        let runs = if runs == 0 { SAMPLING_RUNS } else { runs };
        let mut ticks = 0u64;
        let mut count = 0u64;
        let mut errors = 0;
        let mut stable = 0;
        let mut filter = filter_hash(&FILTER_FILES);
        let mut bitmap = Vec::new();

        self.exec_retry(|w| w.ch.set_payload(payload))?;
        while !stop_soon() {
            bitmap = self.exec_retry(|w| {
                w.ch.set_payload(payload)?;
                w.ch.enable_sampling_mode()?;
                w.ch.send_payload(true)?;
                Ok(w.ch.bitmap().to_vec())
            })?;

            for _ in 0..runs {
                if errors >= SAMPLING_MAX_ERRORS {
                    worker_info!("sampling aborted after {} errors", errors);
                    break;
                }
                let before = self.qemu.cpu_ticks();
                match self.ch.send_payload(true) {
                    Ok(outcome) if outcome.is_fault() => {
                        worker_debug!("sampling run faulted: {:?}", outcome);
                        errors += 1;
                        self.respawn()?;
                    }
                    Ok(_) => {
                        self.ch.submit_sampling_run()?;
                        count += 1;
                        if let (Some(a), Some(b)) = (before, self.qemu.cpu_ticks()) {
                            ticks += b.saturating_sub(a);
                        }
                    }
                    Err(e) => {
                        worker_warn!("sampling run failed: {}", e);
                        self.respawn()?;
                    }
                }
            }
            self.exec_retry(|w| w.ch.disable_sampling_mode())?;

            let h = filter_hash(&FILTER_FILES);
            if h == filter {
                stable += 1;
            } else {
                stable = 0;
            }
            filter = h;
            if stable == SAMPLING_STABLE_ROUNDS {
                break;
            }
        }

        let avg = ticks as f64 / count.max(1) as f64;
        worker_info!("sampling done, ticks: {}, runs: {}, avg: {:.2}", ticks, count, avg);
        self.ch.set_tick_timeout_threshold(avg);
        Ok(bitmap)
    }
}

/// Digest of the trace filter files, missing files count as empty.
fn filter_hash<P: AsRef<Path>>(files: &[P]) -> String {
    let mut h = Sha1::new();
    for f in files {
        let content = fs::read(f.as_ref()).unwrap_or_default();
        h.update(&content);
    }
    hex::encode(h.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_hash_tracks_content() {
        let dir = std::env::temp_dir().join(format!("ptfuzz-filter-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let a = dir.join("filter0");
        let b = dir.join("tfilter");
        let files = [a.clone(), b.clone()];

        let missing = filter_hash(&files);
        assert_eq!(missing, filter_hash(&files));

        fs::write(&a, b"\x01\x00").unwrap();
        let one = filter_hash(&files);
        assert_ne!(missing, one);
        assert_eq!(one, filter_hash(&files));

        fs::write(&b, b"\x02").unwrap();
        assert_ne!(one, filter_hash(&files));
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn shm_paths() {
        assert_eq!(
            shm_path(&shm::bitmap_shm_id(3)),
            PathBuf::from("/dev/shm/kafl_bitmap_3")
        );
    }
}
