//! The master drives the fuzzing stages of the current node and batches the
//! candidates for idle workers.
use crate::{
    config::Config,
    message::{recv, MapserverMsg, MapserverReply, MasterMsg, NextNode, QueueError, WorkerMsg, WorkerReply},
    radamsa::{self, RADAMSA_DIV},
    stats::{Performance, Stats},
    transfer::Comm,
    util::stop_soon,
    workdir::{read_seeds, WorkDir},
    worker::SAMPLING_RUNS,
};
use anyhow::Context;
use ptfuzz_core::{
    bitmap,
    colorize::{colorize_payload, COLORIZATION_COUNT},
    corpus::NodeKind,
    method::{FuzzMethod, MethodKind},
    mutation::{
        arith::{self, ARITH_WIDTHS},
        bitflip::{self, FlipWidth},
        dict::{DictBruteforce, Dictionary, DICT_BF_MAX_LEN},
        effector::{self, EFFECTOR_MIN_LEN},
        havoc::{self, HavocContext},
        interesting::{self, INTEREST_WIDTHS},
        DeterministicOpts,
    },
    redqueen::{fuzz_data, RedqueenInfo},
    RngType, MAX_PAYLOAD_SIZE,
};
use qemu_pt::redqueen::{RedqueenState, RedqueenWorkdir};
use rand::{seq::SliceRandom, Rng, SeedableRng};
use std::{
    collections::{BTreeSet, VecDeque},
    fs::{self, OpenOptions},
    io,
    mem,
    path::PathBuf,
    sync::{
        mpsc::{Receiver, RecvTimeoutError, Sender},
        Arc,
    },
    time::{Duration, Instant},
};

const HAVOC_ROUNDS: usize = 16;
const BENCHMARK_RUNS: usize = 3;
/// Seconds the benchmark of all workers should take.
const BENCHMARK_SECS: f64 = 5.0;
const REPLY_POLL: Duration = Duration::from_millis(200);
const FILTER_SIZE: u64 = 0x100_0000;

/// Endpoints of the master.
pub struct MasterContext {
    pub comm: Arc<Comm>,
    pub stats: Arc<Stats>,
    pub redqueen: RedqueenState,
    pub workdir: WorkDir,
    pub workers: Vec<Sender<WorkerMsg>>,
    pub rx: Receiver<MasterMsg>,
    pub replies: Receiver<(usize, WorkerReply)>,
    pub mapserver: Sender<MapserverMsg>,
    pub mapserver_rx: Receiver<MapserverReply>,
}

/// Zero the branch filters shared with the vms.
pub fn wipe_filters(bitmap_size: usize) -> io::Result<()> {
    for (path, size) in &[
        ("/dev/shm/kafl_filter0", bitmap_size as u64),
        ("/dev/shm/kafl_tfilter", FILTER_SIZE),
    ] {
        let f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        f.set_len(*size)?;
    }
    Ok(())
}

pub struct Master {
    config: Arc<Config>,
    comm: Arc<Comm>,
    stats: Arc<Stats>,
    redqueen: RedqueenState,
    workdir: WorkDir,
    workers: Vec<Sender<WorkerMsg>>,
    rx: Receiver<MasterMsg>,
    replies: Receiver<(usize, WorkerReply)>,
    mapserver: Sender<MapserverMsg>,
    mapserver_rx: Receiver<MapserverReply>,

    rng: RngType,
    dict: Dictionary,
    dict_bf: DictBruteforce,
    opts: DeterministicOpts,
    perf: Performance,
    /// Candidates dispatched since the last performance refresh.
    counter: u64,
    refresh_start: Instant,
    /// Candidates dispatched since the last sync with the mapserver.
    round_counter: u64,
    /// Candidates produced for the current node.
    total: u64,
    bench_start: Instant,
    bench_offset: u64,
    stage_abortion: bool,
    buffer: Vec<(Vec<u8>, FuzzMethod, Vec<usize>)>,
    dead: Vec<bool>,
    /// Worker messages received while waiting for something else.
    backlog: VecDeque<MasterMsg>,
    /// Error raised inside a mutation callback.
    fatal: Option<anyhow::Error>,
    payload: Vec<u8>,
    node: Option<NextNode>,
}

impl Master {
    pub fn new(config: Arc<Config>, ctx: MasterContext) -> anyhow::Result<Self> {
        let dict = match config.dict.as_ref() {
            Some(p) => {
                let content = fs::read_to_string(p).with_context(|| format!("failed to read dict {}", p.display()))?;
                Dictionary::parse(&content).with_context(|| format!("failed to parse dict {}", p.display()))?
            }
            None => Dictionary::default(),
        };
        let opts = DeterministicOpts {
            skip_zero: config.skip_zero,
            arith_max: config.arith_max,
        };
        let workers = ctx.workers.len();
        Ok(Self {
            config,
            comm: ctx.comm,
            stats: ctx.stats,
            redqueen: ctx.redqueen,
            workdir: ctx.workdir,
            workers: ctx.workers,
            rx: ctx.rx,
            replies: ctx.replies,
            mapserver: ctx.mapserver,
            mapserver_rx: ctx.mapserver_rx,
            rng: RngType::from_entropy(),
            dict,
            dict_bf: DictBruteforce::default(),
            opts,
            perf: Performance::default(),
            counter: 0,
            refresh_start: Instant::now(),
            round_counter: 0,
            total: 0,
            bench_start: Instant::now(),
            bench_offset: 0,
            stage_abortion: false,
            buffer: Vec::new(),
            dead: vec![false; workers],
            backlog: VecDeque::new(),
            fatal: None,
            payload: Vec::new(),
            node: None,
        })
    }

    pub fn run(mut self) -> anyhow::Result<()> {
        self.init().context("master failed to init")?;
        if !self.config.disable_sampling {
            self.benchmark().context("benchmark failed")?;
        }

        let mut unfinished = false;
        while !stop_soon() {
            self.stats.set_technique("PRE-SYNC");
            self.total = 0;
            self.toggle_preliminary(true)?;
            let mut data = self.payload.clone();
            let limiter = self.start_stages(&data);

            if !unfinished {
                if !self.config.disable_sampling && self.node_is_seed() {
                    self.sampling(&data)?;
                }
                if self.config.redqueen {
                    match self.coloring(&data)? {
                        Some(alternatives) => {
                            self.dict.clear_redqueen();
                            data = alternatives[0].clone();
                            self.redqueen_stage(&data, &alternatives)?;
                        }
                        None => log::info!("master: input is not stable, skip redqueen"),
                    }
                }
                self.deterministic(&mut data, &limiter)?;
            }
            self.finish_preliminary()?;

            let mut finds = self.untouched_nodes()?;
            self.dict_bruteforce(&data)?;
            let mut finished = false;
            let mut splicing = false;
            let mut repeat = false;
            for i in 0..HAVOC_ROUNDS {
                if stop_soon() {
                    break;
                }
                self.toggle_preliminary(true)?;
                self.havoc(&data, splicing, repeat)?;
                finished = true;
                self.finish_preliminary()?;
                let n = self.untouched_nodes()?;
                if n == finds || self.stage_abortion {
                    if i == 0 {
                        splicing = true;
                    } else {
                        break;
                    }
                } else {
                    log::debug!("master: havoc round {} found {} new nodes", i, n - finds.min(n));
                    finds = n;
                    repeat = true;
                }
            }
            unfinished = self.post_sync(finished)?;
        }
        Ok(())
    }

    fn node_is_seed(&self) -> bool {
        self.node.is_none()
    }

    /// Wait for every worker to come up, then hand the seeds with their bitmaps
    /// to the mapserver.
    fn init(&mut self) -> anyhow::Result<()> {
        self.stats.set_technique("INIT");
        let mut pending: BTreeSet<usize> = (0..self.workers.len()).collect();
        let mut deferred = Vec::new();
        while !pending.is_empty() {
            match self.next_master_msg()? {
                MasterMsg::Start(w) => {
                    pending.remove(&w);
                }
                MasterMsg::AbortReq(w) => {
                    pending.remove(&w);
                    self.mark_dead(w, false)?;
                }
                m => deferred.push(m),
            }
        }
        self.restore_backlog(deferred);
        let live = self.dead.iter().filter(|d| !**d).count();
        log::info!("master: {}/{} workers online", live, self.workers.len());

        let mut seeds = read_seeds(&self.config.seed_dir)?;
        if seeds.is_empty() {
            anyhow::bail!("no seeds in {}", self.config.seed_dir.display());
        }
        let mut init = Vec::with_capacity(seeds.len());
        for mut s in seeds.drain(..) {
            s.truncate(MAX_PAYLOAD_SIZE);
            let bitmap = self.request_bitmap(&s)?;
            init.push((s, bitmap));
        }
        self.payload = init[0].0.clone();
        self.send_mapserver(MapserverMsg::InitBitmap(init))
    }

    fn benchmark(&mut self) -> anyhow::Result<()> {
        self.stats.set_technique("BENCHMARKING");
        let payload = self.payload.clone();
        let start = Instant::now();
        self.deputy_request(WorkerMsg::ReqBenchmark {
            payload: payload.clone(),
            runs: BENCHMARK_RUNS,
        })?;
        let elapsed = start.elapsed().as_secs_f64().max(f64::EPSILON);
        let multiplier = ((BENCHMARK_SECS / elapsed) as usize).max(1);
        let runs = multiplier * BENCHMARK_RUNS;

        self.bench_start = Instant::now();
        self.bench_offset = self.round_counter;
        let targets = self.broadcast(|| WorkerMsg::ReqBenchmark {
            payload: payload.clone(),
            runs,
        })?;
        let replies = self.wait_replies(targets)?;
        self.round_counter += (replies.len() * runs) as u64;
        let rate = self.bench_rate();
        self.round_counter = 0;
        self.perf.update(rate);
        self.perf.update(rate);
        self.stats.set_performance(self.perf.get());
        log::info!("master: benchmark {:.0} execs/s", rate);
        Ok(())
    }

    /// Measure the tick threshold of the vms with the first input.
    fn sampling(&mut self, data: &[u8]) -> anyhow::Result<()> {
        self.stats.set_technique("PRE-SAMPLING");
        let max = (num_cpus::get() / 2).max(1);
        let mut targets = BTreeSet::new();
        for w in self.live_workers().into_iter().take(max) {
            if self.send_worker(
                w,
                WorkerMsg::ReqSampling {
                    payload: data.to_vec(),
                    runs: SAMPLING_RUNS,
                },
            )? {
                targets.insert(w);
            }
        }
        let replies = self.wait_replies(targets)?;
        log::info!("master: sampling done on {} workers", replies.len());
        Ok(())
    }

    /// Hash of a payload that is the same over three runs, after one warm-up run.
    fn robust_hash(&mut self, payload: &[u8]) -> anyhow::Result<Option<u64>> {
        self.bitmap_hash(payload)?;
        let hash = self.bitmap_hash(payload)?;
        if hash.is_none() {
            return Ok(None);
        }
        for _ in 0..2 {
            if self.bitmap_hash(payload)? != hash {
                return Ok(None);
            }
        }
        Ok(hash)
    }

    /// Colored copies of `data` followed by `data` itself, `None` if the input is unstable.
    fn coloring(&mut self, data: &[u8]) -> anyhow::Result<Option<Vec<Vec<u8>>>> {
        self.stats.set_technique("COLORING");
        let hash = match self.robust_hash(data)? {
            Some(h) => h,
            None => return Ok(None),
        };
        let mut rng = self.fork_rng();
        let mut alternatives = Vec::with_capacity(COLORIZATION_COUNT + 1);
        for _ in 0..COLORIZATION_COUNT {
            let mut colored = data.to_vec();
            let mut err = None;
            colorize_payload(&mut rng, &mut colored, hash, |d| {
                if err.is_some() {
                    return None;
                }
                match self.bitmap_hash(d) {
                    Ok(h) => h,
                    Err(e) => {
                        err = Some(e);
                        None
                    }
                }
            });
            if let Some(e) = err {
                return Err(e);
            }
            if self.bitmap_hash(&colored)? != Some(hash) {
                log::info!("master: colored input diverged, skip redqueen");
                return Ok(None);
            }
            alternatives.push(colored);
        }
        alternatives.push(data.to_vec());
        Ok(Some(alternatives))
    }

    fn redqueen_stage(&mut self, data: &[u8], alternatives: &[Vec<u8>]) -> anyhow::Result<()> {
        self.stats.set_technique("REDQUEEN");
        let mut info = RedqueenInfo::with_hammering(self.config.hammer_jmp_tables);
        let last = alternatives.len() - 1;
        for (i, alt) in alternatives.iter().enumerate() {
            let (w, reply) = self.deputy_request(WorkerMsg::ReqRedqueen(alt.clone()))?;
            if !matches!(reply, WorkerReply::Redqueen(true)) {
                log::warn!("master: redqueen run {} failed on worker-{}", i, w);
                continue;
            }
            self.sync_redqueen(0)?;
            match RedqueenWorkdir::new(w).read_redqueen() {
                Ok(text) => info.add_run(i, i != last, &text, alt),
                Err(e) => log::warn!("master: failed to read redqueen results of worker-{}: {}", w, e),
            }
        }

        let mutations = info.mutations();
        log::info!("master: {} redqueen candidates", mutations.len());
        for m in &mutations {
            let method = FuzzMethod {
                kind: MethodKind::Redqueen,
                redqueen_cmp: m.cmp_addrs(),
                input_byte: m.offsets(),
            };
            self.push(&fuzz_data(data, m), method, Vec::new());
        }
        if self.config.fix_hashes {
            for addr in info.hash_candidates() {
                if self.redqueen.add_candidate_hash_addr(addr) {
                    log::info!("master: hash candidate {:#x}", addr);
                }
            }
        }
        info.update_dict(&mut self.dict);
        self.flush()?;
        self.sync_redqueen(self.round_counter)?;
        self.update_redqueen()
    }

    fn deterministic(&mut self, data: &mut Vec<u8>, limiter: &[bool]) -> anyhow::Result<()> {
        let opts = self.opts;
        self.stats.set_technique("BITFLIP");
        for w in &[FlipWidth::Bit1, FlipWidth::Bit2, FlipWidth::Bit4] {
            bitflip::mutate(data, limiter, opts, *w, |d| self.push(d, w.method().into(), Vec::new()));
        }
        self.flush()?;

        let eff = if self.config.effector && data.len() > EFFECTOR_MIN_LEN {
            self.effector_map(data, limiter)?
        } else {
            limiter.to_vec()
        };
        log::debug!("master: effector density {:.2}", effector::density(&eff));

        for w in &[FlipWidth::Byte1, FlipWidth::Byte2, FlipWidth::Byte4] {
            bitflip::mutate(data, &eff, opts, *w, |d| self.push(d, w.method().into(), Vec::new()));
        }
        self.flush()?;

        self.stats.set_technique("ARITHMETIC");
        for w in ARITH_WIDTHS.iter() {
            arith::mutate(data, &eff, opts, *w, |d| self.push(d, w.method().into(), Vec::new()));
        }
        self.flush()?;

        self.stats.set_technique("INTERESTING");
        for w in INTEREST_WIDTHS.iter() {
            interesting::mutate(data, &eff, opts, *w, |d| self.push(d, w.method().into(), Vec::new()));
        }
        self.flush()
    }

    /// Walking byte flips of the unmodified payload, reported back as the bytes whose
    /// flip changed the path.
    fn effector_map(&mut self, data: &mut Vec<u8>, limiter: &[bool]) -> anyhow::Result<Vec<bool>> {
        self.stats.set_technique("EFFECTOR");
        let orig = self.payload.clone();
        let bitmap = self.request_bitmap(&orig)?;
        self.comm.enable_effector_mode(bitmap::hash(&bitmap));
        self.send_mapserver(MapserverMsg::ReqEffector(bitmap))?;
        bitflip::mutate_walking_byte(data, |i, d| self.push(d, MethodKind::Bitflip8.into(), vec![i]));
        let ret = self.flush().and_then(|_| {
            self.mapserver_call(MapserverMsg::GetEffector(self.round_counter), |r| match r {
                MapserverReply::Effector(m) => Some(m),
                _ => None,
            })
        });
        self.comm.disable_effector_mode();
        let mut raw = ret?;
        raw.resize(data.len(), false);
        Ok(effector::derive(&raw, limiter))
    }

    fn dict_bruteforce(&mut self, data: &[u8]) -> anyhow::Result<()> {
        if data.len() >= DICT_BF_MAX_LEN || self.dict.is_empty() {
            return Ok(());
        }
        self.stats.set_technique("DICT-BF");
        self.toggle_preliminary(true)?;
        let mut bf = mem::take(&mut self.dict_bf);
        let dict = mem::take(&mut self.dict);
        let n = bf.run(data, &dict, |d| self.push(d, MethodKind::DictBf.into(), Vec::new()));
        self.dict = dict;
        self.dict_bf = bf;
        log::debug!("master: {} dictionary candidates", n);
        self.flush()?;
        self.finish_preliminary()
    }

    fn havoc(&mut self, data: &[u8], splicing: bool, repeat: bool) -> anyhow::Result<()> {
        let favorite = matches!(self.node.as_ref().map(|n| n.kind), Some(NodeKind::Favorite));
        let factor = if repeat {
            4.0
        } else if favorite {
            2.0
        } else {
            1.0
        };
        let amount = havoc::havoc_range(self.perf.get() * self.config.havoc_multiplier * factor);
        let mut rng = self.fork_rng();
        let dict = mem::take(&mut self.dict);
        let ctx = HavocContext { dict: &dict };
        if splicing {
            self.stats.set_technique("SPLICING");
            let donors = self.donor_files();
            havoc::mutate_splicing(
                &mut rng,
                data,
                &ctx,
                amount,
                |r| donors.choose(r).and_then(|p| fs::read(p).ok()),
                |d| self.push(d, MethodKind::Splicing.into(), Vec::new()),
            );
        } else {
            self.stats.set_technique("HAVOC");
            havoc::mutate(&mut rng, data, &ctx, amount, |d| {
                self.push(d, MethodKind::Havoc.into(), Vec::new())
            });
        }
        self.dict = dict;
        self.flush()?;

        if self.config.radamsa {
            self.stats.set_technique("RADAMSA");
            let samples = radamsa::pick_samples(self.donor_files(), &mut rng);
            let path = self.config.radamsa_path.clone();
            let ret = radamsa::mutate(&path, &samples, data, amount / RADAMSA_DIV, |d| {
                self.push(d, MethodKind::Radamsa.into(), Vec::new())
            });
            if let Err(e) = ret {
                log::warn!("master: radamsa failed: {}", e);
            }
            self.flush()?;
        }
        Ok(())
    }

    fn donor_files(&self) -> Vec<PathBuf> {
        self.workdir.corpus_files().unwrap_or_else(|e| {
            log::warn!("master: failed to list corpus: {}", e);
            Vec::new()
        })
    }

    /// Leave preliminary mode, then re-run what it found and whatever was imported.
    fn finish_preliminary(&mut self) -> anyhow::Result<()> {
        let n = self.toggle_preliminary(false)?;
        if n != 0 {
            self.verification()?;
        }
        self.import()
    }

    fn verification(&mut self) -> anyhow::Result<()> {
        self.stats.set_technique("VERIFICATION");
        self.sync_verification()?;
        let files = self
            .workdir
            .preliminary_files()
            .context("failed to list preliminary payloads")?;
        log::debug!("master: verifying {} preliminary payloads", files.len());
        for (id, path) in files {
            match fs::read(&path) {
                Ok(payload) => {
                    let method = self.workdir.read_method(id, true);
                    self.dispatch_verify(payload, method)?;
                }
                Err(e) => log::warn!("master: failed to read {}: {}", path.display(), e),
            }
        }
        self.sync_verification()
    }

    fn import(&mut self) -> anyhow::Result<()> {
        let files = self.workdir.import_files().unwrap_or_default();
        if files.is_empty() {
            return Ok(());
        }
        self.stats.set_technique("IMPORT");
        self.sync_verification()?;
        for path in files {
            match fs::read(&path) {
                Ok(mut payload) => {
                    payload.truncate(MAX_PAYLOAD_SIZE);
                    self.dispatch_verify(payload, MethodKind::Import.into())?;
                    self.stats.inc_imports();
                }
                Err(e) => log::warn!("master: failed to import {}: {}", path.display(), e),
            }
            if let Err(e) = fs::remove_file(&path) {
                log::warn!("master: failed to remove {}: {}", path.display(), e);
            }
        }
        self.sync_verification()
    }

    /// Hand one payload to the next idle worker for trimming and a clean re-run.
    fn dispatch_verify(&mut self, payload: Vec<u8>, method: FuzzMethod) -> anyhow::Result<()> {
        loop {
            match self.next_master_msg()? {
                MasterMsg::Req(w) if !self.dead[w] => {
                    self.comm.slot(w).put_tasks(&[payload.clone()]);
                    let msg = WorkerMsg::ReqVerify {
                        method: method.clone(),
                        hash_addrs: self.redqueen.candidate_hash_addrs(),
                    };
                    if self.send_worker(w, msg)? {
                        self.round_counter += 1;
                        self.counter += 1;
                        return Ok(());
                    }
                }
                MasterMsg::AbortReq(w) => self.mark_dead(w, false)?,
                m => log::trace!("master: ignore {} from worker-{}", m.tag(), m.source()),
            }
        }
    }

    /// Report the end of the node to the mapserver and take the next one. Returns
    /// whether the new node was fuzzed before.
    fn post_sync(&mut self, finished: bool) -> anyhow::Result<bool> {
        self.stats.set_technique("POST-SYNC");
        let performance = self.bench_rate();
        let rounds = self.round_counter;
        let msg = if finished || self.stage_abortion {
            MapserverMsg::NxtFin { rounds, performance }
        } else {
            MapserverMsg::NxtUnfin { rounds, performance }
        };
        let (node, unfinished) = self.mapserver_call(msg, |r| match r {
            MapserverReply::Next { node, unfinished } => Some((node, unfinished)),
            _ => None,
        })?;
        log::debug!("master: {} candidates for the last node", self.total);
        log::debug!(
            "master: next node {} ({:?}, level {}, {} bytes)",
            node.id,
            node.kind,
            node.level,
            node.payload.len()
        );
        self.payload = node.payload.clone();
        self.node = Some(node);
        self.round_counter = 0;
        self.stage_abortion = false;
        self.comm.set_stage_abortion(false);
        Ok(unfinished)
    }

    /// Limiter for the deterministic stages, also starts the rate measurement of
    /// the node.
    fn start_stages(&mut self, data: &[u8]) -> Vec<bool> {
        self.bench_start = Instant::now();
        self.bench_offset = self.round_counter;
        effector::limiter_map(data.len(), &[])
    }

    fn bench_rate(&self) -> f64 {
        let elapsed = self.bench_start.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        self.round_counter.saturating_sub(self.bench_offset) as f64 / elapsed
    }

    fn fork_rng(&mut self) -> RngType {
        RngType::seed_from_u64(self.rng.gen())
    }

    /// Queue one candidate, dispatching a full batch to the next idle worker.
    fn push(&mut self, payload: &[u8], method: FuzzMethod, affected: Vec<usize>) {
        if self.stage_abortion || self.fatal.is_some() {
            return;
        }
        let mut p = payload.to_vec();
        p.truncate(MAX_PAYLOAD_SIZE);
        self.buffer.push((p, method, affected));
        self.total += 1;
        if self.buffer.len() >= self.comm.tasks_per_request {
            if let Err(e) = self.dispatch() {
                self.fatal = Some(e);
            }
        }
    }

    /// Dispatch what is left and surface errors raised while mutating.
    fn flush(&mut self) -> anyhow::Result<()> {
        if let Some(e) = self.fatal.take() {
            return Err(e);
        }
        if !self.buffer.is_empty() && !self.stage_abortion {
            self.dispatch()?;
        }
        Ok(())
    }

    fn dispatch(&mut self) -> anyhow::Result<()> {
        let batch = mem::take(&mut self.buffer);
        let n = batch.len() as u64;
        let mut payloads = Vec::with_capacity(batch.len());
        let mut methods = Vec::with_capacity(batch.len());
        let mut affected = Vec::with_capacity(batch.len());
        for (p, m, a) in batch {
            payloads.push(p);
            methods.push(m);
            affected.push(a);
        }
        loop {
            match self.next_master_msg()? {
                MasterMsg::Req(w) if !self.dead[w] => {
                    self.comm.slot(w).put_tasks(&payloads);
                    let job = WorkerMsg::Job {
                        methods: methods.clone(),
                        affected: affected.clone(),
                    };
                    if self.send_worker(w, job)? {
                        self.round_counter += n;
                        self.counter += n;
                        break;
                    }
                }
                MasterMsg::AbortReq(w) if !self.dead[w] => {
                    self.mark_dead(w, true)?;
                    return Ok(());
                }
                m => log::trace!("master: ignore {} from worker-{}", m.tag(), m.source()),
            }
        }
        self.refresh_performance();
        Ok(())
    }

    fn refresh_performance(&mut self) {
        let elapsed = self.refresh_start.elapsed();
        if elapsed >= Duration::from_secs(self.config.refresh_rate) {
            self.perf.update(self.counter as f64 / elapsed.as_secs_f64());
            self.stats.set_performance(self.perf.get());
            self.refresh_start = Instant::now();
            self.counter = 0;
        }
    }

    fn next_master_msg(&mut self) -> anyhow::Result<MasterMsg> {
        if let Some(m) = self.backlog.pop_front() {
            return Ok(m);
        }
        Ok(recv(&self.rx)?)
    }

    fn restore_backlog(&mut self, deferred: Vec<MasterMsg>) {
        for m in deferred.into_iter().rev() {
            self.backlog.push_front(m);
        }
    }

    fn mark_dead(&mut self, w: usize, abort_stage: bool) -> anyhow::Result<()> {
        if !self.dead[w] {
            log::warn!("master: worker-{} is gone", w);
            self.dead[w] = true;
            if abort_stage {
                self.stage_abortion = true;
                self.comm.set_stage_abortion(true);
                self.buffer.clear();
            }
        }
        if self.dead.iter().all(|d| *d) {
            anyhow::bail!("all workers are gone");
        }
        Ok(())
    }

    fn live_workers(&self) -> Vec<usize> {
        (0..self.workers.len()).filter(|w| !self.dead[*w]).collect()
    }

    /// First live worker, it serves single requests of the master.
    fn deputy(&self) -> anyhow::Result<usize> {
        self.dead
            .iter()
            .position(|d| !*d)
            .ok_or_else(|| anyhow::anyhow!("all workers are gone"))
    }

    fn send_worker(&mut self, w: usize, msg: WorkerMsg) -> anyhow::Result<bool> {
        if self.workers[w].send(msg).is_err() {
            self.mark_dead(w, false)?;
            return Ok(false);
        }
        Ok(true)
    }

    fn broadcast(&mut self, mut msg: impl FnMut() -> WorkerMsg) -> anyhow::Result<BTreeSet<usize>> {
        let mut sent = BTreeSet::new();
        for w in self.live_workers() {
            if self.send_worker(w, msg())? {
                sent.insert(w);
            }
        }
        Ok(sent)
    }

    /// Collect one reply from each of `pending`, workers giving up meanwhile are
    /// dropped from the set.
    fn wait_replies(&mut self, mut pending: BTreeSet<usize>) -> anyhow::Result<Vec<(usize, WorkerReply)>> {
        let mut out = Vec::with_capacity(pending.len());
        let mut aborted = Vec::new();
        self.backlog.retain(|m| match m {
            MasterMsg::AbortReq(w) if pending.contains(w) => {
                aborted.push(*w);
                false
            }
            _ => true,
        });
        for w in aborted {
            pending.remove(&w);
            self.mark_dead(w, false)?;
        }
        while !pending.is_empty() {
            match self.replies.recv_timeout(REPLY_POLL) {
                Ok((w, r)) => {
                    if pending.remove(&w) {
                        out.push((w, r));
                    } else {
                        log::warn!("master: stray {} from worker-{}", r.tag(), w);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if stop_soon() {
                        return Err(QueueError::Stopped.into());
                    }
                    while let Ok(m) = self.rx.try_recv() {
                        match m {
                            MasterMsg::AbortReq(w) => {
                                pending.remove(&w);
                                self.mark_dead(w, false)?;
                            }
                            m => self.backlog.push_back(m),
                        }
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return Err(QueueError::Disconnected.into()),
            }
        }
        Ok(out)
    }

    /// Run `msg` on the deputy, moving on to the next worker if it gives up.
    fn deputy_request(&mut self, msg: WorkerMsg) -> anyhow::Result<(usize, WorkerReply)> {
        loop {
            let w = self.deputy()?;
            if !self.send_worker(w, msg.clone())? {
                continue;
            }
            let mut pending = BTreeSet::new();
            pending.insert(w);
            if let Some(r) = self.wait_replies(pending)?.pop() {
                return Ok(r);
            }
        }
    }

    fn request_bitmap(&mut self, payload: &[u8]) -> anyhow::Result<Vec<u8>> {
        match self.deputy_request(WorkerMsg::ReqBitmap(payload.to_vec()))? {
            (_, WorkerReply::Bitmap(b)) => Ok(b),
            (w, r) => anyhow::bail!("unexpected {} from worker-{}", r.tag(), w),
        }
    }

    fn bitmap_hash(&mut self, payload: &[u8]) -> anyhow::Result<Option<u64>> {
        match self.deputy_request(WorkerMsg::ReqBitmapHash(payload.to_vec()))? {
            (_, WorkerReply::BitmapHash(h)) => Ok(h),
            (w, r) => anyhow::bail!("unexpected {} from worker-{}", r.tag(), w),
        }
    }

    /// Send `msg` to every live worker and wait until each acknowledged it.
    fn broadcast_ack(&mut self, msg: WorkerMsg, ack: fn(&MasterMsg) -> Option<usize>) -> anyhow::Result<()> {
        let mut pending = self.broadcast(|| msg.clone())?;
        let mut deferred = Vec::new();
        while !pending.is_empty() {
            let m = self.next_master_msg()?;
            if let Some(w) = ack(&m) {
                pending.remove(&w);
            } else if let MasterMsg::AbortReq(w) = m {
                pending.remove(&w);
                self.mark_dead(w, false)?;
            } else {
                deferred.push(m);
            }
        }
        self.restore_backlog(deferred);
        Ok(())
    }

    /// Returns once every job handed out so far was executed.
    fn sync_workers(&mut self) -> anyhow::Result<()> {
        self.broadcast_ack(WorkerMsg::ReqPing, |m| match m {
            MasterMsg::Ping(w) => Some(*w),
            _ => None,
        })
    }

    fn update_redqueen(&mut self) -> anyhow::Result<()> {
        self.broadcast_ack(WorkerMsg::UpdateRedqueen, |m| match m {
            MasterMsg::UpdateRedqueen(w) => Some(*w),
            _ => None,
        })
    }

    fn send_mapserver(&self, msg: MapserverMsg) -> anyhow::Result<()> {
        self.mapserver
            .send(msg)
            .map_err(|_| anyhow::anyhow!("mapserver is gone"))
    }

    fn mapserver_call<T>(&mut self, msg: MapserverMsg, mut pick: impl FnMut(MapserverReply) -> Option<T>) -> anyhow::Result<T> {
        let tag = msg.tag();
        self.send_mapserver(msg)?;
        loop {
            let r = recv(&self.mapserver_rx)?;
            let got = r.tag();
            match pick(r) {
                Some(v) => return Ok(v),
                None => log::warn!("master: unexpected {} from mapserver while waiting for {:?}", got, tag),
            }
        }
    }

    fn toggle_preliminary(&mut self, enable: bool) -> anyhow::Result<usize> {
        if !enable {
            self.sync_workers()?;
        }
        self.mapserver_call(MapserverMsg::ReqPreliminary(enable), |r| match r {
            MapserverReply::Preliminary(n) => Some(n),
            _ => None,
        })
    }

    fn sync_verification(&mut self) -> anyhow::Result<()> {
        let rounds = self.round_counter;
        self.mapserver_call(MapserverMsg::ReqVerifySync(rounds), |r| match r {
            MapserverReply::VerifySync => Some(()),
            _ => None,
        })
    }

    fn sync_redqueen(&mut self, rounds: u64) -> anyhow::Result<()> {
        self.mapserver_call(MapserverMsg::RedqueenSync(rounds), |r| match r {
            MapserverReply::RedqueenSync => Some(()),
            _ => None,
        })?;
        self.round_counter = 0;
        Ok(())
    }

    fn untouched_nodes(&mut self) -> anyhow::Result<usize> {
        let rounds = self.round_counter;
        self.mapserver_call(MapserverMsg::UntouchedNodes(rounds), |r| match r {
            MapserverReply::UntouchedNodes(n) => Some(n),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;

    struct Harness {
        master: Master,
        master_tx: Sender<MasterMsg>,
        worker_rx: Vec<Receiver<WorkerMsg>>,
        reply_tx: Sender<(usize, WorkerReply)>,
        _mapserver_rx: Receiver<MapserverMsg>,
        _mapserver_tx: Sender<MapserverReply>,
    }

    fn harness(workers: usize, tasks_per_request: usize) -> Harness {
        let config = Config {
            tasks_per_request,
            ..Default::default()
        };
        let (master_tx, rx) = channel();
        let (reply_tx, replies) = channel();
        let (mapserver, mapserver_rx) = channel();
        let (mapserver_tx, master_mapserver_rx) = channel();
        let mut senders = Vec::new();
        let mut worker_rx = Vec::new();
        for _ in 0..workers {
            let (tx, rx) = channel();
            senders.push(tx);
            worker_rx.push(rx);
        }
        let ctx = MasterContext {
            comm: Arc::new(Comm::new(workers, tasks_per_request, 64)),
            stats: Arc::new(Stats::new()),
            redqueen: RedqueenState::new(),
            workdir: WorkDir::new(std::env::temp_dir().join("ptfuzz-master-test")),
            workers: senders,
            rx,
            replies,
            mapserver,
            mapserver_rx: master_mapserver_rx,
        };
        Harness {
            master: Master::new(Arc::new(config), ctx).unwrap(),
            master_tx,
            worker_rx,
            reply_tx,
            _mapserver_rx: mapserver_rx,
            _mapserver_tx: mapserver_tx,
        }
    }

    #[test]
    fn batches_go_to_idle_workers() {
        let mut h = harness(2, 2);
        h.master_tx.send(MasterMsg::Req(1)).unwrap();
        h.master_tx.send(MasterMsg::Req(0)).unwrap();
        h.master.push(b"a", MethodKind::Havoc.into(), Vec::new());
        h.master.push(b"b", MethodKind::Havoc.into(), vec![1]);
        h.master.push(b"c", MethodKind::Havoc.into(), Vec::new());
        h.master.flush().unwrap();

        match h.worker_rx[1].try_recv().unwrap() {
            WorkerMsg::Job { methods, affected } => {
                assert_eq!(methods.len(), 2);
                assert_eq!(affected[1], vec![1]);
            }
            m => panic!("unexpected {:?}", m.tag()),
        }
        assert_eq!(h.master.comm.slot(1).task(0), b"a".to_vec());
        assert!(matches!(h.worker_rx[0].try_recv().unwrap(), WorkerMsg::Job { .. }));
        assert_eq!(h.master.comm.slot(0).task(0), b"c".to_vec());
        assert_eq!(h.master.round_counter, 3);
        assert_eq!(h.master.total, 3);
    }

    #[test]
    fn abort_drops_the_stage() {
        let mut h = harness(2, 1);
        h.master_tx.send(MasterMsg::AbortReq(0)).unwrap();
        h.master.push(b"a", MethodKind::Havoc.into(), Vec::new());
        h.master.flush().unwrap();
        assert!(h.master.stage_abortion);
        assert!(h.master.comm.stage_aborted());
        assert_eq!(h.master.round_counter, 0);

        // candidates are ignored until the next node
        h.master.push(b"b", MethodKind::Havoc.into(), Vec::new());
        assert!(h.master.buffer.is_empty());
        assert_eq!(h.master.deputy().unwrap(), 1);
        assert_eq!(h.master.live_workers(), vec![1]);
    }

    #[test]
    fn no_workers_left() {
        let mut h = harness(1, 1);
        h.master_tx.send(MasterMsg::AbortReq(0)).unwrap();
        h.master.push(b"a", MethodKind::Havoc.into(), Vec::new());
        let e = h.master.flush().unwrap_err();
        assert!(e.to_string().contains("all workers"));
    }

    #[test]
    fn deputy_request_skips_dead_workers() {
        let mut h = harness(2, 1);
        h.master.dead[0] = true;
        h.reply_tx.send((1, WorkerReply::BitmapHash(Some(7)))).unwrap();
        assert_eq!(h.master.bitmap_hash(b"x").unwrap(), Some(7));
        assert!(matches!(h.worker_rx[1].try_recv().unwrap(), WorkerMsg::ReqBitmapHash(_)));
        assert!(h.worker_rx[0].try_recv().is_err());
    }

    #[test]
    fn acks_keep_other_messages() {
        let mut h = harness(2, 1);
        h.master_tx.send(MasterMsg::Req(0)).unwrap();
        h.master_tx.send(MasterMsg::Ping(0)).unwrap();
        h.master_tx.send(MasterMsg::Ping(1)).unwrap();
        h.master.sync_workers().unwrap();
        assert_eq!(h.master.backlog.len(), 1);
        assert_eq!(h.master.next_master_msg().unwrap(), MasterMsg::Req(0));
    }
}
