//! The mapserver owns the coverage tree. Results of all workers are funneled through
//! it one at a time, and it answers the barrier requests of the master once the number
//! of processed results matches the number of dispatched tasks.
use crate::{
    message::{recv, FuzzingResult, MapserverMsg, MapserverReply, NextNode, QueueError},
    stats::{Stats, TreeStats},
    transfer::Comm,
    workdir::{DiskStore, WorkDir},
};
use anyhow::Context;
use ptfuzz_core::{
    corpus::{CoverageTree, Finding, NodeState, NodeStore, TreeConfig},
    method::MethodKind,
    HashSet, RngType, MAX_PAYLOAD_SIZE,
};
use qemu_pt::LookupSet;
use rand::SeedableRng;
use std::{
    collections::VecDeque,
    fs,
    sync::{
        mpsc::{Receiver, Sender},
        Arc,
    },
    time::Instant,
};

/// Recent payloads kept per worker, dumped next to unique findings.
pub const RING_BUFFER_LEN: usize = 30;

#[derive(Debug, Clone, Copy)]
struct PostSync {
    rounds: u64,
    finished: bool,
    performance: f64,
}

pub struct Mapserver<S> {
    tree: CoverageTree<S>,
    comm: Arc<Comm>,
    workdir: WorkDir,
    lookup: LookupSet,
    stats: Arc<Stats>,
    start: Instant,

    hash_list: HashSet<u64>,
    shadow_map: HashSet<u64>,
    last_hash: Option<u64>,
    ring_buffers: Vec<VecDeque<Vec<u8>>>,
    preliminary: bool,
    round_counter: u64,

    effector_initial: Option<u64>,
    effector_map: Vec<bool>,

    redqueen_sync: Option<u64>,
    effector_sync: Option<u64>,
    verification_sync: Option<u64>,
    pre_sync: Option<u64>,
    post_sync: Option<PostSync>,
}

/// Wait for the seed bitmaps, build the tree on disk and serve until shutdown.
pub fn run_mapserver(
    comm: Arc<Comm>,
    workdir: WorkDir,
    lookup: LookupSet,
    stats: Arc<Stats>,
    config: TreeConfig,
    rx: Receiver<MapserverMsg>,
    tx: Sender<MapserverReply>,
) -> anyhow::Result<()> {
    let seeds = loop {
        match recv(&rx) {
            Ok(MapserverMsg::InitBitmap(seeds)) => break seeds,
            Ok(MapserverMsg::Shutdown) | Err(_) => return Ok(()),
            Ok(m) => log::warn!("mapserver: unexpected {:?} before init", m.tag()),
        }
    };
    log::info!("mapserver: building tree from {} seeds", seeds.len());
    let store = DiskStore::new(workdir.clone());
    let tree = CoverageTree::new(store, config, RngType::from_entropy(), seeds)
        .context("failed to build coverage tree")?;
    Mapserver::new(tree, comm, workdir, lookup, stats).run(rx, tx)
}

impl<S: NodeStore> Mapserver<S> {
    pub fn new(tree: CoverageTree<S>, comm: Arc<Comm>, workdir: WorkDir, lookup: LookupSet, stats: Arc<Stats>) -> Self {
        let workers = comm.slots.len();
        let mut m = Self {
            tree,
            comm,
            workdir,
            lookup,
            stats,
            start: Instant::now(),
            hash_list: HashSet::default(),
            shadow_map: HashSet::default(),
            last_hash: None,
            ring_buffers: vec![VecDeque::with_capacity(RING_BUFFER_LEN); workers],
            preliminary: false,
            round_counter: 0,
            effector_initial: None,
            effector_map: Vec::new(),
            redqueen_sync: None,
            effector_sync: None,
            verification_sync: None,
            pre_sync: None,
            post_sync: None,
        };
        m.update_stats();
        m
    }

    pub fn run(mut self, rx: Receiver<MapserverMsg>, tx: Sender<MapserverReply>) -> anyhow::Result<()> {
        let ret = self.serve(&rx, &tx);
        if let Err(e) = self.tree.save_bitmaps() {
            log::warn!("mapserver: failed to save bitmaps: {}", e);
        }
        ret
    }

    fn serve(&mut self, rx: &Receiver<MapserverMsg>, tx: &Sender<MapserverReply>) -> anyhow::Result<()> {
        loop {
            self.sync_handler(tx)?;
            let msg = match recv(rx) {
                Ok(m) => m,
                Err(QueueError::Stopped) | Err(QueueError::Disconnected) => return Ok(()),
            };
            match msg {
                MapserverMsg::Result { source, results } => self.result_handler(source, results)?,
                MapserverMsg::NxtFin { rounds, performance } => {
                    self.post_sync = Some(PostSync {
                        rounds,
                        finished: true,
                        performance,
                    })
                }
                MapserverMsg::NxtUnfin { rounds, performance } => {
                    self.post_sync = Some(PostSync {
                        rounds,
                        finished: false,
                        performance,
                    })
                }
                MapserverMsg::UntouchedNodes(rounds) => self.pre_sync = Some(rounds),
                MapserverMsg::ReqEffector(bitmap) => {
                    log::debug!("mapserver: new effector map");
                    self.effector_initial = Some(ptfuzz_core::bitmap::hash(&bitmap));
                    self.effector_map = vec![false; MAX_PAYLOAD_SIZE];
                }
                MapserverMsg::GetEffector(rounds) => self.effector_sync = Some(rounds),
                MapserverMsg::RedqueenSync(rounds) => self.redqueen_sync = Some(rounds),
                MapserverMsg::ReqVerifySync(rounds) => self.verification_sync = Some(rounds),
                MapserverMsg::ReqPreliminary(enable) => self.preliminary_handler(enable, tx)?,
                MapserverMsg::InitBitmap(_) => log::warn!("mapserver: tree already initialized"),
                MapserverMsg::Shutdown => return Ok(()),
            }
        }
    }

    fn reply(tx: &Sender<MapserverReply>, r: MapserverReply) -> anyhow::Result<()> {
        let tag = r.tag();
        tx.send(r)
            .map_err(|_| anyhow::anyhow!("master gone while replying {}", tag))
    }

    fn sync_handler(&mut self, tx: &Sender<MapserverReply>) -> anyhow::Result<()> {
        if self.redqueen_sync == Some(self.round_counter) {
            Self::reply(tx, MapserverReply::RedqueenSync)?;
            self.redqueen_sync = None;
            self.round_counter = 0;
        }
        if self.effector_sync == Some(self.round_counter) {
            let map = std::mem::take(&mut self.effector_map);
            Self::reply(tx, MapserverReply::Effector(map))?;
            self.effector_sync = None;
            self.effector_initial = None;
        }
        if self.verification_sync == Some(self.round_counter) {
            Self::reply(tx, MapserverReply::VerifySync)?;
            self.verification_sync = None;
        }
        if self.pre_sync == Some(self.round_counter) {
            Self::reply(tx, MapserverReply::UntouchedNodes(self.tree.untouched_nodes()))?;
            self.pre_sync = None;
            log::debug!("mapserver: shadow map size {}", self.shadow_map.len());
        }
        if let Some(p) = self.post_sync {
            if p.rounds == self.round_counter {
                let node = self.next_node(p)?;
                Self::reply(tx, node)?;
                self.post_sync = None;
                self.round_counter = 0;
            }
        }
        Ok(())
    }

    fn next_node(&mut self, p: PostSync) -> anyhow::Result<MapserverReply> {
        log::debug!("mapserver: performance {:.2}", p.performance);
        self.tree.resort_favs();
        let idx = self
            .tree
            .get_next(p.finished)
            .ok_or_else(|| anyhow::anyhow!("corpus is empty"))?;
        self.update_stats();
        let node = self.tree.node(idx);
        self.stats.set_level(node.level as u64 + 1);
        let unfinished = matches!(node.state, NodeState::InProgress | NodeState::Finished);
        let (id, kind, level) = (node.id, node.kind, node.level);
        let payload = self
            .tree
            .load_payload(idx)
            .with_context(|| format!("failed to load payload of node {}", id))?;
        Ok(MapserverReply::Next {
            node: NextNode {
                id,
                kind,
                level,
                payload,
            },
            unfinished,
        })
    }

    fn preliminary_handler(&mut self, enable: bool, tx: &Sender<MapserverReply>) -> anyhow::Result<()> {
        if self.preliminary != enable {
            self.preliminary = enable;
            if enable {
                self.stats.set_preliminary(0);
                self.lookup.enable_preliminary_mode();
            } else {
                self.lookup.disable_preliminary_mode();
            }
            self.last_hash = None;
            log::debug!("mapserver: preliminary mode {}", enable);
        }
        let n = match self.tree.toggle_preliminary_mode(enable) {
            Ok(n) => n,
            Err(e) => {
                log::warn!("mapserver: failed to toggle preliminary mode: {}", e);
                0
            }
        };
        Self::reply(tx, MapserverReply::Preliminary(n))
    }

    fn result_handler(&mut self, source: usize, results: Vec<FuzzingResult>) -> anyhow::Result<()> {
        let slot = self.comm.slot(source);
        if !slot.lock_b.acquire() {
            return Err(QueueError::Stopped.into());
        }
        let data: Vec<_> = results
            .iter()
            .map(|r| {
                if r.new_bits && r.bitmap_hash.is_some() {
                    Some(slot.result(r.slot))
                } else {
                    None
                }
            })
            .collect();
        slot.lock_a.release();

        for (r, d) in results.into_iter().zip(data) {
            self.round_counter += 1;
            let (hash, (payload, bitmap)) = match (r.bitmap_hash, d) {
                (Some(h), Some(d)) => (h, d),
                _ => continue,
            };
            self.check_hash(hash, &bitmap, payload, &r);
            self.last_hash = Some(hash);
            if let Some(initial) = self.effector_initial {
                if initial != hash {
                    for &j in &r.affected_bytes {
                        if let Some(e) = self.effector_map.get_mut(j) {
                            *e = true;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn check_hash(&mut self, hash: u64, bitmap: &[u8], payload: Vec<u8>, r: &FuzzingResult) {
        let rbuf = &mut self.ring_buffers[r.worker_id];
        if rbuf.len() == RING_BUFFER_LEN {
            rbuf.pop_front();
        }
        rbuf.push_back(payload.clone());

        let hash_was_new = self.preliminary
            || (self.last_hash != Some(hash)
                && (self.hash_list.is_empty()
                    || (!self.hash_list.contains(&hash) && !self.shadow_map.contains(&hash))));

        let finding = if r.crash {
            Some(Finding::Crash)
        } else if r.kasan {
            Some(Finding::Kasan)
        } else if r.timeout {
            Some(Finding::Timeout)
        } else {
            None
        };

        if let Some(f) = finding {
            let accepted = self.append(&payload, bitmap, r, Some(f));
            if accepted {
                if self.preliminary {
                    self.stats.inc_preliminary();
                    log::info!("mapserver: unique {} from worker-{} [preliminary]", f.name(), r.worker_id);
                } else {
                    log::info!("mapserver: unique {} from worker-{}", f.name(), r.worker_id);
                    self.inc_finding(f, true);
                    self.stats.touch_last_find();
                    let n = self.tree.finding_counters().unique(f);
                    self.save_ring_buffer(r.worker_id, f, n);
                }
            } else if !self.preliminary {
                self.inc_finding(f, false);
                let n = self.tree.finding_counters().total(f);
                self.save_non_unique(f, n, &payload);
            }
        } else if hash_was_new {
            if self.append(&payload, bitmap, r, None) {
                if self.preliminary {
                    self.stats.inc_preliminary();
                } else {
                    if r.method.kind == MethodKind::Import {
                        self.stats.inc_imports();
                    }
                    self.hash_list.insert(hash);
                    self.stats.touch_last_find();
                    self.update_stats();
                }
            } else if !self.preliminary {
                self.shadow_map.insert(hash);
            }
        }

        if r.reloaded {
            self.ring_buffers[r.worker_id].clear();
        }
    }

    /// Failing persistence rejects the candidate.
    fn append(&mut self, payload: &[u8], bitmap: &[u8], r: &FuzzingResult, finding: Option<Finding>) -> bool {
        match self
            .tree
            .append(payload, bitmap, r.method.clone(), finding, r.performance)
        {
            Ok(ret) => ret.accepted,
            Err(e) => {
                log::warn!("mapserver: failed to store node: {}", e);
                false
            }
        }
    }

    fn inc_finding(&self, f: Finding, unique: bool) {
        match f {
            Finding::Crash => self.stats.inc_crash(unique),
            Finding::Kasan => self.stats.inc_kasan(unique),
            Finding::Timeout => self.stats.inc_timeout(unique),
        }
    }

    fn save_ring_buffer(&self, worker: usize, f: Finding, n: u64) {
        let data: Vec<String> = self.ring_buffers[worker].iter().map(hex::encode).collect();
        let path = self.workdir.rbuf_path(f, n);
        let ret = serde_json::to_string(&data)
            .map_err(std::io::Error::from)
            .and_then(|s| fs::write(&path, s));
        if let Err(e) = ret {
            log::warn!("mapserver: failed to write {}: {}", path.display(), e);
        }
    }

    fn save_non_unique(&self, f: Finding, n: u64, payload: &[u8]) {
        let path = self.workdir.non_uniq_path(f, n);
        let ret = fs::write(&path, payload)
            .and_then(|_| self.workdir.log_finding(self.start.elapsed().as_secs_f64(), &path));
        if let Err(e) = ret {
            log::warn!("mapserver: failed to write {}: {}", path.display(), e);
        }
    }

    fn update_stats(&self) {
        let c = self.tree.counters();
        let (ratio_coverage, ratio_bits) = self.tree.bitmap_values();
        self.stats.set_tree(TreeStats {
            paths: c.paths,
            paths_pending: c.paths.saturating_sub(c.paths_finished + c.paths_in_progress),
            paths_unfinished: c.paths_in_progress,
            favorites: c.favorites,
            fav_pending: c
                .favorites
                .saturating_sub(c.favorites_finished + c.favorites_in_progress),
            fav_unfinished: c.favorites_in_progress,
            cycles: c.cycles,
            ratio_coverage,
            ratio_bits,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ptfuzz_core::{
        bitmap::{self, VIRGIN},
        corpus::MemoryStore,
        method::FuzzMethod,
    };
    use rand::{seq::SliceRandom, Rng};
    use std::{
        sync::mpsc::{channel, RecvTimeoutError},
        thread::{self, JoinHandle},
        time::Duration,
    };

    const SIZE: usize = 64;

    fn trace(edges: &[usize]) -> Vec<u8> {
        let mut t = vec![VIRGIN; SIZE];
        for &e in edges {
            t[e] = 1;
        }
        t
    }

    struct Harness {
        comm: Arc<Comm>,
        stats: Arc<Stats>,
        workdir: WorkDir,
        tx: Sender<MapserverMsg>,
        replies: Receiver<MapserverReply>,
        handle: JoinHandle<anyhow::Result<()>>,
    }

    fn harness(name: &str) -> Harness {
        let dir = std::env::temp_dir().join(format!("ptfuzz-ms-{}-{}", name, std::process::id()));
        let workdir = WorkDir::new(&dir);
        workdir.init(true).unwrap();
        let comm = Arc::new(Comm::new(1, 4, SIZE));
        let stats = Arc::new(Stats::new());
        let config = TreeConfig {
            bitmap_size: SIZE,
            depth_first: true,
        };
        let seeds = vec![(b"seed".to_vec(), trace(&[0]))];
        let tree = CoverageTree::new(MemoryStore::default(), config, RngType::from_entropy(), seeds).unwrap();
        let (tx, rx) = channel();
        let (rtx, replies) = channel();
        let ms = Mapserver::new(tree, Arc::clone(&comm), workdir.clone(), LookupSet::new(), Arc::clone(&stats));
        let handle = thread::spawn(move || ms.run(rx, rtx));
        Harness {
            comm,
            stats,
            workdir,
            tx,
            replies,
            handle,
        }
    }

    /// Write one job result the way a worker does.
    fn submit(h: &Harness, entries: &[(&[u8], Vec<u8>, bool)]) {
        let slot = h.comm.slot(0);
        assert!(slot.lock_a.acquire());
        let mut results = Vec::new();
        for (i, (payload, bitmap, crash)) in entries.iter().enumerate() {
            slot.put_payload(i, payload);
            slot.bitmaps()[i].copy_from_slice(bitmap);
            let mut r = FuzzingResult::aborted(i, 0, vec![i], FuzzMethod::new(MethodKind::Havoc));
            r.bitmap_hash = Some(bitmap::hash(bitmap));
            r.new_bits = true;
            r.crash = *crash;
            results.push(r);
        }
        slot.lock_b.release();
        h.tx.send(MapserverMsg::Result { source: 0, results }).unwrap();
    }

    fn reply(h: &Harness) -> Result<MapserverReply, RecvTimeoutError> {
        h.replies.recv_timeout(Duration::from_millis(300))
    }

    fn finish(h: Harness) {
        drop(h.tx);
        h.handle.join().unwrap().unwrap();
        std::fs::remove_dir_all(h.workdir.root()).unwrap();
    }

    fn scratch_dir(name: &str) -> WorkDir {
        let dir = std::env::temp_dir().join(format!("ptfuzz-ms-{}-{}", name, std::process::id()));
        let workdir = WorkDir::new(&dir);
        workdir.init(true).unwrap();
        workdir
    }

    /// Mapserver driven on the test thread, so barrier replies can be checked per result.
    fn local(workdir: &WorkDir, workers: usize) -> Mapserver<MemoryStore> {
        let comm = Arc::new(Comm::new(workers, 4, SIZE));
        let config = TreeConfig {
            bitmap_size: SIZE,
            depth_first: true,
        };
        let seeds = vec![(b"seed".to_vec(), trace(&[0]))];
        let tree = CoverageTree::new(MemoryStore::default(), config, RngType::seed_from_u64(1), seeds).unwrap();
        Mapserver::new(tree, comm, workdir.clone(), LookupSet::new(), Arc::new(Stats::new()))
    }

    /// Hand `n` results of `worker` to the mapserver, passing the slot locks like a worker.
    fn deliver(m: &mut Mapserver<MemoryStore>, worker: usize, n: usize) {
        {
            let slot = m.comm.slot(worker);
            assert!(slot.lock_a.acquire());
            slot.lock_b.release();
        }
        let results = (0..n)
            .map(|i| FuzzingResult::aborted(i, worker, Vec::new(), FuzzMethod::new(MethodKind::Havoc)))
            .collect();
        m.result_handler(worker, results).unwrap();
    }

    #[test]
    fn post_sync_fires_once_after_last_result() {
        let workdir = scratch_dir("split");
        let mut rng = RngType::seed_from_u64(0x6261_7272);
        for _ in 0..32 {
            let workers = rng.gen_range(1..=4);
            let mut m = local(&workdir, workers);
            let (tx, rx) = channel();

            let total = rng.gen_range(1..=40u64);
            let mut chunks = Vec::new();
            let mut left = total;
            while left > 0 {
                let n = rng.gen_range(1..=left.min(4));
                chunks.push((rng.gen_range(0..workers), n as usize));
                left -= n;
            }
            chunks.shuffle(&mut rng);

            m.post_sync = Some(PostSync {
                rounds: total,
                finished: false,
                performance: 1.0,
            });
            m.sync_handler(&tx).unwrap();
            assert!(rx.try_recv().is_err());

            let last = chunks.len() - 1;
            for (i, &(worker, n)) in chunks.iter().enumerate() {
                deliver(&mut m, worker, n);
                m.sync_handler(&tx).unwrap();
                let replies: Vec<_> = rx.try_iter().collect();
                if i == last {
                    assert_eq!(replies.len(), 1);
                    assert!(matches!(replies[0], MapserverReply::Next { .. }));
                } else {
                    assert!(replies.is_empty());
                }
            }
            assert_eq!(m.round_counter, 0);
            assert!(m.post_sync.is_none());
            m.sync_handler(&tx).unwrap();
            assert!(rx.try_recv().is_err());
        }
        std::fs::remove_dir_all(workdir.root()).unwrap();
    }

    #[test]
    fn only_redqueen_and_post_sync_reset_rounds() {
        let workdir = scratch_dir("resets");
        let mut m = local(&workdir, 2);
        let (tx, rx) = channel();

        deliver(&mut m, 0, 3);
        m.verification_sync = Some(3);
        m.sync_handler(&tx).unwrap();
        assert!(matches!(rx.try_recv(), Ok(MapserverReply::VerifySync)));
        assert_eq!(m.round_counter, 3);

        m.effector_sync = Some(4);
        deliver(&mut m, 1, 1);
        m.sync_handler(&tx).unwrap();
        assert!(matches!(rx.try_recv(), Ok(MapserverReply::Effector(_))));
        assert_eq!(m.round_counter, 4);

        m.redqueen_sync = Some(6);
        deliver(&mut m, 1, 2);
        m.sync_handler(&tx).unwrap();
        assert!(matches!(rx.try_recv(), Ok(MapserverReply::RedqueenSync)));
        assert_eq!(m.round_counter, 0);

        m.post_sync = Some(PostSync {
            rounds: 2,
            finished: true,
            performance: 1.0,
        });
        deliver(&mut m, 0, 2);
        m.sync_handler(&tx).unwrap();
        assert!(matches!(rx.try_recv(), Ok(MapserverReply::Next { .. })));
        assert_eq!(m.round_counter, 0);
        std::fs::remove_dir_all(workdir.root()).unwrap();
    }

    #[test]
    fn post_sync_waits_for_rounds() {
        let h = harness("barrier");
        h.tx.send(MapserverMsg::NxtFin {
            rounds: 2,
            performance: 1.0,
        })
        .unwrap();
        submit(&h, &[(b"a", trace(&[1]), false)]);
        assert!(reply(&h).is_err());

        submit(&h, &[(b"b", trace(&[2]), false)]);
        match reply(&h).unwrap() {
            MapserverReply::Next { node, .. } => assert_eq!(node.level, 0),
            r => panic!("unexpected {:?}", r.tag()),
        }
        assert_eq!(h.stats.snapshot().paths, 3);
        finish(h);
    }

    #[test]
    fn same_bitmap_accepted_once() {
        let h = harness("dedup");
        submit(&h, &[(b"a", trace(&[1]), false), (b"b", trace(&[1]), false)]);
        h.tx.send(MapserverMsg::UntouchedNodes(2)).unwrap();
        match reply(&h).unwrap() {
            MapserverReply::UntouchedNodes(_) => (),
            r => panic!("unexpected {:?}", r.tag()),
        }
        assert_eq!(h.stats.snapshot().paths, 2);
        finish(h);
    }

    #[test]
    fn unique_crash_dumps_ring_buffer() {
        let h = harness("crash");
        submit(&h, &[(b"x", trace(&[1]), false), (b"boom", trace(&[5]), true)]);
        submit(&h, &[(b"boom2", trace(&[5]), true)]);
        h.tx.send(MapserverMsg::RedqueenSync(3)).unwrap();
        assert!(matches!(reply(&h).unwrap(), MapserverReply::RedqueenSync));

        let s = h.stats.snapshot();
        assert_eq!(s.crash_unique, 1);
        assert_eq!(s.crash, 2);
        let rbuf = std::fs::read_to_string(h.workdir.rbuf_path(Finding::Crash, 1)).unwrap();
        let dumped: Vec<String> = serde_json::from_str(&rbuf).unwrap();
        assert_eq!(dumped, vec![hex::encode(b"x"), hex::encode(b"boom")]);
        assert!(h.workdir.non_uniq_path(Finding::Crash, 2).is_file());
        finish(h);
    }

    #[test]
    fn effector_marks_changing_bytes() {
        let h = harness("effector");
        let base = trace(&[0]);
        h.tx.send(MapserverMsg::ReqEffector(base.clone())).unwrap();
        submit(&h, &[(b"a", base.clone(), false), (b"b", trace(&[3]), false)]);
        h.tx.send(MapserverMsg::GetEffector(2)).unwrap();
        match reply(&h).unwrap() {
            MapserverReply::Effector(map) => {
                assert!(!map[0]);
                assert!(map[1]);
            }
            r => panic!("unexpected {:?}", r.tag()),
        }
        finish(h);
    }
}
