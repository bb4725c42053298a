//! Coverage tree: the corpus of accepted inputs and the order they are fuzzed in.
//!
//! Nodes live in an arena and are referenced by their index. The favorites index maps
//! every bitmap offset to the node owning it, pools of indices decide what is scheduled
//! next. Payloads are persisted through a [`NodeStore`].
use crate::{
    bitmap::{self, NewCoverage, VIRGIN},
    method::{FuzzMethod, Yields},
    HashMap, RngType,
};
use rand::prelude::*;
use std::{cmp::Ordering, collections::VecDeque, io};

/// Index of a node in the arena.
pub type NodeIdx = usize;

/// `fav_factor` of a node whose performance was never measured.
pub const UNKNOWN_FAV_FACTOR: f64 = 10_000_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Finding {
    Crash,
    Kasan,
    Timeout,
}

impl Finding {
    pub const ALL: [Finding; 3] = [Finding::Crash, Finding::Kasan, Finding::Timeout];

    pub fn name(self) -> &'static str {
        match self {
            Finding::Crash => "crash",
            Finding::Kasan => "kasan",
            Finding::Timeout => "timeout",
        }
    }

    #[inline]
    fn idx(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Regular,
    Favorite,
    Finding(Finding),
    Preliminary,
}

impl NodeKind {
    #[inline]
    pub fn is_finding(self) -> bool {
        matches!(self, NodeKind::Finding(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NodeState {
    Untouched,
    InProgress,
    Finished,
}

/// One accepted input.
#[derive(Debug, Clone)]
pub struct CorpusNode {
    /// Id within the namespace of `kind`, starts from 1.
    pub id: u64,
    /// Mutation depth from the seeds.
    pub level: usize,
    pub kind: NodeKind,
    pub state: NodeState,
    /// Sorted offsets of bitmap bytes hit by this input.
    pub bits: Vec<u32>,
    /// Number of offsets this node owns in the favorites index.
    pub fav_bits: usize,
    /// Seconds per execution, zero if unknown.
    pub performance: f64,
    pub fav_factor: f64,
    pub payload_hash: u64,
    pub payload_len: usize,
    pub method: FuzzMethod,
    pub new_bytes: u32,
    pub new_bits: u32,
}

impl CorpusNode {
    fn new(id: u64, level: usize, kind: NodeKind, payload: &[u8], trace: &[u8], method: FuzzMethod, performance: f64) -> Self {
        let bits = bitmap::hit_edges(trace).map(|i| i as u32).collect();
        let fav_factor = if performance == 0.0 {
            UNKNOWN_FAV_FACTOR
        } else {
            performance * payload.len() as f64
        };
        Self {
            id,
            level,
            kind,
            state: NodeState::Untouched,
            bits,
            fav_bits: 0,
            performance,
            fav_factor,
            payload_hash: bitmap::hash(payload),
            payload_len: payload.len(),
            method,
            new_bytes: 0,
            new_bits: 0,
        }
    }

    /// Whether `self` hits every offset `other` hits.
    pub fn covers(&self, other: &CorpusNode) -> bool {
        let mut mine = self.bits.iter().peekable();
        'outer: for b in &other.bits {
            while let Some(m) = mine.next() {
                match m.cmp(b) {
                    Ordering::Less => continue,
                    Ordering::Equal => continue 'outer,
                    Ordering::Greater => return false,
                }
            }
            return false;
        }
        true
    }
}

/// Persistence of payloads and tree state.
pub trait NodeStore {
    /// Persist payload and mutation record of a new node.
    fn save_node(&mut self, node: &CorpusNode, payload: &[u8]) -> io::Result<()>;
    fn remove_node(&mut self, node: &CorpusNode) -> io::Result<()>;
    fn load_payload(&self, node: &CorpusNode) -> io::Result<Vec<u8>>;
    fn save_yields(&mut self, yields: &Yields) -> io::Result<()>;
    fn save_bitmaps(&mut self, maps: &CoverageMaps) -> io::Result<()>;
}

/// Payloads kept in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    payloads: HashMap<(u8, u64), Vec<u8>>,
}

impl MemoryStore {
    fn key(node: &CorpusNode) -> (u8, u64) {
        let ns = match node.kind {
            NodeKind::Regular | NodeKind::Favorite => 0,
            NodeKind::Finding(f) => 1 + f.idx() as u8,
            NodeKind::Preliminary => 4,
        };
        (ns, node.id)
    }

    pub fn len(&self) -> usize {
        self.payloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }
}

impl NodeStore for MemoryStore {
    fn save_node(&mut self, node: &CorpusNode, payload: &[u8]) -> io::Result<()> {
        self.payloads.insert(Self::key(node), payload.to_vec());
        Ok(())
    }

    fn remove_node(&mut self, node: &CorpusNode) -> io::Result<()> {
        self.payloads.remove(&Self::key(node));
        Ok(())
    }

    fn load_payload(&self, node: &CorpusNode) -> io::Result<Vec<u8>> {
        self.payloads
            .get(&Self::key(node))
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such payload"))
    }

    fn save_yields(&mut self, _yields: &Yields) -> io::Result<()> {
        Ok(())
    }

    fn save_bitmaps(&mut self, _maps: &CoverageMaps) -> io::Result<()> {
        Ok(())
    }
}

/// Canonical coverage and the per-category finding bitmaps.
#[derive(Debug, Clone)]
pub struct CoverageMaps {
    pub coverage: Vec<u8>,
    pub crash: Vec<u8>,
    pub kasan: Vec<u8>,
    pub timeout: Vec<u8>,
}

impl CoverageMaps {
    pub fn new(size: usize) -> Self {
        Self {
            coverage: vec![VIRGIN; size],
            crash: vec![VIRGIN; size],
            kasan: vec![VIRGIN; size],
            timeout: vec![VIRGIN; size],
        }
    }

    pub fn finding(&self, f: Finding) -> &[u8] {
        match f {
            Finding::Crash => &self.crash,
            Finding::Kasan => &self.kasan,
            Finding::Timeout => &self.timeout,
        }
    }

    fn finding_mut(&mut self, f: Finding) -> &mut [u8] {
        match f {
            Finding::Crash => &mut self.crash,
            Finding::Kasan => &mut self.kasan,
            Finding::Timeout => &mut self.timeout,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TreeConfig {
    pub bitmap_size: usize,
    /// Pop pools from the back instead of the front.
    pub depth_first: bool,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            bitmap_size: bitmap::DEFAULT_BITMAP_SIZE,
            depth_first: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeCounters {
    pub favorites: u64,
    pub favorites_in_progress: u64,
    pub favorites_finished: u64,
    pub paths: u64,
    pub paths_in_progress: u64,
    pub paths_finished: u64,
    pub cycles: u64,
}

/// Occurrences of findings, non-unique ones included.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FindingCounters {
    total: [u64; 3],
    unique: [u64; 3],
}

impl FindingCounters {
    pub fn total(&self, f: Finding) -> u64 {
        self.total[f.idx()]
    }

    pub fn unique(&self, f: Finding) -> u64 {
        self.unique[f.idx()]
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppendResult {
    pub accepted: bool,
    pub coverage: NewCoverage,
}

impl AppendResult {
    fn rejected(coverage: NewCoverage) -> Self {
        Self {
            accepted: false,
            coverage,
        }
    }

    fn accepted(coverage: NewCoverage) -> Self {
        Self {
            accepted: true,
            coverage,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct NodeIds {
    regular: u64,
    findings: [u64; 3],
    preliminary: u64,
}

impl Default for NodeIds {
    fn default() -> Self {
        Self {
            regular: 1,
            findings: [1; 3],
            preliminary: 1,
        }
    }
}

impl NodeIds {
    fn slot(&mut self, kind: NodeKind) -> &mut u64 {
        match kind {
            NodeKind::Regular | NodeKind::Favorite => &mut self.regular,
            NodeKind::Finding(f) => &mut self.findings[f.idx()],
            NodeKind::Preliminary => &mut self.preliminary,
        }
    }

    fn next(&mut self, kind: NodeKind) -> u64 {
        let slot = self.slot(kind);
        let id = *slot;
        *slot += 1;
        id
    }

    fn rollback(&mut self, kind: NodeKind) {
        *self.slot(kind) -= 1;
    }
}

// (has performance, fast, fav_bits, -level, -fav_factor)
type Score = (u8, u8, usize, i64, f64);

pub struct CoverageTree<S> {
    store: S,
    config: TreeConfig,
    rng: RngType,

    nodes: Vec<CorpusNode>,
    references: HashMap<Option<NodeIdx>, Vec<NodeIdx>>,
    payload_hashes: HashMap<u64, NodeIdx>,
    current: Option<NodeIdx>,
    level: usize,
    max_level: usize,

    favorite_buf: VecDeque<NodeIdx>,
    favorite_unfinished_buf: Vec<NodeIdx>,
    regular_buf: VecDeque<NodeIdx>,
    regular_unfinished_buf: Vec<NodeIdx>,
    finished_buf: VecDeque<NodeIdx>,
    shuffled: bool,

    maps: CoverageMaps,
    backup: Option<CoverageMaps>,
    fav_owner: Vec<Option<NodeIdx>>,

    preliminary: bool,
    preliminary_queue: Vec<CorpusNode>,

    ids: NodeIds,
    counters: TreeCounters,
    findings: FindingCounters,
    yields: Yields,
}

impl<S: NodeStore> CoverageTree<S> {
    /// Build the tree from seeds, every seed is a level 0 favorite.
    pub fn new(store: S, config: TreeConfig, rng: RngType, seeds: Vec<(Vec<u8>, Vec<u8>)>) -> io::Result<Self> {
        let size = config.bitmap_size;
        let mut tree = Self {
            store,
            config,
            rng,
            nodes: Vec::new(),
            references: HashMap::default(),
            payload_hashes: HashMap::default(),
            current: None,
            level: 0,
            max_level: 0,
            favorite_buf: VecDeque::new(),
            favorite_unfinished_buf: Vec::new(),
            regular_buf: VecDeque::new(),
            regular_unfinished_buf: Vec::new(),
            finished_buf: VecDeque::new(),
            shuffled: false,
            maps: CoverageMaps::new(size),
            backup: None,
            fav_owner: vec![None; size],
            preliminary: false,
            preliminary_queue: Vec::new(),
            ids: NodeIds::default(),
            counters: TreeCounters::default(),
            findings: FindingCounters::default(),
            yields: Yields::default(),
        };

        for (payload, trace) in seeds {
            if tree.is_duplicate(&payload) {
                log::debug!("duplicated seed ignored");
                continue;
            }
            let id = tree.ids.next(NodeKind::Favorite);
            let mut node = CorpusNode::new(id, 0, NodeKind::Favorite, &payload, &trace, FuzzMethod::default(), 0.0);
            tree.store.save_node(&node, &payload)?;
            let cov = bitmap::merge(&mut tree.maps.coverage, &trace);
            node.new_bytes = cov.new_bytes;
            node.new_bits = cov.new_bits;
            let idx = tree.append_to_level(node);
            tree.claim_free_edges(idx);
            tree.counters.favorites += 1;
            tree.counters.paths += 1;
        }
        tree.restore_state();
        tree.store.save_bitmaps(&tree.maps)?;
        Ok(tree)
    }

    /// Submit a candidate.
    pub fn append(
        &mut self,
        payload: &[u8],
        trace: &[u8],
        method: FuzzMethod,
        finding: Option<Finding>,
        performance: f64,
    ) -> io::Result<AppendResult> {
        if self.preliminary {
            return self.append_preliminary(payload, trace, method, finding, performance);
        }

        let mut cov = NewCoverage::default();
        match finding {
            Some(f) => {
                self.findings.total[f.idx()] += 1;
                if f == Finding::Timeout && bitmap::is_empty(trace) {
                    log::warn!("timeout with empty bitmap, wrong address range or buggy agent?");
                }
                if !bitmap::is_finding_unique(self.maps.finding(f), trace) {
                    return Ok(AppendResult::rejected(cov));
                }
            }
            None => {
                cov = bitmap::check_new(&self.maps.coverage, trace);
                if self.is_duplicate(payload) || !cov.is_new() {
                    return Ok(AppendResult::rejected(cov));
                }
            }
        }

        let kind = finding.map(NodeKind::Finding).unwrap_or(NodeKind::Regular);
        let id = self.ids.next(kind);
        let mut node = CorpusNode::new(id, self.level + 1, kind, payload, trace, method, performance);
        node.new_bytes = cov.new_bytes;
        node.new_bits = cov.new_bits;
        if let Err(e) = self.store.save_node(&node, payload) {
            self.ids.rollback(kind);
            return Err(e);
        }

        match finding {
            Some(f) => {
                bitmap::merge(self.maps.finding_mut(f), trace);
                self.findings.unique[f.idx()] += 1;
            }
            None => {
                bitmap::merge(&mut self.maps.coverage, trace);
                self.counters.paths += 1;
            }
        }
        self.yields.add(node.method.kind);
        if let Err(e) = self.store.save_yields(&self.yields) {
            log::warn!("failed to save yields: {}", e);
        }

        let idx = self.append_to_level(node);
        if finding.is_none() {
            self.check_if_favorite(idx);
        }
        Ok(AppendResult::accepted(cov))
    }

    fn append_preliminary(
        &mut self,
        payload: &[u8],
        trace: &[u8],
        method: FuzzMethod,
        finding: Option<Finding>,
        performance: f64,
    ) -> io::Result<AppendResult> {
        let mut cov = NewCoverage::default();
        let accepted = match finding {
            Some(f) => bitmap::is_finding_unique(self.maps.finding(f), trace),
            None => {
                cov = bitmap::check_new(&self.maps.coverage, trace);
                cov.is_new() && !self.is_duplicate(payload)
            }
        };
        if !accepted {
            return Ok(AppendResult::rejected(cov));
        }

        let id = self.ids.next(NodeKind::Preliminary);
        let mut node = CorpusNode::new(id, self.level + 1, NodeKind::Preliminary, payload, trace, method, performance);
        node.new_bytes = cov.new_bytes;
        node.new_bits = cov.new_bits;
        if let Err(e) = self.store.save_node(&node, payload) {
            self.ids.rollback(NodeKind::Preliminary);
            return Err(e);
        }
        match finding {
            Some(f) => bitmap::merge(self.maps.finding_mut(f), trace),
            None => bitmap::merge(&mut self.maps.coverage, trace),
        };
        self.preliminary_queue.push(node);
        Ok(AppendResult::accepted(cov))
    }

    /// Enter or leave preliminary mode, returns the number of queued preliminary nodes
    /// when leaving.
    pub fn toggle_preliminary_mode(&mut self, enable: bool) -> io::Result<usize> {
        if enable && !self.preliminary {
            self.backup = Some(self.maps.clone());
            for node in self.preliminary_queue.drain(..) {
                self.store.remove_node(&node)?;
            }
            self.ids.preliminary = 1;
            self.preliminary = true;
            Ok(0)
        } else if !enable && self.preliminary {
            if let Some(maps) = self.backup.take() {
                self.maps = maps;
            }
            self.preliminary = false;
            self.store.save_bitmaps(&self.maps)?;
            Ok(self.preliminary_queue.len())
        } else {
            Ok(0)
        }
    }

    #[inline]
    pub fn is_preliminary(&self) -> bool {
        self.preliminary
    }

    pub fn preliminary_nodes(&self) -> &[CorpusNode] {
        &self.preliminary_queue
    }

    /// Pick the next node to fuzz, marking the current one as finished or in progress.
    pub fn get_next(&mut self, finished: bool) -> Option<NodeIdx> {
        if self.nodes.is_empty() {
            return None;
        }
        if let Some(cur) = self.current {
            if self.nodes[cur].state != NodeState::Finished && !self.nodes[cur].kind.is_finding() {
                if finished {
                    self.set_finished(cur);
                } else {
                    self.set_unfinished(cur);
                }
            }
        }

        loop {
            let next = match self.get_favorite() {
                Some(n) => Some(n),
                None => {
                    if self.rng.gen_range(0..20) == 0 {
                        self.get_regular()
                    } else {
                        self.get_finished()
                    }
                }
            };
            if next.is_some() {
                return next;
            }
            self.restore_state();
            if self.pools_empty() {
                return None;
            }
        }
    }

    pub fn resort_favs(&mut self) {
        let mut favs: Vec<_> = self.favorite_buf.drain(..).collect();
        favs.sort_by(|a, b| {
            self.score(*a)
                .partial_cmp(&self.score(*b))
                .unwrap_or(Ordering::Equal)
        });
        self.favorite_buf = favs.into();
    }

    #[inline]
    pub fn node(&self, idx: NodeIdx) -> &CorpusNode {
        &self.nodes[idx]
    }

    pub fn load_payload(&self, idx: NodeIdx) -> io::Result<Vec<u8>> {
        self.store.load_payload(&self.nodes[idx])
    }

    #[inline]
    pub fn current(&self) -> Option<NodeIdx> {
        self.current
    }

    #[inline]
    pub fn level(&self) -> usize {
        self.level
    }

    #[inline]
    pub fn max_level(&self) -> usize {
        self.max_level
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn counters(&self) -> TreeCounters {
        self.counters
    }

    pub fn finding_counters(&self) -> FindingCounters {
        self.findings
    }

    pub fn yields(&self) -> &Yields {
        &self.yields
    }

    pub fn maps(&self) -> &CoverageMaps {
        &self.maps
    }

    /// Owner of bitmap offset `edge` in the favorites index.
    pub fn favorite_owner(&self, edge: usize) -> Option<NodeIdx> {
        self.fav_owner.get(edge).copied().flatten()
    }

    /// Coverage percentage and mean class bits per covered byte.
    pub fn bitmap_values(&self) -> (f64, f64) {
        bitmap::coverage_values(&self.maps.coverage)
    }

    /// Number of children of the current node. Unique findings are children too and
    /// count towards the havoc rounds' "still finding" check.
    pub fn untouched_nodes(&self) -> usize {
        self.references
            .get(&self.current)
            .map(|c| c.len())
            .unwrap_or(0)
    }

    /// Nodes waiting in the favorite and regular pools.
    pub fn pending(&self) -> (usize, usize) {
        (
            self.favorite_buf.len() + self.favorite_unfinished_buf.len(),
            self.regular_buf.len() + self.regular_unfinished_buf.len(),
        )
    }

    pub fn save_bitmaps(&mut self) -> io::Result<()> {
        self.store.save_bitmaps(&self.maps)
    }

    fn is_duplicate(&self, payload: &[u8]) -> bool {
        self.payload_hashes.contains_key(&bitmap::hash(payload))
    }

    fn pools_empty(&self) -> bool {
        self.favorite_buf.is_empty()
            && self.favorite_unfinished_buf.is_empty()
            && self.regular_buf.is_empty()
            && self.regular_unfinished_buf.is_empty()
            && self.finished_buf.is_empty()
    }

    fn append_to_level(&mut self, node: CorpusNode) -> NodeIdx {
        let idx = self.nodes.len();
        self.references.entry(self.current).or_default().push(idx);
        if node.level > self.max_level {
            self.max_level = node.level;
        }
        match (node.kind, node.state) {
            (NodeKind::Favorite, _) => self.favorite_buf.push_back(idx),
            (NodeKind::Regular, NodeState::Untouched) | (NodeKind::Regular, NodeState::InProgress) => {
                self.regular_buf.push_back(idx)
            }
            (k, NodeState::Finished) if !k.is_finding() => self.finished_buf.push_back(idx),
            _ => (),
        }
        self.payload_hashes.insert(node.payload_hash, idx);
        self.nodes.push(node);
        idx
    }

    fn change_current(&mut self, idx: NodeIdx) {
        self.current = Some(idx);
        self.level = self.nodes[idx].level;
    }

    fn set_finished(&mut self, idx: NodeIdx) {
        let fav = self.nodes[idx].kind == NodeKind::Favorite;
        let state = self.nodes[idx].state;
        if state != NodeState::Finished {
            self.counters.paths_finished += 1;
            if fav {
                self.counters.favorites_finished += 1;
            }
        }
        if state == NodeState::InProgress {
            self.counters.paths_in_progress = self.counters.paths_in_progress.saturating_sub(1);
            if fav {
                self.counters.favorites_in_progress = self.counters.favorites_in_progress.saturating_sub(1);
            }
        }
        self.nodes[idx].state = NodeState::Finished;
        self.finished_buf.push_back(idx);
    }

    fn set_unfinished(&mut self, idx: NodeIdx) {
        let fav = self.nodes[idx].kind == NodeKind::Favorite;
        if self.nodes[idx].state != NodeState::InProgress {
            self.counters.paths_in_progress += 1;
            if fav {
                self.counters.favorites_in_progress += 1;
            }
        }
        self.nodes[idx].state = NodeState::InProgress;
        if fav {
            self.favorite_unfinished_buf.push(idx);
        } else {
            self.regular_unfinished_buf.push(idx);
        }
    }

    fn restore_state(&mut self) {
        self.favorite_buf.clear();
        self.favorite_unfinished_buf.clear();
        self.regular_buf.clear();
        self.regular_unfinished_buf.clear();
        self.finished_buf.clear();
        for (idx, n) in self.nodes.iter().enumerate() {
            match (n.kind, n.state) {
                (NodeKind::Favorite, NodeState::Untouched) => self.favorite_buf.push_back(idx),
                (NodeKind::Favorite, NodeState::InProgress) => self.favorite_unfinished_buf.push(idx),
                (NodeKind::Regular, NodeState::Untouched) => self.regular_buf.push_back(idx),
                (NodeKind::Regular, NodeState::InProgress) => self.regular_unfinished_buf.push(idx),
                (NodeKind::Favorite, NodeState::Finished) | (NodeKind::Regular, NodeState::Finished) => {
                    self.finished_buf.push_back(idx)
                }
                _ => (),
            }
        }
        self.counters.cycles += 1;
        self.shuffled = false;
    }

    /// Shuffle finished pool once per pass, favorites and regulars separately.
    fn prepare_finished(&mut self) {
        if self.shuffled {
            return;
        }
        let nodes = &self.nodes;
        let (mut favs, mut regs): (Vec<_>, Vec<_>) = self
            .finished_buf
            .drain(..)
            .partition(|i| nodes[*i].kind == NodeKind::Favorite);
        favs.shuffle(&mut self.rng);
        regs.shuffle(&mut self.rng);
        self.finished_buf.extend(favs);
        self.finished_buf.extend(regs);
        self.shuffled = true;
    }

    fn pop_pool(depth_first: bool, buf: &mut VecDeque<NodeIdx>) -> Option<NodeIdx> {
        if depth_first {
            buf.pop_back()
        } else {
            buf.pop_front()
        }
    }

    fn get_favorite(&mut self) -> Option<NodeIdx> {
        if self.favorite_buf.is_empty() && self.favorite_unfinished_buf.is_empty() {
            return None;
        }
        self.shuffled = false;
        let next = match Self::pop_pool(self.config.depth_first, &mut self.favorite_buf) {
            Some(n) => n,
            None => {
                let n = self.favorite_unfinished_buf.pop()?;
                self.set_finished(n);
                n
            }
        };
        self.change_current(next);
        Some(next)
    }

    fn get_regular(&mut self) -> Option<NodeIdx> {
        if self.regular_buf.is_empty() && self.regular_unfinished_buf.is_empty() {
            return None;
        }
        self.shuffled = false;
        let next = match Self::pop_pool(self.config.depth_first, &mut self.regular_buf) {
            Some(n) => n,
            None => {
                let n = self.regular_unfinished_buf.pop()?;
                self.set_finished(n);
                n
            }
        };
        self.change_current(next);
        Some(next)
    }

    fn get_finished(&mut self) -> Option<NodeIdx> {
        if self.finished_buf.is_empty() {
            return None;
        }
        self.prepare_finished();
        let next = Self::pop_pool(self.config.depth_first, &mut self.finished_buf)?;
        self.change_current(next);
        Some(next)
    }

    /// Give every unowned offset hit by `idx` to it.
    fn claim_free_edges(&mut self, idx: NodeIdx) {
        let mut claimed = 0;
        for &b in &self.nodes[idx].bits {
            let owner = &mut self.fav_owner[b as usize];
            if owner.is_none() {
                *owner = Some(idx);
                claimed += 1;
            }
        }
        self.nodes[idx].fav_bits += claimed;
    }

    /// Re-evaluate the favorites index for a newly accepted node.
    fn check_if_favorite(&mut self, idx: NodeIdx) {
        if !matches!(self.nodes[idx].kind, NodeKind::Regular | NodeKind::Favorite) {
            return;
        }

        let mut prevs = Vec::new();
        let mut changed = false;
        let bits = self.nodes[idx].bits.clone();
        for b in bits {
            let b = b as usize;
            if let Some(prev) = self.fav_owner[b] {
                if prev == idx {
                    continue;
                }
                let node = &self.nodes[idx];
                let old = &self.nodes[prev];
                if !(node.covers(old) && node.fav_factor < old.fav_factor) {
                    continue;
                }
                prevs.push(prev);
                self.nodes[prev].fav_bits -= 1;
            }
            self.nodes[idx].fav_bits += 1;
            self.fav_owner[b] = Some(idx);
            changed = true;
        }

        if !changed {
            return;
        }
        self.reevaluate_favorites(prevs);
        if self.nodes[idx].kind == NodeKind::Favorite {
            return;
        }
        self.counters.favorites += 1;
        if let Some(p) = self.regular_buf.iter().position(|&i| i == idx) {
            self.regular_buf.remove(p);
        }
        let perf = self.nodes[idx].performance;
        if perf == 0.0 || 1.0 / perf <= 1000.0 {
            self.favorite_buf.push_front(idx);
        } else {
            self.favorite_buf.push_back(idx);
        }
        self.nodes[idx].kind = NodeKind::Favorite;
    }

    /// Demote displaced favorites that own nothing any more, seeds are kept.
    fn reevaluate_favorites(&mut self, mut prevs: Vec<NodeIdx>) {
        prevs.sort_unstable();
        prevs.dedup();
        for prev in prevs {
            let node = &self.nodes[prev];
            if node.level == 0 || node.fav_bits != 0 || node.kind != NodeKind::Favorite {
                continue;
            }
            let state = node.state;
            self.counters.favorites = self.counters.favorites.saturating_sub(1);
            match state {
                NodeState::InProgress => {
                    self.counters.favorites_in_progress = self.counters.favorites_in_progress.saturating_sub(1)
                }
                NodeState::Finished => {
                    self.counters.favorites_finished = self.counters.favorites_finished.saturating_sub(1)
                }
                NodeState::Untouched => (),
            }
            if let Some(p) = self.favorite_buf.iter().position(|&i| i == prev) {
                self.favorite_buf.remove(p);
                self.regular_buf.push_back(prev);
            }
            if let Some(p) = self.favorite_unfinished_buf.iter().position(|&i| i == prev) {
                self.favorite_unfinished_buf.remove(p);
                self.regular_unfinished_buf.push(prev);
            }
            self.nodes[prev].kind = NodeKind::Regular;
            log::debug!("node {} is no longer a favorite", self.nodes[prev].id);
        }
    }

    fn score(&self, idx: NodeIdx) -> Score {
        let n = &self.nodes[idx];
        if n.performance == 0.0 {
            return (0, 0, 0, 0, 0.0);
        }
        let fast = if 1.0 / n.performance >= 150.0 { 1 } else { 0 };
        (1, fast, n.fav_bits, -(n.level as i64), -n.fav_factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::MethodKind;
    use rand::{prelude::SmallRng, Rng, SeedableRng};

    const SIZE: usize = 1024;

    fn trace(edges: &[usize]) -> Vec<u8> {
        let mut t = vec![VIRGIN; SIZE];
        for &e in edges {
            t[e] = 1;
        }
        t
    }

    fn tree(seeds: Vec<(Vec<u8>, Vec<u8>)>) -> CoverageTree<MemoryStore> {
        let config = TreeConfig {
            bitmap_size: SIZE,
            depth_first: true,
        };
        CoverageTree::new(MemoryStore::default(), config, SmallRng::from_entropy(), seeds).unwrap()
    }

    fn havoc() -> FuzzMethod {
        FuzzMethod::new(MethodKind::Havoc)
    }

    #[test]
    fn new_coverage_accepted() {
        let mut t = tree(Vec::new());
        let ret = t.append(b"payload", &trace(&[100]), havoc(), None, 0.001).unwrap();
        assert!(ret.accepted);
        assert!(ret.coverage.new_bits > 0);
        assert_eq!(t.len(), 1);
        assert_eq!(t.maps().coverage[100], 0x01);
        assert_eq!(t.counters().paths, 1);
        assert_eq!(t.yields().get(MethodKind::Havoc), 1);
    }

    #[test]
    fn duplicate_rejected() {
        let mut t = tree(Vec::new());
        assert!(t.append(b"payload", &trace(&[100]), havoc(), None, 0.001).unwrap().accepted);
        let counters = t.counters();
        let ret = t.append(b"payload", &trace(&[100]), havoc(), None, 0.001).unwrap();
        assert!(!ret.accepted);
        assert_eq!(t.len(), 1);
        assert_eq!(t.counters(), counters);
        // same payload with new coverage is still a duplicate
        assert!(!t.append(b"payload", &trace(&[7]), havoc(), None, 0.001).unwrap().accepted);
    }

    #[test]
    fn crash_dedup() {
        let mut t = tree(Vec::new());
        let crash = trace(&[5, 6]);
        assert!(t.append(b"crash-1", &crash, havoc(), Some(Finding::Crash), 0.0).unwrap().accepted);
        assert!(!t.append(b"crash-2", &crash, havoc(), Some(Finding::Crash), 0.0).unwrap().accepted);
        let c = t.finding_counters();
        assert_eq!(c.total(Finding::Crash), 2);
        assert_eq!(c.unique(Finding::Crash), 1);
        assert_eq!(t.len(), 1);
        // findings are never scheduled and don't touch coverage
        assert!(bitmap::is_empty(&t.maps().coverage));
        assert_eq!(t.get_next(false), None);
    }

    #[test]
    fn finding_categories_are_independent() {
        let mut t = tree(Vec::new());
        let b = trace(&[5]);
        assert!(t.append(b"a", &b, havoc(), Some(Finding::Crash), 0.0).unwrap().accepted);
        assert!(t.append(b"a", &b, havoc(), Some(Finding::Timeout), 0.0).unwrap().accepted);
        assert!(t.append(b"a", &b, havoc(), Some(Finding::Kasan), 0.0).unwrap().accepted);
    }

    #[test]
    fn displacement() {
        let mut t = tree(vec![(b"seed".to_vec(), trace(&[1]))]);
        assert_eq!(t.get_next(false), Some(0));
        // slow node owning 2 and 3
        assert!(t.append(b"slow", &trace(&[2, 3]), havoc(), None, 0.1).unwrap().accepted);
        let slow = 1;
        assert_eq!(t.node(slow).kind, NodeKind::Favorite);
        assert_eq!(t.favorite_owner(2), Some(slow));
        // faster superset takes over every edge
        assert!(t.append(b"fast", &trace(&[2, 3, 4]), havoc(), None, 0.001).unwrap().accepted);
        let fast = 2;
        assert_eq!(t.favorite_owner(2), Some(fast));
        assert_eq!(t.favorite_owner(3), Some(fast));
        assert_eq!(t.node(slow).kind, NodeKind::Regular);
        assert_eq!(t.node(slow).fav_bits, 0);
        assert_eq!(t.node(fast).fav_bits, 3);
    }

    #[test]
    fn equal_factor_keeps_owner() {
        let mut t = tree(Vec::new());
        assert!(t.append(b"aaaa", &trace(&[2]), havoc(), None, 0.01).unwrap().accepted);
        let mut tr = trace(&[2, 3]);
        tr[2] = 2;
        assert!(t.append(b"bbbb", &tr, havoc(), None, 0.01).unwrap().accepted);
        assert_eq!(t.favorite_owner(2), Some(0));
        assert_eq!(t.favorite_owner(3), Some(1));
    }

    #[test]
    fn favorites_invariant() {
        let mut rng = SmallRng::from_entropy();
        let mut t = tree(vec![(b"seed".to_vec(), trace(&[0]))]);
        for i in 0..300_u32 {
            let n = rng.gen_range(1..8);
            let edges: Vec<usize> = (0..n).map(|_| rng.gen_range(0..64)).collect();
            let mut tr = trace(&edges);
            for e in &edges {
                tr[*e] = rng.gen_range(0..40);
            }
            let payload = i.to_le_bytes().repeat(rng.gen_range(1..4));
            t.append(&payload, &tr, havoc(), None, rng.gen_range(0.0001..0.01)).unwrap();
            if rng.gen_ratio(1, 10) {
                t.get_next(rng.gen());
            }
        }

        let mut owned = vec![0; t.len()];
        for edge in 0..SIZE {
            let hit_by: Vec<_> = (0..t.len()).filter(|&i| t.node(i).bits.contains(&(edge as u32))).collect();
            match t.favorite_owner(edge) {
                Some(o) => {
                    assert!(hit_by.contains(&o));
                    owned[o] += 1;
                }
                None => assert!(hit_by.is_empty()),
            }
        }
        for i in 0..t.len() {
            let n = t.node(i);
            assert_eq!(n.fav_bits, owned[i]);
            if n.fav_bits > 0 {
                assert_eq!(n.kind, NodeKind::Favorite);
            } else if n.level > 0 {
                assert_eq!(n.kind, NodeKind::Regular);
            }
        }
    }

    #[test]
    fn coverage_monotonic() {
        let mut rng = SmallRng::from_entropy();
        let mut t = tree(Vec::new());
        for i in 0..200_u32 {
            let before = t.maps().coverage.clone();
            let edges: Vec<usize> = (0..4).map(|_| rng.gen_range(0..SIZE)).collect();
            let prelim = rng.gen_ratio(1, 5);
            if prelim {
                t.toggle_preliminary_mode(true).unwrap();
            }
            t.append(&i.to_le_bytes(), &trace(&edges), havoc(), None, 0.0).unwrap();
            if prelim {
                t.toggle_preliminary_mode(false).unwrap();
            }
            for (b, a) in before.iter().zip(t.maps().coverage.iter()) {
                if *b != VIRGIN {
                    assert_ne!(*a, VIRGIN);
                }
            }
        }
    }

    #[test]
    fn preliminary_rollback() {
        let mut t = tree(vec![(b"seed".to_vec(), trace(&[1]))]);
        assert_eq!(t.toggle_preliminary_mode(true).unwrap(), 0);
        assert!(t.append(b"p1", &trace(&[2]), havoc(), None, 0.0).unwrap().accepted);
        // deduplicated against the moving snapshot inside the burst
        assert!(!t.append(b"p2", &trace(&[2]), havoc(), None, 0.0).unwrap().accepted);
        assert!(t.append(b"c1", &trace(&[9]), havoc(), Some(Finding::Crash), 0.0).unwrap().accepted);
        assert_eq!(t.len(), 1);
        assert_eq!(t.preliminary_nodes().len(), 2);
        assert_eq!(t.toggle_preliminary_mode(false).unwrap(), 2);
        assert_eq!(t.maps().coverage[2], VIRGIN);
        assert_eq!(t.maps().crash[9], VIRGIN);
        // verified replay graduates into the corpus
        assert!(t.append(b"p1", &trace(&[2]), havoc(), None, 0.0).unwrap().accepted);
        assert_eq!(t.len(), 2);
        // entering again drops the stale queue
        t.toggle_preliminary_mode(true).unwrap();
        assert!(t.preliminary_nodes().is_empty());
        assert_eq!(t.store.len(), 2);
    }

    #[test]
    fn traversal_cycles() {
        let seeds = (0..3_u8).map(|i| (vec![i], trace(&[i as usize]))).collect();
        let mut t = tree(seeds);
        let start = t.counters().cycles;
        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(t.get_next(true).unwrap());
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2]);
        assert_eq!(t.counters().cycles, start);
        for _ in 0..10 {
            assert!(t.get_next(true).is_some());
        }
        assert!(t.counters().cycles > start);
        assert_eq!(t.counters().paths_finished, 3);
    }

    #[test]
    fn untouched_children() {
        let mut t = tree(vec![(b"seed".to_vec(), trace(&[1]))]);
        assert_eq!(t.get_next(false), Some(0));
        assert_eq!(t.untouched_nodes(), 0);
        t.append(b"c1", &trace(&[2]), havoc(), None, 0.0).unwrap();
        t.append(b"c2", &trace(&[3]), havoc(), None, 0.0).unwrap();
        assert_eq!(t.untouched_nodes(), 2);
        assert!(t.append(b"c3", &trace(&[4]), havoc(), Some(Finding::Crash), 0.0).unwrap().accepted);
        assert_eq!(t.untouched_nodes(), 3);
        assert_eq!(t.node(1).level, 1);
        assert_eq!(t.max_level(), 1);
    }

    #[test]
    fn covers() {
        let mut a = CorpusNode::new(1, 0, NodeKind::Regular, b"a", &trace(&[1, 2, 3]), havoc(), 0.0);
        let b = CorpusNode::new(2, 0, NodeKind::Regular, b"b", &trace(&[1, 3]), havoc(), 0.0);
        assert!(a.covers(&b));
        assert!(!b.covers(&a));
        a.bits.clear();
        assert!(!a.covers(&b));
        assert!(b.covers(&a));
    }
}
