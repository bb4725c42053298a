//! Messages exchanged by the master, the mapserver and the workers.
//!
//! Every participant owns one inbound queue. The master has a second queue for
//! replies of workers, so that requests of idle workers never interleave with a reply
//! it is waiting for.
use crate::util::stop_soon;
use ptfuzz_core::{corpus::NodeKind, method::FuzzMethod};
use std::{
    collections::BTreeSet,
    fmt,
    sync::mpsc::{Receiver, RecvTimeoutError},
    time::Duration,
};
use thiserror::Error;

/// Tag of a message, numbered as on the wire of the multi-process layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Tag {
    Req = 0,
    Job = 1,
    Output = 2,
    Start = 3,
    Result = 4,
    NxtFin = 6,
    NxtUnfin = 7,
    UntouchedNodes = 8,
    ReqBitmap = 9,
    ReqEffector = 10,
    GetEffector = 11,
    InitBitmap = 12,
    ReqSampling = 13,
    ReqBenchmark = 14,
    AbortReq = 15,
    ReqRedqueen = 16,
    RedqueenSync = 18,
    ReqBitmapHash = 19,
    ReqPreliminary = 20,
    ReqVerify = 21,
    ReqVerifySync = 22,
    ReqPing = 23,
    UpdateRedqueen = 24,
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, *self as u8)
    }
}

/// Outcome of one job entry, sent to the mapserver.
#[derive(Debug, Clone)]
pub struct FuzzingResult {
    /// Index in the transfer slot of the worker.
    pub slot: usize,
    pub crash: bool,
    pub timeout: bool,
    pub kasan: bool,
    /// Input offsets touched by the mutation, used to build effector maps.
    pub affected_bytes: Vec<usize>,
    pub worker_id: usize,
    /// Seconds the execution took.
    pub performance: f64,
    pub method: FuzzMethod,
    /// `None` if the entry was not executed.
    pub bitmap_hash: Option<u64>,
    /// The vm state was reset after this run.
    pub reloaded: bool,
    /// Payload and bitmap were copied to the transfer slot.
    pub new_bits: bool,
}

impl FuzzingResult {
    /// Result of a job entry skipped because of a stage abortion.
    pub fn aborted(slot: usize, worker_id: usize, affected_bytes: Vec<usize>, method: FuzzMethod) -> Self {
        Self {
            slot,
            crash: false,
            timeout: false,
            kasan: false,
            affected_bytes,
            worker_id,
            performance: 0.0,
            method,
            bitmap_hash: None,
            reloaded: false,
            new_bits: false,
        }
    }
}

/// Master to worker.
#[derive(Debug, Clone)]
pub enum WorkerMsg {
    /// Payloads are in the master slot of the worker, one method and affected byte
    /// list per payload.
    Job {
        methods: Vec<FuzzMethod>,
        affected: Vec<Vec<usize>>,
    },
    ReqBitmap(Vec<u8>),
    ReqBitmapHash(Vec<u8>),
    ReqSampling { payload: Vec<u8>, runs: usize },
    ReqBenchmark { payload: Vec<u8>, runs: usize },
    ReqRedqueen(Vec<u8>),
    /// Payload is in slot 0 of the master slot.
    ReqVerify {
        method: FuzzMethod,
        hash_addrs: BTreeSet<u64>,
    },
    ReqPing,
    UpdateRedqueen,
    Shutdown,
}

impl WorkerMsg {
    pub fn tag(&self) -> Option<Tag> {
        Some(match self {
            WorkerMsg::Job { .. } => Tag::Job,
            WorkerMsg::ReqBitmap(_) => Tag::ReqBitmap,
            WorkerMsg::ReqBitmapHash(_) => Tag::ReqBitmapHash,
            WorkerMsg::ReqSampling { .. } => Tag::ReqSampling,
            WorkerMsg::ReqBenchmark { .. } => Tag::ReqBenchmark,
            WorkerMsg::ReqRedqueen(_) => Tag::ReqRedqueen,
            WorkerMsg::ReqVerify { .. } => Tag::ReqVerify,
            WorkerMsg::ReqPing => Tag::ReqPing,
            WorkerMsg::UpdateRedqueen => Tag::UpdateRedqueen,
            WorkerMsg::Shutdown => return None,
        })
    }
}

/// Worker to master, unsolicited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterMsg {
    Start(usize),
    /// The worker is idle and waits for a job.
    Req(usize),
    Ping(usize),
    UpdateRedqueen(usize),
    /// The worker gave up, its vm could not be respawned.
    AbortReq(usize),
}

impl MasterMsg {
    pub fn tag(&self) -> Tag {
        match self {
            MasterMsg::Start(_) => Tag::Start,
            MasterMsg::Req(_) => Tag::Req,
            MasterMsg::Ping(_) => Tag::ReqPing,
            MasterMsg::UpdateRedqueen(_) => Tag::UpdateRedqueen,
            MasterMsg::AbortReq(_) => Tag::AbortReq,
        }
    }

    pub fn source(&self) -> usize {
        match *self {
            MasterMsg::Start(id)
            | MasterMsg::Req(id)
            | MasterMsg::Ping(id)
            | MasterMsg::UpdateRedqueen(id)
            | MasterMsg::AbortReq(id) => id,
        }
    }
}

/// Worker to master, answering a request.
#[derive(Debug, Clone)]
pub enum WorkerReply {
    Bitmap(Vec<u8>),
    BitmapHash(Option<u64>),
    Sampling(Vec<u8>),
    Benchmark,
    Redqueen(bool),
}

impl WorkerReply {
    pub fn tag(&self) -> Tag {
        match self {
            WorkerReply::Bitmap(_) => Tag::ReqBitmap,
            WorkerReply::BitmapHash(_) => Tag::ReqBitmapHash,
            WorkerReply::Sampling(_) => Tag::ReqSampling,
            WorkerReply::Benchmark => Tag::ReqBenchmark,
            WorkerReply::Redqueen(_) => Tag::ReqRedqueen,
        }
    }
}

/// Round counts are the number of job entries the master dispatched.
#[derive(Debug, Clone)]
pub enum MapserverMsg {
    Result {
        source: usize,
        results: Vec<FuzzingResult>,
    },
    /// Seeds with their bitmaps.
    InitBitmap(Vec<(Vec<u8>, Vec<u8>)>),
    NxtFin { rounds: u64, performance: f64 },
    NxtUnfin { rounds: u64, performance: f64 },
    UntouchedNodes(u64),
    /// Bitmap of the unmodified payload.
    ReqEffector(Vec<u8>),
    GetEffector(u64),
    RedqueenSync(u64),
    ReqPreliminary(bool),
    ReqVerifySync(u64),
    Shutdown,
}

impl MapserverMsg {
    pub fn tag(&self) -> Option<Tag> {
        Some(match self {
            MapserverMsg::Result { .. } => Tag::Result,
            MapserverMsg::InitBitmap(_) => Tag::InitBitmap,
            MapserverMsg::NxtFin { .. } => Tag::NxtFin,
            MapserverMsg::NxtUnfin { .. } => Tag::NxtUnfin,
            MapserverMsg::UntouchedNodes(_) => Tag::UntouchedNodes,
            MapserverMsg::ReqEffector(_) => Tag::ReqEffector,
            MapserverMsg::GetEffector(_) => Tag::GetEffector,
            MapserverMsg::RedqueenSync(_) => Tag::RedqueenSync,
            MapserverMsg::ReqPreliminary(_) => Tag::ReqPreliminary,
            MapserverMsg::ReqVerifySync(_) => Tag::ReqVerifySync,
            MapserverMsg::Shutdown => return None,
        })
    }
}

/// Node handed to the master for the next round.
#[derive(Debug, Clone)]
pub struct NextNode {
    pub id: u64,
    pub kind: NodeKind,
    pub level: usize,
    pub payload: Vec<u8>,
}

/// Mapserver to master.
#[derive(Debug, Clone)]
pub enum MapserverReply {
    /// `unfinished` is set if the node was fuzzed before, deterministic stages are
    /// skipped then.
    Next { node: NextNode, unfinished: bool },
    UntouchedNodes(usize),
    Effector(Vec<bool>),
    RedqueenSync,
    Preliminary(usize),
    VerifySync,
}

impl MapserverReply {
    pub fn tag(&self) -> Tag {
        match self {
            MapserverReply::Next { unfinished: true, .. } => Tag::NxtUnfin,
            MapserverReply::Next { unfinished: false, .. } => Tag::NxtFin,
            MapserverReply::UntouchedNodes(_) => Tag::UntouchedNodes,
            MapserverReply::Effector(_) => Tag::GetEffector,
            MapserverReply::RedqueenSync => Tag::RedqueenSync,
            MapserverReply::Preliminary(_) => Tag::ReqPreliminary,
            MapserverReply::VerifySync => Tag::ReqVerifySync,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("stop requested")]
    Stopped,
    #[error("peer disconnected")]
    Disconnected,
}

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Blocking receive that gives up once a stop is requested.
pub fn recv<T>(rx: &Receiver<T>) -> Result<T, QueueError> {
    loop {
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(m) => return Ok(m),
            Err(RecvTimeoutError::Timeout) => {
                if stop_soon() {
                    return Err(QueueError::Stopped);
                }
            }
            Err(RecvTimeoutError::Disconnected) => return Err(QueueError::Disconnected),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;

    #[test]
    fn recv_disconnected() {
        let (tx, rx) = channel::<u32>();
        tx.send(1).unwrap();
        drop(tx);
        assert_eq!(recv(&rx), Ok(1));
        assert_eq!(recv(&rx), Err(QueueError::Disconnected));
    }

    #[test]
    fn tag_numbers() {
        assert_eq!(Tag::Result as u8, 4);
        assert_eq!(Tag::UpdateRedqueen as u8, 24);
        let r = MapserverReply::Next {
            node: NextNode {
                id: 1,
                kind: NodeKind::Favorite,
                level: 0,
                payload: Vec::new(),
            },
            unfinished: true,
        };
        assert_eq!(r.tag(), Tag::NxtUnfin);
    }
}
