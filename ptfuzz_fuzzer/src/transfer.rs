//! Per-worker transfer slots for bulk payload and bitmap data.
//!
//! Control always travels as messages, the slots only hold the data. Each slot has a
//! lock pair: the worker takes A before writing results and gives B when done, the
//! mapserver takes B before reading and gives A back afterwards.
//!
//! Slots outlive worker respawns, so a lock poisoned by a panicking worker is taken over
//! as is.
use crate::util::stop_soon;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Condvar, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

const WAIT_INTERVAL: Duration = Duration::from_millis(200);

/// Counting semaphore, may be released by a thread other than the acquirer.
#[derive(Debug)]
pub struct Semaphore {
    count: Mutex<usize>,
    cv: Condvar,
}

impl Semaphore {
    pub fn new(count: usize) -> Self {
        Self {
            count: Mutex::new(count),
            cv: Condvar::new(),
        }
    }

    /// Wait for a permit, returns `false` if a stop was requested meanwhile.
    pub fn acquire(&self) -> bool {
        let mut c = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        while *c == 0 {
            if stop_soon() {
                return false;
            }
            c = self
                .cv
                .wait_timeout(c, WAIT_INTERVAL)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        *c -= 1;
        true
    }

    pub fn release(&self) {
        let mut c = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        *c += 1;
        self.cv.notify_one();
    }

    pub fn available(&self) -> usize {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Transfer buffers of one worker.
pub struct TransferSlot {
    /// Guards the result buffers against worker writes.
    pub lock_a: Semaphore,
    /// Given by the worker once results are written.
    pub lock_b: Semaphore,
    master: Mutex<Vec<Vec<u8>>>,
    payloads: Mutex<Vec<Vec<u8>>>,
    bitmaps: Mutex<Vec<Vec<u8>>>,
}

impl TransferSlot {
    pub fn new(tasks: usize, bitmap_size: usize) -> Self {
        Self {
            lock_a: Semaphore::new(1),
            lock_b: Semaphore::new(0),
            master: Mutex::new(vec![Vec::new(); tasks]),
            payloads: Mutex::new(vec![Vec::new(); tasks]),
            bitmaps: Mutex::new(vec![vec![0; bitmap_size]; tasks]),
        }
    }

    /// Payloads of the next job, written by the master.
    pub fn put_tasks(&self, tasks: &[Vec<u8>]) {
        let mut master = self.master.lock().unwrap_or_else(PoisonError::into_inner);
        debug_assert!(tasks.len() <= master.len());
        for (dst, t) in master.iter_mut().zip(tasks) {
            dst.clear();
            dst.extend_from_slice(t);
        }
    }

    pub fn task(&self, i: usize) -> Vec<u8> {
        self.master.lock().unwrap_or_else(PoisonError::into_inner)[i].clone()
    }

    pub fn put_payload(&self, i: usize, payload: &[u8]) {
        let mut payloads = self.payloads.lock().unwrap_or_else(PoisonError::into_inner);
        payloads[i].clear();
        payloads[i].extend_from_slice(payload);
    }

    /// Bitmap buffer `i` for the worker to fill.
    pub fn bitmaps(&self) -> MutexGuard<'_, Vec<Vec<u8>>> {
        self.bitmaps.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Payload and bitmap of entry `i`.
    pub fn result(&self, i: usize) -> (Vec<u8>, Vec<u8>) {
        let payload = self.payloads.lock().unwrap_or_else(PoisonError::into_inner)[i].clone();
        let bitmap = self.bitmaps.lock().unwrap_or_else(PoisonError::into_inner)[i].clone();
        (payload, bitmap)
    }
}

/// State shared by the master, the mapserver and all workers.
pub struct Comm {
    pub slots: Vec<TransferSlot>,
    pub tasks_per_request: usize,
    pub bitmap_size: usize,
    /// Serializes vm boots.
    pub boot_lock: Mutex<()>,
    effector_mode: AtomicBool,
    effector_hash: AtomicU64,
    stage_abortion: AtomicBool,
}

impl Comm {
    pub fn new(workers: usize, tasks_per_request: usize, bitmap_size: usize) -> Self {
        Self {
            slots: (0..workers)
                .map(|_| TransferSlot::new(tasks_per_request, bitmap_size))
                .collect(),
            tasks_per_request,
            bitmap_size,
            boot_lock: Mutex::new(()),
            effector_mode: AtomicBool::new(false),
            effector_hash: AtomicU64::new(0),
            stage_abortion: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn slot(&self, worker: usize) -> &TransferSlot {
        &self.slots[worker]
    }

    /// Hash of the unmodified bitmap while an effector map is being built.
    pub fn effector_hash(&self) -> Option<u64> {
        if self.effector_mode.load(Ordering::Acquire) {
            Some(self.effector_hash.load(Ordering::Acquire))
        } else {
            None
        }
    }

    pub fn enable_effector_mode(&self, hash: u64) {
        self.effector_hash.store(hash, Ordering::Release);
        self.effector_mode.store(true, Ordering::Release);
    }

    pub fn disable_effector_mode(&self) {
        self.effector_mode.store(false, Ordering::Release);
    }

    pub fn stage_aborted(&self) -> bool {
        self.stage_abortion.load(Ordering::Relaxed)
    }

    pub fn set_stage_abortion(&self, abort: bool) {
        self.stage_abortion.store(abort, Ordering::Relaxed);
    }
}
