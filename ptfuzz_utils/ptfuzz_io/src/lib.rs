use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::sleep,
    time::Duration,
};

pub mod thread;

/// Output of a child process collected in the background. Only the most recent
/// `capacity` bytes are kept.
#[derive(Debug, Clone)]
pub struct BackgroundIoHandle {
    buf: Arc<Mutex<Vec<u8>>>,
    finished: Arc<AtomicBool>,
    capacity: usize,
}

impl BackgroundIoHandle {
    fn new(buf: Arc<Mutex<Vec<u8>>>, finished: Arc<AtomicBool>, capacity: usize) -> Self {
        Self {
            buf,
            finished,
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Take the collected data.
    pub fn current_data(&self) -> Vec<u8> {
        let mut buf = self.buf.lock().unwrap();
        buf.split_off(0)
    }

    pub fn clear_current(&self) {
        let mut buf = self.buf.lock().unwrap();
        buf.clear();
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Wait until the writer closed its end, at most `timeout`.
    pub fn wait_finish(self, timeout: Duration) -> Vec<u8> {
        let delta = Duration::from_millis(10);
        let mut waited = Duration::default();
        while !self.is_finished() && waited < timeout {
            sleep(delta);
            waited += delta;
        }
        self.current_data()
    }

    fn append(&self, data: &[u8]) {
        let mut buf = self.buf.lock().unwrap();
        buf.extend_from_slice(data);
        if buf.len() > self.capacity {
            let excess = buf.len() - self.capacity;
            buf.drain(..excess);
        }
    }
}
