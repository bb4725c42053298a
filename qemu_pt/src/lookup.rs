//! Hashes of bitmaps already reported by any worker.
use crate::HashSet;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

#[derive(Default)]
struct Inner {
    non_finding: Mutex<HashSet<u64>>,
    preliminary: Mutex<HashSet<u64>>,
    preliminary_mode: AtomicBool,
}

/// Bitmap hash set shared by all workers. In preliminary mode hashes go to an overlay
/// that is discarded when the mode ends.
#[derive(Clone, Default)]
pub struct LookupSet {
    inner: Arc<Inner>,
}

impl LookupSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn active(&self) -> &Mutex<HashSet<u64>> {
        if self.inner.preliminary_mode.load(Ordering::Acquire) {
            &self.inner.preliminary
        } else {
            &self.inner.non_finding
        }
    }

    pub fn insert(&self, hash: u64) {
        self.active().lock().unwrap().insert(hash);
    }

    pub fn contains(&self, hash: u64) -> bool {
        self.active().lock().unwrap().contains(&hash)
    }

    pub fn enable_preliminary_mode(&self) {
        self.inner.preliminary_mode.store(true, Ordering::Release);
    }

    pub fn disable_preliminary_mode(&self) {
        self.inner.preliminary.lock().unwrap().clear();
        self.inner.preliminary_mode.store(false, Ordering::Release);
    }

    pub fn is_preliminary(&self) -> bool {
        self.inner.preliminary_mode.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_is_discarded() {
        let l = LookupSet::new();
        l.insert(1);
        l.enable_preliminary_mode();
        assert!(!l.contains(1));
        l.insert(2);
        assert!(l.contains(2));
        let other = l.clone();
        assert!(other.contains(2));
        l.disable_preliminary_mode();
        assert!(other.contains(1));
        assert!(!other.contains(2));
        l.enable_preliminary_mode();
        assert!(!l.contains(2));
    }
}
