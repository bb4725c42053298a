use crate::util::stop_soon;
use serde_derive::Serialize;
use std::{
    collections::VecDeque,
    fs::write,
    io,
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
    thread::sleep,
    time::{Duration, Instant},
};

/// Counters shared by every thread, written by their owners and read by the reporter.
#[derive(Debug)]
pub struct Stats {
    start: Instant,
    execs: AtomicU64,
    workers_ready: AtomicU64,
    vm_restarts: AtomicU64,
    // f64 bits
    performance: AtomicU64,
    ratio_coverage: AtomicU64,
    ratio_bits: AtomicU64,

    paths: AtomicU64,
    paths_pending: AtomicU64,
    paths_unfinished: AtomicU64,
    favorites: AtomicU64,
    fav_pending: AtomicU64,
    fav_unfinished: AtomicU64,
    cycles: AtomicU64,
    level: AtomicU64,
    max_level: AtomicU64,

    crash: AtomicU64,
    crash_unique: AtomicU64,
    kasan: AtomicU64,
    kasan_unique: AtomicU64,
    timeout: AtomicU64,
    timeout_unique: AtomicU64,
    preliminary: AtomicU64,
    imports: AtomicU64,
    last_find: AtomicU64,

    technique: Mutex<&'static str>,
}

impl Default for Stats {
    fn default() -> Self {
        Self {
            start: Instant::now(),
            execs: AtomicU64::default(),
            workers_ready: AtomicU64::default(),
            vm_restarts: AtomicU64::default(),
            performance: AtomicU64::default(),
            ratio_coverage: AtomicU64::default(),
            ratio_bits: AtomicU64::default(),
            paths: AtomicU64::default(),
            paths_pending: AtomicU64::default(),
            paths_unfinished: AtomicU64::default(),
            favorites: AtomicU64::default(),
            fav_pending: AtomicU64::default(),
            fav_unfinished: AtomicU64::default(),
            cycles: AtomicU64::default(),
            level: AtomicU64::new(1),
            max_level: AtomicU64::new(1),
            crash: AtomicU64::default(),
            crash_unique: AtomicU64::default(),
            kasan: AtomicU64::default(),
            kasan_unique: AtomicU64::default(),
            timeout: AtomicU64::default(),
            timeout_unique: AtomicU64::default(),
            preliminary: AtomicU64::default(),
            imports: AtomicU64::default(),
            last_find: AtomicU64::default(),
            technique: Mutex::new("LOADING"),
        }
    }
}

/// Tree numbers pushed by the mapserver.
#[derive(Debug, Clone, Copy, Default)]
pub struct TreeStats {
    pub paths: u64,
    pub paths_pending: u64,
    pub paths_unfinished: u64,
    pub favorites: u64,
    pub fav_pending: u64,
    pub fav_unfinished: u64,
    pub cycles: u64,
    pub ratio_coverage: f64,
    pub ratio_bits: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub runtime: u64,
    pub execs: u64,
    pub performance: f64,
    pub workers_ready: u64,
    pub vm_restarts: u64,
    pub technique: String,
    pub paths: u64,
    pub paths_pending: u64,
    pub paths_unfinished: u64,
    pub favorites: u64,
    pub fav_pending: u64,
    pub fav_unfinished: u64,
    pub cycles: u64,
    pub level: u64,
    pub max_level: u64,
    pub ratio_coverage: f64,
    pub ratio_bits: f64,
    pub crash: u64,
    pub crash_unique: u64,
    pub kasan: u64,
    pub kasan_unique: u64,
    pub timeout: u64,
    pub timeout_unique: u64,
    pub preliminary: u64,
    pub imports: u64,
    pub last_find: u64,
}

#[inline]
fn load_f64(v: &AtomicU64) -> f64 {
    f64::from_bits(v.load(Ordering::Relaxed))
}

#[inline]
fn store_f64(v: &AtomicU64, n: f64) {
    v.store(n.to_bits(), Ordering::Relaxed)
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_execs(&self, n: u64) {
        self.execs.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_workers_ready(&self) {
        self.workers_ready.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_vm_restarts(&self) {
        self.vm_restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_performance(&self, n: f64) {
        store_f64(&self.performance, n);
    }

    pub fn performance(&self) -> f64 {
        load_f64(&self.performance)
    }

    pub fn set_technique(&self, t: &'static str) {
        *self.technique.lock().unwrap() = t;
    }

    pub fn set_tree(&self, t: TreeStats) {
        self.paths.store(t.paths, Ordering::Relaxed);
        self.paths_pending.store(t.paths_pending, Ordering::Relaxed);
        self.paths_unfinished.store(t.paths_unfinished, Ordering::Relaxed);
        self.favorites.store(t.favorites, Ordering::Relaxed);
        self.fav_pending.store(t.fav_pending, Ordering::Relaxed);
        self.fav_unfinished.store(t.fav_unfinished, Ordering::Relaxed);
        self.cycles.store(t.cycles, Ordering::Relaxed);
        store_f64(&self.ratio_coverage, t.ratio_coverage);
        store_f64(&self.ratio_bits, t.ratio_bits);
    }

    pub fn set_level(&self, level: u64) {
        self.level.store(level, Ordering::Relaxed);
        self.max_level.fetch_max(level, Ordering::Relaxed);
    }

    pub fn fav_pending(&self) -> u64 {
        self.fav_pending.load(Ordering::Relaxed)
    }

    pub fn inc_crash(&self, unique: bool) {
        self.crash.fetch_add(1, Ordering::Relaxed);
        if unique {
            self.crash_unique.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn inc_kasan(&self, unique: bool) {
        self.kasan.fetch_add(1, Ordering::Relaxed);
        if unique {
            self.kasan_unique.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn inc_timeout(&self, unique: bool) {
        self.timeout.fetch_add(1, Ordering::Relaxed);
        if unique {
            self.timeout_unique.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn set_preliminary(&self, n: u64) {
        self.preliminary.store(n, Ordering::Relaxed);
    }

    pub fn inc_preliminary(&self) {
        self.preliminary.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_imports(&self) {
        self.imports.fetch_add(1, Ordering::Relaxed);
    }

    pub fn touch_last_find(&self) {
        self.last_find
            .store(self.start.elapsed().as_secs(), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            runtime: self.start.elapsed().as_secs(),
            execs: self.execs.load(Ordering::Relaxed),
            performance: self.performance(),
            workers_ready: self.workers_ready.load(Ordering::Relaxed),
            vm_restarts: self.vm_restarts.load(Ordering::Relaxed),
            technique: self.technique.lock().unwrap().to_string(),
            paths: self.paths.load(Ordering::Relaxed),
            paths_pending: self.paths_pending.load(Ordering::Relaxed),
            paths_unfinished: self.paths_unfinished.load(Ordering::Relaxed),
            favorites: self.favorites.load(Ordering::Relaxed),
            fav_pending: self.fav_pending.load(Ordering::Relaxed),
            fav_unfinished: self.fav_unfinished.load(Ordering::Relaxed),
            cycles: self.cycles.load(Ordering::Relaxed),
            level: self.level.load(Ordering::Relaxed),
            max_level: self.max_level.load(Ordering::Relaxed),
            ratio_coverage: load_f64(&self.ratio_coverage),
            ratio_bits: load_f64(&self.ratio_bits),
            crash: self.crash.load(Ordering::Relaxed),
            crash_unique: self.crash_unique.load(Ordering::Relaxed),
            kasan: self.kasan.load(Ordering::Relaxed),
            kasan_unique: self.kasan_unique.load(Ordering::Relaxed),
            timeout: self.timeout.load(Ordering::Relaxed),
            timeout_unique: self.timeout_unique.load(Ordering::Relaxed),
            preliminary: self.preliminary.load(Ordering::Relaxed),
            imports: self.imports.load(Ordering::Relaxed),
            last_find: self.last_find.load(Ordering::Relaxed),
        }
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        let content = serde_json::to_string_pretty(&self.snapshot())?;
        write(path, content)
    }

    pub fn report(&self, duration: Duration, save_to: Option<&Path>) {
        while !stop_soon() {
            sleep(duration);

            let s = self.snapshot();
            log::info!(
                "{}: exec: {}, {:.0}/s, paths: {} (fav {}), pending {}/{}, cycles: {}, level {}/{}, cov: {:.2}%, crash {}/{}, kasan {}/{}, timeout {}/{}",
                s.technique,
                s.execs,
                s.performance,
                s.paths,
                s.favorites,
                s.fav_pending,
                s.paths_pending,
                s.cycles,
                s.level,
                s.max_level,
                s.ratio_coverage,
                s.crash_unique,
                s.crash,
                s.kasan_unique,
                s.kasan,
                s.timeout_unique,
                s.timeout
            );
            if let Some(p) = save_to {
                if let Err(e) = self.save(p) {
                    log::warn!("failed to save stats: {}", e);
                }
            }
        }
    }
}

/// Mean of the last few execution rate measurements.
#[derive(Debug, Clone)]
pub struct Performance {
    values: VecDeque<f64>,
    limit: usize,
}

impl Default for Performance {
    fn default() -> Self {
        Self::with_limit(5)
    }
}

impl Performance {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            values: VecDeque::with_capacity(limit),
            limit,
        }
    }

    pub fn update(&mut self, execs_per_sec: f64) {
        if self.values.len() == self.limit {
            self.values.pop_front();
        }
        self.values.push_back(execs_per_sec);
    }

    /// Zero before the first measurement.
    pub fn get(&self) -> f64 {
        if self.values.is_empty() {
            0.0
        } else {
            self.values.iter().sum::<f64>() / self.values.len() as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn performance_window() {
        let mut p = Performance::with_limit(2);
        assert_eq!(p.get(), 0.0);
        p.update(10.0);
        p.update(20.0);
        assert_eq!(p.get(), 15.0);
        p.update(40.0);
        assert_eq!(p.get(), 30.0);
    }

    #[test]
    fn snapshot_json() {
        let s = Stats::new();
        s.add_execs(3);
        s.inc_crash(true);
        s.inc_crash(false);
        s.set_level(4);
        s.set_level(2);
        let snap = s.snapshot();
        assert_eq!(snap.crash, 2);
        assert_eq!(snap.crash_unique, 1);
        assert_eq!(snap.max_level, 4);
        let j = serde_json::to_value(&snap).unwrap();
        assert_eq!(j["execs"], 3);
    }
}
