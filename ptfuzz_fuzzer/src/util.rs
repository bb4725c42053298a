use std::{
    sync::atomic::{AtomicBool, Ordering},
    thread::sleep,
    time::Duration,
};

static STOP_SOON: AtomicBool = AtomicBool::new(false);

pub fn stop_soon() -> bool {
    STOP_SOON.load(Ordering::Relaxed)
}

pub fn stop_req() {
    STOP_SOON.store(true, Ordering::Relaxed)
}

/// Max attempts of [`retry_exec`].
pub const RETRY_TIMES: usize = 3;
const RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// Call `f` until it succeeds, at most [`RETRY_TIMES`] times. Gives up early once a
/// stop is requested, returning the last error.
pub fn retry_exec<T, E, F>(mut f: F) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
    E: std::fmt::Display,
{
    let mut i = 0;
    loop {
        match f() {
            Ok(v) => return Ok(v),
            Err(e) => {
                i += 1;
                if i >= RETRY_TIMES || stop_soon() {
                    return Err(e);
                }
                log::warn!("retry {}/{}: {}", i, RETRY_TIMES, e);
                sleep(RETRY_INTERVAL);
            }
        }
    }
}
