//! Shrink a payload while its bitmap stays the same.

/// Max number of trial executions.
pub const MAX_EXECS: usize = 16;
/// Max number of shrinking rounds.
pub const MAX_ROUNDS: usize = 32;
/// Payloads not larger than this are left alone.
pub const MIN_SIZE: usize = 32;
/// Slack added after trimming.
pub const APPEND_BYTES: usize = 16;

const POW2_VALUES: [usize; 16] = [
    1, 2, 4, 8, 16, 32, 64, 128, 256, 512, 1024, 2048, 4096, 8192, 16384, 32768,
];

/// Payload under trimming, the payload itself lives in the target.
pub trait TrimTarget {
    type Error;

    /// Execute the current payload, returning its bitmap.
    fn run(&mut self) -> Result<Vec<u8>, Self::Error>;

    /// Truncate the payload to `size` bytes.
    fn resize(&mut self, size: usize) -> Result<(), Self::Error>;

    /// Whether the last run crashed, timed out or was reported by the sanitizer.
    fn faulted(&self) -> bool;
}

/// Index of the largest power of two not larger than `value`.
fn pow2_index(value: usize) -> usize {
    POW2_VALUES
        .iter()
        .rposition(|&v| v <= value)
        .unwrap_or(0)
}

/// Binary-search shrink, returns the final payload size.
pub fn perform_trim<T: TrimTarget>(size: usize, target: &mut T) -> Result<usize, T::Error> {
    if size <= MIN_SIZE {
        return Ok(size);
    }

    let bitmap = target.run()?;
    if target.faulted() {
        return Ok(size);
    }

    let mut execs = 0;
    let mut new_size = size;
    for _ in 0..MAX_ROUNDS {
        let mut abort = true;
        for &step in POW2_VALUES[..=pow2_index(new_size)].iter().rev() {
            if step >= new_size {
                continue;
            }
            execs += 1;
            if execs == MAX_EXECS {
                abort = true;
                break;
            }

            target.resize(new_size - step)?;
            let new_bitmap = target.run()?;
            if target.faulted() {
                return Ok(new_size);
            }
            if bitmap == new_bitmap {
                new_size -= step;
                abort = false;
                break;
            }
            if new_size <= MIN_SIZE {
                break;
            }
        }
        if abort {
            break;
        }
    }

    let new_size = (new_size.max(MIN_SIZE) + APPEND_BYTES).min(size);
    target.resize(new_size)?;
    Ok(new_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{prelude::SmallRng, Rng, SeedableRng};

    /// Bitmap depends on the first `relevant` bytes only.
    struct Fake {
        payload: Vec<u8>,
        size: usize,
        relevant: usize,
        runs: usize,
        crash_at: Option<usize>,
        crashed: bool,
    }

    impl Fake {
        fn new(payload: Vec<u8>, relevant: usize) -> Self {
            let size = payload.len();
            Self {
                payload,
                size,
                relevant,
                runs: 0,
                crash_at: None,
                crashed: false,
            }
        }
    }

    impl TrimTarget for Fake {
        type Error = ();

        fn run(&mut self) -> Result<Vec<u8>, ()> {
            self.runs += 1;
            self.crashed = self.crash_at == Some(self.runs);
            let n = self.size.min(self.relevant);
            let mut bitmap = vec![0xff; 64];
            for (i, b) in self.payload[..n].iter().enumerate() {
                bitmap[i % 64] ^= *b;
            }
            bitmap[63] = n as u8;
            Ok(bitmap)
        }

        fn resize(&mut self, size: usize) -> Result<(), ()> {
            self.size = size;
            Ok(())
        }

        fn faulted(&self) -> bool {
            self.crashed
        }
    }

    #[test]
    fn trim_converges() {
        let mut rng = SmallRng::from_entropy();
        let payload: Vec<u8> = (0..2048).map(|_| rng.gen()).collect();
        let mut target = Fake::new(payload, 64);
        let size = perform_trim(2048, &mut target).unwrap();
        assert!((64..=64 + APPEND_BYTES).contains(&size), "{}", size);
        assert_eq!(target.size, size);
        assert!(target.runs <= MAX_EXECS);
    }

    #[test]
    fn small_payload_untouched() {
        let mut target = Fake::new(vec![1; MIN_SIZE], 4);
        assert_eq!(perform_trim(MIN_SIZE, &mut target).unwrap(), MIN_SIZE);
        assert_eq!(target.runs, 0);
    }

    #[test]
    fn fault_stops_trim() {
        let mut target = Fake::new(vec![7; 1024], 10);
        target.crash_at = Some(1);
        assert_eq!(perform_trim(1024, &mut target).unwrap(), 1024);

        let mut target = Fake::new(vec![7; 1024], 10);
        target.crash_at = Some(3);
        let size = perform_trim(1024, &mut target).unwrap();
        assert_eq!(size, 512);
        assert_eq!(target.runs, 3);
    }

    #[test]
    fn never_grows() {
        let mut target = Fake::new(vec![3; 40], 40);
        let size = perform_trim(40, &mut target).unwrap();
        assert!(size <= 40);
    }
}
