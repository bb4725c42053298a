//! Mutations from an external radamsa process serving candidates over TCP.
use ptfuzz_core::RngType;
use rand::seq::SliceRandom;
use std::{
    io::{self, Read},
    net::TcpStream,
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    thread::sleep,
    time::Duration,
};

pub const RADAMSA_PORT: u16 = 21337;
/// Share of the havoc budget given to radamsa.
pub const RADAMSA_DIV: usize = 10;
const LAST_N: usize = 5;
const RAND_N: usize = 5;
const READ_MAX: usize = 65530;
const PAYLOAD_MAX: usize = 2 << 10;
const CONNECT_RETRY: usize = 100;

/// The most recent corpus files plus a few random older ones.
pub fn pick_samples(mut files: Vec<PathBuf>, rng: &mut RngType) -> Vec<PathBuf> {
    files.sort();
    let split = files.len().saturating_sub(LAST_N);
    let (old, recent) = files.split_at(split);
    let mut samples = recent.to_vec();
    samples.extend(old.choose_multiple(rng, RAND_N).cloned());
    samples
}

struct Server(Child);

impl Drop for Server {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

fn fetch() -> io::Result<Vec<u8>> {
    let s = TcpStream::connect(("127.0.0.1", RADAMSA_PORT))?;
    let mut buf = Vec::new();
    s.take(READ_MAX as u64).read_to_end(&mut buf)?;
    Ok(buf)
}

fn wait_ready(server: &mut Server) -> io::Result<()> {
    for _ in 0..CONNECT_RETRY {
        if let Some(status) = server.0.try_wait()? {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("radamsa exited: {}", status),
            ));
        }
        if TcpStream::connect(("127.0.0.1", RADAMSA_PORT)).is_ok() {
            return Ok(());
        }
        sleep(Duration::from_millis(100));
    }
    Err(io::Error::new(io::ErrorKind::TimedOut, "radamsa not reachable"))
}

/// Emit `iterations` radamsa outputs seeded from `samples`. An empty output emits
/// `data` unchanged.
pub fn mutate(
    radamsa: &Path,
    samples: &[PathBuf],
    data: &[u8],
    iterations: usize,
    mut emit: impl FnMut(&[u8]),
) -> io::Result<()> {
    if samples.is_empty() {
        return Ok(());
    }
    let child = Command::new(radamsa)
        .arg("-o")
        .arg(format!(":{}", RADAMSA_PORT))
        .arg("-n")
        .arg("inf")
        .args(samples)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;
    let mut server = Server(child);
    wait_ready(&mut server)?;

    for _ in 0..iterations {
        let mut payload = fetch()?;
        if payload.is_empty() {
            emit(data);
        } else {
            payload.truncate(PAYLOAD_MAX);
            emit(&payload);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn samples_prefer_recent() {
        let mut rng = RngType::from_entropy();
        let files: Vec<PathBuf> = (0..20)
            .rev()
            .map(|i| PathBuf::from(format!("payload_{:05}", i)))
            .collect();
        let s = pick_samples(files, &mut rng);
        assert_eq!(s.len(), LAST_N + RAND_N);
        assert_eq!(s[0], PathBuf::from("payload_00015"));
        assert_eq!(s[LAST_N - 1], PathBuf::from("payload_00019"));
        assert!(s[LAST_N..].iter().all(|p| p < &PathBuf::from("payload_00015")));

        let few = pick_samples(vec![PathBuf::from("a")], &mut rng);
        assert_eq!(few, vec![PathBuf::from("a")]);
    }

    #[test]
    fn no_samples_no_process() {
        let mut n = 0;
        mutate(Path::new("/nonexistent/radamsa"), &[], b"x", 10, |_| n += 1).unwrap();
        assert_eq!(n, 0);
    }
}
