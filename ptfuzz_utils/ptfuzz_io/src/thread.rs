use crate::BackgroundIoHandle;
use std::{
    fs::File,
    io::Read,
    os::unix::prelude::{FromRawFd, IntoRawFd},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

/// Default number of bytes kept per stream.
pub const DEFAULT_CAPACITY: usize = 1 << 20;

pub fn read_background<T: IntoRawFd>(f: T) -> BackgroundIoHandle {
    read_background_bounded(f, DEFAULT_CAPACITY)
}

pub fn read_background_bounded<T: IntoRawFd>(f: T, capacity: usize) -> BackgroundIoHandle {
    let fd = f.into_raw_fd();
    let mut f = unsafe { File::from_raw_fd(fd) };
    let buf = Arc::new(Mutex::new(Vec::with_capacity(4096.min(capacity))));
    let finished = Arc::new(AtomicBool::new(false));
    let handle = BackgroundIoHandle::new(buf, finished, capacity);
    let writer = handle.clone();

    std::thread::spawn(move || {
        let mut buf = vec![0_u8; 1024 * 16].into_boxed_slice();
        while let Ok(sz) = f.read(&mut buf[..]) {
            if sz == 0 {
                break;
            }
            writer.append(&buf[..sz]);
        }
        writer.finished.store(true, Ordering::Release);
    });

    handle
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{io::Write, os::unix::net::UnixStream, time::Duration};

    #[test]
    fn keeps_tail() {
        let (mut w, r) = UnixStream::pair().unwrap();
        let h = read_background_bounded(r, 4);
        w.write_all(b"qemu-pt").unwrap();
        drop(w);
        assert_eq!(h.wait_finish(Duration::from_secs(5)), b"u-pt");
    }
}
