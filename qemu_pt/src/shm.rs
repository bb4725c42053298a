//! Memory regions shared with QEMU-PT.
use bytes::BufMut;
use ptfuzz_core::{bitmap::VIRGIN, MAX_PAYLOAD_SIZE};
use shared_memory::{Shmem, ShmemConf, ShmemError};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Size of the region the agent binary is copied into.
pub const BINARY_REGION_SIZE: usize = 128 << 20;
/// Size of the payload region, payload is prefixed with its length.
pub const PAYLOAD_REGION_SIZE: usize = 128 << 10;

#[derive(Debug, Error)]
pub enum ShmError {
    #[error("failed to use shm: {0}")]
    Shm(#[from] ShmemError),
    #[error("region too small: {need} > {size}")]
    TooSmall { need: usize, size: usize },
}

pub fn binary_shm_id(id: usize) -> String {
    format!("/kafl_qemu_binary_{}", id)
}

pub fn payload_shm_id(id: usize) -> String {
    format!("/kafl_qemu_payload_{}", id)
}

pub fn bitmap_shm_id(id: usize) -> String {
    format!("/kafl_bitmap_{}", id)
}

pub fn control_path<P: AsRef<Path>>(work_dir: P, id: usize) -> PathBuf {
    work_dir.as_ref().join(format!("kafl_qemu_control_{}", id))
}

/// A shared memory mapping, or plain memory when no VM is attached.
pub enum Region {
    Shm(Shmem),
    Mem(Box<[u8]>),
}

impl Region {
    /// Create or reuse the mapping `os_id`, the mapping is removed on drop.
    pub fn create(os_id: &str, size: usize) -> Result<Self, ShmError> {
        let shm = match ShmemConf::new().os_id(os_id).size(size).create() {
            Ok(mut shm) => {
                shm.set_owner(true);
                shm
            }
            Err(ShmemError::MappingIdExists) => {
                let mut shm = ShmemConf::new().os_id(os_id).size(size).open()?;
                shm.set_owner(true);
                shm
            }
            Err(e) => return Err(e.into()),
        };
        if shm.len() < size {
            return Err(ShmError::TooSmall {
                need: size,
                size: shm.len(),
            });
        }
        Ok(Region::Shm(shm))
    }

    pub fn in_memory(size: usize) -> Self {
        Region::Mem(vec![0; size].into_boxed_slice())
    }

    pub fn as_slice(&self) -> &[u8] {
        match self {
            Region::Shm(shm) => unsafe { shm.as_slice() },
            Region::Mem(m) => m,
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            Region::Shm(shm) => unsafe { shm.as_slice_mut() },
            Region::Mem(m) => m,
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Regions of one VM instance.
pub struct VmRegions {
    pub binary: Region,
    pub payload: Region,
    pub bitmap: Region,
}

impl VmRegions {
    pub fn create(id: usize, bitmap_size: usize) -> Result<Self, ShmError> {
        Ok(Self {
            binary: Region::create(&binary_shm_id(id), BINARY_REGION_SIZE)?,
            payload: Region::create(&payload_shm_id(id), PAYLOAD_REGION_SIZE)?,
            bitmap: Region::create(&bitmap_shm_id(id), bitmap_size)?,
        })
    }

    pub fn in_memory(bitmap_size: usize) -> Self {
        Self {
            binary: Region::in_memory(BINARY_REGION_SIZE),
            payload: Region::in_memory(PAYLOAD_REGION_SIZE),
            bitmap: Region::in_memory(bitmap_size),
        }
    }

    /// Copy the agent executable to the binary region.
    pub fn set_binary(&mut self, agent: &[u8]) -> Result<(), ShmError> {
        let region = self.binary.as_mut_slice();
        if agent.len() > region.len() {
            return Err(ShmError::TooSmall {
                need: agent.len(),
                size: region.len(),
            });
        }
        region[..agent.len()].copy_from_slice(agent);
        region[agent.len()..].iter_mut().for_each(|b| *b = 0);
        Ok(())
    }

    /// Write `payload` prefixed by its length, payload must fit in [`MAX_PAYLOAD_SIZE`].
    pub fn set_payload(&mut self, payload: &[u8]) {
        debug_assert!(payload.len() <= MAX_PAYLOAD_SIZE);
        let mut buf = self.payload.as_mut_slice();
        buf.put_u32_le(payload.len() as u32);
        buf.put_slice(payload);
    }

    /// Overwrite the length prefix only.
    pub fn set_payload_size(&mut self, size: usize) {
        let mut buf = self.payload.as_mut_slice();
        buf.put_u32_le(size as u32);
    }

    /// Payload currently in the region.
    pub fn payload(&self) -> &[u8] {
        let region = self.payload.as_slice();
        let mut len = [0; 4];
        len.copy_from_slice(&region[..4]);
        let len = (u32::from_le_bytes(len) as usize).min(MAX_PAYLOAD_SIZE);
        &region[4..4 + len]
    }

    pub fn clear_bitmap(&mut self) {
        self.bitmap.as_mut_slice().iter_mut().for_each(|b| *b = VIRGIN);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_prefix() {
        let mut r = VmRegions::in_memory(64);
        r.set_payload(b"hello");
        assert_eq!(&r.payload.as_slice()[..4], &5_u32.to_le_bytes());
        assert_eq!(r.payload(), b"hello");
        r.set_payload_size(2);
        assert_eq!(r.payload(), b"he");
    }

    #[test]
    fn binary_is_zero_padded() {
        let mut r = VmRegions::in_memory(64);
        r.set_binary(&[0xaa; 16]).unwrap();
        r.set_binary(&[0xbb; 4]).unwrap();
        assert_eq!(&r.binary.as_slice()[..4], &[0xbb; 4]);
        assert!(r.binary.as_slice()[4..32].iter().all(|&b| b == 0));
    }
}
