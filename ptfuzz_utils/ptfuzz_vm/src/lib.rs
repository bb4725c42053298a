//! Launch and supervise QEMU-PT instances.

pub mod qemu;

pub use qemu::{BootError, KaflDevice, QemuConfig, QemuConfigError, QemuHandle};
