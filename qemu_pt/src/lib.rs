//! Execution channel to QEMU-PT: control protocol, shared memory regions and Redqueen
//! support files.

use ahash::{AHashMap, AHashSet};

pub mod channel;
pub mod hash_fix;
pub mod lookup;
pub mod protocol;
pub mod redqueen;
pub mod shm;

pub use channel::{ChannelConfig, ChannelError, ChannelState, RunOutcome, VmChannel, VmState};
pub use lookup::LookupSet;
pub use shm::VmRegions;

pub type HashMap<K, V> = AHashMap<K, V>;
pub type HashSet<V> = AHashSet<V>;
