//! Core algorithms and data structures of ptfuzz

use ahash::{AHashMap, AHashSet};

pub mod bitmap;
pub mod colorize;
pub mod corpus;
pub mod method;
pub mod mutation;
pub mod redqueen;
pub mod trim;

pub type HashMap<K, V> = AHashMap<K, V>;
pub type HashSet<V> = AHashSet<V>;
pub type RngType = rand::rngs::SmallRng;

/// Max length of a payload that can be delivered to the target.
pub const MAX_PAYLOAD_SIZE: usize = 64 << 10;
