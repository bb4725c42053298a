pub mod state;
pub mod workdir;

pub use state::RedqueenState;
pub use workdir::RedqueenWorkdir;
