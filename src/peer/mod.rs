//! Peer directory and per-peer connection pooling.

pub mod directory;
pub mod pool;

pub use directory::{Compatibility, PeerDirectory, PeerInfo};
pub use pool::ConnectionPool;
