//! Chunk store and file mirror: the content-addressable heart of the node.
//!
//! Composed of four pieces that share one [`Mirror`] and [`ChunkIndex`]:
//! the mirror itself (tree + root management), the background
//! [`hasher::HashingWorker`], the per-root [`watcher`], and [`scan`]'s BFS
//! diffing. See `crate::chunk::service::ChunkService` for how they're wired
//! together into one long-lived component.

pub mod cache;
pub mod hasher;
pub mod mirror;
pub mod scan;
pub mod service;
pub mod store;

pub use cache::FileCache;
pub use mirror::Mirror;
pub use store::ChunkIndex;
