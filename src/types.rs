//! Core data model shared by every subsystem: chunks, the mirror's entries,
//! shared roots, and peer identity.

use std::fmt;
use std::path::PathBuf;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::CHUNK_SIZE;

/// A chunk's content digest. `blake3` gives us a 256-bit digest at a fraction
/// of the cost of the original's SHA-1, and is already the teacher's choice
/// for content hashing (see `util::hash`).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Digest(pub [u8; 32]);

impl Digest {
    pub fn of(bytes: &[u8]) -> Self {
        Digest(*blake3::hash(bytes).as_bytes())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({}…)", &self.to_hex()[..8])
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Stable peer identity, carried in every presence beacon and wire frame.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(pub [u8; 20]);

impl PeerId {
    pub fn generate() -> Self {
        let uuid = Uuid::new_v4();
        let mut bytes = [0u8; 20];
        bytes[..16].copy_from_slice(uuid.as_bytes());
        PeerId(bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({}…)", &self.to_hex()[..8])
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// A fixed-size region of a file: the unit of transfer and hashing.
///
/// `known_bytes == CHUNK_SIZE` (or the short size of a file's last chunk)
/// means the chunk is fully populated and immutable; its `digest` is then
/// always `Some`. A chunk with fewer known bytes is partial: reading past
/// `known_bytes` is an error (see [`crate::error::ChunkError::NotFullyKnown`]).
#[derive(Debug, Clone)]
pub struct Chunk {
    pub num: u32,
    pub size: u32,
    pub known_bytes: u32,
    pub digest: Option<Digest>,
}

impl Chunk {
    pub fn new(num: u32, size: u32) -> Self {
        Self { num, size, known_bytes: 0, digest: None }
    }

    pub fn restored(num: u32, size: u32, digest: Digest) -> Self {
        Self { num, size, known_bytes: size, digest: Some(digest) }
    }

    pub fn is_complete(&self) -> bool {
        self.known_bytes == self.size
    }
}

/// Compute the chunk layout for a file of `size` bytes: the ordered list of
/// `(chunk_num, chunk_size)` pairs, per spec invariant 2 — their concatenation
/// covers `[0, size)` with exactly `ceil(size / CHUNK_SIZE)` entries.
pub fn chunk_layout(size: u64) -> Vec<(u32, u32)> {
    if size == 0 {
        return vec![(0, 0)];
    }
    let mut layout = Vec::new();
    let mut remaining = size;
    let mut num = 0u32;
    while remaining > 0 {
        let this_size = remaining.min(CHUNK_SIZE) as u32;
        layout.push((num, this_size));
        remaining -= this_size as u64;
        num += 1;
    }
    layout
}

/// Shared-root identity: persists across restarts so caches and queue
/// entries can outlive a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RootId(pub Uuid);

impl RootId {
    pub fn generate() -> Self {
        RootId(Uuid::new_v4())
    }
}

/// Whether a shared root accepts new downloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RootAccess {
    ReadOnly,
    ReadWrite,
}

/// A shared directory root: absolute path, persistent ID, and access mode.
/// Invariant: no shared root is a proper prefix of another — nested roots
/// are merged into the outer one on [`crate::chunk::mirror::Mirror::add_root`].
#[derive(Debug, Clone)]
pub struct SharedRoot {
    pub id: RootId,
    pub path: PathBuf,
    pub access: RootAccess,
}

/// Polymorphic entry kind. Rather than an inheritance hierarchy, the mirror
/// models "file or directory" as a tagged variant sharing one `Entry` core
/// (parent, name, size) — see design notes on polymorphic entries.
#[derive(Debug, Clone)]
pub enum EntryKind {
    File { chunks: Vec<Chunk>, unfinished: bool },
    Directory { children: Vec<EntryId> },
}

/// Opaque handle into a [`crate::chunk::mirror::Mirror`]'s entry arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId(pub u64);

/// One node of the mirror tree.
#[derive(Debug, Clone)]
pub struct Entry {
    pub id: EntryId,
    pub parent: Option<EntryId>,
    pub root: RootId,
    pub name: String,
    pub size: u64,
    pub modified: SystemTime,
    pub kind: EntryKind,
    pub scanned: bool,
}

impl Entry {
    pub fn is_complete(&self) -> bool {
        match &self.kind {
            EntryKind::File { chunks, .. } => chunks.iter().all(Chunk::is_complete),
            EntryKind::Directory { .. } => true,
        }
    }

    pub fn has_all_hashes(&self) -> bool {
        match &self.kind {
            EntryKind::File { chunks, .. } => chunks.iter().all(|c| c.digest.is_some()),
            EntryKind::Directory { .. } => true,
        }
    }
}

/// On-the-wire representation of a file entry, exchanged via `GET_ENTRIES`
/// and used to materialize new download targets. Distinct from [`Entry`]
/// because the wire form never carries local-only state (the mirror id,
/// `scanned` flag, partial `known_bytes`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedEntryWire {
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
    pub modified_unix: i64,
    pub chunk_digests: Vec<Digest>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_layout_exact_multiple() {
        let layout = chunk_layout(CHUNK_SIZE * 3);
        assert_eq!(layout.len(), 3);
        assert!(layout.iter().all(|&(_, size)| size as u64 == CHUNK_SIZE));
    }

    #[test]
    fn chunk_layout_with_short_tail() {
        let layout = chunk_layout(CHUNK_SIZE * 2 + 100);
        assert_eq!(layout.len(), 3);
        assert_eq!(layout[2].1, 100);
    }

    #[test]
    fn chunk_layout_empty_file_has_one_zero_chunk() {
        let layout = chunk_layout(0);
        assert_eq!(layout, vec![(0, 0)]);
    }

    #[test]
    fn digest_hex_round_trips() {
        let d = Digest::of(b"hello world");
        let hex = d.to_hex();
        assert_eq!(hex.len(), 64);
    }
}
