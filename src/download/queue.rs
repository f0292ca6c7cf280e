//! Download queue: a user-ordered list of [`Download`]s, each carrying a
//! per-chunk sub-state-machine, persisted to `FILE_QUEUE` every
//! `save_queue_period`.
//!
//! What's persisted is deliberately narrower than the runtime [`Download`]:
//! an `EntryId` is a handle into this process's in-memory [`crate::chunk::mirror::Mirror`]
//! and has no meaning after a restart, so `FILE_QUEUE` instead records enough
//! to re-materialize the target (path, size, chunk digests) the same way
//! [`crate::types::SharedEntryWire`] is kept separate from [`crate::types::Entry`].

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::DownloadError;
use crate::types::{Digest, EntryId, PeerId};

/// `FILE_QUEUE` format version: version 4 records per-chunk status rather
/// than a single boolean `complete` flag (spec.md §4.6 "Queue persistence").
pub const FILE_QUEUE_VERSION: u32 = 4;

const FILE_QUEUE_NAME: &str = "FILE_QUEUE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkState {
    Waiting,
    Active,
    NoSrc,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadStatus {
    Queued,
    Active,
    Paused,
    Complete,
    ErrorDisk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DownloadId(pub u64);

/// One queued file transfer: its target identity, queue position, and a
/// chunk-granular state machine. `entry` is populated once the target has
/// been materialized in the mirror (via `Mirror::new_file`) and is never
/// persisted.
#[derive(Debug, Clone)]
pub struct Download {
    pub id: DownloadId,
    pub path: PathBuf,
    pub size: u64,
    pub chunk_digests: Vec<Option<Digest>>,
    pub donor: PeerId,
    pub position: usize,
    pub status: DownloadStatus,
    pub chunk_states: Vec<ChunkState>,
    pub entry: Option<EntryId>,
}

impl Download {
    pub fn is_complete(&self) -> bool {
        self.chunk_states.iter().all(|s| *s == ChunkState::Done)
    }

    pub fn chunk_count(&self) -> usize {
        self.chunk_states.len()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedDownload {
    id: u64,
    path: PathBuf,
    size: u64,
    chunk_digests: Vec<Option<Digest>>,
    donor: PeerId,
    position: usize,
    status: DownloadStatus,
    chunk_states: Vec<ChunkState>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedQueue {
    version: u32,
    downloads: Vec<PersistedDownload>,
}

/// Where to splice a moved set of downloads relative to the reference ids —
/// `moveDownloads(refs, ids, BEFORE|AFTER)` from spec.md §4.6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MovePosition {
    Before,
    After,
}

struct Inner {
    downloads: Vec<Download>,
    next_id: u64,
}

/// Single-mutex, user-ordered queue of downloads — the "Download queue" row
/// of spec.md §5's shared-resources table.
pub struct DownloadQueue {
    inner: Mutex<Inner>,
}

impl DownloadQueue {
    pub fn new() -> Self {
        Self { inner: Mutex::new(Inner { downloads: Vec::new(), next_id: 1 }) }
    }

    /// Queue a new download at the tail, `WAITING` on every chunk until a
    /// source is found.
    pub fn enqueue(
        &self,
        path: PathBuf,
        size: u64,
        chunk_count: usize,
        donor: PeerId,
    ) -> DownloadId {
        let mut inner = self.inner.lock().unwrap();
        let id = DownloadId(inner.next_id);
        inner.next_id += 1;
        let position = inner.downloads.len();
        inner.downloads.push(Download {
            id,
            path,
            size,
            chunk_digests: vec![None; chunk_count],
            donor,
            position,
            status: DownloadStatus::Queued,
            chunk_states: vec![ChunkState::Waiting; chunk_count],
            entry: None,
        });
        id
    }

    pub fn list(&self) -> Vec<Download> {
        self.inner.lock().unwrap().downloads.clone()
    }

    pub fn get(&self, id: DownloadId) -> Option<Download> {
        self.inner.lock().unwrap().downloads.iter().find(|d| d.id == id).cloned()
    }

    pub fn set_entry(&self, id: DownloadId, entry: EntryId) {
        self.with_mut(id, |d| d.entry = Some(entry));
    }

    pub fn set_status(&self, id: DownloadId, status: DownloadStatus) {
        self.with_mut(id, |d| d.status = status);
    }

    pub fn set_donor(&self, id: DownloadId, donor: PeerId) {
        self.with_mut(id, |d| d.donor = donor);
    }

    pub fn set_chunk_digest(&self, id: DownloadId, chunk_num: u32, digest: Digest) {
        self.with_mut(id, |d| {
            if let Some(slot) = d.chunk_digests.get_mut(chunk_num as usize) {
                *slot = Some(digest);
            }
        });
    }

    /// Transition a chunk's state, and flip the overall download status to
    /// `Complete` once every chunk reaches `Done`.
    pub fn set_chunk_state(&self, id: DownloadId, chunk_num: u32, state: ChunkState) {
        self.with_mut(id, |d| {
            if let Some(slot) = d.chunk_states.get_mut(chunk_num as usize) {
                *slot = state;
            }
            if !d.chunk_states.is_empty() && d.chunk_states.iter().all(|s| *s == ChunkState::Done) {
                d.status = DownloadStatus::Complete;
            }
        });
    }

    fn with_mut(&self, id: DownloadId, f: impl FnOnce(&mut Download)) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(d) = inner.downloads.iter_mut().find(|d| d.id == id) {
            f(d);
        }
    }

    pub fn remove(&self, id: DownloadId) {
        let mut inner = self.inner.lock().unwrap();
        inner.downloads.retain(|d| d.id != id);
        renumber_positions(&mut inner.downloads);
    }

    /// Atomically relocate `ids` so they sit contiguously immediately
    /// before/after the first still-present id in `refs`, preserving the
    /// moved ids' mutual order.
    pub fn move_downloads(&self, refs: &[DownloadId], ids: &[DownloadId], position: MovePosition) {
        let mut inner = self.inner.lock().unwrap();
        inner.downloads.sort_by_key(|d| d.position);

        let moving: Vec<Download> =
            inner.downloads.iter().filter(|d| ids.contains(&d.id)).cloned().collect();
        if moving.is_empty() {
            return;
        }
        let mut remaining: Vec<Download> =
            inner.downloads.iter().filter(|d| !ids.contains(&d.id)).cloned().collect();

        let anchor = remaining.iter().position(|d| refs.contains(&d.id));
        let insert_at = match (anchor, position) {
            (Some(i), MovePosition::Before) => i,
            (Some(i), MovePosition::After) => i + 1,
            (None, _) => remaining.len(),
        };
        for (offset, download) in moving.into_iter().enumerate() {
            remaining.insert(insert_at + offset, download);
        }
        renumber_positions(&mut remaining);
        inner.downloads = remaining;
    }

    /// Persist the whole queue to `FILE_QUEUE` under `state_dir`.
    pub fn save(&self, state_dir: &Path) -> Result<(), DownloadError> {
        let downloads = self.list();
        let persisted = PersistedQueue {
            version: FILE_QUEUE_VERSION,
            downloads: downloads
                .into_iter()
                .map(|d| PersistedDownload {
                    id: d.id.0,
                    path: d.path,
                    size: d.size,
                    chunk_digests: d.chunk_digests,
                    donor: d.donor,
                    position: d.position,
                    status: d.status,
                    chunk_states: d.chunk_states,
                })
                .collect(),
        };
        std::fs::create_dir_all(state_dir)?;
        let bytes = bincode::serialize(&persisted)
            .map_err(|e| DownloadError::QueueCorrupted { message: e.to_string() })?;
        std::fs::write(state_dir.join(FILE_QUEUE_NAME), bytes)?;
        Ok(())
    }

    /// Reload `FILE_QUEUE`, transitioning any chunk left `Active` back to
    /// `Waiting` and any download left `Active` back to `Queued` — no
    /// in-flight transfer survives a restart (spec.md §4.6 "on startup the
    /// queue is reloaded and active-state entries transition to WAITING").
    /// A missing file yields an empty queue; a present-but-unreadable or
    /// wrong-version file is reported via `DownloadError::QueueCorrupted`
    /// rather than silently discarded, so the caller can back it up (spec.md
    /// §7 "Fatal" errors policy for corrupted persisted state).
    pub fn load(state_dir: &Path) -> Result<Self, DownloadError> {
        let path = state_dir.join(FILE_QUEUE_NAME);
        let queue = Self::new();
        if !path.exists() {
            return Ok(queue);
        }
        let bytes = std::fs::read(&path)?;
        let persisted: PersistedQueue = bincode::deserialize(&bytes)
            .map_err(|e| DownloadError::QueueCorrupted { message: e.to_string() })?;
        if persisted.version != FILE_QUEUE_VERSION {
            return Err(DownloadError::QueueCorrupted {
                message: format!("unsupported FILE_QUEUE version {}", persisted.version),
            });
        }

        let mut inner = queue.inner.lock().unwrap();
        for mut entry in persisted.downloads {
            for state in entry.chunk_states.iter_mut() {
                if *state == ChunkState::Active {
                    *state = ChunkState::Waiting;
                }
            }
            if entry.status == DownloadStatus::Active {
                entry.status = DownloadStatus::Queued;
            }
            inner.next_id = inner.next_id.max(entry.id + 1);
            inner.downloads.push(Download {
                id: DownloadId(entry.id),
                path: entry.path,
                size: entry.size,
                chunk_digests: entry.chunk_digests,
                donor: entry.donor,
                position: entry.position,
                status: entry.status,
                chunk_states: entry.chunk_states,
                entry: None,
            });
        }
        drop(inner);
        Ok(queue)
    }
}

impl Default for DownloadQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn renumber_positions(downloads: &mut [Download]) {
    for (i, d) in downloads.iter_mut().enumerate() {
        d.position = i;
    }
}
