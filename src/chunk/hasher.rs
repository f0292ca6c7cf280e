//! Background hashing worker.
//!
//! Drains two FIFO queues of files lacking digests — a *normal* queue
//! populated by scan, and a *prioritized* queue populated when a remote peer
//! requests our hashes (`protocol::server`'s `GET_HASHES` handler) — one
//! chunk at a time, seeding the digest from any already-known partial prefix.
//! Mirrors the teacher's single-worker-drains-a-queue shape (see
//! `protocol::internal_server`'s actor loop) generalized to two priority
//! tiers and a minimum per-burst duration so one tiny prioritized file can't
//! starve a large file already mid-hash.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use crate::chunk::mirror::Mirror;
use crate::chunk::store::ChunkIndex;
use crate::config::Config;
use crate::logging::{debug, warn};
use crate::types::{Digest, EntryId};

/// Emitted once a chunk's digest has been computed, so `GET_HASHES`
/// responders waiting on a still-hashing file can react without polling.
#[derive(Debug, Clone)]
pub struct ChunkHashed {
    pub entry: EntryId,
    pub chunk_num: u32,
    pub digest: Digest,
}

struct Queues {
    normal: VecDeque<EntryId>,
    prioritized: VecDeque<EntryId>,
}

/// Handle to the running worker: lets callers enqueue files and subscribe to
/// completed hashes, and stop the worker (idempotently).
pub struct HashingWorker {
    queues: AsyncMutex<Queues>,
    notify: tokio::sync::Notify,
    events: broadcast::Sender<ChunkHashed>,
    stop_tx: watch::Sender<bool>,
    stopped: AtomicBool,
}

impl HashingWorker {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            queues: AsyncMutex::new(Queues { normal: VecDeque::new(), prioritized: VecDeque::new() }),
            notify: tokio::sync::Notify::new(),
            events,
            stop_tx,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChunkHashed> {
        self.events.subscribe()
    }

    pub async fn enqueue_normal(&self, entry: EntryId) {
        let mut q = self.queues.lock().await;
        if !q.normal.contains(&entry) {
            q.normal.push_back(entry);
        }
        self.notify.notify_one();
    }

    /// Enqueue (or move to the front of) the prioritized queue, as happens
    /// when a remote peer issues `GET_HASHES` for a file we haven't hashed
    /// yet.
    pub async fn enqueue_priority(&self, entry: EntryId) {
        let mut q = self.queues.lock().await;
        q.prioritized.retain(|&e| e != entry);
        q.prioritized.push_back(entry);
        self.notify.notify_one();
    }

    /// Idempotent stop: subsequent calls are no-ops.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            let _ = self.stop_tx.send(true);
        }
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    async fn next_target(&self) -> Option<EntryId> {
        loop {
            {
                let mut q = self.queues.lock().await;
                if let Some(e) = q.prioritized.pop_front() {
                    return Some(e);
                }
                if let Some(e) = q.normal.pop_front() {
                    return Some(e);
                }
            }
            if self.is_stopped() {
                return None;
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(500)) => {}
            }
            if self.is_stopped() {
                return None;
            }
        }
    }

    /// Put a file back at the tail of its queue — used when a hashing burst
    /// is interrupted by `stop()` mid-file, or rotated after exhausting its
    /// time budget on the prioritized queue.
    async fn requeue_priority_tail(&self, entry: EntryId) {
        let mut q = self.queues.lock().await;
        q.prioritized.push_back(entry);
    }
}

/// Spawn the worker loop. Returns the shared handle and the task join handle
/// (joined by callers that want to wait for a clean shutdown).
pub fn spawn(
    worker: Arc<HashingWorker>,
    mirror: Arc<Mirror>,
    chunk_index: Arc<ChunkIndex>,
    config: Config,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        run(worker, mirror, chunk_index, config).await;
    })
}

async fn run(worker: Arc<HashingWorker>, mirror: Arc<Mirror>, chunk_index: Arc<ChunkIndex>, config: Config) {
    let min_burst = Duration::from_millis(config.chunking.min_hashing_duration_ms);
    while let Some(entry) = worker.next_target().await {
        let burst_start = Instant::now();
        let mut rotated = false;
        loop {
            let pending = mirror.chunks_needing_hash(entry);
            let Some(&chunk_num) = pending.first() else { break };

            let path = match mirror.resolve_path(entry) {
                Some(p) => p,
                None => break,
            };
            let entry_snapshot = match mirror.get_entry_clone(entry) {
                Some(e) => e,
                None => break,
            };
            let crate::types::EntryKind::File { chunks, .. } = &entry_snapshot.kind else { break };
            let Some(chunk) = chunks.iter().find(|c| c.num == chunk_num) else { break };
            let offset = chunk_num as u64 * crate::config::CHUNK_SIZE;
            let size = chunk.size;

            let read = tokio::task::spawn_blocking(move || read_range(&path, offset, size)).await;
            let bytes = match read {
                Ok(Ok(bytes)) => bytes,
                Ok(Err(e)) => {
                    warn!("hashing worker: read error for entry {:?} chunk {}: {}", entry, chunk_num, e);
                    break;
                }
                Err(_) => break,
            };

            let digest = Digest::of(&bytes);
            mirror.set_chunk_digest(entry, chunk_num, digest);
            chunk_index.add(
                digest,
                crate::chunk::store::ChunkLocation { entry, chunk_num },
            );
            debug!("hashed entry {:?} chunk {} -> {}", entry, chunk_num, digest);
            let _ = worker.events.send(ChunkHashed { entry, chunk_num, digest });

            if worker.is_stopped() {
                worker.requeue_priority_tail(entry).await;
                rotated = true;
                break;
            }

            if burst_start.elapsed() >= min_burst {
                // Yield this file if something else is waiting, so no
                // single file can starve the prioritized queue beyond the
                // minimum burst.
                let has_more_waiting = {
                    let q = worker.queues.lock().await;
                    !q.prioritized.is_empty()
                };
                if has_more_waiting && !mirror.chunks_needing_hash(entry).is_empty() {
                    worker.enqueue_priority(entry).await;
                    rotated = true;
                    break;
                }
            }
        }
        let _ = rotated;
        if worker.is_stopped() {
            break;
        }
    }
}

fn read_range(path: &std::path::Path, offset: u64, size: u32) -> std::io::Result<Vec<u8>> {
    use std::io::{Read, Seek, SeekFrom};
    let mut file = std::fs::File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; size as usize];
    file.read_exact(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RootAccess;
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn hashes_a_single_chunk_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello world").unwrap();

        let mirror = Arc::new(Mirror::new());
        let root = mirror.add_root(dir.path().to_path_buf(), RootAccess::ReadWrite);
        let root_entry = mirror.root_entry(root).unwrap();
        let file_id = mirror.insert_file(
            root_entry,
            "a.txt".to_string(),
            root,
            11,
            std::time::SystemTime::now(),
        );

        let chunk_index = Arc::new(ChunkIndex::new());
        let worker = HashingWorker::new();
        let mut config = Config::default();
        config.chunking.min_hashing_duration_ms = 1;
        let handle = spawn(worker.clone(), mirror.clone(), chunk_index.clone(), config);
        worker.enqueue_normal(file_id).await;

        let expected = Digest::of(b"hello world");
        let mut ok = false;
        for _ in 0..50 {
            if mirror
                .get_entry_clone(file_id)
                .map(|e| e.has_all_hashes())
                .unwrap_or(false)
            {
                ok = true;
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(20)).await;
        }
        assert!(ok, "hashing did not complete in time");
        assert!(chunk_index.contains(&expected));

        worker.stop();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let worker = HashingWorker::new();
        worker.stop();
        worker.stop();
        assert!(worker.is_stopped());
    }
}
