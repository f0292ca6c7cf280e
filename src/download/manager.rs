//! Download manager: wires the [`DownloadQueue`] and [`Scheduler`] to the
//! wire protocol client and the file mirror.
//!
//! Mirrors [`crate::chunk::service::ChunkService`]'s shape — one `Arc`-wrapped
//! component with `new`/`start`/`stop` — generalized to the download side of
//! the node: where `ChunkService` hashes what we already have, this drives
//! acquiring what we don't.

use std::collections::{HashMap, HashSet};
use std::io::SeekFrom;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::chunk::mirror::Mirror;
use crate::chunk::store::{ChunkIndex, ChunkLocation};
use crate::config::Config;
use crate::download::queue::{ChunkState, DownloadId, DownloadQueue, DownloadStatus, MovePosition};
use crate::download::scheduler::Scheduler;
use crate::error::DownloadError;
use crate::logging::{debug, info, warn};
use crate::peer::directory::PeerDirectory;
use crate::protocol::client;
use crate::protocol::messages::{ChunkStatusKind, HashesStatusKind};
use crate::types::{chunk_layout, Digest, PeerId, SharedEntryWire};

/// Drives the download queue: materializes new downloads, fetches missing
/// hashes, schedules chunk fetches within `number_of_downloader` concurrency,
/// and periodically persists the queue.
pub struct DownloadManager {
    pub queue: Arc<DownloadQueue>,
    scheduler: Arc<Scheduler>,
    mirror: Arc<Mirror>,
    chunk_index: Arc<ChunkIndex>,
    directory: PeerDirectory,
    config: Config,
    /// Known owners of a digest, learned from a download's donor and from
    /// `note_peer_has` (fed by presence-beacon "chunks of interest" samples).
    sources: Mutex<HashMap<Digest, HashSet<PeerId>>>,
    /// Last observed transfer rate (bytes/sec) per peer, used by
    /// `should_switch` comparisons.
    rates: Mutex<HashMap<PeerId, f64>>,
    hash_fetch_in_flight: Mutex<HashSet<DownloadId>>,
    permits: Arc<Semaphore>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DownloadManager {
    /// `queue` is the caller's responsibility to populate — pass
    /// `DownloadQueue::load(&config.paths.state_dir)` to resume a persisted
    /// one, or `DownloadQueue::new()` to start empty.
    pub fn new(
        config: Config,
        queue: DownloadQueue,
        mirror: Arc<Mirror>,
        chunk_index: Arc<ChunkIndex>,
        directory: PeerDirectory,
    ) -> Arc<Self> {
        let permits = Arc::new(Semaphore::new(config.download.number_of_downloader.max(1)));
        Arc::new(Self {
            queue: Arc::new(queue),
            scheduler: Arc::new(Scheduler::new()),
            mirror,
            chunk_index,
            directory,
            config,
            sources: Mutex::new(HashMap::new()),
            rates: Mutex::new(HashMap::new()),
            hash_fetch_in_flight: Mutex::new(HashSet::new()),
            permits,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Start the scheduling loop and the periodic queue-persistence task.
    pub fn start(self: &Arc<Self>) {
        let scheduling = self.clone();
        let scheduling_task = tokio::spawn(async move { scheduling.scheduling_loop().await });

        let persisting = self.clone();
        let persist_task = tokio::spawn(async move { persisting.persistence_loop().await });

        self.tasks.lock().unwrap().extend([scheduling_task, persist_task]);
    }

    pub fn stop(&self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        let _ = self.queue.save(&self.config.paths.state_dir);
    }

    /// Queue a new file for download from `donor`, learned from a prior
    /// `GET_ENTRIES`/`FindResult` reply. Per spec.md §4.6 "Hash source", the
    /// manager itself issues `GET_HASHES` to the donor before any chunk can
    /// become `ACTIVE`.
    pub fn new_download(self: &Arc<Self>, remote: SharedEntryWire, donor: PeerId) -> DownloadId {
        let chunk_count = chunk_layout(remote.size).len();
        let id = self.queue.enqueue(
            std::path::PathBuf::from(&remote.path),
            remote.size,
            chunk_count,
            donor,
        );
        {
            let mut sources = self.sources.lock().unwrap();
            for digest in &remote.chunk_digests {
                sources.entry(*digest).or_default().insert(donor);
            }
        }
        for (num, digest) in remote.chunk_digests.iter().enumerate() {
            self.queue.set_chunk_digest(id, num as u32, *digest);
        }
        self.spawn_fetch_hashes(id);
        id
    }

    /// Register an additional known owner of `digest` — called as presence
    /// beacons report "chunks of interest" (spec.md §4.5). Per §4.5(b), the
    /// digest is checked against the local chunk store first: only a digest
    /// some queued download still needs becomes a source, so `sources` stays
    /// bounded by what this node is actually downloading rather than
    /// accumulating an entry for every chunk every peer ever advertises.
    pub fn note_peer_has(&self, peer: PeerId, digest: Digest) {
        if !self.is_wanted(&digest) {
            return;
        }
        self.sources.lock().unwrap().entry(digest).or_default().insert(peer);
    }

    /// Whether some queued download still has an unfinished chunk carrying
    /// `digest` — the "checks the included digests against the local chunk
    /// store" half of spec.md §4.5(b).
    fn is_wanted(&self, digest: &Digest) -> bool {
        self.queue.list().iter().any(|download| {
            download
                .chunk_digests
                .iter()
                .zip(download.chunk_states.iter())
                .any(|(d, state)| d.as_ref() == Some(digest) && *state != ChunkState::Done)
        })
    }

    /// Forward every `ChunkOfInterest` relayed from [`crate::net::Beacon`]
    /// into [`Self::note_peer_has`] until the channel closes (the node is
    /// shutting down). Spawned once at startup alongside the scheduling and
    /// persistence loops.
    pub fn spawn_chunk_of_interest_forwarder(
        self: &Arc<Self>,
        mut rx: tokio::sync::broadcast::Receiver<crate::net::beacon::ChunkOfInterest>,
    ) {
        let this = self.clone();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => this.note_peer_has(event.peer, event.digest),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.tasks.lock().unwrap().push(task);
    }

    pub fn move_downloads(&self, refs: &[DownloadId], ids: &[DownloadId], position: MovePosition) {
        self.queue.move_downloads(refs, ids, position);
    }

    fn spawn_fetch_hashes(self: &Arc<Self>, id: DownloadId) {
        if !self.hash_fetch_in_flight.lock().unwrap().insert(id) {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.fetch_hashes_and_materialize(id).await {
                warn!("download: GET_HASHES for {:?} failed: {}", id, e);
            }
            this.hash_fetch_in_flight.lock().unwrap().remove(&id);
        });
    }

    async fn fetch_hashes_and_materialize(self: &Arc<Self>, id: DownloadId) -> Result<(), DownloadError> {
        let Some(download) = self.queue.get(id) else { return Ok(()) };
        let Some(peer_info) = self.directory.get(download.donor) else {
            return Err(DownloadError::NoSource);
        };
        let Some(pool) = self.directory.get_pool(download.donor) else {
            return Err(DownloadError::NoSource);
        };

        let path = download.path.to_string_lossy().into_owned();
        let mut socket = pool
            .get_a_socket(peer_info.addr)
            .await
            .map_err(|e| DownloadError::ErrorDisk { message: e.to_string() })?;

        let get_hashes_timeout = Duration::from_secs(self.config.peer.get_hashes_timeout_secs);
        let status = timeout(
            get_hashes_timeout,
            client::get_hashes_header(&mut socket, path, download.chunk_count() as u32),
        )
        .await
        .map_err(|_| DownloadError::ErrorDisk { message: "GET_HASHES timed out".to_string() })?
        .map_err(|e| DownloadError::ErrorDisk { message: e.to_string() })?;

        if status.status != HashesStatusKind::Ok {
            return Err(DownloadError::NoSource);
        }

        let mut digests = vec![None; download.chunk_count()];
        for _ in 0..status.nb_hash {
            let result = timeout(get_hashes_timeout, client::read_hash_result(&mut socket))
                .await
                .map_err(|_| DownloadError::ErrorDisk { message: "GET_HASHES timed out".to_string() })?
                .map_err(|e| DownloadError::ErrorDisk { message: e.to_string() })?;
            if let Some(slot) = digests.get_mut(result.num as usize) {
                *slot = Some(result.digest);
            }
            self.queue.set_chunk_digest(id, result.num, result.digest);
            self.sources.lock().unwrap().entry(result.digest).or_default().insert(download.donor);
        }
        pool.release(socket);

        if digests.iter().any(Option::is_none) {
            // Partial reply: leave materialization for the next retry once
            // every digest is known.
            return Ok(());
        }

        if download.entry.is_none() {
            let wire = SharedEntryWire {
                path: download.path.to_string_lossy().into_owned(),
                is_dir: false,
                size: download.size,
                modified_unix: 0,
                chunk_digests: digests.into_iter().map(Option::unwrap).collect(),
            };
            let entry = self
                .mirror
                .new_file(&wire)
                .map_err(|e| DownloadError::ErrorDisk { message: e.to_string() })?;
            self.queue.set_entry(id, entry);

            // Chunks already marked Done in a reloaded queue have bytes on
            // disk from before the restart; restore the mirror's knowledge
            // of them so they aren't re-fetched and so peers can serve them.
            for (num, state) in download.chunk_states.iter().enumerate() {
                if *state == ChunkState::Done {
                    if let Some(digest) = self.queue.get(id).and_then(|d| d.chunk_digests[num]) {
                        self.mirror.set_chunk_digest(entry, num as u32, digest);
                        self.chunk_index
                            .add(digest, ChunkLocation { entry, chunk_num: num as u32 });
                    }
                }
            }
        }
        Ok(())
    }

    async fn scheduling_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_millis(500));
        loop {
            ticker.tick().await;
            self.schedule_tick();
        }
    }

    fn schedule_tick(self: &Arc<Self>) {
        for download in self.queue.list() {
            if matches!(download.status, DownloadStatus::Paused | DownloadStatus::Complete) {
                continue;
            }
            if download.status == DownloadStatus::ErrorDisk {
                continue;
            }
            if download.entry.is_none() {
                self.spawn_fetch_hashes(download.id);
                continue;
            }
            for (num, state) in download.chunk_states.iter().enumerate() {
                if !matches!(state, ChunkState::Waiting | ChunkState::NoSrc) {
                    continue;
                }
                let Some(digest) = download.chunk_digests[num] else { continue };
                let candidates = self.available_candidates(&digest);
                if candidates.is_empty() {
                    self.queue.set_chunk_state(download.id, num as u32, ChunkState::NoSrc);
                    continue;
                }
                let Some(donor) = self.scheduler.choose_donor(&candidates) else { continue };
                let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                    // At capacity; the next tick will retry this chunk.
                    break;
                };
                let this = self.clone();
                let download_id = download.id;
                let chunk_num = num as u32;
                tokio::spawn(async move {
                    this.download_chunk(download_id, chunk_num, donor).await;
                    drop(permit);
                });
            }
        }
    }

    fn available_candidates(&self, digest: &Digest) -> Vec<PeerId> {
        let sources = self.sources.lock().unwrap();
        sources
            .get(digest)
            .map(|set| set.iter().copied().filter(|p| self.directory.is_available(*p)).collect())
            .unwrap_or_default()
    }

    async fn download_chunk(self: Arc<Self>, id: DownloadId, chunk_num: u32, donor: PeerId) {
        self.queue.set_chunk_state(id, chunk_num, ChunkState::Active);
        self.scheduler.record_used(donor);

        if let Err(e) = self.try_download_chunk(id, chunk_num, donor).await {
            debug!("download: chunk {} of {:?} from {} failed: {}", chunk_num, id, donor, e);
        }
    }

    async fn try_download_chunk(
        self: &Arc<Self>,
        id: DownloadId,
        chunk_num: u32,
        donor: PeerId,
    ) -> Result<(), DownloadError> {
        let Some(download) = self.queue.get(id) else { return Ok(()) };
        let Some(entry) = download.entry else { return Ok(()) };
        let Some(digest) = download.chunk_digests[chunk_num as usize] else { return Ok(()) };
        let Some(peer_info) = self.directory.get(donor) else {
            self.queue.set_chunk_state(id, chunk_num, ChunkState::Waiting);
            return Ok(());
        };
        let Some(pool) = self.directory.get_pool(donor) else {
            self.queue.set_chunk_state(id, chunk_num, ChunkState::Waiting);
            return Ok(());
        };

        let mut socket = match pool.get_a_socket(peer_info.addr).await {
            Ok(s) => s,
            Err(e) => {
                self.queue.set_chunk_state(id, chunk_num, ChunkState::Waiting);
                return Err(DownloadError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())));
            }
        };

        let started = Instant::now();
        let status = match client::get_chunk_header(&mut socket, digest, 0).await {
            Ok(status) => status,
            Err(e) => {
                self.queue.set_chunk_state(id, chunk_num, ChunkState::Waiting);
                return Err(DownloadError::ErrorDisk { message: e.to_string() });
            }
        };
        match status.status {
            ChunkStatusKind::DontHaveIt => {
                self.sources.lock().unwrap().entry(digest).or_default().remove(&donor);
                self.queue.set_chunk_state(id, chunk_num, ChunkState::Waiting);
                pool.release(socket);
                return Ok(());
            }
            ChunkStatusKind::Busy => {
                self.queue.set_chunk_state(id, chunk_num, ChunkState::Waiting);
                pool.release(socket);
                return Ok(());
            }
            ChunkStatusKind::Ok => {}
        }

        let bytes = match self.read_chunk_with_switch_check(&mut socket, status.size, digest, donor).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                // A faster donor was found mid-transfer; the chunk goes back
                // to Waiting and the next schedule tick picks it up. Per
                // spec.md §4.6 "Switching peers", the cancelled peer is not
                // blocked — the socket is simply dropped, not pooled.
                self.queue.set_chunk_state(id, chunk_num, ChunkState::Waiting);
                return Ok(());
            }
            Err(e) => {
                self.queue.set_chunk_state(id, chunk_num, ChunkState::Waiting);
                return Err(DownloadError::ErrorDisk { message: e.to_string() });
            }
        };
        let elapsed = started.elapsed();
        self.scheduler.record_rtt(donor, elapsed);
        if elapsed.as_secs_f64() > 0.0 {
            self.rates.lock().unwrap().insert(donor, bytes.len() as f64 / elapsed.as_secs_f64());
        }

        if self.config.chunking.check_received_data_integrity && Digest::of(&bytes) != digest {
            self.directory.block(
                donor,
                Duration::from_secs(self.config.download.block_duration_corrupted_data_secs),
            );
            self.queue.set_chunk_state(id, chunk_num, ChunkState::Waiting);
            pool.release(socket);
            return Err(DownloadError::HashMismatch { chunk_num });
        }

        match self.write_chunk(entry, chunk_num, &bytes).await {
            Ok(()) => {
                pool.release(socket);
            }
            Err(e) => {
                self.queue.set_status(id, DownloadStatus::ErrorDisk);
                self.queue.set_chunk_state(id, chunk_num, ChunkState::Waiting);
                self.schedule_disk_retry(id);
                return Err(e);
            }
        }

        self.mirror.set_chunk_digest(entry, chunk_num, digest);
        self.chunk_index.add(digest, ChunkLocation { entry, chunk_num });
        self.queue.set_chunk_state(id, chunk_num, ChunkState::Done);

        if let Some(download) = self.queue.get(id) {
            if download.is_complete() {
                if let Err(e) = self.mirror.finalize_file(entry) {
                    warn!("download: failed to finalize {:?}: {}", id, e);
                } else {
                    info!("download {:?} complete: {}", id, download.path.display());
                }
            }
        }
        Ok(())
    }

    /// Read a `GET_CHUNK` body, sampling the transfer rate every
    /// `SWITCH_CHECK_INTERVAL_BYTES` and abandoning the read if another
    /// available donor's last-observed rate beats ours by more than
    /// `switch_to_another_peer_factor` (spec.md §4.6 "Switching peers").
    /// Returns `Ok(None)` when abandoned mid-transfer, `Ok(Some(bytes))` on a
    /// full read.
    async fn read_chunk_with_switch_check(
        self: &Arc<Self>,
        socket: &mut tokio::net::TcpStream,
        size: u32,
        digest: Digest,
        current_donor: PeerId,
    ) -> Result<Option<Vec<u8>>, DownloadError> {
        use tokio::io::AsyncReadExt;
        const SWITCH_CHECK_INTERVAL_BYTES: usize = 256 * 1024;

        let mut buf = vec![0u8; size as usize];
        let mut read_total = 0usize;
        let mut next_check = SWITCH_CHECK_INTERVAL_BYTES;
        let started = Instant::now();

        while read_total < buf.len() {
            let n = socket.read(&mut buf[read_total..]).await?;
            if n == 0 {
                return Err(DownloadError::ErrorDisk { message: "connection closed mid-chunk".to_string() });
            }
            read_total += n;

            if read_total >= next_check && read_total < buf.len() {
                next_check += SWITCH_CHECK_INTERVAL_BYTES;
                let elapsed = started.elapsed().as_secs_f64();
                if elapsed > 0.0 {
                    let current_rate = read_total as f64 / elapsed;
                    if self.faster_candidate_exists(digest, current_donor, current_rate) {
                        return Ok(None);
                    }
                }
            }
        }
        buf.truncate(read_total);
        Ok(Some(buf))
    }

    /// Whether an available peer other than `current_donor` has a
    /// last-observed rate exceeding `current_rate * switch_to_another_peer_factor`.
    fn faster_candidate_exists(&self, digest: Digest, current_donor: PeerId, current_rate: f64) -> bool {
        let factor = self.config.download.switch_to_another_peer_factor;
        let candidates = self.available_candidates(&digest);
        let rates = self.rates.lock().unwrap();
        candidates.iter().filter(|p| **p != current_donor).any(|p| {
            let candidate_rate = self.scheduler.observed_rate(*p, &rates);
            self.scheduler.should_switch(current_rate, candidate_rate, factor)
        })
    }

    async fn write_chunk(&self, entry: crate::types::EntryId, chunk_num: u32, bytes: &[u8]) -> Result<(), DownloadError> {
        let path = self
            .mirror
            .write_path(entry)
            .ok_or_else(|| DownloadError::ErrorDisk { message: "download target missing".to_string() })?;
        let offset = chunk_num as u64 * crate::config::CHUNK_SIZE;
        let mut file = tokio::fs::OpenOptions::new().write(true).open(&path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(bytes).await?;
        Ok(())
    }

    fn schedule_disk_retry(self: &Arc<Self>, id: DownloadId) {
        let this = self.clone();
        let delay = Duration::from_secs(self.config.download.restart_downloads_period_if_error_secs);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.queue.set_status(id, DownloadStatus::Queued);
        });
    }

    async fn persistence_loop(self: Arc<Self>) {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.download.save_queue_period_secs.max(1)));
        loop {
            ticker.tick().await;
            if let Err(e) = self.queue.save(&self.config.paths.state_dir) {
                warn!("download: failed to persist queue: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RootAccess;

    fn test_manager() -> (Arc<DownloadManager>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mirror = Arc::new(Mirror::new());
        mirror.add_root(dir.path().to_path_buf(), RootAccess::ReadWrite);
        let chunk_index = Arc::new(ChunkIndex::new());
        let directory = PeerDirectory::new(1, Duration::from_secs(30), 3);
        let mut config = Config::default();
        config.paths.state_dir = dir.path().join("state");
        let manager = DownloadManager::new(config, DownloadQueue::new(), mirror, chunk_index, directory);
        (manager, dir)
    }

    #[tokio::test]
    async fn new_download_enqueues_with_known_digests() {
        let (manager, _dir) = test_manager();
        let wire = SharedEntryWire {
            path: "movie.mkv".to_string(),
            is_dir: false,
            size: 10,
            modified_unix: 0,
            chunk_digests: vec![Digest::of(b"x")],
        };
        let id = manager.new_download(wire, PeerId([1; 20]));
        let download = manager.queue.get(id).unwrap();
        assert_eq!(download.chunk_digests, vec![Some(Digest::of(b"x"))]);
        assert_eq!(download.status, DownloadStatus::Queued);
    }

    #[test]
    fn note_peer_has_registers_a_source_for_a_wanted_digest() {
        let (manager, _dir) = test_manager();
        let digest = Digest::of(b"y");
        let wire = SharedEntryWire {
            path: "wanted.bin".to_string(),
            is_dir: false,
            size: 10,
            modified_unix: 0,
            chunk_digests: vec![digest],
        };
        manager.new_download(wire, PeerId([1; 20]));

        manager.note_peer_has(PeerId([4; 20]), digest);
        assert_eq!(manager.available_candidates(&digest), Vec::new());
        manager.directory.update_peer(crate::peer::directory::PeerInfo {
            id: PeerId([4; 20]),
            nickname: "n".to_string(),
            addr: "127.0.0.1:1".parse().unwrap(),
            shared_bytes: 0,
            download_rate: 0.0,
            upload_rate: 0.0,
            protocol_version: 1,
        });
        assert_eq!(manager.available_candidates(&digest), vec![PeerId([4; 20])]);
    }

    #[test]
    fn note_peer_has_ignores_a_digest_no_download_wants() {
        let (manager, _dir) = test_manager();
        let digest = Digest::of(b"unwanted");
        manager.note_peer_has(PeerId([4; 20]), digest);
        assert_eq!(manager.available_candidates(&digest), Vec::new());
        assert!(manager.sources.lock().unwrap().get(&digest).is_none());
    }

    #[test]
    fn note_peer_has_ignores_a_digest_whose_chunk_is_already_done() {
        let (manager, _dir) = test_manager();
        let digest = Digest::of(b"finished");
        let wire = SharedEntryWire {
            path: "finished.bin".to_string(),
            is_dir: false,
            size: 10,
            modified_unix: 0,
            chunk_digests: vec![digest],
        };
        let id = manager.new_download(wire, PeerId([1; 20]));
        manager.queue.set_chunk_state(id, 0, ChunkState::Done);

        manager.note_peer_has(PeerId([4; 20]), digest);
        assert!(manager.sources.lock().unwrap().get(&digest).is_none());
    }

    #[test]
    fn faster_candidate_exists_requires_an_available_alternative() {
        let (manager, _dir) = test_manager();
        let digest = Digest::of(b"z");
        let current = PeerId([1; 20]);
        let other = PeerId([2; 20]);

        // No other peer registered at all: never switch.
        assert!(!manager.faster_candidate_exists(digest, current, 100.0));

        manager.directory.update_peer(crate::peer::directory::PeerInfo {
            id: other,
            nickname: "fast".to_string(),
            addr: "127.0.0.1:2".parse().unwrap(),
            shared_bytes: 0,
            download_rate: 0.0,
            upload_rate: 0.0,
            protocol_version: 1,
        });
        manager.note_peer_has(other, digest);

        // Registered but no observed rate yet (defaults to 0.0): no switch.
        assert!(!manager.faster_candidate_exists(digest, current, 100.0));

        manager.rates.lock().unwrap().insert(other, 1000.0);
        assert!(manager.faster_candidate_exists(digest, current, 100.0));
    }
}
