//! Wires the mirror, chunk index, hashing worker, watchers, and scan
//! coordinator into one long-lived component with a single `stop()`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::chunk::cache::FileCache;
use crate::chunk::hasher::HashingWorker;
use crate::chunk::mirror::Mirror;
use crate::chunk::scan::{self, ScanCoordinator};
use crate::chunk::store::ChunkIndex;
use crate::chunk::watcher::{self, RootWatcher, WatchEvent};
use crate::config::Config;
use crate::logging::{info, warn};
use crate::types::{RootAccess, RootId};

pub struct ChunkService {
    pub mirror: Arc<Mirror>,
    pub chunk_index: Arc<ChunkIndex>,
    pub hasher: Arc<HashingWorker>,
    scan_coordinator: Arc<ScanCoordinator>,
    watchers: std::sync::Mutex<Vec<RootWatcher>>,
    watch_tx: std::sync::Mutex<Option<mpsc::UnboundedSender<(RootId, WatchEvent)>>>,
    caches: std::sync::Mutex<HashMap<RootId, Arc<FileCache>>>,
    config: Config,
    hasher_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    watch_loop_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ChunkService {
    pub fn new(config: Config) -> Arc<Self> {
        Arc::new(Self {
            mirror: Arc::new(Mirror::new()),
            chunk_index: Arc::new(ChunkIndex::new()),
            hasher: HashingWorker::new(),
            scan_coordinator: ScanCoordinator::new(),
            watchers: std::sync::Mutex::new(Vec::new()),
            watch_tx: std::sync::Mutex::new(None),
            caches: std::sync::Mutex::new(HashMap::new()),
            config,
            hasher_task: std::sync::Mutex::new(None),
            watch_loop_task: std::sync::Mutex::new(None),
        })
    }

    /// Start the hashing worker and the watch-event pump. Call once, before
    /// any `add_root`, so newly added roots pick up a live watcher.
    pub fn start(self: &Arc<Self>) {
        let task = crate::chunk::hasher::spawn(
            self.hasher.clone(),
            self.mirror.clone(),
            self.chunk_index.clone(),
            self.config.clone(),
        );
        *self.hasher_task.lock().unwrap() = Some(task);

        let (tx, rx) = mpsc::unbounded_channel();
        *self.watch_tx.lock().unwrap() = Some(tx);
        let this = self.clone();
        let pump = tokio::spawn(async move { this.pump_watch_events(rx).await });
        *self.watch_loop_task.lock().unwrap() = Some(pump);
    }

    pub async fn add_root(self: &Arc<Self>, path: PathBuf, access: RootAccess) -> RootId {
        let root = self.mirror.add_root(path.clone(), access);
        let report =
            scan::scan_root(self.scan_coordinator.clone(), self.mirror.clone(), root, path.clone())
                .await;

        let cache = match FileCache::open(&self.config.paths.state_dir, &path) {
            Ok(cache) => Some(Arc::new(cache)),
            Err(e) => {
                warn!("could not open chunk cache for {}: {}", path.display(), e);
                None
            }
        };
        let reclaimed = match &cache {
            Some(cache) => cache.reclaim(&self.mirror, &self.chunk_index, root).unwrap_or(0),
            None => 0,
        };
        if let Some(cache) = cache {
            self.caches.lock().unwrap().insert(root, cache);
        }

        let new_count = report.new_files.len();
        for entry in report.new_files {
            if !self.mirror.get_entry_clone(entry).map(|e| e.has_all_hashes()).unwrap_or(false) {
                self.hasher.enqueue_normal(entry).await;
            }
        }

        if let Some(tx) = self.watch_tx.lock().unwrap().clone() {
            let poll_period =
                Duration::from_secs(self.config.chunking.scan_period_unwatchable_dirs_secs);
            let watcher = watcher::watch_root(root, path.clone(), poll_period, tx);
            self.watchers.lock().unwrap().push(watcher);
        }

        info!(
            "shared root {:?} added at {} ({} new files, {} reclaimed from cache)",
            root,
            path.display(),
            new_count,
            reclaimed
        );
        root
    }

    /// Persist every root's chunk-digest cache. Called periodically and on
    /// shutdown so a restart doesn't have to re-hash unchanged files.
    pub fn save_caches(&self) {
        let caches = self.caches.lock().unwrap();
        for (root, cache) in caches.iter() {
            if let Err(e) = cache.save(&self.mirror, *root) {
                warn!("failed to save chunk cache for root {:?}: {}", root, e);
            }
        }
    }

    async fn pump_watch_events(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<(RootId, WatchEvent)>) {
        while let Some((root, _event)) = rx.recv().await {
            // Every native event, overflow, or poll tick resolves to a
            // targeted rescan of the affected root: simpler than emulating
            // the mirror's NEW/DELETED/MOVE vocabulary file-by-file, and
            // cheap enough relative to network I/O for a LAN sharing node.
            if let Some(path) = self.root_path(root) {
                let report = scan::scan_root(
                    self.scan_coordinator.clone(),
                    self.mirror.clone(),
                    root,
                    path,
                )
                .await;
                for entry in report.new_files {
                    self.hasher.enqueue_normal(entry).await;
                }
                for entry in report.invalidated {
                    self.hasher.enqueue_normal(entry).await;
                }
            }
        }
    }

    fn root_path(&self, root: RootId) -> Option<PathBuf> {
        self.mirror.roots().into_iter().find(|r| r.id == root).map(|r| r.path)
    }

    pub fn stop(&self) {
        self.save_caches();
        self.hasher.stop();
        for w in self.watchers.lock().unwrap().iter() {
            w.stop();
        }
        if let Some(task) = self.hasher_task.lock().unwrap().take() {
            task.abort();
        }
        if let Some(task) = self.watch_loop_task.lock().unwrap().take() {
            task.abort();
        }
    }
}
