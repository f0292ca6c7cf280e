//! Shared scaffolding for the scenario tests in this directory: each test
//! spins up one or two complete, in-process nodes bound to loopback (and,
//! for the presence/search scenarios, loopback-joined multicast) rather than
//! real multi-host networking, the way `dlan-node`'s `run()` wires the same
//! pieces together for a real process.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use dlan::chunk::service::ChunkService;
use dlan::config::Config;
use dlan::download::{DownloadManager, DownloadQueue};
use dlan::net::beacon::PROTOCOL_VERSION;
use dlan::peer::PeerDirectory;
use dlan::protocol::{serve_connection, ServerContext};
use dlan::search::SearchIndex;
use dlan::types::{EntryKind, PeerId, RootAccess};
use dlan::upload::UploadManager;
use dlan::NetworkService;

/// A node under construction: the share directory is available to populate
/// with files before [`NodeHandle::start`] runs the initial scan.
pub struct NodeHandle {
    root_dir: TempDir,
    state_dir: TempDir,
    config: Config,
    networked: bool,
}

impl NodeHandle {
    /// A node with no UDP presence/search layer — used by the download
    /// scenarios, which address the donor directly rather than discovering
    /// it.
    pub fn new(nickname: &str) -> Self {
        let root_dir = tempfile::tempdir().unwrap();
        let state_dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.nickname = nickname.to_string();
        config.paths.state_dir = state_dir.path().to_path_buf();
        Self { root_dir, state_dir, config, networked: false }
    }

    /// A node with a live [`NetworkService`] bound to `multicast_port`
    /// (shared with whichever peer it must discover) and `unicast_base_port`
    /// (distinct per node, since two nodes on one machine can't share a TCP
    /// listener).
    pub fn with_network(nickname: &str, multicast_port: u16, unicast_base_port: u16) -> Self {
        let root_dir = tempfile::tempdir().unwrap();
        let state_dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.nickname = nickname.to_string();
        config.paths.state_dir = state_dir.path().to_path_buf();
        config.network.listen_address = "127.0.0.1".parse().unwrap();
        config.network.multicast_port = multicast_port;
        config.network.unicast_base_port = unicast_base_port;
        // Short periods: scenario deadlines (2x / timeout_factor x period) need
        // to fit comfortably inside a test's own timeout budget.
        config.peer.peer_imalive_period_secs = 1;
        config.peer.peer_timeout_factor = 2;
        Self { root_dir, state_dir, config, networked: true }
    }

    pub fn share_path(&self) -> PathBuf {
        self.root_dir.path().to_path_buf()
    }

    pub async fn start(self) -> Node {
        let peer_id = PeerId::generate();
        let chunk_service = ChunkService::new(self.config.clone());
        chunk_service.start();
        chunk_service.add_root(self.root_dir.path().to_path_buf(), RootAccess::ReadWrite).await;

        let peer_timeout = Duration::from_secs(
            self.config.peer.peer_imalive_period_secs * self.config.peer.peer_timeout_factor as u64,
        );
        let directory =
            PeerDirectory::new(PROTOCOL_VERSION, peer_timeout, self.config.peer.max_number_idle_socket);

        let search_index = Arc::new(Mutex::new(build_search_index(&chunk_service)));

        let (network, addr) = if self.networked {
            let network = NetworkService::start(
                &self.config,
                peer_id,
                chunk_service.mirror.clone(),
                chunk_service.chunk_index.clone(),
                search_index.clone(),
                directory.clone(),
            )
            .expect("network service binds");
            let addr = SocketAddr::new(self.config.network.listen_address, network.unicast_port);
            (Some(network), addr)
        } else {
            (None, SocketAddr::new("127.0.0.1".parse().unwrap(), 0))
        };

        let upload = UploadManager::new(self.config.upload.clone(), 8);
        let server_ctx = Arc::new(ServerContext {
            mirror: chunk_service.mirror.clone(),
            chunk_index: chunk_service.chunk_index.clone(),
            hasher: chunk_service.hasher.clone(),
            upload: upload.clone(),
            get_hashes_timeout: Duration::from_secs(self.config.peer.get_hashes_timeout_secs),
        });
        let listener = TcpListener::bind(addr).await.expect("tcp bind");
        let bound_addr = listener.local_addr().unwrap();
        let accept_task = tokio::spawn(accept_loop(listener, server_ctx));

        let queue = DownloadQueue::new();
        let downloads = DownloadManager::new(
            self.config.clone(),
            queue,
            chunk_service.mirror.clone(),
            chunk_service.chunk_index.clone(),
            directory.clone(),
        );
        downloads.start();

        Node {
            peer_id,
            chunk_service,
            directory,
            downloads,
            upload,
            addr: bound_addr,
            network,
            search_index,
            config: self.config,
            _root_dir: self.root_dir,
            _state_dir: self.state_dir,
            accept_task,
        }
    }
}

/// A fully running node: chunk mirror + hashing worker + watcher, peer
/// directory, upload pool, TCP request server, download manager, and
/// (optionally) the UDP presence beacon / search responder.
pub struct Node {
    pub peer_id: PeerId,
    pub chunk_service: Arc<ChunkService>,
    pub directory: PeerDirectory,
    pub downloads: Arc<DownloadManager>,
    pub upload: Arc<UploadManager>,
    pub addr: SocketAddr,
    pub network: Option<Arc<NetworkService>>,
    pub search_index: Arc<Mutex<SearchIndex>>,
    pub config: Config,
    _root_dir: TempDir,
    _state_dir: TempDir,
    accept_task: JoinHandle<()>,
}

impl Node {
    pub fn root_path(&self) -> PathBuf {
        self._root_dir.path().to_path_buf()
    }

    /// Wait (polling) until every chunk of `relative` has a known digest.
    pub async fn wait_hashed(&self, relative: &str) {
        let root = self.chunk_service.mirror.roots().into_iter().next().unwrap();
        let root_entry = self.chunk_service.mirror.root_entry(root.id).unwrap();
        let entry = self.chunk_service.mirror.find_child(root_entry, relative).expect("file scanned");
        for _ in 0..200 {
            if self
                .chunk_service
                .mirror
                .get_entry_clone(entry)
                .map(|e| e.has_all_hashes())
                .unwrap_or(false)
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("{} did not finish hashing in time", relative);
    }

    /// Simulate this node going dark: stop the beacon/search responder and
    /// the TCP accept loop, without a graceful shutdown handshake.
    pub fn kill(&self) {
        if let Some(network) = &self.network {
            network.stop();
        }
        self.accept_task.abort();
    }

    pub fn stop(&self) {
        self.kill();
        self.downloads.stop();
        self.chunk_service.stop();
    }
}

async fn accept_loop(listener: TcpListener, ctx: Arc<ServerContext>) {
    loop {
        match listener.accept().await {
            Ok((socket, _addr)) => {
                let ctx = ctx.clone();
                tokio::spawn(async move { serve_connection(ctx, socket).await });
            }
            Err(_) => return,
        }
    }
}

/// Rebuild a [`SearchIndex`] from a chunk service's mirror, the way
/// `dlan-node`'s `sync_search_index` does on a timer — done once here, right
/// after the initial scan, since tests don't need the periodic refresh.
fn build_search_index(chunk_service: &Arc<ChunkService>) -> SearchIndex {
    let mut index = SearchIndex::new();
    for root in chunk_service.mirror.roots() {
        if let Some(dir) = chunk_service.mirror.root_entry(root.id) {
            collect(chunk_service, dir, &mut index);
        }
    }
    index
}

fn collect(chunk_service: &Arc<ChunkService>, dir: dlan::types::EntryId, into: &mut SearchIndex) {
    for child in chunk_service.mirror.children(dir) {
        let Some(entry) = chunk_service.mirror.get_entry_clone(child) else { continue };
        match &entry.kind {
            EntryKind::Directory { .. } => collect(chunk_service, child, into),
            EntryKind::File { .. } => {
                let extension = entry.name.rsplit_once('.').map(|(_, ext)| ext.to_string());
                into.insert(dlan::search::SearchableEntry {
                    id: entry.id,
                    name: entry.name.clone(),
                    extension,
                    size: entry.size,
                });
            }
        }
    }
}

/// Poll `cond` until it's true or `timeout` elapses, returning whether it
/// converged.
pub async fn wait_until<F: Fn() -> bool>(timeout: Duration, cond: F) -> bool {
    let start = tokio::time::Instant::now();
    loop {
        if cond() {
            return true;
        }
        if start.elapsed() >= timeout {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
