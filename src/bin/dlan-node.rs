//! `dlan-node`: starts every subsystem for one node and blocks on a small
//! stdin command loop. Shared directories are passed on the command line;
//! everything else is tuned via the config file (or `DLAN_*` env vars).

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

use dlan::chunk::service::ChunkService;
use dlan::config::Config;
use dlan::download::{DownloadManager, DownloadQueue};
use dlan::logging::{error, info, warn};
use dlan::peer::PeerDirectory;
use dlan::protocol::{serve_connection, ServerContext};
use dlan::search::{SearchIndex, SearchableEntry};
use dlan::types::{EntryKind, PeerId, RootAccess};
use dlan::upload::UploadManager;
use dlan::NetworkService;

#[derive(Parser, Debug)]
#[command(name = "dlan-node", about = "Decentralized LAN file-sharing node")]
struct Cli {
    /// Path to the TOML config file.
    #[arg(short, long, default_value = "dlan.toml")]
    config: PathBuf,
    /// Directories to share read-write (new downloads may land here).
    #[arg(long = "share")]
    share: Vec<PathBuf>,
    /// Directories to share read-only.
    #[arg(long = "read-only")]
    read_only: Vec<PathBuf>,
}

#[tokio::main]
async fn main() {
    dlan::logging::init_tracing();

    let cli = Cli::parse();
    let config = match Config::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            error!("failed to load config from {}: {}", cli.config.display(), e);
            Config::default()
        }
    };

    if let Err(e) = run(config, cli.share, cli.read_only).await {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}

async fn run(
    config: Config,
    share: Vec<PathBuf>,
    read_only: Vec<PathBuf>,
) -> Result<(), dlan::NodeError> {
    let peer_id = load_or_create_peer_id(&config.paths.state_dir)?;
    info!("starting as {} ({})", config.nickname, peer_id);

    let chunk_service = ChunkService::new(config.clone());
    chunk_service.start();
    for dir in share {
        chunk_service.add_root(dir, RootAccess::ReadWrite).await;
    }
    for dir in read_only {
        chunk_service.add_root(dir, RootAccess::ReadOnly).await;
    }

    let search_index = Arc::new(Mutex::new(SearchIndex::new()));
    let search_sync_task = tokio::spawn(sync_search_index(chunk_service.clone(), search_index.clone()));

    let peer_timeout = Duration::from_secs(
        config.peer.peer_imalive_period_secs * config.peer.peer_timeout_factor as u64,
    );
    let directory =
        PeerDirectory::new(PROTOCOL_VERSION, peer_timeout, config.peer.max_number_idle_socket);

    let network = NetworkService::start(
        &config,
        peer_id,
        chunk_service.mirror.clone(),
        chunk_service.chunk_index.clone(),
        search_index,
        directory.clone(),
    )?;

    let upload = UploadManager::new(config.upload.clone(), config.download.number_of_downloader * 4);
    let server_ctx = Arc::new(ServerContext {
        mirror: chunk_service.mirror.clone(),
        chunk_index: chunk_service.chunk_index.clone(),
        hasher: chunk_service.hasher.clone(),
        upload: upload.clone(),
        get_hashes_timeout: Duration::from_secs(config.peer.get_hashes_timeout_secs),
    });
    let listen_addr = SocketAddr::new(config.network.listen_address, network.unicast_port);
    let tcp_listener = TcpListener::bind(listen_addr).await.map_err(dlan::error::NetworkError::from)?;
    let accept_task = tokio::spawn(accept_loop(tcp_listener, server_ctx));

    let queue = DownloadQueue::load(&config.paths.state_dir).unwrap_or_else(|e| {
        warn!("FILE_QUEUE unreadable ({}), starting with an empty download queue", e);
        DownloadQueue::new()
    });
    let downloads = DownloadManager::new(
        config.clone(),
        queue,
        chunk_service.mirror.clone(),
        chunk_service.chunk_index.clone(),
        directory.clone(),
    );
    downloads.spawn_chunk_of_interest_forwarder(network.beacon.subscribe_chunks_of_interest());
    downloads.start();

    let prune_task = tokio::spawn(prune_expired_peers(directory.clone(), peer_timeout));

    run_command_loop().await;

    info!("shutting down");
    search_sync_task.abort();
    accept_task.abort();
    prune_task.abort();
    downloads.stop();
    network.stop();
    chunk_service.stop();
    Ok(())
}

/// Protocol version advertised in every beacon and handshake. Bumped
/// whenever the wire format changes in a way old nodes can't parse.
const PROTOCOL_VERSION: u32 = 1;

async fn accept_loop(listener: TcpListener, ctx: Arc<ServerContext>) {
    loop {
        match listener.accept().await {
            Ok((socket, addr)) => {
                info!("accepted connection from {}", addr);
                let ctx = ctx.clone();
                tokio::spawn(async move { serve_connection(ctx, socket).await });
            }
            Err(e) => warn!("accept error: {}", e),
        }
    }
}

async fn prune_expired_peers(directory: PeerDirectory, period: Duration) {
    let mut ticker = tokio::time::interval(period.max(Duration::from_secs(1)));
    loop {
        ticker.tick().await;
        for id in directory.prune_expired() {
            info!("peer {} expired", id);
        }
    }
}

/// Rebuild the search index from the mirror every few seconds. A full
/// rebuild rather than an incremental feed from the scanner/hasher: simpler
/// to reason about and cheap enough at LAN-share scale.
async fn sync_search_index(chunk_service: Arc<ChunkService>, search_index: Arc<Mutex<SearchIndex>>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(5));
    loop {
        ticker.tick().await;
        let mut fresh = SearchIndex::new();
        for root in chunk_service.mirror.roots() {
            if let Some(dir) = chunk_service.mirror.root_entry(root.id) {
                collect_searchable(&chunk_service, dir, &mut fresh);
            }
        }
        *search_index.lock().unwrap() = fresh;
    }
}

fn collect_searchable(chunk_service: &ChunkService, dir: dlan::types::EntryId, into: &mut SearchIndex) {
    for child in chunk_service.mirror.children(dir) {
        let Some(entry) = chunk_service.mirror.get_entry_clone(child) else { continue };
        match &entry.kind {
            EntryKind::Directory { .. } => collect_searchable(chunk_service, child, into),
            EntryKind::File { .. } => {
                let extension = entry.name.rsplit_once('.').map(|(_, ext)| ext.to_string());
                into.insert(SearchableEntry {
                    id: entry.id,
                    name: entry.name.clone(),
                    extension,
                    size: entry.size,
                });
            }
        }
    }
}

/// Read `PEER_ID` from `state_dir`, or mint and persist a fresh one — a
/// peer's ID is meant to stay stable across restarts (spec: "stable peer ID
/// (hash)"), unlike [`dlan::types::RootId`], which a shared root's own
/// configuration would need to persist separately.
fn load_or_create_peer_id(state_dir: &Path) -> Result<PeerId, dlan::NodeError> {
    std::fs::create_dir_all(state_dir)?;
    let path = state_dir.join("PEER_ID");
    if let Ok(text) = std::fs::read_to_string(&path) {
        if let Some(id) = parse_peer_id(text.trim()) {
            return Ok(id);
        }
        warn!("PEER_ID at {} is corrupted, minting a new identity", path.display());
    }
    let id = PeerId::generate();
    std::fs::write(&path, id.to_hex())?;
    Ok(id)
}

fn parse_peer_id(hex_str: &str) -> Option<PeerId> {
    let bytes = hex::decode(hex_str).ok()?;
    let array: [u8; 20] = bytes.try_into().ok()?;
    Some(PeerId(array))
}

/// Spec's optional CLI collaborator: a single stdin line reader recognizing
/// `quit`/`help`; any other input prints help. Returns once `quit` is read
/// or stdin closes.
async fn run_command_loop() {
    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();
    print_help().await;
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match line.trim() {
                "quit" => break,
                "help" => print_help().await,
                _ => print_help().await,
            },
            Ok(None) => break, // stdin closed
            Err(e) => {
                warn!("stdin read error: {}", e);
                break;
            }
        }
    }
}

async fn print_help() {
    let mut stdout = tokio::io::stdout();
    let _ = stdout
        .write_all(b"commands: quit, help\n")
        .await;
    let _ = stdout.flush().await;
}
