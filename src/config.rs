//! Unified runtime configuration.
//!
//! Consolidates every tuning knob referenced across the subsystems into one
//! struct, loaded once at start-up and threaded through constructors
//! (snapshotted — no live reload). Values are read from a TOML file, then
//! overridden by `DLAN_*` environment variables; anything out of range is
//! silently replaced by its default with a logged warning, never a startup
//! failure.

use std::net::IpAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::logging::warn;

/// Fixed chunk size. Unlike content-defined chunking, this is a compile-time
/// constant: every chunk except the last one of a file is exactly this size.
pub const CHUNK_SIZE: u64 = 2 * 1024 * 1024;

/// Which IP families to listen on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ListenFamily {
    Ipv4,
    Ipv6,
    Both,
}

impl Default for ListenFamily {
    fn default() -> Self {
        ListenFamily::Ipv4
    }
}

/// Chunk store, mirror, hashing worker, and watcher tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChunkingConfig {
    /// Minimum duration (ms) a hashing burst runs before yielding to a
    /// higher-priority file, so one prioritized request can't starve a
    /// large file already being hashed.
    pub min_hashing_duration_ms: u64,
    /// Verify a chunk's digest against its recorded hash when data is
    /// received over the network.
    pub check_received_data_integrity: bool,
    /// Poll period (s) for shared roots on filesystems without native watch
    /// support.
    pub scan_period_unwatchable_dirs_secs: u64,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            min_hashing_duration_ms: 200,
            check_received_data_integrity: true,
            scan_period_unwatchable_dirs_secs: 60,
        }
    }
}

/// Search index tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SearchConfig {
    pub max_number_of_search_result_to_send: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self { max_number_of_search_result_to_send: 100 }
    }
}

/// Peer directory and per-peer connection pool tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PeerConfig {
    /// How often we (and, by agreement, our peers) emit a presence beacon.
    pub peer_imalive_period_secs: u64,
    /// Multiple of `peer_imalive_period` after which a peer with no update
    /// is considered dead.
    pub peer_timeout_factor: u32,
    /// Idle sockets kept warm per peer.
    pub max_number_idle_socket: usize,
    pub idle_socket_timeout_secs: u64,
    pub pending_socket_timeout_secs: u64,
    pub get_hashes_timeout_secs: u64,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            peer_imalive_period_secs: 5,
            peer_timeout_factor: 3,
            max_number_idle_socket: 3,
            idle_socket_timeout_secs: 30,
            pending_socket_timeout_secs: 10,
            get_hashes_timeout_secs: 30,
        }
    }
}

/// UDP listener tuning: ports, multicast group, throughput cap.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NetworkConfig {
    pub listen_address: IpAddr,
    pub listen_any: ListenFamily,
    pub unicast_base_port: u16,
    pub multicast_group: IpAddr,
    pub multicast_port: u16,
    pub multicast_ttl: u32,
    pub max_udp_datagram_size: usize,
    /// Digests attached to each presence beacon, rotating through the owned
    /// set each tick.
    pub number_of_hashes_sent_imalive: usize,
    pub search_lifetime_secs: u64,
    pub max_number_of_result_shown: usize,
    /// Outbound beacon byte-rate cap, in bytes/sec.
    pub max_imalive_throughput: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0".parse().unwrap(),
            listen_any: ListenFamily::Ipv4,
            unicast_base_port: 56144,
            multicast_group: "239.168.1.2".parse().unwrap(),
            multicast_port: 56145,
            multicast_ttl: 1,
            max_udp_datagram_size: 8192,
            number_of_hashes_sent_imalive: 20,
            search_lifetime_secs: 6,
            max_number_of_result_shown: 50,
            max_imalive_throughput: 1024 * 1024,
        }
    }
}

/// Download manager tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DownloadConfig {
    /// Maximum number of chunks being actively downloaded at once, across
    /// all queued files.
    pub number_of_downloader: usize,
    /// A donor is dropped in favor of another one whose observed rate
    /// exceeds `ours * switch_to_another_peer_factor`.
    pub switch_to_another_peer_factor: f64,
    pub block_duration_corrupted_data_secs: u64,
    pub restart_downloads_period_if_error_secs: u64,
    pub save_queue_period_secs: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            number_of_downloader: 3,
            switch_to_another_peer_factor: 1.5,
            block_duration_corrupted_data_secs: 600,
            restart_downloads_period_if_error_secs: 30,
            save_queue_period_secs: 10,
        }
    }
}

/// Upload manager (chunk-serving worker pool) tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UploadConfig {
    pub upload_min_nb_thread: usize,
    pub upload_thread_lifetime_secs: u64,
    pub upload_lifetime_secs: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            upload_min_nb_thread: 2,
            upload_thread_lifetime_secs: 60,
            upload_lifetime_secs: 300,
        }
    }
}

/// Filesystem locations the node owns.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PathsConfig {
    /// Directory holding `FILE_CACHE`-style per-root caches and `FILE_QUEUE`.
    pub state_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self { state_dir: default_state_dir() }
    }
}

fn default_state_dir() -> PathBuf {
    dirs_home().join(".dlan")
}

fn dirs_home() -> PathBuf {
    std::env::var_os("HOME").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."))
}

/// Top-level configuration, consolidating every tunable referenced by the
/// subsystems into one struct, the way a process-wide settings object should
/// be threaded through constructors rather than read ambiently.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub nickname: String,
    pub chunking: ChunkingConfig,
    pub search: SearchConfig,
    pub peer: PeerConfig,
    pub network: NetworkConfig,
    pub download: DownloadConfig,
    pub upload: UploadConfig,
    pub paths: PathsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            nickname: whoami(),
            chunking: ChunkingConfig::default(),
            search: SearchConfig::default(),
            peer: PeerConfig::default(),
            network: NetworkConfig::default(),
            download: DownloadConfig::default(),
            upload: UploadConfig::default(),
            paths: PathsConfig::default(),
        }
    }
}

fn whoami() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "anonymous".to_string())
}

impl Config {
    /// Load configuration from a TOML file, falling back to defaults for any
    /// field the file omits, then apply `DLAN_*` environment overrides, then
    /// clamp and validate.
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path)?;
            toml::from_str(&text)?
        } else {
            Config::default()
        };
        config.apply_env_overrides();
        config.validate();
        Ok(config)
    }

    /// Apply `DLAN_*` environment variable overrides on top of the loaded
    /// (or default) values.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("DLAN_NICKNAME") {
            self.nickname = v;
        }
        if let Ok(v) = std::env::var("DLAN_UNICAST_BASE_PORT") {
            if let Ok(p) = v.parse() {
                self.network.unicast_base_port = p;
            }
        }
        if let Ok(v) = std::env::var("DLAN_MULTICAST_GROUP") {
            if let Ok(g) = v.parse() {
                self.network.multicast_group = g;
            }
        }
        if let Ok(v) = std::env::var("DLAN_STATE_DIR") {
            self.paths.state_dir = PathBuf::from(v);
        }
    }

    /// Replace any out-of-range value with its default, logging a warning
    /// for each one replaced. Never fails: every field has a sane default.
    pub fn validate(&mut self) {
        let defaults = Config::default();

        if self.chunking.min_hashing_duration_ms == 0 {
            warn!("chunking.minHashingDurationMs must be > 0, using default");
            self.chunking.min_hashing_duration_ms = defaults.chunking.min_hashing_duration_ms;
        }
        if self.search.max_number_of_search_result_to_send == 0 {
            warn!("search.maxNumberOfSearchResultToSend must be > 0, using default");
            self.search.max_number_of_search_result_to_send =
                defaults.search.max_number_of_search_result_to_send;
        }
        if self.peer.peer_imalive_period_secs == 0 {
            warn!("peer.peerImalivePeriodSecs must be > 0, using default");
            self.peer.peer_imalive_period_secs = defaults.peer.peer_imalive_period_secs;
        }
        if self.peer.peer_timeout_factor == 0 {
            warn!("peer.peerTimeoutFactor must be > 0, using default");
            self.peer.peer_timeout_factor = defaults.peer.peer_timeout_factor;
        }
        if self.peer.max_number_idle_socket == 0 {
            warn!("peer.maxNumberIdleSocket must be > 0, using default");
            self.peer.max_number_idle_socket = defaults.peer.max_number_idle_socket;
        }
        if self.network.unicast_base_port == 0 {
            warn!("network.unicastBasePort must be > 0, using default");
            self.network.unicast_base_port = defaults.network.unicast_base_port;
        }
        if !self.network.multicast_group.is_multicast() {
            warn!("network.multicastGroup is not a multicast address, using default");
            self.network.multicast_group = defaults.network.multicast_group;
        }
        if self.network.max_udp_datagram_size == 0 {
            warn!("network.maxUdpDatagramSize must be > 0, using default");
            self.network.max_udp_datagram_size = defaults.network.max_udp_datagram_size;
        }
        if self.network.max_imalive_throughput == 0 {
            warn!("network.maxImaliveThroughput must be > 0, using default");
            self.network.max_imalive_throughput = defaults.network.max_imalive_throughput;
        }
        if self.download.number_of_downloader == 0 {
            warn!("download.numberOfDownloader must be > 0, using default");
            self.download.number_of_downloader = defaults.download.number_of_downloader;
        }
        if self.download.switch_to_another_peer_factor <= 1.0 {
            warn!("download.switchToAnotherPeerFactor must be > 1.0, using default");
            self.download.switch_to_another_peer_factor =
                defaults.download.switch_to_another_peer_factor;
        }
        if self.upload.upload_min_nb_thread == 0 {
            warn!("upload.uploadMinNbThread must be > 0, using default");
            self.upload.upload_min_nb_thread = defaults.upload.upload_min_nb_thread;
        }
    }
}
