//! Error taxonomy for the node.
//!
//! Each subsystem defines its own error enum; [`NodeError`] aggregates them so
//! callers at the boundary (CLI, tests) can match on a single type while
//! internal code keeps narrow, specific error types close to where they are
//! raised.

use std::fmt;
use std::io;
use std::path::PathBuf;

/// Top-level error type returned by the public API of this crate.
#[derive(Debug)]
pub enum NodeError {
    Chunk(ChunkError),
    Mirror(MirrorError),
    Peer(PeerError),
    Protocol(ProtocolError),
    Download(DownloadError),
    Network(NetworkError),
    Config(ConfigError),
    Io(io::Error),
    Other(String),
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeError::Chunk(e) => write!(f, "chunk error: {e}"),
            NodeError::Mirror(e) => write!(f, "mirror error: {e}"),
            NodeError::Peer(e) => write!(f, "peer error: {e}"),
            NodeError::Protocol(e) => write!(f, "protocol error: {e}"),
            NodeError::Download(e) => write!(f, "download error: {e}"),
            NodeError::Network(e) => write!(f, "network error: {e}"),
            NodeError::Config(e) => write!(f, "config error: {e}"),
            NodeError::Io(e) => write!(f, "I/O error: {e}"),
            NodeError::Other(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for NodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NodeError::Chunk(e) => Some(e),
            NodeError::Mirror(e) => Some(e),
            NodeError::Peer(e) => Some(e),
            NodeError::Protocol(e) => Some(e),
            NodeError::Download(e) => Some(e),
            NodeError::Network(e) => Some(e),
            NodeError::Config(e) => Some(e),
            NodeError::Io(e) => Some(e),
            NodeError::Other(_) => None,
        }
    }
}

impl From<io::Error> for NodeError {
    fn from(e: io::Error) -> Self {
        NodeError::Io(e)
    }
}

macro_rules! impl_from {
    ($variant:ident, $ty:ty) => {
        impl From<$ty> for NodeError {
            fn from(e: $ty) -> Self {
                NodeError::$variant(e)
            }
        }
    };
}

impl_from!(Chunk, ChunkError);
impl_from!(Mirror, MirrorError);
impl_from!(Peer, PeerError);
impl_from!(Protocol, ProtocolError);
impl_from!(Download, DownloadError);
impl_from!(Network, NetworkError);
impl_from!(Config, ConfigError);

/// Errors raised by the chunk store (digest index, hashing worker).
#[derive(Debug)]
pub enum ChunkError {
    /// A read was attempted past the known-byte boundary of a partial chunk.
    NotFullyKnown { chunk_num: u32 },
    /// The incremental digest did not match the chunk's recorded digest.
    HashMismatch { chunk_num: u32 },
    Io(io::Error),
}

impl fmt::Display for ChunkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkError::NotFullyKnown { chunk_num } => {
                write!(f, "chunk {chunk_num} is not fully known")
            }
            ChunkError::HashMismatch { chunk_num } => {
                write!(f, "chunk {chunk_num} failed integrity check")
            }
            ChunkError::Io(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ChunkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ChunkError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ChunkError {
    fn from(e: io::Error) -> Self {
        ChunkError::Io(e)
    }
}

/// Errors raised by the file mirror (scan, root management, download target creation).
#[derive(Debug)]
pub enum MirrorError {
    NoWritableRoot,
    InsufficientSpace { needed: u64, available: u64 },
    SuperDirectoryExists { super_dir: PathBuf, sub_dir: PathBuf },
    FileNotFound { path: PathBuf },
    DirNotFound { path: PathBuf },
    Io(io::Error),
}

impl fmt::Display for MirrorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MirrorError::NoWritableRoot => write!(f, "no writable shared root available"),
            MirrorError::InsufficientSpace { needed, available } => write!(
                f,
                "insufficient space: need {needed} bytes, {available} available"
            ),
            MirrorError::SuperDirectoryExists { super_dir, sub_dir } => write!(
                f,
                "{} is already a shared root containing {}",
                super_dir.display(),
                sub_dir.display()
            ),
            MirrorError::FileNotFound { path } => write!(f, "file not found: {}", path.display()),
            MirrorError::DirNotFound { path } => {
                write!(f, "directory not found: {}", path.display())
            }
            MirrorError::Io(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for MirrorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MirrorError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for MirrorError {
    fn from(e: io::Error) -> Self {
        MirrorError::Io(e)
    }
}

/// Errors raised by the peer directory and connection pool.
#[derive(Debug)]
pub enum PeerError {
    Unknown { id: String },
    NotAvailable { id: String },
    Io(io::Error),
}

impl fmt::Display for PeerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerError::Unknown { id } => write!(f, "unknown peer {id}"),
            PeerError::NotAvailable { id } => write!(f, "peer {id} is not available"),
            PeerError::Io(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for PeerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PeerError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for PeerError {
    fn from(e: io::Error) -> Self {
        PeerError::Io(e)
    }
}

/// Errors raised while framing or handling the core-to-core wire protocol.
#[derive(Debug)]
pub enum ProtocolError {
    MalformedFrame { reason: String },
    MessageTooLarge { size: u32, max: u32 },
    UnknownMessageType(u8),
    DontHaveIt,
    UnknownEntry,
    Busy,
    Timeout,
    Io(io::Error),
    Bincode(bincode::Error),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::MalformedFrame { reason } => write!(f, "malformed frame: {reason}"),
            ProtocolError::MessageTooLarge { size, max } => {
                write!(f, "message too large: {size} bytes (max {max})")
            }
            ProtocolError::UnknownMessageType(t) => write!(f, "unknown message type {t}"),
            ProtocolError::DontHaveIt => write!(f, "peer does not have the requested entry"),
            ProtocolError::UnknownEntry => write!(f, "unknown entry"),
            ProtocolError::Busy => write!(f, "peer is busy"),
            ProtocolError::Timeout => write!(f, "protocol operation timed out"),
            ProtocolError::Io(e) => write!(f, "{e}"),
            ProtocolError::Bincode(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ProtocolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProtocolError::Io(e) => Some(e),
            ProtocolError::Bincode(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<io::Error> for ProtocolError {
    fn from(e: io::Error) -> Self {
        ProtocolError::Io(e)
    }
}

impl From<bincode::Error> for ProtocolError {
    fn from(e: bincode::Error) -> Self {
        ProtocolError::Bincode(e)
    }
}

/// Errors surfaced by the download manager.
#[derive(Debug)]
pub enum DownloadError {
    ErrorDisk { message: String },
    NoSource,
    HashMismatch { chunk_num: u32 },
    QueueCorrupted { message: String },
    Io(io::Error),
}

impl fmt::Display for DownloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownloadError::ErrorDisk { message } => write!(f, "disk error: {message}"),
            DownloadError::NoSource => write!(f, "no source available for download"),
            DownloadError::HashMismatch { chunk_num } => {
                write!(f, "chunk {chunk_num} failed integrity check")
            }
            DownloadError::QueueCorrupted { message } => {
                write!(f, "download queue corrupted: {message}")
            }
            DownloadError::Io(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for DownloadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DownloadError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for DownloadError {
    fn from(e: io::Error) -> Self {
        DownloadError::Io(e)
    }
}

/// Errors raised by the UDP network listener.
#[derive(Debug)]
pub enum NetworkError {
    AllPortsExhausted { base_port: u16 },
    MessageTooLarge { size: usize, max: usize },
    Io(io::Error),
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkError::AllPortsExhausted { base_port } => write!(
                f,
                "could not bind a unicast port starting from {base_port}"
            ),
            NetworkError::MessageTooLarge { size, max } => {
                write!(f, "datagram too large: {size} bytes (max {max})")
            }
            NetworkError::Io(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for NetworkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NetworkError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for NetworkError {
    fn from(e: io::Error) -> Self {
        NetworkError::Io(e)
    }
}

/// Errors raised while loading or validating configuration.
#[derive(Debug)]
pub enum ConfigError {
    Parse { message: String },
    Io(io::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Parse { message } => write!(f, "{message}"),
            ConfigError::Io(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ConfigError {
    fn from(e: io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse { message: e.to_string() }
    }
}
