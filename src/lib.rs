//! # dlan — decentralized LAN file-sharing node
//!
//! A LAN-local peer that mirrors a set of shared directories as
//! content-addressable chunks, advertises itself and what it has over UDP
//! multicast, and exchanges chunks with other nodes over a small TCP
//! protocol.
//!
//! The five subsystems compose as:
//!
//! - [`chunk`] — the file mirror, chunk index, hashing worker, and watchers.
//! - [`search`] — the word/extension/size index used to answer `FIND`.
//! - [`peer`] — the peer directory and per-peer connection pools.
//! - [`net`] — the UDP presence beacon and search responder.
//! - [`protocol`] — the TCP wire format and per-connection request dispatch.
//! - [`download`] and [`upload`] — the transfer engines built on top.

#![deny(unsafe_code)]
#![warn(dead_code)]

pub mod chunk;
pub mod config;
pub mod download;
pub mod error;
pub mod logging;
pub mod net;
pub mod peer;
pub mod protocol;
pub mod search;
pub mod types;
pub mod upload;

pub use config::Config;
pub use download::DownloadManager;
pub use error::NodeError;
pub use net::NetworkService;
pub use peer::PeerDirectory;
pub use upload::UploadManager;
