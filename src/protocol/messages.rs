//! Message payloads carried by each frame type, plus the `bincode`
//! encode/decode helpers every handler uses to turn a frame body into one of
//! these structs and back.

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::types::{Digest, PeerId, SharedEntryWire};

/// Discriminant carried in the frame header's `type` byte. A reader checks
/// this before attempting to decode the body, so a body/type mismatch is
/// caught without ever running the deserializer on attacker-controlled bytes
/// for the wrong shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    GetEntries = 1,
    EntriesReply = 2,
    GetHashes = 3,
    HashesStatus = 4,
    HashResult = 5,
    GetChunk = 6,
    ChunkStatus = 7,
    ChunkBytes = 8,
    ChatMessages = 9,
    ImAlive = 10,
    FindRequest = 11,
    FindResult = 12,
}

impl MessageType {
    pub fn from_u8(b: u8) -> Option<Self> {
        use MessageType::*;
        Some(match b {
            1 => GetEntries,
            2 => EntriesReply,
            3 => GetHashes,
            4 => HashesStatus,
            5 => HashResult,
            6 => GetChunk,
            7 => ChunkStatus,
            8 => ChunkBytes,
            9 => ChatMessages,
            10 => ImAlive,
            11 => FindRequest,
            12 => FindResult,
            _ => return None,
        })
    }
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serialize(value).map_err(ProtocolError::from)
}

pub fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, ProtocolError> {
    bincode::deserialize(bytes).map_err(ProtocolError::from)
}

/// `GET_ENTRIES` request: directory refs (by relative path), optionally
/// scoped to a shared root. An empty path with no root requests the
/// top-level shared-root list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetEntries {
    pub root_id: Option<uuid::Uuid>,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedRootWire {
    pub id: uuid::Uuid,
    pub name: String,
    pub total_size: u64,
    pub free_space: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntriesReply {
    pub entries: Vec<SharedEntryWire>,
    /// Only non-empty when the request had no root/path: the shared-root list.
    pub roots: Vec<SharedRootWire>,
}

/// `GET_HASHES` request: identifies a file by path and its expected chunk
/// count (from a prior `GET_ENTRIES` reply), so the responder can validate
/// the layout before streaming hashes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetHashesRequest {
    pub path: String,
    pub chunk_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashesStatusKind {
    Ok,
    UnknownEntry,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashesStatus {
    pub status: HashesStatusKind,
    pub nb_hash: u32,
}

/// One chunk's digest, streamed on the same socket after `HashesStatus`, in
/// chunk-number order for any one subscriber (ordering guarantee in spec §5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashResult {
    pub num: u32,
    pub digest: Digest,
}

/// `GET_CHUNK` request: content-addressed by digest, with a byte offset for
/// resuming a partially-read stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetChunkRequest {
    pub digest: Digest,
    pub offset: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkStatusKind {
    Ok,
    DontHaveIt,
    Busy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkStatus {
    pub status: ChunkStatusKind,
    /// Bytes that will follow on the socket as raw `ChunkBytes` frames, `0`
    /// when `status != Ok`.
    pub size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessages {
    pub entries: Vec<String>,
}

/// Presence beacon, broadcast every `peer_imalive_period` and on receipt
/// upserted into the peer directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImAlive {
    pub peer_id: PeerId,
    pub nickname: String,
    pub listening_port: u16,
    pub shared_bytes: u64,
    pub download_rate: f64,
    pub upload_rate: f64,
    pub protocol_version: u32,
    /// Monotonic send timestamp (ms since an arbitrary epoch); receivers
    /// ignore beacons older than the latest seen from the same peer (spec §5
    /// ordering guarantee 3).
    pub timestamp_ms: u64,
    /// Rotating sample of owned digests, at most `number_of_hashes_sent_imalive`.
    pub chunks_of_interest: Vec<Digest>,
}

/// Broadcast search request, tagged so result fan-in can discard stale or
/// foreign replies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindRequest {
    pub tag: u64,
    pub pattern: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindResult {
    pub tag: u64,
    pub peer_id: PeerId,
    pub entries: Vec<SharedEntryWire>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_entries_round_trips() {
        let msg = GetEntries { root_id: None, path: "sub/dir".to_string() };
        let bytes = encode(&msg).unwrap();
        let decoded: GetEntries = decode(&bytes).unwrap();
        assert_eq!(decoded.path, "sub/dir");
    }

    #[test]
    fn im_alive_round_trips() {
        let msg = ImAlive {
            peer_id: PeerId([7; 20]),
            nickname: "bob".to_string(),
            listening_port: 12345,
            shared_bytes: 42,
            download_rate: 1.0,
            upload_rate: 2.0,
            protocol_version: 1,
            timestamp_ms: 100,
            chunks_of_interest: vec![Digest::of(b"x")],
        };
        let bytes = encode(&msg).unwrap();
        let decoded: ImAlive = decode(&bytes).unwrap();
        assert_eq!(decoded.nickname, "bob");
        assert_eq!(decoded.chunks_of_interest.len(), 1);
    }
}
