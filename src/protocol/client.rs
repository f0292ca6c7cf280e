//! Request-issuing helpers for the download manager: each function borrows a
//! socket from a peer's [`crate::peer::pool::ConnectionPool`], writes one
//! request frame, and reads back the matching reply — no pipelining, mirror
//! of the server's one-request-at-a-time discipline (spec §5).

use tokio::io::AsyncRead;
use tokio::net::TcpStream;

use crate::error::ProtocolError;
use crate::protocol::frame;
use crate::protocol::messages::*;
use crate::types::Digest;

/// List the shared-root table from a peer.
pub async fn get_roots(socket: &mut TcpStream) -> Result<Vec<SharedRootWire>, ProtocolError> {
    let reply = get_entries(socket, None, String::new()).await?;
    Ok(reply.roots)
}

/// List the children of a directory (or a root's top level if `path` is
/// empty and `root_id` is `Some`).
pub async fn get_entries(
    socket: &mut TcpStream,
    root_id: Option<uuid::Uuid>,
    path: String,
) -> Result<EntriesReply, ProtocolError> {
    let req = GetEntries { root_id, path };
    request_reply(socket, MessageType::GetEntries, &req, MessageType::EntriesReply).await
}

/// Request a file's per-chunk digests. Unlike the other requests, the reply
/// is a `HashesStatus` header followed by `chunk_count` (at most)
/// `HashResult` frames streamed on the same socket — the caller keeps
/// reading frames until it has collected every chunk it's waiting on or a
/// timeout elapses upstream (the download manager owns the timeout, since it
/// knows how many chunks are still missing).
pub async fn get_hashes_header(
    socket: &mut TcpStream,
    path: String,
    chunk_count: u32,
) -> Result<HashesStatus, ProtocolError> {
    let req = GetHashesRequest { path, chunk_count };
    request_reply(socket, MessageType::GetHashes, &req, MessageType::HashesStatus).await
}

/// Read one more `HASH_RESULT` frame off a socket already mid-`GET_HASHES`.
pub async fn read_hash_result(socket: &mut TcpStream) -> Result<HashResult, ProtocolError> {
    let header = frame::read_header(socket).await?;
    if header.message_type != MessageType::HashResult {
        return Err(ProtocolError::MalformedFrame {
            reason: format!("expected HASH_RESULT, got {:?}", header.message_type),
        });
    }
    let body = frame::read_body(socket, header.payload_len).await?;
    decode(&body)
}

/// Request a chunk by digest; returns the status header. On `Ok`, exactly
/// `size` raw bytes follow on the socket and must be read by the caller
/// (the download manager streams them straight into the target file rather
/// than buffering here).
pub async fn get_chunk_header(
    socket: &mut TcpStream,
    digest: Digest,
    offset: u64,
) -> Result<ChunkStatus, ProtocolError> {
    let req = GetChunkRequest { digest, offset };
    request_reply(socket, MessageType::GetChunk, &req, MessageType::ChunkStatus).await
}

/// Read exactly `size` raw chunk bytes following a successful
/// [`get_chunk_header`] call. Bytes are not framed individually — the
/// responder just streams them after the `ChunkStatus` frame.
pub async fn read_chunk_bytes<R: AsyncRead + Unpin>(
    socket: &mut R,
    size: u32,
) -> Result<Vec<u8>, ProtocolError> {
    use tokio::io::AsyncReadExt;
    let mut buf = vec![0u8; size as usize];
    socket.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn request_reply<Req: serde::Serialize, Rep: for<'de> serde::Deserialize<'de>>(
    socket: &mut TcpStream,
    request_type: MessageType,
    request: &Req,
    expected_reply_type: MessageType,
) -> Result<Rep, ProtocolError> {
    let body = encode(request)?;
    frame::write_frame(socket, request_type, &body).await?;

    let header = frame::read_header(socket).await?;
    if header.message_type != expected_reply_type {
        return Err(ProtocolError::MalformedFrame {
            reason: format!(
                "expected {:?} reply, got {:?}",
                expected_reply_type, header.message_type
            ),
        });
    }
    let reply_body = frame::read_body(socket, header.payload_len).await?;
    decode(&reply_body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::server::{serve_connection, ServerContext};
    use crate::chunk::mirror::Mirror;
    use crate::chunk::store::ChunkIndex;
    use crate::chunk::hasher::HashingWorker;
    use crate::config::Config;
    use crate::types::RootAccess;
    use crate::upload::UploadManager;
    use std::sync::Arc;
    use std::time::Duration;

    fn make_ctx(dir: &std::path::Path) -> Arc<ServerContext> {
        let mirror = Arc::new(Mirror::new());
        mirror.add_root(dir.to_path_buf(), RootAccess::ReadWrite);
        Arc::new(ServerContext {
            mirror,
            chunk_index: Arc::new(ChunkIndex::new()),
            hasher: HashingWorker::new(),
            upload: UploadManager::new(Config::default().upload, 4),
            get_hashes_timeout: Duration::from_secs(2),
        })
    }

    #[tokio::test]
    async fn get_roots_round_trips_over_a_duplex_like_tcp_pair() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = make_ctx(dir.path());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept_ctx = ctx.clone();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            serve_connection(accept_ctx, socket).await;
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let roots = get_roots(&mut client).await.unwrap();
        assert_eq!(roots.len(), 1);
    }
}
