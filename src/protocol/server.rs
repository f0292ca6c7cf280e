//! Per-connection request dispatch: reads one request frame, handles it, and
//! (for streaming responses) writes further frames, then loops back for the
//! next request — FIFO, one request at a time per socket (spec §5 ordering
//! guarantee 2: "pipelining is not used").

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::chunk::hasher::HashingWorker;
use crate::chunk::mirror::Mirror;
use crate::chunk::store::ChunkIndex;
use crate::error::ProtocolError;
use crate::logging::debug;
use crate::protocol::frame::{self, MAX_FRAME_BODY};
use crate::protocol::messages::*;
use crate::upload::{UploadJob, UploadManager};

/// Everything a connection handler needs, shared across every accepted
/// socket.
pub struct ServerContext {
    pub mirror: Arc<Mirror>,
    pub chunk_index: Arc<ChunkIndex>,
    pub hasher: Arc<HashingWorker>,
    pub upload: Arc<UploadManager>,
    pub get_hashes_timeout: Duration,
}

/// Serve requests on one accepted socket until it errors or the peer closes
/// it. Errors from an individual request are logged and end the connection
/// (per spec: malformed frame closes the socket; other protocol-level errors
/// are reported to the caller without teardown — handled inside each request
/// by writing a status frame rather than propagating).
pub async fn serve_connection<S>(ctx: Arc<ServerContext>, mut socket: S)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    loop {
        match handle_one_request(&ctx, &mut socket).await {
            Ok(true) => continue,
            Ok(false) => break,
            Err(e) => {
                debug!("connection closed: {}", e);
                break;
            }
        }
    }
}

/// Handles exactly one request/response cycle. Returns `Ok(false)` on clean
/// EOF (no more requests coming).
async fn handle_one_request<S>(ctx: &Arc<ServerContext>, socket: &mut S) -> Result<bool, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let header = match frame::read_header(socket).await {
        Ok(h) => h,
        Err(ProtocolError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Ok(false);
        }
        Err(e) => return Err(e),
    };
    let body = frame::read_body(socket, header.payload_len).await?;

    match header.message_type {
        MessageType::GetEntries => handle_get_entries(ctx, socket, &body).await?,
        MessageType::GetHashes => handle_get_hashes(ctx, socket, &body).await?,
        MessageType::GetChunk => handle_get_chunk(ctx, socket, &body).await?,
        MessageType::ChatMessages => {
            let _msg: ChatMessages = decode(&body)?;
            // Chat is an out-of-scope collaborator (spec §1); we accept and
            // drop it rather than reject the connection.
        }
        other => {
            return Err(ProtocolError::MalformedFrame {
                reason: format!("unexpected request type {other:?}"),
            })
        }
    }
    Ok(true)
}

async fn handle_get_entries<S: AsyncWrite + Unpin>(
    ctx: &Arc<ServerContext>,
    socket: &mut S,
    body: &[u8],
) -> Result<(), ProtocolError> {
    let req: GetEntries = decode(body)?;

    if req.path.is_empty() && req.root_id.is_none() {
        let roots = ctx
            .mirror
            .roots()
            .into_iter()
            .map(|r| SharedRootWire {
                id: r.id.0,
                name: r.path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default(),
                total_size: ctx.mirror.root_total_size(r.id),
                free_space: crate::chunk::mirror::available_space(&r.path).unwrap_or(0),
            })
            .collect();
        let reply = EntriesReply { entries: Vec::new(), roots };
        return write_reply(socket, MessageType::EntriesReply, &reply).await;
    }

    let found = match req.root_id {
        Some(uuid) => {
            let root = crate::types::RootId(uuid);
            ctx.mirror.resolve_relative(root, &req.path).map(|e| (root, e))
        }
        None => ctx.mirror.resolve_any_root(&req.path),
    };

    let Some((_, dir_entry)) = found else {
        let reply = EntriesReply { entries: Vec::new(), roots: Vec::new() };
        return write_reply(socket, MessageType::EntriesReply, &reply).await;
    };

    let children: Vec<_> = ctx
        .mirror
        .children(dir_entry)
        .into_iter()
        .filter_map(|id| ctx.mirror.to_wire(id))
        .collect();
    let reply = EntriesReply { entries: children, roots: Vec::new() };
    write_reply(socket, MessageType::EntriesReply, &reply).await
}

async fn handle_get_hashes<S: AsyncWrite + Unpin>(
    ctx: &Arc<ServerContext>,
    socket: &mut S,
    body: &[u8],
) -> Result<(), ProtocolError> {
    let req: GetHashesRequest = decode(body)?;

    let Some((_, entry)) = ctx.mirror.resolve_any_root(&req.path) else {
        let status = HashesStatus { status: HashesStatusKind::UnknownEntry, nb_hash: 0 };
        return write_reply(socket, MessageType::HashesStatus, &status).await;
    };

    let status = HashesStatus { status: HashesStatusKind::Ok, nb_hash: req.chunk_count };
    write_reply(socket, MessageType::HashesStatus, &status).await?;

    let mut subscription = ctx.hasher.subscribe();
    let mut emitted = vec![false; req.chunk_count as usize];
    let deadline = tokio::time::Instant::now() + ctx.get_hashes_timeout;

    // Emit anything already hashed up front, in chunk-number order.
    if let Some(e) = ctx.mirror.get_entry_clone(entry) {
        if let crate::types::EntryKind::File { chunks, .. } = e.kind {
            for chunk in chunks {
                if let Some(digest) = chunk.digest {
                    if (chunk.num as usize) < emitted.len() {
                        emitted[chunk.num as usize] = true;
                    }
                    write_reply(socket, MessageType::HashResult, &HashResult { num: chunk.num, digest })
                        .await?;
                }
            }
        }
    }

    if emitted.iter().any(|done| !done) {
        ctx.hasher.enqueue_priority(entry).await;
    }

    while emitted.iter().any(|done| !done) {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return Err(ProtocolError::Timeout);
        }
        match tokio::time::timeout(remaining, subscription.recv()).await {
            Ok(Ok(event)) if event.entry == entry => {
                if (event.chunk_num as usize) < emitted.len() && !emitted[event.chunk_num as usize] {
                    emitted[event.chunk_num as usize] = true;
                    write_reply(
                        socket,
                        MessageType::HashResult,
                        &HashResult { num: event.chunk_num, digest: event.digest },
                    )
                    .await?;
                }
            }
            Ok(Ok(_)) => continue,
            Ok(Err(_lagged)) => continue,
            Err(_) => return Err(ProtocolError::Timeout),
        }
    }
    Ok(())
}

async fn handle_get_chunk<S: AsyncWrite + Unpin>(
    ctx: &Arc<ServerContext>,
    socket: &mut S,
    body: &[u8],
) -> Result<(), ProtocolError> {
    let req: GetChunkRequest = decode(body)?;

    let location = ctx
        .chunk_index
        .all_locations(&req.digest)
        .into_iter()
        .find_map(|loc| ctx.mirror.chunk_file_ref(loc.entry, loc.chunk_num).map(|r| (loc, r)));

    let Some((_, chunk_ref)) = location else {
        let status = ChunkStatus { status: ChunkStatusKind::DontHaveIt, size: 0 };
        return write_reply(socket, MessageType::ChunkStatus, &status).await;
    };

    // `req.offset` resumes a partially-read stream (spec §4.4 "GET_CHUNK
    // request: digest + offset"); an offset past the chunk's end can't be
    // served, so treat it the same as not having the chunk at all.
    if req.offset > chunk_ref.size as u64 {
        let status = ChunkStatus { status: ChunkStatusKind::DontHaveIt, size: 0 };
        return write_reply(socket, MessageType::ChunkStatus, &status).await;
    }
    let remaining_size = chunk_ref.size as u64 - req.offset;

    let status = ChunkStatus { status: ChunkStatusKind::Ok, size: remaining_size as u32 };
    write_reply(socket, MessageType::ChunkStatus, &status).await?;

    // Streaming the actual bytes happens inline rather than through the
    // upload pool's channel here, since we must keep using this same socket
    // (a worker pool job is for independently-owned sockets accepted from
    // the listener — see `dispatch_get_chunk_via_pool` for that path used by
    // the listening loop).
    let mut file = tokio::fs::File::open(&chunk_ref.path).await.map_err(ProtocolError::from)?;
    use tokio::io::{AsyncReadExt, AsyncSeekExt};
    file.seek(std::io::SeekFrom::Start(chunk_ref.offset + req.offset)).await.map_err(ProtocolError::from)?;
    let mut remaining = remaining_size;
    let mut buf = vec![0u8; 64 * 1024];
    while remaining > 0 {
        let to_read = remaining.min(buf.len() as u64) as usize;
        let n = file.read(&mut buf[..to_read]).await.map_err(ProtocolError::from)?;
        if n == 0 {
            break;
        }
        socket.write_all(&buf[..n]).await.map_err(ProtocolError::from)?;
        remaining -= n as u64;
    }
    socket.flush().await.map_err(ProtocolError::from)?;
    Ok(())
}

/// Hand a `GET_CHUNK` off to the upload worker pool instead of serving it
/// inline — used when the caller owns the socket as a standalone resource
/// (e.g. a freshly accepted connection dedicated to one transfer) rather
/// than a shared request/response loop.
pub fn dispatch_get_chunk_via_pool(
    upload: &Arc<UploadManager>,
    chunk_ref: crate::chunk::store::ChunkFileRef,
    writer: Box<dyn AsyncWrite + Unpin + Send>,
) {
    upload.submit(UploadJob { chunk_ref, writer });
}

async fn write_reply<S: AsyncWrite + Unpin, T: serde::Serialize>(
    socket: &mut S,
    message_type: MessageType,
    value: &T,
) -> Result<(), ProtocolError> {
    let body = encode(value)?;
    if body.len() as u32 > MAX_FRAME_BODY {
        return Err(ProtocolError::MessageTooLarge { size: body.len() as u32, max: MAX_FRAME_BODY });
    }
    frame::write_frame(socket, message_type, &body).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::types::RootAccess;

    fn make_ctx() -> (Arc<ServerContext>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.txt"), b"hello world").unwrap();
        let mirror = Arc::new(Mirror::new());
        mirror.add_root(dir.path().to_path_buf(), RootAccess::ReadWrite);
        let chunk_index = Arc::new(ChunkIndex::new());
        let hasher = HashingWorker::new();
        let upload = UploadManager::new(Config::default().upload, 4);
        let ctx = Arc::new(ServerContext {
            mirror,
            chunk_index,
            hasher,
            upload,
            get_hashes_timeout: Duration::from_secs(5),
        });
        (ctx, dir)
    }

    #[tokio::test]
    async fn get_entries_with_no_root_lists_shared_roots() {
        let (ctx, _dir) = make_ctx();
        let (mut client, server) = tokio::io::duplex(8192);
        let server_task = tokio::spawn(serve_connection(ctx, server));

        let req = GetEntries { root_id: None, path: String::new() };
        let body = encode(&req).unwrap();
        frame::write_frame(&mut client, MessageType::GetEntries, &body).await.unwrap();

        let header = frame::read_header(&mut client).await.unwrap();
        assert_eq!(header.message_type, MessageType::EntriesReply);
        let reply_body = frame::read_body(&mut client, header.payload_len).await.unwrap();
        let reply: EntriesReply = decode(&reply_body).unwrap();
        assert_eq!(reply.roots.len(), 1);

        drop(client);
        let _ = server_task.await;
    }

    #[tokio::test]
    async fn get_chunk_for_unknown_digest_reports_dont_have_it() {
        let (ctx, _dir) = make_ctx();
        let (mut client, server) = tokio::io::duplex(8192);
        let server_task = tokio::spawn(serve_connection(ctx, server));

        let req = GetChunkRequest { digest: crate::types::Digest::of(b"nope"), offset: 0 };
        let body = encode(&req).unwrap();
        frame::write_frame(&mut client, MessageType::GetChunk, &body).await.unwrap();

        let header = frame::read_header(&mut client).await.unwrap();
        assert_eq!(header.message_type, MessageType::ChunkStatus);
        let reply_body = frame::read_body(&mut client, header.payload_len).await.unwrap();
        let status: ChunkStatus = decode(&reply_body).unwrap();
        assert_eq!(status.status, ChunkStatusKind::DontHaveIt);

        drop(client);
        let _ = server_task.await;
    }

    async fn get_chunk(
        client: &mut tokio::io::DuplexStream,
        digest: crate::types::Digest,
        offset: u64,
    ) -> ChunkStatus {
        let req = GetChunkRequest { digest, offset };
        let body = encode(&req).unwrap();
        frame::write_frame(client, MessageType::GetChunk, &body).await.unwrap();

        let header = frame::read_header(client).await.unwrap();
        assert_eq!(header.message_type, MessageType::ChunkStatus);
        let reply_body = frame::read_body(client, header.payload_len).await.unwrap();
        decode(&reply_body).unwrap()
    }

    /// Registers `hello.txt`'s single chunk (11 bytes, under `CHUNK_SIZE`) as
    /// complete in the mirror and chunk index, so `handle_get_chunk` can find
    /// it by digest.
    fn register_hello_chunk(ctx: &Arc<ServerContext>) -> crate::types::Digest {
        let root_id = ctx.mirror.roots()[0].id;
        let root_dir = ctx.mirror.root_entry(root_id).unwrap();
        let entry = ctx.mirror.insert_file(
            root_dir,
            "hello.txt".to_string(),
            root_id,
            11,
            std::time::SystemTime::now(),
        );
        let digest = crate::types::Digest::of(b"hello world");
        ctx.mirror.set_chunk_digest(entry, 0, digest);
        ctx.chunk_index.add(
            digest,
            crate::chunk::store::ChunkLocation { entry, chunk_num: 0 },
        );
        digest
    }

    #[tokio::test]
    async fn get_chunk_streams_full_chunk_bytes_from_zero_offset() {
        let (ctx, _dir) = make_ctx();
        let digest = register_hello_chunk(&ctx);
        let (mut client, server) = tokio::io::duplex(8192);
        let server_task = tokio::spawn(serve_connection(ctx, server));

        let status = get_chunk(&mut client, digest, 0).await;
        assert_eq!(status.status, ChunkStatusKind::Ok);
        assert_eq!(status.size, 11);
        let mut bytes = vec![0u8; 11];
        tokio::io::AsyncReadExt::read_exact(&mut client, &mut bytes).await.unwrap();
        assert_eq!(&bytes, b"hello world");

        drop(client);
        let _ = server_task.await;
    }

    #[tokio::test]
    async fn get_chunk_honors_resume_offset() {
        let (ctx, _dir) = make_ctx();
        let digest = register_hello_chunk(&ctx);
        let (mut client, server) = tokio::io::duplex(8192);
        let server_task = tokio::spawn(serve_connection(ctx, server));

        let status = get_chunk(&mut client, digest, 6).await;
        assert_eq!(status.status, ChunkStatusKind::Ok);
        assert_eq!(status.size, 5);
        let mut bytes = vec![0u8; 5];
        tokio::io::AsyncReadExt::read_exact(&mut client, &mut bytes).await.unwrap();
        assert_eq!(&bytes, b"world");

        drop(client);
        let _ = server_task.await;
    }

    #[tokio::test]
    async fn get_chunk_rejects_offset_past_end() {
        let (ctx, _dir) = make_ctx();
        let digest = register_hello_chunk(&ctx);
        let (mut client, server) = tokio::io::duplex(8192);
        let server_task = tokio::spawn(serve_connection(ctx, server));

        let status = get_chunk(&mut client, digest, 12).await;
        assert_eq!(status.status, ChunkStatusKind::DontHaveIt);
        assert_eq!(status.size, 0);

        drop(client);
        let _ = server_task.await;
    }
}
