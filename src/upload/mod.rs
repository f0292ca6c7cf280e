//! Upload manager: a bounded worker pool that serves `GET_CHUNK` reads.
//!
//! Grounded on the hasher's single-worker-drains-a-queue shape
//! (`chunk::hasher`), generalized to a *pool* of workers since uploads are
//! meant to run in parallel across peers, unlike hashing which is
//! intentionally serialized. `upload_min_nb_thread` workers are always kept
//! alive; additional ones are spawned when the backlog exceeds the active
//! count, up to a configured ceiling, and idle workers above the minimum exit
//! after `upload_thread_lifetime`. `upload_lifetime` bounds how long any one
//! job may hold a worker before its stream is abandoned.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::chunk::store::ChunkFileRef;
use crate::config::UploadConfig;
use crate::logging::{debug, warn};

const READ_BUF_SIZE: usize = 64 * 1024;

/// One chunk-read job: where the bytes live, and where to write them.
pub struct UploadJob {
    pub chunk_ref: ChunkFileRef,
    pub writer: Box<dyn AsyncWrite + Unpin + Send>,
}

/// Bounded pool of upload workers.
pub struct UploadManager {
    tx: mpsc::UnboundedSender<UploadJob>,
    rx: Arc<AsyncMutex<mpsc::UnboundedReceiver<UploadJob>>>,
    config: UploadConfig,
    active_workers: Arc<AtomicUsize>,
    pending: Arc<AtomicUsize>,
    max_workers: usize,
}

impl UploadManager {
    /// `max_workers` is the ceiling the pool may grow to — in the full node
    /// this is the peer manager's overall concurrency limit; tests pass a
    /// small explicit value.
    pub fn new(config: UploadConfig, max_workers: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            tx,
            rx: Arc::new(AsyncMutex::new(rx)),
            config,
            active_workers: Arc::new(AtomicUsize::new(0)),
            pending: Arc::new(AtomicUsize::new(0)),
            max_workers: max_workers.max(1),
        });
        for _ in 0..manager.config.upload_min_nb_thread.min(manager.max_workers) {
            manager.spawn_worker(true);
        }
        manager
    }

    fn spawn_worker(self: &Arc<Self>, permanent: bool) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
        let this = self.clone();
        tokio::spawn(async move {
            this.worker_loop(permanent).await;
            this.active_workers.fetch_sub(1, Ordering::SeqCst);
        });
    }

    async fn worker_loop(self: &Arc<Self>, permanent: bool) {
        let idle_timeout = Duration::from_secs(self.config.upload_thread_lifetime_secs);
        loop {
            let job = {
                let mut rx = self.rx.lock().await;
                if permanent {
                    rx.recv().await
                } else {
                    match tokio::time::timeout(idle_timeout, rx.recv()).await {
                        Ok(job) => job,
                        Err(_) => return, // idle too long, and not a permanent worker: exit
                    }
                }
            };
            let Some(job) = job else { return };
            self.pending.fetch_sub(1, Ordering::SeqCst);
            let lifetime = Duration::from_secs(self.config.upload_lifetime_secs);
            if tokio::time::timeout(lifetime, serve_job(job)).await.is_err() {
                warn!("upload job preempted after exceeding upload_lifetime");
            }
        }
    }

    /// Enqueue a chunk-read job. Spawns an extra (non-permanent) worker if
    /// the backlog has outgrown the active pool and we're below the ceiling.
    pub fn submit(self: &Arc<Self>, job: UploadJob) {
        let pending = self.pending.fetch_add(1, Ordering::SeqCst) + 1;
        let active = self.active_workers.load(Ordering::SeqCst);
        if pending > active && active < self.max_workers {
            self.spawn_worker(false);
        }
        if self.tx.send(job).is_err() {
            debug!("upload manager: no workers left to receive job");
        }
    }

    pub fn active_worker_count(&self) -> usize {
        self.active_workers.load(Ordering::SeqCst)
    }
}

async fn serve_job(mut job: UploadJob) {
    if let Err(e) = stream_chunk(&job.chunk_ref, &mut job.writer).await {
        debug!("upload: error streaming {}: {}", job.chunk_ref.path.display(), e);
    }
}

/// Stream a chunk's bytes to `writer`, honoring backpressure by reading and
/// writing in fixed-size bursts rather than buffering the whole chunk. If
/// the backing file disappears mid-stream (e.g. deleted), the stream is
/// aborted.
async fn stream_chunk<W: AsyncWrite + Unpin>(
    chunk_ref: &ChunkFileRef,
    writer: &mut W,
) -> std::io::Result<()> {
    let mut file = tokio::fs::File::open(&chunk_ref.path).await?;
    file.seek(std::io::SeekFrom::Start(chunk_ref.offset)).await?;
    let mut remaining = chunk_ref.size as u64;
    let mut buf = vec![0u8; READ_BUF_SIZE];
    while remaining > 0 {
        let to_read = remaining.min(READ_BUF_SIZE as u64) as usize;
        let n = read_exact_or_eof(&mut file, &mut buf[..to_read]).await?;
        if n == 0 {
            return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "chunk shrank mid-stream"));
        }
        writer.write_all(&buf[..n]).await?;
        remaining -= n as u64;
    }
    writer.flush().await?;
    Ok(())
}

async fn read_exact_or_eof<R: AsyncRead + Unpin>(r: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    use tokio::io::AsyncReadExt;
    let mut total = 0;
    while total < buf.len() {
        let n = r.read(&mut buf[total..]).await?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}
