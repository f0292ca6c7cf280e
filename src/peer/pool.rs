//! Per-peer idle TCP connection pool.
//!
//! Established connections are kept warm rather than reopened for every
//! request: `get_a_socket` hands out an idle one if available, otherwise
//! dials a fresh one. Idle sockets older than `idle_socket_timeout` are
//! reaped by `reap_idle`, and the whole pool can be drained (closing every
//! socket, idle or checked out for tracking purposes) by `close_all`.

use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;

use crate::error::PeerError;

struct Idle {
    stream: TcpStream,
    since: Instant,
}

/// Bounded pool of idle sockets to a single peer.
pub struct ConnectionPool {
    idle: Mutex<Vec<Idle>>,
    max_idle: usize,
}

impl ConnectionPool {
    pub fn new(max_idle: usize) -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self { idle: Mutex::new(Vec::new()), max_idle })
    }

    /// Take an idle socket if one is ready, otherwise dial a fresh one.
    pub async fn get_a_socket(&self, addr: SocketAddr) -> Result<TcpStream, PeerError> {
        let taken = self.idle.lock().unwrap().pop();
        if let Some(idle) = taken {
            return Ok(idle.stream);
        }
        TcpStream::connect(addr).await.map_err(PeerError::from)
    }

    /// Return a socket to the idle pool. Dropped (not pooled) once the pool
    /// is at capacity.
    pub fn release(&self, stream: TcpStream) {
        let mut idle = self.idle.lock().unwrap();
        if idle.len() < self.max_idle {
            idle.push(Idle { stream, since: Instant::now() });
        }
    }

    /// Drop idle sockets that have sat unused longer than `timeout`.
    pub fn reap_idle(&self, timeout: Duration) {
        let mut idle = self.idle.lock().unwrap();
        idle.retain(|i| i.since.elapsed() < timeout);
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().unwrap().len()
    }

    /// Drop every idle socket, e.g. when the owning peer expires.
    pub fn close_all(&self) {
        self.idle.lock().unwrap().clear();
    }
}
