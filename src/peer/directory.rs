//! Peer directory: liveness tracking and compatibility marking.
//!
//! One entry per peer we've heard from, upserted by `update_peer` (fed by
//! presence beacons, see `net::beacon`) and expired by a deadline rather
//! than an explicit timer per peer — `prune_expired` is driven by a single
//! periodic task instead of one `QTimer` per `Peer`, which is simpler to
//! reason about for an arbitrary number of peers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::peer::pool::ConnectionPool;
use crate::types::PeerId;

/// Whether a peer's advertised protocol version lets us talk to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compatibility {
    Compatible,
    VersionOutdated,
    MoreRecentVersion,
}

fn compatibility(local: u32, remote: u32) -> Compatibility {
    use std::cmp::Ordering::*;
    match remote.cmp(&local) {
        Equal => Compatibility::Compatible,
        Less => Compatibility::VersionOutdated,
        Greater => Compatibility::MoreRecentVersion,
    }
}

#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub id: PeerId,
    pub nickname: String,
    pub addr: SocketAddr,
    pub shared_bytes: u64,
    pub download_rate: f64,
    pub upload_rate: f64,
    pub protocol_version: u32,
}

struct PeerState {
    info: PeerInfo,
    compatibility: Compatibility,
    deadline: Instant,
    blocked_until: Option<Instant>,
    pool: Arc<ConnectionPool>,
}

/// Tracks every peer we've seen. Cheap to clone (wraps an `Arc`).
#[derive(Clone)]
pub struct PeerDirectory {
    inner: Arc<Mutex<HashMap<PeerId, PeerState>>>,
    local_protocol_version: u32,
    timeout: Duration,
    max_idle_sockets: usize,
}

impl PeerDirectory {
    pub fn new(local_protocol_version: u32, timeout: Duration, max_idle_sockets: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            local_protocol_version,
            timeout,
            max_idle_sockets,
        }
    }

    /// Upsert a peer and arm (reset) its liveness deadline.
    pub fn update_peer(&self, info: PeerInfo) {
        let mut map = self.inner.lock().unwrap();
        let compat = compatibility(self.local_protocol_version, info.protocol_version);
        let deadline = Instant::now() + self.timeout;
        match map.get_mut(&info.id) {
            Some(state) => {
                state.info = info;
                state.compatibility = compat;
                state.deadline = deadline;
            }
            None => {
                map.insert(
                    info.id,
                    PeerState {
                        info,
                        compatibility: compat,
                        deadline,
                        blocked_until: None,
                        pool: ConnectionPool::new(self.max_idle_sockets),
                    },
                );
            }
        }
    }

    pub fn get(&self, id: PeerId) -> Option<PeerInfo> {
        self.inner.lock().unwrap().get(&id).map(|s| s.info.clone())
    }

    pub fn get_pool(&self, id: PeerId) -> Option<Arc<ConnectionPool>> {
        self.inner.lock().unwrap().get(&id).map(|s| s.pool.clone())
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.inner.lock().unwrap().values().map(|s| s.info.clone()).collect()
    }

    pub fn is_alive(&self, id: PeerId) -> bool {
        self.inner.lock().unwrap().get(&id).map(|s| Instant::now() < s.deadline).unwrap_or(false)
    }

    pub fn is_available(&self, id: PeerId) -> bool {
        let map = self.inner.lock().unwrap();
        match map.get(&id) {
            Some(state) => {
                let alive = Instant::now() < state.deadline;
                let not_blocked = state.blocked_until.map(|u| Instant::now() >= u).unwrap_or(true);
                let compatible = state.compatibility == Compatibility::Compatible;
                alive && not_blocked && compatible
            }
            None => false,
        }
    }

    /// Block a peer as an unavailable (but still alive) download source,
    /// e.g. after it serves corrupted data.
    pub fn block(&self, id: PeerId, duration: Duration) {
        if let Some(state) = self.inner.lock().unwrap().get_mut(&id) {
            state.blocked_until = Some(Instant::now() + duration);
        }
    }

    /// Close pool sockets and drop every peer whose deadline has passed.
    /// Returns the ids removed, so callers (e.g. the download scheduler)
    /// can react to newly-dead donors.
    pub fn prune_expired(&self) -> Vec<PeerId> {
        let mut map = self.inner.lock().unwrap();
        let now = Instant::now();
        let expired: Vec<PeerId> =
            map.iter().filter(|(_, s)| now >= s.deadline).map(|(id, _)| *id).collect();
        for id in &expired {
            if let Some(state) = map.remove(id) {
                state.pool.close_all();
            }
        }
        expired
    }

    pub fn remove_all(&self) {
        let mut map = self.inner.lock().unwrap();
        for (_, state) in map.drain() {
            state.pool.close_all();
        }
    }

    pub fn compatibility(&self, id: PeerId) -> Option<Compatibility> {
        self.inner.lock().unwrap().get(&id).map(|s| s.compatibility)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_info(id: u8) -> PeerInfo {
        PeerInfo {
            id: PeerId([id; 20]),
            nickname: format!("peer{id}"),
            addr: "127.0.0.1:1234".parse().unwrap(),
            shared_bytes: 0,
            download_rate: 0.0,
            upload_rate: 0.0,
            protocol_version: 1,
        }
    }

    #[test]
    fn update_then_alive() {
        let dir = PeerDirectory::new(1, Duration::from_secs(10), 3);
        dir.update_peer(sample_info(1));
        assert!(dir.is_alive(PeerId([1; 20])));
        assert!(dir.is_available(PeerId([1; 20])));
    }

    #[test]
    fn expiry_removes_peer() {
        let dir = PeerDirectory::new(1, Duration::from_millis(10), 3);
        dir.update_peer(sample_info(1));
        std::thread::sleep(Duration::from_millis(30));
        let expired = dir.prune_expired();
        assert_eq!(expired, vec![PeerId([1; 20])]);
        assert!(!dir.is_alive(PeerId([1; 20])));
    }

    #[test]
    fn version_mismatch_marks_incompatible_not_available() {
        let dir = PeerDirectory::new(2, Duration::from_secs(10), 3);
        let mut info = sample_info(1);
        info.protocol_version = 1;
        dir.update_peer(info);
        assert_eq!(dir.compatibility(PeerId([1; 20])), Some(Compatibility::VersionOutdated));
        assert!(!dir.is_available(PeerId([1; 20])));
        assert!(dir.is_alive(PeerId([1; 20])));
    }

    #[test]
    fn blocked_peer_unavailable_but_alive() {
        let dir = PeerDirectory::new(1, Duration::from_secs(10), 3);
        dir.update_peer(sample_info(1));
        dir.block(PeerId([1; 20]), Duration::from_secs(10));
        assert!(dir.is_alive(PeerId([1; 20])));
        assert!(!dir.is_available(PeerId([1; 20])));
    }
}
