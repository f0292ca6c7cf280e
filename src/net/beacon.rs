//! Presence beacon: periodically multicasts an `IM_ALIVE` announcing this
//! node and a rotating sample of its owned chunk digests, and on receipt of
//! a peer's own beacon, upserts it into the [`PeerDirectory`].
//!
//! The "chunks of interest" sample answers the resolved open question on how
//! to pick which digests to advertise each tick: a deterministic
//! round-robin cursor over [`ChunkIndex::all_digests`], wrapping back to the
//! start and resetting to zero on process restart (no cross-restart
//! persistence — the whole point is just to eventually surface every owned
//! digest to listening peers, not to guarantee a particular order).

use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use governor::{Quota, RateLimiter};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, watch};

use crate::chunk::mirror::Mirror;
use crate::chunk::store::ChunkIndex;
use crate::config::Config;
use crate::logging::{debug, warn};
use crate::peer::directory::{PeerDirectory, PeerInfo};
use crate::protocol::messages::{self, ImAlive, MessageType};
use crate::types::{Digest, PeerId};

/// One digest a remote peer advertised owning, relayed to the download
/// manager so its scheduler can pick it as a donor (spec.md §4.5: "checks
/// the included digests against the local chunk store and emits a 'chunks
/// of interest' signal used by the download scheduler to discover sources").
#[derive(Debug, Clone, Copy)]
pub struct ChunkOfInterest {
    pub peer: PeerId,
    pub digest: Digest,
}

type ThroughputLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Round-robin cursor over a chunk index's digests, reset each process
/// start (it is never persisted).
struct RotatingCursor {
    position: AtomicUsize,
}

impl RotatingCursor {
    fn new() -> Self {
        Self { position: AtomicUsize::new(0) }
    }

    fn take(&self, chunk_index: &ChunkIndex, count: usize) -> Vec<crate::types::Digest> {
        let all = chunk_index.all_digests();
        if all.is_empty() || count == 0 {
            return Vec::new();
        }
        let start = self.position.fetch_add(count, Ordering::Relaxed) % all.len();
        (0..count.min(all.len())).map(|i| all[(start + i) % all.len()]).collect()
    }
}

pub struct Beacon {
    socket: Arc<UdpSocket>,
    multicast_addr: SocketAddr,
    peer_id: PeerId,
    nickname: String,
    unicast_port: u16,
    period: Duration,
    sample_size: usize,
    limiter: Arc<ThroughputLimiter>,
    cursor: RotatingCursor,
    mirror: Arc<Mirror>,
    chunk_index: Arc<ChunkIndex>,
    directory: PeerDirectory,
    /// Latest `timestamp_ms` seen per peer, so a beacon delayed or
    /// reordered in flight doesn't clobber a newer one already applied —
    /// per spec.md §5's beacon ordering guarantee.
    last_seen: std::sync::Mutex<std::collections::HashMap<PeerId, u64>>,
    chunks_of_interest: broadcast::Sender<ChunkOfInterest>,
}

impl Beacon {
    pub fn new(
        socket: Arc<UdpSocket>,
        peer_id: PeerId,
        unicast_port: u16,
        config: &Config,
        mirror: Arc<Mirror>,
        chunk_index: Arc<ChunkIndex>,
        directory: PeerDirectory,
    ) -> Self {
        let multicast_addr =
            SocketAddr::new(config.network.multicast_group, config.network.multicast_port);
        let quota = Quota::per_second(
            NonZeroU32::new(config.network.max_imalive_throughput).unwrap_or(NonZeroU32::MIN),
        )
        .allow_burst(NonZeroU32::new(config.network.max_udp_datagram_size as u32).unwrap_or(NonZeroU32::MIN));
        Self {
            socket,
            multicast_addr,
            peer_id,
            nickname: config.nickname.clone(),
            unicast_port,
            period: Duration::from_secs(config.peer.peer_imalive_period_secs),
            sample_size: config.network.number_of_hashes_sent_imalive,
            limiter: Arc::new(RateLimiter::direct(quota)),
            cursor: RotatingCursor::new(),
            mirror,
            chunk_index,
            directory,
            last_seen: std::sync::Mutex::new(std::collections::HashMap::new()),
            chunks_of_interest: broadcast::channel(1024).0,
        }
    }

    /// Subscribe to every "chunks of interest" digest relayed from other
    /// peers' beacons, one event per digest per received beacon — the
    /// download manager forwards each into `note_peer_has`.
    pub fn subscribe_chunks_of_interest(&self) -> broadcast::Receiver<ChunkOfInterest> {
        self.chunks_of_interest.subscribe()
    }

    /// Run the send loop until `stop` fires. One tick = one `IM_ALIVE`
    /// multicast.
    pub async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.send_beacon().await {
                        warn!("beacon: failed to send IM_ALIVE: {}", e);
                    }
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn send_beacon(&self) -> std::io::Result<()> {
        let shared_bytes: u64 =
            self.mirror.roots().iter().map(|r| self.mirror.root_total_size(r.id)).sum();
        let chunks_of_interest = self.cursor.take(&self.chunk_index, self.sample_size);
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        let beacon = ImAlive {
            peer_id: self.peer_id,
            nickname: self.nickname.clone(),
            listening_port: self.unicast_port,
            shared_bytes,
            download_rate: 0.0,
            upload_rate: 0.0,
            protocol_version: PROTOCOL_VERSION,
            timestamp_ms,
            chunks_of_interest,
        };
        let datagram = crate::net::listener::encode_datagram(
            MessageType::ImAlive,
            &beacon,
            u16::MAX as usize,
        )
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;

        if let Some(n) = NonZeroU32::new(datagram.len() as u32) {
            let _ = self.limiter.until_n_ready(n).await;
        }
        self.socket.send_to(&datagram, self.multicast_addr).await?;
        Ok(())
    }

    /// Handle an incoming `IM_ALIVE` datagram: decode and upsert the sender
    /// into the peer directory, ignoring our own beacons.
    pub fn handle_im_alive(&self, body: &[u8], from: SocketAddr) {
        let Ok(beacon) = messages::decode::<ImAlive>(body) else {
            debug!("beacon: malformed IM_ALIVE from {}", from);
            return;
        };
        if beacon.peer_id == self.peer_id {
            return;
        }
        {
            let mut last_seen = self.last_seen.lock().unwrap();
            let newest = last_seen.get(&beacon.peer_id).copied().unwrap_or(0);
            if beacon.timestamp_ms < newest {
                debug!("beacon: dropping out-of-order IM_ALIVE from {}", from);
                return;
            }
            last_seen.insert(beacon.peer_id, beacon.timestamp_ms);
        }
        let addr = SocketAddr::new(from.ip(), beacon.listening_port);
        let sender = beacon.peer_id;
        self.directory.update_peer(PeerInfo {
            id: sender,
            nickname: beacon.nickname,
            addr,
            shared_bytes: beacon.shared_bytes,
            download_rate: beacon.download_rate,
            upload_rate: beacon.upload_rate,
            protocol_version: beacon.protocol_version,
        });
        for digest in beacon.chunks_of_interest {
            let _ = self.chunks_of_interest.send(ChunkOfInterest { peer: sender, digest });
        }
    }
}

/// Wire protocol version this build speaks, compared against a peer's
/// advertised version to decide compatibility (see `peer::directory`).
pub const PROTOCOL_VERSION: u32 = 1;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::types::RootAccess;

    #[tokio::test]
    async fn rotating_cursor_cycles_through_all_digests() {
        let index = ChunkIndex::new();
        for i in 0..5u32 {
            index.add(
                crate::types::Digest::of(&i.to_le_bytes()),
                crate::chunk::store::ChunkLocation {
                    entry: crate::types::EntryId(i as u64),
                    chunk_num: 0,
                },
            );
        }
        let cursor = RotatingCursor::new();
        let first = cursor.take(&index, 3);
        let second = cursor.take(&index, 3);
        assert_eq!(first.len(), 3);
        assert_eq!(second.len(), 3);
        // Together the two rounds must cover every digest at least once.
        let mut seen: Vec<_> = first.iter().chain(second.iter()).cloned().collect();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 5);
    }

    #[tokio::test]
    async fn im_alive_from_self_is_ignored() {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let mirror = Arc::new(Mirror::new());
        let dir = tempfile::tempdir().unwrap();
        mirror.add_root(dir.path().to_path_buf(), RootAccess::ReadWrite);
        let chunk_index = Arc::new(ChunkIndex::new());
        let directory = PeerDirectory::new(1, Duration::from_secs(10), 3);
        let peer_id = PeerId([9; 20]);
        let beacon = Beacon::new(
            socket,
            peer_id,
            1234,
            &Config::default(),
            mirror,
            chunk_index,
            directory.clone(),
        );

        let own = ImAlive {
            peer_id,
            nickname: "me".to_string(),
            listening_port: 1234,
            shared_bytes: 0,
            download_rate: 0.0,
            upload_rate: 0.0,
            protocol_version: 1,
            timestamp_ms: 0,
            chunks_of_interest: Vec::new(),
        };
        let body = messages::encode(&own).unwrap();
        beacon.handle_im_alive(&body, "127.0.0.1:5555".parse().unwrap());
        assert!(directory.peers().is_empty());
    }

    #[tokio::test]
    async fn stale_im_alive_is_dropped() {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let mirror = Arc::new(Mirror::new());
        let dir = tempfile::tempdir().unwrap();
        mirror.add_root(dir.path().to_path_buf(), RootAccess::ReadWrite);
        let chunk_index = Arc::new(ChunkIndex::new());
        let directory = PeerDirectory::new(1, Duration::from_secs(10), 3);
        let beacon = Beacon::new(
            socket,
            PeerId([9; 20]),
            1234,
            &Config::default(),
            mirror,
            chunk_index,
            directory.clone(),
        );

        let sender = PeerId([2; 20]);
        let newer = ImAlive {
            peer_id: sender,
            nickname: "new".to_string(),
            listening_port: 1,
            shared_bytes: 0,
            download_rate: 0.0,
            upload_rate: 0.0,
            protocol_version: 1,
            timestamp_ms: 100,
            chunks_of_interest: Vec::new(),
        };
        let mut stale = newer.clone();
        stale.timestamp_ms = 10;
        stale.nickname = "stale".to_string();

        beacon.handle_im_alive(&messages::encode(&newer).unwrap(), "127.0.0.1:5555".parse().unwrap());
        beacon.handle_im_alive(&messages::encode(&stale).unwrap(), "127.0.0.1:5555".parse().unwrap());

        assert_eq!(directory.get(sender).unwrap().nickname, "new");
    }

    #[tokio::test]
    async fn im_alive_chunks_of_interest_are_relayed_to_subscribers() {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let mirror = Arc::new(Mirror::new());
        let dir = tempfile::tempdir().unwrap();
        mirror.add_root(dir.path().to_path_buf(), RootAccess::ReadWrite);
        let chunk_index = Arc::new(ChunkIndex::new());
        let directory = PeerDirectory::new(1, Duration::from_secs(10), 3);
        let beacon = Beacon::new(
            socket,
            PeerId([9; 20]),
            1234,
            &Config::default(),
            mirror,
            chunk_index,
            directory,
        );
        let mut rx = beacon.subscribe_chunks_of_interest();

        let sender = PeerId([3; 20]);
        let digest = crate::types::Digest::of(b"interesting chunk");
        let beacon_msg = ImAlive {
            peer_id: sender,
            nickname: "n".to_string(),
            listening_port: 1,
            shared_bytes: 0,
            download_rate: 0.0,
            upload_rate: 0.0,
            protocol_version: 1,
            timestamp_ms: 1,
            chunks_of_interest: vec![digest],
        };
        beacon.handle_im_alive(&messages::encode(&beacon_msg).unwrap(), "127.0.0.1:5555".parse().unwrap());

        let event = rx.try_recv().expect("expected a relayed ChunkOfInterest event");
        assert_eq!(event.peer, sender);
        assert_eq!(event.digest, digest);
    }
}
