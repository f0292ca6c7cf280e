//! LAN-wide search: broadcast a tagged `FindRequest`, answer one from a
//! peer out of the local search index, and fan in `FindResult`s for a
//! caller's outstanding request until `search_lifetime` elapses.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::RngCore;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::chunk::mirror::Mirror;
use crate::config::Config;
use crate::logging::debug;
use crate::protocol::messages::{self, FindRequest, FindResult, MessageType};
use crate::search::{SearchIndex, SearchQuery};
use crate::types::PeerId;

/// Tracks outstanding searches this node issued, so incoming `FindResult`s
/// can be routed back to the right caller and ignored once the search's
/// lifetime has elapsed.
pub struct SearchCoordinator {
    pending: Mutex<HashMap<u64, mpsc::UnboundedSender<FindResult>>>,
    peer_id: PeerId,
}

impl SearchCoordinator {
    pub fn new(peer_id: PeerId) -> Arc<Self> {
        Arc::new(Self { pending: Mutex::new(HashMap::new()), peer_id })
    }

    /// Broadcast a search and return a channel of incoming results. The
    /// channel is dropped from the coordinator's bookkeeping after
    /// `lifetime`, though already-sent results already in the caller's queue
    /// remain readable.
    pub async fn search(
        self: &Arc<Self>,
        socket: &UdpSocket,
        multicast_addr: SocketAddr,
        pattern: String,
        max_datagram_size: usize,
        lifetime: Duration,
    ) -> std::io::Result<mpsc::UnboundedReceiver<FindResult>> {
        let tag = rand::rng().next_u64();
        let (tx, rx) = mpsc::unbounded_channel();
        self.pending.lock().unwrap().insert(tag, tx);

        let request = FindRequest { tag, pattern };
        let datagram = crate::net::listener::encode_datagram(
            MessageType::FindRequest,
            &request,
            max_datagram_size,
        )
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        socket.send_to(&datagram, multicast_addr).await?;

        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(lifetime).await;
            this.pending.lock().unwrap().remove(&tag);
        });

        Ok(rx)
    }

    /// Answer a peer's `FindRequest` by querying the local search index and
    /// unicasting a `FindResult` back to the sender.
    pub async fn handle_find_request(
        &self,
        socket: &UdpSocket,
        from: SocketAddr,
        body: &[u8],
        mirror: &Mirror,
        search_index: &Mutex<SearchIndex>,
        config: &Config,
    ) -> std::io::Result<()> {
        let Ok(request) = messages::decode::<FindRequest>(body) else {
            debug!("search: malformed FindRequest from {}", from);
            return Ok(());
        };
        let query = SearchQuery::from_pattern(&request.pattern);
        let matches = {
            let index = search_index.lock().unwrap();
            index.find(&query, config.search.max_number_of_search_result_to_send)
        };
        let entries = matches.into_iter().filter_map(|m| mirror.to_wire(m.id)).collect();

        let result = FindResult { tag: request.tag, peer_id: self.peer_id, entries };
        let datagram = crate::net::listener::encode_datagram(
            MessageType::FindResult,
            &result,
            config.network.max_udp_datagram_size,
        )
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        socket.send_to(&datagram, from).await?;
        Ok(())
    }

    /// Route an incoming `FindResult` to the matching outstanding search, if
    /// any (it may have already expired, in which case this is a no-op).
    pub fn handle_find_result(&self, body: &[u8]) {
        let Ok(result) = messages::decode::<FindResult>(body) else { return };
        if let Some(tx) = self.pending.lock().unwrap().get(&result.tag) {
            let _ = tx.send(result);
        }
    }
}
