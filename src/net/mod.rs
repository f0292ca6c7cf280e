//! UDP network listener: presence beacons and LAN search, built on the
//! multicast group every node joins. Wires [`listener`]'s sockets to
//! [`beacon::Beacon`] and [`search::SearchCoordinator`] behind one
//! dispatch loop.

pub mod beacon;
pub mod listener;
pub mod search;

use std::sync::{Arc, Mutex};

use tokio::net::UdpSocket;
use tokio::sync::watch;

use crate::chunk::mirror::Mirror;
use crate::chunk::store::ChunkIndex;
use crate::config::Config;
use crate::error::NetworkError;
use crate::logging::{debug, warn};
use crate::peer::directory::PeerDirectory;
use crate::protocol::messages::MessageType;
use crate::search::SearchIndex;
use crate::types::PeerId;

pub use beacon::Beacon;
pub use search::SearchCoordinator;

/// Owns the multicast socket, the beacon sender, and the search responder,
/// and runs the receive loop that dispatches incoming datagrams to whichever
/// one handles that message type.
pub struct NetworkService {
    pub multicast_socket: Arc<UdpSocket>,
    pub unicast_port: u16,
    pub beacon: Arc<Beacon>,
    pub search: Arc<SearchCoordinator>,
    stop_tx: watch::Sender<bool>,
}

impl NetworkService {
    pub fn start(
        config: &Config,
        peer_id: PeerId,
        mirror: Arc<Mirror>,
        chunk_index: Arc<ChunkIndex>,
        search_index: Arc<Mutex<SearchIndex>>,
        directory: PeerDirectory,
    ) -> Result<Arc<Self>, NetworkError> {
        // The unicast socket is bound (and its port advertised in every
        // beacon) so a future direct-reply path has a stable port to use;
        // all current traffic flows over the multicast socket.
        let (_unicast_socket, unicast_port) = listener::bind_unicast(&config.network)?;
        let multicast_socket = Arc::new(listener::bind_multicast(&config.network)?);

        let beacon = Arc::new(Beacon::new(
            multicast_socket.clone(),
            peer_id,
            unicast_port,
            config,
            mirror.clone(),
            chunk_index,
            directory,
        ));
        let search = SearchCoordinator::new(peer_id);

        let (stop_tx, stop_rx) = watch::channel(false);
        let service = Arc::new(Self {
            multicast_socket: multicast_socket.clone(),
            unicast_port,
            beacon: beacon.clone(),
            search: search.clone(),
            stop_tx,
        });

        tokio::spawn(beacon.clone().run(stop_rx.clone()));
        tokio::spawn(receive_loop(
            multicast_socket,
            beacon,
            search,
            mirror,
            search_index,
            config.clone(),
            stop_rx,
        ));

        Ok(service)
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    beacon: Arc<Beacon>,
    search: Arc<SearchCoordinator>,
    mirror: Arc<Mirror>,
    search_index: Arc<Mutex<SearchIndex>>,
    config: Config,
    mut stop: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; config.network.max_udp_datagram_size];
    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((n, from)) => dispatch_datagram(&buf[..n], from, &socket, &beacon, &search, &mirror, &search_index, &config).await,
                    Err(e) => warn!("net: recv error: {}", e),
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

async fn dispatch_datagram(
    datagram: &[u8],
    from: std::net::SocketAddr,
    socket: &UdpSocket,
    beacon: &Beacon,
    search: &SearchCoordinator,
    mirror: &Mirror,
    search_index: &Mutex<SearchIndex>,
    config: &Config,
) {
    let Some((message_type, body)) = listener::decode_datagram(datagram) else {
        debug!("net: dropping unparseable datagram from {}", from);
        return;
    };
    match message_type {
        MessageType::ImAlive => beacon.handle_im_alive(body, from),
        MessageType::FindRequest => {
            if let Err(e) = search.handle_find_request(socket, from, body, mirror, search_index, config).await {
                warn!("net: failed to answer FindRequest: {}", e);
            }
        }
        MessageType::FindResult => search.handle_find_result(body),
        other => debug!("net: ignoring unexpected datagram type {:?} from {}", other, from),
    }
}
