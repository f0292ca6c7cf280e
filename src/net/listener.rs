//! UDP sockets: a unicast socket for point-to-point datagrams (reserved for
//! future direct replies) and a multicast socket joining the LAN discovery
//! group, both wrapped in `tokio::net::UdpSocket`. Binding the unicast
//! socket walks forward from `unicast_base_port` on `EADDRINUSE`, the way a
//! node sharing a machine with another instance still needs to come up.
//!
//! Datagrams are framed far more simply than the TCP protocol: one leading
//! type byte (a [`MessageType`] discriminant) followed by a `bincode` body —
//! there's no length prefix because UDP already delivers whole datagrams.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use crate::config::NetworkConfig;
use crate::error::NetworkError;
use crate::protocol::messages::{self, MessageType};

/// How many successive ports to try before giving up.
const MAX_BIND_ATTEMPTS: u16 = 32;

/// Bind the unicast socket, starting at `config.unicast_base_port` and
/// walking forward on `EADDRINUSE`.
pub fn bind_unicast(config: &NetworkConfig) -> Result<(UdpSocket, u16), NetworkError> {
    for offset in 0..MAX_BIND_ATTEMPTS {
        let port = config.unicast_base_port.wrapping_add(offset);
        let addr = SocketAddr::new(config.listen_address, port);
        match std::net::UdpSocket::bind(addr) {
            Ok(std_socket) => {
                std_socket.set_nonblocking(true)?;
                let socket = UdpSocket::from_std(std_socket)?;
                return Ok((socket, port));
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => continue,
            Err(e) => return Err(NetworkError::Io(e)),
        }
    }
    Err(NetworkError::AllPortsExhausted { base_port: config.unicast_base_port })
}

/// Bind and join the multicast discovery group used for presence beacons and
/// LAN search.
pub fn bind_multicast(config: &NetworkConfig) -> Result<UdpSocket, NetworkError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.multicast_port);
    socket.bind(&bind_addr.into())?;
    socket.set_nonblocking(true)?;

    let IpAddr::V4(group) = config.multicast_group else {
        return Err(NetworkError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "multicast_group must be IPv4",
        )));
    };
    socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
    socket.set_multicast_ttl_v4(config.multicast_ttl)?;
    socket.set_multicast_loop_v4(true)?;

    Ok(UdpSocket::from_std(socket.into())?)
}

/// Encode a datagram: one type byte followed by the `bincode` body. Returns
/// [`NetworkError::MessageTooLarge`] if the result would exceed
/// `max_udp_datagram_size`.
pub fn encode_datagram<T: serde::Serialize>(
    message_type: MessageType,
    value: &T,
    max_size: usize,
) -> Result<Vec<u8>, NetworkError> {
    let body = messages::encode(value).map_err(|e| {
        NetworkError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))
    })?;
    let mut datagram = Vec::with_capacity(1 + body.len());
    datagram.push(message_type as u8);
    datagram.extend_from_slice(&body);
    if datagram.len() > max_size {
        return Err(NetworkError::MessageTooLarge { size: datagram.len(), max: max_size });
    }
    Ok(datagram)
}

/// Decode a datagram back into its message type and body bytes (the caller
/// then hands the body to [`messages::decode`] for the concrete payload
/// type, since the expected type is usually already known from context).
pub fn decode_datagram(bytes: &[u8]) -> Option<(MessageType, &[u8])> {
    let (&type_byte, body) = bytes.split_first()?;
    let message_type = MessageType::from_u8(type_byte)?;
    Some((message_type, body))
}
