//! UDP media transport.
//!
//! One connectionless IPv4 socket per voice session. After the discovery
//! handshake the socket is send-only; anything the peer sends us afterwards
//! is left unread.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::net::UdpSocket;
use tracing::debug;

use crate::common::errors::{Result, StreamError};

/// Discovery request/response size on the wire.
const DISCOVERY_LEN: usize = 74;
/// Value of the request's length field (payload after type + length).
const DISCOVERY_PAYLOAD_LEN: u16 = 70;
const DISCOVERY_REQUEST_TYPE: u16 = 0x0001;
const DISCOVERY_RESPONSE_TYPE: u16 = 0x0002;
/// Offset of the NUL-terminated ASCII address in the response.
const DISCOVERY_ADDR_OFFSET: usize = 8;

const DISCOVERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(2);

/// Our public address as the voice server sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveredAddress {
    pub ip: Ipv4Addr,
    pub port: u16,
}

fn discovery_request(ssrc: u32) -> [u8; DISCOVERY_LEN] {
    let mut packet = [0u8; DISCOVERY_LEN];
    packet[0..2].copy_from_slice(&DISCOVERY_REQUEST_TYPE.to_be_bytes());
    packet[2..4].copy_from_slice(&DISCOVERY_PAYLOAD_LEN.to_be_bytes());
    packet[4..8].copy_from_slice(&ssrc.to_be_bytes());
    packet
}

fn parse_discovery_reply(buf: &[u8]) -> Result<DiscoveredAddress> {
    if buf.len() < DISCOVERY_LEN {
        return Err(StreamError::Handshake(format!(
            "discovery reply too short: {} bytes",
            buf.len()
        )));
    }
    let reply_type = u16::from_be_bytes([buf[0], buf[1]]);
    if reply_type != DISCOVERY_RESPONSE_TYPE {
        return Err(StreamError::Handshake(format!(
            "unexpected discovery reply type 0x{reply_type:04x}"
        )));
    }

    let addr_bytes = &buf[DISCOVERY_ADDR_OFFSET..];
    let nul = addr_bytes
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| StreamError::Handshake("discovery reply address not terminated".into()))?;
    let addr_str = std::str::from_utf8(&addr_bytes[..nul])
        .map_err(|_| StreamError::Handshake("discovery reply address is not ASCII".into()))?;
    let ip: Ipv4Addr = addr_str.parse().map_err(|_| {
        StreamError::Handshake(format!("discovery reply address '{addr_str}' is not IPv4"))
    })?;

    let port = u16::from_be_bytes([buf[buf.len() - 2], buf[buf.len() - 1]]);
    Ok(DiscoveredAddress { ip, port })
}

async fn discover(socket: &UdpSocket, peer: SocketAddr, ssrc: u32) -> Result<DiscoveredAddress> {
    socket
        .send_to(&discovery_request(ssrc), peer)
        .await
        .map_err(|e| StreamError::Handshake(format!("discovery send: {e}")))?;

    let mut buf = [0u8; DISCOVERY_LEN];
    let n = match tokio::time::timeout(DISCOVERY_TIMEOUT, socket.recv(&mut buf)).await {
        Ok(Ok(n)) => n,
        Ok(Err(e)) => return Err(StreamError::Handshake(format!("discovery recv: {e}"))),
        Err(_) => return Err(StreamError::Handshake("discovery timed out".into())),
    };
    parse_discovery_reply(&buf[..n])
}

/// The session's UDP socket plus its negotiated peer endpoint.
///
/// All sends go through one logical writer; RTP construction order is
/// preserved because each pacing stream owns its packetizer and awaits
/// every send before building the next packet.
pub struct UdpTransport {
    socket: UdpSocket,
    peer: SocketAddr,
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
}

impl UdpTransport {
    /// Binds an ephemeral socket, runs the IP discovery handshake against
    /// `peer` and returns the transport with our discovered public address.
    pub async fn connect(peer: SocketAddr, ssrc: u32) -> Result<(Self, DiscoveredAddress)> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let discovered = discover(&socket, peer, ssrc).await?;
        debug!(
            "IP discovery complete: {}:{} (peer {})",
            discovered.ip, discovered.port, peer
        );
        Ok((
            Self {
                socket,
                peer,
                packets_sent: AtomicU64::new(0),
                bytes_sent: AtomicU64::new(0),
            },
            discovered,
        ))
    }

    /// Sends one assembled packet to the peer. Errors are returned to the
    /// caller; they do not tear the session down by themselves.
    pub async fn send(&self, packet: &[u8]) -> Result<()> {
        self.socket.send_to(packet, self.peer).await?;
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(packet.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }
}
