use std::net::{Ipv4Addr, SocketAddrV4};

use log::debug;
use tokio::net::UdpSocket;

use crate::constants::{WAKE_PAYLOAD, WAKE_PORT};

/// Sends a single UDP datagram to provoke link-layer traffic from a host.
///
/// No reply is read. The only goal is to refresh the neighbour cache entry
/// before it gets queried, so every failure is logged and dropped.
#[derive(Debug, Clone)]
pub struct WakeSender {
    port: u16,
    payload: Vec<u8>,
}

impl Default for WakeSender {
    fn default() -> Self {
        Self::new(WAKE_PORT)
    }
}

impl WakeSender {
    /// A sender targeting `port` with the default payload.
    pub fn new(port: u16) -> Self {
        Self {
            port,
            payload: WAKE_PAYLOAD.to_vec(),
        }
    }

    /// Replaces the datagram payload.
    pub fn with_payload(mut self, payload: &[u8]) -> Self {
        self.payload = payload.to_vec();
        self
    }

    /// Destination UDP port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Sends the wake datagram to a single target.
    pub async fn wake(&self, target_ip: Ipv4Addr) {
        self.wake_all(&[target_ip]).await
    }

    /// Sends the wake datagram to every target from one ephemeral socket.
    pub async fn wake_all(&self, targets: &[Ipv4Addr]) {
        if targets.is_empty() {
            return;
        }
        let socket = match UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)).await {
            Ok(socket) => socket,
            Err(err) => {
                debug!("failed to open wake socket, reason: {}", err);
                return;
            }
        };
        for target_ip in targets {
            let dest = SocketAddrV4::new(*target_ip, self.port);
            if let Err(err) = socket.send_to(&self.payload, dest).await {
                debug!("failed to wake {}, reason: {}", target_ip, err);
            }
        }
    }
}
