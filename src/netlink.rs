//! Native IPv4 neighbour table queries over `NETLINK_ROUTE`.
//!
//! Every query opens its own socket, dumps the table and closes the socket
//! again, so concurrent device probes never interleave reads on one socket.
//! The blocking work runs on tokio's blocking pool behind a watchdog.

use std::{net::Ipv4Addr, time::Duration};

use log::debug;
use pnet::util::MacAddr;

use crate::constants::NETLINK_WATCHDOG;
use crate::error::{Error, Result};

/// A single IPv4 row of the kernel neighbour table.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct NeighborRecord {
    pub ip: Ipv4Addr,
    pub state: u32,
    pub mac: Option<MacAddr>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct NetlinkQuery {
    watchdog: Duration,
}

impl Default for NetlinkQuery {
    fn default() -> Self {
        Self::new(NETLINK_WATCHDOG)
    }
}

impl NetlinkQuery {
    /// Creates a query whose socket reads give up after `watchdog`.
    pub fn new(watchdog: Duration) -> Self {
        Self { watchdog }
    }

    /// Returns the first IPv4 neighbour entry matching `target_ip`.
    ///
    /// # Errors
    /// Returns an error if the socket cannot be opened, the dump fails, or
    /// the watchdog fires. A missing entry is `Ok(None)`.
    pub async fn lookup(&self, target_ip: Ipv4Addr) -> Result<Option<NeighborRecord>> {
        let records = self.dump().await?;
        Ok(records.into_iter().find(|record| record.ip == target_ip))
    }

    /// Dumps the IPv4 neighbour table.
    ///
    /// The worker thread bounds its own socket reads by the watchdog, so a
    /// stalled kernel never leaves a blocking-pool thread behind.
    pub async fn dump(&self) -> Result<Vec<NeighborRecord>> {
        let watchdog = self.watchdog;
        let task = tokio::task::spawn_blocking(move || dump_neighbors(watchdog));
        tokio::time::timeout(self.watchdog, task)
            .await
            .map_err(|_| Error::QueryTimeout)?
            .map_err(|err| Error::Opaque(format!("netlink worker failed, reason: {}", err).into()))?
    }

    /// Opens the facility once and performs a full dump, without the async wrapper.
    ///
    /// Bounded by the same watchdog as [`Self::dump`].
    pub(crate) fn probe_blocking(&self) -> Result<()> {
        let records = dump_neighbors(self.watchdog)?;
        debug!("netlink neighbour dump returned {} records", records.len());
        Ok(())
    }
}

#[cfg(target_os = "linux")]
fn dump_neighbors(watchdog: Duration) -> Result<Vec<NeighborRecord>> {
    linux::dump_neighbors(watchdog)
}

#[cfg(not(target_os = "linux"))]
fn dump_neighbors(_watchdog: Duration) -> Result<Vec<NeighborRecord>> {
    Err(Error::Netlink("netlink is only available on linux".into()))
}

#[cfg(target_os = "linux")]
mod linux {
    use std::{
        io,
        os::fd::AsRawFd,
        time::{Duration, Instant},
    };

    use netlink_packet_core::{
        NetlinkHeader, NetlinkMessage, NetlinkPayload, NLM_F_DUMP, NLM_F_REQUEST,
    };
    use netlink_packet_route::neighbour::{NeighbourAddress, NeighbourAttribute, NeighbourMessage};
    use netlink_packet_route::RouteNetlinkMessage;
    use netlink_sys::{protocols::NETLINK_ROUTE, Socket, SocketAddr};
    use pnet::util::MacAddr;

    use super::NeighborRecord;
    use crate::constants::NETLINK_RECV_BUF_LEN;
    use crate::error::{Error, Result};

    pub(super) fn dump_neighbors(watchdog: Duration) -> Result<Vec<NeighborRecord>> {
        let deadline = Instant::now() + watchdog;
        let mut socket = Socket::new(NETLINK_ROUTE)
            .map_err(|e| Error::Netlink(format!("failed to create socket: {}", e)))?;
        socket
            .bind_auto()
            .map_err(|e| Error::Netlink(format!("failed to bind socket: {}", e)))?;
        socket
            .connect(&SocketAddr::new(0, 0))
            .map_err(|e| Error::Netlink(format!("failed to connect socket: {}", e)))?;

        let request = dump_request();
        socket
            .send(&request, 0)
            .map_err(|e| Error::Netlink(format!("failed to send dump request: {}", e)))?;

        let mut records = Vec::new();
        let mut buf = Vec::with_capacity(NETLINK_RECV_BUF_LEN);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::QueryTimeout);
            }
            set_recv_timeout(&socket, remaining)?;

            buf.clear();
            let len = socket.recv(&mut buf, 0).map_err(recv_error)?;
            if len == 0 {
                return Ok(records);
            }
            if parse_buffer(&buf[..len], &mut records)? {
                return Ok(records);
            }
        }
    }

    /// Sets `SO_RCVTIMEO` so a blocked `recv` returns on its own.
    fn set_recv_timeout(socket: &Socket, timeout: Duration) -> Result<()> {
        // a zero timeval means "block forever"
        let timeout = timeout.max(Duration::from_micros(1));
        let tv = libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        };
        let ret = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &tv as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(Error::Netlink(format!(
                "failed to set receive timeout: {}",
                io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    fn recv_error(err: io::Error) -> Error {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Error::QueryTimeout,
            _ => Error::Netlink(format!("failed to receive: {}", err)),
        }
    }

    pub(super) fn dump_request() -> Vec<u8> {
        let mut header = NetlinkHeader::default();
        header.flags = NLM_F_REQUEST | NLM_F_DUMP;

        let payload = RouteNetlinkMessage::GetNeighbour(NeighbourMessage::default());
        let mut packet = NetlinkMessage::new(header, NetlinkPayload::InnerMessage(payload));
        packet.finalize();

        let mut buf = vec![0u8; packet.buffer_len()];
        packet.serialize(&mut buf);
        buf
    }

    /// Appends parsed records and returns `true` once the dump is complete.
    fn parse_buffer(buf: &[u8], records: &mut Vec<NeighborRecord>) -> Result<bool> {
        let mut offset = 0;
        while offset < buf.len() {
            let msg = NetlinkMessage::<RouteNetlinkMessage>::deserialize(&buf[offset..])
                .map_err(|e| Error::Netlink(format!("failed to parse message: {}", e)))?;
            let msg_len = msg.header.length as usize;
            if msg_len == 0 {
                break;
            }
            offset += (msg_len + 3) & !3;

            match msg.payload {
                NetlinkPayload::Done(_) => return Ok(true),
                NetlinkPayload::Error(err) => {
                    return Err(Error::Netlink(format!("kernel rejected dump: {:?}", err)))
                }
                NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewNeighbour(neigh)) => {
                    if let Some(record) = to_record(&neigh) {
                        records.push(record);
                    }
                }
                _ => {}
            }
        }
        Ok(false)
    }

    fn to_record(neigh: &NeighbourMessage) -> Option<NeighborRecord> {
        let mut ip = None;
        let mut mac = None;
        for attr in &neigh.attributes {
            match attr {
                NeighbourAttribute::Destination(NeighbourAddress::Inet(addr)) => {
                    ip = Some(*addr);
                }
                NeighbourAttribute::LinkLocalAddress(bytes) if bytes.len() == 6 => {
                    mac = Some(MacAddr::new(
                        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5],
                    ));
                }
                _ => {}
            }
        }
        Some(NeighborRecord {
            ip: ip?,
            state: u32::from(u16::from(neigh.header.state)),
            mac,
        })
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::nud::NudState;
        use netlink_packet_route::neighbour::NeighbourState;
        use netlink_packet_route::AddressFamily;
        use std::net::{Ipv4Addr, Ipv6Addr};

        const NLMSG_DONE: u16 = 3;
        const NLM_F_MULTI: u16 = 2;

        fn new_neighbour(
            family: AddressFamily,
            state: NeighbourState,
            attrs: Vec<NeighbourAttribute>,
        ) -> Vec<u8> {
            let mut neigh = NeighbourMessage::default();
            neigh.header.family = family;
            neigh.header.state = state;
            neigh.attributes = attrs;

            let mut header = NetlinkHeader::default();
            header.flags = NLM_F_MULTI;
            let mut packet = NetlinkMessage::new(
                header,
                NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewNeighbour(neigh)),
            );
            packet.finalize();
            let mut buf = vec![0u8; packet.buffer_len()];
            packet.serialize(&mut buf);
            buf
        }

        // nlmsghdr followed by the 4-byte status code
        fn done() -> Vec<u8> {
            let mut buf = Vec::with_capacity(20);
            buf.extend_from_slice(&20u32.to_ne_bytes());
            buf.extend_from_slice(&NLMSG_DONE.to_ne_bytes());
            buf.extend_from_slice(&NLM_F_MULTI.to_ne_bytes());
            buf.extend_from_slice(&0u32.to_ne_bytes());
            buf.extend_from_slice(&0u32.to_ne_bytes());
            buf.extend_from_slice(&0i32.to_ne_bytes());
            buf
        }

        fn stale_row() -> Vec<u8> {
            new_neighbour(
                AddressFamily::Inet,
                NeighbourState::Stale,
                vec![
                    NeighbourAttribute::Destination(NeighbourAddress::Inet(Ipv4Addr::new(
                        10, 0, 0, 5,
                    ))),
                    NeighbourAttribute::LinkLocalAddress(vec![2, 0, 0, 0, 0, 1]),
                ],
            )
        }

        fn ipv6_row() -> Vec<u8> {
            new_neighbour(
                AddressFamily::Inet6,
                NeighbourState::Reachable,
                vec![
                    NeighbourAttribute::Destination(NeighbourAddress::Inet6(Ipv6Addr::LOCALHOST)),
                    NeighbourAttribute::LinkLocalAddress(vec![2, 0, 0, 0, 0, 2]),
                ],
            )
        }

        #[test]
        fn test_dump_request_is_framed() {
            let buf = dump_request();
            let len = u32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
            assert_eq!(len, buf.len());
            let msg = NetlinkMessage::<RouteNetlinkMessage>::deserialize(&buf).unwrap();
            assert_eq!(msg.header.flags, NLM_F_REQUEST | NLM_F_DUMP);
            assert!(matches!(
                msg.payload,
                NetlinkPayload::InnerMessage(RouteNetlinkMessage::GetNeighbour(_))
            ));
        }

        #[test]
        fn test_parse_buffer_extracts_ipv4_rows() {
            let mut buf = stale_row();
            buf.extend(ipv6_row());
            buf.extend(new_neighbour(
                AddressFamily::Inet,
                NeighbourState::Reachable,
                vec![NeighbourAttribute::LinkLocalAddress(vec![2, 0, 0, 0, 0, 3])],
            ));

            let mut records = Vec::new();
            let finished = parse_buffer(&buf, &mut records).unwrap();
            assert!(!finished);
            assert_eq!(
                records,
                vec![NeighborRecord {
                    ip: Ipv4Addr::new(10, 0, 0, 5),
                    state: NudState::Stale.code(),
                    mac: Some(MacAddr::new(2, 0, 0, 0, 0, 1)),
                }]
            );
        }

        #[test]
        fn test_parse_buffer_stops_at_done() {
            let mut buf = stale_row();
            buf.extend(done());

            let mut records = Vec::new();
            assert!(parse_buffer(&buf, &mut records).unwrap());
            assert_eq!(records.len(), 1);

            let mut records = Vec::new();
            assert!(parse_buffer(&done(), &mut records).unwrap());
            assert!(records.is_empty());
        }

        #[test]
        fn test_message_without_destination_is_skipped() {
            assert!(to_record(&NeighbourMessage::default()).is_none());
        }

        #[test]
        fn test_recv_timeout_maps_to_query_timeout() {
            for kind in [io::ErrorKind::WouldBlock, io::ErrorKind::TimedOut] {
                assert!(matches!(recv_error(kind.into()), Error::QueryTimeout));
            }
            assert!(matches!(
                recv_error(io::ErrorKind::PermissionDenied.into()),
                Error::Netlink(_)
            ));
        }

        #[test]
        fn test_recv_timeout_is_applied_to_socket() {
            let Ok(socket) = Socket::new(NETLINK_ROUTE) else {
                return;
            };
            set_recv_timeout(&socket, Duration::from_millis(250)).unwrap();

            let mut tv = libc::timeval {
                tv_sec: 0,
                tv_usec: 0,
            };
            let mut len = std::mem::size_of::<libc::timeval>() as libc::socklen_t;
            let ret = unsafe {
                libc::getsockopt(
                    socket.as_raw_fd(),
                    libc::SOL_SOCKET,
                    libc::SO_RCVTIMEO,
                    &mut tv as *mut _ as *mut libc::c_void,
                    &mut len,
                )
            };
            assert_eq!(ret, 0);
            assert_eq!(tv.tv_sec, 0);
            assert!(tv.tv_usec > 0);
        }

        #[test]
        fn test_expired_deadline_returns_without_reading() {
            let start = Instant::now();
            let result = dump_neighbors(Duration::ZERO);
            assert!(matches!(
                result,
                Err(Error::QueryTimeout) | Err(Error::Netlink(_))
            ));
            assert!(start.elapsed() < Duration::from_secs(1));
        }
    }
}
