use std::net::Ipv4Addr;

use log::debug;
use pnet::util::MacAddr;

use crate::{command::NeighborCommand, netlink::NetlinkQuery, nud::NudState};

/// Result of reading one address from the neighbour table.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct Observation {
    pub state: u32,
    pub mac: Option<MacAddr>,
}

impl Observation {
    /// An observation carrying `state` and the link-layer address, if any.
    pub fn new(state: NudState, mac: Option<MacAddr>) -> Self {
        Self {
            state: state.code(),
            mac,
        }
    }

    /// No entry for the address; reported as [`NudState::Failed`].
    pub fn not_found() -> Self {
        Self::new(NudState::Failed, None)
    }

    /// The raw state code decoded into a [`NudState`].
    pub fn nud_state(&self) -> NudState {
        NudState::from_code(self.state)
    }

    /// Whether the state counts as home, see [`crate::classify`].
    pub fn is_reachable(&self) -> bool {
        crate::nud::classify(self.state)
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub enum BackendKind {
    Netlink,
    IpNeigh,
    Arp,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Netlink => "netlink",
            Self::IpNeigh => "ip neigh",
            Self::Arp => "arp",
        })
    }
}

/// The neighbour-table reader chosen once at startup.
///
/// The netlink variant reports the full NUD state, the command variants can
/// only tell whether a row with a MAC address exists.
#[derive(Debug, Clone)]
pub enum Backend {
    Netlink(NetlinkQuery),
    IpNeigh(NeighborCommand),
    Arp(NeighborCommand),
}

impl Backend {
    /// Which reader this is, for logging and diagnostics.
    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Netlink(_) => BackendKind::Netlink,
            Self::IpNeigh(_) => BackendKind::IpNeigh,
            Self::Arp(_) => BackendKind::Arp,
        }
    }

    /// Reads the neighbour state of `target_ip`.
    ///
    /// Never fails: a missing entry or a failed query yields
    /// [`Observation::not_found`].
    pub async fn read(&self, target_ip: Ipv4Addr) -> Observation {
        match self {
            Self::Netlink(query) => match query.lookup(target_ip).await {
                Ok(Some(record)) => Observation {
                    state: record.state,
                    mac: record.mac,
                },
                Ok(None) => Observation::not_found(),
                Err(err) => {
                    debug!("netlink lookup for {} failed, reason: {}", target_ip, err);
                    Observation::not_found()
                }
            },
            Self::IpNeigh(cmd) | Self::Arp(cmd) => match cmd.lookup(target_ip).await {
                Some(mac) => Observation::new(NudState::Reachable, Some(mac)),
                None => Observation::not_found(),
            },
        }
    }
}
