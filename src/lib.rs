//! Tracks whether LAN hosts are present by reading the kernel neighbour table.
//!
//! Each polling cycle sends a small UDP datagram to every tracked address so
//! the neighbour entry gets refreshed, reads the entry back through the best
//! backend available (netlink, `ip neigh` or `arp`), and smooths the verdict
//! with a per-device consider-home window.
//!
//! ## Example
//! Following example tracks the addresses given on the command line and prints
//! every presence change.
//! ```no_run
#![doc = include_str!("../demos/track.rs")]
//! ```

pub mod backend;
pub mod client;
pub mod command;
pub mod error;
pub mod netlink;
pub mod nud;
pub mod presence;
pub mod registry;
pub mod selector;
pub mod wake;

pub(crate) mod caching;
pub(crate) mod constants;

pub use backend::{Backend, BackendKind, Observation};
pub use client::{local_networks, Tracker, TrackerConfig, TrackerConfigBuilder, TrackerHandle};
pub use command::NeighborCommand;
pub use error::{Error, InputBuildError, Result};
pub use netlink::NetlinkQuery;
pub use nud::{classify, NudState};
pub use presence::{
    ConsiderHomeBounds, DeviceInput, DeviceInputBuilder, PresenceReport, TrackedDevice,
};
pub use registry::DeviceRegistry;
pub use selector::{select_backend, Environment, SystemEnvironment};
pub use wake::WakeSender;
