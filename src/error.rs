use std::net::Ipv4Addr;

use thiserror::Error as ThisError;

pub type OpaqueError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(ThisError, Debug)]
#[non_exhaustive]
pub enum InputBuildError {
    #[error("target IP address is required")]
    MissingTargetIp,
    #[error("`{0}` is not a valid IPv4 address")]
    InvalidTargetIp(String),
}

#[derive(ThisError, Debug)]
pub enum Error {
    #[error("no usable neighbour backend (tried netlink, ip, arp)")]
    NoUsableBackend,
    #[error("netlink query failed: {0}")]
    Netlink(String),
    #[error("neighbour query timed out")]
    QueryTimeout,
    #[error("device {0} is already tracked")]
    DuplicateDevice(Ipv4Addr),
    #[error("device {0} is not tracked")]
    UnknownDevice(Ipv4Addr),
    #[error("{0} is not within any local network")]
    OutOfRange(Ipv4Addr),
    #[error(transparent)]
    Input(#[from] InputBuildError),
    #[error("{0}")]
    Opaque(#[from] OpaqueError),
}
pub type Result<T> = std::result::Result<T, Error>;
