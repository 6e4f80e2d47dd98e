use std::time::Duration;

pub(crate) const WAKE_PORT: u16 = 5353;
pub(crate) const WAKE_PAYLOAD: &[u8] = b"ping";

pub(crate) const UPDATE_INTERVAL: Duration = Duration::from_secs(8);
pub(crate) const COMMAND_TIMEOUT: Duration = Duration::from_secs(2);
pub(crate) const NETLINK_WATCHDOG: Duration = Duration::from_secs(1);
pub(crate) const MAC_CACHE_TTL: Duration = Duration::from_secs(60 * 60);
pub(crate) const MAX_CONCURRENT_PROBES: usize = 16;

pub(crate) const MIN_CONSIDER_HOME: u64 = 15;
pub(crate) const MAX_CONSIDER_HOME: u64 = 240;
pub(crate) const DEFAULT_CONSIDER_HOME: u64 = 24;

pub(crate) const IP_TOOL: &str = "ip";
pub(crate) const ARP_TOOL: &str = "arp";
pub(crate) const IP_NEIGH_ARGS: &[&str] = &["-4", "neigh", "show", "nud", "reachable", "nud", "delay"];
pub(crate) const ARP_ARGS: &[&str] = &["-na"];

pub(crate) const TOOL_DIRS: &[&str] = &["/sbin", "/usr/sbin", "/bin", "/usr/bin"];

pub(crate) const MAC_ADDR_SEPARATORS: usize = 5;
pub(crate) const NETLINK_RECV_BUF_LEN: usize = 32 * 1024;
