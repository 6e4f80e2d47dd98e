use std::{collections::HashSet, net::Ipv4Addr, time::Duration};

use log::info;
use pnet::util::MacAddr;
use timedmap::TimedMap;
use tokio::sync::Mutex;

/// Remembers the last link-layer address seen for each device.
///
/// Only used for diagnostics; presence never depends on it.
#[derive(Debug)]
pub(super) struct MacCache {
    timeout: Duration,
    addresses: TimedMap<Ipv4Addr, MacAddr>,
    reported_unknown: Mutex<HashSet<Ipv4Addr>>,
}

impl MacCache {
    pub(super) fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            addresses: TimedMap::new(),
            reported_unknown: Mutex::new(HashSet::new()),
        }
    }

    pub(super) async fn cache(&self, ip: Ipv4Addr, mac: MacAddr) {
        self.addresses.insert(ip, mac, self.timeout);
        self.reported_unknown.lock().await.remove(&ip);
    }

    /// Returns `None` for an unknown address, logging that once per device.
    pub(super) async fn lookup(&self, ip: &Ipv4Addr) -> Option<MacAddr> {
        let mac = self.addresses.get(ip);
        if mac.is_none() && self.reported_unknown.lock().await.insert(*ip) {
            info!("MAC address of {} is unknown", ip);
        }
        mac
    }

    pub(super) async fn forget(&self, ip: &Ipv4Addr) {
        self.addresses.remove(ip);
        self.reported_unknown.lock().await.remove(ip);
    }
}
