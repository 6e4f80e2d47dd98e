use std::{collections::BTreeMap, net::Ipv4Addr, time::Duration};

use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use log::debug;

use crate::{
    backend::Observation,
    error::{Error, Result},
    presence::{ConsiderHomeBounds, DeviceInput, PresenceReport, TrackedDevice},
};

/// The set of tracked devices, keyed by address.
///
/// Owned by whoever drives the polling loop; every mutation of a device's
/// history goes through [`DeviceRegistry::apply`].
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    bounds: ConsiderHomeBounds,
    local_networks: Vec<Ipv4Net>,
    devices: BTreeMap<Ipv4Addr, TrackedDevice>,
}

impl DeviceRegistry {
    pub fn new(bounds: ConsiderHomeBounds) -> Self {
        Self {
            bounds,
            ..Default::default()
        }
    }

    /// Only accept devices inside one of `networks`. Empty means no restriction.
    pub fn with_local_networks(mut self, networks: Vec<Ipv4Net>) -> Self {
        self.local_networks = networks;
        self
    }

    pub fn bounds(&self) -> &ConsiderHomeBounds {
        &self.bounds
    }

    /// Starts tracking a device. Its presence starts as away.
    ///
    /// # Errors
    /// Fails if the address is already tracked or lies outside the configured
    /// local networks.
    pub fn add(&mut self, input: DeviceInput) -> Result<&TrackedDevice> {
        if self.devices.contains_key(&input.ip) {
            return Err(Error::DuplicateDevice(input.ip));
        }
        if !self.local_networks.is_empty()
            && !self.local_networks.iter().any(|net| net.contains(&input.ip))
        {
            return Err(Error::OutOfRange(input.ip));
        }
        debug!("adding {} ({}) to tracked devices", input.name, input.ip);
        let ip = input.ip;
        Ok(self
            .devices
            .entry(ip)
            .or_insert_with(|| TrackedDevice::new(input, &self.bounds)))
    }

    /// Stops tracking a device and discards its history.
    pub fn remove(&mut self, ip: &Ipv4Addr) -> Result<TrackedDevice> {
        debug!("removing {} from tracked devices", ip);
        self.devices.remove(ip).ok_or(Error::UnknownDevice(*ip))
    }

    pub fn set_consider_home(&mut self, ip: &Ipv4Addr, window: Duration) -> Result<Duration> {
        let device = self.devices.get_mut(ip).ok_or(Error::UnknownDevice(*ip))?;
        device.set_consider_home(window, &self.bounds);
        Ok(device.consider_home())
    }

    pub fn get(&self, ip: &Ipv4Addr) -> Option<&TrackedDevice> {
        self.devices.get(ip)
    }

    pub fn addresses(&self) -> Vec<Ipv4Addr> {
        self.devices.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrackedDevice> {
        self.devices.values()
    }

    /// Feeds one cycle of observations through each device's smoother.
    ///
    /// Observations for addresses that are no longer tracked are dropped.
    /// Reports come back in address order, one per observation applied.
    pub fn apply(
        &mut self,
        observations: &[(Ipv4Addr, Observation)],
        now: DateTime<Utc>,
    ) -> Vec<PresenceReport> {
        observations
            .iter()
            .filter_map(|(ip, observation)| {
                let Some(device) = self.devices.get_mut(ip) else {
                    debug!("dropping observation for untracked {}", ip);
                    return None;
                };
                let is_connected = device.observe(observation.is_reachable(), now);
                debug!(
                    "{} ({}) state {}, connected: {}",
                    device.name(),
                    ip,
                    observation.nud_state(),
                    is_connected
                );
                Some(PresenceReport {
                    ip: *ip,
                    name: device.name().to_string(),
                    is_connected,
                    last_seen: device.last_seen(),
                    mac: observation.mac,
                })
            })
            .collect()
    }
}
