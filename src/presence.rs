use std::{net::Ipv4Addr, str::FromStr, time::Duration};

use chrono::{DateTime, Utc};
use pnet::util::MacAddr;

use crate::constants::{DEFAULT_CONSIDER_HOME, MAX_CONSIDER_HOME, MIN_CONSIDER_HOME};
use crate::error::InputBuildError;

/// Operator-configured range for the consider-home window.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct ConsiderHomeBounds {
    pub min: Duration,
    pub max: Duration,
}

impl Default for ConsiderHomeBounds {
    fn default() -> Self {
        Self {
            min: Duration::from_secs(MIN_CONSIDER_HOME),
            max: Duration::from_secs(MAX_CONSIDER_HOME),
        }
    }
}

impl ConsiderHomeBounds {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min: min.min(max),
            max: max.max(min),
        }
    }

    pub fn clamp(&self, window: Duration) -> Duration {
        window.clamp(self.min, self.max)
    }
}

#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct DeviceInput {
    pub ip: Ipv4Addr,
    pub name: String,
    pub consider_home: Duration,
}

#[derive(Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct DeviceInputBuilder {
    ip: Option<String>,
    name: Option<String>,
    consider_home: Option<Duration>,
}

impl DeviceInputBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ip(mut self, ip: Ipv4Addr) -> Self {
        self.ip = Some(ip.to_string());
        self
    }

    /// Accepts a dotted-quad string; it is validated by [`Self::build`].
    pub fn with_ip_str(mut self, ip: &str) -> Self {
        self.ip = Some(ip.trim().to_string());
        self
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn with_consider_home(mut self, window: Duration) -> Self {
        self.consider_home = Some(window);
        self
    }

    pub fn build(&self) -> std::result::Result<DeviceInput, InputBuildError> {
        let raw_ip = self.ip.as_deref().ok_or(InputBuildError::MissingTargetIp)?;
        let ip = Ipv4Addr::from_str(raw_ip)
            .map_err(|_| InputBuildError::InvalidTargetIp(raw_ip.to_string()))?;
        Ok(DeviceInput {
            ip,
            name: self.name.clone().unwrap_or_else(|| ip.to_string()),
            consider_home: self
                .consider_home
                .unwrap_or(Duration::from_secs(DEFAULT_CONSIDER_HOME)),
        })
    }
}

/// A host whose presence is tracked.
///
/// `is_connected` is never stored; it is derived from `last_seen` and the
/// consider-home window on every evaluation.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct TrackedDevice {
    ip: Ipv4Addr,
    name: String,
    consider_home: Duration,
    last_seen: Option<DateTime<Utc>>,
}

impl TrackedDevice {
    pub fn new(input: DeviceInput, bounds: &ConsiderHomeBounds) -> Self {
        Self {
            ip: input.ip,
            name: input.name,
            consider_home: bounds.clamp(input.consider_home),
            last_seen: None,
        }
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn consider_home(&self) -> Duration {
        self.consider_home
    }

    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        self.last_seen
    }

    pub fn set_consider_home(&mut self, window: Duration, bounds: &ConsiderHomeBounds) {
        self.consider_home = bounds.clamp(window);
    }

    /// Folds one reachability verdict into the device and returns the new presence.
    pub fn observe(&mut self, reachable: bool, now: DateTime<Utc>) -> bool {
        if reachable {
            self.last_seen = Some(self.last_seen.map_or(now, |seen| seen.max(now)));
        }
        self.is_connected(now)
    }

    pub fn is_connected(&self, now: DateTime<Utc>) -> bool {
        let Some(last_seen) = self.last_seen else {
            return false;
        };
        // a clock that went backwards still counts as "just seen"
        match (now - last_seen).to_std() {
            Ok(elapsed) => elapsed < self.consider_home,
            Err(_) => true,
        }
    }
}

/// Per-device presence published after every polling cycle.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct PresenceReport {
    pub ip: Ipv4Addr,
    pub name: String,
    pub is_connected: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub mac: Option<MacAddr>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn device(consider_home: u64) -> TrackedDevice {
        let input = DeviceInputBuilder::new()
            .with_ip(Ipv4Addr::new(192, 168, 1, 50))
            .with_consider_home(Duration::from_secs(consider_home))
            .build()
            .unwrap();
        let bounds = ConsiderHomeBounds::new(Duration::from_secs(1), Duration::from_secs(600));
        TrackedDevice::new(input, &bounds)
    }

    fn at(t0: DateTime<Utc>, secs: i64) -> DateTime<Utc> {
        t0 + TimeDelta::seconds(secs)
    }

    #[test]
    fn test_new_device_is_away() {
        let device = device(30);
        assert_eq!(device.last_seen(), None);
        assert!(!device.is_connected(Utc::now()));
    }

    #[test]
    fn test_consider_home_window() {
        let t0 = Utc::now();
        let mut device = device(30);
        assert!(device.observe(true, t0));
        assert!(device.observe(false, at(t0, 10)));
        assert!(device.observe(false, at(t0, 20)));
        assert!(!device.observe(false, at(t0, 40)));
        assert_eq!(device.last_seen(), Some(t0));
    }

    #[test]
    fn test_window_edges() {
        let t0 = Utc::now();
        for window in [1, 15, 30, 240] {
            let mut device = device(window);
            assert!(device.observe(true, t0));
            assert!(!device.is_connected(at(t0, window as i64)));
            assert!(!device.is_connected(at(t0, window as i64 + 1)));
            assert!(device.is_connected(at(t0, window as i64 - 1)));
        }
    }

    #[test]
    fn test_observe_is_idempotent() {
        let t0 = Utc::now();
        let mut device = device(30);
        let first = device.observe(true, t0);
        let snapshot = device.clone();
        let second = device.observe(true, t0);
        assert_eq!(first, second);
        assert_eq!(device, snapshot);

        let away = at(t0, 31);
        assert_eq!(device.observe(false, away), device.observe(false, away));
        assert_eq!(device.last_seen(), Some(t0));
    }

    #[test]
    fn test_last_seen_never_moves_backwards() {
        let t0 = Utc::now();
        let mut device = device(30);
        device.observe(true, at(t0, 10));
        device.observe(true, t0);
        assert_eq!(device.last_seen(), Some(at(t0, 10)));
    }

    #[test]
    fn test_reconfiguration_keeps_history_and_clamps() {
        let t0 = Utc::now();
        let bounds = ConsiderHomeBounds::default();
        let mut device = device(30);
        device.observe(true, t0);

        device.set_consider_home(Duration::from_secs(5), &bounds);
        assert_eq!(device.consider_home(), Duration::from_secs(15));
        assert_eq!(device.last_seen(), Some(t0));

        device.set_consider_home(Duration::from_secs(3600), &bounds);
        assert_eq!(device.consider_home(), Duration::from_secs(240));
    }

    #[test]
    fn test_input_builder() {
        let input = DeviceInputBuilder::new()
            .with_ip_str(" 10.0.0.7 ")
            .build()
            .unwrap();
        assert_eq!(input.ip, Ipv4Addr::new(10, 0, 0, 7));
        assert_eq!(input.name, "10.0.0.7");
        assert_eq!(input.consider_home, Duration::from_secs(DEFAULT_CONSIDER_HOME));

        assert!(matches!(
            DeviceInputBuilder::new().build(),
            Err(InputBuildError::MissingTargetIp)
        ));
        assert!(matches!(
            DeviceInputBuilder::new().with_ip_str("10.0.0.256").build(),
            Err(InputBuildError::InvalidTargetIp(_))
        ));
        assert!(matches!(
            DeviceInputBuilder::new().with_ip_str("fe80::1").build(),
            Err(InputBuildError::InvalidTargetIp(_))
        ));
    }

    #[test]
    fn test_bounds_are_ordered() {
        let bounds = ConsiderHomeBounds::new(Duration::from_secs(60), Duration::from_secs(10));
        assert_eq!(bounds.min, Duration::from_secs(10));
        assert_eq!(bounds.max, Duration::from_secs(60));
    }
}
