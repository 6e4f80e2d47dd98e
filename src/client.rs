use ipnet::Ipv4Net;
use log::{debug, info, warn};
use pnet::datalink::{self, NetworkInterface};

use std::{net::IpAddr, net::Ipv4Addr, sync::Arc, time::Duration};
use tokio::{
    sync::{watch, Mutex, Semaphore},
    task::JoinHandle,
    time::MissedTickBehavior,
};

use tokio_util::sync::CancellationToken;

use crate::{
    backend::{Backend, BackendKind, Observation},
    caching::MacCache,
    constants::{
        COMMAND_TIMEOUT, MAC_CACHE_TTL, MAX_CONCURRENT_PROBES, NETLINK_WATCHDOG, UPDATE_INTERVAL,
        WAKE_PORT,
    },
    error::{Error, Result},
    presence::{ConsiderHomeBounds, DeviceInput, PresenceReport},
    registry::DeviceRegistry,
    wake::WakeSender,
};

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub update_interval: Duration,
    pub wake_interval: Option<Duration>,
    pub wake_port: u16,
    pub command_timeout: Duration,
    pub netlink_timeout: Duration,
    pub max_concurrent_probes: usize,
    pub consider_home_bounds: ConsiderHomeBounds,
    pub mac_cache_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct TrackerConfigBuilder {
    update_interval: Option<Duration>,
    wake_interval: Option<Duration>,
    wake_port: Option<u16>,
    command_timeout: Option<Duration>,
    netlink_timeout: Option<Duration>,
    max_concurrent_probes: Option<usize>,
    consider_home_bounds: Option<ConsiderHomeBounds>,
    mac_cache_timeout: Option<Duration>,
}

impl Default for TrackerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TrackerConfigBuilder {
    pub fn new() -> Self {
        Self {
            update_interval: Some(UPDATE_INTERVAL),
            wake_interval: None,
            wake_port: Some(WAKE_PORT),
            command_timeout: Some(COMMAND_TIMEOUT),
            netlink_timeout: Some(NETLINK_WATCHDOG),
            max_concurrent_probes: Some(MAX_CONCURRENT_PROBES),
            consider_home_bounds: Some(ConsiderHomeBounds::default()),
            mac_cache_timeout: Some(MAC_CACHE_TTL),
        }
    }

    pub fn with_update_interval(mut self, interval: Duration) -> Self {
        self.update_interval = Some(interval);
        self
    }

    /// Sends wake datagrams on their own, shorter interval between updates.
    pub fn with_wake_interval(mut self, interval: Duration) -> Self {
        self.wake_interval = Some(interval);
        self
    }

    pub fn with_wake_port(mut self, port: u16) -> Self {
        self.wake_port = Some(port);
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = Some(timeout);
        self
    }

    pub fn with_netlink_timeout(mut self, timeout: Duration) -> Self {
        self.netlink_timeout = Some(timeout);
        self
    }

    /// Caps how many devices are woken and read at the same time (minimum 1).
    ///
    /// Probes past the cap wait for a permit, so a cycle in which every read
    /// hits its timeout takes up to `ceil(devices / limit) * timeout`. A higher
    /// limit shortens that at the cost of more concurrent child processes or
    /// blocking-pool threads.
    pub fn with_max_concurrent_probes(mut self, limit: usize) -> Self {
        self.max_concurrent_probes = Some(limit.max(1));
        self
    }

    pub fn with_consider_home_bounds(mut self, min: Duration, max: Duration) -> Self {
        self.consider_home_bounds = Some(ConsiderHomeBounds::new(min, max));
        self
    }

    pub fn with_mac_cache_timeout(mut self, timeout: Duration) -> Self {
        self.mac_cache_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> TrackerConfig {
        TrackerConfig {
            update_interval: self.update_interval.unwrap_or(UPDATE_INTERVAL),
            wake_interval: self.wake_interval,
            wake_port: self.wake_port.unwrap_or(WAKE_PORT),
            command_timeout: self.command_timeout.unwrap_or(COMMAND_TIMEOUT),
            netlink_timeout: self.netlink_timeout.unwrap_or(NETLINK_WATCHDOG),
            max_concurrent_probes: self.max_concurrent_probes.unwrap_or(MAX_CONCURRENT_PROBES),
            consider_home_bounds: self.consider_home_bounds.unwrap_or_default(),
            mac_cache_timeout: self.mac_cache_timeout.unwrap_or(MAC_CACHE_TTL),
        }
    }
}

/// IPv4 networks configured on local interfaces, optionally limited to one interface.
pub fn local_networks(interface_name: Option<&str>) -> Vec<Ipv4Net> {
    datalink::interfaces()
        .iter()
        .filter(|iface| interface_name.map_or(true, |name| iface.name == name))
        .flat_map(networks_of)
        .collect()
}

fn networks_of(interface: &NetworkInterface) -> Vec<Ipv4Net> {
    interface
        .ips
        .iter()
        .filter_map(|net| match net.ip() {
            IpAddr::V4(ipv4) if !ipv4.is_loopback() => {
                Ipv4Net::new(ipv4, net.prefix()).ok().map(|net| net.trunc())
            }
            _ => None,
        })
        .collect()
}

/// Drives presence detection for a set of devices.
///
/// The `Tracker` owns the backend chosen at startup and turns neighbour-table
/// reads into smoothed presence. A cycle can be run by hand with
/// [`Tracker::poll_once`], or the tracker can be moved into a background task
/// with [`Tracker::spawn`].
///
/// # Example
/// ```no_run
/// use arp_presence::{DeviceInputBuilder, DeviceRegistry, Tracker, TrackerConfigBuilder};
/// use std::net::Ipv4Addr;
///
/// tokio_test::block_on(async {
///     let config = TrackerConfigBuilder::new().build();
///     let tracker = Tracker::new(config.clone()).await.expect("no usable backend");
///     let mut registry = DeviceRegistry::new(config.consider_home_bounds);
///     registry
///         .add(
///             DeviceInputBuilder::new()
///                 .with_ip(Ipv4Addr::new(192, 168, 1, 50))
///                 .with_name("phone")
///                 .build()
///                 .unwrap(),
///         )
///         .unwrap();
///     for report in tracker.poll_once(&mut registry).await {
///         println!("{} home: {}", report.name, report.is_connected);
///     }
/// })
/// ```
#[derive(Debug)]
pub struct Tracker {
    config: TrackerConfig,
    backend: Backend,
    wake: WakeSender,
    limiter: Semaphore,
    macs: MacCache,
}

impl Tracker {
    /// Creates a tracker, selecting the best neighbour backend available.
    ///
    /// # Errors
    /// Returns [`Error::NoUsableBackend`] when neither netlink nor the `ip` or
    /// `arp` tools can be used. This is not retried.
    pub async fn new(config: TrackerConfig) -> Result<Self> {
        let backend = Backend::detect(&config).await?;
        Ok(Self::with_backend(config, backend))
    }

    pub fn with_backend(config: TrackerConfig, backend: Backend) -> Self {
        info!("tracking presence with the {} backend", backend.kind());
        Self {
            wake: WakeSender::new(config.wake_port),
            limiter: Semaphore::new(config.max_concurrent_probes.max(1)),
            macs: MacCache::new(config.mac_cache_timeout),
            backend,
            config,
        }
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Wakes `target_ip` and then reads its neighbour state.
    pub async fn probe(&self, target_ip: Ipv4Addr) -> Observation {
        let _permit = match self.limiter.acquire().await {
            Ok(permit) => permit,
            Err(_) => return Observation::not_found(),
        };
        self.wake.wake(target_ip).await;
        let mut observation = self.backend.read(target_ip).await;
        if let Some(mac) = observation.mac {
            self.macs.cache(target_ip, mac).await;
        } else if observation.is_reachable() {
            observation.mac = self.macs.lookup(&target_ip).await;
        }
        observation
    }

    /// Probes every target concurrently. Results keep the order of `targets`.
    pub async fn probe_all(&self, targets: &[Ipv4Addr]) -> Vec<(Ipv4Addr, Observation)> {
        let futures = targets
            .iter()
            .map(|target_ip| async move { (*target_ip, self.probe(*target_ip).await) });
        futures::future::join_all(futures).await
    }

    /// Runs one polling cycle over every device in `registry`.
    pub async fn poll_once(&self, registry: &mut DeviceRegistry) -> Vec<PresenceReport> {
        let observations = self.probe_all(&registry.addresses()).await;
        registry.apply(&observations, chrono::Utc::now())
    }

    /// Moves the tracker into a background polling task.
    ///
    /// The task stops when the returned handle is dropped.
    pub fn spawn(self, registry: DeviceRegistry) -> TrackerHandle {
        let tracker = Arc::new(self);
        let registry = Arc::new(Mutex::new(registry));
        let (reports_tx, reports_rx) = watch::channel(Vec::new());

        let mut task_spawner = BackgroundTaskSpawner::new();
        task_spawner.spawn(PollingLoop {
            tracker: Arc::clone(&tracker),
            registry: Arc::clone(&registry),
            reports: reports_tx,
        });

        TrackerHandle {
            tracker,
            registry,
            reports: reports_rx,
            _task_spawner: task_spawner,
        }
    }
}

/// Handle to a tracker running in the background.
#[derive(Debug)]
pub struct TrackerHandle {
    tracker: Arc<Tracker>,
    registry: Arc<Mutex<DeviceRegistry>>,
    reports: watch::Receiver<Vec<PresenceReport>>,
    _task_spawner: BackgroundTaskSpawner,
}

impl TrackerHandle {
    pub fn backend_kind(&self) -> BackendKind {
        self.tracker.backend_kind()
    }

    pub async fn add_device(&self, input: DeviceInput) -> Result<()> {
        self.registry.lock().await.add(input).map(|_| ())
    }

    pub async fn remove_device(&self, ip: &Ipv4Addr) -> Result<()> {
        self.registry.lock().await.remove(ip)?;
        self.tracker.macs.forget(ip).await;
        Ok(())
    }

    /// Changes a device's window; the value is clamped to the configured bounds.
    pub async fn set_consider_home(&self, ip: &Ipv4Addr, window: Duration) -> Result<Duration> {
        self.registry.lock().await.set_consider_home(ip, window)
    }

    /// Receives the reports of every completed cycle.
    pub fn subscribe(&self) -> watch::Receiver<Vec<PresenceReport>> {
        self.reports.clone()
    }

    pub fn latest(&self) -> Vec<PresenceReport> {
        self.reports.borrow().clone()
    }
}

struct PollingLoop {
    tracker: Arc<Tracker>,
    registry: Arc<Mutex<DeviceRegistry>>,
    reports: watch::Sender<Vec<PresenceReport>>,
}

impl PollingLoop {
    async fn run(&self) -> Result<()> {
        let mut update = tokio::time::interval(self.tracker.config.update_interval);
        update.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // without a wake interval this ticker is never polled
        let mut wake = tokio::time::interval(
            self.tracker
                .config
                .wake_interval
                .unwrap_or(self.tracker.config.update_interval),
        );
        wake.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let wake_enabled = self.tracker.config.wake_interval.is_some();

        loop {
            tokio::select! {
                _ = update.tick() => self.update().await?,
                _ = wake.tick(), if wake_enabled => {
                    let targets = self.registry.lock().await.addresses();
                    self.tracker.wake.wake_all(&targets).await;
                }
            }
        }
    }

    async fn update(&self) -> Result<()> {
        // probes run without the registry lock so devices can be edited meanwhile
        let targets = self.registry.lock().await.addresses();
        debug!("polling {} devices", targets.len());
        let observations = self.tracker.probe_all(&targets).await;
        let reports = self
            .registry
            .lock()
            .await
            .apply(&observations, chrono::Utc::now());
        self.reports.send(reports).map_err(|_| {
            Error::Opaque("all presence subscribers are gone".into())
        })
    }
}

#[derive(Debug)]
struct BackgroundTaskSpawner {
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundTaskSpawner {
    fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            handle: None,
        }
    }

    fn spawn(&mut self, polling_loop: PollingLoop) {
        let token = self.token.clone();
        let handle = tokio::task::spawn(async move {
            tokio::select! {
                result = polling_loop.run() => {
                    if let Err(err) = result {
                        warn!("presence polling stopped, reason: {}", err);
                    }
                },
                _ = token.cancelled() => {
                }
            }
        });
        self.handle = Some(handle);
    }
}

impl Drop for BackgroundTaskSpawner {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.token.cancel();
        }
    }
}
