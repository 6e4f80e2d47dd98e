use arp_presence::{
    local_networks, DeviceInputBuilder, DeviceRegistry, Tracker, TrackerConfigBuilder,
};
use clap::Parser;
use std::collections::HashMap;
use std::io::Write;
use std::time::Duration;

/// Simple example to show presence tracking
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// IPv4 addresses of the devices to track
    #[arg(required = true)]
    hosts: Vec<String>,

    /// Seconds a device stays home after it was last seen
    #[arg(short, long, default_value_t = 24)]
    consider_home: u64,

    /// Only accept hosts on this interface's networks
    #[arg(short, long)]
    iface: Option<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::init();
    let args = Args::parse();

    let config = TrackerConfigBuilder::new()
        .with_wake_interval(Duration::from_secs(5))
        .build();
    let mut registry = DeviceRegistry::new(config.consider_home_bounds);
    if let Some(iface) = args.iface.as_deref() {
        registry = registry.with_local_networks(local_networks(Some(iface)));
    }
    for host in &args.hosts {
        let input = DeviceInputBuilder::new()
            .with_ip_str(host)
            .with_consider_home(Duration::from_secs(args.consider_home))
            .build()
            .unwrap();
        registry.add(input).unwrap();
    }

    let tracker = Tracker::new(config).await.unwrap();
    let handle = tracker.spawn(registry);
    let mut reports = handle.subscribe();

    let mut known = HashMap::new();
    while reports.changed().await.is_ok() {
        let latest = reports.borrow_and_update().clone();
        let mut stdout = std::io::stdout().lock();
        for report in latest {
            if known.insert(report.ip, report.is_connected) != Some(report.is_connected) {
                let state = if report.is_connected { "home" } else { "away" };
                writeln!(stdout, "{} ({}): {}", report.name, report.ip, state).unwrap();
            }
        }
    }
}
