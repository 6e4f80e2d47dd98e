use std::{
    env,
    path::{Path, PathBuf},
    time::Duration,
};

use log::{debug, info};

use crate::{
    backend::Backend,
    client::TrackerConfig,
    command::NeighborCommand,
    constants::{ARP_TOOL, IP_TOOL, NETLINK_WATCHDOG, TOOL_DIRS},
    error::{Error, Result},
    netlink::NetlinkQuery,
};

/// What the backend cascade needs to know about the host.
pub trait Environment {
    /// Opens the native neighbour facility once.
    fn probe_netlink(&self) -> Result<()>;

    /// Locates an executable by name, `which`-style.
    fn find_tool(&self, name: &str) -> Option<PathBuf>;
}

/// The real host: kernel netlink plus executables on `PATH`.
#[derive(Debug, Clone, Copy)]
pub struct SystemEnvironment {
    netlink_timeout: Duration,
}

impl Default for SystemEnvironment {
    fn default() -> Self {
        Self::new(NETLINK_WATCHDOG)
    }
}

impl SystemEnvironment {
    /// `netlink_timeout` bounds the one-off netlink dump made during selection.
    pub fn new(netlink_timeout: Duration) -> Self {
        Self { netlink_timeout }
    }
}

impl Environment for SystemEnvironment {
    fn probe_netlink(&self) -> Result<()> {
        NetlinkQuery::new(self.netlink_timeout).probe_blocking()
    }

    fn find_tool(&self, name: &str) -> Option<PathBuf> {
        let path_dirs = env::var_os("PATH")
            .map(|paths| env::split_paths(&paths).collect::<Vec<_>>())
            .unwrap_or_default();
        path_dirs
            .into_iter()
            .chain(TOOL_DIRS.iter().map(PathBuf::from))
            .map(|dir| dir.join(name))
            .find(|candidate| is_executable(candidate))
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Picks the most precise usable backend: netlink, then `ip`, then `arp`.
///
/// # Errors
/// Returns [`Error::NoUsableBackend`] when none of them is available. Callers
/// should treat this as a setup failure rather than report every device away.
pub fn select_backend<E: Environment>(env: &E, config: &TrackerConfig) -> Result<Backend> {
    match env.probe_netlink() {
        Ok(()) => {
            info!("using netlink neighbour backend");
            return Ok(Backend::Netlink(NetlinkQuery::new(config.netlink_timeout)));
        }
        Err(err) => debug!("netlink backend unavailable, reason: {}", err),
    }

    if let Some(program) = env.find_tool(IP_TOOL) {
        info!("using `{}` neighbour backend", program.display());
        return Ok(Backend::IpNeigh(
            NeighborCommand::ip_neigh(program).with_timeout(config.command_timeout),
        ));
    }
    debug!("`{}` tool not found", IP_TOOL);

    if let Some(program) = env.find_tool(ARP_TOOL) {
        info!("using `{}` neighbour backend", program.display());
        return Ok(Backend::Arp(
            NeighborCommand::arp(program).with_timeout(config.command_timeout),
        ));
    }
    debug!("`{}` tool not found", ARP_TOOL);

    Err(Error::NoUsableBackend)
}

impl Backend {
    /// Runs [`select_backend`] against the host on the blocking pool.
    pub async fn detect(config: &TrackerConfig) -> Result<Self> {
        let config = config.clone();
        let env = SystemEnvironment::new(config.netlink_timeout);
        tokio::task::spawn_blocking(move || select_backend(&env, &config))
            .await
            .map_err(|err| {
                Error::Opaque(format!("backend selection failed, reason: {}", err).into())
            })?
    }
}
