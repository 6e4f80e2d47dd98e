use std::{
    ffi::OsString,
    net::Ipv4Addr,
    path::{Path, PathBuf},
    process::Stdio,
    str::FromStr,
    time::Duration,
};

use log::debug;
use pnet::util::MacAddr;
use tokio::process::Command;

use crate::constants::{ARP_ARGS, COMMAND_TIMEOUT, IP_NEIGH_ARGS, MAC_ADDR_SEPARATORS};
use crate::error::{Error, Result};

/// An external neighbour-table tool invoked once per target address.
///
/// The target IP is appended as the last argument. The child is killed when
/// the timeout fires.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct NeighborCommand {
    program: PathBuf,
    args: Vec<OsString>,
    timeout: Duration,
}

impl NeighborCommand {
    /// A bare `program` with no arguments and the default timeout.
    pub fn new<P: AsRef<Path>>(program: P) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
            args: Vec::new(),
            timeout: COMMAND_TIMEOUT,
        }
    }

    /// `ip -4 neigh show nud reachable nud delay <ip>`
    pub fn ip_neigh<P: AsRef<Path>>(program: P) -> Self {
        Self::new(program).with_args(IP_NEIGH_ARGS)
    }

    /// `arp -na <ip>`
    pub fn arp<P: AsRef<Path>>(program: P) -> Self {
        Self::new(program).with_args(ARP_ARGS)
    }

    /// Replaces the fixed arguments placed before the target IP.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Upper bound for one invocation, after which the child is killed.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Path of the executable.
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Runs the command for `target_ip` and returns the MAC of the matching row.
    ///
    /// `None` covers everything that is not a positive match: no row, timeout,
    /// spawn failure or unparseable output.
    pub async fn lookup(&self, target_ip: Ipv4Addr) -> Option<MacAddr> {
        match self.run(target_ip).await {
            Ok(stdout) => parse_neighbor_output(&stdout, target_ip),
            Err(err) => {
                debug!(
                    "neighbour lookup for {} via {} failed, reason: {}",
                    target_ip,
                    self.program.display(),
                    err
                );
                None
            }
        }
    }

    async fn run(&self, target_ip: Ipv4Addr) -> Result<String> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .arg(target_ip.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                Error::Opaque(format!("failed to spawn command, reason: {}", err).into())
            })?;

        // dropping the pending future on timeout drops the child, which kills it
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| Error::QueryTimeout)?
            .map_err(|err| {
                Error::Opaque(format!("failed to read command output, reason: {}", err).into())
            })?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Finds the row describing `target_ip` and returns its link-layer address.
///
/// Understands `ip neigh` rows (`10.0.0.5 dev eth0 lladdr aa:bb:cc:dd:ee:ff REACHABLE`)
/// and both `arp -n` layouts (`10.0.0.5 ether aa:bb:.. C eth0` and
/// `? (10.0.0.5) at aa:bb:.. [ether] on eth0`).
pub fn parse_neighbor_output(stdout: &str, target_ip: Ipv4Addr) -> Option<MacAddr> {
    stdout
        .lines()
        .find_map(|line| parse_neighbor_line(line, target_ip))
}

pub(crate) fn parse_neighbor_line(line: &str, target_ip: Ipv4Addr) -> Option<MacAddr> {
    let mut has_target = false;
    let mut mac = None;
    for token in line.split_whitespace() {
        let token = token.trim_matches(|c| c == '(' || c == ')');
        if Ipv4Addr::from_str(token).is_ok_and(|ip| ip == target_ip) {
            has_target = true;
        } else if mac.is_none() {
            mac = parse_mac_token(token);
        }
    }
    if has_target {
        mac
    } else {
        None
    }
}

fn parse_mac_token(token: &str) -> Option<MacAddr> {
    if token.matches(':').count() != MAC_ADDR_SEPARATORS {
        return None;
    }
    MacAddr::from_str(token).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const TARGET: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 50);

    fn script(body: &str) -> NeighborCommand {
        NeighborCommand::new("sh").with_args(["-c", body, "sh"])
    }

    #[test]
    fn test_parse_ip_neigh_row() {
        let out = "192.168.1.50 dev eth0 lladdr aa:bb:cc:dd:ee:ff REACHABLE";
        assert_eq!(
            parse_neighbor_output(out, TARGET),
            Some(MacAddr::new(0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff))
        );
    }

    #[test]
    fn test_parse_arp_rows() {
        let bsd = "? (192.168.1.50) at 00:11:22:33:44:55 [ether] on wlan0";
        let linux = "Address HWtype HWaddress Flags Mask Iface\n\
                     192.168.1.50 ether 00:11:22:33:44:55 C eth0";
        let expected = Some(MacAddr::new(0x00, 0x11, 0x22, 0x33, 0x44, 0x55));
        assert_eq!(parse_neighbor_output(bsd, TARGET), expected);
        assert_eq!(parse_neighbor_output(linux, TARGET), expected);
    }

    #[test]
    fn test_parse_rejects_other_hosts_and_incomplete_rows() {
        let out = "192.168.1.5 dev eth0 lladdr aa:bb:cc:dd:ee:ff REACHABLE\n\
                   192.168.1.500 dev eth0 lladdr aa:bb:cc:dd:ee:ff REACHABLE\n\
                   ? (192.168.1.50) at <incomplete> on eth0\n\
                   192.168.1.50 dev eth0 lladdr aa:bb:cc:dd:ee FAILED";
        assert_eq!(parse_neighbor_output(out, TARGET), None);
    }

    #[test]
    fn test_parse_garbage() {
        assert_eq!(parse_neighbor_output("", TARGET), None);
        assert_eq!(parse_neighbor_output("\u{0}::::: ::::::", TARGET), None);
        assert_eq!(
            parse_neighbor_output("192.168.1.50 lladdr zz:bb:cc:dd:ee:ff", TARGET),
            None
        );
    }

    #[tokio::test]
    async fn test_lookup_reads_stdout() {
        let cmd = script(r#"echo "$1 dev eth0 lladdr aa:bb:cc:dd:ee:ff REACHABLE""#);
        assert!(cmd.lookup(TARGET).await.is_some());
    }

    #[tokio::test]
    async fn test_lookup_timeout_is_not_reachable() {
        let cmd = script("sleep 5; echo \"$1 lladdr aa:bb:cc:dd:ee:ff\"")
            .with_timeout(Duration::from_millis(200));
        let start = std::time::Instant::now();
        assert_eq!(cmd.lookup(TARGET).await, None);
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_lookup_missing_program_is_not_reachable() {
        let cmd = NeighborCommand::ip_neigh("/nonexistent/bin/ip");
        assert_eq!(cmd.lookup(TARGET).await, None);
    }
}
