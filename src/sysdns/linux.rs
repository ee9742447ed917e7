//! Linux DNS control.
//!
//! Prefers `systemd-resolved`: resolvers are read with `resolvectl` and set
//! through a drop-in under `/etc/systemd/resolved.conf.d/`, which restores
//! cleanly by deleting the drop-in and restarting the daemon. Hosts without
//! a resolver daemon fall back to editing the resolver configuration file
//! directly, between well-known marker comments; the backup then carries
//! the file's literal prior contents so restore is verbatim.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use super::cmd;
use super::{ResolverState, SysDnsError};

const RESOLV_CONF: &str = "/etc/resolv.conf";
const DROPIN_PATH: &str = "/etc/systemd/resolved.conf.d/waylay.conf";

const MARKER_BEGIN: &str = "# BEGIN waylay DNS configuration";
const MARKER_END: &str = "# END waylay DNS configuration";

pub struct NativeBackend {
    resolv_conf: PathBuf,
    dropin: PathBuf,
}

impl NativeBackend {
    pub fn new() -> Self {
        Self {
            resolv_conf: PathBuf::from(RESOLV_CONF),
            dropin: PathBuf::from(DROPIN_PATH),
        }
    }

    async fn resolved_available(&self) -> bool {
        cmd::run("resolvectl", &["status"]).await.is_ok()
    }

    async fn restart_resolved(&self) -> Result<(), SysDnsError> {
        cmd::run("systemctl", &["restart", "systemd-resolved"])
            .await
            .map(|_| ())
    }

    fn write_dropin(&self, servers: &[IpAddr]) -> Result<(), SysDnsError> {
        let listed = servers
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" ");
        let content = format!(
            "# managed by waylay\n[Resolve]\nDNS={listed}\nDomains=~.\n"
        );
        if let Some(parent) = self.dropin.parent() {
            std::fs::create_dir_all(parent).map_err(file_error)?;
        }
        std::fs::write(&self.dropin, content).map_err(file_error)
    }

    fn remove_dropin(&self) -> Result<bool, SysDnsError> {
        match std::fs::remove_file(&self.dropin) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(file_error(e)),
        }
    }
}

impl Default for NativeBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl super::Backend for NativeBackend {
    fn platform(&self) -> &'static str {
        "linux"
    }

    async fn detect_interface(&self) -> Result<String, SysDnsError> {
        let output = cmd::run("ip", &["route", "show", "default"]).await?;
        parse_default_route(&output).ok_or(SysDnsError::NoInterface)
    }

    async fn read_resolvers(&self, _interface: &str) -> Result<ResolverState, SysDnsError> {
        if self.resolved_available().await {
            let output = cmd::run("resolvectl", &["dns"]).await?;
            let servers = parse_resolvectl_output(&output);
            if servers.is_empty() {
                return Ok(ResolverState::Dhcp);
            }
            return Ok(ResolverState::Servers(servers));
        }

        match std::fs::read_to_string(&self.resolv_conf) {
            Ok(contents) => {
                let servers = parse_resolv_conf(&contents);
                Ok(ResolverState::File { contents, servers })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ResolverState::Dhcp),
            Err(e) => Err(file_error(e)),
        }
    }

    async fn set_resolvers(
        &self,
        _interface: &str,
        servers: &[IpAddr],
    ) -> Result<(), SysDnsError> {
        if self.resolved_available().await {
            self.write_dropin(servers)?;
            return self.restart_resolved().await;
        }
        write_marked_resolv_conf(&self.resolv_conf, servers)
    }

    async fn restore_static(
        &self,
        _interface: &str,
        servers: &[IpAddr],
    ) -> Result<(), SysDnsError> {
        if self.resolved_available().await {
            self.write_dropin(servers)?;
            return self.restart_resolved().await;
        }
        // Without a resolver daemon a plain server list is written back.
        let contents = servers
            .iter()
            .map(|ip| format!("nameserver {ip}\n"))
            .collect::<String>();
        std::fs::write(&self.resolv_conf, contents).map_err(file_error)
    }

    async fn restore_automatic(&self, _interface: &str) -> Result<(), SysDnsError> {
        if self.resolved_available().await {
            self.remove_dropin()?;
            return self.restart_resolved().await;
        }
        // No daemon to reassert the configuration. If our markers are still
        // present the verbatim backup is the real restore path; all this can
        // do is flag the situation.
        if let Ok(contents) = std::fs::read_to_string(&self.resolv_conf) {
            if contents.contains(MARKER_BEGIN) {
                tracing::warn!(
                    "resolver config still carries waylay markers and no resolver daemon \
                     is available; restore from backup to recover the original file"
                );
            }
        }
        Ok(())
    }

    async fn restore_file(&self, _interface: &str, contents: &str) -> Result<(), SysDnsError> {
        std::fs::write(&self.resolv_conf, contents).map_err(file_error)
    }

    async fn probe_dhcp_dns(&self, _interface: &str) -> Result<Vec<IpAddr>, SysDnsError> {
        Err(SysDnsError::Unsupported("DHCP probe"))
    }

    async fn can_resolve_external(&self) -> bool {
        super::system_can_resolve(Duration::from_secs(5)).await
    }
}

fn file_error(e: std::io::Error) -> SysDnsError {
    if e.kind() == std::io::ErrorKind::PermissionDenied {
        SysDnsError::PermissionDenied {
            command: "write resolver configuration".to_string(),
        }
    } else {
        SysDnsError::CommandFailed {
            command: "write resolver configuration".to_string(),
            detail: e.to_string(),
        }
    }
}

/// Extract the interface from `ip route show default` output:
/// `default via 192.168.1.1 dev eth0 proto dhcp ...`
fn parse_default_route(output: &str) -> Option<String> {
    let line = output.lines().find(|l| l.starts_with("default"))?;
    let mut words = line.split_whitespace();
    while let Some(word) = words.next() {
        if word == "dev" {
            return words.next().map(ToString::to_string);
        }
    }
    None
}

/// Pull every IP address out of `resolvectl dns` output. The format is not
/// machine-readable, so anything that parses as an address counts.
fn parse_resolvectl_output(output: &str) -> Vec<IpAddr> {
    output
        .lines()
        .flat_map(|line| line.split(' '))
        .filter_map(|word| IpAddr::from_str(word).ok())
        .collect()
}

fn parse_resolv_conf(contents: &str) -> Vec<IpAddr> {
    match resolv_conf::Config::parse(contents) {
        Ok(config) => config
            .nameservers
            .into_iter()
            .map(|scoped| scoped.into())
            .collect(),
        Err(_) => Vec::new(),
    }
}

fn write_marked_resolv_conf(path: &Path, servers: &[IpAddr]) -> Result<(), SysDnsError> {
    let mut content = String::new();
    content.push_str(MARKER_BEGIN);
    content.push('\n');
    content.push_str(
        "# If you see this text and waylay is not running, the last run crashed.\n\
         # The original file is recorded in the waylay DNS backup.\n",
    );
    for server in servers {
        content.push_str(&format!("nameserver {server}\n"));
    }
    content.push_str(MARKER_END);
    content.push('\n');
    std::fs::write(path, content).map_err(file_error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_default_route() {
        let output = "default via 192.168.1.1 dev eth0 proto dhcp src 192.168.1.10 metric 100\n\
                      192.168.1.0/24 dev eth0 proto kernel scope link\n";
        assert_eq!(parse_default_route(output), Some("eth0".to_string()));
    }

    #[test]
    fn default_route_missing_yields_none() {
        assert_eq!(parse_default_route(""), None);
        assert_eq!(parse_default_route("192.168.1.0/24 dev eth0\n"), None);
    }

    #[test]
    fn parses_resolvectl_dns() {
        let cases = [
            (
                "Global: 172.24.80.1\nLink 2 (eth0):\nLink 3 (docker0):\n",
                vec![IpAddr::from([172, 24, 80, 1])],
            ),
            (
                "Global:\nLink 2 (enp0s3): 192.168.1.1\n",
                vec![IpAddr::from([192, 168, 1, 1])],
            ),
        ];
        for (input, expected) in cases {
            assert_eq!(parse_resolvectl_output(input), expected);
        }
    }

    #[test]
    fn parses_resolv_conf_nameservers() {
        let servers = parse_resolv_conf("nameserver 192.168.1.1\nnameserver 9.9.9.9\n");
        assert_eq!(
            servers,
            vec![
                IpAddr::from([192, 168, 1, 1]),
                IpAddr::from([9, 9, 9, 9]),
            ]
        );
    }

    #[test]
    fn marked_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resolv.conf");
        let servers: Vec<IpAddr> = vec![
            "127.0.0.1".parse().unwrap(),
            "8.8.8.8".parse().unwrap(),
        ];

        write_marked_resolv_conf(&path, &servers).unwrap();
        let written = std::fs::read_to_string(&path).unwrap();

        assert!(written.starts_with(MARKER_BEGIN));
        assert!(written.contains("nameserver 127.0.0.1"));
        assert!(written.contains("nameserver 8.8.8.8"));
        assert!(written.trim_end().ends_with(MARKER_END));
        assert_eq!(parse_resolv_conf(&written), servers);
    }
}
