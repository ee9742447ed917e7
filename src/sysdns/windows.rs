//! Windows DNS control via `netsh`.
//!
//! Resolvers are set statically per interface and restored either to the
//! backed-up list or to DHCP. The DHCP-supplied servers can be probed from
//! `ipconfig /all`, which recovers a usable backup when a crashed run left
//! loopback installed. Everything is subprocess-driven; interface names are
//! validated before they are interpolated into arguments.

use std::net::IpAddr;
use std::time::Duration;

use super::cmd;
use super::{ResolverState, SysDnsError};

pub struct NativeBackend;

impl NativeBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NativeBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl super::Backend for NativeBackend {
    fn platform(&self) -> &'static str {
        "win32"
    }

    async fn detect_interface(&self) -> Result<String, SysDnsError> {
        let output = cmd::run("netsh", &["interface", "show", "interface"]).await?;
        parse_connected_interface(&output).ok_or(SysDnsError::NoInterface)
    }

    async fn read_resolvers(&self, interface: &str) -> Result<ResolverState, SysDnsError> {
        let name_arg = format!("name={interface}");
        let output = cmd::run(
            "netsh",
            &["interface", "ipv4", "show", "dnsservers", &name_arg],
        )
        .await?;
        Ok(parse_dnsservers(&output))
    }

    async fn set_resolvers(
        &self,
        interface: &str,
        servers: &[IpAddr],
    ) -> Result<(), SysDnsError> {
        let name_arg = format!("name={interface}");
        let mut servers = servers.iter();
        let Some(primary) = servers.next() else {
            return Ok(());
        };

        let primary_arg = primary.to_string();
        cmd::run(
            "netsh",
            &[
                "interface",
                "ipv4",
                "set",
                "dnsservers",
                &name_arg,
                "static",
                &primary_arg,
                "primary",
            ],
        )
        .await?;

        for (i, secondary) in servers.enumerate() {
            let addr_arg = secondary.to_string();
            let index_arg = format!("index={}", i + 2);
            cmd::run(
                "netsh",
                &[
                    "interface",
                    "ipv4",
                    "add",
                    "dnsservers",
                    &name_arg,
                    &addr_arg,
                    &index_arg,
                ],
            )
            .await?;
        }
        Ok(())
    }

    async fn restore_static(
        &self,
        interface: &str,
        servers: &[IpAddr],
    ) -> Result<(), SysDnsError> {
        self.set_resolvers(interface, servers).await
    }

    async fn restore_automatic(&self, interface: &str) -> Result<(), SysDnsError> {
        let name_arg = format!("name={interface}");
        cmd::run(
            "netsh",
            &["interface", "ipv4", "set", "dnsservers", &name_arg, "dhcp"],
        )
        .await
        .map(|_| ())
    }

    async fn restore_file(&self, _interface: &str, _contents: &str) -> Result<(), SysDnsError> {
        Err(SysDnsError::Unsupported("file-based resolver restore"))
    }

    async fn probe_dhcp_dns(&self, interface: &str) -> Result<Vec<IpAddr>, SysDnsError> {
        let output = cmd::run("ipconfig", &["/all"]).await?;
        Ok(parse_ipconfig_dns(&output, interface))
    }

    async fn can_resolve_external(&self) -> bool {
        super::system_can_resolve(Duration::from_secs(5)).await
    }
}

/// First interface in "Connected" state from `netsh interface show interface`.
///
/// ```text
/// Admin State    State          Type             Interface Name
/// -------------------------------------------------------------
/// Enabled        Connected      Dedicated        Ethernet
/// Enabled        Disconnected   Dedicated        Wi-Fi
/// ```
fn parse_connected_interface(output: &str) -> Option<String> {
    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() >= 4 && fields[1].eq_ignore_ascii_case("connected") {
            return Some(fields[3..].join(" "));
        }
    }
    None
}

/// Parse `netsh interface ipv4 show dnsservers` output.
///
/// "Configured through DHCP" means automatic; otherwise every address
/// listed under "Statically Configured DNS Servers" counts.
fn parse_dnsservers(output: &str) -> ResolverState {
    if output.to_ascii_lowercase().contains("dhcp") {
        return ResolverState::Dhcp;
    }
    let servers: Vec<IpAddr> = output
        .split_whitespace()
        .filter_map(|word| word.parse().ok())
        .collect();
    if servers.is_empty() {
        ResolverState::Dhcp
    } else {
        ResolverState::Servers(servers)
    }
}

/// Extract the DNS servers of one adapter's section in `ipconfig /all`.
///
/// Sections start with `... adapter <name>:`; the DNS entry is
/// `DNS Servers . . . : <ip>` with bare-IP continuation lines.
fn parse_ipconfig_dns(output: &str, interface: &str) -> Vec<IpAddr> {
    let mut in_section = false;
    let mut in_dns = false;
    let mut servers = Vec::new();
    let needle = interface.to_ascii_lowercase();

    for line in output.lines() {
        let lower = line.to_ascii_lowercase();
        if lower.contains("adapter ") && lower.trim_end().ends_with(':') {
            in_section = lower.contains(&needle);
            in_dns = false;
            continue;
        }
        if !in_section {
            continue;
        }

        if lower.contains("dns servers") {
            in_dns = true;
            if let Some(value) = line.rsplit(':').next() {
                if let Ok(ip) = value.trim().parse::<IpAddr>() {
                    servers.push(ip);
                }
            }
            continue;
        }

        if in_dns {
            // Continuation lines hold a bare address; anything else ends
            // the DNS entry.
            match line.trim().parse::<IpAddr>() {
                Ok(ip) => servers.push(ip),
                Err(_) => in_dns = false,
            }
        }
    }

    servers
        .into_iter()
        .filter(|ip| !super::backup::is_loopback(*ip))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_first_connected_interface() {
        let output = "\n\
            Admin State    State          Type             Interface Name\n\
            -------------------------------------------------------------\n\
            Enabled        Disconnected   Dedicated        Wi-Fi\n\
            Enabled        Connected      Dedicated        Ethernet 2\n";
        assert_eq!(
            parse_connected_interface(output),
            Some("Ethernet 2".to_string())
        );
    }

    #[test]
    fn no_connected_interface_yields_none() {
        let output = "Admin State    State          Type             Interface Name\n\
                      Enabled        Disconnected   Dedicated        Wi-Fi\n";
        assert_eq!(parse_connected_interface(output), None);
    }

    #[test]
    fn dhcp_configured_servers_parse_as_dhcp() {
        let output = "Configuration for interface \"Ethernet\"\n\
                      DNS servers configured through DHCP:  192.168.1.1\n\
                      Register with which suffix:           Primary only\n";
        assert_eq!(parse_dnsservers(output), ResolverState::Dhcp);
    }

    #[test]
    fn static_servers_parse_as_list() {
        let output = "Configuration for interface \"Ethernet\"\n\
                      Statically Configured DNS Servers:    127.0.0.1\n\
                                                            8.8.8.8\n\
                      Register with which suffix:           Primary only\n";
        assert_eq!(
            parse_dnsservers(output),
            ResolverState::Servers(vec![
                "127.0.0.1".parse().unwrap(),
                "8.8.8.8".parse().unwrap(),
            ])
        );
    }

    #[test]
    fn ipconfig_dns_extracts_adapter_servers() {
        let output = "Windows IP Configuration\n\
            \n\
            Ethernet adapter Ethernet:\n\
            \n\
            \x20  DHCP Enabled. . . . . . . . . . . : Yes\n\
            \x20  DNS Servers . . . . . . . . . . . : 192.168.1.1\n\
            \x20                                      192.168.1.2\n\
            \x20  NetBIOS over Tcpip. . . . . . . . : Enabled\n\
            \n\
            Wireless LAN adapter Wi-Fi:\n\
            \n\
            \x20  DNS Servers . . . . . . . . . . . : 10.0.0.1\n";

        assert_eq!(
            parse_ipconfig_dns(output, "Ethernet"),
            vec![
                "192.168.1.1".parse::<IpAddr>().unwrap(),
                "192.168.1.2".parse::<IpAddr>().unwrap(),
            ]
        );
        assert_eq!(
            parse_ipconfig_dns(output, "Wi-Fi"),
            vec!["10.0.0.1".parse::<IpAddr>().unwrap()]
        );
    }

    #[test]
    fn ipconfig_dns_filters_loopback() {
        let output = "Ethernet adapter Ethernet:\n\
            \x20  DNS Servers . . . . . . . . . . . : 127.0.0.1\n\
            \x20                                      192.168.1.1\n";
        assert_eq!(
            parse_ipconfig_dns(output, "Ethernet"),
            vec!["192.168.1.1".parse::<IpAddr>().unwrap()]
        );
    }
}
