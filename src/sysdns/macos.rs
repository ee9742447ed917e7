//! macOS DNS control via `networksetup`.
//!
//! Resolvers are managed per network service. The preferred service is
//! Wi-Fi, then Ethernet, then the first listed. "Automatic" on macOS means
//! clearing the service's resolver list with the `empty` sentinel, which
//! hands control back to DHCP.

use std::net::IpAddr;
use std::time::Duration;

use super::cmd;
use super::{ResolverState, SysDnsError};

/// Reply `networksetup -getdnsservers` gives when nothing is set.
const NO_SERVERS_PREFIX: &str = "There aren't any DNS Servers set";

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
        "darwin"
    }

    async fn detect_interface(&self) -> Result<String, SysDnsError> {
        let output = cmd::run("networksetup", &["-listallnetworkservices"]).await?;
        pick_service(&output).ok_or(SysDnsError::NoInterface)
    }

    async fn read_resolvers(&self, interface: &str) -> Result<ResolverState, SysDnsError> {
        let output = cmd::run("networksetup", &["-getdnsservers", interface]).await?;
        if output.trim_start().starts_with(NO_SERVERS_PREFIX) {
            return Ok(ResolverState::Dhcp);
        }
        let servers: Vec<IpAddr> = output
            .lines()
            .filter_map(|line| line.trim().parse().ok())
            .collect();
        if servers.is_empty() {
            Ok(ResolverState::Dhcp)
        } else {
            Ok(ResolverState::Servers(servers))
        }
    }

    async fn set_resolvers(
        &self,
        interface: &str,
        servers: &[IpAddr],
    ) -> Result<(), SysDnsError> {
        let rendered: Vec<String> = servers.iter().map(ToString::to_string).collect();
        let mut args = vec!["-setdnsservers", interface];
        args.extend(rendered.iter().map(String::as_str));
        cmd::run("networksetup", &args).await.map(|_| ())
    }

    async fn restore_static(
        &self,
        interface: &str,
        servers: &[IpAddr],
    ) -> Result<(), SysDnsError> {
        self.set_resolvers(interface, servers).await
    }

    async fn restore_automatic(&self, interface: &str) -> Result<(), SysDnsError> {
        cmd::run("networksetup", &["-setdnsservers", interface, "empty"])
            .await
            .map(|_| ())
    }

    async fn restore_file(&self, _interface: &str, _contents: &str) -> Result<(), SysDnsError> {
        Err(SysDnsError::Unsupported("file-based resolver restore"))
    }

    async fn probe_dhcp_dns(&self, _interface: &str) -> Result<Vec<IpAddr>, SysDnsError> {
        Err(SysDnsError::Unsupported("DHCP probe"))
    }

    async fn can_resolve_external(&self) -> bool {
        super::system_can_resolve(Duration::from_secs(5)).await
    }
}

/// Choose the service to manage from `-listallnetworkservices` output.
///
/// The first line is a usage banner; a leading `*` marks a disabled
/// service. Preference: Wi-Fi, then Ethernet, then the first enabled.
fn pick_service(output: &str) -> Option<String> {
    let services: Vec<&str> = output
        .lines()
        .skip(1)
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('*'))
        .collect();

    for needle in ["wi-fi", "ethernet"] {
        if let Some(service) = services
            .iter()
            .find(|s| s.to_ascii_lowercase().contains(needle))
        {
            return Some((*service).to_string());
        }
    }
    services.first().map(|s| (*s).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "An asterisk (*) denotes that a network service is disabled.\n\
                           USB 10/100/1000 LAN\n\
                           Wi-Fi\n\
                           Thunderbolt Bridge\n";

    #[test]
    fn prefers_wifi() {
        assert_eq!(pick_service(LISTING), Some("Wi-Fi".to_string()));
    }

    #[test]
    fn falls_back_to_ethernet_then_first() {
        let no_wifi = "An asterisk (*) denotes that a network service is disabled.\n\
                       Display Ethernet\n\
                       Thunderbolt Bridge\n";
        assert_eq!(pick_service(no_wifi), Some("Display Ethernet".to_string()));

        let neither = "An asterisk (*) denotes that a network service is disabled.\n\
                       Thunderbolt Bridge\n\
                       iPhone USB\n";
        assert_eq!(
            pick_service(neither),
            Some("Thunderbolt Bridge".to_string())
        );
    }

    #[test]
    fn skips_disabled_services() {
        let listing = "An asterisk (*) denotes that a network service is disabled.\n\
                       *Wi-Fi\n\
                       Thunderbolt Bridge\n";
        assert_eq!(
            pick_service(listing),
            Some("Thunderbolt Bridge".to_string())
        );
    }

    #[test]
    fn empty_listing_yields_none() {
        assert_eq!(
            pick_service("An asterisk (*) denotes that a network service is disabled.\n"),
            None
        );
    }
}
