//! System DNS configuration.
//!
//! Points the host's resolvers at the loopback proxy and guarantees the
//! pre-existing configuration can be restored on clean exit, crash, or user
//! request. This is the one component that can break a machine's
//! connectivity, so every mutation is preceded by a persisted backup and
//! every failure path ends in a working resolver configuration: loss of
//! blocking is always preferred over loss of DNS.

pub mod backup;
mod cmd;

#[cfg(target_os = "linux")]
#[path = "linux.rs"]
mod platform;

#[cfg(target_os = "macos")]
#[path = "macos.rs"]
mod platform;

#[cfg(target_os = "windows")]
#[path = "windows.rs"]
mod platform;

pub use backup::{DnsBackup, OriginalDns};
pub use platform::NativeBackend;

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tokio::net::UdpSocket;

use crate::dns;
use backup::is_loopback;

/// Public fallback installed after the proxy so a proxy crash leaves
/// partial connectivity.
pub const SECONDARY_DNS: IpAddr = IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8));

/// Domain used for liveness probes.
const PROBE_DOMAIN: &str = "google.com";

/// How long a probed resolver gets to answer.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Propagation delay before re-reading resolvers for verification.
const VERIFY_SETTLE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum SysDnsError {
    #[error("permission denied running `{command}`; re-run with administrator privileges")]
    PermissionDenied { command: String },

    #[error("`{command}` failed: {detail}")]
    CommandFailed { command: String, detail: String },

    #[error("`{command}` did not finish in time")]
    CommandTimeout { command: String },

    #[error("no connected network interface found")]
    NoInterface,

    #[error("interface name {0:?} contains unsupported characters")]
    InvalidInterface(String),

    #[error("backup file I/O: {0}")]
    BackupIo(std::io::Error),

    #[error("backup file is not valid JSON: {0}")]
    BackupFormat(serde_json::Error),

    #[error("local proxy on port {port} is not answering DNS queries; refusing to redirect system DNS")]
    ProxyNotAnswering { port: u16 },

    #[error("resolver verification failed: expected primary {expected}, found {found:?}")]
    VerifyFailed {
        expected: IpAddr,
        found: Vec<IpAddr>,
    },

    #[error("restore failed: {detail}")]
    RestoreFailed { detail: String },

    #[error(
        "resolvers point at loopback and external resolution could not be re-established; \
         repair DNS settings manually before starting"
    )]
    IntegrityFailed,

    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),
}

/// The resolver configuration currently installed on an interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolverState {
    /// Explicit server list.
    Servers(Vec<IpAddr>),
    /// Automatic (DHCP-managed, or platform "no servers set").
    Dhcp,
    /// Literal resolver-file contents (Linux without a resolver daemon).
    File {
        contents: String,
        servers: Vec<IpAddr>,
    },
}

impl ResolverState {
    pub fn servers(&self) -> &[IpAddr] {
        match self {
            Self::Servers(v) => v,
            Self::Dhcp => &[],
            Self::File { servers, .. } => servers,
        }
    }

    /// A state that routes through loopback was installed by us (or a
    /// crashed previous run) and must never be captured as a backup.
    pub fn is_poisoned(&self) -> bool {
        self.servers().iter().any(|ip| is_loopback(*ip))
    }

    fn to_original(&self) -> OriginalDns {
        match self {
            Self::Servers(v) => OriginalDns::Servers(v.clone()),
            Self::Dhcp => OriginalDns::Dhcp,
            Self::File { contents, .. } => OriginalDns::File(contents.clone()),
        }
    }
}

/// Platform operations behind the configurator.
///
/// One implementation per OS; tests use a scripted mock. Methods that
/// mutate system state must be no-ops nowhere — dry-run handling lives in
/// the [`Configurator`], not in backends.
pub trait Backend {
    /// Platform tag written into backups: `win32`, `darwin`, or `linux`.
    fn platform(&self) -> &'static str;

    fn detect_interface(&self) -> impl Future<Output = Result<String, SysDnsError>>;

    fn read_resolvers(
        &self,
        interface: &str,
    ) -> impl Future<Output = Result<ResolverState, SysDnsError>>;

    fn set_resolvers(
        &self,
        interface: &str,
        servers: &[IpAddr],
    ) -> impl Future<Output = Result<(), SysDnsError>>;

    fn restore_static(
        &self,
        interface: &str,
        servers: &[IpAddr],
    ) -> impl Future<Output = Result<(), SysDnsError>>;

    fn restore_automatic(&self, interface: &str) -> impl Future<Output = Result<(), SysDnsError>>;

    fn restore_file(
        &self,
        interface: &str,
        contents: &str,
    ) -> impl Future<Output = Result<(), SysDnsError>>;

    /// Ask the platform for the DHCP-supplied DNS servers, used to recover
    /// a usable backup from a poisoned state. Only Windows implements this.
    fn probe_dhcp_dns(
        &self,
        interface: &str,
    ) -> impl Future<Output = Result<Vec<IpAddr>, SysDnsError>>;

    /// Whether the system resolver can currently resolve external names.
    fn can_resolve_external(&self) -> impl Future<Output = bool>;
}

/// Orchestrates backup, configure, restore, and the startup integrity
/// check over a platform [`Backend`].
///
/// The caller is responsible for serialization: at most one configure or
/// restore may be in flight, which the daemon guarantees by owning the
/// configurator from a single task.
pub struct Configurator<B> {
    backend: B,
    backup_path: PathBuf,
    interface: Option<String>,
    verify: bool,
    dry_run: bool,
    in_memory: Option<DnsBackup>,
    probe_timeout: Duration,
    settle: Duration,
    integrity_probe_port: u16,
}

impl<B: Backend> Configurator<B> {
    pub fn new(backend: B, backup_path: PathBuf) -> Self {
        Self {
            backend,
            backup_path,
            interface: None,
            verify: true,
            dry_run: false,
            in_memory: None,
            probe_timeout: PROBE_TIMEOUT,
            settle: VERIFY_SETTLE,
            integrity_probe_port: 53,
        }
    }

    pub fn with_interface(mut self, interface: Option<String>) -> Result<Self, SysDnsError> {
        if let Some(name) = &interface {
            validate_interface(name)?;
        }
        self.interface = interface;
        Ok(self)
    }

    pub fn with_verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    #[cfg(test)]
    fn with_timeouts(mut self, probe: Duration, settle: Duration) -> Self {
        self.probe_timeout = probe;
        self.settle = settle;
        self
    }

    #[cfg(test)]
    fn with_integrity_probe_port(mut self, port: u16) -> Self {
        self.integrity_probe_port = port;
        self
    }

    async fn interface(&mut self) -> Result<String, SysDnsError> {
        if let Some(name) = &self.interface {
            return Ok(name.clone());
        }
        let name = self.backend.detect_interface().await?;
        validate_interface(&name)?;
        tracing::info!(interface = %name, "detected active network interface");
        self.interface = Some(name.clone());
        Ok(name)
    }

    /// Capture the current resolver state to disk.
    ///
    /// A poisoned observation (resolvers already pointing at loopback) never
    /// overwrites a good on-disk backup; with no good backup available the
    /// DHCP-supplied servers are probed, and failing that the `"dhcp"`
    /// sentinel is stored so restore falls back to automatic mode.
    pub async fn backup(&mut self) -> Result<(), SysDnsError> {
        let interface = self.interface().await?;
        let state = self.backend.read_resolvers(&interface).await?;

        let original = if state.is_poisoned() {
            tracing::warn!(
                "current resolvers point at loopback; a previous run did not clean up"
            );
            if let Some(disk) = DnsBackup::load(&self.backup_path)? {
                if !disk.is_poisoned() {
                    tracing::info!("keeping existing non-poisoned backup");
                    self.in_memory = Some(disk);
                    return Ok(());
                }
            }
            match self.backend.probe_dhcp_dns(&interface).await {
                Ok(servers)
                    if !servers.is_empty() && !servers.iter().any(|ip| is_loopback(*ip)) =>
                {
                    tracing::info!(?servers, "recovered original resolvers from DHCP");
                    OriginalDns::Servers(servers)
                }
                _ => OriginalDns::Dhcp,
            }
        } else {
            state.to_original()
        };

        let record = DnsBackup::new(self.backend.platform(), &interface, original);
        if self.dry_run {
            tracing::info!(?record.original_dns, "dry-run: would persist DNS backup");
        } else {
            record.store(&self.backup_path)?;
        }
        self.in_memory = Some(record);
        Ok(())
    }

    /// Install the loopback proxy as the primary resolver.
    ///
    /// Refuses to touch the system if the proxy is not actually answering
    /// queries on the given port. Rolls back on any failure after the
    /// resolvers were changed.
    pub async fn configure(&mut self, proxy_port: u16) -> Result<(), SysDnsError> {
        let interface = self.interface().await?;
        self.backup().await?;

        let proxy_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), proxy_port);
        if !probe_dns(proxy_addr, self.probe_timeout).await {
            return Err(SysDnsError::ProxyNotAnswering { port: proxy_port });
        }

        let primary = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let servers = [primary, SECONDARY_DNS];

        if self.dry_run {
            tracing::info!(
                %interface,
                ?servers,
                "dry-run: would set system resolvers"
            );
            return Ok(());
        }

        if let Err(e) = self.backend.set_resolvers(&interface, &servers).await {
            tracing::error!(error = %e, "failed to set resolvers, rolling back");
            let _ = self.restore().await;
            return Err(e);
        }

        if self.verify {
            tokio::time::sleep(self.settle).await;
            let state = self.backend.read_resolvers(&interface).await;
            let verified = matches!(&state, Ok(s) if s.servers().first() == Some(&primary));
            if !verified {
                let found = state.map(|s| s.servers().to_vec()).unwrap_or_default();
                tracing::error!(?found, "resolver verification failed, rolling back");
                let _ = self.restore().await;
                return Err(SysDnsError::VerifyFailed {
                    expected: primary,
                    found,
                });
            }
        }

        tracing::info!(%interface, "system DNS now points at the local proxy");
        Ok(())
    }

    /// Return the resolvers to their pre-configure value.
    ///
    /// Prefers the on-disk backup, then the in-memory copy, then automatic
    /// mode. Any failure falls back to automatic mode; the interface is
    /// never left with loopback as its only resolver.
    pub async fn restore(&mut self) -> Result<(), SysDnsError> {
        let interface = self.interface().await?;
        let backup = DnsBackup::load(&self.backup_path)?.or_else(|| self.in_memory.clone());

        if self.dry_run {
            tracing::info!(?backup, "dry-run: would restore system resolvers");
            return Ok(());
        }

        let result = match &backup {
            None => {
                tracing::warn!("no backup found, restoring to automatic");
                self.backend.restore_automatic(&interface).await
            }
            Some(b) => match &b.original_dns {
                OriginalDns::Dhcp => self.backend.restore_automatic(&interface).await,
                OriginalDns::Servers(v)
                    if v.is_empty() || v.iter().any(|ip| is_loopback(*ip)) =>
                {
                    self.backend.restore_automatic(&interface).await
                }
                OriginalDns::Servers(v) => self.backend.restore_static(&interface, v).await,
                OriginalDns::File(contents) => {
                    self.backend.restore_file(&interface, contents).await
                }
            },
        };

        match result {
            Ok(()) => {
                tracing::info!(%interface, "system DNS restored");
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "restore failed, falling back to automatic mode");
                self.backend
                    .restore_automatic(&interface)
                    .await
                    .map_err(|auto| SysDnsError::RestoreFailed {
                        detail: format!("{e}; automatic fallback also failed: {auto}"),
                    })
            }
        }
    }

    /// Startup integrity check.
    ///
    /// Detects the crash signature — resolvers pointing at loopback with
    /// nothing answering there — repairs it, and verifies external
    /// resolution works again. A failed repair is fatal: the daemon must
    /// refuse to start rather than leave the host without DNS.
    pub async fn integrity_check(&mut self) -> Result<(), SysDnsError> {
        let interface = self.interface().await?;
        let state = self.backend.read_resolvers(&interface).await?;
        if !state.is_poisoned() {
            return Ok(());
        }

        let probe_addr = SocketAddr::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            self.integrity_probe_port,
        );
        if probe_dns(probe_addr, self.probe_timeout).await {
            tracing::warn!(
                "resolvers point at loopback but something is answering DNS there; leaving as-is"
            );
            return Ok(());
        }

        tracing::warn!(
            "resolvers point at loopback with nothing answering; repairing before startup"
        );
        if self.dry_run {
            tracing::info!("dry-run: would restore resolvers and verify external resolution");
            return Ok(());
        }

        self.restore().await?;
        tokio::time::sleep(self.settle).await;

        if !self.backend.can_resolve_external().await {
            return Err(SysDnsError::IntegrityFailed);
        }
        tracing::info!("DNS integrity repaired");
        Ok(())
    }
}

/// Send a real `A google.com` query to `server` and wait for any response.
pub async fn probe_dns(server: SocketAddr, deadline: Duration) -> bool {
    let Ok(socket) = UdpSocket::bind("0.0.0.0:0").await else {
        return false;
    };
    let id = rand::random::<u16>();
    let packet = dns::build_query(id, PROBE_DOMAIN, dns::QTYPE_A);
    if socket.send_to(&packet, server).await.is_err() {
        return false;
    }

    let mut buf = [0u8; dns::MAX_PACKET_SIZE];
    match tokio::time::timeout(deadline, socket.recv_from(&mut buf)).await {
        Ok(Ok((len, _))) => len >= 12 && buf[0..2] == id.to_be_bytes(),
        _ => false,
    }
}

/// Whether the system resolver can currently resolve external names.
/// Backs the `--test-dns-resolution` command.
pub async fn test_resolution() -> bool {
    system_can_resolve(PROBE_TIMEOUT).await
}

/// Resolve an external name through the system resolver.
pub(crate) async fn system_can_resolve(deadline: Duration) -> bool {
    match tokio::time::timeout(deadline, tokio::net::lookup_host((PROBE_DOMAIN, 80))).await {
        Ok(Ok(mut addrs)) => addrs.next().is_some(),
        _ => false,
    }
}

/// Reject interface names that could smuggle arguments into the platform
/// reconfiguration commands.
pub fn validate_interface(name: &str) -> Result<(), SysDnsError> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(SysDnsError::InvalidInterface(name.to_string()))
    }
}
