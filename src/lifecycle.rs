//! Daemon lifecycle.
//!
//! Owns the startup and shutdown ordering, single-instance enforcement,
//! signal handling, and the serialized blocking toggle. Startup failures
//! run the same shutdown path as signals so system DNS is restored even
//! from a failed init.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::control::{self, ControlState, ToggleRequest};
use crate::filter::{Blocklist, BlocklistHandle};
use crate::pidfile::{PidFile, PidFileError};
use crate::proxy::{Proxy, ProxyConfig, ProxyEvent};
use crate::signals::{Hangup, Terminate};
use crate::state::DaemonState;
use crate::stats::Stats;
use crate::sysdns::{Configurator, NativeBackend, SysDnsError};

/// Hard deadline for the whole shutdown sequence.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    AnotherInstance(PidFileError),

    #[error(transparent)]
    IntegrityFailed(SysDnsError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DaemonError {
    /// CLI exit code: 2 for a second instance, 3 for a failed integrity
    /// check, 1 for everything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::AnotherInstance(_) => 2,
            Self::IntegrityFailed(_) => 3,
            Self::Other(_) => 1,
        }
    }
}

pub struct DaemonConfig {
    pub blocklist_path: std::path::PathBuf,
    pub state_path: std::path::PathBuf,
    pub backup_path: std::path::PathBuf,
    pub pid_path: std::path::PathBuf,
    pub proxy: ProxyConfig,
    pub control_port: u16,
    pub interface: Option<String>,
    pub dry_run: bool,
    pub verify: bool,
    pub force: bool,
}

/// Run the daemon until a terminating signal or fatal error.
pub async fn run(config: DaemonConfig) -> Result<(), DaemonError> {
    // Single-instance first: a refused start must not touch anything,
    // including DNS.
    let pidfile = PidFile::acquire(config.pid_path.clone(), config.force).map_err(|e| match e {
        PidFileError::AnotherInstance { .. } => DaemonError::AnotherInstance(e),
        other => DaemonError::Other(anyhow::Error::new(other)),
    })?;

    let result = run_daemon(&config).await;

    // PID file removal is the last step of shutdown.
    pidfile.release();
    result
}

async fn run_daemon(config: &DaemonConfig) -> Result<(), DaemonError> {
    let mut configurator = Configurator::new(NativeBackend::new(), config.backup_path.clone())
        .with_interface(config.interface.clone())
        .map_err(|e| DaemonError::Other(anyhow::Error::new(e)))?
        .with_verify(config.verify)
        .with_dry_run(config.dry_run);

    // Repair any crash leftovers before reconfiguring anything ourselves.
    configurator.integrity_check().await.map_err(|e| match e {
        SysDnsError::IntegrityFailed => DaemonError::IntegrityFailed(e),
        other => DaemonError::Other(anyhow::Error::new(other)),
    })?;

    let blocklist = match Blocklist::load(&config.blocklist_path) {
        Ok(list) => list,
        Err(e) => {
            tracing::error!(
                error = %e,
                "blocklist unusable, falling back to the emergency list"
            );
            Blocklist::emergency()
        }
    };
    let blocklist = Arc::new(BlocklistHandle::new(blocklist));
    let stats = Arc::new(Stats::new());

    let state = DaemonState::load(&config.state_path).unwrap_or_else(|| DaemonState::new(true));
    let is_blocking = Arc::new(AtomicBool::new(state.is_blocking));
    tracing::info!(is_blocking = state.is_blocking, "restored daemon state");

    // The proxy always runs; when blocking is disabled it sits idle on
    // loopback, so toggles never have to re-bind port 53.
    let (proxy_events_tx, mut proxy_events) = mpsc::channel(4);
    let mut proxy = Proxy::start(
        config.proxy.clone(),
        blocklist.clone(),
        stats.clone(),
        proxy_events_tx,
    )
    .await
    .context("failed to start the dns proxy")?;

    // Tracks whether system DNS currently points at us and needs restoring.
    let mut dns_modified = false;

    if state.is_blocking {
        match configurator.configure(proxy.port()).await {
            Ok(()) => dns_modified = true,
            Err(e) => {
                proxy.stop().await;
                return Err(DaemonError::Other(
                    anyhow::Error::new(e).context("failed to apply blocking at startup"),
                ));
            }
        }
    }

    let (toggle_tx, mut toggle_rx) = mpsc::channel::<ToggleRequest>(4);
    let control_state = ControlState {
        stats: stats.clone(),
        blocklist: blocklist.clone(),
        is_blocking: is_blocking.clone(),
        blocking_method: "dns-proxy",
        toggle_tx,
    };
    let control_listener =
        match TcpListener::bind((Ipv4Addr::LOCALHOST, config.control_port)).await {
            Ok(listener) => listener,
            Err(e) => {
                // Failed init still restores DNS.
                proxy.stop().await;
                if dns_modified {
                    let _ = configurator.restore().await;
                }
                return Err(DaemonError::Other(anyhow::Error::new(e).context(format!(
                    "failed to bind control interface on 127.0.0.1:{}",
                    config.control_port
                ))));
            }
        };
    tracing::info!(port = config.control_port, "control interface listening");
    let control_task = tokio::spawn(control::serve(control_listener, control_state));

    let mut terminate = Terminate::new().context("failed to install signal handlers")?;
    let mut hangup = Hangup::new().context("failed to install signal handlers")?;

    let run_result: anyhow::Result<()> = loop {
        tokio::select! {
            _ = terminate.recv() => {
                tracing::info!("caught terminating signal");
                break Ok(());
            }

            _ = hangup.recv() => {
                match Blocklist::load(&config.blocklist_path) {
                    Ok(list) => {
                        let count = list.len();
                        blocklist.swap(list);
                        tracing::info!(domains = count, "blocklist reloaded");
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "reload failed, keeping current blocklist");
                    }
                }
            }

            Some(event) = proxy_events.recv() => match event {
                ProxyEvent::ListenerLost => {
                    break Err(anyhow::anyhow!("dns proxy lost its listening socket"));
                }
            },

            // Toggles are serialized by this single consumer; concurrent
            // requests queue on the channel.
            Some(request) = toggle_rx.recv() => {
                let target = !is_blocking.load(Ordering::Relaxed);
                let outcome = if target {
                    configurator.configure(proxy.port()).await.map(|()| {
                        dns_modified = true;
                    })
                } else {
                    configurator.restore().await.map(|()| {
                        dns_modified = false;
                    })
                };
                let reply = match outcome {
                    Ok(()) => {
                        is_blocking.store(target, Ordering::Relaxed);
                        if let Err(e) = DaemonState::new(target).store(&config.state_path) {
                            tracing::warn!(error = %e, "could not persist daemon state");
                        }
                        tracing::info!(is_blocking = target, "toggled");
                        Ok(target)
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "toggle failed, state unchanged");
                        Err(e.to_string())
                    }
                };
                let _ = request.reply.send(reply);
            }
        }
    };

    // Ordered shutdown: persist state, stop control, stop proxy, restore
    // DNS. Bounded by one overall deadline; a hang force-exits after the
    // restore attempt rather than leaving the host pointed at a dead proxy.
    let shutdown = async {
        if let Err(e) = DaemonState::new(is_blocking.load(Ordering::Relaxed))
            .store(&config.state_path)
        {
            tracing::warn!(error = %e, "could not persist daemon state");
        }

        control_task.abort();
        proxy.stop().await;

        if dns_modified {
            if let Err(e) = configurator.restore().await {
                tracing::error!(error = %e, "DNS restore failed during shutdown");
            }
        }
    };

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, shutdown).await.is_err() {
        tracing::error!("shutdown did not finish within {SHUTDOWN_TIMEOUT:?}, forcing exit");
        std::process::exit(1);
    }

    let snapshot = stats.snapshot();
    tracing::info!(
        queries = snapshot.queries,
        blocked = snapshot.blocked,
        allowed = snapshot.allowed,
        errors = snapshot.errors,
        "daemon stopped"
    );

    run_result.map_err(DaemonError::Other)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_cli_contract() {
        let another = DaemonError::AnotherInstance(PidFileError::AnotherInstance { pid: 42 });
        assert_eq!(another.exit_code(), 2);

        let integrity = DaemonError::IntegrityFailed(SysDnsError::IntegrityFailed);
        assert_eq!(integrity.exit_code(), 3);

        let generic = DaemonError::Other(anyhow::anyhow!("boom"));
        assert_eq!(generic.exit_code(), 1);
    }
}
