//! The loopback DNS proxy.
//!
//! Binds a UDP socket on the loopback interface, classifies every incoming
//! query against the active blocklist snapshot, answers blocked queries
//! locally, and forwards the rest upstream. The listener never blocks on
//! upstream I/O; every forward runs as its own task with its own socket.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};

use crate::dns::{DnsQuery, MAX_PACKET_SIZE};
use crate::filter::{filter_query, BlocklistHandle};
use crate::stats::Stats;
use crate::upstream::Forwarder;

/// How long binding may take before proxy start is abandoned.
const BIND_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval of the listener self-check.
const HEALTH_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to bind UDP {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: io::Error,
    },

    #[error("binding the listener did not complete within {BIND_TIMEOUT:?}")]
    BindTimeout,
}

/// Events surfaced to the lifecycle manager.
#[derive(Debug)]
pub enum ProxyEvent {
    /// The listening socket is no longer bound.
    ListenerLost,
}

/// Proxy listener configuration.
#[derive(Clone)]
pub struct ProxyConfig {
    pub bind_ip: IpAddr,
    pub preferred_port: u16,
    pub fallback_port: u16,
    pub upstreams: Vec<SocketAddr>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            preferred_port: 53,
            fallback_port: 5353,
            upstreams: crate::upstream::default_upstreams(),
        }
    }
}

/// A running proxy. Dropping it does not stop the listener; call
/// [`Proxy::stop`].
pub struct Proxy {
    socket: Option<Arc<UdpSocket>>,
    port: u16,
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Proxy {
    /// Bind and start the proxy.
    ///
    /// Prefers the configured port (53 by default) and falls back once
    /// (5353) if that bind is refused. The whole attempt is bounded by a
    /// 5 second deadline; on expiry or failure the proxy does not start.
    pub async fn start(
        config: ProxyConfig,
        blocklist: Arc<BlocklistHandle>,
        stats: Arc<Stats>,
        events: mpsc::Sender<ProxyEvent>,
    ) -> Result<Self, ProxyError> {
        let socket = tokio::time::timeout(BIND_TIMEOUT, bind_with_fallback(&config))
            .await
            .map_err(|_| ProxyError::BindTimeout)??;
        let socket = Arc::new(socket);
        let port = socket
            .local_addr()
            .map_err(|source| ProxyError::Bind {
                addr: SocketAddr::new(config.bind_ip, config.preferred_port),
                source,
            })?
            .port();

        tracing::info!(%port, "dns proxy listening on {}", config.bind_ip);

        let forwarder = Forwarder::new(config.upstreams.clone());
        let (shutdown, shutdown_rx) = watch::channel(false);

        let listener = tokio::spawn(run_listener(
            socket.clone(),
            blocklist,
            forwarder,
            stats,
            shutdown_rx.clone(),
        ));
        let health = tokio::spawn(run_health_check(socket.clone(), events, shutdown_rx));

        Ok(Self {
            socket: Some(socket),
            port,
            shutdown,
            handles: vec![listener, health],
        })
    }

    /// The port actually bound, for the configurator to install.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stop the listener, cancel all in-flight forwards, and release the
    /// socket. Idempotent.
    pub async fn stop(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        let _ = self.shutdown.send(true);
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
        self.socket.take();
        tracing::info!("dns proxy stopped");
    }
}

async fn bind_with_fallback(config: &ProxyConfig) -> Result<UdpSocket, ProxyError> {
    let preferred = SocketAddr::new(config.bind_ip, config.preferred_port);
    match UdpSocket::bind(preferred).await {
        Ok(socket) => Ok(socket),
        Err(e) => {
            tracing::warn!(
                addr = %preferred,
                error = %e,
                "could not bind preferred port, falling back to {}",
                config.fallback_port
            );
            let fallback = SocketAddr::new(config.bind_ip, config.fallback_port);
            UdpSocket::bind(fallback)
                .await
                .map_err(|source| ProxyError::Bind {
                    addr: fallback,
                    source,
                })
        }
    }
}

async fn run_listener(
    socket: Arc<UdpSocket>,
    blocklist: Arc<BlocklistHandle>,
    forwarder: Forwarder,
    stats: Arc<Stats>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut forwards: JoinSet<()> = JoinSet::new();
    let mut buf = [0u8; MAX_PACKET_SIZE];

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,

            // Reap completed forwards so the set does not grow unbounded.
            Some(_) = forwards.join_next(), if !forwards.is_empty() => {}

            result = socket.recv_from(&mut buf) => {
                let (len, src) = match result {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!(error = %e, "udp recv error");
                        continue;
                    }
                };

                stats.record_query();
                let started = Instant::now();
                let packet = &buf[..len];

                let Some(query) = DnsQuery::parse(packet) else {
                    // Malformed packets are counted and dropped with no reply.
                    stats.record_error();
                    continue;
                };

                // Each query runs against the snapshot it captured; a reload
                // mid-flight does not affect it.
                let snapshot = blocklist.current();
                if let Some(response) = filter_query(&snapshot, &query, packet) {
                    stats.record_blocked();
                    let _ = socket.send_to(&response, src).await;
                    tracing::debug!(
                        domain = %query.domain,
                        qtype = query.qtype,
                        elapsed = ?started.elapsed(),
                        "blocked"
                    );
                    continue;
                }

                forwards.spawn(forward_one(
                    socket.clone(),
                    forwarder.clone(),
                    packet.to_vec(),
                    src,
                    query.domain,
                    stats.clone(),
                    started,
                ));
            }
        }
    }

    // Cancel every pending forward before the socket is released.
    forwards.abort_all();
    while forwards.join_next().await.is_some() {}
}

async fn forward_one(
    socket: Arc<UdpSocket>,
    forwarder: Forwarder,
    packet: Vec<u8>,
    client: SocketAddr,
    domain: String,
    stats: Arc<Stats>,
    started: Instant,
) {
    match forwarder.forward(&packet).await {
        Ok(reply) => {
            stats.record_allowed();
            let _ = socket.send_to(&reply, client).await;
            tracing::debug!(%domain, elapsed = ?started.elapsed(), "forwarded");
        }
        Err(e) => {
            // No reply; the client's resolver will retry on its own.
            stats.record_error();
            tracing::debug!(%domain, error = %e, "forward failed");
        }
    }
}

async fn run_health_check(
    socket: Arc<UdpSocket>,
    events: mpsc::Sender<ProxyEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(HEALTH_INTERVAL);
    interval.tick().await; // first tick fires immediately
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {
                if socket.local_addr().is_err() {
                    tracing::error!("dns proxy listener lost its binding");
                    let _ = events.send(ProxyEvent::ListenerLost).await;
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::Blocklist;

    fn test_handles() -> (Arc<BlocklistHandle>, Arc<Stats>, mpsc::Sender<ProxyEvent>) {
        let blocklist = Arc::new(BlocklistHandle::new(Blocklist::emergency()));
        let stats = Arc::new(Stats::new());
        let (events, _rx) = mpsc::channel(1);
        (blocklist, stats, events)
    }

    fn loopback_config(preferred: u16, fallback: u16) -> ProxyConfig {
        ProxyConfig {
            preferred_port: preferred,
            fallback_port: fallback,
            ..ProxyConfig::default()
        }
    }

    #[tokio::test]
    async fn falls_back_when_preferred_port_is_taken() {
        let blocker = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let taken = blocker.local_addr().unwrap().port();

        let (blocklist, stats, events) = test_handles();
        let mut proxy = Proxy::start(loopback_config(taken, 0), blocklist, stats, events)
            .await
            .unwrap();

        assert_ne!(proxy.port(), taken);
        assert_ne!(proxy.port(), 0);
        proxy.stop().await;
    }

    #[tokio::test]
    async fn start_fails_when_both_ports_taken() {
        let first = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let second = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let p1 = first.local_addr().unwrap().port();
        let p2 = second.local_addr().unwrap().port();

        let (blocklist, stats, events) = test_handles();
        let result = Proxy::start(loopback_config(p1, p2), blocklist, stats, events).await;

        assert!(matches!(result, Err(ProxyError::Bind { .. })));
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_releases_port() {
        let (blocklist, stats, events) = test_handles();
        let mut proxy = Proxy::start(loopback_config(0, 0), blocklist, stats, events)
            .await
            .unwrap();
        let port = proxy.port();

        proxy.stop().await;
        proxy.stop().await;

        // Port is free again.
        UdpSocket::bind(("127.0.0.1", port)).await.unwrap();
    }
}
