//! Upstream DNS forwarding.
//!
//! Each forwarded query gets its own ephemeral UDP socket, which makes
//! transaction-id collisions between concurrent clients impossible: the
//! upstream can only reply on the socket that sent the query.

use std::net::SocketAddr;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::dns::MAX_PACKET_SIZE;

/// Deadline for an upstream to answer before the query is dropped.
pub const FORWARD_TIMEOUT: Duration = Duration::from_secs(5);

/// Default public resolvers.
pub fn default_upstreams() -> Vec<SocketAddr> {
    vec![
        SocketAddr::from(([8, 8, 8, 8], 53)),
        SocketAddr::from(([8, 8, 4, 4], 53)),
    ]
}

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("upstream {0} did not answer within {FORWARD_TIMEOUT:?}")]
    Timeout(SocketAddr),

    #[error("upstream I/O error via {addr}: {source}")]
    Io {
        addr: SocketAddr,
        source: std::io::Error,
    },
}

/// Forwards queries to a fixed set of upstream resolvers.
#[derive(Clone)]
pub struct Forwarder {
    upstreams: Vec<SocketAddr>,
    deadline: Duration,
}

impl Forwarder {
    pub fn new(upstreams: Vec<SocketAddr>) -> Self {
        let upstreams = if upstreams.is_empty() {
            default_upstreams()
        } else {
            upstreams
        };
        Self {
            upstreams,
            deadline: FORWARD_TIMEOUT,
        }
    }

    #[cfg(test)]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Send the original query bytes to a randomly chosen upstream and wait
    /// for the first reply, returned verbatim.
    pub async fn forward(&self, packet: &[u8]) -> Result<Vec<u8>, ForwardError> {
        let upstream = self.pick();
        let io = |source| ForwardError::Io {
            addr: upstream,
            source,
        };

        let socket = UdpSocket::bind("0.0.0.0:0").await.map_err(io)?;
        socket.send_to(packet, upstream).await.map_err(io)?;

        let mut buf = [0u8; MAX_PACKET_SIZE];
        let (len, _) = timeout(self.deadline, socket.recv_from(&mut buf))
            .await
            .map_err(|_| ForwardError::Timeout(upstream))?
            .map_err(io)?;

        Ok(buf[..len].to_vec())
    }

    fn pick(&self) -> SocketAddr {
        let idx = rand::thread_rng().gen_range(0..self.upstreams.len());
        self.upstreams[idx]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn relays_upstream_reply_verbatim() {
        let fake = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = fake.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; MAX_PACKET_SIZE];
            let (len, src) = fake.recv_from(&mut buf).await.unwrap();
            // Echo with a marker byte appended.
            let mut reply = buf[..len].to_vec();
            reply.push(0xEE);
            fake.send_to(&reply, src).await.unwrap();
        });

        let forwarder = Forwarder::new(vec![upstream_addr]);
        let reply = forwarder.forward(&[0x12, 0x34, 0, 0]).await.unwrap();

        assert_eq!(reply, vec![0x12, 0x34, 0, 0, 0xEE]);
    }

    #[tokio::test]
    async fn times_out_on_silent_upstream() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = silent.local_addr().unwrap();
        // Keep the socket alive but never answer.
        tokio::spawn(async move {
            let mut buf = [0u8; MAX_PACKET_SIZE];
            loop {
                let _ = silent.recv_from(&mut buf).await;
            }
        });

        let forwarder =
            Forwarder::new(vec![upstream_addr]).with_deadline(Duration::from_millis(100));
        let result = forwarder.forward(&[0u8; 12]).await;

        assert!(matches!(result, Err(ForwardError::Timeout(_))));
    }

    #[test]
    fn empty_upstream_list_falls_back_to_defaults() {
        let forwarder = Forwarder::new(vec![]);
        assert_eq!(forwarder.upstreams, default_upstreams());
    }
}
