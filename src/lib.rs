//! Waylay - a system-wide DNS content blocker.
//!
//! A loopback DNS proxy answers blocked names with a sinkhole and forwards
//! everything else upstream; a system DNS configurator points the host's
//! resolvers at the proxy and guarantees restoration; the lifecycle module
//! coordinates the two with crash-safe persisted state.

pub mod control;
pub mod dns;
pub mod filter;
pub mod lifecycle;
pub mod paths;
pub mod pidfile;
pub mod proxy;
pub mod signals;
pub mod state;
pub mod stats;
pub mod sysdns;
pub mod upstream;
