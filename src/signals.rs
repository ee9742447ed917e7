//! Signal handling.
//!
//! `Terminate` resolves on whatever the platform uses to stop a service;
//! `Hangup` drives blocklist reload and never fires on Windows.

pub use platform::{Hangup, Terminate};

#[cfg(unix)]
mod platform {
    use tokio::signal::unix::{signal, Signal, SignalKind};

    pub struct Terminate {
        sigint: Signal,
        sigterm: Signal,
    }

    impl Terminate {
        pub fn new() -> std::io::Result<Self> {
            Ok(Self {
                sigint: signal(SignalKind::interrupt())?,
                sigterm: signal(SignalKind::terminate())?,
            })
        }

        /// Waits for SIGINT or SIGTERM.
        pub async fn recv(&mut self) {
            tokio::select! {
                _ = self.sigint.recv() => {}
                _ = self.sigterm.recv() => {}
            }
        }
    }

    pub struct Hangup {
        sighup: Signal,
    }

    impl Hangup {
        pub fn new() -> std::io::Result<Self> {
            Ok(Self {
                sighup: signal(SignalKind::hangup())?,
            })
        }

        /// Waits for SIGHUP.
        pub async fn recv(&mut self) {
            self.sighup.recv().await;
        }
    }
}

#[cfg(windows)]
mod platform {
    use tokio::signal::windows::{ctrl_break, ctrl_c, CtrlBreak, CtrlC};

    pub struct Terminate {
        ctrl_c: CtrlC,
        ctrl_break: CtrlBreak,
    }

    impl Terminate {
        pub fn new() -> std::io::Result<Self> {
            Ok(Self {
                ctrl_c: ctrl_c()?,
                ctrl_break: ctrl_break()?,
            })
        }

        pub async fn recv(&mut self) {
            tokio::select! {
                _ = self.ctrl_c.recv() => {}
                _ = self.ctrl_break.recv() => {}
            }
        }
    }

    /// There is no SIGHUP equivalent; reload is unavailable on Windows.
    pub struct Hangup;

    impl Hangup {
        pub fn new() -> std::io::Result<Self> {
            Ok(Self)
        }

        pub async fn recv(&mut self) {
            std::future::pending::<()>().await;
        }
    }
}
