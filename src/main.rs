//! Waylay - a system-wide DNS content blocker.
//!
//! Runs as a resident daemon that filters every DNS query on the host, or
//! as a one-shot CLI talking to a running daemon's control interface.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use waylay::lifecycle::{self, DaemonConfig};
use waylay::paths;
use waylay::proxy::ProxyConfig;
use waylay::state::DaemonState;
use waylay::sysdns::{Configurator, NativeBackend};

#[derive(Parser)]
#[command(name = "waylay")]
#[command(about = "System-wide DNS content blocker", version)]
struct Args {
    /// Path to the JSON blocklist (array of domain strings)
    #[arg(long, default_value_os_t = paths::default_blocklist_path())]
    blocklist_path: PathBuf,

    /// Preferred DNS listening port (falls back to 5353 if unavailable)
    #[arg(long, default_value_t = 53)]
    port: u16,

    /// Upstream DNS servers for forwarded queries
    #[arg(long = "upstream", default_values_t = [
        SocketAddr::from(([8, 8, 8, 8], 53)),
        SocketAddr::from(([8, 8, 4, 4], 53)),
    ])]
    upstreams: Vec<SocketAddr>,

    /// Control interface port on 127.0.0.1
    #[arg(long, default_value_t = 5380)]
    control_port: u16,

    /// Network interface to manage (auto-detected by default)
    #[arg(long)]
    interface: Option<String>,

    /// Log every OS mutation without performing it
    #[arg(long)]
    dry_run: bool,

    /// Skip the post-configure resolver verification
    #[arg(long)]
    no_verify: bool,

    /// Start even if a live PID file is present
    #[arg(long)]
    force: bool,

    /// Print the running daemon's status and exit
    #[arg(long)]
    status: bool,

    /// Turn blocking on via the running daemon and exit
    #[arg(long, conflicts_with = "disable")]
    enable: bool,

    /// Turn blocking off via the running daemon and exit
    #[arg(long)]
    disable: bool,

    /// Restore system DNS from the backup and exit
    #[arg(long)]
    force_restore_dns: bool,

    /// Check that external DNS resolution works and exit
    #[arg(long)]
    test_dns_resolution: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to build runtime: {e}");
            std::process::exit(1);
        }
    };

    let code = runtime.block_on(dispatch(args));
    std::process::exit(code);
}

async fn dispatch(args: Args) -> i32 {
    if args.status {
        return cmd_status(args.control_port).await;
    }
    if args.enable || args.disable {
        return cmd_toggle(args.control_port, args.enable).await;
    }
    if args.force_restore_dns {
        return cmd_force_restore(&args).await;
    }
    if args.test_dns_resolution {
        return cmd_test_resolution().await;
    }

    let config = DaemonConfig {
        blocklist_path: args.blocklist_path,
        state_path: paths::state_path(),
        backup_path: paths::backup_path(),
        pid_path: paths::pid_path(),
        proxy: ProxyConfig {
            preferred_port: args.port,
            upstreams: args.upstreams,
            ..ProxyConfig::default()
        },
        control_port: args.control_port,
        interface: args.interface,
        dry_run: args.dry_run,
        verify: !args.no_verify,
        force: args.force,
    };

    match lifecycle::run(config).await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("{e:#}");
            e.exit_code()
        }
    }
}

async fn cmd_status(control_port: u16) -> i32 {
    match control_get(control_port, "/status").await {
        Ok(status) => {
            println!(
                "{}",
                serde_json::to_string_pretty(&status).expect("status is valid JSON")
            );
            0
        }
        Err(_) => {
            // No daemon answering; fall back to the persisted state.
            match DaemonState::load(&paths::state_path()) {
                Some(state) => {
                    println!(
                        "daemon is not running (last persisted state: isBlocking={})",
                        state.is_blocking
                    );
                }
                None => println!("daemon is not running"),
            }
            0
        }
    }
}

async fn cmd_toggle(control_port: u16, enable: bool) -> i32 {
    let desired = if enable { "enabled" } else { "disabled" };

    let status = match control_get(control_port, "/status").await {
        Ok(status) => status,
        Err(e) => {
            eprintln!("daemon is not running: {e:#}");
            return 1;
        }
    };

    if status["isBlocking"].as_bool() == Some(enable) {
        println!("blocking is already {desired}");
        return 0;
    }

    match control_post(control_port, "/toggle").await {
        Ok(reply) if reply["isBlocking"].as_bool() == Some(enable) => {
            println!("blocking {desired}");
            0
        }
        Ok(reply) => {
            eprintln!("unexpected toggle reply: {reply}");
            1
        }
        Err(e) => {
            eprintln!("toggle failed: {e:#}");
            1
        }
    }
}

async fn cmd_force_restore(args: &Args) -> i32 {
    let configurator = Configurator::new(NativeBackend::new(), paths::backup_path())
        .with_interface(args.interface.clone());
    let mut configurator = match configurator {
        Ok(c) => c.with_verify(false).with_dry_run(args.dry_run),
        Err(e) => {
            eprintln!("{e}");
            return 1;
        }
    };

    match configurator.restore().await {
        Ok(()) => {
            println!("system DNS restored");
            0
        }
        Err(e) => {
            eprintln!("restore failed: {e}");
            1
        }
    }
}

async fn cmd_test_resolution() -> i32 {
    if waylay::sysdns::test_resolution().await {
        println!("external DNS resolution works");
        0
    } else {
        eprintln!("external DNS resolution failed");
        1
    }
}

async fn control_get(port: u16, path: &str) -> anyhow::Result<serde_json::Value> {
    let url = format!("http://127.0.0.1:{port}{path}");
    let response = reqwest::Client::new()
        .get(&url)
        .send()
        .await?
        .error_for_status()?;
    Ok(response.json().await?)
}

async fn control_post(port: u16, path: &str) -> anyhow::Result<serde_json::Value> {
    let url = format!("http://127.0.0.1:{port}{path}");
    let response = reqwest::Client::new()
        .post(&url)
        .send()
        .await?
        .error_for_status()?;
    Ok(response.json().await?)
}
