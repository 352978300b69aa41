//! lanfwd: expose a loopback-only TCP service on the LAN.
//!
//! Accepts connections on every interface and relays them byte-for-byte to
//! `127.0.0.1` (same port by default). `serve` runs a fixed forwarder until
//! interrupted; `console` lets an operator start and stop it at runtime.

mod commands;
mod config;

use clap::{Parser, Subcommand};
use config::{ConfigFile, Overrides};
use std::path::PathBuf;
use tracing::error;
use tracing_subscriber::EnvFilter;

/// lanfwd: transparent TCP forwarder
#[derive(Parser, Debug)]
#[command(name = "lanfwd", version, about = "Transparent TCP forwarder: LAN port -> loopback service")]
struct Cli {
    /// Config file path (default: ~/.lanfwd/config.toml)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(flatten)]
    relay: RelayArgs,

    #[command(subcommand)]
    command: Option<Command>,
}

/// Relay settings shared by every subcommand.
#[derive(clap::Args, Debug)]
struct RelayArgs {
    /// Port to listen on
    #[arg(short, long, global = true, value_parser = parse_port_arg)]
    port: Option<u16>,

    /// Interface to bind
    #[arg(long, global = true)]
    bind: Option<String>,

    /// Host to forward to
    #[arg(long, global = true)]
    upstream_host: Option<String>,

    /// Port to forward to (default: same as --port)
    #[arg(long, global = true, value_parser = parse_port_arg)]
    upstream_port: Option<u16>,

    /// Maximum concurrent connections
    #[arg(long, global = true)]
    max_connections: Option<usize>,

    /// Close connections idle for this many seconds (0 = never)
    #[arg(long, global = true)]
    idle_timeout: Option<u64>,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// Forward the configured port until interrupted (default)
    Serve,
    /// Interactive start/stop control from stdin
    Console,
    /// Print the resolved configuration as TOML
    Config,
}

fn parse_port_arg(s: &str) -> Result<u16, String> {
    lanfwd_core::parse_port(s).map_err(|e| e.to_string())
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            port: self.relay.port,
            bind: self.relay.bind.clone(),
            upstream_host: self.relay.upstream_host.clone(),
            upstream_port: self.relay.upstream_port,
            max_connections: self.relay.max_connections,
            idle_timeout_secs: self.relay.idle_timeout,
            log_level: self.log_level.clone(),
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(config::default_path);
    let cfg = match ConfigFile::load(&config_path) {
        Ok(cfg) => cfg.apply(&cli.overrides()),
        Err(e) => {
            eprintln!("lanfwd: {e:#}");
            std::process::exit(1);
        }
    };

    // Initialize tracing. Logs go to stderr so console output stays clean.
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log.level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => commands::serve::run(&cfg).await,
        Command::Console => commands::console::run(&cfg).await,
        Command::Config => cfg.to_toml().map(|text| print!("{text}")),
    };

    if let Err(e) = result {
        error!("{:#}", e);
        eprintln!("lanfwd: {e:#}");
        std::process::exit(1);
    }
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
pub(crate) async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
