//! `lanfwd serve`: fixed-port forwarder.
//!
//! Starts immediately; failing to bind ends the process. Runs until SIGINT
//! or SIGTERM, then stops the relay.

use crate::config::ConfigFile;
use anyhow::{Context, Result};
use lanfwd_core::{RelayController, RelayNotifier};
use tracing::info;

pub async fn run(cfg: &ConfigFile) -> Result<()> {
    let (port, relay_config) = cfg.relay_config()?;
    // Status events are already logged by the engine; nothing else reads them.
    let controller = RelayController::new(relay_config, RelayNotifier::silent());

    controller
        .start_port(port)
        .await
        .with_context(|| format!("cannot forward port {port}"))?;

    let status = controller.status().await;
    let limits = &controller.config().limits;
    info!(
        listen = status.listen.as_deref().unwrap_or_default(),
        upstream = status.upstream.as_deref().unwrap_or_default(),
        max_connections = ?limits.max_connections,
        idle_timeout = ?limits.idle_timeout,
        "forwarding, press Ctrl+C to stop"
    );

    crate::shutdown_signal().await;
    info!("received shutdown signal");

    controller.stop().await;
    info!(
        draining = controller.status().await.active_connections,
        "lanfwd stopped"
    );
    Ok(())
}
