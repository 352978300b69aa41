//! Forwarder configuration at `~/.lanfwd/config.toml`.
//!
//! Every field has a default, so a missing file (or a file with only some
//! keys) is fine. CLI flags always override config file values.

use anyhow::{bail, Context, Result};
use lanfwd_core::{endpoint::validate_port, RelayConfig, RelayLimits, DEFAULT_PORT, DEFAULT_UPSTREAM_HOST};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub relay: RelaySection,
    #[serde(default)]
    pub log: LogSection,
}

/// `[relay]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySection {
    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Interface to bind.
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Host to forward to.
    #[serde(default = "default_upstream_host")]
    pub upstream_host: String,
    /// Port to forward to (unset = same as `port`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_port: Option<u16>,
    /// Cap on concurrently relayed connections (unset = unlimited).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<usize>,
    /// Close a connection after this many idle seconds (unset or 0 = never).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_secs: Option<u64>,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
            upstream_host: default_upstream_host(),
            upstream_port: None,
            max_connections: None,
            idle_timeout_secs: None,
        }
    }
}

/// `[log]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSection {
    /// Default filter when `RUST_LOG` is unset.
    #[serde(default = "default_level")]
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_upstream_host() -> String {
    DEFAULT_UPSTREAM_HOST.to_string()
}
fn default_level() -> String {
    "info".to_string()
}

/// Values given on the command line; `None` keeps the file value.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub port: Option<u16>,
    pub bind: Option<String>,
    pub upstream_host: Option<String>,
    pub upstream_port: Option<u16>,
    pub max_connections: Option<usize>,
    pub idle_timeout_secs: Option<u64>,
    pub log_level: Option<String>,
}

impl ConfigFile {
    /// Load configuration from a TOML file, returning defaults if the file
    /// does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        let path = expand_tilde(path);
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let config: ConfigFile = toml::from_str(&content)
            .with_context(|| format!("failed to parse config at {}", path.display()))?;

        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// Merge CLI overrides on top of the file values.
    pub fn apply(mut self, overrides: &Overrides) -> Self {
        let relay = &mut self.relay;
        if let Some(port) = overrides.port {
            relay.port = port;
        }
        if let Some(bind) = &overrides.bind {
            relay.bind = bind.clone();
        }
        if let Some(host) = &overrides.upstream_host {
            relay.upstream_host = host.clone();
        }
        if overrides.upstream_port.is_some() {
            relay.upstream_port = overrides.upstream_port;
        }
        if overrides.max_connections.is_some() {
            relay.max_connections = overrides.max_connections;
        }
        if overrides.idle_timeout_secs.is_some() {
            relay.idle_timeout_secs = overrides.idle_timeout_secs;
        }
        if let Some(level) = &overrides.log_level {
            self.log.level = level.clone();
        }
        self
    }

    /// Validate the `[relay]` section and turn it into the listen port plus
    /// the engine configuration.
    pub fn relay_config(&self) -> Result<(u16, RelayConfig)> {
        let relay = &self.relay;
        let port = validate_port(relay.port).context("relay.port")?;
        if let Some(upstream_port) = relay.upstream_port {
            validate_port(upstream_port).context("relay.upstream_port")?;
        }
        let bind_host: IpAddr = relay
            .bind
            .parse()
            .with_context(|| format!("relay.bind '{}' is not an IP address", relay.bind))?;
        if relay.upstream_host.trim().is_empty() {
            bail!("relay.upstream_host is empty");
        }
        if relay.max_connections == Some(0) {
            bail!("relay.max_connections must be at least 1");
        }

        let limits = RelayLimits {
            max_connections: relay.max_connections,
            idle_timeout: relay
                .idle_timeout_secs
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
        };

        Ok((
            port,
            RelayConfig {
                bind_host,
                upstream_host: relay.upstream_host.clone(),
                upstream_port: relay.upstream_port,
                limits,
            },
        ))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to serialize config")
    }
}

/// `~/.lanfwd/config.toml`
pub fn default_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_default()
        .join(".lanfwd")
        .join("config.toml")
}

/// Expand a leading `~/` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
