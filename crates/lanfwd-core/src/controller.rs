//! Start/stop control over a relay session.
//!
//! The [`RelayController`] owns at most one [`RelaySession`]. Start, stop and
//! toggle take one async mutex for their whole transition, so concurrent
//! calls are serialized and a port is never bound twice. The coarse state
//! (`Stopped → Starting → Running → Stopping → Stopped`) is published on a
//! `watch` channel so it can be read without waiting for a transition.

use crate::endpoint::{
    parse_port, validate_port, ListenEndpoint, UpstreamEndpoint, DEFAULT_UPSTREAM_HOST,
};
use crate::error::{FwdError, FwdResult};
use crate::limits::{ConnectionTracker, RelayLimits};
use crate::notify::{RelayEvent, RelayNotifier};
use crate::relay::{Acceptor, RelaySession};
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info};

/// Lifecycle state of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Where to listen and where to forward, independent of the port chosen at
/// start time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Interface to bind (default: all IPv4 interfaces).
    pub bind_host: IpAddr,
    /// Host every connection is forwarded to (default: loopback).
    pub upstream_host: String,
    /// Upstream port; `None` forwards to the same port the relay listens on.
    pub upstream_port: Option<u16>,
    pub limits: RelayLimits,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            upstream_host: DEFAULT_UPSTREAM_HOST.to_string(),
            upstream_port: None,
            limits: RelayLimits::default(),
        }
    }
}

/// Point-in-time view of the controller for a control surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayStatus {
    pub state: RelayState,
    pub listen: Option<String>,
    pub upstream: Option<String>,
    /// Live connection pairs, including pairs still draining after a stop.
    pub active_connections: usize,
}

struct ControllerInner {
    session: Option<RelaySession>,
    /// Trackers of stopped sessions that still have live pairs.
    drained: Vec<ConnectionTracker>,
}

/// Serialized start/stop control over one relay session.
pub struct RelayController {
    config: RelayConfig,
    notifier: RelayNotifier,
    inner: Mutex<ControllerInner>,
    state_tx: watch::Sender<RelayState>,
}

impl RelayController {
    pub fn new(config: RelayConfig, notifier: RelayNotifier) -> Self {
        let (state_tx, _) = watch::channel(RelayState::Stopped);
        Self {
            config,
            notifier,
            inner: Mutex::new(ControllerInner {
                session: None,
                drained: Vec::new(),
            }),
            state_tx,
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Current state. Never waits for an in-progress transition.
    pub fn state(&self) -> RelayState {
        *self.state_tx.borrow()
    }

    /// Receive every state change from now on.
    pub fn subscribe_state(&self) -> watch::Receiver<RelayState> {
        self.state_tx.subscribe()
    }

    /// Start relaying on the port given as operator text.
    ///
    /// Returns the bound address.
    ///
    /// # Errors
    ///
    /// - [`FwdError::InvalidPort`] if `port` is not a number in `1..=65535`
    ///   (nothing is bound).
    /// - [`FwdError::AlreadyRunning`] if a session is live.
    /// - [`FwdError::Bind`] if the listener cannot be bound; the controller
    ///   stays stopped.
    pub async fn start(&self, port: &str) -> FwdResult<SocketAddr> {
        let port = parse_port(port)?;
        self.start_port(port).await
    }

    /// Numeric form of [`RelayController::start`].
    pub async fn start_port(&self, port: u16) -> FwdResult<SocketAddr> {
        let port = validate_port(port)?;
        let mut inner = self.inner.lock().await;
        self.start_locked(&mut inner, port).await
    }

    /// Stop relaying and wait for the accept loop to exit.
    ///
    /// Idempotent: when nothing is running this only re-emits the stopped
    /// notification. Established connection pairs are not interrupted.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        self.stop_locked(&mut inner).await;
    }

    /// Stop when running, otherwise start on `port`. Returns the new state.
    ///
    /// `port` is only parsed when starting.
    pub async fn toggle(&self, port: &str) -> FwdResult<RelayState> {
        let mut inner = self.inner.lock().await;
        if inner.session.is_some() {
            self.stop_locked(&mut inner).await;
        } else {
            let port = parse_port(port)?;
            self.start_locked(&mut inner, port).await?;
        }
        Ok(self.state())
    }

    pub async fn status(&self) -> RelayStatus {
        let mut inner = self.inner.lock().await;
        inner.drained.retain(|tracker| tracker.active() > 0);
        let draining: usize = inner.drained.iter().map(ConnectionTracker::active).sum();
        match &inner.session {
            Some(session) => RelayStatus {
                state: self.state(),
                listen: Some(session.local_addr().to_string()),
                upstream: Some(session.upstream().to_string()),
                active_connections: session.active_connections() + draining,
            },
            None => RelayStatus {
                state: self.state(),
                listen: None,
                upstream: None,
                active_connections: draining,
            },
        }
    }

    async fn start_locked(&self, inner: &mut ControllerInner, port: u16) -> FwdResult<SocketAddr> {
        if let Some(session) = &inner.session {
            debug!(port, running = session.listen().port, "start rejected, already running");
            return Err(FwdError::AlreadyRunning(session.listen().port));
        }

        let listen = ListenEndpoint::new(self.config.bind_host, port)?;
        let upstream = UpstreamEndpoint::new(
            self.config.upstream_host.clone(),
            self.config.upstream_port.unwrap_or(port),
        )?;

        self.state_tx.send_replace(RelayState::Starting);
        let session = match Acceptor::start(
            listen,
            upstream,
            self.config.limits.clone(),
            self.notifier.clone(),
        )
        .await
        {
            Ok(session) => session,
            Err(e) => {
                self.state_tx.send_replace(RelayState::Stopped);
                return Err(e);
            }
        };

        let addr = session.local_addr();
        inner.session = Some(session);
        self.state_tx.send_replace(RelayState::Running);
        info!(port, listen = %addr, "relay running");
        self.notifier.notify(RelayEvent::Listening { port });
        Ok(addr)
    }

    async fn stop_locked(&self, inner: &mut ControllerInner) {
        match inner.session.take() {
            Some(session) => {
                self.state_tx.send_replace(RelayState::Stopping);
                let port = session.listen().port;
                let tracker = session.shutdown().await;
                info!(port, draining = tracker.active(), "relay stopped");
                inner.drained.retain(|t| t.active() > 0);
                inner.drained.push(tracker);
            }
            None => debug!("stop requested while not running"),
        }
        self.state_tx.send_replace(RelayState::Stopped);
        self.notifier.notify(RelayEvent::Stopped);
    }
}
