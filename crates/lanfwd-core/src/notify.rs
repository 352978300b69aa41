//! Status notifications for the control surface.
//!
//! The relay reports coarse, human-readable status through an unbounded
//! `mpsc` channel. Sending never blocks the accept loop, and a control
//! surface that has gone away is simply ignored.

use std::fmt;
use std::net::SocketAddr;
use tokio::sync::mpsc;

/// A status change or per-connection problem worth showing an operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// The listener is bound and accepting.
    Listening { port: u16 },
    /// One `accept` call failed while running; the loop continues.
    AcceptError(String),
    /// Dialing the upstream for one inbound connection failed.
    ConnectionError(String),
    /// An inbound connection was closed because the connection cap was hit.
    ConnectionRefused { peer: SocketAddr, limit: usize },
    /// A connection pair is now relaying.
    ConnectionOpened { id: u64, peer: SocketAddr },
    /// A connection pair finished.
    ConnectionClosed {
        id: u64,
        bytes_up: u64,
        bytes_down: u64,
    },
    /// The relay is stopped (also sent when stop was a no-op).
    Stopped,
}

impl fmt::Display for RelayEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayEvent::Listening { port } => write!(f, "Listening on port {port}..."),
            RelayEvent::AcceptError(e) => write!(f, "Accept error: {e}"),
            RelayEvent::ConnectionError(e) => write!(f, "Connection error: {e}"),
            RelayEvent::ConnectionRefused { peer, limit } => {
                write!(f, "Connection from {peer} refused: limit of {limit} reached")
            }
            RelayEvent::ConnectionOpened { id, peer } => {
                write!(f, "Connection #{id} from {peer} opened")
            }
            RelayEvent::ConnectionClosed {
                id,
                bytes_up,
                bytes_down,
            } => write!(
                f,
                "Connection #{id} closed ({bytes_up} bytes up, {bytes_down} bytes down)"
            ),
            RelayEvent::Stopped => f.write_str("Proxy stopped."),
        }
    }
}

/// Cloneable handle used by every relay task to publish [`RelayEvent`]s.
#[derive(Debug, Clone, Default)]
pub struct RelayNotifier {
    tx: Option<mpsc::UnboundedSender<RelayEvent>>,
}

impl RelayNotifier {
    /// Create a notifier and the receiver the control surface reads from.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RelayEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A notifier that drops every event (logging still happens at the
    /// call sites).
    pub fn silent() -> Self {
        Self::default()
    }

    pub fn notify(&self, event: RelayEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}
