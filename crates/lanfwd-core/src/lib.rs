//! lanfwd-core: transparent TCP relay engine.
//!
//! Accepts connections on a listen endpoint and forwards every byte, in
//! both directions, to a fixed upstream endpoint. Provides port/endpoint
//! validation, the accept loop, the bidirectional pair relay, and a
//! start/stop controller with status notifications.

pub mod controller;
pub mod endpoint;
pub mod error;
pub mod limits;
pub mod notify;
pub mod relay;

#[cfg(test)]
mod test_support;

// Re-export commonly used items at crate root.
pub use controller::{RelayConfig, RelayController, RelayState, RelayStatus};
pub use endpoint::{parse_port, ListenEndpoint, UpstreamEndpoint, DEFAULT_PORT, DEFAULT_UPSTREAM_HOST};
pub use error::{FwdError, FwdResult};
pub use limits::RelayLimits;
pub use notify::{RelayEvent, RelayNotifier};
