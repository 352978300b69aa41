//! Relay engine: accept loop and per-connection byte copying.
//!
//! - **[`acceptor`]**: [`Acceptor`] binds the listen endpoint, runs the
//!   accept loop and dials the upstream for every inbound connection.
//! - **[`pair`]**: [`relay_pair`] copies bytes in both directions between
//!   the inbound and upstream streams of one connection.
//!
//! ```text
//! RelayController::start
//!   → Acceptor::start (bind, spawn accept loop)
//!     → accept → ConnectionTracker::try_acquire
//!       → spawn: dial upstream → relay_pair (a->b, b->a tasks)
//! RelayController::stop
//!   → RelaySession::shutdown (cancel, join accept loop, listener closed)
//! ```

pub mod acceptor;
pub mod pair;

pub use acceptor::{Acceptor, RelaySession};
pub use pair::{relay_pair, PairStats};
