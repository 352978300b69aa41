use thiserror::Error;

/// Errors produced by the relay engine.
///
/// Only the start-time variants (`InvalidPort`, `Bind`, `AlreadyRunning`)
/// are ever returned to a caller. `Accept` and `Dial` describe
/// per-connection failures that are reported through the status channel.
#[derive(Debug, Error)]
pub enum FwdError {
    #[error("invalid port: {0}")]
    InvalidPort(String),

    #[error("invalid upstream: {0}")]
    InvalidUpstream(String),

    #[error("bind {addr} failed: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("relay already running on port {0}")]
    AlreadyRunning(u16),

    #[error("accept failed: {0}")]
    Accept(#[source] std::io::Error),

    #[error("dial {addr} failed: {source}")]
    Dial {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

pub type FwdResult<T> = Result<T, FwdError>;
