//! Error types for the real-time layer.
//!
//! Connection failures are deliberately absent: they never surface to
//! callers and are absorbed by the hub's reconnect loop.

use thiserror::Error;

/// Rejected hub configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("retry delay table must contain at least one delay")]
    EmptyRetryDelays,

    #[error("heartbeat timeout must be greater than zero")]
    ZeroHeartbeatTimeout,

    #[error("invalid push url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("invalid value for {key}: {value:?}")]
    InvalidEnv { key: &'static str, value: String },
}

/// Errors raised while constructing an [`EventHub`](crate::EventHub).
#[derive(Debug, Error)]
pub enum HubError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("no tokio runtime available to drive the push connection")]
    NoRuntime,
}
