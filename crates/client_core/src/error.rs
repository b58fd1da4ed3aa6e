use thiserror::Error;

/// Typed failures surfaced by the engine's public API.
///
/// Transport, send, and reconciliation failures never appear here: they
/// terminate in observable state changes (connection state, per-message
/// `Failed` status) instead of propagating to the embedder.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("request to history API failed: {0}")]
    Fetch(#[from] reqwest::Error),
}

/// Errors returned by event-channel operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("event channel has been shut down")]
    Closed,
}
