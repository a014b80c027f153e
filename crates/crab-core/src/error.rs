use thiserror::Error;

/// Daemon-level error kinds.
///
/// Component crates define their own error enums and translate into these at
/// the boundary; the gateway maps them onto HTTP statuses and wire bodies.
#[derive(Debug, Error)]
pub enum CrabError {
    /// Unparseable or incomplete configuration. Fatal at startup only.
    #[error("configuration error: {0}")]
    Config(String),

    /// A persistence failure. Callers see it; loops log and retry next tick.
    #[error("store error: {0}")]
    Store(String),

    /// A malformed cron specification. The job is excluded from liveness
    /// until fixed.
    #[error("schedule error: {0}")]
    Schedule(String),

    /// A notification dispatch failure, after retries.
    #[error("transport error: {0}")]
    Transport(String),

    /// An invalid client request. Answered with a 4xx, never logged as an
    /// event.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An uncaught programmer error. Surfaced as a 5xx; the daemon keeps
    /// running.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CrabError {
    /// Short error code string used in wire error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            CrabError::Config(_) => "CONFIG_ERROR",
            CrabError::Store(_) => "STORE_ERROR",
            CrabError::Schedule(_) => "SCHEDULE_ERROR",
            CrabError::Transport(_) => "TRANSPORT_ERROR",
            CrabError::Protocol(_) => "PROTOCOL_ERROR",
            CrabError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, CrabError>;
