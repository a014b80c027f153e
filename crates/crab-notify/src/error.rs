use thiserror::Error;

/// Errors raised by alert transports.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The message could not be delivered.
    #[error("dispatch failed: {0}")]
    Dispatch(String),

    /// The transport-specific configuration is invalid or missing.
    #[error("transport configuration error: {0}")]
    Config(String),

    /// No transport is registered under the requested name.
    #[error("unknown transport: {0}")]
    Unknown(String),
}

impl From<TransportError> for crab_core::CrabError {
    fn from(err: TransportError) -> Self {
        crab_core::CrabError::Transport(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
