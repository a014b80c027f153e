use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{what} not found")]
    NotFound { what: String },

    #[error("output store error: {0}")]
    Output(String),
}

impl From<StoreError> for crab_core::CrabError {
    fn from(err: StoreError) -> Self {
        crab_core::CrabError::Store(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
