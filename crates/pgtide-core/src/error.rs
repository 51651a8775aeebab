use thiserror::Error;

/// Errors that can occur in pgtide-core.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid LSN: {0}")]
    InvalidLsn(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
