use thiserror::Error;

/// SQLSTATE raised when a second consumer attaches to an active slot.
const SQLSTATE_OBJECT_IN_USE: &str = "55006";

#[derive(Debug, Error)]
pub enum CdcError {
    /// Malformed wire data, LSN, or log-table payload. Fatal to the
    /// current decode; the session must be restarted.
    #[error("format error: {0}")]
    Format(String),

    /// A message tag this decoder does not understand; usually a
    /// protocol version mismatch. Fatal.
    #[error("unsupported replication message: tag 0x{tag:02X}")]
    UnsupportedMessage { tag: u8 },

    /// The slot exists but cannot be used as configured.
    #[error("slot conflict: {0}")]
    SlotConflict(String),

    /// Another consumer already holds the slot.
    #[error("slot in use: {0}")]
    SlotInUse(String),

    /// Transient network or session failure; the caller may reconnect.
    #[error("stream error: {0}")]
    Stream(String),

    /// The log tables cannot bridge the failover gap; a caller-driven
    /// full resync is required.
    #[error("gap recovery failed: {0}")]
    GapUnrecoverable(String),

    #[error("postgres error: {0}")]
    Postgres(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CdcError {
    /// Whether reconnecting with backoff is a sensible response.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CdcError::Stream(_))
    }
}

// Short reads while decoding mean a truncated message, not a dead socket;
// transport failures are mapped to Stream/Connection at the call site.
impl From<std::io::Error> for CdcError {
    fn from(e: std::io::Error) -> Self {
        CdcError::Format(format!("truncated message: {}", e))
    }
}

impl From<tokio_postgres::Error> for CdcError {
    fn from(e: tokio_postgres::Error) -> Self {
        // Extract database error details if available
        if let Some(db_err) = e.as_db_error() {
            let msg = format!(
                "{}: {} (code: {})",
                db_err.severity(),
                db_err.message(),
                db_err.code().code()
            );
            if db_err.code().code() == SQLSTATE_OBJECT_IN_USE {
                CdcError::SlotInUse(msg)
            } else {
                CdcError::Postgres(msg)
            }
        } else {
            CdcError::Postgres(e.to_string())
        }
    }
}

impl From<pgtide_core::Error> for CdcError {
    fn from(e: pgtide_core::Error) -> Self {
        match e {
            pgtide_core::Error::InvalidLsn(s) => CdcError::Format(format!("invalid LSN: {}", s)),
            pgtide_core::Error::Serialization(e) => CdcError::Json(e),
        }
    }
}

pub type CdcResult<T> = Result<T, CdcError>;
