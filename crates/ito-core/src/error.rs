use thiserror::Error;

pub type ItoResult<T> = Result<T, ItoError>;

#[derive(Debug, Error)]
pub enum ItoError {
    /// The ratchet produced its last TCN; the caller must start a fresh one.
    #[error("ratchet exhausted after {max_ticks} ticks")]
    RatchetExhausted { max_ticks: u32 },

    #[error("invalid tick range [{start}, {end}]: {reason}")]
    InvalidRange { start: u32, end: u32, reason: String },

    #[error("malformed report: {0}")]
    MalformedReport(String),

    #[error("unsupported report version: {0:#04x}")]
    UnsupportedVersion(u8),

    #[error("invalid report: {0}")]
    InvalidReport(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("publish failed: {0}")]
    PublishFailed(String),

    #[error("report fetch failed: {0}")]
    FetchFailed(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ItoError {
    /// Errors worth retrying with backoff: the operation may succeed later
    /// without any change on the caller's side.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ItoError::StoreUnavailable(_) | ItoError::PublishFailed(_) | ItoError::FetchFailed(_)
        )
    }

    pub fn store(err: impl std::fmt::Display) -> Self {
        ItoError::StoreUnavailable(err.to_string())
    }
}
