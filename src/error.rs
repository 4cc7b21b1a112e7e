use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy for the forwarding core.
///
/// `RateLimited` is the only variant callers are expected to special-case:
/// sleep exactly `seconds`, do not consume a retry attempt. `Restricted`
/// triggers the download/re-upload fallback rather than a hard failure.
#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("forwarding restricted: {0}")]
    Restricted(String),

    #[error("rate limited, wait {seconds}s")]
    RateLimited { seconds: u64 },

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("invalid parameters: {0}")]
    Validation(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("cancelled")]
    Cancelled,

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Error::RateLimited { .. })
    }

    pub fn is_restricted(&self) -> bool {
        matches!(self, Error::Restricted(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Whether the retry helper should spend an attempt on this error.
    /// Not-found, restriction and validation failures never improve on
    /// retry.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Error::NotFound(_)
                | Error::Restricted(_)
                | Error::Validation(_)
                | Error::Config(_)
                | Error::Cancelled
        )
    }
}
