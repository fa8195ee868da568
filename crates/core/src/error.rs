use thiserror::Error;

/// Errors shared by the DHT and cache layers.
///
/// Retry behavior is the caller's decision: `Network` is transient and may be
/// retried, `Protocol` and `SignatureInvalid` disqualify the peer that caused
/// them, `Cancelled` is always propagated as-is.
#[derive(Error, Debug)]
pub enum Error {
    #[error("operation aborted")]
    Cancelled,

    #[error("operation timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid signature")]
    SignatureInvalid,

    #[error("not found")]
    NotFound,

    #[error("rejected: a newer sequence number is already stored")]
    Stale,

    #[error("store corruption: {0}")]
    StoreCorruption(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Build a `Network` error from anything displayable
    pub fn network(err: impl std::fmt::Display) -> Self {
        Error::Network(err.to_string())
    }

    /// Build a `Protocol` error from anything displayable
    pub fn protocol(err: impl std::fmt::Display) -> Self {
        Error::Protocol(err.to_string())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Network(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Pick the error to surface from a composite operation: the first
/// non-cancellation error if there is one, otherwise `Cancelled`.
pub fn first_non_cancel(errors: impl IntoIterator<Item = Error>) -> Error {
    let mut first = None;
    for e in errors {
        if !e.is_cancelled() {
            return e;
        }
        first.get_or_insert(e);
    }
    first.unwrap_or(Error::Cancelled)
}
