//! Error types for TriaxDB operations.

use thiserror::Error;

/// Result type alias using TriaxDB's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during TriaxDB operations.
///
/// Every variant maps to a stable [`ErrorKind`] tag for programmatic
/// handling; the payload carries human-readable detail only.
#[derive(Debug, Error)]
pub enum Error {
    /// Referenced entity does not exist.
    ///
    /// Note: `Store::get` returns `Ok(None)` for missing nouns; this
    /// variant is reserved for operations that require the entity.
    #[error("not found: {0}")]
    NotFound(String),

    /// Attempted to create an entity whose id is already taken.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Bad input: dimension mismatch, unknown verb type, malformed filter,
    /// zero vector under cosine, and similar caller mistakes.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Checksum or structural failure in a persisted block. Scoped to the
    /// partition or chunk it was found in; other partitions keep serving.
    #[error("index corrupt: {0}")]
    IndexCorrupt(String),

    /// Transport-level storage failure after retries were exhausted.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Concurrent write collided on a serialized resource.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The operation's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// The operation's deadline elapsed.
    #[error("deadline exceeded")]
    Timeout,

    /// A transaction failed; carries the originating cause and the outcome
    /// of every compensation that ran during rollback.
    #[error(transparent)]
    Transaction(#[from] TransactionError),

    /// A persisted frame carried a version tag this build does not know.
    #[error("unsupported version tag: {0}")]
    UnsupportedVersion(u8),
}

impl Error {
    /// Creates an `InvalidArgument` error.
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Creates a `NotFound` error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Creates an `IndexCorrupt` error.
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::IndexCorrupt(msg.into())
    }

    /// Creates a `StorageUnavailable` error.
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::StorageUnavailable(msg.into())
    }

    /// Returns the stable kind tag for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::IndexCorrupt(_) => ErrorKind::IndexCorrupt,
            Self::StorageUnavailable(_) => ErrorKind::StorageUnavailable,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Timeout => ErrorKind::Timeout,
            Self::Transaction(_) => ErrorKind::Transaction,
            Self::UnsupportedVersion(_) => ErrorKind::UnsupportedVersion,
        }
    }

    /// Returns true if retrying the operation may succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::StorageUnavailable(_) | Self::Conflict(_))
    }

    /// Returns true if this error signals cancellation or timeout.
    ///
    /// Cancellation must never be swallowed; callers that wrap errors use
    /// this to pass it through untouched.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Timeout)
    }
}

/// Stable error tags, suitable for matching without string inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    InvalidArgument,
    IndexCorrupt,
    StorageUnavailable,
    Conflict,
    Cancelled,
    Timeout,
    Transaction,
    UnsupportedVersion,
}

/// Failure of a transaction, with the rollback outcome attached.
///
/// `cause` is the error that aborted the forward pass. Compensations run
/// best-effort in LIFO order even when some of them fail; every
/// compensation failure is collected in `compensation_failures`.
#[derive(Debug, Error)]
#[error("transaction failed: {cause} ({} compensation failure(s))", .compensation_failures.len())]
pub struct TransactionError {
    /// The error that aborted the transaction.
    #[source]
    pub cause: Box<Error>,
    /// Errors raised by compensations during rollback, in execution order.
    pub compensation_failures: Vec<Error>,
}

impl TransactionError {
    /// Wraps an originating error with the compensation outcomes.
    pub fn new(cause: Error, compensation_failures: Vec<Error>) -> Self {
        Self {
            cause: Box::new(cause),
            compensation_failures,
        }
    }

    /// True if every compensation ran cleanly.
    pub fn rolled_back_cleanly(&self) -> bool {
        self.compensation_failures.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::invalid("dimension mismatch: expected 384, got 512");
        assert_eq!(
            err.to_string(),
            "invalid argument: dimension mismatch: expected 384, got 512"
        );
    }

    #[test]
    fn test_error_kind_stable() {
        assert_eq!(Error::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(Error::Timeout.kind(), ErrorKind::Timeout);
        assert_eq!(
            Error::UnsupportedVersion(9).kind(),
            ErrorKind::UnsupportedVersion
        );
    }

    #[test]
    fn test_retriable() {
        assert!(Error::storage("connection reset").is_retriable());
        assert!(!Error::not_found("noun").is_retriable());
    }

    #[test]
    fn test_transaction_error_wraps_cause() {
        let txe = TransactionError::new(Error::invalid("bad verb"), vec![Error::Cancelled]);
        let err: Error = txe.into();
        assert_eq!(err.kind(), ErrorKind::Transaction);
        assert!(err.to_string().contains("1 compensation failure"));
    }

    #[test]
    fn test_cancellation_is_flagged() {
        assert!(Error::Cancelled.is_cancellation());
        assert!(Error::Timeout.is_cancellation());
        assert!(!Error::Conflict("x".into()).is_cancellation());
    }
}
