//! Cooperative cancellation for long-running operations.
//!
//! Every operation that can suspend at an I/O boundary (KNN search, graph
//! traversal, transactions) accepts a [`CancelToken`]. The token is checked
//! at iteration boundaries; once it fires, the operation stops and reports
//! [`Error::Cancelled`] (or [`Error::Timeout`] when a deadline elapsed).
//! Side effects already committed to storage are not reversed here; wrap
//! work in a transaction to get atomicity.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// A cloneable handle used to observe and request cancellation.
///
/// Tokens are cheap to clone; all clones share the same state. A token may
/// carry a deadline, after which [`check`](CancelToken::check) reports
/// `Timeout` instead of `Cancelled`.
///
/// # Example
///
/// ```
/// use triaxdb_core::cancel::CancelToken;
///
/// let token = CancelToken::new();
/// assert!(token.check().is_ok());
/// token.cancel();
/// assert!(token.check().is_err());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    deadline: Option<Instant>,
}

impl CancelToken {
    /// Creates a token that never fires on its own.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a token that fires after `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                deadline: Some(Instant::now() + timeout),
            }),
        }
    }

    /// Creates a token with an absolute deadline.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                deadline: Some(deadline),
            }),
        }
    }

    /// Requests cancellation. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
    }

    /// Returns true if cancellation was requested or the deadline elapsed.
    pub fn is_cancelled(&self) -> bool {
        if self.inner.cancelled.load(Ordering::Acquire) {
            return true;
        }
        matches!(self.inner.deadline, Some(d) if Instant::now() >= d)
    }

    /// Returns the deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Errors with `Cancelled` or `Timeout` if the token has fired.
    ///
    /// Call this at loop and suspension boundaries.
    pub fn check(&self) -> Result<()> {
        if self.inner.cancelled.load(Ordering::Acquire) {
            return Err(Error::Cancelled);
        }
        if let Some(deadline) = self.inner.deadline {
            if Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
        }
        Ok(())
    }
}
