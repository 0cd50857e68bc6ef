//! Transaction engine: submission-order execution with compensation-based
//! rollback.
//!
//! A transaction is a sequence of operations executed optimistically in
//! the order they are submitted. Each forward action may return a
//! *compensation* — the inverse action — which the handle records. When
//! any operation fails, or the deadline/cancellation fires at an
//! operation boundary, the recorded compensations run in LIFO order,
//! best-effort: a failing compensation is logged and collected, and the
//! remaining compensations still run. The overall failure surfaces as
//! [`TransactionError`] carrying the originating cause plus every
//! compensation failure.
//!
//! The engine is deliberately store-agnostic: operations are closures
//! over whatever environment the caller borrows. The store layers its
//! read-your-writes overlay on top.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::cancel::CancelToken;
use crate::config::TxnConfig;
use crate::error::{Error, Result, TransactionError};

/// A recorded inverse action.
pub type Compensation<'env> = Box<dyn FnOnce() -> Result<()> + 'env>;

/// Handle threaded through a transaction body.
///
/// Not `Send`: a transaction has a single writer; many transactions may
/// run concurrently, each with its own handle.
pub struct TxnHandle<'env> {
    id: String,
    cancel: CancelToken,
    deadline: Option<Instant>,
    compensations: Vec<(&'static str, Compensation<'env>)>,
    operations: u32,
}

impl<'env> TxnHandle<'env> {
    fn new(id: String, cancel: CancelToken, deadline: Option<Duration>) -> Self {
        Self {
            id,
            cancel,
            deadline: deadline.map(|d| Instant::now() + d),
            compensations: Vec::new(),
            operations: 0,
        }
    }

    /// The transaction id, used for the commit-log key.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Number of operations executed so far.
    pub fn operations(&self) -> u32 {
        self.operations
    }

    /// Errors with `Cancelled`/`Timeout` once either signal has fired.
    /// Called at every operation boundary; long-running operations also
    /// observe the token themselves.
    pub fn check(&self) -> Result<()> {
        self.cancel.check()?;
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
        }
        Ok(())
    }

    /// The cancellation token operations should observe.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Executes a forward action, recording its compensation.
    ///
    /// `label` names the operation in rollback logs.
    pub fn execute<T>(
        &mut self,
        label: &'static str,
        forward: impl FnOnce(&CancelToken) -> Result<(T, Option<Compensation<'env>>)>,
    ) -> Result<T> {
        self.check()?;
        let (value, compensation) = forward(&self.cancel)?;
        if let Some(compensation) = compensation {
            self.compensations.push((label, compensation));
        }
        self.operations += 1;
        Ok(value)
    }

    fn commit(self) {
        // Compensations are simply discarded once the transaction holds.
        drop(self.compensations);
    }

    fn rollback(self) -> Vec<Error> {
        let mut failures = Vec::new();
        for (label, compensation) in self.compensations.into_iter().rev() {
            if let Err(err) = compensation() {
                tracing::warn!(
                    tx = %self.id,
                    op = label,
                    error = %err,
                    "compensation failed during rollback"
                );
                failures.push(err);
            }
        }
        failures
    }
}

/// Immutable statistics snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TxnStats {
    pub total_transactions: u64,
    pub successful: u64,
    pub failed: u64,
    pub rolled_back: u64,
    pub average_execution_ms: f64,
    pub average_operations_per_tx: f64,
}

#[derive(Debug, Default)]
struct StatsInner {
    total: u64,
    successful: u64,
    failed: u64,
    rolled_back: u64,
    total_exec_micros: u128,
    total_operations: u64,
}

/// Runs transactions and tracks aggregate statistics.
pub struct TransactionManager {
    config: TxnConfig,
    stats: Mutex<StatsInner>,
}

impl TransactionManager {
    /// Creates a manager with the given defaults.
    pub fn new(config: TxnConfig) -> Self {
        Self {
            config,
            stats: Mutex::new(StatsInner::default()),
        }
    }

    /// Runs a transaction body to completion or rollback.
    ///
    /// The body receives the handle and submits operations through
    /// [`TxnHandle::execute`]. Any error aborts: compensations run in LIFO
    /// order and the error surfaces as [`Error::Transaction`]. Cancellation
    /// and timeout abort the same way and are never swallowed.
    pub fn run<'env, T>(
        &self,
        cancel: CancelToken,
        body: impl FnOnce(&mut TxnHandle<'env>) -> Result<T>,
    ) -> Result<T> {
        let started = Instant::now();
        let id = uuid::Uuid::new_v4().to_string();
        let mut handle = TxnHandle::new(id, cancel, self.config.deadline);

        let outcome = body(&mut handle);
        let operations = u64::from(handle.operations());

        let result = match outcome {
            Ok(value) => {
                handle.commit();
                Ok(value)
            }
            Err(cause) => {
                let failures = handle.rollback();
                Err(Error::Transaction(TransactionError::new(cause, failures)))
            }
        };

        let mut stats = self.stats.lock();
        stats.total += 1;
        stats.total_operations += operations;
        stats.total_exec_micros += started.elapsed().as_micros();
        match &result {
            Ok(_) => stats.successful += 1,
            Err(_) => {
                stats.failed += 1;
                stats.rolled_back += 1;
            }
        }

        result
    }

    /// Returns an immutable snapshot of the statistics.
    pub fn stats(&self) -> TxnStats {
        let stats = self.stats.lock();
        let total = stats.total.max(1) as f64;
        TxnStats {
            total_transactions: stats.total,
            successful: stats.successful,
            failed: stats.failed,
            rolled_back: stats.rolled_back,
            average_execution_ms: stats.total_exec_micros as f64 / 1000.0 / total,
            average_operations_per_tx: stats.total_operations as f64 / total,
        }
    }
}
