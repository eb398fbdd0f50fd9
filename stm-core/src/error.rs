// Copyright 2015-2016 rust-stm Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Two disjoint error families.
//!
//! [`StmError`]/[`TransactionError`] are control-flow signals passed between
//! a transaction body and the code driving it (`Transaction::commute`,
//! `Transaction::or`, the [`crate::executor`]). They do not implement
//! `std::error::Error` on purpose: they are not meant to escape past the
//! executor, and a caller using `?` inside a transaction body is expected to
//! propagate them to the executor, never to handle or log them directly.
//!
//! [`StmFailure`] is the user-visible failure enum from the public API
//! surface: `execute`, `retry`, and friends.

use std::fmt;

/// Result of a single step of an STM computation.
#[derive(Eq, PartialEq, Clone, Copy, Debug)]
pub enum StmError {
    /// A read or write this attempt depended on turned out to be
    /// inconsistent (a read-conflict, write-conflict, or failure to take a
    /// configured lock). The executor retries the whole attempt.
    Failure,

    /// `retry()` was called. The executor blocks until one of the refs read
    /// so far changes, then retries.
    Retry,
}

impl fmt::Display for StmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StmError::Failure => write!(f, "transaction failure signal"),
            StmError::Retry => write!(f, "transaction retry signal"),
        }
    }
}

/// Result of a single step of a transaction that cannot fail explicitly.
pub type StmResult<T> = Result<T, StmError>;

/// Result of a transaction body that may also call [`crate::abort`].
#[derive(Eq, PartialEq, Clone, Copy, Debug)]
pub enum TransactionError<E> {
    /// Failed due to an [`StmError`] (conflict or retry).
    Stm(StmError),
    /// `abort` was called; the transaction unwinds and returns `E`.
    Abort(E),
}

impl<E> From<StmError> for TransactionError<E> {
    fn from(e: StmError) -> Self {
        TransactionError::Stm(e)
    }
}

/// Lets a nested, flattened `execute()` call be propagated with `?` from
/// inside an enclosing transaction body: any [`StmFailure`] the nested call
/// surfaces degrades to an ordinary [`StmError::Failure`], which simply
/// retries the whole enclosing attempt. Always safe, if not always the most
/// efficient response to the specific failure.
impl From<StmFailure> for StmError {
    fn from(_: StmFailure) -> Self {
        StmError::Failure
    }
}

impl<E: fmt::Display> fmt::Display for TransactionError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionError::Stm(e) => write!(f, "{e}"),
            TransactionError::Abort(e) => write!(f, "transaction aborted: {e}"),
        }
    }
}

/// Result of a transaction with failure potential.
pub type TransactionClosureResult<T, E> = Result<T, TransactionError<E>>;

/// Internal, more granular reason a conflict occurred. Never returned to
/// user code — only used to label `tracing` events at the point of failure,
/// since the executor's retry loop treats all three identically (unlike
/// `SpeculativeFailure`, which is handled out-of-band on [`crate::transaction::Transaction`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConflictKind {
    ReadConflict,
    WriteConflict,
    LockNotFree,
}

impl ConflictKind {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            ConflictKind::ReadConflict => "read-conflict",
            ConflictKind::WriteConflict => "write-conflict",
            ConflictKind::LockNotFree => "lock-not-free",
        }
    }
}

/// User-visible failures raised by the public API (never raised from inside
/// a transaction body — those propagate [`StmError`]/[`TransactionError`]
/// instead).
#[derive(Debug, thiserror::Error)]
pub enum StmFailure {
    #[error("operation requires an active transaction")]
    TransactionMandatory,

    #[error("retry() called with an empty read log")]
    NoRetryPossible,

    #[error("retry() called while blocking is disabled by configuration")]
    RetryNotAllowed,

    #[error("timed out waiting for a retried transaction to unblock")]
    RetryTimeout,

    #[error("interrupted while parked on a retry latch")]
    RetryInterrupted,

    #[error("exceeded the configured maximum number of conflict retries")]
    TooManyRetries,

    #[error("operation attempted on an already-aborted or committed transaction")]
    DeadTransaction,

    #[error("mutation attempted on a prepared transaction")]
    PreparedTransaction,

    #[error("write attempted on a read-only transaction")]
    ReadonlyViolation,

    #[error("a required argument was missing")]
    NullArgument,

    #[error("atomicChecked closure touched more than one ref")]
    MultiRefAtomic,

    #[error("Propagation::Never forbids nesting inside an active transaction")]
    NestedTransactionNotAllowed,

    #[error("a flattened, nested transaction hit a conflict the enclosing attempt must resolve")]
    FlattenedConflict,
}
