// Copyright 2015-2016 rust-stm Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The retry loop, and how a nested `execute` composes with an ambient
//! transaction.
//!
//! [`execute`] is the general entry point: it reads `config.propagation`
//! against whatever transaction (if any) is active on the current thread —
//! tracked in a thread-local slot, installed and restored by [`ActiveGuard`]
//! — and either joins that transaction directly or drives a brand-new one
//! through [`drive`]'s retry loop. `atomically`/`atomically_with_err` (in
//! [`crate`]) are thin, infallible convenience wrappers around this that
//! always start fresh with an effectively unbounded retry budget, matching
//! the simple common case where a caller doesn't want to think about
//! `StmFailure` at all.
//!
//! Joining an ambient transaction does not run its own retry loop: the
//! nested closure runs once against the live `&mut Transaction`, and any
//! [`StmError`] it raises is surfaced as a [`StmFailure::FlattenedConflict`]
//! for the caller to convert back with `?` (via `From<StmFailure> for
//! StmError`) into a signal that retries the *enclosing* attempt as a whole.

use std::cell::Cell;
use std::ptr;

use tracing::{debug, trace, warn};

use crate::config::{Propagation, TransactionConfig};
use crate::error::{StmError, StmFailure, StmResult, TransactionClosureResult, TransactionError};
use crate::transaction::context::Transaction;
use crate::transaction::control_block::LatchOutcome;

thread_local! {
    /// Non-null iff a transaction is active on this thread. Set only by
    /// [`ActiveGuard`], which always restores whatever was here before it on
    /// drop, so `RequiresNew` can suspend an outer transaction and correctly
    /// hand control back to it afterwards.
    static ACTIVE_TX: Cell<*mut Transaction> = const { Cell::new(ptr::null_mut()) };
}

fn active_tx() -> Option<*mut Transaction> {
    let ptr = ACTIVE_TX.with(Cell::get);
    if ptr.is_null() {
        None
    } else {
        Some(ptr)
    }
}

/// Installs `tx` as the thread's active transaction for the guard's
/// lifetime, restoring the previous value (possibly another transaction,
/// possibly none) on drop.
struct ActiveGuard(*mut Transaction);

impl ActiveGuard {
    fn install(tx: &mut Transaction) -> Self {
        let prev = ACTIVE_TX.with(|cell| cell.replace(tx as *mut Transaction));
        ActiveGuard(prev)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        ACTIVE_TX.with(|cell| cell.set(self.0));
    }
}

/// What to do after a transaction body raises a failure, for
/// [`execute_with_control`]'s caller to decide per-failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionControl {
    /// Clear the log and run the body again.
    Retry,
    /// Stop; the whole call returns `None`.
    Abort,
}

/// Run `f` under `config`'s propagation rules.
///
/// - `RequiresNew` always starts a brand-new transaction, suspending
///   whatever was active.
/// - `Mandatory`/`Requires`/`Supports` join an active transaction if one
///   exists; `Requires`/`Supports` fall back to starting a new one if none
///   does, `Mandatory` instead fails with [`StmFailure::TransactionMandatory`].
/// - `Never` fails with [`StmFailure::NestedTransactionNotAllowed`] if a
///   transaction is already active, else starts a new one (there being no
///   meaningful way to run an `&mut Transaction`-shaped closure without one).
pub fn execute<T, F>(config: TransactionConfig, f: F) -> Result<T, StmFailure>
where
    F: Fn(&mut Transaction) -> StmResult<T>,
{
    match (config.propagation, active_tx()) {
        (Propagation::Never, Some(_)) => Err(StmFailure::NestedTransactionNotAllowed),
        (Propagation::Mandatory, None) => Err(StmFailure::TransactionMandatory),
        (Propagation::RequiresNew, _) => run_owned(config, f),
        (Propagation::Never | Propagation::Requires | Propagation::Supports, None) => {
            run_owned(config, f)
        }
        (Propagation::Mandatory | Propagation::Requires | Propagation::Supports, Some(ptr)) => {
            // SAFETY: `ptr` was installed by an `ActiveGuard` still alive
            // further up this thread's call stack (strict LIFO nesting), so
            // it is valid for the duration of this reborrow.
            let tx = unsafe { &mut *ptr };
            f(tx).map_err(|e| {
                trace!(?e, "flattened sub-transaction signalled a conflict");
                match e {
                    StmError::Retry | StmError::Failure => StmFailure::FlattenedConflict,
                }
            })
        }
    }
}

/// Run `f` to completion, retrying indefinitely on conflict or blocking
/// retry. Backs [`crate::atomically`]: there is deliberately no
/// `max_retries` ceiling here, matching that function's "just works, never
/// fails" contract (the teacher's infallible `Transaction::with`). Use
/// [`execute`] instead if you need a bounded retry budget or control over
/// blocking.
pub fn run_unbounded<T, F>(f: F) -> T
where
    F: Fn(&mut Transaction) -> StmResult<T>,
{
    let config = TransactionConfig::default();
    let mut tx = Transaction::new(config.clone());
    let _guard = ActiveGuard::install(&mut tx);
    loop {
        match f(&mut tx) {
            Ok(value) => {
                if tx.commit() {
                    return value;
                }
            }
            Err(StmError::Retry) => {
                let _ = wait_for_retry(&tx, &config);
            }
            Err(StmError::Failure) => {
                let _ = tx.take_poison();
            }
        }
        if tx.take_speculative_failure() {
            tx.escalate_speculative();
        }
        tx.clear();
    }
}

/// Like [`run_unbounded`], but lets the closure abort with a user error via
/// [`TransactionError::Abort`]. Backs [`crate::atomically_with_err`] (the
/// teacher's `Transaction::with_err`).
pub fn run_unbounded_fallible<T, E, F>(f: F) -> Result<T, E>
where
    F: Fn(&mut Transaction) -> TransactionClosureResult<T, E>,
{
    let config = TransactionConfig::default();
    let mut tx = Transaction::new(config.clone());
    let _guard = ActiveGuard::install(&mut tx);
    loop {
        match f(&mut tx) {
            Ok(value) => {
                if tx.commit() {
                    return Ok(value);
                }
            }
            Err(TransactionError::Abort(e)) => {
                tx.clear();
                return Err(e);
            }
            Err(TransactionError::Stm(StmError::Retry)) => {
                let _ = wait_for_retry(&tx, &config);
            }
            Err(TransactionError::Stm(StmError::Failure)) => {
                let _ = tx.take_poison();
            }
        }
        if tx.take_speculative_failure() {
            tx.escalate_speculative();
        }
        tx.clear();
    }
}

/// Like [`execute`], but lets `control` decide, per failure, whether to
/// retry or give up — a generalization of the fixed `max_retries`/blocking
/// loop `execute` runs internally. Always starts its own transaction
/// (`config.propagation` is ignored).
pub fn execute_with_control<T, F, C>(config: TransactionConfig, mut control: C, f: F) -> Option<T>
where
    F: Fn(&mut Transaction) -> StmResult<T>,
    C: FnMut(StmFailure) -> TransactionControl,
{
    let mut tx = Transaction::new(config.clone());
    let _guard = ActiveGuard::install(&mut tx);

    loop {
        match f(&mut tx) {
            Ok(value) => {
                if tx.commit() {
                    return Some(value);
                }
            }
            Err(StmError::Retry) => {
                if let Some(failure) = wait_for_retry(&tx, &config) {
                    if control(failure) == TransactionControl::Abort {
                        tx.clear();
                        return None;
                    }
                }
            }
            Err(StmError::Failure) => {
                let failure = tx.take_poison().unwrap_or(StmFailure::TooManyRetries);
                if control(failure) == TransactionControl::Abort {
                    tx.clear();
                    return None;
                }
            }
        }

        if tx.take_speculative_failure() {
            tx.escalate_speculative();
            tx.clear();
            continue;
        }

        tx.clear();
    }
}

/// Run `f` as a standalone attempt and refuse to commit if it touched more
/// than one ref. Backs `TVar`'s own `atomic_*` convenience methods, whose
/// closures are guaranteed single-ref by construction, and is exposed more
/// generally as the spec's `atomicChecked` escape hatch.
pub fn atomic_checked<T, F>(config: TransactionConfig, f: F) -> Result<T, StmFailure>
where
    F: Fn(&mut Transaction) -> StmResult<T>,
{
    let mut tx = Transaction::new(config.clone());
    let _guard = ActiveGuard::install(&mut tx);
    drive(&mut tx, &config, &f, &|tx| {
        if tx.touched_len() > 1 {
            Err(StmFailure::MultiRefAtomic)
        } else {
            Ok(())
        }
    })
}

fn run_owned<T, F>(config: TransactionConfig, f: F) -> Result<T, StmFailure>
where
    F: Fn(&mut Transaction) -> StmResult<T>,
{
    let mut tx = Transaction::new(config.clone());
    let _guard = ActiveGuard::install(&mut tx);
    drive(&mut tx, &config, &f, &|_tx| Ok(()))
}

/// The fixed retry loop: run the body, validate with `validate`, commit;
/// block and retry on `retry()`, retry from scratch on a plain conflict,
/// escalate the speculative ladder without counting it against
/// `max_retries`, and give up once `max_retries` ordinary conflicts have
/// been spent.
fn drive<T, F, V>(
    tx: &mut Transaction,
    config: &TransactionConfig,
    f: &F,
    validate: &V,
) -> Result<T, StmFailure>
where
    F: Fn(&mut Transaction) -> StmResult<T>,
    V: Fn(&Transaction) -> Result<(), StmFailure>,
{
    let mut attempts: u32 = 0;

    loop {
        let _span = tx
            .speculative_level()
            .monitored()
            .then(|| tracing::debug_span!("stm_attempt", attempts, level = ?tx.speculative_level()).entered());

        match f(tx) {
            Ok(value) => {
                if let Err(failure) = validate(tx) {
                    tx.clear();
                    return Err(failure);
                }
                if tx.commit() {
                    return Ok(value);
                }
                trace!(attempts, "commit conflict, retrying");
            }
            Err(StmError::Retry) => {
                if let Some(failure) = wait_for_retry(tx, config) {
                    tx.clear();
                    return Err(failure);
                }
            }
            Err(StmError::Failure) => {
                if let Some(failure) = tx.take_poison() {
                    tx.clear();
                    return Err(failure);
                }
            }
        }

        if tx.take_speculative_failure() {
            debug!(level = ?tx.speculative_level(), "speculative failure, escalating");
            tx.escalate_speculative();
            tx.clear();
            continue;
        }

        attempts += 1;
        if attempts >= config.max_retries {
            warn!(attempts, "exceeded max_retries");
            tx.clear();
            return Err(StmFailure::TooManyRetries);
        }
        tx.clear();
    }
}

/// Handle a `retry()` signal: block on a latch if blocking is allowed and
/// there is anything to wait on, else report the reason the transaction
/// can't block. Returns `Some(failure)` when the caller should give up and
/// surface `failure`, `None` when it should just retry the attempt.
fn wait_for_retry(tx: &Transaction, config: &TransactionConfig) -> Option<StmFailure> {
    if !config.blocking_allowed {
        tx.release_for_retry();
        return Some(StmFailure::RetryNotAllowed);
    }

    let latch = tx.build_retry_latch(config.interruptible, config.timeout);
    tx.release_for_retry();

    match latch {
        None => Some(StmFailure::NoRetryPossible),
        Some(latch) => {
            debug!("blocking on retry latch");
            match latch.wait() {
                LatchOutcome::Signalled => None,
                LatchOutcome::TimedOut => Some(StmFailure::RetryTimeout),
                LatchOutcome::Interrupted => Some(StmFailure::RetryInterrupted),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tvar::TVar;

    #[test]
    fn execute_commits_a_simple_write() {
        let var = TVar::new(0);
        let result = execute(TransactionConfig::default(), |tx| var.set(tx, 5));
        assert!(result.is_ok());
        assert_eq!(var.read_atomic(), 5);
    }

    #[test]
    fn execute_retries_past_a_transient_conflict() {
        let var = TVar::new(0);
        let mut first_attempt = true;
        let result = execute(TransactionConfig::default(), move |tx| {
            let v = var.get(tx)?;
            if first_attempt {
                first_attempt = false;
                // Simulate a concurrent commit landing between read and write.
                let mut other = Transaction::new(TransactionConfig::default());
                var.set(&mut other, 99).unwrap();
                assert!(other.commit());
            }
            var.set(tx, v + 1)
        });
        assert_eq!(result.unwrap(), 100);
    }

    #[test]
    fn mandatory_without_ambient_transaction_fails() {
        let cfg = TransactionConfig::default().with_propagation(Propagation::Mandatory);
        let result: Result<(), StmFailure> = execute(cfg, |_tx| Ok(()));
        assert!(matches!(result, Err(StmFailure::TransactionMandatory)));
    }

    #[test]
    fn requires_joins_an_ambient_transaction() {
        let var = TVar::new(1);
        let outer_cfg = TransactionConfig::default();
        let result = execute(outer_cfg, |tx| {
            var.set(tx, 2)?;
            let inner_cfg = TransactionConfig::default().with_propagation(Propagation::Requires);
            let joined = execute(inner_cfg, |inner_tx| var.get(inner_tx));
            assert_eq!(joined.unwrap(), 2);
            Ok(())
        });
        assert!(result.is_ok());
        assert_eq!(var.read_atomic(), 2);
    }

    #[test]
    fn never_rejects_nesting_inside_an_active_transaction() {
        let result = execute(TransactionConfig::default(), |_tx| {
            let inner = execute(
                TransactionConfig::default().with_propagation(Propagation::Never),
                |_inner_tx: &mut Transaction| Ok(()),
            );
            assert!(matches!(
                inner,
                Err(StmFailure::NestedTransactionNotAllowed)
            ));
            Ok(())
        });
        assert!(result.is_ok());
    }

    #[test]
    fn requires_new_suspends_and_restores_the_outer_transaction() {
        let outer_var = TVar::new(1);
        let inner_var = TVar::new(10);
        let result = execute(TransactionConfig::default(), |tx| {
            outer_var.set(tx, 2)?;
            let inner_cfg = TransactionConfig::default().with_propagation(Propagation::RequiresNew);
            let inner = execute(inner_cfg, |inner_tx| inner_var.set(inner_tx, 20));
            assert!(inner.is_ok());
            // Outer transaction's own buffered write must still be intact.
            assert_eq!(outer_var.get(tx)?, 2);
            Ok(())
        });
        assert!(result.is_ok());
        assert_eq!(outer_var.read_atomic(), 2);
        assert_eq!(inner_var.read_atomic(), 20);
    }

    #[test]
    fn retry_not_allowed_when_blocking_disabled() {
        let var = TVar::new(0);
        let cfg = TransactionConfig::default().with_blocking_allowed(false);
        let result: Result<(), StmFailure> = execute(cfg, |tx| {
            let v = var.get(tx)?;
            if v == 0 {
                Err(StmError::Retry)
            } else {
                Ok(())
            }
        });
        assert!(matches!(result, Err(StmFailure::RetryNotAllowed)));
    }

    #[test]
    fn max_retries_is_eventually_exhausted() {
        let var = TVar::new(0);
        let cfg = TransactionConfig::default().with_max_retries(3);
        let result: Result<(), StmFailure> = execute(cfg, |tx| {
            var.set(tx, var.get(tx)? + 1)?;
            // Force a conflict every attempt by racing a concurrent commit.
            let mut other = Transaction::new(TransactionConfig::default());
            var.set(&mut other, var.get(&mut other).unwrap() + 100).unwrap();
            assert!(other.commit());
            Err(StmError::Failure)
        });
        assert!(matches!(result, Err(StmFailure::TooManyRetries)));
    }

    #[test]
    fn atomic_checked_rejects_a_multi_ref_closure() {
        let a = TVar::new(1);
        let b = TVar::new(2);
        let result: Result<(), StmFailure> = atomic_checked(TransactionConfig::default(), |tx| {
            a.set(tx, 10)?;
            b.set(tx, 20)
        });
        assert!(matches!(result, Err(StmFailure::MultiRefAtomic)));
    }

    #[test]
    fn atomic_checked_allows_a_single_ref_closure() {
        let a = TVar::new(1);
        let result = atomic_checked(TransactionConfig::default(), |tx| a.set(tx, 10));
        assert!(result.is_ok());
        assert_eq!(a.read_atomic(), 10);
    }

    #[test]
    fn execute_with_control_can_give_up_after_one_failure() {
        let var = TVar::new(0);
        let attempts = std::cell::Cell::new(0);
        let result = execute_with_control(
            TransactionConfig::default(),
            |_failure| TransactionControl::Abort,
            |tx| {
                attempts.set(attempts.get() + 1);
                var.set(tx, 1)?;
                Err(StmError::Failure)
            },
        );
        assert!(result.is_none());
        assert_eq!(attempts.get(), 1);
    }

    #[test]
    fn run_unbounded_commits_a_simple_write() {
        let var = TVar::new(0);
        let result = run_unbounded(|tx| var.set(tx, 5));
        assert_eq!(result, ());
        assert_eq!(var.read_atomic(), 5);
    }

    #[test]
    fn run_unbounded_fallible_propagates_abort() {
        let result: Result<(), &str> = run_unbounded_fallible(|_tx| Err(TransactionError::Abort("nope")));
        assert_eq!(result, Err("nope"));
    }

    #[test]
    fn run_unbounded_fallible_commits_on_success() {
        let var = TVar::new(0);
        let result: Result<i32, &str> = run_unbounded_fallible(|tx| {
            var.set(tx, 7)?;
            Ok(7)
        });
        assert_eq!(result, Ok(7));
        assert_eq!(var.read_atomic(), 7);
    }

    #[test]
    fn run_unbounded_does_not_leak_a_lock_on_a_failed_attempt() {
        let var = TVar::new(0);
        // Force one conflicting commit, then succeed: if the first attempt's
        // write lock leaked, the second attempt would hang forever on
        // `open_for_write` instead of retrying cleanly.
        let mut first = true;
        let result = run_unbounded(|tx| {
            let v = var.get(tx)?;
            if first {
                first = false;
                let mut other = Transaction::new(TransactionConfig::default());
                var.set(&mut other, 99).unwrap();
                assert!(other.commit());
            }
            var.set(tx, v + 1)
        });
        assert_eq!(result, ());
        assert_eq!(var.read_atomic(), 100);
    }
}
