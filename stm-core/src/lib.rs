//! This library implements
//! [software transactional memory](https://en.wikipedia.org/wiki/Software_transactional_memory),
//! often abbreviated with STM.
//!
//! It is designed closely to haskell's STM library. Read Simon Marlow's
//! *Parallel and Concurrent Programming in Haskell* for more info. Especially
//! the chapter about performance is also important for using STM in rust.
//!
//! With locks the sequential composition of two threadsafe actions is no
//! longer threadsafe, because other threads may interfere in between of
//! these actions. Applying a third lock to protect both may lead to common
//! sources of errors like deadlocks or race conditions.
//!
//! Unlike locks, software transactional memory is composable. It is
//! typically implemented by writing all read and write operations in a log.
//! When the action has finished and all the used `TVar`s are consistent, the
//! writes are committed as a single atomic operation. Otherwise the
//! computation repeats. This may lead to starvation, but avoids common
//! sources of bugs.
//!
//! Unlike the classic TL2-style design this library starts every attempt
//! optimistic and lock-free ([`LockMode::None`], the configured default),
//! but lets a caller dial in pessimistic locking per-ref
//! ([`TVar::get_and_lock`]/[`TVar::set_and_lock`]) or per-transaction
//! ([`TransactionConfig::with_read_lock_mode`]/`with_write_lock_mode`) where
//! contention makes that the better trade. A transaction also escalates
//! through a speculative ladder ([`SpeculativeLevel`]) as its log grows,
//! independent of and without counting against `max_retries`.
//!
//! Panicking within STM does not poison the `TVar`s. STM ensures consistency
//! by never committing on panic.
//!
//! # Usage
//!
//! You should only use the functions that are transaction-safe.
//! Transaction-safe functions don't have side effects, except those provided
//! by `TVar`. Mutexes and other blocking mechanisms are especially
//! dangerous, because they can interfere with the internal locking scheme of
//! the transaction and therefore cause deadlocks.
//!
//! Note that transaction-safety does *not* mean safety in the rust sense,
//! but is a subset of allowed behavior. Even if code is not
//! transaction-safe, no segmentation faults will happen.
//!
//! You can run the top-level atomic operation by calling `atomically`.
//!
//! ```
//! # use stm_core::atomically;
//! atomically(|trans| {
//!     // some action
//!     // return value as `Result`, for example
//!     Ok(42)
//! });
//! ```
//!
//! A nested call to `atomically` joins the enclosing transaction rather than
//! starting a fresh one ([`Propagation::Requires`] is the implicit default
//! `execute` uses under the hood); see [`execute`] to control that directly.
//! Instead of using `atomically` internally, add a `&mut Transaction`
//! parameter and return `StmResult`.
//!
//! Use `?` on `StmResult` to propagate a transaction error through the
//! system. Do not handle the error yourself.
//!
//! ```
//! # use stm_core::{atomically, TVar};
//! let var = TVar::new(0);
//!
//! let x = atomically(|trans| {
//!     var.set(trans, 42)?; // Pass failure to parent.
//!     var.get(trans) // Return the value saved in var.
//! });
//!
//! println!("var = {}", x);
//! // var = 42
//! ```
//!
//! # Transaction safety
//!
//! Software transactional memory is completely safe in the rust sense, so
//! undefined behavior will never occur. Still there are multiple rules that
//! you should obey when dealing with software transactional memory.
//!
//! * Don't run code with side effects, especially no IO-code. Transactions
//!   repeat in failure cases. Using IO would repeat this IO-code. Return a
//!   closure if you have to.
//! * Don't handle `StmResult` yourself. Use [`Transaction::or`] (or the
//!   [`optionally`] helper) to combine alternative paths. Always use `?` and
//!   never ignore a `StmResult`.
//! * Don't mix locks and transactions. Your code will easily deadlock or
//!   slow down unpredictably.
//! * Don't use inner mutability to change the content of a `TVar`.
//!
//! Panicking in a transaction is transaction-safe. The transaction aborts
//! and all changes are discarded. No poisoning or half written transactions
//! happen.
//!
//! # Speed
//!
//! Generally keep your atomic blocks as small as possible, because the more
//! time you spend, the more likely it is to collide with other threads.
//! Every used `TVar` increases the chance of collisions. Therefore you
//! should keep the amount of accessed variables as low as needed.

// Extra linting with exceptions
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::should_panic_without_expect)]

extern crate parking_lot;

mod clock;
mod config;
mod error;
mod executor;
mod lock_word;
mod speculative;
mod transaction;
mod tvar;
mod var_control_block;

#[cfg(test)]
mod testing;

pub use config::{IsolationLevel, Propagation, TransactionConfig};
pub use error::{StmError, StmFailure, StmResult, TransactionClosureResult, TransactionError};
pub use executor::{atomic_checked, execute, execute_with_control, TransactionControl};
pub use lock_word::LockMode;
pub use speculative::SpeculativeLevel;
pub use transaction::context::Transaction;
pub use tvar::TVar;

/// Convert a `TransactionClosureResult<T, E_A>` to `TransactionClosureResult<T, E_B>`.
///
/// Used to cleanly write transactions where more than one kind of error is
/// possible during execution. Will not fail as long as the target error
/// `$to` implements `From<E>`, `E` being the error possibly returned by
/// `$op`. It expands to:
///
/// ```ignore
/// $op.map_err(|e| match e {
///         stm_core::TransactionError::Abort(e) => stm_core::TransactionError::Abort($to::from(e)),
///         stm_core::TransactionError::Stm(e) => stm_core::TransactionError::Stm(e),
///     })?
/// ```
///
/// # Example
///
/// ```rust
/// # use stm_core::{atomically_with_err, try_or_coerce, Transaction, TransactionClosureResult};
///
/// struct Error1;
/// struct Error2;
///
/// impl From<Error1> for Error2 {
///     fn from(_: Error1) -> Self {
///         Error2
///     }
/// }
///
/// fn op1(_trans: &mut Transaction) -> TransactionClosureResult<(), Error1> {
///     Ok(())
/// }
///
/// fn op2(_trans: &mut Transaction) -> TransactionClosureResult<(), Error2> {
///     Ok(())
/// }
///
/// let res: Result<(), Error2> = atomically_with_err(|trans| {
///     try_or_coerce!(op1(trans), Error2);
///     op2(trans)?;
///     Ok(())
/// });
/// ```
#[macro_export]
macro_rules! try_or_coerce {
    ($op: expr, $to: ident) => {
        $op.map_err(|e| match e {
            $crate::TransactionError::Abort(e) => $crate::TransactionError::Abort($to::from(e)),
            $crate::TransactionError::Stm(e) => $crate::TransactionError::Stm(e),
        })?
    };
}

#[inline]
/// Call `abort` to abort a transaction and pass the error as the return value.
///
/// # Examples
///
/// ```
/// # use stm_core::*;
/// struct MyError;
///
/// let execute_once: Result<u32, _> = atomically_with_err(|_| {
///     abort(MyError)
/// });
///
/// assert!(execute_once.is_err());
/// ```
pub fn abort<T, E>(e: E) -> TransactionClosureResult<T, E> {
    Err(TransactionError::Abort(e))
}

#[inline]
/// Call `retry` to abort an operation and run the whole transaction again.
///
/// Semantically `retry` allows spin-lock-like behavior, but the library
/// blocks until one of the used `TVar`s has changed, to keep CPU-usage low.
///
/// `Transaction::or` allows defining alternatives. If the first function
/// wants to retry, the second one gets a chance to run.
///
/// # Examples
///
/// ```no_run
/// # use stm_core::*;
/// let infinite_retry: i32 = atomically(|_| retry());
/// ```
pub fn retry<T>() -> StmResult<T> {
    Err(StmError::Retry)
}

/// Run a function atomically using software transactional memory, retrying
/// forever on conflict or blocking retry. For a bounded retry budget or
/// explicit control over propagation, use [`execute`] directly.
pub fn atomically<T, F>(f: F) -> T
where
    F: Fn(&mut Transaction) -> StmResult<T>,
{
    executor::run_unbounded(f)
}

/// Run a function atomically, letting the closure abort with a user error
/// via [`abort`]. Otherwise behaves like [`atomically`].
pub fn atomically_with_err<T, E, F>(f: F) -> Result<T, E>
where
    F: Fn(&mut Transaction) -> TransactionClosureResult<T, E>,
{
    executor::run_unbounded_fallible(f)
}

#[inline]
/// Unwrap `Option` or call retry if it is `None`.
///
/// `optionally` is the inverse of `unwrap_or_retry`.
///
/// # Example
///
/// ```
/// # use stm_core::*;
/// let x = TVar::new(Some(42));
///
/// atomically(|tx| {
///         let inner = unwrap_or_retry(x.get(tx)?)?;
///         assert_eq!(inner, 42); // inner is always 42.
///         Ok(inner)
///     }
/// );
/// ```
pub fn unwrap_or_retry<T>(option: Option<T>) -> StmResult<T> {
    match option {
        Some(x) => Ok(x),
        None => retry(),
    }
}

#[inline]
/// Retry until `cond` is true.
///
/// # Example
///
/// ```
/// # use stm_core::*;
/// let var = TVar::new(42);
///
/// let x = atomically(|tx| {
///     let v = var.get(tx)?;
///     guard(v==42)?;
///     // v is now always 42.
///     Ok(v)
/// });
/// assert_eq!(x, 42);
/// ```
pub fn guard(cond: bool) -> StmResult<()> {
    if cond {
        Ok(())
    } else {
        retry()
    }
}

#[inline]
/// Optionally run a transaction `f`. If `f` fails with a `retry()`, it does
/// not cancel the whole transaction, but returns `None`.
///
/// Note that `optionally` does not always recover the function, if
/// inconsistencies were found.
///
/// `unwrap_or_retry` is the inverse of `optionally`.
///
/// # Example
///
/// ```
/// # use stm_core::*;
/// let x: Option<i32> = atomically(|tx| optionally(tx, |_| retry()));
/// assert_eq!(x, None);
/// ```
pub fn optionally<T, F>(tx: &mut Transaction, f: F) -> StmResult<Option<T>>
where
    F: Fn(&mut Transaction) -> StmResult<T>,
{
    tx.or(|t| f(t).map(Some), |_| Ok(None))
}
