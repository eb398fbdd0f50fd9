// Copyright 2015-2016 rust-stm Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! `TVar<T>`: the typesafe handle applications actually hold. Everything
//! here is a thin, generic wrapper around either [`Transaction`]'s log
//! methods or, for the `atomic_*` family, a single-ref transaction run
//! through [`crate::executor::atomic_checked`].

use std::any::Any;
use std::fmt::{self, Debug};
use std::marker::PhantomData;
use std::ops::{Add, Sub};
use std::sync::Arc;

use crate::config::TransactionConfig;
use crate::error::{StmError, StmResult};
use crate::executor;
use crate::lock_word::LockMode;
use crate::transaction::context::Transaction;
use crate::var_control_block::VarControlBlock;

/// A variable that can be used inside an STM transaction.
#[derive(Clone)]
pub struct TVar<T> {
    control_block: Arc<VarControlBlock>,
    _marker: PhantomData<T>,
}

impl<T> TVar<T>
where
    T: Any + Sync + Send + Clone,
{
    /// Create a new `TVar` outside of any transaction.
    pub fn new(val: T) -> TVar<T> {
        TVar {
            control_block: VarControlBlock::new(val),
            _marker: PhantomData,
        }
    }

    pub(crate) fn control_block(&self) -> &Arc<VarControlBlock> {
        &self.control_block
    }

    #[allow(clippy::missing_panics_doc)]
    /// Read a value atomically, without starting a transaction. Semantically
    /// equivalent to `atomically(|tx| var.get(tx))`, but cheaper.
    pub fn read_atomic(&self) -> T {
        let val = self.read_ref_atomic();
        (&*val as &dyn Any)
            .downcast_ref::<T>()
            .expect("wrong type in TVar<T>")
            .clone()
    }

    /// Read a value atomically and return the boxed reference. Mostly for
    /// internal use; avoids the clone `read_atomic` performs.
    pub(crate) fn read_ref_atomic(&self) -> Arc<dyn Any + Send + Sync> {
        self.control_block.read_ref_atomic()
    }

    /// Check if two `TVar`s refer to the same cell.
    pub fn ref_eq(this: &TVar<T>, other: &TVar<T>) -> bool {
        Arc::ptr_eq(&this.control_block, &other.control_block)
    }

    /// Allocate a new ref from inside an active transaction, so its initial
    /// value only ever becomes visible as part of this attempt's own commit
    /// rather than the moment it is allocated. Uses `openForConstruction`:
    /// since no other transaction can yet hold a reference to the freshly
    /// created cell, the exclusive lock is granted unconditionally and the
    /// ref carries no read-log entry, so it adds no read-version dependency
    /// for commit to revalidate.
    pub fn new_in(transaction: &mut Transaction, value: T) -> StmResult<TVar<T>> {
        let var = TVar {
            control_block: VarControlBlock::new(value),
            _marker: PhantomData,
        };
        transaction.construct(&var)?;
        Ok(var)
    }

    // -- transactional API -------------------------------------------------

    /// Read the current value within a transaction.
    pub fn get(&self, transaction: &mut Transaction) -> StmResult<T> {
        transaction.read(self)
    }

    /// Buffer a write, visible to this transaction immediately but to no one
    /// else until commit.
    pub fn set(&self, transaction: &mut Transaction, value: T) -> StmResult<()> {
        transaction.write(self, value)
    }

    /// Like [`Self::get`], but forces the transaction to hold at least
    /// `mode` on this ref for the rest of the attempt instead of the
    /// configured default.
    pub fn get_and_lock(&self, transaction: &mut Transaction, mode: LockMode) -> StmResult<T> {
        transaction.ensure_lock(self, mode)?;
        transaction.read(self)
    }

    /// Like [`Self::set`], but forces the transaction to hold at least
    /// `mode` on this ref for the rest of the attempt.
    pub fn set_and_lock(
        &self,
        transaction: &mut Transaction,
        value: T,
        mode: LockMode,
    ) -> StmResult<()> {
        transaction.ensure_lock(self, mode)?;
        transaction.write(self, value)
    }

    /// Replace the value, returning the old one.
    pub fn replace(&self, transaction: &mut Transaction, value: T) -> StmResult<T> {
        let old = self.get(transaction)?;
        self.set(transaction, value)?;
        Ok(old)
    }

    /// Alias of [`Self::replace`] under the spec's naming.
    pub fn get_and_set(&self, transaction: &mut Transaction, value: T) -> StmResult<T> {
        self.replace(transaction, value)
    }

    /// Combined [`Self::get_and_set`] and [`Self::get_and_lock`].
    pub fn get_and_set_and_lock(
        &self,
        transaction: &mut Transaction,
        value: T,
        mode: LockMode,
    ) -> StmResult<T> {
        transaction.ensure_lock(self, mode)?;
        let old = transaction.read(self)?;
        transaction.write(self, value)?;
        Ok(old)
    }

    /// Modify the content with `f`, discarding the result.
    pub fn modify<F>(&self, transaction: &mut Transaction, f: F) -> StmResult<()>
    where
        F: FnOnce(T) -> T,
    {
        let old = self.get(transaction)?;
        self.set(transaction, f(old))
    }

    /// Apply `f`, write the result back, and return it.
    pub fn alter_and_get<F>(&self, transaction: &mut Transaction, f: F) -> StmResult<T>
    where
        F: FnOnce(T) -> T,
    {
        let old = self.get(transaction)?;
        let new = f(old);
        self.set(transaction, new.clone())?;
        Ok(new)
    }

    /// Apply `f`, write the result back, and return the value from before
    /// the change.
    pub fn get_and_alter<F>(&self, transaction: &mut Transaction, f: F) -> StmResult<T>
    where
        F: FnOnce(T) -> T,
    {
        let old = self.get(transaction)?;
        self.set(transaction, f(old.clone()))?;
        Ok(old)
    }

    /// Apply `f` commutatively: deferred to commit time unless this
    /// transaction already depends on the ref some other way.
    pub fn commute<F>(&self, transaction: &mut Transaction, f: F) -> StmResult<()>
    where
        F: FnOnce(T) -> T + Send + 'static,
    {
        transaction.commute(self, f)
    }

    /// Block (via `retry()`) until the value equals `expected`.
    pub fn await_value(&self, transaction: &mut Transaction, expected: T) -> StmResult<()>
    where
        T: PartialEq,
    {
        let current = self.get(transaction)?;
        if current == expected {
            Ok(())
        } else {
            Err(StmError::Retry)
        }
    }

    /// Block (via `retry()`) until `predicate` holds for the value.
    pub fn await_predicate<F>(&self, transaction: &mut Transaction, predicate: F) -> StmResult<()>
    where
        F: Fn(&T) -> bool,
    {
        let current = self.get(transaction)?;
        if predicate(&current) {
            Ok(())
        } else {
            Err(StmError::Retry)
        }
    }

    /// Write `new` only if the current value equals `expected`.
    pub fn compare_and_swap(
        &self,
        transaction: &mut Transaction,
        expected: T,
        new: T,
    ) -> StmResult<bool>
    where
        T: PartialEq,
    {
        let current = self.get(transaction)?;
        if current == expected {
            self.set(transaction, new)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Add `delta` to the current value, returning the new value.
    pub fn increment(&self, transaction: &mut Transaction, delta: T) -> StmResult<T>
    where
        T: Add<Output = T>,
    {
        let current = self.get(transaction)?;
        let next = current + delta;
        self.set(transaction, next.clone())?;
        Ok(next)
    }

    /// Subtract `delta` from the current value, returning the new value.
    pub fn decrement(&self, transaction: &mut Transaction, delta: T) -> StmResult<T>
    where
        T: Sub<Output = T>,
    {
        let current = self.get(transaction)?;
        let next = current - delta;
        self.set(transaction, next.clone())?;
        Ok(next)
    }

    // -- non-transactional API ---------------------------------------------

    /// Read the value as a single-ref atomic transaction.
    pub fn atomic_get(&self) -> T {
        let this = self.clone();
        executor::atomic_checked(TransactionConfig::default(), move |tx| this.get(tx))
            .expect("TVar::atomic_get only ever touches a single ref")
    }

    /// A relaxed, non-synchronizing read: establishes no transactional
    /// dependency and does not revalidate against any commit version. Useful
    /// for diagnostics or heuristics where a slightly stale value is fine.
    pub fn atomic_weak_get(&self) -> T {
        let val = self.control_block.atomic_weak_get();
        (&*val as &dyn Any)
            .downcast_ref::<T>()
            .expect("wrong type in TVar<T>")
            .clone()
    }

    /// Write the value as a single-ref atomic transaction.
    pub fn atomic_set(&self, value: T) {
        let this = self.clone();
        executor::atomic_checked(TransactionConfig::default(), move |tx| {
            this.set(tx, value.clone())
        })
        .expect("TVar::atomic_set only ever touches a single ref");
    }

    /// Atomically write `new` if the current value equals `expected`.
    pub fn atomic_compare_and_set(&self, expected: T, new: T) -> bool
    where
        T: PartialEq,
    {
        let this = self.clone();
        executor::atomic_checked(TransactionConfig::default(), move |tx| {
            this.compare_and_swap(tx, expected.clone(), new.clone())
        })
        .expect("TVar::atomic_compare_and_set only ever touches a single ref")
    }

    /// Atomically apply `f`, returning the new value.
    pub fn atomic_alter_and_get<F>(&self, f: F) -> T
    where
        F: Fn(T) -> T,
    {
        let this = self.clone();
        executor::atomic_checked(TransactionConfig::default(), move |tx| {
            this.alter_and_get(tx, |v| f(v))
        })
        .expect("TVar::atomic_alter_and_get only ever touches a single ref")
    }

    /// Atomically apply `f`, returning the value from before the change.
    pub fn atomic_get_and_alter<F>(&self, f: F) -> T
    where
        F: Fn(T) -> T,
    {
        let this = self.clone();
        executor::atomic_checked(TransactionConfig::default(), move |tx| {
            this.get_and_alter(tx, |v| f(v))
        })
        .expect("TVar::atomic_get_and_alter only ever touches a single ref")
    }
}

/// Debug output. Not read atomically with respect to concurrent writers;
/// wrap in `atomically` yourself first if a consistent snapshot matters.
impl<T> Debug for TVar<T>
where
    T: Any + Sync + Send + Clone + Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TVar").field("value", &self.read_atomic()).finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn read_atomic_roundtrips() {
        let var = TVar::new(42);
        assert_eq!(var.read_atomic(), 42);
    }

    #[test]
    fn ref_eq_distinguishes_cells() {
        let a = TVar::new(1);
        let b = a.clone();
        let c = TVar::new(1);
        assert!(TVar::ref_eq(&a, &b));
        assert!(!TVar::ref_eq(&a, &c));
    }

    #[test]
    fn atomic_get_and_set_roundtrip() {
        let var = TVar::new(1);
        var.atomic_set(2);
        assert_eq!(var.atomic_get(), 2);
    }

    #[test]
    fn atomic_weak_get_does_not_panic_under_contention() {
        let var = TVar::new(1);
        var.atomic_set(2);
        assert_eq!(var.atomic_weak_get(), 2);
    }

    #[test]
    fn atomic_compare_and_set_only_on_match() {
        let var = TVar::new(1);
        assert!(!var.atomic_compare_and_set(0, 9));
        assert_eq!(var.atomic_get(), 1);
        assert!(var.atomic_compare_and_set(1, 9));
        assert_eq!(var.atomic_get(), 9);
    }

    #[test]
    fn atomic_alter_and_get_applies_function() {
        let var = TVar::new(10);
        assert_eq!(var.atomic_alter_and_get(|x| x * 2), 20);
        assert_eq!(var.atomic_get(), 20);
    }

    #[test]
    fn new_in_folds_allocation_into_the_enclosing_commit() {
        let var = crate::atomically(|tx| TVar::new_in(tx, 5));
        assert_eq!(var.read_atomic(), 5);
    }

    #[test]
    fn increment_and_decrement() {
        let mut tx = Transaction::new(TransactionConfig::default());
        let var = TVar::new(10);
        assert_eq!(var.increment(&mut tx, 5).unwrap(), 15);
        assert_eq!(var.decrement(&mut tx, 3).unwrap(), 12);
    }
}
