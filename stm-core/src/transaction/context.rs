// Copyright 2015-2016 rust-stm Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The transaction log and commit protocol.
//!
//! `Transaction` tracks every ref an attempt has read, written or commuted,
//! keyed by the ref's stable id in a `BTreeMap` — this doubles as the
//! attempt's own access order (ids are unique within one map) and as a
//! deterministic, deadlock-free lock acquisition order across concurrently
//! committing transactions.
//!
//! Commit is two-phase: validate every optimistic read and take whatever
//! write locks are still outstanding (phase 1), fold deferred commutes
//! against the live value (phase 2), then publish every write under a
//! single new commit version and release every held lock (phases 3-4). A
//! failure in phase 1 or 2 releases whatever this attempt newly locked and
//! reports the conflict back to the executor for a retry; nothing is ever
//! partially published. A read-only attempt (nothing in the write or
//! commute log) skips phase 3 entirely and never advances the clock.
//!
//! Every attempt also carries a `read_version`, the clock value observed at
//! its start: an optimistic read failing that check aborts before a torn,
//! inconsistent snapshot can spread into the rest of the attempt.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::trace;

use crate::clock::GLOBAL_CLOCK;
use crate::config::{IsolationLevel, TransactionConfig};
use crate::error::{StmError, StmFailure, StmResult};
use crate::lock_word::LockMode;
use crate::speculative::SpeculativeLevel;
use crate::transaction::control_block::Latch;
use crate::transaction::log_var::LogEntry;
use crate::tvar::TVar;
use crate::var_control_block::{ArcAny, VarControlBlock};

static NEXT_TX_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxStatus {
    Active,
    Prepared,
    Committed,
    Aborted,
}

type Log = BTreeMap<u64, (Arc<VarControlBlock>, LogEntry)>;
type CommuteLog = BTreeMap<u64, (Arc<VarControlBlock>, Vec<Box<dyn FnOnce(ArcAny) -> ArcAny + Send>>)>;

/// One attempt's worth of reads, writes and commutes, plus the bookkeeping
/// needed to commit, retry, or recombine via `or`.
pub struct Transaction {
    id: u64,
    config: TransactionConfig,
    log: Log,
    commutes: CommuteLog,
    /// Read-dependencies salvaged from a discarded `or` branch, kept only so
    /// a later `retry()` can still wait on them.
    extra_retry_watches: Vec<(Arc<VarControlBlock>, u64)>,
    status: Cell<TxStatus>,
    poison: RefCell<Option<StmFailure>>,
    speculative_failure: Cell<bool>,
    speculative: Cell<SpeculativeLevel>,
    /// The clock value observed at the start of this attempt. Every
    /// optimistic read is validated against this snapshot so the attempt
    /// never mixes values from two different commit points, even while it
    /// is still doomed to a later conflict.
    read_version: u64,
}

impl Transaction {
    pub(crate) fn new(config: TransactionConfig) -> Self {
        Transaction {
            id: NEXT_TX_ID.fetch_add(1, Ordering::Relaxed),
            config,
            log: BTreeMap::new(),
            commutes: BTreeMap::new(),
            extra_retry_watches: Vec::new(),
            status: Cell::new(TxStatus::Active),
            poison: RefCell::new(None),
            speculative_failure: Cell::new(false),
            speculative: Cell::new(SpeculativeLevel::Lean),
            read_version: GLOBAL_CLOCK.read(),
        }
    }

    pub(crate) fn config(&self) -> &TransactionConfig {
        &self.config
    }

    pub(crate) fn speculative_level(&self) -> SpeculativeLevel {
        self.speculative.get()
    }

    pub(crate) fn escalate_speculative(&self) {
        self.speculative.set(self.speculative.get().escalate());
    }

    /// A `SpeculativeFailure` happened this attempt: the log outgrew the
    /// current ladder rung. The executor must not count this against
    /// `max_retries`.
    pub(crate) fn take_speculative_failure(&self) -> bool {
        self.speculative_failure.replace(false)
    }

    pub(crate) fn take_poison(&self) -> Option<StmFailure> {
        self.poison.borrow_mut().take()
    }

    fn downcast<T: Any + Clone>(value: ArcAny) -> T {
        match value.downcast_ref::<T>() {
            Some(v) => v.clone(),
            None => unreachable!("TVar has wrong type"),
        }
    }

    fn check_active(&self) -> StmResult<()> {
        match self.status.get() {
            TxStatus::Active => Ok(()),
            TxStatus::Prepared => {
                *self.poison.borrow_mut() = Some(StmFailure::PreparedTransaction);
                Err(StmError::Failure)
            }
            TxStatus::Committed | TxStatus::Aborted => {
                *self.poison.borrow_mut() = Some(StmFailure::DeadTransaction);
                Err(StmError::Failure)
            }
        }
    }

    fn note_access(&self) {
        let touched = self.log.len() + self.commutes.len();
        if self.speculative.get().exceeded(touched) {
            self.speculative_failure.set(true);
        }
    }

    /// Read a var's value, recording the dependency unless it was already
    /// logged by a prior access in this same attempt.
    pub(crate) fn read<T: Any + Send + Sync + Clone>(&mut self, var: &TVar<T>) -> StmResult<T> {
        self.check_active()?;
        let vcb = var.control_block().clone();
        let id = vcb.id();

        let read_version = self.read_version;
        let value = match self.log.entry(id) {
            Entry::Occupied(mut e) => e.get_mut().1.read(),
            Entry::Vacant(e) => {
                let configured = self.config.read_lock_mode;
                let (value, version) = if configured == LockMode::None {
                    let (value, version) = vcb.snapshot();
                    // Opacity: an optimistic read must never observe a
                    // commit that happened after this attempt began, even
                    // though commit-time revalidation would later catch it
                    // as an ordinary conflict.
                    if version > read_version {
                        return Err(StmError::Failure);
                    }
                    (value, version)
                } else {
                    vcb.open_for_read(self.id, configured).map_err(|_| StmError::Failure)?
                };
                e.insert((
                    vcb,
                    LogEntry::Read {
                        value: value.clone(),
                        version,
                        lock_mode: configured,
                    },
                ));
                value
            }
        };
        self.note_access();
        if self.speculative_failure.get() {
            return Err(StmError::Failure);
        }
        Ok(Transaction::downcast(value))
    }

    /// Write a value, buffered until commit.
    pub(crate) fn write<T: Any + Send + Sync + Clone>(
        &mut self,
        var: &TVar<T>,
        value: T,
    ) -> StmResult<()> {
        self.check_active()?;
        if self.config.readonly {
            *self.poison.borrow_mut() = Some(StmFailure::ReadonlyViolation);
            return Err(StmError::Failure);
        }

        let vcb = var.control_block().clone();
        let id = vcb.id();
        let boxed: ArcAny = Arc::new(value);
        let configured = self.config.write_lock_mode;

        match self.log.entry(id) {
            Entry::Occupied(mut e) => {
                let held = e.get_mut().1.lock_mode();
                if configured.strength() > held.strength() {
                    vcb.open_for_write(self.id, configured).map_err(|_| StmError::Failure)?;
                    e.get_mut().1.strengthen_lock(configured);
                }
                e.get_mut().1.write(boxed);
            }
            Entry::Vacant(e) => {
                if configured != LockMode::None {
                    vcb.open_for_write(self.id, configured).map_err(|_| StmError::Failure)?;
                }
                e.insert((
                    vcb,
                    LogEntry::Write {
                        value: boxed,
                        lock_mode: configured,
                    },
                ));
            }
        }
        self.note_access();
        if self.speculative_failure.get() {
            return Err(StmError::Failure);
        }
        Ok(())
    }

    /// Apply `f` commutatively: deferred until commit, applied against
    /// whatever value is live at that point, unless this attempt already
    /// has some other dependency on the ref — in which case it degrades
    /// immediately to an ordinary read-modify-write, since commutativity
    /// buys nothing once the intermediate value is already observed.
    pub(crate) fn commute<T, F>(&mut self, var: &TVar<T>, f: F) -> StmResult<()>
    where
        T: Any + Send + Sync + Clone,
        F: FnOnce(T) -> T + Send + 'static,
    {
        self.check_active()?;
        if self.config.readonly {
            *self.poison.borrow_mut() = Some(StmFailure::ReadonlyViolation);
            return Err(StmError::Failure);
        }

        let vcb = var.control_block().clone();
        let id = vcb.id();

        if let Entry::Occupied(mut e) = self.log.entry(id) {
            let current = Transaction::downcast::<T>(e.get_mut().1.read());
            e.get_mut().1.write(Arc::new(f(current)));
            return Ok(());
        }

        let boxed_fn: Box<dyn FnOnce(ArcAny) -> ArcAny + Send> = Box::new(move |v: ArcAny| {
            Arc::new(f(Transaction::downcast::<T>(v))) as ArcAny
        });
        self.commutes
            .entry(id)
            .or_insert_with(|| (vcb, Vec::new()))
            .1
            .push(boxed_fn);
        self.note_access();
        if self.speculative_failure.get() {
            return Err(StmError::Failure);
        }
        Ok(())
    }

    /// Run `first`; if it calls `retry()`, roll back to a clean log and run
    /// `second` instead. If both retry, their read-dependencies are merged
    /// so the eventual blocking wait watches every ref either branch read.
    pub fn or<T, F1, F2>(&mut self, first: F1, second: F2) -> StmResult<T>
    where
        F1: FnOnce(&mut Transaction) -> StmResult<T>,
        F2: FnOnce(&mut Transaction) -> StmResult<T>,
    {
        let backup = self.log.clone();

        match first(self) {
            Err(StmError::Retry) => {
                let attempted = std::mem::replace(&mut self.log, backup);
                for (id, (vcb, entry)) in attempted {
                    // `backup` is restored as the new `self.log`; any lock
                    // this attempt took or strengthened on `id` while running
                    // `first` beyond what `backup` already records would
                    // otherwise be held forever, since the entry that
                    // remembers it is about to be dropped.
                    let retained = self
                        .log
                        .get(&id)
                        .map(|(_, e)| e.lock_mode())
                        .unwrap_or(LockMode::None);
                    if entry.lock_mode() != LockMode::None && entry.lock_mode() != retained {
                        vcb.restore_lock(self.id, retained);
                    }
                    if let Some((_, version)) = entry.read_dependency() {
                        self.extra_retry_watches.push((vcb, version));
                    }
                }
                self.commutes.clear();

                match second(self) {
                    Err(StmError::Failure) => Err(StmError::Failure),
                    other => other,
                }
            }
            other => other,
        }
    }

    /// Validate reads, finalize commutes, publish writes and release every
    /// lock this attempt holds. Returns `false` on a conflict (nothing was
    /// published; the caller should retry the whole attempt).
    pub(crate) fn commit(&mut self) -> bool {
        self.status.set(TxStatus::Prepared);

        // `Snapshot` skips the final read-set revalidation pass below: an
        // opt-in relaxation of the default `Serialized` (full opacity)
        // isolation level, per spec's recommendation to default to opacity.
        let skip_revalidation = self.config.isolation_level == IsolationLevel::Snapshot;

        let mut locked_here: Vec<Arc<VarControlBlock>> = Vec::new();

        for (vcb, entry) in self.log.values() {
            match entry {
                LogEntry::Read { version, lock_mode, .. } => {
                    if *lock_mode == LockMode::None && !skip_revalidation {
                        if let Err(kind) = vcb.prepare(*version) {
                            trace!(id = self.id, kind = kind.as_str(), "commit conflict");
                            self.abort_partial(&locked_here);
                            return false;
                        }
                    }
                }
                LogEntry::Write { lock_mode, .. } => {
                    if *lock_mode == LockMode::None {
                        match vcb.open_for_write(self.id, LockMode::Write) {
                            Ok(_) => locked_here.push(vcb.clone()),
                            Err(kind) => {
                                trace!(id = self.id, kind = kind.as_str(), "commit conflict");
                                self.abort_partial(&locked_here);
                                return false;
                            }
                        }
                    }
                }
                LogEntry::ReadWrite { version, lock_mode, .. } => {
                    if *lock_mode == LockMode::None {
                        if !skip_revalidation {
                            if let Err(kind) = vcb.prepare(*version) {
                                trace!(id = self.id, kind = kind.as_str(), "commit conflict");
                                self.abort_partial(&locked_here);
                                return false;
                            }
                        }
                        match vcb.open_for_write(self.id, LockMode::Write) {
                            Ok(_) => locked_here.push(vcb.clone()),
                            Err(kind) => {
                                trace!(id = self.id, kind = kind.as_str(), "commit conflict");
                                self.abort_partial(&locked_here);
                                return false;
                            }
                        }
                    }
                }
            }
        }

        let mut commute_writes: Vec<(Arc<VarControlBlock>, ArcAny)> = Vec::new();
        for (id, (vcb, funcs)) in std::mem::take(&mut self.commutes) {
            if self.log.contains_key(&id) {
                // Already tracked directly; `Transaction::commute` folds the
                // function into that entry instead of queuing it here.
                continue;
            }
            let current = match vcb.open_for_write(self.id, LockMode::Write) {
                Ok(v) => v,
                Err(_) => {
                    self.abort_partial(&locked_here);
                    return false;
                }
            };
            locked_here.push(vcb.clone());
            let value = funcs.into_iter().fold(current, |acc, f| f(acc));
            commute_writes.push((vcb, value));
        }

        // Only a commit that actually publishes something advances the
        // clock; a read-only attempt (empty writeLog and commuteLog) ticks
        // nothing, per spec §3/§4.D step 7.
        let read_only =
            commute_writes.is_empty() && self.log.values().all(|(_, entry)| entry.write_value().is_none());
        if !read_only {
            let new_version = GLOBAL_CLOCK.tick();
            for (vcb, entry) in self.log.values() {
                if let Some(value) = entry.write_value() {
                    vcb.publish(value.clone(), new_version);
                }
            }
            for (vcb, value) in &commute_writes {
                vcb.publish(value.clone(), new_version);
            }
        }

        for (vcb, entry) in self.log.values() {
            if entry.lock_mode() != LockMode::None {
                vcb.release(self.id, entry.write_value().is_some());
            }
        }
        for vcb in locked_here {
            vcb.release(self.id, true);
        }

        self.status.set(TxStatus::Committed);
        true
    }

    /// Release every pre-existing pessimistic lock this attempt holds on a
    /// logged ref (`read_lock_mode`/`write_lock_mode` configured to
    /// something other than `None`). Locks taken fresh during a single
    /// `commit()` call itself (`locked_here`) are tracked and released
    /// separately by the caller, since they are never present in the log
    /// with a non-`None` mode in the first place.
    fn release_log_locks(&self) {
        for (vcb, entry) in self.log.values() {
            if entry.lock_mode() != LockMode::None {
                vcb.release(self.id, false);
            }
        }
    }

    fn abort_partial(&self, locked_here: &[Arc<VarControlBlock>]) {
        self.release_log_locks();
        for vcb in locked_here {
            vcb.release(self.id, false);
        }
        self.status.set(TxStatus::Aborted);
    }

    /// Release every lock this attempt is still holding without publishing
    /// anything. Used before parking on a retry latch, so a blocked
    /// transaction never holds a lock that would starve the writer it is
    /// waiting on.
    pub(crate) fn release_for_retry(&self) {
        self.release_log_locks();
    }

    /// Build and register a latch on every ref this attempt (or a discarded
    /// `or` branch) has read. Returns `None` if there is nothing to wait on
    /// (`retry()` called with an empty read log).
    pub(crate) fn build_retry_latch(
        &self,
        interruptible: bool,
        timeout: Option<std::time::Duration>,
    ) -> Option<Arc<Latch>> {
        let mut watches: Vec<(Arc<VarControlBlock>, u64)> = self
            .log
            .values()
            .filter_map(|(vcb, entry)| entry.read_dependency().map(|(_, v)| (vcb.clone(), v)))
            .collect();
        watches.extend(self.extra_retry_watches.iter().cloned());

        if watches.is_empty() {
            return None;
        }

        let latch = Arc::new(Latch::new(interruptible, timeout));
        for (vcb, version) in watches {
            vcb.register_retry_listener(latch.clone(), version);
        }
        Some(latch)
    }

    /// Number of distinct refs this attempt has touched so far (reads,
    /// writes and commutes combined). Used by `atomicChecked` to refuse a
    /// closure that reached more than one ref.
    pub(crate) fn touched_len(&self) -> usize {
        self.log.len() + self.commutes.len()
    }

    /// Register a freshly allocated, not-yet-shared ref as already owned by
    /// this attempt via `openForConstruction`: the exclusive lock is granted
    /// unconditionally (no other transaction can hold a reference to `var`
    /// yet) and no read-log entry is recorded, so the ref's eventual
    /// publication at commit carries no read-version dependency to
    /// revalidate. Backs [`crate::tvar::TVar::new_in`].
    pub(crate) fn construct<T: Any + Send + Sync + Clone>(
        &mut self,
        var: &TVar<T>,
    ) -> StmResult<()> {
        self.check_active()?;
        let vcb = var.control_block().clone();
        let id = vcb.id();
        let value = vcb.open_for_construction(self.id);
        self.log.insert(
            id,
            (
                vcb,
                LogEntry::Write {
                    value,
                    lock_mode: LockMode::Exclusive,
                },
            ),
        );
        self.note_access();
        if self.speculative_failure.get() {
            return Err(StmError::Failure);
        }
        Ok(())
    }

    /// Ensure this attempt holds at least `mode` on `var`, without changing
    /// whatever value is currently logged for it. Used by
    /// `TVar::get_and_lock`/`set_and_lock`/`get_and_set_and_lock` to force a
    /// pessimistic lock ahead of the configured default.
    pub(crate) fn ensure_lock<T: Any + Send + Sync + Clone>(
        &mut self,
        var: &TVar<T>,
        mode: LockMode,
    ) -> StmResult<()> {
        self.check_active()?;
        if mode == LockMode::None {
            return Ok(());
        }
        let vcb = var.control_block().clone();
        let id = vcb.id();
        match self.log.entry(id) {
            Entry::Occupied(mut e) => {
                let held = e.get_mut().1.lock_mode();
                if mode.strength() > held.strength() {
                    if mode.strength() >= LockMode::Write.strength() {
                        vcb.open_for_write(self.id, mode).map_err(|_| StmError::Failure)?;
                    } else {
                        vcb.open_for_read(self.id, mode).map_err(|_| StmError::Failure)?;
                    }
                    e.get_mut().1.strengthen_lock(mode);
                }
            }
            Entry::Vacant(e) => {
                let (value, version) = if mode.strength() >= LockMode::Write.strength() {
                    let value = vcb.open_for_write(self.id, mode).map_err(|_| StmError::Failure)?;
                    let version = vcb.current_version();
                    (value, version)
                } else {
                    vcb.open_for_read(self.id, mode).map_err(|_| StmError::Failure)?
                };
                e.insert((
                    vcb,
                    LogEntry::Read {
                        value,
                        version,
                        lock_mode: mode,
                    },
                ));
            }
        }
        self.note_access();
        if self.speculative_failure.get() {
            return Err(StmError::Failure);
        }
        Ok(())
    }

    /// Reset all per-attempt state before retrying. The speculative ladder
    /// rung is deliberately *not* reset here: it tracks the logical
    /// transaction across attempts, not a single attempt.
    ///
    /// Releases any pessimistic lock still held on a logged ref first: a
    /// plain conflict (`StmError::Failure`) or a user abort never runs
    /// `commit()` or `release_for_retry()`, and without this every attempt
    /// under a non-`None` lock mode would leak the lock it took on its very
    /// first access. Idempotent with whichever of those two already ran, so
    /// it is safe to call unconditionally on every path that discards an
    /// attempt without publishing it.
    pub(crate) fn clear(&mut self) {
        self.release_log_locks();
        self.log.clear();
        self.commutes.clear();
        self.extra_retry_watches.clear();
        self.status.set(TxStatus::Active);
        self.speculative_failure.set(false);
        *self.poison.borrow_mut() = None;
        self.read_version = GLOBAL_CLOCK.read();
    }
}
