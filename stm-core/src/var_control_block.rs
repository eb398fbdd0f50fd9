// Copyright 2015-2016 rust-stm Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The ref cell: a [`VarControlBlock`] per [`crate::tvar::TVar`], holding the
//! authoritative value, version stamp and lock state behind a
//! `parking_lot::Mutex`, plus a lock-free [`FastWord`] mirror for relaxed
//! reads.
//!
//! A cell's lock state only ever strengthens within the holding transaction
//! (`None -> Read -> Write -> Exclusive`), never weakens until `release`.
//! `Read -> Write` is only permitted in place when the cell has exactly one
//! reader and that reader is the upgrading transaction; any other reader
//! makes the owner ambiguous and the upgrade is refused.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::ConflictKind;
use crate::lock_word::{FastWord, LockMode};
use crate::transaction::control_block::Latch;

pub(crate) type ArcAny = Arc<dyn Any + Send + Sync>;

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

struct CellState {
    value: ArcAny,
    version: u64,
    lock_mode: LockMode,
    readers: u32,
    /// The sole transaction allowed to upgrade a `Read` lock, or the
    /// transaction presently holding `Write`/`Exclusive`. `None` whenever
    /// more than one reader holds the cell, since ownership is then
    /// ambiguous.
    owner: Option<u64>,
    listeners: Vec<Arc<Latch>>,
}

/// The control block backing a `TVar`. Compared by `id`, not by address, so
/// that lock acquisition order across refs is stable across runs and
/// processes rather than tied to allocator behavior.
pub struct VarControlBlock {
    id: u64,
    state: Mutex<CellState>,
    fast: FastWord,
}

impl VarControlBlock {
    /// Create a new, unshared cell holding `val` at version 0.
    pub fn new<T>(val: T) -> Arc<VarControlBlock>
    where
        T: Any + Sync + Send,
    {
        Arc::new(VarControlBlock {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(CellState {
                value: Arc::new(val),
                version: 0,
                lock_mode: LockMode::None,
                readers: 0,
                owner: None,
                listeners: Vec::new(),
            }),
            fast: FastWord::new(0, LockMode::None),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    fn sync_fast(&self, state: &CellState) {
        self.fast.store(state.version, state.lock_mode);
    }

    /// Non-transactional read of the current value, bypassing any log.
    pub(crate) fn read_ref_atomic(&self) -> ArcAny {
        self.state.lock().value.clone()
    }

    /// Relaxed read that establishes no transactional dependency. Shares the
    /// same critical section as `read_ref_atomic`; the distinction is in the
    /// caller's contract, not the implementation, since the value itself can
    /// only ever be read out from behind the mutex.
    pub(crate) fn atomic_weak_get(&self) -> ArcAny {
        self.state.lock().value.clone()
    }

    pub(crate) fn current_version(&self) -> u64 {
        self.fast.load_version()
    }

    /// Snapshot `(value, version)` without taking or upgrading any lock.
    /// Used by `Transaction::read` under the default `read_lock_mode: None`:
    /// the read is purely optimistic and is revalidated against this version
    /// at commit.
    pub(crate) fn snapshot(&self) -> (ArcAny, u64) {
        let state = self.state.lock();
        (state.value.clone(), state.version)
    }

    /// Open for read under an explicit (non-`None`) lock mode, holding the
    /// lock until the transaction calls `release`.
    pub(crate) fn open_for_read(
        &self,
        tx_id: u64,
        lock_mode: LockMode,
    ) -> Result<(ArcAny, u64), ConflictKind> {
        debug_assert_ne!(lock_mode, LockMode::None, "use snapshot() for unlocked reads");
        let mut state = self.state.lock();
        match state.lock_mode {
            LockMode::None => {
                state.lock_mode = LockMode::Read;
                state.readers = 1;
                state.owner = Some(tx_id);
            }
            LockMode::Read => {
                state.readers += 1;
                if state.owner != Some(tx_id) {
                    state.owner = None;
                }
            }
            LockMode::Write | LockMode::Exclusive if state.owner == Some(tx_id) => {
                // Already held at least as strongly by this transaction.
            }
            _ => return Err(ConflictKind::LockNotFree),
        }
        self.sync_fast(&state);
        Ok((state.value.clone(), state.version))
    }

    /// Open for write, acquiring `lock_mode` (`Write` or `Exclusive`)
    /// immediately and holding it until `release`. Returns the current value
    /// so a caller implementing read-modify-write (e.g. `commute`
    /// degradation) does not need a separate read.
    pub(crate) fn open_for_write(
        &self,
        tx_id: u64,
        lock_mode: LockMode,
    ) -> Result<ArcAny, ConflictKind> {
        let mut state = self.state.lock();
        match state.lock_mode {
            LockMode::None => {
                state.lock_mode = lock_mode;
                state.owner = Some(tx_id);
                state.readers = 0;
            }
            LockMode::Read if state.readers == 1 && state.owner == Some(tx_id) => {
                state.lock_mode = lock_mode;
            }
            LockMode::Write | LockMode::Exclusive if state.owner == Some(tx_id) => {
                if lock_mode.strength() > state.lock_mode.strength() {
                    state.lock_mode = lock_mode;
                }
            }
            _ => return Err(ConflictKind::LockNotFree),
        }
        self.sync_fast(&state);
        Ok(state.value.clone())
    }

    /// Open a freshly allocated, not-yet-shared cell for construction inside
    /// a transaction. No other transaction can hold a reference to `self`
    /// yet, so the exclusive lock is granted unconditionally.
    pub(crate) fn open_for_construction(&self, tx_id: u64) -> ArcAny {
        let mut state = self.state.lock();
        state.lock_mode = LockMode::Exclusive;
        state.owner = Some(tx_id);
        state.readers = 0;
        self.sync_fast(&state);
        state.value.clone()
    }

    /// Revalidate a purely optimistic read (one taken via `snapshot`, never
    /// locked) against the version it observed. Called during commit.
    pub(crate) fn prepare(&self, expected_version: u64) -> Result<(), ConflictKind> {
        let state = self.state.lock();
        if state.version == expected_version {
            Ok(())
        } else {
            Err(ConflictKind::ReadConflict)
        }
    }

    /// Publish a new value at `new_version`. The caller must already hold
    /// `Write`/`Exclusive` on this cell (via `open_for_write` or
    /// `open_for_construction`); the lock itself is released separately by
    /// [`Self::release`] so that readers are only unblocked once every ref
    /// in the transaction has been published.
    pub(crate) fn publish(&self, new_value: ArcAny, new_version: u64) {
        let mut state = self.state.lock();
        state.value = new_value;
        state.version = new_version;
        self.sync_fast(&state);
    }

    /// Release whatever lock `tx_id` holds on this cell. When `signal` is
    /// set (a write was published here), every registered retry listener is
    /// woken; otherwise listeners are left registered for a later write.
    pub(crate) fn release(&self, tx_id: u64, signal: bool) {
        let mut state = self.state.lock();
        match state.lock_mode {
            LockMode::Read if state.readers > 0 => {
                state.readers -= 1;
                if state.readers == 0 {
                    state.lock_mode = LockMode::None;
                    state.owner = None;
                } else if state.owner == Some(tx_id) {
                    state.owner = None;
                }
            }
            LockMode::Write | LockMode::Exclusive if state.owner == Some(tx_id) => {
                state.lock_mode = LockMode::None;
                state.owner = None;
                state.readers = 0;
            }
            _ => {}
        }
        self.sync_fast(&state);
        if signal {
            let listeners = std::mem::take(&mut state.listeners);
            drop(state);
            for latch in listeners {
                latch.signal();
            }
        }
    }

    /// Undo a lock strengthening this transaction performed during a
    /// branch of `or` that retried and is being discarded, dropping back to
    /// `target_mode` (whatever this transaction held on the cell before
    /// that branch ran). `target_mode` must be no stronger than the lock
    /// currently held; a `None` target fully releases, matching `release`.
    pub(crate) fn restore_lock(&self, tx_id: u64, target_mode: LockMode) {
        let mut state = self.state.lock();
        if state.owner != Some(tx_id) {
            return;
        }
        match target_mode {
            LockMode::None => {
                state.lock_mode = LockMode::None;
                state.owner = None;
                state.readers = 0;
            }
            LockMode::Read => {
                state.lock_mode = LockMode::Read;
                state.readers = 1;
                state.owner = Some(tx_id);
            }
            LockMode::Write | LockMode::Exclusive => {
                state.lock_mode = target_mode;
            }
        }
        self.sync_fast(&state);
    }

    /// Register a latch to be woken on the next write to this cell. If the
    /// cell's version has already advanced past `observed_version` (the
    /// registering transaction raced a concurrent writer between its abort
    /// and this call), the latch is signalled immediately instead of parked
    /// on forever.
    pub(crate) fn register_retry_listener(&self, latch: Arc<Latch>, observed_version: u64) {
        let mut state = self.state.lock();
        let current_version = state.version;
        if current_version > observed_version {
            drop(state);
            latch.signal_if_stale(observed_version, current_version);
        } else {
            state.listeners.push(latch);
        }
    }
}

impl PartialEq for VarControlBlock {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for VarControlBlock {}

impl Ord for VarControlBlock {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.id.cmp(&other.id)
    }
}

impl PartialOrd for VarControlBlock {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
