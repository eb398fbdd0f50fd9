// Copyright 2015-2016 rust-stm Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! `LogEntry` tracks, per ref touched by one attempt, what the attempt has
//! done to it so far: read, written, or both. `Transaction` keys a
//! `BTreeMap<u64, LogEntry>` by ref id so that iteration order is both the
//! attempt's own insertion order (ids are unique per map) and a global,
//! deterministic acquisition order across transactions (lock acquisition
//! order is by stable ref id, which is deadlock-free).

use crate::lock_word::LockMode;
use crate::var_control_block::ArcAny;

/// What an attempt has recorded for a single ref so far.
#[derive(Clone)]
pub(crate) enum LogEntry {
    /// Read at `version`. `lock_mode` is `None` unless the read itself took
    /// an explicit pessimistic lock.
    Read {
        value: ArcAny,
        version: u64,
        lock_mode: LockMode,
    },

    /// Written with no dependency on the prior value; nothing to validate at
    /// commit beyond taking the write lock.
    Write { value: ArcAny, lock_mode: LockMode },

    /// Read at `version`, then written. `original`/`version` must still hold
    /// when this entry is validated at commit.
    ReadWrite {
        original: ArcAny,
        version: u64,
        value: ArcAny,
        lock_mode: LockMode,
    },
}

impl LogEntry {
    /// Return the value visible to subsequent reads in this same attempt
    /// (the most recent write, or the original read).
    pub(crate) fn read(&self) -> ArcAny {
        match self {
            LogEntry::Read { value, .. }
            | LogEntry::Write { value, .. }
            | LogEntry::ReadWrite { value, .. } => value.clone(),
        }
    }

    /// Record a write, upgrading a prior read into a `ReadWrite` if needed.
    pub(crate) fn write(&mut self, new_value: ArcAny) {
        *self = match std::mem::replace(
            self,
            LogEntry::Write {
                value: new_value.clone(),
                lock_mode: LockMode::None,
            },
        ) {
            LogEntry::Write { lock_mode, .. } => LogEntry::Write {
                value: new_value,
                lock_mode,
            },
            LogEntry::Read {
                value,
                version,
                lock_mode,
                ..
            } => LogEntry::ReadWrite {
                original: value,
                version,
                value: new_value,
                lock_mode,
            },
            LogEntry::ReadWrite {
                original,
                version,
                lock_mode,
                ..
            } => LogEntry::ReadWrite {
                original,
                version,
                value: new_value,
                lock_mode,
            },
        };
    }

    /// Raise the held lock mode to at least `mode`, used when a second
    /// access on the same ref within one attempt requests a stronger lock
    /// than the first (e.g. a configured write lock after a plain read).
    pub(crate) fn strengthen_lock(&mut self, mode: LockMode) {
        let current = match self {
            LogEntry::Read { lock_mode, .. }
            | LogEntry::Write { lock_mode, .. }
            | LogEntry::ReadWrite { lock_mode, .. } => lock_mode,
        };
        if mode.strength() > current.strength() {
            *current = mode;
        }
    }

    pub(crate) fn lock_mode(&self) -> LockMode {
        match self {
            LogEntry::Read { lock_mode, .. }
            | LogEntry::Write { lock_mode, .. }
            | LogEntry::ReadWrite { lock_mode, .. } => *lock_mode,
        }
    }

    /// The `(original value, version)` this entry must still match at
    /// commit, if it carries a read dependency at all.
    pub(crate) fn read_dependency(&self) -> Option<(ArcAny, u64)> {
        match self {
            LogEntry::Read { value, version, .. } => Some((value.clone(), *version)),
            LogEntry::ReadWrite {
                original, version, ..
            } => Some((original.clone(), *version)),
            LogEntry::Write { .. } => None,
        }
    }

    /// The value to publish at commit, if this entry wrote at all.
    pub(crate) fn write_value(&self) -> Option<&ArcAny> {
        match self {
            LogEntry::Write { value, .. } | LogEntry::ReadWrite { value, .. } => Some(value),
            LogEntry::Read { .. } => None,
        }
    }
}
