// Copyright 2015-2016 rust-stm Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Per-transaction-factory configuration.

use std::time::Duration;

use crate::lock_word::LockMode;

/// Whether read-set revalidation at commit may be skipped.
///
/// `Serialized` gives full opacity (the default): even a doomed transaction
/// only ever observes a consistent snapshot. `Snapshot` is an opt-in
/// relaxation that skips the final read-set revalidation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    Serialized,
    Snapshot,
}

/// How a nested `execute` composes with an already-active transaction on
/// the current thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Propagation {
    /// Join the active transaction if one exists, else start a new one.
    Requires,
    /// Always start a brand-new, independent transaction.
    RequiresNew,
    /// Require an active transaction; error if none exists.
    Mandatory,
    /// Error if a transaction is already active.
    Never,
    /// Join an active transaction if present, else run non-transactionally.
    Supports,
}

/// Every knob a transaction factory may set, with the spec's defaults.
#[derive(Debug, Clone)]
pub struct TransactionConfig {
    pub read_lock_mode: LockMode,
    pub write_lock_mode: LockMode,
    pub blocking_allowed: bool,
    pub timeout: Option<Duration>,
    pub interruptible: bool,
    pub max_retries: u32,
    pub speculative: bool,
    pub isolation_level: IsolationLevel,
    pub propagation: Propagation,
    pub readonly: bool,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        TransactionConfig {
            read_lock_mode: LockMode::None,
            write_lock_mode: LockMode::Write,
            blocking_allowed: true,
            timeout: None,
            interruptible: false,
            max_retries: 1000,
            speculative: true,
            isolation_level: IsolationLevel::Serialized,
            propagation: Propagation::Requires,
            readonly: false,
        }
    }
}

impl TransactionConfig {
    pub fn with_read_lock_mode(mut self, mode: LockMode) -> Self {
        self.read_lock_mode = mode;
        self
    }

    pub fn with_write_lock_mode(mut self, mode: LockMode) -> Self {
        self.write_lock_mode = mode;
        self
    }

    pub fn with_blocking_allowed(mut self, allowed: bool) -> Self {
        self.blocking_allowed = allowed;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_interruptible(mut self, interruptible: bool) -> Self {
        self.interruptible = interruptible;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_speculative(mut self, speculative: bool) -> Self {
        self.speculative = speculative;
        self
    }

    pub fn with_isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = level;
        self
    }

    pub fn with_propagation(mut self, propagation: Propagation) -> Self {
        self.propagation = propagation;
        self
    }

    pub fn with_readonly(mut self, readonly: bool) -> Self {
        self.readonly = readonly;
        self
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = TransactionConfig::default();
        assert_eq!(cfg.read_lock_mode, LockMode::None);
        assert_eq!(cfg.write_lock_mode, LockMode::Write);
        assert!(cfg.blocking_allowed);
        assert_eq!(cfg.timeout, None);
        assert!(!cfg.interruptible);
        assert_eq!(cfg.max_retries, 1000);
        assert!(cfg.speculative);
        assert_eq!(cfg.isolation_level, IsolationLevel::Serialized);
        assert_eq!(cfg.propagation, Propagation::Requires);
        assert!(!cfg.readonly);
    }

    #[test]
    fn builder_overrides_defaults() {
        let cfg = TransactionConfig::default()
            .with_readonly(true)
            .with_max_retries(5)
            .with_blocking_allowed(false);
        assert!(cfg.readonly);
        assert_eq!(cfg.max_retries, 5);
        assert!(!cfg.blocking_allowed);
    }
}
