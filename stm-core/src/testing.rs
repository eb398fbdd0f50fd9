// Copyright 2015-2016 rust-stm Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Test-only helpers for asserting that a blocking call does, or does not,
//! return within a bound. Used throughout the unit and integration tests to
//! check `retry()`/latch behavior without flaking or hanging the suite.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

/// Run `f` on its own thread and report whether it finished within
/// `timeout_ms`. Used to assert that an operation blocks (`false`) or
/// completes (`true`).
pub(crate) fn terminates<F>(timeout_ms: u64, f: F) -> bool
where
    F: FnOnce() + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        f();
        let _ = tx.send(());
    });
    rx.recv_timeout(Duration::from_millis(timeout_ms)).is_ok()
}

/// Run `f` on its own thread while `concurrent` runs on the calling thread,
/// then report whether `f` finished within `timeout_ms`. Used to check that
/// some concurrent action (`concurrent`) is what unblocks `f`.
pub(crate) fn terminates_async<F, C>(timeout_ms: u64, f: F, concurrent: C) -> bool
where
    F: FnOnce() + Send + 'static,
    C: FnOnce(),
{
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        f();
        let _ = tx.send(());
    });
    concurrent();
    rx.recv_timeout(Duration::from_millis(timeout_ms)).is_ok()
}

/// Like [`terminates`], but hands the blocking closure's return value back
/// on success.
pub(crate) fn async_test<F, C, T>(timeout_ms: u64, f: F, concurrent: C) -> Option<T>
where
    F: FnOnce() -> T + Send + 'static,
    C: FnOnce(),
    T: Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(f());
    });
    concurrent();
    rx.recv_timeout(Duration::from_millis(timeout_ms)).ok()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn terminates_detects_quick_completion() {
        assert!(terminates(200, || {}));
    }

    #[test]
    fn terminates_detects_a_hang() {
        assert!(!terminates(50, || thread::sleep(Duration::from_secs(5))));
    }

    #[test]
    fn async_test_returns_the_value() {
        let value = async_test(200, || 42, || {});
        assert_eq!(value, Some(42));
    }
}
