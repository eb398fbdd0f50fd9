// Copyright 2015-2016 rust-stm Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The retry latch: the sole blocking primitive in the runtime.
//!
//! Created when a transaction calls `retry()`, registered on every ref in
//! its read log, and parked on by the executor between attempts. A writer
//! that publishes a ref signals every latch registered on it; signalling is
//! single-shot and level-triggered (a latch registered after the version it
//! was waiting past has already moved signals immediately, see
//! [`Latch::signal_if_stale`]).

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

/// Upper bound on a single `park_timeout` call. Bounds the cost of a missed
/// unpark (spurious wakeups just re-check and park again) without requiring
/// a condvar.
const MAX_PARK_SLICE: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LatchOutcome {
    Signalled,
    TimedOut,
    Interrupted,
}

/// A single-shot suspension token a parked transaction waits on.
pub(crate) struct Latch {
    thread: Thread,
    signalled: AtomicBool,
    interruptible: bool,
    interrupted: AtomicBool,
    deadline: Option<Instant>,
}

impl Latch {
    pub fn new(interruptible: bool, timeout: Option<Duration>) -> Self {
        Latch {
            thread: thread::current(),
            signalled: AtomicBool::new(false),
            interruptible,
            interrupted: AtomicBool::new(false),
            deadline: timeout.map(|d| Instant::now() + d),
        }
    }

    /// Signal the latch, waking its thread at most once.
    pub fn signal(&self) {
        if !self.signalled.swap(true, Ordering::SeqCst) {
            self.thread.unpark();
        }
    }

    /// Signal only if the ref's version has already moved past what the
    /// registering transaction observed. Used so that a listener attached
    /// to a ref which changed between the transaction's abort and the
    /// registration call wakes immediately instead of waiting for the next
    /// unrelated write (spec §4.F: "level-triggered on a version change").
    pub fn signal_if_stale(&self, observed_version: u64, current_version: u64) {
        if current_version > observed_version {
            self.signal();
        }
    }

    /// Deliver an external interrupt. A no-op unless the latch is
    /// `interruptible`.
    pub fn interrupt(&self) {
        if self.interruptible {
            self.interrupted.store(true, Ordering::SeqCst);
            self.thread.unpark();
        }
    }

    /// Park until signalled, the deadline elapses, or an interrupt lands.
    pub fn wait(&self) -> LatchOutcome {
        loop {
            if self.signalled.load(Ordering::SeqCst) {
                return LatchOutcome::Signalled;
            }
            if self.interruptible && self.interrupted.load(Ordering::SeqCst) {
                return LatchOutcome::Interrupted;
            }
            let slice = match self.deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return LatchOutcome::TimedOut;
                    }
                    (deadline - now).min(MAX_PARK_SLICE)
                }
                None => MAX_PARK_SLICE,
            };
            thread::park_timeout(slice);
        }
    }
}
