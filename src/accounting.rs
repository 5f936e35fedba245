//! Signal-safe connection accounting
//!
//! The number of live connections is the difference of two monotone
//! counters. `established` is only ever incremented from the event-loop
//! side; `reaped` may be incremented from any task at any time, in
//! particular from the watcher that notices a handed-off subprocess has
//! terminated. Keeping them separate lets the reap path stay a single
//! lock-free increment, and lets `active()` detect a reap that landed in
//! the middle of its read and retry until it observes a stable pair.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Concurrency-safe established/reaped counter pair
#[derive(Debug, Default)]
pub struct ConnectionAccounting {
    established: AtomicU64,
    reaped: AtomicU64,
    reap_changed: AtomicBool,
}

impl ConnectionAccounting {
    /// Create a new counter pair at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successfully admitted connection
    ///
    /// Called only from the event loop, synchronously with admission.
    pub fn on_established(&self) {
        self.established.fetch_add(1, Ordering::SeqCst);
    }

    /// Record a terminated connection
    ///
    /// Safe to call from any task; performs exactly one flag store and one
    /// increment, nothing else.
    pub fn on_reaped(&self) {
        self.reap_changed.store(true, Ordering::SeqCst);
        self.reaped.fetch_add(1, Ordering::SeqCst);
    }

    /// Current number of live connections
    ///
    /// `reaped` may move while we sample, so clear the changed flag, sample
    /// both counters, and retry if a reap landed during the read window.
    pub fn active(&self) -> u64 {
        loop {
            self.reap_changed.store(false, Ordering::SeqCst);
            let established = self.established.load(Ordering::SeqCst);
            let reaped = self.reaped.load(Ordering::SeqCst);
            if !self.reap_changed.load(Ordering::SeqCst) {
                return established.saturating_sub(reaped);
            }
        }
    }

    /// Total connections ever admitted
    pub fn total_established(&self) -> u64 {
        self.established.load(Ordering::SeqCst)
    }

    /// Total connections ever reaped
    pub fn total_reaped(&self) -> u64 {
        self.reaped.load(Ordering::SeqCst)
    }
}
