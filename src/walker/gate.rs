//! Hysteresis gate bounding in-flight metadata queries
//!
//! Directory scans spawn one metadata task per entry; without a bound
//! a single huge directory would queue hundreds of thousands of
//! operations at once.  The gate tracks the number of in-flight
//! queries and suspends scans at the high-water mark.  Suspended scans
//! are all resumed together once completions bring the count under the
//! low-water mark; the gap between the two marks keeps scans from
//! thrashing on and off the gate.

use std::cell::Cell;
use tokio::sync::Notify;

pub(crate) struct StatGate {
    pending: Cell<usize>,
    high_water: usize,
    low_water: usize,
    max_pending: Cell<usize>,
    resume: Notify,
}

impl StatGate {
    pub fn new(high_water: usize, low_water: usize) -> Self {
        debug_assert!(low_water <= high_water);
        Self {
            pending: Cell::new(0),
            high_water,
            low_water,
            max_pending: Cell::new(0),
            resume: Notify::new(),
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.get()
    }

    /// High-water mark of concurrent queries over the whole walk.
    pub fn max_pending(&self) -> usize {
        self.max_pending.get()
    }

    /// Wait until the walker may issue another metadata query.
    pub async fn admit(&self) {
        if self.pending.get() < self.high_water {
            return;
        }
        loop {
            self.resume.notified().await;
            if self.pending.get() < self.low_water {
                return;
            }
        }
    }

    /// Account a newly issued query.
    pub fn begin(&self) {
        let n = self.pending.get() + 1;
        self.pending.set(n);
        if n > self.max_pending.get() {
            self.max_pending.set(n);
        }
    }

    /// Account a completed query, waking suspended scans when the
    /// count crosses the low-water mark.
    pub fn complete(&self) {
        let before = self.pending.get();
        self.pending.set(before - 1);
        if before == self.low_water {
            self.resume.notify_waiters();
        }
    }
}
