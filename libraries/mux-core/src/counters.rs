//! Process-wide underlay counters (spec §6), exposed as plain atomics so an
//! embedding process can read them without locking anything.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

#[derive(Default)]
pub struct Counters {
    pub underlay_active_opens: AtomicU64,
    pub underlay_passive_opens: AtomicU64,
    pub underlay_curr_established: AtomicUsize,
    pub underlay_max_conn: AtomicUsize,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bumped when the client opens a new underlay.
    pub fn note_active_open(&self) {
        self.underlay_active_opens.fetch_add(1, Ordering::Relaxed);
        self.bump_established();
    }

    /// Bumped when the server accepts a new underlay.
    pub fn note_passive_open(&self) {
        self.underlay_passive_opens.fetch_add(1, Ordering::Relaxed);
        self.bump_established();
    }

    /// Call when an underlay leaves the pool (idle-collected or closed).
    pub fn note_closed(&self) {
        self.underlay_curr_established.fetch_sub(1, Ordering::Relaxed);
    }

    fn bump_established(&self) {
        let curr = self
            .underlay_curr_established
            .fetch_add(1, Ordering::Relaxed)
            + 1;
        self.underlay_max_conn.fetch_max(curr, Ordering::Relaxed);
    }
}
