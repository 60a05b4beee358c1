use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use mux_underlay::Scheduler;

/// The reference [`Scheduler`]: a plain pending counter plus a
/// tear-down/idle flag pair. `is_idle` reports true once the underlay has
/// no sessions and no pending attaches and has been marked idle by its
/// owning underlay (e.g. after its liveness checks fail); `is_disabled` is
/// raised the moment teardown begins so no further reuse is attempted.
#[derive(Default)]
pub struct LoopbackScheduler {
    pending: AtomicUsize,
    open_sessions: AtomicUsize,
    tearing_down: AtomicBool,
    marked_idle: AtomicBool,
}

impl LoopbackScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_teardown(&self) {
        self.tearing_down.store(true, Ordering::SeqCst);
    }

    pub fn note_session_opened(&self) {
        self.open_sessions.fetch_add(1, Ordering::SeqCst);
    }

    pub fn note_session_closed(&self) {
        self.open_sessions.fetch_sub(1, Ordering::SeqCst);
    }

    /// Test/administrative hook: force this underlay to report idle on the
    /// next collector sweep, regardless of session count.
    pub fn mark_idle(&self) {
        self.marked_idle.store(true, Ordering::SeqCst);
    }
}

impl Scheduler for LoopbackScheduler {
    fn inc_pending(&self) -> bool {
        if self.tearing_down.load(Ordering::SeqCst) {
            return false;
        }
        self.pending.fetch_add(1, Ordering::SeqCst);
        // Re-check after incrementing: if teardown began concurrently,
        // back out and report failure so the caller retries elsewhere.
        if self.tearing_down.load(Ordering::SeqCst) {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        true
    }

    fn dec_pending(&self) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }

    fn is_idle(&self) -> bool {
        if self.marked_idle.load(Ordering::SeqCst) {
            return true;
        }
        self.pending.load(Ordering::SeqCst) == 0 && self.open_sessions.load(Ordering::SeqCst) == 0
    }

    fn is_disabled(&self) -> bool {
        self.tearing_down.load(Ordering::SeqCst)
    }
}
