//! The underlay pool: a plain ordered `Vec` guarded by the controller lock
//! (spec §4.D), its idle-collection sweep, and the pick-existing reuse
//! policy (spec §4.F).

use std::sync::Arc;

use mux_underlay::Underlay;
use rand::Rng;

use crate::counters::Counters;

/// `clean-underlays` (spec §4.D): drop already-`Done()` underlays, and drop
/// (after closing) idle ones. Must be called with the controller lock held.
pub(crate) fn clean_underlays(underlays: &mut Vec<Arc<dyn Underlay>>, counters: &Counters) {
    underlays.retain(|u| {
        if u.is_done() {
            counters.note_closed();
            return false;
        }
        if u.scheduler().is_idle() {
            u.close();
            counters.note_closed();
            return false;
        }
        true
    });
}

/// Underlays eligible for reuse: not done, not disabled (spec §4.F).
fn active_underlays(underlays: &[Arc<dyn Underlay>]) -> Vec<&Arc<dyn Underlay>> {
    underlays
        .iter()
        .filter(|u| !u.is_done() && !u.scheduler().is_disabled())
        .collect()
}

/// The pick-existing reuse policy (spec §4.F): weight `M` per active
/// underlay against a weight-1 "create new" option. `rng` is injectable so
/// tests can verify the law with a seeded generator.
pub(crate) fn pick_existing(
    underlays: &[Arc<dyn Underlay>],
    multiplex_factor: u32,
    rng: &mut impl Rng,
) -> Option<Arc<dyn Underlay>> {
    if multiplex_factor == 0 {
        return None;
    }
    let active = active_underlays(underlays);
    let k = active.len();
    if k == 0 {
        return None;
    }
    let m = multiplex_factor as u64;
    let f = k as u64 * m;
    let n = rng.gen_range(0..=f);
    if n == f {
        return None;
    }
    let idx = (n / m) as usize;
    Some(active[idx].clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mux_underlay::Scheduler;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakeScheduler {
        idle: AtomicBool,
        disabled: AtomicBool,
    }

    impl Scheduler for FakeScheduler {
        fn inc_pending(&self) -> bool {
            !self.disabled.load(Ordering::SeqCst)
        }
        fn dec_pending(&self) {}
        fn is_idle(&self) -> bool {
            self.idle.load(Ordering::SeqCst)
        }
        fn is_disabled(&self) -> bool {
            self.disabled.load(Ordering::SeqCst)
        }
    }

    struct FakeUnderlay {
        scheduler: FakeScheduler,
        done: AtomicBool,
    }

    #[async_trait::async_trait]
    impl Underlay for FakeUnderlay {
        fn mtu(&self) -> usize {
            1500
        }
        fn scheduler(&self) -> &dyn Scheduler {
            &self.scheduler
        }
        async fn add_session(
            &self,
            _id: u32,
            _peer: Option<&str>,
        ) -> std::io::Result<Box<dyn sillad::Pipe>> {
            unimplemented!()
        }
        async fn accept(&self) -> std::io::Result<Option<mux_underlay::Connection>> {
            unimplemented!()
        }
        async fn run_event_loop(self: Arc<Self>) -> anyhow::Result<()> {
            Ok(())
        }
        fn is_done(&self) -> bool {
            self.done.load(Ordering::SeqCst)
        }
        fn close(&self) {
            self.done.store(true, Ordering::SeqCst);
        }
    }

    fn fake(idle: bool, disabled: bool, done: bool) -> Arc<dyn Underlay> {
        Arc::new(FakeUnderlay {
            scheduler: FakeScheduler {
                idle: AtomicBool::new(idle),
                disabled: AtomicBool::new(disabled),
            },
            done: AtomicBool::new(done),
        })
    }

    #[test]
    fn clean_underlays_drops_done_and_idle() {
        let counters = Counters::new();
        counters.note_active_open();
        counters.note_active_open();
        counters.note_active_open();
        let mut pool = vec![
            fake(false, false, false),
            fake(true, false, false),
            fake(false, false, true),
        ];
        clean_underlays(&mut pool, &counters);
        assert_eq!(pool.len(), 1);
        assert_eq!(
            counters.underlay_curr_established.load(Ordering::SeqCst),
            1
        );
    }

    #[test]
    fn pick_existing_respects_disabled_and_done() {
        let pool = vec![fake(false, true, false), fake(false, false, true)];
        let mut rng = rand::rngs::mock::StepRng::new(0, 1);
        assert!(pick_existing(&pool, 1, &mut rng).is_none());
    }

    #[test]
    fn multiplex_factor_zero_never_reuses() {
        let pool = vec![fake(false, false, false)];
        let mut rng = rand::thread_rng();
        assert!(pick_existing(&pool, 0, &mut rng).is_none());
    }

    #[test]
    fn reuse_probability_law_matches_closed_form() {
        use rand::SeedableRng;
        let k = 4usize;
        let m = 3u32;
        let pool: Vec<_> = (0..k).map(|_| fake(false, false, false)).collect();
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        let trials = 20_000;
        let mut reused = 0usize;
        let mut per_underlay = vec![0usize; k];
        for _ in 0..trials {
            match pick_existing(&pool, m, &mut rng) {
                Some(u) => {
                    reused += 1;
                    let idx = pool.iter().position(|x| Arc::ptr_eq(x, &u)).unwrap();
                    per_underlay[idx] += 1;
                }
                None => {}
            }
        }
        let expected = (k as f64 * m as f64) / (k as f64 * m as f64 + 1.0);
        let observed = reused as f64 / trials as f64;
        assert!((observed - expected).abs() < 0.02, "observed={observed} expected={expected}");
        for count in per_underlay {
            let observed_share = count as f64 / reused as f64;
            assert!((observed_share - 1.0 / k as f64).abs() < 0.02);
        }
    }
}
