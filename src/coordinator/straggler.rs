//! Straggler detection and speculative re-execution
//!
//! Every tick, the fastest in-flight assignment sets the baseline: anything
//! running longer than `max(floor, multiplier * fastest)` is put back on the
//! pending queue so an idle worker can race the original attempt. The floor
//! keeps cold starts from being speculated on before a baseline exists.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::config::SchedulerConfig;
use super::registry::Phase;
use super::state::SharedPhase;
use crate::metrics;

/// Elapsed time past which an in-flight item counts as a straggler
///
/// Saturates at `Duration::MAX` when the scaled baseline does not fit.
pub fn speculation_threshold(min_elapsed: Duration, floor: Duration, multiplier: f64) -> Duration {
    let scaled = Duration::try_from_secs_f64(min_elapsed.as_secs_f64() * multiplier)
        .unwrap_or(Duration::MAX);
    floor.max(scaled)
}

/// Items among `in_flight` whose elapsed time exceeds the threshold
///
/// The same item may appear more than once in `in_flight` (original and
/// speculative attempts); the result keeps the input's multiplicity.
pub fn stragglers(in_flight: &[(usize, Duration)], floor: Duration, multiplier: f64) -> Vec<usize> {
    let Some(min_elapsed) = in_flight.iter().map(|(_, elapsed)| *elapsed).min() else {
        return Vec::new();
    };
    let threshold = speculation_threshold(min_elapsed, floor, multiplier);

    in_flight
        .iter()
        .filter(|(_, elapsed)| *elapsed > threshold)
        .map(|(id, _)| *id)
        .collect()
}

/// Background loop scheduling speculative attempts for one phase
pub struct StragglerMonitor {
    shared: Arc<SharedPhase>,
    phase: Phase,
    interval: Duration,
    floor: Duration,
    multiplier: f64,
}

impl StragglerMonitor {
    pub fn new(shared: Arc<SharedPhase>, phase: Phase, config: &SchedulerConfig) -> Self {
        Self {
            shared,
            phase,
            interval: config.straggler_interval(),
            floor: config.speculation_floor(),
            multiplier: config.speculation_multiplier,
        }
    }

    /// Tick until `shutdown` flips or its sender is dropped
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check().await;
                }
                _ = shutdown.changed() => {
                    tracing::debug!(phase = %self.phase, "Straggler monitor stopping");
                    break;
                }
            }
        }
    }

    /// One detection pass; returns the items re-enqueued
    pub async fn check(&self) -> Vec<usize> {
        let added = {
            let mut state = self.shared.state.lock().await;
            if state.remaining() == 0 {
                return Vec::new();
            }
            state.enqueue_stragglers(Instant::now(), self.floor, self.multiplier)
        };

        if added.is_empty() {
            return Vec::new();
        }

        for (id, elapsed) in &added {
            tracing::warn!(
                phase = %self.phase,
                task_id = id,
                elapsed_ms = elapsed.as_millis() as u64,
                "Speculatively re-executing straggler"
            );
            metrics::record_speculative_requeue(self.phase.as_str());
        }
        self.shared.changed.notify_waiters();

        added.into_iter().map(|(id, _)| id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::state::{PhaseState, WorkerState};
    use proptest::prelude::*;

    const FLOOR: Duration = Duration::from_millis(4000);

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_threshold_floor_dominates_early() {
        assert_eq!(speculation_threshold(ms(100), FLOOR, 2.5), ms(4000));
        assert_eq!(speculation_threshold(ms(2000), FLOOR, 2.5), ms(5000));
    }

    #[test]
    fn test_threshold_saturates_on_huge_multiplier() {
        assert_eq!(speculation_threshold(ms(1000), FLOOR, 1e30), Duration::MAX);
        assert_eq!(speculation_threshold(ms(0), FLOOR, 1e30), FLOOR);
        assert!(stragglers(&[(0, ms(60_000)), (1, ms(1000))], FLOOR, 1e30).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_with_huge_multiplier_keeps_running() {
        let config = SchedulerConfig::builder()
            .speculation_multiplier(1e30)
            .build()
            .unwrap();
        let mut state = PhaseState::new(Phase::Map, 2, &[WorkerState::Idle; 2]);
        state.claim(0, Instant::now());
        let shared = Arc::new(SharedPhase::new(state));
        let monitor = StragglerMonitor::new(shared.clone(), Phase::Map, &config);

        // item 0 at 61s against a 1s peer would be speculated at any sane multiplier
        tokio::time::advance(ms(60_000)).await;
        shared.state.lock().await.claim(1, Instant::now());
        tokio::time::advance(ms(1000)).await;
        assert!(monitor.check().await.is_empty());
        assert!(monitor.check().await.is_empty());
        assert_eq!(shared.state.lock().await.stats().speculative_requeues, 0);
    }

    #[test]
    fn test_slow_item_among_fast_peers() {
        // one item at 5.5s while its peers have run 2s
        let in_flight = vec![(0, ms(5500)), (1, ms(2000)), (2, ms(2000))];
        assert_eq!(stragglers(&in_flight, FLOOR, 2.5), vec![0]);

        // at exactly the threshold nothing is speculated yet
        let in_flight = vec![(0, ms(5000)), (1, ms(2000))];
        assert!(stragglers(&in_flight, FLOOR, 2.5).is_empty());
    }

    #[test]
    fn test_lone_item_is_never_a_straggler() {
        assert!(stragglers(&[(0, ms(60_000))], FLOOR, 2.5).is_empty());
        assert!(stragglers(&[], FLOOR, 2.5).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_enqueues_and_wakes() {
        let mut state = PhaseState::new(Phase::Map, 3, &[WorkerState::Idle; 2]);
        let t0 = Instant::now();
        state.claim(0, t0);
        state.claim(1, t0);
        let shared = Arc::new(SharedPhase::new(state));
        let monitor = StragglerMonitor::new(shared.clone(), Phase::Map, &SchedulerConfig::default());

        tokio::time::advance(ms(3000)).await;
        assert!(monitor.check().await.is_empty());

        // worker 1 moves on to a fresh item at 4s; worker 0 keeps grinding
        tokio::time::advance(ms(1000)).await;
        shared.state.lock().await.claim(1, Instant::now());
        tokio::time::advance(ms(1000)).await;
        // item 0 at 5s, item 2 at 1s: threshold is the 4s floor
        assert_eq!(monitor.check().await, vec![0]);
        assert_eq!(monitor.check().await, Vec::<usize>::new());
    }

    proptest! {
        #[test]
        fn prop_eligibility_matches_threshold(
            elapsed in prop::collection::vec(0u64..60_000, 1..12),
            floor in 0u64..10_000,
            multiplier in 1.0f64..5.0,
        ) {
            let in_flight: Vec<(usize, Duration)> =
                elapsed.iter().enumerate().map(|(i, &e)| (i, ms(e))).collect();
            let min = in_flight.iter().map(|(_, d)| *d).min().unwrap();
            let threshold = ms(floor).max(min.mul_f64(multiplier));

            let picked = stragglers(&in_flight, ms(floor), multiplier);
            for (id, d) in &in_flight {
                prop_assert_eq!(picked.contains(id), *d > threshold);
            }
        }

        #[test]
        fn prop_lowering_knobs_only_adds(
            elapsed in prop::collection::vec(0u64..60_000, 1..12),
            floor_hi in 0u64..10_000,
            floor_cut in 0u64..10_000,
            mult_hi in 1.0f64..5.0,
            mult_cut in 0.0f64..1.0,
        ) {
            let in_flight: Vec<(usize, Duration)> =
                elapsed.iter().enumerate().map(|(i, &e)| (i, ms(e))).collect();
            let floor_lo = floor_hi.saturating_sub(floor_cut);
            let mult_lo = 1.0 + (mult_hi - 1.0) * mult_cut;

            let strict = stragglers(&in_flight, ms(floor_hi), mult_hi);
            let relaxed = stragglers(&in_flight, ms(floor_lo), mult_lo);
            for id in strict {
                prop_assert!(relaxed.contains(&id));
            }
        }
    }
}
