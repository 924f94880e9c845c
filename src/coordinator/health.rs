//! Worker health monitoring
//!
//! Probes every live worker on a fixed interval. A worker that misses its
//! probe deadline is declared dead for the rest of the job, and whatever it
//! had in flight goes back on the pending queue.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::watch;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};

use super::config::SchedulerConfig;
use super::registry::Phase;
use super::state::SharedPhase;
use crate::metrics;
use crate::worker::WorkerProxy;

/// Background liveness checker for one phase
pub struct HealthMonitor {
    shared: Arc<SharedPhase>,
    workers: Vec<Arc<dyn WorkerProxy>>,
    phase: Phase,
    interval: Duration,
    probe_timeout: Duration,
}

impl HealthMonitor {
    pub fn new(
        shared: Arc<SharedPhase>,
        workers: Vec<Arc<dyn WorkerProxy>>,
        phase: Phase,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            shared,
            workers,
            phase,
            interval: config.heartbeat_interval(),
            probe_timeout: config.probe_timeout(),
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
                    tracing::debug!(phase = %self.phase, "Health monitor stopping");
                    break;
                }
            }
        }
    }

    /// Probe every live worker once; returns the workers newly declared dead
    pub async fn check(&self) -> Vec<usize> {
        let targets = {
            let state = self.shared.state.lock().await;
            if state.remaining() == 0 {
                return Vec::new();
            }
            state.live_workers()
        };

        // The lock is not held while probing.
        let deadline = self.probe_timeout;
        let probes = targets.into_iter().filter_map(|w| {
            let proxy = self.workers.get(w)?.clone();
            Some(async move {
                let alive = timeout(deadline, proxy.probe(deadline))
                    .await
                    .unwrap_or(false);
                (w, alive)
            })
        });
        let results = join_all(probes).await;

        let mut newly_dead = Vec::new();
        {
            let mut state = self.shared.state.lock().await;
            for (w, alive) in results {
                if alive {
                    continue;
                }
                let reclaim = state.reclaim(w);
                if !reclaim.newly_dead {
                    continue;
                }

                tracing::warn!(
                    phase = %self.phase,
                    worker = %self.workers[w].address(),
                    reclaimed = ?reclaim.reclaimed,
                    requeued = reclaim.requeued,
                    "Worker failed health probe, marking dead"
                );
                metrics::record_worker_dead(self.phase.as_str(), "probe");
                if reclaim.requeued {
                    metrics::record_failure_requeue(self.phase.as_str());
                }
                newly_dead.push(w);
            }
        }

        if !newly_dead.is_empty() {
            self.shared.changed.notify_waiters();
        }
        newly_dead
    }
}
