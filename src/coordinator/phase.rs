//! Phase execution
//!
//! One assignment loop runs per live worker. Each loop waits for a pending
//! item, makes the blocking call on its worker with the state lock
//! released, then reports the outcome back under the lock. The health and
//! straggler monitors run alongside until the phase settles.

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;

use super::config::SchedulerConfig;
use super::error::PhaseError;
use super::health::HealthMonitor;
use super::registry::{Phase, WorkItem, WorkPayload};
use super::state::{CompletionEvent, PhaseState, PhaseStats, SharedPhase, WorkerState};
use super::straggler::StragglerMonitor;
use crate::metrics;
use crate::worker::{MapTaskRequest, ReduceTaskRequest, WorkerError, WorkerProxy};

/// Length of the random directory name given to each map attempt
const ATTEMPT_DIR_LEN: usize = 8;

/// Summary of one finished phase
#[derive(Debug, Clone, Serialize)]
pub struct PhaseReport {
    pub phase: Phase,
    pub items: usize,
    pub stats: PhaseStats,
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
    pub workers_alive: usize,
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

/// Result of a successful [`PhaseController::run_phase`]
#[derive(Debug, Clone)]
pub struct PhaseOutcome {
    pub report: PhaseReport,
    /// Accepted output location per item, in item order (Map only)
    pub accepted_locations: Vec<Option<PathBuf>>,
}

/// Runs phases over a fixed set of workers
///
/// Worker states persist across phases: a worker that died during Map is
/// never used for Reduce.
pub struct PhaseController {
    workers: Vec<Arc<dyn WorkerProxy>>,
    states: Vec<WorkerState>,
    config: SchedulerConfig,
    task: String,
}

impl PhaseController {
    pub fn new(
        workers: Vec<Arc<dyn WorkerProxy>>,
        config: SchedulerConfig,
        task: impl Into<String>,
    ) -> Self {
        let states = vec![WorkerState::Idle; workers.len()];
        Self {
            workers,
            states,
            config,
            task: task.into(),
        }
    }

    pub fn worker_states(&self) -> &[WorkerState] {
        &self.states
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Run `items` to completion
    ///
    /// Returns once every item has an accepted result, or with an error once
    /// no live worker remains or an item exhausted its retries. Calls still
    /// in flight at that point are abandoned, so a hung duplicate attempt
    /// never holds the phase open. Map attempt directories that were not
    /// accepted are removed before this returns.
    pub async fn run_phase(
        &mut self,
        phase: Phase,
        items: Vec<WorkItem>,
    ) -> Result<PhaseOutcome, PhaseError> {
        let started = Instant::now();
        let item_count = items.len();

        let shared = Arc::new(SharedPhase::new(PhaseState::new(
            phase,
            item_count,
            &self.states,
        )));
        metrics::set_remaining(phase.as_str(), item_count);

        if item_count == 0 {
            return Ok(self.finish(phase, &shared, 0, started).await);
        }

        tracing::info!(
            phase = %phase,
            items = item_count,
            workers = self.states.iter().filter(|s| s.is_alive()).count(),
            "Starting phase"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let health = HealthMonitor::new(shared.clone(), self.workers.clone(), phase, &self.config);
        let straggler = StragglerMonitor::new(shared.clone(), phase, &self.config);
        let monitors = [
            tokio::spawn(health.run(shutdown_rx.clone())),
            tokio::spawn(straggler.run(shutdown_rx)),
        ];

        let items: Arc<[WorkItem]> = items.into();
        let mut loops = JoinSet::new();
        for (w, proxy) in self.workers.iter().enumerate() {
            if !self.states[w].is_alive() {
                continue;
            }
            let assignment = AssignmentLoop {
                worker: w,
                proxy: proxy.clone(),
                shared: shared.clone(),
                items: items.clone(),
                config: self.config.clone(),
                task: self.task.clone(),
            };
            loops.spawn(assignment.run());
        }

        shared.wait_settled().await;

        let _ = shutdown_tx.send(true);
        for monitor in monitors {
            if let Err(e) = monitor.await {
                tracing::error!(phase = %phase, error = %e, "Monitor task panicked");
            }
        }

        // Any loop still running is parked on a call whose result can no
        // longer be accepted, and the call may never return.
        loops.abort_all();
        while let Some(joined) = loops.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    tracing::error!(phase = %phase, error = %e, "Assignment loop panicked");
                }
            }
        }

        let mut outcome = self.finish(phase, &shared, item_count, started).await;

        let mut state = shared.state.lock().await;
        if let Some(failure) = state.take_failure() {
            tracing::error!(phase = %phase, error = %failure, "Phase failed");
            return Err(failure);
        }
        if !state.tasks().all_accepted() {
            let err = PhaseError::NoLiveWorkers {
                phase,
                remaining: state.remaining(),
            };
            tracing::error!(phase = %phase, error = %err, "Phase failed");
            return Err(err);
        }

        outcome.accepted_locations = state.tasks().accepted_locations();
        drop(state);

        if phase == Phase::Map {
            remove_unaccepted_attempts(&items, &outcome.accepted_locations).await;
        }

        tracing::info!(
            phase = %phase,
            items = item_count,
            elapsed_ms = outcome.report.elapsed.as_millis() as u64,
            duplicates = outcome.report.stats.duplicates_discarded,
            speculative = outcome.report.stats.speculative_requeues,
            workers_alive = outcome.report.workers_alive,
            "Phase complete"
        );
        Ok(outcome)
    }

    /// Carry worker states forward and build the phase report
    async fn finish(
        &mut self,
        phase: Phase,
        shared: &SharedPhase,
        items: usize,
        started: Instant,
    ) -> PhaseOutcome {
        let state = shared.state.lock().await;
        self.states = state
            .worker_states()
            .iter()
            .map(|s| if s.is_alive() { WorkerState::Idle } else { WorkerState::Dead })
            .collect();

        let elapsed = started.elapsed();
        metrics::observe_phase_duration(phase.as_str(), elapsed.as_secs_f64());

        PhaseOutcome {
            report: PhaseReport {
                phase,
                items,
                stats: state.stats(),
                elapsed,
                workers_alive: self.states.iter().filter(|s| s.is_alive()).count(),
            },
            accepted_locations: Vec::new(),
        }
    }
}

// ============================================================================
// Assignment Loop
// ============================================================================

struct AssignmentLoop {
    worker: usize,
    proxy: Arc<dyn WorkerProxy>,
    shared: Arc<SharedPhase>,
    items: Arc<[WorkItem]>,
    config: SchedulerConfig,
    task: String,
}

impl AssignmentLoop {
    async fn run(self) {
        while let Some(id) = self.next_item().await {
            let Some(item) = self.items.get(id) else {
                break;
            };
            if !self.execute(item).await {
                break;
            }
        }
        tracing::debug!(worker = %self.proxy.address(), "Assignment loop exiting");
    }

    /// Wait until there is pending work for this worker or the loop must stop
    async fn next_item(&self) -> Option<usize> {
        loop {
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.shared.state.lock().await;
                if let Some(id) = state.claim(self.worker, Instant::now()) {
                    return Some(id);
                }
                if state.should_stop(self.worker) {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Run one attempt of `item`; returns whether the loop should continue
    async fn execute(&self, item: &WorkItem) -> bool {
        let phase = item.phase();
        tracing::debug!(
            phase = %phase,
            task_id = item.id,
            worker = %self.proxy.address(),
            "Dispatching"
        );

        let (result, location) = self.dispatch(item).await;

        let completion = {
            let mut state = self.shared.state.lock().await;
            let completion = state.complete(
                self.worker,
                item.id,
                result.clone(),
                location,
                self.config.failure_policy,
            );
            metrics::set_remaining(phase.as_str(), state.remaining());
            completion
        };

        match &completion.event {
            CompletionEvent::Accepted { remaining } => {
                tracing::info!(
                    phase = %phase,
                    task_id = item.id,
                    worker = %self.proxy.address(),
                    remaining,
                    "Task accepted"
                );
                metrics::record_accepted(phase.as_str());
            }
            CompletionEvent::Duplicate => {
                tracing::warn!(
                    phase = %phase,
                    task_id = item.id,
                    worker = %self.proxy.address(),
                    "Discarding duplicate result"
                );
                metrics::record_duplicate_discarded(phase.as_str());
            }
            CompletionEvent::Failed {
                requeued,
                worker_dead,
            } => {
                let error = result.as_ref().err().map(ToString::to_string);
                tracing::warn!(
                    phase = %phase,
                    task_id = item.id,
                    worker = %self.proxy.address(),
                    error = error.as_deref().unwrap_or_default(),
                    requeued,
                    worker_dead,
                    "Task attempt failed"
                );
                if *requeued {
                    metrics::record_failure_requeue(phase.as_str());
                }
                if *worker_dead {
                    let reason = match &result {
                        Err(e) if e.is_application() => "application",
                        _ => "transport",
                    };
                    metrics::record_worker_dead(phase.as_str(), reason);
                }
            }
            CompletionEvent::Exhausted { attempts } => {
                tracing::error!(
                    phase = %phase,
                    task_id = item.id,
                    attempts,
                    "Task exhausted its attempts"
                );
            }
            CompletionEvent::Abandoned => {
                tracing::debug!(
                    phase = %phase,
                    task_id = item.id,
                    worker = %self.proxy.address(),
                    "Dropping result from a worker already declared dead"
                );
            }
        }

        if let Some(discard) = &completion.discard {
            remove_output(discard).await;
        }
        self.shared.changed.notify_waiters();

        !completion.stops_worker() && !matches!(completion.event, CompletionEvent::Exhausted { .. })
    }

    /// Make the worker call; returns its outcome and the attempt's output location
    async fn dispatch(&self, item: &WorkItem) -> (Result<(), WorkerError>, Option<PathBuf>) {
        match &item.payload {
            WorkPayload::Map {
                shard,
                n_output,
                base_dir,
            } => {
                let output_dir = base_dir.join(attempt_dir_name());
                let request = MapTaskRequest {
                    task: self.task.clone(),
                    task_id: item.id,
                    pieces: shard.pieces.clone(),
                    n_output: *n_output,
                    output_dir: output_dir.clone(),
                };
                let result = self
                    .bounded(self.proxy.execute_map(request))
                    .await
                    .and_then(|response| task_outcome(response.success, response.error));
                (result, Some(output_dir))
            }
            WorkPayload::Reduce {
                input_dirs,
                output_dir,
            } => {
                let request = ReduceTaskRequest {
                    task: self.task.clone(),
                    task_id: item.id,
                    input_dirs: input_dirs.to_vec(),
                    output_dir: output_dir.clone(),
                };
                let result = self
                    .bounded(self.proxy.execute_reduce(request))
                    .await
                    .and_then(|response| task_outcome(response.success, response.error));
                (result, None)
            }
        }
    }

    /// Apply the configured call deadline, if any
    async fn bounded<T>(
        &self,
        call: impl std::future::Future<Output = Result<T, WorkerError>>,
    ) -> Result<T, WorkerError> {
        match self.config.call_timeout() {
            Some(deadline) => tokio::time::timeout(deadline, call).await.unwrap_or_else(|_| {
                Err(WorkerError::Transport(format!(
                    "call timed out after {}ms",
                    deadline.as_millis()
                )))
            }),
            None => call.await,
        }
    }
}

/// A completed call whose task reported failure is an application error
fn task_outcome(success: bool, error: Option<String>) -> Result<(), WorkerError> {
    if success {
        Ok(())
    } else {
        Err(WorkerError::Application {
            message: error.unwrap_or_else(|| "task reported failure".to_string()),
        })
    }
}

fn attempt_dir_name() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ATTEMPT_DIR_LEN)
        .map(char::from)
        .collect()
}

/// Delete a discarded attempt's output; a missing directory is fine
async fn remove_output(path: &Path) {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => tracing::debug!(path = %path.display(), "Removed discarded output"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove discarded output")
        }
    }
}

/// Remove map attempt directories other than the accepted one
///
/// Covers attempts cut short when the phase settled, whose worker may have
/// written output before the call was abandoned.
async fn remove_unaccepted_attempts(items: &[WorkItem], accepted: &[Option<PathBuf>]) {
    for item in items {
        let WorkPayload::Map { base_dir, .. } = &item.payload else {
            continue;
        };
        let keep = accepted.get(item.id).and_then(Option::as_deref);

        let mut entries = match tokio::fs::read_dir(base_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => {
                tracing::warn!(path = %base_dir.display(), error = %e, "Failed to list attempt directories");
                continue;
            }
        };
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => {
                    let path = entry.path();
                    if Some(path.as_path()) != keep {
                        remove_output(&path).await;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(path = %base_dir.display(), error = %e, "Failed to list attempt directories");
                    break;
                }
            }
        }
    }
}
