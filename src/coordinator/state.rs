//! Shared scheduling state for one phase
//!
//! The pending queue, the worker->item running map, every [`TaskState`], the
//! worker states and the `remaining` counter sit behind one lock in
//! [`SharedPhase`]. Every transition that can unblock an assignment loop is
//! followed by a `notify_waiters()` on [`SharedPhase::changed`].
//!
//! Transitions are plain synchronous methods on [`PhaseState`]; the async
//! loops in `phase`, `health` and `straggler` only take the lock, call one of
//! them and release it.
//!
//! [`TaskState`]: super::registry::TaskState

use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use tokio::sync::{Mutex, Notify};
use tokio::time::{Duration, Instant};

use super::acceptance::{self, Acceptance};
use super::config::FailurePolicy;
use super::error::PhaseError;
use super::registry::{Phase, TaskRegistry};
use super::straggler;
use crate::worker::WorkerError;

// ============================================================================
// Worker State
// ============================================================================

/// Scheduling state of one configured worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Idle,
    Busy,
    /// Terminal: a dead worker is never probed or assigned again
    Dead,
}

impl WorkerState {
    pub fn is_alive(&self) -> bool {
        !matches!(self, Self::Dead)
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Counters collected while a phase runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PhaseStats {
    pub accepted: usize,
    pub duplicates_discarded: usize,
    pub speculative_requeues: usize,
    pub failure_requeues: usize,
    pub workers_lost: usize,
    pub application_failures: usize,
}

// ============================================================================
// Transition Results
// ============================================================================

/// What happened to a finished attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionEvent {
    /// First successful result for the item
    Accepted { remaining: usize },
    /// Success for an item that was already accepted
    Duplicate,
    /// The attempt failed
    Failed { requeued: bool, worker_dead: bool },
    /// The item reached its application failure limit; the phase is failing
    Exhausted { attempts: u32 },
    /// The worker was declared dead while the call was in flight
    Abandoned,
}

/// Result of [`PhaseState::complete`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub event: CompletionEvent,
    /// Output of this attempt that must be deleted
    pub discard: Option<PathBuf>,
}

impl Completion {
    /// Whether the worker's assignment loop must exit
    pub fn stops_worker(&self) -> bool {
        matches!(
            self.event,
            CompletionEvent::Abandoned
                | CompletionEvent::Failed {
                    worker_dead: true,
                    ..
                }
        )
    }
}

/// Result of [`PhaseState::reclaim`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reclaim {
    /// False if the worker was already dead
    pub newly_dead: bool,
    /// In-flight item taken back from the worker
    pub reclaimed: Option<usize>,
    /// Whether that item went back onto the pending queue
    pub requeued: bool,
}

// ============================================================================
// Phase State
// ============================================================================

/// Everything the assignment loops and monitors share
#[derive(Debug)]
pub struct PhaseState {
    phase: Phase,
    pending: VecDeque<usize>,
    running: BTreeMap<usize, usize>,
    tasks: TaskRegistry,
    workers: Vec<WorkerState>,
    remaining: usize,
    failure: Option<PhaseError>,
    stats: PhaseStats,
}

impl PhaseState {
    /// Fresh state with items `0..item_count` pending in order
    ///
    /// Workers carried over from an earlier phase keep `Dead`; everything
    /// else starts `Idle`.
    pub fn new(phase: Phase, item_count: usize, workers: &[WorkerState]) -> Self {
        Self {
            phase,
            pending: (0..item_count).collect(),
            running: BTreeMap::new(),
            tasks: TaskRegistry::new(item_count),
            workers: workers
                .iter()
                .map(|s| if s.is_alive() { WorkerState::Idle } else { WorkerState::Dead })
                .collect(),
            remaining: item_count,
            failure: None,
            stats: PhaseStats::default(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }

    pub fn stats(&self) -> PhaseStats {
        self.stats
    }

    pub fn tasks(&self) -> &TaskRegistry {
        &self.tasks
    }

    pub fn pending(&self) -> impl Iterator<Item = usize> + '_ {
        self.pending.iter().copied()
    }

    pub fn pending_count(&self, id: usize) -> usize {
        self.pending.iter().filter(|&&p| p == id).count()
    }

    pub fn running_item(&self, worker: usize) -> Option<usize> {
        self.running.get(&worker).copied()
    }

    pub fn worker_state(&self, worker: usize) -> WorkerState {
        self.workers
            .get(worker)
            .copied()
            .unwrap_or(WorkerState::Dead)
    }

    pub fn worker_states(&self) -> &[WorkerState] {
        &self.workers
    }

    /// Indices of workers that are not dead
    pub fn live_workers(&self) -> Vec<usize> {
        self.workers
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_alive())
            .map(|(w, _)| w)
            .collect()
    }

    pub fn failure(&self) -> Option<&PhaseError> {
        self.failure.as_ref()
    }

    pub fn take_failure(&mut self) -> Option<PhaseError> {
        self.failure.take()
    }

    /// Whether the assignment loop of `worker` should exit
    pub fn should_stop(&self, worker: usize) -> bool {
        !self.worker_state(worker).is_alive() || self.remaining == 0 || self.failure.is_some()
    }

    /// Whether the phase can make no further progress
    ///
    /// True once every item is accepted, a fatal failure was recorded, or
    /// every worker is dead.
    pub fn is_settled(&self) -> bool {
        self.remaining == 0 || self.failure.is_some() || self.workers.iter().all(|s| !s.is_alive())
    }

    /// Pop the next item for `worker` and mark it in flight
    ///
    /// Items that completed while queued are dropped on the way.
    pub fn claim(&mut self, worker: usize, now: Instant) -> Option<usize> {
        if self.should_stop(worker) {
            return None;
        }
        while let Some(id) = self.pending.pop_front() {
            if self.tasks.is_done(id) {
                continue;
            }
            self.workers[worker] = WorkerState::Busy;
            self.running.insert(worker, id);
            self.tasks.record_start(id, now);
            return Some(id);
        }
        None
    }

    /// Put `id` back on the pending queue unless it is done or already queued
    fn requeue(&mut self, id: usize) -> bool {
        if self.tasks.is_done(id) || self.pending.contains(&id) {
            return false;
        }
        self.pending.push_back(id);
        true
    }

    /// Record the end of `worker`'s attempt at `id`
    ///
    /// `location` is where the attempt wrote its output (Map only). It is
    /// handed back in [`Completion::discard`] whenever it must not be kept.
    pub fn complete(
        &mut self,
        worker: usize,
        id: usize,
        result: Result<(), WorkerError>,
        location: Option<PathBuf>,
        policy: FailurePolicy,
    ) -> Completion {
        if !self.worker_state(worker).is_alive() {
            // Reclaimed by the health monitor; the item was already requeued.
            self.running.remove(&worker);
            return Completion {
                event: CompletionEvent::Abandoned,
                discard: location,
            };
        }
        self.running.remove(&worker);

        let error = match result {
            Ok(()) => return self.complete_success(worker, id, location),
            Err(e) => e,
        };

        match (error.is_application(), policy) {
            (true, FailurePolicy::RetryItem { max_attempts }) => {
                self.workers[worker] = WorkerState::Idle;
                self.stats.application_failures += 1;
                let attempts = self.tasks.record_application_failure(id);
                if attempts >= max_attempts {
                    self.failure = Some(PhaseError::ItemExhausted {
                        phase: self.phase,
                        item: id,
                        attempts,
                        last_error: error.to_string(),
                    });
                    return Completion {
                        event: CompletionEvent::Exhausted { attempts },
                        discard: location,
                    };
                }
                let requeued = self.requeue(id);
                if requeued {
                    self.stats.failure_requeues += 1;
                }
                Completion {
                    event: CompletionEvent::Failed {
                        requeued,
                        worker_dead: false,
                    },
                    discard: location,
                }
            }
            (is_application, _) => {
                self.workers[worker] = WorkerState::Dead;
                self.stats.workers_lost += 1;
                if is_application {
                    self.stats.application_failures += 1;
                }
                let requeued = self.requeue(id);
                if requeued {
                    self.stats.failure_requeues += 1;
                }
                Completion {
                    event: CompletionEvent::Failed {
                        requeued,
                        worker_dead: true,
                    },
                    discard: location,
                }
            }
        }
    }

    fn complete_success(&mut self, worker: usize, id: usize, location: Option<PathBuf>) -> Completion {
        self.workers[worker] = WorkerState::Idle;

        let Some(task) = self.tasks.get_mut(id) else {
            return Completion {
                event: CompletionEvent::Duplicate,
                discard: location,
            };
        };
        let acceptance = acceptance::accept(task, location);
        if self.tasks.mark_done(id) {
            self.remaining -= 1;
        }

        match acceptance {
            Acceptance::Accepted => {
                self.stats.accepted += 1;
                Completion {
                    event: CompletionEvent::Accepted {
                        remaining: self.remaining,
                    },
                    discard: None,
                }
            }
            Acceptance::Duplicate { discard } => {
                self.stats.duplicates_discarded += 1;
                Completion {
                    event: CompletionEvent::Duplicate,
                    discard,
                }
            }
        }
    }

    /// Declare `worker` dead after a failed probe and take back its work
    pub fn reclaim(&mut self, worker: usize) -> Reclaim {
        if !self.worker_state(worker).is_alive() {
            return Reclaim {
                newly_dead: false,
                reclaimed: None,
                requeued: false,
            };
        }

        let reclaimed = self.running.remove(&worker);
        let requeued = reclaimed.is_some_and(|id| self.requeue(id));
        if requeued {
            self.stats.failure_requeues += 1;
        }
        self.workers[worker] = WorkerState::Dead;
        self.stats.workers_lost += 1;

        Reclaim {
            newly_dead: true,
            reclaimed,
            requeued,
        }
    }

    /// Elapsed time of every in-flight assignment, keyed by item
    pub fn in_flight(&self, now: Instant) -> Vec<(usize, Duration)> {
        self.running
            .values()
            .filter_map(|&id| {
                self.tasks
                    .started_at(id)
                    .map(|start| (id, now.saturating_duration_since(start)))
            })
            .collect()
    }

    /// Re-enqueue straggling in-flight items for speculative execution
    ///
    /// Returns the items added to the pending queue with their elapsed time.
    pub fn enqueue_stragglers(
        &mut self,
        now: Instant,
        floor: Duration,
        multiplier: f64,
    ) -> Vec<(usize, Duration)> {
        let in_flight = self.in_flight(now);
        let mut added = Vec::new();
        for id in straggler::stragglers(&in_flight, floor, multiplier) {
            if self.requeue(id) {
                self.stats.speculative_requeues += 1;
                let elapsed = in_flight
                    .iter()
                    .find(|(i, _)| *i == id)
                    .map(|(_, d)| *d)
                    .unwrap_or_default();
                added.push((id, elapsed));
            }
        }
        added
    }
}

// ============================================================================
// Shared Phase
// ============================================================================

/// [`PhaseState`] plus the wakeup used in place of a condition variable
#[derive(Debug)]
pub struct SharedPhase {
    pub state: Mutex<PhaseState>,
    pub changed: Notify,
}

impl SharedPhase {
    pub fn new(state: PhaseState) -> Self {
        Self {
            state: Mutex::new(state),
            changed: Notify::new(),
        }
    }

    /// Block until the phase can make no further progress
    pub async fn wait_settled(&self) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.state.lock().await.is_settled() {
                return;
            }
            notified.await;
        }
    }
}
