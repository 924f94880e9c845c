//! Per-phase task bookkeeping
//!
//! Work items are created once at phase start and never mutated. Their
//! [`TaskState`]s live in a [`TaskRegistry`] owned by the phase's shared
//! state and are only touched under that state's lock.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::Instant;

use crate::shard::FileShard;

// ============================================================================
// Phase & Work Items
// ============================================================================

/// Job phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Map,
    Reduce,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Map => "map",
            Self::Reduce => "reduce",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a work item asks a worker to do
#[derive(Debug, Clone)]
pub enum WorkPayload {
    Map {
        shard: FileShard,
        n_output: usize,
        /// `<intermediate-root>/<job-id>/<map-id>`; each attempt writes into a
        /// fresh random subdirectory of it
        base_dir: PathBuf,
    },
    Reduce {
        input_dirs: Arc<[PathBuf]>,
        output_dir: PathBuf,
    },
}

/// One unit of work within a phase, identified by its index
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub id: usize,
    pub payload: WorkPayload,
}

impl WorkItem {
    pub fn map(id: usize, shard: FileShard, n_output: usize, base_dir: PathBuf) -> Self {
        Self {
            id,
            payload: WorkPayload::Map {
                shard,
                n_output,
                base_dir,
            },
        }
    }

    pub fn reduce(id: usize, input_dirs: Arc<[PathBuf]>, output_dir: PathBuf) -> Self {
        Self {
            id,
            payload: WorkPayload::Reduce {
                input_dirs,
                output_dir,
            },
        }
    }

    pub fn phase(&self) -> Phase {
        match self.payload {
            WorkPayload::Map { .. } => Phase::Map,
            WorkPayload::Reduce { .. } => Phase::Reduce,
        }
    }
}

// ============================================================================
// Task State
// ============================================================================

/// Mutable state of one work item
#[derive(Debug, Clone, Default)]
pub struct TaskState {
    /// Set once, when the first successful attempt completes
    pub done: bool,

    /// Set once, by the acceptance policy
    pub accepted: bool,

    /// Storage location of the accepted result (Map only)
    pub accepted_location: Option<PathBuf>,

    /// Start of the most recent assignment
    pub started_at: Option<Instant>,

    /// Number of assignments handed out
    pub attempts: u32,

    /// Number of attempts the task itself reported as failed
    pub application_failures: u32,
}

/// Task states for every item of one phase, indexed by item id
#[derive(Debug, Clone)]
pub struct TaskRegistry {
    tasks: Vec<TaskState>,
}

impl TaskRegistry {
    pub fn new(count: usize) -> Self {
        Self {
            tasks: vec![TaskState::default(); count],
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn get(&self, id: usize) -> Option<&TaskState> {
        self.tasks.get(id)
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut TaskState> {
        self.tasks.get_mut(id)
    }

    /// Record a new assignment of `id`
    pub fn record_start(&mut self, id: usize, now: Instant) {
        if let Some(task) = self.tasks.get_mut(id) {
            task.started_at = Some(now);
            task.attempts += 1;
        }
    }

    pub fn is_done(&self, id: usize) -> bool {
        self.tasks.get(id).is_some_and(|t| t.done)
    }

    /// Mark `id` done; returns `true` only on the first call
    pub fn mark_done(&mut self, id: usize) -> bool {
        match self.tasks.get_mut(id) {
            Some(task) if !task.done => {
                task.done = true;
                true
            }
            _ => false,
        }
    }

    /// Bump the application failure count of `id` and return the new total
    pub fn record_application_failure(&mut self, id: usize) -> u32 {
        match self.tasks.get_mut(id) {
            Some(task) => {
                task.application_failures += 1;
                task.application_failures
            }
            None => 0,
        }
    }

    pub fn started_at(&self, id: usize) -> Option<Instant> {
        self.tasks.get(id).and_then(|t| t.started_at)
    }

    pub fn all_accepted(&self) -> bool {
        self.tasks.iter().all(|t| t.accepted)
    }

    /// Accepted locations in item order; `None` for items without one
    pub fn accepted_locations(&self) -> Vec<Option<PathBuf>> {
        self.tasks
            .iter()
            .map(|t| t.accepted_location.clone())
            .collect()
    }
}
