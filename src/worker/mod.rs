//! Worker side of the system
//!
//! - [`WorkerProxy`] - the coordinator's handle on one remote worker
//! - [`client`] - HTTP implementation of the proxy
//! - [`server`] - the worker process's HTTP API
//! - [`executor`] - map/reduce execution against the filesystem

pub mod client;
pub mod executor;
pub mod server;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::error::{ErrorCategory, MapredErrorTrait};
use crate::shard::FilePiece;

pub use client::HttpWorkerProxy;
pub use server::{WorkerServer, WorkerServerConfig};

// ============================================================================
// Wire Types
// ============================================================================

/// Run the map half of `task` over one shard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapTaskRequest {
    pub task: String,
    pub task_id: usize,
    pub pieces: Vec<FilePiece>,
    pub n_output: usize,
    /// Directory the worker writes its partition files into
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MapTaskResponse {
    pub success: bool,
    #[serde(default)]
    pub output_files: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MapTaskResponse {
    pub fn ok(output_files: Vec<PathBuf>) -> Self {
        Self {
            success: true,
            output_files,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output_files: Vec::new(),
            error: Some(error.into()),
        }
    }
}

/// Run the reduce half of `task` for one partition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReduceTaskRequest {
    pub task: String,
    pub task_id: usize,
    pub input_dirs: Vec<PathBuf>,
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReduceTaskResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ReduceTaskResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

// ============================================================================
// Worker Errors
// ============================================================================

/// Failure of a single worker call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkerError {
    /// The call never produced a response (connection refused, reset, timeout)
    #[error("transport failure: {0}")]
    Transport(String),

    /// The worker answered with a non-success HTTP status
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// The call completed but the task itself reported failure
    #[error("task failed: {message}")]
    Application { message: String },

    /// The proxy could not be constructed
    #[error("failed to initialize worker client: {0}")]
    Init(String),
}

impl WorkerError {
    /// Whether the failure came from the task rather than the worker
    pub fn is_application(&self) -> bool {
        matches!(self, Self::Application { .. })
    }
}

impl MapredErrorTrait for WorkerError {
    fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Init(_))
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Transport(_) | Self::Http { .. } => ErrorCategory::Network,
            Self::Application { .. } => ErrorCategory::Task,
            Self::Init(_) => ErrorCategory::Config,
        }
    }
}

// ============================================================================
// Worker Proxy
// ============================================================================

/// The coordinator's capability to drive one remote worker
///
/// Task calls carry no deadline of their own; only [`probe`](Self::probe)
/// is bounded.
#[async_trait]
pub trait WorkerProxy: Send + Sync {
    /// Address used in logs and metrics
    fn address(&self) -> &str;

    async fn execute_map(&self, request: MapTaskRequest) -> Result<MapTaskResponse, WorkerError>;

    async fn execute_reduce(
        &self,
        request: ReduceTaskRequest,
    ) -> Result<ReduceTaskResponse, WorkerError>;

    /// Connectivity check; `false` if the worker does not answer within `deadline`
    async fn probe(&self, deadline: Duration) -> bool;
}
