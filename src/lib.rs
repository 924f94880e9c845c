//! mapred - fault-tolerant Map/Reduce over remote workers
//!
//! A coordinator splits its input into shards, runs a Map phase and then a
//! Reduce phase over a fixed pool of HTTP workers, and survives worker loss
//! and slow workers along the way.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`config`] - Job configuration loaded from TOML
//! - [`coordinator`] - Phase scheduling, health and straggler monitoring, job driver
//! - [`shard`] - Line-aligned input sharding
//! - [`tasks`] - User map/reduce logic and the task registry
//! - [`worker`] - Worker proxy, HTTP client, and the worker process
//! - [`metrics`] - Prometheus counters
//! - [`error`] - Unified error type
//!
//! # Example
//!
//! ```no_run
//! use mapred::config::JobConfig;
//! use mapred::coordinator::JobDriver;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = JobConfig::from_file("job.toml".as_ref())?;
//!     let mut driver = JobDriver::from_config(config)?;
//!     let report = driver.run().await?;
//!     println!("{}", report.summary());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod metrics;
pub mod shard;
pub mod tasks;
pub mod worker;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::JobConfig;
    pub use crate::coordinator::{
        FailurePolicy, JobDriver, JobReport, Phase, PhaseController, PhaseError, SchedulerConfig,
    };
    pub use crate::error::{Error, ErrorCategory, MapredErrorTrait, Result};
    pub use crate::shard::{shard_files, FilePiece, FileShard};
    pub use crate::tasks::{Emitter, Mapper, Reducer, TaskFactory};
    pub use crate::worker::{HttpWorkerProxy, WorkerError, WorkerProxy};
}
