//! Fault-tolerant Map/Reduce coordinator
//!
//! Drives a job through its Map and Reduce phases over a fixed pool of
//! remote workers, surviving worker loss and racing slow workers with
//! speculative copies.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                  JobDriver                   │
//! │   shard input -> Map phase -> Reduce phase   │
//! └──────────────────────┬───────────────────────┘
//!                        │ run_phase(items)
//! ┌──────────────────────▼───────────────────────┐
//! │               PhaseController                │
//! │                                              │
//! │  ┌────────────┐ ┌────────────┐ ┌──────────┐  │
//! │  │ assignment │ │ assignment │ │   ...    │  │  one per live worker
//! │  │   loop 0   │ │   loop 1   │ │          │  │
//! │  └─────┬──────┘ └─────┬──────┘ └────┬─────┘  │
//! │        └──────────────┼─────────────┘        │
//! │              ┌────────▼────────┐             │
//! │              │   SharedPhase   │◄── health   │
//! │              │ pending/running │◄── straggler│
//! │              │  tasks/workers  │             │
//! │              └─────────────────┘             │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use mapred::config::JobConfig;
//! use mapred::coordinator::JobDriver;
//!
//! let config = JobConfig::from_file("job.toml".as_ref())?;
//! let mut driver = JobDriver::from_config(config)?;
//! let report = driver.run().await?;
//! println!("{}", report.summary());
//! ```

pub mod acceptance;
pub mod config;
pub mod driver;
pub mod error;
pub mod health;
pub mod phase;
pub mod registry;
pub mod state;
pub mod straggler;

// Re-export main types
pub use config::{ConfigError, FailurePolicy, SchedulerConfig};
pub use driver::{JobDriver, JobReport};
pub use error::PhaseError;
pub use phase::{PhaseController, PhaseOutcome, PhaseReport};
pub use registry::{Phase, WorkItem, WorkPayload};
pub use state::{PhaseStats, WorkerState};
