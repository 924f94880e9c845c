//! Unified error handling for the mapred crate
//!
//! Each subsystem keeps its own error type (`ShardError`, `WorkerError`,
//! `PhaseError`); this module folds them into a single [`Error`] enum so the
//! job driver and the binary can propagate any of them with `?`.
//!
//! # Usage
//!
//! ```rust,ignore
//! use mapred::error::{Error, MapredErrorTrait};
//!
//! fn report(err: &Error) {
//!     if err.is_recoverable() {
//!         tracing::warn!(category = ?err.category(), "retryable failure: {err}");
//!     } else {
//!         tracing::error!(category = ?err.category(), "fatal: {err}");
//!     }
//! }
//! ```

use std::io;
use thiserror::Error;

pub use crate::coordinator::PhaseError;
pub use crate::shard::ShardError;
pub use crate::worker::WorkerError;

/// Common trait for all mapred error types
pub trait MapredErrorTrait: std::error::Error {
    /// Check if this error is recoverable (the operation may succeed if retried)
    fn is_recoverable(&self) -> bool;

    /// Get the error category for handling strategies
    fn category(&self) -> ErrorCategory;
}

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Worker transport failures and unreachable workers
    Network,
    /// Filesystem errors on inputs, intermediates or outputs
    Storage,
    /// Configuration and validation errors
    Config,
    /// Phase scheduling failures (no live workers, exhausted items)
    Scheduler,
    /// User task logic reported a failure
    Task,
    /// Other/unknown errors
    Other,
}

impl ErrorCategory {
    /// Short lowercase label, used as a metrics/log field
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Storage => "storage",
            Self::Config => "config",
            Self::Scheduler => "scheduler",
            Self::Task => "task",
            Self::Other => "other",
        }
    }
}

/// Unified error type for the mapred crate
#[derive(Error, Debug)]
pub enum Error {
    /// Input sharding errors
    #[error("Shard error: {0}")]
    Shard(#[from] ShardError),

    /// Worker call errors
    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    /// A phase could not run to completion
    #[error("Phase error: {0}")]
    Phase(#[from] PhaseError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML config parse errors
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// HTTP client errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(String),

    /// Generic error with context
    #[error("{context}")]
    Other {
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl MapredErrorTrait for Error {
    fn is_recoverable(&self) -> bool {
        match self {
            Self::Shard(e) => e.is_recoverable(),
            Self::Worker(e) => e.is_recoverable(),
            Self::Phase(e) => e.is_recoverable(),
            Self::Io(_) => true,
            Self::Json(_) | Self::Toml(_) => false,
            Self::Http(_) => true,
            Self::Config(_) => false,
            Self::Other { .. } => false,
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Shard(e) => e.category(),
            Self::Worker(e) => e.category(),
            Self::Phase(e) => e.category(),
            Self::Http(_) => ErrorCategory::Network,
            Self::Io(_) => ErrorCategory::Storage,
            Self::Json(_) | Self::Toml(_) | Self::Config(_) => ErrorCategory::Config,
            Self::Other { .. } => ErrorCategory::Other,
        }
    }
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a generic error with context and source
    pub fn with_source(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Other {
            context: context.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Result type alias using the unified Error type
pub type Result<T> = std::result::Result<T, Error>;
