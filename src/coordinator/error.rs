//! Error types for phase execution

use std::fmt;

use super::registry::Phase;
use crate::error::{ErrorCategory, MapredErrorTrait};

/// A phase stopped before every item was accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseError {
    /// Every worker is dead while items are still unaccepted
    NoLiveWorkers { phase: Phase, remaining: usize },

    /// One item failed at the application level too many times
    ItemExhausted {
        phase: Phase,
        item: usize,
        attempts: u32,
        last_error: String,
    },
}

impl fmt::Display for PhaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoLiveWorkers { phase, remaining } => {
                write!(
                    f,
                    "{} phase stalled: no live workers left with {} item(s) unaccepted",
                    phase, remaining
                )
            }
            Self::ItemExhausted {
                phase,
                item,
                attempts,
                last_error,
            } => {
                write!(
                    f,
                    "{} item {} failed {} time(s), giving up: {}",
                    phase, item, attempts, last_error
                )
            }
        }
    }
}

impl std::error::Error for PhaseError {}

impl PhaseError {
    pub fn phase(&self) -> Phase {
        match self {
            Self::NoLiveWorkers { phase, .. } | Self::ItemExhausted { phase, .. } => *phase,
        }
    }
}

impl MapredErrorTrait for PhaseError {
    fn is_recoverable(&self) -> bool {
        // worker outages clear up; a poisoned item fails the same way again
        matches!(self, Self::NoLiveWorkers { .. })
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::NoLiveWorkers { .. } => ErrorCategory::Scheduler,
            Self::ItemExhausted { .. } => ErrorCategory::Task,
        }
    }
}
