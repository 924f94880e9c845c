//! Output acceptance: first committer wins
//!
//! Speculative copies and failure retries can both race an original attempt
//! that eventually succeeds. The first successful completion of an item is
//! accepted and its location recorded for good; every later success is a
//! duplicate whose output must be removed by the caller once the state lock
//! is released.

use std::path::PathBuf;

use super::registry::TaskState;

/// Outcome of offering a successful result for acceptance
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acceptance {
    /// This result is the item's accepted result
    Accepted,

    /// The item was already accepted; `discard` is this attempt's output to delete
    Duplicate { discard: Option<PathBuf> },
}

impl Acceptance {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

/// Offer a successful result at `location` for `task`
pub fn accept(task: &mut TaskState, location: Option<PathBuf>) -> Acceptance {
    if task.accepted {
        // never hand back the accepted location itself
        let discard = location.filter(|l| task.accepted_location.as_ref() != Some(l));
        return Acceptance::Duplicate { discard };
    }

    task.accepted = true;
    task.accepted_location = location;
    Acceptance::Accepted
}
