//! Per-key job state
//!
//! One explicit state per poll key. The "generating" flag a surface shows and
//! the durable in-flight flag are both derived from it.

use crate::error::StateMachineError;
use serde::{Deserialize, Serialize};

/// Lifecycle of the job behind one poll key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Nothing in flight
    Idle,
    /// Flag written, start call issued or loop not yet fetching
    Starting,
    /// Loop is fetching status
    Polling,
    /// Last run finished with a result
    Done,
    /// Last run failed
    Failed,
}

impl JobState {
    /// Whether a job is in flight
    #[inline]
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, JobState::Starting | JobState::Polling)
    }

    /// Whether this is a terminal state
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::Failed)
    }
}

/// Validates a state transition.
pub fn validate_transition(from: JobState, to: JobState) -> Result<(), StateMachineError> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(StateMachineError::IllegalTransition { from, to })
    }
}

/// States reachable from `from` in one step
#[must_use]
pub fn allowed_transitions(from: JobState) -> &'static [JobState] {
    use JobState::*;
    match from {
        Idle => &[Starting],
        Starting => &[Polling, Failed],
        Polling => &[Done, Failed],
        Done | Failed => &[Starting],
    }
}
