//! Guarded `WorkerState` transition table matching the lifecycle diagram:
//! `Stopped -> Starting -> Running <-> Pausing/Paused -> Stopping -> Stopped`.

use crate::model::WorkerState;

#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid transition from {from:?} to {to:?}")]
pub struct TransitionError {
    pub from: WorkerState,
    pub to: WorkerState,
}

/// Validates `(current, requested)` against the allowed edges; returns the
/// new state on success. Self-transitions for `start`/`pause`/`stop` are
/// handled by callers as no-ops before reaching here.
pub fn transition(current: WorkerState, requested: WorkerState) -> Result<WorkerState, TransitionError> {
    use WorkerState::*;
    let allowed = matches!(
        (current, requested),
        (Stopped, Starting)
            | (Starting, Running)
            | (Running, Pausing)
            | (Pausing, Paused)
            | (Paused, Running)
            | (Running, Stopping)
            | (Paused, Stopping)
            | (Stopping, Stopped)
            | (_, Stopping)
    );
    if allowed {
        Ok(requested)
    } else {
        Err(TransitionError { from: current, to: requested })
    }
}
