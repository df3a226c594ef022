//! Exit code logic for the mirror process.
//!
//! Single responsibility: map a run status to the process exit outcome.

use mirror_core::RunStatus;

use crate::ProcessExit;

/// Determines the process exit outcome from a finished run.
pub(crate) fn determine_exit_outcome(status: &RunStatus) -> ProcessExit {
    match status {
        RunStatus::Success => ProcessExit::Success,
        RunStatus::PartialFailure => ProcessExit::Partial,
        RunStatus::Interrupted => ProcessExit::Interrupted,
        RunStatus::Aborted { .. } => ProcessExit::Failure,
    }
}
