//! Typed error hierarchy for the conductor.
//!
//! Four enums cover the four failure domains:
//! - `StageFailure`: a stage handler failed; the run parks in `paused_error`
//! - `PlanError`: a plan could not be assembled from stage names
//! - `RunError`: a registry operation was rejected for the caller
//! - `ControllerFault`: the controller's own bookkeeping failed; the run moves to `error`

use conductor_common::RunStatus;
use thiserror::Error;

/// Failure raised by a stage handler. Surfaced on the event stream as
/// `error {node, message}` and never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct StageFailure {
    pub message: String,
}

impl StageFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// An upstream call (completion or search endpoint) failed.
    pub fn upstream(what: &str, err: impl std::fmt::Display) -> Self {
        Self::new(format!("{} request failed: {}", what, err))
    }

    pub fn panicked(detail: impl std::fmt::Display) -> Self {
        Self::new(format!("stage handler panicked: {}", detail))
    }

    pub fn timed_out(secs: u64) -> Self {
        Self::new(format!("stage timed out after {}s", secs))
    }
}

/// Errors building a plan from stage names.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("Plan has no stages")]
    Empty,

    #[error("Stage '{name}' appears more than once in the plan")]
    DuplicateStage { name: String },

    #[error("Unknown stage '{name}'")]
    UnknownStage { name: String },
}

/// Rejections returned to callers of the run registry.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("Run {id} not found")]
    NotFound { id: String },

    #[error("Run {id} is paused on a stage error; resume is not supported, stop the run instead")]
    ResumeRejected { id: String },

    #[error(transparent)]
    Plan(#[from] PlanError),
}

/// Unexpected failures in the controller itself (not in a stage).
#[derive(Debug, Error)]
pub enum ControllerFault {
    #[error("Illegal status transition {from} -> {to}")]
    IllegalTransition { from: RunStatus, to: RunStatus },

    #[error("Event bus for run {run_id} is already closed")]
    BusClosed { run_id: String },

    #[error("Plan resolution failed: {0}")]
    Plan(#[from] PlanError),

    #[error("Run controller panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
