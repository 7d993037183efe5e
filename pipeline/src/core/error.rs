//! Typed pipeline failures.
//!
//! Phase code returns `anyhow::Result`; these variants are attached where the
//! orchestrator needs to tell failure categories apart (via `downcast_ref`),
//! and each maps onto an [`ErrorKind`] recorded in `WorkflowState::errors`.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::core::types::{ErrorKind, Phase};

#[derive(Debug, Error)]
pub enum PipelineError {
    /// An interceptor blocked a worker output or action.
    #[error("scope violation: {reason} ({})", path.as_ref().map(|p| p.display().to_string()).unwrap_or_else(|| "no path".to_string()))]
    ScopeViolation {
        reason: String,
        path: Option<PathBuf>,
    },

    /// No normalizer recognized the worker's result shape.
    #[error("worker result shape not recognized: {0}")]
    ResultFormatMismatch(String),

    #[error("phase {phase} timed out after {timeout:?}")]
    PhaseTimeout { phase: Phase, timeout: Duration },

    /// The sandbox session cannot continue.
    #[error("sandbox infrastructure error: {0}")]
    SandboxInfraError(String),

    #[error("build failed: {0}")]
    BuildError(String),

    #[error("runtime failure: {0}")]
    RuntimeError(String),

    #[error("sandbox loop reached {max_iterations} iterations without passing")]
    MaxIterationsExceeded { max_iterations: u32 },

    #[error("workflow cancelled before {0}")]
    Cancelled(Phase),

    /// A critical phase produced no usable output.
    #[error("critical phase {phase} failed: {reason}")]
    CriticalPhase { phase: Phase, reason: String },
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::ScopeViolation { .. } => ErrorKind::ScopeViolation,
            PipelineError::ResultFormatMismatch(_) => ErrorKind::ResultFormatMismatch,
            PipelineError::PhaseTimeout { .. } => ErrorKind::PhaseTimeout,
            PipelineError::SandboxInfraError(_) => ErrorKind::SandboxInfraError,
            PipelineError::BuildError(_) => ErrorKind::BuildError,
            PipelineError::RuntimeError(_) => ErrorKind::RuntimeError,
            PipelineError::MaxIterationsExceeded { .. } => ErrorKind::MaxIterationsExceeded,
            PipelineError::Cancelled(_) => ErrorKind::Cancelled,
            PipelineError::CriticalPhase { .. } => ErrorKind::CriticalPhase,
        }
    }
}

/// Map an arbitrary phase error onto a recorded error kind.
///
/// Errors that do not carry a [`PipelineError`] are collaborator failures.
pub fn kind_of(err: &anyhow::Error) -> ErrorKind {
    err.downcast_ref::<PipelineError>()
        .map(PipelineError::kind)
        .unwrap_or(ErrorKind::Collaborator)
}
