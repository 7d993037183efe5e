//! Shared deterministic types for the pipeline.
//!
//! These types define stable contracts between phases. They should not
//! depend on external state or I/O and must serialize identically across runs.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Orchestrator phase. `Done` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    ContextAnalysis,
    IntentParsing,
    ImpactAnalysis,
    CodeSynthesis,
    Execution,
    SandboxTesting,
    Done,
    Failed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::ContextAnalysis => "context_analysis",
            Phase::IntentParsing => "intent_parsing",
            Phase::ImpactAnalysis => "impact_analysis",
            Phase::CodeSynthesis => "code_synthesis",
            Phase::Execution => "execution",
            Phase::SandboxTesting => "sandbox_testing",
            Phase::Done => "done",
            Phase::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Done | Phase::Failed)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    /// Phase produced its full output.
    Completed,
    /// Phase recorded errors but the workflow continued with partial output.
    SoftFailed,
    /// Phase failed critically; the workflow moved to `Failed`.
    Failed,
    /// Phase was not entered (conditional routing).
    Skipped,
}

/// One entry in the per-phase history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: Phase,
    pub status: PhaseStatus,
    pub duration_ms: u64,
}

/// Whether a task creates a new entity or extends an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Create,
    Extend,
}

/// A unit of work derived from the feature request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub description: String,
    /// Entity this task creates or extends (e.g. `StatusController`).
    pub entity: String,
    pub kind: TaskKind,
    /// Root-relative file the task is expected to touch, when known.
    #[serde(default)]
    pub target_file: Option<String>,
    #[serde(default)]
    pub done: bool,
    /// Set when the task could not be traced back to the feature request.
    #[serde(default)]
    pub refused: bool,
}

/// Structured interpretation of a feature request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSpec {
    pub intent_summary: String,
    #[serde(default)]
    pub entities_to_create: Vec<String>,
    #[serde(default)]
    pub entities_to_extend: Vec<String>,
    pub tasks: Vec<Task>,
    /// Features explicitly out of scope for this request.
    #[serde(default)]
    pub excluded_features: Vec<String>,
    /// Candidate files the intent parser believes are affected.
    #[serde(default)]
    pub candidate_files: Vec<String>,
}

impl FeatureSpec {
    /// Tasks that survived traceability checks.
    pub fn active_tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter().filter(|task| !task.refused)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchOperation {
    Create,
    Modify,
}

impl PatchOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatchOperation::Create => "create",
            PatchOperation::Modify => "modify",
        }
    }
}

/// Which stage produced a patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchOrigin {
    Synthesis,
    Repair,
}

/// One accepted file creation or modification.
///
/// `target_path` is absolute and normalized; it was checked against the
/// allowed set before the patch was accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    pub target_path: PathBuf,
    pub operation: PatchOperation,
    /// Full file content after the change.
    pub payload: String,
    pub origin: PatchOrigin,
}

/// Scope enforcement mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnforcementMode {
    /// Block on violation.
    #[default]
    Hard,
    /// Warn on violation and still execute. Debug only.
    Soft,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionKind {
    Allow,
    Block,
    Warn,
}

impl DecisionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionKind::Allow => "allow",
            DecisionKind::Block => "block",
            DecisionKind::Warn => "warn",
        }
    }
}

/// Where an interceptor decision was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterceptionPoint {
    OutputCheck,
    ActionGate,
    PatchAcceptance,
}

impl InterceptionPoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterceptionPoint::OutputCheck => "output_check",
            InterceptionPoint::ActionGate => "action_gate",
            InterceptionPoint::PatchAcceptance => "patch_acceptance",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterceptorDecision {
    pub kind: DecisionKind,
    pub point: InterceptionPoint,
    pub reason: String,
    pub resolved_path: Option<PathBuf>,
}

impl InterceptorDecision {
    pub fn is_violation(&self) -> bool {
        self.kind != DecisionKind::Allow
    }
}

/// A blocked or warned interceptor decision, kept for the report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub phase: Phase,
    pub point: InterceptionPoint,
    pub kind: DecisionKind,
    pub reason: String,
    pub resolved_path: Option<PathBuf>,
}

impl Violation {
    pub fn from_decision(phase: Phase, decision: &InterceptorDecision) -> Self {
        Self {
            phase,
            point: decision.point,
            kind: decision.kind,
            reason: decision.reason.clone(),
            resolved_path: decision.resolved_path.clone(),
        }
    }
}

/// Serializable error category recorded in `WorkflowState::errors`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ScopeViolation,
    ResultFormatMismatch,
    PhaseTimeout,
    SandboxInfraError,
    BuildError,
    RuntimeError,
    MaxIterationsExceeded,
    UntraceableTask,
    Cancelled,
    CriticalPhase,
    Collaborator,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseError {
    pub phase: Phase,
    pub kind: ErrorKind,
    pub message: String,
    /// True when this error moved the workflow to `Failed`.
    pub fatal: bool,
}

/// Layer convention reported by the context detector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerConvention {
    /// Layer name, e.g. `controller` or `service`.
    pub layer: String,
    /// Directory names conventionally holding this layer.
    pub directories: Vec<String>,
    /// File-name suffix used for this layer, e.g. `Controller`.
    #[serde(default)]
    pub file_suffix: Option<String>,
}

/// Structural and framework summary of a codebase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectContext {
    pub structure_summary: String,
    #[serde(default)]
    pub framework_id: Option<String>,
    /// Registry id of the detected project type, if any.
    #[serde(default)]
    pub project_type: Option<String>,
    /// File extension of the dominant source language, without the dot.
    #[serde(default)]
    pub primary_extension: Option<String>,
    #[serde(default)]
    pub layer_conventions: Vec<LayerConvention>,
}

/// Sandbox failure classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    CompileTime,
    Runtime,
    Timeout,
    Infrastructure,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::CompileTime => "compile_time",
            ErrorClass::Runtime => "runtime",
            ErrorClass::Timeout => "timeout",
            ErrorClass::Infrastructure => "infrastructure",
        }
    }
}

/// Repair approach selected for an error class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairStrategy {
    FixCompileErrors,
    FixRuntimeFailure,
    FixStartupStall,
    /// Stop iterating for the current session.
    Unrecoverable,
}

impl RepairStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepairStrategy::FixCompileErrors => "fix_compile_errors",
            RepairStrategy::FixRuntimeFailure => "fix_runtime_failure",
            RepairStrategy::FixStartupStall => "fix_startup_stall",
            RepairStrategy::Unrecoverable => "unrecoverable",
        }
    }
}

/// Outcome of one sandbox command (build, or the run/health-check stage).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepResult {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub duration_ms: u64,
    /// Bounded tail of the command output.
    pub log_tail: String,
}

/// Health-check observations for a started artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub polls: u32,
    pub process_alive: bool,
    /// `None` when the project type does not expose a port.
    pub port_open: Option<bool>,
    pub readiness_matched: bool,
    pub healthy: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    pub step: StepResult,
    pub health: Option<HealthReport>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationOutcome {
    /// Build and health checks passed.
    Passed,
    /// Failure classified and a repair was applied.
    Repaired,
    /// Failure classified but the repair produced nothing usable.
    RepairFailed,
    /// Failure on the final iteration; no repair attempted.
    Exhausted,
    /// Failure that ends the session.
    Unrecoverable,
}

/// Immutable record of one sandbox loop turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxIterationRecord {
    pub iteration_number: u32,
    pub build_result: StepResult,
    pub run_result: Option<RunResult>,
    pub error_classification: Option<ErrorClass>,
    pub repair_patches: Vec<Patch>,
    pub outcome: IterationOutcome,
}

/// Terminal status of the sandbox loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Success,
    MaxIterationsReached,
    NotApplicable,
    FatalInfraError,
}

impl SandboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxStatus::Success => "success",
            SandboxStatus::MaxIterationsReached => "max_iterations_reached",
            SandboxStatus::NotApplicable => "not_applicable",
            SandboxStatus::FatalInfraError => "fatal_infra_error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxReport {
    pub status: SandboxStatus,
    pub project_type: Option<String>,
    pub max_iterations: u32,
    pub iterations: Vec<SandboxIterationRecord>,
    pub endpoint: Option<String>,
    pub detail: Option<String>,
}

impl SandboxReport {
    pub fn terminal(status: SandboxStatus, max_iterations: u32, detail: impl Into<String>) -> Self {
        Self {
            status,
            project_type: None,
            max_iterations,
            iterations: Vec::new(),
            endpoint: None,
            detail: Some(detail.into()),
        }
    }
}

/// Final user-visible verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    ImplementedAndVerified,
    ImplementedUnverified,
    NotImplemented,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::ImplementedAndVerified => "implemented_and_verified",
            Verdict::ImplementedUnverified => "implemented_unverified",
            Verdict::NotImplemented => "not_implemented",
        }
    }
}
