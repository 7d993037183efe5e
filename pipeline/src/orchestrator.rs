//! Phase orchestrator for one feature request.
//!
//! Drives `ContextAnalysis -> IntentParsing -> ImpactAnalysis -> CodeSynthesis
//! -> Execution -> [SandboxTesting] -> Done | Failed`, passing one
//! [`WorkflowState`] forward. Each phase runs on its own thread against a copy
//! of the state and is bounded by its configured timeout; a phase that errors,
//! panics or times out leaves the previous state in place and is recorded as a
//! soft failure unless the phase is critical. The workflow always ends in a
//! [`Report`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{info, instrument, warn};

use crate::agents::intent::IntentParser;
use crate::agents::repair::WorkerRepairer;
use crate::agents::synthesis::{
    PassNote, SynthesisDriver, SynthesisRequest, SynthesisSettings, mark_done_tasks,
};
use crate::apply::apply_patches;
use crate::core::error::{PipelineError, kind_of};
use crate::core::feature_spec::trace_tasks;
use crate::core::report::{Report, aggregate};
use crate::core::scope::{AllowedSet, ExpansionRules, ScopeHint};
use crate::core::state::WorkflowState;
use crate::core::types::{
    ErrorKind, Phase, PhaseRecord, PhaseStatus, ProjectContext, SandboxReport, SandboxStatus,
    TaskKind,
};
use crate::impact::analyze_impact;
use crate::io::artifacts::{RunPaths, write_report};
use crate::io::config::PipelineConfig;
use crate::io::detect::ContextDetector;
use crate::io::fs::{FencedFileSystem, FileSystem};
use crate::io::sandbox::Sandbox;
use crate::io::worker::Worker;
use crate::sandbox_loop::{SandboxLoopRequest, SandboxLoopSettings, run_sandbox_loop};

/// Extra wait beyond a phase timeout for the phase to hand back partial output.
const PHASE_GRACE: Duration = Duration::from_millis(250);

/// Shared abort signal, checked between phases and between sandbox iterations.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// External collaborators the workflow drives.
#[derive(Clone)]
pub struct Collaborators {
    pub detector: Arc<dyn ContextDetector>,
    pub worker: Arc<dyn Worker>,
    pub sandbox: Arc<dyn Sandbox>,
    /// Filesystem action provider rooted at the target codebase.
    pub fs: Arc<dyn FileSystem>,
}

#[derive(Debug, Clone, Default)]
pub struct WorkflowRequest {
    pub feature_request: String,
    /// Affected-file hints added to the configured ones.
    pub affected_files: Vec<String>,
    /// Generated when absent.
    pub workflow_id: Option<String>,
}

#[derive(Clone)]
struct PhaseContext {
    collaborators: Collaborators,
    config: PipelineConfig,
    cancel: CancelFlag,
    paths: RunPaths,
    hints: Vec<String>,
}

enum PhaseRun {
    Finished(WorkflowState),
    Errored(anyhow::Error),
    TimedOut(Duration),
    Panicked,
}

/// Run one feature request end to end. Never fails; every outcome is a report.
#[instrument(skip_all, fields(workflow_id = tracing::field::Empty))]
pub fn run_workflow(
    collaborators: &Collaborators,
    config: &PipelineConfig,
    request: &WorkflowRequest,
    cancel: &CancelFlag,
) -> Report {
    let workflow_id = request
        .workflow_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    tracing::Span::current().record("workflow_id", workflow_id.as_str());

    let root = canonical_root(collaborators.fs.root());
    let mut state = WorkflowState::new(&workflow_id, &request.feature_request, root.clone());
    let mut hints = config.affected_files.clone();
    hints.extend(request.affected_files.iter().cloned());
    let ctx = Arc::new(PhaseContext {
        collaborators: collaborators.clone(),
        config: config.clone(),
        cancel: cancel.clone(),
        paths: RunPaths::new(&artifacts_root(&root, &config.artifacts_dir), &workflow_id),
        hints,
    });
    info!(root = %root.display(), "workflow started");

    let mut phase = Phase::ContextAnalysis;
    while !phase.is_terminal() {
        if cancel.is_cancelled() {
            warn!(phase = %phase, "workflow cancelled");
            state.record_error(phase, ErrorKind::Cancelled, PipelineError::Cancelled(phase).to_string(), true);
            state.failed_phase = Some(phase);
            break;
        }
        if phase == Phase::SandboxTesting && !sandbox_applicable(&ctx, &mut state) {
            state.phase_history.push(PhaseRecord {
                phase,
                status: PhaseStatus::Skipped,
                duration_ms: 0,
            });
            info!(phase = %phase, "phase skipped");
            phase = Phase::Done;
            continue;
        }

        state.current_phase = phase;
        let started = Instant::now();
        let errors_before = state.errors.len();
        state = execute_phase(phase, state, &ctx);

        if ctx.cancel.is_cancelled() && phase == Phase::SandboxTesting {
            state.record_error(phase, ErrorKind::Cancelled, PipelineError::Cancelled(phase).to_string(), true);
            state.failed_phase = Some(phase);
        }
        if state.failed_phase.is_none() {
            if let Some(reason) = critical_failure(phase, &state) {
                let err = PipelineError::CriticalPhase {
                    phase,
                    reason: reason.to_string(),
                };
                warn!(phase = %phase, reason, "critical phase failed");
                state.record_error(phase, ErrorKind::CriticalPhase, err.to_string(), true);
                state.failed_phase = Some(phase);
            }
        }

        let status = if state.failed_phase == Some(phase) {
            PhaseStatus::Failed
        } else if state.errors.len() > errors_before {
            PhaseStatus::SoftFailed
        } else {
            PhaseStatus::Completed
        };
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        state.phase_history.push(PhaseRecord {
            phase,
            status,
            duration_ms,
        });
        info!(phase = %phase, status = ?status, duration_ms, "phase finished");

        if state.failed_phase.is_some() {
            break;
        }
        phase = next_phase(phase);
    }

    state.current_phase = if state.is_failed() {
        Phase::Failed
    } else {
        Phase::Done
    };
    let report = aggregate(&state);
    if let Err(err) = write_report(&ctx.paths, &report) {
        warn!(error = %format!("{err:#}"), "failed to write report artifact");
    }
    info!(verdict = report.verdict.as_str(), "workflow finished");
    report
}

fn next_phase(phase: Phase) -> Phase {
    match phase {
        Phase::ContextAnalysis => Phase::IntentParsing,
        Phase::IntentParsing => Phase::ImpactAnalysis,
        Phase::ImpactAnalysis => Phase::CodeSynthesis,
        Phase::CodeSynthesis => Phase::Execution,
        Phase::Execution => Phase::SandboxTesting,
        Phase::SandboxTesting | Phase::Done => Phase::Done,
        Phase::Failed => Phase::Failed,
    }
}

/// Conditions that move the workflow to `Failed` after `phase`.
fn critical_failure(phase: Phase, state: &WorkflowState) -> Option<&'static str> {
    match phase {
        Phase::IntentParsing if state.feature_spec.is_none() => Some("no feature spec produced"),
        Phase::CodeSynthesis if state.patches.is_empty() => Some("no patch was accepted"),
        Phase::Execution if state.applied.is_empty() => Some("no patch could be written"),
        _ => None,
    }
}

/// Run one phase on its own thread, bounded by the phase timeout.
///
/// The phase writes to the codebase through its own fence, which is closed as
/// soon as the orchestrator stops waiting; a phase left running after a
/// timeout can no longer touch the codebase.
fn execute_phase(phase: Phase, state: WorkflowState, ctx: &Arc<PhaseContext>) -> WorkflowState {
    let timeout = ctx.config.phases.for_phase(phase);
    let deadline = Instant::now() + timeout;
    let (tx, rx) = mpsc::channel();
    let input = state.clone();
    let fence = Arc::new(FencedFileSystem::new(Arc::clone(&ctx.collaborators.fs)));
    let mut fenced_ctx = PhaseContext::clone(ctx);
    fenced_ctx.collaborators.fs = Arc::clone(&fence) as Arc<dyn FileSystem>;
    let phase_ctx = Arc::new(fenced_ctx);
    let spawned = thread::Builder::new()
        .name(format!("phase-{phase}"))
        .spawn(move || {
            let result = run_phase(phase, input, &phase_ctx, deadline);
            let _ = tx.send(result);
        });

    let run = match spawned {
        Err(err) => PhaseRun::Errored(anyhow!(err).context("spawn phase thread")),
        Ok(_) => match rx.recv_timeout(timeout + PHASE_GRACE) {
            Ok(Ok(next)) => PhaseRun::Finished(next),
            Ok(Err(err)) => PhaseRun::Errored(err),
            Err(RecvTimeoutError::Timeout) => PhaseRun::TimedOut(timeout),
            Err(RecvTimeoutError::Disconnected) => PhaseRun::Panicked,
        },
    };

    let written = fence.close();
    let mut state = state;
    let detail = match run {
        PhaseRun::Finished(next) => return next,
        PhaseRun::Errored(err) => {
            warn!(phase = %phase, error = %format!("{err:#}"), "phase failed");
            state.record_error(phase, kind_of(&err), format!("{err:#}"), false);
            format!("phase failed: {err:#}")
        }
        PhaseRun::TimedOut(timeout) => {
            warn!(phase = %phase, ?timeout, "phase timed out");
            state.record_error(
                phase,
                ErrorKind::PhaseTimeout,
                PipelineError::PhaseTimeout { phase, timeout }.to_string(),
                false,
            );
            "phase timeout".to_string()
        }
        PhaseRun::Panicked => {
            warn!(phase = %phase, "phase panicked");
            state.record_error(phase, ErrorKind::Collaborator, format!("phase {phase} panicked"), false);
            "phase panicked".to_string()
        }
    };
    // The phase's state is discarded, but files it wrote before the fence closed stay listed.
    for path in written {
        if !state.applied.contains(&path) {
            state.applied.push(path);
        }
    }
    if phase == Phase::SandboxTesting && state.sandbox_report.is_none() {
        state.sandbox_report = Some(SandboxReport::terminal(
            SandboxStatus::FatalInfraError,
            ctx.config.sandbox.max_iterations,
            detail,
        ));
    }
    state
}

fn run_phase(
    phase: Phase,
    state: WorkflowState,
    ctx: &PhaseContext,
    deadline: Instant,
) -> Result<WorkflowState> {
    match phase {
        Phase::ContextAnalysis => context_analysis(state, ctx),
        Phase::IntentParsing => intent_parsing(state, ctx),
        Phase::ImpactAnalysis => impact_analysis(state, ctx),
        Phase::CodeSynthesis => code_synthesis(state, ctx, deadline),
        Phase::Execution => execution(state, ctx),
        Phase::SandboxTesting => sandbox_testing(state, ctx, deadline),
        Phase::Done | Phase::Failed => Ok(state),
    }
}

fn context_analysis(mut state: WorkflowState, ctx: &PhaseContext) -> Result<WorkflowState> {
    let context = ctx
        .collaborators
        .detector
        .detect(&state.codebase_root)
        .context("detect project context")?;
    info!(
        project_type = context.project_type.as_deref().unwrap_or("unknown"),
        framework = context.framework_id.as_deref().unwrap_or("none"),
        "project context detected"
    );
    state.context = Some(context);
    Ok(state)
}

fn intent_parsing(mut state: WorkflowState, ctx: &PhaseContext) -> Result<WorkflowState> {
    let context = state.context.clone().unwrap_or_default();
    let parser = IntentParser::new(
        ctx.collaborators.worker.as_ref(),
        ctx.config.synthesis.prompt_budget_bytes,
    );
    let mut spec = parser.parse(&state.feature_request, &context, &ctx.hints)?;
    for refused in trace_tasks(&mut spec, &state.feature_request) {
        warn!(entity = %refused.entity, reason = %refused.reason, "task refused");
        state.record_error(
            Phase::IntentParsing,
            ErrorKind::UntraceableTask,
            format!("task {} ({}) refused: {}", refused.index, refused.entity, refused.reason),
            false,
        );
    }
    state.feature_spec = Some(spec);
    Ok(state)
}

fn impact_analysis(mut state: WorkflowState, ctx: &PhaseContext) -> Result<WorkflowState> {
    let spec = state
        .feature_spec
        .as_ref()
        .ok_or_else(|| anyhow!("impact analysis requires a feature spec"))?;
    let context = state.context.clone().unwrap_or_default();
    let outcome = analyze_impact(
        ctx.collaborators.fs.as_ref(),
        spec,
        &context,
        &ctx.hints,
        &ctx.config.scope.default_dir,
    )?;
    if let Some(spec) = state.feature_spec.as_mut() {
        for &index in &outcome.reclassified {
            if let Some(task) = spec.tasks.get_mut(index) {
                warn!(entity = %task.entity, "create task targets an existing file; running it as an extension");
                task.kind = TaskKind::Extend;
            }
        }
    }
    for entity in &outcome.unresolved {
        state.record_error(
            Phase::ImpactAnalysis,
            ErrorKind::UntraceableTask,
            format!("no file found for extended entity {entity}"),
            false,
        );
    }
    state.allowed_set = Some(resolve_allowed(&state.codebase_root, &outcome.hint, &context, ctx));
    state.scope_hint = Some(outcome.hint);
    Ok(state)
}

fn code_synthesis(
    mut state: WorkflowState,
    ctx: &PhaseContext,
    deadline: Instant,
) -> Result<WorkflowState> {
    let context = state.context.clone().unwrap_or_default();
    let hint = state.scope_hint.clone().unwrap_or_default();
    let allowed = allowed_for(&state, &context, ctx);
    let mut spec = state
        .feature_spec
        .clone()
        .ok_or_else(|| anyhow!("code synthesis requires a feature spec"))?;

    let driver = SynthesisDriver::new(
        ctx.collaborators.worker.as_ref(),
        ctx.collaborators.fs.as_ref(),
        synthesis_settings(ctx, ctx.config.synthesis.max_turns),
    );
    let outcome = driver.synthesize(&SynthesisRequest {
        spec: &spec,
        hint: &hint,
        context: &context,
        allowed: &allowed,
        deadline,
    })?;
    state.record_decisions(Phase::CodeSynthesis, &outcome.decisions);
    record_notes(&mut state, Phase::CodeSynthesis, &outcome.notes);
    mark_done_tasks(&mut spec, &outcome.patches, &state.codebase_root);
    info!(patches = outcome.patches.len(), shapes = ?outcome.shapes, "code synthesis finished");

    state.patches.extend(outcome.patches);
    state.feature_spec = Some(spec);
    state.allowed_set = Some(allowed);
    Ok(state)
}

fn execution(mut state: WorkflowState, ctx: &PhaseContext) -> Result<WorkflowState> {
    let context = state.context.clone().unwrap_or_default();
    let allowed = allowed_for(&state, &context, ctx);
    let outcome = apply_patches(
        ctx.collaborators.fs.as_ref(),
        &allowed,
        ctx.config.scope.mode,
        &state.patches,
    );
    state.record_decisions(Phase::Execution, &outcome.decisions);
    for failure in &outcome.failures {
        state.record_error(Phase::Execution, ErrorKind::Collaborator, failure.clone(), false);
    }
    state.applied = outcome.applied;
    Ok(state)
}

fn sandbox_testing(
    mut state: WorkflowState,
    ctx: &PhaseContext,
    deadline: Instant,
) -> Result<WorkflowState> {
    let context = state.context.clone().unwrap_or_default();
    let allowed = allowed_for(&state, &context, ctx);
    let project_type = context.project_type.as_deref();
    let profile = project_type.and_then(|id| ctx.collaborators.detector.sandbox_profile(id));
    let intent = state
        .feature_spec
        .as_ref()
        .map(|spec| spec.intent_summary.clone())
        .unwrap_or_else(|| state.feature_request.clone());

    let repairer = WorkerRepairer::new(
        ctx.collaborators.worker.as_ref(),
        ctx.collaborators.fs.as_ref(),
        synthesis_settings(ctx, ctx.config.sandbox.repair_max_turns),
    );
    let outcome = run_sandbox_loop(
        ctx.collaborators.sandbox.as_ref(),
        &repairer,
        &SandboxLoopSettings::from(&ctx.config.sandbox),
        &SandboxLoopRequest {
            project_type,
            profile,
            codebase: ctx.collaborators.fs.as_ref(),
            allowed: &allowed,
            mode: ctx.config.scope.mode,
            intent: &intent,
            deadline,
            cancel: &ctx.cancel,
            artifacts: Some(&ctx.paths),
        },
    );

    state.record_decisions(Phase::SandboxTesting, &outcome.decisions);
    record_notes(&mut state, Phase::SandboxTesting, &outcome.notes);
    match outcome.report.status {
        SandboxStatus::MaxIterationsReached => {
            let err = PipelineError::MaxIterationsExceeded {
                max_iterations: outcome.report.max_iterations,
            };
            state.record_error(Phase::SandboxTesting, err.kind(), err.to_string(), false);
        }
        SandboxStatus::FatalInfraError if !outcome.cancelled => {
            let err = PipelineError::SandboxInfraError(
                outcome.report.detail.clone().unwrap_or_default(),
            );
            state.record_error(Phase::SandboxTesting, err.kind(), err.to_string(), false);
        }
        _ => {}
    }
    for path in outcome.applied {
        if !state.applied.contains(&path) {
            state.applied.push(path);
        }
    }
    state.patches.extend(outcome.repair_patches);
    state.sandbox_report = Some(outcome.report);
    Ok(state)
}

/// Sandbox routing: enabled in config and a testable project type detected.
///
/// Records a `not_applicable` report when enabled but unsupported.
fn sandbox_applicable(ctx: &PhaseContext, state: &mut WorkflowState) -> bool {
    if !ctx.config.sandbox.enabled {
        return false;
    }
    let supported = state
        .context
        .as_ref()
        .and_then(|context| context.project_type.as_deref())
        .is_some_and(|id| ctx.collaborators.detector.sandbox_profile(id).is_some());
    if !supported {
        state.sandbox_report = Some(SandboxReport::terminal(
            SandboxStatus::NotApplicable,
            ctx.config.sandbox.max_iterations,
            "no supported project type detected",
        ));
    }
    supported
}

fn synthesis_settings(ctx: &PhaseContext, max_turns: u32) -> SynthesisSettings {
    SynthesisSettings {
        max_turns,
        pass_timeout: Duration::from_secs(ctx.config.synthesis.pass_timeout_secs),
        mode: ctx.config.scope.mode,
        prompt_budget_bytes: ctx.config.synthesis.prompt_budget_bytes,
    }
}

fn resolve_allowed(
    root: &Path,
    hint: &ScopeHint,
    context: &ProjectContext,
    ctx: &PhaseContext,
) -> AllowedSet {
    AllowedSet::resolve(
        root,
        hint,
        ExpansionRules::from_conventions(&context.layer_conventions, &ctx.config.scope.extra_layer_dirs),
        &ctx.config.scope.default_dir,
    )
}

/// Allowed set from impact analysis, or the default-directory fallback.
fn allowed_for(state: &WorkflowState, context: &ProjectContext, ctx: &PhaseContext) -> AllowedSet {
    match &state.allowed_set {
        Some(allowed) => allowed.clone(),
        None => resolve_allowed(
            &state.codebase_root,
            &state.scope_hint.clone().unwrap_or_default(),
            context,
            ctx,
        ),
    }
}

fn record_notes(state: &mut WorkflowState, phase: Phase, notes: &[PassNote]) {
    for note in notes {
        state.record_error(phase, note.kind, note.message.clone(), false);
    }
}

fn canonical_root(root: &Path) -> PathBuf {
    root.canonicalize().unwrap_or_else(|_| root.to_path_buf())
}

/// Artifacts directory: absolute as configured, else under the codebase root.
pub fn artifacts_root(root: &Path, artifacts_dir: &str) -> PathBuf {
    let dir = Path::new(artifacts_dir);
    if dir.is_absolute() {
        dir.to_path_buf()
    } else {
        root.join(dir)
    }
}
