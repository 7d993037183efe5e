//! Sandbox test-repair loop.
//!
//! Uploads the patched codebase into an isolated session, then iterates:
//! build, start, health-check, and on failure classify, repair and retry.
//! The loop never runs more than `max_iterations` turns, records every turn
//! as an immutable [`SandboxIterationRecord`], and tears the session down on
//! every exit path.

use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use regex::Regex;
use tracing::{debug, info, info_span, instrument, warn};

use crate::agents::repair::{RepairRequest, Repairer};
use crate::agents::synthesis::PassNote;
use crate::apply::apply_patches;
use crate::core::budget::clamp_to_deadline;
use crate::core::classifier::{FailureStage, classify_failure, is_recoverable};
use crate::core::path::relative_display;
use crate::core::scope::AllowedSet;
use crate::core::types::{
    EnforcementMode, ErrorClass, ErrorKind, HealthReport, InterceptorDecision, IterationOutcome,
    Patch, RunResult, SandboxIterationRecord, SandboxReport, SandboxStatus, StepResult,
};
use crate::io::artifacts::{RunPaths, write_sandbox_iteration};
use crate::io::config::SandboxConfig;
use crate::io::detect::SandboxProfile;
use crate::io::fs::FileSystem;
use crate::io::process::tail;
use crate::io::sandbox::{
    BackgroundProcess, CommandResult, ProcessState, Sandbox, SandboxSession, SessionHandle,
    collect_upload,
};
use crate::orchestrator::CancelFlag;

/// Bytes of output kept in a step's `log_tail`.
const STEP_LOG_TAIL_BYTES: usize = 4_000;

#[derive(Debug, Clone)]
pub struct SandboxLoopSettings {
    pub max_iterations: u32,
    pub build_timeout: Duration,
    pub run_timeout: Duration,
    pub poll_interval: Duration,
    pub health_attempts: u32,
    pub readiness_override: Option<String>,
}

impl From<&SandboxConfig> for SandboxLoopSettings {
    fn from(cfg: &SandboxConfig) -> Self {
        Self {
            max_iterations: cfg.max_iterations,
            build_timeout: Duration::from_secs(cfg.build_timeout_secs),
            run_timeout: Duration::from_secs(cfg.run_timeout_secs),
            poll_interval: cfg.poll_interval(),
            health_attempts: cfg.health_attempts,
            readiness_override: cfg.readiness_pattern.clone(),
        }
    }
}

pub struct SandboxLoopRequest<'a> {
    pub project_type: Option<&'a str>,
    pub profile: Option<SandboxProfile>,
    pub codebase: &'a dyn FileSystem,
    pub allowed: &'a AllowedSet,
    pub mode: EnforcementMode,
    pub intent: &'a str,
    pub deadline: Instant,
    pub cancel: &'a CancelFlag,
    pub artifacts: Option<&'a RunPaths>,
}

#[derive(Debug, Clone)]
pub struct SandboxLoopOutcome {
    pub report: SandboxReport,
    /// Repair patches accepted across all iterations.
    pub repair_patches: Vec<Patch>,
    /// Codebase files written by repairs.
    pub applied: Vec<PathBuf>,
    pub decisions: Vec<InterceptorDecision>,
    pub notes: Vec<PassNote>,
    pub cancelled: bool,
}

impl SandboxLoopOutcome {
    fn new(report: SandboxReport) -> Self {
        Self {
            report,
            repair_patches: Vec::new(),
            applied: Vec::new(),
            decisions: Vec::new(),
            notes: Vec::new(),
            cancelled: false,
        }
    }

    fn finish(&mut self, status: SandboxStatus, detail: impl Into<String>) {
        self.report.status = status;
        self.report.detail = Some(detail.into());
    }
}

/// Why the current session must stop.
enum Stop {
    Infra(String),
}

#[instrument(skip_all, fields(project_type = request.project_type.unwrap_or("none")))]
pub fn run_sandbox_loop(
    sandbox: &dyn Sandbox,
    repairer: &dyn Repairer,
    settings: &SandboxLoopSettings,
    request: &SandboxLoopRequest<'_>,
) -> SandboxLoopOutcome {
    let max = settings.max_iterations;
    let Some(profile) = request.profile.clone() else {
        info!("no sandbox profile for project type; skipping");
        return SandboxLoopOutcome::new(SandboxReport::terminal(
            SandboxStatus::NotApplicable,
            max,
            "project type has no sandbox profile",
        ));
    };
    let mut outcome = SandboxLoopOutcome::new(SandboxReport {
        status: SandboxStatus::MaxIterationsReached,
        project_type: request.project_type.map(str::to_string),
        max_iterations: max,
        iterations: Vec::new(),
        endpoint: None,
        detail: None,
    });

    let readiness = match settings
        .readiness_override
        .as_deref()
        .or(profile.readiness_pattern.as_deref())
        .map(Regex::new)
        .transpose()
    {
        Ok(readiness) => readiness,
        Err(err) => {
            outcome.finish(SandboxStatus::FatalInfraError, format!("invalid readiness pattern: {err}"));
            return outcome;
        }
    };

    let session = match SandboxSession::open(sandbox) {
        Ok(session) => session,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "sandbox session could not be opened");
            outcome.finish(SandboxStatus::FatalInfraError, format!("{err:#}"));
            return outcome;
        }
    };

    if let Err(Stop::Infra(detail)) = prepare(&session, &profile, settings, request) {
        outcome.finish(SandboxStatus::FatalInfraError, detail);
    } else {
        let context = LoopContext {
            sandbox,
            handle: session.handle(),
            repairer,
            settings,
            request,
            profile: &profile,
            readiness: readiness.as_ref(),
        };
        context.iterate(&mut outcome);
    }

    if let Err(err) = session.close() {
        warn!(error = %format!("{err:#}"), "sandbox teardown failed");
        outcome.notes.push(PassNote {
            kind: ErrorKind::SandboxInfraError,
            message: format!("sandbox teardown failed: {err:#}"),
        });
    }
    info!(
        status = outcome.report.status.as_str(),
        iterations = outcome.report.iterations.len(),
        "sandbox loop finished"
    );
    outcome
}

/// Prerequisite checks and the initial upload.
fn prepare(
    session: &SandboxSession<'_>,
    profile: &SandboxProfile,
    settings: &SandboxLoopSettings,
    request: &SandboxLoopRequest<'_>,
) -> std::result::Result<(), Stop> {
    let sandbox = session.sandbox();
    let handle = session.handle();
    for command in &profile.prerequisites {
        let timeout = clamp_to_deadline(settings.build_timeout, request.deadline)
            .ok_or_else(|| Stop::Infra("phase deadline reached during prerequisites".to_string()))?;
        let result = sandbox
            .run(handle, command, timeout)
            .map_err(|err| Stop::Infra(format!("prerequisite {}: {err:#}", command.join(" "))))?;
        if !result.success {
            let step = step_from(&result);
            let class = classify_failure(FailureStage::Prerequisites, &step);
            return Err(Stop::Infra(format!(
                "prerequisite `{}` failed ({}): {}",
                command.join(" "),
                class.as_str(),
                tail(&result.output, 500)
            )));
        }
    }
    let files = collect_upload(request.codebase.root())
        .map_err(|err| Stop::Infra(format!("collect upload: {err:#}")))?;
    sandbox
        .upload(handle, &files)
        .map_err(|err| Stop::Infra(format!("upload: {err:#}")))?;
    debug!(files = files.len(), "codebase uploaded");
    Ok(())
}

struct LoopContext<'a> {
    sandbox: &'a dyn Sandbox,
    handle: &'a SessionHandle,
    repairer: &'a dyn Repairer,
    settings: &'a SandboxLoopSettings,
    request: &'a SandboxLoopRequest<'a>,
    profile: &'a SandboxProfile,
    readiness: Option<&'a Regex>,
}

/// Observed failure of one iteration.
struct Failure {
    stage: FailureStage,
    step: StepResult,
    log: String,
}

impl LoopContext<'_> {
    fn iterate(&self, outcome: &mut SandboxLoopOutcome) {
        let max = self.settings.max_iterations;
        if max == 0 {
            outcome.finish(SandboxStatus::MaxIterationsReached, "max_iterations is zero");
            return;
        }
        for iteration in 1..=max {
            if self.request.cancel.is_cancelled() {
                outcome.cancelled = true;
                outcome.finish(
                    SandboxStatus::FatalInfraError,
                    format!("cancelled before iteration {iteration}"),
                );
                return;
            }
            if Instant::now() >= self.request.deadline {
                outcome.finish(
                    SandboxStatus::MaxIterationsReached,
                    format!("phase deadline reached before iteration {iteration}"),
                );
                return;
            }
            let span = info_span!("sandbox_iteration", iteration);
            let _guard = span.enter();
            match self.run_iteration(iteration, outcome) {
                Ok(IterationOutcome::Passed) => {
                    let endpoint = self
                        .profile
                        .port
                        .and_then(|port| self.sandbox.public_endpoint(self.handle, port).ok());
                    outcome.report.endpoint = endpoint;
                    outcome.finish(SandboxStatus::Success, format!("passed on iteration {iteration}"));
                    return;
                }
                Ok(IterationOutcome::Exhausted) => {
                    outcome.finish(
                        SandboxStatus::MaxIterationsReached,
                        format!("still failing after {max} iterations"),
                    );
                    return;
                }
                Ok(IterationOutcome::Unrecoverable) => {
                    let detail = outcome
                        .report
                        .iterations
                        .last()
                        .map(|record| match &record.run_result {
                            Some(run) => run.step.log_tail.clone(),
                            None => record.build_result.log_tail.clone(),
                        })
                        .unwrap_or_default();
                    outcome.finish(
                        SandboxStatus::FatalInfraError,
                        format!("infrastructure failure on iteration {iteration}: {}", tail(&detail, 500)),
                    );
                    return;
                }
                Ok(IterationOutcome::Repaired | IterationOutcome::RepairFailed) => {}
                Err(Stop::Infra(detail)) => {
                    outcome.finish(SandboxStatus::FatalInfraError, detail);
                    return;
                }
            }
        }
        outcome.finish(
            SandboxStatus::MaxIterationsReached,
            format!("still failing after {max} iterations"),
        );
    }

    fn run_iteration(
        &self,
        iteration: u32,
        outcome: &mut SandboxLoopOutcome,
    ) -> std::result::Result<IterationOutcome, Stop> {
        let build_timeout = clamp_to_deadline(self.settings.build_timeout, self.request.deadline)
            .ok_or_else(|| Stop::Infra("phase deadline reached before build".to_string()))?;
        let build = self
            .sandbox
            .run(self.handle, &self.profile.build, build_timeout)
            .map_err(|err| Stop::Infra(format!("build command: {err:#}")))?;
        let build_step = step_from(&build);
        info!(success = build_step.success, duration_ms = build_step.duration_ms, "sandbox build finished");

        let mut run_result = None;
        let mut run_log = None;
        let failure = if build_step.success {
            let (result, log) = self.start_and_probe()?;
            let failed = !result.step.success;
            let stage = match &result.health {
                Some(health) if health.process_alive => FailureStage::HealthCheck,
                _ => FailureStage::Run,
            };
            let step = result.step.clone();
            run_result = Some(result);
            run_log = Some(log.clone());
            failed.then_some(Failure { stage, step, log })
        } else {
            Some(Failure {
                stage: FailureStage::Build,
                step: build_step.clone(),
                log: build.output.clone(),
            })
        };

        let mut record = SandboxIterationRecord {
            iteration_number: iteration,
            build_result: build_step,
            run_result,
            error_classification: None,
            repair_patches: Vec::new(),
            outcome: IterationOutcome::Passed,
        };

        if let Some(failure) = failure {
            let class = classify_failure(failure.stage, &failure.step);
            record.error_classification = Some(class);
            info!(stage = failure.stage.as_str(), class = class.as_str(), "sandbox failure classified");
            record.outcome = if !is_recoverable(class) {
                IterationOutcome::Unrecoverable
            } else if iteration >= self.settings.max_iterations {
                IterationOutcome::Exhausted
            } else {
                let patches = self.repair(iteration, class, &failure, outcome);
                if patches.is_empty() {
                    IterationOutcome::RepairFailed
                } else {
                    self.apply_repair(&patches, outcome)?;
                    record.repair_patches = patches;
                    IterationOutcome::Repaired
                }
            };
            outcome.notes.push(PassNote {
                kind: match failure.stage {
                    FailureStage::Build => ErrorKind::BuildError,
                    FailureStage::Prerequisites | FailureStage::Upload => ErrorKind::SandboxInfraError,
                    FailureStage::Run | FailureStage::HealthCheck => ErrorKind::RuntimeError,
                },
                message: format!(
                    "iteration {iteration}: {} failure classified {}",
                    failure.stage.as_str(),
                    class.as_str()
                ),
            });
        }

        if let Some(paths) = self.request.artifacts {
            if let Err(err) = write_sandbox_iteration(paths, &record, &build.output, run_log.as_deref()) {
                warn!(error = %format!("{err:#}"), "failed to write sandbox iteration artifacts");
            }
        }
        let result = record.outcome;
        outcome.report.iterations.push(record);
        Ok(result)
    }

    /// Start the artifact, poll its health and stop it again.
    fn start_and_probe(&self) -> std::result::Result<(RunResult, String), Stop> {
        let started = Instant::now();
        let process = self
            .sandbox
            .spawn(self.handle, &self.profile.run)
            .map_err(|err| Stop::Infra(format!("start command: {err:#}")))?;
        let probed = self.poll_health(process);
        if let Err(err) = self.sandbox.stop(self.handle, process) {
            warn!(error = %format!("{err:#}"), "failed to stop started artifact");
        }
        let (health, exit_code, log) =
            probed.map_err(|err| Stop::Infra(format!("health check: {err:#}")))?;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        info!(
            healthy = health.healthy,
            polls = health.polls,
            alive = health.process_alive,
            "health check finished"
        );
        let step = StepResult {
            success: health.healthy,
            exit_code,
            timed_out: !health.healthy && health.process_alive,
            duration_ms,
            log_tail: tail(&log, STEP_LOG_TAIL_BYTES),
        };
        Ok((
            RunResult {
                step,
                health: Some(health),
            },
            log,
        ))
    }

    /// Poll liveness, new log lines and the port until healthy or out of attempts.
    fn poll_health(&self, process: BackgroundProcess) -> Result<(HealthReport, Option<i32>, String)> {
        let deadline = clamp_to_deadline(self.settings.run_timeout, self.request.deadline)
            .map(|budget| Instant::now() + budget)
            .unwrap_or_else(Instant::now);
        let mut report = HealthReport {
            polls: 0,
            process_alive: true,
            port_open: self.profile.port.map(|_| false),
            readiness_matched: false,
            healthy: false,
        };
        let mut exit_code = None;
        let mut offset = 0u64;
        let mut carry = String::new();
        let mut log = String::new();

        while report.polls < self.settings.health_attempts {
            thread::sleep(self.settings.poll_interval);
            report.polls += 1;

            let chunk = self
                .sandbox
                .read_log(self.handle, process, offset)
                .context("read process log")?;
            offset = chunk.next_offset;
            log.push_str(&chunk.text);
            carry.push_str(&chunk.text);
            while let Some(idx) = carry.find('\n') {
                let line: String = carry.drain(..=idx).collect();
                if self.readiness.is_some_and(|re| re.is_match(line.trim_end())) {
                    report.readiness_matched = true;
                }
            }
            // An unterminated last line may be all the process prints.
            if !carry.is_empty() && self.readiness.is_some_and(|re| re.is_match(&carry)) {
                report.readiness_matched = true;
            }

            if let Some(port) = self.profile.port {
                let open = self
                    .sandbox
                    .port_open(self.handle, port)
                    .context("probe port")?;
                report.port_open = Some(open);
            }

            match self
                .sandbox
                .is_running(self.handle, process)
                .context("poll process")?
            {
                ProcessState::Exited(code) => {
                    report.process_alive = false;
                    exit_code = code;
                    // A one-shot program with nothing to probe is healthy on a clean exit.
                    report.healthy = code == Some(0)
                        && self.profile.port.is_none()
                        && self.readiness.is_none_or(|_| report.readiness_matched);
                    break;
                }
                ProcessState::Running => {
                    let ready = self.readiness.is_none() || report.readiness_matched;
                    let listening = report.port_open.unwrap_or(true);
                    if ready && listening {
                        report.healthy = true;
                        break;
                    }
                }
            }
            if Instant::now() >= deadline {
                debug!(polls = report.polls, "health check time limit reached");
                break;
            }
        }
        Ok((report, exit_code, log))
    }

    fn repair(
        &self,
        iteration: u32,
        class: ErrorClass,
        failure: &Failure,
        outcome: &mut SandboxLoopOutcome,
    ) -> Vec<Patch> {
        let request = RepairRequest {
            stage: failure.stage,
            iteration,
            max_iterations: self.settings.max_iterations,
            class,
            log: &failure.log,
            intent: self.request.intent,
            allowed: self.request.allowed,
            deadline: self.request.deadline,
        };
        match self.repairer.repair(&request) {
            Ok(repair) => {
                outcome.decisions.extend(repair.decisions);
                outcome.notes.extend(repair.notes);
                info!(patches = repair.patches.len(), "repair finished");
                repair.patches
            }
            Err(err) => {
                warn!(error = %format!("{err:#}"), "repair failed");
                outcome.notes.push(PassNote {
                    kind: ErrorKind::Collaborator,
                    message: format!("iteration {iteration}: repair failed: {err:#}"),
                });
                Vec::new()
            }
        }
    }

    /// Write repair patches into the sandbox and through the applier.
    fn apply_repair(
        &self,
        patches: &[Patch],
        outcome: &mut SandboxLoopOutcome,
    ) -> std::result::Result<(), Stop> {
        let root = self.request.codebase.root();
        for patch in patches {
            let rel = relative_display(root, &patch.target_path);
            self.sandbox
                .write_file(self.handle, &rel, &patch.payload)
                .map_err(|err| Stop::Infra(format!("write {rel} into sandbox: {err:#}")))?;
        }
        let applied = apply_patches(self.request.codebase, self.request.allowed, self.request.mode, patches);
        for failure in &applied.failures {
            outcome.notes.push(PassNote {
                kind: ErrorKind::Collaborator,
                message: format!("repair patch not written: {failure}"),
            });
        }
        outcome.decisions.extend(applied.decisions);
        for path in applied.applied {
            if !outcome.applied.contains(&path) {
                outcome.applied.push(path);
            }
        }
        outcome.repair_patches.extend(patches.iter().cloned());
        Ok(())
    }
}

fn step_from(result: &CommandResult) -> StepResult {
    StepResult {
        success: result.success,
        exit_code: result.exit_code,
        timed_out: result.timed_out,
        duration_ms: result.duration_ms,
        log_tail: tail(&result.output, STEP_LOG_TAIL_BYTES),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::repair::RepairOutcome;
    use crate::core::scope::{ExpansionRules, ScopeHint};
    use crate::core::types::{PatchOperation, PatchOrigin};
    use crate::io::fs::LocalFileSystem;
    use crate::test_support::{RunScript, ScriptedSandbox, TestCodebase, java_profile};
    use std::sync::Mutex;

    /// Returns one fixed patch per call and counts calls.
    struct FixedRepairer {
        patch: Option<Patch>,
        calls: Mutex<u32>,
    }

    impl Repairer for FixedRepairer {
        fn repair(&self, _request: &RepairRequest<'_>) -> Result<RepairOutcome> {
            *self.calls.lock().expect("lock") += 1;
            Ok(RepairOutcome {
                patches: self.patch.iter().cloned().collect(),
                ..RepairOutcome::default()
            })
        }
    }

    fn settings(max_iterations: u32) -> SandboxLoopSettings {
        SandboxLoopSettings {
            max_iterations,
            build_timeout: Duration::from_secs(5),
            run_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(1),
            health_attempts: 3,
            readiness_override: None,
        }
    }

    struct Fixture {
        codebase: TestCodebase,
        fs: LocalFileSystem,
        allowed: AllowedSet,
        cancel: CancelFlag,
    }

    impl Fixture {
        fn new() -> Self {
            let codebase = TestCodebase::java_service();
            let fs = LocalFileSystem::new(codebase.root()).expect("fs");
            let allowed = AllowedSet::resolve(
                fs.root(),
                &ScopeHint {
                    files_to_create: vec!["src/api/StatusController.java".to_string()],
                    files_to_modify: vec!["src/api/Routes.java".to_string()],
                },
                ExpansionRules::default(),
                "src",
            );
            Self {
                codebase,
                fs,
                allowed,
                cancel: CancelFlag::default(),
            }
        }

        fn request(&self, profile: Option<SandboxProfile>) -> SandboxLoopRequest<'_> {
            SandboxLoopRequest {
                project_type: Some("maven"),
                profile,
                codebase: &self.fs,
                allowed: &self.allowed,
                mode: EnforcementMode::Hard,
                intent: "Expose GET /status",
                deadline: Instant::now() + Duration::from_secs(30),
                cancel: &self.cancel,
                artifacts: None,
            }
        }

        fn repair_patch(&self) -> Patch {
            Patch {
                target_path: self.fs.root().join("src/api/Routes.java"),
                operation: PatchOperation::Modify,
                payload: "class Routes { fixed(); }\n".to_string(),
                origin: PatchOrigin::Repair,
            }
        }
    }

    fn repairer(patch: Option<Patch>) -> FixedRepairer {
        FixedRepairer {
            patch,
            calls: Mutex::new(0),
        }
    }

    #[test]
    fn missing_profile_is_not_applicable() {
        let fixture = Fixture::new();
        let sandbox = ScriptedSandbox::new();
        let outcome = run_sandbox_loop(&sandbox, &repairer(None), &settings(3), &fixture.request(None));
        assert_eq!(outcome.report.status, SandboxStatus::NotApplicable);
        assert_eq!(sandbox.sessions_opened(), 0);
    }

    #[test]
    fn passes_first_iteration_when_ready() {
        let fixture = Fixture::new();
        let sandbox = ScriptedSandbox::new().with_runs(vec![RunScript::serving("Started Application\n")]);
        let outcome = run_sandbox_loop(
            &sandbox,
            &repairer(None),
            &settings(3),
            &fixture.request(Some(java_profile())),
        );
        assert_eq!(outcome.report.status, SandboxStatus::Success);
        assert_eq!(outcome.report.iterations.len(), 1);
        assert_eq!(outcome.report.iterations[0].outcome, IterationOutcome::Passed);
        assert_eq!(sandbox.sessions_terminated(), 1);
        assert!(sandbox.uploaded_files() > 0);
    }

    #[test]
    fn readiness_line_without_newline_counts_as_ready() {
        let fixture = Fixture::new();
        let sandbox = ScriptedSandbox::new().with_runs(vec![RunScript::serving("Started Application")]);
        let outcome = run_sandbox_loop(
            &sandbox,
            &repairer(None),
            &settings(1),
            &fixture.request(Some(java_profile())),
        );
        assert_eq!(outcome.report.status, SandboxStatus::Success);
        let health = outcome.report.iterations[0]
            .run_result
            .as_ref()
            .and_then(|run| run.health.clone())
            .expect("health report");
        assert!(health.readiness_matched);
        assert!(health.healthy);
        assert_eq!(health.polls, 1);
    }

    #[test]
    fn build_failure_is_repaired_then_passes() {
        let fixture = Fixture::new();
        let sandbox = ScriptedSandbox::new()
            .with_builds(vec![ScriptedSandbox::build_failed("Routes.java:3: error: ';' expected")])
            .with_runs(vec![RunScript::serving("Started Application\n")]);
        let fixer = repairer(Some(fixture.repair_patch()));
        let outcome = run_sandbox_loop(&sandbox, &fixer, &settings(3), &fixture.request(Some(java_profile())));

        assert_eq!(outcome.report.status, SandboxStatus::Success);
        assert_eq!(outcome.report.iterations.len(), 2);
        let first = &outcome.report.iterations[0];
        assert_eq!(first.error_classification, Some(ErrorClass::CompileTime));
        assert_eq!(first.outcome, IterationOutcome::Repaired);
        assert_eq!(first.repair_patches.len(), 1);
        assert_eq!(sandbox.writes()[0].0, "src/api/Routes.java");
        let routes = std::fs::read_to_string(fixture.codebase.root().join("src/api/Routes.java"))
            .expect("read");
        assert!(routes.contains("fixed();"));
        assert_eq!(outcome.applied.len(), 1);
    }

    #[test]
    fn iterations_never_exceed_the_cap() {
        let fixture = Fixture::new();
        let sandbox = ScriptedSandbox::new().with_builds(
            (0..10)
                .map(|_| ScriptedSandbox::build_failed("error: cannot find symbol"))
                .collect(),
        );
        let fixer = repairer(Some(fixture.repair_patch()));
        let outcome = run_sandbox_loop(&sandbox, &fixer, &settings(3), &fixture.request(Some(java_profile())));

        assert_eq!(outcome.report.status, SandboxStatus::MaxIterationsReached);
        assert_eq!(outcome.report.iterations.len(), 3);
        assert_eq!(outcome.report.iterations[2].outcome, IterationOutcome::Exhausted);
        assert_eq!(*fixer.calls.lock().expect("lock"), 2);
        assert_eq!(sandbox.sessions_terminated(), 1);
    }

    #[test]
    fn stalled_start_is_classified_as_timeout() {
        let fixture = Fixture::new();
        let sandbox = ScriptedSandbox::new().with_runs(vec![
            RunScript::serving("warming up\n"),
            RunScript::serving("Started Application\n"),
        ]);
        let fixer = repairer(Some(fixture.repair_patch()));
        let outcome = run_sandbox_loop(&sandbox, &fixer, &settings(3), &fixture.request(Some(java_profile())));
        assert_eq!(outcome.report.status, SandboxStatus::Success);
        assert_eq!(
            outcome.report.iterations[0].error_classification,
            Some(ErrorClass::Timeout)
        );
    }

    #[test]
    fn crash_is_runtime_failure() {
        let fixture = Fixture::new();
        let sandbox = ScriptedSandbox::new().with_runs(vec![
            RunScript::crashing("Exception in thread \"main\" java.lang.NullPointerException\n"),
            RunScript::serving("Started Application\n"),
        ]);
        let fixer = repairer(Some(fixture.repair_patch()));
        let outcome = run_sandbox_loop(&sandbox, &fixer, &settings(3), &fixture.request(Some(java_profile())));
        let first = &outcome.report.iterations[0];
        assert_eq!(first.error_classification, Some(ErrorClass::Runtime));
        let health = first
            .run_result
            .as_ref()
            .and_then(|run| run.health.as_ref())
            .expect("health");
        assert!(!health.process_alive);
    }

    #[test]
    fn session_failure_is_fatal_infra() {
        let fixture = Fixture::new();
        let sandbox = ScriptedSandbox::new().failing_sessions();
        let outcome = run_sandbox_loop(
            &sandbox,
            &repairer(None),
            &settings(3),
            &fixture.request(Some(java_profile())),
        );
        assert_eq!(outcome.report.status, SandboxStatus::FatalInfraError);
        assert!(outcome.report.iterations.is_empty());
    }

    #[test]
    fn infra_marker_stops_the_session() {
        let fixture = Fixture::new();
        let sandbox = ScriptedSandbox::new()
            .with_builds(vec![ScriptedSandbox::build_failed("mvn: No space left on device")]);
        let fixer = repairer(Some(fixture.repair_patch()));
        let outcome = run_sandbox_loop(&sandbox, &fixer, &settings(3), &fixture.request(Some(java_profile())));
        assert_eq!(outcome.report.status, SandboxStatus::FatalInfraError);
        assert_eq!(outcome.report.iterations.len(), 1);
        assert_eq!(outcome.report.iterations[0].outcome, IterationOutcome::Unrecoverable);
        assert_eq!(*fixer.calls.lock().expect("lock"), 0);
        assert_eq!(sandbox.sessions_terminated(), 1);
    }

    #[test]
    fn cancellation_tears_down_the_session() {
        let fixture = Fixture::new();
        fixture.cancel.cancel();
        let sandbox = ScriptedSandbox::new();
        let outcome = run_sandbox_loop(
            &sandbox,
            &repairer(None),
            &settings(3),
            &fixture.request(Some(java_profile())),
        );
        assert!(outcome.cancelled);
        assert!(outcome.report.iterations.is_empty());
        assert_eq!(sandbox.sessions_terminated(), 1);
    }

    #[test]
    fn iteration_artifacts_are_written() {
        let fixture = Fixture::new();
        let artifacts = tempfile::tempdir().expect("tempdir");
        let paths = RunPaths::new(artifacts.path(), "wf-test");
        let sandbox = ScriptedSandbox::new()
            .with_builds(vec![ScriptedSandbox::build_failed("error: boom")])
            .with_runs(vec![RunScript::serving("Started Application\n")]);
        let fixer = repairer(Some(fixture.repair_patch()));
        let mut request = fixture.request(Some(java_profile()));
        request.artifacts = Some(&paths);
        run_sandbox_loop(&sandbox, &fixer, &settings(3), &request);
        assert!(paths.iteration(1).build_log_path.is_file());
        assert!(paths.iteration(1).record_path.is_file());
        assert!(paths.iteration(2).run_log_path.is_file());
    }
}
