//! Code synthesis driver.
//!
//! Runs bounded worker conversations under the interceptor stack. Each pass
//! exposes a restricted action set: the create pass cannot edit existing
//! files and the modify pass cannot create new ones. Accepted writes are
//! staged in an in-memory overlay; the resulting patches carry full file
//! contents and are only written to disk by the execution applier.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use glob::Pattern;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::agents::interceptor::{GuardedReply, InterceptorStack};
use crate::core::actions::{ActionKind, ActionRequest};
use crate::core::normalize::{ActionRecord, Normalized, NormalizerChain, WorkerTrace};
use crate::core::path::relative_display;
use crate::core::scope::{AllowedSet, ScopeHint};
use crate::core::types::{
    DecisionKind, EnforcementMode, ErrorKind, FeatureSpec, InterceptorDecision, Patch,
    PatchOperation, PatchOrigin, Phase, ProjectContext, TaskKind,
};
use crate::io::fs::{FileSystem, replace_once};
use crate::io::prompt::{GroundingInputs, PromptBuilder, SynthesisPromptInputs};
use crate::io::worker::{Message, Worker, WorkerReply};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassKind {
    Create,
    Modify,
    Repair,
}

impl PassKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PassKind::Create => "create",
            PassKind::Modify => "modify",
            PassKind::Repair => "repair",
        }
    }

    /// Actions exposed to the worker in this pass.
    pub fn actions(&self) -> Vec<ActionKind> {
        let mut actions = ActionKind::READ_ONLY.to_vec();
        match self {
            PassKind::Create => actions.push(ActionKind::Create),
            PassKind::Modify => actions.push(ActionKind::Modify),
            PassKind::Repair => {
                actions.push(ActionKind::Create);
                actions.push(ActionKind::Modify);
            }
        }
        actions
    }

    fn origin(&self) -> PatchOrigin {
        match self {
            PassKind::Repair => PatchOrigin::Repair,
            _ => PatchOrigin::Synthesis,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SynthesisSettings {
    pub max_turns: u32,
    pub pass_timeout: Duration,
    pub mode: EnforcementMode,
    pub prompt_budget_bytes: usize,
}

/// In-memory overlay of staged writes on top of the codebase.
pub struct StagingOverlay<'a> {
    fs: &'a dyn FileSystem,
    staged: BTreeMap<PathBuf, String>,
    records: Vec<ActionRecord>,
}

impl<'a> StagingOverlay<'a> {
    pub fn new(fs: &'a dyn FileSystem) -> Self {
        Self {
            fs,
            staged: BTreeMap::new(),
            records: Vec::new(),
        }
    }

    fn rel(&self, path: &std::path::Path) -> String {
        relative_display(self.fs.root(), path)
    }

    pub fn exists(&self, path: &std::path::Path) -> bool {
        self.staged.contains_key(path) || self.on_disk(path)
    }

    /// Whether the codebase held `path` before anything was staged.
    pub fn on_disk(&self, path: &std::path::Path) -> bool {
        self.fs.exists(&self.rel(path))
    }

    /// Current content: staged first, then disk.
    pub fn current(&self, path: &std::path::Path) -> Result<String> {
        match self.staged.get(path) {
            Some(content) => Ok(content.clone()),
            None => self.fs.read(&self.rel(path), 0, None),
        }
    }

    pub fn read(&self, path: &std::path::Path, offset: usize, limit: Option<usize>) -> Result<String> {
        let Some(content) = self.staged.get(path) else {
            return self.fs.read(&self.rel(path), offset, limit);
        };
        let lines = content.lines().skip(offset);
        let selected: Vec<&str> = match limit {
            Some(limit) => lines.take(limit).collect(),
            None => lines.collect(),
        };
        Ok(selected.join("\n"))
    }

    /// Staged paths matching a root-relative glob.
    pub fn staged_matching(&self, pattern: &Pattern) -> Vec<String> {
        self.staged
            .keys()
            .map(|path| self.rel(path))
            .filter(|rel| pattern.matches(rel))
            .collect()
    }

    pub fn create(&mut self, path: PathBuf, content: &str) {
        self.records.push(ActionRecord {
            operation: PatchOperation::Create,
            path: self.rel(&path),
            content: Some(content.to_string()),
        });
        self.staged.insert(path, content.to_string());
    }

    pub fn modify(&mut self, path: PathBuf, old: &str, new: &str) -> Result<()> {
        let current = self.current(&path)?;
        let updated = replace_once(&current, old, new)?;
        self.records.push(ActionRecord {
            operation: PatchOperation::Modify,
            path: self.rel(&path),
            content: Some(updated.clone()),
        });
        self.staged.insert(path, updated);
        Ok(())
    }

    pub fn staged_content(&self, path: &std::path::Path) -> Option<&str> {
        self.staged.get(path).map(String::as_str)
    }

    pub fn records(&self) -> &[ActionRecord] {
        &self.records
    }
}

/// Result returned to the worker for one requested action.
#[derive(Debug, Clone, Serialize)]
struct ActionResult {
    action: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<String>,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<serde_json::Value>,
}

impl ActionResult {
    fn ok(action: &ActionRequest, result: serde_json::Value) -> Self {
        Self {
            action: action.kind().as_str(),
            path: action.write_target().map(str::to_string),
            status: "ok",
            reason: None,
            result: Some(result),
        }
    }

    fn denied(action: &ActionRequest, reason: &str) -> Self {
        Self {
            action: action.kind().as_str(),
            path: action.write_target().map(str::to_string),
            status: "denied",
            reason: Some(reason.to_string()),
            result: None,
        }
    }

    fn error(action: &ActionRequest, err: &anyhow::Error) -> Self {
        Self {
            action: action.kind().as_str(),
            path: action.write_target().map(str::to_string),
            status: "error",
            reason: Some(format!("{err:#}")),
            result: None,
        }
    }
}

/// Soft problem observed during a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassNote {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct PassOutcome {
    pub pass: PassKind,
    pub patches: Vec<Patch>,
    pub decisions: Vec<InterceptorDecision>,
    /// Normalizer that recognized the result, if any.
    pub shape: Option<&'static str>,
    pub turns: u32,
    pub finished: bool,
    pub notes: Vec<PassNote>,
}

/// Inputs for one pass.
pub struct PassRequest<'a> {
    pub pass: PassKind,
    pub objective: String,
    /// Rendered first user message.
    pub instruction: String,
    pub allowed: &'a AllowedSet,
    pub deadline: Instant,
}

pub struct SynthesisDriver<'a> {
    worker: &'a dyn Worker,
    fs: &'a dyn FileSystem,
    settings: SynthesisSettings,
    chain: NormalizerChain,
    phase: Phase,
}

impl<'a> SynthesisDriver<'a> {
    pub fn new(worker: &'a dyn Worker, fs: &'a dyn FileSystem, settings: SynthesisSettings) -> Self {
        Self {
            worker,
            fs,
            settings,
            chain: NormalizerChain::default(),
            phase: Phase::CodeSynthesis,
        }
    }

    pub fn with_chain(mut self, chain: NormalizerChain) -> Self {
        self.chain = chain;
        self
    }

    /// Attribute decisions and log lines to `phase` (repair runs in sandbox testing).
    pub fn for_phase(mut self, phase: Phase) -> Self {
        self.phase = phase;
        self
    }

    pub fn prompt_builder(&self) -> PromptBuilder {
        PromptBuilder::new(self.settings.prompt_budget_bytes)
    }

    /// Run one bounded pass and return its accepted patches.
    #[instrument(skip_all, fields(pass = request.pass.as_str(), phase = %self.phase))]
    pub fn run_pass(&self, request: &PassRequest<'_>) -> Result<PassOutcome> {
        let available = request.pass.actions();
        let grounding = self.prompt_builder().grounding(&GroundingInputs {
            objective: request.objective.clone(),
            pass: request.pass.as_str().to_string(),
            allowed: request.allowed.describe(),
            actions: available.iter().map(|a| a.as_str().to_string()).collect(),
            mode: mode_str(self.settings.mode).to_string(),
        })?;
        let mut stack = InterceptorStack::new(
            self.worker,
            request.allowed,
            self.settings.mode,
            self.phase,
            grounding,
        );
        let mut overlay = StagingOverlay::new(self.fs);
        let mut notes = Vec::new();
        let deadline = request
            .deadline
            .min(Instant::now() + self.settings.pass_timeout);

        let mut conversation = vec![Message::user(request.instruction.clone())];
        let mut final_reply: Option<WorkerReply> = None;
        let mut turns = 0;
        let mut finished = false;

        while turns < self.settings.max_turns {
            if Instant::now() >= deadline {
                warn!(turns, "synthesis pass time limit reached");
                notes.push(PassNote {
                    kind: ErrorKind::PhaseTimeout,
                    message: format!("{} pass stopped at its time limit after {turns} turns", request.pass.as_str()),
                });
                break;
            }
            turns += 1;
            match stack.call(&conversation, &available)? {
                GuardedReply::Blocked { reply, explanation } => {
                    notes.push(PassNote {
                        kind: ErrorKind::ScopeViolation,
                        message: format!("turn {turns} blocked by output check"),
                    });
                    conversation.push(Message::assistant(reply.text));
                    conversation.push(Message::user(explanation));
                }
                GuardedReply::Passed(reply) => {
                    conversation.push(Message::assistant(reply.text.clone()));
                    let results: Vec<ActionResult> = reply
                        .actions
                        .iter()
                        .map(|action| self.execute(action, &available, &mut stack, &mut overlay))
                        .collect();
                    if !results.is_empty() {
                        let body = serde_json::to_string(&results).context("serialize action results")?;
                        conversation.push(Message::tool(body));
                    }
                    let done = reply.finished;
                    final_reply = Some(reply);
                    if done {
                        finished = true;
                        break;
                    }
                }
            }
        }
        if !finished && turns >= self.settings.max_turns {
            notes.push(PassNote {
                kind: ErrorKind::PhaseTimeout,
                message: format!("{} pass reached {} turns without finishing", request.pass.as_str(), self.settings.max_turns),
            });
        }

        let final_reply = final_reply.unwrap_or_default();
        let trace = WorkerTrace {
            recorded: overlay.records(),
            output: final_reply.output.as_ref(),
            text: &final_reply.text,
        };
        debug!(normalizers = ?self.chain.names(), "normalizing worker result");
        let (shape, actions) = match self.chain.run(&trace) {
            Normalized::Matched { shape, actions } => {
                if actions.is_empty() {
                    info!(shape, "worker performed zero actions");
                } else {
                    info!(shape, actions = actions.len(), "worker result normalized");
                }
                (Some(shape), actions)
            }
            Normalized::Unrecognized => {
                warn!("no action trace recognized in worker result");
                notes.push(PassNote {
                    kind: ErrorKind::ResultFormatMismatch,
                    message: format!("{} pass: worker result shape not recognized", request.pass.as_str()),
                });
                (None, Vec::new())
            }
        };

        let mut patches = Vec::new();
        for action in actions {
            let on_disk = overlay.on_disk(&crate::core::path::resolve_under(self.fs.root(), &action.path));
            let decision = stack.accept_patch(&action.path, action.operation, &available, on_disk);
            if decision.kind == DecisionKind::Block {
                continue;
            }
            let Some(target) = decision.resolved_path else {
                continue;
            };
            let payload = match action.content.or_else(|| overlay.staged_content(&target).map(str::to_string)) {
                Some(payload) => payload,
                None => {
                    notes.push(PassNote {
                        kind: ErrorKind::ResultFormatMismatch,
                        message: format!("no content reported for {}", action.path),
                    });
                    continue;
                }
            };
            debug!(path = %target.display(), operation = action.operation.as_str(), "patch accepted");
            patches.push(Patch {
                target_path: target,
                operation: action.operation,
                payload,
                origin: request.pass.origin(),
            });
        }

        Ok(PassOutcome {
            pass: request.pass,
            patches,
            decisions: stack.into_decisions(),
            shape,
            turns,
            finished,
            notes,
        })
    }

    fn execute(
        &self,
        action: &ActionRequest,
        available: &[ActionKind],
        stack: &mut InterceptorStack<'_>,
        overlay: &mut StagingOverlay<'_>,
    ) -> ActionResult {
        let target = action
            .write_target()
            .map(|raw| crate::core::path::resolve_under(self.fs.root(), raw));
        let target_exists = target.as_deref().is_some_and(|path| overlay.exists(path));
        let decision = stack.gate(action, available, target_exists);
        if decision.kind == DecisionKind::Block {
            return ActionResult::denied(action, &decision.reason);
        }

        let outcome = match action {
            ActionRequest::List { path } => self
                .fs
                .list(path)
                .and_then(|entries| Ok(serde_json::to_value(entries)?)),
            ActionRequest::Read { path, offset, limit } => {
                let resolved = crate::core::path::resolve_under(self.fs.root(), path);
                overlay
                    .read(&resolved, *offset, *limit)
                    .map(serde_json::Value::String)
            }
            ActionRequest::SearchByPattern { pattern } => {
                self.fs.search_by_pattern(pattern).and_then(|mut found| {
                    let glob = Pattern::new(pattern)?;
                    for staged in overlay.staged_matching(&glob) {
                        if !found.contains(&staged) {
                            found.push(staged);
                        }
                    }
                    found.sort();
                    Ok(serde_json::to_value(found)?)
                })
            }
            ActionRequest::SearchByContent { query } => self
                .fs
                .search_by_content(query)
                .and_then(|found| Ok(serde_json::to_value(found)?)),
            ActionRequest::Create { content, .. } => match decision.resolved_path {
                Some(path) => {
                    overlay.create(path, content);
                    Ok(serde_json::Value::String("created".to_string()))
                }
                None => Err(anyhow::anyhow!("create target did not resolve")),
            },
            ActionRequest::Modify { old, new, .. } => match decision.resolved_path {
                Some(path) => overlay
                    .modify(path, old, new)
                    .map(|()| serde_json::Value::String("modified".to_string())),
                None => Err(anyhow::anyhow!("modify target did not resolve")),
            },
        };
        match outcome {
            Ok(result) => ActionResult::ok(action, result),
            Err(err) => ActionResult::error(action, &err),
        }
    }

    /// Run the create and modify passes for a feature spec.
    #[instrument(skip_all)]
    pub fn synthesize(&self, request: &SynthesisRequest<'_>) -> Result<SynthesisOutcome> {
        let mut outcome = SynthesisOutcome::default();
        let spec = request.spec;
        let create_tasks: Vec<String> = task_lines(spec, TaskKind::Create);
        let extend_tasks: Vec<String> = task_lines(spec, TaskKind::Extend);

        let passes = [
            (PassKind::Create, create_tasks, &request.hint.files_to_create),
            (PassKind::Modify, extend_tasks, &request.hint.files_to_modify),
        ];
        for (pass, tasks, files) in passes {
            if tasks.is_empty() {
                debug!(pass = pass.as_str(), "no tasks for pass; skipping");
                continue;
            }
            let instruction = self.prompt_builder().synthesis(&SynthesisPromptInputs {
                pass: pass.as_str().to_string(),
                actions: pass.actions().iter().map(|a| a.as_str().to_string()).collect(),
                intent: spec.intent_summary.clone(),
                tasks,
                files_to_create: if pass == PassKind::Create { files.clone() } else { Vec::new() },
                files_to_modify: if pass == PassKind::Modify { files.clone() } else { Vec::new() },
                excluded: spec.excluded_features.clone(),
                framework: request.context.framework_id.clone(),
                conventions: request
                    .context
                    .layer_conventions
                    .iter()
                    .map(|layer| {
                        format!(
                            "{}: {}{}",
                            layer.layer,
                            layer.directories.join(", "),
                            layer
                                .file_suffix
                                .as_ref()
                                .map(|s| format!(" (*{s})"))
                                .unwrap_or_default()
                        )
                    })
                    .collect(),
                structure: request.context.structure_summary.clone(),
            })?;
            let pass_outcome = self.run_pass(&PassRequest {
                pass,
                objective: spec.intent_summary.clone(),
                instruction,
                allowed: request.allowed,
                deadline: request.deadline,
            })?;
            info!(
                pass = pass.as_str(),
                patches = pass_outcome.patches.len(),
                turns = pass_outcome.turns,
                "synthesis pass finished"
            );
            outcome.absorb(pass_outcome);
        }
        Ok(outcome)
    }
}

/// Inputs for a full synthesis run.
pub struct SynthesisRequest<'a> {
    pub spec: &'a FeatureSpec,
    pub hint: &'a ScopeHint,
    pub context: &'a ProjectContext,
    pub allowed: &'a AllowedSet,
    pub deadline: Instant,
}

#[derive(Debug, Clone, Default)]
pub struct SynthesisOutcome {
    pub patches: Vec<Patch>,
    pub decisions: Vec<InterceptorDecision>,
    pub notes: Vec<PassNote>,
    pub shapes: Vec<&'static str>,
}

impl SynthesisOutcome {
    fn absorb(&mut self, pass: PassOutcome) {
        self.patches.extend(pass.patches);
        self.decisions.extend(pass.decisions);
        self.notes.extend(pass.notes);
        if let Some(shape) = pass.shape {
            self.shapes.push(shape);
        }
    }
}

fn task_lines(spec: &FeatureSpec, kind: TaskKind) -> Vec<String> {
    spec.active_tasks()
        .filter(|task| task.kind == kind)
        .map(|task| match &task.target_file {
            Some(file) => format!("{} ({}, {})", task.description, task.entity, file),
            None => format!("{} ({})", task.description, task.entity),
        })
        .collect()
}

fn mode_str(mode: EnforcementMode) -> &'static str {
    match mode {
        EnforcementMode::Hard => "hard",
        EnforcementMode::Soft => "soft",
    }
}

/// Mark tasks whose entity or target file appears among the patches as done.
pub fn mark_done_tasks(spec: &mut FeatureSpec, patches: &[Patch], root: &std::path::Path) {
    let touched: Vec<String> = patches
        .iter()
        .map(|patch| relative_display(root, &patch.target_path))
        .collect();
    for task in spec.tasks.iter_mut().filter(|task| !task.refused) {
        task.done = touched.iter().any(|rel| {
            task.target_file.as_deref().is_some_and(|file| rel == file)
                || std::path::Path::new(rel)
                    .file_stem()
                    .is_some_and(|stem| stem.to_string_lossy() == task.entity)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::scope::ExpansionRules;
    use crate::core::types::{InterceptionPoint, Task};
    use crate::io::fs::LocalFileSystem;
    use crate::test_support::{ScriptedWorker, TestCodebase};

    fn settings() -> SynthesisSettings {
        SynthesisSettings {
            max_turns: 6,
            pass_timeout: Duration::from_secs(30),
            mode: EnforcementMode::Hard,
            prompt_budget_bytes: 20_000,
        }
    }

    fn create(path: &str, content: &str) -> ActionRequest {
        ActionRequest::Create {
            path: path.to_string(),
            content: content.to_string(),
        }
    }

    fn allowed_for(root: &std::path::Path, hint: &ScopeHint) -> AllowedSet {
        AllowedSet::resolve(root, hint, ExpansionRules::default(), "src")
    }

    fn request<'a>(pass: PassKind, allowed: &'a AllowedSet) -> PassRequest<'a> {
        PassRequest {
            pass,
            objective: "Expose GET /status".to_string(),
            instruction: "implement".to_string(),
            allowed,
            deadline: Instant::now() + Duration::from_secs(30),
        }
    }

    #[test]
    fn create_pass_denies_modify_and_existing_targets() {
        let codebase = TestCodebase::java_service();
        let fs = LocalFileSystem::new(codebase.root()).expect("fs");
        let hint = ScopeHint {
            files_to_create: vec!["src/api/StatusController.java".to_string()],
            files_to_modify: vec!["src/api/Routes.java".to_string()],
        };
        let allowed = allowed_for(fs.root(), &hint);
        let worker = ScriptedWorker::new(vec![
            WorkerReply::text("").with_actions(vec![
                ActionRequest::Modify {
                    path: "src/api/Routes.java".to_string(),
                    old: "// routes".to_string(),
                    new: "// routes\n    status();".to_string(),
                },
                create("src/api/Routes.java", "class Routes {}"),
                create("src/api/StatusController.java", "class StatusController {}"),
            ]),
            WorkerReply::finished("Created the controller."),
        ]);
        let driver = SynthesisDriver::new(&worker, &fs, settings());
        let outcome = driver
            .run_pass(&request(PassKind::Create, &allowed))
            .expect("pass");

        assert_eq!(outcome.patches.len(), 1);
        assert_eq!(outcome.patches[0].operation, PatchOperation::Create);
        assert!(outcome.patches[0].target_path.ends_with("src/api/StatusController.java"));
        assert_eq!(outcome.shape, Some("recorded_trace"));

        let requests = worker.requests();
        let tool_message = &requests[1].conversation.last().expect("tool").content;
        assert!(tool_message.contains("action_unavailable"));
        assert!(tool_message.contains("target_exists"));
        let blocks: Vec<_> = outcome
            .decisions
            .iter()
            .filter(|d| d.kind == DecisionKind::Block && d.point == InterceptionPoint::ActionGate)
            .collect();
        assert_eq!(blocks.len(), 2);
        // Nothing touched the disk.
        assert!(!codebase.root().join("src/api/StatusController.java").exists());
    }

    #[test]
    fn out_of_scope_write_is_denied_and_never_patched() {
        let codebase = TestCodebase::java_service();
        let fs = LocalFileSystem::new(codebase.root()).expect("fs");
        let hint = ScopeHint {
            files_to_create: vec!["src/api/StatusController.java".to_string()],
            files_to_modify: Vec::new(),
        };
        let allowed = allowed_for(fs.root(), &hint);
        let worker = ScriptedWorker::new(vec![
            WorkerReply::text("").with_actions(vec![create("docs/status.md", "# Status")]),
            WorkerReply::finished("Done."),
        ]);
        let driver = SynthesisDriver::new(&worker, &fs, settings());
        let outcome = driver
            .run_pass(&request(PassKind::Create, &allowed))
            .expect("pass");
        assert!(outcome.patches.is_empty());
        assert!(
            outcome
                .decisions
                .iter()
                .any(|d| d.kind == DecisionKind::Block && d.reason == "out_of_scope")
        );
    }

    #[test]
    fn modify_pass_stages_edits_against_disk_content() {
        let codebase = TestCodebase::java_service();
        let fs = LocalFileSystem::new(codebase.root()).expect("fs");
        let hint = ScopeHint {
            files_to_create: Vec::new(),
            files_to_modify: vec!["src/api/Routes.java".to_string()],
        };
        let allowed = allowed_for(fs.root(), &hint);
        let worker = ScriptedWorker::new(vec![
            WorkerReply::text("").with_actions(vec![ActionRequest::Modify {
                path: "src/api/Routes.java".to_string(),
                old: "// routes".to_string(),
                new: "// routes\n    status();".to_string(),
            }]),
            WorkerReply::finished("Wired the route."),
        ]);
        let driver = SynthesisDriver::new(&worker, &fs, settings());
        let outcome = driver
            .run_pass(&request(PassKind::Modify, &allowed))
            .expect("pass");
        assert_eq!(outcome.patches.len(), 1);
        assert_eq!(outcome.patches[0].operation, PatchOperation::Modify);
        assert!(outcome.patches[0].payload.contains("status();"));
        let on_disk = std::fs::read_to_string(codebase.root().join("src/api/Routes.java"))
            .expect("read");
        assert!(!on_disk.contains("status();"));
    }

    #[test]
    fn unrecognized_result_is_zero_patches_with_note() {
        let codebase = TestCodebase::java_service();
        let fs = LocalFileSystem::new(codebase.root()).expect("fs");
        let allowed = allowed_for(fs.root(), &ScopeHint::default());
        let worker = ScriptedWorker::new(vec![WorkerReply::finished("Working on it...")]);
        let driver = SynthesisDriver::new(&worker, &fs, settings());
        let outcome = driver
            .run_pass(&request(PassKind::Create, &allowed))
            .expect("pass");
        assert!(outcome.patches.is_empty());
        assert_eq!(outcome.shape, None);
        assert!(
            outcome
                .notes
                .iter()
                .any(|note| note.kind == ErrorKind::ResultFormatMismatch)
        );
    }

    #[test]
    fn reported_create_over_existing_file_is_rejected() {
        let codebase = TestCodebase::java_service();
        let fs = LocalFileSystem::new(codebase.root()).expect("fs");
        let hint = ScopeHint {
            files_to_create: vec!["src/api/StatusController.java".to_string()],
            files_to_modify: Vec::new(),
        };
        let allowed = allowed_for(fs.root(), &hint);
        let worker = ScriptedWorker::new(vec![WorkerReply::finished("Done.").with_output(
            serde_json::json!({
                "actions": [
                    {"kind": "create", "path": "src/api/Routes.java", "content": "HIJACKED"},
                    {"kind": "create", "path": "src/api/StatusController.java", "content": "class StatusController {}"}
                ]
            }),
        )]);
        let driver = SynthesisDriver::new(&worker, &fs, settings());
        let outcome = driver
            .run_pass(&request(PassKind::Create, &allowed))
            .expect("pass");

        assert_eq!(outcome.shape, Some("structured_action_list"));
        assert_eq!(outcome.patches.len(), 1);
        assert!(outcome.patches[0].target_path.ends_with("src/api/StatusController.java"));
        assert!(outcome.decisions.iter().any(|d| {
            d.kind == DecisionKind::Block
                && d.point == InterceptionPoint::PatchAcceptance
                && d.reason.starts_with(crate::core::intercept::REASON_TARGET_EXISTS)
        }));
        assert_eq!(codebase.read("src/api/Routes.java"), crate::test_support::ROUTES_JAVA);
    }

    #[test]
    fn custom_chain_replaces_default_normalizers() {
        let codebase = TestCodebase::java_service();
        let fs = LocalFileSystem::new(codebase.root()).expect("fs");
        let hint = ScopeHint {
            files_to_create: vec!["src/api/StatusController.java".to_string()],
            files_to_modify: Vec::new(),
        };
        let allowed = allowed_for(fs.root(), &hint);
        let worker = ScriptedWorker::new(vec![
            WorkerReply::text("").with_actions(vec![create(
                "src/api/StatusController.java",
                "class StatusController {}",
            )]),
            WorkerReply::finished("Created the controller."),
        ]);
        let driver = SynthesisDriver::new(&worker, &fs, settings()).with_chain(NormalizerChain::empty());
        let outcome = driver
            .run_pass(&request(PassKind::Create, &allowed))
            .expect("pass");
        assert!(outcome.patches.is_empty());
        assert_eq!(outcome.shape, None);
        assert!(
            outcome
                .notes
                .iter()
                .any(|note| note.kind == ErrorKind::ResultFormatMismatch)
        );
    }

    /// Reads `FILE <path>` lines from the final reply.
    struct FileLines;

    impl crate::core::normalize::ResultNormalizer for FileLines {
        fn name(&self) -> &'static str {
            "file_lines"
        }

        fn normalize(&self, trace: &WorkerTrace<'_>) -> Option<Vec<ActionRecord>> {
            let actions: Vec<ActionRecord> = trace
                .text
                .lines()
                .filter_map(|line| line.strip_prefix("FILE "))
                .map(|path| ActionRecord {
                    operation: PatchOperation::Create,
                    path: path.trim().to_string(),
                    content: Some("class StatusController {}".to_string()),
                })
                .collect();
            (!actions.is_empty()).then_some(actions)
        }
    }

    #[test]
    fn pushed_normalizer_extends_the_chain() {
        let codebase = TestCodebase::java_service();
        let fs = LocalFileSystem::new(codebase.root()).expect("fs");
        let hint = ScopeHint {
            files_to_create: vec!["src/api/StatusController.java".to_string()],
            files_to_modify: Vec::new(),
        };
        let allowed = allowed_for(fs.root(), &hint);
        let chain = NormalizerChain::empty().push(Box::new(FileLines));
        assert_eq!(chain.names(), vec!["file_lines"]);
        let worker = ScriptedWorker::new(vec![WorkerReply::finished(
            "FILE src/api/StatusController.java",
        )]);
        let driver = SynthesisDriver::new(&worker, &fs, settings()).with_chain(chain);
        let outcome = driver
            .run_pass(&request(PassKind::Create, &allowed))
            .expect("pass");
        assert_eq!(outcome.shape, Some("file_lines"));
        assert_eq!(outcome.patches.len(), 1);
        assert_eq!(outcome.patches[0].payload, "class StatusController {}");
    }

    #[test]
    fn pass_stops_at_turn_limit() {
        let codebase = TestCodebase::java_service();
        let fs = LocalFileSystem::new(codebase.root()).expect("fs");
        let allowed = allowed_for(fs.root(), &ScopeHint::default());
        let worker = ScriptedWorker::repeating(WorkerReply::text("thinking"));
        let driver = SynthesisDriver::new(&worker, &fs, settings());
        let outcome = driver
            .run_pass(&request(PassKind::Create, &allowed))
            .expect("pass");
        assert_eq!(outcome.turns, 6);
        assert!(!outcome.finished);
        assert_eq!(worker.requests().len(), 6);
    }

    #[test]
    fn done_tasks_are_marked_by_entity() {
        let mut spec = FeatureSpec {
            intent_summary: "status".to_string(),
            entities_to_create: vec!["StatusController".to_string()],
            entities_to_extend: Vec::new(),
            tasks: vec![Task {
                description: "add controller".to_string(),
                entity: "StatusController".to_string(),
                kind: TaskKind::Create,
                target_file: None,
                done: false,
                refused: false,
            }],
            excluded_features: Vec::new(),
            candidate_files: Vec::new(),
        };
        let patches = vec![Patch {
            target_path: PathBuf::from("/repo/src/api/StatusController.java"),
            operation: PatchOperation::Create,
            payload: String::new(),
            origin: PatchOrigin::Synthesis,
        }];
        mark_done_tasks(&mut spec, &patches, std::path::Path::new("/repo"));
        assert!(spec.tasks[0].done);
    }
}
