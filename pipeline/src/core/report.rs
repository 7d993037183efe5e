//! Result aggregation.
//!
//! [`aggregate`] is a pure function of the workflow state: aggregating the
//! same state twice yields identical reports.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::core::path::relative_display;
use crate::core::state::WorkflowState;
use crate::core::types::{
    Patch, PatchOperation, PatchOrigin, Phase, PhaseError, PhaseRecord, SandboxReport,
    SandboxStatus, Verdict, Violation,
};

/// Patch metadata without the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchSummary {
    /// Root-relative path with `/` separators.
    pub target_path: String,
    pub operation: PatchOperation,
    pub origin: PatchOrigin,
    pub bytes: usize,
}

/// Read-only outcome of one workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub workflow_id: String,
    pub feature_request: String,
    pub codebase_root: PathBuf,
    pub verdict: Verdict,
    /// Set when `verdict` is `not_implemented`.
    pub failed_phase: Option<Phase>,
    pub phases: Vec<PhaseRecord>,
    pub files_created: Vec<String>,
    pub files_modified: Vec<String>,
    pub iterations_used: u32,
    pub patches: Vec<PatchSummary>,
    pub sandbox_report: Option<SandboxReport>,
    pub violations: Vec<Violation>,
    pub errors: Vec<PhaseError>,
}

impl Report {
    pub fn created_count(&self) -> usize {
        self.files_created.len()
    }

    pub fn modified_count(&self) -> usize {
        self.files_modified.len()
    }
}

pub fn aggregate(state: &WorkflowState) -> Report {
    let verdict = verdict_for(state);
    let (files_created, files_modified) = files_by_operation(state);
    let iterations_used = state
        .sandbox_report
        .as_ref()
        .map(|report| u32::try_from(report.iterations.len()).unwrap_or(u32::MAX))
        .unwrap_or(0);

    Report {
        workflow_id: state.workflow_id.clone(),
        feature_request: state.feature_request.clone(),
        codebase_root: state.codebase_root.clone(),
        verdict,
        failed_phase: state.failed_phase,
        phases: state.phase_history.clone(),
        files_created,
        files_modified,
        iterations_used,
        patches: state
            .patches
            .iter()
            .map(|patch| summarize(state, patch))
            .collect(),
        sandbox_report: state.sandbox_report.clone(),
        violations: state.violations.clone(),
        errors: state.errors.clone(),
    }
}

fn verdict_for(state: &WorkflowState) -> Verdict {
    if state.failed_phase.is_some() {
        return Verdict::NotImplemented;
    }
    match state.sandbox_report.as_ref().map(|report| report.status) {
        Some(SandboxStatus::Success) => Verdict::ImplementedAndVerified,
        _ => Verdict::ImplementedUnverified,
    }
}

/// Distinct paths per operation; a path's first patch decides its bucket.
fn files_by_operation(state: &WorkflowState) -> (Vec<String>, Vec<String>) {
    let mut first_op: BTreeMap<&PathBuf, PatchOperation> = BTreeMap::new();
    for patch in &state.patches {
        first_op.entry(&patch.target_path).or_insert(patch.operation);
    }
    let mut created = Vec::new();
    let mut modified = Vec::new();
    for (path, op) in first_op {
        let display = relative_display(&state.codebase_root, path);
        match op {
            PatchOperation::Create => created.push(display),
            PatchOperation::Modify => modified.push(display),
        }
    }
    (created, modified)
}

fn summarize(state: &WorkflowState, patch: &Patch) -> PatchSummary {
    PatchSummary {
        target_path: relative_display(&state.codebase_root, &patch.target_path),
        operation: patch.operation,
        origin: patch.origin,
        bytes: patch.payload.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ErrorKind, PhaseStatus};

    fn patch(path: &str, operation: PatchOperation, origin: PatchOrigin) -> Patch {
        Patch {
            target_path: PathBuf::from(path),
            operation,
            payload: "body".to_string(),
            origin,
        }
    }

    fn state() -> WorkflowState {
        let mut state = WorkflowState::new("wf-1", "add GET /status", PathBuf::from("/repo"));
        state.patches = vec![
            patch("/repo/src/api/StatusController.java", PatchOperation::Create, PatchOrigin::Synthesis),
            patch("/repo/src/api/Routes.java", PatchOperation::Modify, PatchOrigin::Synthesis),
            patch("/repo/src/api/StatusController.java", PatchOperation::Modify, PatchOrigin::Repair),
        ];
        state.phase_history.push(PhaseRecord {
            phase: Phase::CodeSynthesis,
            status: PhaseStatus::Completed,
            duration_ms: 12,
        });
        state
    }

    #[test]
    fn aggregate_is_idempotent() {
        let state = state();
        assert_eq!(aggregate(&state), aggregate(&state));
        let first = serde_json::to_string(&aggregate(&state)).expect("serialize");
        let second = serde_json::to_string(&aggregate(&state)).expect("serialize");
        assert_eq!(first, second);
    }

    #[test]
    fn files_are_counted_once_by_first_operation() {
        let report = aggregate(&state());
        assert_eq!(report.files_created, vec!["src/api/StatusController.java"]);
        assert_eq!(report.files_modified, vec!["src/api/Routes.java"]);
        assert_eq!(report.patches.len(), 3);
        assert_eq!(report.patches[2].origin, PatchOrigin::Repair);
    }

    #[test]
    fn verdict_without_sandbox_is_unverified() {
        assert_eq!(aggregate(&state()).verdict, Verdict::ImplementedUnverified);
    }

    #[test]
    fn verdict_with_sandbox_success_is_verified() {
        let mut state = state();
        let mut sandbox = SandboxReport::terminal(SandboxStatus::Success, 10, "passed");
        sandbox.detail = None;
        state.sandbox_report = Some(sandbox);
        let report = aggregate(&state);
        assert_eq!(report.verdict, Verdict::ImplementedAndVerified);
        assert_eq!(report.iterations_used, 0);
    }

    #[test]
    fn failed_phase_is_not_implemented() {
        let mut state = state();
        state.failed_phase = Some(Phase::IntentParsing);
        state.record_error(Phase::IntentParsing, ErrorKind::CriticalPhase, "no spec", true);
        let report = aggregate(&state);
        assert_eq!(report.verdict, Verdict::NotImplemented);
        assert_eq!(report.failed_phase, Some(Phase::IntentParsing));
        assert_eq!(report.errors.len(), 1);
    }
}
