//! Per-request workflow state threaded through every phase.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::core::scope::{AllowedSet, ScopeHint};
use crate::core::types::{
    ErrorKind, FeatureSpec, InterceptorDecision, Patch, Phase, PhaseError, PhaseRecord,
    ProjectContext, SandboxReport, Violation,
};

/// Mutable state for one feature request.
///
/// Exactly one phase owns the state at a time; it is never shared across
/// requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub workflow_id: String,
    pub feature_request: String,
    /// Canonical absolute root of the target codebase.
    pub codebase_root: PathBuf,
    pub current_phase: Phase,
    pub context: Option<ProjectContext>,
    pub feature_spec: Option<FeatureSpec>,
    pub scope_hint: Option<ScopeHint>,
    pub allowed_set: Option<AllowedSet>,
    pub patches: Vec<Patch>,
    /// Files the applier wrote, in write order.
    pub applied: Vec<PathBuf>,
    pub sandbox_report: Option<SandboxReport>,
    pub errors: Vec<PhaseError>,
    pub violations: Vec<Violation>,
    pub phase_history: Vec<PhaseRecord>,
    /// Phase whose critical failure moved the workflow to `Failed`.
    pub failed_phase: Option<Phase>,
}

impl WorkflowState {
    pub fn new(
        workflow_id: impl Into<String>,
        feature_request: impl Into<String>,
        codebase_root: PathBuf,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            feature_request: feature_request.into(),
            codebase_root,
            current_phase: Phase::ContextAnalysis,
            context: None,
            feature_spec: None,
            scope_hint: None,
            allowed_set: None,
            patches: Vec::new(),
            applied: Vec::new(),
            sandbox_report: None,
            errors: Vec::new(),
            violations: Vec::new(),
            phase_history: Vec::new(),
            failed_phase: None,
        }
    }

    pub fn record_error(
        &mut self,
        phase: Phase,
        kind: ErrorKind,
        message: impl Into<String>,
        fatal: bool,
    ) {
        self.errors.push(PhaseError {
            phase,
            kind,
            message: message.into(),
            fatal,
        });
    }

    /// Keep every non-allow decision for the report.
    pub fn record_decisions<'a>(
        &mut self,
        phase: Phase,
        decisions: impl IntoIterator<Item = &'a InterceptorDecision>,
    ) {
        self.violations.extend(
            decisions
                .into_iter()
                .filter(|decision| decision.is_violation())
                .map(|decision| Violation::from_decision(phase, decision)),
        );
    }

    pub fn is_failed(&self) -> bool {
        self.failed_phase.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{DecisionKind, InterceptionPoint};

    #[test]
    fn new_state_starts_at_context_analysis() {
        let state = WorkflowState::new("wf-1", "add GET /status", PathBuf::from("/repo"));
        assert_eq!(state.current_phase, Phase::ContextAnalysis);
        assert!(!state.is_failed());
        assert!(state.patches.is_empty());
    }

    #[test]
    fn only_violations_are_recorded() {
        let mut state = WorkflowState::new("wf-1", "req", PathBuf::from("/repo"));
        let decisions = [
            InterceptorDecision {
                kind: DecisionKind::Allow,
                point: InterceptionPoint::ActionGate,
                reason: "exact".to_string(),
                resolved_path: Some(PathBuf::from("/repo/src/a.rs")),
            },
            InterceptorDecision {
                kind: DecisionKind::Block,
                point: InterceptionPoint::ActionGate,
                reason: "out_of_scope".to_string(),
                resolved_path: Some(PathBuf::from("/repo/docs/a.md")),
            },
        ];
        state.record_decisions(Phase::CodeSynthesis, &decisions);
        assert_eq!(state.violations.len(), 1);
        assert_eq!(state.violations[0].phase, Phase::CodeSynthesis);
        assert_eq!(state.violations[0].kind, DecisionKind::Block);
    }
}
