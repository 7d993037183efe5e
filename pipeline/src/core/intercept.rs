//! Pure scope-enforcement decisions.
//!
//! The stateful interceptor stack (`agents::interceptor`) calls into these
//! functions around every worker turn; nothing here performs I/O or logging.

use std::path::PathBuf;

use crate::core::actions::{ActionKind, ActionRequest};
use crate::core::path::{is_within, mentioned_paths, resolve_under};
use crate::core::scope::AllowedSet;
use crate::core::types::{
    DecisionKind, EnforcementMode, InterceptionPoint, InterceptorDecision, PatchOperation,
};

pub const REASON_ACTION_UNAVAILABLE: &str = "action_unavailable";
pub const REASON_TARGET_EXISTS: &str = "target_exists";
pub const REASON_OUTSIDE_ROOT: &str = "outside_root";
pub const REASON_OUT_OF_SCOPE: &str = "out_of_scope";
pub const REASON_READ_ONLY: &str = "read_only";
pub const REASON_NO_MENTIONS: &str = "no_out_of_scope_mentions";

/// Result of scanning a worker response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputVerdict {
    pub decisions: Vec<InterceptorDecision>,
    /// True when the turn must be short-circuited.
    pub blocked: bool,
}

/// Scan worker text for mentions of paths outside the allowed set.
pub fn check_output(text: &str, allowed: &AllowedSet, mode: EnforcementMode) -> OutputVerdict {
    let mut decisions = Vec::new();
    for mention in mentioned_paths(text) {
        let resolved = resolve_under(allowed.root(), &mention);
        if allowed.check(&resolved).is_some() || mentions_allowed_suffix(allowed, &mention) {
            continue;
        }
        decisions.push(violation(
            mode,
            InterceptionPoint::OutputCheck,
            format!("{REASON_OUT_OF_SCOPE}: response mentions {mention}"),
            Some(resolved),
        ));
    }

    let blocked = decisions.iter().any(|d| d.kind == DecisionKind::Block);
    if decisions.is_empty() {
        decisions.push(InterceptorDecision {
            kind: DecisionKind::Allow,
            point: InterceptionPoint::OutputCheck,
            reason: REASON_NO_MENTIONS.to_string(),
            resolved_path: None,
        });
    }
    OutputVerdict { decisions, blocked }
}

/// Gate a single action invocation.
///
/// `available` is the action set exposed for this pass; `target_exists` reports
/// whether the write target already exists (staged or on disk).
pub fn gate_action(
    action: &ActionRequest,
    allowed: &AllowedSet,
    mode: EnforcementMode,
    available: &[ActionKind],
    target_exists: bool,
) -> InterceptorDecision {
    let kind = action.kind();
    let target = action.write_target().map(|raw| resolve_under(allowed.root(), raw));

    if !available.contains(&kind) {
        return block(
            InterceptionPoint::ActionGate,
            format!("{REASON_ACTION_UNAVAILABLE}: {} is not offered in this pass", kind.as_str()),
            target,
        );
    }
    let Some(target) = target else {
        return InterceptorDecision {
            kind: DecisionKind::Allow,
            point: InterceptionPoint::ActionGate,
            reason: REASON_READ_ONLY.to_string(),
            resolved_path: None,
        };
    };
    if kind == ActionKind::Create && target_exists {
        return block(
            InterceptionPoint::ActionGate,
            format!("{REASON_TARGET_EXISTS}: create may not overwrite an existing file"),
            Some(target),
        );
    }
    scope_decision(allowed, mode, InterceptionPoint::ActionGate, target)
}

/// Re-check a candidate patch before it is accepted.
///
/// `target_exists` reports whether the target was already on disk before the
/// pass; a create patch over such a file is refused like a create action.
pub fn check_patch(
    raw_path: &str,
    operation: PatchOperation,
    allowed: &AllowedSet,
    mode: EnforcementMode,
    available: &[ActionKind],
    target_exists: bool,
) -> InterceptorDecision {
    let target = resolve_under(allowed.root(), raw_path);
    let kind = match operation {
        PatchOperation::Create => ActionKind::Create,
        PatchOperation::Modify => ActionKind::Modify,
    };
    if !available.contains(&kind) {
        return block(
            InterceptionPoint::PatchAcceptance,
            format!("{REASON_ACTION_UNAVAILABLE}: {} patches are not accepted in this pass", kind.as_str()),
            Some(target),
        );
    }
    if kind == ActionKind::Create && target_exists {
        return block(
            InterceptionPoint::PatchAcceptance,
            format!("{REASON_TARGET_EXISTS}: create patch would overwrite an existing file"),
            Some(target),
        );
    }
    scope_decision(allowed, mode, InterceptionPoint::PatchAcceptance, target)
}

fn scope_decision(
    allowed: &AllowedSet,
    mode: EnforcementMode,
    point: InterceptionPoint,
    target: PathBuf,
) -> InterceptorDecision {
    // Escaping the root is never softened.
    if !is_within(allowed.root(), &target) {
        return block(point, REASON_OUTSIDE_ROOT.to_string(), Some(target));
    }
    match allowed.check(&target) {
        Some(matched) => InterceptorDecision {
            kind: DecisionKind::Allow,
            point,
            reason: matched.as_str().to_string(),
            resolved_path: Some(target),
        },
        None => violation(mode, point, REASON_OUT_OF_SCOPE.to_string(), Some(target)),
    }
}

fn mentions_allowed_suffix(allowed: &AllowedSet, mention: &str) -> bool {
    // A bare mention such as `StatusController.java` refers to an allowed file
    // when some member or suffix rule ends with that name.
    if mention.contains('/') {
        return false;
    }
    allowed
        .describe()
        .iter()
        .any(|rule| rule == mention || rule.ends_with(&format!("/{mention}")))
}

fn violation(
    mode: EnforcementMode,
    point: InterceptionPoint,
    reason: String,
    resolved_path: Option<PathBuf>,
) -> InterceptorDecision {
    let kind = match mode {
        EnforcementMode::Hard => DecisionKind::Block,
        EnforcementMode::Soft => DecisionKind::Warn,
    };
    InterceptorDecision {
        kind,
        point,
        reason,
        resolved_path,
    }
}

fn block(point: InterceptionPoint, reason: String, resolved_path: Option<PathBuf>) -> InterceptorDecision {
    InterceptorDecision {
        kind: DecisionKind::Block,
        point,
        reason,
        resolved_path,
    }
}
