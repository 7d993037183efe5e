//! Scope-enforcement interceptor stack around worker calls.
//!
//! Every worker turn passes through three points: the grounding block is
//! prepended to the conversation, the reply text is checked for out-of-scope
//! path mentions, and each write action is gated against the allowed set.
//! Every decision is logged and collected for the workflow's violation list.

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::core::actions::{ActionKind, ActionRequest};
use crate::core::intercept::{check_output, check_patch, gate_action};
use crate::core::path::relative_display;
use crate::core::scope::AllowedSet;
use crate::core::types::{
    DecisionKind, EnforcementMode, InterceptorDecision, PatchOperation, Phase,
};
use crate::io::worker::{Message, Worker, WorkerReply, WorkerRequest};

/// Worker reply after the post-call output check.
#[derive(Debug, Clone, PartialEq)]
pub enum GuardedReply {
    Passed(WorkerReply),
    /// The turn was short-circuited; its actions must not run.
    Blocked {
        reply: WorkerReply,
        explanation: String,
    },
}

pub struct InterceptorStack<'a> {
    worker: &'a dyn Worker,
    allowed: &'a AllowedSet,
    mode: EnforcementMode,
    phase: Phase,
    grounding: String,
    decisions: Vec<InterceptorDecision>,
}

impl<'a> InterceptorStack<'a> {
    pub fn new(
        worker: &'a dyn Worker,
        allowed: &'a AllowedSet,
        mode: EnforcementMode,
        phase: Phase,
        grounding: String,
    ) -> Self {
        Self {
            worker,
            allowed,
            mode,
            phase,
            grounding,
            decisions: Vec::new(),
        }
    }

    /// Run one worker turn with grounding and the post-call output check.
    pub fn call(&mut self, conversation: &[Message], available: &[ActionKind]) -> Result<GuardedReply> {
        let mut messages = Vec::with_capacity(conversation.len() + 1);
        messages.push(Message::system(self.grounding.clone()));
        messages.extend(conversation.iter().cloned());

        let reply = self
            .worker
            .respond(&WorkerRequest {
                conversation: messages,
                available_actions: available.to_vec(),
            })
            .context("worker turn")?;

        let verdict = check_output(&reply.text, self.allowed, self.mode);
        for decision in &verdict.decisions {
            self.log(decision);
        }
        let explanation = verdict.blocked.then(|| {
            let paths: Vec<String> = verdict
                .decisions
                .iter()
                .filter(|d| d.kind == DecisionKind::Block)
                .filter_map(|d| d.resolved_path.as_ref())
                .map(|p| relative_display(self.allowed.root(), p))
                .collect();
            format!(
                "Turn rejected: your reply refers to files outside the permitted scope ({}). \
                 Work only on the files listed in the scope block.",
                paths.join(", ")
            )
        });
        self.decisions.extend(verdict.decisions);

        Ok(match explanation {
            Some(explanation) => GuardedReply::Blocked { reply, explanation },
            None => GuardedReply::Passed(reply),
        })
    }

    /// Gate one action invocation.
    pub fn gate(
        &mut self,
        action: &ActionRequest,
        available: &[ActionKind],
        target_exists: bool,
    ) -> InterceptorDecision {
        let decision = gate_action(action, self.allowed, self.mode, available, target_exists);
        self.log(&decision);
        self.decisions.push(decision.clone());
        decision
    }

    /// Re-check a candidate patch before acceptance.
    pub fn accept_patch(
        &mut self,
        raw_path: &str,
        operation: PatchOperation,
        available: &[ActionKind],
        target_exists: bool,
    ) -> InterceptorDecision {
        let decision = check_patch(raw_path, operation, self.allowed, self.mode, available, target_exists);
        self.log(&decision);
        self.decisions.push(decision.clone());
        decision
    }

    pub fn decisions(&self) -> &[InterceptorDecision] {
        &self.decisions
    }

    pub fn into_decisions(self) -> Vec<InterceptorDecision> {
        self.decisions
    }

    fn log(&self, decision: &InterceptorDecision) {
        let resolved_path = decision
            .resolved_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        match decision.kind {
            DecisionKind::Allow => debug!(
                phase = %self.phase,
                decision = decision.kind.as_str(),
                point = decision.point.as_str(),
                reason = %decision.reason,
                resolved_path = %resolved_path,
                "interceptor decision"
            ),
            DecisionKind::Block | DecisionKind::Warn => warn!(
                phase = %self.phase,
                decision = decision.kind.as_str(),
                point = decision.point.as_str(),
                reason = %decision.reason,
                resolved_path = %resolved_path,
                "interceptor decision"
            ),
        }
    }
}
