//! Execution applier: writes accepted patches to the codebase.
//!
//! Each patch is re-checked against the allowed set immediately before the
//! write. Patches carry full file contents, so a modify whose target is
//! missing is written as a new file. A create never replaces an existing
//! file; re-applying a create with identical content is a no-op.

use std::path::PathBuf;

use anyhow::bail;
use tracing::{debug, info, instrument, warn};

use crate::core::actions::ActionKind;
use crate::core::intercept::check_patch;
use crate::core::path::relative_display;
use crate::core::scope::AllowedSet;
use crate::core::types::{DecisionKind, EnforcementMode, InterceptorDecision, Patch, PatchOperation};
use crate::io::fs::FileSystem;

const WRITE_ACTIONS: [ActionKind; 2] = [ActionKind::Create, ActionKind::Modify];

#[derive(Debug, Clone, Default)]
pub struct ApplyOutcome {
    /// Files written, in write order.
    pub applied: Vec<PathBuf>,
    pub decisions: Vec<InterceptorDecision>,
    /// Per-patch write failures.
    pub failures: Vec<String>,
}

#[instrument(skip_all, fields(patches = patches.len()))]
pub fn apply_patches(
    fs: &dyn FileSystem,
    allowed: &AllowedSet,
    mode: EnforcementMode,
    patches: &[Patch],
) -> ApplyOutcome {
    let mut outcome = ApplyOutcome::default();
    for patch in patches {
        let rel = relative_display(fs.root(), &patch.target_path);
        // Existing create targets are refused by `write_patch`, which lets an
        // identical re-apply through.
        let decision = check_patch(&rel, patch.operation, allowed, mode, &WRITE_ACTIONS, false);
        let blocked = decision.kind == DecisionKind::Block;
        if decision.kind != DecisionKind::Allow {
            warn!(
                path = %rel,
                decision = decision.kind.as_str(),
                reason = %decision.reason,
                "patch re-check before write"
            );
        }
        outcome.decisions.push(decision);
        if blocked {
            continue;
        }

        match write_patch(fs, &rel, patch) {
            Ok(()) => {
                debug!(path = %rel, operation = patch.operation.as_str(), "patch written");
                if !outcome.applied.contains(&patch.target_path) {
                    outcome.applied.push(patch.target_path.clone());
                }
            }
            Err(err) => {
                warn!(path = %rel, error = %format!("{err:#}"), "patch write failed");
                outcome.failures.push(format!("{rel}: {err:#}"));
            }
        }
    }
    info!(
        applied = outcome.applied.len(),
        failed = outcome.failures.len(),
        "patches applied"
    );
    outcome
}

fn write_patch(fs: &dyn FileSystem, rel: &str, patch: &Patch) -> anyhow::Result<()> {
    if !fs.exists(rel) {
        return fs.create(rel, &patch.payload);
    }
    let current = fs.read(rel, 0, None)?;
    if current == patch.payload {
        return Ok(());
    }
    if patch.operation == PatchOperation::Create {
        bail!("create target already exists with different content");
    }
    fs.modify(rel, &current, &patch.payload)
}
