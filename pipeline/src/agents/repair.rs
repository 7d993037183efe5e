//! Repair agent for the sandbox loop.
//!
//! A repair is one bounded worker pass with both create and modify actions,
//! run under the same interceptor stack as synthesis and seeded with the
//! classified failure and the diagnostic lines pulled from the log.

use std::time::Instant;

use anyhow::Result;
use tracing::instrument;

use crate::agents::synthesis::{PassKind, PassNote, PassRequest, SynthesisDriver, SynthesisSettings};
use crate::core::classifier::{FailureStage, extract_diagnostics, repair_strategy};
use crate::core::scope::AllowedSet;
use crate::core::types::{ErrorClass, InterceptorDecision, Patch, Phase};
use crate::io::fs::FileSystem;
use crate::io::process::tail;
use crate::io::prompt::RepairPromptInputs;
use crate::io::worker::Worker;

/// Bytes of log tail handed to the repair prompt.
const REPAIR_LOG_TAIL_BYTES: usize = 8_000;

pub struct RepairRequest<'a> {
    pub stage: FailureStage,
    pub iteration: u32,
    pub max_iterations: u32,
    pub class: ErrorClass,
    pub log: &'a str,
    pub intent: &'a str,
    pub allowed: &'a AllowedSet,
    pub deadline: Instant,
}

#[derive(Debug, Clone, Default)]
pub struct RepairOutcome {
    pub patches: Vec<Patch>,
    pub decisions: Vec<InterceptorDecision>,
    pub notes: Vec<PassNote>,
}

/// Produces repair patches for a classified sandbox failure.
pub trait Repairer {
    fn repair(&self, request: &RepairRequest<'_>) -> Result<RepairOutcome>;
}

/// Repairer backed by the LLM worker.
pub struct WorkerRepairer<'a> {
    driver: SynthesisDriver<'a>,
}

impl<'a> WorkerRepairer<'a> {
    pub fn new(worker: &'a dyn Worker, fs: &'a dyn FileSystem, settings: SynthesisSettings) -> Self {
        Self {
            driver: SynthesisDriver::new(worker, fs, settings).for_phase(Phase::SandboxTesting),
        }
    }
}

impl Repairer for WorkerRepairer<'_> {
    #[instrument(skip_all, fields(iteration = request.iteration, class = request.class.as_str()))]
    fn repair(&self, request: &RepairRequest<'_>) -> Result<RepairOutcome> {
        let pass = PassKind::Repair;
        let instruction = self.driver.prompt_builder().repair(&RepairPromptInputs {
            stage: request.stage.as_str().to_string(),
            iteration: request.iteration,
            max_iterations: request.max_iterations,
            error_class: request.class.as_str().to_string(),
            strategy: repair_strategy(request.class).as_str().to_string(),
            actions: pass.actions().iter().map(|a| a.as_str().to_string()).collect(),
            intent: request.intent.to_string(),
            diagnostics: extract_diagnostics(request.log),
            log_tail: tail(request.log, REPAIR_LOG_TAIL_BYTES),
        })?;
        let outcome = self.driver.run_pass(&PassRequest {
            pass,
            objective: format!("Repair the {} failure: {}", request.stage.as_str(), request.intent),
            instruction,
            allowed: request.allowed,
            deadline: request.deadline,
        })?;
        Ok(RepairOutcome {
            patches: outcome.patches,
            decisions: outcome.decisions,
            notes: outcome.notes,
        })
    }
}
