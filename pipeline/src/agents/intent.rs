//! Intent parser: feature request + context summary -> `FeatureSpec`.
//!
//! The worker is offered no actions. Its reply must carry a JSON object,
//! either as structured output, as the reply text, or inside a fenced
//! ```json block. The object is schema-checked before deserialization.

use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow, bail};
use jsonschema::Draft;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::core::feature_spec::validate_feature_spec;
use crate::core::types::{FeatureSpec, ProjectContext};
use crate::io::prompt::{GroundingInputs, IntentPromptInputs, PromptBuilder};
use crate::io::worker::{Message, Worker, WorkerRequest};

const FEATURE_SPEC_SCHEMA: &str = include_str!("../../schemas/feature_spec.schema.json");

pub struct IntentParser<'a> {
    worker: &'a dyn Worker,
    prompts: PromptBuilder,
}

impl<'a> IntentParser<'a> {
    pub fn new(worker: &'a dyn Worker, prompt_budget_bytes: usize) -> Self {
        Self {
            worker,
            prompts: PromptBuilder::new(prompt_budget_bytes),
        }
    }

    #[instrument(skip_all)]
    pub fn parse(
        &self,
        request: &str,
        context: &ProjectContext,
        hints: &[String],
    ) -> Result<FeatureSpec> {
        let grounding = self.prompts.grounding(&GroundingInputs {
            objective: request.to_string(),
            pass: "intent".to_string(),
            allowed: Vec::new(),
            actions: Vec::new(),
            mode: "hard".to_string(),
        })?;
        let prompt = self.prompts.intent(&IntentPromptInputs {
            request: request.to_string(),
            framework: context.framework_id.clone(),
            hints: hints.to_vec(),
            structure: context.structure_summary.clone(),
        })?;
        let reply = self
            .worker
            .respond(&WorkerRequest {
                conversation: vec![Message::system(grounding), Message::user(prompt)],
                available_actions: Vec::new(),
            })
            .context("intent worker turn")?;

        let value = match reply.output {
            Some(Value::String(raw)) => extract_json(&raw)?,
            Some(value) => value,
            None => extract_json(&reply.text)?,
        };
        let spec = parse_feature_spec(value)?;
        debug!(
            tasks = spec.tasks.len(),
            create = spec.entities_to_create.len(),
            extend = spec.entities_to_extend.len(),
            "feature spec parsed"
        );
        Ok(spec)
    }
}

/// Schema-check, deserialize and validate a feature spec value.
pub fn parse_feature_spec(value: Value) -> Result<FeatureSpec> {
    validate_schema(&value)?;
    let spec: FeatureSpec = serde_json::from_value(value).context("deserialize feature spec")?;
    validate_feature_spec(&spec)?;
    Ok(spec)
}

fn validate_schema(instance: &Value) -> Result<()> {
    let schema: Value =
        serde_json::from_str(FEATURE_SPEC_SCHEMA).context("parse feature spec schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .map_err(|err| anyhow!("compile feature spec schema: {err}"))?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("feature spec schema validation failed:\n- {}", messages.join("\n- "));
    }
    Ok(())
}

/// Find the JSON object in a worker reply.
fn extract_json(text: &str) -> Result<Value> {
    static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?s)```(?:json)?\s*\n(.*?)```").expect("fence regex")
    });

    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Ok(value);
    }
    if let Some(body) = FENCE_RE.captures(text).and_then(|caps| caps.get(1)) {
        return serde_json::from_str(body.as_str().trim()).context("parse fenced feature spec json");
    }
    match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if start < end => {
            serde_json::from_str(&trimmed[start..=end]).context("parse feature spec json")
        }
        _ => bail!("worker reply carries no feature spec json"),
    }
}
