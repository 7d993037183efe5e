//! Prompt rendering for the intent, synthesis, grounding and repair turns.
//!
//! Templates mark their sections with `<!-- section:KEY required|droppable -->`.
//! When a rendered prompt exceeds the byte budget, droppable sections are
//! removed in a fixed order, then the last section is truncated.

use std::sync::LazyLock;

use anyhow::Result;
use minijinja::{Environment, context};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

const GROUNDING_TEMPLATE: &str = include_str!("prompts/grounding.md");
const INTENT_TEMPLATE: &str = include_str!("prompts/intent.md");
const SYNTHESIS_TEMPLATE: &str = include_str!("prompts/synthesis.md");
const REPAIR_TEMPLATE: &str = include_str!("prompts/repair.md");

/// Droppable sections, least important first.
const DROP_ORDER: [&str; 4] = ["structure", "conventions", "hints", "log"];

#[derive(Debug, Clone, Serialize)]
pub struct GroundingInputs {
    pub objective: String,
    pub pass: String,
    pub allowed: Vec<String>,
    pub actions: Vec<String>,
    pub mode: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct IntentPromptInputs {
    pub request: String,
    pub framework: Option<String>,
    pub hints: Vec<String>,
    pub structure: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SynthesisPromptInputs {
    pub pass: String,
    pub actions: Vec<String>,
    pub intent: String,
    pub tasks: Vec<String>,
    pub files_to_create: Vec<String>,
    pub files_to_modify: Vec<String>,
    pub excluded: Vec<String>,
    pub framework: Option<String>,
    pub conventions: Vec<String>,
    pub structure: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RepairPromptInputs {
    pub stage: String,
    pub iteration: u32,
    pub max_iterations: u32,
    pub error_class: String,
    pub strategy: String,
    pub actions: Vec<String>,
    pub intent: String,
    pub diagnostics: Vec<String>,
    pub log_tail: String,
}

struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("grounding", GROUNDING_TEMPLATE)
            .expect("grounding template should be valid");
        env.add_template("intent", INTENT_TEMPLATE)
            .expect("intent template should be valid");
        env.add_template("synthesis", SYNTHESIS_TEMPLATE)
            .expect("synthesis template should be valid");
        env.add_template("repair", REPAIR_TEMPLATE)
            .expect("repair template should be valid");
        Self { env }
    }

    fn render<S: Serialize>(&self, name: &str, ctx: S) -> Result<String> {
        Ok(self.env.get_template(name)?.render(ctx)?)
    }
}

static ENGINE: LazyLock<PromptEngine> = LazyLock::new(PromptEngine::new);

#[derive(Debug, Clone)]
struct Section {
    key: String,
    required: bool,
    content: String,
}

fn parse_sections(rendered: &str) -> Vec<Section> {
    static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->").expect("section regex")
    });

    let markers: Vec<(usize, usize, String, bool)> = SECTION_RE
        .captures_iter(rendered)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            Some((
                whole.start(),
                whole.end(),
                caps.get(1)?.as_str().to_string(),
                caps.get(2)?.as_str() == "required",
            ))
        })
        .collect();

    markers
        .iter()
        .enumerate()
        .filter_map(|(idx, (_, end, key, required))| {
            let stop = markers
                .get(idx + 1)
                .map(|(start, ..)| *start)
                .unwrap_or(rendered.len());
            let content = rendered[*end..stop].trim().to_string();
            (!content.is_empty() || *required).then(|| Section {
                key: key.clone(),
                required: *required,
                content,
            })
        })
        .collect()
}

fn total_len(sections: &[Section]) -> usize {
    sections.iter().map(|s| s.content.len()).sum()
}

fn apply_budget(sections: &mut Vec<Section>, budget: usize) {
    for key in DROP_ORDER {
        if total_len(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped prompt section for budget"
            );
            sections.remove(idx);
        }
    }

    if total_len(sections) <= budget {
        return;
    }
    let Some((last, rest)) = sections.split_last_mut() else {
        return;
    };
    let allowed = budget.saturating_sub(total_len(rest));
    if last.content.len() > allowed {
        let before_len = last.content.len();
        let mut cut = allowed.saturating_sub(12);
        while !last.content.is_char_boundary(cut) {
            cut -= 1;
        }
        last.content.truncate(cut);
        last.content.push_str("\n[truncated]");
        debug!(section = %last.key, before_len, after_len = last.content.len(), "truncated prompt section");
    }
}

fn join_sections(sections: &[Section]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Renders prompts within a byte budget.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        Self { budget_bytes }
    }

    fn finish(&self, rendered: &str) -> String {
        let mut sections = parse_sections(rendered);
        apply_budget(&mut sections, self.budget_bytes);
        join_sections(&sections)
    }

    /// Reminder block re-sent before every worker turn. Never budgeted.
    pub fn grounding(&self, inputs: &GroundingInputs) -> Result<String> {
        let verbs = match inputs.pass.as_str() {
            "create" => "create",
            "modify" => "modify",
            _ => "create or modify",
        };
        let rendered = ENGINE.render(
            "grounding",
            context! {
                objective => inputs.objective.trim(),
                pass => &inputs.pass,
                verbs => verbs,
                allowed => &inputs.allowed,
                actions => &inputs.actions,
                mode => &inputs.mode,
            },
        )?;
        Ok(join_sections(&parse_sections(&rendered)))
    }

    pub fn intent(&self, inputs: &IntentPromptInputs) -> Result<String> {
        let rendered = ENGINE.render(
            "intent",
            context! {
                request => inputs.request.trim(),
                framework => inputs.framework.as_deref(),
                hints => &inputs.hints,
                structure => (!inputs.structure.trim().is_empty()).then(|| inputs.structure.trim()),
            },
        )?;
        Ok(self.finish(&rendered))
    }

    pub fn synthesis(&self, inputs: &SynthesisPromptInputs) -> Result<String> {
        let rendered = ENGINE.render("synthesis", inputs)?;
        Ok(self.finish(&rendered))
    }

    pub fn repair(&self, inputs: &RepairPromptInputs) -> Result<String> {
        let rendered = ENGINE.render("repair", inputs)?;
        Ok(self.finish(&rendered))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synthesis_inputs(structure: String) -> SynthesisPromptInputs {
        SynthesisPromptInputs {
            pass: "create".to_string(),
            actions: vec!["read".to_string(), "create".to_string()],
            intent: "Expose GET /status".to_string(),
            tasks: vec!["Create StatusController handling GET /status".to_string()],
            files_to_create: vec!["src/api/StatusController.java".to_string()],
            files_to_modify: Vec::new(),
            excluded: vec!["authentication".to_string()],
            framework: Some("spring-boot".to_string()),
            conventions: vec!["controller: controller/ (*Controller)".to_string()],
            structure,
        }
    }

    #[test]
    fn synthesis_sections_are_ordered() {
        let prompt = PromptBuilder::new(10_000)
            .synthesis(&synthesis_inputs("top level: src/".to_string()))
            .expect("render");
        let contract = prompt.find("### Synthesis Contract").expect("contract");
        let tasks = prompt.find("### Tasks").expect("tasks");
        let files = prompt.find("### Files").expect("files");
        let excluded = prompt.find("### Out Of Scope").expect("excluded");
        let structure = prompt.find("### Codebase Structure").expect("structure");
        assert!(contract < tasks && tasks < files && files < excluded && excluded < structure);
        assert!(prompt.contains("Available actions: read, create."));
        assert!(!prompt.contains("<!-- section"));
    }

    #[test]
    fn budget_drops_structure_before_required_sections() {
        let prompt = PromptBuilder::new(900)
            .synthesis(&synthesis_inputs("src/file.java\n".repeat(200)))
            .expect("render");
        assert!(!prompt.contains("### Codebase Structure"));
        assert!(prompt.contains("### Synthesis Contract"));
        assert!(prompt.contains("### Files"));
    }

    #[test]
    fn grounding_lists_allowed_entries_and_actions() {
        let prompt = PromptBuilder::new(10)
            .grounding(&GroundingInputs {
                objective: "Expose GET /status".to_string(),
                pass: "create".to_string(),
                allowed: vec!["src/api/StatusController.java".to_string(), "src/**".to_string()],
                actions: vec!["read".to_string(), "create".to_string()],
                mode: "hard".to_string(),
            })
            .expect("render");
        assert!(prompt.contains("- src/api/StatusController.java"));
        assert!(prompt.contains("Available actions this turn: read, create."));
        assert!(prompt.contains("ends the turn"));
    }

    #[test]
    fn intent_omits_empty_optional_sections() {
        let prompt = PromptBuilder::new(10_000)
            .intent(&IntentPromptInputs {
                request: "add GET /status endpoint".to_string(),
                framework: None,
                hints: Vec::new(),
                structure: String::new(),
            })
            .expect("render");
        assert!(prompt.contains("add GET /status endpoint"));
        assert!(!prompt.contains("### Framework"));
        assert!(!prompt.contains("### Affected File Hints"));
    }

    #[test]
    fn repair_prompt_carries_diagnostics() {
        let prompt = PromptBuilder::new(10_000)
            .repair(&RepairPromptInputs {
                stage: "build".to_string(),
                iteration: 1,
                max_iterations: 10,
                error_class: "compile_time".to_string(),
                strategy: "fix_compile_errors".to_string(),
                actions: vec!["read".to_string(), "modify".to_string()],
                intent: "Expose GET /status".to_string(),
                diagnostics: vec!["error: expected `;`".to_string()],
                log_tail: "Compiling demo".to_string(),
            })
            .expect("render");
        assert!(prompt.contains("iteration 1 of 10"));
        assert!(prompt.contains("error: expected `;`"));
        assert!(prompt.contains("### Log Tail"));
    }
}
