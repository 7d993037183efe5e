//! Ordered chain of worker-result normalizers.
//!
//! Workers report what they did in different shapes: the driver's own record
//! of gated actions, a structured action list, an execution log, or a prose
//! summary. Each [`ResultNormalizer`] recognizes one shape. The first one that
//! recognizes the result wins; `Some(vec![])` means "recognized, zero actions"
//! and is distinct from every normalizer returning `None`.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::types::PatchOperation;

/// One file change extracted from a worker result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub operation: PatchOperation,
    /// Path as reported (relative to the codebase root or absolute).
    pub path: String,
    /// Full content after the change, when the shape carries it.
    pub content: Option<String>,
}

/// Everything a normalizer may inspect.
#[derive(Debug, Clone, Copy)]
pub struct WorkerTrace<'a> {
    /// Writes the driver performed through the action gate.
    pub recorded: &'a [ActionRecord],
    /// Structured output attached to the worker's final reply.
    pub output: Option<&'a Value>,
    /// Final reply text.
    pub text: &'a str,
}

pub trait ResultNormalizer: Send + Sync {
    fn name(&self) -> &'static str;
    fn normalize(&self, trace: &WorkerTrace<'_>) -> Option<Vec<ActionRecord>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Normalized {
    Matched {
        shape: &'static str,
        actions: Vec<ActionRecord>,
    },
    Unrecognized,
}

pub struct NormalizerChain {
    normalizers: Vec<Box<dyn ResultNormalizer>>,
}

impl Default for NormalizerChain {
    fn default() -> Self {
        Self {
            normalizers: vec![
                Box::new(RecordedTrace),
                Box::new(StructuredActionList),
                Box::new(ExecutionLog),
                Box::new(FreeTextSummary),
            ],
        }
    }
}

impl NormalizerChain {
    pub fn empty() -> Self {
        Self {
            normalizers: Vec::new(),
        }
    }

    /// Append a normalizer; it runs after those already registered.
    pub fn push(mut self, normalizer: Box<dyn ResultNormalizer>) -> Self {
        self.normalizers.push(normalizer);
        self
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.normalizers.iter().map(|n| n.name()).collect()
    }

    pub fn run(&self, trace: &WorkerTrace<'_>) -> Normalized {
        for normalizer in &self.normalizers {
            if let Some(actions) = normalizer.normalize(trace) {
                return Normalized::Matched {
                    shape: normalizer.name(),
                    actions: dedup_by_path(actions),
                };
            }
        }
        Normalized::Unrecognized
    }
}

/// Collapse repeated writes to one path: first operation wins, last content wins.
fn dedup_by_path(actions: Vec<ActionRecord>) -> Vec<ActionRecord> {
    let mut merged: Vec<ActionRecord> = Vec::new();
    for action in actions {
        match merged.iter_mut().find(|existing| existing.path == action.path) {
            Some(existing) => {
                if action.content.is_some() {
                    existing.content = action.content;
                }
            }
            None => merged.push(action),
        }
    }
    merged
}

/// Writes the driver itself performed through the action gate.
pub struct RecordedTrace;

impl ResultNormalizer for RecordedTrace {
    fn name(&self) -> &'static str {
        "recorded_trace"
    }

    fn normalize(&self, trace: &WorkerTrace<'_>) -> Option<Vec<ActionRecord>> {
        if trace.recorded.is_empty() {
            return None;
        }
        Some(trace.recorded.to_vec())
    }
}

/// `{"actions": [...]}` or a bare array of `{kind, path, content}` objects,
/// either as structured output or as a JSON string.
pub struct StructuredActionList;

impl ResultNormalizer for StructuredActionList {
    fn name(&self) -> &'static str {
        "structured_action_list"
    }

    fn normalize(&self, trace: &WorkerTrace<'_>) -> Option<Vec<ActionRecord>> {
        let parsed;
        let value = match trace.output {
            Some(Value::String(raw)) => {
                parsed = serde_json::from_str::<Value>(raw).ok()?;
                &parsed
            }
            Some(value) => value,
            None => {
                parsed = serde_json::from_str::<Value>(trace.text.trim()).ok()?;
                &parsed
            }
        };
        let items = match value {
            Value::Array(items) => items,
            Value::Object(map) => match map.get("actions") {
                Some(Value::Array(items)) => items,
                _ => return None,
            },
            _ => return None,
        };
        Some(items.iter().filter_map(action_from_value).collect())
    }
}

fn action_from_value(value: &Value) -> Option<ActionRecord> {
    let obj = value.as_object()?;
    let kind = ["kind", "type", "operation", "action"]
        .iter()
        .find_map(|key| obj.get(*key).and_then(Value::as_str))?;
    let operation = operation_from_verb(kind)?;
    let path = ["path", "file", "target_path", "target"]
        .iter()
        .find_map(|key| obj.get(*key).and_then(Value::as_str))?;
    let content = ["content", "payload", "new_content"]
        .iter()
        .find_map(|key| obj.get(*key).and_then(Value::as_str))
        .map(str::to_string);
    Some(ActionRecord {
        operation,
        path: path.to_string(),
        content,
    })
}

fn operation_from_verb(verb: &str) -> Option<PatchOperation> {
    match verb.trim().to_ascii_lowercase().as_str() {
        "create" | "created" | "add" | "added" | "new" | "write" | "wrote" => {
            Some(PatchOperation::Create)
        }
        "modify" | "modified" | "edit" | "edited" | "update" | "updated" | "change"
        | "changed" => Some(PatchOperation::Modify),
        _ => None,
    }
}

/// Line-oriented execution log, e.g. `[tool] Created file: src/a.rs`.
pub struct ExecutionLog;

impl ResultNormalizer for ExecutionLog {
    fn name(&self) -> &'static str {
        "execution_log"
    }

    fn normalize(&self, trace: &WorkerTrace<'_>) -> Option<Vec<ActionRecord>> {
        static LOG_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(
                r"(?im)^\s*(?:\[[^\]]*\]\s*)?(?:[-*]\s*)?(created|create|wrote|write|added|modified|modify|edited|edit|updated|update)\s+(?:file\s*)?:?\s*`?([^\s`]+)`?\s*$",
            )
            .expect("execution log regex")
        });

        let text = match trace.output {
            Some(Value::String(raw)) => raw.as_str(),
            _ => trace.text,
        };
        let actions: Vec<ActionRecord> = LOG_LINE_RE
            .captures_iter(text)
            .filter_map(|caps| {
                let operation = operation_from_verb(caps.get(1)?.as_str())?;
                Some(ActionRecord {
                    operation,
                    path: caps.get(2)?.as_str().to_string(),
                    content: None,
                })
            })
            .collect();
        if actions.is_empty() {
            return None;
        }
        Some(actions)
    }
}

/// Prose summary naming changed files, or stating that nothing changed.
pub struct FreeTextSummary;

impl ResultNormalizer for FreeTextSummary {
    fn name(&self) -> &'static str {
        "free_text_summary"
    }

    fn normalize(&self, trace: &WorkerTrace<'_>) -> Option<Vec<ActionRecord>> {
        static NO_CHANGES_RE: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(r"(?i)\b(no (?:file )?changes|did not (?:create|modify|change)|nothing to (?:do|change)|no files were (?:created|modified))\b")
                .expect("no-changes regex")
        });
        static SUMMARY_RE: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(r"(?i)\b(created|added|modified|updated|edited)\b[^.\n`]*?`([^`\s]+\.[A-Za-z0-9]+)`")
                .expect("summary regex")
        });

        let text = match trace.output {
            Some(Value::String(raw)) => raw.as_str(),
            _ => trace.text,
        };
        let actions: Vec<ActionRecord> = SUMMARY_RE
            .captures_iter(text)
            .filter_map(|caps| {
                Some(ActionRecord {
                    operation: operation_from_verb(caps.get(1)?.as_str())?,
                    path: caps.get(2)?.as_str().to_string(),
                    content: None,
                })
            })
            .collect();
        if !actions.is_empty() {
            return Some(actions);
        }
        if NO_CHANGES_RE.is_match(text) {
            return Some(Vec::new());
        }
        None
    }
}
