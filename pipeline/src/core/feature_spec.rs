//! Feature-spec validation and task traceability.

use std::collections::BTreeSet;

use anyhow::{Result, bail};

use crate::core::scope::DEFAULT_LAYER_SUFFIXES;
use crate::core::types::{FeatureSpec, TaskKind};

/// Words that carry no meaning for traceability on their own.
const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "the", "for", "to", "of", "in", "on", "with", "new", "get", "set", "impl",
];

/// Structural checks beyond what the JSON schema expresses.
pub fn validate_feature_spec(spec: &FeatureSpec) -> Result<()> {
    if spec.intent_summary.trim().is_empty() {
        bail!("intent_summary is empty");
    }
    if spec.tasks.is_empty() {
        bail!("feature spec has no tasks");
    }
    for (idx, task) in spec.tasks.iter().enumerate() {
        if task.entity.trim().is_empty() {
            bail!("task {idx} has no entity");
        }
        if task.description.trim().is_empty() {
            bail!("task {idx} has no description");
        }
    }
    let created: BTreeSet<&str> = spec.entities_to_create.iter().map(String::as_str).collect();
    if let Some(both) = spec
        .entities_to_extend
        .iter()
        .find(|entity| created.contains(entity.as_str()))
    {
        bail!("entity {both} is listed as both created and extended");
    }
    Ok(())
}

/// Why a task was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefusedTask {
    pub index: usize,
    pub entity: String,
    pub reason: String,
}

/// Mark tasks that cannot be traced back to `request` as refused.
///
/// A task survives when its entity is listed under the matching entity list,
/// at least one significant word of the entity appears in the request, and no
/// excluded feature matches the task.
pub fn trace_tasks(spec: &mut FeatureSpec, request: &str) -> Vec<RefusedTask> {
    let request_words: BTreeSet<String> = split_words(request).into_iter().collect();
    let excluded: Vec<Vec<String>> = spec
        .excluded_features
        .iter()
        .map(|feature| significant_words(feature))
        .filter(|words| !words.is_empty())
        .collect();

    let mut refused = Vec::new();
    for (index, task) in spec.tasks.iter_mut().enumerate() {
        let listed = match task.kind {
            TaskKind::Create => &spec.entities_to_create,
            TaskKind::Extend => &spec.entities_to_extend,
        };
        let reason = if !listed.iter().any(|entity| entity == &task.entity) {
            Some(format!(
                "entity {} is not listed in entities_to_{}",
                task.entity,
                match task.kind {
                    TaskKind::Create => "create",
                    TaskKind::Extend => "extend",
                }
            ))
        } else if !entity_words(&task.entity)
            .iter()
            .any(|word| request_words.contains(word))
        {
            Some(format!(
                "entity {} is not traceable to the feature request",
                task.entity
            ))
        } else {
            let task_words: BTreeSet<String> = split_words(&task.entity)
                .into_iter()
                .chain(split_words(&task.description))
                .collect();
            excluded
                .iter()
                .find(|words| words.iter().all(|word| task_words.contains(word)))
                .map(|words| format!("task matches excluded feature '{}'", words.join(" ")))
        };

        if let Some(reason) = reason {
            task.refused = true;
            refused.push(RefusedTask {
                index,
                entity: task.entity.clone(),
                reason,
            });
        }
    }
    refused
}

/// Significant words of an entity, or all of its words when every word is a
/// layer suffix (`Routes`).
fn entity_words(entity: &str) -> Vec<String> {
    let words = significant_words(entity);
    if words.is_empty() {
        split_words(entity)
    } else {
        words
    }
}

/// Split identifiers and prose into lowercase words.
///
/// `StatusController`, `status_controller` and `status-controller` all yield
/// `["status", "controller"]`.
pub fn split_words(text: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut prev: Option<char> = None;
    for ch in text.chars() {
        if !ch.is_alphanumeric() {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            prev = None;
            continue;
        }
        let boundary = match prev {
            Some(p) => {
                (p.is_lowercase() && ch.is_uppercase())
                    || (p.is_alphabetic() && ch.is_ascii_digit())
                    || (p.is_ascii_digit() && ch.is_alphabetic())
            }
            None => false,
        };
        if boundary && !current.is_empty() {
            words.push(std::mem::take(&mut current));
        }
        current.extend(ch.to_lowercase());
        prev = Some(ch);
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

/// Words of `text` excluding stop words and layer suffixes.
pub fn significant_words(text: &str) -> Vec<String> {
    split_words(text)
        .into_iter()
        .filter(|word| word.len() > 1)
        .filter(|word| !STOP_WORDS.contains(&word.as_str()))
        .filter(|word| !DEFAULT_LAYER_SUFFIXES.contains(&word.as_str()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Task;

    fn task(entity: &str, kind: TaskKind, description: &str) -> Task {
        Task {
            description: description.to_string(),
            entity: entity.to_string(),
            kind,
            target_file: None,
            done: false,
            refused: false,
        }
    }

    fn spec(tasks: Vec<Task>) -> FeatureSpec {
        FeatureSpec {
            intent_summary: "Expose service status".to_string(),
            entities_to_create: vec!["StatusController".to_string(), "AuditLog".to_string()],
            entities_to_extend: vec!["Routes".to_string()],
            tasks,
            excluded_features: vec!["authentication".to_string()],
            candidate_files: Vec::new(),
        }
    }

    #[test]
    fn split_words_handles_case_styles() {
        assert_eq!(split_words("StatusController"), vec!["status", "controller"]);
        assert_eq!(split_words("status_controller"), vec!["status", "controller"]);
        assert_eq!(split_words("GET /status-v2"), vec!["get", "status", "v", "2"]);
    }

    #[test]
    fn significant_words_drop_layer_suffixes() {
        assert_eq!(significant_words("StatusController"), vec!["status"]);
    }

    #[test]
    fn traceable_tasks_survive() {
        let mut spec = spec(vec![
            task("StatusController", TaskKind::Create, "Add GET /status handler"),
            task("Routes", TaskKind::Extend, "Register the status route"),
        ]);
        let refused = trace_tasks(&mut spec, "add GET /status endpoint and register routes");
        assert!(refused.is_empty());
        assert_eq!(spec.active_tasks().count(), 2);
    }

    #[test]
    fn untraceable_entity_is_refused() {
        let mut spec = spec(vec![
            task("StatusController", TaskKind::Create, "Add GET /status handler"),
            task("AuditLog", TaskKind::Create, "Log every status request"),
        ]);
        let refused = trace_tasks(&mut spec, "add GET /status endpoint");
        assert_eq!(refused.len(), 1);
        assert_eq!(refused[0].entity, "AuditLog");
        assert!(spec.tasks[1].refused);
        assert_eq!(spec.active_tasks().count(), 1);
    }

    #[test]
    fn unlisted_entity_is_refused() {
        let mut spec = spec(vec![task("StatusService", TaskKind::Create, "status logic")]);
        let refused = trace_tasks(&mut spec, "add GET /status endpoint");
        assert_eq!(refused.len(), 1);
        assert!(refused[0].reason.contains("not listed"));
    }

    #[test]
    fn excluded_feature_is_refused() {
        let mut spec = spec(vec![task(
            "StatusController",
            TaskKind::Create,
            "Add authentication to the status endpoint",
        )]);
        let refused = trace_tasks(&mut spec, "add GET /status endpoint");
        assert_eq!(refused.len(), 1);
        assert!(refused[0].reason.contains("authentication"));
    }

    #[test]
    fn validation_rejects_empty_tasks() {
        let spec = spec(Vec::new());
        assert!(validate_feature_spec(&spec).is_err());
    }

    #[test]
    fn validation_rejects_entity_in_both_lists() {
        let mut spec = spec(vec![task("Routes", TaskKind::Extend, "wire route")]);
        spec.entities_to_create.push("Routes".to_string());
        let err = validate_feature_spec(&spec).expect_err("overlap");
        assert!(err.to_string().contains("Routes"));
    }
}
