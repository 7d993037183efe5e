//! Impact analysis: feature spec + affected-file hints -> scope hint.
//!
//! Every candidate is resolved against the codebase. Existing files are
//! planned for modification, missing files for creation. Bare file names are
//! looked up anywhere under the root. A create task whose file already exists
//! is reported so it can run as an extension instead.

use anyhow::Result;
use tracing::{debug, instrument};

use crate::core::path::{is_within, relative_display, resolve_under};
use crate::core::scope::ScopeHint;
use crate::core::types::{FeatureSpec, ProjectContext, Task, TaskKind};
use crate::io::fs::FileSystem;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImpactOutcome {
    pub hint: ScopeHint,
    /// Extend tasks whose entity matched no file.
    pub unresolved: Vec<String>,
    /// Indices of create tasks whose file already exists; they run as extensions.
    pub reclassified: Vec<usize>,
}

#[derive(Default)]
struct HintBuilder {
    create: Vec<String>,
    modify: Vec<String>,
}

impl HintBuilder {
    fn modify(&mut self, rel: String) {
        self.create.retain(|entry| entry != &rel);
        if !self.modify.contains(&rel) {
            self.modify.push(rel);
        }
    }

    fn create(&mut self, rel: String) {
        if !self.create.contains(&rel) && !self.modify.contains(&rel) {
            self.create.push(rel);
        }
    }

    fn finish(self) -> ScopeHint {
        ScopeHint {
            files_to_create: self.create,
            files_to_modify: self.modify,
        }
    }
}

#[instrument(skip_all)]
pub fn analyze_impact(
    fs: &dyn FileSystem,
    spec: &FeatureSpec,
    context: &ProjectContext,
    hints: &[String],
    default_dir: &str,
) -> Result<ImpactOutcome> {
    let mut builder = HintBuilder::default();
    let mut unresolved = Vec::new();

    for candidate in hints.iter().chain(spec.candidate_files.iter()) {
        resolve_candidate(fs, candidate, default_dir, &mut builder)?;
    }

    let mut reclassified = Vec::new();
    for (index, task) in spec.tasks.iter().enumerate().filter(|(_, task)| !task.refused) {
        let existing = match &task.target_file {
            Some(target) => resolve_candidate(fs, target, default_dir, &mut builder)?,
            None => {
                let found = find_entity(fs, &task.entity)?;
                let existing = !found.is_empty();
                for rel in found {
                    builder.modify(rel);
                }
                match (task.kind, existing) {
                    (_, true) => {}
                    (TaskKind::Create, false) => {
                        builder.create(planned_location(fs, task, context, default_dir)?);
                    }
                    (TaskKind::Extend, false) => {
                        debug!(entity = %task.entity, "no file found for extended entity");
                        unresolved.push(task.entity.clone());
                    }
                }
                existing
            }
        };
        if existing && task.kind == TaskKind::Create {
            debug!(entity = %task.entity, "create target already exists; planned as an extension");
            reclassified.push(index);
        }
    }

    let hint = builder.finish();
    debug!(
        create = hint.files_to_create.len(),
        modify = hint.files_to_modify.len(),
        "impact analysis finished"
    );
    Ok(ImpactOutcome {
        hint,
        unresolved,
        reclassified,
    })
}

/// Plan one candidate path. Returns whether it matched existing files.
fn resolve_candidate(
    fs: &dyn FileSystem,
    raw: &str,
    default_dir: &str,
    builder: &mut HintBuilder,
) -> Result<bool> {
    let cleaned = raw.trim().trim_start_matches("./").replace('\\', "/");
    if cleaned.is_empty() {
        return Ok(false);
    }
    let resolved = resolve_under(fs.root(), &cleaned);
    if !is_within(fs.root(), &resolved) {
        debug!(path = %cleaned, "candidate escapes the codebase root; ignored");
        return Ok(false);
    }
    let rel = relative_display(fs.root(), &resolved);
    if fs.exists(&rel) {
        builder.modify(rel);
        return Ok(true);
    }
    if cleaned.contains('/') {
        builder.create(rel);
        return Ok(false);
    }
    let found = fs.search_by_pattern(&format!("**/{cleaned}"))?;
    if found.is_empty() {
        builder.create(format!("{}/{cleaned}", default_dir.trim_end_matches('/')));
        return Ok(false);
    }
    for rel in found {
        builder.modify(rel);
    }
    Ok(true)
}

/// Files whose stem equals the entity name.
fn find_entity(fs: &dyn FileSystem, entity: &str) -> Result<Vec<String>> {
    if entity.is_empty() || entity.contains(['*', '?', '[', '/']) {
        return Ok(Vec::new());
    }
    let mut found = fs.search_by_pattern(&format!("**/{entity}.*"))?;
    found.extend(fs.search_by_pattern(&format!("{entity}.*"))?);
    found.sort();
    found.dedup();
    Ok(found)
}

/// Where a new entity should live: next to existing files of the same layer,
/// else in the first conventional layer directory, else the default directory.
fn planned_location(
    fs: &dyn FileSystem,
    task: &Task,
    context: &ProjectContext,
    default_dir: &str,
) -> Result<String> {
    let extension = context.primary_extension.as_deref().unwrap_or("txt");
    let file_name = format!("{}.{extension}", task.entity);

    let layer = context.layer_conventions.iter().find(|layer| {
        layer
            .file_suffix
            .as_deref()
            .is_some_and(|suffix| !suffix.is_empty() && task.entity.ends_with(suffix))
    });
    if let Some(layer) = layer {
        if let Some(suffix) = layer.file_suffix.as_deref() {
            let peers = fs.search_by_pattern(&format!("**/*{suffix}.{extension}"))?;
            if let Some(dir) = peers.first().and_then(|peer| peer.rsplit_once('/')).map(|(dir, _)| dir) {
                return Ok(format!("{dir}/{file_name}"));
            }
        }
        if let Some(dir) = layer.directories.first() {
            return Ok(format!("{}/{dir}/{file_name}", default_dir.trim_end_matches('/')));
        }
    }
    Ok(format!("{}/{file_name}", default_dir.trim_end_matches('/')))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::LayerConvention;
    use crate::io::fs::LocalFileSystem;
    use crate::test_support::TestCodebase;

    fn task(entity: &str, kind: TaskKind) -> Task {
        Task {
            description: format!("work on {entity}"),
            entity: entity.to_string(),
            kind,
            target_file: None,
            done: false,
            refused: false,
        }
    }

    fn spec(tasks: Vec<Task>) -> FeatureSpec {
        FeatureSpec {
            intent_summary: "status endpoint".to_string(),
            entities_to_create: Vec::new(),
            entities_to_extend: Vec::new(),
            tasks,
            excluded_features: Vec::new(),
            candidate_files: Vec::new(),
        }
    }

    fn java_context() -> ProjectContext {
        ProjectContext {
            primary_extension: Some("java".to_string()),
            layer_conventions: vec![LayerConvention {
                layer: "controller".to_string(),
                directories: vec!["controller".to_string()],
                file_suffix: Some("Controller".to_string()),
            }],
            ..ProjectContext::default()
        }
    }

    #[test]
    fn new_entity_lands_next_to_layer_peers() {
        let codebase = TestCodebase::java_service();
        let fs = LocalFileSystem::new(codebase.root()).expect("fs");
        let outcome = analyze_impact(
            &fs,
            &spec(vec![
                task("StatusController", TaskKind::Create),
                task("Routes", TaskKind::Extend),
            ]),
            &java_context(),
            &[],
            "src",
        )
        .expect("impact");
        assert_eq!(
            outcome.hint.files_to_create,
            vec!["src/api/StatusController.java".to_string()]
        );
        assert_eq!(outcome.hint.files_to_modify, vec!["src/api/Routes.java".to_string()]);
        assert!(outcome.unresolved.is_empty());
    }

    #[test]
    fn create_task_for_existing_entity_is_planned_as_extension() {
        let codebase = TestCodebase::java_service();
        let fs = LocalFileSystem::new(codebase.root()).expect("fs");
        let mut pinned = task("UserService", TaskKind::Create);
        pinned.target_file = Some("src/service/UserService.java".to_string());
        let outcome = analyze_impact(
            &fs,
            &spec(vec![
                task("StatusController", TaskKind::Create),
                task("UserController", TaskKind::Create),
                pinned,
            ]),
            &java_context(),
            &[],
            "src",
        )
        .expect("impact");
        assert_eq!(outcome.reclassified, vec![1, 2]);
        assert_eq!(
            outcome.hint.files_to_modify,
            vec![
                "src/api/UserController.java".to_string(),
                "src/service/UserService.java".to_string(),
            ]
        );
        assert_eq!(
            outcome.hint.files_to_create,
            vec!["src/api/StatusController.java".to_string()]
        );
    }

    #[test]
    fn bare_hint_is_found_anywhere() {
        let codebase = TestCodebase::java_service();
        let fs = LocalFileSystem::new(codebase.root()).expect("fs");
        let outcome = analyze_impact(
            &fs,
            &spec(Vec::new()),
            &java_context(),
            &["Routes.java".to_string(), "src/api/NewThing.java".to_string()],
            "src",
        )
        .expect("impact");
        assert_eq!(outcome.hint.files_to_modify, vec!["src/api/Routes.java".to_string()]);
        assert_eq!(outcome.hint.files_to_create, vec!["src/api/NewThing.java".to_string()]);
    }

    #[test]
    fn missing_extend_target_is_unresolved() {
        let codebase = TestCodebase::java_service();
        let fs = LocalFileSystem::new(codebase.root()).expect("fs");
        let outcome = analyze_impact(
            &fs,
            &spec(vec![task("Billing", TaskKind::Extend)]),
            &java_context(),
            &[],
            "src",
        )
        .expect("impact");
        assert!(outcome.hint.is_empty());
        assert_eq!(outcome.unresolved, vec!["Billing".to_string()]);
    }

    #[test]
    fn escaping_hints_are_ignored() {
        let codebase = TestCodebase::java_service();
        let fs = LocalFileSystem::new(codebase.root()).expect("fs");
        let outcome = analyze_impact(
            &fs,
            &spec(Vec::new()),
            &java_context(),
            &["../outside/Secret.java".to_string()],
            "src",
        )
        .expect("impact");
        assert!(outcome.hint.is_empty());
    }
}
