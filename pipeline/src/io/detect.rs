//! Context and framework detection.
//!
//! Project types are capability descriptors registered in a
//! [`ProjectRegistry`]. Each descriptor scores a codebase root; the highest
//! score above zero wins, ties going to the earlier registration. Supporting a
//! new ecosystem means registering one more descriptor.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use ignore::WalkBuilder;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::core::types::{LayerConvention, ProjectContext};

/// How to build, start and probe a project type inside a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxProfile {
    /// Commands that must succeed before building (toolchain checks).
    pub prerequisites: Vec<Vec<String>>,
    pub build: Vec<String>,
    pub run: Vec<String>,
    /// Regex matched against new log output to detect readiness.
    pub readiness_pattern: Option<String>,
    /// Port the started artifact is expected to listen on.
    pub port: Option<u16>,
}

/// Collaborator producing a [`ProjectContext`] for a codebase.
pub trait ContextDetector: Send + Sync {
    fn detect(&self, root: &Path) -> Result<ProjectContext>;

    /// Sandbox profile for a detected project type, if the type is testable.
    fn sandbox_profile(&self, project_type: &str) -> Option<SandboxProfile>;
}

/// Capability descriptor for one ecosystem.
pub trait ProjectDescriptor: Send + Sync {
    fn id(&self) -> &str;
    /// Confidence in `[0, 1]` that `root` is this project type.
    fn detect(&self, root: &Path) -> f32;
    /// Framework refinement, e.g. `spring-boot` for a maven project.
    fn framework(&self, root: &Path) -> Option<String>;
    fn layers(&self) -> Vec<LayerConvention>;
    /// Source file extension, without the dot.
    fn primary_extension(&self) -> &str;
    fn sandbox_profile(&self) -> Option<SandboxProfile>;
}

/// Descriptor keyed on marker files and framework signatures in them.
#[derive(Debug, Clone)]
pub struct MarkerDescriptor {
    pub id: String,
    /// Any of these files at the root marks the project type.
    pub markers: Vec<String>,
    /// `(framework id, needle)` pairs searched for in marker files.
    pub frameworks: Vec<(String, String)>,
    pub extension: String,
    pub layers: Vec<LayerConvention>,
    pub profile: Option<SandboxProfile>,
}

impl MarkerDescriptor {
    fn marker_contents(&self, root: &Path) -> Vec<String> {
        self.markers
            .iter()
            .filter_map(|marker| fs::read_to_string(root.join(marker)).ok())
            .collect()
    }
}

impl ProjectDescriptor for MarkerDescriptor {
    fn id(&self) -> &str {
        &self.id
    }

    fn detect(&self, root: &Path) -> f32 {
        if !self.markers.iter().any(|marker| root.join(marker).is_file()) {
            return 0.0;
        }
        let mut confidence = 0.6;
        if self.framework(root).is_some() {
            confidence += 0.3;
        }
        if has_source_with_extension(root, &self.extension) {
            confidence += 0.1;
        }
        confidence
    }

    fn framework(&self, root: &Path) -> Option<String> {
        let contents = self.marker_contents(root);
        self.frameworks
            .iter()
            .find(|(_, needle)| contents.iter().any(|body| body.contains(needle.as_str())))
            .map(|(id, _)| id.clone())
    }

    fn layers(&self) -> Vec<LayerConvention> {
        self.layers.clone()
    }

    fn primary_extension(&self) -> &str {
        &self.extension
    }

    fn sandbox_profile(&self) -> Option<SandboxProfile> {
        self.profile.clone()
    }
}

pub struct ProjectRegistry {
    descriptors: Vec<Box<dyn ProjectDescriptor>>,
}

impl ProjectRegistry {
    pub fn empty() -> Self {
        Self {
            descriptors: Vec::new(),
        }
    }

    /// Registry with the built-in cargo, node, python, go and maven descriptors.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        for descriptor in builtin_descriptors() {
            registry.register(Box::new(descriptor));
        }
        registry
    }

    pub fn register(&mut self, descriptor: Box<dyn ProjectDescriptor>) {
        self.descriptors.push(descriptor);
    }

    pub fn get(&self, id: &str) -> Option<&dyn ProjectDescriptor> {
        self.descriptors
            .iter()
            .find(|descriptor| descriptor.id() == id)
            .map(|descriptor| descriptor.as_ref())
    }

    /// Highest-confidence descriptor for `root`; earlier registrations win ties.
    pub fn best_match(&self, root: &Path) -> Option<(&dyn ProjectDescriptor, f32)> {
        let mut best: Option<(&dyn ProjectDescriptor, f32)> = None;
        for descriptor in &self.descriptors {
            let confidence = descriptor.detect(root);
            debug!(id = descriptor.id(), confidence, "scored project descriptor");
            if confidence <= 0.0 {
                continue;
            }
            if best.is_none_or(|(_, current)| confidence > current) {
                best = Some((descriptor.as_ref(), confidence));
            }
        }
        best
    }
}

/// [`ContextDetector`] backed by a [`ProjectRegistry`].
pub struct RegistryDetector {
    registry: ProjectRegistry,
}

impl RegistryDetector {
    pub fn new(registry: ProjectRegistry) -> Self {
        Self { registry }
    }
}

impl Default for RegistryDetector {
    fn default() -> Self {
        Self::new(ProjectRegistry::with_defaults())
    }
}

impl ContextDetector for RegistryDetector {
    #[instrument(skip_all, fields(root = %root.display()))]
    fn detect(&self, root: &Path) -> Result<ProjectContext> {
        let structure_summary = summarize_structure(root)?;
        let Some((descriptor, confidence)) = self.registry.best_match(root) else {
            info!("no project type detected");
            return Ok(ProjectContext {
                structure_summary,
                ..ProjectContext::default()
            });
        };
        let framework_id = descriptor.framework(root);
        info!(
            project_type = descriptor.id(),
            framework = framework_id.as_deref().unwrap_or("none"),
            confidence,
            "detected project type"
        );
        Ok(ProjectContext {
            structure_summary,
            framework_id,
            project_type: Some(descriptor.id().to_string()),
            primary_extension: Some(descriptor.primary_extension().to_string()),
            layer_conventions: descriptor.layers(),
        })
    }

    fn sandbox_profile(&self, project_type: &str) -> Option<SandboxProfile> {
        self.registry.get(project_type)?.sandbox_profile()
    }
}

/// Top-level entries plus file counts per extension.
pub fn summarize_structure(root: &Path) -> Result<String> {
    let mut top_level: Vec<String> = fs::read_dir(root)
        .with_context(|| format!("read {}", root.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false) {
                format!("{name}/")
            } else {
                name
            }
        })
        .filter(|name| !name.starts_with('.'))
        .collect();
    top_level.sort();

    let mut by_extension: BTreeMap<String, usize> = BTreeMap::new();
    for path in source_files(root) {
        if let Some(ext) = path.extension() {
            *by_extension
                .entry(ext.to_string_lossy().to_ascii_lowercase())
                .or_insert(0) += 1;
        }
    }

    let mut summary = format!("top level: {}\n", top_level.join(", "));
    let counts: Vec<String> = by_extension
        .iter()
        .map(|(ext, count)| format!(".{ext}: {count}"))
        .collect();
    summary.push_str(&format!("files by extension: {}", counts.join(", ")));
    Ok(summary)
}

fn source_files(root: &Path) -> impl Iterator<Item = std::path::PathBuf> {
    WalkBuilder::new(root)
        .hidden(true)
        .git_ignore(true)
        .require_git(false)
        .max_depth(Some(8))
        .filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            !matches!(name.as_ref(), "target" | "node_modules" | "build" | "dist")
        })
        .build()
        .flatten()
        .filter(|entry| entry.file_type().is_some_and(|ft| ft.is_file()))
        .map(|entry| entry.into_path())
}

fn has_source_with_extension(root: &Path, extension: &str) -> bool {
    source_files(root).any(|path| {
        path.extension()
            .is_some_and(|ext| ext.to_string_lossy().eq_ignore_ascii_case(extension))
    })
}

fn layer(name: &str, dirs: &[&str], suffix: Option<&str>) -> LayerConvention {
    LayerConvention {
        layer: name.to_string(),
        directories: dirs.iter().map(|d| d.to_string()).collect(),
        file_suffix: suffix.map(str::to_string),
    }
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|part| part.to_string()).collect()
}

fn frameworks(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|(id, needle)| (id.to_string(), needle.to_string()))
        .collect()
}

fn builtin_descriptors() -> Vec<MarkerDescriptor> {
    vec![
        MarkerDescriptor {
            id: "cargo".to_string(),
            markers: argv(&["Cargo.toml"]),
            frameworks: frameworks(&[("axum", "axum"), ("actix-web", "actix-web")]),
            extension: "rs".to_string(),
            layers: vec![
                layer("handler", &["handlers", "routes", "api"], Some("handler")),
                layer("service", &["services", "domain"], Some("service")),
                layer("model", &["models", "entities"], Some("model")),
            ],
            profile: Some(SandboxProfile {
                prerequisites: vec![argv(&["cargo", "--version"])],
                build: argv(&["cargo", "build", "--quiet"]),
                run: argv(&["cargo", "run", "--quiet"]),
                readiness_pattern: Some(r"(?i)listening on".to_string()),
                port: None,
            }),
        },
        MarkerDescriptor {
            id: "node".to_string(),
            markers: argv(&["package.json"]),
            frameworks: frameworks(&[
                ("nestjs", "@nestjs/core"),
                ("express", "\"express\""),
                ("fastify", "\"fastify\""),
            ]),
            extension: "js".to_string(),
            layers: vec![
                layer("controller", &["controllers", "routes", "api"], Some("controller")),
                layer("service", &["services"], Some("service")),
                layer("model", &["models", "schemas"], Some("model")),
            ],
            profile: Some(SandboxProfile {
                prerequisites: vec![argv(&["node", "--version"]), argv(&["npm", "--version"])],
                build: argv(&["npm", "install", "--no-audit", "--no-fund"]),
                run: argv(&["npm", "start"]),
                readiness_pattern: Some(r"(?i)(listening|server (is )?running|ready)".to_string()),
                port: Some(3000),
            }),
        },
        MarkerDescriptor {
            id: "python".to_string(),
            markers: argv(&["pyproject.toml", "requirements.txt", "setup.py"]),
            frameworks: frameworks(&[
                ("fastapi", "fastapi"),
                ("flask", "flask"),
                ("django", "django"),
            ]),
            extension: "py".to_string(),
            layers: vec![
                layer("router", &["routers", "routes", "api", "views"], Some("router")),
                layer("service", &["services"], Some("service")),
                layer("model", &["models", "schemas"], Some("model")),
            ],
            profile: Some(SandboxProfile {
                prerequisites: vec![argv(&["python3", "--version"])],
                build: argv(&["python3", "-m", "compileall", "-q", "."]),
                run: argv(&["python3", "main.py"]),
                readiness_pattern: Some(r"(?i)(uvicorn running|running on|application startup complete)".to_string()),
                port: Some(8000),
            }),
        },
        MarkerDescriptor {
            id: "go".to_string(),
            markers: argv(&["go.mod"]),
            frameworks: frameworks(&[("gin", "gin-gonic/gin"), ("echo", "labstack/echo")]),
            extension: "go".to_string(),
            layers: vec![
                layer("handler", &["handlers", "handler", "api"], Some("handler")),
                layer("service", &["service", "services"], Some("service")),
                layer("model", &["models", "model"], Some("model")),
            ],
            profile: Some(SandboxProfile {
                prerequisites: vec![argv(&["go", "version"])],
                build: argv(&["go", "build", "./..."]),
                run: argv(&["go", "run", "."]),
                readiness_pattern: Some(r"(?i)listening".to_string()),
                port: Some(8080),
            }),
        },
        MarkerDescriptor {
            id: "maven".to_string(),
            markers: argv(&["pom.xml"]),
            frameworks: frameworks(&[("spring-boot", "spring-boot")]),
            extension: "java".to_string(),
            layers: vec![
                layer("controller", &["controller", "controllers", "web", "api"], Some("Controller")),
                layer("service", &["service", "services"], Some("Service")),
                layer("repository", &["repository", "repositories"], Some("Repository")),
                layer("model", &["model", "entity", "domain", "dto"], None),
            ],
            profile: Some(SandboxProfile {
                prerequisites: vec![argv(&["mvn", "-v"]), argv(&["java", "-version"])],
                build: argv(&["mvn", "-q", "-DskipTests", "package"]),
                run: argv(&["mvn", "-q", "spring-boot:run"]),
                readiness_pattern: Some(r"Started \S+ in".to_string()),
                port: Some(8080),
            }),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maven_spring_project_is_detected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        fs::write(
            root.join("pom.xml"),
            "<project><artifactId>spring-boot-starter-web</artifactId></project>",
        )
        .expect("write pom");
        fs::create_dir_all(root.join("src/main/java/demo/controller")).expect("mkdir");
        fs::write(
            root.join("src/main/java/demo/controller/HelloController.java"),
            "class HelloController {}",
        )
        .expect("write java");

        let context = RegistryDetector::default().detect(root).expect("detect");
        assert_eq!(context.project_type.as_deref(), Some("maven"));
        assert_eq!(context.framework_id.as_deref(), Some("spring-boot"));
        assert_eq!(context.primary_extension.as_deref(), Some("java"));
        assert!(context.structure_summary.contains(".java: 1"));
        assert!(
            context
                .layer_conventions
                .iter()
                .any(|layer| layer.file_suffix.as_deref() == Some("Controller"))
        );
    }

    #[test]
    fn unknown_project_has_no_type() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("notes.txt"), "hello").expect("write");
        let context = RegistryDetector::default().detect(temp.path()).expect("detect");
        assert!(context.project_type.is_none());
        assert!(context.structure_summary.contains("notes.txt"));
    }

    #[test]
    fn highest_confidence_wins_and_ties_go_to_first_registration() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        fs::write(root.join("package.json"), "{\"dependencies\":{\"express\":\"4\"}}")
            .expect("write");
        fs::write(root.join("requirements.txt"), "requests\n").expect("write");

        let registry = ProjectRegistry::with_defaults();
        let (best, confidence) = registry.best_match(root).expect("match");
        assert_eq!(best.id(), "node");
        assert!(confidence > 0.6);

        fs::write(root.join("package.json"), "{}").expect("rewrite");
        let (best, _) = registry.best_match(root).expect("match");
        assert_eq!(best.id(), "node");
    }

    #[test]
    fn registered_descriptor_extends_detection() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("mix.exs"), "defmodule Demo do end").expect("write");
        let mut registry = ProjectRegistry::empty();
        registry.register(Box::new(MarkerDescriptor {
            id: "mix".to_string(),
            markers: vec!["mix.exs".to_string()],
            frameworks: Vec::new(),
            extension: "ex".to_string(),
            layers: Vec::new(),
            profile: None,
        }));
        let detector = RegistryDetector::new(registry);
        let context = detector.detect(temp.path()).expect("detect");
        assert_eq!(context.project_type.as_deref(), Some("mix"));
        assert!(detector.sandbox_profile("mix").is_none());
    }
}
