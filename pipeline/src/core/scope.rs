//! File scope resolution and membership.
//!
//! An [`AllowedSet`] is built from the impact analyzer's [`ScopeHint`] and
//! answers one question: may a given absolute path be created or modified?
//! A path is permitted when it is
//!
//! - an exact member,
//! - a suffix match for a bare file-name hint (`StatusController.java`
//!   matches `src/api/StatusController.java`),
//! - a sibling of a member in the same directory, with the same extension,
//!   where the directory is a recognized layer directory or the file name
//!   carries a recognized layer suffix, or
//! - beneath a fallback directory (only used when the hint was empty).

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::path::{is_within, relative_display, resolve_under};
use crate::core::types::LayerConvention;

/// Directory names conventionally holding request-handling, business-logic
/// or data-model files.
pub const DEFAULT_LAYER_DIRS: &[&str] = &[
    "api",
    "controller",
    "controllers",
    "domain",
    "dto",
    "endpoints",
    "entities",
    "entity",
    "handler",
    "handlers",
    "logic",
    "model",
    "models",
    "repositories",
    "repository",
    "resources",
    "routes",
    "schemas",
    "service",
    "services",
    "usecases",
    "views",
];

/// File-stem suffixes that identify a layer file.
pub const DEFAULT_LAYER_SUFFIXES: &[&str] = &[
    "controller",
    "dto",
    "entity",
    "handler",
    "manager",
    "model",
    "repository",
    "resource",
    "router",
    "routes",
    "schema",
    "service",
    "usecase",
    "view",
];

/// Root-relative file-scope hint produced by impact analysis.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeHint {
    pub files_to_create: Vec<String>,
    pub files_to_modify: Vec<String>,
}

impl ScopeHint {
    pub fn is_empty(&self) -> bool {
        self.files_to_create.is_empty() && self.files_to_modify.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &String> {
        self.files_to_create.iter().chain(self.files_to_modify.iter())
    }
}

/// Recognized layer names used by the sibling expansion rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpansionRules {
    pub layer_dirs: BTreeSet<String>,
    pub layer_suffixes: BTreeSet<String>,
}

impl Default for ExpansionRules {
    fn default() -> Self {
        Self {
            layer_dirs: DEFAULT_LAYER_DIRS.iter().map(|s| s.to_string()).collect(),
            layer_suffixes: DEFAULT_LAYER_SUFFIXES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl ExpansionRules {
    /// Defaults extended with detector-reported conventions and configured extras.
    pub fn from_conventions(conventions: &[LayerConvention], extra_dirs: &[String]) -> Self {
        let mut rules = Self::default();
        for convention in conventions {
            for dir in &convention.directories {
                rules.layer_dirs.insert(dir.to_ascii_lowercase());
            }
            if let Some(suffix) = &convention.file_suffix {
                rules.layer_suffixes.insert(suffix.to_ascii_lowercase());
            }
            rules.layer_suffixes.insert(convention.layer.to_ascii_lowercase());
        }
        for dir in extra_dirs {
            rules.layer_dirs.insert(dir.to_ascii_lowercase());
        }
        rules
    }

    fn is_layer_dir(&self, dir: &Path) -> bool {
        dir.file_name()
            .map(|name| {
                self.layer_dirs
                    .contains(&name.to_string_lossy().to_ascii_lowercase())
            })
            .unwrap_or(false)
    }

    fn is_layer_file(&self, path: &Path) -> bool {
        let Some(stem) = path.file_stem() else {
            return false;
        };
        let stem = stem.to_string_lossy().to_ascii_lowercase();
        let stem = stem.trim_end_matches(['_', '-']);
        self.layer_suffixes
            .iter()
            .any(|suffix| stem.ends_with(suffix.as_str()))
    }
}

/// How a path matched the allowed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeMatch {
    Exact,
    Suffix,
    Sibling,
    Directory,
}

impl ScopeMatch {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScopeMatch::Exact => "exact",
            ScopeMatch::Suffix => "suffix",
            ScopeMatch::Sibling => "sibling",
            ScopeMatch::Directory => "directory",
        }
    }
}

/// Set of files a synthesis turn may create or modify.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowedSet {
    root: PathBuf,
    files: BTreeSet<PathBuf>,
    suffixes: BTreeSet<String>,
    directories: BTreeSet<PathBuf>,
    rules: ExpansionRules,
}

impl AllowedSet {
    /// Normalize a scope hint into an allowed set.
    ///
    /// Entries containing a `/` resolve to absolute files under `root`; bare
    /// file names become suffix rules; entries ending in `/` become directories.
    /// Entries escaping `root` are dropped. When nothing survives, the set falls
    /// back to `root/default_dir` so synthesis is never handed an all-blocking set.
    pub fn resolve(root: &Path, hint: &ScopeHint, rules: ExpansionRules, default_dir: &str) -> Self {
        let mut set = Self {
            root: root.to_path_buf(),
            files: BTreeSet::new(),
            suffixes: BTreeSet::new(),
            directories: BTreeSet::new(),
            rules,
        };

        for entry in hint.entries() {
            let cleaned = entry.trim().replace('\\', "/");
            if cleaned.is_empty() {
                continue;
            }
            if cleaned.ends_with('/') {
                let dir = resolve_under(root, cleaned.trim_end_matches('/'));
                if is_within(root, &dir) && dir != root {
                    set.directories.insert(dir);
                }
                continue;
            }
            let trimmed = cleaned.trim_start_matches("./");
            if !trimmed.contains('/') && !Path::new(trimmed).is_absolute() {
                set.suffixes.insert(trimmed.to_string());
                continue;
            }
            let resolved = resolve_under(root, trimmed);
            if is_within(root, &resolved) && resolved != root {
                set.files.insert(resolved);
            }
        }

        if set.is_empty() {
            set.directories.insert(resolve_under(root, default_dir));
        }
        set
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.suffixes.is_empty() && self.directories.is_empty()
    }

    /// Check a normalized absolute path against the set.
    pub fn check(&self, path: &Path) -> Option<ScopeMatch> {
        if !is_within(&self.root, path) || path == self.root {
            return None;
        }
        if self.files.contains(path) {
            return Some(ScopeMatch::Exact);
        }
        let rel = relative_display(&self.root, path);
        if self
            .suffixes
            .iter()
            .any(|suffix| rel == *suffix || rel.ends_with(&format!("/{suffix}")))
        {
            return Some(ScopeMatch::Suffix);
        }
        if self.is_sibling(path) {
            return Some(ScopeMatch::Sibling);
        }
        if self.directories.iter().any(|dir| path.starts_with(dir)) {
            return Some(ScopeMatch::Directory);
        }
        None
    }

    /// Resolve a raw (relative or absolute) path and check it.
    #[cfg(test)]
    fn check_raw(&self, raw: &str) -> (PathBuf, Option<ScopeMatch>) {
        let resolved = resolve_under(&self.root, raw);
        let matched = self.check(&resolved);
        (resolved, matched)
    }

    /// Root-relative rendering of every rule, for prompts and reports.
    pub fn describe(&self) -> Vec<String> {
        let mut lines = Vec::new();
        for file in &self.files {
            lines.push(relative_display(&self.root, file));
        }
        for suffix in &self.suffixes {
            lines.push(format!("**/{suffix}"));
        }
        for dir in &self.directories {
            lines.push(format!("{}/**", relative_display(&self.root, dir)));
        }
        lines
    }

    fn is_sibling(&self, path: &Path) -> bool {
        let Some(parent) = path.parent() else {
            return false;
        };
        let extension = path.extension();
        let layered = self.rules.is_layer_dir(parent) || self.rules.is_layer_file(path);
        layered
            && self
                .files
                .iter()
                .any(|member| member.parent() == Some(parent) && member.extension() == extension)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hint(modify: &[&str], create: &[&str]) -> ScopeHint {
        ScopeHint {
            files_to_create: create.iter().map(|s| s.to_string()).collect(),
            files_to_modify: modify.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn exact_member_is_permitted() {
        let root = Path::new("/repo");
        let set = AllowedSet::resolve(
            root,
            &hint(&["src/api/StatusController.java"], &[]),
            ExpansionRules::default(),
            "src",
        );
        let (_, matched) = set.check_raw("src/api/StatusController.java");
        assert_eq!(matched, Some(ScopeMatch::Exact));
    }

    #[test]
    fn bare_name_becomes_suffix_rule() {
        let root = Path::new("/repo");
        let set = AllowedSet::resolve(
            root,
            &hint(&["Controller.X"], &[]),
            ExpansionRules::default(),
            "src",
        );
        assert_eq!(set.check_raw("pkg/Controller.X").1, Some(ScopeMatch::Suffix));
        assert_eq!(set.check_raw("Controller.X").1, Some(ScopeMatch::Suffix));
        assert_eq!(set.check_raw("pkg/OtherController.X").1, None);
    }

    #[test]
    fn siblings_with_layer_names_are_expanded() {
        let root = Path::new("/repo");
        let set = AllowedSet::resolve(
            root,
            &hint(&["pkg/Controller.X"], &[]),
            ExpansionRules::default(),
            "src",
        );
        assert_eq!(set.check_raw("pkg/Controller.X").1, Some(ScopeMatch::Exact));
        assert_eq!(set.check_raw("pkg/Model.X").1, Some(ScopeMatch::Sibling));
        assert_eq!(set.check_raw("pkg/Service.X").1, Some(ScopeMatch::Sibling));
        assert_eq!(set.check_raw("pkg/Readme.X").1, None);
        assert_eq!(set.check_raw("other/Service.X").1, None);
    }

    #[test]
    fn any_sibling_in_layer_directory_is_permitted() {
        let root = Path::new("/repo");
        let set = AllowedSet::resolve(
            root,
            &hint(&["src/controllers/users.py"], &[]),
            ExpansionRules::default(),
            "src",
        );
        assert_eq!(
            set.check_raw("src/controllers/status.py").1,
            Some(ScopeMatch::Sibling)
        );
        assert_eq!(set.check_raw("src/controllers/status.rs").1, None);
    }

    #[test]
    fn empty_hint_falls_back_to_default_directory() {
        let root = Path::new("/repo");
        let set = AllowedSet::resolve(root, &ScopeHint::default(), ExpansionRules::default(), "src");
        assert!(!set.is_empty());
        assert_eq!(set.check_raw("src/new/file.rs").1, Some(ScopeMatch::Directory));
        assert_eq!(set.check_raw("docs/readme.md").1, None);
    }

    #[test]
    fn entries_escaping_root_are_dropped() {
        let root = Path::new("/repo");
        let set = AllowedSet::resolve(
            root,
            &hint(&["../elsewhere/main.rs"], &[]),
            ExpansionRules::default(),
            "src",
        );
        assert_eq!(set.check_raw("../elsewhere/main.rs").1, None);
        assert_eq!(set.describe(), vec!["src/**".to_string()]);
    }

    #[test]
    fn conventions_extend_layer_directories() {
        let rules = ExpansionRules::from_conventions(
            &[LayerConvention {
                layer: "handler".to_string(),
                directories: vec!["Endpoints2".to_string()],
                file_suffix: Some("Fn".to_string()),
            }],
            &["features".to_string()],
        );
        assert!(rules.layer_dirs.contains("endpoints2"));
        assert!(rules.layer_dirs.contains("features"));
        assert!(rules.layer_suffixes.contains("fn"));
    }
}
