//! Root-scoped filesystem action provider.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result, anyhow, bail};
use glob::Pattern;
use ignore::WalkBuilder;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::core::path::{is_within, relative_display, resolve_under};

/// Directory names never walked.
const SKIPPED_DIRS: &[&str] = &["target", "node_modules", "build", "dist", "__pycache__"];

/// Upper bound on search results returned to a worker.
pub const MAX_SEARCH_RESULTS: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    /// Root-relative path with `/` separators.
    pub path: String,
    pub is_dir: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentMatch {
    pub path: String,
    /// 1-based line number.
    pub line: usize,
    pub text: String,
}

/// Filesystem primitives exposed to the worker, scoped to one root.
///
/// Paths are root-relative or absolute; anything resolving outside the root
/// is an error.
pub trait FileSystem: Send + Sync {
    fn root(&self) -> &Path;
    fn list(&self, dir: &str) -> Result<Vec<DirEntry>>;
    /// Read `limit` lines starting at 0-based line `offset`.
    fn read(&self, path: &str, offset: usize, limit: Option<usize>) -> Result<String>;
    fn search_by_pattern(&self, pattern: &str) -> Result<Vec<String>>;
    fn search_by_content(&self, query: &str) -> Result<Vec<ContentMatch>>;
    fn create(&self, path: &str, content: &str) -> Result<()>;
    /// Replace the single occurrence of `old` with `new`.
    fn modify(&self, path: &str, old: &str, new: &str) -> Result<()>;
    fn exists(&self, path: &str) -> bool;
}

/// [`FileSystem`] over the local disk.
#[derive(Debug, Clone)]
pub struct LocalFileSystem {
    root: PathBuf,
}

impl LocalFileSystem {
    pub fn new(root: &Path) -> Result<Self> {
        let root = root
            .canonicalize()
            .with_context(|| format!("canonicalize {}", root.display()))?;
        Ok(Self { root })
    }

    fn resolve(&self, raw: &str) -> Result<PathBuf> {
        let resolved = resolve_under(&self.root, raw);
        if !is_within(&self.root, &resolved) {
            bail!("path {raw} escapes root {}", self.root.display());
        }
        Ok(resolved)
    }

    fn walk_files(&self) -> impl Iterator<Item = PathBuf> {
        WalkBuilder::new(&self.root)
            .hidden(true)
            .git_ignore(true)
            .require_git(false)
            .filter_entry(|entry| {
                let name = entry.file_name().to_string_lossy();
                !(entry.file_type().is_some_and(|ft| ft.is_dir())
                    && SKIPPED_DIRS.contains(&name.as_ref()))
            })
            .build()
            .flatten()
            .filter(|entry| entry.file_type().is_some_and(|ft| ft.is_file()))
            .map(|entry| entry.into_path())
    }
}

impl FileSystem for LocalFileSystem {
    fn root(&self) -> &Path {
        &self.root
    }

    #[instrument(skip(self))]
    fn list(&self, dir: &str) -> Result<Vec<DirEntry>> {
        let path = self.resolve(dir)?;
        let mut entries = Vec::new();
        for entry in fs::read_dir(&path).with_context(|| format!("list {}", path.display()))? {
            let entry = entry.with_context(|| format!("read entry in {}", path.display()))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let is_dir = entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false);
            entries.push(DirEntry {
                path: relative_display(&self.root, &entry.path()),
                is_dir,
            });
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    fn read(&self, path: &str, offset: usize, limit: Option<usize>) -> Result<String> {
        let resolved = self.resolve(path)?;
        let contents = fs::read_to_string(&resolved)
            .with_context(|| format!("read {}", resolved.display()))?;
        if offset == 0 && limit.is_none() {
            return Ok(contents);
        }
        let lines = contents.lines().skip(offset);
        let selected: Vec<&str> = match limit {
            Some(limit) => lines.take(limit).collect(),
            None => lines.collect(),
        };
        Ok(selected.join("\n"))
    }

    #[instrument(skip(self))]
    fn search_by_pattern(&self, pattern: &str) -> Result<Vec<String>> {
        let glob = Pattern::new(pattern).with_context(|| format!("invalid glob {pattern}"))?;
        let mut matches: Vec<String> = self
            .walk_files()
            .map(|path| relative_display(&self.root, &path))
            .filter(|rel| glob.matches(rel))
            .collect();
        matches.sort();
        matches.truncate(MAX_SEARCH_RESULTS);
        debug!(count = matches.len(), "pattern search finished");
        Ok(matches)
    }

    #[instrument(skip(self))]
    fn search_by_content(&self, query: &str) -> Result<Vec<ContentMatch>> {
        if query.is_empty() {
            return Err(anyhow!("content query must be non-empty"));
        }
        let mut matches = Vec::new();
        for path in self.walk_files() {
            // Binary and non-UTF-8 files are skipped.
            let Ok(contents) = fs::read_to_string(&path) else {
                continue;
            };
            let rel = relative_display(&self.root, &path);
            for (idx, line) in contents.lines().enumerate() {
                if line.contains(query) {
                    matches.push(ContentMatch {
                        path: rel.clone(),
                        line: idx + 1,
                        text: line.trim().to_string(),
                    });
                }
            }
        }
        matches.sort_by(|a, b| a.path.cmp(&b.path).then(a.line.cmp(&b.line)));
        matches.truncate(MAX_SEARCH_RESULTS);
        Ok(matches)
    }

    fn create(&self, path: &str, content: &str) -> Result<()> {
        let resolved = self.resolve(path)?;
        if resolved.exists() {
            bail!("{} already exists", relative_display(&self.root, &resolved));
        }
        if let Some(parent) = resolved.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        fs::write(&resolved, content).with_context(|| format!("write {}", resolved.display()))
    }

    fn modify(&self, path: &str, old: &str, new: &str) -> Result<()> {
        let resolved = self.resolve(path)?;
        let contents = fs::read_to_string(&resolved)
            .with_context(|| format!("read {}", resolved.display()))?;
        let updated = replace_once(&contents, old, new)
            .with_context(|| format!("modify {}", relative_display(&self.root, &resolved)))?;
        fs::write(&resolved, updated).with_context(|| format!("write {}", resolved.display()))
    }

    fn exists(&self, path: &str) -> bool {
        self.resolve(path).map(|p| p.exists()).unwrap_or(false)
    }
}

/// [`FileSystem`] decorator whose writes stop for good once it is closed.
///
/// Each phase writes through its own fence. Closing it waits for an in-flight
/// write to finish, so no write lands after `close` returns.
pub struct FencedFileSystem {
    inner: Arc<dyn FileSystem>,
    state: Mutex<FenceState>,
}

struct FenceState {
    open: bool,
    written: Vec<PathBuf>,
}

impl FencedFileSystem {
    pub fn new(inner: Arc<dyn FileSystem>) -> Self {
        Self {
            inner,
            state: Mutex::new(FenceState {
                open: true,
                written: Vec::new(),
            }),
        }
    }

    /// Refuse every later write and return the paths written while open.
    pub fn close(&self) -> Vec<PathBuf> {
        let mut state = self.lock();
        state.open = false;
        std::mem::take(&mut state.written)
    }

    fn lock(&self) -> MutexGuard<'_, FenceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self, path: &str, op: impl FnOnce(&dyn FileSystem) -> Result<()>) -> Result<()> {
        let mut state = self.lock();
        if !state.open {
            bail!("write to {path} refused: the phase was aborted");
        }
        op(self.inner.as_ref())?;
        let resolved = resolve_under(self.inner.root(), path);
        if !state.written.contains(&resolved) {
            state.written.push(resolved);
        }
        Ok(())
    }
}

impl FileSystem for FencedFileSystem {
    fn root(&self) -> &Path {
        self.inner.root()
    }

    fn list(&self, dir: &str) -> Result<Vec<DirEntry>> {
        self.inner.list(dir)
    }

    fn read(&self, path: &str, offset: usize, limit: Option<usize>) -> Result<String> {
        self.inner.read(path, offset, limit)
    }

    fn search_by_pattern(&self, pattern: &str) -> Result<Vec<String>> {
        self.inner.search_by_pattern(pattern)
    }

    fn search_by_content(&self, query: &str) -> Result<Vec<ContentMatch>> {
        self.inner.search_by_content(query)
    }

    fn create(&self, path: &str, content: &str) -> Result<()> {
        self.write(path, |fs| fs.create(path, content))
    }

    fn modify(&self, path: &str, old: &str, new: &str) -> Result<()> {
        self.write(path, |fs| fs.modify(path, old, new))
    }

    fn exists(&self, path: &str) -> bool {
        self.inner.exists(path)
    }
}

/// Replace the single occurrence of `old` in `contents`.
///
/// An empty `old` is only accepted for an empty file.
pub fn replace_once(contents: &str, old: &str, new: &str) -> Result<String> {
    if old.is_empty() {
        if contents.is_empty() {
            return Ok(new.to_string());
        }
        bail!("old text is empty but the file is not");
    }
    match contents.matches(old).count() {
        0 => bail!("old text not found"),
        1 => Ok(contents.replacen(old, new, 1)),
        n => bail!("old text occurs {n} times; it must be unique"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (tempfile::TempDir, LocalFileSystem) {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        fs::create_dir_all(root.join("src/api")).expect("mkdir");
        fs::create_dir_all(root.join("target/debug")).expect("mkdir");
        fs::write(root.join("src/api/Routes.java"), "class Routes {\n  // routes\n}\n")
            .expect("write");
        fs::write(root.join("src/Main.java"), "class Main {}\n").expect("write");
        fs::write(root.join("target/debug/Routes.java"), "stale").expect("write");
        fs::write(root.join(".hidden.java"), "hidden").expect("write");
        let fs = LocalFileSystem::new(root).expect("fs");
        (temp, fs)
    }

    #[test]
    fn pattern_search_skips_build_output_and_hidden_files() {
        let (_temp, fs) = fixture();
        let found = fs.search_by_pattern("**/*.java").expect("search");
        assert_eq!(found, vec!["src/Main.java", "src/api/Routes.java"]);
    }

    #[test]
    fn pattern_search_keeps_the_first_results_in_path_order() {
        let (temp, fs) = fixture();
        for idx in (0..MAX_SEARCH_RESULTS + 5).rev() {
            fs::write(temp.path().join(format!("src/F{idx:03}.java")), "").expect("write");
        }
        let found = fs.search_by_pattern("src/F*.java").expect("search");
        assert_eq!(found.len(), MAX_SEARCH_RESULTS);
        assert_eq!(found[0], "src/F000.java");
        assert_eq!(found[MAX_SEARCH_RESULTS - 1], format!("src/F{:03}.java", MAX_SEARCH_RESULTS - 1));
    }

    #[test]
    fn closed_fence_refuses_writes_but_still_reads() {
        let (temp, local) = fixture();
        let fence = FencedFileSystem::new(Arc::new(local));
        fence.create("src/api/StatusController.java", "class StatusController {}").expect("create");
        let written = fence.close();
        assert_eq!(written, vec![fence.root().join("src/api/StatusController.java")]);

        assert!(fence.modify("src/Main.java", "class Main {}", "class Main { late(); }").is_err());
        assert!(fence.create("src/Late.java", "late").is_err());
        assert_eq!(fence.read("src/Main.java", 0, None).expect("read"), "class Main {}\n");
        assert!(!temp.path().join("src/Late.java").exists());
        assert!(fence.close().is_empty());
    }

    #[test]
    fn content_search_reports_line_numbers() {
        let (_temp, fs) = fixture();
        let found = fs.search_by_content("// routes").expect("search");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].path, "src/api/Routes.java");
        assert_eq!(found[0].line, 2);
    }

    #[test]
    fn read_honors_offset_and_limit() {
        let (_temp, fs) = fixture();
        assert_eq!(fs.read("src/api/Routes.java", 1, Some(1)).expect("read"), "  // routes");
    }

    #[test]
    fn create_refuses_existing_and_escaping_paths() {
        let (_temp, fs) = fixture();
        assert!(fs.create("src/Main.java", "x").is_err());
        assert!(fs.create("../outside.java", "x").is_err());
        fs.create("src/api/StatusController.java", "class StatusController {}")
            .expect("create");
        assert!(fs.exists("src/api/StatusController.java"));
    }

    #[test]
    fn modify_requires_unique_match() {
        let (_temp, fs) = fixture();
        fs.modify("src/api/Routes.java", "// routes", "// routes\n  status();")
            .expect("modify");
        let updated = fs.read("src/api/Routes.java", 0, None).expect("read");
        assert!(updated.contains("status();"));
        assert!(fs.modify("src/api/Routes.java", "missing", "x").is_err());
    }

    #[test]
    fn replace_once_rejects_ambiguous_old_text() {
        assert!(replace_once("a a", "a", "b").is_err());
        assert_eq!(replace_once("", "", "new").expect("empty"), "new");
        assert!(replace_once("x", "", "new").is_err());
    }

    #[test]
    fn list_returns_sorted_relative_entries() {
        let (_temp, fs) = fixture();
        let entries = fs.list("src").expect("list");
        assert_eq!(
            entries,
            vec![
                DirEntry {
                    path: "src/Main.java".to_string(),
                    is_dir: false,
                },
                DirEntry {
                    path: "src/api".to_string(),
                    is_dir: true,
                },
            ]
        );
    }
}
