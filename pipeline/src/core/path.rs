//! Lexical path helpers.
//!
//! Paths are resolved against the codebase root without touching the
//! filesystem: the root itself is canonicalized once when the workflow
//! starts, and everything else is normalized lexically against it.

use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

/// Extensions treated as source or config files when scanning free text.
const KNOWN_EXTENSIONS: &[&str] = &[
    "c", "cc", "cpp", "cs", "css", "ex", "exs", "go", "gradle", "h", "hpp", "html", "java", "js",
    "json", "jsx", "kt", "kts", "php", "proto", "py", "rb", "rs", "scala", "scss", "sh", "sql",
    "swift", "toml", "ts", "tsx", "vue", "xml", "yaml", "yml",
];

/// Resolve `.` and `..` components without consulting the filesystem.
///
/// `..` never climbs above the first component (root or prefix).
pub fn normalize_lexical(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let at_anchor = matches!(
                    out.components().next_back(),
                    None | Some(Component::RootDir) | Some(Component::Prefix(_))
                );
                if !at_anchor {
                    out.pop();
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Resolve a raw path (absolute, or relative to `root`) into normalized absolute form.
pub fn resolve_under(root: &Path, raw: &str) -> PathBuf {
    let cleaned = raw.trim().replace('\\', "/");
    let candidate = Path::new(&cleaned);
    if candidate.is_absolute() {
        normalize_lexical(candidate)
    } else {
        normalize_lexical(&root.join(candidate))
    }
}

/// True if `path` is `root` or lies beneath it.
pub fn is_within(root: &Path, path: &Path) -> bool {
    path.starts_with(root)
}

/// Render `path` relative to `root` with `/` separators.
///
/// Paths outside the root are rendered in full.
pub fn relative_display(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components()
        .map(|component| component.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Extract file-path mentions from free text.
///
/// A token counts as a path when it has a file extension and either contains
/// a `/` or uses a known source/config extension. URLs are ignored.
pub fn mentioned_paths(text: &str) -> Vec<String> {
    static PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?:\.{0,2}/)?(?:[A-Za-z0-9_\-.]+/)*[A-Za-z0-9_\-]+\.([A-Za-z][A-Za-z0-9]{0,7})")
            .expect("path mention regex")
    });

    let mut found: Vec<String> = Vec::new();
    for caps in PATH_RE.captures_iter(text) {
        let (Some(whole), Some(ext)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        if !has_leading_boundary(&text[..whole.start()])
            || !has_trailing_boundary(&text[whole.end()..])
        {
            continue;
        }
        let token = whole.as_str();
        let ext = ext.as_str().to_ascii_lowercase();
        if !token.contains('/') && !KNOWN_EXTENSIONS.contains(&ext.as_str()) {
            continue;
        }
        if !found.iter().any(|existing| existing == token) {
            found.push(token.to_string());
        }
    }
    found
}

fn has_leading_boundary(before: &str) -> bool {
    match before.chars().next_back() {
        None => true,
        Some(ch) => ch.is_whitespace() || "`'\"(<[".contains(ch),
    }
}

fn has_trailing_boundary(after: &str) -> bool {
    let mut chars = after.chars();
    match chars.next() {
        None => true,
        Some('.') => chars.next().is_none_or(char::is_whitespace),
        Some(ch) => ch.is_whitespace() || "`'\")]>:,;!?".contains(ch),
    }
}
