//! Filesystem actions a worker may request.

use serde::{Deserialize, Serialize};


/// Kinds of actions exposed to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    List,
    Read,
    SearchByPattern,
    SearchByContent,
    Create,
    Modify,
}

impl ActionKind {
    pub const READ_ONLY: [ActionKind; 4] = [
        ActionKind::List,
        ActionKind::Read,
        ActionKind::SearchByPattern,
        ActionKind::SearchByContent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::List => "list",
            ActionKind::Read => "read",
            ActionKind::SearchByPattern => "search_by_pattern",
            ActionKind::SearchByContent => "search_by_content",
            ActionKind::Create => "create",
            ActionKind::Modify => "modify",
        }
    }

    /// True for actions that change files.
    pub fn is_write(&self) -> bool {
        matches!(self, ActionKind::Create | ActionKind::Modify)
    }
}

/// An action invocation requested by the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ActionRequest {
    List {
        path: String,
    },
    Read {
        path: String,
        #[serde(default)]
        offset: usize,
        #[serde(default)]
        limit: Option<usize>,
    },
    SearchByPattern {
        pattern: String,
    },
    SearchByContent {
        query: String,
    },
    Create {
        path: String,
        content: String,
    },
    Modify {
        path: String,
        old: String,
        new: String,
    },
}

impl ActionRequest {
    pub fn kind(&self) -> ActionKind {
        match self {
            ActionRequest::List { .. } => ActionKind::List,
            ActionRequest::Read { .. } => ActionKind::Read,
            ActionRequest::SearchByPattern { .. } => ActionKind::SearchByPattern,
            ActionRequest::SearchByContent { .. } => ActionKind::SearchByContent,
            ActionRequest::Create { .. } => ActionKind::Create,
            ActionRequest::Modify { .. } => ActionKind::Modify,
        }
    }

    /// Target path for write actions.
    pub fn write_target(&self) -> Option<&str> {
        match self {
            ActionRequest::Create { path, .. } | ActionRequest::Modify { path, .. } => Some(path),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_requests_use_tagged_json() {
        let raw = r#"{"action":"modify","path":"src/a.rs","old":"x","new":"y"}"#;
        let parsed: ActionRequest = serde_json::from_str(raw).expect("parse");
        assert_eq!(parsed.kind(), ActionKind::Modify);
        assert_eq!(parsed.write_target(), Some("src/a.rs"));
    }

    #[test]
    fn read_defaults_offset_and_limit() {
        let parsed: ActionRequest =
            serde_json::from_str(r#"{"action":"read","path":"README.md"}"#).expect("parse");
        assert_eq!(
            parsed,
            ActionRequest::Read {
                path: "README.md".to_string(),
                offset: 0,
                limit: None,
            }
        );
        assert!(!parsed.kind().is_write());
    }
}
