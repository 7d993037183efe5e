//! LLM worker abstraction.
//!
//! The [`Worker`] trait decouples the pipeline from the model backend. A
//! worker receives the whole conversation plus the actions it may request,
//! and returns either more action requests or a terminal reply. Tests use
//! scripted workers that replay predetermined replies.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::core::actions::{ActionKind, ActionRequest};
use crate::io::process::run_command;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    /// Results and denials for previously requested actions.
    Tool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub conversation: Vec<Message>,
    /// Actions the worker may request this turn; anything else is denied.
    pub available_actions: Vec<ActionKind>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerReply {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub actions: Vec<ActionRequest>,
    /// True when the worker considers the task complete.
    #[serde(default)]
    pub finished: bool,
    /// Structured result attached to a terminal reply.
    #[serde(default)]
    pub output: Option<Value>,
}

impl WorkerReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn finished(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            finished: true,
            ..Self::default()
        }
    }

    pub fn with_actions(mut self, actions: Vec<ActionRequest>) -> Self {
        self.actions = actions;
        self
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }
}

/// Abstraction over LLM worker backends.
pub trait Worker: Send + Sync {
    fn respond(&self, request: &WorkerRequest) -> Result<WorkerReply>;
}

/// Worker backed by an external command speaking JSON on stdin/stdout.
///
/// Each turn spawns the command, writes the [`WorkerRequest`] as JSON to its
/// stdin and parses a [`WorkerReply`] from its stdout.
#[derive(Debug, Clone)]
pub struct CommandWorker {
    pub command: Vec<String>,
    pub workdir: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    /// Transcript of every turn's stdout/stderr, appended.
    pub log_path: Option<PathBuf>,
}

impl Worker for CommandWorker {
    #[instrument(skip_all, fields(turn_messages = request.conversation.len(), timeout_secs = self.timeout.as_secs()))]
    fn respond(&self, request: &WorkerRequest) -> Result<WorkerReply> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("worker command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&self.workdir);

        let input = serde_json::to_vec(request).context("serialize worker request")?;
        let output = run_command(
            cmd,
            Some(&input),
            self.timeout,
            self.output_limit_bytes,
            self.log_path.as_deref(),
        )
        .context("run worker command")?;

        if output.timed_out {
            warn!(timeout_secs = self.timeout.as_secs(), "worker timed out");
            return Err(anyhow!("worker timed out after {:?}", self.timeout));
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "worker failed");
            return Err(anyhow!(
                "worker exited with status {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let reply = parse_reply(&stdout)?;
        debug!(
            actions = reply.actions.len(),
            finished = reply.finished,
            "worker replied"
        );
        Ok(reply)
    }
}

/// Parse a reply from the whole of stdout, or else from its last JSON line.
pub fn parse_reply(stdout: &str) -> Result<WorkerReply> {
    let trimmed = stdout.trim();
    if let Ok(reply) = serde_json::from_str::<WorkerReply>(trimmed) {
        return Ok(reply);
    }
    trimmed
        .lines()
        .rev()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .find_map(|line| serde_json::from_str::<WorkerReply>(line).ok())
        .ok_or_else(|| anyhow!("worker stdout is not a JSON reply"))
}
