//! Scripted collaborators and fixtures for unit and integration tests.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use tempfile::TempDir;

use crate::core::types::{LayerConvention, ProjectContext};
use crate::io::detect::{ContextDetector, SandboxProfile};
use crate::io::sandbox::{
    BackgroundProcess, CommandResult, LogChunk, ProcessState, Sandbox, SessionHandle, UploadFile,
};
use crate::io::worker::{Worker, WorkerReply, WorkerRequest};

/// Worker that replays canned replies and records every request.
///
/// Once the script runs out it answers with an empty finished reply, or
/// repeats its fallback reply when built with [`ScriptedWorker::repeating`].
pub struct ScriptedWorker {
    replies: Mutex<VecDeque<WorkerReply>>,
    fallback: WorkerReply,
    /// Sleep applied to every request after the first `n`.
    delay: Option<(usize, Duration)>,
    requests: Mutex<Vec<WorkerRequest>>,
}

impl ScriptedWorker {
    pub fn new(replies: Vec<WorkerReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            fallback: WorkerReply::finished(""),
            delay: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn repeating(reply: WorkerReply) -> Self {
        Self {
            fallback: reply,
            ..Self::new(Vec::new())
        }
    }

    /// Reply used once the script is exhausted.
    pub fn with_fallback(mut self, reply: WorkerReply) -> Self {
        self.fallback = reply;
        self
    }

    /// Sleep before every reply.
    pub fn with_delay(self, delay: Duration) -> Self {
        self.with_delay_after(0, delay)
    }

    /// Answer the first `prompt_replies` requests at once, then sleep before each reply.
    pub fn with_delay_after(mut self, prompt_replies: usize, delay: Duration) -> Self {
        self.delay = Some((prompt_replies, delay));
        self
    }

    pub fn requests(&self) -> Vec<WorkerRequest> {
        self.requests.lock().expect("requests lock").clone()
    }
}

impl Worker for ScriptedWorker {
    fn respond(&self, request: &WorkerRequest) -> Result<WorkerReply> {
        let seen = {
            let mut requests = self
                .requests
                .lock()
                .map_err(|_| anyhow!("requests lock poisoned"))?;
            requests.push(request.clone());
            requests.len()
        };
        if let Some((prompt_replies, delay)) = self.delay {
            if seen > prompt_replies {
                thread::sleep(delay);
            }
        }
        let next = self
            .replies
            .lock()
            .map_err(|_| anyhow!("replies lock poisoned"))?
            .pop_front();
        Ok(next.unwrap_or_else(|| self.fallback.clone()))
    }
}

/// Detector returning a fixed context and profile.
pub struct FakeDetector {
    pub context: ProjectContext,
    pub profile: Option<SandboxProfile>,
}

impl FakeDetector {
    pub fn java() -> Self {
        Self {
            context: java_context(),
            profile: Some(java_profile()),
        }
    }

    /// Context without a project type; the sandbox never applies.
    pub fn unknown() -> Self {
        Self {
            context: ProjectContext {
                structure_summary: "src/".to_string(),
                ..ProjectContext::default()
            },
            profile: None,
        }
    }
}

impl ContextDetector for FakeDetector {
    fn detect(&self, _root: &Path) -> Result<ProjectContext> {
        Ok(self.context.clone())
    }

    fn sandbox_profile(&self, project_type: &str) -> Option<SandboxProfile> {
        (self.context.project_type.as_deref() == Some(project_type))
            .then(|| self.profile.clone())
            .flatten()
    }
}

pub fn java_context() -> ProjectContext {
    ProjectContext {
        structure_summary: "pom.xml\nsrc/api/\nsrc/service/".to_string(),
        framework_id: Some("spring-boot".to_string()),
        project_type: Some("maven".to_string()),
        primary_extension: Some("java".to_string()),
        layer_conventions: vec![
            LayerConvention {
                layer: "controller".to_string(),
                directories: vec!["controller".to_string(), "api".to_string()],
                file_suffix: Some("Controller".to_string()),
            },
            LayerConvention {
                layer: "service".to_string(),
                directories: vec!["service".to_string()],
                file_suffix: Some("Service".to_string()),
            },
        ],
    }
}

pub fn java_profile() -> SandboxProfile {
    SandboxProfile {
        prerequisites: Vec::new(),
        build: vec!["mvn".to_string(), "-q".to_string(), "package".to_string()],
        run: vec!["java".to_string(), "-jar".to_string(), "target/app.jar".to_string()],
        readiness_pattern: Some("Started \\w+".to_string()),
        port: None,
    }
}

/// Behavior of one started artifact in [`ScriptedSandbox`].
#[derive(Debug, Clone)]
pub struct RunScript {
    /// `None` keeps the process running.
    pub exit: Option<i32>,
    pub log: String,
    pub port_open: bool,
}

impl RunScript {
    /// Stays up and prints `log`.
    pub fn serving(log: &str) -> Self {
        Self {
            exit: None,
            log: log.to_string(),
            port_open: true,
        }
    }

    /// Exits with status 1 after printing `log`.
    pub fn crashing(log: &str) -> Self {
        Self {
            exit: Some(1),
            log: log.to_string(),
            port_open: false,
        }
    }
}

#[derive(Default)]
struct SandboxRecord {
    opened: usize,
    terminated: usize,
    uploaded: usize,
    commands: Vec<Vec<String>>,
    writes: Vec<(String, String)>,
    started: Vec<RunScript>,
}

/// Sandbox that replays scripted build results and run behaviors.
///
/// Every `run` call consumes the next build result (success once the script
/// is exhausted); every `spawn` consumes the next run script (a ready server
/// once exhausted).
#[derive(Default)]
pub struct ScriptedSandbox {
    builds: Mutex<VecDeque<CommandResult>>,
    runs: Mutex<VecDeque<RunScript>>,
    fail_sessions: bool,
    record: Mutex<SandboxRecord>,
}

impl ScriptedSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builds(self, builds: Vec<CommandResult>) -> Self {
        *self.builds.lock().expect("builds lock") = builds.into();
        self
    }

    pub fn with_runs(self, runs: Vec<RunScript>) -> Self {
        *self.runs.lock().expect("runs lock") = runs.into();
        self
    }

    pub fn failing_sessions(mut self) -> Self {
        self.fail_sessions = true;
        self
    }

    pub fn build_ok() -> CommandResult {
        CommandResult {
            exit_code: Some(0),
            success: true,
            timed_out: false,
            duration_ms: 1,
            output: "BUILD SUCCESS".to_string(),
        }
    }

    pub fn build_failed(log: &str) -> CommandResult {
        CommandResult {
            exit_code: Some(1),
            success: false,
            timed_out: false,
            duration_ms: 1,
            output: log.to_string(),
        }
    }

    pub fn sessions_opened(&self) -> usize {
        self.record.lock().expect("record lock").opened
    }

    pub fn sessions_terminated(&self) -> usize {
        self.record.lock().expect("record lock").terminated
    }

    pub fn uploaded_files(&self) -> usize {
        self.record.lock().expect("record lock").uploaded
    }

    pub fn commands(&self) -> Vec<Vec<String>> {
        self.record.lock().expect("record lock").commands.clone()
    }

    /// `(path, contents)` written into the session, in order.
    pub fn writes(&self) -> Vec<(String, String)> {
        self.record.lock().expect("record lock").writes.clone()
    }

    fn with_record<T>(&self, f: impl FnOnce(&mut SandboxRecord) -> T) -> Result<T> {
        let mut record = self
            .record
            .lock()
            .map_err(|_| anyhow!("sandbox record poisoned"))?;
        Ok(f(&mut record))
    }

    fn script(&self, process: BackgroundProcess) -> Result<RunScript> {
        self.with_record(|record| record.started.get(process.id).cloned())?
            .ok_or_else(|| anyhow!("unknown process {}", process.id))
    }
}

impl Sandbox for ScriptedSandbox {
    fn create_session(&self) -> Result<SessionHandle> {
        if self.fail_sessions {
            bail!("sandbox service unavailable");
        }
        let opened = self.with_record(|record| {
            record.opened += 1;
            record.opened
        })?;
        Ok(SessionHandle {
            id: format!("scripted-{opened}"),
        })
    }

    fn upload(&self, _session: &SessionHandle, files: &[UploadFile]) -> Result<()> {
        self.with_record(|record| record.uploaded += files.len())
    }

    fn run(&self, _session: &SessionHandle, command: &[String], _timeout: Duration) -> Result<CommandResult> {
        self.with_record(|record| record.commands.push(command.to_vec()))?;
        let next = self
            .builds
            .lock()
            .map_err(|_| anyhow!("builds lock poisoned"))?
            .pop_front();
        Ok(next.unwrap_or_else(Self::build_ok))
    }

    fn spawn(&self, _session: &SessionHandle, command: &[String]) -> Result<BackgroundProcess> {
        let script = self
            .runs
            .lock()
            .map_err(|_| anyhow!("runs lock poisoned"))?
            .pop_front()
            .unwrap_or_else(|| RunScript::serving("Started Application\n"));
        self.with_record(|record| {
            record.commands.push(command.to_vec());
            record.started.push(script);
            BackgroundProcess {
                id: record.started.len() - 1,
            }
        })
    }

    fn is_running(&self, _session: &SessionHandle, process: BackgroundProcess) -> Result<ProcessState> {
        Ok(match self.script(process)?.exit {
            Some(code) => ProcessState::Exited(Some(code)),
            None => ProcessState::Running,
        })
    }

    fn port_open(&self, _session: &SessionHandle, _port: u16) -> Result<bool> {
        let record = self.record.lock().map_err(|_| anyhow!("sandbox record poisoned"))?;
        Ok(record.started.last().is_some_and(|script| script.port_open))
    }

    fn read_log(&self, _session: &SessionHandle, process: BackgroundProcess, offset: u64) -> Result<LogChunk> {
        let log = self.script(process)?.log;
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(log.len());
        Ok(LogChunk {
            text: log[start..].to_string(),
            next_offset: log.len() as u64,
        })
    }

    fn stop(&self, _session: &SessionHandle, _process: BackgroundProcess) -> Result<()> {
        Ok(())
    }

    fn read_file(&self, _session: &SessionHandle, path: &str) -> Result<String> {
        self.with_record(|record| {
            record
                .writes
                .iter()
                .rev()
                .find(|(written, _)| written == path)
                .map(|(_, contents)| contents.clone())
        })?
        .ok_or_else(|| anyhow!("{path} not found in sandbox"))
    }

    fn write_file(&self, _session: &SessionHandle, path: &str, contents: &str) -> Result<()> {
        self.with_record(|record| record.writes.push((path.to_string(), contents.to_string())))
    }

    fn public_endpoint(&self, session: &SessionHandle, port: u16) -> Result<String> {
        Ok(format!("https://{}.sandbox.test:{port}", session.id))
    }

    fn terminate_session(&self, _session: &SessionHandle) -> Result<()> {
        self.with_record(|record| record.terminated += 1)
    }
}

/// Small Maven-style service in a temporary directory.
pub struct TestCodebase {
    dir: TempDir,
}

pub const ROUTES_JAVA: &str = "package api;

public class Routes {
    public void register() {
        // routes
    }
}
";

impl TestCodebase {
    pub fn java_service() -> Self {
        let codebase = Self {
            dir: tempfile::tempdir().expect("tempdir"),
        };
        codebase.write(
            "pom.xml",
            "<project>\n  <artifactId>demo</artifactId>\n  <dependency>spring-boot-starter-web</dependency>\n</project>\n",
        );
        codebase.write("README.md", "# Demo service\n");
        codebase.write("src/api/Routes.java", ROUTES_JAVA);
        codebase.write(
            "src/api/UserController.java",
            "package api;\n\npublic class UserController {\n    public String list() {\n        return \"[]\";\n    }\n}\n",
        );
        codebase.write(
            "src/service/UserService.java",
            "package service;\n\npublic class UserService {\n}\n",
        );
        codebase
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    pub fn write(&self, rel: &str, contents: &str) {
        let path = self.path(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create fixture dir");
        }
        fs::write(&path, contents).expect("write fixture file");
    }

    pub fn read(&self, rel: &str) -> String {
        fs::read_to_string(self.path(rel)).expect("read fixture file")
    }
}
