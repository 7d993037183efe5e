//! Isolated execution sandbox.
//!
//! The [`Sandbox`] trait is the contract the test-repair loop drives;
//! [`LocalSandbox`] implements it with a temporary directory per session and
//! local child processes. Sessions are acquired through [`SandboxSession`],
//! which terminates them on every exit path.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::net::{SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use ignore::WalkBuilder;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tracing::{debug, info, instrument, warn};

use crate::core::path::{is_within, relative_display, resolve_under};
use crate::io::process::{open_append, run_command, tail};

/// Directory names never uploaded.
const UPLOAD_SKIPPED_DIRS: &[&str] = &["target", "node_modules", "build", "dist", ".pipeline"];

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionHandle {
    pub id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackgroundProcess {
    pub id: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Exited(Option<i32>),
}

/// Log bytes appended since a previous read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogChunk {
    pub text: String,
    /// Offset to pass to the next `read_log` call.
    pub next_offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub exit_code: Option<i32>,
    pub success: bool,
    pub timed_out: bool,
    pub duration_ms: u64,
    /// Combined stdout/stderr, bounded.
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFile {
    /// Workspace-relative path with `/` separators.
    pub path: String,
    pub contents: Vec<u8>,
}

pub trait Sandbox: Send + Sync {
    fn create_session(&self) -> Result<SessionHandle>;
    fn upload(&self, session: &SessionHandle, files: &[UploadFile]) -> Result<()>;
    /// Run a command to completion in the session workspace.
    fn run(&self, session: &SessionHandle, command: &[String], timeout: Duration)
    -> Result<CommandResult>;
    /// Start a command in the background, logging its output.
    fn spawn(&self, session: &SessionHandle, command: &[String]) -> Result<BackgroundProcess>;
    fn is_running(&self, session: &SessionHandle, process: BackgroundProcess)
    -> Result<ProcessState>;
    fn port_open(&self, session: &SessionHandle, port: u16) -> Result<bool>;
    /// Log output of `process` from byte `offset` onwards.
    fn read_log(
        &self,
        session: &SessionHandle,
        process: BackgroundProcess,
        offset: u64,
    ) -> Result<LogChunk>;
    fn stop(&self, session: &SessionHandle, process: BackgroundProcess) -> Result<()>;
    fn read_file(&self, session: &SessionHandle, path: &str) -> Result<String>;
    fn write_file(&self, session: &SessionHandle, path: &str, contents: &str) -> Result<()>;
    fn public_endpoint(&self, session: &SessionHandle, port: u16) -> Result<String>;
    fn terminate_session(&self, session: &SessionHandle) -> Result<()>;
}

/// Scoped sandbox session; terminated on drop unless closed explicitly.
pub struct SandboxSession<'a> {
    sandbox: &'a dyn Sandbox,
    handle: SessionHandle,
    closed: bool,
}

impl<'a> SandboxSession<'a> {
    pub fn open(sandbox: &'a dyn Sandbox) -> Result<Self> {
        let handle = sandbox.create_session().context("create sandbox session")?;
        info!(session = %handle.id, "sandbox session opened");
        Ok(Self {
            sandbox,
            handle,
            closed: false,
        })
    }

    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    pub fn sandbox(&self) -> &'a dyn Sandbox {
        self.sandbox
    }

    /// Terminate the session, surfacing teardown errors.
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        info!(session = %self.handle.id, "sandbox session closing");
        self.sandbox.terminate_session(&self.handle)
    }
}

impl Drop for SandboxSession<'_> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        warn!(session = %self.handle.id, "sandbox session dropped without close; terminating");
        if let Err(err) = self.sandbox.terminate_session(&self.handle) {
            warn!(session = %self.handle.id, err = %err, "sandbox teardown failed");
        }
    }
}

/// Collect files under `root` for upload, skipping hidden and build output.
pub fn collect_upload(root: &Path) -> Result<Vec<UploadFile>> {
    let mut files = Vec::new();
    let walker = WalkBuilder::new(root)
        .hidden(true)
        .git_ignore(true)
        .require_git(false)
        .filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            !UPLOAD_SKIPPED_DIRS.contains(&name.as_ref())
        })
        .build();
    for entry in walker.flatten() {
        if !entry.file_type().is_some_and(|ft| ft.is_file()) {
            continue;
        }
        let path = entry.path();
        let contents = fs::read(path).with_context(|| format!("read {}", path.display()))?;
        files.push(UploadFile {
            path: relative_display(root, path),
            contents,
        });
    }
    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}

struct LocalProcess {
    child: Child,
    log_path: PathBuf,
}

struct LocalSession {
    dir: TempDir,
    processes: Vec<LocalProcess>,
}

impl LocalSession {
    fn workspace(&self) -> PathBuf {
        self.dir.path().join("work")
    }

    fn logs(&self) -> PathBuf {
        self.dir.path().join("logs")
    }
}

/// [`Sandbox`] using a temporary directory and local child processes.
pub struct LocalSandbox {
    output_limit_bytes: usize,
    sessions: Mutex<HashMap<String, LocalSession>>,
}

impl LocalSandbox {
    pub fn new(output_limit_bytes: usize) -> Self {
        Self {
            output_limit_bytes,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn with_session<T>(
        &self,
        session: &SessionHandle,
        f: impl FnOnce(&mut LocalSession) -> Result<T>,
    ) -> Result<T> {
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|_| anyhow!("sandbox session table poisoned"))?;
        let local = sessions
            .get_mut(&session.id)
            .ok_or_else(|| anyhow!("unknown sandbox session {}", session.id))?;
        f(local)
    }

    fn workspace_path(&self, session: &SessionHandle, raw: &str) -> Result<PathBuf> {
        let workspace = self.with_session(session, |local| Ok(local.workspace()))?;
        let resolved = resolve_under(&workspace, raw);
        if !is_within(&workspace, &resolved) || resolved == workspace {
            bail!("path {raw} escapes the sandbox workspace");
        }
        Ok(resolved)
    }
}

fn command_for(command: &[String], workdir: &Path) -> Result<Command> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| anyhow!("sandbox command is empty"))?;
    let mut cmd = Command::new(program);
    cmd.args(args).current_dir(workdir);
    Ok(cmd)
}

impl Sandbox for LocalSandbox {
    fn create_session(&self) -> Result<SessionHandle> {
        let dir = tempfile::Builder::new()
            .prefix("pipeline-sandbox-")
            .tempdir()
            .context("create sandbox directory")?;
        fs::create_dir_all(dir.path().join("work")).context("create sandbox workspace")?;
        fs::create_dir_all(dir.path().join("logs")).context("create sandbox logs")?;
        let handle = SessionHandle {
            id: uuid::Uuid::new_v4().to_string(),
        };
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|_| anyhow!("sandbox session table poisoned"))?;
        sessions.insert(
            handle.id.clone(),
            LocalSession {
                dir,
                processes: Vec::new(),
            },
        );
        Ok(handle)
    }

    #[instrument(skip_all, fields(session = %session.id, files = files.len()))]
    fn upload(&self, session: &SessionHandle, files: &[UploadFile]) -> Result<()> {
        for file in files {
            let target = self.workspace_path(session, &file.path)?;
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create {}", parent.display()))?;
            }
            fs::write(&target, &file.contents)
                .with_context(|| format!("upload {}", file.path))?;
        }
        Ok(())
    }

    #[instrument(skip_all, fields(session = %session.id, command = %command.join(" ")))]
    fn run(
        &self,
        session: &SessionHandle,
        command: &[String],
        timeout: Duration,
    ) -> Result<CommandResult> {
        let (workspace, log_path) =
            self.with_session(session, |local| Ok((local.workspace(), local.logs().join("commands.log"))))?;
        let cmd = command_for(command, &workspace)?;
        let started = Instant::now();
        let output = run_command(cmd, None, timeout, self.output_limit_bytes, Some(&log_path))?;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        debug!(exit_code = ?output.status.code(), timed_out = output.timed_out, duration_ms, "sandbox command finished");
        Ok(CommandResult {
            exit_code: output.status.code(),
            success: output.success(),
            timed_out: output.timed_out,
            duration_ms,
            output: tail(&output.combined_text(), self.output_limit_bytes),
        })
    }

    #[instrument(skip_all, fields(session = %session.id, command = %command.join(" ")))]
    fn spawn(&self, session: &SessionHandle, command: &[String]) -> Result<BackgroundProcess> {
        self.with_session(session, |local| {
            let id = local.processes.len();
            let log_path = local.logs().join(format!("process-{id}.log"));
            let log = open_append(&log_path)?;
            let err_log = log.try_clone().context("clone process log handle")?;
            let mut cmd = command_for(command, &local.workspace())?;
            cmd.stdin(Stdio::null())
                .stdout(Stdio::from(log))
                .stderr(Stdio::from(err_log));
            let child = cmd.spawn().context("spawn background process")?;
            local.processes.push(LocalProcess { child, log_path });
            Ok(BackgroundProcess { id })
        })
    }

    fn is_running(
        &self,
        session: &SessionHandle,
        process: BackgroundProcess,
    ) -> Result<ProcessState> {
        self.with_session(session, |local| {
            let proc = local
                .processes
                .get_mut(process.id)
                .ok_or_else(|| anyhow!("unknown process {}", process.id))?;
            match proc.child.try_wait().context("poll background process")? {
                Some(status) => Ok(ProcessState::Exited(status.code())),
                None => Ok(ProcessState::Running),
            }
        })
    }

    fn port_open(&self, _session: &SessionHandle, port: u16) -> Result<bool> {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        Ok(TcpStream::connect_timeout(&addr, Duration::from_millis(200)).is_ok())
    }

    fn read_log(
        &self,
        session: &SessionHandle,
        process: BackgroundProcess,
        offset: u64,
    ) -> Result<LogChunk> {
        let log_path = self.with_session(session, |local| {
            local
                .processes
                .get(process.id)
                .map(|proc| proc.log_path.clone())
                .ok_or_else(|| anyhow!("unknown process {}", process.id))
        })?;
        let mut file =
            File::open(&log_path).with_context(|| format!("open {}", log_path.display()))?;
        file.seek(SeekFrom::Start(offset)).context("seek process log")?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes).context("read process log")?;
        Ok(LogChunk {
            text: String::from_utf8_lossy(&bytes).into_owned(),
            next_offset: offset + bytes.len() as u64,
        })
    }

    fn stop(&self, session: &SessionHandle, process: BackgroundProcess) -> Result<()> {
        self.with_session(session, |local| {
            let proc = local
                .processes
                .get_mut(process.id)
                .ok_or_else(|| anyhow!("unknown process {}", process.id))?;
            if proc.child.try_wait().context("poll background process")?.is_none() {
                proc.child.kill().context("kill background process")?;
                proc.child.wait().context("reap background process")?;
            }
            Ok(())
        })
    }

    fn read_file(&self, session: &SessionHandle, path: &str) -> Result<String> {
        let target = self.workspace_path(session, path)?;
        fs::read_to_string(&target).with_context(|| format!("read sandbox file {path}"))
    }

    fn write_file(&self, session: &SessionHandle, path: &str, contents: &str) -> Result<()> {
        let target = self.workspace_path(session, path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(&target, contents).with_context(|| format!("write sandbox file {path}"))
    }

    fn public_endpoint(&self, _session: &SessionHandle, port: u16) -> Result<String> {
        Ok(format!("http://127.0.0.1:{port}"))
    }

    #[instrument(skip_all, fields(session = %session.id))]
    fn terminate_session(&self, session: &SessionHandle) -> Result<()> {
        let removed = self
            .sessions
            .lock()
            .map_err(|_| anyhow!("sandbox session table poisoned"))?
            .remove(&session.id);
        let Some(mut local) = removed else {
            return Ok(());
        };
        for proc in &mut local.processes {
            if matches!(proc.child.try_wait(), Ok(None)) {
                if let Err(err) = proc.child.kill() {
                    warn!(err = %err, "failed to kill background process");
                }
                let _ = proc.child.wait();
            }
        }
        local
            .dir
            .close()
            .context("remove sandbox directory")?;
        info!("sandbox session terminated");
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[test]
    fn run_executes_in_uploaded_workspace() {
        let sandbox = LocalSandbox::new(10_000);
        let session = sandbox.create_session().expect("session");
        sandbox
            .upload(
                &session,
                &[UploadFile {
                    path: "src/main.txt".to_string(),
                    contents: b"hello".to_vec(),
                }],
            )
            .expect("upload");
        let result = sandbox
            .run(&session, &sh("cat src/main.txt"), Duration::from_secs(10))
            .expect("run");
        assert!(result.success);
        assert_eq!(result.output, "hello");
        sandbox.terminate_session(&session).expect("terminate");
    }

    #[test]
    fn read_log_returns_only_new_output() {
        let sandbox = LocalSandbox::new(10_000);
        let session = sandbox.create_session().expect("session");
        let process = sandbox
            .spawn(&session, &sh("echo first; sleep 0.3; echo second"))
            .expect("spawn");

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut offset = 0;
        let mut seen = String::new();
        while Instant::now() < deadline {
            let chunk = sandbox.read_log(&session, process, offset).expect("read log");
            assert!(chunk.next_offset >= offset);
            offset = chunk.next_offset;
            seen.push_str(&chunk.text);
            if seen.contains("second") {
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        assert_eq!(seen, "first\nsecond\n");
        sandbox.terminate_session(&session).expect("terminate");
    }

    #[test]
    fn writes_cannot_escape_workspace() {
        let sandbox = LocalSandbox::new(10_000);
        let session = sandbox.create_session().expect("session");
        assert!(sandbox.write_file(&session, "../escape.txt", "x").is_err());
        sandbox
            .write_file(&session, "src/a.txt", "a")
            .expect("write");
        assert_eq!(sandbox.read_file(&session, "src/a.txt").expect("read"), "a");
        sandbox.terminate_session(&session).expect("terminate");
    }

    #[test]
    fn dropped_guard_terminates_session() {
        let sandbox = LocalSandbox::new(10_000);
        let id = {
            let session = SandboxSession::open(&sandbox).expect("open");
            session.handle().id.clone()
        };
        let handle = SessionHandle { id };
        assert!(sandbox.read_file(&handle, "anything").is_err());
        assert!(sandbox.sessions.lock().expect("lock").is_empty());
    }

    #[test]
    fn collect_upload_skips_build_output() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("target")).expect("mkdir");
        fs::write(temp.path().join("target/out.bin"), "x").expect("write");
        fs::write(temp.path().join("Cargo.toml"), "[package]").expect("write");
        let files = collect_upload(temp.path()).expect("collect");
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, "Cargo.toml");
    }
}
