//! Run artifacts under `<artifacts_dir>/runs/<workflow_id>/`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::core::report::Report;
use crate::core::types::SandboxIterationRecord;
use crate::io::write_atomic;

#[derive(Debug, Clone)]
pub struct RunPaths {
    pub dir: PathBuf,
    pub report_path: PathBuf,
    pub worker_log_path: PathBuf,
}

impl RunPaths {
    pub fn new(artifacts_root: &Path, workflow_id: &str) -> Self {
        let dir = artifacts_root.join("runs").join(workflow_id);
        Self {
            report_path: dir.join("report.json"),
            worker_log_path: dir.join("worker.log"),
            dir,
        }
    }

    pub fn iteration(&self, iteration: u32) -> IterationPaths {
        let dir = self.dir.join("sandbox").join(iteration.to_string());
        IterationPaths {
            build_log_path: dir.join("build.log"),
            run_log_path: dir.join("run.log"),
            record_path: dir.join("record.json"),
            dir,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IterationPaths {
    pub dir: PathBuf,
    pub build_log_path: PathBuf,
    pub run_log_path: PathBuf,
    pub record_path: PathBuf,
}

pub fn write_report(paths: &RunPaths, report: &Report) -> Result<()> {
    write_json(&paths.report_path, report)
}

/// Persist one sandbox iteration. Records are written once and never rewritten.
pub fn write_sandbox_iteration(
    paths: &RunPaths,
    record: &SandboxIterationRecord,
    build_log: &str,
    run_log: Option<&str>,
) -> Result<IterationPaths> {
    let iteration = paths.iteration(record.iteration_number);
    write_atomic(&iteration.build_log_path, build_log.as_bytes())?;
    if let Some(log) = run_log {
        write_atomic(&iteration.run_log_path, log.as_bytes())?;
    }
    write_json(&iteration.record_path, record)?;
    Ok(iteration)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)
        .with_context(|| format!("serialize {}", path.display()))?;
    buf.push('\n');
    write_atomic(path, buf.as_bytes())
}
