//! Deterministic classification of sandbox failures.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::{ErrorClass, RepairStrategy, StepResult};

/// Maximum diagnostic lines handed to the repair agent.
pub const MAX_DIAGNOSTIC_LINES: usize = 40;

/// Where in the sandbox loop a failure surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
    Prerequisites,
    Upload,
    Build,
    Run,
    HealthCheck,
}

impl FailureStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureStage::Prerequisites => "prerequisites",
            FailureStage::Upload => "upload",
            FailureStage::Build => "build",
            FailureStage::Run => "run",
            FailureStage::HealthCheck => "health_check",
        }
    }
}

/// Log fragments that point at the environment rather than the code.
const INFRA_MARKERS: &[&str] = &[
    "No space left on device",
    "Could not resolve host",
    "Temporary failure in name resolution",
    "command not found",
    "Cannot allocate memory",
    "Permission denied",
    "Connection refused (os error 111) while downloading",
];

/// Classify a failed step.
///
/// - Timeouts are `Timeout` regardless of stage.
/// - Prerequisite and upload failures, and any log carrying an infrastructure
///   marker, are `Infrastructure`.
/// - Build failures are `CompileTime`; run and health-check failures are `Runtime`.
pub fn classify_failure(stage: FailureStage, step: &StepResult) -> ErrorClass {
    if step.timed_out {
        return ErrorClass::Timeout;
    }
    if matches!(stage, FailureStage::Prerequisites | FailureStage::Upload)
        || INFRA_MARKERS
            .iter()
            .any(|marker| step.log_tail.contains(marker))
    {
        return ErrorClass::Infrastructure;
    }
    match stage {
        FailureStage::Build => ErrorClass::CompileTime,
        _ => ErrorClass::Runtime,
    }
}

pub fn repair_strategy(class: ErrorClass) -> RepairStrategy {
    match class {
        ErrorClass::CompileTime => RepairStrategy::FixCompileErrors,
        ErrorClass::Runtime => RepairStrategy::FixRuntimeFailure,
        ErrorClass::Timeout => RepairStrategy::FixStartupStall,
        ErrorClass::Infrastructure => RepairStrategy::Unrecoverable,
    }
}

pub fn is_recoverable(class: ErrorClass) -> bool {
    repair_strategy(class) != RepairStrategy::Unrecoverable
}

/// Pull the lines most likely to explain a failure out of a log.
///
/// Falls back to the last lines of the log when nothing matches.
pub fn extract_diagnostics(log: &str) -> Vec<String> {
    static DIAGNOSTIC_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?i)(\berror\b|\bexception\b|traceback|panicked at|\bfailed\b|cannot find|undefined|not found)")
            .expect("diagnostic regex")
    });

    let matched: Vec<String> = log
        .lines()
        .filter(|line| DIAGNOSTIC_RE.is_match(line))
        .map(|line| line.trim_end().to_string())
        .take(MAX_DIAGNOSTIC_LINES)
        .collect();
    if !matched.is_empty() {
        return matched;
    }
    let lines: Vec<&str> = log.lines().collect();
    let start = lines.len().saturating_sub(MAX_DIAGNOSTIC_LINES);
    lines[start..].iter().map(|line| line.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(log: &str, timed_out: bool) -> StepResult {
        StepResult {
            success: false,
            exit_code: if timed_out { None } else { Some(1) },
            timed_out,
            duration_ms: 10,
            log_tail: log.to_string(),
        }
    }

    #[test]
    fn build_failure_is_compile_time() {
        let class = classify_failure(
            FailureStage::Build,
            &step("error[E0425]: cannot find value `x` in this scope", false),
        );
        assert_eq!(class, ErrorClass::CompileTime);
        assert_eq!(repair_strategy(class), RepairStrategy::FixCompileErrors);
    }

    #[test]
    fn run_failure_is_runtime() {
        let class = classify_failure(
            FailureStage::Run,
            &step("thread 'main' panicked at src/main.rs:3:5", false),
        );
        assert_eq!(class, ErrorClass::Runtime);
    }

    #[test]
    fn timeout_wins_over_stage() {
        assert_eq!(
            classify_failure(FailureStage::Build, &step("", true)),
            ErrorClass::Timeout
        );
        assert_eq!(
            classify_failure(FailureStage::HealthCheck, &step("", true)),
            ErrorClass::Timeout
        );
    }

    #[test]
    fn environment_markers_are_infrastructure() {
        let class = classify_failure(
            FailureStage::Build,
            &step("write /tmp/x: No space left on device", false),
        );
        assert_eq!(class, ErrorClass::Infrastructure);
        assert!(!is_recoverable(class));
        assert_eq!(
            classify_failure(FailureStage::Prerequisites, &step("", false)),
            ErrorClass::Infrastructure
        );
    }

    #[test]
    fn diagnostics_prefer_error_lines() {
        let log = "Compiling demo\nerror: expected `;`\n  --> src/main.rs:2:10\nwarning: unused";
        assert_eq!(extract_diagnostics(log), vec!["error: expected `;`".to_string()]);
    }

    #[test]
    fn diagnostics_fall_back_to_tail() {
        let log = "line one\nline two";
        assert_eq!(extract_diagnostics(log), vec!["line one", "line two"]);
    }
}
