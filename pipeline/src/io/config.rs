//! Pipeline configuration stored as TOML (default `.pipeline/config.toml`).

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::types::{EnforcementMode, Phase};

/// Pipeline configuration (TOML).
///
/// Missing fields fall back to defaults so a partial file stays valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Root-relative file hints passed to impact analysis.
    pub affected_files: Vec<String>,
    /// Directory (relative to the codebase root) holding run artifacts.
    pub artifacts_dir: String,
    pub phases: PhaseTimeouts,
    pub scope: ScopeConfig,
    pub synthesis: SynthesisConfig,
    pub sandbox: SandboxConfig,
    pub worker: WorkerConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            affected_files: Vec::new(),
            artifacts_dir: ".pipeline".to_string(),
            phases: PhaseTimeouts::default(),
            scope: ScopeConfig::default(),
            synthesis: SynthesisConfig::default(),
            sandbox: SandboxConfig::default(),
            worker: WorkerConfig::default(),
        }
    }
}

/// Per-phase timeouts in seconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PhaseTimeouts {
    pub context_analysis: u64,
    pub intent_parsing: u64,
    pub impact_analysis: u64,
    pub code_synthesis: u64,
    pub execution: u64,
    pub sandbox_testing: u64,
}

impl Default for PhaseTimeouts {
    fn default() -> Self {
        Self {
            context_analysis: 60,
            intent_parsing: 5 * 60,
            impact_analysis: 60,
            code_synthesis: 20 * 60,
            execution: 60,
            sandbox_testing: 30 * 60,
        }
    }
}

impl PhaseTimeouts {
    pub fn for_phase(&self, phase: Phase) -> Duration {
        let secs = match phase {
            Phase::ContextAnalysis => self.context_analysis,
            Phase::IntentParsing => self.intent_parsing,
            Phase::ImpactAnalysis => self.impact_analysis,
            Phase::CodeSynthesis => self.code_synthesis,
            Phase::Execution => self.execution,
            Phase::SandboxTesting => self.sandbox_testing,
            Phase::Done | Phase::Failed => 0,
        };
        Duration::from_secs(secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ScopeConfig {
    pub mode: EnforcementMode,
    /// Required for `mode = "soft"`.
    pub debug: bool,
    /// Root-relative directory used when impact analysis yields nothing.
    pub default_dir: String,
    /// Additional layer directory names for sibling expansion.
    pub extra_layer_dirs: Vec<String>,
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self {
            mode: EnforcementMode::Hard,
            debug: false,
            default_dir: "src".to_string(),
            extra_layer_dirs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SynthesisConfig {
    /// Worker turns per synthesis pass.
    pub max_turns: u32,
    /// Wall-clock seconds per synthesis pass.
    pub pass_timeout_secs: u64,
    /// Prompt byte budget; droppable sections are removed beyond it.
    pub prompt_budget_bytes: usize,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            max_turns: 12,
            pass_timeout_secs: 10 * 60,
            prompt_budget_bytes: 48_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SandboxConfig {
    pub enabled: bool,
    pub max_iterations: u32,
    pub build_timeout_secs: u64,
    pub run_timeout_secs: u64,
    pub health_poll_interval_ms: u64,
    pub health_attempts: u32,
    /// Overrides the project type's readiness log pattern (regex).
    pub readiness_pattern: Option<String>,
    pub output_limit_bytes: usize,
    pub repair_max_turns: u32,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_iterations: 10,
            build_timeout_secs: 10 * 60,
            run_timeout_secs: 2 * 60,
            health_poll_interval_ms: 500,
            health_attempts: 20,
            readiness_pattern: None,
            output_limit_bytes: 100_000,
            repair_max_turns: 6,
        }
    }
}

impl SandboxConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.health_poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkerConfig {
    /// Command speaking the JSON worker protocol on stdin/stdout.
    pub command: Vec<String>,
    /// Per-turn timeout in seconds.
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: vec!["pipeline-worker".to_string()],
            timeout_secs: 5 * 60,
            output_limit_bytes: 1_000_000,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.scope.mode == EnforcementMode::Soft && !self.scope.debug {
            return Err(anyhow!(
                "scope.mode = \"soft\" requires scope.debug = true"
            ));
        }
        if self.scope.default_dir.trim().is_empty() {
            return Err(anyhow!("scope.default_dir must be non-empty"));
        }
        if Path::new(&self.scope.default_dir).is_absolute() || self.scope.default_dir.contains("..") {
            return Err(anyhow!("scope.default_dir must be a root-relative directory"));
        }
        if self.artifacts_dir.trim().is_empty() {
            return Err(anyhow!("artifacts_dir must be non-empty"));
        }
        for (name, secs) in [
            ("phases.context_analysis", self.phases.context_analysis),
            ("phases.intent_parsing", self.phases.intent_parsing),
            ("phases.impact_analysis", self.phases.impact_analysis),
            ("phases.code_synthesis", self.phases.code_synthesis),
            ("phases.execution", self.phases.execution),
            ("phases.sandbox_testing", self.phases.sandbox_testing),
        ] {
            if secs == 0 {
                return Err(anyhow!("{name} must be > 0"));
            }
        }
        if self.synthesis.max_turns == 0 {
            return Err(anyhow!("synthesis.max_turns must be > 0"));
        }
        if self.synthesis.pass_timeout_secs == 0 {
            return Err(anyhow!("synthesis.pass_timeout_secs must be > 0"));
        }
        if self.sandbox.max_iterations == 0 {
            return Err(anyhow!("sandbox.max_iterations must be > 0"));
        }
        if self.sandbox.health_poll_interval_ms == 0 || self.sandbox.health_attempts == 0 {
            return Err(anyhow!(
                "sandbox.health_poll_interval_ms and sandbox.health_attempts must be > 0"
            ));
        }
        if let Some(pattern) = &self.sandbox.readiness_pattern {
            regex::Regex::new(pattern)
                .with_context(|| format!("sandbox.readiness_pattern is not a valid regex: {pattern}"))?;
        }
        if self.sandbox.output_limit_bytes == 0 || self.worker.output_limit_bytes == 0 {
            return Err(anyhow!("output limits must be > 0"));
        }
        if self.worker.command.is_empty() || self.worker.command[0].trim().is_empty() {
            return Err(anyhow!("worker.command must be a non-empty array"));
        }
        if self.worker.timeout_secs == 0 {
            return Err(anyhow!("worker.timeout_secs must be > 0"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `PipelineConfig::default()`.
pub fn load_config(path: &Path) -> Result<PipelineConfig> {
    if !path.exists() {
        let cfg = PipelineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: PipelineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &PipelineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    crate::io::write_atomic(path, buf.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, PipelineConfig::default());
        assert_eq!(cfg.scope.mode, EnforcementMode::Hard);
        assert_eq!(cfg.sandbox.max_iterations, 10);
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let mut cfg = PipelineConfig::default();
        cfg.sandbox.readiness_pattern = Some("Started .* in".to_string());
        cfg.affected_files = vec!["src/api/Routes.java".to_string()];
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_uses_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "[sandbox]\nenabled = true\nmax_iterations = 3\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert!(cfg.sandbox.enabled);
        assert_eq!(cfg.sandbox.max_iterations, 3);
        assert_eq!(cfg.phases, PhaseTimeouts::default());
    }

    #[test]
    fn soft_mode_requires_debug() {
        let mut cfg = PipelineConfig::default();
        cfg.scope.mode = EnforcementMode::Soft;
        let err = cfg.validate().expect_err("soft without debug");
        assert!(err.to_string().contains("scope.debug"));
        cfg.scope.debug = true;
        cfg.validate().expect("soft with debug");
    }

    #[test]
    fn zero_phase_timeout_is_rejected() {
        let mut cfg = PipelineConfig::default();
        cfg.phases.execution = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn invalid_readiness_pattern_is_rejected() {
        let mut cfg = PipelineConfig::default();
        cfg.sandbox.readiness_pattern = Some("([".to_string());
        assert!(cfg.validate().is_err());
    }
}
