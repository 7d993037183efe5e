//! Feature-implementation pipeline CLI.
//!
//! `run` carries one feature request through the phase pipeline against a
//! local codebase and prints the report JSON; the exit code follows the
//! verdict. `detect` prints the detected project context. `init-config`
//! writes a default `.pipeline/config.toml`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use feature_pipeline::core::types::EnforcementMode;
use feature_pipeline::exit_codes;
use feature_pipeline::io::artifacts::RunPaths;
use feature_pipeline::io::config::{PipelineConfig, load_config, write_config};
use feature_pipeline::io::detect::{ContextDetector, RegistryDetector};
use feature_pipeline::io::fs::LocalFileSystem;
use feature_pipeline::io::sandbox::LocalSandbox;
use feature_pipeline::io::worker::CommandWorker;
use feature_pipeline::logging;
use feature_pipeline::orchestrator::{
    CancelFlag, Collaborators, WorkflowRequest, artifacts_root, run_workflow,
};
use serde::Serialize;

const CONFIG_PATH: &str = ".pipeline/config.toml";

#[derive(Parser)]
#[command(
    name = "feature-pipeline",
    version,
    about = "Scope-enforced feature implementation pipeline"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Implement a feature request against a codebase and print the report.
    Run(RunArgs),
    /// Print the detected project context and sandbox profile.
    Detect {
        #[arg(long, default_value = ".")]
        root: PathBuf,
    },
    /// Write `.pipeline/config.toml` with default values.
    InitConfig {
        #[arg(long, default_value = ".")]
        root: PathBuf,
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(clap::Args)]
struct RunArgs {
    /// Natural-language feature request.
    #[arg(long)]
    request: String,
    /// Codebase root.
    #[arg(long, default_value = ".")]
    root: PathBuf,
    /// Config file; defaults to `<root>/.pipeline/config.toml`.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Run the sandbox test-repair loop.
    #[arg(long)]
    sandbox: bool,
    #[arg(long, value_enum)]
    mode: Option<ModeArg>,
    /// Required for `--mode soft`.
    #[arg(long)]
    debug_scope: bool,
    #[arg(long)]
    max_iterations: Option<u32>,
    /// Affected-file hint, repeatable.
    #[arg(long = "affected-file")]
    affected_files: Vec<String>,
    #[arg(long)]
    workflow_id: Option<String>,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Hard,
    Soft,
}

impl From<ModeArg> for EnforcementMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Hard => EnforcementMode::Hard,
            ModeArg::Soft => EnforcementMode::Soft,
        }
    }
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => cmd_run(args),
        Command::Detect { root } => cmd_detect(&root),
        Command::InitConfig { root, force } => cmd_init_config(&root, force),
    }
}

fn cmd_run(args: RunArgs) -> Result<i32> {
    if args.request.trim().is_empty() {
        bail!("--request must not be empty");
    }
    let root = canonical_dir(&args.root)?;
    let config_path = args.config.clone().unwrap_or_else(|| root.join(CONFIG_PATH));
    let config = apply_overrides(load_config(&config_path)?, &args)?;

    let workflow_id = args
        .workflow_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let paths = RunPaths::new(&artifacts_root(&root, &config.artifacts_dir), &workflow_id);

    let collaborators = Collaborators {
        detector: Arc::new(RegistryDetector::default()),
        worker: Arc::new(CommandWorker {
            command: config.worker.command.clone(),
            workdir: root.clone(),
            timeout: Duration::from_secs(config.worker.timeout_secs),
            output_limit_bytes: config.worker.output_limit_bytes,
            log_path: Some(paths.worker_log_path.clone()),
        }),
        sandbox: Arc::new(LocalSandbox::new(config.sandbox.output_limit_bytes)),
        fs: Arc::new(LocalFileSystem::new(&root)?),
    };
    let request = WorkflowRequest {
        feature_request: args.request,
        affected_files: args.affected_files,
        workflow_id: Some(workflow_id),
    };

    let report = run_workflow(&collaborators, &config, &request, &CancelFlag::new());
    print_json(&report)?;
    Ok(exit_codes::for_verdict(report.verdict))
}

fn apply_overrides(mut config: PipelineConfig, args: &RunArgs) -> Result<PipelineConfig> {
    if args.sandbox {
        config.sandbox.enabled = true;
    }
    if let Some(mode) = args.mode {
        config.scope.mode = mode.into();
    }
    if args.debug_scope {
        config.scope.debug = true;
    }
    if let Some(max) = args.max_iterations {
        config.sandbox.max_iterations = max;
    }
    config.validate().context("invalid configuration after CLI overrides")?;
    Ok(config)
}

#[derive(Serialize)]
struct DetectOutput<'a> {
    context: &'a feature_pipeline::core::types::ProjectContext,
    sandbox_profile: Option<feature_pipeline::io::detect::SandboxProfile>,
}

fn cmd_detect(root: &Path) -> Result<i32> {
    let root = canonical_dir(root)?;
    let detector = RegistryDetector::default();
    let context = detector.detect(&root)?;
    let sandbox_profile = context
        .project_type
        .as_deref()
        .and_then(|project_type| detector.sandbox_profile(project_type));
    print_json(&DetectOutput {
        context: &context,
        sandbox_profile,
    })?;
    Ok(exit_codes::VERIFIED)
}

fn cmd_init_config(root: &Path, force: bool) -> Result<i32> {
    let path = canonical_dir(root)?.join(CONFIG_PATH);
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    write_config(&path, &PipelineConfig::default())?;
    println!("{}", path.display());
    Ok(exit_codes::VERIFIED)
}

fn canonical_dir(path: &Path) -> Result<PathBuf> {
    let canonical = path
        .canonicalize()
        .with_context(|| format!("resolve codebase root {}", path.display()))?;
    if !canonical.is_dir() {
        bail!("codebase root {} is not a directory", canonical.display());
    }
    Ok(canonical)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{payload}");
    Ok(())
}
