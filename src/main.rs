//! codex-loop - implement, verify, repair
//!
//! Runs a code-generation agent against a task request until the project's
//! tests pass with enough coverage, or stops with a diagnosed report.

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use codex_loop::classify::{
    classify_agent_result, classify_verify_result, failure_signature, parse_coverage_percent,
    FailureKind,
};
use codex_loop::config::{ConfigLocations, LoopConfig, LoopSettings, RepeatGuardScope};
use codex_loop::fingerprint::ensure_git_repo;
use codex_loop::lock::RunLock;
use codex_loop::r#loop::{LoopDependencies, LoopManager, LoopOutcome};
use codex_loop::runner::CommandResult;
use codex_loop::tooling::resolve_verify_command;
use codex_loop::{LoopError, Result};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "codex-loop")]
#[command(version)]
#[command(about = "Drive a coding agent until tests pass with coverage", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Repository root (defaults to current directory)
    #[arg(short, long, global = true, default_value = ".")]
    root: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the implement-verify-repair loop
    Run(RunArgs),

    /// Classify a saved command output (diagnostic aid)
    Classify {
        /// File containing the captured output
        file: PathBuf,

        /// Which rule table to apply
        #[arg(long, value_enum, default_value = "verify")]
        kind: ClassifyKind,

        /// Exit code the command returned
        #[arg(long, default_value_t = 1, allow_negative_numbers = true)]
        exit_code: i32,

        /// Verification command that produced the output
        #[arg(long, default_value = "")]
        command: String,

        /// Treat the working tree as unchanged (agent kind only)
        #[arg(long)]
        unchanged: bool,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show effective configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the merged settings for the repository root
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ClassifyKind {
    Agent,
    Verify,
}

#[derive(clap::Args)]
struct RunArgs {
    /// Task request file (markdown)
    #[arg(long)]
    request: PathBuf,

    /// Minimum coverage percentage for success [default: 80]
    #[arg(long, value_name = "PERCENT")]
    min_coverage: Option<f64>,

    /// Maximum implement-verify cycles [default: 25]
    #[arg(long, value_name = "N")]
    max_quality_cycles: Option<u32>,

    /// Stop when the same blocked failure repeats N times [default: 5]
    #[arg(long, value_name = "N")]
    max_blocked_repeats: Option<u32>,

    /// Count repeats for blocked failures only, or for all failures
    #[arg(long, value_enum)]
    repeat_guard_scope: Option<RepeatGuardScope>,

    /// Agent sandbox mode [default: workspace-write]
    #[arg(long)]
    sandbox: Option<String>,

    /// Agent approval policy [default: never]
    #[arg(long)]
    ask_for_approval: Option<String>,

    /// Agent executable [default: codex]
    #[arg(long, env = "CODEX_LOOP_AGENT_BIN")]
    agent_bin: Option<String>,

    /// Agent timeout in seconds [default: 3600]
    #[arg(long, value_name = "SECS")]
    agent_timeout: Option<u64>,

    /// Verification command (skips tooling detection)
    #[arg(long)]
    verify_cmd: Option<String>,

    /// Verification timeout in seconds [default: 1800]
    #[arg(long, value_name = "SECS")]
    verify_timeout: Option<u64>,

    /// Tooling detector command printing JSON
    #[arg(long)]
    tooling_cmd: Option<String>,

    /// Log directory [default: .cursor/.hook_state/codex_loop]
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

impl RunArgs {
    /// CLI flags as the topmost settings layer.
    fn to_settings(&self) -> LoopSettings {
        LoopSettings {
            min_coverage: self.min_coverage,
            max_quality_cycles: self.max_quality_cycles,
            max_blocked_repeats: self.max_blocked_repeats,
            repeat_guard_scope: self.repeat_guard_scope,
            agent_bin: self.agent_bin.clone(),
            sandbox: self.sandbox.clone(),
            ask_for_approval: self.ask_for_approval.clone(),
            agent_timeout_secs: self.agent_timeout,
            verify_command: self.verify_cmd.clone(),
            verify_timeout_secs: self.verify_timeout,
            tooling_command: self.tooling_cmd.clone(),
            log_dir: self.log_dir.clone(),
        }
    }
}

fn init_tracing(verbose: bool, json: bool) {
    let default_filter = if verbose {
        "codex_loop=debug,info"
    } else {
        "codex_loop=info,warn"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);

    // Resolve project path
    let root = cli.root.canonicalize().unwrap_or(cli.root.clone());

    let result = match cli.command {
        Commands::Run(args) => run(&root, args).await.map(|outcome| {
            if let Some(report) = &outcome.report {
                println!("\n{report}");
            }
        }),
        Commands::Classify {
            file,
            kind,
            exit_code,
            command,
            unchanged,
            json,
        } => classify(&file, kind, exit_code, &command, unchanged, json),
        Commands::Config { action } => match action {
            ConfigAction::Show { json } => show_config(&root, json),
        },
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            ExitCode::from(u8::try_from(e.exit_code()).unwrap_or(1))
        }
    }
}

/// Set up and run one loop. Loop outcomes are never errors; only setup
/// faults are.
async fn run(root: &Path, args: RunArgs) -> Result<LoopOutcome> {
    if !root.is_dir() {
        return Err(LoopError::MissingFile {
            path: root.to_path_buf(),
        });
    }
    ensure_git_repo(root).await?;

    let settings = LoopSettings::load_layered(root, &ConfigLocations::new())?;
    let settings = settings.merge(args.to_settings());
    // Relative request paths are relative to where the command was typed.
    let request = std::env::current_dir()
        .context("Failed to read the current directory")?
        .join(&args.request);
    let mut config = settings.apply(LoopConfig::new(root, request));
    config.validate()?;

    if !config.request_path.is_file() {
        return Err(LoopError::MissingFile {
            path: config.request_path.clone(),
        });
    }

    if which::which(&config.agent.binary).is_err() {
        warn!("Agent executable '{}' not found on PATH", config.agent.binary);
        println!(
            "{} agent '{}' not found on PATH; the loop will report ENV_MISSING_AGENT",
            "Warning:".yellow().bold(),
            config.agent.binary
        );
    }

    if config.verify_command.is_none() {
        let detected = resolve_verify_command(
            None,
            &config.tooling_command,
            root,
            config.tooling_timeout,
        )
        .await?;
        match detected {
            Some(cmd) => {
                info!("Detected verification command: {}", cmd);
                config = config.with_verify_command(cmd);
            }
            None => debug!("No verification command available"),
        }
    }

    let _lock = RunLock::acquire(&config.log_dir)?;
    let deps = LoopDependencies::real(&config);
    let mut manager = LoopManager::new(config, deps)?;
    Ok(manager.run().await)
}

fn classify(
    file: &Path,
    kind: ClassifyKind,
    exit_code: i32,
    command: &str,
    unchanged: bool,
    json: bool,
) -> Result<()> {
    let text = std::fs::read_to_string(file).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => LoopError::MissingFile {
            path: file.to_path_buf(),
        },
        _ => anyhow::Error::new(e)
            .context(format!("Failed to read {}", file.display()))
            .into(),
    })?;
    let result = CommandResult::new(exit_code, text, "");
    let coverage = parse_coverage_percent(&result.combined());

    let (failure_kind, classification) = match kind {
        ClassifyKind::Agent => {
            let after = if unchanged { "before" } else { "after" };
            (
                FailureKind::Agent,
                classify_agent_result(&result, "before", after),
            )
        }
        ClassifyKind::Verify => (
            FailureKind::Verify,
            classify_verify_result(command, &result, coverage),
        ),
    };
    let category = classification.category;
    let signature = failure_signature(
        failure_kind,
        category,
        exit_code,
        &classification.key_excerpt,
    );

    if json {
        let value = serde_json::json!({
            "kind": failure_kind,
            "category": category,
            "blocked": category.is_blocked(),
            "coverage": coverage,
            "keyExcerpt": classification.key_excerpt,
            "signature": signature,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    let label = if category.is_ok() {
        category.as_str().green().bold()
    } else if category.is_blocked() {
        category.as_str().red().bold()
    } else {
        category.as_str().yellow().bold()
    };
    println!("\n{} {}", "Category:".cyan().bold(), label);
    println!("   Blocked: {}", category.is_blocked());
    match coverage {
        Some(c) => println!("   Coverage: {c:.1}%"),
        None => println!("   Coverage: N/A"),
    }
    println!("   Signature: {signature}");
    if !classification.key_excerpt.is_empty() {
        println!("   Key excerpt:");
        for line in classification.key_excerpt.lines() {
            println!("      {line}");
        }
    }
    Ok(())
}

fn show_config(root: &Path, json: bool) -> Result<()> {
    let locations = ConfigLocations::new();
    let settings = LoopSettings::load_layered(root, &locations)?;
    let config = settings.apply(LoopConfig::new(root, ""));
    let effective = LoopSettings::from_config(&config);

    if json {
        println!("{}", serde_json::to_string_pretty(&effective)?);
        return Ok(());
    }

    println!("\n{} codex-loop configuration", "Config:".cyan().bold());
    println!("{}", "─".repeat(40));
    let source = |path: Option<&PathBuf>| match path {
        Some(p) if p.exists() => format!("{} (loaded)", p.display()),
        Some(p) => format!("{} (not found)", p.display()),
        None => "(unavailable)".to_string(),
    };
    let project = locations.project_path(root);
    println!("   User settings: {}", source(locations.user_path()));
    println!("   Project settings: {}", source(Some(&project)));
    println!();
    println!("   Min coverage: {:.1}%", config.min_coverage);
    println!("   Max quality cycles: {}", config.max_quality_cycles);
    println!("   Max blocked repeats: {}", config.max_blocked_repeats);
    println!("   Repeat guard scope: {}", config.repeat_guard_scope);
    println!(
        "   Agent: {} (sandbox {}, approval {}, timeout {}s)",
        config.agent.binary,
        config.agent.sandbox,
        config.agent.approval,
        config.agent.timeout.as_secs()
    );
    println!(
        "   Verify: {} (timeout {}s)",
        config.verify_command.as_deref().unwrap_or("(detected at run time)"),
        config.verify_timeout.as_secs()
    );
    println!("   Tooling: {}", config.tooling_command);
    println!("   Logs: {}", config.log_dir.display());
    Ok(())
}
