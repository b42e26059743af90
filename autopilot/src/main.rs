//! `autopilot`: supervise coding-agent CLIs and gate their work into commits.
//!
//! Each round resets a git workspace to the remote branch, runs the configured
//! tools in priority order, audits their completion reports and pushes only
//! substantive, approved changes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use autopilot::core::types::{RoundOutcome, RoundStatus};
use autopilot::exit_codes;
use autopilot::io::config::{AutopilotConfig, DEFAULT_CONFIG_PATH, load_config, write_config};
use autopilot::io::history::{next_round_id, write_first_round_report};
use autopilot::io::supervisor::{ProcessSupervisor, SupervisorSettings};
use autopilot::io::tools::ToolRegistry;
use autopilot::io::validation::ShellValidationRunner;
use autopilot::io::workspace::Workspace;
use autopilot::logging;
use autopilot::looping::{LoopOptions, record_round, run_loop};
use autopilot::round::RoundOrchestrator;

#[derive(Parser)]
#[command(
    name = "autopilot",
    version,
    about = "Supervise coding-agent CLIs and gate their work into commits"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run rounds until one pauses (or once with `--once`).
    Run {
        /// Stop after a single round.
        #[arg(long)]
        once: bool,
        /// Comma-separated tools to use, in this order.
        #[arg(long, value_delimiter = ',')]
        only: Vec<String>,
        /// Comma-separated tools to try first.
        #[arg(long, value_delimiter = ',')]
        order: Vec<String>,
        /// Seconds between rounds (overrides `loop_interval_secs`).
        #[arg(long)]
        interval: Option<u64>,
        /// Branch to work on (overrides `branch`).
        #[arg(long)]
        branch: Option<String>,
    },
    /// Run one interactive round against a single tool.
    Interactive {
        /// Tool name or alias.
        #[arg(long)]
        tool: String,
        #[arg(long, default_value_t = 3)]
        max_turns: u32,
    },
    /// Write the default configuration file.
    InitConfig {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
    /// Validate the configuration and list tool availability.
    CheckConfig,
}

fn main() {
    let cli = Cli::parse();
    let code = match dispatch(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn dispatch(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Run {
            once,
            only,
            order,
            interval,
            branch,
        } => cmd_run(&cli.config, once, &only, &order, interval, branch),
        Command::Interactive { tool, max_turns } => cmd_interactive(&cli.config, &tool, max_turns),
        Command::InitConfig { force } => cmd_init_config(&cli.config, force),
        Command::CheckConfig => cmd_check_config(&cli.config),
    }
}

fn cmd_run(
    config_path: &Path,
    once: bool,
    only: &[String],
    order: &[String],
    interval: Option<u64>,
    branch: Option<String>,
) -> Result<i32> {
    let mut cfg = load_config(config_path)?;
    if let Some(branch) = branch {
        cfg.branch = branch;
        cfg.validate()?;
    }
    logging::init(Some(&cfg.log_dir))?;

    let Some(registry) = select_tools(&cfg, only, order) else {
        error!("no tool available after filtering");
        return Ok(exit_codes::NO_TOOL);
    };
    let supervisor = ProcessSupervisor::new(SupervisorSettings::from_config(&cfg));
    let validator = ShellValidationRunner;
    let workspace = Workspace::new(&cfg, read_token(&cfg));
    if let Err(err) = workspace.verify_access() {
        error!(err = %format!("{err:#}"), "remote access check failed");
        return Ok(exit_codes::ACCESS_DENIED);
    }
    let orchestrator = RoundOrchestrator::new(&cfg, registry, workspace, &supervisor, &validator);
    let options = LoopOptions {
        once,
        interval: Duration::from_secs(interval.unwrap_or(cfg.loop_interval_secs)),
        first_round: next_round_id(&cfg.log_dir)?,
    };
    info!(
        workspace = %orchestrator.workspace().dir().display(),
        branch = %cfg.branch,
        once,
        "autopilot started"
    );
    let outcome = run_loop(&cfg.log_dir, &orchestrator, options, print_round)?;
    info!(rounds = outcome.rounds_executed, stop = ?outcome.stop, "autopilot stopped");
    Ok(status_code(&outcome.last))
}

fn cmd_interactive(config_path: &Path, selector: &str, max_turns: u32) -> Result<i32> {
    let cfg = load_config(config_path)?;
    logging::init(Some(&cfg.log_dir))?;

    let registry = cfg.registry();
    match registry.find(selector) {
        Some(tool) if tool.program_available() => {}
        Some(tool) => {
            error!(tool = %tool.name, program = %tool.batch.program, "tool not on PATH");
            return Ok(exit_codes::NO_TOOL);
        }
        None => {
            error!(selector, known = ?registry.names(), "unknown tool");
            return Ok(exit_codes::NO_TOOL);
        }
    }
    let supervisor = ProcessSupervisor::new(SupervisorSettings::from_config(&cfg));
    let validator = ShellValidationRunner;
    let workspace = Workspace::new(&cfg, read_token(&cfg));
    if let Err(err) = workspace.verify_access() {
        error!(err = %format!("{err:#}"), "remote access check failed");
        return Ok(exit_codes::ACCESS_DENIED);
    }
    let orchestrator = RoundOrchestrator::new(&cfg, registry, workspace, &supervisor, &validator);
    let round_id = next_round_id(&cfg.log_dir)?;
    let outcome = orchestrator.run_interactive_round(round_id, selector, max_turns);
    record_round(&cfg.log_dir, &outcome)?;
    write_first_round_report(&cfg.log_dir, &outcome)?;
    print_round(&outcome);
    Ok(status_code(&outcome))
}

fn cmd_init_config(config_path: &Path, force: bool) -> Result<i32> {
    if config_path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", config_path.display());
    }
    write_config(config_path, &AutopilotConfig::default())?;
    println!("wrote {}", config_path.display());
    Ok(exit_codes::OK)
}

fn cmd_check_config(config_path: &Path) -> Result<i32> {
    let cfg = load_config(config_path)?;
    println!("config ok: {}", config_path.display());
    println!("workspace: {}", cfg.workspace_dir().display());
    let registry = cfg.registry();
    let mut available = 0usize;
    for tool in registry.enabled() {
        if tool.program_available() {
            available += 1;
            println!("  {}: available ({})", tool.name, tool.batch.program);
        } else {
            println!("  {}: missing ({} not on PATH)", tool.name, tool.batch.program);
        }
    }
    if available == 0 {
        return Ok(exit_codes::NO_TOOL);
    }
    Ok(exit_codes::OK)
}

/// Apply `--only`, then `--order`, then drop tools whose program is missing.
fn select_tools(cfg: &AutopilotConfig, only: &[String], order: &[String]) -> Option<ToolRegistry> {
    let mut registry = cfg.registry();
    if !only.is_empty() {
        let unknown = registry.restrict_to(only);
        if !unknown.is_empty() {
            warn!(unknown = ?unknown, "ignoring unknown --only tools");
        }
    }
    if !order.is_empty() {
        let unknown = registry.reorder(order);
        if !unknown.is_empty() {
            warn!(unknown = ?unknown, "ignoring unknown --order tools");
        }
    }
    let dropped = registry.retain_available();
    if !dropped.is_empty() {
        warn!(dropped = ?dropped, "skipping unavailable tools");
    }
    (!registry.is_empty()).then_some(registry)
}

fn read_token(cfg: &AutopilotConfig) -> Option<String> {
    let name = cfg.token_env.as_deref()?.trim();
    if name.is_empty() {
        return None;
    }
    match std::env::var(name) {
        Ok(token) if !token.trim().is_empty() => Some(token.trim().to_string()),
        _ => {
            warn!(env = name, "push token variable unset, using plain remote url");
            None
        }
    }
}

fn print_round(outcome: &RoundOutcome) {
    match serde_json::to_string(outcome) {
        Ok(line) => println!("{line}"),
        Err(err) => warn!(err = %err, "failed to serialize round outcome"),
    }
}

fn status_code(outcome: &RoundOutcome) -> i32 {
    match outcome.status {
        RoundStatus::Success => exit_codes::OK,
        RoundStatus::Paused => exit_codes::PAUSED,
    }
}
