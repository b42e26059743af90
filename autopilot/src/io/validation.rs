//! Validation commands run when a tool leaves no report behind.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, instrument, warn};

use crate::core::pass_rate::{RateBasis, estimate_pass_rate};
use crate::io::process::run_command_with_timeout;

const VALIDATION_OUTPUT_LIMIT_BYTES: usize = 1_000_000;
const UNAVAILABLE_EXIT_CODE: i32 = 127;
const TIMEOUT_EXIT_CODE: i32 = 124;

/// Captured result of one shell command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellOutcome {
    pub exit_code: i32,
    pub output: String,
    pub timed_out: bool,
}

pub trait ValidationRunner {
    fn run_shell(&self, workdir: &Path, command: &str, timeout: Duration) -> Result<ShellOutcome>;
}

/// Runs candidates through `bash -lc` so login-shell toolchains are on PATH.
pub struct ShellValidationRunner;

impl ValidationRunner for ShellValidationRunner {
    fn run_shell(&self, workdir: &Path, command: &str, timeout: Duration) -> Result<ShellOutcome> {
        let mut cmd = Command::new("bash");
        cmd.arg("-lc").arg(command).current_dir(workdir);
        let output = run_command_with_timeout(cmd, None, timeout, VALIDATION_OUTPUT_LIMIT_BYTES)?;
        Ok(ShellOutcome {
            exit_code: output.exit_code(),
            output: output.combined(),
            timed_out: output.timed_out,
        })
    }
}

/// Outcome of the validation pass feeding a synthesized report.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationResult {
    /// Empty when no candidate could run.
    pub command: String,
    pub exit_code: i32,
    pub rate: f64,
    pub basis: RateBasis,
    pub output: String,
}

impl ValidationResult {
    fn unavailable() -> Self {
        Self {
            command: String::new(),
            exit_code: 1,
            rate: 0.0,
            basis: RateBasis::ExitCode,
            output: "No available validation command".to_string(),
        }
    }
}

fn is_unavailable(outcome: &ShellOutcome) -> bool {
    let lowered = outcome.output.to_lowercase();
    outcome.exit_code == UNAVAILABLE_EXIT_CODE
        && (lowered.contains("command not found") || lowered.contains("not recognized"))
}

/// True when the run says something about the tests: it passed, or its
/// output carries pass/fail counts. A non-zero exit with no counts is a
/// missing manifest, a runner with nothing to collect, or a broken build;
/// none of those rule the next candidate out.
fn has_signal(outcome: &ShellOutcome, basis: RateBasis) -> bool {
    outcome.exit_code == 0 || basis == RateBasis::Counted
}

/// Try `commands` in order until one yields a pass/fail signal.
///
/// Candidates reported as unavailable are skipped. Candidates that ran but
/// gave no signal are skipped too; the first of them is returned when no
/// later candidate does better. A timeout stops the search with exit 124 and
/// rate 0.
#[instrument(skip_all, fields(workdir = %workdir.display(), candidates = commands.len()))]
pub fn run_validation<R: ValidationRunner + ?Sized>(
    runner: &R,
    workdir: &Path,
    commands: &[String],
    timeout: Duration,
) -> ValidationResult {
    let mut inconclusive: Option<ValidationResult> = None;
    for command in commands.iter().map(|c| c.trim()).filter(|c| !c.is_empty()) {
        let outcome = match runner.run_shell(workdir, command, timeout) {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(command, err = %format!("{err:#}"), "validation command could not start");
                continue;
            }
        };
        if outcome.timed_out {
            warn!(command, timeout_secs = timeout.as_secs(), "validation command timed out");
            return ValidationResult {
                command: command.to_string(),
                exit_code: TIMEOUT_EXIT_CODE,
                rate: 0.0,
                basis: RateBasis::ExitCode,
                output: "Validation command timeout".to_string(),
            };
        }
        if is_unavailable(&outcome) {
            info!(command, "validation command unavailable, trying next");
            continue;
        }
        let estimate = estimate_pass_rate(&outcome.output, outcome.exit_code);
        let signal = has_signal(&outcome, estimate.basis);
        info!(
            command,
            exit_code = outcome.exit_code,
            pass_rate = estimate.rate,
            basis = ?estimate.basis,
            signal,
            "validation command ran"
        );
        let result = ValidationResult {
            command: command.to_string(),
            exit_code: outcome.exit_code,
            rate: estimate.rate,
            basis: estimate.basis,
            output: outcome.output,
        };
        if signal {
            return result;
        }
        inconclusive.get_or_insert(result);
    }
    if let Some(result) = inconclusive {
        warn!(command = %result.command, "no validation command gave a pass/fail signal");
        return result;
    }
    warn!("no validation command available");
    ValidationResult::unavailable()
}
