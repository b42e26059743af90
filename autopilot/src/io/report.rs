//! Report gateway: obtain a completion report after a tool invocation.
//!
//! Order of attempts: the file the tool wrote, then bounded session resumes
//! (tools with the resume capability), then a synthesized fallback report
//! backed by validation commands. "No report" is a normal outcome, not an
//! error.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use jsonschema::{Draft, Validator};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::pass_rate::RateBasis;
use crate::core::signals::pick_summary_line;
use crate::core::types::{CompletionReport, ExecutionOutcome, PassRate};
use crate::io::config::{FallbackConfig, ResumeConfig};
use crate::io::tools::ToolDescriptor;
use crate::io::validation::{ValidationResult, ValidationRunner, run_validation};

const REPORT_SCHEMA: &str = include_str!("../../schemas/report.schema.json");
const SUMMARY_TAIL_LINES: usize = 20;
const FALLBACK_CORE: &str = "Fallback report (tool did not write one)";
const NO_SUMMARY: &str = "Tool finished without a usable summary line";

static REPORT_VALIDATOR: LazyLock<Validator> = LazyLock::new(|| {
    let schema: Value = serde_json::from_str(REPORT_SCHEMA).expect("report schema should be JSON");
    jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .expect("report schema should compile")
});

/// Where an obtained report came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportSource {
    Tool,
    /// Written during the n-th resume invocation.
    Resume(u32),
    Fallback,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObtainedReport {
    pub report: CompletionReport,
    pub source: ReportSource,
}

pub struct ReportGateway<'a> {
    report_path: PathBuf,
    workspace: PathBuf,
    resume: &'a ResumeConfig,
    fallback: &'a FallbackConfig,
    validator: &'a dyn ValidationRunner,
}

impl<'a> ReportGateway<'a> {
    pub fn new(
        workspace: &Path,
        report_rel: &str,
        resume: &'a ResumeConfig,
        fallback: &'a FallbackConfig,
        validator: &'a dyn ValidationRunner,
    ) -> Self {
        Self {
            report_path: workspace.join(report_rel),
            workspace: workspace.to_path_buf(),
            resume,
            fallback,
            validator,
        }
    }

    pub fn report_path(&self) -> &Path {
        &self.report_path
    }

    /// Remove any stale report and make sure its directory exists.
    pub fn prepare(&self) -> Result<()> {
        clear_report(&self.report_path)?;
        if let Some(parent) = self.report_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create report dir {}", parent.display()))?;
        }
        Ok(())
    }

    /// Obtain a report for `outcome`.
    ///
    /// `resume` runs one resume invocation for `(session_id, attempt)` and
    /// returns `None` when it could not be started.
    #[instrument(skip_all, fields(tool = %tool.name))]
    pub fn obtain<F>(
        &self,
        tool: &ToolDescriptor,
        outcome: &ExecutionOutcome,
        mut resume: F,
    ) -> Option<ObtainedReport>
    where
        F: FnMut(&str, u32) -> Option<ExecutionOutcome>,
    {
        if let Some(report) = load_report(&self.report_path) {
            info!("report loaded");
            return Some(ObtainedReport {
                report,
                source: ReportSource::Tool,
            });
        }

        if let Some(found) = self.try_resume(tool, outcome, &mut resume) {
            return Some(found);
        }

        info!("report missing");
        if !self.fallback.enabled {
            return None;
        }
        let validation = self.fallback.run_validation.then(|| {
            run_validation(
                self.validator,
                &self.workspace,
                &self.fallback.validation_commands,
                Duration::from_secs(self.fallback.validation_timeout_secs),
            )
        });
        let report = build_fallback_report(&tool.name, outcome, validation.as_ref());
        if let Err(err) = write_report(&self.report_path, &report) {
            warn!(err = %format!("{err:#}"), "failed to persist fallback report");
        }
        info!(
            run_status = %report.run_status,
            test_pass_rate = ?report.test_pass_rate,
            "fallback report generated"
        );
        Some(ObtainedReport {
            report,
            source: ReportSource::Fallback,
        })
    }

    fn try_resume<F>(
        &self,
        tool: &ToolDescriptor,
        outcome: &ExecutionOutcome,
        resume: &mut F,
    ) -> Option<ObtainedReport>
    where
        F: FnMut(&str, u32) -> Option<ExecutionOutcome>,
    {
        if !self.resume.enabled {
            return None;
        }
        let capability = tool.resume.as_ref()?;
        let Some(session_id) = capability.extract_session_id(&outcome.output_lines) else {
            debug!("no session id in output, skipping resume");
            return None;
        };
        for attempt in 1..=self.resume.max_attempts {
            info!(session_id, attempt, "resuming session");
            let Some(resumed) = resume(&session_id, attempt) else {
                break;
            };
            debug!(reason = %resumed.reason, exit_code = ?resumed.exit_code, "resume finished");
            if let Some(report) = load_report(&self.report_path) {
                info!(attempt, "report loaded after resume");
                return Some(ObtainedReport {
                    report,
                    source: ReportSource::Resume(attempt),
                });
            }
        }
        None
    }
}

/// Delete the report file if present.
pub fn clear_report(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "stale report removed");
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove report {}", path.display())),
    }
}

/// Load and validate a report. Missing, malformed or invalid files are `None`.
pub fn load_report(path: &Path) -> Option<CompletionReport> {
    match read_report(path) {
        Ok(report) => report,
        Err(err) => {
            warn!(path = %path.display(), err = %format!("{err:#}"), "ignoring invalid report");
            None
        }
    }
}

fn read_report(path: &Path) -> Result<Option<CompletionReport>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("read report {}", path.display())),
    };
    let value: Value = serde_json::from_str(&contents).context("parse report json")?;
    let messages: Vec<String> = REPORT_VALIDATOR
        .iter_errors(&value)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("report schema validation failed: {}", messages.join("; "));
    }
    let report = serde_json::from_value(value).map_err(|err| anyhow!("decode report: {err}"))?;
    Ok(Some(report))
}

/// Write a report as pretty JSON with a trailing newline.
pub fn write_report(path: &Path, report: &CompletionReport) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create report dir {}", parent.display()))?;
    }
    let mut buf = serde_json::to_string_pretty(report)?;
    buf.push('\n');
    fs::write(path, buf).with_context(|| format!("write report {}", path.display()))
}

/// Synthesize a report from the invocation outcome.
///
/// `validation` is `None` when validation commands are disabled; the tool's
/// own exit then stands in for the test result.
pub fn build_fallback_report(
    tool: &str,
    outcome: &ExecutionOutcome,
    validation: Option<&ValidationResult>,
) -> CompletionReport {
    let tool_ok = outcome.exit_code == Some(0) && !outcome.terminated;
    let (command, test_exit, rate, basis, output) = match validation {
        Some(result) => (
            result.command.as_str(),
            result.exit_code,
            result.rate,
            result.basis,
            result.output.as_str(),
        ),
        None => {
            let exit = if tool_ok { 0 } else { 1 };
            let rate = if tool_ok { 100.0 } else { 0.0 };
            (
                "",
                exit,
                rate,
                RateBasis::ExitCode,
                "Fallback tests disabled by config",
            )
        }
    };
    let run_success = tool_ok && test_exit == 0;

    let lines: Vec<&str> = output.lines().collect();
    let tail = lines[lines.len().saturating_sub(SUMMARY_TAIL_LINES)..].join(" | ");
    let command = if command.is_empty() { "N/A" } else { command };
    let mut test_summary = format!("{command} => exit={test_exit}; tail={tail}");
    if basis == RateBasis::ExitCode {
        test_summary.push_str(" (pass rate inferred from exit code)");
    }

    CompletionReport {
        run_status: if run_success { "success" } else { "failed" }.to_string(),
        test_pass_rate: PassRate::Number((rate * 100.0).round() / 100.0),
        core_optimization: FALLBACK_CORE.to_string(),
        iteration_value: pick_summary_line(&outcome.output_lines)
            .unwrap_or_else(|| NO_SUMMARY.to_string()),
        test_summary,
        fallback_generated: true,
        source_tool: Some(tool.to_string()),
        tool_reason: Some(outcome.reason.to_string()),
        tool_exit_code: outcome.exit_code,
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::core::types::TerminationReason;
    use crate::io::tools::default_tools;
    use crate::io::validation::ShellOutcome;

    struct NoValidation;

    impl ValidationRunner for NoValidation {
        fn run_shell(&self, _: &Path, _: &str, _: Duration) -> Result<ShellOutcome> {
            Ok(ShellOutcome {
                exit_code: 0,
                output: "12 passed, 0 failed".to_string(),
                timed_out: false,
            })
        }
    }

    fn outcome(exit_code: Option<i32>, lines: &[&str]) -> ExecutionOutcome {
        ExecutionOutcome {
            tool: "Codex CLI".to_string(),
            terminated: false,
            reason: TerminationReason::Completed,
            exit_code,
            duration: Duration::from_secs(3),
            output_lines: lines.iter().map(|l| l.to_string()).collect(),
            error_keyword: None,
            loop_detected: false,
            probe_sent: false,
        }
    }

    const VALID: &str = r#"{"run_status":"success","test_pass_rate":95,"core_optimization":"faster parser","iteration_value":"x","test_summary":"ok"}"#;

    #[test]
    fn loads_valid_report_and_rejects_invalid() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("report.json");
        assert!(load_report(&path).is_none());

        fs::write(&path, VALID).expect("write");
        let report = load_report(&path).expect("report");
        assert_eq!(report.test_pass_rate, PassRate::Number(95.0));

        fs::write(&path, r#"{"run_status":"success"}"#).expect("write");
        assert!(load_report(&path).is_none());
        fs::write(&path, "not json").expect("write");
        assert!(load_report(&path).is_none());
        fs::write(&path, r#"{"run_status":1,"test_pass_rate":95,"core_optimization":"","iteration_value":"","test_summary":""}"#)
            .expect("write");
        assert!(load_report(&path).is_none());
    }

    #[test]
    fn prepare_clears_stale_report() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (resume, fallback) = (ResumeConfig::default(), FallbackConfig::default());
        let gateway = ReportGateway::new(temp.path(), ".autopilot/report.json", &resume, &fallback, &NoValidation);
        gateway.prepare().expect("prepare");
        fs::write(gateway.report_path(), VALID).expect("write");
        gateway.prepare().expect("prepare again");
        assert!(!gateway.report_path().exists());
        assert!(gateway.report_path().parent().expect("parent").is_dir());
    }

    #[test]
    fn resume_runs_until_report_appears() {
        let temp = tempfile::tempdir().expect("tempdir");
        let resume = ResumeConfig {
            enabled: true,
            max_attempts: 3,
        };
        let fallback = FallbackConfig::default();
        let gateway = ReportGateway::new(temp.path(), "report.json", &resume, &fallback, &NoValidation);
        let codex = default_tools().remove(0);
        let task = outcome(Some(0), &["session id: 0199a1b2-c3d4-e5f6-0718-293a4b5c6d7e"]);

        let calls = Cell::new(0);
        let found = gateway
            .obtain(&codex, &task, |session, attempt| {
                assert_eq!(session, "0199a1b2-c3d4-e5f6-0718-293a4b5c6d7e");
                calls.set(calls.get() + 1);
                if attempt == 2 {
                    fs::write(gateway.report_path(), VALID).expect("write");
                }
                Some(outcome(Some(0), &[]))
            })
            .expect("report");
        assert_eq!(found.source, ReportSource::Resume(2));
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn tools_without_resume_go_to_fallback() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (resume, fallback) = (ResumeConfig::default(), FallbackConfig::default());
        let gateway = ReportGateway::new(temp.path(), "report.json", &resume, &fallback, &NoValidation);
        let gemini = default_tools().remove(1);
        let found = gateway
            .obtain(&gemini, &outcome(Some(0), &["Refactored the lexer", "tokens used: 1200"]), |_, _| {
                panic!("resume must not run")
            })
            .expect("fallback");
        assert_eq!(found.source, ReportSource::Fallback);
        assert!(found.report.fallback_generated);
        assert_eq!(found.report.run_status, "success");
        assert_eq!(found.report.test_pass_rate, PassRate::Number(100.0));
        assert_eq!(found.report.iteration_value, "Refactored the lexer");
        assert!(found.report.test_summary.starts_with("cargo test => exit=0; tail=12 passed"));
        assert!(load_report(gateway.report_path()).is_some());
    }

    #[test]
    fn fallback_disabled_means_no_report() {
        let temp = tempfile::tempdir().expect("tempdir");
        let resume = ResumeConfig::default();
        let fallback = FallbackConfig {
            enabled: false,
            ..FallbackConfig::default()
        };
        let gateway = ReportGateway::new(temp.path(), "report.json", &resume, &fallback, &NoValidation);
        let gemini = default_tools().remove(1);
        assert!(gateway.obtain(&gemini, &outcome(Some(0), &[]), |_, _| None).is_none());
    }

    #[test]
    fn fallback_without_validation_uses_tool_exit() {
        let report = build_fallback_report("Gemini CLI", &outcome(Some(2), &[]), None);
        assert_eq!(report.run_status, "failed");
        assert_eq!(report.test_pass_rate, PassRate::Number(0.0));
        assert_eq!(report.iteration_value, NO_SUMMARY);
        assert_eq!(
            report.test_summary,
            "N/A => exit=1; tail=Fallback tests disabled by config (pass rate inferred from exit code)"
        );
        assert_eq!(report.tool_exit_code, Some(2));
    }

    #[test]
    fn fallback_rounds_counted_rate() {
        let validation = ValidationResult {
            command: "pytest -q".to_string(),
            exit_code: 1,
            rate: 200.0 / 3.0,
            basis: RateBasis::Counted,
            output: "2 passed, 1 failed".to_string(),
        };
        let report = build_fallback_report("Codex CLI", &outcome(Some(0), &[]), Some(&validation));
        assert_eq!(report.run_status, "failed");
        assert_eq!(report.test_pass_rate, PassRate::Number(66.67));
        assert_eq!(report.test_summary, "pytest -q => exit=1; tail=2 passed, 1 failed");
    }
}
