//! Shared deterministic types for autopilot core logic.
//!
//! These types define stable contracts between the supervisor, report gateway,
//! audit engine, change gate and round orchestrator. They carry no I/O handles
//! and serialize to the shapes written into round history records.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Timeout thresholds applied to one supervised invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    /// Terminate when no output line arrives for this long.
    pub idle: Duration,
    /// Send a progress probe once total runtime crosses this.
    pub probe_after: Duration,
    /// After a probe, wait this long for a clear progress answer.
    pub probe_wait: Duration,
    /// Hard ceiling on total runtime.
    pub max_runtime: Duration,
}

impl TimeoutPolicy {
    /// Policy for the one-time bootstrap phase.
    ///
    /// The probe threshold is pushed past the runtime ceiling so bootstrap runs
    /// are governed only by idle and max-runtime limits.
    pub fn bootstrap(idle: Duration, max_runtime: Duration) -> Self {
        let idle = idle.max(Duration::from_secs(5));
        let max_runtime = max_runtime.max(idle + Duration::from_secs(2));
        Self {
            idle,
            probe_after: max_runtime + Duration::from_secs(1),
            probe_wait: Duration::from_secs(1),
            max_runtime,
        }
    }
}

/// Why a supervised invocation ended.
///
/// Variants are listed in the priority order in which they are checked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TerminationReason {
    SpawnFailed { message: String },
    ErrorKeyword { keyword: String },
    LoopDetected,
    IdleTimeout,
    ProbeNoResponse,
    ProbeUnclear,
    MaxRuntime,
    /// An interactive session exited with a non-zero code.
    InteractiveExitNonzero,
    Completed,
}

impl TerminationReason {
    /// Stable short code used in logs, transcripts and prompts.
    pub fn code(&self) -> &'static str {
        match self {
            TerminationReason::SpawnFailed { .. } => "spawn_failed",
            TerminationReason::ErrorKeyword { .. } => "error_keyword",
            TerminationReason::LoopDetected => "loop_detected",
            TerminationReason::IdleTimeout => "idle_timeout",
            TerminationReason::ProbeNoResponse => "probe_no_response",
            TerminationReason::ProbeUnclear => "probe_unclear",
            TerminationReason::MaxRuntime => "max_runtime",
            TerminationReason::InteractiveExitNonzero => "interactive_exit_nonzero",
            TerminationReason::Completed => "completed",
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationReason::SpawnFailed { message } => write!(f, "spawn_failed: {message}"),
            TerminationReason::ErrorKeyword { keyword } => write!(f, "error_keyword:{keyword}"),
            other => f.write_str(other.code()),
        }
    }
}

/// Structured result of one supervised tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    pub tool: String,
    /// True when the supervisor chose to stop the process (or never started it).
    pub terminated: bool,
    pub reason: TerminationReason,
    /// `None` when the process never reported an exit code.
    pub exit_code: Option<i32>,
    pub duration: Duration,
    /// Bounded tail of captured output lines.
    pub output_lines: Vec<String>,
    pub error_keyword: Option<String>,
    pub loop_detected: bool,
    pub probe_sent: bool,
}

impl ExecutionOutcome {
    /// Outcome for a process that could not be started.
    pub fn spawn_failed(tool: &str, message: impl Into<String>) -> Self {
        Self {
            tool: tool.to_string(),
            terminated: true,
            reason: TerminationReason::SpawnFailed {
                message: message.into(),
            },
            exit_code: None,
            duration: Duration::ZERO,
            output_lines: Vec::new(),
            error_keyword: None,
            loop_detected: false,
            probe_sent: false,
        }
    }

    /// True when the invocation itself failed (as opposed to the work it reported).
    pub fn is_call_failure(&self) -> bool {
        self.terminated || self.error_keyword.is_some() || matches!(self.exit_code, Some(code) if code != 0)
    }

    /// Failure description used when switching tools.
    pub fn failure_reason(&self) -> String {
        match (self.exit_code, &self.reason) {
            (Some(code), TerminationReason::Completed) if code != 0 => format!("exit_code_{code}"),
            _ => self.reason.to_string(),
        }
    }

    /// Last `n` captured lines.
    pub fn tail(&self, n: usize) -> &[String] {
        let start = self.output_lines.len().saturating_sub(n);
        &self.output_lines[start..]
    }
}

/// Test pass rate as written by a tool: a number or text containing one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PassRate {
    Number(f64),
    Text(String),
}

impl Default for PassRate {
    fn default() -> Self {
        PassRate::Number(0.0)
    }
}

/// Completion record the tool writes (or the gateway synthesizes).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionReport {
    pub run_status: String,
    pub test_pass_rate: PassRate,
    pub core_optimization: String,
    pub iteration_value: String,
    pub test_summary: String,
    #[serde(default)]
    pub fallback_generated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_exit_code: Option<i32>,
}

/// Approve/reject verdict for one completion report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditDecision {
    pub approved: bool,
    pub run_success: bool,
    pub pass_rate: f64,
    pub core_optimization: String,
    pub reason: String,
}

/// Result of the change gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitClassification {
    /// Gate never ran this round.
    NotStarted,
    NoChanges,
    DocsOnly,
    BelowThreshold,
    Pushed,
    StageFailed,
    DiffFailed,
    CommitFailed,
    PushFailed,
}

impl CommitClassification {
    pub fn as_str(self) -> &'static str {
        match self {
            CommitClassification::NotStarted => "not_started",
            CommitClassification::NoChanges => "no_changes",
            CommitClassification::DocsOnly => "docs_only",
            CommitClassification::BelowThreshold => "below_threshold",
            CommitClassification::Pushed => "pushed",
            CommitClassification::StageFailed => "stage_failed",
            CommitClassification::DiffFailed => "diff_failed",
            CommitClassification::CommitFailed => "commit_failed",
            CommitClassification::PushFailed => "push_failed",
        }
    }

    /// Gate failures that end the round paused.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            CommitClassification::StageFailed
                | CommitClassification::DiffFailed
                | CommitClassification::CommitFailed
                | CommitClassification::PushFailed
        )
    }
}

impl fmt::Display for CommitClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoundStatus {
    Success,
    Paused,
}

/// Final result of one round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundOutcome {
    pub round_id: u32,
    pub status: RoundStatus,
    pub tool_used: Option<String>,
    pub audit: Option<AuditDecision>,
    pub commit_status: CommitClassification,
    pub commit_hash: Option<String>,
    pub message: String,
}

impl RoundOutcome {
    /// Paused round that never reached the change gate.
    pub fn paused(round_id: u32, tool_used: Option<String>, message: impl Into<String>) -> Self {
        Self {
            round_id,
            status: RoundStatus::Paused,
            tool_used,
            audit: None,
            commit_status: CommitClassification::NotStarted,
            commit_hash: None,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(terminated: bool, exit_code: Option<i32>, reason: TerminationReason) -> ExecutionOutcome {
        ExecutionOutcome {
            tool: "codex".to_string(),
            terminated,
            reason,
            exit_code,
            duration: Duration::from_secs(1),
            output_lines: Vec::new(),
            error_keyword: None,
            loop_detected: false,
            probe_sent: false,
        }
    }

    #[test]
    fn clean_exit_is_not_call_failure() {
        assert!(!outcome(false, Some(0), TerminationReason::Completed).is_call_failure());
        assert!(!outcome(false, None, TerminationReason::Completed).is_call_failure());
    }

    #[test]
    fn nonzero_exit_reports_exit_code_reason() {
        let out = outcome(false, Some(3), TerminationReason::Completed);
        assert!(out.is_call_failure());
        assert_eq!(out.failure_reason(), "exit_code_3");
    }

    #[test]
    fn terminated_reports_termination_reason() {
        let out = outcome(true, Some(143), TerminationReason::IdleTimeout);
        assert!(out.is_call_failure());
        assert_eq!(out.failure_reason(), "idle_timeout");
    }

    #[test]
    fn bootstrap_policy_never_probes() {
        let policy = TimeoutPolicy::bootstrap(Duration::from_secs(1), Duration::from_secs(3));
        assert_eq!(policy.idle, Duration::from_secs(5));
        assert_eq!(policy.max_runtime, Duration::from_secs(7));
        assert!(policy.probe_after > policy.max_runtime);
    }

    #[test]
    fn pass_rate_accepts_number_or_text() {
        let report: CompletionReport = serde_json::from_str(
            r#"{"run_status":"success","test_pass_rate":"95%","core_optimization":"x","iteration_value":"y","test_summary":"z"}"#,
        )
        .expect("parse");
        assert_eq!(report.test_pass_rate, PassRate::Text("95%".to_string()));
        assert!(!report.fallback_generated);
    }
}
