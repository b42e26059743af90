//! Round history, pause record and first-round report under the log directory.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::types::{AuditDecision, CommitClassification, RoundOutcome, RoundStatus};

pub const ROUND_HISTORY_FILE: &str = "round_history.jsonl";
pub const PAUSE_REASON_FILE: &str = "PAUSED_REASON.txt";
pub const FIRST_ROUND_REPORT_FILE: &str = "first_round_report.md";

#[derive(Debug, Serialize)]
struct HistoryRecord<'a> {
    ts: String,
    round_id: u32,
    status: RoundStatus,
    tool_used: Option<&'a str>,
    commit_status: CommitClassification,
    commit_hash: Option<&'a str>,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    audit: Option<&'a AuditDecision>,
}

#[derive(Debug, Deserialize)]
struct RecordedRound {
    round_id: u32,
}

pub fn history_path(log_dir: &Path) -> PathBuf {
    log_dir.join(ROUND_HISTORY_FILE)
}

pub fn pause_reason_path(log_dir: &Path) -> PathBuf {
    log_dir.join(PAUSE_REASON_FILE)
}

/// Append one JSON line for `outcome`.
pub fn append_round_history(log_dir: &Path, outcome: &RoundOutcome, at: DateTime<Utc>) -> Result<()> {
    fs::create_dir_all(log_dir)
        .with_context(|| format!("create log dir {}", log_dir.display()))?;
    let record = HistoryRecord {
        ts: at.to_rfc3339(),
        round_id: outcome.round_id,
        status: outcome.status,
        tool_used: outcome.tool_used.as_deref(),
        commit_status: outcome.commit_status,
        commit_hash: outcome.commit_hash.as_deref(),
        message: &outcome.message,
        audit: outcome.audit.as_ref(),
    };
    let mut line = serde_json::to_string(&record)?;
    line.push('\n');
    let path = history_path(log_dir);
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("open round history {}", path.display()))?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("append round history {}", path.display()))?;
    debug!(round_id = outcome.round_id, "round history appended");
    Ok(())
}

/// Id following the last recorded round; 1 when there is no history.
///
/// Unparseable lines are skipped.
pub fn next_round_id(log_dir: &Path) -> Result<u32> {
    let path = history_path(log_dir);
    let contents = match fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(1),
        Err(err) => {
            return Err(err).with_context(|| format!("read round history {}", path.display()));
        }
    };
    let last = contents
        .lines()
        .rev()
        .find_map(|line| serde_json::from_str::<RecordedRound>(line).ok());
    Ok(last.map_or(1, |round| round.round_id.saturating_add(1)))
}

/// Overwrite the pause record with the details of a paused round.
pub fn write_pause_reason(log_dir: &Path, outcome: &RoundOutcome, at: DateTime<Utc>) -> Result<()> {
    fs::create_dir_all(log_dir)
        .with_context(|| format!("create log dir {}", log_dir.display()))?;
    let mut lines = vec![
        format!("time_utc: {}", at.to_rfc3339()),
        format!("round_id: {}", outcome.round_id),
        "status: paused".to_string(),
        format!("tool_used: {}", outcome.tool_used.as_deref().unwrap_or("none")),
        format!("commit_status: {}", outcome.commit_status),
        format!("commit_hash: {}", outcome.commit_hash.as_deref().unwrap_or("none")),
        format!("message: {}", outcome.message),
    ];
    if let Some(audit) = &outcome.audit {
        lines.push(format!("audit_reason: {}", audit.reason));
        lines.push(format!("audit_run_success: {}", audit.run_success));
        lines.push(format!("audit_test_pass_rate: {:.2}", audit.pass_rate));
    }
    let path = pause_reason_path(log_dir);
    fs::write(&path, lines.join("\n") + "\n")
        .with_context(|| format!("write pause record {}", path.display()))?;
    info!(path = %path.display(), "pause record written");
    Ok(())
}

pub fn clear_pause_reason(log_dir: &Path) -> Result<()> {
    let path = pause_reason_path(log_dir);
    match fs::remove_file(&path) {
        Ok(()) => {
            info!(path = %path.display(), "pause record cleared");
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove pause record {}", path.display())),
    }
}

/// Markdown summary of the first round a driver invocation ran.
pub fn render_first_round_report(outcome: &RoundOutcome) -> String {
    let status = match outcome.status {
        RoundStatus::Success => "success",
        RoundStatus::Paused => "paused",
    };
    let (audit, rate) = match &outcome.audit {
        Some(audit) => (audit.reason.as_str(), format!("{:.2}%", audit.pass_rate)),
        None => ("not reached", "n/a".to_string()),
    };
    [
        "# First round report".to_string(),
        String::new(),
        format!("- Round: {}", outcome.round_id),
        format!("- Status: {status}"),
        format!("- Tool: {}", outcome.tool_used.as_deref().unwrap_or("none")),
        format!("- Audit: {audit}"),
        format!("- Test pass rate: {rate}"),
        format!("- Commit status: {}", outcome.commit_status),
        format!("- Commit: {}", outcome.commit_hash.as_deref().unwrap_or("n/a")),
        format!("- Message: {}", outcome.message),
    ]
    .join("\n")
        + "\n"
}

/// Overwrite `first_round_report.md` with the summary of `outcome`.
pub fn write_first_round_report(log_dir: &Path, outcome: &RoundOutcome) -> Result<PathBuf> {
    fs::create_dir_all(log_dir)
        .with_context(|| format!("create log dir {}", log_dir.display()))?;
    let path = log_dir.join(FIRST_ROUND_REPORT_FILE);
    fs::write(&path, render_first_round_report(outcome))
        .with_context(|| format!("write first round report {}", path.display()))?;
    info!(path = %path.display(), "first round report written");
    Ok(path)
}
