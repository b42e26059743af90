//! Per-invocation transcripts: a small header plus the captured output tail.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::core::types::ExecutionOutcome;

pub const TRANSCRIPT_DIR: &str = "transcripts";

/// Identifies one supervised invocation within a round.
#[derive(Debug, Clone, Copy)]
pub struct TranscriptKey<'a> {
    pub round_id: u32,
    pub tool_name: &'a str,
    pub tool_slug: &'a str,
    /// `bootstrap`, `remediation`, `task` or `resume`.
    pub phase: &'a str,
    pub attempt: u32,
}

#[derive(Debug, Clone)]
pub struct TranscriptWriter {
    dir: Option<PathBuf>,
}

impl TranscriptWriter {
    pub fn new(log_dir: &Path, enabled: bool) -> Self {
        Self {
            dir: enabled.then(|| log_dir.join(TRANSCRIPT_DIR)),
        }
    }

    /// Write a transcript; failures are logged, never propagated.
    pub fn record(&self, key: &TranscriptKey<'_>, outcome: &ExecutionOutcome) -> Option<PathBuf> {
        let dir = self.dir.as_ref()?;
        match write_transcript(dir, key, outcome, Utc::now()) {
            Ok(path) => {
                debug!(path = %path.display(), "transcript written");
                Some(path)
            }
            Err(err) => {
                warn!(err = %format!("{err:#}"), "failed to write transcript");
                None
            }
        }
    }
}

fn write_transcript(
    dir: &Path,
    key: &TranscriptKey<'_>,
    outcome: &ExecutionOutcome,
    at: DateTime<Utc>,
) -> Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    let path = dir.join(transcript_file_name(key, at));
    fs::write(&path, render_transcript(key, outcome, at))
        .with_context(|| format!("write transcript {}", path.display()))?;
    Ok(path)
}

pub fn transcript_file_name(key: &TranscriptKey<'_>, at: DateTime<Utc>) -> String {
    format!(
        "round{:04}_{}_{}_attempt{:02}_{}.log",
        key.round_id,
        key.tool_slug,
        key.phase,
        key.attempt.max(1),
        at.format("%Y%m%dT%H%M%SZ")
    )
}

fn render_transcript(key: &TranscriptKey<'_>, outcome: &ExecutionOutcome, at: DateTime<Utc>) -> String {
    let exit_code = outcome
        .exit_code
        .map_or_else(|| "none".to_string(), |code| code.to_string());
    let mut text = format!(
        "time_utc: {}\nround_id: {}\ntool: {}\nphase: {}\nattempt_no: {}\nreason: {}\nterminated: {}\nexit_code: {}\nduration_seconds: {:.2}\n---- output ----\n",
        at.to_rfc3339(),
        key.round_id,
        key.tool_name,
        key.phase,
        key.attempt.max(1),
        outcome.reason,
        outcome.terminated,
        exit_code,
        outcome.duration.as_secs_f64(),
    );
    for line in &outcome.output_lines {
        text.push_str(line);
        text.push('\n');
    }
    text
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::TimeZone;

    use super::*;
    use crate::core::types::TerminationReason;

    fn key() -> TranscriptKey<'static> {
        TranscriptKey {
            round_id: 3,
            tool_name: "Codex CLI",
            tool_slug: "codex_cli",
            phase: "task",
            attempt: 2,
        }
    }

    fn outcome() -> ExecutionOutcome {
        ExecutionOutcome {
            tool: "Codex CLI".to_string(),
            terminated: true,
            reason: TerminationReason::IdleTimeout,
            exit_code: None,
            duration: Duration::from_millis(31_500),
            output_lines: vec!["working".to_string(), "still working".to_string()],
            error_keyword: None,
            loop_detected: false,
            probe_sent: false,
        }
    }

    #[test]
    fn file_name_encodes_round_tool_phase_attempt() {
        let at = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).single().expect("time");
        assert_eq!(
            transcript_file_name(&key(), at),
            "round0003_codex_cli_task_attempt02_20260102T030405Z.log"
        );
    }

    #[test]
    fn transcript_has_header_and_output() {
        let temp = tempfile::tempdir().expect("tempdir");
        let writer = TranscriptWriter::new(temp.path(), true);
        let path = writer.record(&key(), &outcome()).expect("written");
        assert!(path.starts_with(temp.path().join(TRANSCRIPT_DIR)));
        let text = fs::read_to_string(path).expect("read");
        assert!(text.contains("reason: idle_timeout\n"));
        assert!(text.contains("exit_code: none\n"));
        assert!(text.contains("duration_seconds: 31.50\n"));
        assert!(text.ends_with("---- output ----\nworking\nstill working\n"));
    }

    #[test]
    fn disabled_writer_writes_nothing() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(TranscriptWriter::new(temp.path(), false).record(&key(), &outcome()).is_none());
        assert!(!temp.path().join(TRANSCRIPT_DIR).exists());
    }
}
