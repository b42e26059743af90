//! Bootstrap markers: one file per (workspace, tool) recording a completed
//! one-time initialization.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::types::ExecutionOutcome;
use crate::io::tools::ToolDescriptor;

pub const BOOTSTRAP_DIR: &str = "bootstrap";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootstrapMarker {
    pub ts: String,
    pub tool: String,
    pub duration_seconds: f64,
    pub exit_code: Option<i32>,
    pub reason: String,
    pub required_paths: Vec<String>,
}

impl BootstrapMarker {
    pub fn new(tool: &ToolDescriptor, outcome: &ExecutionOutcome, at: DateTime<Utc>) -> Self {
        Self {
            ts: at.to_rfc3339(),
            tool: tool.name.clone(),
            duration_seconds: (outcome.duration.as_secs_f64() * 100.0).round() / 100.0,
            exit_code: outcome.exit_code,
            reason: outcome.reason.to_string(),
            required_paths: tool.bootstrap_required_paths.clone(),
        }
    }
}

/// `<log_dir>/bootstrap/<workspace-name>/<tool-slug>.json`.
pub fn marker_path(log_dir: &Path, workspace: &Path, tool: &ToolDescriptor) -> PathBuf {
    let workspace_name = workspace
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "workspace".to_string());
    log_dir
        .join(BOOTSTRAP_DIR)
        .join(workspace_name)
        .join(format!("{}.json", tool.slug()))
}

/// Required artifacts that do not exist under `workspace`.
pub fn missing_required_paths(tool: &ToolDescriptor, workspace: &Path) -> Vec<String> {
    tool.bootstrap_required_paths
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty() && !workspace.join(p).exists())
        .map(str::to_string)
        .collect()
}

pub fn write_marker(path: &Path, marker: &BootstrapMarker) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create marker dir {}", parent.display()))?;
    }
    let mut buf = serde_json::to_string_pretty(marker)?;
    buf.push('\n');
    fs::write(path, buf).with_context(|| format!("write marker {}", path.display()))?;
    debug!(path = %path.display(), "bootstrap marker written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::TimeZone;

    use super::*;
    use crate::core::types::TerminationReason;
    use crate::io::tools::default_tools;

    #[test]
    fn marker_path_uses_workspace_name_and_slug() {
        let codex = default_tools().remove(0);
        assert_eq!(
            marker_path(Path::new("/logs"), Path::new("/runtime/widgets"), &codex),
            PathBuf::from("/logs/bootstrap/widgets/codex_cli.json")
        );
    }

    #[test]
    fn missing_paths_track_workspace() {
        let temp = tempfile::tempdir().expect("tempdir");
        let codex = default_tools().remove(0);
        assert_eq!(missing_required_paths(&codex, temp.path()), vec![".codex"]);
        fs::create_dir(temp.path().join(".codex")).expect("mkdir");
        assert!(missing_required_paths(&codex, temp.path()).is_empty());
    }

    #[test]
    fn marker_is_pretty_json() {
        let temp = tempfile::tempdir().expect("tempdir");
        let codex = default_tools().remove(0);
        let outcome = ExecutionOutcome {
            tool: codex.name.clone(),
            terminated: false,
            reason: TerminationReason::Completed,
            exit_code: Some(0),
            duration: Duration::from_millis(12_346),
            output_lines: Vec::new(),
            error_keyword: None,
            loop_detected: false,
            probe_sent: false,
        };
        let at = Utc.with_ymd_and_hms(2026, 2, 3, 4, 5, 6).single().expect("time");
        let path = temp.path().join("m/codex_cli.json");
        write_marker(&path, &BootstrapMarker::new(&codex, &outcome, at)).expect("write");

        let text = fs::read_to_string(&path).expect("read");
        assert!(text.ends_with("}\n"));
        let marker: BootstrapMarker = serde_json::from_str(&text).expect("parse");
        assert_eq!(marker.duration_seconds, 12.35);
        assert_eq!(marker.reason, "completed");
        assert_eq!(marker.required_paths, vec![".codex"]);
    }
}
