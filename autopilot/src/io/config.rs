//! Autopilot configuration stored as TOML (default `autopilot.toml`).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::audit::AuditPolicy;
use crate::core::classifier::ChangePolicy;
use crate::core::monitor::MonitorSettings;
use crate::core::types::TimeoutPolicy;
use crate::io::tools::{ToolDescriptor, ToolRegistry, default_tools, validate_descriptor};

pub const DEFAULT_CONFIG_PATH: &str = "autopilot.toml";
pub const PLACEHOLDER_REPO_URL: &str = "https://github.com/<owner>/<repo>.git";
pub const DEFAULT_COMMIT_TEMPLATE: &str =
    "[autopilot] {{ project }}: {{ core }} | tests {{ rate }}% | changes: {{ changes }}";

/// Autopilot configuration (TOML).
///
/// Every field has a default so partial files merge over the built-in values.
/// The loaded value is immutable and passed by reference into each component.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AutopilotConfig {
    /// Remote repository to clone and push to.
    pub repo_url: String,
    /// Display name used in prompts and commit messages. Empty means the repo name.
    pub project_name: String,
    pub task_requirement: String,
    /// How the autopilot introduces itself to the tools.
    pub caller_name: String,
    pub branch: String,
    /// Directory holding the cloned workspace.
    pub working_root: PathBuf,
    /// Directory for round history, pause record, transcripts and markers.
    pub log_dir: PathBuf,
    pub loop_interval_secs: u64,
    /// Workspace-relative path of the completion report.
    pub report_path: String,
    /// Workspace-relative path of the task prompt.
    pub prompt_path: String,
    /// Untracked paths `git clean` must keep (tool-local state).
    pub preserve_untracked_paths: Vec<String>,
    /// Paths unstaged before the change gate classifies the diff.
    pub never_commit_paths: Vec<String>,
    /// minijinja template with `project`, `core`, `rate`, `changes`.
    pub commit_message_template: String,
    pub max_audit_failures_per_tool: u32,
    /// Environment variable holding a push token for https remotes.
    pub token_env: Option<String>,
    pub save_transcripts: bool,
    pub git_identity: GitIdentity,
    pub audit: AuditConfig,
    pub changes: ChangesConfig,
    pub timeouts: TimeoutsConfig,
    pub supervisor: SupervisorConfig,
    pub bootstrap: BootstrapConfig,
    pub resume: ResumeConfig,
    pub fallback: FallbackConfig,
    pub tools: Vec<ToolDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GitIdentity {
    pub name: String,
    pub email: String,
}

impl Default for GitIdentity {
    fn default() -> Self {
        Self {
            name: "autopilot".to_string(),
            email: "autopilot@localhost".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuditConfig {
    pub min_pass_rate: f64,
    /// Reject synthesized (fallback) reports.
    pub strict_require_real_report: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            min_pass_rate: 90.0,
            strict_require_real_report: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChangesConfig {
    pub require_code_changes: bool,
    pub require_non_doc_changes: bool,
    pub min_non_doc_files: usize,
    pub min_non_doc_lines: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimeoutsConfig {
    pub idle_secs: u64,
    pub probe_after_secs: u64,
    pub probe_wait_secs: u64,
    pub max_runtime_secs: u64,
    /// Wait after the graceful stop signal before killing.
    pub termination_grace_secs: u64,
    /// Supervisor poll cadence.
    pub poll_interval_ms: u64,
    /// Ceiling for each git command.
    pub git_timeout_secs: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            idle_secs: 30,
            probe_after_secs: 15 * 60,
            probe_wait_secs: 5 * 60,
            max_runtime_secs: 30 * 60,
            termination_grace_secs: 8,
            poll_interval_ms: 1000,
            git_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Case-insensitive deny-list; a hit stops the tool immediately.
    pub error_keywords: Vec<String>,
    pub loop_repeat_threshold: usize,
    pub auto_confirm_reply: String,
    pub auto_confirm_gap_secs: u64,
    pub probe_message: String,
    /// Captured output lines kept per invocation.
    pub output_tail_lines: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            error_keywords: [
                "quota exceeded",
                "usage limit",
                "upgrade to pro",
                "authentication failed",
                "permission denied",
                "rate limit",
                "invalid api key",
                "command not found",
            ]
            .iter()
            .map(|kw| kw.to_string())
            .collect(),
            loop_repeat_threshold: 3,
            auto_confirm_reply: "yes".to_string(),
            auto_confirm_gap_secs: 2,
            probe_message: "Progress check: are you still working normally? \
                            Reply with your current progress percentage and estimated time remaining."
                .to_string(),
            output_tail_lines: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BootstrapConfig {
    pub enabled: bool,
    /// Re-run bootstrap even when a marker exists.
    pub force: bool,
    pub slash_command: String,
    pub idle_secs: u64,
    pub max_runtime_secs: u64,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            force: false,
            slash_command: "/init".to_string(),
            idle_secs: 60,
            max_runtime_secs: 10 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ResumeConfig {
    pub enabled: bool,
    pub max_attempts: u32,
}

impl Default for ResumeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FallbackConfig {
    pub enabled: bool,
    /// Run validation commands when synthesizing a report.
    pub run_validation: bool,
    /// Tried in order via `bash -lc` until one gives a pass/fail signal.
    pub validation_commands: Vec<String>,
    pub validation_timeout_secs: u64,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            run_validation: true,
            validation_commands: vec![
                "python -m pytest -q".to_string(),
                "pytest -q".to_string(),
                "npm test --silent".to_string(),
                "cargo test".to_string(),
                "make test".to_string(),
            ],
            validation_timeout_secs: 30 * 60,
        }
    }
}

impl Default for AutopilotConfig {
    fn default() -> Self {
        Self {
            repo_url: PLACEHOLDER_REPO_URL.to_string(),
            project_name: String::new(),
            task_requirement: "Run a full improvement iteration on the repository: analyse, \
                               optimise or refactor, run the project and the full test suite, \
                               and report verifiable results."
                .to_string(),
            caller_name: "the autopilot orchestrator".to_string(),
            branch: "dev".to_string(),
            working_root: PathBuf::from("./runtime"),
            log_dir: PathBuf::from("./logs"),
            loop_interval_secs: 3600,
            report_path: ".autopilot/report.json".to_string(),
            prompt_path: ".autopilot/task_prompt.md".to_string(),
            preserve_untracked_paths: [".codex/", ".gemini/", ".claude/", ".open-code/"]
                .iter()
                .map(|p| p.to_string())
                .collect(),
            never_commit_paths: [".autopilot/", ".codex/", ".gemini/", ".claude/", ".open-code/"]
                .iter()
                .map(|p| p.to_string())
                .collect(),
            commit_message_template: DEFAULT_COMMIT_TEMPLATE.to_string(),
            max_audit_failures_per_tool: 2,
            token_env: None,
            save_transcripts: true,
            git_identity: GitIdentity::default(),
            audit: AuditConfig::default(),
            changes: ChangesConfig::default(),
            timeouts: TimeoutsConfig::default(),
            supervisor: SupervisorConfig::default(),
            bootstrap: BootstrapConfig::default(),
            resume: ResumeConfig::default(),
            fallback: FallbackConfig::default(),
            tools: default_tools(),
        }
    }
}

impl AutopilotConfig {
    pub fn validate(&self) -> Result<()> {
        if is_placeholder_repo_url(&self.repo_url) {
            return Err(anyhow!(
                "repo_url must name a real repository (got {:?})",
                self.repo_url
            ));
        }
        if self.branch.trim().is_empty() {
            return Err(anyhow!("branch must be non-empty"));
        }
        if self.report_path.trim().is_empty() || self.prompt_path.trim().is_empty() {
            return Err(anyhow!("report_path and prompt_path must be non-empty"));
        }
        if self.max_audit_failures_per_tool == 0 {
            return Err(anyhow!("max_audit_failures_per_tool must be > 0"));
        }
        let t = &self.timeouts;
        if [
            t.idle_secs,
            t.probe_after_secs,
            t.probe_wait_secs,
            t.max_runtime_secs,
            t.poll_interval_ms,
            t.git_timeout_secs,
        ]
        .contains(&0)
        {
            return Err(anyhow!("timeouts must all be > 0"));
        }
        if self.bootstrap.idle_secs == 0 || self.bootstrap.max_runtime_secs == 0 {
            return Err(anyhow!("bootstrap timeouts must be > 0"));
        }
        if self.fallback.validation_timeout_secs == 0 {
            return Err(anyhow!("fallback.validation_timeout_secs must be > 0"));
        }
        if !(0.0..=100.0).contains(&self.audit.min_pass_rate) {
            return Err(anyhow!("audit.min_pass_rate must be within 0..=100"));
        }
        if self.supervisor.loop_repeat_threshold == 0 {
            return Err(anyhow!("supervisor.loop_repeat_threshold must be > 0"));
        }
        if self.supervisor.output_tail_lines == 0 {
            return Err(anyhow!("supervisor.output_tail_lines must be > 0"));
        }
        if !self.tools.iter().any(|tool| tool.enabled) {
            return Err(anyhow!("at least one enabled tool is required"));
        }
        for tool in &self.tools {
            validate_descriptor(tool)?;
        }
        Ok(())
    }

    /// Repository directory name derived from `repo_url`.
    pub fn repo_name(&self) -> String {
        repo_name_from_url(&self.repo_url)
    }

    pub fn project(&self) -> String {
        let name = self.project_name.trim();
        if name.is_empty() {
            self.repo_name()
        } else {
            name.to_string()
        }
    }

    pub fn workspace_dir(&self) -> PathBuf {
        self.working_root.join(self.repo_name())
    }

    pub fn registry(&self) -> ToolRegistry {
        ToolRegistry::new(self.tools.clone())
    }

    pub fn timeout_policy(&self) -> TimeoutPolicy {
        TimeoutPolicy {
            idle: Duration::from_secs(self.timeouts.idle_secs),
            probe_after: Duration::from_secs(self.timeouts.probe_after_secs),
            probe_wait: Duration::from_secs(self.timeouts.probe_wait_secs),
            max_runtime: Duration::from_secs(self.timeouts.max_runtime_secs),
        }
    }

    pub fn bootstrap_policy(&self) -> TimeoutPolicy {
        TimeoutPolicy::bootstrap(
            Duration::from_secs(self.bootstrap.idle_secs),
            Duration::from_secs(self.bootstrap.max_runtime_secs),
        )
    }

    pub fn monitor_settings(&self) -> MonitorSettings {
        MonitorSettings {
            error_keywords: self
                .supervisor
                .error_keywords
                .iter()
                .map(|kw| kw.trim().to_lowercase())
                .filter(|kw| !kw.is_empty())
                .collect(),
            loop_repeat_threshold: self.supervisor.loop_repeat_threshold,
            auto_confirm_gap: Duration::from_secs(self.supervisor.auto_confirm_gap_secs),
        }
    }

    pub fn audit_policy(&self) -> AuditPolicy {
        AuditPolicy {
            min_pass_rate: self.audit.min_pass_rate,
            strict_require_real_report: self.audit.strict_require_real_report,
        }
    }

    pub fn change_policy(&self) -> ChangePolicy {
        ChangePolicy {
            require_code_changes: self.changes.require_code_changes,
            require_non_doc_changes: self.changes.require_non_doc_changes,
            min_non_doc_files: self.changes.min_non_doc_files,
            min_non_doc_lines: self.changes.min_non_doc_lines,
        }
    }

    /// Paths never committed: the configured list plus the prompt and report files.
    pub fn never_commit_list(&self) -> Vec<String> {
        let mut paths: Vec<String> = Vec::new();
        let candidates = [self.prompt_path.as_str(), self.report_path.as_str()]
            .into_iter()
            .chain(crate::io::prompt::AUXILIARY_PROMPT_PATHS.iter().copied())
            .chain(self.never_commit_paths.iter().map(String::as_str));
        for raw in candidates {
            let path = raw.trim();
            if !path.is_empty() && !paths.iter().any(|p| p == path) {
                paths.push(path.to_string());
            }
        }
        paths
    }
}

pub fn is_placeholder_repo_url(url: &str) -> bool {
    let url = url.trim();
    url.is_empty() || url.contains('<') || url.contains('>')
}

pub fn repo_name_from_url(url: &str) -> String {
    let last = url.trim().trim_end_matches('/').rsplit(|c| c == '/' || c == ':').next().unwrap_or_default();
    let name = last.strip_suffix(".git").unwrap_or(last);
    if name.is_empty() {
        "workspace".to_string()
    } else {
        name.to_string()
    }
}

/// Load config from a TOML file and validate it.
///
/// If the file is missing, the defaults are validated instead.
pub fn load_config(path: &Path) -> Result<AutopilotConfig> {
    let cfg = read_config(path)?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Parse config without validating. Missing file yields defaults.
pub fn read_config(path: &Path) -> Result<AutopilotConfig> {
    if !path.exists() {
        return Ok(AutopilotConfig::default());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &AutopilotConfig) -> Result<()> {
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> AutopilotConfig {
        AutopilotConfig {
            repo_url: "https://github.com/acme/widgets.git".to_string(),
            ..AutopilotConfig::default()
        }
    }

    #[test]
    fn load_missing_returns_defaults_but_placeholder_fails_validation() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("missing.toml");
        assert_eq!(read_config(&path).expect("read"), AutopilotConfig::default());
        let err = load_config(&path).expect_err("placeholder");
        assert!(format!("{err:#}").contains("repo_url"));
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("autopilot.toml");
        let cfg = valid();
        write_config(&path, &cfg).expect("write");
        assert_eq!(load_config(&path).expect("load"), cfg);
    }

    #[test]
    fn partial_file_merges_over_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("autopilot.toml");
        fs::write(
            &path,
            r#"
repo_url = "https://github.com/acme/widgets.git"
branch = "main"

[audit]
min_pass_rate = 97.5

[timeouts]
idle_secs = 45
"#,
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.branch, "main");
        assert_eq!(cfg.audit.min_pass_rate, 97.5);
        assert_eq!(cfg.timeouts.idle_secs, 45);
        assert_eq!(cfg.timeouts.max_runtime_secs, 1800);
        assert_eq!(cfg.tools.len(), 4);
        assert_eq!(cfg.project(), "widgets");
    }

    #[test]
    fn custom_tools_replace_defaults() {
        let raw = r#"
repo_url = "git@github.com:acme/widgets.git"

[[tools]]
name = "Local Agent"
aliases = ["local"]

[tools.batch]
program = "agent"
args = ["--dir", "{workspace}", "--prompt", "{prompt_file}"]
"#;
        let cfg: AutopilotConfig = toml::from_str(raw).expect("parse");
        cfg.validate().expect("valid");
        assert_eq!(cfg.tools.len(), 1);
        assert!(cfg.tools[0].enabled);
        assert_eq!(cfg.repo_name(), "widgets");
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut cfg = valid();
        cfg.max_audit_failures_per_tool = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = valid();
        cfg.audit.min_pass_rate = 120.0;
        assert!(cfg.validate().is_err());

        let mut cfg = valid();
        cfg.timeouts.idle_secs = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = valid();
        cfg.supervisor.loop_repeat_threshold = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = valid();
        for tool in &mut cfg.tools {
            tool.enabled = false;
        }
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn repo_names() {
        assert_eq!(repo_name_from_url("https://github.com/acme/widgets.git"), "widgets");
        assert_eq!(repo_name_from_url("https://github.com/acme/widgets/"), "widgets");
        assert_eq!(repo_name_from_url("/srv/git/remote.git"), "remote");
        assert_eq!(repo_name_from_url(""), "workspace");
    }

    #[test]
    fn never_commit_list_includes_runtime_files_once() {
        let cfg = valid();
        let list = cfg.never_commit_list();
        assert_eq!(list[0], ".autopilot/task_prompt.md");
        assert_eq!(list[1], ".autopilot/report.json");
        assert_eq!(list.iter().filter(|p| p.as_str() == ".codex/").count(), 1);
    }
}
