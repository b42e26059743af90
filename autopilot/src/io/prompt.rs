//! Prompt rendering for tool invocations.
//!
//! Templates are embedded at compile time and rendered with minijinja. The
//! rendered text is both written to a prompt file in the workspace and handed
//! to the invocation (inline argument or stdin, per descriptor).

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;
use tracing::debug;

use crate::io::config::AutopilotConfig;
use crate::io::tools::ToolDescriptor;

const TASK_TEMPLATE: &str = include_str!("prompts/task.md");
const BOOTSTRAP_TEMPLATE: &str = include_str!("prompts/bootstrap.md");
const REMEDIATION_TEMPLATE: &str = include_str!("prompts/remediation.md");
const RESUME_TEMPLATE: &str = include_str!("prompts/resume.md");

pub const BOOTSTRAP_PROMPT_PATH: &str = ".autopilot/bootstrap_prompt.md";
pub const REMEDIATION_PROMPT_PATH: &str = ".autopilot/remediation_prompt.md";
pub const RESUME_PROMPT_PATH: &str = ".autopilot/resume_prompt.md";

/// Prompt files besides the configured task prompt; never committed.
pub const AUXILIARY_PROMPT_PATHS: &[&str] = &[
    BOOTSTRAP_PROMPT_PATH,
    REMEDIATION_PROMPT_PATH,
    RESUME_PROMPT_PATH,
];

/// Report fields the tool is asked to write, with the hint shown in the prompt.
const REPORT_FIELDS: &[(&str, &str)] = &[
    ("run_status", "success or failed"),
    ("test_pass_rate", "number (0-100)"),
    ("core_optimization", "string, the core optimisation made"),
    ("iteration_value", "string, the value this iteration delivers"),
    ("test_summary", "string, summary of the test run"),
];

#[derive(Debug, Serialize)]
struct ReportField {
    name: &'static str,
    hint: &'static str,
}

#[derive(Debug, Serialize)]
struct Thresholds {
    files: usize,
    lines: u64,
}

/// Renders every prompt kind from one immutable configuration.
pub struct PromptRenderer<'a> {
    cfg: &'a AutopilotConfig,
    env: Environment<'static>,
}

impl<'a> PromptRenderer<'a> {
    pub fn new(cfg: &'a AutopilotConfig) -> Self {
        let mut env = Environment::new();
        env.add_template("task", TASK_TEMPLATE)
            .expect("task template should be valid");
        env.add_template("bootstrap", BOOTSTRAP_TEMPLATE)
            .expect("bootstrap template should be valid");
        env.add_template("remediation", REMEDIATION_TEMPLATE)
            .expect("remediation template should be valid");
        env.add_template("resume", RESUME_TEMPLATE)
            .expect("resume template should be valid");
        Self { cfg, env }
    }

    /// Main task prompt. `redo_reason` carries the previous rejection, if any.
    pub fn task(&self, report_path: &Path, redo_reason: Option<&str>) -> Result<String> {
        let changes = &self.cfg.changes;
        let thresholds = (changes.require_non_doc_changes || self.cfg.change_policy().has_threshold())
            .then_some(Thresholds {
                files: changes.min_non_doc_files,
                lines: changes.min_non_doc_lines,
            });
        let fields: Vec<ReportField> = REPORT_FIELDS
            .iter()
            .map(|&(name, hint)| ReportField { name, hint })
            .collect();
        let rendered = self.env.get_template("task")?.render(context! {
            caller => self.cfg.caller_name.trim(),
            project => self.cfg.project(),
            branch => self.cfg.branch.as_str(),
            repo_url => self.cfg.repo_url.as_str(),
            requirement => self.cfg.task_requirement.trim(),
            report_path => report_path.display().to_string(),
            report_fields => fields,
            thresholds => thresholds,
            redo_reason => non_blank(redo_reason),
        })?;
        Ok(rendered)
    }

    /// One-time initialization prompt for `tool`.
    pub fn bootstrap(&self, tool: &ToolDescriptor, workspace: &Path) -> Result<String> {
        let required: Vec<&str> = tool
            .bootstrap_required_paths
            .iter()
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .collect();
        let rendered = self.env.get_template("bootstrap")?.render(context! {
            slash_command => self.cfg.bootstrap.slash_command.as_str(),
            caller => self.cfg.caller_name.trim(),
            project => self.cfg.project(),
            branch => self.cfg.branch.as_str(),
            repo_url => self.cfg.repo_url.as_str(),
            workspace => workspace.display().to_string(),
            tool => tool.name.as_str(),
            required_paths => required,
        })?;
        Ok(rendered)
    }

    /// Follow-up bootstrap prompt naming the artifacts that are still missing.
    pub fn remediation(
        &self,
        tool: &ToolDescriptor,
        workspace: &Path,
        missing: &[String],
    ) -> Result<String> {
        let rendered = self.env.get_template("remediation")?.render(context! {
            slash_command => self.cfg.bootstrap.slash_command.as_str(),
            caller => self.cfg.caller_name.trim(),
            repo_url => self.cfg.repo_url.as_str(),
            workspace => workspace.display().to_string(),
            tool => tool.name.as_str(),
            missing_paths => missing,
        })?;
        Ok(rendered)
    }

    /// Continuation prompt for a resumed session.
    pub fn resume(&self, report_path: &Path, redo_reason: Option<&str>) -> Result<String> {
        let names: Vec<&str> = REPORT_FIELDS.iter().map(|(name, _)| *name).collect();
        let rendered = self.env.get_template("resume")?.render(context! {
            report_path => report_path.display().to_string(),
            report_field_names => names.join(", "),
            redo_reason => non_blank(redo_reason),
        })?;
        Ok(rendered)
    }
}

fn non_blank(text: Option<&str>) -> Option<&str> {
    text.map(str::trim).filter(|s| !s.is_empty())
}

/// Write `text` to `<workspace>/<relative>` and return the absolute-ish path.
pub fn write_prompt_file(workspace: &Path, relative: &str, text: &str) -> Result<PathBuf> {
    let path = workspace.join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create prompt dir {}", parent.display()))?;
    }
    fs::write(&path, text).with_context(|| format!("write prompt {}", path.display()))?;
    debug!(path = %path.display(), bytes = text.len(), "prompt written");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::tools::default_tools;

    fn config() -> AutopilotConfig {
        AutopilotConfig {
            repo_url: "https://github.com/acme/widgets.git".to_string(),
            task_requirement: "Speed up the parser".to_string(),
            ..AutopilotConfig::default()
        }
    }

    #[test]
    fn task_prompt_names_report_contract() {
        let cfg = config();
        let prompt = PromptRenderer::new(&cfg)
            .task(Path::new("/ws/.autopilot/report.json"), None)
            .expect("render");
        assert!(prompt.contains("Requirement for this round: Speed up the parser"));
        assert!(prompt.contains("/ws/.autopilot/report.json"));
        assert!(prompt.contains("   - test_pass_rate: number (0-100)"));
        assert!(prompt.contains("REPORT_READY"));
        assert!(!prompt.contains("previous audit"));
        assert!(!prompt.contains("Change threshold"));
    }

    #[test]
    fn task_prompt_carries_redo_reason_and_thresholds() {
        let mut cfg = config();
        cfg.changes.min_non_doc_files = 2;
        cfg.changes.min_non_doc_lines = 40;
        let prompt = PromptRenderer::new(&cfg)
            .task(Path::new("/ws/r.json"), Some("run status is not success (failed)"))
            .expect("render");
        assert!(prompt.contains("at least 2 non-doc files changed"));
        assert!(prompt.contains("at least 40 non-doc lines changed"));
        assert!(prompt.contains("rejected the run: run status is not success (failed)"));
    }

    #[test]
    fn bootstrap_and_remediation_list_paths() {
        let cfg = config();
        let codex = default_tools().remove(0);
        let renderer = PromptRenderer::new(&cfg);

        let bootstrap = renderer.bootstrap(&codex, Path::new("/ws")).expect("render");
        assert!(bootstrap.starts_with("/init"));
        assert!(bootstrap.contains("if missing: .codex"));
        assert!(bootstrap.contains("INIT_READY"));

        let remediation = renderer
            .remediation(&codex, Path::new("/ws"), &[".codex".to_string()])
            .expect("render");
        assert!(remediation.contains("- test -d .codex && ls -la .codex"));
    }

    #[test]
    fn resume_prompt_lists_field_names() {
        let cfg = config();
        let prompt = PromptRenderer::new(&cfg)
            .resume(Path::new("/ws/r.json"), Some("idle_timeout"))
            .expect("render");
        assert!(prompt.contains(
            "Report fields: run_status, test_pass_rate, core_optimization, iteration_value, test_summary"
        ));
        assert!(prompt.contains("Previous failure: idle_timeout"));
    }

    #[test]
    fn prompt_file_is_written_under_workspace() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write_prompt_file(temp.path(), RESUME_PROMPT_PATH, "hello").expect("write");
        assert_eq!(path, temp.path().join(".autopilot/resume_prompt.md"));
        assert_eq!(fs::read_to_string(path).expect("read"), "hello");
    }
}
