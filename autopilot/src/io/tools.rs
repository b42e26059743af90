//! Tool registry: descriptors for the external coding CLIs the autopilot drives.
//!
//! Invocations are typed argument lists rather than shell strings. An argument
//! is either a literal or one of a fixed set of variables, so a malformed
//! template is rejected when the configuration is parsed.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Result, anyhow};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Default pattern for the session identifier printed by resumable CLIs.
pub const DEFAULT_SESSION_PATTERN: &str = r"session id:\s*([0-9a-fA-F-]{36})";

/// Variables an invocation argument can reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgVar {
    Workspace,
    PromptFile,
    PromptText,
    ReportFile,
    SessionId,
}

impl ArgVar {
    fn name(self) -> &'static str {
        match self {
            ArgVar::Workspace => "workspace",
            ArgVar::PromptFile => "prompt_file",
            ArgVar::PromptText => "prompt_text",
            ArgVar::ReportFile => "report_file",
            ArgVar::SessionId => "session_id",
        }
    }

    fn parse(name: &str) -> Option<Self> {
        match name {
            "workspace" => Some(ArgVar::Workspace),
            "prompt_file" => Some(ArgVar::PromptFile),
            "prompt_text" => Some(ArgVar::PromptText),
            "report_file" => Some(ArgVar::ReportFile),
            "session_id" => Some(ArgVar::SessionId),
            _ => None,
        }
    }
}

/// One argument of an invocation: a literal or a `{variable}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ArgToken {
    Literal(String),
    Var(ArgVar),
}

impl ArgToken {
    pub fn literal(value: impl Into<String>) -> Self {
        ArgToken::Literal(value.into())
    }
}

impl TryFrom<String> for ArgToken {
    type Error = String;

    fn try_from(raw: String) -> std::result::Result<Self, Self::Error> {
        let Some(name) = raw.strip_prefix('{').and_then(|rest| rest.strip_suffix('}')) else {
            return Ok(ArgToken::Literal(raw));
        };
        ArgVar::parse(name)
            .map(ArgToken::Var)
            .ok_or_else(|| format!("unknown invocation variable {{{name}}}"))
    }
}

impl From<ArgToken> for String {
    fn from(token: ArgToken) -> Self {
        match token {
            ArgToken::Literal(value) => value,
            ArgToken::Var(var) => format!("{{{}}}", var.name()),
        }
    }
}

/// How to launch a tool for one mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invocation {
    pub program: String,
    #[serde(default)]
    pub args: Vec<ArgToken>,
    /// Write the prompt text to the process input right after spawn.
    #[serde(default)]
    pub stdin_prompt: bool,
    /// Leave the input pipe open after the prompt so probes and confirmation
    /// replies can follow. Tools that read the prompt until end of input need
    /// this off.
    #[serde(default)]
    pub keep_stdin_open: bool,
}

impl Invocation {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args
                .iter()
                .map(|raw| {
                    ArgToken::try_from((*raw).to_string()).unwrap_or_else(|_| ArgToken::literal(*raw))
                })
                .collect(),
            stdin_prompt: false,
            keep_stdin_open: false,
        }
    }

    pub fn with_stdin_prompt(mut self) -> Self {
        self.stdin_prompt = true;
        self
    }
}

/// Optional session-continuation capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeCapability {
    /// Regex whose first capture group is the session identifier.
    #[serde(default = "default_session_pattern")]
    pub session_pattern: String,
    pub invocation: Invocation,
}

fn default_session_pattern() -> String {
    DEFAULT_SESSION_PATTERN.to_string()
}

impl ResumeCapability {
    /// First session identifier found in `lines`.
    pub fn extract_session_id(&self, lines: &[String]) -> Option<String> {
        let re = Regex::new(&self.session_pattern).ok()?;
        lines.iter().find_map(|line| {
            re.captures(line)
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str().to_string())
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvocationMode {
    Batch,
    Interactive,
    Bootstrap,
    Resume { session_id: String },
}

impl InvocationMode {
    pub fn label(&self) -> &'static str {
        match self {
            InvocationMode::Batch => "task",
            InvocationMode::Interactive => "interactive",
            InvocationMode::Bootstrap => "bootstrap",
            InvocationMode::Resume { .. } => "resume",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub batch: Invocation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interactive: Option<Invocation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap: Option<Invocation>,
    /// Workspace-relative paths that must exist after bootstrap.
    #[serde(default)]
    pub bootstrap_required_paths: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume: Option<ResumeCapability>,
}

fn default_true() -> bool {
    true
}

impl ToolDescriptor {
    /// Lowercase slug used in file names (`Codex CLI` -> `codex_cli`).
    pub fn slug(&self) -> String {
        let mut slug = String::new();
        for c in self.name.trim().to_lowercase().chars() {
            if c.is_ascii_alphanumeric() {
                slug.push(c);
            } else if !slug.ends_with('_') {
                slug.push('_');
            }
        }
        let slug = slug.trim_matches('_');
        if slug.is_empty() {
            "tool".to_string()
        } else {
            slug.to_string()
        }
    }

    /// True if `selector` names this tool (case-insensitive name or alias).
    pub fn matches(&self, selector: &str) -> bool {
        let selector = selector.trim().to_lowercase();
        !selector.is_empty()
            && (self.name.trim().to_lowercase() == selector
                || self.aliases.iter().any(|alias| alias.trim().to_lowercase() == selector))
    }

    /// Invocation for `mode`. Interactive and bootstrap fall back to batch;
    /// resume is `None` without the capability.
    pub fn invocation(&self, mode: &InvocationMode) -> Option<&Invocation> {
        match mode {
            InvocationMode::Batch => Some(&self.batch),
            InvocationMode::Interactive => Some(self.interactive.as_ref().unwrap_or(&self.batch)),
            InvocationMode::Bootstrap => Some(self.bootstrap.as_ref().unwrap_or(&self.batch)),
            InvocationMode::Resume { .. } => self.resume.as_ref().map(|cap| &cap.invocation),
        }
    }

    /// Build the concrete command for `mode`.
    pub fn command(&self, mode: &InvocationMode, ctx: &InvocationContext<'_>) -> Option<CommandSpec> {
        let invocation = self.invocation(mode)?;
        let session_id = match mode {
            InvocationMode::Resume { session_id } => session_id.as_str(),
            _ => "",
        };
        let args = invocation
            .args
            .iter()
            .map(|token| match token {
                ArgToken::Literal(value) => value.clone(),
                ArgToken::Var(ArgVar::Workspace) => ctx.workspace.display().to_string(),
                ArgToken::Var(ArgVar::PromptFile) => ctx.prompt_file.display().to_string(),
                ArgToken::Var(ArgVar::PromptText) => ctx.prompt_text.to_string(),
                ArgToken::Var(ArgVar::ReportFile) => ctx.report_file.display().to_string(),
                ArgToken::Var(ArgVar::SessionId) => session_id.to_string(),
            })
            .collect();
        Some(CommandSpec {
            program: invocation.program.clone(),
            args,
            stdin_payload: invocation.stdin_prompt.then(|| ctx.prompt_text.to_string()),
            keep_stdin_open: invocation.keep_stdin_open,
            workdir: ctx.workspace.to_path_buf(),
        })
    }

    pub fn program_available(&self) -> bool {
        find_in_path(&self.batch.program).is_some()
    }
}

/// Values substituted into invocation variables.
#[derive(Debug, Clone, Copy)]
pub struct InvocationContext<'a> {
    pub workspace: &'a Path,
    pub prompt_file: &'a Path,
    pub prompt_text: &'a str,
    pub report_file: &'a Path,
}

/// Fully rendered command for one supervised invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Written to the process input right after spawn.
    pub stdin_payload: Option<String>,
    /// Without this, input is closed once `stdin_payload` is written.
    pub keep_stdin_open: bool,
    pub workdir: PathBuf,
}

impl CommandSpec {
    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).current_dir(&self.workdir);
        cmd
    }
}

impl fmt::Display for CommandSpec {
    /// Program plus arguments, with long arguments (inline prompts) elided.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            if arg.chars().count() > 80 || arg.contains('\n') {
                write!(f, " <{} chars>", arg.chars().count())?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

fn find_in_path(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|segment| segment.join(program))
        .find(|candidate| candidate.is_file())
}

/// Ordered list of tool descriptors, highest priority first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolRegistry {
    tools: Vec<ToolDescriptor>,
}

impl ToolRegistry {
    pub fn new(tools: Vec<ToolDescriptor>) -> Self {
        Self { tools }
    }

    pub fn enabled(&self) -> impl Iterator<Item = &ToolDescriptor> {
        self.tools.iter().filter(|tool| tool.enabled)
    }

    pub fn is_empty(&self) -> bool {
        self.enabled().next().is_none()
    }

    pub fn find(&self, selector: &str) -> Option<&ToolDescriptor> {
        self.tools.iter().find(|tool| tool.matches(selector))
    }

    /// Keep only the selected tools, in selector order. Returns unknown selectors.
    pub fn restrict_to(&mut self, selectors: &[String]) -> Vec<String> {
        let (picked, unknown) = self.resolve(selectors);
        let mut remaining = std::mem::take(&mut self.tools);
        self.tools = picked
            .into_iter()
            .filter_map(|name| {
                let idx = remaining.iter().position(|tool| tool.name == name)?;
                Some(remaining.remove(idx))
            })
            .collect();
        info!(tools = ?self.names(), "restricted tool set");
        unknown
    }

    /// Move the selected tools to the front; others keep their relative order.
    /// Returns unknown selectors.
    pub fn reorder(&mut self, selectors: &[String]) -> Vec<String> {
        let (picked, unknown) = self.resolve(selectors);
        let mut remaining = std::mem::take(&mut self.tools);
        let mut ordered = Vec::with_capacity(remaining.len());
        for name in picked {
            if let Some(idx) = remaining.iter().position(|tool| tool.name == name) {
                ordered.push(remaining.remove(idx));
            }
        }
        ordered.extend(remaining);
        self.tools = ordered;
        info!(tools = ?self.names(), "reordered tool set");
        unknown
    }

    /// Drop disabled tools and tools whose program is not on `PATH`.
    pub fn retain_available(&mut self) -> Vec<String> {
        let mut dropped = Vec::new();
        self.tools.retain(|tool| {
            let keep = tool.enabled && tool.program_available();
            if !keep {
                debug!(tool = %tool.name, program = %tool.batch.program, "tool unavailable");
                dropped.push(tool.name.clone());
            }
            keep
        });
        dropped
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|tool| tool.name.clone()).collect()
    }

    fn resolve(&self, selectors: &[String]) -> (Vec<String>, Vec<String>) {
        let mut picked: Vec<String> = Vec::new();
        let mut unknown = Vec::new();
        for selector in selectors {
            match self.find(selector) {
                Some(tool) if !picked.contains(&tool.name) => picked.push(tool.name.clone()),
                Some(_) => {}
                None => unknown.push(selector.clone()),
            }
        }
        (picked, unknown)
    }
}

/// Built-in tool set, in default priority order.
pub fn default_tools() -> Vec<ToolDescriptor> {
    vec![
        ToolDescriptor {
            name: "Codex CLI".to_string(),
            aliases: vec!["codex".to_string()],
            enabled: true,
            batch: Invocation::new(
                "codex",
                &[
                    "exec",
                    "-s",
                    "workspace-write",
                    "-c",
                    "approval_policy=never",
                    "-c",
                    "model_reasoning_effort=high",
                    "-C",
                    "{workspace}",
                    "--skip-git-repo-check",
                    "-",
                ],
            )
            .with_stdin_prompt(),
            interactive: Some(Invocation::new(
                "codex",
                &["-c", "model_reasoning_effort=high", "-C", "{workspace}", "{prompt_text}"],
            )),
            bootstrap: None,
            bootstrap_required_paths: vec![".codex".to_string()],
            resume: Some(ResumeCapability {
                session_pattern: default_session_pattern(),
                invocation: Invocation::new(
                    "codex",
                    &[
                        "exec",
                        "resume",
                        "--full-auto",
                        "-c",
                        "approval_policy=never",
                        "-c",
                        "model_reasoning_effort=high",
                        "-c",
                        "sandbox_mode=workspace-write",
                        "{session_id}",
                        "-",
                    ],
                )
                .with_stdin_prompt(),
            }),
        },
        ToolDescriptor {
            name: "Gemini CLI".to_string(),
            aliases: vec!["gemini".to_string()],
            enabled: true,
            batch: Invocation::new("gemini", &["-y", "-o", "stream-json", "-p", "{prompt_text}"]),
            interactive: Some(Invocation::new("gemini", &[])),
            bootstrap: None,
            bootstrap_required_paths: Vec::new(),
            resume: None,
        },
        ToolDescriptor {
            name: "Open Code CLI".to_string(),
            aliases: vec![
                "open-code".to_string(),
                "opencode".to_string(),
                "open_code".to_string(),
            ],
            enabled: true,
            batch: Invocation::new(
                "open-code",
                &["--cwd", "{workspace}", "--prompt-file", "{prompt_file}"],
            ),
            interactive: Some(Invocation::new("open-code", &["--cwd", "{workspace}"])),
            bootstrap: None,
            bootstrap_required_paths: Vec::new(),
            resume: None,
        },
        ToolDescriptor {
            name: "Claude Code CLI".to_string(),
            aliases: vec![
                "claude".to_string(),
                "claude-code".to_string(),
                "claude_code".to_string(),
            ],
            enabled: true,
            batch: Invocation::new("claude", &["-p", "{prompt_text}"]),
            interactive: Some(Invocation::new("claude", &[])),
            bootstrap: None,
            bootstrap_required_paths: Vec::new(),
            resume: None,
        },
    ]
}

/// Validate one descriptor (non-empty program, compilable resume pattern).
pub fn validate_descriptor(tool: &ToolDescriptor) -> Result<()> {
    if tool.name.trim().is_empty() {
        return Err(anyhow!("tool name must be non-empty"));
    }
    let invocations = [
        Some(&tool.batch),
        tool.interactive.as_ref(),
        tool.bootstrap.as_ref(),
        tool.resume.as_ref().map(|cap| &cap.invocation),
    ];
    if invocations
        .into_iter()
        .flatten()
        .any(|invocation| invocation.program.trim().is_empty())
    {
        return Err(anyhow!("tool {} has an empty program", tool.name));
    }
    if let Some(resume) = &tool.resume {
        let re = Regex::new(&resume.session_pattern)
            .map_err(|err| anyhow!("tool {} resume pattern invalid: {err}", tool.name))?;
        if re.captures_len() < 2 {
            return Err(anyhow!(
                "tool {} resume pattern needs a capture group for the session id",
                tool.name
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(workspace: &'a Path, prompt_file: &'a Path, report: &'a Path) -> InvocationContext<'a> {
        InvocationContext {
            workspace,
            prompt_file,
            prompt_text: "do the task",
            report_file: report,
        }
    }

    #[test]
    fn arg_tokens_parse_variables() {
        assert_eq!(
            ArgToken::try_from("{workspace}".to_string()),
            Ok(ArgToken::Var(ArgVar::Workspace))
        );
        assert_eq!(
            ArgToken::try_from("--cwd".to_string()),
            Ok(ArgToken::Literal("--cwd".to_string()))
        );
        assert!(ArgToken::try_from("{repo_dir}".to_string()).is_err());
        assert_eq!(String::from(ArgToken::Var(ArgVar::SessionId)), "{session_id}");
    }

    #[test]
    fn unknown_variable_fails_deserialization() {
        let raw = r#"
            program = "tool"
            args = ["{nope}"]
        "#;
        assert!(toml::from_str::<Invocation>(raw).is_err());
    }

    #[test]
    fn command_substitutes_context() {
        let tools = default_tools();
        let codex = &tools[0];
        let workspace = Path::new("/work/repo");
        let prompt = Path::new("/work/repo/.autopilot/task_prompt.md");
        let report = Path::new("/work/repo/.autopilot/report.json");
        let spec = codex
            .command(&InvocationMode::Batch, &ctx(workspace, prompt, report))
            .expect("batch");
        assert_eq!(spec.program, "codex");
        assert!(spec.args.contains(&"/work/repo".to_string()));
        assert_eq!(spec.stdin_payload.as_deref(), Some("do the task"));
        assert!(!spec.keep_stdin_open);

        let claude = &tools[3];
        let spec = claude
            .command(&InvocationMode::Batch, &ctx(workspace, prompt, report))
            .expect("batch");
        assert_eq!(spec.args, vec!["-p".to_string(), "do the task".to_string()]);
        assert_eq!(spec.stdin_payload, None);
    }

    #[test]
    fn resume_requires_capability() {
        let tools = default_tools();
        let workspace = Path::new("/w");
        let mode = InvocationMode::Resume {
            session_id: "abc".to_string(),
        };
        let spec = tools[0]
            .command(&mode, &ctx(workspace, workspace, workspace))
            .expect("codex resumes");
        assert!(spec.args.contains(&"abc".to_string()));
        assert!(tools[1].command(&mode, &ctx(workspace, workspace, workspace)).is_none());
    }

    #[test]
    fn bootstrap_falls_back_to_batch() {
        let tools = default_tools();
        assert_eq!(tools[1].invocation(&InvocationMode::Bootstrap), Some(&tools[1].batch));
    }

    #[test]
    fn session_id_extraction() {
        let cap = default_tools()[0].resume.clone().expect("resume");
        let lines = vec![
            "model: x".to_string(),
            "session id: 0199a1b2-c3d4-7e5f-8a9b-0c1d2e3f4a5b".to_string(),
        ];
        assert_eq!(
            cap.extract_session_id(&lines).as_deref(),
            Some("0199a1b2-c3d4-7e5f-8a9b-0c1d2e3f4a5b")
        );
        assert_eq!(cap.extract_session_id(&["nothing".to_string()]), None);
    }

    #[test]
    fn registry_find_by_alias() {
        let registry = ToolRegistry::new(default_tools());
        assert_eq!(registry.find("CLAUDE-CODE").map(|t| t.name.as_str()), Some("Claude Code CLI"));
        assert_eq!(registry.find("gemini cli").map(|t| t.name.as_str()), Some("Gemini CLI"));
        assert!(registry.find("cursor").is_none());
    }

    #[test]
    fn registry_restrict_and_reorder() {
        let mut registry = ToolRegistry::new(default_tools());
        let unknown = registry.reorder(&["claude".to_string(), "bogus".to_string(), "gemini".to_string()]);
        assert_eq!(unknown, vec!["bogus".to_string()]);
        assert_eq!(
            registry.names(),
            vec!["Claude Code CLI", "Gemini CLI", "Codex CLI", "Open Code CLI"]
        );

        let unknown = registry.restrict_to(&["opencode".to_string(), "codex".to_string(), "codex".to_string()]);
        assert!(unknown.is_empty());
        assert_eq!(registry.names(), vec!["Open Code CLI", "Codex CLI"]);
    }

    #[test]
    fn slug_is_filesystem_safe() {
        let tools = default_tools();
        assert_eq!(tools[0].slug(), "codex_cli");
        assert_eq!(tools[3].slug(), "claude_code_cli");
    }

    #[test]
    fn validation_rejects_bad_descriptors() {
        let mut tool = default_tools().remove(0);
        assert!(validate_descriptor(&tool).is_ok());
        if let Some(resume) = tool.resume.as_mut() {
            resume.session_pattern = "session id: [0-9a-f-]+".to_string();
        }
        assert!(validate_descriptor(&tool).is_err());
        tool.resume = None;
        tool.batch.program = "  ".to_string();
        assert!(validate_descriptor(&tool).is_err());
    }

    #[test]
    fn retain_available_drops_missing_programs() {
        let mut tool = default_tools().remove(1);
        tool.name = "Missing".to_string();
        tool.batch.program = "definitely-not-a-real-binary-xyz".to_string();
        let mut registry = ToolRegistry::new(vec![tool]);
        assert_eq!(registry.retain_available(), vec!["Missing".to_string()]);
        assert!(registry.is_empty());
    }
}
