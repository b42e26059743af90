//! Test-only helpers: scripted tool and validation runners, and a temporary
//! bare remote seeded with one commit.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde_json::json;
use tempfile::TempDir;

use crate::core::types::{ExecutionOutcome, TerminationReason, TimeoutPolicy};
use crate::io::config::AutopilotConfig;
use crate::io::supervisor::ToolRunner;
use crate::io::tools::{CommandSpec, Invocation, ToolDescriptor};
use crate::io::validation::{ShellOutcome, ValidationRunner};

pub const FIXTURE_BRANCH: &str = "dev";
pub const SCRIPTED_TOOL: &str = "Scripted Tool";
const FIXTURE_REPORT_PATH: &str = ".autopilot/report.json";

/// One scripted tool invocation: files to write into the workspace, then the
/// outcome to return.
#[derive(Debug, Clone)]
pub struct ScriptedRun {
    pub terminated: bool,
    pub reason: TerminationReason,
    pub exit_code: Option<i32>,
    pub output: Vec<String>,
    pub files: Vec<(String, String)>,
}

impl ScriptedRun {
    pub fn completed() -> Self {
        Self {
            terminated: false,
            reason: TerminationReason::Completed,
            exit_code: Some(0),
            output: Vec::new(),
            files: Vec::new(),
        }
    }

    /// Process exited on its own with `code`.
    pub fn exited(code: i32) -> Self {
        Self {
            exit_code: Some(code),
            ..Self::completed()
        }
    }

    /// Supervisor stopped the process for `reason`.
    pub fn terminated(reason: TerminationReason) -> Self {
        Self {
            terminated: true,
            reason,
            exit_code: None,
            ..Self::completed()
        }
    }

    pub fn with_file(mut self, relative: &str, contents: &str) -> Self {
        self.files.push((relative.to_string(), contents.to_string()));
        self
    }

    /// Write `report` to the fixture report path.
    pub fn with_report(self, report: &str) -> Self {
        self.with_file(FIXTURE_REPORT_PATH, report)
    }

    pub fn with_output(mut self, lines: &[&str]) -> Self {
        self.output.extend(lines.iter().map(|line| line.to_string()));
        self
    }
}

/// Completion report JSON with the five required fields.
pub fn report_json(run_status: &str, pass_rate: f64, core: &str) -> String {
    json!({
        "run_status": run_status,
        "test_pass_rate": pass_rate,
        "core_optimization": core,
        "iteration_value": "scripted iteration",
        "test_summary": "scripted tests",
    })
    .to_string()
}

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub tool: String,
    pub spec: CommandSpec,
    /// `None` for interactive sessions.
    pub policy: Option<TimeoutPolicy>,
}

/// Tool runner that replays a fixed script. An exhausted script behaves like
/// a tool that cannot be spawned.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    script: RefCell<VecDeque<ScriptedRun>>,
    calls: RefCell<Vec<RecordedCall>>,
}

impl ScriptedRunner {
    pub fn new(script: Vec<ScriptedRun>) -> Self {
        Self {
            script: RefCell::new(script.into()),
            calls: RefCell::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.borrow().clone()
    }

    fn play(&self, tool: &str, spec: &CommandSpec, policy: Option<TimeoutPolicy>) -> ExecutionOutcome {
        self.calls.borrow_mut().push(RecordedCall {
            tool: tool.to_string(),
            spec: spec.clone(),
            policy,
        });
        let Some(run) = self.script.borrow_mut().pop_front() else {
            return ExecutionOutcome::spawn_failed(tool, "script exhausted");
        };
        for (relative, contents) in &run.files {
            let path = spec.workdir.join(relative);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).expect("create scripted file dir");
            }
            fs::write(&path, contents).expect("write scripted file");
        }
        let error_keyword = match &run.reason {
            TerminationReason::ErrorKeyword { keyword } => Some(keyword.clone()),
            _ => None,
        };
        ExecutionOutcome {
            tool: tool.to_string(),
            terminated: run.terminated,
            loop_detected: run.reason == TerminationReason::LoopDetected,
            reason: run.reason,
            exit_code: run.exit_code,
            duration: Duration::from_millis(10),
            output_lines: run.output,
            error_keyword,
            probe_sent: false,
        }
    }
}

impl ToolRunner for ScriptedRunner {
    fn run(&self, tool: &str, spec: &CommandSpec, policy: TimeoutPolicy) -> ExecutionOutcome {
        self.play(tool, spec, Some(policy))
    }

    fn run_interactive(&self, tool: &str, spec: &CommandSpec) -> ExecutionOutcome {
        self.play(tool, spec, None)
    }
}

/// Validation runner returning canned outcomes in order; once exhausted every
/// command reports "command not found".
#[derive(Debug, Default)]
pub struct ScriptedValidation {
    outcomes: RefCell<VecDeque<ShellOutcome>>,
    commands: RefCell<Vec<String>>,
}

impl ScriptedValidation {
    pub fn new(outcomes: Vec<ShellOutcome>) -> Self {
        Self {
            outcomes: RefCell::new(outcomes.into()),
            commands: RefCell::new(Vec::new()),
        }
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.borrow().clone()
    }
}

impl ValidationRunner for ScriptedValidation {
    fn run_shell(&self, _workdir: &Path, command: &str, _timeout: Duration) -> Result<ShellOutcome> {
        self.commands.borrow_mut().push(command.to_string());
        Ok(self.outcomes.borrow_mut().pop_front().unwrap_or_else(|| ShellOutcome {
            exit_code: 127,
            output: format!("bash: {command}: command not found"),
            timed_out: false,
        }))
    }
}

/// Descriptor for the scripted tool; the program never needs to exist.
pub fn scripted_tool() -> ToolDescriptor {
    ToolDescriptor {
        name: SCRIPTED_TOOL.to_string(),
        aliases: vec!["scripted".to_string()],
        enabled: true,
        batch: Invocation::new("scripted-tool", &["--prompt", "{prompt_file}", "--report", "{report_file}"]),
        interactive: Some(Invocation::new("scripted-tool", &["--interactive", "{prompt_text}"])),
        bootstrap: None,
        bootstrap_required_paths: Vec::new(),
        resume: None,
    }
}

/// A bare remote seeded with one commit on [`FIXTURE_BRANCH`], plus room for
/// the workspace and logs, all inside one temp dir.
pub struct TestRemote {
    temp: TempDir,
    remote: PathBuf,
}

impl TestRemote {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("create temp dir")?;
        let remote = temp.path().join("widgets.git");
        git(temp.path(), &["init", "-q", "--bare", "widgets.git"])?;

        let seed = temp.path().join("seed");
        fs::create_dir_all(seed.join("src")).context("create seed dir")?;
        git(&seed, &["init", "-q"])?;
        git(&seed, &["checkout", "-q", "-b", FIXTURE_BRANCH])?;
        fs::write(seed.join("README.md"), "# widgets\n").context("write readme")?;
        fs::write(seed.join("src/lib.rs"), "pub fn answer() -> u32 {\n    42\n}\n")
            .context("write lib")?;
        git(&seed, &["add", "-A"])?;
        git(&seed, &["commit", "-q", "-m", "seed"])?;
        let remote_str = remote.display().to_string();
        git(&seed, &["push", "-q", &remote_str, &format!("{FIXTURE_BRANCH}:{FIXTURE_BRANCH}")])?;
        git(&remote, &["symbolic-ref", "HEAD", &format!("refs/heads/{FIXTURE_BRANCH}")])?;
        Ok(Self { temp, remote })
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn remote(&self) -> &Path {
        &self.remote
    }

    pub fn log_dir(&self) -> PathBuf {
        self.temp.path().join("logs")
    }

    /// Config pointing at this remote with the scripted tool only, bootstrap
    /// and fallback reports off, and short git timeouts.
    pub fn config(&self) -> AutopilotConfig {
        let mut cfg = AutopilotConfig {
            repo_url: self.remote.display().to_string(),
            project_name: "widgets".to_string(),
            branch: FIXTURE_BRANCH.to_string(),
            working_root: self.temp.path().join("runtime"),
            log_dir: self.log_dir(),
            report_path: FIXTURE_REPORT_PATH.to_string(),
            tools: vec![scripted_tool()],
            ..AutopilotConfig::default()
        };
        cfg.bootstrap.enabled = false;
        cfg.fallback.enabled = false;
        cfg.timeouts.git_timeout_secs = 60;
        cfg
    }

    /// Install a pre-receive hook that rejects every push.
    #[cfg(unix)]
    pub fn reject_pushes(&self) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let hook = self.remote.join("hooks/pre-receive");
        fs::create_dir_all(self.remote.join("hooks")).context("create hooks dir")?;
        fs::write(&hook, "#!/bin/sh\necho 'push rejected by fixture' >&2\nexit 1\n")
            .context("write pre-receive hook")?;
        fs::set_permissions(&hook, fs::Permissions::from_mode(0o755)).context("chmod hook")?;
        Ok(())
    }

    /// Commit id at the tip of `branch` on the remote.
    pub fn head(&self, branch: &str) -> Result<String> {
        Ok(git(&self.remote, &["rev-parse", &format!("refs/heads/{branch}")])?
            .trim()
            .to_string())
    }

    /// Number of commits on `branch` in the remote.
    pub fn commit_count(&self, branch: &str) -> Result<usize> {
        let count = git(&self.remote, &["rev-list", "--count", &format!("refs/heads/{branch}")])?;
        count.trim().parse().context("parse commit count")
    }

    pub fn last_message(&self, branch: &str) -> Result<String> {
        Ok(git(&self.remote, &["log", "-1", "--format=%s", &format!("refs/heads/{branch}")])?
            .trim()
            .to_string())
    }

    /// Paths touched by the tip commit of `branch`.
    pub fn last_commit_files(&self, branch: &str) -> Result<Vec<String>> {
        let out = git(
            &self.remote,
            &["show", "--name-only", "--format=", &format!("refs/heads/{branch}")],
        )?;
        Ok(out.lines().filter(|l| !l.is_empty()).map(str::to_string).collect())
    }
}

fn git(dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(["-c", "user.name=Fixture", "-c", "user.email=fixture@example.com"])
        .args(["-c", "commit.gpgsign=false", "-c", "init.defaultBranch=main"])
        .args(args)
        .current_dir(dir)
        .output()
        .with_context(|| format!("spawn git {}", args.join(" ")))?;
    if !output.status.success() {
        bail!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
