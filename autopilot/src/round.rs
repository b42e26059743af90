//! Round orchestration.
//!
//! A round resets the workspace to the remote baseline, then tries each enabled
//! tool in priority order: bootstrap once, then attempt → report → audit → gate
//! until the change is pushed, the tool's failure budget runs out, or the tool
//! call itself fails. Every failure is encoded in the returned [`RoundOutcome`].

use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};

use crate::core::audit::decide;
use crate::core::types::{
    AuditDecision, CommitClassification, ExecutionOutcome, RoundOutcome, RoundStatus,
};
use crate::gate::ChangeGate;
use crate::io::bootstrap::{BootstrapMarker, marker_path, missing_required_paths, write_marker};
use crate::io::config::AutopilotConfig;
use crate::io::prompt::{
    BOOTSTRAP_PROMPT_PATH, PromptRenderer, REMEDIATION_PROMPT_PATH, RESUME_PROMPT_PATH,
    write_prompt_file,
};
use crate::io::report::{ObtainedReport, ReportGateway, ReportSource, load_report};
use crate::io::supervisor::ToolRunner;
use crate::io::tools::{InvocationContext, InvocationMode, ToolDescriptor, ToolRegistry};
use crate::io::transcript::{TranscriptKey, TranscriptWriter};
use crate::io::validation::ValidationRunner;
use crate::io::workspace::Workspace;

pub const NO_TOOL_MESSAGE: &str = "no tool available (all failed, stalled, or rejected)";
pub const REPORT_MISSING_REASON: &str = "no valid report (JSON missing or malformed)";

/// How one audited attempt ended.
#[derive(Debug)]
enum Settlement {
    Finished(RoundOutcome),
    Rejected {
        audit: AuditDecision,
        reason: String,
        rollback: bool,
    },
}

pub struct RoundOrchestrator<'a> {
    cfg: &'a AutopilotConfig,
    registry: ToolRegistry,
    workspace: Workspace,
    runner: &'a dyn ToolRunner,
    validator: &'a dyn ValidationRunner,
    prompts: PromptRenderer<'a>,
    transcripts: TranscriptWriter,
}

impl<'a> RoundOrchestrator<'a> {
    pub fn new(
        cfg: &'a AutopilotConfig,
        registry: ToolRegistry,
        workspace: Workspace,
        runner: &'a dyn ToolRunner,
        validator: &'a dyn ValidationRunner,
    ) -> Self {
        Self {
            cfg,
            registry,
            workspace,
            runner,
            validator,
            prompts: PromptRenderer::new(cfg),
            transcripts: TranscriptWriter::new(&cfg.log_dir, cfg.save_transcripts),
        }
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// One batch round across every enabled tool.
    #[instrument(skip_all, fields(round_id = round_id))]
    pub fn run_round(&self, round_id: u32) -> RoundOutcome {
        info!(tools = ?self.registry.names(), "round started");
        if let Err(err) = self.workspace.sync() {
            error!(err = %format!("{err:#}"), "workspace sync failed");
            return RoundOutcome::paused(round_id, None, format!("workspace sync failed: {err:#}"));
        }
        for tool in self.registry.enabled() {
            if let Some(outcome) = self.run_tool(round_id, tool) {
                return outcome;
            }
        }
        warn!("every tool exhausted");
        RoundOutcome::paused(round_id, None, NO_TOOL_MESSAGE)
    }

    #[instrument(skip_all, fields(tool = %tool.name))]
    fn run_tool(&self, round_id: u32, tool: &ToolDescriptor) -> Option<RoundOutcome> {
        if let Err(err) = self.workspace.refresh() {
            warn!(err = %format!("{err:#}"), "refresh failed, skipping tool");
            return None;
        }
        if !self.ensure_bootstrap(round_id, tool) {
            warn!("bootstrap failed, skipping tool");
            return None;
        }

        let max_failures = self.cfg.max_audit_failures_per_tool;
        let mut failures = 0u32;
        let mut attempt_no = 0u32;
        let mut redo: Option<String> = None;
        while failures < max_failures {
            attempt_no += 1;
            if let Err(err) = self.workspace.refresh() {
                warn!(err = %format!("{err:#}"), "refresh failed, switching tool");
                break;
            }
            let (outcome, obtained) =
                self.attempt(round_id, tool, attempt_no, redo.as_deref(), InvocationMode::Batch);
            if outcome.is_call_failure() {
                warn!(reason = %outcome.failure_reason(), "tool call failed, switching tool");
                break;
            }
            let Some(obtained) = obtained else {
                failures += 1;
                warn!(failures, max_failures, "no report obtained");
                redo = Some(REPORT_MISSING_REASON.to_string());
                continue;
            };

            match self.settle(round_id, tool, &obtained) {
                Settlement::Finished(outcome) => return Some(outcome),
                Settlement::Rejected {
                    reason, rollback, ..
                } => {
                    failures += 1;
                    warn!(failures, max_failures, reason = %reason, "attempt rejected");
                    if rollback && failures >= max_failures {
                        self.roll_back();
                    }
                    redo = Some(reason);
                }
            }
        }
        None
    }

    /// Interactive round: up to `max_turns` turns against the selected tool.
    ///
    /// A turn whose session exits unsuccessfully without a report is retried
    /// once in batch mode.
    #[instrument(skip_all, fields(round_id = round_id, selector = %selector))]
    pub fn run_interactive_round(&self, round_id: u32, selector: &str, max_turns: u32) -> RoundOutcome {
        let Some(tool) = self.registry.find(selector) else {
            return RoundOutcome::paused(round_id, None, format!("unknown tool: {selector}"));
        };
        let tool_used = Some(tool.name.clone());
        if let Err(err) = self.workspace.sync() {
            error!(err = %format!("{err:#}"), "workspace sync failed");
            return RoundOutcome::paused(round_id, tool_used, format!("workspace sync failed: {err:#}"));
        }
        if !self.ensure_bootstrap(round_id, tool) {
            return RoundOutcome::paused(round_id, tool_used, format!("bootstrap failed for {}", tool.name));
        }

        let max_turns = max_turns.max(1);
        let mut redo: Option<String> = None;
        let mut last_audit: Option<AuditDecision> = None;
        for turn in 1..=max_turns {
            if let Err(err) = self.workspace.refresh() {
                warn!(err = %format!("{err:#}"), "refresh failed");
                return RoundOutcome::paused(round_id, tool_used, format!("workspace refresh failed: {err:#}"));
            }
            info!(turn, max_turns, "interactive turn");
            let (outcome, obtained) = self.interactive_turn(round_id, tool, turn, redo.as_deref());
            let Some(obtained) = obtained else {
                let reason = if outcome.is_call_failure() {
                    format!("tool call failed ({})", outcome.failure_reason())
                } else {
                    REPORT_MISSING_REASON.to_string()
                };
                warn!(turn, reason = %reason, "turn produced no report");
                redo = Some(reason);
                continue;
            };
            match self.settle(round_id, tool, &obtained) {
                Settlement::Finished(outcome) => return outcome,
                Settlement::Rejected {
                    audit,
                    reason,
                    rollback,
                } => {
                    warn!(turn, reason = %reason, "turn rejected");
                    if rollback && turn == max_turns {
                        self.roll_back();
                    }
                    last_audit = Some(audit);
                    redo = Some(reason);
                }
            }
        }

        let reason = redo.unwrap_or_default();
        RoundOutcome {
            audit: last_audit,
            ..RoundOutcome::paused(
                round_id,
                tool_used,
                format!("interactive turns exhausted ({max_turns}): {reason}"),
            )
        }
    }

    fn interactive_turn(
        &self,
        round_id: u32,
        tool: &ToolDescriptor,
        turn: u32,
        redo: Option<&str>,
    ) -> (ExecutionOutcome, Option<ObtainedReport>) {
        let (outcome, obtained) = self.attempt(round_id, tool, turn, redo, InvocationMode::Interactive);
        if obtained.is_none() && outcome.is_call_failure() {
            info!(reason = %outcome.failure_reason(), "interactive session left no report, retrying in batch mode");
            return self.attempt(round_id, tool, turn, redo, InvocationMode::Batch);
        }
        (outcome, obtained)
    }

    /// Audit the report and, when approved, run the change gate.
    fn settle(&self, round_id: u32, tool: &ToolDescriptor, obtained: &ObtainedReport) -> Settlement {
        let audit = decide(&obtained.report, &self.cfg.audit_policy());
        info!(
            approved = audit.approved,
            run_success = audit.run_success,
            pass_rate = audit.pass_rate,
            source = ?obtained.source,
            reason = %audit.reason,
            "audit decided"
        );
        if !audit.approved {
            let rollback = !audit.run_success;
            let reason = audit.reason.clone();
            return Settlement::Rejected {
                audit,
                reason,
                rollback,
            };
        }

        let gate = ChangeGate::new(self.cfg, &self.workspace).run(&audit);
        let classification = gate.classification;
        if classification.is_fatal() {
            error!(%classification, detail = ?gate.detail, "change gate failed");
            return Settlement::Finished(RoundOutcome {
                round_id,
                status: RoundStatus::Paused,
                tool_used: Some(tool.name.clone()),
                audit: Some(audit),
                commit_status: classification,
                commit_hash: gate.commit_hash,
                message: format!("commit or push failed: {classification}"),
            });
        }

        let changes = &self.cfg.changes;
        let rejection = match classification {
            CommitClassification::NoChanges if changes.require_code_changes => {
                Some("no code changes this round (require_code_changes=true)".to_string())
            }
            CommitClassification::DocsOnly if changes.require_non_doc_changes => {
                Some("docs-only changes (require_non_doc_changes=true)".to_string())
            }
            CommitClassification::BelowThreshold => {
                let tally = gate.tally.unwrap_or_default();
                Some(format!(
                    "non-doc changes below threshold: {} files / {} lines (minimum {} files / {} lines)",
                    tally.files, tally.lines, changes.min_non_doc_files, changes.min_non_doc_lines
                ))
            }
            _ => None,
        };
        if let Some(reason) = rejection {
            return Settlement::Rejected {
                audit,
                reason,
                rollback: false,
            };
        }

        let message = match classification {
            CommitClassification::Pushed => "approved and pushed",
            CommitClassification::DocsOnly => "approved but docs-only",
            _ => "approved but no code changes",
        };
        info!(%classification, commit = ?gate.commit_hash, "round succeeded");
        Settlement::Finished(RoundOutcome {
            round_id,
            status: RoundStatus::Success,
            tool_used: Some(tool.name.clone()),
            audit: Some(audit),
            commit_status: classification,
            commit_hash: gate.commit_hash,
            message: message.to_string(),
        })
    }

    /// Run the tool's one-time initialization unless its marker is current.
    ///
    /// One remediation invocation is allowed when required paths are still
    /// missing afterwards.
    #[instrument(skip_all, fields(tool = %tool.name))]
    fn ensure_bootstrap(&self, round_id: u32, tool: &ToolDescriptor) -> bool {
        let settings = &self.cfg.bootstrap;
        if !settings.enabled {
            return true;
        }
        let ws = self.workspace.dir();
        let marker = marker_path(&self.cfg.log_dir, ws, tool);
        let missing = missing_required_paths(tool, ws);
        if marker.exists() && !settings.force && missing.is_empty() {
            debug!(marker = %marker.display(), "bootstrap already complete");
            return true;
        }
        info!(missing = ?missing, force = settings.force, "running bootstrap");

        let prompt = match self.prompts.bootstrap(tool, ws) {
            Ok(prompt) => prompt,
            Err(err) => {
                error!(err = %format!("{err:#}"), "render bootstrap prompt");
                return false;
            }
        };
        let slug = tool.slug();
        let first = self.invoke(
            tool,
            &InvocationMode::Bootstrap,
            TranscriptKey {
                round_id,
                tool_name: &tool.name,
                tool_slug: &slug,
                phase: "bootstrap",
                attempt: 1,
            },
            BOOTSTRAP_PROMPT_PATH,
            &prompt,
        );
        if first.is_call_failure() {
            warn!(reason = %first.failure_reason(), "bootstrap invocation failed");
            return false;
        }

        let missing = missing_required_paths(tool, ws);
        if !missing.is_empty() {
            warn!(missing = ?missing, "required paths missing after bootstrap, remediating");
            let prompt = match self.prompts.remediation(tool, ws, &missing) {
                Ok(prompt) => prompt,
                Err(err) => {
                    error!(err = %format!("{err:#}"), "render remediation prompt");
                    return false;
                }
            };
            let fix = self.invoke(
                tool,
                &InvocationMode::Bootstrap,
                TranscriptKey {
                    round_id,
                    tool_name: &tool.name,
                    tool_slug: &slug,
                    phase: "remediation",
                    attempt: 1,
                },
                REMEDIATION_PROMPT_PATH,
                &prompt,
            );
            if fix.is_call_failure() {
                warn!(reason = %fix.failure_reason(), "remediation invocation failed");
                return false;
            }
            let still_missing = missing_required_paths(tool, ws);
            if !still_missing.is_empty() {
                warn!(missing = ?still_missing, "required paths still missing");
                return false;
            }
        }

        if let Err(err) = write_marker(&marker, &BootstrapMarker::new(tool, &first, Utc::now())) {
            warn!(err = %format!("{err:#}"), "failed to write bootstrap marker");
        }
        info!("bootstrap complete");
        true
    }

    /// One task invocation plus report retrieval.
    ///
    /// Batch call failures skip report retrieval entirely; an interactive
    /// session may still have left a report behind.
    fn attempt(
        &self,
        round_id: u32,
        tool: &ToolDescriptor,
        attempt_no: u32,
        redo: Option<&str>,
        mode: InvocationMode,
    ) -> (ExecutionOutcome, Option<ObtainedReport>) {
        let ws = self.workspace.dir();
        let gateway = ReportGateway::new(
            ws,
            &self.cfg.report_path,
            &self.cfg.resume,
            &self.cfg.fallback,
            self.validator,
        );
        if let Err(err) = gateway.prepare() {
            warn!(err = %format!("{err:#}"), "failed to prepare report path");
            return (
                ExecutionOutcome::spawn_failed(&tool.name, format!("prepare report path: {err:#}")),
                None,
            );
        }
        let report_path = gateway.report_path().to_path_buf();
        let prompt = match self.prompts.task(&report_path, redo) {
            Ok(prompt) => prompt,
            Err(err) => {
                error!(err = %format!("{err:#}"), "render task prompt");
                return (
                    ExecutionOutcome::spawn_failed(&tool.name, format!("render task prompt: {err:#}")),
                    None,
                );
            }
        };

        let slug = tool.slug();
        let interactive = mode == InvocationMode::Interactive;
        let outcome = self.invoke(
            tool,
            &mode,
            TranscriptKey {
                round_id,
                tool_name: &tool.name,
                tool_slug: &slug,
                phase: if interactive { "interactive" } else { "task" },
                attempt: attempt_no,
            },
            &self.cfg.prompt_path,
            &prompt,
        );
        if outcome.is_call_failure() {
            let leftover = if interactive { load_report(&report_path) } else { None };
            return (
                outcome,
                leftover.map(|report| ObtainedReport {
                    report,
                    source: ReportSource::Tool,
                }),
            );
        }

        let resume = |session_id: &str, resume_no: u32| {
            let prompt = match self.prompts.resume(&report_path, redo) {
                Ok(prompt) => prompt,
                Err(err) => {
                    error!(err = %format!("{err:#}"), "render resume prompt");
                    return None;
                }
            };
            Some(self.invoke(
                tool,
                &InvocationMode::Resume {
                    session_id: session_id.to_string(),
                },
                TranscriptKey {
                    round_id,
                    tool_name: &tool.name,
                    tool_slug: &slug,
                    phase: "resume",
                    attempt: resume_no,
                },
                RESUME_PROMPT_PATH,
                &prompt,
            ))
        };
        let obtained = gateway.obtain(tool, &outcome, resume);
        (outcome, obtained)
    }

    /// Write the prompt, build the command for `mode` and run it.
    fn invoke(
        &self,
        tool: &ToolDescriptor,
        mode: &InvocationMode,
        key: TranscriptKey<'_>,
        prompt_rel: &str,
        prompt_text: &str,
    ) -> ExecutionOutcome {
        let ws = self.workspace.dir();
        let prompt_file = match write_prompt_file(ws, prompt_rel, prompt_text) {
            Ok(path) => path,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "failed to write prompt file");
                return ExecutionOutcome::spawn_failed(&tool.name, format!("write prompt: {err:#}"));
            }
        };
        let report_file = ws.join(&self.cfg.report_path);
        let ctx = InvocationContext {
            workspace: ws,
            prompt_file: &prompt_file,
            prompt_text,
            report_file: &report_file,
        };
        let Some(spec) = tool.command(mode, &ctx) else {
            return ExecutionOutcome::spawn_failed(
                &tool.name,
                format!("no {} invocation configured", mode.label()),
            );
        };

        info!(phase = key.phase, attempt = key.attempt, command = %spec, "invoking tool");
        let outcome = match mode {
            InvocationMode::Interactive => self.runner.run_interactive(&tool.name, &spec),
            InvocationMode::Bootstrap => {
                self.runner.run(&tool.name, &spec, self.cfg.bootstrap_policy())
            }
            _ => self.runner.run(&tool.name, &spec, self.cfg.timeout_policy()),
        };
        info!(
            phase = key.phase,
            reason = %outcome.reason,
            exit_code = ?outcome.exit_code,
            duration_secs = outcome.duration.as_secs(),
            "tool finished"
        );
        self.transcripts.record(&key, &outcome);
        outcome
    }

    fn roll_back(&self) {
        warn!("failure budget exhausted after failed runs, rolling back workspace");
        if let Err(err) = self.workspace.rollback() {
            warn!(err = %format!("{err:#}"), "rollback failed");
        }
    }
}
