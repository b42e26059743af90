//! Change gate: turn an approved run's working tree into a commit and push.
//!
//! Stage everything, unstage the never-commit list, classify the staged diff,
//! and only commit and push substantive changes. Git failures are returned as
//! fatal classifications, never as errors.

use minijinja::{Environment, context};
use tracing::{info, instrument, warn};

use crate::core::classifier::{
    ChangePolicy, ChangeVerdict, NonDocTally, StagedChangeSet, classify, needs_line_counts,
    parse_name_status, parse_numstat, summarize_changes,
};
use crate::core::signals::truncate_chars;
use crate::core::types::{AuditDecision, CommitClassification};
use crate::io::config::{AutopilotConfig, DEFAULT_COMMIT_TEMPLATE};
use crate::io::workspace::Workspace;

const CORE_SUMMARY_MAX_CHARS: usize = 30;
const DEFAULT_CORE: &str = "routine improvement";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateOutcome {
    pub classification: CommitClassification,
    /// Set once a commit exists, including when its push failed.
    pub commit_hash: Option<String>,
    pub changes: String,
    pub tally: Option<NonDocTally>,
    /// Redacted git error for fatal classifications.
    pub detail: Option<String>,
}

impl GateOutcome {
    fn new(classification: CommitClassification, changes: String) -> Self {
        Self {
            classification,
            commit_hash: None,
            changes,
            tally: None,
            detail: None,
        }
    }

    fn failed(classification: CommitClassification, err: &anyhow::Error) -> Self {
        Self {
            detail: Some(format!("{err:#}")),
            ..Self::new(classification, String::new())
        }
    }
}

pub struct ChangeGate<'a> {
    workspace: &'a Workspace,
    policy: ChangePolicy,
    never_commit: Vec<String>,
    project: String,
    template: String,
}

impl<'a> ChangeGate<'a> {
    pub fn new(cfg: &AutopilotConfig, workspace: &'a Workspace) -> Self {
        Self {
            workspace,
            policy: cfg.change_policy(),
            never_commit: cfg.never_commit_list(),
            project: cfg.project(),
            template: cfg.commit_message_template.clone(),
        }
    }

    #[instrument(skip_all, fields(branch = %self.workspace.branch()))]
    pub fn run(&self, audit: &AuditDecision) -> GateOutcome {
        let git = self.workspace.git();
        if let Err(err) = git.add_all() {
            warn!(err = %format!("{err:#}"), "staging failed");
            return GateOutcome::failed(CommitClassification::StageFailed, &err);
        }
        for path in &self.never_commit {
            if let Err(err) = git.unstage(path) {
                warn!(path, err = %format!("{err:#}"), "unstage failed");
                return GateOutcome::failed(CommitClassification::StageFailed, &err);
            }
        }

        let mut changes = match git.staged_name_status() {
            Ok(output) => StagedChangeSet {
                entries: parse_name_status(&output),
                line_counts: None,
            },
            Err(err) => {
                warn!(err = %format!("{err:#}"), "staged diff failed");
                return GateOutcome::failed(CommitClassification::DiffFailed, &err);
            }
        };
        if needs_line_counts(&changes.entries, &self.policy) {
            match git.staged_numstat() {
                Ok(output) => changes.line_counts = Some(parse_numstat(&output)),
                Err(err) => {
                    warn!(err = %format!("{err:#}"), "staged numstat failed");
                    return GateOutcome::failed(CommitClassification::DiffFailed, &err);
                }
            }
        }

        let summary = summarize_changes(&changes.entries);
        match classify(&changes, &self.policy) {
            ChangeVerdict::NoChanges => {
                info!("no staged changes");
                return GateOutcome::new(CommitClassification::NoChanges, summary);
            }
            ChangeVerdict::DocsOnly => {
                info!(changes = %summary, "documentation-only changes");
                return GateOutcome::new(CommitClassification::DocsOnly, summary);
            }
            ChangeVerdict::BelowThreshold(tally) => {
                info!(
                    non_doc_files = tally.files,
                    non_doc_lines = tally.lines,
                    min_files = self.policy.min_non_doc_files,
                    min_lines = self.policy.min_non_doc_lines,
                    "changes below threshold"
                );
                return GateOutcome {
                    tally: Some(tally),
                    ..GateOutcome::new(CommitClassification::BelowThreshold, summary)
                };
            }
            ChangeVerdict::Substantive => {}
        }

        let message = render_commit_message(
            &self.template,
            &self.project,
            &audit.core_optimization,
            audit.pass_rate,
            &summary,
        );
        if let Err(err) = git.commit(&message) {
            warn!(err = %format!("{err:#}"), "commit failed");
            return GateOutcome {
                detail: Some(format!("{err:#}")),
                ..GateOutcome::new(CommitClassification::CommitFailed, summary)
            };
        }
        let commit_hash = git.head_sha().ok();
        info!(commit = ?commit_hash, message = %message, "committed");

        let pushed = self
            .workspace
            .push_url()
            .and_then(|url| git.push(&url, self.workspace.branch(), false));
        if let Err(err) = pushed {
            warn!(err = %format!("{err:#}"), "push failed");
            return GateOutcome {
                commit_hash,
                detail: Some(format!("{err:#}")),
                ..GateOutcome::new(CommitClassification::PushFailed, summary)
            };
        }
        info!("pushed");
        GateOutcome {
            commit_hash,
            ..GateOutcome::new(CommitClassification::Pushed, summary)
        }
    }
}

/// Render the commit message; an unusable template falls back to the default.
pub fn render_commit_message(
    template: &str,
    project: &str,
    core: &str,
    pass_rate: f64,
    changes: &str,
) -> String {
    let core = core.replace('\n', " ");
    let core = truncate_chars(core.trim(), CORE_SUMMARY_MAX_CHARS);
    let core = if core.is_empty() { DEFAULT_CORE.to_string() } else { core };
    let ctx = context! {
        project => project,
        core => core,
        rate => format!("{pass_rate:.0}"),
        changes => changes,
    };
    let env = Environment::new();
    match env.render_str(template, &ctx) {
        Ok(message) if !message.trim().is_empty() => message,
        Ok(_) => {
            warn!("commit template rendered empty, using default");
            render_default(&env, &ctx, project, &core, pass_rate, changes)
        }
        Err(err) => {
            warn!(err = %err, template, "commit template invalid, using default");
            render_default(&env, &ctx, project, &core, pass_rate, changes)
        }
    }
}

fn render_default(
    env: &Environment<'_>,
    ctx: &minijinja::Value,
    project: &str,
    core: &str,
    pass_rate: f64,
    changes: &str,
) -> String {
    env.render_str(DEFAULT_COMMIT_TEMPLATE, ctx).unwrap_or_else(|_| {
        format!("[autopilot] {project}: {core} | tests {pass_rate:.0}% | changes: {changes}")
    })
}
