//! Workspace lifecycle: clone, align with the remote branch, clean, roll back.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::io::config::AutopilotConfig;
use crate::io::git::{Git, authenticated_url};

/// The git-backed working directory owned by the round orchestrator.
#[derive(Debug, Clone)]
pub struct Workspace {
    git: Git,
    repo_url: String,
    branch: String,
    preserve: Vec<String>,
    identity: (String, String),
    token: Option<String>,
}

impl Workspace {
    /// The workspace path is made absolute so prompts and report paths stay
    /// valid for tools running with the workspace as their cwd.
    pub fn new(cfg: &AutopilotConfig, token: Option<String>) -> Self {
        let dir = cfg.workspace_dir();
        let dir = std::path::absolute(&dir).unwrap_or(dir);
        let git = Git::new(dir)
            .with_timeout(Duration::from_secs(cfg.timeouts.git_timeout_secs))
            .with_secret(token.clone());
        Self {
            git,
            repo_url: cfg.repo_url.clone(),
            branch: cfg.branch.clone(),
            preserve: cfg.preserve_untracked_paths.clone(),
            identity: (cfg.git_identity.name.clone(), cfg.git_identity.email.clone()),
            token,
        }
    }

    pub fn dir(&self) -> &Path {
        self.git.workdir()
    }

    pub fn git(&self) -> &Git {
        &self.git
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    /// Remote URL with the push token injected (https remotes only).
    pub fn push_url(&self) -> Result<String> {
        authenticated_url(&self.repo_url, self.token.as_deref())
    }

    /// Check that the remote answers with the configured credentials before
    /// any round starts.
    #[instrument(skip_all)]
    pub fn verify_access(&self) -> Result<()> {
        let heads = self
            .git
            .ls_remote(&self.push_url()?)
            .context("remote rejected the configured credentials")?;
        let branch_ref = format!("refs/heads/{}", self.branch);
        let has_branch = heads
            .lines()
            .any(|line| line.split_whitespace().nth(1) == Some(branch_ref.as_str()));
        info!(has_branch, "remote access verified");
        Ok(())
    }

    /// Reset the workspace to the remote branch baseline, cloning first if needed.
    ///
    /// When the remote branch does not exist yet it is created from the
    /// default checkout and pushed upstream.
    #[instrument(skip_all, fields(dir = %self.dir().display(), branch = %self.branch))]
    pub fn sync(&self) -> Result<()> {
        if !self.git.is_repo() {
            info!("cloning workspace");
            self.git
                .clone_from(&self.push_url()?)
                .context("clone repository")?;
            self.git
                .set_remote_url("origin", &self.repo_url)
                .context("reset remote url")?;
        }
        let (name, email) = &self.identity;
        self.git.set_config("user.name", name)?;
        self.git.set_config("user.email", email)?;

        self.git.fetch_prune().context("fetch origin")?;
        let remote_ref = format!("origin/{}", self.branch);
        if self.git.remote_branch_exists(&self.branch)? {
            self.git
                .checkout_force(&self.branch, Some(&remote_ref))
                .context("checkout branch")?;
            self.git.reset_hard(&remote_ref).context("reset to remote")?;
        } else {
            info!("remote branch missing, creating it");
            self.git
                .checkout_force(&self.branch, None)
                .context("create branch")?;
            self.git
                .push(&self.push_url()?, &self.branch, true)
                .context("push new branch")?;
        }
        self.clean()
    }

    /// Re-fetch and reset to the remote branch (or the local branch when the
    /// remote has none), then clean.
    #[instrument(skip_all, fields(branch = %self.branch))]
    pub fn refresh(&self) -> Result<()> {
        self.git.fetch_prune().context("fetch origin")?;
        if self.git.remote_branch_exists(&self.branch)? {
            let remote_ref = format!("origin/{}", self.branch);
            self.git
                .checkout_force(&self.branch, Some(&remote_ref))
                .context("checkout branch")?;
            self.git.reset_hard(&remote_ref).context("reset to remote")?;
        } else {
            warn!("remote branch missing during refresh, using local head");
            self.git
                .checkout_force(&self.branch, None)
                .context("checkout local branch")?;
        }
        self.clean()
    }

    /// Discard uncommitted work: `reset --hard HEAD` plus clean.
    #[instrument(skip_all)]
    pub fn rollback(&self) -> Result<()> {
        self.git.reset_hard("HEAD").context("reset to HEAD")?;
        self.clean()?;
        info!("workspace rolled back");
        Ok(())
    }

    fn clean(&self) -> Result<()> {
        self.git.clean(&self.preserve).context("clean workspace")
    }
}
