use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::RepoSlug;
use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub worktree_dir: Option<String>,
    pub gh_binary: Option<String>,
    pub worker_command: Option<String>,
    /// Login the engine posts as. Resolved from the host when unset.
    pub engine_login: Option<String>,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub gate: GateConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub host: HostConfig,
    #[serde(default)]
    pub tracking: TrackingConfig,
    #[serde(default)]
    pub authors: AuthorsConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub min_interval_secs: u64,
    pub max_interval_secs: u64,
    pub growth_factor: f64,
    /// Polls without progress before an in-flight item is declared stale.
    pub stale_poll_cycles: u32,
    /// How often the control loop wakes to look for due PRs.
    pub tick_secs: u64,
    /// Floor for PRs waiting on a person (draft, ready, blocked).
    pub human_wait_floor_secs: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            min_interval_secs: 60,
            max_interval_secs: 1800,
            growth_factor: 1.5,
            stale_poll_cycles: 6,
            tick_secs: 5,
            human_wait_floor_secs: 300,
        }
    }
}

impl PollingConfig {
    pub fn min_interval(&self) -> Duration {
        Duration::from_secs(self.min_interval_secs)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_secs(self.max_interval_secs.max(self.min_interval_secs))
    }

    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs.max(1))
    }

    pub fn human_wait_floor(&self) -> Duration {
        Duration::from_secs(self.human_wait_floor_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub quiet_period_secs: u64,
    /// With no required checks declared, treat every check as required.
    pub require_all_checks_when_unprotected: bool,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            quiet_period_secs: 300,
            require_all_checks_when_unprotected: true,
        }
    }
}

impl GateConfig {
    pub fn quiet_period(&self) -> Duration {
        Duration::from_secs(self.quiet_period_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Automatic re-dispatches per criterion before escalating.
    pub max_criterion_retries: u32,
    pub max_transient_retries: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_criterion_retries: 3,
            max_transient_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub timeout_secs: u64,
    pub retries: u32,
    pub backoff_base_ms: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 20,
            retries: 3,
            backoff_base_ms: 500,
        }
    }
}

impl HostConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }
}

/// Which open PRs the engine picks up.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Only PRs targeting this base branch. All when unset.
    pub base_branch: Option<String>,
    /// Only PRs opened by these logins. All when empty.
    pub authors: Vec<String>,
    pub include_drafts: bool,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            base_branch: None,
            authors: Vec::new(),
            include_drafts: true,
        }
    }
}

impl TrackingConfig {
    pub fn matches(&self, base: &str, author: &str, is_draft: bool) -> bool {
        if is_draft && !self.include_drafts {
            return false;
        }
        if let Some(ref wanted) = self.base_branch {
            if wanted != base {
                return false;
            }
        }
        self.authors.is_empty() || self.authors.iter().any(|a| a.eq_ignore_ascii_case(author))
    }
}

/// Logins mapped onto author kinds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorsConfig {
    pub agent: Vec<String>,
    pub mention: Vec<String>,
    pub review: Vec<String>,
    pub update: Vec<String>,
}

impl Default for AuthorsConfig {
    fn default() -> Self {
        Self {
            agent: Vec::new(),
            mention: vec!["copilot-swe-agent[bot]".to_string()],
            review: vec![
                "coderabbitai[bot]".to_string(),
                "copilot-pull-request-reviewer[bot]".to_string(),
            ],
            update: vec!["dependabot[bot]".to_string(), "renovate[bot]".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub max_concurrent: usize,
    pub deadline_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            deadline_secs: 1800,
        }
    }
}

impl WorkerConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }
}

impl Config {
    pub fn prflow_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".prflow"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::prflow_dir()?.join("prflow.toml"))
    }

    pub fn lock_dir() -> Result<PathBuf> {
        Ok(Self::prflow_dir()?.join("locks"))
    }

    /// Managed root for one repository's worktrees.
    pub fn worktrees_dir(&self, repo: &RepoSlug) -> Result<PathBuf> {
        let base = match self.worktree_dir {
            Some(ref dir) => expand_tilde(dir),
            None => Self::prflow_dir()?.join("worktrees"),
        };
        Ok(base.join(repo.file_stem()))
    }

    pub fn effective_gh_binary(&self) -> &str {
        self.gh_binary.as_deref().unwrap_or("gh")
    }

    pub fn effective_worker_command(&self) -> &str {
        self.worker_command.as_deref().unwrap_or("claude -p")
    }

    /// Load from `path`, or from `~/.prflow/prflow.toml` when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path()?,
        };
        tracing::debug!(path = %path.display(), "Config::load");
        if !path.exists() {
            tracing::debug!("config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(&path)?)?;
        config.validate()?;
        tracing::debug!(
            worktree_dir = ?config.worktree_dir,
            worker_command = ?config.worker_command,
            max_concurrent = config.worker.max_concurrent,
            "config loaded"
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.polling.growth_factor < 1.0 {
            return Err(Error::InvalidParams(format!(
                "polling.growth_factor must be >= 1.0, got {}",
                self.polling.growth_factor
            )));
        }
        if self.worker.max_concurrent == 0 {
            return Err(Error::InvalidParams(
                "worker.max_concurrent must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        tracing::debug!(path = %path.display(), "config saved");
        Ok(())
    }

    pub fn ensure_dirs(&self, repo: &RepoSlug) -> Result<()> {
        for dir in [
            Self::prflow_dir()?,
            Self::lock_dir()?,
            self.worktrees_dir(repo)?,
        ] {
            if !dir.exists() {
                tracing::debug!(dir = %dir.display(), "creating directory");
                fs::create_dir_all(&dir)?;
            }
        }
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
