//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Creating temporary git repositories with pushed branches
//! - An in-memory host seeded with open PRs
//! - A scripted worker that replays canned outcomes

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use tempfile::TempDir;
use tokio::sync::Notify;

use prflow::config::Config;
use prflow::core::{PrId, RepoSlug, WorkError, WorkItem, WorkKind, WorkReport};
use prflow::git::GitOps;
use prflow::host::memory::InMemoryHost;
use prflow::host::{CheckRun, CheckStatus, PrFacts};
use prflow::orchestration::{Scheduler, WorkContext, Worker};
use prflow::worktree::{WorktreeLease, WorktreeManager};

pub const ENGINE: &str = "prflow-bot";
pub const AGENT: &str = "coding-agent[bot]";

pub fn repo_slug() -> RepoSlug {
    RepoSlug::new("acme", "widgets")
}

pub fn pr_id(number: u64) -> PrId {
    PrId::new(repo_slug(), number)
}

/// A test repository with a temporary directory and initialized git.
pub struct TestRepo {
    /// Holds the repository and the managed worktree root.
    pub temp_dir: TempDir,
    /// Path to the repository root.
    pub path: PathBuf,
}

impl TestRepo {
    /// Create a new test repository with an initial commit.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("repo");
        std::fs::create_dir_all(&path).expect("Failed to create repo dir");

        let repo = Self { temp_dir, path };
        repo.git(&["init"]);
        repo.git(&["config", "user.email", "test@test.com"]);
        repo.git(&["config", "user.name", "Test User"]);
        std::fs::write(repo.path.join("README.md"), "# Test Repository\n")
            .expect("Failed to write README");
        repo.git(&["add", "."]);
        repo.git(&["commit", "-m", "Initial commit"]);
        repo
    }

    /// Run git in the repository and return trimmed stdout.
    pub fn git(&self, args: &[&str]) -> String {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.path)
            .output()
            .expect("Failed to run git");
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    /// Create a branch at HEAD with a matching remote-tracking ref, as if it
    /// had been pushed. Returns its head SHA.
    pub fn pushed_branch(&self, name: &str) -> String {
        self.git(&["branch", name]);
        self.git(&["update-ref", &format!("refs/remotes/origin/{}", name), name]);
        self.git(&["rev-parse", name])
    }

    pub fn worktrees_root(&self) -> PathBuf {
        self.temp_dir.path().join("worktrees")
    }

    pub fn worktree_manager(&self) -> WorktreeManager {
        let git = GitOps::new(&self.path).expect("Failed to open repo");
        WorktreeManager::new(git, &self.worktrees_root()).expect("Failed to create worktree root")
    }
}

/// Fast polling, no quiet period, and the fixture agent as a trusted author.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.engine_login = Some(ENGINE.to_string());
    config.gate.quiet_period_secs = 0;
    config.polling.min_interval_secs = 1;
    config.polling.max_interval_secs = 4;
    config.polling.stale_poll_cycles = 3;
    config.polling.human_wait_floor_secs = 2;
    config.authors.agent = vec![AGENT.to_string()];
    config.worker.max_concurrent = 4;
    config.worker.deadline_secs = 30;
    config
}

/// An open PR by the fixture agent whose last commit is old enough to
/// satisfy any quiet period.
pub fn open_pr(number: u64, branch: &str, sha: &str) -> PrFacts {
    let mut facts = PrFacts::new_open(number, branch, sha);
    facts.author = AGENT.to_string();
    let earlier = Utc::now() - chrono::Duration::hours(1);
    facts.last_commit_at = Some(earlier);
    facts.updated_at = earlier;
    facts
}

pub fn check(name: &str, status: CheckStatus) -> CheckRun {
    CheckRun {
        name: name.to_string(),
        status,
        required: true,
    }
}

pub fn set_ci(host: &InMemoryHost, pr: &PrId, status: CheckStatus) {
    host.update_pr(pr, |f| {
        f.checks = vec![check("test", status)];
    });
}

pub type Effect = Box<dyn Fn(&InMemoryHost) + Send + Sync>;

/// One canned worker run.
pub struct Step {
    pub outcome: Result<WorkReport, WorkError>,
    /// Applied to the host before the outcome is returned.
    pub effect: Option<Effect>,
    /// Hold the run until notified.
    pub gate: Option<Arc<Notify>>,
}

impl Step {
    pub fn ok() -> Self {
        Self {
            outcome: Ok(WorkReport {
                summary: "done".to_string(),
            }),
            effect: None,
            gate: None,
        }
    }

    pub fn fail(error: WorkError) -> Self {
        Self {
            outcome: Err(error),
            effect: None,
            gate: None,
        }
    }

    pub fn with_effect(mut self, effect: impl Fn(&InMemoryHost) + Send + Sync + 'static) -> Self {
        self.effect = Some(Box::new(effect));
        self
    }

    pub fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub pr: u64,
    pub kind: WorkKind,
    pub attempt: u32,
    pub path: PathBuf,
    pub reasons: Vec<String>,
}

/// A worker that replays scripted steps in order. With the script empty,
/// every run succeeds without touching anything.
pub struct ScriptedWorker {
    host: Arc<InMemoryHost>,
    steps: Mutex<VecDeque<Step>>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedWorker {
    pub fn new(host: Arc<InMemoryHost>) -> Self {
        Self {
            host,
            steps: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, step: Step) {
        self.steps.lock().unwrap().push_back(step);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }
}

impl Worker for ScriptedWorker {
    fn execute<'a>(
        &'a self,
        item: &'a WorkItem,
        lease: &'a WorktreeLease,
        context: &'a WorkContext,
    ) -> BoxFuture<'a, Result<WorkReport, WorkError>> {
        Box::pin(async move {
            self.calls.lock().unwrap().push(Call {
                pr: item.target_pr_id.number,
                kind: item.kind,
                attempt: item.attempt,
                path: lease.path.clone(),
                reasons: context.reasons.clone(),
            });
            let step = self.steps.lock().unwrap().pop_front().unwrap_or_else(Step::ok);
            if let Some(gate) = &step.gate {
                gate.notified().await;
            }
            if let Some(effect) = &step.effect {
                effect(&self.host);
            }
            step.outcome
        })
    }
}

/// A scheduler wired to an in-memory host, a scripted worker, and a real
/// git repository for worktrees.
pub struct Harness {
    pub repo: TestRepo,
    pub host: Arc<InMemoryHost>,
    pub worker: Arc<ScriptedWorker>,
    pub scheduler: Scheduler,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: Config) -> Self {
        let repo = TestRepo::new();
        let host = Arc::new(InMemoryHost::new(ENGINE));
        Self::with_host(repo, host, config)
    }

    /// Build on an existing repo and host, as a restarted engine would.
    pub fn with_host(repo: TestRepo, host: Arc<InMemoryHost>, config: Config) -> Self {
        let worker = Arc::new(ScriptedWorker::new(host.clone()));
        let scheduler = Scheduler::new(
            repo_slug(),
            &config,
            host.clone(),
            ENGINE,
            worker.clone(),
            repo.worktree_manager(),
        );
        Self {
            repo,
            host,
            worker,
            scheduler,
        }
    }

    /// Seed an open PR on a freshly pushed branch.
    pub fn open(&self, number: u64, branch: &str) -> PrId {
        let sha = self.repo.pushed_branch(branch);
        self.host.upsert_pr(&repo_slug(), open_pr(number, branch, &sha));
        pr_id(number)
    }

    pub async fn discover(&mut self) -> usize {
        self.scheduler.discover(Utc::now()).await.expect("discover failed")
    }

    pub async fn poll(&mut self, pr: &PrId) {
        self.scheduler
            .poll_pr(pr, Utc::now())
            .await
            .expect("poll failed");
    }

    /// Wait for one worker completion and apply it.
    pub async fn complete(&mut self) -> PrId {
        tokio::time::timeout(Duration::from_secs(10), self.scheduler.process_next_completion())
            .await
            .expect("no completion within 10s")
            .expect("completion channel closed")
    }

    pub fn markers(&self, pr: &PrId, prefix: &str) -> usize {
        self.host.comments_with_marker_prefix(pr, prefix).len()
    }
}
