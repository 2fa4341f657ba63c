//! The default [`Worker`]: a coding-agent CLI run inside the leased worktree.

use std::process::Stdio;
use std::sync::LazyLock;

use futures::future::BoxFuture;
use regex::Regex;
use tokio::process::Command;

use crate::config::Config;
use crate::core::{WorkError, WorkItem, WorkKind, WorkReport};
use crate::orchestration::{WorkContext, Worker};
use crate::util::truncate_chars;
use crate::worktree::WorktreeLease;

/// HTTP status codes as whole words, so "4031 tests" is not a 403.
static STATUS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b(40[13]|429|50[234])\b").unwrap());

/// Stderr fragments that mean "try again later".
const TRANSIENT_PATTERNS: &[&str] = &[
    "rate limit",
    "overloaded",
    "timed out",
    "connection reset",
    "temporarily unavailable",
];

const PERMISSION_PATTERNS: &[&str] = &[
    "permission denied",
    "not authenticated",
    "authentication failed",
];

const SUMMARY_CHARS: usize = 500;

pub struct CommandWorker {
    base_command: Vec<String>,
}

impl CommandWorker {
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.effective_worker_command())
    }

    pub fn new(command: &str) -> Self {
        Self {
            base_command: command.split_whitespace().map(String::from).collect(),
        }
    }

    pub fn binary(&self) -> &str {
        self.base_command
            .first()
            .map(|s| s.as_str())
            .unwrap_or("claude")
    }

    pub fn is_available(&self) -> bool {
        which::which(self.binary()).is_ok()
    }

    /// Full argv for one prompt.
    pub fn command(&self, prompt: &str) -> Vec<String> {
        let mut cmd = self.base_command.clone();
        cmd.push(prompt.to_string());
        cmd
    }

    async fn run(&self, item: &WorkItem, lease: &WorktreeLease, context: &WorkContext) -> Result<WorkReport, WorkError> {
        let prompt = prompt_for(item, context);
        let argv = self.command(&prompt);
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| WorkError::Failed("empty worker command".to_string()))?;

        tracing::debug!(
            pr = %item.target_pr_id,
            kind = %item.kind,
            path = %lease.path.display(),
            "running worker command"
        );
        let output = Command::new(program)
            .args(args)
            .current_dir(&lease.path)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| WorkError::Failed(format!("could not start {}: {}", program, e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if output.status.success() {
            return Ok(WorkReport {
                summary: truncate_chars(stdout.trim(), SUMMARY_CHARS),
            });
        }

        let detail = if stderr.trim().is_empty() {
            format!("exit code {}", output.status.code().unwrap_or(-1))
        } else {
            truncate_chars(stderr.trim(), SUMMARY_CHARS)
        };
        Err(classify_failure(&detail))
    }
}

impl Worker for CommandWorker {
    fn execute<'a>(
        &'a self,
        item: &'a WorkItem,
        lease: &'a WorktreeLease,
        context: &'a WorkContext,
    ) -> BoxFuture<'a, Result<WorkReport, WorkError>> {
        Box::pin(self.run(item, lease, context))
    }
}

pub fn classify_failure(detail: &str) -> WorkError {
    let lower = detail.to_ascii_lowercase();
    let status = STATUS_RE
        .captures(&lower)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str());
    if matches!(status, Some("401" | "403")) || PERMISSION_PATTERNS.iter().any(|p| lower.contains(p)) {
        WorkError::Permission(detail.to_string())
    } else if status.is_some() || TRANSIENT_PATTERNS.iter().any(|p| lower.contains(p)) {
        WorkError::Transient(detail.to_string())
    } else {
        WorkError::Failed(detail.to_string())
    }
}

fn instructions(kind: WorkKind) -> &'static str {
    match kind {
        WorkKind::CiFix => {
            "CI is failing on this branch. Find the cause, fix it, commit, and push."
        }
        WorkKind::ConflictResolution => {
            "This branch conflicts with its base. Merge the base branch in, resolve every conflict, commit, and push."
        }
        WorkKind::CodeChanges => {
            "Reviewers asked for changes. Make them, reply on each thread you resolved, commit, and push."
        }
        WorkKind::CodeReview => {
            "Review the open feedback on this PR and answer each point. Do not change code unless a fix is trivial."
        }
        WorkKind::ResponseOnly => {
            "Some comments on this PR are waiting for an answer. Reply to each of them. Do not change code."
        }
    }
}

/// The prompt handed to the worker command.
pub fn prompt_for(item: &WorkItem, context: &WorkContext) -> String {
    let mut prompt = format!(
        "You are working on pull request {} (branch `{}`, head {}), attempt {}.\n\n{}\n",
        item.target_pr_id,
        context.branch,
        crate::util::short_sha(&context.head_sha),
        item.attempt,
        instructions(item.kind)
    );
    if !context.reasons.is_empty() {
        prompt.push_str("\nWhat is failing:\n");
        for reason in &context.reasons {
            prompt.push_str(&format!("- {}\n", reason));
        }
    }
    if let Some(stat) = &context.diff_stat {
        prompt.push_str(&format!("\nCurrent diff: {}\n", stat));
    }
    if !context.files_changed.is_empty() {
        prompt.push_str("Files changed:\n");
        for file in &context.files_changed {
            prompt.push_str(&format!("- {}\n", file));
        }
    }
    prompt.push_str("\nNever merge the pull request and never force-push.\n");
    prompt
}
