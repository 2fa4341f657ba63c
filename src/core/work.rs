//! Work items: bounded, attributable units of corrective work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::criteria::Criterion;
use super::ids::{WorkItemId, WorkerId, WorktreeId};
use super::pr::PrId;

/// The kind of work a worker is asked to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkKind {
    CodeReview,
    CodeChanges,
    CiFix,
    ConflictResolution,
    ResponseOnly,
}

impl WorkKind {
    pub const ALL: [WorkKind; 5] = [
        WorkKind::CodeReview,
        WorkKind::CodeChanges,
        WorkKind::CiFix,
        WorkKind::ConflictResolution,
        WorkKind::ResponseOnly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkKind::CodeReview => "code_review",
            WorkKind::CodeChanges => "code_changes",
            WorkKind::CiFix => "ci_fix",
            WorkKind::ConflictResolution => "conflict_resolution",
            WorkKind::ResponseOnly => "response_only",
        }
    }

    /// Criteria this kind of work can plausibly flip to true.
    pub fn addresses(&self) -> &'static [Criterion] {
        match self {
            WorkKind::CodeReview => &[Criterion::ReviewsAddressed, Criterion::NoUnresolvedThreads],
            WorkKind::CodeChanges => &[
                Criterion::NoUnresolvedThreads,
                Criterion::ReviewsAddressed,
                Criterion::CommitsPushed,
            ],
            WorkKind::CiFix => &[Criterion::CiPassing],
            WorkKind::ConflictResolution => &[Criterion::MergeEligible],
            WorkKind::ResponseOnly => &[Criterion::CommentsAcknowledged],
        }
    }
}

impl std::fmt::Display for WorkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One dispatched unit of work. Consumed by exactly one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: WorkItemId,
    pub kind: WorkKind,
    pub target_pr_id: PrId,
    /// The criterion that selected this item comes first.
    pub success_criteria: Vec<Criterion>,
    /// 1-based attempt number against the primary criterion.
    pub attempt: u32,
    pub deadline: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl WorkItem {
    pub fn new(
        kind: WorkKind,
        target_pr_id: PrId,
        success_criteria: Vec<Criterion>,
        attempt: u32,
        now: DateTime<Utc>,
        budget: Duration,
    ) -> Self {
        Self {
            id: WorkItemId::new(),
            kind,
            target_pr_id,
            success_criteria,
            attempt: attempt.max(1),
            deadline: now + chrono_duration(budget),
            created_at: now,
        }
    }

    pub fn primary_criterion(&self) -> Option<Criterion> {
        self.success_criteria.first().copied()
    }

    /// The same work resubmitted after a transient failure: new id and
    /// deadline, same attempt number.
    pub fn retry(&self, now: DateTime<Utc>, budget: Duration) -> Self {
        Self {
            id: WorkItemId::new(),
            deadline: now + chrono_duration(budget),
            created_at: now,
            ..self.clone()
        }
    }

    /// Time left before the deadline, zero once it has passed.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.deadline - now).to_std().unwrap_or(Duration::ZERO)
    }
}

pub(crate) fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365))
}

/// What a worker reports back after finishing successfully.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkReport {
    pub summary: String,
}

/// Terminal failure of a work item as seen by the worker.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("work failed: {0}")]
    Failed(String),

    #[error("isolation violation: {0}")]
    Isolation(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("deadline exceeded")]
    DeadlineExceeded,
}

/// Bookkeeping for the one work item a PR may have outstanding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlight {
    pub item: WorkItem,
    pub worker_id: WorkerId,
    pub worktree_id: WorktreeId,
    pub dispatched_at: DateTime<Utc>,
    pub polls_without_progress: u32,
}
