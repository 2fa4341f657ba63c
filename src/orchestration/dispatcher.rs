//! Work classifier and dispatcher.
//!
//! [`classify`] turns a verification into at most one work item, choosing
//! the highest-precedence actionable failure and the first work kind the
//! author's policy allows for it. [`Dispatcher::dispatch`] acquires the
//! branch's worktree, leases it, and hands the item to the pool without
//! waiting for it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::pool::{WorkContext, WorkerPool};
use super::verifier::Evaluation;
use crate::core::{
    AuthorKind, Criterion, InFlight, LifecycleState, PrRecord, WorkItem, WorkKind, WorkerId,
    WorktreeId,
};
use crate::host::HostingProvider;
use crate::worktree::WorktreeManager;
use crate::Result;

/// Work kinds that can fix a criterion, preferred first.
pub fn kinds_for(criterion: Criterion) -> &'static [WorkKind] {
    match criterion {
        Criterion::MergeEligible => &[WorkKind::ConflictResolution],
        Criterion::CiPassing => &[WorkKind::CiFix],
        Criterion::NoUnresolvedThreads | Criterion::ReviewsAddressed => {
            &[WorkKind::CodeChanges, WorkKind::CodeReview]
        }
        Criterion::CommentsAcknowledged => &[WorkKind::ResponseOnly],
        Criterion::CommitsPushed => &[WorkKind::CodeChanges],
        Criterion::QuietPeriod | Criterion::NotMerged => &[],
    }
}

/// First kind for `criterion` that `author` permits.
pub fn choose_kind(criterion: Criterion, author: AuthorKind) -> Option<WorkKind> {
    kinds_for(criterion)
        .iter()
        .copied()
        .find(|kind| author.allows(*kind))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Every criterion passed.
    Ready,
    /// Nothing to do on this PR right now.
    Skip { reason: String },
    /// Failing, but nothing the engine does would help yet.
    Wait { criterion: Criterion, reason: String },
    /// The author policy forbids every fix for this criterion.
    NeedsHuman { criterion: Criterion },
    Dispatch(WorkItem),
}

/// Decide what, if anything, to do about a verified PR.
pub fn classify(
    record: &PrRecord,
    evaluation: &Evaluation,
    budget: Duration,
    now: DateTime<Utc>,
) -> Decision {
    if record.in_flight.is_some() {
        return Decision::Skip {
            reason: "work item already in flight".to_string(),
        };
    }
    if record.lifecycle_state == LifecycleState::Draft {
        return Decision::Skip {
            reason: "draft".to_string(),
        };
    }
    if evaluation.criteria.all_passed() {
        return Decision::Ready;
    }

    let failing = evaluation.criteria.failing();
    let Some(primary) = evaluation.actionable_failures().first().copied() else {
        let criterion = failing.first().copied().unwrap_or(Criterion::QuietPeriod);
        let reason = evaluation
            .detail(criterion)
            .map(|d| d.reason.clone())
            .unwrap_or_default();
        return Decision::Wait { criterion, reason };
    };

    let Some(kind) = choose_kind(primary, record.author_kind) else {
        return Decision::NeedsHuman { criterion: primary };
    };

    let mut success_criteria = vec![primary];
    success_criteria.extend(
        failing
            .iter()
            .copied()
            .filter(|c| *c != primary && kind.addresses().contains(c)),
    );
    let attempt = record.retry_count.get(primary) + 1;
    Decision::Dispatch(WorkItem::new(
        kind,
        record.id.clone(),
        success_criteria,
        attempt,
        now,
        budget,
    ))
}

/// Failure reasons for the item's criteria, for the worker prompt.
pub fn reasons_for(item: &WorkItem, evaluation: &Evaluation) -> Vec<String> {
    item.success_criteria
        .iter()
        .filter_map(|c| evaluation.detail(*c))
        .filter(|d| !d.reason.is_empty())
        .map(|d| format!("{}: {}", d.criterion, d.reason))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Dispatched {
        worker_id: WorkerId,
        worktree_id: WorktreeId,
    },
    /// The pool is full; try again next tick.
    Deferred,
    AlreadyInFlight,
}

pub struct Dispatcher {
    pool: WorkerPool,
    host: Arc<dyn HostingProvider>,
}

impl Dispatcher {
    pub fn new(pool: WorkerPool, host: Arc<dyn HostingProvider>) -> Self {
        Self { pool, host }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn pool_mut(&mut self) -> &mut WorkerPool {
        &mut self.pool
    }

    /// Start `item` for `record` in the branch's worktree.
    ///
    /// On success the record owns the item as its single in-flight work and
    /// its assigned worktree is set. Isolation failures from the worktree
    /// manager propagate unchanged.
    pub async fn dispatch(
        &mut self,
        record: &mut PrRecord,
        item: WorkItem,
        reasons: Vec<String>,
        worktrees: &mut WorktreeManager,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome> {
        if record.in_flight.is_some() || self.pool.is_running(&record.id) {
            return Ok(DispatchOutcome::AlreadyInFlight);
        }
        if !self.pool.has_capacity() {
            tracing::debug!(pr = %record.id, active = self.pool.active_count(), "pool full, deferring");
            return Ok(DispatchOutcome::Deferred);
        }

        let context = self.context(record, reasons).await;
        let worker_id = WorkerId::new();
        let worktree = worktrees.acquire(&record.branch, &record.id, worker_id).await?;
        let lease = match worktrees.lease(&worktree.id, worker_id) {
            Ok(lease) => lease,
            Err(e) => {
                if let Err(finish) = worktrees.finish(&worktree.id, worker_id) {
                    tracing::warn!(error = %finish, "failed to free worktree after lease error");
                }
                return Err(e);
            }
        };

        if let Err(e) = self.pool.spawn(item.clone(), lease, context, worker_id) {
            if let Err(finish) = worktrees.finish(&worktree.id, worker_id) {
                tracing::warn!(error = %finish, "failed to free worktree after spawn error");
            }
            return Err(e);
        }
        tracing::info!(
            pr = %record.id,
            kind = %item.kind,
            attempt = item.attempt,
            worktree = %worktree.id.short(),
            "dispatched"
        );
        record.assigned_worktree_id = Some(worktree.id);
        record.in_flight = Some(InFlight {
            item,
            worker_id,
            worktree_id: worktree.id,
            dispatched_at: now,
            polls_without_progress: 0,
        });
        Ok(DispatchOutcome::Dispatched {
            worker_id,
            worktree_id: worktree.id,
        })
    }

    async fn context(&self, record: &PrRecord, reasons: Vec<String>) -> WorkContext {
        let diff_stat = match self.host.diff_stat(&record.id).await {
            Ok(stat) => Some(stat),
            Err(e) => {
                tracing::warn!(pr = %record.id, error = %e, "diff stat unavailable");
                None
            }
        };
        let files_changed = match self.host.files_changed(&record.id).await {
            Ok(files) => files,
            Err(e) => {
                tracing::warn!(pr = %record.id, error = %e, "changed files unavailable");
                Vec::new()
            }
        };
        WorkContext {
            branch: record.branch.clone(),
            head_sha: record.head_sha.clone(),
            diff_stat,
            files_changed,
            reasons,
        }
    }
}
