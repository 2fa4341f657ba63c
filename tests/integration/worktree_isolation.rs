//! Worktree exclusivity: one writer per branch, never more.

use std::sync::Arc;

use tokio::sync::Notify;

use prflow::core::{BlockCause, LifecycleState, WorkerId};
use prflow::host::CheckStatus;
use prflow::worktree::WorktreeStatus;
use prflow::Error;

use crate::fixtures::{open_pr, pr_id, repo_slug, set_ci, Harness, Step, TestRepo};

#[tokio::test]
async fn test_second_pr_on_assigned_branch_is_blocked() {
    let mut h = Harness::new();
    let first = h.open(6, "feature/shared");
    let sha = h.repo.git(&["rev-parse", "feature/shared"]);
    h.host.upsert_pr(&repo_slug(), open_pr(7, "feature/shared", &sha));
    let second = pr_id(7);
    set_ci(&h.host, &first, CheckStatus::Failure);
    set_ci(&h.host, &second, CheckStatus::Failure);

    let gate = Arc::new(Notify::new());
    h.worker.push(Step::ok().gated(gate.clone()));

    h.discover().await;
    h.poll(&first).await;
    assert!(h.scheduler.record(&first).unwrap().in_flight.is_some());

    h.poll(&second).await;
    let record = h.scheduler.record(&second).unwrap();
    assert!(record.in_flight.is_none());
    assert_eq!(record.effective_state(), LifecycleState::Blocked);
    assert!(matches!(
        record.blocker.as_ref().map(|b| &b.cause),
        Some(BlockCause::IsolationViolation { .. })
    ));
    assert_eq!(h.markers(&second, "escalate-7-isolation-"), 1);

    // The first writer is untouched and finishes normally.
    gate.notify_one();
    assert_eq!(h.complete().await, first);
    assert_eq!(h.worker.calls().len(), 1);
}

#[tokio::test]
async fn test_acquire_rejects_second_worker() {
    let repo = TestRepo::new();
    repo.pushed_branch("feature/a");
    let mut manager = repo.worktree_manager();
    let pr = pr_id(7);

    let first = WorkerId::new();
    let record = manager.acquire("feature/a", &pr, first).await.unwrap();
    assert_eq!(record.status, WorktreeStatus::Assigned);

    let err = manager.acquire("feature/a", &pr, WorkerId::new()).await.unwrap_err();
    assert!(matches!(err, Error::BranchAlreadyAssigned { .. }));
    assert!(err.is_isolation_violation());

    manager.finish(&record.id, first).unwrap();
    let next = WorkerId::new();
    let again = manager.acquire("feature/a", &pr, next).await.unwrap();
    assert_eq!(again.id, record.id);
}

#[tokio::test]
async fn test_held_lease_blocks_release() {
    let repo = TestRepo::new();
    repo.pushed_branch("feature/a");
    let mut manager = repo.worktree_manager();
    let worker = WorkerId::new();
    let record = manager.acquire("feature/a", &pr_id(1), worker).await.unwrap();

    let lease = manager.lease(&record.id, worker).unwrap();
    assert!(matches!(
        manager.release(&record.id).await,
        Err(Error::ConcurrentGitOperation { .. })
    ));

    drop(lease);
    manager.release(&record.id).await.unwrap();
    assert!(manager.get(&record.id).is_none());
    assert!(!record.path.exists());
}

#[tokio::test]
async fn test_dirty_worktree_is_not_reclaimed() {
    let repo = TestRepo::new();
    repo.pushed_branch("feature/a");
    let mut manager = repo.worktree_manager();
    let worker = WorkerId::new();
    let record = manager.acquire("feature/a", &pr_id(1), worker).await.unwrap();
    std::fs::write(record.path.join("scratch.txt"), "uncommitted").unwrap();

    assert!(matches!(
        manager.release(&record.id).await,
        Err(Error::DirtyWorktree { .. })
    ));
    let kept = manager.get(&record.id).unwrap();
    assert_eq!(kept.status, WorktreeStatus::PendingReclaim);
    assert!(record.path.join("scratch.txt").exists());
}
