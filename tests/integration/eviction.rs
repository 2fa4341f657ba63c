//! Merged and closed PRs leave the registry and give back their worktrees.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;

use prflow::core::LifecycleState;
use prflow::host::{CheckStatus, PrState};
use prflow::orchestration::SchedulerEvent;
use prflow::worktree::WorktreeStatus;

use crate::fixtures::{set_ci, Harness, Step};

#[tokio::test]
async fn test_merged_pr_is_evicted_and_worktree_removed() {
    let mut h = Harness::new();
    let pr = h.open(42, "feature/done");
    set_ci(&h.host, &pr, CheckStatus::Failure);
    let mut events = h.scheduler.subscribe();

    h.discover().await;
    h.poll(&pr).await;
    h.complete().await;
    let path = h.worker.calls()[0].path.clone();
    assert!(path.exists());

    h.host.update_pr(&pr, |f| f.state = PrState::Merged);
    h.poll(&pr).await;

    assert!(h.scheduler.record(&pr).is_none());
    assert!(h.scheduler.worktrees().is_empty());
    assert!(!path.exists());
    let evicted = std::iter::from_fn(|| events.try_recv().ok()).find_map(|e| match e {
        SchedulerEvent::Evicted { pr: 42, state } => Some(state),
        _ => None,
    });
    assert_eq!(evicted, Some(LifecycleState::Merged));

    // A merged PR is never rediscovered.
    assert_eq!(h.discover().await, 0);
    assert_eq!(h.scheduler.tracked(), 0);
}

#[tokio::test]
async fn test_dirty_worktree_outlives_eviction_until_clean() {
    let mut h = Harness::new();
    let pr = h.open(42, "feature/scratch");
    set_ci(&h.host, &pr, CheckStatus::Failure);
    let mut events = h.scheduler.subscribe();

    h.discover().await;
    h.poll(&pr).await;
    h.complete().await;
    let path = h.worker.calls()[0].path.clone();
    let scratch = path.join("notes.txt");
    std::fs::write(&scratch, "left behind").unwrap();

    h.host.update_pr(&pr, |f| f.state = PrState::Merged);
    h.poll(&pr).await;

    assert!(h.scheduler.record(&pr).is_none());
    assert!(path.exists());
    let record = h.scheduler.worktrees().records().next().unwrap();
    assert_eq!(record.status, WorktreeStatus::PendingReclaim);
    let pending = std::iter::from_fn(|| events.try_recv().ok()).find_map(|e| match e {
        SchedulerEvent::ReclaimPending { branch, reason, .. } => Some((branch, reason)),
        _ => None,
    });
    let (branch, reason) = pending.expect("reclaim_pending event");
    assert_eq!(branch, "feature/scratch");
    assert!(reason.contains("uncommitted"), "{}", reason);

    // Still dirty: kept, and no second event.
    h.scheduler.tick(Utc::now()).await.unwrap();
    assert_eq!(h.scheduler.worktrees().len(), 1);
    assert!(!std::iter::from_fn(|| events.try_recv().ok())
        .any(|e| matches!(e, SchedulerEvent::ReclaimPending { .. })));

    std::fs::remove_file(&scratch).unwrap();
    h.scheduler.tick(Utc::now()).await.unwrap();
    assert!(h.scheduler.worktrees().is_empty());
    assert!(!path.exists());
}

#[tokio::test]
async fn test_closed_pr_aborts_running_work() {
    let mut h = Harness::new();
    let pr = h.open(42, "feature/abandoned");
    set_ci(&h.host, &pr, CheckStatus::Failure);
    h.worker
        .push(Step::ok().gated(Arc::new(Notify::new())));

    h.discover().await;
    h.poll(&pr).await;
    assert_eq!(h.scheduler.active_workers(), 1);

    h.host.update_pr(&pr, |f| f.state = PrState::Closed);
    h.poll(&pr).await;
    assert!(h.scheduler.record(&pr).is_none());
    assert_eq!(h.scheduler.active_workers(), 0);

    // The aborted task drops its lease on the runtime's next turn; the
    // worktree goes on a later tick.
    for _ in 0..20 {
        if h.scheduler.worktrees().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.scheduler.tick(Utc::now()).await.unwrap();
    }
    assert!(h.scheduler.worktrees().is_empty());
}

#[tokio::test]
async fn test_pr_missing_from_open_list_is_polled_to_eviction() {
    let mut h = Harness::new();
    let pr = h.open(42, "feature/gone");
    set_ci(&h.host, &pr, CheckStatus::Pending);

    h.discover().await;
    h.poll(&pr).await;
    assert!(!h.scheduler.record(&pr).unwrap().is_due(Utc::now()));

    h.host.update_pr(&pr, |f| f.state = PrState::Closed);
    h.discover().await;
    assert!(h.scheduler.record(&pr).unwrap().is_due(Utc::now()));

    h.scheduler.tick(Utc::now()).await.unwrap();
    assert!(h.scheduler.record(&pr).is_none());
}
