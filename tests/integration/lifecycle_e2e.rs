//! End-to-end lifecycle tests: from a failing PR to one ready notice.

use prflow::core::{Criterion, LifecycleState, WorkKind};
use prflow::host::CheckStatus;
use prflow::orchestration::SchedulerEvent;

use crate::fixtures::{set_ci, Harness, Step};

#[tokio::test]
async fn test_ci_fix_then_single_ready_notification() {
    let mut h = Harness::new();
    let pr = h.open(42, "feature/ci");
    set_ci(&h.host, &pr, CheckStatus::Failure);
    let fixed = pr.clone();
    h.worker
        .push(Step::ok().with_effect(move |host| set_ci(host, &fixed, CheckStatus::Success)));
    let mut events = h.scheduler.subscribe();

    assert_eq!(h.discover().await, 1);
    h.poll(&pr).await;
    let record = h.scheduler.record(&pr).unwrap();
    assert_eq!(record.lifecycle_state, LifecycleState::CiPending);
    let in_flight = record.in_flight.as_ref().expect("ci fix dispatched");
    assert_eq!(in_flight.item.kind, WorkKind::CiFix);
    assert_eq!(in_flight.item.attempt, 1);

    h.complete().await;
    assert!(h.scheduler.record(&pr).unwrap().in_flight.is_none());

    h.poll(&pr).await;
    let record = h.scheduler.record(&pr).unwrap();
    assert_eq!(record.effective_state(), LifecycleState::ReadyToMerge);
    assert!(record.criteria.all_passed());
    assert_eq!(record.retry_count.get(Criterion::CiPassing), 0);
    assert_eq!(record.ready_episode, 1);
    assert_eq!(h.markers(&pr, "ready-42-1"), 1);

    // Re-polling a ready PR changes nothing and says nothing.
    h.poll(&pr).await;
    h.poll(&pr).await;
    assert_eq!(h.markers(&pr, "ready-42-"), 1);
    assert_eq!(h.worker.calls().len(), 1);

    let mut saw_ready = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, SchedulerEvent::Ready { pr: 42, episode: 1 }) {
            saw_ready += 1;
        }
    }
    assert_eq!(saw_ready, 1);
}

#[tokio::test]
async fn test_worker_runs_inside_managed_worktree_with_reasons() {
    let mut h = Harness::new();
    let pr = h.open(42, "feature/ci");
    set_ci(&h.host, &pr, CheckStatus::Failure);

    h.discover().await;
    h.poll(&pr).await;
    h.complete().await;

    let calls = h.worker.calls();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].path.starts_with(h.scheduler.worktrees().root()));
    assert!(calls[0].path.join("README.md").exists());
    assert!(
        calls[0].reasons.iter().any(|r| r.starts_with("ci_passing")),
        "{:?}",
        calls[0].reasons
    );
}

#[tokio::test]
async fn test_pending_ci_waits_without_dispatch() {
    let mut h = Harness::new();
    let pr = h.open(42, "feature/ci");
    set_ci(&h.host, &pr, CheckStatus::Pending);

    h.discover().await;
    h.poll(&pr).await;
    let record = h.scheduler.record(&pr).unwrap();
    assert!(record.in_flight.is_none());
    assert!(!record.criteria.get(Criterion::CiPassing));
    assert_eq!(h.scheduler.active_workers(), 0);
}

#[tokio::test]
async fn test_regression_after_ready_opens_new_episode() {
    let mut h = Harness::new();
    let pr = h.open(42, "feature/ci");
    set_ci(&h.host, &pr, CheckStatus::Success);

    h.discover().await;
    h.poll(&pr).await;
    assert_eq!(h.markers(&pr, "ready-42-1"), 1);

    // A new push turns CI red, then green again.
    h.host.update_pr(&pr, |f| f.head_sha = "f".repeat(40));
    set_ci(&h.host, &pr, CheckStatus::Pending);
    h.poll(&pr).await;
    assert_ne!(
        h.scheduler.record(&pr).unwrap().effective_state(),
        LifecycleState::ReadyToMerge
    );
    set_ci(&h.host, &pr, CheckStatus::Success);
    h.poll(&pr).await;

    assert_eq!(h.scheduler.record(&pr).unwrap().ready_episode, 2);
    assert_eq!(h.markers(&pr, "ready-42-2"), 1);
    assert_eq!(h.markers(&pr, "ready-42-"), 2);
}

#[tokio::test]
async fn test_human_authored_pr_only_gets_responses() {
    let mut h = Harness::new();
    let pr = h.open(5, "feature/human");
    h.host.update_pr(&pr, |f| f.author = "octocat".to_string());
    set_ci(&h.host, &pr, CheckStatus::Failure);

    h.discover().await;
    h.poll(&pr).await;

    let record = h.scheduler.record(&pr).unwrap();
    assert!(record.in_flight.is_none());
    assert_eq!(record.effective_state(), LifecycleState::Blocked);
    assert!(h.worker.calls().is_empty());

    // The block is a status in the snapshot, never an escalation.
    h.poll(&pr).await;
    assert_eq!(h.markers(&pr, "escalate-5-"), 0);
    let snapshots = h.host.comments_with_marker_prefix(&pr, "state-5-");
    assert_eq!(snapshots.len(), 1);
    assert!(snapshots[0].body.contains(r#""cause":"author_policy""#), "{}", snapshots[0].body);
}
