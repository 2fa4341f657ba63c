//! Recovery tests: bounded retry, transient retries, stale items, and
//! escalation.

use prflow::core::{BlockCause, Criterion, LifecycleState, WorkError, WorkKind};
use prflow::host::memory::HostOp;
use prflow::host::{CheckStatus, HostError, Mergeable};

use crate::fixtures::{set_ci, test_config, Harness, Step};

#[tokio::test]
async fn test_fourth_failed_attempt_blocks_and_escalates_once() {
    let mut h = Harness::new();
    let pr = h.open(42, "feature/red");
    set_ci(&h.host, &pr, CheckStatus::Failure);

    h.discover().await;
    for _ in 0..4 {
        h.poll(&pr).await;
        h.complete().await;
    }
    h.poll(&pr).await;

    let attempts: Vec<u32> = h.worker.calls().iter().map(|c| c.attempt).collect();
    assert_eq!(attempts, vec![1, 2, 3, 4]);
    let record = h.scheduler.record(&pr).unwrap();
    assert_eq!(record.effective_state(), LifecycleState::Blocked);
    assert_eq!(
        record.blocker.as_ref().map(|b| b.cause.clone()),
        Some(BlockCause::RetriesExhausted {
            criterion: Criterion::CiPassing
        })
    );
    assert_eq!(h.markers(&pr, "escalate-42-retries-exhausted-ci_passing-"), 1);

    // Blocked PRs get no more work and no repeated escalation.
    h.poll(&pr).await;
    h.poll(&pr).await;
    assert_eq!(h.worker.calls().len(), 4);
    assert_eq!(h.markers(&pr, "escalate-42-"), 1);
}

#[tokio::test]
async fn test_new_push_clears_block_and_restarts_count() {
    let mut h = Harness::new();
    let pr = h.open(42, "feature/red");
    set_ci(&h.host, &pr, CheckStatus::Failure);

    h.discover().await;
    for _ in 0..4 {
        h.poll(&pr).await;
        h.complete().await;
    }
    h.poll(&pr).await;
    assert!(h.scheduler.record(&pr).unwrap().is_blocked());

    // Someone else pushes a fix attempt.
    h.host.update_pr(&pr, |f| f.head_sha = "e".repeat(40));
    h.poll(&pr).await;

    let record = h.scheduler.record(&pr).unwrap();
    assert!(!record.is_blocked());
    let in_flight = record.in_flight.as_ref().expect("dispatched again");
    assert_eq!(in_flight.item.attempt, 1);
    h.complete().await;
}

#[tokio::test]
async fn test_success_resets_counter() {
    let mut h = Harness::new();
    let pr = h.open(42, "feature/flaky");
    set_ci(&h.host, &pr, CheckStatus::Failure);
    let fixed = pr.clone();
    h.worker.push(Step::ok());
    h.worker
        .push(Step::ok().with_effect(move |host| set_ci(host, &fixed, CheckStatus::Success)));

    h.discover().await;
    h.poll(&pr).await;
    h.complete().await;
    h.poll(&pr).await;
    assert_eq!(h.scheduler.record(&pr).unwrap().retry_count.get(Criterion::CiPassing), 1);
    h.complete().await;
    h.poll(&pr).await;

    let record = h.scheduler.record(&pr).unwrap();
    assert_eq!(record.retry_count.get(Criterion::CiPassing), 0);
    assert_eq!(record.effective_state(), LifecycleState::ReadyToMerge);
}

#[tokio::test]
async fn test_last_fix_with_ci_still_running_is_not_charged() {
    let mut h = Harness::new();
    let pr = h.open(42, "feature/slow-ci");
    set_ci(&h.host, &pr, CheckStatus::Failure);
    for _ in 0..3 {
        h.worker.push(Step::ok());
    }
    let pushed = pr.clone();
    h.worker
        .push(Step::ok().with_effect(move |host| set_ci(host, &pushed, CheckStatus::Pending)));

    h.discover().await;
    for _ in 0..4 {
        h.poll(&pr).await;
        h.complete().await;
    }
    h.poll(&pr).await;

    let record = h.scheduler.record(&pr).unwrap();
    assert_eq!(record.retry_count.get(Criterion::CiPassing), 3);
    assert!(!record.is_blocked());
    assert!(record.in_flight.is_none());
    assert_eq!(h.markers(&pr, "escalate-42-"), 0);

    set_ci(&h.host, &pr, CheckStatus::Success);
    h.poll(&pr).await;
    let record = h.scheduler.record(&pr).unwrap();
    assert_eq!(record.retry_count.get(Criterion::CiPassing), 0);
    assert_eq!(record.effective_state(), LifecycleState::ReadyToMerge);
    assert_eq!(h.worker.calls().len(), 4);
}

#[tokio::test]
async fn test_attempt_is_charged_once_ci_settles_red() {
    let mut h = Harness::new();
    let pr = h.open(42, "feature/slow-ci");
    set_ci(&h.host, &pr, CheckStatus::Failure);
    let pushed = pr.clone();
    h.worker
        .push(Step::ok().with_effect(move |host| set_ci(host, &pushed, CheckStatus::Pending)));

    h.discover().await;
    h.poll(&pr).await;
    h.complete().await;
    h.poll(&pr).await;
    h.poll(&pr).await;
    let record = h.scheduler.record(&pr).unwrap();
    assert_eq!(record.retry_count.get(Criterion::CiPassing), 0);
    assert!(record.in_flight.is_none());

    set_ci(&h.host, &pr, CheckStatus::Failure);
    h.poll(&pr).await;
    let record = h.scheduler.record(&pr).unwrap();
    assert_eq!(record.retry_count.get(Criterion::CiPassing), 1);
    assert_eq!(record.in_flight.as_ref().map(|f| f.item.attempt), Some(2));
    h.complete().await;

    // The next poll judges attempt 2 only.
    h.poll(&pr).await;
    assert_eq!(h.scheduler.record(&pr).unwrap().retry_count.get(Criterion::CiPassing), 2);
    h.complete().await;
}

#[tokio::test]
async fn test_unknown_mergeability_after_push_is_not_charged() {
    let mut h = Harness::new();
    let pr = h.open(42, "feature/conflict");
    set_ci(&h.host, &pr, CheckStatus::Success);
    h.host.update_pr(&pr, |f| f.mergeable = Mergeable::Conflicting);
    let pushed = pr.clone();
    h.worker.push(Step::ok().with_effect(move |host| {
        host.update_pr(&pushed, |f| f.mergeable = Mergeable::Unknown);
    }));

    h.discover().await;
    h.poll(&pr).await;
    h.complete().await;
    h.poll(&pr).await;

    let record = h.scheduler.record(&pr).unwrap();
    assert_eq!(record.retry_count.get(Criterion::MergeEligible), 0);
    assert!(record.in_flight.is_none());
    assert!(!record.is_blocked());

    h.host.update_pr(&pr, |f| f.mergeable = Mergeable::Mergeable);
    h.poll(&pr).await;
    let record = h.scheduler.record(&pr).unwrap();
    assert_eq!(record.retry_count.get(Criterion::MergeEligible), 0);
    assert_eq!(record.effective_state(), LifecycleState::ReadyToMerge);
    let kinds: Vec<WorkKind> = h.worker.calls().iter().map(|c| c.kind).collect();
    assert_eq!(kinds, vec![WorkKind::ConflictResolution]);
}

#[tokio::test]
async fn test_transient_failure_retries_same_attempt() {
    let mut h = Harness::new();
    let pr = h.open(42, "feature/flaky");
    set_ci(&h.host, &pr, CheckStatus::Failure);
    h.worker.push(Step::fail(WorkError::Transient("503".into())));

    h.discover().await;
    h.poll(&pr).await;
    h.complete().await;

    // The retry was dispatched straight from the completion.
    let record = h.scheduler.record(&pr).unwrap();
    assert_eq!(record.transient_retries, 1);
    assert_eq!(record.retry_count.get(Criterion::CiPassing), 0);
    assert!(record.in_flight.is_some());
    h.complete().await;

    let attempts: Vec<u32> = h.worker.calls().iter().map(|c| c.attempt).collect();
    assert_eq!(attempts, vec![1, 1]);
}

#[tokio::test]
async fn test_worker_isolation_error_escalates() {
    let mut h = Harness::new();
    let pr = h.open(42, "feature/iso");
    set_ci(&h.host, &pr, CheckStatus::Failure);
    h.worker
        .push(Step::fail(WorkError::Isolation("worktree changed underneath".into())));

    h.discover().await;
    h.poll(&pr).await;
    h.complete().await;

    let record = h.scheduler.record(&pr).unwrap();
    assert!(matches!(
        record.blocker.as_ref().map(|b| &b.cause),
        Some(BlockCause::IsolationViolation { .. })
    ));
    assert_eq!(h.markers(&pr, "escalate-42-isolation-"), 1);
}

#[tokio::test]
async fn test_permission_denied_blocks_then_clears() {
    let mut h = Harness::new();
    let pr = h.open(42, "feature/locked");
    set_ci(&h.host, &pr, CheckStatus::Pending);

    h.discover().await;
    h.host
        .fail_next(HostOp::Get, HostError::PermissionDenied("HTTP 403".into()));
    h.poll(&pr).await;
    let record = h.scheduler.record(&pr).unwrap();
    assert!(matches!(
        record.blocker.as_ref().map(|b| &b.cause),
        Some(BlockCause::PermissionDenied { .. })
    ));
    assert_eq!(h.markers(&pr, "escalate-42-permission-"), 1);

    h.poll(&pr).await;
    assert!(!h.scheduler.record(&pr).unwrap().is_blocked());
}

#[tokio::test]
async fn test_transient_host_error_backs_off() {
    let mut h = Harness::new();
    let pr = h.open(42, "feature/slow");
    set_ci(&h.host, &pr, CheckStatus::Pending);

    h.discover().await;
    h.poll(&pr).await;
    let before = h.scheduler.record(&pr).unwrap().poll_interval;
    h.host
        .fail_next(HostOp::Get, HostError::Transient("502".into()));
    h.poll(&pr).await;

    let record = h.scheduler.record(&pr).unwrap();
    assert!(!record.is_blocked());
    assert!(record.poll_interval >= before);
}

#[tokio::test]
async fn test_stale_item_is_aborted_and_counted() {
    let mut config = test_config();
    config.polling.stale_poll_cycles = 2;
    let mut h = Harness::with_config(config);
    let pr = h.open(42, "feature/stuck");
    set_ci(&h.host, &pr, CheckStatus::Failure);
    let gate = std::sync::Arc::new(tokio::sync::Notify::new());
    h.worker.push(Step::ok().gated(gate));

    h.discover().await;
    h.poll(&pr).await;
    assert!(h.scheduler.record(&pr).unwrap().in_flight.is_some());

    h.poll(&pr).await;
    h.poll(&pr).await;

    let record = h.scheduler.record(&pr).unwrap();
    assert_eq!(record.retry_count.get(Criterion::CiPassing), 1);
    assert!(record.in_flight.is_none());
    assert_eq!(h.scheduler.active_workers(), 0);

    h.poll(&pr).await;
    let in_flight = h
        .scheduler
        .record(&pr)
        .unwrap()
        .in_flight
        .as_ref()
        .expect("redispatched");
    assert_eq!(in_flight.item.attempt, 2);
    h.complete().await;
    let attempts: Vec<u32> = h.worker.calls().iter().map(|c| c.attempt).collect();
    assert_eq!(attempts, vec![1, 2]);
}
