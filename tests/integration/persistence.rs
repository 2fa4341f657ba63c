//! Snapshot persistence across polls and restarts.

use chrono::Utc;

use prflow::core::{BlockCause, Criterion, WorkError};
use prflow::host::CheckStatus;
use prflow::orchestration::SchedulerEvent;

use crate::fixtures::{set_ci, test_config, Harness, Step, ENGINE};

/// Drive `pr` to a retries-exhausted block.
async fn exhaust(h: &mut Harness, pr: &prflow::core::PrId) {
    h.discover().await;
    for _ in 0..4 {
        h.poll(pr).await;
        h.complete().await;
    }
    h.poll(pr).await;
    assert!(h.scheduler.record(pr).unwrap().is_blocked());
}

fn restart(h: Harness) -> Harness {
    let Harness {
        repo,
        host,
        scheduler,
        ..
    } = h;
    drop(scheduler);
    Harness::with_host(repo, host, test_config())
}

#[tokio::test]
async fn test_unchanged_polls_write_one_snapshot() {
    let mut h = Harness::new();
    let pr = h.open(42, "feature/wait");
    set_ci(&h.host, &pr, CheckStatus::Pending);

    h.discover().await;
    for _ in 0..5 {
        h.poll(&pr).await;
    }
    assert_eq!(h.markers(&pr, "state-42-"), 1);

    set_ci(&h.host, &pr, CheckStatus::Failure);
    h.poll(&pr).await;
    assert_eq!(h.markers(&pr, "state-42-2-"), 1);
    h.complete().await;
}

#[tokio::test]
async fn test_restart_keeps_counters_and_blocker() {
    let mut h = Harness::new();
    let pr = h.open(42, "feature/red");
    set_ci(&h.host, &pr, CheckStatus::Failure);
    exhaust(&mut h, &pr).await;

    let mut h = restart(h);
    let mut events = h.scheduler.subscribe();
    h.discover().await;
    h.poll(&pr).await;

    let record = h.scheduler.record(&pr).unwrap();
    assert!(record.is_blocked());
    assert_eq!(record.retry_count.get(Criterion::CiPassing), 4);
    assert!(h.worker.calls().is_empty());
    assert_eq!(h.markers(&pr, "escalate-42-"), 1);

    let mut resumed = None;
    while let Ok(event) = events.try_recv() {
        if let SchedulerEvent::Resumed { stale, .. } = event {
            resumed = Some(stale);
        }
    }
    assert_eq!(resumed, Some(false));
}

#[tokio::test]
async fn test_restart_keeps_isolation_block() {
    let mut h = Harness::new();
    let pr = h.open(42, "feature/iso");
    set_ci(&h.host, &pr, CheckStatus::Failure);
    h.worker
        .push(Step::fail(WorkError::Isolation("lease lost".into())));
    h.discover().await;
    h.poll(&pr).await;
    h.complete().await;
    h.poll(&pr).await;

    let mut h = restart(h);
    h.discover().await;
    h.poll(&pr).await;

    let record = h.scheduler.record(&pr).unwrap();
    assert!(matches!(
        record.blocker.as_ref().map(|b| &b.cause),
        Some(BlockCause::IsolationViolation { .. })
    ));
    assert!(h.worker.calls().is_empty());
}

#[tokio::test]
async fn test_stale_snapshot_drops_blocker() {
    let mut h = Harness::new();
    let pr = h.open(42, "feature/iso");
    set_ci(&h.host, &pr, CheckStatus::Failure);
    h.worker
        .push(Step::fail(WorkError::Isolation("lease lost".into())));
    h.discover().await;
    h.poll(&pr).await;
    h.complete().await;
    h.poll(&pr).await;

    // Activity on the PR after the last snapshot.
    h.host.update_pr(&pr, |f| {
        f.updated_at = Utc::now() + chrono::Duration::minutes(1)
    });

    let mut h = restart(h);
    let mut events = h.scheduler.subscribe();
    h.discover().await;
    h.poll(&pr).await;

    let record = h.scheduler.record(&pr).unwrap();
    assert!(!record.is_blocked());
    assert!(record.in_flight.is_some());
    h.complete().await;
    assert_eq!(h.worker.calls().len(), 1);

    let stale = std::iter::from_fn(|| events.try_recv().ok()).find_map(|e| match e {
        SchedulerEvent::Resumed { stale, .. } => Some(stale),
        _ => None,
    });
    assert_eq!(stale, Some(true));
}

#[tokio::test]
async fn test_legacy_snapshot_counters_carry_over() {
    let mut h = Harness::new();
    let pr = h.open(42, "feature/old");
    set_ci(&h.host, &pr, CheckStatus::Failure);
    let body = format!(
        r#"status <!-- prflow:state {{"pr":42,"status":"ci_pending","retryCount":{{"ci_passing":2}},"timestamp":"{}"}} -->"#,
        Utc::now().to_rfc3339()
    );
    h.host.add_comment(&pr, ENGINE, &body);

    h.discover().await;
    h.poll(&pr).await;
    h.complete().await;

    let attempts: Vec<u32> = h.worker.calls().iter().map(|c| c.attempt).collect();
    assert_eq!(attempts, vec![3]);

    // The next write is in the current schema.
    let written = h.host.comments_with_marker_prefix(&pr, "state-42-1-");
    assert_eq!(written.len(), 1);
    assert!(written[0].body.contains(r#""schemaVersion":1"#));
}
