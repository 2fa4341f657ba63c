//! One-shot CLI operations and their JSON reports.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::dispatcher::choose_kind;
use super::notify::Notifier;
use super::recovery::reset_passed;
use super::verifier::{BlockReason, Verdict, Verification, Verifier};
use crate::config::{AuthorsConfig, TrackingConfig};
use crate::core::{
    lifecycle, AuthorKind, Blocker, Criteria, Criterion, LifecycleState, PrId, PrRecord, RepoSlug,
};
use crate::host::{HostError, HostingProvider, PrState};
use crate::state::{restore, Persisted, StateStore};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrRow {
    pub number: u64,
    pub status: LifecycleState,
    pub priority: Priority,
    pub action_needed: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PollReport {
    pub prs: Vec<PrRow>,
}

/// The verdict as `verify` reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    ReadyToMerge,
    NeedsWork,
    Blocked,
}

impl From<Verdict> for Recommendation {
    fn from(verdict: Verdict) -> Self {
        match verdict {
            Verdict::Ready => Recommendation::ReadyToMerge,
            Verdict::NeedsWork => Recommendation::NeedsWork,
            Verdict::Blocked(_) => Recommendation::Blocked,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub complete: bool,
    pub criteria: Criteria,
    pub failing_criteria: Vec<Criterion>,
    pub recommendation: Recommendation,
    pub action_needed: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub repo: String,
    pub total: usize,
    pub by_state: BTreeMap<LifecycleState, usize>,
}

impl StatusReport {
    pub fn from_rows(repo: &RepoSlug, rows: &[PrRow]) -> Self {
        let mut by_state = BTreeMap::new();
        for row in rows {
            *by_state.entry(row.status).or_insert(0) += 1;
        }
        Self {
            repo: repo.to_string(),
            total: rows.len(),
            by_state,
        }
    }
}

pub fn priority_for(status: LifecycleState, failing: &[Criterion]) -> Priority {
    match status {
        LifecycleState::Blocked | LifecycleState::ReadyToMerge => Priority::High,
        LifecycleState::Draft | LifecycleState::Merged | LifecycleState::Closed => Priority::Low,
        _ if failing.contains(&Criterion::MergeEligible) || failing.contains(&Criterion::CiPassing) => {
            Priority::High
        }
        _ if failing.iter().any(|c| *c != Criterion::QuietPeriod) => Priority::Medium,
        _ => Priority::Low,
    }
}

/// What should happen next on a PR, in a few words.
pub fn action_needed(
    status: LifecycleState,
    verification: &Verification,
    author: AuthorKind,
    blocker: Option<&Blocker>,
) -> String {
    match status {
        LifecycleState::ReadyToMerge => return "merge (human)".to_string(),
        LifecycleState::Draft => return "none: draft".to_string(),
        LifecycleState::Merged | LifecycleState::Closed => return "none".to_string(),
        LifecycleState::Blocked => {
            return match blocker {
                Some(b) => format!("human: {}", b.cause),
                None => "human: permission denied".to_string(),
            }
        }
        _ => {}
    }
    let evaluation = &verification.evaluation;
    if let Some(criterion) = evaluation.actionable_failures().first().copied() {
        let reason = evaluation
            .detail(criterion)
            .map(|d| d.reason.as_str())
            .unwrap_or_default();
        return match choose_kind(criterion, author) {
            Some(kind) => format!("{}: {}", kind, reason),
            None => format!("human: {}", reason),
        };
    }
    match evaluation.criteria.failing().first() {
        Some(criterion) => {
            let reason = evaluation
                .detail(*criterion)
                .map(|d| d.reason.as_str())
                .unwrap_or_default();
            format!("wait: {}", reason)
        }
        None => "none".to_string(),
    }
}

pub fn verify_report(verification: &Verification, author: AuthorKind) -> VerifyReport {
    let criteria = verification.criteria();
    let action = match verification.verdict {
        Verdict::Ready => "merge (human)".to_string(),
        Verdict::Blocked(BlockReason::PermissionDenied) => "human: permission denied".to_string(),
        Verdict::Blocked(BlockReason::ExternalTerminal) => "none".to_string(),
        Verdict::NeedsWork => {
            let status = verification
                .facts
                .as_ref()
                .map(|f| lifecycle::derive(f, &criteria))
                .unwrap_or(LifecycleState::NeedsReview);
            action_needed(status, verification, author, None)
        }
    };
    VerifyReport {
        complete: verification.is_ready(),
        criteria,
        failing_criteria: criteria.failing(),
        recommendation: verification.verdict.into(),
        action_needed: action,
    }
}

/// Verify every tracked open PR once, without acting on any of them.
///
/// A blocker recorded in a PR's latest snapshot for the current head is
/// reported as `blocked`.
pub async fn poll_report(
    host: &dyn HostingProvider,
    verifier: &Verifier,
    store: &StateStore,
    tracking: &TrackingConfig,
    authors: &AuthorsConfig,
    repo: &RepoSlug,
    now: DateTime<Utc>,
) -> Result<PollReport> {
    let mut report = PollReport::default();
    for pr in host.list_open_prs(repo).await? {
        if !tracking.matches(&pr.base_ref, &pr.author, pr.is_draft) {
            continue;
        }
        let id = PrId::new(repo.clone(), pr.number);
        let verification = verifier.verify(&id, false, now).await?;
        let author = AuthorKind::classify(&pr.author, authors);
        let criteria = verification.criteria();

        let (status, blocker) = match (&verification.verdict, verification.facts.as_ref()) {
            (Verdict::Blocked(BlockReason::PermissionDenied), _) | (_, None) => {
                (LifecycleState::Blocked, None)
            }
            (_, Some(facts)) => {
                let derived = lifecycle::derive(facts, &criteria);
                let blocker = store
                    .latest(facts)
                    .and_then(|s| s.payload.blocker)
                    .filter(|b| b.head_sha == facts.head_sha && !derived.is_terminal());
                let blocker = blocker.filter(|b| !b.clears(&facts.head_sha, &criteria, true));
                let status = match (&blocker, facts.state) {
                    (_, PrState::Merged) => LifecycleState::Merged,
                    (_, PrState::Closed) => LifecycleState::Closed,
                    (Some(_), _) => LifecycleState::Blocked,
                    (None, _) => derived,
                };
                (status, blocker)
            }
        };

        let failing = criteria.failing();
        report.prs.push(PrRow {
            number: pr.number,
            status,
            priority: priority_for(status, &failing),
            action_needed: action_needed(status, &verification, author, blocker.as_ref()),
        });
    }
    Ok(report)
}

/// Verify one PR and write its snapshot on demand.
///
/// Entering `ReadyToMerge` here opens a new ready episode and announces it,
/// exactly as a poll would.
///
/// # Errors
///
/// Returns [`Error::IdempotencySkip`] when the latest snapshot already
/// holds this state.
pub async fn checkpoint(
    verifier: &Verifier,
    store: &StateStore,
    notifier: &Notifier,
    authors: &AuthorsConfig,
    poll_interval: Duration,
    pr: &PrId,
    now: DateTime<Utc>,
) -> Result<Persisted> {
    let verification = verifier.verify(pr, false, now).await?;
    let Some(facts) = verification.facts.as_ref() else {
        return Err(Error::Host(HostError::PermissionDenied(
            verification.message.clone().unwrap_or_default(),
        )));
    };

    let mut record = PrRecord::new(
        pr.clone(),
        facts.head_ref.clone(),
        facts.head_sha.clone(),
        AuthorKind::classify(&facts.author, authors),
        poll_interval,
        now,
    );
    if let Some(snapshot) = store.latest(facts) {
        let stale = store.validate(&snapshot, facts).is_err();
        restore(&mut record, &snapshot, stale);
    }
    let prev_state = record.effective_state();

    let criteria = verification.criteria();
    reset_passed(&mut record, &criteria);
    record.criteria = criteria;
    record.criteria_trusted = true;
    record.lifecycle_state = lifecycle::derive(facts, &criteria);
    if record
        .blocker
        .as_ref()
        .is_some_and(|b| b.clears(&record.head_sha, &criteria, true))
    {
        record.blocker = None;
    }

    if record.effective_state() == LifecycleState::ReadyToMerge
        && prev_state != LifecycleState::ReadyToMerge
    {
        record.ready_episode += 1;
        notifier.ready(&record).await?;
    }

    match store.persist(&mut record, Utc::now()).await? {
        Persisted::Unchanged { marker } => Err(Error::IdempotencySkip { marker }),
        written => Ok(written),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GateConfig;
    use crate::core::BlockCause;
    use crate::host::memory::InMemoryHost;
    use crate::host::{CheckRun, CheckStatus, PrFacts};
    use crate::core::PrRecord;
    use crate::state::SnapshotPayload;
    use std::sync::Arc;
    use std::time::Duration;

    fn gate() -> GateConfig {
        GateConfig {
            quiet_period_secs: 0,
            require_all_checks_when_unprotected: true,
        }
    }

    fn setup() -> (Arc<InMemoryHost>, Verifier, StateStore, RepoSlug) {
        let host = Arc::new(InMemoryHost::new("prflow-bot"));
        let verifier = Verifier::new(host.clone(), gate(), AuthorsConfig::default(), "prflow-bot");
        let store = StateStore::new(host.clone(), "prflow-bot");
        (host, verifier, store, RepoSlug::new("acme", "widgets"))
    }

    fn agent_authors() -> AuthorsConfig {
        AuthorsConfig {
            agent: vec!["octocat".to_string()],
            ..AuthorsConfig::default()
        }
    }

    fn failing_ci(number: u64) -> PrFacts {
        let mut facts = PrFacts::new_open(number, format!("feature/{}", number), "abc123");
        facts.last_commit_at = Some(Utc::now() - chrono::Duration::hours(1));
        facts.updated_at = Utc::now() - chrono::Duration::hours(1);
        facts.checks.push(CheckRun {
            name: "test".into(),
            status: CheckStatus::Failure,
            required: true,
        });
        facts
    }

    #[test]
    fn test_priority() {
        assert_eq!(priority_for(LifecycleState::Blocked, &[]), Priority::High);
        assert_eq!(
            priority_for(LifecycleState::CiPending, &[Criterion::CiPassing]),
            Priority::High
        );
        assert_eq!(
            priority_for(LifecycleState::NeedsReview, &[Criterion::CommentsAcknowledged]),
            Priority::Medium
        );
        assert_eq!(
            priority_for(LifecycleState::Approved, &[Criterion::QuietPeriod]),
            Priority::Low
        );
        assert_eq!(priority_for(LifecycleState::Draft, &[Criterion::CiPassing]), Priority::Low);
    }

    #[tokio::test]
    async fn test_poll_report_rows() {
        let (host, verifier, store, repo) = setup();
        host.upsert_pr(&repo, failing_ci(42));
        let mut draft = PrFacts::new_open(43, "feature/43", "def456");
        draft.is_draft = true;
        host.upsert_pr(&repo, draft);

        let report = poll_report(
            host.as_ref(),
            &verifier,
            &store,
            &TrackingConfig::default(),
            &agent_authors(),
            &repo,
            Utc::now(),
        )
        .await
        .unwrap();
        assert_eq!(report.prs.len(), 2);
        let pr42 = report.prs.iter().find(|r| r.number == 42).unwrap();
        assert_eq!(pr42.status, LifecycleState::CiPending);
        assert_eq!(pr42.priority, Priority::High);
        assert!(pr42.action_needed.starts_with("ci_fix"), "{}", pr42.action_needed);
        let pr43 = report.prs.iter().find(|r| r.number == 43).unwrap();
        assert_eq!(pr43.status, LifecycleState::Draft);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["prs"][0]["priority"], "high");
    }

    #[tokio::test]
    async fn test_snapshot_blocker_reported_as_blocked() {
        let (host, verifier, store, repo) = setup();
        host.upsert_pr(&repo, failing_ci(42));
        let id = PrId::new(repo.clone(), 42);
        let mut record = PrRecord::new(
            id.clone(),
            "feature/42",
            "abc123",
            AuthorKind::AgentBot,
            Duration::from_secs(60),
            Utc::now(),
        );
        record.block(
            BlockCause::RetriesExhausted {
                criterion: Criterion::CiPassing,
            },
            Utc::now(),
        );
        let body = SnapshotPayload::from_record(&record, Utc::now())
            .to_comment_body()
            .unwrap();
        host.add_comment(&id, "prflow-bot", &body);

        let report = poll_report(
            host.as_ref(),
            &verifier,
            &store,
            &TrackingConfig::default(),
            &AuthorsConfig::default(),
            &repo,
            Utc::now(),
        )
        .await
        .unwrap();
        assert_eq!(report.prs[0].status, LifecycleState::Blocked);
        assert!(report.prs[0].action_needed.starts_with("human:"));
    }

    #[tokio::test]
    async fn test_verify_report() {
        let (host, verifier, _store, repo) = setup();
        host.upsert_pr(&repo, failing_ci(42));
        let v = verifier
            .verify(&PrId::new(repo, 42), false, Utc::now())
            .await
            .unwrap();
        let report = verify_report(&v, AuthorKind::AgentBot);
        assert!(!report.complete);
        assert_eq!(report.failing_criteria, vec![Criterion::CiPassing]);
        assert_eq!(report.recommendation, Recommendation::NeedsWork);
        assert!(report.action_needed.starts_with("ci_fix"), "{}", report.action_needed);
    }

    #[tokio::test]
    async fn test_verify_recommendation_is_a_verdict_name() {
        let (host, verifier, _store, repo) = setup();
        let mut green = PrFacts::new_open(42, "feature/42", "abc123");
        green.last_commit_at = Some(Utc::now() - chrono::Duration::hours(1));
        host.upsert_pr(&repo, green);
        host.upsert_pr(&repo, failing_ci(43));
        let mut merged = PrFacts::new_open(44, "feature/44", "abc123");
        merged.state = PrState::Merged;
        host.upsert_pr(&repo, merged);

        let mut seen = Vec::new();
        for number in [42, 43, 44] {
            let v = verifier
                .verify(&PrId::new(repo.clone(), number), false, Utc::now())
                .await
                .unwrap();
            let json = serde_json::to_value(verify_report(&v, AuthorKind::AgentBot)).unwrap();
            seen.push(json["recommendation"].as_str().unwrap().to_string());
        }
        assert_eq!(seen, vec!["ready_to_merge", "needs_work", "blocked"]);
    }

    #[tokio::test]
    async fn test_checkpoint_skips_identical_state() {
        let (host, verifier, store, repo) = setup();
        host.upsert_pr(&repo, failing_ci(42));
        let notifier = Notifier::new(host.clone());
        let id = PrId::new(repo, 42);
        let authors = agent_authors();
        let interval = Duration::from_secs(60);

        let first = checkpoint(&verifier, &store, &notifier, &authors, interval, &id, Utc::now())
            .await
            .unwrap();
        assert!(matches!(first, Persisted::Written { .. }));
        let second = checkpoint(&verifier, &store, &notifier, &authors, interval, &id, Utc::now()).await;
        assert!(matches!(second, Err(Error::IdempotencySkip { .. })));
        assert_eq!(host.comments_with_marker_prefix(&id, "state-42-").len(), 1);
    }

    #[tokio::test]
    async fn test_checkpoint_announces_ready_once() {
        let (host, verifier, store, repo) = setup();
        let mut facts = PrFacts::new_open(42, "feature/42", "abc123");
        facts.last_commit_at = Some(Utc::now() - chrono::Duration::hours(1));
        host.upsert_pr(&repo, facts);
        let notifier = Notifier::new(host.clone());
        let id = PrId::new(repo, 42);
        let authors = agent_authors();
        let interval = Duration::from_secs(60);

        checkpoint(&verifier, &store, &notifier, &authors, interval, &id, Utc::now())
            .await
            .unwrap();
        let _ = checkpoint(&verifier, &store, &notifier, &authors, interval, &id, Utc::now()).await;
        assert_eq!(host.comments_with_marker_prefix(&id, "ready-42-1").len(), 1);
        assert!(host.comments_with_marker_prefix(&id, "ready-42-2").is_empty());
    }

    #[test]
    fn test_status_counts() {
        let rows = vec![
            PrRow {
                number: 1,
                status: LifecycleState::Draft,
                priority: Priority::Low,
                action_needed: String::new(),
            },
            PrRow {
                number: 2,
                status: LifecycleState::Draft,
                priority: Priority::Low,
                action_needed: String::new(),
            },
        ];
        let status = StatusReport::from_rows(&RepoSlug::new("acme", "widgets"), &rows);
        assert_eq!(status.total, 2);
        assert_eq!(status.by_state[&LifecycleState::Draft], 2);
    }
}
