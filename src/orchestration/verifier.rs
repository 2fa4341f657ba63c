//! Completion verifier: the eight-criterion readiness gate.
//!
//! [`evaluate`] is a pure function of the PR facts, the local probe and the
//! clock, so verifying twice against the same facts gives the same answer.
//! [`Verifier::verify`] only adds the fetch.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::{AuthorsConfig, GateConfig};
use crate::core::{AuthorKind, Criteria, Criterion, PrId};
use crate::host::{
    Comment, HostError, HostingProvider, Mergeable, PrFacts, PrState, ReviewState,
};
use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CriterionDetail {
    pub criterion: Criterion,
    pub passed: bool,
    /// False when the engine can only wait (pending CI, mergeability still
    /// being computed) or nothing it does could help.
    pub actionable: bool,
    pub reason: String,
}

impl CriterionDetail {
    fn pass(criterion: Criterion) -> Self {
        Self {
            criterion,
            passed: true,
            actionable: false,
            reason: String::new(),
        }
    }

    fn fail(criterion: Criterion, actionable: bool, reason: impl Into<String>) -> Self {
        Self {
            criterion,
            passed: false,
            actionable,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    PermissionDenied,
    ExternalTerminal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "verdict", content = "reason")]
pub enum Verdict {
    Ready,
    NeedsWork,
    Blocked(BlockReason),
}

/// Criteria values with the reasoning behind each one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub criteria: Criteria,
    pub details: Vec<CriterionDetail>,
}

impl Evaluation {
    pub fn detail(&self, criterion: Criterion) -> Option<&CriterionDetail> {
        self.details.iter().find(|d| d.criterion == criterion)
    }

    /// Failing criteria the engine could act on, highest precedence first.
    pub fn actionable_failures(&self) -> Vec<Criterion> {
        self.criteria
            .failing()
            .into_iter()
            .filter(|c| self.detail(*c).is_some_and(|d| d.actionable))
            .collect()
    }
}

/// One verification pass over a PR.
#[derive(Debug, Clone)]
pub struct Verification {
    pub verdict: Verdict,
    pub evaluation: Evaluation,
    /// `None` when the host refused to show the PR.
    pub facts: Option<PrFacts>,
    pub message: Option<String>,
}

impl Verification {
    pub fn criteria(&self) -> Criteria {
        self.evaluation.criteria
    }

    pub fn is_ready(&self) -> bool {
        self.verdict == Verdict::Ready
    }
}

/// Everything [`evaluate`] needs besides the facts.
#[derive(Debug, Clone, Copy)]
pub struct EvalContext<'a> {
    pub gate: &'a GateConfig,
    pub authors: &'a AuthorsConfig,
    pub engine_login: &'a str,
    /// Whether the engine's worktree for this branch holds commits the
    /// remote has not seen.
    pub local_unpushed: bool,
    pub now: DateTime<Utc>,
}

impl EvalContext<'_> {
    fn is_engine(&self, login: &str) -> bool {
        !self.engine_login.is_empty() && login.eq_ignore_ascii_case(self.engine_login)
    }
}

pub fn verdict_for(facts: &PrFacts, criteria: &Criteria) -> Verdict {
    if facts.state != PrState::Open {
        Verdict::Blocked(BlockReason::ExternalTerminal)
    } else if criteria.all_passed() {
        Verdict::Ready
    } else {
        Verdict::NeedsWork
    }
}

pub fn evaluate(facts: &PrFacts, ctx: &EvalContext<'_>) -> Evaluation {
    let details = vec![
        reviews_addressed(facts, ctx),
        comments_acknowledged(facts, ctx),
        quiet_period(facts, ctx),
        ci_passing(facts, ctx),
        no_unresolved_threads(facts),
        merge_eligible(facts),
        not_merged(facts),
        commits_pushed(ctx),
    ];
    let mut criteria = Criteria::default();
    for detail in &details {
        criteria.set(detail.criterion, detail.passed);
    }
    Evaluation { criteria, details }
}

fn mentions(body: &str, login: &str) -> bool {
    let needle = format!("@{}", login.to_ascii_lowercase());
    let body = body.to_ascii_lowercase();
    body.match_indices(&needle).any(|(i, _)| {
        body[i + needle.len()..]
            .chars()
            .next()
            .map_or(true, |c| !(c.is_ascii_alphanumeric() || c == '-' || c == '_'))
    })
}

/// Comments written by the PR author or the engine that are not engine
/// bookkeeping (snapshots, notifications).
fn replies<'f>(facts: &'f PrFacts, ctx: &EvalContext<'_>) -> impl Iterator<Item = &'f Comment> {
    let author = facts.author.clone();
    let engine = ctx.engine_login.to_string();
    facts.comments.iter().filter(move |c| {
        !c.is_engine_tagged()
            && (c.author.eq_ignore_ascii_case(&author)
                || (!engine.is_empty() && c.author.eq_ignore_ascii_case(&engine)))
    })
}

fn reviews_addressed(facts: &PrFacts, ctx: &EvalContext<'_>) -> CriterionDetail {
    let mut latest: Vec<(&str, ReviewState, Option<DateTime<Utc>>)> = Vec::new();
    for review in facts.reviews.iter().filter(|r| r.state.is_decisive()) {
        match latest.iter_mut().find(|(who, _, _)| *who == review.author) {
            Some(entry) if entry.2 <= review.submitted_at => {
                *entry = (review.author.as_str(), review.state, review.submitted_at)
            }
            Some(_) => {}
            None => latest.push((review.author.as_str(), review.state, review.submitted_at)),
        }
    }

    let outstanding: Vec<&str> = latest
        .iter()
        .filter(|(_, state, _)| *state == ReviewState::ChangesRequested)
        .filter(|(who, _, at)| {
            !replies(facts, ctx).any(|c| Some(c.created_at) > *at && mentions(&c.body, who))
        })
        .map(|(who, _, _)| *who)
        .collect();

    if outstanding.is_empty() {
        CriterionDetail::pass(Criterion::ReviewsAddressed)
    } else {
        CriterionDetail::fail(
            Criterion::ReviewsAddressed,
            true,
            format!("changes requested by {}", outstanding.join(", ")),
        )
    }
}

fn needs_response(comment: &Comment, facts: &PrFacts, ctx: &EvalContext<'_>) -> bool {
    if comment.is_engine_tagged()
        || comment.author.eq_ignore_ascii_case(&facts.author)
        || ctx.is_engine(&comment.author)
    {
        return false;
    }
    (!ctx.engine_login.is_empty() && mentions(&comment.body, ctx.engine_login))
        || comment.body.contains('?')
        || AuthorKind::classify(&comment.author, ctx.authors) == AuthorKind::ReviewBot
}

fn comments_acknowledged(facts: &PrFacts, ctx: &EvalContext<'_>) -> CriterionDetail {
    let unanswered: Vec<u64> = facts
        .comments
        .iter()
        .filter(|c| needs_response(c, facts, ctx))
        .filter(|c| !replies(facts, ctx).any(|r| r.created_at > c.created_at))
        .map(|c| c.id)
        .collect();
    match unanswered.len() {
        0 => CriterionDetail::pass(Criterion::CommentsAcknowledged),
        n => CriterionDetail::fail(
            Criterion::CommentsAcknowledged,
            true,
            format!("{} comment(s) awaiting a response", n),
        ),
    }
}

/// Latest human-visible activity: commits, reviews, and comments other
/// than the engine's own bookkeeping.
pub fn last_activity(facts: &PrFacts) -> Option<DateTime<Utc>> {
    let comments = facts
        .comments
        .iter()
        .filter(|c| !c.is_engine_tagged())
        .map(|c| c.created_at);
    let reviews = facts.reviews.iter().filter_map(|r| r.submitted_at);
    comments.chain(reviews).chain(facts.last_commit_at).max()
}

fn quiet_period(facts: &PrFacts, ctx: &EvalContext<'_>) -> CriterionDetail {
    let quiet = chrono::Duration::from_std(ctx.gate.quiet_period())
        .unwrap_or_else(|_| chrono::Duration::zero());
    match last_activity(facts) {
        Some(at) if ctx.now - at < quiet => {
            let left = (quiet - (ctx.now - at)).num_seconds().max(0);
            CriterionDetail::fail(
                Criterion::QuietPeriod,
                false,
                format!("activity at {}, quiet for {}s more", at.to_rfc3339(), left),
            )
        }
        _ => CriterionDetail::pass(Criterion::QuietPeriod),
    }
}

fn ci_passing(facts: &PrFacts, ctx: &EvalContext<'_>) -> CriterionDetail {
    let required: Vec<_> = facts.checks.iter().filter(|c| c.required).collect();
    let considered = if !required.is_empty() {
        required
    } else if ctx.gate.require_all_checks_when_unprotected {
        facts.checks.iter().collect()
    } else {
        Vec::new()
    };

    let failed: Vec<&str> = considered
        .iter()
        .filter(|c| !c.status.is_passing() && !c.status.is_pending())
        .map(|c| c.name.as_str())
        .collect();
    let pending: Vec<&str> = considered
        .iter()
        .filter(|c| c.status.is_pending())
        .map(|c| c.name.as_str())
        .collect();

    if !failed.is_empty() {
        CriterionDetail::fail(
            Criterion::CiPassing,
            true,
            format!("failing checks: {}", failed.join(", ")),
        )
    } else if !pending.is_empty() {
        CriterionDetail::fail(
            Criterion::CiPassing,
            false,
            format!("pending checks: {}", pending.join(", ")),
        )
    } else {
        CriterionDetail::pass(Criterion::CiPassing)
    }
}

fn no_unresolved_threads(facts: &PrFacts) -> CriterionDetail {
    let open = facts
        .review_threads
        .iter()
        .filter(|t| !t.is_resolved && !t.is_outdated)
        .count();
    if open == 0 {
        CriterionDetail::pass(Criterion::NoUnresolvedThreads)
    } else {
        CriterionDetail::fail(
            Criterion::NoUnresolvedThreads,
            true,
            format!("{} unresolved review thread(s)", open),
        )
    }
}

fn merge_eligible(facts: &PrFacts) -> CriterionDetail {
    match facts.mergeable {
        Mergeable::Mergeable => CriterionDetail::pass(Criterion::MergeEligible),
        Mergeable::Conflicting => CriterionDetail::fail(
            Criterion::MergeEligible,
            true,
            format!("conflicts with {}", facts.base_ref),
        ),
        Mergeable::Unknown => CriterionDetail::fail(
            Criterion::MergeEligible,
            false,
            "mergeability not computed yet",
        ),
    }
}

fn not_merged(facts: &PrFacts) -> CriterionDetail {
    match facts.state {
        PrState::Open => CriterionDetail::pass(Criterion::NotMerged),
        PrState::Merged => CriterionDetail::fail(Criterion::NotMerged, false, "already merged"),
        PrState::Closed => CriterionDetail::fail(Criterion::NotMerged, false, "closed"),
    }
}

fn commits_pushed(ctx: &EvalContext<'_>) -> CriterionDetail {
    if ctx.local_unpushed {
        CriterionDetail::fail(
            Criterion::CommitsPushed,
            true,
            "worktree has commits not on the remote",
        )
    } else {
        CriterionDetail::pass(Criterion::CommitsPushed)
    }
}

/// Criteria that went from true to false. Only `quiet_period` may do so
/// without new facts.
pub fn regressions(before: &Criteria, after: &Criteria) -> Vec<Criterion> {
    Criterion::ALL
        .iter()
        .copied()
        .filter(|c| before.get(*c) && !after.get(*c))
        .collect()
}

pub struct Verifier {
    host: Arc<dyn HostingProvider>,
    gate: GateConfig,
    authors: AuthorsConfig,
    engine_login: String,
}

impl Verifier {
    pub fn new(
        host: Arc<dyn HostingProvider>,
        gate: GateConfig,
        authors: AuthorsConfig,
        engine_login: impl Into<String>,
    ) -> Self {
        Self {
            host,
            gate,
            authors,
            engine_login: engine_login.into(),
        }
    }

    pub fn engine_login(&self) -> &str {
        &self.engine_login
    }

    pub fn evaluate(&self, facts: &PrFacts, local_unpushed: bool, now: DateTime<Utc>) -> Evaluation {
        evaluate(
            facts,
            &EvalContext {
                gate: &self.gate,
                authors: &self.authors,
                engine_login: &self.engine_login,
                local_unpushed,
                now,
            },
        )
    }

    /// Fetch live facts and evaluate the gate.
    ///
    /// A 403 becomes a `Blocked(PermissionDenied)` verdict rather than an
    /// error; every other host failure propagates.
    pub async fn verify(&self, pr: &PrId, local_unpushed: bool, now: DateTime<Utc>) -> Result<Verification> {
        let facts = match self.host.get_pr_state(pr).await {
            Ok(facts) => facts,
            Err(HostError::PermissionDenied(message)) => {
                tracing::warn!(%pr, %message, "permission denied reading PR");
                return Ok(Verification {
                    verdict: Verdict::Blocked(BlockReason::PermissionDenied),
                    evaluation: Evaluation {
                        criteria: Criteria::default(),
                        details: Vec::new(),
                    },
                    facts: None,
                    message: Some(message),
                });
            }
            Err(e) => return Err(e.into()),
        };
        let evaluation = self.evaluate(&facts, local_unpushed, now);
        let verdict = verdict_for(&facts, &evaluation.criteria);
        tracing::debug!(
            %pr,
            ?verdict,
            failing = ?evaluation.criteria.failing(),
            "verified"
        );
        Ok(Verification {
            verdict,
            evaluation,
            facts: Some(facts),
            message: None,
        })
    }
}
