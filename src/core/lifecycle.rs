//! PR lifecycle state machine.
//!
//! States are derived from facts read from the hosting collaborator, never
//! from the engine's own assumptions. `Blocked` is an overlay: the record
//! keeps tracking its fact-derived state underneath and returns to it once
//! the blocker clears.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::criteria::{Criteria, Criterion};
use crate::host::{PrFacts, PrState, ReviewDecision};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Draft,
    NeedsReview,
    ReviewInProgress,
    Approved,
    ChangesRequested,
    CiPending,
    ReadyToMerge,
    Merged,
    Closed,
    Blocked,
}

impl LifecycleState {
    pub const ALL: [LifecycleState; 10] = [
        LifecycleState::Draft,
        LifecycleState::NeedsReview,
        LifecycleState::ReviewInProgress,
        LifecycleState::Approved,
        LifecycleState::ChangesRequested,
        LifecycleState::CiPending,
        LifecycleState::ReadyToMerge,
        LifecycleState::Merged,
        LifecycleState::Closed,
        LifecycleState::Blocked,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Merged | LifecycleState::Closed)
    }

    /// States where progress depends on a person, not on the engine.
    pub fn awaits_human(&self) -> bool {
        matches!(
            self,
            LifecycleState::Draft | LifecycleState::ReadyToMerge | LifecycleState::Blocked
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Draft => "draft",
            LifecycleState::NeedsReview => "needs_review",
            LifecycleState::ReviewInProgress => "review_in_progress",
            LifecycleState::Approved => "approved",
            LifecycleState::ChangesRequested => "changes_requested",
            LifecycleState::CiPending => "ci_pending",
            LifecycleState::ReadyToMerge => "ready_to_merge",
            LifecycleState::Merged => "merged",
            LifecycleState::Closed => "closed",
            LifecycleState::Blocked => "blocked",
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LifecycleState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        LifecycleState::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown lifecycle state: {}", s))
    }
}

/// Why a PR needs a human decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "cause")]
pub enum BlockCause {
    RetriesExhausted { criterion: Criterion },
    PermissionDenied { message: String },
    IsolationViolation { message: String },
    AuthorPolicy { criterion: Criterion },
}

impl BlockCause {
    pub fn criterion(&self) -> Option<Criterion> {
        match self {
            BlockCause::RetriesExhausted { criterion } | BlockCause::AuthorPolicy { criterion } => {
                Some(*criterion)
            }
            _ => None,
        }
    }
}

impl std::fmt::Display for BlockCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockCause::RetriesExhausted { criterion } => {
                write!(f, "automatic retries exhausted for {}", criterion)
            }
            BlockCause::PermissionDenied { message } => write!(f, "permission denied: {}", message),
            BlockCause::IsolationViolation { message } => {
                write!(f, "isolation violation: {}", message)
            }
            BlockCause::AuthorPolicy { criterion } => {
                write!(f, "no automatic action permitted for {} on this author", criterion)
            }
        }
    }
}

/// The blocked overlay on a PR record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blocker {
    pub cause: BlockCause,
    /// Fact-derived state at the moment the PR was blocked.
    pub triggered_from: LifecycleState,
    /// Head SHA at the moment the PR was blocked. A new head means new
    /// human activity, which clears the blocker.
    pub head_sha: String,
    pub since: DateTime<Utc>,
}

impl Blocker {
    /// Whether the cause has gone away given the latest observations.
    pub fn clears(&self, head_sha: &str, criteria: &Criteria, fetch_permitted: bool) -> bool {
        if head_sha != self.head_sha {
            return true;
        }
        match &self.cause {
            BlockCause::RetriesExhausted { criterion } | BlockCause::AuthorPolicy { criterion } => {
                criteria.get(*criterion)
            }
            BlockCause::PermissionDenied { .. } => fetch_permitted,
            BlockCause::IsolationViolation { .. } => false,
        }
    }
}

/// Derive the lifecycle state from live facts and the evaluated gate.
///
/// `ReadyToMerge` is only produced when every criterion passed.
pub fn derive(facts: &PrFacts, criteria: &Criteria) -> LifecycleState {
    match facts.state {
        PrState::Merged => return LifecycleState::Merged,
        PrState::Closed => return LifecycleState::Closed,
        PrState::Open => {}
    }
    if facts.is_draft {
        return LifecycleState::Draft;
    }
    if criteria.all_passed() {
        return LifecycleState::ReadyToMerge;
    }

    let ci_passing = criteria.get(Criterion::CiPassing);
    match facts.review_decision {
        Some(ReviewDecision::ChangesRequested) => LifecycleState::ChangesRequested,
        Some(ReviewDecision::Approved) if !ci_passing => LifecycleState::CiPending,
        Some(ReviewDecision::Approved) => LifecycleState::Approved,
        Some(ReviewDecision::ReviewRequired) => {
            if facts.reviews.is_empty() {
                LifecycleState::NeedsReview
            } else {
                LifecycleState::ReviewInProgress
            }
        }
        // No review policy on the branch: CI is the remaining gate.
        None if !facts.reviews.is_empty() => LifecycleState::ReviewInProgress,
        None if !ci_passing => LifecycleState::CiPending,
        None => LifecycleState::NeedsReview,
    }
}
