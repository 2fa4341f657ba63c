//! Pull request identity and the per-PR record owned by the scheduler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::author::AuthorKind;
use super::criteria::{Criteria, Criterion, RetryCounts};
use super::ids::WorktreeId;
use super::lifecycle::{BlockCause, Blocker, LifecycleState};
use super::work::{chrono_duration, InFlight};
use crate::{Error, Result};

/// `owner/name` of a hosted repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RepoSlug {
    pub owner: String,
    pub name: String,
}

impl RepoSlug {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }

    /// Filesystem-safe form, used for lock files and worktree roots.
    pub fn file_stem(&self) -> String {
        format!("{}__{}", self.owner, self.name)
    }
}

impl std::fmt::Display for RepoSlug {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

impl std::str::FromStr for RepoSlug {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let valid = |part: &str| {
            !part.is_empty()
                && part
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        };
        match s.trim().split_once('/') {
            Some((owner, name)) if valid(owner) && valid(name) => Ok(Self::new(owner, name)),
            _ => Err(Error::InvalidParams(format!(
                "repository must be owner/name, got {:?}",
                s
            ))),
        }
    }
}

/// Immutable key of a tracked pull request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PrId {
    pub repo: RepoSlug,
    pub number: u64,
}

impl PrId {
    pub fn new(repo: RepoSlug, number: u64) -> Self {
        Self { repo, number }
    }
}

impl std::fmt::Display for PrId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.repo, self.number)
    }
}

/// Everything the engine tracks about one pull request.
///
/// Only the scheduler and the recovery controller mutate a record.
#[derive(Debug, Clone)]
pub struct PrRecord {
    pub id: PrId,
    pub branch: String,
    pub head_sha: String,
    pub author_kind: AuthorKind,
    /// Fact-derived state. See [`PrRecord::effective_state`] for the overlay.
    pub lifecycle_state: LifecycleState,
    pub blocker: Option<Blocker>,
    pub criteria: Criteria,
    /// False until criteria have been evaluated against live facts.
    pub criteria_trusted: bool,
    pub retry_count: RetryCounts,
    /// Transient retries of the current work item.
    pub transient_retries: u32,
    pub poll_interval: Duration,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub last_changed_at: DateTime<Utc>,
    pub assigned_worktree_id: Option<WorktreeId>,
    pub in_flight: Option<InFlight>,
    /// Criterion a finished work item targeted, charged against its retry
    /// counter if the next verification still finds it failing.
    pub unverified_attempt: Option<Criterion>,
    /// Incremented each time the PR enters `ReadyToMerge`.
    pub ready_episode: u32,
    /// Sequence number of the last snapshot written for this record.
    pub snapshot_seq: u32,
    /// Content hash of the last snapshot written, to skip identical writes.
    pub persisted_fingerprint: Option<String>,
}

impl PrRecord {
    pub fn new(
        id: PrId,
        branch: impl Into<String>,
        head_sha: impl Into<String>,
        author_kind: AuthorKind,
        poll_interval: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            branch: branch.into(),
            head_sha: head_sha.into(),
            author_kind,
            lifecycle_state: LifecycleState::NeedsReview,
            blocker: None,
            criteria: Criteria::default(),
            criteria_trusted: false,
            retry_count: RetryCounts::default(),
            transient_retries: 0,
            poll_interval,
            last_polled_at: None,
            last_changed_at: now,
            assigned_worktree_id: None,
            in_flight: None,
            unverified_attempt: None,
            ready_episode: 0,
            snapshot_seq: 0,
            persisted_fingerprint: None,
        }
    }

    /// The state reported outward: `Blocked` while a blocker is present.
    pub fn effective_state(&self) -> LifecycleState {
        if self.blocker.is_some() && !self.lifecycle_state.is_terminal() {
            LifecycleState::Blocked
        } else {
            self.lifecycle_state
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.effective_state() == LifecycleState::Blocked
    }

    pub fn next_poll_at(&self) -> DateTime<Utc> {
        match self.last_polled_at {
            Some(at) => at + chrono_duration(self.poll_interval),
            None => self.last_changed_at,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_poll_at() <= now
    }

    /// Force the next tick to poll this record.
    pub fn mark_due(&mut self) {
        self.last_polled_at = None;
    }

    pub fn block(&mut self, cause: BlockCause, now: DateTime<Utc>) {
        self.blocker = Some(Blocker {
            cause,
            triggered_from: self.lifecycle_state,
            head_sha: self.head_sha.clone(),
            since: now,
        });
    }

    /// Move to `Merged` or `Closed`. The worktree must already be reclaimed.
    ///
    /// A merge is attested by the host, so the gate is recorded as passed.
    pub fn mark_terminal(&mut self, state: LifecycleState) -> Result<()> {
        if !state.is_terminal() {
            return Err(Error::Invariant(format!(
                "{} is not a terminal state",
                state
            )));
        }
        if self.assigned_worktree_id.is_some() {
            return Err(Error::Invariant(format!(
                "{} still holds a worktree",
                self.id
            )));
        }
        if state == LifecycleState::Merged {
            self.criteria = Criteria::all_true();
        }
        self.lifecycle_state = state;
        self.blocker = None;
        self.in_flight = None;
        self.unverified_attempt = None;
        Ok(())
    }
}
