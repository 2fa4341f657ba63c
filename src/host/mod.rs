//! The hosting-platform collaborator.
//!
//! Everything the engine knows about a pull request comes through
//! [`HostingProvider`]. The production implementation shells out to the
//! `gh` CLI; tests use [`memory::InMemoryHost`].

pub mod gh_cli;
pub mod memory;
pub mod retry;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::core::{PrId, RepoSlug};

pub use gh_cli::GhCliHost;
pub use memory::InMemoryHost;
pub use retry::RetryingHost;

/// Prefix shared by every HTML tag the engine embeds in comments.
pub const TAG_PREFIX: &str = "<!-- prflow:";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HostError {
    #[error("transient host error: {0}")]
    Transient(String),

    #[error("not authenticated: {0}")]
    NotAuthenticated(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("upstream API error: {0}")]
    Upstream(String),

    #[error("could not decode host response: {0}")]
    Decode(String),
}

impl HostError {
    pub fn is_transient(&self) -> bool {
        matches!(self, HostError::Transient(_))
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            HostError::NotFound(_) => 2,
            HostError::NotAuthenticated(_) => 4,
            _ => 3,
        }
    }
}

pub type HostResult<T> = std::result::Result<T, HostError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PrState {
    Open,
    Closed,
    Merged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewDecision {
    Approved,
    ChangesRequested,
    ReviewRequired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewState {
    Approved,
    ChangesRequested,
    Commented,
    Dismissed,
    Pending,
}

impl ReviewState {
    /// Approvals and change requests settle a reviewer's position.
    pub fn is_decisive(&self) -> bool {
        matches!(
            self,
            ReviewState::Approved | ReviewState::ChangesRequested | ReviewState::Dismissed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Review {
    pub author: String,
    pub state: ReviewState,
    pub submitted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckStatus {
    Success,
    Neutral,
    Skipped,
    Pending,
    Failure,
    Cancelled,
    TimedOut,
    ActionRequired,
}

impl CheckStatus {
    pub fn is_passing(&self) -> bool {
        matches!(
            self,
            CheckStatus::Success | CheckStatus::Neutral | CheckStatus::Skipped
        )
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, CheckStatus::Pending)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckRun {
    pub name: String,
    pub status: CheckStatus,
    pub required: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Mergeable {
    Mergeable,
    Conflicting,
    Unknown,
}

/// A top-level conversation comment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: u64,
    pub author: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

impl Comment {
    /// Whether the body carries one of the engine's hidden tags.
    pub fn is_engine_tagged(&self) -> bool {
        self.body.contains(TAG_PREFIX)
    }

    pub fn has_marker(&self, marker: &str) -> bool {
        self.body.contains(&marker_tag(marker))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewThread {
    pub is_resolved: bool,
    pub is_outdated: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffStat {
    pub additions: u64,
    pub deletions: u64,
    pub changed_files: u64,
}

impl std::fmt::Display for DiffStat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} file(s) changed, +{} -{}",
            self.changed_files, self.additions, self.deletions
        )
    }
}

/// Summary row from the open-PR listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenPr {
    pub number: u64,
    pub head_ref: String,
    pub head_sha: String,
    pub base_ref: String,
    pub author: String,
    pub is_draft: bool,
    pub updated_at: DateTime<Utc>,
}

/// Live facts about one pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrFacts {
    pub number: u64,
    pub head_sha: String,
    pub head_ref: String,
    pub base_ref: String,
    pub state: PrState,
    pub is_draft: bool,
    pub author: String,
    pub review_decision: Option<ReviewDecision>,
    pub reviews: Vec<Review>,
    pub checks: Vec<CheckRun>,
    pub mergeable: Mergeable,
    pub comments: Vec<Comment>,
    pub review_threads: Vec<ReviewThread>,
    pub updated_at: DateTime<Utc>,
    pub last_commit_at: Option<DateTime<Utc>>,
}

impl PrFacts {
    /// An open, mergeable PR with no reviews, checks or comments.
    pub fn new_open(number: u64, head_ref: impl Into<String>, head_sha: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            number,
            head_sha: head_sha.into(),
            head_ref: head_ref.into(),
            base_ref: "main".to_string(),
            state: PrState::Open,
            is_draft: false,
            author: "octocat".to_string(),
            review_decision: None,
            reviews: Vec::new(),
            checks: Vec::new(),
            mergeable: Mergeable::Mergeable,
            comments: Vec::new(),
            review_threads: Vec::new(),
            updated_at: now,
            last_commit_at: Some(now),
        }
    }

    pub fn summary(&self) -> OpenPr {
        OpenPr {
            number: self.number,
            head_ref: self.head_ref.clone(),
            head_sha: self.head_sha.clone(),
            base_ref: self.base_ref.clone(),
            author: self.author.clone(),
            is_draft: self.is_draft,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostedComment {
    pub id: u64,
    /// False when a comment with the same marker already existed.
    pub created: bool,
}

/// Hidden tag that makes a comment idempotent.
pub fn marker_tag(marker: &str) -> String {
    format!("{}marker {} -->", TAG_PREFIX, marker)
}

/// Append the marker tag to a comment body.
pub fn with_marker(body: &str, marker: Option<&str>) -> String {
    match marker {
        Some(m) => format!("{}\n\n{}", body.trim_end(), marker_tag(m)),
        None => body.to_string(),
    }
}

pub trait HostingProvider: Send + Sync {
    /// Login the provider is authenticated as.
    fn viewer_login(&self) -> BoxFuture<'_, HostResult<String>>;

    fn list_open_prs<'a>(&'a self, repo: &'a RepoSlug) -> BoxFuture<'a, HostResult<Vec<OpenPr>>>;

    fn get_pr_state<'a>(&'a self, pr: &'a PrId) -> BoxFuture<'a, HostResult<PrFacts>>;

    /// Post a top-level comment. With a marker, posting is idempotent: an
    /// existing comment carrying the same marker is returned instead.
    fn post_comment<'a>(
        &'a self,
        pr: &'a PrId,
        body: &'a str,
        marker: Option<&'a str>,
    ) -> BoxFuture<'a, HostResult<PostedComment>>;

    fn diff_stat<'a>(&'a self, pr: &'a PrId) -> BoxFuture<'a, HostResult<DiffStat>>;

    fn files_changed<'a>(&'a self, pr: &'a PrId) -> BoxFuture<'a, HostResult<Vec<String>>>;
}
