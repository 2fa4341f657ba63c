//! Author kinds and the automatic actions each one permits.

use serde::{Deserialize, Serialize};

use super::work::WorkKind;
use crate::config::AuthorsConfig;

/// Who opened the pull request. Drives which work the engine may do on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AuthorKind {
    #[default]
    Human,
    /// The engine's own coding agent.
    AgentBot,
    /// A bot that acts when mentioned in a comment.
    MentionBot,
    /// An automated reviewer.
    ReviewBot,
    /// Dependency update bots.
    UpdateBot,
}

/// Allowed automatic actions, one row per author kind.
const POLICY: &[(AuthorKind, &[WorkKind])] = &[
    (
        AuthorKind::Human,
        &[WorkKind::CodeReview, WorkKind::ResponseOnly],
    ),
    (
        AuthorKind::AgentBot,
        &[
            WorkKind::CodeReview,
            WorkKind::CodeChanges,
            WorkKind::CiFix,
            WorkKind::ConflictResolution,
            WorkKind::ResponseOnly,
        ],
    ),
    (
        AuthorKind::MentionBot,
        &[WorkKind::CodeReview, WorkKind::ResponseOnly],
    ),
    (AuthorKind::ReviewBot, &[WorkKind::ResponseOnly]),
    (
        AuthorKind::UpdateBot,
        &[
            WorkKind::CodeReview,
            WorkKind::CiFix,
            WorkKind::ConflictResolution,
        ],
    ),
];

impl AuthorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthorKind::Human => "human",
            AuthorKind::AgentBot => "agent-bot",
            AuthorKind::MentionBot => "mention-bot",
            AuthorKind::ReviewBot => "review-bot",
            AuthorKind::UpdateBot => "update-bot",
        }
    }

    pub fn allowed_actions(self) -> &'static [WorkKind] {
        POLICY
            .iter()
            .find(|(kind, _)| *kind == self)
            .map(|(_, actions)| *actions)
            .unwrap_or(&[])
    }

    pub fn allows(self, action: WorkKind) -> bool {
        self.allowed_actions().contains(&action)
    }

    /// Classify a login using the configured bot lists. Any other login
    /// ending in `[bot]` is treated as a review bot.
    pub fn classify(login: &str, authors: &AuthorsConfig) -> Self {
        let matches = |list: &[String]| list.iter().any(|l| l.eq_ignore_ascii_case(login));
        if matches(&authors.agent) {
            AuthorKind::AgentBot
        } else if matches(&authors.update) {
            AuthorKind::UpdateBot
        } else if matches(&authors.mention) {
            AuthorKind::MentionBot
        } else if matches(&authors.review) || login.ends_with("[bot]") {
            AuthorKind::ReviewBot
        } else {
            AuthorKind::Human
        }
    }
}

impl std::fmt::Display for AuthorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
