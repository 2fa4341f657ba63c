//! Notification and escalation gateway.
//!
//! The only way the engine talks to people. Every message carries a marker
//! so that re-sending after a crash or a retry never produces a duplicate.

use std::sync::Arc;

use serde::Serialize;

use crate::core::{BlockCause, Criterion, PrRecord};
use crate::host::{HostingProvider, PostedComment};
use crate::util::short_sha;
use crate::Result;

/// Marker for the ready notice of one ready episode.
pub fn ready_marker(pr: u64, episode: u32) -> String {
    format!("ready-{}-{}", pr, episode)
}

fn cause_slug(cause: &BlockCause) -> &'static str {
    match cause {
        BlockCause::RetriesExhausted { .. } => "retries-exhausted",
        BlockCause::PermissionDenied { .. } => "permission",
        BlockCause::IsolationViolation { .. } => "isolation",
        BlockCause::AuthorPolicy { .. } => "author-policy",
    }
}

/// One escalation per cause, criterion and head commit.
pub fn escalation_marker(pr: u64, cause: &BlockCause, head_sha: &str) -> String {
    let criterion = cause.criterion().map(|c| c.as_str()).unwrap_or("none");
    format!(
        "escalate-{}-{}-{}-{}",
        pr,
        cause_slug(cause),
        criterion,
        short_sha(head_sha)
    )
}

/// What a human needs to pick up a blocked PR.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EscalationContext {
    pub attempts: u32,
    pub last_error: Option<String>,
    pub remaining: Vec<Criterion>,
}

impl EscalationContext {
    pub fn for_record(record: &PrRecord, last_error: Option<String>) -> Self {
        let attempts = record
            .blocker
            .as_ref()
            .and_then(|b| b.cause.criterion())
            .map(|c| record.retry_count.get(c))
            .unwrap_or(0);
        Self {
            attempts,
            last_error,
            remaining: record.criteria.failing(),
        }
    }
}

pub fn ready_body(record: &PrRecord) -> String {
    format!(
        "**Ready to merge.** All 8 readiness criteria pass at `{}`.\n\n\
         prflow never merges; a maintainer needs to review and merge this PR.",
        short_sha(&record.head_sha)
    )
}

pub fn escalation_body(record: &PrRecord, cause: &BlockCause, context: &EscalationContext) -> String {
    let mut body = format!("**prflow needs a human on this PR.**\n\nCause: {}\n", cause);
    if let Some(criterion) = cause.criterion() {
        if context.attempts > 0 {
            body.push_str(&format!(
                "Tried: {} automatic attempt(s) on `{}`\n",
                context.attempts, criterion
            ));
        }
    }
    if let Some(error) = &context.last_error {
        body.push_str(&format!("Last error: {}\n", error));
    }
    if !context.remaining.is_empty() {
        let names: Vec<&str> = context.remaining.iter().map(|c| c.as_str()).collect();
        body.push_str(&format!("Remaining: {}\n", names.join(", ")));
    }
    body.push_str(&format!(
        "\nAutomatic work on `{}` is paused. It resumes on a new push or once the cause clears.",
        short_sha(&record.head_sha)
    ));
    body
}

pub struct Notifier {
    host: Arc<dyn HostingProvider>,
}

impl Notifier {
    pub fn new(host: Arc<dyn HostingProvider>) -> Self {
        Self { host }
    }

    /// Announce the record's current ready episode.
    pub async fn ready(&self, record: &PrRecord) -> Result<PostedComment> {
        let marker = ready_marker(record.id.number, record.ready_episode);
        let posted = self
            .host
            .post_comment(&record.id, &ready_body(record), Some(&marker))
            .await?;
        if posted.created {
            tracing::info!(pr = %record.id, %marker, "ready notification posted");
        }
        Ok(posted)
    }

    pub async fn escalate(
        &self,
        record: &PrRecord,
        cause: &BlockCause,
        context: &EscalationContext,
    ) -> Result<PostedComment> {
        let marker = escalation_marker(record.id.number, cause, &record.head_sha);
        let body = escalation_body(record, cause, context);
        let posted = self
            .host
            .post_comment(&record.id, &body, Some(&marker))
            .await?;
        if posted.created {
            tracing::warn!(pr = %record.id, %marker, %cause, "escalated");
        }
        Ok(posted)
    }
}
