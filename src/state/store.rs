//! Durable state store backed by PR comments.
//!
//! The engine keeps no local database. Each PR carries its own chain of
//! snapshot comments written by the engine's login; the newest one is
//! authoritative on resume as long as the PR has not moved on since.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::snapshot::{is_state_comment, SnapshotPayload, StateSnapshot};
use crate::core::{LifecycleState, PrRecord, RetryCounts};
use crate::host::{HostingProvider, PrFacts};
use crate::{Error, Result};

/// Clock skew allowed between our write and the host's `updated_at`,
/// which the write itself bumps.
pub const STALE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Persisted {
    Written { marker: String, comment_id: u64 },
    /// The last snapshot already holds this exact state.
    Unchanged { marker: String },
}

pub struct StateStore {
    host: Arc<dyn HostingProvider>,
    engine_login: String,
}

impl StateStore {
    pub fn new(host: Arc<dyn HostingProvider>, engine_login: impl Into<String>) -> Self {
        Self {
            host,
            engine_login: engine_login.into(),
        }
    }

    pub fn engine_login(&self) -> &str {
        &self.engine_login
    }

    /// Newest snapshot among the engine's own comments in `facts`.
    ///
    /// Unreadable payloads and unknown schema versions are skipped.
    pub fn latest(&self, facts: &PrFacts) -> Option<StateSnapshot> {
        facts
            .comments
            .iter()
            .filter(|c| c.author.eq_ignore_ascii_case(&self.engine_login))
            .filter(|c| is_state_comment(&c.body))
            .filter_map(|c| match StateSnapshot::from_comment(c) {
                Ok(snapshot) => snapshot,
                Err(Error::UnsupportedSchema(version)) => {
                    tracing::warn!(
                        pr = facts.number,
                        comment = c.id,
                        version,
                        "ignoring snapshot with unsupported schema"
                    );
                    None
                }
                Err(e) => {
                    tracing::warn!(pr = facts.number, comment = c.id, error = %e, "unreadable snapshot");
                    None
                }
            })
            .max_by(|a, b| {
                a.written_at
                    .cmp(&b.written_at)
                    .then(a.payload.seq.cmp(&b.payload.seq))
            })
    }

    /// Fails with [`Error::StaleMemory`] when the PR saw activity after the
    /// snapshot was written.
    pub fn validate(&self, snapshot: &StateSnapshot, facts: &PrFacts) -> Result<()> {
        if is_stale(snapshot.written_at, facts.updated_at) {
            return Err(Error::StaleMemory(format!(
                "snapshot {} written {} but PR #{} updated {}",
                snapshot.external_id, snapshot.written_at, facts.number, facts.updated_at
            )));
        }
        Ok(())
    }

    /// Write the record's state unless the last snapshot already holds it.
    pub async fn persist(&self, record: &mut PrRecord, now: DateTime<Utc>) -> Result<Persisted> {
        let mut payload = SnapshotPayload::from_record(record, now);
        let fingerprint = payload.fingerprint();
        if record.persisted_fingerprint.as_deref() == Some(fingerprint.as_str()) {
            return Ok(Persisted::Unchanged {
                marker: payload.marker(),
            });
        }

        payload.seq = record.snapshot_seq + 1;
        let marker = payload.marker();
        let body = payload.to_comment_body()?;
        let posted = self
            .host
            .post_comment(&record.id, &body, Some(&marker))
            .await?;
        record.snapshot_seq = payload.seq;
        record.persisted_fingerprint = Some(fingerprint);
        tracing::debug!(pr = %record.id, %marker, created = posted.created, "snapshot persisted");
        Ok(Persisted::Written {
            marker,
            comment_id: posted.id,
        })
    }
}

fn is_stale(written_at: DateTime<Utc>, updated_at: DateTime<Utc>) -> bool {
    let grace = chrono::Duration::from_std(STALE_GRACE).unwrap_or_else(|_| chrono::Duration::zero());
    updated_at > written_at + grace
}

/// Carry what a snapshot remembers onto a freshly built record.
///
/// Criteria are kept only as a hint (`criteria_trusted` stays false) since
/// the next poll re-verifies them. A stale snapshot or a different head
/// drops the counters and the blocker: the PR has moved on.
pub fn restore(record: &mut PrRecord, snapshot: &StateSnapshot, stale: bool) {
    let payload = &snapshot.payload;
    record.snapshot_seq = payload.seq;
    record.persisted_fingerprint = Some(payload.fingerprint());
    record.criteria = payload.criteria;
    record.criteria_trusted = false;
    record.ready_episode = payload.ready_episode;
    if payload.poll_interval_secs > 0 {
        record.poll_interval = Duration::from_secs(payload.poll_interval_secs);
    }

    if !payload.lifecycle_state.is_terminal() && payload.lifecycle_state != LifecycleState::Blocked {
        record.lifecycle_state = payload.lifecycle_state;
    }

    let same_head = !payload.head_sha.is_empty() && payload.head_sha == record.head_sha;
    let legacy = payload.head_sha.is_empty();
    if (same_head || legacy) && !stale {
        record.retry_count = payload.retry_count;
        record.blocker = payload.blocker.clone();
    } else if same_head {
        record.retry_count = payload.retry_count;
    } else {
        record.retry_count = RetryCounts::default();
    }

    // Work a previous process left running never reported back.
    if let Some(criterion) = payload.in_flight.as_ref().and_then(|f| f.criterion) {
        if same_head || legacy {
            let count = record.retry_count.increment(criterion);
            tracing::info!(pr = %record.id, %criterion, count, "orphaned work item counted as an attempt");
        }
    }
}
