//! Snapshot payloads and their comment encoding.
//!
//! A snapshot is a human-readable PR comment with the JSON payload hidden
//! in an HTML comment:
//!
//! ```text
//! **prflow** is tracking this PR: `ci_pending`, 2 of 8 criteria failing.
//!
//! <!-- prflow:state {"schemaVersion":1,...} -->
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::migration;
use crate::core::{
    AuthorKind, Blocker, Criteria, Criterion, LifecycleState, PrRecord, RetryCounts, WorkKind,
};
use crate::host::{Comment, TAG_PREFIX};
use crate::Result;

pub const SCHEMA_VERSION: u32 = 1;

const STATE_OPEN: &str = "<!-- prflow:state ";
const STATE_CLOSE: &str = "-->";

/// The work item a snapshot was written with, kept only as far as resume
/// needs it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InFlightSummary {
    pub kind: WorkKind,
    pub attempt: u32,
    pub criterion: Option<Criterion>,
    pub dispatched_at: DateTime<Utc>,
}

/// Version 1 of the persisted record. The fields it shares with unversioned
/// payloads keep their names: `pr`, `status`, `criteria`, `retryCount` and
/// `timestamp`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotPayload {
    pub schema_version: u32,
    /// Position in this PR's chain of snapshots.
    #[serde(default)]
    pub seq: u32,
    pub repo: String,
    pub pr: u64,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub head_sha: String,
    #[serde(default)]
    pub author_kind: AuthorKind,
    #[serde(rename = "status")]
    pub lifecycle_state: LifecycleState,
    #[serde(default)]
    pub blocker: Option<Blocker>,
    pub criteria: Criteria,
    #[serde(default)]
    pub retry_count: RetryCounts,
    #[serde(default)]
    pub poll_interval_secs: u64,
    #[serde(default)]
    pub ready_episode: u32,
    #[serde(default)]
    pub in_flight: Option<InFlightSummary>,
    #[serde(rename = "timestamp")]
    pub written_at: DateTime<Utc>,
}

impl SnapshotPayload {
    pub fn from_record(record: &PrRecord, now: DateTime<Utc>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            seq: record.snapshot_seq,
            repo: record.id.repo.to_string(),
            pr: record.id.number,
            branch: record.branch.clone(),
            head_sha: record.head_sha.clone(),
            author_kind: record.author_kind,
            lifecycle_state: record.lifecycle_state,
            blocker: record.blocker.clone(),
            criteria: record.criteria,
            retry_count: record.retry_count,
            poll_interval_secs: record.poll_interval.as_secs(),
            ready_episode: record.ready_episode,
            in_flight: record.in_flight.as_ref().map(|f| InFlightSummary {
                kind: f.item.kind,
                attempt: f.item.attempt,
                criterion: f.item.primary_criterion(),
                dispatched_at: f.dispatched_at,
            }),
            written_at: now,
        }
    }

    /// Content hash over everything except the write time, the sequence
    /// number and the poll interval, so two writes of the same state hash
    /// equal while backoff grows.
    pub fn fingerprint(&self) -> String {
        let mut value = match serde_json::to_value(self) {
            Ok(value) => value,
            Err(_) => return String::new(),
        };
        if let Some(map) = value.as_object_mut() {
            map.remove("timestamp");
            map.remove("seq");
            map.remove("pollIntervalSecs");
        }
        let digest = Sha256::digest(value.to_string().as_bytes());
        digest
            .iter()
            .take(6)
            .map(|b| format!("{:02x}", b))
            .collect()
    }

    /// Idempotency marker for the comment carrying this payload.
    pub fn marker(&self) -> String {
        format!("state-{}-{}-{}", self.pr, self.seq, self.fingerprint())
    }

    pub fn to_comment_body(&self) -> Result<String> {
        let json = serde_json::to_string(self)?.replace("-->", "--\\u003e");
        let failing = self.criteria.failing();
        let headline = match &self.blocker {
            Some(blocker) => format!(
                "**prflow** is tracking this PR: blocked ({}).",
                blocker.cause
            ),
            None if failing.is_empty() => format!(
                "**prflow** is tracking this PR: `{}`, all criteria passing.",
                self.lifecycle_state
            ),
            None => format!(
                "**prflow** is tracking this PR: `{}`, {} of 8 criteria failing.",
                self.lifecycle_state,
                failing.len()
            ),
        };
        Ok(format!("{}\n\n{}{} {}", headline, STATE_OPEN, json, STATE_CLOSE))
    }
}

/// A payload together with the comment it was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateSnapshot {
    pub external_id: u64,
    pub payload: SnapshotPayload,
    pub written_at: DateTime<Utc>,
}

impl StateSnapshot {
    /// Parse a snapshot out of a comment. `Ok(None)` when the comment
    /// carries no state block.
    pub fn from_comment(comment: &Comment) -> Result<Option<Self>> {
        let Some(json) = extract_state_json(&comment.body) else {
            return Ok(None);
        };
        let payload = migration::parse_payload(json)?;
        Ok(Some(Self {
            external_id: comment.id,
            written_at: payload.written_at,
            payload,
        }))
    }
}

fn extract_state_json(body: &str) -> Option<&str> {
    let start = body.find(STATE_OPEN)? + STATE_OPEN.len();
    let rest = &body[start..];
    let end = rest.find(STATE_CLOSE)?;
    Some(rest[..end].trim())
}

/// Whether a comment body carries a state block rather than some other
/// engine tag.
pub fn is_state_comment(body: &str) -> bool {
    body.contains(STATE_OPEN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{BlockCause, PrId, RepoSlug};
    use std::time::Duration;

    fn record() -> PrRecord {
        let mut r = PrRecord::new(
            PrId::new(RepoSlug::new("acme", "widgets"), 42),
            "feature/x",
            "abc123",
            AuthorKind::AgentBot,
            Duration::from_secs(60),
            Utc::now(),
        );
        r.lifecycle_state = LifecycleState::CiPending;
        r.criteria = Criteria::all_true();
        r.criteria.set(Criterion::CiPassing, false);
        r.retry_count.increment(Criterion::CiPassing);
        r
    }

    fn comment(id: u64, body: String) -> Comment {
        Comment {
            id,
            author: "prflow-bot".to_string(),
            body,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_body_parses_back() {
        let payload = SnapshotPayload::from_record(&record(), Utc::now());
        let body = payload.to_comment_body().unwrap();
        assert!(body.starts_with("**prflow**"));
        assert!(body.contains("1 of 8 criteria failing"));
        let snap = StateSnapshot::from_comment(&comment(9, body)).unwrap().unwrap();
        assert_eq!(snap.external_id, 9);
        assert_eq!(snap.payload, payload);
    }

    #[test]
    fn test_comment_terminator_inside_strings_is_escaped() {
        let mut r = record();
        r.block(
            BlockCause::PermissionDenied {
                message: "nope --> really".to_string(),
            },
            Utc::now(),
        );
        let payload = SnapshotPayload::from_record(&r, Utc::now());
        let body = payload.to_comment_body().unwrap();
        let block = &body[body.find(STATE_OPEN).unwrap()..];
        assert_eq!(block.matches("-->").count(), 1);
        let snap = StateSnapshot::from_comment(&comment(1, body)).unwrap().unwrap();
        assert_eq!(snap.payload.blocker, r.blocker);
    }

    #[test]
    fn test_fingerprint_ignores_write_time_and_seq() {
        let r = record();
        let a = SnapshotPayload::from_record(&r, Utc::now());
        let mut b = SnapshotPayload::from_record(&r, Utc::now() + chrono::Duration::hours(1));
        b.seq = 7;
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 12);
        assert_ne!(a.marker(), b.marker());
    }

    #[test]
    fn test_fingerprint_tracks_content() {
        let mut r = record();
        let a = SnapshotPayload::from_record(&r, Utc::now());
        r.criteria.set(Criterion::CiPassing, true);
        let b = SnapshotPayload::from_record(&r, Utc::now());
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_shared_fields_keep_legacy_names() {
        let payload = SnapshotPayload::from_record(&record(), Utc::now());
        let value = serde_json::to_value(&payload).unwrap();
        let keys: Vec<&str> = value.as_object().unwrap().keys().map(|k| k.as_str()).collect();
        for key in ["schemaVersion", "pr", "status", "criteria", "retryCount", "timestamp"] {
            assert!(keys.contains(&key), "missing {} in {:?}", key, keys);
        }
        assert!(!keys.contains(&"lifecycleState"));
        assert!(!keys.contains(&"writtenAt"));
        assert_eq!(value["status"], "ci_pending");
    }

    #[test]
    fn test_marker_shape() {
        let payload = SnapshotPayload::from_record(&record(), Utc::now());
        let marker = payload.marker();
        assert!(marker.starts_with("state-42-0-"));
    }

    #[test]
    fn test_comment_without_state_block() {
        let c = comment(1, "LGTM".to_string());
        assert!(StateSnapshot::from_comment(&c).unwrap().is_none());
        assert!(!is_state_comment(&c.body));
        assert!(STATE_OPEN.starts_with(TAG_PREFIX));
    }
}
