//! Schema migration for persisted snapshots.
//!
//! Payloads without a `schemaVersion` come from the unversioned format
//! `{pr, status, criteria, retryCount, timestamp}` and are upgraded to the
//! current schema on read. Nothing is rewritten on the host: the next
//! snapshot the engine writes is simply in the current format. Version 1
//! keeps those five names, so it differs from the old shape only by the
//! added fields.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use super::snapshot::{SnapshotPayload, SCHEMA_VERSION};
use crate::core::{AuthorKind, Criteria, LifecycleState, RetryCounts};
use crate::{Error, Result};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyPayload {
    pr: u64,
    #[serde(default)]
    repo: String,
    status: String,
    #[serde(default)]
    criteria: Criteria,
    #[serde(default)]
    retry_count: LegacyRetryCount,
    timestamp: DateTime<Utc>,
}

/// Old writers stored either one total or a per-criterion map.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LegacyRetryCount {
    Total(u32),
    PerCriterion(RetryCounts),
}

impl Default for LegacyRetryCount {
    fn default() -> Self {
        LegacyRetryCount::Total(0)
    }
}

/// Schema version of a raw payload, `None` for the unversioned format.
pub fn schema_version(value: &Value) -> Option<u64> {
    value.get("schemaVersion").and_then(Value::as_u64)
}

pub fn needs_migration(value: &Value) -> bool {
    schema_version(value).is_none()
}

/// Upgrade an unversioned payload to the current schema.
pub fn migrate(value: Value) -> Result<SnapshotPayload> {
    let legacy: LegacyPayload = serde_json::from_value(value)?;
    tracing::debug!(pr = legacy.pr, status = %legacy.status, "migrating legacy snapshot");

    let lifecycle_state = legacy_status(&legacy.status);
    let retry_count = match legacy.retry_count {
        LegacyRetryCount::PerCriterion(counts) => counts,
        // A bare total is charged to the criterion that was being fixed.
        LegacyRetryCount::Total(total) => {
            let mut counts = RetryCounts::default();
            if let Some(criterion) = legacy.criteria.failing().first() {
                for _ in 0..total {
                    counts.increment(*criterion);
                }
            }
            counts
        }
    };

    Ok(SnapshotPayload {
        schema_version: SCHEMA_VERSION,
        seq: 0,
        repo: legacy.repo,
        pr: legacy.pr,
        branch: String::new(),
        head_sha: String::new(),
        author_kind: AuthorKind::default(),
        lifecycle_state,
        blocker: None,
        criteria: legacy.criteria,
        retry_count,
        poll_interval_secs: 0,
        ready_episode: u32::from(lifecycle_state == LifecycleState::ReadyToMerge),
        in_flight: None,
        written_at: legacy.timestamp,
    })
}

fn legacy_status(status: &str) -> LifecycleState {
    let normalized = status.trim().to_ascii_lowercase().replace(['-', ' '], "_");
    match normalized.as_str() {
        "ready" | "mergeable" => LifecycleState::ReadyToMerge,
        "pending" | "ci" => LifecycleState::CiPending,
        "open" | "new" => LifecycleState::NeedsReview,
        "in_review" | "reviewing" => LifecycleState::ReviewInProgress,
        other => other.parse().unwrap_or(LifecycleState::NeedsReview),
    }
}

/// Decode a raw state payload, migrating it when needed.
///
/// Versions newer than this build understands fail with
/// [`Error::UnsupportedSchema`] so the caller can skip them.
pub fn parse_payload(json: &str) -> Result<SnapshotPayload> {
    let value: Value = serde_json::from_str(json)?;
    match schema_version(&value) {
        None => migrate(value),
        Some(v) if v == u64::from(SCHEMA_VERSION) => Ok(serde_json::from_value(value)?),
        Some(v) => Err(Error::UnsupportedSchema(u32::try_from(v).unwrap_or(u32::MAX))),
    }
}
