//! Durable engine state.
//!
//! PR records are persisted as versioned snapshot comments on the PR
//! itself, so a restarted engine (or a different machine) resumes from
//! what the host shows. A file lock keeps one engine per repository.

pub mod lock;
pub mod migration;
pub mod snapshot;
pub mod store;

pub use lock::RepoLock;
pub use snapshot::{SnapshotPayload, StateSnapshot, SCHEMA_VERSION};
pub use store::{restore, Persisted, StateStore};
