//! Core domain models for PR lifecycle orchestration.
//!
//! Identity, the readiness criteria, the lifecycle state machine, author
//! policy and work items. Everything here is plain data plus pure logic.

pub mod author;
pub mod criteria;
pub mod ids;
pub mod lifecycle;
pub mod pr;
pub mod work;

pub use author::AuthorKind;
pub use criteria::{Criteria, Criterion, RetryCounts};
pub use ids::{WorkItemId, WorkerId, WorktreeId};
pub use lifecycle::{BlockCause, Blocker, LifecycleState};
pub use pr::{PrId, PrRecord, RepoSlug};
pub use work::{InFlight, WorkError, WorkItem, WorkKind, WorkReport};
