//! Orchestration layer for the PR lifecycle engine.
//!
//! The scheduler drives everything: it asks the verifier for the readiness
//! gate, turns failures into work items through the dispatcher, runs them
//! on the worker pool, routes failures through recovery, and speaks to
//! humans only through the notifier.

pub mod dispatcher;
pub mod interval;
pub mod notify;
pub mod pool;
pub mod recovery;
pub mod report;
pub mod scheduler;
pub mod verifier;

pub use dispatcher::{classify, Decision, DispatchOutcome, Dispatcher};
pub use interval::AdaptiveInterval;
pub use notify::{EscalationContext, Notifier};
pub use pool::{WorkCompletion, WorkContext, Worker, WorkerPool};
pub use recovery::{FailureClass, RecoveryAction, RecoveryController};
pub use report::{PollReport, StatusReport, VerifyReport};
pub use scheduler::{Scheduler, SchedulerEvent};
pub use verifier::{Verdict, Verification, Verifier};
