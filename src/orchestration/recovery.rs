//! Failure classification and recovery.
//!
//! Every failure is sorted into one of five classes, and each class has one
//! recovery path:
//!
//! | Class               | Recovery                                         |
//! |---------------------|--------------------------------------------------|
//! | `transient`         | retry the same item, bounded                     |
//! | `criterion-failure` | count against the criterion; block past the cap  |
//! | `isolation`         | block and escalate                               |
//! | `permission`        | block and escalate                               |
//! | `external-terminal` | evict the PR                                     |

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::RecoveryConfig;
use crate::core::{BlockCause, Criteria, Criterion, PrRecord, WorkError, WorkItem};
use crate::host::HostError;
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureClass {
    Transient,
    CriterionFailure,
    IsolationViolation,
    ExternalTerminal,
    PermissionOrAuth,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::Transient => "transient",
            FailureClass::CriterionFailure => "criterion-failure",
            FailureClass::IsolationViolation => "isolation",
            FailureClass::ExternalTerminal => "external-terminal",
            FailureClass::PermissionOrAuth => "permission",
        }
    }
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn classify_work_error(error: &WorkError) -> FailureClass {
    match error {
        WorkError::Transient(_) => FailureClass::Transient,
        WorkError::Failed(_) | WorkError::DeadlineExceeded => FailureClass::CriterionFailure,
        WorkError::Isolation(_) => FailureClass::IsolationViolation,
        WorkError::Permission(_) => FailureClass::PermissionOrAuth,
    }
}

pub fn classify_error(error: &Error) -> FailureClass {
    match error {
        Error::Host(HostError::PermissionDenied(_)) | Error::Host(HostError::NotAuthenticated(_)) => {
            FailureClass::PermissionOrAuth
        }
        Error::Host(HostError::NotFound(_)) | Error::PrNotFound(_) => FailureClass::ExternalTerminal,
        e if e.is_isolation_violation() => FailureClass::IsolationViolation,
        Error::DirtyWorktree { .. } | Error::UnpushedCommits { .. } => {
            FailureClass::IsolationViolation
        }
        _ => FailureClass::Transient,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Resubmit the same attempt.
    RetrySame(WorkItem),
    /// Let the next poll dispatch a fresh attempt.
    Redispatch,
    /// The record is now blocked; tell a human.
    Escalate(BlockCause),
    Evict,
}

pub struct RecoveryController {
    max_criterion_retries: u32,
    max_transient_retries: u32,
    budget: Duration,
}

impl RecoveryController {
    pub fn new(config: &RecoveryConfig, budget: Duration) -> Self {
        Self {
            max_criterion_retries: config.max_criterion_retries,
            max_transient_retries: config.max_transient_retries,
            budget,
        }
    }

    pub fn max_criterion_retries(&self) -> u32 {
        self.max_criterion_retries
    }

    /// Whether `criterion` has used up its automatic re-dispatches.
    pub fn exhausted(&self, record: &PrRecord, criterion: Criterion) -> bool {
        record.retry_count.get(criterion) > self.max_criterion_retries
    }

    /// Block the record on an exhausted criterion.
    pub fn exhaust(&self, record: &mut PrRecord, criterion: Criterion, now: DateTime<Utc>) -> BlockCause {
        let cause = BlockCause::RetriesExhausted { criterion };
        tracing::warn!(
            pr = %record.id,
            %criterion,
            attempts = record.retry_count.get(criterion),
            "retries exhausted, blocking"
        );
        record.block(cause.clone(), now);
        cause
    }

    /// Count one failed attempt against `criterion`.
    pub fn charge(&self, record: &mut PrRecord, criterion: Criterion, now: DateTime<Utc>) -> RecoveryAction {
        record.transient_retries = 0;
        let count = record.retry_count.increment(criterion);
        tracing::info!(pr = %record.id, %criterion, count, "criterion attempt failed");
        if count > self.max_criterion_retries {
            RecoveryAction::Escalate(self.exhaust(record, criterion, now))
        } else {
            RecoveryAction::Redispatch
        }
    }

    pub fn on_work_failure(
        &self,
        record: &mut PrRecord,
        item: &WorkItem,
        error: &WorkError,
        now: DateTime<Utc>,
    ) -> RecoveryAction {
        let class = classify_work_error(error);
        tracing::debug!(pr = %record.id, %class, %error, "work item failed");
        match class {
            FailureClass::Transient if record.transient_retries < self.max_transient_retries => {
                record.transient_retries += 1;
                RecoveryAction::RetrySame(item.retry(now, self.budget))
            }
            FailureClass::Transient | FailureClass::CriterionFailure => match item.primary_criterion() {
                Some(criterion) => self.charge(record, criterion, now),
                None => RecoveryAction::Redispatch,
            },
            FailureClass::IsolationViolation => {
                let cause = BlockCause::IsolationViolation {
                    message: error.to_string(),
                };
                record.block(cause.clone(), now);
                RecoveryAction::Escalate(cause)
            }
            FailureClass::PermissionOrAuth => {
                let cause = BlockCause::PermissionDenied {
                    message: error.to_string(),
                };
                record.block(cause.clone(), now);
                RecoveryAction::Escalate(cause)
            }
            FailureClass::ExternalTerminal => RecoveryAction::Evict,
        }
    }

    /// Recovery for an engine-side error while acting on `record`.
    pub fn on_error(&self, record: &mut PrRecord, error: &Error, now: DateTime<Utc>) -> RecoveryAction {
        match classify_error(error) {
            FailureClass::IsolationViolation => {
                let cause = BlockCause::IsolationViolation {
                    message: error.to_string(),
                };
                record.block(cause.clone(), now);
                RecoveryAction::Escalate(cause)
            }
            FailureClass::PermissionOrAuth => {
                let cause = BlockCause::PermissionDenied {
                    message: error.to_string(),
                };
                record.block(cause.clone(), now);
                RecoveryAction::Escalate(cause)
            }
            FailureClass::ExternalTerminal => RecoveryAction::Evict,
            FailureClass::Transient | FailureClass::CriterionFailure => RecoveryAction::Redispatch,
        }
    }

    /// A stale item counts as a failed attempt on its primary criterion.
    pub fn on_stale(&self, record: &mut PrRecord, now: DateTime<Utc>) -> RecoveryAction {
        let criterion = record
            .in_flight
            .take()
            .and_then(|f| f.item.primary_criterion());
        match criterion {
            Some(criterion) => self.charge(record, criterion, now),
            None => RecoveryAction::Redispatch,
        }
    }
}

/// Reset the counter of every criterion that now passes.
pub fn reset_passed(record: &mut PrRecord, criteria: &Criteria) {
    for (criterion, passed) in criteria.iter() {
        if passed && record.retry_count.get(criterion) > 0 {
            tracing::debug!(pr = %record.id, %criterion, "criterion passed, counter reset");
            record.retry_count.reset(criterion);
        }
    }
}
