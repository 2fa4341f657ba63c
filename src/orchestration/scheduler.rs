//! Polling scheduler: the engine's single control loop.
//!
//! The scheduler owns the PR registry and is the only writer of poll
//! timing. Each tick it drains worker completions, retries pending worktree
//! reclaims, refreshes the set of tracked PRs, and polls every PR that is
//! due. A poll runs the verifier, applies the result to the record, routes
//! failures through recovery, dispatches at most one work item, and writes
//! a snapshot when the record changed. Workers are never awaited; their
//! results arrive on the completion channel.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::dispatcher::{classify, reasons_for, Decision, DispatchOutcome, Dispatcher};
use super::interval::AdaptiveInterval;
use super::notify::{EscalationContext, Notifier};
use super::pool::{WorkCompletion, Worker, WorkerPool};
use super::recovery::{classify_error, reset_passed, FailureClass, RecoveryAction, RecoveryController};
use super::verifier::{regressions, BlockReason, Verdict, Verifier};
use crate::config::{AuthorsConfig, Config, PollingConfig, TrackingConfig};
use crate::core::{
    lifecycle, AuthorKind, BlockCause, Criterion, LifecycleState, PrId, PrRecord, RepoSlug,
    RetryCounts, WorkItem, WorkKind, WorktreeId,
};
use crate::host::{HostingProvider, OpenPr, PrState};
use crate::state::{restore, StateStore};
use crate::worktree::{WorktreeManager, WorktreeStatus};
use crate::{Error, Result};

/// Events emitted for every externally visible step, one JSON object each.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SchedulerEvent {
    Tracked {
        pr: u64,
        author_kind: AuthorKind,
    },
    Resumed {
        pr: u64,
        seq: u32,
        stale: bool,
    },
    Polled {
        pr: u64,
        state: LifecycleState,
        failing: Vec<Criterion>,
        next_poll_secs: u64,
    },
    Dispatched {
        pr: u64,
        kind: WorkKind,
        attempt: u32,
    },
    Completed {
        pr: u64,
        kind: WorkKind,
        attempt: u32,
        success: bool,
        detail: String,
    },
    Ready {
        pr: u64,
        episode: u32,
    },
    Escalated {
        pr: u64,
        cause: String,
    },
    Evicted {
        pr: u64,
        state: LifecycleState,
    },
    ReclaimPending {
        worktree: String,
        branch: String,
        reason: String,
    },
}

/// Next poll interval: snap to the minimum on change, grow otherwise, and
/// never poll faster than the human-wait floor while a person is needed.
pub fn next_interval(
    polling: &PollingConfig,
    current: Duration,
    changed: bool,
    awaits_human: bool,
) -> Duration {
    let mut interval = AdaptiveInterval::from_config(polling).starting_at(current);
    let next = interval.advance(changed);
    if awaits_human {
        next.max(polling.human_wait_floor())
    } else {
        next
    }
}

pub struct Scheduler {
    repo: RepoSlug,
    host: Arc<dyn HostingProvider>,
    verifier: Verifier,
    dispatcher: Dispatcher,
    recovery: RecoveryController,
    notifier: Notifier,
    store: StateStore,
    worktrees: WorktreeManager,
    registry: BTreeMap<PrId, PrRecord>,
    completion_rx: mpsc::Receiver<WorkCompletion>,
    event_tx: Option<mpsc::UnboundedSender<SchedulerEvent>>,
    polling: PollingConfig,
    tracking: TrackingConfig,
    authors: AuthorsConfig,
    budget: Duration,
    /// Worktrees whose removal must be retried once their lease drops.
    reclaim: Vec<WorktreeId>,
    last_discovery: Option<DateTime<Utc>>,
}

impl Scheduler {
    /// Build a scheduler for one repository.
    ///
    /// # Arguments
    ///
    /// * `repo` - The repository whose PRs are tracked
    /// * `config` - Engine configuration
    /// * `host` - Hosting provider, already wrapped for retries
    /// * `engine_login` - Login the engine posts as
    /// * `worker` - Executes dispatched work items
    /// * `worktrees` - Isolation manager rooted at the repository's worktree dir
    pub fn new(
        repo: RepoSlug,
        config: &Config,
        host: Arc<dyn HostingProvider>,
        engine_login: impl Into<String>,
        worker: Arc<dyn Worker>,
        worktrees: WorktreeManager,
    ) -> Self {
        let engine_login = engine_login.into();
        let (pool, completion_rx) = WorkerPool::new(worker, config.worker.max_concurrent);
        Self {
            repo,
            verifier: Verifier::new(
                host.clone(),
                config.gate.clone(),
                config.authors.clone(),
                engine_login.clone(),
            ),
            dispatcher: Dispatcher::new(pool, host.clone()),
            recovery: RecoveryController::new(&config.recovery, config.worker.deadline()),
            notifier: Notifier::new(host.clone()),
            store: StateStore::new(host.clone(), engine_login),
            host,
            worktrees,
            registry: BTreeMap::new(),
            completion_rx,
            event_tx: None,
            polling: config.polling.clone(),
            tracking: config.tracking.clone(),
            authors: config.authors.clone(),
            budget: config.worker.deadline(),
            reclaim: Vec::new(),
            last_discovery: None,
        }
    }

    /// Receive every [`SchedulerEvent`] from now on.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<SchedulerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.event_tx = Some(tx);
        rx
    }

    fn emit(&self, event: SchedulerEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }

    pub fn repo(&self) -> &RepoSlug {
        &self.repo
    }

    pub fn record(&self, pr: &PrId) -> Option<&PrRecord> {
        self.registry.get(pr)
    }

    pub fn records(&self) -> impl Iterator<Item = &PrRecord> {
        self.registry.values()
    }

    pub fn tracked(&self) -> usize {
        self.registry.len()
    }

    pub fn worktrees(&self) -> &WorktreeManager {
        &self.worktrees
    }

    pub fn active_workers(&self) -> usize {
        self.dispatcher.pool().active_count()
    }

    pub fn pr_id(&self, number: u64) -> PrId {
        PrId::new(self.repo.clone(), number)
    }

    /// Start tracking an open PR. Returns false if it was already tracked.
    pub fn track(&mut self, pr: &OpenPr, now: DateTime<Utc>) -> bool {
        let id = self.pr_id(pr.number);
        if self.registry.contains_key(&id) {
            return false;
        }
        let author_kind = AuthorKind::classify(&pr.author, &self.authors);
        let record = PrRecord::new(
            id.clone(),
            pr.head_ref.clone(),
            pr.head_sha.clone(),
            author_kind,
            self.polling.min_interval(),
            now,
        );
        tracing::info!(pr = %id, %author_kind, branch = %pr.head_ref, "tracking PR");
        self.registry.insert(id, record);
        self.emit(SchedulerEvent::Tracked {
            pr: pr.number,
            author_kind,
        });
        true
    }

    /// Refresh the tracked set from the host's open PRs.
    ///
    /// Tracked PRs missing from the list are made due so the next poll can
    /// observe their terminal state.
    pub async fn discover(&mut self, now: DateTime<Utc>) -> Result<usize> {
        let open = self.host.list_open_prs(&self.repo).await?;
        self.last_discovery = Some(now);
        let mut added = 0;
        for pr in &open {
            if self.tracking.matches(&pr.base_ref, &pr.author, pr.is_draft) && self.track(pr, now) {
                added += 1;
            }
        }
        for record in self.registry.values_mut() {
            if !open.iter().any(|pr| pr.number == record.id.number) {
                record.mark_due();
            }
        }
        Ok(added)
    }

    /// One pass of the control loop.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Result<()> {
        while let Ok(completion) = self.completion_rx.try_recv() {
            self.handle_completion(completion, now).await;
        }
        self.retry_reclaims().await;

        let discovery_due = self
            .last_discovery
            .map_or(true, |at| now - at >= chrono_secs(self.polling.min_interval()));
        if discovery_due {
            if let Err(e) = self.discover(now).await {
                tracing::warn!(error = %e, "discovery failed");
            }
        }

        let due: Vec<PrId> = self
            .registry
            .values()
            .filter(|r| r.is_due(now))
            .map(|r| r.id.clone())
            .collect();
        for id in due {
            self.poll_pr(&id, now).await?;
        }
        Ok(())
    }

    /// Run until cancelled.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        if let Err(e) = self.worktrees.adopt().await {
            tracing::warn!(error = %e, "could not adopt existing worktrees");
        }
        let tick = self.polling.tick();
        tracing::info!(repo = %self.repo, tick_secs = tick.as_secs(), "control loop started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(completion) = self.completion_rx.recv() => {
                    self.handle_completion(completion, Utc::now()).await;
                }
                _ = tokio::time::sleep(tick) => {
                    if let Err(e) = self.tick(Utc::now()).await {
                        tracing::error!(error = %e, "tick failed");
                    }
                }
            }
        }
        self.dispatcher.pool_mut().abort_all();
        tracing::info!(repo = %self.repo, "control loop stopped");
        Ok(())
    }

    /// Wait for the next worker completion and apply it.
    pub async fn process_next_completion(&mut self) -> Option<PrId> {
        let completion = self.completion_rx.recv().await?;
        let pr = completion.pr.clone();
        self.handle_completion(completion, Utc::now()).await;
        Some(pr)
    }

    /// Poll one tracked PR now, whether or not it is due.
    pub async fn poll_pr(&mut self, id: &PrId, now: DateTime<Utc>) -> Result<()> {
        let Some(record) = self.registry.remove(id) else {
            return Err(Error::PrNotFound(id.to_string()));
        };
        if let Some(record) = self.poll_record(record, now).await {
            self.registry.insert(id.clone(), record);
        }
        Ok(())
    }

    /// Returns `None` when the record was evicted.
    async fn poll_record(&mut self, mut record: PrRecord, now: DateTime<Utc>) -> Option<PrRecord> {
        let local_unpushed = match self.worktrees.has_unpushed(&record.branch).await {
            Ok(unpushed) => unpushed,
            Err(e) => {
                tracing::warn!(pr = %record.id, error = %e, "local probe failed");
                false
            }
        };

        let verification = match self.verifier.verify(&record.id, local_unpushed, now).await {
            Ok(v) => v,
            Err(e) => return self.poll_failed(record, e, now).await,
        };

        let facts = match (verification.verdict, verification.facts.as_ref()) {
            (Verdict::Blocked(BlockReason::PermissionDenied), _) | (_, None) => {
                let already = matches!(
                    record.blocker.as_ref().map(|b| &b.cause),
                    Some(BlockCause::PermissionDenied { .. })
                );
                if !already {
                    let cause = BlockCause::PermissionDenied {
                        message: verification.message.clone().unwrap_or_default(),
                    };
                    record.block(cause.clone(), now);
                    self.escalate(&record, &cause, verification.message.clone()).await;
                }
                self.schedule(&mut record, false, now);
                return Some(record);
            }
            (Verdict::Blocked(BlockReason::ExternalTerminal), Some(facts)) => {
                let state = match facts.state {
                    PrState::Merged => LifecycleState::Merged,
                    _ => LifecycleState::Closed,
                };
                self.evict(record, state).await;
                return None;
            }
            (_, Some(facts)) => facts.clone(),
        };

        if !record.criteria_trusted {
            if let Some(snapshot) = self.store.latest(&facts) {
                let stale = match self.store.validate(&snapshot, &facts) {
                    Ok(()) => false,
                    Err(e) => {
                        tracing::info!(pr = %record.id, error = %e, "resuming from stale snapshot");
                        true
                    }
                };
                restore(&mut record, &snapshot, stale);
                self.emit(SchedulerEvent::Resumed {
                    pr: record.id.number,
                    seq: snapshot.payload.seq,
                    stale,
                });
            }
        }

        let prev_state = record.effective_state();
        let prev_criteria = record.criteria;
        let was_trusted = record.criteria_trusted;
        let head_changed = facts.head_sha != record.head_sha;
        if head_changed {
            // A push that lands while our own work is outstanding is the
            // worker's; any other push is a person and starts the count over.
            let pushed_by_worker = record.in_flight.is_some() || record.unverified_attempt.is_some();
            tracing::info!(
                pr = %record.id,
                from = %record.head_sha,
                to = %facts.head_sha,
                pushed_by_worker,
                "new head"
            );
            if !pushed_by_worker {
                record.retry_count = RetryCounts::default();
            }
            record.head_sha = facts.head_sha.clone();
            record.branch = facts.head_ref.clone();
            record.transient_retries = 0;
        }

        let criteria = verification.criteria();
        if was_trusted && !head_changed {
            for criterion in regressions(&prev_criteria, &criteria) {
                if criterion != Criterion::QuietPeriod {
                    tracing::debug!(pr = %record.id, %criterion, "criterion regressed without a new head");
                }
            }
        }
        reset_passed(&mut record, &criteria);
        record.criteria = criteria;
        record.criteria_trusted = true;
        record.lifecycle_state = lifecycle::derive(&facts, &criteria);

        // A finished attempt is judged once its criterion passes or fails for
        // a reason a worker could act on. Pending CI or unknown mergeability
        // after a push says nothing about the attempt yet.
        if let Some(criterion) = record.unverified_attempt {
            let passed = criteria.get(criterion);
            let settled = passed
                || verification
                    .evaluation
                    .detail(criterion)
                    .map_or(true, |d| d.actionable);
            if settled {
                record.unverified_attempt = None;
                if !passed {
                    if let RecoveryAction::Escalate(cause) = self.recovery.charge(&mut record, criterion, now) {
                        self.escalate(&record, &cause, None).await;
                    }
                }
            } else {
                tracing::debug!(pr = %record.id, %criterion, "attempt outcome not known yet");
            }
        }

        if let Some(blocker) = &record.blocker {
            if blocker.clears(&record.head_sha, &criteria, true) {
                tracing::info!(pr = %record.id, cause = %blocker.cause, "blocker cleared");
                record.blocker = None;
            }
        }

        let changed = head_changed || criteria != prev_criteria || record.effective_state() != prev_state;
        if changed {
            record.last_changed_at = now;
        }

        let mut aborted = false;
        if let Some(in_flight) = record.in_flight.as_mut() {
            if changed {
                in_flight.polls_without_progress = 0;
            } else {
                in_flight.polls_without_progress += 1;
            }
            if in_flight.polls_without_progress >= self.polling.stale_poll_cycles {
                self.handle_stale(&mut record, now).await;
                aborted = true;
            }
        }

        if record.effective_state() == LifecycleState::ReadyToMerge
            && prev_state != LifecycleState::ReadyToMerge
        {
            record.ready_episode += 1;
            match self.notifier.ready(&record).await {
                Ok(_) => self.emit(SchedulerEvent::Ready {
                    pr: record.id.number,
                    episode: record.ready_episode,
                }),
                Err(e) => tracing::warn!(pr = %record.id, error = %e, "ready notification failed"),
            }
        }

        // The aborted task still holds its lease until the runtime drops it,
        // so the next attempt waits for the following poll.
        if !aborted && !record.is_blocked() && record.in_flight.is_none() {
            match classify(&record, &verification.evaluation, self.budget, now) {
                Decision::Dispatch(item) => {
                    let reasons = reasons_for(&item, &verification.evaluation);
                    let primary = item.primary_criterion();
                    match primary {
                        Some(criterion) if self.recovery.exhausted(&record, criterion) => {
                            let cause = self.recovery.exhaust(&mut record, criterion, now);
                            self.escalate(&record, &cause, None).await;
                        }
                        _ => self.dispatch_item(&mut record, item, reasons, now).await,
                    }
                }
                Decision::NeedsHuman { criterion } => {
                    // Author policy is a standing status, not an incident: the
                    // snapshot carries it and nothing goes to the gateway.
                    if record.blocker.is_none() {
                        tracing::info!(pr = %record.id, %criterion, "human-authored PR left to its author");
                        record.block(BlockCause::AuthorPolicy { criterion }, now);
                    }
                }
                Decision::Wait { criterion, reason } => {
                    tracing::debug!(pr = %record.id, %criterion, %reason, "waiting");
                }
                Decision::Skip { reason } => {
                    tracing::debug!(pr = %record.id, %reason, "skipped");
                }
                Decision::Ready => {}
            }
        }

        if let Err(e) = self.store.persist(&mut record, Utc::now()).await {
            tracing::warn!(pr = %record.id, error = %e, "snapshot not persisted");
        }

        self.schedule(&mut record, changed, now);
        self.emit(SchedulerEvent::Polled {
            pr: record.id.number,
            state: record.effective_state(),
            failing: record.criteria.failing(),
            next_poll_secs: record.poll_interval.as_secs(),
        });
        Some(record)
    }

    async fn poll_failed(&mut self, mut record: PrRecord, error: Error, now: DateTime<Utc>) -> Option<PrRecord> {
        match classify_error(&error) {
            FailureClass::ExternalTerminal => {
                tracing::warn!(pr = %record.id, error = %error, "PR no longer visible, evicting");
                self.evict(record, LifecycleState::Closed).await;
                return None;
            }
            FailureClass::PermissionOrAuth if !record.is_blocked() => {
                if let RecoveryAction::Escalate(cause) = self.recovery.on_error(&mut record, &error, now) {
                    self.escalate(&record, &cause, Some(error.to_string())).await;
                }
            }
            _ => {
                tracing::warn!(pr = %record.id, error = %error, "poll failed, backing off");
            }
        }
        self.schedule(&mut record, false, now);
        Some(record)
    }

    fn schedule(&self, record: &mut PrRecord, changed: bool, now: DateTime<Utc>) {
        record.poll_interval = next_interval(
            &self.polling,
            record.poll_interval,
            changed,
            record.effective_state().awaits_human(),
        );
        record.last_polled_at = Some(now);
    }

    async fn dispatch_item(&mut self, record: &mut PrRecord, item: WorkItem, reasons: Vec<String>, now: DateTime<Utc>) {
        let kind = item.kind;
        let attempt = item.attempt;
        match self
            .dispatcher
            .dispatch(record, item, reasons, &mut self.worktrees, now)
            .await
        {
            Ok(DispatchOutcome::Dispatched { .. }) => self.emit(SchedulerEvent::Dispatched {
                pr: record.id.number,
                kind,
                attempt,
            }),
            Ok(DispatchOutcome::Deferred) | Ok(DispatchOutcome::AlreadyInFlight) => {}
            Err(e) => {
                tracing::warn!(pr = %record.id, error = %e, "dispatch failed");
                match self.recovery.on_error(record, &e, now) {
                    RecoveryAction::Escalate(cause) => {
                        self.escalate(record, &cause, Some(e.to_string())).await
                    }
                    RecoveryAction::Evict => record.mark_due(),
                    RecoveryAction::Redispatch | RecoveryAction::RetrySame(_) => {}
                }
            }
        }
    }

    async fn handle_completion(&mut self, completion: WorkCompletion, now: DateTime<Utc>) {
        self.dispatcher
            .pool_mut()
            .complete(&completion.pr, completion.worker_id);
        if let Err(e) = self
            .worktrees
            .finish(&completion.worktree_id, completion.worker_id)
        {
            tracing::debug!(error = %e, "worktree already released");
        }

        let Some(mut record) = self.registry.remove(&completion.pr) else {
            tracing::debug!(pr = %completion.pr, "completion for untracked PR");
            return;
        };
        let current = record.in_flight.as_ref().map(|f| f.item.id);
        if current != Some(completion.item.id) {
            tracing::debug!(pr = %completion.pr, "stale completion ignored");
            self.registry.insert(completion.pr.clone(), record);
            return;
        }
        record.in_flight = None;

        let item = completion.item;
        let (success, detail) = match &completion.outcome {
            Ok(report) => (true, report.summary.clone()),
            Err(e) => (false, e.to_string()),
        };
        self.emit(SchedulerEvent::Completed {
            pr: record.id.number,
            kind: item.kind,
            attempt: item.attempt,
            success,
            detail: detail.clone(),
        });

        match completion.outcome {
            Ok(_) => {
                tracing::info!(pr = %record.id, kind = %item.kind, attempt = item.attempt, "work item done");
                record.unverified_attempt = item.primary_criterion();
                record.transient_retries = 0;
            }
            Err(error) => match self.recovery.on_work_failure(&mut record, &item, &error, now) {
                RecoveryAction::RetrySame(retry) => {
                    self.dispatch_item(&mut record, retry, Vec::new(), now).await;
                }
                RecoveryAction::Escalate(cause) => {
                    self.escalate(&record, &cause, Some(detail)).await;
                }
                RecoveryAction::Redispatch | RecoveryAction::Evict => {}
            },
        }
        record.mark_due();
        self.registry.insert(completion.pr, record);
    }

    /// Abort a work item that made no progress and count it as a failed
    /// attempt.
    async fn handle_stale(&mut self, record: &mut PrRecord, now: DateTime<Utc>) {
        tracing::warn!(pr = %record.id, "work item stale, aborting");
        self.dispatcher.pool_mut().abort(&record.id);
        if let Some((worktree, worker)) = record.in_flight.as_ref().map(|f| (f.worktree_id, f.worker_id)) {
            if let Err(e) = self.worktrees.finish(&worktree, worker) {
                tracing::debug!(error = %e, "stale worktree already free");
            }
            self.reclaim_worktree(worktree).await;
            if self.worktrees.get(&worktree).is_none() {
                record.assigned_worktree_id = None;
            }
        }
        if let RecoveryAction::Escalate(cause) = self.recovery.on_stale(record, now) {
            self.escalate(record, &cause, Some("no progress".to_string())).await;
        }
    }

    async fn reclaim_worktree(&mut self, id: WorktreeId) {
        let branch = self.worktrees.get(&id).map(|w| w.branch.clone());
        match self.worktrees.release(&id).await {
            Ok(()) => {}
            Err(Error::ConcurrentGitOperation { .. }) => self.queue_reclaim(id),
            Err(e @ (Error::DirtyWorktree { .. } | Error::UnpushedCommits { .. })) => {
                tracing::warn!(worktree = %id.short(), error = %e, "worktree left pending reclaim");
                self.emit(SchedulerEvent::ReclaimPending {
                    worktree: id.short(),
                    branch: branch.unwrap_or_default(),
                    reason: e.to_string(),
                });
                self.queue_reclaim(id);
            }
            Err(e) => tracing::warn!(worktree = %id.short(), error = %e, "worktree not reclaimed"),
        }
    }

    fn queue_reclaim(&mut self, id: WorktreeId) {
        if !self.reclaim.contains(&id) {
            self.reclaim.push(id);
        }
    }

    /// Retries every parked release once per tick. Repeat failures stay
    /// quiet; the first one already raised `ReclaimPending`.
    async fn retry_reclaims(&mut self) {
        for id in std::mem::take(&mut self.reclaim) {
            let idle = self
                .worktrees
                .get(&id)
                .map_or(false, |w| w.status != WorktreeStatus::Assigned);
            if !idle {
                continue;
            }
            match self.worktrees.release(&id).await {
                Ok(()) => tracing::info!(worktree = %id.short(), "pending worktree reclaimed"),
                Err(
                    e @ (Error::ConcurrentGitOperation { .. }
                    | Error::DirtyWorktree { .. }
                    | Error::UnpushedCommits { .. }),
                ) => {
                    tracing::debug!(worktree = %id.short(), error = %e, "worktree still pending reclaim");
                    self.queue_reclaim(id);
                }
                Err(e) => tracing::warn!(worktree = %id.short(), error = %e, "worktree not reclaimed"),
            }
        }
    }

    async fn evict(&mut self, mut record: PrRecord, state: LifecycleState) {
        self.dispatcher.pool_mut().abort(&record.id);
        if let Some(in_flight) = record.in_flight.take() {
            if let Err(e) = self.worktrees.finish(&in_flight.worktree_id, in_flight.worker_id) {
                tracing::debug!(error = %e, "worktree already free");
            }
        }
        let worktree = record
            .assigned_worktree_id
            .take()
            .or_else(|| self.worktrees.for_branch(&record.branch).map(|w| w.id));
        if let Some(id) = worktree {
            self.reclaim_worktree(id).await;
        }
        if let Err(e) = record.mark_terminal(state) {
            tracing::error!(pr = %record.id, error = %e, "could not mark terminal");
        }
        tracing::info!(pr = %record.id, %state, "evicted");
        self.emit(SchedulerEvent::Evicted {
            pr: record.id.number,
            state,
        });
    }

    async fn escalate(&self, record: &PrRecord, cause: &BlockCause, last_error: Option<String>) {
        let context = EscalationContext::for_record(record, last_error);
        match self.notifier.escalate(record, cause, &context).await {
            Ok(_) => self.emit(SchedulerEvent::Escalated {
                pr: record.id.number,
                cause: cause.to_string(),
            }),
            Err(e) => tracing::warn!(pr = %record.id, error = %e, "escalation not delivered"),
        }
    }
}

fn chrono_secs(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero())
}
