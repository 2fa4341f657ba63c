//! Worker pool for dispatched work items.
//!
//! The `WorkerPool` runs each work item as its own tokio task, enforcing the
//! capacity limit and the item's deadline. It never blocks the caller: the
//! outcome of every task arrives later as a [`WorkCompletion`] on the
//! channel returned by [`WorkerPool::new`].

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::core::{PrId, WorkError, WorkItem, WorkItemId, WorkReport, WorkerId, WorktreeId};
use crate::host::DiffStat;
use crate::worktree::WorktreeLease;
use crate::{Error, Result};

/// Capacity of the completion channel. Worker tasks wait when it is full.
const COMPLETION_BUFFER: usize = 64;

/// What a worker is told about the PR besides the item itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkContext {
    pub branch: String,
    pub head_sha: String,
    pub diff_stat: Option<DiffStat>,
    pub files_changed: Vec<String>,
    /// Why each targeted criterion is failing, in item order.
    pub reasons: Vec<String>,
}

/// Something that can carry out a work item inside a leased worktree.
pub trait Worker: Send + Sync {
    fn execute<'a>(
        &'a self,
        item: &'a WorkItem,
        lease: &'a WorktreeLease,
        context: &'a WorkContext,
    ) -> BoxFuture<'a, std::result::Result<WorkReport, WorkError>>;
}

/// Reported by a worker task when it ends, successfully or not.
#[derive(Debug, Clone)]
pub struct WorkCompletion {
    pub pr: PrId,
    pub item: WorkItem,
    pub worker_id: WorkerId,
    pub worktree_id: WorktreeId,
    pub outcome: std::result::Result<WorkReport, WorkError>,
    pub finished_at: DateTime<Utc>,
}

/// A running work item.
#[derive(Debug)]
pub struct WorkerHandle {
    pub worker_id: WorkerId,
    pub item_id: WorkItemId,
    pub worktree_id: WorktreeId,
    pub started_at: DateTime<Utc>,
    abort: AbortHandle,
}

/// Manages the running worker tasks, at most one per PR.
///
/// # Example
///
/// ```ignore
/// let (mut pool, mut completions) = WorkerPool::new(worker, 4);
/// pool.spawn(item, lease, context, worker_id)?;
/// let completion = completions.recv().await;
/// ```
pub struct WorkerPool {
    worker: Arc<dyn Worker>,
    handles: HashMap<PrId, WorkerHandle>,
    max_concurrent: usize,
    completion_tx: mpsc::Sender<WorkCompletion>,
}

impl WorkerPool {
    /// Create a pool and the receiving end of its completion channel.
    ///
    /// # Arguments
    ///
    /// * `worker` - Executes every item the pool runs
    /// * `max_concurrent` - Maximum number of items running at once
    pub fn new(worker: Arc<dyn Worker>, max_concurrent: usize) -> (Self, mpsc::Receiver<WorkCompletion>) {
        let (completion_tx, completion_rx) = mpsc::channel(COMPLETION_BUFFER);
        (
            Self {
                worker,
                handles: HashMap::new(),
                max_concurrent,
                completion_tx,
            },
            completion_rx,
        )
    }

    pub fn has_capacity(&self) -> bool {
        self.handles.len() < self.max_concurrent
    }

    pub fn active_count(&self) -> usize {
        self.handles.len()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn is_running(&self, pr: &PrId) -> bool {
        self.handles.contains_key(pr)
    }

    pub fn handle(&self, pr: &PrId) -> Option<&WorkerHandle> {
        self.handles.get(pr)
    }

    /// Start `item` on its own task and return immediately.
    ///
    /// The lease moves into the task and is released when the task ends,
    /// before the completion is sent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WorkerPoolFull`] at capacity and [`Error::Invariant`]
    /// if the PR already has a running item.
    pub fn spawn(
        &mut self,
        item: WorkItem,
        lease: WorktreeLease,
        context: WorkContext,
        worker_id: WorkerId,
    ) -> Result<()> {
        if !self.has_capacity() {
            return Err(Error::WorkerPoolFull {
                max: self.max_concurrent,
            });
        }
        let pr = item.target_pr_id.clone();
        if self.handles.contains_key(&pr) {
            return Err(Error::Invariant(format!("{} already has a running work item", pr)));
        }

        let worker = self.worker.clone();
        let tx = self.completion_tx.clone();
        let item_id = item.id;
        let worktree_id = lease.worktree_id;
        let task_pr = pr.clone();
        let task = tokio::spawn(async move {
            let budget = item.remaining(Utc::now());
            let outcome = match tokio::time::timeout(budget, worker.execute(&item, &lease, &context)).await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(WorkError::DeadlineExceeded),
            };
            drop(lease);
            let completion = WorkCompletion {
                pr: task_pr,
                item,
                worker_id,
                worktree_id,
                outcome,
                finished_at: Utc::now(),
            };
            if tx.send(completion).await.is_err() {
                tracing::debug!("completion channel closed");
            }
        });

        tracing::info!(
            pr = %pr,
            item = %item_id.short(),
            worker = %worker_id.short(),
            "work item started"
        );
        self.handles.insert(
            pr,
            WorkerHandle {
                worker_id,
                item_id,
                worktree_id,
                started_at: Utc::now(),
                abort: task.abort_handle(),
            },
        );
        Ok(())
    }

    /// Forget the handle for a task that reported back. A completion from a
    /// worker that is no longer current leaves the handle alone.
    pub fn complete(&mut self, pr: &PrId, worker_id: WorkerId) -> Option<WorkerHandle> {
        match self.handles.get(pr) {
            Some(handle) if handle.worker_id == worker_id => self.handles.remove(pr),
            _ => None,
        }
    }

    /// Abort the running item for `pr`. Its lease is released when the
    /// task is dropped; no completion is sent.
    pub fn abort(&mut self, pr: &PrId) -> Option<WorkerHandle> {
        let handle = self.handles.remove(pr)?;
        handle.abort.abort();
        tracing::warn!(pr = %pr, worker = %handle.worker_id.short(), "work item aborted");
        Some(handle)
    }

    pub fn abort_all(&mut self) {
        for (_, handle) in self.handles.drain() {
            handle.abort.abort();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.abort_all();
    }
}
