//! Worktree isolation manager.
//!
//! Sole owner of the worktree to branch and worktree to worker mappings.
//! Each branch has at most one worktree record and each worker holds at
//! most one. Git mutations inside a worktree go through a [`WorktreeLease`],
//! and only one lease per worktree can exist at a time.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::core::{PrId, WorkerId, WorktreeId};
use crate::git::{worktree_dir_name, GitOps};
use crate::util::blocking;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorktreeStatus {
    Free,
    Assigned,
    PendingReclaim,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeRecord {
    pub id: WorktreeId,
    pub path: PathBuf,
    pub branch: String,
    pub assigned_pr_id: Option<PrId>,
    pub assigned_worker_id: Option<WorkerId>,
    pub created_at: DateTime<Utc>,
    pub status: WorktreeStatus,
}

/// Exclusive right to mutate git state in one worktree.
#[derive(Debug)]
pub struct WorktreeLease {
    pub worktree_id: WorktreeId,
    pub path: PathBuf,
    pub branch: String,
    _guard: OwnedMutexGuard<()>,
}

impl WorktreeLease {
    /// A lease over a standalone lock, for exercising workers without a
    /// repository.
    #[cfg(test)]
    pub(crate) fn for_test(worktree_id: WorktreeId, lock: Arc<Mutex<()>>) -> Self {
        let guard = lock
            .try_lock_owned()
            .expect("test lock must be free");
        Self {
            worktree_id,
            path: PathBuf::from("/nonexistent/prflow-test"),
            branch: "test-branch".to_string(),
            _guard: guard,
        }
    }
}

pub struct WorktreeManager {
    git: Arc<GitOps>,
    root: PathBuf,
    records: HashMap<WorktreeId, WorktreeRecord>,
    by_branch: HashMap<String, WorktreeId>,
    by_worker: HashMap<WorkerId, WorktreeId>,
    locks: HashMap<WorktreeId, Arc<Mutex<()>>>,
}

impl WorktreeManager {
    pub fn new(git: GitOps, root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root)?;
        let root = std::fs::canonicalize(root)?;
        tracing::debug!(root = %root.display(), "WorktreeManager::new");
        Ok(Self {
            git: Arc::new(git),
            root,
            records: HashMap::new(),
            by_branch: HashMap::new(),
            by_worker: HashMap::new(),
            locks: HashMap::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn get(&self, id: &WorktreeId) -> Option<&WorktreeRecord> {
        self.records.get(id)
    }

    pub fn for_branch(&self, branch: &str) -> Option<&WorktreeRecord> {
        self.by_branch.get(branch).and_then(|id| self.records.get(id))
    }

    pub fn records(&self) -> impl Iterator<Item = &WorktreeRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn register(&mut self, branch: &str, path: PathBuf, status: WorktreeStatus) -> WorktreeId {
        let id = WorktreeId::new();
        self.records.insert(
            id,
            WorktreeRecord {
                id,
                path,
                branch: branch.to_string(),
                assigned_pr_id: None,
                assigned_worker_id: None,
                created_at: Utc::now(),
                status,
            },
        );
        self.by_branch.insert(branch.to_string(), id);
        self.locks.insert(id, Arc::new(Mutex::new(())));
        id
    }

    fn unregister(&mut self, id: &WorktreeId) -> Option<WorktreeRecord> {
        let record = self.records.remove(id)?;
        self.by_branch.remove(&record.branch);
        if let Some(worker) = record.assigned_worker_id {
            self.by_worker.remove(&worker);
        }
        self.locks.remove(id);
        Some(record)
    }

    /// Re-register worktrees left under the managed root by a previous run.
    pub async fn adopt(&mut self) -> Result<usize> {
        let git = self.git.clone();
        let found = blocking(move || git.list_worktrees()).await?;
        let mut adopted = 0;
        for info in found {
            let Some(branch) = info.branch else { continue };
            if !info.path.starts_with(&self.root) || self.by_branch.contains_key(&branch) {
                continue;
            }
            tracing::info!(branch = %branch, path = %info.path.display(), "adopted worktree");
            self.register(&branch, info.path, WorktreeStatus::Free);
            adopted += 1;
        }
        Ok(adopted)
    }

    /// Create or return the worktree for `branch`, assigned to `worker`.
    pub async fn acquire(
        &mut self,
        branch: &str,
        pr: &PrId,
        worker: WorkerId,
    ) -> Result<WorktreeRecord> {
        if let Some(held) = self.by_worker.get(&worker) {
            let held_branch = self.records.get(held).map(|r| r.branch.as_str());
            if held_branch != Some(branch) {
                return Err(Error::Invariant(format!(
                    "worker {} already holds a worktree for {:?}",
                    worker, held_branch
                )));
            }
        }

        let id = match self.by_branch.get(branch).copied() {
            Some(id) => {
                let record = self
                    .records
                    .get(&id)
                    .ok_or_else(|| Error::WorktreeNotFound(id.to_string()))?;
                if let (WorktreeStatus::Assigned, Some(holder)) =
                    (record.status, record.assigned_worker_id)
                {
                    if holder != worker {
                        return Err(Error::BranchAlreadyAssigned {
                            branch: branch.to_string(),
                            worker: holder.to_string(),
                        });
                    }
                }
                if !record.path.exists() {
                    tracing::warn!(branch, path = %record.path.display(), "worktree vanished, recreating");
                    let path = record.path.clone();
                    self.create(branch, path).await?;
                }
                id
            }
            None => {
                let path = self.locate(branch).await?;
                let status = WorktreeStatus::Free;
                self.register(branch, path, status)
            }
        };

        let record = self
            .records
            .get_mut(&id)
            .ok_or_else(|| Error::WorktreeNotFound(id.to_string()))?;
        record.status = WorktreeStatus::Assigned;
        record.assigned_pr_id = Some(pr.clone());
        record.assigned_worker_id = Some(worker);
        let record = record.clone();
        self.by_worker.insert(worker, id);
        tracing::debug!(branch, worktree = %id.short(), worker = %worker.short(), "worktree acquired");
        Ok(record)
    }

    /// Find an existing checkout under the root or create a new one.
    async fn locate(&self, branch: &str) -> Result<PathBuf> {
        let git = self.git.clone();
        let wanted = branch.to_string();
        let existing = blocking(move || git.worktree_for_branch(&wanted)).await?;
        match existing {
            Some(path) if path.starts_with(&self.root) => {
                tracing::info!(branch, path = %path.display(), "reusing existing worktree");
                Ok(path)
            }
            Some(path) => Err(Error::BranchCheckedOutElsewhere {
                branch: branch.to_string(),
                path: path.display().to_string(),
            }),
            None => {
                let path = self.root.join(worktree_dir_name(branch));
                self.create(branch, path.clone()).await?;
                Ok(path)
            }
        }
    }

    async fn create(&self, branch: &str, path: PathBuf) -> Result<()> {
        let git = self.git.clone();
        let branch = branch.to_string();
        blocking(move || {
            if path.exists() {
                git.remove_worktree(&path)?;
            }
            git.create_worktree(&branch, &path)
        })
        .await
    }

    /// Exclusive git-mutation guard for the worktree held by `worker`.
    pub fn lease(&self, id: &WorktreeId, worker: WorkerId) -> Result<WorktreeLease> {
        let record = self
            .records
            .get(id)
            .ok_or_else(|| Error::WorktreeNotFound(id.to_string()))?;
        if record.assigned_worker_id != Some(worker) {
            return Err(Error::BranchAlreadyAssigned {
                branch: record.branch.clone(),
                worker: record
                    .assigned_worker_id
                    .map(|w| w.to_string())
                    .unwrap_or_else(|| "none".to_string()),
            });
        }
        let lock = self
            .locks
            .get(id)
            .ok_or_else(|| Error::WorktreeNotFound(id.to_string()))?;
        let guard = lock
            .clone()
            .try_lock_owned()
            .map_err(|_| Error::ConcurrentGitOperation {
                path: record.path.display().to_string(),
            })?;
        Ok(WorktreeLease {
            worktree_id: *id,
            path: record.path.clone(),
            branch: record.branch.clone(),
            _guard: guard,
        })
    }

    /// Return the worktree to `free` once the worker is done with it.
    pub fn finish(&mut self, id: &WorktreeId, worker: WorkerId) -> Result<()> {
        let record = self
            .records
            .get_mut(id)
            .ok_or_else(|| Error::WorktreeNotFound(id.to_string()))?;
        if record.assigned_worker_id != Some(worker) {
            return Err(Error::Invariant(format!(
                "worker {} does not hold worktree {}",
                worker,
                id.short()
            )));
        }
        record.status = WorktreeStatus::Free;
        record.assigned_worker_id = None;
        self.by_worker.remove(&worker);
        Ok(())
    }

    /// Remove the worktree after checking nothing would be lost.
    ///
    /// On failure the record stays `pending-reclaim` for a later attempt.
    pub async fn release(&mut self, id: &WorktreeId) -> Result<()> {
        let record = self
            .records
            .get_mut(id)
            .ok_or_else(|| Error::WorktreeNotFound(id.to_string()))?;
        let path = record.path.clone();
        let in_use = self
            .locks
            .get(id)
            .map(|l| l.try_lock().is_err())
            .unwrap_or(false);
        if in_use {
            return Err(Error::ConcurrentGitOperation {
                path: path.display().to_string(),
            });
        }
        record.status = WorktreeStatus::PendingReclaim;
        if let Some(worker) = record.assigned_worker_id.take() {
            self.by_worker.remove(&worker);
        }

        if path.exists() {
            let dir = path.clone();
            let (dirty, unpushed) = blocking(move || {
                Ok((GitOps::is_dirty(&dir)?, GitOps::unpushed_commits(&dir)?))
            })
            .await?;
            if dirty {
                return Err(Error::DirtyWorktree {
                    path: path.display().to_string(),
                });
            }
            if unpushed > 0 {
                return Err(Error::UnpushedCommits {
                    path: path.display().to_string(),
                    count: unpushed,
                });
            }
            let git = self.git.clone();
            let target = path.clone();
            blocking(move || git.remove_worktree(&target)).await?;
        }

        if let Some(record) = self.unregister(id) {
            tracing::info!(branch = %record.branch, path = %path.display(), "worktree reclaimed");
        }
        Ok(())
    }

    /// Local probe for `commits_pushed`: does the branch's worktree hold
    /// commits absent from every remote-tracking ref?
    pub async fn has_unpushed(&self, branch: &str) -> Result<bool> {
        let Some(record) = self.for_branch(branch) else {
            return Ok(false);
        };
        if !record.path.exists() {
            return Ok(false);
        }
        let path = record.path.clone();
        Ok(blocking(move || GitOps::unpushed_commits(&path)).await? > 0)
    }
}
