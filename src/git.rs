use std::path::{Path, PathBuf};
use std::process::Command;

use git2::{BranchType, ErrorCode, Repository, WorktreeAddOptions, WorktreePruneOptions};

use crate::{Error, Result};

/// A linked worktree as git reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeInfo {
    pub name: String,
    pub path: PathBuf,
    pub branch: Option<String>,
}

pub struct GitOps {
    repo_path: PathBuf,
}

impl GitOps {
    pub fn new(repo_path: &Path) -> Result<Self> {
        tracing::debug!(path = %repo_path.display(), "GitOps::new");
        let _ = Repository::discover(repo_path)?;
        Ok(Self {
            repo_path: repo_path.to_path_buf(),
        })
    }

    fn repo(&self) -> Result<Repository> {
        Ok(Repository::discover(&self.repo_path)?)
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Check out an existing branch into a new worktree.
    ///
    /// The branch is taken from the local heads, else from
    /// `origin/<branch>`, fetching it first when neither exists.
    pub fn create_worktree(&self, branch: &str, worktree_path: &Path) -> Result<()> {
        tracing::debug!(branch, path = %worktree_path.display(), "GitOps::create_worktree");
        let repo = self.repo()?;
        let local = match repo.find_branch(branch, BranchType::Local) {
            Ok(b) => b,
            Err(e) if e.code() == ErrorCode::NotFound => self.branch_from_remote(&repo, branch)?,
            Err(e) => return Err(e.into()),
        };
        let reference = local.into_reference();
        let mut opts = WorktreeAddOptions::new();
        opts.reference(Some(&reference));
        // Branch names may contain slashes, the folder name never does
        let worktree_name = worktree_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                Error::InvalidParams(format!("bad worktree path {}", worktree_path.display()))
            })?;
        repo.worktree(worktree_name, worktree_path, Some(&opts))?;
        tracing::debug!(branch, "worktree created");
        Ok(())
    }

    fn branch_from_remote<'r>(&self, repo: &'r Repository, branch: &str) -> Result<git2::Branch<'r>> {
        let remote_name = format!("origin/{}", branch);
        let remote = match repo.find_branch(&remote_name, BranchType::Remote) {
            Ok(b) => b,
            Err(e) if e.code() == ErrorCode::NotFound => {
                self.fetch_branch(branch)?;
                repo.find_branch(&remote_name, BranchType::Remote)?
            }
            Err(e) => return Err(e.into()),
        };
        let commit = remote.get().peel_to_commit()?;
        let mut local = repo.branch(branch, &commit, false)?;
        if let Err(e) = local.set_upstream(Some(&remote_name)) {
            tracing::warn!(branch, error = %e, "could not set upstream");
        }
        tracing::debug!(branch, commit = %commit.id(), "created local branch from origin");
        Ok(local)
    }

    /// `git fetch origin <branch>` through the CLI, which carries the
    /// user's credential helpers.
    pub fn fetch_branch(&self, branch: &str) -> Result<()> {
        let refspec = format!("+refs/heads/{0}:refs/remotes/origin/{0}", branch);
        let output = Command::new("git")
            .args(["fetch", "--quiet", "origin", &refspec])
            .current_dir(&self.repo_path)
            .output()?;
        if !output.status.success() {
            return Err(Error::Git(git2::Error::from_str(&format!(
                "git fetch origin {} failed: {}",
                branch,
                String::from_utf8_lossy(&output.stderr).trim()
            ))));
        }
        Ok(())
    }

    /// Remove a worktree and its admin directory. The branch is kept.
    pub fn remove_worktree(&self, worktree_path: &Path) -> Result<()> {
        tracing::debug!(path = %worktree_path.display(), "GitOps::remove_worktree");
        let repo = self.repo()?;
        let folder_name = worktree_path
            .file_name()
            .and_then(|n| n.to_str())
            .map(String::from);

        let worktree_name = repo
            .worktrees()?
            .iter()
            .flatten()
            .find(|name| {
                repo.find_worktree(name)
                    .map(|wt| wt.path() == worktree_path)
                    .unwrap_or(false)
                    || Some(*name) == folder_name.as_deref()
            })
            .map(String::from);

        if let Some(ref name) = worktree_name {
            if let Ok(worktree) = repo.find_worktree(name) {
                let _ = worktree.unlock();
                if let Err(e) = worktree.prune(Some(
                    WorktreePruneOptions::new()
                        .valid(true)
                        .working_tree(true)
                        .locked(true),
                )) {
                    tracing::warn!(name = %name, error = %e, "worktree prune failed");
                }
            }
        }

        if worktree_path.exists() {
            std::fs::remove_dir_all(worktree_path)?;
        }

        // A leftover admin dir makes git think the branch is still checked out
        for name in worktree_name.iter().chain(folder_name.iter()) {
            let admin_dir = repo.path().join("worktrees").join(name);
            if admin_dir.exists() {
                tracing::debug!(dir = %admin_dir.display(), "removing worktree admin dir");
                let _ = std::fs::remove_dir_all(&admin_dir);
            }
        }
        Ok(())
    }

    pub fn list_worktrees(&self) -> Result<Vec<WorktreeInfo>> {
        let repo = self.repo()?;
        let mut out = Vec::new();
        for name in repo.worktrees()?.iter().flatten() {
            let Ok(worktree) = repo.find_worktree(name) else {
                continue;
            };
            let path = worktree.path().to_path_buf();
            if !path.exists() {
                continue;
            }
            let path = std::fs::canonicalize(&path).unwrap_or(path);
            let branch = Repository::open_from_worktree(&worktree)
                .ok()
                .and_then(|r| head_branch(&r));
            out.push(WorktreeInfo {
                name: name.to_string(),
                path,
                branch,
            });
        }
        Ok(out)
    }

    /// Where `branch` is currently checked out, including the main checkout.
    pub fn worktree_for_branch(&self, branch: &str) -> Result<Option<PathBuf>> {
        let repo = self.repo()?;
        if !repo.is_bare() && head_branch(&repo).as_deref() == Some(branch) {
            return Ok(repo
                .workdir()
                .map(|p| std::fs::canonicalize(p).unwrap_or_else(|_| p.to_path_buf())));
        }
        Ok(self
            .list_worktrees()?
            .into_iter()
            .find(|w| w.branch.as_deref() == Some(branch))
            .map(|w| w.path))
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let repo = self.repo()?;
        let exists = match repo.find_branch(branch, BranchType::Local) {
            Ok(_) => Ok(true),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        };
        exists
    }

    /// Check if a worktree has uncommitted changes (staged, unstaged or untracked).
    pub fn is_dirty(worktree_path: &Path) -> Result<bool> {
        let repo = Repository::open(worktree_path)?;
        let mut opts = git2::StatusOptions::new();
        opts.include_untracked(true).include_ignored(false);
        let statuses = repo.statuses(Some(&mut opts))?;
        Ok(!statuses.is_empty())
    }

    /// Commits reachable from the worktree's HEAD that no remote-tracking
    /// ref contains.
    pub fn unpushed_commits(worktree_path: &Path) -> Result<usize> {
        let repo = Repository::open(worktree_path)?;
        let head = match repo.head() {
            Ok(head) => head,
            Err(e) if e.code() == ErrorCode::UnbornBranch => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let mut walk = repo.revwalk()?;
        walk.push(head.peel_to_commit()?.id())?;
        walk.hide_glob("refs/remotes/*")?;
        let mut count = 0;
        for oid in walk {
            oid?;
            count += 1;
        }
        Ok(count)
    }

    pub fn head_commit(worktree_path: &Path) -> Result<String> {
        let repo = Repository::open(worktree_path)?;
        let commit = repo.head()?.peel_to_commit()?;
        Ok(commit.id().to_string())
    }
}

fn head_branch(repo: &Repository) -> Option<String> {
    let head = repo.head().ok()?;
    if head.is_branch() {
        head.shorthand().map(String::from)
    } else {
        None
    }
}

/// Folder-safe name for a branch's worktree.
pub fn worktree_dir_name(branch: &str) -> String {
    branch
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect()
}
