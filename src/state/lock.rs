//! Exclusive per-repository engine lock.
//!
//! Two engines driving the same repository would race on worktrees and
//! double-post comments, so `run` and `checkpoint` hold an advisory file
//! lock for their whole lifetime. The lock is released by the OS if the
//! process dies.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::core::RepoSlug;
use crate::{Error, Result};

#[derive(Debug)]
pub struct RepoLock {
    file: File,
    path: PathBuf,
}

impl RepoLock {
    /// Take the lock for `repo` under `dir`, failing with
    /// [`Error::RepoLocked`] when another process holds it.
    pub fn acquire(dir: &Path, repo: &RepoSlug) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.lock", repo.file_stem()));
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        if file.try_lock_exclusive().is_err() {
            return Err(Error::RepoLocked(repo.to_string()));
        }
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        tracing::debug!(path = %path.display(), "repository lock acquired");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RepoLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to release repository lock");
        }
    }
}
