use thiserror::Error;

use crate::host::HostError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    #[error("Pull request not found: {0}")]
    PrNotFound(String),

    #[error(transparent)]
    Host(#[from] HostError),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Branch {branch} is already assigned to worker {worker}")]
    BranchAlreadyAssigned { branch: String, worker: String },

    #[error("Branch {branch} is checked out outside the managed root at {path}")]
    BranchCheckedOutElsewhere { branch: String, path: String },

    #[error("Worktree has uncommitted changes: {path}")]
    DirtyWorktree { path: String },

    #[error("Worktree has {count} unpushed commit(s): {path}")]
    UnpushedCommits { path: String, count: usize },

    #[error("Another git operation holds the worktree: {path}")]
    ConcurrentGitOperation { path: String },

    #[error("Worktree not found: {0}")]
    WorktreeNotFound(String),

    #[error("Worker pool is full (max: {max})")]
    WorkerPoolFull { max: usize },

    #[error("Stale state snapshot for {0}")]
    StaleMemory(String),

    #[error("Unsupported state schema version {0}")]
    UnsupportedSchema(u32),

    #[error("Already recorded: {marker}")]
    IdempotencySkip { marker: String },

    #[error("Repository {0} is locked by another engine")]
    RepoLocked(String),

    #[error("Invariant violated: {0}")]
    Invariant(String),
}

impl Error {
    /// Whether this error means two actors touched the same git state.
    pub fn is_isolation_violation(&self) -> bool {
        matches!(
            self,
            Error::BranchAlreadyAssigned { .. }
                | Error::BranchCheckedOutElsewhere { .. }
                | Error::ConcurrentGitOperation { .. }
        )
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::InvalidParams(_) | Error::TomlParse(_) => 1,
            Error::PrNotFound(_) => 2,
            Error::Host(e) => e.exit_code(),
            Error::IdempotencySkip { .. } => 5,
            _ => 3,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
