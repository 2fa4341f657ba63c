pub mod agent;
pub mod config;
pub mod core;
pub mod error;
pub mod git;
pub mod host;
pub mod log;
pub mod orchestration;
pub mod state;
pub mod util;
pub mod worktree;

pub use error::{Error, Result};
