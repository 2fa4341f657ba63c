//! Integration test suite for prflow.
//!
//! These tests drive the scheduler against an in-memory host, a scripted
//! worker and a real git repository, so every worktree the engine creates
//! exists on disk.
//!
//! # Test Categories
//!
//! - `lifecycle_e2e`: From a failing PR to a single ready notice
//! - `worktree_isolation`: One writer per branch
//! - `recovery`: Bounded retries, stale work and escalation
//! - `persistence`: Snapshots across polls and restarts
//! - `eviction`: Merged and closed PRs
//!
//! # CI Compatibility
//!
//! No test talks to a real hosting provider or runs a coding agent.

mod fixtures;

mod eviction;
mod lifecycle_e2e;
mod persistence;
mod recovery;
mod worktree_isolation;
