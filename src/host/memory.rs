//! In-memory hosting provider for tests and dry runs.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use futures::future::BoxFuture;

use super::{
    with_marker, Comment, DiffStat, HostError, HostResult, HostingProvider, OpenPr, PostedComment,
    PrFacts, PrState,
};
use crate::core::{PrId, RepoSlug};

/// Operations that failures can be injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostOp {
    List,
    Get,
    Post,
    Diff,
}

#[derive(Debug, Default)]
struct Inner {
    prs: BTreeMap<PrId, PrFacts>,
    files: HashMap<PrId, Vec<String>>,
    failures: HashMap<HostOp, VecDeque<HostError>>,
    calls: HashMap<HostOp, usize>,
    next_comment_id: u64,
}

/// A fake host holding PR facts in memory.
///
/// Comments posted through it are attributed to the configured login and
/// bump the PR's `updated_at`, as the real platform does.
#[derive(Debug)]
pub struct InMemoryHost {
    login: String,
    inner: Mutex<Inner>,
}

impl InMemoryHost {
    pub fn new(login: impl Into<String>) -> Self {
        Self {
            login: login.into(),
            inner: Mutex::new(Inner {
                next_comment_id: 1000,
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn login(&self) -> &str {
        &self.login
    }

    pub fn upsert_pr(&self, repo: &RepoSlug, facts: PrFacts) {
        let id = PrId::new(repo.clone(), facts.number);
        self.lock().prs.insert(id, facts);
    }

    /// Mutate a PR's facts in place. Returns false when the PR is unknown.
    pub fn update_pr(&self, pr: &PrId, f: impl FnOnce(&mut PrFacts)) -> bool {
        match self.lock().prs.get_mut(pr) {
            Some(facts) => {
                f(facts);
                true
            }
            None => false,
        }
    }

    pub fn facts(&self, pr: &PrId) -> Option<PrFacts> {
        self.lock().prs.get(pr).cloned()
    }

    pub fn set_files(&self, pr: &PrId, files: Vec<String>) {
        self.lock().files.insert(pr.clone(), files);
    }

    /// Add a comment from someone other than the engine.
    pub fn add_comment(&self, pr: &PrId, author: &str, body: &str) -> Option<u64> {
        let mut inner = self.lock();
        let id = inner.next_comment_id;
        let facts = inner.prs.get_mut(pr)?;
        let now = Utc::now();
        facts.comments.push(Comment {
            id,
            author: author.to_string(),
            body: body.to_string(),
            created_at: now,
        });
        facts.updated_at = now;
        inner.next_comment_id += 1;
        Some(id)
    }

    pub fn comments(&self, pr: &PrId) -> Vec<Comment> {
        self.lock()
            .prs
            .get(pr)
            .map(|f| f.comments.clone())
            .unwrap_or_default()
    }

    /// Comments whose marker starts with `prefix`.
    pub fn comments_with_marker_prefix(&self, pr: &PrId, prefix: &str) -> Vec<Comment> {
        let needle = format!("{}marker {}", super::TAG_PREFIX, prefix);
        self.comments(pr)
            .into_iter()
            .filter(|c| c.body.contains(&needle))
            .collect()
    }

    /// Queue a failure for the next call of `op`.
    pub fn fail_next(&self, op: HostOp, err: HostError) {
        self.lock().failures.entry(op).or_default().push_back(err);
    }

    pub fn calls(&self, op: HostOp) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    fn enter(&self, op: HostOp) -> HostResult<()> {
        let mut inner = self.lock();
        *inner.calls.entry(op).or_default() += 1;
        match inner.failures.get_mut(&op).and_then(|q| q.pop_front()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl HostingProvider for InMemoryHost {
    fn viewer_login(&self) -> BoxFuture<'_, HostResult<String>> {
        Box::pin(async move { Ok(self.login.clone()) })
    }

    fn list_open_prs<'a>(&'a self, repo: &'a RepoSlug) -> BoxFuture<'a, HostResult<Vec<OpenPr>>> {
        Box::pin(async move {
            self.enter(HostOp::List)?;
            Ok(self
                .lock()
                .prs
                .iter()
                .filter(|(id, f)| &id.repo == repo && f.state == PrState::Open)
                .map(|(_, f)| f.summary())
                .collect())
        })
    }

    fn get_pr_state<'a>(&'a self, pr: &'a PrId) -> BoxFuture<'a, HostResult<PrFacts>> {
        Box::pin(async move {
            self.enter(HostOp::Get)?;
            self.facts(pr)
                .ok_or_else(|| HostError::NotFound(pr.to_string()))
        })
    }

    fn post_comment<'a>(
        &'a self,
        pr: &'a PrId,
        body: &'a str,
        marker: Option<&'a str>,
    ) -> BoxFuture<'a, HostResult<PostedComment>> {
        Box::pin(async move {
            self.enter(HostOp::Post)?;
            let mut inner = self.lock();
            let id = inner.next_comment_id;
            let facts = inner
                .prs
                .get_mut(pr)
                .ok_or_else(|| HostError::NotFound(pr.to_string()))?;
            if let Some(m) = marker {
                if let Some(existing) = facts.comments.iter().find(|c| c.has_marker(m)) {
                    return Ok(PostedComment {
                        id: existing.id,
                        created: false,
                    });
                }
            }
            let now = Utc::now();
            facts.comments.push(Comment {
                id,
                author: self.login.clone(),
                body: with_marker(body, marker),
                created_at: now,
            });
            facts.updated_at = now;
            inner.next_comment_id += 1;
            Ok(PostedComment { id, created: true })
        })
    }

    fn diff_stat<'a>(&'a self, pr: &'a PrId) -> BoxFuture<'a, HostResult<DiffStat>> {
        Box::pin(async move {
            self.enter(HostOp::Diff)?;
            let inner = self.lock();
            if !inner.prs.contains_key(pr) {
                return Err(HostError::NotFound(pr.to_string()));
            }
            let changed = inner.files.get(pr).map(|f| f.len() as u64).unwrap_or(0);
            Ok(DiffStat {
                additions: changed * 10,
                deletions: changed * 2,
                changed_files: changed,
            })
        })
    }

    fn files_changed<'a>(&'a self, pr: &'a PrId) -> BoxFuture<'a, HostResult<Vec<String>>> {
        Box::pin(async move {
            self.enter(HostOp::Diff)?;
            Ok(self.lock().files.get(pr).cloned().unwrap_or_default())
        })
    }
}
