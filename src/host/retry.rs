//! Timeout and bounded retry around any hosting provider.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

use super::{DiffStat, HostError, HostResult, HostingProvider, OpenPr, PostedComment, PrFacts};
use crate::config::HostConfig;
use crate::core::{PrId, RepoSlug};
use crate::orchestration::interval::AdaptiveInterval;

/// Wraps a provider so every call carries a timeout and transient failures
/// are retried with backoff. Unmarked posts are never retried, since a
/// timed-out post may still have landed.
pub struct RetryingHost {
    inner: Arc<dyn HostingProvider>,
    timeout: Duration,
    retries: u32,
    backoff_base: Duration,
}

impl RetryingHost {
    pub fn new(inner: Arc<dyn HostingProvider>, config: &HostConfig) -> Self {
        Self {
            inner,
            timeout: config.timeout(),
            retries: config.retries,
            backoff_base: config.backoff_base(),
        }
    }

    async fn with_retry<'a, T, F>(&'a self, op: &'static str, retryable: bool, mut f: F) -> HostResult<T>
    where
        F: FnMut(&'a dyn HostingProvider) -> BoxFuture<'a, HostResult<T>>,
    {
        let mut backoff = AdaptiveInterval::backoff(self.backoff_base, self.timeout);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = match tokio::time::timeout(self.timeout, f(self.inner.as_ref())).await {
                Ok(result) => result,
                Err(_) => Err(HostError::Transient(format!(
                    "{} timed out after {:?}",
                    op, self.timeout
                ))),
            };
            match result {
                Err(e) if e.is_transient() && retryable && attempt <= self.retries => {
                    let delay = backoff.current();
                    backoff.grow();
                    tracing::warn!(
                        op,
                        attempt,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "transient host error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }
}

impl HostingProvider for RetryingHost {
    fn viewer_login(&self) -> BoxFuture<'_, HostResult<String>> {
        Box::pin(self.with_retry("viewer_login", true, |h| h.viewer_login()))
    }

    fn list_open_prs<'a>(&'a self, repo: &'a RepoSlug) -> BoxFuture<'a, HostResult<Vec<OpenPr>>> {
        Box::pin(self.with_retry("list_open_prs", true, move |h| h.list_open_prs(repo)))
    }

    fn get_pr_state<'a>(&'a self, pr: &'a PrId) -> BoxFuture<'a, HostResult<PrFacts>> {
        Box::pin(self.with_retry("get_pr_state", true, move |h| h.get_pr_state(pr)))
    }

    fn post_comment<'a>(
        &'a self,
        pr: &'a PrId,
        body: &'a str,
        marker: Option<&'a str>,
    ) -> BoxFuture<'a, HostResult<PostedComment>> {
        Box::pin(self.with_retry("post_comment", marker.is_some(), move |h| {
            h.post_comment(pr, body, marker)
        }))
    }

    fn diff_stat<'a>(&'a self, pr: &'a PrId) -> BoxFuture<'a, HostResult<DiffStat>> {
        Box::pin(self.with_retry("diff_stat", true, move |h| h.diff_stat(pr)))
    }

    fn files_changed<'a>(&'a self, pr: &'a PrId) -> BoxFuture<'a, HostResult<Vec<String>>> {
        Box::pin(self.with_retry("files_changed", true, move |h| h.files_changed(pr)))
    }
}
