//! Hosting provider backed by the GitHub `gh` CLI.

use std::ffi::OsString;
use std::process::Stdio;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{
    with_marker, CheckRun, CheckStatus, Comment, DiffStat, HostError, HostResult,
    HostingProvider, Mergeable, OpenPr, PostedComment, PrFacts, PrState, Review, ReviewDecision,
    ReviewState, ReviewThread,
};
use crate::core::{PrId, RepoSlug};

const LIST_LIMIT: &str = "200";
const MAX_ERROR_DETAIL: usize = 400;

const PR_QUERY: &str = r#"
query($owner: String!, $name: String!, $number: Int!) {
  repository(owner: $owner, name: $name) {
    pullRequest(number: $number) {
      number state isDraft headRefName headRefOid baseRefName updatedAt
      reviewDecision mergeable
      author { login }
      commits(last: 1) {
        nodes { commit { committedDate statusCheckRollup { contexts(first: 100) { nodes {
          __typename
          ... on CheckRun { name status conclusion isRequired(pullRequestNumber: $number) }
          ... on StatusContext { context state isRequired(pullRequestNumber: $number) }
        } } } } }
      }
      reviews(last: 100) { nodes { author { login } state submittedAt } }
      comments(last: 100) { nodes { databaseId author { login } body createdAt } }
      reviewThreads(first: 100) { nodes { isResolved isOutdated } }
    }
  }
}
"#;

pub struct GhCliHost {
    binary: String,
}

impl GhCliHost {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn is_available(&self) -> bool {
        which::which(&self.binary).is_ok()
    }

    async fn run(&self, args: &[OsString], stdin: Option<&[u8]>) -> HostResult<Vec<u8>> {
        tracing::debug!(args = %render_args(args), "gh");
        let mut command = Command::new(&self.binary);
        command
            .args(args)
            .env("GH_PROMPT_DISABLED", "1")
            .env("NO_COLOR", "1")
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => HostError::Upstream(format!(
                "GitHub CLI `{}` was not found. Install gh and authenticate with `gh auth login`.",
                self.binary
            )),
            _ => HostError::Transient(format!("failed to run `{}`: {}", self.binary, e)),
        })?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input)
                .await
                .map_err(|e| HostError::Transient(format!("writing gh stdin: {}", e)))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| HostError::Transient(format!("waiting for gh: {}", e)))?;

        if output.status.success() {
            tracing::trace!(bytes = output.stdout.len(), "gh output");
            return Ok(output.stdout);
        }
        let detail = command_output_detail(&output);
        tracing::debug!(status = %output.status, detail = %detail, "gh failed");
        Err(classify_failure(&detail))
    }

    async fn existing_marker_comment(&self, pr: &PrId, marker: &str) -> HostResult<Option<u64>> {
        let path = comments_path(pr);
        let args = args([
            "api",
            path.as_str(),
            "--paginate",
            "--jq",
            ".[] | {id: .id, body: .body}",
        ]);
        let stdout = self.run(&args, None).await?;
        let tag = super::marker_tag(marker);
        Ok(parse_comment_lines(&String::from_utf8_lossy(&stdout))?
            .into_iter()
            .find(|c| c.body.contains(&tag))
            .map(|c| c.id))
    }
}

fn args<'a>(parts: impl IntoIterator<Item = &'a str>) -> Vec<OsString> {
    parts.into_iter().map(OsString::from).collect()
}

fn render_args(args: &[OsString]) -> String {
    args.iter()
        .map(|arg| arg.to_string_lossy().to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

fn comments_path(pr: &PrId) -> String {
    format!(
        "repos/{}/{}/issues/{}/comments",
        pr.repo.owner, pr.repo.name, pr.number
    )
}

fn command_output_detail(output: &std::process::Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let detail = if !stderr.is_empty() {
        stderr
    } else {
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if stdout.is_empty() {
            format!("exit status {}", output.status)
        } else {
            stdout
        }
    };
    truncate(&detail)
}

fn truncate(s: &str) -> String {
    if s.len() <= MAX_ERROR_DETAIL {
        return s.to_string();
    }
    let mut end = MAX_ERROR_DETAIL;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

/// Map `gh` failure output onto the host error taxonomy.
pub fn classify_failure(detail: &str) -> HostError {
    let lower = detail.to_ascii_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if has(&["rate limit", "secondary rate", "abuse detection"]) {
        HostError::Transient(detail.to_string())
    } else if has(&["http 401", "bad credentials", "gh auth login", "not logged in"]) {
        HostError::NotAuthenticated(detail.to_string())
    } else if has(&[
        "http 403",
        "resource not accessible",
        "must have push access",
        "permission",
    ]) {
        HostError::PermissionDenied(detail.to_string())
    } else if has(&[
        "http 404",
        "could not resolve to a",
        "no pull requests found",
        "not found",
    ]) {
        HostError::NotFound(detail.to_string())
    } else if has(&[
        "http 500",
        "http 502",
        "http 503",
        "http 504",
        "timeout",
        "timed out",
        "connection reset",
        "connection refused",
        "eof",
        "tls handshake",
        "something went wrong",
    ]) {
        HostError::Transient(detail.to_string())
    } else {
        HostError::Upstream(detail.to_string())
    }
}

#[derive(Deserialize)]
struct Envelope<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphqlError>,
}

#[derive(Deserialize)]
struct GraphqlError {
    message: String,
    #[serde(rename = "type")]
    kind: Option<String>,
}

#[derive(Deserialize)]
struct RepositoryData {
    repository: Option<RepositoryNode>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RepositoryNode {
    pull_request: Option<WirePr>,
}

#[derive(Deserialize)]
struct Nodes<T> {
    #[serde(default = "Vec::new")]
    nodes: Vec<T>,
}

impl<T> Default for Nodes<T> {
    fn default() -> Self {
        Self { nodes: Vec::new() }
    }
}

#[derive(Deserialize)]
struct Login {
    login: String,
}

fn login(author: Option<Login>) -> String {
    author.map(|a| a.login).unwrap_or_else(|| "ghost".to_string())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePr {
    number: u64,
    state: PrState,
    is_draft: bool,
    head_ref_name: String,
    head_ref_oid: String,
    base_ref_name: String,
    updated_at: DateTime<Utc>,
    review_decision: Option<ReviewDecision>,
    mergeable: Mergeable,
    author: Option<Login>,
    #[serde(default)]
    commits: Nodes<WireCommitNode>,
    #[serde(default)]
    reviews: Nodes<WireReview>,
    #[serde(default)]
    comments: Nodes<WireComment>,
    #[serde(default)]
    review_threads: Nodes<WireThread>,
}

#[derive(Deserialize)]
struct WireCommitNode {
    commit: WireCommit,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireCommit {
    committed_date: Option<DateTime<Utc>>,
    status_check_rollup: Option<WireRollup>,
}

#[derive(Deserialize)]
struct WireRollup {
    #[serde(default)]
    contexts: Nodes<WireContext>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireContext {
    #[serde(rename = "__typename")]
    typename: String,
    name: Option<String>,
    context: Option<String>,
    status: Option<String>,
    conclusion: Option<String>,
    state: Option<String>,
    #[serde(default)]
    is_required: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireReview {
    author: Option<Login>,
    state: ReviewState,
    submitted_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireComment {
    database_id: Option<u64>,
    author: Option<Login>,
    body: String,
    created_at: DateTime<Utc>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireThread {
    is_resolved: bool,
    is_outdated: bool,
}

fn check_status(ctx: &WireContext) -> CheckStatus {
    if ctx.typename == "StatusContext" {
        return match ctx.state.as_deref() {
            Some("SUCCESS") => CheckStatus::Success,
            Some("PENDING") | Some("EXPECTED") => CheckStatus::Pending,
            _ => CheckStatus::Failure,
        };
    }
    if ctx.status.as_deref() != Some("COMPLETED") {
        return CheckStatus::Pending;
    }
    match ctx.conclusion.as_deref() {
        Some("SUCCESS") => CheckStatus::Success,
        Some("NEUTRAL") => CheckStatus::Neutral,
        Some("SKIPPED") => CheckStatus::Skipped,
        Some("CANCELLED") => CheckStatus::Cancelled,
        Some("TIMED_OUT") => CheckStatus::TimedOut,
        Some("ACTION_REQUIRED") => CheckStatus::ActionRequired,
        Some("STALE") | None => CheckStatus::Pending,
        _ => CheckStatus::Failure,
    }
}

impl From<WirePr> for PrFacts {
    fn from(pr: WirePr) -> Self {
        let last_commit = pr.commits.nodes.into_iter().last().map(|n| n.commit);
        let last_commit_at = last_commit.as_ref().and_then(|c| c.committed_date);
        let checks = last_commit
            .and_then(|c| c.status_check_rollup)
            .map(|r| r.contexts.nodes)
            .unwrap_or_default()
            .into_iter()
            .map(|ctx| CheckRun {
                status: check_status(&ctx),
                name: ctx
                    .name
                    .clone()
                    .or_else(|| ctx.context.clone())
                    .unwrap_or_else(|| "unnamed-check".to_string()),
                required: ctx.is_required,
            })
            .collect();

        PrFacts {
            number: pr.number,
            head_sha: pr.head_ref_oid,
            head_ref: pr.head_ref_name,
            base_ref: pr.base_ref_name,
            state: pr.state,
            is_draft: pr.is_draft,
            author: login(pr.author),
            review_decision: pr.review_decision,
            reviews: pr
                .reviews
                .nodes
                .into_iter()
                .map(|r| Review {
                    author: login(r.author),
                    state: r.state,
                    submitted_at: r.submitted_at,
                })
                .collect(),
            checks,
            mergeable: pr.mergeable,
            comments: pr
                .comments
                .nodes
                .into_iter()
                .map(|c| Comment {
                    id: c.database_id.unwrap_or(0),
                    author: login(c.author),
                    body: c.body,
                    created_at: c.created_at,
                })
                .collect(),
            review_threads: pr
                .review_threads
                .nodes
                .into_iter()
                .map(|t| ReviewThread {
                    is_resolved: t.is_resolved,
                    is_outdated: t.is_outdated,
                })
                .collect(),
            updated_at: pr.updated_at,
            last_commit_at,
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8], what: &str) -> HostResult<T> {
    serde_json::from_slice(bytes).map_err(|e| {
        HostError::Decode(format!(
            "{}: {}. Output: {}",
            what,
            e,
            truncate(&String::from_utf8_lossy(bytes))
        ))
    })
}

pub fn parse_pr_facts(bytes: &[u8], pr: &PrId) -> HostResult<PrFacts> {
    let envelope: Envelope<RepositoryData> = decode(bytes, "pull request query")?;
    if let Some(err) = envelope.errors.first() {
        return Err(match err.kind.as_deref() {
            Some("NOT_FOUND") => HostError::NotFound(format!("{}: {}", pr, err.message)),
            Some("FORBIDDEN") => HostError::PermissionDenied(err.message.clone()),
            _ => classify_failure(&err.message),
        });
    }
    envelope
        .data
        .and_then(|d| d.repository)
        .and_then(|r| r.pull_request)
        .map(PrFacts::from)
        .ok_or_else(|| HostError::NotFound(pr.to_string()))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireListedPr {
    number: u64,
    head_ref_name: String,
    head_ref_oid: String,
    base_ref_name: String,
    author: Option<Login>,
    is_draft: bool,
    updated_at: DateTime<Utc>,
}

pub fn parse_open_prs(bytes: &[u8]) -> HostResult<Vec<OpenPr>> {
    let listed: Vec<WireListedPr> = decode(bytes, "gh pr list")?;
    Ok(listed
        .into_iter()
        .map(|p| OpenPr {
            number: p.number,
            head_ref: p.head_ref_name,
            head_sha: p.head_ref_oid,
            base_ref: p.base_ref_name,
            author: login(p.author),
            is_draft: p.is_draft,
            updated_at: p.updated_at,
        })
        .collect())
}

#[derive(Debug, Deserialize)]
struct IdBody {
    id: u64,
    body: String,
}

fn parse_comment_lines(stdout: &str) -> HostResult<Vec<IdBody>> {
    stdout
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| decode::<IdBody>(l.as_bytes(), "comment listing"))
        .collect()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireDiffStat {
    additions: u64,
    deletions: u64,
    changed_files: u64,
}

impl HostingProvider for GhCliHost {
    fn viewer_login(&self) -> BoxFuture<'_, HostResult<String>> {
        Box::pin(async move {
            let stdout = self.run(&args(["api", "user", "--jq", ".login"]), None).await?;
            let login = String::from_utf8_lossy(&stdout).trim().to_string();
            if login.is_empty() {
                return Err(HostError::NotAuthenticated(
                    "gh returned an empty login".to_string(),
                ));
            }
            Ok(login)
        })
    }

    fn list_open_prs<'a>(&'a self, repo: &'a RepoSlug) -> BoxFuture<'a, HostResult<Vec<OpenPr>>> {
        Box::pin(async move {
            let repo_arg = repo.to_string();
            let stdout = self
                .run(
                    &args([
                        "pr",
                        "list",
                        "--repo",
                        repo_arg.as_str(),
                        "--state",
                        "open",
                        "--limit",
                        LIST_LIMIT,
                        "--json",
                        "number,headRefName,headRefOid,baseRefName,author,isDraft,updatedAt",
                    ]),
                    None,
                )
                .await?;
            parse_open_prs(&stdout)
        })
    }

    fn get_pr_state<'a>(&'a self, pr: &'a PrId) -> BoxFuture<'a, HostResult<PrFacts>> {
        Box::pin(async move {
            let query = format!("query={}", PR_QUERY);
            let owner = format!("owner={}", pr.repo.owner);
            let name = format!("name={}", pr.repo.name);
            let number = format!("number={}", pr.number);
            let stdout = self
                .run(
                    &args([
                        "api",
                        "graphql",
                        "-f",
                        query.as_str(),
                        "-f",
                        owner.as_str(),
                        "-f",
                        name.as_str(),
                        "-F",
                        number.as_str(),
                    ]),
                    None,
                )
                .await?;
            parse_pr_facts(&stdout, pr)
        })
    }

    fn post_comment<'a>(
        &'a self,
        pr: &'a PrId,
        body: &'a str,
        marker: Option<&'a str>,
    ) -> BoxFuture<'a, HostResult<PostedComment>> {
        Box::pin(async move {
            if let Some(m) = marker {
                if let Some(id) = self.existing_marker_comment(pr, m).await? {
                    tracing::debug!(pr = %pr, marker = m, id, "comment already posted");
                    return Ok(PostedComment { id, created: false });
                }
            }
            let path = comments_path(pr);
            let payload = serde_json::json!({ "body": with_marker(body, marker) });
            let input = serde_json::to_vec(&payload)
                .map_err(|e| HostError::Decode(format!("encoding comment: {}", e)))?;
            let stdout = self
                .run(
                    &args([
                        "api",
                        path.as_str(),
                        "-X",
                        "POST",
                        "--input",
                        "-",
                    ]),
                    Some(&input),
                )
                .await?;
            #[derive(Deserialize)]
            struct Created {
                id: u64,
            }
            let created: Created = decode(&stdout, "created comment")?;
            Ok(PostedComment {
                id: created.id,
                created: true,
            })
        })
    }

    fn diff_stat<'a>(&'a self, pr: &'a PrId) -> BoxFuture<'a, HostResult<DiffStat>> {
        Box::pin(async move {
            let number = pr.number.to_string();
            let repo_arg = pr.repo.to_string();
            let stdout = self
                .run(
                    &args([
                        "pr",
                        "view",
                        number.as_str(),
                        "--repo",
                        repo_arg.as_str(),
                        "--json",
                        "additions,deletions,changedFiles",
                    ]),
                    None,
                )
                .await?;
            let stat: WireDiffStat = decode(&stdout, "gh pr view")?;
            Ok(DiffStat {
                additions: stat.additions,
                deletions: stat.deletions,
                changed_files: stat.changed_files,
            })
        })
    }

    fn files_changed<'a>(&'a self, pr: &'a PrId) -> BoxFuture<'a, HostResult<Vec<String>>> {
        Box::pin(async move {
            let number = pr.number.to_string();
            let repo_arg = pr.repo.to_string();
            let stdout = self
                .run(
                    &args([
                        "pr",
                        "diff",
                        number.as_str(),
                        "--repo",
                        repo_arg.as_str(),
                        "--name-only",
                    ]),
                    None,
                )
                .await?;
            Ok(String::from_utf8_lossy(&stdout)
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(String::from)
                .collect())
        })
    }
}
