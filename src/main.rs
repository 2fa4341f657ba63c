use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use chrono::Utc;
use clap::error::ErrorKind;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use prflow::agent::CommandWorker;
use prflow::config::Config;
use prflow::core::{AuthorKind, PrId, RepoSlug};
use prflow::git::GitOps;
use prflow::host::gh_cli::GhCliHost;
use prflow::host::retry::RetryingHost;
use prflow::host::HostingProvider;
use prflow::orchestration::report::{self, StatusReport};
use prflow::orchestration::{Notifier, Scheduler, Verifier};
use prflow::state::{Persisted, RepoLock, StateStore};
use prflow::worktree::WorktreeManager;
use prflow::{Error, Result};

/// prflow - drives pull requests to a verified ready-to-merge state
#[derive(Parser, Debug)]
#[command(name = "prflow")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    PRFLOW_DEBUG=1  Enable debug logging (alternative to --debug)\n    RUST_LOG        Override the log filter")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.prflow/prflow.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Config file (default: ~/.prflow/prflow.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Verify every open PR once and report what each needs
    Poll {
        /// Repository as owner/name
        #[arg(long)]
        repo: RepoSlug,
    },

    /// Evaluate the readiness gate for one PR
    Verify {
        #[arg(long)]
        repo: RepoSlug,

        #[arg(long)]
        pr: u64,
    },

    /// Count open PRs by lifecycle state
    Status {
        #[arg(long)]
        repo: RepoSlug,
    },

    /// Verify one PR and persist its state snapshot
    Checkpoint {
        #[arg(long)]
        repo: RepoSlug,

        #[arg(long)]
        pr: u64,
    },

    /// Run the control loop until interrupted, printing JSON events
    Run {
        #[arg(long)]
        repo: RepoSlug,

        /// Local clone of the repository (default: current directory)
        #[arg(long)]
        path: Option<PathBuf>,
    },
}

#[derive(Serialize)]
struct ErrorOutput {
    error: String,
    code: i32,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            return match usage_error(&err) {
                Some(output) => {
                    print_error(&output);
                    exit_code(output.code)
                }
                None => {
                    let _ = err.print();
                    ExitCode::SUCCESS
                }
            };
        }
    };
    let guard = prflow::log::init_with_debug(cli.debug);

    let code = match run(cli) {
        Ok(()) => 0,
        Err(e) => {
            let code = e.exit_code();
            tracing::error!(error = %e, code, "command failed");
            print_error(&ErrorOutput {
                error: e.to_string(),
                code,
            });
            code
        }
    };
    // Flush the file appender before the process goes away.
    drop(guard);
    exit_code(code)
}

/// Clap's own error as CLI output. `None` for help and version, which are
/// printed the way clap prints them.
fn usage_error(err: &clap::Error) -> Option<ErrorOutput> {
    match err.kind() {
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => None,
        _ => {
            let rendered = err.render().to_string();
            let message = rendered
                .lines()
                .take_while(|line| !line.starts_with("Usage:"))
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .collect::<Vec<_>>()
                .join(" ");
            let message = message.trim_start_matches("error: ").to_string();
            let error = Error::InvalidParams(message);
            Some(ErrorOutput {
                code: error.exit_code(),
                error: error.to_string(),
            })
        }
    }
}

fn print_error(output: &ErrorOutput) {
    match serde_json::to_string(output) {
        Ok(json) => eprintln!("{}", json),
        Err(_) => eprintln!("{}", output.error),
    }
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

fn run(cli: Cli) -> Result<()> {
    let config = Config::load(cli.config.as_deref())?;
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        match cli.command {
            Command::Poll { repo } => run_poll(&config, repo).await,
            Command::Verify { repo, pr } => run_verify(&config, repo, pr).await,
            Command::Status { repo } => run_status(&config, repo).await,
            Command::Checkpoint { repo, pr } => run_checkpoint(&config, repo, pr).await,
            Command::Run { repo, path } => run_loop(&config, repo, path).await,
        }
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Host wrapped for retries, plus the login it posts as.
async fn connect(config: &Config) -> Result<(Arc<dyn HostingProvider>, String)> {
    let gh = GhCliHost::new(config.effective_gh_binary());
    if !gh.is_available() {
        return Err(Error::InvalidParams(format!(
            "{} not found on PATH",
            config.effective_gh_binary()
        )));
    }
    let host: Arc<dyn HostingProvider> = Arc::new(RetryingHost::new(Arc::new(gh), &config.host));
    let login = match config.engine_login.clone() {
        Some(login) => login,
        None => host.viewer_login().await?,
    };
    tracing::debug!(%login, "connected to host");
    Ok((host, login))
}

fn verifier(config: &Config, host: &Arc<dyn HostingProvider>, login: &str) -> Verifier {
    Verifier::new(
        host.clone(),
        config.gate.clone(),
        config.authors.clone(),
        login.to_string(),
    )
}

async fn poll_rows(config: &Config, repo: &RepoSlug) -> Result<report::PollReport> {
    let (host, login) = connect(config).await?;
    let verifier = verifier(config, &host, &login);
    let store = StateStore::new(host.clone(), login);
    report::poll_report(
        host.as_ref(),
        &verifier,
        &store,
        &config.tracking,
        &config.authors,
        repo,
        Utc::now(),
    )
    .await
}

async fn run_poll(config: &Config, repo: RepoSlug) -> Result<()> {
    let report = poll_rows(config, &repo).await?;
    print_json(&report)
}

async fn run_status(config: &Config, repo: RepoSlug) -> Result<()> {
    let report = poll_rows(config, &repo).await?;
    print_json(&StatusReport::from_rows(&repo, &report.prs))
}

async fn run_verify(config: &Config, repo: RepoSlug, pr: u64) -> Result<()> {
    let (host, login) = connect(config).await?;
    let verifier = verifier(config, &host, &login);
    let verification = verifier.verify(&PrId::new(repo, pr), false, Utc::now()).await?;
    let author = verification
        .facts
        .as_ref()
        .map(|f| AuthorKind::classify(&f.author, &config.authors))
        .unwrap_or_default();
    print_json(&report::verify_report(&verification, author))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CheckpointOutput {
    pr: u64,
    marker: String,
    comment_id: u64,
}

async fn run_checkpoint(config: &Config, repo: RepoSlug, pr: u64) -> Result<()> {
    config.ensure_dirs(&repo)?;
    let _lock = RepoLock::acquire(&Config::lock_dir()?, &repo)?;
    let (host, login) = connect(config).await?;
    let verifier = verifier(config, &host, &login);
    let store = StateStore::new(host.clone(), login);
    let notifier = Notifier::new(host.clone());
    let id = PrId::new(repo, pr);
    match report::checkpoint(
        &verifier,
        &store,
        &notifier,
        &config.authors,
        config.polling.min_interval(),
        &id,
        Utc::now(),
    )
    .await?
    {
        Persisted::Written { marker, comment_id } => print_json(&CheckpointOutput {
            pr,
            marker,
            comment_id,
        }),
        Persisted::Unchanged { marker } => Err(Error::IdempotencySkip { marker }),
    }
}

async fn run_loop(config: &Config, repo: RepoSlug, path: Option<PathBuf>) -> Result<()> {
    config.ensure_dirs(&repo)?;
    let lock = RepoLock::acquire(&Config::lock_dir()?, &repo)?;
    tracing::info!(%repo, lock = %lock.path().display(), "repository lock held");

    let repo_path = match path {
        Some(p) => p,
        None => std::env::current_dir()?,
    };
    let git = GitOps::new(&repo_path)?;
    let worktrees = WorktreeManager::new(git, &config.worktrees_dir(&repo)?)?;

    let worker = CommandWorker::from_config(config);
    if !worker.is_available() {
        tracing::warn!(binary = worker.binary(), "worker command not found on PATH");
    }

    let (host, login) = connect(config).await?;
    let mut scheduler = Scheduler::new(repo, config, host, login, Arc::new(worker), worktrees);

    let mut events = scheduler.subscribe();
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => tracing::warn!(error = %e, "could not encode event"),
            }
        }
    });

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            on_signal.cancel();
        }
    });

    let result = scheduler.run(cancel).await;
    drop(scheduler);
    let _ = printer.await;
    result
}
