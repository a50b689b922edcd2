use crate::api::ApiClient;
use crate::model::{ConsoleConfig, ConsoleEvent, StopPolicy, TaskId, TaskSnapshot};
use crate::orchestrator::{ConsoleContext, ConversionHelper, PollSettings, TaskController};
use crate::session::Session;
use crate::storage::{self, FileTokenStore, MemoryTokenStore, TokenStore};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing::info;

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "migration-console",
    version,
    about = "Operator console for Sybase to PostgreSQL migration jobs"
)]
pub struct Cli {
    /// Base URL of the migration service
    #[arg(long, env = "MIGRATION_API_URL", default_value = "http://localhost:8000")]
    pub base_url: String,

    /// Login entry point shown when the session expires
    #[arg(long, env = "MIGRATION_LOGIN_URL", default_value = "/login")]
    pub login_url: String,

    /// Bearer token to use instead of the stored one (never written to disk)
    #[arg(long, env = "MIGRATION_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Token file location (defaults to the user config directory)
    #[arg(long)]
    pub token_file: Option<PathBuf>,

    /// Interval between task status polls
    #[arg(long, default_value = "5s")]
    pub poll_interval: humantime::Duration,

    /// Per-request timeout
    #[arg(long, default_value = "30s")]
    pub request_timeout: humantime::Duration,

    /// Stop polling when the task reports `error`, not only on `completed`
    #[arg(long)]
    pub stop_on_error: bool,

    /// Print JSON instead of text (no TUI)
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Start a migration task and follow it until it completes
    Start {
        /// Print the task id and exit without polling
        #[arg(long)]
        detach: bool,
    },
    /// Follow an already running migration task
    Watch {
        task_id: String,
    },
    /// Convert Sybase SQL to PostgreSQL (reads stdin when no input is given)
    Convert {
        /// SQL text to convert
        #[arg(long, conflicts_with = "file")]
        sql: Option<String>,
        /// File holding the SQL to convert
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Log in and store the bearer token
    Login {
        #[arg(long)]
        username: String,
        #[arg(long, env = "MIGRATION_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Remove the stored bearer token
    Logout,
    /// Check that the migration service is reachable
    Health,
    /// Print the effective configuration
    Config,
}

pub async fn run(args: Cli) -> Result<()> {
    let cfg = build_config(&args);

    match args.command.clone() {
        Some(Command::Start { detach }) => run_start(&args, &cfg, detach).await,
        Some(Command::Watch { task_id }) => run_watch(&args, &cfg, TaskId::new(task_id)).await,
        Some(Command::Convert { sql, file }) => run_convert(&args, &cfg, sql, file).await,
        Some(Command::Login { username, password }) => {
            run_login(&args, &cfg, &username, &password).await
        }
        Some(Command::Logout) => {
            token_store(&args)?.clear()?;
            eprintln!("Logged out");
            Ok(())
        }
        Some(Command::Health) => run_health(&args, &cfg).await,
        Some(Command::Config) => {
            println!("{}", render_config(&args, &cfg)?);
            Ok(())
        }
        None => run_tui(&args, &cfg).await,
    }
}

#[cfg(feature = "tui")]
async fn run_tui(args: &Cli, cfg: &ConsoleConfig) -> Result<()> {
    if args.json {
        return Err(anyhow::anyhow!(
            "--json needs a subcommand (start, watch, convert, health)"
        ));
    }
    let ctx = build_context(args, cfg)?;
    crate::tui::run(ctx, cfg).await
}

#[cfg(not(feature = "tui"))]
async fn run_tui(_args: &Cli, _cfg: &ConsoleConfig) -> Result<()> {
    // Fallback when built without TUI support.
    Err(anyhow::anyhow!(
        "built without TUI support; use a subcommand (see --help)"
    ))
}

/// Build a `ConsoleConfig` from CLI arguments.
pub fn build_config(args: &Cli) -> ConsoleConfig {
    ConsoleConfig {
        base_url: args.base_url.clone(),
        login_url: args.login_url.clone(),
        poll_interval: Duration::from(args.poll_interval),
        request_timeout: Duration::from(args.request_timeout),
        stop_policy: if args.stop_on_error {
            StopPolicy::CompletedOrError
        } else {
            StopPolicy::CompletedOnly
        },
        user_agent: format!("migration-console/{}", env!("CARGO_PKG_VERSION")),
    }
}

fn render_config(args: &Cli, cfg: &ConsoleConfig) -> Result<String> {
    let out = if args.json {
        serde_json::to_string(cfg)?
    } else {
        serde_json::to_string_pretty(cfg)?
    };
    Ok(out)
}

fn token_store(args: &Cli) -> Result<Arc<dyn TokenStore>> {
    if let Some(token) = args.token.as_deref() {
        return Ok(Arc::new(MemoryTokenStore::with_token(token)));
    }
    let path = match args.token_file.clone() {
        Some(p) => p,
        None => storage::default_token_path()?,
    };
    Ok(Arc::new(FileTokenStore::new(path)))
}

fn build_client(args: &Cli, cfg: &ConsoleConfig) -> Result<(Arc<Session>, ApiClient)> {
    let store = token_store(args)?;
    let session = Session::open(store, cfg.login_url.clone()).context("failed to read token")?;
    let api = ApiClient::new(cfg, session.clone()).context("failed to build HTTP client")?;
    Ok((session, api))
}

pub(crate) fn build_context(args: &Cli, cfg: &ConsoleConfig) -> Result<ConsoleContext> {
    let (session, api) = build_client(args, cfg)?;
    Ok(ConsoleContext {
        session,
        service: Arc::new(api),
        settings: PollSettings {
            interval: cfg.poll_interval,
            stop_policy: cfg.stop_policy,
        },
    })
}

async fn run_start(args: &Cli, cfg: &ConsoleConfig, detach: bool) -> Result<()> {
    let ctx = build_context(args, cfg)?;
    let (evt_tx, evt_rx) = mpsc::unbounded_channel::<ConsoleEvent>();
    let mut tasks = TaskController::new(ctx.service.clone(), ctx.settings, Some(evt_tx));

    let task_id = tasks.start().await.context("migration did not start")?;
    if detach {
        tasks.shutdown();
        if args.json {
            println!("{}", serde_json::json!({ "task_id": task_id }));
        } else {
            println!("{task_id}");
        }
        return Ok(());
    }

    follow(args, &ctx.session, tasks, evt_rx).await
}

async fn run_watch(args: &Cli, cfg: &ConsoleConfig, task_id: TaskId) -> Result<()> {
    let ctx = build_context(args, cfg)?;
    let (evt_tx, evt_rx) = mpsc::unbounded_channel::<ConsoleEvent>();
    let mut tasks = TaskController::new(ctx.service.clone(), ctx.settings, Some(evt_tx));
    tasks.watch(task_id);
    follow(args, &ctx.session, tasks, evt_rx).await
}

/// Print task events until polling stops, the session expires or Ctrl-C.
async fn follow(
    args: &Cli,
    session: &Session,
    tasks: TaskController,
    evt_rx: mpsc::UnboundedReceiver<ConsoleEvent>,
) -> Result<()> {
    let (out_tx, out_handle) = spawn_output_writer();
    let outcome = follow_events(args, session, tasks, evt_rx, &out_tx).await;
    drop(out_tx);
    let _ = out_handle.await;
    outcome
}

async fn follow_events(
    args: &Cli,
    session: &Session,
    mut tasks: TaskController,
    mut evt_rx: mpsc::UnboundedReceiver<ConsoleEvent>,
    out_tx: &mpsc::UnboundedSender<OutputLine>,
) -> Result<()> {
    let mut session_rx = session.subscribe();
    let mut last_printed: Option<TaskSnapshot> = None;

    let outcome: Result<()> = loop {
        tokio::select! {
            ev = evt_rx.recv() => {
                let Some(ev) = ev else { break Ok(()) };
                match &ev {
                    ConsoleEvent::TaskUpdated { snapshot } => {
                        if last_printed.as_ref() == Some(snapshot) {
                            continue;
                        }
                        last_printed = Some(snapshot.clone());
                        match render_snapshot(args, snapshot) {
                            Ok(line) => {
                                let _ = out_tx.send(OutputLine::Stdout(line));
                            }
                            Err(e) => break Err(e),
                        }
                    }
                    ConsoleEvent::PollingStopped { .. } => {
                        let _ = out_tx.send(OutputLine::Stderr(ev.to_message()));
                        break Ok(());
                    }
                    other => {
                        let _ = out_tx.send(OutputLine::Stderr(other.to_message()));
                    }
                }
            }
            changed = session_rx.changed() => {
                if changed.is_ok() && session.is_expired() {
                    tasks.shutdown();
                    break Err(anyhow::anyhow!(
                        "session expired; log in again at {} (migration-console login)",
                        session.login_url()
                    ));
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, leaving the task running on the service");
                let last = crate::presenter::status_line(&tasks.snapshot());
                let _ = out_tx.send(OutputLine::Stderr(format!("Last seen: {last}")));
                break Ok(());
            }
        }
    };

    tasks.shutdown();
    outcome
}

fn render_snapshot(args: &Cli, snapshot: &TaskSnapshot) -> Result<String> {
    if args.json {
        return Ok(serde_json::to_string(snapshot)?);
    }
    let mut line = crate::presenter::status_line(snapshot);
    if snapshot.progress.is_some() {
        let counts = crate::presenter::progress_lines(snapshot.progress.as_ref()).join(", ");
        line.push_str(&format!(" ({counts})"));
    }
    Ok(line)
}

async fn read_sql(sql: Option<String>, file: Option<PathBuf>) -> Result<String> {
    if let Some(sql) = sql {
        return Ok(sql);
    }
    if let Some(path) = file {
        return tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("failed to read {}", path.display()));
    }
    let mut buf = String::new();
    tokio::io::stdin()
        .read_to_string(&mut buf)
        .await
        .context("failed to read SQL from stdin")?;
    Ok(buf)
}

async fn run_convert(
    args: &Cli,
    cfg: &ConsoleConfig,
    sql: Option<String>,
    file: Option<PathBuf>,
) -> Result<()> {
    let input = read_sql(sql, file).await?;
    if input.trim().is_empty() {
        return Err(anyhow::anyhow!("no SQL to convert"));
    }

    let ctx = build_context(args, cfg)?;
    let mut helper = ConversionHelper::new(ctx.service.clone());
    let outcome = helper.convert(&input).await.map(|_| ());

    if let Some(result) = helper.output() {
        if args.json {
            println!("{}", serde_json::to_string_pretty(result)?);
        } else {
            println!("{}", result.converted_sql);
            for warning in &result.warnings {
                eprintln!("warning: {warning}");
            }
        }
    }
    if ctx.session.is_expired() {
        eprintln!("Session expired; log in again at {}", ctx.session.login_url());
    }
    outcome.map_err(anyhow::Error::from)
}

async fn run_login(args: &Cli, cfg: &ConsoleConfig, username: &str, password: &str) -> Result<()> {
    if args.token.is_some() {
        return Err(anyhow::anyhow!("--token cannot be combined with login"));
    }
    let store = token_store(args)?;
    // Login itself must not carry a stale token.
    let anonymous = Session::open(Arc::new(MemoryTokenStore::default()), cfg.login_url.clone())?;
    let api = ApiClient::new(cfg, anonymous).context("failed to build HTTP client")?;

    let token = api.login(username, password).await.context("login failed")?;
    store.save(&token)?;
    info!(username, "logged in");
    eprintln!("Logged in as {username}");
    Ok(())
}

async fn run_health(args: &Cli, cfg: &ConsoleConfig) -> Result<()> {
    let (_, api) = build_client(args, cfg)?;
    let body = api
        .health()
        .await
        .with_context(|| format!("{} is not healthy", api.base_url()))?;
    if args.json {
        println!("{body}");
    } else {
        let status = body
            .get("status")
            .and_then(|v| v.as_str())
            .unwrap_or("ok");
        println!("{}: {status}", api.base_url());
    }
    Ok(())
}
