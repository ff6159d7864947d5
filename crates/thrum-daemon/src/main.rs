//! thrum-daemon: the coordination daemon's process entry point.
//!
//! Thin by design (SPEC_FULL.md §10.5): resolves configuration and the
//! on-disk layout, acquires the singleton lock, brings up both transports
//! and the sync loop, then waits on SIGINT/SIGTERM to run the graceful
//! shutdown sequence. All actual behavior lives in library code so it
//! stays unit-testable without spawning a process.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thrum_core::config::{resolve_config, ConfigOverrides};
use thrum_core::event_store::EventStore;
use thrum_core::git;
use thrum_core::home::{get_home_dir, resolve_thrum_dir};
use thrum_core::ids::derive_repo_id;
use thrum_core::projection::Projection;
use thrum_core::repo::normalize_origin_url;
use thrum_daemon::session;
use thrum_daemon::supervisor::{self, ShutdownTask, Supervisor};
use thrum_daemon::sync::engine;
use thrum_daemon::transport;
use thrum_daemon::{DaemonState, Layout};
use tokio_util::sync::CancellationToken;
use tracing::info;

const GIT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Lowest port the WebSocket/HTTP listener tries, per spec.md §4.3
/// ("default first free >=9999").
const DEFAULT_WS_PORT: u16 = 9999;
const WS_PORT_SCAN_ATTEMPTS: u16 = 1000;

/// thrum coordination daemon.
#[derive(Parser, Debug)]
#[command(name = "thrum-daemon")]
#[command(about = "Local coordination daemon for multi-agent Git repositories")]
#[command(version)]
struct Args {
    /// Repository checkout to serve (defaults to the current directory).
    #[arg(long, value_name = "PATH")]
    repo: Option<PathBuf>,

    /// Path to a `.thrum.toml`-shaped config file, overriding the repo-local default.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Raise the default log level to debug.
    #[arg(short, long)]
    verbose: bool,

    /// Pin this daemon's agent identity name (overrides THRUM_NAME).
    #[arg(long, value_name = "NAME")]
    name: Option<String>,

    /// Pin this daemon's agent role (overrides THRUM_ROLE).
    #[arg(long, value_name = "ROLE")]
    role: Option<String>,

    /// Pin this daemon's agent module (overrides THRUM_MODULE).
    #[arg(long, value_name = "MODULE")]
    module: Option<String>,

    /// Fixed WebSocket port instead of first-free-from-9999 (overrides THRUM_WS_PORT).
    #[arg(long, value_name = "PORT")]
    ws_port: Option<u16>,

    /// Force local-only mode: no Git fetch/push in the sync loop (overrides THRUM_LOCAL).
    #[arg(long)]
    local: bool,

    /// Sync loop interval in seconds (overrides THRUM_SYNC_INTERVAL).
    #[arg(long, value_name = "SECS")]
    sync_interval: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    thrum_core::logging::init(args.verbose);

    info!("thrum daemon starting");

    let repo_path = match &args.repo {
        Some(p) => p.canonicalize().with_context(|| format!("resolving --repo {}", p.display()))?,
        None => std::env::current_dir().context("determining current directory")?,
    };
    let home_dir = get_home_dir().context("determining home directory")?;

    let git_common_dir = git::git_common_dir(&repo_path, GIT_QUERY_TIMEOUT)
        .await
        .context("resolving Git common directory (is this a Git repository?)")?;
    let thrum_dir = resolve_thrum_dir(&git_common_dir).context("resolving thrum directory")?;
    let layout = Layout::new(thrum_dir);
    layout.ensure_dirs().context("creating on-disk layout")?;

    let overrides = ConfigOverrides {
        config_path: args.config.clone(),
        name: args.name.clone(),
        role: args.role.clone(),
        module: args.module.clone(),
        ws_port: args.ws_port,
        local_only: if args.local { Some(true) } else { None },
        sync_interval_secs: args.sync_interval,
    };
    let config = resolve_config(&overrides, &repo_path, &home_dir).context("resolving configuration")?;

    let origin = git::origin_url(&repo_path, GIT_QUERY_TIMEOUT).await;
    let repo_id = match &origin {
        Some(url) => derive_repo_id(&normalize_origin_url(url)),
        None => String::new(),
    };
    let local_only = config.local_only.unwrap_or(false) || repo_id.is_empty();
    if repo_id.is_empty() {
        info!("no Git origin configured; running in local-only mode");
    } else if local_only {
        info!(repo_id = %repo_id, "local-only mode forced by configuration");
    } else {
        info!(repo_id = %repo_id, "resolved repository identity");
    }

    let _supervisor = Supervisor::acquire(&layout, &repo_path)
        .map_err(|e| anyhow::anyhow!("{e}"))
        .context("acquiring daemon singleton lock")?;

    let projection = Arc::new(Projection::open(&layout.projection_path()).context("opening projection database")?);
    let event_store = EventStore::new(layout.sync_dir.clone(), projection.clone());
    let replayed = event_store.rebuild_projection().context("rebuilding projection from event log")?;
    info!(events = replayed, "projection rebuilt from event log");

    let state = Arc::new(DaemonState::new(
        repo_id,
        repo_path.clone(),
        layout.clone(),
        config,
        local_only,
        event_store,
        projection,
    ));

    let crashed = session::sweep_crashed_sessions(&state).await.context("sweeping crashed sessions")?;
    if crashed > 0 {
        info!(crashed, "ended stale sessions as crashed on startup");
    }
    session::sweep_stale_work_contexts(&state).await.context("sweeping stale work contexts")?;

    engine::bootstrap(&state).await.context("bootstrapping sync branch/worktree")?;

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("shutdown signal received");
        signal_cancel.cancel();
    });

    let unix_state = state.clone();
    let unix_cancel = cancel.clone();
    let socket_path = state.layout.socket_path();
    let unix_handle = tokio::spawn(async move {
        if let Err(e) = transport::run_unix_listener(unix_state, &socket_path, unix_cancel).await {
            tracing::error!(error = %e, "unix socket listener exited with an error");
        }
    });

    let ws_port_requested = state.config.ws_port.unwrap_or(DEFAULT_WS_PORT);
    let (ws_port, ws_handle) = bind_ws_listener(state.clone(), ws_port_requested, cancel.clone())
        .await
        .context("binding websocket listener")?;
    std::fs::write(state.layout.ws_port_path(), ws_port.to_string()).context("persisting ws.port")?;
    info!(port = ws_port, "websocket listener ready");

    let sync_state = state.clone();
    let sync_cancel = cancel.clone();
    let sync_handle = tokio::spawn(async move {
        engine::run_loop(sync_state, sync_cancel).await;
    });

    cancel.cancelled().await;

    let report = supervisor::shutdown(vec![
        ShutdownTask { label: "unix-listener", handle: unix_handle },
        ShutdownTask { label: "ws-listener", handle: ws_handle },
        ShutdownTask { label: "sync-loop", handle: sync_handle },
    ])
    .await;

    if report.had_problems() {
        tracing::warn!("daemon stopped with one or more components not shutting down cleanly");
    }
    info!("thrum daemon shutdown complete");
    Ok(())
}

/// Tries successive ports starting at `start_port` until one binds
/// (spec.md §4.3 "default first free >=9999"). A caller-supplied explicit
/// `--ws-port`/`THRUM_WS_PORT` is tried first and, if already taken, still
/// falls through to scanning upward rather than failing outright.
async fn bind_ws_listener(
    state: Arc<DaemonState>,
    start_port: u16,
    cancel: CancellationToken,
) -> Result<(u16, tokio::task::JoinHandle<()>)> {
    let mut last_err = None;
    for offset in 0..WS_PORT_SCAN_ATTEMPTS {
        let port = start_port.saturating_add(offset);
        let bind_addr = format!("127.0.0.1:{port}");
        match transport::run_ws_listener(state.clone(), &bind_addr, cancel.clone()).await {
            Ok(result) => return Ok(result),
            Err(e) => {
                tracing::debug!(port, error = %e, "websocket port unavailable, trying next");
                last_err = Some(e);
            }
        }
    }
    Err(anyhow::anyhow!(
        "no free websocket port found starting at {start_port}: {}",
        last_err.map(|e| e.to_string()).unwrap_or_default()
    ))
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler, watching SIGINT only");
                let _ = ctrl_c.await;
                return;
            }
        };

        tokio::select! {
            _ = ctrl_c => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        info!("received Ctrl+C");
    }
}
