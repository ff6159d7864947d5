//! thrum-daemon: the coordination daemon's RPC dispatch, routing,
//! subscription bus, session lifecycle, sync engine, and supervisor
//! (components C3-C8 of spec.md §2).
//!
//! [`thrum_core`] owns the event log, projection schema, and addressing
//! grammar; everything here wires those into a running process with two
//! network transports and a background sync loop.

pub mod connections;
pub mod rpc;
pub mod session;
pub mod subscriptions;
pub mod supervisor;
pub mod sync;
pub mod transport;

use connections::Connections;
use subscriptions::SubscriptionBus;
use thrum_core::addressing::AddressResolver;
use thrum_core::config::ThrumConfig;
use thrum_core::event_store::EventStore;
use thrum_core::projection::Projection;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Background sync loop statistics, surfaced via `sync.status`
/// (SPEC_FULL.md §10.7). Not part of spec.md's core data model, but
/// required to make the sync loop's health observable the way the spec's
/// propagation policy demands ("background failures ... are logged and
/// surfaced via `sync.status`").
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SyncStats {
    pub messages_pushed: u64,
    pub messages_pulled: u64,
    pub errors: u64,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub last_pass_at: Option<String>,
    pub circuit_open: bool,
}

/// The on-disk layout rooted at `<thrum-dir>` (spec.md §3.4).
#[derive(Debug, Clone)]
pub struct Layout {
    pub thrum_dir: PathBuf,
    pub sync_dir: PathBuf,
    pub var_dir: PathBuf,
    pub identities_dir: PathBuf,
    pub context_dir: PathBuf,
}

impl Layout {
    pub fn new(thrum_dir: PathBuf) -> Self {
        Layout {
            sync_dir: thrum_dir.join("sync"),
            var_dir: thrum_dir.join("var"),
            identities_dir: thrum_dir.join("identities"),
            context_dir: thrum_dir.join("context"),
            thrum_dir,
        }
    }

    pub fn socket_path(&self) -> PathBuf {
        self.var_dir.join("daemon.sock")
    }

    pub fn pid_path(&self) -> PathBuf {
        self.var_dir.join("daemon.pid")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.var_dir.join("daemon.lock")
    }

    pub fn ws_port_path(&self) -> PathBuf {
        self.var_dir.join("ws.port")
    }

    pub fn sync_lock_path(&self) -> PathBuf {
        self.var_dir.join("sync.lock")
    }

    pub fn projection_path(&self) -> PathBuf {
        self.var_dir.join("messages.db")
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        for dir in [&self.sync_dir, &self.var_dir, &self.identities_dir, &self.context_dir] {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::create_dir_all(self.sync_dir.join("messages"))?;
        Ok(())
    }
}

/// The daemon's shared, reference-counted runtime state. Every RPC handler
/// and background task holds an `Arc<DaemonState>`, never ambient globals
/// (spec.md §9: "pass an owned handle explicitly through startup").
pub struct DaemonState {
    pub repo_id: String,
    pub repo_path: PathBuf,
    pub layout: Layout,
    pub config: ThrumConfig,
    pub local_only: AtomicBool,
    pub event_store: EventStore,
    pub projection: Arc<Projection>,
    pub subscriptions: SubscriptionBus,
    pub connections: Connections,
    pub sync_stats: Mutex<SyncStats>,
    pub started_at: String,
    /// Worktree path each active session was started from, needed by
    /// `session.heartbeat` to run its Git queries in the right checkout.
    /// Runtime-only: never persisted, rebuilt as sessions restart.
    pub session_worktrees: Mutex<HashMap<String, PathBuf>>,
}

impl DaemonState {
    pub fn new(
        repo_id: String,
        repo_path: PathBuf,
        layout: Layout,
        config: ThrumConfig,
        local_only: bool,
        event_store: EventStore,
        projection: Arc<Projection>,
    ) -> Self {
        DaemonState {
            repo_id,
            repo_path,
            layout,
            config,
            local_only: AtomicBool::new(local_only),
            event_store,
            projection,
            subscriptions: SubscriptionBus::new(),
            connections: Connections::new(),
            sync_stats: Mutex::new(SyncStats::default()),
            started_at: chrono::Utc::now().to_rfc3339(),
            session_worktrees: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_local_only(&self) -> bool {
        self.local_only.load(Ordering::Relaxed)
    }

    pub fn sync_interval(&self) -> Duration {
        self.config.sync_interval()
    }
}

impl AddressResolver for DaemonState {
    fn agent_exists(&self, name: &str) -> bool {
        self.projection.agent_exists(name).unwrap_or(false)
    }

    fn group_members(&self, group_name: &str) -> Option<Vec<String>> {
        self.projection.group_members(group_name).ok().flatten()
    }

    fn role_exists(&self, role: &str) -> bool {
        self.projection.role_exists(role).unwrap_or(false)
    }
}
