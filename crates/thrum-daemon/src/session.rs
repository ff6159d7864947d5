//! Session Lifecycle & Work Context (C6, spec.md §4.6).
//!
//! Heartbeat extraction runs a bounded sequence of `git` queries per
//! session — current branch, unmerged commits with touched files, and
//! porcelain status — each wrapped by [`thrum_core::git::run_git`]'s
//! process-level timeout, so one slow worktree can never stall the whole
//! daemon (spec.md §5 "no suspension point is ever unbounded").

use crate::DaemonState;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thrum_core::error::{Result, ThrumError};
use thrum_core::event::{AgentUpdatePayload, EventPayload, SessionEndPayload, SessionStartPayload};
use thrum_core::git;
use thrum_core::identity::{IdentityAgent, IdentityFile};
use thrum_core::model::session::EndReason;
use thrum_core::model::work_context::{CommitSummary, WorkContext};

/// Per-step Git timeout used during heartbeat extraction.
const GIT_STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// Sessions with no heartbeat in this long are ended as `crash` on startup
/// (spec.md §4.6, §8 "A session with no heartbeats for >24h").
pub const CRASH_IDLE_THRESHOLD: Duration = Duration::from_secs(24 * 3600);

/// Default base branch used to compute "unmerged commits" when the caller
/// doesn't supply one; heartbeat is best-effort and never fails the whole
/// call if this guess is wrong, it just finds zero unmerged commits.
const DEFAULT_BASE_BRANCH: &str = "main";

/// Work-context snapshots with no unmerged commits older than this are
/// swept (spec.md §4.6).
const STALE_CONTEXT_THRESHOLD: Duration = Duration::from_secs(24 * 3600);

/// Work-context snapshots whose owning session ended longer ago than this
/// are swept regardless of unmerged commits (spec.md §4.6).
const STALE_SESSION_ENDED_THRESHOLD: Duration = Duration::from_secs(7 * 24 * 3600);

pub async fn start_session(state: &Arc<DaemonState>, agent_name: &str, session_id: &str, worktree_path: &Path) -> Result<()> {
    state.event_store.write_event(EventPayload::SessionStart(SessionStartPayload {
        session_id: session_id.to_string(),
        agent_name: agent_name.to_string(),
        started_at: chrono::Utc::now().to_rfc3339(),
    }))?;
    state
        .session_worktrees
        .lock()
        .unwrap()
        .insert(session_id.to_string(), worktree_path.to_path_buf());
    write_session_identity(state, agent_name, session_id, worktree_path).await;
    Ok(())
}

fn identity_path(state: &DaemonState, agent_name: &str) -> PathBuf {
    state.layout.identities_dir.join(format!("{agent_name}.json"))
}

/// Loads the on-disk identity file for `agent_name` if one exists, else
/// seeds a fresh one from the agent's current projection record. Used so
/// session-lifecycle writes update a file in place rather than clobbering
/// fields they don't touch.
fn load_or_init_identity(state: &DaemonState, agent_name: &str) -> Result<IdentityFile> {
    let path = identity_path(state, agent_name);
    if path.is_file() {
        if let Ok(identity) = IdentityFile::load(&path) {
            return Ok(identity);
        }
    }
    let agent = state
        .projection
        .get_agent(agent_name)?
        .ok_or_else(|| ThrumError::not_found("agent", agent_name))?;
    Ok(IdentityFile::new(
        IdentityAgent {
            kind: agent.kind,
            name: agent.name,
            role: agent.role,
            module: agent.module,
            display: agent.display,
        },
        state.repo_id.clone(),
        agent.worktree,
    ))
}

/// Records the active session on the agent's identity file (spec.md §4.6
/// "the identity file is updated to record the active session"). Best
/// effort: the event log, not the identity file, is the durable record of
/// session state, so a write failure here is logged and otherwise ignored.
async fn write_session_identity(state: &Arc<DaemonState>, agent_name: &str, session_id: &str, worktree_path: &Path) {
    let branch = git::current_branch(worktree_path, GIT_STEP_TIMEOUT).await.unwrap_or(None);
    let result = (|| -> Result<()> {
        let mut identity = load_or_init_identity(state, agent_name)?;
        identity.session_id = session_id.to_string();
        identity.worktree = worktree_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| worktree_path.to_string_lossy().to_string());
        if let Some(branch) = &branch {
            identity.branch = branch.clone();
        }
        identity.updated_at = chrono::Utc::now().to_rfc3339();
        identity.save(&identity_path(state, agent_name))
    })();
    if let Err(e) = result {
        tracing::warn!(agent = agent_name, error = %e, "failed to update identity file on session start");
    }
}

/// Writes `intent` into the agent's identity file (spec.md §4.6
/// "session.setIntent... write identity-file updates"). Best effort, same
/// rationale as [`write_session_identity`].
pub fn write_identity_intent(state: &Arc<DaemonState>, agent_name: &str, intent: &str) {
    let result = (|| -> Result<()> {
        let mut identity = load_or_init_identity(state, agent_name)?;
        identity.intent = intent.to_string();
        identity.updated_at = chrono::Utc::now().to_rfc3339();
        identity.save(&identity_path(state, agent_name))
    })();
    if let Err(e) = result {
        tracing::warn!(agent = agent_name, error = %e, "failed to update identity file with new intent");
    }
}

/// `session.setTask` also "writes identity-file updates" per spec.md §4.6,
/// but the v3 identity schema (spec.md §6.3) has no dedicated task field —
/// the task itself lives only in the `agent.update` event and projection.
/// So this just bumps `updated_at` to reflect the activity, the same as
/// every other identity-file touch.
pub fn touch_identity(state: &Arc<DaemonState>, agent_name: &str) {
    let result = (|| -> Result<()> {
        let mut identity = load_or_init_identity(state, agent_name)?;
        identity.updated_at = chrono::Utc::now().to_rfc3339();
        identity.save(&identity_path(state, agent_name))
    })();
    if let Err(e) = result {
        tracing::warn!(agent = agent_name, error = %e, "failed to touch identity file for task update");
    }
}

pub async fn end_session(state: &Arc<DaemonState>, session_id: &str, agent_name: &str, reason: EndReason) -> Result<()> {
    state.event_store.write_event(EventPayload::SessionEnd(SessionEndPayload {
        session_id: session_id.to_string(),
        agent_name: agent_name.to_string(),
        reason,
        ended_at: chrono::Utc::now().to_rfc3339(),
    }))?;
    let removed = state.subscriptions.remove_for_session(session_id);
    for id in &removed {
        let _ = state.projection.remove_subscription(id);
    }
    state.connections.unbind(session_id);
    state.session_worktrees.lock().unwrap().remove(session_id);
    Ok(())
}

/// Runs the heartbeat Git queries for `session_id` and writes the resulting
/// snapshot as `agent.update`. Returns the extracted context.
pub async fn heartbeat(state: &Arc<DaemonState>, session_id: &str) -> Result<WorkContext> {
    let session = state
        .projection
        .get_session(session_id)?
        .ok_or_else(|| thrum_core::error::ThrumError::not_found("session", session_id))?;

    let worktree_path = state
        .session_worktrees
        .lock()
        .unwrap()
        .get(session_id)
        .cloned()
        .unwrap_or_else(|| state.repo_path.clone());

    let context = extract_work_context(&worktree_path, session_id, DEFAULT_BASE_BRANCH).await;

    state.event_store.write_event(EventPayload::AgentUpdate(AgentUpdatePayload {
        agent_name: session.agent_name,
        contexts: vec![context.clone()],
        intent: None,
        task: None,
    }))?;

    Ok(context)
}

/// Runs the bounded Git query sequence in `worktree_path` and folds the
/// results into a [`WorkContext`]. Individual query failures (e.g. no Git
/// repo, detached HEAD) degrade gracefully rather than failing heartbeat
/// entirely — a stale work context is better than a broken heartbeat.
pub async fn extract_work_context(worktree_path: &Path, session_id: &str, base_branch: &str) -> WorkContext {
    let branch = git::current_branch(worktree_path, GIT_STEP_TIMEOUT).await.unwrap_or(None);

    let unmerged_commits = unmerged_commits(worktree_path, base_branch).await.unwrap_or_default();

    let uncommitted_files = porcelain_files(worktree_path).await.unwrap_or_default();

    let changed_files = diff_against_base(worktree_path, base_branch).await.unwrap_or_default();

    WorkContext {
        session_id: session_id.to_string(),
        branch,
        worktree_path: worktree_path.to_string_lossy().to_string(),
        unmerged_commits,
        uncommitted_files,
        changed_files,
        extracted_at: chrono::Utc::now().to_rfc3339(),
    }
}

async fn unmerged_commits(worktree_path: &Path, base_branch: &str) -> Result<Vec<CommitSummary>> {
    let range = format!("{base_branch}..HEAD");
    let log = git::run_git(worktree_path, &["log", "--format=%H%x09%s", &range], GIT_STEP_TIMEOUT).await?;
    let mut commits = Vec::new();
    for line in log.lines() {
        let Some((sha, message)) = line.split_once('\t') else { continue };
        let touched = git::run_git(worktree_path, &["show", "--name-only", "--format=", sha], GIT_STEP_TIMEOUT)
            .await
            .unwrap_or_default()
            .lines()
            .map(|s| s.to_string())
            .collect();
        commits.push(CommitSummary {
            sha: sha.to_string(),
            message_first_line: message.to_string(),
            touched_files: touched,
        });
    }
    Ok(commits)
}

async fn porcelain_files(worktree_path: &Path) -> Result<Vec<String>> {
    let out = git::run_git(worktree_path, &["status", "--porcelain"], GIT_STEP_TIMEOUT).await?;
    Ok(out
        .lines()
        .filter_map(|line| line.get(3..).map(|s| s.to_string()))
        .collect())
}

async fn diff_against_base(worktree_path: &Path, base_branch: &str) -> Result<Vec<String>> {
    let range = format!("{base_branch}...HEAD");
    let out = git::run_git(worktree_path, &["diff", "--name-only", &range], GIT_STEP_TIMEOUT).await?;
    Ok(out.lines().map(|s| s.to_string()).collect())
}

/// Crash detection (spec.md §4.6): on daemon start, end every session still
/// marked active whose last heartbeat predates `CRASH_IDLE_THRESHOLD`
/// (or that never heartbeat at all).
pub async fn sweep_crashed_sessions(state: &Arc<DaemonState>) -> Result<usize> {
    let cutoff = (chrono::Utc::now() - chrono::Duration::from_std(CRASH_IDLE_THRESHOLD).unwrap()).to_rfc3339();
    let stale = state.projection.stale_active_sessions(&cutoff)?;
    for session in &stale {
        end_session(state, &session.session_id, &session.agent_name, EndReason::Crash).await?;
        tracing::info!(session_id = %session.session_id, agent = %session.agent_name, "ended stale session as crash");
    }
    Ok(stale.len())
}

/// Stale work-context sweep (spec.md §4.6): run at daemon startup and
/// before each sync pass. Deletes snapshots with no unmerged commits
/// older than 24h, snapshots whose owning session ended more than 7 days
/// ago, and snapshots that never collected any Git data.
pub async fn sweep_stale_work_contexts(state: &Arc<DaemonState>) -> Result<usize> {
    let context_cutoff = (chrono::Utc::now() - chrono::Duration::from_std(STALE_CONTEXT_THRESHOLD).unwrap()).to_rfc3339();
    let session_cutoff = (chrono::Utc::now() - chrono::Duration::from_std(STALE_SESSION_ENDED_THRESHOLD).unwrap()).to_rfc3339();
    let removed = state.projection.sweep_stale_work_contexts(&context_cutoff, &session_cutoff)?;
    if removed > 0 {
        tracing::info!(removed, "swept stale work-context snapshots");
    }
    Ok(removed)
}
