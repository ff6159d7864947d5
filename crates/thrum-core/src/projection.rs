//! Projection (C2): a deterministic, rebuildable SQLite-backed query model
//! derived purely from the event log (spec.md §4.2, §9 "Projection-from-log").
//!
//! `apply` is the single reducer every event passes through, whether it was
//! just written locally or replayed during `rebuild_projection`/sync merge.
//! The projection is never an authority: [`Projection::rebuild`] always
//! starts from a clean slate and must be safe to call at any time.

use crate::error::{Result, ThrumError};
use crate::event::{Event, EventPayload};
use crate::model::agent::{Agent, AgentKind};
use crate::model::group::MemberKind;
use crate::model::message::{Message, MessageBody, MessageEdit, MessageFormat};
use crate::model::scope::{Ref, Scope};
use crate::model::session::{EndReason, Session};
use crate::model::subscription::{Subscription, SubscriptionFilter};
use crate::model::work_context::WorkContext;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

const SCHEMA_VERSION: i64 = 1;

pub struct Projection {
    conn: Mutex<Connection>,
}

impl Projection {
    /// Opens (creating if absent) the projection database at `path` and
    /// ensures its schema exists.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let projection = Projection { conn: Mutex::new(conn) };
        projection.init_schema()?;
        Ok(projection)
    }

    /// In-memory projection, used by tests and by the "rebuild into a
    /// scratch model and diff" verification path.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let projection = Projection { conn: Mutex::new(conn) };
        projection.init_schema()?;
        Ok(projection)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);

            CREATE TABLE IF NOT EXISTS agents (
                name TEXT PRIMARY KEY,
                role TEXT NOT NULL,
                module TEXT NOT NULL,
                display TEXT,
                kind TEXT NOT NULL,
                worktree TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sessions (
                session_id TEXT PRIMARY KEY,
                agent_name TEXT NOT NULL,
                started_at TEXT NOT NULL,
                ended_at TEXT,
                end_reason TEXT,
                current_intent TEXT,
                current_task TEXT,
                last_heartbeat_at TEXT
            );

            CREATE TABLE IF NOT EXISTS session_scopes (
                session_id TEXT NOT NULL,
                scope_type TEXT NOT NULL,
                scope_value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS session_refs (
                session_id TEXT NOT NULL,
                ref_type TEXT NOT NULL,
                ref_value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS agent_work_contexts (
                session_id TEXT PRIMARY KEY,
                agent_name TEXT NOT NULL,
                context_json TEXT NOT NULL,
                extracted_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS messages (
                message_id TEXT PRIMARY KEY,
                thread_id TEXT,
                author_agent_name TEXT NOT NULL,
                session_id TEXT NOT NULL,
                body_format TEXT NOT NULL,
                body_content TEXT NOT NULL,
                body_structured TEXT,
                deleted INTEGER NOT NULL DEFAULT 0,
                delete_reason TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS message_scopes (
                message_id TEXT NOT NULL,
                scope_type TEXT NOT NULL,
                scope_value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS message_refs (
                message_id TEXT NOT NULL,
                ref_type TEXT NOT NULL,
                ref_value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS message_edits (
                message_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                content TEXT NOT NULL,
                format TEXT NOT NULL,
                edited_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS message_reads (
                message_id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                read_at TEXT NOT NULL,
                PRIMARY KEY (message_id, session_id)
            );

            CREATE TABLE IF NOT EXISTS groups (
                name TEXT PRIMARY KEY,
                description TEXT
            );

            CREATE TABLE IF NOT EXISTS group_members (
                group_name TEXT NOT NULL,
                member_kind TEXT NOT NULL,
                member_value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS subscriptions (
                subscription_id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                filter_json TEXT NOT NULL,
                agent_name TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS applied_events (
                event_id TEXT PRIMARY KEY
            );
            "#,
        )?;

        let count: i64 = conn.query_row("SELECT COUNT(*) FROM schema_version", [], |r| r.get(0))?;
        if count == 0 {
            conn.execute("INSERT INTO schema_version (version) VALUES (?1)", params![SCHEMA_VERSION])?;
        }
        Ok(())
    }

    /// Clears every table. The first half of the "nuke and rebuild" path
    /// spec.md §9 mandates be exercised in tests.
    pub fn clear(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            DELETE FROM agents;
            DELETE FROM sessions;
            DELETE FROM session_scopes;
            DELETE FROM session_refs;
            DELETE FROM agent_work_contexts;
            DELETE FROM messages;
            DELETE FROM message_scopes;
            DELETE FROM message_refs;
            DELETE FROM message_edits;
            DELETE FROM message_reads;
            DELETE FROM groups;
            DELETE FROM group_members;
            DELETE FROM subscriptions;
            DELETE FROM applied_events;
            "#,
        )?;
        Ok(())
    }

    /// True if `event_id` has already been folded into this projection —
    /// the dedup key the sync engine's merge step checks before replaying a
    /// remote event through the event store (spec.md §4.7 step 2).
    pub fn event_applied(&self, event_id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM applied_events WHERE event_id = ?1)",
            params![event_id],
            |r| r.get(0),
        )?;
        Ok(exists)
    }

    /// Applies a single event to the query model (spec.md §4.2 "Rules").
    /// Unknown event types are ignored for forward compatibility
    /// (spec.md §4.1). Every call, including no-ops, records the
    /// `event_id` so later passes can recognize it as already applied.
    pub fn apply(&self, event: &Event) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO applied_events (event_id) VALUES (?1)",
            params![event.event_id],
        )?;
        match &event.payload {
            EventPayload::MessageCreate(p) => {
                conn.execute(
                    "INSERT OR IGNORE INTO messages
                     (message_id, thread_id, author_agent_name, session_id, body_format, body_content, body_structured, deleted, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?8)",
                    params![
                        p.message_id,
                        p.thread_id,
                        p.author_agent_name,
                        p.session_id,
                        format_to_str(p.body.format),
                        p.body.content,
                        p.body.structured.as_ref().map(|v| v.to_string()),
                        event.timestamp,
                    ],
                )?;
                for s in &p.scopes {
                    conn.execute(
                        "INSERT INTO message_scopes (message_id, scope_type, scope_value) VALUES (?1, ?2, ?3)",
                        params![p.message_id, s.scope_type, s.value],
                    )?;
                }
                for r in &p.refs {
                    conn.execute(
                        "INSERT INTO message_refs (message_id, ref_type, ref_value) VALUES (?1, ?2, ?3)",
                        params![p.message_id, r.ref_type, r.value],
                    )?;
                }
            }
            EventPayload::MessageEdit(p) => {
                let seq: i64 = conn.query_row(
                    "SELECT COALESCE(MAX(seq), -1) + 1 FROM message_edits WHERE message_id = ?1",
                    params![p.message_id],
                    |r| r.get(0),
                )?;
                conn.execute(
                    "INSERT INTO message_edits (message_id, seq, content, format, edited_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![p.message_id, seq, p.previous.content, format_to_str(p.previous.format), p.previous.edited_at],
                )?;
                conn.execute(
                    "UPDATE messages SET body_format = ?2, body_content = ?3, updated_at = ?4 WHERE message_id = ?1",
                    params![p.message_id, format_to_str(p.body.format), p.body.content, event.timestamp],
                )?;
            }
            EventPayload::MessageDelete(p) => {
                conn.execute(
                    "UPDATE messages SET deleted = 1, delete_reason = ?2, updated_at = ?3 WHERE message_id = ?1",
                    params![p.message_id, p.delete_reason, event.timestamp],
                )?;
            }
            EventPayload::AgentRegister(p) => {
                conn.execute(
                    "INSERT INTO agents (name, role, module, display, kind, worktree) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT(name) DO UPDATE SET role=excluded.role, module=excluded.module, display=excluded.display, kind=excluded.kind, worktree=excluded.worktree",
                    params![p.name, p.role, p.module, p.display, agent_kind_to_str(p.kind), p.worktree],
                )?;
                let role_group = format!("role:{}", p.role);
                conn.execute(
                    "INSERT OR IGNORE INTO groups (name, description) VALUES (?1, ?2)",
                    params![role_group, format!("All agents with role '{}'", p.role)],
                )?;
                conn.execute(
                    "INSERT INTO group_members (group_name, member_kind, member_value)
                     SELECT ?1, 'role', ?2 WHERE NOT EXISTS (
                        SELECT 1 FROM group_members WHERE group_name = ?1 AND member_value = ?2)",
                    params![role_group, p.role],
                )?;
                conn.execute(
                    "INSERT OR IGNORE INTO groups (name, description) VALUES ('everyone', 'All agents')",
                    [],
                )?;
                conn.execute(
                    "INSERT INTO group_members (group_name, member_kind, member_value)
                     SELECT 'everyone', 'role', '*' WHERE NOT EXISTS (
                        SELECT 1 FROM group_members WHERE group_name = 'everyone' AND member_value = '*')",
                    [],
                )?;
            }
            EventPayload::AgentUpdate(p) => {
                if let Some(intent) = &p.intent {
                    conn.execute(
                        "UPDATE sessions SET current_intent = ?2 WHERE session_id IN (SELECT session_id FROM sessions WHERE agent_name = ?1 AND ended_at IS NULL)",
                        params![p.agent_name, intent],
                    )?;
                }
                if let Some(task) = &p.task {
                    conn.execute(
                        "UPDATE sessions SET current_task = ?2 WHERE session_id IN (SELECT session_id FROM sessions WHERE agent_name = ?1 AND ended_at IS NULL)",
                        params![p.agent_name, task],
                    )?;
                }
                for ctx in merge_contexts_by_session(&p.contexts) {
                    apply_work_context(&conn, &p.agent_name, &ctx)?;
                }
                conn.execute(
                    "UPDATE sessions SET last_heartbeat_at = ?2 WHERE agent_name = ?1 AND ended_at IS NULL",
                    params![p.agent_name, event.timestamp],
                )?;
            }
            EventPayload::AgentCleanup(p) => {
                conn.execute("DELETE FROM agents WHERE name = ?1", params![p.agent_name])?;
            }
            EventPayload::SessionStart(p) => {
                conn.execute(
                    "INSERT OR REPLACE INTO sessions (session_id, agent_name, started_at, last_heartbeat_at) VALUES (?1, ?2, ?3, ?3)",
                    params![p.session_id, p.agent_name, p.started_at],
                )?;
            }
            EventPayload::SessionEnd(p) => {
                conn.execute(
                    "UPDATE sessions SET ended_at = ?2, end_reason = ?3 WHERE session_id = ?1",
                    params![p.session_id, p.ended_at, end_reason_to_str(p.reason)],
                )?;
                conn.execute("DELETE FROM subscriptions WHERE session_id = ?1", params![p.session_id])?;
            }
            EventPayload::GroupCreate(p) => {
                conn.execute(
                    "INSERT OR REPLACE INTO groups (name, description) VALUES (?1, ?2)",
                    params![p.name, p.description],
                )?;
            }
            EventPayload::GroupDelete(p) => {
                conn.execute("DELETE FROM groups WHERE name = ?1", params![p.name])?;
                conn.execute("DELETE FROM group_members WHERE group_name = ?1", params![p.name])?;
            }
            EventPayload::GroupMemberAdd(p) => {
                conn.execute(
                    "INSERT INTO group_members (group_name, member_kind, member_value)
                     SELECT ?1, ?2, ?3 WHERE NOT EXISTS (
                        SELECT 1 FROM group_members WHERE group_name = ?1 AND member_value = ?3)",
                    params![p.group, member_kind_to_str(p.member_kind), p.member_value],
                )?;
            }
            EventPayload::GroupMemberRemove(p) => {
                conn.execute(
                    "DELETE FROM group_members WHERE group_name = ?1 AND member_value = ?2",
                    params![p.group, p.member_value],
                )?;
            }
            EventPayload::Unknown => {}
        }
        Ok(())
    }

    // ---- Reads ----

    pub fn get_agent(&self, name: &str) -> Result<Option<Agent>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT name, role, module, display, kind, worktree FROM agents WHERE name = ?1",
            params![name],
            |row| {
                Ok(Agent {
                    name: row.get(0)?,
                    role: row.get(1)?,
                    module: row.get(2)?,
                    display: row.get(3)?,
                    kind: str_to_agent_kind(&row.get::<_, String>(4)?),
                    worktree: row.get(5)?,
                })
            },
        )
        .optional()
        .map_err(ThrumError::from)
    }

    pub fn list_agents(&self) -> Result<Vec<Agent>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT name, role, module, display, kind, worktree FROM agents ORDER BY name")?;
        let rows = stmt.query_map([], |row| {
            Ok(Agent {
                name: row.get(0)?,
                role: row.get(1)?,
                module: row.get(2)?,
                display: row.get(3)?,
                kind: str_to_agent_kind(&row.get::<_, String>(4)?),
                worktree: row.get(5)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(ThrumError::from)
    }

    pub fn agent_exists(&self, name: &str) -> Result<bool> {
        Ok(self.get_agent(name)?.is_some())
    }

    pub fn role_exists(&self, role: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM agents WHERE role = ?1",
            params![role],
            |r| r.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn group_members(&self, group_name: &str) -> Result<Option<Vec<String>>> {
        let conn = self.conn.lock().unwrap();
        let exists: i64 = conn.query_row(
            "SELECT COUNT(*) FROM groups WHERE name = ?1",
            params![group_name],
            |r| r.get(0),
        )?;
        if exists == 0 {
            return Ok(None);
        }

        let mut roles = Vec::new();
        let mut names = Vec::new();
        {
            let mut stmt = conn.prepare("SELECT member_kind, member_value FROM group_members WHERE group_name = ?1")?;
            let rows = stmt.query_map(params![group_name], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
            })?;
            for row in rows {
                let (kind, value) = row?;
                if kind == "role" {
                    roles.push(value);
                } else {
                    names.push(value);
                }
            }
        }

        let mut members = names;
        for role in roles {
            if role == "*" {
                let mut stmt = conn.prepare("SELECT name FROM agents")?;
                let agent_rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
                for r in agent_rows {
                    members.push(r?);
                }
            } else {
                let mut stmt = conn.prepare("SELECT name FROM agents WHERE role = ?1")?;
                let agent_rows = stmt.query_map(params![role], |r| r.get::<_, String>(0))?;
                for r in agent_rows {
                    members.push(r?);
                }
            }
        }
        members.sort();
        members.dedup();
        Ok(Some(members))
    }

    pub fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT session_id, agent_name, started_at, ended_at, end_reason, current_intent, current_task, last_heartbeat_at
             FROM sessions WHERE session_id = ?1",
            params![session_id],
            row_to_session,
        )
        .optional()
        .map_err(ThrumError::from)
    }

    pub fn list_sessions(&self, active_only: bool) -> Result<Vec<Session>> {
        let conn = self.conn.lock().unwrap();
        let query = if active_only {
            "SELECT session_id, agent_name, started_at, ended_at, end_reason, current_intent, current_task, last_heartbeat_at FROM sessions WHERE ended_at IS NULL ORDER BY started_at"
        } else {
            "SELECT session_id, agent_name, started_at, ended_at, end_reason, current_intent, current_task, last_heartbeat_at FROM sessions ORDER BY started_at"
        };
        let mut stmt = conn.prepare(query)?;
        let rows = stmt.query_map([], row_to_session)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(ThrumError::from)
    }

    /// Sessions marked active whose last heartbeat is older than `threshold`
    /// (ISO-8601 cutoff, inclusive comparison on string timestamps since all
    /// timestamps are ISO-8601 UTC, which sort lexicographically). Used for
    /// crash detection at startup (spec.md §4.6).
    pub fn stale_active_sessions(&self, cutoff_iso: &str) -> Result<Vec<Session>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT session_id, agent_name, started_at, ended_at, end_reason, current_intent, current_task, last_heartbeat_at
             FROM sessions WHERE ended_at IS NULL AND (last_heartbeat_at IS NULL OR last_heartbeat_at < ?1)",
        )?;
        let rows = stmt.query_map(params![cutoff_iso], row_to_session)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(ThrumError::from)
    }

    /// Removes work-context snapshots that have aged out (spec.md §4.6): no
    /// unmerged commits and older than `context_cutoff_iso`, or whose owning
    /// session ended before `session_cutoff_iso`, or that never collected
    /// any Git data at all (no branch, no commits, no changed files). Run at
    /// daemon startup and before each sync pass. Returns the number removed.
    pub fn sweep_stale_work_contexts(&self, context_cutoff_iso: &str, session_cutoff_iso: &str) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT c.session_id, c.context_json, c.extracted_at, s.ended_at
             FROM agent_work_contexts c
             LEFT JOIN sessions s ON s.session_id = c.session_id",
        )?;
        let rows = stmt.query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, Option<String>>(3)?,
            ))
        })?;

        let mut stale_ids = Vec::new();
        for row in rows {
            let (session_id, context_json, extracted_at, ended_at) = row?;
            let ctx: WorkContext = match serde_json::from_str(&context_json) {
                Ok(ctx) => ctx,
                Err(_) => {
                    stale_ids.push(session_id);
                    continue;
                }
            };

            let no_git_data = ctx.branch.is_none() && ctx.unmerged_commits.is_empty() && ctx.changed_files.is_empty();
            let aged_out = !ctx.has_unmerged_commits() && extracted_at.as_str() < context_cutoff_iso;
            let session_long_ended = ended_at.is_some_and(|e| e.as_str() < session_cutoff_iso);

            if no_git_data || aged_out || session_long_ended {
                stale_ids.push(ctx.session_id);
            }
        }

        for session_id in &stale_ids {
            conn.execute(
                "DELETE FROM agent_work_contexts WHERE session_id = ?1",
                params![session_id],
            )?;
        }
        Ok(stale_ids.len())
    }

    pub fn get_message(&self, message_id: &str) -> Result<Option<Message>> {
        let conn = self.conn.lock().unwrap();
        let message = conn
            .query_row(
                "SELECT message_id, thread_id, author_agent_name, session_id, body_format, body_content, body_structured, deleted, delete_reason, created_at, updated_at
                 FROM messages WHERE message_id = ?1",
                params![message_id],
                row_to_message,
            )
            .optional()?;

        let Some(mut message) = message else { return Ok(None) };

        let mut stmt = conn.prepare("SELECT scope_type, scope_value FROM message_scopes WHERE message_id = ?1")?;
        let scopes = stmt.query_map(params![message_id], |r| {
            Ok(Scope { scope_type: r.get(0)?, value: r.get(1)? })
        })?;
        message.scopes = scopes.collect::<rusqlite::Result<Vec<_>>>()?;

        let mut stmt = conn.prepare("SELECT ref_type, ref_value FROM message_refs WHERE message_id = ?1")?;
        let refs = stmt.query_map(params![message_id], |r| {
            Ok(Ref { ref_type: r.get(0)?, value: r.get(1)? })
        })?;
        message.refs = refs.collect::<rusqlite::Result<Vec<_>>>()?;

        let mut stmt = conn.prepare(
            "SELECT content, format, edited_at FROM message_edits WHERE message_id = ?1 ORDER BY seq ASC",
        )?;
        let edits = stmt.query_map(params![message_id], |r| {
            Ok(MessageEdit {
                content: r.get(0)?,
                format: str_to_format(&r.get::<_, String>(1)?),
                edited_at: r.get(2)?,
            })
        })?;
        message.edits = edits.collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(Some(message))
    }

    /// Lists messages addressed to `for_agent` (i.e. where it appears as a
    /// mention ref), excluding messages it authored (self-sends are
    /// filtered at read time, spec.md §4.4), optionally restricted to
    /// unread-by-session.
    pub fn list_messages_for(&self, for_agent: &str, unread_session_id: Option<&str>) -> Result<Vec<Message>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT m.message_id, m.thread_id, m.author_agent_name, m.session_id, m.body_format, m.body_content, m.body_structured, m.deleted, m.delete_reason, m.created_at, m.updated_at
             FROM messages m
             JOIN message_refs r ON r.message_id = m.message_id AND r.ref_type = 'mention'
             WHERE r.ref_value = ?1 AND m.author_agent_name != ?1
             ORDER BY m.created_at",
        )?;
        let rows = stmt.query_map(params![for_agent], row_to_message)?;
        let mut messages = rows.collect::<rusqlite::Result<Vec<_>>>()?;

        if let Some(session_id) = unread_session_id {
            let mut stmt = conn.prepare("SELECT message_id FROM message_reads WHERE session_id = ?1")?;
            let read_ids: std::collections::HashSet<String> = stmt
                .query_map(params![session_id], |r| r.get::<_, String>(0))?
                .collect::<rusqlite::Result<_>>()?;
            messages.retain(|m| !read_ids.contains(&m.message_id));
        }
        Ok(messages)
    }

    pub fn mark_read(&self, message_id: &str, session_id: &str, read_at: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO message_reads (message_id, session_id, read_at) VALUES (?1, ?2, ?3)",
            params![message_id, session_id, read_at],
        )?;
        Ok(())
    }

    pub fn upsert_subscription(&self, sub: &Subscription) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let filter_json = serde_json::to_string(&sub.filter)?;
        conn.execute(
            "INSERT OR REPLACE INTO subscriptions (subscription_id, session_id, filter_json, agent_name, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![sub.subscription_id, sub.session_id, filter_json, sub.agent_name, sub.created_at],
        )?;
        Ok(())
    }

    pub fn remove_subscription(&self, subscription_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM subscriptions WHERE subscription_id = ?1", params![subscription_id])?;
        Ok(())
    }

    pub fn list_subscriptions(&self, session_id: Option<&str>) -> Result<Vec<Subscription>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT subscription_id, session_id, filter_json, agent_name, created_at FROM subscriptions
             WHERE (?1 IS NULL OR session_id = ?1)",
        )?;
        let rows = stmt.query_map(params![session_id], |r| {
            let filter_json: String = r.get(2)?;
            Ok(Subscription {
                subscription_id: r.get(0)?,
                session_id: r.get(1)?,
                filter: serde_json::from_str(&filter_json).unwrap_or(SubscriptionFilter::All),
                agent_name: r.get(3)?,
                created_at: r.get(4)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(ThrumError::from)
    }
}

fn row_to_session(row: &rusqlite::Row) -> rusqlite::Result<Session> {
    Ok(Session {
        session_id: row.get(0)?,
        agent_name: row.get(1)?,
        started_at: row.get(2)?,
        ended_at: row.get(3)?,
        end_reason: row.get::<_, Option<String>>(4)?.map(|s| str_to_end_reason(&s)),
        current_intent: row.get(5)?,
        current_task: row.get(6)?,
        last_heartbeat_at: row.get(7)?,
    })
}

fn row_to_message(row: &rusqlite::Row) -> rusqlite::Result<Message> {
    Ok(Message {
        message_id: row.get(0)?,
        thread_id: row.get(1)?,
        author_agent_name: row.get(2)?,
        session_id: row.get(3)?,
        body: MessageBody {
            format: str_to_format(&row.get::<_, String>(4)?),
            content: row.get(5)?,
            structured: row
                .get::<_, Option<String>>(6)?
                .and_then(|s| serde_json::from_str(&s).ok()),
        },
        scopes: vec![],
        refs: vec![],
        deleted: row.get::<_, i64>(7)? != 0,
        delete_reason: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
        edits: vec![],
    })
}

fn apply_work_context(conn: &Connection, agent_name: &str, ctx: &WorkContext) -> rusqlite::Result<()> {
    let existing_extracted_at: Option<String> = conn
        .query_row(
            "SELECT extracted_at FROM agent_work_contexts WHERE session_id = ?1",
            params![ctx.session_id],
            |r| r.get(0),
        )
        .optional()?;

    if let Some(existing) = existing_extracted_at {
        if existing >= ctx.extracted_at {
            return Ok(());
        }
    }

    let context_json = serde_json::to_string(ctx).unwrap_or_default();
    conn.execute(
        "INSERT OR REPLACE INTO agent_work_contexts (session_id, agent_name, context_json, extracted_at) VALUES (?1, ?2, ?3, ?4)",
        params![ctx.session_id, agent_name, context_json, ctx.extracted_at],
    )?;
    Ok(())
}

/// Reduces a single event payload's own context list by `session_id`,
/// keeping the later `extracted_at` — the intra-event half of the open
/// question resolved in DESIGN.md.
fn merge_contexts_by_session(contexts: &[WorkContext]) -> Vec<WorkContext> {
    let mut by_session: std::collections::HashMap<String, WorkContext> = std::collections::HashMap::new();
    for ctx in contexts {
        by_session
            .entry(ctx.session_id.clone())
            .and_modify(|existing| {
                if ctx.extracted_at > existing.extracted_at {
                    *existing = ctx.clone();
                }
            })
            .or_insert_with(|| ctx.clone());
    }
    by_session.into_values().collect()
}

fn format_to_str(f: MessageFormat) -> &'static str {
    match f {
        MessageFormat::Markdown => "markdown",
        MessageFormat::Plain => "plain",
        MessageFormat::Json => "json",
    }
}

fn str_to_format(s: &str) -> MessageFormat {
    match s {
        "markdown" => MessageFormat::Markdown,
        "json" => MessageFormat::Json,
        _ => MessageFormat::Plain,
    }
}

fn agent_kind_to_str(k: AgentKind) -> &'static str {
    match k {
        AgentKind::Agent => "agent",
        AgentKind::User => "user",
    }
}

fn str_to_agent_kind(s: &str) -> AgentKind {
    if s == "user" {
        AgentKind::User
    } else {
        AgentKind::Agent
    }
}

fn end_reason_to_str(r: EndReason) -> &'static str {
    match r {
        EndReason::Normal => "normal",
        EndReason::Crash => "crash",
    }
}

fn str_to_end_reason(s: &str) -> EndReason {
    if s == "crash" {
        EndReason::Crash
    } else {
        EndReason::Normal
    }
}

fn member_kind_to_str(k: MemberKind) -> &'static str {
    match k {
        MemberKind::Agent => "agent",
        MemberKind::Role => "role",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{AgentRegisterPayload, MessageCreatePayload, SessionStartPayload};
    use crate::model::message::MessageFormat;

    fn register(projection: &Projection, name: &str, role: &str) {
        let event = Event::new(
            EventPayload::AgentRegister(AgentRegisterPayload {
                name: name.into(),
                role: role.into(),
                module: "core".into(),
                display: None,
                kind: AgentKind::Agent,
                worktree: "main".into(),
            }),
            crate::ids::new_event_id(),
            "2026-01-01T00:00:00Z".into(),
        );
        projection.apply(&event).unwrap();
    }

    #[test]
    fn agent_register_is_queryable_after_apply() {
        let p = Projection::open_in_memory().unwrap();
        register(&p, "impl", "implementer");
        assert!(p.agent_exists("impl").unwrap());
        assert!(p.role_exists("implementer").unwrap());
        let members = p.group_members("role:implementer").unwrap().unwrap();
        assert_eq!(members, vec!["impl".to_string()]);
    }

    #[test]
    fn everyone_group_includes_all_agents() {
        let p = Projection::open_in_memory().unwrap();
        register(&p, "coord", "coordinator");
        register(&p, "impl", "implementer");
        let members = p.group_members("everyone").unwrap().unwrap();
        assert_eq!(members, vec!["coord".to_string(), "impl".to_string()]);
    }

    #[test]
    fn message_create_then_edit_then_get_shows_history() {
        let p = Projection::open_in_memory().unwrap();
        register(&p, "coord", "coordinator");

        let create = Event::new(
            EventPayload::MessageCreate(MessageCreatePayload {
                message_id: "msg_1".into(),
                thread_id: None,
                author_agent_name: "coord".into(),
                session_id: "ses_1".into(),
                body: MessageBody { format: MessageFormat::Plain, content: "v1".into(), structured: None },
                scopes: vec![],
                refs: vec![],
            }),
            crate::ids::new_event_id(),
            "2026-01-01T00:00:00Z".into(),
        );
        p.apply(&create).unwrap();

        let edit = Event::new(
            EventPayload::MessageEdit(crate::event::MessageEditPayload {
                message_id: "msg_1".into(),
                body: MessageBody { format: MessageFormat::Plain, content: "v2".into(), structured: None },
                previous: MessageEdit { content: "v1".into(), format: MessageFormat::Plain, edited_at: "2026-01-01T00:01:00Z".into() },
            }),
            crate::ids::new_event_id(),
            "2026-01-01T00:01:00Z".into(),
        );
        p.apply(&edit).unwrap();

        let message = p.get_message("msg_1").unwrap().unwrap();
        assert_eq!(message.body.content, "v2");
        assert_eq!(message.edits.len(), 1);
        assert_eq!(message.edits[0].content, "v1");
    }

    #[test]
    fn clear_empties_every_table() {
        let p = Projection::open_in_memory().unwrap();
        register(&p, "impl", "implementer");
        p.clear().unwrap();
        assert!(!p.agent_exists("impl").unwrap());
        assert_eq!(p.group_members("role:implementer").unwrap(), None);
    }

    #[test]
    fn session_start_then_heartbeat_updates_last_seen() {
        let p = Projection::open_in_memory().unwrap();
        register(&p, "impl", "implementer");
        let start = Event::new(
            EventPayload::SessionStart(SessionStartPayload {
                session_id: "ses_1".into(),
                agent_name: "impl".into(),
                started_at: "2026-01-01T00:00:00Z".into(),
            }),
            crate::ids::new_event_id(),
            "2026-01-01T00:00:00Z".into(),
        );
        p.apply(&start).unwrap();

        let sessions = p.list_sessions(true).unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].last_heartbeat_at.as_deref(), Some("2026-01-01T00:00:00Z"));
    }

    #[test]
    fn self_sends_excluded_from_recipient_inbox() {
        let p = Projection::open_in_memory().unwrap();
        register(&p, "coord", "coordinator");
        let create = Event::new(
            EventPayload::MessageCreate(MessageCreatePayload {
                message_id: "msg_1".into(),
                thread_id: None,
                author_agent_name: "coord".into(),
                session_id: "ses_1".into(),
                body: MessageBody { format: MessageFormat::Plain, content: "note to self".into(), structured: None },
                scopes: vec![],
                refs: vec![Ref::mention("coord")],
            }),
            crate::ids::new_event_id(),
            "2026-01-01T00:00:00Z".into(),
        );
        p.apply(&create).unwrap();
        let inbox = p.list_messages_for("coord", None).unwrap();
        assert!(inbox.is_empty());
    }

    fn apply_context(p: &Projection, agent_name: &str, ctx: WorkContext, at: &str) {
        let event = Event::new(
            EventPayload::AgentUpdate(crate::event::AgentUpdatePayload {
                agent_name: agent_name.into(),
                contexts: vec![ctx],
                intent: None,
                task: None,
            }),
            crate::ids::new_event_id(),
            at.into(),
        );
        p.apply(&event).unwrap();
    }

    #[test]
    fn sweep_removes_context_with_no_git_data() {
        let p = Projection::open_in_memory().unwrap();
        register(&p, "impl", "implementer");
        apply_context(
            &p,
            "impl",
            WorkContext {
                session_id: "ses_1".into(),
                branch: None,
                worktree_path: "/repo".into(),
                unmerged_commits: vec![],
                uncommitted_files: vec![],
                changed_files: vec![],
                extracted_at: "2026-01-01T00:00:00Z".into(),
            },
            "2026-01-01T00:00:00Z",
        );
        let removed = p.sweep_stale_work_contexts("2099-01-01T00:00:00Z", "2099-01-01T00:00:00Z").unwrap();
        assert_eq!(removed, 1);
    }

    #[test]
    fn sweep_keeps_context_with_unmerged_commits() {
        let p = Projection::open_in_memory().unwrap();
        register(&p, "impl", "implementer");
        apply_context(
            &p,
            "impl",
            WorkContext {
                session_id: "ses_1".into(),
                branch: Some("main".into()),
                worktree_path: "/repo".into(),
                unmerged_commits: vec![crate::model::work_context::CommitSummary {
                    sha: "abc123".into(),
                    message_first_line: "wip".into(),
                    touched_files: vec!["src/lib.rs".into()],
                }],
                uncommitted_files: vec![],
                changed_files: vec!["src/lib.rs".into()],
                extracted_at: "2020-01-01T00:00:00Z".into(),
            },
            "2020-01-01T00:00:00Z",
        );
        let removed = p.sweep_stale_work_contexts("2099-01-01T00:00:00Z", "2000-01-01T00:00:00Z").unwrap();
        assert_eq!(removed, 0);
    }

    #[test]
    fn stale_active_sessions_finds_only_sessions_past_the_cutoff() {
        let p = Projection::open_in_memory().unwrap();
        register(&p, "impl", "implementer");
        register(&p, "coord", "coordinator");
        let stale_start = Event::new(
            EventPayload::SessionStart(SessionStartPayload {
                session_id: "ses_stale".into(),
                agent_name: "impl".into(),
                started_at: "2020-01-01T00:00:00Z".into(),
            }),
            crate::ids::new_event_id(),
            "2020-01-01T00:00:00Z".into(),
        );
        let fresh_start = Event::new(
            EventPayload::SessionStart(SessionStartPayload {
                session_id: "ses_fresh".into(),
                agent_name: "coord".into(),
                started_at: "2026-01-01T00:00:00Z".into(),
            }),
            crate::ids::new_event_id(),
            "2026-01-01T00:00:00Z".into(),
        );
        p.apply(&stale_start).unwrap();
        p.apply(&fresh_start).unwrap();

        let stale = p.stale_active_sessions("2025-01-01T00:00:00Z").unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].session_id, "ses_stale");
    }
}
