//! The method registry (spec.md §4.3 "Registered methods"). Each handler
//! takes the shared [`DaemonState`], the calling [`ConnectionContext`], and
//! raw `params`, and returns a JSON `result` or a [`ThrumError`].

use crate::rpc::{ConnectionContext, Transport};
use crate::session;
use crate::subscriptions::MatchInput;
use crate::sync::engine;
use crate::DaemonState;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use thrum_core::addressing::{resolve_recipients, scan_mentions};
use thrum_core::error::{Result, ThrumError};
use thrum_core::event::{
    AgentCleanupPayload, AgentRegisterPayload, EventPayload, MessageCreatePayload, MessageDeletePayload,
    MessageEditPayload,
};
use thrum_core::ids;
use thrum_core::model::agent::AgentKind;
use thrum_core::model::message::{MessageBody, MessageEdit};
use thrum_core::model::scope::{Ref, Scope};
use thrum_core::model::session::EndReason;
use thrum_core::model::subscription::{Subscription, SubscriptionFilter};
use thrum_core::model::{is_valid_name, RESERVED_NAMES};

const METHODS: &[&str] = &[
    "health",
    "agent.register",
    "agent.list",
    "agent.whoami",
    "agent.listContext",
    "agent.delete",
    "agent.cleanup",
    "session.start",
    "session.end",
    "session.list",
    "session.heartbeat",
    "session.setIntent",
    "session.setTask",
    "message.send",
    "message.get",
    "message.list",
    "message.edit",
    "message.delete",
    "message.markRead",
    "subscribe",
    "unsubscribe",
    "subscriptions.list",
    "sync.force",
    "sync.status",
    "user.register",
    "user.identify",
];

pub fn is_registered(method: &str) -> bool {
    METHODS.contains(&method)
}

/// Unix-only and WebSocket-only method gating (spec.md §4.3).
pub fn allowed_on_transport(method: &str, transport: Transport) -> bool {
    match method {
        "agent.delete" | "agent.cleanup" => transport == Transport::Unix,
        "user.register" => transport == Transport::WebSocket,
        _ => true,
    }
}

pub async fn dispatch_method(
    state: &Arc<DaemonState>,
    ctx: &Arc<ConnectionContext>,
    method: &str,
    params: Value,
) -> Result<Value> {
    match method {
        "health" => health(state),
        "agent.register" => agent_register(state, params, AgentKind::Agent),
        "agent.list" => agent_list(state),
        "agent.whoami" => agent_whoami(state, params),
        "agent.listContext" => agent_list_context(state, params),
        "agent.delete" => agent_delete(state, params),
        "agent.cleanup" => agent_cleanup(state, params),
        "session.start" => session_start(state, ctx, params).await,
        "session.end" => session_end(state, ctx, params).await,
        "session.list" => session_list(state, params),
        "session.heartbeat" => session_heartbeat(state, params).await,
        "session.setIntent" => session_set_intent(state, params),
        "session.setTask" => session_set_task(state, params),
        "message.send" => message_send(state, params),
        "message.get" => message_get(state, params),
        "message.list" => message_list(state, params),
        "message.edit" => message_edit(state, params),
        "message.delete" => message_delete(state, params),
        "message.markRead" => message_mark_read(state, params),
        "subscribe" => subscribe(state, params),
        "unsubscribe" => unsubscribe(state, params),
        "subscriptions.list" => subscriptions_list(state, params),
        "sync.force" => sync_force(state),
        "sync.status" => sync_status(state),
        "user.register" => agent_register(state, params, AgentKind::User),
        "user.identify" => user_identify(state, ctx, params),
        other => Err(ThrumError::MethodNotFound(other.to_string())),
    }
}

fn param<T: for<'de> Deserialize<'de>>(params: &Value) -> Result<T> {
    serde_json::from_value(params.clone()).map_err(|e| ThrumError::InvalidParams(e.to_string()))
}

// ---- health ----

fn health(state: &Arc<DaemonState>) -> Result<Value> {
    let uptime = chrono::Utc::now()
        .signed_duration_since(
            chrono::DateTime::parse_from_rfc3339(&state.started_at)
                .unwrap_or_else(|_| chrono::Utc::now().into()),
        )
        .num_seconds()
        .max(0);
    let stats = state.sync_stats.lock().unwrap().clone();
    Ok(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "repo_id": state.repo_id,
        "uptime_seconds": uptime,
        "sync": {
            "local_only": state.is_local_only(),
            "last_pass_at": stats.last_pass_at,
        },
    }))
}

// ---- agent.* ----

#[derive(Deserialize)]
struct AgentRegisterParams {
    name: String,
    role: String,
    module: String,
    #[serde(default)]
    display: Option<String>,
    #[serde(default)]
    worktree: Option<String>,
}

fn agent_register(state: &Arc<DaemonState>, params: Value, kind: AgentKind) -> Result<Value> {
    let p: AgentRegisterParams = param(&params)?;

    if !is_valid_name(&p.name) {
        return Err(ThrumError::InvalidParams(format!(
            "agent name '{}' must match [a-z0-9_]+",
            p.name
        )));
    }
    if RESERVED_NAMES.contains(&p.name.as_str()) {
        return Err(ThrumError::NameConflict(format!("'{}' is a reserved name", p.name)));
    }
    if p.name == p.role {
        return Err(ThrumError::NameConflict(format!("agent name cannot equal its own role '{}'", p.role)));
    }
    if state.projection.role_exists(&p.name)? {
        return Err(ThrumError::NameConflict(format!("'{}' is already in use as a role", p.name)));
    }

    let worktree = p.worktree.unwrap_or_else(|| "main".to_string());
    let existing = state.projection.get_agent(&p.name)?;
    if let Some(existing) = &existing {
        let unchanged = existing.role == p.role
            && existing.module == p.module
            && existing.display == p.display
            && existing.kind == kind
            && existing.worktree == worktree;
        if unchanged {
            return Ok(serde_json::to_value(existing).unwrap());
        }
    }

    state.event_store.write_event(EventPayload::AgentRegister(AgentRegisterPayload {
        name: p.name.clone(),
        role: p.role,
        module: p.module,
        display: p.display,
        kind,
        worktree,
    }))?;

    let agent = state
        .projection
        .get_agent(&p.name)?
        .ok_or_else(|| ThrumError::Internal("agent missing from projection immediately after register".into()))?;
    Ok(serde_json::to_value(agent).unwrap())
}

fn agent_list(state: &Arc<DaemonState>) -> Result<Value> {
    Ok(serde_json::to_value(state.projection.list_agents()?).unwrap())
}

#[derive(Deserialize)]
struct NameParams {
    name: String,
}

fn agent_whoami(state: &Arc<DaemonState>, params: Value) -> Result<Value> {
    let p: NameParams = param(&params)?;
    let agent = state.projection.get_agent(&p.name)?.ok_or_else(|| ThrumError::not_found("agent", &p.name))?;
    Ok(serde_json::to_value(agent).unwrap())
}

fn agent_list_context(state: &Arc<DaemonState>, params: Value) -> Result<Value> {
    let p: NameParams = param(&params)?;
    let preamble_path = state.layout.context_dir.join(format!("{}_preamble.md", p.name));
    let context_path = state.layout.context_dir.join(format!("{}.md", p.name));
    let preamble = std::fs::read_to_string(&preamble_path).unwrap_or_default();
    let context = std::fs::read_to_string(&context_path).unwrap_or_default();
    Ok(json!({ "preamble": preamble, "context": context }))
}

fn agent_delete(state: &Arc<DaemonState>, params: Value) -> Result<Value> {
    let p: NameParams = param(&params)?;
    state
        .projection
        .get_agent(&p.name)?
        .ok_or_else(|| ThrumError::not_found("agent", &p.name))?;

    state.event_store.write_event(EventPayload::AgentCleanup(AgentCleanupPayload { agent_name: p.name.clone() }))?;

    let _ = std::fs::remove_file(state.layout.identities_dir.join(format!("{}.json", p.name)));
    let _ = std::fs::remove_file(state.layout.sync_dir.join("messages").join(format!("{}.jsonl", p.name)));
    let _ = std::fs::remove_file(state.layout.context_dir.join(format!("{}.md", p.name)));
    let _ = std::fs::remove_file(state.layout.context_dir.join(format!("{}_preamble.md", p.name)));

    Ok(json!({ "deleted": p.name }))
}

fn agent_cleanup(state: &Arc<DaemonState>, params: Value) -> Result<Value> {
    let p: NameParams = param(&params)?;
    state.event_store.write_event(EventPayload::AgentCleanup(AgentCleanupPayload { agent_name: p.name.clone() }))?;
    Ok(json!({ "cleaned_up": p.name }))
}

// ---- session.* ----

#[derive(Deserialize)]
struct SessionStartParams {
    agent_name: String,
    worktree_path: String,
}

async fn session_start(state: &Arc<DaemonState>, ctx: &Arc<ConnectionContext>, params: Value) -> Result<Value> {
    let p: SessionStartParams = param(&params)?;
    state
        .projection
        .get_agent(&p.agent_name)?
        .ok_or_else(|| ThrumError::not_found("agent", &p.agent_name))?;

    let active = state
        .projection
        .list_sessions(true)?
        .into_iter()
        .any(|s| s.agent_name == p.agent_name);
    if active {
        return Err(ThrumError::NameConflict(format!("agent '{}' already has an active session", p.agent_name)));
    }

    let session_id = ids::new_session_id();
    session::start_session(state, &p.agent_name, &session_id, &PathBuf::from(&p.worktree_path)).await?;
    ctx.bind_session(&session_id);
    state.connections.bind(&session_id, ctx.outbound.clone(), ctx.close.clone());

    Ok(json!({ "session_id": session_id }))
}

#[derive(Deserialize)]
struct SessionIdParams {
    session_id: String,
}

async fn session_end(state: &Arc<DaemonState>, ctx: &Arc<ConnectionContext>, params: Value) -> Result<Value> {
    let p: SessionIdParams = param(&params)?;
    let session = state
        .projection
        .get_session(&p.session_id)?
        .ok_or_else(|| ThrumError::not_found("session", &p.session_id))?;
    session::end_session(state, &p.session_id, &session.agent_name, EndReason::Normal).await?;
    if ctx.bound_session_id().as_deref() == Some(p.session_id.as_str()) {
        *ctx.bound_session.lock().unwrap() = None;
    }
    Ok(json!({ "ended": p.session_id }))
}

#[derive(Deserialize, Default)]
struct SessionListParams {
    #[serde(default)]
    state: Option<String>,
}

fn session_list(state: &Arc<DaemonState>, params: Value) -> Result<Value> {
    let p: SessionListParams = if params.is_null() { Default::default() } else { param(&params)? };
    let active_only = p.state.as_deref() == Some("active");
    Ok(serde_json::to_value(state.projection.list_sessions(active_only)?).unwrap())
}

async fn session_heartbeat(state: &Arc<DaemonState>, params: Value) -> Result<Value> {
    let p: SessionIdParams = param(&params)?;
    let ctx = session::heartbeat(state, &p.session_id).await?;
    Ok(serde_json::to_value(ctx).unwrap())
}

#[derive(Deserialize)]
struct SetTextParams {
    session_id: String,
    text: String,
}

fn session_set_intent(state: &Arc<DaemonState>, params: Value) -> Result<Value> {
    let p: SetTextParams = param(&params)?;
    let session = state.projection.get_session(&p.session_id)?.ok_or_else(|| ThrumError::not_found("session", &p.session_id))?;
    state.event_store.write_event(EventPayload::AgentUpdate(thrum_core::event::AgentUpdatePayload {
        agent_name: session.agent_name.clone(),
        contexts: vec![],
        intent: Some(p.text.clone()),
        task: None,
    }))?;
    session::write_identity_intent(state, &session.agent_name, &p.text);
    Ok(json!({ "intent": p.text }))
}

fn session_set_task(state: &Arc<DaemonState>, params: Value) -> Result<Value> {
    let p: SetTextParams = param(&params)?;
    let session = state.projection.get_session(&p.session_id)?.ok_or_else(|| ThrumError::not_found("session", &p.session_id))?;
    state.event_store.write_event(EventPayload::AgentUpdate(thrum_core::event::AgentUpdatePayload {
        agent_name: session.agent_name.clone(),
        contexts: vec![],
        intent: None,
        task: Some(p.text.clone()),
    }))?;
    session::touch_identity(state, &session.agent_name);
    Ok(json!({ "task": p.text }))
}

// ---- message.* ----

#[derive(Deserialize)]
struct MessageSendParams {
    session_id: String,
    to: Vec<String>,
    body: MessageBody,
    #[serde(default)]
    thread_id: Option<String>,
    #[serde(default)]
    scopes: Vec<Scope>,
}

fn message_send(state: &Arc<DaemonState>, params: Value) -> Result<Value> {
    let p: MessageSendParams = param(&params)?;
    let session = state
        .projection
        .get_session(&p.session_id)?
        .ok_or_else(|| ThrumError::not_found("session", &p.session_id))?;

    let audience = resolve_recipients(&p.to, state.as_ref())?;
    let implicit = scan_mentions(&p.body.content, state.as_ref());

    let mut refs = audience.refs.clone();
    for r in implicit.refs {
        if !refs.iter().any(|existing| existing.value == r.value) {
            refs.push(r);
        }
    }

    let message_id = ids::new_message_id();
    let event = state.event_store.write_event(EventPayload::MessageCreate(MessageCreatePayload {
        message_id: message_id.clone(),
        thread_id: p.thread_id,
        author_agent_name: session.agent_name.clone(),
        session_id: p.session_id.clone(),
        body: p.body,
        scopes: p.scopes.clone(),
        refs: refs.clone(),
    }))?;

    dispatch_notifications(state, &message_id, &event.timestamp, &session.agent_name, &p.scopes, &refs);

    let delivered_to: Vec<String> = audience.agent_names.iter().filter(|a| a.as_str() != session.agent_name).cloned().collect();
    Ok(json!({
        "message_id": message_id,
        "delivered_to": delivered_to,
        "warnings": audience.warnings,
    }))
}

fn dispatch_notifications(
    state: &Arc<DaemonState>,
    message_id: &str,
    timestamp: &str,
    author_name: &str,
    scopes: &[Scope],
    refs: &[Ref],
) {
    let mention_values: Vec<String> = refs.iter().filter(|r| r.is_mention()).map(|r| r.value.clone()).collect();
    let matched = state.subscriptions.matching(&MatchInput { scopes, mention_values: &mention_values });
    if matched.is_empty() {
        return;
    }

    let author = state.projection.get_agent(author_name).ok().flatten();
    let preview: String = {
        let message = state.projection.get_message(message_id).ok().flatten();
        message
            .map(|m| m.body.content.chars().take(100).collect())
            .unwrap_or_default()
    };

    for m in matched {
        let payload = json!({
            "message_id": message_id,
            "author": {
                "agent_id": author_name,
                "name": author_name,
                "role": author.as_ref().map(|a| a.role.clone()),
                "module": author.as_ref().map(|a| a.module.clone()),
            },
            "preview": preview,
            "scopes": scopes,
            "matched_subscription": { "subscription_id": m.subscription_id, "match_type": m.match_type.as_str() },
            "timestamp": timestamp,
        });
        let notification = crate::rpc::RpcNotification::new("notification.message", payload);
        state.connections.try_send(&m.session_id, notification.to_line());
    }
}

#[derive(Deserialize)]
struct MessageIdParams {
    message_id: String,
}

fn message_get(state: &Arc<DaemonState>, params: Value) -> Result<Value> {
    let p: MessageIdParams = param(&params)?;
    let message = state.projection.get_message(&p.message_id)?.ok_or_else(|| ThrumError::not_found("message", &p.message_id))?;
    Ok(serde_json::to_value(message).unwrap())
}

fn message_list(state: &Arc<DaemonState>, params: Value) -> Result<Value> {
    if let Some(all) = params.get("all") {
        if all.as_bool() == Some(true) {
            return Err(ThrumError::InvalidParams("the 'all' flag is no longer supported".into()));
        }
    }
    let for_agent = params
        .get("for")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ThrumError::InvalidParams("missing required field 'for'".into()))?;
    let unread = params.get("unread").and_then(|v| v.as_bool()).unwrap_or(false);
    let session_id = params.get("session_id").and_then(|v| v.as_str());

    let unread_session = if unread { session_id } else { None };
    let messages = state.projection.list_messages_for(for_agent, unread_session)?;
    Ok(serde_json::to_value(messages).unwrap())
}

#[derive(Deserialize)]
struct MessageEditParams {
    message_id: String,
    session_id: String,
    body: MessageBody,
}

fn message_edit(state: &Arc<DaemonState>, params: Value) -> Result<Value> {
    let p: MessageEditParams = param(&params)?;
    let session = state.projection.get_session(&p.session_id)?.ok_or_else(|| ThrumError::not_found("session", &p.session_id))?;
    let existing = state.projection.get_message(&p.message_id)?.ok_or_else(|| ThrumError::not_found("message", &p.message_id))?;
    if existing.author_agent_name != session.agent_name {
        return Err(ThrumError::PermissionDenied(format!("only the author may edit message {}", p.message_id)));
    }

    let event = state.event_store.write_event(EventPayload::MessageEdit(MessageEditPayload {
        message_id: p.message_id.clone(),
        body: p.body,
        previous: MessageEdit {
            content: existing.body.content,
            format: existing.body.format,
            edited_at: chrono::Utc::now().to_rfc3339(),
        },
    }))?;

    dispatch_notifications(state, &p.message_id, &event.timestamp, &session.agent_name, &existing.scopes, &existing.refs);

    Ok(json!({ "message_id": p.message_id }))
}

#[derive(Deserialize)]
struct MessageDeleteParams {
    message_id: String,
    session_id: String,
    #[serde(default)]
    delete_reason: Option<String>,
}

fn message_delete(state: &Arc<DaemonState>, params: Value) -> Result<Value> {
    let p: MessageDeleteParams = param(&params)?;
    let session = state.projection.get_session(&p.session_id)?.ok_or_else(|| ThrumError::not_found("session", &p.session_id))?;
    let existing = state.projection.get_message(&p.message_id)?.ok_or_else(|| ThrumError::not_found("message", &p.message_id))?;
    if existing.author_agent_name != session.agent_name {
        return Err(ThrumError::PermissionDenied(format!("only the author may delete message {}", p.message_id)));
    }

    state.event_store.write_event(EventPayload::MessageDelete(MessageDeletePayload {
        message_id: p.message_id.clone(),
        delete_reason: p.delete_reason,
    }))?;
    Ok(json!({ "message_id": p.message_id }))
}

#[derive(Deserialize)]
struct MarkReadParams {
    message_id: String,
    session_id: String,
}

fn message_mark_read(state: &Arc<DaemonState>, params: Value) -> Result<Value> {
    let p: MarkReadParams = param(&params)?;
    state.projection.mark_read(&p.message_id, &p.session_id, &chrono::Utc::now().to_rfc3339())?;
    Ok(json!({ "marked": p.message_id }))
}

// ---- subscribe / unsubscribe ----

#[derive(Deserialize)]
struct SubscribeParams {
    session_id: String,
    filter: SubscriptionFilter,
}

fn subscribe(state: &Arc<DaemonState>, params: Value) -> Result<Value> {
    let p: SubscribeParams = param(&params)?;
    let subscription = Subscription {
        subscription_id: ids::new_subscription_id(),
        session_id: p.session_id,
        filter: p.filter,
        agent_name: None,
        created_at: chrono::Utc::now().to_rfc3339(),
    };
    state.projection.upsert_subscription(&subscription)?;
    state.subscriptions.insert(subscription.clone());
    Ok(json!({ "subscription_id": subscription.subscription_id }))
}

#[derive(Deserialize)]
struct SubscriptionIdParams {
    subscription_id: String,
}

fn unsubscribe(state: &Arc<DaemonState>, params: Value) -> Result<Value> {
    let p: SubscriptionIdParams = param(&params)?;
    state.projection.remove_subscription(&p.subscription_id)?;
    state.subscriptions.remove(&p.subscription_id);
    Ok(json!({ "unsubscribed": p.subscription_id }))
}

fn subscriptions_list(state: &Arc<DaemonState>, params: Value) -> Result<Value> {
    let session_id = params.get("session_id").and_then(|v| v.as_str());
    Ok(serde_json::to_value(state.projection.list_subscriptions(session_id)?).unwrap())
}

// ---- sync.* ----

fn sync_force(state: &Arc<DaemonState>) -> Result<Value> {
    let state = Arc::clone(state);
    tokio::spawn(async move {
        // `force=true`: run even if the breaker is open, so a forced sync
        // can itself be the thing that proves the remote is healthy again.
        if let Err(e) = engine::run_once(&state, true).await {
            tracing::warn!(error = %e, "forced sync pass failed");
        }
    });
    Ok(json!({ "status": "scheduled" }))
}

fn sync_status(state: &Arc<DaemonState>) -> Result<Value> {
    let stats = state.sync_stats.lock().unwrap().clone();
    Ok(json!({ "local_only": state.is_local_only(), "stats": stats }))
}

// ---- user.identify ----

#[derive(Deserialize)]
struct IdentifyParams {
    session_id: String,
}

fn user_identify(state: &Arc<DaemonState>, ctx: &Arc<ConnectionContext>, params: Value) -> Result<Value> {
    let p: IdentifyParams = param(&params)?;
    state
        .projection
        .get_session(&p.session_id)?
        .ok_or_else(|| ThrumError::not_found("session", &p.session_id))?;
    ctx.bind_session(&p.session_id);
    state.connections.bind(&p.session_id, ctx.outbound.clone(), ctx.close.clone());
    Ok(json!({ "bound": p.session_id }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_matches_spec_method_list() {
        assert!(is_registered("message.send"));
        assert!(is_registered("sync.status"));
        assert!(!is_registered("message.unsend"));
    }

    #[test]
    fn agent_delete_is_unix_only() {
        assert!(allowed_on_transport("agent.delete", Transport::Unix));
        assert!(!allowed_on_transport("agent.delete", Transport::WebSocket));
    }

    #[test]
    fn user_register_is_websocket_only() {
        assert!(allowed_on_transport("user.register", Transport::WebSocket));
        assert!(!allowed_on_transport("user.register", Transport::Unix));
    }
}
