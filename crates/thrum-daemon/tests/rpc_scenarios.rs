//! End-to-end RPC scenarios, driven in-process through
//! [`thrum_daemon::rpc::handle_line`] against a real [`DaemonState`]
//! (in-memory projection, tempdir event log, local-only sync). These cover
//! spec.md §8's literal scenarios S1 (basic send/receive), S2 (unknown
//! recipient atomicity), S3 (role routing warnings) and S6 (edit history).

use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use thrum_core::config::ThrumConfig;
use thrum_core::event_store::EventStore;
use thrum_core::projection::Projection;
use thrum_daemon::rpc::{self, ConnectionContext, Transport};
use thrum_daemon::{DaemonState, Layout};
use tokio::sync::mpsc;

fn build_state(tmp: &TempDir) -> Arc<DaemonState> {
    let layout = Layout::new(tmp.path().join("thrum"));
    layout.ensure_dirs().unwrap();
    let projection = Arc::new(Projection::open_in_memory().unwrap());
    let event_store = EventStore::new(layout.sync_dir.clone(), projection.clone());
    Arc::new(DaemonState::new(
        "r_test".into(),
        tmp.path().to_path_buf(),
        layout,
        ThrumConfig::default(),
        true,
        event_store,
        projection,
    ))
}

fn connection() -> (Arc<ConnectionContext>, mpsc::Receiver<String>) {
    let (tx, rx) = mpsc::channel(256);
    (Arc::new(ConnectionContext::new(Transport::WebSocket, tx)), rx)
}

async fn call(state: &Arc<DaemonState>, ctx: &Arc<ConnectionContext>, method: &str, params: Value) -> Value {
    let request = json!({"jsonrpc": "2.0", "method": method, "params": params, "id": 1});
    let line = rpc::handle_line(state, ctx, &request.to_string()).await.unwrap();
    serde_json::from_str(&line).unwrap()
}

async fn call_ok(state: &Arc<DaemonState>, ctx: &Arc<ConnectionContext>, method: &str, params: Value) -> Value {
    let response = call(state, ctx, method, params).await;
    assert!(response.get("error").is_none(), "{method} returned an error: {response}");
    response["result"].clone()
}

async fn register_agent(state: &Arc<DaemonState>, ctx: &Arc<ConnectionContext>, name: &str, role: &str) {
    call_ok(
        state,
        ctx,
        "agent.register",
        json!({"name": name, "role": role, "module": "core"}),
    )
    .await;
}

async fn start_session(state: &Arc<DaemonState>, ctx: &Arc<ConnectionContext>, agent_name: &str, worktree: &str) -> String {
    let result = call_ok(
        state,
        ctx,
        "session.start",
        json!({"agent_name": agent_name, "worktree_path": worktree}),
    )
    .await;
    result["session_id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn s1_basic_send_and_receive() {
    let tmp = TempDir::new().unwrap();
    let state = build_state(&tmp);

    let (coord_ctx, _coord_rx) = connection();
    let (impl_ctx, mut impl_rx) = connection();

    register_agent(&state, &coord_ctx, "coord", "coordinator").await;
    register_agent(&state, &impl_ctx, "impl", "implementer").await;

    let coord_session = start_session(&state, &coord_ctx, "coord", tmp.path().to_str().unwrap()).await;
    let impl_session = start_session(&state, &impl_ctx, "impl", tmp.path().to_str().unwrap()).await;

    call_ok(
        &state,
        &impl_ctx,
        "subscribe",
        json!({"session_id": impl_session, "filter": {"kind": "mention", "value": "impl"}}),
    )
    .await;

    let send_result = call_ok(
        &state,
        &coord_ctx,
        "message.send",
        json!({
            "session_id": coord_session,
            "to": ["@impl"],
            "body": {"format": "plain", "content": "hello"},
        }),
    )
    .await;

    let message_id = send_result["message_id"].as_str().unwrap().to_string();
    assert_eq!(send_result["delivered_to"], json!(["impl"]));
    assert!(send_result["warnings"].as_array().unwrap().is_empty());

    let notification_line = tokio::time::timeout(std::time::Duration::from_secs(1), impl_rx.recv())
        .await
        .expect("notification did not arrive within 1s")
        .expect("notification channel closed");
    let notification: Value = serde_json::from_str(&notification_line).unwrap();
    assert_eq!(notification["method"], "notification.message");
    assert_eq!(notification["params"]["message_id"], json!(message_id));
    assert_eq!(notification["params"]["preview"], json!("hello"));
    assert_eq!(notification["params"]["matched_subscription"]["match_type"], json!("mention"));

    let listed = call_ok(
        &state,
        &impl_ctx,
        "message.list",
        json!({"for": "impl", "unread": true, "session_id": impl_session}),
    )
    .await;
    let listed = listed.as_array().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["message_id"], json!(message_id));
}

#[tokio::test]
async fn s2_unknown_recipient_is_rejected_atomically() {
    let tmp = TempDir::new().unwrap();
    let state = build_state(&tmp);

    let (coord_ctx, _rx) = connection();
    let (impl_ctx, _impl_rx) = connection();
    register_agent(&state, &coord_ctx, "coord", "coordinator").await;
    register_agent(&state, &impl_ctx, "impl", "implementer").await;
    let coord_session = start_session(&state, &coord_ctx, "coord", tmp.path().to_str().unwrap()).await;

    let response = call(
        &state,
        &coord_ctx,
        "message.send",
        json!({
            "session_id": coord_session,
            "to": ["@impl", "@ghost"],
            "body": {"format": "plain", "content": "x"},
        }),
    )
    .await;

    let error = response["error"].clone();
    assert_eq!(error["data"]["kind"], json!("unknown_recipient"));
    assert_eq!(error["data"]["detail"], json!(["ghost"]));

    let listed = call_ok(&state, &impl_ctx, "message.list", json!({"for": "impl"})).await;
    assert!(listed.as_array().unwrap().is_empty());

    let shard = state.layout.sync_dir.join("messages").join("coord.jsonl");
    let line_count = std::fs::read_to_string(&shard).map(|s| s.lines().count()).unwrap_or(0);
    assert_eq!(line_count, 0, "no event should have been written for a rejected send");
}

#[tokio::test]
async fn s3_role_routing_warns_but_everyone_never_does() {
    let tmp = TempDir::new().unwrap();
    let state = build_state(&tmp);

    let (coord_ctx, _rx) = connection();
    let (impl_ctx, _impl_rx) = connection();
    register_agent(&state, &coord_ctx, "coord", "coordinator").await;
    register_agent(&state, &impl_ctx, "impl", "implementer").await;
    let coord_session = start_session(&state, &coord_ctx, "coord", tmp.path().to_str().unwrap()).await;

    let by_role = call_ok(
        &state,
        &coord_ctx,
        "message.send",
        json!({"session_id": coord_session, "to": ["@implementer"], "body": {"format": "plain", "content": "a"}}),
    )
    .await;
    assert_eq!(by_role["delivered_to"], json!(["impl"]));
    let warnings = by_role["warnings"].as_array().unwrap();
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].as_str().unwrap().contains("implementer"));

    let to_everyone = call_ok(
        &state,
        &coord_ctx,
        "message.send",
        json!({"session_id": coord_session, "to": ["@everyone"], "body": {"format": "plain", "content": "b"}}),
    )
    .await;
    assert!(to_everyone["warnings"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn s6_edit_history_is_chronological() {
    let tmp = TempDir::new().unwrap();
    let state = build_state(&tmp);

    let (coord_ctx, _rx) = connection();
    register_agent(&state, &coord_ctx, "coord", "coordinator").await;
    let coord_session = start_session(&state, &coord_ctx, "coord", tmp.path().to_str().unwrap()).await;

    let sent = call_ok(
        &state,
        &coord_ctx,
        "message.send",
        json!({"session_id": coord_session, "to": [], "body": {"format": "plain", "content": "v1"}}),
    )
    .await;
    let message_id = sent["message_id"].as_str().unwrap().to_string();

    for content in ["v2", "v3"] {
        call_ok(
            &state,
            &coord_ctx,
            "message.edit",
            json!({"message_id": message_id, "session_id": coord_session, "body": {"format": "plain", "content": content}}),
        )
        .await;
    }

    let fetched = call_ok(&state, &coord_ctx, "message.get", json!({"message_id": message_id})).await;
    assert_eq!(fetched["body"]["content"], json!("v3"));
    let edits = fetched["edits"].as_array().unwrap();
    assert_eq!(edits.len(), 2);
    assert_eq!(edits[0]["content"], json!("v1"));
    assert_eq!(edits[1]["content"], json!("v2"));
}

#[tokio::test]
async fn legacy_all_flag_on_message_list_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let state = build_state(&tmp);
    let (ctx, _rx) = connection();

    let response = call(&state, &ctx, "message.list", json!({"for": "impl", "all": true})).await;
    assert_eq!(response["error"]["data"]["kind"], json!("invalid_params"));
}
