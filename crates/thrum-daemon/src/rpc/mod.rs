//! RPC Dispatch (C3, spec.md §4.3): one method registry served over both
//! transports, using a single JSON-RPC 2.0 request/response/notification
//! shape.

pub mod error;
pub mod methods;

use crate::connections::Outbound;
use crate::DaemonState;
use error::{invalid_request, method_not_found, to_rpc_error};
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thrum_core::error::ThrumError;
use tokio_util::sync::CancellationToken;

/// Per-request deadline (spec.md §4.3 "Timeouts (mandatory)... per-request 10s").
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Transport handshake deadline.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Unix,
    WebSocket,
}

#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub id: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct RpcResponse {
    pub jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<error::RpcErrorBody>,
    pub id: Option<Value>,
}

impl RpcResponse {
    fn ok(id: Option<Value>, result: Value) -> Self {
        RpcResponse { jsonrpc: "2.0", result: Some(result), error: None, id }
    }

    fn err(id: Option<Value>, error: error::RpcErrorBody) -> Self {
        RpcResponse { jsonrpc: "2.0", result: None, error: Some(error), id }
    }
}

/// A server-to-client push (spec.md §4.5). Carries no `id`, per JSON-RPC
/// notification convention.
#[derive(Debug, Serialize)]
pub struct RpcNotification {
    pub jsonrpc: &'static str,
    pub method: &'static str,
    pub params: Value,
}

impl RpcNotification {
    pub fn new(method: &'static str, params: Value) -> Self {
        RpcNotification { jsonrpc: "2.0", method, params }
    }

    pub fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Per-connection state dispatch needs: which transport it arrived on (to
/// gate transport-restricted methods), its outbound queue (so
/// `session.start`/`user.identify` can bind the session to it), and which
/// session, if any, is currently bound.
pub struct ConnectionContext {
    pub transport: Transport,
    pub outbound: Outbound,
    pub bound_session: Mutex<Option<String>>,
    /// Cancelled by [`crate::connections::Connections::try_send`] when this
    /// connection's outbound queue overflows; the transport's read/write
    /// loop watches it to tear the connection down (spec.md §8).
    pub close: CancellationToken,
}

impl ConnectionContext {
    pub fn new(transport: Transport, outbound: Outbound) -> Self {
        ConnectionContext { transport, outbound, bound_session: Mutex::new(None), close: CancellationToken::new() }
    }

    pub fn bound_session_id(&self) -> Option<String> {
        self.bound_session.lock().unwrap().clone()
    }

    pub fn bind_session(&self, session_id: &str) {
        *self.bound_session.lock().unwrap() = Some(session_id.to_string());
    }
}

/// Parses one line of input, dispatches it, and returns the response line
/// to write back — the single entry point both transports call into.
#[tracing::instrument(skip(state, ctx, raw), fields(transport = ?ctx.transport))]
pub async fn handle_line(state: &Arc<DaemonState>, ctx: &Arc<ConnectionContext>, raw: &str) -> Option<String> {
    let request: RpcRequest = match serde_json::from_str(raw) {
        Ok(r) => r,
        Err(e) => {
            let response = RpcResponse::err(None, invalid_request(format!("malformed request: {e}")));
            return Some(serde_json::to_string(&response).unwrap_or_default());
        }
    };

    let id = request.id.clone();
    let response = dispatch(state, ctx, request).await;
    Some(serde_json::to_string(&RpcResponse { id, ..response }).unwrap_or_default())
}

async fn dispatch(state: &Arc<DaemonState>, ctx: &Arc<ConnectionContext>, request: RpcRequest) -> RpcResponse {
    if !methods::is_registered(&request.method) {
        return RpcResponse::err(None, method_not_found(&request.method));
    }
    if !methods::allowed_on_transport(&request.method, ctx.transport) {
        return RpcResponse::err(
            None,
            invalid_request(format!("{} is not available on this transport", request.method)),
        );
    }

    let method = request.method.clone();
    let outcome = tokio::time::timeout(
        REQUEST_TIMEOUT,
        AssertUnwindSafe(methods::dispatch_method(state, ctx, &request.method, request.params)).catch_unwind(),
    )
    .await;

    match outcome {
        Ok(Ok(Ok(result))) => RpcResponse::ok(None, result),
        Ok(Ok(Err(err))) => RpcResponse::err(None, to_rpc_error(&err)),
        Ok(Err(panic)) => {
            let detail = panic_detail(panic);
            tracing::error!(method = %method, detail = %detail, "request handler panicked");
            RpcResponse::err(None, to_rpc_error(&ThrumError::Internal(format!("handler for '{method}' panicked: {detail}"))))
        }
        Err(_) => RpcResponse::err(None, to_rpc_error(&ThrumError::Timeout(REQUEST_TIMEOUT))),
    }
}

/// Extracts a human-readable message from a caught panic payload
/// (spec.md §7 "Panics in a request task are caught, converted to
/// `internal` errors, and logged").
fn panic_detail(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unregistered_method_is_rejected_before_dispatch() {
        assert!(!methods::is_registered("totally.bogus"));
    }

    #[test]
    fn panic_detail_extracts_str_and_string_payloads() {
        let str_payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_detail(str_payload), "boom");

        let string_payload: Box<dyn std::any::Any + Send> = Box::new(String::from("kaboom"));
        assert_eq!(panic_detail(string_payload), "kaboom");

        let other_payload: Box<dyn std::any::Any + Send> = Box::new(42i32);
        assert_eq!(panic_detail(other_payload), "non-string panic payload");
    }

    /// Exercises the same `AssertUnwindSafe(...).catch_unwind()` wrapping
    /// `dispatch` applies around `methods::dispatch_method`, proving a
    /// panicking handler future is caught rather than tearing down the
    /// request task (spec.md §7).
    #[tokio::test]
    async fn panicking_handler_future_is_caught_not_propagated() {
        let fut = AssertUnwindSafe(async {
            panic!("boom");
            #[allow(unreachable_code)]
            Ok::<Value, ThrumError>(Value::Null)
        });

        let outcome = tokio::time::timeout(REQUEST_TIMEOUT, fut.catch_unwind()).await;
        match outcome {
            Ok(Err(panic)) => assert_eq!(panic_detail(panic), "boom"),
            Ok(Ok(_)) => panic!("expected a caught panic, got a successful result"),
            Err(_) => panic!("expected a caught panic, got a timeout"),
        }
    }
}
