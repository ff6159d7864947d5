//! Transports (spec.md §4.3, §4.8): the Unix-domain socket and the
//! WebSocket/TCP listener, both newline/frame-per-message and both feeding
//! every inbound line into [`crate::rpc::handle_line`].
//!
//! Grounded in the teacher's `daemon/socket.rs` accept-loop shape (stale
//! socket cleanup, `tokio::select!` against a `CancellationToken`, spawn
//! one task per connection) generalized from one-shot request/response to
//! persistent multi-request connections, since spec.md requires a session
//! to stay bound to its socket across many RPC calls and receive
//! server-pushed notifications on it.

use crate::connections::OUTBOUND_QUEUE_CAPACITY;
use crate::rpc::{self, ConnectionContext, Transport};
use crate::DaemonState;
use futures_util::{SinkExt, StreamExt};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thrum_core::error::{Result, ThrumError};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, UnixListener};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Runs the Unix-domain socket listener until `cancel` fires. Removes a
/// stale socket file left by a crashed previous run, binds mode 0600
/// (spec.md §4.8), and spawns one task per accepted connection.
pub async fn run_unix_listener(state: Arc<DaemonState>, socket_path: &Path, cancel: CancellationToken) -> Result<()> {
    if socket_path.exists() {
        tracing::warn!(path = %socket_path.display(), "removing stale socket file");
        std::fs::remove_file(socket_path)?;
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let listener = UnixListener::bind(socket_path)?;
    set_owner_only_permissions(socket_path)?;
    tracing::info!(path = %socket_path.display(), "unix socket listening");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    let state = state.clone();
                    let cancel = cancel.clone();
                    tokio::spawn(async move { handle_unix_connection(state, stream, cancel).await });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "accept error on unix socket");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }

    tracing::info!("unix socket accept loop stopped");
    Ok(())
}

#[cfg(unix)]
fn set_owner_only_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_owner_only_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

async fn handle_unix_connection(state: Arc<DaemonState>, stream: tokio::net::UnixStream, cancel: CancellationToken) {
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);
    let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_QUEUE_CAPACITY);
    let ctx = Arc::new(ConnectionContext::new(Transport::Unix, tx.clone()));

    let mut line = String::new();
    loop {
        line.clear();
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ctx.close.cancelled() => break,
            outgoing = rx.recv() => match outgoing {
                Some(payload) => {
                    if write_half.write_all(format!("{payload}\n").as_bytes()).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            read = reader.read_line(&mut line) => match read {
                Ok(0) => break,
                Ok(_) => {
                    let trimmed = line.trim();
                    if !trimmed.is_empty() {
                        spawn_dispatch(&state, &ctx, &tx, trimmed);
                    }
                }
                Err(_) => break,
            },
        }
    }

    finish_connection(&state, &ctx);
}

/// Runs the WebSocket/TCP listener until `cancel` fires. The same TCP port
/// multiplexes the WebSocket JSON-RPC endpoint and a static UI asset
/// server (spec.md §4.8): connections are peeked for an `Upgrade:
/// websocket` header before either path commits to reading the request.
///
/// Returns the bound port plus the accept loop's `JoinHandle`, so the
/// caller can track it alongside the Unix listener in the shutdown
/// sequence (spec.md §4.8) instead of it running fully detached.
pub async fn run_ws_listener(
    state: Arc<DaemonState>,
    bind_addr: &str,
    cancel: CancellationToken,
) -> Result<(u16, tokio::task::JoinHandle<()>)> {
    let listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| ThrumError::Io(format!("binding websocket listener on {bind_addr}: {e}")))?;
    let port = listener.local_addr().map_err(|e| ThrumError::Io(e.to_string()))?.port();
    tracing::info!(port, "websocket/http listener bound");

    let accept_cancel = cancel.clone();
    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = accept_cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        let state = state.clone();
                        let cancel = accept_cancel.clone();
                        tokio::spawn(async move { handle_tcp_connection(state, stream, cancel).await });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept error on websocket listener");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                }
            }
        }
        tracing::info!("websocket accept loop stopped");
    });

    Ok((port, handle))
}

async fn handle_tcp_connection(state: Arc<DaemonState>, stream: TcpStream, cancel: CancellationToken) {
    let mut peek_buf = [0u8; 2048];
    let is_upgrade = match tokio::time::timeout(rpc::HANDSHAKE_TIMEOUT, stream.peek(&mut peek_buf)).await {
        Ok(Ok(n)) => String::from_utf8_lossy(&peek_buf[..n]).to_ascii_lowercase().contains("upgrade: websocket"),
        _ => return,
    };

    if is_upgrade {
        handle_websocket_connection(state, stream, cancel).await;
    } else {
        serve_static_placeholder(stream).await;
    }
}

/// The embedded browser UI is out of scope here (spec.md §1: it is a
/// client of the RPC surface, specified elsewhere); this just answers any
/// plain HTTP request on the shared port so the port isn't silently
/// unresponsive to non-WebSocket clients.
async fn serve_static_placeholder(mut stream: TcpStream) {
    let body = "thrum daemon: this port serves the WebSocket JSON-RPC endpoint.\n";
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    let _ = stream.write_all(response.as_bytes()).await;
}

async fn handle_websocket_connection(state: Arc<DaemonState>, stream: TcpStream, cancel: CancellationToken) {
    let mut ws_stream = match tokio::time::timeout(rpc::HANDSHAKE_TIMEOUT, tokio_tungstenite::accept_async(stream)).await {
        Ok(Ok(ws)) => ws,
        _ => return,
    };

    let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_QUEUE_CAPACITY);
    let ctx = Arc::new(ConnectionContext::new(Transport::WebSocket, tx.clone()));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ctx.close.cancelled() => break,
            outgoing = rx.recv() => match outgoing {
                Some(payload) => {
                    if ws_stream.send(Message::Text(payload)).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            incoming = ws_stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => spawn_dispatch(&state, &ctx, &tx, &text),
                Some(Ok(Message::Ping(payload))) => {
                    if ws_stream.send(Message::Pong(payload)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            },
        }
    }

    finish_connection(&state, &ctx);
}

fn spawn_dispatch(state: &Arc<DaemonState>, ctx: &Arc<ConnectionContext>, tx: &mpsc::Sender<String>, raw: &str) {
    let state = state.clone();
    let ctx = ctx.clone();
    let tx = tx.clone();
    let raw = raw.to_string();
    tokio::spawn(async move {
        if let Some(response) = rpc::handle_line(&state, &ctx, &raw).await {
            let _ = tx.send(response).await;
        }
    });
}

fn finish_connection(state: &Arc<DaemonState>, ctx: &Arc<ConnectionContext>) {
    if let Some(session_id) = ctx.bound_session_id() {
        state.connections.unbind(&session_id);
    }
}
