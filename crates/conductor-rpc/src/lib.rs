// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT

//! WebSocket front door. One connection is one client; every request on
//! it is JSON-RPC 2.0 dispatched by [`dispatcher::handle_method`], and
//! every agent event or watcher change is pushed back as a JSON-RPC
//! notification over the same text-frame channel.
//!
//! The auth-first invariant lives here, not in the dispatcher: a
//! connection that sends anything other than `auth` before authenticating
//! gets one error response and the socket is closed — the dispatcher has
//! no way to close a socket, only to return `Err`.

mod connection;
mod dispatcher;
mod error;
mod notify;
mod types;

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures::{FutureExt, SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

pub use connection::ConnectionState;
pub use dispatcher::{AppState, ServerInfo};
pub use error::{RpcError, CODE_INTERNAL_ERROR, CODE_PARSE_ERROR};
pub use types::{JsonRpcErrorObject, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, OutboundFrame};

/// Per-process registry of live connections, keyed by connection id, so the
/// Process Manager's slow-subscriber disconnect sentinel can reach a
/// specific socket by id without the two crates knowing about each other's
/// internals.
type ConnRegistry = Arc<Mutex<HashMap<String, CancellationToken>>>;

#[derive(Clone)]
struct RouterState {
    app: Arc<AppState>,
    registry: ConnRegistry,
}

/// Runs the server: binds `bind`, drains `disconnect_rx` for connection
/// ids the Process Manager wants evicted, and serves WebSocket upgrades at
/// `/ws` until the process is killed.
pub async fn serve(
    bind: &str,
    app: Arc<AppState>,
    mut disconnect_rx: mpsc::Receiver<String>,
) -> anyhow::Result<()> {
    let registry: ConnRegistry = Arc::new(Mutex::new(HashMap::new()));

    let drain_registry = registry.clone();
    tokio::spawn(async move {
        while let Some(conn_id) = disconnect_rx.recv().await {
            if let Some(token) = drain_registry.lock().await.get(&conn_id) {
                debug!(conn_id, "evicting slow subscriber connection");
                token.cancel();
            }
        }
    });

    let state = RouterState { app, registry };
    let router = Router::new().route("/ws", get(ws_handler)).with_state(state);

    let listener = TcpListener::bind(bind).await?;
    tracing::info!(bind, "listening for WebSocket connections");
    axum::serve(listener, router).await?;
    Ok(())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<RouterState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: RouterState) {
    let RouterState { app, registry } = state;
    let conn_id = Uuid::new_v4().to_string();
    let conn = Arc::new(ConnectionState::new(conn_id.clone()));
    let conn_cancel = CancellationToken::new();
    registry.lock().await.insert(conn_id.clone(), conn_cancel.clone());

    let (out_tx, mut out_rx) = mpsc::channel::<OutboundFrame>(256);

    let (mut sink, mut stream) = socket.split();
    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let Ok(text) = serde_json::to_string(&frame) else {
                continue;
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let deadline = tokio::time::Instant::now() + app.auth_timeout;
    let mut authenticated = false;

    loop {
        tokio::select! {
            biased;
            _ = conn_cancel.cancelled() => {
                debug!(conn_id, "connection cancelled by server");
                break;
            }
            _ = tokio::time::sleep_until(deadline), if !authenticated => {
                debug!(conn_id, "closing connection: auth timeout elapsed");
                break;
            }
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if !handle_frame(&app, &conn, &out_tx, &text, &mut authenticated).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(conn_id, error = %e, "WebSocket recv error");
                        break;
                    }
                }
            }
        }
    }

    drop(out_tx);
    let _ = writer.await;
    dispatcher::cleanup_connection(&app, &conn).await;
    registry.lock().await.remove(&conn_id);
}

/// Parses and dispatches one inbound text frame. Returns `false` if the
/// connection must be closed (auth-first violation).
async fn handle_frame(
    app: &Arc<AppState>,
    conn: &Arc<ConnectionState>,
    out_tx: &mpsc::Sender<OutboundFrame>,
    text: &str,
    authenticated: &mut bool,
) -> bool {
    let request: JsonRpcRequest = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(e) => {
            let resp = JsonRpcResponse::err(
                Value::Null,
                JsonRpcErrorObject {
                    code: CODE_PARSE_ERROR,
                    message: format!("parse error: {e}"),
                    data: None,
                },
            );
            let _ = out_tx.send(resp.into()).await;
            return true;
        }
    };

    if !*authenticated && request.method != "auth" {
        let resp = JsonRpcResponse::err(
            request.id.unwrap_or(Value::Null),
            RpcError::AuthFirst.into_object(),
        );
        let _ = out_tx.send(resp.into()).await;
        return false;
    }

    if request.method == "auth" {
        let result = AssertUnwindSafe(dispatcher::handle_method(
            app,
            conn,
            out_tx,
            &request.method,
            &request.params,
        ))
        .catch_unwind()
        .await;
        let id = request.id.unwrap_or(Value::Null);
        let (response, keep_open) = match result {
            Ok(Ok(value)) => {
                *authenticated = true;
                (JsonRpcResponse::ok(id, value), true)
            }
            // Any failed `auth` — bad token, malformed params — is fatal:
            // the dispatcher replies with the error and closes the socket.
            Ok(Err(e)) => (JsonRpcResponse::err(id, e.into_object()), false),
            Err(_) => (JsonRpcResponse::err(id, internal_error_object()), false),
        };
        let _ = out_tx.send(response.into()).await;
        return keep_open;
    }

    let app = app.clone();
    let conn = conn.clone();
    let out_tx = out_tx.clone();
    tokio::spawn(async move {
        let id = request.id.unwrap_or(Value::Null);
        let result = AssertUnwindSafe(dispatcher::handle_method(
            &app,
            &conn,
            &out_tx,
            &request.method,
            &request.params,
        ))
        .catch_unwind()
        .await;
        let response = match result {
            Ok(Ok(value)) => JsonRpcResponse::ok(id, value),
            Ok(Err(e)) => JsonRpcResponse::err(id, e.into_object()),
            Err(panic) => {
                warn!(
                    method = %request.method,
                    panic = %panic_message(&panic),
                    "request handler panicked"
                );
                JsonRpcResponse::err(id, internal_error_object())
            }
        };
        let _ = out_tx.send(response.into()).await;
    });

    true
}

fn internal_error_object() -> JsonRpcErrorObject {
    JsonRpcErrorObject {
        code: CODE_INTERNAL_ERROR,
        message: "internal error".to_string(),
        data: None,
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use conductor_driver::fixture::FixtureDriverFactory;
    use conductor_driver::SessionLimits;
    use conductor_process::ProcessManager;
    use conductor_store::SessionStore;
    use conductor_watch::WatcherHub;

    use super::*;

    const TOKEN: &str = "s3cr3t";

    fn limits() -> SessionLimits {
        SessionLimits {
            stderr_capture_bytes: 4096,
            stderr_drain_timeout: Duration::from_millis(200),
        }
    }

    async fn test_app() -> (Arc<AppState>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SessionStore::new(dir.path()));
        let factory = Arc::new(FixtureDriverFactory::new(vec![]));
        let (disconnect_tx, _disconnect_rx) = mpsc::channel(16);
        let process = ProcessManager::new(
            factory,
            store.clone(),
            disconnect_tx,
            CancellationToken::new(),
            limits(),
            Duration::from_secs(600),
        );
        let app = Arc::new(AppState {
            store,
            process,
            session_list_hub: Arc::new(WatcherHub::new()),
            token: TOKEN.to_string(),
            auth_timeout: Duration::from_secs(10),
            server_info: ServerInfo {
                version: "0.1.0-test".to_string(),
                app_title: "Conductor".to_string(),
                agent_type: "fixture".to_string(),
                default_workdir: None,
            },
        });
        (app, dir)
    }

    /// §8 S5 — an unauthenticated connection that sends any method other
    /// than `auth` gets the auth-first error and the connection is closed
    /// (the caller tears down the socket when `handle_frame` returns `false`).
    #[tokio::test]
    async fn s5_non_auth_method_before_auth_is_rejected_and_closes() {
        let (app, _dir) = test_app().await;
        let conn = Arc::new(ConnectionState::new("c1".to_string()));
        let (out_tx, mut out_rx) = mpsc::channel::<OutboundFrame>(8);
        let mut authenticated = false;

        let text = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "chat.message",
            "params": {"session_id": "x", "content": "y"},
        })
        .to_string();

        let should_continue = handle_frame(&app, &conn, &out_tx, &text, &mut authenticated).await;
        assert!(!should_continue);
        assert!(!authenticated);

        match out_rx.recv().await.unwrap() {
            OutboundFrame::Response(r) => {
                let err = r.error.expect("expected an error response");
                assert_eq!(err.code, crate::error::CODE_INVALID_REQUEST);
                assert!(err.message.contains("first request must be auth"));
            }
            other => panic!("expected a response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn valid_auth_flips_authenticated_and_unblocks_other_methods() {
        let (app, _dir) = test_app().await;
        let conn = Arc::new(ConnectionState::new("c1".to_string()));
        let (out_tx, mut out_rx) = mpsc::channel::<OutboundFrame>(8);
        let mut authenticated = false;

        let auth_text = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "auth",
            "params": {"token": TOKEN},
        })
        .to_string();

        let should_continue = handle_frame(&app, &conn, &out_tx, &auth_text, &mut authenticated).await;
        assert!(should_continue);
        assert!(authenticated);

        match out_rx.recv().await.unwrap() {
            OutboundFrame::Response(r) => {
                assert!(r.error.is_none());
                assert_eq!(r.result.unwrap()["agent_type"], serde_json::json!("fixture"));
            }
            other => panic!("expected a response, got {other:?}"),
        }

        let list_text = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 2,
            "method": "session.list.subscribe",
            "params": {},
        })
        .to_string();
        let should_continue = handle_frame(&app, &conn, &out_tx, &list_text, &mut authenticated).await;
        assert!(should_continue);
        tokio::time::sleep(Duration::from_millis(20)).await;
        match out_rx.recv().await.unwrap() {
            OutboundFrame::Response(r) => assert!(r.error.is_none()),
            other => panic!("expected a response, got {other:?}"),
        }
    }

    /// §4.5 — a failed `auth` (bad token) replies with the invalid-token
    /// error and closes the connection, same as the auth-first violation.
    #[tokio::test]
    async fn invalid_token_auth_fails_and_closes_connection() {
        let (app, _dir) = test_app().await;
        let conn = Arc::new(ConnectionState::new("c1".to_string()));
        let (out_tx, mut out_rx) = mpsc::channel::<OutboundFrame>(8);
        let mut authenticated = false;

        let auth_text = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "auth",
            "params": {"token": "wrong"},
        })
        .to_string();

        let should_continue = handle_frame(&app, &conn, &out_tx, &auth_text, &mut authenticated).await;
        assert!(!should_continue);
        assert!(!authenticated);

        match out_rx.recv().await.unwrap() {
            OutboundFrame::Response(r) => {
                let err = r.error.expect("expected an error response");
                assert_eq!(err.message, "invalid token");
            }
            other => panic!("expected a response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_frame_before_auth_gets_parse_error_but_keeps_the_socket_open() {
        let (app, _dir) = test_app().await;
        let conn = Arc::new(ConnectionState::new("c1".to_string()));
        let (out_tx, mut out_rx) = mpsc::channel::<OutboundFrame>(8);
        let mut authenticated = false;

        let should_continue = handle_frame(&app, &conn, &out_tx, "not json", &mut authenticated).await;
        assert!(should_continue);
        match out_rx.recv().await.unwrap() {
            OutboundFrame::Response(r) => {
                let err = r.error.expect("expected a parse error response");
                assert_eq!(err.code, CODE_PARSE_ERROR);
            }
            other => panic!("expected a response, got {other:?}"),
        }
    }
}
