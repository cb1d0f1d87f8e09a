// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT

use std::sync::Arc;
use std::time::Duration;

use conductor_config::{AgentMode, StoredToken};
use conductor_driver::PermissionChoice;
use conductor_process::ProcessManager;
use conductor_store::{SessionMeta, SessionStore};
use conductor_watch::WatcherHub;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::warn;

use crate::connection::ConnectionState;
use crate::error::RpcError;
use crate::notify::agent_event_notification;
use crate::types::{JsonRpcNotification, OutboundFrame};

/// Static server identity returned from a successful `auth` call.
#[derive(Clone)]
pub struct ServerInfo {
    pub version: String,
    pub app_title: String,
    pub agent_type: String,
    pub default_workdir: Option<String>,
}

/// Shared state reachable from every connection's handlers.
pub struct AppState {
    pub store: Arc<SessionStore>,
    pub process: Arc<ProcessManager>,
    pub session_list_hub: Arc<WatcherHub<Vec<SessionMeta>>>,
    pub token: StoredToken,
    pub auth_timeout: Duration,
    pub server_info: ServerInfo,
}

impl AppState {
    async fn notify_session_list_changed(&self) {
        match self.store.list().await {
            Ok(list) => self.session_list_hub.notify(list).await,
            Err(e) => warn!(error = %e, "failed to reload session list for watcher notification"),
        }
    }
}

#[derive(Deserialize)]
struct AuthParams {
    token: String,
    #[serde(default)]
    worktree: Option<String>,
}

#[derive(Deserialize)]
struct SessionIdParams {
    session_id: String,
}

#[derive(Deserialize)]
struct CreateSessionParams {
    #[serde(default)]
    mode: Option<AgentMode>,
}

#[derive(Deserialize)]
struct UpdateTitleParams {
    session_id: String,
    title: String,
}

#[derive(Deserialize)]
struct SetModeParams {
    session_id: String,
    mode: AgentMode,
}

#[derive(Deserialize)]
struct ChatMessageParams {
    session_id: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatInterruptParams {
    session_id: String,
}

#[derive(Deserialize)]
struct ChatPermissionResponseParams {
    session_id: String,
    request_id: String,
    choice: PermissionChoice,
    #[serde(default)]
    updated_input: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct ChatQuestionResponseParams {
    session_id: String,
    request_id: String,
    answers: serde_json::Value,
}

#[derive(Deserialize)]
struct ChatSubscribeParams {
    session_id: String,
}

#[derive(Deserialize)]
struct IdParam {
    id: String,
}

fn parse_params<T: for<'de> Deserialize<'de>>(params: &serde_json::Value) -> Result<T, RpcError> {
    serde_json::from_value(params.clone()).map_err(|e| RpcError::InvalidParams(e.to_string()))
}

/// Dispatches one already-parsed request and returns its JSON-RPC
/// `result` payload on success. The auth-first invariant is enforced by
/// the caller (it needs to close the socket on violation, which this
/// function has no business doing).
pub async fn handle_method(
    app: &AppState,
    conn: &Arc<ConnectionState>,
    out_tx: &mpsc::Sender<OutboundFrame>,
    method: &str,
    params: &serde_json::Value,
) -> Result<serde_json::Value, RpcError> {
    match method {
        "auth" => handle_auth(app, conn, params).await,
        "session.create" => handle_session_create(app, params).await,
        "session.delete" => handle_session_delete(app, params).await,
        "session.update_title" => handle_session_update_title(app, params).await,
        "session.set_mode" => handle_session_set_mode(app, params).await,
        "session.list.subscribe" => handle_session_list_subscribe(app, conn, out_tx).await,
        "session.list.unsubscribe" => handle_session_list_unsubscribe(app, conn, params).await,
        "chat.message" => handle_chat_message(app, params).await,
        "chat.interrupt" => handle_chat_interrupt(app, params).await,
        "chat.permission_response" => handle_chat_permission_response(app, params).await,
        "chat.question_response" => handle_chat_question_response(app, params).await,
        "chat.messages.subscribe" => handle_chat_subscribe(app, conn, out_tx, params).await,
        "chat.messages.unsubscribe" => handle_chat_unsubscribe(app, conn, params).await,
        other => Err(RpcError::MethodNotFound(other.to_string())),
    }
}

async fn handle_auth(
    app: &AppState,
    conn: &Arc<ConnectionState>,
    params: &serde_json::Value,
) -> Result<serde_json::Value, RpcError> {
    let p: AuthParams = parse_params(params)?;
    if !app.token.verify(&p.token) {
        return Err(RpcError::InvalidToken);
    }
    conn.mark_authenticated().await;
    conn.bind_worktree(p.worktree).await;
    Ok(json!({
        "version": app.server_info.version,
        "title": app.server_info.app_title,
        "workdir": app.server_info.default_workdir,
        "agent_type": app.server_info.agent_type,
    }))
}

async fn handle_session_create(
    app: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, RpcError> {
    let p: CreateSessionParams = parse_params(params)?;
    let id = uuid::Uuid::new_v4().to_string();
    let meta = app.store.create(id, p.mode.unwrap_or_default()).await?;
    app.notify_session_list_changed().await;
    Ok(serde_json::to_value(meta).map_err(|e| RpcError::Internal(e.to_string()))?)
}

async fn handle_session_delete(
    app: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, RpcError> {
    let p: SessionIdParams = parse_params(params)?;
    app.process.close(&p.session_id).await;
    app.store.delete(&p.session_id).await?;
    app.notify_session_list_changed().await;
    Ok(json!({}))
}

async fn handle_session_update_title(
    app: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, RpcError> {
    let p: UpdateTitleParams = parse_params(params)?;
    let meta = app.store.update_title(&p.session_id, p.title).await?;
    app.notify_session_list_changed().await;
    Ok(serde_json::to_value(meta).map_err(|e| RpcError::Internal(e.to_string()))?)
}

async fn handle_session_set_mode(
    app: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, RpcError> {
    let p: SetModeParams = parse_params(params)?;
    let meta = app.store.set_mode(&p.session_id, p.mode).await?;
    app.notify_session_list_changed().await;
    Ok(serde_json::to_value(meta).map_err(|e| RpcError::Internal(e.to_string()))?)
}

async fn handle_session_list_subscribe(
    app: &AppState,
    conn: &Arc<ConnectionState>,
    out_tx: &mpsc::Sender<OutboundFrame>,
) -> Result<serde_json::Value, RpcError> {
    let (sink, mut rx) = mpsc::channel::<Vec<SessionMeta>>(16);
    let sub_id = app.session_list_hub.subscribe(conn.conn_id.clone(), sink).await;
    conn.add_watcher_subscription(sub_id.clone()).await;

    let out_tx = out_tx.clone();
    let forward_sub_id = sub_id.clone();
    tokio::spawn(async move {
        while let Some(list) = rx.recv().await {
            let notification = JsonRpcNotification::new(
                "session.list.changed",
                json!({ "id": forward_sub_id, "sessions": list }),
            );
            if out_tx.send(notification.into()).await.is_err() {
                break;
            }
        }
    });

    let sessions = app.store.list().await?;
    Ok(json!({ "id": sub_id, "sessions": sessions }))
}

async fn handle_session_list_unsubscribe(
    app: &AppState,
    conn: &Arc<ConnectionState>,
    params: &serde_json::Value,
) -> Result<serde_json::Value, RpcError> {
    let p: IdParam = parse_params(params)?;
    app.session_list_hub.unsubscribe(&p.id).await;
    conn.remove_watcher_subscription(&p.id).await;
    Ok(json!({}))
}

async fn handle_chat_message(
    app: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, RpcError> {
    let p: ChatMessageParams = parse_params(params)?;
    let meta = app
        .store
        .get(&p.session_id)
        .await?
        .ok_or(RpcError::SessionNotFound)?;

    let (_session, created) = app
        .process
        .get_or_create_process(&p.session_id, None, meta.mode, meta.activated)
        .await?;
    if created && !meta.activated {
        app.store.activate(&p.session_id).await?;
        app.notify_session_list_changed().await;
    }

    app.store
        .append_to_history(
            &p.session_id,
            json!({ "kind": "user_message", "content": p.content }),
        )
        .await?;

    app.process.send_message(&p.session_id, p.content).await?;
    Ok(json!({}))
}

async fn handle_chat_interrupt(
    app: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, RpcError> {
    let p: ChatInterruptParams = parse_params(params)?;
    let meta = app
        .store
        .get(&p.session_id)
        .await?
        .ok_or(RpcError::SessionNotFound)?;
    app.process
        .get_or_create_process(&p.session_id, None, meta.mode, meta.activated)
        .await?;
    app.process.send_interrupt(&p.session_id).await?;
    Ok(json!({}))
}

async fn handle_chat_permission_response(
    app: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, RpcError> {
    let p: ChatPermissionResponseParams = parse_params(params)?;
    app.store
        .get(&p.session_id)
        .await?
        .ok_or(RpcError::SessionNotFound)?;
    app.store
        .append_to_history(
            &p.session_id,
            json!({
                "kind": "permission_response",
                "request_id": p.request_id,
                "choice": p.choice,
            }),
        )
        .await?;
    app.process
        .send_permission_response(&p.session_id, p.request_id, p.choice, p.updated_input)
        .await?;
    Ok(json!({}))
}

async fn handle_chat_question_response(
    app: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, RpcError> {
    let p: ChatQuestionResponseParams = parse_params(params)?;
    app.store
        .get(&p.session_id)
        .await?
        .ok_or(RpcError::SessionNotFound)?;
    app.store
        .append_to_history(
            &p.session_id,
            json!({
                "kind": "question_response",
                "request_id": p.request_id,
                "answers": p.answers,
            }),
        )
        .await?;
    app.process
        .send_question_response(&p.session_id, p.request_id, p.answers)
        .await?;
    Ok(json!({}))
}

async fn handle_chat_subscribe(
    app: &AppState,
    conn: &Arc<ConnectionState>,
    out_tx: &mpsc::Sender<OutboundFrame>,
    params: &serde_json::Value,
) -> Result<serde_json::Value, RpcError> {
    let p: ChatSubscribeParams = parse_params(params)?;
    let meta = app
        .store
        .get(&p.session_id)
        .await?
        .ok_or(RpcError::SessionNotFound)?;

    let history = app.store.get_history(&p.session_id).await?;
    let process_running = app.process.has_process(&p.session_id).await;

    // Registered unconditionally, even when no process is running yet: a
    // client may subscribe before its first `chat.message` (§8 S1) and
    // still expects to observe that turn's events once it starts.
    let (sink, mut rx) = mpsc::channel(256);
    app.process
        .subscribe(&p.session_id, conn.conn_id.clone(), sink)
        .await;
    conn.add_session_subscription(p.session_id.clone()).await;

    let out_tx = out_tx.clone();
    let session_id = p.session_id.clone();
    let handle = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let notification = agent_event_notification(&session_id, &event);
            if out_tx.send(notification.into()).await.is_err() {
                break;
            }
        }
    });
    conn.set_forwarder(p.session_id.clone(), handle).await;

    Ok(json!({
        "id": p.session_id,
        "history": history,
        "process_running": process_running,
        "mode": meta.mode,
    }))
}

async fn handle_chat_unsubscribe(
    app: &AppState,
    conn: &Arc<ConnectionState>,
    params: &serde_json::Value,
) -> Result<serde_json::Value, RpcError> {
    let p: ChatSubscribeParams = parse_params(params)?;
    app.process.unsubscribe(&p.session_id, &conn.conn_id).await;
    conn.abort_forwarder(&p.session_id).await;
    conn.remove_session_subscription(&p.session_id).await;
    Ok(json!({}))
}

/// Invoked once the connection's dispatcher loop stops, regardless of
/// cause (close frame, auth timeout, socket error).
pub async fn cleanup_connection(app: &AppState, conn: &ConnectionState) {
    conn.abort_all_forwarders().await;
    for session_id in conn.subscribed_session_ids().await {
        app.process.unsubscribe(&session_id, &conn.conn_id).await;
    }
    for sub_id in conn.watcher_subscription_ids().await {
        app.session_list_hub.unsubscribe(&sub_id).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use conductor_driver::fixture::{FixtureDriver, FixtureDriverFactory, ScriptedTurn};
    use conductor_driver::SessionLimits;
    use conductor_process::ProcessManager;
    use conductor_watch::WatcherHub;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::error::{CODE_INTERNAL_ERROR, CODE_INVALID_PARAMS};
    use crate::types::OutboundFrame;

    const TOKEN: &str = "s3cr3t";

    fn limits() -> SessionLimits {
        SessionLimits {
            stderr_capture_bytes: 4096,
            stderr_drain_timeout: Duration::from_millis(200),
        }
    }

    async fn test_app(
        drivers: Vec<Arc<FixtureDriver>>,
    ) -> (Arc<AppState>, tempfile::TempDir, mpsc::Receiver<String>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SessionStore::new(dir.path()));
        let factory = Arc::new(FixtureDriverFactory::new(drivers));
        let (disconnect_tx, disconnect_rx) = mpsc::channel(16);
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
            token: StoredToken::from_raw(TOKEN),
            auth_timeout: Duration::from_secs(10),
            server_info: ServerInfo {
                version: "0.1.0-test".to_string(),
                app_title: "Conductor".to_string(),
                agent_type: "fixture".to_string(),
                default_workdir: None,
            },
        });
        (app, dir, disconnect_rx)
    }

    async fn authed_conn() -> Arc<ConnectionState> {
        let conn = Arc::new(ConnectionState::new("c1".to_string()));
        conn.mark_authenticated().await;
        conn
    }

    fn out_channel() -> (mpsc::Sender<OutboundFrame>, mpsc::Receiver<OutboundFrame>) {
        mpsc::channel(64)
    }

    async fn recv_notification(rx: &mut mpsc::Receiver<OutboundFrame>) -> JsonRpcNotification {
        match rx.recv().await.expect("channel closed before a frame arrived") {
            OutboundFrame::Notification(n) => n,
            OutboundFrame::Response(r) => panic!("expected a notification, got a response: {r:?}"),
        }
    }

    #[tokio::test]
    async fn auth_rejects_wrong_token_then_accepts_right_one() {
        let (app, _dir, _disc) = test_app(vec![]).await;
        let conn = Arc::new(ConnectionState::new("c1".to_string()));

        let err = handle_auth(&app, &conn, &json!({"token": "wrong"}))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::InvalidToken));
        assert!(!conn.is_authenticated().await);

        let ok = handle_auth(&app, &conn, &json!({"token": TOKEN})).await.unwrap();
        assert_eq!(ok["agent_type"], json!("fixture"));
        assert!(conn.is_authenticated().await);
    }

    #[tokio::test]
    async fn unknown_method_is_method_not_found() {
        let (app, _dir, _disc) = test_app(vec![]).await;
        let conn = authed_conn().await;
        let (out_tx, _out_rx) = out_channel();
        let err = handle_method(&app, &conn, &out_tx, "chat.frobnicate", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::MethodNotFound(_)));
    }

    #[tokio::test]
    async fn chat_message_on_missing_session_is_invalid_params() {
        let (app, _dir, _disc) = test_app(vec![]).await;
        let conn = authed_conn().await;
        let (out_tx, _out_rx) = out_channel();
        let err = handle_method(
            &app,
            &conn,
            &out_tx,
            "chat.message",
            &json!({"session_id": "nope", "content": "hi"}),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RpcError::SessionNotFound));
        assert_eq!(err.to_string(), "session not found");
        assert_eq!(err.code(), CODE_INVALID_PARAMS);
    }

    /// §8 S1 — create, subscribe, message, observe `chat.text` then
    /// `chat.done`, and activation flips true.
    #[tokio::test]
    async fn s1_create_message_done_activates_session() {
        let driver = Arc::new(FixtureDriver::new(vec![ScriptedTurn::lines(vec![
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"hi"}]}}"#.to_string(),
            r#"{"type":"result","subtype":"success"}"#.to_string(),
        ])]));
        let (app, _dir, _disc) = test_app(vec![driver]).await;
        let conn = authed_conn().await;
        let (out_tx, mut out_rx) = out_channel();

        let created = handle_method(&app, &conn, &out_tx, "session.create", &json!({}))
            .await
            .unwrap();
        let session_id = created["id"].as_str().unwrap().to_string();
        assert_eq!(created["title"], json!("New Chat"));
        assert_eq!(created["activated"], json!(false));

        let sub = handle_method(
            &app,
            &conn,
            &out_tx,
            "chat.messages.subscribe",
            &json!({"session_id": session_id}),
        )
        .await
        .unwrap();
        assert_eq!(sub["history"], json!([]));
        assert_eq!(sub["process_running"], json!(false));

        handle_method(
            &app,
            &conn,
            &out_tx,
            "chat.message",
            &json!({"session_id": session_id, "content": "hello"}),
        )
        .await
        .unwrap();

        let n1 = recv_notification(&mut out_rx).await;
        assert_eq!(n1.method, "chat.text");
        assert_eq!(n1.params["content"], json!("hi"));
        let n2 = recv_notification(&mut out_rx).await;
        assert_eq!(n2.method, "chat.done");

        let meta = app.store.get(&session_id).await.unwrap().unwrap();
        assert!(meta.activated);
    }

    /// §8 S2 — a second `chat.message` sent while the first prompt is
    /// still in flight is rejected as a conflict, surfaced as an
    /// InternalError per the literal scenario wording.
    #[tokio::test]
    async fn s2_concurrent_prompt_is_rejected_as_busy() {
        let driver = Arc::new(FixtureDriver::new(vec![ScriptedTurn::hang()]));
        let (app, _dir, _disc) = test_app(vec![driver]).await;
        let conn = authed_conn().await;
        let (out_tx, _out_rx) = out_channel();

        let created = handle_method(&app, &conn, &out_tx, "session.create", &json!({}))
            .await
            .unwrap();
        let session_id = created["id"].as_str().unwrap().to_string();

        handle_method(
            &app,
            &conn,
            &out_tx,
            "chat.message",
            &json!({"session_id": session_id, "content": "first"}),
        )
        .await
        .unwrap();

        let err = handle_method(
            &app,
            &conn,
            &out_tx,
            "chat.message",
            &json!({"session_id": session_id, "content": "second"}),
        )
        .await
        .unwrap_err();

        assert_eq!(err.code(), CODE_INTERNAL_ERROR);
        assert!(err.to_string().contains("another request is already running"));
        assert!(app.process.has_process(&session_id).await);
    }

    /// §8 S4 — permission response is routed in-band and appended to the
    /// session's history as a `permission_response` record.
    #[tokio::test]
    async fn s4_permission_response_round_trip() {
        let driver = Arc::new(FixtureDriver::new(vec![ScriptedTurn::lines(vec![
            r#"{"type":"control_request","request_id":"R1","request":{"subtype":"can_use_tool","tool_name":"Bash","input":{"command":"ls"},"tool_use_id":"U1"}}"#.to_string(),
        ])]));
        let (app, _dir, _disc) = test_app(vec![driver]).await;
        let conn = authed_conn().await;
        let (out_tx, mut out_rx) = out_channel();

        let created = handle_method(&app, &conn, &out_tx, "session.create", &json!({}))
            .await
            .unwrap();
        let session_id = created["id"].as_str().unwrap().to_string();

        handle_method(
            &app,
            &conn,
            &out_tx,
            "chat.messages.subscribe",
            &json!({"session_id": session_id}),
        )
        .await
        .unwrap();

        handle_method(
            &app,
            &conn,
            &out_tx,
            "chat.message",
            &json!({"session_id": session_id, "content": "do it"}),
        )
        .await
        .unwrap();

        let n1 = recv_notification(&mut out_rx).await;
        assert_eq!(n1.method, "chat.permission_request");
        assert_eq!(n1.params["request_id"], json!("R1"));

        handle_method(
            &app,
            &conn,
            &out_tx,
            "chat.permission_response",
            &json!({"session_id": session_id, "request_id": "R1", "choice": "allow"}),
        )
        .await
        .unwrap();

        let history = app.store.get_history(&session_id).await.unwrap();
        let recorded = history
            .iter()
            .find(|r| r.payload["kind"] == json!("permission_response"))
            .expect("permission_response not recorded");
        assert_eq!(recorded.payload["request_id"], json!("R1"));
        assert_eq!(recorded.payload["choice"], json!("allow"));
    }

    /// §8 S6 — two connections subscribed to the same session observe the
    /// same ordered notification sequence for one prompt. Both subscribe
    /// while the process is already running, so they attach to the same
    /// live burst rather than racing its start.
    #[tokio::test]
    async fn s6_multiple_subscribers_observe_same_order() {
        let driver = Arc::new(FixtureDriver::new(vec![ScriptedTurn::lines(vec![
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"hi"}]}}"#.to_string(),
            r#"{"type":"result","subtype":"success"}"#.to_string(),
        ])]));
        let (app, _dir, _disc) = test_app(vec![driver]).await;
        let conn_a = authed_conn().await;
        let conn_b = Arc::new(ConnectionState::new("c2".to_string()));
        conn_b.mark_authenticated().await;
        let (out_tx_a, mut out_rx_a) = out_channel();
        let (out_tx_b, mut out_rx_b) = out_channel();

        let created = handle_method(&app, &conn_a, &out_tx_a, "session.create", &json!({}))
            .await
            .unwrap();
        let session_id = created["id"].as_str().unwrap().to_string();

        app.process
            .get_or_create_process(&session_id, None, AgentMode::Default, false)
            .await
            .unwrap();

        handle_method(
            &app,
            &conn_a,
            &out_tx_a,
            "chat.messages.subscribe",
            &json!({"session_id": session_id}),
        )
        .await
        .unwrap();
        handle_method(
            &app,
            &conn_b,
            &out_tx_b,
            "chat.messages.subscribe",
            &json!({"session_id": session_id}),
        )
        .await
        .unwrap();

        app.process
            .send_message(&session_id, "hello".to_string())
            .await
            .unwrap();

        let a1 = recv_notification(&mut out_rx_a).await;
        let b1 = recv_notification(&mut out_rx_b).await;
        assert_eq!(a1.method, "chat.text");
        assert_eq!(a1.method, b1.method);
        assert_eq!(a1.params, b1.params);

        let a2 = recv_notification(&mut out_rx_a).await;
        let b2 = recv_notification(&mut out_rx_b).await;
        assert_eq!(a2.method, "chat.done");
        assert_eq!(b2.method, "chat.done");
    }

    #[tokio::test]
    async fn interrupt_with_no_prompt_in_flight_is_a_noop() {
        let driver = Arc::new(FixtureDriver::new(vec![]));
        let (app, _dir, _disc) = test_app(vec![driver]).await;
        let conn = authed_conn().await;
        let (out_tx, mut out_rx) = out_channel();

        let created = handle_method(&app, &conn, &out_tx, "session.create", &json!({}))
            .await
            .unwrap();
        let session_id = created["id"].as_str().unwrap().to_string();

        handle_method(
            &app,
            &conn,
            &out_tx,
            "chat.interrupt",
            &json!({"session_id": session_id}),
        )
        .await
        .unwrap();

        assert!(tokio::time::timeout(Duration::from_millis(50), out_rx.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn session_delete_closes_process_first() {
        let driver = Arc::new(FixtureDriver::new(vec![ScriptedTurn::hang()]));
        let (app, _dir, _disc) = test_app(vec![driver]).await;
        let conn = authed_conn().await;
        let (out_tx, _out_rx) = out_channel();

        let created = handle_method(&app, &conn, &out_tx, "session.create", &json!({}))
            .await
            .unwrap();
        let session_id = created["id"].as_str().unwrap().to_string();

        handle_method(
            &app,
            &conn,
            &out_tx,
            "chat.message",
            &json!({"session_id": session_id, "content": "hi"}),
        )
        .await
        .unwrap();
        assert!(app.process.has_process(&session_id).await);

        handle_method(
            &app,
            &conn,
            &out_tx,
            "session.delete",
            &json!({"session_id": session_id}),
        )
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!app.process.has_process(&session_id).await);
        assert!(app.store.get(&session_id).await.unwrap().is_none());
    }
}
