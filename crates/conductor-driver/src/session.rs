// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::DriverError;
use crate::events::{AgentEvent, PermissionChoice};
use crate::parser::LineParser;
use crate::process::{AgentDriver, ProcessHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    InFlight,
    Closed,
}

struct Inner {
    phase: Phase,
    driver: Arc<dyn AgentDriver>,
    prompt_cancel: Option<CancellationToken>,
    control_sink: Option<mpsc::Sender<serde_json::Value>>,
}

/// A live, addressable conversation with one agent subprocess lineage.
///
/// Cheap to clone — every clone shares the same underlying state and
/// events channel. Each accepted [`AgentSession::send_message`] spawns one
/// fresh one-shot subprocess invocation ("turn"); the session itself
/// outlives any individual turn and serializes them, enforcing at most one
/// in-flight prompt at a time.
#[derive(Clone)]
pub struct AgentSession {
    session_id: String,
    inner: Arc<Mutex<Inner>>,
    events_tx: mpsc::Sender<AgentEvent>,
    root_cancel: CancellationToken,
    stderr_capture_bytes: usize,
    stderr_drain_timeout: Duration,
}

/// Tuning knobs copied out of the resolved server configuration at session
/// construction time, so the session does not need to hold a config handle.
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    pub stderr_capture_bytes: usize,
    pub stderr_drain_timeout: Duration,
}

impl AgentSession {
    /// Construct a new session around an already-built per-session driver.
    /// The returned events receiver is meant for the Process Manager's
    /// fan-out task; there is exactly one.
    pub fn new(
        session_id: String,
        driver: Arc<dyn AgentDriver>,
        root_cancel: CancellationToken,
        limits: SessionLimits,
    ) -> (Self, mpsc::Receiver<AgentEvent>) {
        let (events_tx, events_rx) = mpsc::channel(256);
        let session = Self {
            session_id,
            inner: Arc::new(Mutex::new(Inner {
                phase: Phase::Idle,
                driver,
                prompt_cancel: None,
                control_sink: None,
            })),
            events_tx,
            root_cancel,
            stderr_capture_bytes: limits.stderr_capture_bytes,
            stderr_drain_timeout: limits.stderr_drain_timeout,
        };
        (session, events_rx)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Accept a new prompt. Rejects with [`DriverError::Busy`] if a prompt
    /// is already in flight, or [`DriverError::Closed`] if the session has
    /// been closed. On acceptance, a fresh subprocess turn is spawned and
    /// this returns immediately — terminal notification arrives later as a
    /// `Done` or `Interrupted` event.
    pub async fn send_message(&self, prompt: String) -> Result<(), DriverError> {
        let (child_token, driver) = {
            let mut inner = self.inner.lock().await;
            match inner.phase {
                Phase::Closed => return Err(DriverError::Closed),
                Phase::InFlight => return Err(DriverError::Busy),
                Phase::Idle => {}
            }
            inner.phase = Phase::InFlight;
            let token = self.root_cancel.child_token();
            inner.prompt_cancel = Some(token.clone());
            (token, inner.driver.clone())
        };

        let inner = self.inner.clone();
        let events_tx = self.events_tx.clone();
        let stderr_capture_bytes = self.stderr_capture_bytes;
        let stderr_drain_timeout = self.stderr_drain_timeout;
        let root_cancel = self.root_cancel.clone();
        let session_id = self.session_id.clone();

        tokio::spawn(async move {
            run_turn(
                session_id,
                inner,
                driver,
                events_tx,
                prompt,
                child_token,
                root_cancel,
                stderr_capture_bytes,
                stderr_drain_timeout,
            )
            .await;
        });

        Ok(())
    }

    /// Idempotent. Cancels the in-flight turn's child context if one
    /// exists and emits `Interrupted`; a no-op returning success when no
    /// prompt is in flight.
    pub async fn send_interrupt(&self) -> Result<(), DriverError> {
        let token = {
            let inner = self.inner.lock().await;
            if inner.phase == Phase::Closed {
                return Err(DriverError::Closed);
            }
            inner.prompt_cancel.clone()
        };
        if let Some(token) = token {
            let _ = self.events_tx.send(AgentEvent::Interrupted).await;
            token.cancel();
        }
        Ok(())
    }

    /// Route a permission decision to whichever turn is currently in
    /// flight. Returns `Unsupported` if no turn is running or the running
    /// turn's wire format has no in-band control channel.
    pub async fn send_permission_response(
        &self,
        request_id: String,
        choice: PermissionChoice,
        updated_input: Option<serde_json::Value>,
    ) -> Result<(), DriverError> {
        let payload = serde_json::json!({
            "subtype": "permission_response",
            "request_id": request_id,
            "choice": choice,
            "updated_input": updated_input,
        });
        self.send_control(payload).await
    }

    /// Route question answers to whichever turn is currently in flight.
    pub async fn send_question_response(
        &self,
        request_id: String,
        answers: serde_json::Value,
    ) -> Result<(), DriverError> {
        let payload = serde_json::json!({
            "subtype": "question_response",
            "request_id": request_id,
            "answers": answers,
        });
        self.send_control(payload).await
    }

    async fn send_control(&self, payload: serde_json::Value) -> Result<(), DriverError> {
        let sink = {
            let inner = self.inner.lock().await;
            if inner.phase == Phase::Closed {
                return Err(DriverError::Closed);
            }
            inner.control_sink.clone()
        };
        match sink {
            Some(sink) => sink
                .send(payload)
                .await
                .map_err(|_| DriverError::Unsupported("turn ended before response arrived".into())),
            None => Err(DriverError::Unsupported(
                "this agent driver has no in-band control channel".into(),
            )),
        }
    }

    /// Tear the session down: cancels any in-flight turn, emits exactly
    /// one `ProcessEnded`, and marks the session permanently closed.
    /// Idempotent — a second call is a no-op.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        if inner.phase == Phase::Closed {
            return;
        }
        if let Some(token) = inner.prompt_cancel.take() {
            token.cancel();
        }
        inner.phase = Phase::Closed;
        inner.control_sink = None;
        drop(inner);
        let _ = self.events_tx.send(AgentEvent::ProcessEnded).await;
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.phase == Phase::Closed
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_turn(
    session_id: String,
    inner: Arc<Mutex<Inner>>,
    driver: Arc<dyn AgentDriver>,
    events_tx: mpsc::Sender<AgentEvent>,
    prompt: String,
    cancel: CancellationToken,
    root_cancel: CancellationToken,
    stderr_capture_bytes: usize,
    stderr_drain_timeout: Duration,
) {
    let mut process = match driver.spawn_turn(&prompt).await {
        Ok(p) => p,
        Err(e) => {
            warn!(session_id, error = %e, "turn failed to start");
            let _ = events_tx
                .send(AgentEvent::Error {
                    message: e.to_string(),
                })
                .await;
            let _ = events_tx.send(AgentEvent::Done).await;
            end_turn(&inner).await;
            return;
        }
    };

    if let Some(sink) = process.control_sink() {
        inner.lock().await.control_sink = Some(sink);
    }

    let mut parser = LineParser::new();
    let mut terminal_emitted = false;
    let mut cancelled = false;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                cancelled = true;
                process.kill().await;
                break;
            }
            line = process.next_stdout_line() => {
                match line {
                    Ok(Some(raw)) => {
                        if raw.trim().is_empty() {
                            continue;
                        }
                        let mut hit_terminal = false;
                        for ev in parser.parse_line(&raw) {
                            if ev.is_terminal_for_prompt() {
                                hit_terminal = true;
                            }
                            if events_tx.send(ev).await.is_err() {
                                cancelled = true;
                                break;
                            }
                        }
                        if hit_terminal {
                            terminal_emitted = true;
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!(session_id, error = %e, "stdout read error");
                        let code = if e.kind() == std::io::ErrorKind::InvalidData {
                            "scanner_buffer_overflow"
                        } else {
                            "scanner_error"
                        };
                        let _ = events_tx
                            .send(AgentEvent::Warning {
                                message: e.to_string(),
                                code: code.into(),
                            })
                            .await;
                        break;
                    }
                }
            }
        }
    }

    let stderr_captured = tokio::time::timeout(stderr_drain_timeout, process.drain_stderr())
        .await
        .unwrap_or_default();
    let exit_ok = process.wait().await.unwrap_or(false);

    if !cancelled && !root_cancel.is_cancelled() && !exit_ok && !stderr_captured.is_empty() {
        let text = String::from_utf8_lossy(truncate(&stderr_captured, stderr_capture_bytes));
        let _ = events_tx
            .send(AgentEvent::Error {
                message: text.into_owned(),
            })
            .await;
    }

    if !cancelled && !terminal_emitted {
        let _ = events_tx.send(AgentEvent::Done).await;
    }

    end_turn(&inner).await;
}

fn truncate(bytes: &[u8], max: usize) -> &[u8] {
    if bytes.len() > max {
        &bytes[..max]
    } else {
        bytes
    }
}

async fn end_turn(inner: &Arc<Mutex<Inner>>) {
    let mut inner = inner.lock().await;
    inner.control_sink = None;
    inner.prompt_cancel = None;
    if inner.phase != Phase::Closed {
        inner.phase = Phase::Idle;
    }
}
