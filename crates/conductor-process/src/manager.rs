// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use conductor_config::AgentMode;
use conductor_driver::{AgentDriverFactory, AgentEvent, AgentSession, PermissionChoice, SessionLimits, StartParams};
use conductor_store::SessionStore;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ProcessError;

struct Entry {
    session: AgentSession,
    subscribers: HashMap<String, mpsc::Sender<AgentEvent>>,
    last_activity: Instant,
}

type SubscriberMap = HashMap<String, mpsc::Sender<AgentEvent>>;

/// Exclusive owner of the {session id → AgentSession} table. Serializes
/// launches per key, fans events out to subscribers, persists history,
/// and evicts sessions idle past the configured timeout.
pub struct ProcessManager {
    table: Arc<Mutex<HashMap<String, Entry>>>,
    /// Subscriptions registered for a session id before any process exists
    /// for it yet (§8 S1: a client may `chat.messages.subscribe` while
    /// `process_running` is still false). Moved into the entry's own
    /// subscriber map the moment `get_or_create_process` creates one.
    pending_subscribers: Mutex<HashMap<String, SubscriberMap>>,
    creation_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    driver_factory: Arc<dyn AgentDriverFactory>,
    store: Arc<SessionStore>,
    disconnect_tx: mpsc::Sender<String>,
    root_cancel: CancellationToken,
    limits: SessionLimits,
}

impl ProcessManager {
    /// `disconnect_tx` receives connection ids whose sink overflowed and
    /// should be torn down by whoever owns the WebSocket (the dispatcher).
    pub fn new(
        driver_factory: Arc<dyn AgentDriverFactory>,
        store: Arc<SessionStore>,
        disconnect_tx: mpsc::Sender<String>,
        root_cancel: CancellationToken,
        limits: SessionLimits,
        idle_timeout: Duration,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            table: Arc::new(Mutex::new(HashMap::new())),
            pending_subscribers: Mutex::new(HashMap::new()),
            creation_locks: Mutex::new(HashMap::new()),
            driver_factory,
            store,
            disconnect_tx,
            root_cancel,
            limits,
        });
        spawn_idle_reaper(
            manager.table.clone(),
            manager.clone(),
            idle_timeout,
            manager.root_cancel.clone(),
        );
        manager
    }

    pub async fn get_or_create_process(
        &self,
        session_id: &str,
        work_dir: Option<PathBuf>,
        mode: AgentMode,
        resume: bool,
    ) -> Result<(AgentSession, bool), ProcessError> {
        if let Some(session) = self.touch(session_id).await {
            return Ok((session, false));
        }

        let creation_lock = {
            let mut locks = self.creation_locks.lock().await;
            locks
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _permit = creation_lock.lock().await;

        if let Some(session) = self.touch(session_id).await {
            return Ok((session, false));
        }

        let params = StartParams {
            session_id: session_id.to_string(),
            work_dir,
            mode,
            resume,
        };
        let (driver, _chat_id) = self.driver_factory.start(&params).await?;
        let child_cancel = self.root_cancel.child_token();
        let (session, events_rx) = AgentSession::new(
            session_id.to_string(),
            Arc::from(driver),
            child_cancel,
            self.limits,
        );

        let inherited_subscribers = self
            .pending_subscribers
            .lock()
            .await
            .remove(session_id)
            .unwrap_or_default();

        {
            let mut table = self.table.lock().await;
            table.insert(
                session_id.to_string(),
                Entry {
                    session: session.clone(),
                    subscribers: inherited_subscribers,
                    last_activity: Instant::now(),
                },
            );
        }

        self.spawn_fan_out(session_id.to_string(), events_rx);

        Ok((session, true))
    }

    pub async fn has_process(&self, session_id: &str) -> bool {
        self.table.lock().await.contains_key(session_id)
    }

    /// Registers a subscription for `session_id`, whether or not a process
    /// is currently running for it. If none is, the subscription is held
    /// in `pending_subscribers` and moved onto the live entry's subscriber
    /// map the moment one is created (§8 S1: a client may subscribe before
    /// ever sending a `chat.message`, and still observe that first turn).
    /// Returns whether a process was already running at the time of the call.
    pub async fn subscribe(&self, session_id: &str, conn_id: String, sink: mpsc::Sender<AgentEvent>) -> bool {
        let mut table = self.table.lock().await;
        if let Some(entry) = table.get_mut(session_id) {
            entry.subscribers.insert(conn_id, sink);
            return true;
        }
        drop(table);
        self.pending_subscribers
            .lock()
            .await
            .entry(session_id.to_string())
            .or_default()
            .insert(conn_id, sink);
        false
    }

    pub async fn unsubscribe(&self, session_id: &str, conn_id: &str) {
        let mut table = self.table.lock().await;
        if let Some(entry) = table.get_mut(session_id) {
            entry.subscribers.remove(conn_id);
        }
        drop(table);
        if let Some(pending) = self.pending_subscribers.lock().await.get_mut(session_id) {
            pending.remove(conn_id);
        }
    }

    pub async fn send_message(&self, session_id: &str, prompt: String) -> Result<(), ProcessError> {
        let session = self
            .touch(session_id)
            .await
            .ok_or_else(|| ProcessError::NotFound(session_id.to_string()))?;
        session.send_message(prompt).await.map_err(ProcessError::from)
    }

    pub async fn send_interrupt(&self, session_id: &str) -> Result<(), ProcessError> {
        let session = self
            .touch(session_id)
            .await
            .ok_or_else(|| ProcessError::NotFound(session_id.to_string()))?;
        session.send_interrupt().await.map_err(ProcessError::from)
    }

    pub async fn send_permission_response(
        &self,
        session_id: &str,
        request_id: String,
        choice: PermissionChoice,
        updated_input: Option<serde_json::Value>,
    ) -> Result<(), ProcessError> {
        let session = self
            .touch(session_id)
            .await
            .ok_or_else(|| ProcessError::NotFound(session_id.to_string()))?;
        session
            .send_permission_response(request_id, choice, updated_input)
            .await
            .map_err(ProcessError::from)
    }

    pub async fn send_question_response(
        &self,
        session_id: &str,
        request_id: String,
        answers: serde_json::Value,
    ) -> Result<(), ProcessError> {
        let session = self
            .touch(session_id)
            .await
            .ok_or_else(|| ProcessError::NotFound(session_id.to_string()))?;
        session
            .send_question_response(request_id, answers)
            .await
            .map_err(ProcessError::from)
    }

    /// Cancels and removes the entry, draining its fan-out task.
    pub async fn close(&self, session_id: &str) {
        let session = {
            let table = self.table.lock().await;
            table.get(session_id).map(|e| e.session.clone())
        };
        if let Some(session) = session {
            session.close().await;
        }
    }

    /// Closes every live entry and waits (briefly, best-effort) for their
    /// fan-out tasks to finish removing themselves.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.table.lock().await.keys().cloned().collect();
        for id in &ids {
            self.close(id).await;
        }
        for _ in 0..100 {
            if self.table.lock().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn touch(&self, session_id: &str) -> Option<AgentSession> {
        let mut table = self.table.lock().await;
        let entry = table.get_mut(session_id)?;
        entry.last_activity = Instant::now();
        Some(entry.session.clone())
    }

    fn spawn_fan_out(&self, session_id: String, mut events_rx: mpsc::Receiver<AgentEvent>) {
        let table = self.table.clone();
        let store = self.store.clone();
        let disconnect_tx = self.disconnect_tx.clone();

        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                if let Err(e) = store
                    .append_to_history(&session_id, serde_json::to_value(&event).unwrap_or_default())
                    .await
                {
                    warn!(session_id, error = %e, "failed to persist history record");
                }

                let subscribers: Vec<(String, mpsc::Sender<AgentEvent>)> = {
                    let table = table.lock().await;
                    table
                        .get(&session_id)
                        .map(|e| e.subscribers.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                        .unwrap_or_default()
                };

                for (conn_id, sink) in subscribers {
                    if sink.try_send(event.clone()).is_err() {
                        let mut table = table.lock().await;
                        if let Some(entry) = table.get_mut(&session_id) {
                            entry.subscribers.remove(&conn_id);
                        }
                        drop(table);
                        let _ = disconnect_tx.try_send(conn_id);
                    }
                }

                if matches!(event, AgentEvent::ProcessEnded) {
                    break;
                }
            }
            debug!(session_id, "fan-out task exiting, removing table entry");
            table.lock().await.remove(&session_id);
        });
    }
}

fn spawn_idle_reaper(
    table: Arc<Mutex<HashMap<String, Entry>>>,
    manager: Arc<ProcessManager>,
    idle_timeout: Duration,
    root_cancel: CancellationToken,
) {
    let period = idle_timeout / 10;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period.max(Duration::from_millis(100)));
        loop {
            tokio::select! {
                biased;
                _ = root_cancel.cancelled() => {
                    debug!("idle reaper stopping on shutdown");
                    break;
                }
                _ = ticker.tick() => {}
            }
            let stale: Vec<String> = {
                let table = table.lock().await;
                table
                    .iter()
                    .filter(|(_, entry)| {
                        entry.subscribers.is_empty() && entry.last_activity.elapsed() >= idle_timeout
                    })
                    .map(|(id, _)| id.clone())
                    .collect()
            };
            for id in stale {
                debug!(session_id = %id, "idle reaper closing session");
                manager.close(&id).await;
            }
        }
    });
}
