// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Per-connection bookkeeping. Owned exclusively by the dispatcher task
/// handling that connection; handlers only ever see it through the
/// `Arc<ConnectionState>` they were spawned with.
pub struct ConnectionState {
    pub conn_id: String,
    authenticated: Mutex<bool>,
    subscribed_sessions: Mutex<HashSet<String>>,
    watcher_subscriptions: Mutex<HashSet<String>>,
    bound_worktree: Mutex<Option<String>>,
    next_sub_seq: AtomicU64,
    forwarders: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl ConnectionState {
    pub fn new(conn_id: String) -> Self {
        Self {
            conn_id,
            authenticated: Mutex::new(false),
            subscribed_sessions: Mutex::new(HashSet::new()),
            watcher_subscriptions: Mutex::new(HashSet::new()),
            bound_worktree: Mutex::new(None),
            next_sub_seq: AtomicU64::new(0),
            forwarders: Mutex::new(HashMap::new()),
        }
    }

    /// Registers the task forwarding one session's agent events onto this
    /// connection's outbound writer, aborting any prior forwarder for the
    /// same session id (a stale re-subscribe).
    pub async fn set_forwarder(&self, session_id: String, handle: JoinHandle<()>) {
        if let Some(old) = self.forwarders.lock().await.insert(session_id, handle) {
            old.abort();
        }
    }

    pub async fn abort_forwarder(&self, session_id: &str) {
        if let Some(handle) = self.forwarders.lock().await.remove(session_id) {
            handle.abort();
        }
    }

    pub async fn abort_all_forwarders(&self) {
        let mut forwarders = self.forwarders.lock().await;
        for (_, handle) in forwarders.drain() {
            handle.abort();
        }
    }

    pub async fn is_authenticated(&self) -> bool {
        *self.authenticated.lock().await
    }

    pub async fn mark_authenticated(&self) {
        *self.authenticated.lock().await = true;
    }

    pub async fn bind_worktree(&self, worktree: Option<String>) {
        *self.bound_worktree.lock().await = worktree;
    }

    pub async fn add_session_subscription(&self, session_id: String) {
        self.subscribed_sessions.lock().await.insert(session_id);
    }

    pub async fn remove_session_subscription(&self, session_id: &str) {
        self.subscribed_sessions.lock().await.remove(session_id);
    }

    pub async fn subscribed_session_ids(&self) -> Vec<String> {
        self.subscribed_sessions.lock().await.iter().cloned().collect()
    }

    pub async fn add_watcher_subscription(&self, sub_id: String) {
        self.watcher_subscriptions.lock().await.insert(sub_id);
    }

    pub async fn remove_watcher_subscription(&self, sub_id: &str) {
        self.watcher_subscriptions.lock().await.remove(sub_id);
    }

    pub async fn watcher_subscription_ids(&self) -> Vec<String> {
        self.watcher_subscriptions.lock().await.iter().cloned().collect()
    }

    /// Monotonically increasing id local to this connection, used to name
    /// subscriptions it creates.
    pub fn next_subscription_id(&self) -> String {
        let seq = self.next_sub_seq.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.conn_id, seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn starts_unauthenticated_with_empty_sets() {
        let state = ConnectionState::new("c1".into());
        assert!(!state.is_authenticated().await);
        assert!(state.subscribed_session_ids().await.is_empty());
    }

    #[tokio::test]
    async fn mark_authenticated_is_observable() {
        let state = ConnectionState::new("c1".into());
        state.mark_authenticated().await;
        assert!(state.is_authenticated().await);
    }

    #[tokio::test]
    async fn session_subscriptions_add_and_remove() {
        let state = ConnectionState::new("c1".into());
        state.add_session_subscription("s1".into()).await;
        assert_eq!(state.subscribed_session_ids().await, vec!["s1".to_string()]);
        state.remove_session_subscription("s1").await;
        assert!(state.subscribed_session_ids().await.is_empty());
    }

    #[tokio::test]
    async fn subscription_ids_are_unique_per_connection() {
        let state = ConnectionState::new("c1".into());
        let a = state.next_subscription_id();
        let b = state.next_subscription_id();
        assert_ne!(a, b);
    }
}
