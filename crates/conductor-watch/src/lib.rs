// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT

//! Generic broadcast hub for typed change notifications (session list
//! changed, settings changed, fs-change at a path, …). One topic is a
//! single `WatcherHub<T>` instance; this repository wires exactly one
//! (`session.list`) but the hub itself knows nothing about that payload
//! shape.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::debug;
use uuid::Uuid;

struct Subscription<T> {
    conn_id: String,
    sink: mpsc::Sender<T>,
}

/// Fire-and-forget fan-out of `T` to subscribers, with a snapshot handed
/// out at subscribe time so a late joiner can initialize its view before
/// the first live notification arrives.
pub struct WatcherHub<T> {
    subscriptions: Mutex<HashMap<String, Subscription<T>>>,
}

impl<T> Default for WatcherHub<T>
where
    T: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WatcherHub<T>
where
    T: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a subscription and returns its id, paired with a caller
    /// supplied `snapshot` (current state) that the caller should deliver
    /// to `sink` before returning, outside this call, to avoid racing a
    /// concurrent `notify`.
    pub async fn subscribe(&self, conn_id: String, sink: mpsc::Sender<T>) -> String {
        let sub_id = Uuid::new_v4().to_string();
        self.subscriptions
            .lock()
            .await
            .insert(sub_id.clone(), Subscription { conn_id, sink });
        sub_id
    }

    pub async fn unsubscribe(&self, sub_id: &str) {
        self.subscriptions.lock().await.remove(sub_id);
    }

    /// Removes every subscription registered for `conn_id` — called when a
    /// connection closes, regardless of how many topics/subscriptions it held.
    pub async fn cleanup_connection(&self, conn_id: &str) {
        self.subscriptions
            .lock()
            .await
            .retain(|_, sub| sub.conn_id != conn_id);
    }

    /// Delivers `payload` to every current subscriber using a non-blocking
    /// offer; a subscriber whose sink is full or closed is dropped
    /// silently (the dispatcher owns deciding whether to disconnect).
    pub async fn notify(&self, payload: T) {
        let mut subs = self.subscriptions.lock().await;
        subs.retain(|_, sub| {
            let delivered = sub.sink.try_send(payload.clone()).is_ok();
            if !delivered {
                debug!(conn_id = %sub.conn_id, "dropping watcher subscriber, sink full or closed");
            }
            delivered
        });
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscriptions.lock().await.len()
    }
}

/// Convenience alias used at the call sites that need to share one hub
/// across many connections.
pub type SharedWatcherHub<T> = Arc<WatcherHub<T>>;
