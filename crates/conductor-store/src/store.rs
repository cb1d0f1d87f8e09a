// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use conductor_config::AgentMode;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::StoreError;
use crate::model::{HistoryRecord, SessionMeta};

/// File-backed Session Store. One metadata file and one JSON-Lines
/// history file per session under `data_dir/sessions/<id>/`. Writes are
/// serialized per session id by an internal per-key lock so concurrent
/// callers (e.g. a title update racing a history append) linearize
/// instead of interleaving partial writes.
pub struct SessionStore {
    data_dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn session_dir(&self, id: &str) -> PathBuf {
        self.data_dir.join("sessions").join(id)
    }

    fn meta_path(&self, id: &str) -> PathBuf {
        self.session_dir(id).join("meta.json")
    }

    fn history_path(&self, id: &str) -> PathBuf {
        self.session_dir(id).join("history.jsonl")
    }

    pub async fn create(&self, id: String, mode: AgentMode) -> Result<SessionMeta, StoreError> {
        let guard = self.lock_for(&id).await;
        let _permit = guard.lock().await;

        let dir = self.session_dir(&id);
        fs::create_dir_all(&dir).await?;
        let meta = SessionMeta::new(id.clone(), mode, Utc::now());
        self.write_meta(&meta).await?;
        Ok(meta)
    }

    pub async fn get(&self, id: &str) -> Result<Option<SessionMeta>, StoreError> {
        let path = self.meta_path(id);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// All sessions, most recently updated first.
    pub async fn list(&self) -> Result<Vec<SessionMeta>, StoreError> {
        let root = self.data_dir.join("sessions");
        let mut entries = match fs::read_dir(&root).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut metas = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let id = entry.file_name().to_string_lossy().into_owned();
            if let Some(meta) = self.get(&id).await? {
                metas.push(meta);
            }
        }
        metas.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(metas)
    }

    pub async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let guard = self.lock_for(id).await;
        let _permit = guard.lock().await;

        let dir = self.session_dir(id);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn update_title(&self, id: &str, title: String) -> Result<SessionMeta, StoreError> {
        self.mutate(id, |meta| meta.title = title).await
    }

    pub async fn set_mode(&self, id: &str, mode: AgentMode) -> Result<SessionMeta, StoreError> {
        self.mutate(id, |meta| meta.mode = mode).await
    }

    /// Marks the session activated. Monotonic: once true, further calls
    /// are no-ops that still return the current record.
    pub async fn activate(&self, id: &str) -> Result<SessionMeta, StoreError> {
        self.mutate(id, |meta| meta.activated = true).await
    }

    async fn mutate(
        &self,
        id: &str,
        apply: impl FnOnce(&mut SessionMeta),
    ) -> Result<SessionMeta, StoreError> {
        let guard = self.lock_for(id).await;
        let _permit = guard.lock().await;

        let mut meta = self
            .get(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        apply(&mut meta);
        meta.updated_at = Utc::now();
        self.write_meta(&meta).await?;
        Ok(meta)
    }

    async fn write_meta(&self, meta: &SessionMeta) -> Result<(), StoreError> {
        let dir = self.session_dir(&meta.id);
        let final_path = self.meta_path(&meta.id);
        let bytes = serde_json::to_vec_pretty(meta)?;

        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
            tmp.write_all(&bytes)?;
            tmp.as_file().sync_all()?;
            tmp.persist(&final_path).map_err(|e| StoreError::Io(e.error))?;
            Ok(())
        })
        .await
        .expect("write_meta blocking task panicked")?;
        Ok(())
    }

    pub async fn append_to_history(
        &self,
        id: &str,
        payload: serde_json::Value,
    ) -> Result<(), StoreError> {
        let guard = self.lock_for(id).await;
        let _permit = guard.lock().await;

        let dir = self.session_dir(id);
        if self.get(id).await?.is_none() {
            return Err(StoreError::NotFound(id.to_string()));
        }
        fs::create_dir_all(&dir).await?;

        let record = HistoryRecord {
            recorded_at: Utc::now(),
            payload,
        };
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        let path = self.history_path(id);
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)?;
            file.write_all(&line)?;
            file.sync_all()
        })
        .await
        .expect("history append blocking task panicked")?;
        Ok(())
    }

    pub async fn get_history(&self, id: &str) -> Result<Vec<HistoryRecord>, StoreError> {
        let path = self.history_path(id);
        let bytes = match fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let text = String::from_utf8_lossy(&bytes);
        let mut records = Vec::new();
        for line in text.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(record) => records.push(record),
                Err(e) => warn!(session_id = id, error = %e, "skipping malformed history line"),
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        let meta = store
            .create("s1".to_string(), AgentMode::Default)
            .await
            .unwrap();
        assert_eq!(meta.title, "New Chat");
        assert!(!meta.activated);

        let fetched = store.get("s1").await.unwrap().unwrap();
        assert_eq!(fetched, meta);
    }

    #[tokio::test]
    async fn get_missing_session_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        assert!(store.get("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn activate_is_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        store.create("s1".to_string(), AgentMode::Default).await.unwrap();
        let a = store.activate("s1").await.unwrap();
        assert!(a.activated);
        let b = store.activate("s1").await.unwrap();
        assert!(b.activated);
    }

    #[tokio::test]
    async fn delete_then_get_returns_not_found_semantics() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        store.create("s1".to_string(), AgentMode::Default).await.unwrap();
        store.delete("s1").await.unwrap();
        assert!(store.get("s1").await.unwrap().is_none());
        let err = store.delete("s1").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn list_orders_by_updated_at_descending() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        store.create("older".to_string(), AgentMode::Default).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.create("newer".to_string(), AgentMode::Default).await.unwrap();

        let list = store.list().await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, "newer");
        assert_eq!(list[1].id, "older");
    }

    #[tokio::test]
    async fn append_and_read_history_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        store.create("s1".to_string(), AgentMode::Default).await.unwrap();
        store
            .append_to_history("s1", serde_json::json!({"n": 1}))
            .await
            .unwrap();
        store
            .append_to_history("s1", serde_json::json!({"n": 2}))
            .await
            .unwrap();

        let history = store.get_history("s1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].payload["n"], 1);
        assert_eq!(history[1].payload["n"], 2);
    }

    #[tokio::test]
    async fn append_to_history_for_missing_session_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        let err = store
            .append_to_history("nope", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn update_title_and_set_mode_bump_updated_at() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        let created = store.create("s1".to_string(), AgentMode::Default).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let renamed = store.update_title("s1", "Renamed".to_string()).await.unwrap();
        assert_eq!(renamed.title, "Renamed");
        assert!(renamed.updated_at > created.updated_at);

        let remoded = store.set_mode("s1", AgentMode::Plan).await.unwrap();
        assert_eq!(remoded.mode, AgentMode::Plan);
    }
}
