// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT

use chrono::{DateTime, Utc};
use conductor_config::AgentMode;
use serde::{Deserialize, Serialize};

/// Durable record for one conversation. Owned exclusively by the store;
/// readers get clones.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionMeta {
    pub id: String,
    pub title: String,
    /// Flips to true the first time a process is successfully created for
    /// this id, and never flips back — subsequent launches must resume.
    pub activated: bool,
    pub mode: AgentMode,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionMeta {
    pub fn new(id: String, mode: AgentMode, now: DateTime<Utc>) -> Self {
        Self {
            id,
            title: "New Chat".to_string(),
            activated: false,
            mode,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One opaque record in a session's append-only history: a client
/// message, a server notification, or a control exchange, captured in its
/// wire form. The store never interprets the payload, only orders it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryRecord {
    pub recorded_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}
