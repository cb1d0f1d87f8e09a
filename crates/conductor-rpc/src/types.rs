// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT

use serde::{Deserialize, Serialize};

fn jsonrpc_version() -> String {
    "2.0".to_string()
}

/// A parsed inbound frame. Requests carry `id`; this system's clients
/// never send bare notifications, so `id` is effectively always present,
/// but it is modeled as optional to reject a missing one explicitly
/// rather than by convention.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcRequest {
    #[allow(dead_code)]
    #[serde(default = "jsonrpc_version")]
    pub jsonrpc: String,
    pub id: Option<serde_json::Value>,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: &'static str,
    pub id: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcErrorObject>,
}

impl JsonRpcResponse {
    pub fn ok(id: serde_json::Value, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: serde_json::Value, error: JsonRpcErrorObject) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// A server-initiated, id-less push (an agent event for a subscribed
/// session, or a watcher notification). Carried over the same WebSocket
/// text-frame channel as responses but distinguished by having no `id`
/// and no `error`/`result` envelope — it is a JSON-RPC notification.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: &'static str,
    pub method: String,
    pub params: serde_json::Value,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0",
            method: method.into(),
            params,
        }
    }
}

/// Anything the writer task can serialize onto the wire.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum OutboundFrame {
    Response(JsonRpcResponse),
    Notification(JsonRpcNotification),
}

impl From<JsonRpcResponse> for OutboundFrame {
    fn from(r: JsonRpcResponse) -> Self {
        OutboundFrame::Response(r)
    }
}

impl From<JsonRpcNotification> for OutboundFrame {
    fn from(n: JsonRpcNotification) -> Self {
        OutboundFrame::Notification(n)
    }
}
