// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT

//! Maps the closed [`AgentEvent`] variant set onto the server-initiated
//! notification surface: one JSON-RPC method per variant, each carrying
//! `session_id` plus the variant's own fields flattened alongside it.

use conductor_driver::AgentEvent;
use serde_json::json;

use crate::types::JsonRpcNotification;

/// Build the notification for one agent event observed on `session_id`.
pub fn agent_event_notification(session_id: &str, event: &AgentEvent) -> JsonRpcNotification {
    let (method, mut params) = match event {
        AgentEvent::Text { content } => ("chat.text", json!({ "content": content })),
        AgentEvent::ToolCall {
            tool_use_id,
            tool_name,
            tool_input,
        } => (
            "chat.tool_call",
            json!({
                "tool_use_id": tool_use_id,
                "tool_name": tool_name,
                "tool_input": tool_input,
            }),
        ),
        AgentEvent::ToolResult { tool_use_id, result } => (
            "chat.tool_result",
            json!({ "tool_use_id": tool_use_id, "result": result }),
        ),
        AgentEvent::CommandOutput { stream, content } => (
            "chat.command_output",
            json!({ "stream": stream, "content": content }),
        ),
        AgentEvent::PermissionRequest {
            request_id,
            tool_name,
            tool_input,
            tool_use_id,
            suggestions,
        } => (
            "chat.permission_request",
            json!({
                "request_id": request_id,
                "tool_name": tool_name,
                "tool_input": tool_input,
                "tool_use_id": tool_use_id,
                "suggestions": suggestions,
            }),
        ),
        AgentEvent::AskUserQuestion {
            request_id,
            tool_use_id,
            questions,
        } => (
            "chat.ask_user_question",
            json!({
                "request_id": request_id,
                "tool_use_id": tool_use_id,
                "questions": questions,
            }),
        ),
        AgentEvent::Warning { message, code } => (
            "chat.warning",
            json!({ "message": message, "code": code }),
        ),
        AgentEvent::Raw { kind, raw } => ("chat.system", json!({ "kind": kind, "raw": raw })),
        AgentEvent::Error { message } => ("chat.error", json!({ "message": message })),
        AgentEvent::Interrupted => ("chat.interrupted", json!({})),
        AgentEvent::Done => ("chat.done", json!({})),
        AgentEvent::ProcessEnded => ("chat.process_ended", json!({})),
        AgentEvent::RequestCancelled { request_id } => (
            "chat.request_cancelled",
            json!({ "request_id": request_id }),
        ),
    };

    params["session_id"] = json!(session_id);
    JsonRpcNotification::new(method, params)
}
