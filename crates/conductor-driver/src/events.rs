// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT

use serde::{Deserialize, Serialize};

/// A single multiple-choice question the agent wants the user to answer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Question {
    pub prompt: String,
    pub header: Option<String>,
    pub options: Vec<String>,
    pub multi_select: bool,
}

/// The user's answer to a `permission_request`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PermissionChoice {
    Deny,
    Allow,
    AlwaysAllow,
}

/// Closed variant set produced by the Agent Session parser from a line of
/// subprocess output, or synthesized by the session for lifecycle signals.
///
/// Unknown incoming `type` values map to `Raw`, preserving bytes without
/// silently dropping data — the wire protocol is open-ended but this system
/// commits to a closed event set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Assistant text chunk. Consecutive `text` content blocks are
    /// concatenated by the parser into one event before being emitted.
    Text { content: String },

    /// The agent decided to invoke a tool.
    ToolCall {
        tool_use_id: String,
        tool_name: String,
        tool_input: serde_json::Value,
    },

    /// A tool call finished.
    ToolResult {
        tool_use_id: String,
        result: String,
    },

    /// An embedded `<local-command-stdout>` / `<local-command-stderr>`
    /// tagged span.
    CommandOutput { stream: CommandStream, content: String },

    /// The agent asks the user to allow or deny a tool invocation.
    PermissionRequest {
        request_id: String,
        tool_name: String,
        tool_input: serde_json::Value,
        tool_use_id: String,
        suggestions: Option<serde_json::Value>,
    },

    /// The agent asks the user a set of multiple-choice questions.
    AskUserQuestion {
        request_id: String,
        tool_use_id: String,
        questions: Vec<Question>,
    },

    /// A recoverable degradation (e.g. output truncated, image dropped).
    Warning { message: String, code: String },

    /// Unclassified passthrough: either an unrecognized `type` value or a
    /// recognized-but-opaque one (e.g. `system`). `kind` carries the
    /// subprocess's original `type` field.
    Raw {
        kind: String,
        raw: serde_json::Value,
    },

    /// The subprocess reported failure.
    Error { message: String },

    /// Interrupt acknowledged by the agent.
    Interrupted,

    /// Turn complete.
    Done,

    /// The subprocess exited (synthesized by the core).
    ProcessEnded,

    /// The agent rescinded an outstanding question or permission request.
    RequestCancelled { request_id: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommandStream {
    Stdout,
    Stderr,
}

impl AgentEvent {
    /// True for the events that terminate a single prompt's burst
    /// (property 4: exactly one Done or Interrupted per prompt, and it is
    /// the last event before any subsequent ProcessEnded).
    pub fn is_terminal_for_prompt(&self) -> bool {
        matches!(self, AgentEvent::Done | AgentEvent::Interrupted)
    }
}
