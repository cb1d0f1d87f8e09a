// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT

//! Line-oriented JSON event parser.
//!
//! Translates one line of subprocess stdout into zero or more [`AgentEvent`]s.
//! The parser is a small state machine only in the sense that it buffers
//! consecutive `text` content blocks within a single line so they are
//! delivered as one concatenated [`AgentEvent::Text`] rather than one event
//! per block.

use tracing::warn;

use crate::events::{AgentEvent, CommandStream, Question};

const CANCELLATION_PHRASES: &[&str] = &["cancel", "interrupt"];

/// Stateless wrapper kept as a struct so future wire dialects can carry
/// state across lines (e.g. genuinely streaming text deltas) without
/// changing the call site.
#[derive(Debug, Default)]
pub struct LineParser;

impl LineParser {
    pub fn new() -> Self {
        Self
    }

    /// Parse one non-blank line of subprocess stdout into the events it
    /// produces, in order. Never returns an `Err` — malformed lines become
    /// a `Raw` passthrough plus a logged warning, per the no-fatal-parser-
    /// errors contract.
    pub fn parse_line(&mut self, line: &str) -> Vec<AgentEvent> {
        let value: serde_json::Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, line, "scanner: failed to parse stdout line as JSON");
                return vec![AgentEvent::Raw {
                    kind: "unparsed_line".to_string(),
                    raw: serde_json::Value::String(line.to_string()),
                }];
            }
        };

        let ty = value.get("type").and_then(|t| t.as_str()).unwrap_or("");

        match ty {
            "assistant" => parse_assistant(&value),
            "user" => parse_user(&value),
            "control_request" => parse_control_request(&value),
            "control_cancel_request" => parse_control_cancel(&value),
            "result" => parse_result(&value),
            "" => vec![AgentEvent::Raw {
                kind: "unknown".to_string(),
                raw: value,
            }],
            other => vec![AgentEvent::Raw {
                kind: other.to_string(),
                raw: value,
            }],
        }
    }
}

fn parse_assistant(value: &serde_json::Value) -> Vec<AgentEvent> {
    let mut events = Vec::new();
    let mut pending_text = String::new();

    let blocks = value
        .pointer("/message/content")
        .and_then(|c| c.as_array())
        .cloned()
        .unwrap_or_default();

    for block in blocks {
        match block.get("type").and_then(|t| t.as_str()) {
            Some("text") => {
                let text = block.get("text").and_then(|t| t.as_str()).unwrap_or("");
                let (residual, spans) = extract_command_spans(text);
                events.extend(spans);
                pending_text.push_str(&residual);
            }
            Some("tool_use") => {
                flush_text(&mut pending_text, &mut events);
                let id = block
                    .get("id")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let name = block
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let input = block.get("input").cloned().unwrap_or(serde_json::Value::Null);
                events.push(AgentEvent::ToolCall {
                    tool_use_id: id,
                    tool_name: name,
                    tool_input: input,
                });
            }
            _ => {}
        }
    }

    flush_text(&mut pending_text, &mut events);
    events
}

fn flush_text(pending: &mut String, events: &mut Vec<AgentEvent>) {
    if !pending.is_empty() {
        events.push(AgentEvent::Text {
            content: std::mem::take(pending),
        });
    }
}

fn parse_user(value: &serde_json::Value) -> Vec<AgentEvent> {
    let mut events = Vec::new();

    let blocks = value
        .pointer("/message/content")
        .and_then(|c| c.as_array())
        .cloned()
        .unwrap_or_default();

    for block in blocks {
        if block.get("type").and_then(|t| t.as_str()) != Some("tool_result") {
            continue;
        }
        let tool_use_id = block
            .get("tool_use_id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        let result = match block.get("content") {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(serde_json::Value::Array(items)) => {
                let mut text = String::new();
                for item in items {
                    match item.get("type").and_then(|t| t.as_str()) {
                        Some("text") => {
                            text.push_str(item.get("text").and_then(|t| t.as_str()).unwrap_or(""));
                        }
                        Some("image") => {
                            events.push(AgentEvent::Warning {
                                message: "tool result contained an image; dropped".to_string(),
                                code: "image_not_supported".to_string(),
                            });
                        }
                        _ => {}
                    }
                }
                text
            }
            _ => String::new(),
        };

        events.push(AgentEvent::ToolResult { tool_use_id, result });
    }

    events
}

fn parse_control_request(value: &serde_json::Value) -> Vec<AgentEvent> {
    let request_id = value
        .get("request_id")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    let subtype = value
        .pointer("/request/subtype")
        .and_then(|v| v.as_str())
        .unwrap_or("");

    match subtype {
        "can_use_tool" => {
            let tool_name = value
                .pointer("/request/tool_name")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let tool_input = value
                .pointer("/request/input")
                .cloned()
                .unwrap_or(serde_json::Value::Null);
            let tool_use_id = value
                .pointer("/request/tool_use_id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let suggestions = value.pointer("/request/permission_suggestions").cloned();

            vec![AgentEvent::PermissionRequest {
                request_id,
                tool_name,
                tool_input,
                tool_use_id,
                suggestions,
            }]
        }
        "ask_user_question" => {
            let tool_use_id = value
                .pointer("/request/tool_use_id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let questions = value
                .pointer("/request/questions")
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default()
                .iter()
                .map(|q| Question {
                    prompt: q.get("prompt").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                    header: q.get("header").and_then(|v| v.as_str()).map(str::to_string),
                    options: q
                        .get("options")
                        .and_then(|v| v.as_array())
                        .cloned()
                        .unwrap_or_default()
                        .iter()
                        .filter_map(|o| o.as_str().map(str::to_string))
                        .collect(),
                    multi_select: q
                        .get("multi_select")
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false),
                })
                .collect();

            vec![AgentEvent::AskUserQuestion {
                request_id,
                tool_use_id,
                questions,
            }]
        }
        _ => vec![AgentEvent::Raw {
            kind: format!("control_request:{subtype}"),
            raw: value.clone(),
        }],
    }
}

fn parse_control_cancel(value: &serde_json::Value) -> Vec<AgentEvent> {
    let request_id = value
        .get("request_id")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    vec![AgentEvent::RequestCancelled { request_id }]
}

fn parse_result(value: &serde_json::Value) -> Vec<AgentEvent> {
    let subtype = value.get("subtype").and_then(|v| v.as_str()).unwrap_or("");

    match subtype {
        "success" => vec![AgentEvent::Done],
        "error_during_execution" => {
            let errors_text = collect_error_text(value);
            let lowered = errors_text.to_lowercase();
            if CANCELLATION_PHRASES.iter().any(|p| lowered.contains(p)) {
                vec![AgentEvent::Interrupted]
            } else {
                vec![AgentEvent::Done]
            }
        }
        _ => vec![AgentEvent::Raw {
            kind: format!("result:{subtype}"),
            raw: value.clone(),
        }],
    }
}

fn collect_error_text(value: &serde_json::Value) -> String {
    match value.get("error") {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .filter_map(|i| i.as_str())
            .collect::<Vec<_>>()
            .join(" "),
        _ => String::new(),
    }
}

const STDOUT_OPEN: &str = "<local-command-stdout>";
const STDOUT_CLOSE: &str = "</local-command-stdout>";
const STDERR_OPEN: &str = "<local-command-stderr>";
const STDERR_CLOSE: &str = "</local-command-stderr>";

/// Extract `<local-command-stdout>`/`<local-command-stderr>` tagged spans
/// from `text`, returning the residual text (tags removed, in order) plus
/// the `CommandOutput` events the spans produced.
fn extract_command_spans(text: &str) -> (String, Vec<AgentEvent>) {
    let mut residual = String::new();
    let mut events = Vec::new();
    let mut rest = text;

    loop {
        let next_stdout = rest.find(STDOUT_OPEN);
        let next_stderr = rest.find(STDERR_OPEN);

        let (open, close, stream, start) = match (next_stdout, next_stderr) {
            (Some(o), Some(e)) if o <= e => (STDOUT_OPEN, STDOUT_CLOSE, CommandStream::Stdout, o),
            (Some(o), None) => (STDOUT_OPEN, STDOUT_CLOSE, CommandStream::Stdout, o),
            (_, Some(e)) => (STDERR_OPEN, STDERR_CLOSE, CommandStream::Stderr, e),
            (None, None) => {
                residual.push_str(rest);
                break;
            }
        };

        residual.push_str(&rest[..start]);
        let after_open = &rest[start + open.len()..];
        match after_open.find(close) {
            Some(end) => {
                events.push(AgentEvent::CommandOutput {
                    stream,
                    content: after_open[..end].to_string(),
                });
                rest = &after_open[end + close.len()..];
            }
            None => {
                // Unterminated tag: treat the rest as plain text.
                residual.push_str(open);
                residual.push_str(after_open);
                break;
            }
        }
    }

    (residual, events)
}
