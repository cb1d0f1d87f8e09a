// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::DriverError;

/// One turn's running subprocess. A fresh `ProcessHandle` is produced by
/// [`crate::session::AgentDriver::spawn_turn`] for every `send_message`
/// call — each prompt is one self-contained one-shot invocation that
/// writes its prompt to stdin, closes stdin, streams stdout to EOF, and
/// exits.
#[async_trait]
pub trait ProcessHandle: Send {
    /// Next line of stdout, or `None` on EOF. An `Err` maps to a scanner
    /// `Warning` event by the caller, never a fatal error.
    async fn next_stdout_line(&mut self) -> std::io::Result<Option<String>>;

    /// Drain whatever stderr bytes are currently available, up to the
    /// configured capture limit. Called once after stdout EOF; the caller
    /// bounds this with `stderr_drain_timeout`.
    async fn drain_stderr(&mut self) -> Vec<u8>;

    /// Wait for the child to exit. Returns `true` on a zero exit code.
    async fn wait(&mut self) -> std::io::Result<bool>;

    /// Forcefully terminate the child (used on interrupt).
    async fn kill(&mut self);

    /// An in-band channel for delivering permission/question responses to
    /// this turn's subprocess, if the driver's wire format supports it in
    /// the current mode. `None` means such responses are unsupported for
    /// this invocation (surfaced to the caller as `DriverError::Unsupported`).
    fn control_sink(&self) -> Option<mpsc::Sender<serde_json::Value>>;
}

/// Per-session driver instance, constructed once per [`crate::session::AgentSession`]
/// by an [`AgentDriverFactory`]. Knows the session's working directory, mode,
/// and (after the first turn) its agent-internal chat id for resume.
#[async_trait]
pub trait AgentDriver: Send + Sync {
    /// Spawn one turn: write `prompt` to the new subprocess's stdin, close
    /// stdin, and return a handle for streaming its output.
    async fn spawn_turn(&self, prompt: &str) -> Result<Box<dyn ProcessHandle>, DriverError>;
}

/// Parameters for constructing a per-session [`AgentDriver`].
#[derive(Debug, Clone)]
pub struct StartParams {
    pub session_id: String,
    pub work_dir: Option<std::path::PathBuf>,
    pub mode: conductor_config::AgentMode,
    /// Whether the driver should attach to a previously started chat
    /// (true for every launch after the session's first).
    pub resume: bool,
}

/// Builds a per-session [`AgentDriver`]. Implementations may perform a
/// preliminary subprocess invocation here to obtain an agent-internal chat
/// id; failure of that step fails the whole session creation.
#[async_trait]
pub trait AgentDriverFactory: Send + Sync {
    async fn start(
        &self,
        params: &StartParams,
    ) -> Result<(Box<dyn AgentDriver>, Option<String>), DriverError>;
}
