// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT

use serde::{Deserialize, Serialize};

fn default_bind() -> String {
    "127.0.0.1:8787".to_string()
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_auth_timeout_secs() -> u64 {
    10
}

fn default_stderr_drain_timeout_secs() -> u64 {
    5
}

fn default_stderr_capture_bytes() -> usize {
    64 * 1024
}

fn default_line_buffer_bytes() -> usize {
    1024 * 1024
}

/// Top-level server configuration, merged from layered YAML files plus an
/// optional explicit `--config` path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the WebSocket endpoint binds to.
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Bearer token compared in constant time against the in-band `auth`
    /// request. `None` means a token is generated at startup and printed
    /// once (matching the teacher's first-run token flow).
    #[serde(default)]
    pub token: Option<String>,

    /// Directory holding per-session metadata and history. Defaults to
    /// `dirs::data_dir()/conductor/sessions` when unset.
    #[serde(default)]
    pub data_dir: Option<String>,

    /// Seconds of no inbound ops and zero subscribers before the idle
    /// reaper closes a session's process.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// How long an unauthenticated connection may wait before it is
    /// disconnected for never sending `auth`.
    #[serde(default = "default_auth_timeout_secs")]
    pub auth_timeout_secs: u64,

    /// How long the agent session waits for stderr to drain after stdout
    /// EOF before giving up and calling wait() anyway.
    #[serde(default = "default_stderr_drain_timeout_secs")]
    pub stderr_drain_timeout_secs: u64,

    /// Bytes of trailing stderr retained per prompt.
    #[serde(default = "default_stderr_capture_bytes")]
    pub stderr_capture_bytes: usize,

    /// Maximum length of a single stdout line the scanner will buffer
    /// before treating it as a buffer-overflow warning.
    #[serde(default = "default_line_buffer_bytes")]
    pub line_buffer_bytes: usize,

    /// Argv of the per-turn agent subprocess: `agent_command[0]` is the
    /// program, the rest are its fixed arguments. The prompt is never part
    /// of this argv — it is written to the child's stdin by the driver.
    /// `None` means no agent CLI has been configured; `serve` refuses to
    /// start without it.
    #[serde(default)]
    pub agent_command: Option<Vec<String>>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            token: None,
            data_dir: None,
            idle_timeout_secs: default_idle_timeout_secs(),
            auth_timeout_secs: default_auth_timeout_secs(),
            stderr_drain_timeout_secs: default_stderr_drain_timeout_secs(),
            stderr_capture_bytes: default_stderr_capture_bytes(),
            line_buffer_bytes: default_line_buffer_bytes(),
            agent_command: None,
        }
    }
}

impl ServerConfig {
    /// Resolve the data directory, falling back to the platform data dir.
    pub fn resolved_data_dir(&self) -> std::path::PathBuf {
        match &self.data_dir {
            Some(d) => std::path::PathBuf::from(d),
            None => dirs::data_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("conductor")
                .join("sessions"),
        }
    }
}

/// Per-session mode, controlling agent-driver behavior (e.g. whether an
/// unattended-force flag is passed to the underlying CLI).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentMode {
    /// Ask for permission on every sensitive tool call.
    Default,
    /// Run unattended; auto-approve tool calls.
    Yolo,
    /// Produce a plan only, no destructive actions.
    Plan,
}

impl Default for AgentMode {
    fn default() -> Self {
        AgentMode::Default
    }
}

impl std::fmt::Display for AgentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentMode::Default => write!(f, "default"),
            AgentMode::Yolo => write!(f, "yolo"),
            AgentMode::Plan => write!(f, "plan"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_mode_is_default() {
        assert_eq!(AgentMode::default(), AgentMode::Default);
    }

    #[test]
    fn mode_round_trips_through_json() {
        let json = serde_json::to_string(&AgentMode::Yolo).unwrap();
        assert_eq!(json, "\"yolo\"");
        let back: AgentMode = serde_json::from_str(&json).unwrap();
        assert_eq!(back, AgentMode::Yolo);
    }

    #[test]
    fn config_default_has_sane_timeouts() {
        let cfg = Config::default();
        assert_eq!(cfg.server.idle_timeout_secs, 600);
        assert_eq!(cfg.server.auth_timeout_secs, 10);
    }
}
