// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::error::DriverError;
use crate::process::{AgentDriver, AgentDriverFactory, ProcessHandle, StartParams};

/// One turn's scripted behavior for [`FixtureDriver`]. Ships for tests
/// only — it plays back literal stdout lines instead of spawning a real
/// subprocess, letting the session state machine be exercised without a
/// concrete agent CLI.
pub enum ScriptedTurn {
    /// Emit each line in order, then report a clean (zero) exit.
    Lines {
        lines: VecDeque<String>,
        control_capacity: usize,
    },
    /// Never produce a line on its own; `next_stdout_line` only resolves
    /// once `kill()` is called, simulating an interrupted long-running
    /// turn.
    Hang,
    /// Fail to start.
    FailToStart(String),
    /// Start successfully, then fail the first `next_stdout_line` call with
    /// the given io error kind and message.
    IoError(std::io::ErrorKind, String),
}

impl ScriptedTurn {
    pub fn lines(lines: Vec<String>) -> Self {
        ScriptedTurn::Lines {
            lines: lines.into(),
            control_capacity: 8,
        }
    }

    pub fn hang() -> Self {
        ScriptedTurn::Hang
    }

    pub fn fail_to_start(message: impl Into<String>) -> Self {
        ScriptedTurn::FailToStart(message.into())
    }

    pub fn io_error(kind: std::io::ErrorKind, message: impl Into<String>) -> Self {
        ScriptedTurn::IoError(kind, message.into())
    }
}

/// Test double for [`AgentDriver`]. Holds one [`ScriptedTurn`] per expected
/// `send_message` call, consumed in order; calling `spawn_turn` more times
/// than there are scripted turns panics, since that indicates a test wired
/// up fewer turns than the scenario actually drives.
pub struct FixtureDriver {
    turns: StdMutex<VecDeque<ScriptedTurn>>,
}

impl FixtureDriver {
    pub fn new(turns: Vec<ScriptedTurn>) -> Self {
        Self {
            turns: StdMutex::new(turns.into()),
        }
    }
}

#[async_trait]
impl AgentDriver for FixtureDriver {
    async fn spawn_turn(&self, _prompt: &str) -> Result<Box<dyn ProcessHandle>, DriverError> {
        let turn = self
            .turns
            .lock()
            .unwrap()
            .pop_front()
            .expect("FixtureDriver ran out of scripted turns");

        match turn {
            ScriptedTurn::FailToStart(message) => Err(DriverError::Startup(message)),
            ScriptedTurn::Lines {
                lines,
                control_capacity,
            } => {
                let (killed_tx, killed_rx) = watch::channel(false);
                let (control_tx, control_rx) = mpsc::channel(control_capacity);
                Ok(Box::new(FixtureProcess {
                    lines,
                    pending_error: None,
                    killed_tx,
                    killed_rx,
                    control_tx: Some(control_tx),
                    control_rx,
                }))
            }
            ScriptedTurn::Hang => {
                let (killed_tx, killed_rx) = watch::channel(false);
                let (control_tx, control_rx) = mpsc::channel(8);
                Ok(Box::new(FixtureProcess {
                    lines: VecDeque::new(),
                    pending_error: None,
                    killed_tx,
                    killed_rx,
                    control_tx: Some(control_tx),
                    control_rx,
                }))
            }
            ScriptedTurn::IoError(kind, message) => {
                let (killed_tx, killed_rx) = watch::channel(false);
                let (control_tx, control_rx) = mpsc::channel(8);
                Ok(Box::new(FixtureProcess {
                    lines: VecDeque::new(),
                    pending_error: Some((kind, message)),
                    killed_tx,
                    killed_rx,
                    control_tx: Some(control_tx),
                    control_rx,
                }))
            }
        }
    }
}

struct FixtureProcess {
    lines: VecDeque<String>,
    pending_error: Option<(std::io::ErrorKind, String)>,
    killed_tx: watch::Sender<bool>,
    killed_rx: watch::Receiver<bool>,
    control_tx: Option<mpsc::Sender<serde_json::Value>>,
    control_rx: mpsc::Receiver<serde_json::Value>,
}

#[async_trait]
impl ProcessHandle for FixtureProcess {
    async fn next_stdout_line(&mut self) -> std::io::Result<Option<String>> {
        if let Some(line) = self.lines.pop_front() {
            return Ok(Some(line));
        }
        if let Some((kind, message)) = self.pending_error.take() {
            return Err(std::io::Error::new(kind, message));
        }
        if *self.killed_rx.borrow() {
            return Ok(None);
        }
        let mut rx = self.killed_rx.clone();
        let _ = rx.changed().await;
        Ok(None)
    }

    async fn drain_stderr(&mut self) -> Vec<u8> {
        Vec::new()
    }

    async fn wait(&mut self) -> std::io::Result<bool> {
        Ok(true)
    }

    async fn kill(&mut self) {
        let _ = self.killed_tx.send(true);
    }

    fn control_sink(&self) -> Option<mpsc::Sender<serde_json::Value>> {
        self.control_tx.clone()
    }
}

impl FixtureProcess {
    /// Drain any control messages a test sent via the session's
    /// `send_permission_response` / `send_question_response` — exposed for
    /// tests that want to assert on what was routed in-band.
    #[allow(dead_code)]
    pub async fn recv_control(&mut self) -> Option<serde_json::Value> {
        self.control_rx.recv().await
    }
}

/// [`AgentDriverFactory`] that hands out one pre-scripted [`FixtureDriver`]
/// per `start` call, in registration order. Lets a test drive the Process
/// Manager / RPC dispatcher without a real subprocess while still
/// exercising per-key launch serialization.
pub struct FixtureDriverFactory {
    drivers: StdMutex<VecDeque<Arc<FixtureDriver>>>,
}

impl FixtureDriverFactory {
    pub fn new(drivers: Vec<Arc<FixtureDriver>>) -> Self {
        Self {
            drivers: StdMutex::new(drivers.into()),
        }
    }
}

struct ArcFixtureDriver(Arc<FixtureDriver>);

#[async_trait]
impl AgentDriver for ArcFixtureDriver {
    async fn spawn_turn(&self, prompt: &str) -> Result<Box<dyn ProcessHandle>, DriverError> {
        self.0.spawn_turn(prompt).await
    }
}

#[async_trait]
impl AgentDriverFactory for FixtureDriverFactory {
    async fn start(
        &self,
        _params: &StartParams,
    ) -> Result<(Box<dyn AgentDriver>, Option<String>), DriverError> {
        let driver = self
            .drivers
            .lock()
            .unwrap()
            .pop_front()
            .expect("FixtureDriverFactory ran out of scripted drivers");
        Ok((Box::new(ArcFixtureDriver(driver)), None))
    }
}
