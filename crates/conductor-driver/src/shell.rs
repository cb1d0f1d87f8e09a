// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT

//! The production [`AgentDriverFactory`]: spawns a configured command line
//! as a one-shot child process per turn, writes the prompt to its stdin,
//! and streams stdout lines back to the session's [`LineParser`]. Which
//! agent CLI that command line actually invokes is a deployment detail —
//! this driver only knows how to run an argv and talk line-oriented JSON
//! over stdio, the same contract every turn in the system assumes.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use crate::error::DriverError;
use crate::process::{AgentDriver, AgentDriverFactory, ProcessHandle, StartParams};

/// The argv used to launch one turn. The prompt itself is never
/// interpolated into `args` — it is always written to the child's stdin —
/// so arbitrary prompt content can never be mistaken for a shell token.
#[derive(Debug, Clone)]
pub struct ShellCommand {
    pub program: String,
    pub args: Vec<String>,
}

/// Builds a [`ShellDriver`] per session, all sharing the same configured
/// command line. Carries no per-session chat id — resuming a conversation
/// relies entirely on the on-disk history the session store already keeps,
/// not on anything the subprocess remembers internally.
pub struct ShellDriverFactory {
    command: ShellCommand,
    max_line_bytes: usize,
}

impl ShellDriverFactory {
    pub fn new(command: ShellCommand, max_line_bytes: usize) -> Self {
        Self { command, max_line_bytes }
    }
}

#[async_trait]
impl AgentDriverFactory for ShellDriverFactory {
    async fn start(
        &self,
        _params: &StartParams,
    ) -> Result<(Box<dyn AgentDriver>, Option<String>), DriverError> {
        Ok((
            Box::new(ShellDriver {
                command: self.command.clone(),
                max_line_bytes: self.max_line_bytes,
            }),
            None,
        ))
    }
}

struct ShellDriver {
    command: ShellCommand,
    max_line_bytes: usize,
}

#[async_trait]
impl AgentDriver for ShellDriver {
    async fn spawn_turn(&self, prompt: &str) -> Result<Box<dyn ProcessHandle>, DriverError> {
        let mut cmd = Command::new(&self.command.program);
        cmd.args(&self.command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| DriverError::Startup(e.to_string()))?;

        let mut stdin = child.stdin.take().expect("piped stdin");
        let prompt = prompt.to_string();
        tokio::spawn(async move {
            let _ = stdin.write_all(prompt.as_bytes()).await;
            let _ = stdin.shutdown().await;
        });

        let stdout = child.stdout.take().expect("piped stdout");
        Ok(Box::new(ShellProcess {
            child,
            stdout: BufReader::new(stdout),
            max_line_bytes: self.max_line_bytes,
        }))
    }
}

struct ShellProcess {
    child: Child,
    stdout: BufReader<tokio::process::ChildStdout>,
    max_line_bytes: usize,
}

#[async_trait]
impl ProcessHandle for ShellProcess {
    /// Reads one line bounded by `max_line_bytes`. A line that never hits a
    /// newline within that budget is reported as an `InvalidData` error
    /// (mapped by the session to a `scanner_buffer_overflow` warning) rather
    /// than buffering an unbounded amount of a misbehaving child's output.
    async fn next_stdout_line(&mut self) -> std::io::Result<Option<String>> {
        let mut buf = Vec::new();
        loop {
            let chunk = self.stdout.fill_buf().await?;
            if chunk.is_empty() {
                return if buf.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
                };
            }

            match chunk.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    if buf.len() + pos > self.max_line_bytes {
                        self.stdout.consume(pos + 1);
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            "scanner_buffer_overflow: line exceeded max_line_bytes",
                        ));
                    }
                    buf.extend_from_slice(&chunk[..pos]);
                    self.stdout.consume(pos + 1);
                    return Ok(Some(String::from_utf8_lossy(&buf).into_owned()));
                }
                None => {
                    let n = chunk.len();
                    if buf.len() + n > self.max_line_bytes {
                        self.stdout.consume(n);
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            "scanner_buffer_overflow: line exceeded max_line_bytes",
                        ));
                    }
                    buf.extend_from_slice(chunk);
                    self.stdout.consume(n);
                }
            }
        }
    }

    async fn drain_stderr(&mut self) -> Vec<u8> {
        use tokio::io::AsyncReadExt;
        let mut buf = Vec::new();
        if let Some(mut stderr) = self.child.stderr.take() {
            let _ = stderr.read_to_end(&mut buf).await;
        }
        buf
    }

    async fn wait(&mut self) -> std::io::Result<bool> {
        Ok(self.child.wait().await?.success())
    }

    async fn kill(&mut self) {
        let _ = self.child.start_kill();
    }

    fn control_sink(&self) -> Option<mpsc::Sender<serde_json::Value>> {
        None
    }
}
