// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT

use conductor_config::{Classify, ErrorKind};
use thiserror::Error;

/// Errors crossing the Agent Driver / Agent Session boundary.
#[derive(Debug, Error)]
pub enum DriverError {
    /// `start` failed — the subprocess could not be spawned, or a
    /// preliminary chat-id lookup invocation failed.
    #[error("failed to start agent process: {0}")]
    Startup(String),

    /// `send_message` called while another prompt is already in flight.
    #[error("another request is already running for this session")]
    Busy,

    /// The driver's CLI mode cannot route this operation (e.g. permission
    /// responses in "print mode").
    #[error("operation not supported by this agent driver: {0}")]
    Unsupported(String),

    /// The session has already been closed.
    #[error("agent session is closed")]
    Closed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Classify for DriverError {
    fn kind(&self) -> ErrorKind {
        match self {
            DriverError::Startup(_) => ErrorKind::Fatal,
            DriverError::Busy => ErrorKind::Conflict,
            // §7 groups Busy and Unsupported together as ConflictError.
            DriverError::Unsupported(_) => ErrorKind::Conflict,
            DriverError::Closed => ErrorKind::Conflict,
            DriverError::Io(_) => ErrorKind::Transient,
        }
    }
}
