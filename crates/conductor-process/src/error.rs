// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT

use conductor_config::{Classify, ErrorKind};
use conductor_driver::DriverError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("no process running for session {0}")]
    NotFound(String),

    #[error(transparent)]
    Driver(#[from] DriverError),
}

impl Classify for ProcessError {
    fn kind(&self) -> ErrorKind {
        match self {
            ProcessError::NotFound(_) => ErrorKind::Input,
            ProcessError::Driver(e) => e.kind(),
        }
    }
}
