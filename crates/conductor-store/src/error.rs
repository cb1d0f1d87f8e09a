// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT

use conductor_config::{Classify, ErrorKind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode session record: {0}")]
    Encode(#[from] serde_json::Error),
}

impl Classify for StoreError {
    fn kind(&self) -> ErrorKind {
        match self {
            StoreError::NotFound(_) => ErrorKind::Input,
            StoreError::Io(_) => ErrorKind::Transient,
            StoreError::Encode(_) => ErrorKind::Fatal,
        }
    }
}
