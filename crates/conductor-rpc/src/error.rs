// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT

use conductor_config::{Classify, ErrorKind};
use conductor_process::ProcessError;
use conductor_store::StoreError;
use thiserror::Error;

use crate::types::JsonRpcErrorObject;

pub const CODE_PARSE_ERROR: i64 = -32700;
pub const CODE_INVALID_REQUEST: i64 = -32600;
pub const CODE_METHOD_NOT_FOUND: i64 = -32601;
pub const CODE_INVALID_PARAMS: i64 = -32602;
pub const CODE_INTERNAL_ERROR: i64 = -32603;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("invalid request, first request must be auth")]
    AuthFirst,

    #[error("invalid token")]
    InvalidToken,

    #[error("unknown method: {0}")]
    MethodNotFound(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("session not found")]
    SessionNotFound,

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Classify for RpcError {
    fn kind(&self) -> ErrorKind {
        match self {
            RpcError::AuthFirst => ErrorKind::Input,
            RpcError::InvalidToken => ErrorKind::Input,
            RpcError::MethodNotFound(_) => ErrorKind::Input,
            RpcError::InvalidParams(_) => ErrorKind::Input,
            RpcError::SessionNotFound => ErrorKind::Input,
            RpcError::Process(e) => e.kind(),
            RpcError::Store(e) => e.kind(),
            RpcError::Internal(_) => ErrorKind::Fatal,
        }
    }
}

impl RpcError {
    /// JSON-RPC code for this error, chosen from `ErrorKind` plus the
    /// handful of cases the wire convention calls out explicitly
    /// (method-not-found, and "session not found" always reads as
    /// InvalidParams regardless of its underlying `ErrorKind`).
    pub fn code(&self) -> i64 {
        match self {
            RpcError::AuthFirst => CODE_INVALID_REQUEST,
            RpcError::InvalidToken => CODE_INVALID_REQUEST,
            RpcError::MethodNotFound(_) => CODE_METHOD_NOT_FOUND,
            RpcError::InvalidParams(_) | RpcError::SessionNotFound => CODE_INVALID_PARAMS,
            RpcError::Process(ProcessError::NotFound(_)) => CODE_INVALID_PARAMS,
            _ => match self.kind() {
                ErrorKind::Input => CODE_INVALID_PARAMS,
                // §8 S2 names a conflict (prompt already in flight) as an
                // InternalError on the wire, not InvalidParams — the
                // request was well-formed, it just collided with state.
                ErrorKind::Conflict => CODE_INTERNAL_ERROR,
                ErrorKind::Transient | ErrorKind::Fatal => CODE_INTERNAL_ERROR,
            },
        }
    }

    pub fn into_object(self) -> JsonRpcErrorObject {
        JsonRpcErrorObject {
            code: self.code(),
            message: self.to_string(),
            data: None,
        }
    }
}
