// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT

mod error;
mod manager;

pub use error::ProcessError;
pub use manager::ProcessManager;
