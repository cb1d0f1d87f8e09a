// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT

mod error_kind;
mod loader;
mod schema;
mod token;

pub use error_kind::{Classify, ErrorKind};
pub use loader::load;
pub use schema::*;
pub use token::{RawToken, StoredToken, StoredTokenFile};
