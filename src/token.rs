// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT

//! Bearer token file: generate-once, print-once, load-thereafter.
//!
//! Only the SHA-256 hash of the token is ever written to disk — see
//! [`conductor_config::StoredTokenFile`]. The raw token is held in memory
//! just long enough to print it to the operator once.

use std::path::{Path, PathBuf};

use conductor_config::{StoredToken, StoredTokenFile};
use tracing::info;

/// `dirs::config_dir()/conductor/token.yaml`, mirroring the teacher's
/// home-relative default for its own bearer-token file.
pub fn default_token_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("conductor")
        .join("token.yaml")
}

/// Loads the hash at `path`, generating and saving a fresh token if the file
/// doesn't exist yet. Returns the verifying hash and the raw token if one
/// was just generated (so the caller can print it exactly once).
pub fn load_or_generate(path: &Path) -> anyhow::Result<(StoredToken, Option<String>)> {
    if path.exists() {
        Ok((StoredTokenFile::load(path)?.token_hash, None))
    } else {
        let raw = StoredTokenFile::generate_and_save(path)?;
        let raw_str = raw.as_str().to_string();
        // Re-load rather than reuse `raw.into_stored()` so the verifying
        // hash always comes from what actually landed on disk.
        let hash = StoredTokenFile::load(path)?.token_hash;
        Ok((hash, Some(raw_str)))
    }
}

/// Unconditionally generates a fresh token and overwrites `path`, for the
/// `token regenerate` subcommand. Returns the raw token to display once.
pub fn regenerate(path: &Path) -> anyhow::Result<String> {
    let raw = StoredTokenFile::generate_and_save(path)?;
    Ok(raw.as_str().to_string())
}

/// Prints a newly generated token exactly once, for both the `serve`
/// first-run path and `token regenerate`.
pub fn announce(token: &str) {
    info!("=======================================================");
    info!("Bearer token (shown once — save it now!):");
    info!("  {token}");
    info!("=======================================================");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn generate_and_save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("token.yaml");
        let (hash, raw) = load_or_generate(&path).unwrap();
        let raw = raw.expect("first call must generate");
        assert!(hash.verify(&raw));

        let (hash_again, raw_again) = load_or_generate(&path).unwrap();
        assert!(raw_again.is_none(), "second call must not regenerate");
        assert!(hash_again.verify(&raw));
    }

    #[test]
    fn regenerate_changes_the_token() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("token.yaml");
        let (_, first) = load_or_generate(&path).unwrap();
        let first = first.unwrap();
        let second = regenerate(&path).unwrap();
        assert_ne!(first, second);

        let (hash, generated) = load_or_generate(&path).unwrap();
        assert!(generated.is_none());
        assert!(hash.verify(&second));
        assert!(!hash.verify(&first));
    }

    #[test]
    fn token_file_never_contains_the_raw_token() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("token.yaml");
        let (_, raw) = load_or_generate(&path).unwrap();
        let raw = raw.unwrap();
        let on_disk = std::fs::read_to_string(&path).unwrap();
        assert!(!on_disk.contains(&raw));
    }

    #[cfg(unix)]
    #[test]
    fn token_file_is_not_world_or_group_readable() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let path = dir.path().join("token.yaml");
        load_or_generate(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o077, 0);
    }
}
