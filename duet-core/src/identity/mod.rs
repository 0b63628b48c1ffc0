// SPDX-FileCopyrightText: 2026 Duet Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Identity Directory
//!
//! Resolves human-readable handles to stable identity keys. Identities are
//! created by the external account service; the directory is read-mostly.

mod memory;
mod sqlite;

pub use memory::MemoryIdentityDirectory;
pub use sqlite::SqliteIdentityDirectory;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum handle length in characters.
pub const MAX_HANDLE_LEN: usize = 64;

/// Identity directory errors.
#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("Identity not found: {0}")]
    NotFound(String),

    #[error("Invalid handle: {0}")]
    InvalidHandle(String),

    #[error("Handle already registered: {0}")]
    AlreadyRegistered(String),

    #[error("Directory unavailable: {0}")]
    Unavailable(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}

/// Opaque, stable identity key used for addressing everywhere in the relay.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityId(String);

impl IdentityId {
    /// Generates a fresh random identifier.
    pub fn generate() -> Self {
        IdentityId(uuid::Uuid::new_v4().to_string())
    }

    /// Wraps an identifier issued elsewhere (e.g. loaded from storage).
    pub fn from_string(id: impl Into<String>) -> Self {
        IdentityId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A registered user: an immutable handle bound to a stable id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    id: IdentityId,
    handle: String,
}

impl Identity {
    pub fn new(id: IdentityId, handle: impl Into<String>) -> Self {
        Identity {
            id,
            handle: handle.into(),
        }
    }

    pub fn id(&self) -> &IdentityId {
        &self.id
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }
}

/// Lookup and registration of identities.
///
/// `resolve` and `get` are pure lookups: a miss is `NotFound` and is never
/// retried internally. Registrations made before a lookup are visible to it.
pub trait IdentityDirectory: Send + Sync {
    /// Resolves a handle (case-sensitive) to its identity.
    fn resolve(&self, handle: &str) -> Result<Identity, DirectoryError>;

    /// Looks up an identity by id.
    fn get(&self, id: &IdentityId) -> Result<Identity, DirectoryError>;

    /// Registers a new handle.
    ///
    /// Account creation belongs to the external registry; this exists for
    /// seeding and development deployments.
    fn register(&self, handle: &str) -> Result<Identity, DirectoryError>;
}

/// Checks that a handle is usable for addressing.
///
/// Handles are 1..=64 characters with no whitespace, control characters
/// or `/` (handles appear in the WebSocket path).
pub fn validate_handle(handle: &str) -> Result<(), DirectoryError> {
    if handle.is_empty() {
        return Err(DirectoryError::InvalidHandle("handle is empty".to_string()));
    }
    if handle.chars().count() > MAX_HANDLE_LEN {
        return Err(DirectoryError::InvalidHandle(format!(
            "handle exceeds {} characters",
            MAX_HANDLE_LEN
        )));
    }
    if handle
        .chars()
        .any(|c| c.is_whitespace() || c.is_control() || c == '/')
    {
        return Err(DirectoryError::InvalidHandle(format!(
            "handle contains forbidden characters: {:?}",
            handle
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_handle_accepts_plain_names() {
        assert!(validate_handle("alice").is_ok());
        assert!(validate_handle("Bob_99").is_ok());
        assert!(validate_handle("émilie").is_ok());
    }

    #[test]
    fn test_validate_handle_rejects_bad_input() {
        assert!(validate_handle("").is_err());
        assert!(validate_handle("has space").is_err());
        assert!(validate_handle("a/b").is_err());
        assert!(validate_handle("tab\there").is_err());
        assert!(validate_handle(&"x".repeat(MAX_HANDLE_LEN + 1)).is_err());
        assert!(validate_handle(&"x".repeat(MAX_HANDLE_LEN)).is_ok());
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let a = IdentityId::generate();
        let b = IdentityId::generate();
        assert_ne!(a, b);
    }
}
