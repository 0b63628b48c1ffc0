// SPDX-FileCopyrightText: 2026 Duet Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Message Store
//!
//! Durable, ordered, append-only record of messages between two identities.
//! Two backends: an in-memory store for tests and development, and SQLite
//! for deployments.

mod error;
mod memory;
pub mod migration;
mod sqlite;

pub use error::StorageError;
pub use memory::MemoryMessageStore;
pub use sqlite::SqliteMessageStore;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use crate::identity::IdentityId;
use crate::message::{Message, MessageId, MAX_BODY_BYTES};

/// Durable message storage.
///
/// `append` returning `Ok` is a commit: the message is persisted before the
/// call resolves. Within a conversation, ids increase in append order.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Appends a message with `DeliveryState::Stored`.
    ///
    /// Callers must pass resolved identities; the store only checks that
    /// sender and recipient differ and that the body is acceptable.
    async fn append(
        &self,
        sender: &IdentityId,
        recipient: &IdentityId,
        body: &str,
    ) -> Result<Message, StorageError>;

    /// Transitions a message to `Delivered`.
    ///
    /// Returns `Ok(true)` if this call made the transition. Already-delivered
    /// and unknown ids are no-ops returning `Ok(false)`.
    async fn mark_delivered(&self, id: MessageId) -> Result<bool, StorageError>;

    /// Returns the most recent `limit` messages between `a` and `b` with an id
    /// below `before` (if given), in ascending id order.
    ///
    /// Keeps no cursor state; paging passes the oldest id seen as `before`.
    async fn list_conversation(
        &self,
        a: &IdentityId,
        b: &IdentityId,
        limit: usize,
        before: Option<MessageId>,
    ) -> Result<Vec<Message>, StorageError>;

    /// Fetches a single message.
    async fn get(&self, id: MessageId) -> Result<Option<Message>, StorageError>;

    /// Returns up to `limit` undelivered messages addressed to `recipient`,
    /// oldest first.
    async fn pending_for(
        &self,
        recipient: &IdentityId,
        limit: usize,
    ) -> Result<Vec<Message>, StorageError>;

    /// Total number of stored messages.
    async fn message_count(&self) -> Result<usize, StorageError>;

    /// Verifies the backend can serve requests.
    async fn health_check(&self) -> Result<(), StorageError>;
}

/// Where the message store lives, parsed from a connection string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    /// Process memory; nothing survives a restart.
    Memory,
    /// SQLite database file.
    Sqlite(PathBuf),
}

impl StoreLocation {
    /// Parses `memory`, `sqlite://<path>` or a bare file path.
    pub fn parse(value: &str) -> Result<Self, StorageError> {
        let value = value.trim();
        if value.is_empty() {
            return Err(StorageError::InvalidLocation(
                "empty connection string".to_string(),
            ));
        }
        if value.eq_ignore_ascii_case("memory") {
            return Ok(StoreLocation::Memory);
        }
        match value.strip_prefix("sqlite://") {
            Some("") => Err(StorageError::InvalidLocation(
                "sqlite:// requires a path".to_string(),
            )),
            Some(path) => Ok(StoreLocation::Sqlite(PathBuf::from(path))),
            None if value.contains("://") => Err(StorageError::InvalidLocation(format!(
                "unsupported scheme: {}",
                value
            ))),
            None => Ok(StoreLocation::Sqlite(PathBuf::from(value))),
        }
    }
}

/// Opens the store at `location`.
///
/// `op_timeout` bounds SQLite writes: an append that cannot commit within it
/// is rolled back and reported as unavailable.
pub fn create_message_store(
    location: &StoreLocation,
    op_timeout: Duration,
) -> Result<Box<dyn MessageStore>, StorageError> {
    match location {
        StoreLocation::Memory => Ok(Box::new(MemoryMessageStore::new())),
        StoreLocation::Sqlite(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StorageError::Unavailable(format!(
                        "cannot create {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
            Ok(Box::new(SqliteMessageStore::open(path, op_timeout)?))
        }
    }
}

/// Checks a submission before it is persisted.
pub(crate) fn validate_submission(
    sender: &IdentityId,
    recipient: &IdentityId,
    body: &str,
) -> Result<(), StorageError> {
    if sender == recipient {
        return Err(StorageError::InvalidMessage(
            "sender and recipient must differ".to_string(),
        ));
    }
    if body.trim().is_empty() {
        return Err(StorageError::InvalidMessage("body is empty".to_string()));
    }
    if body.len() > MAX_BODY_BYTES {
        return Err(StorageError::InvalidMessage(format!(
            "body is {} bytes, limit is {}",
            body.len(),
            MAX_BODY_BYTES
        )));
    }
    Ok(())
}
