// SPDX-FileCopyrightText: 2026 Duet Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Storage error types.

use thiserror::Error;

/// Message store error types.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Invalid store location: {0}")]
    InvalidLocation(String),
}

impl StorageError {
    /// Returns true for validation failures, which retrying cannot fix.
    pub fn is_invalid_message(&self) -> bool {
        matches!(self, StorageError::InvalidMessage(_))
    }
}
