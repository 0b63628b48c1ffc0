// SPDX-FileCopyrightText: 2026 Duet Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! SQLite-backed identity directory.

use std::path::Path;
use std::sync::{Mutex, PoisonError};

use rusqlite::{params, Connection, OptionalExtension};

use super::{validate_handle, DirectoryError, Identity, IdentityDirectory, IdentityId};

/// Identity directory persisted in an `identities` table.
///
/// May share a database file with [`crate::SqliteMessageStore`]; each opens
/// its own connection.
pub struct SqliteIdentityDirectory {
    conn: Mutex<Connection>,
}

impl SqliteIdentityDirectory {
    /// Opens or creates the directory at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DirectoryError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::init(conn)
    }

    /// Creates an in-memory directory (for testing).
    pub fn in_memory() -> Result<Self, DirectoryError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, DirectoryError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS identities (
                id TEXT PRIMARY KEY,
                handle TEXT NOT NULL UNIQUE,
                created_at INTEGER NOT NULL
            );",
        )?;
        Ok(SqliteIdentityDirectory {
            conn: Mutex::new(conn),
        })
    }

    fn query_one(&self, sql: &str, key: &str) -> Result<Option<Identity>, DirectoryError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let row = conn
            .query_row(sql, params![key], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .optional()?;
        Ok(row.map(|(id, handle)| Identity::new(IdentityId::from_string(id), handle)))
    }
}

impl IdentityDirectory for SqliteIdentityDirectory {
    fn resolve(&self, handle: &str) -> Result<Identity, DirectoryError> {
        self.query_one("SELECT id, handle FROM identities WHERE handle = ?1", handle)?
            .ok_or_else(|| DirectoryError::NotFound(handle.to_string()))
    }

    fn get(&self, id: &IdentityId) -> Result<Identity, DirectoryError> {
        self.query_one("SELECT id, handle FROM identities WHERE id = ?1", id.as_str())?
            .ok_or_else(|| DirectoryError::NotFound(id.to_string()))
    }

    fn register(&self, handle: &str) -> Result<Identity, DirectoryError> {
        validate_handle(handle)?;

        let identity = Identity::new(IdentityId::generate(), handle);
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO identities (id, handle, created_at) VALUES (?1, ?2, ?3)",
            params![identity.id().as_str(), handle, now as i64],
        )?;

        if inserted == 0 {
            return Err(DirectoryError::AlreadyRegistered(handle.to_string()));
        }
        Ok(identity)
    }
}
