// SPDX-FileCopyrightText: 2026 Duet Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Database Schema Migrations
//!
//! Each step is recorded in `schema_migrations` with its version and name.

use rusqlite::{params, Connection, Transaction, TransactionBehavior};
use tracing::info;

use super::StorageError;
use crate::message::now_millis;

/// A single schema migration step.
pub struct Migration {
    /// Monotonically increasing version number (starting at 1).
    pub version: u32,
    /// Human-readable name for this migration.
    pub name: &'static str,
    pub sql: &'static str,
}

/// Returns the message store migrations in version order.
pub fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            name: "create_messages",
            sql: "CREATE TABLE messages (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    conversation TEXT NOT NULL,
                    seq INTEGER NOT NULL,
                    sender TEXT NOT NULL,
                    recipient TEXT NOT NULL,
                    body TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    state TEXT NOT NULL DEFAULT 'stored',
                    UNIQUE (conversation, seq)
                );
                CREATE INDEX idx_messages_conversation ON messages (conversation, id);",
        },
        Migration {
            version: 2,
            name: "delivery_tracking",
            sql: "ALTER TABLE messages ADD COLUMN delivered_at INTEGER;
                CREATE INDEX idx_messages_pending ON messages (recipient, state, id);",
        },
    ]
}

/// Applies [`Migration`]s and reports the schema version.
pub struct MigrationRunner;

impl MigrationRunner {
    /// Brings the schema up to the newest of `migrations`.
    ///
    /// The version check and every pending step share one exclusive
    /// transaction, so two processes opening the same file cannot apply a
    /// step twice. Any failure leaves the schema as it was.
    pub fn run(conn: &Connection, migrations: &[Migration]) -> Result<(), StorageError> {
        if let Some(pair) = migrations
            .windows(2)
            .find(|pair| pair[0].version >= pair[1].version)
        {
            return Err(StorageError::Migration(format!(
                "v{} is listed after v{}",
                pair[1].version, pair[0].version
            )));
        }

        let tx = Transaction::new_unchecked(conn, TransactionBehavior::Exclusive)?;
        tx.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at INTEGER NOT NULL
            );",
        )?;

        let applied = Self::current_version(&tx)?;
        let mut pending = migrations.iter().filter(|m| m.version > applied).peekable();
        if pending.peek().is_none() {
            return Ok(());
        }

        for migration in pending {
            tx.execute_batch(migration.sql).map_err(|e| {
                StorageError::Migration(format!(
                    "v{} ({}) failed: {}",
                    migration.version, migration.name, e
                ))
            })?;
            tx.execute(
                "INSERT INTO schema_migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
                params![migration.version, migration.name, now_millis() as i64],
            )?;
            info!("Applied migration v{} ({})", migration.version, migration.name);
        }

        tx.commit()?;
        Ok(())
    }

    /// Highest applied version, or 0 for a database never migrated.
    pub fn current_version(conn: &Connection) -> Result<u32, StorageError> {
        let version = conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                row.get::<_, Option<u32>>(0)
            })
            .or_else(|e| match e {
                rusqlite::Error::SqliteFailure(_, Some(ref msg))
                    if msg.contains("no such table") =>
                {
                    Ok(None)
                }
                e => Err(e),
            })?;
        Ok(version.unwrap_or(0))
    }
}
