// SPDX-FileCopyrightText: 2026 Duet Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! SQLite message store.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, warn};

use super::migration::{all_migrations, MigrationRunner};
use super::{validate_submission, MessageStore, StorageError};
use crate::identity::IdentityId;
use crate::message::{now_millis, ConversationKey, DeliveryState, Message, MessageId};

const MESSAGE_COLUMNS: &str = "id, seq, sender, recipient, body, created_at, state";

/// Message store backed by a single SQLite connection.
///
/// Work runs on the blocking thread pool. All writes go through one
/// connection, so id and sequence allocation are serialised per database.
pub struct SqliteMessageStore {
    conn: Arc<Mutex<Connection>>,
    op_timeout: Duration,
}

impl SqliteMessageStore {
    /// Opens or creates a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P, op_timeout: Duration) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        Self::init(conn, op_timeout)
    }

    /// Creates an in-memory store (for testing).
    pub fn in_memory() -> Result<Self, StorageError> {
        Self::init(Connection::open_in_memory()?, Duration::from_secs(5))
    }

    fn init(conn: Connection, op_timeout: Duration) -> Result<Self, StorageError> {
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.busy_timeout(op_timeout)?;
        MigrationRunner::run(&conn, &all_migrations())?;
        Ok(SqliteMessageStore {
            conn: Arc::new(Mutex::new(conn)),
            op_timeout,
        })
    }

    /// Returns the current schema version.
    pub fn schema_version(&self) -> Result<u32, StorageError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        MigrationRunner::current_version(&conn)
    }

    /// Runs `op` against the connection on the blocking pool.
    async fn run<T, F>(&self, op: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StorageError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            op(&mut *conn)
        })
        .await
        .map_err(|e| StorageError::Unavailable(format!("storage task failed: {}", e)))?
    }
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    let state: String = row.get(6)?;
    let delivery_state = DeliveryState::parse(&state).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            6,
            rusqlite::types::Type::Text,
            format!("unknown delivery state: {}", state).into(),
        )
    })?;

    Ok(Message {
        id: MessageId(row.get::<_, i64>(0)? as u64),
        seq: row.get::<_, i64>(1)? as u64,
        sender: IdentityId::from_string(row.get::<_, String>(2)?),
        recipient: IdentityId::from_string(row.get::<_, String>(3)?),
        body: row.get(4)?,
        created_at: row.get::<_, i64>(5)? as u64,
        delivery_state,
    })
}

fn to_sql_id(id: MessageId) -> i64 {
    i64::try_from(id.0).unwrap_or(i64::MAX)
}

fn to_sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn append(
        &self,
        sender: &IdentityId,
        recipient: &IdentityId,
        body: &str,
    ) -> Result<Message, StorageError> {
        validate_submission(sender, recipient, body)?;

        let deadline = Instant::now() + self.op_timeout;
        let conversation = ConversationKey::new(sender, recipient).storage_key();
        let sender = sender.clone();
        let recipient = recipient.clone();
        let body = body.to_string();

        self.run(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let seq: i64 = tx.query_row(
                "SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE conversation = ?1",
                params![conversation],
                |row| row.get(0),
            )?;
            let created_at = now_millis();
            tx.execute(
                "INSERT INTO messages (conversation, seq, sender, recipient, body, created_at, state)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'stored')",
                params![
                    conversation,
                    seq,
                    sender.as_str(),
                    recipient.as_str(),
                    body,
                    created_at as i64,
                ],
            )?;
            let id = tx.last_insert_rowid();

            // Dropping the transaction rolls it back.
            if Instant::now() >= deadline {
                warn!("append exceeded its deadline before commit, rolling back");
                return Err(StorageError::Unavailable(
                    "write deadline exceeded".to_string(),
                ));
            }
            tx.commit()?;

            Ok(Message {
                id: MessageId(id as u64),
                seq: seq as u64,
                sender,
                recipient,
                body,
                created_at,
                delivery_state: DeliveryState::Stored,
            })
        })
        .await
    }

    async fn mark_delivered(&self, id: MessageId) -> Result<bool, StorageError> {
        self.run(move |conn| {
            let updated = conn.execute(
                "UPDATE messages SET state = 'delivered', delivered_at = ?2
                 WHERE id = ?1 AND state = 'stored'",
                params![to_sql_id(id), now_millis() as i64],
            )?;
            if updated > 0 {
                return Ok(true);
            }

            let exists: bool = conn.query_row(
                "SELECT COUNT(*) > 0 FROM messages WHERE id = ?1",
                params![to_sql_id(id)],
                |row| row.get(0),
            )?;
            if !exists {
                debug!("mark_delivered: message {} not found, ignoring", id);
            }
            Ok(false)
        })
        .await
    }

    async fn list_conversation(
        &self,
        a: &IdentityId,
        b: &IdentityId,
        limit: usize,
        before: Option<MessageId>,
    ) -> Result<Vec<Message>, StorageError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let conversation = ConversationKey::new(a, b).storage_key();
        let before = before.map(to_sql_id).unwrap_or(i64::MAX);

        self.run(move |conn| {
            let sql = format!(
                "SELECT {cols} FROM (
                    SELECT {cols} FROM messages
                    WHERE conversation = ?1 AND id < ?2
                    ORDER BY id DESC LIMIT ?3
                 ) ORDER BY id ASC",
                cols = MESSAGE_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                params![conversation, before, to_sql_limit(limit)],
                row_to_message,
            )?;
            rows.collect::<Result<Vec<_>, _>>()
                .map_err(StorageError::Database)
        })
        .await
    }

    async fn get(&self, id: MessageId) -> Result<Option<Message>, StorageError> {
        self.run(move |conn| {
            let sql = format!("SELECT {} FROM messages WHERE id = ?1", MESSAGE_COLUMNS);
            conn.query_row(&sql, params![to_sql_id(id)], row_to_message)
                .optional()
                .map_err(StorageError::Database)
        })
        .await
    }

    async fn pending_for(
        &self,
        recipient: &IdentityId,
        limit: usize,
    ) -> Result<Vec<Message>, StorageError> {
        let recipient = recipient.clone();
        self.run(move |conn| {
            let sql = format!(
                "SELECT {} FROM messages
                 WHERE recipient = ?1 AND state = 'stored'
                 ORDER BY id ASC LIMIT ?2",
                MESSAGE_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                params![recipient.as_str(), to_sql_limit(limit)],
                row_to_message,
            )?;
            rows.collect::<Result<Vec<_>, _>>()
                .map_err(StorageError::Database)
        })
        .await
    }

    async fn message_count(&self) -> Result<usize, StorageError> {
        self.run(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
            Ok(count as usize)
        })
        .await
    }

    async fn health_check(&self) -> Result<(), StorageError> {
        self.run(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
        .await
    }
}
