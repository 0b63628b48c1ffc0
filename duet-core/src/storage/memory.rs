// SPDX-FileCopyrightText: 2026 Duet Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! In-memory message store.
//!
//! Not durable across restarts. Used in tests and for `memory` deployments.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use tracing::debug;

use super::{validate_submission, MessageStore, StorageError};
use crate::identity::IdentityId;
use crate::message::{now_millis, ConversationKey, DeliveryState, Message, MessageId};

/// Messages of one conversation, ascending by id.
type ConversationLog = Arc<Mutex<Vec<Message>>>;

/// Message store held in process memory.
///
/// Each conversation has its own lock; ids are drawn while that lock is held,
/// so appends to one conversation are totally ordered without blocking others.
pub struct MemoryMessageStore {
    conversations: RwLock<HashMap<ConversationKey, ConversationLog>>,
    index: RwLock<HashMap<MessageId, ConversationKey>>,
    next_id: AtomicU64,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        MemoryMessageStore {
            conversations: RwLock::new(HashMap::new()),
            index: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn log_for(&self, key: &ConversationKey) -> Option<ConversationLog> {
        self.conversations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn log_or_create(&self, key: ConversationKey) -> ConversationLog {
        if let Some(log) = self.log_for(&key) {
            return log;
        }
        self.conversations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key)
            .or_default()
            .clone()
    }
}

impl Default for MemoryMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn append(
        &self,
        sender: &IdentityId,
        recipient: &IdentityId,
        body: &str,
    ) -> Result<Message, StorageError> {
        validate_submission(sender, recipient, body)?;

        let key = ConversationKey::new(sender, recipient);
        let log = self.log_or_create(key.clone());
        let mut messages = log.lock().unwrap_or_else(PoisonError::into_inner);

        let message = Message {
            id: MessageId(self.next_id.fetch_add(1, Ordering::SeqCst)),
            seq: messages.len() as u64 + 1,
            sender: sender.clone(),
            recipient: recipient.clone(),
            body: body.to_string(),
            created_at: now_millis(),
            delivery_state: DeliveryState::Stored,
        };
        messages.push(message.clone());

        self.index
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(message.id, key);

        Ok(message)
    }

    async fn mark_delivered(&self, id: MessageId) -> Result<bool, StorageError> {
        let key = self
            .index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned();

        let Some(log) = key.and_then(|key| self.log_for(&key)) else {
            debug!("mark_delivered: message {} not found, ignoring", id);
            return Ok(false);
        };

        let mut messages = log.lock().unwrap_or_else(PoisonError::into_inner);
        match messages.binary_search_by_key(&id, |m| m.id) {
            Ok(pos) if messages[pos].delivery_state == DeliveryState::Stored => {
                messages[pos].delivery_state = DeliveryState::Delivered;
                Ok(true)
            }
            Ok(_) => Ok(false),
            Err(_) => {
                debug!("mark_delivered: message {} not found, ignoring", id);
                Ok(false)
            }
        }
    }

    async fn list_conversation(
        &self,
        a: &IdentityId,
        b: &IdentityId,
        limit: usize,
        before: Option<MessageId>,
    ) -> Result<Vec<Message>, StorageError> {
        let Some(log) = self.log_for(&ConversationKey::new(a, b)) else {
            return Ok(Vec::new());
        };

        let messages = log.lock().unwrap_or_else(PoisonError::into_inner);
        let end = match before {
            Some(before) => messages.partition_point(|m| m.id < before),
            None => messages.len(),
        };
        let start = end.saturating_sub(limit);
        Ok(messages[start..end].to_vec())
    }

    async fn get(&self, id: MessageId) -> Result<Option<Message>, StorageError> {
        let key = self
            .index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned();

        Ok(key.and_then(|key| self.log_for(&key)).and_then(|log| {
            let messages = log.lock().unwrap_or_else(PoisonError::into_inner);
            let found = messages
                .binary_search_by_key(&id, |m| m.id)
                .ok()
                .map(|pos| messages[pos].clone());
            found
        }))
    }

    async fn pending_for(
        &self,
        recipient: &IdentityId,
        limit: usize,
    ) -> Result<Vec<Message>, StorageError> {
        let logs: Vec<ConversationLog> = self
            .conversations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(key, _)| key.involves(recipient))
            .map(|(_, log)| log.clone())
            .collect();

        let mut pending: Vec<Message> = logs
            .iter()
            .flat_map(|log| {
                let messages = log.lock().unwrap_or_else(PoisonError::into_inner);
                let inbound: Vec<Message> = messages
                    .iter()
                    .filter(|m| &m.recipient == recipient && !m.is_delivered())
                    .cloned()
                    .collect();
                inbound
            })
            .collect();

        pending.sort_by_key(|m| m.id);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn message_count(&self) -> Result<usize, StorageError> {
        Ok(self
            .index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len())
    }

    async fn health_check(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> (IdentityId, IdentityId) {
        (IdentityId::generate(), IdentityId::generate())
    }

    #[tokio::test]
    async fn test_append_assigns_increasing_ids_and_seq() {
        let store = MemoryMessageStore::new();
        let (alice, bob) = ids();

        let first = store.append(&alice, &bob, "one").await.unwrap();
        let second = store.append(&bob, &alice, "two").await.unwrap();

        assert!(second.id > first.id);
        assert_eq!(first.seq, 1);
        assert_eq!(second.seq, 2);
        assert_eq!(first.delivery_state, DeliveryState::Stored);
    }

    #[tokio::test]
    async fn test_list_pages_backwards() {
        let store = MemoryMessageStore::new();
        let (alice, bob) = ids();
        for i in 0..5 {
            store.append(&alice, &bob, &format!("m{}", i)).await.unwrap();
        }

        let latest = store.list_conversation(&alice, &bob, 2, None).await.unwrap();
        let bodies: Vec<_> = latest.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, ["m3", "m4"]);

        let older = store
            .list_conversation(&bob, &alice, 10, Some(latest[0].id))
            .await
            .unwrap();
        let bodies: Vec<_> = older.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, ["m0", "m1", "m2"]);
    }

    #[tokio::test]
    async fn test_mark_delivered_unknown_is_noop() {
        let store = MemoryMessageStore::new();
        assert!(!store.mark_delivered(MessageId(42)).await.unwrap());
    }

    #[tokio::test]
    async fn test_pending_for_only_undelivered_inbound() {
        let store = MemoryMessageStore::new();
        let (alice, bob) = ids();
        let carol = IdentityId::generate();

        let m1 = store.append(&alice, &bob, "to bob 1").await.unwrap();
        store.append(&bob, &alice, "to alice").await.unwrap();
        let m3 = store.append(&carol, &bob, "to bob 2").await.unwrap();
        store.mark_delivered(m1.id).await.unwrap();

        let pending = store.pending_for(&bob, 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, m3.id);
    }

    #[tokio::test]
    async fn test_self_addressed_rejected() {
        let store = MemoryMessageStore::new();
        let (alice, _) = ids();

        let err = store.append(&alice, &alice, "me").await.unwrap_err();
        assert!(err.is_invalid_message());
        assert_eq!(store.message_count().await.unwrap(), 0);
    }
}
