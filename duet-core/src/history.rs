// SPDX-FileCopyrightText: 2026 Duet Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Conversation History Paging
//!
//! Walks a conversation from newest to oldest using the `before` cursor of
//! [`MessageStore::list_conversation`]. No state is kept in the store.

use std::sync::Arc;

use crate::identity::IdentityId;
use crate::message::{Message, MessageId};
use crate::storage::{MessageStore, StorageError};

/// Lazy, finite pager over one conversation.
///
/// Each page is ascending by id; pages arrive newest first. Dropping the
/// pager and building a new one restarts from the latest message.
pub struct ConversationPages {
    store: Arc<dyn MessageStore>,
    a: IdentityId,
    b: IdentityId,
    page_size: usize,
    cursor: Option<MessageId>,
    exhausted: bool,
}

impl ConversationPages {
    pub fn new(
        store: Arc<dyn MessageStore>,
        a: IdentityId,
        b: IdentityId,
        page_size: usize,
    ) -> Self {
        ConversationPages {
            store,
            a,
            b,
            page_size,
            cursor: None,
            exhausted: page_size == 0,
        }
    }

    /// Starts paging below `before` instead of at the latest message.
    pub fn starting_before(mut self, before: MessageId) -> Self {
        self.cursor = Some(before);
        self
    }

    /// Fetches the next (older) page, or `None` once the start is reached.
    pub async fn next_page(&mut self) -> Result<Option<Vec<Message>>, StorageError> {
        if self.exhausted {
            return Ok(None);
        }

        let page = self
            .store
            .list_conversation(&self.a, &self.b, self.page_size, self.cursor)
            .await?;

        if page.len() < self.page_size {
            self.exhausted = true;
        }
        match page.first() {
            Some(oldest) => {
                self.cursor = Some(oldest.id);
                Ok(Some(page))
            }
            None => {
                self.exhausted = true;
                Ok(None)
            }
        }
    }

    /// Reads every remaining page and returns the messages in ascending order.
    pub async fn collect_all(mut self) -> Result<Vec<Message>, StorageError> {
        let mut pages = Vec::new();
        while let Some(page) = self.next_page().await? {
            pages.push(page);
        }
        Ok(pages.into_iter().rev().flatten().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryMessageStore;

    #[tokio::test]
    async fn test_pages_cover_conversation_without_gaps() {
        let store: Arc<dyn MessageStore> = Arc::new(MemoryMessageStore::new());
        let alice = IdentityId::generate();
        let bob = IdentityId::generate();
        for i in 0..7 {
            store.append(&alice, &bob, &format!("m{}", i)).await.unwrap();
        }

        let mut pages = ConversationPages::new(store.clone(), alice.clone(), bob.clone(), 3);
        let mut sizes = Vec::new();
        while let Some(page) = pages.next_page().await.unwrap() {
            sizes.push(page.len());
        }
        assert_eq!(sizes, vec![3, 3, 1]);

        let all = ConversationPages::new(store, alice, bob, 3)
            .collect_all()
            .await
            .unwrap();
        let bodies: Vec<_> = all.iter().map(|m| m.body.clone()).collect();
        let expected: Vec<_> = (0..7).map(|i| format!("m{}", i)).collect();
        assert_eq!(bodies, expected);
    }

    #[tokio::test]
    async fn test_empty_conversation_yields_no_pages() {
        let store: Arc<dyn MessageStore> = Arc::new(MemoryMessageStore::new());
        let mut pages =
            ConversationPages::new(store, IdentityId::generate(), IdentityId::generate(), 10);
        assert!(pages.next_page().await.unwrap().is_none());
    }
}
