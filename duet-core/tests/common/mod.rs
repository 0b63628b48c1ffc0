// SPDX-FileCopyrightText: 2026 Duet Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Shared fixtures for duet-core integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use duet_core::{
    CloseReason, DirectoryError, Identity, IdentityDirectory, IdentityId, MemoryIdentityDirectory,
    MemoryMessageStore, Message, MessageId, MessageStore, OutboundChat, RelayOptions,
    SessionManager, StorageError, Transport, TransportError,
};

/// Transport double that records pushes and can be told to fail or hang.
#[derive(Default)]
pub struct MockTransport {
    pushed: Mutex<Vec<OutboundChat>>,
    closed: Mutex<Option<CloseReason>>,
    fail_pushes: AtomicBool,
    hang_pushes: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        let transport = Self::default();
        transport.fail_pushes.store(true, Ordering::SeqCst);
        Arc::new(transport)
    }

    pub fn hanging() -> Arc<Self> {
        let transport = Self::default();
        transport.hang_pushes.store(true, Ordering::SeqCst);
        Arc::new(transport)
    }

    pub fn bodies(&self) -> Vec<String> {
        self.pushed
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.body.clone())
            .collect()
    }

    pub fn pushed(&self) -> Vec<OutboundChat> {
        self.pushed.lock().unwrap().clone()
    }

    pub fn closed_with(&self) -> Option<CloseReason> {
        *self.closed.lock().unwrap()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn push(&self, chat: &OutboundChat) -> Result<(), TransportError> {
        if self.closed.lock().unwrap().is_some() {
            return Err(TransportError::Closed);
        }
        if self.hang_pushes.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail_pushes.load(Ordering::SeqCst) {
            return Err(TransportError::Io("connection reset".to_string()));
        }
        self.pushed.lock().unwrap().push(chat.clone());
        Ok(())
    }

    async fn close(&self, reason: CloseReason) {
        *self.closed.lock().unwrap() = Some(reason);
    }
}

/// Store double whose every operation reports the backend as down.
pub struct UnavailableStore;

#[async_trait]
impl MessageStore for UnavailableStore {
    async fn append(
        &self,
        _sender: &IdentityId,
        _recipient: &IdentityId,
        _body: &str,
    ) -> Result<Message, StorageError> {
        Err(StorageError::Unavailable("database offline".to_string()))
    }

    async fn mark_delivered(&self, _id: MessageId) -> Result<bool, StorageError> {
        Err(StorageError::Unavailable("database offline".to_string()))
    }

    async fn list_conversation(
        &self,
        _a: &IdentityId,
        _b: &IdentityId,
        _limit: usize,
        _before: Option<MessageId>,
    ) -> Result<Vec<Message>, StorageError> {
        Err(StorageError::Unavailable("database offline".to_string()))
    }

    async fn get(&self, _id: MessageId) -> Result<Option<Message>, StorageError> {
        Err(StorageError::Unavailable("database offline".to_string()))
    }

    async fn pending_for(
        &self,
        _recipient: &IdentityId,
        _limit: usize,
    ) -> Result<Vec<Message>, StorageError> {
        Err(StorageError::Unavailable("database offline".to_string()))
    }

    async fn message_count(&self) -> Result<usize, StorageError> {
        Err(StorageError::Unavailable("database offline".to_string()))
    }

    async fn health_check(&self) -> Result<(), StorageError> {
        Err(StorageError::Unavailable("database offline".to_string()))
    }
}

/// Store double whose appends never complete; reads delegate to memory.
pub struct StalledStore {
    pub inner: MemoryMessageStore,
}

#[async_trait]
impl MessageStore for StalledStore {
    async fn append(
        &self,
        _sender: &IdentityId,
        _recipient: &IdentityId,
        _body: &str,
    ) -> Result<Message, StorageError> {
        std::future::pending().await
    }

    async fn mark_delivered(&self, id: MessageId) -> Result<bool, StorageError> {
        self.inner.mark_delivered(id).await
    }

    async fn list_conversation(
        &self,
        a: &IdentityId,
        b: &IdentityId,
        limit: usize,
        before: Option<MessageId>,
    ) -> Result<Vec<Message>, StorageError> {
        self.inner.list_conversation(a, b, limit, before).await
    }

    async fn get(&self, id: MessageId) -> Result<Option<Message>, StorageError> {
        self.inner.get(id).await
    }

    async fn pending_for(
        &self,
        recipient: &IdentityId,
        limit: usize,
    ) -> Result<Vec<Message>, StorageError> {
        self.inner.pending_for(recipient, limit).await
    }

    async fn message_count(&self) -> Result<usize, StorageError> {
        self.inner.message_count().await
    }

    async fn health_check(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Directory double whose handle lookups block the calling thread first.
pub struct SlowDirectory {
    pub inner: MemoryIdentityDirectory,
    pub delay: Duration,
}

impl IdentityDirectory for SlowDirectory {
    fn resolve(&self, handle: &str) -> Result<Identity, DirectoryError> {
        std::thread::sleep(self.delay);
        self.inner.resolve(handle)
    }

    fn get(&self, id: &IdentityId) -> Result<Identity, DirectoryError> {
        self.inner.get(id)
    }

    fn register(&self, handle: &str) -> Result<Identity, DirectoryError> {
        self.inner.register(handle)
    }
}

pub fn fast_options() -> RelayOptions {
    RelayOptions {
        push_timeout: Duration::from_millis(200),
        store_timeout: Duration::from_millis(200),
        backlog_limit: 100,
    }
}

/// A relay over in-memory backends with `alice`, `bob` and `carol` registered.
pub struct Fixture {
    pub manager: SessionManager,
    pub store: Arc<dyn MessageStore>,
    pub alice: Identity,
    pub bob: Identity,
    pub carol: Identity,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_store(Arc::new(MemoryMessageStore::new()))
    }

    pub fn with_store(store: Arc<dyn MessageStore>) -> Self {
        let directory = Arc::new(MemoryIdentityDirectory::new());
        let alice = directory.register("alice").unwrap();
        let bob = directory.register("bob").unwrap();
        let carol = directory.register("carol").unwrap();

        let manager = SessionManager::new(directory, store.clone(), fast_options());
        Fixture {
            manager,
            store,
            alice,
            bob,
            carol,
        }
    }
}
