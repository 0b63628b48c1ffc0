// SPDX-FileCopyrightText: 2026 Duet Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Relay Session Manager
//!
//! Maps each identity to at most one live transport and routes messages:
//! every message is appended to the store first, then pushed to the
//! recipient's live session if there is one.
//!
//! Each identity has its own slot lock. `connect`, `disconnect` and the
//! delivery half of `send` for a recipient run under that recipient's slot,
//! so a push never reaches a transport that has already been superseded and
//! pushes to one recipient follow id order.

mod transport;

pub use transport::{CloseReason, OutboundChat, Transport, TransportError};

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::identity::{DirectoryError, Identity, IdentityDirectory, IdentityId};
use crate::message::{DeliveryState, Message, MessageId};
use crate::storage::{MessageStore, StorageError};

/// Slack added to the store timeout so the store's own commit deadline
/// fires first and a late commit is rolled back rather than abandoned.
const STORE_COMMIT_GRACE: Duration = Duration::from_millis(250);

/// Relay error types.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Recipient not found: {0}")]
    RecipientNotFound(String),

    #[error("Unknown identity: {0}")]
    UnknownIdentity(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),
}

impl RelayError {
    /// Returns true for handle or identity lookup misses.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            RelayError::RecipientNotFound(_) | RelayError::UnknownIdentity(_)
        )
    }
}

/// Process-unique id of one registered session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Result of registering a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connected {
    pub session: SessionId,
    /// The session this connection replaced, already closed.
    pub superseded: Option<SessionId>,
}

/// Timeouts and limits for the session manager.
#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// Upper bound on a single push (and on closing a superseded transport).
    pub push_timeout: Duration,
    /// Upper bound on a single store operation or directory lookup.
    pub store_timeout: Duration,
    /// Maximum stored messages pushed by one `deliver_backlog` call.
    pub backlog_limit: usize,
}

impl Default for RelayOptions {
    fn default() -> Self {
        RelayOptions {
            push_timeout: Duration::from_secs(5),
            store_timeout: Duration::from_secs(5),
            backlog_limit: 500,
        }
    }
}

struct LiveSession {
    id: SessionId,
    transport: Arc<dyn Transport>,
}

#[derive(Default)]
struct Slot {
    live: Option<LiveSession>,
}

type SlotHandle = Arc<AsyncMutex<Slot>>;

/// Routes messages between identities and owns all live sessions.
pub struct SessionManager {
    directory: Arc<dyn IdentityDirectory>,
    store: Arc<dyn MessageStore>,
    options: RelayOptions,
    slots: Mutex<HashMap<IdentityId, SlotHandle>>,
    next_session: AtomicU64,
    live_sessions: AtomicUsize,
}

impl SessionManager {
    pub fn new(
        directory: Arc<dyn IdentityDirectory>,
        store: Arc<dyn MessageStore>,
        options: RelayOptions,
    ) -> Self {
        SessionManager {
            directory,
            store,
            options,
            slots: Mutex::new(HashMap::new()),
            next_session: AtomicU64::new(1),
            live_sessions: AtomicUsize::new(0),
        }
    }

    pub fn directory(&self) -> &Arc<dyn IdentityDirectory> {
        &self.directory
    }

    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    pub fn options(&self) -> &RelayOptions {
        &self.options
    }

    /// Registers `transport` as the live session for `identity`.
    ///
    /// An existing session for the same identity is closed with
    /// [`CloseReason::Superseded`] before the new one is installed.
    pub async fn connect(
        &self,
        identity: &Identity,
        transport: Arc<dyn Transport>,
    ) -> Result<Connected, RelayError> {
        self.ensure_known(identity).await?;

        let session = SessionId(self.next_session.fetch_add(1, Ordering::Relaxed));
        let slot = self.slot(identity.id());
        let mut guard = slot.lock().await;

        let superseded = match guard.live.take() {
            Some(old) => {
                info!(
                    "{} superseded by {} for {}",
                    old.id,
                    session,
                    identity.handle()
                );
                if timeout(
                    self.options.push_timeout,
                    old.transport.close(CloseReason::Superseded),
                )
                .await
                .is_err()
                {
                    warn!("Timed out closing superseded {}", old.id);
                }
                Some(old.id)
            }
            None => {
                self.live_sessions.fetch_add(1, Ordering::Relaxed);
                None
            }
        };

        guard.live = Some(LiveSession {
            id: session,
            transport,
        });
        debug!("{} registered for {}", session, identity.handle());

        Ok(Connected {
            session,
            superseded,
        })
    }

    /// Removes the live session for `identity`, whichever it is.
    ///
    /// Idempotent. Returns true if a session was removed.
    pub async fn disconnect(&self, identity: &IdentityId) -> bool {
        self.remove_session(identity, None).await
    }

    /// Removes the live session for `identity` only if it is still `session`.
    ///
    /// A connection that was superseded calls this on close without evicting
    /// its successor.
    pub async fn disconnect_session(&self, identity: &IdentityId, session: SessionId) -> bool {
        self.remove_session(identity, Some(session)).await
    }

    /// Persists a message and pushes it to the recipient if connected.
    ///
    /// Fails only if the recipient cannot be resolved, the message is invalid,
    /// or the store cannot record it. Delivery failures leave the message
    /// `Stored` and are not reported. The returned message carries the
    /// delivery state reached by this call.
    pub async fn send(
        &self,
        sender: &Identity,
        recipient_handle: &str,
        body: &str,
    ) -> Result<Message, RelayError> {
        let recipient = self.resolve_peer(recipient_handle).await?;
        self.ensure_known(sender).await?;
        if recipient.id() == sender.id() {
            return Err(RelayError::InvalidMessage(
                "cannot send a message to yourself".to_string(),
            ));
        }

        let slot = self.slot(recipient.id());
        let result = self.send_locked(&slot, sender, &recipient, body).await;
        drop(slot);
        self.release_slot(recipient.id());
        result
    }

    async fn send_locked(
        &self,
        slot: &SlotHandle,
        sender: &Identity,
        recipient: &Identity,
        body: &str,
    ) -> Result<Message, RelayError> {
        let guard = slot.lock().await;

        let mut message = self.append(sender, recipient, body).await?;

        match guard.live.as_ref() {
            Some(live) => {
                let chat = OutboundChat::new(&message, sender.handle());
                if self.push(live, &chat).await && self.settle(message.id).await {
                    message.delivery_state = DeliveryState::Delivered;
                }
            }
            None => debug!(
                "{} offline, message {} kept for later",
                recipient.handle(),
                message.id
            ),
        }

        Ok(message)
    }

    /// Pushes stored messages addressed to `identity` over its live session.
    ///
    /// Oldest first, up to the configured backlog limit. Stops at the first
    /// failed push. Returns the number of messages delivered.
    pub async fn deliver_backlog(&self, identity: &Identity) -> Result<usize, RelayError> {
        let slot = self.slot(identity.id());
        let result = self.backlog_locked(&slot, identity).await;
        drop(slot);
        self.release_slot(identity.id());
        result
    }

    async fn backlog_locked(
        &self,
        slot: &SlotHandle,
        identity: &Identity,
    ) -> Result<usize, RelayError> {
        let guard = slot.lock().await;
        let Some(live) = guard.live.as_ref() else {
            return Ok(0);
        };

        let pending = self
            .bounded(self.store.pending_for(identity.id(), self.options.backlog_limit))
            .await?;

        let mut delivered = 0;
        for message in pending {
            let sender_id = message.sender.clone();
            let sender = match self.lookup(move |directory| directory.get(&sender_id)).await {
                Ok(sender) => sender,
                Err(e) => {
                    warn!("Skipping message {}: sender lookup failed: {}", message.id, e);
                    continue;
                }
            };
            if !self.push(live, &OutboundChat::new(&message, sender.handle())).await {
                break;
            }
            if self.settle(message.id).await {
                delivered += 1;
            }
        }

        if delivered > 0 {
            debug!("Delivered {} stored messages to {}", delivered, identity.handle());
        }
        Ok(delivered)
    }

    /// Returns the conversation between `identity` and `peer_handle`.
    pub async fn history(
        &self,
        identity: &Identity,
        peer_handle: &str,
        limit: usize,
        before: Option<MessageId>,
    ) -> Result<Vec<Message>, RelayError> {
        let peer = self.resolve_peer(peer_handle).await?;
        self.bounded(
            self.store
                .list_conversation(identity.id(), peer.id(), limit, before),
        )
        .await
    }

    /// Returns true if `identity` currently has a live session.
    pub async fn is_connected(&self, identity: &IdentityId) -> bool {
        let slot = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(identity)
            .cloned();
        match slot {
            Some(slot) => slot.lock().await.live.is_some(),
            None => false,
        }
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.live_sessions.load(Ordering::Relaxed)
    }

    /// Closes every live session with [`CloseReason::Shutdown`].
    pub async fn shutdown(&self) {
        let slots: Vec<SlotHandle> = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        for slot in slots {
            let mut guard = slot.lock().await;
            if let Some(live) = guard.live.take() {
                self.live_sessions.fetch_sub(1, Ordering::Relaxed);
                let _ = timeout(
                    self.options.push_timeout,
                    live.transport.close(CloseReason::Shutdown),
                )
                .await;
            }
        }
    }

    fn slot(&self, identity: &IdentityId) -> SlotHandle {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(identity.clone())
            .or_default()
            .clone()
    }

    /// Drops the slot for `identity` if it is empty and nobody else holds it.
    ///
    /// Handles are only cloned under the map lock, so a strong count of one
    /// seen under that lock means no task can reach this slot.
    fn release_slot(&self, identity: &IdentityId) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let idle = slots.get(identity).is_some_and(|slot| {
            Arc::strong_count(slot) == 1
                && slot.try_lock().map(|s| s.live.is_none()).unwrap_or(false)
        });
        if idle {
            slots.remove(identity);
        }
    }

    async fn remove_session(&self, identity: &IdentityId, only: Option<SessionId>) -> bool {
        let slot = self.slot(identity);
        let removed = {
            let mut guard = slot.lock().await;
            let matches = match (&guard.live, only) {
                (Some(live), Some(session)) => live.id == session,
                (Some(_), None) => true,
                (None, _) => false,
            };
            if matches {
                if let Some(live) = guard.live.take() {
                    debug!("{} removed for {}", live.id, identity);
                }
                self.live_sessions.fetch_sub(1, Ordering::Relaxed);
            }
            matches
        };
        drop(slot);
        self.release_slot(identity);
        removed
    }

    async fn resolve_peer(&self, handle: &str) -> Result<Identity, RelayError> {
        let owned = handle.to_string();
        match self.lookup(move |directory| directory.resolve(&owned)).await {
            Ok(identity) => Ok(identity),
            Err(DirectoryError::NotFound(_)) => Err(RelayError::RecipientNotFound(handle.to_string())),
            Err(e) => Err(RelayError::Directory(e)),
        }
    }

    async fn ensure_known(&self, identity: &Identity) -> Result<(), RelayError> {
        let id = identity.id().clone();
        match self.lookup(move |directory| directory.get(&id)).await {
            Ok(found) if found.handle() == identity.handle() => Ok(()),
            Ok(_) | Err(DirectoryError::NotFound(_)) => {
                Err(RelayError::UnknownIdentity(identity.handle().to_string()))
            }
            Err(e) => Err(RelayError::Directory(e)),
        }
    }

    /// Runs a directory call on the blocking pool under the store timeout.
    async fn lookup<T, F>(&self, op: F) -> Result<T, DirectoryError>
    where
        F: FnOnce(&dyn IdentityDirectory) -> Result<T, DirectoryError> + Send + 'static,
        T: Send + 'static,
    {
        let directory = self.directory.clone();
        let task = tokio::task::spawn_blocking(move || op(directory.as_ref()));
        match timeout(self.options.store_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(DirectoryError::Unavailable(format!("lookup failed: {}", e))),
            Err(_) => {
                warn!("Directory lookup timed out");
                Err(DirectoryError::Unavailable("directory lookup timed out".to_string()))
            }
        }
    }

    async fn append(
        &self,
        sender: &Identity,
        recipient: &Identity,
        body: &str,
    ) -> Result<Message, RelayError> {
        let result = timeout(
            self.options.store_timeout + STORE_COMMIT_GRACE,
            self.store.append(sender.id(), recipient.id(), body),
        )
        .await;

        match result {
            Ok(Ok(message)) => Ok(message),
            Ok(Err(e)) if e.is_invalid_message() => Err(RelayError::InvalidMessage(e.to_string())),
            Ok(Err(e)) => {
                warn!("Append from {} failed: {}", sender.handle(), e);
                Err(RelayError::StoreUnavailable(e.to_string()))
            }
            Err(_) => {
                warn!("Append from {} timed out", sender.handle());
                Err(RelayError::StoreUnavailable("store write timed out".to_string()))
            }
        }
    }

    /// Runs a read against the store under the store timeout.
    async fn bounded<T>(
        &self,
        op: impl std::future::Future<Output = Result<T, StorageError>>,
    ) -> Result<T, RelayError> {
        match timeout(self.options.store_timeout, op).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(RelayError::StoreUnavailable(e.to_string())),
            Err(_) => Err(RelayError::StoreUnavailable("store read timed out".to_string())),
        }
    }

    /// Pushes to a live session. Failures are logged and reported as false.
    async fn push(&self, live: &LiveSession, chat: &OutboundChat) -> bool {
        match timeout(self.options.push_timeout, live.transport.push(chat)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!("Push of message {} to {} failed: {}", chat.id, live.id, e);
                false
            }
            Err(_) => {
                warn!(
                    "Push of message {} to {} failed: {}",
                    chat.id,
                    live.id,
                    TransportError::Timeout
                );
                false
            }
        }
    }

    /// Marks a pushed message delivered. Failures leave it `Stored`.
    async fn settle(&self, id: MessageId) -> bool {
        match timeout(self.options.store_timeout, self.store.mark_delivered(id)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                warn!("Could not mark message {} delivered: {}", id, e);
                false
            }
            Err(_) => {
                warn!("Timed out marking message {} delivered", id);
                false
            }
        }
    }
}
