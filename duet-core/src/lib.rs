// SPDX-FileCopyrightText: 2026 Duet Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Duet Core Library
//!
//! Session-addressed message relay for two-party chat.
//! Messages are persisted before any delivery attempt, so a recipient that is
//! offline at send time finds them in the store when it reconnects.

pub mod history;
pub mod identity;
pub mod message;
pub mod relay;
pub mod storage;

pub use history::ConversationPages;
pub use identity::{
    validate_handle, DirectoryError, Identity, IdentityDirectory, IdentityId,
    MemoryIdentityDirectory, SqliteIdentityDirectory, MAX_HANDLE_LEN,
};
pub use message::{ConversationKey, DeliveryState, Message, MessageId, MAX_BODY_BYTES};
pub use relay::{
    CloseReason, Connected, OutboundChat, RelayError, RelayOptions, SessionId, SessionManager,
    Transport, TransportError,
};
pub use storage::{
    create_message_store, MemoryMessageStore, MessageStore, SqliteMessageStore, StorageError,
    StoreLocation,
};
