// SPDX-FileCopyrightText: 2026 Duet Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Transport Trait
//!
//! The relay's view of one live client connection.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::message::{Message, MessageId};

/// Errors pushing to or closing a transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transport closed")]
    Closed,

    #[error("Transport timed out")]
    Timeout,

    #[error("Transport I/O error: {0}")]
    Io(String),
}

/// Why the relay is closing a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// A newer connection registered for the same identity.
    Superseded,
    /// The relay is shutting down.
    Shutdown,
}

/// A chat message as pushed to the recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboundChat {
    pub id: MessageId,
    /// Sender handle.
    pub sender: String,
    pub body: String,
    pub created_at: u64,
}

impl OutboundChat {
    pub fn new(message: &Message, sender_handle: &str) -> Self {
        OutboundChat {
            id: message.id,
            sender: sender_handle.to_string(),
            body: message.body.clone(),
            created_at: message.created_at,
        }
    }
}

/// A live connection the relay can push messages to.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Writes a chat message to the client.
    ///
    /// Resolves `Ok` only once the write has been confirmed by the
    /// underlying connection.
    async fn push(&self, chat: &OutboundChat) -> Result<(), TransportError>;

    /// Closes the connection. Further pushes fail.
    async fn close(&self, reason: CloseReason);
}
