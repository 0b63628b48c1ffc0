// SPDX-FileCopyrightText: 2026 Duet Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Message data model.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::identity::IdentityId;

/// Maximum message body size accepted by the store, in bytes.
pub const MAX_BODY_BYTES: usize = 64 * 1024;

/// Store-assigned message id.
///
/// Globally unique and strictly increasing in append order, so ordering by
/// id within a conversation is the append order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Delivery progress of a stored message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    /// Persisted, not yet pushed to a live session.
    Stored,
    /// Pushed to the recipient's live session and confirmed by the transport.
    Delivered,
}

impl DeliveryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryState::Stored => "stored",
            DeliveryState::Delivered => "delivered",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "stored" => Some(DeliveryState::Stored),
            "delivered" => Some(DeliveryState::Delivered),
            _ => None,
        }
    }
}

/// The unordered pair of identities whose messages form one thread.
///
/// Stored in canonical order so `{a, b}` and `{b, a}` compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConversationKey {
    low: IdentityId,
    high: IdentityId,
}

impl ConversationKey {
    pub fn new(a: &IdentityId, b: &IdentityId) -> Self {
        if a <= b {
            ConversationKey {
                low: a.clone(),
                high: b.clone(),
            }
        } else {
            ConversationKey {
                low: b.clone(),
                high: a.clone(),
            }
        }
    }

    /// Returns true if `id` is one of the two participants.
    pub fn involves(&self, id: &IdentityId) -> bool {
        &self.low == id || &self.high == id
    }

    /// Stable string form used as a storage key.
    pub fn storage_key(&self) -> String {
        format!("{}:{}", self.low, self.high)
    }
}

/// An immutable message record.
///
/// Only `delivery_state` ever changes, and only from `Stored` to `Delivered`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    /// Position within the conversation, starting at 1.
    pub seq: u64,
    pub sender: IdentityId,
    pub recipient: IdentityId,
    pub body: String,
    /// Unix timestamp in milliseconds.
    pub created_at: u64,
    pub delivery_state: DeliveryState,
}

impl Message {
    pub fn conversation(&self) -> ConversationKey {
        ConversationKey::new(&self.sender, &self.recipient)
    }

    pub fn is_delivered(&self) -> bool {
        self.delivery_state == DeliveryState::Delivered
    }
}

/// Current time as Unix milliseconds.
pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
