// SPDX-FileCopyrightText: 2026 Duet Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Wire Protocol
//!
//! JSON text frames exchanged over the WebSocket.
//!
//! Client to relay: a chat is `{"recipient": .., "body": ..}` with an
//! optional `"type": "chat"`; other requests carry a `type` tag.
//! Relay to client: every frame carries a `type` tag.

use duet_core::{IdentityId, Message, MessageId, OutboundChat};
use serde::{Deserialize, Serialize};

/// A chat submission.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChatRequest {
    /// Recipient handle.
    pub recipient: String,
    pub body: String,
}

/// A request for one page of conversation history.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HistoryRequest {
    /// Peer handle.
    pub with: String,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub before: Option<MessageId>,
}

/// A decoded client frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Chat(ChatRequest),
    History(HistoryRequest),
    Ping,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum TaggedFrame {
    Chat(ChatRequest),
    History(HistoryRequest),
    Ping,
}

impl ClientFrame {
    /// Decodes a text frame.
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        if value.get("type").is_some() {
            Ok(match serde_json::from_value(value)? {
                TaggedFrame::Chat(chat) => ClientFrame::Chat(chat),
                TaggedFrame::History(history) => ClientFrame::History(history),
                TaggedFrame::Ping => ClientFrame::Ping,
            })
        } else {
            serde_json::from_value(value).map(ClientFrame::Chat)
        }
    }
}

/// One message in a history page, with both parties named by handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryEntry {
    pub id: MessageId,
    pub sender: String,
    pub recipient: String,
    pub body: String,
    pub created_at: u64,
    pub delivered: bool,
}

impl HistoryEntry {
    /// Builds an entry for a message between `own` and `peer`.
    pub fn new(message: &Message, own: (&IdentityId, &str), peer_handle: &str) -> Self {
        let (own_id, own_handle) = own;
        let (sender, recipient) = if &message.sender == own_id {
            (own_handle, peer_handle)
        } else {
            (peer_handle, own_handle)
        };
        HistoryEntry {
            id: message.id,
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            body: message.body.clone(),
            created_at: message.created_at,
            delivered: message.is_delivered(),
        }
    }
}

/// Client-facing failure categories carried in `error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorReason {
    RecipientNotFound,
    UnknownIdentity,
    InvalidMessage,
    StoreUnavailable,
    RateLimited,
    MessageTooLarge,
    InvalidFrame,
}

/// A frame sent by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// A message pushed to its recipient.
    Chat(OutboundChat),
    /// The sender's message was stored.
    Sent {
        id: MessageId,
        recipient: String,
        created_at: u64,
    },
    History {
        with: String,
        messages: Vec<HistoryEntry>,
    },
    Error {
        reason: ErrorReason,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    Pong,
}

impl ServerFrame {
    pub fn error(reason: ErrorReason, detail: impl Into<String>) -> Self {
        ServerFrame::Error {
            reason,
            detail: Some(detail.into()),
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_untagged_chat() {
        let frame = ClientFrame::decode(r#"{"recipient":"bob","body":"hi"}"#).unwrap();
        assert_eq!(
            frame,
            ClientFrame::Chat(ChatRequest {
                recipient: "bob".to_string(),
                body: "hi".to_string(),
            })
        );
    }

    #[test]
    fn test_decode_tagged_frames() {
        let chat = ClientFrame::decode(r#"{"type":"chat","recipient":"bob","body":"x"}"#).unwrap();
        assert!(matches!(chat, ClientFrame::Chat(_)));

        let history =
            ClientFrame::decode(r#"{"type":"history","with":"alice","limit":20,"before":7}"#)
                .unwrap();
        assert_eq!(
            history,
            ClientFrame::History(HistoryRequest {
                with: "alice".to_string(),
                limit: Some(20),
                before: Some(MessageId(7)),
            })
        );

        assert_eq!(ClientFrame::decode(r#"{"type":"ping"}"#).unwrap(), ClientFrame::Ping);
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert!(ClientFrame::decode("not json").is_err());
        assert!(ClientFrame::decode(r#"{"body":"missing recipient"}"#).is_err());
        assert!(ClientFrame::decode(r#"{"type":"subscribe"}"#).is_err());
        assert!(ClientFrame::decode(r#"{"recipient":"bob","body":42}"#).is_err());
    }

    #[test]
    fn test_chat_frame_shape() {
        let frame = ServerFrame::Chat(OutboundChat {
            id: MessageId(3),
            sender: "alice".to_string(),
            body: "hi".to_string(),
            created_at: 1000,
        });
        let value: serde_json::Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type": "chat", "id": 3, "sender": "alice", "body": "hi", "created_at": 1000})
        );
    }

    #[test]
    fn test_error_frame_shape() {
        let frame = ServerFrame::error(ErrorReason::RecipientNotFound, "mallory");
        let value: serde_json::Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type": "error", "reason": "recipient_not_found", "detail": "mallory"})
        );

        let pong: serde_json::Value =
            serde_json::from_str(&ServerFrame::Pong.encode().unwrap()).unwrap();
        assert_eq!(pong, json!({"type": "pong"}));
    }
}
