// SPDX-FileCopyrightText: 2026 Duet Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! WebSocket Transport
//!
//! Each connection gets one writer task that owns the sink half of the
//! socket. Pushes and replies are queued to it and each write is
//! acknowledged once the frame has been flushed, so a push only succeeds
//! after the bytes have left the relay. Every write is bounded by the
//! write timeout; a client that stops reading ends its writer.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use duet_core::{CloseReason, OutboundChat, Transport, TransportError};
use futures_util::{Sink, SinkExt};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tracing::debug;
use uuid::Uuid;

use crate::protocol::ServerFrame;

/// Close code sent to a connection replaced by a newer one.
pub const SUPERSEDED_CLOSE_CODE: u16 = 4000;

const OUTBOUND_QUEUE: usize = 64;

type Ack = oneshot::Sender<Result<(), TransportError>>;

enum Outbound {
    Frame { text: String, ack: Ack },
    Close(CloseFrame<'static>),
}

/// The relay side of one WebSocket connection.
pub struct WsTransport {
    connection: Uuid,
    tx: mpsc::Sender<Outbound>,
    writer: AbortHandle,
    closed: Notify,
    close_reason: Mutex<Option<CloseReason>>,
}

impl WsTransport {
    /// Starts the writer task for `sink` and returns the transport feeding it.
    pub fn spawn<S>(
        connection: Uuid,
        sink: S,
        write_timeout: Duration,
    ) -> (Arc<Self>, JoinHandle<()>)
    where
        S: Sink<WsMessage, Error = WsError> + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let writer = tokio::spawn(write_loop(connection, sink, rx, write_timeout));
        let transport = Arc::new(WsTransport {
            connection,
            tx,
            writer: writer.abort_handle(),
            closed: Notify::new(),
            close_reason: Mutex::new(None),
        });
        (transport, writer)
    }

    /// Writes `frame` and waits until it has been flushed.
    pub async fn send_frame(&self, frame: &ServerFrame) -> Result<(), TransportError> {
        if self.close_reason().is_some() {
            return Err(TransportError::Closed);
        }
        let text = frame
            .encode()
            .map_err(|e| TransportError::Io(format!("encode failed: {}", e)))?;
        let (ack, confirmed) = oneshot::channel();
        self.tx
            .send(Outbound::Frame { text, ack })
            .await
            .map_err(|_| TransportError::Closed)?;
        confirmed.await.unwrap_or(Err(TransportError::Closed))
    }

    /// Resolves once the relay has closed this transport.
    pub async fn closed(&self) {
        self.closed.notified().await
    }

    /// Why the relay closed this transport, if it did.
    pub fn close_reason(&self) -> Option<CloseReason> {
        *self
            .close_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn push(&self, chat: &OutboundChat) -> Result<(), TransportError> {
        self.send_frame(&ServerFrame::Chat(chat.clone())).await
    }

    /// Never waits on the writer. If the queue is full the writer is aborted
    /// and the socket dropped without a close frame.
    async fn close(&self, reason: CloseReason) {
        {
            let mut current = self
                .close_reason
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if current.is_some() {
                return;
            }
            *current = Some(reason);
        }
        self.closed.notify_one();
        debug!("Closing connection {}: {:?}", self.connection, reason);

        let frame = match reason {
            CloseReason::Superseded => CloseFrame {
                code: CloseCode::from(SUPERSEDED_CLOSE_CODE),
                reason: "superseded".into(),
            },
            CloseReason::Shutdown => CloseFrame {
                code: CloseCode::Away,
                reason: "shutdown".into(),
            },
        };
        if self.tx.try_send(Outbound::Close(frame)).is_err() {
            debug!("Writer for {} backed up, aborting it", self.connection);
            self.writer.abort();
        }
    }
}

async fn write_loop<S>(
    connection: Uuid,
    mut sink: S,
    mut rx: mpsc::Receiver<Outbound>,
    write_timeout: Duration,
) where
    S: Sink<WsMessage, Error = WsError> + Unpin,
{
    while let Some(outbound) = rx.recv().await {
        match outbound {
            Outbound::Frame { text, ack } => {
                let result = write(&mut sink, WsMessage::Text(text), write_timeout).await;
                let failed = result.is_err();
                let _ = ack.send(result);
                if failed {
                    break;
                }
            }
            Outbound::Close(frame) => {
                let _ = write(&mut sink, WsMessage::Close(Some(frame)), write_timeout).await;
                break;
            }
        }
    }
    // Queued writes are dropped; their senders observe `Closed`.
    rx.close();
    let _ = timeout(write_timeout, sink.close()).await;
    debug!("Writer for {} stopped", connection);
}

async fn write<S>(sink: &mut S, message: WsMessage, limit: Duration) -> Result<(), TransportError>
where
    S: Sink<WsMessage, Error = WsError> + Unpin,
{
    match timeout(limit, sink.send(message)).await {
        Ok(result) => result.map_err(|e| TransportError::Io(e.to_string())),
        Err(_) => Err(TransportError::Timeout),
    }
}
