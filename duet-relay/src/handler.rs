// SPDX-FileCopyrightText: 2026 Duet Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! WebSocket Connection Handler
//!
//! Authenticates the connection from its `/ws/<handle>` path, registers it
//! with the session manager and serves client frames until it closes.

use std::sync::Arc;

use duet_core::{
    DeliveryState, DirectoryError, Identity, RelayError, SessionManager, Transport,
};
use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::metrics::RelayMetrics;
use crate::protocol::{
    ChatRequest, ClientFrame, ErrorReason, HistoryEntry, HistoryRequest, ServerFrame,
};
use crate::rate_limit::RateLimiter;
use crate::session::WsTransport;

/// Page size used when a history request gives no limit.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Everything a connection handler needs, shared by all connections.
pub struct RelayContext {
    pub manager: Arc<SessionManager>,
    pub rate_limiter: Arc<RateLimiter>,
    pub metrics: RelayMetrics,
    pub max_message_size: usize,
    pub history_max: usize,
    pub auto_register: bool,
}

/// Extracts the handle from a `/ws/<handle>` request path.
pub fn handle_from_path(path: &str) -> Option<&str> {
    path.strip_prefix("/ws/")
        .filter(|handle| !handle.is_empty() && !handle.contains('/'))
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

impl RelayContext {
    /// Looks up the identity behind `handle`, registering it if allowed.
    fn authenticate(&self, handle: &str) -> Result<Identity, ErrorResponse> {
        let directory = self.manager.directory();
        match directory.resolve(handle) {
            Ok(identity) => Ok(identity),
            Err(DirectoryError::NotFound(_)) if self.auto_register => {
                match directory.register(handle) {
                    Ok(identity) => {
                        info!("Registered new handle {}", handle);
                        Ok(identity)
                    }
                    // Lost a race with another connection for the same handle.
                    Err(DirectoryError::AlreadyRegistered(_)) => directory
                        .resolve(handle)
                        .map_err(|_| reject(StatusCode::FORBIDDEN, "unknown handle")),
                    Err(e) => {
                        warn!("Could not register {}: {}", handle, e);
                        Err(reject(StatusCode::BAD_REQUEST, "invalid handle"))
                    }
                }
            }
            Err(DirectoryError::NotFound(_)) => {
                Err(reject(StatusCode::FORBIDDEN, "unknown handle"))
            }
            Err(e) => {
                warn!("Directory lookup for {} failed: {}", handle, e);
                Err(reject(StatusCode::SERVICE_UNAVAILABLE, "directory unavailable"))
            }
        }
    }
}

/// Serves one client connection from handshake to close.
pub async fn handle_connection<S>(stream: S, ctx: Arc<RelayContext>, connection: Uuid)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut authenticated = None;
    let handshake = accept_hdr_async(stream, |request: &Request, response: Response| {
        let Some(handle) = handle_from_path(request.uri().path()) else {
            return Err(reject(StatusCode::NOT_FOUND, "expected /ws/<handle>"));
        };
        authenticated = Some(ctx.authenticate(handle)?);
        Ok(response)
    })
    .await;

    let ws_stream = match handshake {
        Ok(ws_stream) => ws_stream,
        Err(e) => {
            warn!("Handshake failed for {}: {}", connection, e);
            ctx.metrics.connection_errors.inc();
            return;
        }
    };
    let Some(identity) = authenticated else {
        return;
    };

    ctx.metrics.connections_total.inc();
    ctx.metrics.connections_active.inc();
    serve_session(ws_stream, &ctx, &identity, connection).await;
    ctx.metrics.connections_active.dec();
}

async fn serve_session<S>(
    ws_stream: tokio_tungstenite::WebSocketStream<S>,
    ctx: &RelayContext,
    identity: &Identity,
    connection: Uuid,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, mut read) = ws_stream.split();
    let write_timeout = ctx.manager.options().push_timeout;
    let (transport, mut writer) = WsTransport::spawn(connection, sink, write_timeout);

    let connected = match ctx
        .manager
        .connect(identity, transport.clone() as Arc<dyn Transport>)
        .await
    {
        Ok(connected) => connected,
        Err(e) => {
            warn!("Could not register {}: {}", identity.handle(), e);
            return;
        }
    };
    if connected.superseded.is_some() {
        ctx.metrics.sessions_superseded.inc();
    }
    info!(
        "{} connected as {} ({})",
        connection,
        identity.handle(),
        connected.session
    );

    match ctx.manager.deliver_backlog(identity).await {
        Ok(delivered) => ctx.metrics.messages_delivered.inc_by(delivered as u64),
        Err(e) => warn!("Backlog for {} not delivered: {}", identity.handle(), e),
    }

    loop {
        let frame = tokio::select! {
            _ = transport.closed() => break,
            frame = read.next() => frame,
        };

        let text = match frame {
            Some(Ok(WsMessage::Text(text))) => text,
            Some(Ok(WsMessage::Binary(_))) => {
                let reply = ServerFrame::error(ErrorReason::InvalidFrame, "expected text frame");
                if transport.send_frame(&reply).await.is_err() {
                    break;
                }
                continue;
            }
            Some(Ok(WsMessage::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                debug!("Read error on {}: {}", connection, e);
                break;
            }
        };

        let reply = handle_text(ctx, identity, &text).await;
        if transport.send_frame(&reply).await.is_err() {
            break;
        }
    }

    ctx.manager
        .disconnect_session(identity.id(), connected.session)
        .await;
    match transport.close_reason() {
        Some(reason) => info!(
            "{} ({}) closed by relay: {:?}",
            identity.handle(),
            connected.session,
            reason
        ),
        None => info!("{} ({}) closed", identity.handle(), connected.session),
    }
    drop(transport);

    // Each queued write is bounded; cap the whole drain as well.
    if timeout(write_timeout, &mut writer).await.is_err() {
        debug!("Writer for {} still busy, aborting", connection);
        writer.abort();
    }
}

async fn handle_text(ctx: &RelayContext, identity: &Identity, text: &str) -> ServerFrame {
    if text.len() > ctx.max_message_size {
        warn!(
            "Message too large from {}: {} bytes",
            identity.handle(),
            text.len()
        );
        return ServerFrame::error(
            ErrorReason::MessageTooLarge,
            format!("frames are limited to {} bytes", ctx.max_message_size),
        );
    }
    if !ctx.rate_limiter.consume(identity.id().as_str()) {
        warn!("Rate limited: {}", identity.handle());
        ctx.metrics.rate_limited.inc();
        return ServerFrame::error(ErrorReason::RateLimited, "slow down");
    }

    match ClientFrame::decode(text) {
        Ok(ClientFrame::Chat(chat)) => handle_chat(ctx, identity, chat).await,
        Ok(ClientFrame::History(request)) => handle_history(ctx, identity, request).await,
        Ok(ClientFrame::Ping) => ServerFrame::Pong,
        Err(e) => {
            debug!("Invalid frame from {}: {}", identity.handle(), e);
            ServerFrame::error(ErrorReason::InvalidFrame, "invalid data format")
        }
    }
}

async fn handle_chat(ctx: &RelayContext, identity: &Identity, chat: ChatRequest) -> ServerFrame {
    match ctx.manager.send(identity, &chat.recipient, &chat.body).await {
        Ok(message) => {
            ctx.metrics.messages_received.inc();
            match message.delivery_state {
                DeliveryState::Delivered => ctx.metrics.messages_delivered.inc(),
                DeliveryState::Stored => ctx.metrics.messages_deferred.inc(),
            }
            ServerFrame::Sent {
                id: message.id,
                recipient: chat.recipient,
                created_at: message.created_at,
            }
        }
        Err(e) => {
            ctx.metrics.send_failures.inc();
            debug!("Send from {} rejected: {}", identity.handle(), e);
            error_frame(&e)
        }
    }
}

async fn handle_history(
    ctx: &RelayContext,
    identity: &Identity,
    request: HistoryRequest,
) -> ServerFrame {
    let limit = request
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .min(ctx.history_max);

    match ctx
        .manager
        .history(identity, &request.with, limit, request.before)
        .await
    {
        Ok(messages) => ServerFrame::History {
            messages: messages
                .iter()
                .map(|m| HistoryEntry::new(m, (identity.id(), identity.handle()), &request.with))
                .collect(),
            with: request.with,
        },
        Err(e) => error_frame(&e),
    }
}

fn error_frame(error: &RelayError) -> ServerFrame {
    let reason = match error {
        RelayError::RecipientNotFound(_) => ErrorReason::RecipientNotFound,
        RelayError::UnknownIdentity(_) => ErrorReason::UnknownIdentity,
        RelayError::InvalidMessage(_) => ErrorReason::InvalidMessage,
        RelayError::StoreUnavailable(_) | RelayError::Directory(_) => {
            ErrorReason::StoreUnavailable
        }
    };
    ServerFrame::error(reason, error.to_string())
}
