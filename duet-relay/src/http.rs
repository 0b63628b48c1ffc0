// SPDX-FileCopyrightText: 2026 Duet Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! HTTP Server for Health and Metrics Endpoints
//!
//! Runs beside the WebSocket listener on its own port.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use duet_core::SessionManager;
use serde::Serialize;
use tracing::warn;

use crate::metrics::RelayMetrics;

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct HttpState {
    pub metrics: RelayMetrics,
    pub manager: Arc<SessionManager>,
    pub start_time: Instant,
    pub metrics_token: Option<String>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_seconds: u64,
}

#[derive(Serialize)]
pub struct ReadyResponse {
    pub ready: bool,
    pub store_ok: bool,
    pub sessions: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Rejects requests without `Authorization: Bearer <token>` when a token is set.
async fn require_metrics_token(
    State(state): State<HttpState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.metrics_token.as_deref() else {
        return next.run(request).await;
    };
    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    if presented == Some(expected) {
        next.run(request).await
    } else {
        (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Bearer")],
            "Unauthorized",
        )
            .into_response()
    }
}

/// `/`, `/health` and `/ready` are open; `/metrics` may require a token.
pub fn create_router(state: HttpState) -> Router {
    let metrics = Router::new()
        .route("/metrics", get(metrics_handler))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_metrics_token,
        ));

    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .merge(metrics)
        .with_state(state)
}

async fn root_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "service": "duet-relay",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": ["/health", "/ready", "/metrics", "/ws/<handle>"]
    }))
}

/// Always 200 while the process is serving.
async fn health_handler(State(state): State<HttpState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

/// 200 if the message store answers, 503 otherwise.
async fn ready_handler(State(state): State<HttpState>) -> Response {
    let check = state.manager.store().health_check().await;
    let response = ReadyResponse {
        ready: check.is_ok(),
        store_ok: check.is_ok(),
        sessions: state.manager.session_count(),
        error: check.as_ref().err().map(|e| e.to_string()),
    };

    match check {
        Ok(()) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => {
            warn!("Readiness check failed: {}", e);
            (StatusCode::SERVICE_UNAVAILABLE, Json(response)).into_response()
        }
    }
}

async fn metrics_handler(State(state): State<HttpState>) -> impl IntoResponse {
    match state.manager.store().message_count().await {
        Ok(count) => state.metrics.messages_stored.set(count as i64),
        Err(e) => warn!("Could not count stored messages: {}", e),
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        state.metrics.encode(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use duet_core::{
        IdentityId, MemoryIdentityDirectory, MemoryMessageStore, MessageStore, RelayOptions,
    };
    use tower::ServiceExt;

    fn create_test_state(store: Arc<dyn MessageStore>, token: Option<&str>) -> HttpState {
        HttpState {
            metrics: RelayMetrics::new().unwrap(),
            manager: Arc::new(SessionManager::new(
                Arc::new(MemoryIdentityDirectory::new()),
                store,
                RelayOptions::default(),
            )),
            start_time: Instant::now(),
            metrics_token: token.map(String::from),
        }
    }

    async fn get_status(app: Router, uri: &str, auth: Option<&str>) -> StatusCode {
        let mut request = Request::builder().uri(uri);
        if let Some(auth) = auth {
            request = request.header(header::AUTHORIZATION, auth);
        }
        app.oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = create_router(create_test_state(Arc::new(MemoryMessageStore::new()), None));
        assert_eq!(get_status(app, "/health", None).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_ready_endpoint() {
        let app = create_router(create_test_state(Arc::new(MemoryMessageStore::new()), None));
        assert_eq!(get_status(app, "/ready", None).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_reports_stored_messages() {
        let store = Arc::new(MemoryMessageStore::new());
        store
            .append(&IdentityId::generate(), &IdentityId::generate(), "hi")
            .await
            .unwrap();
        let app = create_router(create_test_state(store, None));

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("duet_messages_stored 1"));
    }

    #[tokio::test]
    async fn test_metrics_token_required_when_set() {
        let state = create_test_state(Arc::new(MemoryMessageStore::new()), Some("secret"));

        let app = create_router(state.clone());
        assert_eq!(get_status(app, "/metrics", None).await, StatusCode::UNAUTHORIZED);

        let app = create_router(state.clone());
        assert_eq!(
            get_status(app, "/metrics", Some("Bearer wrong")).await,
            StatusCode::UNAUTHORIZED
        );

        let app = create_router(state.clone());
        assert_eq!(
            get_status(app, "/metrics", Some("Bearer secret")).await,
            StatusCode::OK
        );

        // Other endpoints stay open.
        let app = create_router(state);
        assert_eq!(get_status(app, "/health", None).await, StatusCode::OK);
    }
}
