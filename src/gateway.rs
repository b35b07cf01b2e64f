//! Acknowledgment gateway
//!
//! The HTTP endpoint an on-caller hits by following their resolve link.
//! Verifies the signed token and injects an `oncaller-acknowledged` event
//! into the pipeline.
//!
//! ## Responses
//!
//! | Case | Status | Body |
//! |---|---|---|
//! | valid token, published | 200 | JSON `{message}` |
//! | missing token | 400 | text |
//! | invalid or expired token | 401 | text |
//! | publish failed | 500 | JSON `{message, error}` |
//!
//! Token re-use is permitted: resolving an already-resolved incident is a
//! no-op at the incident manager because the record is gone.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::broker::payload::{format_timestamp, EventPayload};
use crate::broker::{topics, Broker};
use crate::token::TokenCodec;

pub const RESOLVE_ENDPOINT_PATH: &str = "/api/v1/incidents/resolve";

/// Shared state for the gateway handlers
#[derive(Clone)]
pub struct GatewayState {
    broker: Arc<dyn Broker>,
    tokens: Arc<TokenCodec>,
}

impl GatewayState {
    pub fn new(broker: Arc<dyn Broker>, tokens: Arc<TokenCodec>) -> Self {
        Self { broker, tokens }
    }
}

/// Build the gateway router
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route(RESOLVE_ENDPOINT_PATH, get(missing_token))
        .route(
            &format!("{RESOLVE_ENDPOINT_PATH}/"),
            get(missing_token),
        )
        .route(
            &format!("{RESOLVE_ENDPOINT_PATH}/:token"),
            get(resolve_incident),
        )
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn missing_token() -> Response {
    (StatusCode::BAD_REQUEST, "Missing token").into_response()
}

async fn resolve_incident(
    State(state): State<GatewayState>,
    Path(token): Path<String>,
) -> Response {
    let claims = match state.tokens.verify(&token) {
        Ok(claims) => claims,
        Err(_) => {
            return (StatusCode::UNAUTHORIZED, "Link is invalid or has expired").into_response();
        }
    };

    info!(
        "resolving incident {} for service {} by on-caller {}",
        claims.incident_id, claims.service_id, claims.oncaller
    );

    let service_id = claims.service_id;
    let payload = EventPayload {
        incident_id: Some(claims.incident_id),
        service_id: Some(service_id),
        oncaller: Some(claims.oncaller),
        timestamp: Some(format_timestamp(Utc::now())),
        ..Default::default()
    };

    let bytes = match payload.to_bytes() {
        Ok(bytes) => bytes,
        Err(e) => {
            error!("failed to encode acknowledgment: {e:#}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "message": "Failed to publish acknowledgment",
                    "error": e.to_string(),
                })),
            )
                .into_response();
        }
    };

    match state
        .broker
        .publish(
            topics::ONCALLER_ACKNOWLEDGED,
            &service_id.to_string(),
            &bytes,
        )
        .await
    {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "message": "Incident resolved successfully" })),
        )
            .into_response(),
        Err(e) => {
            error!("failed to publish acknowledgment: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "message": "Failed to publish acknowledgment",
                    "error": e.to_string(),
                })),
            )
                .into_response()
        }
    }
}

/// Spawn the gateway HTTP server in a background task.
///
/// Returns the bound address; cancelling the token shuts the server down
/// gracefully.
pub async fn spawn_gateway(
    bind_addr: SocketAddr,
    state: GatewayState,
    cancel: CancellationToken,
) -> anyhow::Result<SocketAddr> {
    info!("starting acknowledgment gateway on {}", bind_addr);

    let app = router(state);

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    let addr = listener.local_addr()?;

    tokio::spawn(async move {
        let shutdown = async move { cancel.cancelled().await };
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            error!("gateway server error: {}", e);
        }
    });

    info!("acknowledgment gateway listening on {}", addr);

    Ok(addr)
}
