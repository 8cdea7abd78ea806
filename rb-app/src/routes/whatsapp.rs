//! WhatsApp Cloud webhook: subscription handshake and event ingest.

use crate::server::AppState;
use axum::extract::Query;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Extension, Json};
use bytes::Bytes;
use rb_channels::webhook::{self, WebhookPayload};
use serde::Deserialize;
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route(
        "/webhooks/whatsapp",
        get(verify_subscription).post(ingest_events),
    )
}

#[derive(Debug, Deserialize)]
struct VerifyQuery {
    #[serde(rename = "hub.mode")]
    mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    challenge: Option<String>,
}

#[tracing::instrument(level = "info", skip_all)]
async fn verify_subscription(
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<VerifyQuery>,
) -> Response {
    match webhook::verify_subscription(
        query.mode.as_deref(),
        query.verify_token.as_deref(),
        query.challenge.as_deref(),
        &state.verify_token,
    ) {
        Some(challenge) => {
            tracing::info!("whatsapp webhook subscription verified");
            (StatusCode::OK, challenge.to_string()).into_response()
        }
        None => {
            tracing::warn!("whatsapp webhook verification rejected");
            (StatusCode::FORBIDDEN, "verification failed").into_response()
        }
    }
}

fn error_response(status: StatusCode, error: impl Into<String>) -> Response {
    (
        status,
        Json(serde_json::json!({
            "status": "error",
            "error": error.into(),
        })),
    )
        .into_response()
}

#[tracing::instrument(level = "info", skip_all, fields(body_len = body.len()))]
async fn ingest_events(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Some(secret) = state.app_secret.as_deref() {
        let signature = headers
            .get(webhook::SIGNATURE_HEADER)
            .and_then(|value| value.to_str().ok());
        if !webhook::verify_signature(signature, &body, secret) {
            tracing::warn!("rejecting webhook with invalid signature");
            return error_response(StatusCode::UNAUTHORIZED, "invalid x-hub-signature-256");
        }
    }

    let payload = match WebhookPayload::parse(&body) {
        Ok(payload) => payload,
        Err(error) => {
            return error_response(StatusCode::BAD_REQUEST, format!("{error:#}"));
        }
    };

    let mut accepted = 0usize;
    for inbound in payload.into_inbound() {
        if let Err(error) = state.inbound_tx.send(inbound).await {
            return error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                format!("whatsapp inbound queue closed: {error}"),
            );
        }
        accepted += 1;
    }
    tracing::debug!(accepted, "webhook events queued");

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "ok",
            "accepted": accepted,
        })),
    )
        .into_response()
}
