//! # Webhook Handlers
//!
//! Inbound vendor deliveries. The body is taken as raw bytes so the
//! signature is checked against exactly what was sent.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::Json,
};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::debug;
use utoipa::ToSchema;

use crate::error::ApiError;
use crate::server::AppState;
use crate::telemetry::{TraceContext, with_trace_context};
use crate::webhooks::{Dispatch, SIGNATURE_HEADER};

/// Acknowledgement returned once a delivery is dispatched
#[derive(Debug, Serialize, ToSchema)]
pub struct WebhookAck {
    /// Always "accepted"
    pub status: String,
    /// What the delivery caused
    pub dispatch: Dispatch,
}

/// Receives a Printify webhook delivery.
#[utoipa::path(
    post,
    path = "/webhooks/printify",
    params(
        ("X-Pfy-Signature" = String, Header, description = "Hex HMAC-SHA256 of the raw body, optionally prefixed with sha256=")
    ),
    request_body(content = Option<JsonValue>, description = "Vendor event: { type, data }", content_type = "application/json"),
    responses(
        (status = 200, description = "Verified and dispatched", body = WebhookAck),
        (status = 400, description = "Malformed payload", body = ApiError),
        (status = 403, description = "Missing or invalid signature", body = ApiError),
        (status = 503, description = "Local storage unavailable", body = ApiError)
    ),
    tag = "webhooks"
)]
pub async fn printify_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<WebhookAck>), ApiError> {
    let context = TraceContext::generate();
    with_trace_context(context, async move {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|value| value.to_str().ok());
        debug!(
            body_size = body.len(),
            signed = signature.is_some(),
            "Webhook delivery received"
        );

        let dispatch = state.ingestor.ingest(&body, signature).await?;

        Ok((
            StatusCode::OK,
            Json(WebhookAck {
                status: "accepted".to_string(),
                dispatch,
            }),
        ))
    })
    .await
}
