//! # Webhook Ingestion
//!
//! A delivery is verified against the shared secret, parsed, and routed by
//! event type. Upserts become single-entity sync runs; cancellations and
//! deletions are applied to the local catalog directly.

pub mod verify;

use std::collections::HashMap;
use std::sync::Arc;

use axum::http::StatusCode;
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, instrument, warn};
use utoipa::ToSchema;

use crate::catalog::LocalCatalog;
use crate::error::{ApiError, SyncError};
use crate::models::EntityType;
use crate::scheduler::BatchScheduler;

pub use verify::{SIGNATURE_HEADER, VerificationError, verify_signature};

/// What to do with an event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventRoute {
    FetchProduct,
    FetchOrder,
    CancelOrder,
    DeleteProduct,
}

impl EventRoute {
    fn entity_type(&self) -> EntityType {
        match self {
            EventRoute::FetchProduct | EventRoute::DeleteProduct => EntityType::Product,
            EventRoute::FetchOrder | EventRoute::CancelOrder => EntityType::Order,
        }
    }
}

const ROUTES: &[(&str, EventRoute)] = &[
    ("product.created", EventRoute::FetchProduct),
    ("product.updated", EventRoute::FetchProduct),
    ("product.publish.started", EventRoute::FetchProduct),
    ("product.deleted", EventRoute::DeleteProduct),
    ("order.created", EventRoute::FetchOrder),
    ("order.updated", EventRoute::FetchOrder),
    ("order.sent-to-production", EventRoute::FetchOrder),
    ("order.shipment.created", EventRoute::FetchOrder),
    ("order.shipment.delivered", EventRoute::FetchOrder),
    ("order.fulfilled", EventRoute::FetchOrder),
    ("order.cancelled", EventRoute::CancelOrder),
];

/// Result of a successfully ingested delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Dispatch {
    /// A sync run was scheduled to fetch the entity
    Scheduled { run_id: String },
    /// The local order was cancelled
    Cancelled { order_id: String },
    /// The local product was removed
    Deleted { product_id: String },
    /// Event type has no route
    Ignored { event_type: String },
}

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("webhook rejected: {0}")]
    Rejected(#[from] VerificationError),
    #[error("malformed webhook payload: {0}")]
    Malformed(String),
    #[error("webhook dispatch failed: {0}")]
    Dispatch(#[from] SyncError),
}

impl From<WebhookError> for ApiError {
    fn from(error: WebhookError) -> Self {
        match error {
            WebhookError::Rejected(reason) => {
                ApiError::new(reason.status_code(), "FORBIDDEN", "invalid webhook signature")
            }
            WebhookError::Malformed(message) => ApiError::new(
                StatusCode::BAD_REQUEST,
                "VALIDATION_FAILED".to_string(),
                message,
            ),
            WebhookError::Dispatch(sync_error) => sync_error.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WebhookPayload {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    data: JsonValue,
}

impl WebhookPayload {
    fn entity_id(&self, route: EventRoute) -> Option<String> {
        let keys: &[&str] = match route.entity_type() {
            EntityType::Product => &["product_id", "id"],
            EntityType::Order => &["order_id", "id"],
        };
        keys.iter()
            .find_map(|key| json_id(self.data.get(*key)?))
    }

    fn shop_id(&self) -> Option<String> {
        self.data.get("shop_id").and_then(json_id)
    }
}

/// Vendor ids arrive as strings or numbers.
fn json_id(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub struct WebhookIngestor {
    scheduler: Arc<BatchScheduler>,
    catalog: Arc<dyn LocalCatalog>,
    secret: Option<String>,
    default_shop_id: Option<String>,
    routes: HashMap<&'static str, EventRoute>,
}

impl WebhookIngestor {
    pub fn new(
        scheduler: Arc<BatchScheduler>,
        catalog: Arc<dyn LocalCatalog>,
        secret: Option<String>,
        default_shop_id: Option<String>,
    ) -> Self {
        Self {
            scheduler,
            catalog,
            secret,
            default_shop_id,
            routes: ROUTES.iter().copied().collect(),
        }
    }

    /// Route registered for `event_type`, if any.
    pub fn route_for(&self, event_type: &str) -> Option<EventRoute> {
        self.routes.get(event_type).copied()
    }

    /// Verifies, parses and dispatches one delivery.
    ///
    /// Nothing is scheduled or written unless the signature checks out.
    #[instrument(skip_all, fields(event_type))]
    pub async fn ingest(
        &self,
        body: &[u8],
        signature: Option<&str>,
    ) -> Result<Dispatch, WebhookError> {
        let result = self.ingest_inner(body, signature).await;
        let outcome = match &result {
            Ok(Dispatch::Scheduled { .. }) => "scheduled",
            Ok(Dispatch::Cancelled { .. }) => "cancelled",
            Ok(Dispatch::Deleted { .. }) => "deleted",
            Ok(Dispatch::Ignored { .. }) => "ignored",
            Err(WebhookError::Rejected(_)) => "rejected",
            Err(WebhookError::Malformed(_)) => "malformed",
            Err(WebhookError::Dispatch(_)) => "error",
        };
        counter!("webhook_events_total", "outcome" => outcome).increment(1);
        result
    }

    async fn ingest_inner(
        &self,
        body: &[u8],
        signature: Option<&str>,
    ) -> Result<Dispatch, WebhookError> {
        if let Err(reason) = verify_signature(self.secret.as_deref(), body, signature) {
            warn!(reason = %reason, "Rejected webhook delivery");
            return Err(reason.into());
        }

        let payload: WebhookPayload = serde_json::from_slice(body)
            .map_err(|e| WebhookError::Malformed(format!("invalid JSON body: {e}")))?;
        if payload.event_type.trim().is_empty() {
            return Err(WebhookError::Malformed("event type is empty".into()));
        }
        tracing::Span::current().record("event_type", payload.event_type.as_str());

        let Some(route) = self.route_for(&payload.event_type) else {
            info!(event_type = %payload.event_type, "Acknowledging unhandled webhook event");
            return Ok(Dispatch::Ignored {
                event_type: payload.event_type,
            });
        };

        let remote_id = payload.entity_id(route).ok_or_else(|| {
            WebhookError::Malformed(format!("{} event without an entity id", payload.event_type))
        })?;
        let shop_id = payload
            .shop_id()
            .or_else(|| self.default_shop_id.clone())
            .ok_or_else(|| WebhookError::Malformed("event without a shop id".into()))?;

        match route {
            EventRoute::FetchProduct | EventRoute::FetchOrder => {
                let run_id = self
                    .scheduler
                    .schedule_webhook_update(
                        &remote_id,
                        &shop_id,
                        route.entity_type(),
                        &payload.event_type,
                    )
                    .await?;
                info!(
                    event_type = %payload.event_type,
                    remote_id = %remote_id,
                    run_id = %run_id,
                    "Webhook update scheduled"
                );
                Ok(Dispatch::Scheduled { run_id })
            }
            EventRoute::CancelOrder => {
                self.catalog
                    .cancel_order(&shop_id, &remote_id, &payload.data)
                    .await
                    .map_err(SyncError::from)?;
                Ok(Dispatch::Cancelled {
                    order_id: remote_id,
                })
            }
            EventRoute::DeleteProduct => {
                self.catalog
                    .delete_product(&shop_id, &remote_id)
                    .await
                    .map_err(SyncError::from)?;
                Ok(Dispatch::Deleted {
                    product_id: remote_id,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: JsonValue) -> WebhookPayload {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn routes_cover_upserts_and_direct_updates() {
        let routes: HashMap<&str, EventRoute> = ROUTES.iter().copied().collect();
        assert_eq!(routes["product.updated"], EventRoute::FetchProduct);
        assert_eq!(routes["order.shipment.created"], EventRoute::FetchOrder);
        assert_eq!(routes["order.cancelled"], EventRoute::CancelOrder);
        assert_eq!(routes["product.deleted"], EventRoute::DeleteProduct);
        assert!(!routes.contains_key("shop.disconnected"));
    }

    #[test]
    fn entity_id_prefers_typed_key_and_accepts_numbers() {
        let p = payload(json!({"type": "order.updated", "data": {"order_id": 42, "id": "x"}}));
        assert_eq!(p.entity_id(EventRoute::FetchOrder).as_deref(), Some("42"));

        let p = payload(json!({"type": "product.updated", "data": {"id": "p-9"}}));
        assert_eq!(p.entity_id(EventRoute::FetchProduct).as_deref(), Some("p-9"));

        let p = payload(json!({"type": "product.updated", "data": {"order_id": "o"}}));
        assert_eq!(p.entity_id(EventRoute::FetchProduct), None);
    }

    #[test]
    fn rejected_deliveries_map_to_forbidden() {
        let api: ApiError = WebhookError::Rejected(VerificationError::MissingSignature).into();
        assert_eq!(api.status, StatusCode::FORBIDDEN);

        let api: ApiError = WebhookError::Malformed("bad".into()).into();
        assert_eq!(api.status, StatusCode::BAD_REQUEST);
    }
}
