//! # Server Configuration
//!
//! Router, shared state and the HTTP listener.

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use sea_orm::DatabaseConnection;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::config::AppConfig;
use crate::handlers;
use crate::webhooks::WebhookIngestor;

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub db: DatabaseConnection,
    pub ingestor: Arc<WebhookIngestor>,
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::root))
        .route(
            "/webhooks/printify",
            post(handlers::webhooks::printify_webhook),
        )
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
}

/// Serves `state` until `shutdown` fires.
pub async fn run_server(
    config: &AppConfig,
    state: AppState,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let app = create_app(state);

    let addr = config
        .bind_addr()
        .map_err(|e| anyhow::anyhow!("invalid server address {}: {e}", config.api_bind_addr))?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, profile = %config.profile, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::root,
        crate::handlers::webhooks::printify_webhook,
    ),
    components(
        schemas(
            crate::models::ServiceInfo,
            crate::handlers::webhooks::WebhookAck,
            crate::webhooks::Dispatch,
            crate::error::ApiError,
        )
    ),
    info(
        title = "printsync API",
        description = "Storefront and print-on-demand vendor synchronization",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;
