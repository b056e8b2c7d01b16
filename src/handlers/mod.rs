//! # API Handlers
//!
//! HTTP endpoints served by printsync.

pub mod webhooks;

use crate::models::ServiceInfo;
use axum::response::Json;

/// Root handler that returns basic service information
#[utoipa::path(
    get,
    path = "/",
    responses(
        (status = 200, description = "Service information", body = ServiceInfo)
    ),
    tag = "root"
)]
pub async fn root() -> Json<ServiceInfo> {
    Json(ServiceInfo::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn root_reports_service_name_and_version() {
        let Json(info) = root().await;
        assert_eq!(info.service, "printsync");
        assert_eq!(info.version, env!("CARGO_PKG_VERSION"));
    }
}
