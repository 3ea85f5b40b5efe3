//! Health check handler.

use crate::models::HealthResponse;
use axum::Json;

/// Liveness probe handler.
///
/// Static response; does not check the container runtime, secret store
/// or registry.
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health_check() {
        let Json(body) = health_check().await;
        assert_eq!(body.status, "healthy");
    }
}
