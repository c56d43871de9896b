use anyhow::{Context, Result};
use axum::{extract::State, http::StatusCode, routing::get, Router};
use edgelink_driver::{HealthAggregator, HealthError};
use std::net::SocketAddr;
use std::sync::Arc;

/// Build the probe router: `/healthz` for liveness, `/readyz` for readiness
pub fn router(health: Arc<HealthAggregator>) -> Router {
    Router::new()
        .route("/healthz", get(alive))
        .route("/readyz", get(ready))
        .with_state(health)
}

/// Serve health probes on `addr` until the task is dropped
pub async fn serve(addr: SocketAddr, health: Arc<HealthAggregator>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind health probe address {}", addr))?;

    tracing::info!(addr = %addr, "Health probes listening");
    axum::serve(listener, router(health))
        .await
        .context("Health probe server failed")
}

async fn ready(State(health): State<Arc<HealthAggregator>>) -> (StatusCode, String) {
    probe_response(health.ready())
}

async fn alive(State(health): State<Arc<HealthAggregator>>) -> (StatusCode, String) {
    probe_response(health.alive())
}

fn probe_response(result: Result<(), HealthError>) -> (StatusCode, String) {
    match result {
        Ok(()) => (StatusCode::OK, "ok".to_string()),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgelink_driver::HealthCheck;

    struct Connecting;

    impl HealthCheck for Connecting {
        fn ready(&self) -> Result<(), HealthError> {
            Err(HealthError::Connecting)
        }

        fn alive(&self) -> Result<(), HealthError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_probe_handlers() {
        let health = Arc::new(HealthAggregator::new());
        health.register("agent-driver", Arc::new(Connecting));

        let (status, body) = ready(State(health.clone())).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body.contains("connecting"));

        let (status, body) = alive(State(health)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }
}
