//! Health & status API
//!
//! - GET /health - liveness, always `OK`
//! - GET /metrics - Prometheus metrics
//! - GET /status - role, chain and uptime

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use eyre::{Result, WrapErr};
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::info;

use crate::config::Role;
use crate::metrics;

#[derive(Debug)]
pub struct ApiState {
    pub role: Role,
    pub chain: String,
    pub chain_id: u64,
    pub started_at: Instant,
}

impl ApiState {
    pub fn new(role: Role, chain: impl Into<String>, chain_id: u64) -> Self {
        Self {
            role,
            chain: chain.into(),
            chain_id,
            started_at: Instant::now(),
        }
    }
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    status: &'static str,
    role: String,
    chain: String,
    chain_id: u64,
    uptime_seconds: u64,
}

async fn health() -> &'static str {
    "OK"
}

async fn status(State(state): State<Arc<ApiState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "ok",
        role: state.role.to_string(),
        chain: state.chain.clone(),
        chain_id: state.chain_id,
        uptime_seconds: state.started_at.elapsed().as_secs(),
    })
}

async fn prometheus_metrics() -> Response {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&prometheus::gather(), &mut buffer).is_err() {
        return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response();
    }

    match Response::builder()
        .header(header::CONTENT_TYPE, encoder.format_type())
        .body(axum::body::Body::from(buffer))
    {
        Ok(resp) => resp,
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to build metrics response",
        )
            .into_response(),
    }
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(prometheus_metrics))
        .route("/status", get(status))
        .with_state(state)
}

/// Serve the API until the listener fails
pub async fn start_api_server(addr: SocketAddr, state: ApiState) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("Failed to bind API server to {}", addr))?;
    info!(%addr, role = %state.role, "API server started");

    metrics::UP.set(1.0);
    axum::serve(listener, router(Arc::new(state)))
        .await
        .wrap_err("API server failed")
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn spawn() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(Arc::new(ApiState::new(Role::Builder, "b2", 1123)));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_health_and_status() {
        let addr = spawn().await;
        let client = reqwest::Client::new();

        let health = client
            .get(format!("http://{}/health", addr))
            .send()
            .await
            .unwrap();
        assert_eq!(health.status(), 200);
        assert_eq!(health.text().await.unwrap(), "OK");

        let status: serde_json::Value = client
            .get(format!("http://{}/status", addr))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status["role"], "builder");
        assert_eq!(status["chain_id"], 1123);
    }

    #[tokio::test]
    async fn test_metrics_exposition() {
        metrics::record_signature("1123", "accepted");
        let addr = spawn().await;

        let body = reqwest::get(format!("http://{}/metrics", addr))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(body.contains("relay_signatures_total"));
    }
}
