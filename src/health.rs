//! HTTP server for health checks and metrics

use axum::extract::State;
use axum::http::StatusCode;
use axum::{routing::get, Json, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::coordinator::{PlatformState, PlatformStatus};
use crate::error::Result;
use crate::metrics;
use crate::AppState;

/// Routes served by the health server
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_text))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start HTTP server for health checks and metrics
pub async fn serve(state: Arc<AppState>, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(addr = %addr, "Starting health check server");

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, router(state)).await?;

    Ok(())
}

async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let mut platforms: Vec<PlatformStatus> = state
        .statuses
        .iter()
        .map(|entry| entry.value().clone())
        .collect();
    platforms.sort_by(|a, b| a.platform.cmp(&b.platform));

    let status = if platforms.iter().any(|p| p.state == PlatformState::Failed) {
        "degraded"
    } else {
        "healthy"
    };

    Json(serde_json::json!({
        "status": status,
        "component": "fx-collector",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "cached_entries": state.cache.len(),
        "platforms": platforms,
    }))
}

async fn metrics_text(State(state): State<Arc<AppState>>) -> (StatusCode, String) {
    match metrics::encode(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            warn!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::RateCache;
    use crate::metrics::PipelineMetrics;
    use dashmap::DashMap;
    use prometheus::Registry;

    async fn spawn_server(statuses: Vec<PlatformStatus>) -> String {
        let registry = Registry::new();
        let metrics = PipelineMetrics::new(&registry).unwrap();
        metrics.record_connection_attempt("TCP");

        let map = DashMap::new();
        for status in statuses {
            map.insert(status.platform.clone(), status);
        }
        let state = Arc::new(AppState {
            registry,
            statuses: Arc::new(map),
            cache: Arc::new(RateCache::default()),
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn status(platform: &str, state: PlatformState) -> PlatformStatus {
        PlatformStatus {
            platform: platform.to_string(),
            kind: "streaming".to_string(),
            state,
            attempts: 0,
            limit: 12,
            delay_secs: 10,
            subscriptions: vec!["USDTRY".to_string()],
            updated_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_health_reports_platforms() {
        let base = spawn_server(vec![
            status("TCP", PlatformState::Subscribed),
            status("REST", PlatformState::Failed),
        ])
        .await;

        let body: serde_json::Value = reqwest::get(format!("{}/health", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert_eq!(body["status"], "degraded");
        assert_eq!(body["component"], "fx-collector");
        assert_eq!(body["platforms"][0]["platform"], "REST");
        assert_eq!(body["platforms"][0]["state"], "failed");
        assert_eq!(body["platforms"][1]["state"], "subscribed");
        assert_eq!(body["platforms"][1]["limit"], 12);
        assert_eq!(body["platforms"][1]["delay_secs"], 10);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let base = spawn_server(vec![status("TCP", PlatformState::Subscribed)]).await;

        let text = reqwest::get(format!("{}/metrics", base))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();

        assert!(text.contains("fx_connection_attempts_total{platform=\"TCP\"} 1"));
    }
}
