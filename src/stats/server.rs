//! Statistics API server using Axum
//!
//! Collects per-target dispatch statistics through target hooks and serves
//! them as JSON.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::{Result, ShroudError};
use crate::proxy::Target;
use crate::stats::recorder::TargetRecorder;

/// Collects statistics for targets registered with it.
///
/// Registration installs the collector's hooks onto the target, so it must
/// happen before the target is handed to proxy construction.
pub struct StatsCollector {
    capture_window: Duration,
    recorders: RwLock<HashMap<String, Arc<TargetRecorder>>>,
}

impl StatsCollector {
    pub fn new(capture_window: Duration) -> Arc<Self> {
        Arc::new(Self {
            capture_window,
            recorders: RwLock::new(HashMap::new()),
        })
    }

    /// Start recording for a target by installing dispatch hooks on it.
    pub fn register(&self, target: &mut Target) {
        // keyed by the same normalized form the proxy registry uses
        let prefix = if target.prefix.starts_with('/') {
            target.prefix.clone()
        } else {
            format!("/{}", target.prefix)
        };
        let recorder = Arc::new(TargetRecorder::new(self.capture_window));
        self.recorders.write().insert(prefix, Arc::clone(&recorder));
        target.hooks = Some(recorder);
    }

    pub fn prefixes(&self) -> Vec<String> {
        self.recorders.read().keys().cloned().collect()
    }

    fn recorder(&self, prefix: &str) -> Option<Arc<TargetRecorder>> {
        self.recorders.read().get(prefix).cloned()
    }
}

#[derive(Serialize)]
struct TargetList {
    targets: Vec<String>,
}

async fn list_targets(State(collector): State<Arc<StatsCollector>>) -> impl IntoResponse {
    let mut targets = collector.prefixes();
    targets.sort();
    Json(TargetList { targets })
}

async fn target_stats(
    State(collector): State<Arc<StatsCollector>>,
    Path(prefix): Path<String>,
) -> impl IntoResponse {
    // the route strips the leading slash from the captured prefix
    let prefix = format!("/{}", prefix.trim_start_matches('/'));
    match collector.recorder(&prefix) {
        Some(recorder) => Json(recorder.snapshot()).into_response(),
        None => (StatusCode::NOT_FOUND, "unknown target").into_response(),
    }
}

pub(crate) fn build_router(collector: Arc<StatsCollector>) -> Router {
    Router::new()
        .route("/api/targets", get(list_targets))
        .route("/api/targets/*prefix", get(target_stats))
        .with_state(collector)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Statistics API server
pub struct StatsServer {
    collector: Arc<StatsCollector>,
    port: u16,
}

impl StatsServer {
    pub fn new(collector: Arc<StatsCollector>, port: u16) -> Self {
        Self { collector, port }
    }

    /// Run the server until the shutdown signal fires.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let router = build_router(Arc::clone(&self.collector));
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", self.port)).await?;
        info!("Stats server listening on {}", listener.local_addr()?);

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await
            .map_err(|e| ShroudError::Http(e.to_string()))?;

        info!("Stats server shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn collector_with_target(prefix: &str) -> Arc<StatsCollector> {
        let collector = StatsCollector::new(Duration::from_secs(60));
        let mut target = Target::new("https://example.com", prefix);
        collector.register(&mut target);
        assert!(target.hooks.is_some(), "registration installs hooks");
        collector
    }

    #[tokio::test]
    async fn test_list_targets() {
        let collector = collector_with_target("/ex/");
        let app = build_router(collector);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/targets")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["targets"], serde_json::json!(["/ex/"]));
    }

    #[tokio::test]
    async fn test_target_stats_by_prefix() {
        let collector = collector_with_target("/ex/");
        collector
            .recorder("/ex/")
            .unwrap()
            .add_response(Duration::from_millis(50), 200);
        let app = build_router(collector);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/targets/ex/")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["totalRequestCount"], 1);
        assert_eq!(parsed["requestCount"], 1);
    }

    #[tokio::test]
    async fn test_unknown_target_is_not_found() {
        let app = build_router(collector_with_target("/ex/"));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/targets/nope/")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
