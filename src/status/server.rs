//! Read-only status HTTP server

use axum::{routing::get, Router};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;

use super::handlers;
use crate::config::StatusConfig;
use crate::source::C64Source;

/// Shared handler state
pub struct AppState {
    pub source: Arc<C64Source>,
}

/// Serves `/api/status` and `/api/config`
pub struct StatusServer {
    config: StatusConfig,
    state: Arc<AppState>,
}

impl StatusServer {
    pub fn new(config: StatusConfig, source: Arc<C64Source>) -> Self {
        Self {
            config,
            state: Arc::new(AppState { source }),
        }
    }

    /// Build the router
    pub fn router(&self) -> Router {
        Router::new()
            .route("/api/status", get(handlers::get_status))
            .route("/api/config", get(handlers::get_config))
            .layer(ServiceBuilder::new().layer(CorsLayer::permissive()))
            .with_state(self.state.clone())
    }

    /// Bind and serve until the task is dropped
    pub async fn run(self) -> anyhow::Result<()> {
        let addr = format!("{}:{}", self.config.bind_address, self.config.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!("Status API listening on http://{}", addr);

        axum::serve(listener, self.router()).await?;
        Ok(())
    }

    /// Start in a background task
    pub fn start_background(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run().await {
                tracing::error!("Status server error: {}", e);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::SourceConfig;
    use crate::sink::test_support::RecordingSink;
    use crate::status::ApiResponse;
    use crate::tasks::test_support::ManualTaskPool;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn source() -> Arc<C64Source> {
        let config = SourceConfig {
            device_host: "0.0.0.0".into(),
            video_port: 12000,
            audio_port: 12001,
            ..Default::default()
        };
        Arc::new(
            C64Source::open(
                config,
                Arc::new(RecordingSink::default()),
                Arc::new(ManualClock::new(1)),
                Arc::new(ManualTaskPool::default()),
            )
            .unwrap(),
        )
    }

    async fn get_json(router: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), 1 << 20).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_status_endpoint() {
        let server = StatusServer::new(StatusConfig::default(), source());
        let (status, json) = get_json(server.router(), "/api/status").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["success"], true);
        assert_eq!(json["data"]["streaming"], false);
        assert_eq!(json["data"]["offline"], true);
        assert_eq!(json["data"]["video_port"], 12000);
        assert!(json["data"]["timestamp"].is_string());
        assert!(json.get("error").is_none());
    }

    #[tokio::test]
    async fn test_config_endpoint() {
        let server = StatusServer::new(StatusConfig::default(), source());
        let (status, json) = get_json(server.router(), "/api/config").await;

        assert_eq!(status, StatusCode::OK);
        let response: ApiResponse<SourceConfig> = serde_json::from_value(json).unwrap();
        let config = response.data.unwrap();
        assert_eq!(config.device_host, "0.0.0.0");
        assert_eq!(config.audio_port, 12001);
    }

    #[tokio::test]
    async fn test_status_after_close() {
        let source = source();
        source.close();
        let server = StatusServer::new(StatusConfig::default(), source);
        let (status, json) = get_json(server.router(), "/api/status").await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "source is closed");
    }
}
