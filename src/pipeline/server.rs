use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use super::api::{self, AppState};
use super::dispatch::TaskDispatcher;

/// Configuration for the HTTP server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_permissive: bool,
    /// Run dispatch workers inside the server process.
    pub with_workers: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8340,
            cors_permissive: false,
            with_workers: true,
        }
    }
}

/// Build the full application router.
pub fn build_router(state: Arc<AppState>) -> Router {
    api::api_router()
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the API until Ctrl+C, optionally running the dispatch pool
/// alongside it.
pub async fn start_server(config: ServerConfig, dispatcher: TaskDispatcher) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let pool = config.with_workers.then(|| {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            if let Err(e) = dispatcher.run_pool(shutdown_rx).await {
                error!(error = %e, "dispatch pool exited with error");
            }
        })
    });

    let state = Arc::new(AppState::new(dispatcher));
    let mut app = build_router(state);
    if config.cors_permissive {
        app = app.layer(CorsLayer::permissive());
    }

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, workers = config.with_workers, "pipewright server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    let _ = shutdown_tx.send(true);
    if let Some(pool) = pool {
        pool.await.context("Dispatch pool panicked")?;
    }
    info!("server shut down gracefully");
    Ok(())
}

pub async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to install Ctrl+C handler; running until killed");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use crate::agents::AgentRegistry;
    use crate::agents::client::{GenerationClient, GenerationRequest};
    use crate::pipeline::db::{DbHandle, PipelineDb};
    use crate::pipeline::dispatch::DispatchLimits;
    use crate::pipeline::driver::RunDriver;

    struct NoGeneration;

    #[async_trait]
    impl GenerationClient for NoGeneration {
        async fn generate(&self, _request: &GenerationRequest) -> anyhow::Result<String> {
            anyhow::bail!("generation not available in tests")
        }
    }

    fn test_router() -> Router {
        let db = DbHandle::new(PipelineDb::new_in_memory().unwrap());
        let driver = RunDriver::new(db, AgentRegistry::new(), Arc::new(NoGeneration));
        let dispatcher = TaskDispatcher::new(driver, DispatchLimits::default());
        build_router(Arc::new(AppState::new(dispatcher)))
    }

    #[tokio::test]
    async fn test_health_via_full_router() {
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = test_router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_api_routes_mounted() {
        let req = Request::builder()
            .uri("/api/pipelines")
            .body(Body::empty())
            .unwrap();
        let resp = test_router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_route_is_not_found() {
        let req = Request::builder()
            .uri("/api/nothing-here")
            .body(Body::empty())
            .unwrap();
        let resp = test_router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn default_config_binds_loopback() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 8340);
        assert!(!config.cors_permissive);
    }
}
