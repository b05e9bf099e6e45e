//! Web server module.

mod handlers;

use crate::config::ConfigStore;

use axum::{
    routing::{get, post},
    Router,
};
use prometheus::Registry;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Path that triggers a config reload.
pub const RELOAD_PATH: &str = "/-/reload";

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Registry,
    pub metrics_path: String,
    pub config: Arc<ConfigStore>,
    pub config_path: PathBuf,
}

/// Web server exposing the metrics registry.
pub struct Server {
    state: AppState,
}

impl Server {
    /// Create a new server with the given dependencies.
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Build the router with all routes.
    pub fn routes(&self) -> Router {
        Router::new()
            .route("/", get(handlers::handle_landing))
            .route(&self.state.metrics_path, get(handlers::handle_metrics))
            .route(RELOAD_PATH, post(handlers::handle_reload))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Serve on `addr` until `shutdown` resolves.
    pub async fn start<F>(
        &self,
        addr: SocketAddr,
        shutdown: F,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let router = self.routes();

        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("Web server listening on {}", addr);

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}
