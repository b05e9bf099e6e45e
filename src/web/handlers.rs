//! HTTP request handlers.

use super::AppState;
use crate::metrics;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{Html, IntoResponse},
};

const LANDING_TEMPLATE: &str = r#"<html>
<head><title>Ping Exporter</title></head>
<body>
<h1>Ping Exporter</h1>
<p><a href="{{metrics_path}}">Metrics</a></p>
</body>
</html>
"#;

pub async fn handle_landing(State(state): State<AppState>) -> impl IntoResponse {
    Html(LANDING_TEMPLATE.replace("{{metrics_path}}", &state.metrics_path))
}

pub async fn handle_metrics(State(state): State<AppState>) -> impl IntoResponse {
    match metrics::encode(&state.registry) {
        Ok(body) => ([(header::CONTENT_TYPE, metrics::content_type())], body).into_response(),
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// Re-read the config file.
///
/// Running probes keep their settings; the new snapshot applies on restart.
pub async fn handle_reload(State(state): State<AppState>) -> impl IntoResponse {
    match state.config.reload(&state.config_path) {
        Ok(()) => {
            tracing::info!(
                "Reloaded config {} ({} hosts); running probes are unchanged until restart",
                state.config_path.display(),
                state.config.snapshot().host_count()
            );
            (StatusCode::OK, "OK\n").into_response()
        }
        Err(e) => {
            tracing::error!(
                "Failed to reload config {}: {}",
                state.config_path.display(),
                e
            );
            (StatusCode::INTERNAL_SERVER_ERROR, format!("{}\n", e)).into_response()
        }
    }
}
