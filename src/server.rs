//! HTTP surface
//!
//! - `POST /api/visual-diff` runs a comparison for `{referenceUrl, testUrl}`
//! - `GET {prefix}/:comparison_id/:file` serves stored artifacts
//! - `GET /health` liveness probe
//!
//! Missing URLs are the caller's fault (400). Everything else, including a
//! body that is not a JSON object of strings, is logged with full detail and
//! reduced to a generic 500 message for the caller.

use crate::orchestrator::Orchestrator;
use crate::store::{normalize_prefix, DEFAULT_PUBLIC_PREFIX};
use crate::Error;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use log::{error, info, warn};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;

pub const MISSING_URLS_MESSAGE: &str = "Both referenceUrl and testUrl are required";
pub const COMPARE_FAILED_MESSAGE: &str = "Failed to compare URLs";

/// Server settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// Route prefix artifacts are served under; must match the store's prefix
    pub public_prefix: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 3000)),
            public_prefix: DEFAULT_PUBLIC_PREFIX.to_string(),
        }
    }
}

/// Request body for `POST /api/visual-diff`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompareRequest {
    #[serde(default)]
    pub reference_url: Option<String>,
    #[serde(default)]
    pub test_url: Option<String>,
}

#[derive(Clone)]
struct AppState {
    orchestrator: Arc<Orchestrator>,
    public_prefix: String,
}

/// Build the router. `public_prefix` is where artifacts are served from.
pub fn router(orchestrator: Arc<Orchestrator>, public_prefix: &str) -> Router {
    let prefix = normalize_prefix(public_prefix);
    let state = AppState {
        orchestrator,
        public_prefix: prefix.clone(),
    };
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/visual-diff", post(visual_diff_handler))
        .route(&format!("{}/:comparison_id/:file", prefix), get(artifact_handler))
        .with_state(state)
}

/// Bind and serve until ctrl-c.
pub async fn serve(orchestrator: Arc<Orchestrator>, config: ServerConfig) -> anyhow::Result<()> {
    let app = router(orchestrator, &config.public_prefix);
    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    info!("Listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutting down");
        })
        .await?;
    Ok(())
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

async fn health_handler() -> impl IntoResponse {
    "ok"
}

async fn visual_diff_handler(State(state): State<AppState>, body: Bytes) -> Response {
    let request: CompareRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(e) => {
            error!("Visual comparison error: unreadable request body: {}", e);
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, COMPARE_FAILED_MESSAGE);
        }
    };

    let reference_url = request.reference_url.unwrap_or_default();
    let test_url = request.test_url.unwrap_or_default();

    match state.orchestrator.run(&reference_url, &test_url).await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) if e.is_client_error() => error_response(StatusCode::BAD_REQUEST, MISSING_URLS_MESSAGE),
        Err(e) => {
            error!("Visual comparison error: {}", e.describe());
            error_response(StatusCode::INTERNAL_SERVER_ERROR, COMPARE_FAILED_MESSAGE)
        }
    }
}

async fn artifact_handler(
    State(state): State<AppState>,
    Path((comparison_id, file)): Path<(String, String)>,
) -> Response {
    let relative = format!("{}/{}/{}", state.public_prefix, comparison_id, file);
    let store = Arc::clone(state.orchestrator.store());
    let lookup = relative.clone();
    let read = tokio::task::spawn_blocking(move || store.read(&lookup)).await;

    match read {
        Ok(Ok(bytes)) => (StatusCode::OK, [(header::CONTENT_TYPE, "image/png")], bytes).into_response(),
        Ok(Err(Error::NotFound(_))) => error_response(StatusCode::NOT_FOUND, "Not found"),
        Ok(Err(e)) => {
            error!("Failed to read artifact {}: {}", relative, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to read artifact")
        }
        Err(e) => {
            error!("Artifact read task failed for {}: {}", relative, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to read artifact")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_accepts_missing_fields() {
        let req: CompareRequest = serde_json::from_str(r#"{"referenceUrl":"https://a"}"#).unwrap();
        assert_eq!(req.reference_url.as_deref(), Some("https://a"));
        assert!(req.test_url.is_none());
    }

    #[test]
    fn request_rejects_non_string_urls() {
        assert!(serde_json::from_str::<CompareRequest>(r#"{"referenceUrl":1,"testUrl":"https://b"}"#).is_err());
    }

    #[test]
    fn default_config_serves_screenshots() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.public_prefix, "/screenshots");
        assert_eq!(cfg.bind.port(), 3000);
    }
}
