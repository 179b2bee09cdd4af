//! HTTP API over the job state machine.

pub mod api;

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::info;

pub use api::{AppState, SharedState};

pub fn build_router(state: SharedState) -> Router {
    api::api_router()
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Bind `addr` and serve until `shutdown` resolves.
pub async fn serve(
    state: AppState,
    addr: &str,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;
    let local_addr = listener.local_addr()?;
    info!(%local_addr, "API listening");

    axum::serve(listener, build_router(Arc::new(state)))
        .with_graceful_shutdown(shutdown)
        .await
        .context("Server error")?;

    info!("API shut down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestHarness;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_unknown_route_is_not_found() {
        let h = TestHarness::new();
        let app = build_router(Arc::new(AppState {
            transitions: h.transitions.clone(),
            secrets: h.secrets.clone(),
            artifacts: h.artifacts.clone(),
        }));
        let request = Request::builder().uri("/nope").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_serve_stops_on_shutdown() {
        let h = TestHarness::new();
        let state = AppState {
            transitions: h.transitions.clone(),
            secrets: h.secrets.clone(),
            artifacts: h.artifacts.clone(),
        };
        serve(state, "127.0.0.1:0", async {}).await.unwrap();
    }
}
