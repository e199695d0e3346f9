//! API Server - HTTP server for the token endpoints

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::api::handlers::{self, AppState};
use crate::engine::QuotaEngine;

/// API Server configuration
pub struct ApiServer {
    state: Arc<AppState>,
    addr: String,
}

impl ApiServer {
    pub fn new(engine: Arc<QuotaEngine>, addr: String) -> Self {
        Self {
            state: Arc::new(AppState { engine }),
            addr,
        }
    }

    /// Build the router with all routes
    pub fn router(&self) -> Router {
        router(self.state.clone())
    }

    /// Serve until `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) -> std::io::Result<()> {
        let router = self.router();

        info!("Starting API server on {}", self.addr);

        let listener = tokio::net::TcpListener::bind(&self.addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("API server stopped");
        Ok(())
    }
}

/// Routes over shared state
pub fn router(state: Arc<AppState>) -> Router {
    let token_routes = Router::new()
        .route("/remaining", get(handlers::remaining))
        .route("/validate", post(handlers::validate))
        .route("/reservations", post(handlers::reserve))
        .route("/reservations/:id/reconcile", post(handlers::reconcile))
        .route("/tenants/:tenant_id/usage", get(handlers::tenant_usage))
        .route("/queue", post(handlers::enqueue))
        .route(
            "/queue/:ticket_id",
            get(handlers::queue_status).delete(handlers::cancel_ticket),
        );

    Router::new()
        .route("/health", get(handlers::health))
        .nest("/tokens", token_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
