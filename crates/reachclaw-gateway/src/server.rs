//! HTTP server implementation using Axum.

use axum::{
    Router,
    routing::{get, post},
};
use reachclaw_core::config::GatewayConfig;
use reachclaw_scheduler::Pipeline;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared state for the gateway server.
#[derive(Clone)]
pub struct AppState {
    pub gateway_config: GatewayConfig,
    pub start_time: std::time::Instant,
    /// Lifecycle operations and the store behind them.
    pub pipeline: Arc<Pipeline>,
}

impl AppState {
    pub fn new(gateway_config: GatewayConfig, pipeline: Arc<Pipeline>) -> Self {
        Self {
            gateway_config,
            start_time: std::time::Instant::now(),
            pipeline,
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    let shared = Arc::new(state);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(super::routes::health_check))
        .route("/api/v1/info", get(super::routes::system_info))
        .route("/api/v1/metrics", get(super::routes::metrics))
        // Contacts
        .route("/api/v1/contacts", get(super::routes::list_contacts))
        .route("/api/v1/contacts/{id}", get(super::routes::get_contact))
        .route("/api/v1/contacts/{id}/override", post(super::routes::override_contact))
        .route("/api/v1/contacts/{id}/opt-out", post(super::routes::opt_out_contact))
        .route("/api/v1/contacts/{id}/release", post(super::routes::release_contact))
        .route("/api/v1/audit", get(super::routes::list_audit))
        // Content review
        .route("/api/v1/posts", get(super::routes::list_posts))
        .route(
            "/api/v1/posts/{id}",
            get(super::routes::get_post).put(super::routes::edit_post),
        )
        .route("/api/v1/posts/{id}/approve", post(super::routes::approve_post))
        .route("/api/v1/posts/{id}/reject", post(super::routes::reject_post))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(shared)
}

/// Serve until `shutdown` flips to true.
pub async fn start(
    config: &GatewayConfig,
    pipeline: Arc<Pipeline>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let app = build_router(AppState::new(config.clone(), pipeline));

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("🌐 Gateway server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            while shutdown.changed().await.is_ok() {
                if *shutdown.borrow() {
                    break;
                }
            }
        })
        .await?;
    tracing::info!("🛑 Gateway stopped");
    Ok(())
}
