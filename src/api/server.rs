use std::sync::Arc;

use axum::{routing::get, Router};
use tower_http::cors::{Any, CorsLayer};

use super::db::SnapshotStore;
use super::markets::MarketDataSource;
use super::monitor::Monitor;
use super::routes;
use super::scheduler::Job;

pub struct AppState<S> {
    pub monitor: Arc<Monitor<S>>,
    pub store: SnapshotStore,
    pub jobs: Vec<Arc<Job>>,
}

impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            monitor: Arc::clone(&self.monitor),
            store: self.store.clone(),
            jobs: self.jobs.clone(),
        }
    }
}

pub fn router<S: MarketDataSource>(state: AppState<S>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/data", get(routes::current::<S>))
        .route("/api/open_interest", get(routes::open_interest::<S>))
        .route("/api/price_change", get(routes::price_change::<S>))
        .route("/api/price_change/{symbol}", get(routes::price_change_for::<S>))
        .route("/api/history", get(routes::history::<S>))
        .route("/api/health", get(routes::health::<S>))
        .layer(cors)
        .with_state(state)
}

pub async fn run<S: MarketDataSource>(
    state: AppState<S>,
    bind: &str,
    port: u16,
) -> std::io::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(format!("{bind}:{port}")).await?;

    tracing::info!("API server listening on {bind}:{port}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to install Ctrl+C handler: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received, stopping");
}
