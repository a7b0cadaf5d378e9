use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};

use super::markets::MarketDataSource;
use super::server::AppState;
use super::types::*;

const MAX_HISTORY_LIMIT: u32 = 1000;

/// Requested row count, or the configured default, capped at
/// `MAX_HISTORY_LIMIT`.
fn history_limit(requested: Option<u32>, default: u32) -> u32 {
    requested.unwrap_or(default).min(MAX_HISTORY_LIMIT)
}

fn status_for(error: &Option<String>) -> (StatusCode, &'static str) {
    match error {
        None => (StatusCode::OK, "success"),
        Some(_) => (StatusCode::BAD_GATEWAY, "fetch failed"),
    }
}

pub async fn current<S: MarketDataSource>(
    State(state): State<AppState<S>>,
) -> impl IntoResponse {
    let snapshot = state.monitor.current_with_alerts().await;
    let (status, message) = status_for(&snapshot.error);
    (status, Json(Envelope { message, body: snapshot }))
}

pub async fn open_interest<S: MarketDataSource>(
    State(state): State<AppState<S>>,
) -> impl IntoResponse {
    let snapshot = state.monitor.open_interest_with_alerts().await;
    let (status, message) = status_for(&snapshot.error);
    (status, Json(Envelope { message, body: snapshot }))
}

pub async fn price_change<S: MarketDataSource>(
    State(state): State<AppState<S>>,
) -> impl IntoResponse {
    let summary = state.monitor.price_change_summary(None).await;
    let (status, message) = status_for(&summary.error);
    (status, Json(Envelope { message, body: summary }))
}

pub async fn price_change_for<S: MarketDataSource>(
    State(state): State<AppState<S>>,
    Path(symbol): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let summary = state.monitor.price_change_summary(Some(&symbol)).await;

    if let Some(e) = summary
        .error
        .as_deref()
        .filter(|e| e.starts_with("unknown instrument"))
    {
        return Err((StatusCode::NOT_FOUND, e.to_string()));
    }
    let (status, message) = status_for(&summary.error);
    Ok((status, Json(Envelope { message, body: summary })))
}

pub async fn history<S: MarketDataSource>(
    State(state): State<AppState<S>>,
    Query(params): Query<HistoryParams>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let kind = params.kind.unwrap_or(ReadingKind::Price);
    let limit = history_limit(params.limit, state.monitor.config().history_limit);

    let data = state
        .monitor
        .recent_history(kind, limit)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(Json(HistoryResponse { kind, data }))
}

pub async fn health<S: MarketDataSource>(
    State(state): State<AppState<S>>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let store = state.store.clone();
    let (price_rows, open_interest_rows) = tokio::task::spawn_blocking(move || {
        Ok::<_, super::db::StoreError>((
            store.count(ReadingKind::Price)?,
            store.count(ReadingKind::OpenInterest)?,
        ))
    })
    .await
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(Json(HealthResponse {
        status: "ok",
        price_rows,
        open_interest_rows,
        jobs: state.jobs.iter().map(|j| j.stats()).collect(),
    }))
}
