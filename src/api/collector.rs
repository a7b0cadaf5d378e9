use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::db::{SnapshotStore, StoreError};
use super::markets::{FetchError, MarketDataSource};
use super::types::{Reading, ReadingKind};
use crate::config::MonitorConfig;

/// Failure of a whole collection run. Per-instrument fetch failures and
/// per-entry write failures are not errors at this level.
#[derive(Debug)]
pub enum CollectError {
    Fetch(FetchError),
    Store(StoreError),
    Task(String),
}

impl std::fmt::Display for CollectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fetch(e) => write!(f, "fetch failed: {e}"),
            Self::Store(e) => write!(f, "write failed: {e}"),
            Self::Task(msg) => write!(f, "blocking task failed: {msg}"),
        }
    }
}

impl std::error::Error for CollectError {}

impl From<FetchError> for CollectError {
    fn from(e: FetchError) -> Self {
        Self::Fetch(e)
    }
}

impl From<StoreError> for CollectError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

#[derive(Debug, Default, PartialEq)]
pub struct CollectReport {
    pub fetched: usize,
    pub written: usize,
    /// Instruments the source failed to return.
    pub failed: Vec<String>,
}

/// Fetch → store pipelines, one per reading kind.
pub struct Collector<S> {
    source: Arc<S>,
    store: SnapshotStore,
    config: Arc<MonitorConfig>,
}

impl<S: MarketDataSource> Collector<S> {
    pub fn new(source: Arc<S>, store: SnapshotStore, config: Arc<MonitorConfig>) -> Self {
        Self {
            source,
            store,
            config,
        }
    }

    /// Scheduled price job.
    pub async fn collect_prices(&self) -> Result<(), CollectError> {
        let now = Utc::now();
        let report = self.collect_prices_at(now).await?;
        tracing::info!(
            "Saved {}/{} price snapshots",
            report.written,
            report.fetched
        );
        self.apply_retention(now).await;
        Ok(())
    }

    /// Scheduled open-interest job.
    pub async fn collect_open_interest(&self) -> Result<(), CollectError> {
        let report = self.collect_open_interest_at(Utc::now()).await?;
        if report.failed.is_empty() {
            tracing::info!("Saved {}/{} open interest snapshots", report.written, report.fetched);
        } else {
            tracing::warn!(
                "Saved {}/{} open interest snapshots, {} instruments failed (first: {})",
                report.written,
                report.fetched,
                report.failed.len(),
                report.failed.iter().take(5).cloned().collect::<Vec<_>>().join(", ")
            );
        }
        Ok(())
    }

    pub async fn collect_prices_at(&self, now: DateTime<Utc>) -> Result<CollectReport, CollectError> {
        let instruments = self.source.list_instruments().await?;
        let tickers = self.source.fetch_current(&instruments).await?;

        let readings: Vec<Reading> = tickers
            .into_iter()
            .map(|t| Reading::new(t.symbol, t.price, now))
            .collect();
        let fetched = readings.len();
        let written = self.write(ReadingKind::Price, readings).await?;

        Ok(CollectReport {
            fetched,
            written,
            failed: Vec::new(),
        })
    }

    pub async fn collect_open_interest_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<CollectReport, CollectError> {
        let instruments = self.source.list_instruments().await?;
        let batch = self.source.fetch_open_interest(&instruments).await;

        let readings: Vec<Reading> = batch
            .values
            .into_iter()
            .map(|(symbol, oi)| Reading::new(symbol, oi, now))
            .collect();
        let fetched = readings.len();
        let written = self.write(ReadingKind::OpenInterest, readings).await?;

        Ok(CollectReport {
            fetched,
            written,
            failed: batch.failures.into_iter().map(|(symbol, _)| symbol).collect(),
        })
    }

    async fn write(&self, kind: ReadingKind, readings: Vec<Reading>) -> Result<usize, CollectError> {
        let store = self.store.clone();
        let written = tokio::task::spawn_blocking(move || store.upsert_batch(kind, &readings))
            .await
            .map_err(|e| CollectError::Task(e.to_string()))??;
        Ok(written)
    }

    async fn apply_retention(&self, now: DateTime<Utc>) {
        let Some(days) = self.config.retention_days else {
            return;
        };
        let cutoff = now - chrono::Duration::days(i64::from(days));
        let store = self.store.clone();
        match tokio::task::spawn_blocking(move || store.prune_before(cutoff)).await {
            Ok(Ok(0)) => {}
            Ok(Ok(n)) => tracing::info!("Pruned {n} snapshots older than {days}d"),
            Ok(Err(e)) => tracing::warn!("Retention prune failed: {e}"),
            Err(e) => tracing::warn!("Retention prune task failed: {e}"),
        }
    }
}
