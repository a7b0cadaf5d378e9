use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::alerts::{ema_breakout_alerts, open_interest_alerts, price_change_alerts};
use super::db::{SnapshotStore, StoreError};
use super::indicators::{change_over_windows, exponential_moving_average, smoothing_input};
use super::markets::{FetchError, MarketDataSource};
use super::types::{
    CurrentSnapshot, OpenInterestSnapshot, OpenInterestView, PriceAlerts, PriceChangeSummary,
    PriceChangeView, PriceView, ReadingKind, StoredReading, Ticker, OI_WINDOWS, PRICE_WINDOWS,
};
use crate::config::MonitorConfig;

/// Read side: fetches a fresh batch on demand and derives changes, EMAs and
/// alerts from it and the stored history. Never writes to the store.
///
/// Every view is best effort. A failed upstream call produces an empty view
/// with `error` set; missing baselines produce zero changes.
pub struct Monitor<S> {
    source: Arc<S>,
    store: SnapshotStore,
    config: Arc<MonitorConfig>,
}

impl<S: MarketDataSource> Monitor<S> {
    pub fn new(source: Arc<S>, store: SnapshotStore, config: Arc<MonitorConfig>) -> Self {
        Self {
            source,
            store,
            config,
        }
    }

    async fn fetch_tickers(&self) -> Result<Vec<Ticker>, FetchError> {
        let instruments = self.source.list_instruments().await?;
        self.source.fetch_current(&instruments).await
    }

    /// Current prices with EMA, plus EMA-breakout and price-change alerts.
    pub async fn current_with_alerts(&self) -> CurrentSnapshot {
        let tickers = match self.fetch_tickers().await {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!("Current price fetch failed: {e}");
                return CurrentSnapshot {
                    error: Some(e.to_string()),
                    ..Default::default()
                };
            }
        };

        let store = self.store.clone();
        let cfg = Arc::clone(&self.config);
        let data = blocking_view(move || {
            tickers
                .into_iter()
                .map(|ticker| {
                    let input = smoothing_input(
                        &store,
                        &ticker.symbol,
                        ticker.price,
                        cfg.ema_source,
                        cfg.ema_history_len,
                    );
                    let ema25 = Some(exponential_moving_average(&input, cfg.ema_span));
                    PriceView { ticker, ema25 }
                })
                .collect::<Vec<_>>()
        })
        .await;

        let data = match data {
            Ok(d) => d,
            Err(e) => {
                return CurrentSnapshot {
                    error: Some(e),
                    ..Default::default()
                };
            }
        };

        let alerts = PriceAlerts {
            ema_alerts: ema_breakout_alerts(&data),
            change_alerts: price_change_alerts(&data, self.config.price_change_threshold),
        };
        CurrentSnapshot {
            data,
            alerts,
            error: None,
        }
    }

    pub async fn open_interest_with_alerts(&self) -> OpenInterestSnapshot {
        self.open_interest_with_alerts_at(Utc::now()).await
    }

    /// Open interest with 5m/15m/1h changes and surge alerts. Instruments
    /// whose request failed are listed in `failed` and left out of `data`.
    pub async fn open_interest_with_alerts_at(&self, now: DateTime<Utc>) -> OpenInterestSnapshot {
        let instruments = match self.source.list_instruments().await {
            Ok(i) => i,
            Err(e) => {
                tracing::warn!("Instrument listing failed: {e}");
                return OpenInterestSnapshot {
                    error: Some(e.to_string()),
                    ..Default::default()
                };
            }
        };

        let (funding, batch) = tokio::join!(
            self.source.fetch_funding_rates(),
            self.source.fetch_open_interest(&instruments),
        );
        let funding = funding.unwrap_or_else(|e| {
            tracing::warn!("Funding rate fetch failed: {e}");
            HashMap::new()
        });

        let failed: Vec<String> = batch.failures.iter().map(|(s, _)| s.clone()).collect();
        if !failed.is_empty() {
            tracing::warn!(
                "Open interest missing for {}/{} instruments",
                failed.len(),
                instruments.len()
            );
        }
        let error = (batch.values.is_empty() && !failed.is_empty())
            .then(|| format!("open interest unavailable for all {} instruments", failed.len()));

        let store = self.store.clone();
        let values = batch.values;
        let data = blocking_view(move || {
            values
                .into_iter()
                .map(|(symbol, open_interest)| OpenInterestView {
                    open_interest_change: change_over_windows(
                        &store,
                        ReadingKind::OpenInterest,
                        &symbol,
                        open_interest,
                        now,
                        &OI_WINDOWS,
                    ),
                    funding_rate: funding.get(&symbol).copied().unwrap_or(0.0),
                    symbol,
                    open_interest,
                })
                .collect::<Vec<_>>()
        })
        .await;
        let (data, error) = match data {
            Ok(d) => (d, error),
            Err(e) => {
                tracing::warn!("Open interest {e}");
                (Vec::new(), Some(e))
            }
        };

        let alerts = open_interest_alerts(&data, self.config.oi_change_threshold);
        OpenInterestSnapshot {
            data,
            alerts,
            failed,
            error,
        }
    }

    pub async fn price_change_summary(&self, symbol: Option<&str>) -> PriceChangeSummary {
        self.price_change_summary_at(Utc::now(), symbol).await
    }

    /// Windowed price changes for every instrument, or for one.
    pub async fn price_change_summary_at(
        &self,
        now: DateTime<Utc>,
        symbol: Option<&str>,
    ) -> PriceChangeSummary {
        let mut tickers = match self.fetch_tickers().await {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!("Price change fetch failed: {e}");
                return PriceChangeSummary {
                    data: Vec::new(),
                    error: Some(e.to_string()),
                };
            }
        };
        if let Some(symbol) = symbol {
            tickers.retain(|t| t.symbol == symbol);
            if tickers.is_empty() {
                return PriceChangeSummary {
                    data: Vec::new(),
                    error: Some(format!("unknown instrument {symbol}")),
                };
            }
        }

        let store = self.store.clone();
        let data = blocking_view(move || {
            tickers
                .into_iter()
                .map(|t| PriceChangeView {
                    change: change_over_windows(
                        &store,
                        ReadingKind::Price,
                        &t.symbol,
                        t.price,
                        now,
                        &PRICE_WINDOWS,
                    ),
                    price: t.price,
                    symbol: t.symbol,
                })
                .collect::<Vec<_>>()
        })
        .await;

        match data {
            Ok(data) => PriceChangeSummary { data, error: None },
            Err(e) => PriceChangeSummary {
                data: Vec::new(),
                error: Some(e),
            },
        }
    }

    /// Stored readings of one kind, newest first.
    pub async fn recent_history(&self, kind: ReadingKind, limit: u32) -> Result<Vec<StoredReading>, StoreError> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.most_recent(kind, limit))
            .await
            .map_err(|e| StoreError::Io(std::io::Error::other(e)))?
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }
}

/// Builds a view on the blocking pool, since it reads the store. A panicked
/// task becomes the view's error string.
async fn blocking_view<T, F>(build: F) -> Result<T, String>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(build)
        .await
        .map_err(|e| format!("view task failed: {e}"))
}
