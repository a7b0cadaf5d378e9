use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::Semaphore;

use super::types::Ticker;

/// Failure talking to the market data source. For open interest this is
/// reported per instrument and never fails the whole batch.
#[derive(Debug)]
pub enum FetchError {
    Timeout,
    Request(String),
    Status(u16),
    Decode(String),
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "request timed out"),
            Self::Request(msg) => write!(f, "request failed: {msg}"),
            Self::Status(code) => write!(f, "unexpected status {code}"),
            Self::Decode(msg) => write!(f, "malformed response: {msg}"),
        }
    }
}

impl std::error::Error for FetchError {}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            Self::Request(e.to_string())
        }
    }
}

/// Result of an open-interest fan-out: what arrived, and what didn't.
#[derive(Debug, Default)]
pub struct OpenInterestBatch {
    pub values: Vec<(String, f64)>,
    pub failures: Vec<(String, FetchError)>,
}

/// Upstream provider of current market readings.
pub trait MarketDataSource: Send + Sync + 'static {
    /// Tradeable perpetual contracts quoted in the configured asset.
    fn list_instruments(&self) -> impl Future<Output = Result<Vec<String>, FetchError>> + Send;

    /// Current price, 24h change, volume and funding rate for the requested
    /// instruments. Instruments the source doesn't know are omitted.
    fn fetch_current(
        &self,
        instruments: &[String],
    ) -> impl Future<Output = Result<Vec<Ticker>, FetchError>> + Send;

    fn fetch_funding_rates(
        &self,
    ) -> impl Future<Output = Result<HashMap<String, f64>, FetchError>> + Send;

    /// Open interest per instrument. Individual failures land in
    /// `OpenInterestBatch::failures`.
    fn fetch_open_interest(
        &self,
        instruments: &[String],
    ) -> impl Future<Output = OpenInterestBatch> + Send;
}

// ---------------------------------------------------------------------------
// Binance USDⓈ-M futures
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct BinanceClient {
    http: reqwest::Client,
    base_url: String,
    quote_asset: String,
    timeout: Duration,
    concurrency: usize,
}

impl BinanceClient {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        quote_asset: impl Into<String>,
        timeout: Duration,
        concurrency: usize,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            quote_asset: quote_asset.into(),
            timeout,
            concurrency: concurrency.max(1),
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, FetchError> {
        let resp = self
            .http
            .get(format!("{}{path}", self.base_url))
            .query(query)
            .timeout(self.timeout)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        Ok(resp.json::<T>().await?)
    }

    async fn open_interest_for(&self, symbol: &str) -> Result<f64, FetchError> {
        let body: OpenInterestResponse = self
            .get_json("/fapi/v1/openInterest", &[("symbol", symbol)])
            .await?;
        let raw = body
            .open_interest
            .ok_or_else(|| FetchError::Decode("missing openInterest".into()))?;
        parse_number(&raw, "openInterest")
    }
}

impl MarketDataSource for BinanceClient {
    async fn list_instruments(&self) -> Result<Vec<String>, FetchError> {
        let info: ExchangeInfo = self.get_json("/fapi/v1/exchangeInfo", &[]).await?;
        Ok(perpetual_symbols(&info, &self.quote_asset))
    }

    async fn fetch_current(&self, instruments: &[String]) -> Result<Vec<Ticker>, FetchError> {
        let (tickers, funding) = tokio::join!(
            self.get_json::<Vec<RawTicker>>("/fapi/v1/ticker/24hr", &[]),
            self.fetch_funding_rates(),
        );
        let tickers = tickers?;
        // Funding is decoration; prices are still useful without it.
        let funding = funding.unwrap_or_else(|e| {
            tracing::warn!("Funding rate fetch failed, continuing without: {e}");
            HashMap::new()
        });
        Ok(build_tickers(tickers, &funding, instruments))
    }

    async fn fetch_funding_rates(&self) -> Result<HashMap<String, f64>, FetchError> {
        let rows: Vec<PremiumIndex> = self.get_json("/fapi/v1/premiumIndex", &[]).await?;
        Ok(rows
            .into_iter()
            .map(|p| {
                let rate = p
                    .last_funding_rate
                    .as_deref()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0.0);
                (p.symbol, rate)
            })
            .collect())
    }

    async fn fetch_open_interest(&self, instruments: &[String]) -> OpenInterestBatch {
        let sem = Arc::new(Semaphore::new(self.concurrency));
        let mut handles = Vec::with_capacity(instruments.len());

        for symbol in instruments {
            let client = self.clone();
            let symbol = symbol.clone();
            let sem = Arc::clone(&sem);
            handles.push(tokio::spawn(async move {
                let _permit = sem
                    .acquire_owned()
                    .await
                    .map_err(|e| FetchError::Request(e.to_string()))?;
                client.open_interest_for(&symbol).await
            }));
        }

        let mut batch = OpenInterestBatch::default();
        for (symbol, handle) in instruments.iter().zip(handles) {
            match handle.await {
                Ok(Ok(value)) => batch.values.push((symbol.clone(), value)),
                Ok(Err(e)) => {
                    tracing::debug!("Open interest fetch failed for {symbol}: {e}");
                    batch.failures.push((symbol.clone(), e));
                }
                Err(e) => batch
                    .failures
                    .push((symbol.clone(), FetchError::Request(e.to_string()))),
            }
        }
        batch
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SymbolInfo {
    symbol: String,
    #[serde(default)]
    contract_type: String,
    #[serde(default)]
    quote_asset: String,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTicker {
    symbol: String,
    last_price: String,
    #[serde(default)]
    price_change_percent: Option<String>,
    #[serde(default)]
    quote_volume: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PremiumIndex {
    symbol: String,
    #[serde(default)]
    last_funding_rate: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenInterestResponse {
    #[serde(default)]
    open_interest: Option<String>,
}

fn parse_number(raw: &str, field: &str) -> Result<f64, FetchError> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| FetchError::Decode(format!("{field}={raw:?}")))
}

fn perpetual_symbols(info: &ExchangeInfo, quote_asset: &str) -> Vec<String> {
    info.symbols
        .iter()
        .filter(|s| s.contract_type == "PERPETUAL" && s.quote_asset == quote_asset)
        .filter(|s| s.status.as_deref().is_none_or(|st| st == "TRADING"))
        .map(|s| s.symbol.clone())
        .collect()
}

/// Keeps requested instruments only; rows with an unparseable price are
/// dropped, optional numeric fields default to 0.
fn build_tickers(
    raw: Vec<RawTicker>,
    funding: &HashMap<String, f64>,
    instruments: &[String],
) -> Vec<Ticker> {
    let wanted: HashSet<&str> = instruments.iter().map(String::as_str).collect();
    raw.into_iter()
        .filter(|t| wanted.contains(t.symbol.as_str()))
        .filter_map(|t| {
            let price = match parse_number(&t.last_price, "lastPrice") {
                Ok(p) => p,
                Err(e) => {
                    tracing::debug!("Skipping ticker {}: {e}", t.symbol);
                    return None;
                }
            };
            let opt = |v: &Option<String>| v.as_deref().and_then(|s| s.parse().ok()).unwrap_or(0.0);
            Some(Ticker {
                funding_rate: funding.get(&t.symbol).copied(),
                price,
                change: opt(&t.price_change_percent),
                volume: opt(&t.quote_volume),
                symbol: t.symbol,
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Scripted source for tests
// ---------------------------------------------------------------------------


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exchange_info_keeps_trading_perpetuals_in_quote_asset() {
        let info: ExchangeInfo = serde_json::from_str(
            r#"{"symbols":[
                {"symbol":"BTCUSDT","contractType":"PERPETUAL","quoteAsset":"USDT","status":"TRADING"},
                {"symbol":"ETHUSDT_240329","contractType":"CURRENT_QUARTER","quoteAsset":"USDT","status":"TRADING"},
                {"symbol":"BTCUSDC","contractType":"PERPETUAL","quoteAsset":"USDC","status":"TRADING"},
                {"symbol":"OLDUSDT","contractType":"PERPETUAL","quoteAsset":"USDT","status":"SETTLING"},
                {"symbol":"SOLUSDT","contractType":"PERPETUAL","quoteAsset":"USDT"}
            ]}"#,
        )
        .unwrap();
        assert_eq!(perpetual_symbols(&info, "USDT"), vec!["BTCUSDT", "SOLUSDT"]);
    }

    #[test]
    fn tickers_are_filtered_and_tolerate_missing_fields() {
        let raw: Vec<RawTicker> = serde_json::from_str(
            r#"[
                {"symbol":"BTCUSDT","lastPrice":"65000.10","priceChangePercent":"-3.25","quoteVolume":"1200.5"},
                {"symbol":"ETHUSDT","lastPrice":"3500","priceChangePercent":"bad"},
                {"symbol":"XRPUSDT","lastPrice":"NaN"},
                {"symbol":"DOGEUSDT","lastPrice":"0.1"}
            ]"#,
        )
        .unwrap();
        let funding = HashMap::from([("BTCUSDT".to_string(), 0.0001)]);
        let wanted: Vec<String> = ["BTCUSDT", "ETHUSDT", "XRPUSDT"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let tickers = build_tickers(raw, &funding, &wanted);
        assert_eq!(tickers.len(), 2);
        assert_eq!(tickers[0].symbol, "BTCUSDT");
        assert_eq!(tickers[0].change, -3.25);
        assert_eq!(tickers[0].funding_rate, Some(0.0001));
        assert_eq!(tickers[1].symbol, "ETHUSDT");
        assert_eq!(tickers[1].change, 0.0);
        assert_eq!(tickers[1].volume, 0.0);
        assert_eq!(tickers[1].funding_rate, None);
    }

    #[test]
    fn open_interest_body_without_value_is_malformed() {
        let body: OpenInterestResponse =
            serde_json::from_str(r#"{"code":-1121,"msg":"Invalid symbol."}"#).unwrap();
        assert!(body.open_interest.is_none());
        assert!(matches!(parse_number("abc", "openInterest"), Err(FetchError::Decode(_))));
        assert_eq!(parse_number(" 123.5 ", "openInterest").unwrap(), 123.5);
    }
}
