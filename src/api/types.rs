use chrono::{DateTime, Utc};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

use super::alerts::{AlertEvent, OpenInterestAlert};

// -- Stored readings --

/// Reading kind; each kind lives in its own table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadingKind {
    Price,
    OpenInterest,
}

impl ReadingKind {
    pub const ALL: [ReadingKind; 2] = [ReadingKind::Price, ReadingKind::OpenInterest];

    pub fn table(self) -> &'static str {
        match self {
            Self::Price => "price_history",
            Self::OpenInterest => "open_interest",
        }
    }

    pub fn value_column(self) -> &'static str {
        match self {
            Self::Price => "price",
            Self::OpenInterest => "open_interest",
        }
    }
}

/// One observation for one instrument: a price or an open-interest figure
/// depending on the kind it is written under.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub symbol: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

impl Reading {
    pub fn new(symbol: impl Into<String>, value: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.into(),
            value,
            timestamp,
        }
    }
}

/// A row read back from the store. `timestamp` is minute-aligned.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredReading {
    pub symbol: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

// -- Lookback windows --

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub label: &'static str,
    pub minutes: i64,
}

impl Window {
    pub const fn new(label: &'static str, minutes: i64) -> Self {
        Self { label, minutes }
    }

    pub fn duration(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.minutes)
    }
}

pub const PRICE_WINDOWS: [Window; 6] = [
    Window::new("1m", 1),
    Window::new("2m", 2),
    Window::new("5m", 5),
    Window::new("20m", 20),
    Window::new("40m", 40),
    Window::new("1h", 60),
];

pub const OI_WINDOWS: [Window; 3] = [
    Window::new("5m", 5),
    Window::new("15m", 15),
    Window::new("1h", 60),
];

/// Window label → percent change, serialized as a JSON object in window order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WindowChanges(Vec<(&'static str, f64)>);

impl WindowChanges {
    pub fn push(&mut self, label: &'static str, change: f64) {
        self.0.push((label, change));
    }

    pub fn get(&self, label: &str) -> Option<f64> {
        self.0.iter().find(|(l, _)| *l == label).map(|(_, c)| *c)
    }
}

impl Serialize for WindowChanges {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (label, change) in &self.0 {
            map.serialize_entry(label, change)?;
        }
        map.end()
    }
}

// -- Market data --

/// Current market state for one instrument as reported by the source.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticker {
    pub symbol: String,
    pub price: f64,
    /// 24h change in percent.
    pub change: f64,
    /// 24h quote volume.
    pub volume: f64,
    pub funding_rate: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceView {
    #[serde(flatten)]
    pub ticker: Ticker,
    pub ema25: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenInterestView {
    pub symbol: String,
    pub funding_rate: f64,
    pub open_interest: f64,
    pub open_interest_change: WindowChanges,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceChangeView {
    pub symbol: String,
    pub price: f64,
    pub change: WindowChanges,
}

// -- Derived payloads --

#[derive(Debug, Clone, Default, Serialize)]
pub struct PriceAlerts {
    pub ema_alerts: Vec<AlertEvent>,
    pub change_alerts: Vec<AlertEvent>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CurrentSnapshot {
    pub data: Vec<PriceView>,
    pub alerts: PriceAlerts,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OpenInterestSnapshot {
    pub data: Vec<OpenInterestView>,
    pub alerts: Vec<OpenInterestAlert>,
    /// Instruments whose open-interest request failed.
    pub failed: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PriceChangeSummary {
    pub data: Vec<PriceChangeView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// -- HTTP --

#[derive(Serialize)]
pub struct Envelope<T: Serialize> {
    pub message: &'static str,
    #[serde(flatten)]
    pub body: T,
}

#[derive(Deserialize)]
pub struct HistoryParams {
    pub kind: Option<ReadingKind>,
    pub limit: Option<u32>,
}

#[derive(Serialize)]
pub struct HistoryResponse {
    pub kind: ReadingKind,
    pub data: Vec<StoredReading>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub price_rows: u64,
    pub open_interest_rows: u64,
    pub jobs: Vec<super::scheduler::JobStats>,
}
