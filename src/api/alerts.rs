use serde::Serialize;

use super::types::{OpenInterestView, PriceView};

// ---------------------------------------------------------------------------
// Alert types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind")]
pub enum AlertEvent {
    EmaBreakout {
        symbol: String,
        price: f64,
        ema25: f64,
        message: String,
    },
    PriceChange {
        symbol: String,
        change: f64,
        threshold: f64,
        message: String,
    },
}

impl AlertEvent {
    pub fn symbol(&self) -> &str {
        match self {
            Self::EmaBreakout { symbol, .. } | Self::PriceChange { symbol, .. } => symbol,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OpenInterestAlert {
    pub symbol: String,
    pub change_5m: f64,
    #[serde(rename = "openInterest")]
    pub open_interest: f64,
}

// ---------------------------------------------------------------------------
// Evaluators. Pure and total: missing optional inputs count as 0.
// ---------------------------------------------------------------------------

/// One alert per instrument trading above its EMA.
pub fn ema_breakout_alerts(readings: &[PriceView]) -> Vec<AlertEvent> {
    readings
        .iter()
        .filter_map(|r| {
            let ema25 = r.ema25.unwrap_or(0.0);
            (r.ticker.price > ema25).then(|| AlertEvent::EmaBreakout {
                symbol: r.ticker.symbol.clone(),
                price: r.ticker.price,
                ema25,
                message: format!("{} broke above EMA25", r.ticker.symbol),
            })
        })
        .collect()
}

/// One alert per instrument whose change moved at least `threshold`
/// percent in either direction.
pub fn price_change_alerts(readings: &[PriceView], threshold: f64) -> Vec<AlertEvent> {
    readings
        .iter()
        .filter(|r| r.ticker.change.abs() >= threshold)
        .map(|r| AlertEvent::PriceChange {
            symbol: r.ticker.symbol.clone(),
            change: r.ticker.change,
            threshold,
            message: format!("{} moved more than {threshold}%", r.ticker.symbol),
        })
        .collect()
}

/// Open interest up by at least `threshold` percent over 5 minutes.
/// Only increases alert; a collapse in open interest is not a signal here.
pub fn open_interest_alerts(readings: &[OpenInterestView], threshold: f64) -> Vec<OpenInterestAlert> {
    readings
        .iter()
        .filter_map(|r| {
            let change_5m = r.open_interest_change.get("5m").unwrap_or(0.0);
            (change_5m >= threshold).then(|| OpenInterestAlert {
                symbol: r.symbol.clone(),
                change_5m,
                open_interest: r.open_interest,
            })
        })
        .collect()
}
