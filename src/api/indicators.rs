use chrono::{DateTime, Utc};

use super::db::SnapshotStore;
use super::types::{ReadingKind, Window, WindowChanges};
use crate::config::EmaSource;

/// Rounds half away from zero to `places` decimals.
pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

/// Percent change from `previous` to `current`, two decimals.
///
/// A missing or zero baseline yields `0.0`: "no signal", not an error.
pub fn percent_change(current: f64, previous: Option<f64>) -> f64 {
    match previous {
        Some(prev) if prev != 0.0 => round_to((current - prev) / prev * 100.0, 2),
        _ => 0.0,
    }
}

/// Percent change against the stored value `window` ago, for every window.
pub fn change_over_windows(
    store: &SnapshotStore,
    kind: ReadingKind,
    symbol: &str,
    current: f64,
    now: DateTime<Utc>,
    windows: &[Window],
) -> WindowChanges {
    let mut changes = WindowChanges::default();
    for w in windows {
        let baseline = store.latest_at_or_before(kind, symbol, now - w.duration());
        changes.push(w.label, percent_change(current, baseline));
    }
    changes
}

/// Exponential moving average, incremental form.
///
/// Same recurrence as pandas `ewm(span, adjust=False)`: the first
/// observation seeds the value, then `value = α·x + (1−α)·value` with
/// `α = 2/(span+1)`.
#[derive(Debug, Clone)]
pub struct Ema {
    alpha: f64,
    value: Option<f64>,
}

impl Ema {
    pub fn new(span: usize) -> Self {
        Self {
            alpha: 2.0 / (span as f64 + 1.0),
            value: None,
        }
    }

    pub fn update(&mut self, x: f64) -> f64 {
        let next = match self.value {
            None => x,
            Some(prev) => self.alpha * x + (1.0 - self.alpha) * prev,
        };
        self.value = Some(next);
        next
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

/// EMA of the whole sequence, rounded to 4 decimals. Empty input gives `0.0`.
pub fn exponential_moving_average(values: &[f64], span: usize) -> f64 {
    let mut ema = Ema::new(span);
    for &v in values {
        ema.update(v);
    }
    ema.value().map(|v| round_to(v, 4)).unwrap_or(0.0)
}

/// Builds the EMA input for one instrument.
///
/// `History` takes the last `len` stored prices, oldest first, and falls back
/// to the flat sequence while the instrument has no history yet. `Flat`
/// repeats the current price, which makes the EMA equal to the price.
pub fn smoothing_input(
    store: &SnapshotStore,
    symbol: &str,
    current_price: f64,
    source: EmaSource,
    len: usize,
) -> Vec<f64> {
    if source == EmaSource::History {
        let history = store.recent_values(ReadingKind::Price, symbol, len);
        if !history.is_empty() {
            return history;
        }
    }
    vec![current_price; len.max(1)]
}
