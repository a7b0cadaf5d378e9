use std::env;
use std::time::Duration;

/// How the EMA input sequence is built for an instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmaSource {
    /// Last K stored prices, oldest first.
    History,
    /// Current price repeated K times. Kept for compatibility with the old
    /// dashboard; the result is always the current price.
    Flat,
}

/// Monitor configuration derived from environment variables.
/// Read once at startup and never mutated afterwards.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub bind: String,
    pub port: u16,
    pub db_path: String,
    pub binance_base_url: String,
    pub quote_asset: String,

    pub collect_interval: Duration,
    pub fetch_timeout: Duration,
    pub fetch_concurrency: usize,

    pub price_change_threshold: f64,
    pub oi_change_threshold: f64,

    pub ema_span: usize,
    pub ema_source: EmaSource,
    pub ema_history_len: usize,

    /// `None` keeps every row forever.
    pub retention_days: Option<u32>,
    pub history_limit: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl MonitorConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds the config from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        };
        let str_or = |name: &str, default: &str| get(name).unwrap_or_else(|| default.to_string());

        let ema_source = match get("EMA_SOURCE").as_deref().map(str::to_lowercase).as_deref() {
            Some("flat") => EmaSource::Flat,
            Some("history") | None => EmaSource::History,
            Some(other) => {
                tracing::warn!("Unknown EMA_SOURCE={other}, using history");
                EmaSource::History
            }
        };

        Self {
            bind: str_or("API_BIND", "0.0.0.0"),
            port: parse_or(get("API_PORT"), 5000),
            db_path: str_or("MONITOR_DB_PATH", "data/monitor.db"),
            binance_base_url: str_or("BINANCE_BASE_URL", "https://fapi.binance.com")
                .trim_end_matches('/')
                .to_string(),
            quote_asset: str_or("QUOTE_ASSET", "USDT"),
            collect_interval: Duration::from_secs(parse_or::<u64>(get("COLLECT_INTERVAL_SECS"), 60).max(1)),
            fetch_timeout: Duration::from_secs(parse_or::<u64>(get("FETCH_TIMEOUT_SECS"), 10).max(1)),
            fetch_concurrency: parse_or::<usize>(get("FETCH_CONCURRENCY"), 20).max(1),
            price_change_threshold: parse_or(get("PRICE_CHANGE_THRESHOLD"), 3.0),
            oi_change_threshold: parse_or(get("OI_CHANGE_THRESHOLD"), 15.0),
            ema_span: parse_or::<usize>(get("EMA_SPAN"), 25).max(1),
            ema_source,
            ema_history_len: parse_or::<usize>(get("EMA_HISTORY_LEN"), 30).max(1),
            retention_days: get("RETENTION_DAYS")
                .and_then(|s| s.parse().ok())
                .filter(|d| *d > 0),
            history_limit: parse_or(get("HISTORY_LIMIT"), 100),
        }
    }
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|s| s.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> MonitorConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        MonitorConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_cover_every_setting() {
        let cfg = MonitorConfig::default();
        assert_eq!(cfg.port, 5000);
        assert_eq!(cfg.collect_interval, Duration::from_secs(60));
        assert_eq!(cfg.price_change_threshold, 3.0);
        assert_eq!(cfg.oi_change_threshold, 15.0);
        assert_eq!(cfg.ema_span, 25);
        assert_eq!(cfg.ema_source, EmaSource::History);
        assert_eq!(cfg.retention_days, None);
        assert_eq!(cfg.quote_asset, "USDT");
    }

    #[test]
    fn reads_overrides_and_ignores_garbage() {
        let cfg = config_from(&[
            ("API_PORT", " 8080 "),
            ("COLLECT_INTERVAL_SECS", "0"),
            ("EMA_SOURCE", "FLAT"),
            ("RETENTION_DAYS", "7"),
            ("OI_CHANGE_THRESHOLD", "not-a-number"),
            ("BINANCE_BASE_URL", "http://localhost:9000/"),
        ]);
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.collect_interval, Duration::from_secs(1));
        assert_eq!(cfg.ema_source, EmaSource::Flat);
        assert_eq!(cfg.retention_days, Some(7));
        assert_eq!(cfg.oi_change_threshold, 15.0);
        assert_eq!(cfg.binance_base_url, "http://localhost:9000");
    }
}
