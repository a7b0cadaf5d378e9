use std::sync::Arc;

use tracing_subscriber::EnvFilter;

mod api;
mod config;

use api::collector::Collector;
use api::db::SnapshotStore;
use api::markets::BinanceClient;
use api::monitor::Monitor;
use api::scheduler::{spawn_interval, Job};
use api::server::AppState;
use config::MonitorConfig;

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Arc::new(MonitorConfig::from_env());
    let store = SnapshotStore::open(&config.db_path).expect("failed to open snapshot store");

    let http = reqwest::Client::builder()
        .timeout(config.fetch_timeout)
        .build()
        .expect("failed to build HTTP client");
    let source = Arc::new(BinanceClient::new(
        http,
        config.binance_base_url.clone(),
        config.quote_asset.clone(),
        config.fetch_timeout,
        config.fetch_concurrency,
    ));

    let collector = Arc::new(Collector::new(
        Arc::clone(&source),
        store.clone(),
        Arc::clone(&config),
    ));
    let monitor = Arc::new(Monitor::new(source, store.clone(), Arc::clone(&config)));

    let price_job = Arc::new(Job::new("price"));
    let oi_job = Arc::new(Job::new("open_interest"));

    let collect_prices = {
        let collector = Arc::clone(&collector);
        move || {
            let collector = Arc::clone(&collector);
            async move { collector.collect_prices().await }
        }
    };
    let collect_open_interest = {
        let collector = Arc::clone(&collector);
        move || {
            let collector = Arc::clone(&collector);
            async move { collector.collect_open_interest().await }
        }
    };

    // Seed both series before serving so lookbacks have a first baseline.
    tokio::join!(
        price_job.run_once(collect_prices.clone()),
        oi_job.run_once(collect_open_interest.clone()),
    );

    spawn_interval(Arc::clone(&price_job), config.collect_interval, collect_prices);
    spawn_interval(Arc::clone(&oi_job), config.collect_interval, collect_open_interest);

    let state = AppState {
        monitor,
        store,
        jobs: vec![price_job, oi_job],
    };
    if let Err(e) = api::server::run(state, &config.bind, config.port).await {
        tracing::error!("Server failed: {e}");
        std::process::exit(1);
    }
}
