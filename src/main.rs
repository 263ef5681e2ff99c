//! deal-alerts binary entrypoint.
//! Wires config, store, sources, notification channel and the status server,
//! then runs the crawl scheduler until Ctrl-C.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use deal_alerts::alerts::AlertMatcher;
use deal_alerts::api::{router_with_metrics, StatusState};
use deal_alerts::config::AppConfig;
use deal_alerts::ingest::config::load_sources;
use deal_alerts::ingest::fetch::Fetcher;
use deal_alerts::ingest::providers::JsonFeedSource;
use deal_alerts::ingest::scheduler::spawn_scheduler;
use deal_alerts::ingest::types::Source;
use deal_alerts::ingest::Crawler;
use deal_alerts::metrics::Metrics;
use deal_alerts::notify::discord::DiscordChannel;
use deal_alerts::notify::log::LogChannel;
use deal_alerts::notify::{Dispatcher, NotificationChannel};
use deal_alerts::store::{FileStore, ListingStore, SubscriptionStore};
use deal_alerts::telemetry::init_tracing;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = AppConfig::from_env();
    let metrics = Metrics::init(cfg.delivery_interval.as_millis() as u64)?;

    let store = Arc::new(
        FileStore::open(&cfg.store_path)
            .await
            .with_context(|| format!("opening store at {}", cfg.store_path.display()))?,
    );
    if let Err(e) = store.ensure_indexes().await {
        tracing::warn!(error = %e, "index setup failed; continuing");
    }
    let listings: Arc<dyn ListingStore> = store.clone();
    let subscriptions: Arc<dyn SubscriptionStore> = store.clone();

    let fetcher = Fetcher::new(cfg.fetch()).context("building HTTP client")?;
    let sources: Vec<Arc<dyn Source>> = load_sources(&cfg.sources_path)?
        .into_iter()
        .map(|s| Arc::new(JsonFeedSource::new(s.name, s.url, fetcher.clone())) as Arc<dyn Source>)
        .collect();

    let channel: Arc<dyn NotificationChannel> = match &cfg.discord_token {
        Some(token) => Arc::new(
            DiscordChannel::new(token.clone())
                .with_api_base(cfg.discord_api_base.clone())
                .with_timeout(cfg.discord_timeout),
        ),
        None => {
            tracing::warn!("DISCORD_TOKEN not set; notifications are logged only");
            Arc::new(LogChannel)
        }
    };

    let matcher = AlertMatcher::new(subscriptions, listings.clone());
    let dispatcher = Dispatcher::new(listings.clone(), matcher, channel, cfg.dispatcher());
    let crawler = Arc::new(Crawler::new(sources, listings, dispatcher, cfg.crawler()));
    tracing::info!(
        sources = ?crawler.source_names(),
        interval_secs = cfg.crawl_interval.as_secs(),
        dry_run = cfg.is_dry_run(),
        "deal-alerts starting"
    );

    let cancel = CancellationToken::new();

    let app = router_with_metrics(StatusState::new(crawler.stats_registry()), metrics.router());
    let listener = tokio::net::TcpListener::bind(cfg.status_addr)
        .await
        .with_context(|| format!("binding status server on {}", cfg.status_addr))?;
    tracing::info!(addr = %cfg.status_addr, "status server listening");
    let server_cancel = cancel.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
    });

    let scheduler = spawn_scheduler(crawler, cfg.scheduler(), cancel.clone());

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    tracing::info!("shutdown requested");
    cancel.cancel();

    let cycles = scheduler.await.context("scheduler task")?;
    if let Err(e) = store.flush().await {
        tracing::warn!(error = %e, "final store flush failed");
    }
    server.await.context("status server task")?.context("status server")?;
    tracing::info!(cycles, "deal-alerts stopped");
    Ok(())
}
