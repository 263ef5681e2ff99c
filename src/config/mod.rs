// src/config/mod.rs
//! Process configuration read from the environment (after `.env`).

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::ingest::fetch::FetchConfig;
use crate::ingest::scheduler::SchedulerCfg;
use crate::ingest::{CrawlerCfg, DEFAULT_QUEUE_CAPACITY};
use crate::notify::discord::DEFAULT_API_BASE;
use crate::notify::DispatcherCfg;

pub const ENV_DISCORD_TOKEN: &str = "DISCORD_TOKEN";
pub const ENV_DISCORD_API_BASE: &str = "DISCORD_API_BASE";
pub const ENV_DISCORD_TIMEOUT_SECS: &str = "DISCORD_TIMEOUT_SECS";
pub const ENV_CRAWL_INTERVAL_MINUTES: &str = "CRAWL_INTERVAL_MINUTES";
pub const ENV_STORE_PATH: &str = "STORE_PATH";
pub const ENV_SOURCES_PATH: &str = "SOURCES_PATH";
pub const ENV_STATUS_ADDR: &str = "STATUS_ADDR";
pub const ENV_FETCH_TIMEOUT_SECS: &str = "FETCH_TIMEOUT_SECS";
pub const ENV_FETCH_MAX_ATTEMPTS: &str = "FETCH_MAX_ATTEMPTS";
pub const ENV_FETCH_BACKOFF_SECS: &str = "FETCH_BACKOFF_SECS";
pub const ENV_DELIVERY_INTERVAL_MS: &str = "DELIVERY_INTERVAL_MS";
pub const ENV_DISPATCH_WORKERS: &str = "DISPATCH_WORKERS";
pub const ENV_QUEUE_CAPACITY: &str = "QUEUE_CAPACITY";

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// `None` runs the dry-run log channel instead of Discord.
    pub discord_token: Option<String>,
    pub discord_api_base: String,
    pub discord_timeout: Duration,
    pub crawl_interval: Duration,
    pub store_path: PathBuf,
    pub sources_path: PathBuf,
    pub status_addr: SocketAddr,
    pub fetch_timeout: Duration,
    pub fetch_max_attempts: u32,
    pub fetch_backoff: Duration,
    pub delivery_interval: Duration,
    pub dispatch_workers: usize,
    pub queue_capacity: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            discord_token: None,
            discord_api_base: DEFAULT_API_BASE.to_string(),
            discord_timeout: Duration::from_secs(10),
            crawl_interval: Duration::from_secs(30 * 60),
            store_path: PathBuf::from("state/deal_alerts.json"),
            sources_path: PathBuf::from("config/sources.toml"),
            status_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            fetch_timeout: Duration::from_secs(30),
            fetch_max_attempts: 3,
            fetch_backoff: Duration::from_secs(2),
            delivery_interval: Duration::from_millis(2000),
            dispatch_workers: 5,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl AppConfig {
    /// Read every setting from the environment. Missing values take the
    /// default; unparseable ones do too, with a warning.
    pub fn from_env() -> Self {
        let d = Self::default();
        let token = env::var(ENV_DISCORD_TOKEN)
            .ok()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());

        Self {
            discord_token: token,
            discord_api_base: env::var(ENV_DISCORD_API_BASE)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(d.discord_api_base),
            discord_timeout: Duration::from_secs(parse_or(ENV_DISCORD_TIMEOUT_SECS, 10u64).max(1)),
            crawl_interval: Duration::from_secs(
                parse_or(ENV_CRAWL_INTERVAL_MINUTES, 30u64).max(1) * 60,
            ),
            store_path: env::var(ENV_STORE_PATH).map(PathBuf::from).unwrap_or(d.store_path),
            sources_path: env::var(ENV_SOURCES_PATH).map(PathBuf::from).unwrap_or(d.sources_path),
            status_addr: parse_or(ENV_STATUS_ADDR, d.status_addr),
            fetch_timeout: Duration::from_secs(parse_or(ENV_FETCH_TIMEOUT_SECS, 30u64)),
            fetch_max_attempts: parse_or(ENV_FETCH_MAX_ATTEMPTS, d.fetch_max_attempts).max(1),
            fetch_backoff: Duration::from_secs(parse_or(ENV_FETCH_BACKOFF_SECS, 2u64)),
            delivery_interval: Duration::from_millis(parse_or(ENV_DELIVERY_INTERVAL_MS, 2000u64)),
            dispatch_workers: parse_or(ENV_DISPATCH_WORKERS, d.dispatch_workers).max(1),
            queue_capacity: parse_or(ENV_QUEUE_CAPACITY, d.queue_capacity).max(1),
        }
    }

    pub fn is_dry_run(&self) -> bool {
        self.discord_token.is_none()
    }

    pub fn fetch(&self) -> FetchConfig {
        FetchConfig {
            timeout: self.fetch_timeout,
            max_attempts: self.fetch_max_attempts,
            backoff: self.fetch_backoff,
            ..FetchConfig::default()
        }
    }

    pub fn dispatcher(&self) -> DispatcherCfg {
        DispatcherCfg {
            workers: self.dispatch_workers,
            delivery_interval: self.delivery_interval,
        }
    }

    pub fn crawler(&self) -> CrawlerCfg {
        CrawlerCfg {
            queue_capacity: self.queue_capacity,
        }
    }

    pub fn scheduler(&self) -> SchedulerCfg {
        SchedulerCfg {
            interval: self.crawl_interval,
        }
    }
}

fn parse_or<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(key, value = %raw, "unparseable setting; using default");
                default
            }
        },
        Err(_) => default,
    }
}
