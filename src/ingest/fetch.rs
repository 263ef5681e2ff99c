// src/ingest/fetch.rs
//! HTTP GET with bounded, flat-backoff retries.
//!
//! Every attempt has its own timeout. Transport errors, non-2xx statuses and
//! body read failures are retried up to `max_attempts`, sleeping a fixed
//! `backoff` in between (no jitter, no growth). The cancellation token is
//! observed both during the request and during the backoff sleep.

use std::time::Duration;

use metrics::counter;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, CACHE_CONTROL, PRAGMA};
use reqwest::Client;
use tokio_util::sync::CancellationToken;

use crate::error::PipelineError;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub timeout: Duration,
    pub max_attempts: u32,
    pub backoff: Duration,
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_attempts: 3,
            backoff: Duration::from_secs(2),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Fetcher {
    client: Client,
    cfg: FetchConfig,
}

impl Fetcher {
    pub fn new(cfg: FetchConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(&cfg.user_agent)
            .default_headers(browser_headers())
            .build()?;
        Ok(Self { client, cfg })
    }

    /// Fetch `url` and return the raw body.
    pub async fn fetch(&self, url: &str, cancel: &CancellationToken) -> Result<Vec<u8>, PipelineError> {
        let attempts = self.cfg.max_attempts.max(1);
        let mut last_cause = String::new();

        for attempt in 1..=attempts {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                r = self.attempt(url) => r,
            };

            match outcome {
                Ok(body) => {
                    tracing::debug!(url, attempt, bytes = body.len(), "fetched");
                    return Ok(body);
                }
                Err(cause) => {
                    tracing::warn!(url, attempt, error = %cause, "fetch attempt failed");
                    last_cause = cause;
                }
            }

            if attempt < attempts {
                counter!("deals_fetch_retries_total").increment(1);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                    _ = tokio::time::sleep(self.cfg.backoff) => {}
                }
            }
        }

        Err(PipelineError::Fetch {
            url: url.to_string(),
            attempts,
            cause: last_cause,
        })
    }

    async fn attempt(&self, url: &str) -> Result<Vec<u8>, String> {
        let resp = self
            .client
            .get(url)
            .timeout(self.cfg.timeout)
            .send()
            .await
            .map_err(|e| format!("request failed: {e}"))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(format!("status code {}", status.as_u16()));
        }

        let body = resp
            .bytes()
            .await
            .map_err(|e| format!("reading body failed: {e}"))?;
        Ok(body.to_vec())
    }
}

fn browser_headers() -> HeaderMap {
    let mut h = HeaderMap::new();
    h.insert(
        ACCEPT,
        HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,application/json;q=0.9,*/*;q=0.8"),
    );
    h.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("ko-KR,ko;q=0.9,en-US;q=0.8,en;q=0.5"));
    h.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    h.insert(PRAGMA, HeaderValue::from_static("no-cache"));
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_retry_contract() {
        let cfg = FetchConfig::default();
        assert_eq!(cfg.max_attempts, 3);
        assert_eq!(cfg.backoff, Duration::from_secs(2));
        assert_eq!(cfg.timeout, Duration::from_secs(30));
    }

    #[test]
    fn browser_headers_disable_caching() {
        let h = browser_headers();
        assert_eq!(h.get(CACHE_CONTROL).unwrap(), "no-cache");
        assert!(h.get(ACCEPT).unwrap().to_str().unwrap().contains("text/html"));
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let f = Fetcher::new(FetchConfig::default()).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = f.fetch("http://127.0.0.1:9/never", &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
    }
}
