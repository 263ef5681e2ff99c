// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod alerts;
pub mod api;
pub mod config;
pub mod error;
pub mod ingest;
pub mod metrics;
pub mod notify;
pub mod store;
pub mod telemetry;

// ---- Re-exports for stable public API ----
pub use crate::api::create_router;
pub use crate::error::{ErrorKind, PipelineError, StoreError};
pub use crate::ingest::{Crawler, CrawlerCfg, CycleResult};
pub use crate::notify::{Dispatcher, DispatcherCfg, Notification, NotificationChannel};
