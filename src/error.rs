// src/error.rs
//! Tagged error types for the crawl → match → dispatch pipeline.
//!
//! Callers branch on [`ErrorKind`], never on the rendered message.

use serde::Serialize;
use thiserror::Error;

/// Coarse classification used for containment decisions and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Fetch failed after exhausting its bounded retries.
    TransientFetch,
    /// One source's crawl aborted.
    SourceFailure,
    /// Lost a uniqueness race in the store ("already exists").
    PersistenceConflict,
    /// Record looked up by key does not exist.
    NotFound,
    /// Rejected input (e.g. an empty keyword).
    InvalidInput,
    /// Store connection lost or snapshot unwritable.
    StoreUnavailable,
    /// One channel's delivery failed.
    DeliveryFailure,
    /// Every delivery attempt in a dispatch batch failed.
    DispatchExhausted,
    /// Cooperative shutdown.
    Cancelled,
}

/// Errors raised by [`crate::store`] implementations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("already exists: {key}")]
    Conflict { key: String },

    #[error("not found: {what}")]
    NotFound { what: String },

    #[error("invalid input: {0}")]
    Invalid(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store I/O error: {0}")]
    Io(String),

    #[error("store serialization error: {0}")]
    Serde(String),
}

impl StoreError {
    pub fn conflict(key: impl Into<String>) -> Self {
        Self::Conflict { key: key.into() }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Conflict { .. } => ErrorKind::PersistenceConflict,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Invalid(_) => ErrorKind::InvalidInput,
            Self::Unavailable(_) | Self::Io(_) | Self::Serde(_) => ErrorKind::StoreUnavailable,
        }
    }

    /// Losing an insert race counts as "already present".
    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::PersistenceConflict
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serde(e.to_string())
    }
}

/// Pipeline-level error surfaced in cycle results and to the scheduler.
#[derive(Error, Debug, Clone)]
pub enum PipelineError {
    #[error("fetch {url} failed after {attempts} attempt(s): {cause}")]
    Fetch {
        url: String,
        attempts: u32,
        cause: String,
    },

    #[error("source {source_name} failed: {message}")]
    Source {
        source_name: String,
        message: String,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("delivery to channel {channel_id} failed: {message}")]
    Delivery { channel_id: String, message: String },

    #[error("all {attempted} delivery attempt(s) failed: {}", .causes.join("; "))]
    DispatchExhausted { attempted: usize, causes: Vec<String> },

    #[error("cancelled")]
    Cancelled,
}

impl PipelineError {
    pub fn source_failure(source_name: impl Into<String>, err: &anyhow::Error) -> Self {
        Self::Source {
            source_name: source_name.into(),
            message: format!("{err:#}"),
        }
    }

    pub fn delivery(channel_id: impl Into<String>, err: &anyhow::Error) -> Self {
        Self::Delivery {
            channel_id: channel_id.into(),
            message: format!("{err:#}"),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Fetch { .. } => ErrorKind::TransientFetch,
            Self::Source { .. } => ErrorKind::SourceFailure,
            Self::Store(e) => e.kind(),
            Self::Delivery { .. } => ErrorKind::DeliveryFailure,
            Self::DispatchExhausted { .. } => ErrorKind::DispatchExhausted,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_conflict_is_classified_by_kind() {
        let e = StoreError::conflict("https://a.example/1");
        assert!(e.is_conflict());
        assert_eq!(
            PipelineError::from(e).kind(),
            ErrorKind::PersistenceConflict
        );
    }

    #[test]
    fn io_failures_count_as_unavailable() {
        let e: StoreError = std::io::Error::other("disk gone").into();
        assert_eq!(e.kind(), ErrorKind::StoreUnavailable);
        assert!(!e.is_conflict());
    }

    #[test]
    fn dispatch_exhausted_lists_every_cause() {
        let e = PipelineError::DispatchExhausted {
            attempted: 2,
            causes: vec![
                "delivery to channel c1 failed: Discord HTTP 500".into(),
                "delivery to channel c2 failed: Discord HTTP 403".into(),
            ],
        };
        assert_eq!(e.kind(), ErrorKind::DispatchExhausted);
        assert_eq!(
            e.to_string(),
            "all 2 delivery attempt(s) failed: delivery to channel c1 failed: Discord HTTP 500; \
             delivery to channel c2 failed: Discord HTTP 403"
        );
    }

    #[test]
    fn source_failure_keeps_context_chain() {
        let err = anyhow::anyhow!("status 503").context("fetch feed");
        let e = PipelineError::source_failure("Ppomppu", &err);
        assert_eq!(e.kind(), ErrorKind::SourceFailure);
        assert_eq!(e.to_string(), "source Ppomppu failed: fetch feed: status 503");
    }
}
