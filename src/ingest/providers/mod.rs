// src/ingest/providers/mod.rs
pub mod json_feed;

pub use json_feed::JsonFeedSource;
