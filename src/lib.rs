//! tributary - feed ingestion pipeline
//!
//! Polls syndication feeds on behalf of many subscribers, converts untrusted
//! items into sanitized markdown, and materializes a per-user feed.

pub mod config;
pub mod datetime;
pub mod db;
pub mod error;
pub mod feeder;
pub mod logging;

pub use config::Config;
pub use db::Database;
pub use error::{Result, TributaryError};
pub use feeder::{Poller, SubscriptionService};
