//! Feed ingestion module for tributary.
//!
//! This module polls subscribed feeds, converts their items to sanitized
//! markdown with locally stored images, and fans new items out to
//! subscribers.

pub mod canonical;
pub mod cleaner;
pub mod fetcher;
pub mod images;
pub mod media;
pub mod poller;
pub mod repository;
pub mod schedule;
pub mod service;
pub mod store;
pub mod types;

pub use canonical::{canonicalize_url, resolve_url};
pub use cleaner::{Cleaner, HtmlCleaner};
pub use fetcher::{parse_feed, validate_url, Fetcher, HttpFetcher};
pub use images::{ImageOutcome, ImageReplacer};
pub use media::{FetchingImageUploader, FsMediaStorage, ImageUploader, MediaError, MediaUploader};
pub use poller::{FeedOutcome, Poller, TickReport};
pub use repository::{
    FeedItemRepository, FeedRepository, SubscriptionRepository, UserFeedItemRepository,
};
pub use schedule::{next_fetch_at, next_interval_minutes};
pub use service::SubscriptionService;
pub use store::{FeedStore, FeedTransaction, SqlFeedStore};
pub use types::{
    Feed, FeedItem, NewFeedItem, ParsedFeed, ParsedItem, Subscription, UserFeedEntry,
    UserFeedItem, MAX_TITLE_LENGTH,
};
