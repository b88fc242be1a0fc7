//! Test helpers for poller integration tests.
//!
//! Provides in-process stand-ins for the fetcher and image uploader, and
//! helpers to build a poller over an in-memory database.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use tributary::feeder::{
    Feed, FeedRepository, Fetcher, HtmlCleaner, ImageReplacer, ImageUploader, MediaError,
    ParsedFeed, ParsedItem, Poller, SqlFeedStore, SubscriptionRepository,
};
use tributary::{Database, Result, TributaryError};

/// Default image limit used by test pollers.
pub const MAX_IMAGES: usize = 20;

/// Fetcher serving canned documents per URL.
#[derive(Default)]
pub struct StubFetcher {
    feeds: Mutex<HashMap<String, ParsedFeed>>,
    failing: Mutex<Vec<String>>,
    delay: Option<Duration>,
    fetches: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl StubFetcher {
    /// Create a fetcher that sleeps before answering.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    /// Serve `feed` at `url`, replacing any previous document.
    pub fn serve(&self, url: &str, feed: ParsedFeed) {
        self.feeds.lock().unwrap().insert(url.to_string(), feed);
    }

    /// Make fetches of `url` fail.
    pub fn fail(&self, url: &str) {
        self.failing.lock().unwrap().push(url.to_string());
    }

    /// Number of feed fetches performed.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Most fetches that were in progress at the same time.
    pub fn max_concurrent_fetches(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for StubFetcher {
    async fn fetch(&self, url: &str) -> Result<ParsedFeed> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if self.failing.lock().unwrap().iter().any(|u| u == url) {
            return Err(TributaryError::Fetch("HTTP error: 500".into()));
        }
        self.feeds
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| TributaryError::Fetch("HTTP error: 404".into()))
    }

    async fn fetch_media(
        &self,
        _url: &str,
        _max_bytes: u64,
    ) -> std::result::Result<Vec<u8>, MediaError> {
        Err(MediaError::Download("not served".into()))
    }
}

/// Uploader that records every URL and returns a name derived from it.
#[derive(Default)]
pub struct RecordingUploader {
    calls: Mutex<Vec<String>>,
}

impl RecordingUploader {
    /// URLs uploaded so far.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ImageUploader for RecordingUploader {
    async fn upload_image(&self, url: &str) -> std::result::Result<String, MediaError> {
        self.calls.lock().unwrap().push(url.to_string());
        let name = url.rsplit('/').next().unwrap_or_default();
        Ok(format!("/media/{name}"))
    }
}

/// Open a fresh in-memory database.
pub async fn setup_db() -> Database {
    Database::open_in_memory().await.unwrap()
}

/// Build a poller over `db` with the given fetcher and uploader.
pub fn build_poller(
    db: &Database,
    fetcher: Arc<StubFetcher>,
    uploader: Arc<RecordingUploader>,
) -> Poller {
    Poller::new(
        Arc::new(SqlFeedStore::new(db.pool().clone())),
        fetcher,
        Arc::new(HtmlCleaner::new()),
        uploader,
        ImageReplacer::new(MAX_IMAGES, Duration::from_secs(30)).unwrap(),
    )
}

/// Create (or find) the feed at `url` and subscribe `user_id` to it.
pub async fn subscribe(db: &Database, user_id: i64, url: &str) -> Feed {
    let feed = FeedRepository::new(db.pool())
        .get_or_create(url, Utc::now())
        .await
        .unwrap();
    SubscriptionRepository::new(db.pool())
        .create(user_id, feed.id, Utc::now())
        .await
        .unwrap();
    feed
}

/// Make a feed due again without touching anything else.
pub async fn make_due(db: &Database, feed_id: i64) {
    FeedRepository::new(db.pool())
        .set_next_fetch_at(feed_id, None)
        .await
        .unwrap();
}

/// An item at `https://blog.example/posts/{n}` published on day `n` of 2024.
pub fn post(n: u32) -> ParsedItem {
    ParsedItem::new(format!("https://blog.example/posts/{n}"))
        .with_title(format!("Post {n}"))
        .with_summary(format!("<p>Body of post {n}</p>"))
        .with_published_at(Utc.with_ymd_and_hms(2024, 1, n, 12, 0, 0).unwrap())
}

/// A document listing `posts` newest first, as sources usually do.
pub fn document(posts: &[u32]) -> ParsedFeed {
    let mut items: Vec<ParsedItem> = posts.iter().map(|n| post(*n)).collect();
    items.sort_by(|a, b| b.published_at.cmp(&a.published_at));
    ParsedFeed {
        title: Some("Blog".into()),
        description: None,
        items,
    }
}
