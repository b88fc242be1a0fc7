//! Feed poller for tributary.
//!
//! A timer-driven loop that picks up due feeds, locks each one, fetches it,
//! stores new items, fans them out to subscribers and reschedules the feed.
//! Every feed runs behind its own fault boundary, and so does every tick.

use std::any::Any;
use std::collections::HashSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::{stream, FutureExt, StreamExt};
use tokio::sync::watch;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

use super::canonical::{canonicalize, resolve_url};
use super::cleaner::Cleaner;
use super::fetcher::Fetcher;
use super::images::ImageReplacer;
use super::media::ImageUploader;
use super::schedule::{estimate_items_per_day, failure_backoff_at, next_fetch_at};
use super::store::{FeedStore, FeedTransaction};
use super::types::{Feed, NewFeedItem, ParsedItem};
use crate::config::PollerConfig;
use crate::datetime::to_rfc3339;
use crate::{Result, TributaryError};

/// Default seconds between ticks.
pub const DEFAULT_TICK_INTERVAL_SECS: u64 = 10;

/// Default number of due feeds picked up per tick.
pub const DEFAULT_BATCH_SIZE: u32 = 100;

/// What happened to one feed in one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedOutcome {
    /// Fetched and stored; `new_items` were discovered.
    Processed { new_items: i64 },
    /// Locked by another poller or no longer due.
    Skipped,
    /// The fetch failed; the error was recorded and the feed backed off.
    FetchFailed,
    /// An unexpected error or panic; the pass was rolled back.
    Faulted,
}

/// Summary of one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Feeds listed as due.
    pub due: usize,
    /// Feeds fetched and stored.
    pub processed: usize,
    /// Feeds skipped because the lock was unavailable.
    pub skipped: usize,
    /// Feeds whose fetch failed.
    pub fetch_failed: usize,
    /// Feeds that faulted.
    pub faulted: usize,
    /// Items discovered across all feeds.
    pub new_items: i64,
}

impl TickReport {
    fn record(&mut self, outcome: FeedOutcome) {
        match outcome {
            FeedOutcome::Processed { new_items } => {
                self.processed += 1;
                self.new_items += new_items;
            }
            FeedOutcome::Skipped => self.skipped += 1,
            FeedOutcome::FetchFailed => self.fetch_failed += 1,
            FeedOutcome::Faulted => self.faulted += 1,
        }
    }
}

/// An item ready to write: link checked and body built.
struct PreparedItem {
    canonical: String,
    item: NewFeedItem,
}

/// Placeholder body for an item whose HTML could not be converted.
fn conversion_placeholder(e: &TributaryError) -> String {
    format!("*[content could not be converted: {e}]*")
}

/// Run a future, turning a panic into a `Fault` error.
async fn catch_fault<F>(future: F) -> Result<F::Output>
where
    F: Future,
{
    AssertUnwindSafe(future)
        .catch_unwind()
        .await
        .map_err(|panic| TributaryError::Fault(panic_message(panic.as_ref())))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Feed poller.
pub struct Poller {
    store: Arc<dyn FeedStore>,
    fetcher: Arc<dyn Fetcher>,
    cleaner: Arc<dyn Cleaner>,
    uploader: Arc<dyn ImageUploader>,
    images: ImageReplacer,
    tick_interval: Duration,
    batch_size: u32,
    worker_concurrency: usize,
}

impl Poller {
    /// Create a poller with default tick settings.
    pub fn new(
        store: Arc<dyn FeedStore>,
        fetcher: Arc<dyn Fetcher>,
        cleaner: Arc<dyn Cleaner>,
        uploader: Arc<dyn ImageUploader>,
        images: ImageReplacer,
    ) -> Self {
        Self {
            store,
            fetcher,
            cleaner,
            uploader,
            images,
            tick_interval: Duration::from_secs(DEFAULT_TICK_INTERVAL_SECS),
            batch_size: DEFAULT_BATCH_SIZE,
            worker_concurrency: 1,
        }
    }

    /// Apply tick interval, batch size and concurrency from configuration.
    pub fn with_settings(mut self, config: &PollerConfig) -> Self {
        self.tick_interval = Duration::from_secs(config.tick_interval_secs.max(1));
        self.batch_size = config.batch_size.max(1);
        self.worker_concurrency = config.worker_concurrency.max(1);
        self
    }

    /// Run ticks until `shutdown` turns true or its sender is dropped.
    ///
    /// Shutdown is observed between ticks. A tick in progress finishes.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Feed poller started (tick interval: {} seconds, concurrency: {})",
            self.tick_interval.as_secs(),
            self.worker_concurrency
        );

        let mut timer = interval(self.tick_interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = timer.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }

            match catch_fault(self.tick()).await.and_then(|report| report) {
                Ok(report) if report.due > 0 => info!(
                    "Tick: {} due, {} processed, {} skipped, {} fetch failed, {} faulted, {} new item(s)",
                    report.due,
                    report.processed,
                    report.skipped,
                    report.fetch_failed,
                    report.faulted,
                    report.new_items
                ),
                Ok(_) => debug!("Tick: no feeds due"),
                Err(e) => error!("Tick failed: {}", e),
            }
        }

        info!("Feed poller stopped");
    }

    /// Process every feed due now.
    ///
    /// Fails only when the due list itself cannot be read.
    pub async fn tick(&self) -> Result<TickReport> {
        let now = Utc::now();
        let feeds = self.store.list_due_feeds(now, self.batch_size).await?;

        let mut report = TickReport {
            due: feeds.len(),
            ..TickReport::default()
        };
        if feeds.is_empty() {
            return Ok(report);
        }

        let outcomes: Vec<FeedOutcome> = stream::iter(feeds)
            .map(|feed| self.poll_feed(feed.id))
            .buffer_unordered(self.worker_concurrency)
            .collect()
            .await;

        for outcome in outcomes {
            report.record(outcome);
        }
        Ok(report)
    }

    /// Poll one feed behind a fault boundary.
    pub async fn poll_feed(&self, feed_id: i64) -> FeedOutcome {
        let now = Utc::now();
        match catch_fault(self.process_feed(feed_id, now)).await {
            Ok(Ok(outcome)) => return outcome,
            Ok(Err(e)) => error!("Feed {} failed: {}", feed_id, e),
            Err(e) => error!("Feed {} panicked: {}", feed_id, e),
        }

        // Due again next tick
        if let Err(e) = self.store.release_feed(feed_id, now).await {
            warn!("Failed to release feed {}: {}", feed_id, e);
        }
        FeedOutcome::Faulted
    }

    /// Claim, fetch, store and reschedule one feed. Writes commit together.
    async fn process_feed(&self, feed_id: i64, now: DateTime<Utc>) -> Result<FeedOutcome> {
        let mut tx = self.store.begin().await?;

        let Some(mut feed) = tx.lock_feed(feed_id, now).await? else {
            debug!("Feed {} unavailable, skipping", feed_id);
            return Ok(FeedOutcome::Skipped);
        };
        let was_manual = feed.was_manual_refresh();

        debug!("Fetching feed {}: {}", feed.id, feed.url);
        let parsed = match self.fetcher.fetch(&feed.url).await {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Failed to fetch feed {} ({}): {}", feed.id, feed.url, e);
                feed.last_fetch_error = Some(e.to_string());
                feed.last_items_count = 0;
                feed.next_fetch_at = Some(failure_backoff_at(now));
                feed.last_fetched_at = Some(now);
                tx.save_feed(&feed).await?;
                tx.commit().await?;
                return Ok(FeedOutcome::FetchFailed);
            }
        };

        if feed.title.as_deref().map_or(true, str::is_empty) {
            feed.title = parsed
                .title
                .as_deref()
                .map(|t| self.cleaner.clean_field(t))
                .filter(|t| !t.is_empty());
        }
        if feed.description.as_deref().map_or(true, str::is_empty) {
            feed.description = parsed
                .description
                .as_deref()
                .map(|d| self.cleaner.clean_field(d))
                .filter(|d| !d.is_empty());
        }

        // Sources list newest first; store oldest first
        let items: Vec<ParsedItem> = parsed.items.into_iter().rev().collect();
        let prepared = self.prepare_items(tx.as_mut(), &feed, items).await?;
        let new_items = self.store_items(tx.as_mut(), &feed, prepared).await?;

        feed.avg_items_per_day = estimate_items_per_day(tx.count_items(feed.id).await?);
        feed.last_items_count = new_items;
        feed.consecutive_empty_fetches = if new_items == 0 {
            feed.consecutive_empty_fetches.saturating_add(1)
        } else {
            0
        };
        let next = next_fetch_at(
            now,
            feed.consecutive_empty_fetches,
            feed.avg_items_per_day,
            was_manual,
        );
        feed.next_fetch_at = Some(next);
        feed.last_fetched_at = Some(now);
        feed.last_fetch_error = None;

        tx.save_feed(&feed).await?;
        tx.commit().await?;

        if new_items > 0 {
            info!(
                "Feed {} updated: {} new item(s), next fetch at {}",
                feed.id,
                new_items,
                to_rfc3339(&next)
            );
        } else {
            debug!(
                "Feed {} updated: no new items, next fetch at {}",
                feed.id,
                to_rfc3339(&next)
            );
        }
        Ok(FeedOutcome::Processed { new_items })
    }

    /// Resolve links, check which items are known and build new bodies.
    ///
    /// Runs before the pass writes anything, so image downloads never hold
    /// the write transaction open.
    async fn prepare_items(
        &self,
        tx: &mut dyn FeedTransaction,
        feed: &Feed,
        items: Vec<ParsedItem>,
    ) -> Result<Vec<PreparedItem>> {
        let base = Url::parse(&feed.url).ok();
        let mut seen = HashSet::new();
        let mut prepared = Vec::with_capacity(items.len());

        for item in items {
            let Some(link) = item
                .link
                .as_deref()
                .and_then(|href| resolve_url(href, base.as_ref()))
            else {
                warn!("Skipping item without a usable link in feed {}", feed.id);
                continue;
            };
            let canonical = match canonicalize(link.clone()) {
                Ok(canonical) => canonical,
                Err(e) => {
                    warn!("Skipping item {} in feed {}: {}", link, feed.id, e);
                    continue;
                }
            };

            // A repeat within one document is already known
            let known = !seen.insert(canonical.clone())
                || tx.find_item_id(feed.id, &canonical).await?.is_some();

            let title = item
                .title
                .as_deref()
                .map(|t| self.cleaner.clean_field(t))
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| link.to_string());
            let mut new_item =
                NewFeedItem::new(Uuid::now_v7().to_string(), feed.id, 0, link.as_str())
                    .with_title(title)
                    .with_summary(item.summary.clone())
                    .with_published_at(item.published_at);
            if !known {
                new_item = new_item.with_body(self.build_body(&item, &link).await);
            }

            prepared.push(PreparedItem {
                canonical,
                item: new_item,
            });
        }

        Ok(prepared)
    }

    /// Upsert items in order and fan new ones out. Returns the new-item count.
    async fn store_items(
        &self,
        tx: &mut dyn FeedTransaction,
        feed: &Feed,
        items: Vec<PreparedItem>,
    ) -> Result<i64> {
        let mut subscribers: Option<Vec<i64>> = None;
        let mut new_items = 0;

        for PreparedItem {
            canonical,
            mut item,
        } in items
        {
            item.canonical_url_id = tx.canonical_url_id(&canonical).await?;
            let stored_id = tx.upsert_item(&item).await?;
            if stored_id != item.id {
                continue;
            }
            new_items += 1;

            if subscribers.is_none() {
                subscribers = Some(tx.list_subscribers(feed.id).await?);
            }
            for user_id in subscribers.iter().flatten() {
                tx.insert_user_item(*user_id, &item.id).await?;
            }
        }

        Ok(new_items)
    }

    /// Convert an item's HTML and resolve its images.
    async fn build_body(&self, item: &ParsedItem, link: &Url) -> String {
        let Some(html) = item.body_html() else {
            return String::new();
        };

        match self.cleaner.html_to_markdown(html, Some(link)) {
            Ok(markdown) => self.images.replace(&markdown, self.uploader.as_ref()).await,
            Err(e) => {
                warn!("Failed to convert item {}: {}", link, e);
                conversion_placeholder(&e)
            }
        }
    }
}
