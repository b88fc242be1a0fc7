//! Subscription service for tributary.
//!
//! The host application's entry points into the feed subsystem: managing
//! subscriptions, asking for an immediate refresh and reading the
//! materialized per-user feed.

use chrono::{Duration, Utc};
use tracing::info;

use super::canonical::canonicalize_url;
use super::fetcher::validate_url;
use super::repository::{FeedRepository, SubscriptionRepository, UserFeedItemRepository};
use super::types::{Feed, UserFeedEntry};
use crate::config::Config;
use crate::db::Database;
use crate::{Result, TributaryError};

/// Default minimum seconds between manual refreshes of one feed.
pub const DEFAULT_REFRESH_COOLDOWN_SECS: u64 = 600;

/// Service for subscription operations.
pub struct SubscriptionService<'a> {
    db: &'a Database,
    refresh_cooldown: Duration,
    allow_private_hosts: bool,
}

impl<'a> SubscriptionService<'a> {
    /// Create a new SubscriptionService with the given database reference.
    pub fn new(db: &'a Database) -> Self {
        Self {
            db,
            refresh_cooldown: Duration::seconds(DEFAULT_REFRESH_COOLDOWN_SECS as i64),
            allow_private_hosts: false,
        }
    }

    /// Create a service using the cooldown and host policy from configuration.
    pub fn from_config(db: &'a Database, config: &Config) -> Self {
        Self::new(db)
            .with_refresh_cooldown(config.poller.manual_refresh_cooldown_secs)
            .with_private_hosts(config.fetcher.allow_private_hosts)
    }

    /// Set the manual refresh cooldown in seconds.
    pub fn with_refresh_cooldown(mut self, secs: u64) -> Self {
        let secs = secs.min(i64::MAX as u64 / 1000) as i64;
        self.refresh_cooldown = Duration::seconds(secs);
        self
    }

    /// Allow feeds on private or loopback hosts.
    pub fn with_private_hosts(mut self, allow: bool) -> Self {
        self.allow_private_hosts = allow;
        self
    }

    /// Subscribe a user to the feed at `url`.
    ///
    /// The feed is created on first subscription and is due immediately.
    /// Subscribing twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the URL is not an acceptable http(s) URL.
    pub async fn subscribe(&self, user_id: i64, url: &str) -> Result<Feed> {
        if !self.allow_private_hosts {
            validate_url(url.trim())?;
        }
        let canonical = canonicalize_url(url)?;

        let now = Utc::now();
        let feed = FeedRepository::new(self.db.pool())
            .get_or_create(&canonical, now)
            .await?;
        SubscriptionRepository::new(self.db.pool())
            .create(user_id, feed.id, now)
            .await?;

        info!("User {} subscribed to feed {} ({})", user_id, feed.id, feed.url);
        Ok(feed)
    }

    /// Remove a user's subscription. The feed and its items are kept.
    ///
    /// Returns false if the user was not subscribed.
    pub async fn unsubscribe(&self, user_id: i64, feed_id: i64) -> Result<bool> {
        let removed = SubscriptionRepository::new(self.db.pool())
            .delete(user_id, feed_id)
            .await?;
        if removed {
            info!("User {} unsubscribed from feed {}", user_id, feed_id);
        }
        Ok(removed)
    }

    /// Ask for a feed to be fetched on the next tick.
    ///
    /// The next pass is scheduled as a manual refresh.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown feed and a validation error while
    /// the previous request is still inside the cooldown.
    pub async fn request_refresh(&self, feed_id: i64) -> Result<Feed> {
        let repo = FeedRepository::new(self.db.pool());
        let feed = repo
            .get_by_id(feed_id)
            .await?
            .ok_or_else(|| TributaryError::NotFound("feed".into()))?;

        let now = Utc::now();
        if let Some(last) = feed.last_manual_refresh_at {
            if now - last < self.refresh_cooldown {
                return Err(TributaryError::Validation(
                    "refresh requested too recently".into(),
                ));
            }
        }

        repo.mark_manual_refresh(feed_id, now).await?;
        info!("Manual refresh requested for feed {}", feed_id);

        repo.get_by_id(feed_id)
            .await?
            .ok_or_else(|| TributaryError::NotFound("feed".into()))
    }

    /// List a user's undismissed items, newest delivery first.
    pub async fn list_user_items(&self, user_id: i64, limit: u32) -> Result<Vec<UserFeedEntry>> {
        UserFeedItemRepository::new(self.db.pool())
            .list_for_user(user_id, limit)
            .await
    }

    /// Hide an item from a user's feed.
    pub async fn dismiss(&self, user_id: i64, feed_item_id: &str) -> Result<()> {
        let dismissed = UserFeedItemRepository::new(self.db.pool())
            .dismiss(user_id, feed_item_id)
            .await?;
        if !dismissed {
            return Err(TributaryError::NotFound("delivered item".into()));
        }
        Ok(())
    }
}
