//! Feed repositories for tributary.
//!
//! Pool-level reads and writes used outside the poll pass: subscription
//! management, manual refresh requests and per-user feed reads. The poll pass
//! itself goes through [`super::store`], which holds a transaction.

use chrono::{DateTime, Utc};

use super::types::{Feed, FeedItem, Subscription, UserFeedEntry, UserFeedItem};
use crate::datetime::{from_millis, opt_from_millis, opt_to_millis, to_millis};
use crate::db::DbPool;
use crate::{Result, TributaryError};

/// Columns selected for a [`FeedRow`].
pub(crate) const FEED_COLUMNS: &str = "id, url, title, description, next_fetch_at, \
     last_fetched_at, last_fetch_error, last_items_count, consecutive_empty_fetches, \
     avg_items_per_day, last_manual_refresh_at, created_at, updated_at";

/// Row type for feed from database.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct FeedRow {
    id: i64,
    url: String,
    title: Option<String>,
    description: Option<String>,
    next_fetch_at: Option<i64>,
    last_fetched_at: Option<i64>,
    last_fetch_error: Option<String>,
    last_items_count: i64,
    consecutive_empty_fetches: i64,
    avg_items_per_day: f64,
    last_manual_refresh_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

impl From<FeedRow> for Feed {
    fn from(row: FeedRow) -> Self {
        Feed {
            id: row.id,
            url: row.url,
            title: row.title,
            description: row.description,
            next_fetch_at: opt_from_millis(row.next_fetch_at),
            last_fetched_at: opt_from_millis(row.last_fetched_at),
            last_fetch_error: row.last_fetch_error,
            last_items_count: row.last_items_count,
            consecutive_empty_fetches: row.consecutive_empty_fetches,
            avg_items_per_day: row.avg_items_per_day,
            last_manual_refresh_at: opt_from_millis(row.last_manual_refresh_at),
            created_at: from_millis(row.created_at),
            updated_at: from_millis(row.updated_at),
        }
    }
}

/// Row type for feed item from database.
#[derive(Debug, Clone, sqlx::FromRow)]
struct FeedItemRow {
    id: String,
    feed_id: i64,
    canonical_url_id: i64,
    guid: String,
    title: String,
    summary: Option<String>,
    body: String,
    published_at: Option<i64>,
    created_at: i64,
}

impl From<FeedItemRow> for FeedItem {
    fn from(row: FeedItemRow) -> Self {
        FeedItem {
            id: row.id,
            feed_id: row.feed_id,
            canonical_url_id: row.canonical_url_id,
            guid: row.guid,
            title: row.title,
            summary: row.summary,
            body: row.body,
            published_at: opt_from_millis(row.published_at),
            created_at: from_millis(row.created_at),
        }
    }
}

/// Row type for subscription from database.
#[derive(Debug, Clone, sqlx::FromRow)]
struct SubscriptionRow {
    id: i64,
    user_id: i64,
    feed_id: i64,
    created_at: i64,
}

impl From<SubscriptionRow> for Subscription {
    fn from(row: SubscriptionRow) -> Self {
        Subscription {
            id: row.id,
            user_id: row.user_id,
            feed_id: row.feed_id,
            created_at: from_millis(row.created_at),
        }
    }
}

/// Row type for a delivery joined with its item.
#[derive(Debug, Clone, sqlx::FromRow)]
struct UserFeedEntryRow {
    delivery_id: i64,
    user_id: i64,
    dismissed: bool,
    delivered_at: i64,
    id: String,
    feed_id: i64,
    canonical_url_id: i64,
    guid: String,
    title: String,
    summary: Option<String>,
    body: String,
    published_at: Option<i64>,
    created_at: i64,
}

impl From<UserFeedEntryRow> for UserFeedEntry {
    fn from(row: UserFeedEntryRow) -> Self {
        UserFeedEntry {
            delivery: UserFeedItem {
                id: row.delivery_id,
                user_id: row.user_id,
                feed_item_id: row.id.clone(),
                dismissed: row.dismissed,
                created_at: from_millis(row.delivered_at),
            },
            item: FeedItem {
                id: row.id,
                feed_id: row.feed_id,
                canonical_url_id: row.canonical_url_id,
                guid: row.guid,
                title: row.title,
                summary: row.summary,
                body: row.body,
                published_at: opt_from_millis(row.published_at),
                created_at: from_millis(row.created_at),
            },
        }
    }
}

/// Repository for feed operations.
pub struct FeedRepository<'a> {
    pool: &'a DbPool,
}

impl<'a> FeedRepository<'a> {
    /// Create a new repository instance.
    pub fn new(pool: &'a DbPool) -> Self {
        Self { pool }
    }

    /// Get a feed by ID.
    pub async fn get_by_id(&self, id: i64) -> Result<Option<Feed>> {
        let query = format!("SELECT {FEED_COLUMNS} FROM feeds WHERE id = $1");
        let row = sqlx::query_as::<_, FeedRow>(&query)
            .bind(id)
            .fetch_optional(self.pool)
            .await
            .map_err(|e| TributaryError::Database(e.to_string()))?;

        Ok(row.map(Feed::from))
    }

    /// Get a feed by canonical URL.
    pub async fn get_by_url(&self, url: &str) -> Result<Option<Feed>> {
        let query = format!("SELECT {FEED_COLUMNS} FROM feeds WHERE url = $1");
        let row = sqlx::query_as::<_, FeedRow>(&query)
            .bind(url)
            .fetch_optional(self.pool)
            .await
            .map_err(|e| TributaryError::Database(e.to_string()))?;

        Ok(row.map(Feed::from))
    }

    /// Get the feed for a canonical URL, creating it when missing.
    ///
    /// A new feed has no `next_fetch_at`, so it is due immediately.
    pub async fn get_or_create(&self, url: &str, now: DateTime<Utc>) -> Result<Feed> {
        sqlx::query(
            r#"
            INSERT INTO feeds (url, created_at, updated_at)
            VALUES ($1, $2, $2)
            ON CONFLICT (url) DO NOTHING
            "#,
        )
        .bind(url)
        .bind(to_millis(now))
        .execute(self.pool)
        .await
        .map_err(|e| TributaryError::Database(e.to_string()))?;

        self.get_by_url(url)
            .await?
            .ok_or_else(|| TributaryError::NotFound("feed".into()))
    }

    /// List feeds due at `now` that have at least one subscriber.
    ///
    /// Feeds claimed by a poller whose lease has not expired are left out.
    /// Never-fetched feeds come first, then the most overdue.
    pub async fn list_due(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<Feed>> {
        let query = format!(
            r#"
            SELECT {FEED_COLUMNS}
            FROM feeds f
            WHERE (f.next_fetch_at IS NULL OR f.next_fetch_at <= $1)
              AND (f.locked_until IS NULL OR f.locked_until <= $1)
              AND EXISTS (SELECT 1 FROM subscriptions s WHERE s.feed_id = f.id)
            ORDER BY f.next_fetch_at ASC NULLS FIRST, f.id ASC
            LIMIT $2
            "#
        );
        let rows = sqlx::query_as::<_, FeedRow>(&query)
            .bind(to_millis(now))
            .bind(i64::from(limit))
            .fetch_all(self.pool)
            .await
            .map_err(|e| TributaryError::Database(e.to_string()))?;

        Ok(rows.into_iter().map(Feed::from).collect())
    }

    /// List all feeds (ordered by creation).
    pub async fn list_all(&self) -> Result<Vec<Feed>> {
        let query = format!("SELECT {FEED_COLUMNS} FROM feeds ORDER BY id ASC");
        let rows = sqlx::query_as::<_, FeedRow>(&query)
            .fetch_all(self.pool)
            .await
            .map_err(|e| TributaryError::Database(e.to_string()))?;

        Ok(rows.into_iter().map(Feed::from).collect())
    }

    /// Record a manual refresh request and make the feed due at `now`.
    pub async fn mark_manual_refresh(&self, id: i64, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE feeds
            SET last_manual_refresh_at = $1, next_fetch_at = $1, updated_at = $1
            WHERE id = $2
            "#,
        )
        .bind(to_millis(now))
        .bind(id)
        .execute(self.pool)
        .await
        .map_err(|e| TributaryError::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    /// Set when a feed is next due. `None` makes it due immediately.
    pub async fn set_next_fetch_at(&self, id: i64, next: Option<DateTime<Utc>>) -> Result<bool> {
        let result = sqlx::query("UPDATE feeds SET next_fetch_at = $1 WHERE id = $2")
            .bind(opt_to_millis(next))
            .bind(id)
            .execute(self.pool)
            .await
            .map_err(|e| TributaryError::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    /// Count all feeds.
    pub async fn count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM feeds")
            .fetch_one(self.pool)
            .await
            .map_err(|e| TributaryError::Database(e.to_string()))?;

        Ok(count)
    }
}

/// Repository for feed item reads.
pub struct FeedItemRepository<'a> {
    pool: &'a DbPool,
}

impl<'a> FeedItemRepository<'a> {
    /// Create a new repository instance.
    pub fn new(pool: &'a DbPool) -> Self {
        Self { pool }
    }

    /// List a feed's items in discovery order.
    pub async fn list_by_feed(&self, feed_id: i64) -> Result<Vec<FeedItem>> {
        let rows = sqlx::query_as::<_, FeedItemRow>(
            r#"
            SELECT id, feed_id, canonical_url_id, guid, title, summary, body,
                   published_at, created_at
            FROM feed_items
            WHERE feed_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(feed_id)
        .fetch_all(self.pool)
        .await
        .map_err(|e| TributaryError::Database(e.to_string()))?;

        Ok(rows.into_iter().map(FeedItem::from).collect())
    }

    /// Count a feed's items.
    pub async fn count_by_feed(&self, feed_id: i64) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM feed_items WHERE feed_id = $1")
            .bind(feed_id)
            .fetch_one(self.pool)
            .await
            .map_err(|e| TributaryError::Database(e.to_string()))?;

        Ok(count)
    }
}

/// Repository for subscriptions.
pub struct SubscriptionRepository<'a> {
    pool: &'a DbPool,
}

impl<'a> SubscriptionRepository<'a> {
    /// Create a new repository instance.
    pub fn new(pool: &'a DbPool) -> Self {
        Self { pool }
    }

    /// Subscribe a user to a feed. Subscribing twice is a no-op.
    pub async fn create(&self, user_id: i64, feed_id: i64, now: DateTime<Utc>) -> Result<Subscription> {
        sqlx::query(
            r#"
            INSERT INTO subscriptions (user_id, feed_id, created_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id, feed_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(feed_id)
        .bind(to_millis(now))
        .execute(self.pool)
        .await
        .map_err(|e| TributaryError::Database(e.to_string()))?;

        self.get(user_id, feed_id)
            .await?
            .ok_or_else(|| TributaryError::NotFound("subscription".into()))
    }

    /// Get a user's subscription to a feed.
    pub async fn get(&self, user_id: i64, feed_id: i64) -> Result<Option<Subscription>> {
        let row = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            SELECT id, user_id, feed_id, created_at
            FROM subscriptions
            WHERE user_id = $1 AND feed_id = $2
            "#,
        )
        .bind(user_id)
        .bind(feed_id)
        .fetch_optional(self.pool)
        .await
        .map_err(|e| TributaryError::Database(e.to_string()))?;

        Ok(row.map(Subscription::from))
    }

    /// Remove a subscription. The feed itself is kept.
    pub async fn delete(&self, user_id: i64, feed_id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM subscriptions WHERE user_id = $1 AND feed_id = $2")
            .bind(user_id)
            .bind(feed_id)
            .execute(self.pool)
            .await
            .map_err(|e| TributaryError::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    /// List a user's subscriptions.
    pub async fn list_by_user(&self, user_id: i64) -> Result<Vec<Subscription>> {
        let rows = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            SELECT id, user_id, feed_id, created_at
            FROM subscriptions
            WHERE user_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(self.pool)
        .await
        .map_err(|e| TributaryError::Database(e.to_string()))?;

        Ok(rows.into_iter().map(Subscription::from).collect())
    }

    /// Count a feed's subscribers.
    pub async fn count_by_feed(&self, feed_id: i64) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM subscriptions WHERE feed_id = $1")
                .bind(feed_id)
                .fetch_one(self.pool)
                .await
                .map_err(|e| TributaryError::Database(e.to_string()))?;

        Ok(count)
    }
}

/// Repository for per-user deliveries.
pub struct UserFeedItemRepository<'a> {
    pool: &'a DbPool,
}

impl<'a> UserFeedItemRepository<'a> {
    /// Create a new repository instance.
    pub fn new(pool: &'a DbPool) -> Self {
        Self { pool }
    }

    /// List a user's undismissed deliveries, newest delivery first.
    pub async fn list_for_user(&self, user_id: i64, limit: u32) -> Result<Vec<UserFeedEntry>> {
        let rows = sqlx::query_as::<_, UserFeedEntryRow>(
            r#"
            SELECT u.id AS delivery_id, u.user_id, u.dismissed, u.created_at AS delivered_at,
                   i.id, i.feed_id, i.canonical_url_id, i.guid, i.title, i.summary, i.body,
                   i.published_at, i.created_at
            FROM user_feed_items u
            JOIN feed_items i ON i.id = u.feed_item_id
            WHERE u.user_id = $1 AND u.dismissed = FALSE
            ORDER BY u.created_at DESC, i.id DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(i64::from(limit))
        .fetch_all(self.pool)
        .await
        .map_err(|e| TributaryError::Database(e.to_string()))?;

        Ok(rows.into_iter().map(UserFeedEntry::from).collect())
    }

    /// Count a user's deliveries, dismissed or not.
    pub async fn count_for_user(&self, user_id: i64) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM user_feed_items WHERE user_id = $1")
                .bind(user_id)
                .fetch_one(self.pool)
                .await
                .map_err(|e| TributaryError::Database(e.to_string()))?;

        Ok(count)
    }

    /// Mark a delivery as dismissed.
    pub async fn dismiss(&self, user_id: i64, feed_item_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE user_feed_items SET dismissed = TRUE WHERE user_id = $1 AND feed_item_id = $2",
        )
        .bind(user_id)
        .bind(feed_item_id)
        .execute(self.pool)
        .await
        .map_err(|e| TributaryError::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }
}
