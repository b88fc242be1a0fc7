//! Transactional feed store used by the poller.
//!
//! A poll pass runs inside one [`FeedTransaction`]: it claims the feed, reads
//! which items are already known, then writes items and deliveries, saves the
//! rescheduled feed and commits. Dropping the transaction without committing
//! rolls the writes back.
//!
//! PostgreSQL claims the feed with a row lock held by the pass transaction.
//! SQLite has no row locks, so the claim is a lease: a short write stamps
//! `locked_until` on the feed row, and the final save clears it. The pass
//! transaction itself opens at the first write, after all network work.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use super::repository::{FeedRepository, FeedRow, FEED_COLUMNS};
use super::types::{Feed, NewFeedItem};
use crate::datetime::{opt_to_millis, to_millis};
use crate::db::{DbPool, DbTransaction};
use crate::{Result, TributaryError};

/// How long a claimed feed stays out of other pollers' reach.
///
/// A pass that dies without saving releases its claim when this runs out.
pub const LOCK_LEASE_MINUTES: i64 = 30;

/// End of the lease taken on a feed claimed at `now`.
pub fn lease_until(now: DateTime<Utc>) -> DateTime<Utc> {
    now + Duration::minutes(LOCK_LEASE_MINUTES)
}

/// Durable feed records as seen by the poller.
#[async_trait]
pub trait FeedStore: Send + Sync {
    /// List feeds due at `now` with at least one subscriber.
    async fn list_due_feeds(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<Feed>>;

    /// Open a transaction for one feed's poll pass.
    async fn begin(&self) -> Result<Box<dyn FeedTransaction>>;

    /// Drop the claim taken on a feed at `claimed_at` by a pass that faulted.
    ///
    /// Claims taken by other pollers are left alone.
    async fn release_feed(&self, feed_id: i64, claimed_at: DateTime<Utc>) -> Result<()>;
}

/// One feed's poll pass.
///
/// Callers finish every read and all network work before the first write;
/// writes run in one short transaction.
#[async_trait]
pub trait FeedTransaction: Send {
    /// Claim a feed without waiting on other pollers.
    ///
    /// Returns `None` when another poller holds the feed or the feed is no
    /// longer due at `now`.
    async fn lock_feed(&mut self, feed_id: i64, now: DateTime<Utc>) -> Result<Option<Feed>>;

    /// Find the item already stored for (feed, canonical URL).
    async fn find_item_id(&mut self, feed_id: i64, canonical_url: &str) -> Result<Option<String>>;

    /// Get or create the identity of a canonical URL.
    async fn canonical_url_id(&mut self, url: &str) -> Result<i64>;

    /// Insert an item, or on conflict touch only its feed linkage.
    ///
    /// Returns the identity of the row after the upsert.
    async fn upsert_item(&mut self, item: &NewFeedItem) -> Result<String>;

    /// List the users currently subscribed to a feed.
    async fn list_subscribers(&mut self, feed_id: i64) -> Result<Vec<i64>>;

    /// Deliver an item to a user. Returns false if already delivered.
    async fn insert_user_item(&mut self, user_id: i64, feed_item_id: &str) -> Result<bool>;

    /// Count a feed's stored items.
    async fn count_items(&mut self, feed_id: i64) -> Result<i64>;

    /// Persist a feed's cached metadata and scheduling fields and release
    /// its claim.
    async fn save_feed(&mut self, feed: &Feed) -> Result<()>;

    /// Commit the pass.
    async fn commit(self: Box<Self>) -> Result<()>;
}

/// [`FeedStore`] backed by the sqlx pool.
#[derive(Clone)]
pub struct SqlFeedStore {
    pool: DbPool,
}

impl SqlFeedStore {
    /// Create a store over a pool.
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FeedStore for SqlFeedStore {
    async fn list_due_feeds(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<Feed>> {
        FeedRepository::new(&self.pool).list_due(now, limit).await
    }

    #[cfg(all(feature = "sqlite", not(feature = "postgres")))]
    async fn begin(&self) -> Result<Box<dyn FeedTransaction>> {
        Ok(Box::new(SqlFeedTransaction {
            pool: self.pool.clone(),
            tx: None,
            leased: None,
        }))
    }

    #[cfg(feature = "postgres")]
    async fn begin(&self) -> Result<Box<dyn FeedTransaction>> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| TributaryError::Database(e.to_string()))?;
        Ok(Box::new(SqlFeedTransaction {
            pool: self.pool.clone(),
            tx: Some(tx),
            leased: None,
        }))
    }

    async fn release_feed(&self, feed_id: i64, claimed_at: DateTime<Utc>) -> Result<()> {
        let result =
            sqlx::query("UPDATE feeds SET locked_until = NULL WHERE id = $1 AND locked_until = $2")
                .bind(feed_id)
                .bind(to_millis(lease_until(claimed_at)))
                .execute(&self.pool)
                .await
                .map_err(|e| TributaryError::Database(e.to_string()))?;

        if result.rows_affected() > 0 {
            debug!("Released claim on feed {}", feed_id);
        }
        Ok(())
    }
}

/// [`FeedTransaction`] over the sqlx pool.
pub struct SqlFeedTransaction {
    pool: DbPool,
    tx: Option<DbTransaction>,
    leased: Option<i64>,
}

impl SqlFeedTransaction {
    /// The pass transaction, opened on first use.
    ///
    /// On SQLite the first statement is a write to the claimed feed, so the
    /// transaction holds the write lock from the start and never upgrades a
    /// stale read snapshot.
    async fn writer(&mut self) -> Result<&mut DbTransaction> {
        if self.tx.is_none() {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| TributaryError::Database(e.to_string()))?;
            if let Some(feed_id) = self.leased {
                sqlx::query("UPDATE feeds SET updated_at = $1 WHERE id = $2")
                    .bind(to_millis(Utc::now()))
                    .bind(feed_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| TributaryError::Database(e.to_string()))?;
            }
            self.tx = Some(tx);
        }
        self.tx
            .as_mut()
            .ok_or_else(|| TributaryError::Database("transaction not open".into()))
    }
}

/// Check whether an error means the database is held elsewhere.
#[cfg(all(feature = "sqlite", not(feature = "postgres")))]
fn is_lock_unavailable(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => {
            let message = db.message().to_lowercase();
            message.contains("database is locked")
                || message.contains("database table is locked")
                || message.contains("sqlite_busy")
                || message.contains("sqlite_locked")
        }
        _ => false,
    }
}

#[async_trait]
impl FeedTransaction for SqlFeedTransaction {
    /// Stamp a lease on the feed in its own short write. Only a feed that is
    /// due and not leased to a live pass can be claimed.
    #[cfg(all(feature = "sqlite", not(feature = "postgres")))]
    async fn lock_feed(&mut self, feed_id: i64, now: DateTime<Utc>) -> Result<Option<Feed>> {
        let query = format!(
            r#"
            UPDATE feeds SET locked_until = $1
            WHERE id = $2
              AND (next_fetch_at IS NULL OR next_fetch_at <= $3)
              AND (locked_until IS NULL OR locked_until <= $3)
            RETURNING {FEED_COLUMNS}
            "#
        );
        let result = sqlx::query_as::<_, FeedRow>(&query)
            .bind(to_millis(lease_until(now)))
            .bind(feed_id)
            .bind(to_millis(now))
            .fetch_optional(&self.pool)
            .await;

        match result {
            Ok(Some(row)) => {
                self.leased = Some(feed_id);
                Ok(Some(Feed::from(row)))
            }
            Ok(None) => {
                debug!("Feed {} is claimed by another poller or not due", feed_id);
                Ok(None)
            }
            Err(e) if is_lock_unavailable(&e) => {
                debug!("Database busy while claiming feed {}", feed_id);
                Ok(None)
            }
            Err(e) => Err(TributaryError::Database(e.to_string())),
        }
    }

    #[cfg(feature = "postgres")]
    async fn lock_feed(&mut self, feed_id: i64, now: DateTime<Utc>) -> Result<Option<Feed>> {
        let query = format!(
            r#"
            SELECT {FEED_COLUMNS}
            FROM feeds
            WHERE id = $1 AND (next_fetch_at IS NULL OR next_fetch_at <= $2)
            FOR UPDATE SKIP LOCKED
            "#
        );
        let tx = self.writer().await?;
        let row = sqlx::query_as::<_, FeedRow>(&query)
            .bind(feed_id)
            .bind(to_millis(now))
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| TributaryError::Database(e.to_string()))?;

        if row.is_none() {
            debug!("Feed {} is locked by another poller or not due", feed_id);
        }
        Ok(row.map(Feed::from))
    }

    async fn find_item_id(&mut self, feed_id: i64, canonical_url: &str) -> Result<Option<String>> {
        let query = sqlx::query_scalar::<_, String>(
            r#"
            SELECT i.id
            FROM feed_items i
            JOIN canonical_urls c ON c.id = i.canonical_url_id
            WHERE i.feed_id = $1 AND c.url = $2
            "#,
        )
        .bind(feed_id)
        .bind(canonical_url);

        let id = match self.tx.as_mut() {
            Some(tx) => query.fetch_optional(&mut **tx).await,
            None => query.fetch_optional(&self.pool).await,
        }
        .map_err(|e| TributaryError::Database(e.to_string()))?;

        Ok(id)
    }

    async fn canonical_url_id(&mut self, url: &str) -> Result<i64> {
        let tx = self.writer().await?;
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO canonical_urls (url, created_at)
            VALUES ($1, $2)
            ON CONFLICT (url) DO UPDATE SET url = excluded.url
            RETURNING id
            "#,
        )
        .bind(url)
        .bind(to_millis(Utc::now()))
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| TributaryError::Database(e.to_string()))?;

        Ok(id)
    }

    async fn upsert_item(&mut self, item: &NewFeedItem) -> Result<String> {
        let tx = self.writer().await?;
        let id: String = sqlx::query_scalar(
            r#"
            INSERT INTO feed_items (id, feed_id, canonical_url_id, guid, title, summary, body,
                                    published_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (feed_id, canonical_url_id) DO UPDATE SET feed_id = excluded.feed_id
            RETURNING id
            "#,
        )
        .bind(&item.id)
        .bind(item.feed_id)
        .bind(item.canonical_url_id)
        .bind(&item.guid)
        .bind(&item.title)
        .bind(&item.summary)
        .bind(&item.body)
        .bind(opt_to_millis(item.published_at))
        .bind(to_millis(Utc::now()))
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| TributaryError::Database(e.to_string()))?;

        Ok(id)
    }

    async fn list_subscribers(&mut self, feed_id: i64) -> Result<Vec<i64>> {
        let tx = self.writer().await?;
        let users: Vec<i64> = sqlx::query_scalar(
            "SELECT user_id FROM subscriptions WHERE feed_id = $1 ORDER BY user_id ASC",
        )
        .bind(feed_id)
        .fetch_all(&mut **tx)
        .await
        .map_err(|e| TributaryError::Database(e.to_string()))?;

        Ok(users)
    }

    async fn insert_user_item(&mut self, user_id: i64, feed_item_id: &str) -> Result<bool> {
        let tx = self.writer().await?;
        let result = sqlx::query(
            r#"
            INSERT INTO user_feed_items (user_id, feed_item_id, created_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id, feed_item_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(feed_item_id)
        .bind(to_millis(Utc::now()))
        .execute(&mut **tx)
        .await
        .map_err(|e| TributaryError::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn count_items(&mut self, feed_id: i64) -> Result<i64> {
        let tx = self.writer().await?;
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM feed_items WHERE feed_id = $1")
            .bind(feed_id)
            .fetch_one(&mut **tx)
            .await
            .map_err(|e| TributaryError::Database(e.to_string()))?;

        Ok(count)
    }

    async fn save_feed(&mut self, feed: &Feed) -> Result<()> {
        let tx = self.writer().await?;
        sqlx::query(
            r#"
            UPDATE feeds
            SET title = $1, description = $2, next_fetch_at = $3, last_fetched_at = $4,
                last_fetch_error = $5, last_items_count = $6, consecutive_empty_fetches = $7,
                avg_items_per_day = $8, updated_at = $9, locked_until = NULL
            WHERE id = $10
            "#,
        )
        .bind(&feed.title)
        .bind(&feed.description)
        .bind(opt_to_millis(feed.next_fetch_at))
        .bind(opt_to_millis(feed.last_fetched_at))
        .bind(&feed.last_fetch_error)
        .bind(feed.last_items_count)
        .bind(feed.consecutive_empty_fetches)
        .bind(feed.avg_items_per_day)
        .bind(to_millis(Utc::now()))
        .bind(feed.id)
        .execute(&mut **tx)
        .await
        .map_err(|e| TributaryError::Database(e.to_string()))?;

        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        match self.tx {
            Some(tx) => tx
                .commit()
                .await
                .map_err(|e| TributaryError::Database(e.to_string())),
            None => Ok(()),
        }
    }
}

#[cfg(all(test, feature = "sqlite", not(feature = "postgres")))]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::feeder::repository::{FeedItemRepository, SubscriptionRepository};

    async fn setup() -> (Database, SqlFeedStore, Feed) {
        let db = Database::open_in_memory().await.unwrap();
        let store = SqlFeedStore::new(db.pool().clone());
        let feed = FeedRepository::new(db.pool())
            .get_or_create("https://a.example/feed", Utc::now())
            .await
            .unwrap();
        (db, store, feed)
    }

    async fn locked_until(db: &Database, feed_id: i64) -> Option<i64> {
        sqlx::query_scalar("SELECT locked_until FROM feeds WHERE id = $1")
            .bind(feed_id)
            .fetch_one(db.pool())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_lock_due_feed() {
        let (_db, store, feed) = setup().await;

        let mut tx = store.begin().await.unwrap();
        let locked = tx.lock_feed(feed.id, Utc::now()).await.unwrap();
        assert_eq!(locked.map(|f| f.id), Some(feed.id));
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_lock_skips_feed_not_due() {
        let (db, store, feed) = setup().await;
        let now = Utc::now();
        FeedRepository::new(db.pool())
            .set_next_fetch_at(feed.id, Some(now + Duration::minutes(10)))
            .await
            .unwrap();

        let mut tx = store.begin().await.unwrap();
        assert!(tx.lock_feed(feed.id, now).await.unwrap().is_none());
        assert!(tx.lock_feed(999, now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claimed_feed_is_skipped_until_saved() {
        let (db, store, feed) = setup().await;
        let now = Utc::now();

        let mut first = store.begin().await.unwrap();
        let claimed = first.lock_feed(feed.id, now).await.unwrap().unwrap();
        assert_eq!(
            locked_until(&db, feed.id).await,
            Some(to_millis(lease_until(now)))
        );

        // Held by the first pass, which has not written anything yet
        let mut second = store.begin().await.unwrap();
        assert!(second.lock_feed(feed.id, now).await.unwrap().is_none());

        first.save_feed(&claimed).await.unwrap();
        first.commit().await.unwrap();
        assert_eq!(locked_until(&db, feed.id).await, None);

        let mut third = store.begin().await.unwrap();
        assert!(third.lock_feed(feed.id, now).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_claimed() {
        let (_db, store, feed) = setup().await;
        let now = Utc::now();

        let mut abandoned = store.begin().await.unwrap();
        abandoned.lock_feed(feed.id, now).await.unwrap().unwrap();
        drop(abandoned);

        let mut tx = store.begin().await.unwrap();
        assert!(tx.lock_feed(feed.id, now).await.unwrap().is_none());
        let later = lease_until(now) + Duration::seconds(1);
        assert!(tx.lock_feed(feed.id, later).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_release_only_drops_own_claim() {
        let (db, store, feed) = setup().await;
        let now = Utc::now();

        let mut tx = store.begin().await.unwrap();
        tx.lock_feed(feed.id, now).await.unwrap().unwrap();
        drop(tx);

        store
            .release_feed(feed.id, now - Duration::seconds(1))
            .await
            .unwrap();
        assert!(locked_until(&db, feed.id).await.is_some());

        store.release_feed(feed.id, now).await.unwrap();
        assert_eq!(locked_until(&db, feed.id).await, None);
    }

    #[tokio::test]
    async fn test_canonical_url_id_is_stable() {
        let (_db, store, _feed) = setup().await;

        let mut tx = store.begin().await.unwrap();
        let a = tx.canonical_url_id("https://a.example/1").await.unwrap();
        let b = tx.canonical_url_id("https://a.example/2").await.unwrap();
        let again = tx.canonical_url_id("https://a.example/1").await.unwrap();
        assert_ne!(a, b);
        assert_eq!(a, again);
    }

    #[tokio::test]
    async fn test_upsert_returns_existing_identity() {
        let (db, store, feed) = setup().await;
        let url = "https://a.example/1";

        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.find_item_id(feed.id, url).await.unwrap(), None);
        let canonical = tx.canonical_url_id(url).await.unwrap();

        let first = NewFeedItem::new("0001", feed.id, canonical, url)
            .with_title("First")
            .with_body("body");
        assert_eq!(tx.upsert_item(&first).await.unwrap(), "0001");

        let second = NewFeedItem::new("0002", feed.id, canonical, url)
            .with_title("Changed")
            .with_body("other");
        assert_eq!(tx.upsert_item(&second).await.unwrap(), "0001");
        assert_eq!(
            tx.find_item_id(feed.id, url).await.unwrap().as_deref(),
            Some("0001")
        );
        assert_eq!(tx.count_items(feed.id).await.unwrap(), 1);
        tx.commit().await.unwrap();

        let items = FeedItemRepository::new(db.pool())
            .list_by_feed(feed.id)
            .await
            .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title, "First");
        assert_eq!(items[0].body, "body");

        // Committed items are found before any write
        let mut tx = store.begin().await.unwrap();
        assert_eq!(
            tx.find_item_id(feed.id, url).await.unwrap().as_deref(),
            Some("0001")
        );
        assert_eq!(tx.find_item_id(feed.id + 1, url).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_fan_out_is_once_per_user() {
        let (db, store, feed) = setup().await;
        let subs = SubscriptionRepository::new(db.pool());
        subs.create(2, feed.id, Utc::now()).await.unwrap();
        subs.create(1, feed.id, Utc::now()).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.list_subscribers(feed.id).await.unwrap(), vec![1, 2]);

        let canonical = tx.canonical_url_id("https://a.example/1").await.unwrap();
        let item = NewFeedItem::new("0001", feed.id, canonical, "https://a.example/1");
        tx.upsert_item(&item).await.unwrap();
        assert!(tx.insert_user_item(1, "0001").await.unwrap());
        assert!(!tx.insert_user_item(1, "0001").await.unwrap());
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_save_feed_and_rollback() {
        let (db, store, feed) = setup().await;
        let now = Utc::now();
        let repo = FeedRepository::new(db.pool());

        // Dropped without commit: the save is rolled back, the lease stays
        {
            let mut tx = store.begin().await.unwrap();
            let mut locked = tx.lock_feed(feed.id, now).await.unwrap().unwrap();
            locked.last_fetch_error = Some("boom".into());
            tx.save_feed(&locked).await.unwrap();
        }
        assert_eq!(repo.get_by_id(feed.id).await.unwrap().unwrap().last_fetch_error, None);
        assert!(locked_until(&db, feed.id).await.is_some());

        store.release_feed(feed.id, now).await.unwrap();
        let mut tx = store.begin().await.unwrap();
        let mut locked = tx.lock_feed(feed.id, now).await.unwrap().unwrap();
        locked.title = Some("Title".into());
        locked.last_items_count = 3;
        locked.consecutive_empty_fetches = 0;
        locked.avg_items_per_day = 0.1;
        locked.next_fetch_at = Some(now + Duration::minutes(60));
        locked.last_fetched_at = Some(now);
        tx.save_feed(&locked).await.unwrap();
        tx.commit().await.unwrap();

        let saved = repo.get_by_id(feed.id).await.unwrap().unwrap();
        assert_eq!(saved.title.as_deref(), Some("Title"));
        assert_eq!(saved.last_items_count, 3);
        assert_eq!(saved.avg_items_per_day, 0.1);
        assert!(!saved.is_due(now));
        assert_eq!(locked_until(&db, feed.id).await, None);
    }

    #[tokio::test]
    async fn test_list_due_feeds_delegates() {
        let (db, store, feed) = setup().await;
        assert!(store.list_due_feeds(Utc::now(), 10).await.unwrap().is_empty());

        SubscriptionRepository::new(db.pool())
            .create(1, feed.id, Utc::now())
            .await
            .unwrap();
        let due = store.list_due_feeds(Utc::now(), 10).await.unwrap();
        assert_eq!(due.len(), 1);
    }
}
