//! Feed ingestion types for tributary.

use chrono::{DateTime, Utc};

/// Maximum length for a cleaned item title.
pub const MAX_TITLE_LENGTH: usize = 500;

/// A subscribable feed, one row per canonical feed URL.
#[derive(Debug, Clone, PartialEq)]
pub struct Feed {
    /// Feed ID.
    pub id: i64,
    /// Canonical feed URL.
    pub url: String,
    /// Cached feed title, filled on the first successful fetch.
    pub title: Option<String>,
    /// Cached feed description, filled on the first successful fetch.
    pub description: Option<String>,
    /// Next scheduled fetch. `None` means due immediately.
    pub next_fetch_at: Option<DateTime<Utc>>,
    /// Last fetch attempt, successful or not.
    pub last_fetched_at: Option<DateTime<Utc>>,
    /// Error message of the last failed fetch.
    pub last_fetch_error: Option<String>,
    /// New items found by the last successful fetch.
    pub last_items_count: i64,
    /// Successful fetches in a row that found nothing new.
    pub consecutive_empty_fetches: i64,
    /// Activity estimate driving the polling tier.
    pub avg_items_per_day: f64,
    /// Last time a user asked for an immediate refresh.
    pub last_manual_refresh_at: Option<DateTime<Utc>>,
    /// When the feed was created.
    pub created_at: DateTime<Utc>,
    /// When the feed row was last written.
    pub updated_at: DateTime<Utc>,
}

impl Feed {
    /// Check if the feed is due at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.next_fetch_at {
            None => true,
            Some(next) => next <= now,
        }
    }

    /// Check if the pending pass was triggered by a manual refresh.
    ///
    /// A refresh request counts until the next fetch attempt consumes it.
    pub fn was_manual_refresh(&self) -> bool {
        match (self.last_manual_refresh_at, self.last_fetched_at) {
            (Some(_), None) => true,
            (Some(requested), Some(fetched)) => requested > fetched,
            (None, _) => false,
        }
    }
}

/// A stored feed item.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedItem {
    /// Time-ordered identity (UUIDv7).
    pub id: String,
    /// Feed ID.
    pub feed_id: i64,
    /// Canonical URL ID.
    pub canonical_url_id: i64,
    /// Original item URL as found in the source.
    pub guid: String,
    /// Cleaned title.
    pub title: String,
    /// Raw summary as published.
    pub summary: Option<String>,
    /// Sanitized markdown body.
    pub body: String,
    /// When the item was published.
    pub published_at: Option<DateTime<Utc>>,
    /// When the item was first discovered.
    pub created_at: DateTime<Utc>,
}

/// New feed item for upsert.
#[derive(Debug, Clone)]
pub struct NewFeedItem {
    /// Freshly generated identity.
    pub id: String,
    /// Feed ID.
    pub feed_id: i64,
    /// Canonical URL ID.
    pub canonical_url_id: i64,
    /// Original item URL.
    pub guid: String,
    /// Cleaned title.
    pub title: String,
    /// Raw summary.
    pub summary: Option<String>,
    /// Markdown body.
    pub body: String,
    /// When the item was published.
    pub published_at: Option<DateTime<Utc>>,
}

impl NewFeedItem {
    /// Create a new item.
    pub fn new(
        id: impl Into<String>,
        feed_id: i64,
        canonical_url_id: i64,
        guid: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            feed_id,
            canonical_url_id,
            guid: guid.into(),
            title: String::new(),
            summary: None,
            body: String::new(),
            published_at: None,
        }
    }

    /// Set the title, truncated to `MAX_TITLE_LENGTH` characters.
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        let title = title.into();
        self.title = if title.chars().count() > MAX_TITLE_LENGTH {
            title.chars().take(MAX_TITLE_LENGTH).collect()
        } else {
            title
        };
        self
    }

    /// Set the raw summary.
    pub fn with_summary(mut self, summary: Option<String>) -> Self {
        self.summary = summary;
        self
    }

    /// Set the body.
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Set the published date.
    pub fn with_published_at(mut self, published_at: Option<DateTime<Utc>>) -> Self {
        self.published_at = published_at;
        self
    }
}

/// A user's subscription to a feed.
#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    /// Subscription ID.
    pub id: i64,
    /// Subscriber.
    pub user_id: i64,
    /// Feed ID.
    pub feed_id: i64,
    /// When the subscription was created.
    pub created_at: DateTime<Utc>,
}

/// A per-subscriber delivery record.
#[derive(Debug, Clone, PartialEq)]
pub struct UserFeedItem {
    /// Delivery ID.
    pub id: i64,
    /// Recipient.
    pub user_id: i64,
    /// Delivered item.
    pub feed_item_id: String,
    /// Whether the user dismissed the item.
    pub dismissed: bool,
    /// When the item was delivered.
    pub created_at: DateTime<Utc>,
}

/// A delivery joined with its item, for reading a user's feed.
#[derive(Debug, Clone, PartialEq)]
pub struct UserFeedEntry {
    /// The delivery record.
    pub delivery: UserFeedItem,
    /// The delivered item.
    pub item: FeedItem,
}

/// Parsed feed data from external source.
#[derive(Debug, Clone, Default)]
pub struct ParsedFeed {
    /// Feed title.
    pub title: Option<String>,
    /// Feed description.
    pub description: Option<String>,
    /// Parsed items, in document order.
    pub items: Vec<ParsedItem>,
}

/// Parsed item data from external source.
#[derive(Debug, Clone, Default)]
pub struct ParsedItem {
    /// Source identifier (RSS guid or Atom id).
    pub guid: Option<String>,
    /// Raw title.
    pub title: Option<String>,
    /// Link to the original article, possibly relative.
    pub link: Option<String>,
    /// Raw summary HTML.
    pub summary: Option<String>,
    /// Raw content HTML.
    pub content: Option<String>,
    /// When the item was published.
    pub published_at: Option<DateTime<Utc>>,
}

impl ParsedItem {
    /// Create an item with a link.
    pub fn new(link: impl Into<String>) -> Self {
        Self {
            link: Some(link.into()),
            ..Self::default()
        }
    }

    /// Set the title.
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Set the summary.
    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    /// Set the content.
    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    /// Set the published date.
    pub fn with_published_at(mut self, published_at: DateTime<Utc>) -> Self {
        self.published_at = Some(published_at);
        self
    }

    /// HTML used to build the stored body: content, else summary.
    pub fn body_html(&self) -> Option<&str> {
        self.content
            .as_deref()
            .filter(|c| !c.trim().is_empty())
            .or(self.summary.as_deref())
    }
}
