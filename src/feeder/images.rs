//! Inline image replacement for item bodies.
//!
//! Every markdown image reference in an item is either rewritten to a stored
//! location or replaced by an inline placeholder link citing the original
//! URL. Downloads share one time budget per item and a per-item count limit.
//!
//! Stored locations are remembered by canonical URL for the life of the
//! replacer, so an image shared by several items is uploaded once.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use regex::Regex;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

use super::canonical::canonicalize_url;
use super::media::{ImageUploader, MediaError};
use crate::config::ImagesConfig;
use crate::{Result, TributaryError};

/// Markdown image reference: `![alt](url)`, `![alt](<url>)`, optional title.
const IMAGE_PATTERN: &str = r#"!\[(?P<alt>[^\]]*)\]\((?P<url><[^>]*>|[^)\s]+)(?:\s+"[^"]*")?\)"#;

/// Cached stored locations kept before the cache is reset.
const MAX_CACHED_IMAGES: usize = 4096;

/// Result of resolving one distinct image URL.
#[derive(Debug, Clone, PartialEq)]
pub enum ImageOutcome {
    /// Stored at the given location.
    Stored(String),
    /// Beyond the per-item image limit; never downloaded.
    LimitExceeded,
    /// The shared time budget ran out.
    Timeout,
    /// The image exceeded the size limit.
    TooLarge,
    /// Any other download or storage failure.
    Failed,
}

impl ImageOutcome {
    fn from_error(e: &MediaError) -> Self {
        match e {
            MediaError::Timeout => ImageOutcome::Timeout,
            MediaError::TooLarge { .. } => ImageOutcome::TooLarge,
            _ => ImageOutcome::Failed,
        }
    }

    fn reason(&self) -> &'static str {
        match self {
            ImageOutcome::Stored(_) => "stored",
            ImageOutcome::LimitExceeded => "too many images",
            ImageOutcome::Timeout => "timed out",
            ImageOutcome::TooLarge => "file too large",
            ImageOutcome::Failed => "download failed",
        }
    }

    /// Markdown that replaces the original reference.
    ///
    /// Inside a link label a placeholder is plain text, since links do not
    /// nest.
    fn render(&self, alt: &str, url: &str, in_label: bool) -> String {
        match self {
            ImageOutcome::Stored(stored) => format!("![{alt}]({stored})"),
            _ if in_label => format!(
                "image not loaded: {} ({})",
                self.reason(),
                url.replace('[', "\\[").replace(']', "\\]")
            ),
            _ => format!("[image not loaded: {}]({url})", self.reason()),
        }
    }
}

/// Link label nesting after `text`, starting from `depth`.
///
/// Escaped characters and code spans are skipped; a blank line ends any open
/// label.
fn label_depth(mut depth: usize, text: &str) -> usize {
    let mut chars = text.chars();
    let mut in_code = false;
    let mut line_has_text = true;
    while let Some(ch) = chars.next() {
        match ch {
            '\\' => {
                chars.next();
                line_has_text = true;
            }
            '`' => {
                in_code = !in_code;
                line_has_text = true;
            }
            '\n' => {
                if !line_has_text {
                    depth = 0;
                    in_code = false;
                }
                line_has_text = false;
            }
            '[' if !in_code => {
                depth += 1;
                line_has_text = true;
            }
            ']' if !in_code => {
                depth = depth.saturating_sub(1);
                line_has_text = true;
            }
            c if c.is_whitespace() => {}
            _ => line_has_text = true,
        }
    }
    depth
}

/// Rewrites image references in item markdown.
#[derive(Debug)]
pub struct ImageReplacer {
    pattern: Regex,
    max_images: usize,
    time_budget: Duration,
    stored: Mutex<HashMap<String, String>>,
}

impl ImageReplacer {
    /// Create a replacer.
    ///
    /// One slot of `max_images` is reserved for the limit notice, so at most
    /// `max_images - 1` distinct images are downloaded per item.
    pub fn new(max_images: usize, time_budget: Duration) -> Result<Self> {
        let pattern = Regex::new(IMAGE_PATTERN)
            .map_err(|e| TributaryError::Config(format!("invalid image pattern: {e}")))?;
        Ok(Self {
            pattern,
            max_images,
            time_budget,
            stored: Mutex::new(HashMap::new()),
        })
    }

    /// Create a replacer from configuration.
    pub fn from_config(config: &ImagesConfig) -> Result<Self> {
        Self::new(
            config.max_images_per_item,
            Duration::from_secs(config.time_budget_secs),
        )
    }

    /// Replace every image reference in `markdown`.
    ///
    /// Identical URLs are downloaded once and rewritten to the same result.
    /// Images already stored for an earlier item are reused without a
    /// download; they still count toward the per-item limit.
    pub async fn replace(&self, markdown: &str, uploader: &dyn ImageUploader) -> String {
        let deadline = Instant::now() + self.time_budget;
        let download_budget = self.max_images.saturating_sub(1);
        let mut downloads = 0usize;
        let mut outcomes: HashMap<String, ImageOutcome> = HashMap::new();

        let mut out = String::with_capacity(markdown.len());
        let mut last = 0;
        let mut depth = 0usize;

        for caps in self.pattern.captures_iter(markdown) {
            let (Some(whole), Some(alt), Some(raw_url)) =
                (caps.get(0), caps.name("alt"), caps.name("url"))
            else {
                continue;
            };
            let url = raw_url
                .as_str()
                .trim_start_matches('<')
                .trim_end_matches('>');
            let key = canonicalize_url(url).unwrap_or_else(|_| url.to_string());

            let outcome = match outcomes.get(&key) {
                Some(outcome) => outcome.clone(),
                None => {
                    let outcome = if downloads >= download_budget {
                        ImageOutcome::LimitExceeded
                    } else if let Some(stored) = self.cached(&key) {
                        downloads += 1;
                        debug!("Reusing stored image {} as {}", url, stored);
                        ImageOutcome::Stored(stored)
                    } else if Instant::now() >= deadline {
                        ImageOutcome::Timeout
                    } else {
                        downloads += 1;
                        let outcome = self.download(url, uploader, deadline).await;
                        if let ImageOutcome::Stored(stored) = &outcome {
                            self.remember(&key, stored);
                        }
                        outcome
                    };
                    outcomes.insert(key, outcome.clone());
                    outcome
                }
            };

            let before = &markdown[last..whole.start()];
            depth = label_depth(depth, before);
            out.push_str(before);
            out.push_str(&outcome.render(alt.as_str(), url, depth > 0));
            last = whole.end();
        }

        out.push_str(&markdown[last..]);
        out
    }

    fn cached(&self, key: &str) -> Option<String> {
        self.stored
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn remember(&self, key: &str, stored: &str) {
        let mut cache = self.stored.lock().unwrap_or_else(PoisonError::into_inner);
        if cache.len() >= MAX_CACHED_IMAGES {
            cache.clear();
        }
        cache.insert(key.to_string(), stored.to_string());
    }

    async fn download(
        &self,
        url: &str,
        uploader: &dyn ImageUploader,
        deadline: Instant,
    ) -> ImageOutcome {
        match timeout_at(deadline, uploader.upload_image(url)).await {
            Ok(Ok(stored)) => {
                debug!("Stored image {} as {}", url, stored);
                ImageOutcome::Stored(stored)
            }
            Ok(Err(e)) => {
                warn!("Image {} not loaded: {}", url, e);
                ImageOutcome::from_error(&e)
            }
            Err(_) => {
                warn!("Image {} not loaded: time budget exhausted", url);
                ImageOutcome::Timeout
            }
        }
    }
}
