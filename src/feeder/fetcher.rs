//! Feed and media fetcher with security measures.
//!
//! This module retrieves feed documents and inline media over HTTP with
//! SSRF protection, per-request timeouts and size limits.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use async_trait::async_trait;
use feed_rs::parser;
use futures::StreamExt;
use reqwest::{redirect, Client};
use url::Url;

use super::media::MediaError;
use super::types::{ParsedFeed, ParsedItem};
use crate::config::FetcherConfig;
use crate::{Result, TributaryError};

/// Network retrieval capability.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch and parse the feed document at `url`.
    async fn fetch(&self, url: &str) -> Result<ParsedFeed>;

    /// Fetch a media resource, failing once it exceeds `max_bytes`.
    async fn fetch_media(
        &self,
        url: &str,
        max_bytes: u64,
    ) -> std::result::Result<Vec<u8>, MediaError>;
}

/// HTTP fetcher backed by reqwest and feed-rs.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    max_feed_size: u64,
    max_items: usize,
    allow_private_hosts: bool,
}

impl HttpFetcher {
    /// Create a new fetcher from configuration.
    pub fn new(config: &FetcherConfig) -> Result<Self> {
        let max_redirects = config.max_redirects;
        let allow_private_hosts = config.allow_private_hosts;

        // Every redirect hop is validated like the original URL
        let policy = redirect::Policy::custom(move |attempt| {
            if attempt.previous().len() >= max_redirects {
                attempt.error("too many redirects")
            } else if !allow_private_hosts && validate_url(attempt.url().as_str()).is_err() {
                attempt.error("redirect to forbidden host")
            } else {
                attempt.follow()
            }
        });

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.total_timeout_secs))
            .redirect(policy)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| TributaryError::Config(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            max_feed_size: config.max_feed_size_bytes,
            max_items: config.max_items_per_feed,
            allow_private_hosts,
        })
    }

    fn check_url(&self, url: &str) -> Result<Url> {
        if self.allow_private_hosts {
            Url::parse(url).map_err(|e| TributaryError::Validation(format!("invalid URL: {e}")))
        } else {
            validate_url(url)
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<ParsedFeed> {
        let url = self
            .check_url(url)
            .map_err(|e| TributaryError::Fetch(e.to_string()))?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| TributaryError::Fetch(format!("failed to fetch feed: {e}")))?;

        if !response.status().is_success() {
            return Err(TributaryError::Fetch(format!(
                "HTTP error: {}",
                response.status()
            )));
        }

        let bytes = read_limited_bytes(response, self.max_feed_size)
            .await
            .map_err(|e| match e {
                MediaError::TooLarge { limit } => {
                    TributaryError::Fetch(format!("feed too large (max {limit} bytes)"))
                }
                other => TributaryError::Fetch(other.to_string()),
            })?;

        let mut feed = parse_feed(&bytes)?;
        // Entries are newest-first; keep the newest ones
        feed.items.truncate(self.max_items);
        Ok(feed)
    }

    async fn fetch_media(
        &self,
        url: &str,
        max_bytes: u64,
    ) -> std::result::Result<Vec<u8>, MediaError> {
        let url = self
            .check_url(url)
            .map_err(|e| MediaError::Download(e.to_string()))?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        if !response.status().is_success() {
            return Err(MediaError::Download(format!(
                "HTTP error: {}",
                response.status()
            )));
        }

        read_limited_bytes(response, max_bytes).await
    }
}

fn map_reqwest_error(e: reqwest::Error) -> MediaError {
    if e.is_timeout() {
        MediaError::Timeout
    } else {
        MediaError::Download(e.to_string())
    }
}

/// Read a response body, failing once it exceeds `limit` bytes.
///
/// `Content-Length` is checked up front and the running total again while
/// streaming, since the header may be absent or wrong.
async fn read_limited_bytes(
    response: reqwest::Response,
    limit: u64,
) -> std::result::Result<Vec<u8>, MediaError> {
    if let Some(len) = response.content_length() {
        if len > limit {
            return Err(MediaError::TooLarge { limit });
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(map_reqwest_error)?;
        if (bytes.len() as u64).saturating_add(chunk.len() as u64) > limit {
            return Err(MediaError::TooLarge { limit });
        }
        bytes.extend_from_slice(&chunk);
    }

    Ok(bytes)
}

/// Validate a URL for SSRF protection.
///
/// This function checks that:
/// - The URL uses http or https scheme
/// - The host is not a loopback, private, link-local or reserved address
/// - The host is not a local-only hostname
pub fn validate_url(url: &str) -> Result<Url> {
    let parsed =
        Url::parse(url).map_err(|e| TributaryError::Validation(format!("invalid URL: {e}")))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(TributaryError::Validation(format!(
                "unsupported URL scheme: {scheme}"
            )));
        }
    }

    let host = parsed
        .host()
        .ok_or_else(|| TributaryError::Validation("URL has no host".to_string()))?;

    let forbidden = match host {
        url::Host::Domain(domain) => is_forbidden_hostname(domain),
        url::Host::Ipv4(ip) => is_private_ip(&IpAddr::V4(ip)),
        url::Host::Ipv6(ip) => is_private_ip(&IpAddr::V6(ip)),
    };
    if forbidden {
        return Err(TributaryError::Validation(format!(
            "forbidden host: {}",
            parsed.host_str().unwrap_or_default()
        )));
    }

    Ok(parsed)
}

/// Check if a hostname is forbidden.
fn is_forbidden_hostname(host: &str) -> bool {
    const FORBIDDEN_SUFFIXES: &[&str] = &[
        ".local",
        ".localhost",
        ".internal",
        ".intranet",
        ".corp",
        ".home",
        ".lan",
    ];

    let host = host.trim_end_matches('.').to_lowercase();
    host == "localhost" || FORBIDDEN_SUFFIXES.iter().any(|s| host.ends_with(s))
}

/// Check if an IP address is private/reserved.
fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_private_ipv4(v4),
        IpAddr::V6(v6) => is_private_ipv6(v6),
    }
}

fn is_private_ipv4(ip: &Ipv4Addr) -> bool {
    let [a, b, c, _] = ip.octets();
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_broadcast()
        || ip.is_unspecified()
        || ip.is_multicast()
        || ip.is_documentation()
        // Shared address space: 100.64.0.0/10
        || (a == 100 && (64..=127).contains(&b))
        // "This network": 0.0.0.0/8
        || a == 0
        // IETF protocol assignments: 192.0.0.0/24
        || (a == 192 && b == 0 && c == 0)
        // Benchmarking: 198.18.0.0/15
        || (a == 198 && (b == 18 || b == 19))
        // Reserved: 240.0.0.0/4
        || a >= 240
}

fn is_private_ipv6(ip: &Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_private_ipv4(&v4);
    }
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        || ip.is_multicast()
        // Unique local: fc00::/7
        || (first & 0xfe00) == 0xfc00
        // Link-local: fe80::/10
        || (first & 0xffc0) == 0xfe80
        // Documentation: 2001:db8::/32
        || (first == 0x2001 && ip.segments()[1] == 0x0db8)
}

/// Parse feed bytes into a ParsedFeed.
///
/// Text fields are kept raw; sanitizing is the caller's job.
pub fn parse_feed(bytes: &[u8]) -> Result<ParsedFeed> {
    let feed = parser::parse(bytes)
        .map_err(|e| TributaryError::Fetch(format!("failed to parse feed: {e}")))?;

    let title = feed.title.map(|t| t.content);
    let description = feed.description.map(|d| d.content);

    let items = feed
        .entries
        .into_iter()
        .map(|entry| {
            let guid = Some(entry.id).filter(|id| !id.trim().is_empty());
            let link = entry
                .links
                .iter()
                .find(|l| l.rel.as_deref().map_or(true, |r| r == "alternate"))
                .or(entry.links.first())
                .map(|l| l.href.clone())
                // RSS permalink guids double as links
                .or_else(|| {
                    guid.clone()
                        .filter(|g| g.starts_with("http://") || g.starts_with("https://"))
                });

            ParsedItem {
                guid,
                title: entry.title.map(|t| t.content),
                link,
                summary: entry.summary.map(|s| s.content),
                content: entry.content.and_then(|c| c.body),
                published_at: entry.published.or(entry.updated),
            }
        })
        .collect();

    Ok(ParsedFeed {
        title,
        description,
        items,
    })
}
