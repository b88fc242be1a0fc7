//! Canonical URL normalization.
//!
//! The canonical form is the dedup key for feeds, items and inline images:
//! lower-cased host, default port dropped, query parameters sorted, empty
//! query and trailing slash removed.

use url::Url;

use crate::{Result, TributaryError};

/// Normalize a URL into its canonical string form.
///
/// Only `http` and `https` URLs are accepted.
pub fn canonicalize_url(raw: &str) -> Result<String> {
    let url = Url::parse(raw.trim())
        .map_err(|e| TributaryError::Validation(format!("invalid URL '{raw}': {e}")))?;
    canonicalize(url)
}

/// Normalize an already parsed URL.
pub fn canonicalize(mut url: Url) -> Result<String> {
    match url.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(TributaryError::Validation(format!(
                "unsupported URL scheme: {scheme}"
            )))
        }
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(TributaryError::Validation("URL has no host".into()));
    }

    let mut pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
    if pairs.is_empty() {
        url.set_query(None);
    } else {
        pairs.sort();
        url.query_pairs_mut().clear().extend_pairs(pairs);
    }

    let path = url.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        let trimmed = path.trim_end_matches('/');
        url.set_path(if trimmed.is_empty() { "/" } else { trimmed });
    }

    let mut canonical = url.to_string();
    if url.path() == "/" && url.query().is_none() && url.fragment().is_none() {
        canonical.pop();
    }
    Ok(canonical)
}

/// Resolve a possibly relative reference against a base URL.
///
/// Returns `None` when the reference cannot be turned into an absolute URL.
pub fn resolve_url(href: &str, base: Option<&Url>) -> Option<Url> {
    let href = href.trim();
    if href.is_empty() {
        return None;
    }
    match Url::parse(href) {
        Ok(url) => Some(url),
        Err(url::ParseError::RelativeUrlWithoutBase) => base.and_then(|b| b.join(href).ok()),
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonicalize_lowercases_host() {
        assert_eq!(
            canonicalize_url("https://Example.COM/Path").unwrap(),
            "https://example.com/Path"
        );
    }

    #[test]
    fn test_canonicalize_strips_trailing_slash() {
        assert_eq!(
            canonicalize_url("https://example.com/blog/").unwrap(),
            "https://example.com/blog"
        );
        assert_eq!(
            canonicalize_url("https://example.com/").unwrap(),
            "https://example.com"
        );
        assert_eq!(
            canonicalize_url("https://example.com").unwrap(),
            "https://example.com"
        );
    }

    #[test]
    fn test_canonicalize_strips_empty_query() {
        assert_eq!(
            canonicalize_url("https://example.com/a?").unwrap(),
            "https://example.com/a"
        );
        assert_eq!(
            canonicalize_url("https://example.com/?").unwrap(),
            "https://example.com"
        );
    }

    #[test]
    fn test_canonicalize_sorts_query() {
        assert_eq!(
            canonicalize_url("https://example.com/a?b=2&a=1").unwrap(),
            "https://example.com/a?a=1&b=2"
        );
        assert_eq!(
            canonicalize_url("https://example.com/a?a=1&b=2").unwrap(),
            canonicalize_url("https://EXAMPLE.com/a/?b=2&a=1").unwrap()
        );
    }

    #[test]
    fn test_canonicalize_drops_default_port() {
        assert_eq!(
            canonicalize_url("https://example.com:443/feed").unwrap(),
            "https://example.com/feed"
        );
        assert_eq!(
            canonicalize_url("http://example.com:8080/feed").unwrap(),
            "http://example.com:8080/feed"
        );
    }

    #[test]
    fn test_canonicalize_keeps_fragment() {
        assert_eq!(
            canonicalize_url("https://example.com/post#comments").unwrap(),
            "https://example.com/post#comments"
        );
    }

    #[test]
    fn test_canonicalize_rejects_invalid() {
        assert!(matches!(
            canonicalize_url("not a url"),
            Err(TributaryError::Validation(_))
        ));
        assert!(canonicalize_url("ftp://example.com/file").is_err());
        assert!(canonicalize_url("mailto:someone@example.com").is_err());
    }

    #[test]
    fn test_canonicalize_is_idempotent() {
        let once = canonicalize_url("https://Example.com/x/?z=1&y=2").unwrap();
        assert_eq!(canonicalize_url(&once).unwrap(), once);
    }

    #[test]
    fn test_resolve_url() {
        let base = Url::parse("https://example.com/blog/feed.xml").unwrap();

        assert_eq!(
            resolve_url("/posts/1", Some(&base)).unwrap().as_str(),
            "https://example.com/posts/1"
        );
        assert_eq!(
            resolve_url("post-2", Some(&base)).unwrap().as_str(),
            "https://example.com/blog/post-2"
        );
        assert_eq!(
            resolve_url("https://other.example/x", Some(&base))
                .unwrap()
                .as_str(),
            "https://other.example/x"
        );
        assert!(resolve_url("/posts/1", None).is_none());
        assert!(resolve_url("   ", Some(&base)).is_none());
    }
}
