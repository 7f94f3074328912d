//! Declared endpoints and their per-call options.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use reqwest::Method;
use serde::Deserialize;
use url::Url;

/// How often a failed call may be retried.
///
/// `max_attempts` counts retries, so a call is made at most `max_attempts + 1` times. Zero
/// means the call is made exactly once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct RetrySpec {
    pub max_attempts: u32,
}

impl RetrySpec {
    pub fn new(max_attempts: u32) -> Self {
        Self { max_attempts }
    }
}

/// Caching and debouncing windows of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheSpec {
    /// How long a completed outcome is shared with new callers of the same key.
    #[serde(with = "humantime_serde")]
    pub debounce: Duration,
    /// How long a successful response stays fresh in the cache.
    #[serde(with = "humantime_serde")]
    pub max_age: Duration,
}

impl CacheSpec {
    pub fn new(debounce: Duration, max_age: Duration) -> Self {
        Self { debounce, max_age }
    }
}

impl Default for CacheSpec {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(2),
            max_age: Duration::from_secs(5 * 60),
        }
    }
}

/// The options declared alongside an endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndpointOptions {
    pub retry: Option<RetrySpec>,
    pub cache: Option<CacheSpec>,
}

/// A fully resolved outgoing call.
#[derive(Debug, Clone)]
pub struct Endpoint {
    /// The name this endpoint was declared under.
    pub name: String,
    pub method: Method,
    pub url: Url,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Bytes>,
    pub options: EndpointOptions,
}

impl Endpoint {
    pub fn new(name: impl Into<String>, method: Method, url: Url) -> Self {
        Self {
            name: name.into(),
            method,
            url,
            headers: BTreeMap::new(),
            body: None,
            options: EndpointOptions::default(),
        }
    }

    /// Shorthand for a `GET` endpoint.
    pub fn get(name: impl Into<String>, url: Url) -> Self {
        Self::new(name, Method::GET, url)
    }

    pub fn with_retry(mut self, max_attempts: u32) -> Self {
        self.options.retry = Some(RetrySpec::new(max_attempts));
        self
    }

    pub fn with_cache(mut self, debounce: Duration, max_age: Duration) -> Self {
        self.options.cache = Some(CacheSpec::new(debounce, max_age));
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Appends query parameters to the URL.
    ///
    /// Parameters become part of the URL and thus take part in key derivation.
    pub fn with_query<I, K, V>(mut self, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut pairs = pairs.into_iter().peekable();
        if pairs.peek().is_some() {
            self.url.query_pairs_mut().extend_pairs(pairs);
        }
        self
    }

    /// Number of retries allowed after the first attempt.
    pub fn max_retries(&self) -> u32 {
        self.options.retry.map_or(0, |retry| retry.max_attempts)
    }

    /// The cache windows, if this call takes part in caching at all.
    ///
    /// Only safe methods are cached; anything else always goes to the network.
    pub fn cache_spec(&self) -> Option<CacheSpec> {
        if self.method == Method::GET || self.method == Method::HEAD {
            self.options.cache
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_with_query() {
        let endpoint = Endpoint::get("posts", url("https://example.com/posts?sort=new"))
            .with_query([("after", "t3_abc"), ("limit", "25")]);
        assert_eq!(
            endpoint.url.as_str(),
            "https://example.com/posts?sort=new&after=t3_abc&limit=25"
        );

        let endpoint = Endpoint::get("posts", url("https://example.com/posts"))
            .with_query(std::iter::empty::<(&str, &str)>());
        assert_eq!(endpoint.url.as_str(), "https://example.com/posts");
    }

    #[test]
    fn test_only_safe_methods_are_cached() {
        let cache = CacheSpec::default();
        let get = Endpoint::get("a", url("https://example.com/"))
            .with_cache(cache.debounce, cache.max_age);
        assert_eq!(get.cache_spec(), Some(cache));

        let mut post = get.clone();
        post.method = Method::POST;
        assert_eq!(post.cache_spec(), None);

        let plain = Endpoint::get("b", url("https://example.com/"));
        assert_eq!(plain.cache_spec(), None);
    }

    #[test]
    fn test_max_retries() {
        let endpoint = Endpoint::get("a", url("https://example.com/"));
        assert_eq!(endpoint.max_retries(), 0);
        assert_eq!(endpoint.with_retry(5).max_retries(), 5);
    }
}
