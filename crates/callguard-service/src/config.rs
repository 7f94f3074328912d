use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Method;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::endpoint::{CacheSpec, Endpoint, EndpointOptions, RetrySpec};
use crate::invoker::Timeouts;
use crate::retry::Backoff;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "callguard".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Sizing of the response cache and the debounce gate.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of responses kept in memory.
    pub in_memory_capacity: usize,
    /// Maximum number of bytes kept in the cache directory.
    pub disk_capacity: u64,
    /// How long a caller waits for an in-flight call of the same endpoint.
    #[serde(with = "humantime_serde")]
    pub follower_timeout: Duration,
    /// Whether failures are shared with new callers during the debounce window.
    ///
    /// When disabled, only callers that joined while the failed call was in flight receive the
    /// failure, and the next caller starts a new call right away.
    pub debounce_failures: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            in_memory_capacity: 25,
            disk_capacity: 1024 * 1024,
            follower_timeout: Duration::from_secs(30),
            debounce_failures: true,
        }
    }
}

/// Which failures are retried, and how long to wait in between.
#[derive(Debug, Clone, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Response statuses that are worth another attempt.
    pub retryable_statuses: Vec<u16>,
    /// Delays between attempts.
    pub backoff: Backoff,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retryable_statuses: vec![408, 429, 500, 502, 503, 504],
            backoff: Backoff::default(),
        }
    }
}

/// A declared endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    /// The HTTP method, `GET` by default.
    #[serde(default = "default_method", deserialize_with = "deserialize_method")]
    pub method: Method,
    pub url: Url,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Number of retries after the first attempt.
    #[serde(default)]
    pub retry: Option<RetrySpec>,
    /// Cache and debounce windows. Without this, every call goes to the network.
    #[serde(default)]
    pub cache: Option<CacheSpec>,
}

impl EndpointConfig {
    /// Resolves this declaration into an [`Endpoint`] named `name`.
    pub fn to_endpoint(&self, name: &str) -> Endpoint {
        Endpoint {
            name: name.to_owned(),
            method: self.method.clone(),
            url: self.url.clone(),
            headers: self.headers.clone(),
            body: None,
            options: EndpointOptions {
                retry: self.retry,
                cache: self.cache,
            },
        }
    }
}

fn default_method() -> Method {
    Method::GET
}

fn deserialize_method<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Method, D::Error> {
    let method = String::deserialize(deserializer)?;
    Method::from_bytes(method.to_ascii_uppercase().as_bytes()).map_err(de::Error::custom)
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Which directory to persist cached responses in.
    ///
    /// Without a cache directory, responses are only cached in memory.
    pub cache_dir: Option<PathBuf>,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// Sizing of the response cache.
    pub caches: CacheConfig,

    /// Retry behavior shared by all endpoints.
    pub retry: RetryConfig,

    /// Timeouts of the HTTP client.
    pub timeouts: Timeouts,

    /// The declared endpoints, by name.
    pub endpoints: BTreeMap<String, EndpointConfig>,
}

impl Config {
    /// Resolves the endpoint declared as `name`.
    pub fn endpoint(&self, name: &str) -> Result<Endpoint> {
        let endpoint = self
            .endpoints
            .get(name)
            .with_context(|| format!("unknown endpoint `{name}`"))?;
        Ok(endpoint.to_endpoint(name))
    }

    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
