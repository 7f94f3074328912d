//! The entry point for outgoing calls.
//!
//! [`CallAdapter::call`] composes the [`CacheStore`], the [`DebounceGate`] and the
//! [`RetryPolicy`] around an [`Invoker`]:
//!
//! 1. Cacheable calls with a fresh cache entry are answered from the cache.
//! 2. Otherwise the caller is admitted by the gate. Followers wait for the lead's outcome and
//!    never retry on their own.
//! 3. The lead drives the invoker through the retry policy. The lead's work runs in its own
//!    task, so callers going away never strand followers.
//! 4. Successful responses are cached before the outcome is handed to the followers. Failures
//!    are handed over but never cached.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::caching::CacheStore;
use crate::clock::Clock;
use crate::config::Config;
use crate::debounce::{Admission, DebounceGate, LeadGuard};
use crate::endpoint::{CacheSpec, Endpoint};
use crate::error::CallError;
use crate::invoker::Invoker;
use crate::key::{EndpointKey, KeyDeriver, RequestKeyDeriver};
use crate::retry::RetryPolicy;

/// Where the body of a [`Response`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseSource {
    /// This caller performed the network call.
    Network,
    /// A fresh cache entry was served.
    Cache,
    /// Another caller's in-flight or just completed call was joined.
    Coalesced,
}

impl ResponseSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseSource::Network => "network",
            ResponseSource::Cache => "cache",
            ResponseSource::Coalesced => "coalesced",
        }
    }
}

/// A successful call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub body: Bytes,
    pub source: ResponseSource,
}

impl Response {
    /// Whether the body was served without a network call of this caller.
    pub fn is_cached(&self) -> bool {
        self.source != ResponseSource::Network
    }
}

struct AdapterInner {
    invoker: Arc<dyn Invoker>,
    keys: Arc<dyn KeyDeriver>,
    store: CacheStore,
    gate: Arc<DebounceGate>,
    retry: RetryPolicy,
    follower_timeout: Duration,
    debounce_failures: bool,
}

/// Wraps outgoing calls with caching, debouncing and retries.
///
/// Cloning is cheap and clones share all state.
#[derive(Clone)]
pub struct CallAdapter {
    inner: Arc<AdapterInner>,
}

impl std::fmt::Debug for CallAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallAdapter")
            .field("store", &self.inner.store)
            .field("retry", &self.inner.retry)
            .field("follower_timeout", &self.inner.follower_timeout)
            .field("debounce_failures", &self.inner.debounce_failures)
            .finish_non_exhaustive()
    }
}

impl CallAdapter {
    /// Creates an adapter with default retry policy and key derivation.
    pub fn new(invoker: Arc<dyn Invoker>, store: CacheStore, clock: Arc<dyn Clock>) -> Self {
        Self::builder(invoker, store, clock).build()
    }

    pub fn builder(
        invoker: Arc<dyn Invoker>,
        store: CacheStore,
        clock: Arc<dyn Clock>,
    ) -> CallAdapterBuilder {
        CallAdapterBuilder {
            invoker,
            keys: Arc::new(RequestKeyDeriver),
            store,
            gate: Arc::new(DebounceGate::new(clock)),
            retry: RetryPolicy::default(),
            follower_timeout: Duration::from_secs(30),
            debounce_failures: true,
        }
    }

    /// Creates an adapter as configured, opening the disk cache if a `cache_dir` is set.
    pub fn from_config(
        config: &Config,
        invoker: Arc<dyn Invoker>,
        clock: Arc<dyn Clock>,
    ) -> std::io::Result<Self> {
        let store = CacheStore::from_config(config, clock.clone())?;
        Ok(Self::builder(invoker, store, clock)
            .retry_policy(RetryPolicy::from_config(&config.retry))
            .follower_timeout(config.caches.follower_timeout)
            .debounce_failures(config.caches.debounce_failures)
            .build())
    }

    pub fn store(&self) -> &CacheStore {
        &self.inner.store
    }

    pub fn gate(&self) -> &DebounceGate {
        &self.inner.gate
    }

    /// Performs `endpoint`, honoring its cache and retry options.
    #[tracing::instrument(skip_all, fields(endpoint = %endpoint.name))]
    pub async fn call(&self, endpoint: &Endpoint) -> Result<Response, CallError> {
        let start = Instant::now();
        let result = self.call_inner(endpoint).await;

        let (outcome, source) = match &result {
            Ok(response) => ("ok", response.source.as_str()),
            Err(error) => (error.kind().as_str(), "none"),
        };
        metric!(
            timer("calls.duration") = start.elapsed(),
            "endpoint" => &endpoint.name,
            "outcome" => outcome,
            "source" => source,
        );

        result
    }

    /// Like [`call`](Self::call), but gives up with [`CallError::Cancelled`] once `token` is
    /// cancelled.
    ///
    /// Cancelling never aborts a network call other callers may be waiting for.
    pub async fn call_cancellable(
        &self,
        endpoint: &Endpoint,
        token: &CancellationToken,
    ) -> Result<Response, CallError> {
        tokio::select! {
            result = self.call(endpoint) => result,
            _ = token.cancelled() => {
                tracing::debug!(endpoint = %endpoint.name, "Call was cancelled");
                Err(CallError::Cancelled)
            }
        }
    }

    /// Drops any cached response of `endpoint`.
    pub fn invalidate(&self, endpoint: &Endpoint) {
        let key = self.inner.keys.derive(endpoint);
        self.inner.store.invalidate(&key);
    }

    async fn call_inner(&self, endpoint: &Endpoint) -> Result<Response, CallError> {
        let Some(cache) = endpoint.cache_spec() else {
            let body = self.inner.execute(endpoint).await?;
            return Ok(Response {
                body,
                source: ResponseSource::Network,
            });
        };

        let key = self.inner.keys.derive(endpoint);
        if let Some(entry) = self.inner.store.get(&key) {
            tracing::debug!(%key, "Serving response from cache");
            return Ok(Response {
                body: entry.value,
                source: ResponseSource::Cache,
            });
        }

        match self.inner.gate.begin(&key, cache.debounce) {
            Admission::Follow(follower) => {
                tracing::debug!(%key, "Joining call of another caller");
                let body = follower.wait(self.inner.follower_timeout).await?;
                Ok(Response {
                    body,
                    source: ResponseSource::Coalesced,
                })
            }
            Admission::Lead(guard) => {
                let inner = Arc::clone(&self.inner);
                let endpoint = endpoint.clone();
                let lead =
                    tokio::spawn(async move { inner.lead(&endpoint, key, cache, guard).await });

                match lead.await {
                    Ok(result) => result,
                    Err(error) => {
                        tracing::error!(
                            error = &error as &dyn std::error::Error,
                            "Lead call failed to complete"
                        );
                        Err(CallError::Abandoned)
                    }
                }
            }
        }
    }
}

impl AdapterInner {
    /// Performs the call through the retry policy, without touching cache or gate.
    async fn execute(&self, endpoint: &Endpoint) -> Result<Bytes, CallError> {
        self.retry
            .run(endpoint.max_retries(), |attempt| {
                tracing::trace!(attempt, "Invoking `{}`", endpoint.name);
                metric!(counter("calls.invoked") += 1, "endpoint" => &endpoint.name);
                self.invoker.execute(endpoint)
            })
            .await
    }

    /// The work of the lead: call, cache and hand the outcome to the followers.
    async fn lead(
        &self,
        endpoint: &Endpoint,
        key: EndpointKey,
        cache: CacheSpec,
        guard: LeadGuard,
    ) -> Result<Response, CallError> {
        // another lead may have finished between our cache lookup and admission
        if let Some(entry) = self.store.get(&key) {
            guard.complete(Ok(entry.value.clone()));
            return Ok(Response {
                body: entry.value,
                source: ResponseSource::Cache,
            });
        }

        match self.execute(endpoint).await {
            Ok(body) => {
                self.store.put(&key, body.clone(), cache.max_age);
                guard.complete(Ok(body.clone()));
                Ok(Response {
                    body,
                    source: ResponseSource::Network,
                })
            }
            Err(error) => {
                tracing::debug!(%key, error = %error, "Call failed");
                if self.debounce_failures {
                    guard.complete(Err(error.clone()));
                } else {
                    guard.complete_bypassing_window(Err(error.clone()));
                }
                Err(error)
            }
        }
    }
}

/// Configures a [`CallAdapter`].
pub struct CallAdapterBuilder {
    invoker: Arc<dyn Invoker>,
    keys: Arc<dyn KeyDeriver>,
    store: CacheStore,
    gate: Arc<DebounceGate>,
    retry: RetryPolicy,
    follower_timeout: Duration,
    debounce_failures: bool,
}

impl CallAdapterBuilder {
    pub fn key_deriver(mut self, keys: Arc<dyn KeyDeriver>) -> Self {
        self.keys = keys;
        self
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// How long followers wait for their lead before giving up.
    pub fn follower_timeout(mut self, timeout: Duration) -> Self {
        self.follower_timeout = timeout;
        self
    }

    /// Whether failures are shared with callers arriving during the debounce window.
    pub fn debounce_failures(mut self, debounce: bool) -> Self {
        self.debounce_failures = debounce;
        self
    }

    pub fn build(self) -> CallAdapter {
        CallAdapter {
            inner: Arc::new(AdapterInner {
                invoker: self.invoker,
                keys: self.keys,
                store: self.store,
                gate: self.gate,
                retry: self.retry,
                follower_timeout: self.follower_timeout,
                debounce_failures: self.debounce_failures,
            }),
        }
    }
}
