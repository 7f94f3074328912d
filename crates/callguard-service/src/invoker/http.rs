use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use futures::future::BoxFuture;
use reqwest::{Client, header};
use serde::Deserialize;

use crate::endpoint::Endpoint;
use crate::error::InvokeError;

use super::Invoker;

/// The `User-Agent` sent with every request.
pub const USER_AGENT: &str = concat!("callguard/", env!("CARGO_PKG_VERSION"));

/// Timeouts of the HTTP client.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// The timeout for establishing a connection.
    #[serde(with = "humantime_serde")]
    pub connect: Duration,
    /// Global timeout for one request, including reading the response body.
    #[serde(with = "humantime_serde")]
    pub request: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(5),
            request: Duration::from_secs(30),
        }
    }
}

impl Timeouts {
    /// The timeout that ran out, depending on whether the connection was still being made.
    pub fn expired(&self, connecting: bool) -> Duration {
        if connecting {
            self.connect
        } else {
            self.request
        }
    }
}

/// Creates a [`reqwest::Client`] with the provided timeouts.
pub fn create_client(timeouts: &Timeouts) -> reqwest::Result<Client> {
    reqwest::ClientBuilder::new()
        .gzip(true)
        .brotli(true)
        .deflate(true)
        .connect_timeout(timeouts.connect)
        .timeout(timeouts.request)
        .pool_idle_timeout(Duration::from_secs(30))
        .build()
}

/// [`Invoker`] implementation on top of a [`reqwest::Client`].
#[derive(Debug, Clone)]
pub struct HttpInvoker {
    client: Client,
    timeouts: Timeouts,
}

impl HttpInvoker {
    pub fn new(client: Client, timeouts: Timeouts) -> Self {
        Self { client, timeouts }
    }

    /// Creates an invoker with its own client.
    pub fn from_timeouts(timeouts: Timeouts) -> reqwest::Result<Self> {
        Ok(Self::new(create_client(&timeouts)?, timeouts))
    }

    async fn send(&self, endpoint: &Endpoint) -> Result<Bytes, InvokeError> {
        tracing::debug!("Calling `{}` at `{}`", endpoint.name, endpoint.url);

        let mut builder = self
            .client
            .request(endpoint.method.clone(), endpoint.url.clone());
        for (key, value) in &endpoint.headers {
            let name = header::HeaderName::from_bytes(key.as_bytes()).map_err(|_| {
                InvokeError::InvalidRequest(format!("invalid header name `{key}`"))
            })?;
            builder = builder.header(name, value.as_str());
        }
        builder = builder.header(header::USER_AGENT, USER_AGENT);
        if let Some(body) = &endpoint.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await.map_err(|e| self.map_error(e))?;
        let status = response.status();
        if !status.is_success() {
            tracing::debug!(
                "Unexpected status code from `{}`: {}",
                endpoint.url,
                status
            );
            return Err(InvokeError::Status(status.as_u16()));
        }

        response.bytes().await.map_err(|e| self.map_error(e))
    }

    fn map_error(&self, error: reqwest::Error) -> InvokeError {
        if error.is_timeout() {
            InvokeError::Timeout(self.timeouts.expired(error.is_connect()))
        } else {
            error.into()
        }
    }
}

impl Invoker for HttpInvoker {
    fn execute<'a>(&'a self, endpoint: &'a Endpoint) -> BoxFuture<'a, Result<Bytes, InvokeError>> {
        self.send(endpoint).boxed()
    }
}

#[cfg(test)]
mod tests {
    use reqwest::Method;

    use super::*;

    fn invoker(timeouts: Timeouts) -> HttpInvoker {
        HttpInvoker::from_timeouts(timeouts).unwrap()
    }

    #[tokio::test]
    async fn test_success() {
        callguard_test::setup();
        let server = callguard_test::HitCounter::new();

        let endpoint = Endpoint::get("garbage", server.url("garbage_data/hello"));
        let body = invoker(Timeouts::default()).execute(&endpoint).await;

        assert_eq!(body.unwrap(), "hello");
        assert_eq!(server.accesses(), 1);
    }

    #[tokio::test]
    async fn test_status() {
        callguard_test::setup();
        let server = callguard_test::HitCounter::new();
        let invoker = invoker(Timeouts::default());

        let endpoint = Endpoint::get("down", server.url("respond_statuscode/503/x"));
        assert_eq!(
            invoker.execute(&endpoint).await,
            Err(InvokeError::Status(503))
        );

        let endpoint = Endpoint::get("missing", server.url("respond_statuscode/404/x"));
        assert_eq!(
            invoker.execute(&endpoint).await,
            Err(InvokeError::Status(404))
        );
    }

    #[tokio::test]
    async fn test_request_details() {
        callguard_test::setup();
        let server = callguard_test::HitCounter::new();
        let invoker = invoker(Timeouts::default());

        let mut endpoint = Endpoint::get("echo", server.url("echo/x")).with_body("payload");
        endpoint.method = Method::POST;
        assert_eq!(invoker.execute(&endpoint).await.unwrap(), "POST payload");

        let endpoint = Endpoint::get("agent", server.url("header/user-agent"));
        assert_eq!(invoker.execute(&endpoint).await.unwrap(), USER_AGENT);

        let endpoint = Endpoint::get("custom", server.url("header/x-api-key"))
            .with_header("X-Api-Key", "secret");
        assert_eq!(invoker.execute(&endpoint).await.unwrap(), "secret");
    }

    #[tokio::test]
    async fn test_timeout() {
        callguard_test::setup();
        let server = callguard_test::HitCounter::new();
        let timeouts = Timeouts {
            request: Duration::from_millis(100),
            ..Default::default()
        };

        let endpoint = Endpoint::get("slow", server.url("delay/2s/slow"));
        assert_eq!(
            invoker(timeouts).execute(&endpoint).await,
            Err(InvokeError::Timeout(Duration::from_millis(100)))
        );
    }

    #[test]
    fn test_expired_timeout() {
        let timeouts = Timeouts {
            connect: Duration::from_millis(250),
            request: Duration::from_secs(10),
        };
        assert_eq!(timeouts.expired(true), Duration::from_millis(250));
        assert_eq!(timeouts.expired(false), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_invalid_headers() {
        callguard_test::setup();
        let server = callguard_test::HitCounter::new();
        let invoker = invoker(Timeouts::default());

        let endpoint = Endpoint::get("bad value", server.url("header/x-api-key"))
            .with_header("X-Api-Key", "line\nbreak");
        let result = invoker.execute(&endpoint).await;
        assert!(matches!(result, Err(InvokeError::InvalidRequest(_))), "{result:?}");

        let endpoint = Endpoint::get("bad name", server.url("header/x-api-key"))
            .with_header("X Api Key", "secret");
        insta::assert_snapshot!(
            invoker.execute(&endpoint).await.unwrap_err(),
            @"invalid request: invalid header name `X Api Key`"
        );

        assert_eq!(server.accesses(), 0);
    }

    #[tokio::test]
    async fn test_connection_refused() {
        callguard_test::setup();

        let endpoint = Endpoint::get("refused", callguard_test::refused_url());
        let result = invoker(Timeouts::default()).execute(&endpoint).await;

        assert!(matches!(result, Err(InvokeError::Transport(_))), "{result:?}");
    }
}
