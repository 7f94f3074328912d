use std::time::Duration;

use thiserror::Error;

/// The failure of a single network round trip, as reported by an [`Invoker`](crate::invoker::Invoker).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvokeError {
    /// The request could not be sent or the response could not be read.
    #[error("transport failure: {0}")]
    Transport(String),
    /// The invoker gave up waiting for the response.
    #[error("request timed out after {}", humantime::format_duration(*.0))]
    Timeout(Duration),
    /// The server answered with a non-success status.
    #[error("server responded with status {0}")]
    Status(u16),
    /// The request could not be built, for instance because of a malformed header.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl From<reqwest::Error> for InvokeError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Self::Status(status.as_u16());
        }

        let message = error_chain(&err);
        if err.is_builder() {
            Self::InvalidRequest(message)
        } else {
            Self::Transport(message)
        }
    }
}

fn error_chain(err: &reqwest::Error) -> String {
    let mut source = std::error::Error::source(err);
    let mut message = err.to_string();
    while let Some(err) = source {
        message.push_str(": ");
        message.push_str(&err.to_string());
        source = err.source();
    }
    message
}

/// The broad class of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Connection, DNS, TLS or timeout problems. Retryable.
    Transport,
    /// A response with a retryable status, such as `503`.
    Server,
    /// A response with any other non-success status, or a request that could not be sent as
    /// given. Never retried.
    Client,
    /// The persistent cache could not be read or written. Never surfaced to callers.
    Cache,
    /// A follower gave up waiting on its lead.
    DebounceTimeout,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Transport => "transport",
            FailureKind::Server => "server",
            FailureKind::Client => "client",
            FailureKind::Cache => "cache",
            FailureKind::DebounceTimeout => "debounce_timeout",
        }
    }
}

/// The error a caller of [`CallAdapter`](crate::adapter::CallAdapter) sees.
///
/// Only the last failure of a retried call is reported. Followers of a coalesced call see the
/// very same error as the lead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("request timed out after {}", humantime::format_duration(*.0))]
    Timeout(Duration),
    #[error("server failure with status {0}")]
    Server(u16),
    #[error("client failure with status {0}")]
    Client(u16),
    /// The request was rejected before it was sent. Never retried.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// The in-flight call this caller joined did not finish in time.
    #[error("gave up waiting for in-flight call after {}", humantime::format_duration(*.0))]
    DebounceTimeout(Duration),
    /// The in-flight call this caller joined went away without an outcome.
    #[error("in-flight call was abandoned")]
    Abandoned,
    /// The caller cancelled its own wait.
    #[error("call was cancelled")]
    Cancelled,
}

impl CallError {
    pub fn kind(&self) -> FailureKind {
        match self {
            CallError::Transport(_) | CallError::Timeout(_) | CallError::Abandoned => {
                FailureKind::Transport
            }
            CallError::Server(_) => FailureKind::Server,
            CallError::Client(_) | CallError::InvalidRequest(_) | CallError::Cancelled => {
                FailureKind::Client
            }
            CallError::DebounceTimeout(_) => FailureKind::DebounceTimeout,
        }
    }
}
