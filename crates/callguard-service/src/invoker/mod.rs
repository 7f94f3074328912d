//! Performing single network round trips.

use bytes::Bytes;
use futures::future::BoxFuture;

use crate::endpoint::Endpoint;
use crate::error::InvokeError;

mod http;

pub use self::http::{HttpInvoker, Timeouts, USER_AGENT, create_client};

/// Performs exactly one network call for an [`Endpoint`].
///
/// Invokers never retry, and never look at the endpoint's options. Timeouts are their own
/// responsibility and are reported as [`InvokeError::Timeout`].
pub trait Invoker: Send + Sync {
    fn execute<'a>(&'a self, endpoint: &'a Endpoint) -> BoxFuture<'a, Result<Bytes, InvokeError>>;
}
