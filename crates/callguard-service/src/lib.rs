#[macro_use]
pub mod metrics;

pub mod adapter;
pub mod caching;
pub mod clock;
pub mod config;
pub mod debounce;
pub mod endpoint;
pub mod error;
pub mod invoker;
pub mod key;
pub mod logging;
pub mod retry;
pub mod utils;

pub use adapter::{CallAdapter, Response, ResponseSource};
pub use endpoint::{CacheSpec, Endpoint, EndpointOptions, RetrySpec};
pub use error::{CallError, FailureKind, InvokeError};
