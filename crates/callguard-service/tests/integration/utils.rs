use std::sync::Arc;

use callguard_service::CallAdapter;
use callguard_service::clock::SystemClock;
use callguard_service::config::Config;
use callguard_service::invoker::HttpInvoker;
use callguard_service::retry::Backoff;
use callguard_test as test;

pub use test::{HitCounter, TempDir};

/// Setup tests and create an adapter calling out over HTTP.
///
/// This function returns a tuple containing the adapter to test, and a temporary cache
/// directory. The directory is cleaned up when the [`TempDir`] instance is dropped. Keep it as
/// guard until the test has finished.
///
/// Retries happen without backoff. The `update_config` closure can modify any default
/// configuration if needed before the adapter is created.
pub fn setup_adapter(update_config: impl FnOnce(&mut Config)) -> (CallAdapter, TempDir) {
    test::setup();

    let cache_dir = test::tempdir();

    let mut config = Config {
        cache_dir: Some(cache_dir.path().to_owned()),
        ..Default::default()
    };
    config.retry.backoff = Backoff::none();
    update_config(&mut config);

    let adapter = adapter_from_config(&config);
    (adapter, cache_dir)
}

/// Creates an adapter for `config`, with its own HTTP client and the system clock.
pub fn adapter_from_config(config: &Config) -> CallAdapter {
    let invoker = HttpInvoker::from_timeouts(config.timeouts).unwrap();
    CallAdapter::from_config(config, Arc::new(invoker), Arc::new(SystemClock::default())).unwrap()
}
