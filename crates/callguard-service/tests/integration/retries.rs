use std::time::Duration;

use callguard_service::{CallError, Endpoint, ResponseSource};

use crate::{HitCounter, setup_adapter};

#[tokio::test]
async fn test_flaky_endpoint_recovers() {
    let (adapter, _cache_dir) = setup_adapter(|_| {});
    let server = HitCounter::new();

    let endpoint = Endpoint::get("flaky", server.url("/flaky/2/ok")).with_retry(3);
    let response = adapter.call(&endpoint).await.unwrap();

    assert_eq!(response.body, "ok");
    assert_eq!(response.source, ResponseSource::Network);
    assert_eq!(server.accesses(), 3);
}

#[tokio::test]
async fn test_retries_exhausted() {
    let (adapter, _cache_dir) = setup_adapter(|_| {});
    let server = HitCounter::new();

    let endpoint = Endpoint::get("down", server.url("/respond_statuscode/503/down")).with_retry(2);
    let result = adapter.call(&endpoint).await;

    assert_eq!(result, Err(CallError::Server(503)));
    assert_eq!(server.accesses(), 3);
}

#[tokio::test]
async fn test_client_errors_are_final() {
    let (adapter, _cache_dir) = setup_adapter(|_| {});
    let server = HitCounter::new();

    let endpoint =
        Endpoint::get("missing", server.url("/respond_statuscode/404/missing")).with_retry(3);
    let result = adapter.call(&endpoint).await;

    assert_eq!(result, Err(CallError::Client(404)));
    assert_eq!(server.accesses(), 1);
}

#[tokio::test]
async fn test_malformed_requests_are_final() {
    let (adapter, _cache_dir) = setup_adapter(|_| {});
    let server = HitCounter::new();

    let endpoint = Endpoint::get("malformed", server.url("/header/x-api-key"))
        .with_header("X-Api-Key", "line\nbreak")
        .with_retry(5);
    let result = adapter.call(&endpoint).await;

    assert!(matches!(result, Err(CallError::InvalidRequest(_))), "{result:?}");
    assert_eq!(server.accesses(), 0);
}

#[tokio::test]
async fn test_request_timeout_is_retried() {
    let (adapter, _cache_dir) = setup_adapter(|config| {
        config.timeouts.request = Duration::from_millis(100);
    });
    let server = HitCounter::new();

    let endpoint = Endpoint::get("pending", server.url("/delay/1h/pending")).with_retry(1);
    let result = adapter.call(&endpoint).await;

    assert_eq!(result, Err(CallError::Timeout(Duration::from_millis(100))));
    assert_eq!(server.accesses(), 2);
}

#[tokio::test]
async fn test_connection_refused() {
    let (adapter, _cache_dir) = setup_adapter(|_| {});

    let endpoint = Endpoint::get("nowhere", callguard_test::refused_url()).with_retry(1);
    let error = adapter.call(&endpoint).await.unwrap_err();

    assert!(matches!(error, CallError::Transport(_)), "{error:?}");
}
