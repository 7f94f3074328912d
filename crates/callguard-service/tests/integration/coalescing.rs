use std::time::Duration;

use callguard_service::{Endpoint, ResponseSource};
use futures::future::join_all;

use crate::{HitCounter, setup_adapter};

#[tokio::test]
async fn test_burst_makes_one_request() {
    let (adapter, _cache_dir) = setup_adapter(|_| {});
    let server = HitCounter::new();

    let endpoint = Endpoint::get("hello", server.url("/delay/200ms/hello"))
        .with_cache(Duration::from_secs(1), Duration::from_secs(60));

    let responses = join_all((0..10).map(|_| adapter.call(&endpoint))).await;

    let mut sources = Vec::new();
    for response in responses {
        let response = response.unwrap();
        assert_eq!(response.body, "hello");
        sources.push(response.source);
    }
    assert_eq!(server.accesses(), 1);
    assert_eq!(
        sources
            .iter()
            .filter(|source| **source == ResponseSource::Network)
            .count(),
        1
    );

    let response = adapter.call(&endpoint).await.unwrap();
    assert_eq!(response.source, ResponseSource::Cache);
    assert_eq!(server.accesses(), 0);
}

#[tokio::test]
async fn test_concurrent_failures_are_shared() {
    let (adapter, _cache_dir) = setup_adapter(|_| {});
    let server = HitCounter::new();

    let endpoint = Endpoint::get("broken", server.url("/respond_statuscode/500/broken"))
        .with_cache(Duration::from_secs(60), Duration::from_secs(60));

    let results = join_all((0..5).map(|_| adapter.call(&endpoint))).await;
    for result in results {
        assert_eq!(result, Err(callguard_service::CallError::Server(500)));
    }
    assert_eq!(server.accesses(), 1);
}

#[tokio::test]
async fn test_distinct_endpoints_are_not_coalesced() {
    let (adapter, _cache_dir) = setup_adapter(|_| {});
    let server = HitCounter::new();

    let hot = Endpoint::get("hot", server.url("/delay/100ms/hot"))
        .with_cache(Duration::from_secs(1), Duration::from_secs(60));
    let new = Endpoint::get("new", server.url("/delay/100ms/new"))
        .with_cache(Duration::from_secs(1), Duration::from_secs(60));

    let (hot, new) = futures::join!(adapter.call(&hot), adapter.call(&new));
    assert_eq!(hot.unwrap().body, "hot");
    assert_eq!(new.unwrap().body, "new");

    let mut hits = server.all_hits();
    hits.sort();
    assert_eq!(
        hits,
        [
            ("/delay/100ms/hot".to_owned(), 1),
            ("/delay/100ms/new".to_owned(), 1)
        ]
    );
}
