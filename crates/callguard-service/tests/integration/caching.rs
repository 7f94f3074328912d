use std::io::Write;
use std::time::Duration;

use callguard_service::config::Config;
use callguard_service::{Endpoint, ResponseSource};
use reqwest::Method;

use crate::{HitCounter, adapter_from_config, setup_adapter};

#[tokio::test]
async fn test_disk_cache_is_shared_across_adapters() {
    callguard_test::setup();
    let cache_dir = callguard_test::tempdir();
    let server = HitCounter::new();

    let config_path = cache_dir.path().join("config.yml");
    let mut file = std::fs::File::create(&config_path).unwrap();
    write!(
        file,
        r#"
cache_dir: {cache_dir}
endpoints:
  hot_posts:
    url: {url}
    cache:
      debounce: 1s
      max_age: 5m
"#,
        cache_dir = cache_dir.path().join("cache").display(),
        url = server.url("/garbage_data/hot"),
    )
    .unwrap();
    drop(file);

    let config = Config::get(Some(&config_path)).unwrap();
    let endpoint = config.endpoint("hot_posts").unwrap();

    let first = adapter_from_config(&config);
    let response = first.call(&endpoint).await.unwrap();
    assert_eq!(response.body, "hot");
    assert_eq!(response.source, ResponseSource::Network);
    drop(first);

    let second = adapter_from_config(&config);
    let response = second.call(&endpoint).await.unwrap();
    assert_eq!(response.body, "hot");
    assert_eq!(response.source, ResponseSource::Cache);

    assert_eq!(server.accesses(), 1);

    let stats = second.store().cleanup(false).unwrap();
    assert_eq!(stats.removed_files, 0);
}

#[tokio::test]
async fn test_unsafe_methods_are_not_cached() {
    let (adapter, _cache_dir) = setup_adapter(|_| {});
    let server = HitCounter::new();

    let mut endpoint = Endpoint::get("vote", server.url("/echo/vote"))
        .with_body("up")
        .with_cache(Duration::from_secs(60), Duration::from_secs(60));
    endpoint.method = Method::POST;

    for _ in 0..2 {
        let response = adapter.call(&endpoint).await.unwrap();
        assert_eq!(response.body, "POST up");
        assert_eq!(response.source, ResponseSource::Network);
    }
    assert_eq!(server.accesses(), 2);
}

#[tokio::test]
async fn test_invalidate_forces_request() {
    let (adapter, _cache_dir) = setup_adapter(|_| {});
    let server = HitCounter::new();

    let endpoint = Endpoint::get("hot", server.url("/garbage_data/hot"))
        .with_cache(Duration::ZERO, Duration::from_secs(60));

    adapter.call(&endpoint).await.unwrap();
    assert!(adapter.call(&endpoint).await.unwrap().is_cached());
    assert_eq!(server.accesses(), 1);

    adapter.invalidate(&endpoint);
    let response = adapter.call(&endpoint).await.unwrap();
    assert_eq!(response.source, ResponseSource::Network);
    assert_eq!(server.accesses(), 1);
}
