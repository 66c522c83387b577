mod support;

use std::time::SystemTime;

use courier::{Cache, Client, Protocol, Request};
use support::*;

fn cached_client(script: &Script) -> (Client, Cache) {
    let cache = Cache::in_memory();
    let client = Client::builder()
        .dns(FakeDns::new().host("h.example", &[[10, 0, 0, 1]]))
        .socket_factory(FakeSocketFactory)
        .transport_factory(script.clone())
        .protocols(vec![Protocol::Http11])
        .cache(cache.clone())
        .build()
        .unwrap();
    (client, cache)
}

fn http_date_now() -> String {
    httpdate::fmt_http_date(SystemTime::now())
}

#[test]
fn fresh_responses_are_served_without_the_network() {
    let script = Script::new(vec![Reply::ok("cache me")
        .header("date", http_date_now())
        .header("cache-control", "max-age=60")]);
    let (client, cache) = cached_client(&script);

    let mut first = client.new_call(get("http://h.example/a")).execute().unwrap();
    assert_eq!(first.text().unwrap(), "cache me");

    let mut second = client.new_call(get("http://h.example/a")).execute().unwrap();
    assert_eq!(second.text().unwrap(), "cache me");
    assert!(second.cache_response().is_some());
    assert!(second.network_response().is_none());

    // One request ever reached the wire.
    assert_eq!(script.requests().len(), 1);
    assert_eq!(cache.request_count(), 2);
    assert_eq!(cache.network_count(), 1);
    assert_eq!(cache.hit_count(), 1);
}

#[test]
fn stale_responses_revalidate_and_304_confirms() {
    let script = Script::new(vec![
        Reply::ok("v1 body")
            .header("date", http_date_now())
            .header("cache-control", "max-age=0")
            .header("etag", "\"v1\""),
        Reply::status(304)
            .header("date", http_date_now())
            .header("cache-control", "max-age=60"),
    ]);
    let (client, cache) = cached_client(&script);

    let mut first = client.new_call(get("http://h.example/a")).execute().unwrap();
    assert_eq!(first.text().unwrap(), "v1 body");

    let mut second = client.new_call(get("http://h.example/a")).execute().unwrap();
    assert_eq!(second.status(), 200);
    assert_eq!(second.text().unwrap(), "v1 body");
    // Freshness came from the 304, the entity from the cache.
    assert_eq!(second.header("cache-control"), Some("max-age=60"));
    assert_eq!(second.header("etag"), Some("\"v1\""));
    assert!(second.cache_response().is_some());
    assert!(second.network_response().is_some());

    let revalidation = script.request(1);
    assert_eq!(revalidation.header("if-none-match"), Some("\"v1\""));

    assert_eq!(cache.request_count(), 2);
    assert_eq!(cache.network_count(), 2);
    assert_eq!(cache.hit_count(), 1);

    // The merged freshness now serves straight from cache.
    let mut third = client.new_call(get("http://h.example/a")).execute().unwrap();
    assert_eq!(third.text().unwrap(), "v1 body");
    assert_eq!(script.requests().len(), 2);
    assert_eq!(cache.hit_count(), 2);
}

#[test]
fn full_response_replaces_the_cached_entity() {
    let script = Script::new(vec![
        Reply::ok("v1 body")
            .header("date", http_date_now())
            .header("cache-control", "max-age=0")
            .header("etag", "\"v1\""),
        Reply::ok("v2 body")
            .header("date", http_date_now())
            .header("cache-control", "max-age=60")
            .header("etag", "\"v2\""),
    ]);
    let (client, cache) = cached_client(&script);

    client
        .new_call(get("http://h.example/a"))
        .execute()
        .unwrap()
        .close();
    let mut second = client.new_call(get("http://h.example/a")).execute().unwrap();
    assert_eq!(second.text().unwrap(), "v2 body");
    assert_eq!(cache.hit_count(), 0);

    let mut third = client.new_call(get("http://h.example/a")).execute().unwrap();
    assert_eq!(third.text().unwrap(), "v2 body");
    assert_eq!(script.requests().len(), 2);
}

#[test]
fn only_if_cached_without_an_entry_yields_504() {
    let script = Script::new(vec![]);
    let (client, cache) = cached_client(&script);

    let request = Request::builder()
        .url("http://h.example/missing")
        .header("cache-control", "only-if-cached")
        .build()
        .unwrap();
    let response = client.new_call(request).execute().unwrap();
    assert_eq!(response.status(), 504);
    assert!(script.requests().is_empty());
    assert_eq!(cache.network_count(), 0);
}

#[test]
fn vary_mismatch_is_a_miss() {
    let script = Script::new(vec![
        Reply::ok("german")
            .header("date", http_date_now())
            .header("cache-control", "max-age=60")
            .header("vary", "Accept-Language"),
        Reply::ok("french")
            .header("date", http_date_now())
            .header("cache-control", "max-age=60")
            .header("vary", "Accept-Language"),
    ]);
    let (client, cache) = cached_client(&script);

    let request = |lang: &'static str| {
        Request::builder()
            .url("http://h.example/a")
            .header("accept-language", lang)
            .build()
            .unwrap()
    };

    let mut first = client.new_call(request("de")).execute().unwrap();
    assert_eq!(first.text().unwrap(), "german");

    // Different selected header: the stored entry must not answer.
    let mut second = client.new_call(request("fr")).execute().unwrap();
    assert_eq!(second.text().unwrap(), "french");
    assert_eq!(script.requests().len(), 2);
    assert_eq!(cache.hit_count(), 0);

    // Same dimension as the second store: now it hits.
    let mut third = client.new_call(request("fr")).execute().unwrap();
    assert_eq!(third.text().unwrap(), "french");
    assert_eq!(script.requests().len(), 2);
    assert_eq!(cache.hit_count(), 1);
}

#[test]
fn post_invalidates_the_stored_entry() {
    let script = Script::new(vec![
        Reply::ok("cached")
            .header("date", http_date_now())
            .header("cache-control", "max-age=60"),
        Reply::ok("post result"),
        Reply::ok("fetched again")
            .header("date", http_date_now())
            .header("cache-control", "max-age=60"),
    ]);
    let (client, _cache) = cached_client(&script);

    client
        .new_call(get("http://h.example/a"))
        .execute()
        .unwrap()
        .close();

    let post = Request::builder()
        .method(courier::Method::POST)
        .url("http://h.example/a")
        .body("mutation")
        .build()
        .unwrap();
    let mut response = client.new_call(post).execute().unwrap();
    assert_eq!(response.text().unwrap(), "post result");

    // The entry is gone; the next read refetches.
    let mut third = client.new_call(get("http://h.example/a")).execute().unwrap();
    assert_eq!(third.text().unwrap(), "fetched again");
    assert_eq!(script.requests().len(), 3);
}

#[test]
fn no_store_responses_are_never_written() {
    let script = Script::new(vec![
        Reply::ok("secret")
            .header("date", http_date_now())
            .header("cache-control", "no-store"),
        Reply::ok("secret again")
            .header("date", http_date_now())
            .header("cache-control", "no-store"),
    ]);
    let (client, cache) = cached_client(&script);

    client
        .new_call(get("http://h.example/a"))
        .execute()
        .unwrap()
        .close();
    client
        .new_call(get("http://h.example/a"))
        .execute()
        .unwrap()
        .close();
    assert_eq!(script.requests().len(), 2);
    assert_eq!(cache.hit_count(), 0);
}

#[test]
fn unread_bodies_do_not_commit_cache_entries() {
    let script = Script::new(vec![
        Reply::ok("abandoned")
            .header("date", http_date_now())
            .header("cache-control", "max-age=60"),
        Reply::ok("fetched properly")
            .header("date", http_date_now())
            .header("cache-control", "max-age=60"),
    ]);
    let (client, cache) = cached_client(&script);

    // Close without reading: the tee aborts, nothing is stored.
    client
        .new_call(get("http://h.example/a"))
        .execute()
        .unwrap()
        .close();

    let mut second = client.new_call(get("http://h.example/a")).execute().unwrap();
    assert_eq!(second.text().unwrap(), "fetched properly");
    assert_eq!(script.requests().len(), 2);
    assert_eq!(cache.hit_count(), 0);
}
