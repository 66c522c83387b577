//! A private response cache with RFC 7234 semantics.
//!
//! The cache itself decides *what* is stored and served; *where* bytes live
//! is behind [`CacheStore`], so a journaled disk store can plug in. Entries
//! are keyed by the MD5 of the URL and carry a metadata stream alongside the
//! body stream.

pub(crate) mod control;
pub(crate) mod entry;
pub(crate) mod strategy;

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use bytes::Bytes;
use http::Method;
use md5::{Digest as _, Md5};
use url::Url;

use crate::{
    request::Request,
    response::{Response, ResponseBody},
    sync::RwLock,
};

pub use control::CacheControl;
pub(crate) use strategy::CacheStrategy;

/// Raw storage for cache entries: a metadata stream and a body stream per
/// key. Implementations must tolerate concurrent readers and writers.
pub trait CacheStore: Send + Sync {
    fn load(&self, key: &str) -> Option<(Bytes, Bytes)>;

    fn store(&self, key: &str, metadata: Bytes, body: Bytes);

    fn remove(&self, key: &str);
}

/// An in-memory [`CacheStore`].
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, (Bytes, Bytes)>>,
}

impl CacheStore for MemoryStore {
    fn load(&self, key: &str) -> Option<(Bytes, Bytes)> {
        self.entries.read().get(key).cloned()
    }

    fn store(&self, key: &str, metadata: Bytes, body: Bytes) {
        self.entries.write().insert(key.to_owned(), (metadata, body));
    }

    fn remove(&self, key: &str) {
        self.entries.write().remove(key);
    }
}

/// The entry key: hex MD5 of the URL.
pub(crate) fn key(url: &Url) -> String {
    let digest = Md5::digest(url.as_str().as_bytes());
    let mut out = String::with_capacity(32);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

struct Shared {
    store: Box<dyn CacheStore>,
    request_count: AtomicU64,
    network_count: AtomicU64,
    hit_count: AtomicU64,
}

/// A response cache for a client.
#[derive(Clone)]
pub struct Cache {
    inner: Arc<Shared>,
}

impl Cache {
    pub fn new(store: impl CacheStore + 'static) -> Cache {
        Cache {
            inner: Arc::new(Shared {
                store: Box::new(store),
                request_count: AtomicU64::new(0),
                network_count: AtomicU64::new(0),
                hit_count: AtomicU64::new(0),
            }),
        }
    }

    pub fn in_memory() -> Cache {
        Cache::new(MemoryStore::default())
    }

    /// Calls that consulted this cache.
    pub fn request_count(&self) -> u64 {
        self.inner.request_count.load(Ordering::Relaxed)
    }

    /// Calls that went out over the network.
    pub fn network_count(&self) -> u64 {
        self.inner.network_count.load(Ordering::Relaxed)
    }

    /// Calls answered by the cache, counting confirmed revalidations.
    pub fn hit_count(&self) -> u64 {
        self.inner.hit_count.load(Ordering::Relaxed)
    }

    /// The stored response usable for `request`, if any.
    pub(crate) fn get(&self, request: &Request) -> Option<Response> {
        let key = key(request.url());
        let (metadata, body) = self.inner.store.load(&key)?;

        let entry = match entry::Entry::read(&metadata) {
            Ok(entry) => entry,
            Err(e) => {
                log::warn!("dropping unreadable cache entry for {}: {e}", request.url());
                self.inner.store.remove(&key);
                return None;
            }
        };

        if !entry.matches(request) {
            return None;
        }

        entry.to_response(ResponseBody::from_bytes(body)).ok()
    }

    /// Begins storing `response`, returning the writer its body should be
    /// teed through. `None` when the response is not storable here.
    pub(crate) fn put(&self, response: &Response) -> Option<CacheWriter> {
        let request = response.request();

        if invalidates_cache(request.method()) {
            self.remove_for(request);
            return None;
        }
        if request.method() != Method::GET {
            // Technically some other methods are storable, but the cost of
            // getting them right outweighs a key scheme beyond the URL.
            return None;
        }
        if entry::has_vary_all(response.headers()) {
            return None;
        }
        if request.url().scheme() == "https" && response.handshake().is_none() {
            return None;
        }

        let entry = entry::Entry::from_response(response);
        Some(CacheWriter {
            inner: self.inner.clone(),
            key: key(request.url()),
            metadata: entry.to_bytes(),
            body: Vec::new(),
        })
    }

    /// Replaces the metadata of an existing entry after a `304 Not
    /// Modified` confirmed it; the stored body is kept.
    pub(crate) fn update(&self, merged: &Response) {
        let key = key(merged.request().url());
        if let Some((_, body)) = self.inner.store.load(&key) {
            let entry = entry::Entry::from_response(merged);
            self.inner.store.store(&key, entry.to_bytes(), body);
        }
    }

    pub(crate) fn remove_for(&self, request: &Request) {
        self.inner.store.remove(&key(request.url()));
    }

    pub(crate) fn track_response(&self, strategy: &CacheStrategy) {
        self.inner.request_count.fetch_add(1, Ordering::Relaxed);
        if strategy.network_request.is_some() {
            self.inner.network_count.fetch_add(1, Ordering::Relaxed);
        } else if strategy.cache_response.is_some() {
            self.inner.hit_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn track_conditional_hit(&self) {
        self.inner.hit_count.fetch_add(1, Ordering::Relaxed);
    }
}

impl fmt::Debug for Cache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("request_count", &self.request_count())
            .field("network_count", &self.network_count())
            .field("hit_count", &self.hit_count())
            .finish()
    }
}

/// Whether a request with this method makes any stored response for its URL
/// untrustworthy.
pub(crate) fn invalidates_cache(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH | Method::DELETE)
        || method.as_str() == "MOVE"
}

/// Accumulates a response body as it streams to the caller, committing the
/// entry only when the body completes. Dropping the writer early aborts the
/// store, leaving no partial entry behind.
pub(crate) struct CacheWriter {
    inner: Arc<Shared>,
    key: String,
    metadata: Bytes,
    body: Vec<u8>,
}

impl CacheWriter {
    pub(crate) fn append(&mut self, chunk: &[u8]) {
        self.body.extend_from_slice(chunk);
    }

    pub(crate) fn commit(self) {
        self.inner
            .store
            .store(&self.key, self.metadata, Bytes::from(self.body));
    }
}

#[cfg(test)]
mod tests {
    use http::StatusCode;

    use super::*;

    fn request(url: &str) -> Request {
        Request::builder().url(url).build().unwrap()
    }

    fn response(url: &str) -> Response {
        Response::builder(request(url), StatusCode::OK)
            .header(
                http::header::CACHE_CONTROL,
                http::HeaderValue::from_static("max-age=60"),
            )
            .body(ResponseBody::empty())
            .sent_at_millis(1)
            .received_at_millis(2)
            .build()
    }

    #[test]
    fn put_then_get_round_trips() {
        let cache = Cache::in_memory();
        let mut writer = cache.put(&response("http://example.com/a")).unwrap();
        writer.append(b"hello");
        writer.commit();

        let mut cached = cache.get(&request("http://example.com/a")).unwrap();
        assert_eq!(cached.status(), StatusCode::OK);
        assert_eq!(cached.text().unwrap(), "hello");

        assert!(cache.get(&request("http://example.com/other")).is_none());
    }

    #[test]
    fn abort_leaves_nothing() {
        let cache = Cache::in_memory();
        let mut writer = cache.put(&response("http://example.com/a")).unwrap();
        writer.append(b"partial");
        drop(writer);
        assert!(cache.get(&request("http://example.com/a")).is_none());
    }

    #[test]
    fn non_get_is_not_stored() {
        let cache = Cache::in_memory();
        let post = Request::builder()
            .method(Method::POST)
            .url("http://example.com/a")
            .body("x")
            .build()
            .unwrap();
        let response = Response::builder(post, StatusCode::OK)
            .body(ResponseBody::empty())
            .build();
        assert!(cache.put(&response).is_none());
    }

    #[test]
    fn invalidating_method_evicts() {
        let cache = Cache::in_memory();
        let mut writer = cache.put(&response("http://example.com/a")).unwrap();
        writer.append(b"hello");
        writer.commit();

        let delete = Request::builder()
            .method(Method::DELETE)
            .url("http://example.com/a")
            .build()
            .unwrap();
        let delete_response = Response::builder(delete, StatusCode::OK)
            .body(ResponseBody::empty())
            .build();
        assert!(cache.put(&delete_response).is_none());
        assert!(cache.get(&request("http://example.com/a")).is_none());
    }

    #[test]
    fn vary_star_is_not_stored() {
        let cache = Cache::in_memory();
        let response = Response::builder(request("http://example.com/a"), StatusCode::OK)
            .header(http::header::VARY, http::HeaderValue::from_static("*"))
            .body(ResponseBody::empty())
            .build();
        assert!(cache.put(&response).is_none());
    }

    #[test]
    fn https_without_handshake_is_not_stored() {
        let cache = Cache::in_memory();
        let response = Response::builder(request("https://example.com/a"), StatusCode::OK)
            .body(ResponseBody::empty())
            .build();
        assert!(cache.put(&response).is_none());
    }

    #[test]
    fn keys_are_md5_hex() {
        let url: Url = "http://example.com/a".parse().unwrap();
        let key = key(&url);
        assert_eq!(key.len(), 32);
        assert!(key.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_eq!(key, super::key(&url));
    }

    #[test]
    fn unreadable_entries_are_dropped() {
        let cache = Cache::in_memory();
        let url: Url = "http://example.com/a".parse().unwrap();
        cache
            .inner
            .store
            .store(&key(&url), Bytes::from_static(b"garbage"), Bytes::new());
        assert!(cache.get(&request("http://example.com/a")).is_none());
        // And the broken entry is gone.
        assert!(cache.inner.store.load(&key(&url)).is_none());
    }
}
