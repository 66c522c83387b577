//! Given a request and a stored response, decides whether to use the
//! network, the cache, or a conditional request that lets the origin
//! validate the cached entity (RFC 7234).

use http::{
    header::{HeaderName, HeaderValue, IF_MODIFIED_SINCE, IF_NONE_MATCH},
    HeaderMap, StatusCode,
};

use super::control::CacheControl;
use crate::{request::Request, response::Response};

const WARNING: HeaderName = HeaderName::from_static("warning");
const ONE_DAY_MILLIS: i64 = 24 * 60 * 60 * 1000;

/// The outcome: a request to send (`None` to skip the network) and a cached
/// response to serve or validate (`None` to skip the cache). Both absent
/// means the request forbade the network and nothing usable was stored.
pub(crate) struct CacheStrategy {
    pub(crate) network_request: Option<Request>,
    pub(crate) cache_response: Option<Response>,
}

impl CacheStrategy {
    fn network_only(request: Request) -> CacheStrategy {
        CacheStrategy {
            network_request: Some(request),
            cache_response: None,
        }
    }
}

/// Whether a response may be stored and later served for `request`.
///
/// `s-maxage` is deliberately ignored: this is a private cache.
pub(crate) fn is_cacheable(response: &Response, request: &Request) -> bool {
    match response.status().as_u16() {
        200 | 203 | 204 | 300 | 301 | 308 | 404 | 405 | 410 | 414 | 501 => {}
        302 | 307 => {
            // Redirects that are only cacheable with explicit freshness
            // information.
            let cc = CacheControl::parse(response.headers());
            if response.header("Expires").is_none()
                && cc.max_age_secs == -1
                && !cc.is_public
                && !cc.is_private
            {
                return false;
            }
        }
        _ => return false,
    }

    !CacheControl::parse(response.headers()).no_store
        && !CacheControl::parse(request.headers()).no_store
}

/// True when the caller attached its own validator, making the request
/// unanswerable from this cache.
pub(crate) fn has_conditions(request: &Request) -> bool {
    request.headers().contains_key(IF_MODIFIED_SINCE)
        || request.headers().contains_key(IF_NONE_MATCH)
}

fn date_millis(headers: &HeaderMap, name: &str) -> Option<i64> {
    let value = headers.get(name)?.to_str().ok()?;
    let time = httpdate::parse_http_date(value).ok()?;
    time.duration_since(std::time::UNIX_EPOCH)
        .ok()
        .map(|d| d.as_millis() as i64)
}

pub(crate) struct Factory {
    now_millis: i64,
    request: Request,
    cache_response: Option<Response>,

    // Fields lifted out of the cached response's headers.
    served_date_millis: Option<i64>,
    served_date_text: Option<String>,
    last_modified_millis: Option<i64>,
    last_modified_text: Option<String>,
    expires_millis: Option<i64>,
    etag: Option<String>,
    age_seconds: i64,
    sent_request_millis: i64,
    received_response_millis: i64,
}

impl Factory {
    pub(crate) fn new(
        now_millis: i64,
        request: &Request,
        cache_response: Option<Response>,
    ) -> Factory {
        let mut factory = Factory {
            now_millis,
            request: request.clone(),
            cache_response: None,
            served_date_millis: None,
            served_date_text: None,
            last_modified_millis: None,
            last_modified_text: None,
            expires_millis: None,
            etag: None,
            age_seconds: -1,
            sent_request_millis: 0,
            received_response_millis: 0,
        };

        if let Some(response) = cache_response {
            factory.sent_request_millis = response.sent_at_millis();
            factory.received_response_millis = response.received_at_millis();
            factory.served_date_millis = date_millis(response.headers(), "date");
            factory.served_date_text = response.header("date").map(str::to_owned);
            factory.last_modified_millis = date_millis(response.headers(), "last-modified");
            factory.last_modified_text = response.header("last-modified").map(str::to_owned);
            factory.expires_millis = date_millis(response.headers(), "expires");
            factory.etag = response.header("etag").map(str::to_owned);
            factory.age_seconds = response
                .header("age")
                .and_then(|v| v.trim().parse::<i64>().ok())
                .filter(|v| *v >= 0)
                .unwrap_or(-1);
            factory.cache_response = Some(response);
        }

        factory
    }

    pub(crate) fn compute(self) -> CacheStrategy {
        let only_if_cached = CacheControl::parse(self.request.headers()).only_if_cached;
        let candidate = self.compute_candidate();

        // The request forbade the network, but the candidate needs it.
        if candidate.network_request.is_some() && only_if_cached {
            return CacheStrategy {
                network_request: None,
                cache_response: None,
            };
        }

        candidate
    }

    fn compute_candidate(mut self) -> CacheStrategy {
        let Some(cache_response) = self.cache_response.take() else {
            return CacheStrategy::network_only(self.request);
        };

        // A stored https response without its handshake is unusable.
        if self.request.url().scheme() == "https" && cache_response.handshake().is_none() {
            return CacheStrategy::network_only(self.request);
        }

        if !is_cacheable(&cache_response, &self.request) {
            return CacheStrategy::network_only(self.request);
        }

        let request_caching = CacheControl::parse(self.request.headers());
        if request_caching.no_cache || has_conditions(&self.request) {
            return CacheStrategy::network_only(self.request);
        }

        let response_caching = CacheControl::parse(cache_response.headers());

        let age_millis = self.cache_response_age();
        let mut fresh_millis = self.freshness_lifetime(&cache_response, &response_caching);

        if request_caching.max_age_secs != -1 {
            fresh_millis = fresh_millis.min(request_caching.max_age_secs.saturating_mul(1000));
        }

        let min_fresh_millis = if request_caching.min_fresh_secs != -1 {
            request_caching.min_fresh_secs.saturating_mul(1000)
        } else {
            0
        };

        // Staleness tolerance only counts when the response does not demand
        // revalidation.
        let max_stale_millis = if !response_caching.must_revalidate
            && request_caching.max_stale_secs != -1
        {
            request_caching.max_stale_secs.saturating_mul(1000)
        } else {
            0
        };

        if !response_caching.no_cache
            && age_millis.saturating_add(min_fresh_millis)
                < fresh_millis.saturating_add(max_stale_millis)
        {
            let mut cache_response = cache_response;
            let body = cache_response.take_body();
            let mut builder = cache_response.to_builder();
            if age_millis.saturating_add(min_fresh_millis) >= fresh_millis {
                builder = builder.header(
                    WARNING,
                    HeaderValue::from_static("110 courier \"Response is stale\""),
                );
            }
            if age_millis > ONE_DAY_MILLIS && self.is_freshness_heuristic(&response_caching) {
                builder = builder.header(
                    WARNING,
                    HeaderValue::from_static("113 courier \"Heuristic expiration\""),
                );
            }
            let mut served = builder.build();
            served.set_body(body);
            return CacheStrategy {
                network_request: None,
                cache_response: Some(served),
            };
        }

        // Find a validator to revalidate the stored entity with.
        let (condition_name, condition_value) = if let Some(etag) = &self.etag {
            (IF_NONE_MATCH, etag.clone())
        } else if let Some(last_modified) = &self.last_modified_text {
            (IF_MODIFIED_SINCE, last_modified.clone())
        } else if let Some(served_date) = &self.served_date_text {
            (IF_MODIFIED_SINCE, served_date.clone())
        } else {
            return CacheStrategy::network_only(self.request);
        };

        let conditional_request = match HeaderValue::from_str(&condition_value) {
            Ok(value) => {
                let mut builder = self.request.to_builder();
                builder = builder.set_header(condition_name, value);
                match builder.build() {
                    Ok(request) => request,
                    Err(_) => return CacheStrategy::network_only(self.request),
                }
            }
            Err(_) => return CacheStrategy::network_only(self.request),
        };

        CacheStrategy {
            network_request: Some(conditional_request),
            cache_response: Some(cache_response),
        }
    }

    /// The current age of the stored response (RFC 7234 §4.2.3).
    fn cache_response_age(&self) -> i64 {
        let apparent_received_age = match self.served_date_millis {
            Some(served) => (self.received_response_millis - served).max(0),
            None => 0,
        };

        let received_age = if self.age_seconds != -1 {
            apparent_received_age.max(self.age_seconds.saturating_mul(1000))
        } else {
            apparent_received_age
        };

        let response_duration = self.received_response_millis - self.sent_request_millis;
        let resident_duration = self.now_millis - self.received_response_millis;
        received_age + response_duration + resident_duration
    }

    /// How long the response stays fresh from its served date
    /// (RFC 7234 §4.2.1, plus the usual heuristic).
    fn freshness_lifetime(&self, cache_response: &Response, caching: &CacheControl) -> i64 {
        if caching.max_age_secs != -1 {
            return caching.max_age_secs.saturating_mul(1000);
        }

        if let Some(expires) = self.expires_millis {
            let served = self
                .served_date_millis
                .unwrap_or(self.received_response_millis);
            return (expires - served).max(0);
        }

        if let Some(last_modified) = self.last_modified_millis {
            // Heuristic freshness: a tenth of the document's age when it was
            // served. Only for URLs without a query string.
            if cache_response.url().query().is_none() {
                let served = self.served_date_millis.unwrap_or(self.sent_request_millis);
                let delta = served - last_modified;
                return if delta > 0 { delta / 10 } else { 0 };
            }
        }

        0
    }

    fn is_freshness_heuristic(&self, caching: &CacheControl) -> bool {
        caching.max_age_secs == -1 && self.expires_millis.is_none()
    }
}

pub(crate) fn synthesize_unsatisfiable(request: &Request, now_millis: i64) -> Response {
    Response::builder(request.clone(), StatusCode::GATEWAY_TIMEOUT)
        .message("Unsatisfiable Request (only-if-cached)")
        .body(crate::response::ResponseBody::empty())
        .sent_at_millis(-1)
        .received_at_millis(now_millis)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::ResponseBody;

    const NOW: i64 = 1_700_000_000_000;

    fn request(url: &str) -> Request {
        Request::builder().url(url).build().unwrap()
    }

    fn http_date(millis: i64) -> String {
        let time = std::time::UNIX_EPOCH + std::time::Duration::from_millis(millis as u64);
        httpdate::fmt_http_date(time)
    }

    struct Stored {
        status: StatusCode,
        headers: Vec<(&'static str, String)>,
        sent: i64,
        received: i64,
    }

    impl Stored {
        fn new() -> Stored {
            Stored {
                status: StatusCode::OK,
                headers: Vec::new(),
                sent: NOW - 10_000,
                received: NOW - 9_000,
            }
        }

        fn header(mut self, name: &'static str, value: impl Into<String>) -> Stored {
            self.headers.push((name, value.into()));
            self
        }

        fn build(self, url: &str) -> Response {
            let mut builder = Response::builder(request(url), self.status)
                .body(ResponseBody::empty())
                .sent_at_millis(self.sent)
                .received_at_millis(self.received);
            for (name, value) in self.headers {
                builder = builder.header(
                    HeaderName::from_static(name),
                    HeaderValue::from_str(&value).unwrap(),
                );
            }
            builder.build()
        }
    }

    #[test]
    fn no_stored_response_goes_to_network() {
        let req = request("http://example.com/");
        let strategy = Factory::new(NOW, &req, None).compute();
        assert!(strategy.network_request.is_some());
        assert!(strategy.cache_response.is_none());
    }

    #[test]
    fn fresh_response_is_served_from_cache() {
        let req = request("http://example.com/");
        let stored = Stored::new()
            .header("date", http_date(NOW - 9_500))
            .header("cache-control", "max-age=60")
            .build("http://example.com/");

        let strategy = Factory::new(NOW, &req, Some(stored)).compute();
        assert!(strategy.network_request.is_none());
        let served = strategy.cache_response.unwrap();
        assert!(served.header("warning").is_none());
    }

    #[test]
    fn expired_response_with_etag_revalidates() {
        let req = request("http://example.com/");
        let stored = Stored::new()
            .header("date", http_date(NOW - 120_000))
            .header("cache-control", "max-age=60")
            .header("etag", "\"v1\"")
            .build("http://example.com/");

        let strategy = Factory::new(NOW, &req, Some(stored)).compute();
        let network = strategy.network_request.unwrap();
        assert_eq!(network.header("if-none-match"), Some("\"v1\""));
        assert!(strategy.cache_response.is_some());
    }

    #[test]
    fn expired_response_falls_back_to_last_modified() {
        let req = request("http://example.com/");
        let last_modified = http_date(NOW - 500_000);
        let stored = Stored::new()
            .header("date", http_date(NOW - 120_000))
            .header("cache-control", "max-age=60")
            .header("last-modified", last_modified.clone())
            .build("http://example.com/");

        let strategy = Factory::new(NOW, &req, Some(stored)).compute();
        let network = strategy.network_request.unwrap();
        assert_eq!(network.header("if-modified-since"), Some(&*last_modified));
    }

    #[test]
    fn expired_response_without_validator_goes_to_network() {
        let req = request("http://example.com/");
        let stored = Stored::new()
            .header("cache-control", "max-age=0")
            .build("http://example.com/");

        // No Date, no ETag, no Last-Modified: there is nothing to validate
        // with beyond the served date, which is also missing.
        let strategy = Factory::new(NOW, &req, Some(stored)).compute();
        assert!(strategy.network_request.is_some());
        assert!(strategy.cache_response.is_none());
    }

    #[test]
    fn only_if_cached_miss_serves_neither() {
        let req = Request::builder()
            .url("http://example.com/")
            .header("cache-control", "only-if-cached")
            .build()
            .unwrap();
        let strategy = Factory::new(NOW, &req, None).compute();
        assert!(strategy.network_request.is_none());
        assert!(strategy.cache_response.is_none());
    }

    #[test]
    fn request_no_cache_forces_network() {
        let req = Request::builder()
            .url("http://example.com/")
            .header("cache-control", "no-cache")
            .build()
            .unwrap();
        let stored = Stored::new()
            .header("date", http_date(NOW - 1_000))
            .header("cache-control", "max-age=600")
            .build("http://example.com/");
        let strategy = Factory::new(NOW, &req, Some(stored)).compute();
        assert!(strategy.network_request.is_some());
        assert!(strategy.cache_response.is_none());
    }

    #[test]
    fn caller_conditions_force_network() {
        let req = Request::builder()
            .url("http://example.com/")
            .header("if-none-match", "\"mine\"")
            .build()
            .unwrap();
        let stored = Stored::new()
            .header("date", http_date(NOW - 1_000))
            .header("cache-control", "max-age=600")
            .build("http://example.com/");
        let strategy = Factory::new(NOW, &req, Some(stored)).compute();
        assert!(strategy.network_request.is_some());
        assert!(strategy.cache_response.is_none());
    }

    #[test]
    fn https_without_handshake_goes_to_network() {
        let req = request("https://example.com/");
        let stored = Stored::new()
            .header("date", http_date(NOW - 1_000))
            .header("cache-control", "max-age=600")
            .build("https://example.com/");
        let strategy = Factory::new(NOW, &req, Some(stored)).compute();
        assert!(strategy.network_request.is_some());
        assert!(strategy.cache_response.is_none());
    }

    #[test]
    fn max_stale_serves_stale_with_warning() {
        let req = Request::builder()
            .url("http://example.com/")
            .header("cache-control", "max-stale=3600")
            .build()
            .unwrap();
        let stored = Stored::new()
            .header("date", http_date(NOW - 120_000))
            .header("cache-control", "max-age=60")
            .build("http://example.com/");

        let strategy = Factory::new(NOW, &req, Some(stored)).compute();
        assert!(strategy.network_request.is_none());
        let served = strategy.cache_response.unwrap();
        assert_eq!(
            served.header("warning"),
            Some("110 courier \"Response is stale\"")
        );
    }

    #[test]
    fn must_revalidate_defeats_max_stale() {
        let req = Request::builder()
            .url("http://example.com/")
            .header("cache-control", "max-stale")
            .build()
            .unwrap();
        let stored = Stored::new()
            .header("date", http_date(NOW - 120_000))
            .header("cache-control", "max-age=60, must-revalidate")
            .build("http://example.com/");

        let strategy = Factory::new(NOW, &req, Some(stored)).compute();
        assert!(strategy.network_request.is_some());
    }

    #[test]
    fn heuristic_expiration_warns_after_a_day() {
        let two_days = 2 * ONE_DAY_MILLIS;
        let req = request("http://example.com/");
        let stored = Stored {
            status: StatusCode::OK,
            headers: Vec::new(),
            sent: NOW - two_days,
            received: NOW - two_days,
        }
        .header("date", http_date(NOW - two_days))
        // Served long after modification: 10% heuristic keeps it fresh.
        .header("last-modified", http_date(NOW - 400 * ONE_DAY_MILLIS))
        .build("http://example.com/");

        let strategy = Factory::new(NOW, &req, Some(stored)).compute();
        assert!(strategy.network_request.is_none());
        let served = strategy.cache_response.unwrap();
        assert_eq!(
            served.header("warning"),
            Some("113 courier \"Heuristic expiration\"")
        );
    }

    #[test]
    fn heuristic_skips_urls_with_queries() {
        let req = request("http://example.com/?q=1");
        let stored = Stored::new()
            .header("date", http_date(NOW - 10_000))
            .header("last-modified", http_date(NOW - 400 * ONE_DAY_MILLIS))
            .build("http://example.com/?q=1");

        let strategy = Factory::new(NOW, &req, Some(stored)).compute();
        // Freshness lifetime is zero, and Last-Modified is the validator.
        let network = strategy.network_request.unwrap();
        assert!(network.header("if-modified-since").is_some());
    }

    #[test]
    fn request_max_age_caps_freshness() {
        let req = Request::builder()
            .url("http://example.com/")
            .header("cache-control", "max-age=5")
            .build()
            .unwrap();
        let stored = Stored::new()
            .header("date", http_date(NOW - 60_000))
            .header("cache-control", "max-age=600")
            .header("etag", "\"v1\"")
            .build("http://example.com/");

        let strategy = Factory::new(NOW, &req, Some(stored)).compute();
        // One minute old with a five second budget: revalidate.
        assert!(strategy.network_request.is_some());
        assert!(strategy.cache_response.is_some());
    }

    #[test]
    fn uncacheable_status_goes_to_network() {
        let req = request("http://example.com/");
        let stored = Stored {
            status: StatusCode::IM_A_TEAPOT,
            headers: Vec::new(),
            sent: NOW - 10_000,
            received: NOW - 9_000,
        }
        .header("date", http_date(NOW - 9_500))
        .header("cache-control", "max-age=600")
        .build("http://example.com/");

        let strategy = Factory::new(NOW, &req, Some(stored)).compute();
        assert!(strategy.network_request.is_some());
        assert!(strategy.cache_response.is_none());
    }

    #[test]
    fn redirects_cacheable_only_with_explicit_freshness() {
        let plain_302 = Stored {
            status: StatusCode::FOUND,
            headers: Vec::new(),
            sent: 0,
            received: 0,
        }
        .build("http://example.com/");
        assert!(!is_cacheable(&plain_302, &request("http://example.com/")));

        let fresh_302 = Stored {
            status: StatusCode::FOUND,
            headers: Vec::new(),
            sent: 0,
            received: 0,
        }
        .header("cache-control", "max-age=60")
        .build("http://example.com/");
        assert!(is_cacheable(&fresh_302, &request("http://example.com/")));

        let found_308 = Stored {
            status: StatusCode::PERMANENT_REDIRECT,
            headers: Vec::new(),
            sent: 0,
            received: 0,
        }
        .build("http://example.com/");
        assert!(is_cacheable(&found_308, &request("http://example.com/")));
    }

    #[test]
    fn no_store_defeats_caching() {
        let stored = Stored::new()
            .header("cache-control", "no-store, max-age=60")
            .build("http://example.com/");
        assert!(!is_cacheable(&stored, &request("http://example.com/")));

        let ok = Stored::new()
            .header("cache-control", "max-age=60")
            .build("http://example.com/");
        let no_store_request = Request::builder()
            .url("http://example.com/")
            .header("cache-control", "no-store")
            .build()
            .unwrap();
        assert!(!is_cacheable(&ok, &no_store_request));
    }

    #[test]
    fn age_header_extends_apparent_age() {
        let req = request("http://example.com/");
        // Served "now" per Date, but a proxy says it is already 120s old.
        let stored = Stored::new()
            .header("date", http_date(NOW - 9_500))
            .header("age", "120")
            .header("cache-control", "max-age=60")
            .header("etag", "\"v1\"")
            .build("http://example.com/");

        let strategy = Factory::new(NOW, &req, Some(stored)).compute();
        assert!(strategy.network_request.is_some());
        assert!(strategy.cache_response.is_some());
    }
}
