//! Serves responses from the cache, revalidates stale ones, and writes
//! network responses back.

use std::io::{self, Read};

use http::{header::HeaderName, HeaderMap, StatusCode};

use super::{Chain, Interceptor};
use crate::{
    cache::{self, strategy, Cache, CacheWriter},
    response::{Response, ResponseBody},
    util::now_millis,
};

pub(crate) struct CacheInterceptor {
    pub(crate) cache: Option<Cache>,
}

impl Interceptor for CacheInterceptor {
    fn intercept(&self, chain: &mut Chain<'_>) -> crate::Result<Response> {
        let request = chain.request().clone();
        let now = now_millis();

        let cache_candidate = self.cache.as_ref().and_then(|cache| cache.get(&request));

        let strategy = strategy::Factory::new(now, &request, cache_candidate).compute();
        if let Some(cache) = &self.cache {
            cache.track_response(&strategy);
        }

        let network_request = strategy.network_request;
        let cache_response = strategy.cache_response;

        // The request forbade the network and the cache cannot answer.
        let Some(network_request) = network_request else {
            match cache_response {
                Some(response) => {
                    log::trace!("cache hit for {}", request.url());
                    let mut response = response;
                    let body = response.take_body();
                    let stripped = response.stripped();
                    let mut served = response.to_builder().cache_response(Some(stripped)).build();
                    served.set_body(body);
                    return Ok(served);
                }
                None => {
                    log::trace!("unsatisfiable only-if-cached for {}", request.url());
                    return Ok(strategy::synthesize_unsatisfiable(&request, now));
                }
            }
        };

        let network_response = chain.proceed(network_request)?;

        let mut cache_stripped = None;
        if let Some(mut cached) = cache_response {
            if network_response.status() == StatusCode::NOT_MODIFIED {
                log::trace!("conditional hit for {}", request.url());
                let cached_body = cached.take_body();

                let merged_headers = combine_headers(cached.headers(), network_response.headers());
                let mut merged = cached
                    .to_builder()
                    .headers(merged_headers)
                    .sent_at_millis(network_response.sent_at_millis())
                    .received_at_millis(network_response.received_at_millis())
                    .cache_response(Some(cached.stripped()))
                    .network_response(Some(network_response.stripped()))
                    .build();
                merged.set_body(cached_body);

                // The 304 carried no entity; its exchange is already done.
                network_response.close();

                if let Some(cache) = &self.cache {
                    cache.track_conditional_hit();
                    cache.update(&merged);
                }
                return Ok(merged);
            }
            cache_stripped = Some(cached.stripped());
            cached.close();
        }

        let mut response = {
            let mut network_response = network_response;
            let body = network_response.take_body();
            let mut built = network_response
                .to_builder()
                .cache_response(cache_stripped)
                .network_response(Some(network_response.stripped()))
                .build();
            built.set_body(body);
            built
        };

        if let Some(cache) = &self.cache {
            if response.promises_body() && strategy::is_cacheable(&response, response.request()) {
                if let Some(writer) = cache.put(&response) {
                    response = tee_into_cache(response, writer);
                }
            } else if cache::invalidates_cache(response.request().method()) {
                cache.remove_for(response.request());
            }
        }

        Ok(response)
    }
}

/// Merges headers for a revalidated response: the cache keeps the entity
/// headers, the network wins on freshness metadata (RFC 7234 §4.3.4).
fn combine_headers(cached: &HeaderMap, network: &HeaderMap) -> HeaderMap {
    let mut merged = HeaderMap::new();

    for (name, value) in cached {
        // Stale 1xx warnings are superseded by the revalidation.
        if name.as_str() == "warning" {
            if let Ok(text) = value.to_str() {
                if text.starts_with('1') {
                    continue;
                }
            }
        }
        if is_content_specific(name) || !is_end_to_end(name) || network.get(name).is_none() {
            merged.append(name.clone(), value.clone());
        }
    }

    for (name, value) in network {
        if !is_content_specific(name) && is_end_to_end(name) {
            merged.append(name.clone(), value.clone());
        }
    }

    merged
}

/// Headers describing the stored entity, which a bodyless 304 cannot speak
/// for.
fn is_content_specific(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "content-length" | "content-encoding" | "content-type"
    )
}

fn is_end_to_end(name: &HeaderName) -> bool {
    !matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Wraps a network body so the bytes the application reads also land in the
/// cache. The entry commits when the body reaches its end; dropping the
/// body early or failing mid-read aborts the write.
fn tee_into_cache(mut response: Response, writer: CacheWriter) -> Response {
    let Some(body) = response.take_body() else {
        return response;
    };
    let content_length = body.content_length();
    let tee = TeeBody {
        inner: body,
        writer: Some(writer),
    };
    response.set_body(Some(ResponseBody::new(content_length, tee)));
    response
}

struct TeeBody {
    inner: ResponseBody,
    writer: Option<CacheWriter>,
}

impl Read for TeeBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.inner.read(buf) {
            Ok(0) => {
                if let Some(writer) = self.writer.take() {
                    writer.commit();
                }
                Ok(0)
            }
            Ok(n) => {
                if let Some(writer) = self.writer.as_mut() {
                    writer.append(&buf[..n]);
                }
                Ok(n)
            }
            Err(e) => {
                self.writer = None;
                Err(e)
            }
        }
    }
}

impl Drop for TeeBody {
    fn drop(&mut self) {
        // An unfinished read never commits a partial entry.
        self.writer = None;
    }
}
