//! HTTP cookies.

use bytes::Bytes;
use http::HeaderValue;
use url::Url;

use crate::sync::RwLock;

/// Actions for a persistent cookie store providing session support.
///
/// The bridge stage consults the store on the way out (serializing a
/// `Cookie` header) and hands it every `Set-Cookie` on the way back.
pub trait CookieStore: Send + Sync {
    /// Store a set of `Set-Cookie` header values received from `url`.
    fn set_cookies(&self, cookie_headers: &mut dyn Iterator<Item = &HeaderValue>, url: &Url);

    /// The `Cookie` header value for a request to `url`, if any cookies
    /// apply.
    fn cookies(&self, url: &Url) -> Option<HeaderValue>;
}

/// A good default `CookieStore` implementation.
///
/// This is an in-memory jar with standard domain/path matching. Create one,
/// optionally seed it, and hand it to a client builder.
#[derive(Debug, Default)]
pub struct Jar(RwLock<cookie_store::CookieStore>);

impl Jar {
    /// Add a cookie to this jar as if it arrived in a `Set-Cookie` header
    /// from `url`.
    ///
    /// # Example
    ///
    /// ```
    /// use courier::cookie::Jar;
    /// use url::Url;
    ///
    /// let url = "https://example.com".parse::<Url>().unwrap();
    /// let jar = Jar::default();
    /// jar.add_cookie_str("session=1; Domain=example.com", &url);
    /// ```
    pub fn add_cookie_str(&self, cookie: &str, url: &Url) {
        let cookies = cookie::Cookie::parse(cookie)
            .ok()
            .map(|c| c.into_owned())
            .into_iter();
        self.0.write().store_response_cookies(cookies, url);
    }
}

impl CookieStore for Jar {
    fn set_cookies(&self, cookie_headers: &mut dyn Iterator<Item = &HeaderValue>, url: &Url) {
        let iter = cookie_headers.filter_map(|value| {
            std::str::from_utf8(value.as_bytes())
                .ok()
                .and_then(|s| cookie::Cookie::parse(s.to_owned()).ok())
        });
        self.0.write().store_response_cookies(iter, url);
    }

    fn cookies(&self, url: &Url) -> Option<HeaderValue> {
        let s = self
            .0
            .read()
            .get_request_values(url)
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; ");

        if s.is_empty() {
            return None;
        }

        HeaderValue::from_maybe_shared(Bytes::from(s)).ok()
    }
}
