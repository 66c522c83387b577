//! Requests.

use std::{fmt, sync::Arc};

use http::{
    header::{HeaderMap, HeaderName, HeaderValue},
    Method,
};
use url::Url;

use crate::{body::Body, error::Error, into_url::IntoUrl};

/// An HTTP request ready to be handed to a client.
#[derive(Clone)]
pub struct Request {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Option<Arc<Body>>,
}

impl Request {
    /// Starts a `GET` request builder with no URL set.
    pub fn builder() -> RequestBuilder {
        RequestBuilder {
            method: Method::GET,
            url: None,
            headers: HeaderMap::new(),
            body: None,
            err: None,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The first value of `name`, when present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn body(&self) -> Option<&Arc<Body>> {
        self.body.as_ref()
    }

    /// A builder seeded with a copy of this request, for follow-up rewrites.
    pub fn to_builder(&self) -> RequestBuilder {
        RequestBuilder {
            method: self.method.clone(),
            url: Some(Ok(self.url.clone())),
            headers: self.headers.clone(),
            body: self.body.clone(),
            err: None,
        }
    }

    /// True when `other` names the same host, port and scheme, so a pooled
    /// connection for one can carry the other.
    pub(crate) fn is_same_origin(&self, other: &Url) -> bool {
        self.url.scheme() == other.scheme()
            && self.url.host_str() == other.host_str()
            && self.url.port_or_known_default() == other.port_or_known_default()
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("url", &self.url.as_str())
            .field("headers", &self.headers)
            .finish()
    }
}

/// Builds a [`Request`].
///
/// Errors from URL parsing or malformed header names/values are deferred and
/// surface once from [`build`](RequestBuilder::build).
pub struct RequestBuilder {
    method: Method,
    url: Option<crate::Result<Url>>,
    headers: HeaderMap,
    body: Option<Arc<Body>>,
    err: Option<Error>,
}

impl RequestBuilder {
    pub fn method(mut self, method: Method) -> RequestBuilder {
        self.method = method;
        self
    }

    pub fn url(mut self, url: impl IntoUrl) -> RequestBuilder {
        self.url = Some(url.into_url());
        self
    }

    /// Appends a header. Existing values for the same name are kept.
    pub fn header<K, V>(mut self, name: K, value: V) -> RequestBuilder
    where
        HeaderName: TryFrom<K>,
        <HeaderName as TryFrom<K>>::Error: Into<http::Error>,
        HeaderValue: TryFrom<V>,
        <HeaderValue as TryFrom<V>>::Error: Into<http::Error>,
    {
        match (HeaderName::try_from(name), HeaderValue::try_from(value)) {
            (Ok(name), Ok(value)) => {
                self.headers.append(name, value);
            }
            (Err(e), _) => self.err = Some(Error::builder(e.into())),
            (_, Err(e)) => self.err = Some(Error::builder(e.into())),
        }
        self
    }

    /// Replaces all values of a header.
    pub fn set_header<K, V>(mut self, name: K, value: V) -> RequestBuilder
    where
        HeaderName: TryFrom<K>,
        <HeaderName as TryFrom<K>>::Error: Into<http::Error>,
        HeaderValue: TryFrom<V>,
        <HeaderValue as TryFrom<V>>::Error: Into<http::Error>,
    {
        match (HeaderName::try_from(name), HeaderValue::try_from(value)) {
            (Ok(name), Ok(value)) => {
                self.headers.insert(name, value);
            }
            (Err(e), _) => self.err = Some(Error::builder(e.into())),
            (_, Err(e)) => self.err = Some(Error::builder(e.into())),
        }
        self
    }

    pub fn remove_header(mut self, name: &str) -> RequestBuilder {
        self.headers.remove(name);
        self
    }

    pub fn headers(mut self, headers: HeaderMap) -> RequestBuilder {
        self.headers = headers;
        self
    }

    pub fn body(mut self, body: impl Into<Body>) -> RequestBuilder {
        self.body = Some(Arc::new(body.into()));
        self
    }

    pub(crate) fn shared_body(mut self, body: Option<Arc<Body>>) -> RequestBuilder {
        self.body = body;
        self
    }

    pub fn no_body(mut self) -> RequestBuilder {
        self.body = None;
        self
    }

    pub fn build(self) -> crate::Result<Request> {
        if let Some(err) = self.err {
            return Err(err);
        }
        let url = match self.url {
            Some(Ok(url)) => url,
            Some(Err(e)) => return Err(e),
            None => return Err(Error::builder("request URL is required")),
        };
        if self.body.is_some() && !permits_request_body(&self.method) {
            return Err(Error::builder(format!(
                "{} requests cannot carry a body",
                self.method
            )));
        }
        Ok(Request {
            method: self.method,
            url,
            headers: self.headers,
            body: self.body,
        })
    }
}

/// Whether the method is allowed to carry a request body.
pub(crate) fn permits_request_body(method: &Method) -> bool {
    !matches!(*method, Method::GET | Method::HEAD)
}
