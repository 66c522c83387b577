//! Responses.

use std::{
    fmt,
    io::{self, Read},
};

use bytes::Bytes;
use http::{
    header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, TRANSFER_ENCODING},
    Method, StatusCode,
};
use url::Url;

use crate::{error::Error, protocol::Protocol, request::Request, tls::Handshake};

/// An HTTP response.
///
/// Carries the request that produced it, the negotiated protocol, and links
/// to the responses that came before it: earlier hops of a redirect or
/// authentication chain (`prior_response`), and, when a cache took part,
/// body-stripped copies of the cache and network legs.
pub struct Response {
    request: Request,
    protocol: Protocol,
    status: StatusCode,
    message: String,
    headers: HeaderMap,
    body: Option<ResponseBody>,
    handshake: Option<Handshake>,
    prior_response: Option<Box<Response>>,
    cache_response: Option<Box<Response>>,
    network_response: Option<Box<Response>>,
    sent_at_millis: i64,
    received_at_millis: i64,
}

impl Response {
    pub fn builder(request: Request, status: StatusCode) -> ResponseBuilder {
        ResponseBuilder {
            request,
            protocol: Protocol::Http11,
            status,
            message: status
                .canonical_reason()
                .unwrap_or("")
                .to_owned(),
            headers: HeaderMap::new(),
            body: None,
            handshake: None,
            prior_response: None,
            cache_response: None,
            network_response: None,
            sent_at_millis: 0,
            received_at_millis: 0,
        }
    }

    /// A builder holding a copy of this response's metadata. The body does
    /// not transfer; reattach one if needed.
    pub fn to_builder(&self) -> ResponseBuilder {
        ResponseBuilder {
            request: self.request.clone(),
            protocol: self.protocol,
            status: self.status,
            message: self.message.clone(),
            headers: self.headers.clone(),
            body: None,
            handshake: self.handshake.clone(),
            prior_response: self.prior_response.as_ref().map(|r| Box::new(r.stripped())),
            cache_response: self.cache_response.as_ref().map(|r| Box::new(r.stripped())),
            network_response: self
                .network_response
                .as_ref()
                .map(|r| Box::new(r.stripped())),
            sent_at_millis: self.sent_at_millis,
            received_at_millis: self.received_at_millis,
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn url(&self) -> &Url {
        self.request.url()
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// The reason phrase from the status line.
    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The first value of `name`, when present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn handshake(&self) -> Option<&Handshake> {
        self.handshake.as_ref()
    }

    /// The response that triggered this one in a redirect or auth chain.
    /// Its body is always stripped.
    pub fn prior_response(&self) -> Option<&Response> {
        self.prior_response.as_deref()
    }

    /// The stored response the cache contributed, body stripped.
    pub fn cache_response(&self) -> Option<&Response> {
        self.cache_response.as_deref()
    }

    /// The raw network response behind this one, body stripped.
    pub fn network_response(&self) -> Option<&Response> {
        self.network_response.as_deref()
    }

    /// When the request producing this response left the client, in Unix
    /// millis. `-1` for responses that never touched the network.
    pub fn sent_at_millis(&self) -> i64 {
        self.sent_at_millis
    }

    /// When the response headers were received, in Unix millis.
    pub fn received_at_millis(&self) -> i64 {
        self.received_at_millis
    }

    pub fn body(&self) -> Option<&ResponseBody> {
        self.body.as_ref()
    }

    pub fn body_mut(&mut self) -> Option<&mut ResponseBody> {
        self.body.as_mut()
    }

    pub(crate) fn take_body(&mut self) -> Option<ResponseBody> {
        self.body.take()
    }

    pub(crate) fn set_body(&mut self, body: Option<ResponseBody>) {
        self.body = body;
    }

    /// Reads the remaining body to completion.
    pub fn bytes(&mut self) -> crate::Result<Bytes> {
        match self.body.take() {
            Some(mut body) => {
                let mut buf = Vec::new();
                body.read_to_end(&mut buf).map_err(Error::io)?;
                Ok(Bytes::from(buf))
            }
            None => Ok(Bytes::new()),
        }
    }

    /// Reads the remaining body as text, replacing invalid UTF-8.
    pub fn text(&mut self) -> crate::Result<String> {
        let bytes = self.bytes()?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Discards the response, dropping any unread body.
    pub fn close(self) {}

    /// A copy with the body removed, for prior/cache/network links.
    pub(crate) fn stripped(&self) -> Response {
        Response {
            request: self.request.clone(),
            protocol: self.protocol,
            status: self.status,
            message: self.message.clone(),
            headers: self.headers.clone(),
            body: None,
            handshake: self.handshake.clone(),
            prior_response: self.prior_response.as_ref().map(|r| Box::new(r.stripped())),
            cache_response: self.cache_response.as_ref().map(|r| Box::new(r.stripped())),
            network_response: self
                .network_response
                .as_ref()
                .map(|r| Box::new(r.stripped())),
            sent_at_millis: self.sent_at_millis,
            received_at_millis: self.received_at_millis,
        }
    }

    /// Whether, per the status line and headers, a body is expected to
    /// follow the headers on the wire.
    pub(crate) fn promises_body(&self) -> bool {
        if self.request.method() == Method::HEAD {
            return false;
        }
        let code = self.status.as_u16();
        if !(100..200).contains(&code) && code != 204 && code != 304 {
            return true;
        }
        self.headers_content_length() != -1 || self.is_chunked()
    }

    pub(crate) fn headers_content_length(&self) -> i64 {
        content_length_of(&self.headers)
    }

    fn is_chunked(&self) -> bool {
        self.header(TRANSFER_ENCODING.as_str())
            .map(|v| v.eq_ignore_ascii_case("chunked"))
            .unwrap_or(false)
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("url", &self.request.url().as_str())
            .field("status", &self.status)
            .field("protocol", &self.protocol)
            .field("headers", &self.headers)
            .finish()
    }
}

pub(crate) fn content_length_of(headers: &HeaderMap) -> i64 {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i64>().ok())
        .unwrap_or(-1)
}

/// Builds a [`Response`].
pub struct ResponseBuilder {
    request: Request,
    protocol: Protocol,
    status: StatusCode,
    message: String,
    headers: HeaderMap,
    body: Option<ResponseBody>,
    handshake: Option<Handshake>,
    prior_response: Option<Box<Response>>,
    cache_response: Option<Box<Response>>,
    network_response: Option<Box<Response>>,
    sent_at_millis: i64,
    received_at_millis: i64,
}

impl ResponseBuilder {
    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn remove_header(mut self, name: &str) -> Self {
        self.headers.remove(name);
        self
    }

    pub fn body(mut self, body: ResponseBody) -> Self {
        self.body = Some(body);
        self
    }

    pub fn handshake(mut self, handshake: Option<Handshake>) -> Self {
        self.handshake = handshake;
        self
    }

    pub fn prior_response(mut self, response: Option<Response>) -> Self {
        self.prior_response = response.map(Box::new);
        self
    }

    pub fn cache_response(mut self, response: Option<Response>) -> Self {
        self.cache_response = response.map(Box::new);
        self
    }

    pub fn network_response(mut self, response: Option<Response>) -> Self {
        self.network_response = response.map(Box::new);
        self
    }

    pub fn request(mut self, request: Request) -> Self {
        self.request = request;
        self
    }

    pub fn sent_at_millis(mut self, millis: i64) -> Self {
        self.sent_at_millis = millis;
        self
    }

    pub fn received_at_millis(mut self, millis: i64) -> Self {
        self.received_at_millis = millis;
        self
    }

    pub fn build(self) -> Response {
        Response {
            request: self.request,
            protocol: self.protocol,
            status: self.status,
            message: self.message,
            headers: self.headers,
            body: self.body,
            handshake: self.handshake,
            prior_response: self.prior_response,
            cache_response: self.cache_response,
            network_response: self.network_response,
            sent_at_millis: self.sent_at_millis,
            received_at_millis: self.received_at_millis,
        }
    }
}

/// A streaming response payload.
pub struct ResponseBody {
    content_length: i64,
    reader: Box<dyn Read + Send>,
}

impl ResponseBody {
    /// A body read from `reader`; `content_length` is `-1` when unknown.
    pub fn new(content_length: i64, reader: impl Read + Send + 'static) -> ResponseBody {
        ResponseBody {
            content_length,
            reader: Box::new(reader),
        }
    }

    pub fn empty() -> ResponseBody {
        ResponseBody::from_bytes(Bytes::new())
    }

    pub fn from_bytes(bytes: Bytes) -> ResponseBody {
        ResponseBody {
            content_length: bytes.len() as i64,
            reader: Box::new(io::Cursor::new(bytes)),
        }
    }

    /// The length promised by the transport, or `-1` when unknown.
    pub fn content_length(&self) -> i64 {
        self.content_length
    }
}

impl Read for ResponseBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseBody")
            .field("content_length", &self.content_length)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(url: &str) -> Request {
        Request::builder().url(url).build().unwrap()
    }

    fn head_request(url: &str) -> Request {
        Request::builder()
            .method(Method::HEAD)
            .url(url)
            .build()
            .unwrap()
    }

    #[test]
    fn reads_body_to_text() {
        let mut response = Response::builder(request("http://example.com/"), StatusCode::OK)
            .body(ResponseBody::from_bytes(Bytes::from_static(b"hello")))
            .build();
        assert_eq!(response.text().unwrap(), "hello");
        // A second read sees an empty body.
        assert_eq!(response.bytes().unwrap(), Bytes::new());
    }

    #[test]
    fn promises_body_rules() {
        let ok = Response::builder(request("http://example.com/"), StatusCode::OK).build();
        assert!(ok.promises_body());

        let head = Response::builder(head_request("http://example.com/"), StatusCode::OK).build();
        assert!(!head.promises_body());

        let not_modified =
            Response::builder(request("http://example.com/"), StatusCode::NOT_MODIFIED).build();
        assert!(!not_modified.promises_body());

        let not_modified_with_len =
            Response::builder(request("http://example.com/"), StatusCode::NOT_MODIFIED)
                .header(CONTENT_LENGTH, HeaderValue::from_static("12"))
                .build();
        assert!(not_modified_with_len.promises_body());
    }

    #[test]
    fn stripped_drops_body_keeps_links() {
        let prior = Response::builder(request("http://example.com/old"), StatusCode::FOUND).build();
        let response = Response::builder(request("http://example.com/"), StatusCode::OK)
            .prior_response(Some(prior))
            .body(ResponseBody::from_bytes(Bytes::from_static(b"x")))
            .build();

        let stripped = response.stripped();
        assert!(stripped.body().is_none());
        assert_eq!(
            stripped.prior_response().unwrap().status(),
            StatusCode::FOUND
        );
    }
}
