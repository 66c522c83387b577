//! The stored form of a cached response: a line-oriented UTF-8 metadata
//! stream, separate from the body stream.

use std::collections::HashSet;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use http::{
    header::{HeaderName, HeaderValue, VARY},
    HeaderMap, Method, StatusCode,
};

use crate::{
    error::Error,
    protocol::Protocol,
    request::Request,
    response::{Response, ResponseBody},
    tls::{Certificate, CipherSuite, Handshake, TlsVersion},
};

const SENT_MILLIS: &str = "Courier-Sent-Millis";
const RECEIVED_MILLIS: &str = "Courier-Received-Millis";

/// True when the response's `Vary` names `*`, which no request can match.
pub(crate) fn has_vary_all(response_headers: &HeaderMap) -> bool {
    vary_fields(response_headers).contains("*")
}

/// The header names listed in `Vary`, lowercased.
pub(crate) fn vary_fields(response_headers: &HeaderMap) -> HashSet<String> {
    let mut fields = HashSet::new();
    for value in response_headers.get_all(VARY) {
        let Ok(value) = value.to_str() else { continue };
        for field in value.split(',') {
            fields.insert(field.trim().to_ascii_lowercase());
        }
    }
    fields
}

/// The request headers a response's `Vary` selects, as stored alongside the
/// entry to key it beyond the URL.
pub(crate) fn vary_headers(request: &Request, response_headers: &HeaderMap) -> HeaderMap {
    let mut selected = HeaderMap::new();
    for field in vary_fields(response_headers) {
        if field == "*" {
            continue;
        }
        let Ok(name) = HeaderName::try_from(field.as_str()) else {
            continue;
        };
        for value in request.headers().get_all(&name) {
            selected.append(name.clone(), value.clone());
        }
    }
    selected
}

fn values<'h>(headers: &'h HeaderMap, name: &HeaderName) -> Vec<&'h HeaderValue> {
    headers.get_all(name).iter().collect()
}

/// Whether `request` selects the same `Vary` dimension the entry was stored
/// under.
pub(crate) fn vary_matches(
    response_headers: &HeaderMap,
    cached_vary: &HeaderMap,
    request: &Request,
) -> bool {
    for field in vary_fields(response_headers) {
        if field == "*" {
            return false;
        }
        let Ok(name) = HeaderName::try_from(field.as_str()) else {
            return false;
        };
        if values(cached_vary, &name) != values(request.headers(), &name) {
            return false;
        }
    }
    true
}

/// One cached response, body excluded.
pub(crate) struct Entry {
    url: String,
    request_method: String,
    vary_headers: HeaderMap,
    protocol: Protocol,
    status: StatusCode,
    message: String,
    response_headers: HeaderMap,
    handshake: Option<Handshake>,
    sent_millis: i64,
    received_millis: i64,
}

impl Entry {
    pub(crate) fn from_response(response: &Response) -> Entry {
        Entry {
            url: response.request().url().as_str().to_owned(),
            request_method: response.request().method().as_str().to_owned(),
            vary_headers: vary_headers(response.request(), response.headers()),
            protocol: response.protocol(),
            status: response.status(),
            message: response.message().to_owned(),
            response_headers: response.headers().clone(),
            handshake: response.handshake().cloned(),
            sent_millis: response.sent_at_millis(),
            received_millis: response.received_at_millis(),
        }
    }

    fn is_https(&self) -> bool {
        self.url.starts_with("https://")
    }

    pub(crate) fn matches(&self, request: &Request) -> bool {
        self.url == request.url().as_str()
            && self.request_method == request.method().as_str()
            && vary_matches(&self.response_headers, &self.vary_headers, request)
    }

    /// Rebuilds the cached response around `body`.
    pub(crate) fn to_response(&self, body: ResponseBody) -> crate::Result<Response> {
        let method = Method::from_bytes(self.request_method.as_bytes())
            .map_err(|e| Error::cache(format!("bad cached method: {e}")))?;
        let request = Request::builder()
            .method(method)
            .url(self.url.as_str())
            .headers(self.vary_headers.clone())
            .build()?;

        Ok(Response::builder(request, self.status)
            .protocol(self.protocol)
            .message(self.message.clone())
            .headers(self.response_headers.clone())
            .handshake(self.handshake.clone())
            .body(body)
            .sent_at_millis(self.sent_millis)
            .received_at_millis(self.received_millis)
            .build())
    }

    pub(crate) fn to_bytes(&self) -> Bytes {
        let mut out = String::new();
        out.push_str(&self.url);
        out.push('\n');
        out.push_str(&self.request_method);
        out.push('\n');

        out.push_str(&self.vary_headers.len().to_string());
        out.push('\n');
        for (name, value) in &self.vary_headers {
            out.push_str(name.as_str());
            out.push_str(": ");
            out.push_str(&String::from_utf8_lossy(value.as_bytes()));
            out.push('\n');
        }

        let version = match self.protocol {
            Protocol::Http10 => "HTTP/1.0",
            _ => "HTTP/1.1",
        };
        out.push_str(&format!(
            "{version} {} {}\n",
            self.status.as_u16(),
            self.message
        ));

        out.push_str(&(self.response_headers.len() + 2).to_string());
        out.push('\n');
        for (name, value) in &self.response_headers {
            out.push_str(name.as_str());
            out.push_str(": ");
            out.push_str(&String::from_utf8_lossy(value.as_bytes()));
            out.push('\n');
        }
        out.push_str(&format!("{SENT_MILLIS}: {}\n", self.sent_millis));
        out.push_str(&format!("{RECEIVED_MILLIS}: {}\n", self.received_millis));

        if self.is_https() {
            out.push('\n');
            // The handshake block only exists for https entries; a missing
            // one round-trips as an empty handshake, which the strategy
            // layer refuses to serve.
            match &self.handshake {
                Some(handshake) => {
                    out.push_str(handshake.cipher_suite().as_str());
                    out.push('\n');
                    write_certificates(&mut out, handshake.peer_certificates());
                    write_certificates(&mut out, handshake.local_certificates());
                    out.push_str(handshake.tls_version().as_str());
                    out.push('\n');
                }
                None => {
                    out.push('\n');
                    out.push_str("-1\n-1\n");
                }
            }
        }

        Bytes::from(out)
    }

    pub(crate) fn read(data: &[u8]) -> crate::Result<Entry> {
        let text =
            std::str::from_utf8(data).map_err(|_| Error::cache("metadata is not UTF-8"))?;
        let mut lines = Lines {
            inner: text.split('\n'),
        };

        let url = lines.next_line()?.to_owned();
        let request_method = lines.next_line()?.to_owned();

        let vary_count: usize = lines
            .next_line()?
            .parse()
            .map_err(|_| Error::cache("bad vary count"))?;
        let mut vary_headers = HeaderMap::new();
        for _ in 0..vary_count {
            let (name, value) = parse_header_line(lines.next_line()?)?;
            vary_headers.append(name, value);
        }

        let status_line = lines.next_line()?;
        let mut parts = status_line.splitn(3, ' ');
        let version = parts
            .next()
            .ok_or_else(|| Error::cache("bad status line"))?;
        let protocol = if version == "HTTP/1.0" {
            Protocol::Http10
        } else {
            Protocol::Http11
        };
        let status = parts
            .next()
            .and_then(|code| code.parse::<u16>().ok())
            .and_then(|code| StatusCode::from_u16(code).ok())
            .ok_or_else(|| Error::cache("bad status code"))?;
        let message = parts.next().unwrap_or("").to_owned();

        let header_count: usize = lines
            .next_line()?
            .parse()
            .map_err(|_| Error::cache("bad header count"))?;
        if header_count < 2 {
            return Err(Error::cache("missing timestamp headers"));
        }
        let mut response_headers = HeaderMap::new();
        let mut sent_millis = 0;
        let mut received_millis = 0;
        for _ in 0..header_count {
            let line = lines.next_line()?;
            if let Some(value) = line.strip_prefix(&format!("{SENT_MILLIS}: ")) {
                sent_millis = value
                    .parse()
                    .map_err(|_| Error::cache("bad sent timestamp"))?;
            } else if let Some(value) = line.strip_prefix(&format!("{RECEIVED_MILLIS}: ")) {
                received_millis = value
                    .parse()
                    .map_err(|_| Error::cache("bad received timestamp"))?;
            } else {
                let (name, value) = parse_header_line(line)?;
                response_headers.append(name, value);
            }
        }

        let handshake = if url.starts_with("https://") {
            let blank = lines.next_line()?;
            if !blank.is_empty() {
                return Err(Error::cache("expected blank line before handshake"));
            }
            let cipher_suite = CipherSuite::from_name(lines.next_line()?);
            let peer_certificates = read_certificates(&mut lines)?;
            let local_certificates = read_certificates(&mut lines)?;
            // The TLS version line is optional in old entries.
            let tls_version = match lines.inner.next() {
                Some(name) if !name.is_empty() => TlsVersion::parse(name)?,
                _ => TlsVersion::Ssl30,
            };
            Some(Handshake::new(
                tls_version,
                cipher_suite,
                peer_certificates,
                local_certificates,
            ))
        } else {
            None
        };

        Ok(Entry {
            url,
            request_method,
            vary_headers,
            protocol,
            status,
            message,
            response_headers,
            handshake,
            sent_millis,
            received_millis,
        })
    }
}

fn write_certificates(out: &mut String, certificates: &[Certificate]) {
    if certificates.is_empty() {
        out.push_str("-1\n");
        return;
    }
    out.push_str(&certificates.len().to_string());
    out.push('\n');
    for certificate in certificates {
        out.push_str(&BASE64.encode(certificate.der()));
        out.push('\n');
    }
}

struct Lines<'a> {
    inner: std::str::Split<'a, char>,
}

impl<'a> Lines<'a> {
    fn next_line(&mut self) -> crate::Result<&'a str> {
        self.inner
            .next()
            .ok_or_else(|| Error::cache("truncated metadata"))
    }
}

fn read_certificates(lines: &mut Lines<'_>) -> crate::Result<Vec<Certificate>> {
    let count: i64 = lines
        .next_line()?
        .parse()
        .map_err(|_| Error::cache("bad certificate count"))?;
    if count <= 0 {
        return Ok(Vec::new());
    }
    let mut certificates = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let der = BASE64
            .decode(lines.next_line()?)
            .map_err(|_| Error::cache("bad certificate encoding"))?;
        certificates.push(Certificate::from_der(der));
    }
    Ok(certificates)
}

fn parse_header_line(line: &str) -> crate::Result<(HeaderName, HeaderValue)> {
    let (name, value) = line
        .split_once(": ")
        .ok_or_else(|| Error::cache("bad header line"))?;
    let name = HeaderName::try_from(name).map_err(|_| Error::cache("bad header name"))?;
    let value = HeaderValue::from_str(value).map_err(|_| Error::cache("bad header value"))?;
    Ok((name, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(url: &str, headers: &[(&'static str, &'static str)]) -> Request {
        let mut builder = Request::builder().url(url);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.build().unwrap()
    }

    fn response(url: &str, headers: &[(&'static str, &'static str)]) -> Response {
        response_for(request(url, &[("accept-language", "de")]), headers)
    }

    fn response_for(request: Request, headers: &[(&'static str, &'static str)]) -> Response {
        let mut builder = Response::builder(request, StatusCode::OK)
            .message("OK")
            .sent_at_millis(1000)
            .received_at_millis(2000);
        for (name, value) in headers {
            builder = builder.header(
                HeaderName::from_static(name),
                HeaderValue::from_static(value),
            );
        }
        builder.build()
    }

    #[test]
    fn metadata_round_trip() {
        let response = response(
            "http://example.com/a",
            &[("content-type", "text/plain"), ("etag", "\"v1\"")],
        );
        let entry = Entry::from_response(&response);
        let bytes = entry.to_bytes();

        let revived = Entry::read(&bytes).unwrap();
        assert_eq!(revived.url, "http://example.com/a");
        assert_eq!(revived.request_method, "GET");
        assert_eq!(revived.status, StatusCode::OK);
        assert_eq!(revived.message, "OK");
        assert_eq!(revived.sent_millis, 1000);
        assert_eq!(revived.received_millis, 2000);
        assert_eq!(
            revived.response_headers.get("etag").unwrap(),
            &HeaderValue::from_static("\"v1\"")
        );

        let rebuilt = revived.to_response(ResponseBody::empty()).unwrap();
        assert_eq!(rebuilt.header("content-type"), Some("text/plain"));
        assert_eq!(rebuilt.sent_at_millis(), 1000);
    }

    #[test]
    fn https_round_trip_keeps_handshake() {
        let handshake = Handshake::new(
            TlsVersion::Tls13,
            CipherSuite::from_name("TLS_AES_128_GCM_SHA256"),
            vec![Certificate::from_der(&b"peer-der"[..])],
            vec![],
        );
        let base = response_for(
            request("https://example.com/a", &[]),
            &[("content-type", "text/plain")],
        );
        let mut builder = base.to_builder().handshake(Some(handshake.clone()));
        builder = builder.body(ResponseBody::empty());
        let response = builder.build();

        let entry = Entry::from_response(&response);
        let revived = Entry::read(&entry.to_bytes()).unwrap();
        let revived_handshake = revived.handshake.as_ref().unwrap();
        assert_eq!(revived_handshake.tls_version(), TlsVersion::Tls13);
        assert_eq!(
            revived_handshake.cipher_suite(),
            &CipherSuite::from_name("TLS_AES_128_GCM_SHA256")
        );
        assert_eq!(
            revived_handshake.peer_certificates()[0].der().as_ref(),
            b"peer-der"
        );
    }

    #[test]
    fn missing_tls_version_defaults_to_ssl3() {
        let handshake = Handshake::new(
            TlsVersion::Tls12,
            CipherSuite::from_name("TLS_AES_128_GCM_SHA256"),
            vec![],
            vec![],
        );
        let base = response_for(request("https://example.com/a", &[]), &[]);
        let response = base.to_builder().handshake(Some(handshake)).build();
        let bytes = Entry::from_response(&response).to_bytes();

        // Drop the trailing version line, as written by older caches.
        let text = std::str::from_utf8(&bytes).unwrap();
        let trimmed = text
            .strip_suffix("TLSv1.2\n")
            .expect("version line is last");
        let revived = Entry::read(trimmed.as_bytes()).unwrap();
        assert_eq!(
            revived.handshake.unwrap().tls_version(),
            TlsVersion::Ssl30
        );
    }

    #[test]
    fn vary_dimension_must_match() {
        let req = request("http://example.com/a", &[("accept-language", "de")]);
        let stored = response_for(
            req.clone(),
            &[("vary", "Accept-Language"), ("content-type", "text/plain")],
        );
        let entry = Entry::from_response(&stored);

        assert!(entry.matches(&req));

        let other_language = request("http://example.com/a", &[("accept-language", "fr")]);
        assert!(!entry.matches(&other_language));

        let missing_header = request("http://example.com/a", &[]);
        assert!(!entry.matches(&missing_header));

        // Round-trip keeps the vary dimension.
        let revived = Entry::read(&entry.to_bytes()).unwrap();
        assert!(revived.matches(&req));
        assert!(!revived.matches(&other_language));
    }

    #[test]
    fn vary_star_never_matches() {
        let req = request("http://example.com/a", &[]);
        let stored = response_for(req.clone(), &[("vary", "*")]);
        assert!(has_vary_all(stored.headers()));
        let entry = Entry::from_response(&stored);
        assert!(!entry.matches(&req));
    }

    #[test]
    fn method_and_url_must_match() {
        let req = request("http://example.com/a", &[]);
        let entry = Entry::from_response(&response_for(req.clone(), &[]));
        assert!(entry.matches(&req));
        assert!(!entry.matches(&request("http://example.com/b", &[])));
    }

    #[test]
    fn truncated_metadata_is_an_error() {
        assert!(Entry::read(b"http://example.com/a\nGET\n").is_err());
        assert!(Entry::read(b"not even close").is_err());
    }
}
