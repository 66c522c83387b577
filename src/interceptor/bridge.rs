//! Bridges application requests to network requests: fills in the headers
//! every request needs, carries cookies both ways, and transparently
//! decompresses gzip bodies it asked for.

use std::sync::Arc;

use flate2::read::GzDecoder;
use http::header::{
    HeaderValue, ACCEPT_ENCODING, CONNECTION, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE,
    COOKIE, HOST, RANGE, SET_COOKIE, TRANSFER_ENCODING, USER_AGENT,
};
use url::Url;

use super::{Chain, Interceptor};
use crate::{cookie::CookieStore, response::Response, response::ResponseBody};

pub(crate) struct BridgeInterceptor {
    pub(crate) cookie_store: Option<Arc<dyn CookieStore>>,
    pub(crate) user_agent: String,
}

impl Interceptor for BridgeInterceptor {
    fn intercept(&self, chain: &mut Chain<'_>) -> crate::Result<Response> {
        let user_request = chain.request().clone();
        let mut builder = user_request.to_builder();

        if let Some(body) = user_request.body() {
            if user_request.headers().get(CONTENT_TYPE).is_none() {
                if let Some(content_type) = body.content_type() {
                    builder = builder.set_header(CONTENT_TYPE, content_type.clone());
                }
            }
            match body.content_length() {
                Some(length) => {
                    if user_request.headers().get(CONTENT_LENGTH).is_none() {
                        builder = builder.set_header(
                            CONTENT_LENGTH,
                            HeaderValue::from_str(&length.to_string())
                                .expect("lengths are valid header values"),
                        );
                    }
                    builder = builder.remove_header(TRANSFER_ENCODING.as_str());
                }
                None => {
                    builder =
                        builder.set_header(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
                    builder = builder.remove_header(CONTENT_LENGTH.as_str());
                }
            }
        }

        if user_request.headers().get(HOST).is_none() {
            if let Ok(host) = HeaderValue::from_str(&host_header(user_request.url())) {
                builder = builder.set_header(HOST, host);
            }
        }

        if user_request.headers().get(CONNECTION).is_none() {
            builder = builder.set_header(CONNECTION, HeaderValue::from_static("Keep-Alive"));
        }

        // Ask for gzip on the application's behalf, and remember that the
        // response needs unwrapping before the application sees it.
        let mut transparent_gzip = false;
        if user_request.headers().get(ACCEPT_ENCODING).is_none()
            && user_request.headers().get(RANGE).is_none()
        {
            transparent_gzip = true;
            builder = builder.set_header(ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
        }

        if let Some(store) = &self.cookie_store {
            if let Some(cookies) = store.cookies(user_request.url()) {
                builder = builder.set_header(COOKIE, cookies);
            }
        }

        if user_request.headers().get(USER_AGENT).is_none() {
            if let Ok(agent) = HeaderValue::from_str(&self.user_agent) {
                builder = builder.set_header(USER_AGENT, agent);
            }
        }

        let mut network_response = chain.proceed(builder.build()?)?;

        if let Some(store) = &self.cookie_store {
            let mut headers = network_response.headers().get_all(SET_COOKIE).iter();
            store.set_cookies(&mut headers, user_request.url());
        }

        let gzipped = transparent_gzip
            && network_response
                .header(CONTENT_ENCODING.as_str())
                .map(|v| v.eq_ignore_ascii_case("gzip"))
                .unwrap_or(false)
            && network_response.promises_body();

        let body = network_response.take_body();
        let mut builder = network_response.to_builder().request(user_request);
        if gzipped {
            builder = builder
                .remove_header(CONTENT_ENCODING.as_str())
                .remove_header(CONTENT_LENGTH.as_str());
        }
        let mut response = builder.build();
        response.set_body(match (gzipped, body) {
            (true, Some(body)) => Some(ResponseBody::new(-1, GzDecoder::new(body))),
            (_, body) => body,
        });

        Ok(response)
    }
}

/// `host[:port]`, omitting the scheme's default port.
fn host_header(url: &Url) -> String {
    let host = url.host_str().unwrap_or("");
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_owned(),
    }
}
