//! Retries failed attempts and follows the responses that demand another
//! request: redirects, auth challenges, misdirects and retryable statuses.

use http::{header::AUTHORIZATION, header::LOCATION, Method, StatusCode};

use super::{Chain, Interceptor};
use crate::{
    error::Error,
    request::{permits_request_body, Request},
    response::Response,
    route::Route,
};

/// A follow-up chain longer than this fails the call: either the server is
/// looping or its configuration is broken. Chrome uses 21, Firefox 20,
/// Safari 16.
const MAX_FOLLOW_UPS: u32 = 20;

pub(crate) struct RetryAndFollowUpInterceptor;

impl Interceptor for RetryAndFollowUpInterceptor {
    fn intercept(&self, chain: &mut Chain<'_>) -> crate::Result<Response> {
        let call = chain.call_inner().clone();
        let result = self.run_loop(chain);
        // On failure the active exchange is beyond saving; on success the
        // response body drains it.
        call.exit_exchange_scope(result.is_err());
        result
    }
}

impl RetryAndFollowUpInterceptor {
    fn run_loop(&self, chain: &mut Chain<'_>) -> crate::Result<Response> {
        let call = chain.call_inner().clone();

        let mut request = chain.request().clone();
        let mut prior_response: Option<Response> = None;
        let mut recovered: Vec<Error> = Vec::new();
        let mut follow_up_count: u32 = 0;
        let mut new_finder = true;

        loop {
            call.enter_exchange_scope(&request, new_finder)?;

            if call.is_canceled() {
                return Err(Error::canceled().with_suppressed(recovered));
            }

            let mut response = match chain.proceed(request.clone()) {
                Ok(response) => response,
                Err(e) => {
                    // Connect-phase failures never started sending; other
                    // I/O failures did unless the peer shut down first.
                    let request_send_started = !e.is_connect() && !e.is_shutdown();
                    if !self.recover(&call, &request, &e, request_send_started) {
                        return Err(e.with_suppressed(recovered));
                    }
                    log::debug!("recovering from attempt failure: {e}");
                    recovered.push(e);
                    new_finder = false;
                    continue;
                }
            };

            if call.is_canceled() {
                response.close();
                return Err(Error::canceled().with_suppressed(recovered));
            }

            // Attach the chain of earlier hops, bodies stripped.
            if let Some(prior) = prior_response.take() {
                let body = response.take_body();
                let mut linked = response.to_builder().prior_response(Some(prior)).build();
                linked.set_body(body);
                response = linked;
            }

            let exchange = call.exchange();
            let follow_up = self.follow_up_request(&call, &response, exchange.as_ref())?;

            let Some(follow_up) = follow_up else {
                return Ok(response);
            };

            // A one-shot body cannot be sent a second time.
            if follow_up
                .body()
                .map(|body| body.is_one_shot())
                .unwrap_or(false)
            {
                return Ok(response);
            }

            follow_up_count += 1;
            if follow_up_count > MAX_FOLLOW_UPS {
                return Err(Error::protocol(format!(
                    "too many follow-up requests: {follow_up_count}"
                ))
                .with_suppressed(recovered));
            }

            log::debug!(
                "following up {} {} with {} {}",
                response.status().as_u16(),
                response.url(),
                follow_up.method(),
                follow_up.url()
            );

            prior_response = Some(response.stripped());
            response.close();
            request = follow_up;
        }
    }

    /// Whether the failed attempt may be transparently retried on another
    /// connection.
    fn recover(
        &self,
        call: &crate::call::CallInner,
        request: &Request,
        e: &Error,
        request_send_started: bool,
    ) -> bool {
        if !call.client().retry_on_connection_failure() {
            return false;
        }

        // A body that can only be written once is gone once sending began.
        if request_send_started
            && request
                .body()
                .map(|body| body.is_one_shot())
                .unwrap_or(false)
        {
            return false;
        }

        if !is_recoverable(e, request_send_started) {
            return false;
        }

        // No point retrying without somewhere else to go.
        call.retry_after_failure()
    }

    fn follow_up_request(
        &self,
        call: &crate::call::CallInner,
        response: &Response,
        exchange: Option<&std::sync::Arc<crate::connection::Exchange>>,
    ) -> crate::Result<Option<Request>> {
        let client = call.client();
        let route: Option<Route> = exchange.map(|e| e.connection().route().clone());

        match response.status().as_u16() {
            407 => {
                let Some(route) = &route else {
                    return Err(Error::protocol(
                        "received 407 from an origin without a proxy",
                    ));
                };
                if route.proxy().is_direct() {
                    return Err(Error::protocol(
                        "received 407 from an origin without a proxy",
                    ));
                }
                client
                    .proxy_authenticator()
                    .authenticate(Some(route), response)
            }
            401 => client.authenticator().authenticate(route.as_ref(), response),
            307 | 308 => {
                // Temporary/permanent redirects only auto-follow when the
                // method is safe to repeat verbatim.
                if !matches!(*response.request().method(), Method::GET | Method::HEAD) {
                    return Ok(None);
                }
                self.build_redirect(call, response)
            }
            300 | 301 | 302 | 303 => self.build_redirect(call, response),
            408 => {
                // A rare server asking the client to just try again.
                if !client.retry_on_connection_failure() {
                    return Ok(None);
                }
                if response
                    .request()
                    .body()
                    .map(|b| b.is_one_shot())
                    .unwrap_or(false)
                {
                    return Ok(None);
                }
                if response
                    .prior_response()
                    .map(|p| p.status() == StatusCode::REQUEST_TIMEOUT)
                    .unwrap_or(false)
                {
                    return Ok(None);
                }
                if retry_after_seconds(response, 0) > 0 {
                    return Ok(None);
                }
                Ok(Some(response.request().clone()))
            }
            503 => {
                if response
                    .prior_response()
                    .map(|p| p.status() == StatusCode::SERVICE_UNAVAILABLE)
                    .unwrap_or(false)
                {
                    return Ok(None);
                }
                // Only the literal "Retry-After: 0" merits an immediate
                // retry.
                if retry_after_seconds(response, i64::MAX) == 0 {
                    return Ok(Some(response.request().clone()));
                }
                Ok(None)
            }
            421 => {
                if response
                    .request()
                    .body()
                    .map(|b| b.is_one_shot())
                    .unwrap_or(false)
                {
                    return Ok(None);
                }
                let Some(exchange) = exchange else {
                    return Ok(None);
                };
                if !exchange.is_coalesced(response.request().url()) {
                    return Ok(None);
                }
                // The peer cannot serve this hostname after all; stop
                // coalescing onto that connection and try a dedicated one.
                exchange.connection().no_coalesced_exchanges();
                Ok(Some(response.request().clone()))
            }
            _ => Ok(None),
        }
    }

    fn build_redirect(
        &self,
        call: &crate::call::CallInner,
        response: &Response,
    ) -> crate::Result<Option<Request>> {
        let client = call.client();
        if !client.follow_redirects() {
            return Ok(None);
        }

        let Some(location) = response.header(LOCATION.as_str()) else {
            return Ok(None);
        };
        // Resolve relative to the responding URL.
        let Ok(target) = response.request().url().join(location) else {
            return Ok(None);
        };

        // A redirect off the web is returned to the caller, not followed.
        if !matches!(target.scheme(), "http" | "https") {
            return Ok(None);
        }

        // http<->https transitions have their own opt-out.
        if target.scheme() != response.request().url().scheme()
            && !client.follow_tls_redirects()
        {
            return Ok(None);
        }

        let request = response.request();
        let mut builder = request.to_builder().url(target.clone());

        if permits_request_body(request.method()) {
            // Everything except PROPFIND is rewritten to a bodyless GET.
            if request.method().as_str() != "PROPFIND" {
                builder = builder
                    .method(Method::GET)
                    .no_body()
                    .remove_header("transfer-encoding")
                    .remove_header("content-length")
                    .remove_header("content-type");
            }
        }

        // Credentials do not travel to another host.
        if !request.is_same_origin(&target) {
            builder = builder.remove_header(AUTHORIZATION.as_str());
        }

        Ok(Some(builder.build()?))
    }
}

fn is_recoverable(e: &Error, request_send_started: bool) -> bool {
    if e.is_protocol() || e.is_canceled() {
        return false;
    }

    // Timeouts only retry when nothing was sent: a fresh route gets a fresh
    // connect budget, but a stalled exchange is not safe to replay.
    if e.is_timeout() && !e.is_connect() {
        return !request_send_started;
    }

    // Certificate problems will fail the same way on every route.
    if e.is_certificate_rejection() {
        return false;
    }

    true
}

/// Parses `Retry-After` as whole seconds; anything non-numeric counts as
/// `unset`.
fn retry_after_seconds(response: &Response, unset: i64) -> i64 {
    match response.header("retry-after") {
        Some(value) if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) => {
            value.parse().unwrap_or(i64::MAX)
        }
        Some(_) => i64::MAX,
        None => unset,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::ResponseBody;

    fn response_with(status: u16, headers: &[(&'static str, &'static str)]) -> Response {
        let request = Request::builder().url("http://a.example/x").build().unwrap();
        let mut builder = Response::builder(request, StatusCode::from_u16(status).unwrap())
            .body(ResponseBody::empty());
        for (name, value) in headers {
            builder = builder.header(
                http::header::HeaderName::from_static(name),
                http::HeaderValue::from_static(value),
            );
        }
        builder.build()
    }

    #[test]
    fn retry_after_parsing() {
        assert_eq!(retry_after_seconds(&response_with(503, &[]), i64::MAX), i64::MAX);
        assert_eq!(
            retry_after_seconds(&response_with(503, &[("retry-after", "0")]), i64::MAX),
            0
        );
        assert_eq!(
            retry_after_seconds(&response_with(503, &[("retry-after", "30")]), 0),
            30
        );
        assert_eq!(
            retry_after_seconds(
                &response_with(503, &[("retry-after", "Fri, 01 Jan 2027 00:00:00 GMT")]),
                0
            ),
            i64::MAX
        );
    }

    #[test]
    fn recoverability_classification() {
        assert!(!is_recoverable(&Error::protocol("bad frame"), false));
        assert!(!is_recoverable(&Error::canceled(), false));
        assert!(!is_recoverable(&Error::pinning("pin mismatch"), false));

        // Connect failures retry; mid-stream read timeouts do not.
        assert!(is_recoverable(
            &Error::connect(crate::error::TimedOut),
            false
        ));
        assert!(!is_recoverable(
            &Error::io(std::io::Error::from(std::io::ErrorKind::TimedOut)),
            true
        ));

        // A peer shutdown before sending is as good as never started.
        assert!(is_recoverable(&Error::shutdown("goaway"), false));
        assert!(is_recoverable(
            &Error::io(std::io::Error::from(std::io::ErrorKind::ConnectionReset)),
            true
        ));
    }
}
