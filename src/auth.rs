//! Responding to authentication challenges.

use crate::{request::Request, response::Response, route::Route};

/// Reacts to a `401 Unauthorized` or, for proxy authenticators, a
/// `407 Proxy Authentication Required` challenge.
///
/// Returning a new request (typically the failed request plus an
/// `Authorization` or `Proxy-Authorization` header) retries the call with
/// credentials attached. Returning `None` gives up and surfaces the
/// challenge response to the caller.
///
/// Implementations must not answer a challenge they already answered: when
/// `response.prior_response()` chains contain an attempt with the same
/// credentials, return `None` to avoid looping.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, route: Option<&Route>, response: &Response)
        -> crate::Result<Option<Request>>;
}

/// An authenticator that knows no credentials and never retries.
#[derive(Debug, Default)]
pub struct NoAuth;

impl Authenticator for NoAuth {
    fn authenticate(
        &self,
        _route: Option<&Route>,
        _response: &Response,
    ) -> crate::Result<Option<Request>> {
        Ok(None)
    }
}
