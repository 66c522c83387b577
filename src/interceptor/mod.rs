//! The interceptor pipeline.
//!
//! A call's work is a linear chain: application interceptors, retry and
//! follow-up handling, header bridging, the cache, connection acquisition,
//! network interceptors, and finally the exchange itself. Each stage sees
//! the request on the way in and the response on the way out, and may
//! rewrite either.

pub(crate) mod bridge;
pub(crate) mod cache;
pub(crate) mod call_server;
pub(crate) mod connect;
pub(crate) mod retry;

use std::sync::Arc;

use crate::{
    call::{Call, CallInner},
    connection::Exchange,
    request::Request,
    response::Response,
};

/// A single stage of the pipeline.
///
/// Implementations observe the request via [`Chain::request`], forward it
/// (possibly rewritten) with [`Chain::proceed`], and return a response,
/// which may or may not be the one `proceed` produced.
pub trait Interceptor: Send + Sync {
    fn intercept(&self, chain: &mut Chain<'_>) -> crate::Result<Response>;
}

/// A position in the pipeline, carrying the request as rewritten so far.
pub struct Chain<'a> {
    call: &'a Arc<CallInner>,
    interceptors: &'a [Arc<dyn Interceptor>],
    index: usize,
    exchange: Option<Arc<Exchange>>,
    request: Request,
    calls: u32,
}

impl<'a> Chain<'a> {
    pub(crate) fn new(
        call: &'a Arc<CallInner>,
        interceptors: &'a [Arc<dyn Interceptor>],
        request: Request,
    ) -> Chain<'a> {
        Chain {
            call,
            interceptors,
            index: 0,
            exchange: None,
            request,
            calls: 0,
        }
    }

    /// The request as rewritten by the stages before this one.
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// The call this chain belongs to.
    pub fn call(&self) -> Call {
        Call::from_inner(self.call.clone())
    }

    pub(crate) fn call_inner(&self) -> &Arc<CallInner> {
        self.call
    }

    pub(crate) fn exchange(&self) -> Option<&Arc<Exchange>> {
        self.exchange.as_ref()
    }

    /// Attaches the exchange the rest of the chain will run on. Only the
    /// connect stage does this.
    pub(crate) fn set_exchange(&mut self, exchange: Arc<Exchange>) {
        self.exchange = Some(exchange);
    }

    /// Invokes the next interceptor with `request`.
    ///
    /// Once an exchange is attached, the contract tightens: each stage must
    /// call `proceed` exactly once, must not change the request's host or
    /// port out from under the connection, and must produce a response with
    /// a body. Violations are programming errors and panic.
    pub fn proceed(&mut self, request: Request) -> crate::Result<Response> {
        assert!(
            self.index < self.interceptors.len(),
            "chain ran past the final interceptor"
        );

        self.calls += 1;
        if let Some(exchange) = &self.exchange {
            assert!(
                self.calls == 1,
                "interceptor {} must call proceed() exactly once",
                self.index.saturating_sub(1)
            );
            assert!(
                exchange.connection().supports_url(request.url()),
                "network interceptor {} must retain the same host and port",
                self.index.saturating_sub(1)
            );
        }

        let mut next = Chain {
            call: self.call,
            interceptors: self.interceptors,
            index: self.index + 1,
            exchange: self.exchange.clone(),
            request,
            calls: 0,
        };

        let interceptor = &self.interceptors[self.index];
        let response = interceptor.intercept(&mut next)?;

        if next.exchange.is_some() {
            if next.index < next.interceptors.len() {
                assert!(
                    next.calls == 1,
                    "network interceptor {} must call proceed() exactly once",
                    self.index
                );
            }
            assert!(
                response.body().is_some(),
                "interceptor {} returned a response with no body",
                self.index
            );
        }

        Ok(response)
    }
}
