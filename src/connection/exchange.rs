use std::{
    io::{self, Read},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use url::Url;

use crate::{
    body::Body,
    call::CallInner,
    connection::{finder::FailureStats, Connection},
    error::Error,
    request::Request,
    response::ResponseBody,
    sync::Mutex,
    transport::{CancelToken, ExchangeCodec, ResponseHead},
};

/// One request/response pair riding a connection: an HTTP/1.1 cycle or an
/// HTTP/2 stream. Completes when both directions finish; failure or early
/// abandonment reports damage to the connection and the finder.
pub(crate) struct Exchange {
    call: Arc<CallInner>,
    connection: Arc<Connection>,
    codec: Mutex<Box<dyn ExchangeCodec>>,
    cancel_token: CancelToken,
    stats: Arc<FailureStats>,
    request_done: AtomicBool,
    response_done: AtomicBool,
    completed: AtomicBool,
}

impl Exchange {
    pub(crate) fn new(
        call: Arc<CallInner>,
        connection: Arc<Connection>,
        codec: Box<dyn ExchangeCodec>,
        cancel_token: CancelToken,
        stats: Arc<FailureStats>,
    ) -> Exchange {
        Exchange {
            call,
            connection,
            codec: Mutex::new(codec),
            cancel_token,
            stats,
            request_done: AtomicBool::new(false),
            response_done: AtomicBool::new(false),
            completed: AtomicBool::new(false),
        }
    }

    pub(crate) fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// True when this exchange rode a connection established for another
    /// hostname (HTTP/2 coalescing).
    pub(crate) fn is_coalesced(&self, url: &Url) -> bool {
        let connected_host = self.connection.route().address().host();
        url.host_str()
            .map(|host| !host.eq_ignore_ascii_case(connected_host))
            .unwrap_or(false)
    }

    pub(crate) fn write_request_headers(&self, request: &Request) -> crate::Result<()> {
        self.guard(|codec| codec.write_request_headers(request))
    }

    pub(crate) fn write_request_body(&self, body: &Body) -> crate::Result<()> {
        self.guard(|codec| codec.write_request_body(body))
    }

    pub(crate) fn finish_request(&self) -> crate::Result<()> {
        let result = self.guard(|codec| codec.finish_request());
        if result.is_ok() {
            self.request_done.store(true, Ordering::SeqCst);
            self.maybe_complete(true);
        }
        result
    }

    pub(crate) fn read_response_headers(
        &self,
        expect_continue: bool,
    ) -> crate::Result<Option<ResponseHead>> {
        self.guard(|codec| codec.read_response_headers(expect_continue))
    }

    /// Opens the response body; reading it to the end (or dropping it)
    /// completes this exchange.
    pub(crate) fn open_response_body(exchange: &Arc<Exchange>) -> crate::Result<ResponseBody> {
        let (content_length, reader) = exchange.guard(|codec| codec.open_response_body())?;
        Ok(ResponseBody::new(
            content_length,
            ExchangeBody {
                exchange: exchange.clone(),
                inner: reader,
                done: false,
            },
        ))
    }

    /// Completes the response half without a body (a 304, a HEAD, an empty
    /// cache-validating reply).
    pub(crate) fn no_response_body(&self) {
        self.response_done.store(true, Ordering::SeqCst);
        self.maybe_complete(true);
    }

    /// Tears the exchange down from any thread. A multiplexed transport
    /// resets just this stream when it next polls the token; a serial
    /// connection is exclusively ours, so its socket goes too.
    pub(crate) fn cancel(&self) {
        self.cancel_token.cancel();
        if !self.connection.is_multiplexed() {
            self.connection.no_new_exchanges();
            self.connection.cancel();
        }
    }

    fn guard<T>(
        &self,
        f: impl FnOnce(&mut Box<dyn ExchangeCodec>) -> crate::Result<T>,
    ) -> crate::Result<T> {
        let result = f(&mut self.codec.lock());
        if let Err(e) = &result {
            self.note_failure(e);
        }
        result
    }

    /// Records damage from `error` and completes the exchange as failed.
    pub(crate) fn note_failure(&self, error: &Error) {
        if !error.is_canceled() {
            self.stats.record(error);
            self.connection.track_failure(error);
        }
        self.maybe_complete(false);
    }

    fn response_body_finished(&self, ok: bool) {
        self.response_done.store(true, Ordering::SeqCst);
        self.maybe_complete(ok);
    }

    fn maybe_complete(&self, ok: bool) {
        let finished = !ok
            || (self.request_done.load(Ordering::SeqCst)
                && self.response_done.load(Ordering::SeqCst));
        if !finished {
            return;
        }
        if self.completed.swap(true, Ordering::SeqCst) {
            return;
        }
        if ok {
            self.connection.note_success();
        }
        self.call.exchange_finished(self, ok);
    }
}

/// Streams a response body while keeping its exchange alive; end-of-stream
/// completes the exchange, and dropping the body early abandons it, which
/// poisons a serial connection.
struct ExchangeBody {
    exchange: Arc<Exchange>,
    inner: Box<dyn Read + Send>,
    done: bool,
}

impl Read for ExchangeBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.done {
            return Ok(0);
        }
        match self.inner.read(buf) {
            Ok(0) => {
                self.done = true;
                self.exchange.response_body_finished(true);
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(e) => {
                self.done = true;
                self.exchange
                    .note_failure(&Error::io(io::Error::new(e.kind(), e.to_string())));
                Err(e)
            }
        }
    }
}

impl Drop for ExchangeBody {
    fn drop(&mut self) {
        if !self.done {
            // The body was abandoned. A serial connection cannot be reused
            // past unread bytes; a multiplexed one just resets the stream.
            if !self.exchange.connection.is_multiplexed() {
                self.exchange.connection.no_new_exchanges();
            }
            self.exchange.cancel();
            self.exchange.response_body_finished(false);
        }
    }
}
