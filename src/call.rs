//! A call: one request and the work to get its response.

use std::{
    backtrace::Backtrace,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use crate::{
    client::Client,
    connection::{CallReference, Connection, Exchange, ExchangeFinder},
    error::Error,
    interceptor::{
        bridge::BridgeInterceptor, cache::CacheInterceptor, call_server::CallServerInterceptor,
        connect::ConnectInterceptor, retry::RetryAndFollowUpInterceptor, Chain, Interceptor,
    },
    request::Request,
    response::Response,
    sync::Mutex,
    task::{TaskHandle, TaskRunner},
    transport::StreamCloser,
};

/// A request that is ready to execute, at most once.
///
/// Obtain one from [`Client::new_call`](crate::Client::new_call). Run it
/// synchronously with [`execute`](Call::execute) or hand it to the
/// dispatcher with [`enqueue`](Call::enqueue); either way exactly one
/// outcome is delivered. [`cancel`](Call::cancel) may be called from any
/// thread at any time.
#[derive(Clone)]
pub struct Call {
    inner: Arc<CallInner>,
}

impl Call {
    pub(crate) fn new(client: Client, request: Request) -> Call {
        Call {
            inner: Arc::new_cyclic(|weak| CallInner {
                weak_self: weak.clone(),
                client,
                request,
                executed: AtomicBool::new(false),
                canceled: AtomicBool::new(false),
                timed_out: AtomicBool::new(false),
                state: Mutex::new(CallState {
                    finder: None,
                    exchange: None,
                    connection: None,
                    connect_closer: None,
                    deadline: None,
                    no_more_exchanges: false,
                    completed: false,
                }),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<CallInner>) -> Call {
        Call { inner }
    }

    pub fn request(&self) -> &Request {
        &self.inner.request
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.is_canceled()
    }

    /// Stops the call as soon as possible: the in-flight exchange is torn
    /// down, a connect in progress has its socket shut, and every
    /// subsequent step short-circuits. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// Runs the call on this thread and blocks for the outcome.
    pub fn execute(&self) -> crate::Result<Response> {
        self.inner.mark_executed()?;
        let dispatcher = self.inner.client.dispatcher().clone();
        dispatcher.executed(self.inner.clone());
        let result = CallInner::run(&self.inner);
        dispatcher.finished_sync(&self.inner);
        result
    }

    /// Hands the call to the dispatcher; `callback` receives the single
    /// outcome on a dispatcher worker thread.
    pub fn enqueue(
        &self,
        callback: impl FnOnce(crate::Result<Response>) + Send + 'static,
    ) {
        if let Err(e) = self.inner.mark_executed() {
            callback(Err(e));
            return;
        }
        self.inner
            .client
            .dispatcher()
            .enqueue(self.inner.clone(), Box::new(callback));
    }
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("method", self.inner.request.method())
            .field("url", &self.inner.request.url().as_str())
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

struct CallState {
    finder: Option<ExchangeFinder>,
    exchange: Option<Arc<Exchange>>,
    connection: Option<Arc<Connection>>,
    connect_closer: Option<Box<dyn StreamCloser>>,
    deadline: Option<TaskHandle>,
    /// Set once the retry stage is done issuing requests; the connection is
    /// released as soon as the final exchange finishes.
    no_more_exchanges: bool,
    completed: bool,
}

pub(crate) struct CallInner {
    weak_self: std::sync::Weak<CallInner>,
    client: Client,
    request: Request,
    executed: AtomicBool,
    canceled: AtomicBool,
    timed_out: AtomicBool,
    state: Mutex<CallState>,
}

impl CallInner {
    pub(crate) fn client(&self) -> &Client {
        &self.client
    }

    pub(crate) fn request(&self) -> &Request {
        &self.request
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    fn mark_executed(&self) -> crate::Result<()> {
        if self.executed.swap(true, Ordering::SeqCst) {
            return Err(Error::builder("calls may only be executed once"));
        }
        Ok(())
    }

    pub(crate) fn cancel(&self) {
        if self.canceled.swap(true, Ordering::SeqCst) {
            return;
        }
        log::debug!("canceling call to {}", self.request.url());
        let (exchange, closer) = {
            let mut state = self.state.lock();
            (state.exchange.clone(), state.connect_closer.take())
        };
        if let Some(exchange) = exchange {
            exchange.cancel();
        }
        if let Some(closer) = closer {
            closer.close();
        }
    }

    /// The whole call: deadline, interceptor chain, resource teardown,
    /// timeout translation.
    pub(crate) fn run(call: &Arc<CallInner>) -> crate::Result<Response> {
        call.start_deadline();

        let result = Self::response_with_interceptor_chain(call);

        match result {
            Ok(response) => {
                // A response served without an exchange (cache hit,
                // synthesized reply) ends the call now; otherwise the body
                // completion does it.
                let has_exchange = call.state.lock().exchange.is_some();
                if !has_exchange {
                    call.call_done();
                }
                Ok(response)
            }
            Err(e) => {
                call.call_done();
                if call.timed_out.load(Ordering::SeqCst) && e.is_canceled() {
                    // The deadline fired and surfaced as a cancellation.
                    Err(Error::timeout(crate::error::TimedOut)
                        .with_url(call.request.url().clone()))
                } else {
                    Err(e)
                }
            }
        }
    }

    fn response_with_interceptor_chain(call: &Arc<CallInner>) -> crate::Result<Response> {
        let client = &call.client;
        let mut interceptors: Vec<Arc<dyn Interceptor>> = Vec::new();
        interceptors.extend(client.interceptors().iter().cloned());
        interceptors.push(Arc::new(RetryAndFollowUpInterceptor));
        interceptors.push(Arc::new(BridgeInterceptor {
            cookie_store: client.cookie_store().cloned(),
            user_agent: client.user_agent().to_owned(),
        }));
        interceptors.push(Arc::new(CacheInterceptor {
            cache: client.cache().cloned(),
        }));
        interceptors.push(Arc::new(ConnectInterceptor));
        interceptors.extend(client.network_interceptors().iter().cloned());
        interceptors.push(Arc::new(CallServerInterceptor));

        let mut chain = Chain::new(call, &interceptors, call.request.clone());
        chain.proceed(call.request.clone())
    }

    fn start_deadline(&self) {
        let Some(timeout) = self.client.call_timeout() else {
            return;
        };
        let weak = self.weak_self.clone();
        let handle = TaskRunner::global().schedule("call-deadline", timeout, move || {
            if let Some(call) = weak.upgrade() {
                log::debug!("call deadline fired for {}", call.request.url());
                call.timed_out.store(true, Ordering::SeqCst);
                call.cancel();
            }
            None
        });
        self.state.lock().deadline = Some(handle);
    }

    // ===== exchange scope, driven by the retry stage =====

    /// Prepares to find connections for `request`. A fresh finder is built
    /// on the first attempt and whenever the target origin changed.
    pub(crate) fn enter_exchange_scope(
        &self,
        request: &Request,
        force_new_finder: bool,
    ) -> crate::Result<()> {
        let needs_new = force_new_finder || {
            let state = self.state.lock();
            match &state.finder {
                Some(finder) => {
                    let address = finder.address();
                    !request
                        .url()
                        .host_str()
                        .map(|h| h.eq_ignore_ascii_case(address.host()))
                        .unwrap_or(false)
                        || request.url().port_or_known_default() != Some(address.port())
                        || (request.url().scheme() == "https") != address.is_https()
                }
                None => true,
            }
        };

        if needs_new {
            let address = self.client.address_for(request.url())?;
            let call = self.weak_self.upgrade().expect("call is alive");
            let finder = ExchangeFinder::new(
                address,
                call,
                self.client.pool().clone(),
                self.client.route_database().clone(),
            );
            self.state.lock().finder = Some(finder);
        }
        Ok(())
    }

    /// Ends the retry stage. With `force_close` the active exchange is torn
    /// down rather than drained.
    pub(crate) fn exit_exchange_scope(&self, force_close: bool) {
        let (exchange, done) = {
            let mut state = self.state.lock();
            state.no_more_exchanges = true;
            (state.exchange.clone(), state.exchange.is_none())
        };
        if force_close {
            if let Some(exchange) = &exchange {
                exchange.cancel();
            }
        }
        if done {
            self.call_done();
        }
    }

    /// Finds a healthy connection and opens an exchange on it. Called by
    /// the connect stage, once per attempt.
    pub(crate) fn init_exchange(&self, request: &Request) -> crate::Result<Arc<Exchange>> {
        if self.is_canceled() {
            return Err(Error::canceled());
        }

        // The finder leaves the lock while it does I/O; the chain is serial
        // per call, so nobody else takes it meanwhile.
        let mut finder = self
            .state
            .lock()
            .finder
            .take()
            .ok_or_else(|| Error::protocol("connect stage ran before the retry stage"))?;

        let found = finder.find(request.method());
        let stats = finder.stats();
        self.state.lock().finder = Some(finder);
        let connection = found?;

        let cancel_token = crate::transport::CancelToken::new();
        let codec = match connection.new_exchange_codec(cancel_token.clone()) {
            Ok(codec) => codec,
            Err(e) => {
                stats.record(&e);
                connection.track_failure(&e);
                return Err(e);
            }
        };

        let call = self.weak_self.upgrade().expect("call is alive");
        let exchange = Arc::new(Exchange::new(call, connection, codec, cancel_token, stats));

        let mut state = self.state.lock();
        if self.is_canceled() {
            drop(state);
            exchange.cancel();
            return Err(Error::canceled());
        }
        state.exchange = Some(exchange.clone());
        Ok(exchange)
    }

    pub(crate) fn exchange(&self) -> Option<Arc<Exchange>> {
        self.state.lock().exchange.clone()
    }

    /// Whether the finder has (or can get) another route worth trying.
    pub(crate) fn retry_after_failure(&self) -> bool {
        let finder = self.state.lock().finder.take();
        let Some(mut finder) = finder else {
            return false;
        };
        let retry = finder.retry_after_failure();
        self.state.lock().finder = Some(finder);
        retry
    }

    // ===== connection plumbing, driven by the finder and the pool =====

    pub(crate) fn connection(&self) -> Option<Arc<Connection>> {
        self.state.lock().connection.clone()
    }

    /// Attaches `connection` to this call and this call to `connection`.
    pub(crate) fn acquire_connection(&self, connection: &Arc<Connection>) {
        connection.add_call(CallReference {
            call: self.weak_self.clone(),
            captured_at: Backtrace::capture(),
        });
        self.state.lock().connection = Some(connection.clone());
    }

    /// Detaches the call's connection. Returns the connection when the
    /// caller must close its socket (it went idle and the pool refused it).
    pub(crate) fn release_connection(&self) -> Option<Arc<Connection>> {
        let connection = self.state.lock().connection.take()?;
        let this = self.weak_self.upgrade().expect("call is alive");
        let idle = connection.remove_call(&this);
        if idle && self.client.pool().connection_became_idle(&connection) {
            return Some(connection);
        }
        None
    }

    pub(crate) fn set_connect_closer(&self, closer: Box<dyn StreamCloser>) {
        self.state.lock().connect_closer = Some(closer);
    }

    pub(crate) fn clear_connect_closer(&self) {
        self.state.lock().connect_closer = None;
    }

    /// An exchange finished in both directions, or failed. Success counts
    /// toward the connection; the call ends when no more exchanges are
    /// expected.
    pub(crate) fn exchange_finished(&self, exchange: &Exchange, _ok: bool) {
        let done = {
            let mut state = self.state.lock();
            let matches = state
                .exchange
                .as_ref()
                .map(|e| std::ptr::eq(Arc::as_ptr(e), exchange as *const Exchange))
                .unwrap_or(false);
            if matches {
                state.exchange = None;
            }
            state.no_more_exchanges && state.exchange.is_none() && !state.completed
        };
        if done {
            self.call_done();
        }
    }

    /// Final teardown, exactly once: cancel the deadline and hand the
    /// connection back (or close it).
    fn call_done(&self) {
        {
            let mut state = self.state.lock();
            if state.completed {
                return;
            }
            state.completed = true;
            if let Some(deadline) = state.deadline.take() {
                deadline.cancel();
            }
        }
        if let Some(to_close) = self.release_connection() {
            to_close.close();
        }
    }
}

impl fmt::Debug for CallInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Call({} {})", self.request.method(), self.request.url())
    }
}
