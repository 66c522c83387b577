//! The client: configuration plus the shared machinery every call uses.

use std::{fmt, sync::Arc, time::Duration};

use http::Method;
use url::Url;

use crate::{
    address::Address,
    auth::{Authenticator, NoAuth},
    cache::Cache,
    call::Call,
    connection::ConnectionPool,
    cookie::CookieStore,
    dispatcher::Dispatcher,
    dns::{Resolve, SYSTEM},
    error::Error,
    interceptor::Interceptor,
    into_url::IntoUrl,
    protocol::{self, Protocol},
    proxy::{DirectSelector, Proxy, ProxySelector},
    request::{Request, RequestBuilder},
    route::RouteDatabase,
    tls::CertificatePinner,
    transport::{
        SocketFactory, SystemSocketFactory, TlsConnector, TransportFactory, UnconfiguredTransport,
    },
};

/// A configured HTTP client.
///
/// Clients are cheap to clone and intended to be shared: all clones use one
/// dispatcher, one connection pool and one cache. Create one with
/// [`Client::new`] or tune it through [`Client::builder`].
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    dispatcher: Dispatcher,
    pool: ConnectionPool,
    route_database: Arc<RouteDatabase>,
    dns: Arc<dyn Resolve>,
    socket_factory: Arc<dyn SocketFactory>,
    tls: Option<Arc<dyn TlsConnector>>,
    transport_factory: Arc<dyn TransportFactory>,
    pinner: Option<Arc<CertificatePinner>>,
    proxy: Option<Proxy>,
    proxy_selector: Arc<dyn ProxySelector>,
    authenticator: Arc<dyn Authenticator>,
    proxy_authenticator: Arc<dyn Authenticator>,
    cookie_store: Option<Arc<dyn CookieStore>>,
    cache: Option<Cache>,
    interceptors: Vec<Arc<dyn Interceptor>>,
    network_interceptors: Vec<Arc<dyn Interceptor>>,
    protocols: Vec<Protocol>,
    follow_redirects: bool,
    follow_tls_redirects: bool,
    retry_on_connection_failure: bool,
    connect_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    call_timeout: Option<Duration>,
    user_agent: String,
}

impl Default for Client {
    fn default() -> Client {
        Client::new()
    }
}

impl Client {
    /// A client with default configuration.
    pub fn new() -> Client {
        Client::builder()
            .build()
            .expect("default configuration is valid")
    }

    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    /// Mints a call for `request`. Each call runs at most once; mint a new
    /// one to repeat a request.
    pub fn new_call(&self, request: Request) -> Call {
        Call::new(self.clone(), request)
    }

    /// A `GET` request builder for `url`.
    pub fn get(&self, url: impl IntoUrl) -> RequestBuilder {
        Request::builder().url(url)
    }

    /// A `POST` request builder for `url`.
    pub fn post(&self, url: impl IntoUrl) -> RequestBuilder {
        Request::builder().method(Method::POST).url(url)
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    pub fn connection_pool(&self) -> &ConnectionPool {
        &self.inner.pool
    }

    pub fn cache(&self) -> Option<&Cache> {
        self.inner.cache.as_ref()
    }

    // ===== configuration reads used across the pipeline =====

    pub(crate) fn pool(&self) -> &ConnectionPool {
        &self.inner.pool
    }

    pub(crate) fn route_database(&self) -> &Arc<RouteDatabase> {
        &self.inner.route_database
    }

    pub(crate) fn transport_factory(&self) -> &Arc<dyn TransportFactory> {
        &self.inner.transport_factory
    }

    pub(crate) fn authenticator(&self) -> &Arc<dyn Authenticator> {
        &self.inner.authenticator
    }

    pub(crate) fn proxy_authenticator(&self) -> &Arc<dyn Authenticator> {
        &self.inner.proxy_authenticator
    }

    pub(crate) fn cookie_store(&self) -> Option<&Arc<dyn CookieStore>> {
        self.inner.cookie_store.as_ref()
    }

    pub(crate) fn interceptors(&self) -> &[Arc<dyn Interceptor>] {
        &self.inner.interceptors
    }

    pub(crate) fn network_interceptors(&self) -> &[Arc<dyn Interceptor>] {
        &self.inner.network_interceptors
    }

    pub(crate) fn follow_redirects(&self) -> bool {
        self.inner.follow_redirects
    }

    pub(crate) fn follow_tls_redirects(&self) -> bool {
        self.inner.follow_tls_redirects
    }

    pub(crate) fn retry_on_connection_failure(&self) -> bool {
        self.inner.retry_on_connection_failure
    }

    pub(crate) fn connect_timeout(&self) -> Option<Duration> {
        self.inner.connect_timeout
    }

    pub(crate) fn read_timeout(&self) -> Option<Duration> {
        self.inner.read_timeout
    }

    pub(crate) fn write_timeout(&self) -> Option<Duration> {
        self.inner.write_timeout
    }

    pub(crate) fn call_timeout(&self) -> Option<Duration> {
        self.inner.call_timeout
    }

    pub(crate) fn user_agent(&self) -> &str {
        &self.inner.user_agent
    }

    /// The connection identity for a URL under this client's configuration.
    pub(crate) fn address_for(&self, url: &Url) -> crate::Result<Address> {
        let is_https = url.scheme() == "https";
        let tls = if is_https {
            match &self.inner.tls {
                Some(tls) => Some(tls.clone()),
                None => {
                    return Err(Error::builder("an https URL requires a TLS connector")
                        .with_url(url.clone()))
                }
            }
        } else {
            None
        };
        let pinner = if is_https {
            self.inner.pinner.clone()
        } else {
            None
        };

        Address::new(
            url,
            self.inner.dns.clone(),
            self.inner.socket_factory.clone(),
            tls,
            pinner,
            self.inner.proxy.clone(),
            self.inner.proxy_selector.clone(),
            self.inner.protocols.clone(),
            self.inner.proxy_authenticator.clone(),
        )
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("protocols", &self.inner.protocols)
            .field("proxy", &self.inner.proxy)
            .finish()
    }
}

/// Builds a [`Client`].
pub struct ClientBuilder {
    dispatcher: Option<Dispatcher>,
    pool: Option<ConnectionPool>,
    dns: Arc<dyn Resolve>,
    socket_factory: Arc<dyn SocketFactory>,
    tls: Option<Arc<dyn TlsConnector>>,
    transport_factory: Arc<dyn TransportFactory>,
    pinner: Option<Arc<CertificatePinner>>,
    proxy: Option<Proxy>,
    proxy_selector: Arc<dyn ProxySelector>,
    authenticator: Arc<dyn Authenticator>,
    proxy_authenticator: Arc<dyn Authenticator>,
    cookie_store: Option<Arc<dyn CookieStore>>,
    cache: Option<Cache>,
    interceptors: Vec<Arc<dyn Interceptor>>,
    network_interceptors: Vec<Arc<dyn Interceptor>>,
    protocols: Vec<Protocol>,
    follow_redirects: bool,
    follow_tls_redirects: bool,
    retry_on_connection_failure: bool,
    connect_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    call_timeout: Option<Duration>,
    user_agent: String,
}

impl Default for ClientBuilder {
    fn default() -> ClientBuilder {
        ClientBuilder {
            dispatcher: None,
            pool: None,
            dns: SYSTEM.clone(),
            socket_factory: Arc::new(SystemSocketFactory),
            tls: None,
            transport_factory: Arc::new(UnconfiguredTransport),
            pinner: None,
            proxy: None,
            proxy_selector: Arc::new(DirectSelector),
            authenticator: Arc::new(NoAuth),
            proxy_authenticator: Arc::new(NoAuth),
            cookie_store: None,
            cache: None,
            interceptors: Vec::new(),
            network_interceptors: Vec::new(),
            protocols: vec![Protocol::H2, Protocol::Http11],
            follow_redirects: true,
            follow_tls_redirects: true,
            retry_on_connection_failure: true,
            connect_timeout: Some(Duration::from_secs(10)),
            read_timeout: Some(Duration::from_secs(10)),
            write_timeout: Some(Duration::from_secs(10)),
            call_timeout: None,
            user_agent: concat!("courier/", env!("CARGO_PKG_VERSION")).to_owned(),
        }
    }
}

impl ClientBuilder {
    pub fn dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn connection_pool(mut self, pool: ConnectionPool) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn dns(mut self, dns: impl Resolve + 'static) -> Self {
        self.dns = Arc::new(dns);
        self
    }

    pub fn socket_factory(mut self, factory: impl SocketFactory + 'static) -> Self {
        self.socket_factory = Arc::new(factory);
        self
    }

    pub fn tls(mut self, connector: impl TlsConnector + 'static) -> Self {
        self.tls = Some(Arc::new(connector));
        self
    }

    pub fn transport_factory(mut self, factory: impl TransportFactory + 'static) -> Self {
        self.transport_factory = Arc::new(factory);
        self
    }

    pub fn certificate_pinner(mut self, pinner: CertificatePinner) -> Self {
        self.pinner = Some(Arc::new(pinner));
        self
    }

    /// Routes every request through one proxy, bypassing the selector.
    pub fn proxy(mut self, proxy: Proxy) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn proxy_selector(mut self, selector: impl ProxySelector + 'static) -> Self {
        self.proxy_selector = Arc::new(selector);
        self
    }

    pub fn authenticator(mut self, authenticator: impl Authenticator + 'static) -> Self {
        self.authenticator = Arc::new(authenticator);
        self
    }

    pub fn proxy_authenticator(mut self, authenticator: impl Authenticator + 'static) -> Self {
        self.proxy_authenticator = Arc::new(authenticator);
        self
    }

    pub fn cookie_store(mut self, store: impl CookieStore + 'static) -> Self {
        self.cookie_store = Some(Arc::new(store));
        self
    }

    pub fn cache(mut self, cache: Cache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Adds an application interceptor: runs before retries and the cache,
    /// sees each call exactly once.
    pub fn interceptor(mut self, interceptor: impl Interceptor + 'static) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    /// Adds a network interceptor: runs per network attempt, after the
    /// cache, with a live connection.
    pub fn network_interceptor(mut self, interceptor: impl Interceptor + 'static) -> Self {
        self.network_interceptors.push(Arc::new(interceptor));
        self
    }

    pub fn protocols(mut self, protocols: Vec<Protocol>) -> Self {
        self.protocols = protocols;
        self
    }

    pub fn follow_redirects(mut self, follow: bool) -> Self {
        self.follow_redirects = follow;
        self
    }

    /// Whether redirects may cross between http and https.
    pub fn follow_tls_redirects(mut self, follow: bool) -> Self {
        self.follow_tls_redirects = follow;
        self
    }

    pub fn retry_on_connection_failure(mut self, retry: bool) -> Self {
        self.retry_on_connection_failure = retry;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout);
        self
    }

    /// A deadline for the entire call: connect, retries, follow-ups, and
    /// reading the body all share it. Disabled by default.
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn build(self) -> crate::Result<Client> {
        protocol::validate_selection(&self.protocols)?;

        Ok(Client {
            inner: Arc::new(ClientInner {
                dispatcher: self.dispatcher.unwrap_or_default(),
                pool: self.pool.unwrap_or_default(),
                route_database: Arc::new(RouteDatabase::default()),
                dns: self.dns,
                socket_factory: self.socket_factory,
                tls: self.tls,
                transport_factory: self.transport_factory,
                pinner: self.pinner,
                proxy: self.proxy,
                proxy_selector: self.proxy_selector,
                authenticator: self.authenticator,
                proxy_authenticator: self.proxy_authenticator,
                cookie_store: self.cookie_store,
                cache: self.cache,
                interceptors: self.interceptors,
                network_interceptors: self.network_interceptors,
                protocols: self.protocols,
                follow_redirects: self.follow_redirects,
                follow_tls_redirects: self.follow_tls_redirects,
                retry_on_connection_failure: self.retry_on_connection_failure,
                connect_timeout: self.connect_timeout,
                read_timeout: self.read_timeout,
                write_timeout: self.write_timeout,
                call_timeout: self.call_timeout,
                user_agent: self.user_agent,
            }),
        })
    }
}
