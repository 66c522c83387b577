use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use http::Method;

use crate::{
    address::Address,
    call::CallInner,
    connection::{Connection, ConnectionPool},
    error::Error,
    protocol::Protocol,
    route::{Route, RouteDatabase, RouteSelector, Selection},
    tls::Handshake,
    transport::Stream,
};

/// Failure counters for one call's attempts, shared with the exchanges it
/// spawns. [`ExchangeFinder::retry_after_failure`] reads them to decide
/// whether another attempt is worth making.
#[derive(Default)]
pub(crate) struct FailureStats {
    refused_stream_count: AtomicU32,
    connection_shutdown_count: AtomicU32,
    other_failure_count: AtomicU32,
}

impl FailureStats {
    pub(crate) fn record(&self, error: &Error) {
        if error.is_refused_stream() {
            self.refused_stream_count.fetch_add(1, Ordering::Relaxed);
        } else if error.is_shutdown() {
            self.connection_shutdown_count.fetch_add(1, Ordering::Relaxed);
        } else {
            self.other_failure_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn refused(&self) -> u32 {
        self.refused_stream_count.load(Ordering::Relaxed)
    }

    fn shutdowns(&self) -> u32 {
        self.connection_shutdown_count.load(Ordering::Relaxed)
    }

    fn other(&self) -> u32 {
        self.other_failure_count.load(Ordering::Relaxed)
    }

    fn has_failures(&self) -> bool {
        self.refused() + self.shutdowns() + self.other() > 0
    }
}

/// Produces a healthy connection for one request attempt, preferring reuse:
/// the call's own connection, then the pool, then a remembered route, then a
/// fresh connect raced against the pool.
pub(crate) struct ExchangeFinder {
    address: Address,
    call: Arc<CallInner>,
    pool: ConnectionPool,
    route_database: Arc<RouteDatabase>,
    stats: Arc<FailureStats>,
    selector: Option<RouteSelector>,
    selection: Option<Selection>,
    next_route_to_try: Option<Route>,
}

impl ExchangeFinder {
    pub(crate) fn new(
        address: Address,
        call: Arc<CallInner>,
        pool: ConnectionPool,
        route_database: Arc<RouteDatabase>,
    ) -> ExchangeFinder {
        ExchangeFinder {
            address,
            call,
            pool,
            route_database,
            stats: Arc::new(FailureStats::default()),
            selector: None,
            selection: None,
            next_route_to_try: None,
        }
    }

    pub(crate) fn address(&self) -> &Address {
        &self.address
    }

    pub(crate) fn stats(&self) -> Arc<FailureStats> {
        self.stats.clone()
    }

    /// Finds a connection that passes a health check. Anything unhealthy is
    /// taken out of rotation and the search continues.
    pub(crate) fn find(&mut self, method: &Method) -> crate::Result<Arc<Connection>> {
        // Requests that cannot be transparently retried warrant poking the
        // socket before being committed to it.
        let extensive_checks = *method != Method::GET;

        loop {
            let connection = match self.find_connection() {
                Ok(connection) => connection,
                Err(e) => {
                    // Count connect-phase damage too, so the retry decision
                    // sees it.
                    if !e.is_canceled() {
                        self.stats.record(&e);
                    }
                    return Err(e);
                }
            };
            if !connection.is_healthy(extensive_checks) {
                log::debug!("discarding unhealthy {:?}", connection);
                connection.no_new_exchanges();
                continue;
            }
            return Ok(connection);
        }
    }

    fn find_connection(&mut self) -> crate::Result<Arc<Connection>> {
        if self.call.is_canceled() {
            return Err(Error::canceled());
        }

        // 1. The connection this call already holds, from a prior attempt or
        // follow-up. Strictly same host here: a coalesced connection that
        // answered 421 must not be picked up again on the retry.
        if let Some(existing) = self.call.connection() {
            let same_origin = existing
                .route()
                .address()
                .host()
                .eq_ignore_ascii_case(self.address.host())
                && existing.route().address().port() == self.address.port();
            if same_origin && !existing.no_new_exchanges_set() {
                return Ok(existing);
            }
            if let Some(released) = self.call.release_connection() {
                released.close();
            }
        }

        // 2. The pool, keyed by address alone.
        if let Some(pooled) = self.pool.try_acquire(&self.address, &self.call, None, false) {
            return Ok(pooled);
        }

        // 3–4. Pick a route: the remembered one, the current selection, or a
        // fresh selection (which also unlocks IP-based coalescing).
        let route = match self.next_route_to_try.take() {
            Some(route) => route,
            None => match self.selection.as_mut().filter(|s| s.has_next()) {
                Some(selection) => selection.next().expect("selection has next"),
                None => {
                    if self.selector.is_none() {
                        self.selector = Some(RouteSelector::new(
                            self.address.clone(),
                            self.route_database.clone(),
                        ));
                    }
                    let selector = self.selector.as_mut().expect("selector initialized");
                    let mut selection = selector.next()?;

                    // With resolved addresses in hand, a connection to a
                    // different hostname on the same IP may be reusable.
                    if let Some(pooled) = self.pool.try_acquire(
                        &self.address,
                        &self.call,
                        Some(selection.routes()),
                        false,
                    ) {
                        self.selection = Some(selection);
                        return Ok(pooled);
                    }

                    let route = selection.next().expect("fresh selection has next");
                    self.selection = Some(selection);
                    route
                }
            },
        };

        // 5. Actually connect.
        let connection = self.connect(route.clone())?;
        self.route_database.connected(&route);

        // 6. Concurrent calls may have built an equivalent multiplexed
        // connection while this one was in flight; prefer the pooled one and
        // remember this route as verified.
        if connection.is_multiplexed() {
            if let Some(pooled) = self.pool.try_acquire(
                &self.address,
                &self.call,
                Some(std::slice::from_ref(&route)),
                true,
            ) {
                log::debug!("lost connect race, reusing pooled {:?}", pooled);
                connection.close();
                self.next_route_to_try = Some(route);
                return Ok(pooled);
            }
        }

        // Attach before publishing to the pool, so a cleanup pass never sees
        // the new connection without its call.
        self.call.acquire_connection(&connection);
        self.pool.put(connection.clone());
        Ok(connection)
    }

    /// Dials one route: TCP, then optionally TLS with pin enforcement, then
    /// the transport codec.
    fn connect(&mut self, route: Route) -> crate::Result<Arc<Connection>> {
        if self.call.is_canceled() {
            return Err(Error::canceled());
        }
        log::debug!("connecting {:?}", route);

        let client = self.call.client();
        let stream = match self
            .address
            .socket_factory()
            .connect(&route, client.connect_timeout())
        {
            Ok(stream) => stream,
            Err(e) => {
                self.note_route_failure(&route);
                return Err(Error::connect(e).with_url(self.address.url().clone()));
            }
        };

        // Let a concurrent cancel() reach the socket while we block on the
        // handshake.
        self.call.set_connect_closer(stream.closer());

        let result = self.establish(stream, &route);
        self.call.clear_connect_closer();

        match result {
            Ok(connection) => {
                if self.call.is_canceled() {
                    connection.close();
                    return Err(Error::canceled());
                }
                log::debug!("connected {:?}", connection);
                Ok(connection)
            }
            Err(e) => {
                if !e.is_pinning() {
                    self.note_route_failure(&route);
                }
                Err(e)
            }
        }
    }

    fn establish(
        &mut self,
        stream: Box<dyn Stream>,
        route: &Route,
    ) -> crate::Result<Arc<Connection>> {
        let client = self.call.client();

        // Socket-level attempt timeouts; the TLS handshake runs under them
        // too.
        stream
            .set_read_timeout(client.read_timeout())
            .and_then(|()| stream.set_write_timeout(client.write_timeout()))
            .map_err(Error::connect)?;

        let (stream, handshake, protocol): (Box<dyn Stream>, Option<Handshake>, Protocol) =
            match self.address.tls() {
                Some(tls) => {
                    let session = tls.handshake(stream, &self.address)?;
                    if let Some(pinner) = self.address.pinner() {
                        pinner.check(self.address.host(), session.handshake.peer_certificates())?;
                    }
                    let protocol = session.protocol.unwrap_or(Protocol::Http11);
                    (session.stream, Some(session.handshake), protocol)
                }
                None => {
                    let protocol = if self
                        .address
                        .protocols()
                        .contains(&Protocol::H2PriorKnowledge)
                    {
                        Protocol::H2PriorKnowledge
                    } else {
                        Protocol::Http11
                    };
                    (stream, None, protocol)
                }
            };

        let transport = client
            .transport_factory()
            .create(stream, protocol, route)?;
        Ok(Arc::new(Connection::new(
            route.clone(),
            transport,
            handshake,
        )))
    }

    fn note_route_failure(&self, route: &Route) {
        self.route_database.failed(route);
        if !route.proxy().is_direct() {
            self.address
                .proxy_selector()
                .connect_failed(self.address.url(), route.proxy());
        }
    }

    /// After a failure, whether this finder can produce another connection
    /// worth trying.
    pub(crate) fn retry_after_failure(&mut self) -> bool {
        if !self.stats.has_failures() {
            return false;
        }

        if self.next_route_to_try.is_some() {
            return true;
        }

        if let Some(route) = self.retryable_current_route() {
            // The connection that failed is on a route that deserves one
            // deliberate fresh attempt.
            self.next_route_to_try = Some(route);
            return true;
        }

        if self.selection.as_ref().is_some_and(|s| s.has_next()) {
            return true;
        }

        match &self.selector {
            Some(selector) => selector.has_next(),
            // Not yet initialized: assume at least one route exists.
            None => true,
        }
    }

    fn retryable_current_route(&self) -> Option<Route> {
        if self.stats.refused() > 1 || self.stats.shutdowns() > 1 || self.stats.other() > 0 {
            return None;
        }
        let connection = self.call.connection()?;
        if connection.route_failure_count() != 0 {
            return None;
        }
        if !connection.supports_url(self.address.url()) {
            return None;
        }
        Some(connection.route().clone())
    }
}
