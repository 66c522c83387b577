use std::{
    backtrace::Backtrace,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
};

use url::Url;

use crate::{
    address::Address,
    call::CallInner,
    error::Error,
    protocol::Protocol,
    proxy::Proxy,
    route::Route,
    sync::Mutex,
    tls::Handshake,
    transport::{ExchangeCodec, Transport},
};

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

/// A weak link from a connection back to a call it carries, with the place
/// the call attached for leak reports.
pub(crate) struct CallReference {
    pub(crate) call: Weak<CallInner>,
    pub(crate) captured_at: Backtrace,
}

pub(crate) struct ConnectionState {
    pub(crate) no_new_exchanges: bool,
    pub(crate) no_coalesced_exchanges: bool,
    pub(crate) success_count: u64,
    pub(crate) route_failure_count: u32,
    refused_stream_count: u32,
    pub(crate) idle_at_nanos: u64,
    pub(crate) calls: Vec<CallReference>,
    pub(crate) allocation_limit: usize,
}

/// A socket (possibly TLS-wrapped, possibly multiplexed) bound to one route,
/// carrying zero or more in-flight calls.
pub(crate) struct Connection {
    id: u64,
    route: Route,
    transport: Box<dyn Transport>,
    handshake: Option<Handshake>,
    protocol: Protocol,
    pub(crate) state: Mutex<ConnectionState>,
}

impl Connection {
    pub(crate) fn new(
        route: Route,
        transport: Box<dyn Transport>,
        handshake: Option<Handshake>,
    ) -> Connection {
        let protocol = transport.protocol();
        let allocation_limit = transport.allocation_limit();
        Connection {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            route,
            transport,
            handshake,
            protocol,
            state: Mutex::new(ConnectionState {
                no_new_exchanges: false,
                no_coalesced_exchanges: false,
                success_count: 0,
                route_failure_count: 0,
                refused_stream_count: 0,
                idle_at_nanos: u64::MAX,
                calls: Vec::new(),
                allocation_limit,
            }),
        }
    }

    pub(crate) fn route(&self) -> &Route {
        &self.route
    }

    pub(crate) fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub(crate) fn handshake(&self) -> Option<&Handshake> {
        self.handshake.as_ref()
    }

    pub(crate) fn is_multiplexed(&self) -> bool {
        self.transport.is_multiplexed()
    }

    /// Whether this connection can carry a request to `url`: same port, and
    /// either the same host or, for a multiplexed connection, a host the
    /// peer certificate covers.
    pub(crate) fn supports_url(&self, url: &Url) -> bool {
        let address = self.route.address();
        let Some(host) = url.host_str() else {
            return false;
        };
        if url.port_or_known_default() != Some(address.port()) {
            return false;
        }
        if host.eq_ignore_ascii_case(address.host()) {
            return true;
        }
        self.is_multiplexed() && self.certificate_covers(host)
    }

    fn certificate_covers(&self, hostname: &str) -> bool {
        match self.handshake.as_ref().and_then(|h| h.peer_leaf()) {
            Some(leaf) => leaf.matches_hostname(hostname),
            None => false,
        }
    }

    /// Whether a call to `address` may attach here. `routes` carries the
    /// caller's resolved routes when coalescing across hostnames is on the
    /// table.
    pub(crate) fn is_eligible(&self, address: &Address, routes: Option<&[Route]>) -> bool {
        let state = self.state.lock();

        if state.calls.len() >= state.allocation_limit || state.no_new_exchanges {
            return false;
        }

        if !self.route.address().equals_non_host(address) {
            return false;
        }

        if address.host().eq_ignore_ascii_case(self.route.address().host()) {
            return true;
        }

        // A different hostname: only an HTTP/2 connection can be coalesced,
        // and only when this connection's IP is one the new host resolves
        // to, the peer certificate covers the new host, and any pin for the
        // new host is satisfied by the presented chain.
        if !self.is_multiplexed() || state.no_coalesced_exchanges {
            return false;
        }

        let Some(routes) = routes else { return false };
        let ip_matches = routes.iter().any(|candidate| {
            matches!(candidate.proxy(), Proxy::Direct)
                && matches!(self.route.proxy(), Proxy::Direct)
                && candidate.target() == self.route.target()
        });
        if !ip_matches {
            return false;
        }

        if !self.certificate_covers(address.host()) {
            return false;
        }

        if let (Some(pinner), Some(handshake)) = (address.pinner(), &self.handshake) {
            if pinner
                .check(address.host(), handshake.peer_certificates())
                .is_err()
            {
                return false;
            }
        }

        true
    }

    pub(crate) fn add_call(&self, reference: CallReference) {
        self.state.lock().calls.push(reference);
    }

    /// Detaches `call`, returning true when the connection went idle.
    pub(crate) fn remove_call(&self, call: &Arc<CallInner>) -> bool {
        let mut state = self.state.lock();
        state
            .calls
            .retain(|reference| reference.call.as_ptr() != Arc::as_ptr(call));
        state.calls.is_empty()
    }

    pub(crate) fn in_flight_calls(&self) -> usize {
        self.state.lock().calls.len()
    }

    pub(crate) fn note_success(&self) {
        let mut state = self.state.lock();
        state.success_count += 1;
    }

    pub(crate) fn success_count(&self) -> u64 {
        self.state.lock().success_count
    }

    pub(crate) fn route_failure_count(&self) -> u32 {
        self.state.lock().route_failure_count
    }

    /// Stops new exchanges from starting here; in-flight exchanges finish.
    pub(crate) fn no_new_exchanges(&self) {
        self.state.lock().no_new_exchanges = true;
    }

    pub(crate) fn no_new_exchanges_set(&self) -> bool {
        self.state.lock().no_new_exchanges
    }

    /// Stops further cross-hostname reuse after a `421 Misdirected Request`.
    pub(crate) fn no_coalesced_exchanges(&self) {
        self.state.lock().no_coalesced_exchanges = true;
    }

    /// Classifies an exchange failure into connection damage.
    pub(crate) fn track_failure(&self, error: &Error) {
        let mut state = self.state.lock();
        if error.is_refused_stream() {
            state.refused_stream_count += 1;
            // One refusal is load shedding; a second one means this
            // connection is not getting new streams.
            if state.refused_stream_count > 1 {
                state.no_new_exchanges = true;
            }
        } else if error.is_shutdown() {
            state.no_new_exchanges = true;
        } else {
            state.no_new_exchanges = true;
            state.route_failure_count += 1;
        }
    }

    pub(crate) fn is_healthy(&self, extensive: bool) -> bool {
        if self.no_new_exchanges_set() {
            return false;
        }
        self.transport.is_healthy(extensive)
    }

    pub(crate) fn new_exchange_codec(
        &self,
        cancel: crate::transport::CancelToken,
    ) -> crate::Result<Box<dyn ExchangeCodec>> {
        self.transport.new_exchange_codec(cancel)
    }

    pub(crate) fn idle_at_nanos(&self) -> u64 {
        self.state.lock().idle_at_nanos
    }

    pub(crate) fn set_idle_at_nanos(&self, nanos: u64) {
        self.state.lock().idle_at_nanos = nanos;
    }

    pub(crate) fn cancel(&self) {
        self.transport.cancel();
    }

    pub(crate) fn close(&self) {
        self.transport.close();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Connection#{}{{{:?} {}}}",
            self.id, self.route, self.protocol
        )
    }
}

#[cfg(test)]
pub(crate) mod tests_support {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    use super::*;
    use crate::{
        auth::NoAuth,
        dns::SystemResolver,
        proxy::DirectSelector,
        route::SocketTarget,
        transport::{ExchangeCodec, SystemSocketFactory},
    };

    pub(crate) struct NullTransport {
        pub(crate) multiplexed: bool,
    }

    impl Transport for NullTransport {
        fn protocol(&self) -> Protocol {
            if self.multiplexed {
                Protocol::H2
            } else {
                Protocol::Http11
            }
        }

        fn new_exchange_codec(
            &self,
            _cancel: crate::transport::CancelToken,
        ) -> crate::Result<Box<dyn ExchangeCodec>> {
            Err(crate::Error::io("null transport has no codec"))
        }

        fn is_healthy(&self, _extensive: bool) -> bool {
            true
        }

        fn cancel(&self) {}

        fn close(&self) {}
    }

    pub(crate) fn test_address(url: &str) -> Address {
        Address::new(
            &url.parse().unwrap(),
            Arc::new(SystemResolver),
            Arc::new(SystemSocketFactory),
            None,
            None,
            None,
            Arc::new(DirectSelector),
            vec![Protocol::Http11],
            Arc::new(NoAuth),
        )
        .unwrap()
    }

    pub(crate) fn new_idle_connection(url: &str) -> Connection {
        let address = test_address(url);
        let route = Route::new(
            address,
            Proxy::Direct,
            SocketTarget::Ip(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 80)),
        );
        Connection::new(route, Box::new(NullTransport { multiplexed: false }), None)
    }

    #[test]
    fn supports_url_checks_host_and_port() {
        let connection = new_idle_connection("http://a.example/");
        assert!(connection.supports_url(&"http://a.example/x".parse().unwrap()));
        assert!(connection.supports_url(&"http://A.EXAMPLE/".parse().unwrap()));
        assert!(!connection.supports_url(&"http://b.example/".parse().unwrap()));
        assert!(!connection.supports_url(&"http://a.example:8080/".parse().unwrap()));
    }

    #[test]
    fn track_failure_classification() {
        let connection = new_idle_connection("http://a.example/");

        // First refused stream is tolerated.
        connection.track_failure(&Error::refused_stream());
        assert!(!connection.no_new_exchanges_set());
        connection.track_failure(&Error::refused_stream());
        assert!(connection.no_new_exchanges_set());

        let connection = new_idle_connection("http://a.example/");
        connection.track_failure(&Error::shutdown("goaway"));
        assert!(connection.no_new_exchanges_set());
        assert_eq!(connection.route_failure_count(), 0);

        let connection = new_idle_connection("http://a.example/");
        connection.track_failure(&Error::io("reset"));
        assert!(connection.no_new_exchanges_set());
        assert_eq!(connection.route_failure_count(), 1);
    }
}
