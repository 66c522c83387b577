//! Routes: the concrete ways an [`Address`] can be reached.

use std::{fmt, net::SocketAddr, sync::Arc};

use crate::{address::Address, error::Error, proxy::Proxy, sync::Mutex};

/// Where a socket actually connects: a resolved IP address, or a name left
/// for a SOCKS proxy to resolve remotely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketTarget {
    Ip(SocketAddr),
    Name(String, u16),
}

impl SocketTarget {
    pub fn port(&self) -> u16 {
        match self {
            SocketTarget::Ip(addr) => addr.port(),
            SocketTarget::Name(_, port) => *port,
        }
    }

    pub fn ip(&self) -> Option<std::net::IpAddr> {
        match self {
            SocketTarget::Ip(addr) => Some(addr.ip()),
            SocketTarget::Name(..) => None,
        }
    }
}

impl fmt::Display for SocketTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketTarget::Ip(addr) => write!(f, "{addr}"),
            SocketTarget::Name(host, port) => write!(f, "{host}:{port}"),
        }
    }
}

/// One concrete path to an address: which proxy to go through and which
/// socket address to dial.
#[derive(Clone, PartialEq)]
pub struct Route {
    address: Address,
    proxy: Proxy,
    target: SocketTarget,
}

impl Route {
    pub(crate) fn new(address: Address, proxy: Proxy, target: SocketTarget) -> Route {
        Route {
            address,
            proxy,
            target,
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn proxy(&self) -> &Proxy {
        &self.proxy
    }

    pub fn target(&self) -> &SocketTarget {
        &self.target
    }

    /// True when the connection must start with an HTTP `CONNECT` tunnel:
    /// a TLS origin behind an HTTP proxy.
    pub fn requires_tunnel(&self) -> bool {
        self.address.is_https() && matches!(self.proxy, Proxy::Http { .. })
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} at {} via {}",
            self.address.host(),
            self.address.port(),
            self.target,
            self.proxy
        )
    }
}

/// A blacklist of routes that recently failed, so fresh alternatives are
/// attempted first.
#[derive(Default)]
pub(crate) struct RouteDatabase {
    failed: Mutex<Vec<Route>>,
}

impl RouteDatabase {
    /// Records a connect failure on `route`.
    pub(crate) fn failed(&self, route: &Route) {
        let mut failed = self.failed.lock();
        if !failed.contains(route) {
            failed.push(route.clone());
        }
    }

    /// Records a success, making the route preferred again.
    pub(crate) fn connected(&self, route: &Route) {
        self.failed.lock().retain(|r| r != route);
    }

    /// Whether `route` should be deferred behind untried alternatives.
    pub(crate) fn should_postpone(&self, route: &Route) -> bool {
        self.failed.lock().contains(route)
    }
}

/// Enumerates the routes for an address: the proxy sequence, each proxy's
/// resolved socket addresses, with recently-failed routes pushed to the very
/// end.
pub(crate) struct RouteSelector {
    address: Address,
    route_database: Arc<RouteDatabase>,
    proxies: Vec<Proxy>,
    next_proxy_index: usize,
    postponed_routes: Vec<Route>,
}

impl RouteSelector {
    pub(crate) fn new(address: Address, route_database: Arc<RouteDatabase>) -> RouteSelector {
        let proxies = match address.proxy() {
            Some(proxy) => vec![proxy.clone()],
            None => {
                let mut proxies = address.proxy_selector().select(address.url());
                if proxies.is_empty() {
                    proxies.push(Proxy::Direct);
                }
                proxies
            }
        };
        RouteSelector {
            address,
            route_database,
            proxies,
            next_proxy_index: 0,
            postponed_routes: Vec::new(),
        }
    }

    pub(crate) fn has_next(&self) -> bool {
        self.next_proxy_index < self.proxies.len() || !self.postponed_routes.is_empty()
    }

    /// The next batch of routes to attempt.
    pub(crate) fn next(&mut self) -> crate::Result<Selection> {
        let mut routes = Vec::new();

        while routes.is_empty() && self.next_proxy_index < self.proxies.len() {
            let proxy = self.proxies[self.next_proxy_index].clone();
            self.next_proxy_index += 1;

            for target in self.targets_for(&proxy)? {
                let route = Route::new(self.address.clone(), proxy.clone(), target);
                if self.route_database.should_postpone(&route) {
                    self.postponed_routes.push(route);
                } else {
                    routes.push(route);
                }
            }
        }

        // Only when every fresh route is spoken for do the recently-failed
        // ones get their turn.
        if routes.is_empty() {
            routes.append(&mut self.postponed_routes);
        }

        if routes.is_empty() {
            return Err(Error::connect(format!(
                "exhausted all routes to {}:{}",
                self.address.host(),
                self.address.port()
            )));
        }

        Ok(Selection { routes, index: 0 })
    }

    fn targets_for(&self, proxy: &Proxy) -> crate::Result<Vec<SocketTarget>> {
        let (socket_host, socket_port) = match proxy {
            // An HTTP proxy is what gets dialed; anything else dials the
            // origin itself.
            Proxy::Http { host, port } => (host.clone(), *port),
            Proxy::Direct | Proxy::Socks { .. } => {
                (self.address.host().to_owned(), self.address.port())
            }
        };

        if socket_port == 0 {
            return Err(Error::connect(format!(
                "no route to {socket_host}: port {socket_port} out of range"
            )));
        }

        if matches!(proxy, Proxy::Socks { .. }) {
            // The SOCKS proxy resolves the name remotely.
            return Ok(vec![SocketTarget::Name(socket_host, socket_port)]);
        }

        let addresses = self.address.dns().resolve(&socket_host)?;
        Ok(addresses
            .into_iter()
            .map(|ip| SocketTarget::Ip(SocketAddr::new(ip, socket_port)))
            .collect())
    }
}

/// A snapshot of routes produced by one [`RouteSelector::next`] call.
#[derive(Debug)]
pub(crate) struct Selection {
    routes: Vec<Route>,
    index: usize,
}

impl Selection {
    pub(crate) fn has_next(&self) -> bool {
        self.index < self.routes.len()
    }

    pub(crate) fn next(&mut self) -> Option<Route> {
        let route = self.routes.get(self.index).cloned()?;
        self.index += 1;
        Some(route)
    }

    /// Every route in this snapshot, for coalescing lookups.
    pub(crate) fn routes(&self) -> &[Route] {
        &self.routes
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;

    use super::*;
    use crate::{
        auth::NoAuth,
        dns::Resolve,
        proxy::{DirectSelector, ProxySelector},
        transport::SystemSocketFactory,
    };

    struct FixedDns(Vec<IpAddr>);

    impl Resolve for FixedDns {
        fn resolve(&self, _host: &str) -> crate::Result<Vec<IpAddr>> {
            Ok(self.0.clone())
        }
    }

    fn address(url: &str, proxy: Option<Proxy>, ips: Vec<IpAddr>) -> Address {
        Address::new(
            &url.parse().unwrap(),
            Arc::new(FixedDns(ips)),
            Arc::new(SystemSocketFactory),
            None,
            None,
            proxy,
            Arc::new(DirectSelector),
            vec![crate::Protocol::Http11],
            Arc::new(NoAuth),
        )
        .unwrap()
    }

    fn ip(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    #[test]
    fn direct_routes_resolve_origin() {
        let address = address("http://h.example/", None, vec![ip(10, 0, 0, 1), ip(10, 0, 0, 2)]);
        let db = Arc::new(RouteDatabase::default());
        let mut selector = RouteSelector::new(address, db);

        assert!(selector.has_next());
        let mut selection = selector.next().unwrap();
        let first = selection.next().unwrap();
        assert_eq!(first.target().ip(), Some(ip(10, 0, 0, 1)));
        assert_eq!(first.target().port(), 80);
        assert!(selection.has_next());
        assert!(!selector.has_next());
    }

    #[test]
    fn http_proxy_target_is_the_proxy() {
        let address = address(
            "http://h.example/",
            Some(Proxy::http("proxy.example", 3128)),
            vec![ip(192, 0, 2, 7)],
        );
        let mut selector = RouteSelector::new(address, Arc::new(RouteDatabase::default()));
        let mut selection = selector.next().unwrap();
        let route = selection.next().unwrap();
        assert_eq!(route.target().port(), 3128);
        assert_eq!(route.proxy(), &Proxy::http("proxy.example", 3128));
    }

    #[test]
    fn socks_target_stays_unresolved() {
        let address = address(
            "http://h.example/",
            Some(Proxy::socks("socks.example", 1080)),
            vec![],
        );
        let mut selector = RouteSelector::new(address, Arc::new(RouteDatabase::default()));
        let mut selection = selector.next().unwrap();
        let route = selection.next().unwrap();
        assert_eq!(
            route.target(),
            &SocketTarget::Name("h.example".to_owned(), 80)
        );
    }

    #[test]
    fn zero_proxy_port_is_rejected() {
        let address = address(
            "http://h.example/",
            Some(Proxy::http("proxy.example", 0)),
            vec![ip(10, 0, 0, 1)],
        );
        let mut selector = RouteSelector::new(address, Arc::new(RouteDatabase::default()));
        let err = selector.next().unwrap_err();
        assert!(err.is_connect());
    }

    #[test]
    fn failed_routes_are_postponed_to_the_end() {
        let ips = vec![ip(10, 0, 0, 1), ip(10, 0, 0, 2)];
        let address = address("http://h.example/", None, ips);
        let db = Arc::new(RouteDatabase::default());

        // Learn the routes, fail the first one.
        {
            let mut selector = RouteSelector::new(address.clone(), db.clone());
            let mut selection = selector.next().unwrap();
            let first = selection.next().unwrap();
            db.failed(&first);
        }

        let mut selector = RouteSelector::new(address.clone(), db.clone());
        let mut selection = selector.next().unwrap();
        assert_eq!(selection.next().unwrap().target().ip(), Some(ip(10, 0, 0, 2)));
        assert!(!selection.has_next());

        // The failed route surfaces in a later batch, once fresh ones ran out.
        assert!(selector.has_next());
        let mut postponed = selector.next().unwrap();
        assert_eq!(postponed.next().unwrap().target().ip(), Some(ip(10, 0, 0, 1)));

        // A success clears the penalty.
        let failed = Route::new(
            address.clone(),
            Proxy::Direct,
            SocketTarget::Ip(SocketAddr::new(ip(10, 0, 0, 1), 80)),
        );
        db.connected(&failed);
        let mut selector = RouteSelector::new(address, db);
        let mut selection = selector.next().unwrap();
        assert_eq!(selection.next().unwrap().target().ip(), Some(ip(10, 0, 0, 1)));
    }

    #[test]
    fn empty_selector_reports_exhaustion() {
        let mut selection_err = {
            let address = address("http://h.example/", None, vec![ip(10, 0, 0, 1)]);
            let mut selector = RouteSelector::new(address, Arc::new(RouteDatabase::default()));
            let _ = selector.next().unwrap();
            selector
        };
        assert!(!selection_err.has_next());
        assert!(selection_err.next().is_err());
    }

    #[test]
    fn default_proxy_selector_yields_direct() {
        let selector = DirectSelector;
        let url = "http://h.example/".parse().unwrap();
        assert_eq!(selector.select(&url), vec![Proxy::Direct]);
    }
}
