//! The logical endpoint of a call.

use std::{fmt, sync::Arc};

use url::Url;

use crate::{
    auth::Authenticator,
    dns::Resolve,
    error::Error,
    protocol::Protocol,
    proxy::{Proxy, ProxySelector},
    tls::CertificatePinner,
    transport::{SocketFactory, TlsConnector},
};

/// Everything needed to reach an origin server, independent of any one URL
/// path: scheme, host, port, and the collaborator stack a connection to that
/// origin must use.
///
/// Two addresses are equal when they may share connections; the URL path and
/// query never participate.
#[derive(Clone)]
pub struct Address {
    url: Url,
    dns: Arc<dyn Resolve>,
    socket_factory: Arc<dyn SocketFactory>,
    tls: Option<Arc<dyn TlsConnector>>,
    pinner: Option<Arc<CertificatePinner>>,
    proxy: Option<Proxy>,
    proxy_selector: Arc<dyn ProxySelector>,
    protocols: Vec<Protocol>,
    proxy_authenticator: Arc<dyn Authenticator>,
}

impl Address {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        url: &Url,
        dns: Arc<dyn Resolve>,
        socket_factory: Arc<dyn SocketFactory>,
        tls: Option<Arc<dyn TlsConnector>>,
        pinner: Option<Arc<CertificatePinner>>,
        proxy: Option<Proxy>,
        proxy_selector: Arc<dyn ProxySelector>,
        protocols: Vec<Protocol>,
        proxy_authenticator: Arc<dyn Authenticator>,
    ) -> crate::Result<Address> {
        let is_https = url.scheme() == "https";
        if is_https != tls.is_some() {
            return Err(Error::builder(if is_https {
                "https requires a TLS connector"
            } else {
                "a TLS connector requires an https URL"
            }));
        }

        // Reduce to scheme://host:port/ so path and query never leak into
        // connection identity.
        let mut base = url.clone();
        base.set_path("/");
        base.set_query(None);
        base.set_fragment(None);

        Ok(Address {
            url: base,
            dns,
            socket_factory,
            tls,
            pinner,
            proxy,
            proxy_selector,
            protocols,
            proxy_authenticator,
        })
    }

    /// The origin as `scheme://host:port/`.
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or("")
    }

    pub fn port(&self) -> u16 {
        self.url.port_or_known_default().unwrap_or(0)
    }

    pub fn is_https(&self) -> bool {
        self.url.scheme() == "https"
    }

    pub fn dns(&self) -> &Arc<dyn Resolve> {
        &self.dns
    }

    pub fn socket_factory(&self) -> &Arc<dyn SocketFactory> {
        &self.socket_factory
    }

    pub fn tls(&self) -> Option<&Arc<dyn TlsConnector>> {
        self.tls.as_ref()
    }

    pub fn pinner(&self) -> Option<&Arc<CertificatePinner>> {
        self.pinner.as_ref()
    }

    pub fn proxy(&self) -> Option<&Proxy> {
        self.proxy.as_ref()
    }

    pub fn proxy_selector(&self) -> &Arc<dyn ProxySelector> {
        &self.proxy_selector
    }

    pub fn protocols(&self) -> &[Protocol] {
        &self.protocols
    }

    pub fn proxy_authenticator(&self) -> &Arc<dyn Authenticator> {
        &self.proxy_authenticator
    }

    /// Equality of everything except the host itself: the eligibility
    /// precondition for HTTP/2 connection coalescing.
    pub(crate) fn equals_non_host(&self, other: &Address) -> bool {
        Arc::ptr_eq(&self.dns, &other.dns)
            && Arc::ptr_eq(&self.socket_factory, &other.socket_factory)
            && Arc::ptr_eq(&self.proxy_selector, &other.proxy_selector)
            && Arc::ptr_eq(&self.proxy_authenticator, &other.proxy_authenticator)
            && self.proxy == other.proxy
            && self.protocols == other.protocols
            && match (&self.tls, &other.tls) {
                (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                (None, None) => true,
                _ => false,
            }
            && match (&self.pinner, &other.pinner) {
                (Some(a), Some(b)) => a == b,
                (None, None) => true,
                _ => false,
            }
            && self.port() == other.port()
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Address) -> bool {
        self.url == other.url && self.equals_non_host(other)
    }
}

impl Eq for Address {}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("Address");
        builder.field("host", &self.host());
        builder.field("port", &self.port());
        if let Some(proxy) = &self.proxy {
            builder.field("proxy", proxy);
        }
        builder.finish()
    }
}
