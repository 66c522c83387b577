//! Proxy configuration.

use std::fmt;

use url::Url;

/// How a connection reaches an origin: directly, through an HTTP proxy, or
/// through a SOCKS proxy.
///
/// For an HTTP proxy the proxy's own address is what gets resolved and
/// connected; for SOCKS the origin's name travels to the proxy unresolved.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Proxy {
    /// No proxy; connect straight to the origin.
    Direct,
    /// An absolute-form HTTP proxy at `host:port`.
    Http { host: String, port: u16 },
    /// A SOCKS proxy at `host:port`.
    Socks { host: String, port: u16 },
}

impl Proxy {
    /// An HTTP proxy at `host:port`.
    pub fn http(host: impl Into<String>, port: u16) -> Proxy {
        Proxy::Http {
            host: host.into(),
            port,
        }
    }

    /// A SOCKS proxy at `host:port`.
    pub fn socks(host: impl Into<String>, port: u16) -> Proxy {
        Proxy::Socks {
            host: host.into(),
            port,
        }
    }

    pub fn is_direct(&self) -> bool {
        matches!(self, Proxy::Direct)
    }

    /// The proxy's own address, when there is one.
    pub fn host_and_port(&self) -> Option<(&str, u16)> {
        match self {
            Proxy::Direct => None,
            Proxy::Http { host, port } | Proxy::Socks { host, port } => Some((host, *port)),
        }
    }
}

impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Proxy::Direct => f.write_str("direct"),
            Proxy::Http { host, port } => write!(f, "http://{host}:{port}"),
            Proxy::Socks { host, port } => write!(f, "socks://{host}:{port}"),
        }
    }
}

/// Chooses the proxies to attempt for a URL, in preference order.
///
/// Consulted only when the client does not pin a single proxy. Returning an
/// empty list means "direct".
pub trait ProxySelector: Send + Sync {
    fn select(&self, url: &Url) -> Vec<Proxy>;

    /// Reports that connecting through `proxy` failed, so a selector backed
    /// by system configuration can react.
    fn connect_failed(&self, url: &Url, proxy: &Proxy) {
        let _ = (url, proxy);
    }
}

/// The default selector: everything goes direct.
#[derive(Debug, Default)]
pub struct DirectSelector;

impl ProxySelector for DirectSelector {
    fn select(&self, _url: &Url) -> Vec<Proxy> {
        vec![Proxy::Direct]
    }
}
