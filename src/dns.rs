//! DNS resolution.

use std::{
    fmt,
    net::{IpAddr, ToSocketAddrs},
    sync::Arc,
};

use once_cell::sync::Lazy;

use crate::error::Error;

/// Trait for customizing DNS resolution.
///
/// Resolution is blocking; it is one of the suspension points of a call and
/// runs on the calling (or dispatcher worker) thread.
pub trait Resolve: Send + Sync {
    /// Resolves `host` to its addresses, in the order connection attempts
    /// should try them.
    fn resolve(&self, host: &str) -> crate::Result<Vec<IpAddr>>;
}

/// The operating system's resolver, via `getaddrinfo`.
#[derive(Debug, Default)]
pub struct SystemResolver;

impl Resolve for SystemResolver {
    fn resolve(&self, host: &str) -> crate::Result<Vec<IpAddr>> {
        let addrs: Vec<IpAddr> = (host, 0)
            .to_socket_addrs()
            .map_err(Error::connect)?
            .map(|addr| addr.ip())
            .collect();
        if addrs.is_empty() {
            return Err(Error::connect(NoAddresses(host.to_owned())));
        }
        Ok(addrs)
    }
}

/// The process-wide default resolver shared by clients that do not configure
/// their own.
pub(crate) static SYSTEM: Lazy<Arc<dyn Resolve>> = Lazy::new(|| Arc::new(SystemResolver));

#[derive(Debug)]
struct NoAddresses(String);

impl fmt::Display for NoAddresses {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dns returned no addresses for {}", self.0)
    }
}

impl std::error::Error for NoAddresses {}
