#![deny(unsafe_code)]

//! # courier
//!
//! A connection-pooling HTTP/1.1 and HTTP/2 client core.
//!
//! courier owns the hard middle of an HTTP client (scheduling, retries,
//! redirects, caching, routing, pooling) and delegates the edges: wire
//! codecs, TLS engines, DNS, cookie jars and proxy selection plug in behind
//! small traits in [`transport`], [`dns`], [`cookie`] and [`proxy`].
//!
//! - Synchronous and dispatched (callback) calls
//! - A dispatcher with global and per-host concurrency limits
//! - Transparent retries, redirects and auth follow-ups
//! - An RFC 7234 response cache with conditional revalidation
//! - Route selection with failure memory and HTTP/2 connection coalescing
//! - Certificate pinning
//!
//! ## Making a request
//!
//! ```rust,no_run
//! use courier::{Client, Request};
//!
//! fn main() -> Result<(), courier::Error> {
//!     let client = Client::builder()
//!         .user_agent("courier-example")
//!         .build()?;
//!
//!     let request = Request::builder()
//!         .url("http://example.com/")
//!         .build()?;
//!     let mut response = client.new_call(request).execute()?;
//!     println!("{} {}", response.status(), response.text()?);
//!     Ok(())
//! }
//! ```
//!
//! **NOTE**: a `Client` holds a dispatcher, a connection pool and
//! (optionally) a cache. Create one and share clones of it; per-request
//! clients forfeit connection reuse.

pub mod auth;
pub mod cache;
pub mod cookie;
pub mod dns;
pub mod proxy;
pub mod tls;
pub mod transport;

mod address;
mod body;
mod call;
mod client;
mod connection;
mod dispatcher;
mod error;
mod interceptor;
mod into_url;
mod protocol;
mod request;
mod response;
mod route;
mod sync;
mod task;
mod util;

pub use address::Address;
pub use body::Body;
pub use cache::{Cache, CacheControl, CacheStore, MemoryStore};
pub use call::Call;
pub use client::{Client, ClientBuilder};
pub use connection::ConnectionPool;
pub use dispatcher::Dispatcher;
pub use error::{BoxError, CertificateRejected, Error, Result};
pub use interceptor::{Chain, Interceptor};
pub use into_url::IntoUrl;
pub use protocol::Protocol;
pub use request::{Request, RequestBuilder};
pub use response::{Response, ResponseBody, ResponseBuilder};
pub use route::{Route, SocketTarget};
pub use tls::{Certificate, CertificatePinner, CipherSuite, Handshake, TlsVersion};

pub use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
pub use url::Url;
