//! Collaborator interfaces for the transport below the connection layer:
//! raw sockets, the TLS engine, and the wire codecs that frame HTTP/1.1 and
//! HTTP/2 exchanges. This crate drives these interfaces; it does not
//! implement the framing itself.

use std::{
    io::{self, Read, Write},
    net::{Shutdown, TcpStream, ToSocketAddrs},
    time::Duration,
};

use http::{HeaderMap, StatusCode};

use crate::{
    address::Address,
    body::Body,
    protocol::Protocol,
    request::Request,
    route::{Route, SocketTarget},
    tls::Handshake,
};

/// A handle that can shut a stream down from another thread, for cancel
/// fan-out while a read or write is blocked.
pub trait StreamCloser: Send + Sync {
    fn close(&self);
}

/// A connected byte stream. Blocking reads and writes, with socket-level
/// timeouts applied per attempt.
pub trait Stream: Read + Write + Send {
    fn closer(&self) -> Box<dyn StreamCloser>;

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
}

impl Stream for TcpStream {
    fn closer(&self) -> Box<dyn StreamCloser> {
        Box::new(TcpCloser(self.try_clone().ok()))
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_write_timeout(self, timeout)
    }
}

struct TcpCloser(Option<TcpStream>);

impl StreamCloser for TcpCloser {
    fn close(&self) {
        if let Some(stream) = &self.0 {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

/// Opens sockets for routes. Responsible for any proxy tunneling the route
/// requires; the returned stream is ready for an optional TLS handshake.
pub trait SocketFactory: Send + Sync {
    fn connect(&self, route: &Route, timeout: Option<Duration>) -> io::Result<Box<dyn Stream>>;
}

/// Plain TCP sockets via the operating system.
#[derive(Debug, Default)]
pub struct SystemSocketFactory;

impl SocketFactory for SystemSocketFactory {
    fn connect(&self, route: &Route, timeout: Option<Duration>) -> io::Result<Box<dyn Stream>> {
        let stream = match route.target() {
            SocketTarget::Ip(addr) => match timeout {
                Some(timeout) => TcpStream::connect_timeout(addr, timeout)?,
                None => TcpStream::connect(addr)?,
            },
            SocketTarget::Name(host, port) => {
                // Name targets (SOCKS) resolve at the proxy in a full stack;
                // resolving here keeps the system factory usable without one.
                let addr = (host.as_str(), *port).to_socket_addrs()?.next().ok_or_else(|| {
                    io::Error::new(io::ErrorKind::NotFound, "no addresses resolved")
                })?;
                match timeout {
                    Some(timeout) => TcpStream::connect_timeout(&addr, timeout)?,
                    None => TcpStream::connect(&addr)?,
                }
            }
        };
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// The result of a TLS handshake: the encrypted stream, its handshake
/// snapshot, and the ALPN-selected protocol if any.
pub struct TlsSession {
    pub stream: Box<dyn Stream>,
    pub handshake: Handshake,
    pub protocol: Option<Protocol>,
}

/// Performs TLS handshakes. Implementations verify the peer against the
/// platform trust model; pin enforcement happens separately in this crate.
///
/// A certificate validation rejection should carry
/// [`CertificateRejected`](crate::error::CertificateRejected) in its source
/// chain so the failure is excluded from route retries.
pub trait TlsConnector: Send + Sync {
    fn handshake(&self, stream: Box<dyn Stream>, address: &Address) -> crate::Result<TlsSession>;
}

/// The status line and headers of a response, as decoded by a codec.
#[derive(Debug)]
pub struct ResponseHead {
    pub protocol: Protocol,
    pub status: StatusCode,
    pub message: String,
    pub headers: HeaderMap,
}

/// A cancellation flag shared between a call and the codec carrying its
/// exchange.
///
/// Codecs must poll it at their blocking points (socket timeouts make the
/// polling effective) and abandon the exchange when it trips: reset the
/// stream on a multiplexed transport, or surface an I/O error on a serial
/// one, whose socket the call also shuts down.
#[derive(Clone, Default)]
pub struct CancelToken {
    canceled: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.canceled
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(std::sync::atomic::Ordering::SeqCst)
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("CancelToken").field(&self.is_canceled()).finish()
    }
}

/// Frames one request/response pair onto the wire: one HTTP/1.1 request
/// cycle, or one HTTP/2 stream.
pub trait ExchangeCodec: Send {
    fn write_request_headers(&mut self, request: &Request) -> crate::Result<()>;

    /// Streams the request body. Only called for requests that carry one.
    fn write_request_body(&mut self, body: &Body) -> crate::Result<()>;

    /// Flushes the request to the underlying stream.
    fn finish_request(&mut self) -> crate::Result<()>;

    /// Reads the next response head. With `expect_continue` set, returns
    /// `None` when the peer signalled `100 Continue`, meaning the caller
    /// should now transmit the request body and read again.
    fn read_response_headers(&mut self, expect_continue: bool)
        -> crate::Result<Option<ResponseHead>>;

    /// Opens the response body, returning its length (`-1` when unknown)
    /// and a blocking reader.
    fn open_response_body(&mut self) -> crate::Result<(i64, Box<dyn Read + Send>)>;
}

/// A live framed connection, minting [`ExchangeCodec`]s for the exchanges it
/// carries.
pub trait Transport: Send + Sync {
    fn protocol(&self) -> Protocol;

    fn is_multiplexed(&self) -> bool {
        self.protocol().is_multiplexed()
    }

    /// How many exchanges may be live at once. `1` for serial protocols.
    fn allocation_limit(&self) -> usize {
        if self.is_multiplexed() { 32 } else { 1 }
    }

    /// Mints the codec for one exchange. `cancel` is the exchange's
    /// cancellation token; see [`CancelToken`].
    fn new_exchange_codec(&self, cancel: CancelToken) -> crate::Result<Box<dyn ExchangeCodec>>;

    /// A liveness probe. Extensive checks may touch the socket and are used
    /// for requests that cannot be safely retried.
    fn is_healthy(&self, extensive: bool) -> bool;

    /// Abrupt teardown for cancellation.
    fn cancel(&self);

    /// Closes the underlying socket.
    fn close(&self);
}

/// Builds a [`Transport`] over a connected (and possibly TLS-wrapped)
/// stream. The codec implementation plugs in here.
pub trait TransportFactory: Send + Sync {
    fn create(
        &self,
        stream: Box<dyn Stream>,
        protocol: Protocol,
        route: &Route,
    ) -> crate::Result<Box<dyn Transport>>;
}

/// Placeholder factory for clients that never reach the wire (tests, cache
/// replay). Any attempt to connect reports a configuration error.
#[derive(Debug, Default)]
pub(crate) struct UnconfiguredTransport;

impl TransportFactory for UnconfiguredTransport {
    fn create(
        &self,
        _stream: Box<dyn Stream>,
        _protocol: Protocol,
        _route: &Route,
    ) -> crate::Result<Box<dyn Transport>> {
        Err(crate::Error::builder("no transport factory configured"))
    }
}
