use std::{error::Error as StdError, fmt, io};

use url::Url;

/// A `Result` alias where the `Err` case is `courier::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// A boxed error type that can be used for dynamic error handling.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// The errors that may occur while preparing, dispatching or reading a call.
///
/// Note: errors may include the full URL used to make the request. If the URL
/// contains sensitive information (e.g. an API key as a query parameter), be
/// sure to remove it ([`without_url`](Error::without_url)).
pub struct Error {
    inner: Box<Inner>,
}

struct Inner {
    kind: Kind,
    source: Option<BoxError>,
    url: Option<Url>,
    /// Failures that were consumed by the retry machinery before this error
    /// surfaced. The earliest failure comes first.
    suppressed: Vec<Error>,
}

impl Error {
    pub(crate) fn new<E>(kind: Kind, source: Option<E>) -> Error
    where
        E: Into<BoxError>,
    {
        Error {
            inner: Box::new(Inner {
                kind,
                source: source.map(Into::into),
                url: None,
                suppressed: Vec::new(),
            }),
        }
    }

    pub(crate) fn builder<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Builder, Some(e))
    }

    pub(crate) fn canceled() -> Error {
        Error::new(Kind::Canceled, None::<Error>)
    }

    // Constructors below are public so transport and store collaborators
    // can classify their failures the way the retry machinery expects.

    /// A violation of the HTTP protocol by the peer. Never retried.
    pub fn protocol<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Protocol, Some(e))
    }

    /// A failure establishing a connection: DNS, TCP or TLS.
    pub fn connect<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Connect, Some(e))
    }

    /// An I/O failure during an exchange.
    pub fn io<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Io, Some(e))
    }

    /// A socket or deadline timeout.
    pub fn timeout<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Timeout, Some(e))
    }

    pub(crate) fn pinning<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Pinning, Some(e))
    }

    /// The peer refused the stream (HTTP/2 `REFUSED_STREAM`): nothing was
    /// processed, so the attempt is replayable.
    pub fn refused_stream() -> Error {
        Error::new(Kind::RefusedStream, None::<Error>)
    }

    /// The peer is shutting the connection down gracefully (HTTP/2
    /// `GOAWAY`); the attempt is treated as never started.
    pub fn shutdown<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Shutdown, Some(e))
    }

    /// A malfunction in the cache store.
    pub fn cache<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Cache, Some(e))
    }

    pub(crate) fn url_bad_scheme(url: Url) -> Error {
        Error::new(Kind::Builder, Some(BadScheme)).with_url(url)
    }
}

impl Error {
    /// Returns a possible URL related to this error.
    pub fn url(&self) -> Option<&Url> {
        self.inner.url.as_ref()
    }

    /// Add a URL related to this error (overwriting any existing).
    pub fn with_url(mut self, url: Url) -> Self {
        self.inner.url = Some(url);
        self
    }

    /// Strip the related URL from this error (if, for example, it contains
    /// sensitive information).
    pub fn without_url(mut self) -> Self {
        self.inner.url = None;
        self
    }

    /// Failures that were recovered from before this error surfaced.
    ///
    /// When the retry machinery gives up, the failed attempts that preceded
    /// the final one are carried here, earliest first.
    pub fn suppressed(&self) -> &[Error] {
        &self.inner.suppressed
    }

    pub(crate) fn push_suppressed(&mut self, e: Error) {
        self.inner.suppressed.push(e);
    }

    pub(crate) fn with_suppressed(mut self, suppressed: Vec<Error>) -> Self {
        self.inner.suppressed = suppressed;
        self
    }

    /// Returns true if the error came from building a client or a request.
    pub fn is_builder(&self) -> bool {
        matches!(self.inner.kind, Kind::Builder)
    }

    /// Returns true if the call was canceled.
    pub fn is_canceled(&self) -> bool {
        matches!(self.inner.kind, Kind::Canceled)
    }

    /// Returns true if the error is a protocol violation, including an
    /// exhausted follow-up budget.
    pub fn is_protocol(&self) -> bool {
        matches!(self.inner.kind, Kind::Protocol)
    }

    /// Returns true if the error occurred while establishing a connection:
    /// DNS lookup, TCP connect or TLS handshake.
    pub fn is_connect(&self) -> bool {
        matches!(self.inner.kind, Kind::Connect)
    }

    /// Returns true if the peer's certificate chain did not satisfy a
    /// configured pin.
    pub fn is_pinning(&self) -> bool {
        matches!(self.inner.kind, Kind::Pinning)
    }

    /// Returns true if the error is related to a timeout, including the
    /// per-call deadline.
    pub fn is_timeout(&self) -> bool {
        if matches!(self.inner.kind, Kind::Timeout) {
            return true;
        }

        let mut source = self.source();
        while let Some(err) = source {
            if err.is::<TimedOut>() {
                return true;
            }
            if let Some(io) = err.downcast_ref::<io::Error>() {
                if io.kind() == io::ErrorKind::TimedOut || io.kind() == io::ErrorKind::WouldBlock {
                    return true;
                }
            }
            source = err.source();
        }

        false
    }

    pub(crate) fn is_refused_stream(&self) -> bool {
        matches!(self.inner.kind, Kind::RefusedStream)
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        matches!(self.inner.kind, Kind::Shutdown)
    }

    pub(crate) fn is_certificate_rejection(&self) -> bool {
        if self.is_pinning() {
            return true;
        }
        let mut source = self.source();
        while let Some(err) = source {
            if err.is::<CertificateRejected>() {
                return true;
            }
            source = err.source();
        }
        false
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut builder = f.debug_struct("courier::Error");

        builder.field("kind", &self.inner.kind);

        if let Some(ref url) = self.inner.url {
            builder.field("url", &url.as_str());
        }

        if let Some(ref source) = self.inner.source {
            builder.field("source", source);
        }

        if !self.inner.suppressed.is_empty() {
            builder.field("suppressed", &self.inner.suppressed);
        }

        builder.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.inner.kind {
            Kind::Builder => f.write_str("builder error")?,
            Kind::Canceled => f.write_str("call canceled")?,
            Kind::Protocol => f.write_str("protocol error")?,
            Kind::Connect => f.write_str("connect error")?,
            Kind::Io => f.write_str("i/o error during exchange")?,
            Kind::Timeout => f.write_str("operation timed out")?,
            Kind::Pinning => f.write_str("certificate pinning failure")?,
            Kind::RefusedStream => f.write_str("stream refused by peer")?,
            Kind::Shutdown => f.write_str("connection shut down by peer")?,
            Kind::Cache => f.write_str("cache error")?,
        };

        if let Some(url) = &self.inner.url {
            write!(f, " for url ({url})")?;
        }

        if let Some(e) = &self.inner.source {
            write!(f, ": {e}")?;
        }

        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner.source.as_ref().map(|e| &**e as _)
    }
}

#[derive(Debug)]
pub(crate) enum Kind {
    Builder,
    Canceled,
    Protocol,
    Connect,
    Io,
    Timeout,
    Pinning,
    RefusedStream,
    Shutdown,
    Cache,
}

/// Marker for socket or deadline expiry, carried in error source chains.
#[derive(Debug)]
pub(crate) struct TimedOut;

impl fmt::Display for TimedOut {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("operation timed out")
    }
}

impl StdError for TimedOut {}

/// Marker used by TLS collaborators to flag a certificate validation
/// rejection, which excludes the failure from route retries.
#[derive(Debug)]
pub struct CertificateRejected;

impl fmt::Display for CertificateRejected {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("peer certificate rejected")
    }
}

impl StdError for CertificateRejected {}

#[derive(Debug)]
pub(crate) struct BadScheme;

impl fmt::Display for BadScheme {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("URL scheme is not allowed")
    }
}

impl StdError for BadScheme {}
