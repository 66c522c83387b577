//! Request bodies.

use std::{
    fmt,
    io::{self, Read, Write},
};

use bytes::Bytes;
use http::HeaderValue;

use crate::{error::Error, sync::Mutex};

/// The payload of a request.
///
/// A buffered body can be written any number of times, which makes its
/// request eligible for retries and redirects that re-send it. A streamed
/// body is one-shot: once transmission begins the call will not replay it.
pub struct Body {
    content_type: Option<HeaderValue>,
    kind: Kind,
}

enum Kind {
    Buffered(Bytes),
    Streamed {
        content_length: Option<u64>,
        reader: Mutex<Option<Box<dyn Read + Send>>>,
    },
}

impl Body {
    /// An empty buffered body.
    pub fn empty() -> Body {
        Body::buffered(Bytes::new())
    }

    /// A replayable body over a byte buffer.
    pub fn buffered(bytes: impl Into<Bytes>) -> Body {
        Body {
            content_type: None,
            kind: Kind::Buffered(bytes.into()),
        }
    }

    /// A one-shot body streamed from `reader`. Pass the length when it is
    /// known; otherwise the request goes out chunked.
    pub fn streamed(content_length: Option<u64>, reader: impl Read + Send + 'static) -> Body {
        Body {
            content_type: None,
            kind: Kind::Streamed {
                content_length,
                reader: Mutex::new(Some(Box::new(reader))),
            },
        }
    }

    /// Sets the media type the `Content-Type` header is synthesized from.
    pub fn with_content_type(mut self, content_type: HeaderValue) -> Body {
        self.content_type = Some(content_type);
        self
    }

    pub fn content_type(&self) -> Option<&HeaderValue> {
        self.content_type.as_ref()
    }

    /// The number of bytes that will be written, when known up front.
    pub fn content_length(&self) -> Option<u64> {
        match &self.kind {
            Kind::Buffered(bytes) => Some(bytes.len() as u64),
            Kind::Streamed { content_length, .. } => *content_length,
        }
    }

    /// True when this body can be transmitted at most once.
    pub fn is_one_shot(&self) -> bool {
        matches!(self.kind, Kind::Streamed { .. })
    }

    /// The buffered bytes, when this body is replayable.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match &self.kind {
            Kind::Buffered(bytes) => Some(bytes),
            Kind::Streamed { .. } => None,
        }
    }

    /// Writes the body to `sink`. A one-shot body errors on the second
    /// attempt.
    pub fn write_to(&self, sink: &mut dyn Write) -> crate::Result<u64> {
        match &self.kind {
            Kind::Buffered(bytes) => {
                sink.write_all(bytes).map_err(Error::io)?;
                Ok(bytes.len() as u64)
            }
            Kind::Streamed { reader, .. } => {
                let mut reader = match reader.lock().take() {
                    Some(reader) => reader,
                    None => return Err(Error::io(OneShotConsumed)),
                };
                io::copy(&mut reader, sink).map_err(Error::io)
            }
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            Kind::Buffered(bytes) => f.debug_struct("Body").field("len", &bytes.len()).finish(),
            Kind::Streamed { content_length, .. } => f
                .debug_struct("Body")
                .field("streamed", &true)
                .field("content_length", content_length)
                .finish(),
        }
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Body {
        Body::buffered(bytes)
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Body {
        Body::buffered(bytes)
    }
}

impl From<String> for Body {
    fn from(s: String) -> Body {
        Body::buffered(s.into_bytes())
    }
}

impl From<&'static str> for Body {
    fn from(s: &'static str) -> Body {
        Body::buffered(Bytes::from_static(s.as_bytes()))
    }
}

#[derive(Debug)]
struct OneShotConsumed;

impl fmt::Display for OneShotConsumed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("one-shot request body was already transmitted")
    }
}

impl std::error::Error for OneShotConsumed {}
