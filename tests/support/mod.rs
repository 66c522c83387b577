//! A scripted transport stack: fake DNS, sockets, TLS and codecs, so whole
//! request flows run without touching the network.

#![allow(dead_code)]

use std::{
    collections::HashMap,
    io::{self, Read, Write},
    net::IpAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use bytes::Bytes;
use courier::{
    dns::Resolve,
    tls::{Certificate, CipherSuite, Handshake, TlsVersion},
    transport::{
        CancelToken, ExchangeCodec, ResponseHead, SocketFactory, Stream, StreamCloser,
        TlsConnector, TlsSession, Transport, TransportFactory,
    },
    Address, Body, Client, Error, HeaderMap, HeaderName, HeaderValue, Protocol, Request, Route,
    StatusCode, Url,
};
use crossbeam_channel::{Receiver, RecvTimeoutError};

// ===== DNS =====

pub struct FakeDns {
    hosts: HashMap<String, Vec<IpAddr>>,
}

impl FakeDns {
    pub fn new() -> FakeDns {
        FakeDns {
            hosts: HashMap::new(),
        }
    }

    pub fn host(mut self, name: &str, ips: &[[u8; 4]]) -> FakeDns {
        self.hosts.insert(
            name.to_owned(),
            ips.iter().map(|ip| IpAddr::from(*ip)).collect(),
        );
        self
    }
}

impl Resolve for FakeDns {
    fn resolve(&self, host: &str) -> courier::Result<Vec<IpAddr>> {
        self.hosts
            .get(host)
            .cloned()
            .ok_or_else(|| Error::connect(format!("fake dns has no entry for {host}")))
    }
}

// ===== sockets =====

pub struct FakeStream;

impl Read for FakeStream {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Ok(0)
    }
}

impl Write for FakeStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct NoopCloser;

impl StreamCloser for NoopCloser {
    fn close(&self) {}
}

impl Stream for FakeStream {
    fn closer(&self) -> Box<dyn StreamCloser> {
        Box::new(NoopCloser)
    }

    fn set_read_timeout(&self, _timeout: Option<Duration>) -> io::Result<()> {
        Ok(())
    }

    fn set_write_timeout(&self, _timeout: Option<Duration>) -> io::Result<()> {
        Ok(())
    }
}

pub struct FakeSocketFactory;

impl SocketFactory for FakeSocketFactory {
    fn connect(&self, _route: &Route, _timeout: Option<Duration>) -> io::Result<Box<dyn Stream>> {
        Ok(Box::new(FakeStream))
    }
}

// ===== TLS =====

/// A TLS engine whose handshake always succeeds, presenting one certificate
/// covering `cert_hosts` and negotiating `alpn`.
pub struct FakeTls {
    pub cert_hosts: Vec<String>,
    pub public_key: Vec<u8>,
    pub alpn: Protocol,
}

impl FakeTls {
    pub fn covering(hosts: &[&str], alpn: Protocol) -> FakeTls {
        FakeTls {
            cert_hosts: hosts.iter().map(|h| (*h).to_owned()).collect(),
            public_key: b"fake-server-key".to_vec(),
            alpn,
        }
    }
}

impl TlsConnector for FakeTls {
    fn handshake(&self, stream: Box<dyn Stream>, _address: &Address) -> courier::Result<TlsSession> {
        let certificate = Certificate::new(
            Bytes::from_static(b"fake-der"),
            Bytes::from(self.public_key.clone()),
            self.cert_hosts.clone(),
        );
        Ok(TlsSession {
            stream,
            handshake: Handshake::new(
                TlsVersion::Tls13,
                CipherSuite::from_name("TLS_AES_128_GCM_SHA256"),
                vec![certificate],
                vec![],
            ),
            protocol: Some(self.alpn),
        })
    }
}

// ===== scripted exchanges =====

/// What the fake server does with one exchange.
pub enum Reply {
    Respond {
        status: u16,
        headers: Vec<(&'static str, String)>,
        body: Vec<u8>,
        /// When set, the response head is held until the channel yields.
        gate: Option<Receiver<()>>,
    },
    Fail(fn() -> Error),
}

impl Reply {
    pub fn status(status: u16) -> Reply {
        Reply::Respond {
            status,
            headers: Vec::new(),
            body: Vec::new(),
            gate: None,
        }
    }

    pub fn ok(body: &str) -> Reply {
        Reply::status(200).body(body.as_bytes())
    }

    pub fn header(mut self, name: &'static str, value: impl Into<String>) -> Reply {
        if let Reply::Respond { headers, .. } = &mut self {
            headers.push((name, value.into()));
        }
        self
    }

    pub fn body(mut self, bytes: &[u8]) -> Reply {
        if let Reply::Respond { body, .. } = &mut self {
            *body = bytes.to_vec();
        }
        self
    }

    pub fn gated(mut self, gate: Receiver<()>) -> Reply {
        if let Reply::Respond { gate: slot, .. } = &mut self {
            *slot = Some(gate);
        }
        self
    }
}

/// A request as the wire saw it.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

struct ScriptInner {
    replies: Mutex<Vec<Reply>>,
    requests: Mutex<Vec<RecordedRequest>>,
    connects: AtomicUsize,
}

/// The shared fake server: a FIFO of scripted replies, plus a record of
/// every connection made and request written.
#[derive(Clone)]
pub struct Script {
    inner: Arc<ScriptInner>,
}

impl Script {
    pub fn new(replies: Vec<Reply>) -> Script {
        Script {
            inner: Arc::new(ScriptInner {
                replies: Mutex::new(replies),
                requests: Mutex::new(Vec::new()),
                connects: AtomicUsize::new(0),
            }),
        }
    }

    pub fn push(&self, reply: Reply) {
        self.inner.replies.lock().unwrap().push(reply);
    }

    pub fn connect_count(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.inner.requests.lock().unwrap().clone()
    }

    pub fn request(&self, index: usize) -> RecordedRequest {
        self.requests()
            .get(index)
            .unwrap_or_else(|| panic!("no request {index} was recorded"))
            .clone()
    }

    fn pop_reply(&self) -> Reply {
        let mut replies = self.inner.replies.lock().unwrap();
        assert!(!replies.is_empty(), "the script ran out of replies");
        replies.remove(0)
    }

    fn record(&self, request: RecordedRequest) {
        self.inner.requests.lock().unwrap().push(request);
    }
}

impl TransportFactory for Script {
    fn create(
        &self,
        _stream: Box<dyn Stream>,
        protocol: Protocol,
        _route: &Route,
    ) -> courier::Result<Box<dyn Transport>> {
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeTransport {
            script: self.clone(),
            protocol,
        }))
    }
}

struct FakeTransport {
    script: Script,
    protocol: Protocol,
}

impl Transport for FakeTransport {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn new_exchange_codec(&self, cancel: CancelToken) -> courier::Result<Box<dyn ExchangeCodec>> {
        Ok(Box::new(FakeCodec {
            script: self.script.clone(),
            protocol: self.protocol,
            cancel,
            pending: None,
            reply: None,
        }))
    }

    fn is_healthy(&self, _extensive: bool) -> bool {
        true
    }

    fn cancel(&self) {}

    fn close(&self) {}
}

struct FakeCodec {
    script: Script,
    protocol: Protocol,
    cancel: CancelToken,
    pending: Option<RecordedRequest>,
    reply: Option<Reply>,
}

impl ExchangeCodec for FakeCodec {
    fn write_request_headers(&mut self, request: &Request) -> courier::Result<()> {
        self.pending = Some(RecordedRequest {
            method: request.method().to_string(),
            url: request.url().clone(),
            headers: request.headers().clone(),
            body: Vec::new(),
        });
        Ok(())
    }

    fn write_request_body(&mut self, body: &Body) -> courier::Result<()> {
        let mut sink = Vec::new();
        body.write_to(&mut sink)?;
        if let Some(pending) = &mut self.pending {
            pending.body = sink;
        }
        Ok(())
    }

    fn finish_request(&mut self) -> courier::Result<()> {
        if let Some(pending) = self.pending.take() {
            self.script.record(pending);
        }
        Ok(())
    }

    fn read_response_headers(
        &mut self,
        expect_continue: bool,
    ) -> courier::Result<Option<ResponseHead>> {
        let reply = match self.reply.take() {
            Some(reply) => reply,
            None => self.script.pop_reply(),
        };

        match reply {
            Reply::Fail(make_error) => Err(make_error()),
            Reply::Respond {
                status,
                headers,
                body,
                gate,
            } => {
                if let Some(gate) = &gate {
                    // The test controls when this response is released. The
                    // codec polls the cancel token like a real one would.
                    loop {
                        if self.cancel.is_canceled() {
                            return Err(Error::io("stream reset by cancel"));
                        }
                        match gate.recv_timeout(Duration::from_millis(5)) {
                            Ok(()) => break,
                            Err(RecvTimeoutError::Timeout) => continue,
                            Err(RecvTimeoutError::Disconnected) => break,
                        }
                    }
                }
                if expect_continue {
                    // Scripted servers always invite the body.
                    self.reply = Some(Reply::Respond {
                        status,
                        headers,
                        body,
                        gate: None,
                    });
                    return Ok(None);
                }

                let mut map = HeaderMap::new();
                for (name, value) in &headers {
                    map.append(
                        HeaderName::try_from(*name).expect("scripted header name"),
                        HeaderValue::from_str(value).expect("scripted header value"),
                    );
                }
                self.reply = Some(Reply::Respond {
                    status: 0,
                    headers: Vec::new(),
                    body,
                    gate: None,
                });
                Ok(Some(ResponseHead {
                    protocol: self.protocol,
                    status: StatusCode::from_u16(status).expect("scripted status"),
                    message: String::new(),
                    headers: map,
                }))
            }
        }
    }

    fn open_response_body(&mut self) -> courier::Result<(i64, Box<dyn Read + Send>)> {
        let body = match self.reply.take() {
            Some(Reply::Respond { body, .. }) => body,
            _ => Vec::new(),
        };
        let len = body.len() as i64;
        Ok((len, Box::new(io::Cursor::new(body))))
    }
}

// ===== client assembly =====

pub fn http_client(script: &Script, dns: FakeDns) -> Client {
    Client::builder()
        .dns(dns)
        .socket_factory(FakeSocketFactory)
        .transport_factory(script.clone())
        .protocols(vec![Protocol::Http11])
        .build()
        .expect("test client builds")
}

pub fn https_client(script: &Script, dns: FakeDns, tls: FakeTls) -> Client {
    Client::builder()
        .dns(dns)
        .socket_factory(FakeSocketFactory)
        .transport_factory(script.clone())
        .tls(tls)
        .build()
        .expect("test client builds")
}

pub fn get(url: &str) -> Request {
    Request::builder().url(url).build().expect("test request")
}

/// Polls `condition` for up to two seconds.
pub fn wait_until(condition: impl Fn() -> bool) -> bool {
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while std::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}
