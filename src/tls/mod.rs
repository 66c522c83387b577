//! TLS identity types.
//!
//! The TLS engine itself is a collaborator plugged in through
//! [`TlsConnector`](crate::transport::TlsConnector); this module carries the
//! data it reports back: the handshake snapshot, certificate material, and
//! interned cipher-suite identities.

pub(crate) mod pinner;

use std::{collections::HashSet, fmt, hash::Hash};

use bytes::Bytes;
use once_cell::sync::Lazy;

use crate::sync::Mutex;

pub use pinner::{CertificateChainCleaner, CertificatePinner, CertificatePinnerBuilder, Pin};

/// An X.509 certificate as presented by a peer.
///
/// Carries the DER encoding, and, when produced by a live handshake, the
/// DER-encoded SubjectPublicKeyInfo and the DNS names the certificate covers.
/// Certificates revived from the cache carry only the DER bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct Certificate {
    der: Bytes,
    public_key: Option<Bytes>,
    dns_names: Vec<String>,
}

impl Certificate {
    /// A certificate from its DER encoding alone.
    pub fn from_der(der: impl Into<Bytes>) -> Certificate {
        Certificate {
            der: der.into(),
            public_key: None,
            dns_names: Vec::new(),
        }
    }

    /// A fully described certificate as reported by a TLS handshake.
    pub fn new(
        der: impl Into<Bytes>,
        public_key: impl Into<Bytes>,
        dns_names: Vec<String>,
    ) -> Certificate {
        Certificate {
            der: der.into(),
            public_key: Some(public_key.into()),
            dns_names,
        }
    }

    /// The DER encoding of the certificate.
    pub fn der(&self) -> &Bytes {
        &self.der
    }

    /// The DER-encoded SubjectPublicKeyInfo, when known.
    pub fn public_key(&self) -> Option<&Bytes> {
        self.public_key.as_ref()
    }

    /// The DNS names (subject alternative names) this certificate covers.
    pub fn dns_names(&self) -> &[String] {
        &self.dns_names
    }

    /// Whether this certificate covers `hostname`, honoring a single-label
    /// `*.` wildcard in the leftmost position.
    pub fn matches_hostname(&self, hostname: &str) -> bool {
        let hostname = hostname.to_ascii_lowercase();
        self.dns_names.iter().any(|name| {
            let name = name.to_ascii_lowercase();
            if let Some(suffix) = name.strip_prefix("*.") {
                match hostname.split_once('.') {
                    Some((label, rest)) => !label.is_empty() && rest == suffix,
                    None => false,
                }
            } else {
                name == hostname
            }
        })
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("der_len", &self.der.len())
            .field("dns_names", &self.dns_names)
            .finish()
    }
}

/// A record of a completed TLS handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    tls_version: TlsVersion,
    cipher_suite: CipherSuite,
    peer_certificates: Vec<Certificate>,
    local_certificates: Vec<Certificate>,
}

impl Handshake {
    pub fn new(
        tls_version: TlsVersion,
        cipher_suite: CipherSuite,
        peer_certificates: Vec<Certificate>,
        local_certificates: Vec<Certificate>,
    ) -> Handshake {
        Handshake {
            tls_version,
            cipher_suite,
            peer_certificates,
            local_certificates,
        }
    }

    pub fn tls_version(&self) -> TlsVersion {
        self.tls_version
    }

    pub fn cipher_suite(&self) -> &CipherSuite {
        &self.cipher_suite
    }

    pub fn peer_certificates(&self) -> &[Certificate] {
        &self.peer_certificates
    }

    pub fn local_certificates(&self) -> &[Certificate] {
        &self.local_certificates
    }

    /// The end-entity certificate presented by the peer, if any.
    pub fn peer_leaf(&self) -> Option<&Certificate> {
        self.peer_certificates.first()
    }
}

/// TLS protocol versions by their standard names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TlsVersion {
    Tls13,
    Tls12,
    Tls11,
    Tls10,
    Ssl30,
}

impl TlsVersion {
    pub fn parse(name: &str) -> crate::Result<TlsVersion> {
        match name {
            "TLSv1.3" => Ok(TlsVersion::Tls13),
            "TLSv1.2" => Ok(TlsVersion::Tls12),
            "TLSv1.1" => Ok(TlsVersion::Tls11),
            "TLSv1" => Ok(TlsVersion::Tls10),
            "SSLv3" => Ok(TlsVersion::Ssl30),
            _ => Err(crate::Error::protocol(format!(
                "unexpected TLS version: {name}"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TlsVersion::Tls13 => "TLSv1.3",
            TlsVersion::Tls12 => "TLSv1.2",
            TlsVersion::Tls11 => "TLSv1.1",
            TlsVersion::Tls10 => "TLSv1",
            TlsVersion::Ssl30 => "SSLv3",
        }
    }
}

impl fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Process-wide interning table for cipher-suite identities, so equal names
/// share storage regardless of how many handshakes report them.
static SUITES: Lazy<Mutex<HashSet<&'static str>>> = Lazy::new(|| Mutex::new(HashSet::new()));

/// A cipher suite identified by its Java/IANA-style name.
///
/// Equality and hashing canonicalize the `TLS_`/`SSL_` prefix, so
/// `TLS_RSA_WITH_AES_128_CBC_SHA` equals `SSL_RSA_WITH_AES_128_CBC_SHA`.
#[derive(Clone, Copy)]
pub struct CipherSuite {
    name: &'static str,
}

impl CipherSuite {
    /// Returns the interned suite for `name`.
    pub fn from_name(name: &str) -> CipherSuite {
        let mut table = SUITES.lock();
        if let Some(&interned) = table.get(name) {
            return CipherSuite { name: interned };
        }
        let leaked: &'static str = Box::leak(name.to_owned().into_boxed_str());
        table.insert(leaked);
        CipherSuite { name: leaked }
    }

    /// The suite's reported name, prefix included.
    pub fn as_str(&self) -> &'static str {
        self.name
    }

    fn canonical(&self) -> &str {
        self.name
            .strip_prefix("TLS_")
            .or_else(|| self.name.strip_prefix("SSL_"))
            .unwrap_or(self.name)
    }
}

impl PartialEq for CipherSuite {
    fn eq(&self, other: &CipherSuite) -> bool {
        self.canonical() == other.canonical()
    }
}

impl Eq for CipherSuite {}

impl Hash for CipherSuite {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.canonical().hash(state);
    }
}

impl fmt::Debug for CipherSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

impl fmt::Display for CipherSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}
