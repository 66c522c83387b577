//! Constrains which certificates are trusted for a host, in addition to the
//! trust decisions the TLS engine already makes.
//!
//! A pin asserts that a host's cleaned certificate chain must contain at
//! least one certificate whose SubjectPublicKeyInfo hashes to a known value.

use std::{fmt, sync::Arc};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use sha1::Sha1;
use sha2::{Digest as _, Sha256};

use super::Certificate;
use crate::error::Error;

/// Orders and normalizes a presented chain into a verified path from the
/// leaf to a trust anchor, before pins are evaluated against it.
///
/// The default pinner evaluates the presented chain as-is.
pub trait CertificateChainCleaner: Send + Sync {
    fn clean(&self, chain: Vec<Certificate>, hostname: &str) -> crate::Result<Vec<Certificate>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PinAlgorithm {
    Sha1,
    Sha256,
}

impl PinAlgorithm {
    fn as_str(&self) -> &'static str {
        match self {
            PinAlgorithm::Sha1 => "sha1",
            PinAlgorithm::Sha256 => "sha256",
        }
    }
}

/// One pinned SubjectPublicKeyInfo hash for a host pattern.
///
/// Patterns take three forms: an exact host (`example.com`), a single-label
/// wildcard (`*.example.com`, exactly one extra label), and a multi-label
/// wildcard (`**.example.com`, any number of extra labels including zero).
#[derive(Clone, PartialEq, Eq)]
pub struct Pin {
    pattern: String,
    algorithm: PinAlgorithm,
    hash: Bytes,
}

impl Pin {
    /// Parses a pin of the form `sha256/<base64>` or `sha1/<base64>`.
    pub fn new(pattern: &str, pin: &str) -> crate::Result<Pin> {
        let (algorithm, encoded) = if let Some(rest) = pin.strip_prefix("sha256/") {
            (PinAlgorithm::Sha256, rest)
        } else if let Some(rest) = pin.strip_prefix("sha1/") {
            (PinAlgorithm::Sha1, rest)
        } else {
            return Err(Error::builder(format!(
                "pins must start with sha256/ or sha1/: {pin}"
            )));
        };

        let hash = BASE64
            .decode(encoded)
            .map_err(|e| Error::builder(format!("invalid pin hash {pin}: {e}")))?;
        let expected = match algorithm {
            PinAlgorithm::Sha1 => 20,
            PinAlgorithm::Sha256 => 32,
        };
        if hash.len() != expected {
            return Err(Error::builder(format!("invalid pin hash length: {pin}")));
        }

        Ok(Pin {
            pattern: pattern.to_ascii_lowercase(),
            algorithm,
            hash: Bytes::from(hash),
        })
    }

    /// Whether this pin's pattern covers `hostname`.
    pub fn matches_hostname(&self, hostname: &str) -> bool {
        let hostname = hostname.to_ascii_lowercase();
        if let Some(suffix) = self.pattern.strip_prefix("**.") {
            // Any number of prefix labels, including zero.
            hostname == suffix || {
                hostname.len() > suffix.len()
                    && hostname.ends_with(suffix)
                    && hostname.as_bytes()[hostname.len() - suffix.len() - 1] == b'.'
            }
        } else if let Some(suffix) = self.pattern.strip_prefix("*.") {
            // Exactly one prefix label.
            match hostname.split_once('.') {
                Some((label, rest)) => !label.is_empty() && rest == suffix,
                None => false,
            }
        } else {
            hostname == self.pattern
        }
    }

    fn matches_certificate(&self, certificate: &Certificate) -> bool {
        let Some(key) = certificate.public_key() else {
            return false;
        };
        let computed = hash_public_key(self.algorithm, key);
        constant_time_eq(&computed, &self.hash)
    }
}

impl fmt::Debug for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.pattern, self)
    }
}

impl fmt::Display for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.algorithm.as_str(), BASE64.encode(&self.hash))
    }
}

fn hash_public_key(algorithm: PinAlgorithm, key: &[u8]) -> Vec<u8> {
    match algorithm {
        PinAlgorithm::Sha1 => Sha1::digest(key).to_vec(),
        PinAlgorithm::Sha256 => Sha256::digest(key).to_vec(),
    }
}

/// Hash comparison that does not leak a match position through timing.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut acc = 0u8;
    for (x, y) in a.iter().zip(b) {
        acc |= x ^ y;
    }
    acc == 0
}

/// Validates peer certificate chains against pinned public-key hashes.
#[derive(Clone, Default)]
pub struct CertificatePinner {
    pins: Vec<Pin>,
    cleaner: Option<Arc<dyn CertificateChainCleaner>>,
}

impl CertificatePinner {
    pub fn builder() -> CertificatePinnerBuilder {
        CertificatePinnerBuilder { pins: Vec::new() }
    }

    pub(crate) fn with_cleaner(mut self, cleaner: Arc<dyn CertificateChainCleaner>) -> Self {
        self.cleaner = Some(cleaner);
        self
    }

    /// The pins whose pattern covers `hostname`.
    pub fn pins_for_hostname(&self, hostname: &str) -> Vec<&Pin> {
        self.pins
            .iter()
            .filter(|pin| pin.matches_hostname(hostname))
            .collect()
    }

    /// Confirms that at least one certificate in the cleaned chain satisfies
    /// at least one pin for `hostname`. Hosts with no matching pins pass.
    pub fn check(&self, hostname: &str, chain: &[Certificate]) -> crate::Result<()> {
        let pins = self.pins_for_hostname(hostname);
        if pins.is_empty() {
            return Ok(());
        }

        let cleaned = match &self.cleaner {
            Some(cleaner) => cleaner.clean(chain.to_vec(), hostname)?,
            None => chain.to_vec(),
        };

        for certificate in &cleaned {
            for pin in &pins {
                if pin.matches_certificate(certificate) {
                    return Ok(());
                }
            }
        }

        // Build a message enumerating what was presented and what was pinned.
        let mut message = String::from("certificate pinning failure\n  peer certificate chain:");
        for certificate in &cleaned {
            match certificate.public_key() {
                Some(key) => {
                    let hash = BASE64.encode(hash_public_key(PinAlgorithm::Sha256, key));
                    message.push_str(&format!("\n    sha256/{hash}"));
                }
                None => message.push_str("\n    <public key unavailable>"),
            }
        }
        message.push_str(&format!("\n  pinned certificates for {hostname}:"));
        for pin in &pins {
            message.push_str(&format!("\n    {pin}"));
        }
        Err(Error::pinning(message))
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pins.is_empty()
    }
}

impl fmt::Debug for CertificatePinner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificatePinner")
            .field("pins", &self.pins)
            .finish()
    }
}

impl PartialEq for CertificatePinner {
    fn eq(&self, other: &CertificatePinner) -> bool {
        self.pins == other.pins
    }
}

/// Builds a [`CertificatePinner`].
#[derive(Default)]
pub struct CertificatePinnerBuilder {
    pins: Vec<Pin>,
}

impl CertificatePinnerBuilder {
    /// Pins `pin` (e.g. `sha256/AAAA…`) for hosts matching `pattern`.
    pub fn add(mut self, pattern: &str, pin: &str) -> crate::Result<CertificatePinnerBuilder> {
        self.pins.push(Pin::new(pattern, pin)?);
        Ok(self)
    }

    pub fn build(self) -> CertificatePinner {
        CertificatePinner {
            pins: self.pins,
            cleaner: None,
        }
    }
}
