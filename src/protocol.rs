use std::fmt;

use crate::error::Error;

/// An application-layer protocol, as negotiated over ALPN or assumed from
/// prior knowledge.
///
/// `Quic` is recognized so its token parses, but this crate never selects it;
/// a QUIC transport plugs in from the outside. `Spdy3` is kept for parsing
/// legacy configuration only and is rejected on selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// `http/1.0`, a connection per request.
    Http10,
    /// `http/1.1`, serial exchanges over a persistent connection.
    Http11,
    /// `h2`, binary framing and multiplexed streams, negotiated via ALPN.
    H2,
    /// `h2_prior_knowledge`, HTTP/2 over cleartext without negotiation.
    H2PriorKnowledge,
    /// `quic`, externalized transport; never selected by this crate.
    Quic,
    /// `spdy/3.1`, parse-only legacy token.
    Spdy3,
}

impl Protocol {
    /// Parses an ALPN token into a protocol.
    pub fn parse(token: &str) -> crate::Result<Protocol> {
        match token {
            "http/1.0" => Ok(Protocol::Http10),
            "http/1.1" => Ok(Protocol::Http11),
            "h2" => Ok(Protocol::H2),
            "h2_prior_knowledge" => Ok(Protocol::H2PriorKnowledge),
            "quic" => Ok(Protocol::Quic),
            "spdy/3.1" => Ok(Protocol::Spdy3),
            _ => Err(Error::protocol(format!("unexpected protocol: {token}"))),
        }
    }

    /// The ALPN token for this protocol.
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http10 => "http/1.0",
            Protocol::Http11 => "http/1.1",
            Protocol::H2 => "h2",
            Protocol::H2PriorKnowledge => "h2_prior_knowledge",
            Protocol::Quic => "quic",
            Protocol::Spdy3 => "spdy/3.1",
        }
    }

    /// True for protocols that carry several exchanges concurrently on one
    /// connection.
    pub fn is_multiplexed(&self) -> bool {
        matches!(self, Protocol::H2 | Protocol::H2PriorKnowledge)
    }

    /// True for tokens a client configuration may select.
    pub(crate) fn is_selectable(&self) -> bool {
        !matches!(self, Protocol::Quic | Protocol::Spdy3)
    }

    pub(crate) fn http_version(&self) -> http::Version {
        match self {
            Protocol::Http10 => http::Version::HTTP_10,
            Protocol::Http11 => http::Version::HTTP_11,
            Protocol::H2 | Protocol::H2PriorKnowledge => http::Version::HTTP_2,
            Protocol::Quic => http::Version::HTTP_3,
            Protocol::Spdy3 => http::Version::HTTP_11,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validates a protocol list configured on a client.
///
/// `H2PriorKnowledge` must stand alone, `Http11` is otherwise required, and
/// neither `Quic` nor `Spdy3` may be selected.
pub(crate) fn validate_selection(protocols: &[Protocol]) -> crate::Result<()> {
    if protocols.is_empty() {
        return Err(Error::builder("at least one protocol is required"));
    }
    if protocols.contains(&Protocol::H2PriorKnowledge) && protocols.len() > 1 {
        return Err(Error::builder(
            "h2_prior_knowledge cannot be combined with other protocols",
        ));
    }
    for p in protocols {
        if !p.is_selectable() {
            return Err(Error::builder(format!("protocol not selectable: {p}")));
        }
    }
    if !protocols.contains(&Protocol::H2PriorKnowledge) && !protocols.contains(&Protocol::Http11) {
        return Err(Error::builder("protocol list must contain http/1.1"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_round_trips_tokens() {
        for token in ["http/1.0", "http/1.1", "h2", "h2_prior_knowledge", "quic"] {
            assert_eq!(Protocol::parse(token).unwrap().as_str(), token);
        }
        assert!(Protocol::parse("spdy/3.1").is_ok());
        assert!(Protocol::parse("h3-29").unwrap_err().is_protocol());
    }

    #[test]
    fn selection_rules() {
        assert!(validate_selection(&[Protocol::H2, Protocol::Http11]).is_ok());
        assert!(validate_selection(&[Protocol::H2PriorKnowledge]).is_ok());
        assert!(validate_selection(&[]).is_err());
        assert!(validate_selection(&[Protocol::H2]).is_err());
        assert!(validate_selection(&[Protocol::Quic, Protocol::Http11]).is_err());
        assert!(validate_selection(&[Protocol::Spdy3, Protocol::Http11]).is_err());
        assert!(validate_selection(&[Protocol::H2PriorKnowledge, Protocol::Http11]).is_err());
    }
}
