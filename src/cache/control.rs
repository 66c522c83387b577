//! `Cache-Control` directives.

use std::fmt;

use http::header::{HeaderMap, CACHE_CONTROL, PRAGMA};

/// The cache directives of a request or response.
///
/// Numeric fields hold `-1` when the directive is absent. `max_stale_secs`
/// is `i64::MAX` for a bare `max-stale`, accepting any staleness. Unknown
/// directives are dropped on parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheControl {
    pub no_cache: bool,
    pub no_store: bool,
    pub max_age_secs: i64,
    pub s_max_age_secs: i64,
    pub is_private: bool,
    pub is_public: bool,
    pub must_revalidate: bool,
    pub max_stale_secs: i64,
    pub min_fresh_secs: i64,
    pub only_if_cached: bool,
    pub no_transform: bool,
    pub immutable: bool,
}

impl Default for CacheControl {
    fn default() -> CacheControl {
        CacheControl {
            no_cache: false,
            no_store: false,
            max_age_secs: -1,
            s_max_age_secs: -1,
            is_private: false,
            is_public: false,
            must_revalidate: false,
            max_stale_secs: -1,
            min_fresh_secs: -1,
            only_if_cached: false,
            no_transform: false,
            immutable: false,
        }
    }
}

impl CacheControl {
    /// Directives for a request that will accept a cached response of any
    /// age and never touch the network.
    pub fn force_cache() -> CacheControl {
        CacheControl {
            only_if_cached: true,
            max_stale_secs: i64::MAX,
            ..CacheControl::default()
        }
    }

    /// Directives for a request that requires full validation of any cached
    /// response.
    pub fn force_network() -> CacheControl {
        CacheControl {
            no_cache: true,
            ..CacheControl::default()
        }
    }

    /// Parses the `Cache-Control` headers of `headers`, folding in a legacy
    /// `Pragma: no-cache`.
    pub fn parse(headers: &HeaderMap) -> CacheControl {
        let mut cc = CacheControl::default();

        let values = headers
            .get_all(CACHE_CONTROL)
            .iter()
            .chain(headers.get_all(PRAGMA).iter());

        for value in values {
            let Ok(value) = value.to_str() else { continue };
            for (name, arg) in directives(value) {
                match name.to_ascii_lowercase().as_str() {
                    "no-cache" => cc.no_cache = true,
                    "no-store" => cc.no_store = true,
                    "max-age" => cc.max_age_secs = parse_seconds(arg, -1),
                    "s-maxage" => cc.s_max_age_secs = parse_seconds(arg, -1),
                    "private" => cc.is_private = true,
                    "public" => cc.is_public = true,
                    "must-revalidate" => cc.must_revalidate = true,
                    // A bare max-stale accepts any staleness at all.
                    "max-stale" => cc.max_stale_secs = parse_seconds(arg, i64::MAX),
                    "min-fresh" => cc.min_fresh_secs = parse_seconds(arg, -1),
                    "only-if-cached" => cc.only_if_cached = true,
                    "no-transform" => cc.no_transform = true,
                    "immutable" => cc.immutable = true,
                    _ => {}
                }
            }
        }

        cc
    }
}

impl fmt::Display for CacheControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut sep = "";
        let mut push = |f: &mut fmt::Formatter<'_>, directive: &str| -> fmt::Result {
            write!(f, "{sep}{directive}")?;
            sep = ", ";
            Ok(())
        };

        if self.no_cache {
            push(f, "no-cache")?;
        }
        if self.no_store {
            push(f, "no-store")?;
        }
        if self.max_age_secs != -1 {
            push(f, &format!("max-age={}", self.max_age_secs))?;
        }
        if self.s_max_age_secs != -1 {
            push(f, &format!("s-maxage={}", self.s_max_age_secs))?;
        }
        if self.is_private {
            push(f, "private")?;
        }
        if self.is_public {
            push(f, "public")?;
        }
        if self.must_revalidate {
            push(f, "must-revalidate")?;
        }
        if self.max_stale_secs == i64::MAX {
            push(f, "max-stale")?;
        } else if self.max_stale_secs != -1 {
            push(f, &format!("max-stale={}", self.max_stale_secs))?;
        }
        if self.min_fresh_secs != -1 {
            push(f, &format!("min-fresh={}", self.min_fresh_secs))?;
        }
        if self.only_if_cached {
            push(f, "only-if-cached")?;
        }
        if self.no_transform {
            push(f, "no-transform")?;
        }
        if self.immutable {
            push(f, "immutable")?;
        }
        Ok(())
    }
}

/// Splits a header value into `(name, argument)` directives, honoring
/// quoted arguments.
fn directives(value: &str) -> Vec<(&str, Option<&str>)> {
    let mut out = Vec::new();
    let bytes = value.as_bytes();
    let mut pos = 0;

    while pos < bytes.len() {
        // Directive name runs to '=' or ','.
        let name_start = pos;
        while pos < bytes.len() && bytes[pos] != b'=' && bytes[pos] != b',' {
            pos += 1;
        }
        let name = value[name_start..pos].trim();

        let mut arg = None;
        if pos < bytes.len() && bytes[pos] == b'=' {
            pos += 1;
            while pos < bytes.len() && bytes[pos] == b' ' {
                pos += 1;
            }
            if pos < bytes.len() && bytes[pos] == b'"' {
                pos += 1;
                let arg_start = pos;
                while pos < bytes.len() && bytes[pos] != b'"' {
                    pos += 1;
                }
                arg = Some(&value[arg_start..pos]);
                pos += 1; // closing quote
            } else {
                let arg_start = pos;
                while pos < bytes.len() && bytes[pos] != b',' {
                    pos += 1;
                }
                arg = Some(value[arg_start..pos].trim());
            }
        }

        if pos < bytes.len() && bytes[pos] == b',' {
            pos += 1;
        }

        if !name.is_empty() {
            out.push((name, arg));
        }
    }

    out
}

/// A directive argument as non-negative whole seconds. Overflow saturates;
/// anything malformed yields `missing`.
fn parse_seconds(arg: Option<&str>, missing: i64) -> i64 {
    let Some(arg) = arg else { return missing };
    if arg.is_empty() || !arg.bytes().all(|b| b.is_ascii_digit()) {
        return missing;
    }
    arg.parse::<i64>().unwrap_or(i64::MAX)
}
