//! Target address parsing.
//!
//! A target is either a bare `host:port` authority, whose scheme is chosen
//! from the transport security flag, or a full URI such as
//! `discovery:///my-service` or `https://10.0.0.1:8000`.

use std::fmt;

use percent_encoding::percent_decode_str;
use url::Url;

/// Scheme used by targets that name a service to watch through discovery.
pub const DISCOVERY_SCHEME: &str = "discovery";

const SCHEME_SEPARATOR: &str = "://";

/// Error returned when a target address cannot be parsed.
#[derive(Debug, thiserror::Error)]
pub enum TargetError {
    /// The address is not a valid URI.
    #[error("invalid target {address:?}: {source}")]
    Uri {
        /// The address that failed to parse.
        address: String,
        /// The URI parser error.
        #[source]
        source: url::ParseError,
    },

    /// The path does not percent-decode to UTF-8.
    #[error("invalid target {address:?}: path is not valid UTF-8")]
    Encoding {
        /// The address that failed to parse.
        address: String,
        /// The decoding error.
        #[source]
        source: std::str::Utf8Error,
    },
}

impl TargetError {
    /// The address that failed to parse.
    #[must_use]
    pub fn address(&self) -> &str {
        match self {
            Self::Uri { address, .. } | Self::Encoding { address, .. } => address,
        }
    }
}

/// A parsed target address.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Target {
    /// The lower-cased URI scheme, never empty.
    pub scheme: String,
    /// The `host:port` authority, empty for discovery targets.
    pub authority: String,
    /// The service name to watch, empty for direct targets.
    pub endpoint: String,
}

impl Target {
    /// Returns `true` if the target names a service to resolve through discovery.
    #[must_use]
    pub fn is_discovery(&self) -> bool {
        self.scheme == DISCOVERY_SCHEME
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.authority)?;
        if !self.endpoint.is_empty() {
            write!(f, "/{}", self.endpoint)?;
        }
        Ok(())
    }
}

/// Parses a target address.
///
/// Addresses without a `://` separator are taken verbatim as the authority,
/// with the scheme defaulting to `http` when `insecure` is set and `https`
/// otherwise. When a scheme is given explicitly, `insecure` is not consulted.
///
/// # Errors
///
/// Returns [`TargetError`] if the address contains a scheme separator but is
/// not a valid URI, or if its path does not decode to UTF-8.
pub fn parse_target(address: &str, insecure: bool) -> Result<Target, TargetError> {
    if !address.contains(SCHEME_SEPARATOR) {
        let scheme = if insecure { "http" } else { "https" };
        return Ok(Target {
            scheme: scheme.to_string(),
            authority: address.to_string(),
            endpoint: String::new(),
        });
    }

    // The parser only validates and normalizes the scheme. Special schemes
    // read `https:///demo` as host `demo`, so authority and path come from
    // the raw text.
    let url = Url::parse(address).map_err(|source| TargetError::Uri {
        address: address.to_string(),
        source,
    })?;

    let (authority, path) = split_authority(address);
    let path = path.strip_prefix('/').unwrap_or(path);
    let endpoint = percent_decode_str(path)
        .decode_utf8()
        .map_err(|source| TargetError::Encoding {
            address: address.to_string(),
            source,
        })?;

    Ok(Target {
        scheme: url.scheme().to_string(),
        authority: authority.to_string(),
        endpoint: endpoint.into_owned(),
    })
}

/// Splits a `scheme://authority/path?query` string into its authority, as
/// written and without user info, and its raw path.
pub(crate) fn split_authority(address: &str) -> (&str, &str) {
    let Some((_, rest)) = address.split_once(SCHEME_SEPARATOR) else {
        return ("", "");
    };

    let rest = match rest.find(['?', '#']) {
        Some(end) => &rest[..end],
        None => rest,
    };
    let (authority, path) = match rest.find('/') {
        Some(start) => rest.split_at(start),
        None => (rest, ""),
    };

    let authority = match authority.rfind('@') {
        Some(at) => &authority[at + 1..],
        None => authority,
    };

    (authority, path)
}
