use std::fmt;

// ---

use url::Url;

// ---

use super::error::{Result, TsEdgeError};

// ---------------------------------------------------------------------------
// Endpoint
// ---------------------------------------------------------------------------

/// Server address and security mode resolved from a server URL.
///
/// `https://host[:port][/path]` enables TLS; any other scheme, or a bare
/// `host[:port]` without a scheme, does not. A scheme-qualified URL must
/// name a host. Its port falls back to the scheme's default when one is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    // ---
    pub address: String,
    pub tls: bool,
}

// ---

impl Endpoint {
    // ---
    pub fn parse(url: &str) -> Result<Self> {
        // ---
        let url = url.trim();
        if url.is_empty() {
            return Err(invalid(url, "empty"));
        }
        if url.contains("://") {
            Self::parse_qualified(url)
        } else {
            Self::parse_bare(url)
        }
    }

    fn parse_qualified(raw: &str) -> Result<Self> {
        // ---
        let parsed = Url::parse(raw).map_err(|e| invalid(raw, &e.to_string()))?;
        let host = parsed
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid(raw, "no host"))?;

        let mut address = match parsed.port_or_known_default() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        let path = parsed.path();
        if !path.is_empty() && path != "/" {
            address.push_str(path);
        }

        Ok(Self {
            address,
            tls: parsed.scheme() == "https",
        })
    }

    /// `host[:port]` with no scheme, kept verbatim once it validates.
    fn parse_bare(raw: &str) -> Result<Self> {
        // ---
        let as_http = Url::parse(&format!("http://{raw}")).map_err(|e| invalid(raw, &e.to_string()))?;
        if as_http.host_str().is_none() || as_http.path() != "/" {
            return Err(invalid(raw, "expected host[:port]"));
        }
        Ok(Self {
            address: raw.to_string(),
            tls: false,
        })
    }
}

fn invalid(raw: &str, reason: &str) -> TsEdgeError {
    TsEdgeError::InvalidEndpoint(format!("{raw:?}: {reason}"))
}

// ---

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.tls { "https" } else { "http" };
        write!(f, "{scheme}://{}", self.address)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
