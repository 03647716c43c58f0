//! SIP URIs as used in routing headers
//!
//! Only the parts the HA layer reasons about are broken out (scheme, user,
//! host, port). URI parameters are kept as raw `name[=value]` strings so a
//! route entry prints back exactly as it was received.

use std::fmt;
use std::str::FromStr;

use crate::errors::HaError;

/// Default SIP port when a URI carries none
pub const DEFAULT_SIP_PORT: u16 = 5060;

/// A `sip:` or `sips:` URI
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SipUri {
    pub scheme: String,
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    /// Raw URI parameters, in order (`lr`, `transport=udp`, ...)
    pub params: Vec<String>,
}

impl SipUri {
    /// Create a `sip:` URI for a host and optional port
    pub fn new(host: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            scheme: "sip".to_string(),
            user: None,
            host: host.into(),
            port,
            params: Vec::new(),
        }
    }

    /// Set the user part
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Add the loose-routing `lr` parameter (RFC 3261 19.1.1)
    pub fn with_lr(mut self) -> Self {
        if !self.is_loose_route() {
            self.params.push("lr".to_string());
        }
        self
    }

    /// True when the `lr` parameter is present
    pub fn is_loose_route(&self) -> bool {
        self.params.iter().any(|p| p.eq_ignore_ascii_case("lr"))
    }

    /// Port, defaulting to 5060
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_SIP_PORT)
    }

    /// `host:port` string identifying the endpoint this URI resolves to
    pub fn host_port(&self) -> String {
        format!("{}:{}", self.host, self.effective_port())
    }

    /// True when both URIs address the same host and port
    pub fn same_endpoint(&self, other: &SipUri) -> bool {
        self.host.eq_ignore_ascii_case(&other.host) && self.effective_port() == other.effective_port()
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme)?;
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        f.write_str(&self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        for param in &self.params {
            write!(f, ";{}", param)?;
        }
        Ok(())
    }
}

impl FromStr for SipUri {
    type Err = HaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().trim_start_matches('<').trim_end_matches('>');
        let (scheme, rest) = s
            .split_once(':')
            .ok_or_else(|| HaError::protocol(format!("URI without scheme: {}", s)))?;
        if !scheme.eq_ignore_ascii_case("sip") && !scheme.eq_ignore_ascii_case("sips") {
            return Err(HaError::protocol(format!("Unsupported URI scheme: {}", scheme)));
        }

        let mut parts = rest.split(';');
        let address = parts.next().unwrap_or_default();
        let params: Vec<String> = parts.filter(|p| !p.is_empty()).map(str::to_string).collect();

        let (user, host_port) = match address.rsplit_once('@') {
            Some((user, host_port)) => (Some(user.to_string()), host_port),
            None => (None, address),
        };

        // IPv6 references keep their brackets and may contain ':' themselves
        let (host, port) = match host_port.find(']') {
            Some(end) => (&host_port[..=end], host_port[end + 1..].strip_prefix(':')),
            None => match host_port.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (host_port, None),
            },
        };
        let port = port
            .map(|p| p.parse::<u16>())
            .transpose()
            .map_err(|_| HaError::protocol(format!("Invalid port in URI: {}", s)))?;
        let host = host.to_string();

        if host.is_empty() {
            return Err(HaError::protocol(format!("URI without host: {}", s)));
        }

        Ok(Self {
            scheme: scheme.to_ascii_lowercase(),
            user,
            host,
            port,
            params,
        })
    }
}
