//! Upstream endpoint value types
//!
//! An [`Endpoint`] is one configured upstream proxy. Endpoints are plain values:
//! two endpoints are the same upstream iff protocol, address and credentials
//! all match. Invalid credentials (an empty username or password) are dropped
//! at construction so they never take part in comparisons or headers.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as Base64;
use base64::Engine as _;
use thiserror::Error;

/// Upstream proxy protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Http,
    Https,
    Socks5,
}

impl Protocol {
    /// Port used when an endpoint address carries none
    pub fn default_port(&self) -> u16 {
        match self {
            Protocol::Http => 80,
            Protocol::Https => 443,
            Protocol::Socks5 => 1080,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
            Protocol::Socks5 => "socks5",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Unsupported proxy scheme: {0}")]
pub struct UnsupportedScheme(pub String);

impl FromStr for Protocol {
    type Err = UnsupportedScheme;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(Protocol::Http),
            "https" => Ok(Protocol::Https),
            "socks" | "socks5" => Ok(Protocol::Socks5),
            _ => Err(UnsupportedScheme(s.to_string())),
        }
    }
}

/// Username/password pair for an upstream
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Both fields must be non-empty
    pub fn is_valid(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }

    /// Drop credentials that are not valid
    pub fn normalize(credentials: Option<Credentials>) -> Option<Credentials> {
        credentials.filter(Credentials::is_valid)
    }

    /// Value for a `Proxy-Authorization` header, if the credentials are valid
    pub fn basic_header(&self) -> Option<String> {
        if !self.is_valid() {
            return None;
        }
        let token = format!("{}:{}", self.username, self.password);
        Some(format!("Basic {}", Base64.encode(token)))
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// One configured upstream proxy
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    protocol: Protocol,
    address: String,
    credentials: Option<Credentials>,
}

impl Endpoint {
    pub fn new(
        protocol: Protocol,
        address: impl Into<String>,
        credentials: Option<Credentials>,
    ) -> Self {
        Self {
            protocol,
            address: address.into(),
            credentials: Credentials::normalize(credentials),
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// `host:port` as written in the upstream list
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    /// Address to open a transport connection to, with the protocol's
    /// default port appended when the list entry has none
    pub fn dial_address(&self) -> String {
        if has_port(&self.address) {
            self.address.clone()
        } else {
            format!("{}:{}", self.address, self.protocol.default_port())
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.protocol, self.address)
    }
}

/// Checks for a `:port` suffix, ignoring colons inside an IPv6 literal
fn has_port(host: &str) -> bool {
    for c in host.chars().rev() {
        match c {
            ':' => return true,
            ']' => return false,
            _ => {}
        }
    }
    false
}
