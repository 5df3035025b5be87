//! Container engine host addresses.
//!
//! A [`HostAddress`] is the resolved `(scheme, host, port)` triple used to
//! reach a container engine. Addresses come either from the static
//! fallback URL of a cloud, or from a dynamically discovered node, in which
//! case the node's hostname is combined with the fallback's scheme and port.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Transport used to talk to an engine endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    /// Plain TCP, Docker's `tcp://` form.
    Tcp,
    Http,
    /// TLS with client certificates.
    Https,
    /// Local unix socket; `host` holds the socket path.
    Unix,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Tcp => "tcp",
            Scheme::Http => "http",
            Scheme::Https => "https",
            Scheme::Unix => "unix",
        }
    }

    fn default_port(&self) -> u16 {
        match self {
            Scheme::Tcp | Scheme::Http => 2375,
            Scheme::Https => 2376,
            Scheme::Unix => 0,
        }
    }
}

/// Address of a container engine endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HostAddress {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl HostAddress {
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme,
            host: host.into(),
            port,
        }
    }

    /// Parse `scheme://host[:port]`. A missing port takes the scheme default.
    pub fn parse(url: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::InvalidAddress(url.to_string());

        let (scheme, rest) = url.split_once("://").ok_or_else(invalid)?;
        let scheme = match scheme {
            "tcp" => Scheme::Tcp,
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            "unix" => Scheme::Unix,
            _ => return Err(invalid()),
        };

        if scheme == Scheme::Unix {
            if rest.is_empty() {
                return Err(invalid());
            }
            return Ok(Self::new(scheme, rest, 0));
        }

        let authority = rest.trim_end_matches('/');
        if authority.is_empty() || authority.contains('/') {
            return Err(invalid());
        }

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => (host, port.parse::<u16>().map_err(|_| invalid())?),
            None => (authority, scheme.default_port()),
        };
        if host.is_empty() {
            return Err(invalid());
        }

        Ok(Self::new(scheme, host, port))
    }

    /// Same scheme and port, different hostname.
    pub fn with_host(&self, host: impl Into<String>) -> Self {
        Self::new(self.scheme, host, self.port)
    }

    pub fn is_unix(&self) -> bool {
        self.scheme == Scheme::Unix
    }

    /// `host:port` suitable for a TCP connect.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for HostAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scheme {
            Scheme::Unix => write!(f, "unix://{}", self.host),
            _ => write!(f, "{}://{}:{}", self.scheme.as_str(), self.host, self.port),
        }
    }
}

impl FromStr for HostAddress {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for HostAddress {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<HostAddress> for String {
    fn from(value: HostAddress) -> Self {
        value.to_string()
    }
}
