//! SSL certificate bindings of the transport layer.
//!
//! The transport keeps two independent tables: one keyed by IP endpoint and
//! one keyed by SNI host name and port. A binding refers to its certificate
//! by thumbprint and store only; deleting the certificate leaves the binding
//! in place, and resolving it then reports a dangling reference.

mod manager;
mod table;

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use uuid::Uuid;

use crate::cert::{CertificateRecord, Thumbprint};
use crate::error::{Error, Result};

pub use manager::{BindOutcome, BindingManager};
pub use table::{BindingTable, FileBindingTable, MemoryBindingTable};

/// Identity of a binding in the transport layer
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EndpointKey {
    Ip(SocketAddr),
    Sni { host: String, port: u16 },
}

impl EndpointKey {
    /// SNI host names compare case-insensitively, so they are kept lower case
    pub fn sni(host: &str, port: u16) -> Self {
        EndpointKey::Sni {
            host: host.to_ascii_lowercase(),
            port,
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            EndpointKey::Ip(addr) => addr.port(),
            EndpointKey::Sni { port, .. } => *port,
        }
    }

    pub fn is_sni(&self) -> bool {
        matches!(self, EndpointKey::Sni { .. })
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointKey::Ip(addr) => write!(f, "{addr}"),
            EndpointKey::Sni { host, port } => write!(f, "{host}:{port}"),
        }
    }
}

/// `10.0.0.1:443` and `[::1]:443` are IP endpoints, anything else with a
/// port is an SNI host.
impl FromStr for EndpointKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(EndpointKey::Ip(addr));
        }
        let invalid = || Error::InvalidInput(format!("'{s}' is not an endpoint (address:port or host:port)"));
        let (host, port) = s.rsplit_once(':').ok_or_else(invalid)?;
        let port: u16 = port.parse().map_err(|_| invalid())?;
        if host.is_empty() || port == 0 || host.contains(['[', ']', ':']) {
            return Err(invalid());
        }
        Ok(EndpointKey::sni(host, port))
    }
}

/// A certificate bound to an endpoint on behalf of an application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SslBinding {
    pub endpoint: EndpointKey,
    pub thumbprint: Thumbprint,
    pub store: String,
    pub owner: Uuid,
}

/// Which bindings a query returns
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingQuery {
    All,
    Ip,
    Sni,
    Owner(Uuid),
    Certificate(Thumbprint),
}

impl BindingQuery {
    pub fn matches(&self, binding: &SslBinding) -> bool {
        match self {
            BindingQuery::All => true,
            BindingQuery::Ip => !binding.endpoint.is_sni(),
            BindingQuery::Sni => binding.endpoint.is_sni(),
            BindingQuery::Owner(owner) => binding.owner == *owner,
            BindingQuery::Certificate(thumbprint) => binding.thumbprint == *thumbprint,
        }
    }
}

/// State of an endpoint's certificate reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingResolution {
    Unbound,
    Bound(SslBinding, CertificateRecord),
    /// The binding exists but its certificate is gone from the store
    Dangling(SslBinding),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_parsing() {
        assert_eq!(
            "10.0.0.1:443".parse::<EndpointKey>().unwrap(),
            EndpointKey::Ip("10.0.0.1:443".parse().unwrap())
        );
        assert_eq!(
            "[::1]:8443".parse::<EndpointKey>().unwrap().to_string(),
            "[::1]:8443"
        );
        assert_eq!(
            "WWW.Example.com:443".parse::<EndpointKey>().unwrap(),
            EndpointKey::sni("www.example.com", 443)
        );
        assert!("example.com".parse::<EndpointKey>().is_err());
        assert!("example.com:0".parse::<EndpointKey>().is_err());
    }

    #[test]
    fn test_ip_and_sni_are_distinct_keyspaces() {
        let ip = EndpointKey::Ip("10.0.0.1:443".parse().unwrap());
        let sni = EndpointKey::sni("10.0.0.1", 443);
        assert_ne!(ip, sni);
        assert_eq!(ip.port(), sni.port());
    }
}
