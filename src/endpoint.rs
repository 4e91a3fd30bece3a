use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::transport::TransportError;

pub const DEFAULT_PORT: u16 = 5683;
pub const DEFAULT_SECURE_PORT: u16 = 5684;

/// Remote CoAP server and how to secure the link to it.  Immutable once constructed; the
/// `with_*` methods consume and return a new value.
#[derive(Clone, PartialEq, Eq)]
pub struct Endpoint {
    host: String,
    port: Option<u16>,
    security: Security,
}

#[derive(Clone, PartialEq, Eq)]
pub enum Security {
    None,
    Psk { identity: String, key: Vec<u8> },
    Certificate { cert: PathBuf, key: PathBuf },
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port: Some(port),
            security: Security::None,
        }
    }

    pub fn with_security(mut self, security: Security) -> Self {
        self.security = security;
        self
    }

    /// Use a pre-shared key, unless a certificate has already been configured: certificates
    /// take precedence over PSK.
    pub fn with_psk(self, identity: impl Into<String>, key: impl Into<Vec<u8>>) -> Self {
        if matches!(self.security, Security::Certificate { .. }) {
            return self;
        }
        self.with_security(Security::Psk {
            identity: identity.into(),
            key: key.into(),
        })
    }

    pub fn with_certificate(self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.with_security(Security::Certificate {
            cert: cert.into(),
            key: key.into(),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(match self.security {
            Security::None => DEFAULT_PORT,
            _ => DEFAULT_SECURE_PORT,
        })
    }

    pub fn security(&self) -> &Security {
        &self.security
    }

    pub fn is_secure(&self) -> bool {
        !matches!(self.security, Security::None)
    }

    /// `host:port` form suitable for DNS resolution.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port())
        } else {
            format!("{}:{}", self.host, self.port())
        }
    }
}

impl Security {
    /// Reads the PSK identity and key from the named environment variables.
    pub fn psk_from_env(identity_var: &str, key_var: &str) -> Result<Self, TransportError> {
        let read = |var: &str| {
            env::var(var).map_err(|e| {
                TransportError::InvalidCredentials(format!("environment variable {var}: {e}"))
            })
        };
        Ok(Security::Psk {
            identity: read(identity_var)?,
            key: read(key_var)?.into_bytes(),
        })
    }
}

/// Parses `host`, `host:port`, `[v6addr]` or `[v6addr]:port`.
impl FromStr for Endpoint {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TransportError::Resolve(s.to_string());
        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
            match tail.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None if tail.is_empty() => (host, None),
                None => return Err(invalid()),
            }
        } else {
            match s.rsplit_once(':') {
                Some((host, port)) if !host.contains(':') => (host, Some(port)),
                Some(_) => (s, None),
                None => (s, None),
            }
        };
        if host.is_empty() {
            return Err(invalid());
        }
        let port = port
            .map(|p| p.parse::<u16>().map_err(|_| invalid()))
            .transpose()?;
        Ok(Self {
            host: host.to_string(),
            port,
            security: Security::None,
        })
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("host", &self.host)
            .field("port", &self.port())
            .field("security", &self.security)
            .finish()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.authority())
    }
}

// Keys never end up in logs.
impl fmt::Debug for Security {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Security::None => f.write_str("None"),
            Security::Psk { identity, .. } => f
                .debug_struct("Psk")
                .field("identity", identity)
                .finish_non_exhaustive(),
            Security::Certificate { cert, key } => f
                .debug_struct("Certificate")
                .field("cert", cert)
                .field("key", key)
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_port() {
        let endpoint: Endpoint = "coap.example.org:5684".parse().unwrap();
        assert_eq!(endpoint.host(), "coap.example.org");
        assert_eq!(endpoint.port(), 5684);
        assert!(!endpoint.is_secure());
    }

    #[test]
    fn test_default_ports() {
        let endpoint: Endpoint = "localhost".parse().unwrap();
        assert_eq!(endpoint.port(), DEFAULT_PORT);
        let endpoint = endpoint.with_psk("id", "secret");
        assert_eq!(endpoint.port(), DEFAULT_SECURE_PORT);
    }

    #[test]
    fn test_parse_ipv6() {
        let endpoint: Endpoint = "[::1]:9999".parse().unwrap();
        assert_eq!(endpoint.host(), "::1");
        assert_eq!(endpoint.authority(), "[::1]:9999");
        let endpoint: Endpoint = "::1".parse().unwrap();
        assert_eq!(endpoint.port(), DEFAULT_PORT);
    }

    #[test]
    fn test_parse_invalid() {
        assert!("".parse::<Endpoint>().is_err());
        assert!("host:notaport".parse::<Endpoint>().is_err());
        assert!("[::1".parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_certificate_takes_precedence() {
        let endpoint = Endpoint::new("localhost", 5684)
            .with_certificate("cert.pem", "key.pem")
            .with_psk("id", "secret");
        assert!(matches!(endpoint.security(), Security::Certificate { .. }));
    }

    #[test]
    fn test_psk_from_env() {
        env::set_var("COAP_CLIENT_TEST_PSK_ID", "device");
        env::set_var("COAP_CLIENT_TEST_PSK", "s3cret");
        let security =
            Security::psk_from_env("COAP_CLIENT_TEST_PSK_ID", "COAP_CLIENT_TEST_PSK").unwrap();
        assert_eq!(
            security,
            Security::Psk {
                identity: "device".to_string(),
                key: b"s3cret".to_vec()
            }
        );
        assert!(Security::psk_from_env("COAP_CLIENT_TEST_MISSING", "COAP_CLIENT_TEST_PSK").is_err());
    }

    #[test]
    fn test_debug_hides_key() {
        let endpoint = Endpoint::new("h", 1).with_psk("id", "topsecret");
        assert!(!format!("{endpoint:?}").contains("topsecret"));
    }
}
