//! Backend addressing.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A `host:port` pair for a backend or forward target.
///
/// Hostnames are kept as strings and resolved at connect time, so a backend
/// that is down at startup can still join the rotation later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendAddr {
    pub host: String,
    pub port: u16,
}

impl BackendAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for BackendAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for BackendAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("expected host:port, got {:?}", s))?;
        if host.is_empty() {
            return Err(format!("empty host in {:?}", s));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| format!("invalid port in {:?}", s))?;
        Ok(Self::new(host, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_port() {
        let addr: BackendAddr = "localhost:5000".parse().unwrap();
        assert_eq!(addr, BackendAddr::new("localhost", 5000));
        assert_eq!(addr.to_string(), "localhost:5000");
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!("localhost".parse::<BackendAddr>().is_err());
        assert!(":5000".parse::<BackendAddr>().is_err());
        assert!("localhost:notaport".parse::<BackendAddr>().is_err());
    }
}
