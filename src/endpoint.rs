//! Monitor address resolution
//!
//! A monitor is reachable either over TCP (`host:port`) or through a Unix socket path.

use crate::error::{QmpError, Result};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Default monitor socket, expanded with [`expand`] before use
pub const DEFAULT_ENDPOINT: &str = "$XDG_RUNTIME_DIR/qmp.sock";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Unix { path: PathBuf },
}

impl Endpoint {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Endpoint::Tcp {
            host: host.into(),
            port,
        }
    }

    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Endpoint::Unix { path: path.into() }
    }

    /// True for Unix sockets, the only family that can carry file descriptors
    pub fn is_local(&self) -> bool {
        matches!(self, Endpoint::Unix { .. })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host, port } => write!(f, "{host}:{port}"),
            Endpoint::Unix { path } => write!(f, "{}", path.display()),
        }
    }
}

impl FromStr for Endpoint {
    type Err = QmpError;

    fn from_str(s: &str) -> Result<Self> {
        resolve(s)
    }
}

/// Turn a user supplied address into an [`Endpoint`].
///
/// A string with exactly one `:` is `host:port` and the port must be numeric.
/// Anything else is a socket path.
pub fn resolve(address: &str) -> Result<Endpoint> {
    if address.is_empty() {
        return Err(QmpError::InvalidAddress(
            address.to_string(),
            "empty address".to_string(),
        ));
    }

    let mut parts = address.split(':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(host), Some(port), None) => {
            let port = port.parse::<u16>().map_err(|e| {
                QmpError::InvalidAddress(address.to_string(), format!("bad port '{port}': {e}"))
            })?;
            Ok(Endpoint::tcp(host, port))
        }
        _ => Ok(Endpoint::unix(address)),
    }
}

fn get_uid() -> String {
    std::env::var("UID").unwrap_or_else(|_| nix::unistd::getuid().to_string())
}

/// Expand `$UID` and `$XDG_RUNTIME_DIR` in an address string
pub fn expand(address: &str) -> String {
    let expanded = if address.contains("$XDG_RUNTIME_DIR") {
        let runtime_dir =
            std::env::var("XDG_RUNTIME_DIR").unwrap_or_else(|_| format!("/run/user/{}", get_uid()));
        address.replace("$XDG_RUNTIME_DIR", &runtime_dir)
    } else {
        address.to_string()
    };

    if expanded.contains("$UID") {
        expanded.replace("$UID", &get_uid())
    } else {
        expanded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_host_port() {
        let endpoint = resolve("localhost:4444").unwrap();
        assert_eq!(endpoint, Endpoint::tcp("localhost", 4444));
        assert!(!endpoint.is_local());
    }

    #[test]
    fn test_resolve_path() {
        let endpoint = resolve("/tmp/qmp.sock").unwrap();
        assert_eq!(endpoint, Endpoint::unix("/tmp/qmp.sock"));
        assert!(endpoint.is_local());
    }

    #[test]
    fn test_resolve_rejects_non_numeric_port() {
        let err = resolve("localhost:notaport").unwrap_err();
        assert!(matches!(err, QmpError::InvalidAddress(..)));
    }

    #[test]
    fn test_resolve_rejects_out_of_range_port() {
        assert!(matches!(
            resolve("localhost:70000"),
            Err(QmpError::InvalidAddress(..))
        ));
    }

    #[test]
    fn test_resolve_multiple_colons_is_path() {
        let endpoint = resolve("/tmp/vm:1:qmp").unwrap();
        assert_eq!(endpoint, Endpoint::unix("/tmp/vm:1:qmp"));
    }

    #[test]
    fn test_resolve_empty() {
        assert!(resolve("").is_err());
    }

    #[test]
    fn test_display_roundtrip() {
        let endpoint: Endpoint = "127.0.0.1:5555".parse().unwrap();
        assert_eq!(endpoint.to_string(), "127.0.0.1:5555");
        assert_eq!(resolve(&endpoint.to_string()).unwrap(), endpoint);
    }

    #[test]
    fn test_expand_leaves_plain_paths() {
        assert_eq!(expand("/tmp/qmp.sock"), "/tmp/qmp.sock");
        assert!(!expand("/run/user/$UID/qmp.sock").contains("$UID"));
    }
}
