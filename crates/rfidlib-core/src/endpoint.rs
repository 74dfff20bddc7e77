//! Reader endpoint URIs.
//!
//! Readers are addressed the way the vendor tooling addresses them:
//!
//! - `tmr:///dev/ttyUSB0`, `tmr:///COM3`: serial module
//! - `tmr://192.168.1.100[:port]`: fixed reader over RQL
//! - `eapi:///dev/ttyACM0`: serial module via the embedded API
//! - `llrp://reader.local[:port]`: LLRP reader
//!
//! A bare device path (`/dev/ttyUSB0`) or `COMn` name is accepted as
//! shorthand for `tmr:///...`.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Default LLRP TCP port.
pub const LLRP_DEFAULT_PORT: u16 = 5084;

/// Default RQL port used by `tmr://host`.
pub const RQL_DEFAULT_PORT: u16 = 8080;

/// How the endpoint reaches the reader.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EndpointTarget {
    /// Local serial device (`/dev/ttyUSB0`, `COM3`).
    Serial { path: String },
    /// Network reader.
    Network { host: String, port: u16 },
}

/// URI scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Tmr,
    Eapi,
    Llrp,
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Scheme::Tmr => "tmr",
            Scheme::Eapi => "eapi",
            Scheme::Llrp => "llrp",
        };
        write!(f, "{s}")
    }
}

/// A parsed reader address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub scheme: Scheme,
    pub target: EndpointTarget,
}

fn is_com_port(s: &str) -> bool {
    let upper = s.to_ascii_uppercase();
    upper
        .strip_prefix("COM")
        .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
}

impl Endpoint {
    /// Parse a reader URI.
    pub fn parse(uri: &str) -> Result<Endpoint> {
        let uri = uri.trim();
        let invalid = |why: &str| Error::InvalidEndpoint(format!("{uri:?}: {why}"));

        if uri.is_empty() {
            return Err(invalid("empty address"));
        }

        let Some((scheme, rest)) = uri.split_once("://") else {
            if uri.starts_with('/') || is_com_port(uri) {
                return Ok(Endpoint {
                    scheme: Scheme::Tmr,
                    target: EndpointTarget::Serial {
                        path: uri.to_string(),
                    },
                });
            }
            return Err(invalid("expected tmr://, eapi://, llrp://, or a device path"));
        };

        let scheme = match scheme.to_ascii_lowercase().as_str() {
            "tmr" => Scheme::Tmr,
            "eapi" => Scheme::Eapi,
            "llrp" => Scheme::Llrp,
            other => return Err(invalid(&format!("unknown scheme {other:?}"))),
        };

        // Three slashes means an empty host and a local device path.
        if let Some(path) = rest.strip_prefix('/') {
            if scheme == Scheme::Llrp {
                return Err(invalid("llrp requires a host"));
            }
            // `tmr:///COM3` names a Windows port; keep the leading slash off.
            let path = if is_com_port(path) {
                path.to_string()
            } else {
                format!("/{path}")
            };
            if path == "/" {
                return Err(invalid("missing device path"));
            }
            return Ok(Endpoint {
                scheme,
                target: EndpointTarget::Serial { path },
            });
        }

        if scheme == Scheme::Eapi {
            return Err(invalid("eapi requires a local device path"));
        }

        let authority = rest.split('/').next().unwrap_or_default();
        let default_port = match scheme {
            Scheme::Llrp => LLRP_DEFAULT_PORT,
            _ => RQL_DEFAULT_PORT,
        };
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| invalid(&format!("invalid port {port:?}")))?;
                (host, port)
            }
            None => (authority, default_port),
        };
        if host.is_empty() {
            return Err(invalid("missing host"));
        }

        Ok(Endpoint {
            scheme,
            target: EndpointTarget::Network {
                host: host.to_string(),
                port,
            },
        })
    }

    /// Whether the endpoint is a local serial device.
    pub fn is_serial(&self) -> bool {
        matches!(self.target, EndpointTarget::Serial { .. })
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Endpoint::parse(s)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            EndpointTarget::Serial { path } if path.starts_with('/') => {
                write!(f, "{}://{}", self.scheme, path)
            }
            EndpointTarget::Serial { path } => write!(f, "{}:///{}", self.scheme, path),
            EndpointTarget::Network { host, port } => {
                write!(f, "{}://{}:{}", self.scheme, host, port)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_tmr_uri() {
        let ep = Endpoint::parse("tmr:///dev/ttyUSB0").unwrap();
        assert_eq!(ep.scheme, Scheme::Tmr);
        assert_eq!(
            ep.target,
            EndpointTarget::Serial {
                path: "/dev/ttyUSB0".into()
            }
        );
        assert_eq!(ep.to_string(), "tmr:///dev/ttyUSB0");
    }

    #[test]
    fn windows_com_port() {
        let ep = Endpoint::parse("tmr:///com4").unwrap();
        assert_eq!(ep.target, EndpointTarget::Serial { path: "com4".into() });
        let bare = Endpoint::parse("COM12").unwrap();
        assert!(bare.is_serial());
        assert_eq!(bare.to_string(), "tmr:///COM12");
    }

    #[test]
    fn bare_device_path() {
        let ep = Endpoint::parse("/dev/ttyACM0").unwrap();
        assert_eq!(ep.scheme, Scheme::Tmr);
        assert!(ep.is_serial());
    }

    #[test]
    fn network_with_default_ports() {
        let ep = Endpoint::parse("tmr://192.168.1.100").unwrap();
        assert_eq!(
            ep.target,
            EndpointTarget::Network {
                host: "192.168.1.100".into(),
                port: RQL_DEFAULT_PORT
            }
        );
        let llrp = Endpoint::parse("llrp://reader.local").unwrap();
        assert_eq!(
            llrp.target,
            EndpointTarget::Network {
                host: "reader.local".into(),
                port: LLRP_DEFAULT_PORT
            }
        );
    }

    #[test]
    fn network_with_explicit_port() {
        let ep = Endpoint::parse("llrp://10.0.0.5:5085").unwrap();
        assert_eq!(ep.to_string(), "llrp://10.0.0.5:5085");
    }

    #[test]
    fn rejects_garbage() {
        for bad in [
            "",
            "   ",
            "http://reader",
            "reader.local",
            "tmr://",
            "tmr:///",
            "llrp:///dev/ttyUSB0",
            "eapi://host",
            "tmr://host:notaport",
        ] {
            let err = Endpoint::parse(bad).unwrap_err();
            assert!(matches!(err, Error::InvalidEndpoint(_)), "{bad:?}: {err}");
        }
    }
}
