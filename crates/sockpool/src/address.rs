//! Endpoint addressing for passive and active sockets.
//!
//! An [`Address`] is either an IP endpoint or a unix domain socket path.
//! The tag is fixed when the value is built and the payload is only
//! reachable through the accessor for that tag; asking an IP address for its
//! path is an [`Error::TypeMismatch`], never a reinterpretation.
//!
//! Textual form, used by the CLI and the config file:
//!
//! ```text
//! unix:/run/app.sock       unix domain path
//! 127.0.0.1:7878           IPv4 endpoint
//! [::1]:7878               IPv6 endpoint
//! localhost:7878           hostname (only via Address::resolve)
//! ```
//!
//! Every form above parses back to the address it came from, with one
//! exception: an unnamed unix peer (the client end of an accepted unix
//! connection, or either end of [`ActiveConnection::pair`]) is an empty path.
//! It displays as a bare `unix:`, which does not parse, since there is nothing
//! to bind or dial.
//!
//! [`ActiveConnection::pair`]: crate::socket::ActiveConnection::pair

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use socket2::{Domain, SockAddr};
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::str::FromStr;

const UNIX_PREFIX: &str = "unix:";

/// Which family an [`Address`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressKind {
    Ip,
    Unix,
}

impl fmt::Display for AddressKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ip => f.write_str("ip"),
            Self::Unix => f.write_str("unix"),
        }
    }
}

/// A socket endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Address {
    Ip(SocketAddr),
    Unix(PathBuf),
}

impl Address {
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self::Unix(path.into())
    }

    pub fn kind(&self) -> AddressKind {
        match self {
            Self::Ip(_) => AddressKind::Ip,
            Self::Unix(_) => AddressKind::Unix,
        }
    }

    pub fn as_ip(&self) -> Result<&SocketAddr> {
        match self {
            Self::Ip(addr) => Ok(addr),
            Self::Unix(_) => Err(self.mismatch(AddressKind::Ip)),
        }
    }

    pub fn as_ip_mut(&mut self) -> Result<&mut SocketAddr> {
        match self {
            Self::Ip(addr) => Ok(addr),
            Self::Unix(_) => Err(self.mismatch(AddressKind::Ip)),
        }
    }

    pub fn as_unix(&self) -> Result<&Path> {
        match self {
            Self::Unix(path) => Ok(path),
            Self::Ip(_) => Err(self.mismatch(AddressKind::Unix)),
        }
    }

    pub fn as_unix_mut(&mut self) -> Result<&mut PathBuf> {
        match self {
            Self::Unix(path) => Ok(path),
            Self::Ip(_) => Err(self.mismatch(AddressKind::Unix)),
        }
    }

    fn mismatch(&self, expected: AddressKind) -> Error {
        Error::TypeMismatch {
            expected,
            actual: self.kind(),
        }
    }

    /// Parse `text`, falling back to the system resolver for `host:port`.
    ///
    /// Only the first resolved address is kept.
    pub fn resolve(text: &str) -> Result<Self> {
        if let Ok(addr) = text.parse() {
            return Ok(addr);
        }
        let mut addrs = text.to_socket_addrs().map_err(|err| Error::InvalidAddress {
            input: text.to_string(),
            reason: err.to_string(),
        })?;
        addrs.next().map(Self::Ip).ok_or_else(|| Error::InvalidAddress {
            input: text.to_string(),
            reason: "resolved to no addresses".to_string(),
        })
    }

    /// Resolve `host` and pair it with `port`.
    pub fn from_host(host: &str, port: u16) -> Result<Self> {
        let mut addrs = (host, port)
            .to_socket_addrs()
            .map_err(|err| Error::InvalidAddress {
                input: format!("{host}:{port}"),
                reason: err.to_string(),
            })?;
        addrs.next().map(Self::Ip).ok_or_else(|| Error::InvalidAddress {
            input: format!("{host}:{port}"),
            reason: "resolved to no addresses".to_string(),
        })
    }

    pub(crate) fn domain(&self) -> Domain {
        match self {
            Self::Ip(addr) => Domain::for_address(*addr),
            Self::Unix(_) => Domain::UNIX,
        }
    }

    pub(crate) fn to_sockaddr(&self) -> Result<SockAddr> {
        match self {
            Self::Ip(addr) => Ok(SockAddr::from(*addr)),
            Self::Unix(path) => SockAddr::unix(path).map_err(|err| Error::InvalidAddress {
                input: self.to_string(),
                reason: err.to_string(),
            }),
        }
    }

    /// Convert an address reported by the kernel back into an `Address` of
    /// the given kind. An unnamed unix peer becomes an empty path.
    pub(crate) fn from_sockaddr(kind: AddressKind, addr: &SockAddr) -> Result<Self> {
        let actual = if addr.domain() == Domain::UNIX {
            AddressKind::Unix
        } else {
            AddressKind::Ip
        };
        if actual != kind {
            return Err(Error::TypeMismatch {
                expected: kind,
                actual,
            });
        }
        match kind {
            AddressKind::Ip => addr.as_socket().map(Self::Ip).ok_or(Error::TypeMismatch {
                expected: AddressKind::Ip,
                actual: AddressKind::Unix,
            }),
            AddressKind::Unix => Ok(Self::Unix(
                addr.as_pathname().map(Path::to_path_buf).unwrap_or_default(),
            )),
        }
    }
}

impl FromStr for Address {
    type Err = Error;

    /// Literal addresses only; see [`Address::resolve`] for hostnames.
    fn from_str(s: &str) -> Result<Self> {
        if let Some(path) = s.strip_prefix(UNIX_PREFIX) {
            if path.is_empty() {
                return Err(Error::InvalidAddress {
                    input: s.to_string(),
                    reason: "empty unix socket path".to_string(),
                });
            }
            return Ok(Self::Unix(PathBuf::from(path)));
        }
        s.parse::<SocketAddr>()
            .map(Self::Ip)
            .map_err(|err| Error::InvalidAddress {
                input: s.to_string(),
                reason: err.to_string(),
            })
    }
}

/// An unnamed unix peer prints as `unix:`, which [`Address::from_str`]
/// rejects.
impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ip(addr) => write!(f, "{addr}"),
            Self::Unix(path) => write!(f, "{UNIX_PREFIX}{}", path.display()),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Self::Ip(addr)
    }
}

impl TryFrom<String> for Address {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::resolve(&value)
    }
}

impl From<Address> for String {
    fn from(addr: Address) -> Self {
        addr.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn loopback(port: u16) -> Address {
        Address::Ip(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port))
    }

    #[test]
    fn kind_matches_tag() {
        assert_eq!(loopback(1).kind(), AddressKind::Ip);
        assert_eq!(Address::unix("/tmp/x.sock").kind(), AddressKind::Unix);
    }

    #[test]
    fn ip_accessed_as_unix_is_type_mismatch() {
        let addr = loopback(8080);
        let err = addr.as_unix().unwrap_err();
        assert!(matches!(
            err,
            Error::TypeMismatch {
                expected: AddressKind::Unix,
                actual: AddressKind::Ip
            }
        ));
        assert_eq!(addr.as_ip().unwrap().port(), 8080);
    }

    #[test]
    fn unix_accessed_as_ip_is_type_mismatch() {
        let mut addr = Address::unix("/tmp/a.sock");
        assert!(matches!(
            addr.as_ip_mut(),
            Err(Error::TypeMismatch { .. })
        ));
        addr.as_unix_mut().unwrap().set_file_name("b.sock");
        assert_eq!(addr.as_unix().unwrap(), Path::new("/tmp/b.sock"));
    }

    #[test]
    fn mutable_ip_access_keeps_tag() {
        let mut addr = loopback(1);
        addr.as_ip_mut().unwrap().set_port(2);
        assert_eq!(addr, loopback(2));
    }

    #[test]
    fn parse_unix_and_ip() {
        assert_eq!(
            "unix:/run/app.sock".parse::<Address>().unwrap(),
            Address::unix("/run/app.sock")
        );
        assert_eq!("127.0.0.1:7878".parse::<Address>().unwrap(), loopback(7878));
        let v6: Address = "[::1]:80".parse().unwrap();
        assert_eq!(v6.to_string(), "[::1]:80");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(matches!(
            "unix:".parse::<Address>(),
            Err(Error::InvalidAddress { .. })
        ));
        assert!("127.0.0.1".parse::<Address>().is_err());
        assert!("".parse::<Address>().is_err());
    }

    #[test]
    fn resolve_accepts_literals_without_lookup() {
        assert_eq!(Address::resolve("10.1.2.3:9").unwrap().to_string(), "10.1.2.3:9");
        assert_eq!(
            Address::resolve("unix:rel.sock").unwrap(),
            Address::unix("rel.sock")
        );
    }

    #[test]
    fn resolve_without_port_fails() {
        assert!(matches!(
            Address::resolve("no-port-here"),
            Err(Error::InvalidAddress { .. })
        ));
    }

    #[test]
    fn sockaddr_round_trip_keeps_kind() {
        let ip = loopback(4000);
        let sa = ip.to_sockaddr().unwrap();
        assert_eq!(Address::from_sockaddr(AddressKind::Ip, &sa).unwrap(), ip);
        assert!(matches!(
            Address::from_sockaddr(AddressKind::Unix, &sa),
            Err(Error::TypeMismatch { .. })
        ));

        let unix = Address::unix("/tmp/sockpool-test.sock");
        let sa = unix.to_sockaddr().unwrap();
        assert_eq!(Address::from_sockaddr(AddressKind::Unix, &sa).unwrap(), unix);
    }

    #[test]
    fn unnamed_unix_peer_displays_but_does_not_parse() {
        let unnamed = Address::Unix(PathBuf::new());
        assert_eq!(unnamed.to_string(), "unix:");
        assert!(matches!(
            unnamed.to_string().parse::<Address>(),
            Err(Error::InvalidAddress { .. })
        ));
    }

    #[test]
    fn overlong_unix_path_is_invalid() {
        let addr = Address::unix("/tmp/".to_string() + &"x".repeat(200));
        assert!(matches!(
            addr.to_sockaddr(),
            Err(Error::InvalidAddress { .. })
        ));
    }
}
