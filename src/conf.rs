//! Turning configuration tokens into upstream addresses.
//!
//! Each token names either a single upstream or a file in the format of
//! `/etc/resolv.conf` whose `nameserver` lines name the upstreams. A single
//! upstream is an IP address with an optional port, optionally prefixed
//! with a scheme selecting the protocol:
//!
//! ```text
//! 192.0.2.1
//! 192.0.2.1:5353
//! [2001:db8::1]:53
//! tls://192.0.2.1
//! tcp://192.0.2.1:53
//! /etc/resolv.conf
//! ```
//!
//! Without a port, the default port of the protocol is used.

use std::error;
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::str::FromStr;

use domain::resolv::stub::conf::{self, ResolvConf};

use crate::protocol::Protocol;

//------------ UpstreamAddr ---------------------------------------------------

/// The address of an upstream together with the protocol to use.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct UpstreamAddr {
    /// The socket address of the upstream.
    pub addr: SocketAddr,

    /// The protocol to talk to the upstream.
    pub protocol: Protocol,
}

impl UpstreamAddr {
    /// Creates a new value.
    pub fn new(addr: SocketAddr, protocol: Protocol) -> Self {
        Self { addr, protocol }
    }
}

impl fmt::Display for UpstreamAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.protocol, self.addr)
    }
}

//------------ Parsing --------------------------------------------------------

/// Parses a list of upstream tokens.
///
/// Tokens without a scheme use `protocol`. A token that is not an address
/// and has no scheme is read as a resolv.conf file.
///
/// Fails if a token is invalid or if there are no upstreams at all.
pub fn parse_upstreams<'a>(
    tokens: impl IntoIterator<Item = &'a str>,
    protocol: Protocol,
) -> Result<Vec<UpstreamAddr>, Error> {
    let mut res = Vec::new();
    for token in tokens {
        let (scheme, rest) = split_scheme(token)?;
        let proto = scheme.unwrap_or(protocol);
        match parse_addr(rest, proto.default_port()) {
            Some(addr) => res.push(UpstreamAddr::new(addr, proto)),
            None if scheme.is_none() && Path::new(rest).is_file() => {
                let servers = read_resolv_conf(rest, proto.default_port())?;
                res.extend(
                    servers
                        .into_iter()
                        .map(|addr| UpstreamAddr::new(addr, proto)),
                );
            }
            None => return Err(Error::InvalidAddress(token.into())),
        }
    }
    if res.is_empty() {
        return Err(Error::Empty);
    }
    Ok(res)
}

/// Reads the name servers of a resolv.conf file.
///
/// The port of every name server is replaced with `port`.
pub fn read_resolv_conf(
    path: impl AsRef<Path>,
    port: u16,
) -> Result<Vec<SocketAddr>, Error> {
    let mut conf = ResolvConf::new();
    conf.parse_file(path)?;
    Ok(servers(&conf, port))
}

/// Parses the name servers of resolv.conf data.
///
/// The port of every name server is replaced with `port`.
pub fn parse_resolv_conf(
    data: &str,
    port: u16,
) -> Result<Vec<SocketAddr>, Error> {
    let mut conf = ResolvConf::new();
    conf.parse(&mut data.as_bytes())?;
    Ok(servers(&conf, port))
}

/// Returns the distinct name server addresses of a parsed configuration.
///
/// A name server appears once per transport in the configuration.
fn servers(conf: &ResolvConf, port: u16) -> Vec<SocketAddr> {
    let mut res: Vec<SocketAddr> = Vec::new();
    for server in &conf.servers {
        let addr = SocketAddr::new(server.addr.ip(), port);
        if !res.contains(&addr) {
            res.push(addr);
        }
    }
    res
}

/// Splits a scheme off the token.
fn split_scheme(token: &str) -> Result<(Option<Protocol>, &str), Error> {
    let Some((scheme, rest)) = token.split_once("://") else {
        return Ok((None, token));
    };
    let protocol = match scheme.to_ascii_lowercase().as_str() {
        "dns" | "udp" => Protocol::Udp,
        "tcp" => Protocol::Tcp,
        "tls" => Protocol::TcpTls,
        _ => return Err(Error::UnknownScheme(scheme.into())),
    };
    Ok((Some(protocol), rest))
}

/// Parses an IP address with an optional port.
fn parse_addr(s: &str, default_port: u16) -> Option<SocketAddr> {
    if let Ok(addr) = SocketAddr::from_str(s) {
        return Some(addr);
    }
    let ip = s
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .unwrap_or(s);
    IpAddr::from_str(ip)
        .ok()
        .map(|ip| SocketAddr::new(ip, default_port))
}

//------------ Error ----------------------------------------------------------

/// An error happened while parsing upstreams.
#[derive(Debug)]
pub enum Error {
    /// A token is neither an address nor a file.
    InvalidAddress(String),

    /// A token has a scheme we don't know.
    UnknownScheme(String),

    /// A resolv.conf file is malformed.
    ParseError,

    /// Something happened while reading a file.
    IoError(io::Error),

    /// No upstreams were given.
    Empty,
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::IoError(err) => Some(err),
            _ => None,
        }
    }
}

impl From<conf::Error> for Error {
    fn from(error: conf::Error) -> Error {
        if let conf::Error::Io(err) = error {
            Error::IoError(err)
        } else {
            Error::ParseError
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidAddress(token) => {
                write!(f, "not an IP address or file: {token}")
            }
            Error::UnknownScheme(scheme) => {
                write!(f, "unknown scheme: {scheme}")
            }
            Error::ParseError => f.write_str("error parsing resolv.conf"),
            Error::IoError(err) => fmt::Display::fmt(err, f),
            Error::Empty => f.write_str("no upstreams given"),
        }
    }
}

//============ Testing ======================================================

#[cfg(test)]
mod test {
    use super::*;
    use rstest::rstest;

    fn sock(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn literal_addresses() {
        let res = parse_upstreams(
            [
                "192.0.2.1",
                "192.0.2.2:5353",
                "[2001:db8::1]:54",
                "[2001:db8::2]",
                "2001:db8::3",
            ],
            Protocol::Udp,
        )
        .unwrap();
        let addrs: Vec<_> = res.iter().map(|u| u.addr).collect();
        assert_eq!(
            addrs,
            [
                sock("192.0.2.1:53"),
                sock("192.0.2.2:5353"),
                sock("[2001:db8::1]:54"),
                sock("[2001:db8::2]:53"),
                sock("[2001:db8::3]:53"),
            ]
        );
        assert!(res.iter().all(|u| u.protocol == Protocol::Udp));
    }

    #[rstest]
    #[case("192.0.2.1", "192.0.2.1:53", Protocol::Tcp)]
    #[case("192.0.2.1:5353", "192.0.2.1:5353", Protocol::Tcp)]
    #[case("udp://192.0.2.1", "192.0.2.1:53", Protocol::Udp)]
    #[case("TLS://192.0.2.1", "192.0.2.1:853", Protocol::TcpTls)]
    #[case("tls://192.0.2.1:53", "192.0.2.1:53", Protocol::TcpTls)]
    #[case("tls://[2001:db8::1]", "[2001:db8::1]:853", Protocol::TcpTls)]
    fn single_token(
        #[case] token: &str,
        #[case] addr: &str,
        #[case] protocol: Protocol,
    ) {
        assert_eq!(
            parse_upstreams([token], Protocol::Tcp).unwrap(),
            [UpstreamAddr::new(sock(addr), protocol)]
        );
    }

    #[test]
    fn schemes() {
        let res = parse_upstreams(
            ["tls://192.0.2.1", "tcp://192.0.2.2", "dns://192.0.2.3:54"],
            Protocol::Udp,
        )
        .unwrap();
        assert_eq!(
            res,
            [
                UpstreamAddr::new(sock("192.0.2.1:853"), Protocol::TcpTls),
                UpstreamAddr::new(sock("192.0.2.2:53"), Protocol::Tcp),
                UpstreamAddr::new(sock("192.0.2.3:54"), Protocol::Udp),
            ]
        );
        assert!(matches!(
            parse_upstreams(["quic://192.0.2.1"], Protocol::Udp),
            Err(Error::UnknownScheme(_))
        ));
    }

    #[test]
    fn invalid_and_empty() {
        assert!(matches!(
            parse_upstreams(["example.com"], Protocol::Udp),
            Err(Error::InvalidAddress(_))
        ));
        assert!(matches!(
            parse_upstreams(["tls:///etc/resolv.conf"], Protocol::Udp),
            Err(Error::InvalidAddress(_))
        ));
        assert!(matches!(
            parse_upstreams([], Protocol::Udp),
            Err(Error::Empty)
        ));
    }

    #[test]
    fn resolv_conf_data() {
        let data = "# generated\n\
                    nameserver 192.0.2.1\n\
                    search example.com\n\
                    ; secondary\n\
                    nameserver 2001:db8::1\n\
                    nameserver 192.0.2.1\n\
                    options ndots:2\n";
        assert_eq!(
            parse_resolv_conf(data, 853).unwrap(),
            [sock("192.0.2.1:853"), sock("[2001:db8::1]:853")]
        );
        assert!(matches!(
            parse_resolv_conf("nameserver\n", 53),
            Err(Error::ParseError)
        ));
        assert!(matches!(
            parse_resolv_conf("nameserver 192.0.2.1 192.0.2.2\n", 53),
            Err(Error::ParseError)
        ));
        assert!(matches!(
            parse_resolv_conf("bogus 192.0.2.1\n", 53),
            Err(Error::ParseError)
        ));
    }

    #[test]
    fn missing_resolv_conf_file() {
        assert!(matches!(
            read_resolv_conf("/nonexistent/domain-fanout/resolv.conf", 53),
            Err(Error::IoError(_))
        ));
    }

    #[test]
    fn resolv_conf_file() {
        let path = std::env::temp_dir().join(format!(
            "domain-fanout-resolv-{}.conf",
            std::process::id()
        ));
        let data = "nameserver 192.0.2.7\nnameserver 192.0.2.8\n";
        std::fs::write(&path, data).unwrap();
        let res = parse_upstreams(
            ["192.0.2.1", path.to_str().unwrap()],
            Protocol::Tcp,
        );
        std::fs::remove_file(&path).unwrap();
        assert_eq!(
            res.unwrap(),
            [
                UpstreamAddr::new(sock("192.0.2.1:53"), Protocol::Tcp),
                UpstreamAddr::new(sock("192.0.2.7:53"), Protocol::Tcp),
                UpstreamAddr::new(sock("192.0.2.8:53"), Protocol::Tcp),
            ]
        );
    }

    #[test]
    fn empty_resolv_conf_file() {
        let path = std::env::temp_dir().join(format!(
            "domain-fanout-empty-{}.conf",
            std::process::id()
        ));
        std::fs::write(&path, "search example.com\n").unwrap();
        let res = parse_upstreams([path.to_str().unwrap()], Protocol::Udp);
        std::fs::remove_file(&path).unwrap();
        assert!(matches!(res, Err(Error::Empty)));
    }
}
