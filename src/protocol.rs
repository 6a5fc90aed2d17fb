//! Underlying transport protocols.

use core::future::Future;
use core::pin::Pin;
use std::boxed::Box;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::ops::RangeInclusive;
use std::str::FromStr;
use std::sync::Arc;
use rand::Rng;
use tokio::net::{TcpStream, UdpSocket};
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::ClientConfig;
use tokio_rustls::TlsConnector;

use crate::error::Error;

/// How many times do we try a new random port if we get ‘address in use.’
const RETRY_RANDOM_PORT: usize = 10;

/// The range local UDP ports are picked from.
const LOCAL_PORTS: RangeInclusive<u16> = 1024..=65535;

//------------ Protocol -------------------------------------------------------

/// The transport protocol used to talk to an upstream.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Protocol {
    /// Plain DNS over UDP.
    Udp,

    /// Plain DNS over TCP.
    Tcp,

    /// DNS over TLS.
    TcpTls,
}

impl Protocol {
    /// Returns the name of the protocol.
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Udp => "udp",
            Protocol::Tcp => "tcp",
            Protocol::TcpTls => "tcp-tls",
        }
    }

    /// Returns the port used when a configuration doesn't name one.
    pub fn default_port(self) -> u16 {
        match self {
            Protocol::Udp | Protocol::Tcp => 53,
            Protocol::TcpTls => 853,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = UnknownProtocol;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "udp" => Ok(Protocol::Udp),
            "tcp" => Ok(Protocol::Tcp),
            "tcp-tls" | "tls" => Ok(Protocol::TcpTls),
            _ => Err(UnknownProtocol),
        }
    }
}

/// A protocol name could not be recognized.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct UnknownProtocol;

impl fmt::Display for UnknownProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("unknown transport protocol")
    }
}

impl std::error::Error for UnknownProtocol {}

//------------ TlsConfig ------------------------------------------------------

/// TLS settings shared by all upstreams that use DNS over TLS.
#[derive(Clone, Debug)]
pub struct TlsConfig {
    /// Configuration for setting up a TLS connection.
    client_config: Arc<ClientConfig>,

    /// Server name for certificate verification.
    ///
    /// If this is `None`, the address of the upstream is verified.
    server_name: Option<ServerName<'static>>,
}

impl TlsConfig {
    /// Creates TLS settings that verify the upstream's IP address.
    pub fn new(client_config: impl Into<Arc<ClientConfig>>) -> Self {
        Self {
            client_config: client_config.into(),
            server_name: None,
        }
    }

    /// Sets the name to verify the upstream's certificate against.
    pub fn with_server_name(mut self, name: &str) -> Result<Self, Error> {
        let name = ServerName::try_from(name.to_string())
            .map_err(|_| Error::InvalidServerName)?;
        self.server_name = Some(name);
        Ok(self)
    }

    /// Returns the rustls client configuration.
    pub fn client_config(&self) -> &Arc<ClientConfig> {
        &self.client_config
    }

    /// Returns the server name used for the given upstream address.
    pub fn server_name_for(&self, addr: SocketAddr) -> ServerName<'static> {
        match &self.server_name {
            Some(name) => name.clone(),
            None => ServerName::IpAddress(addr.ip().into()),
        }
    }
}

//------------ AsyncConnect --------------------------------------------------

/// Establish a connection asynchronously.
pub trait AsyncConnect {
    /// The type of an established connection.
    type Connection;

    /// The future establishing the connection.
    type Fut: Future<Output = Result<Self::Connection, io::Error>> + Send;

    /// Returns a future that establishing a connection.
    fn connect(&self) -> Self::Fut;
}

//------------ TcpConnect --------------------------------------------------

/// Create new TCP connections.
#[derive(Clone, Copy, Debug)]
pub struct TcpConnect {
    /// Remote address to connect to.
    addr: SocketAddr,
}

impl TcpConnect {
    /// Create new TCP connections.
    ///
    /// addr is the destination address to connect to.
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

impl AsyncConnect for TcpConnect {
    type Connection = TcpStream;
    type Fut = Pin<
        Box<
            dyn Future<Output = Result<Self::Connection, std::io::Error>>
                + Send,
        >,
    >;

    fn connect(&self) -> Self::Fut {
        let addr = self.addr;
        Box::pin(async move {
            let sock = TcpStream::connect(addr).await?;
            sock.set_nodelay(true)?;
            Ok(sock)
        })
    }
}

//------------ TlsConnect -----------------------------------------------------

/// Create new TLS connections
#[derive(Clone, Debug)]
pub struct TlsConnect {
    /// TLS settings.
    config: TlsConfig,

    /// Remote address to connect to.
    addr: SocketAddr,
}

impl TlsConnect {
    /// Function to create a new TLS connection stream
    pub fn new(config: TlsConfig, addr: SocketAddr) -> Self {
        Self { config, addr }
    }
}

impl AsyncConnect for TlsConnect {
    type Connection = TlsStream<TcpStream>;
    type Fut = Pin<
        Box<
            dyn Future<Output = Result<Self::Connection, std::io::Error>>
                + Send,
        >,
    >;

    fn connect(&self) -> Self::Fut {
        let tls_connection =
            TlsConnector::from(self.config.client_config().clone());
        let server_name = self.config.server_name_for(self.addr);
        let tcp_connect = TcpConnect::new(self.addr);
        Box::pin(async move {
            let tcp = tcp_connect.connect().await?;
            tls_connection.connect(server_name, tcp).await
        })
    }
}

//------------ UdpConnect --------------------------------------------------

/// Create new connected UDP sockets.
#[derive(Clone, Copy, Debug)]
pub struct UdpConnect {
    /// Remote address to connect to.
    addr: SocketAddr,
}

impl UdpConnect {
    /// Create new UDP connections.
    ///
    /// addr is the destination address to connect to.
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    /// Bind to a random local UDP port.
    ///
    /// Tries another random port if the chosen one is in use.
    async fn udp_bind(v4: bool) -> Result<UdpSocket, io::Error> {
        let mut i = 0;
        loop {
            let port = rand::thread_rng().gen_range(LOCAL_PORTS);
            let local: SocketAddr = if v4 {
                ([0u8; 4], port).into()
            } else {
                ([0u16; 8], port).into()
            };
            match UdpSocket::bind(&local).await {
                Ok(sock) => return Ok(sock),
                Err(err)
                    if err.kind() == io::ErrorKind::AddrInUse
                        && i < RETRY_RANDOM_PORT =>
                {
                    i += 1
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl AsyncConnect for UdpConnect {
    type Connection = UdpSocket;
    type Fut = Pin<
        Box<
            dyn Future<Output = Result<Self::Connection, std::io::Error>>
                + Send,
        >,
    >;

    fn connect(&self) -> Self::Fut {
        let addr = self.addr;
        Box::pin(async move {
            let sock = Self::udp_bind(addr.is_ipv4()).await?;
            sock.connect(addr).await?;
            Ok(sock)
        })
    }
}

//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn protocol_names() {
        for proto in [Protocol::Udp, Protocol::Tcp, Protocol::TcpTls] {
            assert_eq!(proto.as_str().parse::<Protocol>(), Ok(proto));
        }
        assert_eq!("tls".parse::<Protocol>(), Ok(Protocol::TcpTls));
        assert_eq!("quic".parse::<Protocol>(), Err(UnknownProtocol));
        assert_eq!(Protocol::TcpTls.default_port(), 853);
    }

    #[tokio::test]
    async fn udp_binds_random_ports() {
        let mut ports = Vec::new();
        for _ in 0..4 {
            let sock = UdpConnect::udp_bind(true).await.unwrap();
            let port = sock.local_addr().unwrap().port();
            assert!(LOCAL_PORTS.contains(&port));
            ports.push(port);
        }
        ports.dedup();
        assert!(ports.len() > 1);
    }
}
