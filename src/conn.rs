//! A single transport connection to an upstream.
//!
//! A [`Connection`] is owned by exactly one party at a time: either the idle
//! stack of a [`Pool`][crate::pool::Pool] or the exchange that is currently
//! using it. It is therefore never shared and all methods take `&mut self`.

use bytes::Bytes;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio_rustls::client::TlsStream;

use crate::error::Error;
use crate::protocol::{
    AsyncConnect, Protocol, TcpConnect, TlsConfig, TlsConnect, UdpConnect,
};

/// Size of the receive buffer for UDP responses.
const UDP_RECV_SIZE: usize = 65535;

//------------ Connection -----------------------------------------------------

/// A connection to an upstream.
pub struct Connection {
    /// The underlying socket.
    stream: Stream,
}

/// The socket types a connection can be made of.
enum Stream {
    /// A connected UDP socket.
    Udp(UdpSocket),

    /// A plain TCP stream.
    Tcp(TcpStream),

    /// A TLS stream over TCP.
    Tls(Box<TlsStream<TcpStream>>),
}

impl Connection {
    /// Opens a new connection to `addr`.
    ///
    /// A `tls` config is required for [`Protocol::TcpTls`] and ignored
    /// otherwise.
    pub async fn dial(
        addr: SocketAddr,
        protocol: Protocol,
        tls: Option<&TlsConfig>,
    ) -> Result<Self, Error> {
        let stream = match protocol {
            Protocol::Udp => {
                UdpConnect::new(addr).connect().await.map(Stream::Udp)
            }
            Protocol::Tcp => {
                TcpConnect::new(addr).connect().await.map(Stream::Tcp)
            }
            Protocol::TcpTls => match tls {
                Some(tls) => TlsConnect::new(tls.clone(), addr)
                    .connect()
                    .await
                    .map(|stream| Stream::Tls(Box::new(stream))),
                None => Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "DNS over TLS without TLS configuration",
                )),
            },
        };
        let stream = stream.map_err(|err| Error::Dial(Arc::new(err)))?;
        Ok(Self { stream })
    }

    /// Returns the protocol of the connection.
    pub fn protocol(&self) -> Protocol {
        match self.stream {
            Stream::Udp(_) => Protocol::Udp,
            Stream::Tcp(_) => Protocol::Tcp,
            Stream::Tls(_) => Protocol::TcpTls,
        }
    }

    /// Returns the local address of the connection.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match &self.stream {
            Stream::Udp(sock) => sock.local_addr(),
            Stream::Tcp(sock) => sock.local_addr(),
            Stream::Tls(sock) => sock.get_ref().0.local_addr(),
        }
    }

    /// Writes a single DNS message.
    pub async fn write_msg(&mut self, msg: &[u8]) -> io::Result<()> {
        match &mut self.stream {
            Stream::Udp(sock) => {
                let sent = sock.send(msg).await?;
                if sent != msg.len() {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "partial send to UDP socket",
                    ));
                }
                Ok(())
            }
            Stream::Tcp(sock) => write_framed(sock, msg).await,
            Stream::Tls(sock) => write_framed(sock.as_mut(), msg).await,
        }
    }

    /// Reads a single DNS message.
    ///
    /// The returned octets have not been parsed yet.
    pub async fn read_msg(&mut self) -> io::Result<Bytes> {
        match &mut self.stream {
            Stream::Udp(sock) => {
                let mut buf = vec![0; UDP_RECV_SIZE];
                let len = sock.recv(&mut buf).await?;
                buf.truncate(len);
                Ok(buf.into())
            }
            Stream::Tcp(sock) => read_framed(sock).await,
            Stream::Tls(sock) => read_framed(sock.as_mut()).await,
        }
    }

    /// Closes the connection.
    ///
    /// Stream connections are shut down properly, errors are ignored.
    pub async fn close(self) {
        match self.stream {
            Stream::Udp(_) => {}
            Stream::Tcp(mut sock) => {
                _ = sock.shutdown().await;
            }
            Stream::Tls(mut sock) => {
                _ = sock.shutdown().await;
            }
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("protocol", &self.protocol())
            .field("local_addr", &self.local_addr().ok())
            .finish()
    }
}

//------------ Utility --------------------------------------------------------

/// Writes a message prefixed with its length as a two octet value.
async fn write_framed<S: AsyncWrite + Unpin>(
    sock: &mut S,
    msg: &[u8],
) -> io::Result<()> {
    let len = u16::try_from(msg.len()).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, "message too long")
    })?;
    let mut buf = Vec::with_capacity(msg.len() + 2);
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(msg);
    sock.write_all(&buf).await?;
    sock.flush().await
}

/// Reads a message prefixed with its length as a two octet value.
async fn read_framed<S: AsyncRead + Unpin>(sock: &mut S) -> io::Result<Bytes> {
    let len = sock.read_u16().await? as usize;
    let mut buf = vec![0; len];
    sock.read_exact(&mut buf).await?;
    Ok(buf.into())
}
