//! Liveness probes for upstreams.
//!
//! A health check is deliberately independent of the connection pool of an
//! upstream: it always uses a new, short-lived connection with its own
//! fixed timeouts.

use std::boxed::Box;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use domain::base::{Message, MessageBuilder, Name, Rtype};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::time::timeout;
use tracing::trace;

use crate::config::HEALTH_CHECK_TIMEOUT;
use crate::conn::Connection;
use crate::error::Error;
use crate::protocol::{Protocol, TlsConfig};

//------------ HealthCheck ----------------------------------------------------

/// Decides whether an upstream is alive.
pub trait HealthCheck: Send + Sync {
    /// Probes the upstream once.
    ///
    /// Returns `Ok(())` if the upstream is considered alive.
    fn check(&self) -> BoxFuture<'_, Result<(), Error>>;

    /// Sets the TLS settings used by the probe.
    ///
    /// The default implementation ignores them.
    fn set_tls_config(&mut self, tls: TlsConfig) {
        let _ = tls;
    }
}

//------------ DnsHealthCheck -------------------------------------------------

/// Probes an upstream with a query for the name servers of the root zone.
///
/// Any DNS message received in return counts as alive, whatever its
/// response code.
#[derive(Clone)]
pub struct DnsHealthCheck {
    /// The address of the upstream.
    addr: SocketAddr,

    /// The protocol to probe with.
    protocol: Protocol,

    /// TLS settings. If present, the probe uses DNS over TLS.
    tls: Option<TlsConfig>,

    /// Timeout for writing the probe.
    write_timeout: Duration,

    /// Timeout for dialing and for reading the response.
    read_timeout: Duration,
}

impl DnsHealthCheck {
    /// Creates a probe for the upstream at `addr`.
    pub fn new(addr: SocketAddr, protocol: Protocol) -> Self {
        Self {
            addr,
            protocol,
            tls: None,
            write_timeout: HEALTH_CHECK_TIMEOUT,
            read_timeout: HEALTH_CHECK_TIMEOUT,
        }
    }

    /// Sets the read timeout.
    pub fn set_read_timeout(&mut self, value: Duration) {
        self.read_timeout = value
    }

    /// Sets the write timeout.
    pub fn set_write_timeout(&mut self, value: Duration) {
        self.write_timeout = value
    }

    /// Runs a single probe.
    async fn probe(&self) -> Result<(), Error> {
        let protocol = if self.tls.is_some() {
            Protocol::TcpTls
        } else {
            self.protocol
        };
        let query = probe_message()?;

        let mut conn = timeout(
            self.read_timeout,
            Connection::dial(self.addr, protocol, self.tls.as_ref()),
        )
        .await
        .map_err(|_| Error::DialTimeout)??;

        let res = self.exchange(&mut conn, &query).await;
        conn.close().await;
        res
    }

    /// Sends the probe and waits for any message.
    async fn exchange(
        &self,
        conn: &mut Connection,
        query: &Message<Bytes>,
    ) -> Result<(), Error> {
        timeout(self.write_timeout, conn.write_msg(query.as_slice()))
            .await
            .map_err(|_| Error::WriteTimeout)?
            .map_err(|err| Error::Write(err.into()))?;
        let octets = timeout(self.read_timeout, conn.read_msg())
            .await
            .map_err(|_| Error::ReadTimeout)?
            .map_err(|err| Error::Read(err.into()))?;
        let reply =
            Message::from_octets(octets).map_err(|_| Error::ShortMessage)?;
        trace!(
            addr = %self.addr,
            rcode = %reply.header().rcode(),
            "health check answered"
        );
        Ok(())
    }
}

impl HealthCheck for DnsHealthCheck {
    fn check(&self) -> BoxFuture<'_, Result<(), Error>> {
        self.probe().boxed()
    }

    fn set_tls_config(&mut self, tls: TlsConfig) {
        self.tls = Some(tls)
    }
}

impl fmt::Debug for DnsHealthCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DnsHealthCheck")
            .field("addr", &self.addr)
            .field("protocol", &self.protocol)
            .field("tls", &self.tls.is_some())
            .field("write_timeout", &self.write_timeout)
            .field("read_timeout", &self.read_timeout)
            .finish()
    }
}

//------------ Utility --------------------------------------------------------

/// Creates the probe query `. IN NS` with a random id.
fn probe_message() -> Result<Message<Bytes>, Error> {
    let mut msg = MessageBuilder::new_bytes();
    msg.header_mut().set_random_id();
    msg.header_mut().set_rd(true);
    let mut msg = msg.question();
    msg.push((Name::root_vec(), Rtype::NS))
        .map_err(|_| Error::MessageBuilderPushError)?;
    Ok(msg.into_message())
}

//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;
    use domain::base::iana::Rcode;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, UdpSocket};

    #[test]
    fn probe_is_root_ns() {
        let msg = probe_message().unwrap();
        assert!(msg.header().rd());
        assert!(!msg.header().qr());
        let question = msg.first_question().unwrap();
        assert!(question.qname().is_root());
        assert_eq!(question.qtype(), Rtype::NS);
    }

    #[tokio::test]
    async fn refused_is_alive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let len = sock.read_u16().await.unwrap();
            let mut buf = vec![0; len as usize];
            sock.read_exact(&mut buf).await.unwrap();
            let query = Message::from_octets(buf).unwrap();
            let reply = MessageBuilder::new_vec()
                .start_answer(&query, Rcode::REFUSED)
                .unwrap()
                .into_message();
            let reply = reply.as_slice();
            sock.write_u16(reply.len() as u16).await.unwrap();
            sock.write_all(reply).await.unwrap();
        });

        let check = DnsHealthCheck::new(addr, Protocol::Tcp);
        check.check().await.unwrap();
    }

    #[tokio::test]
    async fn silence_is_dead() {
        // A bound socket that never answers.
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut check =
            DnsHealthCheck::new(sock.local_addr().unwrap(), Protocol::Udp);
        check.set_read_timeout(Duration::from_millis(100));
        assert!(matches!(check.check().await, Err(Error::ReadTimeout)));
    }

    #[tokio::test]
    async fn refused_connection_is_dead() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let check = DnsHealthCheck::new(addr, Protocol::Tcp);
        assert!(matches!(check.check().await, Err(Error::Dial(_))));
    }
}
