//! A single upstream resolver.
//!
//! An [`Upstream`] binds the address of an upstream to its connection
//! [`Pool`] and its [`HealthCheck`]. It is created once when the fan-out is
//! configured and lives until the fan-out is stopped.

use std::boxed::Box;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use domain::base::Message;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, trace, warn};

use crate::config::{Config, UpstreamConfig};
use crate::conn::Connection;
use crate::error::Error;
use crate::health::{DnsHealthCheck, HealthCheck};
use crate::pool::Pool;
use crate::protocol::{Protocol, TlsConfig};

//------------ Upstream -------------------------------------------------------

/// A client for one upstream resolver.
pub struct Upstream {
    /// The address of the upstream.
    addr: SocketAddr,

    /// The protocol used to talk to the upstream.
    protocol: Protocol,

    /// Read and write timeouts.
    config: UpstreamConfig,

    /// Cached connections to the upstream.
    pool: Pool,

    /// The liveness probe.
    health: Box<dyn HealthCheck>,

    /// The number of consecutive failed health checks.
    fails: AtomicU32,
}

impl Upstream {
    /// Creates a new upstream with default configuration.
    pub fn new(addr: SocketAddr, protocol: Protocol) -> Self {
        Self::with_config(addr, protocol, &Config::default())
    }

    /// Creates a new upstream using the expire time and timeouts of `config`.
    ///
    /// The upstream needs to be started before it can send queries.
    pub fn with_config(
        addr: SocketAddr,
        protocol: Protocol,
        config: &Config,
    ) -> Self {
        Self {
            addr,
            protocol,
            config: *config.upstream(),
            pool: Pool::with_config(addr, config.expire(), config.upstream()),
            health: Box::new(DnsHealthCheck::new(addr, protocol)),
            fails: AtomicU32::new(0),
        }
    }

    /// Replaces the health check.
    pub fn with_health_check(
        mut self,
        health: impl HealthCheck + 'static,
    ) -> Self {
        self.health = Box::new(health);
        self
    }

    /// Sets the TLS settings of the pool and the health check.
    pub fn set_tls_config(&mut self, tls: TlsConfig) {
        self.health.set_tls_config(tls.clone());
        self.pool.set_tls_config(tls);
    }

    /// Sets how long idle connections are kept.
    ///
    /// Health checks never keep connections, so only the pool is affected.
    /// This only has an effect before the upstream is started.
    pub fn set_expire(&mut self, expire: Duration) {
        self.pool.set_expire(expire)
    }

    /// Starts the connection pool.
    pub fn start(&self) {
        self.pool.start()
    }

    /// Stops the connection pool and closes all cached connections.
    pub fn stop(&self) {
        self.pool.stop()
    }

    /// Returns the address of the upstream.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Returns the protocol used to talk to the upstream.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Returns the number of consecutive failed health checks.
    pub fn fails(&self) -> u32 {
        self.fails.load(Ordering::Relaxed)
    }

    /// Sends a query and waits for the response with the same id.
    ///
    /// On success the connection goes back to the pool. On any error it is
    /// closed.
    pub async fn send(
        &self,
        query: &Message<Bytes>,
    ) -> Result<Message<Bytes>, Error> {
        if query.as_slice().len() > usize::from(u16::MAX) {
            return Err(Error::MessageTooLong);
        }

        let (mut conn, cached) = self.pool.dial(self.protocol).await?;
        match self.exchange(&mut conn, query, cached).await {
            Ok(reply) => {
                self.pool.yield_conn(conn).await;
                Ok(reply)
            }
            Err(err) => {
                debug!(addr = %self.addr, cached, %err, "exchange failed");
                conn.close().await;
                Err(err)
            }
        }
    }

    /// Runs the health check and updates the fail counter.
    pub async fn health_check(&self) -> Result<(), Error> {
        match self.health.check().await {
            Ok(()) => {
                let fails = self.fails.swap(0, Ordering::Relaxed);
                if fails > 0 {
                    debug!(addr = %self.addr, fails, "upstream recovered");
                }
                Ok(())
            }
            Err(err) => {
                let fails = self.fails.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(addr = %self.addr, fails, %err, "health check failed");
                Err(err)
            }
        }
    }

    /// Writes the query and reads until a response with its id arrives.
    async fn exchange(
        &self,
        conn: &mut Connection,
        query: &Message<Bytes>,
        cached: bool,
    ) -> Result<Message<Bytes>, Error> {
        let write = conn.write_msg(query.as_slice());
        match timeout(self.config.write_timeout(), write).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(io_error(err, cached, Error::Write)),
            Err(_) => return Err(Error::WriteTimeout),
        }

        // One deadline for all reads, stray responses don't extend it.
        let deadline = Instant::now() + self.config.read_timeout();
        let id = query.header().id();
        loop {
            let octets = match timeout_at(deadline, conn.read_msg()).await {
                Ok(Ok(octets)) => octets,
                Ok(Err(err)) => return Err(io_error(err, cached, Error::Read)),
                Err(_) => return Err(Error::ReadTimeout),
            };
            let reply = Message::from_octets(octets)
                .map_err(|_| Error::ShortMessage)?;
            if reply.header().id() == id {
                return Ok(reply);
            }
            trace!(
                addr = %self.addr,
                expected = id,
                got = reply.header().id(),
                "dropping response with wrong id"
            );
        }
    }
}

impl fmt::Debug for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Upstream")
            .field("addr", &self.addr)
            .field("protocol", &self.protocol)
            .field("config", &self.config)
            .field("pool", &self.pool)
            .field("fails", &self.fails())
            .finish()
    }
}

//------------ Utility --------------------------------------------------------

/// Converts an I/O error of an exchange.
///
/// A peer closing a connection that came from the pool is reported as
/// [`Error::CachedClosed`].
fn io_error(
    err: io::Error,
    cached: bool,
    wrap: fn(Arc<io::Error>) -> Error,
) -> Error {
    let closed = matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
    );
    if cached && closed {
        Error::CachedClosed
    } else {
        wrap(Arc::new(err))
    }
}

//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cached_closed_only_for_cached() {
        let eof = || io::Error::from(io::ErrorKind::UnexpectedEof);
        assert!(io_error(eof(), true, Error::Read).is_cached_closed());
        assert!(matches!(
            io_error(eof(), false, Error::Read),
            Error::Read(_)
        ));
        let other = io::Error::from(io::ErrorKind::PermissionDenied);
        assert!(matches!(
            io_error(other, true, Error::Write),
            Error::Write(_)
        ));
    }
}
