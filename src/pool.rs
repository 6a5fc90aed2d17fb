//! A pool of idle connections to a single upstream.
//!
//! The pool keeps a stack of idle connections per [`Protocol`]. All state is
//! owned by a single runner task started through [`Pool::start`]. Other
//! tasks only talk to it through three channels: one to request a cached
//! connection, one to return a connection after use, and one to stop the
//! runner.
//!
//! Connections are handed out last-in-first-out. A connection that has been
//! idle for at least the expire duration is never handed out again. Stale
//! connections are dropped either when a dial finds the most recent
//! connection to be stale or by a periodic sweep.
//!
//! When the pool has no usable connection, [`Pool::dial`] creates a new one
//! with a timeout derived from a moving average of past dial times.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, trace};

use crate::config::UpstreamConfig;
use crate::conn::Connection;
use crate::error::Error;
use crate::protocol::{Protocol, TlsConfig};

/// Capacity of the dial and yield channels.
const DEF_CHAN_CAP: usize = 8;

/// Shortest interval between two sweeps.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

/// Weight of a new sample in the dial time moving average.
const DIAL_TIME_WEIGHT: i64 = 4;

//------------ Pool -----------------------------------------------------------

/// A pool of connections to a single upstream.
pub struct Pool {
    /// The address of the upstream.
    addr: SocketAddr,

    /// How long an idle connection stays usable.
    expire: Duration,

    /// TLS settings. If present, all connections use DNS over TLS.
    tls: Option<TlsConfig>,

    /// Lower bound of the dial timeout.
    min_dial_timeout: Duration,

    /// Upper bound of the dial timeout.
    max_dial_timeout: Duration,

    /// Moving average of the time it took to dial, in nanoseconds.
    ///
    /// Updates are a load followed by an add. Concurrent dials may lose
    /// each other's update, which is fine for a timeout estimate.
    avg_dial_time: AtomicI64,

    /// Requests for a cached connection.
    dial_tx: mpsc::Sender<DialReq>,

    /// Connections returned after use.
    yield_tx: mpsc::Sender<Idle>,

    /// Tells the runner to stop.
    stop_tx: mpsc::Sender<()>,

    /// The receiving halves, until the runner is started.
    receivers: Mutex<Option<Receivers>>,
}

impl Pool {
    /// Creates a new pool for the upstream at `addr`.
    ///
    /// The pool is not usable until [`start`][Self::start] was called.
    pub fn new(addr: SocketAddr, expire: Duration) -> Self {
        Self::with_config(addr, expire, &UpstreamConfig::default())
    }

    /// Creates a new pool with the dial bounds of `config`.
    pub fn with_config(
        addr: SocketAddr,
        expire: Duration,
        config: &UpstreamConfig,
    ) -> Self {
        let (dial_tx, dial_rx) = mpsc::channel(DEF_CHAN_CAP);
        let (yield_tx, yield_rx) = mpsc::channel(DEF_CHAN_CAP);
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let max_dial_timeout = config.max_dial_timeout();
        Self {
            addr,
            expire,
            tls: None,
            min_dial_timeout: config.min_dial_timeout(),
            max_dial_timeout,
            avg_dial_time: AtomicI64::new(duration_nanos(
                max_dial_timeout / 2,
            )),
            dial_tx,
            yield_tx,
            stop_tx,
            receivers: Mutex::new(Some(Receivers {
                dial_rx,
                yield_rx,
                stop_rx,
            })),
        }
    }

    /// Returns the address of the upstream.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Returns the expire duration.
    pub fn expire(&self) -> Duration {
        self.expire
    }

    /// Sets the expire duration.
    ///
    /// This only has an effect before the pool is started.
    pub fn set_expire(&mut self, expire: Duration) {
        self.expire = expire
    }

    /// Returns the TLS settings.
    pub fn tls_config(&self) -> Option<&TlsConfig> {
        self.tls.as_ref()
    }

    /// Sets the TLS settings.
    ///
    /// Once set, every connection of the pool uses DNS over TLS.
    pub fn set_tls_config(&mut self, tls: TlsConfig) {
        self.tls = Some(tls)
    }

    /// Starts the runner task.
    ///
    /// Must be called from within a Tokio runtime. Calling it more than
    /// once has no effect.
    pub fn start(&self) {
        let Some(receivers) = self.receivers.lock().take() else {
            return;
        };
        let runner = Runner {
            receivers,
            conns: HashMap::new(),
            expire: self.expire,
            addr: self.addr,
        };
        tokio::spawn(runner.run());
    }

    /// Stops the runner task.
    ///
    /// All cached connections are closed. Further dials fail with
    /// [`Error::PoolStopped`].
    pub fn stop(&self) {
        // A full channel means a stop is already pending.
        _ = self.stop_tx.try_send(());
    }

    /// Returns a connection for `protocol`.
    ///
    /// The returned flag is `true` if the connection was taken from the
    /// pool rather than newly created. If TLS is configured, the protocol is
    /// always [`Protocol::TcpTls`].
    pub async fn dial(
        &self,
        protocol: Protocol,
    ) -> Result<(Connection, bool), Error> {
        let protocol = if self.tls.is_some() {
            Protocol::TcpTls
        } else {
            protocol
        };

        if self.receivers.lock().is_some() {
            // Not started, nobody would answer.
            return Err(Error::PoolStopped);
        }

        let (tx, rx) = oneshot::channel();
        self.dial_tx
            .send(DialReq { protocol, tx })
            .await
            .map_err(|_| Error::PoolStopped)?;
        if let Some(conn) = rx.await.map_err(|_| Error::PoolStopped)? {
            trace!(addr = %self.addr, %protocol, "reusing cached connection");
            return Ok((conn, true));
        }

        let timeout = self.dial_timeout();
        let start = Instant::now();
        let res = tokio::time::timeout(
            timeout,
            Connection::dial(self.addr, protocol, self.tls.as_ref()),
        )
        .await;
        self.update_dial_time(start.elapsed());
        match res {
            Ok(Ok(conn)) => {
                trace!(addr = %self.addr, %protocol, "dialed new connection");
                Ok((conn, false))
            }
            Ok(Err(err)) => Err(err),
            Err(_) => {
                debug!(addr = %self.addr, ?timeout, "dial timed out");
                Err(Error::DialTimeout)
            }
        }
    }

    /// Returns a connection to the pool.
    ///
    /// If the pool is stopped, the connection is closed instead.
    pub async fn yield_conn(&self, conn: Connection) {
        let idle = Idle {
            conn,
            used: Instant::now(),
        };
        if let Err(err) = self.yield_tx.send(idle).await {
            close_all(vec![err.0]);
        }
    }

    /// Returns the current dial timeout.
    pub fn dial_timeout(&self) -> Duration {
        limit_timeout(
            &self.avg_dial_time,
            self.min_dial_timeout,
            self.max_dial_timeout,
        )
    }

    /// Feeds an observed dial time into the moving average.
    fn update_dial_time(&self, observed: Duration) {
        average_timeout(&self.avg_dial_time, observed, DIAL_TIME_WEIGHT);
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("addr", &self.addr)
            .field("expire", &self.expire)
            .field("tls", &self.tls.is_some())
            .field("dial_timeout", &self.dial_timeout())
            .finish()
    }
}

//------------ DialReq ----------------------------------------------------------

/// A request for a cached connection.
struct DialReq {
    /// The protocol the connection should use.
    protocol: Protocol,

    /// Where to send the connection, or `None` if there is none.
    tx: oneshot::Sender<Option<Connection>>,
}

//------------ Idle -------------------------------------------------------------

/// An idle connection in the pool.
struct Idle {
    /// The connection.
    conn: Connection,

    /// When the connection was last returned to the pool.
    used: Instant,
}

//------------ Receivers --------------------------------------------------------

/// The receiving side of the channels of a pool.
struct Receivers {
    /// Requests for a cached connection.
    dial_rx: mpsc::Receiver<DialReq>,

    /// Connections returned after use.
    yield_rx: mpsc::Receiver<Idle>,

    /// Stop requests.
    stop_rx: mpsc::Receiver<()>,
}

//------------ Runner -----------------------------------------------------------

/// The task owning the idle connections of a pool.
struct Runner {
    /// Channels to receive requests on.
    receivers: Receivers,

    /// Stacks of idle connections per protocol.
    ///
    /// Connections are pushed in the order they are returned, so the
    /// `used` times in each stack are ascending.
    conns: HashMap<Protocol, Vec<Idle>>,

    /// How long an idle connection stays usable.
    expire: Duration,

    /// The address of the upstream, for logging.
    addr: SocketAddr,
}

impl Runner {
    /// Runs until stopped or until the pool is dropped.
    async fn run(mut self) {
        let period = self.expire.max(MIN_SWEEP_INTERVAL);
        let mut sweep = interval_at(Instant::now() + period, period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            // Yields are handled before dials so that a dial following a
            // yield finds the returned connection.
            tokio::select! {
                biased;
                _ = self.receivers.stop_rx.recv() => break,
                idle = self.receivers.yield_rx.recv() => {
                    let Some(idle) = idle else { break };
                    self.conns
                        .entry(idle.conn.protocol())
                        .or_default()
                        .push(idle);
                }
                req = self.receivers.dial_rx.recv() => {
                    let Some(req) = req else { break };
                    self.handle_dial(req, Instant::now());
                }
                _ = sweep.tick() => self.sweep(Instant::now()),
            }
        }

        self.shutdown();
    }

    /// Answers a request for a cached connection.
    fn handle_dial(&mut self, req: DialReq, now: Instant) {
        match self.take(req.protocol, now) {
            Some(idle) => {
                let used = idle.used;
                if let Err(Some(conn)) = req.tx.send(Some(idle.conn)) {
                    // The requester went away. Keep the connection.
                    self.conns
                        .entry(req.protocol)
                        .or_default()
                        .push(Idle { conn, used });
                }
            }
            None => {
                _ = req.tx.send(None);
            }
        }
    }

    /// Takes the most recently used connection for `protocol`.
    ///
    /// If that connection is stale, all connections for the protocol are
    /// older still and the whole stack is dropped.
    fn take(&mut self, protocol: Protocol, now: Instant) -> Option<Idle> {
        let stack = self.conns.get_mut(&protocol)?;
        let last_used = stack.last()?.used;
        if now.saturating_duration_since(last_used) < self.expire {
            return stack.pop();
        }
        let stale = mem::take(stack);
        debug!(
            addr = %self.addr, %protocol, count = stale.len(),
            "dropping stale connections"
        );
        close_all(stale);
        None
    }

    /// Drops all connections last used at or before `now - expire`.
    fn sweep(&mut self, now: Instant) {
        let Some(stale_time) = now.checked_sub(self.expire) else {
            return;
        };
        for (protocol, stack) in self.conns.iter_mut() {
            let good = stack.partition_point(|idle| idle.used <= stale_time);
            if good == 0 {
                continue;
            }
            let fresh = stack.split_off(good);
            let stale = mem::replace(stack, fresh);
            trace!(
                addr = %self.addr, %protocol, count = stale.len(),
                "expired idle connections"
            );
            close_all(stale);
        }
    }

    /// Drops all connections and stops accepting returned ones.
    fn shutdown(mut self) {
        self.receivers.dial_rx.close();
        self.receivers.yield_rx.close();
        let mut conns: Vec<Idle> =
            self.conns.drain().flat_map(|(_, stack)| stack).collect();
        while let Ok(idle) = self.receivers.yield_rx.try_recv() {
            conns.push(idle);
        }
        debug!(addr = %self.addr, count = conns.len(), "pool stopped");
        close_all(conns);
    }
}

//------------ Utility --------------------------------------------------------

/// Closes connections in a new task.
fn close_all(conns: Vec<Idle>) {
    if conns.is_empty() {
        return;
    }
    tokio::spawn(async move {
        for idle in conns {
            idle.conn.close().await;
        }
    });
}

/// Converts a duration into nanoseconds, saturating at `i64::MAX`.
fn duration_nanos(duration: Duration) -> i64 {
    i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX)
}

/// Derives a timeout from the average in `current_avg`.
///
/// The timeout is twice the average, but no less than `min_value` and no
/// more than `max_value`.
fn limit_timeout(
    current_avg: &AtomicI64,
    min_value: Duration,
    max_value: Duration,
) -> Duration {
    let rt = current_avg.load(Ordering::Relaxed);
    let rt = Duration::from_nanos(u64::try_from(rt).unwrap_or(0));
    if rt < min_value {
        return min_value;
    }
    if rt < max_value / 2 {
        return 2 * rt;
    }
    max_value
}

/// Moves the average in `current_avg` by `1/weight` towards `observed`.
fn average_timeout(current_avg: &AtomicI64, observed: Duration, weight: i64) {
    let dt = current_avg.load(Ordering::Relaxed);
    let delta = duration_nanos(observed).saturating_sub(dt) / weight;
    current_avg.fetch_add(delta, Ordering::Relaxed);
}

//============ Tests =========================================================
