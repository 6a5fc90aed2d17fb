//! Racing a query against a set of upstreams.
//!
//! A [`Fanout`] forwards each query to all of its upstreams at the same
//! time. Every upstream gets its own attempt task which retries failed
//! sends as long as the upstream's health check passes, up to the
//! configured maximum number of failures. The first response with a
//! NOERROR response code wins right away. Otherwise the best response
//! received until all attempts reported or the query deadline expired is
//! used, see [`Fanout::resolve`] for the details.
//!
//! In addition, each upstream is health checked in the background at the
//! configured interval, so its failure count stays current between queries.
//!
//! Attempt tasks are not cancelled when a query is decided. An exchange
//! that is in flight at that point runs until its own I/O timeouts and
//! still returns its connection to the pool. Its result is dropped.

#![warn(missing_docs)]

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use std::vec::Vec;

use bytes::Bytes;
use domain::base::iana::Rcode;
use domain::base::name::ToName;
use domain::base::{Message, MessageBuilder};
use octseq::Octets;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::error::Error;
use crate::protocol::{Protocol, TlsConfig};
use crate::tap::Tap;
use crate::upstream::Upstream;

//------------ Fanout ---------------------------------------------------------

/// Forwards queries to several upstreams concurrently.
pub struct Fanout {
    /// The configuration.
    config: Config,

    /// The upstreams, all of them started.
    upstreams: Vec<Arc<Upstream>>,

    /// TLS settings for upstreams using DNS over TLS.
    tls: Option<TlsConfig>,

    /// The observability hook.
    tap: Option<Arc<dyn Tap>>,

    /// The background health check tasks.
    checkers: Vec<JoinHandle<()>>,
}

impl Fanout {
    /// Creates a fan-out without upstreams using the default config.
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// Creates a fan-out without upstreams.
    pub fn with_config(config: Config) -> Self {
        Self {
            config,
            upstreams: Vec::new(),
            tls: None,
            tap: None,
            checkers: Vec::new(),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Sets the TLS settings.
    ///
    /// They are applied to DNS-over-TLS upstreams added afterwards.
    pub fn set_tls_config(&mut self, tls: TlsConfig) {
        self.tls = Some(tls)
    }

    /// Sets the hook told about resolved queries.
    pub fn set_tap(&mut self, tap: impl Tap + 'static) {
        self.tap = Some(Arc::new(tap))
    }

    /// Adds an upstream at `addr` with the configured timeouts and starts it.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn add(&mut self, addr: SocketAddr, protocol: Protocol) {
        let upstream = Upstream::with_config(addr, protocol, &self.config);
        self.add_upstream(upstream)
    }

    /// Adds an upstream and starts it.
    ///
    /// The configured expire time is applied to the upstream, and so are
    /// the TLS settings if the upstream uses DNS over TLS.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn add_upstream(&mut self, mut upstream: Upstream) {
        upstream.set_expire(self.config.expire());
        if upstream.protocol() == Protocol::TcpTls {
            if let Some(tls) = &self.tls {
                upstream.set_tls_config(tls.clone());
            }
        }
        upstream.start();
        debug!(
            addr = %upstream.addr(),
            protocol = %upstream.protocol(),
            "added upstream"
        );
        let upstream = Arc::new(upstream);
        if let Some(period) = self.config.health_check_interval() {
            self.checkers.push(tokio::spawn(check_periodically(
                Arc::downgrade(&upstream),
                period,
            )));
        }
        self.upstreams.push(upstream);
    }

    /// Returns the upstreams.
    pub fn upstreams(&self) -> &[Arc<Upstream>] {
        &self.upstreams
    }

    /// Returns the number of upstreams.
    pub fn len(&self) -> usize {
        self.upstreams.len()
    }

    /// Returns whether there are no upstreams.
    pub fn is_empty(&self) -> bool {
        self.upstreams.is_empty()
    }

    /// Stops all upstreams and their background health checks.
    ///
    /// Queries resolved afterwards fail.
    pub fn stop(&self) {
        for checker in &self.checkers {
            checker.abort()
        }
        for upstream in &self.upstreams {
            upstream.stop()
        }
    }

    /// Returns whether queries for `qname` are handled.
    ///
    /// A name is handled if it is at or below the `from` zone and not at or
    /// below one of the ignored zones. The `from` zone itself is always
    /// handled.
    pub fn matches(&self, qname: &impl ToName) -> bool {
        let from = self.config.from();
        if !qname.ends_with(from) {
            return false;
        }
        if qname.name_eq(from) {
            return true;
        }
        !self
            .config
            .ignored()
            .iter()
            .any(|ignored| qname.ends_with(ignored))
    }

    /// Resolves a query.
    ///
    /// The query is sent to all upstreams concurrently. The result is
    ///
    /// * the first response with a NOERROR response code,
    /// * otherwise, once all upstreams reported or the deadline expired, the
    ///   best response received so far,
    /// * [`Error::NoHealthy`] if no upstream provided a response, and
    /// * [`Error::ContextDone`] if the deadline expired before any upstream
    ///   reported.
    ///
    /// The returned response is not checked against the query, see
    /// [`serve`][Self::serve] for that.
    pub async fn resolve(
        &self,
        query: &Message<Bytes>,
    ) -> Result<Message<Bytes>, Error> {
        if self.upstreams.is_empty() {
            return Err(Error::NoUpstreams);
        }

        let deadline = Instant::now() + self.config.timeout();
        let (tx, mut rx) = mpsc::channel(self.upstreams.len());
        for upstream in &self.upstreams {
            tokio::spawn(attempt(
                upstream.clone(),
                query.clone(),
                self.config.max_fail_count(),
                deadline,
                tx.clone(),
            ));
        }
        // Only the attempts hold senders now, so the channel closes once
        // all of them are done.
        drop(tx);

        let (best, expired) = collect(&mut rx, deadline).await;
        match best {
            Some(AttemptResult {
                upstream,
                result: Ok(response),
                start,
            }) => {
                trace!(
                    addr = %upstream.addr(),
                    rcode = %response.header().rcode(),
                    "upstream won"
                );
                if let Some(tap) = &self.tap {
                    tap.tap(upstream.addr(), query, &response, start);
                }
                Ok(response)
            }
            Some(AttemptResult {
                upstream,
                result: Err(err),
                ..
            }) => {
                debug!(
                    addr = %upstream.addr(), %err, expired,
                    "no upstream gave a response"
                );
                Err(Error::NoHealthy)
            }
            None if expired => Err(Error::ContextDone),
            None => Err(Error::NoHealthy),
        }
    }

    /// Resolves a query and produces the message for the client.
    ///
    /// A response that doesn't match the query is replaced with a FORMERR
    /// response. If resolving fails, a SERVFAIL response is returned. A
    /// query without a question gets a FORMERR response.
    ///
    /// Returns [`Error::NotMatched`] if the query is not handled by this
    /// fan-out.
    pub async fn serve(
        &self,
        query: &Message<Bytes>,
    ) -> Result<Message<Bytes>, Error> {
        let Some(question) = query.first_question() else {
            return error_reply(query, Rcode::FORMERR);
        };
        if !self.matches(question.qname()) {
            return Err(Error::NotMatched);
        }

        match self.resolve(query).await {
            Ok(response) if is_answer(&response, query) => Ok(response),
            Ok(response) => {
                debug!(
                    id = response.header().id(),
                    "response does not match query"
                );
                error_reply(query, Rcode::FORMERR)
            }
            Err(err) => {
                warn!(qname = %question.qname(), %err, "query failed");
                error_reply(query, Rcode::SERVFAIL)
            }
        }
    }
}

impl Default for Fanout {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Fanout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fanout")
            .field("config", &self.config)
            .field("upstreams", &self.upstreams)
            .field("tls", &self.tls.is_some())
            .field("tap", &self.tap.is_some())
            .finish()
    }
}

//------------ AttemptResult --------------------------------------------------

/// What one upstream produced for a query.
struct AttemptResult {
    /// The upstream.
    upstream: Arc<Upstream>,

    /// The response, or the errors of all attempts.
    result: Result<Message<Bytes>, Error>,

    /// When the attempt task started.
    start: Instant,
}

/// Tries a query against one upstream until it succeeds or gives up.
///
/// Exits without reporting if the query has been decided or the deadline
/// has passed before a try. A cached connection closed by the upstream is
/// not counted as a failure, the send is repeated right away.
async fn attempt(
    upstream: Arc<Upstream>,
    query: Message<Bytes>,
    max_fail_count: u32,
    deadline: Instant,
    tx: mpsc::Sender<AttemptResult>,
) {
    let start = Instant::now();
    let mut errors = Vec::new();
    let mut n = 0;
    loop {
        if tx.is_closed() || Instant::now() >= deadline {
            return;
        }
        match upstream.send(&query).await {
            Ok(response) => {
                let result = Ok(response);
                _ = tx.send(AttemptResult { upstream, result, start }).await;
                return;
            }
            Err(err) if err.is_cached_closed() => {
                // The stale connection is gone, the next send dials anew.
                trace!(addr = %upstream.addr(), "cached connection closed");
                continue;
            }
            Err(err) => {
                debug!(
                    addr = %upstream.addr(), attempt = n + 1, %err,
                    "upstream attempt failed"
                );
                errors.push(err);
            }
        }
        if n == max_fail_count || upstream.health_check().await.is_err() {
            break;
        }
        n += 1;
    }
    let result = Err(Error::Exhausted(errors.into()));
    _ = tx.send(AttemptResult { upstream, result, start }).await;
}

/// Runs the health check of an upstream every `period`.
///
/// Ends once the upstream is dropped.
async fn check_periodically(upstream: Weak<Upstream>, period: Duration) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(upstream) = upstream.upgrade() else {
            return;
        };
        // Failures are logged and counted by the upstream.
        _ = upstream.health_check().await;
    }
}

/// Collects attempt results until there is a winner.
///
/// Returns the best result and whether the deadline expired.
async fn collect(
    rx: &mut mpsc::Receiver<AttemptResult>,
    deadline: Instant,
) -> (Option<AttemptResult>, bool) {
    let mut best: Option<AttemptResult> = None;
    let expire = sleep_until(deadline);
    tokio::pin!(expire);
    loop {
        tokio::select! {
            res = rx.recv() => {
                let Some(res) = res else {
                    return (best, false);
                };
                if matches!(&res.result, Ok(msg) if is_success(msg)) {
                    return (Some(res), false);
                }
                if is_better(best.as_ref().map(|b| &b.result), &res.result) {
                    best = Some(res);
                }
            }
            _ = &mut expire => {
                debug!("query deadline expired");
                return (best, true);
            }
        }
    }
}

//------------ Utility --------------------------------------------------------

/// Returns whether a response has the NOERROR response code.
fn is_success(msg: &Message<Bytes>) -> bool {
    msg.header().rcode() == Rcode::NOERROR
}

/// Returns whether `candidate` should replace the best result `current`.
///
/// Any response beats any error. Among responses, the first one received is
/// kept, as is the first error among errors.
fn is_better(
    current: Option<&Result<Message<Bytes>, Error>>,
    candidate: &Result<Message<Bytes>, Error>,
) -> bool {
    match (current, candidate) {
        (None, _) => true,
        (Some(Err(_)), Ok(_)) => true,
        (Some(Ok(current)), Ok(candidate)) => {
            !is_success(current) && is_success(candidate)
        }
        _ => false,
    }
}

/// Checks whether `reply` is an answer to `query`.
///
/// The reply needs to have the QR bit set, the id of the query, and exactly
/// one question with the query's name and type.
pub fn is_answer<QueryOcts: Octets, ReplyOcts: Octets>(
    reply: &Message<ReplyOcts>,
    query: &Message<QueryOcts>,
) -> bool {
    let reply_header = reply.header();
    if !reply_header.qr() || reply_header.id() != query.header().id() {
        return false;
    }
    if reply.header_counts().qdcount() != 1 {
        return false;
    }
    match (reply.first_question(), query.first_question()) {
        (Some(reply_q), Some(query_q)) => {
            reply_q.qtype() == query_q.qtype()
                && reply_q.qname().name_eq(query_q.qname())
        }
        _ => false,
    }
}

/// Creates a response to `query` with the given response code.
fn error_reply(
    query: &Message<Bytes>,
    rcode: Rcode,
) -> Result<Message<Bytes>, Error> {
    let reply = MessageBuilder::new_bytes()
        .start_answer(query, rcode)
        .map_err(|_| Error::MessageBuilderPushError)?;
    Ok(reply.into_message())
}

//============ Tests =========================================================
