//! Observing resolved queries.

use std::net::SocketAddr;

use bytes::Bytes;
use domain::base::Message;
use tokio::time::Instant;
use tracing::info;

//------------ Tap ------------------------------------------------------------

/// A hook that is told about every successfully resolved query.
///
/// The hook is called synchronously by the resolving task, so
/// implementations should hand off expensive work.
pub trait Tap: Send + Sync {
    /// Records that `upstream` answered `query` with `response`.
    ///
    /// `start` is the time the attempt against `upstream` started.
    fn tap(
        &self,
        upstream: SocketAddr,
        query: &Message<Bytes>,
        response: &Message<Bytes>,
        start: Instant,
    );
}

impl<F> Tap for F
where
    F: Fn(SocketAddr, &Message<Bytes>, &Message<Bytes>, Instant)
        + Send
        + Sync,
{
    fn tap(
        &self,
        upstream: SocketAddr,
        query: &Message<Bytes>,
        response: &Message<Bytes>,
        start: Instant,
    ) {
        (self)(upstream, query, response, start)
    }
}

//------------ LogTap ---------------------------------------------------------

/// A tap that emits one `tracing` event per resolved query.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogTap;

impl Tap for LogTap {
    fn tap(
        &self,
        upstream: SocketAddr,
        query: &Message<Bytes>,
        response: &Message<Bytes>,
        start: Instant,
    ) {
        let Some(question) = query.first_question() else {
            return;
        };
        info!(
            %upstream,
            qname = %question.qname(),
            qtype = %question.qtype(),
            rcode = %response.header().rcode(),
            elapsed = ?start.elapsed(),
            "resolved"
        );
    }
}
