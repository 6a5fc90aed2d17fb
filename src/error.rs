//! Error type for fan-out resolution.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use std::error;
use std::fmt::{Display, Formatter};
use std::io;
use std::sync::Arc;

//------------ Error ---------------------------------------------------------

/// Error type for the connection pool, upstream clients and the fan-out.
#[derive(Clone, Debug)]
pub enum Error {
    /// Creating a new connection to the upstream failed.
    Dial(Arc<io::Error>),

    /// Creating a new connection took longer than the dial timeout.
    DialTimeout,

    /// The TLS server name is not a valid DNS name.
    InvalidServerName,

    /// A cached connection was closed by the peer.
    ///
    /// This is only reported for connections taken from the pool, a
    /// freshly dialed connection reports the underlying I/O error.
    CachedClosed,

    /// Writing a request gave an error.
    Write(Arc<io::Error>),

    /// Writing a request took too long.
    WriteTimeout,

    /// Reading a response gave an error.
    Read(Arc<io::Error>),

    /// Reading a response took too long.
    ReadTimeout,

    /// The request does not fit into a single DNS message.
    MessageTooLong,

    /// Octet sequence too short to be a valid DNS message.
    ShortMessage,

    /// PushError from MessageBuilder.
    MessageBuilderPushError,

    /// The owner task of the connection pool is not running.
    PoolStopped,

    /// All attempts against a single upstream failed.
    ///
    /// Holds the error of every attempt, oldest first.
    Exhausted(Arc<[Error]>),

    /// No upstream provided a usable response.
    NoHealthy,

    /// The query deadline expired before any upstream reported.
    ContextDone,

    /// No upstreams are configured.
    NoUpstreams,

    /// The query is not for a domain handled by the fan-out.
    NotMatched,
}

impl Error {
    /// Returns whether this error means that a pooled connection was stale.
    pub fn is_cached_closed(&self) -> bool {
        matches!(self, Error::CachedClosed)
    }

    /// Returns whether the error ends the resolution of the whole query.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Error::NoHealthy | Error::ContextDone | Error::NoUpstreams
        )
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        match self {
            Error::Dial(err) => write!(f, "error dialing upstream: {err}"),
            Error::DialTimeout => write!(f, "timeout dialing upstream"),
            Error::InvalidServerName => write!(f, "invalid TLS server name"),
            Error::CachedClosed => {
                write!(f, "cached connection was closed by peer")
            }
            Error::Write(err) => write!(f, "error writing request: {err}"),
            Error::WriteTimeout => write!(f, "timeout writing request"),
            Error::Read(err) => write!(f, "error reading response: {err}"),
            Error::ReadTimeout => write!(f, "timeout reading response"),
            Error::MessageTooLong => write!(f, "request message too long"),
            Error::ShortMessage => {
                write!(f, "octet sequence too short to be a valid message")
            }
            Error::MessageBuilderPushError => {
                write!(f, "PushError from MessageBuilder")
            }
            Error::PoolStopped => write!(f, "connection pool stopped"),
            Error::Exhausted(errors) => match errors.last() {
                Some(last) => write!(
                    f,
                    "upstream failed {} attempts, last error: {last}",
                    errors.len()
                ),
                None => write!(f, "upstream failed"),
            },
            Error::NoHealthy => write!(f, "no healthy clients"),
            Error::ContextDone => write!(f, "context is done"),
            Error::NoUpstreams => write!(f, "no forwarder defined"),
            Error::NotMatched => write!(f, "query not handled by fanout"),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Dial(e) => Some(e),
            Error::Write(e) => Some(e),
            Error::Read(e) => Some(e),
            Error::Exhausted(errors) => errors
                .last()
                .map(|err| err as &(dyn error::Error + 'static)),
            Error::DialTimeout
            | Error::InvalidServerName
            | Error::CachedClosed
            | Error::WriteTimeout
            | Error::ReadTimeout
            | Error::MessageTooLong
            | Error::ShortMessage
            | Error::MessageBuilderPushError
            | Error::PoolStopped
            | Error::NoHealthy
            | Error::ContextDone
            | Error::NoUpstreams
            | Error::NotMatched => None,
        }
    }
}

//============ Tests =========================================================
