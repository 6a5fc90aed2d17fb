//! Fan-out forwarding of DNS queries.
//!
//! This crate forwards a DNS query to a set of upstream resolvers at the
//! same time and picks the best answer. It is meant to be used by a DNS
//! server that already parsed the query and will write the reply; it only
//! deals with talking to the upstreams.
//!
//! The crate consists of these parts, from the bottom up:
//!
//! * [pool] keeps idle connections to one upstream per transport protocol
//!   and creates new ones with an adaptive dial timeout,
//! * [health] probes whether an upstream is alive,
//! * [upstream] combines the two into a client for one upstream, and
//! * [fanout] races a query against all upstreams and decides on the
//!   answer.
//!
//! In addition, [conf] turns configuration tokens into upstream addresses
//! and [tap] defines a hook for observing resolved queries.
//!
//! # Example
//!
//! ```no_run
//! use domain::base::{MessageBuilder, Name, Rtype};
//! use domain_fanout::conf::parse_upstreams;
//! use domain_fanout::fanout::Fanout;
//! use domain_fanout::protocol::Protocol;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let mut fanout = Fanout::new();
//! for upstream in parse_upstreams(["192.0.2.1", "192.0.2.2"], Protocol::Udp)? {
//!     fanout.add(upstream.addr, upstream.protocol);
//! }
//!
//! let mut query = MessageBuilder::new_bytes();
//! query.header_mut().set_random_id();
//! query.header_mut().set_rd(true);
//! let mut query = query.question();
//! query.push((Name::vec_from_str("example.com")?, Rtype::A))?;
//! let query = query.into_message();
//!
//! let reply = fanout.serve(&query).await?;
//! println!("{}", reply.header().rcode());
//! fanout.stop();
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod conf;
pub mod config;
pub mod conn;
pub mod error;
pub mod fanout;
pub mod health;
pub mod pool;
pub mod protocol;
pub mod tap;
pub mod upstream;

pub use self::config::Config;
pub use self::error::Error;
pub use self::fanout::Fanout;
pub use self::protocol::Protocol;
pub use self::upstream::Upstream;
