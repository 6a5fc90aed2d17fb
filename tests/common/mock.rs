//! Scripted upstream resolvers.
//!
//! A mock upstream listens on a local port and hands every message it
//! receives to a handler closure that decides what to do about it.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use domain::base::iana::Rcode;
use domain::base::{Message, MessageBuilder, Name, Rtype};
use domain::rdata::A;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::sleep;

//------------ Action --------------------------------------------------------

/// What a mock upstream does with a received message.
pub enum Action {
    /// Send these messages in order.
    Reply(Vec<Message<Bytes>>),

    /// Send these messages, then close the connection.
    ///
    /// Over UDP this is the same as `Reply`.
    ReplyClose(Vec<Message<Bytes>>),

    /// Wait, then send these messages.
    Delay(Duration, Vec<Message<Bytes>>),

    /// Close the connection without answering.
    ///
    /// Over UDP this is the same as `Ignore`.
    Close,

    /// Don't answer but keep the connection.
    Ignore,
}

impl Action {
    /// Answers with a single message.
    pub fn reply(msg: Message<Bytes>) -> Self {
        Action::Reply(vec![msg])
    }
}

/// The handler deciding about received messages.
type Handler = Arc<dyn Fn(&Message<Bytes>) -> Action + Send + Sync>;

//------------ MockUpstream --------------------------------------------------

/// A local upstream answering according to a handler.
pub struct MockUpstream {
    /// The address the upstream listens on.
    addr: SocketAddr,

    /// Counters shared with the serving tasks.
    counters: Arc<Counters>,
}

#[derive(Default)]
struct Counters {
    /// Received messages that aren't health check probes.
    queries: AtomicUsize,

    /// Received health check probes.
    probes: AtomicUsize,

    /// Accepted TCP connections.
    connections: AtomicUsize,
}

impl MockUpstream {
    /// Starts a mock upstream on a local TCP port.
    pub async fn tcp(
        handler: impl Fn(&Message<Bytes>) -> Action + Send + Sync + 'static,
    ) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let counters = Arc::new(Counters::default());
        let handler: Handler = Arc::new(handler);
        let task_counters = counters.clone();
        tokio::spawn(async move {
            while let Ok((sock, _)) = listener.accept().await {
                task_counters.connections.fetch_add(1, Ordering::Relaxed);
                tokio::spawn(serve_tcp(
                    sock,
                    handler.clone(),
                    task_counters.clone(),
                ));
            }
        });
        Self { addr, counters }
    }

    /// Starts a mock upstream on a local UDP port.
    pub async fn udp(
        handler: impl Fn(&Message<Bytes>) -> Action + Send + Sync + 'static,
    ) -> Self {
        let sock = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let addr = sock.local_addr().unwrap();
        let counters = Arc::new(Counters::default());
        let handler: Handler = Arc::new(handler);
        let task_counters = counters.clone();
        tokio::spawn(async move {
            let mut buf = vec![0; 65535];
            while let Ok((len, peer)) = sock.recv_from(&mut buf).await {
                let Some(msg) = parse(&buf[..len], &task_counters) else {
                    continue;
                };
                let sock = sock.clone();
                let handler = handler.clone();
                tokio::spawn(async move {
                    let replies = match handler(&msg) {
                        Action::Reply(replies)
                        | Action::ReplyClose(replies) => replies,
                        Action::Delay(delay, replies) => {
                            sleep(delay).await;
                            replies
                        }
                        Action::Close | Action::Ignore => return,
                    };
                    for reply in replies {
                        _ = sock.send_to(reply.as_slice(), peer).await;
                    }
                });
            }
        });
        Self { addr, counters }
    }

    /// Returns the address of the upstream.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Returns the number of queries received, not counting probes.
    pub fn queries(&self) -> usize {
        self.counters.queries.load(Ordering::Relaxed)
    }

    /// Returns the number of health check probes received.
    pub fn probes(&self) -> usize {
        self.counters.probes.load(Ordering::Relaxed)
    }

    /// Returns the number of accepted TCP connections.
    pub fn connections(&self) -> usize {
        self.counters.connections.load(Ordering::Relaxed)
    }
}

/// Serves a single TCP connection.
async fn serve_tcp(
    mut sock: TcpStream,
    handler: Handler,
    counters: Arc<Counters>,
) {
    loop {
        let Ok(len) = sock.read_u16().await else {
            return;
        };
        let mut buf = vec![0; usize::from(len)];
        if sock.read_exact(&mut buf).await.is_err() {
            return;
        }
        let Some(msg) = parse(&buf, &counters) else {
            return;
        };
        let (replies, close) = match handler(&msg) {
            Action::Reply(replies) => (replies, false),
            Action::ReplyClose(replies) => (replies, true),
            Action::Delay(delay, replies) => {
                sleep(delay).await;
                (replies, false)
            }
            Action::Close => return,
            Action::Ignore => continue,
        };
        for reply in replies {
            let reply = reply.as_slice();
            let mut frame = Vec::with_capacity(reply.len() + 2);
            frame.extend_from_slice(&(reply.len() as u16).to_be_bytes());
            frame.extend_from_slice(reply);
            if sock.write_all(&frame).await.is_err() {
                return;
            }
        }
        if close {
            return;
        }
    }
}

/// Parses a received message and counts it.
fn parse(octets: &[u8], counters: &Counters) -> Option<Message<Bytes>> {
    let msg = Message::from_octets(Bytes::copy_from_slice(octets)).ok()?;
    if is_probe(&msg) {
        counters.probes.fetch_add(1, Ordering::Relaxed);
    } else {
        counters.queries.fetch_add(1, Ordering::Relaxed);
    }
    Some(msg)
}

//------------ Messages ------------------------------------------------------

/// Returns whether a message is a health check probe.
pub fn is_probe(msg: &Message<Bytes>) -> bool {
    msg.first_question().map_or(false, |question| {
        question.qname().is_root() && question.qtype() == Rtype::NS
    })
}

/// Creates a query.
pub fn query(qname: &str, qtype: Rtype) -> Message<Bytes> {
    let mut msg = MessageBuilder::new_bytes();
    msg.header_mut().set_random_id();
    msg.header_mut().set_rd(true);
    let mut msg = msg.question();
    msg.push((Name::vec_from_str(qname).unwrap(), qtype))
        .unwrap();
    msg.into_message()
}

/// Creates an empty answer to `query`.
pub fn answer(query: &Message<Bytes>, rcode: Rcode) -> Message<Bytes> {
    MessageBuilder::new_bytes()
        .start_answer(query, rcode)
        .unwrap()
        .into_message()
}

/// Creates an answer to `query` with a single A record.
pub fn answer_a(query: &Message<Bytes>, addr: Ipv4Addr) -> Message<Bytes> {
    let question = query.first_question().unwrap();
    let mut msg = MessageBuilder::new_bytes()
        .start_answer(query, Rcode::NOERROR)
        .unwrap();
    msg.push((question.qname(), 3600, A::new(addr))).unwrap();
    msg.into_message()
}

/// Creates an answer to `query` carrying a different id.
pub fn answer_wrong_id(
    query: &Message<Bytes>,
    rcode: Rcode,
) -> Message<Bytes> {
    let mut msg = MessageBuilder::new_bytes()
        .start_answer(query, rcode)
        .unwrap();
    msg.header_mut().set_id(query.header().id().wrapping_add(1));
    msg.into_message()
}
