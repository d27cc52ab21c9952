//! Outbound exchanges with authoritative servers.
//!
//! One call of [`Exchanger::exchange`] performs one logical attempt against
//! one target: a UDP query with a randomized message id and source port,
//! escalated to TCP on truncation, retried once without EDNS on FORMERR.
//! Replies that do not match the outstanding query are counted as unwanted
//! and never surfaced. Retrying against other targets is the iterator's
//! business, not ours.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Edns, Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::Name;
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, trace, warn};

use crate::config::RuntimeConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::module::{ModuleEnv, OutboundRequest};

/// Number of tries each target gets before it is considered spent.
pub const OUTBOUND_MSG_RETRY: u32 = 4;

/// Performs outbound exchanges for a worker.
pub struct Exchanger {
    cfg: Arc<RuntimeConfig>,
    env: Arc<ModuleEnv>,
}

impl Exchanger {
    pub fn new(cfg: Arc<RuntimeConfig>, env: Arc<ModuleEnv>) -> Self {
        Self { cfg, env }
    }

    /// One attempt against the request's target.
    pub async fn exchange(&self, request: &OutboundRequest) -> Result<Message> {
        let qname = if self.cfg.cfg.use_caps_for_id {
            randomize_case(&request.qinfo.qname)
        } else {
            request.qinfo.qname.clone()
        };
        let id: u16 = rand::rng().random();
        let mut query = build_query(id, &qname, request, self.cfg.cfg.edns_buffer_size);
        let timeout = Duration::from_millis(u64::from(request.timeout_ms));

        if self.cfg.cfg.do_udp {
            match self.udp_exchange(&query, &qname, request, timeout).await {
                Ok(message) if message.header().truncated() && self.cfg.cfg.do_tcp => {
                    trace!(target = %request.target, "truncated; retrying over tcp");
                }
                Ok(message) if message.response_code() == ResponseCode::FormErr
                    && query.extensions().is_some() =>
                {
                    // the server chokes on EDNS; ask again without it
                    debug!(target = %request.target, "formerr with edns; retrying without");
                    self.env.infra.record_edns(
                        &request.zone,
                        request.target.ip(),
                        false,
                        now_secs(),
                    );
                    *query.extensions_mut() = None;
                    return self.udp_exchange(&query, &qname, request, timeout).await;
                }
                Ok(message) => {
                    self.env.infra.record_edns(
                        &request.zone,
                        request.target.ip(),
                        message.extensions().is_some(),
                        now_secs(),
                    );
                    return Ok(message);
                }
                Err(e) if self.cfg.cfg.do_tcp && !matches!(*e.kind, ErrorKind::Timeout) => {
                    trace!(target = %request.target, "udp failed ({e}); trying tcp");
                }
                Err(e) => return Err(e),
            }
        } else if !self.cfg.cfg.do_tcp {
            return Err(ErrorKind::Message("both udp and tcp are disabled").into());
        }

        self.tcp_exchange(&query, &qname, request, timeout).await
    }

    async fn udp_exchange(
        &self,
        query: &Message,
        qname: &Name,
        request: &OutboundRequest,
        timeout: Duration,
    ) -> Result<Message> {
        let socket = self.bind_udp(request.target.ip()).await?;
        socket.connect(request.target).await?;
        socket.send(&query.to_vec()?).await?;

        let mut buf = vec![0u8; 65_535];
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let received = tokio::time::timeout_at(deadline, socket.recv(&mut buf)).await;
            let len = match received {
                Ok(Ok(len)) => len,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    self.linger(socket);
                    return Err(ErrorKind::Timeout.into());
                }
            };
            let message = match Message::from_vec(&buf[..len]) {
                Ok(message) => message,
                Err(e) => {
                    trace!("undecodable datagram: {e}");
                    continue;
                }
            };
            if self.matches(query, qname, &message) {
                return Ok(message);
            }
            self.count_unwanted();
        }
    }

    async fn tcp_exchange(
        &self,
        query: &Message,
        qname: &Name,
        request: &OutboundRequest,
        timeout: Duration,
    ) -> Result<Message> {
        let exchange = async {
            let mut stream = TcpStream::connect(request.target).await?;
            let wire = query.to_vec()?;
            stream.write_all(&(wire.len() as u16).to_be_bytes()).await?;
            stream.write_all(&wire).await?;
            stream.flush().await?;

            let mut len_buf = [0u8; 2];
            stream.read_exact(&mut len_buf).await?;
            let len = usize::from(u16::from_be_bytes(len_buf));
            let mut buf = vec![0u8; len];
            stream.read_exact(&mut buf).await?;
            Ok::<Message, Error>(Message::from_vec(&buf)?)
        };
        let message = tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| Error::from(ErrorKind::Timeout))??;
        if !self.matches(query, qname, &message) {
            self.count_unwanted();
            return Err(ErrorKind::Message("mismatched tcp reply").into());
        }
        Ok(message)
    }

    /// Bind an outgoing UDP socket on a randomized source port.
    async fn bind_udp(&self, remote: IpAddr) -> Result<UdpSocket> {
        let local_ip = self
            .cfg
            .cfg
            .outgoing_interface
            .iter()
            .find(|ip| ip.is_ipv4() == remote.is_ipv4())
            .copied()
            .unwrap_or(match remote {
                IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            });

        let mut last_err: Option<std::io::Error> = None;
        for _ in 0..10 {
            let port = self.pick_port();
            match UdpSocket::bind(SocketAddr::new(local_ip, port)).await {
                Ok(socket) => return Ok(socket),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err
            .map(Error::from)
            .unwrap_or_else(|| ErrorKind::Message("no usable source port").into()))
    }

    fn pick_port(&self) -> u16 {
        let ranges = &self.cfg.outgoing_ports;
        let total: u32 = ranges
            .iter()
            .map(|(lo, hi)| u32::from(*hi) - u32::from(*lo) + 1)
            .sum();
        let mut pick = rand::rng().random_range(0..total);
        for (lo, hi) in ranges {
            let span = u32::from(*hi) - u32::from(*lo) + 1;
            if pick < span {
                return lo + pick as u16;
            }
            pick -= span;
        }
        ranges[0].0
    }

    /// A reply matches when the id and the echoed question agree, including
    /// the exact name spelling when 0x20 randomization is on.
    fn matches(&self, query: &Message, qname: &Name, message: &Message) -> bool {
        if message.id() != query.id() {
            return false;
        }
        let Some(question) = message.queries().first() else {
            return false;
        };
        let Some(sent) = query.queries().first() else {
            return false;
        };
        if question.query_type() != sent.query_type()
            || question.query_class() != sent.query_class()
            || question.name() != sent.name()
        {
            return false;
        }
        if self.cfg.cfg.use_caps_for_id
            && question.name().to_ascii() != qname.to_ascii()
        {
            debug!(name = %question.name(), "reply failed the 0x20 case check");
            return false;
        }
        true
    }

    fn count_unwanted(&self) {
        let count = self.env.unwanted_replies.fetch_add(1, Ordering::Relaxed) + 1;
        let threshold = self.cfg.cfg.unwanted_reply_threshold;
        if threshold > 0 && count >= threshold {
            warn!("unwanted replies reached {count}; flushing caches");
            self.env.unwanted_replies.store(0, Ordering::Relaxed);
            self.env.flush_caches();
        }
    }

    /// Keep a timed-out socket open briefly so late replies die here
    /// instead of reaching whoever binds the port next.
    fn linger(&self, socket: UdpSocket) {
        let delay = self.cfg.cfg.delay_close;
        if delay == 0 {
            return;
        }
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let deadline = tokio::time::Instant::now() + Duration::from_millis(delay);
            while tokio::time::timeout_at(deadline, socket.recv(&mut buf))
                .await
                .map(|r| r.is_ok())
                .unwrap_or(false)
            {}
        });
    }
}

fn build_query(id: u16, qname: &Name, request: &OutboundRequest, edns_size: u16) -> Message {
    let mut message = Message::new();
    message
        .set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(request.recursion_desired);
    let mut query = Query::query(qname.clone(), request.qinfo.qtype);
    query.set_query_class(request.qinfo.qclass);
    message.add_query(query);

    let mut edns = Edns::new();
    edns.set_max_payload(edns_size);
    edns.set_version(0);
    edns.set_dnssec_ok(request.dnssec);
    *message.extensions_mut() = Some(edns);
    message
}

/// Randomize the letter case of a name for 0x20 id strengthening.
fn randomize_case(name: &Name) -> Name {
    let mut rng = rand::rng();
    let ascii = name.to_ascii();
    let mixed: String = ascii
        .chars()
        .map(|c| {
            if c.is_ascii_alphabetic() && rng.random_bool(0.5) {
                if c.is_ascii_lowercase() {
                    c.to_ascii_uppercase()
                } else {
                    c.to_ascii_lowercase()
                }
            } else {
                c
            }
        })
        .collect();
    Name::from_ascii(&mixed).unwrap_or_else(|_| name.clone())
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
