//! The client-facing front end.
//!
//! Each worker thread runs its own event loop over its own sockets, bound
//! with `SO_REUSEPORT` so the kernel spreads clients across workers. The
//! loop feeds the dispatch engine: client datagrams and TCP requests go in,
//! outbound exchanges run as futures, and finished responses are written
//! back out. Per-query state never crosses a worker boundary; only the
//! caches are shared.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use futures_util::future::BoxFuture;
use futures_util::stream::{FuturesUnordered, StreamExt};
use hickory_proto::op::Message;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::module::ModuleEnv;
use crate::outbound::Exchanger;
use crate::worker::{ClientHandle, Worker};

/// Overall deadline for one TCP client request.
const TCP_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Seconds since the epoch; the wall-clock time caches key off.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A client request forwarded to the worker loop by a socket task.
struct InboundRequest {
    wire: Vec<u8>,
    /// Where to send the reply: a UDP source or a TCP response channel
    source: InboundSource,
}

enum InboundSource {
    Udp { addr: SocketAddr, socket: usize },
    Tcp { reply: oneshot::Sender<Vec<u8>> },
}

/// One worker thread's server loop.
pub struct ServerWorker {
    cfg: Arc<RuntimeConfig>,
    env: Arc<ModuleEnv>,
    thread: usize,
}

impl ServerWorker {
    pub fn new(cfg: Arc<RuntimeConfig>, env: Arc<ModuleEnv>, thread: usize) -> Self {
        Self { cfg, env, thread }
    }

    /// Run the event loop forever (or until socket setup fails).
    pub async fn run(self) -> Result<()> {
        let (inbound_tx, mut inbound_rx) = mpsc::channel::<InboundRequest>(1024);

        let mut udp_sockets = Vec::new();
        for ip in &self.cfg.cfg.interface {
            let addr = SocketAddr::new(*ip, self.cfg.cfg.port);
            if self.cfg.cfg.do_udp {
                let socket = Arc::new(self.bind_udp(addr)?);
                udp_sockets.push(Arc::clone(&socket));
                let index = udp_sockets.len() - 1;
                spawn_udp_reader(socket, index, inbound_tx.clone());
            }
            if self.cfg.cfg.do_tcp {
                let listener = self.bind_tcp(addr)?;
                spawn_tcp_acceptor(listener, inbound_tx.clone());
            }
        }
        if udp_sockets.is_empty() && !self.cfg.cfg.do_tcp {
            return Err(Error::from("no listening sockets configured"));
        }
        info!(thread = self.thread, "worker serving");

        let mut worker = Worker::new(Arc::clone(&self.env));
        let exchanger = Arc::new(Exchanger::new(
            Arc::clone(&self.cfg),
            Arc::clone(&self.env),
        ));

        // responses for TCP clients are routed back by query id
        let mut tcp_channels: std::collections::HashMap<u64, oneshot::Sender<Vec<u8>>> =
            std::collections::HashMap::new();
        let mut next_conn: u64 = 1;

        type ExchangeResult = (u64, std::result::Result<Message, Error>, u32);
        let mut exchanges: FuturesUnordered<BoxFuture<'static, ExchangeResult>> =
            FuturesUnordered::new();
        // exchanges beyond the configured outgoing range wait their turn
        let mut backlog: std::collections::VecDeque<BoxFuture<'static, ExchangeResult>> =
            std::collections::VecDeque::new();
        let outgoing_range = usize::from(self.cfg.cfg.outgoing_range.max(1));

        loop {
            tokio::select! {
                inbound = inbound_rx.recv() => {
                    let Some(request) = inbound else { break };
                    let Ok(message) = Message::from_vec(&request.wire) else {
                        continue; // unparseable queries are dropped
                    };
                    let handle = match request.source {
                        InboundSource::Udp { addr, socket } => ClientHandle::Udp { addr, socket },
                        InboundSource::Tcp { reply } => {
                            let conn = next_conn;
                            next_conn += 1;
                            tcp_channels.insert(conn, reply);
                            ClientHandle::Tcp { conn }
                        }
                    };
                    worker.handle_client_query(&message, handle, now_secs(), now_millis());
                }
                exchange = exchanges.next(), if !exchanges.is_empty() => {
                    let Some((qid, result, rtt_ms)) = exchange else { continue };
                    let rtt = result.is_ok().then_some(rtt_ms);
                    worker.handle_outbound_result(qid, result, rtt, now_secs());
                }
            }

            for (qid, request) in worker.take_outbound() {
                let exchanger = Arc::clone(&exchanger);
                let future: BoxFuture<'static, ExchangeResult> = Box::pin(async move {
                    let started = Instant::now();
                    let result = exchanger.exchange(&request).await;
                    let rtt = started.elapsed().as_millis().min(u128::from(u32::MAX)) as u32;
                    (qid, result, rtt)
                });
                if exchanges.len() < outgoing_range {
                    exchanges.push(future);
                } else {
                    backlog.push_back(future);
                }
            }
            while exchanges.len() < outgoing_range {
                match backlog.pop_front() {
                    Some(future) => exchanges.push(future),
                    None => break,
                }
            }

            for response in worker.take_responses() {
                match response.client {
                    ClientHandle::Udp { addr, socket } => {
                        let Ok(wire) = response.message.to_vec() else { continue };
                        if let Some(socket) = udp_sockets.get(socket) {
                            if let Err(e) = socket.send_to(&wire, addr).await {
                                debug!("udp send to {addr} failed: {e}");
                            }
                        }
                    }
                    ClientHandle::Tcp { conn } => {
                        let Ok(wire) = response.message.to_vec() else { continue };
                        if let Some(reply) = tcp_channels.remove(&conn) {
                            let _ = reply.send(wire);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn bind_udp(&self, addr: SocketAddr) -> Result<UdpSocket> {
        let domain = Domain::for_address(addr);
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        self.apply_socket_options(&socket)?;
        socket.bind(&addr.into())?;
        socket.set_nonblocking(true)?;
        Ok(UdpSocket::from_std(socket.into())?)
    }

    fn bind_tcp(&self, addr: SocketAddr) -> Result<TcpListener> {
        let domain = Domain::for_address(addr);
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        self.apply_socket_options(&socket)?;
        socket.bind(&addr.into())?;
        socket.listen(128)?;
        socket.set_nonblocking(true)?;
        Ok(TcpListener::from_std(socket.into())?)
    }

    fn apply_socket_options(&self, socket: &Socket) -> Result<()> {
        let cfg = &self.cfg.cfg;
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        if cfg.so_reuseport {
            socket.set_reuse_port(true)?;
        }
        if cfg.so_rcvbuf > 0 {
            if let Err(e) = socket.set_recv_buffer_size(cfg.so_rcvbuf) {
                warn!("so-rcvbuf {} not applied: {e}", cfg.so_rcvbuf);
            }
        }
        if cfg.so_sndbuf > 0 {
            if let Err(e) = socket.set_send_buffer_size(cfg.so_sndbuf) {
                warn!("so-sndbuf {} not applied: {e}", cfg.so_sndbuf);
            }
        }
        Ok(())
    }
}

fn spawn_udp_reader(socket: Arc<UdpSocket>, index: usize, tx: mpsc::Sender<InboundRequest>) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65_535];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, addr)) => {
                    let request = InboundRequest {
                        wire: buf[..len].to_vec(),
                        source: InboundSource::Udp {
                            addr,
                            socket: index,
                        },
                    };
                    if tx.send(request).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    debug!("udp receive error: {e}");
                }
            }
        }
    });
}

fn spawn_tcp_acceptor(listener: TcpListener, tx: mpsc::Sender<InboundRequest>) {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    tokio::spawn(handle_tcp_client(stream, peer, tx.clone()));
                }
                Err(e) => {
                    debug!("tcp accept error: {e}");
                }
            }
        }
    });
}

/// Serve one TCP client: length-prefixed requests under an overall
/// deadline; the connection is dropped when the deadline expires.
async fn handle_tcp_client(
    mut stream: TcpStream,
    peer: SocketAddr,
    tx: mpsc::Sender<InboundRequest>,
) {
    let serve = async {
        loop {
            let mut len_buf = [0u8; 2];
            if stream.read_exact(&mut len_buf).await.is_err() {
                return;
            }
            let len = usize::from(u16::from_be_bytes(len_buf));
            let mut wire = vec![0u8; len];
            if stream.read_exact(&mut wire).await.is_err() {
                return;
            }

            let (reply_tx, reply_rx) = oneshot::channel();
            let request = InboundRequest {
                wire,
                source: InboundSource::Tcp { reply: reply_tx },
            };
            if tx.send(request).await.is_err() {
                return;
            }
            let Ok(reply) = reply_rx.await else { return };
            if stream
                .write_all(&(reply.len() as u16).to_be_bytes())
                .await
                .is_err()
                || stream.write_all(&reply).await.is_err()
            {
                return;
            }
        }
    };
    if tokio::time::timeout(TCP_REQUEST_TIMEOUT, serve).await.is_err() {
        debug!(%peer, "tcp client deadline expired");
    }
}
