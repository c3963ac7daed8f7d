//! uTP Socket
//!
//! This module manages a single datagram transport shared by many uTP
//! connections. Incoming packets are demultiplexed to the connection keyed
//! by (remote address, connection id); unknown SYNs queue in a backlog until
//! accepted, and anything that is not uTP goes to the passthrough queue.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::config::{BacklogPolicy, UtpConfig};
use crate::conn::{Connection, Detach, PacketSender};
use crate::error::{Result, UtpError};
use crate::packet::{Header, PacketType, SelectiveAckBuilder, MAX_HEADER_SIZE, MAX_RECV_SIZE};
use crate::stream::UtpStream;
use crate::transport::{DatagramTransport, PassthroughConn, RawDatagram};

/// Key for identifying a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ConnectionKey {
    remote_addr: SocketAddr,
    conn_id: u16,
}

/// A SYN waiting to be accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SynRequest {
    remote_addr: SocketAddr,

    /// The dialer's receive id, carried in the SYN
    conn_id: u16,

    seq_nr: u16,

    wnd_size: u32,
}

/// Socket-wide counters
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SocketStats {
    /// Datagrams handed to the passthrough queue
    pub passthrough_datagrams: u64,

    /// Passthrough datagrams dropped because the queue was full
    pub passthrough_dropped: u64,

    /// RESET packets sent
    pub resets_sent: u64,

    /// SYNs turned away because the backlog was full
    pub backlog_rejections: u64,
}

struct SocketState {
    connections: HashMap<ConnectionKey, Arc<Connection>>,
    backlog: VecDeque<SynRequest>,
    closed: bool,
    stats: SocketStats,
}

/// State shared by the socket handle, its tasks and its connections
struct Shared {
    state: Mutex<SocketState>,

    /// Signalled when the backlog grows or the socket closes
    event: Notify,

    transport: Arc<dyn DatagramTransport>,
    local_addr: SocketAddr,
    config: Arc<UtpConfig>,

    /// Outbound packets, drained by the writer task
    packet_tx: PacketSender,

    /// Dropped on close so that passthrough readers see the end
    passthrough_tx: Mutex<Option<mpsc::Sender<RawDatagram>>>,
    passthrough_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<RawDatagram>>>,
}

/// A uTP endpoint: accepts and dials connections over one transport
pub struct UtpSocket {
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl UtpSocket {
    /// Bind a UDP socket with the default configuration
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        Self::bind_with_config(addr, UtpConfig::default()).await
    }

    /// Bind a UDP socket with a custom configuration
    pub async fn bind_with_config(addr: SocketAddr, config: UtpConfig) -> Result<Self> {
        config.validate()?;
        let udp = UdpSocket::bind(addr).await?;
        Self::with_transport(Arc::new(udp), config)
    }

    /// Run uTP over an existing transport.
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_transport(transport: Arc<dyn DatagramTransport>, config: UtpConfig) -> Result<Self> {
        config.validate()?;
        let local_addr = transport.local_addr()?;

        let (packet_tx, packet_rx) = mpsc::unbounded_channel();
        let (passthrough_tx, passthrough_rx) = mpsc::channel(config.passthrough_queue);

        let shared = Arc::new(Shared {
            state: Mutex::new(SocketState {
                connections: HashMap::new(),
                backlog: VecDeque::new(),
                closed: false,
                stats: SocketStats::default(),
            }),
            event: Notify::new(),
            transport: transport.clone(),
            local_addr,
            config: Arc::new(config),
            packet_tx,
            passthrough_tx: Mutex::new(Some(passthrough_tx)),
            passthrough_rx: Arc::new(tokio::sync::Mutex::new(passthrough_rx)),
        });

        let recv_task = tokio::spawn(run_reader(shared.clone()));
        let send_task = tokio::spawn(run_writer(transport, packet_rx));

        tracing::debug!("uTP socket bound to {}", local_addr);

        Ok(Self {
            shared,
            tasks: Mutex::new(vec![recv_task, send_task]),
        })
    }

    /// Get local address
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    /// Get the socket configuration
    pub fn config(&self) -> &UtpConfig {
        &self.shared.config
    }

    /// Number of registered connections
    pub fn num_connections(&self) -> usize {
        self.shared.state.lock().connections.len()
    }

    /// Number of SYNs waiting to be accepted
    pub fn backlog_len(&self) -> usize {
        self.shared.state.lock().backlog.len()
    }

    /// Get socket counters
    pub fn stats(&self) -> SocketStats {
        self.shared.state.lock().stats.clone()
    }

    /// Wait for the next incoming connection
    pub async fn accept(&self) -> Result<UtpStream> {
        loop {
            let notified = self.shared.event.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next = {
                let mut state = self.shared.state.lock();
                if state.closed {
                    return Err(UtpError::SocketClosed);
                }
                match state.backlog.pop_front() {
                    Some(syn) => Some(self.shared.register_incoming(&mut state, syn)),
                    None => None,
                }
            };

            match next {
                Some(Accepted::New(conn)) => {
                    conn.send_state();
                    tracing::debug!(
                        "accepted connection from {} (id {})",
                        conn.remote_addr(),
                        conn.recv_id()
                    );
                    return Ok(UtpStream::new(conn, self.shared.local_addr));
                }
                Some(Accepted::Resent(conn)) => {
                    // The peer missed our STATE; the connection was already handed out.
                    conn.send_state();
                }
                None => notified.await,
            }
        }
    }

    /// Connect to a remote uTP endpoint
    pub async fn dial(&self, addr: SocketAddr) -> Result<UtpStream> {
        self.dial_inner(addr, None).await
    }

    /// Connect, giving up after `timeout`
    pub async fn dial_timeout(&self, addr: SocketAddr, timeout: Duration) -> Result<UtpStream> {
        self.dial_inner(addr, Some(timeout)).await
    }

    async fn dial_inner(&self, addr: SocketAddr, timeout: Option<Duration>) -> Result<UtpStream> {
        let conn = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(UtpError::SocketClosed);
            }
            let recv_id = new_conn_id(|id| {
                state.connections.contains_key(&ConnectionKey {
                    remote_addr: addr,
                    conn_id: id,
                })
            })?;
            let key = ConnectionKey {
                remote_addr: addr,
                conn_id: recv_id,
            };
            let conn = Connection::outgoing(
                addr,
                recv_id,
                self.shared.packet_tx.clone(),
                self.shared.config.clone(),
                Some(self.shared.detach(key)),
            );
            state.connections.insert(key, conn.clone());
            conn
        };

        tracing::debug!("dialing {} (id {})", addr, conn.recv_id());
        conn.connect(timeout).await?;
        Ok(UtpStream::new(conn, self.shared.local_addr))
    }

    /// Packet-oriented access to datagrams that are not uTP
    pub fn passthrough(&self) -> PassthroughConn {
        PassthroughConn::new(
            self.shared.transport.clone(),
            self.shared.passthrough_rx.clone(),
        )
    }

    /// Close the socket.
    ///
    /// Every live connection is destroyed with [`UtpError::PeerReset`],
    /// pending and future `accept` and `dial` calls fail with
    /// [`UtpError::SocketClosed`], and the background tasks stop.
    pub fn close(&self) {
        self.shared.shutdown();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl Drop for UtpSocket {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for UtpSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UtpSocket")
            .field("local_addr", &self.shared.local_addr)
            .field("connections", &self.num_connections())
            .finish()
    }
}

enum Accepted {
    New(Arc<Connection>),
    Resent(Arc<Connection>),
}

impl Shared {
    /// Callback that unregisters `key` when its connection is destroyed
    fn detach(self: &Arc<Self>, key: ConnectionKey) -> Detach {
        let shared: Weak<Self> = Arc::downgrade(self);
        Box::new(move || {
            if let Some(shared) = shared.upgrade() {
                shared.state.lock().connections.remove(&key);
            }
        })
    }

    /// Create and register the connection for an accepted SYN, or find the
    /// one a resent SYN belongs to
    fn register_incoming(self: &Arc<Self>, state: &mut SocketState, syn: SynRequest) -> Accepted {
        let key = ConnectionKey {
            remote_addr: syn.remote_addr,
            conn_id: syn.conn_id.wrapping_add(1),
        };
        if let Some(existing) = state.connections.get(&key) {
            return Accepted::Resent(existing.clone());
        }
        let conn = Connection::incoming(
            syn.remote_addr,
            syn.conn_id,
            syn.seq_nr,
            syn.wnd_size,
            self.packet_tx.clone(),
            self.config.clone(),
            Some(self.detach(key)),
        );
        state.connections.insert(key, conn.clone());
        Accepted::New(conn)
    }

    /// Route one received datagram
    fn dispatch(&self, data: &[u8], from: SocketAddr) {
        let (header, offset) = match Header::decode(data) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::trace!("passing through datagram from {}: {}", from, e);
                self.pass_through(data, from);
                return;
            }
        };
        let payload = &data[offset..];

        let key = ConnectionKey {
            remote_addr: from,
            conn_id: if header.is_syn() {
                header.connection_id.wrapping_add(1)
            } else {
                header.connection_id
            },
        };
        let conn = self.state.lock().connections.get(&key).cloned();

        if let Some(conn) = conn {
            if header.is_syn() && header.connection_id != conn.send_id() {
                tracing::debug!(
                    "conflicting SYN from {} (id {}), resetting",
                    from,
                    header.connection_id
                );
                self.send_reset(from, header.seq_nr, header.connection_id);
                return;
            }
            conn.deliver(&header, payload);
            return;
        }

        match header.packet_type {
            PacketType::Syn => self.push_backlog(SynRequest {
                remote_addr: from,
                conn_id: header.connection_id,
                seq_nr: header.seq_nr,
                wnd_size: header.wnd_size,
            }),
            other => {
                tracing::trace!(
                    "unexpected {} from {} for unknown id {}",
                    other,
                    from,
                    header.connection_id
                );
                self.pass_through(data, from);
            }
        }
    }

    fn push_backlog(&self, syn: SynRequest) {
        let capacity = self.config.backlog;
        let rejected = {
            let mut state = self.state.lock();
            if state.closed || state.backlog.contains(&syn) {
                return;
            }
            if state.backlog.len() < capacity {
                state.backlog.push_back(syn);
                None
            } else {
                state.stats.backlog_rejections += 1;
                match self.config.backlog_policy {
                    BacklogPolicy::EvictOldest => {
                        let oldest = state.backlog.pop_front();
                        state.backlog.push_back(syn);
                        oldest
                    }
                    BacklogPolicy::RejectNew => Some(syn),
                }
            }
        };
        self.event.notify_waiters();

        if let Some(victim) = rejected {
            tracing::debug!(
                "{}: resetting SYN from {} (id {})",
                UtpError::BacklogFull { capacity },
                victim.remote_addr,
                victim.conn_id
            );
            self.send_reset(victim.remote_addr, victim.seq_nr, victim.conn_id);
        }
    }

    fn send_reset(&self, addr: SocketAddr, ack_nr: u16, conn_id: u16) {
        let reset = Header::reset(conn_id, ack_nr)
            .with_extension(SelectiveAckBuilder::default().into_extension());
        self.state.lock().stats.resets_sent += 1;
        if self.packet_tx.send((reset.encode(), addr)).is_err() {
            tracing::trace!("socket writer gone, RESET to {} lost", addr);
        }
    }

    fn pass_through(&self, data: &[u8], from: SocketAddr) {
        let tx = self.passthrough_tx.lock().clone();
        let Some(tx) = tx else {
            return;
        };
        let delivered = tx.try_send((data.to_vec(), from)).is_ok();
        let mut state = self.state.lock();
        if delivered {
            state.stats.passthrough_datagrams += 1;
        } else {
            state.stats.passthrough_dropped += 1;
        }
    }

    /// Mark closed and tear down every connection
    fn shutdown(&self) {
        let conns: Vec<Arc<Connection>> = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.backlog.clear();
            state.connections.values().cloned().collect()
        };
        self.passthrough_tx.lock().take();

        for conn in conns {
            conn.abort(UtpError::PeerReset);
        }
        self.event.notify_waiters();
        tracing::debug!("uTP socket {} closed", self.local_addr);
    }
}

/// Receive loop; also the single dispatcher
async fn run_reader(shared: Arc<Shared>) {
    let mut buf = vec![0u8; MAX_RECV_SIZE.max(shared.config.max_payload_size + MAX_HEADER_SIZE)];

    loop {
        match shared.transport.recv_from(&mut buf).await {
            Ok((len, from)) => shared.dispatch(&buf[..len], from),
            Err(e) => match e.kind() {
                // ICMP errors from earlier sends surface here on some platforms
                std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::Interrupted => {
                    tracing::trace!("transient receive error on {}: {}", shared.local_addr, e);
                }
                _ => {
                    tracing::error!("uTP receive error on {}: {}", shared.local_addr, e);
                    shared.shutdown();
                    break;
                }
            },
        }
    }
}

/// Drain queued packets to the transport
async fn run_writer(
    transport: Arc<dyn DatagramTransport>,
    mut packet_rx: mpsc::UnboundedReceiver<RawDatagram>,
) {
    while let Some((data, addr)) = packet_rx.recv().await {
        if let Err(e) = transport.send_to(&data, addr).await {
            tracing::warn!("Failed to send uTP packet to {}: {}", addr, e);
        }
    }
}

/// Random draws tried before falling back to a full scan of the id space
const RANDOM_ID_ATTEMPTS: usize = 16;

/// Pick a random receive id such that it and both neighbours are free.
///
/// A few random draws settle the common, sparsely populated case. Failing
/// those, ids are drawn without replacement so exhaustion is detected after
/// at most one pass over the id space.
fn new_conn_id(taken: impl Fn(u16) -> bool) -> Result<u16> {
    let is_free = |id: u16| {
        !taken(id) && !taken(id.wrapping_add(1)) && !taken(id.wrapping_sub(1))
    };
    let mut rng = rand::rng();

    for _ in 0..RANDOM_ID_ATTEMPTS {
        let id: u16 = rng.random();
        if is_free(id) {
            return Ok(id);
        }
    }

    let mut ids: Vec<u16> = (0..=u16::MAX).collect();
    for i in 0..ids.len() {
        let j = rng.random_range(i..ids.len());
        ids.swap(i, j);
        if is_free(ids[i]) {
            return Ok(ids[i]);
        }
    }
    Err(UtpError::NoRoomForConnection)
}
