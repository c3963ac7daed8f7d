//! uTP Connection State Machine
//!
//! A [`Connection`] is one reliable, ordered byte stream multiplexed on a
//! shared socket. The socket feeds it decoded packets through
//! [`Connection::deliver`]; outgoing packets are queued to the socket's
//! writer task. All state sits behind one lock that is never held across an
//! `.await`; blocked readers, writers and dialers wait on a [`Notify`] and
//! re-check their condition on every wake-up.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

use crate::config::UtpConfig;
use crate::error::{Result, UtpError};
use crate::packet::{seq_less, Header, PacketType, SelectiveAck, SelectiveAckBuilder};
use crate::state::{ConnectionState, ConnectionStats, InboundSlot, SendRecord};
use crate::time::{backoff, wait_or_deadline, Clock, Deadline};
use crate::transport::RawDatagram;

/// Channel for queuing encoded packets to the socket's writer task
pub type PacketSender = mpsc::UnboundedSender<RawDatagram>;

/// Callback unregistering a connection from its socket; runs once
pub type Detach = Box<dyn FnOnce() + Send>;

/// Mutable state of a connection
struct ConnectionInner {
    /// Remote peer address
    remote_addr: SocketAddr,

    /// Connection ID we receive on
    recv_id: u16,

    /// Connection ID we send on
    send_id: u16,

    /// Next sequence number to send
    seq_nr: u16,

    /// Last sequence number received in order
    ack_nr: u16,

    /// Highest of our sequence numbers acknowledged cumulatively
    last_ack: u16,

    /// Peer's advertised receive window
    peer_window: u32,

    /// Our last measurement of the peer's one-way delay
    last_time_diff: u32,

    state: ConnectionState,

    /// Terminal error reported after destruction
    error: Option<UtpError>,

    /// Unacknowledged sends; index 0 is `last_ack + 1`
    unacked: VecDeque<SendRecord>,

    /// Reassembly buffer; index 0 is `ack_nr + 1`
    inbound: VecDeque<InboundSlot>,

    /// Sequence number of the peer's FIN, once seen
    fin_seq: Option<u16>,

    /// All data up to the peer's FIN has been delivered
    fin_received: bool,

    /// In-order bytes not yet read by the application
    read_buf: VecDeque<u8>,

    read_deadline: Deadline,
    write_deadline: Deadline,

    clock: Clock,
    stats: ConnectionStats,
    config: Arc<UtpConfig>,
    packet_tx: PacketSender,
    detach: Option<Detach>,

    /// Back-reference for retransmission timers
    this: Weak<Connection>,
}

/// A single uTP connection
pub struct Connection {
    inner: Mutex<ConnectionInner>,
    event: Notify,
    remote_addr: SocketAddr,
    recv_id: u16,
    send_id: u16,
}

impl Connection {
    /// Create a connection for an outgoing dial.
    ///
    /// The SYN goes out on `recv_id`; everything after it on `recv_id + 1`.
    pub fn outgoing(
        remote_addr: SocketAddr,
        recv_id: u16,
        packet_tx: PacketSender,
        config: Arc<UtpConfig>,
        detach: Option<Detach>,
    ) -> Arc<Self> {
        let send_id = recv_id.wrapping_add(1);
        Arc::new_cyclic(|this| Self {
            inner: Mutex::new(ConnectionInner::new(
                remote_addr,
                recv_id,
                send_id,
                ConnectionState::SynSent,
                packet_tx,
                config,
                detach,
                this.clone(),
            )),
            event: Notify::new(),
            remote_addr,
            recv_id,
            send_id,
        })
    }

    /// Create an accepted connection from a peer's SYN.
    ///
    /// The SYN carried the peer's receive id, which becomes our send id.
    pub fn incoming(
        remote_addr: SocketAddr,
        syn_conn_id: u16,
        peer_seq_nr: u16,
        peer_window: u32,
        packet_tx: PacketSender,
        config: Arc<UtpConfig>,
        detach: Option<Detach>,
    ) -> Arc<Self> {
        let send_id = syn_conn_id;
        let recv_id = syn_conn_id.wrapping_add(1);
        Arc::new_cyclic(|this| {
            let mut inner = ConnectionInner::new(
                remote_addr,
                recv_id,
                send_id,
                ConnectionState::Connected,
                packet_tx,
                config,
                detach,
                this.clone(),
            );
            inner.seq_nr = rand::rng().random();
            inner.last_ack = inner.seq_nr.wrapping_sub(1);
            inner.ack_nr = peer_seq_nr;
            inner.peer_window = peer_window;
            Self {
                inner: Mutex::new(inner),
                event: Notify::new(),
                remote_addr,
                recv_id,
                send_id,
            }
        })
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn recv_id(&self) -> u16 {
        self.recv_id
    }

    pub fn send_id(&self) -> u16 {
        self.send_id
    }

    /// Get connection state
    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// Get statistics
    pub fn stats(&self) -> ConnectionStats {
        self.inner.lock().stats.clone()
    }

    /// Bytes ready to be read without blocking
    pub fn available_data(&self) -> usize {
        self.inner.lock().read_buf.len()
    }

    /// Send the SYN and wait for the peer's STATE reply
    pub async fn connect(&self, timeout: Option<Duration>) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            if inner.state != ConnectionState::SynSent || !inner.unacked.is_empty() {
                return Err(UtpError::ClosedPipe);
            }
            inner.seq_nr = 1;
            let recv_id = inner.recv_id;
            inner.write_packet(PacketType::Syn, recv_id, &[], 1);
            inner.seq_nr = 2;
            tracing::trace!("sent SYN to {} on id {}", inner.remote_addr, recv_id);
        }

        let handshake = async {
            loop {
                let notified = self.event.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                {
                    let inner = self.inner.lock();
                    match inner.state {
                        ConnectionState::SynSent => {}
                        ConnectionState::Connected => return Ok(()),
                        _ => return Err(inner.terminal_error(UtpError::ClosedPipe)),
                    }
                }
                notified.await;
            }
        };

        match timeout {
            Some(limit) => match tokio::time::timeout(limit, handshake).await {
                Ok(result) => result,
                Err(_) => {
                    self.abort(UtpError::DialTimeout(limit));
                    Err(UtpError::DialTimeout(limit))
                }
            },
            None => handshake.await,
        }
    }

    /// Send a STATE packet, used to (re-)acknowledge a SYN
    pub fn send_state(&self) {
        self.inner.lock().send_state();
    }

    /// Process one packet routed to this connection by the socket
    pub fn deliver(&self, header: &Header, payload: &[u8]) {
        self.inner.lock().deliver(header, payload);
        self.event.notify_waiters();
    }

    /// Read available bytes, waiting for data if none are buffered.
    ///
    /// Returns `Ok(0)` at end of stream.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            let notified = self.event.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let deadline = {
                let mut inner = self.inner.lock();
                if inner.read_deadline.exceeded() {
                    return Err(UtpError::Timeout);
                }
                if !inner.read_buf.is_empty() {
                    return Ok(inner.read_into(buf));
                }
                if inner.fin_received || inner.state.read_finished() {
                    return match &inner.error {
                        Some(e) => Err(e.duplicate()),
                        None => Ok(0),
                    };
                }
                inner.read_deadline.instant()
            };

            wait_or_deadline(notified, deadline).await;
        }
    }

    /// Write bytes, blocking while the peer's window is full.
    ///
    /// Returns the number of bytes accepted. If an error interrupts after
    /// some bytes were accepted, the partial count is returned and the error
    /// surfaces on the next call.
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        let mut written = 0;
        while written < buf.len() {
            match self.write_chunk(&buf[written..]).await {
                Ok(n) => written += n,
                Err(e) if written > 0 => {
                    tracing::debug!("write to {} interrupted: {}", self.remote_addr, e);
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(written)
    }

    /// Send one packet's worth of `buf`
    async fn write_chunk(&self, buf: &[u8]) -> Result<usize> {
        loop {
            let notified = self.event.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let deadline = {
                let mut inner = self.inner.lock();
                if !inner.state.can_send_data() {
                    return Err(inner.terminal_error(UtpError::ClosedPipe));
                }
                if inner.write_deadline.exceeded() {
                    return Err(UtpError::Timeout);
                }
                if inner.send_window_open() {
                    let (seq_nr, send_id) = (inner.seq_nr, inner.send_id);
                    let n = inner.write_packet(PacketType::Data, send_id, buf, seq_nr);
                    inner.seq_nr = seq_nr.wrapping_add(1);
                    inner.stats.record_written(n);
                    return Ok(n);
                }
                inner.write_deadline.instant()
            };

            wait_or_deadline(notified, deadline).await;
        }
    }

    /// Start an orderly close: send FIN and tear down once it is acked
    pub fn close(&self) {
        self.inner.lock().finish();
        self.event.notify_waiters();
    }

    /// Destroy immediately with `reason`
    pub fn abort(&self, reason: UtpError) {
        self.inner.lock().destroy(Some(reason));
        self.event.notify_waiters();
    }

    /// Wait until the connection is destroyed
    pub async fn closed(&self) {
        loop {
            let notified = self.event.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.lock().state.is_closed() {
                return;
            }
            notified.await;
        }
    }

    pub fn set_read_deadline(&self, at: Option<Instant>) {
        self.inner.lock().read_deadline.set(at);
        self.event.notify_waiters();
    }

    pub fn set_write_deadline(&self, at: Option<Instant>) {
        self.inner.lock().write_deadline.set(at);
        self.event.notify_waiters();
    }

    /// Retransmission timer callback for the segment `seq_nr`
    fn on_resend_timer(&self, seq_nr: u16, epoch: u64) {
        let mut inner = self.inner.lock();
        let ack_timeout = inner.config.ack_timeout_duration();
        let expired = match inner.send_record(seq_nr) {
            Some(rec) if !rec.acked && rec.timer.is_current(epoch) => {
                rec.first_sent.elapsed() >= ack_timeout
            }
            _ => return,
        };

        if expired {
            tracing::debug!(
                "segment {} to {} unacked after {:?}",
                seq_nr,
                inner.remote_addr,
                ack_timeout
            );
            inner.destroy(Some(UtpError::AckTimeout));
            drop(inner);
            self.event.notify_waiters();
            return;
        }

        inner.resend(seq_nr);
        inner.stats.resends += 1;
        if let Some(idx) = inner.record_index(seq_nr) {
            let this = inner.this.clone();
            let config = inner.config.clone();
            let rec = &mut inner.unacked[idx];
            rec.resends += 1;
            arm_resend_timer(rec, &this, &config);
        }
    }

    #[cfg(test)]
    fn with_inner<R>(&self, f: impl FnOnce(&mut ConnectionInner) -> R) -> R {
        f(&mut self.inner.lock())
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("remote_addr", &self.remote_addr)
            .field("recv_id", &self.recv_id)
            .field("send_id", &self.send_id)
            .finish()
    }
}

/// Arm (or re-arm) the retransmission timer of `rec`
fn arm_resend_timer(rec: &mut SendRecord, this: &Weak<Connection>, config: &UtpConfig) {
    // Never sleep past the ack timeout.
    let remaining = config
        .ack_timeout_duration()
        .saturating_sub(rec.first_sent.elapsed());
    let delay = backoff(
        config.resend_delay(),
        config.resend_jitter(),
        config.max_resend_delay(),
        rec.resends,
    )
    .min(remaining);
    let this = this.clone();
    let seq_nr = rec.seq_nr;
    rec.timer.arm(delay, move |epoch| {
        if let Some(conn) = this.upgrade() {
            conn.on_resend_timer(seq_nr, epoch);
        }
    });
}

impl ConnectionInner {
    #[allow(clippy::too_many_arguments)]
    fn new(
        remote_addr: SocketAddr,
        recv_id: u16,
        send_id: u16,
        state: ConnectionState,
        packet_tx: PacketSender,
        config: Arc<UtpConfig>,
        detach: Option<Detach>,
        this: Weak<Connection>,
    ) -> Self {
        Self {
            remote_addr,
            recv_id,
            send_id,
            seq_nr: 1,
            ack_nr: 0,
            last_ack: 0,
            peer_window: 0,
            last_time_diff: 0,
            state,
            error: None,
            unacked: VecDeque::new(),
            inbound: VecDeque::new(),
            fin_seq: None,
            fin_received: false,
            read_buf: VecDeque::new(),
            read_deadline: Deadline::default(),
            write_deadline: Deadline::default(),
            clock: Clock::new(),
            stats: ConnectionStats::new(),
            config,
            packet_tx,
            detach,
            this,
        }
    }

    fn terminal_error(&self, fallback: UtpError) -> UtpError {
        match &self.error {
            Some(e) => e.duplicate(),
            None => fallback,
        }
    }

    /// Receive window we advertise
    fn wnd_size(&self) -> u32 {
        if self.inbound.len() > self.config.reorder_window / 2 {
            return 0;
        }
        let buffered: usize = self.inbound.iter().map(|s| s.data.len()).sum::<usize>()
            + self.read_buf.len();
        (self.config.recv_window as usize).saturating_sub(buffered) as u32
    }

    /// Unacknowledged payload bytes in flight
    fn cur_window(&self) -> usize {
        self.unacked.iter().map(SendRecord::window_bytes).sum()
    }

    /// Whether another segment may be sent. With a zero peer window a
    /// single segment may still go out once everything is acked.
    fn send_window_open(&self) -> bool {
        self.cur_window() <= self.peer_window as usize
            && self.unacked.len() < self.config.max_unacked_sends
    }

    fn record_index(&self, seq_nr: u16) -> Option<usize> {
        if !seq_less(self.last_ack, seq_nr) {
            return None;
        }
        let idx = seq_nr.wrapping_sub(self.last_ack).wrapping_sub(1) as usize;
        (idx < self.unacked.len()).then_some(idx)
    }

    fn send_record(&mut self, seq_nr: u16) -> Option<&mut SendRecord> {
        let idx = self.record_index(seq_nr)?;
        self.unacked.get_mut(idx)
    }

    /// Build a header with current ack state and put it on the wire
    fn send(&mut self, packet_type: PacketType, conn_id: u16, payload: &[u8], seq_nr: u16) {
        let header = Header::new(packet_type, conn_id, seq_nr, self.ack_nr)
            .with_timestamps(self.clock.timestamp_us(), self.last_time_diff)
            .with_window(self.wnd_size());

        // Slot 0 is always missing; bit i covers slot i + 1.
        let mut sack = SelectiveAckBuilder::default();
        for (i, slot) in self.inbound.iter().enumerate().skip(1) {
            if slot.seen {
                sack.set_acked(i - 1);
            }
        }
        let header = header.with_extension(sack.into_extension());

        let mut datagram = Vec::with_capacity(header.encoded_len() + payload.len());
        header.encode_into(&mut datagram);
        datagram.extend_from_slice(payload);

        self.stats.record_sent();
        if self.config.packet_drop_chance > 0.0
            && rand::rng().random::<f64>() < self.config.packet_drop_chance
        {
            tracing::trace!("dropping {} seq {} (artificial loss)", packet_type, seq_nr);
            return;
        }

        tracing::trace!(
            "send {} to {}: id={} seq={} ack={} len={}",
            packet_type,
            self.remote_addr,
            conn_id,
            seq_nr,
            self.ack_nr,
            payload.len()
        );
        if self.packet_tx.send((datagram, self.remote_addr)).is_err() {
            tracing::trace!("socket writer gone, {} to {} lost", packet_type, self.remote_addr);
        }
    }

    /// Send a packet and, unless it is a STATE, track it for retransmission.
    /// Returns the number of payload bytes taken.
    fn write_packet(
        &mut self,
        packet_type: PacketType,
        conn_id: u16,
        payload: &[u8],
        seq_nr: u16,
    ) -> usize {
        let payload = &payload[..payload.len().min(self.config.max_payload_size)];
        self.send(packet_type, conn_id, payload, seq_nr);

        if packet_type != PacketType::State {
            let mut rec = SendRecord::new(packet_type, conn_id, seq_nr, payload.to_vec());
            arm_resend_timer(&mut rec, &self.this, &self.config);
            self.unacked.push_back(rec);
        }
        payload.len()
    }

    fn send_state(&mut self) {
        if self.state == ConnectionState::Destroyed {
            return;
        }
        let (send_id, seq_nr) = (self.send_id, self.seq_nr);
        self.write_packet(PacketType::State, send_id, &[], seq_nr);
    }

    /// Retransmit a tracked segment with a fresh header
    fn resend(&mut self, seq_nr: u16) {
        let Some(rec) = self.send_record(seq_nr) else {
            return;
        };
        if rec.acked {
            return;
        }
        let (packet_type, conn_id, payload) =
            (rec.packet_type, rec.connection_id, rec.payload.clone());
        self.send(packet_type, conn_id, &payload, seq_nr);
    }

    /// Acknowledge one of our sends, trimming the acked prefix
    fn ack(&mut self, nr: u16) {
        let Some(idx) = self.record_index(nr) else {
            return;
        };
        self.unacked[idx].ack();
        while self.unacked.front().is_some_and(|rec| rec.acked) {
            self.unacked.pop_front();
            self.last_ack = self.last_ack.wrapping_add(1);
        }
    }

    /// Acknowledge every send up to and including `nr`
    fn ack_to(&mut self, nr: u16) {
        if !seq_less(nr, self.seq_nr) {
            return;
        }
        while seq_less(self.last_ack, nr) && !self.unacked.is_empty() {
            let next = self.last_ack.wrapping_add(1);
            self.ack(next);
        }
    }

    /// The peer reported `seq_nr` missing while acking something after it
    fn ack_skipped(&mut self, seq_nr: u16) {
        let thresholds = self.config.fast_resend_thresholds.clone();
        let this = self.this.clone();
        let config = self.config.clone();
        let Some(rec) = self.send_record(seq_nr) else {
            return;
        };
        if rec.acked {
            return;
        }
        rec.acks_skipped += 1;
        if !thresholds.contains(&rec.acks_skipped) {
            return;
        }
        arm_resend_timer(rec, &this, &config);
        tracing::debug!("fast resend of {} after {} skipped acks", seq_nr, rec.acks_skipped);
        self.stats.fast_resends += 1;
        self.resend(seq_nr);
    }

    fn process_selective_ack(&mut self, ack_nr: u16, sack: SelectiveAck<'_>) {
        let Some(highest) = sack.highest_acked() else {
            return;
        };
        self.ack_skipped(ack_nr.wrapping_add(1));
        for i in 0..sack.num_bits() {
            let nr = ack_nr.wrapping_add(2).wrapping_add(i as u16);
            if sack.is_acked(i) {
                self.ack(nr);
            } else if i < highest {
                self.ack_skipped(nr);
            }
        }
    }

    fn deliver(&mut self, header: &Header, payload: &[u8]) {
        if self.state == ConnectionState::Destroyed {
            return;
        }
        tracing::trace!(
            "recv {} from {}: seq={} ack={} len={}",
            header.packet_type,
            self.remote_addr,
            header.seq_nr,
            header.ack_nr,
            payload.len()
        );
        self.stats.record_received();

        // Only a STATE may ack our SYN; it stays armed until one arrives.
        if self.state == ConnectionState::SynSent && !header.is_state() && !header.is_reset() {
            return;
        }

        self.peer_window = header.wnd_size;
        self.ack_to(header.ack_nr);
        if let Some(sack) = header.selective_ack() {
            self.process_selective_ack(header.ack_nr, sack);
        }
        self.last_time_diff = if header.timestamp_us == 0 {
            0
        } else {
            self.clock.timestamp_us().wrapping_sub(header.timestamp_us)
        };

        if header.is_reset() {
            self.destroy(Some(UtpError::PeerReset));
            return;
        }

        if self.state == ConnectionState::SynSent {
            // Only the STATE acknowledging our SYN completes the handshake.
            if header.is_state() && self.unacked.is_empty() {
                self.state = ConnectionState::Connected;
                self.ack_nr = header.seq_nr.wrapping_sub(1);
                tracing::debug!("connected to {} (id {})", self.remote_addr, self.recv_id);
            }
            return;
        }

        if header.is_state() {
            self.maybe_finish();
            return;
        }

        if !seq_less(self.ack_nr, header.seq_nr) {
            // Already delivered: the peer may have missed our ack.
            self.stats.duplicates += 1;
            self.send_state();
            return;
        }

        if self.fin_seq.is_some_and(|fin| seq_less(fin, header.seq_nr)) {
            self.stats.out_of_window += 1;
            tracing::debug!(
                "packet from {} past its FIN ({})",
                self.remote_addr,
                header.seq_nr
            );
            return;
        }

        let index = header.seq_nr.wrapping_sub(self.ack_nr).wrapping_sub(1) as usize;
        if self.inbound.get(index).is_some_and(|slot| slot.seen) {
            self.stats.duplicates += 1;
            return;
        }
        if index >= self.config.reorder_window {
            self.stats.out_of_window += 1;
            tracing::debug!(
                "packet from {} {} ahead of next seq_nr ({} > {})",
                self.remote_addr,
                index,
                header.seq_nr,
                self.ack_nr.wrapping_add(1)
            );
            return;
        }

        while self.inbound.len() <= index {
            self.inbound.push_back(InboundSlot::default());
        }
        self.inbound[index] = InboundSlot {
            seen: true,
            data: payload.to_vec(),
        };
        if header.is_fin() {
            self.fin_seq = Some(header.seq_nr);
            self.inbound.truncate(index + 1);
        }

        while self.inbound.front().is_some_and(|slot| slot.seen) {
            if let Some(slot) = self.inbound.pop_front() {
                self.ack_nr = self.ack_nr.wrapping_add(1);
                self.stats.record_delivered(slot.data.len());
                self.read_buf.extend(slot.data);
            }
        }

        if let Some(fin) = self.fin_seq {
            if !self.fin_received && !seq_less(self.ack_nr, fin) {
                self.fin_received = true;
                self.inbound.clear();
                if self.state == ConnectionState::Connected {
                    self.state = ConnectionState::GotFin;
                }
                tracing::debug!("got FIN from {}", self.remote_addr);
            }
        }

        self.send_state();
        self.maybe_finish();
    }

    /// Tear down once a closing connection has nothing left in flight
    fn maybe_finish(&mut self) {
        if self.state.is_finishing() && self.unacked.is_empty() {
            self.destroy(None);
        }
    }

    /// Send FIN if connected; abandon a dial in progress
    fn finish(&mut self) {
        match self.state {
            ConnectionState::Connected => {
                let (send_id, fin_seq) = (self.send_id, self.seq_nr);
                self.write_packet(PacketType::Fin, send_id, &[], fin_seq);
                self.seq_nr = fin_seq.wrapping_add(1);
                self.state = ConnectionState::SentFin;
                tracing::debug!("sent FIN to {} (seq {})", self.remote_addr, fin_seq);
            }
            ConnectionState::SynSent => self.destroy(Some(UtpError::ClosedPipe)),
            _ => {}
        }
    }

    fn destroy(&mut self, reason: Option<UtpError>) {
        if self.state == ConnectionState::Destroyed {
            return;
        }
        match &reason {
            Some(e) => tracing::debug!("destroying connection to {}: {}", self.remote_addr, e),
            None => tracing::debug!("connection to {} finished", self.remote_addr),
        }
        self.state = ConnectionState::Destroyed;
        self.error = reason;
        // Dropping the records disarms their timers.
        self.unacked.clear();
        self.inbound.clear();
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }

    /// Copy buffered bytes out, announcing a reopened window to the peer
    fn read_into(&mut self, buf: &mut [u8]) -> usize {
        let was_closed = self.wnd_size() == 0;
        let n = buf.len().min(self.read_buf.len());
        for (dst, src) in buf.iter_mut().zip(self.read_buf.drain(..n)) {
            *dst = src;
        }
        if was_closed && n > 0 && self.wnd_size() > 0 {
            self.send_state();
        }
        n
    }
}
