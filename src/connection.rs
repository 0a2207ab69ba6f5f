//! The per-connection protocol state machine.
//!
//! A connection is shared between the dispatcher, which hands it inbound packets through a
//!  bounded inbox, and the application's [crate::stream::UtpStream]. All protocol state lives in
//!  [ConnectionInner] behind a single async mutex; every mutation that can change a predicate
//!  some caller is waiting for is followed by a broadcast on `event`.
//!
//! Inbound packets are processed by one 'delivery processor' task per connection. It handles
//!  packets in batches, and acknowledges a whole batch with a single STATE packet after a short
//!  coalescing delay.
//!
//! Every outstanding packet has its own resend timer: a task that holds a weak reference to the
//!  connection and the packet's sequence number. Timers are cancelled when their packet is acked
//!  or the connection is destroyed.

use crate::buffers::byte_ring::{wait_with_deadline, ByteRing};
use crate::buffers::receive_buffer::ReceiveBuffer;
use crate::buffers::send_buffer::{SendBuffer, SendEntry};
use crate::buffers::timed_buffer::TimedBuffer;
use crate::config::UtpConfig;
use crate::congestion::{LedbatController, RttEstimator};
use crate::error::{UtpError, UtpResult};
use crate::packet::{Extension, Packet, PacketHeader, PacketType};
use crate::safe_converter::PrecheckedCast;
use crate::send_pipeline::SendPipeline;
use crate::seq_nr::SeqNr;
use crate::util::random::{Random, RngRandom};
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use std::cmp::min;
use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use std::pin::pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::select;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, trace, warn};

/// upper bound for the number of packets processed before a STATE is sent
const MAX_BATCH_SIZE: usize = 32;

/// Identifies a connection in its dispatcher: the peer's address and our `recv_id`
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ConnKey {
    pub addr: SocketAddr,
    pub conn_id: u16,
}

/// The dispatcher side of a connection
#[cfg_attr(test, automock)]
pub trait ConnectionRegistry: Send + Sync + 'static {
    fn unregister(&self, key: ConnKey);
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionState {
    Invalid,
    SynSent,
    Connected,
    Destroy,
}

/// the part of the SYN that the responder side of a connection is set up from
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Syn {
    pub addr: SocketAddr,
    pub conn_id: u16,
    pub seq_nr: SeqNr,
    pub window: u32,
}

#[derive(Default)]
struct Deadlines {
    read: Option<Instant>,
    write: Option<Instant>,
}

struct ConnectionInner {
    state: ConnectionState,
    got_fin: bool,
    sent_fin: bool,
    /// the next sequence number to send
    seq_nr: SeqNr,
    send_buffer: SendBuffer,
    recv_buffer: ReceiveBuffer,
    peer_window: u32,
    /// our most recent one-way delay measurement, echoed to the peer
    last_delay_sample: u32,
    base_delay: TimedBuffer,
    rtt: RttEstimator,
    ledbat: LedbatController,
    duplicate_acks: u32,
    pending_state: bool,
    error: Option<UtpError>,
    last_sent: Instant,
    last_advertised_window: u32,
}

pub struct Connection {
    recv_id: u16,
    send_id: u16,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    config: Arc<UtpConfig>,
    send_pipeline: SendPipeline,
    registry: Arc<dyn ConnectionRegistry>,

    inner: Mutex<ConnectionInner>,
    deadlines: std::sync::Mutex<Deadlines>,
    read_ring: ByteRing,
    inbox: mpsc::Sender<Packet>,

    /// broadcast on every state change that may unblock a waiting caller
    event: Notify,
    deadline_changed: Notify,
    /// stops the delivery processor
    shutdown: Notify,
}

impl Display for Connection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}->{} ({}/{})", self.local_addr, self.remote_addr, self.recv_id, self.send_id)
    }
}

/// the local clock in microseconds, modulo 2^32
fn now_micros() -> u32 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_micros() as u32)
        .unwrap_or(0)
}

impl Connection {
    #[allow(clippy::too_many_arguments)]
    fn new(
        config: Arc<UtpConfig>,
        send_pipeline: SendPipeline,
        registry: Arc<dyn ConnectionRegistry>,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        recv_id: u16,
        send_id: u16,
        state: ConnectionState,
        seq_nr: SeqNr,
        ack_nr: SeqNr,
        peer_window: u32,
    ) -> Arc<Connection> {
        let inner = ConnectionInner {
            state,
            got_fin: false,
            sent_fin: false,
            seq_nr,
            send_buffer: SendBuffer::new(seq_nr.prev(), config.max_unacked_outbound + 2),
            recv_buffer: ReceiveBuffer::new(ack_nr, config.max_unacked_inbound),
            peer_window,
            last_delay_sample: 0,
            base_delay: TimedBuffer::new(config.base_delay_retention),
            rtt: RttEstimator::new(config.initial_rto, config.min_rto, config.max_rto),
            ledbat: LedbatController::new(config.mtu, config.target_delay, config.gain),
            duplicate_acks: 0,
            pending_state: false,
            error: None,
            last_sent: Instant::now(),
            last_advertised_window: config.recv_window,
        };

        let (inbox, inbox_receiver) = mpsc::channel(config.inbound_queue_depth);
        let connection = Arc::new(Connection {
            recv_id,
            send_id,
            local_addr,
            remote_addr,
            read_ring: ByteRing::new(config.recv_window as usize),
            config,
            send_pipeline,
            registry,
            inner: Mutex::new(inner),
            deadlines: Default::default(),
            inbox,
            event: Notify::new(),
            deadline_changed: Notify::new(),
            shutdown: Notify::new(),
        });

        tokio::spawn(connection.clone().run_processor(inbox_receiver));
        connection
    }

    /// The dialing side, before the SYN is sent. `recv_id` must already be reserved with the
    ///  dispatcher.
    pub fn new_initiator(
        config: Arc<UtpConfig>,
        send_pipeline: SendPipeline,
        registry: Arc<dyn ConnectionRegistry>,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        recv_id: u16,
    ) -> Arc<Connection> {
        let recv_window = config.recv_window;
        Self::new(
            config,
            send_pipeline,
            registry,
            local_addr,
            remote_addr,
            recv_id,
            recv_id.wrapping_add(1),
            ConnectionState::Invalid,
            SeqNr::from_raw(1),
            SeqNr::default(),
            recv_window,
        )
    }

    /// The accepting side of a connection, which is connected right away
    pub fn new_responder(
        config: Arc<UtpConfig>,
        send_pipeline: SendPipeline,
        registry: Arc<dyn ConnectionRegistry>,
        local_addr: SocketAddr,
        syn: &Syn,
        seq_nr: SeqNr,
    ) -> Arc<Connection> {
        Self::new(
            config,
            send_pipeline,
            registry,
            local_addr,
            syn.addr,
            syn.conn_id.wrapping_add(1),
            syn.conn_id,
            ConnectionState::Connected,
            seq_nr,
            syn.seq_nr,
            syn.window,
        )
    }

    pub fn recv_id(&self) -> u16 {
        self.recv_id
    }

    pub fn send_id(&self) -> u16 {
        self.send_id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn key(&self) -> ConnKey {
        ConnKey {
            addr: self.remote_addr,
            conn_id: self.recv_id,
        }
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state
    }

    /// Hands an inbound packet to the delivery processor. This never blocks: if the inbox is
    ///  full, the packet is dropped and recovered by the peer's retransmission.
    pub fn deliver(&self, packet: Packet) {
        match self.inbox.try_send(packet) {
            Ok(()) => {}
            Err(TrySendError::Full(packet)) => debug!("inbox of {} is full - dropping {:?}", self, packet.header),
            Err(TrySendError::Closed(packet)) => trace!("{} is shut down - dropping {:?}", self, packet.header),
        }
    }

    /// starts the initiator handshake
    pub async fn send_syn(self: &Arc<Self>) {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        if inner.state != ConnectionState::Invalid {
            return;
        }
        debug!("{}: sending SYN", self);
        self.write_packet(inner, PacketType::Syn, Bytes::new()).await;
        inner.state = ConnectionState::SynSent;
    }

    /// sends a STATE right away, acknowledging everything received so far
    pub async fn send_state_now(&self) {
        let mut guard = self.inner.lock().await;
        if guard.state != ConnectionState::Destroy {
            self.send_state(&mut guard).await;
        }
    }

    /// Waits for the handshake to complete, or fails if the connection was destroyed first
    pub async fn wait_connected(&self, deadline: Option<Instant>) -> UtpResult<()> {
        loop {
            let mut notified = pin!(self.event.notified());
            notified.as_mut().enable();
            {
                let inner = self.inner.lock().await;
                match inner.state {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Destroy => return Err(Self::terminal_error(&inner)),
                    _ => {}
                }
            }
            if !wait_with_deadline(notified, deadline).await {
                return Err(UtpError::Timeout);
            }
        }
    }

    fn terminal_error(inner: &ConnectionInner) -> UtpError {
        inner.error.as_ref()
            .map(|e| e.duplicate())
            .unwrap_or(UtpError::Closed)
    }

    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.deadlines().read = deadline;
        self.deadline_changed.notify_waiters();
        self.event.notify_waiters();
    }

    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.deadlines().write = deadline;
        self.deadline_changed.notify_waiters();
        self.event.notify_waiters();
    }

    fn deadlines(&self) -> std::sync::MutexGuard<'_, Deadlines> {
        self.deadlines.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reads at least one byte, waiting for data if necessary. Returns `Ok(0)` at the end of
    ///  the stream.
    pub async fn read(&self, buf: &mut [u8]) -> UtpResult<usize> {
        loop {
            let mut deadline_changed = pin!(self.deadline_changed.notified());
            deadline_changed.as_mut().enable();
            let deadline = self.deadlines().read;

            let result = select! {
                r = self.read_ring.read_timeout(buf, deadline) => Some(r),
                _ = deadline_changed => None,
            };
            let Some(result) = result else {
                continue;
            };

            return match result {
                Ok(0) if buf.is_empty() => Ok(0),
                Ok(0) => {
                    let inner = self.inner.lock().await;
                    if inner.got_fin {
                        Ok(0)
                    }
                    else if let Some(e) = &inner.error {
                        Err(e.duplicate())
                    }
                    else {
                        Ok(0)
                    }
                }
                Ok(n) => {
                    self.on_bytes_consumed().await;
                    Ok(n)
                }
                Err(e) => Err(e),
            };
        }
    }

    /// The application made room in the byte ring: move held-back packets in, and tell the peer
    ///  about the re-opened window
    async fn on_bytes_consumed(&self) {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        if inner.state != ConnectionState::Connected {
            return;
        }

        let drained = self.drain(inner);
        let mss: u32 = self.config.max_payload_size().prechecked_cast();
        let window_reopened = inner.last_advertised_window < mss && self.advertised_window(inner) >= mss;
        if drained || window_reopened {
            trace!("{}: window update after read", self);
            self.send_state(inner).await;
            self.check_finished(inner);
            self.event.notify_waiters();
        }
    }

    /// Writes all of `data`, splitting it into packets of at most the maximum payload size.
    ///  Blocks while the congestion window or the peer's receive window is exhausted.
    pub async fn write(self: &Arc<Self>, data: &[u8]) -> UtpResult<usize> {
        let mut written = 0;
        for chunk in data.chunks(self.config.max_payload_size()) {
            loop {
                let mut notified = pin!(self.event.notified());
                notified.as_mut().enable();

                {
                    let mut guard = self.inner.lock().await;
                    let inner = &mut *guard;
                    if inner.state == ConnectionState::Destroy {
                        return Err(Self::terminal_error(inner));
                    }
                    if inner.sent_fin {
                        return Err(UtpError::Closed);
                    }
                    if inner.state == ConnectionState::Connected && self.may_send(inner) {
                        self.write_packet(inner, PacketType::Data, Bytes::copy_from_slice(chunk)).await;
                        written += chunk.len();
                        break;
                    }
                }

                let deadline = self.deadlines().write;
                if !wait_with_deadline(notified, deadline).await {
                    debug!("{}: write timed out after {} bytes", self, written);
                    return Err(UtpError::Timeout);
                }
            }
        }
        Ok(written)
    }

    fn may_send(&self, inner: &ConnectionInner) -> bool {
        let window = min(inner.ledbat.max_window(), inner.peer_window) as usize;
        let span = (inner.seq_nr - inner.send_buffer.last_ack()) as usize;
        inner.send_buffer.bytes_in_flight() <= window && span <= self.config.max_unacked_outbound
    }

    /// Sends a FIN and waits until the connection is torn down
    pub async fn close(self: &Arc<Self>) -> UtpResult<()> {
        {
            let mut guard = self.inner.lock().await;
            let inner = &mut *guard;
            match inner.state {
                ConnectionState::Connected if !inner.sent_fin => {
                    debug!("{}: closing - sending FIN", self);
                    self.write_packet(inner, PacketType::Fin, Bytes::new()).await;
                    inner.sent_fin = true;
                    self.check_finished(inner);
                    self.event.notify_waiters();
                }
                ConnectionState::Connected | ConnectionState::Destroy => {}
                ConnectionState::Invalid | ConnectionState::SynSent => self.destroy(inner, None),
            }
        }

        loop {
            let mut notified = pin!(self.event.notified());
            notified.as_mut().enable();
            {
                let inner = self.inner.lock().await;
                if inner.state == ConnectionState::Destroy {
                    return match &inner.error {
                        Some(e) if !inner.got_fin => Err(e.duplicate()),
                        _ => Ok(()),
                    };
                }
            }
            let deadline = self.deadlines().write;
            if !wait_with_deadline(notified, deadline).await {
                return Err(UtpError::Timeout);
            }
        }
    }

    /// tears the connection down right away, e.g. after a failed handshake
    pub async fn abort(&self, error: Option<UtpError>) {
        let mut guard = self.inner.lock().await;
        self.destroy(&mut guard, error);
    }

    fn advertised_window(&self, inner: &ConnectionInner) -> u32 {
        if inner.recv_buffer.len() > self.config.max_unacked_inbound / 2 {
            return 0;
        }
        let used = self.read_ring.len() + inner.recv_buffer.buffered_bytes();
        let window = (self.config.recv_window as usize).saturating_sub(used);
        min(window, self.config.recv_window as usize).prechecked_cast()
    }

    async fn send_packet(&self, inner: &mut ConnectionInner, packet_type: PacketType, seq_nr: SeqNr, payload: &[u8]) {
        let mut extensions = Vec::new();
        if packet_type != PacketType::Syn {
            if let Some(mut bitmask) = inner.recv_buffer.selective_ack() {
                let max_len = min(255, (self.config.max_header_size - PacketHeader::FIXED_LEN - 2) / 4 * 4);
                bitmask.truncate(max_len);
                extensions.push(Extension::selective_ack(&bitmask));
            }
        }

        let window = self.advertised_window(inner);
        let header = PacketHeader {
            packet_type,
            connection_id: if packet_type == PacketType::Syn { self.recv_id } else { self.send_id },
            timestamp: now_micros(),
            timestamp_diff: inner.last_delay_sample,
            window,
            seq_nr,
            ack_nr: inner.recv_buffer.ack_nr(),
            extensions,
        };

        // every packet carries the current ack
        inner.pending_state = false;
        inner.last_advertised_window = window;
        inner.last_sent = Instant::now();

        self.send_pipeline.send_packet(self.remote_addr, &header, payload).await;
    }

    async fn send_state(&self, inner: &mut ConnectionInner) {
        let seq_nr = inner.seq_nr;
        self.send_packet(inner, PacketType::State, seq_nr, &[]).await;
    }

    /// sends a packet that occupies a sequence number, keeping it for resending until it is acked
    async fn write_packet(self: &Arc<Self>, inner: &mut ConnectionInner, packet_type: PacketType, payload: Bytes) {
        let seq_nr = inner.seq_nr;
        let entry = SendEntry::new(packet_type, payload.clone(), Instant::now());
        if inner.send_buffer.push(seq_nr, entry).is_err() {
            warn!("{}: packet #{} does not fit into the send buffer - not sending", self, seq_nr);
            return;
        }
        inner.seq_nr = seq_nr.next();

        self.send_packet(inner, packet_type, seq_nr, &payload).await;
        self.arm_resend_timer(inner, seq_nr);
    }

    fn arm_resend_timer(self: &Arc<Self>, inner: &mut ConnectionInner, seq_nr: SeqNr) {
        let rto = inner.rtt.rto();
        let rtt = inner.rtt.rtt();
        let delay = if rtt.is_zero() {
            rto
        }
        else {
            let jitter = RngRandom::gen_f64_range(-1.0..1.0) * rtt.as_secs_f64();
            Duration::from_secs_f64((rto.as_secs_f64() + jitter).max(self.config.min_rto.as_secs_f64()))
        };

        let connection = Arc::downgrade(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(connection) = connection.upgrade() {
                connection.on_resend_timeout(seq_nr).await;
            }
        });

        match inner.send_buffer.get_mut(seq_nr) {
            Some(entry) => entry.set_resend_timer(timer),
            None => timer.abort(),
        }
    }

    async fn resend(self: &Arc<Self>, inner: &mut ConnectionInner, seq_nr: SeqNr) {
        let Some(entry) = inner.send_buffer.get_mut(seq_nr) else {
            return;
        };
        entry.resend_count += 1;
        let packet_type = entry.packet_type;
        let payload = entry.payload.clone();
        trace!("{}: resending #{} (attempt {})", self, seq_nr, entry.resend_count);

        self.send_packet(inner, packet_type, seq_nr, &payload).await;
        self.arm_resend_timer(inner, seq_nr);
    }

    async fn on_resend_timeout(self: Arc<Self>, seq_nr: SeqNr) {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        if inner.state == ConnectionState::Destroy {
            return;
        }
        let Some(entry) = inner.send_buffer.get_mut(seq_nr) else {
            return;
        };
        // this task is the timer, so it must not be aborted when the packet is re-armed
        entry.detach_resend_timer();

        if entry.first_sent.elapsed() >= self.config.send_timeout {
            warn!("{}: packet #{} was not acked within {:?} - giving up", self, seq_nr, self.config.send_timeout);
            self.destroy(inner, Some(UtpError::AckTimeout));
            return;
        }

        if inner.send_buffer.head() == Some(seq_nr) {
            inner.ledbat.on_loss();
            debug!("{}: resend timeout for head #{} - resending all outstanding packets", self, seq_nr);
            for outstanding in inner.send_buffer.outstanding() {
                self.resend(inner, outstanding).await;
            }
        }
        else {
            self.resend(inner, seq_nr).await;
        }
    }

    async fn run_processor(self: Arc<Self>, mut inbox: mpsc::Receiver<Packet>) {
        let mut keepalive = self.config.keepalive_interval.map(|interval| {
            let mut result = tokio::time::interval_at(Instant::now() + interval, interval);
            result.set_missed_tick_behavior(MissedTickBehavior::Delay);
            result
        });

        loop {
            select! {
                _ = self.shutdown.notified() => break,
                packet = inbox.recv() => {
                    let Some(packet) = packet else {
                        break;
                    };
                    if !self.process_batch(packet, &mut inbox).await {
                        break;
                    }
                }
                _ = next_tick(&mut keepalive) => self.on_keepalive().await,
            }
        }
        debug!("{}: delivery processor terminated", self);
    }

    /// Processes packets until the inbox stays empty for the coalescing delay, then sends a
    ///  single STATE for all of them. Returns `false` once the connection is destroyed.
    async fn process_batch(self: &Arc<Self>, first: Packet, inbox: &mut mpsc::Receiver<Packet>) -> bool {
        let mut next = Some(first);
        let mut num_processed = 0;
        while let Some(packet) = next.take() {
            self.process_packet(packet).await;
            num_processed += 1;
            if num_processed >= MAX_BATCH_SIZE {
                break;
            }
            next = match inbox.try_recv() {
                Ok(packet) => Some(packet),
                Err(_) => tokio::time::timeout(self.config.state_coalesce_delay, inbox.recv()).await
                    .ok()
                    .flatten(),
            };
        }

        let mut guard = self.inner.lock().await;
        if guard.state == ConnectionState::Destroy {
            return false;
        }
        if guard.pending_state {
            self.send_state(&mut guard).await;
        }
        true
    }

    async fn on_keepalive(&self) {
        let mut guard = self.inner.lock().await;
        let Some(interval) = self.config.keepalive_interval else {
            return;
        };
        if guard.state == ConnectionState::Connected && guard.last_sent.elapsed() >= interval {
            trace!("{}: keepalive", self);
            self.send_state(&mut guard).await;
        }
    }

    async fn process_packet(self: &Arc<Self>, packet: Packet) {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let h = &packet.header;
        trace!("{}: processing {:?}", self, h);

        if inner.state == ConnectionState::Destroy {
            return;
        }
        if h.packet_type == PacketType::Syn {
            // duplicate SYN: the peer did not see our STATE yet
            inner.pending_state = true;
            return;
        }

        inner.peer_window = h.window;
        let delay = if h.timestamp == 0 {
            0
        }
        else {
            let delay = now_micros().wrapping_sub(h.timestamp);
            inner.base_delay.push(delay);
            inner.last_delay_sample = delay;
            delay
        };

        if h.packet_type == PacketType::Reset {
            debug!("{}: received RESET", self);
            let seq_nr = inner.seq_nr;
            self.send_packet(inner, PacketType::Reset, seq_nr, &[]).await;
            self.destroy(inner, Some(UtpError::Reset));
            return;
        }

        if inner.state == ConnectionState::SynSent {
            if h.packet_type != PacketType::State {
                trace!("{}: ignoring {:?} during handshake", self, h.packet_type);
                return;
            }
            inner.recv_buffer = ReceiveBuffer::new(h.seq_nr.prev(), self.config.max_unacked_inbound);
            inner.state = ConnectionState::Connected;
            debug!("{}: connected", self);
        }

        let prev_last_ack = inner.send_buffer.last_ack();
        let now = Instant::now();
        for latency in inner.send_buffer.ack_to(h.ack_nr, now) {
            inner.rtt.on_sample(latency);
        }
        if let Some(bitmask) = h.selective_ack() {
            let outcome = inner.send_buffer.apply_selective_ack(h.ack_nr, bitmask, &self.config.fast_resend_thresholds, now);
            for latency in outcome.latencies {
                inner.rtt.on_sample(latency);
            }
            for seq_nr in outcome.resend {
                trace!("{}: fast resend of #{} after selective ack", self, seq_nr);
                self.resend(inner, seq_nr).await;
            }
        }
        let advanced = inner.send_buffer.last_ack() != prev_last_ack;

        match h.packet_type {
            PacketType::State => {
                if advanced {
                    // no delay sample without the peer's timestamp
                    if delay != 0 {
                        inner.ledbat.on_ack(delay, inner.base_delay.min());
                    }
                    inner.duplicate_acks = 0;
                }
                else if !inner.send_buffer.is_empty() && h.ack_nr == inner.send_buffer.last_ack() {
                    inner.duplicate_acks += 1;
                    if inner.duplicate_acks == self.config.duplicate_ack_threshold {
                        if let Some(head) = inner.send_buffer.head() {
                            debug!("{}: {} duplicate acks - fast retransmit of #{}", self, inner.duplicate_acks, head);
                            inner.ledbat.on_loss();
                            self.resend(inner, head).await;
                        }
                    }
                }
            }
            PacketType::Data | PacketType::Fin => {
                inner.pending_state = true;
                inner.recv_buffer.insert(h.seq_nr, h.packet_type == PacketType::Fin, packet.payload.clone());
                self.drain(inner);
            }
            PacketType::Reset | PacketType::Syn => {}
        }

        self.check_finished(inner);
        self.event.notify_waiters();
    }

    /// Moves in-order packets into the byte ring. Returns `true` if anything was delivered.
    fn drain(&self, inner: &mut ConnectionInner) -> bool {
        if inner.got_fin {
            return false;
        }
        match inner.recv_buffer.drain(&self.read_ring) {
            Ok(drained) => {
                if drained.fin {
                    debug!("{}: received FIN", self);
                    inner.got_fin = true;
                    self.read_ring.close();
                }
                drained.packets > 0
            }
            Err(_) => false,
        }
    }

    fn check_finished(&self, inner: &mut ConnectionInner) {
        if inner.sent_fin && inner.send_buffer.is_empty() && inner.recv_buffer.is_empty() {
            debug!("{}: FIN was acked", self);
            self.destroy(inner, None);
        }
    }

    fn destroy(&self, inner: &mut ConnectionInner, error: Option<UtpError>) {
        if inner.state == ConnectionState::Destroy {
            return;
        }
        debug!("{}: destroying connection, error: {:?}", self, error);

        inner.state = ConnectionState::Destroy;
        if inner.error.is_none() {
            inner.error = error;
        }
        inner.send_buffer.clear();
        self.read_ring.close();

        self.event.notify_waiters();
        self.shutdown.notify_one();
        self.registry.unregister(self.key());
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::send_pipeline::MockPacketSocket;
    use mockall::predicate::eq;
    use rstest::rstest;

    const PEER: SocketAddr = SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::new(1, 2, 3, 4)), 9);
    const LOCAL: SocketAddr = SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::new(1, 2, 3, 4)), 8);

    type Sent = Arc<std::sync::Mutex<Vec<Packet>>>;

    fn capturing_pipeline(sent: Sent) -> SendPipeline {
        let mut socket = MockPacketSocket::new();
        socket.expect_send_to()
            .returning(move |buf, _| {
                sent.lock().unwrap().push(Packet::deser(Bytes::copy_from_slice(buf)).unwrap());
                Ok(buf.len())
            });
        SendPipeline::new(Arc::new(socket), 0.0)
    }

    fn registry(expected_unregisters: usize, key: ConnKey) -> Arc<MockConnectionRegistry> {
        let mut registry = MockConnectionRegistry::new();
        registry.expect_unregister()
            .with(eq(key))
            .times(expected_unregisters)
            .return_const(());
        Arc::new(registry)
    }

    /// a responder for a SYN with conn_id 100 and seq 1, sending from seq 500
    fn responder(sent: Sent, expected_unregisters: usize) -> Arc<Connection> {
        responder_with(UtpConfig::default(), sent, expected_unregisters)
    }

    fn responder_with(config: UtpConfig, sent: Sent, expected_unregisters: usize) -> Arc<Connection> {
        let syn = Syn {
            addr: PEER,
            conn_id: 100,
            seq_nr: SeqNr::from_raw(1),
            window: 0x8000,
        };
        Connection::new_responder(
            Arc::new(config),
            capturing_pipeline(sent),
            registry(expected_unregisters, ConnKey { addr: PEER, conn_id: 101 }),
            LOCAL,
            &syn,
            SeqNr::from_raw(500),
        )
    }

    fn initiator(sent: Sent, expected_unregisters: usize) -> Arc<Connection> {
        Connection::new_initiator(
            Arc::new(UtpConfig::default()),
            capturing_pipeline(sent),
            registry(expected_unregisters, ConnKey { addr: PEER, conn_id: 300 }),
            LOCAL,
            PEER,
            300,
        )
    }

    fn packet(packet_type: PacketType, connection_id: u16, seq_nr: u16, ack_nr: u16, payload: &'static [u8]) -> Packet {
        Packet {
            header: PacketHeader {
                packet_type,
                connection_id,
                timestamp: 0,
                timestamp_diff: 0,
                window: 0x8000,
                seq_nr: SeqNr::from_raw(seq_nr),
                ack_nr: SeqNr::from_raw(ack_nr),
                extensions: vec![],
            },
            payload: Bytes::from_static(payload),
        }
    }

    fn last_sent(sent: &Sent) -> PacketHeader {
        sent.lock().unwrap().last().unwrap().header.clone()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_responder_delivers_in_order() {
        let sent = Sent::default();
        let conn = responder(sent.clone(), 0);
        conn.send_state_now().await;

        let state = last_sent(&sent);
        assert_eq!(state.packet_type, PacketType::State);
        assert_eq!(state.connection_id, 100);
        assert_eq!(state.seq_nr, SeqNr::from_raw(500));
        assert_eq!(state.ack_nr, SeqNr::from_raw(1));

        conn.deliver(packet(PacketType::Data, 101, 3, 499, b"world"));
        conn.deliver(packet(PacketType::Data, 101, 2, 499, b"hello "));
        settle().await;

        let mut buf = [0u8; 32];
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello world");

        let state = last_sent(&sent);
        assert_eq!(state.packet_type, PacketType::State);
        assert_eq!(state.ack_nr, SeqNr::from_raw(3));
        assert!(state.extensions.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_order_is_selectively_acked() {
        let sent = Sent::default();
        let conn = responder(sent.clone(), 0);

        conn.deliver(packet(PacketType::Data, 101, 3, 499, b"x"));
        settle().await;

        let state = last_sent(&sent);
        assert_eq!(state.packet_type, PacketType::State);
        assert_eq!(state.ack_nr, SeqNr::from_raw(1));
        assert_eq!(state.selective_ack(), Some(&[1u8, 0, 0, 0][..]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_data_is_delivered_once() {
        let sent = Sent::default();
        let conn = responder(sent.clone(), 0);

        conn.deliver(packet(PacketType::Data, 101, 2, 499, b"ab"));
        conn.deliver(packet(PacketType::Data, 101, 2, 499, b"ab"));
        settle().await;

        let mut buf = [0u8; 32];
        assert_eq!(conn.read(&mut buf).await.unwrap(), 2);

        conn.set_read_deadline(Some(Instant::now() + Duration::from_millis(5)));
        assert!(matches!(conn.read(&mut buf).await, Err(UtpError::Timeout)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fin_ends_stream_after_data() {
        let sent = Sent::default();
        let conn = responder(sent.clone(), 0);

        conn.deliver(packet(PacketType::Fin, 101, 3, 499, b""));
        conn.deliver(packet(PacketType::Data, 101, 2, 499, b"abc"));
        settle().await;

        let mut buf = [0u8; 32];
        assert_eq!(conn.read(&mut buf).await.unwrap(), 3);
        assert_eq!(&buf[..3], b"abc");
        assert_eq!(conn.read(&mut buf).await.unwrap(), 0);
        assert_eq!(last_sent(&sent).ack_nr, SeqNr::from_raw(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_destroys() {
        let sent = Sent::default();
        let conn = responder(sent.clone(), 1);

        conn.deliver(packet(PacketType::Reset, 101, 2, 499, b""));
        settle().await;

        assert_eq!(conn.state().await, ConnectionState::Destroy);
        assert_eq!(last_sent(&sent).packet_type, PacketType::Reset);

        let mut buf = [0u8; 32];
        assert!(matches!(conn.read(&mut buf).await, Err(UtpError::Reset)));
        assert!(matches!(conn.write(b"x").await, Err(UtpError::Reset)));
        assert!(matches!(conn.close().await, Err(UtpError::Reset)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_initiator_handshake() {
        let sent = Sent::default();
        let conn = initiator(sent.clone(), 0);
        conn.send_syn().await;

        let syn = last_sent(&sent);
        assert_eq!(syn.packet_type, PacketType::Syn);
        assert_eq!(syn.connection_id, 300);
        assert_eq!(syn.seq_nr, SeqNr::from_raw(1));

        // DATA does not complete the handshake
        conn.deliver(packet(PacketType::Data, 300, 700, 1, b"early"));
        settle().await;
        assert_eq!(conn.state().await, ConnectionState::SynSent);

        conn.deliver(packet(PacketType::State, 300, 700, 1, b""));
        conn.wait_connected(Some(Instant::now() + Duration::from_secs(1))).await.unwrap();

        assert_eq!(conn.write(b"abc").await.unwrap(), 3);
        let data = sent.lock().unwrap().last().unwrap().clone();
        assert_eq!(data.header.packet_type, PacketType::Data);
        assert_eq!(data.header.connection_id, 301);
        assert_eq!(data.header.seq_nr, SeqNr::from_raw(2));
        assert_eq!(data.header.ack_nr, SeqNr::from_raw(699));
        assert_eq!(data.payload.as_ref(), b"abc");
    }

    #[tokio::test(start_paused = true)]
    async fn test_syn_resent_until_send_timeout() {
        let sent = Sent::default();
        let conn = initiator(sent.clone(), 1);
        conn.send_syn().await;

        let result = conn.wait_connected(None).await;
        assert!(matches!(result, Err(UtpError::AckTimeout)));

        let num_syns = sent.lock().unwrap().iter()
            .filter(|p| p.header.packet_type == PacketType::Syn)
            .count();
        assert!(num_syns >= 10, "{} SYNs", num_syns);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dial_aborted() {
        let sent = Sent::default();
        let conn = initiator(sent.clone(), 1);
        conn.send_syn().await;

        let result = conn.wait_connected(Some(Instant::now() + Duration::from_millis(10))).await;
        assert!(matches!(result, Err(UtpError::Timeout)));

        conn.abort(None).await;
        assert_eq!(conn.state().await, ConnectionState::Destroy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_waits_for_fin_ack() {
        let sent = Sent::default();
        let conn = responder(sent.clone(), 1);

        let closer = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.close().await })
        };
        settle().await;

        let fin = last_sent(&sent);
        assert_eq!(fin.packet_type, PacketType::Fin);
        assert_eq!(fin.seq_nr, SeqNr::from_raw(500));
        assert!(!closer.is_finished());

        conn.deliver(packet(PacketType::State, 101, 2, 500, b""));
        closer.await.unwrap().unwrap();
        assert!(matches!(conn.write(b"x").await, Err(UtpError::Closed)));
    }

    #[rstest]
    #[case::no_loss(vec![], 10, 1)]
    #[case::resend_timeout(vec![], 1100, 2)]
    #[case::two_duplicate_acks(vec![499, 499], 1, 1)]
    #[case::three_duplicate_acks(vec![499, 499, 499], 1, 2)]
    #[case::acked(vec![500], 1100, 1)]
    #[tokio::test(start_paused = true)]
    async fn test_retransmission(#[case] acks: Vec<u16>, #[case] wait_millis: u64, #[case] expected_sends_of_first: usize) {
        let sent = Sent::default();
        let conn = responder(sent.clone(), 0);

        conn.write(b"first").await.unwrap();
        conn.write(b"second").await.unwrap();
        for ack in acks {
            conn.deliver(packet(PacketType::State, 101, 2, ack, b""));
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        tokio::time::sleep(Duration::from_millis(wait_millis)).await;

        let sends_of_first = sent.lock().unwrap().iter()
            .filter(|p| p.payload.as_ref() == b"first")
            .count();
        assert_eq!(sends_of_first, expected_sends_of_first);
    }

    #[rstest]
    #[case::fin_first(vec![2, 3])]
    #[case::data_first(vec![3, 2])]
    #[tokio::test(start_paused = true)]
    async fn test_close_after_data_past_fin(#[case] arrival: Vec<u16>) {
        let sent = Sent::default();
        let conn = responder(sent.clone(), 1);

        for seq_nr in arrival {
            if seq_nr == 2 {
                conn.deliver(packet(PacketType::Fin, 101, 2, 499, b""));
            }
            else {
                conn.deliver(packet(PacketType::Data, 101, seq_nr, 499, b"late"));
            }
        }
        settle().await;

        let mut buf = [0u8; 32];
        assert_eq!(conn.read(&mut buf).await.unwrap(), 0);
        assert_eq!(last_sent(&sent).ack_nr, SeqNr::from_raw(2));

        let closer = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.close().await })
        };
        settle().await;
        assert_eq!(last_sent(&sent).packet_type, PacketType::Fin);

        conn.deliver(packet(PacketType::State, 101, 2, 500, b""));
        tokio::time::timeout(Duration::from_secs(60), closer).await.unwrap().unwrap().unwrap();
        assert_eq!(conn.state().await, ConnectionState::Destroy);
    }

    #[rstest]
    #[case::without_timestamp(false)]
    #[case::with_timestamp(true)]
    #[tokio::test(start_paused = true)]
    async fn test_congestion_window_on_ack(#[case] timestamped: bool) {
        let sent = Sent::default();
        let conn = responder(sent.clone(), 0);
        let initial = conn.inner.lock().await.ledbat.max_window();

        conn.write(b"first").await.unwrap();
        let mut ack = packet(PacketType::State, 101, 2, 500, b"");
        if timestamped {
            ack.header.timestamp = now_micros().wrapping_sub(1000);
        }
        conn.deliver(ack);
        settle().await;

        let window = conn.inner.lock().await.ledbat.max_window();
        if timestamped {
            assert!(window > initial, "{} <= {}", window, initial);
        }
        else {
            assert_eq!(window, initial);
        }
    }

    #[rstest]
    #[case::disabled(None, 0)]
    #[case::every_second(Some(Duration::from_secs(1)), 3)]
    #[tokio::test(start_paused = true)]
    async fn test_keepalive(#[case] interval: Option<Duration>, #[case] expected_states: usize) {
        let sent = Sent::default();
        let config = UtpConfig {
            keepalive_interval: interval,
            ..UtpConfig::default()
        };
        let _conn = responder_with(config, sent.clone(), 0);

        tokio::time::sleep(Duration::from_millis(3500)).await;

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), expected_states);
        assert!(sent.iter().all(|p| p.header.packet_type == PacketType::State));
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_blocks_on_congestion_window() {
        let sent = Sent::default();
        let conn = responder(sent.clone(), 0);
        let mss = conn.config.max_payload_size();
        let num_data = |sent: &Sent| sent.lock().unwrap().iter()
            .filter(|p| p.header.packet_type == PacketType::Data)
            .count();

        let writer = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.write(&vec![7u8; 3 * mss]).await })
        };
        settle().await;

        // the second packet fits as long as the bytes in flight do not exceed the window
        assert_eq!(num_data(&sent), 2);
        assert!(!writer.is_finished());

        conn.deliver(packet(PacketType::State, 101, 2, 501, b""));
        assert_eq!(writer.await.unwrap().unwrap(), 3 * mss);
        assert_eq!(num_data(&sent), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_blocks_on_outstanding_packets() {
        let sent = Sent::default();
        let config = UtpConfig {
            max_unacked_outbound: 2,
            ..UtpConfig::default()
        };
        let conn = responder_with(config, sent.clone(), 0);

        let writer = {
            let conn = conn.clone();
            tokio::spawn(async move {
                for chunk in [b"a", b"b", b"c"] {
                    conn.write(chunk).await?;
                }
                UtpResult::<()>::Ok(())
            })
        };
        settle().await;

        assert_eq!(sent.lock().unwrap().len(), 2);
        assert!(!writer.is_finished());

        conn.deliver(packet(PacketType::State, 101, 2, 500, b""));
        writer.await.unwrap().unwrap();
        let data = sent.lock().unwrap().last().unwrap().clone();
        assert_eq!(data.header.seq_nr, SeqNr::from_raw(502));
        assert_eq!(data.payload.as_ref(), b"c");
    }

    #[rstest]
    #[case::in_order(vec![2], 0x8000 - 1)]
    #[case::few_out_of_order(vec![4, 5, 6], 0x8000 - 3)]
    #[case::too_many_out_of_order(vec![4, 5, 6, 7], 0)]
    #[tokio::test(start_paused = true)]
    async fn test_advertised_window(#[case] seq_nrs: Vec<u16>, #[case] expected: u32) {
        let sent = Sent::default();
        let config = UtpConfig {
            max_unacked_inbound: 6,
            ..UtpConfig::default()
        };
        let conn = responder_with(config, sent.clone(), 0);

        for seq_nr in seq_nrs {
            conn.deliver(packet(PacketType::Data, 101, seq_nr, 499, b"x"));
        }
        settle().await;

        let state = last_sent(&sent);
        assert_eq!(state.packet_type, PacketType::State);
        assert_eq!(state.window, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_update_after_read() {
        let sent = Sent::default();
        let config = UtpConfig {
            recv_window: 2 * 1202,
            ..UtpConfig::default()
        };
        let conn = responder_with(config, sent.clone(), 0);
        assert_eq!(conn.config.max_payload_size(), 1202);

        conn.deliver(packet(PacketType::Data, 101, 2, 499, &[2u8; 1202]));
        conn.deliver(packet(PacketType::Data, 101, 3, 499, &[3u8; 1202]));
        conn.deliver(packet(PacketType::Data, 101, 4, 499, &[4u8; 1202]));
        settle().await;

        // #4 does not fit into the byte ring yet
        let state = last_sent(&sent);
        assert_eq!(state.ack_nr, SeqNr::from_raw(3));
        assert_eq!(state.window, 0);

        let mut buf = [0u8; 1202];
        assert_eq!(conn.read(&mut buf).await.unwrap(), 1202);
        assert_eq!(buf, [2u8; 1202]);
        let state = last_sent(&sent);
        assert_eq!(state.packet_type, PacketType::State);
        assert_eq!(state.ack_nr, SeqNr::from_raw(4));
        assert_eq!(state.window, 0);

        let num_sent = sent.lock().unwrap().len();
        assert_eq!(conn.read(&mut buf).await.unwrap(), 1202);
        assert_eq!(buf, [3u8; 1202]);
        assert_eq!(sent.lock().unwrap().len(), num_sent + 1);
        let state = last_sent(&sent);
        assert_eq!(state.packet_type, PacketType::State);
        assert_eq!(state.window, 1202);
    }
}
