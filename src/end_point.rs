use crate::buffers::byte_ring::wait_with_deadline;
use crate::config::UtpConfig;
use crate::connection::{ConnKey, Connection, ConnectionRegistry, Syn};
use crate::error::{UtpError, UtpResult};
use crate::packet::{Packet, PacketHeader, PacketType};
use crate::safe_converter::PrecheckedCast;
use crate::send_pipeline::{PacketSocket, SendPipeline};
use crate::seq_nr::SeqNr;
use crate::stream::UtpStream;
use crate::util::random::{Random, RngRandom};
use bytes::Bytes;
use rustc_hash::FxHashMap;
use std::cmp::min;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::select;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, span, trace, Instrument, Level};
use uuid::Uuid;

/// number of distinct connection ids
const CONN_ID_SPACE: usize = 0x10000;

/// EndPoint is the place where all other parts of the protocol come together: It owns a UDP
///  socket, dispatches incoming packets to their connections, keeps SYNs in a backlog until they
///  are accepted, and passes everything that is not uTP on to the application as out-of-band
///  traffic.
///
/// An EndPoint is both the listener for incoming connections and the origin for outgoing ones.
///  Dropping it marks it as closing: no more connections are accepted, but existing connections
///  continue, and the socket is released when the last of them is gone.
pub struct EndPoint {
    inner: Arc<EndPointInner>,
}

struct EndPointInner {
    config: Arc<UtpConfig>,
    send_pipeline: SendPipeline,
    local_addr: SocketAddr,
    conns: RwLock<FxHashMap<ConnKey, Arc<Connection>>>,
    backlog: std::sync::Mutex<VecDeque<Syn>>,
    /// broadcast when the backlog or the listener's state changes
    listener_event: Notify,
    out_of_band_sender: mpsc::Sender<(Bytes, SocketAddr)>,
    out_of_band_receiver: Mutex<mpsc::Receiver<(Bytes, SocketAddr)>>,
    deadline: std::sync::Mutex<Option<Instant>>,
    closing: AtomicBool,
    /// set when the receive loop terminated because of a socket error
    dead: AtomicBool,
    reader_shutdown: Notify,
}

impl EndPoint {
    pub async fn bind(addr: impl ToSocketAddrs, config: Arc<UtpConfig>) -> anyhow::Result<EndPoint> {
        config.validate()?;

        let socket = UdpSocket::bind(addr).await?;
        info!("bound uTP socket to {:?}", socket.local_addr()?);
        Self::with_socket(Arc::new(socket), config)
    }

    /// Runs the protocol on an existing socket, which is from then on owned by the end point
    pub fn with_socket(socket: Arc<dyn PacketSocket>, config: Arc<UtpConfig>) -> anyhow::Result<EndPoint> {
        config.validate()?;

        let inner = EndPointInner::new(socket, config)?;
        tokio::spawn(inner.clone().recv_loop());
        Ok(EndPoint { inner })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// The deadline applies to `accept` and `recv_from_out_of_band`
    pub fn set_deadline(&self, deadline: Option<Instant>) {
        *self.inner.deadline() = deadline;
        self.inner.listener_event.notify_waiters();
    }

    /// Waits for the next incoming connection and completes its handshake
    pub async fn accept(&self) -> UtpResult<UtpStream> {
        loop {
            let mut notified = pin!(self.inner.listener_event.notified());
            notified.as_mut().enable();

            self.inner.check_open()?;
            let syn = self.inner.backlog().pop_front();
            if let Some(syn) = syn {
                let connection = self.inner.accept_syn::<RngRandom>(&syn).await;
                debug!("accepted connection {}", connection);
                return Ok(UtpStream::new(connection));
            }

            if !wait_with_deadline(notified, self.inner.deadline_value()).await {
                return Err(UtpError::Timeout);
            }
        }
    }

    /// Opens a connection to `addr` through this end point's socket
    pub async fn dial(&self, addr: SocketAddr, timeout: Option<Duration>) -> UtpResult<UtpStream> {
        self.inner.check_open()?;
        let deadline = timeout.map(|t| Instant::now() + t);

        let connection = self.inner.register_initiator::<RngRandom>(addr)?;
        connection.send_syn().await;

        match connection.wait_connected(deadline).await {
            Ok(()) => {
                debug!("dialed {}", connection);
                Ok(UtpStream::new(connection))
            }
            Err(e) => {
                debug!("dialing {:?} failed: {}", addr, e);
                connection.abort(None).await;
                Err(e)
            }
        }
    }

    /// Receives the next datagram that is not part of a uTP connection
    pub async fn recv_from_out_of_band(&self, buf: &mut [u8]) -> UtpResult<(usize, SocketAddr)> {
        let mut receiver = self.inner.out_of_band_receiver.lock().await;
        loop {
            let mut notified = pin!(self.inner.listener_event.notified());
            notified.as_mut().enable();
            self.inner.check_open()?;

            let deadline = self.inner.deadline_value();
            select! {
                received = receiver.recv() => {
                    if let Some((data, from)) = received {
                        let n = min(buf.len(), data.len());
                        buf[..n].copy_from_slice(&data[..n]);
                        return Ok((n, from));
                    }
                    return Err(UtpError::Closed);
                }
                woken = wait_with_deadline(notified, deadline) => {
                    if !woken {
                        return Err(UtpError::Timeout);
                    }
                }
            }
        }
    }

    /// Sends a raw datagram through the shared socket
    pub async fn send_to_out_of_band(&self, buf: &[u8], addr: SocketAddr) -> UtpResult<usize> {
        self.inner.check_open()?;
        Ok(self.inner.send_pipeline.do_send_packet(addr, buf).await?)
    }

    /// Stops accepting connections. Established connections are not affected, and the socket is
    ///  closed once all of them are gone.
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn num_connections(&self) -> usize {
        self.inner.conns().len()
    }

    pub fn backlog_len(&self) -> usize {
        self.inner.backlog().len()
    }
}

impl Drop for EndPoint {
    fn drop(&mut self) {
        self.inner.close();
    }
}

/// Dials `addr` from a fresh end point on an ephemeral port. The end point is released together
///  with the connection.
pub async fn dial(addr: SocketAddr, timeout: Option<Duration>) -> anyhow::Result<UtpStream> {
    let config = Arc::new(UtpConfig::from_env()?);
    let local_addr: SocketAddr = if addr.is_ipv4() {
        "0.0.0.0:0".parse()?
    }
    else {
        "[::]:0".parse()?
    };

    let end_point = EndPoint::bind(local_addr, config).await?;
    let stream = end_point.dial(addr, timeout).await?;
    Ok(stream)
}

impl EndPointInner {
    fn new(socket: Arc<dyn PacketSocket>, config: Arc<UtpConfig>) -> anyhow::Result<Arc<EndPointInner>> {
        let local_addr = socket.local_addr()?;
        let (out_of_band_sender, out_of_band_receiver) = mpsc::channel(config.out_of_band_queue_depth);
        Ok(Arc::new(EndPointInner {
            send_pipeline: SendPipeline::new(socket, config.packet_drop_probability),
            config,
            local_addr,
            conns: Default::default(),
            backlog: Default::default(),
            listener_event: Notify::new(),
            out_of_band_sender,
            out_of_band_receiver: Mutex::new(out_of_band_receiver),
            deadline: Default::default(),
            closing: AtomicBool::new(false),
            dead: AtomicBool::new(false),
            reader_shutdown: Notify::new(),
        }))
    }

    fn conns(&self) -> RwLockReadGuard<'_, FxHashMap<ConnKey, Arc<Connection>>> {
        self.conns.read().unwrap_or_else(|e| e.into_inner())
    }

    fn conns_mut(&self) -> RwLockWriteGuard<'_, FxHashMap<ConnKey, Arc<Connection>>> {
        self.conns.write().unwrap_or_else(|e| e.into_inner())
    }

    fn backlog(&self) -> MutexGuard<'_, VecDeque<Syn>> {
        self.backlog.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn deadline(&self) -> MutexGuard<'_, Option<Instant>> {
        self.deadline.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn deadline_value(&self) -> Option<Instant> {
        *self.deadline()
    }

    fn check_open(&self) -> UtpResult<()> {
        if self.closing.load(Ordering::Acquire) || self.dead.load(Ordering::Acquire) {
            return Err(UtpError::Closed);
        }
        Ok(())
    }

    fn close(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("closing uTP end point {:?}", self.local_addr);

        let num_pending = {
            let mut backlog = self.backlog();
            let n = backlog.len();
            backlog.clear();
            n
        };
        if num_pending > 0 {
            debug!("discarding {} SYNs that were never accepted", num_pending);
        }
        self.listener_event.notify_waiters();

        if self.conns().is_empty() {
            self.reader_shutdown.notify_one();
        }
    }

    /// Picks a connection id by sampling without replacement: a Fisher-Yates shuffle of the id
    ///  space that is materialized lazily, one swap per attempt.
    fn new_conn_id<R: Random>(max_attempts: usize, is_taken: impl Fn(u16) -> bool) -> UtpResult<u16> {
        let mut swaps: FxHashMap<usize, usize> = FxHashMap::default();
        for i in 0..min(max_attempts, CONN_ID_SPACE) {
            let j = R::gen_usize_range(i..CONN_ID_SPACE);
            let candidate = swaps.get(&j).copied().unwrap_or(j);
            let displaced = swaps.get(&i).copied().unwrap_or(i);
            swaps.insert(j, displaced);

            let conn_id: u16 = candidate.prechecked_cast();
            if !is_taken(conn_id) {
                return Ok(conn_id);
            }
        }
        Err(UtpError::ConnectionExhausted)
    }

    fn register_initiator<R: Random>(self: &Arc<Self>, addr: SocketAddr) -> UtpResult<Arc<Connection>> {
        let mut conns = self.conns_mut();
        let recv_id = Self::new_conn_id::<R>(self.config.max_conn_id_attempts, |conn_id| {
            [conn_id.wrapping_sub(1), conn_id, conn_id.wrapping_add(1)].iter()
                .any(|&id| conns.contains_key(&ConnKey { addr, conn_id: id }))
        })?;

        let connection = Connection::new_initiator(
            self.config.clone(),
            self.send_pipeline.clone(),
            self.clone(),
            self.local_addr,
            addr,
            recv_id,
        );
        conns.insert(connection.key(), connection.clone());
        Ok(connection)
    }

    async fn accept_syn<R: Random>(self: &Arc<Self>, syn: &Syn) -> Arc<Connection> {
        let key = ConnKey {
            addr: syn.addr,
            conn_id: syn.conn_id.wrapping_add(1),
        };
        let connection = {
            let mut conns = self.conns_mut();
            match conns.get(&key) {
                Some(existing) => existing.clone(),
                None => {
                    let connection = Connection::new_responder(
                        self.config.clone(),
                        self.send_pipeline.clone(),
                        self.clone(),
                        self.local_addr,
                        syn,
                        SeqNr::from_raw(R::next_u16()),
                    );
                    conns.insert(key, connection.clone());
                    connection
                }
            }
        };
        connection.send_state_now().await;
        connection
    }

    async fn recv_loop(self: Arc<Self>) {
        info!("starting receive loop on {:?}", self.local_addr);

        let mut buf = vec![0u8; self.config.max_recv_size];
        loop {
            let received = select! {
                _ = self.reader_shutdown.notified() => break,
                received = self.send_pipeline.socket().recv_from(&mut buf) => received,
            };

            let (num_read, from) = match received {
                Ok(x) => x,
                Err(e) if is_temporary(&e) => {
                    debug!("temporary socket error: {}", e);
                    continue;
                }
                Err(e) => {
                    error!("socket error - terminating receive loop: {}", e);
                    self.dead.store(true, Ordering::Release);
                    self.listener_event.notify_waiters();
                    break;
                }
            };

            let correlation_id = Uuid::new_v4();
            let span = span!(Level::TRACE, "packet_received", ?correlation_id);
            let data = Bytes::copy_from_slice(&buf[..num_read]);
            self.dispatch(data, from).instrument(span).await;
        }

        info!("receive loop on {:?} terminated", self.local_addr);
    }

    async fn dispatch(self: &Arc<Self>, data: Bytes, from: SocketAddr) {
        let packet = match Packet::deser(data.clone()) {
            Ok(packet) => packet,
            Err(e) => {
                trace!("received non-uTP datagram from {:?}: {}", from, e);
                self.queue_out_of_band(data, from);
                return;
            }
        };
        trace!("received {:?} from {:?}", packet.header, from);

        if packet.header.packet_type == PacketType::Syn {
            self.on_syn(packet, from).await;
            return;
        }

        let key = ConnKey {
            addr: from,
            conn_id: packet.header.connection_id,
        };
        let connection = self.conns().get(&key).cloned();
        match connection {
            Some(connection) => connection.deliver(packet),
            None if packet.header.packet_type == PacketType::Reset => {
                trace!("RESET for unknown connection {:?} - ignoring", key);
            }
            None => {
                debug!("{:?} for unknown connection {:?} - resetting", packet.header.packet_type, key);
                let conn_id = packet.header.connection_id;
                for reset_id in [conn_id, conn_id.wrapping_sub(1), conn_id.wrapping_add(1)] {
                    self.send_reset(from, reset_id, packet.header.seq_nr).await;
                }
                self.queue_out_of_band(data, from);
            }
        }
    }

    async fn on_syn(self: &Arc<Self>, packet: Packet, from: SocketAddr) {
        let h = &packet.header;
        let key = ConnKey {
            addr: from,
            conn_id: h.connection_id.wrapping_add(1),
        };

        let existing = self.conns().get(&key).cloned();
        if let Some(connection) = existing {
            if connection.send_id() == h.connection_id.wrapping_add(2) {
                debug!("SYN from {:?} collides with our own connection {} - resetting", from, connection);
                self.send_reset(from, h.connection_id, h.seq_nr).await;
            }
            else {
                trace!("duplicate SYN for {}", connection);
                connection.deliver(packet);
            }
            return;
        }

        let syn = Syn {
            addr: from,
            conn_id: h.connection_id,
            seq_nr: h.seq_nr,
            window: h.window,
        };

        if self.closing.load(Ordering::Acquire) {
            debug!("SYN from {:?} while closing - rejecting", from);
            self.send_reset(from, syn.conn_id, syn.seq_nr).await;
            return;
        }

        let evicted = {
            let mut backlog = self.backlog();
            if backlog.iter().any(|s| s.addr == syn.addr && s.conn_id == syn.conn_id && s.seq_nr == syn.seq_nr) {
                trace!("SYN from {:?} is already in the backlog", from);
                return;
            }

            let evicted = if backlog.len() >= self.config.backlog {
                let idx = RngRandom::gen_usize_range(0..backlog.len());
                backlog.remove(idx)
            }
            else {
                None
            };
            backlog.push_back(syn);
            evicted
        };

        if let Some(evicted) = evicted {
            debug!("backlog is full - rejecting SYN from {:?}", evicted.addr);
            self.send_reset(evicted.addr, evicted.conn_id, evicted.seq_nr).await;
        }
        self.listener_event.notify_waiters();
    }

    async fn send_reset(&self, to: SocketAddr, conn_id: u16, ack_nr: SeqNr) {
        let header = PacketHeader {
            packet_type: PacketType::Reset,
            connection_id: conn_id,
            timestamp: 0,
            timestamp_diff: 0,
            window: 0,
            seq_nr: SeqNr::default(),
            ack_nr,
            extensions: vec![],
        };
        self.send_pipeline.send_packet(to, &header, &[]).await;
    }

    fn queue_out_of_band(&self, data: Bytes, from: SocketAddr) {
        if self.out_of_band_sender.try_send((data, from)).is_err() {
            trace!("out-of-band queue is full - dropping datagram from {:?}", from);
        }
    }
}

impl ConnectionRegistry for EndPointInner {
    fn unregister(&self, key: ConnKey) {
        let is_empty = {
            let mut conns = self.conns_mut();
            conns.remove(&key);
            conns.is_empty()
        };
        debug!("unregistered connection {:?}", key);

        if is_empty && self.closing.load(Ordering::Acquire) {
            self.reader_shutdown.notify_one();
        }
    }
}

fn is_temporary(e: &io::Error) -> bool {
    matches!(e.kind(),
        io::ErrorKind::Interrupted |
        io::ErrorKind::WouldBlock |
        io::ErrorKind::TimedOut |
        io::ErrorKind::ConnectionReset |
        io::ErrorKind::ConnectionRefused
    )
}
