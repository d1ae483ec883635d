//! The connection entity and its send/receive machinery.

use std::{
    collections::HashMap,
    io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering},
        Arc, Mutex, RwLock,
    },
    thread,
    time::Instant,
};

use crossbeam_channel::{bounded, tick, Sender};
use rand::Rng;
use tracing::{debug, error, trace, warn};

use saltwire_core::{
    constants::MAX_DATAGRAM_SIZE,
    error::{ErrorKind, Result},
    transport::{bind_udp, DatagramSocket, SendPipeline},
    Config,
};
use saltwire_protocol::{
    bit_io::{BitReader, BitWriter},
    channel::{create_channel, Channel, ChannelIo, ChannelKind},
    packet::{Packet, PacketFactory},
    wire::{combine_salts, write_application_header, ControlFrame, DisconnectReason},
};

use crate::{
    connection_state::{ConnectionState, StateCell},
    events::{ConnectStatus, ConnectionCallbacks},
};

/// Snapshot of a connection's traffic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Datagrams handed to the socket.
    pub packets_sent: u64,
    /// Datagrams taken off the socket.
    pub packets_received: u64,
    /// Payload bytes handed to the socket.
    pub bytes_sent: u64,
    /// Payload bytes taken off the socket.
    pub bytes_received: u64,
    /// Datagrams dropped by validation (bad framing, salt mismatch).
    pub packets_dropped: u64,
}

#[derive(Debug, Default)]
struct StatCounters {
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets_dropped: AtomicU64,
}

impl StatCounters {
    fn snapshot(&self) -> ConnectionStats {
        ConnectionStats {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
        }
    }
}

/// A virtual connection over UDP.
///
/// Cheap to clone; clones share the same underlying connection. A client
/// builds one with [`Connection::new`] and drives the salted four-way
/// handshake through [`Connection::connect`]; a listener mints
/// already-established ones through [`Connection::accept`].
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    config: Config,
    factory: Arc<dyn PacketFactory>,
    callbacks: RwLock<ConnectionCallbacks>,

    state: StateCell,
    local_salt: AtomicU64,
    remote_salt: AtomicU64,
    session_salt: AtomicU64,

    /// Handshake sends performed in the current phase.
    retries: AtomicU32,
    /// Timestamp of the last handshake send; its mutex also serializes
    /// handshake progress between the timer and the receive thread.
    last_attempt: Mutex<Instant>,
    last_received: Mutex<Instant>,

    remote: Mutex<Option<SocketAddr>>,
    socket: Mutex<Option<Arc<dyn DatagramSocket>>>,
    pipeline: Mutex<Option<Arc<SendPipeline>>>,
    /// Bumped whenever I/O is torn down; receive and timer loops from
    /// earlier connect cycles notice and exit.
    epoch: AtomicU64,
    timer_stop: Mutex<Option<Sender<()>>>,
    pump_started: AtomicBool,

    /// Single-shot latch guaranteeing the disconnect body runs once.
    disconnect_latch: AtomicU8,
    /// Internal observer fired after teardown; the listener uses it to
    /// recycle the connection's port.
    closed_hook: Mutex<Option<Box<dyn FnOnce() + Send>>>,

    channels: RwLock<HashMap<u8, Arc<dyn Channel>>>,
    stats: StatCounters,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.inner.state.load())
            .field("remote", &*self.inner.remote.lock().expect("remote poisoned"))
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Creates an unconnected client-side connection.
    ///
    /// Every packet id starts on an unreliable channel; override ids with
    /// [`Connection::set_packet_channel`] before sending on them.
    pub fn new(
        factory: Arc<dyn PacketFactory>,
        config: Config,
        callbacks: ConnectionCallbacks,
    ) -> Connection {
        let connection = Connection {
            inner: Arc::new(ConnectionInner {
                config,
                factory,
                callbacks: RwLock::new(callbacks),
                state: StateCell::new(ConnectionState::ReadyToConnect),
                local_salt: AtomicU64::new(0),
                remote_salt: AtomicU64::new(0),
                session_salt: AtomicU64::new(0),
                retries: AtomicU32::new(0),
                last_attempt: Mutex::new(Instant::now()),
                last_received: Mutex::new(Instant::now()),
                remote: Mutex::new(None),
                socket: Mutex::new(None),
                pipeline: Mutex::new(None),
                epoch: AtomicU64::new(0),
                timer_stop: Mutex::new(None),
                pump_started: AtomicBool::new(false),
                disconnect_latch: AtomicU8::new(0),
                closed_hook: Mutex::new(None),
                channels: RwLock::new(HashMap::new()),
                stats: StatCounters::default(),
            }),
        };
        connection.install_default_channels();
        connection
    }

    /// Builds an already-established server-side connection on a dedicated
    /// port. Used by the listener after a verified `Solution`; the receive
    /// pump does not run until [`Connection::start`] so the application can
    /// configure callbacks and channels first.
    pub fn accept(
        factory: Arc<dyn PacketFactory>,
        config: Config,
        bind_addr: SocketAddr,
        peer: SocketAddr,
        session_salt: u64,
    ) -> Result<Connection> {
        let socket: Arc<dyn DatagramSocket> = Arc::new(bind_udp(bind_addr, &config)?);
        let connection = Connection::new(factory, config, ConnectionCallbacks::default());
        let inner = &connection.inner;
        inner.state.store(ConnectionState::Connected);
        inner.session_salt.store(session_salt, Ordering::SeqCst);
        *inner.remote.lock().expect("remote poisoned") = Some(peer);
        *inner.pipeline.lock().expect("pipeline poisoned") =
            Some(Arc::new(SendPipeline::new(socket.clone())));
        *inner.socket.lock().expect("socket poisoned") = Some(socket);
        Ok(connection)
    }

    /// Starts the receive pump and timer of an accepted connection.
    /// Idempotent; a second call is a no-op.
    pub fn start(&self) -> Result<()> {
        if self.inner.pump_started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let socket = self
            .inner
            .socket
            .lock()
            .expect("socket poisoned")
            .clone()
            .ok_or(ErrorKind::NotConnected)?;
        self.inner.start_io(socket)?;
        Ok(())
    }

    /// Opens the four-way handshake toward `remote`.
    ///
    /// Idempotent: calling while a handshake or connection is in progress
    /// is a no-op. Binds an ephemeral local port and resolves through the
    /// `on_connected` callback.
    pub fn connect(&self, remote: SocketAddr) -> Result<()> {
        let bind_addr: SocketAddr = if remote.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = Arc::new(bind_udp(bind_addr, &self.inner.config)?);
        self.connect_with_socket(socket, remote)
    }

    /// [`Connection::connect`] over a caller-supplied socket. The test
    /// suites use this to splice fault injectors under the connection.
    pub fn connect_with_socket(
        &self,
        socket: Arc<dyn DatagramSocket>,
        remote: SocketAddr,
    ) -> Result<()> {
        let inner = &self.inner;
        if !inner.state.transition(
            ConnectionState::ReadyToConnect,
            ConnectionState::AwaitingChallenge,
        ) {
            // Repeated connect calls must not perturb a running attempt.
            trace!("connect ignored; connection is not ready");
            return Ok(());
        }

        let client_salt: u64 = rand::rng().random();
        inner.local_salt.store(client_salt, Ordering::SeqCst);
        inner.remote_salt.store(0, Ordering::SeqCst);
        inner.session_salt.store(0, Ordering::SeqCst);
        inner.retries.store(0, Ordering::SeqCst);
        *inner.remote.lock().expect("remote poisoned") = Some(remote);
        *inner.pipeline.lock().expect("pipeline poisoned") =
            Some(Arc::new(SendPipeline::new(socket.clone())));
        *inner.socket.lock().expect("socket poisoned") = Some(socket.clone());
        *inner.last_received.lock().expect("last_received poisoned") = Instant::now();
        inner.pump_started.store(true, Ordering::SeqCst);

        if let Err(e) = inner.start_io(socket) {
            inner.teardown_io();
            inner.state.store(ConnectionState::ReadyToConnect);
            return Err(e);
        }

        debug!("handshake opened toward {}", remote);
        let mut last_attempt = inner.last_attempt.lock().expect("last_attempt poisoned");
        inner.send_handshake_attempt(&mut last_attempt, ControlFrame::Connect { client_salt });
        Ok(())
    }

    /// Sends an application packet on the channel its id is registered to.
    ///
    /// Calling before the connection is established returns
    /// [`ErrorKind::NotConnected`].
    pub fn send(&self, packet: &dyn Packet) -> Result<()> {
        if !self.inner.state.load().is_connected() {
            return Err(ErrorKind::NotConnected);
        }
        let channel = self
            .inner
            .channel(packet.id())
            .ok_or(ErrorKind::UnknownPacketId(packet.id()))?;
        channel.send(packet)
    }

    /// Registers `id` on a channel of the given kind, replacing the
    /// default unreliable one. Do this before sending on the id; changing
    /// the channel mid-stream discards its reliability state.
    pub fn set_packet_channel(&self, id: u8, kind: ChannelKind) -> Result<()> {
        if id >= self.inner.factory.type_count() {
            return Err(ErrorKind::UnknownPacketId(id));
        }
        let channel: Arc<dyn Channel> =
            Arc::from(create_channel(kind, id, self.channel_io(), &self.inner.config));
        self.inner.channels.write().expect("channels poisoned").insert(id, channel);
        Ok(())
    }

    /// Replaces the callback record. Meant to run inside a listener's
    /// `on_connection` hook, before [`Connection::start`].
    pub fn set_callbacks(&self, callbacks: ConnectionCallbacks) {
        *self.inner.callbacks.write().expect("callbacks poisoned") = callbacks;
    }

    /// Installs the internal closed observer. At most one; the listener
    /// uses it to recycle the connection's port.
    pub fn set_closed_hook(&self, hook: Box<dyn FnOnce() + Send>) {
        *self.inner.closed_hook.lock().expect("closed_hook poisoned") = Some(hook);
    }

    /// Tears the connection down, notifying the peer.
    pub fn disconnect(&self) {
        self.inner.disconnect(true, DisconnectReason::ClientDisconnect);
    }

    /// Tears the connection down with an explicit reason on the wire.
    pub fn disconnect_with_reason(&self, reason: DisconnectReason) {
        self.inner.disconnect(true, reason);
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state.load()
    }

    /// The established session salt (zero before the handshake completes).
    pub fn session_salt(&self) -> u64 {
        self.inner.session_salt.load(Ordering::SeqCst)
    }

    /// Local socket address, once a socket exists.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        let socket =
            self.inner.socket.lock().expect("socket poisoned").clone().ok_or(ErrorKind::NotConnected)?;
        Ok(socket.local_addr()?)
    }

    /// The peer's current endpoint (the port migrates when `Connected`
    /// arrives).
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        *self.inner.remote.lock().expect("remote poisoned")
    }

    /// Traffic counter snapshot.
    pub fn stats(&self) -> ConnectionStats {
        self.inner.stats.snapshot()
    }

    fn install_default_channels(&self) {
        let mut channels = self.inner.channels.write().expect("channels poisoned");
        for id in 0..self.inner.factory.type_count() {
            let channel: Arc<dyn Channel> = Arc::from(create_channel(
                ChannelKind::Unreliable,
                id,
                self.channel_io(),
                &self.inner.config,
            ));
            channels.insert(id, channel);
        }
    }

    /// The capability bundle channels get: header framing, pipeline access
    /// and upward delivery. Holds only a weak reference back, so channels
    /// and connection never own each other.
    fn channel_io(&self) -> ChannelIo {
        let weak = Arc::downgrade(&self.inner);
        ChannelIo {
            factory: self.inner.factory.clone(),
            write_header: {
                let weak = weak.clone();
                Arc::new(move |writer: &mut BitWriter, id: u8| {
                    if let Some(inner) = weak.upgrade() {
                        let salt = inner.session_salt.load(Ordering::SeqCst);
                        write_application_header(writer, salt, id);
                    }
                })
            },
            send: {
                let weak = weak.clone();
                Arc::new(move |datagram: Vec<u8>| {
                    if let Some(inner) = weak.upgrade() {
                        inner.send_datagram(datagram);
                    }
                })
            },
            deliver: {
                Arc::new(move |packet: Box<dyn Packet>| {
                    if let Some(inner) = weak.upgrade() {
                        let on_packet =
                            inner.callbacks.read().expect("callbacks poisoned").on_packet.clone();
                        on_packet(packet);
                    }
                })
            },
        }
    }
}

impl ConnectionInner {
    fn channel(&self, id: u8) -> Option<Arc<dyn Channel>> {
        self.channels.read().expect("channels poisoned").get(&id).cloned()
    }

    fn send_datagram(self: &Arc<Self>, datagram: Vec<u8>) {
        let pipeline = self.pipeline.lock().expect("pipeline poisoned").clone();
        let remote = *self.remote.lock().expect("remote poisoned");
        match (pipeline, remote) {
            (Some(pipeline), Some(remote)) => {
                self.stats.packets_sent.fetch_add(1, Ordering::Relaxed);
                self.stats.bytes_sent.fetch_add(datagram.len() as u64, Ordering::Relaxed);
                pipeline.send(remote, datagram);
            }
            _ => trace!("dropping send; no socket is attached"),
        }
    }

    fn send_control(self: &Arc<Self>, frame: ControlFrame) {
        self.send_datagram(frame.encode());
    }

    /// Issues one handshake send under the handshake lock, charging the
    /// retry counter.
    fn send_handshake_attempt(
        self: &Arc<Self>,
        last_attempt: &mut Instant,
        frame: ControlFrame,
    ) {
        *last_attempt = Instant::now();
        self.retries.fetch_add(1, Ordering::SeqCst);
        self.send_control(frame);
    }

    fn start_io(self: &Arc<Self>, socket: Arc<dyn DatagramSocket>) -> Result<()> {
        let epoch = self.epoch.load(Ordering::SeqCst);
        self.spawn_receive_loop(socket, epoch)?;
        self.spawn_timer(epoch)?;
        Ok(())
    }

    fn spawn_receive_loop(
        self: &Arc<Self>,
        socket: Arc<dyn DatagramSocket>,
        epoch: u64,
    ) -> Result<()> {
        let inner = Arc::clone(self);
        thread::Builder::new()
            .name("saltwire-recv".into())
            .spawn(move || {
                let mut buffer = [0u8; MAX_DATAGRAM_SIZE];
                loop {
                    if inner.epoch.load(Ordering::SeqCst) != epoch
                        || inner.state.load().is_terminal()
                    {
                        break;
                    }
                    match socket.recv_from(&mut buffer) {
                        Ok((len, from)) => inner.handle_datagram(&buffer[..len], from),
                        Err(e)
                            if e.kind() == io::ErrorKind::WouldBlock
                                || e.kind() == io::ErrorKind::TimedOut =>
                        {
                            continue;
                        }
                        Err(e) => {
                            if inner.epoch.load(Ordering::SeqCst) == epoch {
                                error!("receive failed: {}; disconnecting", e);
                                inner.disconnect(false, DisconnectReason::ClientDisconnect);
                            }
                            break;
                        }
                    }
                }
            })
            .map_err(ErrorKind::IOError)?;
        Ok(())
    }

    fn spawn_timer(self: &Arc<Self>, epoch: u64) -> Result<()> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        *self.timer_stop.lock().expect("timer_stop poisoned") = Some(stop_tx);
        let ticker = tick(self.config.timer_period());
        let inner = Arc::clone(self);
        thread::Builder::new()
            .name("saltwire-timer".into())
            .spawn(move || loop {
                crossbeam_channel::select! {
                    recv(ticker) -> _ => {
                        if !inner.on_tick(epoch) {
                            break;
                        }
                    }
                    recv(stop_rx) -> _ => break,
                }
            })
            .map_err(ErrorKind::IOError)?;
        Ok(())
    }

    /// One timer period. Returns whether the timer should keep running.
    fn on_tick(self: &Arc<Self>, epoch: u64) -> bool {
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return false;
        }
        let now = Instant::now();
        match self.state.load() {
            ConnectionState::AwaitingChallenge | ConnectionState::AwaitingConnected => {
                self.handshake_tick(now)
            }
            ConnectionState::Connected => {
                let idle = now
                    .duration_since(*self.last_received.lock().expect("last_received poisoned"));
                if idle > self.config.idle_timeout {
                    debug!("idle for {:?}; disconnecting", idle);
                    self.disconnect(true, DisconnectReason::Timeout);
                    return false;
                }
                let channels: Vec<Arc<dyn Channel>> =
                    self.channels.read().expect("channels poisoned").values().cloned().collect();
                for channel in channels {
                    channel.tick(now);
                }
                true
            }
            ConnectionState::ReadyToConnect | ConnectionState::Disconnected => false,
        }
    }

    /// Resends the due handshake frame or gives the attempt up once the
    /// retry budget is spent.
    fn handshake_tick(self: &Arc<Self>, now: Instant) -> bool {
        let mut last_attempt = self.last_attempt.lock().expect("last_attempt poisoned");
        // Re-read under the lock; the receive thread advances phases under
        // the same lock.
        let state = self.state.load();
        let (frame, failure) = match state {
            ConnectionState::AwaitingChallenge => (
                ControlFrame::Connect { client_salt: self.local_salt.load(Ordering::SeqCst) },
                ConnectStatus::NoChallengeReceived,
            ),
            ConnectionState::AwaitingConnected => (
                ControlFrame::Solution {
                    session_salt: self.session_salt.load(Ordering::SeqCst),
                },
                ConnectStatus::NoConnectedReceived,
            ),
            other => return other.is_connected(),
        };

        if now.duration_since(*last_attempt) < self.config.handshake_resend_interval {
            return true;
        }
        if self.retries.load(Ordering::SeqCst) >= self.config.handshake_retry_limit {
            drop(last_attempt);
            if self.state.transition(state, ConnectionState::ReadyToConnect) {
                warn!("handshake gave up in {:?} after {} sends", state, self.config.handshake_retry_limit);
                self.teardown_io();
                let on_connected =
                    self.callbacks.read().expect("callbacks poisoned").on_connected.clone();
                on_connected(failure);
            }
            return false;
        }
        self.send_handshake_attempt(&mut last_attempt, frame);
        true
    }

    fn handle_datagram(self: &Arc<Self>, bytes: &[u8], from: SocketAddr) {
        self.stats.packets_received.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_received.fetch_add(bytes.len() as u64, Ordering::Relaxed);

        let mut reader = BitReader::new(bytes);
        match reader.read_bool() {
            Ok(true) => match ControlFrame::decode(&mut reader) {
                Ok(frame) => self.handle_control(frame, from),
                Err(e) => {
                    trace!("dropping undecodable control frame from {}: {}", from, e);
                    self.stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
                }
            },
            Ok(false) => self.handle_application(&mut reader, from),
            Err(_) => {
                trace!("dropping empty datagram from {}", from);
                self.stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn handle_application(self: &Arc<Self>, reader: &mut BitReader<'_>, from: SocketAddr) {
        if !self.state.load().is_connected() {
            trace!("dropping application datagram while not connected");
            self.stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let salt = match reader.read_u64() {
            Ok(salt) => salt,
            Err(_) => {
                self.stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        if salt != self.session_salt.load(Ordering::SeqCst) {
            // Off-path traffic cannot know the session salt; drop silently.
            trace!("dropping datagram from {} with a foreign session salt", from);
            self.stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        *self.last_received.lock().expect("last_received poisoned") = Instant::now();

        let id = match reader.read_u8() {
            Ok(id) if id < self.factory.type_count() => id,
            _ => {
                trace!("dropping datagram with an unknown packet id");
                self.stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        if let Some(channel) = self.channel(id) {
            if let Err(e) = channel.receive(reader, id) {
                trace!("dropping undecodable packet {}: {}", id, e);
                self.stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn handle_control(self: &Arc<Self>, frame: ControlFrame, from: SocketAddr) {
        match frame {
            ControlFrame::Challenge { client_salt, server_salt } => {
                if client_salt != self.local_salt.load(Ordering::SeqCst) {
                    // Off-path attacker guessing at our salt.
                    trace!("ignoring challenge from {} with a foreign client salt", from);
                    return;
                }
                let mut last_attempt =
                    self.last_attempt.lock().expect("last_attempt poisoned");
                if !self.state.transition(
                    ConnectionState::AwaitingChallenge,
                    ConnectionState::AwaitingConnected,
                ) {
                    trace!("ignoring stale challenge");
                    return;
                }
                self.remote_salt.store(server_salt, Ordering::SeqCst);
                let session = combine_salts(client_salt, server_salt);
                self.session_salt.store(session, Ordering::SeqCst);
                self.retries.store(0, Ordering::SeqCst);
                *self.last_received.lock().expect("last_received poisoned") = Instant::now();
                debug!("challenge accepted; answering with the solution");
                self.send_handshake_attempt(
                    &mut last_attempt,
                    ControlFrame::Solution { session_salt: session },
                );
            }
            ControlFrame::Connected { session_salt, port } => {
                if session_salt == 0 || session_salt != self.session_salt.load(Ordering::SeqCst) {
                    trace!("ignoring connected frame with a foreign salt");
                    return;
                }
                let last_attempt = self.last_attempt.lock().expect("last_attempt poisoned");
                if !self.state.transition(
                    ConnectionState::AwaitingConnected,
                    ConnectionState::Connected,
                ) {
                    // The listener resends `Connected` when our solution
                    // was duplicated; already handled.
                    trace!("ignoring duplicate connected frame");
                    return;
                }
                // The listener migrated the flow to a dedicated port.
                if let Some(remote) = self.remote.lock().expect("remote poisoned").as_mut() {
                    remote.set_port(port);
                }
                self.retries.store(0, Ordering::SeqCst);
                *self.last_received.lock().expect("last_received poisoned") = Instant::now();
                drop(last_attempt);
                debug!("connection established on server port {}", port);
                let on_connected =
                    self.callbacks.read().expect("callbacks poisoned").on_connected.clone();
                on_connected(ConnectStatus::Success);
            }
            ControlFrame::Disconnect { session_salt, reason } => {
                let session = self.session_salt.load(Ordering::SeqCst);
                let local = self.local_salt.load(Ordering::SeqCst);
                // Mid-handshake refusals carry the client salt; the session
                // does not exist yet.
                let valid = (session != 0 && session_salt == session)
                    || (self.state.load().is_handshaking() && session_salt == local);
                if !valid {
                    trace!("ignoring disconnect from {} with a foreign salt", from);
                    return;
                }
                if let DisconnectReason::Other(code) = reason {
                    warn!("peer disconnected with unknown reason code {}", code);
                } else {
                    debug!("peer disconnected: {:?}", reason);
                }
                self.disconnect(false, reason);
            }
            ControlFrame::Connect { .. } | ControlFrame::Solution { .. } => {
                // Listener-bound frames; a connection never answers them.
                trace!("ignoring listener-bound control frame from {}", from);
            }
        }
    }

    /// The single disconnect body.
    ///
    /// Any number of triggers may race here (local call, peer frame, idle
    /// timeout, socket failure); the latch lets exactly one through.
    fn disconnect(self: &Arc<Self>, initiate: bool, reason: DisconnectReason) {
        if self.disconnect_latch.compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst).is_err()
        {
            return;
        }
        let previous = self.state.swap(ConnectionState::Disconnected);
        match previous {
            ConnectionState::Connected => {
                if initiate {
                    // Best effort; there is no ack for a goodbye.
                    let session_salt = self.session_salt.load(Ordering::SeqCst);
                    self.send_control(ControlFrame::Disconnect { session_salt, reason });
                }
                self.teardown_io();
                let on_disconnect =
                    self.callbacks.read().expect("callbacks poisoned").on_disconnect.clone();
                on_disconnect();
                if let Some(hook) = self.closed_hook.lock().expect("closed_hook poisoned").take() {
                    hook();
                }
                // Application closures may capture the connection; dropping
                // them here breaks the reference cycle.
                *self.callbacks.write().expect("callbacks poisoned") =
                    ConnectionCallbacks::default();
            }
            ConnectionState::AwaitingChallenge | ConnectionState::AwaitingConnected => {
                self.teardown_io();
                let on_connected =
                    self.callbacks.read().expect("callbacks poisoned").on_connected.clone();
                on_connected(ConnectStatus::Disconnect);
                *self.callbacks.write().expect("callbacks poisoned") =
                    ConnectionCallbacks::default();
            }
            ConnectionState::ReadyToConnect => {
                // Nothing ran yet; disconnecting an idle connection is a
                // no-op and the latch re-arms.
                self.state.store(ConnectionState::ReadyToConnect);
                self.disconnect_latch.store(0, Ordering::SeqCst);
            }
            ConnectionState::Disconnected => {}
        }
    }

    /// Invalidates the receive and timer loops and drops the socket.
    fn teardown_io(self: &Arc<Self>) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        *self.socket.lock().expect("socket poisoned") = None;
        *self.pipeline.lock().expect("pipeline poisoned") = None;
        self.timer_stop.lock().expect("timer_stop poisoned").take();
        self.pump_started.store(false, Ordering::SeqCst);
    }
}
