//! The listener and its callback record.

use std::{
    collections::{hash_map::Entry, HashMap, VecDeque},
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::Instant,
};

use rand::Rng;
use tracing::{debug, error, trace, warn};

use saltwire_core::{
    constants::MAX_DATAGRAM_SIZE,
    error::{ErrorKind, Result},
    transport::{bind_udp, DatagramSocket, SendPipeline},
    Config,
};
use saltwire_peer::Connection;
use saltwire_protocol::{
    bit_io::BitReader,
    packet::{Packet, PacketFactory},
    wire::{combine_salts, ControlFrame, DisconnectReason},
};

/// Application-supplied capability set a listener invokes.
#[derive(Clone)]
pub struct ListenerCallbacks {
    /// Invoked with every freshly accepted connection, before its receive
    /// pump starts. Register callbacks and channels on the connection here.
    pub on_connection: Arc<dyn Fn(Connection) + Send + Sync>,
}

impl Default for ListenerCallbacks {
    fn default() -> Self {
        ListenerCallbacks { on_connection: Arc::new(|_| {}) }
    }
}

impl std::fmt::Debug for ListenerCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerCallbacks").finish_non_exhaustive()
    }
}

/// Server-side record of a handshake awaiting its `Solution`.
#[derive(Debug, Clone, Copy)]
struct PendingHandshake {
    client_salt: u64,
    server_salt: u64,
    created_at: Instant,
}

/// Accepting endpoint of the transport.
///
/// Binds the well-known port `P`, answers only control frames, and hands
/// each verified client a dedicated port from `[P+1, P+max_clients]`. All
/// application traffic flows on the minted [`Connection`]s, never on `P`.
pub struct Listener {
    inner: Arc<ListenerInner>,
}

struct ListenerInner {
    config: Config,
    factory: Arc<dyn PacketFactory>,
    callbacks: ListenerCallbacks,
    port: u16,
    max_clients: u16,

    socket: Mutex<Option<Arc<dyn DatagramSocket>>>,
    pipeline: Mutex<Option<Arc<SendPipeline>>>,
    available_ports: Mutex<VecDeque<u16>>,
    pending: Mutex<HashMap<IpAddr, PendingHandshake>>,
    connections: Mutex<HashMap<IpAddr, Connection>>,
    running: AtomicBool,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("port", &self.inner.port)
            .field("max_clients", &self.inner.max_clients)
            .finish_non_exhaustive()
    }
}

impl Listener {
    /// Creates a listener for `port` admitting up to `max_clients`
    /// concurrent connections. Nothing binds until [`Listener::start`].
    pub fn new(
        port: u16,
        max_clients: u16,
        factory: Arc<dyn PacketFactory>,
        config: Config,
        callbacks: ListenerCallbacks,
    ) -> Listener {
        Listener {
            inner: Arc::new(ListenerInner {
                config,
                factory,
                callbacks,
                port,
                max_clients,
                socket: Mutex::new(None),
                pipeline: Mutex::new(None),
                available_ports: Mutex::new(VecDeque::new()),
                pending: Mutex::new(HashMap::new()),
                connections: Mutex::new(HashMap::new()),
                running: AtomicBool::new(false),
                accept_thread: Mutex::new(None),
            }),
        }
    }

    /// Binds the well-known port and starts answering handshakes.
    pub fn start(&self) -> Result<()> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.inner.port);
        let socket = Arc::new(bind_udp(addr, &self.inner.config)?);
        self.start_with_socket(socket)
    }

    /// [`Listener::start`] over a caller-supplied socket. The test suites
    /// use this to splice fault injectors under the listener.
    pub fn start_with_socket(&self, socket: Arc<dyn DatagramSocket>) -> Result<()> {
        let inner = &self.inner;
        if inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        {
            let mut ports = inner.available_ports.lock().expect("ports poisoned");
            ports.clear();
            for offset in 1..=inner.max_clients {
                ports.push_back(inner.port + offset);
            }
        }
        *inner.pipeline.lock().expect("pipeline poisoned") =
            Some(Arc::new(SendPipeline::new(socket.clone())));
        *inner.socket.lock().expect("socket poisoned") = Some(socket.clone());

        let accept_inner = Arc::clone(inner);
        let handle = thread::Builder::new()
            .name("saltwire-accept".into())
            .spawn(move || accept_inner.accept_loop(socket))
            .map_err(ErrorKind::IOError)?;
        *inner.accept_thread.lock().expect("accept_thread poisoned") = Some(handle);

        debug!("listener started on port {} ({} client ports)", inner.port, inner.max_clients);
        Ok(())
    }

    /// Stops the listener: closes the socket, drains pending handshakes and
    /// disconnects every live connection.
    pub fn stop(&self) {
        let inner = &self.inner;
        if !inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        *inner.socket.lock().expect("socket poisoned") = None;
        *inner.pipeline.lock().expect("pipeline poisoned") = None;
        if let Some(handle) = inner.accept_thread.lock().expect("accept_thread poisoned").take() {
            let _ = handle.join();
        }
        inner.pending.lock().expect("pending poisoned").clear();

        let connections: Vec<Connection> =
            inner.connections.lock().expect("connections poisoned").values().cloned().collect();
        for connection in connections {
            connection.disconnect_with_reason(DisconnectReason::Shutdown);
        }
        inner.connections.lock().expect("connections poisoned").clear();
        inner.available_ports.lock().expect("ports poisoned").clear();
        debug!("listener on port {} stopped", inner.port);
    }

    /// Sends one packet to every established connection.
    pub fn broadcast(&self, packet: &dyn Packet) {
        let connections: Vec<Connection> = self
            .inner
            .connections
            .lock()
            .expect("connections poisoned")
            .values()
            .cloned()
            .collect();
        for connection in connections {
            if let Err(e) = connection.send(packet) {
                trace!("broadcast skipped a connection: {}", e);
            }
        }
    }

    /// Address of the listening socket, once started.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        let socket = self
            .inner
            .socket
            .lock()
            .expect("socket poisoned")
            .clone()
            .ok_or(ErrorKind::NotConnected)?;
        Ok(socket.local_addr()?)
    }

    /// Number of established connections.
    pub fn connection_count(&self) -> usize {
        self.inner.connections.lock().expect("connections poisoned").len()
    }

    /// Number of handshakes awaiting their `Solution`.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().expect("pending poisoned").len()
    }

    /// Ports still available for new connections.
    pub fn available_ports(&self) -> usize {
        self.inner.available_ports.lock().expect("ports poisoned").len()
    }
}

impl ListenerInner {
    fn accept_loop(self: Arc<Self>, socket: Arc<dyn DatagramSocket>) {
        let mut buffer = [0u8; MAX_DATAGRAM_SIZE];
        let mut last_sweep = Instant::now();
        while self.running.load(Ordering::SeqCst) {
            let now = Instant::now();
            if now.duration_since(last_sweep) >= self.config.pending_handshake_timeout {
                self.sweep_pending(now);
                last_sweep = now;
            }
            match socket.recv_from(&mut buffer) {
                Ok((len, from)) => self.handle_datagram(&buffer[..len], from),
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) => {
                    if self.running.load(Ordering::SeqCst) {
                        error!("listener receive failed: {}", e);
                    }
                    break;
                }
            }
        }
    }

    /// Drops pending entries whose client went quiet mid-handshake.
    fn sweep_pending(&self, now: Instant) {
        let timeout = self.config.pending_handshake_timeout;
        let mut pending = self.pending.lock().expect("pending poisoned");
        let before = pending.len();
        pending.retain(|_, entry| now.duration_since(entry.created_at) < timeout);
        if pending.len() < before {
            debug!("swept {} stale pending handshakes", before - pending.len());
        }
    }

    fn handle_datagram(self: &Arc<Self>, bytes: &[u8], from: SocketAddr) {
        let mut reader = BitReader::new(bytes);
        match reader.read_bool() {
            Ok(true) => match ControlFrame::decode(&mut reader) {
                Ok(frame) => self.handle_control(frame, from),
                Err(e) => trace!("dropping undecodable control frame from {}: {}", from, e),
            },
            // The listener answers only control frames; application
            // traffic belongs on a connection's dedicated port.
            Ok(false) => trace!("dropping application datagram on the listening port"),
            Err(_) => trace!("dropping empty datagram from {}", from),
        }
    }

    fn handle_control(self: &Arc<Self>, frame: ControlFrame, from: SocketAddr) {
        match frame {
            ControlFrame::Connect { client_salt } => self.handle_connect(client_salt, from),
            ControlFrame::Solution { session_salt } => self.handle_solution(session_salt, from),
            ControlFrame::Disconnect { .. } => {
                // A client giving up mid-handshake; forget it.
                if self.pending.lock().expect("pending poisoned").remove(&from.ip()).is_some() {
                    debug!("client {} abandoned its handshake", from);
                }
            }
            ControlFrame::Challenge { .. } | ControlFrame::Connected { .. } => {
                trace!("ignoring client-bound control frame from {}", from);
            }
        }
    }

    fn handle_connect(self: &Arc<Self>, client_salt: u64, from: SocketAddr) {
        let ip = from.ip();
        if self.available_ports.lock().expect("ports poisoned").is_empty() {
            debug!("refusing {}: no ports available", from);
            self.reply(
                from,
                ControlFrame::Disconnect {
                    session_salt: client_salt,
                    reason: DisconnectReason::ServerFull,
                },
            );
            return;
        }
        if self.connections.lock().expect("connections poisoned").contains_key(&ip) {
            debug!("refusing {}: connection already exists", from);
            self.reply(
                from,
                ControlFrame::Disconnect {
                    session_salt: client_salt,
                    reason: DisconnectReason::ExistingConnection,
                },
            );
            return;
        }

        let server_salt: u64 = rand::rng().random();
        {
            let mut pending = self.pending.lock().expect("pending poisoned");
            if !pending.contains_key(&ip) && pending.len() >= self.config.max_pending_handshakes {
                warn!("pending handshake table full; dropping connect from {}", from);
                return;
            }
            // A retried Connect replaces whatever was pending for the
            // address.
            pending.insert(
                ip,
                PendingHandshake { client_salt, server_salt, created_at: Instant::now() },
            );
        }
        trace!("challenging {}", from);
        self.reply(from, ControlFrame::Challenge { client_salt, server_salt });
    }

    fn handle_solution(self: &Arc<Self>, session_salt: u64, from: SocketAddr) {
        let ip = from.ip();

        // A duplicate Solution for an established connection means our
        // Connected frame was lost; repeat it.
        {
            let connections = self.connections.lock().expect("connections poisoned");
            if let Some(existing) = connections.get(&ip) {
                if existing.session_salt() == session_salt {
                    if let Ok(addr) = existing.local_addr() {
                        debug!("repeating lost Connected for {}", from);
                        self.reply(
                            from,
                            ControlFrame::Connected { session_salt, port: addr.port() },
                        );
                    }
                }
                return;
            }
        }

        // Verify and consume the pending entry in one step; a racing
        // accept or a replaced handshake must not slip through.
        {
            let mut pending = self.pending.lock().expect("pending poisoned");
            let entry = match pending.get(&ip) {
                Some(entry) => *entry,
                None => {
                    trace!("dropping solution from {} with no pending handshake", from);
                    return;
                }
            };
            if combine_salts(entry.client_salt, entry.server_salt) != session_salt {
                trace!("dropping solution from {} with the wrong salt", from);
                return;
            }
            pending.remove(&ip);
        }

        let port = match self.available_ports.lock().expect("ports poisoned").pop_front() {
            Some(port) => port,
            None => {
                // Reserved ports ran out between Connect and Solution.
                debug!("dropping solution from {}: ports exhausted", from);
                return;
            }
        };

        let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        let connection = match Connection::accept(
            self.factory.clone(),
            self.config.clone(),
            bind_addr,
            from,
            session_salt,
        ) {
            Ok(connection) => connection,
            Err(e) => {
                error!("could not bind connection port {}: {}", port, e);
                self.available_ports.lock().expect("ports poisoned").push_back(port);
                return;
            }
        };

        {
            let mut connections = self.connections.lock().expect("connections poisoned");
            match connections.entry(ip) {
                Entry::Occupied(_) => {
                    // A concurrent accept won; dispose ours.
                    debug!("discarding racing connection for {}", from);
                    self.available_ports.lock().expect("ports poisoned").push_back(port);
                    return;
                }
                Entry::Vacant(slot) => {
                    slot.insert(connection.clone());
                }
            }
        }

        // Recycle the port and table slot when the connection dies.
        let weak = Arc::downgrade(self);
        connection.set_closed_hook(Box::new(move || {
            if let Some(listener) = weak.upgrade() {
                listener.release(ip, port, session_salt);
            }
        }));

        debug!("accepted {} on port {}", from, port);
        (self.callbacks.on_connection)(connection.clone());
        if let Err(e) = connection.start() {
            error!("could not start the receive pump for {}: {}", from, e);
        }
        self.reply(from, ControlFrame::Connected { session_salt, port });
    }

    /// Closed-connection hook: drop the table entry if it is still this
    /// session and return the port to the pool.
    fn release(&self, ip: IpAddr, port: u16, session_salt: u64) {
        {
            let mut connections = self.connections.lock().expect("connections poisoned");
            if let Some(existing) = connections.get(&ip) {
                if existing.session_salt() == session_salt {
                    connections.remove(&ip);
                }
            }
        }
        self.available_ports.lock().expect("ports poisoned").push_back(port);
        debug!("recycled port {}", port);
    }

    fn reply(&self, to: SocketAddr, frame: ControlFrame) {
        if let Some(pipeline) = self.pipeline.lock().expect("pipeline poisoned").clone() {
            pipeline.send(to, frame.encode());
        }
    }
}
