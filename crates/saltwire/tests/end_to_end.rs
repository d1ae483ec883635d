//! Full-stack scenarios: reliability under loss, ordering under loss and
//! listener broadcast, all over real loopback sockets.

use std::{
    net::{SocketAddr, UdpSocket},
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{unbounded, Receiver};

use saltwire::prelude::*;
use saltwire_core::transport::{bind_udp, LinkConditioner};

struct ValuePacket {
    value: u16,
}

impl Packet for ValuePacket {
    fn id(&self) -> u8 {
        0
    }

    fn write(&self, writer: &mut BitWriter) {
        writer.write_u16(self.value);
    }

    fn read(&mut self, reader: &mut BitReader<'_>) -> saltwire::Result<()> {
        self.value = reader.read_u16()?;
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

struct ValueFactory;

impl PacketFactory for ValueFactory {
    fn type_count(&self) -> u8 {
        1
    }

    fn create(&self, id: u8) -> Option<Box<dyn Packet>> {
        (id == 0).then(|| Box::new(ValuePacket { value: 0 }) as Box<dyn Packet>)
    }
}

fn fast_config() -> Config {
    Config {
        handshake_resend_interval: Duration::from_millis(100),
        resend_interval: Duration::from_millis(80),
        receive_poll_timeout: Duration::from_millis(20),
        ..Config::default()
    }
}

/// Finds a listener port whose client-port block is currently free.
fn reserve_ports(count: u16) -> u16 {
    for _ in 0..16 {
        let probe = match UdpSocket::bind("127.0.0.1:0") {
            Ok(socket) => socket,
            Err(_) => continue,
        };
        let base = probe.local_addr().unwrap().port();
        if base.checked_add(count).is_none() {
            continue;
        }
        let mut held = Vec::new();
        let mut free = true;
        for offset in 1..=count {
            match UdpSocket::bind(("127.0.0.1", base + offset)) {
                Ok(socket) => held.push(socket),
                Err(_) => {
                    free = false;
                    break;
                }
            }
        }
        if free {
            return base;
        }
    }
    panic!("could not reserve a contiguous port block");
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    condition()
}

/// Listener whose accepted connections collect every received value.
fn collecting_listener(
    port: u16,
    kind: ChannelKind,
    config: Config,
) -> (Listener, Arc<Mutex<Vec<u16>>>) {
    let delivered = Arc::new(Mutex::new(Vec::new()));
    let sink = delivered.clone();
    let callbacks = ListenerCallbacks {
        on_connection: Arc::new(move |connection: Connection| {
            connection.set_packet_channel(0, kind).unwrap();
            let sink = sink.clone();
            connection.set_callbacks(ConnectionCallbacks {
                on_packet: Arc::new(move |packet| {
                    let value = packet.as_any().downcast_ref::<ValuePacket>().unwrap().value;
                    sink.lock().unwrap().push(value);
                }),
                ..ConnectionCallbacks::default()
            });
        }),
    };
    let listener = Listener::new(port, 1, Arc::new(ValueFactory), config, callbacks);
    (listener, delivered)
}

/// Client whose outgoing datagrams cross a seeded lossy link. The retry
/// budget is widened so a lossy handshake still converges.
fn connected_client(
    port: u16,
    kind: ChannelKind,
    config: Config,
    loss: f64,
    seed: u64,
) -> (Connection, Receiver<ConnectStatus>) {
    let config = Config { handshake_retry_limit: 20, ..config };
    let (tx, statuses) = unbounded();
    let callbacks = ConnectionCallbacks {
        on_connected: Arc::new(move |status| {
            tx.send(status).unwrap();
        }),
        ..ConnectionCallbacks::default()
    };
    let connection = Connection::new(Arc::new(ValueFactory), config.clone(), callbacks);
    connection.set_packet_channel(0, kind).unwrap();

    let socket = bind_udp("0.0.0.0:0".parse().unwrap(), &config).unwrap();
    let lossy = LinkConditioner::new(socket, loss, seed);
    connection
        .connect_with_socket(Arc::new(lossy), SocketAddr::from(([127, 0, 0, 1], port)))
        .unwrap();
    (connection, statuses)
}

#[test]
fn test_reliable_delivery_is_exactly_once_under_heavy_loss() {
    let base = reserve_ports(1);
    let (listener, delivered) = collecting_listener(base, ChannelKind::Reliable, fast_config());
    listener.start().unwrap();

    let (connection, statuses) =
        connected_client(base, ChannelKind::Reliable, fast_config(), 0.5, 7);
    assert_eq!(
        statuses.recv_timeout(Duration::from_secs(5)).unwrap(),
        ConnectStatus::Success
    );

    const COUNT: u16 = 1000;
    for value in 0..COUNT {
        connection.send(&ValuePacket { value }).unwrap();
    }

    // Half the frames vanish on first transmission; retransmission must
    // land every value exactly once.
    assert!(wait_until(Duration::from_secs(15), || {
        delivered.lock().unwrap().len() >= COUNT as usize
    }));
    let mut values = delivered.lock().unwrap().clone();
    values.sort_unstable();
    assert_eq!(values, (0..COUNT).collect::<Vec<u16>>());

    connection.disconnect();
    listener.stop();
}

#[test]
fn test_ordered_delivery_preserves_sender_order_under_loss() {
    let base = reserve_ports(1);
    // A roomy reorder buffer keeps the gap-skip policy out of this
    // scenario; overflow behavior has its own unit coverage.
    let config = Config { reorder_buffer_size: 256, ..fast_config() };
    let (listener, delivered) =
        collecting_listener(base, ChannelKind::OrderedReliable, config.clone());
    listener.start().unwrap();

    let (connection, statuses) =
        connected_client(base, ChannelKind::OrderedReliable, config, 0.25, 11);
    assert_eq!(
        statuses.recv_timeout(Duration::from_secs(5)).unwrap(),
        ConnectStatus::Success
    );

    const COUNT: u16 = 200;
    for value in 0..COUNT {
        connection.send(&ValuePacket { value }).unwrap();
        thread::sleep(Duration::from_millis(3));
    }

    assert!(wait_until(Duration::from_secs(15), || {
        delivered.lock().unwrap().len() >= COUNT as usize
    }));
    // Not just complete: delivered in exactly the submission order.
    assert_eq!(*delivered.lock().unwrap(), (0..COUNT).collect::<Vec<u16>>());

    connection.disconnect();
    listener.stop();
}

#[test]
fn test_application_datagrams_with_a_foreign_salt_are_never_delivered() {
    let base = reserve_ports(1);
    let (listener, delivered) = collecting_listener(base, ChannelKind::Unreliable, fast_config());
    listener.start().unwrap();

    let (connection, statuses) =
        connected_client(base, ChannelKind::Unreliable, fast_config(), 0.0, 1);
    assert_eq!(
        statuses.recv_timeout(Duration::from_secs(2)).unwrap(),
        ConnectStatus::Success
    );

    // An off-path attacker knows the connection port but not the session
    // salt; its frames must vanish without reaching the handler.
    let attacker = UdpSocket::bind("127.0.0.1:0").unwrap();
    let target = SocketAddr::from(([127, 0, 0, 1], base + 1));
    let mut forged = BitWriter::new();
    forged.write_bool(false);
    forged.write_u64(connection.session_salt() ^ 1);
    forged.write_u8(0);
    forged.write_u16(0xDEAD);
    attacker.send_to(&forged.finish(), target).unwrap();

    connection.send(&ValuePacket { value: 7 }).unwrap();
    assert!(wait_until(Duration::from_secs(2), || *delivered.lock().unwrap() == [7]));

    connection.disconnect();
    listener.stop();
}

#[test]
fn test_broadcast_reaches_established_connections() {
    let base = reserve_ports(1);
    let (listener, _delivered) =
        collecting_listener(base, ChannelKind::Reliable, fast_config());
    listener.start().unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    let (tx, statuses) = unbounded();
    let callbacks = ConnectionCallbacks {
        on_connected: Arc::new(move |status| {
            tx.send(status).unwrap();
        }),
        on_packet: {
            let received = received.clone();
            Arc::new(move |packet| {
                let value = packet.as_any().downcast_ref::<ValuePacket>().unwrap().value;
                received.lock().unwrap().push(value);
            })
        },
        ..ConnectionCallbacks::default()
    };
    let connection = Connection::new(Arc::new(ValueFactory), fast_config(), callbacks);
    connection.set_packet_channel(0, ChannelKind::Reliable).unwrap();
    connection.connect(SocketAddr::from(([127, 0, 0, 1], base))).unwrap();
    assert_eq!(
        statuses.recv_timeout(Duration::from_secs(2)).unwrap(),
        ConnectStatus::Success
    );

    listener.broadcast(&ValuePacket { value: 42 });

    assert!(wait_until(Duration::from_secs(2), || *received.lock().unwrap() == [42]));

    connection.disconnect();
    listener.stop();
}
