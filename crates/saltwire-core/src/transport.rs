//! Socket abstraction, bind helper and the serialized send pipeline.

use std::{
    collections::VecDeque,
    io,
    net::{SocketAddr, UdpSocket},
    sync::{Arc, Mutex},
};

use rand::{rngs::StdRng, Rng, SeedableRng};
use socket2::Socket as Socket2;
use tracing::{error, trace};

use crate::{config::Config, constants::MAX_DATAGRAM_SIZE};

/// Low-level datagram socket abstraction.
///
/// Lets fault injectors and mock transports be plugged in underneath the
/// connection and listener without coupling them to `UdpSocket`.
pub trait DatagramSocket: Send + Sync + 'static {
    /// Sends a single datagram to the given address.
    fn send_to(&self, payload: &[u8], addr: SocketAddr) -> io::Result<usize>;

    /// Receives a single datagram, honoring the socket's read timeout.
    fn recv_from(&self, buffer: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    /// Returns the local address this socket is bound to.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl DatagramSocket for UdpSocket {
    fn send_to(&self, payload: &[u8], addr: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, payload, addr)
    }

    fn recv_from(&self, buffer: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buffer)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

/// Applies socket options from configuration to a UdpSocket.
fn apply_socket_options(socket: &UdpSocket, config: &Config) -> io::Result<()> {
    // Create socket2::Socket from UdpSocket for advanced options
    let socket2 = Socket2::from(socket.try_clone()?);

    if let Some(size) = config.socket_recv_buffer_size {
        socket2.set_recv_buffer_size(size)?;
    }

    if let Some(size) = config.socket_send_buffer_size {
        socket2.set_send_buffer_size(size)?;
    }

    if let Some(ttl) = config.socket_ttl {
        socket.set_ttl(ttl)?;
    }

    Ok(())
}

/// Binds a UDP socket, applies the configured socket options and installs
/// the read timeout that bounds receive-loop shutdown latency.
pub fn bind_udp(addr: SocketAddr, config: &Config) -> io::Result<UdpSocket> {
    let socket = UdpSocket::bind(addr)?;
    apply_socket_options(&socket, config)?;
    socket.set_read_timeout(Some(config.receive_poll_timeout))?;
    Ok(socket)
}

struct PipelineState {
    sending: bool,
    queue: VecDeque<(SocketAddr, Vec<u8>)>,
}

/// Serialization point for outgoing datagrams.
///
/// At most one datagram is in flight on the underlying socket at a time;
/// datagrams submitted while a send is in progress are queued and go out in
/// FIFO order. One pipeline exists per connection and per listener.
pub struct SendPipeline {
    socket: Arc<dyn DatagramSocket>,
    state: Mutex<PipelineState>,
}

impl SendPipeline {
    /// Creates a pipeline fronting the given socket.
    pub fn new(socket: Arc<dyn DatagramSocket>) -> Self {
        SendPipeline {
            socket,
            state: Mutex::new(PipelineState { sending: false, queue: VecDeque::new() }),
        }
    }

    /// Returns the local address of the underlying socket.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Submits a framed datagram for transmission.
    ///
    /// Oversize datagrams are a programming error in the caller; they are
    /// dropped here rather than truncated on the wire.
    pub fn send(&self, to: SocketAddr, datagram: Vec<u8>) {
        if datagram.len() > MAX_DATAGRAM_SIZE {
            debug_assert!(false, "oversize datagram of {} bytes", datagram.len());
            error!("dropping oversize datagram of {} bytes (cap {})", datagram.len(), MAX_DATAGRAM_SIZE);
            return;
        }

        let mut next = {
            let mut state = self.state.lock().expect("send pipeline poisoned");
            if state.sending {
                state.queue.push_back((to, datagram));
                return;
            }
            state.sending = true;
            (to, datagram)
        };

        // This thread owns the pipeline until the queue drains.
        loop {
            if let Err(e) = self.socket.send_to(&next.1, next.0) {
                error!("error sending a datagram (to {}): {}", next.0, e);
            }
            let mut state = self.state.lock().expect("send pipeline poisoned");
            match state.queue.pop_front() {
                Some(item) => next = item,
                None => {
                    state.sending = false;
                    return;
                }
            }
        }
    }
}

/// Fault injector that drops a configurable fraction of outgoing datagrams.
///
/// Wraps any [`DatagramSocket`]; the drop decision comes from a seeded
/// generator so lossy-link tests stay reproducible.
pub struct LinkConditioner<S: DatagramSocket> {
    socket: S,
    packet_loss: f64,
    rng: Mutex<StdRng>,
}

impl<S: DatagramSocket> LinkConditioner<S> {
    /// Wraps `socket`, dropping `packet_loss` (0.0..=1.0) of sends.
    pub fn new(socket: S, packet_loss: f64, seed: u64) -> Self {
        LinkConditioner { socket, packet_loss, rng: Mutex::new(StdRng::seed_from_u64(seed)) }
    }

    fn should_drop(&self) -> bool {
        self.rng.lock().expect("conditioner rng poisoned").random::<f64>() < self.packet_loss
    }
}

impl<S: DatagramSocket> DatagramSocket for LinkConditioner<S> {
    fn send_to(&self, payload: &[u8], addr: SocketAddr) -> io::Result<usize> {
        if self.should_drop() {
            trace!("link conditioner dropped {} bytes to {}", payload.len(), addr);
            return Ok(payload.len());
        }
        self.socket.send_to(payload, addr)
    }

    fn recv_from(&self, buffer: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buffer)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct RecordingSocket {
        sent: Mutex<Vec<Vec<u8>>>,
        send_count: AtomicUsize,
    }

    impl RecordingSocket {
        fn new() -> Self {
            RecordingSocket { sent: Mutex::new(Vec::new()), send_count: AtomicUsize::new(0) }
        }
    }

    impl DatagramSocket for RecordingSocket {
        fn send_to(&self, payload: &[u8], _addr: SocketAddr) -> io::Result<usize> {
            self.sent.lock().unwrap().push(payload.to_vec());
            self.send_count.fetch_add(1, Ordering::SeqCst);
            Ok(payload.len())
        }

        fn recv_from(&self, _buffer: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
            Err(io::Error::new(io::ErrorKind::WouldBlock, "no data"))
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok("127.0.0.1:0".parse().unwrap())
        }
    }

    fn fake_addr() -> SocketAddr {
        "127.0.0.1:9999".parse().unwrap()
    }

    #[test]
    fn test_pipeline_preserves_submission_order() {
        let socket = Arc::new(RecordingSocket::new());
        let pipeline = SendPipeline::new(socket.clone());

        for i in 0..10u8 {
            pipeline.send(fake_addr(), vec![i]);
        }

        let sent = socket.sent.lock().unwrap();
        let order: Vec<u8> = sent.iter().map(|d| d[0]).collect();
        assert_eq!(order, (0..10).collect::<Vec<u8>>());
    }

    #[test]
    fn test_pipeline_drops_oversize_datagrams() {
        let socket = Arc::new(RecordingSocket::new());
        let pipeline = SendPipeline::new(socket.clone());

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            pipeline.send(fake_addr(), vec![0u8; MAX_DATAGRAM_SIZE + 1]);
        }));
        // Debug builds assert; release builds drop. Either way nothing hits
        // the socket.
        let _ = result;
        assert_eq!(socket.send_count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_conditioner_with_full_loss_sends_nothing() {
        let inner = RecordingSocket::new();
        let conditioned = LinkConditioner::new(inner, 1.0, 42);
        conditioned.send_to(&[1, 2, 3], fake_addr()).unwrap();
        assert_eq!(conditioned.socket.send_count.load(Ordering::SeqCst), 0);
    }
}
