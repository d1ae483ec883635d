//! The channel abstraction and its three reliability variants.
//!
//! A channel is the per-packet-id delivery policy plugged into a
//! connection's send/receive pipeline. Channels and connections reference
//! each other cyclically in spirit; here the cycle is broken by an explicit
//! capability bundle ([`ChannelIo`]) handed down at construction. The
//! connection writes framing and transmits buffers; the channel decides
//! what metadata surrounds the packet body and when a decoded packet moves
//! upward.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use tracing::{trace, warn};

use saltwire_core::{
    error::{ErrorKind, Result},
    Config,
};

use crate::{
    acknowledgment::AckState,
    bit_io::{BitReader, BitWriter},
    packet::{Packet, PacketFactory},
    sequence_buffer::{sequence_less_than, SequenceNumber},
};

/// Capabilities a channel borrows from its connection.
///
/// `write_header` frames a fresh writer (discriminator, session salt,
/// packet id), `send` hands a finished datagram to the connection's send
/// pipeline, `deliver` raises a decoded packet to the application hook.
/// Neither side owns the other; connections hold channels boxed and
/// channels hold these closures.
#[derive(Clone)]
pub struct ChannelIo {
    /// Maps packet ids to fresh instances while decoding.
    pub factory: Arc<dyn PacketFactory>,
    /// Writes the application framing for the given packet id.
    pub write_header: Arc<dyn Fn(&mut BitWriter, u8) + Send + Sync>,
    /// Submits a finished datagram to the connection's send pipeline.
    pub send: Arc<dyn Fn(Vec<u8>) + Send + Sync>,
    /// Delivers a decoded packet to the application.
    pub deliver: Arc<dyn Fn(Box<dyn Packet>) + Send + Sync>,
}

/// The three delivery policies a packet id can be registered under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Fire-and-forget; no metadata, no retransmission.
    Unreliable,
    /// Retransmitted until acked, deduplicated, delivered as received.
    Reliable,
    /// Reliable plus a reorder buffer releasing packets in sender order.
    OrderedReliable,
}

/// Per-packet-id delivery policy.
pub trait Channel: Send + Sync {
    /// Frames and transmits an application packet, appending whatever
    /// metadata the policy requires.
    fn send(&self, packet: &dyn Packet) -> Result<()>;

    /// Consumes a received datagram positioned past the application
    /// framing; decides whether and when the packet moves upward.
    fn receive(&self, reader: &mut BitReader<'_>, id: u8) -> Result<()>;

    /// Timer hook; retransmits whatever is overdue.
    fn tick(&self, now: Instant);
}

/// Builds a channel of the given kind for packet id `id` against a
/// connection's capabilities.
pub fn create_channel(
    kind: ChannelKind,
    id: u8,
    io: ChannelIo,
    config: &Config,
) -> Box<dyn Channel> {
    match kind {
        ChannelKind::Unreliable => Box::new(UnreliableChannel::new(io)),
        ChannelKind::Reliable => Box::new(ReliableChannel::new(id, io, config)),
        ChannelKind::OrderedReliable => Box::new(OrderedReliableChannel::new(id, io, config)),
    }
}

// ============================================================================
// Unreliable
// ============================================================================

/// Stateless channel: no metadata, delivery happens at most once because
/// delivery happens immediately.
pub struct UnreliableChannel {
    io: ChannelIo,
}

impl UnreliableChannel {
    /// Creates the channel.
    pub fn new(io: ChannelIo) -> Self {
        UnreliableChannel { io }
    }
}

impl Channel for UnreliableChannel {
    fn send(&self, packet: &dyn Packet) -> Result<()> {
        let mut writer = BitWriter::new();
        (self.io.write_header)(&mut writer, packet.id());
        packet.write(&mut writer);
        (self.io.send)(writer.finish());
        Ok(())
    }

    fn receive(&self, reader: &mut BitReader<'_>, id: u8) -> Result<()> {
        let mut packet = self.io.factory.create(id).ok_or(ErrorKind::UnknownPacketId(id))?;
        packet.read(reader)?;
        (self.io.deliver)(packet);
        Ok(())
    }

    fn tick(&self, _now: Instant) {}
}

// ============================================================================
// Reliable
// ============================================================================

struct ReliableInner {
    acks: AckState,
    /// Packet bodies held back while the in-flight span sits at the
    /// window edge; drained as acks arrive.
    waiting: VecDeque<(Vec<u8>, usize)>,
}

/// Retransmitting channel.
///
/// Outbound data frames carry `[1][ack][ack vector][sequence]` ahead of
/// the packet body and are retained until acknowledged; the timer emits a
/// sequence-less `[0][ack][ack vector]` frame when acks are owed and no
/// data is flowing back. Sequences are only issued inside the ack window
/// of the oldest unacknowledged one, so a retransmit can never fall behind
/// the peer's dedup horizon. Inbound sequences are deduplicated against
/// the receive window; surviving packets are delivered in arrival order.
pub struct ReliableChannel {
    io: ChannelIo,
    id: u8,
    resend_interval: Duration,
    max_waiting: u16,
    inner: Mutex<ReliableInner>,
}

impl ReliableChannel {
    /// Creates the channel for packet id `id`.
    pub fn new(id: u8, io: ChannelIo, config: &Config) -> Self {
        ReliableChannel {
            io,
            id,
            resend_interval: config.resend_interval,
            max_waiting: config.max_packets_in_flight,
            inner: Mutex::new(ReliableInner {
                acks: AckState::new(config.ack_window_size),
                waiting: VecDeque::new(),
            }),
        }
    }

    /// Retained datagrams not yet acknowledged by the peer.
    pub fn in_flight(&self) -> u16 {
        self.inner.lock().expect("channel state poisoned").acks.in_flight()
    }

    /// Frames and transmits one body under the channel mutex so sequence
    /// order and pipeline order cannot diverge.
    fn frame_and_send(&self, inner: &mut ReliableInner, body: (Vec<u8>, usize)) {
        let sequence = inner.acks.next_sequence();
        let mut writer = BitWriter::new();
        (self.io.write_header)(&mut writer, self.id);
        writer.write_bool(true);
        writer.write_u16(inner.acks.ack());
        writer.write_u32(inner.acks.ack_vector());
        writer.write_u16(sequence);
        writer.append_bits(&body.0, body.1);
        let datagram = writer.finish();

        inner.acks.record_sent(sequence, datagram.clone(), Instant::now());
        (self.io.send)(datagram);
    }

    fn flush_waiting(&self, inner: &mut ReliableInner) {
        while inner.acks.can_send() {
            match inner.waiting.pop_front() {
                Some(body) => self.frame_and_send(inner, body),
                None => break,
            }
        }
    }

    fn send_sequenced(&self, packet: &dyn Packet) -> Result<()> {
        let mut body = BitWriter::new();
        packet.write(&mut body);
        let body = body.into_parts();

        let mut inner = self.inner.lock().expect("channel state poisoned");
        if inner.acks.can_send() {
            self.frame_and_send(&mut inner, body);
        } else {
            inner.waiting.push_back(body);
            if inner.waiting.len() == self.max_waiting as usize {
                warn!(
                    "{} reliable packets waiting on channel {}; peer is acking slowly",
                    inner.waiting.len(),
                    self.id
                );
            }
        }
        Ok(())
    }

    /// Parses reliability metadata, applies acks and deduplicates.
    ///
    /// Returns the decoded packet and its sequence; `None` for ack-only
    /// frames and duplicates, which must not be delivered.
    fn receive_sequenced(
        &self,
        reader: &mut BitReader<'_>,
        id: u8,
    ) -> Result<Option<(SequenceNumber, Box<dyn Packet>)>> {
        let has_data = reader.read_bool()?;
        let ack = reader.read_u16()?;
        let ack_vector = reader.read_u32()?;
        let sequence = if has_data { Some(reader.read_u16()?) } else { None };

        let fresh = {
            let mut inner = self.inner.lock().expect("channel state poisoned");
            inner.acks.process_acks(ack, ack_vector);
            self.flush_waiting(&mut inner);
            match sequence {
                Some(sequence) => inner.acks.record_received(sequence),
                None => return Ok(None),
            }
        };
        let sequence = sequence.expect("checked above");
        if !fresh {
            trace!("dropping duplicate reliable sequence {}", sequence);
            return Ok(None);
        }

        let mut packet = self.io.factory.create(id).ok_or(ErrorKind::UnknownPacketId(id))?;
        packet.read(reader)?;
        Ok(Some((sequence, packet)))
    }
}

impl Channel for ReliableChannel {
    fn send(&self, packet: &dyn Packet) -> Result<()> {
        self.send_sequenced(packet)
    }

    fn receive(&self, reader: &mut BitReader<'_>, id: u8) -> Result<()> {
        if let Some((_, packet)) = self.receive_sequenced(reader, id)? {
            (self.io.deliver)(packet);
        }
        Ok(())
    }

    fn tick(&self, now: Instant) {
        let (resends, ack_frame) = {
            let mut inner = self.inner.lock().expect("channel state poisoned");
            let resends = inner.acks.due_for_resend(now, self.resend_interval);
            self.flush_waiting(&mut inner);
            // Resends and fresh data carry acks already; only a silent
            // receiver owes the peer a standalone ack frame.
            let ack_frame = if inner.acks.take_acks_dirty() {
                let mut writer = BitWriter::new();
                (self.io.write_header)(&mut writer, self.id);
                writer.write_bool(false);
                writer.write_u16(inner.acks.ack());
                writer.write_u32(inner.acks.ack_vector());
                Some(writer.finish())
            } else {
                None
            };
            (resends, ack_frame)
        };
        for datagram in resends {
            (self.io.send)(datagram);
        }
        if let Some(datagram) = ack_frame {
            (self.io.send)(datagram);
        }
    }
}

// ============================================================================
// Ordered reliable
// ============================================================================

struct ReorderState {
    next_expected: SequenceNumber,
    buffered: HashMap<SequenceNumber, Box<dyn Packet>>,
    capacity: usize,
}

impl ReorderState {
    /// Accepts a deduplicated packet and returns whatever became
    /// deliverable, in sequence order.
    fn accept(
        &mut self,
        sequence: SequenceNumber,
        packet: Box<dyn Packet>,
    ) -> Vec<Box<dyn Packet>> {
        if sequence_less_than(sequence, self.next_expected) {
            // Behind the cursor: either a late arrival for a gap that was
            // already skipped, or ancient traffic.
            trace!("dropping sequence {} behind ordered cursor {}", sequence, self.next_expected);
            return Vec::new();
        }

        self.buffered.insert(sequence, packet);
        let mut ready = self.drain();

        if ready.is_empty() && self.buffered.len() > self.capacity {
            // The oldest gap is treated as permanently lost; jump the
            // cursor to the oldest buffered sequence and release from
            // there. Under sustained loss ordered weakens to reliable.
            let oldest = self
                .buffered
                .keys()
                .copied()
                .min_by_key(|seq| seq.wrapping_sub(self.next_expected))
                .expect("buffer is non-empty");
            warn!(
                "reorder buffer over capacity; skipping gap {}..{}",
                self.next_expected, oldest
            );
            self.next_expected = oldest;
            ready = self.drain();
        }

        ready
    }

    fn drain(&mut self) -> Vec<Box<dyn Packet>> {
        let mut ready = Vec::new();
        while let Some(packet) = self.buffered.remove(&self.next_expected) {
            ready.push(packet);
            self.next_expected = self.next_expected.wrapping_add(1);
        }
        ready
    }
}

/// Reliable delivery plus sender ordering.
///
/// Wire format is identical to [`ReliableChannel`]; the receive side adds a
/// next-expected cursor and a bounded reorder buffer.
pub struct OrderedReliableChannel {
    reliable: ReliableChannel,
    reorder: Mutex<ReorderState>,
}

impl OrderedReliableChannel {
    /// Creates the channel for packet id `id`.
    pub fn new(id: u8, io: ChannelIo, config: &Config) -> Self {
        OrderedReliableChannel {
            reliable: ReliableChannel::new(id, io, config),
            reorder: Mutex::new(ReorderState {
                next_expected: 0,
                buffered: HashMap::new(),
                capacity: config.reorder_buffer_size as usize,
            }),
        }
    }
}

impl Channel for OrderedReliableChannel {
    fn send(&self, packet: &dyn Packet) -> Result<()> {
        self.reliable.send_sequenced(packet)
    }

    fn receive(&self, reader: &mut BitReader<'_>, id: u8) -> Result<()> {
        if let Some((sequence, packet)) = self.reliable.receive_sequenced(reader, id)? {
            let ready = {
                let mut reorder = self.reorder.lock().expect("reorder state poisoned");
                reorder.accept(sequence, packet)
            };
            for packet in ready {
                (self.reliable.io.deliver)(packet);
            }
        }
        Ok(())
    }

    fn tick(&self, now: Instant) {
        self.reliable.tick(now);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::wire::write_application_header;

    const SALT: u64 = 0x5A17_5A17_5A17_5A17;

    struct TestPacket {
        id: u8,
        value: u64,
    }

    impl Packet for TestPacket {
        fn id(&self) -> u8 {
            self.id
        }

        fn write(&self, writer: &mut BitWriter) {
            writer.write_u64(self.value);
        }

        fn read(&mut self, reader: &mut BitReader<'_>) -> Result<()> {
            self.value = reader.read_u64()?;
            Ok(())
        }

        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    struct TestFactory;

    impl PacketFactory for TestFactory {
        fn type_count(&self) -> u8 {
            3
        }

        fn create(&self, id: u8) -> Option<Box<dyn Packet>> {
            (id < 3).then(|| Box::new(TestPacket { id, value: 0 }) as Box<dyn Packet>)
        }
    }

    struct Harness {
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
        delivered: Arc<Mutex<Vec<u64>>>,
    }

    impl Harness {
        fn new() -> (Self, ChannelIo) {
            let sent = Arc::new(Mutex::new(Vec::new()));
            let delivered = Arc::new(Mutex::new(Vec::new()));
            let io = ChannelIo {
                factory: Arc::new(TestFactory),
                write_header: Arc::new(|writer, id| write_application_header(writer, SALT, id)),
                send: {
                    let sent = sent.clone();
                    Arc::new(move |datagram| sent.lock().unwrap().push(datagram))
                },
                deliver: {
                    let delivered = delivered.clone();
                    Arc::new(move |packet| {
                        let value = packet.as_any().downcast_ref::<TestPacket>().unwrap().value;
                        delivered.lock().unwrap().push(value);
                    })
                },
            };
            (Harness { sent, delivered }, io)
        }

        fn take_sent(&self) -> Vec<Vec<u8>> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }

        fn delivered(&self) -> Vec<u64> {
            self.delivered.lock().unwrap().clone()
        }
    }

    /// Plays a framed datagram into a channel the way a connection would:
    /// strip the framing, then hand over the reader.
    fn feed(channel: &dyn Channel, datagram: &[u8]) {
        let mut reader = BitReader::new(datagram);
        assert!(!reader.read_bool().unwrap());
        assert_eq!(reader.read_u64().unwrap(), SALT);
        let id = reader.read_u8().unwrap();
        channel.receive(&mut reader, id).unwrap();
    }

    #[test]
    fn test_unreliable_roundtrip() {
        let (sender, sender_io) = Harness::new();
        let (receiver, receiver_io) = Harness::new();
        let tx = UnreliableChannel::new(sender_io);
        let rx = UnreliableChannel::new(receiver_io);

        tx.send(&TestPacket { id: 1, value: 99 }).unwrap();
        let datagrams = sender.take_sent();
        assert_eq!(datagrams.len(), 1);
        feed(&rx, &datagrams[0]);
        assert_eq!(receiver.delivered(), vec![99]);
    }

    #[test]
    fn test_reliable_drops_duplicates() {
        let config = Config::default();
        let (sender, sender_io) = Harness::new();
        let (receiver, receiver_io) = Harness::new();
        let tx = ReliableChannel::new(0, sender_io, &config);
        let rx = ReliableChannel::new(0, receiver_io, &config);

        tx.send(&TestPacket { id: 0, value: 7 }).unwrap();
        let datagram = sender.take_sent().remove(0);
        feed(&rx, &datagram);
        feed(&rx, &datagram);
        assert_eq!(receiver.delivered(), vec![7]);
    }

    #[test]
    fn test_reliable_retransmits_until_acked() {
        let config = Config::default();
        let (sender, sender_io) = Harness::new();
        let (receiver, receiver_io) = Harness::new();
        let tx = ReliableChannel::new(0, sender_io, &config);
        let rx = ReliableChannel::new(0, receiver_io, &config);

        tx.send(&TestPacket { id: 0, value: 1 }).unwrap();
        assert_eq!(tx.in_flight(), 1);
        let original = sender.take_sent().remove(0);

        // Not yet due, then due: same bytes go out again.
        let now = Instant::now();
        tx.tick(now);
        assert!(sender.take_sent().is_empty());
        tx.tick(now + config.resend_interval * 2);
        assert_eq!(sender.take_sent(), vec![original.clone()]);

        // The receiver sees the packet and its ack rides back on a reply.
        feed(&rx, &original);
        rx.send(&TestPacket { id: 0, value: 2 }).unwrap();
        let reply = receiver.take_sent().remove(0);
        feed(&tx, &reply);
        assert_eq!(tx.in_flight(), 0);

        // Nothing left to retransmit; the one outstanding send is the ack
        // owed for the reply, which delivers no packet.
        tx.tick(now + config.resend_interval * 4);
        let frames = sender.take_sent();
        assert_eq!(frames.len(), 1);
        feed(&rx, &frames[0]);
        assert_eq!(receiver.delivered(), vec![1]);
        tx.tick(now + config.resend_interval * 6);
        assert!(sender.take_sent().is_empty());
    }

    #[test]
    fn test_reliable_tick_emits_ack_only_frames_for_a_silent_receiver() {
        let config = Config::default();
        let (sender, sender_io) = Harness::new();
        let (receiver, receiver_io) = Harness::new();
        let tx = ReliableChannel::new(0, sender_io, &config);
        let rx = ReliableChannel::new(0, receiver_io, &config);

        tx.send(&TestPacket { id: 0, value: 3 }).unwrap();
        feed(&rx, &sender.take_sent().remove(0));

        // The receiver has no data of its own; its timer owes an ack.
        rx.tick(Instant::now());
        let acks = receiver.take_sent();
        assert_eq!(acks.len(), 1);
        feed(&tx, &acks[0]);
        assert_eq!(tx.in_flight(), 0);
        // Ack-only frames deliver nothing upward.
        assert_eq!(sender.delivered(), Vec::<u64>::new());

        // Nothing further owed once the ack went out.
        rx.tick(Instant::now());
        assert!(receiver.take_sent().is_empty());
    }

    #[test]
    fn test_reliable_sends_queue_at_the_window_edge() {
        let config = Config { ack_window_size: 4, ..Config::default() };
        let (sender, sender_io) = Harness::new();
        let (receiver, receiver_io) = Harness::new();
        let tx = ReliableChannel::new(0, sender_io, &config);
        let rx = ReliableChannel::new(0, receiver_io, &config);

        for value in 0..6u64 {
            tx.send(&TestPacket { id: 0, value }).unwrap();
        }
        // Only a window's worth went on the wire; the rest wait for acks.
        let first = sender.take_sent();
        assert_eq!(first.len(), 4);
        assert_eq!(tx.in_flight(), 4);

        for datagram in &first {
            feed(&rx, datagram);
        }
        rx.tick(Instant::now());
        feed(&tx, &receiver.take_sent().remove(0));

        // The acks opened the window and flushed the queue in order.
        let flushed = sender.take_sent();
        assert_eq!(flushed.len(), 2);
        for datagram in &flushed {
            feed(&rx, datagram);
        }
        assert_eq!(receiver.delivered(), vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_ordered_releases_contiguous_prefix() {
        let config = Config::default();
        let (sender, sender_io) = Harness::new();
        let (receiver, receiver_io) = Harness::new();
        let tx = OrderedReliableChannel::new(2, sender_io, &config);
        let rx = OrderedReliableChannel::new(2, receiver_io, &config);

        for value in 0..3u64 {
            tx.send(&TestPacket { id: 2, value }).unwrap();
        }
        let datagrams = sender.take_sent();

        // Arrivals: 0, then 2 (held back), then 1 (releases 1 and 2).
        feed(&rx, &datagrams[0]);
        assert_eq!(receiver.delivered(), vec![0]);
        feed(&rx, &datagrams[2]);
        assert_eq!(receiver.delivered(), vec![0]);
        feed(&rx, &datagrams[1]);
        assert_eq!(receiver.delivered(), vec![0, 1, 2]);
    }

    #[test]
    fn test_ordered_overflow_skips_the_gap() {
        let config = Config { reorder_buffer_size: 2, ..Config::default() };
        let (sender, sender_io) = Harness::new();
        let (receiver, receiver_io) = Harness::new();
        let tx = OrderedReliableChannel::new(2, sender_io, &config);
        let rx = OrderedReliableChannel::new(2, receiver_io, &config);

        for value in 0..4u64 {
            tx.send(&TestPacket { id: 2, value }).unwrap();
        }
        let datagrams = sender.take_sent();

        // Sequence 0 never arrives. 1 and 2 sit in the buffer; 3 overflows
        // it, the gap is abandoned and everything buffered is released.
        feed(&rx, &datagrams[1]);
        feed(&rx, &datagrams[2]);
        assert_eq!(receiver.delivered(), Vec::<u64>::new());
        feed(&rx, &datagrams[3]);
        assert_eq!(receiver.delivered(), vec![1, 2, 3]);

        // The skipped sequence finally arrives and is dropped.
        feed(&rx, &datagrams[0]);
        assert_eq!(receiver.delivered(), vec![1, 2, 3]);
    }
}
