//! Ack bookkeeping for reliable channels.
//!
//! Tracks outgoing sequence numbers, retains framed datagrams until the
//! peer acknowledges them, and mirrors the peer's traffic in a
//! [`ReceiveWindow`] so every outbound frame can piggyback an ack vector.
//!
//! The in-flight span is bounded by the ack window: a sequence is only
//! issued while it stays within the window of the oldest unacknowledged
//! one. That bound is what makes the receive-side horizon safe; a
//! retransmit can never fall so far behind that it is mistaken for a
//! duplicate.

use std::{collections::HashMap, time::Instant};

use crate::sequence_buffer::{ReceiveWindow, SequenceNumber};

/// A reliable datagram retained for retransmission.
#[derive(Debug, Clone)]
struct SentDatagram {
    datagram: Vec<u8>,
    last_sent: Instant,
}

/// Per-channel reliability state.
///
/// Lives behind the channel's mutex; nothing here synchronizes on its own.
#[derive(Debug)]
pub struct AckState {
    next_sequence: SequenceNumber,
    sent: HashMap<SequenceNumber, SentDatagram>,
    received: ReceiveWindow,
    window: u16,
    /// Set when the peer sent us something it has not been acked for yet.
    acks_dirty: bool,
}

impl AckState {
    /// Creates state with a receive window of `ack_window + 1` sequences
    /// and an in-flight bound of `ack_window`.
    pub fn new(ack_window: u16) -> Self {
        AckState {
            next_sequence: 0,
            sent: HashMap::new(),
            received: ReceiveWindow::with_capacity(ack_window + 1),
            window: ack_window,
            acks_dirty: false,
        }
    }

    /// True while another sequence may be issued without outrunning the
    /// peer's dedup window.
    pub fn can_send(&self) -> bool {
        match self.oldest_unacked() {
            Some(oldest) => self.next_sequence.wrapping_sub(oldest) < self.window,
            None => true,
        }
    }

    fn oldest_unacked(&self) -> Option<SequenceNumber> {
        self.sent.keys().copied().max_by_key(|seq| self.next_sequence.wrapping_sub(*seq))
    }

    /// Claims the sequence number for the next outgoing datagram.
    pub fn next_sequence(&mut self) -> SequenceNumber {
        let sequence = self.next_sequence;
        self.next_sequence = sequence.wrapping_add(1);
        sequence
    }

    /// Newest sequence received from the peer; goes out as the `ack` field.
    pub fn ack(&self) -> SequenceNumber {
        self.received.newest()
    }

    /// Ack vector over the window behind [`AckState::ack`].
    pub fn ack_vector(&self) -> u32 {
        self.received.ack_vector()
    }

    /// Number of retained, unacknowledged datagrams.
    pub fn in_flight(&self) -> u16 {
        self.sent.len() as u16
    }

    /// Retains a framed datagram until the peer acknowledges its sequence.
    /// The frame carried our current ack state, so the peer is up to date.
    pub fn record_sent(&mut self, sequence: SequenceNumber, datagram: Vec<u8>, now: Instant) {
        self.sent.insert(sequence, SentDatagram { datagram, last_sent: now });
        self.acks_dirty = false;
    }

    /// Records an incoming sequence. Returns `false` for duplicates and
    /// sequences that have left the window; those must not be delivered.
    ///
    /// Duplicates still mark acks as owed: the peer resending means our
    /// last ack never reached it.
    pub fn record_received(&mut self, sequence: SequenceNumber) -> bool {
        self.acks_dirty = true;
        self.received.record(sequence)
    }

    /// Applies a piggybacked ack field: `ack` itself plus one bit per
    /// sequence behind it. Acknowledged datagrams are released.
    pub fn process_acks(&mut self, ack: SequenceNumber, mut ack_vector: u32) {
        self.sent.remove(&ack);
        for i in 1..=32u16 {
            if ack_vector == 0 {
                break;
            }
            if ack_vector & 1 != 0 {
                self.sent.remove(&ack.wrapping_sub(i));
            }
            ack_vector >>= 1;
        }
    }

    /// True when the peer is owed an ack and no data frame has carried one
    /// since. Clears the flag; the caller is about to send the ack.
    pub fn take_acks_dirty(&mut self) -> bool {
        std::mem::replace(&mut self.acks_dirty, false)
    }

    /// Returns clones of every datagram overdue for retransmission and
    /// stamps them as just sent.
    pub fn due_for_resend(&mut self, now: Instant, interval: std::time::Duration) -> Vec<Vec<u8>> {
        let mut due = Vec::new();
        for entry in self.sent.values_mut() {
            if now.duration_since(entry.last_sent) >= interval {
                entry.last_sent = now;
                due.push(entry.datagram.clone());
            }
        }
        due
    }
}
