use crate::packet::RawPacket;
use crate::sequence::SequenceNumber;
use rustc_hash::FxHashMap;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct InFlightPacket {
    pub packet: RawPacket,
    pub last_sent_at: Instant,
    pub retransmit_count: u32,
    /// identifies the application message for delivery notification, if one was requested
    pub message_id: Option<u64>,
}

/// Sender side of a reliable channel: packets that were sent and not yet acknowledged, keyed by
///  their sequence number.
///
/// The window spans from `remote_window_start` (the oldest unacknowledged sequence number) to
///  `next_send_sequence` (exclusive), and that span never exceeds `capacity`. Acknowledged
///  packets inside the span are removed from the map right away, but the span only moves when
///  its oldest packet is acknowledged.
#[derive(Debug)]
pub struct SendWindow {
    capacity: u16,
    next_send_sequence: SequenceNumber,
    remote_window_start: SequenceNumber,
    in_flight: FxHashMap<SequenceNumber, InFlightPacket>,
}

impl SendWindow {
    pub fn new(capacity: u16) -> SendWindow {
        SendWindow {
            capacity,
            next_send_sequence: SequenceNumber::ZERO,
            remote_window_start: SequenceNumber::ZERO,
            in_flight: FxHashMap::default(),
        }
    }

    pub fn next_send_sequence(&self) -> SequenceNumber {
        self.next_send_sequence
    }

    pub fn remote_window_start(&self) -> SequenceNumber {
        self.remote_window_start
    }

    pub fn len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }

    pub fn has_space(&self) -> bool {
        self.next_send_sequence - self.remote_window_start < self.capacity
    }

    /// Assigns the next sequence number to a packet and registers it as sent at `now`. The
    ///  caller must check [SendWindow::has_space] first.
    pub fn push(&mut self, mut packet: RawPacket, message_id: Option<u64>, now: Instant) -> RawPacket {
        debug_assert!(self.has_space());

        let sequence = self.next_send_sequence;
        self.next_send_sequence = sequence.next();

        packet.header.sequence = sequence;
        self.in_flight.insert(sequence, InFlightPacket {
            packet: packet.clone(),
            last_sent_at: now,
            retransmit_count: 0,
            message_id,
        });
        packet
    }

    /// in-flight sequence numbers, oldest first
    pub fn sequences(&self) -> impl Iterator<Item = SequenceNumber> + '_ {
        self.remote_window_start.to(self.next_send_sequence)
            .filter(|s| self.in_flight.contains_key(s))
    }

    pub fn get_mut(&mut self, sequence: &SequenceNumber) -> Option<&mut InFlightPacket> {
        self.in_flight.get_mut(sequence)
    }

    /// Whether the sender ever sent `ack_base - 1`. An ack base further ahead than that refers
    ///  to packets that were never sent.
    pub fn is_plausible_ack_base(&self, ack_base: SequenceNumber) -> bool {
        !ack_base.is_after(self.next_send_sequence)
    }

    /// Removes all packets confirmed by an ack, returning them oldest first. Applying the same
    ///  ack a second time has no effect.
    pub fn acknowledge(&mut self, ack_base: SequenceNumber, ack_bitfield: u64) -> Vec<(SequenceNumber, InFlightPacket)> {
        let confirmed = self.remote_window_start.to(self.next_send_sequence)
            .filter(|s| Self::is_confirmed(*s, ack_base, ack_bitfield))
            .collect::<Vec<_>>();

        let result = confirmed.into_iter()
            .flat_map(|s| self.in_flight.remove(&s).map(|p| (s, p)))
            .collect();

        while self.remote_window_start != self.next_send_sequence && !self.in_flight.contains_key(&self.remote_window_start) {
            self.remote_window_start = self.remote_window_start.next();
        }

        result
    }

    fn is_confirmed(sequence: SequenceNumber, ack_base: SequenceNumber, ack_bitfield: u64) -> bool {
        match sequence.offset_from(ack_base) {
            offs if offs < 0 => true,
            offs @ 1..=64 => ack_bitfield & (1u64 << (offs - 1)) != 0,
            _ => false,
        }
    }

    pub fn clear(&mut self) {
        self.in_flight.clear();
        self.remote_window_start = self.next_send_sequence;
    }
}
