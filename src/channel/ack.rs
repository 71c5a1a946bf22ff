use crate::sequence::SequenceNumber;
use tracing::trace;

/// Receiver side bookkeeping of a reliable channel: which sequence numbers were received, in
///  the compact form that is sent back in ack packets.
///
/// Every sequence number before `ack_base` was received, `ack_base` itself was not. Bit `i` of
///  `received` is set if `ack_base + i + 1` was received.
#[derive(Debug, Default)]
pub struct AckTracker {
    ack_base: SequenceNumber,
    received: u64,
    ack_pending: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// received for the first time; `previous_base` is the ack base before registration
    New { previous_base: SequenceNumber },
    Duplicate,
    /// too far ahead to be represented in the ack bitfield
    OutOfWindow,
}

impl AckTracker {
    pub const BITFIELD_WIDTH: i16 = u64::BITS as i16;

    pub fn ack_base(&self) -> SequenceNumber {
        self.ack_base
    }

    /// whether [AckTracker::register] would report `sequence` as new
    pub fn is_new(&self, sequence: SequenceNumber) -> bool {
        let offset = sequence.offset_from(self.ack_base);
        if offset == 0 {
            return true;
        }
        if offset < 0 || offset > Self::BITFIELD_WIDTH {
            return false;
        }
        self.received & (1u64 << (offset - 1)) == 0
    }

    pub fn register(&mut self, sequence: SequenceNumber) -> Registration {
        let offset = sequence.offset_from(self.ack_base);

        if offset > Self::BITFIELD_WIDTH {
            trace!("packet #{} is beyond the ack window starting at #{}", sequence, self.ack_base);
            return Registration::OutOfWindow;
        }

        // duplicates are acked again since the previous ack may have been lost
        self.ack_pending = true;

        if offset < 0 {
            return Registration::Duplicate;
        }

        let previous_base = self.ack_base;
        if offset == 0 {
            self.advance();
        }
        else {
            let mask = 1u64 << (offset - 1);
            if self.received & mask != 0 {
                return Registration::Duplicate;
            }
            self.received |= mask;
        }
        Registration::New { previous_base }
    }

    /// called when `ack_base` itself is received
    fn advance(&mut self) {
        // while looping, bit i stands for ack_base + i
        self.ack_base = self.ack_base.next();
        while self.received & 1 != 0 {
            self.received >>= 1;
            self.ack_base = self.ack_base.next();
        }
        self.received >>= 1;
    }

    /// returns ack base and bitfield if anything was received since the last call
    pub fn take_pending(&mut self) -> Option<(SequenceNumber, u64)> {
        if self.ack_pending {
            self.ack_pending = false;
            Some((self.ack_base, self.received))
        }
        else {
            None
        }
    }

    pub fn clear(&mut self) {
        *self = AckTracker::default();
    }
}
