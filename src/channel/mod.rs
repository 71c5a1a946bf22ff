//! A peer has one channel per [DeliveryMethod], identified on the wire by its channel id.
//!
//! Channels are plain state machines without I/O: the peer feeds them received packets and
//!  acks, and collects the packets they emit when ticked.

pub mod ack;
pub mod fragments;
pub mod reliable;
pub mod send_window;
pub mod sequenced;
pub mod unreliable;

use crate::channel::reliable::{OrderedDelivery, ReliableChannel, UnorderedDelivery};
use crate::channel::sequenced::SequencedChannel;
use crate::channel::unreliable::UnreliableChannel;
use crate::config::EffectiveChannelConfig;
use crate::error::ChannelError;
use crate::event_listener::DeliveryToken;
use crate::packet::RawPacket;
use crate::sequence::SequenceNumber;
use anyhow::bail;
use bytes::Bytes;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum DeliveryMethod {
    /// may be lost, duplicated or reordered
    Unreliable = 0,
    /// may be lost, but older packets are never delivered after newer ones
    Sequenced = 1,
    ReliableUnordered = 2,
    ReliableOrdered = 3,
}

impl Display for DeliveryMethod {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl DeliveryMethod {
    /// ordered by channel id
    pub const ALL: [DeliveryMethod; 4] = [
        DeliveryMethod::Unreliable,
        DeliveryMethod::Sequenced,
        DeliveryMethod::ReliableUnordered,
        DeliveryMethod::ReliableOrdered,
    ];

    pub fn channel_id(&self) -> u8 {
        (*self).into()
    }

    pub fn from_channel_id(channel_id: u8) -> Option<DeliveryMethod> {
        DeliveryMethod::try_from(channel_id).ok()
    }

    pub fn is_reliable(&self) -> bool {
        matches!(self, DeliveryMethod::ReliableUnordered | DeliveryMethod::ReliableOrdered)
    }
}

/// What an ack packet confirmed on the sending side
#[derive(Debug, Default, PartialEq, Eq)]
pub struct AckOutcome {
    /// round trip time of the oldest packet confirmed by this ack
    pub rtt_sample: Option<Duration>,
    /// tokens of messages that are now fully acknowledged
    pub delivered: Vec<DeliveryToken>,
}

pub enum Channel {
    Unreliable(UnreliableChannel),
    Sequenced(SequencedChannel),
    ReliableUnordered(ReliableChannel<UnorderedDelivery>),
    ReliableOrdered(ReliableChannel<OrderedDelivery>),
}

impl Channel {
    pub fn new(config: Arc<EffectiveChannelConfig>) -> Channel {
        match config.delivery_method {
            DeliveryMethod::Unreliable => Channel::Unreliable(UnreliableChannel::new(config)),
            DeliveryMethod::Sequenced => Channel::Sequenced(SequencedChannel::new(config)),
            DeliveryMethod::ReliableUnordered => Channel::ReliableUnordered(ReliableChannel::new(config)),
            DeliveryMethod::ReliableOrdered => Channel::ReliableOrdered(ReliableChannel::new(config)),
        }
    }

    pub fn delivery_method(&self) -> DeliveryMethod {
        match self {
            Channel::Unreliable(_) => DeliveryMethod::Unreliable,
            Channel::Sequenced(_) => DeliveryMethod::Sequenced,
            Channel::ReliableUnordered(_) => DeliveryMethod::ReliableUnordered,
            Channel::ReliableOrdered(_) => DeliveryMethod::ReliableOrdered,
        }
    }

    /// Adds a message to the channel's outgoing queue. A delivery token requires a reliable
    ///  channel, since there is no way to learn about delivery otherwise.
    pub fn enqueue(&mut self, payload: &[u8], token: Option<DeliveryToken>) -> anyhow::Result<()> {
        let delivery_method = self.delivery_method();
        match self {
            Channel::ReliableUnordered(c) => c.enqueue(payload, token),
            Channel::ReliableOrdered(c) => c.enqueue(payload, token),
            _ if token.is_some() => bail!("delivery notification requires a reliable channel, not {}", delivery_method),
            Channel::Unreliable(c) => c.enqueue(payload),
            Channel::Sequenced(c) => c.enqueue(payload),
        }
    }

    pub fn tick(&mut self, now: Instant, rto: Duration, out: &mut Vec<RawPacket>) -> Result<(), ChannelError> {
        match self {
            Channel::Unreliable(c) => c.tick(out),
            Channel::Sequenced(c) => c.tick(out),
            Channel::ReliableUnordered(c) => return c.tick(now, rto, out),
            Channel::ReliableOrdered(c) => return c.tick(now, rto, out),
        }
        Ok(())
    }

    /// returns the messages that became deliverable, in delivery order
    pub fn on_receive(&mut self, packet: RawPacket) -> Result<Vec<Bytes>, ChannelError> {
        if packet.header.is_ack {
            return Err(ChannelError::ProtocolViolation("ack passed as data".to_string()));
        }

        match self {
            Channel::Unreliable(c) => c.on_receive(packet),
            Channel::Sequenced(c) => c.on_receive(packet),
            Channel::ReliableUnordered(c) => c.on_receive(packet),
            Channel::ReliableOrdered(c) => c.on_receive(packet),
        }
    }

    pub fn on_ack_received(&mut self, ack_base: SequenceNumber, ack_bitfield: u64, now: Instant) -> Result<AckOutcome, ChannelError> {
        let delivery_method = self.delivery_method();
        match self {
            Channel::ReliableUnordered(c) => c.on_ack_received(ack_base, ack_bitfield, now),
            Channel::ReliableOrdered(c) => c.on_ack_received(ack_base, ack_bitfield, now),
            _ => Err(ChannelError::ProtocolViolation(format!("ack on {} channel", delivery_method))),
        }
    }

    pub fn packets_in_queue(&self) -> usize {
        match self {
            Channel::Unreliable(c) => c.packets_in_queue(),
            Channel::Sequenced(c) => c.packets_in_queue(),
            Channel::ReliableUnordered(c) => c.packets_in_queue(),
            Channel::ReliableOrdered(c) => c.packets_in_queue(),
        }
    }

    pub fn packets_in_flight(&self) -> usize {
        match self {
            Channel::Unreliable(_) | Channel::Sequenced(_) => 0,
            Channel::ReliableUnordered(c) => c.packets_in_flight(),
            Channel::ReliableOrdered(c) => c.packets_in_flight(),
        }
    }

    pub fn clear(&mut self) {
        match self {
            Channel::Unreliable(c) => c.clear(),
            Channel::Sequenced(c) => c.clear(),
            Channel::ReliableUnordered(c) => c.clear(),
            Channel::ReliableOrdered(c) => c.clear(),
        }
    }
}

#[cfg(test)]
pub(crate) fn test_channel_config(delivery_method: DeliveryMethod, send_window_capacity: u16, max_payload_len: usize) -> Arc<EffectiveChannelConfig> {
    use crate::packet::FragmentHeader;

    Arc::new(EffectiveChannelConfig {
        delivery_method,
        max_payload_len,
        max_fragment_payload_len: max_payload_len - FragmentHeader::SERIALIZED_LEN,
        send_window_capacity,
        max_retransmits: 3,
        rto_backoff_factor: 2.0,
        max_rto: Duration::from_secs(1),
        max_message_size: 1000,
        max_incomplete_fragment_groups: send_window_capacity as usize,
    })
}
