use crate::config::EffectiveChannelConfig;
use crate::error::ChannelError;
use crate::packet::RawPacket;
use crate::sequence::SequenceNumber;
use anyhow::bail;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Arc;

/// Fire and forget: no sequence numbers, no acks, no retransmits.
pub struct UnreliableChannel {
    config: Arc<EffectiveChannelConfig>,
    queue: VecDeque<Bytes>,
}

impl UnreliableChannel {
    pub fn new(config: Arc<EffectiveChannelConfig>) -> UnreliableChannel {
        UnreliableChannel {
            config,
            queue: VecDeque::new(),
        }
    }

    pub fn enqueue(&mut self, payload: &[u8]) -> anyhow::Result<()> {
        if payload.len() > self.config.max_payload_len {
            bail!("unreliable message of {} bytes exceeds the packet payload limit of {}", payload.len(), self.config.max_payload_len);
        }
        self.queue.push_back(Bytes::copy_from_slice(payload));
        Ok(())
    }

    pub fn tick(&mut self, out: &mut Vec<RawPacket>) {
        let channel_id = self.config.delivery_method.channel_id();
        out.extend(self.queue.drain(..)
            .map(|payload| RawPacket::channel(channel_id, SequenceNumber::ZERO, None, payload)));
    }

    pub fn on_receive(&mut self, packet: RawPacket) -> Result<Vec<Bytes>, ChannelError> {
        if packet.header.fragment.is_some() {
            return Err(ChannelError::ProtocolViolation("fragment on unreliable channel".to_string()));
        }
        Ok(vec![packet.payload])
    }

    pub fn packets_in_queue(&self) -> usize {
        self.queue.len()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{test_channel_config, DeliveryMethod};
    use crate::packet::FragmentHeader;

    fn channel() -> UnreliableChannel {
        UnreliableChannel::new(test_channel_config(DeliveryMethod::Unreliable, 8, 20))
    }

    #[test]
    fn test_send() {
        let mut channel = channel();
        channel.enqueue(b"a").unwrap();
        channel.enqueue(b"b").unwrap();
        assert_eq!(channel.packets_in_queue(), 2);

        let mut out = Vec::new();
        channel.tick(&mut out);
        assert_eq!(out, vec![
            RawPacket::channel(0, SequenceNumber::ZERO, None, Bytes::from_static(b"a")),
            RawPacket::channel(0, SequenceNumber::ZERO, None, Bytes::from_static(b"b")),
        ]);
        assert_eq!(channel.packets_in_queue(), 0);

        let mut out = Vec::new();
        channel.tick(&mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_oversized() {
        let mut channel = channel();
        assert!(channel.enqueue(&[0u8; 21]).is_err());
        assert!(channel.enqueue(&[0u8; 20]).is_ok());
    }

    #[test]
    fn test_receive_delivers_everything() {
        let mut channel = channel();
        for _ in 0..2 {
            let packet = RawPacket::channel(0, SequenceNumber::from_raw(17), None, Bytes::from_static(b"x"));
            assert_eq!(channel.on_receive(packet).unwrap(), vec![Bytes::from_static(b"x")]);
        }
    }

    #[test]
    fn test_fragment_is_violation() {
        let mut channel = channel();
        let packet = RawPacket::channel(0, SequenceNumber::ZERO, Some(FragmentHeader { group_id: 0, index: 0, count: 1 }), Bytes::new());
        assert!(matches!(channel.on_receive(packet), Err(ChannelError::ProtocolViolation(_))));
    }
}
