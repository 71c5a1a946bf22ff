use crate::config::EffectiveChannelConfig;
use crate::error::ChannelError;
use crate::packet::RawPacket;
use crate::sequence::SequenceNumber;
use anyhow::bail;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::trace;

/// Unreliable, but never delivers a packet that is older than one that was already delivered
pub struct SequencedChannel {
    config: Arc<EffectiveChannelConfig>,
    queue: VecDeque<Bytes>,
    next_send_sequence: SequenceNumber,
    last_delivered: Option<SequenceNumber>,
}

impl SequencedChannel {
    pub fn new(config: Arc<EffectiveChannelConfig>) -> SequencedChannel {
        SequencedChannel {
            config,
            queue: VecDeque::new(),
            next_send_sequence: SequenceNumber::ZERO,
            last_delivered: None,
        }
    }

    pub fn enqueue(&mut self, payload: &[u8]) -> anyhow::Result<()> {
        if payload.len() > self.config.max_payload_len {
            bail!("sequenced message of {} bytes exceeds the packet payload limit of {}", payload.len(), self.config.max_payload_len);
        }
        self.queue.push_back(Bytes::copy_from_slice(payload));
        Ok(())
    }

    pub fn tick(&mut self, out: &mut Vec<RawPacket>) {
        let channel_id = self.config.delivery_method.channel_id();
        for payload in self.queue.drain(..) {
            out.push(RawPacket::channel(channel_id, self.next_send_sequence, None, payload));
            self.next_send_sequence = self.next_send_sequence.next();
        }
    }

    pub fn on_receive(&mut self, packet: RawPacket) -> Result<Vec<Bytes>, ChannelError> {
        if packet.header.fragment.is_some() {
            return Err(ChannelError::ProtocolViolation("fragment on sequenced channel".to_string()));
        }

        let sequence = packet.header.sequence;
        if let Some(last) = self.last_delivered {
            if !sequence.is_after(last) {
                trace!("sequenced packet #{} is not newer than #{} - dropping", sequence, last);
                return Ok(Vec::new());
            }
        }

        self.last_delivered = Some(sequence);
        Ok(vec![packet.payload])
    }

    pub fn packets_in_queue(&self) -> usize {
        self.queue.len()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}
