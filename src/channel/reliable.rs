use crate::channel::ack::{AckTracker, Registration};
use crate::channel::fragments::FragmentAssembler;
use crate::channel::send_window::SendWindow;
use crate::channel::AckOutcome;
use crate::config::EffectiveChannelConfig;
use crate::error::ChannelError;
use crate::event_listener::DeliveryToken;
use crate::packet::{FragmentHeader, RawPacket};
use crate::safe_converter::PrecheckedCast;
use crate::sequence::SequenceNumber;
use anyhow::bail;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use std::collections::hash_map::Entry;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// A packet that was received for the first time, before reassembly of fragments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedPacket {
    pub fragment: Option<FragmentHeader>,
    pub payload: Bytes,
}

/// The receive policy that distinguishes ordered from unordered reliable channels. Duplicates
///  are filtered before packets get here.
pub trait DeliveryOrder: Default + Send {
    /// `previous_base` and `new_base` are the receiver's ack base before and after registering
    ///  `sequence`: every sequence number in between was received.
    fn on_new_packet(
        &mut self,
        sequence: SequenceNumber,
        previous_base: SequenceNumber,
        new_base: SequenceNumber,
        packet: ReceivedPacket,
        out: &mut Vec<ReceivedPacket>,
    );

    fn num_buffered(&self) -> usize;

    fn clear(&mut self);
}

#[derive(Default)]
pub struct UnorderedDelivery;

impl DeliveryOrder for UnorderedDelivery {
    fn on_new_packet(&mut self, _: SequenceNumber, _: SequenceNumber, _: SequenceNumber, packet: ReceivedPacket, out: &mut Vec<ReceivedPacket>) {
        out.push(packet);
    }

    fn num_buffered(&self) -> usize {
        0
    }

    fn clear(&mut self) {}
}

/// Buffers packets that arrive ahead of a gap, releasing them when the gap is filled
#[derive(Default)]
pub struct OrderedDelivery {
    buffered: FxHashMap<SequenceNumber, ReceivedPacket>,
}

impl DeliveryOrder for OrderedDelivery {
    fn on_new_packet(
        &mut self,
        sequence: SequenceNumber,
        previous_base: SequenceNumber,
        new_base: SequenceNumber,
        packet: ReceivedPacket,
        out: &mut Vec<ReceivedPacket>,
    ) {
        if sequence != previous_base {
            trace!("packet #{} arrived ahead of #{} - buffering", sequence, previous_base);
            self.buffered.insert(sequence, packet);
            return;
        }

        out.push(packet);
        for s in previous_base.next().to(new_base) {
            if let Some(buffered) = self.buffered.remove(&s) {
                out.push(buffered);
            }
        }
    }

    fn num_buffered(&self) -> usize {
        self.buffered.len()
    }

    fn clear(&mut self) {
        self.buffered.clear();
    }
}

struct QueuedPacket {
    fragment: Option<FragmentHeader>,
    payload: Bytes,
    message_id: Option<u64>,
}

struct PendingDelivery {
    remaining_packets: usize,
    token: DeliveryToken,
}

/// A channel with retransmission and acknowledgement. Outgoing packets wait in a FIFO queue
///  until there is room in the send window, and stay in the window until they are acknowledged.
pub struct ReliableChannel<D: DeliveryOrder> {
    config: Arc<EffectiveChannelConfig>,
    queue: VecDeque<QueuedPacket>,
    send_window: SendWindow,
    ack_tracker: AckTracker,
    delivery_order: D,
    fragments: FragmentAssembler,
    next_fragment_group: u16,
    next_message_id: u64,
    pending_deliveries: FxHashMap<u64, PendingDelivery>,
}

impl<D: DeliveryOrder> ReliableChannel<D> {
    pub fn new(config: Arc<EffectiveChannelConfig>) -> ReliableChannel<D> {
        ReliableChannel {
            queue: VecDeque::new(),
            send_window: SendWindow::new(config.send_window_capacity),
            ack_tracker: AckTracker::default(),
            delivery_order: D::default(),
            fragments: FragmentAssembler::new(config.max_incomplete_fragment_groups, config.max_message_size),
            next_fragment_group: 0,
            next_message_id: 0,
            pending_deliveries: FxHashMap::default(),
            config,
        }
    }

    fn channel_id(&self) -> u8 {
        self.config.delivery_method.channel_id()
    }

    pub fn enqueue(&mut self, payload: &[u8], token: Option<DeliveryToken>) -> anyhow::Result<()> {
        if payload.len() > self.config.max_message_size {
            bail!("message of {} bytes exceeds the maximum message size of {}", payload.len(), self.config.max_message_size);
        }

        let payload = Bytes::copy_from_slice(payload);

        let chunk_len = self.config.max_fragment_payload_len;
        let num_packets = if payload.len() <= self.config.max_payload_len {
            1
        }
        else {
            payload.len().div_ceil(chunk_len)
        };
        if num_packets > u16::MAX as usize {
            bail!("message of {} bytes would require {} fragments", payload.len(), num_packets);
        }

        let message_id = token.map(|token| {
            let id = self.next_message_id;
            self.next_message_id += 1;
            self.pending_deliveries.insert(id, PendingDelivery { remaining_packets: num_packets, token });
            id
        });

        if num_packets == 1 {
            self.queue.push_back(QueuedPacket { fragment: None, payload, message_id });
            return Ok(());
        }

        let group_id = self.next_fragment_group;
        self.next_fragment_group = self.next_fragment_group.wrapping_add(1);
        trace!("splitting message of {} bytes into {} fragments (group {})", payload.len(), num_packets, group_id);

        for index in 0..num_packets {
            let end = payload.len().min((index + 1) * chunk_len);
            self.queue.push_back(QueuedPacket {
                fragment: Some(FragmentHeader {
                    group_id,
                    index: index.prechecked_cast(),
                    count: num_packets.prechecked_cast(),
                }),
                payload: payload.slice(index * chunk_len..end),
                message_id,
            });
        }
        Ok(())
    }

    /// promote queued packets into the window, resend timed out packets, flush a pending ack
    pub fn tick(&mut self, now: Instant, rto: Duration, out: &mut Vec<RawPacket>) -> Result<(), ChannelError> {
        let channel_id = self.channel_id();

        while self.send_window.has_space() {
            let Some(queued) = self.queue.pop_front() else {
                break;
            };
            let packet = RawPacket::channel(channel_id, SequenceNumber::ZERO, queued.fragment, queued.payload);
            out.push(self.send_window.push(packet, queued.message_id, now));
        }

        let in_flight = self.send_window.sequences().collect::<Vec<_>>();
        for sequence in in_flight {
            let Some(entry) = self.send_window.get_mut(&sequence) else {
                continue;
            };

            let timeout = self.config.backed_off_rto(rto, entry.retransmit_count);
            if now.duration_since(entry.last_sent_at) < timeout {
                continue;
            }
            if entry.retransmit_count >= self.config.max_retransmits {
                return Err(ChannelError::RetransmitExhausted { sequence, retransmits: entry.retransmit_count });
            }

            entry.retransmit_count += 1;
            entry.last_sent_at = now;
            debug!("resending packet #{} on channel {} (retransmit #{})", sequence, channel_id, entry.retransmit_count);
            out.push(entry.packet.clone());
        }

        if let Some((ack_base, ack_bitfield)) = self.ack_tracker.take_pending() {
            out.push(RawPacket::ack(channel_id, ack_base, ack_bitfield));
        }
        Ok(())
    }

    /// returns the messages that became deliverable, in delivery order
    pub fn on_receive(&mut self, packet: RawPacket) -> Result<Vec<Bytes>, ChannelError> {
        let sequence = packet.header.sequence;
        if let Some(fragment) = &packet.header.fragment {
            self.fragments.check(fragment)?;
            if self.ack_tracker.is_new(sequence) {
                self.fragments.check_room(fragment)?;
            }
        }

        let previous_base = match self.ack_tracker.register(sequence) {
            Registration::New { previous_base } => previous_base,
            Registration::Duplicate => {
                trace!("duplicate packet #{} on channel {} - dropping", sequence, self.channel_id());
                return Ok(Vec::new());
            }
            Registration::OutOfWindow => {
                debug!("packet #{} on channel {} is too far ahead - dropping", sequence, self.channel_id());
                return Ok(Vec::new());
            }
        };

        let mut ready = Vec::new();
        let received = ReceivedPacket { fragment: packet.header.fragment, payload: packet.payload };
        self.delivery_order.on_new_packet(sequence, previous_base, self.ack_tracker.ack_base(), received, &mut ready);

        let mut result = Vec::with_capacity(ready.len());
        for p in ready {
            match p.fragment {
                None => result.push(p.payload),
                Some(fragment) => match self.fragments.add(fragment, p.payload) {
                    Ok(Some(message)) => result.push(message),
                    Ok(None) => {}
                    Err(e) => warn!("dropping fragment on channel {}: {}", self.channel_id(), e),
                },
            }
        }
        Ok(result)
    }

    pub fn on_ack_received(&mut self, ack_base: SequenceNumber, ack_bitfield: u64, now: Instant) -> Result<AckOutcome, ChannelError> {
        if !self.send_window.is_plausible_ack_base(ack_base) {
            return Err(ChannelError::ProtocolViolation(format!("ack for #{} which was never sent", ack_base)));
        }

        let confirmed = self.send_window.acknowledge(ack_base, ack_bitfield);
        trace!("ack #{}/{:016x} on channel {} confirmed {} packets", ack_base, ack_bitfield, self.channel_id(), confirmed.len());

        // an ack for a resent packet may refer to any of its transmissions
        let rtt_sample = confirmed.first()
            .filter(|(_, p)| p.retransmit_count == 0)
            .map(|(_, p)| now.duration_since(p.last_sent_at));

        let mut delivered = Vec::new();
        for message_id in confirmed.iter().flat_map(|(_, p)| p.message_id) {
            if let Entry::Occupied(mut e) = self.pending_deliveries.entry(message_id) {
                e.get_mut().remaining_packets -= 1;
                if e.get().remaining_packets == 0 {
                    delivered.push(e.remove().token);
                }
            }
        }

        Ok(AckOutcome { rtt_sample, delivered })
    }

    pub fn packets_in_queue(&self) -> usize {
        self.queue.len()
    }

    pub fn packets_in_flight(&self) -> usize {
        self.send_window.len()
    }

    pub fn num_buffered(&self) -> usize {
        self.delivery_order.num_buffered()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.send_window.clear();
        self.ack_tracker.clear();
        self.delivery_order.clear();
        self.fragments.clear();
        self.pending_deliveries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{test_channel_config, DeliveryMethod};
    use rstest::rstest;

    fn seq(raw: u16) -> SequenceNumber {
        SequenceNumber::from_raw(raw)
    }

    fn ordered(window_capacity: u16) -> ReliableChannel<OrderedDelivery> {
        ReliableChannel::new(test_channel_config(DeliveryMethod::ReliableOrdered, window_capacity, 20))
    }

    fn unordered(window_capacity: u16) -> ReliableChannel<UnorderedDelivery> {
        ReliableChannel::new(test_channel_config(DeliveryMethod::ReliableUnordered, window_capacity, 20))
    }

    const RTO: Duration = Duration::from_millis(100);

    fn sent_packets<D: DeliveryOrder>(channel: &mut ReliableChannel<D>, messages: &[impl AsRef<[u8]>], now: Instant) -> Vec<RawPacket> {
        for m in messages {
            channel.enqueue(m.as_ref(), None).unwrap();
        }
        let mut out = Vec::new();
        channel.tick(now, RTO, &mut out).unwrap();
        out
    }

    fn permutations(items: Vec<usize>) -> Vec<Vec<usize>> {
        if items.len() <= 1 {
            return vec![items];
        }
        let mut result = Vec::new();
        for i in 0..items.len() {
            let mut rest = items.clone();
            let first = rest.remove(i);
            for mut p in permutations(rest) {
                p.insert(0, first);
                result.push(p);
            }
        }
        result
    }

    #[test]
    fn test_scenario_window_of_two() {
        let now = Instant::now();
        let mut sender = ordered(2);
        let mut receiver = ordered(2);

        let out = sent_packets(&mut sender, &[b"A", b"B", b"C"], now);
        assert_eq!(out.iter().map(|p| p.payload.as_ref()).collect::<Vec<_>>(), vec![b"A", b"B"]);
        assert_eq!(sender.packets_in_flight(), 2);
        assert_eq!(sender.packets_in_queue(), 1);

        // no room until A is acknowledged
        let mut out2 = Vec::new();
        sender.tick(now, RTO, &mut out2).unwrap();
        assert!(out2.is_empty());

        sender.on_ack_received(seq(1), 0, now).unwrap();
        let mut out3 = Vec::new();
        sender.tick(now, RTO, &mut out3).unwrap();
        assert_eq!(out3.len(), 1);
        assert_eq!(out3[0].payload.as_ref(), b"C");
        assert_eq!(out3[0].header.sequence, seq(2));

        assert!(receiver.on_receive(out[1].clone()).unwrap().is_empty());
        assert_eq!(receiver.num_buffered(), 1);
        assert_eq!(receiver.on_receive(out[0].clone()).unwrap(), vec![Bytes::from_static(b"A"), Bytes::from_static(b"B")]);
        assert_eq!(receiver.num_buffered(), 0);
        assert_eq!(receiver.on_receive(out3[0].clone()).unwrap(), vec![Bytes::from_static(b"C")]);
    }

    #[test]
    fn test_ordered_delivery_under_all_permutations_with_duplicates() {
        let messages: [&[u8]; 4] = [b"m0", b"m1", b"m2", b"m3"];

        for order in permutations(vec![0, 1, 2, 3]) {
            let now = Instant::now();
            let mut sender = ordered(8);
            let mut receiver = ordered(8);
            let packets = sent_packets(&mut sender, &messages[..], now);

            // every packet arrives twice, the duplicate right after the original
            let mut delivered = Vec::new();
            for &i in &order {
                delivered.extend(receiver.on_receive(packets[i].clone()).unwrap());
                delivered.extend(receiver.on_receive(packets[i].clone()).unwrap());
            }
            // and late duplicates after everything was delivered
            for &i in &order {
                delivered.extend(receiver.on_receive(packets[i].clone()).unwrap());
            }

            let expected = messages.iter().map(|m| Bytes::copy_from_slice(m)).collect::<Vec<_>>();
            assert_eq!(delivered, expected, "arrival order {:?}", order);
        }
    }

    #[test]
    fn test_unordered_completeness_under_all_permutations_with_duplicates() {
        let messages: [&[u8]; 4] = [b"m0", b"m1", b"m2", b"m3"];

        for order in permutations(vec![0, 1, 2, 3]) {
            let now = Instant::now();
            let mut sender = unordered(8);
            let mut receiver = unordered(8);
            let packets = sent_packets(&mut sender, &messages[..], now);

            let mut delivered = Vec::new();
            for &i in order.iter().chain(order.iter().rev()) {
                delivered.extend(receiver.on_receive(packets[i].clone()).unwrap());
            }

            let expected = order.iter().map(|&i| Bytes::copy_from_slice(messages[i])).collect::<Vec<_>>();
            assert_eq!(delivered, expected, "arrival order {:?}", order);
        }
    }

    #[test]
    fn test_acks_flow_back() {
        let now = Instant::now();
        let mut sender = ordered(8);
        let mut receiver = ordered(8);
        let packets = sent_packets(&mut sender, &[b"a", b"b", b"c"], now);

        receiver.on_receive(packets[0].clone()).unwrap();
        receiver.on_receive(packets[2].clone()).unwrap();

        let mut acks = Vec::new();
        receiver.tick(now, RTO, &mut acks).unwrap();
        assert_eq!(acks, vec![RawPacket::ack(3, seq(1), 0b1)]);

        let ack = &acks[0];
        let outcome = sender.on_ack_received(ack.header.sequence, ack.ack_bitfield().unwrap(), now + Duration::from_millis(30)).unwrap();
        assert_eq!(outcome.rtt_sample, Some(Duration::from_millis(30)));
        assert_eq!(sender.packets_in_flight(), 1);

        // nothing new received, so nothing to ack
        let mut acks = Vec::new();
        receiver.tick(now, RTO, &mut acks).unwrap();
        assert!(acks.is_empty());
    }

    #[test]
    fn test_ack_idempotence() {
        let now = Instant::now();
        let mut sender = ordered(8);
        sender.enqueue(b"a", Some(DeliveryToken(1))).unwrap();
        sender.enqueue(b"b", Some(DeliveryToken(2))).unwrap();
        sender.enqueue(b"c", Some(DeliveryToken(3))).unwrap();
        sender.tick(now, RTO, &mut Vec::new()).unwrap();

        let first = sender.on_ack_received(seq(1), 0b1, now).unwrap();
        assert_eq!(first.delivered, vec![DeliveryToken(1), DeliveryToken(3)]);
        assert!(first.rtt_sample.is_some());

        let second = sender.on_ack_received(seq(1), 0b1, now).unwrap();
        assert!(second.delivered.is_empty());
        assert_eq!(second.rtt_sample, None);
        assert_eq!(sender.packets_in_flight(), 1);
    }

    #[test]
    fn test_no_rtt_sample_for_resent_packet() {
        let t0 = Instant::now();
        let mut sender = ordered(8);
        sent_packets(&mut sender, &[b"a", b"b"], t0);

        let mut out = Vec::new();
        sender.tick(t0 + RTO, RTO, &mut out).unwrap();
        assert_eq!(out.len(), 2);

        // the ack for the first transmission arrives after the retransmit
        let outcome = sender.on_ack_received(seq(1), 0, t0 + Duration::from_millis(150)).unwrap();
        assert_eq!(outcome.rtt_sample, None);
        assert_eq!(sender.packets_in_flight(), 1);

        sent_packets(&mut sender, &[b"c"], t0 + Duration::from_millis(200));
        let outcome = sender.on_ack_received(seq(3), 0, t0 + Duration::from_millis(240)).unwrap();
        assert_eq!(outcome.rtt_sample, None);

        sent_packets(&mut sender, &[b"d"], t0 + Duration::from_millis(300));
        let outcome = sender.on_ack_received(seq(4), 0, t0 + Duration::from_millis(320)).unwrap();
        assert_eq!(outcome.rtt_sample, Some(Duration::from_millis(20)));
    }

    #[test]
    fn test_implausible_ack() {
        let now = Instant::now();
        let mut sender = ordered(8);
        sent_packets(&mut sender, &[b"a"], now);
        assert!(matches!(sender.on_ack_received(seq(2), 0, now), Err(ChannelError::ProtocolViolation(_))));
        assert_eq!(sender.packets_in_flight(), 1);
    }

    #[test]
    fn test_retransmit_with_backoff_and_exhaustion() {
        let t0 = Instant::now();
        let mut sender = ordered(8);
        sent_packets(&mut sender, &[b"a"], t0);

        let resent_at = |sender: &mut ReliableChannel<OrderedDelivery>, millis: u64| {
            let mut out = Vec::new();
            sender.tick(t0 + Duration::from_millis(millis), RTO, &mut out).map(|_| out.len())
        };

        assert_eq!(resent_at(&mut sender, 99), Ok(0));
        assert_eq!(resent_at(&mut sender, 100), Ok(1));
        assert_eq!(resent_at(&mut sender, 299), Ok(0));
        assert_eq!(resent_at(&mut sender, 300), Ok(1));
        assert_eq!(resent_at(&mut sender, 699), Ok(0));
        assert_eq!(resent_at(&mut sender, 700), Ok(1));
        assert_eq!(resent_at(&mut sender, 1499), Ok(0));
        assert_eq!(resent_at(&mut sender, 1500), Err(ChannelError::RetransmitExhausted { sequence: seq(0), retransmits: 3 }));
    }

    #[test]
    fn test_retransmitted_packet_is_identical() {
        let t0 = Instant::now();
        let mut sender = ordered(8);
        let sent = sent_packets(&mut sender, &[b"a", b"b"], t0);

        sender.on_ack_received(seq(0), 0b1, t0).unwrap();

        let mut out = Vec::new();
        sender.tick(t0 + RTO, RTO, &mut out).unwrap();
        assert_eq!(out, vec![sent[0].clone()]);
    }

    #[rstest]
    #[case::exact_fit(20, 1)]
    #[case::one_more(21, 2)]
    #[case::several(50, 4)]
    fn test_fragmentation(#[case] len: usize, #[case] expected_packets: usize) {
        let now = Instant::now();
        let mut sender = ordered(8);
        let mut receiver = ordered(8);

        let message = (0..len).map(|i| i as u8).collect::<Vec<_>>();
        sender.enqueue(&message, None).unwrap();
        let mut packets = Vec::new();
        sender.tick(now, RTO, &mut packets).unwrap();
        assert_eq!(packets.len(), expected_packets);
        assert_eq!(packets.iter().all(|p| p.header.fragment.is_some()), expected_packets > 1);

        let mut delivered = Vec::new();
        for p in packets.into_iter().rev() {
            delivered.extend(receiver.on_receive(p).unwrap());
        }
        assert_eq!(delivered, vec![Bytes::from(message)]);
    }

    #[test]
    fn test_unordered_fragments_arrive_interleaved() {
        let now = Instant::now();
        let mut sender = unordered(16);
        let mut receiver = unordered(16);

        sender.enqueue(&[1u8; 25], None).unwrap();
        sender.enqueue(b"small", None).unwrap();
        sender.enqueue(&[2u8; 25], None).unwrap();
        let mut packets = Vec::new();
        sender.tick(now, RTO, &mut packets).unwrap();
        assert_eq!(packets.len(), 5);

        let mut delivered = Vec::new();
        for i in [3, 2, 0, 4, 1] {
            delivered.extend(receiver.on_receive(packets[i].clone()).unwrap());
        }
        assert_eq!(delivered, vec![Bytes::from_static(b"small"), Bytes::from(vec![2u8; 25]), Bytes::from(vec![1u8; 25])]);
    }

    #[test]
    fn test_fragmented_delivery_token() {
        let now = Instant::now();
        let mut sender = ordered(8);
        sender.enqueue(&[0u8; 40], Some(DeliveryToken(9))).unwrap();
        let mut packets = Vec::new();
        sender.tick(now, RTO, &mut packets).unwrap();
        assert_eq!(packets.len(), 3);

        assert!(sender.on_ack_received(seq(0), 0b1, now).unwrap().delivered.is_empty());
        assert!(sender.on_ack_received(seq(0), 0b11, now).unwrap().delivered.is_empty());
        assert_eq!(sender.on_ack_received(seq(3), 0, now).unwrap().delivered, vec![DeliveryToken(9)]);
        assert!(sender.on_ack_received(seq(3), 0, now).unwrap().delivered.is_empty());
    }

    #[test]
    fn test_unordered_fragments_with_all_first_parts_late() {
        let now = Instant::now();
        let mut sender = unordered(64);
        let mut receiver = unordered(64);

        let messages = (0..20u8).map(|i| vec![i; 21]).collect::<Vec<_>>();
        let packets = sent_packets(&mut sender, &messages[..], now);
        assert_eq!(packets.len(), 40);

        let mut delivered = Vec::new();
        for p in packets.iter().filter(|p| p.header.fragment.is_some_and(|f| f.index == 1)) {
            delivered.extend(receiver.on_receive(p.clone()).unwrap());
        }
        assert!(delivered.is_empty());
        for p in packets.iter().filter(|p| p.header.fragment.is_some_and(|f| f.index == 0)) {
            delivered.extend(receiver.on_receive(p.clone()).unwrap());
        }

        let expected = messages.into_iter().map(Bytes::from).collect::<Vec<_>>();
        assert_eq!(delivered, expected);
    }

    #[test]
    fn test_fragment_beyond_group_limit_is_not_acked() {
        let now = Instant::now();
        let config = EffectiveChannelConfig {
            max_incomplete_fragment_groups: 2,
            ..Arc::unwrap_or_clone(test_channel_config(DeliveryMethod::ReliableUnordered, 8, 20))
        };
        let mut receiver = ReliableChannel::<UnorderedDelivery>::new(Arc::new(config));

        let fragment = |sequence: u16, group_id: u16| RawPacket::channel(
            2,
            seq(sequence),
            Some(FragmentHeader { group_id, index: 1, count: 2 }),
            Bytes::from_static(b"x"),
        );
        receiver.on_receive(fragment(1, 0)).unwrap();
        receiver.on_receive(fragment(3, 1)).unwrap();
        assert!(matches!(receiver.on_receive(fragment(5, 2)), Err(ChannelError::ProtocolViolation(_))));

        let mut acks = Vec::new();
        receiver.tick(now, RTO, &mut acks).unwrap();
        assert_eq!(acks, vec![RawPacket::ack(2, seq(0), 0b101)]);
    }

    #[rstest]
    #[case::zero_count(FragmentHeader { group_id: 0, index: 0, count: 0 })]
    #[case::index_out_of_range(FragmentHeader { group_id: 0, index: 2, count: 2 })]
    fn test_invalid_fragment_header_is_not_acked(#[case] fragment: FragmentHeader) {
        let now = Instant::now();
        let mut receiver = ordered(8);
        let packet = RawPacket::channel(3, seq(0), Some(fragment), Bytes::from_static(b"x"));
        assert!(matches!(receiver.on_receive(packet), Err(ChannelError::ProtocolViolation(_))));

        let mut out = Vec::new();
        receiver.tick(now, RTO, &mut out).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_oversized_message() {
        let mut sender = ordered(8);
        assert!(sender.enqueue(&[0u8; 1001], None).is_err());
        assert_eq!(sender.packets_in_queue(), 0);
    }

    #[test]
    fn test_clear() {
        let now = Instant::now();
        let mut sender = ordered(1);
        sender.enqueue(b"a", Some(DeliveryToken(1))).unwrap();
        sender.enqueue(b"b", None).unwrap();
        sender.tick(now, RTO, &mut Vec::new()).unwrap();
        sender.on_receive(RawPacket::channel(3, seq(1), None, Bytes::from_static(b"x"))).unwrap();

        sender.clear();
        assert_eq!(sender.packets_in_queue(), 0);
        assert_eq!(sender.packets_in_flight(), 0);
        assert_eq!(sender.num_buffered(), 0);

        let mut out = Vec::new();
        sender.tick(now + Duration::from_secs(10), RTO, &mut out).unwrap();
        assert!(out.is_empty());
    }
}
