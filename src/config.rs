use crate::channel::DeliveryMethod;
use crate::packet::{FragmentHeader, PacketHeader};
use anyhow::bail;
use std::net::SocketAddr;
use std::time::Duration;

pub struct RudpConfig {
    pub self_addr: SocketAddr,

    /// This is the payload size inside UDP packets that is assumed for all peers. Packets are
    ///  never bigger than this, bigger messages are fragmented on reliable channels and rejected
    ///  on unreliable channels.
    ///
    /// With full Ethernet frames and no optional IP headers, this payload is `1500 - 20 - 8 = 1472`
    ///  for IPV4 and `1500 - 40 - 8 = 1452` for IPV6. Choosing this value too big causes packets
    ///  to be dropped somewhere along the route, choosing it too small wastes bandwidth.
    pub payload_size_inside_udp: usize,

    /// interval at which peers resend, flush acks and check their timeouts
    pub tick_interval: Duration,

    pub reliability: ReliabilityConfig,

    pub connect_timeout: Duration,
    pub connect_retry_interval: Duration,
    pub disconnect_timeout: Duration,
    pub shutdown_retry_interval: Duration,

    /// a change in smoothed latency of less than this is not reported to the event listener
    pub latency_update_threshold: Duration,

    pub max_message_size: usize,

    /// The number of protocol violations after which a peer is disconnected. `None` means that
    ///  violations are logged and the offending packets dropped, but the peer is kept.
    pub max_protocol_violations: Option<u32>,

    /// sent with connection requests; requests with a different id are rejected
    pub protocol_id: u32,

    pub checksum_enabled: bool,

    /// AES-256-GCM key shared by all nodes. `None` means unencrypted traffic.
    pub encryption_key: Option<[u8; 32]>,
}

impl RudpConfig {
    /// ipv4 with end-to-end full Ethernet MTU, without optional headers
    pub fn default_ipv4(self_addr: SocketAddr) -> RudpConfig {
        RudpConfig {
            self_addr,
            payload_size_inside_udp: 1472,
            tick_interval: Duration::from_millis(15),
            reliability: ReliabilityConfig::default(),
            connect_timeout: Duration::from_secs(5),
            connect_retry_interval: Duration::from_millis(500),
            disconnect_timeout: Duration::from_secs(5),
            shutdown_retry_interval: Duration::from_millis(500),
            latency_update_threshold: Duration::from_millis(1),
            max_message_size: 1024*1024,
            max_protocol_violations: Some(16),
            protocol_id: 1,
            checksum_enabled: true,
            encryption_key: None,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.payload_size_inside_udp < 100 {
            bail!("Payload size is too small");
        }
        if self.payload_size_inside_udp > 65507 {
            bail!("Payload size does not fit into a UDP datagram");
        }
        if self.tick_interval.is_zero() {
            bail!("tick interval must be positive");
        }
        if self.connect_retry_interval.is_zero() || self.shutdown_retry_interval.is_zero() {
            bail!("retry intervals must be positive");
        }

        self.reliability.validate()?;

        // worst case for fragment count: all pipeline stages active
        let min_fragment_len = self.payload_size_inside_udp
            .saturating_sub(100 + PacketHeader::SERIALIZED_LEN + FragmentHeader::SERIALIZED_LEN)
            .max(1);
        if self.max_message_size.div_ceil(min_fragment_len) > u16::MAX as usize {
            bail!("max message size {} requires more than {} fragments", self.max_message_size, u16::MAX);
        }

        Ok(())
    }

    pub fn get_effective_channel_config(&self, delivery_method: DeliveryMethod, pipeline_overhead: usize) -> EffectiveChannelConfig {
        let max_payload_len = self.payload_size_inside_udp
            - pipeline_overhead
            - PacketHeader::SERIALIZED_LEN;

        EffectiveChannelConfig {
            delivery_method,
            max_payload_len,
            max_fragment_payload_len: max_payload_len - FragmentHeader::SERIALIZED_LEN,
            send_window_capacity: self.reliability.send_window_capacity,
            max_retransmits: self.reliability.max_retransmits,
            rto_backoff_factor: self.reliability.rto_backoff_factor,
            max_rto: self.reliability.max_rto,
            max_message_size: self.max_message_size,
            max_incomplete_fragment_groups: self.reliability.max_incomplete_fragment_groups,
        }
    }
}

/// Retransmit and window parameters for reliable channels
#[derive(Clone, Debug)]
pub struct ReliabilityConfig {
    /// This is the maximum number of *packets* sent and not yet acknowledged per channel. It is
    ///  bounded by the width of the ack bitfield.
    pub send_window_capacity: u16,

    /// retransmit timeout before the first RTT sample is available
    pub initial_rto: Duration,
    pub min_rto: Duration,
    pub max_rto: Duration,
    /// the retransmit timeout is multiplied by this for every retransmit of the same packet
    pub rto_backoff_factor: f64,
    pub max_retransmits: u32,

    /// Upper bound for partially received messages per channel. Fragments of these messages are
    ///  acknowledged already, so this must be at least the send window capacity.
    pub max_incomplete_fragment_groups: usize,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        ReliabilityConfig {
            send_window_capacity: 64,
            initial_rto: Duration::from_millis(200),
            min_rto: Duration::from_millis(30),
            max_rto: Duration::from_secs(2),
            rto_backoff_factor: 1.5,
            max_retransmits: 10,
            max_incomplete_fragment_groups: 64,
        }
    }
}

impl ReliabilityConfig {
    /// the ack bitfield has room for the ack base plus 64 following sequence numbers
    pub const MAX_SEND_WINDOW_CAPACITY: u16 = 64;

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.send_window_capacity == 0 || self.send_window_capacity > Self::MAX_SEND_WINDOW_CAPACITY {
            bail!("send window capacity must be in 1..={}, was {}", Self::MAX_SEND_WINDOW_CAPACITY, self.send_window_capacity);
        }
        if self.min_rto.is_zero() {
            bail!("minimum retransmit timeout must be positive");
        }
        if self.min_rto > self.initial_rto || self.initial_rto > self.max_rto {
            bail!("retransmit timeouts must satisfy min <= initial <= max");
        }
        if !(self.rto_backoff_factor >= 1.0) {
            bail!("retransmit backoff factor must be at least 1.0, was {}", self.rto_backoff_factor);
        }
        // a sender that respects the window can not have more incomplete groups than that
        if self.max_incomplete_fragment_groups < self.send_window_capacity as usize {
            bail!("max incomplete fragment groups ({}) must not be less than the send window capacity ({})", self.max_incomplete_fragment_groups, self.send_window_capacity);
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct EffectiveChannelConfig {
    pub delivery_method: DeliveryMethod,
    /// maximum payload of a single unfragmented packet
    pub max_payload_len: usize,
    pub max_fragment_payload_len: usize,
    pub send_window_capacity: u16,
    pub max_retransmits: u32,
    pub rto_backoff_factor: f64,
    pub max_rto: Duration,
    pub max_message_size: usize,
    pub max_incomplete_fragment_groups: usize,
}

impl EffectiveChannelConfig {
    /// the retransmit timeout for a packet that was already resent `retransmit_count` times
    pub fn backed_off_rto(&self, rto: Duration, retransmit_count: u32) -> Duration {
        let factor = self.rto_backoff_factor.powi(retransmit_count.min(64) as i32);
        let nanos = rto.as_nanos() as f64 * factor;
        if nanos >= self.max_rto.as_nanos() as f64 {
            self.max_rto
        }
        else {
            Duration::from_nanos(nanos as u64)
        }
    }
}
