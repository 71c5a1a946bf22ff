use crate::sequence::SequenceNumber;

/// Reasons for the packet pipeline to discard an inbound datagram. None of these is surfaced to
///  the application: the datagram is dropped and the reason logged.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PacketRejected {
    #[error("datagram of {len} bytes is shorter than the minimum of {min_len} bytes")]
    Undersized { len: usize, min_len: usize },
    #[error("checksum mismatch: datagram carries {received:08x}, computed {computed:08x}")]
    ChecksumMismatch { received: u32, computed: u32 },
    #[error("datagram failed authenticated decryption")]
    DecryptionFailed,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ChannelError {
    /// The packet is inconsistent with the channel it was routed to. The packet is dropped, and
    ///  the peer keeps count.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    /// A packet was resent the maximum number of times without being acknowledged. This is fatal
    ///  for the peer.
    #[error("packet #{sequence} was not acknowledged after {retransmits} retransmits")]
    RetransmitExhausted { sequence: SequenceNumber, retransmits: u32 },
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("serialized packet has {len} bytes, exceeding the configured UDP payload size of {max_len}")]
    ExceedsPayloadSize { len: usize, max_len: usize },
    #[error("outbound packet layer failed: {0}")]
    Layer(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
