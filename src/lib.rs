//! A peer-to-peer transport on top of UDP, providing several independent channels per remote
//!  peer, each with its own delivery guarantee:
//!
//! * *Unreliable*: packets may be lost, duplicated or reordered
//! * *Sequenced*: packets may be lost, but a packet older than one that was delivered already
//!    is dropped
//! * *ReliableUnordered*: every message is delivered exactly once, in arrival order
//! * *ReliableOrdered*: every message is delivered exactly once, in send order
//!
//! Reliability is built from sequence numbers, acknowledgements and retransmits only: the
//!  underlying network may drop, duplicate or reorder datagrams.
//!
//! ## Packet pipeline
//!
//! Every datagram passes through a pipeline of stages, each appending a trailer on the way out
//!  and verifying and removing it on the way in. Datagrams rejected by any stage are dropped
//!  silently. Stages are a CRC-32C checksum (4 bytes, little endian) and optional AES-256-GCM
//!  encryption (16 bytes tag, 12 bytes nonce).
//!
//! ## Header
//!
//! Packet header (inside the pipeline trailers), all numbers in network byte order (BE):
//! ```ascii
//! 0: packet kind (u8):
//!    * 0 channel data or ack
//!    * 1 connect request - payload: protocol id (u32), application data
//!    * 2 connect accept
//!    * 3 connect reject - payload: disconnect reason (u8)
//!    * 4 disconnect
//!    * 5 shutdown ok
//! 1: flags (u8): 0x01 ACK, 0x02 FRAGMENT, all other bits must be 0
//! 2: channel id (u8): 0 unreliable, 1 sequenced, 2 reliable unordered, 3 reliable ordered
//! 3: sequence number (u16)
//! 5: fragment header (only if the FRAGMENT flag is set): group id (u16), index (u16), count (u16)
//! *: payload
//! ```
//!
//! ## Acknowledgement
//!
//! The receiver of a reliable channel keeps track of received sequence numbers as an *ack base*
//!  (the oldest sequence number that was not received) and a 64 bit *ack bitfield* (bit `i` is
//!  set if `ack base + i + 1` was received). It sends both in an ack packet (ACK flag, sequence
//!  number = ack base, payload = bitfield as u64) on the next tick after receiving a packet,
//!  including duplicates.
//!
//! The sender keeps a window of at most 64 unacknowledged packets per channel, resending them
//!  after a retransmit timeout derived from the round trip time, with exponential backoff per
//!  retransmit. A packet that is not acknowledged after a configured number of retransmits
//!  causes the peer to be disconnected.
//!
//! ## Fragmentation
//!
//! Messages that do not fit into a single packet are split into fragments on reliable channels
//!  and reassembled by the receiver. Unreliable channels reject them.
//!
//! ## Connections
//!
//! A connection is established by a connect request that is answered with accept or reject,
//!  and closed by a disconnect that is confirmed by shutdown ok. Requests are resent until they
//!  are answered or a timeout expires.

pub mod channel;
pub mod config;
pub mod end_point;
pub mod error;
pub mod event_listener;
pub mod packet;
pub mod peer;
pub mod pipeline;
pub mod safe_converter;
pub mod send_pipeline;
pub mod sequence;
pub mod test_util;
pub mod util;
