use crate::sequence::SequenceNumber;
use crate::util::buf_ext::BufExt;
use anyhow::{anyhow, bail};
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum PacketKind {
    /// data or ack for one of the peer's channels
    Channel = 0,
    ConnectRequest = 1,
    ConnectAccept = 2,
    ConnectReject = 3,
    Disconnect = 4,
    ShutdownOk = 5,
}
impl PacketKind {
    pub fn is_control(&self) -> bool {
        *self != PacketKind::Channel
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PacketFlags: u8 {
        const ACK = 0x01;
        const FRAGMENT = 0x02;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FragmentHeader {
    pub group_id: u16,
    pub index: u16,
    pub count: u16,
}
impl FragmentHeader {
    pub const SERIALIZED_LEN: usize = 3 * size_of::<u16>();

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u16(self.group_id);
        buf.put_u16(self.index);
        buf.put_u16(self.count);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<FragmentHeader> {
        let group_id = buf.try_read_u16()?;
        let index = buf.try_read_u16()?;
        let count = buf.try_read_u16()?;
        Ok(FragmentHeader { group_id, index, count })
    }
}

/// The header at the start of every datagram (after removal of all pipeline trailers).
///
/// ```ascii
/// 0: packet kind (u8)
/// 1: flags (u8) - ACK 0x01, FRAGMENT 0x02
/// 2: channel id (u8)
/// 3: sequence number (u16)
/// 5: fragment header (3 x u16: group id, index, count) - only if FRAGMENT is set
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketHeader {
    pub kind: PacketKind,
    pub is_ack: bool,
    pub channel_id: u8,
    pub sequence: SequenceNumber,
    pub fragment: Option<FragmentHeader>,
}

impl PacketHeader {
    /// the fixed part of the header, i.e. without a fragment header
    pub const SERIALIZED_LEN: usize = 5;

    pub fn flags(&self) -> PacketFlags {
        let mut flags = PacketFlags::empty();
        flags.set(PacketFlags::ACK, self.is_ack);
        flags.set(PacketFlags::FRAGMENT, self.fragment.is_some());
        flags
    }

    pub fn serialized_len(&self) -> usize {
        Self::SERIALIZED_LEN + self.fragment.map_or(0, |_| FragmentHeader::SERIALIZED_LEN)
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.kind.into());
        buf.put_u8(self.flags().bits());
        buf.put_u8(self.channel_id);
        buf.put_u16(self.sequence.to_raw());
        if let Some(fragment) = &self.fragment {
            fragment.ser(buf);
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<PacketHeader> {
        let raw_kind = buf.try_read_u8()?;
        let kind = PacketKind::try_from(raw_kind)
            .map_err(|_| anyhow!("unknown packet kind {}", raw_kind))?;

        let raw_flags = buf.try_read_u8()?;
        let flags = PacketFlags::from_bits(raw_flags)
            .ok_or_else(|| anyhow!("unknown packet flags {:02x}", raw_flags))?;

        let channel_id = buf.try_read_u8()?;
        let sequence = SequenceNumber::from_raw(buf.try_read_u16()?);

        if kind.is_control() && !flags.is_empty() {
            bail!("control packet {:?} with flags {:?}", kind, flags);
        }

        let fragment = if flags.contains(PacketFlags::FRAGMENT) {
            Some(FragmentHeader::deser(buf)?)
        }
        else {
            None
        };

        Ok(PacketHeader {
            kind,
            is_ack: flags.contains(PacketFlags::ACK),
            channel_id,
            sequence,
            fragment,
        })
    }
}

/// A packet as it is handed between channels, the pipeline and the socket: a parsed header and
///  the payload following it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawPacket {
    pub header: PacketHeader,
    pub payload: Bytes,
}

impl RawPacket {
    pub fn channel(channel_id: u8, sequence: SequenceNumber, fragment: Option<FragmentHeader>, payload: Bytes) -> RawPacket {
        RawPacket {
            header: PacketHeader {
                kind: PacketKind::Channel,
                is_ack: false,
                channel_id,
                sequence,
                fragment,
            },
            payload,
        }
    }

    /// An ack packet carries the ack base as its sequence number and the ack bitfield (u64) as
    ///  its payload
    pub fn ack(channel_id: u8, ack_base: SequenceNumber, ack_bitfield: u64) -> RawPacket {
        RawPacket {
            header: PacketHeader {
                kind: PacketKind::Channel,
                is_ack: true,
                channel_id,
                sequence: ack_base,
                fragment: None,
            },
            payload: Bytes::copy_from_slice(&ack_bitfield.to_be_bytes()),
        }
    }

    pub fn control(kind: PacketKind, payload: Bytes) -> RawPacket {
        debug_assert!(kind.is_control());

        RawPacket {
            header: PacketHeader {
                kind,
                is_ack: false,
                channel_id: 0,
                sequence: SequenceNumber::ZERO,
                fragment: None,
            },
            payload,
        }
    }

    pub fn serialized_len(&self) -> usize {
        self.header.serialized_len() + self.payload.len()
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        self.header.ser(buf);
        buf.put_slice(&self.payload);
    }

    pub fn deser(datagram: Bytes) -> anyhow::Result<RawPacket> {
        let mut parse_buf: &[u8] = &datagram;
        let header = PacketHeader::deser(&mut parse_buf)?;
        let payload = datagram.slice(header.serialized_len()..);
        Ok(RawPacket { header, payload })
    }

    pub fn ack_bitfield(&self) -> anyhow::Result<u64> {
        let mut buf: &[u8] = &self.payload;
        let bitfield = buf.try_read_u64()?;
        if !buf.is_empty() {
            bail!("ack packet with {} trailing bytes", buf.len());
        }
        Ok(bitfield)
    }
}

/// Payload of a connect request: the protocol id, followed by application data
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectRequestPayload {
    pub protocol_id: u32,
    pub data: Bytes,
}

impl ConnectRequestPayload {
    pub fn ser(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(size_of::<u32>() + self.data.len());
        buf.put_u32(self.protocol_id);
        buf.put_slice(&self.data);
        buf.freeze()
    }

    pub fn deser(payload: &Bytes) -> anyhow::Result<ConnectRequestPayload> {
        let mut buf: &[u8] = payload;
        let protocol_id = buf.try_read_u32()?;
        Ok(ConnectRequestPayload {
            protocol_id,
            data: payload.slice(size_of::<u32>()..),
        })
    }
}
