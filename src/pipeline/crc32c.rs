use crate::error::PacketRejected;
use crate::packet::PacketHeader;
use crate::pipeline::PacketLayer;
use bytes::{BufMut, BytesMut};
use crc::Crc;
use tracing::trace;

const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_ISCSI);

/// Appends a CRC-32C (Castagnoli) checksum over the entire datagram, little endian
pub struct Crc32cLayer;

impl Crc32cLayer {
    pub const TAG_LEN: usize = size_of::<u32>();

    pub fn checksum(data: &[u8]) -> u32 {
        CASTAGNOLI.checksum(data)
    }
}

impl PacketLayer for Crc32cLayer {
    fn name(&self) -> &'static str {
        "crc32c"
    }

    fn trailer_len(&self) -> usize {
        Self::TAG_LEN
    }

    fn process_outbound(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        let checksum = Self::checksum(buf.as_ref());
        buf.put_u32_le(checksum);
        Ok(())
    }

    fn process_inbound(&self, buf: &mut BytesMut) -> Result<(), PacketRejected> {
        let min_len = PacketHeader::SERIALIZED_LEN + Self::TAG_LEN;
        if buf.len() < min_len {
            return Err(PacketRejected::Undersized { len: buf.len(), min_len });
        }

        let data_len = buf.len() - Self::TAG_LEN;
        let mut tag = [0u8; Self::TAG_LEN];
        tag.copy_from_slice(&buf[data_len..]);
        let received = u32::from_le_bytes(tag);
        let computed = Self::checksum(&buf[..data_len]);

        if received != computed {
            trace!("checksum mismatch: {:08x} vs {:08x}", received, computed);
            return Err(PacketRejected::ChecksumMismatch { received, computed });
        }

        buf.truncate(data_len);
        Ok(())
    }
}
