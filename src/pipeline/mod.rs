//! Every datagram passes through the packet pipeline: outbound after serialization and before it
//!  is handed to the socket, inbound before its header is parsed. Each stage appends a trailer of
//!  fixed length on the way out, and verifies and strips it on the way in.
//!
//! Stages are applied in their declared order outbound and in reverse order inbound, so each
//!  stage sees exactly the bytes it produced.

pub mod aes_gcm;
pub mod crc32c;

use crate::config::RudpConfig;
use crate::error::PacketRejected;
use crate::packet::PacketHeader;
use crate::pipeline::aes_gcm::Aes256GcmLayer;
use crate::pipeline::crc32c::Crc32cLayer;
use bytes::BytesMut;
use std::sync::Arc;
use tracing::info;

pub trait PacketLayer: Send + Sync {
    fn name(&self) -> &'static str;

    /// the exact number of bytes this stage appends to every datagram
    fn trailer_len(&self) -> usize;

    fn process_outbound(&self, buf: &mut BytesMut) -> anyhow::Result<()>;

    /// Reverses [PacketLayer::process_outbound], shrinking the buffer by
    ///  [PacketLayer::trailer_len] bytes, or rejects the datagram.
    fn process_inbound(&self, buf: &mut BytesMut) -> Result<(), PacketRejected>;
}

pub struct PacketPipeline {
    layers: Vec<Arc<dyn PacketLayer>>,
}

impl PacketPipeline {
    pub fn new(layers: Vec<Arc<dyn PacketLayer>>) -> PacketPipeline {
        PacketPipeline { layers }
    }

    pub fn from_config(config: &RudpConfig) -> PacketPipeline {
        let mut layers: Vec<Arc<dyn PacketLayer>> = Vec::new();
        if config.checksum_enabled {
            layers.push(Arc::new(Crc32cLayer));
        }
        if let Some(key) = &config.encryption_key {
            info!("setting up AES encryption");
            layers.push(Arc::new(Aes256GcmLayer::new(key)));
        }
        PacketPipeline::new(layers)
    }

    /// total number of bytes added to a datagram by all stages
    pub fn overhead(&self) -> usize {
        self.layers.iter()
            .map(|l| l.trailer_len())
            .sum()
    }

    pub fn min_inbound_len(&self) -> usize {
        PacketHeader::SERIALIZED_LEN + self.overhead()
    }

    pub fn process_outbound(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        for layer in &self.layers {
            layer.process_outbound(buf)?;
        }
        Ok(())
    }

    pub fn process_inbound(&self, buf: &mut BytesMut) -> Result<(), PacketRejected> {
        if buf.len() < self.min_inbound_len() {
            return Err(PacketRejected::Undersized { len: buf.len(), min_len: self.min_inbound_len() });
        }

        for layer in self.layers.iter().rev() {
            layer.process_inbound(buf)?;
        }
        Ok(())
    }
}
