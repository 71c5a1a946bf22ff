use crate::error::SendError;
use crate::packet::RawPacket;
use crate::pipeline::PacketPipeline;
use async_trait::async_trait;
use bytes::BytesMut;
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::trace;

/// This is an abstraction for sending a buffer on a UDP socket, introduced to facilitate mocking
///  the I/O part away for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) -> std::io::Result<()>;

    fn local_addr(&self) -> SocketAddr;
}

#[async_trait]
impl SendSocket for Arc<UdpSocket> {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) -> std::io::Result<()> {
        trace!("UDP socket: sending packet to {:?}", to);
        self.send_to(packet_buf, to).await?;
        Ok(())
    }

    fn local_addr(&self) -> SocketAddr {
        self.as_ref().local_addr()
            .expect("UdpSocket should have an initialized local addr")
    }
}

/// Serializes packets, passes them through the outbound packet pipeline and hands them to the
///  socket
#[derive(Clone)]
pub struct SendPipeline {
    socket: Arc<dyn SendSocket>,
    pipeline: Arc<PacketPipeline>,
    payload_size_inside_udp: usize,
}

impl SendPipeline {
    pub fn new(socket: Arc<dyn SendSocket>, pipeline: Arc<PacketPipeline>, payload_size_inside_udp: usize) -> SendPipeline {
        SendPipeline { socket, pipeline, payload_size_inside_udp }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    pub fn pipeline(&self) -> &PacketPipeline {
        &self.pipeline
    }

    pub async fn send_packet(&self, to: SocketAddr, packet: &RawPacket) -> Result<(), SendError> {
        let mut buf = BytesMut::with_capacity(packet.serialized_len() + self.pipeline.overhead());
        packet.ser(&mut buf);
        self.pipeline.process_outbound(&mut buf)
            .map_err(|e| SendError::Layer(e.to_string()))?;

        if buf.len() > self.payload_size_inside_udp {
            return Err(SendError::ExceedsPayloadSize { len: buf.len(), max_len: self.payload_size_inside_udp });
        }

        trace!("sending {:?} packet #{} on channel {} to {:?} ({} bytes)", packet.header.kind, packet.header.sequence, packet.header.channel_id, to, buf.len());
        self.socket.do_send_packet(to, &buf).await?;
        Ok(())
    }
}
