use crate::channel::DeliveryMethod;
use crate::config::RudpConfig;
use crate::error::SendError;
use crate::event_listener::{ConnectionDecision, ConnectionRequest, DeliveryToken, DisconnectReason, EventListener};
use crate::packet::{ConnectRequestPayload, PacketKind, RawPacket};
use crate::peer::{Peer, PeerState};
use crate::pipeline::PacketPipeline;
use crate::send_pipeline::{SendPipeline, SendSocket};
use anyhow::{anyhow, bail};
use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::RwLock;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, span, trace, Instrument, Level};
use uuid::Uuid;

/// EndPoint is the place where all other parts of the protocol come together: It listens on a
///  UdpSocket, dispatching incoming datagrams to their peers, ticks all peers periodically, and
///  has an API for application code to connect and send messages.
pub struct EndPoint {
    config: Arc<RudpConfig>,
    receive_socket: Option<Arc<UdpSocket>>,
    send_pipeline: Arc<SendPipeline>,
    peers: RwLock<FxHashMap<SocketAddr, Arc<Peer>>>,
    listener: Arc<dyn EventListener>,
}

impl EndPoint {
    pub async fn bind(config: Arc<RudpConfig>, listener: Arc<dyn EventListener>) -> anyhow::Result<EndPoint> {
        config.validate()?;

        let receive_socket = Arc::new(UdpSocket::bind(config.self_addr).await?);
        info!("bound receive socket to {:?}", receive_socket.as_ref().local_addr()?);

        let send_socket = Arc::new(receive_socket.clone());
        Ok(Self::create(config, Some(receive_socket), send_socket, listener))
    }

    /// Creates an end point without a receive socket. Datagrams are handed in through
    ///  [EndPoint::on_datagram] instead.
    pub fn new(config: Arc<RudpConfig>, send_socket: Arc<dyn SendSocket>, listener: Arc<dyn EventListener>) -> anyhow::Result<EndPoint> {
        config.validate()?;
        Ok(Self::create(config, None, send_socket, listener))
    }

    fn create(config: Arc<RudpConfig>, receive_socket: Option<Arc<UdpSocket>>, send_socket: Arc<dyn SendSocket>, listener: Arc<dyn EventListener>) -> EndPoint {
        let pipeline = Arc::new(PacketPipeline::from_config(&config));
        EndPoint {
            send_pipeline: Arc::new(SendPipeline::new(send_socket, pipeline, config.payload_size_inside_udp)),
            config,
            receive_socket,
            peers: Default::default(),
            listener,
        }
    }

    pub fn self_addr(&self) -> SocketAddr {
        self.send_pipeline.local_addr()
    }

    /// Starts connecting to a remote address. The event listener is notified when the connection
    ///  is established, or when it fails.
    pub async fn connect(&self, peer_addr: SocketAddr, connect_data: &[u8]) -> anyhow::Result<Arc<Peer>> {
        let now = Instant::now();
        let peer = {
            let mut peers = self.peers.write().await;
            if let Some(existing) = peers.get(&peer_addr) {
                if existing.state().await != PeerState::Disconnected {
                    bail!("there is already a connection to {:?}", peer_addr);
                }
            }

            debug!("connecting to {:?}", peer_addr);
            let peer = Arc::new(Peer::new_outgoing(
                peer_addr,
                self.config.clone(),
                self.send_pipeline.clone(),
                self.listener.clone(),
                Bytes::copy_from_slice(connect_data),
                now,
            ));
            peers.insert(peer_addr, peer.clone());
            peer
        };

        // sends the connection request
        peer.tick(now).await;
        Ok(peer)
    }

    pub async fn get_peer(&self, peer_addr: SocketAddr) -> Option<Arc<Peer>> {
        self.peers.read().await
            .get(&peer_addr)
            .cloned()
    }

    pub async fn peers(&self) -> Vec<Arc<Peer>> {
        self.peers.read().await
            .values()
            .cloned()
            .collect()
    }

    pub async fn send(&self, to: SocketAddr, delivery_method: DeliveryMethod, payload: &[u8]) -> anyhow::Result<()> {
        self.require_peer(to).await?
            .send(delivery_method, payload).await
    }

    pub async fn send_with_delivery_event(&self, to: SocketAddr, delivery_method: DeliveryMethod, payload: &[u8], token: DeliveryToken) -> anyhow::Result<()> {
        self.require_peer(to).await?
            .send_with_delivery_event(delivery_method, payload, token).await
    }

    async fn require_peer(&self, peer_addr: SocketAddr) -> anyhow::Result<Arc<Peer>> {
        self.get_peer(peer_addr).await
            .ok_or_else(|| anyhow!("no connection to {:?}", peer_addr))
    }

    pub async fn disconnect(&self, peer_addr: SocketAddr) -> anyhow::Result<()> {
        self.require_peer(peer_addr).await?
            .disconnect(Instant::now()).await;
        Ok(())
    }

    /// Processes a single datagram as it was received from the socket
    pub async fn on_datagram(&self, from: SocketAddr, buf: BytesMut, now: Instant) {
        let correlation_id = Uuid::new_v4();
        let span = span!(Level::TRACE, "datagram_received", ?correlation_id);

        self.do_on_datagram(from, buf, now)
            .instrument(span)
            .await
    }

    async fn do_on_datagram(&self, from: SocketAddr, mut buf: BytesMut, now: Instant) {
        trace!("received datagram from {:?}: {} bytes", from, buf.len());

        if let Err(e) = self.send_pipeline.pipeline().process_inbound(&mut buf) {
            debug!("datagram from {:?} rejected: {} - dropping", from, e);
            return;
        }

        let packet = match RawPacket::deser(buf.freeze()) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("unparsable datagram from {:?}: {} - dropping", from, e);
                return;
            }
        };

        if let Some(peer) = self.get_peer(from).await {
            // a new connection request from an address whose previous connection was closed
            let is_reconnect = packet.header.kind == PacketKind::ConnectRequest
                && peer.state().await == PeerState::Disconnected;
            if !is_reconnect {
                peer.on_packet(packet, now).await;
                return;
            }
        }

        self.on_packet_from_unknown_addr(from, packet, now).await;
    }

    async fn on_packet_from_unknown_addr(&self, from: SocketAddr, packet: RawPacket, now: Instant) {
        match packet.header.kind {
            PacketKind::ConnectRequest => {
                self.on_connection_request(from, &packet.payload, now).await;
            }
            PacketKind::Disconnect => {
                // the previous shutdown-ok was lost
                self.send_control(from, PacketKind::ShutdownOk, Bytes::new()).await;
            }
            kind => {
                trace!("{:?} packet from unknown address {:?} - dropping", kind, from);
            }
        }
    }

    async fn on_connection_request(&self, from: SocketAddr, payload: &Bytes, now: Instant) {
        let request = match ConnectRequestPayload::deser(payload) {
            Ok(request) => request,
            Err(e) => {
                debug!("malformed connection request from {:?}: {} - dropping", from, e);
                return;
            }
        };

        if request.protocol_id != self.config.protocol_id {
            debug!("connection request from {:?} with protocol id {} - rejecting", from, request.protocol_id);
            let reason: u8 = DisconnectReason::InvalidProtocol.into();
            self.send_control(from, PacketKind::ConnectReject, Bytes::copy_from_slice(&[reason])).await;
            return;
        }

        let decision = self.listener.on_connection_request(&ConnectionRequest {
            peer_addr: from,
            data: request.data,
        }).await;

        match decision {
            ConnectionDecision::Accept => {
                info!("accepted connection from {:?}", from);
                let peer = Arc::new(Peer::new_accepted(
                    from,
                    self.config.clone(),
                    self.send_pipeline.clone(),
                    self.listener.clone(),
                    now,
                ));
                self.peers.write().await
                    .insert(from, peer);

                self.send_control(from, PacketKind::ConnectAccept, Bytes::new()).await;
                self.listener.on_peer_connected(from).await;
            }
            ConnectionDecision::Reject => {
                debug!("rejected connection from {:?}", from);
                let reason: u8 = DisconnectReason::ConnectionRejected.into();
                self.send_control(from, PacketKind::ConnectReject, Bytes::copy_from_slice(&[reason])).await;
            }
        }
    }

    async fn send_control(&self, to: SocketAddr, kind: PacketKind, payload: Bytes) {
        match self.send_pipeline.send_packet(to, &RawPacket::control(kind, payload)).await {
            Ok(()) => {}
            Err(SendError::Io(e)) => {
                debug!("error sending {:?} to {:?}: {}", kind, to, e);
                self.listener.on_network_error(Some(to), e.kind(), e.raw_os_error()).await;
            }
            Err(e) => {
                error!("error sending {:?} to {:?}: {}", kind, to, e);
            }
        }
    }

    /// Ticks all peers, and removes peers that are disconnected
    pub async fn tick(&self, now: Instant) {
        let peers = self.peers().await;

        let mut disconnected = Vec::new();
        for peer in peers {
            peer.tick(now).await;
            if peer.state().await == PeerState::Disconnected {
                disconnected.push(peer);
            }
        }

        if !disconnected.is_empty() {
            let mut peers = self.peers.write().await;
            for peer in disconnected {
                // a reconnect may have replaced the peer in the meantime
                if peers.get(&peer.peer_addr()).is_some_and(|p| Arc::ptr_eq(p, &peer)) {
                    debug!("removing disconnected peer {:?}", peer.peer_addr());
                    peers.remove(&peer.peer_addr());
                }
            }
        }
    }

    pub async fn recv_loop(&self) {
        let Some(receive_socket) = &self.receive_socket else {
            error!("end point has no receive socket");
            return;
        };

        info!("starting receive loop");

        let mut buf = vec![0u8; u16::MAX as usize];
        loop {
            let (num_read, from) = match receive_socket.recv_from(&mut buf).await {
                Ok(x) => x,
                Err(e) => {
                    error!("socket error: {}", e);
                    self.listener.on_network_error(None, e.kind(), e.raw_os_error()).await;
                    continue;
                }
            };

            self.on_datagram(from, BytesMut::from(&buf[..num_read]), Instant::now()).await;
        }
    }

    pub async fn tick_loop(&self) {
        info!("starting tick loop");
        loop {
            sleep(self.config.tick_interval).await;
            self.tick(Instant::now()).await;
        }
    }

    /// runs the receive loop and the tick loop until the receive loop terminates
    pub async fn run(&self) {
        select! {
            _ = self.recv_loop() => {}
            _ = self.tick_loop() => {}
        }
    }
}
