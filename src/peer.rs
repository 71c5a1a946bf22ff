use crate::channel::{Channel, DeliveryMethod};
use crate::config::RudpConfig;
use crate::error::{ChannelError, SendError};
use crate::event_listener::{DeliveryToken, DisconnectInfo, DisconnectReason, EventListener};
use crate::packet::{ConnectRequestPayload, PacketKind, RawPacket};
use crate::send_pipeline::SendPipeline;
use crate::util::rolling_data::RollingData;
use anyhow::bail;
use bytes::Bytes;
use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    Connected,
    ShutdownRequested,
    Disconnected,
}

struct Lifecycle {
    state: PeerState,
    entered_at: Instant,
    last_control_sent_at: Option<Instant>,
}

struct LatencyTracker {
    rtt_samples: RollingData<16>,
    reported_latency: Option<Duration>,
}

/// Listener notifications are collected while locks are held and dispatched after they are
///  released, so the listener is free to call back into the peer
enum Notification {
    Connected,
    Disconnected(DisconnectInfo),
    NetworkError(std::io::Error),
    Receive(Bytes, DeliveryMethod),
    Delivered(DeliveryToken),
    Latency(u32),
}

/// The connection to a single remote address, owning one channel per [DeliveryMethod].
///
/// Channel work (sending, receiving, ticking) holds the lifecycle's read lock, and each channel
///  has its own mutex. State transitions hold the write lock, so when a peer is torn down, there
///  is no channel work in progress, and all work after that sees the `Disconnected` state.
pub struct Peer {
    peer_addr: SocketAddr,
    config: Arc<RudpConfig>,
    send_pipeline: Arc<SendPipeline>,
    listener: Arc<dyn EventListener>,
    lifecycle: RwLock<Lifecycle>,
    channels: Vec<Mutex<Channel>>,
    connect_request: Bytes,
    latency: Mutex<LatencyTracker>,
    protocol_violations: AtomicU32,
}

impl Debug for Peer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Peer{{{:?}}}", self.peer_addr)
    }
}

impl Peer {
    /// a peer that will actively connect to a remote address when ticked
    pub fn new_outgoing(
        peer_addr: SocketAddr,
        config: Arc<RudpConfig>,
        send_pipeline: Arc<SendPipeline>,
        listener: Arc<dyn EventListener>,
        connect_data: Bytes,
        now: Instant,
    ) -> Peer {
        let connect_request = ConnectRequestPayload {
            protocol_id: config.protocol_id,
            data: connect_data,
        }.ser();
        Self::new(peer_addr, config, send_pipeline, listener, PeerState::Connecting, connect_request, now)
    }

    /// a peer whose connection request was accepted
    pub fn new_accepted(
        peer_addr: SocketAddr,
        config: Arc<RudpConfig>,
        send_pipeline: Arc<SendPipeline>,
        listener: Arc<dyn EventListener>,
        now: Instant,
    ) -> Peer {
        Self::new(peer_addr, config, send_pipeline, listener, PeerState::Connected, Bytes::new(), now)
    }

    fn new(
        peer_addr: SocketAddr,
        config: Arc<RudpConfig>,
        send_pipeline: Arc<SendPipeline>,
        listener: Arc<dyn EventListener>,
        state: PeerState,
        connect_request: Bytes,
        now: Instant,
    ) -> Peer {
        let pipeline_overhead = send_pipeline.pipeline().overhead();
        let channels = DeliveryMethod::ALL.iter()
            .map(|&method| Arc::new(config.get_effective_channel_config(method, pipeline_overhead)))
            .map(|channel_config| Mutex::new(Channel::new(channel_config)))
            .collect();

        Peer {
            peer_addr,
            send_pipeline,
            listener,
            lifecycle: RwLock::new(Lifecycle {
                state,
                entered_at: now,
                last_control_sent_at: None,
            }),
            channels,
            connect_request,
            latency: Mutex::new(LatencyTracker {
                rtt_samples: RollingData::new(),
                reported_latency: None,
            }),
            protocol_violations: AtomicU32::new(0),
            config,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub async fn state(&self) -> PeerState {
        self.lifecycle.read().await.state
    }

    pub async fn send(&self, delivery_method: DeliveryMethod, payload: &[u8]) -> anyhow::Result<()> {
        self.enqueue(delivery_method, payload, None).await
    }

    /// Sends a message on a reliable channel, notifying the event listener with `token` once the
    ///  entire message was acknowledged
    pub async fn send_with_delivery_event(&self, delivery_method: DeliveryMethod, payload: &[u8], token: DeliveryToken) -> anyhow::Result<()> {
        self.enqueue(delivery_method, payload, Some(token)).await
    }

    async fn enqueue(&self, delivery_method: DeliveryMethod, payload: &[u8], token: Option<DeliveryToken>) -> anyhow::Result<()> {
        let mut notifications = Vec::new();
        {
            let lifecycle = self.lifecycle.read().await;
            if lifecycle.state != PeerState::Connected {
                bail!("peer {:?} is {:?}", self.peer_addr, lifecycle.state);
            }

            let mut out = Vec::new();
            {
                let mut channel = self.channel(delivery_method).lock().await;
                channel.enqueue(payload, token)?;

                // unreliable channels have no window to wait for, and no reason to wait for a tick
                if !delivery_method.is_reliable() {
                    channel.tick(Instant::now(), Duration::ZERO, &mut out)?;
                }
            }
            self.send_all(&out, &mut notifications).await;
        }
        self.notify(notifications).await;
        Ok(())
    }

    fn channel(&self, delivery_method: DeliveryMethod) -> &Mutex<Channel> {
        // channels are created for all delivery methods, ordered by channel id
        &self.channels[delivery_method.channel_id() as usize]
    }

    /// Drives timeouts and retransmits. This is expected to be called periodically.
    pub async fn tick(&self, now: Instant) {
        let mut notifications = Vec::new();

        let state = self.state().await;
        match state {
            PeerState::Connected => {
                if let Err(e) = self.tick_channels(now, &mut notifications).await {
                    warn!("peer {:?}: {} - disconnecting", self.peer_addr, e);
                    self.transition_to_disconnected(DisconnectReason::Timeout.into(), &mut notifications).await;
                }
            }
            PeerState::Connecting | PeerState::ShutdownRequested => {
                self.tick_handshake(now, &mut notifications).await;
            }
            PeerState::Disconnected => {}
        }

        self.notify(notifications).await;
    }

    async fn tick_channels(&self, now: Instant, notifications: &mut Vec<Notification>) -> Result<(), ChannelError> {
        let lifecycle = self.lifecycle.read().await;
        if lifecycle.state != PeerState::Connected {
            return Ok(());
        }

        let rto = self.rto().await;
        let mut out = Vec::new();
        let mut result = Ok(());
        for channel in &self.channels {
            if let Err(e) = channel.lock().await.tick(now, rto, &mut out) {
                result = Err(e);
                break;
            }
        }

        self.send_all(&out, notifications).await;
        result
    }

    async fn tick_handshake(&self, now: Instant, notifications: &mut Vec<Notification>) {
        let mut lifecycle = self.lifecycle.write().await;

        let (timeout, retry_interval, control_packet) = match lifecycle.state {
            PeerState::Connecting => (
                self.config.connect_timeout,
                self.config.connect_retry_interval,
                RawPacket::control(PacketKind::ConnectRequest, self.connect_request.clone()),
            ),
            PeerState::ShutdownRequested => (
                self.config.disconnect_timeout,
                self.config.shutdown_retry_interval,
                RawPacket::control(PacketKind::Disconnect, Bytes::new()),
            ),
            _ => return,
        };

        if now.duration_since(lifecycle.entered_at) >= timeout {
            let reason = if lifecycle.state == PeerState::Connecting {
                debug!("peer {:?}: connect timed out", self.peer_addr);
                DisconnectReason::ConnectionFailed
            }
            else {
                debug!("peer {:?}: no shutdown confirmation - giving up", self.peer_addr);
                DisconnectReason::DisconnectPeerCalled
            };
            self.do_disconnect(&mut lifecycle, reason.into(), notifications).await;
            return;
        }

        let is_due = lifecycle.last_control_sent_at
            .map_or(true, |t| now.duration_since(t) >= retry_interval);
        if is_due {
            lifecycle.last_control_sent_at = Some(now);
            self.send_all(&[control_packet], notifications).await;
        }
    }

    pub async fn on_packet(&self, packet: RawPacket, now: Instant) {
        let mut notifications = Vec::new();

        match packet.header.kind {
            PacketKind::Channel => self.on_channel_packet(packet, now, &mut notifications).await,
            _ => self.on_control_packet(packet, now, &mut notifications).await,
        }

        self.notify(notifications).await;
    }

    async fn on_channel_packet(&self, packet: RawPacket, now: Instant, notifications: &mut Vec<Notification>) {
        let result = {
            let lifecycle = self.lifecycle.read().await;
            if lifecycle.state != PeerState::Connected {
                trace!("peer {:?} is {:?} - dropping channel packet", self.peer_addr, lifecycle.state);
                return;
            }

            self.process_channel_packet(packet, now, notifications).await
        };

        if let Err(e) = result {
            self.on_protocol_violation(e, notifications).await;
        }
    }

    async fn process_channel_packet(&self, packet: RawPacket, now: Instant, notifications: &mut Vec<Notification>) -> Result<(), ChannelError> {
        let Some(delivery_method) = DeliveryMethod::from_channel_id(packet.header.channel_id) else {
            return Err(ChannelError::ProtocolViolation(format!("unknown channel id {}", packet.header.channel_id)));
        };

        if packet.header.is_ack {
            let ack_bitfield = packet.ack_bitfield()
                .map_err(|e| ChannelError::ProtocolViolation(e.to_string()))?;
            let outcome = self.channel(delivery_method).lock().await
                .on_ack_received(packet.header.sequence, ack_bitfield, now)?;

            if let Some(rtt) = outcome.rtt_sample {
                self.on_rtt_sample(rtt, notifications).await;
            }
            notifications.extend(outcome.delivered.into_iter().map(Notification::Delivered));
        }
        else {
            let payloads = self.channel(delivery_method).lock().await
                .on_receive(packet)?;
            notifications.extend(payloads.into_iter().map(|p| Notification::Receive(p, delivery_method)));
        }
        Ok(())
    }

    async fn on_control_packet(&self, packet: RawPacket, now: Instant, notifications: &mut Vec<Notification>) {
        let mut lifecycle = self.lifecycle.write().await;

        match (packet.header.kind, lifecycle.state) {
            (PacketKind::ConnectAccept, PeerState::Connecting) => {
                info!("connected to {:?}", self.peer_addr);
                lifecycle.state = PeerState::Connected;
                lifecycle.entered_at = now;
                notifications.push(Notification::Connected);
            }
            (PacketKind::ConnectReject, PeerState::Connecting) => {
                let reason = packet.payload.first()
                    .and_then(|&raw| DisconnectReason::try_from(raw).ok())
                    .unwrap_or(DisconnectReason::ConnectionRejected);
                debug!("connection to {:?} was rejected: {:?}", self.peer_addr, reason);
                self.do_disconnect(&mut lifecycle, reason.into(), notifications).await;
            }
            (PacketKind::ConnectRequest, PeerState::Connected) => {
                debug!("repeated connection request from {:?} - accept was probably lost", self.peer_addr);
                self.send_all(&[RawPacket::control(PacketKind::ConnectAccept, Bytes::new())], notifications).await;
            }
            (PacketKind::Disconnect, state) => {
                self.send_all(&[RawPacket::control(PacketKind::ShutdownOk, Bytes::new())], notifications).await;
                if state != PeerState::Disconnected {
                    debug!("peer {:?} closed the connection", self.peer_addr);
                    self.do_disconnect(&mut lifecycle, DisconnectReason::RemoteConnectionClose.into(), notifications).await;
                }
            }
            (PacketKind::ShutdownOk, PeerState::ShutdownRequested) => {
                self.do_disconnect(&mut lifecycle, DisconnectReason::DisconnectPeerCalled.into(), notifications).await;
            }
            (kind, state) => {
                trace!("peer {:?}: ignoring {:?} in state {:?}", self.peer_addr, kind, state);
            }
        }
    }

    /// Starts the disconnect handshake. Messages that were not sent yet are discarded.
    pub async fn disconnect(&self, now: Instant) {
        let mut notifications = Vec::new();
        {
            let mut lifecycle = self.lifecycle.write().await;
            match lifecycle.state {
                PeerState::Connected => {
                    debug!("peer {:?}: requesting shutdown", self.peer_addr);
                    lifecycle.state = PeerState::ShutdownRequested;
                    lifecycle.entered_at = now;
                    lifecycle.last_control_sent_at = Some(now);
                    self.clear_channels().await;
                    self.send_all(&[RawPacket::control(PacketKind::Disconnect, Bytes::new())], &mut notifications).await;
                }
                PeerState::Connecting => {
                    self.do_disconnect(&mut lifecycle, DisconnectReason::DisconnectPeerCalled.into(), &mut notifications).await;
                }
                PeerState::ShutdownRequested | PeerState::Disconnected => {}
            }
        }
        self.notify(notifications).await;
    }

    /// Disconnects immediately, without notifying the remote peer
    pub async fn force_disconnect(&self, info: DisconnectInfo) {
        let mut notifications = Vec::new();
        self.transition_to_disconnected(info, &mut notifications).await;
        self.notify(notifications).await;
    }

    async fn transition_to_disconnected(&self, info: DisconnectInfo, notifications: &mut Vec<Notification>) {
        let mut lifecycle = self.lifecycle.write().await;
        self.do_disconnect(&mut lifecycle, info, notifications).await;
    }

    async fn do_disconnect(&self, lifecycle: &mut Lifecycle, info: DisconnectInfo, notifications: &mut Vec<Notification>) {
        if lifecycle.state == PeerState::Disconnected {
            return;
        }

        info!("peer {:?} disconnected: {:?}", self.peer_addr, info.reason);
        lifecycle.state = PeerState::Disconnected;
        self.clear_channels().await;
        notifications.push(Notification::Disconnected(info));
    }

    /// must only be called while holding the lifecycle's write lock
    async fn clear_channels(&self) {
        for channel in &self.channels {
            channel.lock().await.clear();
        }
    }

    async fn on_protocol_violation(&self, e: ChannelError, notifications: &mut Vec<Notification>) {
        let num_violations = self.protocol_violations.fetch_add(1, Ordering::AcqRel) + 1;
        warn!("peer {:?}: {} - dropping packet ({} violations)", self.peer_addr, e, num_violations);

        if let Some(max_violations) = self.config.max_protocol_violations {
            if num_violations > max_violations {
                self.transition_to_disconnected(DisconnectReason::InvalidProtocol.into(), notifications).await;
            }
        }
    }

    async fn on_rtt_sample(&self, rtt: Duration, notifications: &mut Vec<Notification>) {
        let mut latency = self.latency.lock().await;
        latency.rtt_samples.add_value(rtt.as_nanos() as f64);

        let Some(mean_rtt) = latency.rtt_samples.mean() else {
            return;
        };
        let new_latency = duration_from_nanos(mean_rtt / 2.0);

        let is_significant = match latency.reported_latency {
            None => true,
            Some(prev) => {
                let change = if prev > new_latency { prev - new_latency } else { new_latency - prev };
                change >= self.config.latency_update_threshold
            }
        };
        if is_significant {
            latency.reported_latency = Some(new_latency);
            let millis = new_latency.as_millis().min(u32::MAX as u128) as u32;
            notifications.push(Notification::Latency(millis));
        }
    }

    /// smoothed one-way latency, i.e. half the round trip time
    pub async fn latency(&self) -> Option<Duration> {
        self.latency.lock().await
            .rtt_samples.mean()
            .map(|rtt| duration_from_nanos(rtt / 2.0))
    }

    /// The retransmit timeout before backoff. This is derived from the round trip time's mean and
    ///  standard deviation, similar to TCP.
    pub async fn rto(&self) -> Duration {
        let latency = self.latency.lock().await;
        let reliability = &self.config.reliability;

        match latency.rtt_samples.mean() {
            None => reliability.initial_rto,
            Some(mean) => {
                duration_from_nanos(mean + 4.0 * latency.rtt_samples.std_dev())
                    .clamp(reliability.min_rto, reliability.max_rto)
            }
        }
    }

    pub fn protocol_violations(&self) -> u32 {
        self.protocol_violations.load(Ordering::Acquire)
    }

    pub async fn packets_in_queue(&self, delivery_method: DeliveryMethod) -> usize {
        self.channel(delivery_method).lock().await
            .packets_in_queue()
    }

    pub async fn packets_in_flight(&self, delivery_method: DeliveryMethod) -> usize {
        self.channel(delivery_method).lock().await
            .packets_in_flight()
    }

    async fn send_all(&self, packets: &[RawPacket], notifications: &mut Vec<Notification>) {
        for packet in packets {
            match self.send_pipeline.send_packet(self.peer_addr, packet).await {
                Ok(()) => {}
                Err(SendError::Io(e)) => {
                    debug!("error sending to {:?}: {}", self.peer_addr, e);
                    notifications.push(Notification::NetworkError(e));
                }
                Err(e) => {
                    error!("error sending to {:?}: {}", self.peer_addr, e);
                }
            }
        }
    }

    async fn notify(&self, notifications: Vec<Notification>) {
        for notification in notifications {
            match notification {
                Notification::Connected => self.listener.on_peer_connected(self.peer_addr).await,
                Notification::Disconnected(info) => self.listener.on_peer_disconnected(self.peer_addr, info).await,
                Notification::NetworkError(e) => self.listener.on_network_error(Some(self.peer_addr), e.kind(), e.raw_os_error()).await,
                Notification::Receive(payload, method) => self.listener.on_network_receive(self.peer_addr, &payload, method).await,
                Notification::Delivered(token) => self.listener.on_message_delivered(self.peer_addr, token).await,
                Notification::Latency(millis) => self.listener.on_latency_update(self.peer_addr, millis).await,
            }
        }
    }
}

/// RTT samples are tracked as nanoseconds
fn duration_from_nanos(nanos: f64) -> Duration {
    Duration::from_nanos(nanos.max(0.0) as u64)
}
