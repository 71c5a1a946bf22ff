//! Test doubles for the I/O boundaries: a socket that records datagrams instead of sending them,
//!  and an event listener that records events. Together with [EndPoint::on_datagram] they allow
//!  driving two end points against each other without a network, dropping and reordering
//!  datagrams at will.

use crate::channel::DeliveryMethod;
use crate::config::RudpConfig;
use crate::end_point::EndPoint;
use crate::event_listener::{ConnectionDecision, ConnectionRequest, DeliveryToken, DisconnectInfo, EventListener};
use crate::packet::RawPacket;
use crate::send_pipeline::SendSocket;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use tokio::sync::RwLock;
use tokio::time::Instant;

/// convenience method for unit test code: create a [SocketAddr] based on a number, the same
///  number generating the same address and different numbers different addresses
pub fn test_addr_from_number(number: u16) -> SocketAddr {
    SocketAddrV4::new(Ipv4Addr::LOCALHOST, number).into()
}

pub fn test_config(number: u16) -> RudpConfig {
    RudpConfig::default_ipv4(test_addr_from_number(number))
}

pub struct RecordingSendSocket {
    local_addr: SocketAddr,
    sent: RwLock<Vec<(SocketAddr, Vec<u8>)>>,
}

impl RecordingSendSocket {
    pub fn new(local_addr: SocketAddr) -> Self {
        RecordingSendSocket {
            local_addr,
            sent: Default::default(),
        }
    }

    /// returns sent datagrams, clearing the internal buffer
    pub async fn sent_datagrams(&self) -> Vec<(SocketAddr, Vec<u8>)> {
        let mut lock = self.sent.write().await;
        std::mem::take(&mut *lock)
    }

    /// returns and clears sent datagrams, parsed as packets. This requires a packet pipeline
    ///  without stages.
    pub async fn sent_packets(&self) -> Vec<(SocketAddr, RawPacket)> {
        self.sent_datagrams().await
            .into_iter()
            .map(|(to, buf)| (to, RawPacket::deser(Bytes::from(buf)).unwrap()))
            .collect()
    }
}

#[async_trait]
impl SendSocket for RecordingSendSocket {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) -> std::io::Result<()> {
        self.sent.write().await.push((to, packet_buf.to_vec()));
        Ok(())
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ListenerEvent {
    Connected(SocketAddr),
    Disconnected(SocketAddr, DisconnectInfo),
    NetworkError(Option<SocketAddr>, std::io::ErrorKind),
    Receive(SocketAddr, Vec<u8>, DeliveryMethod),
    Latency(SocketAddr, u32),
    Delivered(SocketAddr, DeliveryToken),
    ConnectionRequest(SocketAddr, Vec<u8>),
}

pub struct RecordingEventListener {
    decision: ConnectionDecision,
    events: RwLock<Vec<ListenerEvent>>,
}

impl RecordingEventListener {
    pub fn new(decision: ConnectionDecision) -> Self {
        RecordingEventListener {
            decision,
            events: Default::default(),
        }
    }

    /// returns recorded events, clearing the internal buffer
    pub async fn events(&self) -> Vec<ListenerEvent> {
        let mut lock = self.events.write().await;
        std::mem::take(&mut *lock)
    }

    /// returns and clears recorded events, dropping latency updates since their timing is
    ///  hard to predict
    pub async fn events_without_latency(&self) -> Vec<ListenerEvent> {
        self.events().await
            .into_iter()
            .filter(|e| !matches!(e, ListenerEvent::Latency(..)))
            .collect()
    }

    async fn record(&self, event: ListenerEvent) {
        self.events.write().await.push(event);
    }
}

#[async_trait]
impl EventListener for RecordingEventListener {
    async fn on_peer_connected(&self, peer_addr: SocketAddr) {
        self.record(ListenerEvent::Connected(peer_addr)).await;
    }

    async fn on_peer_disconnected(&self, peer_addr: SocketAddr, info: DisconnectInfo) {
        self.record(ListenerEvent::Disconnected(peer_addr, info)).await;
    }

    async fn on_network_error(&self, peer_addr: Option<SocketAddr>, kind: std::io::ErrorKind, _raw_os_error: Option<i32>) {
        self.record(ListenerEvent::NetworkError(peer_addr, kind)).await;
    }

    async fn on_network_receive(&self, peer_addr: SocketAddr, payload: &[u8], delivery_method: DeliveryMethod) {
        self.record(ListenerEvent::Receive(peer_addr, payload.to_vec(), delivery_method)).await;
    }

    async fn on_latency_update(&self, peer_addr: SocketAddr, latency_millis: u32) {
        self.record(ListenerEvent::Latency(peer_addr, latency_millis)).await;
    }

    async fn on_message_delivered(&self, peer_addr: SocketAddr, token: DeliveryToken) {
        self.record(ListenerEvent::Delivered(peer_addr, token)).await;
    }

    async fn on_connection_request(&self, request: &ConnectionRequest) -> ConnectionDecision {
        self.record(ListenerEvent::ConnectionRequest(request.peer_addr, request.data.to_vec())).await;
        self.decision
    }
}

/// Hands all datagrams recorded by `from` to `to`, returning the number of datagrams
pub async fn transfer(from: &RecordingSendSocket, to: &EndPoint, now: Instant) -> usize {
    transfer_with(from, to, now, |datagrams| datagrams).await
}

/// Hands datagrams recorded by `from` to `to` after passing them through `network`, which
///  can drop, duplicate or reorder them. Returns the number of datagrams handed to `to`.
pub async fn transfer_with<F>(from: &RecordingSendSocket, to: &EndPoint, now: Instant, network: F) -> usize
where F: FnOnce(Vec<Vec<u8>>) -> Vec<Vec<u8>>
{
    let datagrams = from.sent_datagrams().await
        .into_iter()
        .filter(|(addr, _)| *addr == to.self_addr())
        .map(|(_, buf)| buf)
        .collect();

    let datagrams = network(datagrams);
    let num_datagrams = datagrams.len();
    for buf in datagrams {
        to.on_datagram(from.local_addr(), BytesMut::from(buf.as_slice()), now).await;
    }
    num_datagrams
}
