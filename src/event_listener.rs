use crate::channel::DeliveryMethod;
use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::net::SocketAddr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum DisconnectReason {
    ConnectionFailed = 0,
    Timeout = 1,
    HostUnreachable = 2,
    NetworkUnreachable = 3,
    RemoteConnectionClose = 4,
    DisconnectPeerCalled = 5,
    ConnectionRejected = 6,
    InvalidProtocol = 7,
    UnknownHost = 8,
    Reconnect = 9,
    PeerToPeerConnection = 10,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DisconnectInfo {
    pub reason: DisconnectReason,
    /// the OS error code if the disconnect was caused by a socket error
    pub socket_error_code: Option<i32>,
}

impl From<DisconnectReason> for DisconnectInfo {
    fn from(reason: DisconnectReason) -> Self {
        DisconnectInfo { reason, socket_error_code: None }
    }
}

/// Opaque value supplied by the application when sending, and handed back when the message
///  was fully acknowledged
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DeliveryToken(pub u64);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionRequest {
    pub peer_addr: SocketAddr,
    /// application data sent along with the request
    pub data: Bytes,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionDecision {
    Accept,
    Reject,
}

/// The application's view of the transport. All notifications for a given peer are made from
///  the task that processes that peer's packets or ticks, so implementations should hand off
///  expensive work rather than doing it inline.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventListener: Send + Sync + 'static {
    async fn on_peer_connected(&self, peer_addr: SocketAddr);

    /// called exactly once per peer that was handed to the application, or whose connect
    ///  attempt failed
    async fn on_peer_disconnected(&self, peer_addr: SocketAddr, info: DisconnectInfo);

    async fn on_network_error(&self, peer_addr: Option<SocketAddr>, kind: std::io::ErrorKind, raw_os_error: Option<i32>);

    async fn on_network_receive(&self, peer_addr: SocketAddr, payload: &[u8], delivery_method: DeliveryMethod);

    async fn on_latency_update(&self, peer_addr: SocketAddr, latency_millis: u32);

    async fn on_message_delivered(&self, peer_addr: SocketAddr, token: DeliveryToken);

    async fn on_connection_request(&self, request: &ConnectionRequest) -> ConnectionDecision;
}

/// Ignores all events, accepting every connection request
pub struct NoopEventListener;

#[async_trait]
impl EventListener for NoopEventListener {
    async fn on_peer_connected(&self, _peer_addr: SocketAddr) {}

    async fn on_peer_disconnected(&self, _peer_addr: SocketAddr, _info: DisconnectInfo) {}

    async fn on_network_error(&self, _peer_addr: Option<SocketAddr>, _kind: std::io::ErrorKind, _raw_os_error: Option<i32>) {}

    async fn on_network_receive(&self, _peer_addr: SocketAddr, _payload: &[u8], _delivery_method: DeliveryMethod) {}

    async fn on_latency_update(&self, _peer_addr: SocketAddr, _latency_millis: u32) {}

    async fn on_message_delivered(&self, _peer_addr: SocketAddr, _token: DeliveryToken) {}

    async fn on_connection_request(&self, _request: &ConnectionRequest) -> ConnectionDecision {
        ConnectionDecision::Accept
    }
}
