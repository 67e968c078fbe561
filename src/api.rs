// Public types handed to integrators: node ids, message types and the
// handler trait invoked for authenticated inbound traffic.
use std::{fmt, net::SocketAddr, num::NonZeroU64, time::Instant};

use bytes::Bytes;

/// Identity of a ledger node. Zero is reserved for handshake traffic and is
/// never a valid node id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(NonZeroU64);

impl NodeId {
    /// Returns `None` for the reserved id 0.
    pub const fn new(id: u64) -> Option<Self> {
        match NonZeroU64::new(id) {
            Some(id) => Some(Self(id)),
            None => None,
        }
    }

    pub const fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Message-type byte carried inside every envelope.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    ClientHello = 0,
    ServerHello = 1,
    Transaction = 2,
    Guard = 3,
    GuardState = 4,
    Ping = 5,
    Confirm = 6,
}

impl MessageType {
    /// Splits the type space into handshake and application traffic.
    pub const fn dispatch(self) -> Dispatch {
        match self {
            MessageType::ClientHello => Dispatch::Handshake(HandshakeKind::ClientHello),
            MessageType::ServerHello => Dispatch::Handshake(HandshakeKind::ServerHello),
            MessageType::Confirm => Dispatch::Handshake(HandshakeKind::Confirm),
            MessageType::Transaction => Dispatch::Data(DataKind::Transaction),
            MessageType::Guard => Dispatch::Data(DataKind::Guard),
            MessageType::GuardState => Dispatch::Data(DataKind::GuardState),
            MessageType::Ping => Dispatch::Data(DataKind::Ping),
        }
    }

    pub const fn is_handshake(self) -> bool {
        matches!(self.dispatch(), Dispatch::Handshake(_))
    }
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageType::ClientHello),
            1 => Ok(MessageType::ServerHello),
            2 => Ok(MessageType::Transaction),
            3 => Ok(MessageType::Guard),
            4 => Ok(MessageType::GuardState),
            5 => Ok(MessageType::Ping),
            6 => Ok(MessageType::Confirm),
            other => Err(other),
        }
    }
}

impl From<MessageType> for u8 {
    fn from(value: MessageType) -> Self {
        value as u8
    }
}

/// Routing decision for an inbound message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Handshake(HandshakeKind),
    Data(DataKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeKind {
    ClientHello,
    ServerHello,
    Confirm,
}

/// Application message kinds. Payload contents are opaque to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataKind {
    Transaction,
    Guard,
    GuardState,
    Ping,
}

impl DataKind {
    pub const fn all() -> [DataKind; 4] {
        [
            DataKind::Transaction,
            DataKind::Guard,
            DataKind::GuardState,
            DataKind::Ping,
        ]
    }
}

impl From<DataKind> for MessageType {
    fn from(kind: DataKind) -> Self {
        match kind {
            DataKind::Transaction => MessageType::Transaction,
            DataKind::Guard => MessageType::Guard,
            DataKind::GuardState => MessageType::GuardState,
            DataKind::Ping => MessageType::Ping,
        }
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DataKind::Transaction => "transaction",
            DataKind::Guard => "guard",
            DataKind::GuardState => "guard_state",
            DataKind::Ping => "ping",
        };
        f.write_str(label)
    }
}

/// Authenticated peer at the moment its session became established.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub node_id: NodeId,
    pub endpoint: SocketAddr,
    pub established_at: Instant,
}

/// Why a session left the active registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed through [`crate::transport::Transport::close`].
    Local,
    /// No authenticated traffic within the idle timeout.
    IdleTimeout,
    /// A newer handshake from the same node replaced it.
    Superseded,
    Shutdown,
}

/// Decrypted, authenticated and reassembled application payload.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub from: NodeId,
    pub endpoint: SocketAddr,
    pub kind: DataKind,
    /// Extended sequence index of the first packet carrying the message.
    pub index: u64,
    pub payload: Bytes,
}

/// Receives application traffic from the transport's receive loop.
///
/// Callbacks run inline on the receive loop; implementations hand work off
/// rather than block.
pub trait MessageHandler: Send + Sync + 'static {
    fn on_message(&self, message: InboundMessage);

    fn on_session_established(&self, _peer: &PeerInfo) {}

    fn on_session_closed(&self, _node_id: NodeId, _reason: CloseReason) {}
}

/// Events forwarded by [`ChannelHandler`].
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Message(InboundMessage),
    Established(PeerInfo),
    Closed { node_id: NodeId, reason: CloseReason },
}

/// Handler that forwards everything into a bounded channel, dropping events
/// when the consumer falls behind.
#[derive(Debug, Clone)]
pub struct ChannelHandler {
    tx: tokio::sync::mpsc::Sender<TransportEvent>,
}

impl ChannelHandler {
    pub fn new(capacity: usize) -> (Self, tokio::sync::mpsc::Receiver<TransportEvent>) {
        let (tx, rx) = tokio::sync::mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    fn push(&self, event: TransportEvent) {
        if let Err(err) = self.tx.try_send(event) {
            tracing::debug!(?err, "transport event dropped");
        }
    }
}

impl MessageHandler for ChannelHandler {
    fn on_message(&self, message: InboundMessage) {
        self.push(TransportEvent::Message(message));
    }

    fn on_session_established(&self, peer: &PeerInfo) {
        self.push(TransportEvent::Established(peer.clone()));
    }

    fn on_session_closed(&self, node_id: NodeId, reason: CloseReason) {
        self.push(TransportEvent::Closed { node_id, reason });
    }
}
