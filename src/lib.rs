// guardport public library surface.

pub mod api;

pub mod buffer;

pub mod codec;

pub mod config;

pub mod crypto;

pub mod fragment;

pub mod io;

pub mod metrics;

pub mod queue;

pub mod registry;

pub mod replay;

pub mod runtime;

pub mod session;

pub mod transport;

pub mod wire;

pub use api::{
    ChannelHandler, CloseReason, DataKind, Dispatch, HandshakeKind, InboundMessage, MessageHandler,
    MessageType, NodeId, PeerInfo, TransportEvent,
};

pub use buffer::{BufferFull, BufferLayout, BufferPool, PooledBuffer, PATH_MTU};

pub use codec::CodecError;

pub use config::{Config, ConfigError, FragmentConfig, IdentityConfig, PeerConfig};

pub use crypto::{
    kdf::{KdfError, KeySet, MasterSecret, SessionKeys},
    kex::{HybridKeyExchange, KexError, KeyExchange, KeyPair, Role, SharedSecret},
    mac::{MacError, TAG_LEN},
    trust::{Psk, TrustError, TrustStore},
};

pub use fragment::{FragmentError, FragmentLimits};

pub use metrics::{DropReason, Metrics, MetricsError};

pub use queue::SendQueue;

pub use registry::{Arena, ConnectingTable, Handle, Registry};

pub use replay::{IndexGuess, ReplayGuard};

pub use runtime::{
    spawn_transport, spawn_transport_with_config, HandleError, RuntimeConfig, RuntimeEvent,
    StopReason, TransportHandle,
};

pub use session::{HandshakeState, Session, SessionError};

pub use transport::{MaintenanceReport, MessageWriter, Transport, TransportError};

pub use wire::{Envelope, WireError};
