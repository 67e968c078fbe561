// transport.rs - socket owner: demultiplexes inbound datagrams onto sessions
// and seals outbound messages into the send queue.
//
// Lock order: connecting table, then rng. The registry lock is never taken
// while the connecting lock is held. No lock is held across an await.

use std::{
    io,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use parking_lot::Mutex;
use rand::{rngs::StdRng, SeedableRng};
use thiserror::Error;
use tokio::{net::UdpSocket, runtime::Handle};
use tracing::{debug, info, trace, warn};

use crate::{
    api::{
        CloseReason, DataKind, Dispatch, HandshakeKind, InboundMessage, MessageHandler, MessageType,
        NodeId, PeerInfo,
    },
    buffer::{BufferFull, BufferPool, PooledBuffer},
    config::{Config, ConfigError},
    crypto::{
        kex::{HybridKeyExchange, KeyExchange, Role},
        trust::TrustStore,
    },
    fragment::FragmentLimits,
    io::{bind_udp, open_outbound, Outbound},
    metrics::{DropReason, Metrics, MetricsError},
    queue::SendQueue,
    registry::{ConnectingTable, Registry},
    session::{HandshakeState, Session, SessionError},
    wire::{self, Body, Confirm, Envelope, Fragment, ServerHello, WireError},
};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Metrics(#[from] MetricsError),
    #[error("no established session with node {0}")]
    UnknownNode(u64),
    #[error("message of {len} bytes needs more than {max} fragments")]
    MessageTooLarge { len: usize, max: u64 },
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Buffer(#[from] BufferFull),
}

/// Payload under construction, backed by a pooled buffer whose header
/// reservation is still free.
#[derive(Debug)]
pub struct MessageWriter {
    kind: DataKind,
    buffer: PooledBuffer,
    limit: usize,
}

impl MessageWriter {
    pub fn kind(&self) -> DataKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Bytes that still fit in one datagram.
    pub fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.buffer.len())
    }

    pub fn write(&mut self, bytes: &[u8]) -> Result<(), BufferFull> {
        if bytes.len() > self.remaining() {
            return Err(BufferFull {
                requested: bytes.len(),
                available: self.remaining(),
            });
        }
        self.buffer.extend_from_slice(bytes)
    }

    pub fn as_slice(&self) -> &[u8] {
        self.buffer.as_slice()
    }
}

/// Work done by one [`Transport::maintenance_tick`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub expired_handshakes: usize,
    pub idle_sessions: usize,
    pub evicted_fragments: usize,
}

/// Reason a datagram was discarded, kept for metrics and debug logs only.
#[derive(Debug, Error)]
#[error("datagram dropped: {}", .reason.as_label())]
struct Dropped {
    reason: DropReason,
    #[source]
    cause: Option<SessionError>,
}

impl Dropped {
    fn new(reason: DropReason) -> Self {
        Self {
            reason,
            cause: None,
        }
    }
}

impl From<SessionError> for Dropped {
    fn from(err: SessionError) -> Self {
        let reason = match &err {
            SessionError::Replayed(_) => DropReason::Replay,
            SessionError::Mac(_) => DropReason::MacFailure,
            SessionError::Wire(_) | SessionError::Truncated | SessionError::MissingSequence => {
                DropReason::Malformed
            }
            SessionError::Fragment(_) => DropReason::Fragment,
            _ => DropReason::Handshake,
        };
        Self {
            reason,
            cause: Some(err),
        }
    }
}

impl From<WireError> for Dropped {
    fn from(err: WireError) -> Self {
        SessionError::Wire(err).into()
    }
}

/// One UDP endpoint multiplexing every peer session.
pub struct Transport {
    config: Config,
    local_id: NodeId,
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    raw: bool,
    queue: SendQueue<Outbound>,
    pool: BufferPool,
    limits: FragmentLimits,
    connecting: Mutex<ConnectingTable<Session>>,
    sessions: Mutex<Registry<Session>>,
    kex: Arc<dyn KeyExchange>,
    trust: TrustStore,
    rng: Mutex<StdRng>,
    handler: Arc<dyn MessageHandler>,
    metrics: Arc<Metrics>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("local_id", &self.local_id)
            .field("local_addr", &self.local_addr)
            .field("raw", &self.raw)
            .field("sessions", &self.sessions.lock().len())
            .finish_non_exhaustive()
    }
}

impl Transport {
    /// Binds with the default X25519 + ML-KEM-768 key exchange.
    pub async fn bind(config: Config, handler: Arc<dyn MessageHandler>) -> Result<Self, TransportError> {
        Self::bind_with(config, handler, Arc::new(HybridKeyExchange)).await
    }

    pub async fn bind_with(
        config: Config,
        handler: Arc<dyn MessageHandler>,
        kex: Arc<dyn KeyExchange>,
    ) -> Result<Self, TransportError> {
        config.validate()?;
        let trust = config.trust_store()?;
        let local_id = NodeId::new(trust.local_id())
            .ok_or_else(|| ConfigError::Validation("identity.node_id must be non-zero".into()))?;
        let metrics = Arc::new(Metrics::new()?);

        let socket = Arc::new(bind_udp(config.bind)?);
        let local_addr = socket.local_addr()?;
        let outbound = open_outbound(Arc::clone(&socket), config.raw_socket);
        let raw = outbound.is_raw();
        let pool = BufferPool::new(config.buffer_layout(raw), config.buffer_pool_size);
        let queue = SendQueue::new(outbound, Arc::clone(&metrics), Handle::current());

        info!(%local_addr, node_id = local_id.get(), raw, "transport bound");
        Ok(Self {
            limits: config.fragment_limits(),
            connecting: Mutex::new(ConnectingTable::new(config.connecting_capacity)),
            sessions: Mutex::new(Registry::new()),
            local_id,
            socket,
            local_addr,
            raw,
            queue,
            pool,
            kex,
            trust,
            rng: Mutex::new(StdRng::from_entropy()),
            handler,
            metrics,
            config,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// True when outbound IPv4 datagrams are framed through a raw socket.
    pub fn is_raw(&self) -> bool {
        self.raw
    }

    /// Largest payload carried by one datagram.
    pub fn max_payload(&self) -> usize {
        self.pool.layout().max_payload()
    }

    pub fn is_established(&self, node: NodeId) -> bool {
        self.sessions.lock().get(node.get()).is_some()
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        let sessions = self.sessions.lock();
        sessions
            .iter()
            .filter_map(|(node, session)| {
                Some(PeerInfo {
                    node_id: NodeId::new(node)?,
                    endpoint: session.endpoint(),
                    established_at: session.established_at()?,
                })
            })
            .collect()
    }

    pub fn pending_handshakes(&self) -> usize {
        self.connecting.lock().len()
    }

    /// Starts a handshake with `endpoint`, returning the local connect id.
    ///
    /// The outcome is reported through
    /// [`MessageHandler::on_session_established`].
    pub fn connect(&self, endpoint: SocketAddr) -> Result<u16, TransportError> {
        let now = Instant::now();
        let mut hello = Vec::new();
        let (connect_id, evicted) = {
            let mut connecting = self.connecting.lock();
            let inserted = connecting.try_insert_with(|connect_id| {
                let mut session = Session::initiator(endpoint, connect_id, self.limits, now);
                hello = session.send_client_hello(self.kex.as_ref(), &mut *self.rng.lock())?;
                Ok::<_, SessionError>(session)
            })?;
            self.metrics.pending_handshakes.set(connecting.len() as i64);
            inserted
        };
        self.note_overwrite(evicted);
        self.metrics.handshakes_started.inc();
        debug!(peer = %endpoint, connect_id, "client hello queued");
        self.queue_handshake(endpoint, MessageType::ClientHello, &hello)?;
        Ok(connect_id)
    }

    /// Pooled writer for one datagram's worth of payload.
    pub fn start_message(&self, kind: DataKind) -> MessageWriter {
        MessageWriter {
            kind,
            buffer: self.pool.acquire(),
            limit: self.max_payload(),
        }
    }

    /// Seals the writer's payload for `node` and queues it.
    pub fn send(&self, node: NodeId, writer: MessageWriter) -> Result<u64, TransportError> {
        let MessageWriter {
            kind, mut buffer, ..
        } = writer;
        let mut sessions = self.sessions.lock();
        let session = sessions
            .get_mut(node.get())
            .ok_or(TransportError::UnknownNode(node.get()))?;
        let index = session.seal(
            &mut buffer,
            self.local_id.get(),
            self.config.project_id,
            kind,
            None,
        )?;
        self.queue.push(buffer, session.endpoint());
        trace!(node_id = node.get(), index, %kind, "message queued");
        Ok(index)
    }

    /// Sends `payload`, splitting it over consecutive packets when it does
    /// not fit in one datagram.
    pub fn send_message(&self, node: NodeId, kind: DataKind, payload: &[u8]) -> Result<(), TransportError> {
        let chunk = self.max_payload();
        if payload.len() <= chunk {
            let mut writer = self.start_message(kind);
            writer.write(payload)?;
            self.send(node, writer)?;
            return Ok(());
        }

        let count = payload.len().div_ceil(chunk) as u64;
        if count > self.limits.max_fragments {
            return Err(TransportError::MessageTooLarge {
                len: payload.len(),
                max: self.limits.max_fragments,
            });
        }

        // Fragments must take consecutive indices, so seal them all under one lock.
        let mut sessions = self.sessions.lock();
        let session = sessions
            .get_mut(node.get())
            .ok_or(TransportError::UnknownNode(node.get()))?;
        let endpoint = session.endpoint();
        for (index, part) in payload.chunks(chunk).enumerate() {
            let mut buffer = self.pool.acquire();
            buffer.extend_from_slice(part)?;
            let fragment = Fragment {
                index: index as u64,
                count,
            };
            session.seal(
                &mut buffer,
                self.local_id.get(),
                self.config.project_id,
                kind,
                Some(fragment),
            )?;
            self.queue.push(buffer, endpoint);
        }
        trace!(node_id = node.get(), count, %kind, "fragmented message queued");
        Ok(())
    }

    /// Closes the session with `node`; returns whether one existed.
    pub fn close(&self, node: NodeId) -> bool {
        self.remove_session(node, CloseReason::Local)
    }

    /// Closes every session and abandons pending handshakes.
    pub fn close_all(&self, reason: CloseReason) {
        let pending = self.connecting.lock().drain_where(|_| true);
        self.metrics.pending_handshakes.set(0);
        drop(pending);
        let nodes = self.sessions.lock().node_ids();
        for node in nodes.into_iter().filter_map(NodeId::new) {
            self.remove_session(node, reason);
        }
    }

    fn remove_session(&self, node: NodeId, reason: CloseReason) -> bool {
        let removed = {
            let mut sessions = self.sessions.lock();
            let removed = sessions.remove(node.get());
            self.metrics.active_sessions.set(sessions.len() as i64);
            removed
        };
        match removed {
            Some(mut session) => {
                session.close();
                info!(node_id = node.get(), ?reason, "session closed");
                self.handler.on_session_closed(node, reason);
                true
            }
            None => false,
        }
    }

    /// Expires stale handshakes, idle sessions and partial messages.
    pub fn maintenance_tick(&self, now: Instant) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();
        let handshake_timeout = self.config.handshake_timeout();
        let idle_timeout = self.config.idle_timeout();

        {
            let mut connecting = self.connecting.lock();
            let expired = connecting.drain_where(|session| elapsed(now, session.created_at()) >= handshake_timeout);
            report.expired_handshakes = expired.len();
            self.metrics.pending_handshakes.set(connecting.len() as i64);
        }

        let mut idle = Vec::new();
        {
            let mut sessions = self.sessions.lock();
            for node in sessions.node_ids() {
                let Some(session) = sessions.get_mut(node) else {
                    continue;
                };
                report.evicted_fragments += session.evict_stale_fragments(now);
                if elapsed(now, session.last_activity()) >= idle_timeout {
                    if let Some(mut session) = sessions.remove(node) {
                        session.close();
                        idle.push(node);
                    }
                }
            }
            self.metrics.active_sessions.set(sessions.len() as i64);
        }
        report.idle_sessions = idle.len();

        for node in idle.into_iter().filter_map(NodeId::new) {
            info!(node_id = node.get(), "session idle, closing");
            self.handler.on_session_closed(node, CloseReason::IdleTimeout);
        }

        let expired = (report.expired_handshakes + report.idle_sessions) as u64;
        self.metrics.sessions_expired.inc_by(expired);
        self.metrics.fragments_evicted.inc_by(report.evicted_fragments as u64);
        if report != MaintenanceReport::default() {
            debug!(?report, "maintenance tick");
        }
        report
    }

    /// Reads and handles datagrams until the socket fails.
    pub async fn run_receive_loop(&self) -> io::Result<()> {
        loop {
            self.recv_once().await?;
        }
    }

    /// Reads and fully handles one datagram. Only socket failures surface;
    /// anything wrong with the datagram itself is a silent drop.
    pub async fn recv_once(&self) -> io::Result<()> {
        let mut buffer = self.pool.acquire();
        let (len, from) = self.socket.recv_from(buffer.reset_for_receive()).await?;
        buffer.set_window(0, len);
        self.metrics.datagrams_received.inc();

        if let Err(dropped) = self.handle_datagram(buffer.as_mut_slice(), from, Instant::now()) {
            self.record_drop(&dropped, from);
        }
        Ok(())
    }

    fn record_drop(&self, dropped: &Dropped, from: SocketAddr) {
        self.metrics.record_drop(dropped.reason);
        match dropped.reason {
            DropReason::Replay => self.metrics.replays.inc(),
            DropReason::MacFailure => self.metrics.mac_failures.inc(),
            DropReason::Handshake => self.metrics.handshakes_failed.inc(),
            _ => {}
        }
        debug!(peer = %from, reason = dropped.reason.as_label(), err = ?dropped.cause, "datagram dropped");
    }

    fn handle_datagram(&self, packet: &mut [u8], from: SocketAddr, now: Instant) -> Result<(), Dropped> {
        let (envelope, offset) = Envelope::decode(packet)?;
        if envelope.project_id != self.config.project_id {
            return Err(Dropped::new(DropReason::ProjectMismatch));
        }
        if !envelope.is_handshake() {
            return self.on_data(&envelope, packet, offset, from, now);
        }

        let body = Body::decode(&packet[offset..], false)?;
        match body.message_type.dispatch() {
            Dispatch::Handshake(HandshakeKind::ClientHello) => self.on_client_hello(body.payload, from, now),
            Dispatch::Handshake(HandshakeKind::ServerHello) => self.on_server_hello(body.payload, from, now),
            Dispatch::Handshake(HandshakeKind::Confirm) => self.on_confirm(body.payload, from, now),
            // Node id 0 never carries application data.
            Dispatch::Data(_) => Err(Dropped::new(DropReason::Handshake)),
        }
    }

    fn on_client_hello(&self, payload: &[u8], from: SocketAddr, now: Instant) -> Result<(), Dropped> {
        let mut reply = Vec::new();
        let (connect_id, evicted) = {
            let mut connecting = self.connecting.lock();
            let inserted = connecting.try_insert_with(|connect_id| {
                let (session, server_hello) = Session::accept_client_hello(
                    self.kex.as_ref(),
                    payload,
                    from,
                    connect_id,
                    self.limits,
                    now,
                    &mut *self.rng.lock(),
                )?;
                reply = server_hello;
                Ok::<_, SessionError>(session)
            })?;
            self.metrics.pending_handshakes.set(connecting.len() as i64);
            inserted
        };
        self.note_overwrite(evicted);
        self.metrics.handshakes_started.inc();
        debug!(peer = %from, connect_id, "client hello accepted");
        self.queue_handshake(from, MessageType::ServerHello, &reply)?;
        Ok(())
    }

    fn on_server_hello(&self, payload: &[u8], from: SocketAddr, now: Instant) -> Result<(), Dropped> {
        let connect_id = ServerHello::decode(payload)?.initiator_connect_id;
        let confirm = {
            let mut connecting = self.connecting.lock();
            let session = connecting
                .get_mut(connect_id)
                .ok_or(Dropped::new(DropReason::UnknownSession))?;
            if session.endpoint() != from {
                return Err(Dropped::new(DropReason::EndpointMismatch));
            }
            session.receive_server_hello(self.kex.as_ref(), payload, now)?;
            session.confirm(&self.trust)?
        };
        debug!(peer = %from, connect_id, "server hello accepted");
        self.queue_handshake(from, MessageType::Confirm, &confirm)?;
        Ok(())
    }

    fn on_confirm(&self, payload: &[u8], from: SocketAddr, now: Instant) -> Result<(), Dropped> {
        let confirm = Confirm::decode(payload)?;
        let (session, reply) = {
            let mut connecting = self.connecting.lock();
            let session = connecting
                .get_mut(confirm.connect_id)
                .ok_or(Dropped::new(DropReason::UnknownSession))?;
            if session.endpoint() != from {
                return Err(Dropped::new(DropReason::EndpointMismatch));
            }
            session.receive_confirm(&self.trust, &confirm, now)?;
            // The responder answers with its own proof; the initiator is done.
            let reply = match session.role() {
                Role::Responder => Some(session.confirm(&self.trust)?),
                Role::Initiator => None,
            };
            let session = connecting
                .remove(confirm.connect_id)
                .ok_or(Dropped::new(DropReason::UnknownSession))?;
            self.metrics.pending_handshakes.set(connecting.len() as i64);
            (session, reply)
        };

        if let Some(reply) = reply {
            self.queue_handshake(from, MessageType::Confirm, &reply)?;
        }
        self.promote(session, confirm.node_id);
        Ok(())
    }

    /// Moves an established session into the registry.
    fn promote(&self, session: Session, node_id: u64) {
        let Some(node) = NodeId::new(node_id) else {
            return;
        };
        let Some(established_at) = session.established_at() else {
            return;
        };
        let info = PeerInfo {
            node_id: node,
            endpoint: session.endpoint(),
            established_at,
        };

        let replaced = {
            let mut sessions = self.sessions.lock();
            let (_, replaced) = sessions.insert(node_id, session);
            self.metrics.active_sessions.set(sessions.len() as i64);
            replaced
        };
        if let Some(mut old) = replaced {
            old.close();
            debug!(node_id, "previous session superseded");
            self.handler.on_session_closed(node, CloseReason::Superseded);
        }

        self.metrics.handshakes_completed.inc();
        info!(node_id, peer = %info.endpoint, "session established");
        self.handler.on_session_established(&info);
    }

    fn on_data(
        &self,
        envelope: &Envelope,
        packet: &mut [u8],
        offset: usize,
        from: SocketAddr,
        now: Instant,
    ) -> Result<(), Dropped> {
        if !envelope.encrypted && self.config.require_encryption {
            return Err(Dropped::new(DropReason::Cleartext));
        }
        let from_node = NodeId::new(envelope.node_id).ok_or(Dropped::new(DropReason::Malformed))?;

        let message = {
            let mut sessions = self.sessions.lock();
            let session = sessions
                .get_mut(envelope.node_id)
                .filter(|session| session.state() == HandshakeState::Established)
                .ok_or(Dropped::new(DropReason::UnknownSession))?;
            if session.endpoint() != from {
                return Err(Dropped::new(DropReason::EndpointMismatch));
            }

            let opened = session.open(envelope, packet, offset, now)?;
            let body = Body::decode(&packet[offset..opened.body_end], envelope.fragmented)?;
            let kind = match body.message_type.dispatch() {
                Dispatch::Data(kind) => kind,
                Dispatch::Handshake(_) => return Err(Dropped::new(DropReason::Handshake)),
            };

            match body.fragment {
                None => InboundMessage {
                    from: from_node,
                    endpoint: from,
                    kind,
                    index: opened.index,
                    payload: Bytes::copy_from_slice(body.payload),
                },
                Some(fragment) => {
                    let outcome = session.reassemble(opened.index, kind, fragment, body.payload, now)?;
                    if outcome.evicted > 0 {
                        self.metrics.fragments_evicted.inc_by(outcome.evicted as u64);
                    }
                    let Some(done) = outcome.complete else {
                        return Ok(());
                    };
                    self.metrics.fragments_reassembled.inc();
                    InboundMessage {
                        from: from_node,
                        endpoint: from,
                        kind: done.kind,
                        index: done.key,
                        payload: done.payload,
                    }
                }
            }
        };

        self.metrics.message_bytes.observe(message.payload.len() as f64);
        self.handler.on_message(message);
        Ok(())
    }

    fn queue_handshake(
        &self,
        target: SocketAddr,
        message_type: MessageType,
        payload: &[u8],
    ) -> Result<(), SessionError> {
        let mut buffer = self.pool.acquire();
        buffer.extend_from_slice(payload)?;
        let header = wire::encode_header(&Envelope::handshake(self.config.project_id), message_type, None)?;
        buffer.prepend(header.as_slice())?;
        self.queue.push(buffer, target);
        Ok(())
    }

    fn note_overwrite(&self, evicted: Option<Session>) {
        if let Some(session) = evicted {
            self.metrics.connecting_overwrites.inc();
            warn!(
                peer = %session.endpoint(),
                connect_id = session.local_connect_id(),
                "connecting table full, oldest handshake overwritten"
            );
        }
    }
}

fn elapsed(now: Instant, since: Instant) -> Duration {
    now.saturating_duration_since(since)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        api::{ChannelHandler, TransportEvent},
        config::{IdentityConfig, PeerConfig},
        crypto::{kdf::RANDOM_LEN, mac::TAG_LEN, trust::PROOF_LEN},
        io::udp::loopback_v4,
    };
    use tokio::{sync::mpsc::Receiver, time::timeout};

    const WAIT: Duration = Duration::from_secs(10);

    fn psk_hex(node: u64) -> String {
        hex::encode([node as u8; 32])
    }

    fn config(local: u64, peers: &[u64]) -> Config {
        Config {
            bind: loopback_v4(),
            identity: IdentityConfig {
                node_id: local,
                psk: psk_hex(local),
            },
            peers: peers
                .iter()
                .map(|&node_id| PeerConfig {
                    node_id,
                    psk: psk_hex(node_id),
                })
                .collect(),
            ..Config::default()
        }
    }

    async fn spawn(cfg: Config) -> (Arc<Transport>, Receiver<TransportEvent>) {
        let (handler, events) = ChannelHandler::new(64);
        let transport = Arc::new(Transport::bind(cfg, Arc::new(handler)).await.expect("bind"));
        let receiver = Arc::clone(&transport);
        tokio::spawn(async move { receiver.run_receive_loop().await });
        (transport, events)
    }

    async fn next_event(events: &mut Receiver<TransportEvent>) -> TransportEvent {
        timeout(WAIT, events.recv())
            .await
            .expect("event in time")
            .expect("channel open")
    }

    async fn established_pair() -> (
        (Arc<Transport>, Receiver<TransportEvent>),
        (Arc<Transport>, Receiver<TransportEvent>),
    ) {
        let (a, mut a_events) = spawn(config(1, &[2])).await;
        let (b, mut b_events) = spawn(config(2, &[1])).await;
        a.connect(b.local_addr()).expect("connect");

        match next_event(&mut b_events).await {
            TransportEvent::Established(peer) => assert_eq!(peer.node_id.get(), 1),
            other => panic!("unexpected event {other:?}"),
        }
        match next_event(&mut a_events).await {
            TransportEvent::Established(peer) => assert_eq!(peer.node_id.get(), 2),
            other => panic!("unexpected event {other:?}"),
        }
        ((a, a_events), (b, b_events))
    }

    fn node(id: u64) -> NodeId {
        NodeId::new(id).expect("non-zero")
    }

    #[tokio::test]
    async fn handshake_then_message() {
        let ((a, _a_events), (b, mut b_events)) = established_pair().await;
        assert!(a.is_established(node(2)));
        assert_eq!(b.peers().len(), 1);
        assert_eq!(a.pending_handshakes(), 0);

        let mut writer = a.start_message(DataKind::Guard);
        writer.write(b"vote").expect("fits");
        a.send(node(2), writer).expect("send");

        match next_event(&mut b_events).await {
            TransportEvent::Message(message) => {
                assert_eq!(message.from.get(), 1);
                assert_eq!(message.kind, DataKind::Guard);
                assert_eq!(&message.payload[..], b"vote");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_peer_cannot_establish() {
        let (a, _a_events) = spawn(config(1, &[2])).await;
        let (b, _b_events) = spawn(config(2, &[])).await;
        a.connect(b.local_addr()).expect("connect");

        timeout(WAIT, async {
            while b.metrics().handshakes_failed.get() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("confirm rejected");
        assert!(b.peers().is_empty());
        assert!(!a.is_established(node(2)));
    }

    #[tokio::test]
    async fn send_without_session_fails() {
        let (a, _events) = spawn(config(1, &[2])).await;
        let writer = a.start_message(DataKind::Ping);
        assert!(matches!(
            a.send(node(2), writer),
            Err(TransportError::UnknownNode(2))
        ));
        assert!(matches!(
            a.send_message(node(2), DataKind::Ping, &[0u8; 5000]),
            Err(TransportError::UnknownNode(2))
        ));
    }

    #[tokio::test]
    async fn writer_refuses_oversized_payload() {
        let (a, _events) = spawn(config(1, &[])).await;
        let mut writer = a.start_message(DataKind::Transaction);
        let limit = a.max_payload();
        assert_eq!(writer.remaining(), limit);
        assert!(writer.write(&vec![0u8; limit + 1]).is_err());
        writer.write(&vec![0u8; limit]).expect("exact fit");
        assert_eq!(writer.remaining(), 0);
    }

    #[tokio::test]
    async fn garbage_is_dropped_silently() {
        let (a, _events) = spawn(config(1, &[])).await;
        let stranger = bind_udp(loopback_v4()).expect("stranger");
        stranger.send_to(&[0xFF, 1, 2, 3], a.local_addr()).await.expect("send");
        // node id 7 with a sequence but no session
        stranger
            .send_to(&[wire::flags::ENCRYPTED, 7, 0, 0, 0, 1, 2, 0xAA], a.local_addr())
            .await
            .expect("send");

        let drops = &a.metrics().drops;
        let count = |reason: DropReason| drops.with_label_values(&[reason.as_label()]).get();
        timeout(WAIT, async {
            while count(DropReason::Malformed) + count(DropReason::UnknownSession) < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("both dropped");
        assert_eq!(count(DropReason::Malformed), 1);
        assert_eq!(count(DropReason::UnknownSession), 1);

        let mut buf = [0u8; 16];
        let quiet = timeout(Duration::from_millis(100), stranger.recv_from(&mut buf)).await;
        assert!(quiet.is_err(), "transport must not answer garbage");
    }

    #[tokio::test]
    async fn maintenance_expires_handshakes_and_idle_sessions() {
        let ((a, mut a_events), (b, _b_events)) = established_pair().await;
        let silent = "127.0.0.1:9".parse().expect("addr");
        a.connect(silent).expect("connect");
        assert_eq!(a.pending_handshakes(), 1);

        let report = a.maintenance_tick(Instant::now());
        assert_eq!(report.expired_handshakes, 0);
        assert_eq!(report.idle_sessions, 0);

        let later = Instant::now() + a.config().idle_timeout() + Duration::from_secs(1);
        let report = a.maintenance_tick(later);
        assert_eq!(report.expired_handshakes, 1);
        assert_eq!(report.idle_sessions, 1);
        assert_eq!(a.pending_handshakes(), 0);
        assert!(!a.is_established(node(2)));
        match next_event(&mut a_events).await {
            TransportEvent::Closed { node_id, reason } => {
                assert_eq!(node_id.get(), 2);
                assert_eq!(reason, CloseReason::IdleTimeout);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(b.is_established(node(1)));
    }

    #[tokio::test]
    async fn close_reports_local_reason() {
        let ((a, mut a_events), _b) = established_pair().await;
        assert!(a.close(node(2)));
        assert!(!a.close(node(2)));
        match next_event(&mut a_events).await {
            TransportEvent::Closed { reason, .. } => assert_eq!(reason, CloseReason::Local),
            other => panic!("unexpected event {other:?}"),
        }
    }

    async fn wait_for_drop(transport: &Transport, reason: DropReason, count: u64) {
        let drops = &transport.metrics().drops;
        timeout(WAIT, async {
            while drops.with_label_values(&[reason.as_label()]).get() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("drop recorded");
    }

    #[tokio::test]
    async fn cleartext_dropped_when_encryption_required() {
        let ((a, _a_events), (b, _b_events)) = established_pair().await;
        // node 1, sequence 5, Transaction, sent from the peer's own socket
        a.socket
            .send_to(&[0x00, 1, 0, 0, 0, 5, 2, 0xEE], b.local_addr())
            .await
            .expect("send");

        wait_for_drop(&b, DropReason::Cleartext, 1).await;
        assert!(b.is_established(node(1)));
        assert_eq!(b.metrics().replays.get(), 0);
    }

    #[tokio::test]
    async fn data_from_foreign_endpoint_dropped() {
        let ((_a, _a_events), (b, _b_events)) = established_pair().await;
        let stranger = bind_udp(loopback_v4()).expect("stranger");
        let mut packet = vec![wire::flags::ENCRYPTED, 1, 0, 0, 0, 1, 2];
        packet.extend_from_slice(&[0u8; TAG_LEN + 4]);
        stranger.send_to(&packet, b.local_addr()).await.expect("send");

        wait_for_drop(&b, DropReason::EndpointMismatch, 1).await;
        assert_eq!(b.metrics().mac_failures.get(), 0);
        assert!(b.is_established(node(1)));
    }

    #[tokio::test]
    async fn handshake_reply_from_foreign_endpoint_dropped() {
        let (a, _a_events) = spawn(config(1, &[2])).await;
        let silent = "127.0.0.1:9".parse().expect("addr");
        let connect_id = a.connect(silent).expect("connect");
        let stranger = bind_udp(loopback_v4()).expect("stranger");

        let mut server_hello = vec![0x00, 0x00, MessageType::ServerHello as u8];
        server_hello.extend_from_slice(&connect_id.to_be_bytes());
        server_hello.extend_from_slice(&[0, 0]);
        server_hello.extend_from_slice(&[0u8; RANDOM_LEN]);
        server_hello.extend_from_slice(&[0, 0, 0, 0]);
        stranger.send_to(&server_hello, a.local_addr()).await.expect("send");
        wait_for_drop(&a, DropReason::EndpointMismatch, 1).await;

        let mut confirm = vec![0x00, 0x00, MessageType::Confirm as u8];
        confirm.extend_from_slice(&connect_id.to_be_bytes());
        confirm.push(2);
        confirm.extend_from_slice(&[0u8; PROOF_LEN]);
        stranger.send_to(&confirm, a.local_addr()).await.expect("send");
        wait_for_drop(&a, DropReason::EndpointMismatch, 2).await;

        assert_eq!(a.pending_handshakes(), 1);
        assert_eq!(a.metrics().handshakes_failed.get(), 0);
    }

    #[tokio::test]
    async fn permitted_cleartext_leaves_replay_window_alone() {
        let (a, _a_events) = spawn(config(1, &[2])).await;
        let mut cfg_b = config(2, &[1]);
        cfg_b.require_encryption = false;
        let (b, mut b_events) = spawn(cfg_b).await;
        a.connect(b.local_addr()).expect("connect");
        match next_event(&mut b_events).await {
            TransportEvent::Established(peer) => assert_eq!(peer.node_id.get(), 1),
            other => panic!("unexpected event {other:?}"),
        }

        // node 1, sequence 1_000_000, far ahead of anything sealed so far
        a.socket
            .send_to(&[0x00, 1, 0x00, 0x0F, 0x42, 0x40, 2, 0xEE], b.local_addr())
            .await
            .expect("send");
        match next_event(&mut b_events).await {
            TransportEvent::Message(message) => assert_eq!(&message.payload[..], &[0xEE]),
            other => panic!("unexpected event {other:?}"),
        }

        timeout(WAIT, async {
            while !a.is_established(node(2)) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("initiator established");
        let mut writer = a.start_message(DataKind::Transaction);
        writer.write(b"sealed").expect("fits");
        a.send(node(2), writer).expect("send");
        match next_event(&mut b_events).await {
            TransportEvent::Message(message) => assert_eq!(&message.payload[..], b"sealed"),
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(b.metrics().replays.get(), 0);
    }

    #[tokio::test]
    async fn project_mismatch_dropped() {
        let mut cfg_a = config(1, &[2]);
        cfg_a.project_id = Some(4);
        let (a, _a_events) = spawn(cfg_a).await;
        let (b, _b_events) = spawn(config(2, &[1])).await;
        a.connect(b.local_addr()).expect("connect");

        timeout(WAIT, async {
            while b.metrics().drops.with_label_values(&[DropReason::ProjectMismatch.as_label()]).get() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("dropped");
        assert_eq!(b.pending_handshakes(), 0);
    }
}
