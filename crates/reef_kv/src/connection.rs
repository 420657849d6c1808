//! One multiplexed session to one data node.
//!
//! A connection runs two tasks: a writer serializing outbound frames from a
//! queue, and a reader decoding inbound frames and delivering them by opaque
//! through a fixed-size pending table. The handshake (HELLO → SASL →
//! SELECT_BUCKET) happens in lockstep on the raw stream before the tasks are
//! spawned; requests are only accepted in `Ready`.
//!
//! The pending table is an array indexed by `opaque & (size-1)` rather than
//! a hash map; a semaphore bounds in-flight requests to the table size, and
//! monotonic opaque allocation skips occupied residues.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout_at;

use reef_common::config::ClientConfig;
use reef_common::error::{
    HandshakeError, ReefError, ReefResult, TransportError,
};
use reef_common::types::Deadline;
use reef_protocol::{
    decode_packet, encode_packet, DecodeOutcome, Packet, FEAT_CLUSTERMAP_NOTIFICATION,
    FEAT_JSON, FEAT_MUTATION_SEQNO, FEAT_SELECT_BUCKET, FEAT_SNAPPY, FEAT_TLS, FEAT_TRACING,
    FEAT_UNORDERED_EXECUTION, FEAT_XATTR, FEAT_XERROR, OP_GET_CLUSTER_CONFIG, OP_HELLO,
    OP_SASL_AUTH, OP_SASL_LIST_MECHS, OP_SASL_STEP, OP_SELECT_BUCKET, STATUS_ACCESS_ERROR,
    STATUS_AUTH_CONTINUE, STATUS_AUTH_ERROR, STATUS_KEY_ENOENT, STATUS_SUCCESS,
};

use crate::sasl::{pick_mechanism, plain_payload, Mechanism, ScramClient};

/// Any bidirectional byte stream a connection can run over. TCP is the
/// default; tests use in-memory duplex pipes and a TLS dialer can wrap its
/// stream behind the same seam.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

/// Lifecycle of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    HelloNegotiating = 1,
    Authenticating = 2,
    BucketSelecting = 3,
    Ready = 4,
    Draining = 5,
    Closed = 6,
}

impl ConnectionState {
    fn from_u8(v: u8) -> ConnectionState {
        match v {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::HelloNegotiating,
            2 => ConnectionState::Authenticating,
            3 => ConnectionState::BucketSelecting,
            4 => ConnectionState::Ready,
            5 => ConnectionState::Draining,
            _ => ConnectionState::Closed,
        }
    }
}

/// Sink for config blobs the server pushes outside any request/response
/// pair (clustermap change notifications).
pub trait ConfigSink: Send + Sync {
    fn config_blob(&self, blob: Vec<u8>, origin_host: String);
}

/// Per-connection settings derived from the client configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub connect_timeout: Duration,
    pub max_frame_size: usize,
    pub max_pipelined: usize,
    pub bucket: Option<String>,
    pub username: String,
    pub password: String,
    pub tls: bool,
    pub enable_mutation_tokens: bool,
    pub compression: bool,
    pub unordered_execution: bool,
    /// Connection name announced in HELLO, visible in server logs.
    pub client_id: String,
}

impl ConnectionConfig {
    pub fn from_client_config(cfg: &ClientConfig) -> ConnectionConfig {
        ConnectionConfig {
            connect_timeout: cfg.connect_timeout,
            max_frame_size: cfg.max_frame_size,
            max_pipelined: cfg.max_pipelined,
            bucket: cfg.bucket.clone(),
            username: cfg.username.clone(),
            password: cfg.password.clone(),
            tls: cfg.enable_tls,
            enable_mutation_tokens: cfg.enable_mutation_tokens,
            compression: cfg.compression,
            unordered_execution: cfg.unordered_execution,
            client_id: format!("reef-client/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    fn requested_features(&self) -> Vec<u16> {
        let mut feats = vec![
            FEAT_JSON,
            FEAT_XATTR,
            FEAT_XERROR,
            FEAT_SELECT_BUCKET,
            FEAT_TRACING,
            FEAT_CLUSTERMAP_NOTIFICATION,
        ];
        if self.tls {
            feats.push(FEAT_TLS);
        }
        if self.enable_mutation_tokens {
            feats.push(FEAT_MUTATION_SEQNO);
        }
        if self.compression {
            feats.push(FEAT_SNAPPY);
        }
        if self.unordered_execution {
            feats.push(FEAT_UNORDERED_EXECUTION);
        }
        feats
    }
}

/// Features both sides agreed on at HELLO time.
#[derive(Debug, Clone, Default)]
pub struct Features {
    negotiated: Vec<u16>,
}

impl Features {
    pub fn has(&self, feature: u16) -> bool {
        self.negotiated.contains(&feature)
    }
}

struct PendingEntry {
    opaque: u32,
    tx: oneshot::Sender<ReefResult<Packet>>,
    _permit: OwnedSemaphorePermit,
}

/// State shared between the handle and the reader/writer tasks.
struct Shared {
    peer: String,
    host: String,
    state: AtomicU8,
    slots: Mutex<Box<[Option<PendingEntry>]>>,
    mask: u32,
    shutdown: watch::Sender<bool>,
    config_sink: Option<Arc<dyn ConfigSink>>,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, s: ConnectionState) {
        self.state.store(s as u8, Ordering::Release);
    }

    /// Claim the slot for `opaque` if free.
    fn try_register(
        &self,
        opaque: u32,
        permit: OwnedSemaphorePermit,
    ) -> Result<oneshot::Receiver<ReefResult<Packet>>, OwnedSemaphorePermit> {
        let mut slots = self.slots.lock();
        let idx = (opaque & self.mask) as usize;
        if slots[idx].is_some() {
            return Err(permit);
        }
        let (tx, rx) = oneshot::channel();
        slots[idx] = Some(PendingEntry {
            opaque,
            tx,
            _permit: permit,
        });
        Ok(rx)
    }

    /// Remove the entry for `opaque` (deadline expiry or enqueue failure).
    fn remove(&self, opaque: u32) {
        let mut slots = self.slots.lock();
        let idx = (opaque & self.mask) as usize;
        if slots[idx].as_ref().map(|e| e.opaque) == Some(opaque) {
            slots[idx] = None;
        }
    }

    /// Hand a response to whoever is waiting on its opaque. Unsolicited or
    /// late responses come back to the caller for disposal.
    fn deliver(&self, packet: Packet) -> Option<Packet> {
        let entry = {
            let mut slots = self.slots.lock();
            let idx = (packet.opaque & self.mask) as usize;
            if slots[idx].as_ref().map(|e| e.opaque) == Some(packet.opaque) {
                slots[idx].take()
            } else {
                None
            }
        };
        match entry {
            Some(entry) => {
                let _ = entry.tx.send(Ok(packet));
                None
            }
            None => Some(packet),
        }
    }

    /// Fail everything in flight and shut the tasks down.
    fn drain(&self, reason: &str) {
        let was = self.state.swap(ConnectionState::Draining as u8, Ordering::AcqRel);
        if was == ConnectionState::Ready as u8 {
            tracing::warn!(peer = %self.peer, reason, "connection: Ready → Draining");
        }
        let entries: Vec<PendingEntry> = {
            let mut slots = self.slots.lock();
            slots.iter_mut().filter_map(|s| s.take()).collect()
        };
        for entry in entries {
            let _ = entry.tx.send(Err(ReefError::Transport(
                TransportError::ConnectionLost(reason.to_string()),
            )));
        }
        let _ = self.shutdown.send(true);
        self.set_state(ConnectionState::Closed);
    }
}

/// A live, `Ready` connection. Cheap to share; all methods take `&self`.
pub struct Connection {
    shared: Arc<Shared>,
    writer_tx: mpsc::UnboundedSender<BytesMut>,
    inflight: Arc<Semaphore>,
    next_opaque: AtomicU32,
    features: Features,
    max_frame_size: usize,
    slot_count: u32,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.shared.peer)
            .field("host", &self.shared.host)
            .field("state", &self.shared.state())
            .field("features", &self.features)
            .field("max_frame_size", &self.max_frame_size)
            .field("slot_count", &self.slot_count)
            .finish()
    }
}

impl Connection {
    /// Dial `addr` and run the full handshake under the configured timeout.
    pub async fn connect(
        addr: &str,
        cfg: &ConnectionConfig,
        sink: Option<Arc<dyn ConfigSink>>,
    ) -> ReefResult<Arc<Connection>> {
        Self::connect_until(addr, cfg, sink, Deadline::after(cfg.connect_timeout)).await
    }

    /// Dial with an explicit bound on connect + handshake (the pool caps
    /// this by the acquiring operation's deadline).
    pub async fn connect_until(
        addr: &str,
        cfg: &ConnectionConfig,
        sink: Option<Arc<dyn ConfigSink>>,
        deadline: Deadline,
    ) -> ReefResult<Arc<Connection>> {
        if cfg.tls {
            // TLS transports come in through `establish` from a dialer that
            // wraps the stream; there is no built-in one.
            return Err(ReefError::Transport(TransportError::TlsFailure(
                "no TLS dialer configured".into(),
            )));
        }
        let stream = match timeout_at(deadline.instant(), TcpStream::connect(addr)).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => return Err(ReefError::Transport(TransportError::Io(e))),
            Err(_) => return Err(ReefError::timeout()),
        };
        stream.set_nodelay(true).map_err(TransportError::Io)?;
        Self::establish(stream, addr, cfg, sink, deadline).await
    }

    /// Run the handshake over an already-open stream and spawn the IO tasks.
    pub async fn establish<S: Transport + 'static>(
        stream: S,
        addr: &str,
        cfg: &ConnectionConfig,
        sink: Option<Arc<dyn ConfigSink>>,
        deadline: Deadline,
    ) -> ReefResult<Arc<Connection>> {
        let slot_count = cfg.max_pipelined.next_power_of_two().max(8);
        let host = addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(addr);
        let (shutdown, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            peer: addr.to_string(),
            host: host.to_string(),
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            slots: Mutex::new((0..slot_count).map(|_| None).collect()),
            mask: slot_count as u32 - 1,
            shutdown,
            config_sink: sink,
        });

        let mut hs = Handshake {
            stream,
            buf: BytesMut::with_capacity(4096),
            max_frame_size: cfg.max_frame_size,
            deadline,
            opaque: 1,
        };

        shared.set_state(ConnectionState::HelloNegotiating);
        let features = hs.hello(cfg).await?;

        if !cfg.username.is_empty() {
            shared.set_state(ConnectionState::Authenticating);
            hs.authenticate(cfg).await?;
        }

        if let Some(bucket) = &cfg.bucket {
            shared.set_state(ConnectionState::BucketSelecting);
            hs.select_bucket(bucket).await?;
        }

        let Handshake {
            stream,
            buf: leftover,
            ..
        } = hs;
        shared.set_state(ConnectionState::Ready);
        tracing::debug!(
            peer = %shared.peer,
            features = ?features.negotiated,
            "connection ready"
        );

        let (rd, wr) = tokio::io::split(stream);
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(writer_rx, wr, shared.clone()));
        tokio::spawn(run_reader(rd, shared.clone(), cfg.max_frame_size, leftover));

        Ok(Arc::new(Connection {
            shared,
            writer_tx,
            inflight: Arc::new(Semaphore::new(slot_count)),
            next_opaque: AtomicU32::new(0x100),
            features,
            max_frame_size: cfg.max_frame_size,
            slot_count: slot_count as u32,
        }))
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    pub fn peer(&self) -> &str {
        &self.shared.peer
    }

    /// Hostname part of the peer address (origin for embedded configs).
    pub fn host(&self) -> &str {
        &self.shared.host
    }

    pub fn features(&self) -> &Features {
        &self.features
    }

    /// Send one request and await its response by opaque.
    ///
    /// On deadline expiry the pending entry is removed and `Timeout`
    /// returned; a late response is discarded by the reader.
    pub async fn send(&self, mut packet: Packet, deadline: Deadline) -> ReefResult<Packet> {
        if !self.is_ready() {
            return Err(ReefError::Transport(TransportError::ConnectionLost(
                "connection is not ready".into(),
            )));
        }

        let mut permit = match timeout_at(
            deadline.instant(),
            self.inflight.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(p)) => p,
            Ok(Err(_)) => {
                return Err(ReefError::Transport(TransportError::ConnectionLost(
                    "connection closed".into(),
                )))
            }
            Err(_) => return Err(ReefError::timeout()),
        };

        // Monotonic allocation; skip residues occupied by slow requests.
        // With in-flight bounded to the table size a free residue exists.
        let mut rx = None;
        let mut opaque = 0;
        for _ in 0..self.slot_count {
            opaque = self.next_opaque.fetch_add(1, Ordering::Relaxed);
            match self.shared.try_register(opaque, permit) {
                Ok(r) => {
                    rx = Some(r);
                    break;
                }
                Err(p) => permit = p,
            }
        }
        let rx = rx.ok_or(ReefError::Transport(TransportError::NoCapacity))?;
        packet.opaque = opaque;

        // Racing a concurrent drain: the entry registered above would never
        // complete, so re-check before relying on the reader.
        if !self.is_ready() {
            self.shared.remove(opaque);
            return Err(ReefError::Transport(TransportError::ConnectionLost(
                "connection is draining".into(),
            )));
        }

        let frame = match encode_packet(&packet, self.max_frame_size) {
            Ok(f) => f,
            Err(e) => {
                self.shared.remove(opaque);
                return Err(e.into());
            }
        };
        if self.writer_tx.send(frame).is_err() {
            self.shared.remove(opaque);
            return Err(ReefError::Transport(TransportError::ConnectionLost(
                "writer stopped".into(),
            )));
        }

        match timeout_at(deadline.instant(), rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ReefError::Transport(TransportError::ConnectionLost(
                "connection closed".into(),
            ))),
            Err(_) => {
                self.shared.remove(opaque);
                Err(ReefError::timeout())
            }
        }
    }

    /// Close the connection, failing everything in flight.
    pub fn close(&self) {
        self.shared.drain("closed by owner");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shared.drain("connection dropped");
    }
}

// ── IO tasks ─────────────────────────────────────────────────────────────

async fn run_writer<S: Transport>(
    mut rx: mpsc::UnboundedReceiver<BytesMut>,
    mut wr: WriteHalf<S>,
    shared: Arc<Shared>,
) {
    let mut shutdown = shared.shutdown.subscribe();
    loop {
        tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(frame) => {
                    if let Err(e) = wr.write_all(&frame).await {
                        shared.drain(&format!("write failed: {}", e));
                        return;
                    }
                }
                None => return,
            },
            _ = shutdown.changed() => return,
        }
    }
}

async fn run_reader<S: Transport>(
    mut rd: ReadHalf<S>,
    shared: Arc<Shared>,
    max_frame_size: usize,
    mut buf: BytesMut,
) {
    let mut shutdown = shared.shutdown.subscribe();
    loop {
        match decode_packet(&buf, max_frame_size) {
            Ok(DecodeOutcome::Complete { packet, consumed }) => {
                buf.advance(consumed);
                on_packet(&shared, packet);
                continue;
            }
            Ok(DecodeOutcome::Incomplete { needed }) => {
                buf.reserve(needed.saturating_sub(buf.len()).max(4096));
            }
            Err(e) => {
                shared.drain(&format!("undecodable frame: {}", e));
                return;
            }
        }
        tokio::select! {
            res = rd.read_buf(&mut buf) => match res {
                Ok(0) => {
                    shared.drain("peer closed the connection");
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    shared.drain(&format!("read failed: {}", e));
                    return;
                }
            },
            _ = shutdown.changed() => return,
        }
    }
}

fn on_packet(shared: &Shared, packet: Packet) {
    let packet = if packet.magic.is_response() {
        match shared.deliver(packet) {
            None => return,
            Some(p) => p,
        }
    } else {
        packet
    };
    // Clustermap change notifications arrive outside any pending request;
    // everything else unsolicited or late is dropped.
    if packet.opcode == OP_GET_CLUSTER_CONFIG && !packet.value.is_empty() {
        if let Some(sink) = &shared.config_sink {
            sink.config_blob(packet.value, shared.host.clone());
            return;
        }
    }
    tracing::trace!(
        peer = %shared.peer,
        opaque = packet.opaque,
        opcode = packet.opcode,
        "discarding unsolicited or late response"
    );
}

// ── Handshake ────────────────────────────────────────────────────────────

struct Handshake<S: Transport> {
    stream: S,
    buf: BytesMut,
    max_frame_size: usize,
    deadline: Deadline,
    opaque: u32,
}

impl<S: Transport> Handshake<S> {
    /// Lockstep request/response exchange on the raw stream.
    async fn roundtrip(&mut self, mut packet: Packet) -> ReefResult<Packet> {
        packet.opaque = self.opaque;
        self.opaque += 1;
        let deadline = self.deadline;
        let frame = encode_packet(&packet, self.max_frame_size)?;
        let io = async {
            self.stream
                .write_all(&frame)
                .await
                .map_err(TransportError::Io)?;
            loop {
                match decode_packet(&self.buf, self.max_frame_size).map_err(ReefError::from)? {
                    DecodeOutcome::Complete {
                        packet: resp,
                        consumed,
                    } => {
                        self.buf.advance(consumed);
                        return Ok::<Packet, ReefError>(resp);
                    }
                    DecodeOutcome::Incomplete { .. } => {
                        let n = self
                            .stream
                            .read_buf(&mut self.buf)
                            .await
                            .map_err(TransportError::Io)?;
                        if n == 0 {
                            return Err(ReefError::Transport(TransportError::ConnectionLost(
                                "peer closed during handshake".into(),
                            )));
                        }
                    }
                }
            }
        };
        let resp = match timeout_at(deadline.instant(), io).await {
            Ok(res) => res?,
            Err(_) => return Err(ReefError::timeout()),
        };
        if resp.opaque != packet.opaque {
            return Err(ReefError::Protocol(
                reef_common::error::ProtocolError::UnexpectedOpaque(resp.opaque),
            ));
        }
        Ok(resp)
    }

    async fn hello(&mut self, cfg: &ConnectionConfig) -> ReefResult<Features> {
        let mut req = Packet::request(OP_HELLO, 0);
        req.key = cfg.client_id.as_bytes().to_vec();
        for feat in cfg.requested_features() {
            req.value.extend_from_slice(&feat.to_be_bytes());
        }
        let resp = self.roundtrip(req).await?;
        if resp.status() != STATUS_SUCCESS {
            return Err(ReefError::Handshake(HandshakeError::FeatureUnsupported(
                format!("HELLO rejected with status 0x{:04x}", resp.status()),
            )));
        }
        if resp.value.len() % 2 != 0 {
            return Err(ReefError::Protocol(
                reef_common::error::ProtocolError::Violation(
                    "odd-length HELLO feature list".into(),
                ),
            ));
        }
        let negotiated = resp
            .value
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();
        Ok(Features { negotiated })
    }

    async fn authenticate(&mut self, cfg: &ConnectionConfig) -> ReefResult<()> {
        let resp = self
            .roundtrip(Packet::request(OP_SASL_LIST_MECHS, 0))
            .await?;
        let offered = String::from_utf8_lossy(&resp.value).into_owned();
        let mech = pick_mechanism(&offered, cfg.tls).ok_or_else(|| {
            ReefError::Handshake(HandshakeError::AuthFailure(format!(
                "no acceptable SASL mechanism in '{}'",
                offered
            )))
        })?;
        tracing::debug!(mechanism = mech.name(), "authenticating");

        match mech {
            Mechanism::Plain => {
                let mut req = Packet::request(OP_SASL_AUTH, 0);
                req.key = mech.name().as_bytes().to_vec();
                req.value = plain_payload(&cfg.username, &cfg.password);
                let resp = self.roundtrip(req).await?;
                self.check_auth_status(&resp)
            }
            _ => {
                let mut scram = ScramClient::new(mech, &cfg.username, &cfg.password);
                let mut req = Packet::request(OP_SASL_AUTH, 0);
                req.key = mech.name().as_bytes().to_vec();
                req.value = scram.client_first();
                let resp = self.roundtrip(req).await?;
                if resp.status() == STATUS_SUCCESS {
                    // Server finished in one step; nothing left to verify.
                    return Ok(());
                }
                if resp.status() != STATUS_AUTH_CONTINUE {
                    return self.check_auth_status(&resp);
                }

                let mut step = Packet::request(OP_SASL_STEP, 0);
                step.key = mech.name().as_bytes().to_vec();
                step.value = scram.client_final(&resp.value)?;
                let resp = self.roundtrip(step).await?;
                self.check_auth_status(&resp)?;
                scram.verify_server_final(&resp.value)
            }
        }
    }

    fn check_auth_status(&self, resp: &Packet) -> ReefResult<()> {
        match resp.status() {
            STATUS_SUCCESS => Ok(()),
            STATUS_AUTH_ERROR => Err(ReefError::Handshake(HandshakeError::AuthFailure(
                "credentials rejected".into(),
            ))),
            other => Err(ReefError::Handshake(HandshakeError::AuthFailure(format!(
                "authentication failed with status 0x{:04x}",
                other
            )))),
        }
    }

    async fn select_bucket(&mut self, bucket: &str) -> ReefResult<()> {
        let mut req = Packet::request(OP_SELECT_BUCKET, 0);
        req.key = bucket.as_bytes().to_vec();
        let resp = self.roundtrip(req).await?;
        match resp.status() {
            STATUS_SUCCESS => Ok(()),
            STATUS_KEY_ENOENT | STATUS_ACCESS_ERROR => Err(ReefError::Handshake(
                HandshakeError::BucketNotFound(bucket.to_string()),
            )),
            other => Err(ReefError::Handshake(HandshakeError::BucketNotFound(
                format!("{} (status 0x{:04x})", bucket, other),
            ))),
        }
    }
}
