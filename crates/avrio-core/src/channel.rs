//! Channels: owners of a transport, a handshake and a pending-call registry.
//!
//! Four variants exist, stateless/stateful crossed with client/server. All
//! of them share the [`Connection`] machinery (one pump task per physical
//! transport, prefix-filtered record subscribers, serialized writes) and the
//! scope-prefix arithmetic that lets several logical channels coexist on one
//! transport.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use apache_avro::types::Value;
use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, trace, warn};

use crate::adapter::Adapter;
use crate::envelope::{
    decode_system_error, empty_response_body, system_error_body, CallContext, ChannelInfo,
    WrappedRequest,
};
use crate::error::{ErrorCode, RpcError};
use crate::frame::{read_record, write_record, Dialect, Record, RecordDecoder};
use crate::handshake::{HandshakeEngine, HandshakeMatch, HandshakeRequest, HandshakeResponder, HandshakeResponse};
use crate::registry::{Registry, ID_MASK};
use crate::service::ping_message;
use crate::transport::{ByteReader, ByteWriter, Duplex, Factory};

/// Records kept for a subscriber that has not attached yet.
const BACKLOG_LIMIT: usize = 1024;

/// Capacity of per-channel event broadcasts.
const EVENT_CAPACITY: usize = 32;

/// Derive the 16 high bits embedded in every wire id of a scoped channel.
///
/// An unset scope hashes to zero; recipients discard records whose prefix
/// does not match their own.
pub fn scope_prefix(scope: Option<&str>) -> u32 {
    match scope {
        None | Some("") => 0,
        Some(scope) => {
            let digest = md5::compute(scope.as_bytes());
            ((digest.0[0] as u32) << 24) | ((digest.0[1] as u32) << 16)
        }
    }
}

/// Options accepted by every channel constructor.
#[derive(Clone, Debug)]
pub struct ChannelOptions {
    /// Scope string isolating this channel on a shared transport.
    pub scope: Option<String>,
    /// Handshake deadline for stateful channels.
    pub timeout: Duration,
    /// Skip the connection probe and assume the peer runs the same
    /// protocol. Both ends of a channel must agree on this.
    pub no_ping: bool,
    /// End the writable side once the channel reaches end-of-transmission.
    pub end_writable: bool,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            scope: None,
            timeout: Duration::from_secs(10),
            no_ping: false,
            end_writable: true,
        }
    }
}

impl ChannelOptions {
    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn no_ping(mut self, no_ping: bool) -> Self {
        self.no_ping = no_ping;
        self
    }

    pub fn end_writable(mut self, end_writable: bool) -> Self {
        self.end_writable = end_writable;
        self
    }
}

/// Lifecycle notifications observable per channel.
#[derive(Clone, Debug)]
pub enum ChannelEvent {
    /// A handshake response was processed (client) or produced (server).
    Handshake { outcome: HandshakeMatch },
    /// A request was accepted for dispatch (server side).
    IncomingCall { message: String },
    /// A request was written to the transport (client side).
    OutgoingCall { message: String },
    /// End of transmission: the channel is gone and its registry drained.
    Eot,
    /// A channel-level failure.
    Error(RpcError),
}

/// Hook invoked once when a channel starts draining, used by the owning
/// client/server to drop it from the active set.
pub(crate) type DrainHook = Box<dyn FnOnce() + Send>;

/// Server-side dispatch callback: decoded request in, encoded response body
/// out (`None` for one-way messages).
pub(crate) type Dispatcher =
    Arc<dyn Fn(CallContext, WrappedRequest) -> BoxFuture<'static, Option<Vec<u8>>> + Send + Sync>;

/// Bundle of server callbacks handed to server channels.
#[derive(Clone)]
pub(crate) struct ServerHooks {
    pub dispatcher: Dispatcher,
    pub on_error: Arc<dyn Fn(&RpcError) + Send + Sync>,
    pub format_error: Arc<dyn Fn(&RpcError) -> String + Send + Sync>,
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// A shared, framed view of one physical transport.
///
/// One pump task de-frames incoming bytes and fans records out to every
/// subscriber; writes are serialized through a single sink. Channels filter
/// the fan-out by scope prefix, so several logical channels can share one
/// connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnInner>,
}

struct ConnInner {
    dialect: Dialect,
    sink: Sink,
    subs: Mutex<SubState>,
}

enum Sink {
    Bytes(tokio::sync::Mutex<ByteWriter>),
    Records(Mutex<Option<mpsc::UnboundedSender<Record>>>),
}

struct SubState {
    subscribers: Vec<mpsc::UnboundedSender<Record>>,
    backlog: VecDeque<Record>,
    source: Option<Source>,
    started: bool,
}

enum Source {
    Bytes(ByteReader),
    Records(mpsc::UnboundedReceiver<Record>),
}

impl Connection {
    /// Frame a byte transport with the given dialect.
    pub fn new(duplex: Duplex, dialect: Dialect) -> Self {
        let (reader, writer) = duplex.into_parts();
        Self {
            inner: Arc::new(ConnInner {
                dialect,
                sink: Sink::Bytes(tokio::sync::Mutex::new(writer)),
                subs: Mutex::new(SubState {
                    subscribers: Vec::new(),
                    backlog: VecDeque::new(),
                    source: Some(Source::Bytes(reader)),
                    started: false,
                }),
            }),
        }
    }

    /// Two connections joined at the record level, skipping the framing
    /// codec entirely.
    pub fn pair() -> (Self, Self) {
        let (tx_ab, rx_ab) = mpsc::unbounded_channel();
        let (tx_ba, rx_ba) = mpsc::unbounded_channel();
        let make = |tx: mpsc::UnboundedSender<Record>, rx: mpsc::UnboundedReceiver<Record>| Self {
            inner: Arc::new(ConnInner {
                dialect: Dialect::Netty,
                sink: Sink::Records(Mutex::new(Some(tx))),
                subs: Mutex::new(SubState {
                    subscribers: Vec::new(),
                    backlog: VecDeque::new(),
                    source: Some(Source::Records(rx)),
                    started: false,
                }),
            }),
        };
        (make(tx_ab, rx_ba), make(tx_ba, rx_ab))
    }

    /// Attach a record subscriber, starting the pump on first use.
    ///
    /// Records received before any subscriber attached are replayed to the
    /// first one.
    pub(crate) fn subscribe(&self) -> mpsc::UnboundedReceiver<Record> {
        let (tx, rx) = mpsc::unbounded_channel();
        let source = {
            let mut subs = self.inner.subs.lock();
            while let Some(record) = subs.backlog.pop_front() {
                let _ = tx.send(record);
            }
            subs.subscribers.push(tx);
            if subs.started {
                None
            } else {
                subs.started = true;
                subs.source.take()
            }
        };
        if let Some(source) = source {
            let inner = self.inner.clone();
            tokio::spawn(async move { inner.pump(source).await });
        }
        rx
    }

    /// Write one record to the shared sink.
    pub(crate) async fn send(&self, record: Record) -> Result<(), RpcError> {
        match &self.inner.sink {
            Sink::Bytes(writer) => {
                let mut writer = writer.lock().await;
                write_record(&mut *writer, self.inner.dialect, &record).await
            }
            Sink::Records(tx) => {
                let tx = tx.lock().clone();
                match tx {
                    Some(tx) => tx.send(record).map_err(|_| {
                        RpcError::new(ErrorCode::Transport, "connection closed")
                    }),
                    None => Err(RpcError::new(ErrorCode::Transport, "connection closed")),
                }
            }
        }
    }

    /// End the writable side of the transport.
    pub(crate) async fn shutdown_writer(&self) {
        match &self.inner.sink {
            Sink::Bytes(writer) => {
                let mut writer = writer.lock().await;
                let _ = writer.shutdown().await;
            }
            Sink::Records(tx) => {
                tx.lock().take();
            }
        }
    }
}

impl ConnInner {
    async fn pump(self: Arc<Self>, source: Source) {
        match source {
            Source::Bytes(mut reader) => {
                let mut decoder = RecordDecoder::new(self.dialect);
                loop {
                    match read_record(&mut reader, &mut decoder).await {
                        Ok(Some(record)) => self.distribute(record),
                        Ok(None) => break,
                        Err(e) => {
                            warn!(error = %e, "connection pump failed");
                            break;
                        }
                    }
                }
            }
            Source::Records(mut rx) => {
                while let Some(record) = rx.recv().await {
                    self.distribute(record);
                }
            }
        }
        // Dropping the senders signals end-of-stream to every subscriber.
        self.subs.lock().subscribers.clear();
    }

    fn distribute(&self, record: Record) {
        let mut subs = self.subs.lock();
        if subs.subscribers.is_empty() {
            if subs.backlog.len() >= BACKLOG_LIMIT {
                warn!("connection backlog full, dropping a record");
                subs.backlog.pop_front();
            }
            subs.backlog.push_back(record);
            return;
        }
        subs.subscribers
            .retain(|tx| tx.send(record.clone()).is_ok());
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("dialect", &self.inner.dialect)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Stateful client channel
// ---------------------------------------------------------------------------

/// Multiplexing client channel over a long-lived connection.
///
/// Unless `no_ping` is set, the channel opens with a handshake-bearing ping
/// and parks user sends until the handshake settles; after that every
/// incoming record is a bare response routed through the registry.
#[derive(Clone)]
pub struct StatefulClientChannel {
    inner: Arc<StatefulClientInner>,
}

struct StatefulClientInner {
    engine: Arc<HandshakeEngine>,
    conn: Connection,
    registry: Registry,
    prefix: u32,
    options: ChannelOptions,
    state: Mutex<StatefulClientState>,
    connected: watch::Sender<bool>,
    events: broadcast::Sender<ChannelEvent>,
}

struct StatefulClientState {
    adapter: Option<Arc<Adapter>>,
    draining: bool,
    destroyed: bool,
    sent_protocol: bool,
    drain_hook: Option<DrainHook>,
}

impl StatefulClientChannel {
    pub(crate) fn open(
        engine: Arc<HandshakeEngine>,
        conn: &Connection,
        options: ChannelOptions,
    ) -> Self {
        let prefix = scope_prefix(options.scope.as_deref());
        let no_ping = options.no_ping;
        let timeout = options.timeout;
        let (connected, _) = watch::channel(no_ping);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let adapter = no_ping.then(|| engine.identity());
        let inner = Arc::new(StatefulClientInner {
            engine,
            conn: conn.clone(),
            registry: Registry::new(),
            prefix,
            options,
            state: Mutex::new(StatefulClientState {
                adapter,
                draining: false,
                destroyed: false,
                sent_protocol: false,
                drain_hook: None,
            }),
            connected,
            events,
        });

        let rx = conn.subscribe();
        let reader = inner.clone();
        tokio::spawn(async move { reader.run(rx).await });

        if !no_ping {
            let opener = inner.clone();
            tokio::spawn(async move {
                if let Err(e) = opener.send_ping(false).await {
                    opener.fail(e);
                    return;
                }
                if tokio::time::timeout(timeout, opener.await_connected())
                    .await
                    .is_err()
                {
                    opener.fail(RpcError::new(ErrorCode::Timeout, "connection timeout"));
                }
            });
        }

        Self { inner }
    }

    pub fn scope(&self) -> Option<String> {
        self.inner.options.scope.clone()
    }

    /// Calls currently in flight on this channel.
    pub fn pending(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.state.lock().destroyed
    }

    pub fn is_draining(&self) -> bool {
        self.inner.state.lock().draining
    }

    pub fn events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.inner.events.subscribe()
    }

    pub(crate) fn note_outgoing(&self, message: &str) {
        let _ = self.inner.events.send(ChannelEvent::OutgoingCall {
            message: message.to_string(),
        });
    }

    /// Wait until the opening handshake has settled.
    pub async fn wait_connected(&self) -> Result<(), RpcError> {
        let mut watch = self.inner.connected.subscribe();
        loop {
            if self.inner.state.lock().destroyed {
                return Err(RpcError::interrupted());
            }
            if *watch.borrow() {
                return Ok(());
            }
            if watch.changed().await.is_err() {
                return Err(RpcError::interrupted());
            }
        }
    }

    pub(crate) fn set_drain_hook(&self, hook: DrainHook) {
        let mut state = self.inner.state.lock();
        if state.draining {
            drop(state);
            hook();
        } else {
            state.drain_hook = Some(hook);
        }
    }

    /// Send an encoded request body and await the raw response body.
    pub(crate) async fn call(
        &self,
        body: Vec<u8>,
        one_way: bool,
        timeout: Option<Duration>,
    ) -> Result<(Bytes, Arc<Adapter>), RpcError> {
        {
            let state = self.inner.state.lock();
            if state.draining || state.destroyed {
                return Err(RpcError::new(
                    ErrorCode::ChannelDestroyed,
                    "channel is draining",
                ));
            }
        }
        self.wait_connected().await?;

        let adapter = self
            .inner
            .state
            .lock()
            .adapter
            .clone()
            .ok_or_else(|| RpcError::interrupted())?;

        let (id, rx) = self.inner.registry.add(timeout);
        let wire_id = (self.inner.prefix | id) as i32;
        let record = Record::new(Some(wire_id), vec![Bytes::from(body)]);
        if let Err(e) = self.inner.conn.send(record).await {
            self.inner.registry.resolve(id, Err(e));
        } else if one_way {
            // One-way slots complete locally once the bytes are written.
            self.inner
                .registry
                .resolve(id, Ok(Bytes::from(empty_response_body())));
        }

        let result = rx.await.unwrap_or_else(|_| Err(RpcError::interrupted()));
        self.inner.maybe_finish_drain();
        result.map(|body| (body, adapter))
    }

    /// Tear the channel down.
    ///
    /// With `no_wait` (or nothing pending) the registry is flushed with
    /// interruptions immediately; otherwise the channel stops accepting
    /// sends and stays alive until the last pending call resolves.
    pub fn destroy(&self, no_wait: bool) {
        self.inner.start_drain();
        if no_wait || self.inner.registry.is_empty() {
            self.inner.finalize();
        }
    }
}

impl StatefulClientInner {
    async fn run(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Record>) {
        while let Some(record) = rx.recv().await {
            if self.state.lock().destroyed {
                return;
            }
            let Some(wire_id) = record.id else {
                trace!("discarding id-less record on a stateful channel");
                continue;
            };
            let wire_id = wire_id as u32;
            if wire_id & !ID_MASK != self.prefix {
                trace!(wire_id, "discarding record owned by another scope");
                continue;
            }

            if !*self.connected.borrow() {
                if let Err(e) = self.handle_handshake(&record).await {
                    self.fail(e);
                    return;
                }
                continue;
            }

            if !self.registry.resolve(wire_id, Ok(record.body())) {
                debug!(wire_id, "dropping response with no matching call");
            }
            self.maybe_finish_drain();
        }
        // Transport ended underneath us.
        self.finalize();
    }

    async fn handle_handshake(&self, record: &Record) -> Result<(), RpcError> {
        let body = record.body();
        let mut cursor = std::io::Cursor::new(&body[..]);
        let response = HandshakeResponse::decode(&mut cursor)?;
        let _ = self.events.send(ChannelEvent::Handshake {
            outcome: response.match_,
        });

        match self.engine.accept(&response)? {
            Some(adapter) => {
                self.state.lock().adapter = Some(adapter);
                let _ = self.connected.send(true);
                Ok(())
            }
            None => {
                let retried = {
                    let mut state = self.state.lock();
                    std::mem::replace(&mut state.sent_protocol, true)
                };
                if retried {
                    // Second NONE: the server may have attached a reason.
                    let rest = &body[cursor.position() as usize..];
                    let message = decode_system_error(rest)
                        .unwrap_or_else(|| "handshake refused after sending protocol".into());
                    return Err(RpcError::new(ErrorCode::IncompatibleProtocol, message));
                }
                self.send_ping(true).await
            }
        }
    }

    async fn send_ping(&self, include_protocol: bool) -> Result<(), RpcError> {
        let handshake = self.engine.request(include_protocol).encode()?;
        let ping = WrappedRequest::new(ping_message().clone(), Value::Record(vec![])).encode()?;
        let record = Record::new(
            Some(self.prefix as i32),
            vec![Bytes::from(handshake), Bytes::from(ping)],
        );
        self.conn.send(record).await
    }

    async fn await_connected(&self) {
        let mut watch = self.connected.subscribe();
        loop {
            if *watch.borrow() || self.state.lock().destroyed {
                return;
            }
            if watch.changed().await.is_err() {
                return;
            }
        }
    }

    fn start_drain(&self) {
        let hook = {
            let mut state = self.state.lock();
            if state.draining {
                return;
            }
            state.draining = true;
            state.drain_hook.take()
        };
        if let Some(hook) = hook {
            hook();
        }
    }

    fn maybe_finish_drain(&self) {
        let draining = {
            let state = self.state.lock();
            state.draining && !state.destroyed
        };
        if draining && self.registry.is_empty() {
            self.finalize();
        }
    }

    fn fail(&self, error: RpcError) {
        warn!(error = %error, "stateful client channel failed");
        let _ = self.events.send(ChannelEvent::Error(error));
        self.start_drain();
        self.finalize();
    }

    fn finalize(&self) {
        {
            let mut state = self.state.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            state.draining = true;
        }
        self.registry.clear();
        // Wake anything parked on the connected watch; it re-checks the
        // destroyed flag.
        self.connected.send_modify(|_| {});
        let _ = self.events.send(ChannelEvent::Eot);
        if self.options.end_writable {
            let conn = self.conn.clone();
            tokio::spawn(async move { conn.shutdown_writer().await });
        }
    }
}

// ---------------------------------------------------------------------------
// Stateless client channel
// ---------------------------------------------------------------------------

/// Client channel building one fresh transport per call.
///
/// Every call carries its own handshake; there is no connection state to
/// keep, so calls are fully isolated from each other.
#[derive(Clone)]
pub struct StatelessClientChannel {
    inner: Arc<StatelessClientInner>,
}

struct StatelessClientInner {
    engine: Arc<HandshakeEngine>,
    factory: Factory,
    options: ChannelOptions,
    prefix: u32,
    next_id: AtomicU32,
    pending: AtomicUsize,
    state: Mutex<StatelessClientState>,
    events: broadcast::Sender<ChannelEvent>,
}

struct StatelessClientState {
    draining: bool,
    destroyed: bool,
    drain_hook: Option<DrainHook>,
}

impl StatelessClientChannel {
    pub(crate) fn open(
        engine: Arc<HandshakeEngine>,
        factory: Factory,
        options: ChannelOptions,
    ) -> Self {
        let prefix = scope_prefix(options.scope.as_deref());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(StatelessClientInner {
                engine,
                factory,
                options,
                prefix,
                next_id: AtomicU32::new(0),
                pending: AtomicUsize::new(0),
                state: Mutex::new(StatelessClientState {
                    draining: false,
                    destroyed: false,
                    drain_hook: None,
                }),
                events,
            }),
        }
    }

    pub fn scope(&self) -> Option<String> {
        self.inner.options.scope.clone()
    }

    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::Acquire)
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.state.lock().destroyed
    }

    pub fn is_draining(&self) -> bool {
        self.inner.state.lock().draining
    }

    pub fn events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.inner.events.subscribe()
    }

    pub(crate) fn note_outgoing(&self, message: &str) {
        let _ = self.inner.events.send(ChannelEvent::OutgoingCall {
            message: message.to_string(),
        });
    }

    pub(crate) fn set_drain_hook(&self, hook: DrainHook) {
        let mut state = self.inner.state.lock();
        if state.draining {
            drop(state);
            hook();
        } else {
            state.drain_hook = Some(hook);
        }
    }

    pub(crate) async fn call(
        &self,
        body: Vec<u8>,
        one_way: bool,
        timeout: Option<Duration>,
    ) -> Result<(Bytes, Arc<Adapter>), RpcError> {
        {
            let state = self.inner.state.lock();
            if state.draining || state.destroyed {
                return Err(RpcError::new(
                    ErrorCode::ChannelDestroyed,
                    "channel is draining",
                ));
            }
        }

        self.inner.pending.fetch_add(1, Ordering::AcqRel);
        let result = match timeout.filter(|t| !t.is_zero()) {
            Some(timeout) => {
                match tokio::time::timeout(timeout, self.inner.attempt(body, one_way)).await {
                    Ok(result) => result,
                    Err(_) => Err(RpcError::timeout()),
                }
            }
            None => self.inner.attempt(body, one_way).await,
        };
        self.inner.pending.fetch_sub(1, Ordering::AcqRel);
        self.inner.maybe_finish_drain();
        result
    }

    pub fn destroy(&self, no_wait: bool) {
        self.inner.start_drain();
        if no_wait || self.inner.pending.load(Ordering::Acquire) == 0 {
            self.inner.finalize();
        }
    }
}

impl StatelessClientInner {
    async fn attempt(
        &self,
        body: Vec<u8>,
        one_way: bool,
    ) -> Result<(Bytes, Arc<Adapter>), RpcError> {
        let body = Bytes::from(body);
        let mut include_protocol = false;
        loop {
            let duplex = (self.factory)()
                .await
                .map_err(|e| RpcError::with_source(ErrorCode::Transport, "transport factory failed", e))?;
            let (mut reader, mut writer) = duplex.into_parts();

            let id = self.next_id.fetch_add(1, Ordering::AcqRel).wrapping_add(1) & ID_MASK;
            let wire_id = (self.prefix | id) as i32;
            let handshake = self.engine.request(include_protocol).encode()?;
            let record = Record::new(
                Some(wire_id),
                vec![Bytes::from(handshake), body.clone()],
            );
            write_record(&mut writer, Dialect::Standard, &record).await?;
            if self.options.end_writable {
                let _ = writer.shutdown().await;
            }

            if one_way {
                // Nothing comes back for one-way calls.
                return Ok((
                    Bytes::from(empty_response_body()),
                    self.current_adapter(),
                ));
            }

            let mut decoder = RecordDecoder::new(Dialect::Standard);
            let record = read_record(&mut reader, &mut decoder)
                .await?
                .ok_or_else(|| {
                    RpcError::new(ErrorCode::Transport, "connection closed before the response")
                })?;
            let body_in = record.body();
            let mut cursor = std::io::Cursor::new(&body_in[..]);
            let response = HandshakeResponse::decode(&mut cursor)?;
            let _ = self.events.send(ChannelEvent::Handshake {
                outcome: response.match_,
            });

            match self.engine.accept(&response)? {
                Some(adapter) => {
                    let rest = body_in.slice(cursor.position() as usize..);
                    return Ok((rest, adapter));
                }
                None if include_protocol => {
                    let rest = &body_in[cursor.position() as usize..];
                    let message = decode_system_error(rest)
                        .unwrap_or_else(|| "handshake refused after sending protocol".into());
                    return Err(RpcError::new(ErrorCode::IncompatibleProtocol, message));
                }
                None => include_protocol = true,
            }
        }
    }

    fn current_adapter(&self) -> Arc<Adapter> {
        // Best effort for one-way calls: the identity adapter is always
        // present and one-way bodies decode with either side's schemas.
        self.engine.identity()
    }

    fn start_drain(&self) {
        let hook = {
            let mut state = self.state.lock();
            if state.draining {
                return;
            }
            state.draining = true;
            state.drain_hook.take()
        };
        if let Some(hook) = hook {
            hook();
        }
    }

    fn maybe_finish_drain(&self) {
        let draining = {
            let state = self.state.lock();
            state.draining && !state.destroyed
        };
        if draining && self.pending.load(Ordering::Acquire) == 0 {
            self.finalize();
        }
    }

    fn finalize(&self) {
        {
            let mut state = self.state.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            state.draining = true;
        }
        let _ = self.events.send(ChannelEvent::Eot);
    }
}

// ---------------------------------------------------------------------------
// Stateful server channel
// ---------------------------------------------------------------------------

/// Server end of a long-lived connection.
///
/// The first record on the channel must carry a handshake; once an adapter
/// is installed every further record is a bare request. A client that
/// restarts must open a new channel — this one never re-handshakes.
#[derive(Clone)]
pub struct StatefulServerChannel {
    inner: Arc<StatefulServerInner>,
}

struct StatefulServerInner {
    responder: Arc<HandshakeResponder>,
    hooks: ServerHooks,
    conn: Connection,
    options: ChannelOptions,
    prefix: u32,
    adapter: Mutex<Option<Arc<Adapter>>>,
    pending: AtomicUsize,
    state: Mutex<ServerChannelState>,
    events: broadcast::Sender<ChannelEvent>,
}

struct ServerChannelState {
    draining: bool,
    destroyed: bool,
    drain_hook: Option<DrainHook>,
}

impl StatefulServerChannel {
    pub(crate) fn open(
        responder: Arc<HandshakeResponder>,
        hooks: ServerHooks,
        conn: &Connection,
        options: ChannelOptions,
    ) -> Self {
        let prefix = scope_prefix(options.scope.as_deref());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let adapter = options.no_ping.then(|| responder.identity());

        let inner = Arc::new(StatefulServerInner {
            responder,
            hooks,
            conn: conn.clone(),
            options,
            prefix,
            adapter: Mutex::new(adapter),
            pending: AtomicUsize::new(0),
            state: Mutex::new(ServerChannelState {
                draining: false,
                destroyed: false,
                drain_hook: None,
            }),
            events,
        });

        let rx = conn.subscribe();
        let runner = inner.clone();
        tokio::spawn(async move { runner.run(rx).await });

        Self { inner }
    }

    pub fn scope(&self) -> Option<String> {
        self.inner.options.scope.clone()
    }

    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::Acquire)
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.state.lock().destroyed
    }

    pub fn events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.inner.events.subscribe()
    }

    pub(crate) fn set_drain_hook(&self, hook: DrainHook) {
        let mut state = self.inner.state.lock();
        if state.draining {
            drop(state);
            hook();
        } else {
            state.drain_hook = Some(hook);
        }
    }

    pub fn destroy(&self, no_wait: bool) {
        self.inner.start_drain();
        if no_wait || self.inner.pending.load(Ordering::Acquire) == 0 {
            self.inner.finalize();
        }
    }
}

impl StatefulServerInner {
    async fn run(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Record>) {
        while let Some(record) = rx.recv().await {
            if self.state.lock().destroyed {
                return;
            }
            let Some(wire_id) = record.id else {
                trace!("discarding id-less record on a stateful channel");
                continue;
            };
            if (wire_id as u32) & !ID_MASK != self.prefix {
                trace!(wire_id, "discarding record owned by another scope");
                continue;
            }
            if self.state.lock().draining {
                debug!("dropping request on a draining channel");
                continue;
            }

            let adapter = self.adapter.lock().clone();
            match adapter {
                // First record: handshake, handled inline so the response
                // carrying the handshake is the first record written back.
                None => self.handle_handshake_record(wire_id, record).await,
                Some(adapter) => Self::handle_request_record(&self, adapter, wire_id, record).await,
            }
        }
        self.finalize();
    }

    async fn handle_handshake_record(&self, wire_id: i32, record: Record) {
        let body = record.body();
        let mut cursor = std::io::Cursor::new(&body[..]);
        let request = match HandshakeRequest::decode(&mut cursor) {
            Ok(request) => request,
            Err(e) => {
                (self.hooks.on_error)(&e);
                let refusal = HandshakeResponse {
                    match_: HandshakeMatch::None,
                    server_protocol: None,
                    server_hash: None,
                    meta: None,
                };
                let text = (self.hooks.format_error)(&e);
                self.reply_handshake(wire_id, &refusal, Some(system_error_body(&text)))
                    .await;
                return;
            }
        };

        let (response, adapter, err) = self.responder.respond(&request);
        let _ = self.events.send(ChannelEvent::Handshake {
            outcome: response.match_,
        });

        if let Some(e) = err {
            (self.hooks.on_error)(&e);
            let text = (self.hooks.format_error)(&e);
            self.reply_handshake(wire_id, &response, Some(system_error_body(&text)))
                .await;
            return;
        }
        let Some(adapter) = adapter else {
            // Unknown client, no protocol attached: ask for a resend.
            self.reply_handshake(wire_id, &response, None).await;
            return;
        };
        *self.adapter.lock() = Some(adapter.clone());

        let rest = &body[cursor.position() as usize..];
        if rest.is_empty() {
            self.reply_handshake(wire_id, &response, None).await;
            return;
        }
        match adapter.decode_request(rest) {
            Err(e) => {
                (self.hooks.on_error)(&e);
                let text = (self.hooks.format_error)(&e);
                self.reply_handshake(wire_id, &response, Some(system_error_body(&text)))
                    .await;
            }
            Ok(wreq) if wreq.message.is_ping() => {
                self.reply_handshake(wire_id, &response, None).await;
            }
            Ok(wreq) => {
                let out = self.dispatch(wreq).await;
                self.reply_handshake(wire_id, &response, out).await;
            }
        }
    }

    async fn handle_request_record(
        this: &Arc<Self>,
        adapter: Arc<Adapter>,
        wire_id: i32,
        record: Record,
    ) {
        let body = record.body();
        let wreq = match adapter.decode_request(&body) {
            Ok(wreq) => wreq,
            Err(e) => {
                (this.hooks.on_error)(&e);
                let text = (this.hooks.format_error)(&e);
                this.reply(wire_id, system_error_body(&text)).await;
                return;
            }
        };
        let _ = this.events.send(ChannelEvent::IncomingCall {
            message: wreq.message.name().to_string(),
        });

        if wreq.message.is_ping() {
            this.reply(wire_id, empty_response_body()).await;
            return;
        }

        if wreq.message.one_way() {
            // One-way requests run inline: nothing goes back on the wire,
            // and arrival order is preserved through the handler.
            this.dispatch(wreq).await;
            this.maybe_finish_drain();
            return;
        }

        let task = this.clone();
        this.pending.fetch_add(1, Ordering::AcqRel);
        tokio::spawn(async move {
            if let Some(out) = task.dispatch(wreq).await {
                task.reply(wire_id, out).await;
            }
            task.pending.fetch_sub(1, Ordering::AcqRel);
            task.maybe_finish_drain();
        });
    }

    async fn dispatch(&self, wreq: WrappedRequest) -> Option<Vec<u8>> {
        let ctx = CallContext::new(
            wreq.message.clone(),
            ChannelInfo {
                scope: self.options.scope.clone(),
                prefix: self.prefix,
                stateless: false,
                server: true,
            },
        );
        (self.hooks.dispatcher)(ctx, wreq).await
    }

    async fn reply_handshake(
        &self,
        wire_id: i32,
        response: &HandshakeResponse,
        body: Option<Vec<u8>>,
    ) {
        let encoded = match response.encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(error = %e, "failed to encode handshake response");
                return;
            }
        };
        let mut payload = vec![Bytes::from(encoded)];
        if let Some(body) = body {
            payload.push(Bytes::from(body));
        }
        if let Err(e) = self.conn.send(Record::new(Some(wire_id), payload)).await {
            warn!(error = %e, "failed to write handshake response");
        }
    }

    async fn reply(&self, wire_id: i32, body: Vec<u8>) {
        let record = Record::new(Some(wire_id), vec![Bytes::from(body)]);
        if let Err(e) = self.conn.send(record).await {
            warn!(error = %e, "failed to write response");
        }
    }

    fn start_drain(&self) {
        let hook = {
            let mut state = self.state.lock();
            if state.draining {
                return;
            }
            state.draining = true;
            state.drain_hook.take()
        };
        if let Some(hook) = hook {
            hook();
        }
    }

    fn maybe_finish_drain(&self) {
        let draining = {
            let state = self.state.lock();
            state.draining && !state.destroyed
        };
        if draining && self.pending.load(Ordering::Acquire) == 0 {
            self.finalize();
        }
    }

    fn finalize(&self) {
        {
            let mut state = self.state.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            state.draining = true;
        }
        let _ = self.events.send(ChannelEvent::Eot);
        if self.options.end_writable {
            let conn = self.conn.clone();
            tokio::spawn(async move { conn.shutdown_writer().await });
        }
    }
}
