//! Client façade: channel set, middleware chain and message emission.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use apache_avro::types::Value;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::sync::{broadcast, Notify};
use tracing::debug;

use crate::channel::{
    ChannelEvent, ChannelOptions, Connection, StatefulClientChannel, StatelessClientChannel,
};
use crate::envelope::{CallContext, ChannelInfo, WrappedRequest, WrappedResponse};
use crate::error::{ErrorCode, RpcError};
use crate::frame::Dialect;
use crate::handshake::HandshakeEngine;
use crate::middleware::{run_backward, run_forward, Middleware};
use crate::service::{Message, Service};
use crate::transport::{Duplex, Factory};
use crate::types::Headers;

/// Policy picking a channel for the next call when several are active.
pub type ChannelPolicy = Arc<dyn Fn(&[ClientChannel]) -> usize + Send + Sync>;

/// Client-wide options.
#[derive(Clone)]
pub struct ClientOptions {
    /// Default per-call timeout.
    pub timeout: Duration,
    /// Deliver remote errors exactly as typed by the error union instead of
    /// coercing string errors into plain error objects.
    pub strict_errors: bool,
    /// Park calls issued while no channel is active until one appears.
    pub buffering: bool,
    /// Channel selection policy; uniform random when unset.
    pub channel_policy: Option<ChannelPolicy>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            strict_errors: false,
            buffering: true,
            channel_policy: None,
        }
    }
}

impl ClientOptions {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn strict_errors(mut self, strict: bool) -> Self {
        self.strict_errors = strict;
        self
    }

    pub fn buffering(mut self, buffering: bool) -> Self {
        self.buffering = buffering;
        self
    }

    pub fn channel_policy(mut self, policy: ChannelPolicy) -> Self {
        self.channel_policy = Some(policy);
        self
    }
}

/// Per-call options.
#[derive(Clone, Debug, Default)]
pub struct CallOptions {
    /// Override of the client-wide timeout.
    pub timeout: Option<Duration>,
    /// Headers attached to the outgoing request.
    pub headers: Headers,
}

impl CallOptions {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// Handle to one client channel, stateful or stateless.
#[derive(Clone)]
pub enum ClientChannel {
    Stateful(StatefulClientChannel),
    Stateless(StatelessClientChannel),
}

impl ClientChannel {
    pub fn scope(&self) -> Option<String> {
        match self {
            ClientChannel::Stateful(c) => c.scope(),
            ClientChannel::Stateless(c) => c.scope(),
        }
    }

    pub fn pending(&self) -> usize {
        match self {
            ClientChannel::Stateful(c) => c.pending(),
            ClientChannel::Stateless(c) => c.pending(),
        }
    }

    pub fn is_destroyed(&self) -> bool {
        match self {
            ClientChannel::Stateful(c) => c.is_destroyed(),
            ClientChannel::Stateless(c) => c.is_destroyed(),
        }
    }

    pub fn is_draining(&self) -> bool {
        match self {
            ClientChannel::Stateful(c) => c.is_draining(),
            ClientChannel::Stateless(c) => c.is_draining(),
        }
    }

    pub fn destroy(&self, no_wait: bool) {
        match self {
            ClientChannel::Stateful(c) => c.destroy(no_wait),
            ClientChannel::Stateless(c) => c.destroy(no_wait),
        }
    }

    pub fn events(&self) -> broadcast::Receiver<ChannelEvent> {
        match self {
            ClientChannel::Stateful(c) => c.events(),
            ClientChannel::Stateless(c) => c.events(),
        }
    }

    fn info(&self) -> ChannelInfo {
        ChannelInfo {
            scope: self.scope(),
            prefix: crate::channel::scope_prefix(self.scope().as_deref()),
            stateless: matches!(self, ClientChannel::Stateless(_)),
            server: false,
        }
    }

    fn note_outgoing(&self, message: &str) {
        match self {
            ClientChannel::Stateful(c) => c.note_outgoing(message),
            ClientChannel::Stateless(c) => c.note_outgoing(message),
        }
    }

    async fn call(
        &self,
        body: Vec<u8>,
        one_way: bool,
        timeout: Option<Duration>,
    ) -> Result<(bytes::Bytes, Arc<crate::adapter::Adapter>), RpcError> {
        match self {
            ClientChannel::Stateful(c) => c.call(body, one_way, timeout).await,
            ClientChannel::Stateless(c) => c.call(body, one_way, timeout).await,
        }
    }
}

/// RPC client for one service.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    engine: Arc<HandshakeEngine>,
    options: ClientOptions,
    middlewares: RwLock<Vec<Arc<dyn Middleware>>>,
    channels: Mutex<Vec<(u64, ClientChannel)>>,
    next_channel_id: AtomicU64,
    channel_added: Notify,
}

impl Client {
    pub fn new(service: Arc<Service>, options: ClientOptions) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                engine: Arc::new(HandshakeEngine::new(service)),
                options,
                middlewares: RwLock::new(Vec::new()),
                channels: Mutex::new(Vec::new()),
                next_channel_id: AtomicU64::new(0),
                channel_added: Notify::new(),
            }),
        }
    }

    pub fn service(&self) -> &Arc<Service> {
        self.inner.engine.service()
    }

    /// Append a middleware to the chain. Middleware added after calls have
    /// started only affects subsequent calls.
    pub fn use_middleware(&self, middleware: Arc<dyn Middleware>) {
        self.inner.middlewares.write().push(middleware);
    }

    /// Open a stateful channel on a shared connection.
    pub fn stateful_channel(
        &self,
        conn: &Connection,
        options: ChannelOptions,
    ) -> StatefulClientChannel {
        let channel = StatefulClientChannel::open(self.inner.engine.clone(), conn, options);
        self.register(ClientChannel::Stateful(channel.clone()));
        channel
    }

    /// Open a stateful channel owning the given transport.
    pub fn create_channel(&self, duplex: Duplex, options: ChannelOptions) -> StatefulClientChannel {
        let conn = Connection::new(duplex, Dialect::Netty);
        self.stateful_channel(&conn, options)
    }

    /// Open a stateless channel: one fresh transport per call.
    pub fn stateless_channel(
        &self,
        factory: Factory,
        options: ChannelOptions,
    ) -> StatelessClientChannel {
        let channel =
            StatelessClientChannel::open(self.inner.engine.clone(), factory, options);
        self.register(ClientChannel::Stateless(channel.clone()));
        channel
    }

    pub fn active_channels(&self) -> Vec<ClientChannel> {
        self.inner
            .channels
            .lock()
            .iter()
            .map(|(_, c)| c.clone())
            .collect()
    }

    /// Destroy every active channel.
    pub fn destroy_channels(&self, no_wait: bool) {
        for channel in self.active_channels() {
            channel.destroy(no_wait);
        }
    }

    /// Remote protocols learned from handshakes, keyed by fingerprint hex.
    pub fn remote_protocols(&self) -> HashMap<String, String> {
        self.inner.engine.remote_protocols()
    }

    /// Emit a message and await its outcome.
    ///
    /// The request value must be a record matching the message's request
    /// type. The callback never completes synchronously with the send, even
    /// over in-memory transports.
    pub async fn emit_message(
        &self,
        name: &str,
        request: Value,
        options: CallOptions,
    ) -> Result<Value, RpcError> {
        let message = self
            .service()
            .message(name)
            .cloned()
            .ok_or_else(|| {
                RpcError::new(ErrorCode::InvalidRequest, format!("unknown message {:?}", name))
            })?;
        let channel = self.pick_channel().await?;
        let timeout = options.timeout.or(Some(self.inner.options.timeout));

        let mut wreq = WrappedRequest::new(message.clone(), request);
        wreq.headers = options.headers;
        let mut wres = WrappedResponse::default();
        let ctx = CallContext::new(message.clone(), channel.info());

        let middlewares = self.inner.middlewares.read().clone();
        let (ran, mut err) = run_forward(&middlewares, &ctx, &mut wreq, &mut wres).await;

        if err.is_none() && !wres.is_settled() {
            if let Err(e) = self
                .transition(&channel, &message, &wreq, &mut wres, timeout)
                .await
            {
                err = Some(e);
            }
        }

        run_backward(&middlewares, ran, &ctx, &wreq, &mut wres, &mut err).await;
        self.complete(wres, err)
    }

    /// The transition: serialize, send, decode.
    async fn transition(
        &self,
        channel: &ClientChannel,
        message: &Arc<Message>,
        wreq: &WrappedRequest,
        wres: &mut WrappedResponse,
        timeout: Option<Duration>,
    ) -> Result<(), RpcError> {
        let body = wreq.encode()?;
        channel.note_outgoing(message.name());
        let (body, adapter) = channel.call(body, message.one_way(), timeout).await?;
        adapter.decode_response(&body, wres, message)
    }

    fn complete(
        &self,
        wres: WrappedResponse,
        err: Option<RpcError>,
    ) -> Result<Value, RpcError> {
        if let Some(e) = err {
            return Err(e);
        }
        if let Some(value) = wres.error {
            return Err(self.coerce_error(value));
        }
        Ok(wres.response.unwrap_or(Value::Null))
    }

    /// Error coercion. Non-strict clients unwrap the string branch of the
    /// error union into a plain error; strict clients keep the wire value.
    fn coerce_error(&self, value: Value) -> RpcError {
        if self.inner.options.strict_errors {
            let message = error_text(&value).unwrap_or_else(|| "application error".to_string());
            return RpcError::application(Some(value), message);
        }
        match value {
            Value::Union(0, inner) => match *inner {
                Value::String(s) => RpcError::application(None, s),
                other => RpcError::application(Some(other), "application error"),
            },
            Value::String(s) => RpcError::application(None, s),
            other => {
                let message = error_text(&other).unwrap_or_else(|| "application error".to_string());
                RpcError::application(Some(other), message)
            }
        }
    }

    async fn pick_channel(&self) -> Result<ClientChannel, RpcError> {
        // Arm the notification before the first check so a channel added in
        // between is not missed.
        let notified = self.inner.channel_added.notified();
        if let Some(channel) = self.try_pick() {
            return Ok(channel);
        }
        if !self.inner.options.buffering {
            return Err(RpcError::new(
                ErrorCode::NoActiveChannels,
                "no active channels",
            ));
        }
        debug!("no active channel, parking the call");
        notified.await;
        self.try_pick().ok_or_else(|| {
            RpcError::new(ErrorCode::NoActiveChannels, "no active channels")
        })
    }

    fn try_pick(&self) -> Option<ClientChannel> {
        let live: Vec<ClientChannel> = self
            .inner
            .channels
            .lock()
            .iter()
            .filter(|(_, c)| !c.is_draining())
            .map(|(_, c)| c.clone())
            .collect();
        match live.len() {
            0 => None,
            1 => Some(live[0].clone()),
            n => {
                let index = match &self.inner.options.channel_policy {
                    Some(policy) => policy(&live).min(n - 1),
                    None => rand::thread_rng().gen_range(0..n),
                };
                Some(live[index].clone())
            }
        }
    }

    fn register(&self, channel: ClientChannel) {
        let id = self.inner.next_channel_id.fetch_add(1, Ordering::AcqRel);
        self.inner.channels.lock().push((id, channel.clone()));

        let weak = Arc::downgrade(&self.inner);
        let hook = Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.channels.lock().retain(|(cid, _)| *cid != id);
            }
        });
        match &channel {
            ClientChannel::Stateful(c) => c.set_drain_hook(hook),
            ClientChannel::Stateless(c) => c.set_drain_hook(hook),
        }
        self.inner.channel_added.notify_waiters();
    }
}

/// Best-effort human text for a typed error value.
fn error_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Union(_, inner) => error_text(inner.as_ref()),
        Value::Enum(_, symbol) => Some(symbol.clone()),
        Value::Record(fields) => fields.iter().find_map(|(_, v)| error_text(v)),
        _ => None,
    }
}

/// Open a minimal client over `duplex`, capture the peer's protocol from the
/// handshake, and tear the channel down.
pub async fn discover_protocol(
    duplex: Duplex,
    options: ChannelOptions,
) -> Result<String, RpcError> {
    let service = Service::from_json(r#"{"protocol": "avrio.Discovery"}"#)?;
    let client = Client::new(service, ClientOptions::default());
    let conn = Connection::new(duplex, Dialect::Netty);
    let channel = client.stateful_channel(&conn, options);
    let connected = channel.wait_connected().await;
    let protocols = client.remote_protocols();
    channel.destroy(true);
    connected?;
    protocols.into_values().next().ok_or_else(|| {
        RpcError::new(
            ErrorCode::UnknownProtocol,
            "peer did not reveal its protocol",
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_message_is_rejected_up_front() {
        let service = Service::from_json(
            r#"{"protocol": "P", "messages": {"f": {"request": [], "response": "null"}}}"#,
        )
        .unwrap();
        let client = Client::new(service, ClientOptions::default());
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let err = rt
            .block_on(client.emit_message("nope", Value::Record(vec![]), CallOptions::default()))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidRequest);
    }

    #[test]
    fn no_channels_without_buffering_fails_fast() {
        let service = Service::from_json(
            r#"{"protocol": "P", "messages": {"f": {"request": [], "response": "null"}}}"#,
        )
        .unwrap();
        let client = Client::new(service, ClientOptions::default().buffering(false));
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let err = rt
            .block_on(client.emit_message("f", Value::Record(vec![]), CallOptions::default()))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NoActiveChannels);
    }

    #[test]
    fn strict_and_loose_error_coercion() {
        let service = Service::from_json(
            r#"{"protocol": "P", "messages": {"f": {"request": [], "response": "null"}}}"#,
        )
        .unwrap();

        let loose = Client::new(service.clone(), ClientOptions::default());
        let err = loose.coerce_error(Value::Union(0, Box::new(Value::String("oops".into()))));
        assert_eq!(err.message(), "oops");
        assert!(err.value().is_none());

        let strict = Client::new(service, ClientOptions::default().strict_errors(true));
        let wire = Value::Union(0, Box::new(Value::String("oops".into())));
        let err = strict.coerce_error(wire.clone());
        assert_eq!(err.value(), Some(&wire));
    }
}
