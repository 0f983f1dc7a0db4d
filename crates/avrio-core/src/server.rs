//! Server façade: handler table, middleware chain and server channels.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use apache_avro::types::Value;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tracing::error;

use crate::channel::{
    ChannelOptions, Connection, ServerHooks, StatefulServerChannel,
};
use crate::envelope::{
    system_error_body, CallContext, ChannelInfo, WrappedRequest, WrappedResponse,
};
use crate::error::{ErrorCode, RpcError};
use crate::frame::{read_record, write_record, Dialect, Record, RecordDecoder};
use crate::handshake::{HandshakeMatch, HandshakeRequest, HandshakeResponder, HandshakeResponse};
use crate::middleware::{run_backward, run_forward, Middleware};
use crate::service::Service;
use crate::transport::Duplex;

/// Capacity of the server error broadcast.
const ERROR_CAPACITY: usize = 64;

/// A registered message handler.
pub type Handler =
    Arc<dyn Fn(CallContext, Value) -> BoxFuture<'static, Result<Value, RpcError>> + Send + Sync>;

/// Formatter turning server-side errors into the system error string put on
/// the wire.
pub type ErrorFormatter = Arc<dyn Fn(&RpcError) -> String + Send + Sync>;

/// Server-wide options.
#[derive(Clone, Default)]
pub struct ServerOptions {
    /// Require handlers to produce errors typed by the error union; loose
    /// handlers may report plain messages that travel on the string branch.
    pub strict_errors: bool,
    /// Suppress error logging (the error observer still sees everything).
    pub silent: bool,
    /// Formats server-side errors before they are written as system errors.
    /// Defaults to the error's code string.
    pub system_error_formatter: Option<ErrorFormatter>,
}

impl ServerOptions {
    pub fn strict_errors(mut self, strict: bool) -> Self {
        self.strict_errors = strict;
        self
    }

    pub fn silent(mut self, silent: bool) -> Self {
        self.silent = silent;
        self
    }

    pub fn system_error_formatter(mut self, formatter: ErrorFormatter) -> Self {
        self.system_error_formatter = Some(formatter);
        self
    }
}

/// RPC server for one service.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    responder: Arc<HandshakeResponder>,
    options: ServerOptions,
    middlewares: RwLock<Vec<Arc<dyn Middleware>>>,
    handlers: RwLock<HashMap<String, Handler>>,
    default_handler: RwLock<Option<Handler>>,
    channels: Mutex<Vec<(u64, StatefulServerChannel)>>,
    next_channel_id: AtomicU64,
    errors: broadcast::Sender<RpcError>,
}

impl Server {
    pub fn new(service: Arc<Service>, options: ServerOptions) -> Self {
        let (errors, _) = broadcast::channel(ERROR_CAPACITY);
        Self {
            inner: Arc::new(ServerInner {
                responder: Arc::new(HandshakeResponder::new(service)),
                options,
                middlewares: RwLock::new(Vec::new()),
                handlers: RwLock::new(HashMap::new()),
                default_handler: RwLock::new(None),
                channels: Mutex::new(Vec::new()),
                next_channel_id: AtomicU64::new(0),
                errors,
            }),
        }
    }

    pub fn service(&self) -> &Arc<Service> {
        self.inner.responder.service()
    }

    /// Register the handler for a declared message.
    pub fn on_message<F, Fut>(&self, name: &str, handler: F) -> Result<(), RpcError>
    where
        F: Fn(CallContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        if self.service().message(name).is_none() {
            return Err(RpcError::new(
                ErrorCode::InvalidProtocol,
                format!("message {:?} is not declared by the protocol", name),
            ));
        }
        let handler: Handler = Arc::new(
            move |ctx, request| -> BoxFuture<'static, Result<Value, RpcError>> {
                Box::pin(handler(ctx, request))
            },
        );
        self.inner.handlers.write().insert(name.to_string(), handler);
        Ok(())
    }

    /// Handler used for messages with no registered handler.
    pub fn set_default_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(CallContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        let handler: Handler = Arc::new(
            move |ctx, request| -> BoxFuture<'static, Result<Value, RpcError>> {
                Box::pin(handler(ctx, request))
            },
        );
        *self.inner.default_handler.write() = Some(handler);
    }

    /// Append a middleware to the dispatch chain.
    pub fn use_middleware(&self, middleware: Arc<dyn Middleware>) {
        self.inner.middlewares.write().push(middleware);
    }

    /// Open a stateful server channel on a shared connection.
    pub fn stateful_channel(
        &self,
        conn: &Connection,
        options: ChannelOptions,
    ) -> StatefulServerChannel {
        let channel = StatefulServerChannel::open(
            self.inner.responder.clone(),
            self.inner.hooks(),
            conn,
            options,
        );
        self.register(channel.clone());
        channel
    }

    /// Open a stateful server channel owning the given transport.
    pub fn create_channel(&self, duplex: Duplex, options: ChannelOptions) -> StatefulServerChannel {
        let conn = Connection::new(duplex, Dialect::Netty);
        self.stateful_channel(&conn, options)
    }

    /// Serve exactly one stateless record on `duplex`: read one framed
    /// request, write one framed response, and finish.
    pub async fn serve_stateless(
        &self,
        duplex: Duplex,
        options: ChannelOptions,
    ) -> Result<(), RpcError> {
        let (mut reader, mut writer) = duplex.into_parts();
        let mut decoder = RecordDecoder::new(Dialect::Standard);
        let record = read_record(&mut reader, &mut decoder)
            .await?
            .ok_or_else(|| {
                RpcError::new(ErrorCode::Transport, "connection closed before a request")
            })?;

        let body = record.body();
        let mut cursor = std::io::Cursor::new(&body[..]);
        let payload = match HandshakeRequest::decode(&mut cursor) {
            Err(e) => {
                self.inner.report(&e);
                let refusal = HandshakeResponse {
                    match_: HandshakeMatch::None,
                    server_protocol: None,
                    server_hash: None,
                    meta: None,
                };
                vec![
                    bytes::Bytes::from(refusal.encode()?),
                    bytes::Bytes::from(system_error_body(&self.inner.format(&e))),
                ]
            }
            Ok(request) => {
                let (response, adapter, err) = self.inner.responder.respond(&request);
                let hres = bytes::Bytes::from(response.encode()?);
                let rest = &body[cursor.position() as usize..];
                match (adapter, err) {
                    (_, Some(e)) => {
                        self.inner.report(&e);
                        vec![
                            hres,
                            bytes::Bytes::from(system_error_body(&self.inner.format(&e))),
                        ]
                    }
                    (None, None) => vec![hres],
                    (Some(_), None) if rest.is_empty() => vec![hres],
                    (Some(adapter), None) => match adapter.decode_request(rest) {
                        Err(e) => {
                            self.inner.report(&e);
                            vec![
                                hres,
                                bytes::Bytes::from(system_error_body(&self.inner.format(&e))),
                            ]
                        }
                        Ok(wreq) if wreq.message.is_ping() => vec![hres],
                        Ok(wreq) => {
                            let ctx = CallContext::new(
                                wreq.message.clone(),
                                ChannelInfo {
                                    scope: options.scope.clone(),
                                    prefix: 0,
                                    stateless: true,
                                    server: true,
                                },
                            );
                            match self.inner.clone().handle_call(ctx, wreq).await {
                                Some(out) => vec![hres, bytes::Bytes::from(out)],
                                None => vec![hres],
                            }
                        }
                    },
                }
            }
        };

        write_record(
            &mut writer,
            Dialect::Standard,
            &Record::new(record.id, payload),
        )
        .await?;
        if options.end_writable {
            let _ = writer.shutdown().await;
        }
        Ok(())
    }

    pub fn active_channels(&self) -> Vec<StatefulServerChannel> {
        self.inner
            .channels
            .lock()
            .iter()
            .map(|(_, c)| c.clone())
            .collect()
    }

    /// Observe every server-side error, application errors included.
    pub fn errors(&self) -> broadcast::Receiver<RpcError> {
        self.inner.errors.subscribe()
    }

    /// Client protocols learned from handshakes, keyed by fingerprint hex.
    pub fn remote_protocols(&self) -> HashMap<String, String> {
        self.inner.responder.remote_protocols()
    }

    fn register(&self, channel: StatefulServerChannel) {
        let id = self.inner.next_channel_id.fetch_add(1, Ordering::AcqRel);
        self.inner.channels.lock().push((id, channel.clone()));

        let weak = Arc::downgrade(&self.inner);
        channel.set_drain_hook(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.channels.lock().retain(|(cid, _)| *cid != id);
            }
        }));
    }
}

impl ServerInner {
    fn hooks(self: &Arc<Self>) -> ServerHooks {
        let weak = Arc::downgrade(self);
        let dispatcher = {
            let weak = weak.clone();
            Arc::new(
                move |ctx: CallContext, wreq: WrappedRequest| -> BoxFuture<'static, Option<Vec<u8>>> {
                    let weak = weak.clone();
                    Box::pin(async move {
                        match weak.upgrade() {
                            Some(inner) => inner.handle_call(ctx, wreq).await,
                            None if wreq.message.one_way() => None,
                            None => Some(system_error_body("INTERNAL_SERVER_ERROR")),
                        }
                    })
                },
            )
        };
        let on_error = {
            let weak = weak.clone();
            Arc::new(move |e: &RpcError| {
                if let Some(inner) = weak.upgrade() {
                    inner.report(e);
                }
            })
        };
        let format_error = Arc::new(move |e: &RpcError| match weak.upgrade() {
            Some(inner) => inner.format(e),
            None => e.rpc_code().to_string(),
        });
        ServerHooks {
            dispatcher,
            on_error,
            format_error,
        }
    }

    /// Full dispatch pipeline for one decoded request: middleware forward,
    /// handler, middleware backward, response encoding. Returns the encoded
    /// response body, or `None` for one-way messages.
    async fn handle_call(
        self: Arc<Self>,
        ctx: CallContext,
        mut wreq: WrappedRequest,
    ) -> Option<Vec<u8>> {
        let message = wreq.message.clone();
        let one_way = message.one_way();
        let mut wres = WrappedResponse::default();

        let middlewares = self.middlewares.read().clone();
        let (ran, mut err) = run_forward(&middlewares, &ctx, &mut wreq, &mut wres).await;

        if err.is_none() && !wres.is_settled() {
            let handler = {
                let handlers = self.handlers.read();
                handlers
                    .get(message.name())
                    .cloned()
                    .or_else(|| self.default_handler.read().clone())
            };
            match handler {
                None => {
                    err = Some(RpcError::new(
                        ErrorCode::NotImplemented,
                        format!("no handler for {:?}", message.name()),
                    ));
                }
                Some(handler) => match handler(ctx.clone(), wreq.request.clone()).await {
                    Ok(value) => {
                        if !one_way {
                            wres.response = Some(value);
                        }
                    }
                    Err(e) if e.code() == ErrorCode::ApplicationError => {
                        // Application errors land on the response envelope so
                        // backward middleware observes them in place. Strict
                        // servers refuse untyped ones instead of smuggling
                        // their message onto the string branch.
                        match e.value().cloned() {
                            Some(value) => {
                                wres.error = Some(value);
                                self.report(&e);
                            }
                            None if self.options.strict_errors => err = Some(e),
                            None => {
                                wres.error = Some(Value::String(e.message().to_string()));
                                self.report(&e);
                            }
                        }
                    }
                    Err(e) => err = Some(e),
                },
            }
        }

        run_backward(&middlewares, ran, &ctx, &wreq, &mut wres, &mut err).await;

        if let Some(e) = &err {
            self.report(e);
        }
        if one_way {
            return None;
        }

        match err {
            None => match wres.encode(&message) {
                Ok(body) => Some(body),
                Err(e) => {
                    self.report(&e);
                    Some(system_error_body(&self.format(&e)))
                }
            },
            Some(e) => Some(system_error_body(&self.format(&e))),
        }
    }

    fn report(&self, e: &RpcError) {
        if !self.options.silent {
            error!(code = e.rpc_code(), error = %e, "server error");
        }
        let _ = self.errors.send(e.clone());
    }

    fn format(&self, e: &RpcError) -> String {
        match &self.options.system_error_formatter {
            Some(formatter) => formatter(e),
            None => e.rpc_code().to_string(),
        }
    }
}
