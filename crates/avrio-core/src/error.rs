//! RPC error taxonomy.
//!
//! Every error produced by the engine carries an [`ErrorCode`] tag. Per-call
//! errors flow through the backward middleware phase and end at the caller;
//! channel-level errors destroy the channel that raised them.

use std::fmt;
use std::sync::Arc;

use apache_avro::types::Value;

/// Stable error code tag carried by every [`RpcError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Malformed handshake request decoded on the server.
    InvalidHandshakeRequest,
    /// Malformed handshake response decoded on the client.
    InvalidHandshakeResponse,
    /// The two protocols could not be adapted to each other.
    IncompatibleProtocol,
    /// Handshake miss with no protocol payload attached (transient).
    UnknownProtocol,
    /// A protocol JSON document failed to parse.
    InvalidProtocol,
    /// Request bytes failed to decode on the server.
    InvalidRequest,
    /// Response bytes failed to decode on the client.
    InvalidResponse,
    /// No handler and no default handler registered for a message.
    NotImplemented,
    /// A handler reported a non-null error.
    ApplicationError,
    /// Catch-all for server-side failures (response serialization, ...).
    InternalServerError,
    /// A registered call timer fired before the response arrived.
    Timeout,
    /// The channel was destroyed with calls still in flight.
    Interrupted,
    /// The client had no active channel and buffering was disabled.
    NoActiveChannels,
    /// A send was attempted on a draining or destroyed channel.
    ChannelDestroyed,
    /// The underlying byte transport failed or ended.
    Transport,
    /// The framed byte stream was corrupt.
    Framing,
}

impl ErrorCode {
    /// The wire-facing code string.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InvalidHandshakeRequest => "INVALID_HANDSHAKE_REQUEST",
            ErrorCode::InvalidHandshakeResponse => "INVALID_HANDSHAKE_RESPONSE",
            ErrorCode::IncompatibleProtocol => "INCOMPATIBLE_PROTOCOL",
            ErrorCode::UnknownProtocol => "UNKNOWN_PROTOCOL",
            ErrorCode::InvalidProtocol => "INVALID_PROTOCOL",
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::InvalidResponse => "INVALID_RESPONSE",
            ErrorCode::NotImplemented => "NOT_IMPLEMENTED",
            ErrorCode::ApplicationError => "APPLICATION_ERROR",
            ErrorCode::InternalServerError => "INTERNAL_SERVER_ERROR",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::Interrupted => "INTERRUPTED",
            ErrorCode::NoActiveChannels => "NO_ACTIVE_CHANNELS",
            ErrorCode::ChannelDestroyed => "CHANNEL_DESTROYED",
            ErrorCode::Transport => "TRANSPORT_FAILURE",
            ErrorCode::Framing => "FRAMING_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An RPC error: a code tag, a human message, an optional application error
/// payload (the value a handler placed on the error union) and an optional
/// cause.
#[derive(Clone)]
pub struct RpcError {
    code: ErrorCode,
    message: String,
    value: Option<Value>,
    source: Option<Arc<dyn std::error::Error + Send + Sync + 'static>>,
}

impl RpcError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            value: None,
            source: None,
        }
    }

    /// Attach an underlying cause.
    pub fn with_source(
        code: ErrorCode,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            value: None,
            source: Some(Arc::new(source)),
        }
    }

    /// An application error, optionally carrying the wire-typed error value.
    pub fn application(value: Option<Value>, message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::ApplicationError,
            message: message.into(),
            value,
            source: None,
        }
    }

    pub fn timeout() -> Self {
        Self::new(ErrorCode::Timeout, "timeout")
    }

    pub fn interrupted() -> Self {
        Self::new(ErrorCode::Interrupted, "interrupted")
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// The stable code string, e.g. `"INVALID_REQUEST"`.
    pub fn rpc_code(&self) -> &'static str {
        self.code.as_str()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// The typed error value, if this is an application error that carried
    /// one.
    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    pub fn into_value(self) -> Option<Value> {
        self.value
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

impl fmt::Debug for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("RpcError");
        s.field("code", &self.code).field("message", &self.message);
        if let Some(value) = &self.value {
            s.field("value", value);
        }
        if let Some(source) = &self.source {
            s.field("source", source);
        }
        s.finish()
    }
}

impl std::error::Error for RpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|s| s.as_ref() as &(dyn std::error::Error + 'static))
    }
}
