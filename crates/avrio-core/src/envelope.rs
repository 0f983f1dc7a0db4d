//! In-flight call envelopes and the per-call context.
//!
//! Middleware on both ends observes and mutates a [`WrappedRequest`] and a
//! [`WrappedResponse`]; the [`CallContext`] travels alongside them so user
//! code can thread per-call state without globals.

use std::any::Any;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;

use apache_avro::types::Value;
use parking_lot::Mutex;

use crate::error::{ErrorCode, RpcError};
use crate::service::Message;
use crate::types::{
    boolean_schema, encode_datum, encode_headers, string_schema, system_error_schema, Headers,
};

/// A request in flight: the message it belongs to, transport headers and the
/// packed request value.
#[derive(Clone, Debug)]
pub struct WrappedRequest {
    pub message: Arc<Message>,
    pub headers: Headers,
    pub request: Value,
}

impl WrappedRequest {
    pub fn new(message: Arc<Message>, request: Value) -> Self {
        Self {
            message,
            headers: Headers::new(),
            request,
        }
    }

    /// Wire layout: `headers ‖ name ‖ request`.
    pub fn encode(&self) -> Result<Vec<u8>, RpcError> {
        let mut out = encode_headers(&self.headers).map_err(internal)?;
        out.extend(
            encode_datum(string_schema(), Value::String(self.message.name().to_string()))
                .map_err(internal)?,
        );
        out.extend(encode_datum(self.message.request(), self.request.clone()).map_err(internal)?);
        Ok(out)
    }
}

/// A response in flight. At most one of `error` / `response` is set; both
/// empty means the call has not settled yet (or was one-way).
#[derive(Clone, Debug, Default)]
pub struct WrappedResponse {
    pub headers: Headers,
    pub error: Option<Value>,
    pub response: Option<Value>,
}

impl WrappedResponse {
    /// Whether a middleware or the transition has already produced an
    /// outcome.
    pub fn is_settled(&self) -> bool {
        self.error.is_some() || self.response.is_some()
    }

    /// Wire layout: `headers ‖ hasError ‖ (error | response)`.
    pub fn encode(&self, message: &Message) -> Result<Vec<u8>, RpcError> {
        let mut out = encode_headers(&self.headers).map_err(internal)?;
        match (&self.error, &self.response) {
            (Some(error), _) => {
                out.extend(encode_datum(boolean_schema(), Value::Boolean(true)).map_err(internal)?);
                let error = normalize_error_value(error.clone());
                out.extend(encode_datum(message.errors(), error).map_err(internal)?);
            }
            (None, response) => {
                out.extend(
                    encode_datum(boolean_schema(), Value::Boolean(false)).map_err(internal)?,
                );
                let response = response.clone().unwrap_or(Value::Null);
                out.extend(encode_datum(message.response(), response).map_err(internal)?);
            }
        }
        Ok(out)
    }
}

/// Wrap a bare value into the error union if the caller did not already.
/// Strings go to the first (system error) branch.
fn normalize_error_value(value: Value) -> Value {
    match value {
        Value::Union(..) => value,
        Value::String(s) => Value::Union(0, Box::new(Value::String(s))),
        other => Value::Union(1, Box::new(other)),
    }
}

/// The synthetic body completing a one-way call locally: empty headers and a
/// cleared error flag, with no payload behind them.
pub fn empty_response_body() -> Vec<u8> {
    let mut out = encode_headers(&Headers::new()).expect("empty header map encodes");
    out.extend(
        encode_datum(boolean_schema(), Value::Boolean(false)).expect("boolean false encodes"),
    );
    out
}

/// Encode a system error response: empty headers, error flag set, and the
/// string branch of the error union carrying `text`.
pub fn system_error_body(text: &str) -> Vec<u8> {
    let mut out = encode_headers(&Headers::new()).expect("empty header map encodes");
    out.extend(encode_datum(boolean_schema(), Value::Boolean(true)).expect("boolean true encodes"));
    out.extend(
        encode_datum(
            system_error_schema(),
            Value::Union(0, Box::new(Value::String(text.to_string()))),
        )
        .expect("system error string encodes"),
    );
    out
}

/// Try to read a response body as a system error, returning its text.
///
/// Used on bodies that arrive before an adapter exists (handshake
/// failures), where only the string branch can be decoded.
pub fn decode_system_error(body: &[u8]) -> Option<String> {
    let mut cursor = Cursor::new(body);
    crate::types::decode_headers(&mut cursor).ok()?;
    if !decode_error_flag(&mut cursor).ok()? {
        return None;
    }
    match crate::types::decode_datum(system_error_schema(), &mut cursor) {
        Ok(Value::Union(0, inner)) => match *inner {
            Value::String(s) => Some(s),
            _ => None,
        },
        _ => None,
    }
}

/// Decode the leading boolean error flag of a response body.
pub fn decode_error_flag(cursor: &mut Cursor<&[u8]>) -> Result<bool, RpcError> {
    match crate::types::decode_datum(boolean_schema(), cursor) {
        Ok(Value::Boolean(flag)) => Ok(flag),
        Ok(_) => Err(RpcError::new(
            ErrorCode::InvalidResponse,
            "response error flag is not a boolean",
        )),
        Err(e) => Err(RpcError::with_source(
            ErrorCode::InvalidResponse,
            "failed to decode response error flag",
            e,
        )),
    }
}

fn internal(e: apache_avro::Error) -> RpcError {
    RpcError::with_source(ErrorCode::InternalServerError, "serialization failed", e)
}

/// Which side and flavor of channel a call is travelling on.
#[derive(Clone, Debug)]
pub struct ChannelInfo {
    pub scope: Option<String>,
    pub prefix: u32,
    pub stateless: bool,
    pub server: bool,
}

/// Per-call state handed to middleware and handlers.
///
/// Cloning is cheap; all clones observe the same `locals`.
#[derive(Clone)]
pub struct CallContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    message: Arc<Message>,
    channel: ChannelInfo,
    locals: Mutex<HashMap<String, Box<dyn Any + Send + Sync>>>,
}

impl CallContext {
    pub fn new(message: Arc<Message>, channel: ChannelInfo) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                message,
                channel,
                locals: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn message(&self) -> Arc<Message> {
        self.inner.message.clone()
    }

    pub fn channel(&self) -> ChannelInfo {
        self.inner.channel.clone()
    }

    /// Store a typed per-call value.
    pub fn set_local<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.inner.locals.lock().insert(key.into(), Box::new(value));
    }

    /// Fetch a clone of a typed per-call value.
    pub fn local<T: Any + Send + Sync + Clone>(&self, key: &str) -> Option<T> {
        self.inner
            .locals
            .lock()
            .get(key)
            .and_then(|v| v.downcast_ref::<T>())
            .cloned()
    }

    /// Remove a per-call value, returning whether it was present.
    pub fn remove_local(&self, key: &str) -> bool {
        self.inner.locals.lock().remove(key).is_some()
    }
}

impl std::fmt::Debug for CallContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallContext")
            .field("message", &self.inner.message.name())
            .field("channel", &self.inner.channel)
            .finish_non_exhaustive()
    }
}
