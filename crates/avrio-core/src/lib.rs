//! Core protocol engine for Avro RPC.
//!
//! The crate implements the runtime around a protocol: handshake negotiation
//! with per-fingerprint adapter caching, framed record codecs in two wire
//! dialects, multiplexing channels (stateless/stateful, client/server) and a
//! two-phase middleware pipeline shared by both ends.
//!
//! The Avro type system itself (schema parsing, datum codecs, writer→reader
//! resolution) is consumed from `apache-avro` through the narrow interface in
//! [`types`]; transports are plain byte pairs supplied by the caller.

mod adapter;
mod channel;
mod client;
mod envelope;
mod error;
mod frame;
mod handshake;
mod middleware;
mod registry;
mod server;
mod service;
mod transport;
mod types;

pub use adapter::Adapter;
pub use channel::{
    scope_prefix, ChannelEvent, ChannelOptions, Connection, StatefulClientChannel,
    StatefulServerChannel, StatelessClientChannel,
};
pub use client::{
    discover_protocol, CallOptions, ChannelPolicy, Client, ClientChannel, ClientOptions,
};
pub use envelope::{CallContext, ChannelInfo, WrappedRequest, WrappedResponse};
pub use error::{ErrorCode, RpcError};
pub use frame::{encode_record, Dialect, Record, RecordDecoder};
pub use handshake::{
    HandshakeEngine, HandshakeMatch, HandshakeRequest, HandshakeResponder, HandshakeResponse,
};
pub use middleware::Middleware;
pub use registry::{Registry, ID_MASK, PREFIX_LENGTH};
pub use server::{ErrorFormatter, Handler, Server, ServerOptions};
pub use service::{fingerprint_hex, ping_message, Message, Service};
pub use transport::{factory, ByteReader, ByteWriter, Duplex, Factory};
pub use types::{Headers, Resolver};

// Re-exported so callers can build and inspect request/response values
// without naming the type-system crate themselves.
pub use apache_avro::schema::Schema;
pub use apache_avro::types::Value;
