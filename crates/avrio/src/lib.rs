//! Avro RPC runtime.
//!
//! `avrio` re-exports the protocol engine from `avrio-core` and adds the
//! serving conveniences most binaries want: a TCP accept loop that opens one
//! stateful server channel per connection.
//!
//! ```ignore
//! use avrio::prelude::*;
//!
//! let service = Service::from_json(PROTOCOL_JSON)?;
//! let server = Server::new(service.clone(), ServerOptions::default());
//! server.on_message("echo", |_ctx, request| async move { Ok(request) })?;
//! avrio::server::run_tcp_server("127.0.0.1:9090", server).await?;
//! ```

pub use avrio_core::{
    discover_protocol, factory, scope_prefix, Adapter, ByteReader, ByteWriter, CallContext,
    CallOptions, ChannelEvent, ChannelInfo, ChannelOptions, ChannelPolicy, Client, ClientChannel,
    ClientOptions, Connection, Dialect, Duplex, ErrorCode, ErrorFormatter, Factory, Handler,
    HandshakeEngine, HandshakeMatch, HandshakeRequest, HandshakeResponder, HandshakeResponse,
    Headers, Message, Middleware, Record, RecordDecoder, Registry, Resolver, RpcError, Schema,
    Server, ServerOptions, Service, Value, WrappedRequest, WrappedResponse,
};

/// Convenient imports for most users.
pub mod prelude {
    pub use avrio_core::{
        CallContext, CallOptions, ChannelOptions, Client, ClientOptions, Connection, Duplex,
        ErrorCode, Middleware, RpcError, Server, ServerOptions, Service, Value,
    };
}

/// Server helpers for running services over TCP.
#[cfg(not(target_arch = "wasm32"))]
pub mod server {
    use avrio_core::{ChannelOptions, Duplex, RpcError, Server};
    use tokio::net::{TcpListener, TcpStream};
    use tracing::{debug, info};

    /// Open a stateful server channel over a single TCP connection.
    pub fn serve_connection(server: &Server, stream: TcpStream) {
        server.create_channel(Duplex::new(stream), ChannelOptions::default());
    }

    /// Accept TCP connections forever, serving each over its own channel.
    pub async fn run_tcp_server(addr: &str, server: Server) -> Result<(), RpcError> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            RpcError::with_source(avrio_core::ErrorCode::Transport, "failed to bind", e)
        })?;
        info!(addr, "listening");

        loop {
            let (socket, peer) = listener.accept().await.map_err(|e| {
                RpcError::with_source(avrio_core::ErrorCode::Transport, "accept failed", e)
            })?;
            debug!(%peer, "accepted connection");
            serve_connection(&server, socket);
        }
    }
}
