//! Schema adaptation between two services.
//!
//! An [`Adapter`] binds a client-side service to a server-side service under
//! one peer fingerprint. For every message the two sides share it
//! precompiles three resolvers: the server reads what the client wrote
//! (request), and the client reads what the server wrote (response and
//! error). Adapters are built lazily on the first successful handshake
//! against an unseen fingerprint and cached forever on the owning client or
//! server.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;

use apache_avro::types::Value;

use crate::envelope::{decode_error_flag, WrappedRequest, WrappedResponse};
use crate::error::{ErrorCode, RpcError};
use crate::service::{ping_message, Message, Service};
use crate::types::{decode_headers, string_schema, Resolver};

#[derive(Debug)]
pub struct Adapter {
    client: Arc<Service>,
    server: Arc<Service>,
    fingerprint: [u8; 16],
    is_remote: bool,
    entries: HashMap<String, MessageAdapter>,
}

#[derive(Debug)]
struct MessageAdapter {
    server_message: Arc<Message>,
    request: Resolver,
    response: Resolver,
    errors: Resolver,
}

impl Adapter {
    /// Compile the resolvers adapting `client` to `server`.
    ///
    /// Fails with `INCOMPATIBLE_PROTOCOL` when a client message is missing
    /// on the server side or disagrees on one-way-ness.
    pub fn new(
        client: Arc<Service>,
        server: Arc<Service>,
        fingerprint: [u8; 16],
        is_remote: bool,
    ) -> Result<Self, RpcError> {
        let mut entries = HashMap::new();
        for message in client.messages() {
            let server_message = server.message(message.name()).ok_or_else(|| {
                RpcError::new(
                    ErrorCode::IncompatibleProtocol,
                    format!("message {:?} is not declared by the server", message.name()),
                )
            })?;
            if server_message.one_way() != message.one_way() {
                return Err(RpcError::new(
                    ErrorCode::IncompatibleProtocol,
                    format!("message {:?} disagrees on one-way", message.name()),
                ));
            }
            entries.insert(
                message.name().to_string(),
                MessageAdapter {
                    server_message: server_message.clone(),
                    request: Resolver::new(
                        message.request().clone(),
                        server_message.request().clone(),
                    ),
                    response: Resolver::new(
                        server_message.response().clone(),
                        message.response().clone(),
                    ),
                    errors: Resolver::new(
                        server_message.errors().clone(),
                        message.errors().clone(),
                    ),
                },
            );
        }
        Ok(Self {
            client,
            server,
            fingerprint,
            is_remote,
            entries,
        })
    }

    /// A trivial adapter from a service onto itself.
    pub fn identity(service: Arc<Service>) -> Self {
        let fingerprint = service.fingerprint();
        Self::new(service.clone(), service, fingerprint, false)
            .expect("a service is compatible with itself")
    }

    /// The peer fingerprint this adapter is cached under.
    pub fn fingerprint(&self) -> [u8; 16] {
        self.fingerprint
    }

    /// Whether the adapted side was learned from the wire.
    pub fn is_remote(&self) -> bool {
        self.is_remote
    }

    pub fn client_service(&self) -> &Arc<Service> {
        &self.client
    }

    pub fn server_service(&self) -> &Arc<Service> {
        &self.server
    }

    /// Decode a request body (`headers ‖ name ‖ request`) into a wrapped
    /// request shaped by the server-side schemas.
    ///
    /// An empty message name denotes the built-in ping, whose body must be
    /// empty.
    pub fn decode_request(&self, body: &[u8]) -> Result<WrappedRequest, RpcError> {
        let mut cursor = Cursor::new(body);
        let headers = decode_headers(&mut cursor).map_err(|e| {
            RpcError::with_source(ErrorCode::InvalidRequest, "failed to decode request headers", e)
        })?;
        let name = match crate::types::decode_datum(string_schema(), &mut cursor) {
            Ok(Value::String(name)) => name,
            Ok(_) => {
                return Err(RpcError::new(
                    ErrorCode::InvalidRequest,
                    "message name is not a string",
                ))
            }
            Err(e) => {
                return Err(RpcError::with_source(
                    ErrorCode::InvalidRequest,
                    "failed to decode message name",
                    e,
                ))
            }
        };

        if name.is_empty() {
            if cursor.position() as usize != body.len() {
                return Err(RpcError::new(
                    ErrorCode::InvalidRequest,
                    "ping request carries a non-empty body",
                ));
            }
            let mut wreq = WrappedRequest::new(ping_message().clone(), Value::Record(vec![]));
            wreq.headers = headers;
            return Ok(wreq);
        }

        let entry = self.entries.get(&name).ok_or_else(|| {
            RpcError::new(ErrorCode::InvalidRequest, format!("unknown message {:?}", name))
        })?;
        let request = entry.request.read(&mut cursor).map_err(|e| {
            RpcError::with_source(
                ErrorCode::InvalidRequest,
                format!("failed to decode request for {:?}", name),
                e,
            )
        })?;
        if cursor.position() as usize != body.len() {
            return Err(RpcError::new(
                ErrorCode::InvalidRequest,
                format!("trailing bytes after request for {:?}", name),
            ));
        }

        let mut wreq = WrappedRequest::new(entry.server_message.clone(), request);
        wreq.headers = headers;
        Ok(wreq)
    }

    /// Decode a response body (`headers ‖ hasError ‖ payload`) into `wres`,
    /// shaped by the client-side schemas of `message`.
    pub fn decode_response(
        &self,
        body: &[u8],
        wres: &mut WrappedResponse,
        message: &Message,
    ) -> Result<(), RpcError> {
        let mut cursor = Cursor::new(body);
        wres.headers = decode_headers(&mut cursor).map_err(|e| {
            RpcError::with_source(
                ErrorCode::InvalidResponse,
                "failed to decode response headers",
                e,
            )
        })?;
        let has_error = decode_error_flag(&mut cursor)?;

        let entry = self.entries.get(message.name());
        let value = if has_error {
            match entry {
                Some(entry) => entry.errors.read(&mut cursor),
                None => crate::types::decode_datum(message.errors(), &mut cursor),
            }
        } else {
            match entry {
                Some(entry) => entry.response.read(&mut cursor),
                None => crate::types::decode_datum(message.response(), &mut cursor),
            }
        }
        .map_err(|e| {
            RpcError::with_source(
                ErrorCode::InvalidResponse,
                format!("failed to decode response for {:?}", message.name()),
                e,
            )
        })?;

        if cursor.position() as usize != body.len() {
            return Err(RpcError::new(
                ErrorCode::InvalidResponse,
                format!("trailing bytes after response for {:?}", message.name()),
            ));
        }

        if has_error {
            wres.error = Some(value);
        } else {
            wres.response = Some(value);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::system_error_body;

    const ECHO_V1: &str = r#"{
        "protocol": "Echo",
        "messages": {
            "echo": {
                "request": [{"name": "s", "type": "string"}],
                "response": "int"
            }
        }
    }"#;

    // Same message, wider response type: old responses still resolve.
    const ECHO_V2: &str = r#"{
        "protocol": "Echo",
        "messages": {
            "echo": {
                "request": [{"name": "s", "type": "string"}],
                "response": "long"
            }
        }
    }"#;

    fn adapter(client: &str, server: &str) -> Result<Adapter, RpcError> {
        let client = Service::from_json(client).unwrap();
        let server = Service::from_json(server).unwrap();
        let fingerprint = server.fingerprint();
        Adapter::new(client, server, fingerprint, true)
    }

    #[test]
    fn identity_adapter_roundtrips_a_request() {
        let svc = Service::from_json(ECHO_V1).unwrap();
        let adapter = Adapter::identity(svc.clone());

        let message = svc.message("echo").unwrap().clone();
        let wreq = WrappedRequest::new(
            message,
            Value::Record(vec![("s".into(), Value::String("hi".into()))]),
        );
        let body = wreq.encode().unwrap();

        let decoded = adapter.decode_request(&body).unwrap();
        assert_eq!(decoded.message.name(), "echo");
        assert_eq!(
            decoded.request,
            Value::Record(vec![("s".into(), Value::String("hi".into()))])
        );
    }

    #[test]
    fn response_resolver_widens_int_to_long() {
        // Client V2 reads a V1 server that still writes ints.
        let client = Service::from_json(ECHO_V2).unwrap();
        let server = Service::from_json(ECHO_V1).unwrap();
        let adapter =
            Adapter::new(client.clone(), server.clone(), server.fingerprint(), true).unwrap();

        let server_msg = server.message("echo").unwrap();
        let wres_out = WrappedResponse {
            headers: Default::default(),
            error: None,
            response: Some(Value::Int(7)),
        };
        let body = wres_out.encode(server_msg).unwrap();

        let client_msg = client.message("echo").unwrap().clone();
        let mut wres_in = WrappedResponse::default();
        adapter.decode_response(&body, &mut wres_in, &client_msg).unwrap();
        assert_eq!(wres_in.response, Some(Value::Long(7)));
    }

    #[test]
    fn missing_server_message_is_incompatible() {
        let lonely = r#"{
            "protocol": "Other",
            "messages": {"other": {"request": [], "response": "null"}}
        }"#;
        let err = adapter(ECHO_V1, lonely).unwrap_err();
        assert_eq!(err.code(), ErrorCode::IncompatibleProtocol);
    }

    #[test]
    fn one_way_mismatch_is_incompatible() {
        let fire_and_forget = r#"{
            "protocol": "Echo",
            "messages": {
                "echo": {"request": [{"name": "s", "type": "string"}], "one-way": true}
            }
        }"#;
        let err = adapter(ECHO_V1, fire_and_forget).unwrap_err();
        assert_eq!(err.code(), ErrorCode::IncompatibleProtocol);
    }

    #[test]
    fn ping_request_decodes_to_the_reserved_message() {
        let svc = Service::from_json(ECHO_V1).unwrap();
        let adapter = Adapter::identity(svc);

        let ping = WrappedRequest::new(ping_message().clone(), Value::Record(vec![]));
        let body = ping.encode().unwrap();
        let decoded = adapter.decode_request(&body).unwrap();
        assert!(decoded.message.is_ping());
    }

    #[test]
    fn trailing_request_bytes_are_rejected() {
        let svc = Service::from_json(ECHO_V1).unwrap();
        let adapter = Adapter::identity(svc.clone());

        let message = svc.message("echo").unwrap().clone();
        let wreq = WrappedRequest::new(
            message,
            Value::Record(vec![("s".into(), Value::String("hi".into()))]),
        );
        let mut body = wreq.encode().unwrap();
        body.push(0x55);

        let err = adapter.decode_request(&body).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidRequest);
    }

    #[test]
    fn system_error_decodes_on_the_string_branch() {
        let svc = Service::from_json(ECHO_V1).unwrap();
        let adapter = Adapter::identity(svc.clone());
        let message = svc.message("echo").unwrap().clone();

        let body = system_error_body("went sideways");
        let mut wres = WrappedResponse::default();
        adapter.decode_response(&body, &mut wres, &message).unwrap();
        assert_eq!(
            wres.error,
            Some(Value::Union(0, Box::new(Value::String("went sideways".into()))))
        );
    }
}
