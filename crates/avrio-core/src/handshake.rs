//! Handshake wire records.
//!
//! The handshake negotiates schema compatibility on a channel. Its two
//! records have fixed, well-known Avro schemas; a handshake request prefixes
//! the body of every stateless message and the first record of every
//! stateful channel, and the response prefixes the corresponding replies.

use std::collections::HashMap;
use std::io::Read;
use std::sync::{Arc, OnceLock};

use apache_avro::schema::Schema;
use apache_avro::types::Value;
use apache_avro::{from_avro_datum, to_avro_datum};
use parking_lot::Mutex;

use crate::adapter::Adapter;
use crate::error::{ErrorCode, RpcError};
use crate::service::Service;
use crate::types::Headers;

const REQUEST_SCHEMA: &str = r#"{
    "type": "record",
    "name": "HandshakeRequest",
    "namespace": "org.apache.avro.ipc",
    "fields": [
        {"name": "clientHash", "type": {"type": "fixed", "name": "MD5", "size": 16}},
        {"name": "clientProtocol", "type": ["null", "string"]},
        {"name": "serverHash", "type": "MD5"},
        {"name": "meta", "type": ["null", {"type": "map", "values": "bytes"}]}
    ]
}"#;

const RESPONSE_SCHEMA: &str = r#"{
    "type": "record",
    "name": "HandshakeResponse",
    "namespace": "org.apache.avro.ipc",
    "fields": [
        {"name": "match",
         "type": {"type": "enum", "name": "HandshakeMatch", "symbols": ["BOTH", "CLIENT", "NONE"]}},
        {"name": "serverProtocol", "type": ["null", "string"]},
        {"name": "serverHash",
         "type": ["null", {"type": "fixed", "name": "MD5", "size": 16}]},
        {"name": "meta", "type": ["null", {"type": "map", "values": "bytes"}]}
    ]
}"#;

fn request_schema() -> &'static Schema {
    static SCHEMA: OnceLock<Schema> = OnceLock::new();
    SCHEMA.get_or_init(|| {
        Schema::parse_str(REQUEST_SCHEMA).expect("handshake request schema is well-formed")
    })
}

fn response_schema() -> &'static Schema {
    static SCHEMA: OnceLock<Schema> = OnceLock::new();
    SCHEMA.get_or_init(|| {
        Schema::parse_str(RESPONSE_SCHEMA).expect("handshake response schema is well-formed")
    })
}

/// Outcome of a handshake: which protocols had to travel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeMatch {
    /// Server knew both fingerprints; nothing else to exchange.
    Both,
    /// Server resolved the client's protocol and sent back its own.
    Client,
    /// Server does not know the client's protocol; resend with it attached.
    None,
}

impl HandshakeMatch {
    pub fn as_str(self) -> &'static str {
        match self {
            HandshakeMatch::Both => "BOTH",
            HandshakeMatch::Client => "CLIENT",
            HandshakeMatch::None => "NONE",
        }
    }

    fn position(self) -> u32 {
        match self {
            HandshakeMatch::Both => 0,
            HandshakeMatch::Client => 1,
            HandshakeMatch::None => 2,
        }
    }

    fn from_symbol(symbol: &str) -> Option<Self> {
        match symbol {
            "BOTH" => Some(HandshakeMatch::Both),
            "CLIENT" => Some(HandshakeMatch::Client),
            "NONE" => Some(HandshakeMatch::None),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct HandshakeRequest {
    pub client_hash: [u8; 16],
    pub client_protocol: Option<String>,
    pub server_hash: [u8; 16],
    pub meta: Option<Headers>,
}

impl HandshakeRequest {
    /// Build the request a client sends for `service`.
    ///
    /// `server_hash` is the best known server fingerprint (the client's own
    /// on a first contact). The protocol JSON is attached only on retry
    /// after a `NONE` response.
    pub fn new(service: &Service, server_hash: [u8; 16], include_protocol: bool) -> Self {
        Self {
            client_hash: service.fingerprint(),
            client_protocol: include_protocol.then(|| service.protocol_json()),
            server_hash,
            meta: None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, RpcError> {
        let record = Value::Record(vec![
            (
                "clientHash".into(),
                Value::Fixed(16, self.client_hash.to_vec()),
            ),
            ("clientProtocol".into(), optional_string(&self.client_protocol)),
            (
                "serverHash".into(),
                Value::Fixed(16, self.server_hash.to_vec()),
            ),
            ("meta".into(), optional_meta(&self.meta)),
        ]);
        to_avro_datum(request_schema(), record).map_err(|e| {
            RpcError::with_source(
                ErrorCode::InternalServerError,
                "failed to encode handshake request",
                e,
            )
        })
    }

    pub fn decode<R: Read>(reader: &mut R) -> Result<Self, RpcError> {
        let invalid = |message: &str| RpcError::new(ErrorCode::InvalidHandshakeRequest, message);

        let value = from_avro_datum(request_schema(), reader, None).map_err(|e| {
            RpcError::with_source(
                ErrorCode::InvalidHandshakeRequest,
                "failed to decode handshake request",
                e,
            )
        })?;
        let Value::Record(fields) = value else {
            return Err(invalid("handshake request is not a record"));
        };

        let mut request = HandshakeRequest {
            client_hash: [0; 16],
            client_protocol: None,
            server_hash: [0; 16],
            meta: None,
        };
        for (name, value) in fields {
            match name.as_str() {
                "clientHash" => request.client_hash = fixed16(value).ok_or_else(|| invalid("bad clientHash"))?,
                "serverHash" => request.server_hash = fixed16(value).ok_or_else(|| invalid("bad serverHash"))?,
                "clientProtocol" => request.client_protocol = union_string(value),
                "meta" => request.meta = union_meta(value),
                _ => {}
            }
        }
        Ok(request)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct HandshakeResponse {
    pub match_: HandshakeMatch,
    pub server_protocol: Option<String>,
    pub server_hash: Option<[u8; 16]>,
    pub meta: Option<Headers>,
}

impl HandshakeResponse {
    pub fn encode(&self) -> Result<Vec<u8>, RpcError> {
        let record = Value::Record(vec![
            (
                "match".into(),
                Value::Enum(self.match_.position(), self.match_.as_str().to_string()),
            ),
            ("serverProtocol".into(), optional_string(&self.server_protocol)),
            (
                "serverHash".into(),
                match &self.server_hash {
                    None => Value::Union(0, Box::new(Value::Null)),
                    Some(hash) => Value::Union(1, Box::new(Value::Fixed(16, hash.to_vec()))),
                },
            ),
            ("meta".into(), optional_meta(&self.meta)),
        ]);
        to_avro_datum(response_schema(), record).map_err(|e| {
            RpcError::with_source(
                ErrorCode::InternalServerError,
                "failed to encode handshake response",
                e,
            )
        })
    }

    pub fn decode<R: Read>(reader: &mut R) -> Result<Self, RpcError> {
        let invalid = |message: &str| RpcError::new(ErrorCode::InvalidHandshakeResponse, message);

        let value = from_avro_datum(response_schema(), reader, None).map_err(|e| {
            RpcError::with_source(
                ErrorCode::InvalidHandshakeResponse,
                "failed to decode handshake response",
                e,
            )
        })?;
        let Value::Record(fields) = value else {
            return Err(invalid("handshake response is not a record"));
        };

        let mut response = HandshakeResponse {
            match_: HandshakeMatch::None,
            server_protocol: None,
            server_hash: None,
            meta: None,
        };
        for (name, value) in fields {
            match name.as_str() {
                "match" => {
                    let Value::Enum(_, symbol) = value else {
                        return Err(invalid("bad match field"));
                    };
                    response.match_ = HandshakeMatch::from_symbol(&symbol)
                        .ok_or_else(|| invalid("unknown match symbol"))?;
                }
                "serverProtocol" => response.server_protocol = union_string(value),
                "serverHash" => {
                    if let Value::Union(_, inner) = value {
                        response.server_hash = fixed16(*inner);
                    }
                }
                "meta" => response.meta = union_meta(value),
                _ => {}
            }
        }
        Ok(response)
    }
}

/// Client half of the handshake state machine.
///
/// One engine is owned by each client and shared by its channels; it holds
/// the adapter cache keyed by server fingerprint and the best known server
/// hash. The cache is append-only once a fingerprint is installed, so racing
/// channels resolve to equal adapters.
pub struct HandshakeEngine {
    service: Arc<Service>,
    adapters: Mutex<HashMap<[u8; 16], Arc<Adapter>>>,
    remote_protocols: Mutex<HashMap<[u8; 16], String>>,
    server_hash: Mutex<[u8; 16]>,
}

impl HandshakeEngine {
    pub fn new(service: Arc<Service>) -> Self {
        let fingerprint = service.fingerprint();
        let identity = Arc::new(Adapter::identity(service.clone()));
        let mut adapters = HashMap::new();
        adapters.insert(fingerprint, identity);
        Self {
            service,
            adapters: Mutex::new(adapters),
            remote_protocols: Mutex::new(HashMap::new()),
            server_hash: Mutex::new(fingerprint),
        }
    }

    pub fn service(&self) -> &Arc<Service> {
        &self.service
    }

    /// The adapter of the service onto itself.
    pub fn identity(&self) -> Arc<Adapter> {
        self.adapters
            .lock()
            .get(&self.service.fingerprint())
            .cloned()
            .expect("identity adapter is seeded at construction")
    }

    /// Build the next handshake request. The protocol JSON is attached only
    /// after a `NONE` response asked for it.
    pub fn request(&self, include_protocol: bool) -> HandshakeRequest {
        HandshakeRequest::new(&self.service, *self.server_hash.lock(), include_protocol)
    }

    /// Digest a handshake response.
    ///
    /// Returns the negotiated adapter, or `None` when the server asked for a
    /// retry carrying the full protocol (`match = NONE`).
    pub fn accept(
        &self,
        response: &HandshakeResponse,
    ) -> Result<Option<Arc<Adapter>>, RpcError> {
        match response.match_ {
            HandshakeMatch::None => Ok(None),
            HandshakeMatch::Both => {
                let hash = *self.server_hash.lock();
                let adapter = self.adapters.lock().get(&hash).cloned().ok_or_else(|| {
                    RpcError::new(
                        ErrorCode::InvalidHandshakeResponse,
                        "server matched a fingerprint this client never sent",
                    )
                })?;
                Ok(Some(adapter))
            }
            HandshakeMatch::Client => {
                let protocol = response.server_protocol.as_deref().ok_or_else(|| {
                    RpcError::new(
                        ErrorCode::InvalidHandshakeResponse,
                        "CLIENT match without a server protocol",
                    )
                })?;
                let server = Service::from_json(protocol)?;
                let hash = response.server_hash.unwrap_or_else(|| server.fingerprint());

                if let Some(cached) = self.adapters.lock().get(&hash) {
                    *self.server_hash.lock() = hash;
                    return Ok(Some(cached.clone()));
                }

                let adapter = Arc::new(Adapter::new(
                    self.service.clone(),
                    server,
                    hash,
                    true,
                )?);
                self.adapters.lock().insert(hash, adapter.clone());
                self.remote_protocols
                    .lock()
                    .insert(hash, protocol.to_string());
                *self.server_hash.lock() = hash;
                Ok(Some(adapter))
            }
        }
    }

    /// Protocols learned from the wire, keyed by fingerprint hex.
    pub fn remote_protocols(&self) -> HashMap<String, String> {
        self.remote_protocols
            .lock()
            .iter()
            .map(|(hash, json)| (crate::service::fingerprint_hex(hash), json.clone()))
            .collect()
    }
}

/// Server half of the handshake: looks up (or learns) the client's protocol
/// and reports the match level back.
pub struct HandshakeResponder {
    service: Arc<Service>,
    adapters: Mutex<HashMap<[u8; 16], Arc<Adapter>>>,
    remote_protocols: Mutex<HashMap<[u8; 16], String>>,
}

impl HandshakeResponder {
    pub fn new(service: Arc<Service>) -> Self {
        let fingerprint = service.fingerprint();
        let identity = Arc::new(Adapter::identity(service.clone()));
        let mut adapters = HashMap::new();
        adapters.insert(fingerprint, identity);
        Self {
            service,
            adapters: Mutex::new(adapters),
            remote_protocols: Mutex::new(HashMap::new()),
        }
    }

    pub fn service(&self) -> &Arc<Service> {
        &self.service
    }

    pub fn identity(&self) -> Arc<Adapter> {
        self.adapters
            .lock()
            .get(&self.service.fingerprint())
            .cloned()
            .expect("identity adapter is seeded at construction")
    }

    /// Answer a handshake request.
    ///
    /// Returns the response record, the adapter to serve this peer with (if
    /// the protocols resolved) and the error to report back as a system
    /// error (if they did not).
    pub fn respond(
        &self,
        request: &HandshakeRequest,
    ) -> (HandshakeResponse, Option<Arc<Adapter>>, Option<RpcError>) {
        let own_hash = self.service.fingerprint();
        let client_server_match = request.server_hash == own_hash;

        let cached = self.adapters.lock().get(&request.client_hash).cloned();
        let adapter = match cached {
            Some(adapter) => Some(adapter),
            None => match request.client_protocol.as_deref() {
                None => None,
                Some(protocol) => {
                    match self.learn(protocol, request.client_hash) {
                        Ok(adapter) => Some(adapter),
                        Err(e) => {
                            // Unresolvable peer: report NONE plus the error.
                            let response = HandshakeResponse {
                                match_: HandshakeMatch::None,
                                server_protocol: None,
                                server_hash: None,
                                meta: None,
                            };
                            return (response, None, Some(e));
                        }
                    }
                }
            },
        };

        let response = match &adapter {
            None => HandshakeResponse {
                match_: HandshakeMatch::None,
                server_protocol: None,
                server_hash: None,
                meta: None,
            },
            Some(_) if client_server_match => HandshakeResponse {
                match_: HandshakeMatch::Both,
                server_protocol: None,
                server_hash: None,
                meta: None,
            },
            Some(_) => HandshakeResponse {
                match_: HandshakeMatch::Client,
                server_protocol: Some(self.service.protocol_json()),
                server_hash: Some(own_hash),
                meta: None,
            },
        };
        (response, adapter, None)
    }

    fn learn(&self, protocol: &str, client_hash: [u8; 16]) -> Result<Arc<Adapter>, RpcError> {
        let client = Service::from_json(protocol)?;
        let adapter = Arc::new(Adapter::new(
            client,
            self.service.clone(),
            client_hash,
            true,
        )?);
        self.adapters.lock().insert(client_hash, adapter.clone());
        self.remote_protocols
            .lock()
            .insert(client_hash, protocol.to_string());
        Ok(adapter)
    }

    /// Protocols learned from the wire, keyed by fingerprint hex.
    pub fn remote_protocols(&self) -> HashMap<String, String> {
        self.remote_protocols
            .lock()
            .iter()
            .map(|(hash, json)| (crate::service::fingerprint_hex(hash), json.clone()))
            .collect()
    }
}

fn optional_string(value: &Option<String>) -> Value {
    match value {
        None => Value::Union(0, Box::new(Value::Null)),
        Some(s) => Value::Union(1, Box::new(Value::String(s.clone()))),
    }
}

fn optional_meta(meta: &Option<Headers>) -> Value {
    match meta {
        None => Value::Union(0, Box::new(Value::Null)),
        Some(headers) => {
            let map = headers
                .iter()
                .map(|(k, v)| (k.clone(), Value::Bytes(v.clone())))
                .collect();
            Value::Union(1, Box::new(Value::Map(map)))
        }
    }
}

fn fixed16(value: Value) -> Option<[u8; 16]> {
    match value {
        Value::Fixed(16, bytes) => bytes.try_into().ok(),
        _ => None,
    }
}

fn union_string(value: Value) -> Option<String> {
    match value {
        Value::Union(_, inner) => match *inner {
            Value::String(s) => Some(s),
            _ => None,
        },
        _ => None,
    }
}

fn union_meta(value: Value) -> Option<Headers> {
    match value {
        Value::Union(_, inner) => match *inner {
            Value::Map(map) => {
                let mut headers = Headers::new();
                for (k, v) in map {
                    if let Value::Bytes(bytes) = v {
                        headers.insert(k, bytes);
                    }
                }
                Some(headers)
            }
            _ => None,
        },
        _ => None,
    }
}
