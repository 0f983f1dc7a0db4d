//! Typed descriptions of a protocol and its operations.
//!
//! A [`Service`] is parsed from an Avro protocol JSON document. It owns the
//! named types declared by the document and one [`Message`] per operation,
//! and carries a stable 16-byte MD5 fingerprint over the canonical form of
//! the document. Services are immutable after construction and shared via
//! `Arc`.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use apache_avro::schema::Schema;
use serde_json::Value as Json;

use crate::error::{ErrorCode, RpcError};

const PRIMITIVES: [&str; 8] = [
    "null", "boolean", "int", "long", "float", "double", "bytes", "string",
];

/// One operation of a protocol.
#[derive(Debug)]
pub struct Message {
    name: String,
    doc: Option<String>,
    request: Arc<Schema>,
    response: Arc<Schema>,
    errors: Arc<Schema>,
    one_way: bool,
}

impl Message {
    /// Simple (unqualified) message name. Empty for the built-in ping.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn doc(&self) -> Option<&str> {
        self.doc.as_deref()
    }

    /// Record schema packing the request parameters.
    pub fn request(&self) -> &Arc<Schema> {
        &self.request
    }

    pub fn response(&self) -> &Arc<Schema> {
        &self.response
    }

    /// Error union; its first branch is always `string`.
    pub fn errors(&self) -> &Arc<Schema> {
        &self.errors
    }

    pub fn one_way(&self) -> bool {
        self.one_way
    }

    /// Whether this is the reserved connection-probe message.
    pub fn is_ping(&self) -> bool {
        self.name.is_empty()
    }
}

/// The reserved connection-probe message: empty name, empty request.
pub fn ping_message() -> &'static Arc<Message> {
    static PING: OnceLock<Arc<Message>> = OnceLock::new();
    PING.get_or_init(|| {
        let request = Schema::parse_str(r#"{"type": "record", "name": "PingRequest", "fields": []}"#)
            .expect("ping request schema is well-formed");
        let response =
            Schema::parse_str(r#"["string"]"#).expect("ping response schema is well-formed");
        let errors = Schema::parse_str(r#"["string"]"#).expect("ping error schema is well-formed");
        Arc::new(Message {
            name: String::new(),
            doc: None,
            request: Arc::new(request),
            response: Arc::new(response),
            errors: Arc::new(errors),
            one_way: false,
        })
    })
}

/// A named protocol: its types, its messages and its fingerprint.
#[derive(Debug)]
pub struct Service {
    name: String,
    doc: Option<String>,
    document: Json,
    fingerprint: [u8; 16],
    types: Vec<Arc<Schema>>,
    messages: HashMap<String, Arc<Message>>,
    message_names: Vec<String>,
}

impl Service {
    /// Parse a protocol JSON document.
    pub fn from_json(input: &str) -> Result<Arc<Self>, RpcError> {
        let document: Json = serde_json::from_str(input).map_err(|e| {
            RpcError::with_source(ErrorCode::InvalidProtocol, "protocol is not valid JSON", e)
        })?;
        Self::from_document(document)
    }

    /// Build a service from an already parsed protocol document.
    pub fn from_document(document: Json) -> Result<Arc<Self>, RpcError> {
        let obj = document
            .as_object()
            .ok_or_else(|| invalid("protocol document must be a JSON object"))?;

        let declared = obj
            .get("protocol")
            .and_then(Json::as_str)
            .ok_or_else(|| invalid("missing protocol name"))?;
        let namespace = obj.get("namespace").and_then(Json::as_str);

        // A dotted protocol name embeds its own namespace.
        let (namespace, name) = match declared.rfind('.') {
            Some(pos) => (Some(&declared[..pos]), &declared[pos + 1..]),
            None => (namespace, declared),
        };
        let full_name = match namespace {
            Some(ns) => format!("{}.{}", ns, name),
            None => name.to_string(),
        };
        if !is_valid_name(name) {
            return Err(invalid(format!("invalid protocol name: {:?}", name)));
        }

        let doc = obj.get("doc").and_then(Json::as_str).map(str::to_string);

        // Collect the schema documents to parse together: declared types
        // first, then request/response/errors for every message, so that
        // named references resolve across the whole protocol.
        let mut inputs: Vec<String> = Vec::new();

        let types = match obj.get("types") {
            None => &[] as &[Json],
            Some(Json::Array(types)) => types.as_slice(),
            Some(_) => return Err(invalid("protocol types must be an array")),
        };
        for ty in types {
            inputs.push(with_namespace(ty, namespace)?.to_string());
        }

        let mut message_names: Vec<String> = Vec::new();
        let mut message_meta: Vec<(Option<String>, bool)> = Vec::new();
        if let Some(messages) = obj.get("messages") {
            let messages = messages
                .as_object()
                .ok_or_else(|| invalid("protocol messages must be an object"))?;
            for (msg_name, decl) in messages {
                if !is_valid_name(msg_name) {
                    return Err(invalid(format!("invalid message name: {:?}", msg_name)));
                }
                let decl = decl
                    .as_object()
                    .ok_or_else(|| invalid(format!("message {:?} must be an object", msg_name)))?;

                let request = decl
                    .get("request")
                    .and_then(Json::as_array)
                    .ok_or_else(|| {
                        invalid(format!("message {:?} is missing its request fields", msg_name))
                    })?;
                let one_way = decl.get("one-way").and_then(Json::as_bool).unwrap_or(false);
                let response = decl.get("response").cloned().unwrap_or(Json::String("null".into()));
                let errors = decl.get("errors").cloned().unwrap_or(Json::Array(vec![]));
                let errors = errors
                    .as_array()
                    .ok_or_else(|| invalid(format!("message {:?} errors must be an array", msg_name)))?
                    .clone();

                if one_way && (response != Json::String("null".into()) || !errors.is_empty()) {
                    return Err(invalid(format!(
                        "one-way message {:?} must have a null response and no errors",
                        msg_name
                    )));
                }

                // Request record, synthesized from the parameter list.
                let mut record = serde_json::Map::new();
                record.insert("type".into(), Json::String("record".into()));
                record.insert("name".into(), Json::String(format!("{}_request", msg_name)));
                if let Some(ns) = namespace {
                    record.insert("namespace".into(), Json::String(ns.into()));
                }
                record.insert("fields".into(), Json::Array(request.clone()));
                inputs.push(Json::Object(record).to_string());

                inputs.push(qualify_refs(&response, namespace).to_string());

                // Error union: the implicit string branch, then the declared
                // error types.
                let mut branches = vec![Json::String("string".into())];
                branches.extend(errors.iter().map(|e| qualify_refs(e, namespace)));
                inputs.push(Json::Array(branches).to_string());

                message_names.push(msg_name.clone());
                message_meta.push((
                    decl.get("doc").and_then(Json::as_str).map(str::to_string),
                    one_way,
                ));
            }
        }

        let refs: Vec<&str> = inputs.iter().map(String::as_str).collect();
        let mut parsed = Schema::parse_list(&refs)
            .map_err(|e| {
                RpcError::with_source(ErrorCode::InvalidProtocol, "protocol schemas failed to parse", e)
            })?
            .into_iter();

        let types: Vec<Arc<Schema>> = (&mut parsed).take(types.len()).map(Arc::new).collect();

        let mut messages = HashMap::new();
        for (msg_name, (doc, one_way)) in message_names.iter().zip(message_meta) {
            let request = parsed.next().ok_or_else(|| invalid("missing request schema"))?;
            let response = parsed.next().ok_or_else(|| invalid("missing response schema"))?;
            let errors = parsed.next().ok_or_else(|| invalid("missing error schema"))?;
            messages.insert(
                msg_name.clone(),
                Arc::new(Message {
                    name: msg_name.clone(),
                    doc,
                    request: Arc::new(request),
                    response: Arc::new(response),
                    errors: Arc::new(errors),
                    one_way,
                }),
            );
        }

        let fingerprint = fingerprint_document(&document);

        Ok(Arc::new(Service {
            name: full_name,
            doc,
            document,
            fingerprint,
            types,
            messages,
            message_names,
        }))
    }

    /// Fully qualified protocol name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn doc(&self) -> Option<&str> {
        self.doc.as_deref()
    }

    /// MD5 fingerprint over the canonical JSON of the protocol document.
    pub fn fingerprint(&self) -> [u8; 16] {
        self.fingerprint
    }

    /// The protocol document serialized back to canonical JSON.
    pub fn protocol_json(&self) -> String {
        self.document.to_string()
    }

    pub fn message(&self, name: &str) -> Option<&Arc<Message>> {
        self.messages.get(name)
    }

    /// Message names in declaration order.
    pub fn message_names(&self) -> &[String] {
        &self.message_names
    }

    pub fn messages(&self) -> impl Iterator<Item = &Arc<Message>> {
        self.message_names
            .iter()
            .filter_map(move |name| self.messages.get(name))
    }

    /// Declared named types, in declaration order.
    pub fn types(&self) -> &[Arc<Schema>] {
        &self.types
    }
}

/// MD5 over the canonical serialization of a protocol document.
///
/// `serde_json` keeps object keys sorted, so re-serializing the parsed
/// document yields the same bytes on both peers for the same protocol.
pub fn fingerprint_document(document: &Json) -> [u8; 16] {
    md5::compute(document.to_string().as_bytes()).0
}

/// Render a fingerprint as lowercase hex, for cache keys and logs.
pub fn fingerprint_hex(fingerprint: &[u8; 16]) -> String {
    let mut out = String::with_capacity(32);
    for b in fingerprint {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

fn invalid(message: impl Into<String>) -> RpcError {
    RpcError::new(ErrorCode::InvalidProtocol, message)
}

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Inject the protocol namespace into a named type declaration that does not
/// set its own, so nested references resolve the way they would inside the
/// protocol document.
fn with_namespace(ty: &Json, namespace: Option<&str>) -> Result<Json, RpcError> {
    let obj = ty
        .as_object()
        .ok_or_else(|| invalid("declared protocol types must be objects"))?;
    let mut out = obj.clone();
    if let Some(ns) = namespace {
        if !obj.contains_key("namespace") {
            out.insert("namespace".into(), Json::String(ns.into()));
        }
    }
    Ok(Json::Object(out))
}

/// Qualify bare name references with the protocol namespace.
///
/// Response and error declarations are parsed outside the protocol document,
/// so references that would resolve via the enclosing namespace have to be
/// made explicit.
fn qualify_refs(json: &Json, namespace: Option<&str>) -> Json {
    let Some(ns) = namespace else {
        return json.clone();
    };
    match json {
        Json::String(s) if !PRIMITIVES.contains(&s.as_str()) && !s.contains('.') => {
            Json::String(format!("{}.{}", ns, s))
        }
        Json::Array(branches) => Json::Array(
            branches
                .iter()
                .map(|b| qualify_refs(b, namespace))
                .collect(),
        ),
        Json::Object(obj) => {
            let mut out = obj.clone();
            match obj.get("type").and_then(Json::as_str) {
                Some("array") => {
                    if let Some(items) = obj.get("items") {
                        out.insert("items".into(), qualify_refs(items, namespace));
                    }
                }
                Some("map") => {
                    if let Some(values) = obj.get("values") {
                        out.insert("values".into(), qualify_refs(values, namespace));
                    }
                }
                Some("record") | Some("error") | Some("enum") | Some("fixed") => {
                    if !obj.contains_key("namespace") {
                        out.insert("namespace".into(), Json::String(ns.into()));
                    }
                }
                Some(other) if !PRIMITIVES.contains(&other) && !other.contains('.') => {
                    out.insert("type".into(), Json::String(format!("{}.{}", ns, other)));
                }
                _ => {}
            }
            Json::Object(out)
        }
        other => other.clone(),
    }
}
