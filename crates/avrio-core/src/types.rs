//! Narrow interface onto the Avro type system.
//!
//! The engine consumes schemas through four capabilities only: encode a value
//! to datum bytes, decode datum bytes to a value, compare two schemas
//! structurally, and adapt bytes written under a remote writer schema into a
//! value shaped by a local reader schema. Everything else about the type
//! system stays behind `apache-avro`.

use std::collections::HashMap;
use std::io::Read;
use std::sync::{Arc, OnceLock};

use apache_avro::schema::Schema;
use apache_avro::types::Value;
use apache_avro::{from_avro_datum, to_avro_datum};

/// Message headers: string keys to opaque byte values.
pub type Headers = HashMap<String, Vec<u8>>;

/// Schema for the header maps carried by every request and response.
pub fn headers_schema() -> &'static Schema {
    static SCHEMA: OnceLock<Schema> = OnceLock::new();
    SCHEMA.get_or_init(|| {
        Schema::parse_str(r#"{"type": "map", "values": "bytes"}"#)
            .expect("header map schema is well-formed")
    })
}

pub fn string_schema() -> &'static Schema {
    static SCHEMA: OnceLock<Schema> = OnceLock::new();
    SCHEMA.get_or_init(|| Schema::parse_str(r#""string""#).expect("string schema is well-formed"))
}

pub fn boolean_schema() -> &'static Schema {
    static SCHEMA: OnceLock<Schema> = OnceLock::new();
    SCHEMA
        .get_or_init(|| Schema::parse_str(r#""boolean""#).expect("boolean schema is well-formed"))
}

/// Union schema used to encode system errors: always the string branch.
pub fn system_error_schema() -> &'static Schema {
    static SCHEMA: OnceLock<Schema> = OnceLock::new();
    SCHEMA.get_or_init(|| {
        Schema::parse_str(r#"["string"]"#).expect("system error schema is well-formed")
    })
}

/// Encode a value as a bare Avro datum under `schema`.
pub fn encode_datum(schema: &Schema, value: Value) -> Result<Vec<u8>, apache_avro::Error> {
    to_avro_datum(schema, value)
}

/// Decode a bare Avro datum written and read under the same schema.
pub fn decode_datum<R: Read>(schema: &Schema, reader: &mut R) -> Result<Value, apache_avro::Error> {
    from_avro_datum(schema, reader, None)
}

/// Structural schema equality, via the parsing canonical form.
pub fn schemas_equal(a: &Schema, b: &Schema) -> bool {
    a.canonical_form() == b.canonical_form()
}

/// Encode a header map as an Avro `map<bytes>` datum.
pub fn encode_headers(headers: &Headers) -> Result<Vec<u8>, apache_avro::Error> {
    let map: HashMap<String, Value> = headers
        .iter()
        .map(|(k, v)| (k.clone(), Value::Bytes(v.clone())))
        .collect();
    encode_datum(headers_schema(), Value::Map(map))
}

/// Decode a header map datum.
pub fn decode_headers<R: Read>(reader: &mut R) -> Result<Headers, apache_avro::Error> {
    let value = decode_datum(headers_schema(), reader)?;
    let mut headers = Headers::new();
    if let Value::Map(map) = value {
        for (k, v) in map {
            if let Value::Bytes(bytes) = v {
                headers.insert(k, bytes);
            }
        }
    }
    Ok(headers)
}

/// Compiled translation from a writer schema's bytes to a reader schema's
/// values.
///
/// When the two schemas are structurally equal the resolver short-circuits to
/// a plain read under the reader schema.
#[derive(Clone, Debug)]
pub struct Resolver {
    writer: Arc<Schema>,
    reader: Arc<Schema>,
    direct: bool,
}

impl Resolver {
    pub fn new(writer: Arc<Schema>, reader: Arc<Schema>) -> Self {
        let direct = schemas_equal(&writer, &reader);
        Self {
            writer,
            reader,
            direct,
        }
    }

    /// Read one datum, translating writer-shaped bytes into a reader-shaped
    /// value.
    pub fn read<R: Read>(&self, reader: &mut R) -> Result<Value, apache_avro::Error> {
        if self.direct {
            from_avro_datum(&self.reader, reader, None)
        } else {
            from_avro_datum(&self.writer, reader, Some(&self.reader))
        }
    }

    pub fn reader_schema(&self) -> &Arc<Schema> {
        &self.reader
    }
}
