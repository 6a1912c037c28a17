//! Type registry and column codecs
//!
//! The registry maps a backend type OID to a [`Codec`]. The row decoder asks it whether a
//! column streams; typed accessors and parameter binding use it to convert values.

use super::constants::oid;
use super::message::Format;
use crate::{Error, Result};
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Decoded column value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// SQL NULL
    Null,
    /// boolean
    Bool(bool),
    /// smallint, integer, bigint, oid
    Int(i64),
    /// real, double precision
    Float(f64),
    /// text-like types and unknown types in text format
    Text(String),
    /// bytea and unknown types in binary format
    Bytes(Bytes),
    /// json, jsonb
    Json(serde_json::Value),
    /// one-dimensional array
    Array(Vec<Value>),
}

/// Converts one backend type between wire bytes and [`Value`]
pub trait Codec: Send + Sync + fmt::Debug {
    /// Type OID
    fn oid(&self) -> u32;

    /// Type name, for diagnostics
    fn name(&self) -> &str;

    /// Whether column values of this type are streamed to the row handler
    fn streams(&self) -> bool {
        false
    }

    /// Decode a non-null value
    fn decode(&self, raw: &[u8], format: Format) -> Result<Value>;

    /// Encode a value; `None` is SQL NULL
    fn encode(&self, value: &Value, format: Format) -> Result<Option<Bytes>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Bool,
    Int(usize),
    Float(usize),
    Text,
    Bytea,
    Json { binary_version: bool },
}

/// Codec for one of the builtin scalar types
#[derive(Debug, Clone)]
pub struct Builtin {
    oid: u32,
    name: &'static str,
    kind: Kind,
}

impl Builtin {
    const fn new(oid: u32, name: &'static str, kind: Kind) -> Self {
        Self { oid, name, kind }
    }
}

fn mismatch(codec: &str, value: &Value) -> Error {
    Error::Protocol(format!("cannot encode {value:?} as {codec}"))
}

fn invalid(codec: &str, raw: &[u8]) -> Error {
    Error::Protocol(format!(
        "invalid {codec} value: {:?}",
        String::from_utf8_lossy(raw)
    ))
}

fn text(raw: &[u8]) -> Result<&str> {
    std::str::from_utf8(raw).map_err(|e| Error::Protocol(format!("invalid UTF-8: {e}")))
}

impl Codec for Builtin {
    fn oid(&self) -> u32 {
        self.oid
    }

    fn name(&self) -> &str {
        self.name
    }

    fn streams(&self) -> bool {
        self.kind == Kind::Bytea
    }

    fn decode(&self, raw: &[u8], format: Format) -> Result<Value> {
        match (self.kind, format) {
            (Kind::Bool, Format::Text) => match raw {
                b"t" => Ok(Value::Bool(true)),
                b"f" => Ok(Value::Bool(false)),
                _ => Err(invalid(self.name, raw)),
            },
            (Kind::Bool, Format::Binary) => match raw {
                [b] => Ok(Value::Bool(*b != 0)),
                _ => Err(invalid(self.name, raw)),
            },
            (Kind::Int(_), Format::Text) => text(raw)?
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|_| invalid(self.name, raw)),
            (Kind::Int(width), Format::Binary) => match (width, raw.len()) {
                (2, 2) => Ok(Value::Int(i64::from(i16::from_be_bytes([raw[0], raw[1]])))),
                (4, 4) => Ok(Value::Int(i64::from(i32::from_be_bytes([
                    raw[0], raw[1], raw[2], raw[3],
                ])))),
                (8, 8) => {
                    let mut b = [0u8; 8];
                    b.copy_from_slice(raw);
                    Ok(Value::Int(i64::from_be_bytes(b)))
                }
                _ => Err(invalid(self.name, raw)),
            },
            (Kind::Float(_), Format::Text) => text(raw)?
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|_| invalid(self.name, raw)),
            (Kind::Float(width), Format::Binary) => match (width, raw.len()) {
                (4, 4) => Ok(Value::Float(f64::from(f32::from_be_bytes([
                    raw[0], raw[1], raw[2], raw[3],
                ])))),
                (8, 8) => {
                    let mut b = [0u8; 8];
                    b.copy_from_slice(raw);
                    Ok(Value::Float(f64::from_be_bytes(b)))
                }
                _ => Err(invalid(self.name, raw)),
            },
            (Kind::Text, _) => Ok(Value::Text(text(raw)?.to_owned())),
            (Kind::Bytea, Format::Text) => decode_hex_bytea(raw).map(Value::Bytes),
            (Kind::Bytea, Format::Binary) => Ok(Value::Bytes(Bytes::copy_from_slice(raw))),
            (Kind::Json { binary_version }, format) => {
                let body = match (binary_version, format, raw.split_first()) {
                    (true, Format::Binary, Some((1, rest))) => rest,
                    (true, Format::Binary, _) => return Err(invalid(self.name, raw)),
                    _ => raw,
                };
                serde_json::from_slice(body)
                    .map(Value::Json)
                    .map_err(|e| Error::Protocol(format!("invalid {}: {e}", self.name)))
            }
        }
    }

    fn encode(&self, value: &Value, format: Format) -> Result<Option<Bytes>> {
        let bytes = match (self.kind, value, format) {
            (_, Value::Null, _) => return Ok(None),
            (Kind::Bool, Value::Bool(b), Format::Text) => {
                Bytes::from_static(if *b { b"t" } else { b"f" })
            }
            (Kind::Bool, Value::Bool(b), Format::Binary) => Bytes::from(vec![u8::from(*b)]),
            (Kind::Int(_), Value::Int(i), Format::Text) => Bytes::from(i.to_string()),
            (Kind::Int(width), Value::Int(i), Format::Binary) => match width {
                2 => i16::try_from(*i)
                    .map(|v| Bytes::copy_from_slice(&v.to_be_bytes()))
                    .map_err(|_| mismatch(self.name, value))?,
                4 => i32::try_from(*i)
                    .map(|v| Bytes::copy_from_slice(&v.to_be_bytes()))
                    .map_err(|_| mismatch(self.name, value))?,
                _ => Bytes::copy_from_slice(&i.to_be_bytes()),
            },
            (Kind::Float(_), Value::Float(f), Format::Text) => Bytes::from(f.to_string()),
            (Kind::Float(4), Value::Float(f), Format::Binary) => {
                Bytes::copy_from_slice(&(*f as f32).to_be_bytes())
            }
            (Kind::Float(_), Value::Float(f), Format::Binary) => {
                Bytes::copy_from_slice(&f.to_be_bytes())
            }
            (Kind::Text, Value::Text(s), _) => Bytes::from(s.clone()),
            (Kind::Bytea, Value::Bytes(b), Format::Binary) => b.clone(),
            (Kind::Bytea, Value::Bytes(b), Format::Text) => Bytes::from(encode_hex_bytea(b)),
            (Kind::Json { binary_version }, Value::Json(j), format) => {
                let mut out = Vec::new();
                if binary_version && format == Format::Binary {
                    out.push(1);
                }
                serde_json::to_writer(&mut out, j)
                    .map_err(|e| Error::Protocol(format!("invalid {}: {e}", self.name)))?;
                Bytes::from(out)
            }
            _ => return Err(mismatch(self.name, value)),
        };
        Ok(Some(bytes))
    }
}

fn decode_hex_bytea(raw: &[u8]) -> Result<Bytes> {
    let digits = raw
        .strip_prefix(b"\\x")
        .ok_or_else(|| invalid("bytea", raw))?;
    if digits.len() % 2 != 0 {
        return Err(invalid("bytea", raw));
    }
    let nibble = |c: u8| match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    };
    digits
        .chunks(2)
        .map(|pair| Some(nibble(pair[0])? << 4 | nibble(pair[1])?))
        .collect::<Option<Vec<u8>>>()
        .map(Bytes::from)
        .ok_or_else(|| invalid("bytea", raw))
}

fn encode_hex_bytea(raw: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(2 + raw.len() * 2);
    out.push_str("\\x");
    for b in raw {
        let _ = write!(out, "{b:02x}");
    }
    out
}

/// Parse a one-dimensional text-format array literal such as `{1,"a b",NULL}`.
pub fn parse_text_array(s: &str) -> Result<Vec<Option<String>>> {
    let inner = s
        .strip_prefix('{')
        .and_then(|s| s.strip_suffix('}'))
        .ok_or_else(|| Error::Protocol(format!("invalid array literal: {s}")))?;
    let mut items = Vec::new();
    if inner.is_empty() {
        return Ok(items);
    }

    let mut chars = inner.chars().peekable();
    loop {
        let item = if chars.peek() == Some(&'"') {
            chars.next();
            let mut item = String::new();
            loop {
                match chars.next() {
                    Some('\\') => item.extend(chars.next()),
                    Some('"') => break,
                    Some(c) => item.push(c),
                    None => {
                        return Err(Error::Protocol(format!("unterminated array element: {s}")))
                    }
                }
            }
            Some(item)
        } else {
            let mut item = String::new();
            while let Some(&c) = chars.peek() {
                if c == ',' {
                    break;
                }
                item.push(c);
                chars.next();
            }
            (item != "NULL").then_some(item)
        };
        items.push(item);
        match chars.next() {
            Some(',') => continue,
            None => break,
            Some(c) => return Err(Error::Protocol(format!("unexpected '{c}' in array: {s}"))),
        }
    }
    Ok(items)
}

/// OID → codec table with per-OID streaming overrides
#[derive(Debug, Clone)]
pub struct TypeRegistry {
    codecs: HashMap<u32, Arc<dyn Codec>>,
    streaming: HashSet<u32>,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeRegistry {
    /// Registry holding the builtin scalar codecs
    pub fn new() -> Self {
        let mut registry = Self::empty();
        for codec in [
            Builtin::new(oid::BOOL, "bool", Kind::Bool),
            Builtin::new(oid::INT2, "int2", Kind::Int(2)),
            Builtin::new(oid::INT4, "int4", Kind::Int(4)),
            Builtin::new(oid::INT8, "int8", Kind::Int(8)),
            Builtin::new(oid::OID, "oid", Kind::Int(4)),
            Builtin::new(oid::FLOAT4, "float4", Kind::Float(4)),
            Builtin::new(oid::FLOAT8, "float8", Kind::Float(8)),
            Builtin::new(oid::TEXT, "text", Kind::Text),
            Builtin::new(oid::VARCHAR, "varchar", Kind::Text),
            Builtin::new(oid::BYTEA, "bytea", Kind::Bytea),
            Builtin::new(oid::JSON, "json", Kind::Json { binary_version: false }),
            Builtin::new(oid::JSONB, "jsonb", Kind::Json { binary_version: true }),
        ] {
            registry.register(Arc::new(codec));
        }
        registry
    }

    /// Registry without any codec
    pub fn empty() -> Self {
        Self {
            codecs: HashMap::new(),
            streaming: HashSet::new(),
        }
    }

    /// Add or replace a codec
    pub fn register(&mut self, codec: Arc<dyn Codec>) {
        self.codecs.insert(codec.oid(), codec);
    }

    /// Codec for an OID
    pub fn get(&self, oid: u32) -> Option<&Arc<dyn Codec>> {
        self.codecs.get(&oid)
    }

    /// Stream values of `oid` regardless of what its codec reports
    pub fn mark_streaming(&mut self, oid: u32) {
        self.streaming.insert(oid);
    }

    /// Whether values of `oid` are delivered incrementally
    pub fn is_streaming(&self, oid: u32) -> bool {
        self.streaming.contains(&oid) || self.get(oid).is_some_and(|c| c.streams())
    }

    /// Decode a value; unknown types come back as text (or bytes in binary format)
    pub fn decode(&self, oid: u32, raw: Option<&[u8]>, format: Format) -> Result<Value> {
        let Some(raw) = raw else {
            return Ok(Value::Null);
        };
        match (self.get(oid), format) {
            (Some(codec), _) => codec.decode(raw, format),
            (None, Format::Text) => Ok(Value::Text(String::from_utf8_lossy(raw).into_owned())),
            (None, Format::Binary) => Ok(Value::Bytes(Bytes::copy_from_slice(raw))),
        }
    }

    /// Encode a parameter for `oid`.
    ///
    /// Types without a codec (including OID 0, "let the server infer") are sent in their
    /// text form; the backend parses them with the parameter's declared type.
    pub fn encode(&self, oid: u32, value: &Value, format: Format) -> Result<Option<Bytes>> {
        if let Some(codec) = self.get(oid) {
            return codec.encode(value, format);
        }
        if format == Format::Binary && !matches!(value, Value::Null | Value::Bytes(_)) {
            return Err(Error::Protocol(format!(
                "no binary codec registered for type {oid}"
            )));
        }
        Ok(match value {
            Value::Null => None,
            Value::Bool(b) => Some(Bytes::from_static(if *b { b"t" } else { b"f" })),
            Value::Int(i) => Some(Bytes::from(i.to_string())),
            Value::Float(f) => Some(Bytes::from(f.to_string())),
            Value::Text(s) => Some(Bytes::copy_from_slice(s.as_bytes())),
            Value::Bytes(b) => Some(b.clone()),
            Value::Json(j) => Some(Bytes::from(j.to_string())),
            Value::Array(_) => {
                return Err(Error::Protocol(format!(
                    "arrays need a registered codec (type {oid})"
                )))
            }
        })
    }
}
