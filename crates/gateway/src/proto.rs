//! Descriptor-set-driven protobuf encode/decode.
//!
//! Uploaded `.proto` files are compiled offline (`protoc
//! --descriptor_set_out`) into one artifact per `(api_name, api_version)`.
//! The registry loads the `FileDescriptorSet`, resolves `Service.Method`
//! names, and translates JSON message bodies to and from the protobuf wire
//! format using `prost`'s encoding primitives — no generated stubs in the
//! gateway process.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use prost::encoding::{WireType, decode_key, decode_varint, encode_key, encode_varint};
use prost_types::field_descriptor_proto::{Label, Type};
use prost_types::{DescriptorProto, FieldDescriptorProto, FileDescriptorSet};
use serde_json::Value;

use crate::error::GatewayError;

/// A resolved method: wire path plus input/output message types.
#[derive(Debug, Clone)]
pub struct ResolvedMethod {
    /// gRPC request path, `/{package}.{Service}/{Method}`.
    pub path: String,
    /// Fully-qualified input type, `.package.Message`.
    pub input_type: String,
    pub output_type: String,
}

/// Loads and caches descriptor-set artifacts per API.
pub struct DescriptorRegistry {
    dir: PathBuf,
    cache: DashMap<String, Arc<FileDescriptorSet>>,
}

impl std::fmt::Debug for DescriptorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorRegistry")
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

fn decode_err(msg: impl Into<String>) -> GatewayError {
    GatewayError::ProtoDecode(msg.into())
}

impl DescriptorRegistry {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cache: DashMap::new(),
        }
    }

    /// Artifact path for an API: `{dir}/{name}_{version}.desc`.
    #[must_use]
    pub fn artifact_path(&self, api_name: &str, api_version: &str) -> PathBuf {
        self.dir.join(format!("{api_name}_{api_version}.desc"))
    }

    /// Load (or reuse) the descriptor set for an API.
    pub fn load(
        &self,
        api_name: &str,
        api_version: &str,
    ) -> Result<Arc<FileDescriptorSet>, GatewayError> {
        let key = format!("{api_name}/{api_version}");
        if let Some(set) = self.cache.get(&key) {
            return Ok(set.clone());
        }
        let path = self.artifact_path(api_name, api_version);
        let set = Arc::new(load_descriptor_file(&path)?);
        self.cache.insert(key, set.clone());
        Ok(set)
    }

    /// Register a descriptor set fetched at runtime (server reflection).
    pub fn register(&self, api_name: &str, api_version: &str, set: FileDescriptorSet) {
        self.cache
            .insert(format!("{api_name}/{api_version}"), Arc::new(set));
    }

    #[must_use]
    pub fn is_loaded(&self, api_name: &str, api_version: &str) -> bool {
        self.cache
            .contains_key(&format!("{api_name}/{api_version}"))
    }
}

/// Read and parse a binary `FileDescriptorSet` artifact.
pub fn load_descriptor_file(path: &Path) -> Result<FileDescriptorSet, GatewayError> {
    let bytes = std::fs::read(path)
        .map_err(|e| decode_err(format!("descriptor artifact {} unreadable: {e}", path.display())))?;
    prost::Message::decode(bytes.as_slice())
        .map_err(|e| decode_err(format!("descriptor artifact corrupt: {e}")))
}

/// Resolve `"Service.Method"` within the set, optionally scoped by a
/// package hint.
pub fn resolve_method(
    set: &FileDescriptorSet,
    package_hint: Option<&str>,
    method_ref: &str,
) -> Result<ResolvedMethod, GatewayError> {
    let (service_name, method_name) = method_ref
        .split_once('.')
        .ok_or_else(|| decode_err(format!("method must be Service.Method, got {method_ref}")))?;

    for file in &set.file {
        let package = file.package.as_deref().unwrap_or("");
        if let Some(hint) = package_hint
            && !hint.is_empty()
            && package != hint
        {
            continue;
        }
        for service in &file.service {
            if service.name.as_deref() != Some(service_name) {
                continue;
            }
            for method in &service.method {
                if method.name.as_deref() == Some(method_name) {
                    let qualified = if package.is_empty() {
                        service_name.to_owned()
                    } else {
                        format!("{package}.{service_name}")
                    };
                    return Ok(ResolvedMethod {
                        path: format!("/{qualified}/{method_name}"),
                        input_type: method.input_type.clone().unwrap_or_default(),
                        output_type: method.output_type.clone().unwrap_or_default(),
                    });
                }
            }
        }
    }
    Err(decode_err(format!("method {method_ref} not found in descriptor set")))
}

/// Find a message descriptor by fully-qualified name (`.pkg.Outer.Inner`).
fn find_message<'a>(
    set: &'a FileDescriptorSet,
    fq_name: &str,
) -> Result<&'a DescriptorProto, GatewayError> {
    let wanted = fq_name.trim_start_matches('.');
    for file in &set.file {
        let package = file.package.as_deref().unwrap_or("");
        let rest = if package.is_empty() {
            Some(wanted)
        } else {
            wanted.strip_prefix(package).and_then(|r| r.strip_prefix('.'))
        };
        let Some(rest) = rest else { continue };
        if let Some(found) = find_nested(&file.message_type, rest) {
            return Ok(found);
        }
    }
    Err(decode_err(format!("message type {fq_name} not found")))
}

fn find_nested<'a>(messages: &'a [DescriptorProto], path: &str) -> Option<&'a DescriptorProto> {
    let (head, rest) = match path.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    };
    let found = messages.iter().find(|m| m.name.as_deref() == Some(head))?;
    match rest {
        Some(rest) => find_nested(&found.nested_type, rest),
        None => Some(found),
    }
}

fn field_type(field: &FieldDescriptorProto) -> Type {
    field.r#type()
}

fn is_repeated(field: &FieldDescriptorProto) -> bool {
    field.label() == Label::Repeated
}

// -- encoding ---------------------------------------------------------------

/// Encode a JSON object against a message type from the set.
pub fn encode_message(
    set: &FileDescriptorSet,
    type_name: &str,
    value: &Value,
) -> Result<Bytes, GatewayError> {
    let descriptor = find_message(set, type_name)?;
    let Value::Object(map) = value else {
        return Err(decode_err(format!(
            "message body for {type_name} must be a JSON object"
        )));
    };

    let mut buf = BytesMut::new();
    for field in &descriptor.field {
        let name = field.name.as_deref().unwrap_or_default();
        // Accept both proto names and their lowerCamel JSON forms.
        let json_value = map
            .get(name)
            .or_else(|| field.json_name.as_deref().and_then(|jn| map.get(jn)));
        let Some(json_value) = json_value else {
            continue;
        };
        if json_value.is_null() {
            continue;
        }
        if is_repeated(field) {
            let Value::Array(items) = json_value else {
                return Err(decode_err(format!("field {name} is repeated, expected array")));
            };
            for item in items {
                encode_field(set, field, item, &mut buf)?;
            }
        } else {
            encode_field(set, field, json_value, &mut buf)?;
        }
    }
    Ok(buf.freeze())
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn encode_field(
    set: &FileDescriptorSet,
    field: &FieldDescriptorProto,
    value: &Value,
    buf: &mut BytesMut,
) -> Result<(), GatewayError> {
    let tag = u32::try_from(field.number.unwrap_or(0))
        .map_err(|_| decode_err("field number out of range"))?;
    let name = field.name.as_deref().unwrap_or_default();
    let expect =
        |ok: bool, what: &str| -> Result<(), GatewayError> {
            if ok {
                Ok(())
            } else {
                Err(decode_err(format!("field {name}: expected {what}")))
            }
        };

    match field_type(field) {
        Type::Bool => {
            let b = value.as_bool();
            expect(b.is_some(), "boolean")?;
            encode_key(tag, WireType::Varint, buf);
            encode_varint(u64::from(b.unwrap_or(false)), buf);
        }
        Type::Int32 | Type::Int64 => {
            let n = value.as_i64();
            expect(n.is_some(), "integer")?;
            encode_key(tag, WireType::Varint, buf);
            encode_varint(n.unwrap_or(0) as u64, buf);
        }
        Type::Uint32 | Type::Uint64 => {
            let n = value.as_u64();
            expect(n.is_some(), "unsigned integer")?;
            encode_key(tag, WireType::Varint, buf);
            encode_varint(n.unwrap_or(0), buf);
        }
        Type::Sint32 | Type::Sint64 => {
            let n = value.as_i64();
            expect(n.is_some(), "integer")?;
            let n = n.unwrap_or(0);
            encode_key(tag, WireType::Varint, buf);
            encode_varint(((n << 1) ^ (n >> 63)) as u64, buf);
        }
        Type::Double => {
            let n = value.as_f64();
            expect(n.is_some(), "number")?;
            encode_key(tag, WireType::SixtyFourBit, buf);
            buf.put_f64_le(n.unwrap_or(0.0));
        }
        Type::Float => {
            let n = value.as_f64();
            expect(n.is_some(), "number")?;
            encode_key(tag, WireType::ThirtyTwoBit, buf);
            buf.put_f32_le(n.unwrap_or(0.0) as f32);
        }
        Type::Fixed64 => {
            let n = value.as_u64();
            expect(n.is_some(), "unsigned integer")?;
            encode_key(tag, WireType::SixtyFourBit, buf);
            buf.put_u64_le(n.unwrap_or(0));
        }
        Type::Fixed32 => {
            let n = value.as_u64();
            expect(n.is_some(), "unsigned integer")?;
            encode_key(tag, WireType::ThirtyTwoBit, buf);
            buf.put_u32_le(n.unwrap_or(0) as u32);
        }
        Type::Sfixed64 => {
            let n = value.as_i64();
            expect(n.is_some(), "integer")?;
            encode_key(tag, WireType::SixtyFourBit, buf);
            buf.put_i64_le(n.unwrap_or(0));
        }
        Type::Sfixed32 => {
            let n = value.as_i64();
            expect(n.is_some(), "integer")?;
            encode_key(tag, WireType::ThirtyTwoBit, buf);
            buf.put_i32_le(n.unwrap_or(0) as i32);
        }
        Type::String => {
            let s = value.as_str();
            expect(s.is_some(), "string")?;
            let s = s.unwrap_or_default();
            encode_key(tag, WireType::LengthDelimited, buf);
            encode_varint(s.len() as u64, buf);
            buf.put_slice(s.as_bytes());
        }
        Type::Bytes => {
            let s = value.as_str();
            expect(s.is_some(), "base64 string")?;
            let raw = B64
                .decode(s.unwrap_or_default())
                .map_err(|e| decode_err(format!("field {name}: invalid base64: {e}")))?;
            encode_key(tag, WireType::LengthDelimited, buf);
            encode_varint(raw.len() as u64, buf);
            buf.put_slice(&raw);
        }
        Type::Enum => {
            let number = match value {
                Value::Number(n) => n.as_i64(),
                Value::String(s) => enum_number(set, field.type_name.as_deref().unwrap_or(""), s),
                _ => None,
            };
            expect(number.is_some(), "enum name or number")?;
            encode_key(tag, WireType::Varint, buf);
            encode_varint(number.unwrap_or(0) as u64, buf);
        }
        Type::Message => {
            let nested = encode_message(set, field.type_name.as_deref().unwrap_or(""), value)?;
            encode_key(tag, WireType::LengthDelimited, buf);
            encode_varint(nested.len() as u64, buf);
            buf.put_slice(&nested);
        }
        Type::Group => {
            return Err(decode_err(format!("field {name}: proto2 groups are unsupported")));
        }
    }
    Ok(())
}

fn enum_number(set: &FileDescriptorSet, type_name: &str, variant: &str) -> Option<i64> {
    let wanted = type_name.trim_start_matches('.');
    for file in &set.file {
        let package = file.package.as_deref().unwrap_or("");
        let rest = if package.is_empty() {
            wanted
        } else {
            match wanted.strip_prefix(package).and_then(|r| r.strip_prefix('.')) {
                Some(rest) => rest,
                None => continue,
            }
        };
        for e in &file.enum_type {
            if e.name.as_deref() == Some(rest) {
                return e
                    .value
                    .iter()
                    .find(|v| v.name.as_deref() == Some(variant))
                    .and_then(|v| v.number.map(i64::from));
            }
        }
    }
    None
}

// -- decoding ---------------------------------------------------------------

/// Decode wire bytes of a message type into JSON.
pub fn decode_message(
    set: &FileDescriptorSet,
    type_name: &str,
    bytes: &[u8],
) -> Result<Value, GatewayError> {
    let descriptor = find_message(set, type_name)?;
    let mut map = serde_json::Map::new();
    let mut buf = bytes;

    while buf.has_remaining() {
        let (tag, wire_type) = decode_key(&mut buf)
            .map_err(|e| decode_err(format!("wire key decode failed: {e}")))?;
        let field = descriptor
            .field
            .iter()
            .find(|f| f.number == Some(i32::try_from(tag).unwrap_or(-1)));

        let Some(field) = field else {
            skip_field(wire_type, &mut buf)?;
            continue;
        };
        let name = field.name.clone().unwrap_or_default();

        // Packed repeated scalars arrive length-delimited.
        if is_repeated(field)
            && wire_type == WireType::LengthDelimited
            && scalar_wire_type(field_type(field)).is_some()
        {
            let values = decode_packed(field, &mut buf)?;
            match map.entry(name).or_insert_with(|| Value::Array(Vec::new())) {
                Value::Array(items) => items.extend(values),
                _ => unreachable!("repeated field always holds an array"),
            }
            continue;
        }

        let value = decode_field(set, field, wire_type, &mut buf)?;
        if is_repeated(field) {
            match map.entry(name).or_insert_with(|| Value::Array(Vec::new())) {
                Value::Array(items) => items.push(value),
                _ => unreachable!("repeated field always holds an array"),
            }
        } else {
            map.insert(name, value);
        }
    }
    Ok(Value::Object(map))
}

/// The wire type a scalar field uses when not packed; `None` for
/// length-delimited and message types.
fn scalar_wire_type(ty: Type) -> Option<WireType> {
    match ty {
        Type::Bool
        | Type::Int32
        | Type::Int64
        | Type::Uint32
        | Type::Uint64
        | Type::Sint32
        | Type::Sint64
        | Type::Enum => Some(WireType::Varint),
        Type::Double | Type::Fixed64 | Type::Sfixed64 => Some(WireType::SixtyFourBit),
        Type::Float | Type::Fixed32 | Type::Sfixed32 => Some(WireType::ThirtyTwoBit),
        _ => None,
    }
}

/// Decode a packed repeated scalar field into its element values.
fn decode_packed(
    field: &FieldDescriptorProto,
    buf: &mut &[u8],
) -> Result<Vec<Value>, GatewayError> {
    let len = decode_varint(buf).map_err(|e| decode_err(format!("packed length: {e}")))?;
    let len = usize::try_from(len).map_err(|_| decode_err("packed length overflow"))?;
    if buf.remaining() < len {
        return Err(decode_err("truncated packed field"));
    }
    let mut inner = &buf[..len];
    buf.advance(len);

    let element_wire = scalar_wire_type(field_type(field))
        .ok_or_else(|| decode_err("packed encoding on non-scalar field"))?;
    let mut values = Vec::new();
    // The dummy set is never consulted for scalar decode.
    let empty = FileDescriptorSet { file: vec![] };
    while inner.has_remaining() {
        values.push(decode_field(&empty, field, element_wire, &mut inner)?);
    }
    Ok(values)
}

fn skip_field(wire_type: WireType, buf: &mut &[u8]) -> Result<(), GatewayError> {
    match wire_type {
        WireType::Varint => {
            decode_varint(buf).map_err(|e| decode_err(format!("skip varint: {e}")))?;
        }
        WireType::SixtyFourBit => {
            if buf.remaining() < 8 {
                return Err(decode_err("truncated fixed64"));
            }
            buf.advance(8);
        }
        WireType::ThirtyTwoBit => {
            if buf.remaining() < 4 {
                return Err(decode_err("truncated fixed32"));
            }
            buf.advance(4);
        }
        WireType::LengthDelimited => {
            let len = decode_varint(buf).map_err(|e| decode_err(format!("skip length: {e}")))?;
            let len = usize::try_from(len).map_err(|_| decode_err("length overflow"))?;
            if buf.remaining() < len {
                return Err(decode_err("truncated length-delimited field"));
            }
            buf.advance(len);
        }
        WireType::StartGroup | WireType::EndGroup => {
            return Err(decode_err("proto2 groups are unsupported"));
        }
    }
    Ok(())
}

#[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
fn decode_field(
    set: &FileDescriptorSet,
    field: &FieldDescriptorProto,
    wire_type: WireType,
    buf: &mut &[u8],
) -> Result<Value, GatewayError> {
    let read_varint = |buf: &mut &[u8]| {
        decode_varint(buf).map_err(|e| decode_err(format!("varint decode failed: {e}")))
    };
    let read_bytes = |buf: &mut &[u8]| -> Result<Vec<u8>, GatewayError> {
        let len = decode_varint(buf).map_err(|e| decode_err(format!("length decode: {e}")))?;
        let len = usize::try_from(len).map_err(|_| decode_err("length overflow"))?;
        if buf.remaining() < len {
            return Err(decode_err("truncated length-delimited field"));
        }
        let out = buf[..len].to_vec();
        buf.advance(len);
        Ok(out)
    };

    Ok(match field_type(field) {
        Type::Bool => Value::Bool(read_varint(buf)? != 0),
        Type::Int32 | Type::Int64 => Value::from(read_varint(buf)? as i64),
        Type::Uint32 | Type::Uint64 => Value::from(read_varint(buf)?),
        Type::Sint32 | Type::Sint64 => {
            let raw = read_varint(buf)?;
            Value::from(((raw >> 1) as i64) ^ -((raw & 1) as i64))
        }
        Type::Double => {
            if buf.remaining() < 8 {
                return Err(decode_err("truncated double"));
            }
            let v = buf.get_f64_le();
            Value::from(v)
        }
        Type::Float => {
            if buf.remaining() < 4 {
                return Err(decode_err("truncated float"));
            }
            let v = buf.get_f32_le();
            Value::from(f64::from(v))
        }
        Type::Fixed64 => {
            if buf.remaining() < 8 {
                return Err(decode_err("truncated fixed64"));
            }
            Value::from(buf.get_u64_le())
        }
        Type::Fixed32 => {
            if buf.remaining() < 4 {
                return Err(decode_err("truncated fixed32"));
            }
            Value::from(buf.get_u32_le())
        }
        Type::Sfixed64 => {
            if buf.remaining() < 8 {
                return Err(decode_err("truncated sfixed64"));
            }
            Value::from(buf.get_i64_le())
        }
        Type::Sfixed32 => {
            if buf.remaining() < 4 {
                return Err(decode_err("truncated sfixed32"));
            }
            Value::from(buf.get_i32_le())
        }
        Type::String => {
            let raw = read_bytes(buf)?;
            Value::String(
                String::from_utf8(raw)
                    .map_err(|e| decode_err(format!("invalid UTF-8 string: {e}")))?,
            )
        }
        Type::Bytes => Value::String(B64.encode(read_bytes(buf)?)),
        Type::Enum => Value::from(read_varint(buf)? as i64),
        Type::Message => {
            let raw = read_bytes(buf)?;
            decode_message(set, field.type_name.as_deref().unwrap_or(""), &raw)?
        }
        Type::Group => {
            let _ = wire_type;
            return Err(decode_err("proto2 groups are unsupported"));
        }
    })
}
