// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! MessagePack codec for frames and values.
//!
//! The primitive set (null, bool, integer, float, string, binary,
//! sequence, string-keyed mapping) maps 1:1 onto MessagePack. Everything
//! else travels as a tagged record: a map carrying the reserved key
//! [`RECORD_KEY`], distinct from any user payload by convention.
//!
//! Three records exist:
//!
//! - `proxy` - a [`ProxyDescriptor`]. Encoding a local object registers it
//!   with the encoding side's server (refusing with `NO_LOCAL_SERVER` when
//!   there is none). Decoding resolves per the descriptor's authoritative
//!   address: the home server gets its original value back (identity),
//!   everyone else gets a proxy through a lazily created client.
//! - `blob` - opaque by-value fallback produced by a value's blob form.
//!   A receiver without the matching handler passes the blob through
//!   unchanged, so identity survives a second round trip.
//! - `array` - packed numeric array, emitted only when the array plug-in
//!   is negotiated; otherwise buffer-capable values go by reference.

use std::collections::HashMap;
use std::io::Cursor;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::SerializerKind;
use crate::error::{RpcError, RpcResult};
use crate::object::{resolve_path, Resolved};
use crate::server::Server;
use crate::value::{Blob, Capabilities, NdArray, ProxyDescriptor, Value, ValueMap};
use crate::wire::{decode_path, encode_path, Frame};

/// Reserved map key marking a tagged record.
pub const RECORD_KEY: &str = "__objlink__";

/// Encoding context: where by-reference values are homed and which peer
/// the bytes are destined for (reference attribution).
pub(crate) struct EncodeCtx {
    pub server: Option<Server>,
    pub peer: String,
}

/// Decoding context: the server owning this side of the session (used to
/// resolve descriptors that point back home) and the client whose session
/// the bytes arrived on (so its own proxies bind to it).
pub(crate) struct DecodeCtx {
    pub home: Option<Server>,
    pub client: Option<crate::client::Client>,
}

/// Frame/value codec with serializer options.
#[derive(Clone, Debug)]
pub struct Codec {
    arrays: bool,
}

impl Codec {
    /// Codec for the given serializer selection.
    pub fn new(kind: SerializerKind) -> Self {
        Self {
            arrays: kind == SerializerKind::MsgpackArrays,
        }
    }

    /// Whether the packed array record is negotiated.
    pub fn arrays(&self) -> bool {
        self.arrays
    }

    /// Encode one frame for the wire.
    pub(crate) fn encode_frame(&self, frame: Frame, ctx: &EncodeCtx) -> RpcResult<Vec<u8>> {
        let tree = self.to_rmpv(frame.into_value(), ctx)?;
        let mut buf = Vec::with_capacity(128);
        rmpv::encode::write_value(&mut buf, &tree)
            .map_err(|e| RpcError::Protocol(format!("encode failed: {}", e)))?;
        Ok(buf)
    }

    /// Decode one frame from the wire.
    pub(crate) fn decode_frame(&self, bytes: &[u8], ctx: &DecodeCtx) -> RpcResult<Frame> {
        let mut cursor = Cursor::new(bytes);
        let tree = rmpv::decode::read_value(&mut cursor)
            .map_err(|e| RpcError::Protocol(format!("decode failed: {}", e)))?;
        Frame::from_value(self.from_rmpv(tree, ctx)?)
    }

    fn to_rmpv(&self, value: Value, ctx: &EncodeCtx) -> RpcResult<rmpv::Value> {
        Ok(match value {
            Value::None => rmpv::Value::Nil,
            Value::Bool(v) => rmpv::Value::Boolean(v),
            Value::Int(v) => rmpv::Value::from(v),
            Value::Float(v) => rmpv::Value::F64(v),
            Value::Str(v) => rmpv::Value::from(v),
            Value::Bytes(v) => rmpv::Value::Binary(v),
            Value::List(items) => rmpv::Value::Array(
                items
                    .into_iter()
                    .map(|item| self.to_rmpv(item, ctx))
                    .collect::<RpcResult<_>>()?,
            ),
            Value::Map(map) => rmpv::Value::Map(
                map.into_iter()
                    .map(|(k, v)| Ok((rmpv::Value::from(k), self.to_rmpv(v, ctx)?)))
                    .collect::<RpcResult<_>>()?,
            ),
            Value::Object(obj) => {
                let server = ctx.server.as_ref().ok_or(RpcError::NoLocalServer)?;
                let desc = server.register_for_peer(&obj, &ctx.peer);
                self.proxy_record(&desc, ctx)?
            }
            Value::Proxy(proxy) => self.proxy_record(&proxy.descriptor(), ctx)?,
            Value::Blob(blob) => self.blob_record(blob),
            Value::Array(array) => {
                if self.arrays {
                    self.array_record(array)
                } else {
                    // Plug-in absent: the array goes by reference instead
                    let server = ctx.server.as_ref().ok_or(RpcError::NoLocalServer)?;
                    let cell = crate::object::ValueCell::new(Value::Array(array));
                    let desc = server.register_for_peer(&cell, &ctx.peer);
                    self.proxy_record(&desc, ctx)?
                }
            }
        })
    }

    fn proxy_record(&self, desc: &ProxyDescriptor, ctx: &EncodeCtx) -> RpcResult<rmpv::Value> {
        let path = self.to_rmpv(encode_path(&desc.path), ctx)?;
        Ok(rmpv::Value::Map(vec![
            (rmpv::Value::from(RECORD_KEY), rmpv::Value::from("proxy")),
            (
                rmpv::Value::from("addr"),
                rmpv::Value::from(desc.server_address.as_str()),
            ),
            (rmpv::Value::from("id"), rmpv::Value::from(desc.object_id)),
            (
                rmpv::Value::from("type"),
                rmpv::Value::from(desc.type_name.as_str()),
            ),
            (
                rmpv::Value::from("caps"),
                rmpv::Value::from(desc.caps.0 as u64),
            ),
            (rmpv::Value::from("path"), path),
        ]))
    }

    fn blob_record(&self, blob: Blob) -> rmpv::Value {
        rmpv::Value::Map(vec![
            (rmpv::Value::from(RECORD_KEY), rmpv::Value::from("blob")),
            (
                rmpv::Value::from("type"),
                rmpv::Value::from(blob.type_name.as_str()),
            ),
            (rmpv::Value::from("data"), rmpv::Value::Binary(blob.data)),
        ])
    }

    fn array_record(&self, array: NdArray) -> rmpv::Value {
        rmpv::Value::Map(vec![
            (rmpv::Value::from(RECORD_KEY), rmpv::Value::from("array")),
            (
                rmpv::Value::from("dtype"),
                rmpv::Value::from(array.dtype.as_str()),
            ),
            (
                rmpv::Value::from("shape"),
                rmpv::Value::Array(array.shape.iter().map(|&d| rmpv::Value::from(d)).collect()),
            ),
            (
                rmpv::Value::from("strides"),
                rmpv::Value::Array(array.strides.iter().map(|&s| rmpv::Value::from(s)).collect()),
            ),
            (rmpv::Value::from("data"), rmpv::Value::Binary(array.data)),
        ])
    }

    fn from_rmpv(&self, value: rmpv::Value, ctx: &DecodeCtx) -> RpcResult<Value> {
        Ok(match value {
            rmpv::Value::Nil => Value::None,
            rmpv::Value::Boolean(v) => Value::Bool(v),
            rmpv::Value::Integer(v) => Value::Int(
                v.as_i64()
                    .ok_or_else(|| RpcError::Protocol(format!("integer out of range: {}", v)))?,
            ),
            rmpv::Value::F32(v) => Value::Float(v as f64),
            rmpv::Value::F64(v) => Value::Float(v),
            rmpv::Value::String(s) => Value::Str(
                s.into_str()
                    .ok_or_else(|| RpcError::Protocol("invalid utf-8 string".into()))?,
            ),
            rmpv::Value::Binary(b) => Value::Bytes(b),
            rmpv::Value::Array(items) => Value::List(
                items
                    .into_iter()
                    .map(|item| self.from_rmpv(item, ctx))
                    .collect::<RpcResult<_>>()?,
            ),
            rmpv::Value::Map(pairs) => {
                let mut map = ValueMap::new();
                let mut record_tag: Option<String> = None;
                for (key, val) in pairs {
                    let key = match key {
                        rmpv::Value::String(s) => s
                            .into_str()
                            .ok_or_else(|| RpcError::Protocol("invalid utf-8 map key".into()))?,
                        other => {
                            return Err(RpcError::Protocol(format!(
                                "non-string map key: {}",
                                other
                            )))
                        }
                    };
                    let val = self.from_rmpv(val, ctx)?;
                    if key == RECORD_KEY {
                        match val {
                            Value::Str(tag) => record_tag = Some(tag),
                            other => {
                                return Err(RpcError::Protocol(format!(
                                    "bad record tag: {:?}",
                                    other
                                )))
                            }
                        }
                    } else {
                        map.insert(key, val);
                    }
                }
                match record_tag.as_deref() {
                    None => Value::Map(map),
                    Some("proxy") => self.decode_proxy_record(map, ctx)?,
                    Some("blob") => self.decode_blob_record(map)?,
                    Some("array") => self.decode_array_record(map)?,
                    Some(other) => {
                        return Err(RpcError::Protocol(format!("unknown record '{}'", other)))
                    }
                }
            }
            rmpv::Value::Ext(tag, _) => {
                return Err(RpcError::Protocol(format!("unexpected ext type {}", tag)))
            }
        })
    }

    fn decode_proxy_record(&self, mut map: ValueMap, ctx: &DecodeCtx) -> RpcResult<Value> {
        let server_address = record_str(&mut map, "addr")?;
        let object_id = record_u64(&mut map, "id")?;
        let type_name = record_str(&mut map, "type")?;
        let caps = Capabilities(record_u64(&mut map, "caps")? as u16);
        let path = decode_path(&map.remove("path").unwrap_or(Value::List(Vec::new())))?;
        let desc = ProxyDescriptor {
            server_address,
            object_id,
            type_name,
            caps,
            path,
        };

        // Invariant: deserializing in the home server yields the original
        // value, not a new proxy
        if let Some(home) = &ctx.home {
            if home.address() == desc.server_address {
                let obj = home
                    .registry()
                    .get(desc.object_id)
                    .ok_or(RpcError::UnknownObject(desc.object_id))?;
                return match resolve_path(&obj, &desc.path)? {
                    Resolved::Object(o) => Ok(Value::Object(o)),
                    Resolved::Plain(v) => Ok(v),
                };
            }
        }

        // A proxy into the server this session already talks to binds to
        // the receiving client; anything else goes through the per-process
        // client table, dialing lazily
        if let Some(client) = &ctx.client {
            if client.address() == desc.server_address {
                return Ok(Value::Proxy(client.proxy_from_descriptor(desc)));
            }
        }
        let client = crate::client::Client::get_or_connect(&desc.server_address, ctx.home.clone())?;
        Ok(Value::Proxy(client.proxy_from_descriptor(desc)))
    }

    fn decode_blob_record(&self, mut map: ValueMap) -> RpcResult<Value> {
        let type_name = record_str(&mut map, "type")?;
        let data = match map.remove("data") {
            Some(Value::Bytes(b)) => b,
            other => return Err(RpcError::Protocol(format!("bad blob data: {:?}", other))),
        };
        match decode_blob(&type_name, &data) {
            Some(Ok(value)) => Ok(value),
            Some(Err(e)) => Err(RpcError::Unserializable(format!(
                "blob '{}' failed to decode: {}",
                type_name, e
            ))),
            // No handler registered: pass the blob through untouched
            None => Ok(Value::Blob(Blob { type_name, data })),
        }
    }

    fn decode_array_record(&self, mut map: ValueMap) -> RpcResult<Value> {
        let dtype = record_str(&mut map, "dtype")?;
        let shape = match map.remove("shape") {
            Some(Value::List(items)) => items
                .iter()
                .map(|v| v.as_int().map(|i| i as u64))
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| RpcError::Protocol("bad array shape".into()))?,
            other => return Err(RpcError::Protocol(format!("bad array shape: {:?}", other))),
        };
        let strides = match map.remove("strides") {
            Some(Value::List(items)) => items
                .iter()
                .map(Value::as_int)
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| RpcError::Protocol("bad array strides".into()))?,
            other => {
                return Err(RpcError::Protocol(format!("bad array strides: {:?}", other)))
            }
        };
        let data = match map.remove("data") {
            Some(Value::Bytes(b)) => b,
            other => return Err(RpcError::Protocol(format!("bad array data: {:?}", other))),
        };
        Ok(Value::Array(NdArray {
            dtype,
            shape,
            strides,
            data,
        }))
    }
}

fn record_str(map: &mut ValueMap, key: &str) -> RpcResult<String> {
    match map.remove(key) {
        Some(Value::Str(s)) => Ok(s),
        other => Err(RpcError::Protocol(format!(
            "missing or bad record field '{}': {:?}",
            key, other
        ))),
    }
}

fn record_u64(map: &mut ValueMap, key: &str) -> RpcResult<u64> {
    match map.remove(key) {
        Some(Value::Int(v)) if v >= 0 => Ok(v as u64),
        other => Err(RpcError::Protocol(format!(
            "missing or bad record field '{}': {:?}",
            key, other
        ))),
    }
}

// ============================================================================
// Opaque blob handlers
// ============================================================================

type BlobDecodeFn = Box<dyn Fn(&[u8]) -> Result<Value, String> + Send + Sync>;

static BLOB_HANDLERS: RwLock<Option<HashMap<String, BlobDecodeFn>>> = RwLock::new(None);

/// Register a raw blob decoder for `type_name`.
pub fn register_blob_decoder<F>(type_name: impl Into<String>, decode: F)
where
    F: Fn(&[u8]) -> Result<Value, String> + Send + Sync + 'static,
{
    BLOB_HANDLERS
        .write()
        .get_or_insert_with(HashMap::new)
        .insert(type_name.into(), Box::new(decode));
}

/// Register a typed blob handler: payloads deserialize as `T` and
/// `rebuild` turns the value back into its in-process form.
pub fn register_blob_handler<T, F>(type_name: impl Into<String>, rebuild: F)
where
    T: DeserializeOwned,
    F: Fn(T) -> Value + Send + Sync + 'static,
{
    register_blob_decoder(type_name, move |bytes| {
        rmp_serde::from_slice::<T>(bytes)
            .map(&rebuild)
            .map_err(|e| e.to_string())
    });
}

/// Encode a serializable value as a blob for [`RemoteObject::to_blob`]
/// implementations.
///
/// [`RemoteObject::to_blob`]: crate::object::RemoteObject::to_blob
pub fn blob_from<T: Serialize>(type_name: impl Into<String>, value: &T) -> Option<Blob> {
    rmp_serde::to_vec_named(value).ok().map(|data| Blob {
        type_name: type_name.into(),
        data,
    })
}

fn decode_blob(type_name: &str, data: &[u8]) -> Option<Result<Value, String>> {
    let guard = BLOB_HANDLERS.read();
    let handlers = guard.as_ref()?;
    handlers.get(type_name).map(|f| f(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{Mode, Opcode, ReturnMode};

    fn codec() -> Codec {
        Codec::new(SerializerKind::Msgpack)
    }

    fn no_ctx() -> (EncodeCtx, DecodeCtx) {
        (
            EncodeCtx {
                server: None,
                peer: "test".into(),
            },
            DecodeCtx {
                home: None,
                client: None,
            },
        )
    }

    fn roundtrip(frame: Frame) -> Frame {
        let (enc, dec) = no_ctx();
        let bytes = codec().encode_frame(frame, &enc).unwrap();
        codec().decode_frame(&bytes, &dec).unwrap()
    }

    #[test]
    fn plain_request_roundtrip() {
        let frame = Frame::request(5, Opcode::Call, 3, vec![])
            .with_args(vec![
                Value::Int(-2),
                Value::Float(0.5),
                Value::Str("x".into()),
                Value::Bytes(vec![1, 2, 3]),
                Value::Bool(true),
                Value::None,
            ])
            .with_mode(Mode::Async)
            .with_return_mode(ReturnMode::Value);
        let decoded = roundtrip(frame.clone());
        assert_eq!(decoded, frame);
    }

    #[test]
    fn nested_containers_roundtrip() {
        let mut inner = ValueMap::new();
        inner.insert("k2".into(), Value::Int(9));
        let mut outer = ValueMap::new();
        outer.insert("k".into(), Value::Map(inner));
        outer.insert("l".into(), Value::List(vec![Value::Int(1), Value::Str("a".into())]));

        let frame = Frame::reply_ok(1, Value::Map(outer));
        let decoded = roundtrip(frame.clone());
        assert_eq!(decoded.payload, frame.payload);
    }

    #[test]
    fn object_without_local_server_is_refused() {
        let (enc, _) = no_ctx();
        let obj = crate::object::ValueCell::new(Value::Int(1));
        let frame = Frame::request(1, Opcode::Call, 2, vec![]).with_args(vec![Value::Object(obj)]);
        match codec().encode_frame(frame, &enc) {
            Err(RpcError::NoLocalServer) => {}
            other => panic!("expected NoLocalServer, got {:?}", other),
        }
    }

    #[test]
    fn unhandled_blob_passes_through() {
        let blob = Blob {
            type_name: "test.unregistered".into(),
            data: vec![9, 9, 9],
        };
        let frame = Frame::reply_ok(1, Value::Blob(blob.clone()));
        let decoded = roundtrip(frame);
        assert_eq!(decoded.payload, Value::Blob(blob));
    }

    #[test]
    fn registered_blob_decodes() {
        register_blob_handler("test.point", |coords: (i64, i64)| {
            Value::List(vec![Value::Int(coords.0), Value::Int(coords.1)])
        });
        let blob = blob_from("test.point", &(3i64, 4i64)).unwrap();
        let frame = Frame::reply_ok(1, Value::Blob(blob));
        let decoded = roundtrip(frame);
        assert_eq!(
            decoded.payload,
            Value::List(vec![Value::Int(3), Value::Int(4)])
        );
    }

    #[test]
    fn array_record_roundtrips_when_negotiated() {
        let codec = Codec::new(SerializerKind::MsgpackArrays);
        let (enc, dec) = no_ctx();
        let array = NdArray::contiguous("f64", vec![2, 2], vec![0u8; 32]);
        let frame = Frame::reply_ok(1, Value::Array(array.clone()));
        let bytes = codec.encode_frame(frame, &enc).unwrap();
        let decoded = codec.decode_frame(&bytes, &dec).unwrap();
        assert_eq!(decoded.payload, Value::Array(array));
    }

    #[test]
    fn array_without_plugin_needs_local_server() {
        let (enc, _) = no_ctx();
        let array = NdArray::contiguous("u8", vec![4], vec![0u8; 4]);
        let frame = Frame::reply_ok(1, Value::Array(array));
        match codec().encode_frame(frame, &enc) {
            Err(RpcError::NoLocalServer) => {}
            other => panic!("expected NoLocalServer, got {:?}", other),
        }
    }

    #[test]
    fn user_map_without_record_key_stays_a_map() {
        let mut map = ValueMap::new();
        map.insert("addr".into(), Value::Str("tcp://x:1".into()));
        map.insert("id".into(), Value::Int(1));
        let frame = Frame::reply_ok(1, Value::Map(map.clone()));
        let decoded = roundtrip(frame);
        assert_eq!(decoded.payload, Value::Map(map));
    }
}
