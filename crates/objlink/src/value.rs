// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Dynamic value tree exchanged between peers.
//!
//! [`Value`] is the closed set of shapes the codec knows how to put on the
//! wire: scalars, binary blobs, sequences, string-keyed mappings, plus the
//! three reference-bearing forms:
//!
//! - [`Value::Object`] - a value owned by the local process, transmitted by
//!   reference through the local server's registry
//! - [`Value::Proxy`] - a handle to a value owned by another process,
//!   transmitted as its descriptor without dereferencing
//! - [`Value::Blob`] - an opaque by-value encoding produced by a registered
//!   blob handler
//!
//! [`Value::Array`] is the packed numeric-array form used when the array
//! codec plug-in is negotiated.

use std::collections::BTreeMap;
use std::fmt;

use crate::object::ServerObject;
use crate::proxy::ObjectProxy;

/// String-keyed mapping used for `kwargs` and map payloads.
pub type ValueMap = BTreeMap<String, Value>;

/// A tree of wire-encodable values.
#[derive(Clone, Default)]
pub enum Value {
    /// Absent / null
    #[default]
    None,
    /// Boolean
    Bool(bool),
    /// Signed integer
    Int(i64),
    /// IEEE-754 double
    Float(f64),
    /// UTF-8 string
    Str(String),
    /// Raw bytes
    Bytes(Vec<u8>),
    /// Ordered sequence
    List(Vec<Value>),
    /// String-keyed mapping
    Map(ValueMap),
    /// Locally owned object, sent by reference
    Object(ServerObject),
    /// Remotely owned object, sent as its descriptor
    Proxy(ObjectProxy),
    /// Opaque by-value encoding of a non-primitive value
    Blob(Blob),
    /// Packed numeric array (codec plug-in)
    Array(NdArray),
}

impl Value {
    /// Wire-facing name of this value's shape.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::None => "none",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Object(_) => "object",
            Value::Proxy(_) => "proxy",
            Value::Blob(_) => "blob",
            Value::Array(_) => "array",
        }
    }

    /// Integer accessor.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Float accessor (integers widen).
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Boolean accessor.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// String accessor.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(v) => Some(v),
            _ => None,
        }
    }

    /// Byte-slice accessor.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(v) => Some(v),
            _ => None,
        }
    }

    /// Sequence accessor.
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(v) => Some(v),
            _ => None,
        }
    }

    /// Mapping accessor.
    pub fn as_map(&self) -> Option<&ValueMap> {
        match self {
            Value::Map(v) => Some(v),
            _ => None,
        }
    }

    /// Proxy accessor.
    pub fn as_proxy(&self) -> Option<&ObjectProxy> {
        match self {
            Value::Proxy(p) => Some(p),
            _ => None,
        }
    }

    /// Local object accessor.
    pub fn as_object(&self) -> Option<&ServerObject> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    /// True for `Value::None`.
    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    /// Cheap recursive size estimate in encoded bytes.
    ///
    /// Used by the `auto` return-mode policy to decide between by-value and
    /// by-reference. Accuracy is not required, only monotonicity with the
    /// real encoded size.
    pub fn approx_size(&self) -> usize {
        match self {
            Value::None | Value::Bool(_) => 1,
            Value::Int(_) | Value::Float(_) => 9,
            Value::Str(s) => 5 + s.len(),
            Value::Bytes(b) => 5 + b.len(),
            Value::List(items) => 5 + items.iter().map(Value::approx_size).sum::<usize>(),
            Value::Map(map) => {
                5 + map
                    .iter()
                    .map(|(k, v)| 5 + k.len() + v.approx_size())
                    .sum::<usize>()
            }
            Value::Object(_) | Value::Proxy(_) => 64,
            Value::Blob(b) => 10 + b.type_name.len() + b.data.len(),
            Value::Array(a) => 32 + a.data.len(),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "None"),
            Value::Bool(v) => write!(f, "Bool({})", v),
            Value::Int(v) => write!(f, "Int({})", v),
            Value::Float(v) => write!(f, "Float({})", v),
            Value::Str(v) => write!(f, "Str({:?})", v),
            Value::Bytes(v) => write!(f, "Bytes(<{} bytes>)", v.len()),
            Value::List(v) => f.debug_tuple("List").field(v).finish(),
            Value::Map(v) => f.debug_tuple("Map").field(v).finish(),
            Value::Object(o) => write!(f, "Object(<{}>)", o.type_name()),
            Value::Proxy(p) => write!(f, "Proxy({:?})", p.descriptor()),
            Value::Blob(b) => write!(f, "Blob({}, <{} bytes>)", b.type_name, b.data.len()),
            Value::Array(a) => write!(f, "Array({}, {:?})", a.dtype, a.shape),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            // Object identity is the Arc data pointer
            (Value::Object(a), Value::Object(b)) => {
                crate::object::object_ptr(a) == crate::object::object_ptr(b)
            }
            (Value::Proxy(a), Value::Proxy(b)) => a == b,
            (Value::Blob(a), Value::Blob(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Int(v as i64)
    }
}

impl From<usize> for Value {
    fn from(v: usize) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

impl From<ValueMap> for Value {
    fn from(v: ValueMap) -> Self {
        Value::Map(v)
    }
}

impl From<ObjectProxy> for Value {
    fn from(v: ObjectProxy) -> Self {
        Value::Proxy(v)
    }
}

impl From<ServerObject> for Value {
    fn from(v: ServerObject) -> Self {
        Value::Object(v)
    }
}

// ============================================================================
// Opaque blobs and packed arrays
// ============================================================================

/// Opaque by-value encoding of a non-primitive value.
///
/// Produced by the sending side's blob handler; decoded by the matching
/// handler registered under the same `type_name` on the receiving side.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Blob {
    /// Registered handler name
    pub type_name: String,
    /// Handler-defined payload
    pub data: Vec<u8>,
}

/// Packed numeric array, exchanged when the array plug-in is negotiated.
///
/// Layout mirrors the buffer protocol: element type tag, dimensions,
/// per-dimension byte strides, and the raw bytes in C order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NdArray {
    /// Element type tag, e.g. `"f64"`, `"i32"`, `"u8"`
    pub dtype: String,
    /// Dimension sizes
    pub shape: Vec<u64>,
    /// Per-dimension strides in bytes
    pub strides: Vec<i64>,
    /// Raw element bytes
    pub data: Vec<u8>,
}

impl NdArray {
    /// Contiguous (C-order) array from raw parts.
    pub fn contiguous(dtype: impl Into<String>, shape: Vec<u64>, data: Vec<u8>) -> Self {
        let dtype = dtype.into();
        let elem = match dtype.as_str() {
            "u8" | "i8" | "bool" => 1,
            "u16" | "i16" => 2,
            "u32" | "i32" | "f32" => 4,
            _ => 8,
        };
        let mut strides = vec![0i64; shape.len()];
        let mut acc = elem as i64;
        for (i, dim) in shape.iter().enumerate().rev() {
            strides[i] = acc;
            acc *= *dim as i64;
        }
        Self {
            dtype,
            shape,
            strides,
            data,
        }
    }
}

// ============================================================================
// Capabilities
// ============================================================================

/// Bitmap of polymorphic operations a target supports.
///
/// Precomputed once per registry entry and carried inside every
/// [`ProxyDescriptor`] so proxies can be constructed without a follow-up
/// round trip.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Capabilities(pub u16);

impl Capabilities {
    /// Target is callable
    pub const CALL: Self = Self(0x0001);
    /// Target supports indexed reads
    pub const GETITEM: Self = Self(0x0002);
    /// Target supports indexed writes
    pub const SETITEM: Self = Self(0x0004);
    /// Target is iterable
    pub const ITER: Self = Self(0x0008);
    /// Target has a length
    pub const LEN: Self = Self(0x0010);
    /// Target supports equality comparison
    pub const CMP_EQ: Self = Self(0x0020);
    /// Target supports ordering comparison
    pub const CMP_ORD: Self = Self(0x0040);
    /// Target bears named attributes
    pub const GETATTR: Self = Self(0x0080);
    /// Target is a context (reserved, no opcode consumes it)
    pub const CONTEXT: Self = Self(0x0100);
    /// Target exposes a packed buffer
    pub const BUFFER: Self = Self(0x0200);

    /// No capabilities
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Check if all bits of `flag` are set.
    pub const fn contains(self, flag: Self) -> bool {
        (self.0 & flag.0) == flag.0
    }

    /// Union of two capability sets.
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl std::ops::BitOr for Capabilities {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

// ============================================================================
// Proxy descriptors
// ============================================================================

/// One step of a lazily composed attribute chain.
///
/// Descriptors carry names and item keys; the round trip happens at the
/// terminal operation, which resolves the whole path server-side.
#[derive(Clone, Debug, PartialEq)]
pub enum PathSeg {
    /// Named attribute access
    Attr(String),
    /// Keyed item access
    Item(Value),
}

/// Wire-serializable identity of a remote value.
///
/// Two descriptors denote the same live object iff their
/// `(server_address, object_id, path)` are equal.
#[derive(Clone, Debug, PartialEq)]
pub struct ProxyDescriptor {
    /// Authoritative location of the owning server
    pub server_address: String,
    /// Registry id on the owning server (never 0 for user objects)
    pub object_id: u64,
    /// Type name recorded when the object first left its server
    pub type_name: String,
    /// Operations the root object responds to
    pub caps: Capabilities,
    /// Lazily composed attribute/item chain
    pub path: Vec<PathSeg>,
}

impl ProxyDescriptor {
    /// Descriptor with one more path segment appended.
    pub fn extended(&self, seg: PathSeg) -> Self {
        let mut path = self.path.clone();
        path.push(seg);
        Self {
            server_address: self.server_address.clone(),
            object_id: self.object_id,
            type_name: self.type_name.clone(),
            caps: self.caps,
            path,
        }
    }
}
