// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The dispatch surface for proxied values.
//!
//! Remote dispatch of arbitrary operations maps to a fixed opcode table;
//! [`RemoteObject`] is that table as a trait. A value becomes reachable by
//! reference once it is wrapped in a [`ServerObject`] and registered with a
//! server. Every method defaults to an unsupported-operation error so
//! implementors only write the operations their value actually answers;
//! [`RemoteObject::capabilities`] must advertise exactly the overridden set,
//! since the bitmap is precomputed per registry entry and shipped inside
//! descriptors.
//!
//! Methods take `&self`: execution is serialized per server, but a target
//! operation may call back through a proxy and re-enter the same object
//! (the reentrancy window). Implementors keep mutable state behind their
//! own locks and must not hold them across nested proxy calls.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::RemoteError;
use crate::value::{Blob, Capabilities, PathSeg, Value, ValueMap};

/// A shareable trait object hosting one proxied value.
///
/// Identity is the `Arc` pointer: registering the same `ServerObject` twice
/// yields the same object id.
pub type ServerObject = Arc<dyn RemoteObject>;

/// Wrap a concrete value as a [`ServerObject`].
pub fn into_object<T: RemoteObject + 'static>(value: T) -> ServerObject {
    Arc::new(value)
}

/// Identity key of an object: the `Arc` data pointer.
pub(crate) fn object_ptr(obj: &ServerObject) -> usize {
    Arc::as_ptr(obj) as *const () as usize
}

/// Comparison operators carried by the `cmp` opcode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompareOp {
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
}

impl CompareOp {
    /// Wire symbol.
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }

    /// Parse a wire symbol.
    pub fn from_symbol(s: &str) -> Option<Self> {
        match s {
            "==" => Some(Self::Eq),
            "!=" => Some(Self::Ne),
            "<" => Some(Self::Lt),
            "<=" => Some(Self::Le),
            ">" => Some(Self::Gt),
            ">=" => Some(Self::Ge),
            _ => None,
        }
    }

    /// Whether this operator needs ordering (vs equality only).
    pub fn needs_ordering(self) -> bool {
        !matches!(self, Self::Eq | Self::Ne)
    }
}

/// Operations a proxied value may answer.
pub trait RemoteObject: Send + Sync {
    /// Human-readable type name recorded in descriptors.
    fn type_name(&self) -> String;

    /// Operations this value answers. Must match the overridden methods.
    fn capabilities(&self) -> Capabilities {
        Capabilities::empty()
    }

    /// Invoke the value with positional and keyword arguments.
    fn call(&self, _args: &[Value], _kwargs: &ValueMap) -> Result<Value, RemoteError> {
        Err(RemoteError::unsupported("call"))
    }

    /// Fetch a named member.
    fn get_attr(&self, _name: &str) -> Result<Value, RemoteError> {
        Err(RemoteError::unsupported("getattr"))
    }

    /// Assign a named member.
    fn set_attr(&self, _name: &str, _value: Value) -> Result<(), RemoteError> {
        Err(RemoteError::unsupported("setattr"))
    }

    /// Keyed read.
    fn get_item(&self, _key: &Value) -> Result<Value, RemoteError> {
        Err(RemoteError::unsupported("getitem"))
    }

    /// Keyed write.
    fn set_item(&self, _key: Value, _value: Value) -> Result<(), RemoteError> {
        Err(RemoteError::unsupported("setitem"))
    }

    /// Keyed delete.
    fn del_item(&self, _key: &Value) -> Result<(), RemoteError> {
        Err(RemoteError::unsupported("delitem"))
    }

    /// Number of contained items.
    fn len(&self) -> Result<u64, RemoteError> {
        Err(RemoteError::unsupported("len"))
    }

    /// Structural comparison against a plain value.
    fn compare(&self, _op: CompareOp, _other: &Value) -> Result<bool, RemoteError> {
        Err(RemoteError::unsupported("cmp"))
    }

    /// Deep-copy value form, used by the `value` return mode and by the
    /// `auto` policy for copyable data. `None` means not copyable.
    fn snapshot(&self) -> Option<Value> {
        None
    }

    /// Opaque by-value form for the blob fallback. `None` means this value
    /// only travels by reference.
    fn to_blob(&self) -> Option<Blob> {
        None
    }
}

// ============================================================================
// FnObject - closures as callable objects
// ============================================================================

/// A closure exposed as a callable remote object.
///
/// The counterpart of publishing a function: remote peers see a value whose
/// only capability is `CALL`.
pub struct FnObject {
    name: String,
    func: Mutex<Box<dyn FnMut(&[Value], &ValueMap) -> Result<Value, RemoteError> + Send>>,
}

impl FnObject {
    /// Wrap a closure; `name` becomes the reported type name.
    pub fn new<F>(name: impl Into<String>, func: F) -> ServerObject
    where
        F: FnMut(&[Value], &ValueMap) -> Result<Value, RemoteError> + Send + 'static,
    {
        into_object(Self {
            name: name.into(),
            func: Mutex::new(Box::new(func)),
        })
    }
}

impl RemoteObject for FnObject {
    fn type_name(&self) -> String {
        format!("fn {}", self.name)
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::CALL
    }

    fn call(&self, args: &[Value], kwargs: &ValueMap) -> Result<Value, RemoteError> {
        // A function object calling itself through a proxy would deadlock
        // on its own closure; fail it instead
        let mut func = self.func.try_lock().ok_or_else(|| {
            RemoteError::raised("RecursionError", format!("reentrant call into {}", self.name))
        })?;
        (*func)(args, kwargs)
    }
}

// ============================================================================
// ValueCell - plain data as an owned object
// ============================================================================

/// A plain [`Value`] wrapped as an owned object.
///
/// Created when a by-value result is forced by reference (`proxy` return
/// mode) and used for the built-in item/len/cmp semantics of plain data
/// reached through an attribute chain.
pub struct ValueCell {
    value: Mutex<Value>,
    caps: Capabilities,
}

impl ValueCell {
    /// Wrap a value.
    pub fn new(value: Value) -> ServerObject {
        let caps = Self::caps_for(&value);
        into_object(Self {
            value: Mutex::new(value),
            caps,
        })
    }

    fn caps_for(value: &Value) -> Capabilities {
        let mut caps = Capabilities::CMP_EQ;
        match value {
            Value::List(_) | Value::Map(_) => {
                caps = caps
                    | Capabilities::GETITEM
                    | Capabilities::SETITEM
                    | Capabilities::ITER
                    | Capabilities::LEN;
            }
            Value::Str(_) | Value::Bytes(_) => {
                caps = caps | Capabilities::GETITEM | Capabilities::LEN;
            }
            Value::Int(_) | Value::Float(_) => {
                caps = caps | Capabilities::CMP_ORD;
            }
            Value::Array(_) => {
                caps = caps | Capabilities::BUFFER | Capabilities::LEN;
            }
            _ => {}
        }
        caps
    }
}

impl RemoteObject for ValueCell {
    fn type_name(&self) -> String {
        self.value.lock().kind_name().to_string()
    }

    fn capabilities(&self) -> Capabilities {
        self.caps
    }

    fn get_item(&self, key: &Value) -> Result<Value, RemoteError> {
        value_get_item(&self.value.lock(), key)
    }

    fn set_item(&self, key: Value, value: Value) -> Result<(), RemoteError> {
        let mut guard = self.value.lock();
        match (&mut *guard, &key) {
            (Value::List(items), Value::Int(i)) => {
                let idx = normalize_index(*i, items.len())?;
                items[idx] = value;
                Ok(())
            }
            (Value::Map(map), Value::Str(k)) => {
                map.insert(k.clone(), value);
                Ok(())
            }
            _ => Err(RemoteError::unsupported("setitem")),
        }
    }

    fn del_item(&self, key: &Value) -> Result<(), RemoteError> {
        let mut guard = self.value.lock();
        match (&mut *guard, key) {
            (Value::List(items), Value::Int(i)) => {
                let idx = normalize_index(*i, items.len())?;
                items.remove(idx);
                Ok(())
            }
            (Value::Map(map), Value::Str(k)) => map
                .remove(k)
                .map(|_| ())
                .ok_or_else(|| RemoteError::raised("KeyError", format!("no such key: {:?}", k))),
            _ => Err(RemoteError::unsupported("delitem")),
        }
    }

    fn len(&self) -> Result<u64, RemoteError> {
        match &*self.value.lock() {
            Value::Array(a) => Ok(a.shape.first().copied().unwrap_or(0)),
            other => value_len(other),
        }
    }

    fn compare(&self, op: CompareOp, other: &Value) -> Result<bool, RemoteError> {
        value_compare(&self.value.lock(), op, other)
    }

    fn snapshot(&self) -> Option<Value> {
        Some(self.value.lock().clone())
    }
}

// ============================================================================
// Attribute-chain resolution
// ============================================================================

/// Where a resolved attribute chain landed.
pub(crate) enum Resolved {
    /// An owned object; terminal ops dispatch through its trait
    Object(ServerObject),
    /// Plain data; terminal ops use the built-in value semantics
    Plain(Value),
}

/// Walk a descriptor path from its root object.
///
/// Attribute segments require an object; item segments also index plain
/// containers. A proxy reached mid-path is terminal data here - chains are
/// never forwarded through a third process.
pub(crate) fn resolve_path(root: &ServerObject, path: &[PathSeg]) -> Result<Resolved, RemoteError> {
    let mut current = Resolved::Object(Arc::clone(root));
    for seg in path {
        let next = match (&current, seg) {
            (Resolved::Object(obj), PathSeg::Attr(name)) => obj.get_attr(name)?,
            (Resolved::Object(obj), PathSeg::Item(key)) => obj.get_item(key)?,
            (Resolved::Plain(value), PathSeg::Item(key)) => value_get_item(value, key)?,
            (Resolved::Plain(_), PathSeg::Attr(name)) => {
                return Err(RemoteError::unsupported(format!("getattr {:?}", name)))
            }
        };
        current = match next {
            Value::Object(obj) => Resolved::Object(obj),
            other => Resolved::Plain(other),
        };
    }
    Ok(current)
}

// ============================================================================
// Built-in semantics for plain values
// ============================================================================

fn normalize_index(i: i64, len: usize) -> Result<usize, RemoteError> {
    let idx = if i < 0 { i + len as i64 } else { i };
    if idx < 0 || idx as usize >= len {
        return Err(RemoteError::raised(
            "IndexError",
            format!("index {} out of range for length {}", i, len),
        ));
    }
    Ok(idx as usize)
}

/// Keyed read on a plain value: integer index into lists, string key into
/// maps, integer index into strings/bytes.
pub(crate) fn value_get_item(value: &Value, key: &Value) -> Result<Value, RemoteError> {
    match (value, key) {
        (Value::List(items), Value::Int(i)) => {
            Ok(items[normalize_index(*i, items.len())?].clone())
        }
        (Value::Map(map), Value::Str(k)) => map
            .get(k)
            .cloned()
            .ok_or_else(|| RemoteError::raised("KeyError", format!("no such key: {:?}", k))),
        (Value::Str(s), Value::Int(i)) => {
            let chars: Vec<char> = s.chars().collect();
            let idx = normalize_index(*i, chars.len())?;
            Ok(Value::Str(chars[idx].to_string()))
        }
        (Value::Bytes(b), Value::Int(i)) => Ok(Value::Int(b[normalize_index(*i, b.len())?] as i64)),
        _ => Err(RemoteError::unsupported("getitem")),
    }
}

/// Length of a plain value.
pub(crate) fn value_len(value: &Value) -> Result<u64, RemoteError> {
    match value {
        Value::List(items) => Ok(items.len() as u64),
        Value::Map(map) => Ok(map.len() as u64),
        Value::Str(s) => Ok(s.chars().count() as u64),
        Value::Bytes(b) => Ok(b.len() as u64),
        _ => Err(RemoteError::unsupported("len")),
    }
}

/// Structural comparison of plain values. Ordering is defined for numbers
/// and strings; equality for everything.
pub(crate) fn value_compare(a: &Value, op: CompareOp, b: &Value) -> Result<bool, RemoteError> {
    match op {
        CompareOp::Eq => Ok(a == b),
        CompareOp::Ne => Ok(a != b),
        _ => {
            let ordering = match (a, b) {
                (Value::Int(x), Value::Int(y)) => x.partial_cmp(y),
                (Value::Str(x), Value::Str(y)) => x.partial_cmp(y),
                (Value::Bytes(x), Value::Bytes(y)) => x.partial_cmp(y),
                _ => match (a.as_float(), b.as_float()) {
                    (Some(x), Some(y)) => x.partial_cmp(&y),
                    _ => None,
                },
            };
            let ordering = ordering.ok_or_else(|| {
                RemoteError::raised(
                    "TypeError",
                    format!("cannot order {} against {}", a.kind_name(), b.kind_name()),
                )
            })?;
            Ok(match op {
                CompareOp::Lt => ordering.is_lt(),
                CompareOp::Le => ordering.is_le(),
                CompareOp::Gt => ordering.is_gt(),
                CompareOp::Ge => ordering.is_ge(),
                CompareOp::Eq | CompareOp::Ne => unreachable!(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compare_op_symbols_roundtrip() {
        for op in [
            CompareOp::Eq,
            CompareOp::Ne,
            CompareOp::Lt,
            CompareOp::Le,
            CompareOp::Gt,
            CompareOp::Ge,
        ] {
            assert_eq!(CompareOp::from_symbol(op.symbol()), Some(op));
        }
        assert_eq!(CompareOp::from_symbol("<>"), None);
    }

    #[test]
    fn fn_object_calls_closure() {
        let obj = FnObject::new("add", |args, _kwargs| {
            let a = args[0].as_int().unwrap_or(0);
            let b = args[1].as_int().unwrap_or(0);
            Ok(Value::Int(a + b))
        });
        assert!(obj.capabilities().contains(Capabilities::CALL));
        let out = obj
            .call(&[Value::Int(2), Value::Int(3)], &ValueMap::new())
            .unwrap();
        assert_eq!(out, Value::Int(5));
        assert!(obj.len().is_err());
    }

    #[test]
    fn value_cell_list_semantics() {
        let cell = ValueCell::new(Value::List(vec![
            Value::Int(0),
            Value::Str("x".into()),
            Value::Int(7),
        ]));
        assert_eq!(cell.len().unwrap(), 3);
        assert_eq!(cell.get_item(&Value::Int(2)).unwrap(), Value::Int(7));
        assert_eq!(cell.get_item(&Value::Int(-1)).unwrap(), Value::Int(7));
        assert!(cell.get_item(&Value::Int(9)).is_err());

        cell.set_item(Value::Int(0), Value::Int(5)).unwrap();
        assert_eq!(cell.get_item(&Value::Int(0)).unwrap(), Value::Int(5));

        cell.del_item(&Value::Int(0)).unwrap();
        assert_eq!(cell.len().unwrap(), 2);
    }

    #[test]
    fn value_cell_map_semantics() {
        let mut map = ValueMap::new();
        map.insert("k".into(), Value::Str("v".into()));
        let cell = ValueCell::new(Value::Map(map));
        assert_eq!(
            cell.get_item(&Value::Str("k".into())).unwrap(),
            Value::Str("v".into())
        );
        assert!(cell.get_item(&Value::Str("missing".into())).is_err());
        assert!(cell.capabilities().contains(Capabilities::GETITEM));
        assert!(cell.capabilities().contains(Capabilities::LEN));
    }

    #[test]
    fn resolve_path_walks_items_and_attrs() {
        let mut inner = ValueMap::new();
        inner.insert("k2".into(), Value::Int(9));
        let mut outer = ValueMap::new();
        outer.insert("k".into(), Value::Map(inner));
        let cell = ValueCell::new(Value::Map(outer));

        let path = vec![
            PathSeg::Item(Value::Str("k".into())),
            PathSeg::Item(Value::Str("k2".into())),
        ];
        match resolve_path(&cell, &path).unwrap() {
            Resolved::Plain(v) => assert_eq!(v, Value::Int(9)),
            Resolved::Object(_) => panic!("expected plain value"),
        }

        // Attribute access on plain data is rejected
        let path = vec![
            PathSeg::Item(Value::Str("k".into())),
            PathSeg::Attr("nope".into()),
        ];
        assert!(resolve_path(&cell, &path).is_err());
    }

    #[test]
    fn plain_value_ordering() {
        assert!(value_compare(&Value::Int(3), CompareOp::Lt, &Value::Int(5)).unwrap());
        assert!(value_compare(&Value::Float(2.5), CompareOp::Ge, &Value::Int(2)).unwrap());
        assert!(
            value_compare(&Value::Str("a".into()), CompareOp::Lt, &Value::Str("b".into())).unwrap()
        );
        assert!(value_compare(&Value::Bool(true), CompareOp::Lt, &Value::Int(1)).is_err());
        assert!(value_compare(&Value::Bool(true), CompareOp::Eq, &Value::Bool(true)).unwrap());
    }

    #[test]
    fn snapshot_returns_copy() {
        let cell = ValueCell::new(Value::Int(9));
        assert_eq!(cell.snapshot().unwrap(), Value::Int(9));
    }

    #[test]
    fn object_identity_is_the_arc() {
        let a = ValueCell::new(Value::Int(1));
        let b = Arc::clone(&a);
        let c = ValueCell::new(Value::Int(1));
        assert_eq!(object_ptr(&a), object_ptr(&b));
        assert_ne!(object_ptr(&a), object_ptr(&c));
    }
}
