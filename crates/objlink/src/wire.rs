// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Core frame types for the remote-proxy protocol.
//!
//! Every message on the wire is one [`Frame`], a map-shaped record:
//!
//! ```text
//! { kind: "req" | "rep" | "notice",
//!   id: u64,                       # 0 for notices and fire-and-forget
//!   op: opcode string,
//!   target: u64,                   # 0 addresses the server itself
//!   path: [segments],              # lazily composed attribute chain
//!   args: [...], kwargs: {...},
//!   mode: "sync" | "async" | "off",
//!   return_mode: "value" | "proxy" | "auto",
//!   status: "ok" | error kind,     # replies only
//!   payload: any }                 # replies and notices
//! ```
//!
//! Request ids are unique and monotonic per client; replies carry the exact
//! request id for correlation.

use crate::error::{ErrorKind, RpcError, RpcResult};
use crate::value::{PathSeg, Value, ValueMap};

/// Frame kind discriminator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameKind {
    /// A request expecting dispatch (and, unless `off`, a reply)
    Request,
    /// A reply correlated to a request id
    Reply,
    /// A one-way notification
    Notice,
}

impl FrameKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Request => "req",
            Self::Reply => "rep",
            Self::Notice => "notice",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "req" => Some(Self::Request),
            "rep" => Some(Self::Reply),
            "notice" => Some(Self::Notice),
            _ => None,
        }
    }
}

/// Operations recognized by the dispatcher, plus notice ops.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Invoke target with positional + keyword args
    Call,
    /// Fetch a named member; with no name, materialize the resolved target
    GetAttr,
    /// Assign a named member
    SetAttr,
    /// Keyed read
    GetItem,
    /// Keyed write
    SetItem,
    /// Keyed delete
    DelItem,
    /// Structural comparison; `args[0]` is the operator symbol
    Cmp,
    /// Integer length
    Len,
    /// Decref a list of `(id, n)` pairs; notice, no reply
    Release,
    /// Load a named module (server-builtin)
    Import,
    /// Return target's object id for identity checks
    GetId,
    /// No-op round trip
    Ping,
    /// Session greeting notice (first frame on a connection)
    Hello,
    /// Best-effort cancellation notice for an in-flight request
    Cancel,
    /// Forwarded log record notice
    Log,
    /// Server-closing notice
    ServerClosed,
}

impl Opcode {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Call => "call",
            Self::GetAttr => "getattr",
            Self::SetAttr => "setattr",
            Self::GetItem => "getitem",
            Self::SetItem => "setitem",
            Self::DelItem => "delitem",
            Self::Cmp => "cmp",
            Self::Len => "len",
            Self::Release => "release",
            Self::Import => "import",
            Self::GetId => "get_id",
            Self::Ping => "ping",
            Self::Hello => "hello",
            Self::Cancel => "cancel",
            Self::Log => "log",
            Self::ServerClosed => "server_closed",
        }
    }

    /// Parse a wire name.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "call" => Some(Self::Call),
            "getattr" => Some(Self::GetAttr),
            "setattr" => Some(Self::SetAttr),
            "getitem" => Some(Self::GetItem),
            "setitem" => Some(Self::SetItem),
            "delitem" => Some(Self::DelItem),
            "cmp" => Some(Self::Cmp),
            "len" => Some(Self::Len),
            "release" => Some(Self::Release),
            "import" => Some(Self::Import),
            "get_id" => Some(Self::GetId),
            "ping" => Some(Self::Ping),
            "hello" => Some(Self::Hello),
            "cancel" => Some(Self::Cancel),
            "log" => Some(Self::Log),
            "server_closed" => Some(Self::ServerClosed),
            _ => None,
        }
    }
}

/// Invocation mode requested by the caller.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Mode {
    /// Block until reply or timeout
    #[default]
    Sync,
    /// Return a future
    Async,
    /// Fire-and-forget: no reply, failures invisible
    Off,
}

impl Mode {
    fn as_str(self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Async => "async",
            Self::Off => "off",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "sync" => Some(Self::Sync),
            "async" => Some(Self::Async),
            "off" => Some(Self::Off),
            _ => None,
        }
    }
}

/// How the reply value travels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReturnMode {
    /// Force a deep copy; fail with `UNSERIALIZABLE` if impossible
    Value,
    /// Force by-reference
    Proxy,
    /// Sender decides per value (codec policy)
    #[default]
    Auto,
}

impl ReturnMode {
    fn as_str(self) -> &'static str {
        match self {
            Self::Value => "value",
            Self::Proxy => "proxy",
            Self::Auto => "auto",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "value" => Some(Self::Value),
            "proxy" => Some(Self::Proxy),
            "auto" => Some(Self::Auto),
            _ => None,
        }
    }
}

/// Reply status: ok or a wire-stable error kind.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Status {
    /// Success
    #[default]
    Ok,
    /// Failure of the given kind; payload carries detail
    Err(ErrorKind),
}

/// One wire message.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    /// Frame kind
    pub kind: FrameKind,
    /// Request id; 0 for notices and fire-and-forget requests
    pub id: u64,
    /// Operation
    pub op: Opcode,
    /// Target object id; 0 is the server itself
    pub target: u64,
    /// Attribute chain resolved before the op is applied
    pub path: Vec<PathSeg>,
    /// Positional arguments
    pub args: Vec<Value>,
    /// Keyword arguments
    pub kwargs: ValueMap,
    /// Invocation mode
    pub mode: Mode,
    /// Reply travel mode
    pub return_mode: ReturnMode,
    /// Reply status
    pub status: Status,
    /// Reply or notice payload
    pub payload: Value,
}

impl Frame {
    /// A request frame.
    pub fn request(id: u64, op: Opcode, target: u64, path: Vec<PathSeg>) -> Self {
        Self {
            kind: FrameKind::Request,
            id,
            op,
            target,
            path,
            args: Vec::new(),
            kwargs: ValueMap::new(),
            mode: Mode::Sync,
            return_mode: ReturnMode::Auto,
            status: Status::Ok,
            payload: Value::None,
        }
    }

    /// A successful reply to `id`.
    pub fn reply_ok(id: u64, payload: Value) -> Self {
        Self {
            kind: FrameKind::Reply,
            id,
            op: Opcode::Ping,
            target: 0,
            path: Vec::new(),
            args: Vec::new(),
            kwargs: ValueMap::new(),
            mode: Mode::Sync,
            return_mode: ReturnMode::Auto,
            status: Status::Ok,
            payload,
        }
    }

    /// An error reply to `id`.
    pub fn reply_err(id: u64, kind: ErrorKind, payload: Value) -> Self {
        let mut frame = Self::reply_ok(id, payload);
        frame.status = Status::Err(kind);
        frame
    }

    /// A one-way notice.
    pub fn notice(op: Opcode, payload: Value) -> Self {
        Self {
            kind: FrameKind::Notice,
            id: 0,
            op,
            target: 0,
            path: Vec::new(),
            args: Vec::new(),
            kwargs: ValueMap::new(),
            mode: Mode::Off,
            return_mode: ReturnMode::Auto,
            status: Status::Ok,
            payload: Value::None,
        }
        .with_payload(payload)
    }

    /// Builder: positional args.
    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    /// Builder: keyword args.
    pub fn with_kwargs(mut self, kwargs: ValueMap) -> Self {
        self.kwargs = kwargs;
        self
    }

    /// Builder: invocation mode.
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Builder: return mode.
    pub fn with_return_mode(mut self, rm: ReturnMode) -> Self {
        self.return_mode = rm;
        self
    }

    /// Builder: payload.
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Structural form handed to the codec.
    ///
    /// Only non-default fields are emitted, keeping notices and simple
    /// requests small on the wire.
    pub fn into_value(self) -> Value {
        let mut map = ValueMap::new();
        map.insert("kind".into(), Value::Str(self.kind.as_str().into()));
        map.insert("id".into(), Value::Int(self.id as i64));
        map.insert("op".into(), Value::Str(self.op.as_str().into()));
        if self.target != 0 {
            map.insert("target".into(), Value::Int(self.target as i64));
        }
        if !self.path.is_empty() {
            map.insert("path".into(), path_to_value(&self.path));
        }
        if !self.args.is_empty() {
            map.insert("args".into(), Value::List(self.args));
        }
        if !self.kwargs.is_empty() {
            map.insert("kwargs".into(), Value::Map(self.kwargs));
        }
        map.insert("mode".into(), Value::Str(self.mode.as_str().into()));
        map.insert(
            "return_mode".into(),
            Value::Str(self.return_mode.as_str().into()),
        );
        let status = match self.status {
            Status::Ok => "ok".to_string(),
            Status::Err(kind) => kind.wire_name().to_string(),
        };
        map.insert("status".into(), Value::Str(status));
        if !self.payload.is_none() {
            map.insert("payload".into(), self.payload);
        }
        Value::Map(map)
    }

    /// Rebuild a frame from its structural form.
    pub fn from_value(value: Value) -> RpcResult<Self> {
        let mut map = match value {
            Value::Map(map) => map,
            other => {
                return Err(RpcError::Protocol(format!(
                    "frame is not a map: {}",
                    other.kind_name()
                )))
            }
        };

        let kind_str = take_str(&mut map, "kind")?;
        let kind = FrameKind::from_str(&kind_str)
            .ok_or_else(|| RpcError::Protocol(format!("unknown frame kind '{}'", kind_str)))?;
        let op_str = take_str(&mut map, "op")?;
        let op = Opcode::from_str(&op_str)
            .ok_or_else(|| RpcError::Protocol(format!("unknown opcode '{}'", op_str)))?;

        let id = match map.remove("id") {
            Some(Value::Int(v)) if v >= 0 => v as u64,
            Some(other) => {
                return Err(RpcError::Protocol(format!(
                    "bad request id: {:?}",
                    other
                )))
            }
            None => 0,
        };
        let target = match map.remove("target") {
            Some(Value::Int(v)) if v >= 0 => v as u64,
            None => 0,
            Some(other) => {
                return Err(RpcError::Protocol(format!("bad target: {:?}", other)))
            }
        };
        let path = match map.remove("path") {
            Some(v) => path_from_value(&v)?,
            None => Vec::new(),
        };
        let args = match map.remove("args") {
            Some(Value::List(items)) => items,
            None => Vec::new(),
            Some(other) => {
                return Err(RpcError::Protocol(format!("bad args: {:?}", other)))
            }
        };
        let kwargs = match map.remove("kwargs") {
            Some(Value::Map(m)) => m,
            None => ValueMap::new(),
            Some(other) => {
                return Err(RpcError::Protocol(format!("bad kwargs: {:?}", other)))
            }
        };
        let mode = match map.remove("mode") {
            Some(Value::Str(s)) => Mode::from_str(&s)
                .ok_or_else(|| RpcError::Protocol(format!("unknown mode '{}'", s)))?,
            _ => Mode::Sync,
        };
        let return_mode = match map.remove("return_mode") {
            Some(Value::Str(s)) => ReturnMode::from_str(&s)
                .ok_or_else(|| RpcError::Protocol(format!("unknown return mode '{}'", s)))?,
            _ => ReturnMode::Auto,
        };
        let status = match map.remove("status") {
            Some(Value::Str(s)) if s == "ok" => Status::Ok,
            Some(Value::Str(s)) => Status::Err(
                ErrorKind::from_wire(&s)
                    .ok_or_else(|| RpcError::Protocol(format!("unknown status '{}'", s)))?,
            ),
            _ => Status::Ok,
        };
        let payload = map.remove("payload").unwrap_or(Value::None);

        Ok(Self {
            kind,
            id,
            op,
            target,
            path,
            args,
            kwargs,
            mode,
            return_mode,
            status,
            payload,
        })
    }
}

fn take_str(map: &mut ValueMap, key: &str) -> RpcResult<String> {
    match map.remove(key) {
        Some(Value::Str(s)) => Ok(s),
        other => Err(RpcError::Protocol(format!(
            "missing or bad frame field '{}': {:?}",
            key, other
        ))),
    }
}

/// Path segments travel as a list: strings for attributes, one-element
/// lists for item keys.
fn path_to_value(path: &[PathSeg]) -> Value {
    Value::List(
        path.iter()
            .map(|seg| match seg {
                PathSeg::Attr(name) => Value::Str(name.clone()),
                PathSeg::Item(key) => Value::List(vec![key.clone()]),
            })
            .collect(),
    )
}

fn path_from_value(value: &Value) -> RpcResult<Vec<PathSeg>> {
    let items = value
        .as_list()
        .ok_or_else(|| RpcError::Protocol("path is not a list".into()))?;
    items
        .iter()
        .map(|item| match item {
            Value::Str(name) => Ok(PathSeg::Attr(name.clone())),
            Value::List(inner) if inner.len() == 1 => Ok(PathSeg::Item(inner[0].clone())),
            other => Err(RpcError::Protocol(format!("bad path segment: {:?}", other))),
        })
        .collect()
}

/// Encode a descriptor path for embedding in a proxy record.
pub(crate) fn encode_path(path: &[PathSeg]) -> Value {
    path_to_value(path)
}

/// Decode a descriptor path from a proxy record.
pub(crate) fn decode_path(value: &Value) -> RpcResult<Vec<PathSeg>> {
    path_from_value(value)
}
