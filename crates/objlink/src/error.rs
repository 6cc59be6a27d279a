// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types for remote-proxy operations.

use std::fmt;
use std::io;

use crate::value::{Value, ValueMap};

/// Result type for RPC operations
pub type RpcResult<T> = Result<T, RpcError>;

/// Wire-stable error kinds.
///
/// These names appear verbatim in the `status` field of reply frames and
/// must never change. Local-only failures ([`RpcError::Closed`] and
/// friends) have no kind here and are never serialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Target id not present or already released
    UnknownObject,
    /// Target lacks the required capability
    UnsupportedOp,
    /// Target operation failed; payload carries the exception record
    RemoteRaised,
    /// A value could not be encoded under the requested return mode
    Unserializable,
    /// Synchronous deadline elapsed
    Timeout,
    /// Future was cancelled before completion
    Cancelled,
    /// Transport failed mid-flight
    ConnectionLost,
    /// Server rejected the request because it is closing
    ShuttingDown,
    /// By-reference transmission attempted without a local server
    NoLocalServer,
    /// Child process failed to come up (surfaced by an external spawner)
    BootstrapFailed,
}

impl ErrorKind {
    /// Wire name of this kind.
    pub fn wire_name(self) -> &'static str {
        match self {
            Self::UnknownObject => "UNKNOWN_OBJECT",
            Self::UnsupportedOp => "UNSUPPORTED_OP",
            Self::RemoteRaised => "REMOTE_RAISED",
            Self::Unserializable => "UNSERIALIZABLE",
            Self::Timeout => "TIMEOUT",
            Self::Cancelled => "CANCELLED",
            Self::ConnectionLost => "CONNECTION_LOST",
            Self::ShuttingDown => "SHUTTING_DOWN",
            Self::NoLocalServer => "NO_LOCAL_SERVER",
            Self::BootstrapFailed => "BOOTSTRAP_FAILED",
        }
    }

    /// Parse a wire name back into a kind.
    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "UNKNOWN_OBJECT" => Some(Self::UnknownObject),
            "UNSUPPORTED_OP" => Some(Self::UnsupportedOp),
            "REMOTE_RAISED" => Some(Self::RemoteRaised),
            "UNSERIALIZABLE" => Some(Self::Unserializable),
            "TIMEOUT" => Some(Self::Timeout),
            "CANCELLED" => Some(Self::Cancelled),
            "CONNECTION_LOST" => Some(Self::ConnectionLost),
            "SHUTTING_DOWN" => Some(Self::ShuttingDown),
            "NO_LOCAL_SERVER" => Some(Self::NoLocalServer),
            "BOOTSTRAP_FAILED" => Some(Self::BootstrapFailed),
            _ => None,
        }
    }
}

/// Structured record of a failure inside a remote target operation.
///
/// Captured so callers can present useful diagnostics without holding
/// references into the remote process. `chain` carries the cause chain,
/// outermost first.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RemoteException {
    /// Remote error type name
    pub type_name: String,
    /// Remote error message
    pub message: String,
    /// Rendered textual traceback from the remote side
    pub traceback: String,
    /// Cause chain (outermost cause first)
    pub chain: Vec<RemoteException>,
}

impl RemoteException {
    /// New exception record with an empty traceback and chain.
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
            traceback: String::new(),
            chain: Vec::new(),
        }
    }

    /// Attach a cause to the chain.
    pub fn caused_by(mut self, cause: RemoteException) -> Self {
        self.chain.push(cause);
        self
    }

    /// Encode into a wire value map.
    pub fn to_value(&self) -> Value {
        let mut map = ValueMap::new();
        map.insert("type_name".into(), Value::Str(self.type_name.clone()));
        map.insert("message".into(), Value::Str(self.message.clone()));
        map.insert("traceback_text".into(), Value::Str(self.traceback.clone()));
        map.insert(
            "chain".into(),
            Value::List(self.chain.iter().map(RemoteException::to_value).collect()),
        );
        Value::Map(map)
    }

    /// Decode from a wire value map. Lenient: missing fields stay empty.
    pub fn from_value(value: &Value) -> Self {
        let mut exc = RemoteException::default();
        if let Value::Map(map) = value {
            if let Some(Value::Str(s)) = map.get("type_name") {
                exc.type_name = s.clone();
            }
            if let Some(Value::Str(s)) = map.get("message") {
                exc.message = s.clone();
            }
            if let Some(Value::Str(s)) = map.get("traceback_text") {
                exc.traceback = s.clone();
            }
            if let Some(Value::List(items)) = map.get("chain") {
                exc.chain = items.iter().map(RemoteException::from_value).collect();
            }
        }
        exc
    }
}

impl fmt::Display for RemoteException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.type_name, self.message)?;
        for cause in &self.chain {
            write!(f, "\n  caused by {}: {}", cause.type_name, cause.message)?;
        }
        Ok(())
    }
}

/// Errors surfaced by target operations.
///
/// This is the error type [`RemoteObject`](crate::object::RemoteObject)
/// implementations return; the server maps it onto a reply status.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteError {
    /// The target does not support the requested operation
    Unsupported(String),
    /// The operation ran and failed
    Raised(RemoteException),
}

impl RemoteError {
    /// Unsupported-operation error for the named op.
    pub fn unsupported(op: impl Into<String>) -> Self {
        Self::Unsupported(op.into())
    }

    /// Operation failure with a type name and message.
    pub fn raised(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Raised(RemoteException::new(type_name, message))
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsupported(op) => write!(f, "operation not supported: {}", op),
            Self::Raised(exc) => write!(f, "{}", exc),
        }
    }
}

impl std::error::Error for RemoteError {}

/// Errors that can occur during remote-proxy operations.
#[derive(Debug)]
pub enum RpcError {
    /// Target id not present or already released
    UnknownObject(u64),

    /// Target lacks the required capability
    UnsupportedOp(String),

    /// Remote target operation failed
    Remote(RemoteException),

    /// A value in args or result could not be encoded
    Unserializable(String),

    /// Synchronous deadline elapsed
    Timeout,

    /// Future was cancelled before completion
    Cancelled,

    /// Transport failed mid-flight
    ConnectionLost(String),

    /// Server rejected the request because it is closing
    ShuttingDown,

    /// By-reference transmission attempted without a local server
    NoLocalServer,

    /// Child process failed to come up
    Bootstrap(String),

    /// Client was closed locally (never on the wire)
    Closed,

    /// Malformed address (never on the wire)
    BadAddress(String),

    /// Malformed or unexpected frame (never on the wire)
    Protocol(String),

    /// Transport I/O error (never on the wire)
    Io(io::Error),
}

impl RpcError {
    /// Wire-stable kind of this error, if it has one.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::UnknownObject(_) => Some(ErrorKind::UnknownObject),
            Self::UnsupportedOp(_) => Some(ErrorKind::UnsupportedOp),
            Self::Remote(_) => Some(ErrorKind::RemoteRaised),
            Self::Unserializable(_) => Some(ErrorKind::Unserializable),
            Self::Timeout => Some(ErrorKind::Timeout),
            Self::Cancelled => Some(ErrorKind::Cancelled),
            Self::ConnectionLost(_) => Some(ErrorKind::ConnectionLost),
            Self::ShuttingDown => Some(ErrorKind::ShuttingDown),
            Self::NoLocalServer => Some(ErrorKind::NoLocalServer),
            Self::Bootstrap(_) => Some(ErrorKind::BootstrapFailed),
            Self::Closed | Self::BadAddress(_) | Self::Protocol(_) | Self::Io(_) => None,
        }
    }

    /// Payload value carried alongside the status in an error reply.
    pub fn to_payload(&self) -> Value {
        match self {
            Self::UnknownObject(id) => Value::Int(*id as i64),
            Self::UnsupportedOp(op) => Value::Str(op.clone()),
            Self::Remote(exc) => exc.to_value(),
            Self::Unserializable(what) => Value::Str(what.clone()),
            Self::Bootstrap(what) => Value::Str(what.clone()),
            _ => Value::None,
        }
    }

    /// Reconstruct an error from a reply's status kind and payload.
    pub fn from_wire(kind: ErrorKind, payload: &Value) -> Self {
        match kind {
            ErrorKind::UnknownObject => Self::UnknownObject(payload.as_int().unwrap_or(0) as u64),
            ErrorKind::UnsupportedOp => {
                Self::UnsupportedOp(payload.as_str().unwrap_or("").to_string())
            }
            ErrorKind::RemoteRaised => Self::Remote(RemoteException::from_value(payload)),
            ErrorKind::Unserializable => {
                Self::Unserializable(payload.as_str().unwrap_or("").to_string())
            }
            ErrorKind::Timeout => Self::Timeout,
            ErrorKind::Cancelled => Self::Cancelled,
            ErrorKind::ConnectionLost => Self::ConnectionLost(String::new()),
            ErrorKind::ShuttingDown => Self::ShuttingDown,
            ErrorKind::NoLocalServer => Self::NoLocalServer,
            ErrorKind::BootstrapFailed => {
                Self::Bootstrap(payload.as_str().unwrap_or("").to_string())
            }
        }
    }

    /// Connection-loss error with context.
    pub fn connection_lost(context: impl Into<String>) -> Self {
        Self::ConnectionLost(context.into())
    }

    /// Structural copy. `Io` loses the concrete error type but keeps the
    /// kind and message, which is all a future's second reader needs.
    pub(crate) fn duplicate(&self) -> Self {
        match self {
            Self::UnknownObject(id) => Self::UnknownObject(*id),
            Self::UnsupportedOp(op) => Self::UnsupportedOp(op.clone()),
            Self::Remote(exc) => Self::Remote(exc.clone()),
            Self::Unserializable(what) => Self::Unserializable(what.clone()),
            Self::Timeout => Self::Timeout,
            Self::Cancelled => Self::Cancelled,
            Self::ConnectionLost(ctx) => Self::ConnectionLost(ctx.clone()),
            Self::ShuttingDown => Self::ShuttingDown,
            Self::NoLocalServer => Self::NoLocalServer,
            Self::Bootstrap(what) => Self::Bootstrap(what.clone()),
            Self::Closed => Self::Closed,
            Self::BadAddress(addr) => Self::BadAddress(addr.clone()),
            Self::Protocol(what) => Self::Protocol(what.clone()),
            Self::Io(e) => Self::Io(io::Error::new(e.kind(), e.to_string())),
        }
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownObject(id) => write!(f, "unknown object id {}", id),
            Self::UnsupportedOp(op) => write!(f, "target does not support '{}'", op),
            Self::Remote(exc) => write!(f, "remote operation failed: {}", exc),
            Self::Unserializable(what) => write!(f, "value not serializable: {}", what),
            Self::Timeout => write!(f, "request timed out"),
            Self::Cancelled => write!(f, "request cancelled"),
            Self::ConnectionLost(ctx) if ctx.is_empty() => write!(f, "connection lost"),
            Self::ConnectionLost(ctx) => write!(f, "connection lost: {}", ctx),
            Self::ShuttingDown => write!(f, "server is shutting down"),
            Self::NoLocalServer => {
                write!(f, "cannot send by reference without a local server")
            }
            Self::Bootstrap(what) => write!(f, "bootstrap failed: {}", what),
            Self::Closed => write!(f, "client closed"),
            Self::BadAddress(addr) => write!(f, "bad address: {}", addr),
            Self::Protocol(what) => write!(f, "protocol error: {}", what),
            Self::Io(e) => write!(f, "transport error: {}", e),
        }
    }
}

impl std::error::Error for RpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for RpcError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<RemoteError> for RpcError {
    fn from(e: RemoteError) -> Self {
        match e {
            RemoteError::Unsupported(op) => Self::UnsupportedOp(op),
            RemoteError::Raised(exc) => Self::Remote(exc),
        }
    }
}
