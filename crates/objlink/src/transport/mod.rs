// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Message transport between peers.
//!
//! A transport endpoint delivers opaque payloads as atomic frames with
//! best-effort in-order delivery within a session, and surfaces peer
//! disconnect as an error on the next send or receive. Two schemes are
//! supported:
//!
//! - `tcp://host:port` - length-prefix framed TCP (IPv4/IPv6 literals
//!   permitted)
//! - `inproc://name`   - channel pairs inside one process, for tests
//!
//! Transports are not reconnecting: a broken session terminates the client
//! with `CONNECTION_LOST` on all pending work.

pub mod inproc;
pub mod tcp;

use std::io;
use std::sync::Arc;

use crate::error::{RpcError, RpcResult};

/// A parsed peer address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Address {
    /// `tcp://host:port`
    Tcp(String),
    /// `inproc://name`
    Inproc(String),
}

impl Address {
    /// Parse an address URL.
    pub fn parse(address: &str) -> RpcResult<Self> {
        if let Some(rest) = address.strip_prefix("tcp://") {
            if rest.is_empty() || !rest.contains(':') {
                return Err(RpcError::BadAddress(address.to_string()));
            }
            return Ok(Self::Tcp(rest.to_string()));
        }
        if let Some(name) = address.strip_prefix("inproc://") {
            if name.is_empty() {
                return Err(RpcError::BadAddress(address.to_string()));
            }
            return Ok(Self::Inproc(name.to_string()));
        }
        Err(RpcError::BadAddress(address.to_string()))
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp(hostport) => write!(f, "tcp://{}", hostport),
            Self::Inproc(name) => write!(f, "inproc://{}", name),
        }
    }
}

/// A connected bidirectional message channel between two peers.
///
/// `send` may be called from any thread (writes are serialized
/// internally); `recv` is intended for a single reader thread.
pub trait MsgStream: Send + Sync + std::fmt::Debug {
    /// Send one payload as an atomic frame.
    fn send(&self, payload: &[u8]) -> io::Result<()>;

    /// Block until the next frame arrives.
    fn recv(&self) -> io::Result<Vec<u8>>;

    /// Tear down the stream; blocked receivers wake with an error.
    fn close(&self);

    /// Short label for the remote end, for logging.
    fn peer_label(&self) -> String;
}

/// Shared handle to a stream: the reader thread and writers hold clones.
pub type SharedStream = Arc<dyn MsgStream>;

/// A bound endpoint accepting peer connections.
pub trait MsgListener: Send + Sync {
    /// Block until a peer connects.
    fn accept(&self) -> io::Result<SharedStream>;

    /// The address this listener is reachable at (actual port resolved).
    fn address(&self) -> String;

    /// Stop accepting; a blocked `accept` wakes with an error.
    fn close(&self);
}

/// Bind a listener at the given address URL.
pub fn bind(address: &str, max_frame: usize) -> RpcResult<Box<dyn MsgListener>> {
    match Address::parse(address)? {
        Address::Tcp(hostport) => Ok(Box::new(tcp::TcpMsgListener::bind(&hostport, max_frame)?)),
        Address::Inproc(name) => Ok(Box::new(inproc::InprocListener::bind(&name)?)),
    }
}

/// Connect to a listening peer at the given address URL.
pub fn connect(address: &str, max_frame: usize) -> RpcResult<SharedStream> {
    match Address::parse(address)? {
        Address::Tcp(hostport) => Ok(tcp::TcpMsgStream::connect(&hostport, max_frame)?),
        Address::Inproc(name) => Ok(inproc::connect(&name)?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp_addresses() {
        assert_eq!(
            Address::parse("tcp://127.0.0.1:5000").unwrap(),
            Address::Tcp("127.0.0.1:5000".into())
        );
        assert_eq!(
            Address::parse("tcp://[::1]:5000").unwrap(),
            Address::Tcp("[::1]:5000".into())
        );
    }

    #[test]
    fn parses_inproc_addresses() {
        assert_eq!(
            Address::parse("inproc://pair-a").unwrap(),
            Address::Inproc("pair-a".into())
        );
    }

    #[test]
    fn rejects_bad_addresses() {
        assert!(Address::parse("udp://1.2.3.4:1").is_err());
        assert!(Address::parse("tcp://").is_err());
        assert!(Address::parse("tcp://noport").is_err());
        assert!(Address::parse("inproc://").is_err());
        assert!(Address::parse("127.0.0.1:5000").is_err());
    }

    #[test]
    fn display_roundtrips() {
        for addr in ["tcp://127.0.0.1:4000", "inproc://x"] {
            assert_eq!(Address::parse(addr).unwrap().to_string(), addr);
        }
    }
}
