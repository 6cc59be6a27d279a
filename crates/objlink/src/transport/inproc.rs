// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-process transport for same-process peers.
//!
//! `inproc://name` endpoints rendezvous through a process-global name
//! table. Each connection is a pair of unbounded channels, so frames keep
//! the same atomic, in-order semantics as the TCP transport without
//! touching the network stack. Used by tests and same-process loopback
//! setups.

use std::io;
use std::sync::Arc;

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use super::{MsgListener, MsgStream, SharedStream};

/// Process-global rendezvous table: name -> pending-connection sender.
static ENDPOINTS: Mutex<Vec<(String, Sender<SharedStream>)>> = Mutex::new(Vec::new());

/// One half of an in-process connection.
#[derive(Debug)]
pub struct InprocStream {
    /// Dropped on close so the peer's recv wakes with an error
    tx: Mutex<Option<Sender<Vec<u8>>>>,
    rx: Receiver<Vec<u8>>,
    label: String,
}

impl InprocStream {
    fn pair(name: &str) -> (SharedStream, SharedStream) {
        let (a_tx, a_rx) = unbounded();
        let (b_tx, b_rx) = unbounded();
        let a: SharedStream = Arc::new(InprocStream {
            tx: Mutex::new(Some(a_tx)),
            rx: b_rx,
            label: format!("inproc://{} (client)", name),
        });
        let b: SharedStream = Arc::new(InprocStream {
            tx: Mutex::new(Some(b_tx)),
            rx: a_rx,
            label: format!("inproc://{} (server)", name),
        });
        (a, b)
    }
}

impl MsgStream for InprocStream {
    fn send(&self, payload: &[u8]) -> io::Result<()> {
        let guard = self.tx.lock();
        let tx = guard
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "stream closed"))?;
        tx.send(payload.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer closed"))
    }

    fn recv(&self) -> io::Result<Vec<u8>> {
        self.rx
            .recv()
            .map_err(|_| io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed"))
    }

    fn close(&self) {
        self.tx.lock().take();
    }

    fn peer_label(&self) -> String {
        self.label.clone()
    }
}

/// A named in-process listener.
#[derive(Debug)]
pub struct InprocListener {
    name: String,
    pending: Receiver<SharedStream>,
}

impl InprocListener {
    /// Register `name` in the process-global table.
    pub fn bind(name: &str) -> io::Result<Self> {
        let mut table = ENDPOINTS.lock();
        if table.iter().any(|(n, _)| n == name) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("inproc://{} already bound", name),
            ));
        }
        let (tx, rx) = unbounded();
        table.push((name.to_string(), tx));
        Ok(Self {
            name: name.to_string(),
            pending: rx,
        })
    }
}

impl MsgListener for InprocListener {
    fn accept(&self) -> io::Result<SharedStream> {
        self.pending
            .recv()
            .map_err(|_| io::Error::new(io::ErrorKind::NotConnected, "listener closed"))
    }

    fn address(&self) -> String {
        format!("inproc://{}", self.name)
    }

    fn close(&self) {
        // Dropping the sender wakes a blocked accept
        ENDPOINTS.lock().retain(|(n, _)| n != &self.name);
    }
}

impl Drop for InprocListener {
    fn drop(&mut self) {
        self.close();
    }
}

/// Connect to a named in-process listener.
pub fn connect(name: &str) -> io::Result<SharedStream> {
    let tx = {
        let table = ENDPOINTS.lock();
        table
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, tx)| tx.clone())
    };
    let tx = tx.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::ConnectionRefused,
            format!("no inproc listener named '{}'", name),
        )
    })?;
    let (client_half, server_half) = InprocStream::pair(name);
    tx.send(server_half).map_err(|_| {
        io::Error::new(io::ErrorKind::ConnectionRefused, "listener closed")
    })?;
    Ok(client_half)
}
