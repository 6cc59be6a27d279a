// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Framed TCP transport.
//!
//! TCP is a stream protocol without message boundaries, so each message
//! travels as one length-prefixed frame:
//!
//! ```text
//! +----------------+-------------------+
//! | Length (4B BE) | Message payload   |
//! +----------------+-------------------+
//! ```
//!
//! The length field does not count the 4-byte header itself, and is
//! bounded by the configured maximum frame size (anti-OOM protection).
//! Reads and writes run on independent halves of the socket so a
//! dedicated reader thread can block in `recv` while other threads send.
//! Nagle is disabled: frames are small and latency-bound.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::{MsgListener, MsgStream, SharedStream};
use crate::config::CONNECT_TIMEOUT_MS;

/// Size of the length prefix on every frame.
const FRAME_HEADER: usize = 4;

/// A framed, connected TCP stream.
#[derive(Debug)]
pub struct TcpMsgStream {
    /// Read half; owned by the reader thread
    reader: Mutex<TcpStream>,

    /// Write half; send() serializes frame writes here
    writer: Mutex<TcpStream>,

    /// Unlocked handle used only for shutdown, so close() never waits on
    /// a stalled reader or writer
    shutdown_handle: TcpStream,

    max_frame: usize,
    closed: AtomicBool,
    peer: String,
}

impl TcpMsgStream {
    /// Wrap an accepted or connected socket.
    pub fn wrap(stream: TcpStream, max_frame: usize) -> io::Result<SharedStream> {
        stream.set_nodelay(true)?;
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "?".to_string());
        let read_half = stream.try_clone()?;
        let shutdown_handle = stream.try_clone()?;
        Ok(Arc::new(Self {
            reader: Mutex::new(read_half),
            writer: Mutex::new(stream),
            shutdown_handle,
            max_frame,
            closed: AtomicBool::new(false),
            peer,
        }))
    }

    /// Connect to `host:port` with the default connect timeout.
    pub fn connect(hostport: &str, max_frame: usize) -> io::Result<SharedStream> {
        let timeout = Duration::from_millis(CONNECT_TIMEOUT_MS);
        let addrs: Vec<SocketAddr> = hostport.to_socket_addrs()?.collect();
        let mut last_err =
            io::Error::new(io::ErrorKind::InvalidInput, "address resolved to nothing");
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => return Self::wrap(stream, max_frame),
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }
}

impl MsgStream for TcpMsgStream {
    fn send(&self, payload: &[u8]) -> io::Result<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "stream closed"));
        }
        let mut writer = self.writer.lock();
        writer.write_all(&(payload.len() as u32).to_be_bytes())?;
        writer.write_all(payload)?;
        writer.flush()
    }

    fn recv(&self) -> io::Result<Vec<u8>> {
        let mut reader = self.reader.lock();

        let mut header = [0u8; FRAME_HEADER];
        reader.read_exact(&mut header)?;
        let len = u32::from_be_bytes(header) as usize;
        if len > self.max_frame {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame too large: {} bytes (max {})", len, self.max_frame),
            ));
        }

        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload)?;
        Ok(payload)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            // Wakes a reader blocked in recv with EOF
            let _ = self.shutdown_handle.shutdown(Shutdown::Both);
        }
    }

    fn peer_label(&self) -> String {
        self.peer.clone()
    }
}

impl Drop for TcpMsgStream {
    fn drop(&mut self) {
        self.close();
    }
}

/// A bound TCP listener producing framed streams.
pub struct TcpMsgListener {
    listener: TcpListener,
    address: String,
    max_frame: usize,
    closed: AtomicBool,
}

impl TcpMsgListener {
    /// Bind at `host:port`; port 0 picks a free port, reported by
    /// [`MsgListener::address`].
    pub fn bind(hostport: &str, max_frame: usize) -> io::Result<Self> {
        let listener = TcpListener::bind(hostport)?;
        let address = format!("tcp://{}", listener.local_addr()?);
        Ok(Self {
            listener,
            address,
            max_frame,
            closed: AtomicBool::new(false),
        })
    }
}

impl MsgListener for TcpMsgListener {
    fn accept(&self) -> io::Result<SharedStream> {
        let (stream, _) = self.listener.accept()?;
        if self.closed.load(Ordering::Relaxed) {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "listener closed"));
        }
        TcpMsgStream::wrap(stream, self.max_frame)
    }

    fn address(&self) -> String {
        self.address.clone()
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            // Unblock the accept loop: a refused self-connect is enough to
            // make accept() return and observe the closed flag.
            if let Ok(addr) = self.listener.local_addr() {
                let _ = TcpStream::connect_timeout(&addr, Duration::from_millis(100));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn pair(max_frame: usize) -> (SharedStream, SharedStream) {
        let listener = TcpMsgListener::bind("127.0.0.1:0", max_frame).unwrap();
        let hostport = listener.address().strip_prefix("tcp://").unwrap().to_string();
        let accepted = thread::spawn(move || listener.accept());
        let client = TcpMsgStream::connect(&hostport, max_frame).unwrap();
        (client, accepted.join().unwrap().unwrap())
    }

    #[test]
    fn send_and_recv_frames() {
        let (client, server) = pair(1024 * 1024);
        client.send(b"hello").unwrap();
        assert_eq!(server.recv().unwrap(), b"hello");
        server.send(b"world").unwrap();
        assert_eq!(client.recv().unwrap(), b"world");
    }

    #[test]
    fn frames_keep_boundaries_and_order() {
        let (client, server) = pair(1024);
        client.send(b"first").unwrap();
        client.send(b"").unwrap();
        client.send(b"third").unwrap();

        assert_eq!(server.recv().unwrap(), b"first");
        assert_eq!(server.recv().unwrap(), Vec::<u8>::new());
        assert_eq!(server.recv().unwrap(), b"third");
    }

    #[test]
    fn large_frame_survives_chunked_reads() {
        let (client, server) = pair(1024 * 1024);
        let payload: Vec<u8> = (0..100_000).map(|i| (i % 256) as u8).collect();
        let sent = payload.clone();
        let writer = thread::spawn(move || client.send(&sent).unwrap());
        assert_eq!(server.recv().unwrap(), payload);
        writer.join().unwrap();
    }

    #[test]
    fn oversized_frame_is_rejected() {
        // Receiver caps at 8 bytes; the sender does not
        let listener = TcpMsgListener::bind("127.0.0.1:0", 8).unwrap();
        let hostport = listener.address().strip_prefix("tcp://").unwrap().to_string();
        let accepted = thread::spawn(move || listener.accept());
        let client = TcpMsgStream::connect(&hostport, 1024).unwrap();
        let server = accepted.join().unwrap().unwrap();

        client.send(b"way past the eight byte limit").unwrap();
        let err = server.recv().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn truncated_frame_is_an_error_not_a_hang() {
        let listener = TcpMsgListener::bind("127.0.0.1:0", 1024).unwrap();
        let hostport = listener.address().strip_prefix("tcp://").unwrap().to_string();
        let accepted = thread::spawn(move || listener.accept());
        let mut raw = TcpStream::connect(hostport.as_str()).unwrap();
        let server = accepted.join().unwrap().unwrap();

        // Header promising 100 bytes, then the connection dies
        raw.write_all(&100u32.to_be_bytes()).unwrap();
        raw.write_all(b"short").unwrap();
        drop(raw);

        let err = server.recv().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn recv_errors_after_peer_closes() {
        let (client, server) = pair(1024);
        client.close();
        assert!(server.recv().is_err());
    }

    #[test]
    fn send_errors_after_local_close() {
        let (client, _server) = pair(1024);
        client.close();
        assert!(client.send(b"late").is_err());
    }

    #[test]
    fn bound_port_is_reported() {
        let listener = TcpMsgListener::bind("127.0.0.1:0", 1024).unwrap();
        let addr = listener.address();
        assert!(addr.starts_with("tcp://127.0.0.1:"));
        assert!(!addr.ends_with(":0"));
    }
}
