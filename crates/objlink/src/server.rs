// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Server side of a session: the request loop and dispatcher.
//!
//! A [`Server`] binds a transport endpoint, owns an [`ObjectRegistry`] and
//! runs a single-threaded event loop: accept-side reader threads feed one
//! queue of events (connections, frames, disconnects) and the loop thread
//! decodes, dispatches and replies strictly serially. That serialization is
//! the thread-safety contract proxied objects rely on.
//!
//! # Reentrancy
//!
//! An opcode's execution may itself call a proxy whose home is the peer
//! that sent the request (a callback). While the loop thread is parked
//! waiting for that nested reply, it keeps servicing requests from the
//! awaited peer - and only that peer, preserving per-peer FIFO for
//! everyone else. Incoming connections are matched to the awaited peer by
//! the local-server address announced in their `hello` greeting.
//!
//! # Close
//!
//! `close()` rejects queued requests with `SHUTTING_DOWN`, notifies every
//! peer with a `server_closed` notice, drains the registry and shuts the
//! transport before returning.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex};

use crate::codec::{Codec, DecodeCtx, EncodeCtx};
use crate::config::ServerConfig;
use crate::error::{ErrorKind, RemoteException, RpcError, RpcResult};
use crate::future::FutureShared;
use crate::object::{
    resolve_path, value_compare, value_get_item, value_len, CompareOp, Resolved, ServerObject,
    ValueCell,
};
use crate::registry::ObjectRegistry;
use crate::transport::{self, MsgListener, SharedStream};
use crate::value::{ProxyDescriptor, Value};
use crate::wire::{Frame, FrameKind, Mode, Opcode, ReturnMode};

thread_local! {
    // The server whose loop is running on this thread, if any; consulted
    // by futures to open reentrancy windows
    static CURRENT_SERVER: RefCell<Option<Server>> = const { RefCell::new(None) };
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Running,
    Closing,
    Closed,
}

enum ServerEvent {
    Connected {
        peer: u64,
        stream: SharedStream,
        name: String,
        local_server: Option<String>,
    },
    Frame {
        peer: u64,
        bytes: Vec<u8>,
    },
    Disconnected {
        peer: u64,
    },
    Close,
}

struct Peer {
    key: String,
    name: String,
    local_server: Option<String>,
    stream: SharedStream,
}

struct ServerShared {
    address: String,
    config: ServerConfig,
    codec: Codec,
    registry: ObjectRegistry,
    listener: Arc<dyn MsgListener>,

    /// Items published by name, retrievable via the target-0 builtins
    namespace: Mutex<HashMap<String, Value>>,
    /// Modules loadable via the `import` builtin
    modules: Mutex<HashMap<String, ServerObject>>,

    queue: Mutex<VecDeque<ServerEvent>>,
    queue_cv: Condvar,
    peers: Mutex<HashMap<u64, Peer>>,
    next_peer_id: AtomicU64,

    /// Cancellation notices received ahead of dispatch: (peer, request id)
    cancelled: Mutex<HashSet<(u64, u64)>>,

    phase: Mutex<Phase>,
    phase_cv: Condvar,
    close_requested: AtomicBool,

    /// Futures parked in a reentrancy window on the loop thread
    nested_waiters: Mutex<Vec<Weak<FutureShared>>>,

    requests_processed: AtomicU64,
}

/// A running server. Cheap to clone; all clones share one loop.
#[derive(Clone)]
pub struct Server {
    shared: Arc<ServerShared>,
}

impl Server {
    /// Bind at `address` and start the accept and loop threads.
    ///
    /// `tcp://host:0` binds an ephemeral port; [`address`](Self::address)
    /// reports the actual one.
    pub fn bind(address: &str) -> RpcResult<Server> {
        Self::bind_with(address, ServerConfig::from_env())
    }

    /// Bind with explicit configuration.
    pub fn bind_with(address: &str, config: ServerConfig) -> RpcResult<Server> {
        let listener: Arc<dyn MsgListener> =
            Arc::from(transport::bind(address, config.max_frame_size)?);
        let address = listener.address();
        log::info!("rpc server listening at {}", address);

        let shared = Arc::new(ServerShared {
            address,
            codec: Codec::new(config.serializer),
            config,
            registry: ObjectRegistry::new(),
            listener,
            namespace: Mutex::new(HashMap::new()),
            modules: Mutex::new(HashMap::new()),
            queue: Mutex::new(VecDeque::new()),
            queue_cv: Condvar::new(),
            peers: Mutex::new(HashMap::new()),
            next_peer_id: AtomicU64::new(1),
            cancelled: Mutex::new(HashSet::new()),
            phase: Mutex::new(Phase::Running),
            phase_cv: Condvar::new(),
            close_requested: AtomicBool::new(false),
            nested_waiters: Mutex::new(Vec::new()),
            requests_processed: AtomicU64::new(0),
        });
        let server = Server { shared };

        {
            let acceptor = server.clone();
            std::thread::Builder::new()
                .name("objlink-server-accept".into())
                .spawn(move || acceptor.run_accept_loop())
                .expect("spawn server accept thread");
        }
        {
            let looper = server.clone();
            std::thread::Builder::new()
                .name("objlink-server-loop".into())
                .spawn(move || looper.run_loop())
                .expect("spawn server loop thread");
        }

        Ok(server)
    }

    /// The address this server is reachable at.
    pub fn address(&self) -> String {
        self.shared.address.clone()
    }

    /// The server's object registry.
    pub(crate) fn registry(&self) -> &ObjectRegistry {
        &self.shared.registry
    }

    /// True until close has been requested.
    pub fn is_running(&self) -> bool {
        *self.shared.phase.lock() == Phase::Running
    }

    /// Number of requests dispatched so far.
    pub fn requests_processed(&self) -> u64 {
        self.shared.requests_processed.load(Ordering::Relaxed)
    }

    /// Number of objects currently held by reference for remote peers.
    pub fn live_objects(&self) -> usize {
        self.shared.registry.len()
    }

    /// Publish a value under `name` for clients to fetch by name.
    pub fn publish(&self, name: impl Into<String>, value: impl Into<Value>) {
        self.shared.namespace.lock().insert(name.into(), value.into());
    }

    /// Publish an owned object under `name`.
    pub fn publish_object(&self, name: impl Into<String>, object: ServerObject) {
        self.publish(name, Value::Object(object));
    }

    /// Fetch a published value locally.
    pub fn get_published(&self, name: &str) -> Option<Value> {
        self.shared.namespace.lock().get(name).cloned()
    }

    /// Register a module loadable through the `import` builtin.
    pub fn register_module(&self, name: impl Into<String>, module: ServerObject) {
        self.shared.modules.lock().insert(name.into(), module);
    }

    /// Register `obj` for transmission to `peer` and return its wire
    /// descriptor. Called by the codec when a value goes by reference.
    pub(crate) fn register_for_peer(&self, obj: &ServerObject, peer: &str) -> ProxyDescriptor {
        let (object_id, type_name, caps) = self.shared.registry.own(obj, peer);
        ProxyDescriptor {
            server_address: self.shared.address.clone(),
            object_id,
            type_name,
            caps,
            path: Vec::new(),
        }
    }

    /// Ask the loop to shut down and block until the transport is closed
    /// and every peer has been sent `server_closed`.
    ///
    /// Must not be called from a target operation (the loop thread).
    pub fn close(&self) {
        if !self.shared.close_requested.swap(true, Ordering::SeqCst) {
            self.push_event(ServerEvent::Close);
        }
        let mut phase = self.shared.phase.lock();
        while *phase != Phase::Closed {
            self.shared.phase_cv.wait(&mut phase);
        }
    }

    // ------------------------------------------------------------------
    // Accept side
    // ------------------------------------------------------------------

    fn run_accept_loop(self) {
        loop {
            match self.shared.listener.accept() {
                Ok(stream) => {
                    let peer = self.shared.next_peer_id.fetch_add(1, Ordering::Relaxed);
                    let reader = self.clone();
                    let spawned = std::thread::Builder::new()
                        .name(format!("objlink-server-peer-{}", peer))
                        .spawn(move || reader.run_peer_reader(peer, stream));
                    if let Err(e) = spawned {
                        log::error!("failed to spawn peer reader: {}", e);
                    }
                }
                Err(e) => {
                    if *self.shared.phase.lock() == Phase::Running {
                        log::warn!("rpc accept failed at {}: {}", self.shared.address, e);
                    }
                    return;
                }
            }
        }
    }

    fn run_peer_reader(self, peer: u64, stream: SharedStream) {
        // First frame must be the hello greeting
        let hello = match stream.recv() {
            Ok(bytes) => bytes,
            Err(_) => return,
        };
        let ctx = DecodeCtx {
            home: Some(self.clone()),
            client: None,
        };
        let (name, local_server) = match self.shared.codec.decode_frame(&hello, &ctx) {
            Ok(frame) if frame.kind == FrameKind::Notice && frame.op == Opcode::Hello => {
                parse_hello(&frame.payload)
            }
            Ok(frame) => {
                log::warn!(
                    "rpc peer {} sent {:?} before hello; dropping connection",
                    stream.peer_label(),
                    frame.op
                );
                stream.close();
                return;
            }
            Err(e) => {
                log::warn!("rpc bad greeting from {}: {}", stream.peer_label(), e);
                stream.close();
                return;
            }
        };

        self.push_event(ServerEvent::Connected {
            peer,
            stream: Arc::clone(&stream),
            name,
            local_server,
        });

        loop {
            match stream.recv() {
                Ok(bytes) => self.push_event(ServerEvent::Frame { peer, bytes }),
                Err(_) => {
                    self.push_event(ServerEvent::Disconnected { peer });
                    return;
                }
            }
        }
    }

    fn push_event(&self, event: ServerEvent) {
        {
            let mut queue = self.shared.queue.lock();
            queue.push_back(event);
            self.shared.queue_cv.notify_all();
        }
        // Wake any future parked in a reentrancy window on the loop thread
        let waiters = self.shared.nested_waiters.lock();
        for weak in waiters.iter() {
            if let Some(shared) = weak.upgrade() {
                shared.poke();
            }
        }
    }

    // ------------------------------------------------------------------
    // Event loop
    // ------------------------------------------------------------------

    fn run_loop(self) {
        CURRENT_SERVER.with(|current| *current.borrow_mut() = Some(self.clone()));
        log::info!("rpc server loop started for {}", self.shared.address);

        loop {
            let event = {
                let mut queue = self.shared.queue.lock();
                loop {
                    if let Some(event) = queue.pop_front() {
                        break event;
                    }
                    self.shared.queue_cv.wait(&mut queue);
                }
            };
            match event {
                ServerEvent::Close => break,
                other => self.handle_event(other),
            }
        }

        self.do_close();
        CURRENT_SERVER.with(|current| *current.borrow_mut() = None);

        let mut phase = self.shared.phase.lock();
        *phase = Phase::Closed;
        self.shared.phase_cv.notify_all();
        log::info!("rpc server loop for {} stopped", self.shared.address);
    }

    fn handle_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::Connected {
                peer,
                stream,
                name,
                local_server,
            } => {
                log::debug!(
                    "rpc peer {} connected to {} as '{}'",
                    peer,
                    self.shared.address,
                    name
                );
                self.shared.peers.lock().insert(
                    peer,
                    Peer {
                        key: peer_key(peer, &name, local_server.as_deref()),
                        name,
                        local_server,
                        stream,
                    },
                );
            }
            ServerEvent::Frame { peer, bytes } => self.handle_frame(peer, &bytes),
            ServerEvent::Disconnected { peer } => {
                let removed = self.shared.peers.lock().remove(&peer);
                if let Some(gone) = removed {
                    log::debug!("rpc peer '{}' disconnected", gone.name);
                    // The peer's reference contributions die with it, once
                    // its last connection is gone (connections from one
                    // process share a bucket)
                    let key_still_live = self
                        .shared
                        .peers
                        .lock()
                        .values()
                        .any(|p| p.key == gone.key);
                    if !key_still_live {
                        self.shared.registry.release_all_from(&gone.key);
                    }
                }
                self.shared.cancelled.lock().retain(|(p, _)| *p != peer);
            }
            ServerEvent::Close => unreachable!("close handled by the loop"),
        }
    }

    fn handle_frame(&self, peer: u64, bytes: &[u8]) {
        let ctx = DecodeCtx {
            home: Some(self.clone()),
            client: None,
        };
        let frame = match self.shared.codec.decode_frame(bytes, &ctx) {
            Ok(frame) => frame,
            Err(e) => {
                // Codec failures are fatal to the session
                log::error!("rpc undecodable frame from peer {}: {}", peer, e);
                if let Some(p) = self.shared.peers.lock().get(&peer) {
                    p.stream.close();
                }
                return;
            }
        };
        match frame.kind {
            FrameKind::Request => self.handle_request(peer, frame),
            FrameKind::Notice => self.handle_notice(peer, frame),
            FrameKind::Reply => {
                log::warn!("rpc unexpected reply frame on server link from peer {}", peer);
            }
        }
    }

    fn handle_notice(&self, peer: u64, frame: Frame) {
        match frame.op {
            Opcode::Release => {
                let key = match self.shared.peers.lock().get(&peer) {
                    Some(p) => p.key.clone(),
                    None => return,
                };
                for (id, n) in crate::client::parse_release_payload(&frame.payload) {
                    self.shared.registry.decref(id, &key, n);
                }
            }
            Opcode::Cancel => {
                if let Some(id) = frame.payload.as_int() {
                    if id > 0 {
                        self.shared.cancelled.lock().insert((peer, id as u64));
                    }
                }
            }
            Opcode::Hello => {
                log::warn!("rpc duplicate hello from peer {}", peer);
            }
            other => {
                log::warn!("rpc unexpected notice '{}' from peer {}", other.as_str(), peer);
            }
        }
    }

    fn handle_request(&self, peer: u64, frame: Frame) {
        let id = frame.id;
        let mode = frame.mode;
        let return_mode = frame.return_mode;

        log::debug!(
            "rpc recv '{}' target={} [req_id={}] from peer {}",
            frame.op.as_str(),
            frame.target,
            id,
            peer
        );

        if *self.shared.phase.lock() == Phase::Closing {
            if mode != Mode::Off {
                self.send_to_peer(peer, Frame::reply_err(id, ErrorKind::ShuttingDown, Value::None));
            }
            return;
        }

        // Best-effort cancellation: skip requests cancelled before
        // execution began; the caller already resolved to CANCELLED
        if id != 0 && self.shared.cancelled.lock().remove(&(peer, id)) {
            log::debug!("rpc request {} from peer {} cancelled before dispatch", id, peer);
            return;
        }

        self.shared.requests_processed.fetch_add(1, Ordering::Relaxed);
        let result = self.execute(&frame);

        if mode == Mode::Off {
            if let Err(e) = result {
                // Fire-and-forget: the failure is invisible to the caller
                log::warn!(
                    "rpc off-mode '{}' from peer {} failed: {}",
                    frame.op.as_str(),
                    peer,
                    e
                );
            }
            return;
        }

        let reply = match result.and_then(|value| self.apply_return_mode(value, return_mode)) {
            Ok(payload) => Frame::reply_ok(id, payload),
            Err(e) => {
                log::warn!("rpc request {} from peer {} failed: {}", id, peer, e);
                error_reply(id, &e)
            }
        };
        self.send_to_peer(peer, reply);
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    fn execute(&self, frame: &Frame) -> RpcResult<Value> {
        if frame.op == Opcode::Ping {
            return Ok(Value::Str("pong".into()));
        }
        if frame.target == 0 {
            return self.execute_builtin(frame);
        }

        let obj = self
            .shared
            .registry
            .get(frame.target)
            .ok_or(RpcError::UnknownObject(frame.target))?;

        // Identity check: same entry, same id, however the proxy was
        // obtained
        if frame.op == Opcode::GetId {
            return Ok(Value::Int(frame.target as i64));
        }

        let resolved = resolve_path(&obj, &frame.path)?;

        match frame.op {
            Opcode::Call => match resolved {
                Resolved::Object(target) => Ok(target.call(&frame.args, &frame.kwargs)?),
                Resolved::Plain(value) => {
                    Err(RpcError::UnsupportedOp(format!("call on {}", value.kind_name())))
                }
            },
            Opcode::GetAttr => match frame.args.first() {
                // No name: materialize the resolved target itself
                None => Ok(match resolved {
                    Resolved::Object(target) => Value::Object(target),
                    Resolved::Plain(value) => value,
                }),
                Some(Value::Str(name)) => match resolved {
                    Resolved::Object(target) => Ok(target.get_attr(name)?),
                    Resolved::Plain(value) => Err(RpcError::UnsupportedOp(format!(
                        "getattr on {}",
                        value.kind_name()
                    ))),
                },
                Some(other) => Err(RpcError::Protocol(format!(
                    "getattr name must be a string, got {}",
                    other.kind_name()
                ))),
            },
            Opcode::SetAttr => {
                let name = frame
                    .args
                    .first()
                    .and_then(Value::as_str)
                    .ok_or_else(|| RpcError::Protocol("setattr needs a name".into()))?;
                let value = frame
                    .args
                    .get(1)
                    .cloned()
                    .ok_or_else(|| RpcError::Protocol("setattr needs a value".into()))?;
                match resolved {
                    Resolved::Object(target) => {
                        target.set_attr(name, value)?;
                        Ok(Value::None)
                    }
                    Resolved::Plain(v) => {
                        Err(RpcError::UnsupportedOp(format!("setattr on {}", v.kind_name())))
                    }
                }
            }
            Opcode::GetItem => {
                let key = frame
                    .args
                    .first()
                    .ok_or_else(|| RpcError::Protocol("getitem needs a key".into()))?;
                match resolved {
                    Resolved::Object(target) => Ok(target.get_item(key)?),
                    Resolved::Plain(value) => Ok(value_get_item(&value, key)?),
                }
            }
            Opcode::SetItem => {
                let key = frame
                    .args
                    .first()
                    .cloned()
                    .ok_or_else(|| RpcError::Protocol("setitem needs a key".into()))?;
                let value = frame
                    .args
                    .get(1)
                    .cloned()
                    .ok_or_else(|| RpcError::Protocol("setitem needs a value".into()))?;
                match resolved {
                    Resolved::Object(target) => {
                        target.set_item(key, value)?;
                        Ok(Value::None)
                    }
                    Resolved::Plain(v) => {
                        Err(RpcError::UnsupportedOp(format!("setitem on {}", v.kind_name())))
                    }
                }
            }
            Opcode::DelItem => {
                let key = frame
                    .args
                    .first()
                    .ok_or_else(|| RpcError::Protocol("delitem needs a key".into()))?;
                match resolved {
                    Resolved::Object(target) => {
                        target.del_item(key)?;
                        Ok(Value::None)
                    }
                    Resolved::Plain(v) => {
                        Err(RpcError::UnsupportedOp(format!("delitem on {}", v.kind_name())))
                    }
                }
            }
            Opcode::Cmp => {
                let op = frame
                    .args
                    .first()
                    .and_then(Value::as_str)
                    .and_then(CompareOp::from_symbol)
                    .ok_or_else(|| RpcError::Protocol("cmp needs an operator".into()))?;
                let other = frame
                    .args
                    .get(1)
                    .ok_or_else(|| RpcError::Protocol("cmp needs an operand".into()))?;
                let outcome = match resolved {
                    Resolved::Object(target) => target.compare(op, other)?,
                    Resolved::Plain(value) => value_compare(&value, op, other)?,
                };
                Ok(Value::Bool(outcome))
            }
            Opcode::Len => {
                let len = match resolved {
                    Resolved::Object(target) => target.len()?,
                    Resolved::Plain(value) => value_len(&value)?,
                };
                Ok(Value::Int(len as i64))
            }
            other => Err(RpcError::Protocol(format!(
                "op '{}' is not a request",
                other.as_str()
            ))),
        }
    }

    /// Target 0 is the server itself: import, named get/set, call of a
    /// published callable, identity, and value echo (materialize).
    fn execute_builtin(&self, frame: &Frame) -> RpcResult<Value> {
        match frame.op {
            Opcode::Import => {
                let name = frame
                    .args
                    .first()
                    .and_then(Value::as_str)
                    .ok_or_else(|| RpcError::Protocol("import needs a module name".into()))?;
                let module = self.shared.modules.lock().get(name).cloned();
                module.map(Value::Object).ok_or_else(|| {
                    RpcError::Remote(RemoteException::new(
                        "ImportError",
                        format!("no module named '{}'", name),
                    ))
                })
            }
            Opcode::GetItem => {
                let name = frame
                    .args
                    .first()
                    .and_then(Value::as_str)
                    .ok_or_else(|| RpcError::Protocol("getitem needs a name".into()))?;
                self.get_published(name).ok_or_else(|| {
                    RpcError::Remote(RemoteException::new(
                        "KeyError",
                        format!("no published item '{}'", name),
                    ))
                })
            }
            Opcode::SetItem => {
                let name = frame
                    .args
                    .first()
                    .and_then(Value::as_str)
                    .ok_or_else(|| RpcError::Protocol("setitem needs a name".into()))?
                    .to_string();
                let value = frame
                    .args
                    .get(1)
                    .cloned()
                    .ok_or_else(|| RpcError::Protocol("setitem needs a value".into()))?;
                self.shared.namespace.lock().insert(name, value);
                Ok(Value::None)
            }
            Opcode::Call => {
                let name = frame
                    .args
                    .first()
                    .and_then(Value::as_str)
                    .ok_or_else(|| RpcError::Protocol("call needs a published name".into()))?;
                let target = self.get_published(name).ok_or_else(|| {
                    RpcError::Remote(RemoteException::new(
                        "KeyError",
                        format!("no published item '{}'", name),
                    ))
                })?;
                match target {
                    Value::Object(obj) => Ok(obj.call(&frame.args[1..], &frame.kwargs)?),
                    other => Err(RpcError::UnsupportedOp(format!(
                        "call on published {}",
                        other.kind_name()
                    ))),
                }
            }
            // Echo: materialize the argument under the caller's return
            // mode (the transfer path)
            Opcode::GetAttr => frame
                .args
                .first()
                .cloned()
                .ok_or_else(|| RpcError::UnsupportedOp("getattr on the server".into())),
            Opcode::GetId => Ok(Value::Int(0)),
            other => Err(RpcError::UnsupportedOp(format!(
                "{} on the server",
                other.as_str()
            ))),
        }
    }

    // ------------------------------------------------------------------
    // Return-mode policy
    // ------------------------------------------------------------------

    /// Apply the requested travel mode to a dispatch result.
    fn apply_return_mode(&self, value: Value, mode: ReturnMode) -> RpcResult<Value> {
        match mode {
            ReturnMode::Auto => Ok(self.auto_value(value)),
            ReturnMode::Proxy => Ok(match value {
                v @ (Value::Object(_) | Value::Proxy(_)) => v,
                other => Value::Object(ValueCell::new(other)),
            }),
            ReturnMode::Value => self.force_value(value),
        }
    }

    /// The `auto` policy: plain data by value (containers recursed),
    /// objects by snapshot or blob when small enough, by reference
    /// otherwise.
    fn auto_value(&self, value: Value) -> Value {
        let threshold = self.shared.config.auto_proxy_threshold;
        match value {
            Value::Object(obj) => {
                if let Some(snapshot) = obj.snapshot() {
                    if snapshot.approx_size() <= threshold {
                        return self.auto_value(snapshot);
                    }
                }
                if let Some(blob) = obj.to_blob() {
                    if blob.data.len() <= threshold {
                        return Value::Blob(blob);
                    }
                }
                Value::Object(obj)
            }
            Value::List(items) => {
                Value::List(items.into_iter().map(|v| self.auto_value(v)).collect())
            }
            Value::Map(map) => Value::Map(
                map.into_iter()
                    .map(|(k, v)| (k, self.auto_value(v)))
                    .collect(),
            ),
            other => other,
        }
    }

    /// The `value` mode: force a deep copy, failing on anything that only
    /// travels by reference. Proxies are identities and pass through.
    fn force_value(&self, value: Value) -> RpcResult<Value> {
        match value {
            Value::Object(obj) => {
                if let Some(snapshot) = obj.snapshot() {
                    return self.force_value(snapshot);
                }
                if let Some(blob) = obj.to_blob() {
                    return Ok(Value::Blob(blob));
                }
                Err(RpcError::Unserializable(obj.type_name()))
            }
            Value::List(items) => Ok(Value::List(
                items
                    .into_iter()
                    .map(|v| self.force_value(v))
                    .collect::<RpcResult<_>>()?,
            )),
            Value::Map(map) => Ok(Value::Map(
                map.into_iter()
                    .map(|(k, v)| Ok((k, self.force_value(v)?)))
                    .collect::<RpcResult<_>>()?,
            )),
            other => Ok(other),
        }
    }

    // ------------------------------------------------------------------
    // Replies and close
    // ------------------------------------------------------------------

    fn send_to_peer(&self, peer: u64, frame: Frame) {
        let (stream, key) = {
            let peers = self.shared.peers.lock();
            match peers.get(&peer) {
                Some(p) => (Arc::clone(&p.stream), p.key.clone()),
                None => {
                    log::debug!("rpc reply for departed peer {} dropped", peer);
                    return;
                }
            }
        };
        let id = frame.id;
        let ctx = EncodeCtx {
            server: Some(self.clone()),
            peer: key,
        };
        let bytes = match self.shared.codec.encode_frame(frame, &ctx) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("rpc failed to encode reply {}: {}", id, e);
                // Degrade to an error reply; this one always encodes
                match self.shared.codec.encode_frame(error_reply(id, &e), &ctx) {
                    Ok(bytes) => bytes,
                    Err(e2) => {
                        log::error!("rpc failed to encode error reply {}: {}", id, e2);
                        return;
                    }
                }
            }
        };
        if let Err(e) = stream.send(&bytes) {
            log::warn!("rpc send to peer {} failed: {}", peer, e);
            stream.close();
        }
    }

    fn do_close(&self) {
        *self.shared.phase.lock() = Phase::Closing;
        log::info!("rpc server {} closing", self.shared.address);
        self.shared.listener.close();

        // Reject whatever is still queued
        loop {
            let event = self.shared.queue.lock().pop_front();
            match event {
                Some(ServerEvent::Frame { peer, bytes }) => {
                    let ctx = DecodeCtx {
                        home: Some(self.clone()),
                        client: None,
                    };
                    if let Ok(frame) = self.shared.codec.decode_frame(&bytes, &ctx) {
                        if frame.kind == FrameKind::Request && frame.mode != Mode::Off {
                            self.send_to_peer(
                                peer,
                                Frame::reply_err(frame.id, ErrorKind::ShuttingDown, Value::None),
                            );
                        }
                    }
                }
                Some(ServerEvent::Connected { peer, stream, name, local_server }) => {
                    self.shared.peers.lock().insert(
                        peer,
                        Peer {
                            key: peer_key(peer, &name, local_server.as_deref()),
                            name,
                            local_server,
                            stream,
                        },
                    );
                }
                Some(_) => {}
                None => break,
            }
        }

        // Every known peer learns the server is gone, then the transport
        // goes down
        let peers: Vec<(u64, SharedStream, String)> = {
            let mut peers = self.shared.peers.lock();
            peers
                .drain()
                .map(|(id, p)| (id, p.stream, p.key))
                .collect()
        };
        for (_, stream, key) in &peers {
            let ctx = EncodeCtx {
                server: Some(self.clone()),
                peer: key.clone(),
            };
            if let Ok(bytes) = self
                .shared
                .codec
                .encode_frame(Frame::notice(Opcode::ServerClosed, Value::None), &ctx)
            {
                let _ = stream.send(&bytes);
            }
            stream.close();
        }

        self.shared.registry.drain();
        self.shared.nested_waiters.lock().clear();
    }

    // ------------------------------------------------------------------
    // Reentrancy windows
    // ------------------------------------------------------------------

    /// Dispatch one queued frame from a peer whose announced local server
    /// is `target`. Returns false when none is queued.
    fn pump_matching(&self, target: &str) -> bool {
        let event = {
            let mut queue = self.shared.queue.lock();
            let peers = self.shared.peers.lock();
            let position = queue.iter().position(|event| match event {
                // Registration is not dispatch; process connections so a
                // freshly dialed-back peer becomes matchable
                ServerEvent::Connected { .. } => true,
                ServerEvent::Frame { peer, .. } => peers
                    .get(peer)
                    .and_then(|p| p.local_server.as_deref())
                    .map(|addr| addr == target)
                    .unwrap_or(false),
                _ => false,
            });
            position.and_then(|idx| queue.remove(idx))
        };
        match event {
            Some(event) => {
                self.handle_event(event);
                true
            }
            None => false,
        }
    }

    fn register_nested_waiter(&self, shared: &Arc<FutureShared>) {
        self.shared.nested_waiters.lock().push(Arc::downgrade(shared));
    }

    fn unregister_nested_waiter(&self, shared: &Arc<FutureShared>) {
        let target = Arc::downgrade(shared);
        self.shared
            .nested_waiters
            .lock()
            .retain(|w| !w.ptr_eq(&target) && w.strong_count() > 0);
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Server({})", self.shared.address)
    }
}

/// Reference-attribution bucket for a connection.
///
/// A peer that announces a local server is keyed by that address, so that
/// references a third party attributed to "whoever lives at that address"
/// land in the same bucket, and multiple connections from one process
/// share it. Anonymous peers get a connection-unique key.
fn peer_key(peer: u64, name: &str, local_server: Option<&str>) -> String {
    match local_server {
        Some(addr) => addr.to_string(),
        None => format!("{}#{}", name, peer),
    }
}

fn parse_hello(payload: &Value) -> (String, Option<String>) {
    let mut name = "anonymous".to_string();
    let mut local_server = None;
    if let Value::Map(map) = payload {
        if let Some(Value::Str(s)) = map.get("name") {
            name = s.clone();
        }
        if let Some(Value::Str(s)) = map.get("local_server") {
            local_server = Some(s.clone());
        }
    }
    (name, local_server)
}

fn error_reply(id: u64, err: &RpcError) -> Frame {
    match err.kind() {
        Some(kind) => Frame::reply_err(id, kind, err.to_payload()),
        // Local-only failures cross the wire as remote-raised records
        None => {
            let exc = RemoteException::new("InternalError", err.to_string());
            Frame::reply_err(id, ErrorKind::RemoteRaised, exc.to_value())
        }
    }
}

// ============================================================================
// Reentrant pump handle
// ============================================================================

/// Reentrancy handle for a future parked on a server loop thread.
pub(crate) struct NestedPump {
    server: Server,
    target: String,
}

impl NestedPump {
    /// Dispatch one matching queued frame; false when none is waiting.
    pub(crate) fn pump_one(&self) -> bool {
        self.server.pump_matching(&self.target)
    }

    /// Register a waiter to be poked on queue activity.
    pub(crate) fn register_waiter(&self, shared: &Arc<FutureShared>) -> WaiterGuard {
        self.server.register_nested_waiter(shared);
        WaiterGuard {
            server: self.server.clone(),
            shared: Arc::clone(shared),
        }
    }
}

pub(crate) struct WaiterGuard {
    server: Server,
    shared: Arc<FutureShared>,
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        self.server.unregister_nested_waiter(&self.shared);
    }
}

/// The reentrancy pump for the calling thread, if it is a server loop
/// thread awaiting `target`.
pub(crate) fn nested_pump(target: &str) -> Option<NestedPump> {
    CURRENT_SERVER.with(|current| {
        current.borrow().as_ref().map(|server| NestedPump {
            server: server.clone(),
            target: target.to_string(),
        })
    })
}
