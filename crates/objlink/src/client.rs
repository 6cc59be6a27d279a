// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Client side of a session: request submission and the receive loop.
//!
//! Each [`Client`] connects to exactly one server. Public operations may be
//! called from any thread; they encode the request, hand it to the
//! outbound writer queue and, for `sync` calls, park on the per-request
//! future until the receive loop delivers the reply.
//!
//! The receive loop is a single dedicated thread. It multiplexes replies
//! to waiters by request id and dispatches server-initiated notices:
//! `release` (folded into the attached local server's registry), `log`
//! (re-emitted through the log facade), and `server_closed` (fails all
//! pending work with `CONNECTION_LOST`).
//!
//! Clients are created lazily per target address through [`get_client`]
//! and live in a process-global table until closed. Proxy releases are
//! coalesced per server and flushed every batch window or when the batch
//! fills, whichever comes first.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{unbounded, Sender};
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};

use crate::codec::{Codec, DecodeCtx, EncodeCtx};
use crate::config::{ClientConfig, MAX_FRAME_SIZE};
use crate::error::{RpcError, RpcResult};
use crate::future::{FutureShared, RemoteFuture};
use crate::proxy::{ObjectProxy, ProxyTable};
use crate::server::Server;
use crate::transport::{self, Address, SharedStream};
use crate::value::{PathSeg, ProxyDescriptor, Value, ValueMap};
use crate::wire::{Frame, FrameKind, Mode, Opcode, ReturnMode, Status};

/// Process-global table of live clients, keyed by canonical address.
static CLIENTS: Mutex<Vec<(String, Client)>> = Mutex::new(Vec::new());

static NAME_SEQ: AtomicU64 = AtomicU64::new(0);

/// The client for `address`, created on first use.
///
/// A lazily created client attaches the process-wide local server (if one
/// is installed) as its home for by-reference arguments.
pub fn get_client(address: &str) -> RpcResult<Client> {
    Client::get_or_connect(address, crate::loopback::local_server())
}

/// Drop a closed client from the process-global table.
fn forget_client(address: &str) {
    CLIENTS.lock().retain(|(addr, _)| addr != address);
}

struct ReleaseBatch {
    entries: Vec<(u64, u64)>,
    flush_now: bool,
    shutdown: bool,
}

struct ClientInner {
    address: String,
    name: String,
    config: ClientConfig,
    codec: Codec,
    stream: SharedStream,
    out_tx: Sender<Vec<u8>>,

    /// Pending requests: request id -> future shared state
    pending: DashMap<u64, Arc<FutureShared>>,
    next_request_id: AtomicU64,

    proxies: ProxyTable,
    local_server: Mutex<Option<Server>>,

    releases: Mutex<ReleaseBatch>,
    release_cv: Condvar,

    disconnected: AtomicBool,
    closed: AtomicBool,
}

/// Connection to a remote server.
///
/// Cheap to clone; all clones share one session.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Connect with default configuration and the process-wide local
    /// server (if any).
    pub fn connect(address: &str) -> RpcResult<Client> {
        Self::connect_with(address, ClientConfig::from_env(), crate::loopback::local_server())
    }

    /// Connect with explicit configuration and local server.
    pub fn connect_with(
        address: &str,
        config: ClientConfig,
        local_server: Option<Server>,
    ) -> RpcResult<Client> {
        let canonical = Address::parse(address)?.to_string();
        let stream = transport::connect(&canonical, MAX_FRAME_SIZE)?;
        let name = format!(
            "{}.{}:{}",
            std::process::id(),
            NAME_SEQ.fetch_add(1, Ordering::Relaxed),
            canonical
        );
        log::info!("rpc connect to {} as {}", canonical, name);

        let (out_tx, out_rx) = unbounded::<Vec<u8>>();
        let inner = Arc::new(ClientInner {
            address: canonical,
            name,
            codec: Codec::new(config.serializer),
            config,
            stream,
            out_tx,
            pending: DashMap::new(),
            next_request_id: AtomicU64::new(1),
            proxies: ProxyTable::new(),
            local_server: Mutex::new(local_server),
            releases: Mutex::new(ReleaseBatch {
                entries: Vec::new(),
                flush_now: false,
                shutdown: false,
            }),
            release_cv: Condvar::new(),
            disconnected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        let client = Client { inner };

        client.send_hello()?;

        {
            let writer = client.clone();
            std::thread::Builder::new()
                .name("objlink-client-writer".into())
                .spawn(move || writer.run_writer(out_rx))
                .expect("spawn client writer thread");
        }
        {
            let reader = client.clone();
            std::thread::Builder::new()
                .name("objlink-client-recv".into())
                .spawn(move || reader.run_receive_loop())
                .expect("spawn client receive thread");
        }
        if !client.inner.config.release_batch.is_zero() {
            let flusher = client.clone();
            std::thread::Builder::new()
                .name("objlink-client-release".into())
                .spawn(move || flusher.run_release_flusher())
                .expect("spawn client release thread");
        }

        Ok(client)
    }

    /// Existing client for `address`, or a new one homed at `home`.
    pub(crate) fn get_or_connect(address: &str, home: Option<Server>) -> RpcResult<Client> {
        let canonical = Address::parse(address)?.to_string();
        let mut table = CLIENTS.lock();
        if let Some(pos) = table.iter().position(|(addr, _)| *addr == canonical) {
            let client = table[pos].1.clone();
            if client.disconnected() {
                // Stale entry from a dead session; dial fresh
                table.remove(pos);
            } else {
                if let Some(server) = home {
                    client.attach_local_server(server);
                }
                return Ok(client);
            }
        }
        let client = Client::connect_with(&canonical, ClientConfig::from_env(), home)?;
        table.push((canonical, client.clone()));
        Ok(client)
    }

    /// Address of the remote server.
    pub fn address(&self) -> &str {
        &self.inner.address
    }

    /// Identity announced to the server.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// True once the session is known dead.
    pub fn disconnected(&self) -> bool {
        self.inner.disconnected.load(Ordering::Relaxed)
    }

    /// Install a local server after the fact (no-op if one is attached).
    pub fn attach_local_server(&self, server: Server) {
        let mut guard = self.inner.local_server.lock();
        if guard.is_none() {
            *guard = Some(server);
        }
    }

    pub(crate) fn proxies(&self) -> &ProxyTable {
        &self.inner.proxies
    }

    /// Build (or dedup) a proxy from a decoded descriptor. The descriptor
    /// carries one server-side reference.
    pub(crate) fn proxy_from_descriptor(&self, desc: ProxyDescriptor) -> ObjectProxy {
        self.inner.proxies.intern(self, desc, 1, None)
    }

    // ------------------------------------------------------------------
    // Request submission
    // ------------------------------------------------------------------

    fn encode(&self, frame: Frame) -> RpcResult<Vec<u8>> {
        let ctx = EncodeCtx {
            server: self.inner.local_server.lock().clone(),
            peer: self.inner.address.clone(),
        };
        self.inner.codec.encode_frame(frame, &ctx)
    }

    fn submit(&self, frame: Frame) -> RpcResult<()> {
        if self.inner.closed.load(Ordering::Relaxed) {
            return Err(RpcError::Closed);
        }
        if self.disconnected() {
            return Err(RpcError::connection_lost(self.inner.address.clone()));
        }
        let bytes = self.encode(frame)?;
        self.inner
            .out_tx
            .send(bytes)
            .map_err(|_| RpcError::connection_lost(self.inner.address.clone()))
    }

    fn start_request(
        &self,
        op: Opcode,
        target: u64,
        path: Vec<PathSeg>,
        args: Vec<Value>,
        kwargs: ValueMap,
        mode: Mode,
        return_mode: ReturnMode,
    ) -> RpcResult<RemoteFuture> {
        let id = self.inner.next_request_id.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "rpc request '{}' to {} [req_id={}]",
            op.as_str(),
            self.inner.address,
            id
        );
        let shared = FutureShared::new();
        self.inner.pending.insert(id, Arc::clone(&shared));

        let frame = Frame::request(id, op, target, path)
            .with_args(args)
            .with_kwargs(kwargs)
            .with_mode(mode)
            .with_return_mode(return_mode);
        if let Err(e) = self.submit(frame) {
            self.inner.pending.remove(&id);
            return Err(e);
        }
        Ok(RemoteFuture::new(shared, self.clone(), id))
    }

    /// Synchronous request: park until reply or deadline.
    ///
    /// A timeout abandons the request; its late reply is discarded.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn request_sync(
        &self,
        op: Opcode,
        target: u64,
        path: Vec<PathSeg>,
        args: Vec<Value>,
        kwargs: ValueMap,
        return_mode: ReturnMode,
        timeout: Option<Duration>,
    ) -> RpcResult<Value> {
        let future = self.start_request(op, target, path, args, kwargs, Mode::Sync, return_mode)?;
        let timeout = timeout.unwrap_or(self.inner.config.default_timeout);
        match future.result(Some(timeout)) {
            Err(RpcError::Timeout) => {
                self.inner.pending.remove(&future.request_id());
                Err(RpcError::Timeout)
            }
            other => other,
        }
    }

    /// Asynchronous request: returns the observing future.
    pub(crate) fn request_async(
        &self,
        op: Opcode,
        target: u64,
        path: Vec<PathSeg>,
        args: Vec<Value>,
        kwargs: ValueMap,
        return_mode: ReturnMode,
    ) -> RpcResult<RemoteFuture> {
        self.start_request(op, target, path, args, kwargs, Mode::Async, return_mode)
    }

    /// Fire-and-forget request: no id, no reply, failures invisible.
    pub(crate) fn request_off(
        &self,
        op: Opcode,
        target: u64,
        path: Vec<PathSeg>,
        args: Vec<Value>,
        kwargs: ValueMap,
    ) -> RpcResult<()> {
        let frame = Frame::request(0, op, target, path)
            .with_args(args)
            .with_kwargs(kwargs)
            .with_mode(Mode::Off);
        self.submit(frame)
    }

    // ------------------------------------------------------------------
    // Public operations
    // ------------------------------------------------------------------

    /// No-op round trip, for connectivity checks.
    pub fn ping(&self) -> RpcResult<()> {
        self.ping_with(None)
    }

    /// Make sure the server is connected and answering.
    ///
    /// Pings with short deadlines until one lands or `timeout` elapses;
    /// useful right after connecting to a server that is still starting
    /// its loop.
    pub fn ensure_connection(&self, timeout: Duration) -> RpcResult<()> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            match self.ping_with(Some(Duration::from_millis(100))) {
                Ok(()) => return Ok(()),
                Err(RpcError::Timeout) => {
                    if std::time::Instant::now() >= deadline {
                        return Err(RpcError::Timeout);
                    }
                }
                Err(other) => return Err(other),
            }
        }
    }

    /// Ping with an explicit deadline.
    pub fn ping_with(&self, timeout: Option<Duration>) -> RpcResult<()> {
        self.request_sync(
            Opcode::Ping,
            0,
            vec![],
            vec![],
            ValueMap::new(),
            ReturnMode::Auto,
            timeout,
        )
        .map(|_| ())
    }

    /// Import a module registered on the server, as a proxy.
    pub fn import(&self, module: &str) -> RpcResult<ObjectProxy> {
        let value = self.request_sync(
            Opcode::Import,
            0,
            vec![],
            vec![Value::Str(module.to_string())],
            ValueMap::new(),
            ReturnMode::Auto,
            None,
        )?;
        match value {
            Value::Proxy(p) => Ok(p),
            other => Err(RpcError::Protocol(format!(
                "import returned {:?}",
                other.kind_name()
            ))),
        }
    }

    /// Fetch an item published under `name` on the server.
    pub fn get_named(&self, name: &str) -> RpcResult<Value> {
        self.request_sync(
            Opcode::GetItem,
            0,
            vec![],
            vec![Value::Str(name.to_string())],
            ValueMap::new(),
            ReturnMode::Auto,
            None,
        )
    }

    /// Publish `value` under `name` on the server.
    pub fn set_named(&self, name: &str, value: impl Into<Value>) -> RpcResult<()> {
        self.request_sync(
            Opcode::SetItem,
            0,
            vec![],
            vec![Value::Str(name.to_string()), value.into()],
            ValueMap::new(),
            ReturnMode::Auto,
            None,
        )
        .map(|_| ())
    }

    /// Fetch a published item as a proxy regardless of its size or shape.
    pub fn get_proxy(&self, name: &str) -> RpcResult<ObjectProxy> {
        let value = self.request_sync(
            Opcode::GetItem,
            0,
            vec![],
            vec![Value::Str(name.to_string())],
            ValueMap::new(),
            ReturnMode::Proxy,
            None,
        )?;
        match value {
            Value::Proxy(p) => Ok(p),
            other => Err(RpcError::Protocol(format!(
                "get_proxy returned {:?}",
                other.kind_name()
            ))),
        }
    }

    /// Send a value to the server and get back a proxy to the server-side
    /// copy.
    pub fn transfer(&self, value: impl Into<Value>) -> RpcResult<ObjectProxy> {
        let result = self.request_sync(
            Opcode::GetAttr,
            0,
            vec![],
            vec![value.into()],
            ValueMap::new(),
            ReturnMode::Proxy,
            None,
        )?;
        match result {
            Value::Proxy(p) => Ok(p),
            other => Err(RpcError::Protocol(format!(
                "transfer returned {:?}",
                other.kind_name()
            ))),
        }
    }

    /// Close this client: cancel pending futures with `Closed`, send the
    /// final release batch best-effort, and tear down the session.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("rpc client for {} closing", self.inner.address);

        self.fail_all_pending(&RpcError::Closed);

        // Final release batch, written directly: the writer thread may
        // already be gone
        let entries = {
            let mut batch = self.inner.releases.lock();
            batch.shutdown = true;
            self.inner.release_cv.notify_all();
            std::mem::take(&mut batch.entries)
        };
        if !entries.is_empty() && !self.disconnected() {
            if let Ok(bytes) = self.encode(release_frame(entries)) {
                let _ = self.inner.stream.send(&bytes);
            }
        }

        self.inner.stream.close();
        forget_client(&self.inner.address);
    }

    // ------------------------------------------------------------------
    // Release batching
    // ------------------------------------------------------------------

    /// Queue a release of `n` references to `id`, coalesced per server.
    ///
    /// With a zero batch window (debug mode) the notice goes out
    /// immediately.
    pub(crate) fn schedule_release(&self, id: u64, n: u64) {
        if self.inner.closed.load(Ordering::Relaxed) || self.disconnected() {
            return;
        }
        if self.inner.config.release_batch.is_zero() {
            let _ = self.submit(release_frame(vec![(id, n)]));
            return;
        }
        let mut batch = self.inner.releases.lock();
        batch.entries.push((id, n));
        if batch.entries.len() >= self.inner.config.release_batch_max {
            batch.flush_now = true;
            self.inner.release_cv.notify_all();
        }
    }

    /// Cancellation notice for an in-flight request.
    pub(crate) fn notify_cancel(&self, request_id: u64) {
        let _ = self.submit(Frame::notice(Opcode::Cancel, Value::Int(request_id as i64)));
    }

    fn run_release_flusher(self) {
        loop {
            let entries = {
                let mut batch = self.inner.releases.lock();
                if batch.shutdown {
                    return;
                }
                if !batch.flush_now {
                    // Let the coalescing window elapse (or a full batch /
                    // shutdown cut it short)
                    self.inner
                        .release_cv
                        .wait_for(&mut batch, self.inner.config.release_batch);
                }
                if batch.shutdown {
                    return;
                }
                batch.flush_now = false;
                std::mem::take(&mut batch.entries)
            };
            if !entries.is_empty() {
                let _ = self.submit(release_frame(entries));
            }
        }
    }

    // ------------------------------------------------------------------
    // Writer and receive loops
    // ------------------------------------------------------------------

    fn run_writer(self, out_rx: crossbeam::channel::Receiver<Vec<u8>>) {
        while let Ok(bytes) = out_rx.recv() {
            if let Err(e) = self.inner.stream.send(&bytes) {
                log::warn!("rpc send to {} failed: {}", self.inner.address, e);
                self.session_lost();
                return;
            }
        }
    }

    fn run_receive_loop(self) {
        loop {
            let bytes = match self.inner.stream.recv() {
                Ok(bytes) => bytes,
                Err(e) => {
                    if !self.inner.closed.load(Ordering::Relaxed) {
                        log::info!("rpc connection to {} lost: {}", self.inner.address, e);
                    }
                    self.session_lost();
                    return;
                }
            };
            let ctx = DecodeCtx {
                home: self.inner.local_server.lock().clone(),
                client: Some(self.clone()),
            };
            let frame = match self.inner.codec.decode_frame(&bytes, &ctx) {
                Ok(frame) => frame,
                Err(e) => {
                    // Codec failures are fatal to the session
                    log::error!("rpc bad frame from {}: {}", self.inner.address, e);
                    self.session_lost();
                    self.inner.stream.close();
                    return;
                }
            };
            self.dispatch_incoming(frame);
        }
    }

    fn dispatch_incoming(&self, frame: Frame) {
        match frame.kind {
            FrameKind::Reply => {
                log::debug!(
                    "rpc recv result from {} [req_id={}]",
                    self.inner.address,
                    frame.id
                );
                let Some((_, shared)) = self.inner.pending.remove(&frame.id) else {
                    // Abandoned or cancelled request; late reply discarded
                    log::debug!("rpc late reply for request {}", frame.id);
                    return;
                };
                let result = match frame.status {
                    Status::Ok => Ok(frame.payload),
                    Status::Err(kind) => Err(RpcError::from_wire(kind, &frame.payload)),
                };
                shared.complete(result);
            }
            FrameKind::Notice => self.dispatch_notice(frame),
            FrameKind::Request => {
                log::warn!(
                    "rpc unexpected request frame on client link from {}",
                    self.inner.address
                );
            }
        }
    }

    fn dispatch_notice(&self, frame: Frame) {
        match frame.op {
            Opcode::ServerClosed => {
                log::info!("rpc server {} closed", self.inner.address);
                self.session_lost();
            }
            Opcode::Release => {
                // The remote server released references into our local
                // server without dialing back
                let Some(server) = self.inner.local_server.lock().clone() else {
                    log::warn!("rpc release notice without a local server");
                    return;
                };
                for (id, n) in parse_release_payload(&frame.payload) {
                    server.registry().decref(id, &self.inner.address, n);
                }
            }
            Opcode::Log => {
                let (level, message) = parse_log_payload(&frame.payload);
                log::log!(level, "[remote {}] {}", self.inner.address, message);
            }
            other => {
                log::warn!("rpc unexpected notice '{}'", other.as_str());
            }
        }
    }

    fn session_lost(&self) {
        if self.inner.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        let err = RpcError::connection_lost(self.inner.address.clone());
        self.fail_all_pending(&err);
        forget_client(&self.inner.address);
    }

    fn fail_all_pending(&self, err: &RpcError) {
        let ids: Vec<u64> = self.inner.pending.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, shared)) = self.inner.pending.remove(&id) {
                shared.complete(Err(err.duplicate()));
            }
        }
    }

    fn send_hello(&self) -> RpcResult<()> {
        let mut payload = ValueMap::new();
        payload.insert("name".into(), Value::Str(self.inner.name.clone()));
        let local = self
            .inner
            .local_server
            .lock()
            .as_ref()
            .map(|s| s.address());
        if let Some(addr) = local {
            payload.insert("local_server".into(), Value::Str(addr));
        }
        let bytes = self.encode(Frame::notice(Opcode::Hello, Value::Map(payload)))?;
        self.inner.stream.send(&bytes)?;
        Ok(())
    }
}

fn release_frame(entries: Vec<(u64, u64)>) -> Frame {
    let payload = Value::List(
        entries
            .into_iter()
            .map(|(id, n)| Value::List(vec![Value::Int(id as i64), Value::Int(n as i64)]))
            .collect(),
    );
    Frame::notice(Opcode::Release, payload)
}

/// Parse a release payload: a list of `[id, n]` pairs.
pub(crate) fn parse_release_payload(payload: &Value) -> Vec<(u64, u64)> {
    let Some(items) = payload.as_list() else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let pair = item.as_list()?;
            let id = pair.first()?.as_int()?;
            let n = pair.get(1)?.as_int()?;
            if id >= 0 && n > 0 {
                Some((id as u64, n as u64))
            } else {
                None
            }
        })
        .collect()
}

fn parse_log_payload(payload: &Value) -> (log::Level, String) {
    let mut level = log::Level::Info;
    let mut message = String::new();
    if let Value::Map(map) = payload {
        if let Some(Value::Str(s)) = map.get("level") {
            level = match s.as_str() {
                "error" => log::Level::Error,
                "warn" => log::Level::Warn,
                "debug" => log::Level::Debug,
                "trace" => log::Level::Trace,
                _ => log::Level::Info,
            };
        }
        if let Some(Value::Str(s)) = map.get("message") {
            message = s.clone();
        }
    }
    (level, message)
}
