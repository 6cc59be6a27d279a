// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Local handles standing in for remote values.
//!
//! An [`ObjectProxy`] carries a [`ProxyDescriptor`] plus the client that
//! owns the session to the descriptor's server. Attribute and item access
//! compose lazily: `proxy.attr("a").attr("b")` never touches the wire, it
//! returns a new proxy whose descriptor path is one segment longer. The
//! round trip happens at the terminal operation (call, compare, len, item
//! read/write, explicit materialize).
//!
//! Identity: the per-client [`ProxyTable`] caches live proxies weakly by
//! `(server address, object id, path)` so equal descriptors resolve to the
//! same handle while any holder is alive. Dropping the last holder
//! schedules a batched release of the references this handle owns; derived
//! proxies keep their root alive instead of owning references themselves.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use crate::client::Client;
use crate::error::{RpcError, RpcResult};
use crate::future::RemoteFuture;
use crate::object::CompareOp;
use crate::value::{Capabilities, PathSeg, ProxyDescriptor, Value, ValueMap};
use crate::wire::{Opcode, ReturnMode};

/// Per-proxy option overrides.
#[derive(Clone, Debug, Default)]
pub struct ProxyOptions {
    /// Deadline for sync operations through this proxy; the client default
    /// applies when unset
    pub timeout: Option<Duration>,
    /// Return mode for operations through this proxy
    pub return_mode: ReturnMode,
}

pub(crate) struct ProxyShared {
    descriptor: ProxyDescriptor,
    client: Client,
    options: Mutex<ProxyOptions>,
    // Server-side references this handle releases on drop; 0 for derived
    // proxies, which pin their parent instead
    owned_refs: AtomicU64,
    _parent: Option<Arc<ProxyShared>>,
}

impl Drop for ProxyShared {
    fn drop(&mut self) {
        let refs = self.owned_refs.load(Ordering::Relaxed);
        if refs > 0 {
            self.client
                .schedule_release(self.descriptor.object_id, refs);
        }
        self.client.proxies().forget(&self.descriptor);
    }
}

/// A handle that behaves like a remote value.
#[derive(Clone)]
pub struct ObjectProxy {
    shared: Arc<ProxyShared>,
}

impl ObjectProxy {
    /// The wire identity of this proxy.
    pub fn descriptor(&self) -> ProxyDescriptor {
        self.shared.descriptor.clone()
    }

    /// Address of the owning server.
    pub fn address(&self) -> String {
        self.shared.descriptor.server_address.clone()
    }

    /// Object id on the owning server.
    pub fn object_id(&self) -> u64 {
        self.shared.descriptor.object_id
    }

    /// Type name recorded when the object left its server.
    pub fn type_name(&self) -> String {
        self.shared.descriptor.type_name.clone()
    }

    /// Capability bitmap of the root object.
    pub fn capabilities(&self) -> Capabilities {
        self.shared.descriptor.caps
    }

    /// Override options for operations through this proxy.
    pub fn set_options(&self, options: ProxyOptions) {
        *self.shared.options.lock() = options;
    }

    /// Lazily extend the attribute chain. No round trip.
    pub fn attr(&self, name: impl Into<String>) -> ObjectProxy {
        self.derive(PathSeg::Attr(name.into()))
    }

    /// Lazily extend the chain with an item access. No round trip.
    pub fn item(&self, key: impl Into<Value>) -> ObjectProxy {
        self.derive(PathSeg::Item(key.into()))
    }

    fn derive(&self, seg: PathSeg) -> ObjectProxy {
        let desc = self.shared.descriptor.extended(seg);
        self.shared.client.proxies().intern(
            &self.shared.client,
            desc,
            0,
            Some(Arc::clone(&self.shared)),
        )
    }

    /// Invoke the target with positional arguments, blocking for the
    /// result.
    pub fn call(&self, args: Vec<Value>) -> RpcResult<Value> {
        self.call_kw(args, ValueMap::new())
    }

    /// Invoke the target with positional and keyword arguments.
    pub fn call_kw(&self, args: Vec<Value>, kwargs: ValueMap) -> RpcResult<Value> {
        self.check_cap(Capabilities::CALL, "call")?;
        self.request_sync(Opcode::Call, args, kwargs)
    }

    /// Invoke asynchronously; the returned future observes the reply.
    pub fn call_async(&self, args: Vec<Value>) -> RpcResult<RemoteFuture> {
        self.check_cap(Capabilities::CALL, "call")?;
        let (return_mode, _) = self.op_settings();
        self.shared.client.request_async(
            Opcode::Call,
            self.object_id(),
            self.shared.descriptor.path.clone(),
            args,
            ValueMap::new(),
            return_mode,
        )
    }

    /// Fire-and-forget invocation: no reply, failures invisible.
    pub fn call_off(&self, args: Vec<Value>) -> RpcResult<()> {
        self.check_cap(Capabilities::CALL, "call")?;
        self.shared.client.request_off(
            Opcode::Call,
            self.object_id(),
            self.shared.descriptor.path.clone(),
            args,
            ValueMap::new(),
        )
    }

    /// Terminal keyed read.
    pub fn get_item(&self, key: impl Into<Value>) -> RpcResult<Value> {
        self.check_cap(Capabilities::GETITEM, "getitem")?;
        self.request_sync(Opcode::GetItem, vec![key.into()], ValueMap::new())
    }

    /// Terminal keyed write.
    pub fn set_item(&self, key: impl Into<Value>, value: impl Into<Value>) -> RpcResult<()> {
        self.check_cap(Capabilities::SETITEM, "setitem")?;
        self.request_sync(Opcode::SetItem, vec![key.into(), value.into()], ValueMap::new())
            .map(|_| ())
    }

    /// Terminal keyed delete.
    pub fn del_item(&self, key: impl Into<Value>) -> RpcResult<()> {
        self.check_cap(Capabilities::SETITEM, "delitem")?;
        self.request_sync(Opcode::DelItem, vec![key.into()], ValueMap::new())
            .map(|_| ())
    }

    /// Fetch a named member eagerly (one round trip now).
    ///
    /// Prefer [`attr`](Self::attr) unless the value itself is needed.
    pub fn get_attr(&self, name: impl Into<String>) -> RpcResult<Value> {
        self.request_sync(
            Opcode::GetAttr,
            vec![Value::Str(name.into())],
            ValueMap::new(),
        )
    }

    /// Assign a named member.
    pub fn set_attr(&self, name: impl Into<String>, value: impl Into<Value>) -> RpcResult<()> {
        self.request_sync(
            Opcode::SetAttr,
            vec![Value::Str(name.into()), value.into()],
            ValueMap::new(),
        )
        .map(|_| ())
    }

    /// Remote length.
    pub fn len(&self) -> RpcResult<u64> {
        self.check_cap(Capabilities::LEN, "len")?;
        let value = self.request_sync(Opcode::Len, vec![], ValueMap::new())?;
        value
            .as_int()
            .map(|v| v as u64)
            .ok_or_else(|| RpcError::Protocol(format!("len returned {:?}", value)))
    }

    /// Remote structural comparison.
    pub fn compare(&self, op: CompareOp, other: impl Into<Value>) -> RpcResult<bool> {
        let needed = if op.needs_ordering() {
            Capabilities::CMP_ORD
        } else {
            Capabilities::CMP_EQ
        };
        self.check_cap(needed, "cmp")?;
        let value = self.request_sync(
            Opcode::Cmp,
            vec![Value::Str(op.symbol().into()), other.into()],
            ValueMap::new(),
        )?;
        value
            .as_bool()
            .ok_or_else(|| RpcError::Protocol(format!("cmp returned {:?}", value)))
    }

    /// Remote equality against a plain value.
    pub fn remote_eq(&self, other: impl Into<Value>) -> RpcResult<bool> {
        self.compare(CompareOp::Eq, other)
    }

    /// Explicit materialize: resolve the chain and copy the value back.
    ///
    /// This is the one operation that forces the `value` return mode; it
    /// fails with `UNSERIALIZABLE` when the target cannot be copied.
    pub fn value(&self) -> RpcResult<Value> {
        let timeout = self.timeout();
        self.shared.client.request_sync(
            Opcode::GetAttr,
            self.object_id(),
            self.shared.descriptor.path.clone(),
            vec![],
            ValueMap::new(),
            ReturnMode::Value,
            timeout,
        )
    }

    /// The target's object id on its server, for identity checks.
    pub fn remote_id(&self) -> RpcResult<u64> {
        let value = self.request_sync(Opcode::GetId, vec![], ValueMap::new())?;
        value
            .as_int()
            .map(|v| v as u64)
            .ok_or_else(|| RpcError::Protocol(format!("get_id returned {:?}", value)))
    }

    /// No-op round trip to the owning server.
    pub fn ping(&self) -> RpcResult<()> {
        self.request_sync(Opcode::Ping, vec![], ValueMap::new())
            .map(|_| ())
    }

    fn op_settings(&self) -> (ReturnMode, Option<Duration>) {
        let options = self.shared.options.lock();
        (options.return_mode, options.timeout)
    }

    fn timeout(&self) -> Option<Duration> {
        self.shared.options.lock().timeout
    }

    fn request_sync(&self, op: Opcode, args: Vec<Value>, kwargs: ValueMap) -> RpcResult<Value> {
        let (return_mode, timeout) = self.op_settings();
        self.shared.client.request_sync(
            op,
            self.object_id(),
            self.shared.descriptor.path.clone(),
            args,
            kwargs,
            return_mode,
            timeout,
        )
    }

    /// Static capability rejection applies only to root proxies; the
    /// capabilities of a chained target are unknown until resolution.
    fn check_cap(&self, needed: Capabilities, op: &str) -> RpcResult<()> {
        if self.shared.descriptor.path.is_empty()
            && !self.shared.descriptor.caps.contains(needed)
        {
            return Err(RpcError::UnsupportedOp(op.to_string()));
        }
        Ok(())
    }
}

impl PartialEq for ObjectProxy {
    fn eq(&self, other: &Self) -> bool {
        let a = &self.shared.descriptor;
        let b = &other.shared.descriptor;
        a.server_address == b.server_address
            && a.object_id == b.object_id
            && path_key(&a.path) == path_key(&b.path)
    }
}

impl std::fmt::Debug for ObjectProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let d = &self.shared.descriptor;
        write!(
            f,
            "ObjectProxy({} id={} path={})",
            d.server_address,
            d.object_id,
            path_key(&d.path)
        )
    }
}

// ============================================================================
// ProxyTable
// ============================================================================

fn path_key(path: &[PathSeg]) -> String {
    let mut key = String::new();
    for seg in path {
        match seg {
            PathSeg::Attr(name) => {
                key.push('.');
                key.push_str(name);
            }
            PathSeg::Item(value) => {
                key.push_str(&format!("[{:?}]", value));
            }
        }
    }
    key
}

/// Weak cache of live proxies keyed by `(address, object id, path)`.
#[derive(Default)]
pub(crate) struct ProxyTable {
    map: Mutex<HashMap<(String, u64, String), Weak<ProxyShared>>>,
}

impl ProxyTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Return the live proxy for `desc`, creating one if needed.
    ///
    /// `ref_delta` is the number of server-side references this descriptor
    /// carries (1 for a decoded descriptor, 0 for locally derived paths);
    /// it accrues onto whichever handle ends up owning the identity.
    pub(crate) fn intern(
        &self,
        client: &Client,
        desc: ProxyDescriptor,
        ref_delta: u64,
        parent: Option<Arc<ProxyShared>>,
    ) -> ObjectProxy {
        let key = (
            desc.server_address.clone(),
            desc.object_id,
            path_key(&desc.path),
        );
        let mut map = self.map.lock();
        if let Some(existing) = map.get(&key).and_then(Weak::upgrade) {
            existing.owned_refs.fetch_add(ref_delta, Ordering::Relaxed);
            return ObjectProxy { shared: existing };
        }

        let shared = Arc::new(ProxyShared {
            descriptor: desc,
            client: client.clone(),
            options: Mutex::new(ProxyOptions::default()),
            owned_refs: AtomicU64::new(ref_delta),
            _parent: parent,
        });
        map.retain(|_, weak| weak.strong_count() > 0);
        map.insert(key, Arc::downgrade(&shared));
        ObjectProxy { shared }
    }

    /// Drop a dead entry after its proxy is released.
    pub(crate) fn forget(&self, desc: &ProxyDescriptor) {
        let key = (
            desc.server_address.clone(),
            desc.object_id,
            path_key(&desc.path),
        );
        let mut map = self.map.lock();
        if let Some(weak) = map.get(&key) {
            if weak.strong_count() == 0 {
                map.remove(&key);
            }
        }
    }
}
