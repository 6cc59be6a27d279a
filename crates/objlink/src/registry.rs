// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-server table of values that have left the process by reference.
//!
//! An entry is born the first time a value is serialized by reference and
//! dies when its refcount reaches zero; the id is then retired and never
//! reused for the lifetime of the server. The refcount is the sum of
//! per-peer contributions so a peer disconnect releases everything that
//! peer held in one step.
//!
//! `own` is idempotent by value identity (the `Arc` pointer): registering
//! the same object again returns the same id and bumps the refcount.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::object::{object_ptr, ServerObject};
use crate::value::Capabilities;

/// One registered value.
pub struct ObjectEntry {
    /// Registry id (non-zero)
    pub id: u64,
    /// The owned value
    pub value: ServerObject,
    /// Type name recorded at registration
    pub type_name: String,
    /// Capability bitmap computed once at registration
    pub caps: Capabilities,
    /// Per-peer reference contributions
    refs: HashMap<String, u64>,
}

impl ObjectEntry {
    /// Total refcount over all peers.
    pub fn refcount(&self) -> u64 {
        self.refs.values().sum()
    }
}

#[derive(Default)]
struct RegistryInner {
    next_id: u64,
    entries: HashMap<u64, ObjectEntry>,
    // Arc data pointer -> id, for idempotent own()
    by_ptr: HashMap<usize, u64>,
}

/// Registry of objects owned by one server.
#[derive(Default)]
pub struct ObjectRegistry {
    inner: Mutex<RegistryInner>,
}

fn ptr_key(obj: &ServerObject) -> usize {
    object_ptr(obj)
}

impl ObjectRegistry {
    /// Empty registry; ids start at 1 (0 addresses the server itself).
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `obj` on behalf of `peer`, bumping its refcount by one.
    ///
    /// Returns `(id, type_name, caps)` for descriptor construction.
    pub fn own(&self, obj: &ServerObject, peer: &str) -> (u64, String, Capabilities) {
        let mut inner = self.inner.lock();
        let key = ptr_key(obj);
        if let Some(&id) = inner.by_ptr.get(&key) {
            let entry = inner
                .entries
                .get_mut(&id)
                .expect("by_ptr maps to a live entry");
            *entry.refs.entry(peer.to_string()).or_insert(0) += 1;
            return (id, entry.type_name.clone(), entry.caps);
        }

        inner.next_id += 1;
        let id = inner.next_id;
        let (type_name, caps) = (obj.type_name(), obj.capabilities());
        let mut refs = HashMap::new();
        refs.insert(peer.to_string(), 1);
        inner.entries.insert(
            id,
            ObjectEntry {
                id,
                value: Arc::clone(obj),
                type_name: type_name.clone(),
                caps,
                refs,
            },
        );
        inner.by_ptr.insert(key, id);
        log::debug!("registry: own id={} type={} for peer {}", id, type_name, peer);
        (id, type_name, caps)
    }

    /// Look up a registered value.
    pub fn get(&self, id: u64) -> Option<ServerObject> {
        self.inner.lock().entries.get(&id).map(|e| Arc::clone(&e.value))
    }

    /// Descriptor fields for a registered value, without bumping refs.
    pub fn describe(&self, id: u64) -> Option<(String, Capabilities)> {
        self.inner
            .lock()
            .entries
            .get(&id)
            .map(|e| (e.type_name.clone(), e.caps))
    }

    /// Id of an already-registered value, without bumping refs.
    pub fn id_of(&self, obj: &ServerObject) -> Option<u64> {
        self.inner.lock().by_ptr.get(&ptr_key(obj)).copied()
    }

    /// Add `n` references on behalf of `peer`.
    pub fn incref(&self, id: u64, peer: &str, n: u64) -> bool {
        let mut inner = self.inner.lock();
        match inner.entries.get_mut(&id) {
            Some(entry) => {
                *entry.refs.entry(peer.to_string()).or_insert(0) += n;
                true
            }
            None => false,
        }
    }

    /// Drop `n` references, preferring `peer`'s contribution.
    ///
    /// References released by a peer other than the one they were sent to
    /// (forwarded proxies) fall back to any non-empty bucket. Returns true
    /// if the entry was destroyed.
    pub fn decref(&self, id: u64, peer: &str, n: u64) -> bool {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries.get_mut(&id) else {
            log::warn!("registry: release for unknown id {}", id);
            return false;
        };

        let mut remaining = n;
        if let Some(count) = entry.refs.get_mut(peer) {
            let take = remaining.min(*count);
            *count -= take;
            remaining -= take;
        }
        while remaining > 0 {
            let Some((_, count)) = entry.refs.iter_mut().find(|(_, c)| **c > 0) else {
                log::warn!("registry: over-release of id {} by {}", id, peer);
                break;
            };
            let take = remaining.min(*count);
            *count -= take;
            remaining -= take;
        }
        entry.refs.retain(|_, c| *c > 0);

        if entry.refcount() == 0 {
            let key = ptr_key(&entry.value);
            inner.entries.remove(&id);
            inner.by_ptr.remove(&key);
            log::debug!("registry: released id={}", id);
            true
        } else {
            false
        }
    }

    /// Atomically drop every reference contributed by `peer`.
    pub fn release_all_from(&self, peer: &str) {
        let mut inner = self.inner.lock();
        let mut dead = Vec::new();
        for entry in inner.entries.values_mut() {
            entry.refs.remove(peer);
            if entry.refcount() == 0 {
                dead.push((entry.id, ptr_key(&entry.value)));
            }
        }
        for (id, key) in dead {
            inner.entries.remove(&id);
            inner.by_ptr.remove(&key);
            log::debug!("registry: released id={} (peer {} gone)", id, peer);
        }
    }

    /// Drop every entry (server shutdown).
    pub fn drain(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.by_ptr.clear();
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// True when no entries are live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total refcount for one entry, for introspection and tests.
    pub fn refcount(&self, id: u64) -> u64 {
        self.inner
            .lock()
            .entries
            .get(&id)
            .map(|e| e.refcount())
            .unwrap_or(0)
    }
}
