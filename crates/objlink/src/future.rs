// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Futures for in-flight requests.
//!
//! A [`RemoteFuture`] is the handle returned by `async`-mode operations.
//! The shared state is a mutex + condvar pair: the client's receive loop
//! completes it, callers park on it, and a server opening a reentrancy
//! window pokes it whenever new frames arrive so the parked server thread
//! can service callbacks from the peer it is awaiting (the only two
//! suspension points in the system).
//!
//! Cancellation is best-effort and latches exactly once: a cancelled
//! future's result is `CANCELLED` regardless of any late reply.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::client::Client;
use crate::error::{RpcError, RpcResult};
use crate::value::Value;

pub(crate) struct FutureState {
    result: Option<RpcResult<Value>>,
    // Bumped by poke() so reentrant waiters recheck the server queue
    wake_seq: u64,
}

/// Shared state between a waiter, the receive loop, and reentrant pokes.
pub(crate) struct FutureShared {
    state: Mutex<FutureState>,
    cv: Condvar,
}

impl FutureShared {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FutureState {
                result: None,
                wake_seq: 0,
            }),
            cv: Condvar::new(),
        })
    }

    /// Deliver the result. Late replies to a completed or cancelled future
    /// are dropped.
    pub(crate) fn complete(&self, result: RpcResult<Value>) {
        let mut state = self.state.lock();
        if state.result.is_none() {
            state.result = Some(result);
            self.cv.notify_all();
        }
    }

    /// Latch cancellation. Returns true if this call cancelled the future.
    pub(crate) fn cancel(&self) -> bool {
        let mut state = self.state.lock();
        if state.result.is_some() {
            return false;
        }
        state.result = Some(Err(RpcError::Cancelled));
        self.cv.notify_all();
        true
    }

    /// Wake a parked waiter without completing (queue activity).
    pub(crate) fn poke(&self) {
        let mut state = self.state.lock();
        state.wake_seq += 1;
        self.cv.notify_all();
    }

    pub(crate) fn is_done(&self) -> bool {
        self.state.lock().result.is_some()
    }

    fn take_duplicate(&self) -> Option<RpcResult<Value>> {
        let state = self.state.lock();
        state.result.as_ref().map(|r| match r {
            Ok(v) => Ok(v.clone()),
            Err(e) => Err(e.duplicate()),
        })
    }

    /// Current wake sequence; capture before draining external work so a
    /// poke in between is never missed.
    pub(crate) fn wake_seq(&self) -> u64 {
        self.state.lock().wake_seq
    }

    /// Park until completed, poked past `entry_seq`, or the deadline
    /// passes. Returns false only on deadline expiry with no result.
    fn park_seq(&self, entry_seq: u64, deadline: Option<Instant>) -> bool {
        let mut state = self.state.lock();
        while state.result.is_none() && state.wake_seq == entry_seq {
            match deadline {
                Some(when) => {
                    if self.cv.wait_until(&mut state, when).timed_out() {
                        return state.result.is_some();
                    }
                }
                None => self.cv.wait(&mut state),
            }
        }
        true
    }
}

/// Handle to a request whose reply has not yet arrived.
///
/// Returned by `async`-mode operations. `result` blocks (servicing
/// reentrant callbacks when called from a server thread); `cancel` sends a
/// best-effort cancellation notice.
pub struct RemoteFuture {
    shared: Arc<FutureShared>,
    client: Client,
    request_id: u64,
}

impl RemoteFuture {
    pub(crate) fn new(shared: Arc<FutureShared>, client: Client, request_id: u64) -> Self {
        Self {
            shared,
            client,
            request_id,
        }
    }

    /// The request id this future correlates with.
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// True once a result (value, error, or cancellation) is in.
    pub fn has_result(&self) -> bool {
        self.shared.is_done()
    }

    /// Block until the reply arrives or `timeout` elapses.
    ///
    /// With no timeout, waits indefinitely (bounded in practice by
    /// connection loss). A timeout leaves the request in flight: a later
    /// `result` call may still succeed.
    pub fn result(&self, timeout: Option<Duration>) -> RpcResult<Value> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let pump = crate::server::nested_pump(self.client.address());

        loop {
            if let Some(result) = self.shared.take_duplicate() {
                return result;
            }

            let entry_seq = self.shared.wake_seq();
            if let Some(pump) = &pump {
                // Reentrancy window: service callbacks from the awaited
                // peer instead of sleeping through them. Register before
                // draining so queue activity after the drain still pokes.
                let _registration = pump.register_waiter(&self.shared);
                while pump.pump_one() {
                    if self.shared.is_done() {
                        break;
                    }
                }
                if self.shared.is_done() {
                    continue;
                }
                if !self.shared.park_seq(entry_seq, deadline) {
                    return Err(RpcError::Timeout);
                }
            } else if !self.shared.park_seq(entry_seq, deadline) {
                return Err(RpcError::Timeout);
            }
        }
    }

    /// Request best-effort cancellation.
    ///
    /// The future's result becomes `CANCELLED` exactly once; a `cancel`
    /// notice is sent so the server may skip execution. A target operation
    /// already running is never interrupted.
    pub fn cancel(&self) {
        if self.shared.cancel() {
            self.client.notify_cancel(self.request_id);
        }
    }
}
