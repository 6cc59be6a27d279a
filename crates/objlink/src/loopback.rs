// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The process-wide local server.
//!
//! Values a process passes by reference (callbacks, large objects) need a
//! concrete home: a server in the same process that owns them and answers
//! operations on them. This module holds that one process-wide handle.
//! Creation is explicit; a client without a local server can still pass
//! values by value but refuses to transmit by reference with
//! `NO_LOCAL_SERVER`.
//!
//! Lazily created clients (including those constructed while decoding
//! proxy descriptors) pick up the installed server automatically.

use parking_lot::Mutex;

use crate::config::ServerConfig;
use crate::error::RpcResult;
use crate::server::Server;

static LOCAL_SERVER: Mutex<Option<Server>> = Mutex::new(None);

/// Start a server on the TCP loopback interface and install it as the
/// process-wide local server.
///
/// Returns the installed server (the existing one if already installed).
pub fn start_local_server() -> RpcResult<Server> {
    {
        let guard = LOCAL_SERVER.lock();
        if let Some(server) = guard.as_ref() {
            return Ok(server.clone());
        }
    }
    let server = Server::bind_with("tcp://127.0.0.1:0", ServerConfig::from_env())?;
    install(server.clone());
    Ok(server)
}

/// Install `server` as the process-wide local server.
///
/// A server already installed stays; this follows the rule that the local
/// server is created once and torn down at process exit or explicit close.
pub fn install(server: Server) {
    let mut guard = LOCAL_SERVER.lock();
    if guard.is_none() {
        *guard = Some(server);
    } else {
        log::warn!("local server already installed; keeping the existing one");
    }
}

/// The process-wide local server, if one is installed.
pub fn local_server() -> Option<Server> {
    LOCAL_SERVER.lock().clone()
}

/// Remove the installed local server (it is not closed).
///
/// Call before `close()` when tearing a process down explicitly.
pub fn uninstall() -> Option<Server> {
    LOCAL_SERVER.lock().take()
}
