// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # objlink - transparent remote object proxies over TCP
//!
//! Code in one process holds handles that behave like local values but
//! whose operations execute in another process. A handle's attribute
//! access, invocation, indexing and lifetime events are forwarded to the
//! process that owns the real object; return values are either copied back
//! (small, serializable data) or returned as further handles. Values sent
//! as arguments may themselves be handles back into the sender, which is
//! what makes callbacks work.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use objlink::{Client, FnObject, Server, Value};
//!
//! fn main() -> objlink::Result<()> {
//!     // Process A: serve an object
//!     let server = Server::bind("tcp://127.0.0.1:0")?;
//!     server.publish_object(
//!         "add",
//!         FnObject::new("add", |args, _kwargs| {
//!             let a = args[0].as_int().unwrap_or(0);
//!             let b = args[1].as_int().unwrap_or(0);
//!             Ok(Value::Int(a + b))
//!         }),
//!     );
//!
//!     // Process B: call it through a proxy
//!     let client = Client::connect(&server.address())?;
//!     let add = match client.get_named("add")? {
//!         Value::Proxy(p) => p,
//!         _ => unreachable!(),
//!     };
//!     assert_eq!(add.call(vec![Value::Int(2), Value::Int(3)])?, Value::Int(5));
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |                        Proxy / Client API                          |
//! |   ObjectProxy (lazy attr chains) -> Client (modes, futures)        |
//! +--------------------------------------------------------------------+
//! |                          Server loop                               |
//! |   dispatch | ObjectRegistry | builtins | reentrancy windows        |
//! +--------------------------------------------------------------------+
//! |                             Codec                                  |
//! |   MessagePack trees | proxy records | blob fallback | arrays       |
//! +--------------------------------------------------------------------+
//! |                           Transport                                |
//! |   length-prefix framed TCP | in-process channels (tests)           |
//! +--------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Server`] | Owns objects, runs the request loop |
//! | [`Client`] | Session to one server; sync/async/fire-and-forget |
//! | [`ObjectProxy`] | Handle standing in for a remote value |
//! | [`RemoteObject`] | Trait a value implements to be proxied |
//! | [`Value`] | Dynamic tree the codec puts on the wire |
//! | [`RemoteFuture`] | In-flight request handle with cancellation |
//!
//! ## Concurrency model
//!
//! Each server runs on one dedicated thread, as does each client's receive
//! loop. Public client operations may be called from any thread; `sync`
//! callers park on a per-request signal. A server executing a callback
//! into its caller keeps servicing that caller's requests while it waits
//! (the reentrancy window); everything else stays strictly serialized.

/// Client side: sessions, invocation modes, the receive loop.
pub mod client;
/// MessagePack codec, tagged records, opaque blob handlers.
pub mod codec;
/// Tunable constants and runtime configuration.
pub mod config;
/// Error kinds, remote exception records.
pub mod error;
/// Futures for in-flight requests.
pub mod future;
/// The process-wide local server for by-reference values.
pub mod loopback;
/// The dispatch surface: `RemoteObject` and helpers.
pub mod object;
/// Proxy handles and the weak proxy cache.
pub mod proxy;
/// Per-server table of values sent by reference.
pub mod registry;
/// The server loop and dispatcher.
pub mod server;
/// Message transports: framed TCP and in-process channels.
pub mod transport;
/// Dynamic values, descriptors, capabilities.
pub mod value;
/// Wire frame types and opcodes.
pub mod wire;

pub use client::{get_client, Client};
pub use codec::{blob_from, register_blob_decoder, register_blob_handler, Codec};
pub use config::{ClientConfig, SerializerKind, ServerConfig};
pub use error::{ErrorKind, RemoteError, RemoteException, RpcError, RpcResult};
pub use future::RemoteFuture;
pub use loopback::{install, local_server, start_local_server};
pub use object::{into_object, CompareOp, FnObject, RemoteObject, ServerObject, ValueCell};
pub use proxy::{ObjectProxy, ProxyOptions};
pub use server::Server;
pub use value::{Blob, Capabilities, NdArray, PathSeg, ProxyDescriptor, Value, ValueMap};
pub use wire::{Mode, Opcode, ReturnMode};

/// Crate-wide result alias.
pub type Result<T> = error::RpcResult<T>;

/// objlink version string.
pub const VERSION: &str = "0.2.0";
