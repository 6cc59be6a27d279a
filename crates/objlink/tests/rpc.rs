// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end tests: two "processes" (server and client side) sharing the
//! test binary, talking over real loopback TCP or the in-process
//! transport.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use objlink::{
    Client, ClientConfig, CompareOp, FnObject, NdArray, ProxyOptions, RemoteError, RemoteObject,
    RpcError, SerializerKind, Server, ServerConfig, ServerObject, Value, ValueCell, ValueMap,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Client configuration with immediate releases, so registry assertions
/// do not depend on batch timing.
fn eager_config() -> ClientConfig {
    ClientConfig {
        release_batch: Duration::ZERO,
        ..ClientConfig::default()
    }
}

fn wait_until(mut cond: impl FnMut() -> bool, what: &str) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(10));
    }
}

// ============================================================================
// Fixtures
// ============================================================================

fn add_fn() -> ServerObject {
    FnObject::new("add", |args, _kwargs| {
        let a = args
            .first()
            .and_then(Value::as_int)
            .ok_or_else(|| RemoteError::raised("TypeError", "add needs integers"))?;
        let b = args
            .get(1)
            .and_then(Value::as_int)
            .ok_or_else(|| RemoteError::raised("TypeError", "add needs integers"))?;
        Ok(Value::Int(a + b))
    })
}

fn sleep_fn() -> ServerObject {
    FnObject::new("sleep", |args, _kwargs| {
        let ms = args.first().and_then(Value::as_int).unwrap_or(0);
        thread::sleep(Duration::from_millis(ms as u64));
        Ok(Value::None)
    })
}

fn fail_fn() -> ServerObject {
    FnObject::new("fail", |_args, _kwargs| {
        Err(RemoteError::raised("ValueError", "deliberate failure"))
    })
}

/// An object exposing methods through attribute access, the way remote
/// instances are normally used.
struct Thing {
    name: String,
}

impl RemoteObject for Thing {
    fn type_name(&self) -> String {
        "Thing".into()
    }

    fn capabilities(&self) -> objlink::Capabilities {
        objlink::Capabilities::GETATTR
    }

    fn get_attr(&self, name: &str) -> Result<Value, RemoteError> {
        match name {
            "name" => Ok(Value::Str(self.name.clone())),
            "add" => Ok(Value::Object(add_fn())),
            "sleep" => Ok(Value::Object(sleep_fn())),
            other => Err(RemoteError::raised(
                "AttributeError",
                format!("Thing has no attribute '{}'", other),
            )),
        }
    }
}

/// A bag of named fields with read/write attribute access.
struct Record {
    fields: Mutex<ValueMap>,
}

impl Record {
    fn new() -> ServerObject {
        objlink::into_object(Record {
            fields: Mutex::new(ValueMap::new()),
        })
    }
}

impl RemoteObject for Record {
    fn type_name(&self) -> String {
        "Record".into()
    }

    fn capabilities(&self) -> objlink::Capabilities {
        objlink::Capabilities::GETATTR
    }

    fn get_attr(&self, name: &str) -> Result<Value, RemoteError> {
        self.fields.lock().get(name).cloned().ok_or_else(|| {
            RemoteError::raised("AttributeError", format!("no field '{}'", name))
        })
    }

    fn set_attr(&self, name: &str, value: Value) -> Result<(), RemoteError> {
        self.fields.lock().insert(name.to_string(), value);
        Ok(())
    }
}

/// Mutual-recursion fixture: each side calls the other until the depth
/// limit, bouncing requests between two servers through reentrancy
/// windows.
struct PingPong {
    other: Arc<Mutex<Option<objlink::ObjectProxy>>>,
}

impl PingPong {
    fn new() -> ServerObject {
        objlink::into_object(PingPong {
            other: Arc::new(Mutex::new(None)),
        })
    }
}

impl RemoteObject for PingPong {
    fn type_name(&self) -> String {
        "PingPong".into()
    }

    fn capabilities(&self) -> objlink::Capabilities {
        objlink::Capabilities::GETATTR
    }

    fn get_attr(&self, name: &str) -> Result<Value, RemoteError> {
        match name {
            "pingpong" => {
                let other = Arc::clone(&self.other);
                Ok(Value::Object(FnObject::new("pingpong", move |args, _| {
                    let depth = args.first().and_then(Value::as_int).unwrap_or(0);
                    if depth > 6 {
                        return Ok(Value::Str("reentrant!".into()));
                    }
                    // Clone the proxy out so no lock is held across the
                    // nested remote call
                    let peer = other
                        .lock()
                        .clone()
                        .ok_or_else(|| RemoteError::raised("ValueError", "other not set"))?;
                    peer.attr("pingpong")
                        .call(vec![Value::Int(depth + 1)])
                        .map_err(|e| RemoteError::raised("CallbackError", e.to_string()))
                })))
            }
            other => Err(RemoteError::raised(
                "AttributeError",
                format!("no attribute '{}'", other),
            )),
        }
    }

    fn set_attr(&self, name: &str, value: Value) -> Result<(), RemoteError> {
        match (name, value) {
            ("other", Value::Proxy(p)) => {
                *self.other.lock() = Some(p);
                Ok(())
            }
            ("other", _) => Err(RemoteError::raised("TypeError", "other must be a proxy")),
            (other, _) => Err(RemoteError::raised(
                "AttributeError",
                format!("no attribute '{}'", other),
            )),
        }
    }
}

// ============================================================================
// Basic calls (scenario 1)
// ============================================================================

#[test]
fn call_method_on_remote_object() {
    init_logging();
    let local = Server::bind("tcp://127.0.0.1:0").unwrap();
    let server = Server::bind("tcp://127.0.0.1:0").unwrap();
    server.publish_object("thing", objlink::into_object(Thing { name: "obj1".into() }));

    let client =
        Client::connect_with(&server.address(), eager_config(), Some(local.clone())).unwrap();
    let thing = client.get_proxy("thing").unwrap();

    let add = thing.attr("add");
    assert_eq!(add.call(vec![Value::Int(2), Value::Int(3)]).unwrap(), Value::Int(5));

    // Attribute materialization
    assert_eq!(thing.attr("name").value().unwrap(), Value::Str("obj1".into()));

    client.close();
    server.close();
    local.close();
}

#[test]
fn call_over_inproc_transport() {
    init_logging();
    let server = Server::bind("inproc://rpc-basic").unwrap();
    server.publish_object("add", add_fn());

    let client = Client::connect_with(&server.address(), eager_config(), None).unwrap();
    let add = client.get_proxy("add").unwrap();
    assert_eq!(add.call(vec![Value::Int(20), Value::Int(22)]).unwrap(), Value::Int(42));

    client.close();
    server.close();
}

#[test]
fn ping_and_published_values() {
    init_logging();
    let server = Server::bind("tcp://127.0.0.1:0").unwrap();
    let client = Client::connect_with(&server.address(), eager_config(), None).unwrap();

    client.ping().unwrap();

    // Publish from the client, read from a second client
    client
        .set_named("shared", Value::List(vec![Value::Int(5), Value::Int(6)]))
        .unwrap();
    let other = Client::connect_with(&server.address(), eager_config(), None).unwrap();
    assert_eq!(
        other.get_named("shared").unwrap(),
        Value::List(vec![Value::Int(5), Value::Int(6)])
    );

    // Missing names raise remotely
    match other.get_named("nonexistent") {
        Err(RpcError::Remote(exc)) => assert_eq!(exc.type_name, "KeyError"),
        other => panic!("expected KeyError, got {:?}", other),
    }

    client.close();
    other.close();
    server.close();
}

// ============================================================================
// Callbacks and reentrancy (scenario 2)
// ============================================================================

#[test]
fn callback_round_trips_through_local_server() {
    init_logging();
    let local = Server::bind("tcp://127.0.0.1:0").unwrap();
    let server = Server::bind("tcp://127.0.0.1:0").unwrap();
    server.publish_object(
        "apply",
        FnObject::new("apply", |args, _kwargs| {
            let cb = match args.first() {
                Some(Value::Proxy(p)) => p.clone(),
                _ => return Err(RemoteError::raised("TypeError", "callback must be a proxy")),
            };
            let v = args.get(1).cloned().unwrap_or(Value::None);
            let out = cb
                .call(vec![v])
                .map_err(|e| RemoteError::raised("CallbackError", e.to_string()))?;
            Ok(Value::Int(out.as_int().unwrap_or(0) + 1))
        }),
    );

    let client =
        Client::connect_with(&server.address(), eager_config(), Some(local.clone())).unwrap();
    let apply = client.get_proxy("apply").unwrap();

    let times_ten = FnObject::new("times_ten", |args, _| {
        Ok(Value::Int(args[0].as_int().unwrap_or(0) * 10))
    });
    let result = apply
        .call(vec![Value::Object(times_ten), Value::Int(4)])
        .unwrap();
    assert_eq!(result, Value::Int(41));

    // The local server handled the nested request from the remote side
    assert!(local.requests_processed() >= 1);

    client.close();
    server.close();
    local.close();
}

#[test]
fn mutual_recursion_between_two_servers() {
    init_logging();
    let s1 = Server::bind("tcp://127.0.0.1:0").unwrap();
    let s2 = Server::bind("tcp://127.0.0.1:0").unwrap();
    s1.publish_object("pp1", PingPong::new());
    s2.publish_object("pp2", PingPong::new());

    let c1 = Client::connect_with(&s1.address(), eager_config(), None).unwrap();
    let c2 = Client::connect_with(&s2.address(), eager_config(), None).unwrap();
    let pp1 = c1.get_proxy("pp1").unwrap();
    let pp2 = c2.get_proxy("pp2").unwrap();

    pp1.set_attr("other", Value::Proxy(pp2.clone())).unwrap();
    pp2.set_attr("other", Value::Proxy(pp1.clone())).unwrap();

    let result = pp1.attr("pingpong").call(vec![Value::Int(0)]).unwrap();
    assert_eq!(result, Value::Str("reentrant!".into()));

    c1.close();
    c2.close();
    s1.close();
    s2.close();
}

#[test]
fn object_argument_requires_local_server() {
    init_logging();
    let server = Server::bind("tcp://127.0.0.1:0").unwrap();
    let client = Client::connect_with(&server.address(), eager_config(), None).unwrap();

    match client.set_named("cb", Value::Object(add_fn())) {
        Err(RpcError::NoLocalServer) => {}
        other => panic!("expected NoLocalServer, got {:?}", other),
    }

    client.close();
    server.close();
}

// ============================================================================
// Lazy attribute chains (scenario 3)
// ============================================================================

#[test]
fn chained_item_access_is_one_round_trip() {
    init_logging();
    let server = Server::bind("tcp://127.0.0.1:0").unwrap();
    let mut inner = ValueMap::new();
    inner.insert("k2".into(), Value::Int(42));
    let mut outer = ValueMap::new();
    outer.insert("k".into(), Value::Map(inner));
    server.publish_object("data", ValueCell::new(Value::Map(outer)));

    let client = Client::connect_with(&server.address(), eager_config(), None).unwrap();
    let data = client.get_proxy("data").unwrap();

    assert_eq!(data.len().unwrap(), 1);

    let before = server.requests_processed();
    let leaf = data.item("k").item("k2");
    // No wire activity yet: the chain composed locally
    assert_eq!(server.requests_processed(), before);
    assert_eq!(leaf.value().unwrap(), Value::Int(42));
    assert_eq!(server.requests_processed(), before + 1);

    client.close();
    server.close();
}

#[test]
fn derived_proxy_keeps_root_alive() {
    init_logging();
    let server = Server::bind("tcp://127.0.0.1:0").unwrap();
    let mut map = ValueMap::new();
    map.insert("k".into(), Value::Str("v".into()));
    server.publish_object("data", ValueCell::new(Value::Map(map)));

    let client = Client::connect_with(&server.address(), eager_config(), None).unwrap();
    let root = client.get_proxy("data").unwrap();
    assert_eq!(server.live_objects(), 1);

    let leaf = root.item("k");
    drop(root);
    thread::sleep(Duration::from_millis(100));
    // The derived handle pins the root's references
    assert_eq!(server.live_objects(), 1);
    assert_eq!(leaf.value().unwrap(), Value::Str("v".into()));

    drop(leaf);
    wait_until(|| server.live_objects() == 0, "release after last drop");

    client.close();
    server.close();
}

// ============================================================================
// Async and fire-and-forget modes (scenarios 4, 5)
// ============================================================================

#[test]
fn async_call_completes_later() {
    init_logging();
    let server = Server::bind("tcp://127.0.0.1:0").unwrap();
    server.publish_object("sleep", sleep_fn());

    let client = Client::connect_with(&server.address(), eager_config(), None).unwrap();
    let sleep = client.get_proxy("sleep").unwrap();

    let fut = sleep.call_async(vec![Value::Int(200)]).unwrap();
    assert!(!fut.has_result());
    let result = fut.result(Some(Duration::from_secs(5))).unwrap();
    assert!(fut.has_result());
    assert_eq!(result, Value::None);

    client.close();
    server.close();
}

#[test]
fn async_results_resolve_out_of_order() {
    init_logging();
    let server = Server::bind("tcp://127.0.0.1:0").unwrap();
    server.publish_object("add", add_fn());

    let client = Client::connect_with(&server.address(), eager_config(), None).unwrap();
    let add = client.get_proxy("add").unwrap();

    let a = add.call_async(vec![Value::Int(1), Value::Int(2)]).unwrap();
    let b = add.call_async(vec![Value::Int(3), Value::Int(4)]).unwrap();
    assert_eq!(b.result(Some(Duration::from_secs(5))).unwrap(), Value::Int(7));
    assert_eq!(a.result(Some(Duration::from_secs(5))).unwrap(), Value::Int(3));

    client.close();
    server.close();
}

#[test]
fn off_mode_swallows_errors() {
    init_logging();
    let server = Server::bind("tcp://127.0.0.1:0").unwrap();
    server.publish_object("fail", fail_fn());
    server.publish_object("add", add_fn());

    let client = Client::connect_with(&server.address(), eager_config(), None).unwrap();
    let fail = client.get_proxy("fail").unwrap();

    // No error surfaces on the client
    fail.call_off(vec![]).unwrap();

    // The server dispatched it, logged the failure and kept serving
    let add = client.get_proxy("add").unwrap();
    assert_eq!(add.call(vec![Value::Int(1), Value::Int(1)]).unwrap(), Value::Int(2));

    client.close();
    server.close();
}

// ============================================================================
// Request ordering (invariant 1)
// ============================================================================

#[test]
fn requests_execute_in_send_order() {
    init_logging();
    let server = Server::bind("tcp://127.0.0.1:0").unwrap();
    let seen = Arc::new(Mutex::new(Vec::<i64>::new()));
    {
        let seen = Arc::clone(&seen);
        server.publish_object(
            "record",
            FnObject::new("record", move |args, _| {
                seen.lock().push(args[0].as_int().unwrap_or(-1));
                Ok(Value::None)
            }),
        );
    }

    let client = Client::connect_with(&server.address(), eager_config(), None).unwrap();
    let record = client.get_proxy("record").unwrap();

    let futures: Vec<_> = (0..20)
        .map(|i| record.call_async(vec![Value::Int(i)]).unwrap())
        .collect();
    for fut in &futures {
        fut.result(Some(Duration::from_secs(5))).unwrap();
    }
    assert_eq!(*seen.lock(), (0..20).collect::<Vec<_>>());

    client.close();
    server.close();
}

// ============================================================================
// Reference counting and identity (invariants 2, 3, 4)
// ============================================================================

#[test]
fn releases_return_refcount_to_zero() {
    init_logging();
    let server = Server::bind("tcp://127.0.0.1:0").unwrap();
    server.publish_object("thing", objlink::into_object(Thing { name: "x".into() }));

    let client = Client::connect_with(&server.address(), eager_config(), None).unwrap();
    assert_eq!(server.live_objects(), 0);

    let px1 = client.get_proxy("thing").unwrap();
    let px2 = client.get_proxy("thing").unwrap();
    assert_eq!(server.live_objects(), 1);

    // Equal descriptors resolve to the same handle while one is alive
    assert!(px1 == px2);
    assert_eq!(px1.remote_id().unwrap(), px2.remote_id().unwrap());

    drop(px1);
    thread::sleep(Duration::from_millis(100));
    assert_eq!(server.live_objects(), 1);

    drop(px2);
    wait_until(|| server.live_objects() == 0, "refcount to drain");

    client.close();
    server.close();
}

#[test]
fn proxy_sent_home_resolves_to_original_object() {
    init_logging();
    let server = Server::bind("tcp://127.0.0.1:0").unwrap();
    let thing: ServerObject = objlink::into_object(Thing { name: "x".into() });
    server.publish_object("thing", Arc::clone(&thing));
    {
        let thing = Arc::clone(&thing);
        server.publish_object(
            "is_thing",
            FnObject::new("is_thing", move |args, _| {
                Ok(Value::Bool(args[0] == Value::Object(Arc::clone(&thing))))
            }),
        );
    }

    let client = Client::connect_with(&server.address(), eager_config(), None).unwrap();
    let px = client.get_proxy("thing").unwrap();
    let is_thing = client.get_proxy("is_thing").unwrap();

    // The descriptor goes back to its home server and must unwrap to the
    // very same object, not a new proxy
    let outcome = is_thing.call(vec![Value::Proxy(px.clone())]).unwrap();
    assert_eq!(outcome, Value::Bool(true));

    client.close();
    server.close();
}

#[test]
fn disconnect_releases_peer_contribution() {
    init_logging();
    let server = Server::bind("tcp://127.0.0.1:0").unwrap();
    server.publish_object("thing", objlink::into_object(Thing { name: "x".into() }));

    let client = Client::connect_with(&server.address(), eager_config(), None).unwrap();
    let px = client.get_proxy("thing").unwrap();
    assert_eq!(server.live_objects(), 1);

    // Close without releasing: the server reclaims on disconnect
    client.close();
    wait_until(|| server.live_objects() == 0, "disconnect cleanup");

    // The stale handle fails fast locally
    assert!(px.ping().is_err());

    server.close();
}

// ============================================================================
// Cancellation and timeouts (invariant 5)
// ============================================================================

#[test]
fn cancelled_future_stays_cancelled() {
    init_logging();
    let server = Server::bind("tcp://127.0.0.1:0").unwrap();
    server.publish_object("sleep", sleep_fn());

    let client = Client::connect_with(&server.address(), eager_config(), None).unwrap();
    let sleep = client.get_proxy("sleep").unwrap();

    let fut = sleep.call_async(vec![Value::Int(200)]).unwrap();
    thread::sleep(Duration::from_millis(50));
    fut.cancel();

    match fut.result(Some(Duration::from_secs(5))) {
        Err(RpcError::Cancelled) => {}
        other => panic!("expected Cancelled, got {:?}", other),
    }

    // The late reply must not resurrect the future
    thread::sleep(Duration::from_millis(300));
    match fut.result(Some(Duration::from_secs(1))) {
        Err(RpcError::Cancelled) => {}
        other => panic!("expected Cancelled after late reply, got {:?}", other),
    }

    client.close();
    server.close();
}

#[test]
fn sync_timeout_abandons_the_request() {
    init_logging();
    let server = Server::bind("tcp://127.0.0.1:0").unwrap();
    server.publish_object("sleep", sleep_fn());

    let client = Client::connect_with(&server.address(), eager_config(), None).unwrap();
    let sleep = client.get_proxy("sleep").unwrap();
    sleep.set_options(ProxyOptions {
        timeout: Some(Duration::from_millis(50)),
        ..ProxyOptions::default()
    });

    match sleep.call(vec![Value::Int(400)]) {
        Err(RpcError::Timeout) => {}
        other => panic!("expected Timeout, got {:?}", other),
    }

    // The session survives; the late reply is discarded
    client.ping().unwrap();

    client.close();
    server.close();
}

// ============================================================================
// Errors
// ============================================================================

#[test]
fn remote_failures_carry_exception_records() {
    init_logging();
    let server = Server::bind("tcp://127.0.0.1:0").unwrap();
    server.publish_object("fail", fail_fn());

    let client = Client::connect_with(&server.address(), eager_config(), None).unwrap();
    let fail = client.get_proxy("fail").unwrap();

    match fail.call(vec![]) {
        Err(RpcError::Remote(exc)) => {
            assert_eq!(exc.type_name, "ValueError");
            assert!(exc.message.contains("deliberate"));
        }
        other => panic!("expected remote exception, got {:?}", other),
    }

    client.close();
    server.close();
}

#[test]
fn missing_capability_is_rejected_without_a_round_trip() {
    init_logging();
    let server = Server::bind("tcp://127.0.0.1:0").unwrap();
    server.publish_object("add", add_fn());

    let client = Client::connect_with(&server.address(), eager_config(), None).unwrap();
    let add = client.get_proxy("add").unwrap();

    let before = server.requests_processed();
    match add.len() {
        Err(RpcError::UnsupportedOp(_)) => {}
        other => panic!("expected UnsupportedOp, got {:?}", other),
    }
    thread::sleep(Duration::from_millis(50));
    assert_eq!(server.requests_processed(), before);

    client.close();
    server.close();
}

// ============================================================================
// Connection loss and close (scenario 6, invariant 6)
// ============================================================================

#[test]
fn sync_call_fails_fast_when_peer_dies() {
    init_logging();
    let listener = objlink::transport::bind("tcp://127.0.0.1:0", 1024 * 1024).unwrap();
    let address = listener.address();

    // A server that accepts, swallows the greeting and one request, then
    // drops the connection without replying
    let fake = thread::spawn(move || {
        let stream = listener.accept().unwrap();
        let _ = stream.recv();
        let _ = stream.recv();
        stream.close();
    });

    let client = Client::connect_with(&address, eager_config(), None).unwrap();
    let started = Instant::now();
    match client.ping() {
        Err(RpcError::ConnectionLost(_)) => {}
        other => panic!("expected ConnectionLost, got {:?}", other),
    }
    assert!(started.elapsed() < Duration::from_secs(5));

    fake.join().unwrap();
    client.close();
}

#[test]
fn server_close_never_leaves_callers_parked() {
    init_logging();
    let server = Server::bind("tcp://127.0.0.1:0").unwrap();
    server.publish_object("sleep", sleep_fn());

    let client = Client::connect_with(&server.address(), eager_config(), None).unwrap();
    let sleep = client.get_proxy("sleep").unwrap();

    let caller = thread::spawn(move || sleep.call(vec![Value::Int(300)]));

    thread::sleep(Duration::from_millis(50));
    server.close();

    // The parked caller resolves: with the value (request was in flight)
    // or with a defined error, never by hanging
    match caller.join().unwrap() {
        Ok(Value::None) => {}
        Err(RpcError::ConnectionLost(_)) | Err(RpcError::ShuttingDown) => {}
        other => panic!("unexpected outcome: {:?}", other),
    }

    // The session is dead afterwards
    wait_until(|| client.disconnected(), "server_closed notice");
    assert!(client.ping().is_err());

    client.close();
}

// ============================================================================
// Proxies of plain data, comparison, mutation
// ============================================================================

#[test]
fn value_cell_proxy_supports_container_ops() {
    init_logging();
    let server = Server::bind("tcp://127.0.0.1:0").unwrap();
    server.publish_object(
        "list",
        ValueCell::new(Value::List(vec![Value::Int(0), Value::Str("x".into()), Value::Int(7)])),
    );

    let client = Client::connect_with(&server.address(), eager_config(), None).unwrap();
    let list = client.get_proxy("list").unwrap();

    assert_eq!(list.type_name(), "list");
    assert_eq!(list.len().unwrap(), 3);
    assert_eq!(list.get_item(2).unwrap(), Value::Int(7));

    list.set_item(0, Value::Int(9)).unwrap();
    assert_eq!(list.get_item(0).unwrap(), Value::Int(9));

    list.del_item(0).unwrap();
    assert_eq!(list.len().unwrap(), 2);

    // Materialize the whole container
    assert_eq!(
        list.value().unwrap(),
        Value::List(vec![Value::Str("x".into()), Value::Int(7)])
    );

    client.close();
    server.close();
}

#[test]
fn remote_comparison_operators() {
    init_logging();
    let server = Server::bind("tcp://127.0.0.1:0").unwrap();
    server.publish_object("num", ValueCell::new(Value::Int(5)));

    let client = Client::connect_with(&server.address(), eager_config(), None).unwrap();
    let num = client.get_proxy("num").unwrap();

    assert!(num.remote_eq(5).unwrap());
    assert!(!num.remote_eq(6).unwrap());
    assert!(num.compare(CompareOp::Lt, 7).unwrap());
    assert!(num.compare(CompareOp::Ge, 5).unwrap());

    client.close();
    server.close();
}

#[test]
fn record_attributes_read_and_write() {
    init_logging();
    let server = Server::bind("tcp://127.0.0.1:0").unwrap();
    server.publish_object("record", Record::new());

    let client = Client::connect_with(&server.address(), eager_config(), None).unwrap();
    let record = client.get_proxy("record").unwrap();

    record.set_attr("color", "red").unwrap();
    assert_eq!(record.attr("color").value().unwrap(), Value::Str("red".into()));
    assert_eq!(record.get_attr("color").unwrap(), Value::Str("red".into()));

    match record.get_attr("missing") {
        Err(RpcError::Remote(exc)) => assert_eq!(exc.type_name, "AttributeError"),
        other => panic!("expected AttributeError, got {:?}", other),
    }

    client.close();
    server.close();
}

// ============================================================================
// Transfer, import, serializer plug-in
// ============================================================================

#[test]
fn transfer_returns_a_proxy_to_the_copy() {
    init_logging();
    let server = Server::bind("tcp://127.0.0.1:0").unwrap();
    let client = Client::connect_with(&server.address(), eager_config(), None).unwrap();

    let list = Value::List(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
    let remote = client.transfer(list.clone()).unwrap();

    assert_eq!(remote.len().unwrap(), 3);
    assert_eq!(remote.get_item(1).unwrap(), Value::Int(2));
    assert_eq!(remote.value().unwrap(), list);

    client.close();
    server.close();
}

#[test]
fn import_exposes_registered_modules() {
    init_logging();
    let server = Server::bind("tcp://127.0.0.1:0").unwrap();

    struct MathMod;
    impl RemoteObject for MathMod {
        fn type_name(&self) -> String {
            "module math".into()
        }
        fn capabilities(&self) -> objlink::Capabilities {
            objlink::Capabilities::GETATTR
        }
        fn get_attr(&self, name: &str) -> Result<Value, RemoteError> {
            match name {
                "pi" => Ok(Value::Float(std::f64::consts::PI)),
                "double" => Ok(Value::Object(FnObject::new("double", |args, _| {
                    Ok(Value::Int(args[0].as_int().unwrap_or(0) * 2))
                }))),
                other => Err(RemoteError::raised(
                    "AttributeError",
                    format!("module has no attribute '{}'", other),
                )),
            }
        }
    }
    server.register_module("math", objlink::into_object(MathMod));

    let client = Client::connect_with(&server.address(), eager_config(), None).unwrap();
    let math = client.import("math").unwrap();

    assert_eq!(
        math.attr("pi").value().unwrap(),
        Value::Float(std::f64::consts::PI)
    );
    assert_eq!(
        math.attr("double").call(vec![Value::Int(21)]).unwrap(),
        Value::Int(42)
    );

    match client.import("no.such.module") {
        Err(RpcError::Remote(exc)) => assert_eq!(exc.type_name, "ImportError"),
        other => panic!("expected ImportError, got {:?}", other),
    }

    client.close();
    server.close();
}

#[test]
fn array_plugin_round_trips_packed_arrays() {
    init_logging();
    let server_config = ServerConfig {
        serializer: SerializerKind::MsgpackArrays,
        ..ServerConfig::default()
    };
    let client_config = ClientConfig {
        serializer: SerializerKind::MsgpackArrays,
        release_batch: Duration::ZERO,
        ..ClientConfig::default()
    };

    let server = Server::bind_with("tcp://127.0.0.1:0", server_config).unwrap();
    let array = NdArray::contiguous("f64", vec![2, 2], vec![0u8; 32]);
    {
        let array = array.clone();
        server.publish_object(
            "make",
            FnObject::new("make", move |_, _| Ok(Value::Array(array.clone()))),
        );
    }

    let client = Client::connect_with(&server.address(), client_config, None).unwrap();
    let make = client.get_proxy("make").unwrap();
    match make.call(vec![]).unwrap() {
        Value::Array(got) => {
            assert_eq!(got, array);
            assert_eq!(got.strides, vec![16, 8]);
        }
        other => panic!("expected an array, got {:?}", other),
    }

    client.close();
    server.close();
}
