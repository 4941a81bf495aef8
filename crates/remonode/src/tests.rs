//! Unit tests for the engine pieces that do not need a full node.

use std::sync::Arc;
use std::time::Duration;

use remopack::TypeTag;
use remopack::Value;
use remoproto::CallKind;
use remoproto::FrameReader;
use remoproto::Packet;
use remoproto::Schema;
use tokio::sync::mpsc;

use crate::api::ApiMap;
use crate::api::DynamicApiMap;
use crate::api::IndexOffsets;
use crate::api::StaticApiMap;
use crate::config::Config;
use crate::connection::Connection;
use crate::connection::ConnectionId;
use crate::connection::Role;
use crate::node::Node;
use crate::object::Change;
use crate::object::DynamicObject;
use crate::object::InvokeContext;
use crate::object::InvokeError;
use crate::object::RemoteObject;
use crate::pending::CallError;
use crate::pending::PendingCalls;
use crate::registry::RegistrySource;
use crate::registry::SourceLocation;
use crate::registry::locations_from_value;
use crate::replica::Replica;
use crate::replica::ReplicaEvent;
use crate::replica::ReplicaShared;
use crate::replica::ReplicaState;
use crate::source::Source;
use crate::store::MemoryStore;
use crate::store::PersistedStore;
use crate::transport::LocalTransport;
use crate::transport::Transport;

fn counter_schema() -> Schema {
    Schema::builder("Counter")
        .notify_property("value", TypeTag::Int)
        .property("label", TypeTag::String)
        .durable()
        .method("increment", &[], TypeTag::Int)
        .event("overflowed", &[TypeTag::Int])
        .build()
}

fn counter() -> Arc<DynamicObject> {
    DynamicObject::builder(counter_schema())
        .value("label", "clicks")
        .method("increment", |obj, _ctx, _args| {
            let next = obj.get(0).and_then(|v| v.as_i64()).unwrap_or(0) + 1;
            obj.set(0, Value::Int(next))?;
            Ok(Value::Int(next))
        })
        .build()
        .expect("counter schema is consistent")
}

fn test_connection(id: u64, role: Role) -> (Arc<Connection>, mpsc::UnboundedReceiver<Vec<u8>>) {
    let (near, _far) = LocalTransport::pair("test");
    Connection::new(ConnectionId(id), role, None, Box::new(near))
}

/// Everything queued on a connection so far.
fn sent(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> Vec<Packet> {
    let mut reader = FrameReader::new();
    while let Ok(frame) = rx.try_recv() {
        reader.push(&frame);
    }
    let mut packets = Vec::new();
    while let Ok(Some(packet)) = reader.next_packet() {
        packets.push(packet);
    }
    packets
}

/// Waits for the next packet queued on a connection.
async fn next_sent(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> Packet {
    let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("a packet in time")
        .expect("connection still open");
    let mut reader = FrameReader::new();
    reader.push(&frame);
    reader.next_packet().expect("decodes").expect("one whole frame")
}

// ============================================================================
//  1. CONNECTIONS AND PENDING CALLS
// ============================================================================

#[tokio::test]
async fn test_serials_are_sequential_and_resolve_once() {
    let pending = PendingCalls::new();
    let (s0, rx0) = pending.register();
    let (s1, rx1) = pending.register();
    assert_eq!((s0, s1), (0, 1));

    assert!(pending.resolve(s1, Value::Int(11)));
    assert!(!pending.resolve(s1, Value::Int(12)), "a serial resolves once");
    assert!(pending.resolve(s0, Value::Int(10)));

    assert_eq!(rx0.await.unwrap(), Ok(Value::Int(10)));
    assert_eq!(rx1.await.unwrap(), Ok(Value::Int(11)));
    assert_eq!(pending.len(), 0);
}

#[test]
fn test_serial_wrap_skips_live_ids() {
    let pending = PendingCalls::starting_at(0);
    let (live, _rx) = pending.register();
    assert_eq!(live, 0);

    let pending_wrapped = PendingCalls::starting_at((1u32 << 31) - 1);
    let (last, _a) = pending_wrapped.register();
    let (first, _b) = pending_wrapped.register();
    assert_eq!(last, (1u32 << 31) - 1);
    assert_eq!(first, 0, "serials wrap below 2^31");

    // serial 0 still waiting: the next allocation after a wrap must skip it
    let (next, _c) = pending_wrapped.register();
    assert_eq!(next, 1);
}

#[tokio::test]
async fn test_abort_all_fails_every_waiter() {
    let pending = PendingCalls::new();
    let receivers: Vec<_> = (0..4).map(|_| pending.register().1).collect();

    assert_eq!(pending.abort_all(), 4);
    assert_eq!(pending.len(), 0);
    for rx in receivers {
        assert_eq!(rx.await.unwrap(), Err(CallError::Aborted));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_write_loop_flushes_queued_frames_on_close() {
    let (near, far) = LocalTransport::pair("test");
    let (conn, rx) = Connection::new(ConnectionId(1), Role::Server, None, Box::new(near));
    assert!(conn.send(&Packet::Ping { name: "Counter".into() }));

    let writer = tokio::spawn(conn.clone().write_loop(rx));
    conn.close();
    writer.await.unwrap();

    let frame = far.recv().await.unwrap().expect("the queued frame");
    let mut reader = FrameReader::new();
    reader.push(&frame);
    assert_eq!(reader.next_packet().unwrap(), Some(Packet::Ping { name: "Counter".into() }));
    assert_eq!(far.recv().await.unwrap(), None, "transport closed after the flush");
}

// ============================================================================
//  2. API MAPS
// ============================================================================

#[test]
fn test_static_map_offsets_translate_both_ways() {
    let map = StaticApiMap::with_offsets(
        counter_schema(),
        IndexOffsets { properties: 2, methods: 1, events: 0 },
    );

    assert_eq!(map.source_property_index(0), None, "local-only member");
    assert_eq!(map.source_property_index(2), Some(0));
    assert_eq!(map.source_property_index(3), Some(1));
    assert_eq!(map.source_property_index(4), None);
    assert_eq!(map.local_property_index(1), Some(3));
    assert_eq!(map.local_method_index(0), Some(1));
    assert_eq!(map.local_method_index(1), None);
    assert_eq!(map.notify_event(0), Some(0));
    assert!(!map.is_dynamic());
}

#[test]
fn test_dynamic_map_shares_the_signature() {
    let schema = counter_schema();
    let dynamic = DynamicApiMap::new(schema.clone());
    assert!(dynamic.is_dynamic());
    assert_eq!(dynamic.signature(), StaticApiMap::new(schema).signature());
    assert_eq!(dynamic.type_name(), "Counter");
}

// ============================================================================
//  3. DYNAMIC OBJECT
// ============================================================================

#[tokio::test]
async fn test_dynamic_object_reports_changes_in_order() {
    let obj = counter();
    let mut changes = obj.subscribe();

    assert!(obj.set(0, Value::Int(1)).unwrap());
    assert!(!obj.set(0, Value::Int(1)).unwrap(), "same value is not a change");
    obj.emit_by_name("overflowed", vec![Value::Int(9)]).unwrap();

    assert_eq!(changes.recv().await, Some(Change::Property { index: 0, value: Value::Int(1) }));
    assert_eq!(changes.recv().await, Some(Change::Event { index: 1, args: vec![Value::Int(9)] }));
    assert!(changes.try_recv().is_err());
}

#[test]
fn test_dynamic_object_type_checks() {
    let obj = counter();
    assert!(matches!(obj.set(0, Value::from("five")), Err(InvokeError::BadArguments(_))));
    assert_eq!(obj.set(7, Value::Int(1)), Err(InvokeError::InvalidIndex(7)));
    assert!(matches!(obj.emit(1, vec![]), Err(InvokeError::BadArguments(_))));

    let unknown = DynamicObject::builder(counter_schema()).value("nope", 1).build();
    assert!(matches!(unknown, Err(InvokeError::UnknownMember(name)) if name == "nope"));
}

#[test]
fn test_dynamic_object_runs_handlers() {
    let obj = counter();
    let ctx = InvokeContext { connection: ConnectionId(1), object_name: "Counter".into() };
    assert_eq!(obj.invoke(&ctx, 0, vec![]), Ok(Value::Int(1)));
    assert_eq!(obj.get_by_name("value"), Some(Value::Int(1)));
    assert_eq!(obj.invoke(&ctx, 5, vec![]), Err(InvokeError::InvalidIndex(5)));
}

// ============================================================================
//  4. SOURCE
// ============================================================================

#[tokio::test]
async fn test_source_attach_sends_snapshot() {
    let obj = counter();
    obj.set(0, Value::Int(4)).unwrap();
    let source = Source::spawn("Counter", obj.clone());

    let (conn, mut rx) = test_connection(1, Role::Server);
    source.attach(&conn, false);
    let (dyn_conn, mut dyn_rx) = test_connection(2, Role::Server);
    source.attach(&dyn_conn, true);

    assert_eq!(
        sent(&mut rx),
        vec![Packet::Init { name: "Counter".into(), values: vec![Value::Int(4), Value::from("clicks")] }]
    );
    match sent(&mut dyn_rx).as_slice() {
        [Packet::InitDynamic { schema, values, .. }] => {
            assert_eq!(schema, &counter_schema());
            assert_eq!(values.len(), 2);
        }
        other => panic!("expected InitDynamic, got {:?}", other),
    }
    assert_eq!(source.listener_count(), 2);
    source.shutdown();
}

#[tokio::test]
async fn test_source_fans_out_changes_and_events() {
    let obj = counter();
    let source = Source::spawn("Counter", obj.clone());
    let (a, mut rx_a) = test_connection(1, Role::Server);
    let (b, mut rx_b) = test_connection(2, Role::Server);
    source.attach(&a, false);
    source.attach(&b, false);
    sent(&mut rx_a);
    sent(&mut rx_b);

    obj.set(0, Value::Int(5)).unwrap();
    obj.emit(1, vec![Value::Int(100)]).unwrap();

    for rx in [&mut rx_a, &mut rx_b] {
        assert_eq!(
            next_sent(rx).await,
            Packet::PropertyChange { name: "Counter".into(), index: 0, value: Value::Int(5) }
        );
        assert_eq!(
            next_sent(rx).await,
            Packet::Invoke {
                name: "Counter".into(),
                kind: CallKind::Invoke,
                index: 1,
                args: vec![Value::Int(100)],
                serial: None,
                property_index: None,
            }
        );
    }
    source.shutdown();
}

#[tokio::test]
async fn test_source_handles_writes_calls_and_bad_indices() {
    let obj = counter();
    let source = Source::spawn("Counter", obj.clone());
    let (conn, mut rx) = test_connection(1, Role::Server);
    source.attach(&conn, false);
    sent(&mut rx);

    source.handle_invoke(&conn, CallKind::Write, 0, vec![Value::Int(7)], None);
    assert_eq!(obj.get(0), Some(Value::Int(7)));

    source.handle_invoke(&conn, CallKind::Invoke, 0, vec![], Some(3));
    assert_eq!(
        next_sent(&mut rx).await,
        Packet::InvokeReply { name: "Counter".into(), serial: 3, value: Value::Int(8) }
    );

    // out of range and mistyped requests are dropped without touching state
    source.handle_invoke(&conn, CallKind::Write, 9, vec![Value::Int(1)], None);
    source.handle_invoke(&conn, CallKind::Write, 0, vec![Value::from("x")], None);
    source.handle_invoke(&conn, CallKind::Invoke, 9, vec![], Some(4));
    assert_eq!(obj.get(0), Some(Value::Int(8)));

    // echoes of the two accepted writes, nothing for the dropped ones
    let echoes: Vec<Packet> = vec![next_sent(&mut rx).await, next_sent(&mut rx).await];
    assert!(echoes.iter().all(|p| matches!(p, Packet::PropertyChange { index: 0, .. })));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(sent(&mut rx).is_empty());
    source.shutdown();
}

#[tokio::test]
async fn test_attach_behind_queued_changes_never_goes_backwards() {
    let obj = counter();
    let source = Source::spawn("Counter", obj.clone());
    // the forwarder has not run yet, so both changes are still queued
    obj.set(0, Value::Int(1)).unwrap();
    obj.set(0, Value::Int(2)).unwrap();
    let (conn, mut rx) = test_connection(1, Role::Server);
    source.attach(&conn, false);

    let replica = typed_replica(None);
    let (client, _client_rx) = test_connection(2, Role::Client);
    replica.bind(&client);
    let mut seen = Vec::new();
    for _ in 0..3 {
        match next_sent(&mut rx).await {
            Packet::Init { values, .. } => replica.on_init(values),
            Packet::PropertyChange { index, value, .. } => replica.on_property_change(index, value),
            other => panic!("unexpected {:?}", other),
        }
        seen.push(handle(&replica).properties()[0].clone());
    }
    assert_eq!(seen, vec![Value::Int(0), Value::Int(1), Value::Int(2)]);

    // a later listener starts from everything already streamed
    let (late, mut late_rx) = test_connection(3, Role::Server);
    source.attach(&late, false);
    assert_eq!(
        sent(&mut late_rx),
        vec![Packet::Init { name: "Counter".into(), values: vec![Value::Int(2), Value::from("clicks")] }]
    );
    source.shutdown();
}

#[tokio::test]
async fn test_source_shutdown_notifies_listeners_only() {
    let source = Source::spawn("Counter", counter());
    let (listener, mut rx) = test_connection(1, Role::Server);
    listener.subscribe("Counter");
    source.attach(&listener, false);
    sent(&mut rx);
    let (bystander, mut other_rx) = test_connection(2, Role::Server);

    source.shutdown();
    assert_eq!(sent(&mut rx), vec![Packet::RemoveObject { name: "Counter".into() }]);
    assert!(!listener.is_subscribed("Counter"));
    assert!(sent(&mut other_rx).is_empty());
    drop(bystander);
}

// ============================================================================
//  5. REPLICA STATE MACHINE
// ============================================================================

fn handle(shared: &Arc<ReplicaShared>) -> Replica {
    Replica::from_shared(shared.clone())
}

fn typed_replica(store: Option<Arc<dyn PersistedStore>>) -> Arc<ReplicaShared> {
    let api: Arc<dyn ApiMap> = Arc::new(StaticApiMap::new(counter_schema()));
    ReplicaShared::new("Counter", Some(api), store, Duration::from_secs(1))
}

#[test]
fn test_replica_init_and_incremental_updates() {
    let replica = typed_replica(None);
    assert_eq!(replica.state(), ReplicaState::Default);
    let (conn, mut rx) = test_connection(1, Role::Client);

    assert!(replica.bind(&conn));
    assert!(!replica.bind(&conn), "one binding at a time");
    assert_eq!(sent(&mut rx), vec![Packet::AddObject { name: "Counter".into(), needs_dynamic: false }]);

    let mut events = handle(&replica).subscribe();
    replica.on_init(vec![Value::Int(1)]);
    assert_eq!(replica.state(), ReplicaState::Default, "short Init is dropped");

    replica.on_init(vec![Value::Int(1), Value::from("x")]);
    assert_eq!(replica.state(), ReplicaState::Valid);

    replica.on_property_change(0, Value::Int(2));
    replica.on_property_change(9, Value::Int(2));
    replica.on_property_change(0, Value::from("bad"));

    let seen: Vec<ReplicaEvent> = std::iter::from_fn(|| events.try_recv().ok()).collect();
    assert_eq!(
        seen,
        vec![
            ReplicaEvent::PropertyChanged { index: 0, value: Value::Int(1) },
            ReplicaEvent::PropertyChanged { index: 1, value: Value::from("x") },
            ReplicaEvent::StateChanged { old: ReplicaState::Default, new: ReplicaState::Valid },
            ReplicaEvent::PropertyChanged { index: 0, value: Value::Int(2) },
            ReplicaEvent::Event { index: 0, args: vec![Value::Int(2)] },
        ]
    );
}

#[test]
fn test_replica_resync_and_suspect() {
    let replica = typed_replica(None);
    let (conn, _rx) = test_connection(1, Role::Client);
    replica.bind(&conn);
    replica.on_init(vec![Value::Int(1), Value::from("a")]);

    let mut events = handle(&replica).subscribe();
    replica.on_init(vec![Value::Int(1), Value::from("a")]);
    assert!(events.try_recv().is_err(), "identical resync changes nothing");

    assert!(!replica.unbind(ConnectionId(99)));
    assert!(replica.unbind(conn.id()));
    assert_eq!(replica.state(), ReplicaState::Suspect);
    assert_eq!(handle(&replica).properties(), vec![Value::Int(1), Value::from("a")], "cache survives");

    replica.on_property_change(0, Value::Int(5));
    assert_eq!(handle(&replica).properties()[0], Value::Int(1), "suspect replicas ignore updates");

    let (again, _rx2) = test_connection(2, Role::Client);
    assert!(replica.bind(&again));
    replica.on_init(vec![Value::Int(3), Value::from("a")]);
    assert_eq!(replica.state(), ReplicaState::Valid);
}

#[test]
fn test_replica_event_with_property_index_updates_cache() {
    let replica = typed_replica(None);
    let (conn, _rx) = test_connection(1, Role::Client);
    replica.bind(&conn);
    replica.on_init(vec![Value::Int(0), Value::from("a")]);

    replica.on_event(0, vec![Value::Int(42)], Some(0));
    assert_eq!(handle(&replica).properties()[0], Value::Int(42));

    replica.on_event(5, vec![], None);
    assert_eq!(replica.state(), ReplicaState::Valid, "bad event index is dropped, not fatal");
}

#[test]
fn test_dynamic_replica_learns_schema() {
    let replica = ReplicaShared::new("Counter", None, None, Duration::from_secs(1));
    assert_eq!(replica.state(), ReplicaState::Uninitialized);
    let (conn, mut rx) = test_connection(1, Role::Client);
    replica.bind(&conn);
    assert_eq!(sent(&mut rx), vec![Packet::AddObject { name: "Counter".into(), needs_dynamic: true }]);

    replica.on_init_dynamic(counter_schema(), vec![Value::Int(9), Value::from("d")]);
    assert_eq!(replica.state(), ReplicaState::Valid);
    assert!(replica.api().is_some_and(|api| api.is_dynamic()));
    assert_eq!(handle(&replica).properties()[0], Value::Int(9));
}

#[test]
fn test_signature_mismatch_is_terminal() {
    let replica = typed_replica(None);
    let (conn, mut rx) = test_connection(1, Role::Client);
    replica.bind(&conn);
    sent(&mut rx);

    let other = Schema::builder("Counter").property("value", TypeTag::Double).build();
    replica.on_init_dynamic(other, vec![Value::Double(1.0)]);
    assert_eq!(replica.state(), ReplicaState::SignatureMismatch);
    assert_eq!(sent(&mut rx), vec![Packet::RemoveObject { name: "Counter".into() }]);

    replica.on_init(vec![Value::Int(1), Value::from("a")]);
    assert_eq!(replica.state(), ReplicaState::SignatureMismatch);
    assert!(!replica.bind(&conn));
}

#[test]
fn test_durable_properties_round_trip_through_store() {
    let store = Arc::new(MemoryStore::new());
    {
        let replica = typed_replica(Some(store.clone()));
        let (conn, mut rx) = test_connection(1, Role::Client);
        replica.bind(&conn);
        replica.on_init(vec![Value::Int(5), Value::from("kept")]);
        drop(replica);
        assert_eq!(sent(&mut rx).last(), Some(&Packet::RemoveObject { name: "Counter".into() }));
    }

    let restored = typed_replica(Some(store));
    assert_eq!(restored.state(), ReplicaState::Default);
    assert_eq!(
        handle(&restored).properties(),
        vec![Value::Int(0), Value::from("kept")],
        "only the durable property is restored"
    );
}

#[tokio::test]
async fn test_dropped_replicas_leave_the_table() {
    let node = Node::new(Config::new()).expect("node starts");
    for i in 0..10 {
        drop(node.acquire(&format!("Gone{}", i)));
    }
    let kept = node.acquire("Kept");
    assert_eq!(node.inner.replicas.len(), 11);

    assert!(node.inner.live_replica("Gone0").is_none());
    assert_eq!(node.inner.replicas.len(), 10);
    assert_eq!(node.inner.live_replicas().len(), 1);
    assert_eq!(node.inner.replicas.len(), 1);

    drop(node.acquire("Gone0"));
    drop(kept);
    assert!(node.inner.live_replicas().is_empty());
    assert_eq!(node.inner.replicas.len(), 0);
    node.shutdown();
}

#[tokio::test]
async fn test_second_acquire_shares_the_first_schema() {
    let node = Node::new(Config::new()).expect("node starts");
    let first = node.acquire_typed("Counter", counter_schema());
    let other = Schema::builder("Counter").property("value", TypeTag::Double).build();
    let second = node.acquire_typed("Counter", other);

    assert_eq!(second.api().map(|api| api.signature()), Some(counter_schema().signature()));
    assert_eq!(second.state(), ReplicaState::Default);
    drop(first);
    node.shutdown();
}

// ============================================================================
//  6. REGISTRY
// ============================================================================

fn location(name: &str, address: &str) -> SourceLocation {
    SourceLocation {
        name: name.into(),
        type_name: "Counter".into(),
        address: address.into(),
        signature: counter_schema().signature(),
    }
}

#[tokio::test]
async fn test_registry_first_writer_wins() {
    let registry = RegistrySource::new();
    let mut changes = registry.subscribe();

    assert!(registry.add(location("Counter", "tcp://a:1"), Some(ConnectionId(1))));
    assert!(!registry.add(location("Counter", "tcp://b:2"), Some(ConnectionId(2))));
    assert_eq!(registry.find("Counter").map(|l| l.address), Some("tcp://a:1".into()));

    match changes.recv().await {
        Some(Change::Property { index: 0, value }) => {
            assert_eq!(locations_from_value(&value), vec![location("Counter", "tcp://a:1")]);
        }
        other => panic!("expected the location map, got {:?}", other),
    }
    assert!(matches!(changes.recv().await, Some(Change::Event { index: 0, .. })));
    assert!(changes.try_recv().is_err(), "the refused entry is not announced");
}

#[test]
fn test_registry_drops_entries_of_closed_connections() {
    let registry = RegistrySource::new();
    registry.add(location("A", "tcp://a:1"), Some(ConnectionId(1)));
    registry.add(location("B", "tcp://a:1"), Some(ConnectionId(1)));
    registry.add(location("C", "tcp://c:3"), None);

    assert_eq!(registry.remove_owner(ConnectionId(1)), 2);
    assert_eq!(registry.locations(), vec![location("C", "tcp://c:3")]);
    assert!(!registry.remove(&location("C", "tcp://elsewhere:9")), "address must match");
    assert!(registry.remove(&location("C", "tcp://c:3")));
}

#[test]
fn test_registry_methods_take_locations() {
    let registry = RegistrySource::new();
    let ctx = InvokeContext { connection: ConnectionId(4), object_name: "Registry".into() };

    let added = registry.invoke(&ctx, 0, vec![location("A", "local://a").to_value()]);
    assert_eq!(added, Ok(Value::Bool(true)));
    assert!(matches!(registry.invoke(&ctx, 0, vec![Value::Int(1)]), Err(InvokeError::BadArguments(_))));
    assert!(registry.set_property(0, Value::Map(vec![])).is_err());
    assert_eq!(registry.remove_owner(ConnectionId(4)), 1);
}
