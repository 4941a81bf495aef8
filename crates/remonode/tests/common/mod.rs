//! Shared helpers for the node-level test suites.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use remonode::DynamicObject;
use remonode::InvokeError;
use remonode::Replica;
use remonode::Schema;
use remonode::TypeTag;
use remonode::Value;
use remonode::transport::Transport;
use remoproto::FrameReader;
use remoproto::ObjectInfo;
use remoproto::PROTOCOL_VERSION;
use remoproto::Packet;
use tracing_subscriber::EnvFilter;

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Routes `tracing` output through the test harness. Use `RUST_LOG=remonode=debug`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// `value: Int` with a change event, `increment() -> Int`, `add(Int) -> Int`,
/// `fail() -> Int`, and a `reset(Int)` event.
pub fn counter_schema() -> Schema {
    Schema::builder("Counter")
        .notify_property("value", TypeTag::Int)
        .method("increment", &[], TypeTag::Int)
        .method("add", &[TypeTag::Int], TypeTag::Int)
        .method("fail", &[], TypeTag::Int)
        .event("reset", &[TypeTag::Int])
        .build()
}

pub fn counter(initial: i64) -> Arc<DynamicObject> {
    DynamicObject::builder(counter_schema())
        .value("value", initial)
        .method("increment", |obj, _ctx, _args| add_to(obj, 1))
        .method("add", |obj, _ctx, args| {
            let by = args.first().and_then(Value::as_i64).unwrap_or(0);
            add_to(obj, by)
        })
        .method("fail", |_obj, _ctx, _args| Err(InvokeError::Failed("always fails".into())))
        .build()
        .expect("counter schema is consistent")
}

fn add_to(obj: &DynamicObject, by: i64) -> Result<Value, InvokeError> {
    let next = obj.get(0).and_then(|v| v.as_i64()).unwrap_or(0) + by;
    obj.set(0, Value::Int(next))?;
    Ok(Value::Int(next))
}

/// Polls `condition` until it holds, panicking after `TIMEOUT`.
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for: {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_for_value(replica: &Replica, index: usize, expected: Value) {
    let what = format!("{} property {} == {:?}", replica.name(), index, expected);
    eventually(&what, || replica.property(index).as_ref() == Some(&expected)).await;
}

/// A fresh `local://` address, so parallel tests never share a listener.
pub fn unique_local(prefix: &str) -> String {
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    format!("local://{}-{}", prefix, NEXT.fetch_add(1, Ordering::Relaxed))
}

pub fn counter_info(name: &str) -> ObjectInfo {
    let schema = counter_schema();
    ObjectInfo {
        name: name.to_string(),
        type_name: schema.type_name.clone(),
        signature: schema.signature(),
    }
}

/// A hand-driven protocol peer, for checking exactly what a node sends.
pub struct RawPeer {
    transport: Box<dyn Transport>,
    reader: FrameReader,
}

impl RawPeer {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self { transport, reader: FrameReader::new() }
    }

    pub async fn send(&self, packet: &Packet) {
        let frame = packet.encode().expect("packet encodes");
        self.transport.send(&frame).await.expect("peer is connected");
    }

    pub async fn send_raw(&self, bytes: &[u8]) {
        self.transport.send(bytes).await.expect("peer is connected");
    }

    /// Plays the server side of connection setup.
    pub async fn greet(&self, objects: Vec<ObjectInfo>) {
        self.send(&Packet::Handshake { version: PROTOCOL_VERSION.to_string() }).await;
        self.send(&Packet::ObjectList { objects }).await;
    }

    /// The next packet, or `None` once the node hung up.
    pub async fn recv(&mut self) -> Option<Packet> {
        tokio::time::timeout(TIMEOUT, self.recv_inner())
            .await
            .expect("timed out waiting for a packet")
    }

    async fn recv_inner(&mut self) -> Option<Packet> {
        loop {
            if let Some(packet) = self.reader.next_packet().expect("node sends well-formed frames") {
                return Some(packet);
            }
            match self.transport.recv().await {
                Ok(Some(bytes)) => self.reader.push(&bytes),
                Ok(None) | Err(_) => return None,
            }
        }
    }

    /// The next packet that is not keepalive traffic. Pings are answered.
    pub async fn recv_answering_pings(&mut self) -> Option<Packet> {
        loop {
            match self.recv().await {
                Some(Packet::Ping { name }) => self.send(&Packet::Pong { name }).await,
                Some(Packet::Pong { .. }) => continue,
                other => return other,
            }
        }
    }

    /// Asserts nothing arrives for `quiet`.
    pub async fn expect_silence(&mut self, quiet: Duration) {
        if let Ok(packet) = tokio::time::timeout(quiet, self.recv_inner()).await {
            panic!("expected silence, got {:?}", packet);
        }
    }

    pub async fn close(&self) {
        self.transport.close().await;
    }
}
