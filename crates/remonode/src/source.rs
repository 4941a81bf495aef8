//! # Sources
//!
//! A Source is a locally hosted object published under a unique name. It keeps
//! the set of connections subscribed to it and forwards every change the object
//! reports to all of them.
//!
//! ## Invariants
//! - **Snapshot then stream**: the Source keeps the property values as of the
//!   last change it forwarded. A new listener's Init carries those values, and
//!   it is inserted under the same lock, so its stream resumes exactly where
//!   the snapshot ends. Changes still queued from the object are streamed
//!   after the Init, never replayed behind a newer value.
//! - The cached values start from a read taken right after subscribing. A
//!   write racing `enable_remoting` itself may therefore be streamed once more.
//! - **Unique names**: the `SourceTable` refuses a second Source under a name.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use remopack::Value;
use remoproto::CallKind;
use remoproto::ObjectInfo;
use remoproto::Packet;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::api::ApiMap;
use crate::api::arguments_match;
use crate::connection::Connection;
use crate::connection::ConnectionId;
use crate::object::Change;
use crate::object::InvokeContext;
use crate::object::RemoteObject;

pub(crate) struct Source {
    name: String,
    object: Arc<dyn RemoteObject>,
    api: Arc<dyn ApiMap>,
    stream: Mutex<Stream>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

/// Listeners and the property values they have been brought up to.
struct Stream {
    values: Vec<Value>,
    listeners: HashMap<ConnectionId, Arc<Connection>>,
}

impl Source {
    /// Wraps `object` and starts forwarding its changes.
    pub fn spawn(name: &str, object: Arc<dyn RemoteObject>) -> Arc<Self> {
        let api = object.api();
        let mut changes = object.subscribe();
        let values = read_values(object.as_ref(), api.as_ref());
        let source = Arc::new(Self {
            name: name.to_string(),
            object,
            api,
            stream: Mutex::new(Stream { values, listeners: HashMap::new() }),
            forwarder: Mutex::new(None),
        });

        let weak = Arc::downgrade(&source);
        let handle = tokio::spawn(async move {
            while let Some(change) = changes.recv().await {
                let Some(source) = weak.upgrade() else { break };
                source.forward(change);
            }
        });
        *source.forwarder.lock() = Some(handle);
        source
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn api(&self) -> &Arc<dyn ApiMap> {
        &self.api
    }

    pub fn info(&self) -> ObjectInfo {
        ObjectInfo {
            name: self.name.clone(),
            type_name: self.api.type_name().to_string(),
            signature: self.api.signature(),
        }
    }

    pub fn is_object(&self, object: &Arc<dyn RemoteObject>) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.object), Arc::as_ptr(object))
    }

    pub fn listener_count(&self) -> usize {
        self.stream.lock().listeners.len()
    }

    /// Subscribes `conn` and sends it the values as of the last forwarded change.
    ///
    /// A connection that is already listening gets a fresh snapshot.
    pub fn attach(&self, conn: &Arc<Connection>, needs_dynamic: bool) {
        let mut stream = self.stream.lock();
        let values = stream.values.clone();
        let packet = if needs_dynamic {
            Packet::InitDynamic {
                name: self.name.clone(),
                schema: self.api.schema().clone(),
                values,
            }
        } else {
            Packet::Init { name: self.name.clone(), values }
        };
        conn.send(&packet);
        stream.listeners.insert(conn.id(), conn.clone());
        debug!(source = %self.name, connection = %conn.id(), dynamic = needs_dynamic, "listener attached");
    }

    pub fn detach(&self, id: ConnectionId) -> bool {
        let removed = self.stream.lock().listeners.remove(&id).is_some();
        if removed {
            debug!(source = %self.name, connection = %id, "listener detached");
        }
        removed
    }

    /// Fans one change out to every listener.
    fn forward(&self, change: Change) {
        let mut cached = None;
        let packet = match change {
            Change::Property { index, value } => {
                let Some(wire) = self.api.source_property_index(index) else {
                    warn!(source = %self.name, index, "change for a property outside the schema");
                    return;
                };
                cached = Some((wire, value.clone()));
                Packet::PropertyChange { name: self.name.clone(), index: wire as u32, value }
            }
            Change::Event { index, args } => {
                let Some(wire) = self.api.source_event_index(index) else {
                    warn!(source = %self.name, index, "event outside the schema");
                    return;
                };
                Packet::Invoke {
                    name: self.name.clone(),
                    kind: CallKind::Invoke,
                    index: wire as u32,
                    args,
                    serial: None,
                    property_index: self.api.schema().property_for_event(wire).map(|p| p as u32),
                }
            }
        };

        let frame = match packet.encode() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(source = %self.name, error = %e, "change cannot be encoded");
                return;
            }
        };

        let mut stream = self.stream.lock();
        if let Some((wire, value)) = cached {
            if let Some(slot) = stream.values.get_mut(wire) {
                *slot = value;
            }
        }
        trace!(source = %self.name, listeners = stream.listeners.len(), "forwarding {:?}", packet.packet_type());
        for conn in stream.listeners.values() {
            conn.send_frame(frame.clone());
        }
    }

    /// Handles an `InvokePacket` from a subscribed replica.
    pub fn handle_invoke(
        &self,
        conn: &Arc<Connection>,
        kind: CallKind,
        index: u32,
        args: Vec<Value>,
        serial: Option<u32>,
    ) {
        let index = index as usize;
        match kind {
            CallKind::Write => {
                let Some(local) = self.api.local_property_index(index) else {
                    warn!(source = %self.name, index, "write to unknown property dropped");
                    return;
                };
                let value = args.into_iter().next().unwrap_or_default();
                let fits = self.api.property_type(index).is_some_and(|ty| ty.accepts(&value));
                if !fits {
                    warn!(source = %self.name, index, "write with mismatched type dropped");
                    return;
                }
                if let Err(e) = self.object.set_property(local, value) {
                    warn!(source = %self.name, index, error = %e, "write refused");
                }
            }
            CallKind::Invoke => {
                let Some(local) = self.api.local_method_index(index) else {
                    warn!(source = %self.name, index, "call to unknown method dropped");
                    return;
                };
                let params = self.api.parameter_types(index).unwrap_or_default();
                let value = if !arguments_match(params, &args) {
                    warn!(source = %self.name, index, "call with mismatched arguments");
                    Value::Null
                } else {
                    let ctx = InvokeContext { connection: conn.id(), object_name: self.name.clone() };
                    match self.object.invoke(&ctx, local, args) {
                        Ok(value) => value,
                        Err(e) => {
                            warn!(source = %self.name, index, error = %e, "method failed");
                            Value::Null
                        }
                    }
                };
                if let Some(serial) = serial {
                    conn.send(&Packet::InvokeReply { name: self.name.clone(), serial, value });
                }
            }
        }
    }

    /// Tells every listener the Source is gone and stops forwarding.
    pub fn shutdown(&self) {
        let listeners: Vec<_> = self.stream.lock().listeners.drain().map(|(_, c)| c).collect();
        for conn in listeners {
            conn.unsubscribe(&self.name);
            conn.send(&Packet::RemoveObject { name: self.name.clone() });
        }
        if let Some(handle) = self.forwarder.lock().take() {
            handle.abort();
        }
    }
}

/// Current property values of `object`, in wire order.
fn read_values(object: &dyn RemoteObject, api: &dyn ApiMap) -> Vec<Value> {
    (0..api.property_count())
        .map(|wire| api.local_property_index(wire).map(|local| object.property(local)).unwrap_or_default())
        .collect()
}

/// Name to Source mapping for one node.
#[derive(Default)]
pub(crate) struct SourceTable {
    sources: DashMap<String, Arc<Source>>,
}

impl SourceTable {
    /// Adds a Source; false if the name is taken.
    pub fn insert(&self, source: Arc<Source>) -> bool {
        match self.sources.entry(source.name().to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(source);
                true
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.sources.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Source>> {
        self.sources.get(name).map(|s| s.value().clone())
    }

    pub fn remove(&self, name: &str) -> Option<Arc<Source>> {
        self.sources.remove(name).map(|(_, s)| s)
    }

    pub fn find_object(&self, object: &Arc<dyn RemoteObject>) -> Option<Arc<Source>> {
        self.sources
            .iter()
            .find(|s| s.value().is_object(object))
            .map(|s| s.value().clone())
    }

    pub fn all(&self) -> Vec<Arc<Source>> {
        self.sources.iter().map(|s| s.value().clone()).collect()
    }

    pub fn infos(&self) -> Vec<ObjectInfo> {
        self.sources.iter().map(|s| s.value().info()).collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.key().clone()).collect()
    }
}
