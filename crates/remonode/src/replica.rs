//! # Replicas
//!
//! A Replica is a local, read-mostly proxy for a Source on some other node. It
//! caches the Source's properties, forwards writes and method calls, and
//! reports what it observes through a state machine.
//!
//! ```text
//!            acquire (typed)              Init
//!  Uninitialized ──────────► Default ───────────► Valid ◄──┐
//!        │                                         │       │ Init (resync)
//!        └──────────── InitDynamic ───────────────►│       │
//!                                                  ▼       │
//!                                               Suspect ───┘
//!
//!  any state ── signature differs from the Source ──► SignatureMismatch (terminal)
//! ```
//!
//! ## Invariants
//! - **Writes are requests**: `set_property` never touches the cache. The new
//!   value appears only when the Source echoes it back.
//! - **One binding**: a replica is bound to at most one connection at a time.
//! - **Shared per name**: every `acquire` of a name on one node returns a handle
//!   to the same state. The subscription ends when the last handle drops.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use parking_lot::RwLock;
use remopack::Value;
use remoproto::CallKind;
use remoproto::Packet;
use remoproto::Schema;
use tokio::sync::broadcast;
use tokio::sync::watch;
use tracing::debug;
use tracing::warn;

use crate::api::ApiMap;
use crate::api::DynamicApiMap;
use crate::api::arguments_match;
use crate::connection::Connection;
use crate::connection::ConnectionId;
use crate::pending::PendingReply;
use crate::store::PersistedStore;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReplicaState {
    /// Waiting for a Source; nothing is known about the type yet.
    Uninitialized,
    /// Type known locally; properties hold defaults or restored values.
    Default,
    /// Bound to a Source and in sync with it.
    Valid,
    /// Was valid, but the connection or the Source went away.
    Suspect,
    /// The Source's API differs from ours. Terminal.
    SignatureMismatch,
}

/// What a replica reports to its observers.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicaEvent {
    StateChanged { old: ReplicaState, new: ReplicaState },
    PropertyChanged { index: usize, value: Value },
    Event { index: usize, args: Vec<Value> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Not bound to a Source, or not yet valid.
    NotConnected,
    /// Dynamic replica that has not received its schema.
    NoSchema,
    InvalidIndex(usize),
    UnknownMember(String),
    TypeMismatch { index: usize },
    BadArguments(String),
    SignatureMismatch,
    Timeout,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected => write!(f, "Replica is not connected to its source"),
            Self::NoSchema => write!(f, "Replica has not received its schema yet"),
            Self::InvalidIndex(i) => write!(f, "No member at index {}", i),
            Self::UnknownMember(name) => write!(f, "No member named '{}'", name),
            Self::TypeMismatch { index } => write!(f, "Value does not fit property {}", index),
            Self::BadArguments(msg) => write!(f, "Bad arguments: {}", msg),
            Self::SignatureMismatch => write!(f, "Source signature does not match"),
            Self::Timeout => write!(f, "Timed out waiting for the source"),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// State shared by every handle to one replica name.
pub(crate) struct ReplicaShared {
    name: String,
    api: RwLock<Option<Arc<dyn ApiMap>>>,
    cache: RwLock<Vec<Value>>,
    state: watch::Sender<ReplicaState>,
    events: broadcast::Sender<ReplicaEvent>,
    connection: Mutex<Option<Arc<Connection>>>,
    store: Option<Arc<dyn PersistedStore>>,
    call_timeout: Duration,
}

impl ReplicaShared {
    pub fn new(
        name: &str,
        api: Option<Arc<dyn ApiMap>>,
        store: Option<Arc<dyn PersistedStore>>,
        call_timeout: Duration,
    ) -> Arc<Self> {
        let (state, cache) = match &api {
            Some(api) => (ReplicaState::Default, restored_cache(name, api.as_ref(), store.as_deref())),
            None => (ReplicaState::Uninitialized, Vec::new()),
        };
        let (state, _) = watch::channel(state);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            name: name.to_string(),
            api: RwLock::new(api),
            cache: RwLock::new(cache),
            state,
            events,
            connection: Mutex::new(None),
            store,
            call_timeout,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ReplicaState {
        *self.state.borrow()
    }

    pub fn api(&self) -> Option<Arc<dyn ApiMap>> {
        self.api.read().clone()
    }

    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.connection.lock().clone()
    }

    pub fn is_bound(&self) -> bool {
        self.connection.lock().is_some()
    }

    pub fn is_bound_to(&self, id: ConnectionId) -> bool {
        self.connection.lock().as_ref().is_some_and(|c| c.id() == id)
    }

    fn set_state(&self, new: ReplicaState) {
        let old = self.state.send_replace(new);
        if old != new {
            debug!(replica = %self.name, ?old, ?new, "state changed");
            let _ = self.events.send(ReplicaEvent::StateChanged { old, new });
        }
    }

    // ========================================================================
    //  Binding
    // ========================================================================

    /// Binds to `conn` and asks the Source for its state.
    ///
    /// Returns false if the replica is already bound or can never bind.
    pub fn bind(&self, conn: &Arc<Connection>) -> bool {
        if self.state() == ReplicaState::SignatureMismatch {
            return false;
        }
        let needs_dynamic = {
            let mut slot = self.connection.lock();
            if slot.is_some() {
                return false;
            }
            *slot = Some(conn.clone());
            self.api.read().as_ref().is_none_or(|api| api.is_dynamic())
        };
        debug!(replica = %self.name, connection = %conn.id(), needs_dynamic, "subscribing");
        conn.send(&Packet::AddObject { name: self.name.clone(), needs_dynamic })
    }

    /// Drops the binding to `id`, if that is the current one.
    pub fn unbind(&self, id: ConnectionId) -> bool {
        {
            let mut slot = self.connection.lock();
            if !slot.as_ref().is_some_and(|c| c.id() == id) {
                return false;
            }
            *slot = None;
        }
        if self.state() == ReplicaState::Valid {
            self.set_state(ReplicaState::Suspect);
        }
        true
    }

    pub fn mark_signature_mismatch(&self) {
        let conn = self.connection.lock().take();
        if let Some(conn) = conn {
            conn.send(&Packet::RemoveObject { name: self.name.clone() });
        }
        warn!(replica = %self.name, "source signature does not match the local API");
        self.set_state(ReplicaState::SignatureMismatch);
    }

    // ========================================================================
    //  Inbound
    // ========================================================================

    pub fn on_init(&self, values: Vec<Value>) {
        if self.state() == ReplicaState::SignatureMismatch {
            return;
        }
        let Some(api) = self.api() else {
            warn!(replica = %self.name, "Init for a replica without a schema, dropped");
            return;
        };
        if values.len() != api.property_count() {
            warn!(
                replica = %self.name,
                expected = api.property_count(),
                got = values.len(),
                "Init with wrong property count, dropped"
            );
            return;
        }
        self.apply_snapshot(values);
        self.set_state(ReplicaState::Valid);
    }

    pub fn on_init_dynamic(&self, schema: Schema, values: Vec<Value>) {
        if self.state() == ReplicaState::SignatureMismatch {
            return;
        }
        let received = DynamicApiMap::new(schema);
        let existing = self.api();
        match existing {
            Some(api) if api.signature() != received.signature() => {
                self.mark_signature_mismatch();
                return;
            }
            Some(_) => {}
            None => {
                let defaults = received.schema().properties.iter().map(|p| p.ty.default_value()).collect();
                *self.cache.write() = defaults;
                *self.api.write() = Some(Arc::new(received));
            }
        }
        self.on_init(values);
    }

    fn apply_snapshot(&self, values: Vec<Value>) {
        let changed: Vec<(usize, Value)> = {
            let mut cache = self.cache.write();
            cache.resize(values.len(), Value::Null);
            values
                .into_iter()
                .enumerate()
                .filter_map(|(i, v)| {
                    if cache[i] == v {
                        None
                    } else {
                        cache[i] = v.clone();
                        Some((i, v))
                    }
                })
                .collect()
        };
        for (index, value) in changed {
            let _ = self.events.send(ReplicaEvent::PropertyChanged { index, value });
        }
    }

    pub fn on_property_change(&self, index: u32, value: Value) {
        let Some(api) = self.live_api() else { return };
        let index = index as usize;
        match api.property_type(index) {
            Some(ty) if ty.accepts(&value) => {}
            Some(_) => {
                warn!(replica = %self.name, index, "property change with mismatched type, dropped");
                return;
            }
            None => {
                warn!(replica = %self.name, index, "property change out of range, dropped");
                return;
            }
        }
        self.store_property(index, value.clone());
        if let Some(event) = api.notify_event(index) {
            let _ = self.events.send(ReplicaEvent::Event { index: event, args: vec![value] });
        }
    }

    pub fn on_event(&self, index: u32, args: Vec<Value>, property_index: Option<u32>) {
        let Some(api) = self.live_api() else { return };
        let index = index as usize;
        if index >= api.event_count() {
            warn!(replica = %self.name, index, "event out of range, dropped");
            return;
        }
        if let Some(property) = property_index {
            let property = property as usize;
            match args.first() {
                Some(value) if api.property_type(property).is_some_and(|ty| ty.accepts(value)) => {
                    self.store_property(property, value.clone());
                }
                _ => warn!(replica = %self.name, property, "notify event does not carry a usable value"),
            }
        }
        let _ = self.events.send(ReplicaEvent::Event { index, args });
    }

    fn live_api(&self) -> Option<Arc<dyn ApiMap>> {
        if self.state() != ReplicaState::Valid {
            debug!(replica = %self.name, state = ?self.state(), "packet for a replica that is not valid, dropped");
            return None;
        }
        self.api()
    }

    fn store_property(&self, index: usize, value: Value) {
        {
            let mut cache = self.cache.write();
            if cache.get(index) == Some(&value) {
                return;
            }
            cache[index] = value.clone();
        }
        let _ = self.events.send(ReplicaEvent::PropertyChanged { index, value });
    }
}

impl Drop for ReplicaShared {
    fn drop(&mut self) {
        if let Some(conn) = self.connection.get_mut().take() {
            conn.send(&Packet::RemoveObject { name: self.name.clone() });
        }
        let state = *self.state.borrow();
        if let (Some(store), Some(api)) = (&self.store, self.api.get_mut().as_ref()) {
            if state != ReplicaState::Uninitialized {
                store.save(&self.name, &api.signature(), self.cache.get_mut());
            }
        }
        debug!(replica = %self.name, "released");
    }
}

fn restored_cache(name: &str, api: &dyn ApiMap, store: Option<&dyn PersistedStore>) -> Vec<Value> {
    let schema = api.schema();
    let mut cache: Vec<Value> = schema.properties.iter().map(|p| p.ty.default_value()).collect();
    let Some(saved) = store.and_then(|s| s.restore(name, &api.signature())) else {
        return cache;
    };
    for (i, prop) in schema.properties.iter().enumerate() {
        if let Some(value) = saved.get(i).filter(|v| prop.durable && prop.ty.accepts(v)) {
            cache[i] = value.clone();
        }
    }
    cache
}

/// Handle to a replicated object.
///
/// Cheap to clone; all clones share one cache and one subscription.
#[derive(Clone)]
pub struct Replica {
    shared: Arc<ReplicaShared>,
}

impl Replica {
    pub(crate) fn from_shared(shared: Arc<ReplicaShared>) -> Self {
        Self { shared }
    }

    pub(crate) fn shared(&self) -> &Arc<ReplicaShared> {
        &self.shared
    }

    pub fn name(&self) -> &str {
        self.shared.name()
    }

    pub fn state(&self) -> ReplicaState {
        self.shared.state()
    }

    pub fn is_valid(&self) -> bool {
        self.state() == ReplicaState::Valid
    }

    /// The API this replica speaks, once known.
    pub fn api(&self) -> Option<Arc<dyn ApiMap>> {
        self.shared.api()
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.shared.connection().map(|c| c.id())
    }

    // ========================================================================
    //  Reads
    // ========================================================================

    /// Cached value of a property.
    pub fn property(&self, index: usize) -> Option<Value> {
        self.shared.cache.read().get(index).cloned()
    }

    pub fn property_by_name(&self, name: &str) -> Option<Value> {
        let index = self.api()?.schema().property_index(name)?;
        self.property(index)
    }

    pub fn properties(&self) -> Vec<Value> {
        self.shared.cache.read().clone()
    }

    // ========================================================================
    //  Writes and calls
    // ========================================================================

    fn bound_api(&self) -> Result<(Arc<dyn ApiMap>, Arc<Connection>)> {
        let api = self.api().ok_or(Error::NoSchema)?;
        match self.state() {
            ReplicaState::Valid => {}
            ReplicaState::SignatureMismatch => return Err(Error::SignatureMismatch),
            _ => return Err(Error::NotConnected),
        }
        let conn = self.shared.connection().ok_or(Error::NotConnected)?;
        Ok((api, conn))
    }

    /// Asks the Source to store a new value.
    ///
    /// The cache keeps the old value until the Source echoes the write back.
    pub fn set_property(&self, index: usize, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        let (api, conn) = self.bound_api()?;
        let ty = api.property_type(index).ok_or(Error::InvalidIndex(index))?;
        if !ty.accepts(&value) {
            return Err(Error::TypeMismatch { index });
        }
        let packet = Packet::Invoke {
            name: self.name().to_string(),
            kind: CallKind::Write,
            index: index as u32,
            args: vec![value],
            serial: None,
            property_index: None,
        };
        if conn.send(&packet) { Ok(()) } else { Err(Error::NotConnected) }
    }

    pub fn set_property_by_name(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        let index = self.member(name, |s, n| s.property_index(n))?;
        self.set_property(index, value)
    }

    fn checked_method(&self, api: &dyn ApiMap, index: usize, args: &[Value]) -> Result<()> {
        let params = api.parameter_types(index).ok_or(Error::InvalidIndex(index))?;
        if !arguments_match(params, args) {
            return Err(Error::BadArguments(format!(
                "method {} expects {:?}", api.schema().methods[index].name, params
            )));
        }
        Ok(())
    }

    /// Calls a method without waiting for its result.
    pub fn invoke(&self, index: usize, args: Vec<Value>) -> Result<()> {
        let (api, conn) = self.bound_api()?;
        self.checked_method(api.as_ref(), index, &args)?;
        let packet = Packet::Invoke {
            name: self.name().to_string(),
            kind: CallKind::Invoke,
            index: index as u32,
            args,
            serial: None,
            property_index: None,
        };
        if conn.send(&packet) { Ok(()) } else { Err(Error::NotConnected) }
    }

    pub fn invoke_by_name(&self, name: &str, args: Vec<Value>) -> Result<()> {
        let index = self.member(name, |s, n| s.method_index(n))?;
        self.invoke(index, args)
    }

    /// Calls a method and returns a handle to its eventual result.
    pub fn call(&self, index: usize, args: Vec<Value>) -> Result<PendingReply> {
        let (api, conn) = self.bound_api()?;
        self.checked_method(api.as_ref(), index, &args)?;

        let (serial, rx) = conn.pending().register();
        let packet = Packet::Invoke {
            name: self.name().to_string(),
            kind: CallKind::Invoke,
            index: index as u32,
            args,
            serial: Some(serial),
            property_index: None,
        };
        if !conn.send(&packet) {
            conn.pending().forget(serial);
            return Err(Error::NotConnected);
        }
        Ok(PendingReply::new(serial, rx, Arc::downgrade(&conn), self.shared.call_timeout))
    }

    pub fn call_by_name(&self, name: &str, args: Vec<Value>) -> Result<PendingReply> {
        let index = self.member(name, |s, n| s.method_index(n))?;
        self.call(index, args)
    }

    fn member(&self, name: &str, find: impl Fn(&Schema, &str) -> Option<usize>) -> Result<usize> {
        let api = self.api().ok_or(Error::NoSchema)?;
        find(api.schema(), name).ok_or_else(|| Error::UnknownMember(name.to_string()))
    }

    // ========================================================================
    //  Observation
    // ========================================================================

    /// Stream of state changes, property changes and events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ReplicaEvent> {
        self.shared.events.subscribe()
    }

    pub fn watch_state(&self) -> watch::Receiver<ReplicaState> {
        self.shared.state.subscribe()
    }

    /// Waits until the replica is valid.
    pub async fn wait_for_source(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.watch_state();
        let reached = tokio::time::timeout(timeout, async {
            rx.wait_for(|s| matches!(s, ReplicaState::Valid | ReplicaState::SignatureMismatch))
                .await
                .map(|s| *s)
        })
        .await;
        match reached {
            Ok(Ok(ReplicaState::Valid)) => Ok(()),
            Ok(Ok(_)) => Err(Error::SignatureMismatch),
            Ok(Err(_)) | Err(_) => Err(Error::Timeout),
        }
    }
}

impl fmt::Debug for Replica {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Replica")
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}
