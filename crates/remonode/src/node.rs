//! # Node
//!
//! The entry point of the crate. A node hosts Sources, acquires Replicas, and
//! owns the connections between them.
//!
//! Uses DashMap for its tables so that packet pumps, dial tasks and application
//! threads can all reach them without a global lock.
//!
//! ## Lifecycle
//! - `listen` makes the node reachable; `enable_remoting` publishes objects.
//! - `connect` dials a peer and keeps redialing it until `disconnect`.
//! - `acquire` returns a Replica right away; it binds as soon as some
//!   connection (or the registry) reveals where the Source lives.
//! - `shutdown` withdraws every Source and closes every connection. Background
//!   tasks keep the node alive until then.

use std::fmt;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::DashSet;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use parking_lot::RwLock;
use remoproto::ObjectInfo;
use remoproto::Packet;
use remoproto::Schema;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;
use url::Url;

use crate::api::ApiMap;
use crate::api::StaticApiMap;
use crate::config::Config;
use crate::connection::Connection;
use crate::connection::ConnectionId;
use crate::connection::Role;
use crate::object::RemoteObject;
use crate::registry;
use crate::registry::REGISTRY_NAME;
use crate::registry::RegistrySource;
use crate::registry::SourceLocation;
use crate::replica;
use crate::replica::Replica;
use crate::replica::ReplicaEvent;
use crate::replica::ReplicaShared;
use crate::replica::ReplicaState;
use crate::source::Source;
use crate::source::SourceTable;
use crate::transport;
use crate::transport::TransportRegistry;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A Source with this name is already remoted on this node.
    DuplicateRegistration(String),
    InvalidName(String),
    InvalidAddress(String),
    UnknownScheme(String),
    /// The object is not remoted on this node.
    NotHosting(String),
    /// The operation needs the node to be listening first.
    NotListening,
    /// No registry is configured or hosted.
    NoRegistry,
    Transport(transport::Error),
    Replica(replica::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateRegistration(name) => write!(f, "'{}' is already remoted", name),
            Self::InvalidName(name) => write!(f, "Invalid object name '{}'", name),
            Self::InvalidAddress(addr) => write!(f, "Invalid address: {}", addr),
            Self::UnknownScheme(scheme) => write!(f, "No transport for scheme '{}'", scheme),
            Self::NotHosting(what) => write!(f, "Not hosting {}", what),
            Self::NotListening => write!(f, "Node is not listening"),
            Self::NoRegistry => write!(f, "No registry configured"),
            Self::Transport(e) => write!(f, "Transport error: {}", e),
            Self::Replica(e) => write!(f, "Replica error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<transport::Error> for Error {
    fn from(e: transport::Error) -> Self {
        match e {
            transport::Error::UnknownScheme(scheme) => Self::UnknownScheme(scheme),
            transport::Error::InvalidAddress(addr) => Self::InvalidAddress(addr),
            other => Self::Transport(other),
        }
    }
}

impl From<replica::Error> for Error {
    fn from(e: replica::Error) -> Self {
        Self::Replica(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Outgoing connection state per address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dial {
    Dialing,
    Connected(ConnectionId),
}

pub(crate) struct NodeInner {
    pub(crate) config: Config,
    pub(crate) transports: TransportRegistry,
    pub(crate) sources: SourceTable,
    pub(crate) replicas: DashMap<String, Weak<ReplicaShared>>,
    pub(crate) connections: DashMap<ConnectionId, Arc<Connection>>,
    pub(crate) dials: DashMap<String, Dial>,
    /// Addresses the application asked for. Only these are redialed.
    pub(crate) explicit: DashSet<String>,
    pub(crate) host_address: RwLock<Option<Url>>,
    pub(crate) loopback: Mutex<Option<Arc<Connection>>>,
    pub(crate) registry_host: RwLock<Option<Arc<RegistrySource>>>,
    pub(crate) registry: Mutex<Option<Replica>>,
    pub(crate) tasks: Mutex<Vec<JoinHandle<()>>>,
    pub(crate) shut_down: AtomicBool,
    next_connection_id: AtomicU64,
}

impl NodeInner {
    fn new(config: Config, transports: TransportRegistry) -> Self {
        Self {
            config,
            transports,
            sources: SourceTable::default(),
            replicas: DashMap::new(),
            connections: DashMap::new(),
            dials: DashMap::new(),
            explicit: DashSet::new(),
            host_address: RwLock::new(None),
            loopback: Mutex::new(None),
            registry_host: RwLock::new(None),
            registry: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
            next_connection_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn next_connection_id(&self) -> ConnectionId {
        ConnectionId(self.next_connection_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    pub(crate) fn connections_with_role(&self, role: Role) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .filter(|c| c.value().role() == role)
            .map(|c| c.value().clone())
            .collect()
    }

    // ========================================================================
    //  Sources
    // ========================================================================

    fn enable_remoting(self: &Arc<Self>, object: Arc<dyn RemoteObject>, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::InvalidName(name.to_string()));
        }
        if self.sources.contains(name) {
            warn!(name, "duplicate registration refused");
            return Err(Error::DuplicateRegistration(name.to_string()));
        }
        let source = Source::spawn(name, object);
        if !self.sources.insert(source.clone()) {
            source.shutdown();
            warn!(name, "duplicate registration refused");
            return Err(Error::DuplicateRegistration(name.to_string()));
        }
        info!(name, type_name = %source.api().type_name(), signature = %source.api().signature(), "remoting enabled");

        let announcement = Packet::ObjectList { objects: vec![source.info()] };
        for conn in self.connections_with_role(Role::Server) {
            conn.send(&announcement);
        }

        if self.live_replica(name).is_some() {
            self.ensure_loopback();
        }
        self.announce(&source.info());
        Ok(())
    }

    fn disable_remoting(&self, source: Arc<Source>) {
        self.sources.remove(source.name());
        source.shutdown();
        info!(name = %source.name(), "remoting disabled");

        let Some(location) = self.location_of(&source.info()) else { return };
        if let Some(host) = self.registry_host.read().clone() {
            host.remove(&location);
        } else if let Some(registry) = self.registry_replica().filter(|r| r.is_valid()) {
            let _ = registry.invoke(registry::REMOVE_SOURCE, vec![location.to_value()]);
        }
    }

    fn location_of(&self, info: &ObjectInfo) -> Option<SourceLocation> {
        let address = self.host_address.read().clone()?;
        Some(SourceLocation {
            name: info.name.clone(),
            type_name: info.type_name.clone(),
            address: address.to_string(),
            signature: info.signature,
        })
    }

    /// Tells the registry where a local Source lives.
    fn announce(&self, info: &ObjectInfo) {
        if info.name == REGISTRY_NAME {
            return;
        }
        let Some(location) = self.location_of(info) else {
            debug!(name = %info.name, "not listening, source not announced");
            return;
        };
        if let Some(host) = self.registry_host.read().clone() {
            host.add(location, None);
        } else if let Some(registry) = self.registry_replica().filter(|r| r.is_valid()) {
            if let Err(e) = registry.invoke(registry::ADD_SOURCE, vec![location.to_value()]) {
                warn!(name = %info.name, error = %e, "registry announcement failed");
            }
        }
    }

    pub(crate) fn announce_all(&self) {
        for info in self.sources.infos() {
            self.announce(&info);
        }
    }

    // ========================================================================
    //  Replicas
    // ========================================================================

    /// The replica acquired under `name`, if a handle is still alive. A dead
    /// entry is pruned.
    pub(crate) fn live_replica(&self, name: &str) -> Option<Arc<ReplicaShared>> {
        self.replicas.remove_if(name, |_, w| w.strong_count() == 0);
        self.replicas.get(name).and_then(|w| w.value().upgrade())
    }

    pub(crate) fn live_replicas(&self) -> Vec<Arc<ReplicaShared>> {
        self.replicas.retain(|_, w| w.strong_count() > 0);
        let weak: Vec<Weak<ReplicaShared>> = self.replicas.iter().map(|w| w.value().clone()).collect();
        weak.into_iter().filter_map(|w| w.upgrade()).collect()
    }

    fn acquire(self: &Arc<Self>, name: &str, api: Option<Arc<dyn ApiMap>>) -> Replica {
        let shared = match self.replicas.entry(name.to_string()) {
            Entry::Occupied(mut slot) => match slot.get().upgrade() {
                Some(existing) => {
                    check_requested_api(&existing, api.as_ref());
                    return Replica::from_shared(existing);
                }
                None => {
                    let shared = self.new_replica(name, api);
                    slot.insert(Arc::downgrade(&shared));
                    shared
                }
            },
            Entry::Vacant(slot) => {
                let shared = self.new_replica(name, api);
                slot.insert(Arc::downgrade(&shared));
                shared
            }
        };
        info!(name, state = ?shared.state(), "replica acquired");
        self.try_bind(&shared);
        Replica::from_shared(shared)
    }

    fn new_replica(&self, name: &str, api: Option<Arc<dyn ApiMap>>) -> Arc<ReplicaShared> {
        ReplicaShared::new(name, api, self.config.persisted_store.clone(), self.config.call_timeout)
    }

    /// Binds a waiting replica to whatever currently offers its Source.
    pub(crate) fn try_bind(self: &Arc<Self>, shared: &Arc<ReplicaShared>) {
        if shared.is_bound() || shared.state() == ReplicaState::SignatureMismatch {
            return;
        }
        if self.sources.contains(shared.name()) {
            self.ensure_loopback();
        }
        if self.bind_from_connections(shared) {
            return;
        }
        if let Some(location) = self.find_location(shared.name()) {
            self.dial_learned(&location.address);
        }
    }

    pub(crate) fn bind_from_connections(&self, shared: &Arc<ReplicaShared>) -> bool {
        for conn in self.connections_with_role(Role::Client) {
            if let Some(info) = conn.remote_object(shared.name()) {
                if self.bind_replica(shared, &conn, &info) {
                    return true;
                }
            }
        }
        false
    }

    /// First contact between a replica and a Source: compare signatures, then
    /// subscribe.
    pub(crate) fn bind_replica(&self, shared: &Arc<ReplicaShared>, conn: &Arc<Connection>, info: &ObjectInfo) -> bool {
        if let Some(api) = shared.api() {
            if api.signature() != info.signature {
                warn!(
                    name = %info.name,
                    connection = %conn.id(),
                    local = %api.signature(),
                    remote = %info.signature,
                    "signature mismatch"
                );
                shared.mark_signature_mismatch();
                return false;
            }
        }
        shared.bind(conn)
    }

    // ========================================================================
    //  Registry
    // ========================================================================

    fn host_registry(self: &Arc<Self>) -> Result<()> {
        if self.host_address.read().is_none() {
            return Err(Error::NotListening);
        }
        let host = RegistrySource::new();
        self.enable_remoting(host.clone(), REGISTRY_NAME)?;
        *self.registry_host.write() = Some(host);
        self.announce_all();
        Ok(())
    }

    fn use_registry(self: &Arc<Self>, address: &str) -> Result<()> {
        self.parse_address(address)?;
        if self.registry.lock().is_some() {
            return Ok(());
        }
        let api: Arc<dyn ApiMap> = Arc::new(StaticApiMap::new(registry::registry_schema()));
        let replica = self.acquire(REGISTRY_NAME, Some(api));
        *self.registry.lock() = Some(replica.clone());

        let watcher = tokio::spawn(watch_registry(Arc::downgrade(self), replica));
        self.tasks.lock().push(watcher);
        info!(address, "using registry");
        self.connect(address)
    }

    pub(crate) fn registry_replica(&self) -> Option<Replica> {
        self.registry.lock().clone()
    }

    fn registry_locations(&self) -> Vec<SourceLocation> {
        if let Some(host) = self.registry_host.read().clone() {
            return host.locations();
        }
        self.registry_replica()
            .and_then(|r| r.property(registry::LOCATIONS_PROPERTY))
            .map(|v| registry::locations_from_value(&v))
            .unwrap_or_default()
    }

    fn find_location(&self, name: &str) -> Option<SourceLocation> {
        self.registry_locations().into_iter().find(|l| l.name == name)
    }

    /// The registry replica became valid: push our Sources, pull theirs.
    fn on_registry_valid(self: &Arc<Self>) {
        self.announce_all();
        for location in self.registry_locations() {
            self.on_location_added(&location);
        }
    }

    fn on_location_added(self: &Arc<Self>, location: &SourceLocation) {
        let own = self.host_address.read().as_ref().map(|u| u.to_string());
        if own.as_deref() == Some(location.address.as_str()) {
            return;
        }
        let waiting = self
            .live_replica(&location.name)
            .is_some_and(|r| !r.is_bound() && r.state() != ReplicaState::SignatureMismatch);
        if waiting {
            debug!(location = %location, "registry revealed a waited-for source");
            self.dial_learned(&location.address);
        }
    }

    // ========================================================================
    //  Shutdown
    // ========================================================================

    fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
        self.explicit.clear();
        for source in self.sources.all() {
            self.sources.remove(source.name());
            source.shutdown();
        }
        self.registry_host.write().take();
        let connections: Vec<Arc<Connection>> = self.connections.iter().map(|c| c.value().clone()).collect();
        for conn in connections {
            conn.close();
        }
        info!("node shut down");
    }
}

/// Follows the registry replica and reacts to locations appearing.
/// Warns when a second acquire asks for a schema other than the one the live
/// replica already has.
fn check_requested_api(existing: &ReplicaShared, requested: Option<&Arc<dyn ApiMap>>) {
    let Some(requested) = requested else { return };
    match existing.api() {
        Some(api) if api.signature() != requested.signature() => warn!(
            name = %existing.name(),
            existing = %api.signature(),
            requested = %requested.signature(),
            "replica already acquired with another schema, requested api ignored"
        ),
        Some(_) => {}
        None => debug!(name = %existing.name(), "replica still learning its schema, requested api ignored"),
    }
}

async fn watch_registry(node: Weak<NodeInner>, replica: Replica) {
    let mut events = replica.subscribe();
    if replica.is_valid() {
        if let Some(node) = node.upgrade() {
            node.on_registry_valid();
        }
    }
    loop {
        let event = match events.recv().await {
            Ok(event) => Some(event),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "registry events lagged, resyncing");
                None
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let Some(node) = node.upgrade() else { break };
        match event {
            None => {
                if replica.is_valid() {
                    node.on_registry_valid();
                }
            }
            Some(ReplicaEvent::StateChanged { new: ReplicaState::Valid, .. }) => node.on_registry_valid(),
            Some(ReplicaEvent::Event { index: registry::OBJECT_ADDED, args }) => {
                if let Some(location) = args.first().and_then(SourceLocation::from_value) {
                    node.on_location_added(&location);
                }
            }
            Some(ReplicaEvent::Event { index: registry::OBJECT_REMOVED, args }) => {
                if let Some(location) = args.first().and_then(SourceLocation::from_value) {
                    debug!(location = %location, "registry dropped a source");
                }
            }
            Some(_) => {}
        }
    }
}

/// Handle to a node. Cheap to clone.
#[derive(Clone)]
pub struct Node {
    pub(crate) inner: Arc<NodeInner>,
}

impl Node {
    /// Creates a node with the built-in transports.
    ///
    /// Must be called within a Tokio runtime when `config.registry_address` is set.
    pub fn new(config: Config) -> Result<Self> {
        Self::with_transports(config, TransportRegistry::new())
    }

    pub fn with_transports(config: Config, transports: TransportRegistry) -> Result<Self> {
        let registry_address = config.registry_address.clone();
        let node = Self { inner: Arc::new(NodeInner::new(config, transports)) };
        if let Some(address) = registry_address {
            node.use_registry(&address)?;
        }
        Ok(node)
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn transports(&self) -> &TransportRegistry {
        &self.inner.transports
    }

    /// Accepts connections at `address`. Returns the address peers should dial.
    pub async fn listen(&self, address: &str) -> Result<Url> {
        self.inner.listen(address).await
    }

    /// The address of the first listener, once listening.
    pub fn host_address(&self) -> Option<Url> {
        self.inner.host_address.read().clone()
    }

    /// Publishes `object` under `name`.
    pub fn enable_remoting(&self, object: Arc<dyn RemoteObject>, name: &str) -> Result<()> {
        self.inner.enable_remoting(object, name)
    }

    /// Withdraws a published object. Its replicas go suspect.
    pub fn disable_remoting(&self, object: &Arc<dyn RemoteObject>) -> Result<()> {
        let source = self
            .inner
            .sources
            .find_object(object)
            .ok_or_else(|| Error::NotHosting("that object".into()))?;
        self.inner.disable_remoting(source);
        Ok(())
    }

    pub fn disable_remoting_by_name(&self, name: &str) -> Result<()> {
        let source = self.inner.sources.get(name).ok_or_else(|| Error::NotHosting(name.to_string()))?;
        self.inner.disable_remoting(source);
        Ok(())
    }

    pub fn source_names(&self) -> Vec<String> {
        self.inner.sources.names()
    }

    /// Dials `address` and keeps it connected until `disconnect`.
    pub fn connect(&self, address: &str) -> Result<()> {
        self.inner.connect(address)
    }

    /// Stops redialing `address` and closes its connection.
    ///
    /// Returns whether the address had been requested.
    pub fn disconnect(&self, address: &str) -> bool {
        self.inner.disconnect(address)
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    /// A replica that learns its schema from the Source.
    pub fn acquire(&self, name: &str) -> Replica {
        self.inner.acquire(name, None)
    }

    /// A replica with a locally known schema, checked against the Source.
    pub fn acquire_typed(&self, name: &str, schema: Schema) -> Replica {
        self.acquire_with_api(name, Arc::new(StaticApiMap::new(schema)))
    }

    /// A replica whose members are mapped through `api`.
    ///
    /// Replicas are shared per name: while any handle to `name` is alive this
    /// returns that replica, and `api` is ignored (a differing signature is
    /// logged). Compare `Replica::api` when the schema matters.
    pub fn acquire_with_api(&self, name: &str, api: Arc<dyn ApiMap>) -> Replica {
        self.inner.acquire(name, Some(api))
    }

    /// Makes this node the registry. The node must be listening.
    pub fn host_registry(&self) -> Result<()> {
        self.inner.host_registry()
    }

    /// Connects to the registry at `address` and starts using it.
    pub fn use_registry(&self, address: &str) -> Result<()> {
        self.inner.use_registry(address)
    }

    pub async fn wait_for_registry(&self, timeout: Duration) -> Result<()> {
        if self.inner.registry_host.read().is_some() {
            return Ok(());
        }
        let registry = self.inner.registry_replica().ok_or(Error::NoRegistry)?;
        registry.wait_for_source(timeout).await?;
        Ok(())
    }

    /// Snapshot of every location the registry knows.
    pub fn registry_locations(&self) -> Vec<SourceLocation> {
        self.inner.registry_locations()
    }

    /// Withdraws all Sources and closes all connections.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("host_address", &self.host_address())
            .field("sources", &self.inner.sources.names())
            .field("connections", &self.inner.connections.len())
            .finish()
    }
}
