//! # Discovery Registry
//!
//! A well-known Source, named `Registry`, mapping object names to the address
//! of the node hosting them. Hosting nodes announce their Sources through
//! `addSource`; acquiring nodes watch `remoteObjectAdded` and dial the address
//! when a name they wait for appears.
//!
//! ## Invariants
//! - **First writer wins**: a second announcement of a name already present is
//!   refused and logged.
//! - **Owned entries**: an entry announced over a connection is removed when
//!   that connection closes.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use remopack::TypeTag;
use remopack::Value;
use remoproto::Schema;
use remoproto::Signature;
use tokio::sync::mpsc;
use tracing::info;
use tracing::warn;

use crate::api::ApiMap;
use crate::api::StaticApiMap;
use crate::connection::ConnectionId;
use crate::object::Change;
use crate::object::InvokeContext;
use crate::object::InvokeError;
use crate::object::Notifier;
use crate::object::RemoteObject;

pub const REGISTRY_NAME: &str = "Registry";

pub(crate) const LOCATIONS_PROPERTY: usize = 0;
pub(crate) const ADD_SOURCE: usize = 0;
pub(crate) const REMOVE_SOURCE: usize = 1;
pub(crate) const OBJECT_ADDED: usize = 0;
pub(crate) const OBJECT_REMOVED: usize = 1;

pub fn registry_schema() -> Schema {
    Schema::builder("Registry")
        .property("sourceLocations", TypeTag::Map)
        .method("addSource", &[TypeTag::Map], TypeTag::Bool)
        .method("removeSource", &[TypeTag::Map], TypeTag::Bool)
        .event("remoteObjectAdded", &[TypeTag::Map])
        .event("remoteObjectRemoved", &[TypeTag::Map])
        .build()
}

/// Where a Source lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    pub name: String,
    pub type_name: String,
    pub address: String,
    pub signature: Signature,
}

impl SourceLocation {
    pub fn to_value(&self) -> Value {
        Value::Map(vec![
            ("name".into(), Value::from(self.name.as_str())),
            ("typeName".into(), Value::from(self.type_name.as_str())),
            ("address".into(), Value::from(self.address.as_str())),
            ("signature".into(), Value::Bytes(self.signature.as_bytes().to_vec())),
        ])
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        Some(Self {
            name: value.get("name")?.as_str()?.to_string(),
            type_name: value.get("typeName")?.as_str()?.to_string(),
            address: value.get("address")?.as_str()?.to_string(),
            signature: Signature::from_slice(value.get("signature")?.as_bytes()?)?,
        })
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}) at {}", self.name, self.type_name, self.address)
    }
}

/// Decodes the `sourceLocations` property.
pub(crate) fn locations_from_value(value: &Value) -> Vec<SourceLocation> {
    value
        .as_map()
        .unwrap_or_default()
        .iter()
        .filter_map(|(_, v)| SourceLocation::from_value(v))
        .collect()
}

struct Entry {
    location: SourceLocation,
    owner: Option<ConnectionId>,
}

/// The object behind the `Registry` Source.
pub(crate) struct RegistrySource {
    api: Arc<StaticApiMap>,
    entries: Mutex<Vec<Entry>>,
    notifier: Notifier,
}

impl RegistrySource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            api: Arc::new(StaticApiMap::new(registry_schema())),
            entries: Mutex::new(Vec::new()),
            notifier: Notifier::default(),
        })
    }

    pub fn locations(&self) -> Vec<SourceLocation> {
        self.entries.lock().iter().map(|e| e.location.clone()).collect()
    }

    pub fn find(&self, name: &str) -> Option<SourceLocation> {
        self.entries
            .lock()
            .iter()
            .find(|e| e.location.name == name)
            .map(|e| e.location.clone())
    }

    fn locations_value(entries: &[Entry]) -> Value {
        Value::Map(
            entries
                .iter()
                .map(|e| (e.location.name.clone(), e.location.to_value()))
                .collect(),
        )
    }

    /// Records a location. `owner` is the connection that announced it, or
    /// `None` for Sources on the registry's own node.
    pub fn add(&self, location: SourceLocation, owner: Option<ConnectionId>) -> bool {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.iter().find(|e| e.location.name == location.name) {
            if existing.location != location {
                warn!(
                    name = %location.name,
                    kept = %existing.location.address,
                    refused = %location.address,
                    "registry conflict, first registration wins"
                );
            }
            return false;
        }
        info!(location = %location, "registered");
        let value = location.to_value();
        entries.push(Entry { location, owner });
        self.notifier.notify(Change::Property {
            index: LOCATIONS_PROPERTY,
            value: Self::locations_value(&entries),
        });
        self.notifier.notify(Change::Event { index: OBJECT_ADDED, args: vec![value] });
        true
    }

    /// Removes the entry for `location.name` if it points at `location.address`.
    pub fn remove(&self, location: &SourceLocation) -> bool {
        let mut entries = self.entries.lock();
        let Some(pos) = entries
            .iter()
            .position(|e| e.location.name == location.name && e.location.address == location.address)
        else {
            return false;
        };
        let removed = entries.remove(pos);
        self.announce_removed(&entries, vec![removed.location]);
        true
    }

    /// Drops every entry announced over `owner`.
    pub fn remove_owner(&self, owner: ConnectionId) -> usize {
        let mut entries = self.entries.lock();
        let (gone, kept): (Vec<Entry>, Vec<Entry>) =
            entries.drain(..).partition(|e| e.owner == Some(owner));
        *entries = kept;
        let count = gone.len();
        if count > 0 {
            self.announce_removed(&entries, gone.into_iter().map(|e| e.location).collect());
        }
        count
    }

    fn announce_removed(&self, remaining: &[Entry], removed: Vec<SourceLocation>) {
        self.notifier.notify(Change::Property {
            index: LOCATIONS_PROPERTY,
            value: Self::locations_value(remaining),
        });
        for location in removed {
            info!(location = %location, "unregistered");
            self.notifier.notify(Change::Event { index: OBJECT_REMOVED, args: vec![location.to_value()] });
        }
    }
}

impl RemoteObject for RegistrySource {
    fn api(&self) -> Arc<dyn ApiMap> {
        self.api.clone()
    }

    fn property(&self, index: usize) -> Value {
        match index {
            LOCATIONS_PROPERTY => Self::locations_value(&self.entries.lock()),
            _ => Value::Null,
        }
    }

    fn set_property(&self, index: usize, _value: Value) -> Result<(), InvokeError> {
        Err(InvokeError::Failed(format!("registry property {} is read-only", index)))
    }

    fn invoke(&self, ctx: &InvokeContext, index: usize, args: Vec<Value>) -> Result<Value, InvokeError> {
        let location = args
            .first()
            .and_then(SourceLocation::from_value)
            .ok_or_else(|| InvokeError::BadArguments("expected a source location".into()))?;
        match index {
            ADD_SOURCE => Ok(Value::Bool(self.add(location, Some(ctx.connection)))),
            REMOVE_SOURCE => Ok(Value::Bool(self.remove(&location))),
            _ => Err(InvokeError::InvalidIndex(index)),
        }
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<Change> {
        self.notifier.subscribe()
    }
}
