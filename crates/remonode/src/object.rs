//! # Remotable Objects
//!
//! What a node needs from an object in order to host it as a Source: read and
//! write properties by index, run methods, and report its own changes.
//!
//! ## Invariants
//! - **Local indices**: everything in this module is numbered in the object's
//!   own index space. The Source translates through the object's `ApiMap`.
//! - **Ordered changes**: an object must push `Change`s in the order its state
//!   actually changed. Replicas converge to the last value pushed.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use remopack::Value;
use remoproto::Schema;
use tokio::sync::mpsc;

use crate::api::ApiMap;
use crate::api::StaticApiMap;
use crate::api::arguments_match;
use crate::connection::ConnectionId;

/// A change an object reports about itself.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Property { index: usize, value: Value },
    Event { index: usize, args: Vec<Value> },
}

/// Why a method call or property write was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvokeError {
    InvalidIndex(usize),
    UnknownMember(String),
    BadArguments(String),
    Failed(String),
}

impl fmt::Display for InvokeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidIndex(i) => write!(f, "No member at index {}", i),
            Self::UnknownMember(name) => write!(f, "No member named '{}'", name),
            Self::BadArguments(msg) => write!(f, "Bad arguments: {}", msg),
            Self::Failed(msg) => write!(f, "Invocation failed: {}", msg),
        }
    }
}

impl std::error::Error for InvokeError {}

/// Who is calling.
#[derive(Debug, Clone)]
pub struct InvokeContext {
    pub connection: ConnectionId,
    pub object_name: String,
}

/// An object a node can host as a Source.
pub trait RemoteObject: Send + Sync + 'static {
    fn api(&self) -> Arc<dyn ApiMap>;

    /// Current value of a property.
    fn property(&self, index: usize) -> Value;

    /// Write requested by a replica. Accepted writes come back as a `Change`.
    fn set_property(&self, index: usize, value: Value) -> Result<(), InvokeError>;

    /// Runs a method and returns its result.
    fn invoke(&self, ctx: &InvokeContext, index: usize, args: Vec<Value>) -> Result<Value, InvokeError>;

    /// A fresh stream of the object's changes from now on.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<Change>;
}

/// Fan-out of `Change`s to any number of subscribers.
#[derive(Default)]
pub struct Notifier {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Change>>>,
}

impl Notifier {
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Change> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Pushes `change` to every live subscriber, forgetting dropped ones.
    pub fn notify(&self, change: Change) {
        self.subscribers.lock().retain(|tx| tx.send(change.clone()).is_ok());
    }
}

pub type MethodHandler =
    Box<dyn Fn(&DynamicObject, &InvokeContext, Vec<Value>) -> Result<Value, InvokeError> + Send + Sync>;

/// A general-purpose object driven entirely by a `Schema`.
///
/// Properties are stored as `Value`s; methods are closures registered on the
/// builder. Handlers receive the object itself so they can read, write and
/// emit.
pub struct DynamicObject {
    api: Arc<StaticApiMap>,
    values: Mutex<Vec<Value>>,
    methods: Vec<Option<MethodHandler>>,
    notifier: Notifier,
}

impl DynamicObject {
    pub fn builder(schema: Schema) -> DynamicObjectBuilder {
        DynamicObjectBuilder::new(schema)
    }

    pub fn schema(&self) -> &Schema {
        self.api.schema()
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        self.values.lock().get(index).cloned()
    }

    pub fn get_by_name(&self, name: &str) -> Option<Value> {
        self.get(self.schema().property_index(name)?)
    }

    /// Stores a new value, reporting the change if it differs from the old one.
    ///
    /// Returns whether anything changed.
    pub fn set(&self, index: usize, value: Value) -> Result<bool, InvokeError> {
        let ty = self.api.property_type(index).ok_or(InvokeError::InvalidIndex(index))?;
        if !ty.accepts(&value) {
            return Err(InvokeError::BadArguments(format!(
                "{:?} does not fit property {} of type {:?}", value, index, ty
            )));
        }

        let mut values = self.values.lock();
        if values[index] == value {
            return Ok(false);
        }
        values[index] = value.clone();
        // still under the lock, so the change stream matches state order
        self.notifier.notify(Change::Property { index, value });
        Ok(true)
    }

    pub fn set_by_name(&self, name: &str, value: Value) -> Result<bool, InvokeError> {
        let index = self
            .schema()
            .property_index(name)
            .ok_or_else(|| InvokeError::UnknownMember(name.to_string()))?;
        self.set(index, value)
    }

    /// Raises an event.
    pub fn emit(&self, index: usize, args: Vec<Value>) -> Result<(), InvokeError> {
        let params = self.api.event_parameter_types(index).ok_or(InvokeError::InvalidIndex(index))?;
        if !arguments_match(params, &args) {
            return Err(InvokeError::BadArguments(format!("event {} expects {:?}", index, params)));
        }
        let _values = self.values.lock();
        self.notifier.notify(Change::Event { index, args });
        Ok(())
    }

    pub fn emit_by_name(&self, name: &str, args: Vec<Value>) -> Result<(), InvokeError> {
        let index = self
            .schema()
            .event_index(name)
            .ok_or_else(|| InvokeError::UnknownMember(name.to_string()))?;
        self.emit(index, args)
    }
}

impl RemoteObject for DynamicObject {
    fn api(&self) -> Arc<dyn ApiMap> {
        self.api.clone()
    }

    fn property(&self, index: usize) -> Value {
        self.get(index).unwrap_or_default()
    }

    fn set_property(&self, index: usize, value: Value) -> Result<(), InvokeError> {
        self.set(index, value).map(|_| ())
    }

    fn invoke(&self, ctx: &InvokeContext, index: usize, args: Vec<Value>) -> Result<Value, InvokeError> {
        match self.methods.get(index) {
            Some(Some(handler)) => handler(self, ctx, args),
            Some(None) => Err(InvokeError::Failed(format!(
                "method '{}' has no handler", self.schema().methods[index].name
            ))),
            None => Err(InvokeError::InvalidIndex(index)),
        }
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<Change> {
        self.notifier.subscribe()
    }
}

pub struct DynamicObjectBuilder {
    schema: Schema,
    values: Vec<Value>,
    methods: Vec<Option<MethodHandler>>,
    unknown: Option<String>,
}

impl DynamicObjectBuilder {
    fn new(schema: Schema) -> Self {
        let values = schema.properties.iter().map(|p| p.ty.default_value()).collect();
        let methods = schema.methods.iter().map(|_| None).collect();
        Self { schema, values, methods, unknown: None }
    }

    /// Initial value of a property.
    pub fn value(mut self, name: &str, value: impl Into<Value>) -> Self {
        match self.schema.property_index(name) {
            Some(i) => self.values[i] = value.into(),
            None => self.unknown = self.unknown.or_else(|| Some(name.to_string())),
        }
        self
    }

    /// Handler for a method.
    pub fn method<F>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(&DynamicObject, &InvokeContext, Vec<Value>) -> Result<Value, InvokeError> + Send + Sync + 'static,
    {
        match self.schema.method_index(name) {
            Some(i) => self.methods[i] = Some(Box::new(handler)),
            None => self.unknown = self.unknown.or_else(|| Some(name.to_string())),
        }
        self
    }

    pub fn build(self) -> Result<Arc<DynamicObject>, InvokeError> {
        if let Some(name) = self.unknown {
            return Err(InvokeError::UnknownMember(name));
        }
        for (i, (value, prop)) in self.values.iter().zip(&self.schema.properties).enumerate() {
            if !prop.ty.accepts(value) {
                return Err(InvokeError::BadArguments(format!(
                    "initial value of property {} does not fit {:?}", i, prop.ty
                )));
            }
        }
        Ok(Arc::new(DynamicObject {
            api: Arc::new(StaticApiMap::new(self.schema)),
            values: Mutex::new(self.values),
            methods: self.methods,
            notifier: Notifier::default(),
        }))
    }
}
