//! # API Maps
//!
//! The bridge between a type's schema (what goes on the wire) and the index
//! space of the object that implements it.
//!
//! ## Philosophy
//!
//! - **Wire indices are schema positions**: property, method and event indices
//!   in packets always refer to positions in the `Schema`.
//! - **Local indices may differ**: a `RemoteObject` may number its members
//!   differently (for instance, after members it does not replicate). A static
//!   map carries constant offsets between the two spaces.
//! - **Static vs Dynamic**: a `StaticApiMap` is known before connecting and is
//!   checked against the Source's signature. A `DynamicApiMap` is built from the
//!   schema the Source sends in `InitDynamicPacket`.

use remopack::TypeTag;
use remoproto::Schema;
use remoproto::Signature;

/// Schema access plus translation between wire and local indices.
pub trait ApiMap: Send + Sync + 'static {
    fn schema(&self) -> &Schema;

    /// Cached `schema().signature()`.
    fn signature(&self) -> Signature;

    /// True for maps built from a schema received over the wire.
    fn is_dynamic(&self) -> bool {
        false
    }

    fn type_name(&self) -> &str {
        &self.schema().type_name
    }

    fn property_count(&self) -> usize {
        self.schema().properties.len()
    }

    fn method_count(&self) -> usize {
        self.schema().methods.len()
    }

    fn event_count(&self) -> usize {
        self.schema().events.len()
    }

    fn property_type(&self, index: usize) -> Option<TypeTag> {
        self.schema().properties.get(index).map(|p| p.ty)
    }

    fn parameter_types(&self, method: usize) -> Option<&[TypeTag]> {
        self.schema().methods.get(method).map(|m| m.params.as_slice())
    }

    fn event_parameter_types(&self, event: usize) -> Option<&[TypeTag]> {
        self.schema().events.get(event).map(|e| e.params.as_slice())
    }

    /// The event raised when `property` changes.
    fn notify_event(&self, property: usize) -> Option<usize> {
        self.schema()
            .properties
            .get(property)
            .and_then(|p| p.notify)
            .map(|e| e as usize)
    }

    /// Local property index to wire index.
    fn source_property_index(&self, local: usize) -> Option<usize> {
        (local < self.property_count()).then_some(local)
    }

    /// Local method index to wire index.
    fn source_method_index(&self, local: usize) -> Option<usize> {
        (local < self.method_count()).then_some(local)
    }

    /// Local event index to wire index.
    fn source_event_index(&self, local: usize) -> Option<usize> {
        (local < self.event_count()).then_some(local)
    }

    /// Wire property index to local index.
    fn local_property_index(&self, wire: usize) -> Option<usize> {
        (wire < self.property_count()).then_some(wire)
    }

    /// Wire method index to local index.
    fn local_method_index(&self, wire: usize) -> Option<usize> {
        (wire < self.method_count()).then_some(wire)
    }
}

/// Offsets from wire indices to local indices.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexOffsets {
    pub properties: usize,
    pub methods: usize,
    pub events: usize,
}

/// Map for a type known at compile time or built by the application.
#[derive(Debug, Clone)]
pub struct StaticApiMap {
    schema: Schema,
    signature: Signature,
    offsets: IndexOffsets,
}

impl StaticApiMap {
    pub fn new(schema: Schema) -> Self {
        Self::with_offsets(schema, IndexOffsets::default())
    }

    /// A map whose local member `i + offset` is wire member `i`.
    pub fn with_offsets(schema: Schema, offsets: IndexOffsets) -> Self {
        let signature = schema.signature();
        Self { schema, signature, offsets }
    }

    pub fn offsets(&self) -> IndexOffsets {
        self.offsets
    }
}

fn shift_down(local: usize, offset: usize, count: usize) -> Option<usize> {
    local.checked_sub(offset).filter(|&wire| wire < count)
}

impl ApiMap for StaticApiMap {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn signature(&self) -> Signature {
        self.signature
    }

    fn source_property_index(&self, local: usize) -> Option<usize> {
        shift_down(local, self.offsets.properties, self.property_count())
    }

    fn source_method_index(&self, local: usize) -> Option<usize> {
        shift_down(local, self.offsets.methods, self.method_count())
    }

    fn source_event_index(&self, local: usize) -> Option<usize> {
        shift_down(local, self.offsets.events, self.event_count())
    }

    fn local_property_index(&self, wire: usize) -> Option<usize> {
        (wire < self.property_count()).then(|| wire + self.offsets.properties)
    }

    fn local_method_index(&self, wire: usize) -> Option<usize> {
        (wire < self.method_count()).then(|| wire + self.offsets.methods)
    }
}

/// Map built at runtime from a schema received from the Source.
#[derive(Debug, Clone)]
pub struct DynamicApiMap {
    schema: Schema,
    signature: Signature,
}

impl DynamicApiMap {
    pub fn new(schema: Schema) -> Self {
        let signature = schema.signature();
        Self { schema, signature }
    }
}

impl ApiMap for DynamicApiMap {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn signature(&self) -> Signature {
        self.signature
    }

    fn is_dynamic(&self) -> bool {
        true
    }
}

/// Whether `args` matches the declared parameter list.
pub(crate) fn arguments_match(params: &[TypeTag], args: &[remopack::Value]) -> bool {
    params.len() == args.len() && params.iter().zip(args).all(|(ty, v)| ty.accepts(v))
}
