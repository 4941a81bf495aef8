//! # Object Schemas
//!
//! A `Schema` is the ordered description of one replicated type: properties,
//! methods and events, each addressed by position. Positions are the indices
//! used in every packet, so a schema is never reordered once built.
//!
//! Schemas are produced two ways: by an application through `SchemaBuilder`,
//! or at runtime from an `InitDynamicPacket` for replicas that know nothing
//! about the type in advance.

use remopack::Decoder;
use remopack::Encoder;
use remopack::TypeTag;

use crate::error::Error;
use crate::error::Result;

/// One property slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyDesc {
    pub name: String,
    pub ty: TypeTag,
    /// Index of the event raised when this property changes.
    pub notify: Option<u32>,
    /// Persisted across replica lifetimes through the store hook.
    pub durable: bool,
}

/// One invokable method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDesc {
    pub name: String,
    pub params: Vec<TypeTag>,
    pub ret: TypeTag,
}

/// One event the object may raise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventDesc {
    pub name: String,
    pub params: Vec<TypeTag>,
}

/// The full API of a replicated type.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Schema {
    pub type_name: String,
    pub properties: Vec<PropertyDesc>,
    pub methods: Vec<MethodDesc>,
    pub events: Vec<EventDesc>,
}

impl Schema {
    pub fn builder(type_name: impl Into<String>) -> SchemaBuilder {
        SchemaBuilder::new(type_name)
    }

    pub fn property_index(&self, name: &str) -> Option<usize> {
        self.properties.iter().position(|p| p.name == name)
    }

    pub fn method_index(&self, name: &str) -> Option<usize> {
        self.methods.iter().position(|m| m.name == name)
    }

    pub fn event_index(&self, name: &str) -> Option<usize> {
        self.events.iter().position(|e| e.name == name)
    }

    /// The property whose notify event is `event`, if any.
    pub fn property_for_event(&self, event: usize) -> Option<usize> {
        self.properties.iter().position(|p| p.notify == Some(event as u32))
    }

    /// Fingerprint of everything that affects wire compatibility.
    ///
    /// Durability is a local storage concern and is left out.
    pub fn signature(&self) -> Signature {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.type_name.as_bytes());
        hasher.update(&[0]);
        for p in &self.properties {
            hasher.update(b"p");
            hasher.update(p.name.as_bytes());
            hasher.update(&[0, p.ty as u8]);
            hasher.update(&p.notify.map_or(u32::MAX, |n| n).to_le_bytes());
        }
        for m in &self.methods {
            hasher.update(b"m");
            hasher.update(m.name.as_bytes());
            hasher.update(&[0, m.ret as u8]);
            hasher.update(&(m.params.len() as u32).to_le_bytes());
            for ty in &m.params {
                hasher.update(&[*ty as u8]);
            }
        }
        for e in &self.events {
            hasher.update(b"e");
            hasher.update(e.name.as_bytes());
            hasher.update(&[0]);
            hasher.update(&(e.params.len() as u32).to_le_bytes());
            for ty in &e.params {
                hasher.update(&[*ty as u8]);
            }
        }
        Signature(*hasher.finalize().as_bytes())
    }

    pub fn encode(&self, enc: &mut Encoder) -> Result<()> {
        enc.list_begin()?;
        enc.str(&self.type_name)?;

        enc.list_begin()?;
        for p in &self.properties {
            enc.list_begin()?;
            enc.str(&p.name)?;
            enc.type_tag(p.ty)?;
            enc.option_u32(p.notify)?;
            enc.bool(p.durable)?;
            enc.list_end()?;
        }
        enc.list_end()?;

        enc.list_begin()?;
        for m in &self.methods {
            enc.list_begin()?;
            enc.str(&m.name)?;
            encode_tags(enc, &m.params)?;
            enc.type_tag(m.ret)?;
            enc.list_end()?;
        }
        enc.list_end()?;

        enc.list_begin()?;
        for e in &self.events {
            enc.list_begin()?;
            enc.str(&e.name)?;
            encode_tags(enc, &e.params)?;
            enc.list_end()?;
        }
        enc.list_end()?;

        enc.list_end()?;
        Ok(())
    }

    pub fn decode(dec: &mut Decoder) -> Result<Self> {
        let mut fields = dec.list()?;
        let mut type_name = next_item(&mut fields, "schema type name")?;
        let mut props = next_item(&mut fields, "schema properties")?.list()?;
        let mut methods = next_item(&mut fields, "schema methods")?.list()?;
        let mut events = next_item(&mut fields, "schema events")?.list()?;

        let mut schema = Schema {
            type_name: type_name.str()?.to_string(),
            ..Default::default()
        };

        while let Some(mut item) = props.next()? {
            let mut f = item.list()?;
            schema.properties.push(PropertyDesc {
                name: next_item(&mut f, "property name")?.str()?.to_string(),
                ty: next_item(&mut f, "property type")?.type_tag()?,
                notify: next_item(&mut f, "property notify")?.option_u32()?,
                durable: next_item(&mut f, "property durable")?.bool()?,
            });
        }

        while let Some(mut item) = methods.next()? {
            let mut f = item.list()?;
            schema.methods.push(MethodDesc {
                name: next_item(&mut f, "method name")?.str()?.to_string(),
                params: decode_tags(&mut next_item(&mut f, "method params")?)?,
                ret: next_item(&mut f, "method return")?.type_tag()?,
            });
        }

        while let Some(mut item) = events.next()? {
            let mut f = item.list()?;
            schema.events.push(EventDesc {
                name: next_item(&mut f, "event name")?.str()?.to_string(),
                params: decode_tags(&mut next_item(&mut f, "event params")?)?,
            });
        }

        for p in &schema.properties {
            if let Some(n) = p.notify {
                if n as usize >= schema.events.len() {
                    return Err(Error::ProtocolViolation(format!(
                        "property '{}' notifies through missing event {}", p.name, n
                    )));
                }
            }
        }

        Ok(schema)
    }
}

fn encode_tags(enc: &mut Encoder, tags: &[TypeTag]) -> Result<()> {
    enc.list_begin()?;
    for ty in tags {
        enc.type_tag(*ty)?;
    }
    enc.list_end()?;
    Ok(())
}

fn decode_tags(dec: &mut Decoder) -> Result<Vec<TypeTag>> {
    let mut iter = dec.list()?;
    let mut out = Vec::new();
    while let Some(mut item) = iter.next()? {
        out.push(item.type_tag()?);
    }
    Ok(out)
}

fn next_item<'a>(iter: &mut remopack::ListIter<'a>, what: &str) -> Result<Decoder<'a>> {
    iter.next()?
        .ok_or_else(|| Error::ProtocolViolation(format!("missing {}", what)))
}

/// Fluent construction of a `Schema`.
///
/// ```
/// use remoproto::{Schema, TypeTag};
///
/// let schema = Schema::builder("Counter")
///     .notify_property("value", TypeTag::Int)
///     .method("increment", &[], TypeTag::Int)
///     .build();
/// assert_eq!(schema.events[0].name, "valueChanged");
/// ```
pub struct SchemaBuilder {
    schema: Schema,
}

impl SchemaBuilder {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            schema: Schema { type_name: type_name.into(), ..Default::default() },
        }
    }

    /// Adds a property with no change event.
    pub fn property(mut self, name: impl Into<String>, ty: TypeTag) -> Self {
        self.schema.properties.push(PropertyDesc {
            name: name.into(),
            ty,
            notify: None,
            durable: false,
        });
        self
    }

    /// Adds a property together with its `<name>Changed(value)` event.
    pub fn notify_property(mut self, name: impl Into<String>, ty: TypeTag) -> Self {
        let name = name.into();
        let event = self.schema.events.len() as u32;
        self.schema.events.push(EventDesc {
            name: format!("{}Changed", name),
            params: vec![ty],
        });
        self.schema.properties.push(PropertyDesc {
            name,
            ty,
            notify: Some(event),
            durable: false,
        });
        self
    }

    /// Marks the most recently added property as durable.
    pub fn durable(mut self) -> Self {
        if let Some(p) = self.schema.properties.last_mut() {
            p.durable = true;
        }
        self
    }

    pub fn method(mut self, name: impl Into<String>, params: &[TypeTag], ret: TypeTag) -> Self {
        self.schema.methods.push(MethodDesc {
            name: name.into(),
            params: params.to_vec(),
            ret,
        });
        self
    }

    pub fn event(mut self, name: impl Into<String>, params: &[TypeTag]) -> Self {
        self.schema.events.push(EventDesc {
            name: name.into(),
            params: params.to_vec(),
        });
        self
    }

    pub fn build(self) -> Schema {
        self.schema
    }
}

/// BLAKE3 fingerprint of a schema.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signature(pub [u8; 32]);

impl Signature {
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Display for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in &self.0[..8] {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature({})", self)
    }
}
