//! # Dynamic Values
//!
//! `Value` is the dynamically typed cell stored in property caches and carried
//! as method arguments. `TypeTag` is the schema-side description of what a cell
//! may hold.

use crate::Decoder;
use crate::Encoder;
use crate::Error;
use crate::MAX_DEPTH;
use crate::Result;
use crate::Tag;

/// A dynamically typed value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    /// Absent or invalid; also the return value of void methods.
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    /// Ordered key/value pairs. Keys are not deduplicated.
    Map(Vec<(String, Value)>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the value as a signed integer, converting unsigned values that fit.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::UInt(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    /// Returns the value as an unsigned integer, converting non-negative signed values.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::UInt(v) => Some(*v),
            Value::Int(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            Value::UInt(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&[(String, Value)]> {
        match self {
            Value::Map(entries) => Some(entries),
            _ => None,
        }
    }

    /// Looks up the first entry named `key` in a map value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map()?.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// The tag describing this value's shape.
    pub fn type_tag(&self) -> TypeTag {
        match self {
            Value::Null => TypeTag::Any,
            Value::Bool(_) => TypeTag::Bool,
            Value::Int(_) => TypeTag::Int,
            Value::UInt(_) => TypeTag::UInt,
            Value::Double(_) => TypeTag::Double,
            Value::String(_) => TypeTag::String,
            Value::Bytes(_) => TypeTag::Bytes,
            Value::List(_) => TypeTag::List,
            Value::Map(_) => TypeTag::Map,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self { Value::Bool(v) }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self { Value::Int(v as i64) }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self { Value::Int(v) }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self { Value::UInt(v as u64) }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self { Value::UInt(v) }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self { Value::Double(v) }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self { Value::String(v.to_string()) }
}

impl From<String> for Value {
    fn from(v: String) -> Self { Value::String(v) }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self { Value::Bytes(v) }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self { Value::List(v) }
}

/// The declared type of a property, parameter or return value.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeTag {
    Any = 0,
    Bool = 1,
    Int = 2,
    UInt = 3,
    Double = 4,
    String = 5,
    Bytes = 6,
    List = 7,
    Map = 8,
}

impl TypeTag {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(TypeTag::Any),
            1 => Some(TypeTag::Bool),
            2 => Some(TypeTag::Int),
            3 => Some(TypeTag::UInt),
            4 => Some(TypeTag::Double),
            5 => Some(TypeTag::String),
            6 => Some(TypeTag::Bytes),
            7 => Some(TypeTag::List),
            8 => Some(TypeTag::Map),
            _ => None,
        }
    }

    /// Whether a value may be stored in a slot of this type.
    ///
    /// `Null` fits everywhere; integers are accepted by the other integer tag
    /// when the conversion is lossless.
    pub fn accepts(self, value: &Value) -> bool {
        match (self, value) {
            (TypeTag::Any, _) | (_, Value::Null) => true,
            (TypeTag::Int, v) => v.as_i64().is_some(),
            (TypeTag::UInt, v) => v.as_u64().is_some(),
            (TypeTag::Double, Value::Double(_)) => true,
            (tag, v) => tag == v.type_tag(),
        }
    }

    /// The value a slot of this type holds before any data has arrived.
    pub fn default_value(self) -> Value {
        match self {
            TypeTag::Any => Value::Null,
            TypeTag::Bool => Value::Bool(false),
            TypeTag::Int => Value::Int(0),
            TypeTag::UInt => Value::UInt(0),
            TypeTag::Double => Value::Double(0.0),
            TypeTag::String => Value::String(String::new()),
            TypeTag::Bytes => Value::Bytes(Vec::new()),
            TypeTag::List => Value::List(Vec::new()),
            TypeTag::Map => Value::Map(Vec::new()),
        }
    }
}

impl Encoder {
    /// Encodes a `Value` and everything nested in it.
    pub fn value(&mut self, value: &Value) -> Result<()> {
        match value {
            Value::Null => self.null(),
            Value::Bool(b) => self.bool(*b),
            Value::Int(v) => self.i64(*v),
            Value::UInt(v) => self.u64(*v),
            Value::Double(v) => self.f64(*v),
            Value::String(s) => self.str(s),
            Value::Bytes(b) => self.bytes(b),
            Value::List(items) => {
                self.list_begin()?;
                for item in items {
                    self.value(item)?;
                }
                self.list_end()
            }
            Value::Map(entries) => {
                self.map_begin()?;
                for (key, item) in entries {
                    self.str(key)?;
                    self.value(item)?;
                }
                self.map_end()
            }
        }
    }

    /// Encodes a list of values, the shape used for argument and snapshot lists.
    pub fn values(&mut self, values: &[Value]) -> Result<()> {
        self.list_begin()?;
        for value in values {
            self.value(value)?;
        }
        self.list_end()
    }

    pub fn type_tag(&mut self, tag: TypeTag) -> Result<()> {
        self.u8(tag as u8)
    }
}

impl<'a> Decoder<'a> {
    /// Decodes the next item as a `Value`.
    ///
    /// Protocol-only tags (`U8`, `U16`, `U32`, options) widen into the closest value.
    pub fn value(&mut self) -> Result<Value> {
        self.value_at(0)
    }

    fn value_at(&mut self, depth: usize) -> Result<Value> {
        if depth > MAX_DEPTH {
            return Err(Error::TooDeep);
        }

        match self.peek_tag()? {
            Tag::Null => self.null().map(|_| Value::Null),
            Tag::BoolTrue | Tag::BoolFalse => self.bool().map(Value::Bool),
            Tag::U8 => self.u8().map(|v| Value::UInt(v as u64)),
            Tag::U16 => self.u16().map(|v| Value::UInt(v as u64)),
            Tag::U32 => self.u32().map(|v| Value::UInt(v as u64)),
            Tag::U64 => self.u64().map(Value::UInt),
            Tag::I64 => self.i64().map(Value::Int),
            Tag::F64 => self.f64().map(Value::Double),
            Tag::String => self.str().map(|s| Value::String(s.to_string())),
            Tag::Bytes => self.bytes().map(|b| Value::Bytes(b.to_vec())),
            Tag::OptionNone => self.option().map(|_| Value::Null),
            Tag::OptionSome => match self.option()? {
                Some(mut inner) => inner.value_at(depth + 1),
                None => Ok(Value::Null),
            },
            Tag::List => {
                let mut iter = self.list()?;
                let mut items = Vec::new();
                while let Some(mut item) = iter.next()? {
                    items.push(item.value_at(depth + 1)?);
                }
                Ok(Value::List(items))
            }
            Tag::Map => {
                let mut iter = self.map()?;
                let mut entries = Vec::new();
                while let Some((key, mut item)) = iter.next()? {
                    entries.push((key.to_string(), item.value_at(depth + 1)?));
                }
                Ok(Value::Map(entries))
            }
        }
    }

    /// Decodes a list of values.
    pub fn values(&mut self) -> Result<Vec<Value>> {
        let mut iter = self.list()?;
        let mut out = Vec::new();
        while let Some(mut item) = iter.next()? {
            out.push(item.value()?);
        }
        Ok(out)
    }

    pub fn type_tag(&mut self) -> Result<TypeTag> {
        let b = self.u8()?;
        TypeTag::from_u8(b).ok_or(Error::InvalidTag(b))
    }
}
