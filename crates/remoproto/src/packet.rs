//! # Packets
//!
//! The protocol messages and their payload layouts.
//!
//! ## Invariants
//! - **Panic Safety**: every decoding path returns `Result`.
//! - **Name first**: every object-scoped packet starts with the object name, so
//!   the connection manager can route on it.

use remopack::Decoder;
use remopack::Encoder;
use remopack::Value;

use crate::error::Error;
use crate::error::Result;
use crate::schema::Schema;
use crate::schema::Signature;

/// Packet type tags as they appear in the frame header.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Handshake = 1,
    ObjectList = 2,
    AddObject = 3,
    RemoveObject = 4,
    InitPacket = 5,
    InitDynamicPacket = 6,
    PropertyChangePacket = 7,
    InvokePacket = 8,
    InvokeReplyPacket = 9,
    Ping = 10,
    Pong = 11,
}

impl PacketType {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            1 => Some(Self::Handshake),
            2 => Some(Self::ObjectList),
            3 => Some(Self::AddObject),
            4 => Some(Self::RemoveObject),
            5 => Some(Self::InitPacket),
            6 => Some(Self::InitDynamicPacket),
            7 => Some(Self::PropertyChangePacket),
            8 => Some(Self::InvokePacket),
            9 => Some(Self::InvokeReplyPacket),
            10 => Some(Self::Ping),
            11 => Some(Self::Pong),
            _ => None,
        }
    }
}

/// What an `InvokePacket` asks the receiver to do.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// Replica to Source: call a method. Source to Replica: raise an event.
    Invoke = 0,
    /// Replica to Source: write a property.
    Write = 1,
}

impl CallKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Invoke),
            1 => Some(Self::Write),
            _ => None,
        }
    }
}

/// One entry of an `ObjectList`: an object the sending peer hosts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub name: String,
    pub type_name: String,
    pub signature: Signature,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Handshake {
        version: String,
    },
    ObjectList {
        objects: Vec<ObjectInfo>,
    },
    AddObject {
        name: String,
        needs_dynamic: bool,
    },
    RemoveObject {
        name: String,
    },
    Init {
        name: String,
        values: Vec<Value>,
    },
    InitDynamic {
        name: String,
        schema: Schema,
        values: Vec<Value>,
    },
    PropertyChange {
        name: String,
        index: u32,
        value: Value,
    },
    Invoke {
        name: String,
        kind: CallKind,
        index: u32,
        args: Vec<Value>,
        serial: Option<u32>,
        property_index: Option<u32>,
    },
    InvokeReply {
        name: String,
        serial: u32,
        value: Value,
    },
    Ping {
        name: String,
    },
    Pong {
        name: String,
    },
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::Handshake { .. } => PacketType::Handshake,
            Self::ObjectList { .. } => PacketType::ObjectList,
            Self::AddObject { .. } => PacketType::AddObject,
            Self::RemoveObject { .. } => PacketType::RemoveObject,
            Self::Init { .. } => PacketType::InitPacket,
            Self::InitDynamic { .. } => PacketType::InitDynamicPacket,
            Self::PropertyChange { .. } => PacketType::PropertyChangePacket,
            Self::Invoke { .. } => PacketType::InvokePacket,
            Self::InvokeReply { .. } => PacketType::InvokeReplyPacket,
            Self::Ping { .. } => PacketType::Ping,
            Self::Pong { .. } => PacketType::Pong,
        }
    }

    /// The object this packet addresses; `None` for connection-level packets.
    pub fn object_name(&self) -> Option<&str> {
        match self {
            Self::Handshake { .. } | Self::ObjectList { .. } => None,
            Self::AddObject { name, .. }
            | Self::RemoveObject { name }
            | Self::Init { name, .. }
            | Self::InitDynamic { name, .. }
            | Self::PropertyChange { name, .. }
            | Self::Invoke { name, .. }
            | Self::InvokeReply { name, .. }
            | Self::Ping { name }
            | Self::Pong { name } => Some(name),
        }
    }

    /// Encodes the payload only (no frame header).
    pub fn encode_payload(&self, enc: &mut Encoder) -> Result<()> {
        match self {
            Self::Handshake { version } => enc.str(version)?,
            Self::ObjectList { objects } => {
                enc.list_begin()?;
                for obj in objects {
                    enc.list_begin()?;
                    enc.str(&obj.name)?;
                    enc.str(&obj.type_name)?;
                    enc.bytes(obj.signature.as_bytes())?;
                    enc.list_end()?;
                }
                enc.list_end()?;
            }
            Self::AddObject { name, needs_dynamic } => {
                enc.str(name)?;
                enc.bool(*needs_dynamic)?;
            }
            Self::RemoveObject { name } | Self::Ping { name } | Self::Pong { name } => enc.str(name)?,
            Self::Init { name, values } => {
                enc.str(name)?;
                enc.values(values)?;
            }
            Self::InitDynamic { name, schema, values } => {
                enc.str(name)?;
                schema.encode(enc)?;
                enc.values(values)?;
            }
            Self::PropertyChange { name, index, value } => {
                enc.str(name)?;
                enc.u32(*index)?;
                enc.value(value)?;
            }
            Self::Invoke { name, kind, index, args, serial, property_index } => {
                enc.str(name)?;
                enc.u8(*kind as u8)?;
                enc.u32(*index)?;
                enc.values(args)?;
                enc.option_u32(*serial)?;
                enc.option_u32(*property_index)?;
            }
            Self::InvokeReply { name, serial, value } => {
                enc.str(name)?;
                enc.u32(*serial)?;
                enc.value(value)?;
            }
        }
        Ok(())
    }

    /// Decodes a payload of the given type.
    ///
    /// Trailing bytes after the last field are rejected: they mean the two ends
    /// disagree on the layout.
    pub fn decode_payload(ty: u16, payload: &[u8]) -> Result<Self> {
        let ty = PacketType::from_u16(ty).ok_or(Error::UnknownPacketType(ty))?;
        let mut dec = Decoder::new(payload);

        let packet = match ty {
            PacketType::Handshake => Self::Handshake { version: dec.str()?.to_string() },
            PacketType::ObjectList => {
                let mut iter = dec.list()?;
                let mut objects = Vec::new();
                while let Some(mut item) = iter.next()? {
                    let mut f = item.list()?;
                    let mut name = field(&mut f)?;
                    let mut type_name = field(&mut f)?;
                    let mut signature = field(&mut f)?;
                    objects.push(ObjectInfo {
                        name: name.str()?.to_string(),
                        type_name: type_name.str()?.to_string(),
                        signature: Signature::from_slice(signature.bytes()?)
                            .ok_or_else(|| Error::ProtocolViolation("signature is not 32 bytes".into()))?,
                    });
                }
                Self::ObjectList { objects }
            }
            PacketType::AddObject => Self::AddObject {
                name: dec.str()?.to_string(),
                needs_dynamic: dec.bool()?,
            },
            PacketType::RemoveObject => Self::RemoveObject { name: dec.str()?.to_string() },
            PacketType::InitPacket => Self::Init {
                name: dec.str()?.to_string(),
                values: dec.values()?,
            },
            PacketType::InitDynamicPacket => Self::InitDynamic {
                name: dec.str()?.to_string(),
                schema: Schema::decode(&mut dec)?,
                values: dec.values()?,
            },
            PacketType::PropertyChangePacket => Self::PropertyChange {
                name: dec.str()?.to_string(),
                index: dec.u32()?,
                value: dec.value()?,
            },
            PacketType::InvokePacket => {
                let name = dec.str()?.to_string();
                let raw_kind = dec.u8()?;
                let kind = CallKind::from_u8(raw_kind)
                    .ok_or_else(|| Error::ProtocolViolation(format!("unknown call kind {}", raw_kind)))?;
                Self::Invoke {
                    name,
                    kind,
                    index: dec.u32()?,
                    args: dec.values()?,
                    serial: dec.option_u32()?,
                    property_index: dec.option_u32()?,
                }
            }
            PacketType::InvokeReplyPacket => Self::InvokeReply {
                name: dec.str()?.to_string(),
                serial: dec.u32()?,
                value: dec.value()?,
            },
            PacketType::Ping => Self::Ping { name: dec.str()?.to_string() },
            PacketType::Pong => Self::Pong { name: dec.str()?.to_string() },
        };

        if dec.remaining() != 0 {
            return Err(Error::ProtocolViolation(format!(
                "{} trailing bytes after {:?}", dec.remaining(), ty
            )));
        }
        Ok(packet)
    }
}

fn field<'a>(iter: &mut remopack::ListIter<'a>) -> Result<Decoder<'a>> {
    iter.next()?
        .ok_or_else(|| Error::ProtocolViolation("object list entry is truncated".into()))
}
