//! # Remoproto
//!
//! The wire protocol spoken between a node hosting Sources and the nodes holding
//! their Replicas.
//!
//! ## Architecture
//!
//! - **Frame**: `u32 payloadLength | u16 packetType | payload`, little-endian.
//!   The length counts the type field and the payload, never itself.
//! - **Packet**: one of the protocol messages, payload fields encoded with `remopack`.
//! - **Schema**: the on-wire description of an object's properties, methods and
//!   events, plus the `Signature` fingerprint both ends compare on first contact.
//!
//! ## Failure model
//!
//! A malformed packet is consumed whole and reported; the stream stays in sync
//! because the length prefix already told the reader where the next frame starts.
//! Only a length prefix that cannot be trusted is fatal for the connection.

mod error;
mod frame;
mod packet;
mod schema;

pub use error::Error;
pub use error::Result;
pub use frame::FrameReader;
pub use frame::HEADER_LEN;
pub use packet::CallKind;
pub use packet::ObjectInfo;
pub use packet::Packet;
pub use packet::PacketType;
pub use schema::EventDesc;
pub use schema::MethodDesc;
pub use schema::PropertyDesc;
pub use schema::Schema;
pub use schema::SchemaBuilder;
pub use schema::Signature;

pub use remopack::TypeTag;
pub use remopack::Value;

/// Version tag exchanged once per connection in the `Handshake` packet.
pub const PROTOCOL_VERSION: &str = "remo/1";

/// Frames announcing a larger payload are treated as a corrupt stream.
pub const MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;
