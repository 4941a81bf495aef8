//! # remonode
//!
//! Object replication between processes. A node publishes local objects as
//! **Sources**; other nodes acquire **Replicas** of them by name. Replicas
//! cache the Source's properties, receive its events, and forward writes and
//! method calls back to it.
//!
//! ```text
//!  Node A                                   Node B
//!  ┌──────────┐   Init / PropertyChange / event   ┌──────────┐
//!  │ Source   │ ────────────────────────────────► │ Replica  │
//!  │ (object) │ ◄──────────────────────────────── │ (cache)  │
//!  └──────────┘   write / method call / reply     └──────────┘
//! ```
//!
//! The layers below are `remoproto` (packets and framing) and `remopack`
//! (the value codec).

pub mod api;
pub mod config;
pub mod connection;
pub mod node;
pub mod object;
pub mod pending;
pub mod registry;
pub mod replica;
pub mod store;
pub mod transport;

mod manager;
mod source;

pub use api::ApiMap;
pub use api::DynamicApiMap;
pub use api::IndexOffsets;
pub use api::StaticApiMap;
pub use config::Config;
pub use connection::ConnectionId;
pub use node::Node;
pub use object::Change;
pub use object::DynamicObject;
pub use object::InvokeContext;
pub use object::InvokeError;
pub use object::RemoteObject;
pub use pending::CallError;
pub use pending::PendingReply;
pub use registry::REGISTRY_NAME;
pub use registry::SourceLocation;
pub use replica::Replica;
pub use replica::ReplicaEvent;
pub use replica::ReplicaState;
pub use store::MemoryStore;
pub use store::PersistedStore;

pub use remopack::TypeTag;
pub use remopack::Value;
pub use remoproto::Schema;
pub use remoproto::Signature;

#[cfg(test)]
mod tests;
