//! # Node Configuration
//!
//! Operational tuning for a node. None of these values are part of the wire
//! contract; two nodes with different settings interoperate.

use std::sync::Arc;
use std::time::Duration;

use remoproto::MAX_PACKET_SIZE;

use crate::store::PersistedStore;

#[derive(Clone)]
pub struct Config {
    /// Delay between dial attempts for explicitly requested addresses.
    pub retry_interval: Duration,
    /// How long `PendingReply::wait` suspends before giving up.
    pub call_timeout: Duration,
    /// Keepalive period for client connections; `None` disables keepalive.
    pub heartbeat_interval: Option<Duration>,
    /// Address of the node hosting the discovery registry.
    pub registry_address: Option<String>,
    /// Save/restore hook for durable replica properties.
    pub persisted_store: Option<Arc<dyn PersistedStore>>,
    /// Frames announcing more than this many bytes close the connection.
    pub max_packet_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(2),
            call_timeout: Duration::from_secs(30),
            heartbeat_interval: None,
            registry_address: None,
            persisted_store: None,
            max_packet_size: MAX_PACKET_SIZE,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    pub fn with_registry(mut self, address: impl Into<String>) -> Self {
        self.registry_address = Some(address.into());
        self
    }

    pub fn with_store(mut self, store: Arc<dyn PersistedStore>) -> Self {
        self.persisted_store = Some(store);
        self
    }

    pub fn with_max_packet_size(mut self, bytes: usize) -> Self {
        self.max_packet_size = bytes;
        self
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("retry_interval", &self.retry_interval)
            .field("call_timeout", &self.call_timeout)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("registry_address", &self.registry_address)
            .field("persisted_store", &self.persisted_store.is_some())
            .field("max_packet_size", &self.max_packet_size)
            .finish()
    }
}
