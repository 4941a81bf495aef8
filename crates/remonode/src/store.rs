//! # Persisted Properties
//!
//! Replicas restore the properties marked durable in their schema when they are
//! created, and hand their cache back when they are destroyed. Where the values
//! live is up to the embedding application.

use std::collections::HashMap;

use parking_lot::Mutex;
use remopack::Value;
use remoproto::Signature;

/// Storage hook for durable replica properties.
///
/// Values are keyed by object name and schema signature so that a schema change
/// never restores values into the wrong slots.
pub trait PersistedStore: Send + Sync + 'static {
    fn save(&self, name: &str, signature: &Signature, values: &[Value]);
    fn restore(&self, name: &str, signature: &Signature) -> Option<Vec<Value>>;
}

/// In-memory store, mostly useful for tests and short-lived processes.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<(String, Signature), Vec<Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PersistedStore for MemoryStore {
    fn save(&self, name: &str, signature: &Signature, values: &[Value]) {
        self.entries.lock().insert((name.to_string(), *signature), values.to_vec());
    }

    fn restore(&self, name: &str, signature: &Signature) -> Option<Vec<Value>> {
        self.entries.lock().get(&(name.to_string(), *signature)).cloned()
    }
}
