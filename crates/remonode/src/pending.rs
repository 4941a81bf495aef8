//! # Pending Calls
//!
//! Correlates `InvokeReplyPacket`s with the method calls that asked for them.
//!
//! ## Invariants
//! - **Scoped serials**: serials are unique among the calls currently waiting on
//!   one connection, never across connections.
//! - **Exactly once**: every registered call completes exactly once, with a reply,
//!   a timeout, or `Aborted` when its connection goes away.

use std::fmt;
use std::sync::Weak;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use remopack::Value;
use tokio::sync::oneshot;

use crate::connection::Connection;

/// Serials stay below 2^31 and wrap.
const SERIAL_LIMIT: u32 = 1 << 31;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// The connection closed before the reply arrived.
    Aborted,
    /// No reply within the call timeout.
    Timeout,
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Aborted => write!(f, "Call aborted: connection closed"),
            Self::Timeout => write!(f, "Call timed out"),
        }
    }
}

impl std::error::Error for CallError {}

type Completion = oneshot::Sender<Result<Value, CallError>>;

/// Per-connection table of calls waiting for a reply.
pub(crate) struct PendingCalls {
    next: Mutex<u32>,
    calls: DashMap<u32, Completion>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    pub(crate) fn starting_at(next: u32) -> Self {
        Self { next: Mutex::new(next % SERIAL_LIMIT), calls: DashMap::new() }
    }

    /// Registers a call and returns its serial.
    pub fn register(&self) -> (u32, oneshot::Receiver<Result<Value, CallError>>) {
        let (tx, rx) = oneshot::channel();
        let mut next = self.next.lock();
        loop {
            let serial = *next;
            *next = (serial + 1) % SERIAL_LIMIT;
            // a serial still in flight after a full wrap is skipped
            if let Entry::Vacant(slot) = self.calls.entry(serial) {
                slot.insert(tx);
                return (serial, rx);
            }
        }
    }

    /// Completes the call with `serial`. Unknown serials are ignored.
    pub fn resolve(&self, serial: u32, value: Value) -> bool {
        match self.calls.remove(&serial) {
            Some((_, tx)) => {
                let _ = tx.send(Ok(value));
                true
            }
            None => false,
        }
    }

    pub fn forget(&self, serial: u32) {
        self.calls.remove(&serial);
    }

    /// Fails every waiting call with `Aborted`. Returns how many there were.
    pub fn abort_all(&self) -> usize {
        let serials: Vec<u32> = self.calls.iter().map(|e| *e.key()).collect();
        let mut aborted = 0;
        for serial in serials {
            if let Some((_, tx)) = self.calls.remove(&serial) {
                let _ = tx.send(Err(CallError::Aborted));
                aborted += 1;
            }
        }
        aborted
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }
}

/// Handle to the eventual reply of one method call.
pub struct PendingReply {
    serial: u32,
    rx: oneshot::Receiver<Result<Value, CallError>>,
    connection: Weak<Connection>,
    timeout: Duration,
}

impl PendingReply {
    pub(crate) fn new(
        serial: u32,
        rx: oneshot::Receiver<Result<Value, CallError>>,
        connection: Weak<Connection>,
        timeout: Duration,
    ) -> Self {
        Self { serial, rx, connection, timeout }
    }

    pub fn serial(&self) -> u32 {
        self.serial
    }

    /// Waits for the reply using the node's call timeout.
    pub async fn wait(self) -> Result<Value, CallError> {
        let timeout = self.timeout;
        self.wait_timeout(timeout).await
    }

    pub async fn wait_timeout(self, timeout: Duration) -> Result<Value, CallError> {
        let Self { serial, rx, connection, .. } = self;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CallError::Aborted),
            Err(_) => {
                if let Some(conn) = connection.upgrade() {
                    conn.pending().forget(serial);
                }
                Err(CallError::Timeout)
            }
        }
    }
}

impl fmt::Debug for PendingReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingReply").field("serial", &self.serial).finish()
    }
}
