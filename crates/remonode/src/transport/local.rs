//! In-process transport over tokio channels.
//!
//! `local://name` addresses live in a process-wide table so that two nodes in
//! the same process can reach each other without sockets. The same duplex pair
//! backs a node's loopback connection to its own sources.

use std::sync::OnceLock;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use url::Url;

use super::Acceptor;
use super::Backend;
use super::Error;
use super::Result;
use super::Transport;

type Listeners = DashMap<String, mpsc::UnboundedSender<LocalTransport>>;

fn listeners() -> &'static Listeners {
    static LISTENERS: OnceLock<Listeners> = OnceLock::new();
    LISTENERS.get_or_init(DashMap::new)
}

/// A duplex channel transport.
///
/// Bytes sent on one end appear on the other end's `recv`. Closing (or
/// dropping) one end ends the stream for the other.
pub struct LocalTransport {
    tx: parking_lot::Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    peer: String,
}

impl LocalTransport {
    /// Creates a pair of transports connected to each other.
    pub fn pair(label: &str) -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();

        let a = Self {
            tx: parking_lot::Mutex::new(Some(tx_a)),
            rx: Mutex::new(rx_b),
            peer: format!("{} (server end)", label),
        };
        let b = Self {
            tx: parking_lot::Mutex::new(Some(tx_b)),
            rx: Mutex::new(rx_a),
            peer: format!("{} (client end)", label),
        };
        (a, b)
    }
}

#[async_trait::async_trait]
impl Transport for LocalTransport {
    async fn send(&self, bytes: &[u8]) -> Result<()> {
        let tx = self.tx.lock().clone();
        match tx {
            Some(tx) => tx
                .send(bytes.to_vec())
                .map_err(|_| Error::ConnectionLost("peer dropped".into())),
            None => Err(Error::ConnectionLost("transport closed".into())),
        }
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>> {
        let mut rx = self.rx.lock().await;
        Ok(rx.recv().await)
    }

    async fn close(&self) {
        self.tx.lock().take();
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}

pub struct LocalBackend;

#[async_trait::async_trait]
impl Backend for LocalBackend {
    async fn connect(&self, url: &Url) -> Result<Box<dyn Transport>> {
        let key = url.as_str().to_string();
        let sender = listeners()
            .get(&key)
            .map(|s| s.value().clone())
            .ok_or_else(|| Error::Unreachable(key.clone()))?;

        let (client, server) = LocalTransport::pair(&key);
        if sender.send(server).is_err() {
            listeners().remove_if(&key, |_, s| s.same_channel(&sender));
            return Err(Error::Unreachable(key));
        }
        Ok(Box::new(client))
    }

    async fn listen(&self, url: &Url) -> Result<Box<dyn Acceptor>> {
        let key = url.as_str().to_string();
        let (tx, rx) = mpsc::unbounded_channel();

        match listeners().entry(key.clone()) {
            Entry::Occupied(mut slot) if slot.get().is_closed() => {
                slot.insert(tx.clone());
            }
            Entry::Occupied(_) => return Err(Error::AddressInUse(key)),
            Entry::Vacant(slot) => {
                slot.insert(tx.clone());
            }
        }

        Ok(Box::new(LocalAcceptor {
            key,
            url: url.clone(),
            tx,
            incoming: Mutex::new(rx),
        }))
    }
}

struct LocalAcceptor {
    key: String,
    url: Url,
    tx: mpsc::UnboundedSender<LocalTransport>,
    incoming: Mutex<mpsc::UnboundedReceiver<LocalTransport>>,
}

#[async_trait::async_trait]
impl Acceptor for LocalAcceptor {
    async fn accept(&self) -> Result<Box<dyn Transport>> {
        let mut incoming = self.incoming.lock().await;
        match incoming.recv().await {
            Some(transport) => Ok(Box::new(transport)),
            None => Err(Error::ConnectionLost(format!("listener {} closed", self.key))),
        }
    }

    fn local_address(&self) -> Url {
        self.url.clone()
    }
}

impl Drop for LocalAcceptor {
    fn drop(&mut self) {
        listeners().remove_if(&self.key, |_, s| s.same_channel(&self.tx));
    }
}
