//! # Connections
//!
//! One established transport plus the per-connection bookkeeping the node needs:
//! outbound queue, pending calls, and which objects flow over it.
//!
//! A node plays one of two roles on each connection. On a **server** connection
//! it hosts Sources and the peer subscribes to them. On a **client** connection
//! it holds Replicas bound to Sources on the peer.
//!
//! Outbound packets go through an unbounded queue drained by a dedicated writer
//! task, so packet handlers never wait on the network.

use std::collections::HashMap;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use parking_lot::Mutex;
use remoproto::ObjectInfo;
use remoproto::Packet;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tracing::debug;
use tracing::warn;

use crate::pending::PendingCalls;
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// We dialed; the peer hosts Sources our Replicas bind to.
    Client,
    /// The peer dialed; it subscribes to our Sources.
    Server,
}

pub struct Connection {
    id: ConnectionId,
    role: Role,
    address: Option<String>,
    peer: String,
    transport: Arc<dyn Transport>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    closed: watch::Sender<bool>,
    pending: PendingCalls,
    handshake_done: AtomicBool,
    awaiting_pong: AtomicBool,
    /// Server role: objects the peer subscribed to.
    subscriptions: Mutex<HashSet<String>>,
    /// Client role: objects the peer hosts.
    remote_objects: Mutex<HashMap<String, ObjectInfo>>,
}

impl Connection {
    /// Wraps a transport. The returned receiver feeds `write_loop`.
    pub(crate) fn new(
        id: ConnectionId,
        role: Role,
        address: Option<String>,
        transport: Box<dyn Transport>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let transport: Arc<dyn Transport> = Arc::from(transport);
        let (outbound, rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        let conn = Arc::new(Self {
            id,
            role,
            address,
            peer: transport.peer(),
            transport,
            outbound,
            closed,
            pending: PendingCalls::new(),
            handshake_done: AtomicBool::new(false),
            awaiting_pong: AtomicBool::new(false),
            subscriptions: Mutex::new(HashSet::new()),
            remote_objects: Mutex::new(HashMap::new()),
        });
        (conn, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// The address we dialed, for client connections opened by address.
    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub(crate) fn pending(&self) -> &PendingCalls {
        &self.pending
    }

    // ========================================================================
    //  Lifecycle
    // ========================================================================

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once `close` has been called.
    pub(crate) async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Stops both pumps. Already-queued packets are still flushed.
    pub fn close(&self) {
        self.closed.send_if_modified(|closed| {
            let was_open = !*closed;
            *closed = true;
            was_open
        });
    }

    pub(crate) fn mark_handshake(&self) -> bool {
        !self.handshake_done.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn handshake_done(&self) -> bool {
        self.handshake_done.load(Ordering::Acquire)
    }

    /// Records that a ping is outstanding. Returns true if the previous one
    /// never got its pong.
    pub(crate) fn ping_sent(&self) -> bool {
        self.awaiting_pong.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn pong_received(&self) {
        self.awaiting_pong.store(false, Ordering::Release);
    }

    // ========================================================================
    //  Outbound
    // ========================================================================

    /// Queues a packet. Returns false if the connection is gone or the packet
    /// cannot be encoded.
    pub(crate) fn send(&self, packet: &Packet) -> bool {
        match packet.encode() {
            Ok(frame) => self.send_frame(frame),
            Err(e) => {
                warn!(connection = %self.id, error = %e, "dropping unencodable {:?}", packet.packet_type());
                false
            }
        }
    }

    pub(crate) fn send_frame(&self, frame: Vec<u8>) -> bool {
        !self.is_closed() && self.outbound.send(frame).is_ok()
    }

    /// Drains the outbound queue into the transport until the connection closes.
    pub(crate) async fn write_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
        let mut closed = self.closed.subscribe();
        loop {
            tokio::select! {
                biased;
                frame = rx.recv() => {
                    let Some(frame) = frame else { break };
                    if let Err(e) = self.transport.send(&frame).await {
                        debug!(connection = %self.id, error = %e, "write failed");
                        break;
                    }
                }
                _ = async { let _ = closed.wait_for(|c| *c).await; } => {
                    while let Ok(frame) = rx.try_recv() {
                        if self.transport.send(&frame).await.is_err() {
                            break;
                        }
                    }
                    break;
                }
            }
        }
        self.close();
        self.transport.close().await;
    }

    // ========================================================================
    //  Object bookkeeping
    // ========================================================================

    pub(crate) fn subscribe(&self, name: &str) -> bool {
        self.subscriptions.lock().insert(name.to_string())
    }

    pub(crate) fn unsubscribe(&self, name: &str) -> bool {
        self.subscriptions.lock().remove(name)
    }

    pub(crate) fn is_subscribed(&self, name: &str) -> bool {
        self.subscriptions.lock().contains(name)
    }

    pub(crate) fn take_subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().drain().collect()
    }

    pub(crate) fn record_remote(&self, info: ObjectInfo) {
        self.remote_objects.lock().insert(info.name.clone(), info);
    }

    pub(crate) fn forget_remote(&self, name: &str) {
        self.remote_objects.lock().remove(name);
    }

    pub(crate) fn remote_object(&self, name: &str) -> Option<ObjectInfo> {
        self.remote_objects.lock().get(name).cloned()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("address", &self.address)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}
