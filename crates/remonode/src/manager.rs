//! # Connection Manager
//!
//! Everything between a transport and the Source/Replica tables: accepting and
//! dialing, the per-connection reader pump, packet dispatch, and cleanup when a
//! connection goes away.
//!
//! ## Invariants
//! - **In-order dispatch**: one pump per connection decodes and dispatches
//!   packets strictly in arrival order. Handlers never await.
//! - **Handshake first**: a server queues `Handshake` before the connection is
//!   visible to any other sender. A client drops a connection whose first
//!   packet is anything else, or carries another protocol version, and never
//!   redials it.
//! - **Soft failures**: a malformed packet is logged and dropped; only a frame
//!   length beyond the limit ends the connection.
//! - **Redial only what was asked for**: explicit addresses are retried every
//!   `retry_interval`; addresses learned from the registry are dialed once.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use remoproto::CallKind;
use remoproto::FrameReader;
use remoproto::PROTOCOL_VERSION;
use remoproto::Packet;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::trace;
use tracing::warn;
use url::Url;

use crate::connection::Connection;
use crate::connection::Role;
use crate::node::Dial;
use crate::node::Error;
use crate::node::NodeInner;
use crate::node::Result;
use crate::replica::ReplicaShared;
use crate::transport::LocalTransport;
use crate::transport::Transport;

impl NodeInner {
    pub(crate) fn parse_address(&self, address: &str) -> Result<Url> {
        let url = Url::parse(address).map_err(|e| Error::InvalidAddress(format!("{}: {}", address, e)))?;
        self.transports.backend(&url)?;
        Ok(url)
    }

    // ========================================================================
    //  Accepting
    // ========================================================================

    pub(crate) async fn listen(self: &Arc<Self>, address: &str) -> Result<Url> {
        let url = self.parse_address(address)?;
        let acceptor = self.transports.listen(&url).await?;
        let local = acceptor.local_address();
        self.host_address.write().get_or_insert_with(|| local.clone());
        info!(address = %local, "listening");

        let node = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            loop {
                match acceptor.accept().await {
                    Ok(transport) => {
                        let Some(node) = node.upgrade() else { break };
                        node.attach(transport, Role::Server, None);
                    }
                    Err(e) => {
                        warn!(error = %e, "listener stopped");
                        break;
                    }
                }
            }
        });
        self.tasks.lock().push(handle);

        // sources enabled before listening can be announced now
        self.announce_all();
        Ok(local)
    }

    /// Registers a new connection and starts its pumps.
    pub(crate) fn attach(self: &Arc<Self>, transport: Box<dyn Transport>, role: Role, address: Option<String>) -> Arc<Connection> {
        let id = self.next_connection_id();
        let (conn, rx) = Connection::new(id, role, address, transport);
        info!(connection = %id, peer = %conn.peer(), ?role, "connection established");

        if role == Role::Server {
            conn.send(&Packet::Handshake { version: PROTOCOL_VERSION.to_string() });
        }
        self.connections.insert(id, conn.clone());
        if let Some(address) = conn.address() {
            self.dials.insert(address.to_string(), Dial::Connected(id));
        }
        if role == Role::Server {
            conn.send(&Packet::ObjectList { objects: self.sources.infos() });
        }

        tokio::spawn(conn.clone().write_loop(rx));
        tokio::spawn(self.clone().pump(conn.clone()));
        if role == Role::Client {
            if let Some(period) = self.config.heartbeat_interval {
                tokio::spawn(heartbeat(conn.clone(), period));
            }
        }
        conn
    }

    /// A connection from this node to itself, so local replicas of local
    /// Sources go through the same protocol as remote ones.
    pub(crate) fn ensure_loopback(self: &Arc<Self>) {
        let mut slot = self.loopback.lock();
        if slot.as_ref().is_some_and(|c| !c.is_closed()) {
            return;
        }
        let (client_end, server_end) = LocalTransport::pair("loopback");
        self.attach(Box::new(server_end), Role::Server, None);
        let client = self.attach(Box::new(client_end), Role::Client, None);
        debug!(connection = %client.id(), "loopback attached");
        *slot = Some(client);
    }

    // ========================================================================
    //  Dialing
    // ========================================================================

    pub(crate) fn connect(self: &Arc<Self>, address: &str) -> Result<()> {
        self.parse_address(address)?;
        self.explicit.insert(address.to_string());
        self.dial(address, true, None);
        Ok(())
    }

    pub(crate) fn dial_learned(self: &Arc<Self>, address: &str) {
        if let Err(e) = self.parse_address(address) {
            warn!(address, error = %e, "registry handed out an unusable address");
            return;
        }
        self.dial(address, false, None);
    }

    pub(crate) fn disconnect(&self, address: &str) -> bool {
        let requested = self.explicit.remove(address).is_some();
        let current = self.dials.get(address).map(|d| *d.value());
        if let Some(Dial::Connected(id)) = current {
            if let Some(conn) = self.connections.get(&id).map(|c| c.value().clone()) {
                info!(address, connection = %id, "disconnecting");
                conn.close();
            }
        }
        requested
    }

    fn dial(self: &Arc<Self>, address: &str, explicit: bool, delay: Option<Duration>) {
        if self.is_shut_down() {
            return;
        }
        match self.dials.entry(address.to_string()) {
            Entry::Occupied(_) => return,
            Entry::Vacant(slot) => {
                slot.insert(Dial::Dialing);
            }
        }
        let node = self.clone();
        let address = address.to_string();
        tokio::spawn(async move { node.dial_loop(address, explicit, delay).await });
    }

    async fn dial_loop(self: Arc<Self>, address: String, explicit: bool, mut delay: Option<Duration>) {
        let url = match self.parse_address(&address) {
            Ok(url) => url,
            Err(_) => {
                self.dials.remove(&address);
                return;
            }
        };
        loop {
            if let Some(delay) = delay.take() {
                tokio::time::sleep(delay).await;
            }
            if self.is_shut_down() || (explicit && !self.explicit.contains(&address)) {
                debug!(address, "dial abandoned");
                self.dials.remove(&address);
                return;
            }
            match self.transports.connect(&url).await {
                Ok(transport) => {
                    self.attach(transport, Role::Client, Some(address));
                    return;
                }
                Err(e) if explicit => {
                    warn!(address, error = %e, retry_in = ?self.config.retry_interval, "connect failed");
                    delay = Some(self.config.retry_interval);
                }
                Err(e) => {
                    warn!(address, error = %e, "connect to registry-provided address failed");
                    self.dials.remove(&address);
                    return;
                }
            }
        }
    }

    // ========================================================================
    //  Reading
    // ========================================================================

    async fn pump(self: Arc<Self>, conn: Arc<Connection>) {
        let mut reader = FrameReader::with_max_packet_size(self.config.max_packet_size);
        'read: loop {
            let chunk = tokio::select! {
                chunk = conn.transport().recv() => chunk,
                _ = conn.closed() => break 'read,
            };
            match chunk {
                Ok(Some(bytes)) => reader.push(&bytes),
                Ok(None) => {
                    debug!(connection = %conn.id(), "peer closed the stream");
                    break;
                }
                Err(e) => {
                    warn!(connection = %conn.id(), error = %e, "read failed");
                    break;
                }
            }
            loop {
                match reader.next_packet() {
                    Ok(Some(packet)) => self.dispatch(&conn, packet),
                    Ok(None) => break,
                    Err(e) if e.is_fatal() => {
                        error!(connection = %conn.id(), error = %e, "stream cannot be resynchronized");
                        break 'read;
                    }
                    Err(e) => warn!(connection = %conn.id(), error = %e, "malformed packet dropped"),
                }
                if conn.is_closed() {
                    break 'read;
                }
            }
        }
        self.on_connection_lost(&conn);
    }

    fn dispatch(self: &Arc<Self>, conn: &Arc<Connection>, packet: Packet) {
        trace!(connection = %conn.id(), "received {:?}", packet.packet_type());
        match (conn.role(), packet) {
            (_, Packet::Ping { name }) => {
                conn.send(&Packet::Pong { name });
            }
            (_, Packet::Pong { .. }) => conn.pong_received(),
            (Role::Server, packet) => self.dispatch_server(conn, packet),
            (Role::Client, packet) => self.dispatch_client(conn, packet),
        }
    }

    fn dispatch_server(&self, conn: &Arc<Connection>, packet: Packet) {
        match packet {
            Packet::AddObject { name, needs_dynamic } => match self.sources.get(&name) {
                Some(source) => {
                    conn.subscribe(&name);
                    source.attach(conn, needs_dynamic);
                }
                None => {
                    warn!(connection = %conn.id(), name, "subscription to an object not hosted here");
                    conn.send(&Packet::RemoveObject { name });
                }
            },
            Packet::RemoveObject { name } => {
                if conn.unsubscribe(&name) {
                    if let Some(source) = self.sources.get(&name) {
                        source.detach(conn.id());
                    }
                }
            }
            Packet::Invoke { name, kind, index, args, serial, .. } => {
                let Some(source) = self.sources.get(&name).filter(|_| conn.is_subscribed(&name)) else {
                    warn!(connection = %conn.id(), name, "invoke for an object the peer is not subscribed to");
                    return;
                };
                source.handle_invoke(conn, kind, index, args, serial);
            }
            other => {
                warn!(connection = %conn.id(), "unexpected {:?} from a client, dropped", other.packet_type());
            }
        }
    }

    fn dispatch_client(self: &Arc<Self>, conn: &Arc<Connection>, packet: Packet) {
        if !conn.handshake_done() {
            match packet {
                Packet::Handshake { version } if version == PROTOCOL_VERSION => {
                    conn.mark_handshake();
                    debug!(connection = %conn.id(), version, "handshake complete");
                }
                Packet::Handshake { version } => {
                    error!(connection = %conn.id(), version, expected = PROTOCOL_VERSION, "protocol version mismatch");
                    self.fail_connection(conn);
                }
                other => {
                    error!(connection = %conn.id(), "first packet was {:?}, not a handshake", other.packet_type());
                    self.fail_connection(conn);
                }
            }
            return;
        }

        match packet {
            Packet::Handshake { .. } => warn!(connection = %conn.id(), "repeated handshake ignored"),
            Packet::ObjectList { objects } => {
                for info in objects {
                    conn.record_remote(info.clone());
                    if let Some(shared) = self.live_replica(&info.name) {
                        if !shared.is_bound() {
                            self.bind_replica(&shared, conn, &info);
                        }
                    }
                }
            }
            Packet::RemoveObject { name } => {
                conn.forget_remote(&name);
                if let Some(shared) = self.bound_replica(&name, conn) {
                    info!(connection = %conn.id(), name, "source withdrawn");
                    shared.unbind(conn.id());
                }
            }
            Packet::Init { name, values } => {
                if let Some(shared) = self.bound_replica(&name, conn) {
                    shared.on_init(values);
                }
            }
            Packet::InitDynamic { name, schema, values } => {
                if let Some(shared) = self.bound_replica(&name, conn) {
                    shared.on_init_dynamic(schema, values);
                }
            }
            Packet::PropertyChange { name, index, value } => {
                if let Some(shared) = self.bound_replica(&name, conn) {
                    shared.on_property_change(index, value);
                }
            }
            Packet::Invoke { name, kind: CallKind::Invoke, index, args, property_index, .. } => {
                if let Some(shared) = self.bound_replica(&name, conn) {
                    shared.on_event(index, args, property_index);
                }
            }
            Packet::Invoke { name, kind: CallKind::Write, .. } => {
                warn!(connection = %conn.id(), name, "property write sent to a replica, dropped");
            }
            Packet::InvokeReply { serial, value, .. } => {
                if !conn.pending().resolve(serial, value) {
                    debug!(connection = %conn.id(), serial, "reply for no pending call");
                }
            }
            other => {
                warn!(connection = %conn.id(), "unexpected {:?} from a server, dropped", other.packet_type());
            }
        }
    }

    /// The replica for `name`, if it is bound to `conn`.
    fn bound_replica(&self, name: &str, conn: &Connection) -> Option<Arc<ReplicaShared>> {
        let shared = self.live_replica(name).filter(|r| r.is_bound_to(conn.id()));
        if shared.is_none() {
            debug!(connection = %conn.id(), name, "packet for no bound replica, dropped");
        }
        shared
    }

    /// Drops a connection that must not be redialed.
    fn fail_connection(&self, conn: &Connection) {
        if let Some(address) = conn.address() {
            self.explicit.remove(address);
        }
        conn.close();
    }

    // ========================================================================
    //  Cleanup
    // ========================================================================

    fn on_connection_lost(self: &Arc<Self>, conn: &Arc<Connection>) {
        self.connections.remove(&conn.id());
        conn.close();
        let aborted = conn.pending().abort_all();
        info!(connection = %conn.id(), peer = %conn.peer(), aborted, "connection lost");

        match conn.role() {
            Role::Server => {
                for name in conn.take_subscriptions() {
                    if let Some(source) = self.sources.get(&name) {
                        source.detach(conn.id());
                    }
                }
                if let Some(host) = self.registry_host.read().clone() {
                    host.remove_owner(conn.id());
                }
            }
            Role::Client => {
                {
                    let mut loopback = self.loopback.lock();
                    if loopback.as_ref().is_some_and(|c| c.id() == conn.id()) {
                        *loopback = None;
                    }
                }
                for shared in self.live_replicas() {
                    if shared.unbind(conn.id()) {
                        self.bind_from_connections(&shared);
                    }
                }
                if let Some(address) = conn.address() {
                    self.dials.remove_if(address, |_, d| *d == Dial::Connected(conn.id()));
                    if self.explicit.contains(address) {
                        info!(address, retry_in = ?self.config.retry_interval, "scheduling reconnect");
                        self.dial(address, true, Some(self.config.retry_interval));
                    }
                }
            }
        }
    }
}

/// Client-side keepalive. A ping left unanswered for a whole period drops the
/// connection.
async fn heartbeat(conn: Arc<Connection>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if conn.ping_sent() {
                    warn!(connection = %conn.id(), "no pong since the last ping, dropping connection");
                    conn.close();
                    break;
                }
                conn.send(&Packet::Ping { name: String::new() });
            }
            _ = conn.closed() => break,
        }
    }
}
