//! # Transport Abstraction
//!
//! A minimal, async interface for moving bytes between nodes.
//!
//! ## Philosophy
//!
//! - **Byte-Oriented**: A transport knows nothing about packets or objects. It
//!   moves opaque chunks; framing happens one layer up.
//! - **Stream Semantics**: Chunk boundaries carry no meaning. One `recv` may hold
//!   half a packet or three of them.
//! - **Pluggable by Scheme**: Backends are looked up by URL scheme
//!   (`tcp://`, `local://`) in a `TransportRegistry` owned by each node.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use url::Url;

pub mod local;
pub mod tcp;

pub use local::LocalBackend;
pub use local::LocalTransport;
pub use tcp::TcpBackend;

/// Errors that occur at the network/transport layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The peer is unreachable or the connection was dropped.
    ConnectionLost(String),
    /// No listener is bound at the requested address.
    Unreachable(String),
    /// The address is already bound by another listener.
    AddressInUse(String),
    /// The URL cannot be used by the backend it was routed to.
    InvalidAddress(String),
    /// No backend is registered for the URL scheme.
    UnknownScheme(String),
    /// Generic I/O error or internal transport failure.
    Io(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            Self::Unreachable(addr) => write!(f, "Nothing listening at {}", addr),
            Self::AddressInUse(addr) => write!(f, "Address already in use: {}", addr),
            Self::InvalidAddress(addr) => write!(f, "Invalid address: {}", addr),
            Self::UnknownScheme(scheme) => write!(f, "No transport for scheme '{}'", scheme),
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::ConnectionRefused => Self::Unreachable(e.to_string()),
            ErrorKind::AddrInUse => Self::AddressInUse(e.to_string()),
            ErrorKind::ConnectionReset | ErrorKind::BrokenPipe | ErrorKind::UnexpectedEof => {
                Self::ConnectionLost(e.to_string())
            }
            _ => Self::Io(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// One established, bidirectional byte stream.
///
/// This trait is designed to be object-safe (`Arc<dyn Transport>`).
///
/// # Invariants
/// - `recv` returns `Ok(None)` once the peer has closed its side.
/// - `recv` and `send` are each called from a single task; implementations may
///   serialize internally but must not deadlock when both run concurrently.
/// - `recv` must be cancel-safe: dropping the future loses no bytes.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Writes all of `bytes` to the stream.
    async fn send(&self, bytes: &[u8]) -> Result<()>;

    /// Waits for the next chunk of bytes.
    async fn recv(&self) -> Result<Option<Vec<u8>>>;

    /// Closes our side of the stream. The peer observes end-of-stream.
    async fn close(&self);

    /// Human-readable description of the remote end, for logs.
    fn peer(&self) -> String;
}

/// A bound listener producing server-side transports.
#[async_trait::async_trait]
pub trait Acceptor: Send + Sync + 'static {
    async fn accept(&self) -> Result<Box<dyn Transport>>;

    /// The address peers should dial. For `tcp://host:0` this carries the port
    /// the OS actually assigned.
    fn local_address(&self) -> Url;
}

/// A transport family, selected by URL scheme.
#[async_trait::async_trait]
pub trait Backend: Send + Sync + 'static {
    async fn connect(&self, url: &Url) -> Result<Box<dyn Transport>>;
    async fn listen(&self, url: &Url) -> Result<Box<dyn Acceptor>>;
}

/// Scheme to backend mapping, owned by a node.
pub struct TransportRegistry {
    backends: DashMap<String, Arc<dyn Backend>>,
}

impl Default for TransportRegistry {
    fn default() -> Self {
        let registry = Self::empty();
        registry.register("tcp", Arc::new(TcpBackend));
        registry.register("local", Arc::new(LocalBackend));
        registry
    }
}

impl TransportRegistry {
    /// A registry with the `tcp` and `local` backends.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn empty() -> Self {
        Self { backends: DashMap::new() }
    }

    /// Adds or replaces the backend for `scheme`.
    pub fn register(&self, scheme: &str, backend: Arc<dyn Backend>) {
        self.backends.insert(scheme.to_ascii_lowercase(), backend);
    }

    pub fn backend(&self, url: &Url) -> Result<Arc<dyn Backend>> {
        self.backends
            .get(url.scheme())
            .map(|b| b.value().clone())
            .ok_or_else(|| Error::UnknownScheme(url.scheme().to_string()))
    }

    pub async fn connect(&self, url: &Url) -> Result<Box<dyn Transport>> {
        self.backend(url)?.connect(url).await
    }

    pub async fn listen(&self, url: &Url) -> Result<Box<dyn Acceptor>> {
        self.backend(url)?.listen(url).await
    }
}
