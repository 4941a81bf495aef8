//! # Protocol Errors

/// Failures while framing or parsing packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A payload field could not be encoded or decoded.
    Codec(remopack::Error),
    /// The frame header named a packet type this version does not know.
    UnknownPacketType(u16),
    /// The payload decoded but violates the packet's structure.
    ProtocolViolation(String),
    /// The length prefix exceeds the configured maximum; the stream is unusable.
    PacketTooLarge(usize),
}

impl Error {
    /// Fatal errors desynchronize the stream and must close the connection.
    /// Everything else only costs the single packet.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::PacketTooLarge(_))
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Codec(e) => write!(f, "codec error: {}", e),
            Self::UnknownPacketType(t) => write!(f, "unknown packet type {}", t),
            Self::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
            Self::PacketTooLarge(n) => write!(f, "packet of {} bytes exceeds the maximum", n),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Codec(e) => Some(e),
            _ => None,
        }
    }
}

impl From<remopack::Error> for Error {
    fn from(e: remopack::Error) -> Self {
        Self::Codec(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
