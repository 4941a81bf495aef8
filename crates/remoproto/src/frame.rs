//! # Framing
//!
//! Turns packets into length-prefixed frames and reassembles frames from a
//! byte stream that has no message boundaries of its own.
//!
//! ```text
//! [u32 LE: len][u16 LE: type][payload: len - 2]
//! ```

use remopack::Encoder;

use crate::MAX_PACKET_SIZE;
use crate::error::Error;
use crate::error::Result;
use crate::packet::Packet;

/// Bytes occupied by the length prefix.
pub const HEADER_LEN: usize = 4;

impl Packet {
    /// Encodes this packet as one complete frame.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut enc = Encoder::new();
        self.encode_payload(&mut enc)?;
        let payload = enc.into_bytes()?;

        let len = payload.len() + 2;
        if len > MAX_PACKET_SIZE {
            return Err(Error::PacketTooLarge(len));
        }

        let mut frame = Vec::with_capacity(HEADER_LEN + len);
        frame.extend_from_slice(&(len as u32).to_le_bytes());
        frame.extend_from_slice(&(self.packet_type() as u16).to_le_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }
}

/// Resumable frame reassembly.
///
/// Feed every chunk read from the transport to `push`, then call `next_packet`
/// until it returns `Ok(None)`. A single read may hold several frames or only
/// part of one.
#[derive(Debug)]
pub struct FrameReader {
    buf: Vec<u8>,
    max_packet_size: usize,
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameReader {
    pub fn new() -> Self {
        Self::with_max_packet_size(MAX_PACKET_SIZE)
    }

    pub fn with_max_packet_size(max_packet_size: usize) -> Self {
        Self { buf: Vec::new(), max_packet_size }
    }

    /// Appends bytes received from the stream.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of buffered bytes not yet consumed as frames.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Takes the next complete packet off the buffer.
    ///
    /// - `Ok(Some(packet))`: one packet decoded and consumed.
    /// - `Ok(None)`: the buffer holds less than one full frame.
    /// - `Err(e)` with `!e.is_fatal()`: one malformed frame was consumed; keep draining.
    /// - `Err(e)` with `e.is_fatal()`: the stream cannot be resynchronized.
    pub fn next_packet(&mut self) -> Result<Option<Packet>> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut prefix = [0u8; HEADER_LEN];
        prefix.copy_from_slice(&self.buf[..HEADER_LEN]);
        let len = u32::from_le_bytes(prefix) as usize;

        if len > self.max_packet_size {
            return Err(Error::PacketTooLarge(len));
        }
        if self.buf.len() < HEADER_LEN + len {
            return Ok(None);
        }

        let frame: Vec<u8> = self.buf.drain(..HEADER_LEN + len).skip(HEADER_LEN).collect();
        if frame.len() < 2 {
            return Err(Error::ProtocolViolation("frame too short for a packet type".into()));
        }

        let ty = u16::from_le_bytes([frame[0], frame[1]]);
        Packet::decode_payload(ty, &frame[2..]).map(Some)
    }
}
