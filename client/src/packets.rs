//! Source RCON packet framing.
//!
//! Wire layout, all integers little-endian:
//!
//! ```text
//! | size: i32 | id: i32 | type: i32 | body ... | 0x00 | 0x00 |
//! ```
//!
//! `size` counts every byte after itself, so the smallest legal packet
//! (empty body) declares 10.

use crate::rcon::RconError;

pub const SERVERDATA_AUTH: i32 = 3;
pub const SERVERDATA_AUTH_RESPONSE: i32 = 2;
pub const SERVERDATA_EXECCOMMAND: i32 = 2;
pub const SERVERDATA_RESPONSE_VALUE: i32 = 0;

/// Request id the server echoes when the password is wrong.
pub const AUTH_FAILED_ID: i32 = -1;

const SIZE_FIELD_LEN: usize = 4;
const MIN_PACKET_LEN: usize = 10;
pub const MAX_PACKET_LEN: usize = 16 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RconPacket {
    pub id: i32,
    pub kind: i32,
    pub body: String,
}

impl RconPacket {
    pub fn new(id: i32, kind: i32, body: impl Into<String>) -> Self {
        Self {
            id,
            kind,
            body: body.into(),
        }
    }

    pub fn auth(id: i32, password: &str) -> Self {
        Self::new(id, SERVERDATA_AUTH, password)
    }

    pub fn exec(id: i32, command: &str) -> Self {
        Self::new(id, SERVERDATA_EXECCOMMAND, command)
    }

    pub fn encode(&self) -> Vec<u8> {
        let body = self.body.as_bytes();
        let size = (MIN_PACKET_LEN + body.len()) as i32;

        let mut buf = Vec::with_capacity(SIZE_FIELD_LEN + MIN_PACKET_LEN + body.len());
        buf.extend_from_slice(&size.to_le_bytes());
        buf.extend_from_slice(&self.id.to_le_bytes());
        buf.extend_from_slice(&self.kind.to_le_bytes());
        buf.extend_from_slice(body);
        buf.extend_from_slice(&[0, 0]);
        buf
    }
}

/// Accumulates stream bytes and yields complete packets.
///
/// Bytes past the end of a packet stay buffered for the next call.
#[derive(Debug, Default)]
pub struct PacketDecoder {
    buffer: Vec<u8>,
}

impl PacketDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn next_packet(&mut self) -> Result<Option<RconPacket>, RconError> {
        if self.buffer.len() < SIZE_FIELD_LEN {
            return Ok(None);
        }

        let size = i32::from_le_bytes(read_word(&self.buffer, 0));
        let size = usize::try_from(size)
            .map_err(|_| RconError::Malformed(format!("negative packet size {}", size)))?;
        if size < MIN_PACKET_LEN {
            return Err(RconError::Malformed(format!("packet size {} too small", size)));
        }
        if size > MAX_PACKET_LEN {
            return Err(RconError::Malformed(format!("packet size {} too large", size)));
        }

        let total = SIZE_FIELD_LEN + size;
        if self.buffer.len() < total {
            return Ok(None);
        }

        let frame: Vec<u8> = self.buffer.drain(..total).collect();
        let id = i32::from_le_bytes(read_word(&frame, 4));
        let kind = i32::from_le_bytes(read_word(&frame, 8));
        let payload = &frame[12..];
        let body_len = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
        let body = String::from_utf8_lossy(&payload[..body_len]).into_owned();

        Ok(Some(RconPacket { id, kind, body }))
    }
}

fn read_word(bytes: &[u8], offset: usize) -> [u8; 4] {
    [
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ]
}
