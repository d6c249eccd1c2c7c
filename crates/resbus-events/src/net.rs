//! Wire envelope for events that cross the network
//!
//! Layout, little-endian:
//!
//! ```text
//! +----------------+---------------+-----------------+-----------------+
//! | source_net_id  | name_len      | name            | payload         |
//! | u16            | u16           | name_len bytes  | rest of buffer  |
//! +----------------+---------------+-----------------+-----------------+
//! ```
//!
//! Older senders include a trailing NUL in `name` (and count it in `name_len`); it is
//! stripped on decode.

use byteorder::{ByteOrder, LittleEndian};

use crate::{Event, PeerId};

const HEADER_LEN: usize = 4;

/// Default upper bound on a single envelope
pub const DEFAULT_MAX_ENVELOPE_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetError {
    #[error("envelope is {0} bytes, shorter than its header")]
    TooShort(usize),
    #[error("envelope name length {name_len} exceeds the {available} bytes available")]
    NameOverrun { name_len: usize, available: usize },
    #[error("event name is empty")]
    EmptyName,
    #[error("event name is not valid UTF-8")]
    InvalidName,
    #[error("event name is {0} bytes, more than a u16 length prefix allows")]
    NameTooLong(usize),
    #[error("envelope is {size} bytes, limit is {max}")]
    Oversized { size: usize, max: usize },
}

/// Where an outbound event should go
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetTarget {
    Server,
    Peer(PeerId),
    Broadcast,
}

/// Transport that carries outbound envelopes
///
/// Implemented by whatever owns the sockets. `send` is called on the tick thread and
/// should hand the bytes off rather than block.
pub trait NetSink: Send + Sync {
    fn send(&self, target: NetTarget, envelope: NetEnvelope);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetEnvelope {
    pub source: PeerId,
    pub name: String,
    pub payload: Vec<u8>,
}

impl NetEnvelope {
    pub fn new(source: PeerId, name: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            source,
            name: name.into(),
            payload,
        }
    }

    /// Check the name fits the envelope header
    pub fn validate(&self) -> Result<u16, NetError> {
        let len = self.name.len();
        if len == 0 {
            return Err(NetError::EmptyName);
        }
        u16::try_from(len).map_err(|_| NetError::NameTooLong(len))
    }

    pub fn encode(&self) -> Result<Vec<u8>, NetError> {
        let name_len = self.validate()?;
        let name = self.name.as_bytes();

        let mut buf = vec![0u8; HEADER_LEN + name.len() + self.payload.len()];
        LittleEndian::write_u16(&mut buf[0..2], self.source.0);
        LittleEndian::write_u16(&mut buf[2..4], name_len);
        buf[HEADER_LEN..HEADER_LEN + name.len()].copy_from_slice(name);
        buf[HEADER_LEN + name.len()..].copy_from_slice(&self.payload);

        Ok(buf)
    }

    /// Decode an envelope, rejecting anything larger than `max_size`
    pub fn decode(bytes: &[u8], max_size: usize) -> Result<Self, NetError> {
        if bytes.len() > max_size {
            return Err(NetError::Oversized {
                size: bytes.len(),
                max: max_size,
            });
        }
        if bytes.len() < HEADER_LEN {
            return Err(NetError::TooShort(bytes.len()));
        }

        let source = PeerId(LittleEndian::read_u16(&bytes[0..2]));
        let name_len = LittleEndian::read_u16(&bytes[2..4]) as usize;

        let rest = &bytes[HEADER_LEN..];
        if name_len > rest.len() {
            return Err(NetError::NameOverrun {
                name_len,
                available: rest.len(),
            });
        }

        let (mut name, payload) = rest.split_at(name_len);
        if name.last() == Some(&0) {
            name = &name[..name.len() - 1];
        }
        if name.is_empty() {
            return Err(NetError::EmptyName);
        }
        let name = std::str::from_utf8(name).map_err(|_| NetError::InvalidName)?;

        Ok(Self {
            source,
            name: name.to_string(),
            payload: payload.to_vec(),
        })
    }

    /// Turn a received envelope into an event sourced from the sending peer
    pub fn into_event(self) -> Event {
        Event::new(self.name, self.payload).with_source(self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let env = NetEnvelope::new(PeerId(0x0102), "hi", vec![0x90]);
        let bytes = env.encode().unwrap();
        assert_eq!(bytes, vec![0x02, 0x01, 0x02, 0x00, b'h', b'i', 0x90]);
        assert_eq!(NetEnvelope::decode(&bytes, 64).unwrap(), env);
    }

    #[test]
    fn test_trailing_nul_stripped() {
        let bytes = [0x05, 0x00, 0x04, 0x00, b'c', b'h', b't', 0x00, 0x91, 0x01];
        let env = NetEnvelope::decode(&bytes, 64).unwrap();

        assert_eq!(env.name, "cht");
        assert_eq!(env.payload, vec![0x91, 0x01]);

        let event = env.into_event();
        assert_eq!(event.source, Some(PeerId(5)));
        assert_eq!(event.name, "cht");
    }

    #[test]
    fn test_malformed_input() {
        assert_eq!(NetEnvelope::decode(&[1, 0, 0], 64), Err(NetError::TooShort(3)));
        assert_eq!(
            NetEnvelope::decode(&[1, 0, 9, 0, b'a'], 64),
            Err(NetError::NameOverrun {
                name_len: 9,
                available: 1
            })
        );
        assert_eq!(NetEnvelope::decode(&[1, 0, 0, 0], 64), Err(NetError::EmptyName));
        assert_eq!(NetEnvelope::decode(&[1, 0, 1, 0, 0], 64), Err(NetError::EmptyName));
        assert_eq!(
            NetEnvelope::decode(&[1, 0, 1, 0, 0xff], 64),
            Err(NetError::InvalidName)
        );
        assert_eq!(
            NetEnvelope::decode(&[0u8; 16], 8),
            Err(NetError::Oversized { size: 16, max: 8 })
        );
    }

    #[test]
    fn test_encode_rejects_bad_names() {
        assert_eq!(
            NetEnvelope::new(PeerId(1), "", vec![]).encode(),
            Err(NetError::EmptyName)
        );
        let long = "x".repeat(70_000);
        assert_eq!(
            NetEnvelope::new(PeerId(1), long, vec![]).encode(),
            Err(NetError::NameTooLong(70_000))
        );
    }
}
