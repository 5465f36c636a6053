//! Bit-exact wire encode/decode for the two fixed-layout records chirp
//! puts on the wire: the handshake and the message header. All
//! integers are big-endian (network byte order). The in-memory
//! `Message`/`Remote` layout is never the wire layout — translation
//! always goes through this module.

use crate::error::*;
use crate::identity::Identity;
use crate::message::TypeBits;

/// Size in bytes of a serialized handshake.
pub const HANDSHAKE_LEN: usize = 18;

/// Size in bytes of a serialized message header (not counting the
/// variable-length header/data that follows it).
pub const MESSAGE_HEADER_LEN: usize = 35;

/// The handshake both sides send first, binding a node identity to the
/// transport endpoint and announcing the node's public listen port.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Handshake {
    /// The public port this node listens on. May differ from the
    /// ephemeral source port of an outgoing connection.
    pub port: u16,
    pub identity: Identity,
}

impl Handshake {
    pub fn encode(&self, buf: &mut [u8; HANDSHAKE_LEN]) {
        buf[0..2].copy_from_slice(&self.port.to_be_bytes());
        buf[2..18].copy_from_slice(self.identity.as_bytes());
    }

    /// Decodes a handshake from exactly `HANDSHAKE_LEN` bytes.
    ///
    /// A handshake shorter than 18 bytes is a protocol violation;
    /// callers are responsible for only invoking this once
    /// `HANDSHAKE_LEN` bytes have actually been accumulated.
    pub fn decode(buf: &[u8; HANDSHAKE_LEN]) -> Self {
        let port = u16::from_be_bytes([buf[0], buf[1]]);
        let mut id = [0u8; 16];
        id.copy_from_slice(&buf[2..18]);
        Handshake { port, identity: Identity::from_bytes(id) }
    }
}

/// The 35-byte header that precedes every message's header/data bytes
/// on the wire.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct WireHeader {
    pub identity: Identity,
    pub serial: u32,
    pub type_bits: TypeBits,
    pub header_len: u16,
    pub data_len: u32,
}

impl WireHeader {
    pub fn encode(&self, buf: &mut [u8; MESSAGE_HEADER_LEN]) {
        buf[0..16].copy_from_slice(self.identity.as_bytes());
        buf[16..20].copy_from_slice(&self.serial.to_be_bytes());
        buf[20] = self.type_bits.bits();
        buf[21..23].copy_from_slice(&self.header_len.to_be_bytes());
        buf[23..27].copy_from_slice(&self.data_len.to_be_bytes());
        // bytes 27..35 reserved, kept zeroed for forward compatibility
        buf[27..35].fill(0);
    }

    /// Decodes a message header from exactly `MESSAGE_HEADER_LEN` bytes.
    ///
    /// This does not itself enforce the verification rules
    /// (`header_len + data_len <= MAX_MSG_SIZE`, ACK/NOOP framing); the
    /// reader state machine applies those after decoding.
    pub fn decode(buf: &[u8; MESSAGE_HEADER_LEN]) -> Result<Self> {
        let mut id = [0u8; 16];
        id.copy_from_slice(&buf[0..16]);
        let serial = u32::from_be_bytes([buf[16], buf[17], buf[18], buf[19]]);
        let type_bits = TypeBits::from_bits(buf[20])
            .simple_msg(ErrorKind::ProtocolError, "unknown type bits in message header")?;
        let header_len = u16::from_be_bytes([buf[21], buf[22]]);
        let data_len = u32::from_be_bytes([buf[23], buf[24], buf[25], buf[26]]);
        Ok(WireHeader {
            identity: Identity::from_bytes(id),
            serial,
            type_bits,
            header_len,
            data_len,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_round_trips() {
        let hs = Handshake { port: 2998, identity: Identity::from_bytes([7; 16]) };
        let mut buf = [0u8; HANDSHAKE_LEN];
        hs.encode(&mut buf);
        assert_eq!(Handshake::decode(&buf), hs);
    }

    #[test]
    fn message_header_round_trips() {
        let hdr = WireHeader {
            identity: Identity::from_bytes([9; 16]),
            serial: 0xdead_beef,
            type_bits: TypeBits::REQ_ACK,
            header_len: 12,
            data_len: 300,
        };
        let mut buf = [0u8; MESSAGE_HEADER_LEN];
        hdr.encode(&mut buf);
        assert_eq!(WireHeader::decode(&buf).unwrap(), hdr);
    }

    #[test]
    fn message_header_is_exactly_35_bytes_on_wire() {
        assert_eq!(MESSAGE_HEADER_LEN, 35);
        assert_eq!(HANDSHAKE_LEN, 18);
    }

    #[test]
    fn unknown_type_bits_are_rejected() {
        let mut buf = [0u8; MESSAGE_HEADER_LEN];
        buf[20] = 0b1111_1111;
        assert_eq!(
            WireHeader::decode(&buf).unwrap_err().kind(),
            ErrorKind::ProtocolError
        );
    }
}
