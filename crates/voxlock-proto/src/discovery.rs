//! IP discovery packet.
//!
//! A fixed 74-byte exchange with the voice server: the client sends the
//! packet with the address and port zeroed, the server echoes it back with
//! our externally visible address and port filled in. All integer fields
//! are network byte order.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, byteorder::big_endian};

use crate::errors::ProtocolError;

/// Total packet size on the wire.
pub const DISCOVERY_PACKET_BYTES: usize = 74;

/// Request/response type for a discovery request.
const DISCOVERY_TYPE_REQUEST: u16 = 0x0001;

/// Response type filled in by the server.
const DISCOVERY_TYPE_RESPONSE: u16 = 0x0002;

/// Length field value: the packet minus the type and length fields.
const DISCOVERY_LENGTH: u16 = 70;

/// The 74-byte discovery packet.
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct DiscoveryPacket {
    kind: big_endian::U16,
    length: big_endian::U16,
    ssrc: big_endian::U32,
    address: [u8; 64],
    port: big_endian::U16,
}

impl DiscoveryPacket {
    /// Build a request for the given SSRC with zeroed address and port.
    pub fn request(ssrc: u32) -> Self {
        Self {
            kind: big_endian::U16::new(DISCOVERY_TYPE_REQUEST),
            length: big_endian::U16::new(DISCOVERY_LENGTH),
            ssrc: big_endian::U32::new(ssrc),
            address: [0; 64],
            port: big_endian::U16::new(0),
        }
    }

    /// Serialized wire bytes.
    pub fn as_bytes(&self) -> &[u8] {
        IntoBytes::as_bytes(self)
    }

    /// Parse a server reply and extract the discovered address and port.
    ///
    /// The address field is NUL-terminated ASCII.
    pub fn parse_reply(reply: &[u8]) -> Result<(String, u16), ProtocolError> {
        let packet = Self::ref_from_bytes(reply).map_err(|_| ProtocolError::FrameTruncated {
            needed: DISCOVERY_PACKET_BYTES,
            available: reply.len(),
        })?;

        let kind = packet.kind.get();
        if kind != DISCOVERY_TYPE_REQUEST && kind != DISCOVERY_TYPE_RESPONSE {
            return Err(ProtocolError::InvalidPayload(format!(
                "unexpected discovery type {kind:#06x}"
            )));
        }

        let terminator = packet.address.iter().position(|&b| b == 0).unwrap_or(64);
        let address = std::str::from_utf8(&packet.address[..terminator])
            .map_err(|_| ProtocolError::InvalidPayload("non-utf8 discovery address".into()))?
            .to_owned();

        Ok((address, packet.port.get()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_layout() {
        let packet = DiscoveryPacket::request(0xDEAD_BEEF);
        let bytes = packet.as_bytes();

        assert_eq!(bytes.len(), DISCOVERY_PACKET_BYTES);
        assert_eq!(&bytes[0..2], &[0x00, 0x01]);
        assert_eq!(&bytes[2..4], &[0x00, 70]);
        assert_eq!(&bytes[4..8], &0xDEAD_BEEFu32.to_be_bytes());
        assert!(bytes[8..72].iter().all(|&b| b == 0));
        assert_eq!(&bytes[72..74], &[0, 0]);
    }

    #[test]
    fn reply_parses_address_and_port() {
        let mut bytes = DiscoveryPacket::request(0xDEAD_BEEF).as_bytes().to_vec();
        bytes[8..8 + 11].copy_from_slice(b"203.0.113.5");
        bytes[72..74].copy_from_slice(&50000u16.to_be_bytes());

        let (address, port) = DiscoveryPacket::parse_reply(&bytes).unwrap();
        assert_eq!(address, "203.0.113.5");
        assert_eq!(port, 50000);
    }

    #[test]
    fn short_reply_rejected() {
        assert!(DiscoveryPacket::parse_reply(&[0u8; 10]).is_err());
    }
}
