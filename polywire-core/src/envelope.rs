//! Wire envelope and bounds checking.
//!
//! Wire format:
//! ```text
//! +-----------------+-----------+----------------------+
//! | LENGTH (4B BE)  | TYPE (1B) | CIPHERTEXT (LENGTH)  |
//! +-----------------+-----------+----------------------+
//! ```
//!
//! `LENGTH` counts the ciphertext only, so a valid envelope always satisfies
//! `LENGTH == envelope.len() - 5`.

use crate::error::ProtocolError;

/// Maximum ciphertext length accepted on the wire.
pub const MAX_CIPHERTEXT_LENGTH: usize = 8000;

/// Length prefix size.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Length prefix plus type byte.
pub const HEADER_SIZE: usize = LENGTH_PREFIX_SIZE + 1;

/// Message type discriminator.
///
/// The type selects both the cryptographic transform applied to the payload
/// and, for 0..=4, the message variant it decodes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum MessageType {
    /// Public key exchange. Integrity hash only.
    PublicKeyExchange = 0,
    /// Handshake message 1 (A to B).
    Handshake1 = 1,
    /// Handshake message 2 (B to A).
    Handshake2 = 2,
    /// Handshake message 3 (A to B).
    Handshake3 = 3,
    /// Handshake message 4 (B to A), signed then encrypted.
    Handshake4 = 4,
    /// General message encrypted with the recipient's public key.
    Encrypted = 5,
    /// General message transformed with the sender's private key only.
    Signed = 6,
    /// General message under the negotiated session key.
    Symmetric = 7,
    /// General message without any encryption.
    Plain = 8,
}

impl MessageType {
    /// Parse message type from byte.
    pub fn from_byte(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            0 => Ok(Self::PublicKeyExchange),
            1 => Ok(Self::Handshake1),
            2 => Ok(Self::Handshake2),
            3 => Ok(Self::Handshake3),
            4 => Ok(Self::Handshake4),
            5 => Ok(Self::Encrypted),
            6 => Ok(Self::Signed),
            7 => Ok(Self::Symmetric),
            8 => Ok(Self::Plain),
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }

    /// Convert to byte.
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// True for the two types that travel without any cipher applied.
    pub fn is_unencrypted(self) -> bool {
        matches!(self, Self::PublicKeyExchange | Self::Plain)
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_byte())
    }
}

/// A validated envelope.
///
/// Immutable after construction. Bounds are checked in [`Envelope::new`] and
/// [`Envelope::decode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    msg_type: MessageType,
    ciphertext: Vec<u8>,
}

impl Envelope {
    /// Build an envelope around already-transformed bytes.
    ///
    /// # Errors
    ///
    /// Returns `PayloadTooLarge` if the ciphertext exceeds
    /// [`MAX_CIPHERTEXT_LENGTH`].
    pub fn new(msg_type: MessageType, ciphertext: Vec<u8>) -> Result<Self, ProtocolError> {
        check_length(ciphertext.len())?;
        Ok(Self {
            msg_type,
            ciphertext,
        })
    }

    /// Parse a complete envelope (length prefix included).
    ///
    /// # Errors
    ///
    /// - `MalformedEnvelope` if shorter than the header or the declared length
    ///   does not equal `raw.len() - 5`
    /// - `PayloadTooLarge` if the declared length exceeds the cap
    /// - `UnknownMessageType` for type bytes above 8
    pub fn decode(raw: &[u8]) -> Result<Self, ProtocolError> {
        if raw.len() < HEADER_SIZE {
            return Err(ProtocolError::MalformedEnvelope);
        }

        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        prefix.copy_from_slice(&raw[..LENGTH_PREFIX_SIZE]);
        let declared = Self::read_length(&prefix)?;

        let msg_type = MessageType::from_byte(raw[LENGTH_PREFIX_SIZE])?;

        if declared != raw.len() - HEADER_SIZE {
            return Err(ProtocolError::MalformedEnvelope);
        }

        Ok(Self {
            msg_type,
            ciphertext: raw[HEADER_SIZE..].to_vec(),
        })
    }

    /// Read the length prefix.
    ///
    /// Returns the ciphertext length (type byte excluded).
    ///
    /// # Errors
    ///
    /// Returns `PayloadTooLarge` if the length exceeds [`MAX_CIPHERTEXT_LENGTH`].
    pub fn read_length(bytes: &[u8; LENGTH_PREFIX_SIZE]) -> Result<usize, ProtocolError> {
        let length = u32::from_be_bytes(*bytes) as usize;
        check_length(length)?;
        Ok(length)
    }

    /// Get the message type.
    pub fn msg_type(&self) -> MessageType {
        self.msg_type
    }

    /// Get the ciphertext.
    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    /// Consume the envelope and take the ciphertext.
    pub fn into_ciphertext(self) -> Vec<u8> {
        self.ciphertext
    }

    /// Serialize to wire format.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut wire = Vec::with_capacity(HEADER_SIZE + self.ciphertext.len());

        // Cast is safe: length was validated against MAX_CIPHERTEXT_LENGTH
        #[allow(clippy::cast_possible_truncation)]
        let len_bytes = (self.ciphertext.len() as u32).to_be_bytes();
        wire.extend_from_slice(&len_bytes);
        wire.push(self.msg_type.to_byte());
        wire.extend_from_slice(&self.ciphertext);

        wire
    }
}

fn check_length(length: usize) -> Result<(), ProtocolError> {
    if length > MAX_CIPHERTEXT_LENGTH {
        return Err(ProtocolError::PayloadTooLarge {
            length,
            max: MAX_CIPHERTEXT_LENGTH,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_roundtrip() {
        for byte in 0..=8u8 {
            let mt = MessageType::from_byte(byte).unwrap();
            assert_eq!(mt.to_byte(), byte);
        }
    }

    #[test]
    fn test_unknown_message_type() {
        assert_eq!(
            MessageType::from_byte(9),
            Err(ProtocolError::UnknownMessageType(9))
        );
        assert_eq!(
            MessageType::from_byte(0xFF),
            Err(ProtocolError::UnknownMessageType(0xFF))
        );
    }

    #[test]
    fn test_envelope_layout() {
        let env = Envelope::new(MessageType::Symmetric, vec![0xAA, 0xBB, 0xCC]).unwrap();
        let wire = env.to_wire();
        assert_eq!(wire, vec![0, 0, 0, 3, 7, 0xAA, 0xBB, 0xCC]);
        assert_eq!(wire.len() - HEADER_SIZE, 3);
    }

    #[test]
    fn test_envelope_roundtrip_all_types() {
        for byte in 0..=8u8 {
            let mt = MessageType::from_byte(byte).unwrap();
            let payload: Vec<u8> = (0..=byte).collect();
            let wire = Envelope::new(mt, payload.clone()).unwrap().to_wire();
            let parsed = Envelope::decode(&wire).unwrap();
            assert_eq!(parsed.msg_type(), mt);
            assert_eq!(parsed.ciphertext(), payload.as_slice());
        }
    }

    #[test]
    fn test_envelope_at_cap() {
        let wire = Envelope::new(MessageType::Plain, vec![1u8; MAX_CIPHERTEXT_LENGTH])
            .unwrap()
            .to_wire();
        let parsed = Envelope::decode(&wire).unwrap();
        assert_eq!(parsed.ciphertext().len(), MAX_CIPHERTEXT_LENGTH);
    }

    #[test]
    fn test_envelope_too_large() {
        assert!(matches!(
            Envelope::new(MessageType::Plain, vec![0u8; MAX_CIPHERTEXT_LENGTH + 1]),
            Err(ProtocolError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_decode_oversized_declaration() {
        let mut wire = 8001u32.to_be_bytes().to_vec();
        wire.push(7);
        wire.extend_from_slice(&[0u8; 16]);
        assert_eq!(
            Envelope::decode(&wire),
            Err(ProtocolError::PayloadTooLarge {
                length: 8001,
                max: MAX_CIPHERTEXT_LENGTH
            })
        );
    }

    #[test]
    fn test_decode_too_short() {
        assert_eq!(Envelope::decode(&[]), Err(ProtocolError::MalformedEnvelope));
        assert_eq!(
            Envelope::decode(&[0, 0, 0, 0]),
            Err(ProtocolError::MalformedEnvelope)
        );
    }

    #[test]
    fn test_decode_length_mismatch() {
        let mut wire = Envelope::new(MessageType::Plain, vec![1, 2, 3]).unwrap().to_wire();
        wire.push(4);
        assert_eq!(Envelope::decode(&wire), Err(ProtocolError::MalformedEnvelope));
    }

    #[test]
    fn test_decode_unknown_type() {
        let wire = vec![0, 0, 0, 1, 9, 0];
        assert_eq!(
            Envelope::decode(&wire),
            Err(ProtocolError::UnknownMessageType(9))
        );
    }

    #[test]
    fn test_read_length() {
        assert_eq!(Envelope::read_length(&[0, 0, 0x1F, 0x40]), Ok(8000));
        assert!(Envelope::read_length(&[0, 0, 0x1F, 0x41]).is_err());
        assert!(Envelope::read_length(&[0xFF, 0xFF, 0xFF, 0xFF]).is_err());
    }
}
