//! Protocol errors.
//!
//! Framing, integrity and crypto failures drop the affected message only.
//! Nothing here is fatal to the process or to the channel that carried the bytes.

use thiserror::Error;
use uuid::Uuid;

/// Taxonomy bucket a [`ProtocolError`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or oversized envelope.
    Framing,
    /// Hash mismatch after decryption.
    Integrity,
    /// Missing key or cipher failure.
    Crypto,
    /// Wrong type, id or nonce for the current handshake step.
    HandshakeValidation,
    /// Durable key store could not be read or written.
    Storage,
}

/// All errors produced by the core crate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Declared or actual ciphertext length exceeds the envelope cap.
    #[error("payload too large: {length} bytes (max {max})")]
    PayloadTooLarge {
        /// Offending length.
        length: usize,
        /// Configured cap.
        max: usize,
    },

    /// Envelope shorter than its header or length prefix disagrees with the body.
    #[error("malformed envelope")]
    MalformedEnvelope,

    /// Type byte outside 0..=8.
    #[error("unknown message type: {0}")]
    UnknownMessageType(u8),

    /// SHA-1 trailer did not match the recovered plaintext.
    #[error("integrity check failed")]
    IntegrityCheckFailed,

    /// No key on record for the given peer.
    #[error("no key for peer {0}")]
    KeyNotFound(Uuid),

    /// A peer id is required for this message type but none was given.
    #[error("message type {0} requires a peer id")]
    PeerRequired(u8),

    /// The local keypair has not been generated or loaded.
    #[error("own keypair missing")]
    OwnKeypairMissing,

    /// Cipher engine failure.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Decrypted payload does not parse as the message its type announces.
    #[error("malformed message payload")]
    MalformedPayload,

    /// Handshake message rejected at the current step.
    #[error("handshake validation failed")]
    HandshakeValidation,

    /// Key store I/O or (de)serialization failure.
    #[error("storage error: {0}")]
    Storage(String),
}

impl ProtocolError {
    /// Map to the coarse error category.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PayloadTooLarge { .. }
            | Self::MalformedEnvelope
            | Self::UnknownMessageType(_)
            | Self::MalformedPayload => ErrorKind::Framing,
            Self::IntegrityCheckFailed => ErrorKind::Integrity,
            Self::KeyNotFound(_)
            | Self::PeerRequired(_)
            | Self::OwnKeypairMissing
            | Self::Crypto(_) => ErrorKind::Crypto,
            Self::HandshakeValidation => ErrorKind::HandshakeValidation,
            Self::Storage(_) => ErrorKind::Storage,
        }
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(e: std::io::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<rsa::Error> for ProtocolError {
    fn from(e: rsa::Error) -> Self {
        Self::Crypto(e.to_string())
    }
}
