//! PolyWire Protocol Core
//!
//! Transport-agnostic session layer for exchanging short messages between two
//! devices over whichever channel happens to be available.
//!
//! This crate provides:
//! - Envelope framing with a hard 8000-byte ciphertext cap
//! - Per-type encryption policy (RSA-1024 block chunking, AES-256, SHA-1 trailer)
//! - A key store for the local identity, peer public keys and session keys
//! - The four-message handshake that bootstraps a session key
//!
//! # Failure Semantics
//!
//! - Framing, integrity and crypto failures drop the offending message
//! - A rejected handshake message leaves the handshake where it was
//! - Nothing in this crate panics on untrusted input
//! - Direct use of `unsafe` is forbidden (#![forbid(unsafe_code)])

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]

pub mod crypto;
pub mod envelope;
pub mod error;
pub mod handshake;
pub mod keystore;
pub mod message;
pub mod policy;

pub use envelope::{Envelope, MessageType, MAX_CIPHERTEXT_LENGTH};
pub use error::{ErrorKind, ProtocolError};
pub use handshake::{HandshakeRole, HandshakeSession, NextAction};
pub use keystore::{normalize_phone_number, KeyStore, SessionKey};
pub use message::{CustomMessage, Message, PublicKeyExchange};
pub use policy::{EncryptionPolicy, Protection};
