//! Encryption policy.
//!
//! The message type alone decides which transform protects a payload:
//!
//! | type | seal | open |
//! |------|------|------|
//! | 0, 8 | none | none |
//! | 1, 2, 3, 5 | recipient public key | own private key |
//! | 4 | own private key, then recipient public key | own private key, then sender public key |
//! | 6 | own private key | sender public key |
//! | 7 | session key | session key |
//!
//! Every payload carries a SHA-1 trailer before the transform is applied.
//!
//! Type 6 only proves the sender; anyone holding the sender's public key can
//! read it. Use type 7 for confidential application data.

use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::crypto;
use crate::envelope::{Envelope, MessageType};
use crate::error::ProtocolError;
use crate::keystore::KeyStore;
use crate::message::Message;

/// Transform applied to a message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    /// Integrity hash only.
    None,
    /// Encrypted to the peer's public key.
    PeerPublic,
    /// Own private key, then the peer's public key.
    SignThenEncrypt,
    /// Own private key only.
    OwnPrivate,
    /// Negotiated AES-256 session key.
    Session,
}

impl Protection {
    /// Protection used for a given message type.
    pub fn for_type(msg_type: MessageType) -> Self {
        match msg_type {
            MessageType::PublicKeyExchange | MessageType::Plain => Self::None,
            MessageType::Handshake1
            | MessageType::Handshake2
            | MessageType::Handshake3
            | MessageType::Encrypted => Self::PeerPublic,
            MessageType::Handshake4 => Self::SignThenEncrypt,
            MessageType::Signed => Self::OwnPrivate,
            MessageType::Symmetric => Self::Session,
        }
    }
}

/// Seals and opens payloads according to their message type.
#[derive(Debug, Clone)]
pub struct EncryptionPolicy {
    store: Arc<KeyStore>,
}

impl EncryptionPolicy {
    /// Bind the policy to a key store.
    pub fn new(store: Arc<KeyStore>) -> Self {
        Self { store }
    }

    /// The key store this policy reads from.
    pub fn store(&self) -> &Arc<KeyStore> {
        &self.store
    }

    /// Append the integrity trailer and apply the transform for `msg_type`.
    ///
    /// `peer` is the recipient and may be `None` only for types 0 and 8.
    pub fn seal(
        &self,
        peer: Option<Uuid>,
        msg_type: MessageType,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, ProtocolError> {
        let data = crypto::append_digest(plaintext);

        match Protection::for_type(msg_type) {
            Protection::None => Ok(data),
            Protection::PeerPublic => {
                let peer_key = self.store.peer_public_key(require_peer(peer, msg_type)?)?;
                crypto::encrypt_with_public(&peer_key, &data)
            }
            Protection::SignThenEncrypt => {
                let peer_key = self.store.peer_public_key(require_peer(peer, msg_type)?)?;
                let signed = crypto::encrypt_with_private(&self.store.own_keypair()?, &data)?;
                crypto::encrypt_with_public(&peer_key, &signed)
            }
            Protection::OwnPrivate => {
                require_peer(peer, msg_type)?;
                crypto::encrypt_with_private(&self.store.own_keypair()?, &data)
            }
            Protection::Session => {
                let peer = require_peer(peer, msg_type)?;
                let key = self
                    .store
                    .session_key(peer)
                    .ok_or(ProtocolError::KeyNotFound(peer))?;
                crypto::aes_encrypt(key.bytes(), &data)
            }
        }
    }

    /// Reverse [`EncryptionPolicy::seal`] and verify the integrity trailer.
    ///
    /// `peer` is the sender. It is needed for types 4, 6 and 7.
    pub fn open(
        &self,
        peer: Option<Uuid>,
        msg_type: MessageType,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, ProtocolError> {
        let data = match Protection::for_type(msg_type) {
            Protection::None => ciphertext.to_vec(),
            Protection::PeerPublic => {
                crypto::decrypt_with_private(&self.store.own_keypair()?, ciphertext)?
            }
            Protection::SignThenEncrypt => {
                let peer_key = self.store.peer_public_key(require_peer(peer, msg_type)?)?;
                let signed = crypto::decrypt_with_private(&self.store.own_keypair()?, ciphertext)?;
                crypto::decrypt_with_public(&peer_key, &signed)?
            }
            Protection::OwnPrivate => {
                let peer_key = self.store.peer_public_key(require_peer(peer, msg_type)?)?;
                crypto::decrypt_with_public(&peer_key, ciphertext)?
            }
            Protection::Session => {
                let peer = require_peer(peer, msg_type)?;
                let key = self
                    .store
                    .session_key(peer)
                    .ok_or(ProtocolError::KeyNotFound(peer))?;
                crypto::aes_decrypt(key.bytes(), ciphertext)?
            }
        };

        crypto::strip_digest(&data).map(<[u8]>::to_vec)
    }

    /// Seal a message and frame it for the wire.
    pub fn prepare_for_sending(
        &self,
        peer: Option<Uuid>,
        message: &Message,
        msg_type: MessageType,
    ) -> Result<Vec<u8>, ProtocolError> {
        let ciphertext = self.seal(peer, msg_type, &message.to_bytes())?;
        let envelope = Envelope::new(msg_type, ciphertext)?;
        debug!(
            kind = message.kind(),
            msg_type = %msg_type,
            length = envelope.ciphertext().len(),
            "sealed message"
        );
        Ok(envelope.to_wire())
    }

    /// Unframe, open and decode a received envelope.
    ///
    /// Any failure is logged here and returned; the message is dropped.
    pub fn extract_received(
        &self,
        peer: Option<Uuid>,
        raw: &[u8],
    ) -> Result<(MessageType, Message), ProtocolError> {
        let result = Envelope::decode(raw).and_then(|envelope| {
            let msg_type = envelope.msg_type();
            let plaintext = self.open(peer, msg_type, envelope.ciphertext())?;
            Ok((msg_type, Message::from_bytes(msg_type, &plaintext)?))
        });

        if let Err(e) = &result {
            warn!(error = %e, kind = ?e.kind(), length = raw.len(), "dropping received message");
        }
        result
    }
}

fn require_peer(peer: Option<Uuid>, msg_type: MessageType) -> Result<Uuid, ProtocolError> {
    peer.ok_or(ProtocolError::PeerRequired(msg_type.to_byte()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::tests::{other_test_key, test_key};
    use crate::message::{CustomMessage, Handshake4};
    use tempfile::TempDir;

    struct Pair {
        _dirs: (TempDir, TempDir),
        alice: EncryptionPolicy,
        bob: EncryptionPolicy,
        alice_id: Uuid,
        bob_id: Uuid,
    }

    /// Two stores that know each other's public keys and share a session key.
    fn pair() -> Pair {
        let (dir_a, dir_b) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let alice = Arc::new(KeyStore::open(dir_a.path()).unwrap());
        let bob = Arc::new(KeyStore::open(dir_b.path()).unwrap());
        alice.import_own_keypair(test_key().clone()).unwrap();
        bob.import_own_keypair(other_test_key().clone()).unwrap();
        let alice_id = alice.ensure_own_id().unwrap();
        let bob_id = bob.ensure_own_id().unwrap();

        alice.store_peer_public_key(bob_id, &bob.own_public_key().unwrap()).unwrap();
        bob.store_peer_public_key(alice_id, &alice.own_public_key().unwrap()).unwrap();
        alice.store_session_key(bob_id, [0x11; 32], 42);
        bob.store_session_key(alice_id, [0x11; 32], 42);

        Pair {
            _dirs: (dir_a, dir_b),
            alice: EncryptionPolicy::new(alice),
            bob: EncryptionPolicy::new(bob),
            alice_id,
            bob_id,
        }
    }

    fn all_types() -> Vec<MessageType> {
        (0..=8).map(|b| MessageType::from_byte(b).unwrap()).collect()
    }

    #[test]
    fn test_protection_table() {
        let expected = [
            Protection::None,
            Protection::PeerPublic,
            Protection::PeerPublic,
            Protection::PeerPublic,
            Protection::SignThenEncrypt,
            Protection::PeerPublic,
            Protection::OwnPrivate,
            Protection::Session,
            Protection::None,
        ];
        for (mt, want) in all_types().into_iter().zip(expected) {
            assert_eq!(Protection::for_type(mt), want, "type {}", mt);
        }
    }

    #[test]
    fn test_seal_open_every_type() {
        let p = pair();
        let payload = vec![0x5Au8; 250];
        for mt in all_types() {
            let sealed = p.alice.seal(Some(p.bob_id), mt, &payload).unwrap();
            let opened = p.bob.open(Some(p.alice_id), mt, &sealed).unwrap();
            assert_eq!(opened, payload, "type {}", mt);
        }
    }

    #[test]
    fn test_unencrypted_types_are_plaintext_plus_hash() {
        let p = pair();
        for mt in [MessageType::PublicKeyExchange, MessageType::Plain] {
            let sealed = p.alice.seal(None, mt, b"abc").unwrap();
            assert_eq!(&sealed[..3], b"abc");
            assert_eq!(sealed.len(), 3 + crypto::DIGEST_LENGTH);
        }
    }

    #[test]
    fn test_peer_required() {
        let p = pair();
        assert_eq!(
            p.alice.seal(None, MessageType::Symmetric, b"x"),
            Err(ProtocolError::PeerRequired(7))
        );
    }

    #[test]
    fn test_missing_session_key() {
        let p = pair();
        let stranger = Uuid::new_v4();
        assert_eq!(
            p.alice.seal(Some(stranger), MessageType::Symmetric, b"x"),
            Err(ProtocolError::KeyNotFound(stranger))
        );
        assert_eq!(
            p.alice.seal(Some(stranger), MessageType::Encrypted, b"x"),
            Err(ProtocolError::KeyNotFound(stranger))
        );
    }

    #[test]
    fn test_symmetric_hello() {
        let p = pair();
        let msg = Message::Custom(CustomMessage::text("hello"));
        let wire = p
            .alice
            .prepare_for_sending(Some(p.bob_id), &msg, MessageType::Symmetric)
            .unwrap();

        let (mt, received) = p.bob.extract_received(Some(p.alice_id), &wire).unwrap();
        assert_eq!(mt, MessageType::Symmetric);
        assert_eq!(received, msg);
    }

    #[test]
    fn test_tampered_envelopes_never_decode() {
        let p = pair();
        let msg = Message::Custom(CustomMessage::text("hello"));
        for mt in all_types() {
            let wire = p.alice.prepare_for_sending(Some(p.bob_id), &msg, mt).unwrap();
            for index in [5, wire.len() / 2, wire.len() - 1] {
                let mut tampered = wire.clone();
                tampered[index] ^= 0x01;
                assert!(
                    p.bob.extract_received(Some(p.alice_id), &tampered).is_err(),
                    "type {} byte {}",
                    mt,
                    index
                );
            }
        }
    }

    #[test]
    fn test_tampered_hash_only_is_integrity_error() {
        let p = pair();
        let msg = Message::Custom(CustomMessage::text("hello"));
        let mut wire = p.alice.prepare_for_sending(None, &msg, MessageType::Plain).unwrap();
        wire[6] ^= 0x80;
        assert_eq!(
            p.bob.extract_received(None, &wire),
            Err(ProtocolError::IntegrityCheckFailed)
        );
    }

    #[test]
    fn test_oversized_rejected_before_decrypt() {
        let p = pair();
        let mut wire = 9000u32.to_be_bytes().to_vec();
        wire.push(7);
        wire.extend(vec![0u8; 9000]);
        assert!(matches!(
            p.bob.extract_received(Some(p.alice_id), &wire),
            Err(ProtocolError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_handshake4_sign_then_encrypt() {
        let p = pair();
        let msg = Message::Handshake4(Handshake4::new(p.bob_id, p.alice_id, 7, [3u8; 32]));
        let wire = p
            .alice
            .prepare_for_sending(Some(p.bob_id), &msg, MessageType::Handshake4)
            .unwrap();
        let (_, received) = p.bob.extract_received(Some(p.alice_id), &wire).unwrap();
        assert_eq!(received, msg);

        // Bob cannot be fooled into attributing it to someone else.
        let mallory = Uuid::new_v4();
        p.bob
            .store()
            .store_peer_public_key(mallory, &p.bob.store().own_public_key().unwrap())
            .unwrap();
        assert!(p.bob.extract_received(Some(mallory), &wire).is_err());
    }

    #[test]
    fn test_public_key_exchange_without_peer() {
        let p = pair();
        let exchange = p.alice.store().own_exchange_message(None, None).unwrap();
        let wire = p
            .alice
            .prepare_for_sending(
                None,
                &Message::PublicKeyExchange(exchange.clone()),
                MessageType::PublicKeyExchange,
            )
            .unwrap();
        let (_, received) = p.bob.extract_received(None, &wire).unwrap();
        assert_eq!(received, Message::PublicKeyExchange(exchange));
    }
}
