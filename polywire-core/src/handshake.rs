//! Handshake state machine.
//!
//! Bootstraps an AES-256 session key between two identities whose RSA public
//! keys are already known to each other:
//!
//! ```text
//! 1. A -> B  Enc_pubB(idA, nonceA)
//! 2. B -> A  Enc_pubA(nonceA, nonceB)
//! 3. A -> B  Enc_pubB(nonceB)
//! 4. B -> A  Enc_pubA(Sign_privB(idA, idB, timestamp, key))
//! ```
//!
//! `step` runs from 1 to 5. A message is built at most once per step and
//! cached, so a failed send can be retried without drawing a new nonce. The
//! step only advances once the caller reports the send as done via
//! [`HandshakeSession::on_message_sent`], or when a received message validates.
//! A rejected message leaves the state untouched.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::envelope::MessageType;
use crate::error::ProtocolError;
use crate::keystore::KeyStore;
use crate::message::{Handshake1, Handshake2, Handshake3, Handshake4, Message};

/// Final step value.
pub const COMPLETE_STEP: u8 = 5;

/// Handshake role. A is the peer with the numerically larger id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    /// Sends messages 1 and 3.
    A,
    /// Sends messages 2 and 4, generates the session key.
    B,
}

/// What the local side has to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextAction {
    /// Build and send the next message.
    Send,
    /// Wait for the peer.
    Receive,
}

/// Handshake state between two identities.
pub struct HandshakeSession {
    id_a: Uuid,
    id_b: Uuid,
    role: HandshakeRole,
    step: u8,
    nonce_a: Option<i64>,
    nonce_b: Option<i64>,
    cached: Option<Message>,
    store: Arc<KeyStore>,
}

impl std::fmt::Debug for HandshakeSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeSession")
            .field("id_a", &self.id_a)
            .field("id_b", &self.id_b)
            .field("role", &self.role)
            .field("step", &self.step)
            .finish_non_exhaustive()
    }
}

impl HandshakeSession {
    /// Create a session with explicit ids and role.
    pub fn new(id_a: Uuid, id_b: Uuid, role: HandshakeRole, store: Arc<KeyStore>) -> Self {
        debug!(id_a = %id_a, id_b = %id_b, role = ?role, "handshake created");
        Self {
            id_a,
            id_b,
            role,
            step: 1,
            nonce_a: None,
            nonce_b: None,
            cached: None,
            store,
        }
    }

    /// Create a session from the local and remote ids, assigning roles by
    /// comparing the ids as unsigned 128-bit integers.
    pub fn for_peers(own: Uuid, remote: Uuid, store: Arc<KeyStore>) -> Self {
        if own.as_u128() > remote.as_u128() {
            Self::new(own, remote, HandshakeRole::A, store)
        } else {
            Self::new(remote, own, HandshakeRole::B, store)
        }
    }

    /// Local role.
    pub fn role(&self) -> HandshakeRole {
        self.role
    }

    /// Current step, 1..=5.
    pub fn step(&self) -> u8 {
        self.step
    }

    /// Identity of A.
    pub fn id_a(&self) -> Uuid {
        self.id_a
    }

    /// Identity of B.
    pub fn id_b(&self) -> Uuid {
        self.id_b
    }

    /// Identity of the other side.
    pub fn peer_id(&self) -> Uuid {
        match self.role {
            HandshakeRole::A => self.id_b,
            HandshakeRole::B => self.id_a,
        }
    }

    /// Whether the local side sends or receives at the current step.
    pub fn next_action(&self) -> NextAction {
        match (self.step, self.role) {
            (1, HandshakeRole::A)
            | (3, HandshakeRole::A)
            | (2, HandshakeRole::B)
            | (4, HandshakeRole::B) => NextAction::Send,
            _ => NextAction::Receive,
        }
    }

    /// Message to send at the current step, or `None` when it is the peer's
    /// turn.
    ///
    /// Calling this again before [`HandshakeSession::on_message_sent`]
    /// returns the same message.
    pub fn next_message_to_send(&mut self) -> Option<Message> {
        if self.next_action() != NextAction::Send {
            return None;
        }
        if self.cached.is_none() {
            self.cached = Some(self.build_message());
        }
        self.cached.clone()
    }

    /// Wire type for the pending outbound message: handshake message *k* goes
    /// out as type *k*.
    pub fn message_type_for_send(&self) -> Option<MessageType> {
        if self.next_action() != NextAction::Send {
            return None;
        }
        MessageType::from_byte(self.step).ok()
    }

    /// Record that the pending message left. Advances to the next step.
    ///
    /// Returns `false` if nothing was pending.
    pub fn on_message_sent(&mut self) -> bool {
        if self.next_action() != NextAction::Send || self.cached.take().is_none() {
            return false;
        }
        self.step += 1;
        debug!(step = self.step, role = ?self.role, "handshake message sent");
        if self.is_complete() {
            info!(peer = %self.peer_id(), "handshake complete");
        }
        true
    }

    /// Validate a message from the peer. Returns `false` and leaves the state
    /// unchanged if it does not fit the current step.
    pub fn process_received_message(&mut self, msg: &Message) -> bool {
        match self.try_process(msg) {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    step = self.step,
                    role = ?self.role,
                    kind = msg.kind(),
                    error = %e,
                    "handshake message rejected"
                );
                false
            }
        }
    }

    /// [`HandshakeSession::process_received_message`] with the error kept.
    pub fn try_process(&mut self, msg: &Message) -> Result<(), ProtocolError> {
        if self.next_action() != NextAction::Receive {
            return Err(ProtocolError::HandshakeValidation);
        }

        match (self.step, self.role, msg) {
            (1, HandshakeRole::B, Message::Handshake1(m)) if m.id_a == self.id_a => {
                self.nonce_a = Some(m.nonce_a);
            }
            (2, HandshakeRole::A, Message::Handshake2(m)) if Some(m.nonce_a) == self.nonce_a => {
                self.nonce_b = Some(m.nonce_b);
            }
            (3, HandshakeRole::B, Message::Handshake3(m)) if Some(m.nonce_b) == self.nonce_b => {}
            (4, HandshakeRole::A, Message::Handshake4(m))
                if m.id_a() == self.id_a && m.id_b() == self.id_b =>
            {
                self.store
                    .store_session_key(self.id_b, *m.key(), m.timestamp());
            }
            _ => return Err(ProtocolError::HandshakeValidation),
        }

        self.step += 1;
        debug!(step = self.step, role = ?self.role, "handshake message accepted");
        if self.is_complete() {
            info!(peer = %self.peer_id(), "handshake complete");
        }
        Ok(())
    }

    /// True once all four messages went through.
    pub fn is_complete(&self) -> bool {
        self.step == COMPLETE_STEP
    }

    fn build_message(&mut self) -> Message {
        match self.step {
            1 => {
                let nonce_a = random_nonce();
                self.nonce_a = Some(nonce_a);
                Message::Handshake1(Handshake1 {
                    nonce_a,
                    id_a: self.id_a,
                })
            }
            2 => {
                let nonce_b = random_nonce();
                self.nonce_b = Some(nonce_b);
                Message::Handshake2(Handshake2 {
                    nonce_a: self.nonce_a.unwrap_or_default(),
                    nonce_b,
                })
            }
            3 => Message::Handshake3(Handshake3 {
                nonce_b: self.nonce_b.unwrap_or_default(),
            }),
            _ => {
                let key = self.store.generate_session_key();
                let timestamp = now_millis();
                self.store.store_session_key(self.id_a, *key, timestamp);
                Message::Handshake4(Handshake4::new(self.id_a, self.id_b, timestamp, *key))
            }
        }
    }
}

fn random_nonce() -> i64 {
    OsRng.next_u64() as i64
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::tests::{other_test_key, test_key};
    use crate::policy::EncryptionPolicy;
    use tempfile::TempDir;

    struct Peer {
        _dir: TempDir,
        id: Uuid,
        store: Arc<KeyStore>,
    }

    fn peer(key: &rsa::RsaPrivateKey) -> Peer {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(KeyStore::open(dir.path()).unwrap());
        store.import_own_keypair(key.clone()).unwrap();
        let id = store.ensure_own_id().unwrap();
        Peer { _dir: dir, id, store }
    }

    fn introduce(a: &Peer, b: &Peer) {
        a.store
            .store_peer_public_key(b.id, &b.store.own_public_key().unwrap())
            .unwrap();
        b.store
            .store_peer_public_key(a.id, &a.store.own_public_key().unwrap())
            .unwrap();
    }

    fn sessions(x: &Peer, y: &Peer) -> (HandshakeSession, HandshakeSession) {
        let sx = HandshakeSession::for_peers(x.id, y.id, x.store.clone());
        let sy = HandshakeSession::for_peers(y.id, x.id, y.store.clone());
        if sx.role() == HandshakeRole::A {
            (sx, sy)
        } else {
            (sy, sx)
        }
    }

    /// Move one message across the wire through the encryption policy.
    fn relay(
        from: &mut HandshakeSession,
        from_policy: &EncryptionPolicy,
        to: &mut HandshakeSession,
        to_policy: &EncryptionPolicy,
    ) -> bool {
        let msg = from.next_message_to_send().unwrap();
        let mt = from.message_type_for_send().unwrap();
        let wire = from_policy
            .prepare_for_sending(Some(from.peer_id()), &msg, mt)
            .unwrap();
        assert!(from.on_message_sent());

        let (received_type, received) = to_policy
            .extract_received(Some(to.peer_id()), &wire)
            .unwrap();
        assert_eq!(received_type, mt);
        to.process_received_message(&received)
    }

    #[test]
    fn test_role_assignment() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(KeyStore::open(dir.path()).unwrap());
        let high = Uuid::from_u128(u128::MAX);
        let low = Uuid::from_u128(1);

        let a = HandshakeSession::for_peers(high, low, store.clone());
        assert_eq!(a.role(), HandshakeRole::A);
        assert_eq!((a.id_a(), a.id_b()), (high, low));

        let b = HandshakeSession::for_peers(low, high, store);
        assert_eq!(b.role(), HandshakeRole::B);
        assert_eq!((b.id_a(), b.id_b()), (high, low));
        assert_eq!(b.peer_id(), high);
    }

    #[test]
    fn test_next_action_table() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(KeyStore::open(dir.path()).unwrap());
        let mut a = HandshakeSession::new(Uuid::nil(), Uuid::nil(), HandshakeRole::A, store.clone());
        let mut b = HandshakeSession::new(Uuid::nil(), Uuid::nil(), HandshakeRole::B, store);
        let expected_a = [NextAction::Send, NextAction::Receive, NextAction::Send, NextAction::Receive];
        let expected_b = [NextAction::Receive, NextAction::Send, NextAction::Receive, NextAction::Send];
        for step in 1..=4u8 {
            a.step = step;
            b.step = step;
            assert_eq!(a.next_action(), expected_a[step as usize - 1]);
            assert_eq!(b.next_action(), expected_b[step as usize - 1]);
        }
        a.step = COMPLETE_STEP;
        assert_eq!(a.next_action(), NextAction::Receive);
        assert!(a.next_message_to_send().is_none());
    }

    #[test]
    fn test_full_handshake() {
        let (x, y) = (peer(test_key()), peer(other_test_key()));
        introduce(&x, &y);
        let (mut a, mut b) = sessions(&x, &y);
        let (pa, pb) = if a.peer_id() == y.id {
            (EncryptionPolicy::new(x.store.clone()), EncryptionPolicy::new(y.store.clone()))
        } else {
            (EncryptionPolicy::new(y.store.clone()), EncryptionPolicy::new(x.store.clone()))
        };

        assert!(relay(&mut a, &pa, &mut b, &pb));
        assert!(relay(&mut b, &pb, &mut a, &pa));
        assert!(relay(&mut a, &pa, &mut b, &pb));
        assert!(!a.is_complete());
        assert!(relay(&mut b, &pb, &mut a, &pa));

        assert!(a.is_complete());
        assert!(b.is_complete());

        let key_at_a = pa.store().session_key(a.peer_id()).unwrap();
        let key_at_b = pb.store().session_key(b.peer_id()).unwrap();
        assert_eq!(key_at_a.bytes(), key_at_b.bytes());
        assert_eq!(key_at_a.created_at(), key_at_b.created_at());
    }

    #[test]
    fn test_wire_types_follow_message_number() {
        let (x, y) = (peer(test_key()), peer(other_test_key()));
        let (mut a, mut b) = sessions(&x, &y);

        assert_eq!(a.message_type_for_send(), Some(MessageType::Handshake1));
        assert_eq!(b.message_type_for_send(), None);

        let m1 = a.next_message_to_send().unwrap();
        a.on_message_sent();
        assert!(b.process_received_message(&m1));
        assert_eq!(b.message_type_for_send(), Some(MessageType::Handshake2));
    }

    #[test]
    fn test_idempotent_resend() {
        let (x, y) = (peer(test_key()), peer(other_test_key()));
        let (mut a, _) = sessions(&x, &y);

        let first = a.next_message_to_send().unwrap();
        let second = a.next_message_to_send().unwrap();
        assert_eq!(first.to_bytes(), second.to_bytes());
        assert_eq!(a.step(), 1);
    }

    #[test]
    fn test_key_message_built_once() {
        let (x, y) = (peer(test_key()), peer(other_test_key()));
        let (mut a, mut b) = sessions(&x, &y);

        let m1 = a.next_message_to_send().unwrap();
        a.on_message_sent();
        assert!(b.process_received_message(&m1));
        let m2 = b.next_message_to_send().unwrap();
        b.on_message_sent();
        assert!(a.process_received_message(&m2));
        let m3 = a.next_message_to_send().unwrap();
        a.on_message_sent();
        assert!(b.process_received_message(&m3));

        assert_eq!(b.step(), 4);
        let first = b.next_message_to_send().unwrap();
        let stored = b.store.session_key(b.peer_id()).unwrap();
        let second = b.next_message_to_send().unwrap();
        assert_eq!(first.to_bytes(), second.to_bytes());
        assert_eq!(b.store.session_key(b.peer_id()).unwrap(), stored);
    }

    #[test]
    fn test_stale_nonce_rejected() {
        let (x, y) = (peer(test_key()), peer(other_test_key()));
        let (mut a, mut b) = sessions(&x, &y);

        let m1 = a.next_message_to_send().unwrap();
        a.on_message_sent();
        assert!(b.process_received_message(&m1));

        let Some(Message::Handshake2(m2)) = b.next_message_to_send() else {
            panic!("expected message 2");
        };
        let replayed = Message::Handshake2(Handshake2 {
            nonce_a: m2.nonce_a.wrapping_add(1),
            nonce_b: m2.nonce_b,
        });

        assert!(!a.process_received_message(&replayed));
        assert_eq!(a.step(), 2);
        assert!(a.process_received_message(&Message::Handshake2(m2)));
        assert_eq!(a.step(), 3);
    }

    #[test]
    fn test_wrong_identity_rejected() {
        let (x, y) = (peer(test_key()), peer(other_test_key()));
        let (a, mut b) = sessions(&x, &y);

        let forged = Message::Handshake1(Handshake1 {
            nonce_a: 1,
            id_a: Uuid::new_v4(),
        });
        assert!(!b.process_received_message(&forged));
        assert_eq!(b.step(), 1);

        let genuine = Message::Handshake1(Handshake1 { nonce_a: 1, id_a: a.id_a() });
        assert!(b.process_received_message(&genuine));
    }

    #[test]
    fn test_wrong_variant_and_turn_rejected() {
        let (x, y) = (peer(test_key()), peer(other_test_key()));
        let (mut a, mut b) = sessions(&x, &y);

        assert!(!b.process_received_message(&Message::Handshake3(Handshake3 { nonce_b: 0 })));
        assert_eq!(
            a.try_process(&Message::Handshake1(Handshake1 { nonce_a: 0, id_a: a.id_a() })),
            Err(ProtocolError::HandshakeValidation)
        );
        assert!(!a.on_message_sent());
    }

    #[test]
    fn test_forged_key_message_rejected() {
        let (x, y) = (peer(test_key()), peer(other_test_key()));
        let (mut a, _) = sessions(&x, &y);
        a.step = 4;

        let forged = Message::Handshake4(Handshake4::new(a.id_a(), Uuid::new_v4(), 1, [0u8; 32]));
        assert!(!a.process_received_message(&forged));
        assert_eq!(a.step(), 4);
        assert!(a.store.session_key(a.id_b()).is_none());
    }
}
