//! Key store.
//!
//! Owns the local RSA identity, caches peers' public keys and the AES session
//! keys negotiated by the handshake.
//!
//! Layout of the store directory:
//!
//! ```text
//! identity.json      own id, partner id, own keypair (hex components)
//! peers.json         peer -> key file, phone <-> peer, peer -> radio address
//! <random>.key       one peer public key (hex modulus and exponent)
//! ```
//!
//! Session keys live in memory only and vanish with the store.
//!
//! The store is an explicit context object: construct it once with
//! [`KeyStore::open`] and share it (`Arc<KeyStore>`) with every component that
//! needs keys. All state sits behind mutexes so channel tasks may encrypt and
//! decrypt concurrently.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::{BigUint, RsaPrivateKey, RsaPublicKey};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::crypto::{self, SessionKeyBytes, AES_KEY_LENGTH};
use crate::error::ProtocolError;
use crate::message::{BluetoothAddress, PublicKeyExchange};

const IDENTITY_FILE: &str = "identity.json";
const PEER_INDEX_FILE: &str = "peers.json";
const KEY_FILE_EXTENSION: &str = "key";

/// An AES-256 session key and the time it was created.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey {
    key: SessionKeyBytes,
    created_at: i64,
}

impl SessionKey {
    /// Wrap raw key bytes.
    pub fn new(key: [u8; AES_KEY_LENGTH], created_at: i64) -> Self {
        Self {
            key: SessionKeyBytes::new(key),
            created_at,
        }
    }

    /// Raw key bytes.
    pub fn bytes(&self) -> &[u8; AES_KEY_LENGTH] {
        &self.key
    }

    /// Creation time, milliseconds since the Unix epoch.
    pub fn created_at(&self) -> i64 {
        self.created_at
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKey")
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IdentityRecord {
    own_id: Option<Uuid>,
    partner_id: Option<Uuid>,
    keypair: Option<StoredPrivateKey>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredPrivateKey {
    modulus: String,
    public_exponent: String,
    private_exponent: String,
    primes: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredPublicKey {
    modulus: String,
    exponent: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PeerIndex {
    public_keys: HashMap<Uuid, String>,
    phone_to_peer: HashMap<String, Uuid>,
    peer_to_phone: HashMap<Uuid, String>,
    bluetooth: HashMap<Uuid, String>,
}

struct Durable {
    identity: IdentityRecord,
    peers: PeerIndex,
    own_key: Option<RsaPrivateKey>,
    public_keys: HashMap<Uuid, RsaPublicKey>,
}

/// Process-wide key store. See the module docs.
pub struct KeyStore {
    dir: PathBuf,
    durable: Mutex<Durable>,
    session_keys: Mutex<HashMap<Uuid, SessionKey>>,
}

impl std::fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyStore").field("dir", &self.dir).finish()
    }
}

impl KeyStore {
    /// Open (or create) a store rooted at `dir`.
    ///
    /// Reads the identity record and peer index if present. The own keypair
    /// is not generated here; call [`KeyStore::ensure_own_keypair`].
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, ProtocolError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let identity = read_json(&dir.join(IDENTITY_FILE))?.unwrap_or_default();
        let peers = read_json(&dir.join(PEER_INDEX_FILE))?.unwrap_or_default();
        debug!(dir = %dir.display(), "opened key store");

        Ok(Self {
            dir,
            durable: Mutex::new(Durable {
                identity,
                peers,
                own_key: None,
                public_keys: HashMap::new(),
            }),
            session_keys: Mutex::new(HashMap::new()),
        })
    }

    /// Directory backing this store.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load the own keypair, generating and persisting one if absent.
    pub fn ensure_own_keypair(&self) -> Result<(), ProtocolError> {
        let mut durable = self.durable.lock();
        if durable.own_key.is_some() {
            return Ok(());
        }

        if let Some(stored) = durable.identity.keypair.as_ref() {
            let key = stored.to_key()?;
            durable.own_key = Some(key);
            return Ok(());
        }

        let key = crypto::generate_keypair()?;
        durable.identity.keypair = Some(StoredPrivateKey::from_key(&key));
        write_json(&self.dir.join(IDENTITY_FILE), &durable.identity)?;
        durable.own_key = Some(key);
        info!("generated new identity keypair");
        Ok(())
    }

    /// Replace the own keypair with an existing one and persist it.
    pub fn import_own_keypair(&self, key: RsaPrivateKey) -> Result<(), ProtocolError> {
        let mut durable = self.durable.lock();
        durable.identity.keypair = Some(StoredPrivateKey::from_key(&key));
        write_json(&self.dir.join(IDENTITY_FILE), &durable.identity)?;
        durable.own_key = Some(key);
        info!("imported identity keypair");
        Ok(())
    }

    /// The own keypair.
    ///
    /// # Errors
    ///
    /// `OwnKeypairMissing` until [`KeyStore::ensure_own_keypair`] succeeded.
    pub fn own_keypair(&self) -> Result<RsaPrivateKey, ProtocolError> {
        self.durable
            .lock()
            .own_key
            .clone()
            .ok_or(ProtocolError::OwnKeypairMissing)
    }

    /// The own public key.
    pub fn own_public_key(&self) -> Result<RsaPublicKey, ProtocolError> {
        Ok(self.own_keypair()?.to_public_key())
    }

    /// Return the own id, generating and persisting a v4 UUID on first use.
    pub fn ensure_own_id(&self) -> Result<Uuid, ProtocolError> {
        let mut durable = self.durable.lock();
        if let Some(id) = durable.identity.own_id {
            return Ok(id);
        }
        let id = Uuid::new_v4();
        durable.identity.own_id = Some(id);
        write_json(&self.dir.join(IDENTITY_FILE), &durable.identity)?;
        info!(own_id = %id, "generated new own id");
        Ok(id)
    }

    /// The own id, if generated.
    pub fn own_id(&self) -> Option<Uuid> {
        self.durable.lock().identity.own_id
    }

    /// Remember who the current conversation is with.
    pub fn set_partner_id(&self, peer: Uuid) -> Result<(), ProtocolError> {
        let mut durable = self.durable.lock();
        durable.identity.partner_id = Some(peer);
        write_json(&self.dir.join(IDENTITY_FILE), &durable.identity)
    }

    /// Current communication partner, if any.
    pub fn partner_id(&self) -> Option<Uuid> {
        self.durable.lock().identity.partner_id
    }

    /// Persist a peer's public key under a fresh random filename.
    pub fn store_peer_public_key(&self, peer: Uuid, key: &RsaPublicKey) -> Result<(), ProtocolError> {
        let file_name = format!("{}.{}", Uuid::new_v4(), KEY_FILE_EXTENSION);
        write_json(&self.dir.join(&file_name), &StoredPublicKey::from_key(key))?;

        let mut durable = self.durable.lock();
        let previous = durable.peers.public_keys.insert(peer, file_name);
        write_json(&self.dir.join(PEER_INDEX_FILE), &durable.peers)?;
        durable.public_keys.insert(peer, key.clone());
        drop(durable);

        if let Some(old) = previous {
            if let Err(e) = fs::remove_file(self.dir.join(&old)) {
                warn!(file = %old, error = %e, "could not remove replaced key file");
            }
        }
        debug!(peer = %peer, "stored peer public key");
        Ok(())
    }

    /// Look up a peer's public key.
    ///
    /// Falls back to the own public key when `peer` is the own id, which lets
    /// a single device talk to itself.
    pub fn peer_public_key(&self, peer: Uuid) -> Result<RsaPublicKey, ProtocolError> {
        let mut durable = self.durable.lock();
        if let Some(key) = durable.public_keys.get(&peer) {
            return Ok(key.clone());
        }

        if let Some(file_name) = durable.peers.public_keys.get(&peer).cloned() {
            let stored: Option<StoredPublicKey> = read_json(&self.dir.join(&file_name))?;
            if let Some(stored) = stored {
                let key = stored.to_key()?;
                durable.public_keys.insert(peer, key.clone());
                return Ok(key);
            }
            warn!(peer = %peer, file = %file_name, "indexed key file is missing");
        }

        if durable.identity.own_id == Some(peer) {
            if let Some(own) = &durable.own_key {
                warn!(peer = %peer, "using own public key for self-addressed message");
                return Ok(own.to_public_key());
            }
        }

        Err(ProtocolError::KeyNotFound(peer))
    }

    /// Cache a session key for `peer`. In memory only.
    pub fn store_session_key(&self, peer: Uuid, key: [u8; AES_KEY_LENGTH], created_at: i64) {
        self.session_keys
            .lock()
            .insert(peer, SessionKey::new(key, created_at));
        debug!(peer = %peer, created_at, "stored session key");
    }

    /// Session key negotiated with `peer`, if any.
    pub fn session_key(&self, peer: Uuid) -> Option<SessionKey> {
        self.session_keys.lock().get(&peer).cloned()
    }

    /// Generate a random AES-256 key.
    pub fn generate_session_key(&self) -> SessionKeyBytes {
        crypto::generate_session_key()
    }

    /// Map a phone number to a peer, in both directions.
    ///
    /// The number is normalized first (see [`normalize_phone_number`]).
    pub fn store_phone_number(&self, phone: &str, peer: Uuid) -> Result<(), ProtocolError> {
        let normalized = normalize_phone_number(phone);
        debug!(peer = %peer, "stored phone number mapping");

        let mut durable = self.durable.lock();
        durable.peers.phone_to_peer.insert(normalized.clone(), peer);
        durable.peers.peer_to_phone.insert(peer, normalized);
        write_json(&self.dir.join(PEER_INDEX_FILE), &durable.peers)
    }

    /// Peer registered for a phone number.
    pub fn peer_for_phone(&self, phone: &str) -> Option<Uuid> {
        let normalized = normalize_phone_number(phone);
        self.durable.lock().peers.phone_to_peer.get(&normalized).copied()
    }

    /// Normalized phone number registered for a peer.
    pub fn phone_for_peer(&self, peer: Uuid) -> Option<String> {
        self.durable.lock().peers.peer_to_phone.get(&peer).cloned()
    }

    /// Remember a peer's radio hardware address.
    pub fn store_bluetooth_address(
        &self,
        peer: Uuid,
        address: BluetoothAddress,
    ) -> Result<(), ProtocolError> {
        let mut durable = self.durable.lock();
        durable.peers.bluetooth.insert(peer, hex::encode(address));
        write_json(&self.dir.join(PEER_INDEX_FILE), &durable.peers)
    }

    /// Radio hardware address recorded for a peer.
    pub fn bluetooth_address(&self, peer: Uuid) -> Option<BluetoothAddress> {
        let durable = self.durable.lock();
        let encoded = durable.peers.bluetooth.get(&peer)?;
        let bytes = hex::decode(encoded).ok()?;
        bytes.try_into().ok()
    }

    /// Build the announcement for the own identity.
    pub fn own_exchange_message(
        &self,
        phone: Option<&str>,
        bluetooth: Option<BluetoothAddress>,
    ) -> Result<PublicKeyExchange, ProtocolError> {
        let own_id = self.ensure_own_id()?;
        PublicKeyExchange::new(
            own_id,
            phone.and_then(phone_to_wire),
            bluetooth,
            self.own_public_key()?,
        )
    }

    /// Record everything a peer's announcement carries and make the peer the
    /// current communication partner.
    pub fn import_peer_exchange(&self, msg: &PublicKeyExchange) -> Result<(), ProtocolError> {
        let peer = msg.owner();
        self.store_peer_public_key(peer, msg.public_key())?;
        if let Some(number) = msg.telephone() {
            self.store_phone_number(&phone_from_wire(number), peer)?;
        }
        if let Some(address) = msg.bluetooth() {
            self.store_bluetooth_address(peer, address)?;
        }
        self.set_partner_id(peer)?;
        info!(peer = %peer, "imported peer identity");
        Ok(())
    }
}

/// Canonical form of a phone number.
///
/// Strips spaces, parentheses, slashes and dashes, rewrites `+` as `00`,
/// assumes the German country code for national numbers and drops the trunk
/// zero after it (`00490...` becomes `0049...`).
pub fn normalize_phone_number(phone: &str) -> String {
    let mut number: String = phone
        .chars()
        .filter(|c| !matches!(c, ' ' | '(' | ')' | '/' | '-'))
        .collect();

    if number.contains('+') {
        number = number.replace('+', "00");
    }

    if !number.starts_with("00") && number.starts_with('0') {
        number.replace_range(..1, "0049");
    }

    if number.starts_with("00490") {
        number.replace_range(..5, "0049");
    }
    number
}

/// Digits of a normalized number as carried in a key announcement.
pub fn phone_to_wire(phone: &str) -> Option<u64> {
    normalize_phone_number(phone).parse().ok().filter(|&n| n != 0)
}

/// Inverse of [`phone_to_wire`]: restore the international `00` prefix.
pub fn phone_from_wire(number: u64) -> String {
    normalize_phone_number(&format!("+{number}"))
}

impl StoredPrivateKey {
    fn from_key(key: &RsaPrivateKey) -> Self {
        Self {
            modulus: hex::encode(key.n().to_bytes_be()),
            public_exponent: hex::encode(key.e().to_bytes_be()),
            private_exponent: hex::encode(key.d().to_bytes_be()),
            primes: key.primes().iter().map(|p| hex::encode(p.to_bytes_be())).collect(),
        }
    }

    fn to_key(&self) -> Result<RsaPrivateKey, ProtocolError> {
        let primes = self
            .primes
            .iter()
            .map(|p| parse_biguint(p))
            .collect::<Result<Vec<_>, _>>()?;
        let key = RsaPrivateKey::from_components(
            parse_biguint(&self.modulus)?,
            parse_biguint(&self.public_exponent)?,
            parse_biguint(&self.private_exponent)?,
            primes,
        )?;
        key.validate()?;
        Ok(key)
    }
}

impl StoredPublicKey {
    fn from_key(key: &RsaPublicKey) -> Self {
        Self {
            modulus: hex::encode(key.n().to_bytes_be()),
            exponent: hex::encode(key.e().to_bytes_be()),
        }
    }

    fn to_key(&self) -> Result<RsaPublicKey, ProtocolError> {
        Ok(RsaPublicKey::new(
            parse_biguint(&self.modulus)?,
            parse_biguint(&self.exponent)?,
        )?)
    }
}

fn parse_biguint(encoded: &str) -> Result<BigUint, ProtocolError> {
    hex::decode(encoded)
        .map(|bytes| BigUint::from_bytes_be(&bytes))
        .map_err(|e| ProtocolError::Storage(e.to_string()))
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, ProtocolError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ProtocolError> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::tests::{other_test_key, test_key};
    use tempfile::TempDir;

    #[test]
    fn test_normalize_phone_number() {
        assert_eq!(normalize_phone_number("0171 123456"), "0049171123456");
        assert_eq!(normalize_phone_number("+49 (0)171/123-456"), "0049171123456");
        assert_eq!(normalize_phone_number("+49171123456"), "0049171123456");
        assert_eq!(normalize_phone_number("0049171123456"), "0049171123456");
        assert_eq!(normalize_phone_number("00490171123456"), "0049171123456");
        assert_eq!(normalize_phone_number("+1 555 0100"), "0015550100");
        assert_eq!(normalize_phone_number("123"), "123");
    }

    #[test]
    fn test_phone_wire_roundtrip() {
        let wire = phone_to_wire("0171 123456").unwrap();
        assert_eq!(wire, 49_171_123_456);
        assert_eq!(phone_from_wire(wire), "0049171123456");
        assert_eq!(phone_to_wire("n/a"), None);
    }

    #[test]
    fn test_own_keypair_persists() {
        let dir = TempDir::new().unwrap();

        let first = {
            let store = KeyStore::open(dir.path()).unwrap();
            assert!(matches!(
                store.own_keypair(),
                Err(ProtocolError::OwnKeypairMissing)
            ));
            store.ensure_own_keypair().unwrap();
            store.own_public_key().unwrap()
        };

        let store = KeyStore::open(dir.path()).unwrap();
        store.ensure_own_keypair().unwrap();
        assert_eq!(store.own_public_key().unwrap(), first);
    }

    #[test]
    fn test_own_id_persists() {
        let dir = TempDir::new().unwrap();
        let id = KeyStore::open(dir.path()).unwrap().ensure_own_id().unwrap();

        let store = KeyStore::open(dir.path()).unwrap();
        assert_eq!(store.own_id(), Some(id));
        assert_eq!(store.ensure_own_id().unwrap(), id);
    }

    #[test]
    fn test_peer_public_keys_coexist() {
        let dir = TempDir::new().unwrap();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        {
            let store = KeyStore::open(dir.path()).unwrap();
            store.store_peer_public_key(alice, &test_key().to_public_key()).unwrap();
            store.store_peer_public_key(bob, &other_test_key().to_public_key()).unwrap();
        }

        let store = KeyStore::open(dir.path()).unwrap();
        assert_eq!(store.peer_public_key(alice).unwrap(), test_key().to_public_key());
        assert_eq!(store.peer_public_key(bob).unwrap(), other_test_key().to_public_key());

        let stranger = Uuid::new_v4();
        assert_eq!(
            store.peer_public_key(stranger),
            Err(ProtocolError::KeyNotFound(stranger))
        );
    }

    #[test]
    fn test_replacing_peer_key_removes_old_file() {
        let dir = TempDir::new().unwrap();
        let store = KeyStore::open(dir.path()).unwrap();
        let peer = Uuid::new_v4();

        store.store_peer_public_key(peer, &test_key().to_public_key()).unwrap();
        store.store_peer_public_key(peer, &other_test_key().to_public_key()).unwrap();

        let key_files = fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| {
                e.as_ref().unwrap().path().extension().and_then(|x| x.to_str()) == Some("key")
            })
            .count();
        assert_eq!(key_files, 1);
        assert_eq!(store.peer_public_key(peer).unwrap(), other_test_key().to_public_key());
    }

    #[test]
    fn test_self_addressed_fallback() {
        let dir = TempDir::new().unwrap();
        let store = KeyStore::open(dir.path()).unwrap();
        store.ensure_own_keypair().unwrap();
        let own = store.ensure_own_id().unwrap();
        assert_eq!(store.peer_public_key(own).unwrap(), store.own_public_key().unwrap());
    }

    #[test]
    fn test_session_keys_are_memory_only() {
        let dir = TempDir::new().unwrap();
        let peer = Uuid::new_v4();
        {
            let store = KeyStore::open(dir.path()).unwrap();
            store.store_session_key(peer, [5u8; 32], 1234);
            let key = store.session_key(peer).unwrap();
            assert_eq!(key.bytes(), &[5u8; 32]);
            assert_eq!(key.created_at(), 1234);
        }
        let store = KeyStore::open(dir.path()).unwrap();
        assert!(store.session_key(peer).is_none());
    }

    #[test]
    fn test_concurrent_session_key_access() {
        let dir = TempDir::new().unwrap();
        let store = std::sync::Arc::new(KeyStore::open(dir.path()).unwrap());

        let handles: Vec<_> = (0..8u8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let peer = Uuid::from_u128(i as u128);
                    for n in 0..100 {
                        store.store_session_key(peer, [i; 32], n);
                        assert_eq!(store.session_key(peer).unwrap().bytes(), &[i; 32]);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.session_key(Uuid::from_u128(3)).unwrap().created_at(), 99);
    }

    #[test]
    fn test_import_peer_exchange() {
        let dir = TempDir::new().unwrap();
        let store = KeyStore::open(dir.path()).unwrap();
        let peer = Uuid::new_v4();
        let msg = PublicKeyExchange::new(
            peer,
            phone_to_wire("0171 123456"),
            Some([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]),
            test_key().to_public_key(),
        )
        .unwrap();

        store.import_peer_exchange(&msg).unwrap();

        assert_eq!(store.partner_id(), Some(peer));
        assert_eq!(store.peer_public_key(peer).unwrap(), test_key().to_public_key());
        assert_eq!(store.peer_for_phone("+49 171 123456"), Some(peer));
        assert_eq!(store.phone_for_peer(peer).as_deref(), Some("0049171123456"));
        assert_eq!(
            store.bluetooth_address(peer),
            Some([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF])
        );
    }
}
