//! Protocol messages.
//!
//! A [`Message`] is a closed set of variants. Each variant serializes to a flat
//! big-endian payload; the wire type chosen at send time decides how that
//! payload is decoded on the other side:
//!
//! | type | variant |
//! |------|---------|
//! | 0 | `PublicKeyExchange` |
//! | 1..=4 | `Handshake1` .. `Handshake4` |
//! | 5..=8 | `Custom` |
//!
//! UUIDs travel as 16 bytes, most significant half first.

use rsa::RsaPublicKey;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::crypto::{self, AES_KEY_LENGTH};
use crate::envelope::MessageType;
use crate::error::ProtocolError;

const UUID_LEN: usize = 16;
const LONG_LEN: usize = 8;
const BLUETOOTH_LEN: usize = 6;

/// A 6-byte short-range radio hardware address.
pub type BluetoothAddress = [u8; BLUETOOTH_LEN];

/// Any message the session layer can carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Identity announcement carrying a public key.
    PublicKeyExchange(PublicKeyExchange),
    /// `idA, nonceA`
    Handshake1(Handshake1),
    /// `nonceA, nonceB`
    Handshake2(Handshake2),
    /// `nonceB`
    Handshake3(Handshake3),
    /// `idA, idB, timestamp, key`
    Handshake4(Handshake4),
    /// Opaque application payload.
    Custom(CustomMessage),
}

impl Message {
    /// Flat payload bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::PublicKeyExchange(m) => m.to_bytes(),
            Self::Handshake1(m) => m.to_bytes(),
            Self::Handshake2(m) => m.to_bytes(),
            Self::Handshake3(m) => m.to_bytes(),
            Self::Handshake4(m) => m.to_bytes(),
            Self::Custom(m) => m.as_bytes().to_vec(),
        }
    }

    /// Decode the payload announced by `msg_type`.
    pub fn from_bytes(msg_type: MessageType, bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(match msg_type {
            MessageType::PublicKeyExchange => {
                Self::PublicKeyExchange(PublicKeyExchange::from_bytes(bytes)?)
            }
            MessageType::Handshake1 => Self::Handshake1(Handshake1::from_bytes(bytes)?),
            MessageType::Handshake2 => Self::Handshake2(Handshake2::from_bytes(bytes)?),
            MessageType::Handshake3 => Self::Handshake3(Handshake3::from_bytes(bytes)?),
            MessageType::Handshake4 => Self::Handshake4(Handshake4::from_bytes(bytes)?),
            MessageType::Encrypted
            | MessageType::Signed
            | MessageType::Symmetric
            | MessageType::Plain => Self::Custom(CustomMessage::new(bytes.to_vec())),
        })
    }

    /// Short variant name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PublicKeyExchange(_) => "public-key-exchange",
            Self::Handshake1(_) => "handshake-1",
            Self::Handshake2(_) => "handshake-2",
            Self::Handshake3(_) => "handshake-3",
            Self::Handshake4(_) => "handshake-4",
            Self::Custom(_) => "custom",
        }
    }
}

/// Public key announcement, sent unencrypted as type 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKeyExchange {
    owner: Uuid,
    telephone: Option<u64>,
    bluetooth: Option<BluetoothAddress>,
    public_key: RsaPublicKey,
    der: Vec<u8>,
}

impl PublicKeyExchange {
    /// Build an announcement for `owner`.
    ///
    /// `telephone` is the normalized number with its leading zeros dropped,
    /// e.g. `0049171...` becomes `49171...`.
    pub fn new(
        owner: Uuid,
        telephone: Option<u64>,
        bluetooth: Option<BluetoothAddress>,
        public_key: RsaPublicKey,
    ) -> Result<Self, ProtocolError> {
        let der = crypto::public_key_to_der(&public_key)?;
        Ok(Self {
            owner,
            telephone: telephone.filter(|&n| n != 0),
            bluetooth: bluetooth.filter(|addr| addr.iter().any(|&b| b != 0)),
            public_key,
            der,
        })
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(UUID_LEN + LONG_LEN + BLUETOOTH_LEN + self.der.len());
        out.extend_from_slice(self.owner.as_bytes());
        out.extend_from_slice(&self.telephone.unwrap_or(0).to_be_bytes());
        out.extend_from_slice(&self.bluetooth.unwrap_or_default());
        out.extend_from_slice(&self.der);
        out
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = Reader::new(bytes);
        let owner = reader.uuid()?;
        let telephone = reader.u64()?;
        let bluetooth: BluetoothAddress = reader.array()?;
        let der = reader.rest();
        let public_key = crypto::public_key_from_der(der)?;
        Ok(Self {
            owner,
            telephone: Some(telephone).filter(|&n| n != 0),
            bluetooth: Some(bluetooth).filter(|addr| addr.iter().any(|&b| b != 0)),
            public_key,
            der: der.to_vec(),
        })
    }

    /// Id of the key owner.
    pub fn owner(&self) -> Uuid {
        self.owner
    }

    /// Telephone number as digits, if announced.
    pub fn telephone(&self) -> Option<u64> {
        self.telephone
    }

    /// Radio hardware address, if announced.
    pub fn bluetooth(&self) -> Option<BluetoothAddress> {
        self.bluetooth
    }

    /// The announced public key.
    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public_key
    }
}

/// Handshake message 1: `nonceA | idA`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake1 {
    /// Nonce chosen by A.
    pub nonce_a: i64,
    /// Identity of A.
    pub id_a: Uuid,
}

impl Handshake1 {
    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(LONG_LEN + UUID_LEN);
        out.extend_from_slice(&self.nonce_a.to_be_bytes());
        out.extend_from_slice(self.id_a.as_bytes());
        out
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = Reader::new(bytes);
        let msg = Self {
            nonce_a: reader.i64()?,
            id_a: reader.uuid()?,
        };
        reader.finish()?;
        Ok(msg)
    }
}

/// Handshake message 2: `nonceA | nonceB`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake2 {
    /// Echo of A's nonce.
    pub nonce_a: i64,
    /// Nonce chosen by B.
    pub nonce_b: i64,
}

impl Handshake2 {
    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 * LONG_LEN);
        out.extend_from_slice(&self.nonce_a.to_be_bytes());
        out.extend_from_slice(&self.nonce_b.to_be_bytes());
        out
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = Reader::new(bytes);
        let msg = Self {
            nonce_a: reader.i64()?,
            nonce_b: reader.i64()?,
        };
        reader.finish()?;
        Ok(msg)
    }
}

/// Handshake message 3: `nonceB`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake3 {
    /// Echo of B's nonce.
    pub nonce_b: i64,
}

impl Handshake3 {
    fn to_bytes(&self) -> Vec<u8> {
        self.nonce_b.to_be_bytes().to_vec()
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = Reader::new(bytes);
        let msg = Self {
            nonce_b: reader.i64()?,
        };
        reader.finish()?;
        Ok(msg)
    }
}

/// Handshake message 4: `idA | idB | timestamp | key`.
#[derive(Clone, PartialEq, Eq)]
pub struct Handshake4 {
    id_a: Uuid,
    id_b: Uuid,
    timestamp: i64,
    key: Zeroizing<[u8; AES_KEY_LENGTH]>,
}

impl Handshake4 {
    /// Build message 4 around a freshly generated session key.
    pub fn new(id_a: Uuid, id_b: Uuid, timestamp: i64, key: [u8; AES_KEY_LENGTH]) -> Self {
        Self {
            id_a,
            id_b,
            timestamp,
            key: Zeroizing::new(key),
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 * UUID_LEN + LONG_LEN + AES_KEY_LENGTH);
        out.extend_from_slice(self.id_a.as_bytes());
        out.extend_from_slice(self.id_b.as_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&*self.key);
        out
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = Reader::new(bytes);
        let id_a = reader.uuid()?;
        let id_b = reader.uuid()?;
        let timestamp = reader.i64()?;
        let key: [u8; AES_KEY_LENGTH] = reader.array()?;
        reader.finish()?;
        Ok(Self::new(id_a, id_b, timestamp, key))
    }

    /// Identity of A.
    pub fn id_a(&self) -> Uuid {
        self.id_a
    }

    /// Identity of B.
    pub fn id_b(&self) -> Uuid {
        self.id_b
    }

    /// Key creation time, milliseconds since the Unix epoch.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// The negotiated AES-256 key.
    pub fn key(&self) -> &[u8; AES_KEY_LENGTH] {
        &self.key
    }
}

impl std::fmt::Debug for Handshake4 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handshake4")
            .field("id_a", &self.id_a)
            .field("id_b", &self.id_b)
            .field("timestamp", &self.timestamp)
            .finish_non_exhaustive()
    }
}

/// Opaque application payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomMessage(Vec<u8>);

impl CustomMessage {
    /// Wrap raw bytes.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Wrap UTF-8 text.
    pub fn text(text: &str) -> Self {
        Self(text.as_bytes().to_vec())
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Interpret as UTF-8.
    pub fn as_str(&self) -> Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.0)
    }
}

/// Big-endian cursor over a payload. Short input is `MalformedPayload`.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        if self.buf.len() < n {
            return Err(ProtocolError::MalformedPayload);
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn i64(&mut self) -> Result<i64, ProtocolError> {
        Ok(i64::from_be_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, ProtocolError> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    fn uuid(&mut self) -> Result<Uuid, ProtocolError> {
        Ok(Uuid::from_bytes(self.array()?))
    }

    fn rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.buf)
    }

    fn finish(&self) -> Result<(), ProtocolError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::MalformedPayload)
        }
    }
}
