//! Cryptographic engine.
//!
//! RSA-1024 with PKCS#1 v1.5 padding, applied block by block so payloads may
//! exceed one cipher block: plaintext is cut into 117-byte chunks when
//! encrypting and ciphertext into 128-byte chunks when decrypting, with the
//! partial results concatenated. Both directions are supported for both
//! halves of the keypair:
//!
//! - public key encrypts, private key decrypts (type 2 padding)
//! - private key encrypts, public key recovers (type 1 padding)
//!
//! Session keys are AES-256 in CBC mode with PKCS#7 padding and an all-zero IV.
//! Every plaintext carries a 20-byte SHA-1 trailer checked after decryption.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, Pkcs1v15Encrypt, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha1::{Digest, Sha1};
use zeroize::Zeroizing;

use crate::error::ProtocolError;

/// RSA modulus size in bits.
pub const RSA_KEY_BITS: usize = 1024;

/// PKCS#1 v1.5 overhead per block.
const PKCS1_OVERHEAD: usize = 11;

/// Plaintext bytes per RSA block for a 1024-bit key.
pub const RSA_ENCRYPT_BLOCK: usize = RSA_KEY_BITS / 8 - PKCS1_OVERHEAD;

/// Ciphertext bytes per RSA block for a 1024-bit key.
pub const RSA_DECRYPT_BLOCK: usize = RSA_KEY_BITS / 8;

/// AES-256 key length in bytes.
pub const AES_KEY_LENGTH: usize = 32;

/// SHA-1 digest length.
pub const DIGEST_LENGTH: usize = 20;

const AES_IV: [u8; 16] = [0u8; 16];

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// A 256-bit session key. Zeroized on drop.
pub type SessionKeyBytes = Zeroizing<[u8; AES_KEY_LENGTH]>;

/// Generate a fresh RSA-1024 keypair.
pub fn generate_keypair() -> Result<RsaPrivateKey, ProtocolError> {
    Ok(RsaPrivateKey::new(&mut OsRng, RSA_KEY_BITS)?)
}

/// Generate a random AES-256 key from the OS CSPRNG.
pub fn generate_session_key() -> SessionKeyBytes {
    let mut key = Zeroizing::new([0u8; AES_KEY_LENGTH]);
    OsRng.fill_bytes(&mut *key);
    key
}

/// Encrypt with the recipient's public key.
pub fn encrypt_with_public(key: &RsaPublicKey, data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let mut rng = OsRng;
    let mut out = Vec::with_capacity(block_count(data.len(), RSA_ENCRYPT_BLOCK) * key.size());
    for chunk in data.chunks(RSA_ENCRYPT_BLOCK) {
        out.extend(key.encrypt(&mut rng, Pkcs1v15Encrypt, chunk)?);
    }
    Ok(out)
}

/// Decrypt data produced by [`encrypt_with_public`] with the matching private key.
pub fn decrypt_with_private(key: &RsaPrivateKey, data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    check_block_aligned(data)?;
    let mut out = Vec::with_capacity(data.len());
    for block in data.chunks(RSA_DECRYPT_BLOCK) {
        out.extend(key.decrypt(Pkcs1v15Encrypt, block)?);
    }
    Ok(out)
}

/// Transform with the own private key (PKCS#1 type 1 padding).
///
/// Anyone holding the public key can reverse this, so it authenticates the
/// sender without hiding the content.
pub fn encrypt_with_private(key: &RsaPrivateKey, data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let mut out = Vec::with_capacity(block_count(data.len(), RSA_ENCRYPT_BLOCK) * RSA_DECRYPT_BLOCK);
    for chunk in data.chunks(RSA_ENCRYPT_BLOCK) {
        out.extend(key.sign(Pkcs1v15Sign::new_unprefixed(), chunk)?);
    }
    Ok(out)
}

/// Reverse [`encrypt_with_private`] using the sender's public key.
pub fn decrypt_with_public(key: &RsaPublicKey, data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    check_block_aligned(data)?;
    let mut out = Vec::with_capacity(data.len());
    for block in data.chunks(RSA_DECRYPT_BLOCK) {
        out.extend(recover_block(key, block)?);
    }
    Ok(out)
}

/// Raw public-key operation followed by type 1 unpadding.
fn recover_block(key: &RsaPublicKey, block: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let k = key.size();
    let c = BigUint::from_bytes_be(block);
    if &c >= key.n() {
        return Err(ProtocolError::Crypto("block out of range".into()));
    }
    let m = c.modpow(key.e(), key.n()).to_bytes_be();
    if m.len() > k {
        return Err(ProtocolError::Crypto("block out of range".into()));
    }

    let mut em = vec![0u8; k - m.len()];
    em.extend_from_slice(&m);

    // 0x00 0x01 0xFF.. 0x00 DATA, with at least 8 bytes of 0xFF
    if em.len() < PKCS1_OVERHEAD || em[0] != 0x00 || em[1] != 0x01 {
        return Err(ProtocolError::Crypto("invalid padding".into()));
    }
    let pad_end = em[2..]
        .iter()
        .position(|&b| b != 0xFF)
        .map(|p| p + 2)
        .ok_or_else(|| ProtocolError::Crypto("invalid padding".into()))?;
    if em[pad_end] != 0x00 || pad_end < 10 {
        return Err(ProtocolError::Crypto("invalid padding".into()));
    }
    Ok(em[pad_end + 1..].to_vec())
}

fn check_block_aligned(data: &[u8]) -> Result<(), ProtocolError> {
    if data.len() % RSA_DECRYPT_BLOCK != 0 {
        return Err(ProtocolError::Crypto(format!(
            "ciphertext length {} is not a multiple of {}",
            data.len(),
            RSA_DECRYPT_BLOCK
        )));
    }
    Ok(())
}

fn block_count(len: usize, block: usize) -> usize {
    len.div_ceil(block)
}

/// Encrypt with an AES-256 session key.
pub fn aes_encrypt(key: &[u8; AES_KEY_LENGTH], data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let cipher = Aes256CbcEnc::new_from_slices(key, &AES_IV)
        .map_err(|e| ProtocolError::Crypto(e.to_string()))?;
    Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(data))
}

/// Decrypt with an AES-256 session key.
pub fn aes_decrypt(key: &[u8; AES_KEY_LENGTH], data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let cipher = Aes256CbcDec::new_from_slices(key, &AES_IV)
        .map_err(|e| ProtocolError::Crypto(e.to_string()))?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(data)
        .map_err(|_| ProtocolError::Crypto("bad padding".into()))
}

/// SHA-1 of `data`.
pub fn sha1(data: &[u8]) -> [u8; DIGEST_LENGTH] {
    let mut out = [0u8; DIGEST_LENGTH];
    out.copy_from_slice(&Sha1::digest(data));
    out
}

/// `data || sha1(data)`
pub fn append_digest(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + DIGEST_LENGTH);
    out.extend_from_slice(data);
    out.extend_from_slice(&sha1(data));
    out
}

/// Split off and verify the SHA-1 trailer, returning the plaintext.
pub fn strip_digest(data: &[u8]) -> Result<&[u8], ProtocolError> {
    if data.len() < DIGEST_LENGTH {
        return Err(ProtocolError::IntegrityCheckFailed);
    }
    let (plaintext, received) = data.split_at(data.len() - DIGEST_LENGTH);
    if sha1(plaintext) != received {
        return Err(ProtocolError::IntegrityCheckFailed);
    }
    Ok(plaintext)
}

/// X.509 SubjectPublicKeyInfo DER encoding.
pub fn public_key_to_der(key: &RsaPublicKey) -> Result<Vec<u8>, ProtocolError> {
    key.to_public_key_der()
        .map(|doc| doc.as_bytes().to_vec())
        .map_err(|e| ProtocolError::Crypto(e.to_string()))
}

/// Parse an X.509 SubjectPublicKeyInfo DER public key.
pub fn public_key_from_der(der: &[u8]) -> Result<RsaPublicKey, ProtocolError> {
    RsaPublicKey::from_public_key_der(der).map_err(|_| ProtocolError::MalformedPayload)
}

/// Hex SHA-1 of the DER public key, for out-of-band comparison.
pub fn fingerprint(key: &RsaPublicKey) -> Result<String, ProtocolError> {
    Ok(hex::encode(sha1(&public_key_to_der(key)?)))
}
