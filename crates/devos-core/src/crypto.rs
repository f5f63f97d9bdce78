//! Cryptographic utilities for encrypting and decrypting sensitive data.
//!
//! Uses ChaCha20-Poly1305 AEAD (Authenticated Encryption with Associated Data)
//! for secure encryption with authentication. Keys and sensitive data are
//! automatically zeroed from memory when dropped using the `zeroize` crate.
//!
//! Persisted records (BYOK secrets, Jira OAuth tokens) store ciphertext and
//! IV as two separate columns rather than one combined blob. [`encrypt_parts`]
//! and [`decrypt_parts`] split/join the nonce-prefixed [`encrypt`]/[`decrypt`]
//! format at that boundary so the rest of this module stays a single AEAD
//! primitive.

use ring::aead::{
    Aad, BoundKey, Nonce, NonceSequence, OpeningKey, SealingKey, UnboundKey, CHACHA20_POLY1305,
};
use ring::error::Unspecified;
use ring::rand::{SecureRandom, SystemRandom};
use base64::Engine as _;
use std::error::Error as StdError;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of ChaCha20-Poly1305 key in bytes (256 bits)
const KEY_LEN: usize = 32;

/// Size of nonce in bytes (96 bits)
const NONCE_LEN: usize = 12;

/// Size of authentication tag appended to ciphertext (128 bits)
const TAG_LEN: usize = 16;

/// Errors that can occur during cryptographic operations.
#[derive(Debug)]
pub enum CryptoError {
    /// Failed to generate random bytes from system entropy.
    RandomGeneration,
    /// Encryption operation failed.
    Encryption,
    /// Decryption operation failed (invalid ciphertext or authentication tag).
    Decryption,
    /// Invalid input format (e.g., ciphertext too short).
    InvalidFormat(String),
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CryptoError::RandomGeneration => write!(f, "failed to generate random bytes"),
            CryptoError::Encryption => write!(f, "encryption failed"),
            CryptoError::Decryption => write!(f, "decryption failed"),
            CryptoError::InvalidFormat(msg) => write!(f, "invalid format: {}", msg),
        }
    }
}

impl StdError for CryptoError {}

impl From<Unspecified> for CryptoError {
    fn from(_: Unspecified) -> Self {
        CryptoError::Encryption
    }
}

/// A cryptographic key that is automatically zeroed from memory when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey {
    bytes: [u8; KEY_LEN],
}

impl EncryptionKey {
    /// Generate a new random encryption key using system entropy.
    pub fn generate() -> Result<Self, CryptoError> {
        let rng = SystemRandom::new();
        let mut bytes = [0u8; KEY_LEN];
        rng.fill(&mut bytes)
            .map_err(|_| CryptoError::RandomGeneration)?;
        Ok(Self { bytes })
    }

    /// Create an encryption key from existing bytes.
    ///
    /// The input slice must be exactly 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != KEY_LEN {
            return Err(CryptoError::InvalidFormat(format!(
                "key must be {} bytes, got {}",
                KEY_LEN,
                bytes.len()
            )));
        }
        let mut key_bytes = [0u8; KEY_LEN];
        key_bytes.copy_from_slice(bytes);
        Ok(Self { bytes: key_bytes })
    }

    /// Get the raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }

    /// Decode a standard-base64-encoded 32-byte key, as carried in the
    /// `DEVOS_ENCRYPTION_KEY` environment variable.
    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let engine = base64::engine::general_purpose::STANDARD;
        let bytes = engine
            .decode(encoded)
            .map_err(|e| CryptoError::InvalidFormat(e.to_string()))?;
        Self::from_bytes(&bytes)
    }
}

/// A nonce generator that creates a single random nonce.
struct OneNonceSequence {
    nonce: Option<Nonce>,
}

impl OneNonceSequence {
    fn new(nonce: Nonce) -> Self {
        Self { nonce: Some(nonce) }
    }
}

impl NonceSequence for OneNonceSequence {
    fn advance(&mut self) -> Result<Nonce, Unspecified> {
        self.nonce.take().ok_or(Unspecified)
    }
}

/// Encrypt plaintext using ChaCha20-Poly1305 AEAD.
///
/// Returns a Vec containing: `nonce (12 bytes) || ciphertext || auth_tag (16 bytes)`.
pub fn encrypt(key: &EncryptionKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let rng = SystemRandom::new();

    let mut nonce_bytes = [0u8; NONCE_LEN];
    rng.fill(&mut nonce_bytes)
        .map_err(|_| CryptoError::RandomGeneration)?;
    let nonce = Nonce::assume_unique_for_key(nonce_bytes);

    let unbound_key =
        UnboundKey::new(&CHACHA20_POLY1305, key.as_bytes()).map_err(|_| CryptoError::Encryption)?;
    let nonce_sequence = OneNonceSequence::new(nonce);
    let mut sealing_key = SealingKey::new(unbound_key, nonce_sequence);

    let mut in_out = plaintext.to_vec();
    sealing_key
        .seal_in_place_append_tag(Aad::empty(), &mut in_out)
        .map_err(|_| CryptoError::Encryption)?;

    let mut result = nonce_bytes.to_vec();
    result.extend_from_slice(&in_out);

    Ok(result)
}

/// Decrypt ciphertext using ChaCha20-Poly1305 AEAD.
///
/// Expects input format: `nonce (12 bytes) || ciphertext || auth_tag (16 bytes)`.
pub fn decrypt(key: &EncryptionKey, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::InvalidFormat(format!(
            "ciphertext too short: expected at least {} bytes, got {}",
            NONCE_LEN + TAG_LEN,
            ciphertext.len()
        )));
    }

    let nonce_bytes: [u8; NONCE_LEN] = ciphertext[..NONCE_LEN]
        .try_into()
        .map_err(|_| CryptoError::InvalidFormat("failed to extract nonce".into()))?;
    let nonce = Nonce::assume_unique_for_key(nonce_bytes);

    let unbound_key =
        UnboundKey::new(&CHACHA20_POLY1305, key.as_bytes()).map_err(|_| CryptoError::Decryption)?;
    let nonce_sequence = OneNonceSequence::new(nonce);
    let mut opening_key = OpeningKey::new(unbound_key, nonce_sequence);

    let mut in_out = ciphertext[NONCE_LEN..].to_vec();
    let plaintext = opening_key
        .open_in_place(Aad::empty(), &mut in_out)
        .map_err(|_| CryptoError::Decryption)?;

    Ok(plaintext.to_vec())
}

/// Encrypt `plaintext`, returning `(iv_b64, ciphertext_b64)` for storage in
/// the two separate columns `spec.md` §3 names (`encrypted_key`+
/// `encryption_iv`, `accessToken`+`accessTokenIv`, ...).
pub fn encrypt_parts(key: &EncryptionKey, plaintext: &str) -> Result<(String, String), CryptoError> {
    let blob = encrypt(key, plaintext.as_bytes())?;
    let (iv, ct) = blob.split_at(NONCE_LEN);
    let engine = base64::engine::general_purpose::STANDARD;
    Ok((engine.encode(iv), engine.encode(ct)))
}

/// Inverse of [`encrypt_parts`].
pub fn decrypt_parts(key: &EncryptionKey, iv_b64: &str, ciphertext_b64: &str) -> Result<String, CryptoError> {
    let engine = base64::engine::general_purpose::STANDARD;
    let iv = engine
        .decode(iv_b64)
        .map_err(|e| CryptoError::InvalidFormat(e.to_string()))?;
    let ct = engine
        .decode(ciphertext_b64)
        .map_err(|e| CryptoError::InvalidFormat(e.to_string()))?;
    let mut blob = iv;
    blob.extend_from_slice(&ct);
    let plaintext = decrypt(key, &blob)?;
    String::from_utf8(plaintext).map_err(|e| CryptoError::InvalidFormat(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_generation() {
        let key1 = EncryptionKey::generate().unwrap();
        let key2 = EncryptionKey::generate().unwrap();
        assert_ne!(key1.as_bytes(), key2.as_bytes());
        assert_eq!(key1.as_bytes().len(), KEY_LEN);
    }

    #[test]
    fn test_key_from_bytes_invalid_length() {
        let bytes = [42u8; 16];
        let result = EncryptionKey::from_bytes(&bytes);
        assert!(matches!(result, Err(CryptoError::InvalidFormat(_))));
    }

    #[test]
    fn test_key_from_base64_roundtrip() {
        let key = EncryptionKey::generate().unwrap();
        let engine = base64::engine::general_purpose::STANDARD;
        let encoded = engine.encode(key.as_bytes());
        let decoded = EncryptionKey::from_base64(&encoded).unwrap();
        assert_eq!(key.as_bytes(), decoded.as_bytes());
    }

    #[test]
    fn test_key_from_base64_rejects_garbage() {
        assert!(matches!(EncryptionKey::from_base64("not base64!!"), Err(CryptoError::InvalidFormat(_))));
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = EncryptionKey::generate().unwrap();
        let plaintext = b"Hello, secure world!";
        let ciphertext = encrypt(&key, plaintext).unwrap();
        let decrypted = decrypt(&key, &ciphertext).unwrap();
        assert_eq!(plaintext, &decrypted[..]);
    }

    #[test]
    fn test_encrypt_produces_different_ciphertexts() {
        let key = EncryptionKey::generate().unwrap();
        let plaintext = b"same plaintext";
        let ciphertext1 = encrypt(&key, plaintext).unwrap();
        let ciphertext2 = encrypt(&key, plaintext).unwrap();
        assert_ne!(ciphertext1, ciphertext2);
        assert_eq!(decrypt(&key, &ciphertext1).unwrap(), decrypt(&key, &ciphertext2).unwrap());
    }

    #[test]
    fn test_decrypt_with_wrong_key_fails() {
        let key1 = EncryptionKey::generate().unwrap();
        let key2 = EncryptionKey::generate().unwrap();
        let ciphertext = encrypt(&key1, b"secret").unwrap();
        assert!(matches!(decrypt(&key2, &ciphertext), Err(CryptoError::Decryption)));
    }

    #[test]
    fn test_decrypt_tampered_ciphertext_fails() {
        let key = EncryptionKey::generate().unwrap();
        let mut ciphertext = encrypt(&key, b"original data").unwrap();
        let mid = ciphertext.len() / 2;
        ciphertext[mid] ^= 0xFF;
        assert!(matches!(decrypt(&key, &ciphertext), Err(CryptoError::Decryption)));
    }

    #[test]
    fn test_decrypt_too_short_fails() {
        let key = EncryptionKey::generate().unwrap();
        let short_data = vec![0u8; 10];
        assert!(matches!(decrypt(&key, &short_data), Err(CryptoError::InvalidFormat(_))));
    }

    #[test]
    fn test_encrypt_empty_plaintext() {
        let key = EncryptionKey::generate().unwrap();
        let ciphertext = encrypt(&key, b"").unwrap();
        assert_eq!(decrypt(&key, &ciphertext).unwrap(), b"");
    }

    #[test]
    fn test_ciphertext_format() {
        let key = EncryptionKey::generate().unwrap();
        let ciphertext = encrypt(&key, b"test").unwrap();
        assert_eq!(ciphertext.len(), NONCE_LEN + 4 + TAG_LEN);
    }

    #[test]
    fn test_encrypt_parts_roundtrip() {
        let key = EncryptionKey::generate().unwrap();
        let (iv, ct) = encrypt_parts(&key, "sk-ant-secret-token").unwrap();
        assert_ne!(iv, ct);
        let plaintext = decrypt_parts(&key, &iv, &ct).unwrap();
        assert_eq!(plaintext, "sk-ant-secret-token");
    }

    #[test]
    fn test_encrypt_parts_wrong_key_fails() {
        let key1 = EncryptionKey::generate().unwrap();
        let key2 = EncryptionKey::generate().unwrap();
        let (iv, ct) = encrypt_parts(&key1, "token").unwrap();
        assert!(decrypt_parts(&key2, &iv, &ct).is_err());
    }

}
