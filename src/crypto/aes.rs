use aes_gcm::{
    aead::{AeadInPlace, KeyInit, OsRng},
    Aes256Gcm, Nonce, Tag,
};
use aes_gcm::aead::rand_core::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};
use crate::error::{AppError, Result};

/// The size of the AES-256 key in bytes.
pub const KEY_SIZE: usize = 32;
/// The size of the AES-GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;
/// The size of the AES-GCM authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

/// A secure key wrapper that ensures the key is zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecureKey([u8; KEY_SIZE]);

impl SecureKey {
    /// Creates a new `SecureKey` from a byte array.
    ///
    /// # Arguments
    ///
    /// * `key` - A 32-byte array representing the AES-256 key.
    pub fn new(key: [u8; KEY_SIZE]) -> Self {
        Self(key)
    }

    /// Creates a `SecureKey` from a slice, failing unless it is exactly 32 bytes.
    pub fn from_slice(key: &[u8]) -> Result<Self> {
        let bytes: [u8; KEY_SIZE] = key
            .try_into()
            .map_err(|_| AppError::Crypto(format!("Key must be {} bytes", KEY_SIZE)))?;
        Ok(Self(bytes))
    }

    /// Returns a reference to the key as a byte slice.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for SecureKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecureKey([REDACTED])")
    }
}

/// Generates a new random AES-256 key.
///
/// # Returns
///
/// A `SecureKey` containing the generated key.
pub fn generate_key() -> SecureKey {
    let mut key = [0u8; KEY_SIZE];
    OsRng.fill_bytes(&mut key);
    SecureKey::new(key)
}

/// Generates a new random AES-GCM nonce.
///
/// # Returns
///
/// A 12-byte array representing the nonce.
pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Output of a detached AES-256-GCM seal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_SIZE],
    pub tag: [u8; TAG_SIZE],
}

/// Encrypts a plaintext using AES-256-GCM with a fresh nonce.
///
/// # Arguments
///
/// * `key` - The AES-256 key.
/// * `plaintext` - The data to encrypt.
/// * `aad` - Associated data bound into the tag but not encrypted.
///
/// # Returns
///
/// The ciphertext with its nonce and detached tag.
pub fn encrypt(key: &[u8; KEY_SIZE], plaintext: &[u8], aad: &[u8]) -> Result<Sealed> {
    let cipher = Aes256Gcm::new(key.into());

    let nonce_bytes = generate_nonce();
    let nonce = Nonce::from(nonce_bytes);

    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(&nonce, aad, &mut buffer)
        .map_err(|e| AppError::Crypto(format!("Encryption failed: {}", e)))?;

    let mut tag_bytes = [0u8; TAG_SIZE];
    tag_bytes.copy_from_slice(tag.as_slice());

    Ok(Sealed {
        ciphertext: buffer,
        nonce: nonce_bytes,
        tag: tag_bytes,
    })
}

/// Decrypts a detached AES-256-GCM ciphertext.
///
/// # Arguments
///
/// * `key` - The AES-256 key.
/// * `sealed` - Ciphertext, nonce and tag.
/// * `aad` - The associated data used at encryption time.
///
/// # Returns
///
/// The decrypted plaintext.
pub fn decrypt(key: &[u8; KEY_SIZE], sealed: &Sealed, aad: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(key.into());
    let nonce = Nonce::from(sealed.nonce);
    let tag = Tag::from_slice(&sealed.tag);

    let mut buffer = sealed.ciphertext.clone();
    cipher
        .decrypt_in_place_detached(&nonce, aad, &mut buffer, tag)
        .map_err(|e| AppError::Crypto(format!("Decryption failed: {}", e)))?;
    Ok(buffer)
}
