//! ---
//! ems_section: "06-security-access-control"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Authenticated payload encryption for published and received messages."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! AES-CBC with HMAC-SHA2 in encrypt-then-MAC composition.
//!
//! The key is split into a MAC key (leading bytes) and an encryption key (trailing
//! bytes). Sealed output is `IV || CBC ciphertext || truncated tag`, where the tag
//! covers `IV || ciphertext || 64-bit associated-data length`. No associated data is
//! used, so the length block is always zero.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use aes::{Aes128, Aes192, Aes256};
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256, Sha384, Sha512};

use crate::config::WatermillConfig;
use crate::modifier::BinaryModifier;
use crate::{EdgewireError, Result};

/// Size of the CBC initialisation vector, which doubles as the AEAD nonce.
pub const NONCE_SIZE: usize = 16;
const BLOCK_SIZE: usize = 16;

/// Supported encrypt-then-MAC suites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncryptionAlgorithm {
    /// AES-128-CBC with HMAC-SHA-256, 32 byte key.
    Aes128Sha256,
    /// AES-192-CBC with HMAC-SHA-384, 48 byte key.
    Aes192Sha384,
    /// AES-256-CBC with HMAC-SHA-384, 56 byte key.
    Aes256Sha384,
    /// AES-256-CBC with HMAC-SHA-512, 64 byte key.
    Aes256Sha512,
}

impl EncryptionAlgorithm {
    /// Configuration name of the algorithm.
    pub fn as_str(&self) -> &'static str {
        match self {
            EncryptionAlgorithm::Aes128Sha256 => "aes128-sha256",
            EncryptionAlgorithm::Aes192Sha384 => "aes192-sha384",
            EncryptionAlgorithm::Aes256Sha384 => "aes256-sha384",
            EncryptionAlgorithm::Aes256Sha512 => "aes256-sha512",
        }
    }

    /// Number of leading key bytes used for the MAC.
    pub const fn mac_key_len(&self) -> usize {
        match self {
            EncryptionAlgorithm::Aes128Sha256 => 16,
            EncryptionAlgorithm::Aes192Sha384 | EncryptionAlgorithm::Aes256Sha384 => 24,
            EncryptionAlgorithm::Aes256Sha512 => 32,
        }
    }

    /// Number of trailing key bytes used for AES.
    pub const fn enc_key_len(&self) -> usize {
        match self {
            EncryptionAlgorithm::Aes128Sha256 => 16,
            EncryptionAlgorithm::Aes192Sha384 => 24,
            EncryptionAlgorithm::Aes256Sha384 | EncryptionAlgorithm::Aes256Sha512 => 32,
        }
    }

    /// Total key length expected in configuration.
    pub const fn key_len(&self) -> usize {
        self.mac_key_len() + self.enc_key_len()
    }

    /// Length of the truncated authentication tag.
    pub const fn tag_len(&self) -> usize {
        self.mac_key_len()
    }
}

impl fmt::Display for EncryptionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EncryptionAlgorithm {
    type Err = EdgewireError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "aes128-sha256" => Ok(EncryptionAlgorithm::Aes128Sha256),
            "aes192-sha384" => Ok(EncryptionAlgorithm::Aes192Sha384),
            "aes256-sha384" => Ok(EncryptionAlgorithm::Aes256Sha384),
            "aes256-sha512" => Ok(EncryptionAlgorithm::Aes256Sha512),
            other => Err(EdgewireError::Configuration(format!(
                "invalid algorithm specified: {other}"
            ))),
        }
    }
}

/// Symmetric key material paired with its algorithm.
#[derive(Clone)]
pub struct DataProtection {
    algorithm: EncryptionAlgorithm,
    key: Vec<u8>,
}

impl fmt::Debug for DataProtection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataProtection")
            .field("algorithm", &self.algorithm)
            .field("key_fingerprint", &self.fingerprint())
            .finish()
    }
}

impl DataProtection {
    /// Build protection from raw key bytes, validating the key length.
    pub fn new(algorithm: EncryptionAlgorithm, key: Vec<u8>) -> Result<Self> {
        if key.len() != algorithm.key_len() {
            return Err(EdgewireError::Configuration(format!(
                "{algorithm} requires a {} byte key, got {}",
                algorithm.key_len(),
                key.len()
            )));
        }
        Ok(Self { algorithm, key })
    }

    /// Build protection from an algorithm name and hex-encoded key.
    pub fn from_hex(algorithm: &str, key_hex: &str) -> Result<Self> {
        let algorithm = algorithm.parse::<EncryptionAlgorithm>()?;
        let key = hex::decode(key_hex.trim())?;
        Self::new(algorithm, key)
    }

    /// Build protection from configuration; `None` when no algorithm is configured.
    pub fn from_config(config: &WatermillConfig) -> Result<Option<Self>> {
        if config.encryption_algorithm.trim().is_empty() {
            return Ok(None);
        }
        Self::from_hex(&config.encryption_algorithm, &config.encryption_key).map(Some)
    }

    /// Selected algorithm.
    pub fn algorithm(&self) -> EncryptionAlgorithm {
        self.algorithm
    }

    /// SHA-256 fingerprint of the key for audit logging.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.key);
        hex::encode(hasher.finalize())
    }

    fn mac_key(&self) -> &[u8] {
        &self.key[..self.algorithm.mac_key_len()]
    }

    fn enc_key(&self) -> &[u8] {
        &self.key[self.algorithm.mac_key_len()..]
    }

    /// Encrypt with a freshly generated random IV.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut iv = [0u8; NONCE_SIZE];
        rand::thread_rng()
            .try_fill_bytes(&mut iv)
            .map_err(|err| EdgewireError::Crypto(format!("nonce generation failed: {err}")))?;
        self.seal(&iv, plaintext)
    }

    fn seal(&self, iv: &[u8; NONCE_SIZE], plaintext: &[u8]) -> Result<Vec<u8>> {
        let enc_key = self.enc_key();
        let ciphertext = match self.algorithm {
            EncryptionAlgorithm::Aes128Sha256 => cbc::Encryptor::<Aes128>::new_from_slices(enc_key, iv)
                .map(|c| c.encrypt_padded_vec_mut::<Pkcs7>(plaintext)),
            EncryptionAlgorithm::Aes192Sha384 => cbc::Encryptor::<Aes192>::new_from_slices(enc_key, iv)
                .map(|c| c.encrypt_padded_vec_mut::<Pkcs7>(plaintext)),
            EncryptionAlgorithm::Aes256Sha384 | EncryptionAlgorithm::Aes256Sha512 => {
                cbc::Encryptor::<Aes256>::new_from_slices(enc_key, iv)
                    .map(|c| c.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
            }
        }
        .map_err(|_| EdgewireError::Crypto("cipher rejected key or iv length".into()))?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len() + self.algorithm.tag_len());
        sealed.extend_from_slice(iv);
        sealed.extend_from_slice(&ciphertext);
        let tag = self.tag(&sealed)?;
        sealed.extend_from_slice(&tag);
        Ok(sealed)
    }

    /// Authenticate and decrypt a sealed payload.
    pub fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        let tag_len = self.algorithm.tag_len();
        if sealed.len() < NONCE_SIZE + BLOCK_SIZE + tag_len {
            return Err(EdgewireError::Crypto(format!(
                "ciphertext too short: {} bytes",
                sealed.len()
            )));
        }
        let (authenticated, tag) = sealed.split_at(sealed.len() - tag_len);
        if (authenticated.len() - NONCE_SIZE) % BLOCK_SIZE != 0 {
            return Err(EdgewireError::Crypto(
                "ciphertext is not a whole number of blocks".into(),
            ));
        }
        if !self.verify(authenticated, tag)? {
            return Err(EdgewireError::Crypto("message authentication failed".into()));
        }

        let (iv, ciphertext) = authenticated.split_at(NONCE_SIZE);
        let enc_key = self.enc_key();
        let plaintext = match self.algorithm {
            EncryptionAlgorithm::Aes128Sha256 => cbc::Decryptor::<Aes128>::new_from_slices(enc_key, iv)
                .map(|c| c.decrypt_padded_vec_mut::<Pkcs7>(ciphertext)),
            EncryptionAlgorithm::Aes192Sha384 => cbc::Decryptor::<Aes192>::new_from_slices(enc_key, iv)
                .map(|c| c.decrypt_padded_vec_mut::<Pkcs7>(ciphertext)),
            EncryptionAlgorithm::Aes256Sha384 | EncryptionAlgorithm::Aes256Sha512 => {
                cbc::Decryptor::<Aes256>::new_from_slices(enc_key, iv)
                    .map(|c| c.decrypt_padded_vec_mut::<Pkcs7>(ciphertext))
            }
        }
        .map_err(|_| EdgewireError::Crypto("cipher rejected key or iv length".into()))?
        .map_err(|_| EdgewireError::Crypto("invalid padding".into()))?;
        Ok(plaintext)
    }

    fn tag(&self, authenticated: &[u8]) -> Result<Vec<u8>> {
        let key = self.mac_key();
        let mut full = match self.algorithm {
            EncryptionAlgorithm::Aes128Sha256 => {
                keyed_mac::<Hmac<Sha256>>(key, authenticated)?.finalize().into_bytes().to_vec()
            }
            EncryptionAlgorithm::Aes192Sha384 | EncryptionAlgorithm::Aes256Sha384 => {
                keyed_mac::<Hmac<Sha384>>(key, authenticated)?.finalize().into_bytes().to_vec()
            }
            EncryptionAlgorithm::Aes256Sha512 => {
                keyed_mac::<Hmac<Sha512>>(key, authenticated)?.finalize().into_bytes().to_vec()
            }
        };
        full.truncate(self.algorithm.tag_len());
        Ok(full)
    }

    fn verify(&self, authenticated: &[u8], tag: &[u8]) -> Result<bool> {
        let key = self.mac_key();
        let verified = match self.algorithm {
            EncryptionAlgorithm::Aes128Sha256 => keyed_mac::<Hmac<Sha256>>(key, authenticated)?
                .verify_truncated_left(tag)
                .is_ok(),
            EncryptionAlgorithm::Aes192Sha384 | EncryptionAlgorithm::Aes256Sha384 => {
                keyed_mac::<Hmac<Sha384>>(key, authenticated)?
                    .verify_truncated_left(tag)
                    .is_ok()
            }
            EncryptionAlgorithm::Aes256Sha512 => keyed_mac::<Hmac<Sha512>>(key, authenticated)?
                .verify_truncated_left(tag)
                .is_ok(),
        };
        Ok(verified)
    }

    /// Matched encrypt/decrypt modifiers sharing this key.
    pub fn modifiers(self) -> (BinaryModifier, BinaryModifier) {
        let shared = Arc::new(self);
        (
            BinaryModifier::Encrypt(Arc::clone(&shared)),
            BinaryModifier::Decrypt(shared),
        )
    }
}

fn keyed_mac<M: Mac + KeyInit>(key: &[u8], authenticated: &[u8]) -> Result<M> {
    let mut mac = <M as KeyInit>::new_from_slice(key)
        .map_err(|_| EdgewireError::Crypto("mac rejected key length".into()))?;
    mac.update(authenticated);
    // associated data length in bits, always zero
    mac.update(&0u64.to_be_bytes());
    Ok(mac)
}

/// Resolve the encrypt/decrypt pair for a configuration, substituting no-op
/// modifiers when encryption is not configured.
pub fn modifiers_for(config: &WatermillConfig) -> Result<(BinaryModifier, BinaryModifier)> {
    match DataProtection::from_config(config)? {
        Some(protection) => {
            tracing::debug!(
                algorithm = %protection.algorithm(),
                key_fingerprint = %protection.fingerprint(),
                "payload encryption enabled"
            );
            Ok(protection.modifiers())
        }
        None => Ok((BinaryModifier::Noop, BinaryModifier::Noop)),
    }
}
