//! At-rest sealing for Local Store values.
//!
//! Journey records carry customer contact details and live on a shared
//! kiosk device, so the host can hand the store a [`CryptoProvider`]. The
//! sealed layout is:
//!
//! ```text
//! magic(8) | version(4 LE) | alg(1) | key_id(4 LE) | nonce(24) | ciphertext | tag(16)
//! ```

use aead::{AeadInPlace, KeyInit};
use chacha20poly1305::{Key, Tag, XChaCha20Poly1305, XNonce};
use secrecy::{ExposeSecret, Secret};
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;
use zeroize::Zeroize;

const SEAL_MAGIC: [u8; 8] = *b"JRNYSEAL";
const CURRENT_VERSION: u32 = 1;
const HEADER_SIZE: usize = 41;
const TAG_SIZE: usize = 16;
const NONCE_SIZE: usize = 24;
pub const KEY_SIZE: usize = 32;
const MAX_AAD_FIELD: usize = 1024;
const RESERVED_KEY_ID: u32 = 0;
const ALG_XCHACHA20_POLY1305: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenFailure {
    MalformedEnvelope,
    UnsupportedVersion { version: u32 },
    UnsupportedAlgorithm { alg: u8 },
    KeyNotFound { key_id: u32 },
    AuthenticationFailed,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("invalid key id: {0} is reserved")]
    InvalidKeyId(u32),

    #[error("randomness unavailable")]
    RandomUnavailable,

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("decryption failed: {0:?}")]
    DecryptionFailed(OpenFailure),

    #[error("aad required but empty")]
    AadRequired,

    #[error("aad field too large: {field} has {size} > {max}")]
    AadFieldTooLarge {
        field: &'static str,
        size: usize,
        max: usize,
    },

    #[error("no keys available")]
    NoKeysAvailable,

    #[error("cannot remove primary key {0}, set another primary first")]
    CannotRemovePrimaryKey(u32),

    #[error("key not found: {0}")]
    KeyNotFound(u32),

    #[error("lock poisoned")]
    LockPoisoned,
}

pub trait CryptoProvider: Send + Sync {
    fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError>;
    fn decrypt(&self, sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

pub trait RandomProvider: Send + Sync {
    fn fill(&self, out: &mut [u8]) -> Result<(), CryptoError>;
}

pub struct OsRng;

impl RandomProvider for OsRng {
    fn fill(&self, out: &mut [u8]) -> Result<(), CryptoError> {
        getrandom::getrandom(out).map_err(|_| CryptoError::RandomUnavailable)
    }
}

struct Keys {
    by_id: HashMap<u32, Secret<[u8; KEY_SIZE]>>,
    primary: Option<u32>,
}

/// Rotating set of XChaCha20-Poly1305 keys. New values are sealed with the
/// primary key; older keys stay available for opening.
pub struct KeyRing<R: RandomProvider = OsRng> {
    keys: RwLock<Keys>,
    rng: R,
}

impl KeyRing<OsRng> {
    pub fn with_os_rng() -> Self {
        Self::new(OsRng)
    }
}

impl<R: RandomProvider> KeyRing<R> {
    pub fn new(rng: R) -> Self {
        Self {
            keys: RwLock::new(Keys {
                by_id: HashMap::new(),
                primary: None,
            }),
            rng,
        }
    }

    /// Adds a key. The first key added becomes primary.
    pub fn add_key(&self, key_id: u32, key_bytes: &[u8]) -> Result<(), CryptoError> {
        if key_id == RESERVED_KEY_ID {
            return Err(CryptoError::InvalidKeyId(key_id));
        }
        if key_bytes.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: key_bytes.len(),
            });
        }

        let mut k = [0u8; KEY_SIZE];
        k.copy_from_slice(key_bytes);

        let mut keys = self.keys.write().map_err(|_| CryptoError::LockPoisoned)?;
        keys.by_id.insert(key_id, Secret::new(k));
        if keys.primary.is_none() {
            keys.primary = Some(key_id);
        }

        k.zeroize();
        Ok(())
    }

    pub fn set_primary(&self, key_id: u32) -> Result<(), CryptoError> {
        let mut keys = self.keys.write().map_err(|_| CryptoError::LockPoisoned)?;
        if !keys.by_id.contains_key(&key_id) {
            return Err(CryptoError::KeyNotFound(key_id));
        }
        keys.primary = Some(key_id);
        Ok(())
    }

    pub fn remove_key(&self, key_id: u32) -> Result<(), CryptoError> {
        let mut keys = self.keys.write().map_err(|_| CryptoError::LockPoisoned)?;
        if keys.primary == Some(key_id) {
            return Err(CryptoError::CannotRemovePrimaryKey(key_id));
        }
        keys.by_id.remove(&key_id);
        Ok(())
    }

    pub fn primary_key_id(&self) -> Result<Option<u32>, CryptoError> {
        let keys = self.keys.read().map_err(|_| CryptoError::LockPoisoned)?;
        Ok(keys.primary)
    }

    fn cipher(&self, key_id: u32) -> Result<XChaCha20Poly1305, CryptoError> {
        let keys = self.keys.read().map_err(|_| CryptoError::LockPoisoned)?;
        let secret = keys
            .by_id
            .get(&key_id)
            .ok_or(CryptoError::DecryptionFailed(OpenFailure::KeyNotFound { key_id }))?;
        Ok(XChaCha20Poly1305::new(Key::from_slice(secret.expose_secret())))
    }
}

impl<R: RandomProvider> CryptoProvider for KeyRing<R> {
    fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if aad.is_empty() {
            return Err(CryptoError::AadRequired);
        }

        let key_id = self
            .primary_key_id()?
            .ok_or(CryptoError::NoKeysAvailable)?;
        let cipher = self.cipher(key_id).map_err(|_| CryptoError::NoKeysAvailable)?;

        let mut nonce = [0u8; NONCE_SIZE];
        self.rng.fill(&mut nonce)?;

        let mut out = Vec::with_capacity(HEADER_SIZE + plaintext.len() + TAG_SIZE);
        out.extend_from_slice(&SEAL_MAGIC);
        out.extend_from_slice(&CURRENT_VERSION.to_le_bytes());
        out.push(ALG_XCHACHA20_POLY1305);
        out.extend_from_slice(&key_id.to_le_bytes());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(plaintext);

        let tag = cipher
            .encrypt_in_place_detached(XNonce::from_slice(&nonce), aad, &mut out[HEADER_SIZE..])
            .map_err(|_| CryptoError::EncryptionFailed)?;
        out.extend_from_slice(&tag);

        Ok(out)
    }

    fn decrypt(&self, sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if aad.is_empty() {
            return Err(CryptoError::AadRequired);
        }
        if sealed.len() < HEADER_SIZE + TAG_SIZE || sealed[0..8] != SEAL_MAGIC {
            return Err(CryptoError::DecryptionFailed(OpenFailure::MalformedEnvelope));
        }

        let version = u32::from_le_bytes([sealed[8], sealed[9], sealed[10], sealed[11]]);
        if version != CURRENT_VERSION {
            return Err(CryptoError::DecryptionFailed(
                OpenFailure::UnsupportedVersion { version },
            ));
        }

        let alg = sealed[12];
        if alg != ALG_XCHACHA20_POLY1305 {
            return Err(CryptoError::DecryptionFailed(
                OpenFailure::UnsupportedAlgorithm { alg },
            ));
        }

        let key_id = u32::from_le_bytes([sealed[13], sealed[14], sealed[15], sealed[16]]);
        let nonce = &sealed[17..HEADER_SIZE];
        let body = &sealed[HEADER_SIZE..];
        let (ciphertext, tag) = body.split_at(body.len() - TAG_SIZE);

        let cipher = self.cipher(key_id)?;
        let mut buffer = ciphertext.to_vec();
        if cipher
            .decrypt_in_place_detached(
                XNonce::from_slice(nonce),
                aad,
                &mut buffer,
                Tag::from_slice(tag),
            )
            .is_err()
        {
            buffer.zeroize();
            return Err(CryptoError::DecryptionFailed(
                OpenFailure::AuthenticationFailed,
            ));
        }

        Ok(buffer)
    }
}

/// Associated data binding a sealed value to its storage slot and device.
pub fn build_aad(
    app_ns: &str,
    store_key: &str,
    schema_version: u32,
    tablet_id: Option<&str>,
) -> Result<Vec<u8>, CryptoError> {
    validate_aad_field("app_ns", app_ns)?;
    validate_aad_field("store_key", store_key)?;
    if let Some(t) = tablet_id {
        validate_aad_field("tablet_id", t)?;
    }

    let mut aad = Vec::with_capacity(16 + app_ns.len() + store_key.len());
    aad.extend_from_slice(&(app_ns.len() as u16).to_le_bytes());
    aad.extend_from_slice(app_ns.as_bytes());
    aad.extend_from_slice(&(store_key.len() as u16).to_le_bytes());
    aad.extend_from_slice(store_key.as_bytes());
    aad.extend_from_slice(&schema_version.to_le_bytes());

    match tablet_id {
        None => aad.push(0),
        Some(t) => {
            aad.push(1);
            aad.extend_from_slice(&(t.len() as u16).to_le_bytes());
            aad.extend_from_slice(t.as_bytes());
        }
    }

    Ok(aad)
}

fn validate_aad_field(name: &'static str, value: &str) -> Result<(), CryptoError> {
    if value.len() > MAX_AAD_FIELD {
        return Err(CryptoError::AadFieldTooLarge {
            field: name,
            size: value.len(),
            max: MAX_AAD_FIELD,
        });
    }
    Ok(())
}
