//! AES-256-GCM encryption utilities for Doorman secrets.
//!
//! Text values are stored as `ENC[AES256-GCM,data:<b64>,iv:<b64>,tag:<b64>]`
//! envelopes; snapshot files use a raw `nonce || ciphertext || tag` blob.
//! Decrypted values come back as [`SecretString`] to prevent accidental
//! logging, and the [`MasterKey`] wrapper zeroizes key material on drop.
//! Keys derive from operator passphrases via PBKDF2-HMAC-SHA256 (see
//! [`kdf`]); vault keys additionally bind per-user identity material.

use std::fmt;

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub mod kdf;

// Re-export for consumers so they don't need a direct `secrecy` dependency.
pub use secrecy::{ExposeSecret, Secret, SecretString};

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// A 32-byte AES-256 master key that is zeroized when dropped.
///
/// The [`Debug`] implementation is redacted to avoid accidental logging.
/// Raw bytes are not accessible outside this crate; all cryptographic
/// operations go through the functions in this module.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey([u8; 32]);

impl MasterKey {
    pub(crate) fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub(crate) fn from_raw(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey([REDACTED])")
    }
}

/// Errors that can occur during encryption/decryption operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Key material decoded, but to the wrong number of bytes.
    #[error("invalid master key: decoded {got} bytes, need 32")]
    KeyLength { got: usize },

    /// Key material could not be interpreted at all.
    #[error("invalid master key: {0}")]
    KeyFormat(String),

    /// The encrypted value is a recognizable envelope with bad contents.
    #[error("invalid encrypted value: {0}")]
    InvalidFormat(String),

    /// Decryption failed — wrong key or corrupted data.
    #[error("decryption failed (wrong key or corrupted data)")]
    DecryptionFailed,

    /// Encryption failed.
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),
}

/// The parsed parts of an `ENC[AES256-GCM,...]` envelope.
///
/// Parsing is strict about shape (prefix, algorithm, the three named
/// base64 fields) but deliberately total: anything that does not parse is
/// treated as a plain value and passed through, so data written before
/// encryption was enabled keeps working.
struct EncEnvelope {
    data: Vec<u8>,
    iv: Vec<u8>,
    tag: Vec<u8>,
}

impl EncEnvelope {
    const PREFIX: &'static str = "ENC[";
    const ALGORITHM: &'static str = "AES256-GCM";

    /// Parse an envelope. `None` means "not an envelope".
    fn parse(raw: &str) -> Option<Self> {
        let inner = raw.strip_prefix(Self::PREFIX)?.strip_suffix(']')?;
        let mut fields = inner.split(',');
        if fields.next()? != Self::ALGORITHM {
            return None;
        }

        let mut data = None;
        let mut iv = None;
        let mut tag = None;
        for field in fields {
            let (name, value) = field.split_once(':')?;
            let decoded = B64.decode(value).ok()?;
            match name {
                "data" if data.is_none() => data = Some(decoded),
                "iv" if iv.is_none() => iv = Some(decoded),
                "tag" if tag.is_none() => tag = Some(decoded),
                _ => return None,
            }
        }
        Some(Self {
            data: data?,
            iv: iv?,
            tag: tag?,
        })
    }

    /// Check the fixed-size fields after a successful parse.
    fn validate(&self) -> Result<(), CryptoError> {
        if self.iv.len() != NONCE_LEN {
            return Err(CryptoError::InvalidFormat(format!(
                "IV must be {NONCE_LEN} bytes, got {}",
                self.iv.len()
            )));
        }
        if self.tag.len() != TAG_LEN {
            return Err(CryptoError::InvalidFormat(format!(
                "tag must be {TAG_LEN} bytes, got {}",
                self.tag.len()
            )));
        }
        Ok(())
    }

    fn render(data: &[u8], iv: &[u8], tag: &[u8]) -> String {
        format!(
            "{}{},data:{},iv:{},tag:{}]",
            Self::PREFIX,
            Self::ALGORITHM,
            B64.encode(data),
            B64.encode(iv),
            B64.encode(tag),
        )
    }
}

/// Parse a 32-byte master key from hex or base64.
///
/// Accepts 64 hex characters or a base64 string decoding to exactly 32
/// bytes. Anything else is treated as a free-form passphrase and
/// stretched through [`kdf::derive_key`]. Base64 input of the wrong
/// length is reported as [`CryptoError::KeyLength`] rather than silently
/// re-interpreted, since that is almost always a truncated key.
pub fn parse_master_key(raw: &str) -> Result<MasterKey, CryptoError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(CryptoError::KeyFormat("key must not be empty".to_owned()));
    }

    if trimmed.len() == 64 && trimmed.bytes().all(|b| b.is_ascii_hexdigit()) {
        let bytes = hex::decode(trimmed)
            .map_err(|e| CryptoError::KeyFormat(format!("invalid hex: {e}")))?;
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        return Ok(MasterKey(key));
    }

    if let Ok(bytes) = B64.decode(trimmed) {
        if bytes.len() == 32 {
            let mut key = [0u8; 32];
            key.copy_from_slice(&bytes);
            return Ok(MasterKey(key));
        }
        // Base64 that decodes to 24 or 48 bytes is a mis-sized key, not a
        // passphrase containing spaces or punctuation.
        if trimmed.len() >= 40 && !trimmed.contains(char::is_whitespace) {
            return Err(CryptoError::KeyLength { got: bytes.len() });
        }
    }

    // Free-form passphrase: stretch it.
    Ok(kdf::derive_key(trimmed, kdf::DEFAULT_SALT))
}

/// Returns `true` if `value` parses as an `ENC[AES256-GCM,...]` envelope.
#[must_use]
pub fn is_encrypted(value: &str) -> bool {
    EncEnvelope::parse(value.trim()).is_some()
}

fn cipher_for(master_key: &MasterKey) -> Result<Aes256Gcm, CryptoError> {
    Aes256Gcm::new_from_slice(master_key.as_bytes())
        .map_err(|e| CryptoError::KeyFormat(format!("invalid AES key: {e}")))
}

/// If `value` is an `ENC[AES256-GCM,...]` envelope, decrypt it using the
/// master key. Otherwise return the value unchanged (pass-through for
/// data written before encryption was enabled).
pub fn decrypt_value(value: &str, master_key: &MasterKey) -> Result<SecretString, CryptoError> {
    let Some(envelope) = EncEnvelope::parse(value.trim()) else {
        return Ok(SecretString::new(value.to_owned()));
    };
    envelope.validate()?;

    // AES-GCM ciphertext = data || tag
    let mut ciphertext = envelope.data;
    ciphertext.extend_from_slice(&envelope.tag);

    let plaintext = cipher_for(master_key)?
        .decrypt(Nonce::from_slice(&envelope.iv), ciphertext.as_ref())
        .map_err(|_| CryptoError::DecryptionFailed)?;

    let s = String::from_utf8(plaintext)
        .map_err(|e| CryptoError::InvalidFormat(format!("decrypted value is not UTF-8: {e}")))?;

    Ok(SecretString::new(s))
}

/// Encrypt a plaintext string, producing an `ENC[AES256-GCM,...]` marker.
///
/// The returned string is the envelope itself (safe to store).
pub fn encrypt_value(plaintext: &str, master_key: &MasterKey) -> Result<String, CryptoError> {
    use aes_gcm::AeadCore;

    let cipher = cipher_for(master_key)?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext.as_bytes())
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    // AES-GCM output = ciphertext_data || 16-byte tag
    let (data, tag) = ciphertext.split_at(ciphertext.len() - TAG_LEN);
    Ok(EncEnvelope::render(data, nonce.as_slice(), tag))
}

/// Encrypt an arbitrary byte blob, returning raw `nonce || ciphertext || tag`.
///
/// Used for snapshot files where the envelope text format would be
/// wasteful. The nonce is random per call.
pub fn encrypt_blob(plaintext: &[u8], master_key: &MasterKey) -> Result<Vec<u8>, CryptoError> {
    use aes_gcm::AeadCore;

    let cipher = cipher_for(master_key)?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(nonce.as_slice());
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a blob produced by [`encrypt_blob`].
pub fn decrypt_blob(blob: &[u8], master_key: &MasterKey) -> Result<Vec<u8>, CryptoError> {
    if blob.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::InvalidFormat(
            "blob too short for nonce and tag".to_owned(),
        ));
    }
    let (iv, ciphertext) = blob.split_at(NONCE_LEN);
    cipher_for(master_key)?
        .decrypt(Nonce::from_slice(iv), ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// Encrypts and decrypts stored secrets (credit keys, vault values).
///
/// Wraps a [`MasterKey`]; plaintext (non-`ENC[...]`) values pass through
/// `decrypt_*` methods unchanged for backward compatibility with data
/// written before encryption was enabled.
pub struct SecretCipher {
    key: MasterKey,
}

impl SecretCipher {
    #[must_use]
    pub fn new(key: MasterKey) -> Self {
        Self { key }
    }

    /// Encrypt a plaintext string, returning an `ENC[...]` envelope.
    pub fn encrypt_str(&self, value: &str) -> Result<String, CryptoError> {
        encrypt_value(value, &self.key)
    }

    /// Decrypt a string that may be an `ENC[...]` envelope back to plaintext.
    pub fn decrypt_str(&self, value: &str) -> Result<String, CryptoError> {
        Ok(decrypt_value(value, &self.key)?.expose_secret().clone())
    }

    /// Encrypt a [`serde_json::Value`] serialized to a JSON string.
    pub fn encrypt_json(&self, value: &serde_json::Value) -> Result<String, CryptoError> {
        let plain = serde_json::to_string(value).map_err(|e| {
            CryptoError::EncryptionFailed(format!("JSON serialization failed: {e}"))
        })?;
        encrypt_value(&plain, &self.key)
    }

    /// Decrypt a string that may be an `ENC[...]` envelope into JSON.
    pub fn decrypt_json(&self, value: &str) -> Result<serde_json::Value, CryptoError> {
        let plain = decrypt_value(value, &self.key)?;
        serde_json::from_str(plain.expose_secret())
            .map_err(|e| CryptoError::InvalidFormat(format!("JSON parse failed: {e}")))
    }
}

impl fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretCipher([REDACTED])")
    }
}
