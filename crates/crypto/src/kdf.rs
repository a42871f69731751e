//! PBKDF2-HMAC-SHA256 key derivation.
//!
//! Two derivations are used:
//! - the cache/snapshot master key from the `MEM_ENCRYPTION_KEY`
//!   passphrase with a fixed salt, and
//! - per-user vault keys binding the vault master key to the user's
//!   `email` and `username`, so one user's entries cannot be decrypted
//!   with another user's identity material.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::MasterKey;

type HmacSha256 = Hmac<Sha256>;

/// Fixed salt for passphrase-derived process keys.
pub const DEFAULT_SALT: &[u8] = b"doorman_cache_salt";

/// PBKDF2 iteration count.
pub const ITERATIONS: u32 = 100_000;

/// PBKDF2-HMAC-SHA256 producing exactly one 32-byte block.
///
/// A single SHA-256 block covers the full AES-256 key, so the outer
/// block loop of the general algorithm collapses to one iteration chain.
fn pbkdf2_block(password: &[u8], salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(password).expect("HMAC accepts any key length");
    mac.update(salt);
    mac.update(&1u32.to_be_bytes());
    let mut u: [u8; 32] = mac.finalize().into_bytes().into();

    let mut out = u;
    for _ in 1..iterations {
        let mut mac = HmacSha256::new_from_slice(password).expect("HMAC accepts any key length");
        mac.update(&u);
        u = mac.finalize().into_bytes().into();
        for (o, b) in out.iter_mut().zip(u.iter()) {
            *o ^= b;
        }
    }
    out
}

/// Derive a [`MasterKey`] from a passphrase and salt.
#[must_use]
pub fn derive_key(passphrase: &str, salt: &[u8]) -> MasterKey {
    MasterKey::from_raw(pbkdf2_block(passphrase.as_bytes(), salt, ITERATIONS))
}

/// Derive the per-user vault key: `KDF(vault_master_key, email : username)`.
///
/// The email is lowercased before hashing so the derivation is stable
/// across case variations of the stored address.
#[must_use]
pub fn derive_vault_key(vault_master_key: &str, email: &str, username: &str) -> MasterKey {
    let salt = format!("{}:{}", email.to_lowercase(), username);
    derive_key(vault_master_key, salt.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ExposeSecret;

    #[test]
    fn derivation_is_deterministic() {
        let a = derive_key("passphrase", DEFAULT_SALT);
        let b = derive_key("passphrase", DEFAULT_SALT);
        assert_eq!(
            crate::encrypt_value("x", &a).is_ok(),
            crate::encrypt_value("x", &b).is_ok()
        );
        // Same key decrypts what the other encrypted.
        let enc = crate::encrypt_value("x", &a).unwrap();
        assert_eq!(
            crate::decrypt_value(&enc, &b).unwrap().expose_secret(),
            "x"
        );
    }

    #[test]
    fn vault_key_binds_identity() {
        let k1 = derive_vault_key("master", "alice@example.com", "alice");
        let k2 = derive_vault_key("master", "bob@example.com", "bob");
        let enc = crate::encrypt_value("vault-secret", &k1).unwrap();
        assert!(crate::decrypt_value(&enc, &k2).is_err());
        assert_eq!(
            crate::decrypt_value(&enc, &k1).unwrap().expose_secret(),
            "vault-secret"
        );
    }

    #[test]
    fn vault_key_email_compare_is_lowercased() {
        let k1 = derive_vault_key("master", "Alice@Example.COM", "alice");
        let k2 = derive_vault_key("master", "alice@example.com", "alice");
        let enc = crate::encrypt_value("v", &k1).unwrap();
        assert_eq!(crate::decrypt_value(&enc, &k2).unwrap().expose_secret(), "v");
    }
}
