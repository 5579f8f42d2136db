//! At-rest encryption for provider keys and deterministic fingerprints.
//!
//! Key values are stored as AES-256-GCM ciphertext with the random 12-byte
//! nonce prefixed, base64-encoded. The cipher key is derived from the
//! configured `ENCRYPTION_KEY` with PBKDF2-SHA256.

use aes_gcm::{
    Aes256Gcm,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use base64::{Engine as _, engine::general_purpose};
use pbkdf2::pbkdf2_hmac;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use thiserror::Error;

const NONCE_LEN: usize = 12;
const PBKDF2_ROUNDS: u32 = 100_000;
const PBKDF2_SALT: &[u8] = b"keygate.key-at-rest.v1";

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
    #[error("malformed ciphertext: {0}")]
    Malformed(String),
}

/// Shared encryption service. Cheap to clone, safe to use concurrently.
#[derive(Clone)]
pub struct EncryptionService {
    cipher: Arc<Aes256Gcm>,
}

impl EncryptionService {
    /// Derive the data-at-rest key from the configured secret.
    pub fn new(secret: &str) -> Self {
        let mut key = [0u8; 32];
        pbkdf2_hmac::<Sha256>(secret.as_bytes(), PBKDF2_SALT, PBKDF2_ROUNDS, &mut key);
        Self {
            cipher: Arc::new(Aes256Gcm::new(&key.into())),
        }
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| CryptoError::Encrypt)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(general_purpose::STANDARD.encode(out))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String, CryptoError> {
        let raw = general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| CryptoError::Malformed(e.to_string()))?;
        if raw.len() < NONCE_LEN {
            return Err(CryptoError::Malformed("ciphertext too short".into()));
        }
        let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
        let nonce_bytes: [u8; NONCE_LEN] = nonce_bytes.try_into().unwrap();

        let plaintext = self
            .cipher
            .decrypt(&nonce_bytes.into(), ciphertext)
            .map_err(|_| CryptoError::Decrypt)?;
        String::from_utf8(plaintext).map_err(|e| CryptoError::Malformed(e.to_string()))
    }
}

/// Deterministic SHA-256 fingerprint used for dedup and log lookups.
pub fn hash_key(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Constant-time string comparison for credentials.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let svc = EncryptionService::new("test-secret");
        for plaintext in ["sk-AAA", "", "key with spaces and 日本語"] {
            let encrypted = svc.encrypt(plaintext).unwrap();
            assert_ne!(encrypted, plaintext);
            assert_eq!(svc.decrypt(&encrypted).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_nonce_randomised() {
        let svc = EncryptionService::new("test-secret");
        let a = svc.encrypt("sk-AAA").unwrap();
        let b = svc.encrypt("sk-AAA").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_decrypt_wrong_key_fails() {
        let enc = EncryptionService::new("secret-a").encrypt("sk-AAA").unwrap();
        assert!(EncryptionService::new("secret-b").decrypt(&enc).is_err());
    }

    #[test]
    fn test_decrypt_malformed() {
        let svc = EncryptionService::new("s");
        assert!(svc.decrypt("not base64 !!!").is_err());
        assert!(svc.decrypt("c2hvcnQ=").is_err());
    }

    #[test]
    fn test_hash_key_stable() {
        let h1 = hash_key("sk-AAA");
        let h2 = hash_key("sk-AAA");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
        assert_ne!(h1, hash_key("sk-BBB"));
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("proxy-123", "proxy-123"));
        assert!(!constant_time_eq("proxy-123", "proxy-124"));
        assert!(!constant_time_eq("proxy-123", "proxy-12"));
    }
}
