//! Field-level envelope encryption for sensitive columns.
//!
//! Ciphertexts are stored as `"<nonce_b64>:<ciphertext_b64>"`: a fresh 96-bit
//! nonce per value and AES-GCM with empty associated data. A stored value
//! without `:` predates encryption and is returned as-is.

use std::sync::atomic::{AtomicU64, Ordering};

use aes_gcm::aead::consts::U12;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes192;
use aes_gcm::{Aes128Gcm, Aes256Gcm, AesGcm, Nonce};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{NaiveDate, Utc};
use rand::RngCore;
use rand::rngs::OsRng;

const NONCE_LEN: usize = 12;
const SEPARATOR: char = ':';

type Aes192Gcm = AesGcm<Aes192, U12>;

#[derive(Debug, thiserror::Error)]
pub enum CryptoConfigError {
    #[error("ENCRYPTION_KEY is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("ENCRYPTION_KEY must be 16, 24 or 32 bytes, got {0}")]
    KeyLength(usize),
}

#[derive(Debug, thiserror::Error)]
enum DecryptError {
    #[error("malformed envelope")]
    Envelope,
    #[error("invalid base64: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("authentication failed")]
    Auth,
    #[error("plaintext is not utf-8")]
    Utf8,
}

enum Cipher {
    Aes128(Box<Aes128Gcm>),
    Aes192(Box<Aes192Gcm>),
    Aes256(Box<Aes256Gcm>),
}

impl Cipher {
    fn new(key: &[u8]) -> Result<Self, CryptoConfigError> {
        // new_from_slice only fails on length, which is matched first
        let cipher = match key.len() {
            16 => Aes128Gcm::new_from_slice(key).map(|c| Cipher::Aes128(Box::new(c))),
            24 => Aes192Gcm::new_from_slice(key).map(|c| Cipher::Aes192(Box::new(c))),
            32 => Aes256Gcm::new_from_slice(key).map(|c| Cipher::Aes256(Box::new(c))),
            other => return Err(CryptoConfigError::KeyLength(other)),
        };
        cipher.map_err(|_| CryptoConfigError::KeyLength(key.len()))
    }

    fn encrypt(&self, nonce: &[u8; NONCE_LEN], plaintext: &[u8]) -> Option<Vec<u8>> {
        let nonce = Nonce::<U12>::from_slice(nonce);
        match self {
            Cipher::Aes128(c) => c.encrypt(nonce, plaintext).ok(),
            Cipher::Aes192(c) => c.encrypt(nonce, plaintext).ok(),
            Cipher::Aes256(c) => c.encrypt(nonce, plaintext).ok(),
        }
    }

    fn decrypt(&self, nonce: &[u8], ciphertext: &[u8]) -> Option<Vec<u8>> {
        let nonce = Nonce::<U12>::from_slice(nonce);
        match self {
            Cipher::Aes128(c) => c.decrypt(nonce, ciphertext).ok(),
            Cipher::Aes192(c) => c.decrypt(nonce, ciphertext).ok(),
            Cipher::Aes256(c) => c.decrypt(nonce, ciphertext).ok(),
        }
    }
}

/// Immutable after construction; share it behind an `Arc`.
pub struct Vault {
    cipher: Cipher,
    legacy_reads: AtomicU64,
    legacy_cutoff: Option<NaiveDate>,
}

impl Vault {
    /// Builds the vault from the base64 `ENCRYPTION_KEY`. When no key is
    /// configured a fresh 256-bit key is generated and written to the log once
    /// so the operator can persist it.
    pub fn from_config(
        key_b64: Option<&str>,
        legacy_cutoff: Option<NaiveDate>,
    ) -> Result<Self, CryptoConfigError> {
        let key = match key_b64 {
            Some(encoded) => BASE64.decode(encoded.trim())?,
            None => {
                let mut key = vec![0u8; 32];
                OsRng.fill_bytes(&mut key);
                tracing::warn!(
                    generated_key = %BASE64.encode(&key),
                    "ENCRYPTION_KEY not configured, generated a new key; persist it and redeploy"
                );
                key
            }
        };

        Ok(Self {
            cipher: Cipher::new(&key)?,
            legacy_reads: AtomicU64::new(0),
            legacy_cutoff,
        })
    }

    pub fn from_key(key: &[u8]) -> Result<Self, CryptoConfigError> {
        Ok(Self {
            cipher: Cipher::new(key)?,
            legacy_reads: AtomicU64::new(0),
            legacy_cutoff: None,
        })
    }

    pub fn encrypt(&self, plaintext: &str) -> String {
        if plaintext.is_empty() {
            return String::new();
        }

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        match self.cipher.encrypt(&nonce, plaintext.as_bytes()) {
            Some(ciphertext) => format!(
                "{}{SEPARATOR}{}",
                BASE64.encode(nonce),
                BASE64.encode(ciphertext)
            ),
            // AES-GCM only refuses inputs beyond 64 GiB
            None => {
                tracing::error!(len = plaintext.len(), "field encryption failed");
                String::new()
            }
        }
    }

    /// Never fails: legacy plaintext and undecryptable values come back unchanged.
    pub fn decrypt(&self, stored: &str) -> String {
        if !stored.contains(SEPARATOR) {
            if !stored.is_empty() {
                self.note_legacy_read();
            }
            return stored.to_string();
        }

        match self.try_decrypt(stored) {
            Ok(plaintext) => plaintext,
            Err(err) => {
                tracing::error!(error = %err, "failed to decrypt field, returning stored value");
                stored.to_string()
            }
        }
    }

    pub fn encrypt_list(&self, items: &[String]) -> String {
        match serde_json::to_string(items) {
            Ok(json) => self.encrypt(&json),
            Err(err) => {
                tracing::error!(error = %err, "failed to encode list for encryption");
                String::new()
            }
        }
    }

    pub fn decrypt_list(&self, stored: &str) -> Vec<String> {
        let plaintext = self.decrypt(stored);
        if plaintext.is_empty() {
            return Vec::new();
        }
        serde_json::from_str(&plaintext).unwrap_or_else(|_| vec![plaintext])
    }

    /// Number of legacy plaintext values served since startup.
    pub fn legacy_reads(&self) -> u64 {
        self.legacy_reads.load(Ordering::Relaxed)
    }

    fn note_legacy_read(&self) {
        let total = self.legacy_reads.fetch_add(1, Ordering::Relaxed) + 1;
        match self.legacy_cutoff {
            Some(cutoff) if Utc::now().date_naive() > cutoff => {
                tracing::error!(total, %cutoff, "legacy plaintext field read after migration cutoff");
            }
            _ => tracing::warn!(total, "legacy plaintext field read"),
        }
    }

    fn try_decrypt(&self, stored: &str) -> Result<String, DecryptError> {
        let (nonce_b64, ciphertext_b64) = stored
            .split_once(SEPARATOR)
            .ok_or(DecryptError::Envelope)?;
        let nonce = BASE64.decode(nonce_b64)?;
        if nonce.len() != NONCE_LEN {
            return Err(DecryptError::Envelope);
        }
        let ciphertext = BASE64.decode(ciphertext_b64)?;
        let plaintext = self
            .cipher
            .decrypt(&nonce, &ciphertext)
            .ok_or(DecryptError::Auth)?;
        String::from_utf8(plaintext).map_err(|_| DecryptError::Utf8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vault() -> Vault {
        Vault::from_key(&[7u8; 32]).unwrap()
    }

    #[test]
    fn round_trips_unicode() {
        let vault = vault();
        let stored = vault.encrypt("пенициллин");
        assert!(stored.contains(':'));
        assert!(!stored.contains("пенициллин"));
        assert_eq!(vault.decrypt(&stored), "пенициллин");
    }

    #[test]
    fn fresh_nonce_per_encryption() {
        let vault = vault();
        assert_ne!(vault.encrypt("орехи"), vault.encrypt("орехи"));
    }

    #[test]
    fn empty_input_stays_empty() {
        let vault = vault();
        assert_eq!(vault.encrypt(""), "");
        assert_eq!(vault.decrypt(""), "");
        assert!(vault.decrypt_list("").is_empty());
    }

    #[test]
    fn legacy_plaintext_is_returned_and_counted() {
        let vault = vault();
        assert_eq!(vault.decrypt("plain value"), "plain value");
        assert_eq!(vault.legacy_reads(), 1);
    }

    #[test]
    fn corrupted_ciphertext_is_returned_unchanged() {
        let vault = vault();
        let stored = vault.encrypt("secret");
        let (nonce, _) = stored.split_once(':').unwrap();
        let tampered = format!("{nonce}:{}", BASE64.encode(b"not the ciphertext at all"));
        assert_eq!(vault.decrypt(&tampered), tampered);
        assert_eq!(vault.decrypt("abc:%%%"), "abc:%%%");
    }

    #[test]
    fn other_key_cannot_read() {
        let stored = vault().encrypt("secret");
        let other = Vault::from_key(&[9u8; 32]).unwrap();
        assert_eq!(other.decrypt(&stored), stored);
    }

    #[test]
    fn lists_round_trip() {
        let vault = vault();
        let items = vec!["пенициллин".to_string(), "орехи".to_string()];
        let stored = vault.encrypt_list(&items);
        assert!(!stored.contains("орехи"));
        assert_eq!(vault.decrypt_list(&stored), items);
    }

    #[test]
    fn legacy_scalar_decrypts_to_single_item_list() {
        assert_eq!(vault().decrypt_list("пыльца"), vec!["пыльца".to_string()]);
    }

    #[test]
    fn supports_all_aes_key_sizes() {
        for len in [16, 24, 32] {
            let vault = Vault::from_key(&vec![1u8; len]).unwrap();
            assert_eq!(vault.decrypt(&vault.encrypt("x")), "x");
        }
    }

    #[test]
    fn rejects_bad_key_length() {
        assert!(matches!(
            Vault::from_key(&[0u8; 20]),
            Err(CryptoConfigError::KeyLength(20))
        ));
        let short = BASE64.encode([0u8; 8]);
        assert!(Vault::from_config(Some(&short), None).is_err());
    }

    #[test]
    fn generates_key_when_absent() {
        let vault = Vault::from_config(None, None).unwrap();
        assert_eq!(vault.decrypt(&vault.encrypt("x")), "x");
    }
}
