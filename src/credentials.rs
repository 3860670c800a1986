//! Credential channel for provider secrets.
//!
//! Provider credential bundles are stored encrypted at rest and decrypted by
//! the registry at load time. The wire format is hex(`nonce || ciphertext`)
//! with a random 96-bit nonce per encryption.

use aes_gcm::aead::{Aead, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, KeyInit, Nonce};

const NONCE_LEN: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("credential ciphertext is not valid hex")]
    Encoding,
    #[error("credential ciphertext is truncated")]
    Truncated,
    #[error("credential decryption failed")]
    Decrypt,
    #[error("credential encryption failed")]
    Encrypt,
}

/// AES-256-GCM cipher shared by the registry and the bootstrap seeding path.
#[derive(Clone)]
pub struct CredentialCipher {
    cipher: Aes256Gcm,
}

impl CredentialCipher {
    pub fn new(key: [u8; 32]) -> Self {
        CredentialCipher {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key)),
        }
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, CredentialError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| CredentialError::Encrypt)?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(hex::encode(out))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<Vec<u8>, CredentialError> {
        let raw = hex::decode(encoded.trim()).map_err(|_| CredentialError::Encoding)?;
        if raw.len() <= NONCE_LEN {
            return Err(CredentialError::Truncated);
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CredentialError::Decrypt)
    }
}
