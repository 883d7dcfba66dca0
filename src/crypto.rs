//! Credential decryption for stored IMAP passwords.
//!
//! Uses AES-256-GCM with the key supplied out of band. Ciphertexts are
//! base64-encoded `nonce || ciphertext` envelopes. Decrypted passwords are
//! wrapped in [`SecretString`] and never logged.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use secrecy::SecretString;

use crate::error::CryptoError;

/// Nonce size for AES-GCM (96 bits / 12 bytes).
const NONCE_SIZE: usize = 12;

/// Decrypts (and encrypts, for provisioning) mailbox credentials.
pub trait CredentialCipher: Send + Sync {
    /// Decrypt a stored ciphertext into the plaintext password.
    ///
    /// Errors are terminal for the mailbox.
    fn decrypt(&self, ciphertext: &str) -> Result<SecretString, CryptoError>;

    /// Encrypt a plaintext password for storage.
    fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError>;
}

/// AES-256-GCM credential cipher.
pub struct AesGcmCipher {
    cipher: Aes256Gcm,
}

impl AesGcmCipher {
    /// Create a cipher from a raw 32-byte key.
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(key.into()),
        }
    }

    /// Create a cipher from a base64-encoded 32-byte key.
    pub fn from_base64_key(encoded: &str) -> Result<Self, CryptoError> {
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|e| CryptoError::InvalidKey(format!("key is not valid base64: {e}")))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("key must be exactly 32 bytes".into()))?;
        Ok(Self::new(&key))
    }
}

impl CredentialCipher for AesGcmCipher {
    fn decrypt(&self, ciphertext: &str) -> Result<SecretString, CryptoError> {
        let data = BASE64
            .decode(ciphertext.trim())
            .map_err(|e| CryptoError::InvalidFormat(format!("not valid base64: {e}")))?;

        if data.len() <= NONCE_SIZE {
            return Err(CryptoError::InvalidFormat(
                "ciphertext shorter than nonce".into(),
            ));
        }

        let (nonce, encrypted) = data.split_at(NONCE_SIZE);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), encrypted)
            .map_err(|_| CryptoError::Decrypt("AES-GCM authentication failed".into()))?;

        let plaintext = String::from_utf8(plaintext)
            .map_err(|_| CryptoError::Decrypt("plaintext is not valid UTF-8".into()))?;

        Ok(SecretString::from(plaintext))
    }

    fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        if plaintext.is_empty() {
            return Err(CryptoError::Encrypt("plaintext is empty".into()));
        }

        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let encrypted = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| CryptoError::Encrypt(e.to_string()))?;

        let mut envelope = Vec::with_capacity(NONCE_SIZE + encrypted.len());
        envelope.extend_from_slice(&nonce);
        envelope.extend_from_slice(&encrypted);
        Ok(BASE64.encode(envelope))
    }
}
