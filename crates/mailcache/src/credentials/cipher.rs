//! At-rest encryption for token blobs
//!
//! AES-256-GCM with a random key kept in a file next to the database.
//! Sealed values are base64 of `nonce || ciphertext`.

use std::path::Path;

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit, OsRng},
};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use thiserror::Error;

/// Nonce size for AES-GCM (96 bits / 12 bytes)
const NONCE_SIZE: usize = 12;

const KEY_SIZE: usize = 32;

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("key file error: {0}")]
    KeyFile(String),

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("invalid sealed data: {0}")]
    InvalidFormat(String),
}

/// Seals and opens credential blobs
pub struct TokenCipher {
    cipher: Aes256Gcm,
}

impl TokenCipher {
    pub fn from_bytes(key: [u8; KEY_SIZE]) -> Self {
        Self {
            cipher: Aes256Gcm::new(&key.into()),
        }
    }

    /// Read the key file, generating it on first use
    pub fn load_or_create(path: &Path) -> Result<Self, CipherError> {
        if path.exists() {
            let encoded = std::fs::read_to_string(path)
                .map_err(|e| CipherError::KeyFile(format!("{}: {}", path.display(), e)))?;
            let bytes = BASE64
                .decode(encoded.trim())
                .map_err(|e| CipherError::KeyFile(format!("{}: {}", path.display(), e)))?;
            let key: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| {
                CipherError::KeyFile(format!("{}: expected a {}-byte key", path.display(), KEY_SIZE))
            })?;
            return Ok(Self::from_bytes(key));
        }

        let key = Aes256Gcm::generate_key(OsRng);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CipherError::KeyFile(format!("{}: {}", parent.display(), e)))?;
        }
        std::fs::write(path, BASE64.encode(key))
            .map_err(|e| CipherError::KeyFile(format!("{}: {}", path.display(), e)))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .map_err(|e| CipherError::KeyFile(format!("{}: {}", path.display(), e)))?;
        }

        log::info!("[AUTH] Created credential key at {}", path.display());
        Ok(Self { cipher: Aes256Gcm::new(&key) })
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<String, CipherError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        use aes_gcm::aead::rand_core::RngCore;
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| CipherError::Encryption(e.to_string()))?;

        let mut combined = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(&combined))
    }

    pub fn open(&self, sealed: &str) -> Result<Vec<u8>, CipherError> {
        let combined = BASE64
            .decode(sealed.trim())
            .map_err(|e| CipherError::InvalidFormat(e.to_string()))?;
        if combined.len() <= NONCE_SIZE {
            return Err(CipherError::InvalidFormat("data too short".to_string()));
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| CipherError::Decryption(e.to_string()))
    }
}
