use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};
use base64::Engine;

/// AES-256-GCM encryption service for endpoint API keys at rest.
///
/// Keys are encrypted when a job is created and decrypted only at
/// dispatch time; the job payload never stores plaintext credentials.
pub struct EncryptionService {
    cipher: Aes256Gcm,
}

impl EncryptionService {
    /// Create from a base64-encoded 32-byte key.
    pub fn new(key_base64: &str) -> Result<Self, EncryptionError> {
        let key_bytes = base64::engine::general_purpose::STANDARD
            .decode(key_base64)
            .map_err(|_| EncryptionError::InvalidKey)?;

        if key_bytes.len() != 32 {
            return Err(EncryptionError::InvalidKey);
        }

        let cipher = Aes256Gcm::new_from_slice(&key_bytes)
            .map_err(|_| EncryptionError::InvalidKey)?;

        Ok(Self { cipher })
    }

    /// Encrypt data, returning nonce (12 bytes) prepended to ciphertext.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| EncryptionError::EncryptFailed)?;

        let mut output = nonce.to_vec();
        output.extend(ciphertext);
        Ok(output)
    }

    /// Decrypt data where the first 12 bytes are the nonce.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        if data.len() < 12 {
            return Err(EncryptionError::DecryptFailed);
        }

        let (nonce_bytes, ciphertext) = data.split_at(12);
        let nonce = Nonce::from_slice(nonce_bytes);

        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| EncryptionError::DecryptFailed)
    }

    /// Encrypt a secret string into base64 for storage in a jsonb payload.
    pub fn encrypt_string(&self, secret: &str) -> Result<String, EncryptionError> {
        let sealed = self.encrypt(secret.as_bytes())?;
        Ok(base64::engine::general_purpose::STANDARD.encode(sealed))
    }

    /// Decrypt a base64 payload produced by [`encrypt_string`].
    ///
    /// [`encrypt_string`]: EncryptionService::encrypt_string
    pub fn decrypt_string(&self, sealed_base64: &str) -> Result<String, EncryptionError> {
        let sealed = base64::engine::general_purpose::STANDARD
            .decode(sealed_base64)
            .map_err(|_| EncryptionError::DecryptFailed)?;
        let plaintext = self.decrypt(&sealed)?;
        String::from_utf8(plaintext).map_err(|_| EncryptionError::DecryptFailed)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EncryptionError {
    #[error("Invalid encryption key (must be 32 bytes, base64-encoded)")]
    InvalidKey,

    #[error("Encryption failed")]
    EncryptFailed,

    #[error("Decryption failed")]
    DecryptFailed,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> EncryptionService {
        let key = base64::engine::general_purpose::STANDARD.encode([7u8; 32]);
        EncryptionService::new(&key).unwrap()
    }

    #[test]
    fn test_string_round_trip() {
        let svc = service();
        let sealed = svc.encrypt_string("sk-secret-key").unwrap();
        assert_ne!(sealed, "sk-secret-key");
        assert_eq!(svc.decrypt_string(&sealed).unwrap(), "sk-secret-key");
    }

    #[test]
    fn test_rejects_short_key() {
        let key = base64::engine::general_purpose::STANDARD.encode([7u8; 16]);
        assert!(EncryptionService::new(&key).is_err());
    }

    #[test]
    fn test_rejects_tampered_ciphertext() {
        let svc = service();
        let mut sealed = base64::engine::general_purpose::STANDARD
            .decode(svc.encrypt_string("secret").unwrap())
            .unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;
        let tampered = base64::engine::general_purpose::STANDARD.encode(sealed);
        assert!(svc.decrypt_string(&tampered).is_err());
    }
}
